use anyhow::{Context, Result};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

use iam_collector_aws::AwsResource;

pub mod stacks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind { Collector, TrustedAccount }

impl StackKind {
    pub fn stack_name(self) -> &'static str {
        match self { StackKind::Collector => "IamCollectorStack", StackKind::TrustedAccount => "TrustedAccountStack" }
    }

    pub fn template_file(self) -> String {
        format!("{}.template.json", self.stack_name())
    }
}

fn aws() -> Result<PathBuf> {
    which::which("aws").context("aws cli not found in PATH")
}

pub fn write_template(tpl: &CfnTemplate, out: &Path, kind: StackKind) -> Result<PathBuf> {
    std::fs::create_dir_all(out).with_context(|| format!("create {}", out.display()))?;
    let path = out.join(kind.template_file());
    std::fs::write(&path, serde_json::to_string_pretty(&tpl.to_json()?)?)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

pub fn deploy_stack(stack_name: &str, template_file: &Path, region: Option<&str>) -> Result<()> {
    let mut cmd = Command::new(aws()?);
    cmd.arg("cloudformation").arg("deploy")
        .arg("--stack-name").arg(stack_name)
        .arg("--template-file").arg(template_file)
        .arg("--capabilities").arg("CAPABILITY_NAMED_IAM");
    if let Some(r) = region { cmd.arg("--region").arg(r); }
    info!(stack = stack_name, template = %template_file.display(), "deploying");
    let st = cmd.status().context("spawn aws cloudformation deploy")?;
    if !st.success() { anyhow::bail!("cloudformation deploy of {stack_name} failed") }
    Ok(())
}

pub fn delete_stack(stack_name: &str, region: Option<&str>) -> Result<()> {
    let mut cmd = Command::new(aws()?);
    cmd.arg("cloudformation").arg("delete-stack")
        .arg("--stack-name").arg(stack_name);
    if let Some(r) = region { cmd.arg("--region").arg(r); }
    info!(stack = stack_name, "deleting");
    let st = cmd.status().context("aws cloudformation delete-stack")?;
    if !st.success() { anyhow::bail!("cloudformation delete-stack of {stack_name} failed") }
    Ok(())
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CfnOutput {
    #[serde(rename="Value")] pub value: Json,
    #[serde(rename="Description", skip_serializing_if="Option::is_none")] pub description: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CfnTemplate {
    #[serde(rename="AWSTemplateFormatVersion")] pub version: Option<String>,
    #[serde(rename="Description")] pub description: Option<String>,
    #[serde(rename="Resources")] pub resources: BTreeMap<String, Json>,
    #[serde(rename="Outputs", default, skip_serializing_if="BTreeMap::is_empty")] pub outputs: BTreeMap<String, CfnOutput>,
}

impl CfnTemplate {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            version: Some("2010-09-09".to_string()),
            description: Some(description.into()),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, res: AwsResource) -> &mut Self {
        self.resources.insert(res.logical_id().to_string(), res.to_cfn_json());
        self
    }

    pub fn output(&mut self, name: &str, value: Json, description: &str) -> &mut Self {
        self.outputs.insert(name.to_string(), CfnOutput { value, description: Some(description.to_string()) });
        self
    }

    pub fn to_json(&self) -> Result<Json> {
        Ok(serde_json::to_value(self)?)
    }
}

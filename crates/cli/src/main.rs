use anyhow::{Result, Context};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value as Json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::fmt::format::FmtSpan;

use iam_collector_cfn::{self as cfn, stacks, StackKind};
use iam_collector_clients::LocalDirStore;
use iam_collector_core::{CollectorSettings, Parameters, RunStatus};
use iam_collector_policy::Policy;

#[derive(Parser, Debug)]
#[command(author, version, about="iam-collector: scheduled cross-account IAM inventory")]
struct Cli {
    /// Stack parameters (YAML)
    #[arg(short, long, default_value="collector.yaml", global = true)]
    file: PathBuf,

    /// Output directory for rendered templates
    #[arg(short, long, default_value="out", global = true)]
    out: PathBuf,

    /// Allow unencrypted buckets
    #[arg(long, default_value_t=false, global = true)]
    allow_unencrypted: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, ValueEnum)]
enum Stack { Collector, Trusted }

impl From<Stack> for StackKind {
    fn from(s: Stack) -> Self {
        match s { Stack::Collector => StackKind::Collector, Stack::Trusted => StackKind::TrustedAccount }
    }
}

#[derive(Subcommand, Debug)] enum Cmd {
    /// Render and check both templates
    Synth,
    Deploy {
        #[arg(long, value_enum)] stack: Stack,
        #[arg(long)] region: Option<String>,
        /// Audit role name for a trusted account with a role override
        #[arg(long)] role_name: Option<String>,
    },
    Destroy {
        #[arg(long, value_enum)] stack: Stack,
        #[arg(long)] region: Option<String>,
    },
    /// Print account to role ARN bindings
    Accounts,
    /// Run one collection from this machine
    Collect {
        /// Configuration parameter; defaults to the one the collector stack creates
        #[arg(long)] parameter_name: Option<String>,
        /// Write results under this directory instead of S3
        #[arg(long)] output_dir: Option<PathBuf>,
        #[arg(long)] max_concurrency: Option<usize>,
        #[arg(long)] max_attempts: Option<u32>,
        #[arg(long)] timeout_secs: Option<u64>,
    },
}

fn load_params(path: &Path) -> Result<Parameters> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Parameters::from_yaml_slice(&bytes).with_context(|| format!("load {}", path.display()))
}

/// Builds a stack template and runs it past the policy.
fn render(params: &Parameters, kind: StackKind, role_name: Option<&str>, allow_unencrypted: bool) -> Result<cfn::CfnTemplate> {
    let tpl = match kind {
        StackKind::Collector => stacks::collector_stack(params)?,
        StackKind::TrustedAccount => stacks::trusted_account_stack(params, role_name)?,
    };
    let mut audit_roles = params.role_names();
    if let Some(r) = role_name { audit_roles.push(r.to_string()); }
    let policy = Policy::new(allow_unencrypted, audit_roles);
    let json: Json = tpl.to_json()?;
    policy.check_template(&json).with_context(|| format!("{} failed policy", kind.stack_name()))?;
    Ok(tpl)
}

fn collect(
    parameter_name: String,
    output_dir: Option<PathBuf>,
    settings: CollectorSettings,
) -> Result<()> {
    let rt = tokio::runtime::Runtime::new().context("start tokio runtime")?;
    let summary = rt.block_on(async {
        let sdk = iam_collector_clients::load_sdk_config().await;
        let collector = match output_dir {
            Some(dir) => iam_collector_clients::collector_with_store(&sdk, parameter_name, settings, Arc::new(LocalDirStore::new(dir))),
            None => iam_collector_clients::collector(&sdk, parameter_name, settings),
        };
        collector.run().await
    })?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.status == RunStatus::Failed {
        anyhow::bail!("no account succeeded ({} attempted)", summary.attempted);
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().json().with_span_events(FmtSpan::CLOSE).init();
    let cli = Cli::parse();

    match cli.cmd {
      Cmd::Synth => {
          let params = load_params(&cli.file)?;
          for kind in [StackKind::Collector, StackKind::TrustedAccount] {
              let tpl = render(&params, kind, None, cli.allow_unencrypted)?;
              let path = cfn::write_template(&tpl, &cli.out, kind)?;
              info!(stack = kind.stack_name(), path = %path.display(), "template written");
          }
      },
      Cmd::Deploy { stack, region, role_name } => {
          let params = load_params(&cli.file)?;
          let kind = StackKind::from(stack);
          let tpl = render(&params, kind, role_name.as_deref(), cli.allow_unencrypted)?;
          let path = cfn::write_template(&tpl, &cli.out, kind)?;
          cfn::deploy_stack(kind.stack_name(), &path, region.as_deref())?;
      },
      Cmd::Destroy { stack, region } => {
          cfn::delete_stack(StackKind::from(stack).stack_name(), region.as_deref())?;
      },
      Cmd::Accounts => {
          let params = load_params(&cli.file)?;
          println!("{}", serde_json::to_string_pretty(&params.bindings())?);
      },
      Cmd::Collect { parameter_name, output_dir, max_concurrency, max_attempts, timeout_secs } => {
          let parameter_name = match parameter_name {
              Some(p) => p,
              None => load_params(&cli.file)?.parameter_name(),
          };
          let mut settings = CollectorSettings::from_env();
          if let Some(n) = max_concurrency { settings.max_concurrency = n; }
          if let Some(n) = max_attempts { settings.retry.max_attempts = n; }
          if let Some(s) = timeout_secs { settings.run_timeout = Duration::from_secs(s); }
          collect(parameter_name, output_dir, settings)?;
      },
    }
    Ok(())
}

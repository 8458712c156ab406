

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as Json;

static READ_ONLY_IAM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^iam:(List|Get)[A-Za-z]*$").expect("static regex"));

/// Synth-time checks over a rendered CloudFormation template.
pub struct Policy { pub allow_unencrypted: bool, pub audit_role_names: Vec<String> }

fn as_list(v: &Json) -> Vec<&Json> {
    match v {
        Json::Array(a) => a.iter().collect(),
        Json::Null => Vec::new(),
        other => vec![other],
    }
}

fn resources_of_type<'a>(tpl: &'a Json, type_name: &'a str) -> impl Iterator<Item = (&'a String, &'a Json)> + 'a {
    tpl.get("Resources")
        .and_then(Json::as_object)
        .into_iter()
        .flatten()
        .filter(move |(_, r)| r.get("Type").and_then(Json::as_str) == Some(type_name))
}

/// True when `action` covers sts:AssumeRole or one of its variants, wildcards included.
/// IAM action names are case-insensitive.
fn grants_assume_role(action: &str) -> bool {
    const ASSUME: &str = "sts:assumerole";
    let action = action.to_ascii_lowercase();
    match action.strip_suffix('*') {
        Some(prefix) => ASSUME.starts_with(prefix) || prefix.starts_with(ASSUME),
        None => action.starts_with(ASSUME),
    }
}

fn inline_statements(role: &Json) -> Vec<&Json> {
    as_list(&role["Properties"]["Policies"])
        .into_iter()
        .flat_map(|p| as_list(&p["PolicyDocument"]["Statement"]))
        .collect()
}

impl Policy {
    pub fn new(allow_unencrypted: bool, audit_role_names: Vec<String>) -> Self { Self { allow_unencrypted, audit_role_names } }

    pub fn check_template(&self, tpl: &Json) -> Result<()> {
        self.check_buckets(tpl)?;
        self.check_audit_roles(tpl)?;
        self.check_assume_role_scope(tpl)?;
        Ok(())
    }

    fn check_buckets(&self, tpl: &Json) -> Result<()> {
        for (name, bucket) in resources_of_type(tpl, "AWS::S3::Bucket") {
            let has_enc = bucket["Properties"].get("BucketEncryption").is_some();
            if !has_enc && !self.allow_unencrypted {
                anyhow::bail!("Policy: S3 bucket {name} requires encryption (SSE-S3 or KMS).");
            }
        }
        Ok(())
    }

    /// Audit roles may only list and read IAM.
    fn check_audit_roles(&self, tpl: &Json) -> Result<()> {
        for (name, role) in resources_of_type(tpl, "AWS::IAM::Role") {
            let Some(role_name) = role["Properties"]["RoleName"].as_str() else { continue };
            if !self.audit_role_names.iter().any(|n| n == role_name) { continue; }
            for stmt in inline_statements(role) {
                for action in as_list(&stmt["Action"]) {
                    let action = action.as_str().unwrap_or_default();
                    if !READ_ONLY_IAM.is_match(action) {
                        anyhow::bail!("Policy: audit role {name} grants '{action}'; only iam:List*/iam:Get* are allowed.");
                    }
                }
            }
        }
        Ok(())
    }

    fn check_assume_role_scope(&self, tpl: &Json) -> Result<()> {
        for (name, role) in resources_of_type(tpl, "AWS::IAM::Role") {
            for stmt in inline_statements(role) {
                let assumes = as_list(&stmt["Action"])
                    .iter()
                    .any(|a| a.as_str().is_some_and(grants_assume_role));
                if !assumes { continue; }
                for res in as_list(&stmt["Resource"]) {
                    let arn = res.as_str().unwrap_or_default();
                    if arn == "*" || arn.ends_with("role/*") {
                        anyhow::bail!("Policy: role {name} may assume any role ('{arn}'); scope sts:AssumeRole to the audit role name.");
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn role(role_name: &str, actions: Json, resource: Json) -> Json {
        json!({
            "Type": "AWS::IAM::Role",
            "Properties": {
                "RoleName": role_name,
                "Policies": [{ "PolicyName": "p", "PolicyDocument": { "Statement": [{ "Effect": "Allow", "Action": actions, "Resource": resource }] } }]
            }
        })
    }

    fn policy() -> Policy { Policy::new(false, vec!["CrossAccountAuditRole".into()]) }

    #[test]
    fn unencrypted_bucket_is_rejected_unless_allowed() {
        let tpl = json!({ "Resources": { "B": { "Type": "AWS::S3::Bucket", "Properties": { "BucketName": "b" } } } });
        assert!(policy().check_template(&tpl).is_err());
        assert!(Policy::new(true, vec![]).check_template(&tpl).is_ok());
    }

    #[test]
    fn audit_role_must_be_read_only() {
        let ok = json!({ "Resources": { "R": role("CrossAccountAuditRole", json!(["iam:ListUsers", "iam:GetRole"]), json!("*")) } });
        assert!(policy().check_template(&ok).is_ok());

        let bad = json!({ "Resources": { "R": role("CrossAccountAuditRole", json!(["iam:ListUsers", "iam:CreateUser"]), json!("*")) } });
        let err = policy().check_template(&bad).unwrap_err().to_string();
        assert!(err.contains("iam:CreateUser"));

        // Other roles are not held to the audit rule.
        let other = json!({ "Resources": { "R": role("Deployer", json!("iam:CreateUser"), json!("*")) } });
        assert!(policy().check_template(&other).is_ok());
    }

    #[test]
    fn assume_role_must_be_scoped() {
        let wide = json!({ "Resources": { "L": role("Lambda", json!(["sts:AssumeRole"]), json!(["arn:aws:iam::*:role/*"])) } });
        assert!(policy().check_template(&wide).is_err());
        let star = json!({ "Resources": { "L": role("Lambda", json!("sts:AssumeRole"), json!("*")) } });
        assert!(policy().check_template(&star).is_err());
        let scoped = json!({ "Resources": { "L": role("Lambda", json!(["sts:AssumeRole"]), json!(["arn:aws:iam::*:role/CrossAccountAuditRole"])) } });
        assert!(policy().check_template(&scoped).is_ok());
    }

    #[test]
    fn wildcard_actions_count_as_assume_role() {
        for action in ["sts:*", "*", "sts:Assume*", "sts:AssumeRole*", "STS:assumerole", "sts:AssumeRoleWithWebIdentity"] {
            let tpl = json!({ "Resources": { "L": role("Lambda", json!([action]), json!("*")) } });
            assert!(policy().check_template(&tpl).is_err(), "{action} on * should be rejected");
        }
        for action in ["sts:GetCallerIdentity", "sts:Get*", "s3:*"] {
            let tpl = json!({ "Resources": { "L": role("Lambda", json!([action]), json!("*")) } });
            assert!(policy().check_template(&tpl).is_ok(), "{action} does not grant AssumeRole");
        }
    }
}

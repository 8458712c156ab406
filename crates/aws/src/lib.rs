use serde::{Serialize, Deserialize};
use serde_json::{json, Value as Json};
use std::collections::BTreeMap;

/// `{"Fn::Sub": template}`
pub fn sub(template: &str) -> Json { json!({ "Fn::Sub": template }) }
/// `{"Ref": logical_id}`
pub fn reference(logical_id: &str) -> Json { json!({ "Ref": logical_id }) }
/// `{"Fn::GetAtt": [logical_id, attr]}`
pub fn get_att(logical_id: &str, attr: &str) -> Json { json!({ "Fn::GetAtt": [logical_id, attr] }) }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Principal {
    Service(String),
    Account(String),
}

impl Principal {
    fn to_json(&self) -> Json {
        match self {
            Principal::Service(s) => json!({ "Service": s }),
            Principal::Account(id) => json!({ "AWS": format!("arn:aws:iam::{id}:root") }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub actions: Vec<String>,
    pub resources: Vec<Json>,
}

impl Statement {
    pub fn allow<A: Into<String>>(actions: impl IntoIterator<Item = A>, resources: Vec<Json>) -> Self {
        Self { actions: actions.into_iter().map(Into::into).collect(), resources }
    }

    fn to_json(&self) -> Json {
        json!({ "Effect": "Allow", "Action": self.actions, "Resource": self.resources })
    }
}

fn policy_document(statements: &[Statement]) -> Json {
    json!({
        "Version": "2012-10-17",
        "Statement": statements.iter().map(Statement::to_json).collect::<Vec<_>>(),
    })
}

/// The CloudFormation resources the collector and trusted-account stacks are built from.
/// `name` is the logical id inside the template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag="type")]
pub enum AwsResource {
    #[serde(rename="AWS::S3::Bucket")]
    S3Bucket {
        name: String,
        bucket_name: Json,
        #[serde(default)]
        sse_s3: bool,
        #[serde(default)]
        retain: bool,
    },
    #[serde(rename="AWS::SSM::Parameter")]
    SsmParameter {
        name: String,
        parameter_name: String,
        value: Json,
        #[serde(default)]
        description: Option<String>,
    },
    #[serde(rename="AWS::IAM::Role")]
    IamRole {
        name: String,
        #[serde(default)]
        role_name: Option<String>,
        assumed_by: Principal,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        managed_policy_arns: Vec<String>,
        #[serde(default)]
        statements: Vec<Statement>,
        #[serde(default)]
        max_session_duration: Option<u32>,
    },
    #[serde(rename="AWS::Logs::LogGroup")]
    LogGroup {
        name: String,
        log_group_name: String,
        retention_days: u32,
    },
    #[serde(rename="AWS::Lambda::Function")]
    LambdaFunction {
        name: String,
        function_name: String,
        code_bucket: String,
        code_key: String,
        role: String,
        timeout_secs: u32,
        memory_mb: u32,
        #[serde(default)]
        environment: BTreeMap<String, Json>,
        #[serde(default)]
        depends_on: Vec<String>,
    },
    #[serde(rename="AWS::Events::Rule")]
    EventsRule {
        name: String,
        schedule_expression: String,
        #[serde(default)]
        description: Option<String>,
        target_function: String,
    },
    #[serde(rename="AWS::Lambda::Permission")]
    LambdaPermission {
        name: String,
        function: String,
        principal: String,
        source_rule: String,
    },
}

impl AwsResource {
    pub fn logical_id(&self) -> &str {
        match self {
            AwsResource::S3Bucket { name, .. }
            | AwsResource::SsmParameter { name, .. }
            | AwsResource::IamRole { name, .. }
            | AwsResource::LogGroup { name, .. }
            | AwsResource::LambdaFunction { name, .. }
            | AwsResource::EventsRule { name, .. }
            | AwsResource::LambdaPermission { name, .. } => name,
        }
    }

    /// The resource body as it appears under `Resources.<logical id>`.
    pub fn to_cfn_json(&self) -> Json {
        match self {
            AwsResource::S3Bucket { name: _, bucket_name, sse_s3, retain } => {
                let mut o = json!({
                    "Type": "AWS::S3::Bucket",
                    "Properties": { "BucketName": bucket_name }
                });
                if *sse_s3 {
                    o["Properties"]["BucketEncryption"] = json!({
                        "ServerSideEncryptionConfiguration": [{
                            "ServerSideEncryptionByDefault": { "SSEAlgorithm": "AES256" }
                        }]
                    });
                }
                if *retain {
                    o["DeletionPolicy"] = json!("Retain");
                    o["UpdateReplacePolicy"] = json!("Retain");
                }
                o
            }
            AwsResource::SsmParameter { name: _, parameter_name, value, description } => {
                let mut props = json!({ "Name": parameter_name, "Type": "String", "Tier": "Standard", "Value": value });
                if let Some(d) = description { props["Description"] = json!(d); }
                json!({ "Type": "AWS::SSM::Parameter", "Properties": props })
            }
            AwsResource::IamRole { name, role_name, assumed_by, description, managed_policy_arns, statements, max_session_duration } => {
                let mut props = json!({
                    "AssumeRolePolicyDocument": {
                        "Version": "2012-10-17",
                        "Statement": [{ "Effect": "Allow", "Principal": assumed_by.to_json(), "Action": "sts:AssumeRole" }]
                    }
                });
                if let Some(r) = role_name { props["RoleName"] = json!(r); }
                if let Some(d) = description { props["Description"] = json!(d); }
                if !managed_policy_arns.is_empty() { props["ManagedPolicyArns"] = json!(managed_policy_arns); }
                if let Some(s) = max_session_duration { props["MaxSessionDuration"] = json!(s); }
                if !statements.is_empty() {
                    props["Policies"] = json!([{ "PolicyName": format!("{name}Policy"), "PolicyDocument": policy_document(statements) }]);
                }
                json!({ "Type": "AWS::IAM::Role", "Properties": props })
            }
            AwsResource::LogGroup { name: _, log_group_name, retention_days } => json!({
                "Type": "AWS::Logs::LogGroup",
                "Properties": { "LogGroupName": log_group_name, "RetentionInDays": retention_days }
            }),
            AwsResource::LambdaFunction { name: _, function_name, code_bucket, code_key, role, timeout_secs, memory_mb, environment, depends_on } => {
                let mut o = json!({
                    "Type": "AWS::Lambda::Function",
                    "Properties": {
                        "FunctionName": function_name,
                        "Runtime": "provided.al2023",
                        "Handler": "bootstrap",
                        "Architectures": ["arm64"],
                        "Code": { "S3Bucket": code_bucket, "S3Key": code_key },
                        "Role": get_att(role, "Arn"),
                        "Timeout": timeout_secs,
                        "MemorySize": memory_mb,
                    }
                });
                if !environment.is_empty() {
                    o["Properties"]["Environment"] = json!({ "Variables": environment });
                }
                if !depends_on.is_empty() { o["DependsOn"] = json!(depends_on); }
                o
            }
            AwsResource::EventsRule { name: _, schedule_expression, description, target_function } => {
                let mut props = json!({
                    "ScheduleExpression": schedule_expression,
                    "State": "ENABLED",
                    "Targets": [{ "Id": "Target0", "Arn": get_att(target_function, "Arn") }]
                });
                if let Some(d) = description { props["Description"] = json!(d); }
                json!({ "Type": "AWS::Events::Rule", "Properties": props })
            }
            AwsResource::LambdaPermission { name: _, function, principal, source_rule } => json!({
                "Type": "AWS::Lambda::Permission",
                "Properties": {
                    "Action": "lambda:InvokeFunction",
                    "FunctionName": reference(function),
                    "Principal": principal,
                    "SourceArn": get_att(source_rule, "Arn")
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_encryption_and_retention() {
        let b = AwsResource::S3Bucket { name: "Bucket".into(), bucket_name: json!("b"), sse_s3: true, retain: true };
        let j = b.to_cfn_json();
        assert_eq!(
            j["Properties"]["BucketEncryption"]["ServerSideEncryptionConfiguration"][0]["ServerSideEncryptionByDefault"]["SSEAlgorithm"],
            "AES256"
        );
        assert_eq!(j["DeletionPolicy"], "Retain");

        let plain = AwsResource::S3Bucket { name: "Bucket".into(), bucket_name: json!("b"), sse_s3: false, retain: false };
        let j = plain.to_cfn_json();
        assert!(j["Properties"].get("BucketEncryption").is_none());
        assert!(j.get("DeletionPolicy").is_none());
    }

    #[test]
    fn role_trusts_account_root() {
        let r = AwsResource::IamRole {
            name: "AuditRole".into(),
            role_name: Some("CrossAccountAuditRole".into()),
            assumed_by: Principal::Account("123456789012".into()),
            description: None,
            managed_policy_arns: vec![],
            statements: vec![Statement::allow(["iam:ListUsers"], vec![json!("*")])],
            max_session_duration: Some(3600),
        };
        let j = r.to_cfn_json();
        let p = &j["Properties"];
        assert_eq!(p["RoleName"], "CrossAccountAuditRole");
        assert_eq!(p["AssumeRolePolicyDocument"]["Statement"][0]["Principal"]["AWS"], "arn:aws:iam::123456789012:root");
        assert_eq!(p["MaxSessionDuration"], 3600);
        assert_eq!(p["Policies"][0]["PolicyDocument"]["Statement"][0]["Action"][0], "iam:ListUsers");
        assert!(p.get("ManagedPolicyArns").is_none());
    }

    #[test]
    fn permission_references_rule_and_function() {
        let p = AwsResource::LambdaPermission {
            name: "Invoke".into(),
            function: "Fn".into(),
            principal: "events.amazonaws.com".into(),
            source_rule: "Rule".into(),
        };
        let j = p.to_cfn_json();
        assert_eq!(j["Properties"]["FunctionName"], json!({ "Ref": "Fn" }));
        assert_eq!(j["Properties"]["SourceArn"], json!({ "Fn::GetAtt": ["Rule", "Arn"] }));
    }
}

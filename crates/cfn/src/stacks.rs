//! The two stacks: the collector in the audit account, and the audit role in every trusted account.

use anyhow::Result;
use serde_json::json;
use std::collections::BTreeMap;

use iam_collector_aws::{get_att, reference, sub, AwsResource, Principal, Statement};
use iam_collector_core::config::validate_role_name;
use iam_collector_core::Parameters;

use crate::CfnTemplate;

pub const BUCKET_ID: &str = "IamCollectorBucket";
pub const PARAMETER_ID: &str = "CollectorAccountsConfig";
pub const LAMBDA_ROLE_ID: &str = "IamCollectorLambdaRole";
pub const LOG_GROUP_ID: &str = "IamCollectorLogGroup";
pub const FUNCTION_ID: &str = "IamCollectorLambda";
pub const RULE_ID: &str = "MonthlyIamCollectorRule";
pub const PERMISSION_ID: &str = "MonthlyIamCollectorRuleInvoke";
pub const AUDIT_ROLE_ID: &str = "CrossAccountAuditRole";

/// Read-only listing granted to the collector in each trusted account.
pub const AUDIT_ACTIONS: [&str; 4] = ["iam:ListUsers", "iam:ListRoles", "iam:ListGroups", "iam:ListPolicies"];

const LAMBDA_BASIC_EXECUTION: &str = "arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole";

fn parameter_arn(parameter_name: &str) -> String {
    let name = parameter_name.trim_start_matches('/');
    format!("arn:${{AWS::Partition}}:ssm:${{AWS::Region}}:${{AWS::AccountId}}:parameter/{name}")
}

pub fn collector_stack(params: &Parameters) -> Result<CfnTemplate> {
    params.validate()?;
    let bucket_name = format!("{}-${{AWS::AccountId}}-${{AWS::Region}}", params.bucket_prefix);
    let parameter_name = params.parameter_name();
    // Bucket name is resolved by CloudFormation; names and ids are validated and contain no `${`.
    let blob = params.config_blob(bucket_name.clone()).to_json()?;

    let statements = vec![
        Statement::allow(["s3:PutObject"], vec![sub(&format!("${{{BUCKET_ID}.Arn}}/*"))]),
        Statement::allow(
            ["sts:AssumeRole"],
            params.role_names().iter().map(|r| json!(format!("arn:aws:iam::*:role/{r}"))).collect(),
        ),
        Statement::allow(["ssm:GetParameter"], vec![sub(&parameter_arn(&parameter_name))]),
    ];

    let lambda = &params.lambda;
    let log_group_name = format!("/aws/lambda/{}", lambda.function_name);
    let mut environment = BTreeMap::new();
    environment.insert("ACCOUNTS_PARAMETER_NAME".to_string(), json!(parameter_name));
    // Leave a minute for logging the summary before the function is killed.
    environment.insert(
        "COLLECTOR_RUN_TIMEOUT_SECS".to_string(),
        json!(lambda.timeout_secs.saturating_sub(60).max(30).to_string()),
    );

    let mut tpl = CfnTemplate::new("Scheduled cross-account IAM inventory collector");
    tpl.add(AwsResource::SsmParameter {
        name: PARAMETER_ID.into(),
        parameter_name: parameter_name.clone(),
        value: sub(&blob),
        description: Some("Target accounts configuration for IAM collector".into()),
    })
    .add(AwsResource::S3Bucket {
        name: BUCKET_ID.into(),
        bucket_name: sub(&bucket_name),
        sse_s3: true,
        retain: true,
    })
    .add(AwsResource::IamRole {
        name: LAMBDA_ROLE_ID.into(),
        role_name: None,
        assumed_by: Principal::Service("lambda.amazonaws.com".into()),
        description: None,
        managed_policy_arns: vec![LAMBDA_BASIC_EXECUTION.into()],
        statements,
        max_session_duration: None,
    })
    .add(AwsResource::LogGroup {
        name: LOG_GROUP_ID.into(),
        log_group_name,
        retention_days: lambda.log_retention_days,
    })
    .add(AwsResource::LambdaFunction {
        name: FUNCTION_ID.into(),
        function_name: lambda.function_name.clone(),
        code_bucket: lambda.code_bucket.clone(),
        code_key: lambda.code_key.clone(),
        role: LAMBDA_ROLE_ID.into(),
        timeout_secs: lambda.timeout_secs,
        memory_mb: lambda.memory_mb,
        environment,
        depends_on: vec![LOG_GROUP_ID.into()],
    })
    .add(AwsResource::EventsRule {
        name: RULE_ID.into(),
        schedule_expression: params.schedule.clone(),
        description: Some("Triggers IAM collector Lambda on the last workday of each month".into()),
        target_function: FUNCTION_ID.into(),
    })
    .add(AwsResource::LambdaPermission {
        name: PERMISSION_ID.into(),
        function: FUNCTION_ID.into(),
        principal: "events.amazonaws.com".into(),
        source_rule: RULE_ID.into(),
    })
    .output("BucketName", reference(BUCKET_ID), "Name of the S3 bucket where IAM data is stored")
    .output("SSMParameterName", reference(PARAMETER_ID), "Name of the SSM parameter containing account configurations")
    .output("FunctionArn", get_att(FUNCTION_ID, "Arn"), "Collector function");
    Ok(tpl)
}

/// Deployed into each trusted account. `role_name` serves accounts with a role override;
/// everyone else gets the shared audit role name.
pub fn trusted_account_stack(params: &Parameters, role_name: Option<&str>) -> Result<CfnTemplate> {
    params.validate()?;
    let role_name = role_name.unwrap_or(&params.audit_role_name);
    validate_role_name(role_name)?;
    let mut tpl = CfnTemplate::new("Role for IAM audit from the collector account");
    tpl.add(AwsResource::IamRole {
        name: AUDIT_ROLE_ID.into(),
        role_name: Some(role_name.to_string()),
        assumed_by: Principal::Account(params.audit_account_id.clone()),
        description: Some("Role for IAM audit from another account".into()),
        managed_policy_arns: vec![],
        statements: vec![Statement::allow(AUDIT_ACTIONS, vec![json!("*")])],
        max_session_duration: Some(3600),
    });
    Ok(tpl)
}

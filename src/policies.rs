//! IAM inline policy documents attached to server roles.
//!
//! Workloads refer to policies by name. The documents themselves come from a built-in registry,
//! optionally extended (or overridden) by `<name>.json` files in the directory named by
//! [`PolicySettings::directory`](crate::settings::PolicySettings::directory).

use crate::naming::{self, Environment};
use color_eyre::Report;
use eyre::WrapErr;
use percent_encoding::percent_decode_str;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Known policy documents, keyed by rendered policy name.
#[derive(Clone, Debug, Default)]
pub struct PolicyRegistry {
    documents: HashMap<String, Value>,
}

fn statement(actions: &[&str], resource: Value) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Action": actions,
            "Resource": resource,
        }]
    })
}

impl PolicyRegistry {
    /// The documents shipped with this crate.
    pub fn builtin() -> Self {
        let mut documents = HashMap::new();
        documents.insert(
            "allow-get-chef-artifacts-chef-client".to_string(),
            statement(
                &["s3:GetObject"],
                json!("arn:aws:s3:::chef-artifacts/chef-client/*"),
            ),
        );
        documents.insert(
            "allow-describe-tags".to_string(),
            statement(&["ec2:DescribeTags"], json!("*")),
        );
        documents.insert(
            "allow-describe-instances".to_string(),
            statement(&["ec2:DescribeInstances"], json!("*")),
        );
        documents.insert(
            "allow-describe-elbs".to_string(),
            statement(&["elasticloadbalancing:DescribeLoadBalancers"], json!("*")),
        );
        documents.insert(
            "allow-describe-snapshots".to_string(),
            statement(&["ec2:DescribeSnapshots"], json!("*")),
        );
        documents.insert(
            "allow-volume-control".to_string(),
            statement(
                &[
                    "ec2:AttachVolume",
                    "ec2:CreateVolume",
                    "ec2:DescribeVolumes",
                    "ec2:DetachVolume",
                    "ec2:CreateTags",
                    "ec2:ModifyInstanceAttribute",
                ],
                json!("*"),
            ),
        );
        documents.insert(
            "allow-get-app-config".to_string(),
            statement(&["s3:GetObject"], json!("arn:aws:s3:::app-config/*")),
        );
        documents.insert(
            "allow-get-solr-schema".to_string(),
            statement(&["s3:GetObject"], json!("arn:aws:s3:::solr-schema/*")),
        );
        documents.insert(
            "allow-get-nginx-config".to_string(),
            statement(&["s3:GetObject"], json!("arn:aws:s3:::nginx-config/*")),
        );
        for env in &[Environment::Test, Environment::Stage, Environment::Prod] {
            documents.insert(
                format!("allow-update-route53-{}", env),
                statement(
                    &[
                        "route53:ChangeResourceRecordSets",
                        "route53:GetChange",
                        "route53:ListResourceRecordSets",
                    ],
                    json!("arn:aws:route53:::*"),
                ),
            );
            documents.insert(
                format!("allow-modify-nginx-elbs-{}", env),
                statement(
                    &[
                        "elasticloadbalancing:RegisterInstancesWithLoadBalancer",
                        "elasticloadbalancing:DeregisterInstancesFromLoadBalancer",
                    ],
                    json!(format!(
                        "arn:aws:elasticloadbalancing:*:*:loadbalancer/{}-nginx*",
                        env.initial()
                    )),
                ),
            );
        }
        PolicyRegistry { documents }
    }

    /// The built-ins, plus every `*.json` file in `dir` (named after the file stem).
    pub fn with_directory(mut self, dir: &Path) -> Result<Self, Report> {
        let entries = std::fs::read_dir(dir)
            .wrap_err_with(|| format!("failed to read policy directory {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let raw = std::fs::read_to_string(&path)
                .wrap_err_with(|| format!("failed to read policy {}", path.display()))?;
            let doc: Value = serde_json::from_str(&raw)
                .wrap_err_with(|| format!("policy {} is not valid JSON", path.display()))?;
            tracing::debug!(%name, "loaded policy document");
            self.documents.insert(name, doc);
        }
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.documents.get(name)
    }
}

/// Combine a workload's policy names with the global ones, dropping duplicates but keeping the
/// order in which names were first seen.
pub fn merge_policy_names(workload: &[String], global: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    workload
        .iter()
        .chain(global.iter())
        .filter(|name| seen.insert(name.as_str()))
        .cloned()
        .collect()
}

/// Render `{environment}` in a policy name.
pub fn policy_name(template: &str, environment: Environment) -> Result<String, Report> {
    let mut fields = HashMap::new();
    fields.insert("environment", environment.to_string());
    naming::render(template, &fields)
}

/// Whether the document IAM holds (URL-encoded, as `GetRolePolicy` returns it) differs from
/// the one we want.
pub fn document_drifted(local: &Value, remote: &str) -> Result<bool, Report> {
    let decoded = percent_decode_str(remote)
        .decode_utf8()
        .wrap_err("policy document is not valid UTF-8")?;
    let remote: Value =
        serde_json::from_str(&decoded).wrap_err("policy document from IAM is not valid JSON")?;
    Ok(&remote != local)
}

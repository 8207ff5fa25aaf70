//! IAM roles and instance profiles for servers.
//!
//! Every server runs under an instance profile and role of the same name (by default its
//! envcl). [`resolve_iam_role`] makes sure both exist and that the role carries exactly the
//! inline policy documents we expect, replacing any that were edited out-of-band.

use crate::policies::{document_drifted, PolicyRegistry};
use color_eyre::Report;
use eyre::WrapErr;
use rusoto_core::RusotoError;
use rusoto_iam::{Iam, IamClient};
use rusoto_sts::{Sts, StsClient};
use serde_json::Value;
use tracing::instrument;

const EC2_TRUST_POLICY: &str = r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Principal":{"Service":["ec2.amazonaws.com"]},"Action":["sts:AssumeRole"]}]}"#;

/// What a role should look like.
#[derive(Clone, Debug, Default)]
pub struct RoleSpec {
    pub name: String,
    /// Inline policy names, already rendered for the environment.
    pub policies: Vec<String>,
    /// Customer-managed policy names, already rendered for the environment.
    pub managed_policies: Vec<String>,
}

/// Ensure the instance profile, role, and policies described by `spec` exist in IAM.
#[instrument(level = "debug", skip(iam, sts, spec, registry), fields(role = %spec.name))]
pub async fn resolve_iam_role(
    iam: &IamClient,
    sts: &StsClient,
    spec: &RoleSpec,
    registry: &PolicyRegistry,
) -> Result<(), Report> {
    let role = &spec.name;

    let profile = iam
        .get_instance_profile(rusoto_iam::GetInstanceProfileRequest {
            instance_profile_name: role.clone(),
        })
        .await;
    let profile_exists = found(profile, |e| {
        matches!(e, rusoto_iam::GetInstanceProfileError::NoSuchEntity(_))
    })
    .wrap_err_with(|| format!("failed to look up instance profile {}", role))?;
    if profile_exists {
        tracing::debug!("instance profile exists");
    } else {
        iam.create_instance_profile(rusoto_iam::CreateInstanceProfileRequest {
            instance_profile_name: role.clone(),
            ..Default::default()
        })
        .await
        .wrap_err_with(|| format!("failed to create instance profile {}", role))?;
        tracing::info!(profile = %role, "created IAM profile");
    }

    let existing_role = iam
        .get_role(rusoto_iam::GetRoleRequest {
            role_name: role.clone(),
        })
        .await;
    let role_exists = found(existing_role, |e| {
        matches!(e, rusoto_iam::GetRoleError::NoSuchEntity(_))
    })
    .wrap_err_with(|| format!("failed to look up role {}", role))?;
    if role_exists {
        tracing::debug!("role exists");
    } else {
        iam.create_role(rusoto_iam::CreateRoleRequest {
            role_name: role.clone(),
            assume_role_policy_document: EC2_TRUST_POLICY.to_string(),
            ..Default::default()
        })
        .await
        .wrap_err_with(|| format!("failed to create role {}", role))?;
        tracing::info!(%role, "created IAM role");

        iam.add_role_to_instance_profile(rusoto_iam::AddRoleToInstanceProfileRequest {
            instance_profile_name: role.clone(),
            role_name: role.clone(),
        })
        .await
        .wrap_err_with(|| format!("failed to attach role {} to its profile", role))?;
        tracing::info!(%role, profile = %role, "attached role to profile");
    }

    if !spec.managed_policies.is_empty() {
        attach_managed_policies(iam, sts, role, &spec.managed_policies).await?;
    }

    let existing = inline_policy_names(iam, role).await?;
    tracing::info!(?existing, "existing policies");

    for (policy, document) in defined_policies(&spec.policies, registry) {
        put_policy(iam, role, policy, document, existing.iter().any(|p| p == policy)).await?;
    }

    Ok(())
}

/// What to do with one inline policy of a role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PolicyAction {
    /// Absent from the role.
    Create,
    /// Present, but no longer matches the local document.
    Replace,
    Keep,
}

/// Decide on an inline policy given the role's current (URL-encoded) document, if any.
pub(crate) fn policy_action(document: &Value, remote: Option<&str>) -> Result<PolicyAction, Report> {
    Ok(match remote {
        None => PolicyAction::Create,
        Some(remote) if document_drifted(document, remote)? => PolicyAction::Replace,
        Some(_) => PolicyAction::Keep,
    })
}

/// The requested policies that have a document, in order. The rest are logged and skipped.
pub(crate) fn defined_policies<'a>(
    names: &'a [String],
    registry: &'a PolicyRegistry,
) -> Vec<(&'a str, &'a Value)> {
    names
        .iter()
        .filter_map(|name| match registry.get(name) {
            Some(document) => Some((name.as_str(), document)),
            None => {
                tracing::info!(policy = %name, "no policy defined");
                None
            }
        })
        .collect()
}

/// Whether an IAM lookup found its entity. `missing` recognises the "no such entity" error.
pub(crate) fn found<T, E>(
    lookup: Result<T, RusotoError<E>>,
    missing: impl Fn(&E) -> bool,
) -> Result<bool, RusotoError<E>> {
    match lookup {
        Ok(_) => Ok(true),
        Err(RusotoError::Service(ref e)) if missing(e) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Put `document` as inline policy `policy`, unless an identical one is already there.
#[instrument(level = "debug", skip(iam, document))]
async fn put_policy(
    iam: &IamClient,
    role: &str,
    policy: &str,
    document: &Value,
    exists: bool,
) -> Result<(), Report> {
    tracing::info!("processing policy");
    let remote = if exists {
        tracing::info!("policy already exists");
        let remote = iam
            .get_role_policy(rusoto_iam::GetRolePolicyRequest {
                role_name: role.to_string(),
                policy_name: policy.to_string(),
            })
            .await
            .wrap_err_with(|| format!("failed to fetch policy {}", policy))?;
        Some(remote.policy_document)
    } else {
        tracing::info!("policy does not exist");
        None
    };

    match policy_action(document, remote.as_deref())? {
        PolicyAction::Keep => {
            tracing::info!("policy is accurate");
            return Ok(());
        }
        PolicyAction::Replace => tracing::warn!("policy has been modified"),
        PolicyAction::Create => {}
    }

    // PutRolePolicy replaces a document of the same name in place.
    iam.put_role_policy(rusoto_iam::PutRolePolicyRequest {
        role_name: role.to_string(),
        policy_name: policy.to_string(),
        policy_document: serde_json::to_string(document)?,
    })
    .await
    .wrap_err_with(|| format!("failed to put policy {}", policy))?;
    tracing::info!("added policy");
    Ok(())
}

async fn inline_policy_names(iam: &IamClient, role: &str) -> Result<Vec<String>, Report> {
    let mut names = Vec::new();
    let mut marker = None;
    loop {
        let res = iam
            .list_role_policies(rusoto_iam::ListRolePoliciesRequest {
                role_name: role.to_string(),
                marker: marker.take(),
                ..Default::default()
            })
            .await
            .wrap_err_with(|| format!("failed to list policies of role {}", role))?;
        names.extend(res.policy_names);
        match (res.is_truncated, res.marker) {
            (Some(true), Some(m)) => marker = Some(m),
            _ => break,
        }
    }
    Ok(names)
}

/// The ARN of a customer-managed policy.
pub fn managed_policy_arn(account_id: &str, policy: &str) -> String {
    format!("arn:aws:iam::{}:policy/{}", account_id, policy)
}

async fn attach_managed_policies(
    iam: &IamClient,
    sts: &StsClient,
    role: &str,
    policies: &[String],
) -> Result<(), Report> {
    tracing::info!(?policies, %role, "adding managed policies");
    let account = sts
        .get_caller_identity(Default::default())
        .await
        .wrap_err("failed to determine AWS account")?
        .account
        .ok_or_else(|| eyre::eyre!("caller identity has no account"))?;

    for policy in policies {
        let arn = managed_policy_arn(&account, policy);
        // attaching an already attached policy is a no-op
        iam.attach_role_policy(rusoto_iam::AttachRolePolicyRequest {
            policy_arn: arn.clone(),
            role_name: role.to_string(),
        })
        .await
        .wrap_err_with(|| format!("failed to attach managed policy {}", arn))?;
        tracing::debug!(%arn, "attached managed policy");
    }
    Ok(())
}

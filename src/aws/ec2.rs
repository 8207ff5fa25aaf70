//! EC2 lookups, validation, and instance lifecycle.

use super::filter;
use crate::error::ValidationError;
use color_eyre::Report;
use eyre::WrapErr;
use rusoto_core::RusotoError;
use rusoto_ec2::{Ec2, Ec2Client};
use serde::{Deserialize, Serialize};
use std::time;
use tracing::instrument;

/// https://docs.aws.amazon.com/AWSEC2/latest/APIReference/API_InstanceState.html
const RUNNING: i64 = 16;

/// Whether a rusoto error carries the given EC2 error code.
///
/// EC2 errors mostly surface as `RusotoError::Unknown` with the code buried in the XML body.
pub(crate) fn has_code<E: std::error::Error + 'static>(e: &RusotoError<E>, code: &str) -> bool {
    match e {
        RusotoError::Unknown(r) => r.body_as_str().contains(&format!("<Code>{}", code)),
        other => other.to_string().contains(code),
    }
}

/// Operating system family, used to pick the latest stock AMI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Windows,
}

impl Default for Platform {
    fn default() -> Self {
        Platform::Linux
    }
}

impl std::str::FromStr for Platform {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match &*s.to_lowercase() {
            "linux" => Platform::Linux,
            "windows" => Platform::Windows,
            x => eyre::bail!("unknown platform {:?}", x),
        })
    }
}

impl Platform {
    fn image_name_pattern(self) -> &'static str {
        match self {
            Platform::Linux => "amzn-ami-hvm-*gp2",
            Platform::Windows => "Windows_Server-2012-R2_RTM-English-64Bit-Base-*",
        }
    }
}

/// A block device attached at launch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BlockDevice {
    /// Instance-store volume, e.g. `ephemeral0` at `xvdc`.
    Ephemeral { name: String, path: String },
    /// EBS volume of `size` GiB.
    Ebs { path: String, size: i64 },
}

impl BlockDevice {
    pub fn device_name(&self) -> String {
        match self {
            BlockDevice::Ephemeral { path, .. } | BlockDevice::Ebs { path, .. } => {
                format!("/dev/{}", path.trim_start_matches("/dev/"))
            }
        }
    }

    pub fn to_ec2(&self) -> rusoto_ec2::BlockDeviceMapping {
        let mut m = rusoto_ec2::BlockDeviceMapping {
            device_name: Some(self.device_name()),
            ..Default::default()
        };
        match self {
            BlockDevice::Ephemeral { name, .. } => m.virtual_name = Some(name.clone()),
            BlockDevice::Ebs { size, .. } => {
                m.ebs = Some(rusoto_ec2::EbsBlockDevice {
                    volume_size: Some(*size),
                    delete_on_termination: Some(true),
                    ..Default::default()
                })
            }
        }
        m
    }

    pub fn to_autoscaling(&self) -> rusoto_autoscaling::BlockDeviceMapping {
        let mut m = rusoto_autoscaling::BlockDeviceMapping {
            device_name: self.device_name(),
            ..Default::default()
        };
        match self {
            BlockDevice::Ephemeral { name, .. } => m.virtual_name = Some(name.clone()),
            BlockDevice::Ebs { size, .. } => {
                m.ebs = Some(rusoto_autoscaling::Ebs {
                    volume_size: Some(*size),
                    delete_on_termination: Some(true),
                    ..Default::default()
                })
            }
        }
        m
    }
}

/// Addresses of a launched instance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub vpc_id: Option<String>,
    pub public_ip: Option<String>,
    pub public_dns: Option<String>,
    pub private_ip: Option<String>,
    pub private_dns: Option<String>,
}

impl From<rusoto_ec2::Instance> for InstanceInfo {
    fn from(i: rusoto_ec2::Instance) -> Self {
        let non_empty = |s: Option<String>| s.filter(|s| !s.is_empty());
        InstanceInfo {
            instance_id: i.instance_id.unwrap_or_default(),
            vpc_id: i.vpc_id,
            public_ip: i.public_ip_address,
            public_dns: non_empty(i.public_dns_name),
            private_ip: i.private_ip_address,
            private_dns: non_empty(i.private_dns_name),
        }
    }
}

/// Where and how to launch a single instance.
#[derive(Clone, Debug, Default)]
pub struct LaunchSpec {
    pub ami: String,
    pub instance_type: String,
    pub instance_profile: String,
    pub key_pair: String,
    pub security_group_ids: Vec<String>,
    pub availability_zone: String,
    pub subnet_id: Option<String>,
    pub block_devices: Vec<BlockDevice>,
    /// Base64-encoded.
    pub user_data: String,
    pub ebs_optimized: bool,
}

#[instrument(level = "debug", skip(ec2))]
pub async fn validate_region(ec2: &Ec2Client, region: &str) -> Result<(), Report> {
    let res = ec2
        .describe_regions(Default::default())
        .await
        .wrap_err("failed to list EC2 regions")?;
    let known = res
        .regions
        .unwrap_or_default()
        .into_iter()
        .filter_map(|r| r.region_name)
        .any(|r| r == region);
    if known {
        Ok(())
    } else {
        Err(ValidationError::InvalidRegion(region.to_string()).into())
    }
}

/// The most recently created Amazon-owned x86_64 image for `platform`.
#[instrument(level = "debug", skip(ec2))]
pub async fn latest_ami(ec2: &Ec2Client, platform: Platform) -> Result<String, Report> {
    let req = rusoto_ec2::DescribeImagesRequest {
        owners: Some(vec!["amazon".to_string()]),
        filters: Some(vec![
            filter("architecture", &["x86_64"]),
            filter("name", &[platform.image_name_pattern()]),
        ]),
        ..Default::default()
    };
    let images = ec2
        .describe_images(req)
        .await
        .wrap_err("failed to search for images")?
        .images
        .unwrap_or_default();

    // creation dates are ISO 8601, so they sort lexicographically
    images
        .into_iter()
        .filter(|i| i.image_id.is_some())
        .max_by(|a, b| a.creation_date.cmp(&b.creation_date))
        .and_then(|i| i.image_id)
        .ok_or_else(|| eyre::eyre!("no {:?} images found", platform))
}

#[instrument(level = "debug", skip(ec2))]
pub async fn validate_ami(ec2: &Ec2Client, ami: &str) -> Result<(), Report> {
    let req = rusoto_ec2::DescribeImagesRequest {
        image_ids: Some(vec![ami.to_string()]),
        ..Default::default()
    };
    match ec2.describe_images(req).await {
        Ok(res) if res.images.as_ref().map_or(false, |i| !i.is_empty()) => Ok(()),
        Ok(_) => Err(ValidationError::InvalidAmi(ami.to_string()).into()),
        Err(e) if has_code(&e, "InvalidAMIID") => {
            tracing::error!("{}", e);
            Err(ValidationError::InvalidAmi(ami.to_string()).into())
        }
        Err(e) => Err(Report::new(e).wrap_err("failed to look up AMI")),
    }
}

#[instrument(level = "debug", skip(ec2))]
pub async fn validate_key_pair(ec2: &Ec2Client, key_pair: &str) -> Result<(), Report> {
    let known = ec2
        .describe_key_pairs(Default::default())
        .await
        .wrap_err("failed to list key pairs")?
        .key_pairs
        .unwrap_or_default()
        .into_iter()
        .filter_map(|k| k.key_name)
        .any(|k| k == key_pair);
    if known {
        Ok(())
    } else {
        Err(ValidationError::InvalidKeyPair(key_pair.to_string()).into())
    }
}

/// The VPC and availability zone a subnet lives in.
#[instrument(level = "debug", skip(ec2))]
pub async fn subnet_placement(
    ec2: &Ec2Client,
    subnet_id: &str,
) -> Result<(String, String), Report> {
    let req = rusoto_ec2::DescribeSubnetsRequest {
        filters: Some(vec![filter("subnet-id", &[subnet_id])]),
        ..Default::default()
    };
    let mut subnets = ec2
        .describe_subnets(req)
        .await
        .wrap_err("failed to look up subnet")?
        .subnets
        .unwrap_or_default();

    match subnets.len() {
        0 => Err(ValidationError::NoSubnetReturned(subnet_id.to_string()).into()),
        1 => {
            let subnet = subnets.remove(0);
            let vpc_id = subnet
                .vpc_id
                .ok_or_else(|| eyre::eyre!("subnet {} has no vpc", subnet_id))?;
            let zone = subnet
                .availability_zone
                .ok_or_else(|| eyre::eyre!("subnet {} has no availability zone", subnet_id))?;
            tracing::info!(%vpc_id, %zone, "subnet {} located", subnet_id);
            Ok((vpc_id, zone))
        }
        _ => Err(ValidationError::MultipleSubnetsReturned(subnet_id.to_string()).into()),
    }
}

#[instrument(level = "debug", skip(ec2))]
pub async fn validate_availability_zone(ec2: &Ec2Client, zone: &str) -> Result<(), Report> {
    let known = ec2
        .describe_availability_zones(Default::default())
        .await
        .wrap_err("failed to list availability zones")?
        .availability_zones
        .unwrap_or_default()
        .into_iter()
        .filter_map(|z| z.zone_name)
        .any(|z| z == zone);
    if known {
        Ok(())
    } else {
        Err(ValidationError::InvalidAvailabilityZone(zone.to_string()).into())
    }
}

/// Whether `instance_type` comes with instance-store volumes.
#[instrument(level = "debug", skip(ec2))]
pub async fn has_instance_storage(ec2: &Ec2Client, instance_type: &str) -> Result<bool, Report> {
    let req = rusoto_ec2::DescribeInstanceTypesRequest {
        instance_types: Some(vec![instance_type.to_string()]),
        ..Default::default()
    };
    let info = ec2
        .describe_instance_types(req)
        .await
        .wrap_err_with(|| format!("failed to describe instance type {}", instance_type))?
        .instance_types
        .unwrap_or_default();
    let info = info
        .into_iter()
        .next()
        .ok_or_else(|| eyre::eyre!("unknown instance type {}", instance_type))?;
    Ok(info.instance_storage_supported.unwrap_or(false))
}

async fn groups_named(
    ec2: &Ec2Client,
    names: &[&str],
    vpc_id: Option<&str>,
) -> Result<Vec<rusoto_ec2::SecurityGroup>, Report> {
    let req = rusoto_ec2::DescribeSecurityGroupsRequest {
        filters: Some(vec![filter("group-name", names)]),
        ..Default::default()
    };
    let groups = ec2
        .describe_security_groups(req)
        .await
        .wrap_err("failed to list security groups")?
        .security_groups
        .unwrap_or_default();
    Ok(in_scope(groups, vpc_id))
}

// groups of the same name may exist in several VPCs (and, on old accounts, outside any VPC)
fn in_scope(
    groups: Vec<rusoto_ec2::SecurityGroup>,
    vpc_id: Option<&str>,
) -> Vec<rusoto_ec2::SecurityGroup> {
    groups
        .into_iter()
        .filter(|g| g.vpc_id.as_deref() == vpc_id)
        .collect()
}

/// The names in `wanted` with no group in `vpc_id` among `existing`.
pub(crate) fn missing_groups<'a>(
    wanted: &'a [String],
    existing: Vec<rusoto_ec2::SecurityGroup>,
    vpc_id: Option<&str>,
) -> Vec<&'a str> {
    let present: Vec<String> = in_scope(existing, vpc_id)
        .into_iter()
        .filter_map(|g| g.group_name)
        .collect();
    wanted
        .iter()
        .filter(|name| {
            let exists = present.contains(name);
            if exists {
                tracing::info!(group = %name, "security group already exists");
            }
            !exists
        })
        .map(String::as_str)
        .collect()
}

/// The account's default VPC in this region, if it has one.
#[instrument(level = "debug", skip(ec2))]
pub async fn default_vpc(ec2: &Ec2Client) -> Result<Option<String>, Report> {
    let req = rusoto_ec2::DescribeVpcsRequest {
        filters: Some(vec![filter("isDefault", &["true"])]),
        ..Default::default()
    };
    let vpc = ec2
        .describe_vpcs(req)
        .await
        .wrap_err("failed to look up the default vpc")?
        .vpcs
        .unwrap_or_default()
        .into_iter()
        .find_map(|v| v.vpc_id);
    match vpc {
        Some(ref id) => tracing::debug!(vpc_id = %id, "found default vpc"),
        None => tracing::debug!("no default vpc"),
    }
    Ok(vpc)
}

/// Create every group in `names` that does not yet exist (in `vpc_id`, if given).
#[instrument(level = "debug", skip(ec2))]
pub async fn resolve_security_groups(
    ec2: &Ec2Client,
    names: &[String],
    vpc_id: Option<&str>,
) -> Result<(), Report> {
    tracing::info!("resolving security groups");
    let wanted: Vec<&str> = names.iter().map(String::as_str).collect();
    let req = rusoto_ec2::DescribeSecurityGroupsRequest {
        filters: Some(vec![filter("group-name", &wanted)]),
        ..Default::default()
    };
    let existing = ec2
        .describe_security_groups(req)
        .await
        .wrap_err("failed to list security groups")?
        .security_groups
        .unwrap_or_default();

    for name in missing_groups(names, existing, vpc_id) {
        tracing::info!(group = %name, "security group does not exist");
        let req = rusoto_ec2::CreateSecurityGroupRequest {
            group_name: name.to_string(),
            description: name.to_string(),
            vpc_id: vpc_id.map(String::from),
            ..Default::default()
        };
        ec2.create_security_group(req)
            .await
            .wrap_err_with(|| format!("failed to create security group {}", name))?;
        tracing::info!(group = %name, "created security group");
    }
    Ok(())
}

/// Map each group name to its id. Each name must match exactly one group.
#[instrument(level = "debug", skip(ec2))]
pub async fn security_group_ids(
    ec2: &Ec2Client,
    names: &[String],
    vpc_id: Option<&str>,
) -> Result<Vec<String>, Report> {
    futures_util::future::try_join_all(names.iter().map(|name| async move {
        let mut groups = groups_named(ec2, &[name.as_str()], vpc_id).await?;
        let id: Result<String, Report> = match groups.len() {
            0 => Err(ValidationError::NoSecurityGroupsReturned(name.clone()).into()),
            1 => groups
                .remove(0)
                .group_id
                .ok_or_else(|| eyre::eyre!("security group {} has no id", name)),
            _ => Err(ValidationError::MultipleSecurityGroupsReturned(name.clone()).into()),
        };
        id
    }))
    .await
}

/// Allow tcp `ports` into `target_group_id` from each of `source_group_ids`.
///
/// Rules that already exist are left alone.
#[instrument(level = "debug", skip(ec2))]
pub async fn authorize_ingress(
    ec2: &Ec2Client,
    target_group_id: &str,
    source_group_ids: &[String],
    ports: &[u16],
) -> Result<(), Report> {
    for source in source_group_ids {
        tracing::info!(%source, "adding ingress rules");
        for &port in ports {
            let req = rusoto_ec2::AuthorizeSecurityGroupIngressRequest {
                group_id: Some(target_group_id.to_string()),
                ip_permissions: Some(vec![rusoto_ec2::IpPermission {
                    ip_protocol: Some("tcp".to_string()),
                    from_port: Some(i64::from(port)),
                    to_port: Some(i64::from(port)),
                    user_id_group_pairs: Some(vec![rusoto_ec2::UserIdGroupPair {
                        group_id: Some(source.clone()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }]),
                ..Default::default()
            };
            tracing::info!(port, %source, target = %target_group_id, "authorizing port");
            match ec2.authorize_security_group_ingress(req).await {
                Ok(_) => {}
                Err(e) if has_code(&e, "InvalidPermission.Duplicate") => {
                    tracing::warn!(port, %source, "ingress rule already exists");
                }
                Err(e) => {
                    return Err(Report::new(e))
                        .wrap_err_with(|| format!("failed to authorize port {}", port));
                }
            }
        }
    }
    Ok(())
}

/// `Name` tags of running instances whose name starts with `prefix`.
#[instrument(level = "debug", skip(ec2))]
pub async fn running_names(ec2: &Ec2Client, prefix: &str) -> Result<Vec<String>, Report> {
    let pattern = format!("{}*", prefix);
    let mut req = rusoto_ec2::DescribeInstancesRequest {
        filters: Some(vec![
            filter("tag:Name", &[pattern.as_str()]),
            filter("instance-state-name", &["running"]),
        ]),
        ..Default::default()
    };

    let mut names = Vec::new();
    loop {
        let res = ec2
            .describe_instances(req.clone())
            .await
            .wrap_err("could not query AWS for running instances")?;
        names.extend(
            res.reservations
                .unwrap_or_default()
                .into_iter()
                .flat_map(|r| r.instances.unwrap_or_default())
                .flat_map(|i| i.tags.unwrap_or_default())
                .filter(|t| t.key.as_deref() == Some("Name"))
                .filter_map(|t| t.value),
        );
        match res.next_token {
            Some(token) if !token.is_empty() => req.next_token = Some(token),
            _ => break,
        }
    }
    tracing::debug!(count = names.len(), "found running siblings");
    Ok(names)
}

/// Launch one instance. Returns its id.
#[instrument(level = "debug", skip(ec2, spec), fields(ami = %spec.ami, instance_type = %spec.instance_type))]
pub async fn launch(ec2: &Ec2Client, spec: &LaunchSpec) -> Result<String, Report> {
    let mut req = rusoto_ec2::RunInstancesRequest {
        image_id: Some(spec.ami.clone()),
        min_count: 1,
        max_count: 1,
        instance_type: Some(spec.instance_type.clone()),
        key_name: Some(spec.key_pair.clone()),
        iam_instance_profile: Some(rusoto_ec2::IamInstanceProfileSpecification {
            name: Some(spec.instance_profile.clone()),
            ..Default::default()
        }),
        block_device_mappings: Some(spec.block_devices.iter().map(BlockDevice::to_ec2).collect()),
        user_data: Some(spec.user_data.clone()),
        ebs_optimized: Some(spec.ebs_optimized),
        ..Default::default()
    };

    match spec.subnet_id {
        None => {
            req.placement = Some(rusoto_ec2::Placement {
                availability_zone: Some(spec.availability_zone.clone()),
                ..Default::default()
            });
            req.security_group_ids = Some(spec.security_group_ids.clone());
        }
        Some(ref subnet) => {
            req.network_interfaces = Some(vec![rusoto_ec2::InstanceNetworkInterfaceSpecification {
                device_index: Some(0),
                subnet_id: Some(subnet.clone()),
                groups: Some(spec.security_group_ids.clone()),
                associate_public_ip_address: Some(true),
                ..Default::default()
            }]);
        }
    }

    let res = ec2
        .run_instances(req)
        .await
        .wrap_err("failed to launch instance")?;
    let instance_id = res
        .instances
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|i| i.instance_id)
        .ok_or_else(|| eyre::eyre!("aws launched no instance"))?;
    tracing::info!(%instance_id, "launched EC2 instance");
    Ok(instance_id)
}

/// Look up a single instance. `Ok(None)` if EC2 does not know it (yet).
pub async fn describe_instance(
    ec2: &Ec2Client,
    instance_id: &str,
) -> Result<Option<rusoto_ec2::Instance>, Report> {
    let req = rusoto_ec2::DescribeInstancesRequest {
        instance_ids: Some(vec![instance_id.to_string()]),
        ..Default::default()
    };
    match ec2.describe_instances(req).await {
        Ok(res) => Ok(res
            .reservations
            .unwrap_or_default()
            .into_iter()
            .flat_map(|r| r.instances.unwrap_or_default())
            .next()),
        // freshly launched instances take a moment to become visible
        Err(e) if has_code(&e, "InvalidInstanceID.NotFound") => Ok(None),
        Err(e) => Err(Report::new(e).wrap_err("could not query AWS for instance state")),
    }
}

/// Poll once a second until the instance is running, or `max_wait` elapses.
#[instrument(level = "debug", skip(ec2, max_wait))]
pub async fn wait_until_running(
    ec2: &Ec2Client,
    instance_id: &str,
    max_wait: Option<time::Duration>,
) -> Result<InstanceInfo, Report> {
    tracing::info!("waiting until the instance is running");
    let start = time::Instant::now();
    loop {
        match describe_instance(ec2, instance_id).await? {
            Some(instance)
                if instance.state.as_ref().and_then(|s| s.code) == Some(RUNNING) =>
            {
                tracing::info!("the instance is running");
                return Ok(instance.into());
            }
            Some(instance) => {
                tracing::trace!(state = ?instance.state.and_then(|s| s.name), "instance not yet running");
            }
            None => tracing::trace!("instance not yet visible"),
        }

        if let Some(limit) = max_wait {
            if start.elapsed() > limit {
                eyre::bail!("instance {} did not start within {:?}", instance_id, limit);
            }
        }
        tokio::time::sleep(time::Duration::from_secs(1)).await;
    }
}

#[instrument(level = "debug", skip(ec2))]
pub async fn tag(
    ec2: &Ec2Client,
    instance_id: &str,
    tags: &[(String, String)],
) -> Result<(), Report> {
    let req = rusoto_ec2::CreateTagsRequest {
        resources: vec![instance_id.to_string()],
        tags: tags
            .iter()
            .map(|(k, v)| rusoto_ec2::Tag {
                key: Some(k.clone()),
                value: Some(v.clone()),
            })
            .collect(),
        ..Default::default()
    };
    ec2.create_tags(req)
        .await
        .wrap_err("failed to tag instance")?;
    Ok(())
}

/// Link a running EC2-Classic instance to `vpc_id`, joining the given VPC security groups.
#[instrument(level = "debug", skip(ec2))]
pub async fn attach_classic_link(
    ec2: &Ec2Client,
    instance_id: &str,
    vpc_id: &str,
    group_ids: &[String],
) -> Result<(), Report> {
    let req = rusoto_ec2::AttachClassicLinkVpcRequest {
        instance_id: instance_id.to_string(),
        vpc_id: vpc_id.to_string(),
        groups: group_ids.to_vec(),
        ..Default::default()
    };
    let res = ec2
        .attach_classic_link_vpc(req)
        .await
        .wrap_err_with(|| format!("failed to link instance to {}", vpc_id))?;
    eyre::ensure!(
        res.return_.unwrap_or(false),
        "EC2 refused to link {} to {}",
        instance_id,
        vpc_id
    );
    tracing::info!(%vpc_id, "linked instance to vpc");
    Ok(())
}

/// Terminate an instance. Returns whether EC2 acknowledged the termination.
#[instrument(level = "debug", skip(ec2))]
pub async fn terminate(ec2: &Ec2Client, instance_id: &str) -> Result<bool, Report> {
    let req = rusoto_ec2::TerminateInstancesRequest {
        instance_ids: vec![instance_id.to_string()],
        ..Default::default()
    };
    let res = ec2
        .terminate_instances(req)
        .await
        .wrap_err("failed to terminate instance")?;
    tracing::debug!(response = ?res, "received termination response");
    Ok(res
        .terminating_instances
        .unwrap_or_default()
        .into_iter()
        .filter_map(|i| i.instance_id)
        .any(|id| id == instance_id))
}

#[cfg(test)]
mod test {
    use super::*;
    use rusoto_core::Region;

    #[test]
    fn block_devices_map_to_ec2() {
        let eph = BlockDevice::Ephemeral {
            name: "ephemeral0".into(),
            path: "xvdc".into(),
        };
        let m = eph.to_ec2();
        assert_eq!(m.device_name.as_deref(), Some("/dev/xvdc"));
        assert_eq!(m.virtual_name.as_deref(), Some("ephemeral0"));
        assert!(m.ebs.is_none());

        let ebs = BlockDevice::Ebs {
            path: "/dev/sda1".into(),
            size: 40,
        };
        let m = ebs.to_autoscaling();
        assert_eq!(m.device_name, "/dev/sda1");
        assert_eq!(m.ebs.and_then(|e| e.volume_size), Some(40));
    }

    #[test]
    fn block_devices_parse_from_yaml() {
        let devs: Vec<BlockDevice> = serde_yaml::from_str(
            "- type: ephemeral\n  name: ephemeral0\n  path: xvdc\n- type: ebs\n  path: xvdf\n  size: 100\n",
        )
        .unwrap();
        assert_eq!(
            devs[1],
            BlockDevice::Ebs {
                path: "xvdf".into(),
                size: 100
            }
        );
    }

    #[test]
    fn instance_info_drops_empty_dns() {
        let i = rusoto_ec2::Instance {
            instance_id: Some("i-1".into()),
            public_dns_name: Some(String::new()),
            private_dns_name: Some("ip-10-0-0-1.ec2.internal".into()),
            private_ip_address: Some("10.0.0.1".into()),
            ..Default::default()
        };
        let info = InstanceInfo::from(i);
        assert_eq!(info.public_dns, None);
        assert_eq!(info.private_dns.as_deref(), Some("ip-10-0-0-1.ec2.internal"));
    }

    fn group(name: &str, vpc_id: Option<&str>) -> rusoto_ec2::SecurityGroup {
        rusoto_ec2::SecurityGroup {
            group_name: Some(name.to_string()),
            group_id: Some(format!("sg-{}", name)),
            vpc_id: vpc_id.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn only_absent_groups_are_created() {
        let wanted = vec![
            "management".to_string(),
            "chef-nodes".to_string(),
            "s-video-web".to_string(),
        ];
        let existing = vec![
            group("management", Some("vpc-default")),
            group("chef-nodes", Some("vpc-default")),
            // same name, other vpc
            group("s-video-web", Some("vpc-other")),
        ];
        assert_eq!(
            missing_groups(&wanted, existing.clone(), Some("vpc-default")),
            vec!["s-video-web"]
        );
        assert_eq!(
            missing_groups(&wanted, existing.clone(), Some("vpc-other")),
            vec!["management", "chef-nodes"]
        );
        assert_eq!(missing_groups(&wanted, existing, None).len(), 3);
        assert_eq!(
            missing_groups(&wanted, vec![], None),
            vec!["management", "chef-nodes", "s-video-web"]
        );
    }

    #[test]
    fn all_present_creates_nothing() {
        let wanted = vec!["chef-nodes".to_string()];
        let existing = vec![group("chef-nodes", None), group("chef-nodes", Some("vpc-1"))];
        assert!(missing_groups(&wanted, existing.clone(), None).is_empty());
        assert!(missing_groups(&wanted, existing, Some("vpc-1")).is_empty());
    }

    #[test]
    #[ignore]
    fn latest_linux_ami() -> Result<(), Report> {
        let _ = tracing_subscriber::fmt::try_init();
        let rt = tokio::runtime::Runtime::new()?;
        let clients = super::super::Clients::connect(Region::UsEast1, || {
            Ok(rusoto_core::credential::DefaultCredentialsProvider::new()?)
        })?;
        rt.block_on(async {
            let ami = latest_ami(&clients.ec2, Platform::Linux).await?;
            assert!(ami.starts_with("ami-"));
            validate_ami(&clients.ec2, &ami).await?;
            let err = validate_ami(&clients.ec2, "ami-00000000").await.unwrap_err();
            assert!(err.downcast_ref::<ValidationError>().is_some());
            Ok(())
        })
    }
}

//! Launch configurations and Auto Scaling groups.
//!
//! Both are create-if-absent: an existing launch configuration or group with the requested name
//! is left exactly as it is.

use super::ec2::BlockDevice;
use color_eyre::Report;
use eyre::WrapErr;
use itertools::Itertools;
use rusoto_autoscaling::{Autoscaling, AutoscalingClient};
use tracing::instrument;

/// A launch configuration to create.
#[derive(Clone, Debug, Default)]
pub struct LaunchConfiguration {
    pub name: String,
    pub ami: String,
    pub instance_type: String,
    pub key_pair: String,
    pub security_group_ids: Vec<String>,
    /// VPC to ClassicLink instances to, and the VPC groups they join there.
    pub classic_link: Option<(String, Vec<String>)>,
    /// Base64-encoded.
    pub user_data: String,
    pub instance_profile: String,
    pub block_devices: Vec<BlockDevice>,
    pub ebs_optimized: bool,
}

/// An Auto Scaling group to create.
#[derive(Clone, Debug, Default)]
pub struct Group {
    pub name: String,
    pub launch_configuration: String,
    pub availability_zones: Vec<String>,
    pub subnet_ids: Vec<String>,
    pub desired_capacity: i64,
    pub min_size: i64,
    pub max_size: i64,
    pub default_cooldown: i64,
    pub health_check_grace_period: i64,
    /// Propagated to every instance the group launches.
    pub tags: Vec<(String, String)>,
}

#[instrument(level = "debug", skip(autoscaling))]
pub async fn launch_configuration_exists(
    autoscaling: &AutoscalingClient,
    name: &str,
) -> Result<bool, Report> {
    let res = autoscaling
        .describe_launch_configurations(rusoto_autoscaling::LaunchConfigurationNamesType {
            launch_configuration_names: Some(vec![name.to_string()]),
            ..Default::default()
        })
        .await
        .wrap_err_with(|| format!("failed to look up launch configuration {}", name))?;
    Ok(!res.launch_configurations.is_empty())
}

/// Create `lc` unless a launch configuration of that name already exists.
///
/// Returns whether anything was created.
#[instrument(level = "debug", skip(autoscaling, lc), fields(name = %lc.name))]
pub async fn ensure_launch_configuration(
    autoscaling: &AutoscalingClient,
    lc: &LaunchConfiguration,
) -> Result<bool, Report> {
    tracing::info!("getting launch configuration");
    if launch_configuration_exists(autoscaling, &lc.name).await? {
        tracing::info!("launch configuration already exists");
        return Ok(false);
    }

    tracing::info!("creating new launch configuration");
    let (classic_link_vpc_id, classic_link_vpc_security_groups) = match &lc.classic_link {
        Some((vpc, groups)) => (Some(vpc.clone()), Some(groups.clone())),
        None => (None, None),
    };
    autoscaling
        .create_launch_configuration(rusoto_autoscaling::CreateLaunchConfigurationType {
            launch_configuration_name: lc.name.clone(),
            image_id: Some(lc.ami.clone()),
            instance_type: Some(lc.instance_type.clone()),
            key_name: Some(lc.key_pair.clone()),
            security_groups: Some(lc.security_group_ids.clone()),
            classic_link_vpc_id,
            classic_link_vpc_security_groups,
            user_data: Some(lc.user_data.clone()),
            iam_instance_profile: Some(lc.instance_profile.clone()),
            block_device_mappings: if lc.block_devices.is_empty() {
                None
            } else {
                Some(lc.block_devices.iter().map(BlockDevice::to_autoscaling).collect())
            },
            ebs_optimized: Some(lc.ebs_optimized),
            ..Default::default()
        })
        .await
        .wrap_err_with(|| format!("failed to create launch configuration {}", lc.name))?;
    Ok(true)
}

#[instrument(level = "debug", skip(autoscaling))]
pub async fn group_exists(autoscaling: &AutoscalingClient, name: &str) -> Result<bool, Report> {
    let res = autoscaling
        .describe_auto_scaling_groups(rusoto_autoscaling::AutoScalingGroupNamesType {
            auto_scaling_group_names: Some(vec![name.to_string()]),
            ..Default::default()
        })
        .await
        .wrap_err_with(|| format!("failed to look up auto scaling group {}", name))?;
    Ok(!res.auto_scaling_groups.is_empty())
}

impl Group {
    fn to_request(&self) -> rusoto_autoscaling::CreateAutoScalingGroupType {
        let tags: Vec<_> = self
            .tags
            .iter()
            .map(|(k, v)| rusoto_autoscaling::Tag {
                key: k.clone(),
                value: Some(v.clone()),
                propagate_at_launch: Some(true),
                resource_id: Some(self.name.clone()),
                resource_type: Some("auto-scaling-group".to_string()),
            })
            .collect();
        let subnets = self.subnet_ids.iter().join(",");

        rusoto_autoscaling::CreateAutoScalingGroupType {
            auto_scaling_group_name: self.name.clone(),
            launch_configuration_name: Some(self.launch_configuration.clone()),
            availability_zones: if self.availability_zones.is_empty() {
                None
            } else {
                Some(self.availability_zones.clone())
            },
            vpc_zone_identifier: if subnets.is_empty() {
                None
            } else {
                Some(subnets)
            },
            desired_capacity: Some(self.desired_capacity),
            min_size: self.min_size,
            max_size: self.max_size,
            default_cooldown: Some(self.default_cooldown),
            health_check_grace_period: Some(self.health_check_grace_period),
            tags: if tags.is_empty() { None } else { Some(tags) },
            ..Default::default()
        }
    }
}

/// Create `group` unless an Auto Scaling group of that name already exists.
///
/// Returns whether anything was created.
#[instrument(level = "debug", skip(autoscaling, group), fields(name = %group.name))]
pub async fn ensure_group(autoscaling: &AutoscalingClient, group: &Group) -> Result<bool, Report> {
    if group_exists(autoscaling, &group.name).await? {
        tracing::info!("autoscaling group already exists");
        return Ok(false);
    }

    tracing::info!("creating new autoscaling group");
    autoscaling
        .create_auto_scaling_group(group.to_request())
        .await
        .wrap_err_with(|| format!("failed to create auto scaling group {}", group.name))?;
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn group_request() {
        let g = Group {
            name: "s-video-web-asg-vpc".into(),
            launch_configuration: "s-video-web".into(),
            availability_zones: vec!["us-east-1c".into(), "us-east-1d".into()],
            subnet_ids: vec!["subnet-1".into(), "subnet-2".into()],
            desired_capacity: 2,
            min_size: 1,
            max_size: 3,
            default_cooldown: 300,
            health_check_grace_period: 300,
            tags: vec![("Environment".into(), "stage".into())],
        };
        let req = g.to_request();
        assert_eq!(req.vpc_zone_identifier.as_deref(), Some("subnet-1,subnet-2"));
        assert_eq!(req.launch_configuration_name.as_deref(), Some("s-video-web"));
        assert_eq!((req.min_size, req.max_size), (1, 3));
        assert_eq!(req.desired_capacity, Some(2));
        let tags = req.tags.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].propagate_at_launch, Some(true));
        assert_eq!(tags[0].resource_id.as_deref(), Some("s-video-web-asg-vpc"));
    }

    #[test]
    fn classic_group_has_no_subnets() {
        let g = Group {
            name: "s-video-web-asg".into(),
            availability_zones: vec!["us-east-1c".into()],
            ..Default::default()
        };
        let req = g.to_request();
        assert!(req.vpc_zone_identifier.is_none());
        assert!(req.tags.is_none());
        assert_eq!(req.availability_zones, Some(vec!["us-east-1c".to_string()]));
    }
}

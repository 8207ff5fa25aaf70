//! Auto-scaled clusters.
//!
//! A [`Cluster`] configures a template [`Server`] exactly as a single launch would, then turns
//! that configuration into a launch configuration and an Auto Scaling group with the
//! [`AutoScaler`]. Nothing is launched directly; the group starts the instances.

use crate::aws::autoscaling::{self, Group};
use crate::aws::ec2::BlockDevice;
use crate::naming::Environment;
use crate::server::{Plan, Server};
use color_eyre::Report;
use rusoto_core::credential::{DefaultCredentialsProvider, ProvideAwsCredentials};
use tracing::instrument;

/// Default launch configuration name: `{e}-{group}-{type}`.
pub fn default_launch_configuration(environment: Environment, group: &str, server_type: &str) -> String {
    crate::naming::envcl(environment, group, server_type)
}

/// Default Auto Scaling group name: `{e}-{group}-{type}-asg`, with `-vpc` appended for groups
/// that launch into subnets.
pub fn default_autoscaling_group(
    environment: Environment,
    group: &str,
    server_type: &str,
    in_vpc: bool,
) -> String {
    let mut name = format!(
        "{}-asg",
        crate::naming::envcl(environment, group, server_type)
    );
    if in_vpc {
        name.push_str("-vpc");
    }
    name
}

/// Creates a launch configuration and an Auto Scaling group for a configured server.
///
/// Instances started by the group register with Chef as `{node name}-{instance id}`, since they
/// all share the template server's user data.
#[derive(Clone, Debug)]
pub struct AutoScaler {
    pub launch_configuration: String,
    pub autoscaling_group: String,
    pub desired_capacity: i64,
    pub min_size: i64,
    pub max_size: i64,
    pub default_cooldown: i64,
    pub health_check_grace_period: i64,
    /// Defaults to the template server's zone.
    pub availability_zones: Vec<String>,
    /// Defaults to the template server's subnet, if any. Must match `availability_zones`.
    pub subnet_ids: Vec<String>,
}

impl AutoScaler {
    pub fn new(launch_configuration: impl ToString, autoscaling_group: impl ToString) -> Self {
        AutoScaler {
            launch_configuration: launch_configuration.to_string(),
            autoscaling_group: autoscaling_group.to_string(),
            desired_capacity: 1,
            min_size: 1,
            max_size: 1,
            default_cooldown: 300,
            health_check_grace_period: 300,
            availability_zones: Vec::new(),
            subnet_ids: Vec::new(),
        }
    }

    /// The group to create for instances of `plan`.
    pub fn group(&self, plan: &Plan) -> Group {
        let availability_zones = if self.availability_zones.is_empty() {
            vec![plan.availability_zone.clone()]
        } else {
            self.availability_zones.clone()
        };
        let subnet_ids = if self.subnet_ids.is_empty() {
            plan.subnet_id.iter().cloned().collect()
        } else {
            self.subnet_ids.clone()
        };

        // every instance would share one name, so name them after the group instead
        let tags = plan
            .tags
            .iter()
            .map(|(k, v)| {
                if k == "Name" {
                    (k.clone(), self.autoscaling_group.clone())
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect();

        Group {
            name: self.autoscaling_group.clone(),
            launch_configuration: self.launch_configuration.clone(),
            availability_zones,
            subnet_ids,
            desired_capacity: self.desired_capacity,
            min_size: self.min_size,
            max_size: self.max_size,
            default_cooldown: self.default_cooldown,
            health_check_grace_period: self.health_check_grace_period,
            tags,
        }
    }

    /// Ensure the launch configuration, then the group, exist for the configured `node`.
    #[instrument(level = "debug", skip(self, node, root_volume), fields(lc = %self.launch_configuration, asg = %self.autoscaling_group))]
    pub async fn autorun<P>(&self, node: &Server<P>, root_volume: Option<BlockDevice>) -> Result<(), Report>
    where
        P: ProvideAwsCredentials + Send + Sync + 'static,
    {
        let plan = node
            .plan()
            .ok_or_else(|| eyre::eyre!("cluster template has not been configured"))?;
        let clients = node.aws()?;

        let mut lc = node.launch_configuration(&self.launch_configuration).await?;
        if let Some(root) = root_volume {
            lc.block_devices.insert(0, root);
        }
        autoscaling::ensure_launch_configuration(&clients.autoscaling, &lc).await?;
        autoscaling::ensure_group(&clients.autoscaling, &self.group(plan)).await?;
        Ok(())
    }
}

/// A fleet of identical servers behind an Auto Scaling group.
#[derive(Debug)]
pub struct Cluster<P = DefaultCredentialsProvider> {
    node: Server<P>,
    launch_configuration: Option<String>,
    autoscaling_group: Option<String>,
    desired_capacity: i64,
    min_size: i64,
    max_size: i64,
    default_cooldown: i64,
    health_check_grace_period: i64,
    availability_zones: Vec<String>,
    subnet_ids: Vec<String>,
    root_volume_size: Option<i64>,
}

impl<P> Cluster<P> {
    /// A cluster of servers like `node`. `node` is only configured, never launched.
    pub fn new(node: Server<P>) -> Self {
        Cluster {
            node,
            launch_configuration: None,
            autoscaling_group: None,
            desired_capacity: 1,
            min_size: 1,
            max_size: 1,
            default_cooldown: 300,
            health_check_grace_period: 300,
            availability_zones: Vec::new(),
            subnet_ids: Vec::new(),
            root_volume_size: Some(40),
        }
    }

    pub fn launch_configuration(mut self, name: impl ToString) -> Self {
        self.launch_configuration = Some(name.to_string());
        self
    }

    pub fn autoscaling_group(mut self, name: impl ToString) -> Self {
        self.autoscaling_group = Some(name.to_string());
        self
    }

    pub fn capacity(mut self, desired: i64, min: i64, max: i64) -> Self {
        self.desired_capacity = desired;
        self.min_size = min;
        self.max_size = max;
        self
    }

    pub fn default_cooldown(mut self, seconds: i64) -> Self {
        self.default_cooldown = seconds;
        self
    }

    pub fn health_check_grace_period(mut self, seconds: i64) -> Self {
        self.health_check_grace_period = seconds;
        self
    }

    /// Spread the group over these zones. The template server is placed in the first.
    pub fn availability_zones(mut self, zones: Vec<String>) -> Self {
        self.availability_zones = zones;
        self
    }

    /// Spread the group over these subnets. The template server is placed in the first.
    pub fn subnets(mut self, subnets: Vec<String>) -> Self {
        self.subnet_ids = subnets;
        self
    }

    /// Size of the root EBS volume in GiB, or `None` to keep the AMI's.
    pub fn root_volume_size(mut self, size: Option<i64>) -> Self {
        self.root_volume_size = size;
        self
    }

    pub fn node(&self) -> &Server<P> {
        &self.node
    }
}

impl<P> Cluster<P>
where
    P: ProvideAwsCredentials + Send + Sync + 'static,
{
    /// Configure the template server, then create the launch configuration and group.
    #[instrument(level = "debug", skip(self))]
    pub async fn provision(&mut self) -> Result<AutoScaler, Report> {
        tracing::info!("provisioning cluster");
        let in_vpc = !self.subnet_ids.is_empty();
        if let Some(subnet) = self.subnet_ids.first() {
            self.node.place_in_subnet(subnet);
        } else if let Some(zone) = self.availability_zones.first() {
            self.node.place_in_zone(zone);
        }
        let plan = self.node.configure().await?;

        let launch_configuration = self.launch_configuration.clone().unwrap_or_else(|| {
            default_launch_configuration(plan.environment, &plan.group, &plan.server_type)
        });
        let autoscaling_group = self.autoscaling_group.clone().unwrap_or_else(|| {
            default_autoscaling_group(
                plan.environment,
                &plan.group,
                &plan.server_type,
                in_vpc,
            )
        });

        let mut autoscaler = AutoScaler::new(launch_configuration, autoscaling_group);
        autoscaler.desired_capacity = self.desired_capacity;
        autoscaler.min_size = self.min_size;
        autoscaler.max_size = self.max_size;
        autoscaler.default_cooldown = self.default_cooldown;
        autoscaler.health_check_grace_period = self.health_check_grace_period;
        autoscaler.availability_zones = self.availability_zones.clone();
        autoscaler.subnet_ids = self.subnet_ids.clone();

        tracing::info!("creating autoscaler");
        let root = self.root_volume_size.map(|size| BlockDevice::Ebs {
            path: "xvda".into(),
            size,
        });
        autoscaler.autorun(&self.node, root).await?;
        Ok(autoscaler)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_names() {
        assert_eq!(
            default_launch_configuration(Environment::Stage, "video", "web"),
            "s-video-web"
        );
        assert_eq!(
            default_autoscaling_group(Environment::Prod, "video", "web", false),
            "p-video-web-asg"
        );
        assert_eq!(
            default_autoscaling_group(Environment::Prod, "video", "web", true),
            "p-video-web-asg-vpc"
        );
    }

    fn plan() -> Plan {
        Plan {
            environment: Environment::Stage,
            group: "video".into(),
            server_type: "web".into(),
            envcl: "s-video-web".into(),
            name: "s-video-web-use1c-01".into(),
            hostname: "s-video-web-use1c-01.stage.example.com".into(),
            region: crate::aws::Region::UsEast1,
            instance_type: "t2.medium".into(),
            ami: "ami-6869aa05".into(),
            role: "s-video-web".into(),
            key_pair: "stage-key".into(),
            availability_zone: "us-east-1c".into(),
            subnet_id: Some("subnet-1".into()),
            vpc_id: Some("vpc-1".into()),
            security_group_vpc_id: Some("vpc-1".into()),
            security_groups: vec!["chef-nodes".into()],
            block_devices: vec![],
            chef_path: "/tmp/chef".into(),
            chef_server_url: "https://chef.example.com/organizations/ops".into(),
            dns_zones: vec![],
            add_route53_dns: true,
            tags: vec![
                ("Name".into(), "s-video-web-use1c-01".into()),
                ("Environment".into(), "stage".into()),
            ],
            run_list: vec!["role[rolebase]".into()],
            attributes: Default::default(),
            role_policies: vec![],
            managed_policies: vec![],
            classic_link: None,
            ebs_optimized: false,
            boot_script: None,
        }
    }

    #[test]
    fn group_defaults_to_template_placement() {
        let a = AutoScaler::new("s-video-web", "s-video-web-asg-vpc");
        let g = a.group(&plan());
        assert_eq!(g.availability_zones, vec!["us-east-1c"]);
        assert_eq!(g.subnet_ids, vec!["subnet-1"]);
        assert_eq!((g.desired_capacity, g.min_size, g.max_size), (1, 1, 1));
        assert_eq!(g.default_cooldown, 300);
        assert_eq!(g.health_check_grace_period, 300);
        assert_eq!(
            g.tags,
            vec![
                ("Name".to_string(), "s-video-web-asg-vpc".to_string()),
                ("Environment".to_string(), "stage".to_string()),
            ]
        );
    }

    #[test]
    fn explicit_placement_wins() {
        let mut a = AutoScaler::new("lc", "asg");
        a.availability_zones = vec!["us-east-1d".into(), "us-east-1e".into()];
        a.subnet_ids = vec!["subnet-d".into(), "subnet-e".into()];
        let g = a.group(&plan());
        assert_eq!(g.availability_zones.len(), 2);
        assert_eq!(g.subnet_ids, vec!["subnet-d", "subnet-e"]);
    }
}

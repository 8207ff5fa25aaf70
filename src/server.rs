//! Provisioning a single server.
//!
//! Describe the server with a [`Setup`], pick a [`Workload`], and hand both to [`Server::new`].
//! [`Server::autorun`] then performs every step in order:
//!
//! 1. [`configure`](Server::configure): fill in defaults, validate every input against AWS, and
//!    make sure the IAM role and security groups the server needs exist.
//! 2. [`launch`](Server::launch) the instance with a user-data script that bootstraps Chef.
//! 3. [`tag`](Server::tag) it.
//! 4. [`route`](Server::route) its DNS records, unless disabled.
//! 5. [`bake`](Server::bake): clear out stale Chef registrations under the same name.
//!
//! [`Server::autorun_and_wait`] additionally waits for the first Chef run to finish and reports
//! whether it succeeded.

use crate::aws::autoscaling::LaunchConfiguration;
use crate::aws::ec2::{self, BlockDevice, InstanceInfo, LaunchSpec, Platform};
use crate::aws::iam::{self, RoleSpec};
use crate::aws::route53::{self, RecordFields};
use crate::aws::{Clients, Region};
use crate::chef::{self, Attributes, Knife};
use crate::error::ValidationError;
use crate::naming::{self, Environment};
use crate::policies::{self, PolicyRegistry};
use crate::settings::{expand_home, DnsZone, Settings};
use crate::ssh;
use crate::userdata::{self, Bootstrap};
use crate::workloads::{Generic, Identity, Workload};
use color_eyre::Report;
use educe::Educe;
use eyre::WrapErr;
use rusoto_core::credential::{DefaultCredentialsProvider, ProvideAwsCredentials};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::instrument;
use tracing_futures::Instrument;

const CHEF_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// A VPC to ClassicLink an EC2-Classic instance to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassicLink {
    pub vpc_id: String,
    /// Security group names, inside `vpc_id`.
    pub security_groups: Vec<String>,
}

/// A description of the server to provision.
///
/// Anything left unset is defaulted from [`Settings`] (and the workload) during
/// [`Server::configure`], with a warning.
#[derive(Clone, Debug)]
pub struct Setup {
    group: Option<String>,
    server_type: Option<String>,
    instance_type: Option<String>,
    environment: Option<Environment>,
    ami: Option<String>,
    use_latest_ami: bool,
    platform: Platform,
    region: Option<String>,
    role: Option<String>,
    key_pair: Option<String>,
    availability_zone: Option<String>,
    security_groups: Option<Vec<String>>,
    block_devices: Option<Vec<BlockDevice>>,
    chef_path: Option<PathBuf>,
    subnet_id: Option<String>,
    dns_zones: Option<Vec<DnsZone>>,
    ingress_groups: Vec<String>,
    ports: Vec<u16>,
    classic_link: Option<ClassicLink>,
    add_route53_dns: bool,
    chef_server_url: Option<String>,
    ebs_optimized: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Setup {
            group: None,
            server_type: None,
            instance_type: None,
            environment: None,
            ami: None,
            use_latest_ami: false,
            platform: Platform::Linux,
            region: None,
            role: None,
            key_pair: None,
            availability_zone: None,
            security_groups: None,
            block_devices: None,
            chef_path: None,
            subnet_id: None,
            dns_zones: None,
            ingress_groups: Vec::new(),
            ports: Vec::new(),
            classic_link: None,
            add_route53_dns: true,
            chef_server_url: None,
            ebs_optimized: false,
        }
    }
}

impl Setup {
    /// The group (cluster) this server belongs to, e.g. `video`. Required.
    pub fn group(mut self, group: impl ToString) -> Self {
        self.group = Some(group.to_string());
        self
    }

    /// The server type, e.g. `web`. Most workloads supply their own.
    pub fn server_type(mut self, server_type: impl ToString) -> Self {
        self.server_type = Some(server_type.to_string());
        self
    }

    pub fn instance_type(mut self, instance_type: impl ToString) -> Self {
        self.instance_type = Some(instance_type.to_string());
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn ami(mut self, ami: impl ToString) -> Self {
        self.ami = Some(ami.to_string());
        self
    }

    /// When no AMI is given, search for the newest stock Amazon image for `platform` instead of
    /// using the configured default.
    pub fn use_latest_ami(mut self, platform: Platform) -> Self {
        self.use_latest_ami = true;
        self.platform = platform;
        self
    }

    pub fn region(mut self, region: impl ToString) -> Self {
        self.region = Some(region.to_string());
        self
    }

    /// The IAM role and instance profile. Defaults to the envcl.
    pub fn role(mut self, role: impl ToString) -> Self {
        self.role = Some(role.to_string());
        self
    }

    pub fn key_pair(mut self, key_pair: impl ToString) -> Self {
        self.key_pair = Some(key_pair.to_string());
        self
    }

    /// Either a full zone name or just its letter. Ignored when a subnet is given.
    pub fn availability_zone(mut self, zone: impl ToString) -> Self {
        self.availability_zone = Some(zone.to_string());
        self
    }

    pub fn security_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.security_groups = Some(groups.into_iter().map(|g| g.to_string()).collect());
        self
    }

    pub fn block_devices(mut self, devices: Vec<BlockDevice>) -> Self {
        self.block_devices = Some(devices);
        self
    }

    pub fn chef_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.chef_path = Some(path.into());
        self
    }

    /// Launch into a VPC subnet. The availability zone is then taken from the subnet.
    pub fn subnet(mut self, subnet_id: impl ToString) -> Self {
        self.subnet_id = Some(subnet_id.to_string());
        self
    }

    pub fn dns_zones(mut self, zones: Vec<DnsZone>) -> Self {
        self.dns_zones = Some(zones);
        self
    }

    /// Open `ports` on the server's envcl group to members of each of `groups`.
    pub fn ingress<I, S>(mut self, groups: I, ports: &[u16]) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.ingress_groups = groups.into_iter().map(|g| g.to_string()).collect();
        self.ports = ports.to_vec();
        self
    }

    pub fn classic_link(mut self, link: ClassicLink) -> Self {
        self.classic_link = Some(link);
        self
    }

    /// Whether `autorun` registers the server in Route53. Defaults to `true`.
    pub fn add_route53_dns(mut self, add: bool) -> Self {
        self.add_route53_dns = add;
        self
    }

    pub fn chef_server_url(mut self, url: impl ToString) -> Self {
        self.chef_server_url = Some(url.to_string());
        self
    }

    pub fn ebs_optimized(mut self, ebs_optimized: bool) -> Self {
        self.ebs_optimized = ebs_optimized;
        self
    }
}

/// Everything [`Server::configure`] decided.
#[derive(Clone, Debug)]
pub struct Plan {
    pub environment: Environment,
    pub group: String,
    pub server_type: String,
    pub envcl: String,
    pub name: String,
    pub hostname: String,
    pub region: Region,
    pub instance_type: String,
    pub ami: String,
    pub role: String,
    pub key_pair: String,
    pub availability_zone: String,
    pub subnet_id: Option<String>,
    pub vpc_id: Option<String>,
    /// Where `security_groups` live: `vpc_id`, else the region's default VPC, if any.
    pub security_group_vpc_id: Option<String>,
    pub security_groups: Vec<String>,
    pub block_devices: Vec<BlockDevice>,
    pub chef_path: PathBuf,
    pub chef_server_url: String,
    pub dns_zones: Vec<DnsZone>,
    pub add_route53_dns: bool,
    pub tags: Vec<(String, String)>,
    pub run_list: Vec<String>,
    pub attributes: Attributes,
    pub role_policies: Vec<String>,
    pub managed_policies: Vec<String>,
    pub classic_link: Option<ClassicLink>,
    pub ebs_optimized: bool,
    pub boot_script: Option<String>,
}

/// The tags every instance carries, followed by the workload's own.
pub fn instance_tags(id: &Identity<'_>, workload: &dyn Workload) -> Vec<(String, String)> {
    let mut tags = vec![
        ("Name".to_string(), id.name.to_string()),
        ("Environment".to_string(), id.environment.to_string()),
        ("Group".to_string(), id.group.to_string()),
        (
            "Role".to_string(),
            format!("Role{}", naming::capitalize(id.server_type)),
        ),
    ];
    tags.extend(workload.tags(id));
    tags
}

/// The inline and managed policy names for the server's role, with `{environment}` rendered.
pub fn role_policy_names(
    workload: &dyn Workload,
    environment: Environment,
    global: &[String],
) -> Result<(Vec<String>, Vec<String>), Report> {
    let render = |names: Vec<String>| -> Result<Vec<String>, Report> {
        names
            .iter()
            .map(|n| policies::policy_name(n, environment))
            .collect()
    };
    let inline = render(policies::merge_policy_names(
        &workload.role_policies(environment),
        global,
    ))?;
    let managed = render(workload.managed_policies())?;
    Ok((inline, managed))
}

/// The block devices to use when none were given.
pub fn default_block_devices(has_instance_storage: bool) -> Vec<BlockDevice> {
    if has_instance_storage {
        tracing::info!("defining ephemeral storage devices");
        vec![BlockDevice::Ephemeral {
            name: "ephemeral0".into(),
            path: "xvdc".into(),
        }]
    } else {
        Vec::new()
    }
}

/// A server being provisioned.
#[derive(Educe)]
#[educe(Debug)]
pub struct Server<P = DefaultCredentialsProvider> {
    setup: Setup,
    workload: Box<dyn Workload>,
    settings: Settings,
    #[educe(Debug(ignore))]
    credential_provider: Box<dyn Fn() -> Result<P, Report> + Send + Sync>,
    max_wait: Option<Duration>,
    clients: Option<Clients>,
    plan: Option<Plan>,
    instance_id: Option<String>,
    instance: Option<InstanceInfo>,
    ssh: Option<ssh::Session>,
}

impl Server {
    pub fn new(setup: Setup, workload: impl Workload + 'static, settings: Settings) -> Self {
        Self::new_boxed(setup, Box::new(workload), settings)
    }

    /// Like [`Server::new`], for a workload chosen at runtime.
    pub fn new_boxed(setup: Setup, workload: Box<dyn Workload>, settings: Settings) -> Self {
        Server {
            setup,
            workload,
            settings,
            credential_provider: Box::new(|| Ok(DefaultCredentialsProvider::new()?)),
            max_wait: None,
            clients: None,
            plan: None,
            instance_id: None,
            instance: None,
            ssh: None,
        }
    }

    /// A base server with no workload-specific behaviour.
    pub fn generic(setup: Setup, settings: Settings) -> Self {
        Self::new(setup, Generic, settings)
    }
}

impl<P> Server<P> {
    /// Set the credential provider used to authenticate to AWS.
    ///
    /// The provided function is called once per service client.
    pub fn with_credentials<P2>(
        self,
        f: impl Fn() -> Result<P2, Report> + Send + Sync + 'static,
    ) -> Server<P2> {
        Server {
            setup: self.setup,
            workload: self.workload,
            settings: self.settings,
            credential_provider: Box::new(f),
            max_wait: self.max_wait,
            clients: None,
            plan: self.plan,
            instance_id: self.instance_id,
            instance: self.instance,
            ssh: self.ssh,
        }
    }

    /// Limit how long to wait for the instance to start and for SSH to come up.
    /// Defaults to no limit.
    pub fn timeout(&mut self, t: Duration) -> &mut Self {
        self.max_wait = Some(t);
        self
    }

    /// Manage an instance that was launched earlier.
    pub fn attach(&mut self, instance_id: impl ToString) -> &mut Self {
        self.instance_id = Some(instance_id.to_string());
        self.instance = None;
        self
    }

    /// The configuration decided by [`Server::configure`], if it has run.
    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    fn configured(&self) -> Result<&Plan, Report> {
        self.plan
            .as_ref()
            .ok_or_else(|| eyre::eyre!("server has not been configured"))
    }

    fn launched(&self) -> Result<&str, Report> {
        self.instance_id
            .as_deref()
            .ok_or_else(|| eyre::eyre!("server has not been launched"))
    }

    pub(crate) fn aws(&self) -> Result<&Clients, Report> {
        self.clients
            .as_ref()
            .ok_or_else(|| eyre::eyre!("not connected to AWS"))
    }

    /// Place the server in `subnet_id`, overriding the setup.
    pub(crate) fn place_in_subnet(&mut self, subnet_id: &str) {
        self.setup.subnet_id = Some(subnet_id.to_string());
        self.plan = None;
    }

    /// Place the server in `zone`, overriding the setup. Has no effect when a subnet is set.
    pub(crate) fn place_in_zone(&mut self, zone: &str) {
        self.setup.availability_zone = Some(zone.to_string());
        self.plan = None;
    }

    /// The base64-encoded first-boot script.
    pub fn user_data(&self) -> Result<String, Report> {
        self.bootstrap(false)
    }

    fn bootstrap(&self, per_instance: bool) -> Result<String, Report> {
        let plan = self.configured()?;
        let chef = &self.settings.chef;
        let key = userdata::read_validation_key(&plan.chef_path, &chef.validation_client_name)?;
        Bootstrap {
            hostname: &plan.hostname,
            node_name: &plan.name,
            chef_environment: plan.environment.as_str(),
            chef_server_url: &plan.chef_server_url,
            validation_client_name: &chef.validation_client_name,
            validation_key: &key,
            client_version: &chef.client_version,
            log_file: &chef.log_file,
            data_bag_secret: chef.data_bag_secret.as_deref(),
            run_list: &plan.run_list,
            attributes: &plan.attributes,
            boot_script: plan.boot_script.as_deref(),
            per_instance,
        }
        .encoded()
    }
}

impl<P> Server<P>
where
    P: ProvideAwsCredentials + Send + Sync + 'static,
{
    fn connect(&mut self, region: Region) -> Result<&Clients, Report> {
        let reconnect = match self.clients {
            Some(ref c) => c.region != region,
            None => true,
        };
        if reconnect {
            let provider = &self.credential_provider;
            self.clients = Some(Clients::connect(region, || (*provider)())?);
        }
        self.aws()
    }

    /// Resolve every input, validating it against AWS, and create the role and security groups
    /// the server will need.
    #[instrument(level = "debug", skip(self))]
    pub async fn configure(&mut self) -> Result<&Plan, Report> {
        let setup = self.setup.clone();
        let defaults = self.settings.defaults.clone();
        let workload = &*self.workload;

        let instance_type = match setup.instance_type {
            Some(t) => t,
            None => {
                tracing::warn!("no instance type provided");
                workload
                    .default_instance_type()
                    .unwrap_or(&defaults.instance_type)
                    .to_string()
            }
        };
        tracing::info!(%instance_type, "using instance type");

        let group = match setup.group {
            Some(g) => g,
            None => {
                tracing::warn!("no group provided");
                return Err(ValidationError::MissingGroup.into());
            }
        };
        tracing::info!(%group, "using group");

        let server_type = match setup
            .server_type
            .or_else(|| workload.server_type().map(String::from))
        {
            Some(t) => t,
            None => {
                tracing::warn!("no type provided");
                eyre::bail!("a server type must be specified");
            }
        };
        tracing::info!(%server_type, "using type");

        let environment = setup.environment.unwrap_or_else(|| {
            tracing::warn!("no environment provided");
            Environment::default()
        });
        tracing::info!(%environment, "using environment");
        let envcl = naming::envcl(environment, &group, &server_type);
        tracing::info!(%envcl, "using envcl");

        let region_name = setup.region.unwrap_or_else(|| {
            tracing::warn!("no region provided");
            defaults.region.clone()
        });
        let region: Region = region_name
            .parse()
            .map_err(|_| ValidationError::InvalidRegion(region_name.clone()))?;
        tracing::info!(region = %region_name, "using EC2 region");

        workload.validate()?;

        let aws = self.connect(region.clone())?.clone();
        let workload = &*self.workload;
        ec2::validate_region(&aws.ec2, &region_name).await?;

        let ami = match setup.ami {
            Some(ami) => ami,
            None if setup.use_latest_ami => {
                tracing::warn!("no AMI provided, searching for latest one");
                let ami = ec2::latest_ami(&aws.ec2, setup.platform).await?;
                tracing::info!(%ami, "found AMI");
                ami
            }
            None => {
                tracing::warn!("no AMI provided");
                defaults.ami.clone()
            }
        };
        ec2::validate_ami(&aws.ec2, &ami).await?;
        tracing::info!(%ami, "using EC2 AMI");

        let role = setup.role.unwrap_or_else(|| {
            tracing::warn!("no IAM role provided");
            envcl.clone()
        });
        tracing::info!(%role, "using IAM role");
        let (role_policies, managed_policies) =
            role_policy_names(workload, environment, &defaults.role_policies)?;
        let mut registry = PolicyRegistry::builtin();
        if let Some(ref dir) = self.settings.policies.directory {
            registry = registry.with_directory(&expand_home(dir))?;
        }
        iam::resolve_iam_role(
            &aws.iam,
            &aws.sts,
            &RoleSpec {
                name: role.clone(),
                policies: role_policies.clone(),
                managed_policies: managed_policies.clone(),
            },
            &registry,
        )
        .await?;

        let key_pair = match setup.key_pair {
            Some(k) => k,
            None => {
                tracing::warn!("no EC2 key pair provided");
                defaults
                    .key_pair(environment)
                    .ok_or_else(|| eyre::eyre!("no default key pair for {}", environment))?
                    .to_string()
            }
        };
        ec2::validate_key_pair(&aws.ec2, &key_pair).await?;
        tracing::info!(%key_pair, "using EC2 key pair");

        let (availability_zone, vpc_id) = match setup.subnet_id {
            Some(ref subnet) => {
                if setup.availability_zone.is_some() {
                    tracing::warn!("both availability zone and subnet set, using zone of subnet");
                }
                let (vpc_id, zone) = ec2::subnet_placement(&aws.ec2, subnet).await?;
                tracing::info!(%vpc_id, "using VPC");
                (zone, Some(vpc_id))
            }
            None => {
                let zone = setup.availability_zone.unwrap_or_else(|| {
                    tracing::warn!(zone = %defaults.availability_zone, "no EC2 availability zone provided");
                    defaults.availability_zone.clone()
                });
                (zone, None)
            }
        };
        let availability_zone = naming::qualify_zone(&region_name, &availability_zone);
        ec2::validate_availability_zone(&aws.ec2, &availability_zone).await?;
        tracing::info!(zone = %availability_zone, "using EC2 availability zone");

        let security_groups = match workload.security_groups(environment, &envcl) {
            Some(groups) => {
                if setup.security_groups.is_some() {
                    tracing::warn!("security groups are fixed for this server type");
                }
                groups
            }
            None => setup.security_groups.unwrap_or_else(|| {
                tracing::warn!("no EC2 security groups provided");
                let mut groups = defaults.security_groups.clone();
                groups.push(envcl.clone());
                groups
            }),
        };
        tracing::info!(groups = %security_groups.join(", "), "using security groups");
        let security_group_vpc_id = match vpc_id {
            Some(ref id) => Some(id.clone()),
            None => ec2::default_vpc(&aws.ec2).await?,
        };
        ec2::resolve_security_groups(
            &aws.ec2,
            &security_groups,
            security_group_vpc_id.as_deref(),
        )
        .await?;

        let block_devices = match setup.block_devices {
            Some(devices) => devices,
            None => {
                tracing::warn!("no block devices provided");
                default_block_devices(ec2::has_instance_storage(&aws.ec2, &instance_type).await?)
            }
        };
        tracing::info!(devices = ?block_devices, "using EC2 block devices");

        let chef_path = setup.chef_path.unwrap_or_else(|| {
            tracing::warn!("no Chef path provided");
            self.settings.chef.path.clone()
        });
        let chef_path = expand_home(&chef_path);
        tracing::info!(path = %chef_path.display(), "using Chef path");

        if !setup.ingress_groups.is_empty() {
            let target = ec2::security_group_ids(
                &aws.ec2,
                std::slice::from_ref(&envcl),
                security_group_vpc_id.as_deref(),
            )
            .await?;
            let sources =
                ec2::security_group_ids(
                    &aws.ec2,
                    &setup.ingress_groups,
                    security_group_vpc_id.as_deref(),
                )
                .await?;
            ec2::authorize_ingress(&aws.ec2, &target[0], &sources, &setup.ports).await?;
        }

        let dns_zones = setup.dns_zones.unwrap_or_else(|| {
            if self.settings.dns.zones.is_empty() {
                tracing::warn!("no DNS zones specified");
            }
            self.settings.dns.zones.clone()
        });

        let chef_server_url = setup.chef_server_url.unwrap_or_else(|| {
            self.settings
                .chef
                .server_for(vpc_id.is_some())
                .to_string()
        });

        // naming
        let location = naming::location(&region_name, &availability_zone)?;
        let mut fields: HashMap<&str, String> = HashMap::new();
        fields.insert("envcl", envcl.clone());
        fields.insert("location", location);
        fields.insert("group", group.clone());
        fields.insert("server_type", server_type.clone());
        fields.insert("environment", environment.to_string());
        fields.extend(workload.name_fields());
        let template = workload.name_template();
        if template.auto_index {
            let prefix = naming::render(&template.search_prefix, &fields)?;
            let running = ec2::running_names(&aws.ec2, &prefix).await?;
            let index = naming::first_free_index(&prefix, running.iter().map(String::as_str))?;
            fields.insert("index", naming::format_index(index));
        }
        let name = naming::render(&template.template, &fields)?;
        tracing::info!(%name, "using node name");
        let hostname = naming::hostname(&name, self.settings.dns.domain(environment)?);
        tracing::info!(%hostname, "using hostname");

        let mut run_list = workload.run_list(environment);
        if self.settings.chef.lowercase_run_list(&chef_server_url) {
            tracing::warn!("Chef 12 server detected, all roles must be in lower case");
            run_list = chef::lowercase_run_list(&run_list);
        }
        tracing::info!(?run_list, "using run list");

        let id = Identity {
            environment,
            group: &group,
            server_type: &server_type,
            envcl: &envcl,
            name: &name,
            hostname: &hostname,
        };
        let mut attributes = Attributes::default();
        workload.attributes(&id, &mut attributes);
        let tags = instance_tags(&id, workload);
        tracing::info!(?tags, "using instance tags");
        let boot_script = workload.boot_script(&id, &self.settings)?;
        let add_route53_dns = setup.add_route53_dns && workload.add_route53_dns();

        self.plan = Some(Plan {
            environment,
            group,
            server_type,
            envcl,
            name,
            hostname,
            region,
            instance_type,
            ami,
            role,
            key_pair,
            availability_zone,
            subnet_id: setup.subnet_id,
            vpc_id,
            security_group_vpc_id,
            security_groups,
            block_devices,
            chef_path,
            chef_server_url,
            dns_zones,
            add_route53_dns,
            tags,
            run_list,
            attributes,
            role_policies,
            managed_policies,
            classic_link: setup.classic_link,
            ebs_optimized: setup.ebs_optimized,
            boot_script,
        });
        self.configured()
    }

    /// The ids of the plan's security groups.
    pub async fn security_group_ids(&self) -> Result<Vec<String>, Report> {
        let plan = self.configured()?;
        let ids = ec2::security_group_ids(
            &self.aws()?.ec2,
            &plan.security_groups,
            plan.security_group_vpc_id.as_deref(),
        )
        .await?;
        tracing::info!(?ids, "using security group ids");
        Ok(ids)
    }

    /// A launch configuration that starts instances just like [`Server::launch`] would.
    ///
    /// Its instances all boot from the same user data, so each one registers with Chef as the
    /// configured node name suffixed with its own instance id.
    pub async fn launch_configuration(&self, name: &str) -> Result<LaunchConfiguration, Report> {
        let plan = self.configured()?;
        let classic_link = match plan.classic_link {
            Some(ref link) => {
                let ids = ec2::security_group_ids(
                    &self.aws()?.ec2,
                    &link.security_groups,
                    Some(&link.vpc_id),
                )
                .await?;
                Some((link.vpc_id.clone(), ids))
            }
            None => None,
        };
        Ok(LaunchConfiguration {
            name: name.to_string(),
            ami: plan.ami.clone(),
            instance_type: plan.instance_type.clone(),
            key_pair: plan.key_pair.clone(),
            security_group_ids: self.security_group_ids().await?,
            classic_link,
            user_data: self.bootstrap(true)?,
            instance_profile: plan.role.clone(),
            block_devices: plan.block_devices.clone(),
            ebs_optimized: plan.ebs_optimized,
        })
    }

    /// Start the instance. With `wait`, return only once it is running.
    #[instrument(level = "debug", skip(self))]
    pub async fn launch(&mut self, wait: bool) -> Result<&str, Report> {
        let plan = self.configured()?;
        let spec = LaunchSpec {
            ami: plan.ami.clone(),
            instance_type: plan.instance_type.clone(),
            instance_profile: plan.role.clone(),
            key_pair: plan.key_pair.clone(),
            security_group_ids: self.security_group_ids().await?,
            availability_zone: plan.availability_zone.clone(),
            subnet_id: plan.subnet_id.clone(),
            block_devices: plan.block_devices.clone(),
            user_data: self.user_data()?,
            ebs_optimized: plan.ebs_optimized,
        };
        let classic_link = plan.classic_link.clone();

        let aws = self.aws()?.clone();
        let instance_id = ec2::launch(&aws.ec2, &spec).await?;
        tracing::info!(%instance_id, "successfully launched EC2 instance");
        self.instance_id = Some(instance_id.clone());
        self.instance = None;

        if wait {
            let info = ec2::wait_until_running(&aws.ec2, &instance_id, self.max_wait)
                .instrument(tracing::debug_span!("wait", %instance_id))
                .await?;
            self.instance = Some(info);

            if let Some(link) = classic_link {
                if spec.subnet_id.is_some() {
                    tracing::warn!("ignoring ClassicLink for an instance launched into a VPC");
                } else {
                    let groups =
                        ec2::security_group_ids(&aws.ec2, &link.security_groups, Some(&link.vpc_id))
                            .await?;
                    ec2::attach_classic_link(&aws.ec2, &instance_id, &link.vpc_id, &groups)
                        .await?;
                }
            }
        } else if classic_link.is_some() {
            tracing::warn!("ClassicLink requires waiting for the instance to run");
        }

        self.launched()
    }

    /// The instance's current addresses, looking them up if they are not yet known.
    pub async fn instance(&mut self) -> Result<&InstanceInfo, Report> {
        let instance_id = self.launched()?.to_string();
        let known = self
            .instance
            .as_ref()
            .map_or(false, |i| i.private_dns.is_some());
        if !known {
            let aws = self.aws()?;
            let instance = ec2::describe_instance(&aws.ec2, &instance_id)
                .await?
                .ok_or_else(|| eyre::eyre!("instance {} not found", instance_id))?;
            self.instance = Some(instance.into());
        }
        self.instance
            .as_ref()
            .ok_or_else(|| eyre::eyre!("instance {} not found", instance_id))
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn tag(&self) -> Result<(), Report> {
        let plan = self.configured()?;
        ec2::tag(&self.aws()?.ec2, self.launched()?, &plan.tags).await?;
        tracing::info!(tags = ?plan.tags, "tagged instance");
        Ok(())
    }

    /// Create or replace the server's DNS records in every configured zone.
    #[instrument(level = "debug", skip(self))]
    pub async fn route(&mut self, wait: bool) -> Result<(), Report> {
        let instance = self.instance().await?.clone();
        let plan = self.configured()?;
        let fields = RecordFields {
            hostname: plan.hostname.clone(),
            name: plan.name.clone(),
            instance,
        };
        route53::route(
            &self.aws()?.route53,
            plan.environment,
            &plan.dns_zones,
            &fields,
            wait,
        )
        .await
    }

    /// Remove any Chef node and client left over from an earlier server of the same name, so
    /// the new instance can register.
    #[instrument(level = "debug", skip(self))]
    pub async fn bake(&self) -> Result<(), Report> {
        let plan = self.configured()?;
        if plan.run_list.is_empty() {
            return Ok(());
        }

        let knife = Knife::new(&plan.chef_path);
        if let Some(node) = knife.show_node(&plan.name).await? {
            tracing::debug!(environment = %node.chef_environment, run_list = ?node.run_list, "found previous chef node");
            if knife.delete_node(&plan.name).await? {
                tracing::info!(node = %plan.name, "removed previous chef node");
            }
        }
        if knife.delete_client(&plan.name).await? {
            tracing::info!(client = %plan.name, "removed previous chef client");
        }
        Ok(())
    }

    /// An SSH session to the instance, established on first use.
    pub async fn connection(&mut self) -> Result<&ssh::Session, Report> {
        if self.ssh.is_none() {
            let host = self
                .instance()
                .await?
                .private_dns
                .clone()
                .ok_or_else(|| eyre::eyre!("instance has no private DNS name"))?;
            tracing::info!(%host, "attempting to establish SSH connection");
            let session = ssh::Session::connect(&host, &self.settings.ssh, self.max_wait).await?;
            tracing::info!("successfully established SSH connection");
            self.ssh = Some(session);
        }
        self.ssh
            .as_ref()
            .ok_or_else(|| eyre::eyre!("no ssh session"))
    }

    /// Run `command` on the instance.
    pub async fn run(&mut self, command: &str) -> Result<ssh::CommandOutput, Report> {
        self.connection().await?.run(command).await
    }

    /// Wait for the first Chef run to finish. Returns whether it succeeded.
    #[instrument(level = "debug", skip(self))]
    pub async fn baked(&mut self) -> Result<bool, Report> {
        let (hostname, empty) = {
            let plan = self.configured()?;
            (plan.hostname.clone(), plan.run_list.is_empty())
        };
        if empty {
            return Ok(true);
        }
        let log_file = self.settings.chef.log_file.clone();
        tracing::info!(node = %hostname, "determining status");
        let session = self.connection().await?;
        chef::await_first_run(
            move |cmd: String| async move { session.run(&cmd).await },
            &log_file,
            CHEF_POLL_INTERVAL,
        )
        .await
    }

    /// Terminate the instance. Returns whether EC2 acknowledged the termination.
    #[instrument(level = "debug", skip(self))]
    pub async fn terminate(&mut self) -> Result<bool, Report> {
        let instance_id = self.launched()?.to_string();
        if let Some(ssh) = self.ssh.take() {
            if let Err(e) = ssh.close().await {
                tracing::warn!("failed to close ssh session: {}", e);
            }
        }

        let address = self.instance.as_ref().and_then(|i| i.private_ip.clone());
        tracing::info!(%instance_id, ?address, "terminating node");
        let terminated = ec2::terminate(&self.aws()?.ec2, &instance_id).await?;
        if terminated {
            tracing::info!(%instance_id, "successfully terminated");
        } else {
            tracing::warn!(%instance_id, "failed to terminate");
        }
        Ok(terminated)
    }

    /// Configure, launch, tag, route, and bake.
    #[instrument(level = "debug", skip(self))]
    pub async fn autorun(&mut self) -> Result<(), Report> {
        self.configure().await?;
        self.launch(true).await?;
        self.tag().await?;
        if self.configured()?.add_route53_dns {
            self.route(false).await?;
        }
        self.bake().await
    }

    /// [`Server::autorun`], then wait for the first Chef run. Returns whether it succeeded.
    pub async fn autorun_and_wait(&mut self) -> Result<bool, Report> {
        self.autorun().await?;
        self.baked().await
    }

    /// Connect to the region of the configured (or set up) server, without configuring it.
    ///
    /// Used to manage instances launched elsewhere, e.g. for [`Server::terminate`].
    pub fn connect_region(&mut self) -> Result<(), Report> {
        let name = match self.plan {
            Some(ref p) => p.region.name().to_string(),
            None => self
                .setup
                .region
                .clone()
                .unwrap_or_else(|| self.settings.defaults.region.clone()),
        };
        let region: Region = name
            .parse()
            .map_err(|_| ValidationError::InvalidRegion(name.clone()))?;
        self.connect(region)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::workloads::{MongoReplicaSetMember, Nginx, Scripts};

    fn id<'a>(server_type: &'a str, envcl: &'a str) -> Identity<'a> {
        Identity {
            environment: Environment::Stage,
            group: "video",
            server_type,
            envcl,
            name: "s-video-mongo-use1c-01",
            hostname: "s-video-mongo-use1c-01.stage.example.com",
        }
    }

    #[test]
    fn setup_defaults() {
        let s = Setup::default();
        assert!(s.add_route53_dns);
        assert!(!s.use_latest_ami);
        assert!(!s.ebs_optimized);
        assert_eq!(s.platform, Platform::Linux);

        let s = Setup::default()
            .group("video")
            .security_groups(vec!["a", "b"])
            .ingress(vec!["s-web"], &[27017, 27018])
            .add_route53_dns(false);
        assert_eq!(s.group.as_deref(), Some("video"));
        assert_eq!(s.security_groups, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(s.ports, vec![27017, 27018]);
        assert!(!s.add_route53_dns);
    }

    #[test]
    fn tags() {
        let member = MongoReplicaSetMember::new(Some(2));
        let tags = instance_tags(&id("mongo", "s-video-mongo"), &member);
        assert_eq!(
            tags,
            vec![
                ("Name".to_string(), "s-video-mongo-use1c-01".to_string()),
                ("Environment".to_string(), "stage".to_string()),
                ("Group".to_string(), "video".to_string()),
                ("Role".to_string(), "RoleMongo".to_string()),
                ("ReplicaSet".to_string(), "video-rs2".to_string()),
            ]
        );
    }

    #[test]
    fn policy_names_are_merged_and_rendered() -> Result<(), Report> {
        let global = crate::settings::Defaults::default().role_policies;
        let (inline, managed) = role_policy_names(&Nginx, Environment::Prod, &global)?;
        assert_eq!(
            inline,
            vec![
                "allow-describe-tags",
                "allow-get-nginx-config",
                "allow-describe-elbs",
                "allow-update-route53-prod",
                "allow-modify-nginx-elbs-prod",
                "allow-get-chef-artifacts-chef-client",
                "allow-describe-instances",
            ]
        );
        assert!(managed.is_empty());

        let (inline, _) = role_policy_names(&Scripts, Environment::Test, &[])?;
        assert_eq!(inline.len(), 5);
        Ok(())
    }

    #[test]
    fn ephemeral_default() {
        assert!(default_block_devices(false).is_empty());
        assert_eq!(
            default_block_devices(true),
            vec![BlockDevice::Ephemeral {
                name: "ephemeral0".into(),
                path: "xvdc".into()
            }]
        );
    }

    #[test]
    fn unconfigured_server_refuses_to_launch() {
        let s = Server::generic(Setup::default().group("video"), Settings::default());
        assert!(s.plan().is_none());
        assert!(s.user_data().is_err());
        assert!(s.instance_id().is_none());
        assert!(s.launched().is_err());
    }

    #[test]
    fn missing_group_is_rejected() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let mut s = Server::generic(Setup::default().server_type("web"), Settings::default());
        let e = rt.block_on(s.configure()).unwrap_err();
        assert_eq!(
            e.downcast_ref::<ValidationError>(),
            Some(&ValidationError::MissingGroup)
        );
    }

    #[test]
    fn bad_region_is_rejected_before_connecting() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let mut s = Server::generic(
            Setup::default()
                .group("video")
                .server_type("web")
                .region("mars-north-1"),
            Settings::default(),
        );
        let e = rt.block_on(s.configure()).unwrap_err();
        assert_eq!(
            e.downcast_ref::<ValidationError>(),
            Some(&ValidationError::InvalidRegion("mars-north-1".into()))
        );
    }

    #[test]
    #[ignore]
    fn make_generic_server() -> Result<(), Report> {
        let _ = tracing_subscriber::fmt::try_init();
        let rt = tokio::runtime::Runtime::new()?;
        let mut s = Server::generic(
            Setup::default()
                .group("bakery")
                .server_type("test")
                .instance_type("t3.micro")
                .add_route53_dns(false),
            Settings::default(),
        );
        rt.block_on(async {
            s.autorun().await?;
            let ok = s.baked().await;
            s.terminate().await?;
            ok.map(|_| ())
        })
    }
}

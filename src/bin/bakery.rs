use bakery::aws::ec2::Platform;
use bakery::workloads::{
    MongoArbiter, MongoNode, MongoReplicaSetMember, Nginx, RabbitMq, Scripts, SolrMaster,
    Workload, Zookeeper,
};
use bakery::{ClassicLink, Cluster, Environment, Server, Settings, Setup};
use color_eyre::Report;
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "bakery", about = "Provision EC2 servers and bake them with Chef")]
struct Opt {
    /// Site settings file.
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    config: Option<PathBuf>,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Launch a single server.
    Launch {
        #[structopt(flatten)]
        kind: Kind,
        #[structopt(flatten)]
        setup: SetupOpt,
        /// Wait for the first Chef run and fail if it did not succeed.
        #[structopt(long)]
        wait: bool,
        /// Give up waiting for the instance after this many seconds.
        #[structopt(long)]
        timeout: Option<u64>,
    },
    /// Create a launch configuration and Auto Scaling group for a server kind.
    Cluster {
        #[structopt(flatten)]
        kind: Kind,
        #[structopt(flatten)]
        setup: SetupOpt,
        #[structopt(long = "launch-configuration")]
        launch_configuration: Option<String>,
        #[structopt(long = "autoscaling-group")]
        autoscaling_group: Option<String>,
        #[structopt(long, default_value = "1")]
        desired: i64,
        #[structopt(long, default_value = "1")]
        min: i64,
        #[structopt(long, default_value = "1")]
        max: i64,
        #[structopt(long = "zone")]
        zones: Vec<String>,
        #[structopt(long = "subnet")]
        subnets: Vec<String>,
        /// Root volume size in GiB.
        #[structopt(long = "root-volume-size", default_value = "40")]
        root_volume_size: i64,
    },
    /// Terminate an instance.
    Terminate {
        instance_id: String,
        #[structopt(short = "r", long = "region")]
        region: Option<String>,
    },
}

#[derive(Debug, StructOpt)]
struct Kind {
    /// generic, mongo, mongo-member, mongo-arbiter, nginx, rabbit, solr, zookeeper, or scripts.
    kind: String,
    #[structopt(long = "replica-set")]
    replica_set: Option<u32>,
    #[structopt(long = "rabbit-user", env = "RABBIT_USER")]
    rabbit_user: Option<String>,
    #[structopt(long = "rabbit-password", env = "RABBIT_PASSWORD", hide_env_values = true)]
    rabbit_password: Option<String>,
    #[structopt(long = "rabbit-iops", default_value = "500")]
    rabbit_iops: u32,
    #[structopt(long = "rabbit-volume-size", default_value = "100")]
    rabbit_volume_size: u32,
    #[structopt(long = "exhibitor-s3config")]
    exhibitor_s3config: Option<String>,
}

impl Kind {
    fn workload(&self) -> Result<Box<dyn Workload>, Report> {
        Ok(match &*self.kind {
            "generic" => Box::new(bakery::workloads::Generic),
            "mongo" => Box::new(MongoNode),
            "mongo-member" => Box::new(MongoReplicaSetMember::new(self.replica_set)),
            "mongo-arbiter" => Box::new(MongoArbiter::new(self.replica_set)),
            "nginx" => Box::new(Nginx),
            "rabbit" => Box::new(
                RabbitMq::new(self.rabbit_user.clone(), self.rabbit_password.clone())?
                    .volume(self.rabbit_iops, self.rabbit_volume_size),
            ),
            "solr" => Box::new(SolrMaster),
            "zookeeper" => Box::new(Zookeeper::new(self.exhibitor_s3config.clone())),
            "scripts" => Box::new(Scripts),
            k => eyre::bail!("unknown server kind {}", k),
        })
    }
}

#[derive(Debug, StructOpt)]
struct SetupOpt {
    #[structopt(short = "g", long)]
    group: Option<String>,
    #[structopt(short = "t", long = "type")]
    server_type: Option<String>,
    #[structopt(short = "e", long)]
    environment: Option<Environment>,
    #[structopt(short = "i", long = "instance-type")]
    instance_type: Option<String>,
    #[structopt(long)]
    ami: Option<String>,
    /// Use the newest stock Amazon image instead of the configured default.
    #[structopt(long = "latest-ami")]
    latest_ami: bool,
    #[structopt(long)]
    windows: bool,
    #[structopt(short = "r", long)]
    region: Option<String>,
    #[structopt(long)]
    role: Option<String>,
    #[structopt(short = "k", long = "key-pair")]
    key_pair: Option<String>,
    #[structopt(short = "z", long = "availability-zone")]
    availability_zone: Option<String>,
    #[structopt(long = "security-group")]
    security_groups: Vec<String>,
    #[structopt(long)]
    subnet: Option<String>,
    #[structopt(long = "chef-path", parse(from_os_str))]
    chef_path: Option<PathBuf>,
    #[structopt(long = "chef-server-url")]
    chef_server_url: Option<String>,
    /// Open `--port`s on the server's own group to these groups.
    #[structopt(long = "ingress-group")]
    ingress_groups: Vec<String>,
    #[structopt(long = "port")]
    ports: Vec<u16>,
    #[structopt(long = "classic-link-vpc")]
    classic_link_vpc: Option<String>,
    #[structopt(long = "classic-link-group")]
    classic_link_groups: Vec<String>,
    #[structopt(long = "no-dns")]
    no_dns: bool,
    #[structopt(long = "ebs-optimized")]
    ebs_optimized: bool,
}

impl SetupOpt {
    fn setup(self) -> Setup {
        let mut s = Setup::default()
            .add_route53_dns(!self.no_dns)
            .ebs_optimized(self.ebs_optimized);
        if let Some(g) = self.group {
            s = s.group(g);
        }
        if let Some(t) = self.server_type {
            s = s.server_type(t);
        }
        if let Some(e) = self.environment {
            s = s.environment(e);
        }
        if let Some(t) = self.instance_type {
            s = s.instance_type(t);
        }
        if let Some(ami) = self.ami {
            s = s.ami(ami);
        } else if self.latest_ami {
            let platform = if self.windows {
                Platform::Windows
            } else {
                Platform::Linux
            };
            s = s.use_latest_ami(platform);
        }
        if let Some(r) = self.region {
            s = s.region(r);
        }
        if let Some(r) = self.role {
            s = s.role(r);
        }
        if let Some(k) = self.key_pair {
            s = s.key_pair(k);
        }
        if let Some(z) = self.availability_zone {
            s = s.availability_zone(z);
        }
        if !self.security_groups.is_empty() {
            s = s.security_groups(self.security_groups);
        }
        if let Some(subnet) = self.subnet {
            s = s.subnet(subnet);
        }
        if let Some(p) = self.chef_path {
            s = s.chef_path(p);
        }
        if let Some(u) = self.chef_server_url {
            s = s.chef_server_url(u);
        }
        if !self.ingress_groups.is_empty() {
            s = s.ingress(self.ingress_groups, &self.ports);
        }
        if let Some(vpc_id) = self.classic_link_vpc {
            s = s.classic_link(ClassicLink {
                vpc_id,
                security_groups: self.classic_link_groups,
            });
        }
        s
    }
}

#[tokio::main]
async fn main() -> Result<(), Report> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bakery=info")),
        )
        .init();

    let opt = Opt::from_args();
    let settings = match opt.config {
        Some(ref path) => Settings::load(path)?,
        None => Settings::default(),
    };

    match opt.cmd {
        Command::Launch {
            kind,
            setup,
            wait,
            timeout,
        } => {
            let mut server = Server::new_boxed(setup.setup(), kind.workload()?, settings);
            if let Some(t) = timeout {
                server.timeout(Duration::from_secs(t));
            }
            if wait {
                let ok = server.autorun_and_wait().await?;
                eyre::ensure!(ok, "the first chef run did not succeed");
            } else {
                server.autorun().await?;
            }
            if let Some(id) = server.instance_id() {
                println!("{}", id);
            }
        }
        Command::Cluster {
            kind,
            setup,
            launch_configuration,
            autoscaling_group,
            desired,
            min,
            max,
            zones,
            subnets,
            root_volume_size,
        } => {
            let node = Server::new_boxed(setup.setup(), kind.workload()?, settings);
            let mut cluster = Cluster::new(node)
                .capacity(desired, min, max)
                .availability_zones(zones)
                .subnets(subnets)
                .root_volume_size(Some(root_volume_size));
            if let Some(lc) = launch_configuration {
                cluster = cluster.launch_configuration(lc);
            }
            if let Some(asg) = autoscaling_group {
                cluster = cluster.autoscaling_group(asg);
            }
            let autoscaler = cluster.provision().await?;
            println!("{}", autoscaler.autoscaling_group);
        }
        Command::Terminate {
            instance_id,
            region,
        } => {
            let mut setup = Setup::default();
            if let Some(r) = region {
                setup = setup.region(r);
            }
            let mut server = Server::generic(setup, settings);
            server.attach(instance_id).connect_region()?;
            eyre::ensure!(server.terminate().await?, "instance was not terminated");
        }
    }
    Ok(())
}

//! `bakery` provisions EC2 servers and gets them baked by Chef.
//!
//! Most interaction with this library happens through [`Setup`] and [`Server`]: describe the
//! server you want, pick a [`Workload`](workloads::Workload) for its kind, and let
//! [`Server::autorun`] validate the inputs, create the IAM role and security groups it needs,
//! launch it with a Chef bootstrap script, tag it, register its DNS records, and clear stale Chef
//! registrations out of the way. Fleets of identical servers go through a [`Cluster`] instead,
//! which turns the same configuration into an Auto Scaling group.
//!
//! Site-specific defaults (the default AMI, key pairs, DNS zones, Chef server, ...) are read from
//! a YAML file into [`Settings`].
//!
//! # Example
//!
//! ```rust,no_run
//! use bakery::{Environment, Server, Settings, Setup};
//! use bakery::workloads::MongoReplicaSetMember;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), color_eyre::Report> {
//!     let settings = Settings::load("bakery.yml")?;
//!     let setup = Setup::default()
//!         .group("video")
//!         .environment(Environment::Stage)
//!         .instance_type("r5.large");
//!
//!     let mut server = Server::new(setup, MongoReplicaSetMember::new(Some(2)), settings);
//!     if server.autorun_and_wait().await? {
//!         let host = server.instance().await?.private_dns.clone();
//!         println!("{:?} is ready", host);
//!     }
//!     Ok(())
//! }
//! ```

pub mod aws;
pub mod chef;
pub mod cluster;
mod error;
pub mod naming;
pub mod policies;
pub mod server;
pub mod settings;
pub mod ssh;
pub mod userdata;
pub mod workloads;

pub use cluster::{AutoScaler, Cluster};
pub use error::ValidationError;
pub use naming::Environment;
pub use server::{ClassicLink, Plan, Server, Setup};
pub use settings::Settings;

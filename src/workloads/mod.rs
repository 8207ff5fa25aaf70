//! Per-server-type defaults.
//!
//! A [`Workload`] tweaks how a [`Server`](crate::Server) is configured: which Chef roles it runs,
//! which IAM policies its role gets, which security groups it joins, how it is named, and which
//! first-boot attributes it receives. Every hook has a default matching a plain base server, so
//! [`Generic`] implements none of them.

use crate::chef::Attributes;
use crate::naming::{Environment, NameTemplate};
use crate::settings::Settings;
use color_eyre::Report;

pub mod mongo;
pub mod nginx;
pub mod rabbit;
pub mod scripts;
pub mod solr;
pub mod zookeeper;

pub use mongo::{MongoArbiter, MongoNode, MongoReplicaSetMember};
pub use nginx::Nginx;
pub use rabbit::RabbitMq;
pub use scripts::Scripts;
pub use solr::SolrMaster;
pub use zookeeper::Zookeeper;

/// The resolved identity of the server being configured.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity<'a> {
    pub environment: Environment,
    pub group: &'a str,
    pub server_type: &'a str,
    pub envcl: &'a str,
    pub name: &'a str,
    pub hostname: &'a str,
}

/// Environment-specific defaults for one kind of server.
pub trait Workload: std::fmt::Debug + Send + Sync {
    /// The server type used when the setup does not name one.
    fn server_type(&self) -> Option<&str> {
        None
    }

    fn run_list(&self, _environment: Environment) -> Vec<String> {
        vec!["role[RoleBase]".to_string()]
    }

    /// Inline policy names. `{environment}` is substituted before use.
    fn role_policies(&self, _environment: Environment) -> Vec<String> {
        Vec::new()
    }

    /// Customer-managed policy names. `{environment}` is substituted before use.
    fn managed_policies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Security groups that replace whatever the setup asked for.
    fn security_groups(&self, _environment: Environment, _envcl: &str) -> Option<Vec<String>> {
        None
    }

    fn default_instance_type(&self) -> Option<&str> {
        None
    }

    fn name_template(&self) -> NameTemplate {
        NameTemplate::default()
    }

    /// Extra placeholders available to [`Workload::name_template`].
    fn name_fields(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    /// Reject impossible configurations before anything is created.
    fn validate(&self) -> Result<(), Report> {
        Ok(())
    }

    fn attributes(&self, _id: &Identity<'_>, _attributes: &mut Attributes) {}

    fn tags(&self, _id: &Identity<'_>) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Whether `autorun` should register the server in Route53.
    fn add_route53_dns(&self) -> bool {
        true
    }

    /// Shell to run on first boot, before the initial Chef converge.
    fn boot_script(&self, _id: &Identity<'_>, _settings: &Settings) -> Result<Option<String>, Report> {
        Ok(None)
    }
}

/// A base server of any type.
#[derive(Clone, Copy, Debug, Default)]
pub struct Generic;

impl Workload for Generic {}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    pub(crate) fn identity<'a>(environment: Environment, server_type: &'a str, envcl: &'a str) -> Identity<'a> {
        Identity {
            environment,
            group: "video",
            server_type,
            envcl,
            name: "s-video-x-use1c-01",
            hostname: "s-video-x-use1c-01.stage.example.com",
        }
    }

    #[test]
    fn generic_defaults() {
        let g = Generic;
        assert_eq!(g.server_type(), None);
        assert_eq!(g.run_list(Environment::Prod), vec!["role[RoleBase]"]);
        assert!(g.role_policies(Environment::Test).is_empty());
        assert!(g.security_groups(Environment::Test, "t-video-web").is_none());
        assert_eq!(g.name_template(), NameTemplate::default());
        assert!(g.add_route53_dns());
        assert!(g.validate().is_ok());

        let id = identity(Environment::Stage, "web", "s-video-web");
        let mut attrs = Attributes::default();
        g.attributes(&id, &mut attrs);
        assert!(attrs.is_empty());
        assert!(g.tags(&id).is_empty());
        assert_eq!(g.boot_script(&id, &Settings::default()).unwrap(), None);
    }
}

//! Zookeeper ensemble members, supervised by Exhibitor.

use super::{Identity, Workload};
use crate::chef::Attributes;
use crate::naming::Environment;

#[derive(Clone, Debug, Default)]
pub struct Zookeeper {
    /// Exhibitor's shared S3 config location, `bucket:key`.
    exhibitor_s3config: Option<String>,
}

impl Zookeeper {
    pub fn new(exhibitor_s3config: Option<String>) -> Self {
        Zookeeper { exhibitor_s3config }
    }
}

impl Workload for Zookeeper {
    fn server_type(&self) -> Option<&str> {
        Some("zookeeper")
    }

    fn run_list(&self, _: Environment) -> Vec<String> {
        vec!["role[RoleZookeeper]".to_string()]
    }

    fn role_policies(&self, _: Environment) -> Vec<String> {
        vec![
            "allow-describe-instances".to_string(),
            "allow-describe-tags".to_string(),
            "allow-volume-control".to_string(),
        ]
    }

    fn attributes(&self, _: &Identity<'_>, attributes: &mut Attributes) {
        match self.exhibitor_s3config {
            Some(ref s3) => {
                attributes.set_dotted("exhibitor.cli.s3config", s3.as_str());
                tracing::info!(s3config = %s3, "set exhibitor.cli.s3config");
            }
            None => tracing::info!("exhibitor.cli.s3config not set, using default"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::workloads::test::identity;
    use serde_json::json;

    #[test]
    fn s3config_is_optional() {
        let id = identity(Environment::Test, "zookeeper", "t-video-zookeeper");

        let mut attrs = Attributes::default();
        Zookeeper::default().attributes(&id, &mut attrs);
        assert!(attrs.is_empty());

        let zk = Zookeeper::new(Some("exhibitor-config:video/exhibitor.properties".into()));
        zk.attributes(&id, &mut attrs);
        assert_eq!(
            attrs.get_dotted("exhibitor.cli.s3config"),
            Some(&json!("exhibitor-config:video/exhibitor.properties"))
        );
    }
}

//! Solr master nodes.

use super::{Identity, Workload};
use crate::chef::Attributes;
use crate::naming::Environment;

#[derive(Clone, Copy, Debug, Default)]
pub struct SolrMaster;

impl Workload for SolrMaster {
    fn server_type(&self) -> Option<&str> {
        Some("solr")
    }

    fn run_list(&self, _: Environment) -> Vec<String> {
        vec!["role[RoleSolr]".to_string()]
    }

    fn role_policies(&self, _: Environment) -> Vec<String> {
        vec![
            "allow-volume-control".to_string(),
            "allow-get-solr-schema".to_string(),
        ]
    }

    fn security_groups(&self, environment: Environment, envcl: &str) -> Option<Vec<String>> {
        Some(vec![
            "management".to_string(),
            "chef-nodes".to_string(),
            envcl.to_string(),
            format!("{}-solr-management", environment.initial()),
        ])
    }

    fn attributes(&self, id: &Identity<'_>, attributes: &mut Attributes) {
        attributes
            .set_dotted("solr.is_master", "true")
            .set_dotted("solr.group", id.group)
            .set_dotted("solr.master_host", id.hostname);
        tracing::info!(group = %id.group, master = %id.hostname, "set the solr attributes");
    }
}

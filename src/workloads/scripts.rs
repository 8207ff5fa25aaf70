//! Hosts for scheduled maintenance scripts.

use super::Workload;
use crate::naming::Environment;

#[derive(Clone, Copy, Debug, Default)]
pub struct Scripts;

impl Workload for Scripts {
    fn server_type(&self) -> Option<&str> {
        Some("scripts")
    }

    fn run_list(&self, _: Environment) -> Vec<String> {
        vec!["role[RoleScripts]".to_string()]
    }

    fn role_policies(&self, _: Environment) -> Vec<String> {
        vec![
            "allow-describe-instances".to_string(),
            "allow-describe-tags".to_string(),
            "allow-describe-elbs".to_string(),
            "allow-describe-snapshots".to_string(),
            "allow-get-app-config".to_string(),
        ]
    }

    fn default_instance_type(&self) -> Option<&str> {
        Some("t2.micro")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn small_by_default() {
        assert_eq!(Scripts.default_instance_type(), Some("t2.micro"));
        assert_eq!(Scripts.run_list(Environment::Prod), vec!["role[RoleScripts]"]);
        assert_eq!(Scripts.role_policies(Environment::Prod).len(), 5);
    }
}

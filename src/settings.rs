//! Site-wide defaults, loaded from a YAML file.
//!
//! A missing key falls back to the value in the corresponding `Default` impl, so a settings file
//! only needs to list what differs from the defaults below.

use crate::naming::Environment;
use color_eyre::Report;
use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub defaults: Defaults,
    pub chef: ChefSettings,
    pub dns: DnsSettings,
    pub ssh: SshSettings,
    pub policies: PolicySettings,
}

impl Settings {
    /// Read settings from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Report> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read settings file {}", path.display()))?;
        let settings = serde_yaml::from_str(&raw)
            .wrap_err_with(|| format!("failed to parse settings file {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded settings");
        Ok(settings)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub instance_type: String,
    pub ami: String,
    pub region: String,
    /// Zone letter used when neither a zone nor a subnet is given.
    pub availability_zone: String,
    pub key_pairs: BTreeMap<Environment, String>,
    pub security_groups: Vec<String>,
    /// Inline policies attached to every role, in addition to the workload's own.
    pub role_policies: Vec<String>,
}

impl Default for Defaults {
    fn default() -> Self {
        let mut key_pairs = BTreeMap::new();
        key_pairs.insert(Environment::Test, "stage-key".to_string());
        key_pairs.insert(Environment::Stage, "stage-key".to_string());
        key_pairs.insert(Environment::Prod, "prod-key".to_string());
        Defaults {
            instance_type: "t2.medium".into(),
            ami: "ami-6869aa05".into(),
            region: "us-east-1".into(),
            availability_zone: "c".into(),
            key_pairs,
            security_groups: vec!["management".into(), "chef-nodes".into()],
            role_policies: vec![
                "allow-get-chef-artifacts-chef-client".into(),
                "allow-describe-tags".into(),
                "allow-describe-instances".into(),
            ],
        }
    }
}

impl Defaults {
    pub fn key_pair(&self, environment: Environment) -> Option<&str> {
        self.key_pairs.get(&environment).map(String::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChefSettings {
    pub server_url: String,
    /// Server used for instances launched into a VPC subnet, if it differs.
    pub vpc_server_url: Option<String>,
    /// Local directory holding `knife.rb` and the validation key.
    pub path: PathBuf,
    pub validation_client_name: String,
    pub client_version: String,
    pub log_file: String,
    /// `s3://` location of the encrypted data bag secret to copy onto new nodes.
    pub data_bag_secret: Option<String>,
    /// Force (or suppress) lower-casing of run-list entries.
    pub lowercase_run_list: Option<bool>,
}

impl Default for ChefSettings {
    fn default() -> Self {
        ChefSettings {
            server_url: "https://chef.example.com/organizations/ops".into(),
            vpc_server_url: None,
            path: PathBuf::from("~/.chef"),
            validation_client_name: "chef-validator".into(),
            client_version: "12.13.37".into(),
            log_file: "/var/log/chef-client.log".into(),
            data_bag_secret: None,
            lowercase_run_list: None,
        }
    }
}

impl ChefSettings {
    /// The server to bootstrap against, depending on whether the node lives in a VPC.
    pub fn server_for(&self, in_vpc: bool) -> &str {
        match self.vpc_server_url {
            Some(ref url) if in_vpc => url,
            _ => &self.server_url,
        }
    }

    /// Chef 12 servers reject CamelCase role names; they are recognisable by the
    /// `/organizations/` segment of their URL.
    pub fn lowercase_run_list(&self, server_url: &str) -> bool {
        self.lowercase_run_list
            .unwrap_or_else(|| server_url.contains("/organizations/"))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    pub domains: BTreeMap<Environment, String>,
    pub zones: Vec<DnsZone>,
}

impl Default for DnsSettings {
    fn default() -> Self {
        let mut domains = BTreeMap::new();
        domains.insert(Environment::Test, "test.example.com".to_string());
        domains.insert(Environment::Stage, "stage.example.com".to_string());
        domains.insert(Environment::Prod, "example.com".to_string());
        DnsSettings {
            domains,
            zones: Vec::new(),
        }
    }
}

impl DnsSettings {
    pub fn domain(&self, environment: Environment) -> Result<&str, Report> {
        self.domains
            .get(&environment)
            .map(String::as_str)
            .ok_or_else(|| eyre::eyre!("no DNS domain configured for {}", environment))
    }
}

/// A Route53 hosted zone and the records every server gets in it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DnsZone {
    /// Hosted zone id per environment.
    pub id: BTreeMap<Environment, String>,
    pub records: Vec<DnsRecord>,
}

/// A record template. `name` and `value` may reference instance fields such as `{hostname}`
/// or `{private_ip_address}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DnsRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub value: String,
    #[serde(default = "default_ttl")]
    pub ttl: i64,
}

fn default_ttl() -> i64 {
    60
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub username: String,
    pub keys: Vec<PathBuf>,
    pub retry_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        SshSettings {
            username: "ec2-user".into(),
            keys: vec![PathBuf::from("~/.ssh/stage"), PathBuf::from("~/.ssh/prod")],
            retry_secs: 10,
        }
    }
}

impl SshSettings {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_secs)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// Directory of `<policy-name>.json` documents that extend or override the built-ins.
    pub directory: Option<PathBuf>,
}

/// Expand a leading `~` to the current user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() -> Result<(), Report> {
        let mut f = tempfile::NamedTempFile::new()?;
        writeln!(
            f,
            "defaults:\n  instance_type: m4.large\nchef:\n  vpc_server_url: https://chef-vpc.example.com/organizations/ops\n"
        )?;
        let s = Settings::load(f.path())?;
        assert_eq!(s.defaults.instance_type, "m4.large");
        assert_eq!(s.defaults.ami, Defaults::default().ami);
        assert_eq!(s.chef.server_for(false), ChefSettings::default().server_url);
        assert_eq!(
            s.chef.server_for(true),
            "https://chef-vpc.example.com/organizations/ops"
        );
        assert_eq!(s.ssh, SshSettings::default());
        Ok(())
    }

    #[test]
    fn dns_zones_parse() -> Result<(), Report> {
        let yaml = r#"
dns:
  domains:
    test: thor.example.net
  zones:
    - id:
        test: ZTEST
        prod: ZPROD
      records:
        - type: A
          name: "{hostname}."
          value: "{private_ip_address}"
"#;
        let s: Settings = serde_yaml::from_str(yaml)?;
        assert_eq!(s.dns.domain(Environment::Test)?, "thor.example.net");
        assert!(s.dns.domain(Environment::Prod).is_err());
        let zone = &s.dns.zones[0];
        assert_eq!(zone.id.get(&Environment::Prod).map(String::as_str), Some("ZPROD"));
        assert_eq!(zone.records[0].kind, "A");
        assert_eq!(zone.records[0].ttl, 60);
        Ok(())
    }

    #[test]
    fn chef12_is_detected_from_url() {
        let mut c = ChefSettings::default();
        assert!(c.lowercase_run_list("https://chef.example.com/organizations/ops"));
        assert!(!c.lowercase_run_list("https://chef.example.com"));
        c.lowercase_run_list = Some(false);
        assert!(!c.lowercase_run_list("https://chef.example.com/organizations/ops"));
    }

    #[test]
    fn home_is_expanded() {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let expanded = expand_home(Path::new("~/.chef"));
        match home {
            Some(h) => assert_eq!(expanded, h.join(".chef")),
            None => assert_eq!(expanded, PathBuf::from("~/.chef")),
        }
        assert_eq!(expand_home(Path::new("/etc/chef")), PathBuf::from("/etc/chef"));
    }
}

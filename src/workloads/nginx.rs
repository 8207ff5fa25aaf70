//! Nginx front-ends.
//!
//! These register their own public CNAME from the instance on every boot, since the public
//! address changes whenever the instance is stopped and started. `autorun` therefore skips the
//! Route53 step for them.

use super::{Identity, Workload};
use crate::naming::Environment;
use crate::settings::Settings;
use color_eyre::Report;

#[derive(Clone, Copy, Debug, Default)]
pub struct Nginx;

impl Workload for Nginx {
    fn server_type(&self) -> Option<&str> {
        Some("nginx")
    }

    fn run_list(&self, _: Environment) -> Vec<String> {
        vec!["role[RoleNginx]".to_string()]
    }

    fn role_policies(&self, environment: Environment) -> Vec<String> {
        let mut p = vec![
            "allow-describe-tags".to_string(),
            "allow-get-nginx-config".to_string(),
            "allow-describe-elbs".to_string(),
        ];
        if environment != Environment::Test {
            p.push("allow-update-route53-{environment}".to_string());
            p.push("allow-modify-nginx-elbs-{environment}".to_string());
        }
        p
    }

    fn security_groups(&self, environment: Environment, _: &str) -> Option<Vec<String>> {
        let mut groups = vec!["chef-nodes".to_string()];
        if environment != Environment::Test {
            groups.push(format!("{}-nginx", environment.initial()));
        }
        Some(groups)
    }

    fn add_route53_dns(&self) -> bool {
        false
    }

    fn boot_script(&self, id: &Identity<'_>, settings: &Settings) -> Result<Option<String>, Report> {
        let zone = settings
            .dns
            .zones
            .iter()
            .find_map(|z| z.id.get(&id.environment))
            .ok_or_else(|| {
                eyre::eyre!(
                    "nginx servers need a hosted zone for {} to register in",
                    id.environment
                )
            })?;
        let zone = zone.trim_start_matches("/hostedzone/");

        Ok(Some(format!(
            r#"mkdir -p /root/route53
cat > /root/route53/upsert.sh <<'UPSERT_EOF'
#!/bin/bash
META_URL='http://169.254.169.254/latest/meta-data'
PUBLIC_HOSTNAME=`curl -s $META_URL/public-hostname`
cat > /root/route53/upsert.json <<EOT
{{
  "Comment": "Creating CNAME for {hostname}",
  "Changes": [
    {{
      "Action": "UPSERT",
      "ResourceRecordSet": {{
        "Name": "{hostname}.",
        "Type": "CNAME",
        "TTL": 60,
        "ResourceRecords": [{{ "Value": "$PUBLIC_HOSTNAME" }}]
      }}
    }}
  ]
}}
EOT
/usr/bin/aws route53 change-resource-record-sets --hosted-zone-id {zone} --change-batch file:///root/route53/upsert.json >> /root/route53/upsert.log 2>&1
UPSERT_EOF
chmod +x /root/route53/upsert.sh
/root/route53/upsert.sh
echo /root/route53/upsert.sh >> /etc/rc.local"#,
            hostname = id.hostname,
            zone = zone,
        )))
    }
}

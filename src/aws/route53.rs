//! DNS records for launched instances.

use super::ec2::InstanceInfo;
use crate::naming::Environment;
use crate::settings::{DnsRecord, DnsZone};
use color_eyre::Report;
use eyre::WrapErr;
use rusoto_route53::{Route53, Route53Client};
use std::collections::HashMap;
use std::time::Duration;
use tracing::instrument;
use tracing_futures::Instrument;

const CHANGE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Values a record template may reference.
#[derive(Clone, Debug, Default)]
pub struct RecordFields {
    pub hostname: String,
    pub name: String,
    pub instance: InstanceInfo,
}

impl RecordFields {
    /// The domain part of the hostname, i.e. everything after `{name}.`.
    pub fn dns_zone(&self) -> &str {
        self.hostname
            .strip_prefix(self.name.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or("")
    }

    fn to_map(&self) -> HashMap<&'static str, String> {
        let i = &self.instance;
        let opt = |s: &Option<String>| s.clone().unwrap_or_default();
        let mut m = HashMap::new();
        m.insert("hostname", self.hostname.clone());
        m.insert("name", self.name.clone());
        m.insert("instance_id", i.instance_id.clone());
        m.insert("vpc_id", opt(&i.vpc_id));
        m.insert("ip_address", opt(&i.public_ip));
        m.insert("dns_name", opt(&i.public_dns));
        m.insert("private_ip_address", opt(&i.private_ip));
        m.insert("private_dns_name", opt(&i.private_dns));
        m.insert("dns_zone", self.dns_zone().to_string());
        m
    }

    /// Fill in a record template.
    pub fn render(&self, record: &DnsRecord) -> Result<DnsRecord, Report> {
        let fields = self.to_map();
        Ok(DnsRecord {
            kind: record.kind.clone(),
            name: crate::naming::render(&record.name, &fields)?,
            value: crate::naming::render(&record.value, &fields)?,
            ttl: record.ttl,
        })
    }
}

fn same_name(a: &str, b: &str) -> bool {
    a.trim_end_matches('.')
        .eq_ignore_ascii_case(b.trim_end_matches('.'))
}

/// Create or replace every record of every zone for this instance.
#[instrument(level = "debug", skip(route53, zones, fields), fields(name = %fields.name))]
pub async fn route(
    route53: &Route53Client,
    environment: Environment,
    zones: &[DnsZone],
    fields: &RecordFields,
    wait: bool,
) -> Result<(), Report> {
    for zone in zones {
        let zone_id = match zone.id.get(&environment) {
            Some(id) => id.trim_start_matches("/hostedzone/"),
            None => {
                tracing::warn!(?zone, %environment, "hosted zone has no id for environment");
                continue;
            }
        };

        let span = tracing::debug_span!("zone", id = %zone_id);
        async {
            let hosted = route53
                .get_hosted_zone(rusoto_route53::GetHostedZoneRequest {
                    id: zone_id.to_string(),
                })
                .await
                .wrap_err_with(|| format!("failed to look up hosted zone {}", zone_id))?;
            tracing::info!(zone = %hosted.hosted_zone.name, "using hosted zone");

            for template in &zone.records {
                let record = fields.render(template)?;
                tracing::info!(?record, "adding DNS record");
                upsert(route53, zone_id, &record, wait).await?;
                tracing::info!(name = %record.name, "added DNS record");
            }
            Ok::<_, Report>(())
        }
        .instrument(span)
        .await?;
    }
    Ok(())
}

async fn upsert(
    route53: &Route53Client,
    zone_id: &str,
    record: &DnsRecord,
    wait: bool,
) -> Result<(), Report> {
    let existing = route53
        .list_resource_record_sets(rusoto_route53::ListResourceRecordSetsRequest {
            hosted_zone_id: zone_id.to_string(),
            start_record_name: Some(record.name.clone()),
            start_record_type: Some(record.kind.clone()),
            max_items: Some("1".to_string()),
            ..Default::default()
        })
        .await
        .wrap_err("failed to list existing records")?;
    if existing
        .resource_record_sets
        .iter()
        .any(|rrs| same_name(&rrs.name, &record.name) && rrs.type_ == record.kind)
    {
        tracing::info!("the DNS record already exists and will be replaced");
    }

    let res = route53
        .change_resource_record_sets(rusoto_route53::ChangeResourceRecordSetsRequest {
            hosted_zone_id: zone_id.to_string(),
            change_batch: rusoto_route53::ChangeBatch {
                comment: None,
                changes: vec![rusoto_route53::Change {
                    action: "UPSERT".to_string(),
                    resource_record_set: rusoto_route53::ResourceRecordSet {
                        name: record.name.clone(),
                        type_: record.kind.clone(),
                        ttl: Some(record.ttl),
                        resource_records: Some(vec![rusoto_route53::ResourceRecord {
                            value: record.value.clone(),
                        }]),
                        ..Default::default()
                    },
                }],
            },
        })
        .await
        .wrap_err_with(|| format!("failed to upsert {} record {}", record.kind, record.name))?;

    if !wait {
        return Ok(());
    }

    let change = res.change_info.id.trim_start_matches("/change/").to_string();
    let change = &change;
    wait_for_sync(res.change_info.status, CHANGE_POLL_INTERVAL, move || async move {
        let res = route53
            .get_change(rusoto_route53::GetChangeRequest { id: change.clone() })
            .await
            .wrap_err("failed to check DNS change status")?;
        Ok::<_, Report>(res.change_info.status)
    })
    .await
}

/// Call `poll` every `interval` until it reports `INSYNC`, starting from `status`.
async fn wait_for_sync<F, Fut>(mut status: String, interval: Duration, mut poll: F) -> Result<(), Report>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<String, Report>>,
{
    while status != "INSYNC" {
        tracing::debug!(%status, "waiting for DNS change to propagate");
        tokio::time::sleep(interval).await;
        status = poll().await?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn fields() -> RecordFields {
        RecordFields {
            hostname: "s-video-mongo-use1c-01.stage.example.com".into(),
            name: "s-video-mongo-use1c-01".into(),
            instance: InstanceInfo {
                instance_id: "i-0abc".into(),
                vpc_id: Some("vpc-1".into()),
                public_ip: None,
                public_dns: Some("ec2-1-2-3-4.compute-1.amazonaws.com".into()),
                private_ip: Some("10.0.0.7".into()),
                private_dns: Some("ip-10-0-0-7.ec2.internal".into()),
            },
        }
    }

    #[test]
    fn dns_zone_is_hostname_suffix() {
        assert_eq!(fields().dns_zone(), "stage.example.com");
        let f = RecordFields {
            hostname: "other".into(),
            name: "s-video-mongo-use1c-01".into(),
            ..Default::default()
        };
        assert_eq!(f.dns_zone(), "");
    }

    #[test]
    fn renders_records() -> Result<(), Report> {
        let f = fields();
        let cname = f.render(&DnsRecord {
            kind: "CNAME".into(),
            name: "{name}.external.{dns_zone}.".into(),
            value: "{dns_name}".into(),
            ttl: 60,
        })?;
        assert_eq!(cname.name, "s-video-mongo-use1c-01.external.stage.example.com.");
        assert_eq!(cname.value, "ec2-1-2-3-4.compute-1.amazonaws.com");

        let a = f.render(&DnsRecord {
            kind: "A".into(),
            name: "{hostname}.".into(),
            value: "{private_ip_address}".into(),
            ttl: 300,
        })?;
        assert_eq!(a.name, "s-video-mongo-use1c-01.stage.example.com.");
        assert_eq!(a.value, "10.0.0.7");
        assert_eq!(a.ttl, 300);

        // no public address renders empty
        let ip = f.render(&DnsRecord {
            kind: "A".into(),
            name: "{instance_id}".into(),
            value: "{ip_address}".into(),
            ttl: 60,
        })?;
        assert_eq!(ip.name, "i-0abc");
        assert_eq!(ip.value, "");
        Ok(())
    }

    #[test]
    fn unknown_field_is_rejected() {
        let r = fields().render(&DnsRecord {
            kind: "A".into(),
            name: "{nope}".into(),
            value: "x".into(),
            ttl: 60,
        });
        assert!(r.is_err());
    }

    fn statuses(
        mut seq: Vec<Result<String, Report>>,
    ) -> (
        std::rc::Rc<std::cell::Cell<usize>>,
        impl FnMut() -> futures_util::future::Ready<Result<String, Report>>,
    ) {
        let polls = std::rc::Rc::new(std::cell::Cell::new(0));
        let counter = polls.clone();
        seq.reverse();
        let poll = move || {
            counter.set(counter.get() + 1);
            futures_util::future::ready(seq.pop().unwrap_or_else(|| Ok("INSYNC".into())))
        };
        (polls, poll)
    }

    #[test]
    fn waits_until_in_sync() -> Result<(), Report> {
        let rt = tokio::runtime::Runtime::new()?;
        let (polls, poll) = statuses(vec![Ok("PENDING".into()), Ok("INSYNC".into())]);
        rt.block_on(wait_for_sync("PENDING".into(), Duration::from_millis(0), poll))?;
        assert_eq!(polls.get(), 2);

        let (polls, poll) = statuses(vec![]);
        rt.block_on(wait_for_sync("INSYNC".into(), Duration::from_millis(0), poll))?;
        assert_eq!(polls.get(), 0);
        Ok(())
    }

    #[test]
    fn poll_failure_stops_waiting() -> Result<(), Report> {
        let rt = tokio::runtime::Runtime::new()?;
        let (polls, poll) = statuses(vec![
            Ok("PENDING".into()),
            Err(eyre::eyre!("throttled")),
            Ok("INSYNC".into()),
        ]);
        let r = rt.block_on(wait_for_sync("PENDING".into(), Duration::from_millis(0), poll));
        assert!(r.is_err());
        assert_eq!(polls.get(), 2);
        Ok(())
    }

    #[test]
    fn record_names_compare_loosely() {
        assert!(same_name("A.example.com.", "a.example.com"));
        assert!(!same_name("a.example.com.", "b.example.com."));
    }
}

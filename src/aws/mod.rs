//! AWS plumbing, built on [rusoto](https://crates.io/crates/rusoto_core).
//!
//! [`Clients`] bundles one client per service a server touches. EC2 and Auto Scaling are
//! regional; IAM, Route53 and STS are global and always talk to `us-east-1`.

use color_eyre::Report;
use educe::Educe;
use eyre::WrapErr;
use rusoto_core::credential::ProvideAwsCredentials;
use rusoto_core::request::HttpClient;
pub use rusoto_core::Region;
use tracing::instrument;

pub mod autoscaling;
pub mod ec2;
pub mod iam;
pub mod route53;

/// Service clients for one region.
#[derive(Clone, Educe)]
#[educe(Debug)]
pub struct Clients {
    pub region: Region,
    #[educe(Debug(ignore))]
    pub ec2: rusoto_ec2::Ec2Client,
    #[educe(Debug(ignore))]
    pub iam: rusoto_iam::IamClient,
    #[educe(Debug(ignore))]
    pub route53: rusoto_route53::Route53Client,
    #[educe(Debug(ignore))]
    pub sts: rusoto_sts::StsClient,
    #[educe(Debug(ignore))]
    pub autoscaling: rusoto_autoscaling::AutoscalingClient,
}

impl Clients {
    /// Connect to every service, asking `provider` for a fresh credentials provider per client.
    #[instrument(level = "debug", skip(provider))]
    pub fn connect<P, F>(region: Region, provider: F) -> Result<Self, Report>
    where
        F: Fn() -> Result<P, Report>,
        P: ProvideAwsCredentials + Send + Sync + 'static,
    {
        let http = || HttpClient::new().wrap_err("failed to construct new http client");

        tracing::debug!("connecting to ec2");
        let ec2 = rusoto_ec2::Ec2Client::new_with(http()?, provider()?, region.clone());
        tracing::debug!("connecting to iam");
        let iam = rusoto_iam::IamClient::new_with(http()?, provider()?, Region::UsEast1);
        tracing::debug!("connecting to route53");
        let route53 =
            rusoto_route53::Route53Client::new_with(http()?, provider()?, Region::UsEast1);
        let sts = rusoto_sts::StsClient::new_with(http()?, provider()?, Region::UsEast1);
        tracing::debug!("connecting to autoscaling");
        let autoscaling =
            rusoto_autoscaling::AutoscalingClient::new_with(http()?, provider()?, region.clone());

        Ok(Clients {
            region,
            ec2,
            iam,
            route53,
            sts,
            autoscaling,
        })
    }
}

/// Build an EC2-style `name=values` filter.
pub(crate) fn filter(name: &str, values: &[&str]) -> rusoto_ec2::Filter {
    rusoto_ec2::Filter {
        name: Some(name.to_string()),
        values: Some(values.iter().map(|v| v.to_string()).collect()),
    }
}

//! RabbitMQ brokers, backed by a provisioned-IOPS data volume.

use super::{Identity, Workload};
use crate::chef::Attributes;
use crate::error::ValidationError;
use crate::naming::Environment;
use color_eyre::Report;
use educe::Educe;

/// The highest IOPS-per-GiB EBS allows for provisioned volumes.
pub const MAX_IOPS_RATIO: u32 = 30;

pub const DEFAULT_VOLUME_IOPS: u32 = 500;
pub const DEFAULT_VOLUME_SIZE: u32 = 100;

#[derive(Clone, Educe)]
#[educe(Debug)]
pub struct RabbitMq {
    user: String,
    #[educe(Debug(ignore))]
    password: String,
    volume_iops: u32,
    volume_size: u32,
}

impl RabbitMq {
    /// Both the broker user and its password are required.
    pub fn new(user: Option<String>, password: Option<String>) -> Result<Self, Report> {
        let user = user.ok_or(ValidationError::MissingCredential("rabbit user"))?;
        let password = password.ok_or(ValidationError::MissingCredential("rabbit password"))?;
        Ok(RabbitMq {
            user,
            password,
            volume_iops: DEFAULT_VOLUME_IOPS,
            volume_size: DEFAULT_VOLUME_SIZE,
        })
    }

    /// Size the data volume: `iops` provisioned IOPS on `size` GiB.
    pub fn volume(mut self, iops: u32, size: u32) -> Self {
        self.volume_iops = iops;
        self.volume_size = size;
        self
    }
}

impl Workload for RabbitMq {
    fn server_type(&self) -> Option<&str> {
        Some("rabbit")
    }

    fn run_list(&self, _: Environment) -> Vec<String> {
        vec!["role[RoleRabbit]".to_string()]
    }

    fn role_policies(&self, _: Environment) -> Vec<String> {
        vec![
            "allow-describe-tags".to_string(),
            "allow-volume-control".to_string(),
            "allow-update-route53-{environment}".to_string(),
        ]
    }

    fn validate(&self) -> Result<(), Report> {
        eyre::ensure!(self.volume_size > 0, "rabbit volume size must be positive");
        let ratio = self.volume_iops / self.volume_size;
        tracing::info!(ratio, "IOPS to size ratio");
        if ratio > MAX_IOPS_RATIO {
            tracing::error!("the IOPS to size ratio is greater than {}", MAX_IOPS_RATIO);
            return Err(ValidationError::IopsRatio {
                ratio,
                max: MAX_IOPS_RATIO,
            }
            .into());
        }
        Ok(())
    }

    fn attributes(&self, _: &Identity<'_>, attributes: &mut Attributes) {
        attributes
            .set_dotted("rabbitmq.volumes.iops", self.volume_iops)
            .set_dotted("rabbitmq.volumes.size", self.volume_size)
            .set_dotted("rabbitmq.user", self.user.as_str())
            .set_dotted("rabbitmq.passwd", self.password.as_str());
        tracing::info!(
            iops = self.volume_iops,
            size = self.volume_size,
            user = %self.user,
            "set the rabbitmq attributes"
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::workloads::test::identity;
    use serde_json::json;

    #[test]
    fn credentials_required() {
        let e = RabbitMq::new(None, Some("pw".into())).unwrap_err();
        assert_eq!(
            e.downcast_ref::<ValidationError>(),
            Some(&ValidationError::MissingCredential("rabbit user"))
        );
        let e = RabbitMq::new(Some("guest".into()), None).unwrap_err();
        assert_eq!(
            e.downcast_ref::<ValidationError>(),
            Some(&ValidationError::MissingCredential("rabbit password"))
        );
    }

    #[test]
    fn iops_ratio() -> Result<(), Report> {
        let r = RabbitMq::new(Some("guest".into()), Some("pw".into()))?;
        r.validate()?;
        // 3000 / 100 is exactly the limit
        r.clone().volume(3000, 100).validate()?;
        let e = r.clone().volume(3100, 100).validate().unwrap_err();
        assert_eq!(
            e.downcast_ref::<ValidationError>(),
            Some(&ValidationError::IopsRatio { ratio: 31, max: 30 })
        );
        assert!(r.volume(100, 0).validate().is_err());
        Ok(())
    }

    #[test]
    fn attributes_and_redaction() -> Result<(), Report> {
        let r = RabbitMq::new(Some("guest".into()), Some("hunter2".into()))?;
        let id = identity(Environment::Stage, "rabbit", "s-video-rabbit");
        let mut attrs = Attributes::default();
        r.attributes(&id, &mut attrs);
        assert_eq!(attrs.get_dotted("rabbitmq.volumes.iops"), Some(&json!(500)));
        assert_eq!(attrs.get_dotted("rabbitmq.volumes.size"), Some(&json!(100)));
        assert_eq!(attrs.get_dotted("rabbitmq.user"), Some(&json!("guest")));
        assert_eq!(attrs.get_dotted("rabbitmq.passwd"), Some(&json!("hunter2")));
        assert!(!format!("{:?}", r).contains("hunter2"));
        Ok(())
    }
}

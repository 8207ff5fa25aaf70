//! Typed input-validation failures.
//!
//! Everything else in this crate reports errors through [`color_eyre::Report`]. The variants here
//! are wrapped in a `Report` too, but callers that care about *why* configuration was rejected
//! can recover them with [`Report::downcast_ref`](color_eyre::Report::downcast_ref).

use thiserror::Error;

/// A server description that cannot be provisioned as given.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("a group must be specified")]
    MissingGroup,
    #[error("\"{0}\" is not a valid EC2 region")]
    InvalidRegion(String),
    #[error("\"{0}\" is not a valid AMI")]
    InvalidAmi(String),
    #[error("\"{0}\" is not a valid EC2 keypair")]
    InvalidKeyPair(String),
    #[error("\"{0}\" is not a valid EC2 availability zone")]
    InvalidAvailabilityZone(String),
    #[error("no subnets returned for {0}")]
    NoSubnetReturned(String),
    #[error("more than one subnet returned for {0}")]
    MultipleSubnetsReturned(String),
    #[error("no security group named {0}")]
    NoSecurityGroupsReturned(String),
    #[error("more than one security group named {0}")]
    MultipleSecurityGroupsReturned(String),
    #[error("no free index left for names starting with {0}")]
    IndexesExhausted(String),
    #[error("the IOPS to size ratio {ratio} is greater than {max}")]
    IopsRatio { ratio: u32, max: u32 },
    #[error("{0} must be provided")]
    MissingCredential(&'static str),
    #[error("unknown environment \"{0}\"")]
    UnknownEnvironment(String),
}

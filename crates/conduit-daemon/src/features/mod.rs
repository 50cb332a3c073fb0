pub mod health;
pub mod instance_lifecycle;
pub mod observability;
pub mod policy;
pub mod provisioning;

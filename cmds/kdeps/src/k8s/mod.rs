//! Kubernetes access through kube-rs.

pub mod client;
pub mod query;

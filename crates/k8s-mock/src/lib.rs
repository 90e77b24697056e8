//! Mock Kubernetes API server for testing.
//!
//! Provides an HTTP server that can be used with kubeconfig-based connections.

pub mod catalog;
pub mod http;

pub use http::{namespace, HttpMockK8sServer, RunningHttpMockK8sServer};

//! Readiness predicates for each supported resource kind.
//!
//! Predicates only read cluster state through [`ResourceQuery`], they never mutate it.

use std::{collections::BTreeMap, error::Error as StdError, sync::Arc};

use thiserror::Error;
use tracing::{info, instrument};

use crate::dependency::ResourceKind;

/// Result of a successful probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
	Ready,
	NotReady,
}

impl From<bool> for Readiness {
	fn from(ready: bool) -> Self {
		if ready {
			Readiness::Ready
		} else {
			Readiness::NotReady
		}
	}
}

/// Errors returned by a [`ResourceQuery`].
#[derive(Debug, Clone, Error)]
pub enum QueryError {
	#[error("the {kind} {namespace}/{name} doesn't exist")]
	NotFound {
		kind: ResourceKind,
		namespace: String,
		name: String,
	},

	#[error("{0} has no replica counts")]
	NoReplicaCounts(ResourceKind),

	#[error("querying {target}")]
	Transport {
		target: String,
		#[source]
		source: Arc<dyn StdError + Send + Sync>,
	},
}

impl QueryError {
	pub fn not_found(kind: ResourceKind, namespace: &str, name: &str) -> Self {
		QueryError::NotFound {
			kind,
			namespace: namespace.to_string(),
			name: name.to_string(),
		}
	}

	pub fn transport(
		target: impl Into<String>,
		source: impl StdError + Send + Sync + 'static,
	) -> Self {
		QueryError::Transport {
			target: target.into(),
			source: Arc::new(source),
		}
	}
}

/// Status of a single container, reduced to what pod readiness needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSnapshot {
	pub name: String,
	pub ready: bool,
	pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PodSnapshot {
	pub name: String,
	pub phase: Option<String>,
	pub containers: Vec<ContainerSnapshot>,
}

impl PodSnapshot {
	/// Running, with every container both ready and in the running state.
	pub fn is_ready(&self) -> bool {
		self.phase.as_deref() == Some("Running")
			&& self.containers.iter().all(|c| c.ready && c.running)
	}
}

/// Ready and desired replica counts of a workload controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplicaCounts {
	pub ready: i32,
	pub desired: i32,
}

impl ReplicaCounts {
	pub fn is_ready(self) -> bool {
		self.ready == self.desired
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceSnapshot {
	/// Pod label selector, empty when the service sets none.
	pub selector: BTreeMap<String, String>,
}

/// Read access to cluster state needed by the readiness predicates.
#[allow(async_fn_in_trait)]
pub trait ResourceQuery {
	async fn pod(&self, namespace: &str, name: &str) -> Result<PodSnapshot, QueryError>;

	/// Counts for one of the workload controller kinds.
	async fn replica_counts(
		&self,
		kind: ResourceKind,
		namespace: &str,
		name: &str,
	) -> Result<ReplicaCounts, QueryError>;

	async fn service(&self, namespace: &str, name: &str) -> Result<ServiceSnapshot, QueryError>;

	async fn pods_by_selector(
		&self,
		namespace: &str,
		selector: &BTreeMap<String, String>,
	) -> Result<Vec<PodSnapshot>, QueryError>;

	async fn namespace_exists(&self, namespace: &str) -> Result<bool, QueryError>;
}

impl ResourceKind {
	/// Run the readiness predicate of this kind against a named resource.
	#[instrument(level = "debug", skip(self, query, verbose), fields(kind = %self))]
	pub async fn probe<Q: ResourceQuery>(
		self,
		query: &Q,
		namespace: &str,
		name: &str,
		verbose: bool,
	) -> Result<Readiness, QueryError> {
		match self {
			ResourceKind::Pod => Ok(query.pod(namespace, name).await?.is_ready().into()),
			ResourceKind::Deployment
			| ResourceKind::DaemonSet
			| ResourceKind::ReplicaSet
			| ResourceKind::ReplicationController
			| ResourceKind::StatefulSet => {
				let counts = query.replica_counts(self, namespace, name).await?;
				if verbose {
					info!(
						"{} {namespace}/{name} has {}/{} ready",
						self, counts.ready, counts.desired
					);
				}
				Ok(counts.is_ready().into())
			}
			ResourceKind::Service => probe_service(query, namespace, name, verbose).await,
		}
	}
}

/// A service is ready when every pod matched by its selector is ready.
///
/// A service matching no pods is ready. An empty selector lists every pod in the
/// namespace, as the API server does for an empty `labelSelector`.
async fn probe_service<Q: ResourceQuery>(
	query: &Q,
	namespace: &str,
	name: &str,
	verbose: bool,
) -> Result<Readiness, QueryError> {
	let service = query.service(namespace, name).await?;
	let pods = query.pods_by_selector(namespace, &service.selector).await?;
	let mut ready = 0;

	for pod in &pods {
		if verbose {
			info!(
				"check service {namespace}/{name}, pod: {} status: {}",
				pod.name,
				pod.phase.as_deref().unwrap_or("Unknown")
			);
		}

		if pod.is_ready() {
			ready += 1;
			if verbose {
				info!("service {namespace}/{name}, pod: {} is ready", pod.name);
			}
		} else if verbose {
			info!("service {namespace}/{name}, pod: {} not ready", pod.name);
		}
	}

	Ok((ready == pods.len()).into())
}

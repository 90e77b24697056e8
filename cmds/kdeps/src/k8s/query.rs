//! [`ResourceQuery`] backed by the Kubernetes API.

use std::{collections::BTreeMap, fmt::Debug};

use k8s_openapi::{
	api::{
		apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
		core::v1::{Namespace, Pod, ReplicationController, Service},
	},
	NamespaceResourceScope,
};
use kube::{api::ListParams, Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::{
	dependency::ResourceKind,
	readiness::{
		ContainerSnapshot, PodSnapshot, QueryError, ReplicaCounts, ResourceQuery, ServiceSnapshot,
	},
};

/// Reads resources with a kube [`Client`].
#[derive(Clone)]
pub struct KubeResourceQuery {
	client: Client,
}

impl KubeResourceQuery {
	pub fn new(client: Client) -> Self {
		Self { client }
	}

	async fn fetch<K>(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<K, QueryError>
	where
		K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
		<K as Resource>::DynamicType: Default,
	{
		let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
		api.get_opt(name)
			.await
			.map_err(|err| QueryError::transport(format!("{kind} {namespace}/{name}"), err))?
			.ok_or_else(|| QueryError::not_found(kind, namespace, name))
	}
}

impl From<&Pod> for PodSnapshot {
	fn from(pod: &Pod) -> Self {
		let status = pod.status.as_ref();
		let containers = status
			.and_then(|s| s.container_statuses.as_ref())
			.map(|statuses| {
				statuses
					.iter()
					.map(|c| ContainerSnapshot {
						name: c.name.clone(),
						ready: c.ready,
						running: c.state.as_ref().is_some_and(|s| s.running.is_some()),
					})
					.collect()
			})
			.unwrap_or_default();

		PodSnapshot {
			name: pod.metadata.name.clone().unwrap_or_default(),
			phase: status.and_then(|s| s.phase.clone()),
			containers,
		}
	}
}

/// Format an equality-based label selector, `k1=v1,k2=v2`.
fn label_selector(selector: &BTreeMap<String, String>) -> String {
	selector
		.iter()
		.map(|(k, v)| format!("{k}={v}"))
		.collect::<Vec<_>>()
		.join(",")
}

impl ResourceQuery for KubeResourceQuery {
	#[instrument(level = "debug", skip(self))]
	async fn pod(&self, namespace: &str, name: &str) -> Result<PodSnapshot, QueryError> {
		let pod: Pod = self.fetch(ResourceKind::Pod, namespace, name).await?;
		Ok(PodSnapshot::from(&pod))
	}

	#[instrument(level = "debug", skip(self))]
	async fn replica_counts(
		&self,
		kind: ResourceKind,
		namespace: &str,
		name: &str,
	) -> Result<ReplicaCounts, QueryError> {
		// Absent counts read as zero.
		let counts = match kind {
			ResourceKind::Deployment => {
				let d: Deployment = self.fetch(kind, namespace, name).await?;
				d.status.map_or_else(ReplicaCounts::default, |s| ReplicaCounts {
					ready: s.ready_replicas.unwrap_or(0),
					desired: s.replicas.unwrap_or(0),
				})
			}
			ResourceKind::DaemonSet => {
				let ds: DaemonSet = self.fetch(kind, namespace, name).await?;
				ds.status.map_or_else(ReplicaCounts::default, |s| ReplicaCounts {
					ready: s.number_ready,
					desired: s.desired_number_scheduled,
				})
			}
			ResourceKind::ReplicaSet => {
				let rs: ReplicaSet = self.fetch(kind, namespace, name).await?;
				rs.status.map_or_else(ReplicaCounts::default, |s| ReplicaCounts {
					ready: s.ready_replicas.unwrap_or(0),
					desired: s.replicas,
				})
			}
			ResourceKind::ReplicationController => {
				let rc: ReplicationController = self.fetch(kind, namespace, name).await?;
				rc.status.map_or_else(ReplicaCounts::default, |s| ReplicaCounts {
					ready: s.ready_replicas.unwrap_or(0),
					desired: s.replicas,
				})
			}
			ResourceKind::StatefulSet => {
				let sts: StatefulSet = self.fetch(kind, namespace, name).await?;
				sts.status.map_or_else(ReplicaCounts::default, |s| ReplicaCounts {
					ready: s.ready_replicas.unwrap_or(0),
					desired: s.replicas,
				})
			}
			ResourceKind::Pod | ResourceKind::Service => {
				return Err(QueryError::NoReplicaCounts(kind));
			}
		};

		debug!(ready = counts.ready, desired = counts.desired, "replica counts");
		Ok(counts)
	}

	#[instrument(level = "debug", skip(self))]
	async fn service(&self, namespace: &str, name: &str) -> Result<ServiceSnapshot, QueryError> {
		let service: Service = self.fetch(ResourceKind::Service, namespace, name).await?;
		Ok(ServiceSnapshot {
			selector: service
				.spec
				.and_then(|spec| spec.selector)
				.unwrap_or_default(),
		})
	}

	#[instrument(level = "debug", skip(self))]
	async fn pods_by_selector(
		&self,
		namespace: &str,
		selector: &BTreeMap<String, String>,
	) -> Result<Vec<PodSnapshot>, QueryError> {
		let selector = label_selector(selector);
		let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
		let pods = api
			.list(&ListParams::default().labels(&selector))
			.await
			.map_err(|err| QueryError::transport(format!("pods {namespace} ({selector})"), err))?;

		Ok(pods.items.iter().map(PodSnapshot::from).collect())
	}

	#[instrument(level = "debug", skip(self))]
	async fn namespace_exists(&self, namespace: &str) -> Result<bool, QueryError> {
		let api: Api<Namespace> = Api::all(self.client.clone());
		let found = api
			.get_opt(namespace)
			.await
			.map_err(|err| QueryError::transport(format!("namespace {namespace}"), err))?;
		Ok(found.is_some())
	}
}

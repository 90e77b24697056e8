//! In-memory cluster for unit tests.

use std::{
	collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
	io,
	sync::Mutex,
};

use crate::{
	dependency::ResourceKind,
	readiness::{
		ContainerSnapshot, PodSnapshot, QueryError, ReplicaCounts, ResourceQuery, ServiceSnapshot,
	},
};

/// What the fake cluster answers to a lookup.
#[derive(Debug, Clone)]
pub enum Reply {
	Pod(PodSnapshot),
	Replicas(ReplicaCounts),
	Service(ServiceSnapshot),
	Fail(String),
}

type Key = (ResourceKind, String, String);

/// Scripted cluster state.
///
/// Each resource answers with a queue of replies; the last reply repeats forever.
#[derive(Default)]
pub struct FakeCluster {
	namespaces: BTreeSet<String>,
	namespace_lookup_fails: bool,
	replies: Mutex<HashMap<Key, VecDeque<Reply>>>,
	labeled_pods: Vec<(String, BTreeMap<String, String>, PodSnapshot)>,
	lookups: Mutex<HashMap<Key, usize>>,
}

/// Build a pod snapshot; each container is given as `(ready, running)`.
pub fn pod(name: &str, phase: &str, containers: &[(bool, bool)]) -> PodSnapshot {
	PodSnapshot {
		name: name.to_string(),
		phase: Some(phase.to_string()),
		containers: containers
			.iter()
			.enumerate()
			.map(|(i, &(ready, running))| ContainerSnapshot {
				name: format!("c{i}"),
				ready,
				running,
			})
			.collect(),
	}
}

fn key(kind: ResourceKind, namespace: &str, name: &str) -> Key {
	(kind, namespace.to_string(), name.to_string())
}

impl FakeCluster {
	pub fn with_namespace(mut self, namespace: &str) -> Self {
		self.namespaces.insert(namespace.to_string());
		self
	}

	pub fn with_namespace_lookup_failure(mut self) -> Self {
		self.namespace_lookup_fails = true;
		self
	}

	pub fn with_replies(
		self,
		kind: ResourceKind,
		namespace: &str,
		name: &str,
		replies: impl IntoIterator<Item = Reply>,
	) -> Self {
		self.replies
			.lock()
			.unwrap()
			.insert(key(kind, namespace, name), replies.into_iter().collect());
		self
	}

	pub fn with_pod(self, namespace: &str, pod: PodSnapshot) -> Self {
		let name = pod.name.clone();
		self.with_replies(ResourceKind::Pod, namespace, &name, [Reply::Pod(pod)])
	}

	pub fn with_replicas(
		self,
		kind: ResourceKind,
		namespace: &str,
		name: &str,
		ready: i32,
		desired: i32,
	) -> Self {
		self.with_replies(
			kind,
			namespace,
			name,
			[Reply::Replicas(ReplicaCounts { ready, desired })],
		)
	}

	pub fn with_service(self, namespace: &str, name: &str, selector: &[(&str, &str)]) -> Self {
		let selector = selector
			.iter()
			.map(|(k, v)| ((*k).to_string(), (*v).to_string()))
			.collect();
		self.with_replies(
			ResourceKind::Service,
			namespace,
			name,
			[Reply::Service(ServiceSnapshot { selector })],
		)
	}

	pub fn with_labeled_pod(
		mut self,
		namespace: &str,
		labels: &[(&str, &str)],
		pod: PodSnapshot,
	) -> Self {
		let labels = labels
			.iter()
			.map(|(k, v)| ((*k).to_string(), (*v).to_string()))
			.collect();
		self.labeled_pods.push((namespace.to_string(), labels, pod));
		self
	}

	/// Number of lookups made for a resource so far.
	pub fn lookups(&self, kind: ResourceKind, namespace: &str, name: &str) -> usize {
		self.lookups
			.lock()
			.unwrap()
			.get(&key(kind, namespace, name))
			.copied()
			.unwrap_or(0)
	}

	fn next_reply(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Reply, QueryError> {
		let key = key(kind, namespace, name);
		*self.lookups.lock().unwrap().entry(key.clone()).or_default() += 1;

		let mut replies = self.replies.lock().unwrap();
		let queue = replies
			.get_mut(&key)
			.ok_or_else(|| QueryError::not_found(kind, namespace, name))?;
		let reply = if queue.len() > 1 {
			queue.pop_front()
		} else {
			queue.front().cloned()
		};
		let reply = reply.ok_or_else(|| QueryError::not_found(kind, namespace, name))?;

		match reply {
			Reply::Fail(message) => Err(QueryError::transport(
				format!("{kind} {namespace}/{name}"),
				io::Error::other(message),
			)),
			reply => Ok(reply),
		}
	}
}

impl ResourceQuery for FakeCluster {
	async fn pod(&self, namespace: &str, name: &str) -> Result<PodSnapshot, QueryError> {
		match self.next_reply(ResourceKind::Pod, namespace, name)? {
			Reply::Pod(pod) => Ok(pod),
			other => panic!("unexpected reply for pod {namespace}/{name}: {other:?}"),
		}
	}

	async fn replica_counts(
		&self,
		kind: ResourceKind,
		namespace: &str,
		name: &str,
	) -> Result<ReplicaCounts, QueryError> {
		match self.next_reply(kind, namespace, name)? {
			Reply::Replicas(counts) => Ok(counts),
			other => panic!("unexpected reply for {kind} {namespace}/{name}: {other:?}"),
		}
	}

	async fn service(&self, namespace: &str, name: &str) -> Result<ServiceSnapshot, QueryError> {
		match self.next_reply(ResourceKind::Service, namespace, name)? {
			Reply::Service(service) => Ok(service),
			other => panic!("unexpected reply for service {namespace}/{name}: {other:?}"),
		}
	}

	async fn pods_by_selector(
		&self,
		namespace: &str,
		selector: &BTreeMap<String, String>,
	) -> Result<Vec<PodSnapshot>, QueryError> {
		Ok(self
			.labeled_pods
			.iter()
			.filter(|(ns, labels, _)| {
				ns == namespace && selector.iter().all(|(k, v)| labels.get(k) == Some(v))
			})
			.map(|(_, _, pod)| pod.clone())
			.collect())
	}

	async fn namespace_exists(&self, namespace: &str) -> Result<bool, QueryError> {
		if self.namespace_lookup_fails {
			return Err(QueryError::transport(
				format!("namespace {namespace}"),
				io::Error::other("connection refused"),
			));
		}
		Ok(self.namespaces.contains(namespace))
	}
}

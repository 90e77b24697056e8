//! Resource kinds the mock server knows how to route.

use std::sync::LazyLock;

use k8s_openapi::{
	api::{
		apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
		core::v1::{Namespace, Pod, ReplicationController, Service},
	},
	Resource,
};

/// A served kind and where its collection lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindInfo {
	pub api_version: &'static str,
	pub kind: &'static str,
	/// Last path segment of the collection, e.g. `deployments`.
	pub plural: &'static str,
	pub namespaced: bool,
}

impl KindInfo {
	fn of<K: Resource>(namespaced: bool) -> Self {
		Self {
			api_version: K::API_VERSION,
			kind: K::KIND,
			plural: K::URL_PATH_SEGMENT,
			namespaced,
		}
	}

	/// Collection path, e.g. `/apis/apps/v1/namespaces/default/deployments`.
	///
	/// Namespaced kinds without a namespace land in `default`.
	pub fn collection_path(&self, namespace: Option<&str>) -> String {
		let root = if self.api_version.contains('/') {
			format!("/apis/{}", self.api_version)
		} else {
			format!("/api/{}", self.api_version)
		};

		if self.namespaced {
			let ns = namespace.unwrap_or("default");
			format!("{root}/namespaces/{ns}/{}", self.plural)
		} else {
			format!("{root}/{}", self.plural)
		}
	}
}

static CATALOG: LazyLock<Vec<KindInfo>> = LazyLock::new(|| {
	vec![
		KindInfo::of::<Namespace>(false),
		KindInfo::of::<Pod>(true),
		KindInfo::of::<Service>(true),
		KindInfo::of::<ReplicationController>(true),
		KindInfo::of::<Deployment>(true),
		KindInfo::of::<DaemonSet>(true),
		KindInfo::of::<ReplicaSet>(true),
		KindInfo::of::<StatefulSet>(true),
	]
});

/// Look up a kind by `apiVersion` and `kind`.
pub fn lookup(api_version: &str, kind: &str) -> Option<&'static KindInfo> {
	CATALOG
		.iter()
		.find(|k| k.api_version == api_version && k.kind == kind)
}

/// Whether `segment` names a served collection.
pub fn is_plural(segment: &str) -> bool {
	CATALOG.iter().any(|k| k.plural == segment)
}

/// Collection path and name of a manifest, `None` for unknown kinds or a missing name.
pub fn locate(manifest: &serde_json::Value) -> Option<(String, String)> {
	let api_version = manifest.get("apiVersion")?.as_str()?;
	let kind = manifest.get("kind")?.as_str()?;
	let metadata = manifest.get("metadata")?;
	let name = metadata.get("name")?.as_str()?;
	let namespace = metadata.get("namespace").and_then(|n| n.as_str());

	let info = lookup(api_version, kind)?;
	Some((info.collection_path(namespace), name.to_string()))
}

//! HTTP-based mock Kubernetes server using wiremock.
//!
//! Serves GET requests for single resources and collections out of an in-memory store,
//! so a real kube client built from [`RunningHttpMockK8sServer::kubeconfig`] can talk to it.
//! The store can be changed while the server runs to simulate rollouts.

use std::{
	collections::HashMap,
	sync::{Arc, PoisonError, RwLock},
};

use bon::Builder;
use kube::config::{
	AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use serde_json::{json, Value};
use tracing::{debug, trace, warn};
use wiremock::{
	matchers::{method, path, path_regex},
	Mock, MockServer, Request, ResponseTemplate,
};

use crate::catalog;

/// Resources keyed by (collection path, name).
pub type SharedResources = Arc<RwLock<HashMap<(String, String), Value>>>;

/// A mock Kubernetes server exposed over HTTP.
#[derive(Builder)]
pub struct HttpMockK8sServer {
	/// Manifests to serve. Paths are derived from apiVersion/kind.
	#[builder(default)]
	resources: Vec<Value>,
	/// Namespaces to create on top of `default`.
	#[builder(default)]
	namespaces: Vec<String>,
}

/// A running HTTP mock server instance.
pub struct RunningHttpMockK8sServer {
	server: MockServer,
	resources: SharedResources,
}

/// Namespace manifest.
pub fn namespace(name: &str) -> Value {
	json!({
		"apiVersion": "v1",
		"kind": "Namespace",
		"metadata": {"name": name}
	})
}

impl HttpMockK8sServer {
	/// Start the mock server with all configured resources.
	pub async fn start(self) -> RunningHttpMockK8sServer {
		let server = MockServer::start().await;
		debug!(uri = %server.uri(), "started mock K8s server");

		let running = RunningHttpMockK8sServer {
			server,
			resources: SharedResources::default(),
		};

		let namespaces = std::iter::once("default".to_string())
			.chain(self.namespaces)
			.map(|name| namespace(&name));
		for manifest in namespaces.chain(self.resources) {
			running.upsert(manifest);
		}

		mount_version(&running.server).await;
		mount_resources(&running.server, &running.resources).await;

		running
	}
}

impl RunningHttpMockK8sServer {
	/// Get the server's URI (e.g., "http://127.0.0.1:12345").
	pub fn uri(&self) -> String {
		self.server.uri()
	}

	/// Insert or replace a manifest. Unknown kinds are ignored.
	pub fn upsert(&self, manifest: Value) {
		let Some(key) = catalog::locate(&manifest) else {
			warn!(?manifest, "ignoring manifest of unknown kind");
			return;
		};
		trace!(path = %key.0, name = %key.1, "stored resource");
		self.resources
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(key, manifest);
	}

	/// Create a Kubeconfig pointing to this mock server.
	pub fn kubeconfig(&self) -> Kubeconfig {
		self.kubeconfig_with_context("mock-context")
	}

	/// Create a Kubeconfig pointing to this mock server with a custom context name.
	pub fn kubeconfig_with_context(&self, context_name: &str) -> Kubeconfig {
		const CLUSTER: &str = "mock-cluster";
		const USER: &str = "mock-user";

		Kubeconfig {
			clusters: vec![NamedCluster {
				name: CLUSTER.to_string(),
				cluster: Some(Cluster {
					server: Some(self.uri()),
					insecure_skip_tls_verify: Some(true),
					..Default::default()
				}),
			}],
			contexts: vec![NamedContext {
				name: context_name.to_string(),
				context: Some(Context {
					cluster: CLUSTER.to_string(),
					user: Some(USER.to_string()),
					namespace: Some("default".to_string()),
					..Default::default()
				}),
			}],
			auth_infos: vec![NamedAuthInfo {
				name: USER.to_string(),
				auth_info: Some(AuthInfo::default()),
			}],
			current_context: Some(context_name.to_string()),
			..Default::default()
		}
	}
}

async fn mount_version(server: &MockServer) {
	Mock::given(method("GET"))
		.and(path("/version"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"major": "1",
			"minor": "31",
			"gitVersion": "v1.31.0",
			"gitCommit": "fake",
			"gitTreeState": "clean",
			"buildDate": "2024-08-13T00:00:00Z",
			"goVersion": "go1.22.5",
			"compiler": "gc",
			"platform": "linux/amd64"
		})))
		.mount(server)
		.await;
}

async fn mount_resources(server: &MockServer, resources: &SharedResources) {
	let resources = Arc::clone(resources);

	Mock::given(method("GET"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let request_path = req.url.path().trim_end_matches('/');
			let store = resources.read().unwrap_or_else(PoisonError::into_inner);

			match classify(request_path) {
				Target::Collection => {
					let selector = req
						.url
						.query_pairs()
						.find(|(k, _)| k == "labelSelector")
						.map(|(_, v)| LabelSelector::parse(&v))
						.unwrap_or_default();
					list_response(&store, request_path, &selector)
				}
				Target::Single { collection, name } => {
					match store.get(&(collection.to_string(), name.to_string())) {
						Some(resource) => ResponseTemplate::new(200).set_body_json(resource),
						None => not_found(name),
					}
				}
			}
		})
		.mount(server)
		.await;
}

enum Target<'a> {
	Collection,
	Single { collection: &'a str, name: &'a str },
}

/// `/api/v1/namespaces/default/pods` is a collection, `/api/v1/namespaces/default` and
/// `/api/v1/namespaces/default/pods/web` are single resources.
fn classify(request_path: &str) -> Target<'_> {
	let Some((collection, last)) = request_path.rsplit_once('/') else {
		return Target::Collection;
	};
	let parent = collection.rsplit('/').next().unwrap_or_default();

	if catalog::is_plural(last) && parent != "namespaces" {
		Target::Collection
	} else {
		Target::Single {
			collection,
			name: last,
		}
	}
}

fn list_response(
	store: &HashMap<(String, String), Value>,
	request_path: &str,
	selector: &LabelSelector,
) -> ResponseTemplate {
	let mut items: Vec<_> = store
		.iter()
		.filter(|((collection, _), _)| {
			collection == request_path
				|| cluster_wide_path(collection).as_deref() == Some(request_path)
		})
		.filter(|(_, resource)| selector.matches(resource))
		.collect();
	items.sort_by(|a, b| a.0.cmp(b.0));

	ResponseTemplate::new(200).set_body_json(json!({
		"kind": "List",
		"apiVersion": "v1",
		"metadata": {"resourceVersion": "1"},
		"items": items.into_iter().map(|(_, v)| v).collect::<Vec<_>>()
	}))
}

fn not_found(name: &str) -> ResponseTemplate {
	ResponseTemplate::new(404).set_body_json(json!({
		"kind": "Status",
		"apiVersion": "v1",
		"metadata": {},
		"status": "Failure",
		"message": format!("{name:?} not found"),
		"reason": "NotFound",
		"code": 404
	}))
}

/// `/apis/apps/v1/namespaces/default/deployments` -> `/apis/apps/v1/deployments`
fn cluster_wide_path(collection: &str) -> Option<String> {
	let (root, rest) = collection.split_once("/namespaces/")?;
	let (_, plural) = rest.split_once('/')?;
	Some(format!("{root}/{plural}"))
}

/// Equality-based label selector: `a=b`, `a==b` and `a!=b` terms joined by commas.
#[derive(Debug, Default, PartialEq, Eq)]
struct LabelSelector {
	terms: Vec<(String, String, bool)>,
}

impl LabelSelector {
	fn parse(text: &str) -> Self {
		let terms = text
			.split(',')
			.map(str::trim)
			.filter(|term| !term.is_empty())
			.filter_map(|term| {
				if let Some((k, v)) = term.split_once("!=") {
					Some((k.trim().to_string(), v.trim().to_string(), false))
				} else {
					let (k, v) = term.split_once("==").or_else(|| term.split_once('='))?;
					Some((k.trim().to_string(), v.trim().to_string(), true))
				}
			})
			.collect();
		Self { terms }
	}

	fn matches(&self, resource: &Value) -> bool {
		let labels = resource.pointer("/metadata/labels");
		self.terms.iter().all(|(key, value, equal)| {
			let actual = labels.and_then(|l| l.get(key)).and_then(Value::as_str);
			(actual == Some(value.as_str())) == *equal
		})
	}
}

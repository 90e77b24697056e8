//! Kubernetes cluster connection management.

use std::{path::PathBuf, time::Duration};

use k8s_openapi::apimachinery::pkg::version::Info;
use kube::{
	config::{InferConfigError, KubeConfigOptions, Kubeconfig, KubeconfigError},
	Client, Config,
};
use thiserror::Error;
use tracing::{debug, instrument};

/// Default timeout for Kubernetes API requests.
const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur when connecting to a Kubernetes cluster.
#[derive(Debug, Error)]
pub enum ConnectionError {
	#[error(
		"no cluster that matches the apiserver `{0}` was found. Please check your kubeconfig"
	)]
	ClusterNotFound(String),

	#[error("no context using cluster `{0}` was found. Please check your kubeconfig")]
	ContextNotFoundForCluster(String),

	#[error("no context named `{0}` was found. Please check your kubeconfig")]
	ContextNotFound(String),

	#[error(transparent)]
	Kubeconfig(#[from] KubeconfigError),

	#[error(transparent)]
	Infer(#[from] InferConfigError),

	#[error(transparent)]
	Kube(#[from] kube::Error),
}

/// How to reach the cluster.
///
/// With nothing set, configuration is inferred: in-cluster service account first,
/// then the default kubeconfig.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
	/// Kubeconfig file to read instead of the default one.
	pub kubeconfig: Option<PathBuf>,
	/// Use the context whose cluster serves this URL.
	pub api_server: Option<String>,
	/// Use this context instead of the current one.
	pub context: Option<String>,
}

impl ConnectionOptions {
	fn needs_kubeconfig(&self) -> bool {
		self.kubeconfig.is_some() || self.api_server.is_some() || self.context.is_some()
	}
}

/// Represents a connection to a Kubernetes cluster.
#[derive(Clone)]
pub struct ClusterConnection {
	client: Client,
	server_version: Info,
	/// Human-readable identifier for the cluster (context name or API server URL).
	cluster_identifier: String,
}

impl std::fmt::Debug for ClusterConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClusterConnection")
			.field("cluster_identifier", &self.cluster_identifier)
			.field("server_version", &self.server_version)
			.finish_non_exhaustive()
	}
}

impl ClusterConnection {
	/// Connect using the given options, reading the kubeconfig only when one of them needs it.
	#[instrument(skip_all)]
	pub async fn connect(options: &ConnectionOptions) -> Result<Self, ConnectionError> {
		if !options.needs_kubeconfig() {
			let config = Config::infer().await?;
			let identifier = config.cluster_url.to_string();
			return Self::finish(config, identifier).await;
		}

		let kubeconfig = match &options.kubeconfig {
			Some(path) => Kubeconfig::read_from(path)?,
			None => Kubeconfig::read()?,
		};
		Self::from_kubeconfig(options, kubeconfig).await
	}

	/// Connect using a provided kubeconfig.
	///
	/// `api_server` wins over `context`; with neither, the current context is used.
	#[instrument(skip_all)]
	pub async fn from_kubeconfig(
		options: &ConnectionOptions,
		kubeconfig: Kubeconfig,
	) -> Result<Self, ConnectionError> {
		let context = if let Some(api_server) = &options.api_server {
			let context_name = find_context_for_api_server(&kubeconfig, api_server)?;
			debug!(
				context = %context_name,
				api_server = %api_server,
				"found context for apiserver"
			);
			Some(context_name)
		} else if let Some(context_name) = &options.context {
			if !kubeconfig.contexts.iter().any(|c| &c.name == context_name) {
				return Err(ConnectionError::ContextNotFound(context_name.clone()));
			}
			Some(context_name.clone())
		} else {
			None
		};

		let identifier = context
			.clone()
			.or_else(|| kubeconfig.current_context.clone())
			.map_or_else(|| "default".to_string(), |c| format!("context:{c}"));

		let config = Config::from_custom_kubeconfig(
			kubeconfig,
			&KubeConfigOptions {
				context,
				..Default::default()
			},
		)
		.await?;

		Self::finish(config, identifier).await
	}

	async fn finish(mut config: Config, cluster_identifier: String) -> Result<Self, ConnectionError> {
		config.read_timeout = Some(DEFAULT_API_TIMEOUT);
		let client = Client::try_from(config)?;

		// Fails fast when the cluster is unreachable or credentials are wrong.
		let server_version = client.apiserver_version().await?;

		Ok(Self {
			client,
			server_version,
			cluster_identifier,
		})
	}

	pub fn client(&self) -> &Client {
		&self.client
	}

	pub fn server_version(&self) -> &Info {
		&self.server_version
	}

	pub fn cluster_identifier(&self) -> &str {
		&self.cluster_identifier
	}
}

/// Find a kubeconfig context that uses a cluster with the given API server URL.
fn find_context_for_api_server(
	kubeconfig: &Kubeconfig,
	api_server: &str,
) -> Result<String, ConnectionError> {
	let matching_cluster = kubeconfig
		.clusters
		.iter()
		.find(|c| {
			c.cluster
				.as_ref()
				.is_some_and(|cluster| cluster.server.as_deref() == Some(api_server))
		})
		.ok_or_else(|| ConnectionError::ClusterNotFound(api_server.to_string()))?;

	let cluster_name = &matching_cluster.name;

	let matching_context = kubeconfig
		.contexts
		.iter()
		.find(|c| {
			c.context
				.as_ref()
				.is_some_and(|ctx| ctx.cluster.as_str() == cluster_name)
		})
		.ok_or_else(|| ConnectionError::ContextNotFoundForCluster(cluster_name.clone()))?;

	Ok(matching_context.name.clone())
}

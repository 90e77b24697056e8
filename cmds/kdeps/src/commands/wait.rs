//! Wait command handler.
//!
//! Connects to the cluster, validates the dependencies and polls them until they are
//! all ready or the timeout expires.

use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{Context, Result};
use clap::Args;
use tracing::{error, info, instrument, warn, Level};

use crate::{
	config::KdepsConfig,
	dependency::{ensure_namespace, RetryBudget},
	engine::{wait_until_ready, Schedule, WaitOutcome},
	k8s::{
		client::{ClusterConnection, ConnectionOptions},
		query::KubeResourceQuery,
	},
	list::{DependencyList, PassPolicy},
	readiness::ResourceQuery,
	telemetry,
};

const DEFAULT_NAMESPACE: &str = "kube-system";

#[derive(Args, Debug, Clone, Default)]
pub struct WaitArgs {
	/// Dependencies to wait for, as `kind/namespace:name`, `kind/name` or `kind:name`
	#[arg(value_name = "DEPENDENCY")]
	pub dependencies: Vec<String>,

	/// Namespace for dependencies that don't name one [default: kube-system]
	#[arg(short = 'n', long)]
	pub namespace: Option<String>,

	/// Path to the kubeconfig file
	#[arg(short = 'k', long)]
	pub kubeconfig: Option<PathBuf>,

	/// Kubernetes API server URL, selects the kubeconfig context using it
	#[arg(short = 'a', long)]
	pub apiserver: Option<String>,

	/// Kubeconfig context to use
	#[arg(long)]
	pub context: Option<String>,

	/// Passes a dependency may take part in, a number or 'always' [default: always]
	#[arg(short = 'r', long)]
	pub maxretry: Option<String>,

	/// Keep retrying dependencies that fail to be queried
	#[arg(short = 'b', long)]
	pub keeponerror: bool,

	/// Don't stop on query errors, also skips malformed dependencies
	#[arg(short = 'i', long)]
	pub ignoreerror: bool,

	/// Log every check
	#[arg(short = 'v', long)]
	pub verbose: bool,

	/// Pause between passes [default: 10s]
	#[arg(short = 's', long, value_parser = humantime::parse_duration)]
	pub sleep: Option<Duration>,

	/// Give up after this long [default: 300s]
	#[arg(short = 't', long, value_parser = humantime::parse_duration)]
	pub timeout: Option<Duration>,

	/// YAML file with defaults and dependencies
	#[arg(short = 'c', long)]
	pub config: Option<PathBuf>,

	/// Log level (possible values: error, warn, info, debug, trace)
	#[arg(long)]
	pub log_level: Option<Level>,
}

/// Settings for a single run, after merging the command line over the config file.
#[derive(Debug, Clone)]
pub struct WaitOptions {
	pub dependencies: Vec<String>,
	pub namespace: String,
	/// The namespace was chosen explicitly and must exist even if no dependency uses it.
	pub check_namespace: bool,
	pub retries: RetryBudget,
	pub policy: PassPolicy,
	pub schedule: Schedule,
	pub connection: ConnectionOptions,
}

impl WaitArgs {
	/// Merge over `config`: valued options given on the command line win, flags are OR-ed,
	/// dependencies from the command line come after the configured ones.
	pub fn resolve(self, config: KdepsConfig) -> Result<WaitOptions> {
		let retries = match (&self.maxretry, &config.max_retry) {
			(Some(text), _) => text.parse::<RetryBudget>().context("invalid --maxretry")?,
			(None, Some(setting)) => setting.budget().context("invalid maxRetry in config")?,
			(None, None) => RetryBudget::Unlimited,
		};

		let defaults = Schedule::default();
		let schedule = Schedule {
			interval: self.sleep.or(config.sleep).unwrap_or(defaults.interval),
			deadline: self.timeout.or(config.timeout).unwrap_or(defaults.deadline),
		};

		let policy = PassPolicy {
			ignore_error: self.ignoreerror || config.ignore_error,
			keep_on_error: self.keeponerror || config.keep_on_error,
			verbose: self.verbose || config.verbose,
		};

		let mut dependencies = config.dependencies;
		dependencies.extend(self.dependencies);

		let namespace = self.namespace.or(config.namespace);

		Ok(WaitOptions {
			dependencies,
			check_namespace: namespace.is_some(),
			namespace: namespace.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
			retries,
			policy,
			schedule,
			connection: ConnectionOptions {
				kubeconfig: self.kubeconfig,
				api_server: self.apiserver,
				context: self.context,
			},
		})
	}
}

/// Run the wait command.
pub fn run(args: WaitArgs) -> Result<ExitCode> {
	let config = match &args.config {
		Some(path) => KdepsConfig::load_from_file(path)?,
		None => KdepsConfig::default(),
	};
	let log_level = args.log_level;
	let options = args.resolve(config)?;

	// Create a tokio runtime for async operations
	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("creating tokio runtime")?;

	let ready = runtime.block_on(run_async(options, log_level))?;
	Ok(if ready {
		ExitCode::SUCCESS
	} else {
		ExitCode::FAILURE
	})
}

async fn run_async(options: WaitOptions, log_level: Option<Level>) -> Result<bool> {
	// Dropped before leaving the runtime, so pending spans get flushed.
	let _telemetry = telemetry::init(log_level)?;
	info!(version = env!("KDEPS_VERSION"), "starting kdeps");

	let connection = ClusterConnection::connect(&options.connection)
		.await
		.context("connecting to cluster")?;
	info!(
		cluster = connection.cluster_identifier(),
		version = %connection.server_version().git_version,
		"connected"
	);

	let query = KubeResourceQuery::new(connection.client().clone());
	wait_for_dependencies(&query, &options).await
}

/// Parse, validate and poll the dependencies in `options`.
///
/// Returns `Ok(false)` when the deadline passed with dependencies left, and an error for
/// malformed or invalid dependencies and for aborted passes.
#[instrument(skip_all, fields(namespace = %options.namespace))]
pub async fn wait_for_dependencies<Q: ResourceQuery>(
	query: &Q,
	options: &WaitOptions,
) -> Result<bool> {
	if options.check_namespace {
		ensure_namespace(query, &options.namespace)
			.await
			.context("checking default namespace")?;
	}

	let mut list = DependencyList::parse(
		&options.dependencies,
		&options.namespace,
		options.retries,
		options.policy.ignore_error,
	)
	.context("parsing dependencies")?;

	if list.is_empty() {
		warn!("no dependencies to wait for");
		return Ok(true);
	}

	list.validate(query)
		.await
		.context("validating dependencies")?;

	let outcome = wait_until_ready(&mut list, query, options.policy, options.schedule).await;
	match outcome {
		WaitOutcome::Ready => {
			info!("all dependencies are ready");
			Ok(true)
		}
		WaitOutcome::DeadlineExceeded => {
			report_unresolved(&list);
			error!(timeout = ?options.schedule.deadline, "timed out waiting for dependencies");
			Ok(false)
		}
		WaitOutcome::Aborted(err) => {
			report_unresolved(&list);
			Err(err).context("waiting for dependencies")
		}
	}
}

fn report_unresolved(list: &DependencyList) {
	for (dependency, reason) in list.unresolved() {
		match reason {
			Some(reason) => error!(%dependency, %reason, "dependency failed"),
			None => error!(%dependency, "dependency is not ready"),
		}
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;
	use crate::{
		config::MaxRetry,
		dependency::ResourceKind,
		test_utils::{pod, FakeCluster},
	};

	fn options(dependencies: &[&str]) -> WaitOptions {
		WaitArgs {
			dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
			sleep: Some(Duration::from_secs(1)),
			timeout: Some(Duration::from_secs(5)),
			..WaitArgs::default()
		}
		.resolve(KdepsConfig::default())
		.unwrap()
	}

	#[test]
	fn test_resolve_defaults() {
		let options = WaitArgs::default().resolve(KdepsConfig::default()).unwrap();

		assert_eq!(options.namespace, "kube-system");
		assert!(!options.check_namespace);
		assert_eq!(options.retries, RetryBudget::Unlimited);
		assert_eq!(options.schedule.interval, Duration::from_secs(10));
		assert_eq!(options.schedule.deadline, Duration::from_secs(300));
		assert!(!options.policy.ignore_error);
		assert!(!options.policy.keep_on_error);
		assert!(!options.policy.verbose);
	}

	#[test]
	fn test_resolve_command_line_wins_over_config() {
		let args = WaitArgs {
			dependencies: vec!["pod:web".to_string()],
			namespace: Some("cli".to_string()),
			maxretry: Some("3".to_string()),
			keeponerror: true,
			sleep: Some(Duration::from_secs(1)),
			..WaitArgs::default()
		};
		let config = KdepsConfig {
			namespace: Some("file".to_string()),
			max_retry: Some(MaxRetry::Text("always".to_string())),
			ignore_error: true,
			sleep: Some(Duration::from_secs(30)),
			timeout: Some(Duration::from_secs(60)),
			dependencies: vec!["svc:db".to_string()],
			..KdepsConfig::default()
		};

		let options = args.resolve(config).unwrap();

		assert_eq!(options.namespace, "cli");
		assert!(options.check_namespace);
		assert_eq!(options.retries, RetryBudget::Limited(3));
		assert!(options.policy.keep_on_error);
		assert!(options.policy.ignore_error);
		assert_eq!(options.schedule.interval, Duration::from_secs(1));
		assert_eq!(options.schedule.deadline, Duration::from_secs(60));
		assert_eq!(options.dependencies, ["svc:db", "pod:web"]);
	}

	#[test]
	fn test_resolve_empty_maxretry_is_single_attempt() {
		let args = WaitArgs {
			maxretry: Some(String::new()),
			..WaitArgs::default()
		};
		let options = args.resolve(KdepsConfig::default()).unwrap();
		assert_eq!(options.retries, RetryBudget::Limited(1));
	}

	#[test]
	fn test_resolve_rejects_garbage_maxretry() {
		let args = WaitArgs {
			maxretry: Some("often".to_string()),
			..WaitArgs::default()
		};
		let err = args.resolve(KdepsConfig::default()).unwrap_err();
		assert!(err.to_string().contains("--maxretry"));
	}

	#[tokio::test(start_paused = true)]
	async fn test_wait_ready() {
		let cluster = FakeCluster::default()
			.with_namespace("kube-system")
			.with_namespace("apps")
			.with_pod("kube-system", pod("dns", "Running", &[(true, true)]))
			.with_replicas(ResourceKind::Deployment, "apps", "api", 2, 2);

		let ready = wait_for_dependencies(&cluster, &options(&["pod:dns", "deploy/apps:api"]))
			.await
			.unwrap();
		assert!(ready);
	}

	#[tokio::test(start_paused = true)]
	async fn test_wait_times_out() {
		let cluster = FakeCluster::default()
			.with_namespace("apps")
			.with_replicas(ResourceKind::StatefulSet, "apps", "db", 0, 1);

		let ready = wait_for_dependencies(&cluster, &options(&["sts/apps:db"]))
			.await
			.unwrap();
		assert!(!ready);
	}

	#[tokio::test(start_paused = true)]
	async fn test_wait_rejects_unknown_namespace() {
		let cluster = FakeCluster::default().with_namespace("kube-system");

		let err = wait_for_dependencies(&cluster, &options(&["pod/missing:web"]))
			.await
			.unwrap_err();
		assert_matches!(
			err.downcast_ref::<crate::dependency::ValidationError>(),
			Some(crate::dependency::ValidationError::NamespaceNotFound(ns)) if ns == "missing"
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_wait_rejects_malformed_dependency() {
		let cluster = FakeCluster::default();
		let err = wait_for_dependencies(&cluster, &options(&["pod"]))
			.await
			.unwrap_err();
		assert!(format!("{err:#}").contains("parsing dependencies"));
	}

	#[tokio::test(start_paused = true)]
	async fn test_wait_aborts_on_query_error() {
		let cluster = FakeCluster::default().with_namespace("apps");
		let err = wait_for_dependencies(&cluster, &options(&["pod/apps:gone"]))
			.await
			.unwrap_err();
		assert!(err.downcast_ref::<crate::list::PassError>().is_some());
	}

	#[tokio::test]
	async fn test_wait_without_dependencies_succeeds() {
		let cluster = FakeCluster::default();
		assert!(wait_for_dependencies(&cluster, &options(&[])).await.unwrap());
	}

	#[tokio::test]
	async fn test_explicit_namespace_must_exist() {
		let cluster = FakeCluster::default().with_namespace("apps");
		let options = WaitArgs {
			dependencies: vec!["pod/apps:web".to_string()],
			namespace: Some("gone".to_string()),
			..WaitArgs::default()
		}
		.resolve(KdepsConfig::default())
		.unwrap();

		let err = wait_for_dependencies(&cluster, &options).await.unwrap_err();
		assert_matches!(
			err.downcast_ref::<crate::dependency::ValidationError>(),
			Some(crate::dependency::ValidationError::NamespaceNotFound(ns)) if ns == "gone"
		);
		assert_eq!(cluster.lookups(ResourceKind::Pod, "apps", "web"), 0);
	}

	#[test]
	fn test_startup_version_is_embedded() {
		assert!(!env!("KDEPS_VERSION").trim().is_empty());
	}
}

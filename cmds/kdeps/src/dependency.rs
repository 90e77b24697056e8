//! Dependency targets and their text form.
//!
//! A dependency is written as `kind/namespace:name`, `kind/name` or `kind:name`.
//! The two short forms take the default namespace passed to the parser.

use std::{fmt, str::FromStr};

use thiserror::Error;
use tracing::warn;

use crate::readiness::{QueryError, ResourceQuery};

/// Resource kinds whose readiness can be checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
	Pod,
	Deployment,
	DaemonSet,
	ReplicaSet,
	ReplicationController,
	StatefulSet,
	Service,
}

impl ResourceKind {
	pub const ALL: [ResourceKind; 7] = [
		ResourceKind::Pod,
		ResourceKind::Deployment,
		ResourceKind::DaemonSet,
		ResourceKind::ReplicaSet,
		ResourceKind::ReplicationController,
		ResourceKind::StatefulSet,
		ResourceKind::Service,
	];

	/// Canonical lowercase name of the kind.
	pub fn as_str(self) -> &'static str {
		match self {
			ResourceKind::Pod => "pod",
			ResourceKind::Deployment => "deployment",
			ResourceKind::DaemonSet => "daemonset",
			ResourceKind::ReplicaSet => "replicaset",
			ResourceKind::ReplicationController => "replicationcontroller",
			ResourceKind::StatefulSet => "statefulset",
			ResourceKind::Service => "service",
		}
	}

	/// Names accepted for this kind besides the canonical one (kubectl short and plural names).
	fn aliases(self) -> &'static [&'static str] {
		match self {
			ResourceKind::Pod => &["po", "pods"],
			ResourceKind::Deployment => &["deploy", "deployments"],
			ResourceKind::DaemonSet => &["ds", "daemonsets"],
			ResourceKind::ReplicaSet => &["rs", "replicasets"],
			ResourceKind::ReplicationController => &["rc", "replicationcontrollers"],
			ResourceKind::StatefulSet => &["sts", "statefulsets"],
			ResourceKind::Service => &["svc", "services"],
		}
	}
}

impl fmt::Display for ResourceKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ResourceKind {
	type Err = ValidationError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::ALL
			.into_iter()
			.find(|kind| {
				kind.as_str().eq_ignore_ascii_case(s)
					|| kind.aliases().iter().any(|a| a.eq_ignore_ascii_case(s))
			})
			.ok_or_else(|| ValidationError::UnknownKind(s.to_string()))
	}
}

/// How many more passes a dependency may take part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryBudget {
	#[default]
	Unlimited,
	Limited(i64),
}

impl RetryBudget {
	/// Consume one attempt. Unlimited budgets are never decremented.
	pub(crate) fn consume(&mut self) {
		if let RetryBudget::Limited(n) = self {
			*n = n.saturating_sub(1);
		}
	}

	pub fn is_exhausted(self) -> bool {
		matches!(self, RetryBudget::Limited(n) if n <= 0)
	}
}

impl fmt::Display for RetryBudget {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RetryBudget::Unlimited => f.write_str("always"),
			RetryBudget::Limited(n) => write!(f, "{n}"),
		}
	}
}

#[derive(Debug, Error)]
#[error("unable to parse maxretry value: {0:?}, expected \"always\" or a number")]
pub struct RetryBudgetError(String);

impl FromStr for RetryBudget {
	type Err = RetryBudgetError;

	/// `always` means unlimited, an empty value means a single attempt.
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"always" => Ok(RetryBudget::Unlimited),
			"" => Ok(RetryBudget::Limited(1)),
			n => n
				.parse()
				.map(RetryBudget::Limited)
				.map_err(|_| RetryBudgetError(s.to_string())),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unable to parse dependency: {0:?}")]
pub struct ParseError(pub String);

/// Pre-flight checks failures. All of them are fatal for the run.
#[derive(Debug, Error)]
pub enum ValidationError {
	#[error("unknown resource type {0:?}")]
	UnknownKind(String),

	#[error("namespace not defined for dependency {0}")]
	MissingNamespace(String),

	#[error("namespace {0} doesn't exist")]
	NamespaceNotFound(String),

	#[error("checking namespace {namespace}")]
	NamespaceLookup {
		namespace: String,
		#[source]
		source: QueryError,
	},
}

/// A single resource whose readiness gates progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
	/// Kind as it was written, kept so the dependency prints back the way it was given.
	kind: String,
	resource_kind: Option<ResourceKind>,
	namespace: String,
	name: String,
	retries: RetryBudget,
}

impl Dependency {
	pub fn new(
		kind: ResourceKind,
		namespace: impl Into<String>,
		name: impl Into<String>,
		retries: RetryBudget,
	) -> Self {
		Self {
			kind: kind.as_str().to_string(),
			resource_kind: Some(kind),
			namespace: namespace.into(),
			name: name.into(),
			retries,
		}
	}

	/// Parse a single dependency from its text form.
	///
	/// Unknown kinds are accepted here and rejected by [`Dependency::validate`].
	pub fn parse(
		spec: &str,
		default_namespace: &str,
		retries: RetryBudget,
	) -> Result<Self, ParseError> {
		let malformed = || ParseError(spec.to_string());

		let (kind, namespace, name) = match spec.split_once('/') {
			Some((kind, target)) => {
				if target.contains('/') {
					return Err(malformed());
				}
				match target.split_once(':') {
					Some((_, name)) if name.contains(':') => return Err(malformed()),
					Some((namespace, name)) => (kind, namespace, name),
					None => (kind, default_namespace, target),
				}
			}
			None => match spec.split_once(':') {
				Some((_, name)) if name.contains(':') => return Err(malformed()),
				Some((kind, name)) => (kind, default_namespace, name),
				None => return Err(malformed()),
			},
		};

		if kind.is_empty() || name.is_empty() {
			return Err(malformed());
		}

		Ok(Self {
			kind: kind.to_string(),
			resource_kind: kind.parse().ok(),
			namespace: namespace.to_string(),
			name: name.to_string(),
			retries,
		})
	}

	/// Kind exactly as it was written.
	pub fn kind(&self) -> &str {
		&self.kind
	}

	/// Resolved kind, `None` if the written kind is not supported.
	pub fn resource_kind(&self) -> Option<ResourceKind> {
		self.resource_kind
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn retries(&self) -> RetryBudget {
		self.retries
	}

	pub(crate) fn consume_retry(&mut self) {
		self.retries.consume();
	}

	/// Check that the dependency can be polled: known kind, namespace set and present in the cluster.
	pub async fn validate<Q: ResourceQuery>(&self, query: &Q) -> Result<(), ValidationError> {
		if self.resource_kind.is_none() {
			return Err(ValidationError::UnknownKind(self.kind.clone()));
		}

		if self.namespace.is_empty() {
			return Err(ValidationError::MissingNamespace(self.name.clone()));
		}

		ensure_namespace(query, &self.namespace).await
	}
}

/// Fail unless `namespace` exists in the cluster.
pub async fn ensure_namespace<Q: ResourceQuery>(
	query: &Q,
	namespace: &str,
) -> Result<(), ValidationError> {
	match query.namespace_exists(namespace).await {
		Ok(true) => Ok(()),
		Ok(false) => Err(ValidationError::NamespaceNotFound(namespace.to_string())),
		Err(source) => Err(ValidationError::NamespaceLookup {
			namespace: namespace.to_string(),
			source,
		}),
	}
}

impl fmt::Display for Dependency {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}:{}", self.kind, self.namespace, self.name)
	}
}

/// Parse a batch of dependencies, skipping blank entries.
///
/// With `ignore_malformed` set, entries that fail to parse are dropped with a warning.
/// Otherwise the first malformed entry fails the whole batch.
pub fn parse_all<I, S>(
	specs: I,
	default_namespace: &str,
	retries: RetryBudget,
	ignore_malformed: bool,
) -> Result<Vec<Dependency>, ParseError>
where
	I: IntoIterator<Item = S>,
	S: AsRef<str>,
{
	let mut dependencies = Vec::new();

	for spec in specs {
		let spec = spec.as_ref().trim();
		if spec.is_empty() {
			continue;
		}

		match Dependency::parse(spec, default_namespace, retries) {
			Ok(dependency) => dependencies.push(dependency),
			Err(err) if ignore_malformed => warn!(spec, "{err}, ignoring"),
			Err(err) => return Err(err),
		}
	}

	Ok(dependencies)
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use rstest::rstest;

	use super::*;
	use crate::test_utils::FakeCluster;

	#[rstest]
	#[case("pod/default:web", "pod", "default", "web")]
	#[case("deploy/kube-system:coredns", "deploy", "kube-system", "coredns")]
	#[case("svc/web", "svc", "fallback", "web")]
	#[case("sts:db", "sts", "fallback", "db")]
	fn test_parse_shapes(
		#[case] spec: &str,
		#[case] kind: &str,
		#[case] namespace: &str,
		#[case] name: &str,
	) {
		let dep = Dependency::parse(spec, "fallback", RetryBudget::Limited(3)).unwrap();
		assert_eq!(dep.kind(), kind);
		assert_eq!(dep.namespace(), namespace);
		assert_eq!(dep.name(), name);
		assert_eq!(dep.retries(), RetryBudget::Limited(3));
	}

	#[rstest]
	#[case("pod/default:web")]
	#[case("deployment/kube-system:coredns")]
	#[case("ds/monitoring:node-exporter")]
	#[case("unknownkind/ns:name")]
	fn test_full_form_prints_back_unchanged(#[case] spec: &str) {
		let dep = Dependency::parse(spec, "other", RetryBudget::Unlimited).unwrap();
		assert_eq!(dep.to_string(), spec);
	}

	#[rstest]
	#[case("")]
	#[case("web")]
	#[case("pod/ns/web")]
	#[case("pod/ns:web:extra")]
	#[case("pod:ns:web")]
	#[case("/ns:web")]
	#[case("pod/ns:")]
	#[case("pod/")]
	fn test_parse_malformed(#[case] spec: &str) {
		assert_eq!(
			Dependency::parse(spec, "default", RetryBudget::Unlimited),
			Err(ParseError(spec.to_string()))
		);
	}

	#[rstest]
	#[case("po", ResourceKind::Pod)]
	#[case("pods", ResourceKind::Pod)]
	#[case("Deployment", ResourceKind::Deployment)]
	#[case("ds", ResourceKind::DaemonSet)]
	#[case("rs", ResourceKind::ReplicaSet)]
	#[case("rc", ResourceKind::ReplicationController)]
	#[case("replicationcontroller", ResourceKind::ReplicationController)]
	#[case("sts", ResourceKind::StatefulSet)]
	#[case("svc", ResourceKind::Service)]
	fn test_kind_aliases(#[case] text: &str, #[case] expected: ResourceKind) {
		assert_eq!(text.parse::<ResourceKind>().unwrap(), expected);
	}

	#[test]
	fn test_unknown_kind_is_not_a_parse_error() {
		let dep = Dependency::parse("configmap/default:cfg", "default", RetryBudget::Unlimited)
			.expect("unknown kinds are rejected by validation, not parsing");
		assert_eq!(dep.resource_kind(), None);
	}

	#[rstest]
	#[case("always", RetryBudget::Unlimited)]
	#[case("", RetryBudget::Limited(1))]
	#[case("5", RetryBudget::Limited(5))]
	#[case(" 0 ", RetryBudget::Limited(0))]
	fn test_retry_budget_from_str(#[case] text: &str, #[case] expected: RetryBudget) {
		assert_eq!(text.parse::<RetryBudget>().unwrap(), expected);
	}

	#[test]
	fn test_retry_budget_rejects_garbage() {
		assert!("forever".parse::<RetryBudget>().is_err());
	}

	#[test]
	fn test_unlimited_budget_is_never_consumed() {
		let mut budget = RetryBudget::Unlimited;
		for _ in 0..1000 {
			budget.consume();
		}
		assert_eq!(budget, RetryBudget::Unlimited);
		assert!(!budget.is_exhausted());
	}

	#[test]
	fn test_parse_all_skips_blank_entries() {
		let deps = parse_all(
			["pod/a:x", "  ", " svc/b:y ", ""],
			"default",
			RetryBudget::Unlimited,
			false,
		)
		.unwrap();
		let printed: Vec<_> = deps.iter().map(ToString::to_string).collect();
		assert_eq!(printed, ["pod/a:x", "svc/b:y"]);
	}

	#[test]
	fn test_parse_all_keeps_duplicates() {
		let deps = parse_all(
			["pod/a:x", "pod/a:x"],
			"default",
			RetryBudget::Unlimited,
			false,
		)
		.unwrap();
		assert_eq!(deps.len(), 2);
	}

	#[test]
	fn test_parse_all_malformed_is_fatal_by_default() {
		let result = parse_all(
			["pod/a:x", "garbage", "svc/b:y"],
			"default",
			RetryBudget::Unlimited,
			false,
		);
		assert_eq!(result, Err(ParseError("garbage".to_string())));
	}

	#[test]
	fn test_parse_all_ignore_malformed_drops_entry() {
		let deps = parse_all(
			["pod/a:x", "garbage", "svc/b:y"],
			"default",
			RetryBudget::Unlimited,
			true,
		)
		.unwrap();
		let printed: Vec<_> = deps.iter().map(ToString::to_string).collect();
		assert_eq!(printed, ["pod/a:x", "svc/b:y"]);
	}

	#[tokio::test]
	async fn test_validate_accepts_known_kind_in_existing_namespace() {
		let cluster = FakeCluster::default().with_namespace("apps");
		let dep = Dependency::parse("deploy/apps:api", "default", RetryBudget::Unlimited).unwrap();
		assert_matches!(dep.validate(&cluster).await, Ok(()));
	}

	#[tokio::test]
	async fn test_validate_unknown_kind() {
		let cluster = FakeCluster::default().with_namespace("apps");
		let dep = Dependency::parse("cm/apps:cfg", "default", RetryBudget::Unlimited).unwrap();
		assert_matches!(
			dep.validate(&cluster).await,
			Err(ValidationError::UnknownKind(kind)) if kind == "cm"
		);
	}

	#[tokio::test]
	async fn test_validate_missing_namespace() {
		let cluster = FakeCluster::default();
		let dep = Dependency::parse("pod/web", "", RetryBudget::Unlimited).unwrap();
		assert_matches!(
			dep.validate(&cluster).await,
			Err(ValidationError::MissingNamespace(name)) if name == "web"
		);
	}

	#[tokio::test]
	async fn test_validate_namespace_not_found() {
		let cluster = FakeCluster::default().with_namespace("apps");
		let dep = Dependency::parse("pod/other:web", "default", RetryBudget::Unlimited).unwrap();
		assert_matches!(
			dep.validate(&cluster).await,
			Err(ValidationError::NamespaceNotFound(ns)) if ns == "other"
		);
	}

	#[tokio::test]
	async fn test_validate_namespace_lookup_failure() {
		let cluster = FakeCluster::default().with_namespace_lookup_failure();
		let dep = Dependency::parse("pod/apps:web", "default", RetryBudget::Unlimited).unwrap();
		assert_matches!(
			dep.validate(&cluster).await,
			Err(ValidationError::NamespaceLookup { namespace, .. }) if namespace == "apps"
		);
	}
}

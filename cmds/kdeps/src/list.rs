//! Pending and failed dependencies, and the pass that moves them between the two.

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::{
	dependency::{self, Dependency, ParseError, RetryBudget, ValidationError},
	readiness::{QueryError, Readiness, ResourceQuery},
};

/// Error tolerance and verbosity, constant for a whole run.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassPolicy {
	/// Do not abort a pass when a dependency fails to be queried.
	pub ignore_error: bool,
	/// Keep retrying dependencies that fail to be queried, while their retry budget lasts.
	pub keep_on_error: bool,
	pub verbose: bool,
}

/// Why a dependency ended up in the failed set.
#[derive(Debug, Clone, Error)]
pub enum FailureReason {
	#[error("max retries reached")]
	MaxRetriesExceeded,

	#[error(transparent)]
	Query(QueryError),
}

#[derive(Debug, Clone)]
pub struct FailedDependency {
	pub dependency: Dependency,
	pub reason: FailureReason,
}

/// A query error that aborted a pass.
#[derive(Debug, Error)]
#[error("dependency {dependency} got an error")]
pub struct PassError {
	pub dependency: String,
	#[source]
	pub source: QueryError,
}

enum Attempt {
	Exhausted,
	Probed(Result<Readiness, QueryError>),
}

#[derive(Debug, Default)]
pub struct DependencyList {
	pending: Vec<Dependency>,
	failed: Vec<FailedDependency>,
}

impl DependencyList {
	pub fn new(dependencies: Vec<Dependency>) -> Self {
		Self {
			pending: dependencies,
			failed: Vec::new(),
		}
	}

	/// Build the list from dependency strings, see [`dependency::parse_all`].
	pub fn parse<I, S>(
		specs: I,
		default_namespace: &str,
		retries: RetryBudget,
		ignore_malformed: bool,
	) -> Result<Self, ParseError>
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		dependency::parse_all(specs, default_namespace, retries, ignore_malformed).map(Self::new)
	}

	pub fn pending(&self) -> &[Dependency] {
		&self.pending
	}

	pub fn failed(&self) -> &[FailedDependency] {
		&self.failed
	}

	pub fn is_empty(&self) -> bool {
		self.pending.is_empty() && self.failed.is_empty()
	}

	/// Every dependency that did not become ready: pending ones first, then failed ones with their reason.
	pub fn unresolved(&self) -> impl Iterator<Item = (&Dependency, Option<&FailureReason>)> {
		self.pending.iter().map(|d| (d, None)).chain(
			self.failed
				.iter()
				.map(|f| (&f.dependency, Some(&f.reason))),
		)
	}

	/// Validate every pending dependency, stopping at the first failure.
	pub async fn validate<Q: ResourceQuery>(&self, query: &Q) -> Result<(), ValidationError> {
		for dependency in &self.pending {
			dependency.validate(query).await?;
		}
		Ok(())
	}

	/// Probe every pending dependency once.
	///
	/// Pending is rebuilt from a snapshot: ready dependencies are dropped, exhausted ones and
	/// ones that failed to be queried move to the failed set. Returns `Ok(true)` when nothing is
	/// left pending and nothing has failed.
	///
	/// An empty pending set alone is not success: a dependency that ran out of retries sits
	/// in the failed set, and reporting it as ready would let the wait succeed on exhaustion.
	/// Such a list keeps returning `Ok(false)` until the deadline.
	///
	/// Unless `ignore_error` is set, a dependency moved to the failed set by a query error aborts
	/// the pass. Dependencies not reached yet go back to pending untouched.
	#[instrument(skip_all, fields(pending = self.pending.len()))]
	pub async fn run_pass<Q: ResourceQuery>(
		&mut self,
		query: &Q,
		policy: PassPolicy,
	) -> Result<bool, PassError> {
		let snapshot = std::mem::take(&mut self.pending);
		let mut remaining = snapshot.into_iter();

		while let Some(mut dependency) = remaining.next() {
			match attempt(&mut dependency, query, policy.verbose).await {
				Attempt::Exhausted => {
					warn!("max retries reached for {dependency}");
					self.failed.push(FailedDependency {
						dependency,
						reason: FailureReason::MaxRetriesExceeded,
					});
				}
				Attempt::Probed(Ok(Readiness::Ready)) => {
					info!("the dependency {dependency} is ready");
				}
				Attempt::Probed(Ok(Readiness::NotReady)) => {
					if policy.verbose {
						info!("the dependency {dependency} is not ready");
					}
					self.pending.push(dependency);
				}
				Attempt::Probed(Err(err)) => {
					if policy.verbose {
						info!("{dependency} dependency got an error: {err}");
					}

					if policy.keep_on_error && !dependency.retries().is_exhausted() {
						if policy.verbose {
							info!("will retry {dependency} dependency");
						}
						self.pending.push(dependency);
						continue;
					}

					let target = dependency.to_string();
					self.failed.push(FailedDependency {
						dependency,
						reason: FailureReason::Query(err.clone()),
					});

					if !policy.ignore_error {
						self.pending.extend(remaining);
						return Err(PassError {
							dependency: target,
							source: err,
						});
					}
				}
			}
		}

		Ok(self.is_empty())
	}
}

/// Consume one retry and, if the budget allows, probe the dependency.
async fn attempt<Q: ResourceQuery>(
	dependency: &mut Dependency,
	query: &Q,
	verbose: bool,
) -> Attempt {
	if verbose {
		info!(
			"check if {dependency} dependency is ready, retry: {}",
			dependency.retries()
		);
	}

	dependency.consume_retry();
	if dependency.retries().is_exhausted() {
		return Attempt::Exhausted;
	}

	let result = match dependency.resource_kind() {
		Some(kind) => {
			kind.probe(query, dependency.namespace(), dependency.name(), verbose)
				.await
		}
		// Only reachable when validation was skipped.
		None => Err(QueryError::transport(
			dependency.to_string(),
			ValidationError::UnknownKind(dependency.kind().to_string()),
		)),
	};

	Attempt::Probed(result)
}

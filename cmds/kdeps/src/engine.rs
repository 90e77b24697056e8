//! Repeated passes over a [`DependencyList`] until it is ready, a pass aborts, or time runs out.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, instrument};

use crate::{
	list::{DependencyList, PassError, PassPolicy},
	readiness::ResourceQuery,
};

/// Polling interval and overall deadline, measured from the start of the wait.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
	pub interval: Duration,
	pub deadline: Duration,
}

impl Default for Schedule {
	fn default() -> Self {
		Self {
			interval: Duration::from_secs(10),
			deadline: Duration::from_secs(300),
		}
	}
}

#[derive(Debug)]
pub enum WaitOutcome {
	/// Every dependency became ready.
	Ready,
	/// The deadline passed with dependencies still pending or failed.
	DeadlineExceeded,
	/// A pass aborted on a query error.
	Aborted(PassError),
}

impl WaitOutcome {
	pub fn is_ready(&self) -> bool {
		matches!(self, WaitOutcome::Ready)
	}
}

/// Run passes every `schedule.interval` until the list is ready or the deadline passes.
///
/// A pass is only started before the deadline, and the loop never sleeps past it.
#[instrument(skip_all, fields(interval = ?schedule.interval, deadline = ?schedule.deadline))]
pub async fn wait_until_ready<Q: ResourceQuery>(
	list: &mut DependencyList,
	query: &Q,
	policy: PassPolicy,
	schedule: Schedule,
) -> WaitOutcome {
	let start = Instant::now();
	let mut pass = 0_u64;

	while start.elapsed() < schedule.deadline {
		pass += 1;
		debug!(pass, "starting pass");

		match list.run_pass(query, policy).await {
			Ok(true) => return WaitOutcome::Ready,
			Ok(false) => {}
			Err(err) => return WaitOutcome::Aborted(err),
		}

		if start.elapsed() + schedule.interval >= schedule.deadline {
			break;
		}
		sleep(schedule.interval).await;
	}

	WaitOutcome::DeadlineExceeded
}

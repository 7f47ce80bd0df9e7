//! Structured fan-out with an explicit failure policy

use std::future::Future;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What a group does when one of its tasks fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPolicy {
    /// First error cancels every sibling
    FailFast,
    /// Siblings keep running; the first error is still reported
    BestEffort,
}

/// A set of tasks sharing one cancellation token.
///
/// The token is a child of the parent passed to [`TaskGroup::new`], so
/// canceling the parent cancels the group but not the other way round.
#[derive(Debug)]
pub struct TaskGroup<E> {
    policy: GroupPolicy,
    token: CancellationToken,
    tasks: JoinSet<Result<(), E>>,
}

impl<E: Send + 'static> TaskGroup<E> {
    pub fn new(policy: GroupPolicy, parent: &CancellationToken) -> Self {
        Self {
            policy,
            token: parent.child_token(),
            tasks: JoinSet::new(),
        }
    }

    /// Token tasks must watch to stop when the group is canceled
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Outcome of the next task to finish, `None` once the group is empty.
    ///
    /// Under [`GroupPolicy::FailFast`] an error cancels the group before it
    /// is returned. A panicking task is re-raised on the caller; aborted
    /// tasks are logged and skipped.
    pub async fn join_next(&mut self) -> Option<Result<(), E>> {
        loop {
            match self.tasks.join_next().await? {
                Ok(Ok(())) => return Some(Ok(())),
                Ok(Err(e)) => {
                    if self.policy == GroupPolicy::FailFast && !self.token.is_cancelled() {
                        debug!("Task failed, canceling group");
                        self.token.cancel();
                    }
                    return Some(Err(e));
                }
                Err(join_error) if join_error.is_panic() => {
                    self.token.cancel();
                    std::panic::resume_unwind(join_error.into_panic());
                }
                Err(join_error) => {
                    warn!("Group task aborted: {}", join_error);
                }
            }
        }
    }

    /// Wait for every task and return the first error, if any
    pub async fn wait(mut self) -> Result<(), E> {
        let mut first_error = None;

        while let Some(outcome) = self.join_next().await {
            if let Err(e) = outcome {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    debug!("Suppressed error from group task");
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

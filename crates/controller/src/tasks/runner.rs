use std::time::Duration;

use metrics::counter;
use tracing::{error, info, warn};

use super::{BackgroundTask, execute};
use crate::app_state::AppState;
use crate::config::TaskConfig;
use crate::persistence::notifications;

pub const TASK_FAILED_KIND: &str = "background_task_failed";

/// Whether submitted tasks run on their own tokio task or are awaited by
/// the submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    Spawn,
    Inline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &TaskConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            backoff: Duration::from_secs(cfg.backoff_secs),
            backoff_max: Duration::from_secs(cfg.backoff_max_secs),
        }
    }

    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff.saturating_mul(factor).min(self.backoff_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TaskConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct TaskRunner {
    mode: TaskMode,
    policy: RetryPolicy,
}

impl TaskRunner {
    pub fn new(mode: TaskMode, policy: RetryPolicy) -> Self {
        Self { mode, policy }
    }

    pub fn mode(&self) -> TaskMode {
        self.mode
    }

    pub async fn submit(&self, state: &AppState, task: BackgroundTask) {
        counter!("devconf_tasks_submitted_total", "task" => task.name()).increment(1);
        match self.mode {
            TaskMode::Spawn => {
                let state = state.clone();
                let policy = self.policy;
                tokio::spawn(async move { run_with_retry(state, policy, task).await });
            }
            TaskMode::Inline => run_with_retry(state.clone(), self.policy, task).await,
        }
    }

    pub async fn submit_all(&self, state: &AppState, tasks: Vec<BackgroundTask>) {
        for task in tasks {
            self.submit(state, task).await;
        }
    }
}

async fn run_with_retry(state: AppState, policy: RetryPolicy, task: BackgroundTask) {
    let name = task.name();
    let mut attempt = 0u32;
    loop {
        match execute(state.clone(), task.clone()).await {
            Ok(()) => {
                counter!("devconf_tasks_completed_total", "task" => name, "outcome" => "success")
                    .increment(1);
                if attempt > 0 {
                    info!(task = name, attempt, "background task succeeded after retry");
                }
                return;
            }
            Err(err) if attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay(attempt);
                warn!(?err, task = name, attempt, delay_ms = delay.as_millis() as u64, "background task failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                counter!("devconf_tasks_completed_total", "task" => name, "outcome" => "failure")
                    .increment(1);
                error!(?err, task = name, attempts = attempt + 1, ?task, "background task failed");
                let message = format!("{name} failed after {} attempts: {err}", attempt + 1);
                if let Err(err) =
                    notifications::insert_notification(&state.db, None, "error", TASK_FAILED_KIND, &message)
                        .await
                {
                    warn!(?err, task = name, "failed to record task failure notification");
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff: Duration::from_secs(1),
            backoff_max: Duration::from_secs(5),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(5));
        assert_eq!(policy.delay(40), Duration::from_secs(5));
    }

    #[test]
    fn defaults_follow_task_config() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.backoff_max, Duration::from_secs(600));
    }
}

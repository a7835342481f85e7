use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use sandbox_orchestrator_error::OrchestratorError;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::auth::Caller;
use crate::config::ReadinessConfig;

use super::manager::SandboxManager;
use super::models::{SandboxInfo, SandboxStatus};

pub type LifecycleFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The lifecycle calls the waiter drives.
pub trait SandboxLifecycle: Send + Sync {
    fn get_sandbox(&self, id: Uuid) -> LifecycleFuture<'_, Option<SandboxInfo>>;

    fn start_sandbox<'a>(
        &'a self,
        caller: &'a Caller,
        sandbox_spec_id: Option<&'a str>,
    ) -> LifecycleFuture<'a, Result<SandboxInfo, OrchestratorError>>;

    fn resume_sandbox<'a>(
        &'a self,
        caller: &'a Caller,
        id: Uuid,
    ) -> LifecycleFuture<'a, Result<bool, OrchestratorError>>;
}

impl SandboxLifecycle for SandboxManager {
    fn get_sandbox(&self, id: Uuid) -> LifecycleFuture<'_, Option<SandboxInfo>> {
        Box::pin(SandboxManager::get_sandbox(self, id))
    }

    fn start_sandbox<'a>(
        &'a self,
        caller: &'a Caller,
        sandbox_spec_id: Option<&'a str>,
    ) -> LifecycleFuture<'a, Result<SandboxInfo, OrchestratorError>> {
        Box::pin(SandboxManager::start_sandbox(self, caller, sandbox_spec_id))
    }

    fn resume_sandbox<'a>(
        &'a self,
        caller: &'a Caller,
        id: Uuid,
    ) -> LifecycleFuture<'a, Result<bool, OrchestratorError>> {
        Box::pin(SandboxManager::resume_sandbox(self, caller, id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPhase {
    Requested,
    Starting,
    Running,
    Failed,
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("sandbox {0} not found")]
    NotFound(Uuid),
    #[error("sandbox {id} entered status {status:?}")]
    Failed { id: Uuid, status: SandboxStatus },
    #[error("sandbox {id} not running after {elapsed:?}")]
    Timeout { id: Uuid, elapsed: Duration },
    #[error(transparent)]
    Start(OrchestratorError),
}

impl From<WaitError> for OrchestratorError {
    fn from(err: WaitError) -> Self {
        let message = err.to_string();
        match err {
            WaitError::NotFound(id) => OrchestratorError::not_found("sandbox", id),
            WaitError::Failed { .. } => OrchestratorError::Sandbox { message },
            WaitError::Timeout { .. } => OrchestratorError::Timeout {
                message: Some(message),
            },
            WaitError::Start(inner) => inner,
        }
    }
}

/// Polls a sandbox until it is running, failing fast on terminal statuses and
/// giving up after the configured timeout.
#[derive(Clone)]
pub struct ReadinessWaiter {
    lifecycle: Arc<dyn SandboxLifecycle>,
    config: ReadinessConfig,
}

impl ReadinessWaiter {
    pub fn new(lifecycle: Arc<dyn SandboxLifecycle>, config: ReadinessConfig) -> Self {
        Self { lifecycle, config }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        let max = self.config.max_poll_interval();
        let multiplier = self.config.backoff_multiplier.max(1.0);
        Duration::try_from_secs_f64(current.as_secs_f64() * multiplier)
            .unwrap_or(max)
            .min(max)
    }

    /// Waits for `sandbox_id` to be running, or starts a new sandbox from
    /// `sandbox_spec_id` (default spec when `None`) and waits for that one.
    pub async fn wait_for_sandbox(
        &self,
        caller: &Caller,
        sandbox_id: Option<Uuid>,
        sandbox_spec_id: Option<&str>,
    ) -> Result<SandboxInfo, WaitError> {
        tracing::debug!(sandbox_id = ?sandbox_id, phase = ?WaitPhase::Requested, "waiting for sandbox");
        let mut sandbox = match sandbox_id {
            Some(id) => self
                .lifecycle
                .get_sandbox(id)
                .await
                .ok_or(WaitError::NotFound(id))?,
            None => self
                .lifecycle
                .start_sandbox(caller, sandbox_spec_id)
                .await
                .map_err(WaitError::Start)?,
        };
        let id = sandbox.id;
        tracing::debug!(sandbox_id = %id, phase = ?WaitPhase::Starting, "polling sandbox status");

        let started = Instant::now();
        let deadline = started + self.config.timeout();
        let mut interval = self.config.poll_interval();
        loop {
            match sandbox.status {
                SandboxStatus::Running => {
                    tracing::info!(sandbox_id = %id, phase = ?WaitPhase::Running, "sandbox ready");
                    return Ok(sandbox);
                }
                SandboxStatus::Deleted | SandboxStatus::Error => {
                    tracing::warn!(
                        sandbox_id = %id,
                        status = ?sandbox.status,
                        phase = ?WaitPhase::Failed,
                        "sandbox failed while waiting"
                    );
                    return Err(WaitError::Failed {
                        id,
                        status: sandbox.status,
                    });
                }
                SandboxStatus::Paused => {
                    let resumed = self
                        .lifecycle
                        .resume_sandbox(caller, id)
                        .await
                        .map_err(WaitError::Start)?;
                    if !resumed {
                        return Err(WaitError::NotFound(id));
                    }
                }
                SandboxStatus::Starting => {}
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(sandbox_id = %id, phase = ?WaitPhase::Failed, "timed out waiting for sandbox");
                return Err(WaitError::Timeout {
                    id,
                    elapsed: now - started,
                });
            }
            sleep(interval.min(deadline - now)).await;
            interval = self.next_interval(interval);

            sandbox = self
                .lifecycle
                .get_sandbox(id)
                .await
                .ok_or(WaitError::NotFound(id))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedLifecycle {
        id: Uuid,
        statuses: Mutex<VecDeque<SandboxStatus>>,
        last: Mutex<SandboxStatus>,
        polls: Mutex<usize>,
        resumes: Mutex<usize>,
    }

    impl ScriptedLifecycle {
        fn new(statuses: &[SandboxStatus]) -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                statuses: Mutex::new(statuses.iter().copied().collect()),
                last: Mutex::new(SandboxStatus::Starting),
                polls: Mutex::new(0),
                resumes: Mutex::new(0),
            })
        }

        fn info(&self, status: SandboxStatus) -> SandboxInfo {
            SandboxInfo {
                id: self.id,
                created_by_user_id: "alice".to_string(),
                sandbox_spec_id: "img:latest".to_string(),
                status,
                url: None,
                session_api_key: None,
                exposed_urls: Vec::new(),
                created_at: Utc::now(),
            }
        }

        fn polls(&self) -> usize {
            *self.polls.lock().unwrap()
        }
    }

    impl SandboxLifecycle for ScriptedLifecycle {
        fn get_sandbox(&self, _id: Uuid) -> LifecycleFuture<'_, Option<SandboxInfo>> {
            *self.polls.lock().unwrap() += 1;
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.statuses.lock().unwrap().pop_front() {
                *last = next;
            }
            let info = self.info(*last);
            Box::pin(async move { Some(info) })
        }

        fn start_sandbox<'a>(
            &'a self,
            _caller: &'a Caller,
            _sandbox_spec_id: Option<&'a str>,
        ) -> LifecycleFuture<'a, Result<SandboxInfo, OrchestratorError>> {
            let info = self.info(SandboxStatus::Starting);
            Box::pin(async move { Ok(info) })
        }

        fn resume_sandbox<'a>(
            &'a self,
            _caller: &'a Caller,
            _id: Uuid,
        ) -> LifecycleFuture<'a, Result<bool, OrchestratorError>> {
            *self.resumes.lock().unwrap() += 1;
            Box::pin(async { Ok(true) })
        }
    }

    fn waiter(lifecycle: Arc<ScriptedLifecycle>) -> ReadinessWaiter {
        ReadinessWaiter::new(
            lifecycle,
            ReadinessConfig {
                timeout_secs: 10,
                poll_interval_ms: 1_000,
                backoff_multiplier: 1.0,
                max_poll_interval_ms: 1_000,
            },
        )
    }

    #[test]
    fn huge_multipliers_saturate_at_the_max_interval() {
        for multiplier in [f64::INFINITY, 1e300, f64::NAN] {
            let waiter = ReadinessWaiter::new(
                ScriptedLifecycle::new(&[SandboxStatus::Running]),
                ReadinessConfig {
                    timeout_secs: 10,
                    poll_interval_ms: 2_000,
                    backoff_multiplier: multiplier,
                    max_poll_interval_ms: 10_000,
                },
            );
            let next = waiter.next_interval(Duration::from_millis(2_000));
            assert!(next <= Duration::from_secs(10), "{multiplier}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn returns_once_running() {
        use SandboxStatus::*;
        let lifecycle = ScriptedLifecycle::new(&[Starting, Starting, Running]);
        let id = lifecycle.id;
        let sandbox = waiter(lifecycle.clone())
            .wait_for_sandbox(&Caller::user("alice"), Some(id), None)
            .await
            .expect("sandbox running");
        assert_eq!(sandbox.status, Running);
        assert_eq!(lifecycle.polls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn starts_a_sandbox_when_no_id_is_given() {
        use SandboxStatus::*;
        let lifecycle = ScriptedLifecycle::new(&[Starting, Running]);
        let sandbox = waiter(lifecycle.clone())
            .wait_for_sandbox(&Caller::user("alice"), None, Some("img:latest"))
            .await
            .expect("sandbox running");
        assert_eq!(sandbox.id, lifecycle.id);
        assert_eq!(lifecycle.polls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_running() {
        let lifecycle = ScriptedLifecycle::new(&[SandboxStatus::Starting]);
        let id = lifecycle.id;
        let started = Instant::now();
        let err = waiter(lifecycle)
            .wait_for_sandbox(&Caller::user("alice"), Some(id), None)
            .await
            .expect_err("timeout");
        assert!(matches!(err, WaitError::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn fails_fast_on_error_status() {
        let lifecycle = ScriptedLifecycle::new(&[SandboxStatus::Error]);
        let id = lifecycle.id;
        let started = Instant::now();
        let err = waiter(lifecycle.clone())
            .wait_for_sandbox(&Caller::user("alice"), Some(id), None)
            .await
            .expect_err("failed");
        assert!(matches!(err, WaitError::Failed { status: SandboxStatus::Error, .. }));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(lifecycle.polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_sandboxes_are_resumed() {
        use SandboxStatus::*;
        let lifecycle = ScriptedLifecycle::new(&[Paused, Running]);
        let id = lifecycle.id;
        waiter(lifecycle.clone())
            .wait_for_sandbox(&Caller::user("alice"), Some(id), None)
            .await
            .expect("sandbox running");
        assert_eq!(*lifecycle.resumes.lock().unwrap(), 1);
    }

    #[test]
    fn backoff_is_capped() {
        let lifecycle = ScriptedLifecycle::new(&[]);
        let waiter = ReadinessWaiter::new(
            lifecycle,
            ReadinessConfig {
                timeout_secs: 10,
                poll_interval_ms: 500,
                backoff_multiplier: 2.0,
                max_poll_interval_ms: 1_500,
            },
        );
        let first = waiter.next_interval(Duration::from_millis(500));
        assert_eq!(first, Duration::from_millis(1_000));
        assert_eq!(waiter.next_interval(first), Duration::from_millis(1_500));
    }

    #[test]
    fn wait_errors_map_to_problem_types() {
        let id = Uuid::new_v4();
        let err: OrchestratorError = WaitError::Timeout {
            id,
            elapsed: Duration::from_secs(1),
        }
        .into();
        assert!(matches!(err, OrchestratorError::Timeout { .. }));
        let err: OrchestratorError = WaitError::NotFound(id).into();
        assert!(matches!(err, OrchestratorError::NotFound { .. }));
    }
}

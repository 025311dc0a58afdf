//! Client side of the external actor service: runs are started, polled to a
//! terminal state, and their datasets fetched while still retained.
//!
//! The gateway owns two limits that the rest of the pipeline does not see:
//! a local quota on simultaneously running actor runs (starts beyond it wait
//! in line instead of being sent) and the poll policy that bounds how long a
//! run may take.

pub mod apify;
pub mod poll;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::collectors::{FailureReason, SourceFailure};
use crate::models::listing::RawRecord;

pub use poll::{PollPolicy, PollStep, RunTracker};

/// Lifecycle of one actor run as seen from here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Expired,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::TimedOut | RunState::Expired
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Created => "created",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::TimedOut => "timed out",
            RunState::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Run as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRun {
    pub id: String,
    pub state: RunState,
    pub dataset_id: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("actor service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("actor service unreachable: {message}")]
    Transport { message: String, timeout: bool },

    #[error("unexpected actor service response: {0}")]
    Decode(String),

    #[error("actor run {run_id} ended {state}")]
    RunEnded { run_id: String, state: RunState },

    #[error("actor run {run_id} results have expired")]
    Expired { run_id: String },

    #[error("actor run {run_id} has no dataset")]
    MissingDataset { run_id: String },

    #[error("actor run {run_id} results were already fetched")]
    AlreadyFetched { run_id: String },
}

impl GatewayError {
    /// Worth another attempt under the retry policy.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Http { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            GatewayError::Transport { .. } => true,
            _ => false,
        }
    }

    pub fn from_request(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return GatewayError::Http {
                status: status.as_u16(),
                body: err.to_string(),
            };
        }
        if err.is_decode() {
            return GatewayError::Decode(err.to_string());
        }
        GatewayError::Transport {
            timeout: err.is_timeout(),
            message: err.to_string(),
        }
    }
}

impl From<GatewayError> for SourceFailure {
    fn from(err: GatewayError) -> Self {
        let reason = match &err {
            GatewayError::Http { status: 401 | 403, .. } => FailureReason::Blocked,
            GatewayError::Http { status: 429, .. } => FailureReason::RateLimited,
            GatewayError::Transport { timeout: true, .. } => FailureReason::Timeout,
            GatewayError::RunEnded {
                state: RunState::TimedOut,
                ..
            } => FailureReason::Timeout,
            GatewayError::Decode(_) => FailureReason::ParseError,
            _ => FailureReason::Unavailable,
        };
        SourceFailure::new(reason, err.to_string())
    }
}

/// Wire-level operations of the actor service.
#[async_trait]
pub trait ActorApi: Send + Sync + 'static {
    async fn start_run(&self, actor_id: &str, input: &Value) -> Result<RemoteRun, GatewayError>;

    async fn run_status(&self, run_id: &str) -> Result<RemoteRun, GatewayError>;

    async fn dataset_items(&self, dataset_id: &str, limit: usize)
    -> Result<Vec<Value>, GatewayError>;

    async fn abort_run(&self, run_id: &str) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Actor runs allowed to be running at once across the whole process.
    pub max_running: usize,
    pub poll: PollPolicy,
    /// Upper bound on dataset items fetched per run.
    pub max_results: usize,
    /// How long the service keeps a finished run's dataset.
    pub retention: Duration,
    /// Attempts for start and fetch calls on transient errors.
    pub max_attempts: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_running: 2,
            poll: PollPolicy::default(),
            max_results: 30,
            retention: Duration::from_secs(7 * 24 * 3600),
            max_attempts: 3,
        }
    }
}

/// Handle to one actor run. Holds a quota slot until the run reaches a
/// terminal state; dropping it earlier aborts the remote run in the
/// background.
pub struct ActorRun {
    id: String,
    dataset_id: Option<String>,
    tracker: RunTracker,
    next_wait: Duration,
    started_at: Instant,
    completed_at: Option<Instant>,
    fetched: bool,
    permit: Option<OwnedSemaphorePermit>,
    api: Arc<dyn ActorApi>,
}

impl ActorRun {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> RunState {
        self.tracker.state()
    }
}

impl Drop for ActorRun {
    fn drop(&mut self) {
        if self.completed_at.is_some() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let api = self.api.clone();
        let run_id = self.id.clone();
        tracing::info!(run_id = %run_id, "Abandoning unfinished actor run");
        handle.spawn(async move {
            if let Err(e) = api.abort_run(&run_id).await {
                tracing::debug!(run_id = %run_id, "Best-effort abort failed: {e}");
            }
        });
    }
}

pub struct ActorGateway {
    api: Arc<dyn ActorApi>,
    quota: Arc<Semaphore>,
    config: GatewayConfig,
}

impl ActorGateway {
    pub fn new(api: Arc<dyn ActorApi>, config: GatewayConfig) -> Self {
        let quota = Arc::new(Semaphore::new(config.max_running.max(1)));
        Self { api, quota, config }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Start a run once a quota slot is free.
    pub async fn start(&self, actor_id: &str, input: &Value) -> Result<ActorRun, GatewayError> {
        let permit = self
            .quota
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::Transport {
                message: "actor quota closed".to_string(),
                timeout: false,
            })?;

        let remote = self
            .with_retries("start", || self.api.start_run(actor_id, input))
            .await?;
        tracing::info!(actor = actor_id, run_id = %remote.id, "Actor run started");

        let mut tracker = RunTracker::new(self.config.poll);
        let started_at = Instant::now();
        // Seed the tracker with the state reported at start; the first
        // observation only ever yields a wait or an immediate finish.
        let first = tracker.observe(Some(remote.state), Duration::ZERO);

        let mut run = ActorRun {
            id: remote.id,
            dataset_id: remote.dataset_id,
            tracker,
            next_wait: self.config.poll.initial_interval,
            started_at,
            completed_at: None,
            fetched: false,
            permit: Some(permit),
            api: self.api.clone(),
        };
        match first {
            PollStep::Wait(wait) => run.next_wait = wait,
            PollStep::Finished(state) => self.finish(&mut run, state).await,
        }
        Ok(run)
    }

    /// Poll with backoff until the run is terminal or the max wait is hit.
    pub async fn poll_status(&self, run: &mut ActorRun) -> RunState {
        if run.completed_at.is_some() {
            return run.state();
        }

        loop {
            tokio::time::sleep(run.next_wait).await;

            let observed = match self.api.run_status(&run.id).await {
                Ok(remote) => {
                    if remote.dataset_id.is_some() {
                        run.dataset_id = remote.dataset_id;
                    }
                    Some(remote.state)
                }
                Err(e) => {
                    tracing::warn!(run_id = %run.id, "Actor status poll failed: {e}");
                    None
                }
            };

            match run.tracker.observe(observed, run.started_at.elapsed()) {
                PollStep::Wait(next) => run.next_wait = next,
                PollStep::Finished(state) => {
                    self.finish(run, state).await;
                    return state;
                }
            }
        }
    }

    /// Dataset items of a succeeded run, capped at `max_results`.
    pub async fn fetch_results(&self, run: &mut ActorRun) -> Result<Vec<RawRecord>, GatewayError> {
        if run.state() != RunState::Succeeded {
            return Err(GatewayError::RunEnded {
                run_id: run.id.clone(),
                state: run.state(),
            });
        }
        if run.fetched {
            return Err(GatewayError::AlreadyFetched {
                run_id: run.id.clone(),
            });
        }
        if let Some(completed_at) = run.completed_at
            && completed_at.elapsed() > self.config.retention
        {
            run.tracker = expired_tracker(self.config.poll);
            return Err(GatewayError::Expired {
                run_id: run.id.clone(),
            });
        }

        let dataset_id = run
            .dataset_id
            .clone()
            .ok_or_else(|| GatewayError::MissingDataset {
                run_id: run.id.clone(),
            })?;

        let limit = self.config.max_results;
        let mut items = self
            .with_retries("fetch", || self.api.dataset_items(&dataset_id, limit))
            .await?;
        items.truncate(limit);
        run.fetched = true;

        let total = items.len();
        let records: Vec<RawRecord> = items.into_iter().filter_map(RawRecord::from_value).collect();
        if records.len() < total {
            tracing::debug!(
                run_id = %run.id,
                skipped = total - records.len(),
                "Skipped non-object dataset items"
            );
        }
        Ok(records)
    }

    /// Start, wait for, and fetch one run. Anything short of success is an
    /// error for the calling adapter to report.
    pub async fn run_to_completion(
        &self,
        actor_id: &str,
        input: &Value,
    ) -> Result<Vec<RawRecord>, GatewayError> {
        let mut run = self.start(actor_id, input).await?;
        match self.poll_status(&mut run).await {
            RunState::Succeeded => self.fetch_results(&mut run).await,
            state => Err(GatewayError::RunEnded {
                run_id: run.id().to_string(),
                state,
            }),
        }
    }

    async fn finish(&self, run: &mut ActorRun, state: RunState) {
        run.completed_at = Some(Instant::now());
        run.permit.take();
        tracing::info!(
            run_id = %run.id,
            state = %state,
            polls = run.tracker.polls(),
            "Actor run finished"
        );

        // Giving up locally does not stop the service; free its slot too.
        if state == RunState::TimedOut
            && let Err(e) = self.api.abort_run(&run.id).await
        {
            tracing::debug!(run_id = %run.id, "Best-effort abort failed: {e}");
        }
    }

    async fn with_retries<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, GatewayError>>,
    {
        let attempts = self.config.max_attempts.max(1);
        let mut delay = self.config.poll.initial_interval;
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(op, attempt, "Transient actor service error: {e}");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.poll.max_interval);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn expired_tracker(policy: PollPolicy) -> RunTracker {
    let mut tracker = RunTracker::new(policy);
    tracker.observe(Some(RunState::Expired), Duration::ZERO);
    tracker
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Scripted actor service. Each run reports `Running` for
    /// `polls_until_done` polls and then `final_state`.
    pub struct FakeActorApi {
        pub polls_until_done: usize,
        pub final_state: RunState,
        pub items: Vec<Value>,
        pub start_failures: Mutex<VecDeque<GatewayError>>,
        pub started: AtomicUsize,
        pub active: AtomicUsize,
        pub max_active: AtomicUsize,
        pub aborted: Mutex<Vec<String>>,
        pub limits: Mutex<Vec<usize>>,
        polls: Mutex<std::collections::HashMap<String, usize>>,
    }

    impl FakeActorApi {
        pub fn new(polls_until_done: usize, final_state: RunState, items: Vec<Value>) -> Self {
            Self {
                polls_until_done,
                final_state,
                items,
                start_failures: Mutex::new(VecDeque::new()),
                started: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                aborted: Mutex::new(Vec::new()),
                limits: Mutex::new(Vec::new()),
                polls: Mutex::new(Default::default()),
            }
        }
    }

    #[async_trait]
    impl ActorApi for FakeActorApi {
        async fn start_run(&self, _actor_id: &str, _input: &Value) -> Result<RemoteRun, GatewayError> {
            if let Some(err) = self.start_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            let n = self.started.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            Ok(RemoteRun {
                id: format!("run-{n}"),
                state: RunState::Created,
                dataset_id: Some(format!("ds-{n}")),
            })
        }

        async fn run_status(&self, run_id: &str) -> Result<RemoteRun, GatewayError> {
            let mut polls = self.polls.lock().unwrap();
            let seen = polls.entry(run_id.to_string()).or_insert(0);
            *seen += 1;
            let state = if *seen > self.polls_until_done {
                self.final_state
            } else {
                RunState::Running
            };
            if state.is_terminal() && *seen == self.polls_until_done.saturating_add(1) {
                self.active.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(RemoteRun {
                id: run_id.to_string(),
                state,
                dataset_id: None,
            })
        }

        async fn dataset_items(
            &self,
            _dataset_id: &str,
            limit: usize,
        ) -> Result<Vec<Value>, GatewayError> {
            self.limits.lock().unwrap().push(limit);
            Ok(self.items.clone())
        }

        async fn abort_run(&self, run_id: &str) -> Result<(), GatewayError> {
            self.aborted.lock().unwrap().push(run_id.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use super::testing::FakeActorApi;
    use super::*;

    fn config() -> GatewayConfig {
        GatewayConfig {
            max_running: 1,
            poll: PollPolicy {
                initial_interval: Duration::from_secs(1),
                max_interval: Duration::from_secs(8),
                max_wait: Duration::from_secs(60),
                max_consecutive_errors: 2,
            },
            max_results: 3,
            retention: Duration::from_secs(3600),
            max_attempts: 3,
        }
    }

    fn items(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({ "title": format!("Job {i}") })).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn succeeded_run_results_are_capped() {
        let api = Arc::new(FakeActorApi::new(2, RunState::Succeeded, items(10)));
        let gateway = ActorGateway::new(api.clone(), config());

        let records = gateway.run_to_completion("a~b", &json!({})).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(*api.limits.lock().unwrap(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn a_run_is_fetched_only_once() {
        let api = Arc::new(FakeActorApi::new(0, RunState::Succeeded, items(2)));
        let gateway = ActorGateway::new(api.clone(), config());

        let mut run = gateway.start("a~b", &json!({})).await.unwrap();
        assert_eq!(gateway.poll_status(&mut run).await, RunState::Succeeded);
        assert_eq!(gateway.fetch_results(&mut run).await.unwrap().len(), 2);
        assert!(matches!(
            gateway.fetch_results(&mut run).await,
            Err(GatewayError::AlreadyFetched { .. })
        ));
        assert_eq!(api.limits.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_queues_starts_beyond_the_cap() {
        let api = Arc::new(FakeActorApi::new(3, RunState::Succeeded, items(1)));
        let gateway = Arc::new(ActorGateway::new(api.clone(), config()));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let gateway = gateway.clone();
            handles.push(tokio::spawn(async move {
                gateway.run_to_completion("a~b", &json!({})).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(api.started.load(Ordering::SeqCst), 3);
        assert_eq!(api.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_that_never_finishes_times_out_and_is_aborted() {
        let api = Arc::new(FakeActorApi::new(usize::MAX, RunState::Succeeded, items(1)));
        let gateway = ActorGateway::new(api.clone(), config());

        let err = gateway.run_to_completion("a~b", &json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::RunEnded {
                state: RunState::TimedOut,
                ..
            }
        ));
        assert_eq!(*api.aborted.lock().unwrap(), vec!["run-0".to_string()]);
        assert_eq!(SourceFailure::from(err).reason, FailureReason::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_is_not_fetched() {
        let api = Arc::new(FakeActorApi::new(1, RunState::Failed, items(5)));
        let gateway = ActorGateway::new(api.clone(), config());

        let mut run = gateway.start("a~b", &json!({})).await.unwrap();
        assert_eq!(gateway.poll_status(&mut run).await, RunState::Failed);
        assert!(gateway.fetch_results(&mut run).await.is_err());
        assert!(api.limits.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn results_past_retention_are_expired() {
        let api = Arc::new(FakeActorApi::new(0, RunState::Succeeded, items(2)));
        let gateway = ActorGateway::new(api.clone(), config());

        let mut run = gateway.start("a~b", &json!({})).await.unwrap();
        assert_eq!(gateway.poll_status(&mut run).await, RunState::Succeeded);
        assert_eq!(gateway.fetch_results(&mut run).await.unwrap().len(), 2);

        tokio::time::advance(Duration::from_secs(3601)).await;
        let err = gateway.fetch_results(&mut run).await.unwrap_err();
        assert!(matches!(err, GatewayError::Expired { .. }));
        assert_eq!(run.state(), RunState::Expired);
        assert!(gateway.fetch_results(&mut run).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_start_errors_are_retried_a_bounded_number_of_times() {
        let api = Arc::new(FakeActorApi::new(0, RunState::Succeeded, items(1)));
        api.start_failures.lock().unwrap().extend([
            GatewayError::Http {
                status: 503,
                body: String::new(),
            },
            GatewayError::Transport {
                message: "reset".to_string(),
                timeout: false,
            },
        ]);
        let gateway = ActorGateway::new(api.clone(), config());
        assert!(gateway.run_to_completion("a~b", &json!({})).await.is_ok());

        let api = Arc::new(FakeActorApi::new(0, RunState::Succeeded, items(1)));
        api.start_failures.lock().unwrap().extend((0..3).map(|_| GatewayError::Http {
            status: 502,
            body: String::new(),
        }));
        let gateway = ActorGateway::new(api.clone(), config());
        let err = gateway.run_to_completion("a~b", &json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::Http { status: 502, .. }));
        assert_eq!(api.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_an_unfinished_run_aborts_it() {
        let api = Arc::new(FakeActorApi::new(usize::MAX, RunState::Succeeded, items(1)));
        let gateway = ActorGateway::new(api.clone(), config());

        let run = gateway.start("a~b", &json!({})).await.unwrap();
        drop(run);
        tokio::task::yield_now().await;
        assert_eq!(*api.aborted.lock().unwrap(), vec!["run-0".to_string()]);
    }
}

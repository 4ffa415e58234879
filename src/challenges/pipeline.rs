//! Captcha retry orchestration.
//!
//! Drives the fetch → solve → verify cycle as an explicit state machine:
//!
//! ```text
//! Init ─▶ CaptchaFetched ─▶ Solving ─▶ Verifying ─▶ Success
//!              ▲               │           │
//!              │          SolveFailed  VerifyRejected
//!              └──── delay ────┴───────────┘   (budget spent ─▶ Exhausted)
//! ```
//!
//! Only captcha failures are absorbed. Session, transport and model errors
//! abort the loop immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;

use crate::challenges::core::{CaptchaChallenge, PointSet, RetryPolicy};
use crate::challenges::solvers::{ChallengeSolver, SolveError};
use crate::modules::events::{
    AbortEvent, AttemptEvent, CaptchaEvent, EventDispatcher, FailureEvent, PassedEvent,
};
use crate::session::{SessionClient, SessionError};

/// Invoked with the zero-based attempt index before every fetch.
pub type ProgressCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Observable states of one resolution run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveState {
    Init,
    CaptchaFetched,
    Solving,
    Verifying,
    Success,
    SolveFailed,
    VerifyRejected,
    Exhausted,
    Cancelled,
}

impl ResolveState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResolveState::Success | ResolveState::Exhausted | ResolveState::Cancelled
        )
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("captcha not passed after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error("captcha resolution cancelled")]
    Cancelled,
    #[error("captcha solver failed: {0}")]
    Solver(SolveError),
    #[error("solver worker failed: {0}")]
    Worker(String),
}

/// Successful run summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOutcome {
    /// Number of challenges fetched, including the one that passed.
    pub attempts: u32,
    /// Every state entered, in order.
    pub transitions: Vec<ResolveState>,
}

/// The protocol calls the retry loop needs from a session.
#[async_trait]
pub trait ChallengeGateway: Send {
    fn client_id(&self) -> &str;

    async fn fetch_captcha(&mut self) -> Result<CaptchaChallenge, SessionError>;

    async fn verify(
        &mut self,
        challenge: &CaptchaChallenge,
        points: &PointSet,
    ) -> Result<bool, SessionError>;
}

#[async_trait]
impl ChallengeGateway for SessionClient {
    fn client_id(&self) -> &str {
        SessionClient::client_id(self)
    }

    async fn fetch_captcha(&mut self) -> Result<CaptchaChallenge, SessionError> {
        SessionClient::fetch_captcha(self).await
    }

    async fn verify(
        &mut self,
        challenge: &CaptchaChallenge,
        points: &PointSet,
    ) -> Result<bool, SessionError> {
        SessionClient::verify(self, challenge, points).await
    }
}

enum Step {
    Fetch,
    Solve(CaptchaChallenge),
    Verify(CaptchaChallenge, PointSet),
    Retry(ResolveState, String),
}

/// Bounded fetch/solve/verify loop around a [`ChallengeGateway`].
#[derive(Clone)]
pub struct CaptchaRetryOrchestrator {
    solver: Arc<dyn ChallengeSolver>,
    policy: RetryPolicy,
    progress: Option<ProgressCallback>,
    cancellation: Option<watch::Receiver<bool>>,
    events: EventDispatcher,
}

impl CaptchaRetryOrchestrator {
    pub fn new(solver: Arc<dyn ChallengeSolver>, policy: RetryPolicy) -> Self {
        Self {
            solver,
            policy,
            progress: None,
            cancellation: None,
            events: EventDispatcher::with_logging(),
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Stops the loop between attempts once the channel holds `true`.
    pub fn with_cancellation(mut self, signal: watch::Receiver<bool>) -> Self {
        self.cancellation = Some(signal);
        self
    }

    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    pub fn events_mut(&mut self) -> &mut EventDispatcher {
        &mut self.events
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs until a challenge verifies, the budget is spent, or the run is
    /// cancelled.
    pub async fn resolve<G>(&self, gateway: &mut G) -> Result<ResolveOutcome, ResolveError>
    where
        G: ChallengeGateway + ?Sized,
    {
        let max_attempts = self.policy.max_attempts();
        let client_id = gateway.client_id().to_string();
        let mut transitions = vec![ResolveState::Init];
        let mut attempt: u32 = 0;
        let mut step = Step::Fetch;

        loop {
            step = match step {
                Step::Fetch => {
                    if self.is_cancelled() {
                        return Err(self.cancelled(&client_id, attempt, &mut transitions));
                    }
                    if let Some(progress) = &self.progress {
                        progress(attempt);
                    }
                    self.events.dispatch(CaptchaEvent::AttemptStarted(AttemptEvent {
                        client_id: client_id.clone(),
                        attempt,
                        max_attempts,
                        timestamp: Utc::now(),
                    }));
                    let challenge = gateway.fetch_captcha().await?;
                    attempt += 1;
                    transitions.push(ResolveState::CaptchaFetched);
                    Step::Solve(challenge)
                }
                Step::Solve(challenge) => {
                    transitions.push(ResolveState::Solving);
                    let (challenge, result) = self.solve_off_thread(challenge).await?;
                    match result {
                        Ok(points) => Step::Verify(challenge, points),
                        Err(err) if err.is_retryable() => {
                            Step::Retry(ResolveState::SolveFailed, err.to_string())
                        }
                        Err(err) => return Err(ResolveError::Solver(err)),
                    }
                }
                Step::Verify(challenge, points) => {
                    transitions.push(ResolveState::Verifying);
                    if gateway.verify(&challenge, &points).await? {
                        transitions.push(ResolveState::Success);
                        self.events.dispatch(CaptchaEvent::Passed(PassedEvent {
                            client_id: client_id.clone(),
                            attempt: attempt - 1,
                            timestamp: Utc::now(),
                        }));
                        return Ok(ResolveOutcome {
                            attempts: attempt,
                            transitions,
                        });
                    }
                    Step::Retry(
                        ResolveState::VerifyRejected,
                        "server declined the answer".to_string(),
                    )
                }
                Step::Retry(state, reason) => {
                    transitions.push(state);
                    let delay = self.policy.next_delay();
                    let failure = FailureEvent {
                        client_id: client_id.clone(),
                        attempt: attempt - 1,
                        reason,
                        retry_after: delay,
                        timestamp: Utc::now(),
                    };
                    self.events.dispatch(match state {
                        ResolveState::VerifyRejected => CaptchaEvent::VerificationRejected(failure),
                        _ => CaptchaEvent::SolveFailed(failure),
                    });

                    if !self.pause(delay).await {
                        return Err(self.cancelled(&client_id, attempt, &mut transitions));
                    }
                    if attempt >= max_attempts {
                        transitions.push(ResolveState::Exhausted);
                        self.events.dispatch(CaptchaEvent::Exhausted(AbortEvent {
                            client_id: client_id.clone(),
                            attempts: attempt,
                            timestamp: Utc::now(),
                        }));
                        return Err(ResolveError::Exhausted { attempts: attempt });
                    }
                    Step::Fetch
                }
            };
        }
    }

    /// Runs the CPU-bound solve on the blocking pool, handing the challenge
    /// back so it can be verified.
    async fn solve_off_thread(
        &self,
        challenge: CaptchaChallenge,
    ) -> Result<(CaptchaChallenge, Result<PointSet, SolveError>), ResolveError> {
        let solver = Arc::clone(&self.solver);
        tokio::task::spawn_blocking(move || {
            let result = solver.solve(&challenge);
            (challenge, result)
        })
        .await
        .map_err(|err| ResolveError::Worker(err.to_string()))
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|signal| *signal.borrow())
    }

    /// Sleeps for `delay`; returns `false` if cancelled meanwhile.
    async fn pause(&self, delay: Duration) -> bool {
        let Some(signal) = &self.cancellation else {
            tokio::time::sleep(delay).await;
            return true;
        };
        let mut signal = signal.clone();
        if *signal.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            Ok(_) = signal.wait_for(|cancelled| *cancelled) => false,
        }
    }

    fn cancelled(
        &self,
        client_id: &str,
        attempts: u32,
        transitions: &mut Vec<ResolveState>,
    ) -> ResolveError {
        transitions.push(ResolveState::Cancelled);
        self.events.dispatch(CaptchaEvent::Cancelled(AbortEvent {
            client_id: client_id.to_string(),
            attempts,
            timestamp: Utc::now(),
        }));
        ResolveError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenges::core::{CandidatePoint, TransportError};
    use crate::modules::events::EventHandler;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn challenge(uuid: &str) -> CaptchaChallenge {
        CaptchaChallenge {
            background_image: String::new(),
            pointer_image: String::new(),
            secret_key: "0123456789abcdef".into(),
            uuid: uuid.into(),
            word_count: 4,
        }
    }

    fn points() -> PointSet {
        PointSet::new(vec![CandidatePoint::new(1, 2); 4]).unwrap()
    }

    /// Pops one scripted solve outcome per call.
    struct ScriptedSolver {
        outcomes: Mutex<Vec<Result<PointSet, SolveError>>>,
        calls: AtomicU32,
    }

    impl ScriptedSolver {
        fn new(mut outcomes: Vec<Result<PointSet, SolveError>>) -> Arc<Self> {
            outcomes.reverse();
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicU32::new(0),
            })
        }

        fn always(result: fn() -> Result<PointSet, SolveError>, times: usize) -> Arc<Self> {
            Self::new((0..times).map(|_| result()).collect())
        }
    }

    impl ChallengeSolver for ScriptedSolver {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn solve(&self, _challenge: &CaptchaChallenge) -> Result<PointSet, SolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(SolveError::Classification))
        }
    }

    #[derive(Default)]
    struct FakeGateway {
        fetches: u32,
        verifies: u32,
        verdicts: Vec<bool>,
        fail_fetch: bool,
        seen_uuids: Vec<String>,
    }

    #[async_trait]
    impl ChallengeGateway for FakeGateway {
        fn client_id(&self) -> &str {
            "fake"
        }

        async fn fetch_captcha(&mut self) -> Result<CaptchaChallenge, SessionError> {
            if self.fail_fetch {
                return Err(SessionError::Transport(TransportError::Transport(
                    "connection reset".into(),
                )));
            }
            self.fetches += 1;
            Ok(challenge(&format!("challenge-{}", self.fetches)))
        }

        async fn verify(
            &mut self,
            challenge: &CaptchaChallenge,
            _points: &PointSet,
        ) -> Result<bool, SessionError> {
            self.verifies += 1;
            self.seen_uuids.push(challenge.uuid.clone());
            Ok(self.verdicts.pop().unwrap_or(false))
        }
    }

    fn assert_elapsed(started: Instant, secs: u64) {
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_secs(secs)
                && elapsed < Duration::from_secs(secs) + Duration::from_millis(50),
            "elapsed {elapsed:?}"
        );
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts).with_fixed_delay(Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn classification_failures_exhaust_with_one_delay_per_attempt() {
        let solver = ScriptedSolver::always(|| Err(SolveError::Classification), 3);
        let orchestrator = CaptchaRetryOrchestrator::new(solver.clone(), policy(3));
        let mut gateway = FakeGateway::default();

        let started = Instant::now();
        let err = orchestrator.resolve(&mut gateway).await.unwrap_err();

        assert!(matches!(err, ResolveError::Exhausted { attempts: 3 }));
        assert_eq!(gateway.fetches, 3);
        assert_eq!(gateway.verifies, 0);
        assert_eq!(solver.calls.load(Ordering::SeqCst), 3);
        assert_elapsed(started, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_answers_use_a_fresh_challenge_each_time() {
        let solver = ScriptedSolver::always(|| Ok(points()), 4);
        let orchestrator = CaptchaRetryOrchestrator::new(solver, policy(4));
        let mut gateway = FakeGateway::default();

        let err = orchestrator.resolve(&mut gateway).await.unwrap_err();
        assert!(matches!(err, ResolveError::Exhausted { attempts: 4 }));
        assert_eq!(gateway.fetches, 4);
        assert_eq!(gateway.verifies, 4);
        assert_eq!(
            gateway.seen_uuids,
            vec!["challenge-1", "challenge-2", "challenge-3", "challenge-4"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_second_attempt_after_solve_failure() {
        let solver = ScriptedSolver::new(vec![Err(SolveError::Match { found: 3 }), Ok(points())]);
        let orchestrator = CaptchaRetryOrchestrator::new(solver, policy(10));
        let mut gateway = FakeGateway {
            verdicts: vec![true],
            ..FakeGateway::default()
        };

        let started = Instant::now();
        let outcome = orchestrator.resolve(&mut gateway).await.unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(gateway.fetches, 2);
        assert_eq!(gateway.verifies, 1);
        assert_elapsed(started, 1);
        assert_eq!(
            outcome.transitions,
            vec![
                ResolveState::Init,
                ResolveState::CaptchaFetched,
                ResolveState::Solving,
                ResolveState::SolveFailed,
                ResolveState::CaptchaFetched,
                ResolveState::Solving,
                ResolveState::Verifying,
                ResolveState::Success,
            ]
        );
        assert!(outcome.transitions.last().unwrap().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_success_has_no_delay() {
        let solver = ScriptedSolver::always(|| Ok(points()), 1);
        let orchestrator = CaptchaRetryOrchestrator::new(solver, policy(3));
        let mut gateway = FakeGateway {
            verdicts: vec![true],
            ..FakeGateway::default()
        };
        let started = Instant::now();
        orchestrator.resolve(&mut gateway).await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_reports_each_attempt_index_before_fetch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let solver = ScriptedSolver::always(|| Err(SolveError::Classification), 3);
        let orchestrator = CaptchaRetryOrchestrator::new(solver, policy(3))
            .with_progress(Arc::new(move |attempt| sink.lock().unwrap().push(attempt)));
        let mut gateway = FakeGateway::default();

        let _ = orchestrator.resolve(&mut gateway).await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_aborts_without_retry() {
        let solver = ScriptedSolver::always(|| Ok(points()), 1);
        let orchestrator = CaptchaRetryOrchestrator::new(solver.clone(), policy(5));
        let mut gateway = FakeGateway {
            fail_fetch: true,
            ..FakeGateway::default()
        };

        let started = Instant::now();
        let err = orchestrator.resolve(&mut gateway).await.unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Session(SessionError::Transport(_))
        ));
        assert_eq!(solver.calls.load(Ordering::SeqCst), 0);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn model_failure_is_not_retried() {
        let solver = ScriptedSolver::new(vec![Err(SolveError::Model("bad weights".into()))]);
        let orchestrator = CaptchaRetryOrchestrator::new(solver, policy(5));
        let mut gateway = FakeGateway::default();
        let err = orchestrator.resolve(&mut gateway).await.unwrap_err();
        assert!(matches!(err, ResolveError::Solver(SolveError::Model(_))));
        assert_eq!(gateway.fetches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_before_start_fetches_nothing() {
        let (tx, rx) = watch::channel(true);
        let solver = ScriptedSolver::always(|| Ok(points()), 1);
        let orchestrator =
            CaptchaRetryOrchestrator::new(solver, policy(5)).with_cancellation(rx);
        let mut gateway = FakeGateway::default();

        let err = orchestrator.resolve(&mut gateway).await.unwrap_err();
        assert!(matches!(err, ResolveError::Cancelled));
        assert_eq!(gateway.fetches, 0);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_delay_stops_the_loop() {
        let (tx, rx) = watch::channel(false);
        let solver = ScriptedSolver::always(|| Err(SolveError::Classification), 5);
        let orchestrator = CaptchaRetryOrchestrator::new(solver, policy(5)).with_cancellation(rx);

        let task = tokio::spawn(async move {
            let mut gateway = FakeGateway::default();
            let result = orchestrator.resolve(&mut gateway).await;
            (result, gateway.fetches)
        });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        tx.send(true).unwrap();

        let (result, fetches) = task.await.unwrap();
        assert!(matches!(result, Err(ResolveError::Cancelled)));
        assert_eq!(fetches, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn events_follow_the_attempts() {
        #[derive(Default)]
        struct Recorder(Mutex<Vec<&'static str>>);

        impl EventHandler for Recorder {
            fn handle(&self, event: &CaptchaEvent) {
                let name = match event {
                    CaptchaEvent::AttemptStarted(_) => "attempt",
                    CaptchaEvent::SolveFailed(_) => "solve_failed",
                    CaptchaEvent::VerificationRejected(_) => "rejected",
                    CaptchaEvent::Passed(_) => "passed",
                    CaptchaEvent::Exhausted(_) => "exhausted",
                    CaptchaEvent::Cancelled(_) => "cancelled",
                };
                self.0.lock().unwrap().push(name);
            }
        }

        let recorder = Arc::new(Recorder::default());
        let mut events = EventDispatcher::new();
        events.register_handler(recorder.clone());
        let solver = ScriptedSolver::new(vec![Err(SolveError::Classification), Ok(points())]);
        let orchestrator = CaptchaRetryOrchestrator::new(solver, policy(2)).with_events(events);
        let mut gateway = FakeGateway::default();

        let _ = orchestrator.resolve(&mut gateway).await;
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                "attempt",
                "solve_failed",
                "attempt",
                "rejected",
                "exhausted"
            ]
        );
    }
}

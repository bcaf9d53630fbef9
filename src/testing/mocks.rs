//! Mock implementations of the capability and environment traits.
//!
//! These mocks provide controllable test doubles for providers and
//! environments, enabling deterministic orchestration tests. Every mock is
//! cheaply cloneable and clones share their counters, so a test can keep a
//! handle while the orchestrator owns an `Arc<dyn Trait>`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::capability::{AssessmentRequest, Judge, ProposalRequest, Proposer, ProviderError};
use crate::error::{ConvergeError, Result};
use crate::gateway::{
    ApplyOutcome, EnvironmentGateway, EnvironmentInstance, EnvironmentLauncher, GatewayError,
    ResetOutcome, Views,
};
use crate::state::{ExecutionResult, Feedback, Proposal, Snapshot};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ============================================================================
// Scripted Proposer
// ============================================================================

#[derive(Debug, Default)]
struct ProposerInner {
    calls: AtomicU32,
    format_errors: AtomicU32,
    corrections: Mutex<Vec<String>>,
    strategies: Mutex<Vec<String>>,
}

/// Proposer returning predictable actions.
///
/// By default call `n` returns plan `plan n` and action `action n`.
///
/// # Example
///
/// ```rust,ignore
/// let proposer = ScriptedProposer::new()
///     .with_format_errors(1)
///     .with_action_for_strategy("bold", "CRASH");
/// ```
#[derive(Debug, Clone, Default)]
pub struct ScriptedProposer {
    inner: Arc<ProposerInner>,
    strategy_actions: BTreeMap<String, String>,
    unavailable: bool,
    delay: Option<Duration>,
}

impl ScriptedProposer {
    /// Create a new proposer with default behaviour.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` calls with a format error.
    #[must_use]
    pub fn with_format_errors(self, n: u32) -> Self {
        self.inner.format_errors.store(n, Ordering::SeqCst);
        self
    }

    /// Always return `action` for attempts running `strategy`.
    #[must_use]
    pub fn with_action_for_strategy(mut self, strategy: &str, action: &str) -> Self {
        self.strategy_actions
            .insert(strategy.to_string(), action.to_string());
        self
    }

    /// Fail every call as unavailable.
    #[must_use]
    pub fn with_unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Sleep before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of propose calls so far.
    #[must_use]
    pub fn call_count(&self) -> u32 {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Correction notes received so far.
    #[must_use]
    pub fn corrections(&self) -> Vec<String> {
        lock(&self.inner.corrections).clone()
    }

    /// Strategy labels seen so far, in call order.
    #[must_use]
    pub fn strategies(&self) -> Vec<String> {
        lock(&self.inner.strategies).clone()
    }
}

#[async_trait]
impl Proposer for ScriptedProposer {
    async fn propose(
        &self,
        request: &ProposalRequest<'_>,
    ) -> std::result::Result<Proposal, ProviderError> {
        let n = self.inner.calls.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.inner.strategies).push(request.strategy.to_string());
        if let Some(c) = request.correction {
            lock(&self.inner.corrections).push(c.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable {
            return Err(ProviderError::unavailable("scripted outage"));
        }
        let pending = self.inner.format_errors.load(Ordering::SeqCst);
        if pending > 0 {
            self.inner.format_errors.store(pending - 1, Ordering::SeqCst);
            return Err(ProviderError::format("scripted format error", "garbage"));
        }
        let action = self
            .strategy_actions
            .get(request.strategy)
            .cloned()
            .unwrap_or_else(|| format!("action {n}"));
        Ok(Proposal {
            plan: format!("plan {n}"),
            action,
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ============================================================================
// Scripted Judge
// ============================================================================

#[derive(Debug, Default)]
struct JudgeInner {
    calls: AtomicU32,
    format_errors: AtomicU32,
    scores: Mutex<VecDeque<f64>>,
    last_score: Mutex<Option<f64>>,
}

/// Judge returning scripted scores.
///
/// Rules match on the snapshot description (the mock gateway puts the last
/// action there) and win over the score sequence. Once the sequence runs
/// out the last score repeats; with no sequence the score is 0.5.
#[derive(Debug, Clone, Default)]
pub struct ScriptedJudge {
    inner: Arc<JudgeInner>,
    rules: Vec<(String, f64)>,
}

impl ScriptedJudge {
    /// Create a new judge with default behaviour.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a sequence of scores.
    #[must_use]
    pub fn with_scores(self, scores: &[f64]) -> Self {
        lock(&self.inner.scores).extend(scores.iter().copied());
        self
    }

    /// Score `score` whenever the snapshot mentions `needle`.
    #[must_use]
    pub fn with_rule(mut self, needle: &str, score: f64) -> Self {
        self.rules.push((needle.to_string(), score));
        self
    }

    /// Fail the first `n` calls with a format error.
    #[must_use]
    pub fn with_format_errors(self, n: u32) -> Self {
        self.inner.format_errors.store(n, Ordering::SeqCst);
        self
    }

    /// Number of assess calls so far.
    #[must_use]
    pub fn call_count(&self) -> u32 {
        self.inner.calls.load(Ordering::SeqCst)
    }

    fn next_score(&self, request: &AssessmentRequest<'_>) -> f64 {
        if let Some(snapshot) = request.snapshot {
            if let Some((_, score)) = self
                .rules
                .iter()
                .find(|(needle, _)| snapshot.description.contains(needle.as_str()))
            {
                return *score;
            }
        }
        let mut last = lock(&self.inner.last_score);
        if let Some(score) = lock(&self.inner.scores).pop_front() {
            *last = Some(score);
        }
        last.unwrap_or(0.5)
    }
}

#[async_trait]
impl Judge for ScriptedJudge {
    async fn assess(
        &self,
        request: &AssessmentRequest<'_>,
    ) -> std::result::Result<Feedback, ProviderError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.inner.format_errors.load(Ordering::SeqCst);
        if pending > 0 {
            self.inner.format_errors.store(pending - 1, Ordering::SeqCst);
            return Err(ProviderError::format("scripted format error", "???"));
        }
        let score = self.next_score(request);
        Ok(Feedback {
            score,
            issues: if score < 1.0 {
                vec!["not there yet".to_string()]
            } else {
                Vec::new()
            },
            suggestions: vec!["keep going".to_string()],
            complete: score >= 1.0,
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ============================================================================
// Mock Gateway
// ============================================================================

#[derive(Debug, Default)]
struct GatewayInner {
    applies: AtomicU32,
    resets: AtomicU32,
    rejections: AtomicU32,
    down: AtomicBool,
    applied: Mutex<Vec<String>>,
}

/// In-memory environment.
///
/// State is the list of actions applied since the last reset, and the reset
/// fingerprint is derived from the baseline name so identical baselines
/// always verify identically.
#[derive(Debug, Clone, Default)]
pub struct MockGateway {
    inner: Arc<GatewayInner>,
    endpoint: String,
    unreachable_after: Option<u32>,
    crash_marker: Option<String>,
    fingerprint_override: Option<String>,
}

impl MockGateway {
    /// Create a healthy gateway.
    #[must_use]
    pub fn new() -> Self {
        Self {
            endpoint: "mock://0".to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    /// Reject the first `n` applies (E1).
    #[must_use]
    pub fn with_rejections(self, n: u32) -> Self {
        self.inner.rejections.store(n, Ordering::SeqCst);
        self
    }

    /// Become unreachable after `n` successful applies (E0).
    #[must_use]
    pub fn with_unreachable_after(mut self, n: u32) -> Self {
        self.unreachable_after = Some(n);
        self
    }

    /// Crash when an action contains `marker`.
    #[must_use]
    pub fn with_crash_on(mut self, marker: &str) -> Self {
        self.crash_marker = Some(marker.to_string());
        self
    }

    /// Report `fingerprint` from every reset instead of the derived one.
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: &str) -> Self {
        self.fingerprint_override = Some(fingerprint.to_string());
        self
    }

    /// Fingerprint a healthy mock reports for `baseline`.
    #[must_use]
    pub fn fingerprint_for(baseline: &str) -> String {
        hex::encode(Sha256::digest(baseline.as_bytes()))
    }

    #[must_use]
    pub fn apply_count(&self) -> u32 {
        self.inner.applies.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn reset_count(&self) -> u32 {
        self.inner.resets.load(Ordering::SeqCst)
    }

    /// Actions applied since the last reset.
    #[must_use]
    pub fn applied_actions(&self) -> Vec<String> {
        lock(&self.inner.applied).clone()
    }

    /// Whether the mock has crashed.
    #[must_use]
    pub fn is_down(&self) -> bool {
        self.inner.down.load(Ordering::SeqCst)
    }

    fn check_up(&self) -> std::result::Result<(), GatewayError> {
        if self.is_down() {
            Err(GatewayError::unreachable(&self.endpoint, "connection refused"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EnvironmentGateway for MockGateway {
    async fn apply(&self, action: &str) -> std::result::Result<ApplyOutcome, GatewayError> {
        self.check_up()?;
        if let Some(marker) = &self.crash_marker {
            if action.contains(marker.as_str()) {
                self.inner.down.store(true, Ordering::SeqCst);
                return Err(GatewayError::unreachable(&self.endpoint, "instance crashed"));
            }
        }
        let n = self.inner.applies.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = self.unreachable_after {
            if n > limit {
                self.inner.down.store(true, Ordering::SeqCst);
                return Err(GatewayError::unreachable(&self.endpoint, "connection reset"));
            }
        }

        lock(&self.inner.applied).push(action.to_string());
        let snapshot = Snapshot {
            id: format!("snap-{n}"),
            description: action.to_string(),
        };

        let pending = self.inner.rejections.load(Ordering::SeqCst);
        let result = if pending > 0 {
            self.inner.rejections.store(pending - 1, Ordering::SeqCst);
            ExecutionResult {
                ok: false,
                output: String::new(),
                error: Some(format!("rejected action {n}")),
            }
        } else {
            ExecutionResult {
                ok: true,
                output: format!("applied {action}"),
                error: None,
            }
        };
        Ok(ApplyOutcome { result, snapshot })
    }

    async fn reset(&self, baseline: &str) -> std::result::Result<ResetOutcome, GatewayError> {
        self.check_up()?;
        self.inner.resets.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.applied).clear();
        Ok(ResetOutcome {
            ok: true,
            fingerprint: self
                .fingerprint_override
                .clone()
                .unwrap_or_else(|| Self::fingerprint_for(baseline)),
            error: None,
        })
    }

    async fn capture(&self) -> std::result::Result<Views, GatewayError> {
        self.check_up()?;
        let mut views = Views::new();
        views.insert("front".to_string(), vec![0x89, 0x50, 0x4e, 0x47]);
        Ok(views)
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

// ============================================================================
// Mock Launcher
// ============================================================================

type GatewayFactory = dyn Fn(usize) -> MockGateway + Send + Sync;

#[derive(Default)]
struct LauncherInner {
    launches: Mutex<Vec<usize>>,
    terminations: AtomicU32,
    gateways: Mutex<Vec<MockGateway>>,
}

/// Launcher producing [`MockGateway`] instances.
///
/// Every launch builds a fresh gateway from the factory, so a restarted
/// worker gets a healthy environment.
#[derive(Clone)]
pub struct MockLauncher {
    inner: Arc<LauncherInner>,
    factory: Arc<GatewayFactory>,
    failing_workers: Vec<usize>,
    unready_workers: Vec<usize>,
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLauncher")
            .field("failing_workers", &self.failing_workers)
            .field("unready_workers", &self.unready_workers)
            .finish_non_exhaustive()
    }
}

impl MockLauncher {
    /// Launch healthy mock gateways.
    #[must_use]
    pub fn new() -> Self {
        Self::with_factory(|_| MockGateway::new())
    }

    /// Launch gateways built by `factory(worker_id)`.
    #[must_use]
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn(usize) -> MockGateway + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(LauncherInner::default()),
            factory: Arc::new(factory),
            failing_workers: Vec::new(),
            unready_workers: Vec::new(),
        }
    }

    /// Make launching `worker` fail.
    #[must_use]
    pub fn with_failing_worker(mut self, worker: usize) -> Self {
        self.failing_workers.push(worker);
        self
    }

    /// Make `worker` never become ready.
    #[must_use]
    pub fn with_unready_worker(mut self, worker: usize) -> Self {
        self.unready_workers.push(worker);
        self
    }

    /// Worker ids in launch order (restarts appear again).
    #[must_use]
    pub fn launches(&self) -> Vec<usize> {
        lock(&self.inner.launches).clone()
    }

    #[must_use]
    pub fn terminations(&self) -> u32 {
        self.inner.terminations.load(Ordering::SeqCst)
    }

    /// Every gateway handed out, in launch order.
    #[must_use]
    pub fn gateways(&self) -> Vec<MockGateway> {
        lock(&self.inner.gateways).clone()
    }
}

#[async_trait]
impl EnvironmentLauncher for MockLauncher {
    async fn launch(&self, worker_id: usize) -> Result<Box<dyn EnvironmentInstance>> {
        lock(&self.inner.launches).push(worker_id);
        if self.failing_workers.contains(&worker_id) {
            return Err(ConvergeError::worker_start(worker_id, "scripted launch failure"));
        }
        let gateway = (self.factory)(worker_id).with_endpoint(&format!("mock://{worker_id}"));
        lock(&self.inner.gateways).push(gateway.clone());
        Ok(Box::new(MockInstance {
            endpoint: format!("mock://{worker_id}"),
            gateway,
            ready: !self.unready_workers.contains(&worker_id),
            launcher: self.inner.clone(),
            terminated: false,
        }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

struct MockInstance {
    endpoint: String,
    gateway: MockGateway,
    ready: bool,
    launcher: Arc<LauncherInner>,
    terminated: bool,
}

#[async_trait]
impl EnvironmentInstance for MockInstance {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn gateway(&self) -> Arc<dyn EnvironmentGateway> {
        Arc::new(self.gateway.clone())
    }

    async fn probe(&self) -> bool {
        self.ready && !self.gateway.is_down()
    }

    async fn terminate(&mut self) -> Result<()> {
        if !self.terminated {
            self.terminated = true;
            self.launcher.terminations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// Budget Controller
// Hard caps on iterations, tokens, wall clock, sub-agent runs and per-task retries.
//
// Every counter is checked before it moves: a reservation that would push a
// counter past its cap is refused and nothing is mutated. Callers reserve an
// estimate up front and reconcile with the measured cost afterwards.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::OrchestratorConfig;

/// Width of the usage buckets used to throttle `budget.warning`
const WARNING_BUCKET_PERCENT: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    Iterations,
    Tokens,
    StepTokens,
    WallClock,
    SubagentRuns,
    TaskRetries,
}

impl BudgetKind {
    pub const fn all() -> &'static [Self] {
        &[
            Self::Iterations,
            Self::Tokens,
            Self::StepTokens,
            Self::WallClock,
            Self::SubagentRuns,
            Self::TaskRetries,
        ]
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Iterations => "iterations",
            Self::Tokens => "tokens",
            Self::StepTokens => "step_tokens",
            Self::WallClock => "wall_clock",
            Self::SubagentRuns => "subagent_runs",
            Self::TaskRetries => "task_retries",
        }
    }

    /// Run-wide caps; breaching one stops the run
    const fn is_run_cap(self) -> bool {
        !matches!(self, Self::TaskRetries)
    }
}

impl std::fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A refused reservation: `used + amount` would have exceeded `cap`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("Budget exceeded: {kind} cap is {cap}, request would reach {would_be}")]
pub struct BudgetExceeded {
    pub kind: BudgetKind,
    pub cap: u64,
    pub would_be: u64,
}

/// Persisted per-run counters, each paired with its cap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetLedger {
    pub max_iterations: u64,
    pub iterations_used: u64,
    pub max_tokens: u64,
    pub tokens_used: u64,
    pub max_tokens_per_step: u64,
    /// Largest single-step reservation seen so far
    pub peak_step_tokens: u64,
    pub max_wall_time_secs: u64,
    pub wall_time_secs: u64,
    pub max_subagent_runs: u64,
    pub subagent_runs_used: u64,
    pub max_task_retries: u64,
    #[serde(default)]
    pub task_retries: BTreeMap<String, u64>,
    /// First run-wide breach, if any
    #[serde(default)]
    pub exceeded: Option<BudgetExceeded>,
}

impl BudgetLedger {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_iterations: config.max_iterations as u64,
            iterations_used: 0,
            max_tokens: config.max_total_tokens,
            tokens_used: 0,
            max_tokens_per_step: config.max_tokens_per_step,
            peak_step_tokens: 0,
            max_wall_time_secs: config.max_wall_time_secs,
            wall_time_secs: 0,
            max_subagent_runs: config.max_subagent_runs as u64,
            subagent_runs_used: 0,
            max_task_retries: config.max_task_retries as u64,
            task_retries: BTreeMap::new(),
            exceeded: None,
        }
    }

    pub fn cap(&self, kind: BudgetKind) -> u64 {
        match kind {
            BudgetKind::Iterations => self.max_iterations,
            BudgetKind::Tokens => self.max_tokens,
            BudgetKind::StepTokens => self.max_tokens_per_step,
            BudgetKind::WallClock => self.max_wall_time_secs,
            BudgetKind::SubagentRuns => self.max_subagent_runs,
            BudgetKind::TaskRetries => self.max_task_retries,
        }
    }

    pub fn used(&self, kind: BudgetKind) -> u64 {
        match kind {
            BudgetKind::Iterations => self.iterations_used,
            BudgetKind::Tokens => self.tokens_used,
            BudgetKind::StepTokens => self.peak_step_tokens,
            BudgetKind::WallClock => self.wall_time_secs,
            BudgetKind::SubagentRuns => self.subagent_runs_used,
            BudgetKind::TaskRetries => self.task_retries.values().copied().max().unwrap_or(0),
        }
    }

    fn used_mut(&mut self, kind: BudgetKind) -> Option<&mut u64> {
        match kind {
            BudgetKind::Iterations => Some(&mut self.iterations_used),
            BudgetKind::Tokens => Some(&mut self.tokens_used),
            BudgetKind::SubagentRuns => Some(&mut self.subagent_runs_used),
            BudgetKind::WallClock => Some(&mut self.wall_time_secs),
            BudgetKind::StepTokens | BudgetKind::TaskRetries => None,
        }
    }

    pub fn is_exceeded(&self) -> bool {
        self.exceeded.is_some()
    }

    /// Usage fraction (0.0 to 1.0) for the most-used run-wide dimension
    pub fn usage_percentage(&self) -> f64 {
        self.most_used().map(|(_, pct)| pct).unwrap_or(0.0)
    }

    fn most_used(&self) -> Option<(BudgetKind, f64)> {
        [
            BudgetKind::Iterations,
            BudgetKind::Tokens,
            BudgetKind::WallClock,
            BudgetKind::SubagentRuns,
        ]
        .into_iter()
        .map(|kind| (kind, self.used(kind) as f64 / self.cap(kind).max(1) as f64))
        .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// Proof of a successful reservation, handed back to `reconcile`
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Reservation {
    pub kind: BudgetKind,
    pub amount: u64,
}

/// Outcome of a periodic budget check
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetStatus {
    Ok,
    Warning { kind: BudgetKind, percentage: u8 },
    Exceeded(BudgetExceeded),
}

/// Owns the ledger for one run. Callers serialize access (the engine keeps it
/// behind a per-run mutex).
#[derive(Debug)]
pub struct BudgetController {
    ledger: BudgetLedger,
    /// Wall-clock seconds accumulated before the current active stretch
    elapsed_offset_secs: u64,
    active_since: Option<Instant>,
    warning_threshold: f64,
    last_warning_bucket: BTreeMap<BudgetKind, u8>,
}

impl BudgetController {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self::from_ledger(BudgetLedger::from_config(config), config.budget_warning_threshold)
    }

    /// Rehydrate from a persisted ledger. The clock starts stopped.
    pub fn from_ledger(ledger: BudgetLedger, warning_threshold: f64) -> Self {
        Self {
            elapsed_offset_secs: ledger.wall_time_secs,
            ledger,
            active_since: None,
            warning_threshold,
            last_warning_bucket: BTreeMap::new(),
        }
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    pub fn snapshot(&mut self) -> BudgetLedger {
        self.tick();
        self.ledger.clone()
    }

    pub fn exceeded(&self) -> Option<&BudgetExceeded> {
        self.ledger.exceeded.as_ref()
    }

    /// Start or stop counting wall-clock time. Paused and awaiting-approval
    /// stretches do not count.
    pub fn set_active(&mut self, active: bool) {
        self.tick();
        match (active, self.active_since) {
            (true, None) => self.active_since = Some(Instant::now()),
            (false, Some(_)) => {
                self.elapsed_offset_secs = self.ledger.wall_time_secs;
                self.active_since = None;
            }
            _ => {}
        }
    }

    fn tick(&mut self) {
        if let Some(since) = self.active_since {
            self.ledger.wall_time_secs = self.elapsed_offset_secs + since.elapsed().as_secs();
        }
    }

    fn breach(&mut self, kind: BudgetKind, would_be: u64) -> BudgetExceeded {
        let err = BudgetExceeded {
            kind,
            cap: self.ledger.cap(kind),
            would_be,
        };
        if kind.is_run_cap() && self.ledger.exceeded.is_none() {
            self.ledger.exceeded = Some(err.clone());
        }
        err
    }

    /// Reserve `amount` of `kind`. Fails without mutating any counter when the
    /// reservation would push the counter past its cap.
    pub fn reserve(&mut self, kind: BudgetKind, amount: u64) -> Result<Reservation, BudgetExceeded> {
        self.tick();
        let cap = self.ledger.cap(kind);
        match kind {
            BudgetKind::StepTokens => {
                if amount > cap {
                    return Err(self.breach(kind, amount));
                }
                self.ledger.peak_step_tokens = self.ledger.peak_step_tokens.max(amount);
            }
            BudgetKind::TaskRetries => return self.reserve_retry_slot(amount),
            _ => {
                let used = self.ledger.used(kind);
                let would_be = used.saturating_add(amount);
                if would_be > cap {
                    return Err(self.breach(kind, would_be));
                }
                if let Some(counter) = self.ledger.used_mut(kind) {
                    *counter = would_be;
                }
            }
        }
        Ok(Reservation { kind, amount })
    }

    fn reserve_retry_slot(&mut self, amount: u64) -> Result<Reservation, BudgetExceeded> {
        let would_be = self.ledger.used(BudgetKind::TaskRetries).saturating_add(amount);
        if would_be > self.ledger.max_task_retries {
            return Err(self.breach(BudgetKind::TaskRetries, would_be));
        }
        Ok(Reservation {
            kind: BudgetKind::TaskRetries,
            amount,
        })
    }

    /// Reserve one sub-agent call: `estimate` tokens against the per-step cap
    /// and the run total, plus one sub-agent run. Every dimension is checked
    /// before any counter moves, so a refusal leaves the ledger untouched.
    /// The returned token reservation is handed back to `reconcile`.
    pub fn reserve_call(&mut self, estimate: u64) -> Result<Reservation, BudgetExceeded> {
        self.tick();
        if estimate > self.ledger.max_tokens_per_step {
            return Err(self.breach(BudgetKind::StepTokens, estimate));
        }
        let tokens = self.ledger.tokens_used.saturating_add(estimate);
        if tokens > self.ledger.max_tokens {
            return Err(self.breach(BudgetKind::Tokens, tokens));
        }
        let runs = self.ledger.subagent_runs_used.saturating_add(1);
        if runs > self.ledger.max_subagent_runs {
            return Err(self.breach(BudgetKind::SubagentRuns, runs));
        }

        self.ledger.peak_step_tokens = self.ledger.peak_step_tokens.max(estimate);
        self.ledger.tokens_used = tokens;
        self.ledger.subagent_runs_used = runs;
        Ok(Reservation {
            kind: BudgetKind::Tokens,
            amount: estimate,
        })
    }

    /// Count one builder attempt (the first build or a fix round)
    pub fn record_iteration(&mut self) -> Result<(), BudgetExceeded> {
        self.reserve(BudgetKind::Iterations, 1).map(|_| ())
    }

    /// Replace a reservation with the measured amount. Over-reservations are
    /// refunded (never below zero); an undershoot that would cross the cap is
    /// clamped at the cap and recorded as a breach.
    pub fn reconcile(&mut self, reservation: Reservation, actual: u64) -> Result<(), BudgetExceeded> {
        let kind = reservation.kind;
        let cap = self.ledger.cap(kind);
        let Some(counter) = self.ledger.used_mut(kind) else {
            return Ok(());
        };
        let adjusted = counter.saturating_sub(reservation.amount).saturating_add(actual);
        if adjusted > cap {
            *counter = cap;
            return Err(self.breach(kind, adjusted));
        }
        *counter = adjusted;
        Ok(())
    }

    /// Count one failed attempt for `task_id`. Returns the new failure count;
    /// refuses (without counting) once the task has used its retries.
    pub fn record_retry(&mut self, task_id: &str) -> Result<u64, BudgetExceeded> {
        let current = self.ledger.task_retries.get(task_id).copied().unwrap_or(0);
        let would_be = current + 1;
        if would_be > self.ledger.max_task_retries {
            return Err(self.breach(BudgetKind::TaskRetries, would_be));
        }
        self.ledger.task_retries.insert(task_id.to_string(), would_be);
        Ok(would_be)
    }

    pub fn retries_for(&self, task_id: &str) -> u64 {
        self.ledger.task_retries.get(task_id).copied().unwrap_or(0)
    }

    /// Periodic check between dispatches: wall-clock breaches and throttled
    /// usage warnings (once per 5% bucket per dimension).
    pub fn check(&mut self) -> BudgetStatus {
        self.tick();
        if let Some(err) = &self.ledger.exceeded {
            return BudgetStatus::Exceeded(err.clone());
        }
        if self.ledger.wall_time_secs >= self.ledger.max_wall_time_secs {
            let would_be = self.ledger.wall_time_secs;
            return BudgetStatus::Exceeded(self.breach(BudgetKind::WallClock, would_be));
        }

        let Some((kind, pct)) = self.ledger.most_used() else {
            return BudgetStatus::Ok;
        };
        if pct < self.warning_threshold {
            return BudgetStatus::Ok;
        }
        let percentage = (pct * 100.0).floor().clamp(0.0, 100.0) as u8;
        let bucket = percentage / WARNING_BUCKET_PERCENT;
        let last = self.last_warning_bucket.get(&kind).copied();
        if last.is_some_and(|b| b >= bucket) {
            return BudgetStatus::Ok;
        }
        self.last_warning_bucket.insert(kind, bucket);
        BudgetStatus::Warning { kind, percentage }
    }

    /// Re-validate before resuming a paused run
    pub fn revalidate(&mut self) -> Result<(), BudgetExceeded> {
        match self.check() {
            BudgetStatus::Exceeded(err) => Err(err),
            _ => Ok(()),
        }
    }
}

/// Separate token allowance for a task's validator-driven fix loop
#[derive(Debug, Clone)]
pub struct FixLoopBudget {
    cap: u64,
    used: u64,
}

impl FixLoopBudget {
    pub fn new(cap: u64) -> Self {
        Self { cap, used: 0 }
    }

    pub fn remaining(&self) -> u64 {
        self.cap - self.used
    }

    pub fn reserve(&mut self, amount: u64) -> bool {
        match self.used.checked_add(amount) {
            Some(next) if next <= self.cap => {
                self.used = next;
                true
            }
            _ => false,
        }
    }
}

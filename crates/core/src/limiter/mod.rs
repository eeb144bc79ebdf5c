//! Hierarchical rate limiter
//!
//! Every unit of work is admitted only when both its own scope and the global
//! scope allow it:
//!
//! - the scope's and the global reservoir each hold at least `weight` tokens
//! - fewer than `max_concurrent` units are running in either
//! - at least `min_spacing` has passed since the previous admission in either
//! - neither is paused
//!
//! Within a scope, waiting items are admitted strictly in `(priority, enqueue
//! order)` order; only the head of the queue is considered. Across scopes there
//! is no ordering.
//!
//! All bookkeeping happens under one `parking_lot::Mutex` that is never held
//! across an `.await`. Waiters park on a shared [`Notify`] and also wake on the
//! earliest timed condition (refill, spacing, pause end, expiration), so no
//! background task is needed.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use relaygate_core::{RateLimiter, Scope, ScopeConfig, WorkItem};
//!
//! # async fn run() -> relaygate_common::EngineResult<()> {
//! let limiter = RateLimiter::with_defaults();
//! limiter.configure(
//!     Scope::new("spotify"),
//!     ScopeConfig::builder().max_concurrent(2).reservoir(3, Duration::from_secs(1)).build()?,
//! )?;
//!
//! let value = limiter
//!     .schedule(&Scope::new("spotify"), WorkItem::default(), || async { Ok(42) })
//!     .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

mod config;
mod reservoir;

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use relaygate_common::{Clock, EngineError, EngineResult, SystemClock};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub use config::{RateLimiterConfig, ScopeConfig, ScopeConfigBuilder};
use reservoir::Reservoir;

use crate::scope::Scope;

/// Default priority (0 is most urgent)
pub const DEFAULT_PRIORITY: u32 = 5;

/// A unit of work awaiting admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Lower values are admitted first
    pub priority: u32,
    /// Tokens consumed from both reservoirs on admission
    pub weight: u64,
    /// Deadline after which the item is dropped instead of admitted
    pub expiration: Option<Instant>,
}

impl Default for WorkItem {
    fn default() -> Self {
        Self { priority: DEFAULT_PRIORITY, weight: 1, expiration: None }
    }
}

impl WorkItem {
    /// Set the admission priority (lower first)
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the number of reservoir tokens the item consumes
    pub fn with_weight(mut self, weight: u64) -> Self {
        self.weight = weight;
        self
    }

    /// Drop the item if it is still queued at `expiration`
    pub fn with_expiration(mut self, expiration: Instant) -> Self {
        self.expiration = Some(expiration);
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum Pause {
    Until(Instant),
    Indefinite,
}

/// Why an item cannot be admitted yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Blocked {
    /// Condition changes only on release, resume or reconfiguration
    UntilNotified,
    /// Condition may clear by itself after this long
    For(Duration),
}

#[derive(Debug)]
struct ScopeState {
    config: ScopeConfig,
    reservoir: Reservoir,
    running: u32,
    last_admitted: Option<Instant>,
    paused: Option<Pause>,
    queue: BTreeSet<(u32, u64)>,
}

impl ScopeState {
    fn new(config: ScopeConfig, now: Instant) -> Self {
        Self {
            reservoir: Reservoir::new(&config, now),
            config,
            running: 0,
            last_admitted: None,
            paused: None,
            queue: BTreeSet::new(),
        }
    }

    fn is_paused(&mut self, now: Instant) -> bool {
        match self.paused {
            Some(Pause::Until(until)) if now >= until => {
                self.paused = None;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Check every quota condition except queue position
    fn check(&mut self, now: Instant, weight: u64) -> Option<Blocked> {
        if self.is_paused(now) {
            return Some(match self.paused {
                Some(Pause::Until(until)) => Blocked::For(until.saturating_duration_since(now)),
                _ => Blocked::UntilNotified,
            });
        }
        if self.running >= self.config.max_concurrent {
            return Some(Blocked::UntilNotified);
        }
        if let Some(last) = self.last_admitted {
            match last.checked_add(self.config.min_spacing) {
                Some(next) if now < next => return Some(Blocked::For(next - now)),
                Some(_) => {}
                // Spacing beyond the clock's range: nothing further is admitted
                None => return Some(Blocked::UntilNotified),
            }
        }
        if self.reservoir.level(now) < weight {
            return Some(Blocked::For(self.reservoir.next_refill_in(now)));
        }
        None
    }

    fn admit(&mut self, now: Instant, weight: u64) {
        self.reservoir.take(weight);
        self.running += 1;
        self.last_admitted = Some(now);
    }

    fn release(&mut self) {
        self.running = self.running.saturating_sub(1);
    }
}

#[derive(Debug)]
struct LimiterState {
    global: ScopeState,
    scopes: HashMap<Scope, ScopeState>,
    next_seq: u64,
}

impl LimiterState {
    fn scope_mut(&mut self, scope: &Scope) -> Option<&mut ScopeState> {
        if scope.is_global() {
            Some(&mut self.global)
        } else {
            self.scopes.get_mut(scope)
        }
    }
}

struct Inner<C> {
    clock: C,
    default_scope: Option<ScopeConfig>,
    state: Mutex<LimiterState>,
    notify: Notify,
}

/// Hierarchical reservoir rate limiter
///
/// Cheap to clone; clones share state.
pub struct RateLimiter<C: Clock = SystemClock> {
    inner: Arc<Inner<C>>,
}

impl<C: Clock> Clone for RateLimiter<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl RateLimiter<SystemClock> {
    /// Create a limiter on the system clock
    pub fn new(config: RateLimiterConfig) -> EngineResult<Self> {
        Self::with_clock(config, SystemClock)
    }

    /// Default global quota and lazy registration of unknown scopes
    pub fn with_defaults() -> Self {
        let config = RateLimiterConfig {
            global: ScopeConfig::default(),
            default_scope: Some(ScopeConfig::default()),
        };
        Self::from_validated(config, SystemClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Create a limiter on a custom clock
    pub fn with_clock(config: RateLimiterConfig, clock: C) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(config, clock))
    }

    fn from_validated(config: RateLimiterConfig, clock: C) -> Self {
        let now = clock.now();
        let state = LimiterState {
            global: ScopeState::new(config.global, now),
            scopes: HashMap::new(),
            next_seq: 0,
        };
        Self {
            inner: Arc::new(Inner {
                clock,
                default_scope: config.default_scope,
                state: Mutex::new(state),
                notify: Notify::new(),
            }),
        }
    }

    /// Register or replace a scope's quota.
    ///
    /// Waiting items and the running count are kept; the reservoir restarts
    /// full at the new capacity.
    pub fn configure(&self, scope: Scope, config: ScopeConfig) -> EngineResult<()> {
        config.validate()?;
        let now = self.inner.clock.now();
        {
            let mut state = self.inner.state.lock();
            match state.scope_mut(&scope) {
                Some(existing) => {
                    existing.reservoir.reconfigure(&config, now);
                    existing.config = config;
                }
                None => {
                    state.scopes.insert(scope.clone(), ScopeState::new(config, now));
                }
            }
        }
        info!(scope = %scope, "Rate limit scope configured");
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Admit `item` under `scope`, run `operation`, then release the slot.
    ///
    /// Fails with `Expired` if the item's deadline passes before admission and
    /// with `Configuration` for unknown scopes or unsatisfiable weights. Errors
    /// returned by `operation` are passed through unchanged.
    pub async fn schedule<F, Fut, T>(
        &self,
        scope: &Scope,
        item: WorkItem,
        operation: F,
    ) -> EngineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let permit = self.acquire(scope, &item).await?;
        let result = operation().await;
        drop(permit);
        result
    }

    /// Wait for admission and return a permit holding the concurrency slot.
    ///
    /// Dropping the returned future while waiting gives up the queue position.
    pub async fn acquire(&self, scope: &Scope, item: &WorkItem) -> EngineResult<AdmissionPermit<C>> {
        let enqueued_at = self.inner.clock.now();
        if item.expiration.is_some_and(|deadline| enqueued_at >= deadline) {
            return Err(EngineError::expired(scope.as_str(), Duration::ZERO));
        }

        let ticket = self.enqueue(scope, item)?;

        loop {
            // Registered before checking so a release in between is not missed
            let notified = self.inner.notify.notified();

            let now = self.inner.clock.now();
            if let Some(deadline) = item.expiration {
                if now >= deadline {
                    let waited = now.saturating_duration_since(enqueued_at);
                    warn!(scope = %scope, waited_ms = waited.as_millis() as u64, "Work item expired while queued");
                    return Err(EngineError::expired(scope.as_str(), waited));
                }
            }

            let blocked = match self.try_admit(&ticket, now)? {
                None => {
                    debug!(
                        scope = %scope,
                        priority = item.priority,
                        weight = item.weight,
                        waited_ms = now.saturating_duration_since(enqueued_at).as_millis() as u64,
                        "Work item admitted"
                    );
                    return Ok(ticket.into_permit());
                }
                Some(blocked) => blocked,
            };

            let until_expiry = item.expiration.map(|deadline| deadline.saturating_duration_since(now));
            let sleep_for = match (blocked, until_expiry) {
                (Blocked::For(wait), Some(expiry)) => Some(wait.min(expiry)),
                (Blocked::For(wait), None) => Some(wait),
                (Blocked::UntilNotified, expiry) => expiry,
            };

            match sleep_for {
                Some(duration) => {
                    let sleep = self.inner.clock.sleep(duration);
                    tokio::select! {
                        _ = notified => {}
                        _ = sleep => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn enqueue(&self, scope: &Scope, item: &WorkItem) -> EngineResult<QueueTicket<C>> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();

        if !scope.is_global() && !state.scopes.contains_key(scope) {
            let Some(default_config) = self.inner.default_scope.clone() else {
                return Err(EngineError::config_field(
                    "scope",
                    format!("scope '{}' is not configured", scope),
                ));
            };
            debug!(scope = %scope, "Registering scope with default quota");
            state.scopes.insert(scope.clone(), ScopeState::new(default_config, now));
        }

        check_weight(&mut state, scope, item.weight)?;

        let key = (item.priority, state.next_seq);
        state.next_seq += 1;
        if let Some(scope_state) = state.scope_mut(scope) {
            scope_state.queue.insert(key);
        }

        Ok(QueueTicket {
            limiter: self.clone(),
            scope: scope.clone(),
            key,
            weight: item.weight,
            admitted: false,
        })
    }

    /// Admit the ticket if it heads its queue and every quota allows it
    fn try_admit(&self, ticket: &QueueTicket<C>, now: Instant) -> EngineResult<Option<Blocked>> {
        let mut guard = self.inner.state.lock();
        check_weight(&mut guard, &ticket.scope, ticket.weight)?;

        let LimiterState { global, scopes, .. } = &mut *guard;
        let mut scope_state = if ticket.scope.is_global() {
            None
        } else {
            Some(scopes.get_mut(&ticket.scope).ok_or_else(|| unknown_scope(&ticket.scope))?)
        };

        let head = match scope_state.as_deref() {
            Some(scope_state) => scope_state.queue.first().copied(),
            None => global.queue.first().copied(),
        };
        if head != Some(ticket.key) {
            return Ok(Some(Blocked::UntilNotified));
        }

        if let Some(scope_state) = scope_state.as_deref_mut() {
            if let Some(blocked) = scope_state.check(now, ticket.weight) {
                return Ok(Some(blocked));
            }
        }
        if let Some(blocked) = global.check(now, ticket.weight) {
            return Ok(Some(blocked));
        }

        global.admit(now, ticket.weight);
        match scope_state {
            Some(scope_state) => {
                scope_state.admit(now, ticket.weight);
                scope_state.queue.remove(&ticket.key);
            }
            None => {
                global.queue.remove(&ticket.key);
            }
        }
        drop(guard);

        // The next item in line may now be admissible
        self.inner.notify.notify_waiters();
        Ok(None)
    }

    fn release(&self, scope: &Scope) {
        {
            let mut state = self.inner.state.lock();
            state.global.release();
            if !scope.is_global() {
                if let Some(scope_state) = state.scopes.get_mut(scope) {
                    scope_state.release();
                }
            }
        }
        self.inner.notify.notify_waiters();
    }

    fn dequeue(&self, scope: &Scope, key: (u32, u64)) {
        {
            let mut state = self.inner.state.lock();
            if let Some(scope_state) = state.scope_mut(scope) {
                scope_state.queue.remove(&key);
            }
        }
        self.inner.notify.notify_waiters();
    }

    /// Block admissions in `scope`.
    ///
    /// A non-zero `duration` resumes automatically; `Duration::ZERO`, or a
    /// duration past the clock's range, pauses until [`resume`](Self::resume).
    pub fn pause(&self, scope: &Scope, duration: Duration) -> EngineResult<()> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        let scope_state = state.scope_mut(scope).ok_or_else(|| unknown_scope(scope))?;
        scope_state.paused = match now.checked_add(duration) {
            Some(until) if !duration.is_zero() => Some(Pause::Until(until)),
            _ => Some(Pause::Indefinite),
        };
        info!(scope = %scope, duration_ms = duration.as_millis() as u64, "Scope paused");
        Ok(())
    }

    /// Lift a pause and wake waiting items
    pub fn resume(&self, scope: &Scope) -> EngineResult<()> {
        {
            let mut state = self.inner.state.lock();
            let scope_state = state.scope_mut(scope).ok_or_else(|| unknown_scope(scope))?;
            scope_state.paused = None;
        }
        info!(scope = %scope, "Scope resumed");
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Whether `scope` is currently paused; unknown scopes are not
    pub fn is_paused(&self, scope: &Scope) -> bool {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        state.scope_mut(scope).is_some_and(|scope_state| scope_state.is_paused(now))
    }

    /// Current reservoir level after refill catch-up
    pub fn reservoir_level(&self, scope: &Scope) -> Option<u64> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        state.scope_mut(scope).map(|scope_state| scope_state.reservoir.level(now))
    }

    /// Number of items waiting for admission
    pub fn queued(&self, scope: &Scope) -> usize {
        let mut state = self.inner.state.lock();
        state.scope_mut(scope).map_or(0, |scope_state| scope_state.queue.len())
    }

    /// Number of admitted items still running
    pub fn running(&self, scope: &Scope) -> u32 {
        let mut state = self.inner.state.lock();
        state.scope_mut(scope).map_or(0, |scope_state| scope_state.running)
    }

    /// Configured scopes, excluding the global scope
    pub fn scopes(&self) -> Vec<Scope> {
        let state = self.inner.state.lock();
        let mut scopes: Vec<Scope> = state.scopes.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Whether `scope` has been registered
    pub fn is_configured(&self, scope: &Scope) -> bool {
        scope.is_global() || self.inner.state.lock().scopes.contains_key(scope)
    }
}

fn unknown_scope(scope: &Scope) -> EngineError {
    EngineError::config_field("scope", format!("scope '{}' is not configured", scope))
}

/// Reject weights that no refill could ever satisfy
fn check_weight(state: &mut LimiterState, scope: &Scope, weight: u64) -> EngineResult<()> {
    let global_capacity = state.global.reservoir.capacity();
    let scope_capacity = state.scope_mut(scope).map_or(global_capacity, |s| s.reservoir.capacity());
    let capacity = scope_capacity.min(global_capacity);
    if weight == 0 || weight > capacity {
        return Err(EngineError::config_field(
            "weight",
            format!("weight {} must be between 1 and reservoir capacity {}", weight, capacity),
        ));
    }
    Ok(())
}

/// Queue position of a waiting item; leaving the queue on drop
struct QueueTicket<C: Clock> {
    limiter: RateLimiter<C>,
    scope: Scope,
    key: (u32, u64),
    weight: u64,
    admitted: bool,
}

impl<C: Clock> QueueTicket<C> {
    fn into_permit(mut self) -> AdmissionPermit<C> {
        self.admitted = true;
        AdmissionPermit { limiter: self.limiter.clone(), scope: self.scope.clone() }
    }
}

impl<C: Clock> Drop for QueueTicket<C> {
    fn drop(&mut self) {
        if !self.admitted {
            self.limiter.dequeue(&self.scope, self.key);
        }
    }
}

/// Concurrency slot held while an admitted operation runs
///
/// Dropping the permit frees the slot in the scope and the global scope.
pub struct AdmissionPermit<C: Clock = SystemClock> {
    limiter: RateLimiter<C>,
    scope: Scope,
}

impl<C: Clock> AdmissionPermit<C> {
    /// Scope the permit was granted in
    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

impl<C: Clock> std::fmt::Debug for AdmissionPermit<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit").field("scope", &self.scope).finish()
    }
}

impl<C: Clock> Drop for AdmissionPermit<C> {
    fn drop(&mut self) {
        self.limiter.release(&self.scope);
    }
}

//! # Stage: Polling Registrar
//!
//! ## Responsibility
//! Re-issue registered requests on one shared clock and hand successful,
//! changed responses to the registered handlers. Live views register on
//! mount and unregister on teardown.
//!
//! ## Guarantees
//! - One clock per registrar. Every registration is polled at the same
//!   interval, in one batched request per tick
//! - A handler is not re-invoked while the response value is unchanged
//!   (fingerprint = serialized `value`)
//! - `unregister` is idempotent and may be called from inside a handler
//! - After `stop` returns, no handler fires, not even for replies already in
//!   flight. A handler running on another thread is waited for
//! - Interval changes re-arm a running clock immediately
//!
//! ## NOT Responsible For
//! - Delivering failures (error responses are logged, never handed out)
//! - Aborting HTTP calls that are already in flight

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::protocol::{AgentRequest, AgentResponse};

/// Interval used when polling is started with a zero period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Callback invoked with each changed, successful response.
pub type SuccessHandler = Arc<dyn Fn(&AgentResponse) + Send + Sync>;

/// Sends one batch and returns the responses in request order.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn execute(&self, requests: Vec<AgentRequest>) -> Result<Vec<AgentResponse>>;
}

/// Identifies one registration. Stays unique for the registrar's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationHandle(u64);

impl std::fmt::Display for RegistrationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

struct Registration {
    request: AgentRequest,
    handlers: Vec<SuccessHandler>,
    last_fingerprint: Option<String>,
}

struct Shared {
    registrations: Mutex<BTreeMap<u64, Registration>>,
    next_id: AtomicU64,
    interval_ms: AtomicU64,
    running: AtomicBool,
    generation: AtomicU64,
    clock: Mutex<Option<JoinHandle<()>>>,
    executor: Option<Arc<dyn BatchExecutor>>,
    /// Held from the generation check through one handler call.
    delivery: Mutex<()>,
    /// Thread currently inside a handler, if any.
    delivering: Mutex<Option<ThreadId>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Ok(clock) = self.clock.get_mut() {
            if let Some(handle) = clock.take() {
                handle.abort();
            }
        }
    }
}

/// Shared-clock poller. Cheap to clone; clones drive the same registrations.
#[derive(Clone)]
pub struct PollingRegistrar {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PollingRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingRegistrar")
            .field("jobs", &self.jobs().len())
            .field("running", &self.is_running())
            .field("interval", &self.interval())
            .finish()
    }
}

impl PollingRegistrar {
    /// A registrar that polls through `executor`.
    pub fn new(executor: Arc<dyn BatchExecutor>) -> Self {
        Self::build(Some(executor))
    }

    /// A registrar with nothing to poll through. `start`/`stop` only flip the
    /// running flag; used by sessions without an agent.
    pub fn detached() -> Self {
        Self::build(None)
    }

    fn build(executor: Option<Arc<dyn BatchExecutor>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                registrations: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                interval_ms: AtomicU64::new(DEFAULT_POLL_INTERVAL.as_millis() as u64),
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                clock: Mutex::new(None),
                executor,
                delivery: Mutex::new(()),
                delivering: Mutex::new(None),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Registrations
    // -----------------------------------------------------------------------

    /// Poll `request` on every tick and pass changed successes to `handler`.
    pub fn register<F>(&self, request: AgentRequest, handler: F) -> RegistrationHandle
    where
        F: Fn(&AgentResponse) + Send + Sync + 'static,
    {
        self.register_all(request, vec![Arc::new(handler) as SuccessHandler])
    }

    /// Like [`register`](Self::register) with several handlers, invoked in order.
    pub fn register_all(&self, request: AgentRequest, handlers: Vec<SuccessHandler>) -> RegistrationHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut regs) = self.shared.registrations.lock() {
            regs.insert(
                id,
                Registration {
                    request,
                    handlers,
                    last_fingerprint: None,
                },
            );
        }
        debug!(job = id, "registered poll request");
        RegistrationHandle(id)
    }

    /// Drop a registration. Returns `false` if it was already gone.
    ///
    /// Once this returns, none of the registration's handlers run again.
    pub fn unregister(&self, handle: RegistrationHandle) -> bool {
        let removed = self
            .shared
            .registrations
            .lock()
            .map(|mut regs| regs.remove(&handle.0).is_some())
            .unwrap_or(false);
        if removed {
            self.wait_for_delivery();
            debug!(job = handle.0, "unregistered poll request");
        }
        removed
    }

    /// Handles of every active registration, oldest first.
    pub fn jobs(&self) -> Vec<RegistrationHandle> {
        self.shared
            .registrations
            .lock()
            .map(|regs| regs.keys().copied().map(RegistrationHandle).collect())
            .unwrap_or_default()
    }

    fn is_registered(&self, id: u64) -> bool {
        self.shared
            .registrations
            .lock()
            .map(|regs| regs.contains_key(&id))
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Clock
    // -----------------------------------------------------------------------

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.shared.interval_ms.load(Ordering::Acquire))
    }

    /// Change the shared interval. A running clock is restarted so the new
    /// period counts from now; replies in flight from the old clock are dropped.
    pub fn set_interval(&self, interval: Duration) {
        self.store_interval(interval);
        if self.is_running() {
            self.start_clock();
        }
    }

    fn store_interval(&self, interval: Duration) {
        let interval = if interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            interval
        };
        self.shared
            .interval_ms
            .store(interval.as_millis().max(1) as u64, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Start (or restart) the clock at `interval`.
    ///
    /// Without an executor, or outside a tokio runtime, only the running flag
    /// is set.
    pub fn start(&self, interval: Duration) {
        self.store_interval(interval);
        self.start_clock();
    }

    fn start_clock(&self) {
        self.abort_clock();
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.running.store(true, Ordering::Release);

        if self.shared.executor.is_none() {
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("no tokio runtime, poll clock not started");
                return;
            }
        };
        let weak = Arc::downgrade(&self.shared);
        let task = handle.spawn(run_clock(weak, generation));
        if let Ok(mut clock) = self.shared.clock.lock() {
            *clock = Some(task);
        }
        debug!(interval_ms = self.interval().as_millis() as u64, "poll clock started");
    }

    /// Stop the clock. Replies still in flight are discarded.
    ///
    /// Blocks until a handler running on another thread has returned.
    pub fn stop(&self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        self.shared.running.store(false, Ordering::Release);
        self.abort_clock();
        self.wait_for_delivery();
    }

    fn abort_clock(&self) {
        if let Ok(mut clock) = self.shared.clock.lock() {
            if let Some(task) = clock.take() {
                task.abort();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Delivery guard
    // -----------------------------------------------------------------------

    fn delivery_guard(&self) -> MutexGuard<'_, ()> {
        self.shared.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_delivering(&self, thread: Option<ThreadId>) {
        if let Ok(mut delivering) = self.shared.delivering.lock() {
            *delivering = thread;
        }
    }

    /// Wait out a handler call in progress, unless it is the caller itself.
    fn wait_for_delivery(&self) {
        let current = thread::current().id();
        let inside_handler = self
            .shared
            .delivering
            .lock()
            .map(|d| *d == Some(current))
            .unwrap_or(false);
        if !inside_handler {
            drop(self.delivery_guard());
        }
    }

    // -----------------------------------------------------------------------
    // One tick
    // -----------------------------------------------------------------------

    /// Poll every registration once, in one batch.
    ///
    /// # Returns
    /// - `Ok(n)` where `n` is the number of handler invocations
    /// - `Err(_)` when the batch itself failed (transport, HTTP, auth)
    pub async fn poll_once(&self) -> Result<usize> {
        let executor = match &self.shared.executor {
            Some(executor) => executor.clone(),
            None => return Ok(0),
        };
        let generation = self.shared.generation.load(Ordering::Acquire);
        let (ids, requests): (Vec<u64>, Vec<AgentRequest>) = match self.shared.registrations.lock() {
            Ok(regs) => regs.iter().map(|(id, reg)| (*id, reg.request.clone())).unzip(),
            Err(_) => return Ok(0),
        };
        if requests.is_empty() {
            return Ok(0);
        }

        let responses = executor.execute(requests).await?;
        if self.shared.generation.load(Ordering::Acquire) != generation {
            debug!("poll cancelled while in flight, discarding responses");
            return Ok(0);
        }

        let mut delivered = 0;
        for (id, response) in ids.into_iter().zip(responses.iter()) {
            if !response.is_success() {
                debug!(
                    job = id,
                    status = response.status,
                    error = response.error.as_deref().unwrap_or(""),
                    "poll request failed"
                );
                continue;
            }
            let Some(handlers) = self.changed_handlers(id, response) else {
                continue;
            };
            for handler in handlers {
                let _guard = self.delivery_guard();
                if self.shared.generation.load(Ordering::Acquire) != generation || !self.is_registered(id) {
                    break;
                }
                self.set_delivering(Some(thread::current().id()));
                handler(response);
                self.set_delivering(None);
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Record the new fingerprint and return the handlers to call, or `None`
    /// when the value is unchanged or the registration is gone.
    fn changed_handlers(&self, id: u64, response: &AgentResponse) -> Option<Vec<SuccessHandler>> {
        let fingerprint = serde_json::to_string(&response.value).ok();
        let mut regs = self.shared.registrations.lock().ok()?;
        let reg = regs.get_mut(&id)?;
        if fingerprint.is_some() && reg.last_fingerprint == fingerprint {
            return None;
        }
        reg.last_fingerprint = fingerprint;
        Some(reg.handlers.clone())
    }
}

async fn run_clock(shared: Weak<Shared>, generation: u64) {
    let mut consecutive_failures: u32 = 0;
    loop {
        let interval = match shared.upgrade() {
            Some(s) => Duration::from_millis(s.interval_ms.load(Ordering::Acquire)),
            None => return,
        };
        tokio::time::sleep(interval).await;

        let registrar = match shared.upgrade() {
            Some(shared) => PollingRegistrar { shared },
            None => return,
        };
        if registrar.shared.generation.load(Ordering::Acquire) != generation {
            return;
        }
        match registrar.poll_once().await {
            Ok(_) => consecutive_failures = 0,
            Err(e) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                if consecutive_failures >= 5 {
                    error!(error = %e, consecutive_failures, "poll failed repeatedly, will retry next tick");
                } else {
                    warn!(error = %e, "poll failed, will retry next tick");
                }
            }
        }
    }
}

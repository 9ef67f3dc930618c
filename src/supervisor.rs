//! Worker pool supervision.
//!
//! The supervisor owns a fixed number of worker slots. Each request leases a
//! slot, makes sure a live worker sits in it, and waits for the response
//! under a hard deadline. A worker that misses its deadline, dies, or writes
//! garbage is killed and its slot emptied; the next request (or a background
//! task, with the `immediate` restart policy) starts a fresh one.
//!
//! Concurrency is bounded by a fair semaphore with one permit per slot, so a
//! pool of one serves requests strictly in arrival order.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

use crate::config::{RequestDefaults, RestartPolicy, SupervisorConfig};
use crate::requests::TypedRequest;
use crate::transport::{
    OperationRequest, OperationResponse, Transport, TransportError, WorkerLauncher,
};

/// Operation every fresh worker must answer before it is used.
const READY_PROBE: &str = "Ping";

/// Why a supervised request produced no worker response.
#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    #[error("{operation} timed out after {}s", .after.as_secs_f64())]
    Timeout { operation: String, after: Duration },

    #[error("worker process exited unexpectedly")]
    Crashed { status: Option<i32> },

    #[error("malformed worker output")]
    Malformed { message: String },

    #[error("failed to start worker: {0}")]
    Spawn(String),

    #[error(transparent)]
    Transport(TransportError),

    #[error("supervisor is shut down")]
    ShuttingDown,
}

impl SupervisorError {
    /// Short class name reported in response diagnostics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Crashed { .. } => "crash",
            Self::Malformed { .. } => "malformed",
            Self::Spawn(_) => "spawn",
            Self::Transport(_) => "transport",
            Self::ShuttingDown => "shutdown",
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            Self::Crashed { status: Some(status) } => Some(format!("exit status {status}")),
            Self::Malformed { message } => Some(message.clone()),
            _ => None,
        }
    }

    pub fn into_response(self) -> OperationResponse {
        OperationResponse::failure_with(self.to_string(), self.kind(), self.detail())
    }
}

/// Counters kept per slot across worker generations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStats {
    pub requests: u64,
    pub spawns: u64,
    pub restarts: u64,
    pub timeouts: u64,
    pub crashes: u64,
    pub malformed: u64,
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub slot: usize,
    pub pid: Option<u32>,
    pub alive: bool,
    pub busy: bool,
    pub idle_seconds: Option<u64>,
    #[serde(flatten)]
    pub stats: SlotStats,
}

#[derive(Debug, Default)]
struct SlotInfo {
    pid: Option<u32>,
    busy: bool,
    last_used: Option<Instant>,
    stats: SlotStats,
}

struct Slot {
    index: usize,
    worker: Mutex<Option<Box<dyn Transport>>>,
    info: std::sync::Mutex<SlotInfo>,
}

impl Slot {
    fn new(index: usize) -> Self {
        Self {
            index,
            worker: Mutex::new(None),
            info: std::sync::Mutex::new(SlotInfo::default()),
        }
    }

    fn update<T>(&self, f: impl FnOnce(&mut SlotInfo) -> T) -> T {
        let mut info = self.info.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut info)
    }

    fn installed(&self, worker: &dyn Transport) {
        let pid = worker.pid();
        self.update(|info| {
            info.pid = pid;
            info.last_used = Some(Instant::now());
            if info.stats.spawns > 0 {
                info.stats.restarts += 1;
            }
            info.stats.spawns += 1;
        });
    }
}

/// Exclusive use of one slot for one request.
///
/// Field order matters: the slot guard is released before the permit, so a
/// task woken by the permit finds the slot free.
struct Lease<'a> {
    slot: &'a Slot,
    worker: MutexGuard<'a, Option<Box<dyn Transport>>>,
    _permit: SemaphorePermit<'a>,
    in_flight: bool,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if self.in_flight {
            // The caller went away mid-request; the response still in the pipe
            // would be paired with the next request. Dropping the transport
            // kills the worker.
            if let Some(worker) = self.worker.take() {
                warn!(
                    slot = self.slot.index,
                    pid = ?worker.pid(),
                    "Request abandoned, discarding worker"
                );
            }
            self.slot.update(|info| info.pid = None);
        }
        self.slot.update(|info| info.busy = false);
    }
}

/// Pool of supervised workers.
pub struct Supervisor {
    launcher: Arc<dyn WorkerLauncher>,
    settings: SupervisorConfig,
    defaults: RequestDefaults,
    slots: Vec<Arc<Slot>>,
    permits: Semaphore,
    next_slot: AtomicUsize,
    closed: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        settings: SupervisorConfig,
        defaults: RequestDefaults,
    ) -> Self {
        let pool_size = settings.pool_size.max(1);
        Self {
            launcher,
            slots: (0..pool_size).map(|i| Arc::new(Slot::new(i))).collect(),
            permits: Semaphore::new(pool_size),
            next_slot: AtomicUsize::new(0),
            closed: Arc::new(AtomicBool::new(false)),
            settings,
            defaults,
        }
    }

    pub const fn settings(&self) -> &SupervisorConfig {
        &self.settings
    }

    pub const fn defaults(&self) -> &RequestDefaults {
        &self.defaults
    }

    /// Run one request. Never fails: supervision failures come back as
    /// failure responses with a diagnostic `errorType`.
    pub async fn execute(
        &self,
        request: &OperationRequest,
        timeout_secs: u64,
    ) -> OperationResponse {
        self.try_execute(request, timeout_secs)
            .await
            .unwrap_or_else(SupervisorError::into_response)
    }

    /// Run one request with a deadline of `timeout_secs` (0 means the
    /// configured default).
    pub async fn try_execute(
        &self,
        request: &OperationRequest,
        timeout_secs: u64,
    ) -> Result<OperationResponse, SupervisorError> {
        let deadline = if timeout_secs == 0 {
            self.settings.default_timeout()
        } else {
            Duration::from_secs(timeout_secs)
        };
        self.try_execute_within(request, deadline).await
    }

    /// Run one request with an explicit deadline. Worker start-up and the
    /// ready probe are bounded separately and do not count against it.
    pub async fn try_execute_within(
        &self,
        request: &OperationRequest,
        deadline: Duration,
    ) -> Result<OperationResponse, SupervisorError> {
        let mut lease = self.lease().await?;
        self.ensure_worker(&mut lease).await?;

        let index = lease.slot.index;
        lease.in_flight = true;
        let started = Instant::now();
        let outcome = match lease.worker.as_mut() {
            Some(worker) => tokio::time::timeout(deadline, worker.request(request)).await,
            None => return Err(SupervisorError::Spawn("worker slot is empty".into())),
        };
        lease.in_flight = false;
        lease.slot.update(|info| {
            info.stats.requests += 1;
            info.last_used = Some(Instant::now());
        });

        match outcome {
            Ok(Ok(response)) => {
                debug!(
                    slot = index,
                    operation = %request.operation,
                    success = response.success,
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "Request completed"
                );
                Ok(response)
            }
            Ok(Err(TransportError::Malformed { message })) => {
                lease.slot.update(|info| info.stats.malformed += 1);
                self.retire(&mut lease, "malformed output").await;
                Err(SupervisorError::Malformed { message })
            }
            Ok(Err(TransportError::Closed { status })) => {
                lease.slot.update(|info| info.stats.crashes += 1);
                self.retire(&mut lease, "exited").await;
                Err(SupervisorError::Crashed { status })
            }
            Ok(Err(err)) => {
                self.retire(&mut lease, "transport failure").await;
                Err(SupervisorError::Transport(err))
            }
            Err(_) => {
                lease.slot.update(|info| info.stats.timeouts += 1);
                warn!(
                    slot = index,
                    operation = %request.operation,
                    deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                    "Request timed out, killing worker"
                );
                self.retire(&mut lease, "timeout").await;
                Err(SupervisorError::Timeout {
                    operation: request.operation.clone(),
                    after: deadline,
                })
            }
        }
    }

    /// Send a typed request after filling in configured defaults.
    pub async fn call<R: TypedRequest>(&self, mut request: R) -> OperationResponse {
        request.apply_defaults(&self.defaults);
        match request.to_envelope() {
            Ok(envelope) => self.execute(&envelope, request.timeout_seconds()).await,
            Err(e) => OperationResponse::failure_with(
                format!("invalid parameters for {}: {e}", R::OPERATION),
                "validation",
                None,
            ),
        }
    }

    async fn lease(&self) -> Result<Lease<'_>, SupervisorError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SupervisorError::ShuttingDown);
        }
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SupervisorError::ShuttingDown)?;

        let free = self
            .slots
            .iter()
            .find_map(|slot| slot.worker.try_lock().ok().map(|guard| (slot, guard)));
        let slot = match free {
            Some(found) => found,
            None => {
                // A reaper sweep or background restart holds a slot.
                let i = self.next_slot.fetch_add(1, Ordering::Relaxed) % self.slots.len();
                let slot = &self.slots[i];
                (slot, slot.worker.lock().await)
            }
        };
        let (slot, worker) = slot;
        slot.update(|info| info.busy = true);
        Ok(Lease {
            slot: slot.as_ref(),
            worker,
            _permit: permit,
            in_flight: false,
        })
    }

    async fn ensure_worker(&self, lease: &mut Lease<'_>) -> Result<(), SupervisorError> {
        if let Some(worker) = lease.worker.as_mut() {
            if worker.is_alive() {
                return Ok(());
            }
            warn!(
                slot = lease.slot.index,
                pid = ?worker.pid(),
                "Worker died while idle, replacing"
            );
            lease.slot.update(|info| {
                info.stats.crashes += 1;
                info.pid = None;
            });
            *lease.worker = None;
        }

        let worker = start_worker(self.launcher.as_ref(), self.settings.ready_timeout()).await?;
        lease.slot.installed(worker.as_ref());
        *lease.worker = Some(worker);
        Ok(())
    }

    async fn retire(&self, lease: &mut Lease<'_>, reason: &'static str) {
        if let Some(mut worker) = lease.worker.take() {
            let pid = worker.pid();
            worker.cancel().await;
            info!(slot = lease.slot.index, ?pid, reason, "Worker retired");
        }
        lease.slot.update(|info| info.pid = None);
        if self.settings.restart == RestartPolicy::Immediate {
            self.schedule_restart(lease.slot.index);
        }
    }

    /// Start a replacement worker in the background. It runs once the current
    /// lease on the slot is released.
    fn schedule_restart(&self, index: usize) {
        let slot = Arc::clone(&self.slots[index]);
        let launcher = Arc::clone(&self.launcher);
        let closed = Arc::clone(&self.closed);
        let ready_timeout = self.settings.ready_timeout();

        tokio::spawn(async move {
            let mut worker = slot.worker.lock().await;
            if worker.is_some() || closed.load(Ordering::Acquire) {
                return;
            }
            match start_worker(launcher.as_ref(), ready_timeout).await {
                Ok(fresh) => {
                    slot.installed(fresh.as_ref());
                    *worker = Some(fresh);
                }
                Err(e) => warn!(slot = slot.index, error = %e, "Background restart failed"),
            }
        });
    }

    /// Stop workers idle for longer than `max_idle`. Busy slots are skipped.
    pub async fn reap_idle(&self, max_idle: Duration) -> usize {
        let mut reaped = 0;
        for slot in &self.slots {
            let Ok(mut worker) = slot.worker.try_lock() else {
                continue;
            };
            let Some(transport) = worker.as_mut() else {
                continue;
            };
            let idle = slot.update(|info| info.last_used.map(|t| t.elapsed()));
            let dead = !transport.is_alive();
            if dead || idle.is_some_and(|idle| idle > max_idle) {
                let pid = transport.pid();
                transport.shutdown().await;
                *worker = None;
                slot.update(|info| info.pid = None);
                info!(slot = slot.index, ?pid, dead, "Reaped idle worker");
                reaped += 1;
            }
        }
        reaped
    }

    /// Start the background idle reaper, if an idle timeout is configured.
    pub fn start_reaper(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let max_idle = self.settings.idle_timeout()?;
        let interval = (max_idle / 2).clamp(Duration::from_secs(1), Duration::from_secs(60));
        let supervisor = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick is immediate, skip it
            loop {
                ticker.tick().await;
                if supervisor.closed.load(Ordering::Acquire) {
                    break;
                }
                debug!("Reaper sweep");
                supervisor.reap_idle(max_idle).await;
            }
        }))
    }

    /// Snapshot of every slot.
    pub fn status(&self) -> Vec<WorkerStatus> {
        self.slots
            .iter()
            .map(|slot| {
                let alive = match slot.worker.try_lock() {
                    Ok(mut worker) => worker.as_mut().is_some_and(|w| w.is_alive()),
                    Err(_) => slot.update(|info| info.pid.is_some()),
                };
                slot.update(|info| WorkerStatus {
                    slot: slot.index,
                    pid: info.pid,
                    alive,
                    busy: info.busy,
                    idle_seconds: info
                        .last_used
                        .filter(|_| !info.busy)
                        .map(|t| t.elapsed().as_secs()),
                    stats: info.stats,
                })
            })
            .collect()
    }

    /// Stop accepting requests and shut every worker down. In-flight
    /// requests finish (or time out) first.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        for slot in &self.slots {
            let mut worker = slot.worker.lock().await;
            if let Some(mut transport) = worker.take() {
                let pid = transport.pid();
                transport.shutdown().await;
                info!(slot = slot.index, ?pid, "Worker stopped");
            }
            slot.update(|info| info.pid = None);
        }
    }
}

async fn start_worker(
    launcher: &dyn WorkerLauncher,
    ready_timeout: Duration,
) -> Result<Box<dyn Transport>, SupervisorError> {
    let mut worker = launcher.launch().await.map_err(|e| match e {
        TransportError::Spawn { message, .. } => SupervisorError::Spawn(message),
        other => SupervisorError::Spawn(other.to_string()),
    })?;
    let pid = worker.pid();

    let probe = OperationRequest::new(READY_PROBE);
    let failure = match tokio::time::timeout(ready_timeout, worker.request(&probe)).await {
        Ok(Ok(response)) if response.is_success() => {
            info!(?pid, "Worker ready");
            return Ok(worker);
        }
        Ok(Ok(response)) => format!(
            "ready check failed: {}",
            response.error.unwrap_or_else(|| "no error message".into())
        ),
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("no answer to {READY_PROBE} within {}s", ready_timeout.as_secs_f64()),
    };

    warn!(?pid, error = %failure, "Worker failed to start");
    worker.cancel().await;
    Err(SupervisorError::Spawn(failure))
}

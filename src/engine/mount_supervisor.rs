//! Mount Supervisor
//!
//! Drives the per-name mount state machine. This is the SINGLE SOURCE OF TRUTH
//! for mount state: every transition goes through the [`MountRegistry`] and is
//! broadcast as a [`MountEvent`].
//!
//! At most one transition runs per name. A request that finds its name busy
//! fails with `OperationInProgress` instead of queuing, except for an unmount
//! that targets a pending mount: it waits for the driver pid, then cancels the
//! mount and takes over.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::instrument;

use crate::engine::error::{ConflictKind, EngineError, EngineResult};
use crate::engine::mount_registry::MountRegistry;
use crate::engine::traits::{CredentialSource, MountDriver, MountRequest};
use crate::engine::types::{
    normalize_remote_path, MountEvent, MountRecord, MountStatus, ReconcileReport,
};
use crate::vault::credentials::validate_name;
use crate::vault::DataSourceConfig;

const EVENT_CAPACITY: usize = 64;
const MIN_RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Parent of every mount point; a mount for `name` lives at `<root>/<name>`
    pub mounts_root: PathBuf,
    /// Launch plus readiness must complete within this window
    pub startup_timeout: Duration,
    /// Time between SIGTERM and SIGKILL on unmount
    pub unmount_grace: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransitionKind {
    Mount,
    Unmount,
    Reconcile,
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchState {
    Pending,
    Launched,
    Settled,
}

struct Transition {
    id: u64,
    kind: TransitionKind,
    launch: watch::Receiver<LaunchState>,
    cancel: Arc<Notify>,
}

type Slots = Arc<Mutex<HashMap<String, Transition>>>;

fn lock_slots(slots: &Mutex<HashMap<String, Transition>>) -> MutexGuard<'_, HashMap<String, Transition>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exclusive claim on one name, released on drop
struct TransitionGuard {
    slots: Slots,
    name: String,
    id: u64,
    launch: watch::Sender<LaunchState>,
    cancel: Arc<Notify>,
}

impl TransitionGuard {
    fn mark_launched(&self) {
        self.launch.send_replace(LaunchState::Launched);
    }

    async fn cancelled(&self) {
        self.cancel.notified().await
    }
}

impl Drop for TransitionGuard {
    fn drop(&mut self) {
        {
            let mut slots = lock_slots(&self.slots);
            // A takeover may have replaced us already
            if slots.get(&self.name).map(|t| t.id) == Some(self.id) {
                slots.remove(&self.name);
            }
        }
        self.launch.send_replace(LaunchState::Settled);
    }
}

/// The transition currently holding a name
struct Busy {
    kind: TransitionKind,
    launch: watch::Receiver<LaunchState>,
    cancel: Arc<Notify>,
}

/// Text stored on an `Error` record: driver output verbatim, anything else
/// as displayed.
fn failure_cause(error: &EngineError) -> String {
    match error {
        EngineError::Driver { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

fn prepare_mount_point(path: &Path) -> Result<(), String> {
    std::fs::create_dir_all(path)
        .map_err(|e| format!("Cannot create mount point {}: {}", path.display(), e))?;
    let mut entries = std::fs::read_dir(path)
        .map_err(|e| format!("Cannot read mount point {}: {}", path.display(), e))?;
    if entries.next().is_some() {
        return Err(format!("Mount point {} is not empty", path.display()));
    }
    Ok(())
}

fn remove_mount_point(path: &Path) {
    match std::fs::remove_dir(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Mount point left in place");
        }
    }
}

/// Owns every mount record and the transitions between states
pub struct MountSupervisor {
    registry: MountRegistry,
    driver: Arc<dyn MountDriver>,
    options: SupervisorOptions,
    slots: Slots,
    next_id: AtomicU64,
    events: broadcast::Sender<MountEvent>,
}

impl MountSupervisor {
    pub fn new(
        registry: MountRegistry,
        driver: Arc<dyn MountDriver>,
        options: SupervisorOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            driver,
            options,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    /// Status changes of every mount, in the order they are recorded
    pub fn subscribe(&self) -> broadcast::Receiver<MountEvent> {
        self.events.subscribe()
    }

    pub fn local_path(&self, name: &str) -> PathBuf {
        self.options.mounts_root.join(name)
    }

    pub fn list(&self) -> Vec<MountRecord> {
        self.registry.list()
    }

    pub fn get(&self, name: &str) -> Option<MountRecord> {
        self.registry.get(name)
    }

    /// A name without a record is `Unmounted`
    pub fn status(&self, name: &str) -> MountStatus {
        self.registry
            .get(name)
            .map(|r| r.status)
            .unwrap_or(MountStatus::Unmounted)
    }

    fn new_guard(&self, name: &str, kind: TransitionKind) -> (TransitionGuard, Transition) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (launch_tx, launch_rx) = watch::channel(LaunchState::Pending);
        let cancel = Arc::new(Notify::new());
        let guard = TransitionGuard {
            slots: Arc::clone(&self.slots),
            name: name.to_string(),
            id,
            launch: launch_tx,
            cancel: Arc::clone(&cancel),
        };
        let transition = Transition {
            id,
            kind,
            launch: launch_rx,
            cancel,
        };
        (guard, transition)
    }

    fn claim(&self, name: &str, kind: TransitionKind) -> Result<TransitionGuard, Busy> {
        let mut slots = lock_slots(&self.slots);
        if let Some(current) = slots.get(name) {
            return Err(Busy {
                kind: current.kind,
                launch: current.launch.clone(),
                cancel: Arc::clone(&current.cancel),
            });
        }
        let (guard, transition) = self.new_guard(name, kind);
        slots.insert(name.to_string(), transition);
        Ok(guard)
    }

    /// Claims `name` even if another transition holds it.
    fn take_slot(&self, name: &str, kind: TransitionKind) -> TransitionGuard {
        let (guard, transition) = self.new_guard(name, kind);
        lock_slots(&self.slots).insert(name.to_string(), transition);
        guard
    }

    fn emit(&self, record: &MountRecord) {
        // No receivers is fine
        let _ = self.events.send(MountEvent {
            name: record.name.clone(),
            status: record.status,
            error: record.error.clone(),
        });
    }

    fn save(&self, record: MountRecord) -> EngineResult<MountRecord> {
        self.registry.upsert(record.clone())?;
        self.emit(&record);
        Ok(record)
    }

    /// Updates a record in place, announcing it when the status changed.
    fn set(
        &self,
        name: &str,
        change: impl FnOnce(&mut MountRecord),
    ) -> EngineResult<Option<MountRecord>> {
        let mut previous = None;
        let updated = self.registry.update(name, |record| {
            previous = Some(record.status);
            change(record);
        })?;
        if let Some(record) = &updated {
            if previous != Some(record.status) {
                self.emit(record);
            }
        }
        Ok(updated)
    }

    /// Starts mounting `name` and returns once `Mounting` is recorded.
    ///
    /// Launch and readiness continue in the background and end in `Mounted`
    /// or `Error`; watch [`subscribe`](Self::subscribe) or poll
    /// [`status`](Self::status) for the outcome.
    #[instrument(skip_all, fields(name = %name, remote_path = %remote_path))]
    pub async fn mount(
        self: &Arc<Self>,
        credentials: &dyn CredentialSource,
        name: &str,
        remote_path: &str,
    ) -> EngineResult<MountRecord> {
        validate_name(name)?;
        let remote_path = normalize_remote_path(remote_path)?;
        let guard = self
            .claim(name, TransitionKind::Mount)
            .map_err(|_| EngineError::conflict(ConflictKind::OperationInProgress, name))?;

        if let Some(existing) = self.registry.get(name) {
            match existing.status {
                MountStatus::Mounting | MountStatus::Mounted | MountStatus::Unmounting => {
                    return Err(EngineError::conflict(ConflictKind::AlreadyMounted, name));
                }
                MountStatus::Error | MountStatus::Unmounted => self.clear_stale(&existing).await?,
            }
        }

        let source = credentials.resolve(name).await?;
        let local_path = self.local_path(name);
        let mut record = MountRecord::mounting(name, &remote_path, local_path.clone());

        if let Err(cause) = prepare_mount_point(&local_path) {
            record.fail(cause.clone());
            self.save(record)?;
            return Err(EngineError::driver(name, cause));
        }

        let record = self.save(record)?;
        tracing::info!(local_path = %local_path.display(), "Mount requested");

        let supervisor = Arc::clone(self);
        let pending = record.clone();
        tokio::spawn(async move { supervisor.drive_mount(guard, source, pending).await });
        Ok(record)
    }

    /// Stops whatever a previous attempt left behind for a record in `Error`.
    async fn clear_stale(&self, record: &MountRecord) -> EngineResult<()> {
        if let Some(pid) = record.pid {
            if self.driver.owns(pid, &record.local_path) {
                tracing::info!(pid, "Stopping leftover driver process");
                self.driver.terminate(pid, self.options.unmount_grace).await?;
            }
        }
        if let Err(e) = self.driver.release(&record.local_path).await {
            tracing::warn!(error = %e, "Failed to release stale mount point");
        }
        Ok(())
    }

    async fn drive_mount(
        self: Arc<Self>,
        guard: TransitionGuard,
        source: DataSourceConfig,
        record: MountRecord,
    ) {
        let name = record.name.clone();
        let window = self.options.startup_timeout;
        let started = Instant::now();
        let timed_out = EngineError::Timeout {
            timeout_ms: self.options.startup_timeout.as_millis() as u64,
        };

        let request = MountRequest {
            source: &source,
            remote_path: &record.remote_path,
            local_path: &record.local_path,
        };
        let launched = timeout(window, self.driver.launch(request)).await;
        drop(source);

        let mut process = match launched {
            Ok(Ok(process)) => process,
            Ok(Err(e)) => return self.fail_mount(&name, failure_cause(&e)),
            Err(_) => return self.fail_mount(&name, timed_out.to_string()),
        };

        let pid = process.pid();
        if let Err(e) = self.set(&name, |r| r.pid = Some(pid)) {
            self.abort_mount(&name, pid, e.to_string()).await;
            return;
        }
        guard.mark_launched();
        tracing::debug!(name = %name, pid, "Driver launched, waiting for readiness");

        let outcome = tokio::select! {
            ready = timeout(window.saturating_sub(started.elapsed()), process.wait_ready()) => Some(ready),
            _ = guard.cancelled() => None,
        };
        drop(process);

        match outcome {
            None => tracing::info!(name = %name, pid, "Pending mount cancelled"),
            Some(Ok(Ok(()))) => self.finish_mount(&name, pid),
            Some(Ok(Err(e))) => self.abort_mount(&name, pid, failure_cause(&e)).await,
            Some(Err(_)) => self.abort_mount(&name, pid, timed_out.to_string()).await,
        }
    }

    fn finish_mount(&self, name: &str, pid: u32) {
        let result = self.set(name, |r| {
            if r.status == MountStatus::Mounting && r.pid == Some(pid) {
                r.set_status(MountStatus::Mounted);
            }
        });
        match result {
            Ok(_) => tracing::info!(name = %name, pid, "Mounted"),
            Err(e) => tracing::error!(name = %name, error = %e, "Failed to record mount"),
        }
    }

    async fn abort_mount(&self, name: &str, pid: u32, cause: String) {
        if let Err(e) = self.driver.terminate(pid, self.options.unmount_grace).await {
            tracing::warn!(name = %name, pid, error = %e, "Failed to stop driver after failed mount");
        }
        self.fail_mount(name, cause);
    }

    fn fail_mount(&self, name: &str, cause: String) {
        tracing::warn!(name = %name, cause = %cause, "Mount failed");
        let result = self.set(name, |r| {
            if r.status == MountStatus::Mounting {
                r.fail(cause);
            }
        });
        if let Err(e) = result {
            tracing::error!(name = %name, error = %e, "Failed to record mount failure");
        }
    }

    /// Stops the driver and removes the record.
    ///
    /// Blocks until the process exit is confirmed: SIGTERM, then SIGKILL once
    /// the grace period elapses.
    #[instrument(skip_all, fields(name = %name))]
    pub async fn unmount(&self, name: &str) -> EngineResult<()> {
        // A pid taken over from a pending mount was launched by this run
        let (_guard, launched_here) = match self.claim(name, TransitionKind::Unmount) {
            Ok(guard) => (guard, false),
            Err(busy) if busy.kind == TransitionKind::Mount => self.take_over(name, busy).await?,
            Err(_) => {
                return Err(EngineError::conflict(ConflictKind::OperationInProgress, name));
            }
        };

        let record = self
            .registry
            .get(name)
            .ok_or_else(|| EngineError::mount_not_found(name))?;
        self.set(name, |r| r.set_status(MountStatus::Unmounting))?;

        let driver_pid = record
            .pid
            .filter(|pid| launched_here || self.driver.owns(*pid, &record.local_path));
        if let (Some(pid), None) = (record.pid, driver_pid) {
            if self.driver.is_alive(pid) {
                tracing::warn!(pid, "Recorded pid belongs to another process, not signalling it");
            }
        }

        if let Some(pid) = driver_pid {
            if let Err(e) = self.driver.terminate(pid, self.options.unmount_grace).await {
                let cause = failure_cause(&e);
                if let Err(record_err) = self.set(name, |r| r.fail(cause)) {
                    tracing::error!(error = %record_err, "Failed to record unmount failure");
                }
                return Err(e);
            }
        }

        self.finish_unmount(name, &record.local_path).await
    }

    /// Waits until a pending mount knows its pid, then cancels it.
    ///
    /// The flag tells whether the guard came from a cancelled launch.
    async fn take_over(&self, name: &str, busy: Busy) -> EngineResult<(TransitionGuard, bool)> {
        let mut launch = busy.launch;
        let state = match timeout(
            self.options.startup_timeout,
            launch.wait_for(|state| *state != LaunchState::Pending),
        )
        .await
        {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => LaunchState::Settled,
            Err(_) => {
                return Err(EngineError::conflict(ConflictKind::OperationInProgress, name));
            }
        };

        match state {
            LaunchState::Launched => {
                busy.cancel.notify_one();
                tracing::info!("Cancelling pending mount");
                Ok((self.take_slot(name, TransitionKind::Unmount), true))
            }
            LaunchState::Pending | LaunchState::Settled => self
                .claim(name, TransitionKind::Unmount)
                .map(|guard| (guard, false))
                .map_err(|_| EngineError::conflict(ConflictKind::OperationInProgress, name)),
        }
    }

    async fn finish_unmount(&self, name: &str, local_path: &Path) -> EngineResult<()> {
        if let Err(e) = self.driver.release(local_path).await {
            tracing::warn!(error = %e, "Failed to release mount point");
        }
        remove_mount_point(local_path);

        if let Some(mut record) = self.registry.remove(name)? {
            record.set_status(MountStatus::Unmounted);
            self.emit(&record);
        }
        tracing::info!(name = %name, "Unmounted");
        Ok(())
    }

    /// Compares recorded state with the driver processes actually running.
    ///
    /// A recorded pid counts only while the driver still owns the mount
    /// point; a live process that merely reuses the pid is treated as dead
    /// and never signalled. Names with a transition in flight are skipped;
    /// their owner settles them. Repeated sweeps over unchanged state change
    /// nothing.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for snapshot in self.registry.list() {
            let name = snapshot.name;
            let Ok(_guard) = self.claim(&name, TransitionKind::Reconcile) else {
                continue;
            };
            let Some(record) = self.registry.get(&name) else {
                continue;
            };
            let owned = record
                .pid
                .is_some_and(|pid| self.driver.owns(pid, &record.local_path));

            let result = match (record.status, owned) {
                (MountStatus::Mounted, false) => self
                    .set(&name, |r| r.fail("Mount process exited unexpectedly"))
                    .map(|_| report.errored.push(name.clone())),
                (MountStatus::Unmounting, false) => self
                    .finish_unmount(&name, &record.local_path)
                    .await
                    .map(|_| report.completed.push(name.clone())),
                (MountStatus::Mounting, true) => self
                    .set(&name, |r| r.set_status(MountStatus::Mounted))
                    .map(|_| report.recovered.push(name.clone())),
                (MountStatus::Mounting, false) => self
                    .set(&name, |r| r.fail("Mount was interrupted before it became ready"))
                    .map(|_| report.errored.push(name.clone())),
                _ => Ok(()),
            };

            if let Err(e) = result {
                tracing::warn!(name = %name, error = %e, "Reconcile failed for mount");
            }
        }

        if !report.is_empty() {
            tracing::info!(
                errored = ?report.errored,
                completed = ?report.completed,
                recovered = ?report.recovered,
                "Reconcile sweep changed mount state"
            );
        }
        report
    }

    /// Runs `action` while holding `name`, failing with `InUse` if a mount
    /// record for it is not `Unmounted` or a transition is running.
    pub async fn with_idle<T, F, Fut>(&self, name: &str, action: F) -> EngineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let _guard = self
            .claim(name, TransitionKind::Hold)
            .map_err(|_| EngineError::conflict(ConflictKind::InUse, name))?;
        if let Some(record) = self.registry.get(name) {
            if !record.status.is_idle() {
                return Err(EngineError::conflict(ConflictKind::InUse, name));
            }
        }
        action().await
    }

    /// Unmounts every recorded mount concurrently.
    pub async fn unmount_all(&self) -> Vec<(String, EngineResult<()>)> {
        let names: Vec<String> = self.registry.list().into_iter().map(|r| r.name).collect();
        let results = join_all(names.iter().map(|name| self.unmount(name))).await;
        names.into_iter().zip(results).collect()
    }

    /// Periodic reconcile. The task ends once the supervisor is dropped.
    pub fn spawn_reconciler(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let supervisor = Arc::downgrade(self);
        let every = every.max(MIN_RECONCILE_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(supervisor) = supervisor.upgrade() else {
                    break;
                };
                supervisor.reconcile().await;
            }
        })
    }
}

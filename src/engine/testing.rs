//! In-memory fakes for the external capabilities

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::{CredentialSource, MountDriver, MountProcess, MountRequest, ObjectStore};
use crate::engine::types::RemoteEntry;
use crate::sync::blob_store::{BlobStore, Pushed, RemoteBlob};
use crate::vault::{DataSourceConfig, SecretString};

/// The data source used throughout the tests
pub fn sample_source(name: &str) -> DataSourceConfig {
    DataSourceConfig {
        id: String::new(),
        name: name.to_string(),
        endpoint: Some("https://minio.local".to_string()),
        access_key: "AK".to_string(),
        secret_key: SecretString::new("SK"),
        region: "us-east-1".to_string(),
        bucket: None,
        description: String::new(),
    }
}

/// Fixed set of resolvable data sources
pub struct StaticCredentials(HashMap<String, DataSourceConfig>);

impl StaticCredentials {
    pub fn with_sources(names: &[&str]) -> Self {
        Self(
            names
                .iter()
                .map(|name| (name.to_string(), sample_source(name)))
                .collect(),
        )
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn resolve(&self, name: &str) -> EngineResult<DataSourceConfig> {
        self.0
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::data_source_not_found(name))
    }
}

#[derive(Debug, Clone)]
pub enum FakeBehavior {
    Ready,
    ReadyAfter(Duration),
    FailLaunch(String),
    FailReady(String),
    NeverReady,
}

/// Mount driver that tracks fake pids instead of processes
pub struct FakeMountDriver {
    behavior: Mutex<FakeBehavior>,
    next_pid: AtomicU32,
    alive: Mutex<HashSet<u32>>,
    foreign: Mutex<HashSet<u32>>,
    terminated: Mutex<Vec<u32>>,
    launches: AtomicUsize,
    last_secret: Mutex<Option<String>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeMountDriver {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            next_pid: AtomicU32::new(40_000),
            alive: Mutex::new(HashSet::new()),
            foreign: Mutex::new(HashSet::new()),
            terminated: Mutex::new(Vec::new()),
            launches: AtomicUsize::new(0),
            last_secret: Mutex::new(None),
            gate: Mutex::new(None),
        }
    }

    pub fn set_behavior(&self, behavior: FakeBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Simulates the driver dying on its own
    pub fn crash(&self, pid: u32) {
        self.alive.lock().unwrap().remove(&pid);
    }

    /// A live pid that this driver never launched, e.g. from a previous run
    pub fn spawn_detached(&self) -> u32 {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.alive.lock().unwrap().insert(pid);
        pid
    }

    /// A live pid held by some unrelated process
    pub fn spawn_foreign(&self) -> u32 {
        let pid = self.spawn_detached();
        self.foreign.lock().unwrap().insert(pid);
        pid
    }

    /// Holds the next launch before it has a pid until the returned
    /// notify fires. The behavior is read after the gate opens.
    pub fn gate_next_launch(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn was_terminated(&self, pid: u32) -> bool {
        self.terminated.lock().unwrap().contains(&pid)
    }

    pub fn last_secret(&self) -> Option<String> {
        self.last_secret.lock().unwrap().clone()
    }
}

struct FakeProcess {
    pid: u32,
    behavior: FakeBehavior,
}

#[async_trait]
impl MountProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait_ready(&mut self) -> EngineResult<()> {
        match &self.behavior {
            FakeBehavior::Ready => Ok(()),
            FakeBehavior::ReadyAfter(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(())
            }
            FakeBehavior::FailReady(cause) => Err(EngineError::driver("fake", cause.clone())),
            FakeBehavior::NeverReady => std::future::pending().await,
            FakeBehavior::FailLaunch(_) => unreachable!("launch already failed"),
        }
    }
}

#[async_trait]
impl MountDriver for FakeMountDriver {
    fn driver_id(&self) -> &'static str {
        "fake"
    }

    async fn launch(&self, request: MountRequest<'_>) -> EngineResult<Box<dyn MountProcess>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        *self.last_secret.lock().unwrap() = Some(request.source.secret_key.expose().to_string());

        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let behavior = self.behavior.lock().unwrap().clone();
        if let FakeBehavior::FailLaunch(cause) = behavior {
            return Err(EngineError::driver("fake", cause));
        }
        let pid = self.spawn_detached();
        Ok(Box::new(FakeProcess { pid, behavior }))
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn owns(&self, pid: u32, _local_path: &Path) -> bool {
        self.is_alive(pid) && !self.foreign.lock().unwrap().contains(&pid)
    }

    async fn terminate(&self, pid: u32, _grace: Duration) -> EngineResult<()> {
        self.alive.lock().unwrap().remove(&pid);
        self.terminated.lock().unwrap().push(pid);
        Ok(())
    }
}

/// Object store serving a fixed listing
#[derive(Default)]
pub struct FakeObjectStore {
    pub entries: Vec<RemoteEntry>,
    pub unreachable: bool,
    pub calls: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    fn store_id(&self) -> &'static str {
        "fake"
    }

    async fn test_connection(&self, source: &DataSourceConfig) -> EngineResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push((source.name.clone(), source.secret_key.expose().to_string()));
        if self.unreachable {
            return Err(EngineError::remote_unavailable("connection refused"));
        }
        Ok(())
    }

    async fn list(
        &self,
        source: &DataSourceConfig,
        remote_path: &str,
    ) -> EngineResult<Vec<RemoteEntry>> {
        self.calls
            .lock()
            .unwrap()
            .push((source.name.clone(), remote_path.to_string()));
        if self.unreachable {
            return Err(EngineError::remote_unavailable("connection refused"));
        }
        Ok(self.entries.clone())
    }
}

/// Blob store keeping every blob in memory, revisions `rev-1`, `rev-2`, ...
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, RemoteBlob>>,
    revisions: AtomicUsize,
    uploads: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryBlobStore {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    fn reachable(&self) -> EngineResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(EngineError::remote_unavailable("network is unreachable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn store_id(&self) -> &'static str {
        "memory"
    }

    async fn check_access(&self, _token: &SecretString) -> EngineResult<()> {
        self.reachable()
    }

    async fn push(
        &self,
        _token: &SecretString,
        blob_id: Option<&str>,
        bytes: &[u8],
    ) -> EngineResult<Pushed> {
        self.reachable()?;
        let mut blobs = self.blobs.lock().unwrap();
        let blob_id = blob_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("blob-{}", blobs.len() + 1));
        let revision = format!("rev-{}", self.revisions.fetch_add(1, Ordering::SeqCst) + 1);
        blobs.insert(
            blob_id.clone(),
            RemoteBlob {
                bytes: bytes.to_vec(),
                revision: revision.clone(),
            },
        );
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(Pushed { blob_id, revision })
    }

    async fn pull(&self, _token: &SecretString, blob_id: &str) -> EngineResult<RemoteBlob> {
        self.reachable()?;
        self.blobs
            .lock()
            .unwrap()
            .get(blob_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound {
                kind: "Blob",
                name: blob_id.to_string(),
            })
    }
}

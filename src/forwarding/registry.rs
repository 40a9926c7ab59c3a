//! Forwarding Registry
//!
//! The single source of truth for "which forwards the user wants" and
//! "which sockets exist right now".
//!
//! # State
//!
//! - `records` + `index`: every known [`ForwardingRecord`] and the reuse key
//!   map `ForwardKey -> id`, updated together under one `RwLock`. A record
//!   started on an OS-chosen port is indexed under both the requested key
//!   (port 0) and the bound one.
//! - `active`: transient resources (session, engine, monitor task) of each
//!   active record.
//! - `id_locks`: per-id async locks; every mutation of a record and its
//!   transient entry runs under the record's lock.
//!
//! Records are persisted after every mutation with status forced to
//! `inactive`, so a restart never believes a socket exists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dynamic::{start_dynamic_forward, DynamicForward, DynamicForwardHandle};
use super::error::ForwardError;
use super::events::{ForwardEvent, ForwardEventEmitter, ForwardEventKind};
use super::lifecycle::ForwardLifecycle;
use super::local::{start_local_forward, LocalForward, LocalForwardHandle};
use super::remote::{start_remote_forward, RemoteForward, RemoteForwardHandle};
use super::stats::ForwardStats;
use crate::config::{self, ForwardStorage, ForwardingSettings};
use crate::ssh::{
    wait_terminal, SessionFactory, SessionState, SshConfig, SshSessionFactory, TunnelSession,
};

/// Type of port forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardType {
    /// Local port forwarding (-L)
    Local,
    /// Remote port forwarding (-R)
    Remote,
    /// Dynamic SOCKS proxy (-D)
    Dynamic,
}

/// Status of a forwarding record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStatus {
    Inactive,
    Active,
    Error,
}

/// Who asked for the forward
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardOrigin {
    #[default]
    Manual,
    Auto,
}

/// A forward the user wants, active or not
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingRecord {
    pub id: String,
    pub host_id: String,
    pub forward_type: ForwardType,
    /// Remote side port (target for local, bind for remote, 0 for dynamic)
    pub remote_port: u16,
    /// Listen port for local/dynamic, destination port for remote
    pub local_port: u16,
    pub local_host: String,
    /// Target host for local, bind address for remote, empty for dynamic
    pub remote_host: String,
    pub status: ForwardStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub origin: ForwardOrigin,
    pub created_at: DateTime<Utc>,
    /// Process seen listening on the remote port at the last scan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_process: Option<String>,
}

impl ForwardingRecord {
    fn from_request(req: &ForwardRequest) -> Self {
        let mut record = Self {
            id: Uuid::new_v4().to_string(),
            host_id: req.host_id.clone(),
            forward_type: req.forward_type,
            remote_port: 0,
            local_port: 0,
            local_host: String::new(),
            remote_host: String::new(),
            status: ForwardStatus::Inactive,
            error: None,
            label: None,
            origin: req.origin,
            created_at: Utc::now(),
            running_process: None,
        };
        record.apply(req);
        record
    }

    /// Overwrite the stored fields with a new request for the same key
    fn apply(&mut self, req: &ForwardRequest) {
        self.local_host = req.local_host.clone();
        self.local_port = req.local_port;
        self.remote_host = req.remote_host.clone();
        self.remote_port = req.remote_port;
        self.label = req.label.clone();
        self.origin = req.origin;
    }

    pub fn key(&self) -> ForwardKey {
        ForwardKey::new(
            &self.host_id,
            self.forward_type,
            self.local_port,
            self.remote_port,
        )
    }

    fn persistable(&self) -> Self {
        let mut record = self.clone();
        record.status = ForwardStatus::Inactive;
        record.error = None;
        record
    }
}

/// Reuse key: `(host_id, forward_type, local_port[, remote_port for local])`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardKey {
    host_id: String,
    forward_type: ForwardType,
    local_port: u16,
    remote_port: Option<u16>,
}

impl ForwardKey {
    fn new(host_id: &str, forward_type: ForwardType, local_port: u16, remote_port: u16) -> Self {
        Self {
            host_id: host_id.to_string(),
            forward_type,
            local_port,
            remote_port: (forward_type == ForwardType::Local).then_some(remote_port),
        }
    }
}

/// A request to start forwarding
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub host_id: String,
    /// Resolved host descriptor (credentials and jump hosts included)
    pub host: SshConfig,
    pub forward_type: ForwardType,
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub label: Option<String>,
    pub origin: ForwardOrigin,
}

impl ForwardRequest {
    /// `-L local_port:remote_host:remote_port`
    pub fn local(
        host_id: impl Into<String>,
        host: SshConfig,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            host_id: host_id.into(),
            host,
            forward_type: ForwardType::Local,
            local_host: "127.0.0.1".into(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
            label: None,
            origin: ForwardOrigin::Manual,
        }
    }

    /// `-R bind_host:remote_port:127.0.0.1:local_port`
    pub fn remote(
        host_id: impl Into<String>,
        host: SshConfig,
        bind_host: impl Into<String>,
        remote_port: u16,
        local_port: u16,
    ) -> Self {
        Self {
            host_id: host_id.into(),
            host,
            forward_type: ForwardType::Remote,
            local_host: "127.0.0.1".into(),
            local_port,
            remote_host: bind_host.into(),
            remote_port,
            label: None,
            origin: ForwardOrigin::Manual,
        }
    }

    /// `-D local_port`
    pub fn dynamic(host_id: impl Into<String>, host: SshConfig, local_port: u16) -> Self {
        Self {
            host_id: host_id.into(),
            host,
            forward_type: ForwardType::Dynamic,
            local_host: "127.0.0.1".into(),
            local_port,
            remote_host: String::new(),
            remote_port: 0,
            label: None,
            origin: ForwardOrigin::Manual,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_local_host(mut self, local_host: impl Into<String>) -> Self {
        self.local_host = local_host.into();
        self
    }

    pub fn with_origin(mut self, origin: ForwardOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn key(&self) -> ForwardKey {
        ForwardKey::new(
            &self.host_id,
            self.forward_type,
            self.local_port,
            self.remote_port,
        )
    }

    fn validate(&mut self) -> Result<(), ForwardError> {
        if self.host_id.is_empty() {
            return Err(ForwardError::InvalidConfig("host_id is empty".into()));
        }
        if self.local_host.is_empty() {
            return Err(ForwardError::InvalidConfig("local_host is empty".into()));
        }
        match self.forward_type {
            ForwardType::Local => {
                if self.remote_host.is_empty() || self.remote_port == 0 {
                    return Err(ForwardError::InvalidConfig(
                        "local forward needs a remote host and port".into(),
                    ));
                }
            }
            ForwardType::Remote => {
                if self.local_port == 0 {
                    return Err(ForwardError::InvalidConfig(
                        "remote forward needs a local destination port".into(),
                    ));
                }
                if self.remote_host.is_empty() {
                    self.remote_host = "localhost".into();
                }
            }
            ForwardType::Dynamic => {
                self.remote_host.clear();
                self.remote_port = 0;
            }
        }
        Ok(())
    }
}

/// Running engine of an active record
enum ForwardHandle {
    Local(LocalForwardHandle),
    Remote(RemoteForwardHandle),
    Dynamic(DynamicForwardHandle),
}

impl ForwardHandle {
    fn bound_port(&self) -> u16 {
        match self {
            ForwardHandle::Local(h) => h.bound_port(),
            ForwardHandle::Remote(h) => h.bound_port,
            ForwardHandle::Dynamic(h) => h.bound_port(),
        }
    }

    fn stats(&self) -> ForwardStats {
        match self {
            ForwardHandle::Local(h) => h.stats(),
            ForwardHandle::Remote(h) => h.stats(),
            ForwardHandle::Dynamic(h) => h.stats(),
        }
    }

    fn lifecycle(&self) -> Arc<ForwardLifecycle> {
        match self {
            ForwardHandle::Local(h) => h.lifecycle().clone(),
            ForwardHandle::Remote(h) => h.lifecycle().clone(),
            ForwardHandle::Dynamic(h) => h.lifecycle().clone(),
        }
    }

    async fn stop(&self, drain: Duration) {
        match self {
            ForwardHandle::Local(h) => h.stop(drain).await,
            ForwardHandle::Remote(h) => h.stop(drain).await,
            ForwardHandle::Dynamic(h) => h.stop(drain).await,
        }
    }
}

/// Transient resources owned by an active record
struct ActiveForward {
    session: Arc<dyn TunnelSession>,
    engine: ForwardHandle,
    /// Distinguishes this activation from later ones for the monitor
    generation: u64,
    monitor: JoinHandle<()>,
}

#[derive(Default)]
struct RegistryState {
    records: HashMap<String, ForwardingRecord>,
    index: HashMap<ForwardKey, String>,
}

impl RegistryState {
    /// Find the record for `key`, creating an inactive one if there is none
    fn reserve(&mut self, req: &ForwardRequest) -> String {
        let key = req.key();
        if let Some(id) = self.index.get(&key) {
            if self.records.contains_key(id) {
                return id.clone();
            }
        }
        let record = ForwardingRecord::from_request(req);
        let id = record.id.clone();
        self.index.insert(key, id.clone());
        self.records.insert(id.clone(), record);
        id
    }

    /// Index `id` under the key it has after a port was written back.
    ///
    /// The requested key stays as an alias, so the same request finds the
    /// record again. Keys left over from earlier activations are dropped.
    fn rekey(&mut self, id: &str, requested: &ForwardKey, bound: ForwardKey) {
        self.index
            .retain(|key, indexed| indexed != id || key == requested || *key == bound);
        match self.index.get(&bound) {
            Some(other) if other != id && self.records.contains_key(other) => {
                debug!("Key {:?} already taken by {}, not indexing {}", bound, other, id);
            }
            _ => {
                self.index.insert(bound, id.to_string());
            }
        }
    }

    /// Drop a record and every key that points at it
    fn forget(&mut self, id: &str) -> Option<ForwardingRecord> {
        let removed = self.records.remove(id)?;
        self.index.retain(|_, indexed| indexed != id);
        Some(removed)
    }
}

struct Inner {
    state: RwLock<RegistryState>,
    active: DashMap<String, ActiveForward>,
    id_locks: DashMap<String, Arc<Mutex<()>>>,
    factory: Arc<dyn SessionFactory>,
    storage: ForwardStorage,
    persist_lock: Mutex<()>,
    settings: ForwardingSettings,
    events: ForwardEventEmitter,
    generation: AtomicU64,
}

/// Registry of forwarding records
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct ForwardingRegistry {
    inner: Arc<Inner>,
}

impl ForwardingRegistry {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        storage: ForwardStorage,
        settings: ForwardingSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(RegistryState::default()),
                active: DashMap::new(),
                id_locks: DashMap::new(),
                factory,
                storage,
                persist_lock: Mutex::new(()),
                settings,
                events: ForwardEventEmitter::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Registry over real SSH sessions, default paths, records loaded
    pub async fn open_default() -> Result<Self, ForwardError> {
        let settings = config::load_settings().await?;
        let factory = Arc::new(SshSessionFactory::new(settings.clone()));
        let registry = Self::new(factory, ForwardStorage::new()?, settings);
        registry.load().await?;
        Ok(registry)
    }

    pub fn settings(&self) -> &ForwardingSettings {
        &self.inner.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ForwardEvent> {
        self.inner.events.subscribe()
    }

    fn id_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.inner
            .id_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Start (or return) the forward described by `req`.
    ///
    /// An active record with the same key is returned unchanged. An inactive
    /// or failed one is reused in place with the request's fields. The start
    /// runs to completion even if the caller stops waiting for it.
    pub async fn start(&self, req: ForwardRequest) -> Result<ForwardingRecord, ForwardError> {
        let registry = self.clone();
        tokio::spawn(async move { registry.start_inner(req).await })
            .await
            .map_err(|e| ForwardError::SessionLifecycle(format!("start task failed: {}", e)))?
    }

    async fn start_inner(&self, mut req: ForwardRequest) -> Result<ForwardingRecord, ForwardError> {
        req.validate()?;

        let (id, _guard) = loop {
            let id = self.inner.state.write().reserve(&req);
            let lock = self.id_lock(&id);
            let guard = lock.clone().lock_owned().await;
            if self.inner.state.read().records.contains_key(&id) {
                break (id, guard);
            }
            // Deleted while we waited: the key may belong to a newer record by now
            debug!("Forward {} deleted during start, looking up its key again", id);
            drop(guard);
            self.inner
                .id_locks
                .remove_if(&id, |_, current| Arc::ptr_eq(current, &lock));
        };

        {
            let mut state = self.inner.state.write();
            let Some(record) = state.records.get_mut(&id) else {
                return Err(ForwardError::NotFound(id));
            };
            if record.status == ForwardStatus::Active && self.inner.active.contains_key(&id) {
                debug!("Forward {} already active, returning it", id);
                return Ok(record.clone());
            }
            record.apply(&req);
        }

        info!(
            "Starting {:?} forward {} on host {} ({}:{} / {}:{})",
            req.forward_type,
            id,
            req.host_id,
            req.local_host,
            req.local_port,
            req.remote_host,
            req.remote_port
        );

        match self.activate(&id, &req).await {
            Ok(record) => {
                self.persist().await;
                self.inner.events.emit(ForwardEventKind::Started, &record);
                Ok(record)
            }
            Err(e) => {
                warn!("Forward {} failed to start: {}", id, e);
                let record = self.update_record(&id, |record| {
                    record.status = ForwardStatus::Error;
                    record.error = Some(e.to_string());
                });
                self.persist().await;
                if let Some(record) = record {
                    self.inner.events.emit(ForwardEventKind::Error, &record);
                }
                Err(e)
            }
        }
    }

    /// Open the session and bind the engine; on failure nothing stays open
    async fn activate(
        &self,
        id: &str,
        req: &ForwardRequest,
    ) -> Result<ForwardingRecord, ForwardError> {
        let session = self.inner.factory.open(&req.host).await?;

        let engine = match self.bind_engine(session.clone(), req).await {
            Ok(engine) => engine,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        let bound_port = engine.bound_port();
        let record = {
            let mut state = self.inner.state.write();
            match state.records.get_mut(id) {
                Some(record) => {
                    match record.forward_type {
                        ForwardType::Remote => record.remote_port = bound_port,
                        ForwardType::Local | ForwardType::Dynamic => {
                            record.local_port = bound_port
                        }
                    }
                    record.status = ForwardStatus::Active;
                    record.error = None;
                    let snapshot = record.clone();
                    state.rekey(id, &req.key(), snapshot.key());
                    Some(snapshot)
                }
                None => None,
            }
        };
        let Some(record) = record else {
            engine.stop(Duration::ZERO).await;
            session.close().await;
            return Err(ForwardError::NotFound(id.to_string()));
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let monitor = tokio::spawn(monitor_session(
            Arc::downgrade(&self.inner),
            id.to_string(),
            generation,
            session.subscribe_state(),
            engine.lifecycle(),
        ));

        self.inner.active.insert(
            id.to_string(),
            ActiveForward {
                session,
                engine,
                generation,
                monitor,
            },
        );

        info!("Forward {} active on port {}", id, bound_port);
        Ok(record)
    }

    async fn bind_engine(
        &self,
        session: Arc<dyn TunnelSession>,
        req: &ForwardRequest,
    ) -> Result<ForwardHandle, ForwardError> {
        let idle = self.inner.settings.idle_timeout();
        let handle = match req.forward_type {
            ForwardType::Local => ForwardHandle::Local(
                start_local_forward(
                    session,
                    LocalForward::new(
                        &req.local_host,
                        req.local_port,
                        &req.remote_host,
                        req.remote_port,
                    ),
                    idle,
                )
                .await?,
            ),
            ForwardType::Remote => ForwardHandle::Remote(
                start_remote_forward(
                    session,
                    RemoteForward::new(
                        &req.remote_host,
                        req.remote_port,
                        &req.local_host,
                        req.local_port,
                    ),
                    idle,
                )
                .await?,
            ),
            ForwardType::Dynamic => ForwardHandle::Dynamic(
                start_dynamic_forward(
                    session,
                    DynamicForward::new(&req.local_host, req.local_port),
                    idle,
                )
                .await?,
            ),
        };
        Ok(handle)
    }

    /// Stop listening, drain connections, end the session, mark the record inactive.
    ///
    /// Unknown or inactive ids are a no-op.
    pub async fn stop(&self, id: &str) -> Result<(), ForwardError> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let Some((_, active)) = self.inner.active.remove(id) else {
            debug!("Stop for {}: not active", id);
            return Ok(());
        };

        info!("Stopping forward {}", id);
        active.monitor.abort();
        self.teardown(active, self.inner.settings.drain_timeout()).await;

        let record = self.update_record(id, |record| {
            record.status = ForwardStatus::Inactive;
            record.error = None;
        });
        self.persist().await;
        if let Some(record) = record {
            self.inner.events.emit(ForwardEventKind::Stopped, &record);
        }
        Ok(())
    }

    /// Stop if active, then forget the record. Unknown ids are a no-op.
    pub async fn delete(&self, id: &str) -> Result<(), ForwardError> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        if let Some((_, active)) = self.inner.active.remove(id) {
            active.monitor.abort();
            self.teardown(active, self.inner.settings.drain_timeout()).await;
        }

        let removed = self.inner.state.write().forget(id);
        self.inner.id_locks.remove(id);

        if let Some(mut record) = removed {
            info!("Deleted forward {}", id);
            record.status = ForwardStatus::Inactive;
            record.error = None;
            self.persist().await;
            self.inner.events.emit(ForwardEventKind::Deleted, &record);
        }
        Ok(())
    }

    async fn teardown(&self, active: ActiveForward, drain: Duration) {
        active.engine.stop(drain).await;
        active.session.close().await;
    }

    pub fn get(&self, id: &str) -> Option<ForwardingRecord> {
        self.inner.state.read().records.get(id).cloned()
    }

    /// All records, oldest first
    pub fn list(&self) -> Vec<ForwardingRecord> {
        let mut records: Vec<_> = self.inner.state.read().records.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub fn list_for_host(&self, host_id: &str) -> Vec<ForwardingRecord> {
        self.list()
            .into_iter()
            .filter(|r| r.host_id == host_id)
            .collect()
    }

    /// Traffic statistics of an active forward
    pub fn stats(&self, id: &str) -> Option<ForwardStats> {
        self.inner.active.get(id).map(|a| a.engine.stats())
    }

    /// Record which remote process listens on each local forward's target port
    pub fn annotate_running_processes(&self, host_id: &str, processes: &HashMap<u16, String>) {
        let mut state = self.inner.state.write();
        for record in state.records.values_mut() {
            if record.host_id == host_id && record.forward_type == ForwardType::Local {
                record.running_process = processes.get(&record.remote_port).cloned();
            }
        }
    }

    /// Write all records (status forced to inactive) to storage
    pub async fn save(&self) -> Result<(), ForwardError> {
        let _guard = self.inner.persist_lock.lock().await;
        let records: Vec<_> = self
            .list()
            .iter()
            .map(ForwardingRecord::persistable)
            .collect();
        self.inner.storage.save(records).await?;
        Ok(())
    }

    async fn persist(&self) {
        if let Err(e) = self.save().await {
            warn!("Failed to persist forwards: {}", e);
        }
    }

    /// Restore records from storage, all inactive. Returns how many were added.
    pub async fn load(&self) -> Result<usize, ForwardError> {
        let stored = self.inner.storage.load().await?;
        let mut state = self.inner.state.write();
        let mut added = 0;
        for record in stored {
            if state.records.contains_key(&record.id) {
                continue;
            }
            let record = record.persistable();
            state
                .index
                .entry(record.key())
                .or_insert_with(|| record.id.clone());
            state.records.insert(record.id.clone(), record);
            added += 1;
        }
        info!("Loaded {} forward(s) from storage", added);
        Ok(added)
    }

    /// Stop every active forward and persist
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.inner.active.iter().map(|e| e.key().clone()).collect();
        info!("Shutting down {} active forward(s)", ids.len());
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!("Failed to stop forward {}: {}", id, e);
            }
        }
        self.persist().await;
    }

    fn update_record(
        &self,
        id: &str,
        change: impl FnOnce(&mut ForwardingRecord),
    ) -> Option<ForwardingRecord> {
        let mut state = self.inner.state.write();
        let record = state.records.get_mut(id)?;
        change(record);
        Some(record.clone())
    }

    /// Called by the monitor once the session (or the engine) of an activation ended
    async fn on_session_ended(&self, id: &str, generation: u64, ended: SessionState) {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let current = self.inner.active.get(id).map(|a| a.generation);
        if current != Some(generation) {
            return;
        }
        let Some((_, active)) = self.inner.active.remove(id) else {
            return;
        };

        // Connections over a dead session have nothing to drain
        self.teardown(active, Duration::ZERO).await;

        let (kind, record) = match ended {
            SessionState::Error(reason) => {
                warn!("Forward {} lost its session: {}", id, reason);
                let record = self.update_record(id, |record| {
                    record.status = ForwardStatus::Error;
                    record.error = Some(ForwardError::SessionLifecycle(reason).to_string());
                });
                (ForwardEventKind::Error, record)
            }
            _ => {
                info!("Forward {} deactivated: session closed", id);
                let record = self.update_record(id, |record| {
                    record.status = ForwardStatus::Inactive;
                    record.error = None;
                });
                (ForwardEventKind::Stopped, record)
            }
        };

        self.persist().await;
        if let Some(record) = record {
            self.inner.events.emit(kind, &record);
        }
    }
}

/// Watch one activation until its session ends or its listener dies
async fn monitor_session(
    inner: Weak<Inner>,
    id: String,
    generation: u64,
    mut state_rx: tokio::sync::watch::Receiver<SessionState>,
    lifecycle: Arc<ForwardLifecycle>,
) {
    let ended = tokio::select! {
        biased;
        state = wait_terminal(&mut state_rx) => state,
        _ = lifecycle.finished() => {
            if lifecycle.is_stopping() {
                return;
            }
            let current = state_rx.borrow().clone();
            if current.is_terminal() {
                current
            } else {
                SessionState::Error("listener closed unexpectedly".into())
            }
        }
    };

    let Some(inner) = inner.upgrade() else {
        return;
    };
    ForwardingRegistry { inner }
        .on_session_ended(&id, generation, ended)
        .await;
}

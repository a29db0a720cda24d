// Shared fakes for the telemetry integration tests
//
// Every collaborator is in memory. The transport records what it was sent and
// can be told to fail or to hold requests until released.

#![allow(dead_code)]

use async_trait::async_trait;
use cairn_telemetry::prefs::MemoryStore;
use cairn_telemetry::schema::{ProcessedBatch, PROCESSED_TABLE, TELEMETRY_TABLE};
use cairn_telemetry::store::{
    AggregateQuery, InsertQuery, MemoryTableService, ReadQuery, StoredRow, TableService,
};
use cairn_telemetry::transport::{ApiRequest, ApiResponse, DeviceRegister, Transport};
use cairn_telemetry::{
    BroadcastEventBus, Collaborators, DeviceInfo, GroupSession, NetworkMonitor, NetworkStatus,
    ProfileSession, SessionProvider, TelemetryConfig, TelemetryRecord, TelemetryService,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

pub const DEVICE_ID: &str = "0123456789abcdef0123456789abcdef";
pub const USER_ID: &str = "user-1";
pub const SESSION_ID: &str = "session-1";
pub const GROUP_ID: &str = "group-1";

/// Transport that records requests and answers 200 unless told otherwise
#[derive(Default)]
pub struct CountingTransport {
    calls: AtomicUsize,
    requests: Mutex<Vec<ApiRequest>>,
    /// Zero-based call index from which every call fails
    fail_from: Option<usize>,
    response: Value,
    gate: Option<Gate>,
}

/// Holds each request until a permit is released
pub struct Gate {
    pub entered: Arc<Notify>,
    pub permits: Arc<Semaphore>,
}

impl CountingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_from(call: usize) -> Self {
        Self {
            fail_from: Some(call),
            ..Default::default()
        }
    }

    pub fn responding(body: Value) -> Self {
        Self {
            response: body,
            ..Default::default()
        }
    }

    pub fn gated(entered: Arc<Notify>, permits: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(Gate { entered, permits }),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for CountingTransport {
    async fn fetch(&self, request: ApiRequest) -> anyhow::Result<ApiResponse> {
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.permits.acquire().await?.forget();
        }

        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        if self.fail_from.is_some_and(|from| call >= from) {
            anyhow::bail!("connection reset");
        }
        Ok(ApiResponse::ok(self.response.clone()))
    }
}

#[derive(Default)]
pub struct CountingRegister {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingRegister {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceRegister for CountingRegister {
    async fn register_device(&self) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("register endpoint unavailable");
        }
        Ok(())
    }
}

pub struct FixedSessions {
    pub profile: Option<ProfileSession>,
    pub group: Option<GroupSession>,
}

impl FixedSessions {
    pub fn signed_in() -> Self {
        Self {
            profile: Some(ProfileSession {
                uid: USER_ID.to_string(),
                sid: SESSION_ID.to_string(),
            }),
            group: Some(GroupSession {
                gid: GROUP_ID.to_string(),
            }),
        }
    }

    pub fn signed_out() -> Self {
        Self {
            profile: None,
            group: None,
        }
    }
}

#[async_trait]
impl SessionProvider for FixedSessions {
    async fn active_profile_session(&self) -> anyhow::Result<Option<ProfileSession>> {
        Ok(self.profile.clone())
    }

    async fn active_group_session(&self) -> anyhow::Result<Option<GroupSession>> {
        Ok(self.group.clone())
    }
}

pub struct StaticDevice(pub String);

impl DeviceInfo for StaticDevice {
    fn device_id(&self) -> String {
        self.0.clone()
    }
}

/// Memory store with switchable faults
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryTableService,
    /// Deletes from the raw table report success but remove nothing
    pub sticky_raw_rows: bool,
    /// `copy_database` answers `false`
    pub refuse_copy: bool,
    /// Raw-table inserts fail once a copy has been taken
    pub fail_raw_inserts_after_copy: bool,
    /// Set once `copy_database` succeeds
    pub copied: AtomicBool,
}

#[async_trait]
impl TableService for FaultyStore {
    async fn insert(&self, query: InsertQuery) -> anyhow::Result<u64> {
        if self.fail_raw_inserts_after_copy
            && query.table == TELEMETRY_TABLE
            && self.copied.load(Ordering::SeqCst)
        {
            anyhow::bail!("disk full");
        }
        self.inner.insert(query).await
    }

    async fn read(&self, query: &ReadQuery) -> anyhow::Result<Vec<StoredRow>> {
        self.inner.read(query).await
    }

    async fn delete(&self, table: &str, offsets: &[i64]) -> anyhow::Result<u64> {
        if self.sticky_raw_rows && table == TELEMETRY_TABLE {
            return Ok(offsets.len() as u64);
        }
        self.inner.delete(table, offsets).await
    }

    async fn execute(&self, query: &AggregateQuery) -> anyhow::Result<i64> {
        self.inner.execute(query).await
    }

    async fn copy_database(&self, destination: &Path) -> anyhow::Result<bool> {
        if self.refuse_copy {
            return Ok(false);
        }
        let copied = self.inner.copy_database(destination).await?;
        self.copied.store(copied, Ordering::SeqCst);
        Ok(copied)
    }

    async fn open(&self, path: &Path) -> anyhow::Result<Arc<dyn TableService>> {
        self.inner.open(path).await
    }

    async fn tables(&self) -> anyhow::Result<Vec<String>> {
        self.inner.tables().await
    }

    async fn drop_table(&self, table: &str) -> anyhow::Result<()> {
        self.inner.drop_table(table).await
    }
}

/// Service wired to in-memory fakes, with handles on each
pub struct Harness {
    pub service: TelemetryService,
    pub store: Arc<dyn TableService>,
    pub key_value_store: Arc<MemoryStore>,
    pub preferences: Arc<MemoryStore>,
    pub transport: Arc<CountingTransport>,
    pub register: Arc<CountingRegister>,
    pub network: Arc<NetworkMonitor>,
    pub bus: Arc<BroadcastEventBus>,
}

/// Small batches and an offline network so tests control packing
pub fn test_config() -> TelemetryConfig {
    TelemetryConfig {
        host: "https://collector.test".to_string(),
        batch_size: 3,
        sync_threshold: 200,
        ..Default::default()
    }
}

pub struct HarnessBuilder {
    config: TelemetryConfig,
    store: Arc<dyn TableService>,
    transport: CountingTransport,
    register: CountingRegister,
    sessions: FixedSessions,
    device_id: String,
    network: NetworkStatus,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: test_config(),
            store: Arc::new(MemoryTableService::new()),
            transport: CountingTransport::new(),
            register: CountingRegister::default(),
            sessions: FixedSessions::signed_in(),
            device_id: DEVICE_ID.to_string(),
            network: NetworkStatus::Offline,
        }
    }

    pub fn config(mut self, config: TelemetryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn TableService>) -> Self {
        self.store = store;
        self
    }

    pub fn transport(mut self, transport: CountingTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn register(mut self, register: CountingRegister) -> Self {
        self.register = register;
        self
    }

    pub fn sessions(mut self, sessions: FixedSessions) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn device_id(mut self, device_id: &str) -> Self {
        self.device_id = device_id.to_string();
        self
    }

    pub fn network(mut self, status: NetworkStatus) -> Self {
        self.network = status;
        self
    }

    pub fn build(self) -> Harness {
        let key_value_store = Arc::new(MemoryStore::new());
        let preferences = Arc::new(MemoryStore::new());
        let transport = Arc::new(self.transport);
        let register = Arc::new(self.register);
        let network = Arc::new(NetworkMonitor::new(self.network));
        let bus = Arc::new(BroadcastEventBus::default());

        let service = TelemetryService::new(
            self.config,
            Collaborators {
                store: self.store.clone(),
                key_value_store: key_value_store.clone(),
                preferences: preferences.clone(),
                transport: transport.clone(),
                device_register: register.clone(),
                sessions: Arc::new(self.sessions),
                device: Arc::new(StaticDevice(self.device_id)),
                network: network.clone(),
                events: bus.clone(),
            },
        );

        Harness {
            service,
            store: self.store,
            key_value_store,
            preferences,
            transport,
            register,
            network,
            bus,
        }
    }
}

pub fn harness() -> Harness {
    HarnessBuilder::new().build()
}

impl Harness {
    pub async fn log_events(&self, count: usize) {
        for i in 0..count {
            let raw = json!({
                "eid": "LOG",
                "edata": {"type": "app", "level": "INFO", "message": format!("event {i}")},
            });
            assert!(self.service.save_telemetry(&raw.to_string()).await);
        }
    }

    pub async fn raw_records(&self) -> Vec<TelemetryRecord> {
        self.store
            .read(&ReadQuery::table(TELEMETRY_TABLE))
            .await
            .unwrap()
            .iter()
            .map(|stored| serde_json::from_str(stored.row["event"].as_str().unwrap()).unwrap())
            .collect()
    }

    pub async fn batches(&self) -> Vec<ProcessedBatch> {
        self.store
            .read(&ReadQuery::table(PROCESSED_TABLE))
            .await
            .unwrap()
            .iter()
            .map(|stored| ProcessedBatch::from_stored(stored).unwrap())
            .collect()
    }

    pub async fn count(&self, table: &str) -> i64 {
        self.store
            .execute(&AggregateQuery::count(table))
            .await
            .unwrap()
    }
}

/// Message ids of every event inside the given batches, in order
pub fn batched_mids(batches: &[ProcessedBatch]) -> Vec<String> {
    batches
        .iter()
        .flat_map(|batch| {
            let payload: Value = serde_json::from_str(&batch.data).unwrap();
            payload["events"]
                .as_array()
                .unwrap()
                .iter()
                .map(|event| event["mid"].as_str().unwrap().to_string())
                .collect::<Vec<_>>()
        })
        .collect()
}

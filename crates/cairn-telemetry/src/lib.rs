//! # cairn Telemetry
//!
//! Local-first telemetry for cairn apps: capture structured events, queue them
//! in a local store, and sync them to a collector in batches.
//!
//! ## Flow
//!
//! - **Capture**: typed requests (or raw JSON) become records, decorated with
//!   the active profile session, device id and producer, and appended to the
//!   `telemetry` table
//! - **Sync**: raw events are packed into batches in `processed_telemetry`,
//!   uploaded one at a time, and deleted once the collector accepts them
//! - **Auto-sync**: a background task syncs on an interval and when the
//!   network comes back
//! - **Export / Import**: queued batches move between devices as a single
//!   file carrying a checksummed manifest
//!
//! ## Guarantees
//!
//! - **At-least-once**: a batch is deleted only after a 2xx from the collector
//! - **Fail Gracefully**: capture returns `false`, sync reports `error`;
//!   neither panics nor blocks the host
//! - **Debug Mode**: batches are logged instead of uploaded and stay queued
//!
//! ## Opt-Out
//!
//! ```bash
//! # Via environment variable
//! export CAIRN_TELEMETRY_DISABLED=1
//!
//! # Via config file (~/.cairn/config.toml)
//! [telemetry]
//! enabled = false
//! ```
//!
//! Storage, preferences, transport, sessions and network status are traits;
//! the crate ships default implementations of each so a host can start with
//! [`TelemetryService::new`] and swap pieces later.

pub mod auto_sync;
pub mod bus;
pub mod config;
pub mod decorator;
pub mod device;
pub mod error;
pub mod events;
pub mod network;
pub mod pipeline;
pub mod prefs;
pub mod recorder;
pub mod request;
pub mod schema;
pub mod service;
pub mod session;
pub mod store;
pub mod sync;
pub mod transport;

pub use auto_sync::{AutoSync, AutoSyncMode};
pub use bus::{BroadcastEventBus, BusEvent, EventBus, TelemetryEvent};
pub use config::{load_telemetry_config, TelemetryConfig};
pub use decorator::{PreparedEvent, TelemetryDecorator};
pub use device::{DeviceInfo, LocalDeviceInfo};
pub use error::{Result, TelemetryError};
pub use events::{EventData, EventType, TelemetryRecord};
pub use network::{NetworkInfo, NetworkMonitor, NetworkStatus};
pub use pipeline::{ExportManifest, ExportResponse, ExportTelemetryRequest, ImportTelemetryRequest};
pub use prefs::{FilePreferences, KeyValueStore, MemoryStore, SharedPreferences};
pub use request::TelemetryRequest;
pub use service::{Collaborators, TelemetryService, TelemetryStat};
pub use session::{GroupSession, ProfileSession, SessionProvider};
pub use store::{MemoryTableService, TableService};
pub use sync::{SyncHandler, SyncRequest, SyncStat};
pub use transport::{DeviceRegister, HttpDeviceRegister, HttpTransport, Transport};

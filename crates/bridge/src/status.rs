use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedStatus = Arc<RwLock<BridgeStatus>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Observability snapshot for the web UI. Never read back by either store.
pub struct BridgeStatus {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub counters: IngestCounters,
    pub last_value: Option<f64>,
    pub events: VecDeque<BridgeEvent>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestCounters {
    /// Publishes seen on the telemetry topic.
    pub received: u64,
    pub stored: u64,
    /// Payloads that could not be parsed.
    pub dropped: u64,
    /// Readings lost after the storage retry budget ran out.
    pub store_failures: u64,
    /// Failed broker connection attempts since startup.
    pub connection_failures: u64,
}

#[derive(Clone, Serialize)]
pub struct BridgeEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Control,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub ingest: IngestCounters,
    pub stored_readings: Option<i64>,
    pub last_value: Option<f64>,
    pub events: Vec<BridgeEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl BridgeStatus {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            counters: IngestCounters::default(),
            last_value: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedStatus {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn record_received(&mut self) {
        self.counters.received += 1;
    }

    pub fn record_stored(&mut self, value: f64) {
        self.counters.stored += 1;
        self.last_value = Some(value);
    }

    /// Counted only; parse failures never enter the event log.
    pub fn record_dropped(&mut self) {
        self.counters.dropped += 1;
    }

    pub fn record_store_failure(&mut self, detail: String) {
        self.counters.store_failures += 1;
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_connection_failure(&mut self) {
        self.counters.connection_failures += 1;
    }

    pub fn set_connected(&mut self, connected: bool, detail: String) {
        self.mqtt_connected = connected;
        self.push_event(EventKind::System, detail);
    }

    pub fn record_control(&mut self, detail: String) {
        self.push_event(EventKind::Control, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot, newest event first.
    pub fn to_status(&self, stored_readings: Option<i64>) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            ingest: self.counters,
            stored_readings,
            last_value: self.last_value,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(BridgeEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for BridgeStatus {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

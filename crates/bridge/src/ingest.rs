//! Telemetry ingestor: MQTT subscription → parse → telemetry store.
//!
//! Each delivery is stored as its own observation; redelivered messages are
//! not deduplicated because device payloads carry no message identity.
//! Appends are awaited inside the event loop, so `observed_at` order always
//! matches `sequence_id` order.

use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::{IngestConfig, MqttConfig};
use crate::db::{from_unix_millis, unix_millis, Db};
use crate::error::BridgeError;
use crate::mqtt::{parse_reading, topic_matches};
use crate::retry::{with_retry, Backoff, Reconnect};
use crate::status::SharedStatus;

/// Capacity of the rumqttc request channel.
const REQUEST_CAPACITY: usize = 20;

// ---------------------------------------------------------------------------
// Monotonic ingestion clock
// ---------------------------------------------------------------------------

/// Wall clock at millisecond resolution that never goes backwards, even if
/// the system clock is stepped.
#[derive(Debug, Default)]
pub struct IngestClock {
    last_ms: Option<i64>,
}

impl IngestClock {
    pub fn stamp(&mut self) -> OffsetDateTime {
        self.stamp_at(OffsetDateTime::now_utc())
    }

    fn stamp_at(&mut self, now: OffsetDateTime) -> OffsetDateTime {
        let now_ms = unix_millis(now);
        let ms = self.last_ms.map_or(now_ms, |last| last.max(now_ms));
        self.last_ms = Some(ms);
        from_unix_millis(ms)
    }
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

pub struct Ingestor {
    db: Db,
    status: SharedStatus,
    clock: IngestClock,
    store_attempts: u32,
    store_backoff: Backoff,
}

impl Ingestor {
    pub fn new(db: Db, status: SharedStatus, cfg: &IngestConfig) -> Self {
        Self {
            db,
            status,
            clock: IngestClock::default(),
            store_attempts: cfg.store_attempts,
            store_backoff: cfg.store_backoff(),
        }
    }

    /// Handle one publish payload. Returns the sequence id when the reading
    /// was stored; parse and storage failures are logged and counted.
    pub async fn handle_payload(&mut self, payload: &[u8]) -> Option<i64> {
        self.status.write().await.record_received();

        let value = match parse_reading(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("dropping telemetry message: {e}");
                self.status.write().await.record_dropped();
                return None;
            }
        };

        let observed_at = self.clock.stamp();
        let db = &self.db;
        let stored = with_retry("telemetry append", self.store_attempts, self.store_backoff, || {
            let db = db.clone();
            async move { db.append(value, observed_at).await }
        })
        .await;

        match stored {
            Ok(sequence_id) => {
                debug!(sequence_id, value, "reading stored");
                self.status.write().await.record_stored(value);
                Some(sequence_id)
            }
            Err(e) => {
                error!(value, attempts = self.store_attempts, "reading lost: {e}");
                self.status
                    .write()
                    .await
                    .record_store_failure(format!("reading {value} lost: {e}"));
                None
            }
        }
    }

    /// Run the subscription loop until `shutdown` flips to true (or its
    /// sender is dropped). Broker errors are retried forever with backoff.
    pub async fn run(
        mut self,
        mqtt: MqttConfig,
        reconnect_backoff: Backoff,
        drain_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut options = MqttOptions::new(mqtt.client_id.clone(), mqtt.host.clone(), mqtt.port);
        options.set_keep_alive(Duration::from_secs(mqtt.keep_alive_sec));

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let mut reconnect = Reconnect::new(reconnect_backoff);

        info!(host = %mqtt.host, port = mqtt.port, topic = %mqtt.topic, "ingestor starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    reconnect.reset();
                    info!("mqtt connected");
                    self.status
                        .write()
                        .await
                        .set_connected(true, "mqtt connected".to_string());

                    // The session is not persistent, so every connect needs
                    // a fresh subscription.
                    if let Err(e) = client.try_subscribe(mqtt.topic.clone(), QoS::AtLeastOnce) {
                        warn!(topic = %mqtt.topic, "subscribe request failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    info!(topic = %mqtt.topic, "subscribed");
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    if !topic_matches(&mqtt.topic, &p.topic) {
                        debug!(topic = %p.topic, "ignoring publish on unexpected topic");
                        continue;
                    }
                    self.handle_payload(&p.payload).await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("broker sent disconnect");
                    self.status
                        .write()
                        .await
                        .set_connected(false, "mqtt disconnected by broker".to_string());
                }
                Ok(_) => {}
                Err(e) => {
                    let err = BridgeError::TransportDisconnected(e.to_string());
                    let delay = reconnect.failure();
                    warn!(
                        failures = reconnect.failures(),
                        delay_ms = delay.as_millis() as u64,
                        "{err}, reconnecting"
                    );
                    {
                        let mut st = self.status.write().await;
                        st.record_connection_failure();
                        if st.mqtt_connected || reconnect.failures() == 1 {
                            st.set_connected(false, err.to_string());
                        }
                    }

                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        self.drain(&client, &mut eventloop, &mqtt.topic, drain_timeout)
            .await;
    }

    /// Unsubscribe and disconnect, polling the event loop so the requests
    /// actually reach the broker, but never for longer than `limit`.
    async fn drain(
        &self,
        client: &AsyncClient,
        eventloop: &mut rumqttc::EventLoop,
        topic: &str,
        limit: Duration,
    ) {
        info!("ingestor shutting down");
        let connected = self.status.read().await.mqtt_connected;

        if connected {
            let _ = client.try_unsubscribe(topic);
            let _ = client.try_disconnect();

            let flushed = timeout(limit, async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            })
            .await;

            if flushed.is_err() {
                warn!(timeout_ms = limit.as_millis() as u64, "mqtt drain timed out");
            }
        }

        self.status
            .write()
            .await
            .set_connected(false, "ingestor stopped".to_string());
    }
}

// ===========================================================================
// Tests
// ===========================================================================

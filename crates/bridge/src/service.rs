//! Per-operation request handlers. The web layer only routes and maps
//! outcomes to HTTP; validation and store access live here.

use serde::{Deserialize, Serialize};
use std::num::IntErrorKind;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info};

use crate::control::{ControlPatch, ControlState, ControlStore, Power};
use crate::db::{unix_millis, Db, TelemetryReading};
use crate::error::{BridgeError, Result};
use crate::retry::{with_retry, Backoff};
use crate::status::SharedStatus;

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Accepted(ControlState),
    Rejected(String),
}

#[derive(Clone)]
pub struct ControlService {
    store: ControlStore,
    status: SharedStatus,
}

impl ControlService {
    pub fn new(store: ControlStore, status: SharedStatus) -> Self {
        Self { store, status }
    }

    pub async fn handle_fetch(&self) -> ControlState {
        self.store.get().await
    }

    /// Validate `raw` and apply it. Rejections never touch the store; an
    /// `Err` means the store could not persist an otherwise valid update.
    pub async fn handle_update(&self, raw: &str) -> Result<UpdateOutcome> {
        let patch = match parse_update(raw) {
            Ok(p) => p,
            Err(BridgeError::InvalidInput(reason)) => {
                debug!("control update rejected: {reason}");
                return Ok(UpdateOutcome::Rejected(reason));
            }
            Err(e) => return Err(e),
        };

        let state = match (patch.power, patch.level) {
            (Some(power), Some(level)) => self.store.replace(power, level).await?,
            _ => self.store.update(patch).await?,
        };
        info!(power = %state.power, level = state.level, "control state updated");
        self.status
            .write()
            .await
            .record_control(format!("power {} level {}", state.power, state.level));
        Ok(UpdateOutcome::Accepted(state))
    }
}

/// Form body of a control update. `led`/`rgb` are the names older clients
/// post; unknown keys such as a submit button are ignored.
#[derive(Debug, Default, Deserialize)]
struct UpdateForm {
    #[serde(alias = "led")]
    power: Option<String>,
    #[serde(alias = "rgb")]
    level: Option<String>,
}

/// Accepts either a bare power token (`ON`) or a urlencoded form body with
/// `power`/`led` and/or `level`/`rgb` fields.
pub fn parse_update(raw: &str) -> Result<ControlPatch> {
    let body = raw.trim();
    if body.is_empty() {
        return Err(BridgeError::InvalidInput(
            "empty request body, send ON, OFF or level=<0-255>".into(),
        ));
    }

    if !body.contains('=') {
        return Ok(ControlPatch {
            power: Some(body.parse::<Power>()?),
            level: None,
        });
    }

    let form: UpdateForm = serde_urlencoded::from_str(body)
        .map_err(|e| BridgeError::InvalidInput(format!("malformed form body: {e}")))?;

    let patch = ControlPatch {
        power: form.power.as_deref().map(str::parse::<Power>).transpose()?,
        level: form.level.as_deref().map(parse_level).transpose()?,
    };
    if patch.is_empty() {
        return Err(BridgeError::InvalidInput(
            "form must carry power/led and/or level/rgb".into(),
        ));
    }
    Ok(patch)
}

/// Integer levels outside `i64` saturate so they still clamp to 0 or 255.
fn parse_level(raw: &str) -> Result<i64> {
    let text = raw.trim();
    match text.parse::<i64>() {
        Ok(level) => Ok(level),
        Err(e) => match e.kind() {
            IntErrorKind::PosOverflow => Ok(i64::MAX),
            IntErrorKind::NegOverflow => Ok(i64::MIN),
            _ => Err(BridgeError::InvalidInput(format!(
                "level '{text}' is not an integer"
            ))),
        },
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Chart-ready window: parallel arrays, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySeries {
    pub labels: Vec<String>,
    pub values: Vec<f64>,
}

impl From<Vec<TelemetryReading>> for TelemetrySeries {
    fn from(readings: Vec<TelemetryReading>) -> Self {
        let mut series = TelemetrySeries {
            labels: Vec::with_capacity(readings.len()),
            values: Vec::with_capacity(readings.len()),
        };
        for r in readings {
            let label = r
                .observed_at
                .format(&Rfc3339)
                .unwrap_or_else(|_| unix_millis(r.observed_at).to_string());
            series.labels.push(label);
            series.values.push(r.value);
        }
        series
    }
}

#[derive(Clone)]
pub struct TelemetryService {
    db: Db,
    max_window: u32,
    read_attempts: u32,
    backoff: Backoff,
}

impl TelemetryService {
    pub fn new(db: Db, max_window: u32, read_attempts: u32, backoff: Backoff) -> Self {
        Self {
            db,
            max_window,
            read_attempts,
            backoff,
        }
    }

    pub async fn handle_recent(&self, n: u32) -> Result<TelemetrySeries> {
        let n = n.min(self.max_window);
        let readings = with_retry("telemetry query", self.read_attempts, self.backoff, || {
            let db = self.db.clone();
            async move { db.query_recent(n).await }
        })
        .await?;
        Ok(readings.into())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::BridgeStatus;
    use std::time::Duration;
    use tempfile::tempdir;

    fn quick() -> Backoff {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(2))
    }

    async fn control_service(dir: &tempfile::TempDir) -> ControlService {
        let store = ControlStore::open(dir.path().join("results.json")).await.unwrap();
        ControlService::new(store, BridgeStatus::shared())
    }

    async fn telemetry_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    // -- parse_update -------------------------------------------------------

    #[test]
    fn parse_bare_tokens() {
        assert_eq!(
            parse_update("ON").unwrap(),
            ControlPatch {
                power: Some(Power::On),
                level: None
            }
        );
        assert_eq!(parse_update(" off \n").unwrap().power, Some(Power::Off));
    }

    #[test]
    fn parse_form_level_only() {
        assert_eq!(
            parse_update("rgb=128").unwrap(),
            ControlPatch {
                power: None,
                level: Some(128)
            }
        );
        assert_eq!(parse_update("level=-3").unwrap().level, Some(-3));
        assert_eq!(
            parse_update("level=99999999999999999999").unwrap().level,
            Some(i64::MAX)
        );
        assert_eq!(
            parse_update("rgb=-99999999999999999999").unwrap().level,
            Some(i64::MIN)
        );
    }

    #[test]
    fn parse_form_decodes_percent_escapes() {
        assert_eq!(parse_update("led=O%4E").unwrap().power, Some(Power::On));
        assert_eq!(parse_update("%6Cevel=%31%32").unwrap().level, Some(12));
        assert_eq!(parse_update("power=+off+").unwrap().power, Some(Power::Off));
    }

    #[test]
    fn parse_form_both_fields_and_ignores_unknown_keys() {
        let p = parse_update("led=ON&rgb=7&submit=Save").unwrap();
        assert_eq!(p.power, Some(Power::On));
        assert_eq!(p.level, Some(7));
    }

    #[test]
    fn parse_rejects_bad_input() {
        for bad in ["", "   ", "MAYBE", "rgb=abc", "rgb=", "led=MAYBE", "submit=Save", "rgb=1.5"] {
            let err = parse_update(bad).unwrap_err();
            assert!(matches!(err, BridgeError::InvalidInput(_)), "{bad:?}");
        }
    }

    // -- ControlService -----------------------------------------------------

    #[tokio::test]
    async fn control_scenario() {
        let dir = tempdir().unwrap();
        let svc = control_service(&dir).await;

        assert_eq!(svc.handle_fetch().await, ControlState::new(Power::Off, 0));

        let on = svc.handle_update("ON").await.unwrap();
        assert_eq!(on, UpdateOutcome::Accepted(ControlState::new(Power::On, 0)));

        svc.handle_update("rgb=128").await.unwrap();
        assert_eq!(svc.handle_fetch().await, ControlState::new(Power::On, 128));

        svc.handle_update("rgb=999").await.unwrap();
        assert_eq!(svc.handle_fetch().await, ControlState::new(Power::On, 255));

        svc.handle_update("level=0").await.unwrap();
        svc.handle_update("level=99999999999999999999").await.unwrap();
        assert_eq!(svc.handle_fetch().await, ControlState::new(Power::On, 255));

        let rejected = svc.handle_update("MAYBE").await.unwrap();
        assert!(matches!(rejected, UpdateOutcome::Rejected(_)));
        assert_eq!(svc.handle_fetch().await, ControlState::new(Power::On, 255));
    }

    #[tokio::test]
    async fn accepted_update_is_logged_to_status() {
        let dir = tempdir().unwrap();
        let status = BridgeStatus::shared();
        let store = ControlStore::open(dir.path().join("results.json")).await.unwrap();
        let svc = ControlService::new(store, status.clone());

        svc.handle_update("OFF").await.unwrap();
        let st = status.read().await;
        assert_eq!(st.events.back().unwrap().detail, "power OFF level 0");
    }

    // -- TelemetryService ---------------------------------------------------

    #[tokio::test]
    async fn recent_window_is_chronological() {
        let db = telemetry_db().await;
        let t0 = time::macros::datetime!(2025-03-01 12:00:00 UTC);
        for (i, v) in [1.0, 2.0, 3.0].into_iter().enumerate() {
            db.append(v, t0 + time::Duration::seconds(i as i64)).await.unwrap();
        }

        let svc = TelemetryService::new(db, 500, 3, quick());
        let series = svc.handle_recent(2).await.unwrap();
        assert_eq!(series.values, vec![2.0, 3.0]);
        assert_eq!(
            series.labels,
            vec!["2025-03-01T12:00:01Z".to_string(), "2025-03-01T12:00:02Z".to_string()]
        );
        assert!(series.labels[0] < series.labels[1]);
    }

    #[tokio::test]
    async fn recent_window_is_capped() {
        let db = telemetry_db().await;
        let t0 = time::macros::datetime!(2025-03-01 12:00:00 UTC);
        for i in 0..10 {
            db.append(f64::from(i), t0).await.unwrap();
        }

        let svc = TelemetryService::new(db, 4, 1, quick());
        let series = svc.handle_recent(1000).await.unwrap();
        assert_eq!(series.values, vec![6.0, 7.0, 8.0, 9.0]);
        assert_eq!(series.labels.len(), series.values.len());
    }

    #[tokio::test]
    async fn empty_store_gives_empty_series() {
        let svc = TelemetryService::new(telemetry_db().await, 500, 1, quick());
        assert_eq!(svc.handle_recent(50).await.unwrap(), TelemetrySeries::default());
    }
}

mod ledger;
mod liveness;
mod monitor;
mod venue;

pub use ledger::Measurement;
pub use liveness::{NEVER, STALENESS_THRESHOLD};
pub use monitor::VenueMonitor;
pub use venue::Transition;

use crate::config::{Config, WeightBounds};
use crate::store::MeasurementStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use ledger::Ledger;
use liveness::{known, Liveness};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use venue::Venue;

#[derive(Debug)]
struct ScaleState {
    ledger: Ledger,
    liveness: Liveness,
    venue: Venue,
    active_keg: i64,
}

/// Result of offering a weight reading to the scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AppendOutcome {
    Recorded {
        measurement: Measurement,
        persisted: bool,
    },
    Implausible {
        weight: f64,
    },
}

impl AppendOutcome {
    pub fn measurement(&self) -> Option<Measurement> {
        match self {
            AppendOutcome::Recorded { measurement, .. } => Some(*measurement),
            AppendOutcome::Implausible { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MeasurementView {
    pub seq: u64,
    pub weight: f64,
    pub recorded_at: DateTime<Utc>,
    pub age_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VenueView {
    pub is_open: bool,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub state_duration_secs: Option<i64>,
}

/// Read-only view of the scale taken under a single lock acquisition.
#[derive(Debug, Clone, Serialize)]
pub struct ScaleSnapshot {
    pub taken_at: DateTime<Utc>,
    pub ok: bool,
    pub last_contact_at: Option<DateTime<Utc>>,
    pub last_contact_age_secs: Option<i64>,
    pub rssi: f64,
    pub last_measurement: Option<MeasurementView>,
    pub valid_count: usize,
    pub capacity: usize,
    pub venue: VenueView,
    pub active_keg: i64,
}

/// Owns the measurement ledger, sensor liveness and pub state behind one lock.
///
/// Every method takes the lock once and releases it before returning; nothing
/// is held across the persistence calls.
#[derive(Clone)]
pub struct Scale {
    state: Arc<Mutex<ScaleState>>,
    store: Arc<dyn MeasurementStore>,
    bounds: WeightBounds,
}

impl Scale {
    pub fn new(config: &Config, store: Arc<dyn MeasurementStore>) -> Self {
        Self::with_limits(
            config.buffer_size,
            config.weight_bounds,
            config.staleness_threshold,
            store,
        )
    }

    pub fn with_limits(
        capacity: usize,
        bounds: WeightBounds,
        staleness_threshold: std::time::Duration,
        store: Arc<dyn MeasurementStore>,
    ) -> Self {
        let state = ScaleState {
            ledger: Ledger::new(capacity),
            liveness: Liveness::new(staleness_threshold),
            venue: Venue::new(),
            active_keg: 0,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            store,
            bounds,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScaleState> {
        // Each operation leaves the state consistent before it can panic, so a poisoned
        // lock still guards valid data.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pre-seeds the ledger and active keg from the store. Load failures leave the scale empty.
    pub async fn restore_from_store(&self) {
        match self.store.load_recent_measurements().await {
            Ok(measurements) => {
                let loaded = measurements.len();
                let retained = self.lock().ledger.restore(measurements);
                tracing::info!(loaded, retained, "restored measurements from store");
            }
            Err(err) => {
                tracing::warn!(
                    error=%err,
                    "failed to load measurements; starting with empty ledger"
                );
            }
        }

        match self.store.load_active_keg().await {
            Ok(Some(keg)) => {
                self.lock().active_keg = keg;
                tracing::info!(keg, "restored active keg");
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(error=%err, "failed to load active keg"),
        }
    }

    pub fn record_contact(&self, signal: f64) -> Option<Transition> {
        self.record_contact_at(Utc::now(), signal)
    }

    /// Any contact counts as activity: it refreshes liveness and opens the pub if closed.
    pub fn record_contact_at(&self, at: DateTime<Utc>, signal: f64) -> Option<Transition> {
        let (transition, at) = {
            let mut state = self.lock();
            let at = state.liveness.record_contact(at, signal);
            (state.venue.on_contact(at), at)
        };
        if transition.is_some() {
            tracing::info!(opened_at = %at, "pub is open");
        }
        transition
    }

    pub fn set_signal(&self, signal: f64) {
        self.lock().liveness.set_signal(signal);
    }

    pub async fn add_measurement(&self, weight: f64) -> AppendOutcome {
        self.add_measurement_at(weight, Utc::now()).await
    }

    pub async fn add_measurement_at(&self, weight: f64, at: DateTime<Utc>) -> AppendOutcome {
        if !self.bounds.contains(weight) {
            tracing::info!(
                weight,
                min = self.bounds.min_grams,
                max = self.bounds.max_grams,
                "ignoring implausible weight"
            );
            return AppendOutcome::Implausible { weight };
        }

        let measurement = self.lock().ledger.append(weight, at);

        let persisted = match self.store.save_measurement(&measurement).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error=%err, seq = measurement.seq, "could not store measurement");
                false
            }
        };

        AppendOutcome::Recorded {
            measurement,
            persisted,
        }
    }

    /// Measurement `offset` steps back from the newest; `None` past the valid window.
    pub fn measurement(&self, offset: usize) -> Option<Measurement> {
        self.lock().ledger.read_relative(offset)
    }

    pub fn last_measurement(&self) -> Option<Measurement> {
        self.measurement(0)
    }

    pub fn valid_count(&self) -> usize {
        self.lock().ledger.valid_count()
    }

    pub fn capacity(&self) -> usize {
        self.lock().ledger.capacity()
    }

    pub fn has_last_n(&self, n: usize) -> bool {
        self.lock().ledger.has_last_n(n)
    }

    pub fn sum_last_n(&self, n: usize) -> f64 {
        self.lock().ledger.sum_last_n(n)
    }

    /// Callers that need every sample to be real must check [`Scale::has_last_n`] first.
    pub fn average_last_n(&self, n: usize) -> f64 {
        self.lock().ledger.average_last_n(n)
    }

    /// Up to `limit` valid measurements, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Measurement> {
        self.lock().ledger.iter_recent().take(limit).collect()
    }

    pub fn is_ok(&self) -> bool {
        self.is_ok_at(Utc::now())
    }

    pub fn is_ok_at(&self, now: DateTime<Utc>) -> bool {
        self.lock().liveness.is_ok(now)
    }

    pub fn is_open(&self) -> bool {
        self.lock().venue.is_open()
    }

    pub fn recheck(&self) -> Option<Transition> {
        self.recheck_at(Utc::now())
    }

    /// Closes the pub if the scale has gone quiet. Safe to call as often as needed.
    pub fn recheck_at(&self, now: DateTime<Utc>) -> Option<Transition> {
        let mut state = self.lock();
        let transition = recheck_locked(&mut state, now);
        if transition.is_some() {
            tracing::info!(closed_at = %state.venue.closed_at(), "pub is closed");
        }
        transition
    }

    pub fn snapshot(&self) -> ScaleSnapshot {
        self.snapshot_at(Utc::now())
    }

    /// Re-evaluates the pub state, then reads everything in the same critical section.
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> ScaleSnapshot {
        let mut state = self.lock();
        if recheck_locked(&mut state, now).is_some() {
            tracing::info!(closed_at = %state.venue.closed_at(), "pub is closed");
        }

        let last_contact_at = known(state.liveness.last_contact_at());
        let last_measurement = state.ledger.read_relative(0).map(|m| MeasurementView {
            seq: m.seq,
            weight: m.weight,
            recorded_at: m.recorded_at,
            age_secs: age_secs(now, m.recorded_at),
        });

        ScaleSnapshot {
            taken_at: now,
            ok: state.liveness.is_ok(now),
            last_contact_at,
            last_contact_age_secs: state.liveness.contact_age(now).map(|age| age.num_seconds()),
            rssi: state.liveness.last_signal(),
            last_measurement,
            valid_count: state.ledger.valid_count(),
            capacity: state.ledger.capacity(),
            venue: VenueView {
                is_open: state.venue.is_open(),
                opened_at: known(state.venue.opened_at()),
                closed_at: known(state.venue.closed_at()),
                state_duration_secs: state.venue.state_duration(now).map(|d| d.num_seconds()),
            },
            active_keg: state.active_keg,
        }
    }

    pub fn active_keg(&self) -> i64 {
        self.lock().active_keg
    }

    /// Updates the active keg in memory, then persists it. The in-memory value stays
    /// even when persisting fails; the error is returned to the caller.
    pub async fn set_active_keg(&self, keg: i64) -> Result<()> {
        self.lock().active_keg = keg;
        self.store.save_active_keg(keg).await
    }
}

fn recheck_locked(state: &mut ScaleState, now: DateTime<Utc>) -> Option<Transition> {
    let ok = state.liveness.is_ok(now);
    let threshold = state.liveness.threshold();
    state.venue.re_evaluate(now, ok, threshold)
}

fn age_secs(now: DateTime<Utc>, then: DateTime<Utc>) -> i64 {
    now.signed_duration_since(then).num_seconds().max(0)
}

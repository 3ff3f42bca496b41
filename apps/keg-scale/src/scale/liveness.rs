use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Sentinel for "never happened". Far enough in the past that every age computed
/// against it is larger than any staleness threshold, without overflowing.
pub const NEVER: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

pub const STALENESS_THRESHOLD: std::time::Duration = std::time::Duration::from_secs(5 * 60);

pub(crate) fn known(ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
    (ts != NEVER).then_some(ts)
}

pub(crate) fn to_chrono(duration: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(365 * 1000))
}

#[derive(Debug)]
pub(crate) struct Liveness {
    last_contact_at: DateTime<Utc>,
    last_signal: f64,
    threshold: ChronoDuration,
}

impl Liveness {
    pub(crate) fn new(threshold: std::time::Duration) -> Self {
        Self {
            last_contact_at: NEVER,
            last_signal: 0.0,
            threshold: to_chrono(threshold),
        }
    }

    /// Returns the contact time actually stored. A contact stamped before the previous
    /// one does not move `last_contact_at` backwards.
    pub(crate) fn record_contact(&mut self, at: DateTime<Utc>, signal: f64) -> DateTime<Utc> {
        self.last_contact_at = self.last_contact_at.max(at);
        self.last_signal = signal;
        self.last_contact_at
    }

    pub(crate) fn set_signal(&mut self, signal: f64) {
        self.last_signal = signal;
    }

    pub(crate) fn is_ok(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_contact_at) < self.threshold
    }

    /// Time since the last contact, `None` if the scale never checked in.
    pub(crate) fn contact_age(&self, now: DateTime<Utc>) -> Option<ChronoDuration> {
        known(self.last_contact_at)
            .map(|at| now.signed_duration_since(at).max(ChronoDuration::zero()))
    }

    pub(crate) fn last_contact_at(&self) -> DateTime<Utc> {
        self.last_contact_at
    }

    pub(crate) fn last_signal(&self) -> f64 {
        self.last_signal
    }

    pub(crate) fn threshold(&self) -> ChronoDuration {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn never_contacted_is_not_ok() {
        let liveness = Liveness::new(STALENESS_THRESHOLD);
        assert!(!liveness.is_ok(t(0)));
        assert_eq!(known(liveness.last_contact_at()), None);
        assert_eq!(liveness.contact_age(t(0)), None);
    }

    #[test]
    fn ok_until_threshold_elapses() {
        let mut liveness = Liveness::new(STALENESS_THRESHOLD);
        liveness.record_contact(t(0), -71.5);
        assert!(liveness.is_ok(t(0)));
        assert!(liveness.is_ok(t(299)));
        assert!(!liveness.is_ok(t(300)), "threshold is exclusive");
        assert_eq!(liveness.last_signal(), -71.5);
        assert_eq!(liveness.contact_age(t(42)), Some(ChronoDuration::seconds(42)));
    }

    #[test]
    fn late_contact_keeps_the_newer_timestamp() {
        let mut liveness = Liveness::new(STALENESS_THRESHOLD);
        liveness.record_contact(t(100), -60.0);
        assert_eq!(liveness.record_contact(t(40), -65.0), t(100));
        assert_eq!(liveness.last_contact_at(), t(100));
        assert_eq!(liveness.last_signal(), -65.0);
    }

    #[test]
    fn threshold_is_configurable() {
        let mut liveness = Liveness::new(std::time::Duration::from_secs(10));
        liveness.record_contact(t(0), -60.0);
        assert!(liveness.is_ok(t(9)));
        assert!(!liveness.is_ok(t(10)));
    }

    #[test]
    fn set_signal_does_not_count_as_contact() {
        let mut liveness = Liveness::new(STALENESS_THRESHOLD);
        liveness.set_signal(-80.0);
        assert_eq!(liveness.last_signal(), -80.0);
        assert!(!liveness.is_ok(t(0)));
    }
}

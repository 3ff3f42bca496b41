//! Open/closed state of the pub, inferred from how recently the scale checked in.
//!
//! Opening happens synchronously on contact. Closing only happens on a
//! re-evaluation pass, and the close time is backdated to when the scale went
//! quiet rather than when the pass noticed it.

use super::liveness::NEVER;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Opened,
    Closed,
}

#[derive(Debug)]
pub(crate) struct Venue {
    is_open: bool,
    opened_at: DateTime<Utc>,
    closed_at: DateTime<Utc>,
}

impl Venue {
    pub(crate) fn new() -> Self {
        Self {
            is_open: false,
            opened_at: NEVER,
            closed_at: NEVER,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.is_open
    }

    pub(crate) fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub(crate) fn closed_at(&self) -> DateTime<Utc> {
        self.closed_at
    }

    pub(crate) fn on_contact(&mut self, at: DateTime<Utc>) -> Option<Transition> {
        if self.is_open {
            return None;
        }
        self.is_open = true;
        self.opened_at = at.max(self.closed_at + ChronoDuration::milliseconds(1));
        Some(Transition::Opened)
    }

    pub(crate) fn re_evaluate(
        &mut self,
        now: DateTime<Utc>,
        liveness_ok: bool,
        threshold: ChronoDuration,
    ) -> Option<Transition> {
        if liveness_ok || !self.is_open {
            return None;
        }
        let backdated = now.checked_sub_signed(threshold).unwrap_or(now);
        let earliest = self.opened_at + ChronoDuration::milliseconds(1);
        self.is_open = false;
        self.closed_at = backdated.max(earliest);
        Some(Transition::Closed)
    }

    /// Time spent in the current state, zero if the last transition lies in the future.
    pub(crate) fn state_duration(&self, now: DateTime<Utc>) -> Option<ChronoDuration> {
        let since = if self.is_open {
            self.opened_at
        } else {
            self.closed_at
        };
        if since == NEVER {
            return None;
        }
        Some(now.signed_duration_since(since).max(ChronoDuration::zero()))
    }
}

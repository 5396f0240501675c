//! Booking admission rules.
//!
//! Everything here is a pure function of its inputs. Callers must hold the
//! laboratory's write lock between [`validate`] and persisting the booking,
//! otherwise two overlapping requests can both be admitted.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;

/// The slot a booking asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposedBooking {
    pub date: NaiveDate,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub attendees: u32,
}

impl From<&Booking> for ProposedBooking {
    fn from(b: &Booking) -> Self {
        Self {
            date: b.date,
            start: b.start,
            end: b.end,
            attendees: b.attendees,
        }
    }
}

/// Decide whether `proposed` may be admitted into `laboratory`.
///
/// Checks run in a fixed order: time ordering, overlap with live bookings,
/// operating hours, capacity. `existing` is scanned in the order given and the
/// first overlapping live booking is reported. `exclude` skips the booking
/// being edited.
pub fn validate<'a>(
    proposed: &ProposedBooking,
    existing: impl IntoIterator<Item = &'a Booking>,
    laboratory: &Laboratory,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    if proposed.start >= proposed.end {
        return Err(EngineError::InvalidRange {
            start: proposed.start,
            end: proposed.end,
        });
    }
    let range = TimeRange::new(proposed.start, proposed.end);

    let conflict = existing
        .into_iter()
        .filter(|b| b.date == proposed.date && b.status.holds_slot())
        .filter(|b| Some(b.id) != exclude)
        .find(|b| b.range().overlaps(&range));
    if let Some(hit) = conflict {
        return Err(EngineError::TimeConflict {
            booking_id: hit.id,
            laboratory: laboratory.name.clone(),
        });
    }

    let hours = laboratory.operating_hours;
    if proposed.start < hours.open || proposed.end > hours.close {
        return Err(EngineError::OutsideOperatingHours {
            open: hours.open,
            close: hours.close,
        });
    }

    if proposed.attendees > laboratory.capacity {
        return Err(EngineError::CapacityExceeded(laboratory.capacity));
    }

    Ok(())
}

// ── Status state machine ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transition {
    Approve,
    Reject,
    Cancel,
    /// Back to pending. No status allows it.
    Reopen,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transition::Approve => "approve",
            Transition::Reject => "reject",
            Transition::Cancel => "cancel",
            Transition::Reopen => "reopen",
        })
    }
}

impl BookingStatus {
    /// pending → approved | rejected | cancelled, approved → cancelled.
    pub fn apply(self, transition: Transition) -> Result<BookingStatus, EngineError> {
        use BookingStatus::*;
        match (self, transition) {
            (Pending, Transition::Approve) => Ok(Approved),
            (Pending, Transition::Reject) => Ok(Rejected),
            (Pending | Approved, Transition::Cancel) => Ok(Cancelled),
            (from, transition) => Err(EngineError::InvalidTransition { from, transition }),
        }
    }

    pub fn ensure_editable(self) -> Result<(), EngineError> {
        if self == BookingStatus::Pending {
            Ok(())
        } else {
            Err(EngineError::NotEditable(self))
        }
    }
}

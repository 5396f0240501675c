use ulid::Ulid;

use crate::model::{BookingStatus, LabStatus, RequiredField, TimeOfDay, ValueError};
use crate::validator::Transition;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Start time is not before end time.
    InvalidRange { start: TimeOfDay, end: TimeOfDay },
    TimeConflict { booking_id: Ulid, laboratory: String },
    OutsideOperatingHours { open: TimeOfDay, close: TimeOfDay },
    CapacityExceeded(u32),
    InvalidTransition { from: BookingStatus, transition: Transition },
    NotEditable(BookingStatus),
    RoleElevationDenied,
    PermissionDenied(&'static str),
    LaboratoryUnavailable { laboratory: String, status: LabStatus },
    HasActiveBookings(Ulid),
    InvalidInput(String),
    NotFound(&'static str, Ulid),
    AlreadyExists(&'static str, String),
    LimitExceeded(&'static str),
    /// A collaborator the decision depends on (laboratory lookup, log) failed.
    DependencyUnavailable(String),
}

impl EngineError {
    /// Short stable label, used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidRange { .. } => "invalid_range",
            EngineError::TimeConflict { .. } => "time_conflict",
            EngineError::OutsideOperatingHours { .. } => "outside_operating_hours",
            EngineError::CapacityExceeded(_) => "capacity_exceeded",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::NotEditable(_) => "not_editable",
            EngineError::RoleElevationDenied => "role_elevation_denied",
            EngineError::PermissionDenied(_) => "permission_denied",
            EngineError::LaboratoryUnavailable { .. } => "laboratory_unavailable",
            EngineError::HasActiveBookings(_) => "has_active_bookings",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::NotFound(..) => "not_found",
            EngineError::AlreadyExists(..) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::DependencyUnavailable(_) => "dependency_unavailable",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange { start, end } => {
                write!(f, "start time {start} must be before end time {end}")
            }
            EngineError::TimeConflict {
                booking_id,
                laboratory,
            } => write!(
                f,
                "time slot conflicts with booking {booking_id} in laboratory {laboratory}"
            ),
            EngineError::OutsideOperatingHours { open, close } => {
                write!(f, "booking must fall within operating hours {open}-{close}")
            }
            EngineError::CapacityExceeded(max) => {
                write!(f, "attendees exceed laboratory capacity of {max}")
            }
            EngineError::InvalidTransition { from, transition } => {
                write!(f, "cannot {transition} a booking that is {from}")
            }
            EngineError::NotEditable(status) => {
                write!(f, "only pending bookings can be modified (booking is {status})")
            }
            EngineError::RoleElevationDenied => {
                write!(f, "only administrators may assign roles or permissions")
            }
            EngineError::PermissionDenied(what) => write!(f, "permission denied: {what}"),
            EngineError::LaboratoryUnavailable { laboratory, status } => {
                write!(f, "laboratory {laboratory} is not open for booking ({status})")
            }
            EngineError::HasActiveBookings(id) => {
                write!(f, "cannot delete laboratory {id}: it has pending or approved bookings")
            }
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::NotFound(what, id) => write!(f, "{what} not found: {id}"),
            EngineError::AlreadyExists(what, key) => write!(f, "{what} already exists: {key}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::DependencyUnavailable(msg) => write!(f, "dependency unavailable: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<RequiredField> for EngineError {
    fn from(e: RequiredField) -> Self {
        EngineError::InvalidInput(format!("{} cannot be cleared", e.0))
    }
}

impl From<ValueError> for EngineError {
    fn from(e: ValueError) -> Self {
        EngineError::InvalidInput(e.to_string())
    }
}

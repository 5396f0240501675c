use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for audit timestamps only.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

// ── Parse errors ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueError {
    pub kind: &'static str,
    pub value: String,
}

impl ValueError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for ValueError {}

pub fn parse_date(s: &str) -> Result<NaiveDate, ValueError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| ValueError::new("date", s))
}

// ── Time of day ──────────────────────────────────────────────────

/// Local wall-clock time, minutes since midnight.
///
/// Only zero-padded 24-hour `HH:MM` text parses, so ordering matches
/// lexicographic ordering of the text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self(hour * 60 + minute))
    }

    pub fn minutes(self) -> u16 {
        self.0
    }
}

impl FromStr for TimeOfDay {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let b = s.as_bytes();
        if b.len() != 5 || b[2] != b':' {
            return Err(ValueError::new("time", s));
        }
        let digit = |c: u8| c.is_ascii_digit().then(|| u16::from(c - b'0'));
        match (digit(b[0]), digit(b[1]), digit(b[3]), digit(b[4])) {
            (Some(h1), Some(h2), Some(m1), Some(m2)) => {
                Self::from_hm(h1 * 10 + h2, m1 * 10 + m2).ok_or_else(|| ValueError::new("time", s))
            }
            _ => Err(ValueError::new("time", s)),
        }
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// Half-open interval `[start, end)` within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl TimeRange {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn duration_minutes(&self) -> u16 {
        self.end.minutes() - self.start.minutes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingHours {
    pub open: TimeOfDay,
    pub close: TimeOfDay,
}

impl Default for OperatingHours {
    fn default() -> Self {
        Self {
            open: TimeOfDay(8 * 60),
            close: TimeOfDay(17 * 60),
        }
    }
}

impl OperatingHours {
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.open, self.close)
    }
}

// ── Enumerations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Approved => "approved",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// Pending and approved bookings occupy their slot; the rest never conflict.
    pub fn holds_slot(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Approved)
    }
}

impl FromStr for BookingStatus {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "approved" => Ok(BookingStatus::Approved),
            "rejected" => Ok(BookingStatus::Rejected),
            "cancelled" => Ok(BookingStatus::Cancelled),
            _ => Err(ValueError::new("booking status", s)),
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LabStatus {
    Available,
    Maintenance,
    Closed,
}

impl LabStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LabStatus::Available => "available",
            LabStatus::Maintenance => "maintenance",
            LabStatus::Closed => "closed",
        }
    }
}

impl FromStr for LabStatus {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "available" => Ok(LabStatus::Available),
            "maintenance" => Ok(LabStatus::Maintenance),
            "closed" => Ok(LabStatus::Closed),
            _ => Err(ValueError::new("laboratory status", s)),
        }
    }
}

impl fmt::Display for LabStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Teacher,
    Student,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }
}

impl FromStr for Role {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "teacher" => Ok(Role::Teacher),
            "student" => Ok(Role::Student),
            _ => Err(ValueError::new("role", s)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Entities ─────────────────────────────────────────────────────

/// Capability flags carried by a user account. Derived from the role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionSet {
    pub can_manage_users: bool,
    pub can_manage_labs: bool,
    pub can_view_all_bookings: bool,
    pub can_approve_bookings: bool,
    pub can_generate_reports: bool,
    pub can_create_bookings: bool,
    pub can_view_own_bookings: bool,
    pub can_view_calendar: bool,
    pub can_view_public_calendar: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Laboratory {
    pub id: Ulid,
    pub name: String,
    /// Uppercase, unique across all laboratories.
    pub code: String,
    pub capacity: u32,
    pub operating_hours: OperatingHours,
    pub status: LabStatus,
    pub location: Option<String>,
    pub description: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub permissions: PermissionSet,
    pub is_active: bool,
    /// Salted digest of the account's login secret, never the secret itself.
    pub password_hash: String,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub laboratory_id: Ulid,
    pub user_id: Ulid,
    pub date: NaiveDate,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub status: BookingStatus,
    pub attendees: u32,
    pub purpose: String,
    pub notes: Option<String>,
    pub processed_by: Option<Ulid>,
    pub processed_at: Option<Ms>,
    pub rejection_reason: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end)
    }
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLaboratory {
    pub id: Option<Ulid>,
    pub name: String,
    pub code: String,
    pub capacity: u32,
    pub operating_hours: Option<OperatingHours>,
    pub status: Option<LabStatus>,
    pub location: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub id: Option<Ulid>,
    pub username: String,
    pub email: String,
    pub role: Option<Role>,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Option<Ulid>,
    pub laboratory_id: Ulid,
    /// Owner; defaults to the acting user.
    pub user_id: Option<Ulid>,
    pub date: NaiveDate,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub attendees: u32,
    pub purpose: String,
    pub notes: Option<String>,
}

/// A single field of a partial update.
///
/// `Keep` leaves the field alone, `Clear` removes its value (or resets it to its
/// default), `Set` replaces it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Patch<T> {
    #[default]
    Keep,
    Clear,
    Set(T),
}

/// A required field was cleared by a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequiredField(pub &'static str);

impl<T> Patch<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Patch::Keep)
    }

    pub fn apply_to(self, slot: &mut Option<T>) {
        match self {
            Patch::Keep => {}
            Patch::Clear => *slot = None,
            Patch::Set(v) => *slot = Some(v),
        }
    }

    /// Merge into a field that must always hold a value.
    pub fn merge(self, current: T, field: &'static str) -> Result<T, RequiredField> {
        match self {
            Patch::Keep => Ok(current),
            Patch::Clear => Err(RequiredField(field)),
            Patch::Set(v) => Ok(v),
        }
    }

    /// Merge into a field whose cleared state is `default`.
    pub fn merge_or(self, current: T, default: T) -> T {
        match self {
            Patch::Keep => current,
            Patch::Clear => default,
            Patch::Set(v) => v,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaboratoryPatch {
    pub name: Patch<String>,
    pub code: Patch<String>,
    pub capacity: Patch<u32>,
    pub open: Patch<TimeOfDay>,
    pub close: Patch<TimeOfDay>,
    pub status: Patch<LabStatus>,
    pub location: Patch<String>,
    pub description: Patch<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserPatch {
    pub username: Patch<String>,
    pub email: Patch<String>,
    pub role: Patch<Role>,
    pub is_active: Patch<bool>,
    pub password: Patch<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub date: Patch<NaiveDate>,
    pub start: Patch<TimeOfDay>,
    pub end: Patch<TimeOfDay>,
    pub attendees: Patch<u32>,
    pub purpose: Patch<String>,
    pub notes: Patch<String>,
}

/// Filter for booking listings; `None` matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub laboratory_id: Option<Ulid>,
    pub user_id: Option<Ulid>,
    pub date: Option<NaiveDate>,
    pub status: Option<BookingStatus>,
}

impl BookingFilter {
    pub fn matches(&self, b: &Booking) -> bool {
        self.laboratory_id.is_none_or(|id| b.laboratory_id == id)
            && self.user_id.is_none_or(|id| b.user_id == id)
            && self.date.is_none_or(|d| b.date == d)
            && self.status.is_none_or(|s| b.status == s)
    }
}

/// An occupied slot on a laboratory's calendar. `owner` and `purpose` are
/// only filled in for callers allowed to see who booked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarSlot {
    pub booking_id: Ulid,
    pub date: NaiveDate,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub status: BookingStatus,
    pub owner: Option<Ulid>,
    pub purpose: Option<String>,
}

// ── Per-laboratory state ─────────────────────────────────────────

/// A laboratory plus its bookings, indexed by date then start time.
#[derive(Debug, Clone)]
pub struct LabState {
    pub lab: Laboratory,
    pub bookings: BTreeMap<NaiveDate, Vec<Booking>>,
    /// Set once the laboratory is deleted; holders of a stale handle must bail out.
    pub deleted: bool,
}

impl LabState {
    pub fn new(lab: Laboratory) -> Self {
        Self {
            lab,
            bookings: BTreeMap::new(),
            deleted: false,
        }
    }

    /// Insert booking keeping each day's list sorted by start time.
    pub fn insert_booking(&mut self, booking: Booking) {
        let day = self.bookings.entry(booking.date).or_default();
        let pos = day.partition_point(|b| b.start <= booking.start);
        day.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let (date, pos) = self
            .bookings
            .iter()
            .find_map(|(d, day)| day.iter().position(|b| b.id == id).map(|p| (*d, p)))?;
        let day = self.bookings.get_mut(&date)?;
        let removed = day.remove(pos);
        if day.is_empty() {
            self.bookings.remove(&date);
        }
        Some(removed)
    }

    /// Replace a booking, moving it if its date or start changed.
    pub fn replace_booking(&mut self, booking: Booking) {
        self.remove_booking(booking.id);
        self.insert_booking(booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.iter().find(|b| b.id == id)
    }

    pub fn on_date(&self, date: NaiveDate) -> &[Booking] {
        self.bookings.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.values().flatten()
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.values().map(Vec::len).sum()
    }

    pub fn has_live_bookings(&self) -> bool {
        self.iter().any(|b| b.status.holds_slot())
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// Snapshot-style events: each carries the full entity after the change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    LaboratoryCreated(Laboratory),
    LaboratoryUpdated(Laboratory),
    LaboratoryDeleted { id: Ulid },
    UserCreated(User),
    UserUpdated(User),
    UserDeleted { id: Ulid },
    BookingCreated(Booking),
    BookingUpdated(Booking),
    BookingDeleted { id: Ulid, laboratory_id: Ulid },
}

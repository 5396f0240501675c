pub const MAX_LABORATORIES: usize = 10_000;
pub const MAX_USERS: usize = 1_000_000;
pub const MAX_BOOKINGS_PER_LABORATORY: usize = 500_000;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_CODE_LEN: usize = 10;
pub const MAX_USERNAME_LEN: usize = 64;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_PURPOSE_LEN: usize = 500;
pub const MAX_NOTES_LEN: usize = 2_000;
pub const MIN_SECRET_LEN: usize = 8;
pub const MAX_SECRET_LEN: usize = 128;

/// Upper bound for a laboratory's capacity and a booking's attendee count.
pub const MAX_ATTENDEES: u32 = 10_000;

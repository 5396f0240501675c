//! Role → permission mapping and the request-scoping rules built on it.
//!
//! The role is the single source of truth for an account's permissions:
//! [`resolve_permissions`] runs every time a role is assigned. The explicit
//! override in the engine is the only other writer.

use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::{PermissionSet, Role, User};

pub fn resolve_permissions(role: Role) -> PermissionSet {
    match role {
        Role::Admin => PermissionSet {
            can_manage_users: true,
            can_manage_labs: true,
            can_view_all_bookings: true,
            can_approve_bookings: true,
            can_generate_reports: true,
            can_create_bookings: true,
            can_view_own_bookings: true,
            can_view_calendar: true,
            can_view_public_calendar: true,
        },
        Role::Teacher => PermissionSet {
            can_create_bookings: true,
            can_view_own_bookings: true,
            can_view_calendar: true,
            can_view_public_calendar: true,
            ..PermissionSet::default()
        },
        Role::Student => PermissionSet {
            can_view_public_calendar: true,
            ..PermissionSet::default()
        },
    }
}

/// Role granted to a newly registered account.
///
/// Only an authenticated admin may pick the role; every other caller,
/// including anonymous self-registration, gets `student`.
pub fn resolve_registration_role(actor: Option<&Actor>, requested: Role) -> Role {
    match actor {
        Some(a) if a.role == Role::Admin => requested,
        _ => Role::Student,
    }
}

/// The authenticated user a request runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub username: String,
    pub role: Role,
    pub permissions: PermissionSet,
}

impl Actor {
    pub fn from_user(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            role: user.role,
            permissions: user.permissions,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn can(&self, cap: Capability) -> bool {
        cap.allowed_by(&self.permissions)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    ManageUsers,
    ManageLabs,
    ViewAllBookings,
    ApproveBookings,
    GenerateReports,
    CreateBookings,
    ViewOwnBookings,
    ViewCalendar,
    ViewPublicCalendar,
}

impl Capability {
    pub fn allowed_by(self, p: &PermissionSet) -> bool {
        match self {
            Capability::ManageUsers => p.can_manage_users,
            Capability::ManageLabs => p.can_manage_labs,
            Capability::ViewAllBookings => p.can_view_all_bookings,
            Capability::ApproveBookings => p.can_approve_bookings,
            Capability::GenerateReports => p.can_generate_reports,
            Capability::CreateBookings => p.can_create_bookings,
            Capability::ViewOwnBookings => p.can_view_own_bookings,
            Capability::ViewCalendar => p.can_view_calendar,
            Capability::ViewPublicCalendar => p.can_view_public_calendar,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Capability::ManageUsers => "manage users",
            Capability::ManageLabs => "manage laboratories",
            Capability::ViewAllBookings => "view all bookings",
            Capability::ApproveBookings => "approve bookings",
            Capability::GenerateReports => "generate reports",
            Capability::CreateBookings => "create bookings",
            Capability::ViewOwnBookings => "view own bookings",
            Capability::ViewCalendar => "view calendar",
            Capability::ViewPublicCalendar => "view public calendar",
        }
    }
}

/// What an unauthenticated connection may do.
pub fn anonymous_permissions() -> PermissionSet {
    PermissionSet {
        can_view_public_calendar: true,
        ..PermissionSet::default()
    }
}

pub fn authenticated(actor: Option<&Actor>) -> Result<&Actor, EngineError> {
    actor.ok_or(EngineError::PermissionDenied("authentication required"))
}

pub fn require(actor: &Actor, cap: Capability) -> Result<(), EngineError> {
    if actor.can(cap) {
        Ok(())
    } else {
        Err(EngineError::PermissionDenied(cap.label()))
    }
}

/// Like [`require`], but anonymous callers are checked against
/// [`anonymous_permissions`].
pub fn require_or_anonymous(actor: Option<&Actor>, cap: Capability) -> Result<(), EngineError> {
    match actor {
        Some(a) => require(a, cap),
        None if cap.allowed_by(&anonymous_permissions()) => Ok(()),
        None => Err(EngineError::PermissionDenied(cap.label())),
    }
}

/// The user a request acts for. User managers may name anyone; everyone else
/// is scoped to themselves.
pub fn resolve_subject(actor: &Actor, requested: Option<Ulid>) -> Result<Ulid, EngineError> {
    match requested {
        None => Ok(actor.id),
        Some(id) if id == actor.id => Ok(id),
        Some(id) if actor.can(Capability::ManageUsers) => Ok(id),
        Some(_) => Err(EngineError::PermissionDenied("acting on behalf of another user")),
    }
}

/// Role assignment and permission overrides are reserved to admins.
pub fn ensure_can_assign_roles(actor: &Actor) -> Result<(), EngineError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(EngineError::RoleElevationDenied)
    }
}

use tracing::info;
use ulid::Ulid;

use crate::credential::{check_secret, hash_secret, verify_secret};
use crate::limits::*;
use crate::model::*;
use crate::permissions::{
    ensure_can_assign_roles, resolve_permissions, resolve_registration_role, Actor, Capability,
};

use super::{Engine, EngineError};

fn normalize_username(username: &str) -> Result<String, EngineError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(EngineError::InvalidInput("username is required".into()));
    }
    if username.len() > MAX_USERNAME_LEN {
        return Err(EngineError::LimitExceeded("username"));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(EngineError::InvalidInput(format!("invalid username: {username}")));
    }
    Ok(username.to_string())
}

/// Emails compare case-insensitively, so they are stored lowercase.
fn normalize_email(email: &str) -> Result<String, EngineError> {
    let email = email.trim().to_lowercase();
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') && !domain.contains('@') => {
            Ok(email)
        }
        _ => Err(EngineError::InvalidInput(format!("invalid email: {email}"))),
    }
}

fn hash_new_secret(secret: &str) -> Result<String, EngineError> {
    check_secret(secret).map_err(EngineError::InvalidInput)?;
    Ok(hash_secret(secret))
}

impl Engine {
    pub fn user(&self, id: Ulid) -> Option<User> {
        self.users.get(&id).map(|u| u.value().clone())
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Whether `username` names an account, active or not.
    pub fn is_registered(&self, username: &str) -> bool {
        self.usernames.contains_key(&username.to_lowercase())
    }

    /// The actor for an active account. Inactive and unknown names get `None`.
    pub fn actor_for(&self, username: &str) -> Option<Actor> {
        let id = *self.usernames.get(&username.to_lowercase())?.value();
        self.actor(id)
    }

    /// Current permissions of an authenticated account, or `None` once it
    /// has been deactivated or deleted.
    pub fn actor(&self, id: Ulid) -> Option<Actor> {
        let user = self.users.get(&id)?;
        user.is_active.then(|| Actor::from_user(&user))
    }

    /// Check a login secret against the account's stored digest.
    pub fn authenticate(&self, username: &str, secret: &str) -> Option<Actor> {
        let actor = self.actor_for(username)?;
        let user = self.users.get(&actor.id)?;
        verify_secret(secret, &user.password_hash).then_some(actor)
    }

    /// Create an account. The role is settled by [`resolve_registration_role`]
    /// and the permissions by [`resolve_permissions`]; the request never
    /// carries permissions of its own.
    pub async fn register_user(&self, actor: Option<&Actor>, req: NewUser) -> Result<User, EngineError> {
        let role = resolve_registration_role(actor, req.role.unwrap_or(Role::Student));
        let _accounts = self.accounts.lock().await;
        self.insert_user(req, role).await
    }

    /// Create the first admin account on an empty store. Returns `None` when
    /// any account already exists.
    pub async fn bootstrap_admin(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<Option<User>, EngineError> {
        let _accounts = self.accounts.lock().await;
        if !self.users.is_empty() {
            return Ok(None);
        }
        let req = NewUser {
            id: None,
            username: username.to_string(),
            email: email.to_string(),
            role: Some(Role::Admin),
            password: password.to_string(),
        };
        self.insert_user(req, Role::Admin).await.map(Some)
    }

    /// Caller holds the accounts lock.
    async fn insert_user(&self, req: NewUser, role: Role) -> Result<User, EngineError> {
        let username = normalize_username(&req.username)?;
        let email = normalize_email(&req.email)?;
        let password_hash = hash_new_secret(&req.password)?;
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        let id = req.id.unwrap_or_else(Ulid::new);
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists("user", id.to_string()));
        }
        if self.usernames.contains_key(&username.to_lowercase()) {
            return Err(EngineError::AlreadyExists("username", username));
        }
        if self.emails.contains_key(&email) {
            return Err(EngineError::AlreadyExists("email", email));
        }

        let now = now_ms();
        let user = User {
            id,
            username,
            email,
            role,
            permissions: resolve_permissions(role),
            is_active: true,
            password_hash,
            created_at: now,
            updated_at: now,
        };
        self.wal_append(&Event::UserCreated(user.clone())).await?;
        self.index_user(user.clone());
        info!("user {} ({}) registered as {}", user.username, user.id, user.role);
        Ok(user)
    }

    /// Users may edit their own username, email and password. Role and
    /// activation changes are admin only; a role change recomputes the
    /// permissions.
    pub async fn update_user(&self, actor: &Actor, id: Ulid, patch: UserPatch) -> Result<User, EngineError> {
        if actor.id != id && !actor.can(Capability::ManageUsers) {
            return Err(EngineError::PermissionDenied("update another user"));
        }
        if !patch.role.is_keep() || !patch.is_active.is_keep() {
            ensure_can_assign_roles(actor)?;
        }

        let _accounts = self.accounts.lock().await;
        let current = self.user(id).ok_or(EngineError::NotFound("user", id))?;
        let password_hash = match patch.password {
            Patch::Keep => current.password_hash.clone(),
            Patch::Clear => return Err(RequiredField("password").into()),
            Patch::Set(secret) => hash_new_secret(&secret)?,
        };
        let mut user = User {
            username: normalize_username(&patch.username.merge(current.username.clone(), "username")?)?,
            email: normalize_email(&patch.email.merge(current.email.clone(), "email")?)?,
            role: patch.role.merge(current.role, "role")?,
            is_active: patch.is_active.merge(current.is_active, "is_active")?,
            password_hash,
            ..current.clone()
        };
        if user == current {
            return Ok(user);
        }

        let taken = |index: &dashmap::DashMap<String, Ulid>, key: &str| {
            index.get(key).is_some_and(|owner| *owner.value() != id)
        };
        if taken(&self.usernames, &user.username.to_lowercase()) {
            return Err(EngineError::AlreadyExists("username", user.username));
        }
        if taken(&self.emails, &user.email) {
            return Err(EngineError::AlreadyExists("email", user.email));
        }
        let stays_admin = user.role == Role::Admin && user.is_active;
        if current.role == Role::Admin && current.is_active && !stays_admin && self.active_admins() <= 1 {
            return Err(EngineError::InvalidInput(
                "cannot demote or deactivate the last active admin".into(),
            ));
        }

        if user.role != current.role {
            user.permissions = resolve_permissions(user.role);
            info!("user {} role {} -> {} by {}", user.username, current.role, user.role, actor.username);
        }
        user.updated_at = now_ms();
        self.wal_append(&Event::UserUpdated(user.clone())).await?;
        self.index_user(user.clone());
        Ok(user)
    }

    /// Administrative escape hatch: replace a user's permissions outright.
    /// The next role change recomputes them from the role again.
    pub async fn override_permissions(
        &self,
        actor: &Actor,
        id: Ulid,
        permissions: PermissionSet,
    ) -> Result<User, EngineError> {
        ensure_can_assign_roles(actor)?;
        let _accounts = self.accounts.lock().await;
        let current = self.user(id).ok_or(EngineError::NotFound("user", id))?;
        if current.permissions == permissions {
            return Ok(current);
        }
        let user = User {
            permissions,
            updated_at: now_ms(),
            ..current
        };
        self.wal_append(&Event::UserUpdated(user.clone())).await?;
        self.index_user(user.clone());
        info!("permissions of {} overridden by {}", user.username, actor.username);
        Ok(user)
    }

    /// Remove an account. Its bookings stay, still referencing the id.
    pub async fn delete_user(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::PermissionDenied("delete users"));
        }
        if actor.id == id {
            return Err(EngineError::InvalidInput("cannot delete your own account".into()));
        }
        let _accounts = self.accounts.lock().await;
        let user = self.user(id).ok_or(EngineError::NotFound("user", id))?;
        self.wal_append(&Event::UserDeleted { id }).await?;
        self.unindex_user(id);
        info!("user {} ({id}) deleted by {}", user.username, actor.username);
        Ok(())
    }

    fn active_admins(&self) -> usize {
        self.users
            .iter()
            .filter(|u| u.role == Role::Admin && u.is_active)
            .count()
    }
}

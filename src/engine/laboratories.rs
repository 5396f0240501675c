use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::permissions::{require, Actor, Capability};

use super::{Engine, EngineError};

/// Trim and bound a required text field.
pub(super) fn required_text(value: &str, max: usize, field: &'static str) -> Result<String, EngineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidInput(format!("{field} is required")));
    }
    if trimmed.len() > max {
        return Err(EngineError::LimitExceeded(field));
    }
    Ok(trimmed.to_string())
}

/// Trim and bound an optional text field; blank collapses to `None`.
pub(super) fn optional_text(
    value: Option<String>,
    max: usize,
    field: &'static str,
) -> Result<Option<String>, EngineError> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(field)),
        Some(v) => Ok(Some(v.to_string())),
    }
}

/// Laboratory codes are stored uppercase: 1..=10 of `[A-Z0-9_-]`.
fn normalize_code(code: &str) -> Result<String, EngineError> {
    let code = code.trim().to_ascii_uppercase();
    if code.is_empty() || code.len() > MAX_CODE_LEN {
        return Err(EngineError::InvalidInput(format!(
            "laboratory code must be 1-{MAX_CODE_LEN} characters"
        )));
    }
    if !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(EngineError::InvalidInput(format!("invalid laboratory code: {code}")));
    }
    Ok(code)
}

fn check_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::InvalidInput("capacity must be at least 1".into()));
    }
    if capacity > MAX_ATTENDEES {
        return Err(EngineError::LimitExceeded("laboratory capacity"));
    }
    Ok(())
}

fn check_hours(hours: &OperatingHours) -> Result<(), EngineError> {
    if hours.open >= hours.close {
        return Err(EngineError::InvalidInput(format!(
            "opening time {} must be before closing time {}",
            hours.open, hours.close
        )));
    }
    Ok(())
}

impl Engine {
    pub async fn create_laboratory(
        &self,
        actor: &Actor,
        req: NewLaboratory,
    ) -> Result<Laboratory, EngineError> {
        require(actor, Capability::ManageLabs)?;
        let name = required_text(&req.name, MAX_NAME_LEN, "laboratory name")?;
        let code = normalize_code(&req.code)?;
        check_capacity(req.capacity)?;
        let operating_hours = req.operating_hours.unwrap_or_default();
        check_hours(&operating_hours)?;
        let location = optional_text(req.location, MAX_NAME_LEN, "location")?;
        let description = optional_text(req.description, MAX_NOTES_LEN, "description")?;

        let _catalog = self.catalog.lock().await;
        if self.labs.len() >= MAX_LABORATORIES {
            return Err(EngineError::LimitExceeded("too many laboratories"));
        }
        let id = req.id.unwrap_or_else(Ulid::new);
        if self.labs.contains_key(&id) {
            return Err(EngineError::AlreadyExists("laboratory", id.to_string()));
        }
        if self.lab_codes.contains_key(&code) {
            return Err(EngineError::AlreadyExists("laboratory code", code));
        }

        let now = now_ms();
        let lab = Laboratory {
            id,
            name,
            code,
            capacity: req.capacity,
            operating_hours,
            status: req.status.unwrap_or(LabStatus::Available),
            location,
            description,
            created_at: now,
            updated_at: now,
        };
        self.wal_append(&Event::LaboratoryCreated(lab.clone())).await?;
        self.index_laboratory(lab.clone());
        info!("laboratory {} ({}) created by {}", lab.code, lab.id, actor.username);
        Ok(lab)
    }

    pub async fn update_laboratory(
        &self,
        actor: &Actor,
        id: Ulid,
        patch: LaboratoryPatch,
    ) -> Result<Laboratory, EngineError> {
        require(actor, Capability::ManageLabs)?;
        let _catalog = self.catalog.lock().await;
        let mut guard = self.lab_write(id).await?;
        let current = guard.lab.clone();

        let defaults = OperatingHours::default();
        let operating_hours = OperatingHours {
            open: patch.open.merge_or(current.operating_hours.open, defaults.open),
            close: patch.close.merge_or(current.operating_hours.close, defaults.close),
        };
        check_hours(&operating_hours)?;
        let capacity = patch.capacity.merge(current.capacity, "capacity")?;
        check_capacity(capacity)?;

        let mut location = current.location.clone();
        patch.location.apply_to(&mut location);
        let mut description = current.description.clone();
        patch.description.apply_to(&mut description);

        let lab = Laboratory {
            name: required_text(&patch.name.merge(current.name.clone(), "name")?, MAX_NAME_LEN, "laboratory name")?,
            code: normalize_code(&patch.code.merge(current.code.clone(), "code")?)?,
            capacity,
            operating_hours,
            status: patch.status.merge(current.status, "status")?,
            location: optional_text(location, MAX_NAME_LEN, "location")?,
            description: optional_text(description, MAX_NOTES_LEN, "description")?,
            ..current.clone()
        };
        if lab == current {
            return Ok(lab);
        }
        if lab.code != current.code && self.lab_codes.contains_key(&lab.code) {
            return Err(EngineError::AlreadyExists("laboratory code", lab.code));
        }

        let lab = Laboratory {
            updated_at: now_ms(),
            ..lab
        };
        self.persist_and_apply(&mut guard, &Event::LaboratoryUpdated(lab.clone()))
            .await?;
        if lab.code != current.code {
            self.lab_codes.remove(&current.code);
            self.lab_codes.insert(lab.code.clone(), lab.id);
        }
        if lab.status != current.status {
            info!("laboratory {} status {} -> {}", lab.code, current.status, lab.status);
        }
        Ok(lab)
    }

    /// Delete a laboratory. Refused while any pending or approved booking
    /// references it; rejected and cancelled bookings go with it.
    pub async fn delete_laboratory(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        require(actor, Capability::ManageLabs)?;
        let _catalog = self.catalog.lock().await;
        let mut guard = self.lab_write(id).await?;
        if guard.has_live_bookings() {
            return Err(EngineError::HasActiveBookings(id));
        }

        self.wal_append(&Event::LaboratoryDeleted { id }).await?;
        for b in guard.iter() {
            self.booking_to_lab.remove(&b.id);
        }
        self.lab_codes.remove(&guard.lab.code);
        guard.deleted = true;
        self.labs.remove(&id);
        info!("laboratory {} ({id}) deleted by {}", guard.lab.code, actor.username);
        Ok(())
    }
}

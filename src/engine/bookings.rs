use dashmap::mapref::entry::Entry;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::BOOKING_DECISIONS_TOTAL;
use crate::permissions::{require, resolve_subject, Actor, Capability};
use crate::validator::{validate, ProposedBooking, Transition};

use super::laboratories::{optional_text, required_text};
use super::{Engine, EngineError};

fn record_decision(operation: &'static str, result: &Result<Booking, EngineError>) {
    let outcome = match result {
        Ok(_) => "accepted",
        Err(e) => e.kind(),
    };
    metrics::counter!(BOOKING_DECISIONS_TOTAL, "operation" => operation, "outcome" => outcome)
        .increment(1);
}

fn check_attendees(attendees: u32) -> Result<(), EngineError> {
    if attendees == 0 {
        return Err(EngineError::InvalidInput("attendees must be at least 1".into()));
    }
    if attendees > MAX_ATTENDEES {
        return Err(EngineError::LimitExceeded("attendees"));
    }
    Ok(())
}

fn ensure_bookable(lab: &Laboratory) -> Result<(), EngineError> {
    if lab.status == LabStatus::Available {
        Ok(())
    } else {
        Err(EngineError::LaboratoryUnavailable {
            laboratory: lab.name.clone(),
            status: lab.status,
        })
    }
}

impl Engine {
    /// Admit a new booking as `pending`.
    ///
    /// The laboratory's write lock is held from the conflict check until the
    /// booking is durable, so overlapping requests for one laboratory are
    /// decided one at a time.
    pub async fn create_booking(&self, actor: &Actor, req: NewBooking) -> Result<Booking, EngineError> {
        let result = self.admit_booking(actor, req).await;
        record_decision("create", &result);
        result
    }

    async fn admit_booking(&self, actor: &Actor, req: NewBooking) -> Result<Booking, EngineError> {
        require(actor, Capability::CreateBookings)?;
        let owner = resolve_subject(actor, req.user_id)?;
        if owner != actor.id && !self.users.contains_key(&owner) {
            return Err(EngineError::NotFound("user", owner));
        }
        check_attendees(req.attendees)?;
        let purpose = required_text(&req.purpose, MAX_PURPOSE_LEN, "purpose")?;
        let notes = optional_text(req.notes.clone(), MAX_NOTES_LEN, "notes")?;

        let mut guard = self.lab_write_for_booking(req.laboratory_id).await?;
        ensure_bookable(&guard.lab)?;
        if guard.booking_count() >= MAX_BOOKINGS_PER_LABORATORY {
            return Err(EngineError::LimitExceeded("too many bookings for laboratory"));
        }
        // Booking ids are global; claim the id before anything else can
        // place a booking under it in another laboratory.
        let id = req.id.unwrap_or_else(Ulid::new);
        match self.booking_to_lab.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists("booking", id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(req.laboratory_id);
            }
        }
        let result = self.place_booking(&mut guard, id, owner, req, purpose, notes).await;
        if result.is_err() {
            self.booking_to_lab.remove(&id);
        }
        result
    }

    /// Caller holds the laboratory's write lock and has claimed `id`.
    async fn place_booking(
        &self,
        guard: &mut LabState,
        id: Ulid,
        owner: Ulid,
        req: NewBooking,
        purpose: String,
        notes: Option<String>,
    ) -> Result<Booking, EngineError> {
        let proposed = ProposedBooking {
            date: req.date,
            start: req.start,
            end: req.end,
            attendees: req.attendees,
        };
        validate(&proposed, guard.on_date(req.date), &guard.lab, None)?;

        let now = now_ms();
        let booking = Booking {
            id,
            laboratory_id: req.laboratory_id,
            user_id: owner,
            date: req.date,
            start: req.start,
            end: req.end,
            status: BookingStatus::Pending,
            attendees: req.attendees,
            purpose,
            notes,
            processed_by: None,
            processed_at: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.persist_and_apply(guard, &Event::BookingCreated(booking.clone()))
            .await?;
        debug!(
            "booking {} admitted in {} on {} {}-{}",
            booking.id, guard.lab.code, booking.date, booking.start, booking.end
        );
        Ok(booking)
    }

    /// Edit a pending booking. A changed slot is validated again, ignoring
    /// the booking's own current slot.
    pub async fn update_booking(
        &self,
        actor: &Actor,
        id: Ulid,
        patch: BookingPatch,
    ) -> Result<Booking, EngineError> {
        let result = self.revise_booking(actor, id, patch).await;
        record_decision("update", &result);
        result
    }

    async fn revise_booking(&self, actor: &Actor, id: Ulid, patch: BookingPatch) -> Result<Booking, EngineError> {
        let (mut guard, current) = self.booking_write(id).await?;
        if current.user_id != actor.id && !actor.is_admin() {
            return Err(EngineError::PermissionDenied("modify another user's booking"));
        }
        current.status.ensure_editable()?;

        let mut notes = current.notes.clone();
        patch.notes.apply_to(&mut notes);
        let booking = Booking {
            date: patch.date.merge(current.date, "date")?,
            start: patch.start.merge(current.start, "start_time")?,
            end: patch.end.merge(current.end, "end_time")?,
            attendees: patch.attendees.merge(current.attendees, "attendees")?,
            purpose: required_text(&patch.purpose.merge(current.purpose.clone(), "purpose")?, MAX_PURPOSE_LEN, "purpose")?,
            notes: optional_text(notes, MAX_NOTES_LEN, "notes")?,
            ..current.clone()
        };
        if booking == current {
            return Ok(booking);
        }
        check_attendees(booking.attendees)?;

        let proposed = ProposedBooking::from(&booking);
        if proposed != ProposedBooking::from(&current) {
            ensure_bookable(&guard.lab)?;
            validate(&proposed, guard.on_date(booking.date), &guard.lab, Some(id))?;
        }

        let booking = Booking {
            updated_at: now_ms(),
            ..booking
        };
        self.persist_and_apply(&mut guard, &Event::BookingUpdated(booking.clone()))
            .await?;
        Ok(booking)
    }

    /// Owners may delete their own pending bookings; admins may delete any.
    pub async fn delete_booking(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        let (mut guard, current) = self.booking_write(id).await?;
        if !actor.is_admin() {
            if current.user_id != actor.id {
                return Err(EngineError::PermissionDenied("delete another user's booking"));
            }
            current.status.ensure_editable()?;
        }
        let event = Event::BookingDeleted {
            id,
            laboratory_id: current.laboratory_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("booking {id} ({}) deleted by {}", current.status, actor.username);
        Ok(())
    }

    pub async fn approve_booking(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(actor, id, Transition::Approve, None).await
    }

    pub async fn reject_booking(
        &self,
        actor: &Actor,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        self.transition_booking(actor, id, Transition::Reject, reason).await
    }

    /// Owners and approvers may cancel a pending or approved booking.
    pub async fn cancel_booking(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(actor, id, Transition::Cancel, None).await
    }

    /// No status leads back to `pending`; once the caller may touch the
    /// booking this fails with `InvalidTransition`.
    pub async fn reopen_booking(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(actor, id, Transition::Reopen, None).await
    }

    async fn transition_booking(
        &self,
        actor: &Actor,
        id: Ulid,
        transition: Transition,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        match transition {
            Transition::Approve | Transition::Reject => require(actor, Capability::ApproveBookings)?,
            Transition::Cancel | Transition::Reopen => {}
        }
        let (mut guard, current) = self.booking_write(id).await?;
        if matches!(transition, Transition::Cancel | Transition::Reopen)
            && current.user_id != actor.id
            && !actor.can(Capability::ApproveBookings)
        {
            return Err(EngineError::PermissionDenied("change another user's booking"));
        }
        let status = current.status.apply(transition)?;

        let now = now_ms();
        let mut booking = Booking {
            status,
            updated_at: now,
            ..current
        };
        if transition != Transition::Cancel {
            booking.processed_by = Some(actor.id);
            booking.processed_at = Some(now);
        }
        if transition == Transition::Reject {
            booking.rejection_reason = optional_text(reason, MAX_NOTES_LEN, "rejection reason")?;
        }
        self.persist_and_apply(&mut guard, &Event::BookingUpdated(booking.clone()))
            .await?;
        info!("booking {id} {status} by {}", actor.username);
        Ok(booking)
    }
}

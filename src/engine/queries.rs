use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::permissions::{authenticated, require, require_or_anonymous, Actor, Capability};

use super::availability::free_windows;
use super::{Engine, EngineError, SharedLabState};

impl Engine {
    async fn lab_snapshot(&self, id: Ulid) -> Result<SharedLabState, EngineError> {
        let ls = self
            .get_lab_state(&id)
            .ok_or(EngineError::NotFound("laboratory", id))?;
        if ls.read().await.deleted {
            return Err(EngineError::NotFound("laboratory", id));
        }
        Ok(ls)
    }

    /// Bookings of one laboratory on one day whose status is in `statuses`,
    /// ordered by start time, optionally skipping one booking.
    pub async fn find_bookings(
        &self,
        laboratory_id: Ulid,
        date: NaiveDate,
        statuses: &[BookingStatus],
        exclude: Option<Ulid>,
    ) -> Result<Vec<Booking>, EngineError> {
        let ls = self.lab_snapshot(laboratory_id).await?;
        let guard = ls.read().await;
        Ok(guard
            .on_date(date)
            .iter()
            .filter(|b| statuses.contains(&b.status) && Some(b.id) != exclude)
            .cloned()
            .collect())
    }

    pub async fn get_booking(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        let lab_id = self
            .laboratory_for_booking(&id)
            .ok_or(EngineError::NotFound("booking", id))?;
        let ls = self.lab_snapshot(lab_id).await?;
        let booking = ls
            .read()
            .await
            .booking(id)
            .cloned()
            .ok_or(EngineError::NotFound("booking", id))?;
        if booking.user_id != actor.id && !actor.can(Capability::ViewAllBookings) {
            return Err(EngineError::PermissionDenied("view another user's booking"));
        }
        Ok(booking)
    }

    /// Bookings matching `filter`, by date then start time. Callers without
    /// `can_view_all_bookings` only ever see their own.
    pub async fn list_bookings(&self, actor: &Actor, filter: BookingFilter) -> Result<Vec<Booking>, EngineError> {
        let mut filter = filter;
        if !actor.can(Capability::ViewAllBookings) {
            require(actor, Capability::ViewOwnBookings)?;
            match filter.user_id {
                Some(id) if id != actor.id => {
                    return Err(EngineError::PermissionDenied("view another user's bookings"));
                }
                _ => filter.user_id = Some(actor.id),
            }
        }

        let states: Vec<SharedLabState> = match filter.laboratory_id {
            Some(id) => vec![self.lab_snapshot(id).await?],
            None => self.labs.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for ls in states {
            let guard = ls.read().await;
            if guard.deleted {
                continue;
            }
            match filter.date {
                Some(date) => out.extend(guard.on_date(date).iter().filter(|b| filter.matches(b)).cloned()),
                None => out.extend(guard.iter().filter(|b| filter.matches(b)).cloned()),
            }
        }
        out.sort_by(|a, b| (a.date, a.start, a.id).cmp(&(b.date, b.start, b.id)));
        Ok(out)
    }

    /// Occupied slots of a laboratory on a day. Pending slots are shown too,
    /// since they block new requests just like approved ones.
    pub async fn calendar(
        &self,
        actor: Option<&Actor>,
        laboratory_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<CalendarSlot>, EngineError> {
        require_or_anonymous(actor, Capability::ViewPublicCalendar)?;
        let detailed = actor.is_some_and(|a| a.can(Capability::ViewCalendar));
        let ls = self.lab_snapshot(laboratory_id).await?;
        let guard = ls.read().await;
        Ok(guard
            .on_date(date)
            .iter()
            .filter(|b| b.status.holds_slot())
            .map(|b| CalendarSlot {
                booking_id: b.id,
                date: b.date,
                start: b.start,
                end: b.end,
                status: b.status,
                owner: detailed.then_some(b.user_id),
                purpose: detailed.then(|| b.purpose.clone()),
            })
            .collect())
    }

    /// Free windows inside operating hours on `date`, at least `min_duration`
    /// minutes long. A laboratory that is not available has none.
    pub async fn availability(
        &self,
        actor: Option<&Actor>,
        laboratory_id: Ulid,
        date: NaiveDate,
        min_duration: Option<u16>,
    ) -> Result<Vec<TimeRange>, EngineError> {
        require_or_anonymous(actor, Capability::ViewPublicCalendar)?;
        let ls = self.lab_snapshot(laboratory_id).await?;
        let guard = ls.read().await;
        if guard.lab.status != LabStatus::Available {
            return Ok(Vec::new());
        }
        let busy: Vec<TimeRange> = guard
            .on_date(date)
            .iter()
            .filter(|b| b.status.holds_slot())
            .map(Booking::range)
            .collect();
        let min = min_duration.unwrap_or(0);
        Ok(free_windows(guard.lab.operating_hours.range(), &busy)
            .into_iter()
            .filter(|w| w.duration_minutes() >= min)
            .collect())
    }

    /// The laboratory catalog is public.
    pub async fn list_laboratories(&self) -> Vec<Laboratory> {
        let states: Vec<SharedLabState> = self.labs.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(states.len());
        for ls in states {
            let guard = ls.read().await;
            if !guard.deleted {
                out.push(guard.lab.clone());
            }
        }
        out.sort_by(|a, b| a.code.cmp(&b.code));
        out
    }

    pub async fn get_laboratory(&self, id: Ulid) -> Result<Laboratory, EngineError> {
        let ls = self.lab_snapshot(id).await?;
        let lab = ls.read().await.lab.clone();
        Ok(lab)
    }

    pub fn list_users(&self, actor: Option<&Actor>) -> Result<Vec<User>, EngineError> {
        require(authenticated(actor)?, Capability::ManageUsers)?;
        let mut out: Vec<User> = self.users.iter().map(|u| u.value().clone()).collect();
        out.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(out)
    }

    pub fn get_user(&self, actor: Option<&Actor>, id: Ulid) -> Result<User, EngineError> {
        let actor = authenticated(actor)?;
        if actor.id != id && !actor.can(Capability::ManageUsers) {
            return Err(EngineError::PermissionDenied("view another user"));
        }
        self.user(id).ok_or(EngineError::NotFound("user", id))
    }
}

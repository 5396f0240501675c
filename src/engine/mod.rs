mod availability;
mod bookings;
mod error;
mod laboratories;
mod queries;
#[cfg(test)]
mod tests;
mod users;

pub use availability::{free_windows, merge_overlapping};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedLabState = Arc<RwLock<LabState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("WAL flush of {} events failed: {e}", batch.len());
        }
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so the partial batch does not leak into the next one.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append outside a batch")));
        }
    }
}

/// In-memory booking store backed by the WAL.
///
/// Each laboratory sits behind its own `RwLock`; every check-then-write on its
/// bookings holds the write lock until the event is durable, so conflict
/// checks and inserts for one laboratory are serialized.
pub struct Engine {
    pub(super) labs: DashMap<Ulid, SharedLabState>,
    /// Uppercase laboratory code → laboratory id.
    pub(super) lab_codes: DashMap<String, Ulid>,
    pub(super) users: DashMap<Ulid, User>,
    /// Lowercased username → user id.
    pub(super) usernames: DashMap<String, Ulid>,
    /// Lowercased email → user id.
    pub(super) emails: DashMap<String, Ulid>,
    /// Reverse lookup: booking id → laboratory id.
    pub(super) booking_to_lab: DashMap<Ulid, Ulid>,
    /// Held for laboratory create/delete and code changes. Taken before any lab lock.
    pub(super) catalog: Mutex<()>,
    /// Held for every user account write.
    pub(super) accounts: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

/// Apply a booking or laboratory update to a locked laboratory.
fn apply_to_lab(ls: &mut LabState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::LaboratoryUpdated(lab) => ls.lab = lab.clone(),
        Event::BookingCreated(b) => {
            booking_index.insert(b.id, b.laboratory_id);
            ls.insert_booking(b.clone());
        }
        Event::BookingUpdated(b) => ls.replace_booking(b.clone()),
        Event::BookingDeleted { id, .. } => {
            ls.remove_booking(*id);
            booking_index.remove(id);
        }
        // Handled at the map level.
        Event::LaboratoryCreated(_)
        | Event::LaboratoryDeleted { .. }
        | Event::UserCreated(_)
        | Event::UserUpdated(_)
        | Event::UserDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            labs: DashMap::new(),
            lab_codes: DashMap::new(),
            users: DashMap::new(),
            usernames: DashMap::new(),
            emails: DashMap::new(),
            booking_to_lab: DashMap::new(),
            catalog: Mutex::new(()),
            accounts: Mutex::new(()),
            wal_tx,
        };

        // We are the only owner of these locks during replay, so try_write never
        // contends. blocking_write would panic inside an async context.
        for event in &events {
            match event {
                Event::LaboratoryCreated(lab) => engine.index_laboratory(lab.clone()),
                Event::LaboratoryDeleted { id } => engine.unindex_laboratory(*id),
                Event::UserCreated(user) | Event::UserUpdated(user) => engine.index_user(user.clone()),
                Event::UserDeleted { id } => engine.unindex_user(*id),
                Event::LaboratoryUpdated(Laboratory { id, .. })
                | Event::BookingCreated(Booking { laboratory_id: id, .. })
                | Event::BookingUpdated(Booking { laboratory_id: id, .. })
                | Event::BookingDeleted { laboratory_id: id, .. } => {
                    let Some(ls) = engine.labs.get(id).map(|e| e.value().clone()) else {
                        tracing::warn!("replay: event for unknown laboratory {id} skipped");
                        continue;
                    };
                    let mut guard = ls
                        .try_write()
                        .map_err(|_| io::Error::other("replay: laboratory lock contended"))?;
                    if let Event::LaboratoryUpdated(lab) = event
                        && lab.code != guard.lab.code
                    {
                        engine.lab_codes.remove(&guard.lab.code);
                        engine.lab_codes.insert(lab.code.clone(), lab.id);
                    }
                    apply_to_lab(&mut guard, event, &engine.booking_to_lab);
                }
            }
        }

        tracing::info!(
            "replayed {} events: {} laboratories, {} users, {} bookings",
            events.len(),
            engine.labs.len(),
            engine.users.len(),
            engine.booking_to_lab.len()
        );
        Ok(engine)
    }

    /// Write event to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::DependencyUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::DependencyUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::DependencyUnavailable(format!("WAL write failed: {e}")))
    }

    /// WAL-append, then apply to the locked laboratory.
    pub(super) async fn persist_and_apply(
        &self,
        ls: &mut LabState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_lab(ls, event, &self.booking_to_lab);
        Ok(())
    }

    pub(super) fn index_laboratory(&self, lab: Laboratory) {
        self.lab_codes.insert(lab.code.clone(), lab.id);
        self.labs.insert(lab.id, Arc::new(RwLock::new(LabState::new(lab))));
    }

    /// Drop a laboratory and every index entry pointing into it.
    pub(super) fn unindex_laboratory(&self, id: Ulid) {
        let Some((_, ls)) = self.labs.remove(&id) else {
            return;
        };
        if let Ok(mut guard) = ls.try_write() {
            self.lab_codes.remove(&guard.lab.code);
            for b in guard.iter() {
                self.booking_to_lab.remove(&b.id);
            }
            guard.deleted = true;
        } else {
            self.lab_codes.retain(|_, lab_id| *lab_id != id);
            self.booking_to_lab.retain(|_, lab_id| *lab_id != id);
        }
    }

    pub(super) fn index_user(&self, user: User) {
        if let Some(old) = self.users.get(&user.id).map(|u| u.value().clone()) {
            self.usernames.remove(&old.username.to_lowercase());
            self.emails.remove(&old.email);
        }
        self.usernames.insert(user.username.to_lowercase(), user.id);
        self.emails.insert(user.email.clone(), user.id);
        self.users.insert(user.id, user);
    }

    pub(super) fn unindex_user(&self, id: Ulid) {
        if let Some((_, old)) = self.users.remove(&id) {
            self.usernames.remove(&old.username.to_lowercase());
            self.emails.remove(&old.email);
        }
    }

    pub fn get_lab_state(&self, id: &Ulid) -> Option<SharedLabState> {
        self.labs.get(id).map(|e| e.value().clone())
    }

    pub fn laboratory_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_lab.get(booking_id).map(|e| *e.value())
    }

    /// Write-lock a laboratory for a catalog change. Missing → `NotFound`.
    pub(super) async fn lab_write(&self, id: Ulid) -> Result<OwnedRwLockWriteGuard<LabState>, EngineError> {
        let ls = self
            .get_lab_state(&id)
            .ok_or(EngineError::NotFound("laboratory", id))?;
        let guard = ls.write_owned().await;
        if guard.deleted {
            return Err(EngineError::NotFound("laboratory", id));
        }
        Ok(guard)
    }

    /// Write-lock the laboratory a booking is being placed in.
    ///
    /// The laboratory is a dependency of the booking decision, so a failed
    /// lookup is `DependencyUnavailable` rather than a plain not-found.
    pub(super) async fn lab_write_for_booking(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<LabState>, EngineError> {
        self.lab_write(id).await.map_err(|_| {
            EngineError::DependencyUnavailable(format!("laboratory {id} not found"))
        })
    }

    /// Lookup booking → laboratory, acquire that laboratory's write lock.
    pub(super) async fn booking_write(
        &self,
        booking_id: Ulid,
    ) -> Result<(OwnedRwLockWriteGuard<LabState>, Booking), EngineError> {
        let lab_id = self
            .laboratory_for_booking(&booking_id)
            .ok_or(EngineError::NotFound("booking", booking_id))?;
        let guard = self.lab_write_for_booking(lab_id).await?;
        let booking = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound("booking", booking_id))?;
        Ok((guard, booking))
    }

    /// Number of WAL appends since the last compaction.
    pub async fn appends_since_compact(&self) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| EngineError::DependencyUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::DependencyUnavailable("WAL writer dropped response".into()))
    }

    /// Rewrite the WAL as the minimal event set that recreates the current state.
    ///
    /// Holds the catalog and account locks plus a read lock on every laboratory
    /// until the swap completes, so no append can land between snapshot and rename.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let _accounts = self.accounts.lock().await;

        let mut events: Vec<Event> = self
            .users
            .iter()
            .map(|u| Event::UserCreated(u.value().clone()))
            .collect();

        let states: Vec<SharedLabState> = self.labs.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(states.len());
        for ls in states {
            let guard = ls.read_owned().await;
            if guard.deleted {
                continue;
            }
            events.push(Event::LaboratoryCreated(guard.lab.clone()));
            events.extend(guard.iter().cloned().map(Event::BookingCreated));
            guards.push(guard);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::DependencyUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::DependencyUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::DependencyUnavailable(format!("WAL compaction failed: {e}")))?;
        drop(guards);
        Ok(())
    }
}

mod availability;
mod catalog;
mod conflict;
mod error;
mod queries;
mod reservations;
#[cfg(test)]
mod tests;

pub(crate) use conflict::now_ms;
pub use conflict::{check_bookable, check_containment, check_no_conflict, rejection_label};
pub use error::{EngineError, ErrorKind};

use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::otp::OtpStore;
use crate::wal::{Record, Wal};

pub type SharedVehicleState = Arc<RwLock<VehicleState>>;

// ── Group-commit journal writer ──────────────────────────────────

type Ack = oneshot::Sender<io::Result<()>>;

pub(super) enum WalCommand {
    Append { record: Record, response: Ack },
    Compact { records: Vec<Record>, response: Ack },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
}

/// Owns the journal. Appends that queue up while a flush is in progress are
/// committed together with one fsync; everyone in the batch gets the same result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (record, response) = match cmd {
            WalCommand::Append { record, response } => (record, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(record, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Record, Ack)>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let appended = batch
        .iter()
        .try_for_each(|(record, _)| wal.append_buffered(record));
    // Flush even after a failed append so the partial frame does not ride
    // along with the next batch.
    let flushed = wal.flush_sync();
    let result = appended.and(flushed);

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("journal flush failed for {} records: {e}", batch.len());
    }
    for (_, ack) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = ack.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result =
                Wal::write_snapshot(wal.path(), &records).and_then(|()| wal.install_snapshot());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { record, response } => commit_batch(wal, vec![(record, response)]),
    }
}

// ── Engine ───────────────────────────────────────────────────────

pub struct Engine {
    pub state: DashMap<Ulid, SharedVehicleState>,
    pub otp: OtpStore,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Window and reservation id → vehicle id.
    entity_to_vehicle: DashMap<Ulid, Ulid>,
    /// User id → reservations where the user is renter or owner.
    parties: DashMap<Ulid, Vec<Ulid>>,
    /// Held shared by every mutation from lock to apply, exclusively by compaction.
    journal_gate: Arc<RwLock<()>>,
    /// Serializes vehicle registration so the existence check and insert agree.
    registration: Mutex<()>,
}

/// Exclusive access to one vehicle aggregate, valid for journaling.
pub(super) struct VehicleWrite {
    _gate: OwnedRwLockReadGuard<()>,
    guard: OwnedRwLockWriteGuard<VehicleState>,
}

impl Deref for VehicleWrite {
    type Target = VehicleState;

    fn deref(&self) -> &VehicleState {
        &self.guard
    }
}

impl DerefMut for VehicleWrite {
    fn deref_mut(&mut self) -> &mut VehicleState {
        &mut self.guard
    }
}

/// A window or reservation id reserved in the entity index ahead of its
/// journal record. Released on drop unless the record was applied.
pub(super) struct EntityClaim<'a> {
    index: &'a DashMap<Ulid, Ulid>,
    id: Ulid,
    committed: bool,
}

impl EntityClaim<'_> {
    pub(super) fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for EntityClaim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.index.remove(&self.id);
        }
    }
}

/// Apply an event to its vehicle aggregate. The caller holds the write lock.
fn apply_event(
    vs: &mut VehicleState,
    event: &Event,
    entity_map: &DashMap<Ulid, Ulid>,
    parties: &DashMap<Ulid, Vec<Ulid>>,
) {
    match event {
        Event::VehicleRegistered { vehicle } | Event::VehicleUpdated { vehicle } => {
            vs.vehicle = vehicle.clone();
        }
        Event::WindowAdded { window } => {
            vs.insert_window(window.clone());
            entity_map.insert(window.id, window.vehicle_id);
        }
        Event::WindowUpdated { window } => {
            vs.remove_window(window.id);
            vs.insert_window(window.clone());
        }
        Event::WindowRemoved { id, .. } => {
            vs.remove_window(*id);
            entity_map.remove(id);
        }
        Event::ReservationCreated { reservation } => {
            entity_map.insert(reservation.id, reservation.vehicle_id);
            parties
                .entry(reservation.renter_id)
                .or_default()
                .push(reservation.id);
            if reservation.owner_id != reservation.renter_id {
                parties
                    .entry(reservation.owner_id)
                    .or_default()
                    .push(reservation.id);
            }
            vs.insert_reservation(reservation.clone());
        }
        Event::ReservationConfirmed { id, at, .. } => {
            if let Some(r) = vs.reservation_mut(*id) {
                r.status = ReservationStatus::Confirmed;
                r.updated_at = *at;
            }
        }
        Event::ReservationCancelled { id, at, .. } => {
            if let Some(r) = vs.reservation_mut(*id) {
                r.status = ReservationStatus::Cancelled;
                r.updated_at = *at;
            }
        }
        Event::ReservationDisputed { id, at, .. } => {
            if let Some(r) = vs.reservation_mut(*id) {
                r.status = ReservationStatus::Disputed;
                r.updated_at = *at;
            }
        }
        Event::PickedUp { id, handover, .. } => {
            if let Some(r) = vs.reservation_mut(*id) {
                r.status = ReservationStatus::Ongoing;
                r.updated_at = handover.at;
                r.pickup = Some(handover.clone());
            }
        }
        Event::Returned {
            id,
            handover,
            actual_distance_km,
            fuel_consumed_liters,
            fuel_cost_charged,
            final_price,
            ..
        } => {
            if let Some(r) = vs.reservation_mut(*id) {
                r.status = ReservationStatus::Completed;
                r.updated_at = handover.at;
                r.dropoff = Some(handover.clone());
                r.actual_distance_km = Some(*actual_distance_km);
                r.fuel_consumed_liters = Some(*fuel_consumed_liters);
                r.fuel_cost_charged = *fuel_cost_charged;
                r.final_price = Some(*final_price);
            }
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, otp: OtpStore) -> io::Result<Self> {
        let (wal, records) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            otp,
            wal_tx,
            entity_to_vehicle: DashMap::new(),
            parties: DashMap::new(),
            journal_gate: Arc::new(RwLock::new(())),
            registration: Mutex::new(()),
        };

        // Nothing else can see these locks yet, so try_write always succeeds.
        for Record { event, .. } in &records {
            if let Event::VehicleRegistered { vehicle } = event
                && !engine.state.contains_key(&vehicle.id)
            {
                let vs = VehicleState::new(vehicle.clone());
                engine.state.insert(vehicle.id, Arc::new(RwLock::new(vs)));
                continue;
            }
            let Some(vs) = engine.get_vehicle(&event.vehicle_id()) else {
                tracing::warn!("replay: event for unknown vehicle {}", event.vehicle_id());
                continue;
            };
            if let Ok(mut guard) = vs.try_write() {
                apply_event(&mut guard, event, &engine.entity_to_vehicle, &engine.parties);
            }
        }
        tracing::info!(
            vehicles = engine.state.len(),
            records = records.len(),
            "journal replayed"
        );

        Ok(engine)
    }

    /// Hand a record to the group-commit writer and wait until it is durable.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        let record = Record {
            at: now_ms(),
            event: event.clone(),
        };
        self.wal_tx
            .send(WalCommand::Append {
                record,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StorageFailure("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageFailure("journal writer dropped response".into()))?
            .map_err(|e| EngineError::StorageFailure(e.to_string()))
    }

    pub fn get_vehicle(&self, id: &Ulid) -> Option<SharedVehicleState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn vehicle_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_vehicle.get(entity_id).map(|e| *e.value())
    }

    /// Reserve a fresh entity id for `vehicle_id`. Ids are unique across all
    /// vehicles, so this goes through the shared index rather than the vehicle lock.
    pub(super) fn claim_entity(&self, id: Ulid, vehicle_id: Ulid) -> Result<EntityClaim<'_>, EngineError> {
        match self.entity_to_vehicle.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(vehicle_id);
                Ok(EntityClaim {
                    index: &self.entity_to_vehicle,
                    id,
                    committed: false,
                })
            }
        }
    }

    /// Lock a vehicle for a journaled mutation.
    pub(super) async fn write_vehicle(&self, vehicle_id: Ulid) -> Result<VehicleWrite, EngineError> {
        let gate = self.journal_gate.clone().read_owned().await;
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = vs.write_owned().await;
        Ok(VehicleWrite { _gate: gate, guard })
    }

    /// Lock the vehicle that owns a window or reservation.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: Ulid,
    ) -> Result<VehicleWrite, EngineError> {
        let vehicle_id = self
            .vehicle_for_entity(&entity_id)
            .ok_or(EngineError::NotFound(entity_id))?;
        self.write_vehicle(vehicle_id).await
    }

    /// Journal first, then apply. A failed append leaves memory untouched.
    pub(super) async fn persist_and_apply(
        &self,
        vs: &mut VehicleState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_event(vs, event, &self.entity_to_vehicle, &self.parties);
        Ok(())
    }

    /// Rewrite the journal as the minimal record set that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.journal_gate.write().await;
        let at = now_ms();
        let vehicles: Vec<SharedVehicleState> =
            self.state.iter().map(|e| e.value().clone()).collect();

        let mut records = Vec::new();
        for vs in vehicles {
            let guard = vs.read().await;
            records.push(Record {
                at,
                event: Event::VehicleRegistered {
                    vehicle: guard.vehicle.clone(),
                },
            });
            records.extend(guard.windows.iter().map(|w| Record {
                at,
                event: Event::WindowAdded { window: w.clone() },
            }));
            records.extend(guard.reservations.iter().map(|r| Record {
                at,
                event: Event::ReservationCreated {
                    reservation: r.clone(),
                },
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                records,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StorageFailure("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageFailure("journal writer dropped response".into()))?
            .map_err(|e| EngineError::StorageFailure(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

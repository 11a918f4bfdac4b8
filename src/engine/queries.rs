use ulid::Ulid;

use crate::model::*;

use super::conflict::{check_bookable, validate_span};
use super::{Engine, EngineError};

impl Engine {
    /// Would `caller` be allowed to book this vehicle for `[start, end]` right now?
    /// Takes no lock beyond a read, so the answer can be stale by the time a
    /// create request arrives; creation re-runs the same test under the write lock.
    pub async fn can_book(
        &self,
        caller: &Caller,
        vehicle_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<BookingCheck, EngineError> {
        let span = validate_span(start, end)?;
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = vs.read().await;
        Ok(BookingCheck {
            vehicle_id,
            span,
            verdict: check_bookable(&guard, &span, caller.user_id),
            rates: guard.vehicle.rates,
        })
    }

    async fn load_reservation(&self, id: Ulid) -> Option<Reservation> {
        let vehicle_id = self.vehicle_for_entity(&id)?;
        let vs = self.get_vehicle(&vehicle_id)?;
        let guard = vs.read().await;
        guard.reservation(id).cloned()
    }

    pub async fn get_reservation(&self, caller: &Caller, id: Ulid) -> Result<Reservation, EngineError> {
        let r = self
            .load_reservation(id)
            .await
            .ok_or(EngineError::NotFound(id))?;
        if !caller.is_admin() && !r.is_party(caller.user_id) {
            return Err(EngineError::Unauthorized("caller is not a party to this reservation"));
        }
        Ok(r)
    }

    /// Every reservation where `user_id` is renter or owner, newest first.
    async fn reservations_of(&self, user_id: Ulid) -> Vec<Reservation> {
        let ids = self
            .parties
            .get(&user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(r) = self.load_reservation(id).await {
                out.push(r);
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    pub async fn list_reservations(
        &self,
        caller: &Caller,
        filter: ReservationFilter,
    ) -> Result<Vec<Reservation>, EngineError> {
        let candidates = match filter.id {
            Some(id) => vec![self.get_reservation(caller, id).await?],
            None => self.reservations_of(caller.user_id).await,
        };
        Ok(candidates
            .into_iter()
            .filter(|r| match filter.role {
                Some(PartyRole::Owner) => r.owner_id == caller.user_id,
                Some(PartyRole::Renter) => r.renter_id == caller.user_id,
                None => true,
            })
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .collect())
    }

    /// The caller's trip in progress, as renter.
    pub async fn active_reservation(&self, caller: &Caller) -> Option<Reservation> {
        self.reservations_of(caller.user_id)
            .await
            .into_iter()
            .find(|r| r.renter_id == caller.user_id && r.status == ReservationStatus::Ongoing)
    }

    /// Finished rentals (completed or cancelled) where the caller was the renter.
    pub async fn reservation_history(&self, caller: &Caller) -> Vec<Reservation> {
        self.reservations_of(caller.user_id)
            .await
            .into_iter()
            .filter(|r| {
                r.renter_id == caller.user_id
                    && matches!(
                        r.status,
                        ReservationStatus::Completed | ReservationStatus::Cancelled
                    )
            })
            .collect()
    }
}

use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

fn validate_rates(rates: &Rates) -> Result<(), EngineError> {
    for (name, v) in [
        ("price_per_km", rates.price_per_km),
        ("price_per_hour", rates.price_per_hour),
        ("price_per_day", rates.price_per_day),
        ("base_price", rates.base_price),
    ] {
        if v < 0 {
            return Err(EngineError::invalid(format!("{name} must not be negative")));
        }
        if v > MAX_UNIT_PRICE {
            return Err(EngineError::LimitExceeded("price too large"));
        }
    }
    Ok(())
}

impl Engine {
    /// Accept a vehicle snapshot from the catalog.
    pub async fn register_vehicle(&self, caller: &Caller, vehicle: Vehicle) -> Result<(), EngineError> {
        if !caller.is_admin() && caller.user_id != vehicle.owner_id {
            return Err(EngineError::Unauthorized("only the owner may register a vehicle"));
        }
        validate_rates(&vehicle.rates)?;

        let _gate = self.journal_gate.read().await;
        let _serial = self.registration.lock().await;
        if self.state.len() >= MAX_VEHICLES {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }
        if self.state.contains_key(&vehicle.id) {
            return Err(EngineError::AlreadyExists(vehicle.id));
        }

        let event = Event::VehicleRegistered {
            vehicle: vehicle.clone(),
        };
        self.wal_append(&event).await?;
        let id = vehicle.id;
        self.state
            .insert(id, Arc::new(RwLock::new(VehicleState::new(vehicle))));
        tracing::info!(vehicle = %id, "vehicle registered");
        Ok(())
    }

    /// Patch prices, flags or owner. Existing reservations keep their snapshot.
    pub async fn update_vehicle(
        &self,
        caller: &Caller,
        id: Ulid,
        patch: VehiclePatch,
    ) -> Result<Vehicle, EngineError> {
        let mut vs = self.write_vehicle(id).await?;
        if !caller.is_admin() && caller.user_id != vs.vehicle.owner_id {
            return Err(EngineError::Unauthorized("only the owner may update a vehicle"));
        }
        if patch.is_empty() {
            return Err(EngineError::invalid("no fields to update"));
        }
        let mut vehicle = vs.vehicle.clone();
        patch.apply(&mut vehicle);
        validate_rates(&vehicle.rates)?;

        let event = Event::VehicleUpdated {
            vehicle: vehicle.clone(),
        };
        self.persist_and_apply(&mut vs, &event).await?;
        tracing::info!(vehicle = %id, "vehicle updated");
        Ok(vehicle)
    }

    pub async fn get_vehicle_snapshot(&self, id: Ulid) -> Result<Vehicle, EngineError> {
        let vs = self.get_vehicle(&id).ok_or(EngineError::NotFound(id))?;
        let guard = vs.read().await;
        Ok(guard.vehicle.clone())
    }
}

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_span};
use super::{Engine, EngineError};

fn require_owner(caller: &Caller, vehicle: &Vehicle) -> Result<(), EngineError> {
    if caller.is_admin() || caller.user_id == vehicle.owner_id {
        Ok(())
    } else {
        Err(EngineError::Unauthorized("only the vehicle owner may manage availability"))
    }
}

fn validate_recurrence(rec: &Recurrence) -> Result<(), EngineError> {
    if rec.days_of_week.is_empty() {
        return Err(EngineError::invalid("days_of_week must name at least one day"));
    }
    if rec.daily_start >= rec.daily_end {
        return Err(EngineError::invalid("daily_start must be before daily_end"));
    }
    Ok(())
}

/// Windows may not be reshaped or removed underneath a confirmed or ongoing
/// reservation.
fn ensure_untouched(vs: &VehicleState, span: &Span) -> Result<(), EngineError> {
    match vs.active_touching(span).next() {
        Some(r) => Err(EngineError::SchedulingConflict(r.id)),
        None => Ok(()),
    }
}

impl Engine {
    pub async fn add_window(
        &self,
        caller: &Caller,
        id: Ulid,
        vehicle_id: Ulid,
        available_from: Ms,
        available_to: Ms,
        recurrence: Option<Recurrence>,
    ) -> Result<AvailabilityWindow, EngineError> {
        let mut vs = self.write_vehicle(vehicle_id).await?;
        require_owner(caller, &vs.vehicle)?;

        let span = validate_span(available_from, available_to)?;
        if span.start < now_ms() {
            return Err(EngineError::invalid("available_from must not be in the past"));
        }
        if let Some(rec) = &recurrence {
            validate_recurrence(rec)?;
        }
        if vs.windows.len() >= MAX_WINDOWS_PER_VEHICLE {
            return Err(EngineError::LimitExceeded("too many availability windows on vehicle"));
        }
        ensure_untouched(&vs, &span)?;
        let claim = self.claim_entity(id, vehicle_id)?;

        let window = AvailabilityWindow {
            id,
            vehicle_id,
            span,
            status: WindowStatus::Available,
            recurrence,
        };
        let event = Event::WindowAdded {
            window: window.clone(),
        };
        self.persist_and_apply(&mut vs, &event).await?;
        claim.commit();
        tracing::info!(window = %id, vehicle = %vehicle_id, "availability window added");
        Ok(window)
    }

    pub async fn update_window(
        &self,
        caller: &Caller,
        id: Ulid,
        patch: WindowPatch,
    ) -> Result<AvailabilityWindow, EngineError> {
        let mut vs = self.resolve_entity_write(id).await?;
        let current = vs.window(id).cloned().ok_or(EngineError::NotFound(id))?;
        require_owner(caller, &vs.vehicle)?;

        if patch.is_empty() {
            return Err(EngineError::invalid("no fields to update"));
        }
        let now = now_ms();
        if patch.available_from.is_some_and(|t| t < now) {
            return Err(EngineError::invalid("available_from must not be in the past"));
        }
        if patch.available_to.is_some_and(|t| t < now) {
            return Err(EngineError::invalid("available_to must not be in the past"));
        }
        if let Some(status) = patch.status
            && !status.owner_settable()
        {
            return Err(EngineError::invalid(format!(
                "status must be available, blocked or maintenance, got {status}"
            )));
        }

        let span = validate_span(
            patch.available_from.unwrap_or(current.span.start),
            patch.available_to.unwrap_or(current.span.end),
        )?;
        if span != current.span {
            ensure_untouched(&vs, &span)?;
        }

        let window = AvailabilityWindow {
            span,
            status: patch.status.unwrap_or(current.status),
            ..current
        };
        let event = Event::WindowUpdated {
            window: window.clone(),
        };
        self.persist_and_apply(&mut vs, &event).await?;
        tracing::info!(window = %id, vehicle = %window.vehicle_id, status = %window.status, "availability window updated");
        Ok(window)
    }

    pub async fn remove_window(&self, caller: &Caller, id: Ulid) -> Result<(), EngineError> {
        let mut vs = self.resolve_entity_write(id).await?;
        let window = vs.window(id).cloned().ok_or(EngineError::NotFound(id))?;
        require_owner(caller, &vs.vehicle)?;
        ensure_untouched(&vs, &window.span)?;

        let event = Event::WindowRemoved {
            id,
            vehicle_id: window.vehicle_id,
        };
        self.persist_and_apply(&mut vs, &event).await?;
        tracing::info!(window = %id, vehicle = %window.vehicle_id, "availability window removed");
        Ok(())
    }

    /// Windows of one vehicle with the given status (default `available`) that
    /// have not ended yet, optionally restricted to those touching `[from, to]`.
    pub async fn list_windows(
        &self,
        vehicle_id: Ulid,
        status: Option<WindowStatus>,
        from: Option<Ms>,
        to: Option<Ms>,
    ) -> Result<Vec<AvailabilityWindow>, EngineError> {
        if let (Some(f), Some(t)) = (from, to) {
            if f > t {
                return Err(EngineError::invalid("available_from filter is after available_to filter"));
            }
            if t - f > MAX_QUERY_WINDOW_MS {
                return Err(EngineError::LimitExceeded("query window too wide"));
            }
        }
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = vs.read().await;

        let status = status.unwrap_or(WindowStatus::Available);
        let now = now_ms();
        Ok(guard
            .windows
            .iter()
            .filter(|w| w.status == status && w.span.end >= now)
            .filter(|w| from.is_none_or(|f| w.span.end >= f))
            .filter(|w| to.is_none_or(|t| w.span.start <= t))
            .cloned()
            .collect())
    }
}

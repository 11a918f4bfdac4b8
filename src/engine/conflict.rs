use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Shape-check a `[start, end]` pair and build the span.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::invalid("start must be before end"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("time range too wide"));
    }
    Ok(Span::new(start, end))
}

/// Containment test: some `available` window must cover the whole span.
pub fn check_containment(vs: &VehicleState, span: &Span) -> Result<(), Unbookable> {
    match vs.covering_windows(span, WindowStatus::Available).next() {
        Some(_) => Ok(()),
        None => Err(Unbookable::NoAvailabilityWindow),
    }
}

/// Conflict test: no confirmed or ongoing reservation may touch the span.
/// Endpoints are inclusive, so back-to-back reservations conflict.
pub fn check_no_conflict(vs: &VehicleState, span: &Span) -> Result<(), Unbookable> {
    match vs.active_touching(span).next() {
        Some(existing) => Err(Unbookable::Conflict(existing.id)),
        None => Ok(()),
    }
}

/// Full bookability decision for `renter` on this vehicle. Both tests must pass.
pub fn check_bookable(vs: &VehicleState, span: &Span, renter: Ulid) -> Result<(), Unbookable> {
    if !vs.vehicle.is_active {
        return Err(Unbookable::Unavailable("vehicle is not active"));
    }
    if !vs.vehicle.is_available {
        return Err(Unbookable::Unavailable("vehicle is not available"));
    }
    if vs.vehicle.owner_id == renter {
        return Err(Unbookable::Unavailable("cannot book your own vehicle"));
    }
    check_containment(vs, span)?;
    check_no_conflict(vs, span)
}

/// Stable name of a rejection, shared by metrics and `can_book` rows.
pub fn rejection_label(u: &Unbookable) -> &'static str {
    match u {
        Unbookable::Unavailable(_) => "unavailable",
        Unbookable::NoAvailabilityWindow => "no_availability_window",
        Unbookable::Conflict(_) => "scheduling_conflict",
    }
}

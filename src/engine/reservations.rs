use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::pricing;

use super::conflict::{check_bookable, check_no_conflict, now_ms, rejection_label, validate_span};
use super::{Engine, EngineError};

fn check_text(field: &'static str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::invalid(format!("{field} longer than {max} bytes")));
    }
    Ok(())
}

fn check_quantity(field: &'static str, value: f64, max: f64) -> Result<(), EngineError> {
    if !value.is_finite() || value < 0.0 {
        return Err(EngineError::invalid(format!("{field} must be a non-negative number")));
    }
    if value > max {
        return Err(EngineError::invalid(format!("{field} exceeds {max}")));
    }
    Ok(())
}

fn validate_report(report: &HandoverReport) -> Result<(), EngineError> {
    if report.odometer_km.is_some_and(|km| km < 0) {
        return Err(EngineError::invalid("odometer_km must not be negative"));
    }
    if report.fuel_level.is_some_and(|pct| pct > 100) {
        return Err(EngineError::invalid("fuel_level must be between 0 and 100"));
    }
    if let Some(text) = &report.condition_report {
        check_text("condition_report", text, MAX_REPORT_LEN)?;
    }
    if report.images.len() > MAX_HANDOVER_IMAGES {
        return Err(EngineError::LimitExceeded("too many handover images"));
    }
    for image in &report.images {
        check_text("image reference", image, MAX_IMAGE_REF_LEN)?;
    }
    Ok(())
}

fn require_party(caller: &Caller, r: &Reservation) -> Result<(), EngineError> {
    if r.is_party(caller.user_id) {
        Ok(())
    } else {
        Err(EngineError::Unauthorized("caller is not a party to this reservation"))
    }
}

fn next_status(r: &Reservation, transition: Transition) -> Result<ReservationStatus, EngineError> {
    r.status
        .next(transition)
        .ok_or(EngineError::InvalidStateTransition {
            from: r.status,
            transition,
        })
}

fn record_transition(r: &Reservation, to: ReservationStatus) {
    metrics::counter!(observability::RESERVATION_TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
    tracing::info!(
        reservation = %r.id,
        vehicle = %r.vehicle_id,
        from = %r.status,
        to = %to,
        "reservation transition"
    );
}

impl Engine {
    /// Book a vehicle. The bookability check and the insert happen under the
    /// vehicle's write lock, so concurrent requests cannot both pass.
    pub async fn create_reservation(
        &self,
        caller: &Caller,
        req: NewReservation,
    ) -> Result<Reservation, EngineError> {
        let mut vs = self.write_vehicle(req.vehicle_id).await?;

        let span = validate_span(req.start, req.end)?;
        let now = now_ms();
        if span.start < now {
            return Err(EngineError::invalid("cannot book in the past"));
        }
        let pickup_location = req.pickup_location.trim().to_string();
        if pickup_location.is_empty() {
            return Err(EngineError::invalid("pickup_location is required"));
        }
        check_text("pickup_location", &pickup_location, MAX_LOCATION_LEN)?;
        let return_location = match req.return_location.as_deref().map(str::trim) {
            Some(loc) if !loc.is_empty() => loc.to_string(),
            _ => pickup_location.clone(),
        };
        check_text("return_location", &return_location, MAX_LOCATION_LEN)?;
        if let Some(notes) = &req.notes {
            check_text("notes", notes, MAX_NOTES_LEN)?;
        }
        let estimated_distance_km = req.estimated_distance_km.unwrap_or(0.0);
        check_quantity("estimated_distance_km", estimated_distance_km, MAX_DISTANCE_KM)?;

        if vs.reservations.len() >= MAX_RESERVATIONS_PER_VEHICLE {
            return Err(EngineError::LimitExceeded("too many reservations on vehicle"));
        }
        let claim = self.claim_entity(req.id, req.vehicle_id)?;

        if let Err(refusal) = check_bookable(&vs, &span, caller.user_id) {
            metrics::counter!(observability::BOOKING_REJECTIONS_TOTAL, "reason" => rejection_label(&refusal))
                .increment(1);
            tracing::debug!(vehicle = %req.vehicle_id, renter = %caller.user_id, ?refusal, "booking refused");
            return Err(refusal.into());
        }

        let pricing_model = PricingModel::parse_or_default(req.pricing_model.as_deref());
        let rates = RateSnapshot::from(&vs.vehicle.rates);
        let duration_hours = span.billable_hours();
        let estimated_price = pricing::price(pricing_model, &rates, estimated_distance_km, duration_hours);

        let reservation = Reservation {
            id: req.id,
            vehicle_id: req.vehicle_id,
            renter_id: caller.user_id,
            owner_id: vs.vehicle.owner_id,
            span,
            duration_hours,
            pricing_model,
            rates,
            estimated_distance_km,
            estimated_price,
            final_price: None,
            security_deposit: vs.vehicle.rates.price_per_day,
            pickup_location,
            return_location,
            notes: req.notes,
            status: ReservationStatus::Pending,
            created_at: now,
            updated_at: now,
            pickup: None,
            dropoff: None,
            actual_distance_km: None,
            fuel_consumed_liters: None,
            fuel_cost_charged: 0,
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut vs, &event).await?;
        claim.commit();

        metrics::counter!(observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        tracing::info!(
            reservation = %reservation.id,
            vehicle = %reservation.vehicle_id,
            model = %pricing_model,
            estimated_price,
            "reservation created"
        );
        Ok(reservation)
    }

    /// Owner accepts a pending reservation. The conflict test is repeated here:
    /// pending reservations do not hold the vehicle, so two overlapping ones may
    /// exist and only the first confirmation wins.
    pub async fn confirm_reservation(&self, caller: &Caller, id: Ulid) -> Result<Reservation, EngineError> {
        let mut vs = self.resolve_entity_write(id).await?;
        let r = vs.reservation(id).cloned().ok_or(EngineError::NotFound(id))?;
        if caller.user_id != r.owner_id {
            return Err(EngineError::Unauthorized("only the vehicle owner may confirm"));
        }
        let to = next_status(&r, Transition::Confirm)?;
        if let Err(refusal) = check_no_conflict(&vs, &r.span) {
            metrics::counter!(observability::BOOKING_REJECTIONS_TOTAL, "reason" => rejection_label(&refusal))
                .increment(1);
            return Err(refusal.into());
        }

        let event = Event::ReservationConfirmed {
            id,
            vehicle_id: r.vehicle_id,
            at: now_ms(),
        };
        self.persist_and_apply(&mut vs, &event).await?;
        record_transition(&r, to);
        vs.reservation(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn cancel_reservation(&self, caller: &Caller, id: Ulid) -> Result<Reservation, EngineError> {
        let mut vs = self.resolve_entity_write(id).await?;
        let r = vs.reservation(id).cloned().ok_or(EngineError::NotFound(id))?;
        require_party(caller, &r)?;
        let to = next_status(&r, Transition::Cancel)?;

        let event = Event::ReservationCancelled {
            id,
            vehicle_id: r.vehicle_id,
            by: caller.user_id,
            at: now_ms(),
        };
        self.persist_and_apply(&mut vs, &event).await?;
        self.otp.clear_reservation(id);
        record_transition(&r, to);
        vs.reservation(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Administrative escalation. Disputed reservations accept no further transitions.
    pub async fn dispute_reservation(&self, caller: &Caller, id: Ulid) -> Result<Reservation, EngineError> {
        let mut vs = self.resolve_entity_write(id).await?;
        let r = vs.reservation(id).cloned().ok_or(EngineError::NotFound(id))?;
        if !caller.is_admin() {
            return Err(EngineError::Unauthorized("only administrators may open a dispute"));
        }
        let to = next_status(&r, Transition::Dispute)?;

        let event = Event::ReservationDisputed {
            id,
            vehicle_id: r.vehicle_id,
            at: now_ms(),
        };
        self.persist_and_apply(&mut vs, &event).await?;
        self.otp.clear_reservation(id);
        record_transition(&r, to);
        vs.reservation(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Issue the code that gates the next handover. Pickup codes need a
    /// confirmed reservation, return codes an ongoing one.
    pub async fn issue_code(&self, caller: &Caller, id: Ulid, phase: Phase) -> Result<IssuedCode, EngineError> {
        let vs = self.resolve_entity_write(id).await?;
        let r = vs.reservation(id).ok_or(EngineError::NotFound(id))?;
        require_party(caller, r)?;
        let transition = match phase {
            Phase::Pickup => Transition::Pickup,
            Phase::Return => Transition::Return,
        };
        next_status(r, transition)?;

        let issued = self.otp.issue(id, phase, now_ms());
        tracing::info!(reservation = %id, phase = %phase, expires_at = issued.expires_at, "handover code issued");
        Ok(issued)
    }

    /// Hand the vehicle to the renter. The pickup code is consumed only once
    /// the handover is journaled.
    pub async fn pickup(
        &self,
        caller: &Caller,
        id: Ulid,
        code: &str,
        report: HandoverReport,
    ) -> Result<Reservation, EngineError> {
        let mut vs = self.resolve_entity_write(id).await?;
        let r = vs.reservation(id).cloned().ok_or(EngineError::NotFound(id))?;
        require_party(caller, &r)?;
        let to = next_status(&r, Transition::Pickup)?;
        validate_report(&report)?;

        let now = now_ms();
        let redemption = self
            .otp
            .redeem(id, Phase::Pickup, code, now)
            .map_err(|check| {
                tracing::debug!(reservation = %id, outcome = check.label(), "pickup code rejected");
                EngineError::ExpiredOrInvalidCode
            })?;

        let event = Event::PickedUp {
            id,
            vehicle_id: r.vehicle_id,
            handover: Handover { at: now, report },
        };
        self.persist_and_apply(&mut vs, &event).await?;
        redemption.commit();
        record_transition(&r, to);
        vs.reservation(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Take the vehicle back, settle usage and compute the final price.
    /// Consumes the return code.
    pub async fn return_vehicle(
        &self,
        caller: &Caller,
        id: Ulid,
        code: &str,
        report: ReturnReport,
    ) -> Result<Reservation, EngineError> {
        let mut vs = self.resolve_entity_write(id).await?;
        let r = vs.reservation(id).cloned().ok_or(EngineError::NotFound(id))?;
        require_party(caller, &r)?;
        let to = next_status(&r, Transition::Return)?;

        validate_report(&report.handover)?;
        if let Some(km) = report.actual_distance_km {
            check_quantity("actual_distance_km", km, MAX_DISTANCE_KM)?;
        }
        let liters = report.fuel_consumed_liters.unwrap_or(0.0);
        check_quantity("fuel_consumed_liters", liters, MAX_FUEL_LITERS)?;
        let price_per_liter = report.fuel_price_per_liter.unwrap_or(0);
        if !(0..=MAX_UNIT_PRICE).contains(&price_per_liter) {
            return Err(EngineError::invalid("fuel_price_per_liter out of range"));
        }
        let start_odometer = r.pickup.as_ref().and_then(|h| h.report.odometer_km);
        let odometer_distance = match (start_odometer, report.handover.odometer_km) {
            (Some(start), Some(end)) if end < start => {
                return Err(EngineError::invalid("return odometer is below pickup odometer"));
            }
            (Some(start), Some(end)) => Some((end - start) as f64),
            _ => None,
        };

        let now = now_ms();
        let redemption = self
            .otp
            .redeem(id, Phase::Return, code, now)
            .map_err(|check| {
                tracing::debug!(reservation = %id, outcome = check.label(), "return code rejected");
                EngineError::ExpiredOrInvalidCode
            })?;

        let actual_distance_km = report
            .actual_distance_km
            .or(odometer_distance)
            .unwrap_or(0.0);
        let picked_up_at = r.pickup.as_ref().map_or(r.span.start, |h| h.at);
        let actual_hours = ceil_hours(now - picked_up_at);
        let fuel_cost_charged = pricing::fuel_surcharge(liters, price_per_liter);
        let final_price = pricing::final_price(
            Some(r.pricing_model),
            &r.rates,
            actual_distance_km,
            actual_hours,
            r.estimated_price,
            fuel_cost_charged,
        );

        let event = Event::Returned {
            id,
            vehicle_id: r.vehicle_id,
            handover: Handover {
                at: now,
                report: report.handover,
            },
            actual_distance_km,
            fuel_consumed_liters: liters,
            fuel_cost_charged,
            final_price,
        };
        self.persist_and_apply(&mut vs, &event).await?;
        redemption.commit();
        record_transition(&r, to);
        tracing::info!(reservation = %id, final_price, fuel_cost_charged, "reservation settled");
        vs.reservation(id).cloned().ok_or(EngineError::NotFound(id))
    }
}

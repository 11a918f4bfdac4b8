//! Price computation. Pure functions over whole currency units.

use crate::model::{PricingModel, RateSnapshot};

/// `round(distance_km * price_per_km)`, half away from zero.
pub fn distance_charge(distance_km: f64, price_per_km: i64) -> i64 {
    (distance_km * price_per_km as f64).round() as i64
}

pub fn time_charge(hours: i64, price_per_hour: i64) -> i64 {
    hours.saturating_mul(price_per_hour)
}

pub fn fuel_surcharge(liters: f64, price_per_liter: i64) -> i64 {
    (liters * price_per_liter as f64).round() as i64
}

/// Price a rental under `model`.
///
/// `distance`: base + distance charge.
/// `time`: base + hours * hourly rate.
/// `hybrid`: base + both.
pub fn price(model: PricingModel, rates: &RateSnapshot, distance_km: f64, hours: i64) -> i64 {
    let base = rates.base_price;
    match model {
        PricingModel::Distance => base.saturating_add(distance_charge(distance_km, rates.price_per_km)),
        PricingModel::Time => base.saturating_add(time_charge(hours, rates.price_per_hour)),
        PricingModel::Hybrid => base
            .saturating_add(distance_charge(distance_km, rates.price_per_km))
            .saturating_add(time_charge(hours, rates.price_per_hour)),
    }
}

/// Final price at return time.
///
/// A model of `None` means the stored model could not be recognized; the
/// estimate then stands in for the usage price. The fuel surcharge is added
/// either way.
pub fn final_price(
    model: Option<PricingModel>,
    rates: &RateSnapshot,
    actual_distance_km: f64,
    actual_hours: i64,
    estimated_price: i64,
    fuel_surcharge: i64,
) -> i64 {
    let usage = match model {
        Some(model) => price(model, rates, actual_distance_km, actual_hours),
        None => estimated_price,
    };
    usage.saturating_add(fuel_surcharge)
}

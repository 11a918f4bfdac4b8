use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::HOUR_MS;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Closed interval `[start, end]`.
///
/// Both the availability containment test and the reservation conflict test
/// treat the endpoints as inclusive, so two spans sharing one instant overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Closed-interval overlap: `self.start <= other.end && other.start <= self.end`.
    pub fn touches(&self, other: &Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Whole hours covered by the span, rounded up.
    pub fn billable_hours(&self) -> i64 {
        ceil_hours(self.duration_ms())
    }
}

/// Round a duration up to whole hours. Non-positive durations bill zero hours.
pub fn ceil_hours(duration_ms: Ms) -> i64 {
    if duration_ms <= 0 {
        return 0;
    }
    (duration_ms + HOUR_MS - 1) / HOUR_MS
}

// ── Closed vocabularies ──────────────────────────────────────────

/// Returned when a string does not name any variant of a closed vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized {kind}: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(UnknownVariant { kind: $kind, value: s.to_string() }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowStatus {
    Available,
    Booked,
    Blocked,
    Maintenance,
}

string_enum!(WindowStatus, "window status", {
    Available => "available",
    Booked => "booked",
    Blocked => "blocked",
    Maintenance => "maintenance",
});

impl WindowStatus {
    /// Statuses an owner may set by hand. `booked` is reserved for the engine.
    pub fn owner_settable(&self) -> bool {
        !matches!(self, WindowStatus::Booked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Ongoing,
    Completed,
    Cancelled,
    Disputed,
}

string_enum!(ReservationStatus, "reservation status", {
    Pending => "pending",
    Confirmed => "confirmed",
    Ongoing => "ongoing",
    Completed => "completed",
    Cancelled => "cancelled",
    Disputed => "disputed",
});

/// Lifecycle events that move a reservation between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transition {
    Confirm,
    Cancel,
    Pickup,
    Return,
    Dispute,
}

string_enum!(Transition, "transition", {
    Confirm => "confirm",
    Cancel => "cancel",
    Pickup => "pickup",
    Return => "return",
    Dispute => "dispute",
});

impl ReservationStatus {
    /// Statuses that hold the vehicle for scheduling purposes.
    pub fn is_active(&self) -> bool {
        matches!(self, ReservationStatus::Confirmed | ReservationStatus::Ongoing)
    }

    /// The state machine. `None` means the transition is not allowed from here.
    pub fn next(&self, transition: Transition) -> Option<ReservationStatus> {
        use ReservationStatus::*;
        match (self, transition) {
            (Pending, Transition::Confirm) => Some(Confirmed),
            (Pending | Confirmed, Transition::Cancel) => Some(Cancelled),
            (Confirmed, Transition::Pickup) => Some(Ongoing),
            (Ongoing, Transition::Return) => Some(Completed),
            (Pending | Confirmed | Ongoing | Completed, Transition::Dispute) => Some(Disputed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PricingModel {
    Distance,
    Time,
    Hybrid,
}

string_enum!(PricingModel, "pricing model", {
    Distance => "distance",
    Time => "time",
    Hybrid => "hybrid",
});

impl PricingModel {
    /// Missing or unrecognized models fall back to `distance`.
    pub fn parse_or_default(raw: Option<&str>) -> PricingModel {
        raw.and_then(|s| s.parse().ok()).unwrap_or(PricingModel::Distance)
    }
}

/// Which physical handover a one-time code gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Pickup,
    Return,
}

string_enum!(Phase, "handover phase", {
    Pickup => "pickup",
    Return => "return",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

string_enum!(Weekday, "weekday", {
    Mon => "mon",
    Tue => "tue",
    Wed => "wed",
    Thu => "thu",
    Fri => "fri",
    Sat => "sat",
    Sun => "sun",
});

// ── Identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Member,
    Admin,
}

/// The authenticated principal behind a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Ulid,
    pub role: Role,
}

impl Caller {
    pub fn member(user_id: Ulid) -> Self {
        Self { user_id, role: Role::Member }
    }

    pub fn admin(user_id: Ulid) -> Self {
        Self { user_id, role: Role::Admin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Which side of a reservation a listing query looks from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyRole {
    Owner,
    Renter,
}

string_enum!(PartyRole, "party role", {
    Owner => "owner",
    Renter => "renter",
});

// ── Vehicles ─────────────────────────────────────────────────────

/// Per-unit prices in whole currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rates {
    pub price_per_km: i64,
    pub price_per_hour: i64,
    pub price_per_day: i64,
    pub base_price: i64,
}

/// Catalog snapshot of a vehicle, fed in by the catalog collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub rates: Rates,
    pub is_available: bool,
    pub is_active: bool,
}

impl Vehicle {
    pub fn bookable_flags(&self) -> bool {
        self.is_available && self.is_active
    }
}

/// Partial update of a vehicle snapshot. Only supplied fields are touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VehiclePatch {
    pub owner_id: Option<Ulid>,
    pub price_per_km: Option<i64>,
    pub price_per_hour: Option<i64>,
    pub price_per_day: Option<i64>,
    pub base_price: Option<i64>,
    pub is_available: Option<bool>,
    pub is_active: Option<bool>,
}

impl VehiclePatch {
    pub fn is_empty(&self) -> bool {
        *self == VehiclePatch::default()
    }

    pub fn apply(&self, vehicle: &mut Vehicle) {
        if let Some(owner_id) = self.owner_id {
            vehicle.owner_id = owner_id;
        }
        if let Some(v) = self.price_per_km {
            vehicle.rates.price_per_km = v;
        }
        if let Some(v) = self.price_per_hour {
            vehicle.rates.price_per_hour = v;
        }
        if let Some(v) = self.price_per_day {
            vehicle.rates.price_per_day = v;
        }
        if let Some(v) = self.base_price {
            vehicle.rates.base_price = v;
        }
        if let Some(v) = self.is_available {
            vehicle.is_available = v;
        }
        if let Some(v) = self.is_active {
            vehicle.is_active = v;
        }
    }
}

// ── Availability windows ─────────────────────────────────────────

/// Declared weekly recurrence. Stored and reported, never evaluated by the
/// conflict checker: the window's own time range always wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub days_of_week: Vec<Weekday>,
    /// Minutes after midnight.
    pub daily_start: u16,
    pub daily_end: u16,
}

impl Recurrence {
    pub fn days_label(&self) -> String {
        self.days_of_week
            .iter()
            .map(Weekday::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Parse `"HH:MM"` into minutes after midnight.
pub fn parse_clock(s: &str) -> Result<u16, UnknownVariant> {
    let bad = || UnknownVariant { kind: "time of day", value: s.to_string() };
    let (h, m) = s.trim().split_once(':').ok_or_else(bad)?;
    let h: u16 = h.parse().map_err(|_| bad())?;
    let m: u16 = m.parse().map_err(|_| bad())?;
    if h > 23 || m > 59 {
        return Err(bad());
    }
    Ok(h * 60 + m)
}

pub fn format_clock(minutes: u16) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Parse a comma separated weekday list such as `"mon,wed,fri"`.
pub fn parse_weekdays(s: &str) -> Result<Vec<Weekday>, UnknownVariant> {
    let mut days = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let day: Weekday = part.parse()?;
        if !days.contains(&day) {
            days.push(day);
        }
    }
    Ok(days)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub span: Span,
    pub status: WindowStatus,
    pub recurrence: Option<Recurrence>,
}

/// Partial update of a window. `None` leaves the field untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowPatch {
    pub available_from: Option<Ms>,
    pub available_to: Option<Ms>,
    pub status: Option<WindowStatus>,
}

impl WindowPatch {
    pub fn is_empty(&self) -> bool {
        *self == WindowPatch::default()
    }
}

// ── Reservations ─────────────────────────────────────────────────

/// Per-unit prices copied from the vehicle when the reservation was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateSnapshot {
    pub price_per_km: i64,
    pub price_per_hour: i64,
    pub base_price: i64,
}

impl From<&Rates> for RateSnapshot {
    fn from(r: &Rates) -> Self {
        Self {
            price_per_km: r.price_per_km,
            price_per_hour: r.price_per_hour,
            base_price: r.base_price,
        }
    }
}

/// What was observed at a physical handover.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoverReport {
    pub odometer_km: Option<i64>,
    /// Fuel gauge, percent.
    pub fuel_level: Option<u8>,
    pub condition_report: Option<String>,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handover {
    pub at: Ms,
    pub report: HandoverReport,
}

/// Usage declared when the vehicle comes back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReturnReport {
    pub handover: HandoverReport,
    pub actual_distance_km: Option<f64>,
    pub fuel_consumed_liters: Option<f64>,
    pub fuel_price_per_liter: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub renter_id: Ulid,
    pub owner_id: Ulid,
    pub span: Span,
    pub duration_hours: i64,
    pub pricing_model: PricingModel,
    pub rates: RateSnapshot,
    pub estimated_distance_km: f64,
    pub estimated_price: i64,
    pub final_price: Option<i64>,
    pub security_deposit: i64,
    pub pickup_location: String,
    pub return_location: String,
    pub notes: Option<String>,
    pub status: ReservationStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub pickup: Option<Handover>,
    pub dropoff: Option<Handover>,
    pub actual_distance_km: Option<f64>,
    pub fuel_consumed_liters: Option<f64>,
    pub fuel_cost_charged: i64,
}

impl Reservation {
    pub fn is_party(&self, user_id: Ulid) -> bool {
        self.renter_id == user_id || self.owner_id == user_id
    }
}

/// Inbound create-reservation request.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReservation {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub pickup_location: String,
    pub return_location: Option<String>,
    pub pricing_model: Option<String>,
    pub estimated_distance_km: Option<f64>,
    pub notes: Option<String>,
}

/// Why a proposed interval cannot be booked (besides the vehicle being absent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unbookable {
    Unavailable(&'static str),
    NoAvailabilityWindow,
    Conflict(Ulid),
}

/// Answer to a bookability query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingCheck {
    pub vehicle_id: Ulid,
    pub span: Span,
    pub verdict: Result<(), Unbookable>,
    pub rates: Rates,
}

impl BookingCheck {
    pub fn bookable(&self) -> bool {
        self.verdict.is_ok()
    }

    pub fn reason(&self) -> Option<String> {
        match self.verdict {
            Ok(()) => None,
            Err(Unbookable::Unavailable(why)) => Some(why.to_string()),
            Err(Unbookable::NoAvailabilityWindow) => {
                Some("no availability window covers this time range".to_string())
            }
            Err(Unbookable::Conflict(id)) => {
                Some(format!("vehicle is already booked by reservation {id}"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub id: Option<Ulid>,
    pub role: Option<PartyRole>,
    pub status: Option<ReservationStatus>,
}

/// An issued handover code, as handed back to the requesting party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCode {
    pub reservation_id: Ulid,
    pub phase: Phase,
    pub code: String,
    pub expires_at: Ms,
}

// ── Journal events ───────────────────────────────────────────────

/// Journal record payload. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    VehicleRegistered {
        vehicle: Vehicle,
    },
    VehicleUpdated {
        vehicle: Vehicle,
    },
    WindowAdded {
        window: AvailabilityWindow,
    },
    WindowUpdated {
        window: AvailabilityWindow,
    },
    WindowRemoved {
        id: Ulid,
        vehicle_id: Ulid,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationConfirmed {
        id: Ulid,
        vehicle_id: Ulid,
        at: Ms,
    },
    ReservationCancelled {
        id: Ulid,
        vehicle_id: Ulid,
        by: Ulid,
        at: Ms,
    },
    ReservationDisputed {
        id: Ulid,
        vehicle_id: Ulid,
        at: Ms,
    },
    PickedUp {
        id: Ulid,
        vehicle_id: Ulid,
        handover: Handover,
    },
    Returned {
        id: Ulid,
        vehicle_id: Ulid,
        handover: Handover,
        actual_distance_km: f64,
        fuel_consumed_liters: f64,
        fuel_cost_charged: i64,
        final_price: i64,
    },
}

impl Event {
    /// The vehicle whose aggregate this event mutates.
    pub fn vehicle_id(&self) -> Ulid {
        match self {
            Event::VehicleRegistered { vehicle } | Event::VehicleUpdated { vehicle } => vehicle.id,
            Event::WindowAdded { window } | Event::WindowUpdated { window } => window.vehicle_id,
            Event::ReservationCreated { reservation } => reservation.vehicle_id,
            Event::WindowRemoved { vehicle_id, .. }
            | Event::ReservationConfirmed { vehicle_id, .. }
            | Event::ReservationCancelled { vehicle_id, .. }
            | Event::ReservationDisputed { vehicle_id, .. }
            | Event::PickedUp { vehicle_id, .. }
            | Event::Returned { vehicle_id, .. } => *vehicle_id,
        }
    }
}

// ── Per-vehicle aggregate ────────────────────────────────────────

/// Everything the engine knows about one vehicle. Guarded by a single lock so
/// the conflict check and the insert it authorizes happen atomically.
#[derive(Debug, Clone)]
pub struct VehicleState {
    pub vehicle: Vehicle,
    /// Sorted by `span.start`.
    pub windows: Vec<AvailabilityWindow>,
    /// Sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl VehicleState {
    pub fn new(vehicle: Vehicle) -> Self {
        Self {
            vehicle,
            windows: Vec::new(),
            reservations: Vec::new(),
        }
    }

    pub fn insert_window(&mut self, window: AvailabilityWindow) {
        let pos = self
            .windows
            .partition_point(|w| w.span.start <= window.span.start);
        self.windows.insert(pos, window);
    }

    pub fn remove_window(&mut self, id: Ulid) -> Option<AvailabilityWindow> {
        let pos = self.windows.iter().position(|w| w.id == id)?;
        Some(self.windows.remove(pos))
    }

    pub fn window(&self, id: Ulid) -> Option<&AvailabilityWindow> {
        self.windows.iter().find(|w| w.id == id)
    }

    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Confirmed or ongoing reservations whose closed span touches `query`.
    /// Binary search skips everything starting after `query.end`.
    pub fn active_touching<'a>(&'a self, query: &'a Span) -> impl Iterator<Item = &'a Reservation> + 'a {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start <= query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.status.is_active() && r.span.end >= query.start)
    }

    /// Windows with the given status that fully contain `query`.
    pub fn covering_windows<'a>(
        &'a self,
        query: &'a Span,
        status: WindowStatus,
    ) -> impl Iterator<Item = &'a AvailabilityWindow> + 'a {
        let right_bound = self
            .windows
            .partition_point(|w| w.span.start <= query.start);
        self.windows[..right_bound]
            .iter()
            .filter(move |w| w.status == status && w.span.contains_span(query))
    }
}

use super::*;
use super::conflict::validate_span;
use crate::limits::*;
use crate::otp::CodeCheck;

const H: Ms = HOUR_MS;
const DAY: Ms = 24 * HOUR_MS;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("rentd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), OtpStore::new(10 * MINUTE_MS, 1000)).unwrap()
}

/// Midnight two days from now, so every offset used below lies in the future.
fn day_start() -> Ms {
    (now_ms() / DAY + 2) * DAY
}

fn vehicle(owner_id: Ulid) -> Vehicle {
    Vehicle {
        id: Ulid::new(),
        owner_id,
        rates: Rates {
            price_per_km: 10,
            price_per_hour: 50,
            price_per_day: 400,
            base_price: 100,
        },
        is_available: true,
        is_active: true,
    }
}

fn request(vehicle_id: Ulid, start: Ms, end: Ms) -> NewReservation {
    NewReservation {
        id: Ulid::new(),
        vehicle_id,
        start,
        end,
        pickup_location: "12 Harbour Road".into(),
        return_location: None,
        pricing_model: None,
        estimated_distance_km: None,
        notes: None,
    }
}

struct Fixture {
    engine: Engine,
    owner: Caller,
    renter: Caller,
    vehicle_id: Ulid,
    /// Midnight of the test day.
    t0: Ms,
}

/// One registered vehicle with an available window `[08:00, 20:00]`.
async fn fixture(name: &str) -> Fixture {
    let engine = new_engine(name);
    let owner = Caller::member(Ulid::new());
    let renter = Caller::member(Ulid::new());
    let v = vehicle(owner.user_id);
    let vehicle_id = v.id;
    engine.register_vehicle(&owner, v).await.unwrap();

    let t0 = day_start();
    engine
        .add_window(&owner, Ulid::new(), vehicle_id, t0 + 8 * H, t0 + 20 * H, None)
        .await
        .unwrap();
    Fixture {
        engine,
        owner,
        renter,
        vehicle_id,
        t0,
    }
}

impl Fixture {
    async fn book(&self, start: Ms, end: Ms) -> Result<Reservation, EngineError> {
        self.engine
            .create_reservation(&self.renter, request(self.vehicle_id, start, end))
            .await
    }

    async fn booked_and_confirmed(&self, start: Ms, end: Ms) -> Reservation {
        let r = self.book(start, end).await.unwrap();
        self.engine.confirm_reservation(&self.owner, r.id).await.unwrap()
    }

    async fn picked_up(&self, start: Ms, end: Ms, report: HandoverReport) -> Reservation {
        let r = self.booked_and_confirmed(start, end).await;
        let code = self
            .engine
            .issue_code(&self.renter, r.id, Phase::Pickup)
            .await
            .unwrap();
        self.engine
            .pickup(&self.renter, r.id, &code.code, report)
            .await
            .unwrap()
    }
}

// ── Pure checks ──────────────────────────────────────────

fn window(vehicle_id: Ulid, start: Ms, end: Ms, status: WindowStatus) -> AvailabilityWindow {
    AvailabilityWindow {
        id: Ulid::new(),
        vehicle_id,
        span: Span::new(start, end),
        status,
        recurrence: None,
    }
}

#[test]
fn containment_requires_one_window_covering_everything() {
    let v = vehicle(Ulid::new());
    let mut vs = VehicleState::new(v.clone());
    vs.insert_window(window(v.id, 8 * H, 20 * H, WindowStatus::Available));
    vs.insert_window(window(v.id, 20 * H, 23 * H, WindowStatus::Available));

    assert!(check_containment(&vs, &Span::new(9 * H, 18 * H)).is_ok());
    assert!(check_containment(&vs, &Span::new(8 * H, 20 * H)).is_ok());
    // partial overlap
    assert_eq!(
        check_containment(&vs, &Span::new(7 * H, 10 * H)),
        Err(Unbookable::NoAvailabilityWindow)
    );
    // two adjacent windows do not add up
    assert_eq!(
        check_containment(&vs, &Span::new(19 * H, 21 * H)),
        Err(Unbookable::NoAvailabilityWindow)
    );
}

#[test]
fn blocked_windows_do_not_contain() {
    let v = vehicle(Ulid::new());
    let mut vs = VehicleState::new(v.clone());
    vs.insert_window(window(v.id, 8 * H, 20 * H, WindowStatus::Blocked));
    vs.insert_window(window(v.id, 8 * H, 20 * H, WindowStatus::Maintenance));
    assert_eq!(
        check_containment(&vs, &Span::new(9 * H, 10 * H)),
        Err(Unbookable::NoAvailabilityWindow)
    );
}

#[test]
fn bookability_checks_flags_before_windows() {
    let owner = Ulid::new();
    let mut v = vehicle(owner);
    v.is_active = false;
    let vs = VehicleState::new(v);
    let span = Span::new(9 * H, 10 * H);

    assert!(matches!(
        check_bookable(&vs, &span, Ulid::new()),
        Err(Unbookable::Unavailable(_))
    ));
    assert!(matches!(
        check_bookable(&vs, &span, owner),
        Err(Unbookable::Unavailable(_))
    ));
}

#[test]
fn span_validation() {
    let t = day_start();
    assert!(matches!(validate_span(t, t), Err(EngineError::InvalidInput(_))));
    assert!(matches!(validate_span(t + H, t), Err(EngineError::InvalidInput(_))));
    assert!(matches!(
        validate_span(t, t + MAX_SPAN_DURATION_MS + 1),
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        validate_span(MIN_VALID_TIMESTAMP_MS - 1, t),
        Err(EngineError::LimitExceeded(_))
    ));
    assert_eq!(validate_span(t, t + H).unwrap(), Span::new(t, t + H));
}

// ── Catalog ──────────────────────────────────────────────

#[tokio::test]
async fn register_and_update_vehicle() {
    let engine = new_engine("register_vehicle.wal");
    let owner = Caller::member(Ulid::new());
    let v = vehicle(owner.user_id);
    let id = v.id;
    engine.register_vehicle(&owner, v.clone()).await.unwrap();

    assert!(matches!(
        engine.register_vehicle(&owner, v.clone()).await,
        Err(EngineError::AlreadyExists(dup)) if dup == id
    ));

    let stranger = Caller::member(Ulid::new());
    let patch = VehiclePatch {
        price_per_km: Some(12),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_vehicle(&stranger, id, patch.clone()).await,
        Err(EngineError::Unauthorized(_))
    ));

    let updated = engine.update_vehicle(&owner, id, patch).await.unwrap();
    assert_eq!(updated.rates.price_per_km, 12);
    assert_eq!(engine.get_vehicle_snapshot(id).await.unwrap().rates.price_per_km, 12);

    let mut foreign = vehicle(Ulid::new());
    assert!(matches!(
        engine.register_vehicle(&stranger, foreign).await,
        Err(EngineError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn negative_rates_are_rejected() {
    let engine = new_engine("negative_rates.wal");
    let owner = Caller::member(Ulid::new());
    let mut v = vehicle(owner.user_id);
    v.rates.price_per_km = -1;
    assert!(matches!(
        engine.register_vehicle(&owner, v).await,
        Err(EngineError::InvalidInput(_))
    ));
}

// ── Availability windows ─────────────────────────────────

#[tokio::test]
async fn window_rules() {
    let f = fixture("window_rules.wal").await;
    let e = &f.engine;

    // past
    let past = now_ms() - DAY;
    assert!(matches!(
        e.add_window(&f.owner, Ulid::new(), f.vehicle_id, past, past + H, None).await,
        Err(EngineError::InvalidInput(_))
    ));
    // stranger
    assert!(matches!(
        e.add_window(&f.renter, Ulid::new(), f.vehicle_id, f.t0 + DAY, f.t0 + DAY + H, None)
            .await,
        Err(EngineError::Unauthorized(_))
    ));
    // empty recurrence
    let rec = Recurrence {
        days_of_week: vec![],
        daily_start: 0,
        daily_end: 60,
    };
    assert!(matches!(
        e.add_window(&f.owner, Ulid::new(), f.vehicle_id, f.t0 + DAY, f.t0 + DAY + H, Some(rec))
            .await,
        Err(EngineError::InvalidInput(_))
    ));

    let r = f.booked_and_confirmed(f.t0 + 9 * H, f.t0 + 12 * H).await;

    // a new window touching the confirmed reservation
    assert!(matches!(
        e.add_window(&f.owner, Ulid::new(), f.vehicle_id, f.t0 + 12 * H, f.t0 + 13 * H, None)
            .await,
        Err(EngineError::SchedulingConflict(id)) if id == r.id
    ));

    let windows = e.list_windows(f.vehicle_id, None, None, None).await.unwrap();
    assert_eq!(windows.len(), 1);
    let covering = windows[0].id;
    assert!(matches!(
        e.remove_window(&f.owner, covering).await,
        Err(EngineError::SchedulingConflict(_))
    ));
    assert!(matches!(
        e.update_window(&f.owner, covering, WindowPatch::default()).await,
        Err(EngineError::InvalidInput(_))
    ));
    let booked = WindowPatch {
        status: Some(WindowStatus::Booked),
        ..Default::default()
    };
    assert!(matches!(
        e.update_window(&f.owner, covering, booked).await,
        Err(EngineError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn blocking_a_window_stops_new_bookings() {
    let f = fixture("window_block.wal").await;
    let e = &f.engine;
    let id = e.list_windows(f.vehicle_id, None, None, None).await.unwrap()[0].id;

    let blocked = WindowPatch {
        status: Some(WindowStatus::Blocked),
        ..Default::default()
    };
    let w = e.update_window(&f.owner, id, blocked).await.unwrap();
    assert_eq!(w.status, WindowStatus::Blocked);

    assert!(e.list_windows(f.vehicle_id, None, None, None).await.unwrap().is_empty());
    let listed = e
        .list_windows(f.vehicle_id, Some(WindowStatus::Blocked), None, None)
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    assert!(matches!(
        f.book(f.t0 + 9 * H, f.t0 + 10 * H).await,
        Err(EngineError::NoAvailabilityWindow)
    ));

    e.remove_window(&f.owner, id).await.unwrap();
    assert!(matches!(
        e.remove_window(&f.owner, id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn window_listing_filters_by_range() {
    let f = fixture("window_range.wal").await;
    let e = &f.engine;
    e.add_window(&f.owner, Ulid::new(), f.vehicle_id, f.t0 + DAY, f.t0 + DAY + 4 * H, None)
        .await
        .unwrap();

    let all = e.list_windows(f.vehicle_id, None, None, None).await.unwrap();
    assert_eq!(all.len(), 2);
    let second_day = e
        .list_windows(f.vehicle_id, None, Some(f.t0 + DAY), Some(f.t0 + 2 * DAY))
        .await
        .unwrap();
    assert_eq!(second_day.len(), 1);
    assert_eq!(second_day[0].span.start, f.t0 + DAY);

    assert!(matches!(
        e.list_windows(f.vehicle_id, None, Some(f.t0 + DAY), Some(f.t0)).await,
        Err(EngineError::InvalidInput(_))
    ));
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn distance_estimate_on_create() {
    let f = fixture("estimate_distance.wal").await;
    let mut req = request(f.vehicle_id, f.t0 + 9 * H, f.t0 + 18 * H);
    req.estimated_distance_km = Some(12.4);
    let r = f.engine.create_reservation(&f.renter, req).await.unwrap();

    assert_eq!(r.status, ReservationStatus::Pending);
    assert_eq!(r.pricing_model, PricingModel::Distance);
    assert_eq!(r.estimated_price, 224);
    assert_eq!(r.duration_hours, 9);
    assert_eq!(r.security_deposit, 400);
    assert_eq!(r.return_location, r.pickup_location);
    assert_eq!(r.owner_id, f.owner.user_id);
    assert_eq!(r.renter_id, f.renter.user_id);
}

#[tokio::test]
async fn time_estimate_bills_started_hours() {
    let f = fixture("estimate_time.wal").await;
    // 8.3 hours
    let mut req = request(f.vehicle_id, f.t0 + 9 * H, f.t0 + 9 * H + 29_880_000);
    req.pricing_model = Some("Time".into());
    let r = f.engine.create_reservation(&f.renter, req).await.unwrap();
    assert_eq!(r.duration_hours, 9);
    assert_eq!(r.estimated_price, 550);
}

#[tokio::test]
async fn unknown_pricing_model_defaults_to_distance() {
    let f = fixture("estimate_unknown.wal").await;
    let mut req = request(f.vehicle_id, f.t0 + 9 * H, f.t0 + 10 * H);
    req.pricing_model = Some("weekly".into());
    req.estimated_distance_km = Some(5.0);
    let r = f.engine.create_reservation(&f.renter, req).await.unwrap();
    assert_eq!(r.pricing_model, PricingModel::Distance);
    assert_eq!(r.estimated_price, 150);
}

#[tokio::test]
async fn create_validates_request() {
    let f = fixture("create_validation.wal").await;
    let e = &f.engine;

    let mut blank = request(f.vehicle_id, f.t0 + 9 * H, f.t0 + 10 * H);
    blank.pickup_location = "   ".into();
    assert!(matches!(
        e.create_reservation(&f.renter, blank).await,
        Err(EngineError::InvalidInput(_))
    ));

    assert!(matches!(
        f.book(f.t0 + 10 * H, f.t0 + 9 * H).await,
        Err(EngineError::InvalidInput(_))
    ));

    let mut negative = request(f.vehicle_id, f.t0 + 9 * H, f.t0 + 10 * H);
    negative.estimated_distance_km = Some(-3.0);
    assert!(matches!(
        e.create_reservation(&f.renter, negative).await,
        Err(EngineError::InvalidInput(_))
    ));

    let missing = Ulid::new();
    assert!(matches!(
        e.create_reservation(&f.renter, request(missing, f.t0 + 9 * H, f.t0 + 10 * H)).await,
        Err(EngineError::NotFound(id)) if id == missing
    ));

    let r = f.book(f.t0 + 9 * H, f.t0 + 10 * H).await.unwrap();
    let mut dup = request(f.vehicle_id, f.t0 + 11 * H, f.t0 + 12 * H);
    dup.id = r.id;
    assert!(matches!(
        e.create_reservation(&f.renter, dup).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn owner_cannot_book_own_vehicle() {
    let f = fixture("own_vehicle.wal").await;
    let result = f
        .engine
        .create_reservation(&f.owner, request(f.vehicle_id, f.t0 + 9 * H, f.t0 + 10 * H))
        .await;
    assert!(matches!(result, Err(EngineError::Unavailable(_))));
}

#[tokio::test]
async fn unavailable_vehicle_is_refused() {
    let f = fixture("unavailable.wal").await;
    let patch = VehiclePatch {
        is_available: Some(false),
        ..Default::default()
    };
    f.engine.update_vehicle(&f.owner, f.vehicle_id, patch).await.unwrap();

    let check = f
        .engine
        .can_book(&f.renter, f.vehicle_id, f.t0 + 9 * H, f.t0 + 10 * H)
        .await
        .unwrap();
    assert!(!check.bookable());
    assert!(matches!(check.verdict, Err(Unbookable::Unavailable(_))));
    assert!(matches!(
        f.book(f.t0 + 9 * H, f.t0 + 10 * H).await,
        Err(EngineError::Unavailable(_))
    ));
}

#[tokio::test]
async fn partial_window_overlap_is_not_enough() {
    let f = fixture("partial_overlap.wal").await;
    let check = f
        .engine
        .can_book(&f.renter, f.vehicle_id, f.t0 + 7 * H, f.t0 + 10 * H)
        .await
        .unwrap();
    assert_eq!(check.verdict, Err(Unbookable::NoAvailabilityWindow));
    assert!(check.reason().is_some());
    assert!(matches!(
        f.book(f.t0 + 7 * H, f.t0 + 10 * H).await,
        Err(EngineError::NoAvailabilityWindow)
    ));
}

#[tokio::test]
async fn containment_and_conflict_are_independent() {
    let f = fixture("independent_tests.wal").await;
    let first = f.booked_and_confirmed(f.t0 + 9 * H, f.t0 + 12 * H).await;

    // contained, but touches the confirmed reservation at 12:00
    let check = f
        .engine
        .can_book(&f.renter, f.vehicle_id, f.t0 + 12 * H, f.t0 + 15 * H)
        .await
        .unwrap();
    assert_eq!(check.verdict, Err(Unbookable::Conflict(first.id)));

    // no conflict, but outside every window
    let check = f
        .engine
        .can_book(&f.renter, f.vehicle_id, f.t0 + 19 * H, f.t0 + 21 * H)
        .await
        .unwrap();
    assert_eq!(check.verdict, Err(Unbookable::NoAvailabilityWindow));

    // both pass
    let check = f
        .engine
        .can_book(&f.renter, f.vehicle_id, f.t0 + 13 * H, f.t0 + 15 * H)
        .await
        .unwrap();
    assert!(check.bookable());
    assert_eq!(check.reason(), None);
}

#[tokio::test]
async fn rejection_leaves_state_unchanged() {
    let f = fixture("idempotent_rejection.wal").await;
    f.booked_and_confirmed(f.t0 + 9 * H, f.t0 + 12 * H).await;

    for _ in 0..2 {
        assert!(matches!(
            f.book(f.t0 + 11 * H, f.t0 + 14 * H).await,
            Err(EngineError::SchedulingConflict(_))
        ));
    }
    let vs = f.engine.get_vehicle(&f.vehicle_id).unwrap();
    assert_eq!(vs.read().await.reservations.len(), 1);
}

#[tokio::test]
async fn repeated_confirm_is_refused_every_time() {
    let f = fixture("repeated_confirm.wal").await;
    let confirmed = f.booked_and_confirmed(f.t0 + 9 * H, f.t0 + 12 * H).await;

    for _ in 0..3 {
        assert!(matches!(
            f.engine.confirm_reservation(&f.owner, confirmed.id).await,
            Err(EngineError::InvalidStateTransition {
                from: ReservationStatus::Confirmed,
                transition: Transition::Confirm,
            })
        ));
    }
    let same = f.engine.get_reservation(&f.owner, confirmed.id).await.unwrap();
    assert_eq!(same, confirmed);
}

#[tokio::test]
async fn disputed_reservation_accepts_no_transition() {
    let f = fixture("disputed_is_terminal.wal").await;
    let e = &f.engine;
    let admin = Caller::admin(Ulid::new());
    let r = f.booked_and_confirmed(f.t0 + 9 * H, f.t0 + 12 * H).await;
    let code = e.issue_code(&f.renter, r.id, Phase::Pickup).await.unwrap();
    let disputed = e.dispute_reservation(&admin, r.id).await.unwrap();
    assert_eq!(disputed.status, ReservationStatus::Disputed);

    let refused = |res: Result<Reservation, EngineError>| {
        matches!(
            res,
            Err(EngineError::InvalidStateTransition {
                from: ReservationStatus::Disputed,
                ..
            })
        )
    };
    assert!(refused(e.confirm_reservation(&f.owner, r.id).await));
    assert!(refused(e.cancel_reservation(&f.renter, r.id).await));
    assert!(refused(e.cancel_reservation(&f.owner, r.id).await));
    assert!(refused(
        e.pickup(&f.renter, r.id, &code.code, HandoverReport::default())
            .await
    ));
    assert!(refused(e.dispute_reservation(&admin, r.id).await));
    assert!(matches!(
        e.issue_code(&f.renter, r.id, Phase::Pickup).await,
        Err(EngineError::InvalidStateTransition { .. })
    ));

    let same = e.get_reservation(&f.renter, r.id).await.unwrap();
    assert_eq!(same, disputed);
}

#[tokio::test]
async fn pending_reservations_do_not_hold_the_vehicle() {
    let f = fixture("pending_overlap.wal").await;
    let a = f.book(f.t0 + 9 * H, f.t0 + 12 * H).await.unwrap();
    let b = f.book(f.t0 + 10 * H, f.t0 + 13 * H).await.unwrap();

    f.engine.confirm_reservation(&f.owner, a.id).await.unwrap();
    assert!(matches!(
        f.engine.confirm_reservation(&f.owner, b.id).await,
        Err(EngineError::SchedulingConflict(id)) if id == a.id
    ));
    let b = f.engine.get_reservation(&f.renter, b.id).await.unwrap();
    assert_eq!(b.status, ReservationStatus::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_confirmations_admit_one() {
    let f = fixture("concurrent_confirm.wal").await;
    let engine = Arc::new(f.engine);

    let mut ids = Vec::new();
    for _ in 0..16 {
        let renter = Caller::member(Ulid::new());
        let r = engine
            .create_reservation(&renter, request(f.vehicle_id, f.t0 + 9 * H, f.t0 + 11 * H))
            .await
            .unwrap();
        ids.push(r.id);
    }

    let mut handles = Vec::new();
    for id in ids {
        let engine = engine.clone();
        let owner = f.owner;
        handles.push(tokio::spawn(async move {
            engine.confirm_reservation(&owner, id).await
        }));
    }

    let mut confirmed = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => confirmed += 1,
            Err(EngineError::SchedulingConflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(confirmed, 1);
    assert_eq!(conflicts, 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_id_cannot_be_booked_on_two_vehicles() {
    let f = fixture("shared_id.wal").await;
    let other = vehicle(f.owner.user_id);
    let other_id = other.id;
    f.engine.register_vehicle(&f.owner, other).await.unwrap();
    f.engine
        .add_window(&f.owner, Ulid::new(), other_id, f.t0 + 8 * H, f.t0 + 20 * H, None)
        .await
        .unwrap();
    let engine = Arc::new(f.engine);

    for _ in 0..20 {
        let id = Ulid::new();
        let mut handles = Vec::new();
        for vehicle_id in [f.vehicle_id, other_id] {
            let engine = engine.clone();
            let renter = Caller::member(Ulid::new());
            let mut req = request(vehicle_id, f.t0 + 9 * H, f.t0 + 10 * H);
            req.id = id;
            handles.push(tokio::spawn(async move {
                engine.create_reservation(&renter, req).await
            }));
        }

        let mut winners = Vec::new();
        for h in handles {
            match h.await.unwrap() {
                Ok(r) => winners.push(r.vehicle_id),
                Err(EngineError::AlreadyExists(dup)) => assert_eq!(dup, id),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(engine.vehicle_for_entity(&id), Some(winners[0]));
    }
}

#[tokio::test]
async fn refused_create_releases_its_id() {
    let f = fixture("released_id.wal").await;
    let mut req = request(f.vehicle_id, f.t0 + 21 * H, f.t0 + 22 * H);
    let id = req.id;
    assert!(matches!(
        f.engine.create_reservation(&f.renter, req.clone()).await,
        Err(EngineError::NoAvailabilityWindow)
    ));
    assert_eq!(f.engine.vehicle_for_entity(&id), None);

    req.start = f.t0 + 9 * H;
    req.end = f.t0 + 10 * H;
    let r = f.engine.create_reservation(&f.renter, req).await.unwrap();
    assert_eq!(r.id, id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_against_confirmed_slot() {
    let f = fixture("concurrent_create.wal").await;
    f.booked_and_confirmed(f.t0 + 9 * H, f.t0 + 11 * H).await;
    let engine = Arc::new(f.engine);

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        let vehicle_id = f.vehicle_id;
        // even requests collide with the confirmed slot, odd ones do not
        let start = if i % 2 == 0 { f.t0 + 10 * H } else { f.t0 + 14 * H };
        handles.push(tokio::spawn(async move {
            let renter = Caller::member(Ulid::new());
            engine
                .create_reservation(&renter, request(vehicle_id, start, start + H))
                .await
        }));
    }

    let mut created = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => created += 1,
            Err(e) => assert!(matches!(e, EngineError::SchedulingConflict(_)), "{e}"),
        }
    }
    assert_eq!(created, 8);
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn end_to_end_rental() {
    let f = fixture("end_to_end.wal").await;
    let e = &f.engine;

    let check = e
        .can_book(&f.renter, f.vehicle_id, f.t0 + 9 * H, f.t0 + 18 * H)
        .await
        .unwrap();
    assert!(check.bookable());

    let r = f.book(f.t0 + 9 * H, f.t0 + 18 * H).await.unwrap();
    let r = e.confirm_reservation(&f.owner, r.id).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Confirmed);

    let code = e.issue_code(&f.renter, r.id, Phase::Pickup).await.unwrap();
    assert_eq!(code.code.len(), OTP_DIGITS);
    let report = HandoverReport {
        odometer_km: Some(42_000),
        fuel_level: Some(90),
        condition_report: Some("clean, no scratches".into()),
        images: vec!["img/front.jpg".into()],
    };
    let r = e.pickup(&f.renter, r.id, &code.code, report).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Ongoing);
    assert_eq!(r.pickup.as_ref().unwrap().report.fuel_level, Some(90));

    let code = e.issue_code(&f.owner, r.id, Phase::Return).await.unwrap();
    let ret = ReturnReport {
        actual_distance_km: Some(150.0),
        fuel_consumed_liters: Some(5.0),
        fuel_price_per_liter: Some(15),
        ..Default::default()
    };
    let r = e.return_vehicle(&f.owner, r.id, &code.code, ret).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Completed);
    assert_eq!(r.fuel_cost_charged, 75);
    assert_eq!(r.final_price, Some(1600 + 75));
    assert_eq!(r.actual_distance_km, Some(150.0));
    assert!(r.dropoff.is_some());
    assert!(e.otp.is_empty());
}

#[tokio::test]
async fn distance_falls_back_to_odometer() {
    let f = fixture("odometer.wal").await;
    let e = &f.engine;
    let pickup = HandoverReport {
        odometer_km: Some(1_000),
        ..Default::default()
    };
    let r = f.picked_up(f.t0 + 9 * H, f.t0 + 18 * H, pickup).await;

    let backwards = ReturnReport {
        handover: HandoverReport {
            odometer_km: Some(900),
            ..Default::default()
        },
        ..Default::default()
    };
    let code = e.issue_code(&f.renter, r.id, Phase::Return).await.unwrap();
    assert!(matches!(
        e.return_vehicle(&f.renter, r.id, &code.code, backwards).await,
        Err(EngineError::InvalidInput(_))
    ));

    let forward = ReturnReport {
        handover: HandoverReport {
            odometer_km: Some(1_150),
            ..Default::default()
        },
        ..Default::default()
    };
    let r = e.return_vehicle(&f.renter, r.id, &code.code, forward).await.unwrap();
    assert_eq!(r.actual_distance_km, Some(150.0));
    assert_eq!(r.final_price, Some(1600));
}

#[tokio::test]
async fn wrong_code_keeps_status_and_codes_are_single_use() {
    let f = fixture("code_single_use.wal").await;
    let e = &f.engine;
    let r = f.booked_and_confirmed(f.t0 + 9 * H, f.t0 + 12 * H).await;

    let code = e.issue_code(&f.renter, r.id, Phase::Pickup).await.unwrap();
    let wrong = if code.code == "000000" { "111111" } else { "000000" };
    assert!(matches!(
        e.pickup(&f.renter, r.id, wrong, HandoverReport::default()).await,
        Err(EngineError::ExpiredOrInvalidCode)
    ));
    let same = e.get_reservation(&f.renter, r.id).await.unwrap();
    assert_eq!(same.status, ReservationStatus::Confirmed);

    e.pickup(&f.renter, r.id, &code.code, HandoverReport::default())
        .await
        .unwrap();
    assert_eq!(
        e.otp.verify(r.id, Phase::Pickup, &code.code, now_ms()),
        CodeCheck::Missing
    );
}

#[tokio::test]
async fn failed_journal_write_keeps_the_pickup_code() {
    let mut f = fixture("code_kept_on_storage_failure.wal").await;
    let r = f.booked_and_confirmed(f.t0 + 9 * H, f.t0 + 12 * H).await;
    let code = f.engine.issue_code(&f.renter, r.id, Phase::Pickup).await.unwrap();

    let (closed, _) = mpsc::channel(1);
    let live = std::mem::replace(&mut f.engine.wal_tx, closed);
    assert!(matches!(
        f.engine
            .pickup(&f.renter, r.id, &code.code, HandoverReport::default())
            .await,
        Err(EngineError::StorageFailure(_))
    ));
    let same = f.engine.get_reservation(&f.renter, r.id).await.unwrap();
    assert_eq!(same, r);
    assert_eq!(f.engine.otp.len(), 1);

    f.engine.wal_tx = live;
    let picked = f
        .engine
        .pickup(&f.renter, r.id, &code.code, HandoverReport::default())
        .await
        .unwrap();
    assert_eq!(picked.status, ReservationStatus::Ongoing);
    assert!(f.engine.otp.is_empty());
}

#[tokio::test]
async fn guessing_exhausts_the_challenge() {
    let f = fixture("code_exhausted.wal").await;
    let e = &f.engine;
    let r = f.booked_and_confirmed(f.t0 + 9 * H, f.t0 + 12 * H).await;

    let code = e.issue_code(&f.renter, r.id, Phase::Pickup).await.unwrap();
    let wrong = if code.code == "000000" { "111111" } else { "000000" };
    for _ in 0..MAX_OTP_ATTEMPTS {
        assert!(e.pickup(&f.renter, r.id, wrong, HandoverReport::default()).await.is_err());
    }
    // the real code no longer works either
    assert!(matches!(
        e.pickup(&f.renter, r.id, &code.code, HandoverReport::default()).await,
        Err(EngineError::ExpiredOrInvalidCode)
    ));
}

#[tokio::test]
async fn expired_code_is_rejected() {
    let engine = Engine::new(test_wal_path("code_expired.wal"), OtpStore::new(0, 100)).unwrap();
    let owner = Caller::member(Ulid::new());
    let renter = Caller::member(Ulid::new());
    let v = vehicle(owner.user_id);
    let vehicle_id = v.id;
    engine.register_vehicle(&owner, v).await.unwrap();
    let t0 = day_start();
    engine
        .add_window(&owner, Ulid::new(), vehicle_id, t0 + 8 * H, t0 + 20 * H, None)
        .await
        .unwrap();
    let r = engine
        .create_reservation(&renter, request(vehicle_id, t0 + 9 * H, t0 + 12 * H))
        .await
        .unwrap();
    engine.confirm_reservation(&owner, r.id).await.unwrap();

    let code = engine.issue_code(&renter, r.id, Phase::Pickup).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    assert!(matches!(
        engine.pickup(&renter, r.id, &code.code, HandoverReport::default()).await,
        Err(EngineError::ExpiredOrInvalidCode)
    ));
    assert!(engine.otp.is_empty());
}

#[tokio::test]
async fn codes_follow_the_lifecycle() {
    let f = fixture("code_status_guard.wal").await;
    let e = &f.engine;
    let r = f.book(f.t0 + 9 * H, f.t0 + 12 * H).await.unwrap();

    // pending: no pickup code yet
    assert!(matches!(
        e.issue_code(&f.renter, r.id, Phase::Pickup).await,
        Err(EngineError::InvalidStateTransition { .. })
    ));
    e.confirm_reservation(&f.owner, r.id).await.unwrap();
    // confirmed: not out on a trip, so no return code
    assert!(matches!(
        e.issue_code(&f.renter, r.id, Phase::Return).await,
        Err(EngineError::InvalidStateTransition { .. })
    ));
    let stranger = Caller::member(Ulid::new());
    assert!(matches!(
        e.issue_code(&stranger, r.id, Phase::Pickup).await,
        Err(EngineError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn cancel_clears_codes_and_is_terminal() {
    let f = fixture("cancel.wal").await;
    let e = &f.engine;
    let r = f.booked_and_confirmed(f.t0 + 9 * H, f.t0 + 12 * H).await;
    e.issue_code(&f.renter, r.id, Phase::Pickup).await.unwrap();
    assert_eq!(e.otp.len(), 1);

    let r = e.cancel_reservation(&f.renter, r.id).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Cancelled);
    assert!(e.otp.is_empty());

    assert!(matches!(
        e.cancel_reservation(&f.owner, r.id).await,
        Err(EngineError::InvalidStateTransition {
            from: ReservationStatus::Cancelled,
            transition: Transition::Cancel
        })
    ));
    assert!(matches!(
        e.confirm_reservation(&f.owner, r.id).await,
        Err(EngineError::InvalidStateTransition { .. })
    ));

    // the slot is free again
    f.booked_and_confirmed(f.t0 + 9 * H, f.t0 + 12 * H).await;
}

#[tokio::test]
async fn ongoing_reservation_cannot_be_cancelled() {
    let f = fixture("cancel_ongoing.wal").await;
    let r = f
        .picked_up(f.t0 + 9 * H, f.t0 + 12 * H, HandoverReport::default())
        .await;
    assert!(matches!(
        f.engine.cancel_reservation(&f.renter, r.id).await,
        Err(EngineError::InvalidStateTransition { .. })
    ));
}

// ── Authorization ────────────────────────────────────────

#[tokio::test]
async fn parties_and_admins() {
    let f = fixture("authorization.wal").await;
    let e = &f.engine;
    let stranger = Caller::member(Ulid::new());
    let admin = Caller::admin(Ulid::new());
    let r = f.book(f.t0 + 9 * H, f.t0 + 12 * H).await.unwrap();

    assert!(matches!(
        e.confirm_reservation(&f.renter, r.id).await,
        Err(EngineError::Unauthorized(_))
    ));
    assert!(matches!(
        e.confirm_reservation(&admin, r.id).await,
        Err(EngineError::Unauthorized(_))
    ));
    assert!(matches!(
        e.cancel_reservation(&stranger, r.id).await,
        Err(EngineError::Unauthorized(_))
    ));
    assert!(matches!(
        e.get_reservation(&stranger, r.id).await,
        Err(EngineError::Unauthorized(_))
    ));
    assert_eq!(e.get_reservation(&admin, r.id).await.unwrap().id, r.id);
    assert_eq!(e.get_reservation(&f.owner, r.id).await.unwrap().id, r.id);

    assert!(matches!(
        e.dispute_reservation(&f.renter, r.id).await,
        Err(EngineError::Unauthorized(_))
    ));
    let r = e.dispute_reservation(&admin, r.id).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Disputed);
    assert!(matches!(
        e.confirm_reservation(&f.owner, r.id).await,
        Err(EngineError::InvalidStateTransition { .. })
    ));

    let missing = Ulid::new();
    assert!(matches!(
        e.get_reservation(&admin, missing).await,
        Err(EngineError::NotFound(id)) if id == missing
    ));
}

// ── Read paths ───────────────────────────────────────────

#[tokio::test]
async fn listings_are_scoped_to_the_caller() {
    let f = fixture("listings.wal").await;
    let e = &f.engine;

    let done = f
        .picked_up(f.t0 + 8 * H, f.t0 + 9 * H, HandoverReport::default())
        .await;
    let code = e.issue_code(&f.renter, done.id, Phase::Return).await.unwrap();
    e.return_vehicle(&f.renter, done.id, &code.code, ReturnReport::default())
        .await
        .unwrap();

    let ongoing = f
        .picked_up(f.t0 + 10 * H, f.t0 + 11 * H, HandoverReport::default())
        .await;
    let cancelled = f.book(f.t0 + 12 * H, f.t0 + 13 * H).await.unwrap();
    e.cancel_reservation(&f.renter, cancelled.id).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    let pending = f.book(f.t0 + 14 * H, f.t0 + 15 * H).await.unwrap();

    let mine = e
        .list_reservations(&f.renter, ReservationFilter::default())
        .await
        .unwrap();
    assert_eq!(mine.len(), 4);
    // newest first
    assert_eq!(mine[0].id, pending.id);

    let as_owner = ReservationFilter {
        role: Some(PartyRole::Owner),
        ..Default::default()
    };
    assert_eq!(e.list_reservations(&f.owner, as_owner).await.unwrap().len(), 4);
    assert!(e.list_reservations(&f.renter, as_owner).await.unwrap().is_empty());

    let only_pending = ReservationFilter {
        status: Some(ReservationStatus::Pending),
        ..Default::default()
    };
    let listed = e.list_reservations(&f.renter, only_pending).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, pending.id);

    let active = e.active_reservation(&f.renter).await.unwrap();
    assert_eq!(active.id, ongoing.id);
    assert!(e.active_reservation(&f.owner).await.is_none());

    let history: Vec<Ulid> = e
        .reservation_history(&f.renter)
        .await
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(history.len(), 2);
    assert!(history.contains(&done.id) && history.contains(&cancelled.id));

    let stranger = Caller::member(Ulid::new());
    assert!(e
        .list_reservations(&stranger, ReservationFilter::default())
        .await
        .unwrap()
        .is_empty());
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let owner = Caller::member(Ulid::new());
    let renter = Caller::member(Ulid::new());
    let t0 = day_start();
    let (vehicle_id, before) = {
        let engine = Engine::new(path.clone(), OtpStore::new(10 * MINUTE_MS, 100)).unwrap();
        let v = vehicle(owner.user_id);
        let vehicle_id = v.id;
        engine.register_vehicle(&owner, v).await.unwrap();
        engine
            .add_window(&owner, Ulid::new(), vehicle_id, t0 + 8 * H, t0 + 20 * H, None)
            .await
            .unwrap();
        let r = engine
            .create_reservation(&renter, request(vehicle_id, t0 + 9 * H, t0 + 12 * H))
            .await
            .unwrap();
        let r = engine.confirm_reservation(&owner, r.id).await.unwrap();
        (vehicle_id, r)
    };

    let engine = Engine::new(path, OtpStore::new(10 * MINUTE_MS, 100)).unwrap();
    let after = engine.get_reservation(&renter, before.id).await.unwrap();
    assert_eq!(after, before);
    assert!(matches!(
        engine
            .create_reservation(&renter, request(vehicle_id, t0 + 11 * H, t0 + 13 * H))
            .await,
        Err(EngineError::SchedulingConflict(_))
    ));
    assert_eq!(engine.active_reservation(&renter).await, None);
}

#[tokio::test]
async fn commits_after_torn_tail_survive_next_restart() {
    use std::io::Write as _;

    let path = test_wal_path("torn_restart.wal");
    let owner = Caller::member(Ulid::new());
    let first = vehicle(owner.user_id);
    {
        let engine = Engine::new(path.clone(), OtpStore::new(10 * MINUTE_MS, 100)).unwrap();
        engine.register_vehicle(&owner, first.clone()).await.unwrap();
    }
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&200u32.to_le_bytes()).unwrap();
        f.write_all(&[1, 2, 3]).unwrap();
    }

    let second = vehicle(owner.user_id);
    {
        let engine = Engine::new(path.clone(), OtpStore::new(10 * MINUTE_MS, 100)).unwrap();
        assert_eq!(engine.state.len(), 1);
        engine.register_vehicle(&owner, second.clone()).await.unwrap();
    }

    let engine = Engine::new(path, OtpStore::new(10 * MINUTE_MS, 100)).unwrap();
    assert_eq!(engine.get_vehicle_snapshot(first.id).await.unwrap(), first);
    assert_eq!(engine.get_vehicle_snapshot(second.id).await.unwrap(), second);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let f = {
        let engine = Engine::new(path.clone(), OtpStore::new(10 * MINUTE_MS, 100)).unwrap();
        let owner = Caller::member(Ulid::new());
        let renter = Caller::member(Ulid::new());
        let v = vehicle(owner.user_id);
        let vehicle_id = v.id;
        engine.register_vehicle(&owner, v).await.unwrap();
        let t0 = day_start();
        engine
            .add_window(&owner, Ulid::new(), vehicle_id, t0 + 8 * H, t0 + 20 * H, None)
            .await
            .unwrap();
        Fixture {
            engine,
            owner,
            renter,
            vehicle_id,
            t0,
        }
    };

    let done = f
        .picked_up(f.t0 + 9 * H, f.t0 + 10 * H, HandoverReport::default())
        .await;
    let code = f
        .engine
        .issue_code(&f.renter, done.id, Phase::Return)
        .await
        .unwrap();
    let done = f
        .engine
        .return_vehicle(&f.renter, done.id, &code.code, ReturnReport::default())
        .await
        .unwrap();
    let cancelled = f.book(f.t0 + 12 * H, f.t0 + 13 * H).await.unwrap();
    let cancelled = f
        .engine
        .cancel_reservation(&f.renter, cancelled.id)
        .await
        .unwrap();

    assert!(f.engine.wal_appends_since_compact().await > 0);
    f.engine.compact_wal().await.unwrap();
    assert_eq!(f.engine.wal_appends_since_compact().await, 0);

    // writes after compaction land in the new journal
    let later = f.booked_and_confirmed(f.t0 + 15 * H, f.t0 + 16 * H).await;
    drop(f.engine);

    let engine = Engine::new(path, OtpStore::new(10 * MINUTE_MS, 100)).unwrap();
    assert_eq!(engine.get_reservation(&f.renter, done.id).await.unwrap(), done);
    assert_eq!(
        engine.get_reservation(&f.renter, cancelled.id).await.unwrap(),
        cancelled
    );
    assert_eq!(engine.get_reservation(&f.owner, later.id).await.unwrap(), later);
    let windows = engine.list_windows(f.vehicle_id, None, None, None).await.unwrap();
    assert_eq!(windows.len(), 1);
}

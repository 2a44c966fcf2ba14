use super::*;
use crate::documents::{FsDocumentStore, Upload};
use crate::notify::{NotifyError, NotifyHub, StatusNotice};

use chrono::TimeZone;
use std::time::Duration;

const H: Ms = 3_600_000; // 1 hour in ms

fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roomd_test_engine").join(name);
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Local Jakarta wall-clock time on a day in May 2030.
fn at(day: u32, hh: u32, mm: u32) -> Ms {
    chrono_tz::Asia::Jakarta
        .with_ymd_and_hms(2030, 5, day, hh, mm, 0)
        .unwrap()
        .timestamp_millis()
}

fn rfc(day: u32, hh: u32, mm: u32) -> String {
    format!("2030-05-{day:02}T{hh:02}:{mm:02}:00+07:00")
}

fn user(name: &str) -> Caller {
    Caller {
        id: Ulid::new(),
        name: name.into(),
        email: format!("{}@kampus.ac.id", name.to_lowercase()),
        role: Role::User,
    }
}

fn admin() -> Caller {
    Caller {
        role: Role::Admin,
        ..user("Admin")
    }
}

struct Fixture {
    engine: Engine,
    hub: Arc<NotifyHub>,
    docs: PathBuf,
    wal: PathBuf,
    admin: Caller,
    room: Room,
}

fn open_engine(dir: &std::path::Path, notifier: Arc<dyn Notifier>) -> Engine {
    let documents = Arc::new(FsDocumentStore::new(dir.join("uploads")).unwrap());
    Engine::new(dir.join("roomd.wal"), notifier, documents, chrono_tz::Asia::Jakarta).unwrap()
}

async fn fixture(name: &str) -> Fixture {
    let dir = test_dir(name);
    let hub = Arc::new(NotifyHub::new());
    let engine = open_engine(&dir, hub.clone());
    let admin = admin();
    let room = engine
        .register_room(
            &admin,
            RoomSpec {
                name: Some("Ruang Seminar".into()),
                capacity: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    Fixture {
        engine,
        hub,
        docs: dir.join("uploads"),
        wal: dir.join("roomd.wal"),
        admin,
        room,
    }
}

fn request(room: &Room, start: String, end: String) -> BookingRequest {
    BookingRequest {
        room_id: Some(room.id.to_string()),
        activity_name: Some("Rapat Himpunan".into()),
        start_time: Some(start),
        end_time: Some(end),
        ..Default::default()
    }
}

fn slot(room: &Room, day: u32, from: u32, to: u32) -> BookingRequest {
    request(room, rfc(day, from, 0), rfc(day, to, 0))
}

/// A booking written straight to the log, bypassing validation.
fn raw_booking(room_id: Ulid, owner: &Caller, span: Span, status: BookingStatus) -> Booking {
    Booking {
        id: Ulid::new(),
        room_id,
        requester_id: owner.id,
        requester: Requester {
            name: owner.name.clone(),
            email: owner.email.clone(),
        },
        activity_name: "Imported".into(),
        purpose: None,
        span,
        participants_count: None,
        notes: None,
        contact_person: None,
        equipment: Vec::new(),
        document_path: None,
        status,
        history: Vec::new(),
        created_at: now_ms(),
        updated_at: now_ms(),
    }
}

async fn inject(engine: &Engine, booking: Booking) -> Ulid {
    let id = booking.id;
    let rs = engine.get_room(&booking.room_id).unwrap();
    let mut guard = rs.write().await;
    engine
        .persist_and_apply(&mut guard, &Event::BookingCreated { booking })
        .await
        .unwrap();
    id
}

fn upload(name: &str) -> Upload {
    Upload {
        file_name: name.into(),
        bytes: b"%PDF-1.4 surat izin".to_vec(),
    }
}

fn stored_files(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

// ── Creation ─────────────────────────────────────────────

#[tokio::test]
async fn valid_request_becomes_pending() {
    let f = fixture("valid_request").await;
    let alice = user("Alice");

    let b = f
        .engine
        .create_booking(&alice, slot(&f.room, 1, 9, 11))
        .await
        .unwrap();
    assert_eq!(b.status, BookingStatus::Pending);
    assert_eq!(b.room_id, f.room.id);
    assert_eq!(b.span, Span::new(at(1, 9, 0), at(1, 11, 0)));
    assert_eq!(b.requester.email, "alice@kampus.ac.id");
    assert!(b.history.is_empty());

    let fetched = f.engine.get_booking(&alice, b.id).await.unwrap();
    assert_eq!(fetched, b);
}

#[tokio::test]
async fn integer_millis_are_accepted() {
    let f = fixture("millis").await;
    let b = f
        .engine
        .create_booking(
            &user("Alice"),
            request(&f.room, at(1, 9, 0).to_string(), at(1, 10, 0).to_string()),
        )
        .await
        .unwrap();
    assert_eq!(b.span.duration_ms(), H);
}

#[tokio::test]
async fn loose_fields_are_kept() {
    let f = fixture("loose_fields").await;
    let mut req = slot(&f.room, 1, 9, 10);
    req.purpose = Some("Evaluasi program kerja".into());
    req.participants_count = Some(8);
    req.equipment = vec!["proyektor".into(), "mic".into()];
    req.contact_person = Some(ContactPerson {
        name: Some("Budi".into()),
        phone: Some("0812".into()),
        email: None,
    });
    let b = f.engine.create_booking(&user("Alice"), req).await.unwrap();
    assert_eq!(b.participants_count, Some(8));
    assert_eq!(b.equipment, vec!["proyektor", "mic"]);
    assert_eq!(b.contact_person.unwrap().name.as_deref(), Some("Budi"));
}

#[tokio::test]
async fn missing_fields_are_invalid_input() {
    let f = fixture("missing_fields").await;
    let req = BookingRequest {
        room_id: Some(f.room.id.to_string()),
        ..Default::default()
    };
    let err = f.engine.create_booking(&user("Alice"), req).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn unknown_inactive_or_malformed_room_is_not_found() {
    let f = fixture("room_not_found").await;
    let alice = user("Alice");

    let mut req = slot(&f.room, 1, 9, 10);
    req.room_id = Some(Ulid::new().to_string());
    let err = f.engine.create_booking(&alice, req).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: "room", .. }));

    let mut req = slot(&f.room, 1, 9, 10);
    req.room_id = Some("ruang-1".into());
    let err = f.engine.create_booking(&alice, req).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));

    f.engine
        .update_room(
            &f.admin,
            f.room.id,
            RoomPatch {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = f
        .engine
        .create_booking(&alice, slot(&f.room, 1, 9, 10))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn booking_the_past_is_refused() {
    let f = fixture("past").await;
    let err = f
        .engine
        .create_booking(
            &user("Alice"),
            request(
                &f.room,
                "2020-01-06T09:00:00+07:00".into(),
                "2020-01-06T10:00:00+07:00".into(),
            ),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("past"));
}

#[tokio::test]
async fn end_before_start_is_refused() {
    let f = fixture("reversed").await;
    let err = f
        .engine
        .create_booking(&user("Alice"), slot(&f.room, 1, 11, 9))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn capacity_ten_refuses_fifteen() {
    let f = fixture("capacity").await;
    let mut req = slot(&f.room, 1, 9, 10);
    req.participants_count = Some(15);
    let err = f.engine.create_booking(&user("Alice"), req).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::CapacityExceeded {
            requested: 15,
            capacity: 10
        }
    ));
}

#[tokio::test]
async fn operating_hours_and_multi_day_exemption() {
    let f = fixture("hours").await;
    let alice = user("Alice");

    let err = f
        .engine
        .create_booking(&alice, slot(&f.room, 1, 7, 9))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::OutOfOperatingHours { .. }));

    // Same wall-clock hours, two calendar dates.
    f.engine
        .create_booking(&alice, request(&f.room, rfc(1, 7, 0), rfc(2, 9, 0)))
        .await
        .unwrap();
}

#[tokio::test]
async fn document_is_stored_with_booking() {
    let f = fixture("document_create").await;
    let mut req = slot(&f.room, 1, 9, 10);
    req.document = Some(upload("surat.pdf"));
    let b = f.engine.create_booking(&user("Alice"), req).await.unwrap();
    let path = b.document_path.unwrap();
    assert!(path.ends_with(".pdf"));
    assert!(f.docs.join(&path).exists());
}

#[tokio::test]
async fn refused_request_stores_no_document() {
    let f = fixture("document_refused").await;
    let alice = user("Alice");
    f.engine
        .create_booking(&alice, slot(&f.room, 1, 9, 11))
        .await
        .unwrap();

    let mut req = slot(&f.room, 1, 10, 12);
    req.document = Some(upload("surat.pdf"));
    let err = f.engine.create_booking(&alice, req).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    assert_eq!(stored_files(&f.docs), 0);
}

// ── Conflicts ────────────────────────────────────────────

#[tokio::test]
async fn overlapping_request_conflicts() {
    let f = fixture("overlap").await;
    let first = f
        .engine
        .create_booking(&user("Alice"), slot(&f.room, 1, 9, 11))
        .await
        .unwrap();

    let err = f
        .engine
        .create_booking(&user("Bob"), slot(&f.room, 1, 10, 12))
        .await
        .unwrap_err();
    match err {
        EngineError::Conflict(summary) => {
            assert_eq!(summary.id, first.id);
            assert_eq!(summary.activity_name, "Rapat Himpunan");
            assert_eq!(summary.start, format_ms(at(1, 9, 0)));
        }
        other => panic!("expected Conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn adjacent_is_free_one_ms_overlap_is_not() {
    let f = fixture("adjacent").await;
    f.engine
        .create_booking(&user("Alice"), slot(&f.room, 1, 9, 10))
        .await
        .unwrap();

    f.engine
        .create_booking(&user("Bob"), slot(&f.room, 1, 10, 11))
        .await
        .unwrap();

    let err = f
        .engine
        .create_booking(
            &user("Carol"),
            request(
                &f.room,
                (at(1, 11, 0) - 1).to_string(),
                at(1, 12, 0).to_string(),
            ),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn cancelled_and_rejected_free_the_slot() {
    let f = fixture("freed_slot").await;
    let alice = user("Alice");
    let a = f
        .engine
        .create_booking(&alice, slot(&f.room, 1, 9, 10))
        .await
        .unwrap();
    f.engine.cancel_booking(&alice, a.id, None).await.unwrap();

    let bob = user("Bob");
    let b = f
        .engine
        .create_booking(&bob, slot(&f.room, 1, 9, 10))
        .await
        .unwrap();
    f.engine
        .set_status(&f.admin, b.id, BookingStatus::Rejected, Some("bentrok".into()))
        .await
        .unwrap();

    f.engine
        .create_booking(&user("Carol"), slot(&f.room, 1, 9, 10))
        .await
        .unwrap();
}

#[tokio::test]
async fn conflicts_are_per_room() {
    let f = fixture("per_room").await;
    let other = f
        .engine
        .register_room(
            &f.admin,
            RoomSpec {
                name: Some("Lab Komputer".into()),
                capacity: Some(30),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    f.engine
        .create_booking(&user("Alice"), slot(&f.room, 1, 9, 10))
        .await
        .unwrap();
    f.engine
        .create_booking(&user("Bob"), slot(&other, 1, 9, 10))
        .await
        .unwrap();
}

#[tokio::test]
async fn concurrent_requests_cannot_double_book() {
    let f = fixture("race").await;
    let engine = Arc::new(f.engine);

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        let req = slot(&f.room, 1, 9, 11);
        handles.push(tokio::spawn(async move {
            engine.create_booking(&user(&format!("User{i}")), req).await
        }));
    }
    let mut ok = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 15);
}

// ── Transitions ──────────────────────────────────────────

#[test]
fn transition_table() {
    use BookingStatus::*;
    for from in BookingStatus::ALL {
        for to in BookingStatus::ALL {
            let expected = match (from, to) {
                (Pending, Approved) | (Pending, Rejected) | (Approved, Completed) => Some(Actor::Admin),
                (Pending, Cancelled) | (Approved, Cancelled) => Some(Actor::Owner),
                _ => None,
            };
            assert_eq!(transition_actor(from, to), expected, "{from} -> {to}");
        }
    }
}

#[tokio::test]
async fn cancelling_twice_is_invalid_state() {
    let f = fixture("cancel_twice").await;
    let alice = user("Alice");
    let b = f
        .engine
        .create_booking(&alice, slot(&f.room, 1, 9, 10))
        .await
        .unwrap();
    let cancelled = f.engine.cancel_booking(&alice, b.id, None).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);

    let err = f.engine.cancel_booking(&alice, b.id, None).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState {
            current: BookingStatus::Cancelled,
            ..
        }
    ));
}

#[tokio::test]
async fn cancelling_rejected_is_invalid_state() {
    let f = fixture("cancel_rejected").await;
    let alice = user("Alice");
    let b = f
        .engine
        .create_booking(&alice, slot(&f.room, 1, 9, 10))
        .await
        .unwrap();
    f.engine
        .set_status(&f.admin, b.id, BookingStatus::Rejected, None)
        .await
        .unwrap();
    let err = f.engine.cancel_booking(&alice, b.id, None).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState {
            current: BookingStatus::Rejected,
            ..
        }
    ));
}

#[tokio::test]
async fn only_the_owner_cancels() {
    let f = fixture("cancel_owner").await;
    let b = f
        .engine
        .create_booking(&user("Alice"), slot(&f.room, 1, 9, 10))
        .await
        .unwrap();
    for caller in [user("Bob"), f.admin.clone()] {
        let err = f.engine.cancel_booking(&caller, b.id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));
    }
}

#[tokio::test]
async fn cancelling_a_started_booking_is_refused() {
    let f = fixture("cancel_started").await;
    let alice = user("Alice");
    let now = now_ms();
    let id = inject(
        &f.engine,
        raw_booking(f.room.id, &alice, Span::new(now - H, now + H), BookingStatus::Approved),
    )
    .await;
    let err = f.engine.cancel_booking(&alice, id, None).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
}

#[tokio::test]
async fn approved_cannot_become_rejected() {
    let f = fixture("approved_rejected").await;
    let b = f
        .engine
        .create_booking(&user("Alice"), slot(&f.room, 1, 9, 10))
        .await
        .unwrap();
    f.engine
        .set_status(&f.admin, b.id, BookingStatus::Approved, None)
        .await
        .unwrap();
    let err = f
        .engine
        .set_status(&f.admin, b.id, BookingStatus::Rejected, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState {
            current: BookingStatus::Approved,
            ..
        }
    ));

    let done = f
        .engine
        .set_status(&f.admin, b.id, BookingStatus::Completed, None)
        .await
        .unwrap();
    assert_eq!(done.status, BookingStatus::Completed);
    let err = f
        .engine
        .set_status(&f.admin, b.id, BookingStatus::Approved, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
}

#[tokio::test]
async fn pending_cannot_be_completed() {
    let f = fixture("pending_completed").await;
    let b = f
        .engine
        .create_booking(&user("Alice"), slot(&f.room, 1, 9, 10))
        .await
        .unwrap();
    let err = f
        .engine
        .set_status(&f.admin, b.id, BookingStatus::Completed, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState {
            current: BookingStatus::Pending,
            ..
        }
    ));
}

#[tokio::test]
async fn set_status_guards() {
    let f = fixture("set_status_guards").await;
    let alice = user("Alice");
    let b = f
        .engine
        .create_booking(&alice, slot(&f.room, 1, 9, 10))
        .await
        .unwrap();

    let err = f
        .engine
        .set_status(&alice, b.id, BookingStatus::Approved, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    for target in [BookingStatus::Pending, BookingStatus::Cancelled] {
        let err = f
            .engine
            .set_status(&f.admin, b.id, target, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    let err = f
        .engine
        .set_status(&f.admin, Ulid::new(), BookingStatus::Approved, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: "booking", .. }));
}

#[tokio::test]
async fn approval_race_second_approval_conflicts() {
    let f = fixture("approval_race").await;
    let alice = user("Alice");
    let bob = user("Bob");
    // Both requests passed their create-time checks before either was approved.
    let x = inject(
        &f.engine,
        raw_booking(f.room.id, &alice, Span::new(at(1, 9, 0), at(1, 11, 0)), BookingStatus::Pending),
    )
    .await;
    let y = inject(
        &f.engine,
        raw_booking(f.room.id, &bob, Span::new(at(1, 10, 0), at(1, 12, 0)), BookingStatus::Pending),
    )
    .await;

    f.engine
        .set_status(&f.admin, x, BookingStatus::Approved, None)
        .await
        .unwrap();
    let err = f
        .engine
        .set_status(&f.admin, y, BookingStatus::Approved, None)
        .await
        .unwrap_err();
    match err {
        EngineError::Conflict(summary) => assert_eq!(summary.id, x),
        other => panic!("expected Conflict, got {other:?}"),
    }

    // Rejecting the loser is still possible.
    f.engine
        .set_status(&f.admin, y, BookingStatus::Rejected, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn history_is_append_only() {
    let f = fixture("history").await;
    let alice = user("Alice");
    let b = f
        .engine
        .create_booking(&alice, slot(&f.room, 1, 9, 10))
        .await
        .unwrap();
    f.engine
        .set_status(&f.admin, b.id, BookingStatus::Approved, Some("ok".into()))
        .await
        .unwrap();
    let done = f
        .engine
        .set_status(&f.admin, b.id, BookingStatus::Completed, Some("  ".into()))
        .await
        .unwrap();

    assert_eq!(done.history.len(), 2);
    assert_eq!(done.history[0].from, BookingStatus::Pending);
    assert_eq!(done.history[0].to, BookingStatus::Approved);
    assert_eq!(done.history[0].note.as_deref(), Some("ok"));
    assert_eq!(done.history[0].actor, f.admin.id);
    assert_eq!(done.history[1].to, BookingStatus::Completed);
    assert_eq!(done.history[1].note, None);
    assert_eq!(done.latest_change().unwrap().to, BookingStatus::Completed);
    assert_eq!(done.updated_at, done.history[1].at);
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn transition_notifies_requester() {
    let f = fixture("notify").await;
    let alice = user("Alice");
    let mut rx = f.hub.subscribe();
    let b = f
        .engine
        .create_booking(&alice, slot(&f.room, 1, 9, 10))
        .await
        .unwrap();
    f.engine
        .set_status(&f.admin, b.id, BookingStatus::Approved, Some("silakan".into()))
        .await
        .unwrap();

    let notice = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notice.booking_id, b.id);
    assert_eq!(notice.from, BookingStatus::Pending);
    assert_eq!(notice.to, BookingStatus::Approved);
    assert_eq!(notice.requester_email, "alice@kampus.ac.id");
    assert_eq!(notice.note.as_deref(), Some("silakan"));
}

struct FailingNotifier;

#[async_trait::async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, _notice: &StatusNotice) -> Result<(), NotifyError> {
        Err(NotifyError("mail relay unreachable".into()))
    }
}

#[tokio::test]
async fn notify_failure_does_not_fail_transition() {
    let dir = test_dir("notify_failure");
    let engine = open_engine(&dir, Arc::new(FailingNotifier));
    let admin = admin();
    let room = engine
        .register_room(
            &admin,
            RoomSpec {
                name: Some("Aula".into()),
                capacity: Some(100),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let b = engine
        .create_booking(&user("Alice"), slot(&room, 1, 9, 10))
        .await
        .unwrap();
    let approved = engine
        .set_status(&admin, b.id, BookingStatus::Approved, None)
        .await
        .unwrap();
    assert_eq!(approved.status, BookingStatus::Approved);
}

// ── Editing ──────────────────────────────────────────────

#[tokio::test]
async fn edit_guards() {
    let f = fixture("edit_guards").await;
    let alice = user("Alice");
    let b = f
        .engine
        .create_booking(&alice, slot(&f.room, 1, 9, 10))
        .await
        .unwrap();
    let patch = BookingPatch {
        notes: Some(Some("bawa laptop".into())),
        ..Default::default()
    };

    let err = f
        .engine
        .update_booking(&user("Bob"), b.id, patch.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let err = f
        .engine
        .update_booking(&alice, b.id, BookingPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    f.engine
        .set_status(&f.admin, b.id, BookingStatus::Approved, None)
        .await
        .unwrap();
    let err = f.engine.update_booking(&alice, b.id, patch).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState {
            current: BookingStatus::Approved,
            ..
        }
    ));
}

#[tokio::test]
async fn editing_a_started_booking_is_refused() {
    let f = fixture("edit_started").await;
    let alice = user("Alice");
    let now = now_ms();
    let id = inject(
        &f.engine,
        raw_booking(f.room.id, &alice, Span::new(now - H, now + H), BookingStatus::Pending),
    )
    .await;
    let err = f
        .engine
        .update_booking(
            &alice,
            id,
            BookingPatch {
                notes: Some(Some("telat".into())),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
}

#[tokio::test]
async fn interval_edit_reruns_pipeline_excluding_itself() {
    let f = fixture("edit_interval").await;
    let alice = user("Alice");
    let b = f
        .engine
        .create_booking(&alice, slot(&f.room, 1, 9, 11))
        .await
        .unwrap();
    f.engine
        .create_booking(&user("Bob"), slot(&f.room, 1, 13, 14))
        .await
        .unwrap();

    // Overlaps only its own old slot.
    let moved = f
        .engine
        .update_booking(
            &alice,
            b.id,
            BookingPatch {
                start_time: Some(rfc(1, 10, 0)),
                end_time: Some(rfc(1, 12, 0)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(moved.span, Span::new(at(1, 10, 0), at(1, 12, 0)));

    let err = f
        .engine
        .update_booking(
            &alice,
            b.id,
            BookingPatch {
                end_time: Some(rfc(1, 13, 30)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    let err = f
        .engine
        .update_booking(
            &alice,
            b.id,
            BookingPatch {
                start_time: Some(rfc(1, 6, 0)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::OutOfOperatingHours { .. }));

    let unchanged = f.engine.get_booking(&alice, b.id).await.unwrap();
    assert_eq!(unchanged.span, moved.span);
}

#[tokio::test]
async fn field_only_edit_skips_slot_checks() {
    let f = fixture("edit_fields").await;
    let alice = user("Alice");
    let mut req = slot(&f.room, 1, 9, 10);
    req.participants_count = Some(8);
    let b = f.engine.create_booking(&alice, req).await.unwrap();

    // The room shrinks and its hours move after the request was made.
    f.engine
        .update_room(
            &f.admin,
            f.room.id,
            RoomPatch {
                capacity: Some(5),
                open_time: Some("12:00".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let edited = f
        .engine
        .update_booking(
            &alice,
            b.id,
            BookingPatch {
                notes: Some(Some("bawa laptop".into())),
                equipment: Some(vec!["sound system".into()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(edited.notes.as_deref(), Some("bawa laptop"));
    assert_eq!(edited.participants_count, Some(8));

    let err = f
        .engine
        .update_booking(
            &alice,
            b.id,
            BookingPatch {
                participants_count: Some(Some(7)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded { capacity: 5, .. }));

    let edited = f
        .engine
        .update_booking(
            &alice,
            b.id,
            BookingPatch {
                participants_count: Some(Some(4)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(edited.participants_count, Some(4));
}

#[tokio::test]
async fn edit_can_move_booking_to_another_room() {
    let f = fixture("edit_move").await;
    let alice = user("Alice");
    let lab = f
        .engine
        .register_room(
            &f.admin,
            RoomSpec {
                name: Some("Lab".into()),
                capacity: Some(20),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let taken = f
        .engine
        .create_booking(&user("Bob"), slot(&lab, 1, 9, 10))
        .await
        .unwrap();
    let b = f
        .engine
        .create_booking(&alice, slot(&f.room, 1, 9, 10))
        .await
        .unwrap();

    let err = f
        .engine
        .update_booking(
            &alice,
            b.id,
            BookingPatch {
                room_id: Some(lab.id.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    match err {
        EngineError::Conflict(summary) => assert_eq!(summary.id, taken.id),
        other => panic!("expected Conflict, got {other:?}"),
    }

    let moved = f
        .engine
        .update_booking(
            &alice,
            b.id,
            BookingPatch {
                room_id: Some(lab.id.to_string()),
                start_time: Some(rfc(1, 10, 0)),
                end_time: Some(rfc(1, 11, 0)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(moved.room_id, lab.id);
    assert_eq!(f.engine.room_for_booking(&b.id), Some(lab.id));

    let old = f.engine.get_room(&f.room.id).unwrap();
    assert!(old.read().await.booking(b.id).is_none());
    let new = f.engine.get_room(&lab.id).unwrap();
    assert_eq!(new.read().await.bookings.len(), 2);

    // The old slot is free again.
    f.engine
        .create_booking(&user("Carol"), slot(&f.room, 1, 9, 10))
        .await
        .unwrap();
}

#[tokio::test]
async fn edit_replaces_document_after_commit() {
    let f = fixture("edit_document").await;
    let alice = user("Alice");
    let mut req = slot(&f.room, 1, 9, 10);
    req.document = Some(upload("lama.pdf"));
    let b = f.engine.create_booking(&alice, req).await.unwrap();
    let old_path = b.document_path.clone().unwrap();

    let edited = f
        .engine
        .update_booking(
            &alice,
            b.id,
            BookingPatch {
                document: Some(upload("baru.pdf")),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let new_path = edited.document_path.unwrap();
    assert_ne!(new_path, old_path);
    assert!(f.docs.join(&new_path).exists());
    assert!(!f.docs.join(&old_path).exists());
}

// ── Deletion ─────────────────────────────────────────────

#[tokio::test]
async fn delete_requires_terminal_status_and_removes_document() {
    let f = fixture("delete").await;
    let alice = user("Alice");
    let mut req = slot(&f.room, 1, 9, 10);
    req.document = Some(upload("surat.pdf"));
    let b = f.engine.create_booking(&alice, req).await.unwrap();
    let path = b.document_path.clone().unwrap();

    let err = f.engine.delete_booking(&alice, b.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState {
            current: BookingStatus::Pending,
            ..
        }
    ));

    f.engine.cancel_booking(&alice, b.id, None).await.unwrap();
    f.engine.delete_booking(&alice, b.id).await.unwrap();

    assert!(!f.docs.join(&path).exists());
    assert!(matches!(
        f.engine.get_booking(&alice, b.id).await,
        Err(EngineError::NotFound { .. })
    ));
    assert_eq!(f.engine.room_for_booking(&b.id), None);
}

#[tokio::test]
async fn delete_by_owner_or_admin_only() {
    let f = fixture("delete_auth").await;
    let alice = user("Alice");
    let b = f
        .engine
        .create_booking(&alice, slot(&f.room, 1, 9, 10))
        .await
        .unwrap();
    f.engine
        .set_status(&f.admin, b.id, BookingStatus::Rejected, None)
        .await
        .unwrap();

    let err = f.engine.delete_booking(&user("Bob"), b.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    f.engine.delete_booking(&f.admin, b.id).await.unwrap();
    let err = f.engine.delete_booking(&f.admin, b.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

// ── Rooms ────────────────────────────────────────────────

#[tokio::test]
async fn room_registration_rules() {
    let f = fixture("rooms").await;
    let err = f
        .engine
        .register_room(
            &user("Alice"),
            RoomSpec {
                name: Some("Gudang".into()),
                capacity: Some(5),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let err = f
        .engine
        .register_room(
            &f.admin,
            RoomSpec {
                id: Some(f.room.id),
                name: Some("Duplikat".into()),
                capacity: Some(5),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists { .. }));

    for spec in [
        RoomSpec {
            name: Some("Tanpa kapasitas".into()),
            ..Default::default()
        },
        RoomSpec {
            name: Some("Nol".into()),
            capacity: Some(0),
            ..Default::default()
        },
        RoomSpec {
            name: Some("Terbalik".into()),
            capacity: Some(5),
            open_time: Some("17:00".into()),
            close_time: Some("08:00".into()),
            ..Default::default()
        },
        RoomSpec {
            name: Some("Zona".into()),
            capacity: Some(5),
            timezone: Some("Mars/Olympus".into()),
            ..Default::default()
        },
    ] {
        let err = f.engine.register_room(&f.admin, spec).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)), "{err}");
    }

    assert_eq!(f.room.timezone, "Asia/Jakarta");
    assert_eq!(f.room.hours, OperatingHours::default());
}

#[tokio::test]
async fn inactive_rooms_hidden_from_users() {
    let f = fixture("room_listing").await;
    f.engine
        .register_room(
            &f.admin,
            RoomSpec {
                name: Some("Aula Lama".into()),
                capacity: Some(50),
                active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(f.engine.list_rooms(&user("Alice")).await.len(), 1);
    let all = f.engine.list_rooms(&f.admin).await;
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].name, "Aula Lama");
}

// ── Listing & reporting ──────────────────────────────────

#[tokio::test]
async fn own_listing_filters_and_pages() {
    let f = fixture("own_listing").await;
    let alice = user("Alice");
    let bob = user("Bob");
    for day in 1..=12 {
        f.engine
            .create_booking(&alice, slot(&f.room, day, 9, 10))
            .await
            .unwrap();
    }
    let bobs = f
        .engine
        .create_booking(&bob, slot(&f.room, 1, 13, 14))
        .await
        .unwrap();
    let first = f
        .engine
        .list_own_bookings(&alice, &BookingQuery::default())
        .await
        .unwrap();
    assert_eq!(first.total, 12);
    assert_eq!(first.total_pages, 2);
    assert_eq!(first.items.len(), 10);
    assert!(first.items.iter().all(|b| b.requester_id == alice.id));

    // user_id in the query cannot widen the view.
    let sneaky = BookingQuery {
        user_id: Some(bob.id),
        ..Default::default()
    };
    let page = f.engine.list_own_bookings(&alice, &sneaky).await.unwrap();
    assert!(page.items.iter().all(|b| b.id != bobs.id));

    let by_start = BookingQuery {
        sort: SortField::StartTime,
        descending: false,
        page: 2,
        ..Default::default()
    };
    let page = f.engine.list_own_bookings(&alice, &by_start).await.unwrap();
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].span.start, at(11, 9, 0));

    f.engine
        .cancel_booking(&alice, first.items[0].id, None)
        .await
        .unwrap();
    let cancelled = BookingQuery {
        status: Some(BookingStatus::Cancelled),
        ..Default::default()
    };
    let page = f.engine.list_own_bookings(&alice, &cancelled).await.unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn admin_listing_searches_before_paging() {
    let f = fixture("admin_listing").await;
    let lab = f
        .engine
        .register_room(
            &f.admin,
            RoomSpec {
                name: Some("Lab Jaringan".into()),
                capacity: Some(20),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let alice = user("Alice");
    let bob = user("Bob");
    f.engine
        .create_booking(&alice, slot(&f.room, 1, 9, 10))
        .await
        .unwrap();
    f.engine
        .create_booking(&bob, slot(&f.room, 1, 10, 11))
        .await
        .unwrap();
    f.engine.create_booking(&bob, slot(&lab, 1, 9, 10)).await.unwrap();

    let err = f
        .engine
        .list_bookings(&alice, &BookingQuery::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let q = BookingQuery {
        search: Some("BOB".into()),
        limit: 1,
        ..Default::default()
    };
    let page = f.engine.list_bookings(&f.admin, &q).await.unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.total_pages, 2);

    let q = BookingQuery {
        search: Some("jaringan".into()),
        ..Default::default()
    };
    assert_eq!(f.engine.list_bookings(&f.admin, &q).await.unwrap().total, 1);

    let q = BookingQuery {
        room_id: Some(f.room.id),
        from: Some(at(1, 10, 0)),
        ..Default::default()
    };
    assert_eq!(f.engine.list_bookings(&f.admin, &q).await.unwrap().total, 1);

    let q = BookingQuery {
        user_id: Some(alice.id),
        to: Some(at(1, 10, 0)),
        ..Default::default()
    };
    assert_eq!(f.engine.list_bookings(&f.admin, &q).await.unwrap().total, 1);
}

#[tokio::test]
async fn statistics_counts_and_rate() {
    let f = fixture("statistics").await;
    let lab = f
        .engine
        .register_room(
            &f.admin,
            RoomSpec {
                name: Some("Lab".into()),
                capacity: Some(20),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let alice = user("Alice");
    let a = f
        .engine
        .create_booking(&alice, slot(&f.room, 1, 9, 10))
        .await
        .unwrap();
    let b = f
        .engine
        .create_booking(&alice, slot(&f.room, 1, 10, 11))
        .await
        .unwrap();
    f.engine.create_booking(&alice, slot(&lab, 1, 9, 10)).await.unwrap();
    f.engine
        .set_status(&f.admin, a.id, BookingStatus::Approved, None)
        .await
        .unwrap();
    f.engine
        .set_status(&f.admin, b.id, BookingStatus::Rejected, None)
        .await
        .unwrap();

    let err = f.engine.statistics(&alice, Period::Week).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let stats = f.engine.statistics(&f.admin, Period::Month).await.unwrap();
    assert_eq!(stats.period, "month");
    assert_eq!(stats.total, 3);
    assert_eq!(stats.by_status["approved"], 1);
    assert_eq!(stats.by_status["rejected"], 1);
    assert_eq!(stats.by_status["pending"], 1);
    assert_eq!(stats.by_status["completed"], 0);
    assert_eq!(stats.approval_rate, 33.33);
    assert_eq!(stats.top_rooms[0].room_id, f.room.id);
    assert_eq!(stats.top_rooms[0].count, 2);
    assert_eq!(stats.top_rooms[1].count, 1);
    assert_eq!(stats.trend.iter().map(|d| d.count).sum::<usize>(), 3);
}

#[tokio::test]
async fn statistics_empty_period() {
    let f = fixture("statistics_empty").await;
    let stats = f.engine.statistics(&f.admin, Period::Year).await.unwrap();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.approval_rate, 0.0);
    assert!(stats.top_rooms.is_empty());
    assert!(stats.trend.is_empty());
    assert_eq!(stats.by_status.len(), 5);
}

#[tokio::test]
async fn upcoming_lists_approved_soonest_first() {
    let f = fixture("upcoming").await;
    let alice = user("Alice");
    let now = now_ms();
    let later = inject(
        &f.engine,
        raw_booking(f.room.id, &alice, Span::new(now + 3 * 24 * H, now + 3 * 24 * H + H), BookingStatus::Approved),
    )
    .await;
    let sooner = inject(
        &f.engine,
        raw_booking(f.room.id, &alice, Span::new(now + 24 * H, now + 25 * H), BookingStatus::Approved),
    )
    .await;
    inject(
        &f.engine,
        raw_booking(f.room.id, &alice, Span::new(now + 2 * 24 * H, now + 2 * 24 * H + H), BookingStatus::Pending),
    )
    .await;
    inject(
        &f.engine,
        raw_booking(f.room.id, &alice, Span::new(now + 20 * 24 * H, now + 20 * 24 * H + H), BookingStatus::Approved),
    )
    .await;

    let list = f.engine.upcoming(&f.admin, 7).await.unwrap();
    let ids: Vec<Ulid> = list.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![sooner, later]);

    assert!(matches!(
        f.engine.upcoming(&f.admin, 0).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        f.engine.upcoming(&alice, 7).await,
        Err(EngineError::Forbidden(_))
    ));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let f = fixture("replay").await;
    let alice = user("Alice");
    let lab = f
        .engine
        .register_room(
            &f.admin,
            RoomSpec {
                name: Some("Lab".into()),
                capacity: Some(20),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let approved = f
        .engine
        .create_booking(&alice, slot(&f.room, 1, 9, 10))
        .await
        .unwrap();
    f.engine
        .set_status(&f.admin, approved.id, BookingStatus::Approved, Some("ok".into()))
        .await
        .unwrap();
    let moved = f
        .engine
        .create_booking(&alice, slot(&f.room, 2, 9, 10))
        .await
        .unwrap();
    f.engine
        .update_booking(
            &alice,
            moved.id,
            BookingPatch {
                room_id: Some(lab.id.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let deleted = f
        .engine
        .create_booking(&alice, slot(&f.room, 3, 9, 10))
        .await
        .unwrap();
    f.engine.cancel_booking(&alice, deleted.id, None).await.unwrap();
    f.engine.delete_booking(&alice, deleted.id).await.unwrap();
    f.engine
        .update_room(
            &f.admin,
            f.room.id,
            RoomPatch {
                name: Some("Ruang Sidang".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let before = f.engine.get_booking(&alice, approved.id).await.unwrap();
    let wal = f.wal.clone();
    drop(f.engine);

    let documents = Arc::new(FsDocumentStore::new(f.docs.clone()).unwrap());
    let engine = Engine::new(wal, f.hub.clone(), documents, chrono_tz::Asia::Jakarta).unwrap();

    assert_eq!(engine.get_booking(&alice, approved.id).await.unwrap(), before);
    assert_eq!(engine.room_for_booking(&moved.id), Some(lab.id));
    assert_eq!(engine.room_for_booking(&deleted.id), None);
    let room = engine.get_room(&f.room.id).unwrap();
    let guard = room.read().await;
    assert_eq!(guard.room.name, "Ruang Sidang");
    assert_eq!(guard.bookings.len(), 1);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let f = fixture("compaction").await;
    let alice = user("Alice");
    let mut ids = Vec::new();
    for day in 1..=5 {
        let b = f
            .engine
            .create_booking(&alice, slot(&f.room, day, 9, 10))
            .await
            .unwrap();
        f.engine
            .set_status(&f.admin, b.id, BookingStatus::Approved, None)
            .await
            .unwrap();
        ids.push(b.id);
    }
    assert!(f.engine.wal_appends_since_compact().await >= 10);

    f.engine.compact_wal().await.unwrap();
    assert_eq!(f.engine.wal_appends_since_compact().await, 0);

    let snapshot: Vec<Booking> = {
        let rs = f.engine.get_room(&f.room.id).unwrap();
        rs.read().await.bookings.clone()
    };
    let wal = f.wal.clone();
    drop(f.engine);

    let documents = Arc::new(FsDocumentStore::new(f.docs.clone()).unwrap());
    let engine = Engine::new(wal, f.hub.clone(), documents, chrono_tz::Asia::Jakarta).unwrap();
    let rs = engine.get_room(&f.room.id).unwrap();
    assert_eq!(rs.read().await.bookings, snapshot);
    for id in ids {
        let b = engine.get_booking(&alice, id).await.unwrap();
        assert_eq!(b.history.len(), 1);
    }
}

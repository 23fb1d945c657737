use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use docket::engine::{Action, Declaration, Engine, EngineError};
use docket::model::*;
use docket::notify::{Notice, NotifyHub};

const H: Ms = 3_600_000;
const M: Ms = 60_000;
const MONDAY: Ms = 20_003 * DAY_MS;

fn at(day: Ms, hour: Ms, minute: Ms) -> Ms {
    MONDAY + day * DAY_MS + hour * H + minute * M
}

fn w(start: Ms, end: Ms) -> Window {
    Window::new(start, end).unwrap()
}

fn journal(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("docket_it_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

/// A clinician working 09:00–17:00 every weekday for two weeks, with lunch
/// blocked out.
async fn clinician(engine: &Engine) -> Ulid {
    let provider = Ulid::new();
    for day in 0..5 {
        let morning = w(at(day, 9, 0), at(day, 12, 30));
        let lunch = w(at(day, 12, 30), at(day, 13, 30));
        let afternoon = w(at(day, 13, 30), at(day, 17, 0));
        assert_ok!(
            engine
                .declare_entry(
                    Declaration::new(provider, morning, EntryKind::Available)
                        .repeating(Frequency::Weekly, 2),
                )
                .await
        );
        assert_ok!(
            engine
                .declare_entry(
                    Declaration::new(provider, lunch, EntryKind::Break)
                        .repeating(Frequency::Weekly, 2)
                        .with_reason("lunch"),
                )
                .await
        );
        assert_ok!(
            engine
                .declare_entry(
                    Declaration::new(provider, afternoon, EntryKind::Available)
                        .repeating(Frequency::Weekly, 2),
                )
                .await
        );
    }
    provider
}

#[tokio::test]
async fn week_of_bookings() {
    let engine = Engine::new(journal("week.wal"), Arc::new(NotifyHub::new())).unwrap();
    let doctor = clinician(&engine).await;
    let patient = Ulid::new();

    let checkup = assert_ok!(
        engine
            .create_appointment(BookingRequest {
                visit_type: Some("Checkup".into()),
                ..BookingRequest::new(doctor, patient, w(at(0, 9, 0), at(0, 9, 30)))
            })
            .await
    );

    // Lunch and weekends are closed.
    assert_err!(book(&engine, doctor, at(1, 12, 45), at(1, 13, 15)).await);
    assert_err!(book(&engine, doctor, at(5, 10, 0), at(5, 10, 30)).await);
    // Second week is open, third is not.
    assert_ok!(book(&engine, doctor, at(7, 16, 0), at(7, 17, 0)).await);
    assert_err!(book(&engine, doctor, at(14, 9, 0), at(14, 9, 30)).await);

    let monday_open: Vec<_> = engine
        .open_slots(doctor, w(at(0, 0, 0), at(1, 0, 0)), Some(30 * M))
        .await
        .unwrap();
    assert_eq!(
        monday_open,
        vec![w(at(0, 9, 30), at(0, 12, 30)), w(at(0, 13, 30), at(0, 17, 0))]
    );

    let moved = assert_ok!(engine.reschedule(checkup.id, w(at(2, 14, 0), at(2, 14, 30))).await);
    assert_eq!(moved.visit_type, "Checkup");
    assert_eq!(engine.client_appointments(patient).await, vec![moved]);
}

async fn book(
    engine: &Engine,
    provider: Ulid,
    start: Ms,
    end: Ms,
) -> Result<Appointment, EngineError> {
    engine
        .create_appointment(BookingRequest::new(provider, Ulid::new(), w(start, end)))
        .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rush_for_the_same_slot() {
    let engine = Arc::new(Engine::new(journal("rush.wal"), Arc::new(NotifyHub::new())).unwrap());
    let doctor = clinician(&engine).await;

    let attempts = join_all((0..32).map(|_| {
        let engine = engine.clone();
        tokio::spawn(async move { book(&engine, doctor, at(3, 10, 0), at(3, 10, 30)).await })
    }))
    .await;

    let admitted = attempts
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|r| r.is_ok())
        .count();
    assert_eq!(admitted, 1);
}

#[tokio::test]
async fn dispatcher_sees_each_commit_once() {
    let hub = Arc::new(NotifyHub::new());
    let engine = Engine::new(journal("dispatch.wal"), hub.clone()).unwrap();
    let doctor = clinician(&engine).await;
    let mut firehose = hub.subscribe_all();

    let appt = assert_ok!(book(&engine, doctor, at(0, 10, 0), at(0, 10, 30)).await);
    assert_ok!(engine.cancel(appt.id).await);
    let again = assert_err!(engine.cancel(appt.id).await);
    assert!(matches!(
        again,
        EngineError::InvalidTransition { action: Action::Cancel, from: Status::Cancelled, .. }
    ));

    let first = firehose.recv().await.unwrap();
    assert!(matches!(first, Notice::Booked { .. }));
    let second = firehose.recv().await.unwrap();
    let payload: serde_json::Value = serde_json::from_str(&second.to_json().unwrap()).unwrap();
    assert_eq!(payload["notice"], "status_changed");
    assert_eq!(payload["previous"], "Scheduled");
    assert!(firehose.try_recv().is_err());
}

#[tokio::test]
async fn survives_restart_and_compaction() {
    let path = journal("restart.wal");
    let before = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let doctor = clinician(&engine).await;
        let a = assert_ok!(book(&engine, doctor, at(0, 9, 0), at(0, 9, 30)).await);
        assert_ok!(engine.confirm(a.id).await);
        assert_ok!(engine.compact_wal().await);
        let b = assert_ok!(book(&engine, doctor, at(0, 9, 30), at(0, 10, 0)).await);
        assert_ok!(engine.begin(b.id).await);
        (doctor, engine.provider_appointments(doctor, None).await.unwrap())
    };

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let (doctor, appointments) = before;
    assert_eq!(engine.provider_appointments(doctor, None).await.unwrap(), appointments);
    assert_eq!(engine.availability_entries(doctor).await.len(), 15);
    assert_err!(book(&engine, doctor, at(0, 9, 15), at(0, 9, 45)).await);
}

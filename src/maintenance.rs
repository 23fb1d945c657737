use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info};

use crate::engine::{now_ms, Engine};
use crate::model::Ms;

/// Mark every appointment overdue at `now` as a no-show. Returns how many
/// were moved. Appointments that changed since the scan are skipped.
pub async fn sweep_overdue(engine: &Engine, now: Ms, grace: Ms) -> usize {
    let overdue = engine.collect_overdue(now, grace);
    if overdue.is_empty() {
        return 0;
    }

    let results = join_all(overdue.iter().map(|id| engine.mark_no_show(*id))).await;
    let mut swept = 0;
    for (id, result) in overdue.iter().zip(results) {
        match result {
            Ok(_) => swept += 1,
            Err(e) => debug!("no-show sweep skip {id}: {e}"),
        }
    }
    if swept > 0 {
        metrics::counter!(crate::observability::NO_SHOWS_SWEPT_TOTAL).increment(swept as u64);
        info!("marked {swept} overdue appointments as no-show");
    }
    swept
}

/// Background task: sweep for no-shows every `every`.
pub async fn run_no_show_sweeper(engine: Arc<Engine>, grace: Ms, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_overdue(&engine, now_ms(), grace).await;
    }
}

/// Background task: compact the journal once it has grown past `threshold`
/// appends. Checked once a minute.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.tick().await;
    loop {
        interval.tick().await;
        let appended = engine.wal_appends_since_compact().await;
        if appended < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("journal compacted after {appended} appends"),
            Err(e) => tracing::error!("journal compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    const H: Ms = 3_600_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("docket_test_maintenance");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn sweeper_marks_only_overdue_open_appointments() {
        let path = test_wal_path("sweep.wal");
        let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();

        let provider = Ulid::new();
        let day = 20_000 * DAY_MS;
        engine
            .declare(provider, Window::new(day, day + 8 * H).unwrap(), EntryKind::Available)
            .await
            .unwrap();

        let book = |start: Ms| {
            let window = Window::new(day + start, day + start + H).unwrap();
            BookingRequest::new(provider, Ulid::new(), window)
        };
        let early = engine.create_appointment(book(0)).await.unwrap();
        let confirmed = engine.create_appointment(book(H)).await.unwrap();
        engine.confirm(confirmed.id).await.unwrap();
        let done = engine.create_appointment(book(2 * H)).await.unwrap();
        engine.complete(done.id).await.unwrap();
        let later = engine.create_appointment(book(6 * H)).await.unwrap();

        // Four hours in, with a 30 minute grace: the first two have ended long enough ago.
        let now = day + 4 * H;
        let swept = sweep_overdue(&engine, now, H / 2).await;
        assert_eq!(swept, 2);

        assert_eq!(engine.appointment(early.id).await.unwrap().status, Status::NoShow);
        assert_eq!(engine.appointment(confirmed.id).await.unwrap().status, Status::NoShow);
        assert_eq!(engine.appointment(done.id).await.unwrap().status, Status::Completed);
        assert_eq!(engine.appointment(later.id).await.unwrap().status, Status::Scheduled);

        // Nothing left to do on a second pass.
        assert_eq!(sweep_overdue(&engine, now, H / 2).await, 0);
    }

    #[tokio::test]
    async fn grace_period_respected() {
        let path = test_wal_path("grace.wal");
        let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
        let provider = Ulid::new();
        let start = 20_000 * DAY_MS;
        engine
            .declare(provider, Window::new(start, start + H).unwrap(), EntryKind::Available)
            .await
            .unwrap();
        let appt = engine
            .create_appointment(BookingRequest::new(
                provider,
                Ulid::new(),
                Window::new(start, start + H).unwrap(),
            ))
            .await
            .unwrap();

        assert!(engine.collect_overdue(start + H + 10, 60_000).is_empty());
        assert_eq!(engine.collect_overdue(start + H + 60_000, 60_000), vec![appt.id]);
    }
}

//! Store integration tests. These run only when `VIDRA_TEST_DATABASE_URL`
//! points at a disposable Postgres database; otherwise they skip.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use vidra_data::{
    CacheStore, JobStore, NewCachedVideo, NewJob, NewSubtitle, ProgressUpdate, QueueName,
    QueueStore, SubtitleStore,
};
use vidra_events::JobStatus;
use vidra_test_support::postgres;

async fn pool() -> Option<sqlx::PgPool> {
    let url = postgres::test_database_url()?;
    let pool = vidra_data::connect(&url).await.expect("connect");
    vidra_data::run_migrations(&pool).await.expect("migrations");
    Some(pool)
}

fn new_job() -> NewJob {
    NewJob {
        id: Uuid::new_v4(),
        video_id: Uuid::new_v4(),
        torrent_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        magnet_uri: vidra_test_support::fixtures::MAGNET.to_string(),
    }
}

#[tokio::test]
async fn job_initiation_is_idempotent_per_video_and_user() {
    let Some(pool) = pool().await else { return };
    let store = JobStore::new(pool);

    let first = new_job();
    let (created, was_new) = store.insert_pending(&first).await.unwrap();
    assert!(was_new);
    assert_eq!(created.status, JobStatus::Pending);

    // a second initiation for the same (video, user) returns the same job
    let duplicate = NewJob {
        id: Uuid::new_v4(),
        ..first.clone()
    };
    let (existing, was_new) = store.insert_pending(&duplicate).await.unwrap();
    assert!(!was_new);
    assert_eq!(existing.id, created.id);

    // once the first job terminates, a fresh one can be admitted
    store
        .transition(created.id, &JobStatus::Cancelled, Some("test"))
        .await
        .unwrap();
    let replacement = NewJob {
        id: Uuid::new_v4(),
        ..first
    };
    let (fresh, was_new) = store.insert_pending(&replacement).await.unwrap();
    assert!(was_new);
    assert_ne!(fresh.id, created.id);
}

#[tokio::test]
async fn transitions_maintain_timestamps_and_audit() {
    let Some(pool) = pool().await else { return };
    let store = JobStore::new(pool.clone());

    let (job, _) = store.insert_pending(&new_job()).await.unwrap();
    assert!(job.started_at.is_none());

    let downloading = store
        .transition(job.id, &JobStatus::Downloading, None)
        .await
        .unwrap();
    assert!(downloading.started_at.is_some());
    assert!(downloading.completed_at.is_none());

    let failed = store
        .transition(
            job.id,
            &JobStatus::Failed {
                message: "no peers".to_string(),
            },
            Some("engine"),
        )
        .await
        .unwrap();
    assert!(failed.completed_at.is_some());
    assert!(matches!(failed.status, JobStatus::Failed { ref message } if message == "no peers"));

    let (audit_rows,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM job_transitions WHERE job_id = $1")
            .bind(job.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(audit_rows, 3, "pending + downloading + failed");
}

#[tokio::test]
async fn progress_updates_stop_at_terminal_states() {
    let Some(pool) = pool().await else { return };
    let store = JobStore::new(pool);

    let (job, _) = store.insert_pending(&new_job()).await.unwrap();
    let update = ProgressUpdate {
        progress: 40.0,
        downloaded_bytes: 400,
        total_bytes: 1_000,
        download_speed_bps: 100,
        eta_seconds: Some(6),
        peers: 3,
        current_phase: Some("DOWNLOADING".to_string()),
        available_bytes: 256,
    };
    store.update_progress(job.id, &update).await.unwrap();
    let live = store.fetch(job.id).await.unwrap().unwrap();
    assert!((live.progress - 40.0).abs() < f64::EPSILON);
    assert_eq!(live.available_bytes, 256);

    store
        .transition(job.id, &JobStatus::Cancelled, None)
        .await
        .unwrap();
    store
        .update_progress(
            job.id,
            &ProgressUpdate {
                progress: 99.0,
                ..update
            },
        )
        .await
        .unwrap();
    let frozen = store.fetch(job.id).await.unwrap().unwrap();
    assert!(
        (frozen.progress - 40.0).abs() < f64::EPSILON,
        "terminal jobs must not move"
    );
}

#[tokio::test]
async fn queue_orders_by_priority_and_honours_leases() {
    let Some(pool) = pool().await else { return };
    let store = QueueStore::new(pool);
    let ttl = Duration::from_secs(60);
    let marker = Uuid::new_v4().to_string();

    store
        .enqueue(QueueName::Download, &json!({"m": marker, "n": 1}), 3, ttl)
        .await
        .unwrap();
    store
        .enqueue(QueueName::Download, &json!({"m": marker, "n": 2}), 9, ttl)
        .await
        .unwrap();

    let first = store
        .dequeue(QueueName::Download, Duration::from_secs(30))
        .await
        .unwrap()
        .expect("a message is deliverable");
    assert_eq!(first.payload["n"], 2, "higher priority first");

    let second = store
        .dequeue(QueueName::Download, Duration::from_secs(30))
        .await
        .unwrap()
        .expect("the lower-priority message follows");
    assert_eq!(second.payload["n"], 1);

    // both are leased now; nothing further is deliverable
    assert!(
        store
            .dequeue(QueueName::Download, Duration::from_secs(30))
            .await
            .unwrap()
            .is_none()
    );

    store.ack(first.id).await.unwrap();
    store.ack(second.id).await.unwrap();
}

#[tokio::test]
async fn expired_queue_messages_are_never_delivered() {
    let Some(pool) = pool().await else { return };
    let store = QueueStore::new(pool);

    store
        .enqueue(
            QueueName::Conversion,
            &json!({"job": Uuid::new_v4()}),
            5,
            Duration::from_secs(0),
        )
        .await
        .unwrap();

    assert!(
        store
            .dequeue(QueueName::Conversion, Duration::from_secs(30))
            .await
            .unwrap()
            .is_none(),
        "expired messages must stay invisible"
    );
    let purged = store.purge_expired().await.unwrap();
    assert!(purged >= 1);
}

#[tokio::test]
async fn cache_upserts_touch_and_evicts_conditionally() {
    let Some(pool) = pool().await else { return };
    let store = CacheStore::new(pool);

    let new = NewCachedVideo {
        id: Uuid::new_v4(),
        video_id: Uuid::new_v4(),
        torrent_id: Uuid::new_v4(),
        file_path: "/var/lib/vidra/videos/x/feature.mp4".to_string(),
        file_size: 4_096,
        format: Some("mp4".to_string()),
        codec: Some("h264".to_string()),
        resolution: Some("1920x1080".to_string()),
        duration_seconds: Some(5_400),
        bitrate: Some(2_000_000),
        expires_at: Utc::now() + chrono::Duration::days(30),
    };
    let record = store.upsert(&new).await.unwrap();
    assert_eq!(record.access_count, 0);

    store.touch(record.id).await.unwrap();
    let touched = store.fetch(record.id).await.unwrap().unwrap();
    assert_eq!(touched.access_count, 1);
    assert!(touched.last_accessed_at >= record.last_accessed_at);

    // an eviction decided against the pre-touch timestamp must not fire
    assert!(
        !store
            .delete_if_untouched(record.id, record.last_accessed_at)
            .await
            .unwrap()
    );
    assert!(
        store
            .delete_if_untouched(touched.id, touched.last_accessed_at)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn subtitles_are_unique_per_video_and_language() {
    let Some(pool) = pool().await else { return };
    let store = SubtitleStore::new(pool);
    let video_id = Uuid::new_v4();

    let new = NewSubtitle {
        id: Uuid::new_v4(),
        video_id,
        language_code: "en".to_string(),
        file_path: "/var/lib/vidra/subtitles/v/en.vtt".to_string(),
        format: "vtt".to_string(),
        source: Some("upload".to_string()),
    };
    let first = store.upsert(&new).await.unwrap();

    let replacement = NewSubtitle {
        id: Uuid::new_v4(),
        file_path: "/var/lib/vidra/subtitles/v/en2.vtt".to_string(),
        ..new
    };
    let second = store.upsert(&replacement).await.unwrap();
    assert_eq!(second.id, first.id, "the row is replaced, not duplicated");
    assert_eq!(second.file_path, "/var/lib/vidra/subtitles/v/en2.vtt");

    let listed = store.list_for_video(video_id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(store.fetch(video_id, "en").await.unwrap().is_some());
    assert!(store.fetch(video_id, "fr").await.unwrap().is_none());
}

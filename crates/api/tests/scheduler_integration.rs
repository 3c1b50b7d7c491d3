use std::time::Duration;

use api::{Event, Scheduler, SchedulerConfig};
use engine::task::TaskStatus;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn small_file_config() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_downloads: 2,
        connections_per_file: 1,
        network_timeout: Duration::from_secs(5),
        max_retries: 1,
        retry_delay: Duration::from_millis(10),
        exponential_backoff: false,
        min_chunk_size: 1,
        store_write_interval: Duration::from_secs(30),
    }
}

async fn mount_small_file(server: &MockServer, name: &str, body: &[u8]) {
    let p = format!("/{name}");
    Mock::given(method("HEAD"))
        .and(path(p.clone()))
        .respond_with(
            ResponseTemplate::new(200).insert_header("content-length", body.len().to_string()),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(p))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

#[tokio::test]
async fn admission_cap_bounds_concurrent_downloads_and_drains_the_queue() {
    let server = MockServer::start().await;
    for i in 0..5 {
        mount_small_file(&server, &format!("f{i}.bin"), b"payload").await;
    }

    let dir = tempfile::tempdir().unwrap();
    let scheduler = Scheduler::new(small_file_config(), dir.path().join("tasks.json"));
    let mut events = scheduler.subscribe();

    let mut ids = Vec::new();
    for i in 0..5 {
        let id = scheduler
            .add(
                format!("{}/f{i}.bin", server.uri()),
                dir.path().join("out").to_string_lossy().to_string(),
                Some(format!("f{i}.bin")),
                Some(1),
            )
            .await
            .unwrap();
        ids.push(id);
    }

    let wait = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(Event::AllTasksCompleted) = events.recv().await {
                break;
            }
        }
    })
    .await;
    assert!(wait.is_ok(), "expected AllTasksCompleted within timeout");

    for id in ids {
        let task = scheduler.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }
}

#[tokio::test]
async fn persisted_state_survives_a_scheduler_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("tasks.json");

    let waiting_id;
    {
        // max_concurrent=0 keeps every add() in Waiting -- nothing starts.
        let mut config = small_file_config();
        config.max_concurrent_downloads = 0;
        let scheduler = Scheduler::new(config, store_path.clone());
        waiting_id = scheduler
            .add(
                "https://example.invalid/never-fetched".to_string(),
                dir.path().to_string_lossy().to_string(),
                Some("never.bin".to_string()),
                Some(1),
            )
            .await
            .unwrap();
        scheduler.shutdown().await;
    }

    let reloaded = Scheduler::new(small_file_config(), store_path);
    let task = reloaded.get(waiting_id).unwrap();
    assert_eq!(task.status, TaskStatus::Waiting);
}

#[tokio::test]
async fn pausing_an_already_paused_task_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = small_file_config();
    config.max_concurrent_downloads = 0;
    let scheduler = Scheduler::new(config, dir.path().join("tasks.json"));

    let id = scheduler
        .add(
            "https://example.invalid/file".to_string(),
            dir.path().to_string_lossy().to_string(),
            Some("file.bin".to_string()),
            Some(1),
        )
        .await
        .unwrap();

    // Task never starts (no free slot), so it stays Waiting; pausing a
    // non-downloading task must be a harmless no-op either way.
    scheduler.pause(id).await.unwrap();
    scheduler.pause(id).await.unwrap();
    let task = scheduler.get(id).unwrap();
    assert_eq!(task.status, TaskStatus::Waiting);
}

#[tokio::test]
async fn adding_when_destination_exists_is_rejected_synchronously() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("existing.bin"), b"already here").unwrap();

    let scheduler = Scheduler::new(small_file_config(), dir.path().join("tasks.json"));
    let result = scheduler
        .add(
            "https://example.invalid/existing.bin".to_string(),
            dir.path().to_string_lossy().to_string(),
            Some("existing.bin".to_string()),
            Some(1),
        )
        .await;
    assert!(result.is_err());
}

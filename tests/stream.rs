mod common;

use common::*;
use jobtail::core::{JobLog, JobStatus, JobType, LogLevel};
use jobtail::web::ServerMessage;

fn log_ids(messages: &[ServerMessage]) -> Vec<u64> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Log { data } => Some(data.id),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn live_viewer_sees_logs_progress_and_completion() {
    let server = spawn_server().await;
    let registry = server.registry();
    let job = registry.create(JobType::Backup, "vm-web").await.unwrap();
    registry.start(job.id).await.unwrap();

    let mut ws = server.connect(job.id, VIEWER).await;
    assert_eq!(
        recv(&mut ws).await,
        ServerMessage::Connected {
            status: JobStatus::Running
        }
    );

    for msg in ["snapshot taken", "copying vda", "copy done"] {
        registry
            .append_log(job.id, LogLevel::Info, msg, None)
            .await
            .unwrap();
    }
    registry
        .update_progress(job.id, disk_snapshot(40.0))
        .await
        .unwrap();
    registry
        .complete(job.id, JobStatus::Completed, None)
        .await
        .unwrap();

    let (messages, code) = recv_until_close(&mut ws).await;
    assert_eq!(code, 1000);
    assert_eq!(log_ids(&messages), vec![1, 2, 3]);
    assert!(matches!(messages[3], ServerMessage::Progress { .. }));
    assert_eq!(
        messages.last(),
        Some(&ServerMessage::Complete {
            status: JobStatus::Completed
        })
    );
}

#[tokio::test]
async fn viewer_attached_while_pending_sees_the_whole_lifecycle() {
    let server = spawn_server().await;
    let registry = server.registry();
    let job = registry.create(JobType::Backup, "vm-web").await.unwrap();

    let mut ws = server.connect(job.id, VIEWER).await;
    assert_eq!(
        recv(&mut ws).await,
        ServerMessage::Connected {
            status: JobStatus::Pending
        }
    );

    registry.start(job.id).await.unwrap();
    for msg in ["preparing", "copying vda", "disk read error"] {
        registry
            .append_log(job.id, LogLevel::Info, msg, None)
            .await
            .unwrap();
    }
    registry
        .complete(job.id, JobStatus::Failed, Some("disk read error".into()))
        .await
        .unwrap();

    let (messages, code) = recv_until_close(&mut ws).await;
    assert_eq!(code, 1000);
    assert_eq!(
        messages[0],
        ServerMessage::Status {
            status: JobStatus::Running
        }
    );
    assert_eq!(log_ids(&messages), vec![1, 2, 3]);
    assert_eq!(
        messages.last(),
        Some(&ServerMessage::Complete {
            status: JobStatus::Failed
        })
    );
    assert_eq!(messages.len(), 5);

    let stored = registry.get(job.id).await.unwrap();
    assert_eq!(stored.error_message.as_deref(), Some("disk read error"));
}

#[tokio::test]
async fn late_viewer_gets_backlog_then_live_logs() {
    let server = spawn_server().await;
    let registry = server.registry();
    let job = registry.create(JobType::Restore, "vm-db").await.unwrap();
    registry.start(job.id).await.unwrap();
    for i in 0..3 {
        registry
            .append_log(job.id, LogLevel::Info, format!("line {i}"), None)
            .await
            .unwrap();
    }
    registry
        .update_progress(job.id, disk_snapshot(10.0))
        .await
        .unwrap();

    let mut ws = server.connect(job.id, VIEWER).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Connected { .. }));
    let mut replayed = Vec::new();
    for _ in 0..3 {
        replayed.push(recv(&mut ws).await);
    }
    assert_eq!(log_ids(&replayed), vec![1, 2, 3]);
    assert!(matches!(recv(&mut ws).await, ServerMessage::Progress { .. }));

    registry
        .append_log(job.id, LogLevel::Warning, "slow disk", None)
        .await
        .unwrap();
    match recv(&mut ws).await {
        ServerMessage::Log { data } => {
            assert_eq!(data.id, 4);
            assert_eq!(data.level, LogLevel::Warning);
        }
        other => panic!("expected log, got {other:?}"),
    }
}

#[tokio::test]
async fn expired_token_is_closed_with_4001_and_nothing_else() {
    let server = spawn_server().await;
    let job = server
        .registry()
        .create(JobType::Backup, "vm-web")
        .await
        .unwrap();

    let mut ws = server.connect(job.id, EXPIRED).await;
    let (messages, code) = recv_until_close(&mut ws).await;
    assert_eq!(code, 4001);
    assert!(messages.is_empty());
    assert_eq!(server.registry().subscriber_count(job.id), 0);
}

#[tokio::test]
async fn missing_token_is_closed_with_4001() {
    let server = spawn_server().await;
    let job = server
        .registry()
        .create(JobType::Backup, "vm-web")
        .await
        .unwrap();

    let mut ws = server.connect(job.id, "").await;
    assert_eq!(recv_until_close(&mut ws).await.1, 4001);
}

#[tokio::test]
async fn viewer_without_access_is_closed_with_4003() {
    let server = spawn_server().await;
    let job = server
        .registry()
        .create(JobType::Backup, "vm-web")
        .await
        .unwrap();

    let mut ws = server.connect(job.id, SCOPED).await;
    let (messages, code) = recv_until_close(&mut ws).await;
    assert_eq!(code, 4003);
    assert!(messages.is_empty());
}

#[tokio::test]
async fn unknown_or_malformed_job_is_closed_with_4004() {
    let server = spawn_server().await;

    let mut ws = server.connect(999, VIEWER).await;
    assert_eq!(recv_until_close(&mut ws).await.1, 4004);

    let mut ws = server.connect_raw("not-a-number", VIEWER).await;
    assert_eq!(recv_until_close(&mut ws).await.1, 4004);
}

#[tokio::test]
async fn finished_job_is_closed_with_4004_and_served_over_rest() {
    let server = spawn_server().await;
    let registry = server.registry();
    let job = registry.create(JobType::Backup, "vm-web").await.unwrap();
    registry.start(job.id).await.unwrap();
    registry
        .append_log(job.id, LogLevel::Info, "start", None)
        .await
        .unwrap();
    registry
        .append_log(job.id, LogLevel::Error, "disk read error", None)
        .await
        .unwrap();
    registry
        .complete(job.id, JobStatus::Failed, Some("disk read error".into()))
        .await
        .unwrap();

    let mut ws = server.connect(job.id, VIEWER).await;
    let (messages, code) = recv_until_close(&mut ws).await;
    assert_eq!(code, 4004);
    assert!(messages.is_empty());

    let http = reqwest::Client::new();
    let history: Vec<JobLog> = http
        .get(server.http(&format!("/jobs/{}/logs", job.id)))
        .bearer_auth(VIEWER)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history, server.store.list_logs(job.id, None).await.unwrap());
    assert_eq!(history.len(), 2);

    let errors: Vec<JobLog> = http
        .get(server.http(&format!("/jobs/{}/logs?level=ERROR", job.id)))
        .bearer_auth(VIEWER)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "disk read error");

    let tail: Vec<JobLog> = http
        .get(server.http(&format!("/jobs/{}/logs?after=1", job.id)))
        .bearer_auth(VIEWER)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(tail, history[1..].to_vec());
}

#[tokio::test]
async fn history_matches_what_was_streamed() {
    let server = spawn_server().await;
    let registry = server.registry();
    let job = registry.create(JobType::Export, "vm-web").await.unwrap();
    registry.start(job.id).await.unwrap();

    let mut ws = server.connect(job.id, VIEWER).await;
    recv(&mut ws).await;

    for i in 0..20 {
        let level = if i % 5 == 0 { LogLevel::Debug } else { LogLevel::Info };
        registry
            .append_log(job.id, level, format!("step {i}"), None)
            .await
            .unwrap();
    }
    registry
        .complete(job.id, JobStatus::Completed, None)
        .await
        .unwrap();

    let (messages, _) = recv_until_close(&mut ws).await;
    let streamed: Vec<JobLog> = messages
        .into_iter()
        .filter_map(|m| match m {
            ServerMessage::Log { data } => Some(data),
            _ => None,
        })
        .collect();

    let history = server.ctx.history.logs(job.id, None).await.unwrap();
    assert_eq!(streamed, history);
}

#[tokio::test]
async fn rejected_progress_never_reaches_viewers() {
    let server = spawn_server().await;
    let registry = server.registry();
    let job = registry.create(JobType::Backup, "vm-web").await.unwrap();
    registry.start(job.id).await.unwrap();

    let mut ws = server.connect(job.id, VIEWER).await;
    recv(&mut ws).await;

    registry
        .update_progress(job.id, disk_snapshot(40.0))
        .await
        .unwrap();
    assert!(
        registry
            .update_progress(job.id, disk_snapshot(25.0))
            .await
            .is_err()
    );
    registry
        .update_progress(job.id, disk_snapshot(60.0))
        .await
        .unwrap();

    let percents: Vec<f64> = [recv(&mut ws).await, recv(&mut ws).await]
        .into_iter()
        .map(|m| match m {
            ServerMessage::Progress { data } => data.disks[0].percent,
            other => panic!("expected progress, got {other:?}"),
        })
        .collect();
    assert_eq!(percents, vec![40.0, 60.0]);
    assert_eq!(
        registry.progress(job.id).await.unwrap().disks[0].percent,
        60.0
    );
}

#[tokio::test]
async fn slow_viewer_is_told_and_closed() {
    let server = spawn_server_with(|config| config.stream.subscriber_buffer = 2).await;
    let registry = server.registry();
    let job = registry.create(JobType::Backup, "vm-web").await.unwrap();
    registry.start(job.id).await.unwrap();

    let mut ws = server.connect(job.id, VIEWER).await;
    recv(&mut ws).await;

    // The session task cannot run until this burst yields, so its buffer
    // overflows.
    for i in 0..10 {
        registry
            .append_log(job.id, LogLevel::Info, format!("burst {i}"), None)
            .await
            .unwrap();
    }

    let (messages, code) = recv_until_close(&mut ws).await;
    assert_eq!(code, 1000);
    assert_eq!(
        messages.last(),
        Some(&ServerMessage::Error {
            message: "backpressure: client too slow".into()
        })
    );
    assert_eq!(registry.subscriber_count(job.id), 0);

    // The job itself is unaffected.
    registry
        .append_log(job.id, LogLevel::Info, "still going", None)
        .await
        .unwrap();
}

#[tokio::test]
async fn viewer_disconnect_releases_subscription() {
    let server = spawn_server().await;
    let registry = server.registry();
    let job = registry.create(JobType::Backup, "vm-web").await.unwrap();

    let mut ws = server.connect(job.id, VIEWER).await;
    recv(&mut ws).await;
    wait_for_viewers(registry, job.id, 1).await;

    ws.close(None).await.unwrap();
    wait_for_viewers(registry, job.id, 0).await;
}

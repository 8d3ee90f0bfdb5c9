use std::sync::Arc;

use jobtail::core::{
    Delivery, JobEvent, JobRegistry, JobStatus, JobType, LogLevel, RegistrySettings,
};
use jobtail::db::{LogStore, MemoryLogStore};

async fn registry() -> JobRegistry {
    let store: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
    JobRegistry::open(store, RegistrySettings::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn one_stalled_viewer_among_fifty_is_the_only_casualty() {
    let registry = registry().await;
    let job = registry.create(JobType::Backup, "vm-web").await.unwrap();
    registry.start(job.id).await.unwrap();

    let mut fast = Vec::new();
    for _ in 0..49 {
        fast.push(registry.attach(job.id).await.unwrap().0);
    }
    let (mut stalled, _) = registry.attach(job.id).await.unwrap();
    assert_eq!(registry.subscriber_count(job.id), 50);

    let mut received = vec![0u64; fast.len()];
    for batch in 0..6 {
        for i in 0..100 {
            registry
                .append_log(job.id, LogLevel::Info, format!("{batch}/{i}"), None)
                .await
                .unwrap();
        }
        for (sub, count) in fast.iter_mut().zip(received.iter_mut()) {
            while let Some(delivery) = sub.try_next() {
                match delivery {
                    Delivery::Event(JobEvent::Log(log)) => {
                        *count += 1;
                        assert_eq!(log.id, *count);
                    }
                    Delivery::Event(_) => {}
                    other => panic!("fast viewer lost its stream: {other:?}"),
                }
            }
        }
    }

    assert!(received.iter().all(|&n| n == 600));
    assert!(matches!(stalled.try_next(), Some(Delivery::Evicted)));
    assert_eq!(registry.subscriber_count(job.id), 49);

    registry
        .complete(job.id, JobStatus::Completed, None)
        .await
        .unwrap();
    for sub in &mut fast {
        assert!(matches!(
            sub.next().await,
            Delivery::Event(JobEvent::Complete {
                status: JobStatus::Completed
            })
        ));
    }
}

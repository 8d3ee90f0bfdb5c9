//! Per-job fan-out of log, progress and status events.
//!
//! Every active job owns one [`Broadcaster`]. The registry is its only
//! publisher and calls [`Broadcaster::publish`] while holding the job's
//! mutation lock, so the publish order is the job's event order. All shared
//! state (subscriber table, backlog, latest progress) sits behind a single
//! mutex; delivery uses `try_send` so publishing never waits on a viewer.
//!
//! A subscriber whose delivery buffer is full is evicted rather than
//! allowed to hold the job back. Eviction removes its sender and trips its
//! eviction token; the session notices, reports the reason to the viewer
//! and closes. Nothing is removed from the backlog or the durable log.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::models::{JobId, JobLog, JobStatus};
use super::progress::JobProgress;

/// Reason given to a viewer dropped for not keeping up.
pub const BACKPRESSURE_REASON: &str = "backpressure: client too slow";

pub type SubscriberId = Uuid;

/// Events fanned out to subscribers, in publish order.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Log(JobLog),
    Progress(JobProgress),
    /// Non-terminal status change.
    Status(JobStatus),
    /// Terminal transition. Always the last event of a job.
    Complete { status: JobStatus },
}

/// Buffer sizes for one broadcaster.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastSettings {
    /// Number of log events kept for replay to late subscribers.
    pub backlog_capacity: usize,
    /// Per-subscriber delivery buffer. Overflow evicts the subscriber.
    pub subscriber_buffer: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            backlog_capacity: 500,
            subscriber_buffer: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BroadcastError {
    #[error("job {0} has finished streaming")]
    Closed(JobId),
}

/// State handed to a new subscriber, consistent with the first event it
/// will receive on its channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    pub status: JobStatus,
    pub logs: Vec<JobLog>,
    pub progress: Option<JobProgress>,
}

/// Outcome of a single publish, mostly useful for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub evicted: usize,
}

struct Subscriber {
    tx: mpsc::Sender<JobEvent>,
    evicted: CancellationToken,
}

struct Inner {
    status: JobStatus,
    backlog: VecDeque<JobLog>,
    progress: Option<JobProgress>,
    subscribers: HashMap<SubscriberId, Subscriber>,
    closed: bool,
}

pub struct Broadcaster {
    job_id: JobId,
    settings: BroadcastSettings,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Broadcaster")
            .field("job_id", &self.job_id)
            .field("status", &inner.status)
            .field("subscribers", &inner.subscribers.len())
            .field("backlog", &inner.backlog.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

impl Broadcaster {
    pub fn new(job_id: JobId, status: JobStatus, settings: BroadcastSettings) -> Arc<Self> {
        Arc::new(Self {
            job_id,
            settings,
            inner: Mutex::new(Inner {
                status,
                backlog: VecDeque::with_capacity(settings.backlog_capacity.min(1024)),
                progress: None,
                subscribers: HashMap::new(),
                closed: false,
            }),
        })
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    // Nothing inside the critical sections can panic halfway through an
    // update, so a poisoned lock still guards consistent state.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscriber and return its channel together with the
    /// retained backlog.
    ///
    /// Registration and the backlog snapshot happen under the same lock
    /// as `publish`, so the replay followed by the channel contents is
    /// gap-free and duplicate-free.
    pub fn subscribe(self: &Arc<Self>) -> Result<(Subscription, Replay), BroadcastError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(BroadcastError::Closed(self.job_id));
        }

        let id = Uuid::now_v7();
        let (tx, rx) = mpsc::channel(self.settings.subscriber_buffer);
        let evicted = CancellationToken::new();
        inner.subscribers.insert(
            id,
            Subscriber {
                tx,
                evicted: evicted.clone(),
            },
        );

        let replay = Replay {
            status: inner.status,
            logs: inner.backlog.iter().cloned().collect(),
            progress: inner.progress.clone(),
        };

        debug!(
            job_id = self.job_id,
            subscriber = %id,
            backlog = replay.logs.len(),
            subscribers = inner.subscribers.len(),
            "Subscriber attached"
        );

        let subscription = Subscription {
            id,
            job_id: self.job_id,
            rx,
            evicted,
            broadcaster: Arc::downgrade(self),
        };
        Ok((subscription, replay))
    }

    /// Deliver `event` to every subscriber and record it for replay.
    ///
    /// Fails only once the terminal event has been published.
    pub fn publish(&self, event: JobEvent) -> Result<PublishReport, BroadcastError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(BroadcastError::Closed(self.job_id));
        }

        match &event {
            JobEvent::Log(log) => {
                if self.settings.backlog_capacity > 0 {
                    if inner.backlog.len() == self.settings.backlog_capacity {
                        inner.backlog.pop_front();
                    }
                    inner.backlog.push_back(log.clone());
                }
            }
            JobEvent::Progress(progress) => inner.progress = Some(progress.clone()),
            JobEvent::Status(status) => inner.status = *status,
            JobEvent::Complete { status } => {
                inner.status = *status;
                inner.closed = true;
            }
        }

        let mut report = PublishReport::default();
        let mut dropped = Vec::new();
        for (id, subscriber) in &inner.subscribers {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        job_id = self.job_id,
                        subscriber = %id,
                        capacity = self.settings.subscriber_buffer,
                        "Evicting slow subscriber"
                    );
                    subscriber.evicted.cancel();
                    report.evicted += 1;
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => dropped.push(*id),
            }
        }
        for id in dropped {
            inner.subscribers.remove(&id);
        }

        Ok(report)
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.lock().subscribers.remove(&id).is_some() {
            debug!(job_id = self.job_id, subscriber = %id, "Subscriber detached");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Wait up to `grace` for every attached subscriber to drain its
    /// channel and drop it, then release all remaining senders.
    ///
    /// Called once after the terminal event. Subscribers still attached
    /// when the grace period ends keep whatever is already buffered but
    /// receive nothing further.
    pub async fn drain(&self, grace: Duration) {
        let senders: Vec<mpsc::Sender<JobEvent>> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.subscribers.drain().map(|(_, s)| s.tx).collect()
        };

        let pending = senders.len();
        let flushed = tokio::time::timeout(grace, async {
            for tx in &senders {
                tx.closed().await;
            }
        })
        .await
        .is_ok();

        if flushed {
            debug!(job_id = self.job_id, subscribers = pending, "Broadcaster drained");
        } else {
            warn!(
                job_id = self.job_id,
                subscribers = pending,
                grace_ms = grace.as_millis() as u64,
                "Grace period elapsed before all subscribers drained"
            );
        }
    }
}

/// What a subscriber receives next.
#[derive(Debug, PartialEq)]
pub enum Delivery {
    Event(JobEvent),
    /// Dropped for overflowing its buffer.
    Evicted,
    /// The broadcaster was torn down.
    Closed,
}

/// Receiving half of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    job_id: JobId,
    rx: mpsc::Receiver<JobEvent>,
    evicted: CancellationToken,
    broadcaster: Weak<Broadcaster>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("job_id", &self.job_id)
            .field("evicted", &self.evicted.is_cancelled())
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Wait for the next delivery. Eviction takes priority over anything
    /// still buffered.
    pub async fn next(&mut self) -> Delivery {
        tokio::select! {
            biased;
            _ = self.evicted.cancelled() => Delivery::Evicted,
            event = self.rx.recv() => match event {
                Some(event) => Delivery::Event(event),
                None if self.evicted.is_cancelled() => Delivery::Evicted,
                None => Delivery::Closed,
            },
        }
    }

    /// Non-blocking variant of [`Subscription::next`]; `None` when nothing
    /// is buffered yet.
    pub fn try_next(&mut self) -> Option<Delivery> {
        if self.evicted.is_cancelled() {
            return Some(Delivery::Evicted);
        }
        match self.rx.try_recv() {
            Ok(event) => Some(Delivery::Event(event)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => Some(Delivery::Closed),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(broadcaster) = self.broadcaster.upgrade() {
            broadcaster.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::LogLevel;
    use chrono::Utc;

    fn log(id: u64) -> JobLog {
        JobLog {
            id,
            job_id: 1,
            timestamp: Utc::now(),
            level: LogLevel::Info,
            message: format!("line {id}"),
            details: None,
        }
    }

    fn settings(backlog: usize, buffer: usize) -> BroadcastSettings {
        BroadcastSettings {
            backlog_capacity: backlog,
            subscriber_buffer: buffer,
        }
    }

    fn drain_logs(sub: &mut Subscription) -> Vec<u64> {
        let mut ids = Vec::new();
        while let Some(Delivery::Event(JobEvent::Log(l))) = sub.try_next() {
            ids.push(l.id);
        }
        ids
    }

    #[tokio::test]
    async fn all_subscribers_see_publish_order() {
        let b = Broadcaster::new(1, JobStatus::Running, settings(10, 100));
        let (mut a, _) = b.subscribe().unwrap();
        let (mut c, _) = b.subscribe().unwrap();

        for id in 1..=20 {
            b.publish(JobEvent::Log(log(id))).unwrap();
        }

        let expected: Vec<u64> = (1..=20).collect();
        assert_eq!(drain_logs(&mut a), expected);
        assert_eq!(drain_logs(&mut c), expected);
    }

    #[tokio::test]
    async fn late_subscriber_gets_bounded_backlog() {
        let b = Broadcaster::new(1, JobStatus::Pending, settings(3, 100));
        b.publish(JobEvent::Status(JobStatus::Running)).unwrap();
        for id in 1..=5 {
            b.publish(JobEvent::Log(log(id))).unwrap();
        }

        let (mut sub, replay) = b.subscribe().unwrap();
        assert_eq!(replay.status, JobStatus::Running);
        assert_eq!(
            replay.logs.iter().map(|l| l.id).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );

        b.publish(JobEvent::Log(log(6))).unwrap();
        assert_eq!(drain_logs(&mut sub), vec![6]);
    }

    #[tokio::test]
    async fn overflow_evicts_only_the_slow_subscriber() {
        let b = Broadcaster::new(1, JobStatus::Running, settings(10, 2));
        let (mut slow, _) = b.subscribe().unwrap();
        let (mut fast, _) = b.subscribe().unwrap();

        for id in 1..=2 {
            b.publish(JobEvent::Log(log(id))).unwrap();
        }
        assert_eq!(drain_logs(&mut fast), vec![1, 2]);

        let report = b.publish(JobEvent::Log(log(3))).unwrap();
        assert_eq!(report, PublishReport { delivered: 1, evicted: 1 });
        assert_eq!(b.subscriber_count(), 1);

        assert_eq!(slow.next().await, Delivery::Evicted);
        assert_eq!(drain_logs(&mut fast), vec![3]);
    }

    #[tokio::test]
    async fn complete_closes_broadcaster() {
        let b = Broadcaster::new(1, JobStatus::Running, settings(10, 10));
        let (mut sub, _) = b.subscribe().unwrap();

        b.publish(JobEvent::Complete {
            status: JobStatus::Completed,
        })
        .unwrap();

        assert!(b.is_closed());
        assert_eq!(b.subscribe().unwrap_err(), BroadcastError::Closed(1));
        assert!(b.publish(JobEvent::Log(log(1))).is_err());
        assert_eq!(
            sub.next().await,
            Delivery::Event(JobEvent::Complete {
                status: JobStatus::Completed
            })
        );
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let b = Broadcaster::new(1, JobStatus::Running, settings(10, 10));
        let (sub, _) = b.subscribe().unwrap();
        let id = sub.id();
        assert_eq!(b.subscriber_count(), 1);

        drop(sub);
        assert_eq!(b.subscriber_count(), 0);
        b.unsubscribe(id);
    }

    #[tokio::test]
    async fn drain_returns_once_subscribers_release() {
        let b = Broadcaster::new(1, JobStatus::Running, settings(10, 10));
        let (mut sub, _) = b.subscribe().unwrap();
        b.publish(JobEvent::Complete {
            status: JobStatus::Failed,
        })
        .unwrap();

        let reader = tokio::spawn(async move {
            let first = sub.next().await;
            drop(sub);
            first
        });

        tokio::time::timeout(Duration::from_secs(2), b.drain(Duration::from_secs(5)))
            .await
            .expect("drain should finish before the grace period");
        assert_eq!(
            reader.await.unwrap(),
            Delivery::Event(JobEvent::Complete {
                status: JobStatus::Failed
            })
        );
    }
}

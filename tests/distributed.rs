//! Multi-process scenarios: several queue instances sharing one store,
//! the way independent worker and producer processes share one server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln::{
    Config, Error, Handler, HandlerError, Job, JobEvent, JobState,
    MemoryStore, Queue, QueueEvent,
};
use serde_json::json;
use tokio::time::{sleep_until, timeout, Instant};

fn cluster(n: usize) -> (Arc<MemoryStore>, Vec<Queue>) {
    let store = Arc::new(MemoryStore::default());
    let queues = (0..n)
        .map(|_| {
            Queue::with_store(
                store.clone() as Arc<dyn kiln::Store>,
                Config {
                    poll_interval: Duration::from_millis(10),
                    ..Config::default()
                },
            )
        })
        .collect();
    (store, queues)
}

struct ProgressThenOk;

#[async_trait]
impl Handler for ProgressThenOk {
    async fn perform(
        &self,
        job: &mut Job,
    ) -> std::result::Result<(), HandlerError> {
        job.progress(50).await?;
        Ok(())
    }
}

/// Scenario A: a delayed job stays delayed until due, then lands in
/// inactive within one promotion interval.
#[tokio::test]
async fn test_delayed_job_promotes_on_schedule() {
    let (_, queues) = cluster(1);
    let queue = &queues[0];

    let mut job = queue.create_job("email", json!({}));
    job.delay_ms(600);
    let t0 = Instant::now();
    job.save().await.unwrap();
    let id = job.id().unwrap();

    queue.promote(Some(Duration::from_millis(100)));

    for checkpoint in [150, 300, 450] {
        sleep_until(t0 + Duration::from_millis(checkpoint)).await;
        assert_eq!(
            queue.job(id).await.unwrap().state(),
            JobState::Delayed,
            "still before the due time at +{checkpoint}ms"
        );
    }

    sleep_until(t0 + Duration::from_millis(900)).await;
    assert_eq!(queue.job(id).await.unwrap().state(), JobState::Inactive);
    queue.shutdown().await;
}

/// Scenario B, split across processes: one producer, one worker
/// process with two loops.
#[tokio::test]
async fn test_producer_and_worker_processes() {
    let (_, queues) = cluster(2);
    let (producer, worker) = (&queues[0], &queues[1]);

    for n in 0..10 {
        producer
            .create_job("email", json!({ "n": n }))
            .save()
            .await
            .unwrap();
    }
    assert_eq!(producer.inactive_count().await.unwrap(), 10);

    worker.process("email", 2, ProgressThenOk);

    let drained = async {
        while producer.complete_count().await.unwrap() != 10 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(Duration::from_secs(5), drained)
        .await
        .expect("jobs never drained");

    assert_eq!(producer.inactive_count().await.unwrap(), 0);
    assert_eq!(producer.active_count().await.unwrap(), 0);
    worker.shutdown().await;
}

/// Claim race: N concurrent claim attempts on one job, exactly one
/// winner, everyone else sees NotFound.
#[tokio::test]
async fn test_concurrent_claims_have_one_winner() {
    let (_, queues) = cluster(1);
    let queue = Arc::new(
        queues.into_iter().next().expect("cluster of one"),
    );

    let mut job = queue.create_job("email", json!({}));
    job.save().await.unwrap();
    let id = job.id().unwrap();

    let mut attempts = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        attempts.push(tokio::spawn(async move {
            let mut job = queue.job(id).await?;
            job.claim().await
        }));
    }

    let mut wins = 0;
    let mut losses = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(()) => wins += 1,
            Err(Error::NotFound(lost)) => {
                assert_eq!(lost, id);
                losses += 1;
            },
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((wins, losses), (1, 7));
    assert_eq!(queue.state(JobState::Active).await.unwrap(), vec![id]);
}

/// Scenario C: two promoters racing on the same due job produce exactly
/// one promotion event and one inactive entry.
#[tokio::test]
async fn test_racing_promoters_promote_exactly_once() {
    let (_, queues) = cluster(2);
    let (a, b) = (&queues[0], &queues[1]);

    let mut feed = a.activity().await.unwrap();

    let mut job = a.create_job("email", json!({}));
    job.delay_ms(100);
    job.save().await.unwrap();
    let id = job.id().unwrap();

    a.promote(Some(Duration::from_millis(25)));
    b.promote(Some(Duration::from_millis(25)));
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut promotions = 0;
    while let Ok(event) = feed.try_recv() {
        if let QueueEvent::Job {
            id: seen,
            event: JobEvent::Promotion,
        } = event
        {
            assert_eq!(seen, id);
            promotions += 1;
        }
    }
    assert_eq!(promotions, 1, "exactly one promoter may win");
    assert_eq!(a.state(JobState::Inactive).await.unwrap(), vec![id]);
    assert_eq!(a.delayed_count().await.unwrap(), 0);

    a.shutdown().await;
    b.shutdown().await;
}

/// Remote events replay onto the local handle that enqueued the job,
/// and tracking ends at the terminal event.
#[tokio::test]
async fn test_remote_events_reach_the_local_handle() {
    let (_, queues) = cluster(2);
    let (producer, worker) = (&queues[0], &queues[1]);

    let mut job = producer.create_job("email", json!({}));
    job.save().await.unwrap();
    let mut updates = job.updates().await.unwrap();

    worker.process("email", 1, ProgressThenOk);

    let mut seen = Vec::new();
    let collect = async {
        loop {
            match updates.recv().await {
                Ok(event) => {
                    let done = event == JobEvent::Complete;
                    seen.push(event);
                    if done {
                        break;
                    }
                },
                Err(_) => break,
            }
        }
    };
    timeout(Duration::from_secs(5), collect)
        .await
        .expect("never saw the terminal event");

    assert!(seen.contains(&JobEvent::Progress(50)));
    assert_eq!(seen.last(), Some(&JobEvent::Complete));
    worker.shutdown().await;
}

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dark_queue::{ItemExponentialFailureRateLimiter, WorkQueue};

fn queue() -> WorkQueue<String> {
    WorkQueue::new(
        "test",
        ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_millis(50)),
    )
}

async fn get_now(q: &WorkQueue<String>) -> Option<String> {
    tokio::time::timeout(Duration::from_millis(200), q.get()).await.ok().flatten()
}

#[tokio::test]
async fn duplicate_adds_collapse() {
    let q = queue();
    for _ in 0..5 {
        q.add("a".to_string());
    }
    q.add("b".to_string());
    assert_eq!(q.len(), 2);

    assert_eq!(get_now(&q).await.as_deref(), Some("a"));
    assert_eq!(get_now(&q).await.as_deref(), Some("b"));
    assert!(q.is_empty());
    q.done(&"a".to_string());
    q.done(&"b".to_string());

    // nothing left until someone adds again
    assert!(tokio::time::timeout(Duration::from_millis(50), q.get()).await.is_err());
}

#[tokio::test]
async fn add_while_in_flight_is_redelivered_once_after_done() {
    let q = queue();
    q.add("a".to_string());
    let item = get_now(&q).await.unwrap();

    q.add("a".to_string());
    q.add("a".to_string());
    // deferred, not handed to a second worker
    assert_eq!(q.len(), 0);
    assert!(tokio::time::timeout(Duration::from_millis(50), q.get()).await.is_err());

    q.done(&item);
    assert_eq!(q.len(), 1);
    let again = get_now(&q).await.unwrap();
    assert_eq!(again, "a");
    q.done(&again);
    assert!(q.is_empty());
}

#[tokio::test]
async fn get_after_shutdown_on_empty_queue_reports_stop() {
    let q = queue();
    q.shut_down();
    assert_eq!(get_now(&q).await, None);
    assert!(q.is_shutting_down());

    q.add("late".to_string());
    assert!(q.is_empty());
}

#[tokio::test]
async fn shutdown_wakes_idle_workers() {
    let q = queue();
    let waiter = tokio::spawn({
        let q = q.clone();
        async move { q.get().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    q.shut_down();
    let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    assert_eq!(got, None);
}

#[tokio::test]
async fn items_queued_before_shutdown_still_drain() {
    let q = queue();
    q.add("a".to_string());
    q.shut_down();
    assert_eq!(get_now(&q).await.as_deref(), Some("a"));
    assert_eq!(get_now(&q).await, None);
}

#[tokio::test]
async fn shut_down_with_drain_waits_for_in_flight() {
    let q = queue();
    q.add("a".to_string());
    let item = get_now(&q).await.unwrap();

    let drain = tokio::spawn({
        let q = q.clone();
        async move { q.shut_down_with_drain().await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!drain.is_finished());

    q.done(&item);
    tokio::time::timeout(Duration::from_secs(1), drain).await.unwrap().unwrap();
}

#[tokio::test]
async fn rate_limited_add_backs_off_until_forget() {
    let q = queue();
    let k = "a".to_string();
    q.add_rate_limited(k.clone());
    q.add_rate_limited(k.clone());
    q.add_rate_limited(k.clone());
    assert_eq!(q.num_requeues(&k), 3);

    // delayed adds dedup into a single delivery
    assert_eq!(get_now(&q).await.as_deref(), Some("a"));
    q.done(&k);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(q.len() <= 1);

    q.forget(&k);
    assert_eq!(q.num_requeues(&k), 0);
}

#[tokio::test]
async fn add_after_is_cancelled_by_shutdown() {
    let q = queue();
    q.add_after("a".to_string(), Duration::from_millis(30));
    q.shut_down();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(q.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_key_is_never_processed_by_two_workers_at_once() {
    let q = queue();
    let keys = ["a", "b", "c"];
    let in_flight: Arc<Vec<AtomicUsize>> = Arc::new(keys.iter().map(|_| AtomicUsize::new(0)).collect());
    let overlaps = Arc::new(AtomicUsize::new(0));
    let processed = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for _ in 0..8 {
        let q = q.clone();
        let in_flight = Arc::clone(&in_flight);
        let overlaps = Arc::clone(&overlaps);
        let processed = Arc::clone(&processed);
        workers.push(tokio::spawn(async move {
            while let Some(item) = q.get().await {
                let idx = keys.iter().position(|k| *k == item).unwrap();
                if in_flight[idx].fetch_add(1, Ordering::SeqCst) != 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                in_flight[idx].fetch_sub(1, Ordering::SeqCst);
                processed.fetch_add(1, Ordering::SeqCst);
                q.done(&item);
            }
        }));
    }

    for round in 0..200 {
        q.add(keys[round % keys.len()].to_string());
        if round % 10 == 0 {
            tokio::task::yield_now().await;
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    q.shut_down_with_drain().await;
    for w in workers {
        w.await.unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert!(processed.load(Ordering::SeqCst) >= keys.len());
}

use kube_informer::error::Error;
use kube_informer::workqueue::{ExponentialBackoff, RateLimitingQueue, WorkQueue};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_loop_retries_then_forgets() {
    let queue = Arc::new(RateLimitingQueue::new(
        ExponentialBackoff::new(ms(10), ms(1000)).unwrap(),
    ));
    let key = "pod/ns/a".to_string();
    queue.add(key.clone());

    let deliveries = Arc::new(AtomicUsize::new(0));
    let worker = {
        let queue = Arc::clone(&queue);
        let deliveries = Arc::clone(&deliveries);
        tokio::spawn(async move {
            while let Some(item) = queue.get().await {
                let attempt = deliveries.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < 3 {
                    queue.add_rate_limited(item.clone());
                } else {
                    queue.forget(&item);
                }
                queue.done(&item);
            }
        })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(deliveries.load(Ordering::SeqCst), 3);
    assert_eq!(queue.num_requeues(&key), 0);
    assert_eq!(queue.len(), 0);
    assert_eq!(queue.pending_delay_count(), 0);

    queue.shutdown();
    worker.await.unwrap();
}

#[tokio::test]
async fn test_no_item_is_processed_twice_at_once() {
    let queue = Arc::new(WorkQueue::new());
    let in_flight = Arc::new(Mutex::new(HashSet::new()));
    let processed = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let in_flight = Arc::clone(&in_flight);
            let processed = Arc::clone(&processed);
            tokio::spawn(async move {
                while let Some(item) = queue.get().await {
                    assert!(in_flight.lock().unwrap().insert(item), "{item} handed out twice");
                    tokio::task::yield_now().await;
                    // an update while checked out
                    queue.add(item);
                    in_flight.lock().unwrap().remove(&item);
                    processed.fetch_add(1, Ordering::SeqCst);
                    queue.done(&item);
                    if processed.load(Ordering::SeqCst) >= 200 {
                        queue.shutdown();
                    }
                }
            })
        })
        .collect();

    for item in 0..8u32 {
        queue.add(item);
    }
    for worker in workers {
        worker.await.unwrap();
    }
    assert!(processed.load(Ordering::SeqCst) >= 200);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_wakes_blocked_pollers() {
    let queue = Arc::new(WorkQueue::<String>::new());
    let waiter = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.poll(Duration::from_secs(60)).await })
    };
    tokio::time::sleep(ms(10)).await;
    queue.shutdown();
    assert!(matches!(waiter.await.unwrap(), Err(Error::QueueShutDown)));

    queue.add("late".to_string());
    assert!(queue.is_empty());
}

use datum_collector::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

#[test]
fn received_messages_are_hidden_until_deleted() {
    let queue = MemoryQueue::new("q");
    queue.send("a".to_string()).unwrap();
    queue.send("b".to_string()).unwrap();

    let received = queue.receive(10, ms(10)).unwrap();
    assert_eq!(received.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    assert!(received.iter().all(|m| m.receive_count == 1));
    assert!(queue.receive(10, ms(10)).unwrap().is_empty());

    let attributes = queue.attributes(ms(100)).unwrap();
    assert_eq!(attributes, QueueAttributes { visible: 0, in_flight: 2 });

    let handles = received.iter().map(|m| m.receipt_handle.clone()).collect::<Vec<_>>();
    let outcome = queue.delete_batch(&handles).unwrap();
    assert_eq!(outcome.succeeded.len(), 2);
    assert!(outcome.failed.is_empty());
    assert!(queue.is_empty());
}

#[test]
fn expired_visibility_redelivers_with_a_new_receipt() {
    let queue = MemoryQueue::with_visibility_timeout("q", ms(30));
    queue.send("a".to_string()).unwrap();

    let first = queue.receive(1, ms(10)).unwrap().remove(0);
    let second = queue.receive(1, Duration::from_secs(2)).unwrap().remove(0);
    assert_eq!(first.message_id, second.message_id);
    assert_ne!(first.receipt_handle, second.receipt_handle);
    assert_eq!(second.receive_count, 2);

    // Only the latest receipt is good for deletion.
    let outcome = queue.delete_batch(&[first.receipt_handle]).unwrap();
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(queue.len(), 1);
    let outcome = queue.delete_batch(&[second.receipt_handle]).unwrap();
    assert_eq!(outcome.succeeded.len(), 1);
    assert!(queue.is_empty());
}

#[test]
fn zero_visibility_makes_message_available_at_once() {
    let queue = MemoryQueue::new("q");
    queue.send("a".to_string()).unwrap();

    let message = queue.receive(1, ms(10)).unwrap().remove(0);
    let outcome = queue
        .change_visibility_batch(&[message.receipt_handle.clone(), "bogus".to_string()], Duration::ZERO)
        .unwrap();
    assert_eq!(outcome.succeeded, vec![message.receipt_handle]);
    assert_eq!(outcome.failed, vec!["bogus".to_string()]);

    let again = queue.receive(1, ms(10)).unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].receive_count, 2);
}

#[test]
fn long_poll_wakes_up_on_send() {
    let queue = Arc::new(MemoryQueue::new("q"));
    let sender = queue.clone();
    let producer = thread::spawn(move || {
        thread::sleep(ms(50));
        sender.send("late".to_string()).unwrap();
    });

    let started = Instant::now();
    let received = queue.receive(5, Duration::from_secs(5)).unwrap();
    assert_eq!(received.len(), 1);
    assert!(started.elapsed() < Duration::from_secs(4));
    producer.join().unwrap();
}

#[test]
fn long_poll_returns_empty_after_wait() {
    let queue = MemoryQueue::new("q");
    let started = Instant::now();
    assert!(queue.receive(5, ms(30)).unwrap().is_empty());
    assert!(started.elapsed() >= ms(30));
}

#[test]
fn closed_queue_fails_every_call() {
    let queue = Arc::new(MemoryQueue::new("q"));
    let waiter = {
        let queue = queue.clone();
        thread::spawn(move || queue.receive(1, Duration::from_secs(5)))
    };
    thread::sleep(ms(20));
    queue.close();

    assert_eq!(waiter.join().unwrap(), Err(QueueError::Closed));
    assert_eq!(queue.send("x".to_string()), Err(QueueError::Closed));
    assert_eq!(queue.attributes(ms(10)), Err(QueueError::Closed));
    assert!(QueueError::Closed.is_fatal());
}

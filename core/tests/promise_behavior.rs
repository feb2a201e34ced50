//! Integration tests for promise resolution, observation and combination.
//!
//! These drive the public API the way a consumer would: promises resolved
//! from worker threads, observers on work queues, pipelines attached before
//! resolution.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;
use roundabout_core::testing::MockPromise;
use roundabout_core::{
    Error, IllegalState, Inline, JsonFieldPostProcessor, JsonPostProcessor, Possibility, Promise,
    PromiseGroups, PromiseState, WorkQueue, when_all,
};
use serde_json::Value;

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn exactly_once_accept() {
    let promise = Promise::new();
    promise.accept(1);
    assert_eq!(promise.try_accept(2), Err(IllegalState::AlreadyResolved));
    assert_eq!(promise.wait().unwrap(), 1);
    assert_eq!(promise.state(), PromiseState::AcceptedWithValue);
}

#[test]
fn observer_registered_after_resolution_runs_once() {
    let promise = Promise::accepted("ready".to_string());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    promise.then_on(
        move |value| {
            assert_eq!(value, "ready");
            counter.fetch_add(1, Ordering::SeqCst);
        },
        |e| panic!("unexpected {e}"),
        Arc::new(Inline),
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn when_all_preserves_order_for_mock_promises() {
    let slow = MockPromise::new(Possibility::Value(1))
        .delay(Duration::from_millis(40))
        .build();
    let failing = MockPromise::new(Possibility::Error(Error::NoConnection))
        .delay(Duration::from_millis(10))
        .build();
    let fast = MockPromise::new(Possibility::Value(3)).build();

    let results = when_all(vec![slow, failing, fast]).wait().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_value(), Some(&1));
    assert!(matches!(results[1].as_error(), Some(Error::NoConnection)));
    assert_eq!(results[2].as_value(), Some(&3));
}

#[test]
fn json_then_field_pipeline() {
    let promise = Promise::<Value>::named("profile");
    promise.add_post_processor(JsonPostProcessor);
    promise.add_post_processor(JsonFieldPostProcessor::new("name"));
    promise.accept_raw(br#"{"name":"a"}"#.to_vec());
    assert_eq!(promise.wait().unwrap(), Value::from("a"));
}

#[test]
fn malformed_json_stops_before_field_extraction() {
    let promise = Promise::<Value>::named("profile");
    promise.set_source_url("https://api.example.com/profile");
    promise.add_post_processor(JsonPostProcessor);
    promise.add_post_processor(JsonFieldPostProcessor::new("name"));
    promise.accept_raw(b"{\"name\":".to_vec());

    match promise.wait() {
        Err(Error::Processing {
            message,
            source_url,
        }) => {
            assert!(message.starts_with("invalid JSON"), "{message}");
            assert_eq!(
                source_url.as_deref(),
                Some("https://api.example.com/profile")
            );
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn cancel_then_resolve_still_transitions() {
    let promise = Promise::<u64>::new();
    promise.cancel();
    promise.reject(Error::Cancelled);
    assert_eq!(promise.state(), PromiseState::RejectedWithError);
    assert!(promise.is_cancelled());
}

#[test]
fn observers_from_many_threads_all_fire() {
    let queue = WorkQueue::new("observers", 4);
    let promise = Promise::<u64>::new();
    let (tx, rx) = unbounded();

    let registrars: Vec<_> = (0..8)
        .map(|_| {
            let promise = promise.clone();
            let tx = tx.clone();
            let queue = queue.clone();
            thread::spawn(move || {
                promise.then_on(move |v| tx.send(v).unwrap(), |_| {}, Arc::new(queue));
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(5));
    promise.accept(11);
    for handle in registrars {
        handle.join().unwrap();
    }

    for _ in 0..8 {
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 11);
    }
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn then_inside_work_queue_defaults_to_that_queue() {
    let queue = WorkQueue::serial("default-context");
    let promise = Promise::<u8>::new();
    let (tx, rx) = unbounded();

    let observed = promise.clone();
    queue.spawn(move || {
        observed.then(
            move |_| {
                let name = thread::current().name().map(str::to_string);
                tx.send(name).unwrap();
            },
            |_| {},
        );
    });
    thread::sleep(Duration::from_millis(20));
    promise.accept(1);

    let name = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(name.as_deref(), Some("default-context-0"));
}

#[test]
fn group_cancellation_reaches_mock_promises() {
    let groups = PromiseGroups::new();
    let promise = MockPromise::new(Possibility::Value(1u8))
        .delay(Duration::from_millis(50))
        .cancellable(true)
        .build();
    promise.set_group("screen");
    assert!(groups.add(&promise));

    promise.fire();
    assert_eq!(groups.cancel_group("screen"), 1);
    assert!(matches!(promise.wait(), Err(Error::Cancelled)));
}

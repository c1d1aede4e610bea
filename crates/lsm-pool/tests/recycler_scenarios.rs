//! Recycler behaviour under contention.

use std::sync::Arc;
use std::time::Duration;

use lsm_pool::{Recycler, RecyclerLimits, RecyclerRegistry, StackRequest};

fn plane() -> StackRequest {
    StackRequest::plane(128, 128)
}

#[tokio::test]
async fn requests_beyond_max_live_block_until_release() {
    let recycler = Recycler::new("scenario", RecyclerLimits::new(0, 3, 3));

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(recycler.try_request(&plane()).unwrap());
    }

    let waiter = {
        let recycler = Arc::clone(&recycler);
        tokio::spawn(async move { recycler.request(&plane(), Duration::from_secs(5)).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished(), "request must block at max_live");

    held.pop().unwrap().release();

    let stack = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter woken by release")
        .unwrap()
        .unwrap();
    assert_eq!(stack.request(), &plane());
    assert_eq!(recycler.live(), 3);
}

#[tokio::test]
async fn matching_requests_after_release_reuse_without_allocation() {
    let max_live = 4;
    let recycler = Recycler::new("scenario", RecyclerLimits::new(0, max_live, max_live));

    let leases: Vec<_> = (0..max_live)
        .map(|_| recycler.try_request(&plane()).unwrap())
        .collect();
    assert_eq!(recycler.allocations(), max_live as u64);

    for lease in leases {
        lease.release();
    }
    assert_eq!(recycler.available(), max_live);

    let again: Vec<_> = (0..max_live)
        .map(|_| recycler.try_request(&plane()).unwrap())
        .collect();

    assert_eq!(recycler.allocations(), max_live as u64);
    assert_eq!(recycler.reuses(), max_live as u64);
    assert_eq!(again.len(), max_live);
}

/// Three movements, two cameras, one stack per camera per movement.
#[tokio::test]
async fn six_requests_against_four_live_slots() {
    let registry = RecyclerRegistry::new();
    let recycler = registry.use_recycler("two-cameras", 0, 4, 4);
    let timeout = Duration::from_secs(2);

    let mut first = Vec::new();
    for _ in 0..4 {
        first.push(recycler.request(&plane(), timeout).await.unwrap());
    }

    let fifth = {
        let recycler = Arc::clone(&recycler);
        tokio::spawn(async move { recycler.request(&plane(), timeout).await })
    };
    let sixth = {
        let recycler = Arc::clone(&recycler);
        tokio::spawn(async move { recycler.request(&plane(), timeout).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!fifth.is_finished());
    assert!(!sixth.is_finished());

    // Consumer drains the first two stacks
    first.remove(0).release();
    first.remove(0).release();

    let fifth = fifth.await.unwrap().unwrap();
    let sixth = sixth.await.unwrap().unwrap();
    assert_eq!(recycler.live(), 4);
    assert_eq!(recycler.allocations(), 4);

    drop(first);
    drop(fifth);
    drop(sixth);
    assert_eq!(recycler.live(), 0);
    assert_eq!(recycler.available(), 4);
}

#[tokio::test]
async fn timed_out_request_leaves_counts_untouched() {
    let recycler = Recycler::new("scenario", RecyclerLimits::new(0, 1, 1));
    let held = recycler.try_request(&plane()).unwrap();

    let before = (recycler.live(), recycler.available(), recycler.allocations());
    let result = recycler.request(&plane(), Duration::from_millis(30)).await;
    assert!(result.is_err());
    assert_eq!(
        (recycler.live(), recycler.available(), recycler.allocations()),
        before
    );

    drop(held);
    assert_eq!(recycler.live(), 0);
}

#[tokio::test]
async fn leases_outlive_replaced_recycler() {
    let registry = RecyclerRegistry::new();
    let old = registry.use_recycler("interactive", 0, 2, 2);
    let lease = old.try_request(&plane()).unwrap();

    let new = registry.use_recycler("interactive", 0, 8, 8);
    assert!(!Arc::ptr_eq(&old, &new));

    lease.release();
    assert_eq!(old.available(), 1);
    assert_eq!(new.available(), 0);
}

#[tokio::test]
async fn first_miss_tops_up_min_available() {
    let recycler = Recycler::new("scenario", RecyclerLimits::new(2, 4, 4));

    let first = recycler.try_request(&plane()).unwrap();
    assert_eq!(recycler.allocations(), 3);
    assert!(recycler.available() >= 2);

    // Warm pool: the next two leases are served without allocating
    let second = recycler.try_request(&plane()).unwrap();
    let third = recycler.try_request(&plane()).unwrap();
    assert_eq!(recycler.reuses(), 2);
    assert_eq!(recycler.allocations(), 3);

    drop((first, second, third));
    assert_eq!(recycler.live(), 0);
    assert_eq!(recycler.available(), 3);
}

#[tokio::test]
async fn dropped_lease_returns_its_payload_to_the_pool() {
    let recycler = Recycler::new("scenario", RecyclerLimits::new(0, 1, 1));
    let mut lease = recycler.try_request(&plane()).unwrap();
    let size = lease.size_in_bytes();
    lease.data_mut()[0] = 7;
    drop(lease);

    let again = recycler.try_request(&plane()).unwrap();
    assert_eq!(again.size_in_bytes(), size);
    assert_eq!(recycler.reuses(), 1);
}

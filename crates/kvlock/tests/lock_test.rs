// Integration tests for LockCoordinator
// Exercises acquisition, contention, liveness loss and destroy rules
// against the in-memory store

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use kvlock::{
    CancellationToken, CoordinationError, ErrorKind, LOCK_FLAG_VALUE, LockCoordinator, LockState,
    LossReason, RenewalState, SessionGateway, StoreError,
};
use kvlock_common::SessionRequest;
use kvlock_memstore::MemStore;

use common::{RejectingRenewals, eventually, lock_options, store};

fn lock(store: &Arc<MemStore>, key: &str) -> LockCoordinator {
    LockCoordinator::new(store.clone(), lock_options(key)).unwrap()
}

#[tokio::test]
async fn test_lock_lifecycle() {
    let store = store();
    let lock = lock(&store, "svc/leader");
    let cancel = CancellationToken::new();

    assert_eq!(lock.state(), LockState::Unheld);
    let lease = lock.acquire(&cancel).await.unwrap();
    assert!(lock.is_held());
    assert!(lease.is_valid());
    assert_eq!(lease.key(), "svc/leader");

    lock.release(&cancel).await.unwrap();
    assert!(!lock.is_held());
    assert!(!lease.is_valid());

    // Key survives release, unheld
    let pair = store.kv().get("svc/leader").unwrap();
    assert!(pair.session.is_none());
    assert_eq!(pair.flags, LOCK_FLAG_VALUE);

    // Owned session destroyed at release
    assert_eq!(store.sessions().live_count(), 0);
}

#[tokio::test]
async fn test_lock_index_counts_acquisitions() {
    let store = store();
    let lock = lock(&store, "svc/leader");
    let cancel = CancellationToken::new();

    let first = lock.acquire(&cancel).await.unwrap();
    lock.release(&cancel).await.unwrap();
    let second = lock.acquire(&cancel).await.unwrap();
    lock.release(&cancel).await.unwrap();

    assert_eq!(first.lock_index(), 1);
    assert_eq!(second.lock_index(), 2);
    assert_ne!(first.session(), second.session());
}

#[tokio::test]
async fn test_value_written_with_lock() {
    let store = store();
    let opts = lock_options("svc/leader").with_value("node-1");
    let lock = LockCoordinator::new(store.clone(), opts).unwrap();
    let cancel = CancellationToken::new();

    lock.acquire(&cancel).await.unwrap();
    let pair = store.kv().get("svc/leader").unwrap();
    assert_eq!(pair.decoded_value(), Some("node-1".to_string()));
    lock.release(&cancel).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_exclusion() {
    let store = store();
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let lock = lock(&store, "svc/exclusive");
        let inside = Arc::clone(&inside);
        let max_inside = Arc::clone(&max_inside);
        let completed = Arc::clone(&completed);

        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            for _ in 0..3 {
                lock.acquire(&cancel).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                lock.release(&cancel).await.unwrap();
                completed.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    for handle in handles {
        tokio::time::timeout(Duration::from_secs(20), handle)
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(completed.load(Ordering::SeqCst), 12);
}

#[tokio::test]
async fn test_second_acquire_on_held_instance() {
    let store = store();
    let lock = lock(&store, "svc/leader");
    let cancel = CancellationToken::new();

    lock.acquire(&cancel).await.unwrap();
    let err = lock.acquire(&cancel).await.unwrap_err();
    assert!(matches!(err, CoordinationError::LockHeld));
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert!(lock.is_held());
    lock.release(&cancel).await.unwrap();
}

#[tokio::test]
async fn test_acquire_while_pending() {
    let store = store();
    let holder = lock(&store, "svc/leader");
    let cancel = CancellationToken::new();
    holder.acquire(&cancel).await.unwrap();

    let waiter = Arc::new(lock(&store, "svc/leader"));
    let pending = {
        let waiter = Arc::clone(&waiter);
        let cancel = cancel.clone();
        tokio::spawn(async move { waiter.acquire(&cancel).await })
    };

    assert!(eventually(Duration::from_secs(1), || waiter.state() == LockState::Pending).await);
    // The contending session is already being renewed
    assert!(
        eventually(Duration::from_secs(1), || {
            waiter.renewal_state() == RenewalState::Renewing
        })
        .await
    );
    assert!(matches!(
        waiter.acquire(&cancel).await,
        Err(CoordinationError::AcquirePending)
    ));

    holder.release(&cancel).await.unwrap();
    pending.await.unwrap().unwrap();
    assert!(waiter.is_held());
    waiter.release(&cancel).await.unwrap();
}

#[tokio::test]
async fn test_double_release_not_held() {
    let store = store();
    let lock = lock(&store, "svc/leader");
    let cancel = CancellationToken::new();

    // Never acquired
    for _ in 0..2 {
        let err = lock.release(&cancel).await.unwrap_err();
        assert!(matches!(err, CoordinationError::LockNotHeld));
    }

    // After a successful release
    lock.acquire(&cancel).await.unwrap();
    lock.release(&cancel).await.unwrap();
    for _ in 0..2 {
        let err = lock.release(&cancel).await.unwrap_err();
        assert!(matches!(err, CoordinationError::LockNotHeld));
    }
}

#[tokio::test]
async fn test_blocking_handoff() {
    let store = store();
    let cancel = CancellationToken::new();
    let holder = lock(&store, "svc/leader");
    holder.acquire(&cancel).await.unwrap();

    // Long wait time: a prompt handoff can only come from the change wakeup
    let opts = lock_options("svc/leader").with_wait_time(Duration::from_secs(10));
    let waiter = Arc::new(LockCoordinator::new(store.clone(), opts).unwrap());
    let task = {
        let waiter = Arc::clone(&waiter);
        let cancel = cancel.clone();
        tokio::spawn(async move { waiter.acquire(&cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_held());

    let released_at = Instant::now();
    holder.release(&cancel).await.unwrap();
    let lease = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(released_at.elapsed() < Duration::from_secs(1));
    assert!(waiter.is_held());
    assert!(lease.is_valid());
    waiter.release(&cancel).await.unwrap();
}

#[tokio::test]
async fn test_holder_session_destroyed() {
    let store = store();
    let cancel = CancellationToken::new();
    let holder = lock(&store, "svc/leader");
    let mut lease = holder.acquire(&cancel).await.unwrap();

    let waiter = Arc::new(lock(&store, "svc/leader"));
    let task = {
        let waiter = Arc::clone(&waiter);
        let cancel = cancel.clone();
        tokio::spawn(async move { waiter.acquire(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    store.destroy_session(lease.session()).await.unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(2), lease.lost())
        .await
        .unwrap();
    assert!(matches!(
        reason,
        LossReason::SessionChanged | LossReason::SessionExpired
    ));
    assert!(!holder.is_held());

    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(waiter.is_held());

    // Lost hold: release reports not held, consistently
    for _ in 0..2 {
        assert!(matches!(
            holder.release(&cancel).await,
            Err(CoordinationError::LockNotHeld)
        ));
    }
    waiter.release(&cancel).await.unwrap();
}

#[tokio::test]
async fn test_renewal_expiry_flips_is_held() {
    let mem = store();
    let store = RejectingRenewals::shared(mem.clone());
    let cancel = CancellationToken::new();
    let lock = LockCoordinator::new(store.clone(), lock_options("svc/leader")).unwrap();

    let mut lease = lock.acquire(&cancel).await.unwrap();
    store.reject_renewals();

    let reason = tokio::time::timeout(Duration::from_secs(5), lease.lost())
        .await
        .unwrap();
    assert_eq!(reason, LossReason::SessionExpired);
    assert!(!lock.is_held());
    assert_eq!(lock.renewal_state(), RenewalState::Expired);

    // Only the renewal loop noticed; the key still names the session
    let pair = mem.kv().get("svc/leader").unwrap();
    assert!(pair.is_held_by(lease.session()));

    assert!(matches!(
        lock.release(&cancel).await,
        Err(CoordinationError::LockNotHeld)
    ));
}

#[tokio::test]
async fn test_external_key_delete() {
    let store = store();
    let cancel = CancellationToken::new();
    let lock = lock(&store, "svc/leader");
    let mut lease = lock.acquire(&cancel).await.unwrap();

    store.kv().delete("svc/leader");

    let reason = tokio::time::timeout(Duration::from_secs(2), lease.lost())
        .await
        .unwrap();
    assert_eq!(reason, LossReason::KeyDeleted);
    assert!(!lock.is_held());
    assert_eq!(lock.state(), LockState::Unheld);

    // The instance can acquire again after the loss
    lock.acquire(&cancel).await.unwrap();
    assert!(lock.is_held());
    lock.release(&cancel).await.unwrap();
}

#[tokio::test]
async fn test_try_once_gives_up_after_wait_time() {
    let store = store();
    let cancel = CancellationToken::new();
    let holder = lock(&store, "svc/leader");
    holder.acquire(&cancel).await.unwrap();

    let wait = Duration::from_millis(300);
    let opts = lock_options("svc/leader")
        .with_wait_time(wait)
        .with_try_once(None);
    let contender = LockCoordinator::new(store.clone(), opts).unwrap();

    let start = Instant::now();
    let err = contender.acquire(&cancel).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, CoordinationError::MaxAttemptsReached { .. }));
    assert_eq!(err.kind(), ErrorKind::Exhaustion);
    assert!(elapsed >= wait, "gave up after {:?}", elapsed);
    assert!(elapsed < wait * 2, "gave up after {:?}", elapsed);

    // The failed contender cleaned up its session
    assert_eq!(store.sessions().live_count(), 1);
    assert_eq!(contender.state(), LockState::Unheld);
    holder.release(&cancel).await.unwrap();
}

#[tokio::test]
async fn test_try_once_budget_longer_than_wait() {
    let store = store();
    let cancel = CancellationToken::new();
    let holder = lock(&store, "svc/leader");
    holder.acquire(&cancel).await.unwrap();

    let wait = Duration::from_millis(200);
    let budget = Duration::from_millis(700);
    let opts = lock_options("svc/leader")
        .with_wait_time(wait)
        .with_try_once(Some(budget));
    let contender = LockCoordinator::new(store.clone(), opts).unwrap();

    let start = Instant::now();
    let err = contender.acquire(&cancel).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, CoordinationError::MaxAttemptsReached { .. }));
    assert!(elapsed >= budget, "gave up after {:?}", elapsed);
    assert!(elapsed < budget + wait * 2, "gave up after {:?}", elapsed);
    holder.release(&cancel).await.unwrap();
}

#[tokio::test]
async fn test_try_once_acquires_free_lock() {
    let store = store();
    let cancel = CancellationToken::new();
    let opts = lock_options("svc/leader").with_try_once(None);
    let lock = LockCoordinator::new(store.clone(), opts).unwrap();

    lock.acquire(&cancel).await.unwrap();
    lock.release(&cancel).await.unwrap();
}

#[tokio::test]
async fn test_reclaim_with_shared_session() {
    let store = store();
    let cancel = CancellationToken::new();
    let session = store
        .create_session(SessionRequest::new("shared", Duration::from_secs(10)))
        .await
        .unwrap();

    let first = LockCoordinator::new(
        store.clone(),
        lock_options("svc/leader").with_session(session.clone()),
    )
    .unwrap();
    let lease = first.acquire(&cancel).await.unwrap();
    let before = store.kv().get("svc/leader").unwrap();

    // A restarted process configured with the same session
    let second = LockCoordinator::new(
        store.clone(),
        lock_options("svc/leader").with_session(session.clone()),
    )
    .unwrap();
    let reclaimed = second.acquire(&cancel).await.unwrap();
    assert_eq!(reclaimed.session(), lease.session());
    assert_eq!(reclaimed.lock_index(), lease.lock_index());

    // Reclaim does not write the key
    let after = store.kv().get("svc/leader").unwrap();
    assert_eq!(after.modify_index, before.modify_index);

    // A supplied session is never renewed by the coordinator
    assert_eq!(second.renewal_state(), RenewalState::Idle);

    second.release(&cancel).await.unwrap();
    // Nor destroyed at release
    assert!(store.session_info(&session).await.unwrap().is_some());
}

#[tokio::test]
async fn test_conflict_with_foreign_key() {
    let store = store();
    let cancel = CancellationToken::new();
    store.kv().put("svc/config", b"plain", 0);
    let lock = lock(&store, "svc/config");

    let err = lock.acquire(&cancel).await.unwrap_err();
    assert!(matches!(err, CoordinationError::LockConflict(ref key) if key == "svc/config"));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(store.sessions().live_count(), 0);

    assert!(matches!(
        lock.destroy(&cancel).await,
        Err(CoordinationError::LockConflict(_))
    ));
}

#[tokio::test]
async fn test_cancel_while_waiting() {
    let store = store();
    let cancel = CancellationToken::new();
    let holder = lock(&store, "svc/leader");
    holder.acquire(&cancel).await.unwrap();

    let opts = lock_options("svc/leader").with_wait_time(Duration::from_secs(10));
    let waiter = LockCoordinator::new(store.clone(), opts).unwrap();
    let waiter_cancel = CancellationToken::new();
    let trigger = waiter_cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let err = waiter.acquire(&waiter_cancel).await.unwrap_err();
    assert!(matches!(err, CoordinationError::Cancelled));
    assert!(start.elapsed() < Duration::from_secs(2));

    // No dangling session, holder untouched
    assert_eq!(store.sessions().live_count(), 1);
    assert_eq!(waiter.state(), LockState::Unheld);
    assert!(holder.is_held());
    holder.release(&cancel).await.unwrap();
}

#[tokio::test]
async fn test_cancel_before_acquire() {
    let store = store();
    let lock = lock(&store, "svc/leader");
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert!(matches!(
        lock.acquire(&cancel).await,
        Err(CoordinationError::Cancelled)
    ));
    assert!(store.kv().get("svc/leader").is_none());
    assert_eq!(store.sessions().live_count(), 0);
}

#[tokio::test]
async fn test_transport_error_propagates() {
    let store = store();
    let lock = lock(&store, "svc/leader");
    let cancel = CancellationToken::new();

    store.set_unavailable(true);
    let err = lock.acquire(&cancel).await.unwrap_err();
    assert!(matches!(
        err,
        CoordinationError::Store(StoreError::Transport(_))
    ));
    assert_eq!(err.kind(), ErrorKind::Store);
    assert_eq!(lock.state(), LockState::Unheld);

    store.set_unavailable(false);
    lock.acquire(&cancel).await.unwrap();
    lock.release(&cancel).await.unwrap();
}

#[tokio::test]
async fn test_lock_delay_defers_reacquire() {
    let store = store();
    let cancel = CancellationToken::new();
    let delay = Duration::from_millis(300);

    let holder = LockCoordinator::new(
        store.clone(),
        lock_options("svc/leader").with_lock_delay(delay),
    )
    .unwrap();
    let lease = holder.acquire(&cancel).await.unwrap();

    // Invalidate the holder: the key is released under lock-delay
    let invalidated = Instant::now();
    store.destroy_session(lease.session()).await.unwrap();

    let waiter = lock(&store, "svc/leader");
    waiter.acquire(&cancel).await.unwrap();
    assert!(invalidated.elapsed() >= delay - Duration::from_millis(20));
    waiter.release(&cancel).await.unwrap();
}

#[tokio::test]
async fn test_destroy_rules() {
    let store = store();
    let cancel = CancellationToken::new();
    let lock = lock(&store, "svc/leader");

    // Absent key
    lock.destroy(&cancel).await.unwrap();

    // Held by this instance
    lock.acquire(&cancel).await.unwrap();
    assert!(matches!(
        lock.destroy(&cancel).await,
        Err(CoordinationError::LockHeld)
    ));

    // Held by another session
    let other = self::lock(&store, "svc/leader");
    assert!(matches!(
        other.destroy(&cancel).await,
        Err(CoordinationError::LockInUse)
    ));

    lock.release(&cancel).await.unwrap();
    other.destroy(&cancel).await.unwrap();
    assert!(store.kv().get("svc/leader").is_none());
}

#[tokio::test]
async fn test_destroy_with_own_supplied_session() {
    let store = store();
    let cancel = CancellationToken::new();
    let session = store
        .create_session(SessionRequest::new("owner", Duration::from_secs(10)))
        .await
        .unwrap();
    let opts = lock_options("svc/leader").with_session(session.clone());

    let first = LockCoordinator::new(store.clone(), opts.clone()).unwrap();
    first.acquire(&cancel).await.unwrap();

    // A second instance sharing the live session may destroy
    let second = LockCoordinator::new(store.clone(), opts).unwrap();
    second.destroy(&cancel).await.unwrap();
    assert!(store.kv().get("svc/leader").is_none());
}

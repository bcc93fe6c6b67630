//! End-to-end orchestrator scenarios against temp-dir stores.

mod common;

use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;

use common::Fixture;
use tradequeue::engine::orchestrator::Pacing;
use tradequeue::locks::ResourceLockRegistry;
use tradequeue::types::{ReportStatus, RunMode, RunnerError};
use tradequeue::vault::Vault;

#[tokio::test]
async fn test_concurrency_bound_respected() {
    let fx = Fixture::new(Duration::from_millis(100));
    fx.seed_accounts(&[("A", "0xa", 1), ("B", "0xb", 1), ("C", "0xc", 1)])
        .await;

    let summary = fx.orchestrator(2).run(RunMode::Market).await.unwrap();

    assert_eq!(summary.total, 3);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(fx.executor.max_active(), 2);
    assert_eq!(fx.executor.calls().len(), 3);
    assert!(fx.store.load_all_modules(false).await.unwrap().is_none());
    assert_eq!(fx.sink.digests().len(), 3);
}

#[tokio::test]
async fn test_modules_of_one_wallet_never_overlap() {
    let fx = Fixture::new(Duration::from_millis(30));
    let keys = fx.seed_accounts(&[("Solo", "0xsolo", 3)]).await;

    let summary = fx.orchestrator(3).run(RunMode::Limit).await.unwrap();

    assert_eq!(summary.succeeded, 3);
    assert_eq!(fx.executor.overlaps(), 0);
    assert_eq!(fx.executor.max_active(), 1);
    assert!(!fx.store.contains(&keys[0]).await.unwrap());

    // Only the digest for the last module closes the account.
    let digests = fx.sink.digests_for("Solo");
    assert_eq!(digests.len(), 3);
    assert!(!digests[0].contains("All work for this account is finished"));
    assert!(!digests[1].contains("All work for this account is finished"));
    assert!(digests[2].contains("Futures Limits: 3/3 actions succeeded"));
    assert!(digests[2].ends_with("All work for this account is finished"));
}

#[tokio::test]
async fn test_executor_receives_decrypted_credentials() {
    let fx = Fixture::new(Duration::ZERO);
    fx.seed_accounts(&[("A", "0xa", 1)]).await;

    fx.orchestrator(1).run(RunMode::Market).await.unwrap();

    assert_eq!(fx.executor.credentials(), vec!["0xa:secret-A".to_string()]);
    let digest = &fx.sink.digests_for("A")[0];
    assert!(digest.starts_with("A\n0xa\n\n✅ "));
}

#[tokio::test]
async fn test_failures_are_recorded_then_removed() {
    let fx = Fixture::new(Duration::from_millis(10));
    let keys = fx
        .seed_accounts(&[("Good", "0x1", 1), ("Broken", "0x2", 1), ("Rejected", "0x3", 1)])
        .await;
    fx.executor.error_for("Broken");
    fx.executor.fail_for("Rejected");

    let summary = fx.orchestrator(3).run(RunMode::Market).await.unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.skipped, 0);
    assert!(fx.store.load_all_modules(false).await.unwrap().is_none());

    let broken = fx.reports.entries(&keys[1]).await.unwrap();
    assert_eq!(broken.len(), 1);
    assert_eq!(broken[0].success, ReportStatus::Failure);
    assert!(broken[0].text.contains("exchange rejected request for Broken"));

    let rejected = fx.reports.entries(&keys[2]).await.unwrap();
    assert_eq!(rejected[0].success, ReportStatus::Failure);

    let digest = &fx.sink.digests_for("Broken")[0];
    assert!(digest.contains("❌ "));
    assert!(digest.contains("0/1 actions succeeded"));
}

#[tokio::test]
async fn test_group_waits_for_held_member_lock() {
    let fx = Fixture::new(Duration::ZERO);
    let keys = fx.seed_groups(&[&[("A", "0xa"), ("B", "0xb")]]).await;

    let locks = Arc::new(ResourceLockRegistry::new());
    let orchestrator = fx.orchestrator(2).with_locks(Arc::clone(&locks));
    let held = locks.acquire("0xb", None).await.unwrap();

    let release = async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        // Still blocked on 0xb; nothing executed or removed yet.
        assert!(fx.executor.calls().is_empty());
        assert!(fx.store.contains(&keys[0]).await.unwrap());
        drop(held);
    };
    let (summary, ()) = tokio::join!(orchestrator.run(RunMode::Pair), release);

    let summary = summary.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(fx.executor.calls(), vec!["Group 1".to_string()]);
    assert!(!fx.store.contains(&keys[0]).await.unwrap());

    let digest = &fx.sink.digests_for("Group 1")[0];
    assert!(digest.starts_with("Group 1\n\n✅ Pair Futures Limits finished"));
    assert!(digest.ends_with("All work for this account is finished"));
}

#[tokio::test]
async fn test_overlapping_groups_complete_without_sharing() {
    let fx = Fixture::new(Duration::from_millis(30));
    fx.seed_groups(&[
        &[("A", "0xa"), ("B", "0xb")],
        &[("B", "0xb"), ("C", "0xc")],
        &[("C", "0xc"), ("A", "0xa")],
    ])
    .await;

    let summary = fx.orchestrator(3).run(RunMode::Pair).await.unwrap();

    assert_eq!(summary.succeeded, 3);
    assert_eq!(fx.executor.overlaps(), 0);
    assert!(fx.store.load_all_groups().await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_mode_runs_each_wallet_once() {
    let fx = Fixture::new(Duration::ZERO);
    let keys = fx
        .seed_accounts(&[("First", "0xsame", 2), ("Second", "0xsame", 1), ("Other", "0xother", 3)])
        .await;

    let summary = fx.orchestrator(2).run(RunMode::CancelAll).await.unwrap();

    assert_eq!(summary.total, 2);
    let mut calls = fx.executor.calls();
    calls.sort();
    assert_eq!(calls, vec!["First".to_string(), "Other".to_string()]);

    // Whole accounts are removed; the duplicate wallet stays queued.
    assert!(!fx.store.contains(&keys[0]).await.unwrap());
    assert!(fx.store.contains(&keys[1]).await.unwrap());
    assert!(!fx.store.contains(&keys[2]).await.unwrap());
}

#[tokio::test]
async fn test_pair_mode_rejects_single_queue() {
    let fx = Fixture::new(Duration::ZERO);
    fx.seed_accounts(&[("A", "0xa", 1)]).await;

    let err = fx.orchestrator(1).run(RunMode::Pair).await.unwrap_err();
    assert!(matches!(err, RunnerError::Configuration(_)));
    assert!(fx.executor.calls().is_empty());
}

#[tokio::test]
async fn test_wrong_passphrase_is_rejected() {
    let fx = Fixture::with_passphrase("hunter2", Duration::ZERO);
    fx.seed_accounts(&[("A", "0xa", 1)]).await;
    let probe = fx.store.credential_probe().await.unwrap();

    let wrong = SecretString::new("letmein".to_string());
    let err = Vault::unlock(Some(&wrong), probe.as_deref()).err().unwrap();
    assert!(matches!(err, RunnerError::Credential(_)));

    let right = SecretString::new("hunter2".to_string());
    assert!(Vault::unlock(Some(&right), probe.as_deref()).is_ok());
}

#[tokio::test]
async fn test_shutdown_leaves_unstarted_items_queued() {
    let fx = Fixture::new(Duration::from_millis(200));
    fx.seed_accounts(&[("A", "0xa", 1), ("B", "0xb", 1), ("C", "0xc", 1)])
        .await;

    let orchestrator = fx.orchestrator(1);
    let token = orchestrator.shutdown_token();
    let stop = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    };
    let (summary, ()) = tokio::join!(orchestrator.run(RunMode::Market), stop);

    let summary = summary.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.skipped, 2);
    assert_eq!(fx.executor.calls().len(), 1);
    assert_eq!(fx.store.amounts().await.unwrap().accounts, 2);
    assert_eq!(fx.sink.digests().len(), 1);
}

#[tokio::test]
async fn test_lock_wait_timeout_skips_item() {
    let fx = Fixture::new(Duration::ZERO);
    let keys = fx.seed_accounts(&[("A", "0xa", 1)]).await;

    let locks = Arc::new(ResourceLockRegistry::new());
    let _held = locks.acquire("0xa", None).await.unwrap();
    let mut settings = Fixture::settings(1);
    settings.lock_wait_timeout = Some(Duration::from_millis(50));

    let summary = fx
        .orchestrator_with(settings)
        .with_locks(Arc::clone(&locks))
        .run(RunMode::Market)
        .await
        .unwrap();

    assert_eq!(summary.skipped, 1);
    assert!(fx.executor.calls().is_empty());
    assert!(fx.store.contains(&keys[0]).await.unwrap());
    assert!(fx.reports.entries(&keys[0]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_second_run_on_drained_queue_is_empty() {
    let fx = Fixture::new(Duration::ZERO);
    fx.seed_accounts(&[("A", "0xa", 2)]).await;

    let orchestrator = fx.orchestrator(2);
    assert_eq!(orchestrator.run(RunMode::Market).await.unwrap().succeeded, 2);

    let again = orchestrator.run(RunMode::Market).await.unwrap();
    assert_eq!(again.total, 0);
    assert_eq!(fx.executor.calls().len(), 2);
}

#[tokio::test]
async fn test_executor_panic_is_contained_to_its_item() {
    let fx = Fixture::new(Duration::from_millis(20));
    let keys = fx
        .seed_accounts(&[("A", "0xa", 1), ("B", "0xb", 1), ("C", "0xc", 1)])
        .await;
    fx.executor.panic_for("B");

    let summary = fx.orchestrator(3).run(RunMode::Market).await.unwrap();

    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert!(fx.store.load_all_modules(false).await.unwrap().is_none());

    let entries = fx.reports.entries(&keys[1]).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].success, ReportStatus::Failure);
    assert!(entries[0].text.contains("executor panicked"));
    assert!(entries[0].text.contains("executor bug while trading B"));

    assert_eq!(fx.sink.digests_for("B").len(), 1);
    assert_eq!(fx.reports.entries(&keys[2]).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pacing_holds_the_slot() {
    let fx = Fixture::new(Duration::ZERO);
    fx.seed_accounts(&[("Good", "0x1", 1), ("Bad", "0x2", 1)]).await;
    fx.executor.fail_for("Bad");

    let mut settings = Fixture::settings(1);
    settings.pacing = Pacing {
        after_success_min: Duration::from_secs(30),
        after_success_max: Duration::from_secs(30),
        after_failure: Duration::from_secs(10),
    };

    let started = tokio::time::Instant::now();
    let summary = fx
        .orchestrator_with(settings)
        .run(RunMode::Market)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    // One slot: the second item waits out the first item's pause.
    assert!(elapsed >= Duration::from_secs(40), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(45), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_success_pause_is_randomized_within_range() {
    let fx = Fixture::new(Duration::ZERO);
    fx.seed_accounts(&[("A", "0xa", 1)]).await;

    let mut settings = Fixture::settings(1);
    settings.pacing = Pacing {
        after_success_min: Duration::from_secs(5),
        after_success_max: Duration::from_secs(8),
        after_failure: Duration::from_secs(60),
    };

    let started = tokio::time::Instant::now();
    fx.orchestrator_with(settings).run(RunMode::Market).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(5), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(8_500), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn test_slot_wait_is_not_bounded_by_lock_timeout() {
    let fx = Fixture::new(Duration::from_millis(200));
    fx.seed_accounts(&[("A", "0xa", 1), ("B", "0xb", 1)]).await;

    let mut settings = Fixture::settings(1);
    settings.lock_wait_timeout = Some(Duration::from_millis(50));

    let summary = fx.orchestrator_with(settings).run(RunMode::Market).await.unwrap();

    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.skipped, 0);
}

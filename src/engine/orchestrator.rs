//! Orchestrator: drives a batch of queued work through the executor.
//!
//! Each item moves through
//! `Queued → LockAcquired → Executing → Persisted → Reported → Paced → Done`.
//! A failed execution still goes through `Persisted → Reported → Paced`:
//! the report entry is written before the queue entry is removed, and
//! locks and the concurrency slot are held until pacing is over.
//!
//! Resource locks are taken before the concurrency slot on both paths.
//! Shutdown stops items that are still waiting; executing items finish
//! their bookkeeping.

use futures::future::join_all;
use futures::FutureExt;
use rand::Rng;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::engine::executor::{Account, Group, TradeExecutor};
use crate::locks::ResourceLockRegistry;
use crate::notify::NotificationSink;
use crate::storage::{ReportStore, WorkStore};
use crate::types::{ExecutionPath, GroupWorkItem, RemovalScope, RunMode, RunnerError, WorkItem};
use crate::vault::Vault;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Post-item pause that throttles how fast new work starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub after_success_min: Duration,
    pub after_success_max: Duration,
    pub after_failure: Duration,
}

impl Pacing {
    /// No pauses at all.
    pub fn none() -> Self {
        Self {
            after_success_min: Duration::ZERO,
            after_success_max: Duration::ZERO,
            after_failure: Duration::ZERO,
        }
    }

    /// Random pause within the success range, or the fixed failure pause.
    pub fn delay_for(&self, success: bool) -> Duration {
        if !success {
            return self.after_failure;
        }
        if self.after_success_max <= self.after_success_min {
            return self.after_success_min;
        }
        let min = self.after_success_min.as_millis() as u64;
        let max = self.after_success_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Semaphore bound on concurrently executing items.
    pub concurrency: usize,
    pub pacing: Pacing,
    /// Bound on waiting for wallet locks. Unbounded when `None`. The wait
    /// for a concurrency slot is never bounded.
    pub lock_wait_timeout: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Item lifecycle and run summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemPhase {
    Queued,
    LockAcquired,
    Executing,
    Persisted,
    Reported,
    Paced,
    Done,
    Failed,
}

impl fmt::Display for ItemPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemPhase::Queued => "queued",
            ItemPhase::LockAcquired => "lock_acquired",
            ItemPhase::Executing => "executing",
            ItemPhase::Persisted => "persisted",
            ItemPhase::Reported => "reported",
            ItemPhase::Paced => "paced",
            ItemPhase::Done => "done",
            ItemPhase::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

fn enter(label: &str, phase: ItemPhase) {
    trace!(label, phase = %phase, "Item phase");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Succeeded,
    Failed,
    /// Never started; still queued.
    Skipped,
}

/// Counts for one completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunSummary {
    fn new(mode: RunMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            total: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
        }
    }

    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Succeeded => self.succeeded += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Skipped => self.skipped += 1,
        }
    }

    /// Items that ran to completion, successful or not.
    pub fn completed(&self) -> usize {
        self.succeeded + self.failed
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} run: {} items | {} ok | {} failed | {} skipped",
            self.mode, self.total, self.succeeded, self.failed, self.skipped
        )
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct AccountJob {
    item: WorkItem,
    account: Account,
}

struct GroupJob {
    group: Group,
}

pub struct Orchestrator {
    store: Arc<WorkStore>,
    reports: Arc<ReportStore>,
    vault: Arc<Vault>,
    executor: Arc<dyn TradeExecutor>,
    sink: Arc<dyn NotificationSink>,
    locks: Arc<ResourceLockRegistry>,
    settings: OrchestratorSettings,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: Arc<WorkStore>,
        reports: Arc<ReportStore>,
        vault: Arc<Vault>,
        executor: Arc<dyn TradeExecutor>,
        sink: Arc<dyn NotificationSink>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            reports,
            vault,
            executor,
            sink,
            locks: Arc::new(ResourceLockRegistry::new()),
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    /// Share a lock registry with other users of the same wallets.
    pub fn with_locks(mut self, locks: Arc<ResourceLockRegistry>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Load the whole batch once and drive every item to completion.
    ///
    /// Configuration and credential errors abort before anything is
    /// scheduled. Per-item failures only show up in the summary and the
    /// report log.
    pub async fn run(&self, mode: RunMode) -> Result<RunSummary, RunnerError> {
        let policy = mode.policy();
        let mut summary = RunSummary::new(mode);
        let semaphore = Semaphore::new(self.settings.concurrency.max(1));

        info!(
            run_id = %summary.run_id,
            mode = %mode,
            threads = self.settings.concurrency,
            "Starting run"
        );

        let outcomes = match policy.path {
            ExecutionPath::Single => {
                let Some(items) = self.store.load_all_modules(policy.unique_wallets).await? else {
                    info!("No more accounts left");
                    return Ok(summary);
                };
                let jobs = self.prepare_accounts(items, policy.unique_wallets)?;
                summary.total = jobs.len();
                join_all(
                    jobs.into_iter()
                        .map(|job| self.run_account(job, mode, policy.removal, &semaphore)),
                )
                .await
            }
            ExecutionPath::Group => {
                let Some(items) = self.store.load_all_groups().await? else {
                    info!("No more groups left");
                    return Ok(summary);
                };
                let jobs = self.prepare_groups(items)?;
                summary.total = jobs.len();
                join_all(jobs.into_iter().map(|job| self.run_group(job, mode, &semaphore))).await
            }
        };

        for outcome in outcomes {
            summary.record(outcome);
        }

        info!(
            run_id = %summary.run_id,
            mode = %mode,
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "All accounts done"
        );
        Ok(summary)
    }

    // -- Preparation ------------------------------------------------------

    /// Decrypt every account up front. In unique-wallet modes only the
    /// first item per wallet address is kept.
    fn prepare_accounts(
        &self,
        items: Vec<WorkItem>,
        unique_wallets: bool,
    ) -> Result<Vec<AccountJob>, RunnerError> {
        let mut seen = HashSet::new();
        let mut jobs = Vec::with_capacity(items.len());

        for item in items {
            let address = self.decrypt_field(&item.encrypted_address, &item.label, "address")?;
            if unique_wallets && !seen.insert(address.clone()) {
                debug!(label = %item.label, "Wallet already scheduled for this run");
                continue;
            }
            let credential = self
                .vault
                .decrypt_secret(item.encrypted_credential())
                .map_err(in_field(&item.label, "credential"))?;

            let account = Account {
                key: item.key.clone(),
                label: item.label.clone(),
                address,
                credential,
                proxy: item.proxy.clone(),
            };
            jobs.push(AccountJob { item, account });
        }

        Ok(jobs)
    }

    fn prepare_groups(&self, items: Vec<GroupWorkItem>) -> Result<Vec<GroupJob>, RunnerError> {
        items
            .into_iter()
            .map(|item| {
                let members = item
                    .members
                    .iter()
                    .map(|member| {
                        Ok(Account {
                            key: item.key.clone(),
                            label: member.label.clone(),
                            address: self.decrypt_field(&member.address, &member.label, "address")?,
                            credential: self
                                .vault
                                .decrypt_secret(&member.credential)
                                .map_err(in_field(&member.label, "credential"))?,
                            proxy: member.proxy.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>, RunnerError>>()?;

                Ok(GroupJob {
                    group: Group {
                        key: item.key,
                        number: item.group_number,
                        members,
                    },
                })
            })
            .collect()
    }

    fn decrypt_field(&self, blob: &str, label: &str, field: &str) -> Result<String, RunnerError> {
        self.vault.decrypt(blob).map_err(in_field(label, field))
    }

    // -- Single-account path ----------------------------------------------

    async fn run_account(
        &self,
        job: AccountJob,
        mode: RunMode,
        removal: RemovalScope,
        semaphore: &Semaphore,
    ) -> ItemOutcome {
        let AccountJob { item, account } = job;
        let label = account.label.as_str();
        enter(label, ItemPhase::Queued);

        let lock = self
            .locks
            .acquire(&account.address, self.settings.lock_wait_timeout);
        let Some(_lock) = self.wait_or_skip(label, lock).await else {
            return ItemOutcome::Skipped;
        };
        enter(label, ItemPhase::LockAcquired);

        let Some(_permit) = self.wait_or_skip(label, acquire_slot(semaphore)).await else {
            return ItemOutcome::Skipped;
        };

        enter(label, ItemPhase::Executing);
        let result = contain_panic(self.executor.execute_account(&account, mode)).await;
        let success = self.record_outcome(&item.key, label, mode, result).await;

        let removed = match removal {
            RemovalScope::Module => self.store.remove_module(&item).await,
            RemovalScope::Account | RemovalScope::Group => {
                self.store.remove_account(&item.key).await
            }
        };
        let last_module = match removed {
            Ok(removal) => removal.is_terminal(),
            Err(e) => {
                error!(label, error = %e, "Failed to remove item from queue");
                false
            }
        };
        enter(label, ItemPhase::Persisted);

        self.notify(&item.key, label, Some(&account.address), last_module, mode)
            .await;
        enter(label, ItemPhase::Reported);

        self.pace(label, success).await;
        enter(label, ItemPhase::Paced);
        enter(label, ItemPhase::Done);

        if success {
            ItemOutcome::Succeeded
        } else {
            ItemOutcome::Failed
        }
    }

    // -- Group path -------------------------------------------------------

    async fn run_group(&self, job: GroupJob, mode: RunMode, semaphore: &Semaphore) -> ItemOutcome {
        let group = job.group;
        let label = group.label();
        enter(&label, ItemPhase::Queued);

        let addresses = group.addresses();
        let acquire = self
            .locks
            .acquire_all(&addresses, self.settings.lock_wait_timeout);
        let Some(held) = self.wait_or_skip(&label, acquire).await else {
            return ItemOutcome::Skipped;
        };
        debug!(label = %label, wallets = ?held.keys(), "Group locked");
        enter(&label, ItemPhase::LockAcquired);

        let Some(_permit) = self.wait_or_skip(&label, acquire_slot(semaphore)).await else {
            return ItemOutcome::Skipped;
        };

        enter(&label, ItemPhase::Executing);
        let result = contain_panic(self.executor.execute_group(&group, mode)).await;
        let success = self.record_outcome(&group.key, &label, mode, result).await;

        if let Err(e) = self.store.remove_group(&group.key).await {
            error!(label = %label, error = %e, "Failed to remove group from queue");
        }
        enter(&label, ItemPhase::Persisted);

        self.notify(&group.key, &label, None, true, mode).await;
        enter(&label, ItemPhase::Reported);

        self.pace(&label, success).await;
        enter(&label, ItemPhase::Paced);
        enter(&label, ItemPhase::Done);

        if success {
            ItemOutcome::Succeeded
        } else {
            ItemOutcome::Failed
        }
    }

    // -- Shared steps -----------------------------------------------------

    /// Wait for `acquire` unless shutdown is requested first.
    async fn wait_or_skip<T, F>(&self, label: &str, acquire: F) -> Option<T>
    where
        F: Future<Output = Result<T, RunnerError>>,
    {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                info!(label, "Shutdown requested, leaving item queued");
                None
            }
            acquired = acquire => match acquired {
                Ok(held) => Some(held),
                Err(e) => {
                    warn!(label, error = %e, "Could not start item, leaving it queued");
                    None
                }
            },
        }
    }

    /// Write the item's report entry. Returns whether it succeeded.
    async fn record_outcome(
        &self,
        key: &str,
        label: &str,
        mode: RunMode,
        result: anyhow::Result<bool>,
    ) -> bool {
        let (success, text) = match result {
            Ok(true) => {
                info!(label, mode = %mode, "Item finished");
                (true, format!("{} finished", mode.title()))
            }
            Ok(false) => {
                warn!(label, mode = %mode, "Item finished without success");
                (false, format!("{} did not succeed", mode.title()))
            }
            Err(e) => {
                let err = RunnerError::RemoteOperation {
                    label: label.to_string(),
                    message: format!("{e:#}"),
                };
                error!(label, error = %err, "Item failed");
                enter(label, ItemPhase::Failed);
                (false, format!("{e:#}"))
            }
        };

        if let Err(e) = self.reports.append(key, text, success.into()).await {
            error!(label, error = %e, "Failed to record report entry");
        }
        success
    }

    async fn notify(
        &self,
        key: &str,
        label: &str,
        address: Option<&str>,
        last_module: bool,
        mode: RunMode,
    ) {
        match self
            .reports
            .get_digest(key, label, address, last_module, mode)
            .await
        {
            Ok(Some(digest)) => self.sink.send(&digest).await,
            Ok(None) => debug!(label, "No actions to report"),
            Err(e) => warn!(label, error = %e, "Failed to build report digest"),
        }
    }

    async fn pace(&self, label: &str, success: bool) {
        let delay = self.settings.pacing.delay_for(success);
        if delay.is_zero() {
            return;
        }
        debug!(label, secs = delay.as_secs_f64(), "Sleep");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.cancelled() => debug!(label, "Pacing cut short by shutdown"),
        }
    }
}

/// Prefix credential errors with the item and field they came from.
fn in_field<'a>(label: &'a str, field: &'a str) -> impl FnOnce(RunnerError) -> RunnerError + 'a {
    move |e| match e {
        RunnerError::Credential(msg) => RunnerError::Credential(format!("{label} {field}: {msg}")),
        other => other,
    }
}

/// Turn an executor panic into an ordinary item failure.
async fn contain_panic<F>(execution: F) -> anyhow::Result<bool>
where
    F: Future<Output = anyhow::Result<bool>>,
{
    match AssertUnwindSafe(execution).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow::anyhow!("executor panicked: {reason}"))
        }
    }
}

async fn acquire_slot(
    semaphore: &Semaphore,
) -> Result<tokio::sync::SemaphorePermit<'_>, RunnerError> {
    semaphore
        .acquire()
        .await
        .map_err(|_| RunnerError::Configuration("concurrency limiter closed".to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Shared fixtures for orchestrator integration tests.
//!
//! Provides an in-memory `TradeExecutor` that records every call and
//! tracks concurrency, a `NotificationSink` that keeps every digest, and
//! a temp-dir backed queue/report pair with helpers to seed it.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tradequeue::engine::executor::{Account, Group, TradeExecutor};
use tradequeue::engine::orchestrator::{Orchestrator, OrchestratorSettings, Pacing};
use tradequeue::notify::NotificationSink;
use tradequeue::storage::{ReportStore, WorkStore};
use tradequeue::types::{AccountRecord, GroupMember, GroupRecord, ModuleEntry, RunMode};
use tradequeue::vault::Vault;

// ---------------------------------------------------------------------------
// Recording executor
// ---------------------------------------------------------------------------

/// Executor that sleeps for `hold`, then succeeds unless told otherwise.
pub struct RecordingExecutor {
    hold: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    overlaps: AtomicUsize,
    in_flight: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    credentials: Mutex<Vec<String>>,
    fail_labels: Mutex<HashSet<String>>,
    error_labels: Mutex<HashSet<String>>,
    panic_labels: Mutex<HashSet<String>>,
}

impl RecordingExecutor {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            in_flight: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            credentials: Mutex::new(Vec::new()),
            fail_labels: Mutex::new(HashSet::new()),
            error_labels: Mutex::new(HashSet::new()),
            panic_labels: Mutex::new(HashSet::new()),
        }
    }

    /// Return `Ok(false)` for this label.
    pub fn fail_for(&self, label: &str) {
        self.fail_labels.lock().unwrap().insert(label.to_string());
    }

    /// Return an error for this label.
    pub fn error_for(&self, label: &str) {
        self.error_labels.lock().unwrap().insert(label.to_string());
    }

    /// Panic inside the executor for this label.
    pub fn panic_for(&self, label: &str) {
        self.panic_labels.lock().unwrap().insert(label.to_string());
    }

    /// Labels in the order execution started.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Decrypted credentials seen, in call order.
    pub fn credentials(&self) -> Vec<String> {
        self.credentials.lock().unwrap().clone()
    }

    /// Highest number of items executing at the same time.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Times an address started executing while already in flight.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    async fn work(&self, label: &str, addresses: &[&str]) -> Result<bool> {
        self.calls.lock().unwrap().push(label.to_string());
        if self.panic_labels.lock().unwrap().contains(label) {
            panic!("executor bug while trading {label}");
        }
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            for address in addresses {
                if !in_flight.insert(address.to_string()) {
                    self.overlaps.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.hold).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            for address in addresses {
                in_flight.remove(*address);
            }
        }

        if self.error_labels.lock().unwrap().contains(label) {
            return Err(anyhow!("exchange rejected request for {label}"));
        }
        Ok(!self.fail_labels.lock().unwrap().contains(label))
    }
}

#[async_trait]
impl TradeExecutor for RecordingExecutor {
    async fn execute_account(&self, account: &Account, _mode: RunMode) -> Result<bool> {
        self.credentials
            .lock()
            .unwrap()
            .push(account.credential.expose_secret().clone());
        self.work(&account.label, &[account.address.as_str()]).await
    }

    async fn execute_group(&self, group: &Group, _mode: RunMode) -> Result<bool> {
        let addresses = group.addresses();
        self.work(&group.label(), &addresses).await
    }
}

// ---------------------------------------------------------------------------
// Recording sink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSink {
    digests: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn digests(&self) -> Vec<String> {
        self.digests.lock().unwrap().clone()
    }

    /// Digests whose first line is `label`.
    pub fn digests_for(&self, label: &str) -> Vec<String> {
        self.digests()
            .into_iter()
            .filter(|d| d.lines().next() == Some(label))
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, digest: &str) {
        self.digests.lock().unwrap().push(digest.to_string());
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub vault: Arc<Vault>,
    pub store: Arc<WorkStore>,
    pub reports: Arc<ReportStore>,
    pub executor: Arc<RecordingExecutor>,
    pub sink: Arc<RecordingSink>,
}

impl Fixture {
    pub fn new(hold: Duration) -> Self {
        Self::with_vault(Vault::default_key(), hold)
    }

    pub fn with_passphrase(passphrase: &str, hold: Duration) -> Self {
        Self::with_vault(
            Vault::from_passphrase(&SecretString::new(passphrase.to_string())),
            hold,
        )
    }

    fn with_vault(vault: Vault, hold: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkStore::open(dir.path().join("databases/modules.json")).unwrap();
        let reports = ReportStore::open(dir.path().join("databases/report.json")).unwrap();
        Self {
            dir,
            vault: Arc::new(vault),
            store: Arc::new(store),
            reports: Arc::new(reports),
            executor: Arc::new(RecordingExecutor::new(hold)),
            sink: Arc::new(RecordingSink::default()),
        }
    }

    /// Seed single accounts as `(label, address, modules)`. Returns the
    /// queue keys in seeding order.
    pub async fn seed_accounts(&self, accounts: &[(&str, &str, usize)]) -> Vec<String> {
        let records: Vec<(String, AccountRecord)> = accounts
            .iter()
            .map(|(label, address, modules)| {
                let key = self
                    .vault
                    .encrypt(&format!("{address}:secret-{label}"))
                    .unwrap();
                let record = AccountRecord {
                    address: self.vault.encrypt(address).unwrap(),
                    label: label.to_string(),
                    proxy: None,
                    modules: (0..*modules).map(|_| ModuleEntry::trade()).collect(),
                };
                (key, record)
            })
            .collect();
        let keys = records.iter().map(|(key, _)| key.clone()).collect();
        self.store.replace_accounts(records).await.unwrap();
        keys
    }

    /// Seed groups of `(label, address)` members, numbered from 1.
    pub async fn seed_groups(&self, groups: &[&[(&str, &str)]]) -> Vec<String> {
        let records: Vec<(String, GroupRecord)> = groups
            .iter()
            .enumerate()
            .map(|(index, members)| {
                let number = index as u32 + 1;
                let record = GroupRecord {
                    group_number: number,
                    modules: vec![ModuleEntry::trade()],
                    members: members
                        .iter()
                        .map(|(label, address)| GroupMember {
                            credential: self
                                .vault
                                .encrypt(&format!("{address}:secret-{label}"))
                                .unwrap(),
                            address: self.vault.encrypt(address).unwrap(),
                            label: label.to_string(),
                            proxy: None,
                        })
                        .collect(),
                };
                (format!("{number}_1700000000"), record)
            })
            .collect();
        let keys = records.iter().map(|(key, _)| key.clone()).collect();
        self.store.replace_groups(records).await.unwrap();
        keys
    }

    pub fn settings(threads: usize) -> OrchestratorSettings {
        OrchestratorSettings {
            concurrency: threads,
            pacing: Pacing::none(),
            lock_wait_timeout: None,
        }
    }

    pub fn orchestrator(&self, threads: usize) -> Orchestrator {
        self.orchestrator_with(Self::settings(threads))
    }

    pub fn orchestrator_with(&self, settings: OrchestratorSettings) -> Orchestrator {
        Orchestrator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.reports),
            Arc::clone(&self.vault),
            self.executor.clone(),
            self.sink.clone(),
            settings,
        )
    }
}

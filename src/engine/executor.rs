//! Trade executor seam.
//!
//! The orchestrator hands each decrypted account (or group of accounts) to
//! a [`TradeExecutor`] exactly once per run. Executors own any narrower
//! remote-call retries; the orchestrator never re-runs a whole item.
//! Live exchange integration is not part of this crate; the dry-run
//! executor logs what would happen and reports success.

use anyhow::Result;
use async_trait::async_trait;
use secrecy::SecretString;
use tracing::info;

use crate::types::RunMode;

// ---------------------------------------------------------------------------
// Decrypted execution targets
// ---------------------------------------------------------------------------

/// One account with its credential decrypted for this run.
pub struct Account {
    /// Queue and report key.
    pub key: String,
    pub label: String,
    /// Decrypted wallet address; also the resource lock key.
    pub address: String,
    pub credential: SecretString,
    pub proxy: Option<String>,
}

/// A group of accounts traded jointly.
pub struct Group {
    /// Queue and report key.
    pub key: String,
    pub number: u32,
    pub members: Vec<Account>,
}

impl Group {
    pub fn label(&self) -> String {
        format!("Group {}", self.number)
    }

    pub fn addresses(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.address.as_str()).collect()
    }
}

// ---------------------------------------------------------------------------
// Executor trait
// ---------------------------------------------------------------------------

/// Performs the trading action for one item.
///
/// `Ok(true)` is success, `Ok(false)` a handled failure, `Err` an
/// operation that could not complete.
#[async_trait]
pub trait TradeExecutor: Send + Sync {
    async fn execute_account(&self, account: &Account, mode: RunMode) -> Result<bool>;

    async fn execute_group(&self, group: &Group, mode: RunMode) -> Result<bool>;
}

/// Logs each action instead of placing it.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunExecutor;

#[async_trait]
impl TradeExecutor for DryRunExecutor {
    async fn execute_account(&self, account: &Account, mode: RunMode) -> Result<bool> {
        info!(
            label = %account.label,
            address = %account.address,
            proxy = account.proxy.is_some(),
            mode = %mode,
            "[DRY RUN] Would run account"
        );
        Ok(true)
    }

    async fn execute_group(&self, group: &Group, mode: RunMode) -> Result<bool> {
        info!(
            group = group.number,
            members = group.members.len(),
            mode = %mode,
            "[DRY RUN] Would run group"
        );
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

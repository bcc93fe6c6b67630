//! Queue provisioning from input files.
//!
//! Reads API credentials (and optional proxies), encrypts them with the
//! run's vault and overwrites the work queue with either single-account
//! records or randomly formed groups. The report log is cleared first.

use rand::seq::SliceRandom;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

use crate::config::ProvisionConfig;
use crate::storage::{ReportStore, WorkStore};
use crate::types::{
    AccountRecord, GroupMember, GroupRecord, ModuleEntry, ProvisionKind, QueueAmounts,
    RunnerError,
};
use crate::vault::Vault;

/// Shipped placeholder line in the proxies template.
const PROXY_PLACEHOLDER: &str = "http://login:password@ip:port";

/// One account read from the credentials file.
pub struct InputAccount {
    pub label: String,
    /// Wallet address, the key part of the credential.
    pub address: String,
    /// Full `key:secret` credential.
    pub credential: SecretString,
    pub proxy: Option<String>,
}

/// Parse `key:secret` or `label:key:secret` lines.
///
/// Blank lines and `#` comments are skipped. Default labels are
/// `Account N` with N the 1-based line number.
pub fn parse_credentials(raw: &str) -> Result<Vec<InputAccount>, RunnerError> {
    let mut accounts = Vec::new();

    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = line.split(':').collect();
        let (label, key, secret) = match parts.as_slice() {
            [key, secret] => (format!("Account {}", index + 1), *key, *secret),
            [label, key, secret] => (label.to_string(), *key, *secret),
            _ => {
                return Err(RunnerError::Configuration(format!(
                    "Unexpected credential format on line {}",
                    index + 1
                )))
            }
        };
        if key.is_empty() || secret.is_empty() {
            return Err(RunnerError::Configuration(format!(
                "Empty credential field on line {}",
                index + 1
            )));
        }

        accounts.push(InputAccount {
            label,
            address: key.to_string(),
            credential: SecretString::new(format!("{key}:{secret}")),
            proxy: None,
        });
    }

    Ok(accounts)
}

/// Cycle the proxy list to `count` entries. No usable proxies → all `None`.
pub fn parse_proxies(raw: &str, count: usize) -> Vec<Option<String>> {
    let proxies: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|p| !p.is_empty() && !p.starts_with('#'))
        .collect();

    if proxies.is_empty() || proxies == [PROXY_PLACEHOLDER] {
        warn!("No proxies configured");
        return vec![None; count];
    }

    proxies
        .iter()
        .cycle()
        .take(count)
        .map(|p| Some(p.to_string()))
        .collect()
}

/// Builds queue records from parsed accounts.
pub struct Provisioner<'a> {
    settings: &'a ProvisionConfig,
    vault: &'a Vault,
}

impl<'a> Provisioner<'a> {
    pub fn new(settings: &'a ProvisionConfig, vault: &'a Vault) -> Self {
        Self { settings, vault }
    }

    /// One record per account with a random number of trade modules.
    pub fn build_single_queue<R: Rng + ?Sized>(
        &self,
        accounts: &[InputAccount],
        rng: &mut R,
    ) -> Result<Vec<(String, AccountRecord)>, RunnerError> {
        let [min, max] = self.settings.trades_count;

        accounts
            .iter()
            .map(|account| {
                let modules = rng.gen_range(min..=max);
                let record = AccountRecord {
                    address: self.vault.encrypt(&account.address)?,
                    label: account.label.clone(),
                    proxy: account.proxy.clone(),
                    modules: (0..modules).map(|_| ModuleEntry::trade()).collect(),
                };
                Ok((self.vault.encrypt(account.credential.expose_secret())?, record))
            })
            .collect()
    }

    /// Random groups of distinct wallets.
    ///
    /// Every account gets a random number of slots; groups are drawn from
    /// wallets with slots left until fewer than the minimum group size
    /// remain. A draw larger than what is left falls back to the minimum.
    pub fn build_pair_queue<R: Rng + ?Sized>(
        &self,
        accounts: &[InputAccount],
        created_at: i64,
        rng: &mut R,
    ) -> Result<Vec<(String, GroupRecord)>, RunnerError> {
        let [min_size, max_size] = self.settings.pair_size;
        let min_size = min_size.max(2);
        if accounts.len() < min_size {
            return Err(RunnerError::Configuration(format!(
                "Not enough accounts, need at least {min_size}"
            )));
        }

        let members = accounts
            .iter()
            .map(|account| {
                Ok(GroupMember {
                    credential: self.vault.encrypt(account.credential.expose_secret())?,
                    address: self.vault.encrypt(&account.address)?,
                    label: account.label.clone(),
                    proxy: account.proxy.clone(),
                })
            })
            .collect::<Result<Vec<_>, RunnerError>>()?;

        let [min_trades, max_trades] = self.settings.trades_count;
        let mut slots: Vec<u32> = accounts
            .iter()
            .map(|_| rng.gen_range(min_trades..=max_trades))
            .collect();

        let mut groups = Vec::new();
        loop {
            let mut size = rng.gen_range(min_size..=max_size.max(min_size));

            // First account per wallet address with slots left.
            let mut seen = HashSet::new();
            let available: Vec<usize> = (0..accounts.len())
                .filter(|&i| slots[i] > 0 && seen.insert(accounts[i].address.as_str()))
                .collect();

            if available.len() < min_size {
                break;
            }
            if available.len() < size {
                size = min_size;
            }

            let picked: Vec<usize> = available.choose_multiple(rng, size).copied().collect();
            for &i in &picked {
                slots[i] -= 1;
            }
            groups.push(picked);
        }

        Ok(groups
            .into_iter()
            .enumerate()
            .map(|(index, picked)| {
                let number = index as u32 + 1;
                let record = GroupRecord {
                    group_number: number,
                    modules: vec![ModuleEntry::trade()],
                    members: picked.iter().map(|&i| members[i].clone()).collect(),
                };
                (format!("{number}_{created_at}"), record)
            })
            .collect())
    }
}

enum Built {
    Accounts(Vec<(String, AccountRecord)>),
    Groups(Vec<(String, GroupRecord)>),
}

/// Rebuild the work queue from the configured input files.
pub async fn provision(
    kind: ProvisionKind,
    settings: &ProvisionConfig,
    vault: &Vault,
    store: &WorkStore,
    reports: &ReportStore,
) -> Result<QueueAmounts, RunnerError> {
    let mut accounts = parse_credentials(&read_input(&settings.credentials_path)?)?;
    if accounts.is_empty() {
        return Err(RunnerError::Configuration(format!(
            "No credentials found in {}",
            settings.credentials_path
        )));
    }

    let proxies = match settings.proxies_path.as_deref() {
        Some(path) if Path::new(path).exists() => {
            parse_proxies(&read_input(path)?, accounts.len())
        }
        _ => {
            warn!("No proxies configured");
            vec![None; accounts.len()]
        }
    };
    for (account, proxy) in accounts.iter_mut().zip(proxies) {
        account.proxy = proxy;
    }

    let built = {
        let mut rng = rand::thread_rng();
        if settings.shuffle_wallets {
            accounts.shuffle(&mut rng);
        }
        let provisioner = Provisioner::new(settings, vault);
        match kind {
            ProvisionKind::Single => Built::Accounts(provisioner.build_single_queue(&accounts, &mut rng)?),
            ProvisionKind::Pairs => Built::Groups(provisioner.build_pair_queue(
                &accounts,
                chrono::Utc::now().timestamp(),
                &mut rng,
            )?),
        }
    };

    reports.clear().await?;
    match built {
        Built::Accounts(records) => store.replace_accounts(records).await?,
        Built::Groups(records) => store.replace_groups(records).await?,
    }

    let amounts = store.amounts().await?;
    info!(kind = %kind, "Created queue with {amounts}");
    warn!(
        path = %settings.credentials_path,
        "Don't forget to remove API keys from the credentials file"
    );
    Ok(amounts)
}

fn read_input(path: &str) -> Result<String, RunnerError> {
    std::fs::read_to_string(path)
        .map_err(|e| RunnerError::Configuration(format!("Failed to read {path}: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

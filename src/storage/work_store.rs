//! Durable work queue.
//!
//! Key → record document holding either single-account records or group
//! records, never both. Credential fields are opaque encrypted strings
//! here; this store never decrypts anything.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{ensure_document, read_document, write_document, Document};
use crate::types::{
    AccountRecord, GroupRecord, GroupWorkItem, ModuleEntry, QueueAmounts, Removal, RunnerError,
    WorkItem,
};

/// Field whose presence marks a group record.
const GROUP_MARKER: &str = "group_number";

/// Parsed queue document.
#[derive(Debug, Clone, PartialEq)]
enum Queue {
    Empty,
    Accounts(Vec<(String, AccountRecord)>),
    Groups(Vec<(String, GroupRecord)>),
}

pub struct WorkStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl WorkStore {
    /// Open the queue at `path`, creating an empty document if needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RunnerError> {
        let path = path.into();
        ensure_document(&path)?;
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Load every pending single-account item, or `None` if the queue is empty.
    ///
    /// With `unique_wallets` each account yields one item (its first module);
    /// otherwise each pending module is its own item.
    pub async fn load_all_modules(
        &self,
        unique_wallets: bool,
    ) -> Result<Option<Vec<WorkItem>>, RunnerError> {
        let accounts = match self.load()? {
            Queue::Empty => return Ok(None),
            Queue::Accounts(accounts) => accounts,
            Queue::Groups(_) => {
                return Err(RunnerError::Configuration(
                    "queue holds groups; provision single accounts for this mode".to_string(),
                ))
            }
        };

        let mut items = Vec::new();
        for (key, record) in accounts {
            if unique_wallets {
                let module = record
                    .modules
                    .first()
                    .cloned()
                    .unwrap_or_else(ModuleEntry::trade);
                items.push(work_item(&key, &record, module));
            } else {
                for module in record.modules.iter().filter(|m| m.is_pending()) {
                    items.push(work_item(&key, &record, module.clone()));
                }
            }
        }

        Ok(if items.is_empty() { None } else { Some(items) })
    }

    /// Load every group, or `None` if the queue is empty.
    pub async fn load_all_groups(&self) -> Result<Option<Vec<GroupWorkItem>>, RunnerError> {
        let groups = match self.load()? {
            Queue::Empty => return Ok(None),
            Queue::Groups(groups) => groups,
            Queue::Accounts(_) => {
                return Err(RunnerError::Configuration(
                    "queue holds single accounts; provision groups for pair mode".to_string(),
                ))
            }
        };

        let items: Vec<GroupWorkItem> = groups
            .into_iter()
            .map(|(key, record)| GroupWorkItem {
                key,
                group_number: record.group_number,
                modules: record.modules,
                members: record.members,
            })
            .collect();

        Ok(if items.is_empty() { None } else { Some(items) })
    }

    /// Any encrypted credential from the queue, used to verify the vault key.
    pub async fn credential_probe(&self) -> Result<Option<String>, RunnerError> {
        Ok(match self.load()? {
            Queue::Empty => None,
            Queue::Accounts(accounts) => accounts.into_iter().next().map(|(key, _)| key),
            Queue::Groups(groups) => groups
                .into_iter()
                .flat_map(|(_, group)| group.members)
                .next()
                .map(|member| member.credential),
        })
    }

    /// Remove the module `item` executed. Drops the account once it has
    /// no modules left.
    pub async fn remove_module(&self, item: &WorkItem) -> Result<Removal, RunnerError> {
        let _guard = self.write_lock.lock().await;
        let mut document = read_document(&self.path)?;

        let Some(value) = document.get(&item.key) else {
            debug!(label = %item.label, "Module already removed");
            return Ok(Removal::NotFound);
        };
        let mut record: AccountRecord = parse_record(&item.key, value.clone())?;

        let Some(index) = record.modules.iter().position(|m| *m == item.module) else {
            debug!(label = %item.label, module = %item.module.module_name, "Module already removed");
            return Ok(Removal::NotFound);
        };
        record.modules.remove(index);

        let removal = if record.modules.is_empty() {
            document.shift_remove(&item.key);
            Removal::ItemRemoved
        } else {
            let remaining = record.modules.len();
            document.insert(item.key.clone(), to_value(&record)?);
            Removal::ModuleRemoved { remaining }
        };

        write_document(&self.path, &document)?;
        debug!(label = %item.label, ?removal, "Module removed");
        Ok(removal)
    }

    /// Remove a whole account regardless of how many modules it has left.
    pub async fn remove_account(&self, key: &str) -> Result<Removal, RunnerError> {
        self.remove_key(key).await
    }

    /// Remove a whole group. Members are never removed individually.
    pub async fn remove_group(&self, key: &str) -> Result<Removal, RunnerError> {
        self.remove_key(key).await
    }

    pub async fn contains(&self, key: &str) -> Result<bool, RunnerError> {
        Ok(read_document(&self.path)?.contains_key(key))
    }

    pub async fn amounts(&self) -> Result<QueueAmounts, RunnerError> {
        Ok(match self.load()? {
            Queue::Empty => QueueAmounts::default(),
            Queue::Accounts(accounts) => QueueAmounts {
                accounts: accounts.len(),
                groups: 0,
                modules: accounts.iter().map(|(_, r)| r.modules.len()).sum(),
            },
            Queue::Groups(groups) => QueueAmounts {
                accounts: 0,
                groups: groups.len(),
                modules: groups.iter().map(|(_, g)| g.modules.len()).sum(),
            },
        })
    }

    /// Overwrite the queue with freshly provisioned account records.
    pub async fn replace_accounts(
        &self,
        records: Vec<(String, AccountRecord)>,
    ) -> Result<(), RunnerError> {
        self.replace(records).await
    }

    /// Overwrite the queue with freshly provisioned group records.
    pub async fn replace_groups(&self, records: Vec<(String, GroupRecord)>) -> Result<(), RunnerError> {
        self.replace(records).await
    }

    async fn replace<R: Serialize>(&self, records: Vec<(String, R)>) -> Result<(), RunnerError> {
        let _guard = self.write_lock.lock().await;
        let mut document = Document::new();
        for (key, record) in records {
            if document.insert(key.clone(), to_value(&record)?).is_some() {
                return Err(RunnerError::Configuration(format!("duplicate queue key {key}")));
            }
        }
        write_document(&self.path, &document)?;
        info!(path = %self.path.display(), entries = document.len(), "Queue written");
        Ok(())
    }

    async fn remove_key(&self, key: &str) -> Result<Removal, RunnerError> {
        let _guard = self.write_lock.lock().await;
        let mut document = read_document(&self.path)?;
        if document.shift_remove(key).is_none() {
            debug!(key, "Queue entry already removed");
            return Ok(Removal::NotFound);
        }
        write_document(&self.path, &document)?;
        Ok(Removal::ItemRemoved)
    }

    fn load(&self) -> Result<Queue, RunnerError> {
        parse_queue(read_document(&self.path)?)
    }
}

fn work_item(key: &str, record: &AccountRecord, module: ModuleEntry) -> WorkItem {
    WorkItem {
        key: key.to_string(),
        encrypted_address: record.address.clone(),
        label: record.label.clone(),
        proxy: record.proxy.clone(),
        module,
    }
}

/// Classify a document by record shape. Mixed documents are rejected.
fn parse_queue(document: Document) -> Result<Queue, RunnerError> {
    if document.is_empty() {
        return Ok(Queue::Empty);
    }

    let groups = document
        .values()
        .filter(|v| v.get(GROUP_MARKER).is_some())
        .count();

    if groups == 0 {
        let accounts: Vec<(String, AccountRecord)> = document
            .into_iter()
            .map(|(key, value)| parse_record(&key, value).map(|r| (key, r)))
            .collect::<Result<_, _>>()?;
        Ok(Queue::Accounts(accounts))
    } else if groups == document.len() {
        let groups: Vec<(String, GroupRecord)> = document
            .into_iter()
            .map(|(key, value)| parse_record(&key, value).map(|r| (key, r)))
            .collect::<Result<_, _>>()?;
        Ok(Queue::Groups(groups))
    } else {
        Err(RunnerError::Configuration(format!(
            "queue mixes {groups} group records with {} account records",
            document.len() - groups
        )))
    }
}

fn parse_record<R: DeserializeOwned>(key: &str, value: Value) -> Result<R, RunnerError> {
    serde_json::from_value(value)
        .map_err(|e| RunnerError::Configuration(format!("Malformed queue record {key}: {e}")))
}

fn to_value<R: Serialize>(record: &R) -> Result<Value, RunnerError> {
    serde_json::to_value(record)
        .map_err(|e| RunnerError::Storage(format!("Failed to serialise queue record: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

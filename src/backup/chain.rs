use std::collections::HashSet;

use crate::storage::StorageFolder;
use crate::{Error, Result};

use super::metadata::{Backup, BackupSentinel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainIntegrity {
    Valid,
    /// The oldest reachable backup is itself a delta.
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupChainElement {
    pub name: String,
    pub sentinel: BackupSentinel,
}

/// Backups a target depends on, oldest (the full backup) first. Links are
/// followed one sentinel at a time through the names stored in each sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupChain {
    pub target_backup: String,
    pub elements: Vec<BackupChainElement>,
    pub integrity_state: ChainIntegrity,
}

impl BackupChain {
    pub fn from_target_backup(base_folder: &StorageFolder, target_backup: &str) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        let mut current = target_backup.to_string();
        let mut integrity = ChainIntegrity::Valid;

        loop {
            if !seen.insert(current.clone()) {
                return Err(Error::ChainCycle(current).into());
            }
            let sentinel = match Backup::new(base_folder, &current).fetch_sentinel() {
                Ok(sentinel) => sentinel,
                Err(err) if current != target_backup => {
                    if matches!(err.downcast_ref::<Error>(), Some(Error::MissingBackup(_))) {
                        integrity = ChainIntegrity::Incomplete;
                        break;
                    }
                    return Err(err);
                }
                Err(err) => return Err(err),
            };
            let parent = sentinel.increment_from.clone();
            chain.push(BackupChainElement {
                name: current.clone(),
                sentinel,
            });
            match parent {
                None => break,
                Some(parent) => current = parent,
            }
        }

        chain.reverse();

        Ok(Self {
            target_backup: target_backup.to_string(),
            elements: chain,
            integrity_state: integrity,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.integrity_state == ChainIntegrity::Valid
    }

    pub fn base(&self) -> Option<&BackupChainElement> {
        self.elements.first()
    }
}

//! Backup fetch: restores a backup and every backup it was incremented from
//! into an empty directory.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use roaring::RoaringBitmap;
use tracing::{debug, info, warn};

use crate::compression::CompressionRegistry;
use crate::storage::{Folder, StorageFolder, BASEBACKUPS_FOLDER};
use crate::{Error, Result};

use super::chain::{BackupChain, BackupChainElement};
use super::incremental::{
    apply_file_increment, create_file_from_increment, restore_missing_pages,
    write_full_file, write_pages_from_increment,
};
use super::metadata::{
    choose_tablespace_specification, get_base_files_to_unwrap,
    get_restored_backup_files_to_unwrap, is_utility_file, resolve_backup_name, Backup,
    BackupFileDescription, BackupSentinel, TablespaceSpec,
};

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Do not download tars of older backups whose files are all restored.
    pub skip_redundant_tars: bool,
    /// Overrides the tablespace locations recorded by the backup.
    pub restore_spec: Option<TablespaceSpec>,
}

fn ensure_empty_directory(dest: &Path) -> Result<()> {
    if !dest.exists() {
        fs::create_dir_all(dest)?;
        return Ok(());
    }
    if fs::read_dir(dest)?.next().is_some() {
        return Err(Error::NonEmptyDataDirectory(dest.display().to_string()).into());
    }
    Ok(())
}

/// Creates `pg_tblspc/<oid>` links pointing at each tablespace location.
fn prepare_tablespaces(dest: &Path, spec: &TablespaceSpec) -> Result<()> {
    for tablespace in &spec.tablespaces {
        let location = PathBuf::from(&tablespace.location);
        fs::create_dir_all(&location)
            .with_context(|| format!("creating tablespace {}", location.display()))?;
        let link = dest.join(relative_name(Path::new(&tablespace.symlink))?);
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(&location, &link)?;
        info!(symlink = %tablespace.symlink, location = %location.display(), "tablespace_linked");
    }
    Ok(())
}

fn resolve_chain(base_folder: &StorageFolder, backup_name: &str) -> Result<BackupChain> {
    let name = resolve_backup_name(base_folder, backup_name)?;
    let chain = BackupChain::from_target_backup(base_folder, &name)?;
    if !chain.is_complete() {
        let missing = chain
            .base()
            .and_then(|b| b.sentinel.increment_from.clone())
            .unwrap_or_else(|| name.clone());
        return Err(Error::MissingBackup(missing).into());
    }
    info!(backup = %name, chain_length = chain.elements.len(), "backup_chain_resolved");
    Ok(chain)
}

/// Files each chain element must provide, oldest first.
fn files_to_unwrap_per_backup(chain: &BackupChain) -> Result<Vec<HashSet<String>>> {
    let mut sets = Vec::with_capacity(chain.elements.len());
    let Some(target) = chain.elements.last() else {
        return Ok(sets);
    };
    let mut current = get_restored_backup_files_to_unwrap(&target.sentinel);
    for (i, element) in chain.elements.iter().enumerate().rev() {
        let next = if i > 0 {
            get_base_files_to_unwrap(&element.sentinel.files, &current)?
        } else {
            HashSet::new()
        };
        sets.push(std::mem::replace(&mut current, next));
    }
    sets.reverse();
    Ok(sets)
}

fn open_tar(
    registry: &CompressionRegistry,
    folder: &StorageFolder,
    object: &str,
) -> Result<tar::Archive<Box<dyn Read + Send>>> {
    let (_, method) = registry.split_extension(object);
    let reader = registry.decompress(method, folder.read_object(object)?)?;
    Ok(tar::Archive::new(reader))
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    let path = entry.path()?;
    relative_name(&path)
}

/// Normalizes an archive path to a name inside the destination. Absolute
/// paths and `..` components are rejected.
fn relative_name(path: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::UnsafeArchivePath(path.display().to_string()).into());
            }
        }
    }
    Ok(parts.join("/"))
}

fn set_mode(target: &Path, mode: u32) -> Result<()> {
    if mode != 0 {
        fs::set_permissions(target, fs::Permissions::from_mode(mode & 0o7777))?;
    }
    Ok(())
}

fn ensure_parent(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

enum FileKind {
    Full,
    Increment,
    Skipped,
}

fn file_kind(name: &str, description: Option<&BackupFileDescription>) -> Result<FileKind> {
    match description {
        Some(d) if d.is_skipped => Ok(FileKind::Skipped),
        Some(d) if d.is_incremented => Ok(FileKind::Increment),
        Some(_) => Ok(FileKind::Full),
        None if is_utility_file(name) => Ok(FileKind::Full),
        None => Err(Error::MissingFileDescription(name.to_string()).into()),
    }
}

/// Restores the chain oldest first: each backup is unpacked in full and the
/// next one's increments are applied on top.
pub fn fetch_backup_old(
    storage: &StorageFolder,
    registry: &CompressionRegistry,
    backup_name: &str,
    dest: &Path,
    restore_spec: Option<TablespaceSpec>,
) -> Result<BackupSentinel> {
    let base_folder = storage.sub_folder(BASEBACKUPS_FOLDER);
    let chain = resolve_chain(&base_folder, backup_name)?;
    let sets = files_to_unwrap_per_backup(&chain)?;
    let Some(target) = chain.elements.last() else {
        return Err(Error::MissingBackup(backup_name.to_string()).into());
    };
    fs::create_dir_all(dest)?;
    if let Some(spec) =
        choose_tablespace_specification(target.sentinel.tablespace_spec.clone(), restore_spec)
    {
        prepare_tablespaces(dest, &spec)?;
    }

    for (element, to_unwrap) in chain.elements.iter().zip(&sets) {
        let backup = Backup::new(&base_folder, &element.name);
        let tar_folder = backup.tar_folder();
        for object in backup.tar_names()? {
            debug!(backup = %element.name, tar = %object, "unwrapping_tar");
            let mut archive = open_tar(registry, &tar_folder, &object)?;
            for entry in archive.entries()? {
                let mut entry = entry?;
                let name = entry_name(&entry)?;
                let target_path = dest.join(&name);
                let mode = entry.header().mode().unwrap_or(0);
                if entry.header().entry_type().is_dir() {
                    fs::create_dir_all(&target_path)?;
                    continue;
                }
                if !to_unwrap.contains(&name) {
                    continue;
                }
                ensure_parent(&target_path)?;
                match file_kind(&name, element.sentinel.files.get(&name))? {
                    FileKind::Increment => apply_file_increment(&mut entry, &target_path)
                        .with_context(|| format!("applying increment to {name}"))?,
                    FileKind::Full => {
                        write_full_file(&mut entry, &target_path)?;
                        set_mode(&target_path, mode)?;
                    }
                    FileKind::Skipped => {}
                }
            }
        }
        info!(backup = %element.name, "backup_unwrapped");
    }
    Ok(target.sentinel.clone())
}

#[derive(Default)]
struct RestoreState {
    /// Blocks already written for files restored from increments.
    written: HashMap<String, RoaringBitmap>,
    completed: HashSet<String>,
}

impl RestoreState {
    fn restore_entry<R: Read>(
        &mut self,
        name: &str,
        kind: FileKind,
        entry: &mut R,
        target: &Path,
        mode: u32,
    ) -> Result<()> {
        match kind {
            FileKind::Skipped => {}
            FileKind::Increment => match self.written.get_mut(name) {
                Some(written) => write_pages_from_increment(entry, target, written)?,
                None => {
                    ensure_parent(target)?;
                    let written = create_file_from_increment(entry, target)?;
                    set_mode(target, mode)?;
                    self.written.insert(name.to_string(), written);
                }
            },
            FileKind::Full => {
                match self.written.remove(name) {
                    Some(written) => restore_missing_pages(entry, target, &written)?,
                    None => {
                        ensure_parent(target)?;
                        write_full_file(entry, target)?;
                        set_mode(target, mode)?;
                    }
                }
                self.completed.insert(name.to_string());
            }
        }
        Ok(())
    }
}

fn tar_is_needed(
    sentinel: &BackupSentinel,
    object: &str,
    to_unwrap: &HashSet<String>,
    state: &RestoreState,
) -> bool {
    match sentinel.tar_file_sets.get(object) {
        Some(files) => files
            .iter()
            .any(|f| to_unwrap.contains(f) && !state.completed.contains(f)),
        None => true,
    }
}

struct ReverseUnwrapper<'a> {
    base_folder: &'a StorageFolder,
    registry: &'a CompressionRegistry,
    dest: &'a Path,
    skip_redundant_tars: bool,
    state: RestoreState,
}

impl ReverseUnwrapper<'_> {
    fn unwrap(
        &mut self,
        element: &BackupChainElement,
        to_unwrap: &HashSet<String>,
        is_target: bool,
    ) -> Result<()> {
        let backup = Backup::new(self.base_folder, &element.name);
        let tar_folder = backup.tar_folder();
        for object in backup.tar_names()? {
            if !is_target
                && self.skip_redundant_tars
                && !tar_is_needed(&element.sentinel, &object, to_unwrap, &self.state)
            {
                debug!(backup = %element.name, tar = %object, "skipping_redundant_tar");
                continue;
            }
            debug!(backup = %element.name, tar = %object, "unwrapping_tar");
            let mut archive = open_tar(self.registry, &tar_folder, &object)?;
            for entry in archive.entries()? {
                let mut entry = entry?;
                let name = entry_name(&entry)?;
                let target_path = self.dest.join(&name);
                let mode = entry.header().mode().unwrap_or(0);
                if entry.header().entry_type().is_dir() {
                    // older backups may list directories dropped since
                    if is_target {
                        fs::create_dir_all(&target_path)?;
                    }
                    continue;
                }
                if !to_unwrap.contains(&name) || self.state.completed.contains(&name) {
                    continue;
                }
                let kind = file_kind(&name, element.sentinel.files.get(&name))?;
                self.state
                    .restore_entry(&name, kind, &mut entry, &target_path, mode)
                    .with_context(|| format!("restoring {name} from {}", element.name))?;
            }
        }
        Ok(())
    }
}

/// Restores the chain newest first. Pages written from a newer backup are
/// never overwritten by an older one, and each file is finished as soon as a
/// full copy of it is reached.
pub fn fetch_backup(
    storage: &StorageFolder,
    registry: &CompressionRegistry,
    backup_name: &str,
    dest: &Path,
    options: FetchOptions,
) -> Result<BackupSentinel> {
    ensure_empty_directory(dest)?;
    let base_folder = storage.sub_folder(BASEBACKUPS_FOLDER);
    let chain = resolve_chain(&base_folder, backup_name)?;
    let Some(target) = chain.elements.last() else {
        return Err(Error::MissingBackup(backup_name.to_string()).into());
    };
    if let Some(spec) = choose_tablespace_specification(
        target.sentinel.tablespace_spec.clone(),
        options.restore_spec.clone(),
    ) {
        prepare_tablespaces(dest, &spec)?;
    }

    let mut unwrapper = ReverseUnwrapper {
        base_folder: &base_folder,
        registry,
        dest,
        skip_redundant_tars: options.skip_redundant_tars,
        state: RestoreState::default(),
    };
    let mut to_unwrap = get_restored_backup_files_to_unwrap(&target.sentinel);
    for (i, element) in chain.elements.iter().rev().enumerate() {
        unwrapper.unwrap(element, &to_unwrap, i == 0)?;
        info!(backup = %element.name, "backup_unwrapped");
        let mut next = get_base_files_to_unwrap(&element.sentinel.files, &to_unwrap)?;
        next.retain(|name| !unwrapper.state.completed.contains(name));
        to_unwrap = next;
        if to_unwrap.is_empty() {
            break;
        }
    }
    for name in unwrapper.state.written.keys() {
        warn!(file = %name, "file_restored_from_increments_only");
    }
    Ok(target.sentinel.clone())
}

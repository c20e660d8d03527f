//! Object storage. Backends are a closed set selected once at startup; all of
//! them expose the same folder capability.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use time::OffsetDateTime;
use tracing::debug;

use crate::{Error, Result};

pub const WAL_FOLDER: &str = "wal_005";
pub const BASEBACKUPS_FOLDER: &str = "basebackups_005";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub name: String,
    pub size: u64,
    pub last_modified: OffsetDateTime,
}

/// Capability every storage backend provides. Object names may contain `/`
/// to address nested folders.
pub trait Folder {
    fn exists(&self, name: &str) -> Result<bool>;
    /// Direct children: objects and sub-folder names.
    fn list_folder(&self) -> Result<(Vec<ObjectInfo>, Vec<String>)>;
    fn read_object(&self, name: &str) -> Result<Box<dyn Read + Send>>;
    fn put_object(&self, name: &str, content: &mut dyn Read) -> Result<()>;
    fn delete_objects(&self, names: &[String]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum StorageFolder {
    Fs(FsFolder),
    Memory(MemoryFolder),
}

impl StorageFolder {
    pub fn fs(root: impl Into<PathBuf>) -> Self {
        StorageFolder::Fs(FsFolder { root: root.into() })
    }

    pub fn memory() -> Self {
        StorageFolder::Memory(MemoryFolder::default())
    }

    pub fn sub_folder(&self, name: &str) -> StorageFolder {
        match self {
            StorageFolder::Fs(f) => StorageFolder::Fs(FsFolder {
                root: f.root.join(name),
            }),
            StorageFolder::Memory(m) => StorageFolder::Memory(MemoryFolder {
                objects: Arc::clone(&m.objects),
                prefix: format!("{}{}/", m.prefix, name.trim_matches('/')),
            }),
        }
    }

    fn backend(&self) -> &dyn Folder {
        match self {
            StorageFolder::Fs(f) => f,
            StorageFolder::Memory(m) => m,
        }
    }

    pub fn put_bytes(&self, name: &str, content: &[u8]) -> Result<()> {
        self.put_object(name, &mut &content[..])
    }

    pub fn read_all(&self, name: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_object(name)?.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Folder for StorageFolder {
    fn exists(&self, name: &str) -> Result<bool> {
        self.backend().exists(name)
    }

    fn list_folder(&self) -> Result<(Vec<ObjectInfo>, Vec<String>)> {
        self.backend().list_folder()
    }

    fn read_object(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        self.backend().read_object(name)
    }

    fn put_object(&self, name: &str, content: &mut dyn Read) -> Result<()> {
        self.backend().put_object(name, content)
    }

    fn delete_objects(&self, names: &[String]) -> Result<()> {
        self.backend().delete_objects(names)
    }
}

/// Objects stored as plain files under a root directory.
#[derive(Debug, Clone)]
pub struct FsFolder {
    root: PathBuf,
}

impl FsFolder {
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Folder for FsFolder {
    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.root.join(name).is_file())
    }

    fn list_folder(&self) -> Result<(Vec<ObjectInfo>, Vec<String>)> {
        let mut objects = Vec::new();
        let mut folders = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((objects, folders)),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.metadata()?;
            if meta.is_dir() {
                folders.push(name);
            } else if !name.ends_with(".tmp") {
                let last_modified = meta
                    .modified()
                    .map(OffsetDateTime::from)
                    .unwrap_or(OffsetDateTime::UNIX_EPOCH);
                objects.push(ObjectInfo {
                    name,
                    size: meta.len(),
                    last_modified,
                });
            }
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        folders.sort();
        Ok((objects, folders))
    }

    fn read_object(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.root.join(name);
        match File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::ArchiveNonExistence(name.to_string()).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn put_object(&self, name: &str, content: &mut dyn Read) -> Result<()> {
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut out = File::create(&tmp)?;
            io::copy(content, &mut out)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        debug!(object = %path.display(), "storage_put_object");
        Ok(())
    }

    fn delete_objects(&self, names: &[String]) -> Result<()> {
        for name in names {
            match fs::remove_file(self.root.join(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Process-local storage, shared between clones and sub-folders.
#[derive(Debug, Clone, Default)]
pub struct MemoryFolder {
    objects: Arc<DashMap<String, (Bytes, OffsetDateTime)>>,
    prefix: String,
}

impl MemoryFolder {
    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

impl Folder for MemoryFolder {
    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.objects.contains_key(&self.key(name)))
    }

    fn list_folder(&self) -> Result<(Vec<ObjectInfo>, Vec<String>)> {
        let mut objects = Vec::new();
        let mut folders = BTreeSet::new();
        for entry in self.objects.iter() {
            let Some(rest) = entry.key().strip_prefix(&self.prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((folder, _)) => {
                    folders.insert(folder.to_string());
                }
                None => {
                    let (content, modified) = entry.value();
                    objects.push(ObjectInfo {
                        name: rest.to_string(),
                        size: content.len() as u64,
                        last_modified: *modified,
                    });
                }
            }
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok((objects, folders.into_iter().collect()))
    }

    fn read_object(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let content = self
            .objects
            .get(&self.key(name))
            .map(|entry| entry.value().0.clone())
            .ok_or_else(|| Error::ArchiveNonExistence(name.to_string()))?;
        Ok(Box::new(io::Cursor::new(content)))
    }

    fn put_object(&self, name: &str, content: &mut dyn Read) -> Result<()> {
        let mut buf = Vec::new();
        content.read_to_end(&mut buf)?;
        self.objects
            .insert(self.key(name), (Bytes::from(buf), OffsetDateTime::now_utc()));
        Ok(())
    }

    fn delete_objects(&self, names: &[String]) -> Result<()> {
        for name in names {
            self.objects.remove(&self.key(name));
        }
        Ok(())
    }
}

/// Local scratch directory used to carry unfinished delta state between runs.
#[derive(Debug, Clone)]
pub struct DataFolder {
    path: PathBuf,
}

impl DataFolder {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_exists(&self, name: &str) -> bool {
        self.path.join(name).is_file()
    }

    pub fn open_readonly(&self, name: &str) -> Result<Option<File>> {
        match File::open(self.path.join(name)) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, name: &str, content: &[u8]) -> Result<()> {
        let mut file = File::create(self.path.join(name))?;
        file.write_all(content)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.path.join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes every regular file in the folder.
    pub fn clean_folder(&self) -> Result<()> {
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

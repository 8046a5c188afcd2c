// src/dir_cache.rs
//
// Memoized directory listings for /sys and /proc traversal, persisted
// together with the resolved control-file table.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::locator::ControlFileTable;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub subdirs: Vec<String>,
    pub files: Vec<String>,
}

impl DirEntry {
    pub fn has_file(&self, name: &str) -> bool {
        self.files.iter().any(|f| f == name)
    }
}

/// On-disk layout: directory paths at the top level plus a `resolved` table.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheFile {
    #[serde(default)]
    pub resolved: Option<ControlFileTable>,
    #[serde(flatten)]
    pub directories: BTreeMap<String, DirEntry>,
}

#[derive(Debug, Default)]
pub struct DirectoryCache {
    cache_file: Option<PathBuf>,
    entries: HashMap<PathBuf, DirEntry>,
}

/// List a directory, following symlinks to decide what is a directory.
/// Names are sorted so walks are deterministic.
fn read_listing(path: &Path) -> io::Result<DirEntry> {
    let mut entry = DirEntry::default();
    for item in fs::read_dir(path)? {
        let item = item?;
        let name = item.file_name().to_string_lossy().into_owned();
        let file_type = item.file_type()?;
        let is_dir = if file_type.is_symlink() {
            // dangling links count as files
            fs::metadata(item.path()).map(|m| m.is_dir()).unwrap_or(false)
        } else {
            file_type.is_dir()
        };
        if is_dir {
            entry.subdirs.push(name);
        } else {
            entry.files.push(name);
        }
    }
    entry.subdirs.sort();
    entry.files.sort();
    Ok(entry)
}

impl DirectoryCache {
    /// In-memory cache with no backing file.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(cache_file: PathBuf) -> Self {
        Self {
            cache_file: Some(cache_file),
            entries: HashMap::new(),
        }
    }

    pub fn cache_file(&self) -> Option<&Path> {
        self.cache_file.as_deref()
    }

    pub fn get(&self, path: &Path) -> Option<&DirEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Listing for `path`, read from disk the first time it is asked for.
    /// Unreadable directories yield `None`; permission errors are expected
    /// under /sys and are not reported.
    pub fn entry(&mut self, path: &Path) -> Option<&DirEntry> {
        if !self.entries.contains_key(path) {
            match read_listing(path) {
                Ok(entry) => {
                    self.entries.insert(path.to_path_buf(), entry);
                }
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    debug!("Skipping unreadable directory {}", path.display());
                    return None;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
                Err(e) => {
                    warn!("Could not list {}: {}", path.display(), e);
                    return None;
                }
            }
        }
        self.entries.get(path)
    }

    /// `dir/name` if the listing of `dir` contains a file called `name`.
    pub fn find_file(&mut self, dir: &Path, name: &str) -> Option<PathBuf> {
        self.entry(dir)
            .filter(|e| e.has_file(name))
            .map(|_| dir.join(name))
    }

    /// Depth-first, pre-order walk below `root`.
    pub fn walk(&mut self, root: &Path) -> Walk<'_> {
        Walk {
            cache: self,
            stack: vec![root.to_path_buf()],
            seen: HashSet::new(),
        }
    }

    /// Persist every memoized listing plus the resolved table.
    pub fn save(&self, resolved: Option<&ControlFileTable>) -> Result<()> {
        let Some(path) = &self.cache_file else {
            return Ok(());
        };

        let file = CacheFile {
            resolved: resolved.cloned(),
            directories: self
                .entries
                .iter()
                .map(|(k, v)| (k.to_string_lossy().into_owned(), v.clone()))
                .collect(),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string(&file).context("Failed to serialize directory cache")?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        debug!("Saved {} directory entries to {}", self.entries.len(), path.display());
        Ok(())
    }

    /// Replace the in-memory listings with the persisted ones. A missing or
    /// corrupt file is a cache miss.
    pub fn load(&mut self) -> Option<CacheFile> {
        let path = self.cache_file.as_ref()?;
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                debug!("No directory cache at {}: {}", path.display(), e);
                return None;
            }
        };
        let file: CacheFile = match serde_json::from_str(&text) {
            Ok(file) => file,
            Err(e) => {
                warn!("Ignoring corrupt directory cache {}: {}", path.display(), e);
                return None;
            }
        };

        self.entries = file
            .directories
            .iter()
            .map(|(k, v)| (PathBuf::from(k), v.clone()))
            .collect();
        Some(file)
    }

    pub fn remove_file(&self) -> Result<()> {
        match &self.cache_file {
            Some(path) if path.exists() => {
                fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))
            }
            _ => Ok(()),
        }
    }
}

/// Lazy walk over the cache. Each canonical directory is expanded at most
/// once per walk, so symlink cycles terminate.
pub struct Walk<'a> {
    cache: &'a mut DirectoryCache,
    stack: Vec<PathBuf>,
    seen: HashSet<PathBuf>,
}

impl Iterator for Walk<'_> {
    type Item = (PathBuf, Vec<String>, Vec<String>);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(path) = self.stack.pop() {
            let real = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
            if !self.seen.insert(real) {
                continue;
            }

            let Some(entry) = self.cache.entry(&path) else {
                continue;
            };
            let (subdirs, files) = (entry.subdirs.clone(), entry.files.clone());

            for name in subdirs.iter().rev() {
                self.stack.push(path.join(name));
            }
            return Some((path, subdirs, files));
        }
        None
    }
}

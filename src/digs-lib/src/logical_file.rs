use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use crate::{
    non_null_attr, DigsResult, FileListCache, ReplicaRegistry, ATTR_GROUP, ATTR_MD5SUM,
    ATTR_PERMISSIONS, ATTR_REPLICA_COUNT, ATTR_SUBMITTER,
};

fn leaf_name(path: &str) -> String {
    match path.rfind('/') {
        Some(pos) => path[pos + 1..].to_string(),
        None => path.to_string(),
    }
}

fn dir_prefix(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!("{}/", path)
    }
}

/// Substring match, or exact membership for `list:a,b,c` filters.
pub fn filter_matches(path: &str, filter: &str) -> bool {
    match filter.strip_prefix("list:") {
        Some(list) => list.split(',').any(|entry| entry == path),
        None => path.contains(filter),
    }
}

/// Folders created locally that the registry does not know about yet.
#[derive(Debug, Default)]
pub struct NewFolders {
    folders: Mutex<BTreeSet<String>>,
}

impl NewFolders {
    pub fn add(&self, path: &str) {
        if let Ok(mut folders) = self.folders.lock() {
            folders.insert(path.trim_end_matches('/').to_string());
        }
    }

    /// Removes `path` and every pending folder beneath it.
    pub fn remove(&self, path: &str) {
        let path = path.trim_end_matches('/');
        let nested = format!("{}/", path);
        if let Ok(mut folders) = self.folders.lock() {
            folders.retain(|f| f != path && !f.starts_with(&nested));
        }
    }

    pub fn list(&self) -> Vec<String> {
        self.folders
            .lock()
            .map(|f| f.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// One logical file. Lock state and size come from the background cache,
/// everything else is read from the registry on demand.
#[derive(Clone)]
pub struct LogicalFile {
    path: String,
    name: String,
    registry: Arc<dyn ReplicaRegistry>,
    cache: Arc<FileListCache>,
}

impl LogicalFile {
    pub fn new(path: &str, registry: Arc<dyn ReplicaRegistry>, cache: Arc<FileListCache>) -> Self {
        Self {
            path: path.to_string(),
            name: leaf_name(path),
            registry,
            cache,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn locked_by(&self) -> DigsResult<Option<String>> {
        Ok(non_null_attr(self.cache.lock_holder(&self.path).await?))
    }

    pub async fn is_locked(&self) -> DigsResult<bool> {
        Ok(self.locked_by().await?.is_some())
    }

    /// `None` when the cache has no size for this file.
    pub async fn size(&self) -> DigsResult<Option<u64>> {
        self.cache.file_size(&self.path).await
    }

    async fn attribute(&self, attr: &str) -> Option<String> {
        match self.registry.get_attribute(&self.path, attr).await {
            Ok(v) => non_null_attr(v),
            Err(e) => {
                debug!("read {} of {} failed: {}", attr, self.path, e);
                None
            }
        }
    }

    pub async fn owner(&self) -> Option<String> {
        self.attribute(ATTR_SUBMITTER).await
    }

    pub async fn checksum(&self) -> Option<String> {
        self.attribute(ATTR_MD5SUM).await
    }

    pub async fn group(&self) -> Option<String> {
        self.attribute(ATTR_GROUP).await
    }

    pub async fn permissions(&self) -> Option<String> {
        self.attribute(ATTR_PERMISSIONS).await
    }

    /// Explicit replica count, 0 when unset or unreadable.
    pub async fn replica_count(&self) -> u32 {
        self.attribute(ATTR_REPLICA_COUNT)
            .await
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(0)
    }

    pub async fn locations(&self) -> Option<Vec<String>> {
        self.registry.get_file_locations(&self.path).await.ok()
    }

    pub fn matches(&self, filter: &str) -> bool {
        filter_matches(&self.path, filter)
    }
}

#[derive(Clone)]
pub struct LogicalDirectory {
    path: String,
    name: String,
    registry: Arc<dyn ReplicaRegistry>,
    cache: Arc<FileListCache>,
    new_folders: Arc<NewFolders>,
}

pub enum LogicalEntry {
    File(LogicalFile),
    Directory(LogicalDirectory),
}

impl LogicalEntry {
    pub fn path(&self) -> &str {
        match self {
            LogicalEntry::File(f) => f.path(),
            LogicalEntry::Directory(d) => d.path(),
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, LogicalEntry::Directory(_))
    }
}

impl LogicalDirectory {
    pub fn new(
        path: &str,
        registry: Arc<dyn ReplicaRegistry>,
        cache: Arc<FileListCache>,
        new_folders: Arc<NewFolders>,
    ) -> Self {
        let path = path.trim_end_matches('/');
        Self {
            path: path.to_string(),
            name: leaf_name(path),
            registry,
            cache,
            new_folders,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn child_dir(&self, name: &str) -> LogicalDirectory {
        LogicalDirectory::new(
            &format!("{}{}", dir_prefix(&self.path), name),
            self.registry.clone(),
            self.cache.clone(),
            self.new_folders.clone(),
        )
    }

    /// Immediate children, files before directories, each sorted by name.
    pub async fn children(&self) -> DigsResult<Vec<LogicalEntry>> {
        let sizes = self.cache.size_list().await?;
        let prefix = dir_prefix(&self.path);

        let mut files = BTreeSet::new();
        let mut dirs = BTreeSet::new();
        let pending = self.new_folders.list();
        let known = sizes.keys().map(|k| (k.as_str(), false));
        let local = pending.iter().map(|k| (k.as_str(), true));
        for (lfn, is_folder) in known.chain(local) {
            let rest = match lfn.strip_prefix(prefix.as_str()) {
                Some(rest) if !rest.is_empty() => rest,
                _ => continue,
            };
            match rest.find('/') {
                Some(slash) => {
                    dirs.insert(rest[..slash].to_string());
                }
                None if is_folder => {
                    dirs.insert(rest.to_string());
                }
                None => {
                    files.insert(lfn.to_string());
                }
            }
        }

        let mut entries = Vec::with_capacity(files.len() + dirs.len());
        for lfn in files {
            entries.push(LogicalEntry::File(LogicalFile::new(
                &lfn,
                self.registry.clone(),
                self.cache.clone(),
            )));
        }
        for dir in dirs {
            entries.push(LogicalEntry::Directory(self.child_dir(&dir)));
        }
        Ok(entries)
    }

    /// Every logical file beneath this directory with its cached size.
    pub async fn contained_files(&self) -> DigsResult<BTreeMap<String, Option<u64>>> {
        let sizes = self.cache.size_list().await?;
        let prefix = dir_prefix(&self.path);
        Ok(sizes
            .iter()
            .filter(|(lfn, _)| lfn.starts_with(&prefix))
            .map(|(lfn, size)| (lfn.clone(), size.trim().parse::<u64>().ok()))
            .collect())
    }

    pub async fn size(&self) -> DigsResult<u64> {
        Ok(self
            .contained_files()
            .await?
            .values()
            .filter_map(|s| *s)
            .sum())
    }

    pub async fn matches(&self, filter: &str) -> DigsResult<bool> {
        if !filter.starts_with("list:") && self.path.contains(filter) {
            return Ok(true);
        }
        Ok(self
            .contained_files()
            .await?
            .keys()
            .any(|lfn| filter_matches(lfn, filter)))
    }
}

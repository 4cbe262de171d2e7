use async_recursion::async_recursion;
use std::path::{Path, PathBuf};

use super::{checksum_file, dir_prefix, flatten_lfn, normalize_lfn, required_kb, DigsClient};
use crate::{ControlCommand, DigsError, DigsResult, StorageNode, TransferContext};

/// Size and checksum of a local file about to be uploaded.
struct LocalSource {
    size: u64,
    md5: String,
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

impl DigsClient {
    async fn inspect_local(&self, local: &Path) -> DigsResult<LocalSource> {
        let meta = match tokio::fs::metadata(local).await {
            Ok(meta) if meta.is_file() => meta,
            _ => {
                return Err(DigsError::NotFound(format!(
                    "Local file {} not found",
                    local.display()
                )))
            }
        };
        let md5 = checksum_file(local).await?;
        Ok(LocalSource {
            size: meta.len(),
            md5,
        })
    }

    /// Uploads `local` to the inbox of the first node that accepts it. Nodes
    /// are taken from the space filter in preference order; a failed node is
    /// logged and the next one tried. Returns the node that took the copy.
    async fn place_file(
        &self,
        local: &Path,
        lfn: &str,
        size: u64,
        ctx: &TransferContext,
    ) -> DigsResult<String> {
        let flat = flatten_lfn(lfn);
        let version = self.digs_version();
        for name in self.nodes_with_space(required_kb(size)) {
            let node = match self.node(&name) {
                Ok(node) => node,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };
            if !node.is_usable_for_put() {
                debug!("skip {} for {}: node not accepting new files", name, lfn);
                continue;
            }

            let remote = format!("{}/{}", node.inbox_path(version), flat);
            match self.put_to_node(&node, local, &remote, ctx).await {
                Ok(()) => {
                    info!("{} uploaded to {}:{}", lfn, name, remote);
                    return Ok(name);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!("put {} to {} failed: {}", lfn, name, e),
            }
        }
        Err(DigsError::NoNodeAvailable(format!(
            "No storage node available for {}",
            lfn
        )))
    }

    async fn put_to_node(
        &self,
        node: &StorageNode,
        local: &Path,
        remote: &str,
        ctx: &TransferContext,
    ) -> DigsResult<()> {
        let element = self.transport.storage_element(node)?;
        element.put_file(local, remote, ctx).await
    }

    /// Stores a new logical file and returns the node holding the first copy.
    pub async fn put_file(
        &self,
        local: &Path,
        lfn: &str,
        ctx: &TransferContext,
    ) -> DigsResult<String> {
        self.ensure_main()?;
        let lfn = normalize_lfn(lfn);
        if self.registry.lfn_exists(&lfn).await? {
            return Err(DigsError::AlreadyExists(format!(
                "File {} already exists on grid",
                lfn
            )));
        }

        let source = self.inspect_local(local).await?;
        let node = self.place_file(local, &lfn, source.size, ctx).await?;

        self.send(ControlCommand::PutFile {
            lfn: lfn.clone(),
            group: self.user_group(),
            permissions: "private".to_string(),
            size: source.size,
            md5: source.md5,
            timestamp: now_secs(),
            submitter: self.user_dn().to_string(),
        })
        .await?;
        self.send(ControlCommand::Check { node: node.clone() })
            .await?;
        self.request_cache_refresh();
        Ok(node)
    }

    /// Replaces the contents of an existing logical file.
    pub async fn modify_file(
        &self,
        local: &Path,
        lfn: &str,
        ctx: &TransferContext,
    ) -> DigsResult<String> {
        self.ensure_main()?;
        let lfn = normalize_lfn(lfn);
        let source = self.inspect_local(local).await?;
        let node = self.place_file(local, &lfn, source.size, ctx).await?;

        self.send(ControlCommand::Modify {
            lfn,
            node: node.clone(),
            md5: source.md5,
            size: source.size,
            timestamp: now_secs(),
        })
        .await?;
        self.send(ControlCommand::Check { node: node.clone() })
            .await?;
        self.request_cache_refresh();
        Ok(node)
    }

    /// Puts every file below `local_dir` under `ldn`, keeping the relative layout.
    #[async_recursion]
    pub async fn put_directory(
        &self,
        local_dir: &Path,
        ldn: &str,
        ctx: &TransferContext,
    ) -> DigsResult<Vec<String>> {
        self.ensure_main()?;
        let is_dir = tokio::fs::metadata(local_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(DigsError::InvalidParam(format!(
                "{} is not a directory",
                local_dir.display()
            )));
        }

        let mut children: Vec<(String, PathBuf, bool)> = Vec::new();
        let mut entries = tokio::fs::read_dir(local_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let is_dir = entry.file_type().await?.is_dir();
            let name = entry.file_name().to_string_lossy().to_string();
            children.push((name, entry.path(), is_dir));
        }
        children.sort();

        let mut stored = Vec::new();
        for (name, path, is_dir) in children {
            let lfn = normalize_lfn(&format!("{}/{}", ldn, name));
            if is_dir {
                stored.extend(self.put_directory(&path, &lfn, ctx).await?);
            } else {
                info!("{} => {}", path.display(), lfn);
                self.put_file(&path, &lfn, ctx).await?;
                stored.push(lfn);
            }
        }
        Ok(stored)
    }

    /// Copies `lfn` to `local` from the first reachable replica, preferred
    /// nodes first. Dead and disabled nodes are skipped.
    pub async fn get_file(&self, lfn: &str, local: &Path, ctx: &TransferContext) -> DigsResult<()> {
        let lfn = normalize_lfn(lfn);
        let locations = self.registry.get_file_locations(&lfn).await?;
        for location in self.sort_by_preference(&locations) {
            debug!("trying location {} for {}", location, lfn);
            let node = match self.node(&location) {
                Ok(node) => node,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };
            if !node.is_readable() {
                debug!("skip {} for {}: node is dead or disabled", location, lfn);
                continue;
            }

            match self.get_from_node(&node, &lfn, local, ctx).await {
                Ok(()) => {
                    info!("{} retrieved from {}", lfn, location);
                    return Ok(());
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!("error retrieving {} from {}: {}", lfn, location, e),
            }
        }
        Err(DigsError::AllCopiesInaccessible(lfn))
    }

    async fn get_from_node(
        &self,
        node: &StorageNode,
        lfn: &str,
        local: &Path,
        ctx: &TransferContext,
    ) -> DigsResult<()> {
        let disk = self
            .registry
            .get_file_disk(lfn, &node.name)
            .await?
            .ok_or_else(|| {
                DigsError::Registry(format!("no directory recorded for {} on {}", lfn, node.name))
            })?;
        let remote = format!("{}/{}/{}", node.path, disk, lfn);
        let element = self.transport.storage_element(node)?;
        element.get_file(&remote, local, ctx).await
    }

    /// Copies every file below `ldn` into `local_dir`, creating local
    /// directories as needed. Returns the local paths written.
    pub async fn get_directory(
        &self,
        ldn: &str,
        local_dir: &Path,
        ctx: &TransferContext,
    ) -> DigsResult<Vec<PathBuf>> {
        let prefix = dir_prefix(&normalize_lfn(ldn));
        let files = self.registry.get_file_list("*").await?;
        let mut written = Vec::new();
        for lfn in files.keys().filter(|lfn| lfn.starts_with(&prefix)) {
            let mut local = local_dir.to_path_buf();
            for part in lfn[prefix.len()..].split('/') {
                local.push(part);
            }
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    DigsError::Io(format!(
                        "Unable to create directory structure for local copy {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
            info!("{} -> {}", lfn, local.display());
            self.get_file(lfn, &local, ctx).await?;
            written.push(local);
        }
        if written.is_empty() {
            return Err(DigsError::NotFound(format!(
                "Directory {} does not exist on grid",
                ldn
            )));
        }
        Ok(written)
    }

    fn touch_target(&self, what: &str, size: u64, host: Option<&str>) -> DigsResult<String> {
        match host {
            Some(host) => {
                self.node(host)?;
                Ok(host.to_string())
            }
            None => self
                .nodes_with_space(required_kb(size))
                .into_iter()
                .find(|name| {
                    self.node(name)
                        .map(|n| n.is_usable_for_put())
                        .unwrap_or(false)
                })
                .ok_or_else(|| {
                    DigsError::NoNodeAvailable(format!(
                        "No node has space for another copy of {}",
                        what
                    ))
                }),
        }
    }

    async fn recorded_size(&self, lfn: &str) -> DigsResult<u64> {
        let value = self
            .attribute(lfn, crate::ATTR_SIZE)
            .await?
            .ok_or_else(|| DigsError::Registry(format!("No size recorded for {}", lfn)))?;
        value.trim().parse::<u64>().map_err(|_| {
            DigsError::Registry(format!("Invalid size {} recorded for {}", value, lfn))
        })
    }

    /// Asks the control node for an extra copy of `lfn` on `host`, or on the
    /// preferred node with room when no host is given.
    pub async fn touch_file(&self, lfn: &str, host: Option<&str>) -> DigsResult<String> {
        self.ensure_main()?;
        let lfn = normalize_lfn(lfn);
        if !self.registry.lfn_exists(&lfn).await? {
            return Err(DigsError::NotFound(format!(
                "File {} does not exist on grid",
                lfn
            )));
        }
        let size = match host {
            Some(_) => 0,
            None => self.recorded_size(&lfn).await?,
        };
        let node = self.touch_target(&lfn, size, host)?;
        self.send(ControlCommand::Touch {
            lfn,
            node: node.clone(),
        })
        .await?;
        Ok(node)
    }

    pub async fn touch_directory(&self, ldn: &str, host: Option<&str>) -> DigsResult<String> {
        self.ensure_main()?;
        let ldn = normalize_lfn(ldn);
        if self.registry.lfn_exists(&ldn).await? {
            return Err(DigsError::InvalidParam(format!("{} is a regular file", ldn)));
        }
        let size = match host {
            Some(_) => 0,
            None => self.logical_directory_size(&ldn).await?,
        };
        let node = self.touch_target(&ldn, size, host)?;
        self.send(ControlCommand::TouchDirectory {
            ldn,
            node: node.clone(),
        })
        .await?;
        Ok(node)
    }
}

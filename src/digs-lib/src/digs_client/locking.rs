use super::{dir_prefix, normalize_lfn, DigsClient};
use crate::{
    non_null_attr, ControlCommand, DigsError, DigsResult, ATTR_LOCKED_BY, ATTR_REPLICA_COUNT,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Unlocked,
    LockedBy(String),
}

impl From<Option<String>> for LockStatus {
    fn from(holder: Option<String>) -> Self {
        match holder {
            Some(dn) => LockStatus::LockedBy(dn),
            None => LockStatus::Unlocked,
        }
    }
}

/// Lock state of every file under a directory, collapsed when uniform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryLockReport {
    Unlocked,
    LockedBy(String),
    Mixed(Vec<(String, LockStatus)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaCountSetting {
    /// No explicit count; the grid's `min_copies` applies.
    Default(u32),
    Explicit(u32),
}

impl ReplicaCountSetting {
    pub fn count(&self) -> u32 {
        match self {
            ReplicaCountSetting::Default(n) | ReplicaCountSetting::Explicit(n) => *n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryReplicaReport {
    /// Every file has the same effective count.
    Uniform(u32),
    /// Files without an override use `default`.
    Mixed {
        default: u32,
        overrides: Vec<(String, u32)>,
    },
}

fn parse_count(lfn: &str, value: &str) -> DigsResult<u32> {
    value.trim().parse::<u32>().map_err(|_| {
        DigsError::Registry(format!("Invalid replication count {} for {}", value, lfn))
    })
}

impl DigsClient {
    /// Files under `ldn` with their value of `attr`, in name order.
    async fn directory_attribute(
        &self,
        ldn: &str,
        attr: &str,
    ) -> DigsResult<Vec<(String, Option<String>)>> {
        let prefix = dir_prefix(&normalize_lfn(ldn));
        let files = self.registry.get_file_list("*").await?;
        let values = self.registry.get_all_attribute_values(attr).await?;
        Ok(files
            .keys()
            .filter(|lfn| lfn.starts_with(&prefix))
            .map(|lfn| (lfn.clone(), non_null_attr(values.get(lfn).cloned())))
            .collect())
    }

    pub async fn lock_file(&self, lfn: &str) -> DigsResult<()> {
        self.ensure_main()?;
        let lfn = normalize_lfn(lfn);
        if let Some(holder) = self.attribute(&lfn, ATTR_LOCKED_BY).await? {
            if !self.is_user_administrator() {
                return Err(DigsError::PreconditionFailed(format!(
                    "File {} is already locked by {}",
                    lfn, holder
                )));
            }
        }
        self.send(ControlCommand::Lock { lfn }).await?;
        self.request_cache_refresh();
        Ok(())
    }

    pub async fn unlock_file(&self, lfn: &str) -> DigsResult<()> {
        self.ensure_main()?;
        let lfn = normalize_lfn(lfn);
        let holder = match self.attribute(&lfn, ATTR_LOCKED_BY).await? {
            Some(holder) => holder,
            None => {
                return Err(DigsError::PreconditionFailed(format!(
                    "File {} is not locked",
                    lfn
                )))
            }
        };
        if holder != self.user_dn() && !self.is_user_administrator() {
            return Err(DigsError::PreconditionFailed(format!(
                "File {} is locked by {}, cannot unlock",
                lfn, holder
            )));
        }
        self.send(ControlCommand::Unlock { lfn }).await?;
        self.request_cache_refresh();
        Ok(())
    }

    /// Scans the directory before sending the lock. A file locked between
    /// the scan and the command is not detected here.
    pub async fn lock_directory(&self, ldn: &str) -> DigsResult<()> {
        self.ensure_main()?;
        let ldn = normalize_lfn(ldn);
        if !self.is_user_administrator() {
            let dn = self.user_dn();
            for (lfn, holder) in self.directory_attribute(&ldn, ATTR_LOCKED_BY).await? {
                if let Some(holder) = holder {
                    if holder != dn {
                        return Err(DigsError::PreconditionFailed(format!(
                            "Cannot lock directory, {} already locked by {}",
                            lfn, holder
                        )));
                    }
                }
            }
        }
        self.send(ControlCommand::LockDirectory { lfn: ldn }).await?;
        self.request_cache_refresh();
        Ok(())
    }

    pub async fn unlock_directory(&self, ldn: &str) -> DigsResult<()> {
        self.ensure_main()?;
        self.send(ControlCommand::UnlockDirectory {
            lfn: normalize_lfn(ldn),
        })
        .await?;
        self.request_cache_refresh();
        Ok(())
    }

    pub async fn check_lock(&self, lfn: &str) -> DigsResult<LockStatus> {
        Ok(self.attribute(lfn, ATTR_LOCKED_BY).await?.into())
    }

    pub async fn check_directory_lock(&self, ldn: &str) -> DigsResult<DirectoryLockReport> {
        let files = self.directory_attribute(ldn, ATTR_LOCKED_BY).await?;
        let first = match files.first() {
            Some((_, holder)) => holder.clone(),
            None => return Ok(DirectoryLockReport::Unlocked),
        };
        if files.iter().all(|(_, holder)| *holder == first) {
            return Ok(match first {
                Some(dn) => DirectoryLockReport::LockedBy(dn),
                None => DirectoryLockReport::Unlocked,
            });
        }
        Ok(DirectoryLockReport::Mixed(
            files
                .into_iter()
                .map(|(lfn, holder)| (lfn, holder.into()))
                .collect(),
        ))
    }

    /// `None` clears an explicit count.
    pub async fn set_replica_count(&self, lfn: &str, count: Option<u32>) -> DigsResult<()> {
        self.ensure_main()?;
        self.send(ControlCommand::ReplicaCount {
            lfn: normalize_lfn(lfn),
            count: count.unwrap_or(0),
        })
        .await
    }

    pub async fn set_directory_replica_count(
        &self,
        ldn: &str,
        count: Option<u32>,
    ) -> DigsResult<()> {
        self.ensure_main()?;
        self.send(ControlCommand::ReplicaCountDirectory {
            lfn: normalize_lfn(ldn),
            count: count.unwrap_or(0),
        })
        .await
    }

    pub async fn check_replica_count(&self, lfn: &str) -> DigsResult<ReplicaCountSetting> {
        match self.attribute(lfn, ATTR_REPLICA_COUNT).await? {
            Some(value) => Ok(ReplicaCountSetting::Explicit(parse_count(lfn, &value)?)),
            None => Ok(ReplicaCountSetting::Default(self.min_copies())),
        }
    }

    pub async fn check_directory_replica_count(
        &self,
        ldn: &str,
    ) -> DigsResult<DirectoryReplicaReport> {
        let default = self.min_copies();
        let mut effective = Vec::new();
        let mut overrides = Vec::new();
        for (lfn, value) in self.directory_attribute(ldn, ATTR_REPLICA_COUNT).await? {
            match value {
                Some(value) => {
                    let count = parse_count(&lfn, &value)?;
                    effective.push(count);
                    overrides.push((lfn, count));
                }
                None => effective.push(default),
            }
        }
        match effective.first() {
            None => Ok(DirectoryReplicaReport::Uniform(default)),
            Some(first) if effective.iter().all(|c| c == first) => {
                Ok(DirectoryReplicaReport::Uniform(*first))
            }
            Some(_) => Ok(DirectoryReplicaReport::Mixed { default, overrides }),
        }
    }
}

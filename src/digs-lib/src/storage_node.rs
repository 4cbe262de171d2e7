use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_JOB_TIMEOUT_SECS: f64 = 45.0;
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

/// Backend family declared by a node's `type` key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendType {
    Unspecified,
    BulkTransfer,
    StorageResourceManager,
    Omero,
}

impl BackendType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "globus" => Some(BackendType::BulkTransfer),
            "srm" => Some(BackendType::StorageResourceManager),
            "omero" => Some(BackendType::Omero),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Unspecified => "unspecified",
            BackendType::BulkTransfer => "globus",
            BackendType::StorageResourceManager => "srm",
            BackendType::Omero => "omero",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StorageNode {
    pub name: String,
    pub path: String,
    pub site: String,
    pub inbox: Option<String>,
    pub free_space_kb: u64,
    pub backend: BackendType,
    pub extra_rsl: Option<String>,
    pub extra_jss_contact: Option<String>,
    pub job_timeout: f64,
    pub ftp_timeout: Option<f64>,
    pub copy_timeout: Option<f64>,
    pub gpfs: bool,
    pub quotas: Vec<i64>,
    pub properties: HashMap<String, String>,
    pub dead: bool,
    pub disabled: bool,
    pub retiring: bool,
}

impl StorageNode {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: String::new(),
            site: String::new(),
            inbox: None,
            free_space_kb: 0,
            backend: BackendType::Unspecified,
            extra_rsl: None,
            extra_jss_contact: None,
            job_timeout: DEFAULT_JOB_TIMEOUT_SECS,
            ftp_timeout: None,
            copy_timeout: None,
            gpfs: false,
            quotas: Vec::new(),
            properties: HashMap::new(),
            dead: false,
            disabled: false,
            retiring: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && !self.path.is_empty() && !self.site.is_empty()
    }

    pub fn is_usable_for_put(&self) -> bool {
        !self.dead && !self.disabled && !self.retiring
    }

    /// Retiring nodes still serve reads.
    pub fn is_readable(&self) -> bool {
        !self.dead && !self.disabled
    }

    /// Upload landing area. Protocol version 2 grids and nodes without an
    /// explicit inbox use `<path>/data/NEW`.
    pub fn inbox_path(&self, digs_version: u32) -> String {
        if digs_version < 3 {
            return format!("{}/data/NEW", self.path);
        }
        match &self.inbox {
            Some(inbox) if !inbox.is_empty() => inbox.clone(),
            _ => format!("{}/data/NEW", self.path),
        }
    }

    pub fn quota(&self, index: usize) -> Option<i64> {
        self.quotas.get(index).copied()
    }

    pub fn set_quota(&mut self, index: usize, value: i64) {
        if self.quotas.len() <= index {
            self.quotas.resize(index + 1, 0);
        }
        self.quotas[index] = value;
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|v| v.as_str())
    }

    pub fn transfer_timeout(&self) -> Duration {
        secs_or_default(self.copy_timeout)
    }

    pub fn control_timeout(&self) -> Duration {
        secs_or_default(self.ftp_timeout)
    }
}

fn secs_or_default(value: Option<f64>) -> Duration {
    match value {
        Some(secs) if secs.is_finite() && secs > 0.0 => Duration::from_secs_f64(secs),
        _ => DEFAULT_TRANSFER_TIMEOUT,
    }
}

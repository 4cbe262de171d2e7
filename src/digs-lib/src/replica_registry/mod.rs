mod rls_client;

pub use rls_client::*;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

use crate::DigsResult;

pub const DEFAULT_RLS_PORT: u16 = 39281;

pub const ATTR_SIZE: &str = "size";
pub const ATTR_MD5SUM: &str = "md5sum";
pub const ATTR_GROUP: &str = "group";
pub const ATTR_PERMISSIONS: &str = "permissions";
pub const ATTR_SUBMITTER: &str = "submitter";
pub const ATTR_LOCKED_BY: &str = "lockedby";
pub const ATTR_REPLICA_COUNT: &str = "replcount";

/// The registry stores unset values in several spellings.
pub fn attr_is_null(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(v) => v.is_empty() || v == "(null)",
    }
}

/// Normalises an attribute read so that every null spelling becomes `None`.
pub fn non_null_attr(value: Option<String>) -> Option<String> {
    if attr_is_null(value.as_deref()) {
        None
    } else {
        value
    }
}

/// UNIX wildcards to the registry's SQL LIKE syntax. A backslash escapes
/// the next character; literal `%` and `_` are escaped.
pub fn translate_wildcard(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut escaped = false;
    for c in pattern.chars() {
        if c == '\\' {
            out.push('\\');
            escaped = true;
            continue;
        }
        if escaped {
            out.push(c);
        } else {
            match c {
                '*' => out.push('%'),
                '?' => out.push('_'),
                '%' | '_' => {
                    out.push('\\');
                    out.push(c);
                }
                _ => out.push(c),
            }
        }
        escaped = false;
    }
    out
}

/// Client view of the replica-location service. Implementations never retry.
#[async_trait]
pub trait ReplicaRegistry: Send + Sync {
    /// Node names holding a copy of `lfn`.
    async fn get_file_locations(&self, lfn: &str) -> DigsResult<Vec<String>>;

    /// `Ok(None)` when the attribute is not set; `NotFound` when `lfn` is unknown.
    async fn get_attribute(&self, lfn: &str, attr: &str) -> DigsResult<Option<String>>;

    /// `attr` for every logical file that has it, in one round trip.
    async fn get_all_attribute_values(&self, attr: &str) -> DigsResult<HashMap<String, String>>;

    /// Logical files matching a UNIX wildcard, with their locations.
    async fn get_file_list(&self, wildcard: &str) -> DigsResult<BTreeMap<String, Vec<String>>>;

    async fn lfn_exists(&self, lfn: &str) -> DigsResult<bool>;

    async fn file_at_location(&self, lfn: &str, node: &str) -> DigsResult<bool>;

    async fn list_location_files(&self, node: &str) -> DigsResult<Vec<String>>;

    /// Directory under the node root where the copy of `lfn` lives.
    async fn get_file_disk(&self, lfn: &str, node: &str) -> DigsResult<Option<String>> {
        let disk = self.get_attribute(lfn, &format!("{}-dir", node)).await?;
        Ok(non_null_attr(disk))
    }

    async fn num_copies(&self, lfn: &str) -> DigsResult<usize> {
        Ok(self.get_file_locations(lfn).await?.len())
    }
}

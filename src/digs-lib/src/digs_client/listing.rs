use std::collections::HashMap;

use super::DigsClient;
use crate::{
    non_null_attr, DigsResult, ATTR_GROUP, ATTR_MD5SUM, ATTR_PERMISSIONS, ATTR_SIZE,
    ATTR_SUBMITTER,
};

/// Columns requested from `list`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListOptions(u32);

impl ListOptions {
    pub const NUM_COPIES: u32 = 0x01;
    pub const LOCATIONS: u32 = 0x02;
    pub const GROUP: u32 = 0x04;
    pub const PERMISSIONS: u32 = 0x08;
    pub const CHECKSUM: u32 = 0x10;
    pub const SIZE: u32 = 0x20;
    pub const SUBMITTER: u32 = 0x40;
    pub const LONG: u32 = 0x7f;

    pub fn from_flags(flags: u32) -> Self {
        Self(flags & Self::LONG)
    }

    pub fn long() -> Self {
        Self(Self::LONG)
    }

    pub fn with(self, flag: u32) -> Self {
        Self::from_flags(self.0 | flag)
    }

    pub fn has(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn flags(&self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub lfn: String,
    pub locations: Vec<String>,
    pub group: Option<String>,
    pub permissions: Option<String>,
    pub submitter: Option<String>,
    pub size: Option<String>,
    pub checksum: Option<String>,
    options: ListOptions,
}

fn push_column(line: &mut String, value: &Option<String>, placeholder: &str) {
    line.push(' ');
    match value {
        Some(v) => line.push_str(v),
        None => line.push_str(placeholder),
    }
}

impl ListEntry {
    /// One listing line: name, then the requested attribute columns, then
    /// ` (copies)` and ` [locations]`.
    pub fn render(&self) -> String {
        let mut line = self.lfn.clone();
        if self.options.has(ListOptions::GROUP) {
            push_column(&mut line, &self.group, "<null group>");
        }
        if self.options.has(ListOptions::PERMISSIONS) {
            push_column(&mut line, &self.permissions, "<null permissions>");
        }
        if self.options.has(ListOptions::SUBMITTER) {
            push_column(&mut line, &self.submitter, "<null submitter>");
        }
        if self.options.has(ListOptions::SIZE) {
            push_column(&mut line, &self.size, "<null size>");
        }
        if self.options.has(ListOptions::CHECKSUM) {
            push_column(&mut line, &self.checksum, "<null checksum>");
        }
        if self.options.has(ListOptions::NUM_COPIES) {
            line.push_str(&format!(" ({})", self.locations.len()));
        }
        if self.options.has(ListOptions::LOCATIONS) {
            line.push_str(&format!(" [{}]", self.locations.join(" ")));
        }
        line
    }
}

type AttributeColumn = Option<HashMap<String, String>>;

impl DigsClient {
    async fn column(&self, options: ListOptions, flag: u32, attr: &str) -> DigsResult<AttributeColumn> {
        if !options.has(flag) {
            return Ok(None);
        }
        Ok(Some(self.registry.get_all_attribute_values(attr).await?))
    }

    /// Files matching a UNIX wildcard. Attribute columns are fetched with one
    /// bulk query each, and only when requested.
    pub async fn list(&self, wildcard: &str, options: ListOptions) -> DigsResult<Vec<ListEntry>> {
        let files = self.registry.get_file_list(wildcard).await?;
        let groups = self.column(options, ListOptions::GROUP, ATTR_GROUP).await?;
        let permissions = self
            .column(options, ListOptions::PERMISSIONS, ATTR_PERMISSIONS)
            .await?;
        let checksums = self.column(options, ListOptions::CHECKSUM, ATTR_MD5SUM).await?;
        let sizes = self.column(options, ListOptions::SIZE, ATTR_SIZE).await?;
        let submitters = self
            .column(options, ListOptions::SUBMITTER, ATTR_SUBMITTER)
            .await?;

        let pick = |column: &AttributeColumn, lfn: &str| {
            column
                .as_ref()
                .and_then(|c| non_null_attr(c.get(lfn).cloned()))
        };
        Ok(files
            .into_iter()
            .map(|(lfn, locations)| ListEntry {
                group: pick(&groups, &lfn),
                permissions: pick(&permissions, &lfn),
                submitter: pick(&submitters, &lfn),
                size: pick(&sizes, &lfn),
                checksum: pick(&checksums, &lfn),
                lfn,
                locations,
                options,
            })
            .collect())
    }

    pub async fn list_by_node(&self, node: &str) -> DigsResult<Vec<String>> {
        let mut files = self.registry.list_location_files(node).await?;
        files.sort();
        Ok(files)
    }

    async fn list_where<F>(&self, attrs: &[&str], keep: F) -> DigsResult<Vec<String>>
    where
        F: Fn(&[Option<&String>]) -> bool,
    {
        let files = self.registry.get_file_list("*").await?;
        let mut columns = Vec::with_capacity(attrs.len());
        for attr in attrs {
            columns.push(self.registry.get_all_attribute_values(attr).await?);
        }
        Ok(files
            .into_keys()
            .filter(|lfn| {
                let values: Vec<Option<&String>> = columns.iter().map(|c| c.get(lfn)).collect();
                keep(&values)
            })
            .collect())
    }

    pub async fn list_by_group(&self, group: &str) -> DigsResult<Vec<String>> {
        self.list_where(&[ATTR_GROUP], |v| v[0].map(|g| g == group).unwrap_or(false))
            .await
    }

    pub async fn list_by_submitter(&self, submitter: &str) -> DigsResult<Vec<String>> {
        self.list_where(&[ATTR_SUBMITTER], |v| {
            v[0].map(|s| s == submitter).unwrap_or(false)
        })
        .await
    }

    pub async fn list_by_permissions(&self, group: &str, perms: &str) -> DigsResult<Vec<String>> {
        self.list_where(&[ATTR_GROUP, ATTR_PERMISSIONS], |v| match (v[0], v[1]) {
            (Some(g), Some(p)) => g == group && p == perms,
            _ => false,
        })
        .await
    }
}

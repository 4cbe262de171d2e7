use std::collections::{HashMap, HashSet};

use crate::{BackendType, DigsConfigFile, DigsError, DigsResult, StorageNode};

/// Orders `names` so entries that appear in `preference` come first, in
/// preference order, followed by the rest in their incoming order.
pub fn sort_by_preference(names: &[String], preference: &[String]) -> Vec<String> {
    let mut sorted = Vec::with_capacity(names.len());
    let mut taken = vec![false; names.len()];
    for pref in preference {
        for (i, name) in names.iter().enumerate() {
            if !taken[i] && name == pref {
                taken[i] = true;
                sorted.push(name.clone());
            }
        }
    }
    for (i, name) in names.iter().enumerate() {
        if !taken[i] {
            sorted.push(name.clone());
        }
    }
    sorted
}

/// Every storage node known to the grid, keyed by name.
///
/// Node order follows the master node list; the preference list is the
/// only tie-break applied on top of it.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: HashMap<String, StorageNode>,
    order: Vec<String>,
    preference: Vec<String>,
}

impl NodeRegistry {
    pub fn parse_main_node_list(data: &[u8]) -> DigsResult<Self> {
        let mut cfg = DigsConfigFile::parse(data)?;
        let (key, name) = cfg
            .next_key_value()
            .ok_or_else(|| DigsError::Config("mainnodelist.conf is empty".to_string()))?;
        if key != "node" {
            return Err(DigsError::Config(
                "Expected 'node' first in mainnodelist.conf".to_string(),
            ));
        }

        let mut registry = NodeRegistry::default();
        let mut current = StorageNode::new(&name);
        while let Some((key, value)) = cfg.next_key_value() {
            if key == "node" {
                let done = std::mem::replace(&mut current, StorageNode::new(&value));
                registry.insert(done)?;
                continue;
            }
            apply_node_key(&mut current, &key, &value)?;
        }
        registry.insert(current)?;

        debug!("loaded {} storage nodes", registry.order.len());
        Ok(registry)
    }

    pub fn insert(&mut self, node: StorageNode) -> DigsResult<()> {
        if !node.is_valid() {
            return Err(DigsError::Config(format!(
                "Incomplete definition for node {} in mainnodelist.conf",
                node.name
            )));
        }
        if self.nodes.contains_key(&node.name) {
            return Err(DigsError::DuplicateNode(format!(
                "Duplicate entries for {} in mainnodelist.conf",
                node.name
            )));
        }
        self.order.push(node.name.clone());
        self.nodes.insert(node.name.clone(), node);
        Ok(())
    }

    pub fn apply_dead_list(&mut self, names: &[String]) -> DigsResult<()> {
        self.apply_flag_list(names, "deadnodes.conf", |n| n.dead = true)
    }

    pub fn apply_disabled_list(&mut self, names: &[String]) -> DigsResult<()> {
        self.apply_flag_list(names, "disablednodes.conf", |n| n.disabled = true)
    }

    pub fn apply_retiring_list(&mut self, names: &[String]) -> DigsResult<()> {
        self.apply_flag_list(names, "retiringnodes.conf", |n| n.retiring = true)
    }

    fn apply_flag_list<F>(&mut self, names: &[String], source: &str, set: F) -> DigsResult<()>
    where
        F: Fn(&mut StorageNode),
    {
        for name in names {
            let node = self.nodes.get_mut(name).ok_or_else(|| {
                DigsError::UnknownNode(format!("Unknown node {} in {}", name, source))
            })?;
            set(node);
        }
        Ok(())
    }

    pub fn set_preference_list(&mut self, preference: Vec<String>) -> DigsResult<()> {
        for name in &preference {
            if !self.nodes.contains_key(name) {
                return Err(DigsError::UnknownNode(format!(
                    "Unknown node {} in node preference list",
                    name
                )));
            }
        }
        self.preference = preference;
        Ok(())
    }

    pub fn preference_list(&self) -> &[String] {
        &self.preference
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&StorageNode> {
        self.nodes.get(name)
    }

    pub fn node(&self, name: &str) -> DigsResult<&StorageNode> {
        self.nodes
            .get(name)
            .ok_or_else(|| DigsError::UnknownNode(format!("Storage node {} does not exist on grid", name)))
    }

    pub fn node_mut(&mut self, name: &str) -> DigsResult<&mut StorageNode> {
        self.nodes
            .get_mut(name)
            .ok_or_else(|| DigsError::UnknownNode(format!("Storage node {} does not exist on grid", name)))
    }

    /// Node names in master list order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn nodes(&self) -> impl Iterator<Item = &StorageNode> {
        self.order.iter().filter_map(move |n| self.nodes.get(n))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn sort_by_preference(&self, names: &[String]) -> Vec<String> {
        sort_by_preference(names, &self.preference)
    }

    /// Nodes whose free space is strictly greater than `kb`, preferred first.
    pub fn nodes_with_space(&self, kb: u64) -> Vec<String> {
        let candidates: Vec<String> = self
            .nodes()
            .filter(|n| n.free_space_kb > kb)
            .map(|n| n.name.clone())
            .collect();
        self.sort_by_preference(&candidates)
    }

    pub fn nodes_by_type(&self, backend: BackendType) -> Vec<String> {
        self.nodes()
            .filter(|n| n.backend == backend)
            .map(|n| n.name.clone())
            .collect()
    }
}

fn apply_node_key(node: &mut StorageNode, key: &str, value: &str) -> DigsResult<()> {
    match key {
        "path" => node.path = value.to_string(),
        "site" => node.site = value.to_string(),
        "disk" => {
            node.free_space_kb = value.parse::<u64>().map_err(|_| {
                DigsError::Config(format!(
                    "Invalid free space value '{}' in mainnodelist.conf",
                    value
                ))
            })?;
        }
        "extrarsl" => node.extra_rsl = Some(value.to_string()),
        "extrajsscontact" => node.extra_jss_contact = Some(value.to_string()),
        "jobtimeout" => node.job_timeout = parse_timeout(value, "job")?,
        "ftptimeout" => node.ftp_timeout = Some(parse_timeout(value, "FTP")?),
        "copytimeout" => node.copy_timeout = Some(parse_timeout(value, "copy")?),
        "gpfs" => node.gpfs = value != "0",
        "type" => {
            node.backend = BackendType::parse(value).ok_or_else(|| {
                DigsError::Config(format!("Unrecognised type {} in mainnodelist.conf", value))
            })?;
        }
        "inbox" => node.inbox = Some(value.to_string()),
        _ if key.starts_with("data") => {
            let index = if key == "data" {
                0
            } else {
                key[4..].parse::<usize>().map_err(|_| {
                    DigsError::Config(format!("Invalid disk quota {} in mainnodelist.conf", key))
                })?
            };
            let quota = value.parse::<i64>().map_err(|_| {
                DigsError::Config(format!("Invalid disk quota {} in mainnodelist.conf", value))
            })?;
            node.set_quota(index, quota);
        }
        _ => {
            node.properties.insert(key.to_string(), value.to_string());
        }
    }
    Ok(())
}

fn parse_timeout(value: &str, what: &str) -> DigsResult<f64> {
    value.parse::<f64>().map_err(|_| {
        DigsError::Config(format!(
            "Invalid {} timeout value '{}' in mainnodelist.conf",
            what, value
        ))
    })
}

//! In-memory grid used by unit tests: config files, registry, control node
//! and storage elements all live in one shared state.

use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::{
    ControlChannel, DigsError, DigsResult, GridTransport, NodeRegistry, ReplicaRegistry,
    StorageElement, StorageNode, TransferContext,
};

#[derive(Default, Clone)]
struct MockEntry {
    locations: Vec<String>,
    attrs: HashMap<String, String>,
}

#[derive(Default)]
struct GridState {
    files: HashMap<(String, String), Vec<u8>>,
    entries: BTreeMap<String, MockEntry>,
    pending: HashMap<String, HashMap<String, String>>,
    node_roots: HashMap<String, (String, String)>,
    unreachable: HashSet<String>,
    failing: HashSet<String>,
    attempts: Vec<String>,
    commands: Vec<String>,
    reject_with: Option<String>,
    caller_dn: String,
}

#[derive(Clone, Default)]
pub(crate) struct MockGrid {
    state: Arc<Mutex<GridState>>,
}

impl MockGrid {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut GridState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Publishes the grid configuration files under `install_path` on `host`.
    pub fn install_config(
        &self,
        host: &str,
        install_path: &str,
        main_config: &str,
        node_list: &str,
        group_map: Option<&str>,
    ) {
        let nodes = NodeRegistry::parse_main_node_list(node_list.as_bytes()).unwrap();
        let version = if group_map.is_some() { 3 } else { 2 };
        self.with_state(|s| {
            let mut put = |name: &str, data: &str| {
                s.files.insert(
                    (host.to_string(), format!("{}/{}", install_path, name)),
                    data.as_bytes().to_vec(),
                );
            };
            put("qcdgrid.conf", main_config);
            put("mainnodelist.conf", node_list);
            put("deadnodes.conf", "");
            put("disablednodes.conf", "");
            put("retiringnodes.conf", "");
            if let Some(map) = group_map {
                put("group-mapfile", map);
            }
            for node in nodes.nodes() {
                s.node_roots
                    .insert(node.name.clone(), (node.path.clone(), node.inbox_path(version)));
            }
        });
    }

    pub fn put_config_file(&self, host: &str, path: &str, data: &str) {
        self.with_state(|s| {
            s.files
                .insert((host.to_string(), path.to_string()), data.as_bytes().to_vec());
        });
    }

    pub fn add_file(&self, lfn: &str, nodes: &[&str], size: u64) {
        self.with_state(|s| {
            let entry = s.entries.entry(lfn.to_string()).or_default();
            for node in nodes {
                entry.locations.push(node.to_string());
                entry.attrs.insert(format!("{}-dir", node), "data".to_string());
            }
            entry.attrs.insert("size".to_string(), size.to_string());
        });
    }

    /// Registers `lfn` on `node` and stores its bytes where a get will look.
    pub fn store_replica(&self, lfn: &str, node: &str, data: &[u8]) {
        self.with_state(|s| {
            let root = s
                .node_roots
                .get(node)
                .map(|(p, _)| p.clone())
                .unwrap_or_else(|| format!("/grid/{}", node));
            s.files
                .insert((node.to_string(), format!("{}/data/{}", root, lfn)), data.to_vec());
            let entry = s.entries.entry(lfn.to_string()).or_default();
            if !entry.locations.iter().any(|l| l == node) {
                entry.locations.push(node.to_string());
            }
            entry.attrs.insert(format!("{}-dir", node), "data".to_string());
            entry.attrs.insert("size".to_string(), data.len().to_string());
        });
    }

    pub fn set_attr(&self, lfn: &str, attr: &str, value: &str) {
        self.with_state(|s| {
            s.entries
                .entry(lfn.to_string())
                .or_default()
                .attrs
                .insert(attr.to_string(), value.to_string());
        });
    }

    pub fn attr(&self, lfn: &str, attr: &str) -> Option<String> {
        self.with_state(|s| s.entries.get(lfn).and_then(|e| e.attrs.get(attr).cloned()))
    }

    pub fn locations(&self, lfn: &str) -> Vec<String> {
        self.with_state(|s| {
            s.entries
                .get(lfn)
                .map(|e| e.locations.clone())
                .unwrap_or_default()
        })
    }

    pub fn stored(&self, host: &str, path: &str) -> Option<Vec<u8>> {
        self.with_state(|s| s.files.get(&(host.to_string(), path.to_string())).cloned())
    }

    pub fn set_unreachable(&self, host: &str) {
        self.with_state(|s| {
            s.unreachable.insert(host.to_string());
        });
    }

    pub fn set_failing(&self, node: &str) {
        self.with_state(|s| {
            s.failing.insert(node.to_string());
        });
    }

    pub fn reject_commands(&self, reply: &str) {
        self.with_state(|s| s.reject_with = Some(reply.to_string()));
    }

    pub fn set_caller(&self, dn: &str) {
        self.with_state(|s| s.caller_dn = dn.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.with_state(|s| s.commands.clone())
    }

    pub fn attempts(&self) -> Vec<String> {
        self.with_state(|s| s.attempts.clone())
    }

    pub fn clear_log(&self) {
        self.with_state(|s| {
            s.commands.clear();
            s.attempts.clear();
        });
    }

    pub fn registry(&self) -> Arc<dyn ReplicaRegistry> {
        Arc::new(MockRegistry { grid: self.clone() })
    }
}

fn wildcard_regex(pattern: &str) -> Regex {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            _ => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).unwrap()
}

fn apply_command(s: &mut GridState, line: &str) {
    let parts: Vec<&str> = line.split(' ').collect();
    let dn = s.caller_dn.clone();
    let under = |lfn: &str, dir: &str| lfn.starts_with(&format!("{}/", dir.trim_end_matches('/')));
    match parts.as_slice() {
        ["putFile", lfn, group, perm, size, md5, ts, submitter] => {
            let mut attrs = HashMap::new();
            attrs.insert("group".to_string(), group.to_string());
            attrs.insert("permissions".to_string(), perm.to_string());
            attrs.insert("size".to_string(), size.to_string());
            attrs.insert("md5sum".to_string(), md5.to_string());
            attrs.insert("timestamp".to_string(), ts.to_string());
            attrs.insert("submitter".to_string(), submitter.replace('+', " "));
            s.pending.insert(lfn.to_string(), attrs);
        }
        ["modify", lfn, _node, md5, size, ts] => {
            if let Some(entry) = s.entries.get_mut(*lfn) {
                entry.attrs.insert("md5sum".to_string(), md5.to_string());
                entry.attrs.insert("size".to_string(), size.to_string());
                entry.attrs.insert("timestamp".to_string(), ts.to_string());
            }
        }
        ["check", node] => {
            let (root, inbox) = match s.node_roots.get(*node) {
                Some(r) => r.clone(),
                None => return,
            };
            let inbox_prefix = format!("{}/", inbox);
            let arrived: Vec<String> = s
                .files
                .keys()
                .filter(|(host, path)| host == node && path.starts_with(&inbox_prefix))
                .map(|(_, path)| path.clone())
                .collect();
            for path in arrived {
                let flat = &path[inbox_prefix.len()..];
                let lfn = flat.replace("-DIR-", "/");
                if let Some(data) = s.files.remove(&(node.to_string(), path.clone())) {
                    s.files
                        .insert((node.to_string(), format!("{}/data/{}", root, lfn)), data);
                }
                let pending = s.pending.remove(&lfn).unwrap_or_default();
                let entry = s.entries.entry(lfn).or_default();
                if !entry.locations.iter().any(|l| l == node) {
                    entry.locations.push(node.to_string());
                }
                entry.attrs.insert(format!("{}-dir", node), "data".to_string());
                entry.attrs.extend(pending);
            }
        }
        ["delete", lfn] => {
            s.entries.remove(*lfn);
        }
        ["rmdir", dir] => s.entries.retain(|lfn, _| !under(lfn, dir)),
        ["chmod", _recursive, _group, lfn, perm] => {
            if let Some(entry) = s.entries.get_mut(*lfn) {
                entry.attrs.insert("permissions".to_string(), perm.to_string());
            }
        }
        ["lock", lfn] => {
            if let Some(entry) = s.entries.get_mut(*lfn) {
                entry.attrs.insert("lockedby".to_string(), dn);
            }
        }
        ["unlock", lfn] => {
            if let Some(entry) = s.entries.get_mut(*lfn) {
                entry.attrs.remove("lockedby");
            }
        }
        ["lockdir", dir] => {
            for (lfn, entry) in s.entries.iter_mut() {
                if under(lfn, dir) {
                    entry.attrs.insert("lockedby".to_string(), dn.clone());
                }
            }
        }
        ["unlockdir", dir] => {
            for (lfn, entry) in s.entries.iter_mut() {
                if under(lfn, dir) {
                    entry.attrs.remove("lockedby");
                }
            }
        }
        ["replcount", lfn, n] => {
            if let Some(entry) = s.entries.get_mut(*lfn) {
                if *n == "0" {
                    entry.attrs.remove("replcount");
                } else {
                    entry.attrs.insert("replcount".to_string(), n.to_string());
                }
            }
        }
        ["replcountdir", dir, n] => {
            for (lfn, entry) in s.entries.iter_mut() {
                if under(lfn, dir) {
                    if *n == "0" {
                        entry.attrs.remove("replcount");
                    } else {
                        entry.attrs.insert("replcount".to_string(), n.to_string());
                    }
                }
            }
        }
        _ => {}
    }
}

struct MockControl {
    grid: MockGrid,
}

#[async_trait]
impl ControlChannel for MockControl {
    async fn send_message(&self, message: &str) -> DigsResult<String> {
        self.grid.with_state(|s| {
            s.commands.push(message.to_string());
            if let Some(reply) = &s.reject_with {
                return Ok(reply.clone());
            }
            apply_command(s, message);
            Ok("OK".to_string())
        })
    }
}

struct MockRegistry {
    grid: MockGrid,
}

#[async_trait]
impl ReplicaRegistry for MockRegistry {
    async fn get_file_locations(&self, lfn: &str) -> DigsResult<Vec<String>> {
        self.grid.with_state(|s| {
            s.entries
                .get(lfn)
                .map(|e| e.locations.clone())
                .ok_or_else(|| DigsError::NotFound(format!("File {} does not exist on grid", lfn)))
        })
    }

    async fn get_attribute(&self, lfn: &str, attr: &str) -> DigsResult<Option<String>> {
        self.grid.with_state(|s| {
            s.entries
                .get(lfn)
                .map(|e| e.attrs.get(attr).cloned())
                .ok_or_else(|| DigsError::NotFound(format!("LFN {} doesn't exist", lfn)))
        })
    }

    async fn get_all_attribute_values(&self, attr: &str) -> DigsResult<HashMap<String, String>> {
        self.grid.with_state(|s| {
            Ok(s.entries
                .iter()
                .filter_map(|(lfn, e)| e.attrs.get(attr).map(|v| (lfn.clone(), v.clone())))
                .collect())
        })
    }

    async fn get_file_list(&self, wildcard: &str) -> DigsResult<BTreeMap<String, Vec<String>>> {
        let re = wildcard_regex(wildcard);
        self.grid.with_state(|s| {
            Ok(s.entries
                .iter()
                .filter(|(lfn, _)| re.is_match(lfn))
                .map(|(lfn, e)| (lfn.clone(), e.locations.clone()))
                .collect())
        })
    }

    async fn lfn_exists(&self, lfn: &str) -> DigsResult<bool> {
        self.grid.with_state(|s| Ok(s.entries.contains_key(lfn)))
    }

    async fn file_at_location(&self, lfn: &str, node: &str) -> DigsResult<bool> {
        self.grid.with_state(|s| {
            Ok(s.entries
                .get(lfn)
                .map(|e| e.locations.iter().any(|l| l == node))
                .unwrap_or(false))
        })
    }

    async fn list_location_files(&self, node: &str) -> DigsResult<Vec<String>> {
        self.grid.with_state(|s| {
            Ok(s.entries
                .iter()
                .filter(|(_, e)| e.locations.iter().any(|l| l == node))
                .map(|(lfn, _)| lfn.clone())
                .collect())
        })
    }
}

struct MockElement {
    node: String,
    grid: MockGrid,
}

impl MockElement {
    fn attempt(&self, kind: &str) -> DigsResult<()> {
        self.grid.with_state(|s| {
            s.attempts.push(format!("{}:{}", kind, self.node));
            if s.failing.contains(&self.node) || s.unreachable.contains(&self.node) {
                Err(DigsError::Transport(format!("{} refused connection", self.node)))
            } else {
                Ok(())
            }
        })
    }
}

#[async_trait]
impl StorageElement for MockElement {
    async fn put_file(&self, local: &Path, remote: &str, ctx: &TransferContext) -> DigsResult<()> {
        self.attempt("put")?;
        let data = tokio::fs::read(local).await?;
        ctx.check(data.len() as u64, Some(data.len() as u64), remote)?;
        self.grid.with_state(|s| {
            s.files.insert((self.node.clone(), remote.to_string()), data);
        });
        Ok(())
    }

    async fn get_file(&self, remote: &str, local: &Path, ctx: &TransferContext) -> DigsResult<()> {
        self.attempt("get")?;
        let data = self
            .grid
            .stored(&self.node, remote)
            .ok_or_else(|| DigsError::NotFound(format!("{} not found on {}", remote, self.node)))?;
        ctx.check(data.len() as u64, Some(data.len() as u64), remote)?;
        tokio::fs::write(local, data).await?;
        Ok(())
    }
}

#[async_trait]
impl GridTransport for MockGrid {
    async fn fetch_file(&self, host: &str, path: &str) -> DigsResult<Vec<u8>> {
        self.with_state(|s| {
            if s.unreachable.contains(host) {
                return Err(DigsError::Connection(format!("{} is unreachable", host)));
            }
            s.files
                .get(&(host.to_string(), path.to_string()))
                .cloned()
                .ok_or_else(|| DigsError::NotFound(format!("{} not found on {}", path, host)))
        })
    }

    async fn open_registry(&self, host: &str, _port: u16) -> DigsResult<Arc<dyn ReplicaRegistry>> {
        let down = self.with_state(|s| s.unreachable.contains(host));
        if down {
            return Err(DigsError::Connection(format!("RLS on {} is unreachable", host)));
        }
        Ok(self.registry())
    }

    fn control_channel(&self, _host: &str, _port: u16) -> Arc<dyn ControlChannel> {
        Arc::new(MockControl { grid: self.clone() })
    }

    fn storage_element(&self, node: &StorageNode) -> DigsResult<Arc<dyn StorageElement>> {
        Ok(Arc::new(MockElement {
            node: node.name.clone(),
            grid: self.clone(),
        }))
    }
}

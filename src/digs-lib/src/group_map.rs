use std::collections::HashMap;

/// DN to group membership, read from the grid's `group-mapfile`.
///
/// Each line is `"<dn with spaces>" g1,g2` or `<dn> g1,g2`.
#[derive(Debug, Clone, Default)]
pub struct GroupMap {
    groups: HashMap<String, Vec<String>>,
}

impl GroupMap {
    pub fn parse(data: &[u8]) -> Self {
        let mut groups = HashMap::new();
        for line in String::from_utf8_lossy(data).lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parsed = if let Some(rest) = line.strip_prefix('"') {
                rest.split_once('"')
                    .map(|(dn, tail)| (dn.to_string(), tail.trim().to_string()))
            } else {
                line.split_once(' ')
                    .map(|(dn, tail)| (dn.to_string(), tail.trim().to_string()))
            };

            let (dn, tail) = match parsed {
                Some(p) => p,
                None => {
                    warn!("ignoring group map line without groups: {}", line);
                    continue;
                }
            };
            let list: Vec<String> = tail
                .split(',')
                .map(|g| g.trim())
                .filter(|g| !g.is_empty())
                .map(|g| g.to_string())
                .collect();
            if list.is_empty() {
                continue;
            }
            groups.insert(dn, list);
        }
        Self { groups }
    }

    pub fn user_groups(&self, dn: &str) -> Option<&[String]> {
        self.groups.get(dn).map(|v| v.as_slice())
    }

    pub fn primary_group(&self, dn: &str) -> Option<&str> {
        self.user_groups(dn)
            .and_then(|g| g.first())
            .map(|g| g.as_str())
    }

    pub fn is_user_in_group(&self, dn: &str, group: &str) -> bool {
        self.user_groups(dn)
            .map(|g| g.iter().any(|x| x == group))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

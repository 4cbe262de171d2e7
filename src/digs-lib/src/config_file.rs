use crate::{DigsError, DigsResult};

/// Ordered `key = value` document with a read cursor.
///
/// Duplicate keys are kept in file order; the node list relies on this, with
/// each `node` key opening a new record that the following keys fill in.
#[derive(Debug, Clone, Default)]
pub struct DigsConfigFile {
    entries: Vec<(String, String)>,
    position: usize,
}

impl DigsConfigFile {
    pub fn parse(data: &[u8]) -> DigsResult<Self> {
        let text = String::from_utf8_lossy(data);
        let mut entries = Vec::new();
        for (line_no, raw) in text.split(|c: char| c == '\n' || c == '\r').enumerate() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                DigsError::Config(format!(
                    "Malformed line in config file (line {}): {}",
                    line_no + 1,
                    line
                ))
            })?;
            entries.push((key.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            entries,
            position: 0,
        })
    }

    pub fn parse_str(text: &str) -> DigsResult<Self> {
        Self::parse(text.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        self.position = position.min(self.entries.len());
    }

    /// Next value for `key` at or after the cursor; the cursor moves past it.
    pub fn next_value(&mut self, key: &str) -> Option<String> {
        while self.position < self.entries.len() {
            let (k, v) = &self.entries[self.position];
            self.position += 1;
            if k == key {
                return Some(v.clone());
            }
        }
        None
    }

    /// Rewinds the cursor and returns the first value for `key`.
    pub fn first_value(&mut self, key: &str) -> Option<String> {
        self.position = 0;
        self.next_value(key)
    }

    /// Raw pair under the cursor; the cursor advances by one.
    pub fn next_key_value(&mut self) -> Option<(String, String)> {
        let entry = self.entries.get(self.position).cloned();
        if entry.is_some() {
            self.position += 1;
        }
        entry
    }

    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn values_of(&self, key: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Integer value of the first `key`; missing or unparsable values give `default`.
    pub fn int_value(&self, key: &str, default: i64) -> i64 {
        match self.value_of(key) {
            Some(v) => v.parse::<i64>().unwrap_or_else(|_| {
                warn!("config value {}={} is not an integer, using {}", key, v, default);
                default
            }),
            None => default,
        }
    }
}

/// One name per line, blank lines skipped.
pub fn parse_simple_list(data: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(data)
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect()
}

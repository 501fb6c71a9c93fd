//! A small configuration store, grounded in faodel's `Configuration`:
//! a lowercase key/value map parsed from a multi-line `name value`
//! block, with role-aware lookup (`<role>.<name>`, `default.<name>`,
//! then bare `<name>`).
//!
//! This is the bootstrap-layer surface the core reads settings from
//! (mutex selection, default bucket, IOM driver names); spec.md treats
//! bootstrap/lifecycle as an external collaborator, but the typed
//! key/value store itself is ambient stack every component touches.
use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct Configuration {
    entries: HashMap<String, String>,
    node_role: Option<String>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a multi-line `name value` block. Blank lines and lines
    /// starting with `#` are ignored. Names are lowercased; later
    /// entries overwrite earlier ones, except names ending in `<>`
    /// which append to a `;`-separated list instead of replacing it.
    pub fn parse(text: &str) -> Self {
        let mut config = Self::new();
        config.append(text);
        config
    }

    pub fn append(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((name, value)) = line.split_once(char::is_whitespace) else {
                continue;
            };
            self.set(name.trim(), value.trim());
        }
    }

    pub fn set(&mut self, name: &str, value: &str) {
        let name = name.to_lowercase();
        if let Some(base) = name.strip_suffix("<>") {
            let existing = self.entries.get(base).cloned();
            let combined = match existing {
                Some(prev) if !prev.is_empty() => format!("{};{}", prev, value),
                _ => value.to_string(),
            };
            self.entries.insert(base.to_string(), combined);
            if name == "node_role<>" {
                self.node_role = Some(value.to_string());
            }
        } else {
            if name == "node_role" {
                self.node_role = Some(value.to_string());
            }
            self.entries.insert(name, value.to_string());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Try `<role>.<name>`, then `default.<name>`, then bare `<name>`.
    fn resolve(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        if let Some(role) = &self.node_role {
            if let Some(v) = self.entries.get(&format!("{}.{}", role, name)) {
                return Some(v);
            }
        }
        if let Some(v) = self.entries.get(&format!("default.{}", name)) {
            return Some(v);
        }
        self.entries.get(&name).map(|s| s.as_str())
    }

    pub fn get_string(&self, name: &str, default_value: &str) -> String {
        self.resolve(name).unwrap_or(default_value).to_string()
    }

    pub fn get_bool(&self, name: &str, default_value: bool) -> bool {
        match self.resolve(name) {
            Some(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"),
            None => default_value,
        }
    }

    pub fn get_int(&self, name: &str, default_value: i64) -> i64 {
        self.resolve(name)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(default_value)
    }

    /// Multiplier-aware: `4k` -> 4096, `2m` -> 2*1024*1024.
    pub fn get_bytes(&self, name: &str, default_value: u64) -> u64 {
        let Some(v) = self.resolve(name) else {
            return default_value;
        };
        let v = v.trim();
        let (digits, mult) = match v.chars().last() {
            Some('k') | Some('K') => (&v[..v.len() - 1], 1024),
            Some('m') | Some('M') => (&v[..v.len() - 1], 1024 * 1024),
            _ => (v, 1),
        };
        digits
            .parse::<u64>()
            .map(|n| n * mult)
            .unwrap_or(default_value)
    }

    pub fn get_string_vector(&self, name: &str) -> Vec<String> {
        match self.resolve(name) {
            Some(v) if !v.is_empty() => v.split(';').map(|s| s.trim().to_string()).collect(),
            _ => Vec::new(),
        }
    }

    pub fn role(&self) -> &str {
        self.node_role.as_deref().unwrap_or("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_lookup() {
        let c = Configuration::parse("node_role server\nserver.debug true\ndebug false\n");
        assert!(c.get_bool("debug", false));
        assert_eq!(c.role(), "server");
    }

    #[test]
    fn falls_back_to_default_role() {
        let c = Configuration::parse("default.bucket mybucket\n");
        assert_eq!(c.get_string("bucket", ""), "mybucket");
    }

    #[test]
    fn appends_list_entries() {
        let c = Configuration::parse("dirman.root_nodes<> node1\ndirman.root_nodes<> node2\n");
        assert_eq!(
            c.get_string_vector("dirman.root_nodes"),
            vec!["node1".to_string(), "node2".to_string()]
        );
    }

    #[test]
    fn byte_multipliers() {
        let c = Configuration::parse("bufsize 4k\n");
        assert_eq!(c.get_bytes("bufsize", 0), 4096);
    }
}

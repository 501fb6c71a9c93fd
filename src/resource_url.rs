//! `ResourceUrl`: `type:<nodeid>[bucket]/path/name&opt=v&opt=v` (spec §3).
//! Grounded in `faodel::ResourceURL`; implements the `reference` chain
//! and round-trip `Display`/parse that `original_source` carries (the
//! `(NodeID, bucket, path, name, options)` composite spec §8 requires a
//! round-trip property for).
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::bucket::Bucket;
use crate::error::{ProtocolError, Result};
use crate::node::NodeId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceUrl {
    pub resource_type: String,
    pub reference_node: NodeId,
    pub bucket: Bucket,
    pub path: String,
    pub name: String,
    // BTreeMap canonicalizes option ordering on serialization (spec §3).
    options: BTreeMap<String, String>,
}

impl ResourceUrl {
    pub fn new(resource_type: impl Into<String>, path: impl Into<String>, name: impl Into<String>) -> Self {
        let path = path.into();
        ResourceUrl {
            resource_type: resource_type.into(),
            reference_node: NodeId::UNSPECIFIED,
            bucket: Bucket::UNSPECIFIED,
            path: if path.is_empty() { "/".to_string() } else { path },
            name: name.into(),
            options: BTreeMap::new(),
        }
    }

    /// A `ref:` prefix (empty `resource_type`) denotes a reference.
    pub fn is_reference(&self) -> bool {
        self.resource_type.is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.path == "/" && self.name.is_empty()
    }

    pub fn set_option(&mut self, name: &str, value: &str) {
        self.options.insert(name.to_string(), value.to_string());
    }

    pub fn get_option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(|s| s.as_str())
    }

    pub fn options(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Canonical path/name, e.g. `/root/rack0/mydht`.
    pub fn path_name(&self) -> String {
        if self.path == "/" {
            format!("/{}", self.name)
        } else {
            format!("{}/{}", self.path, self.name)
        }
    }

    /// Full canonical form: `type:<node>[bucket]/path/name&opt=v&opt=v`,
    /// options sorted by key so two equal URLs always serialize
    /// byte-identically.
    pub fn to_full_url(&self) -> String {
        let mut s = String::new();
        s.push_str(&self.resource_type);
        s.push(':');
        if !self.reference_node.is_unspecified() {
            s.push('<');
            s.push_str(&format!("0x{:016x}", self.reference_node.id()));
            s.push('>');
        }
        if !self.bucket.is_unspecified() {
            s.push('[');
            s.push_str(&self.bucket.to_hex());
            s.push(']');
        }
        s.push_str(&self.path_name());
        for (k, v) in &self.options {
            s.push('&');
            s.push_str(k);
            s.push('=');
            s.push_str(v);
        }
        s
    }
}

impl FromStr for ResourceUrl {
    type Err = crate::error::Error;

    fn from_str(url: &str) -> Result<Self> {
        let (resource_type, rest) = url
            .split_once(':')
            .ok_or(ProtocolError::ParseError("missing ':' after resource type"))?;

        let mut rest = rest;
        let mut reference_node = NodeId::UNSPECIFIED;
        if let Some(after) = rest.strip_prefix('<') {
            let (node_str, tail) = after
                .split_once('>')
                .ok_or(ProtocolError::ParseError("unterminated '<node>'"))?;
            let node_str = node_str.strip_prefix("0x").unwrap_or(node_str);
            let id = u64::from_str_radix(node_str, 16).map_err(|_| ProtocolError::ParseError("bad node literal"))?;
            reference_node = NodeId::from_raw(id);
            rest = tail;
        }

        let mut bucket = Bucket::UNSPECIFIED;
        if let Some(after) = rest.strip_prefix('[') {
            let (bucket_str, tail) = after
                .split_once(']')
                .ok_or(ProtocolError::ParseError("unterminated '[bucket]'"))?;
            bucket = Bucket::new(bucket_str);
            rest = tail;
        }

        let (path_name, options_str) = match rest.split_once('&') {
            Some((p, o)) => (p, Some(o)),
            None => (rest, None),
        };

        let (path, name) = match path_name.rsplit_once('/') {
            Some((path, name)) => (if path.is_empty() { "/".to_string() } else { path.to_string() }, name.to_string()),
            None => ("/".to_string(), path_name.to_string()),
        };

        let mut options = BTreeMap::new();
        if let Some(options_str) = options_str {
            for pair in options_str.split('&') {
                if pair.is_empty() {
                    continue;
                }
                let (k, v) = pair
                    .split_once('=')
                    .ok_or(ProtocolError::ParseError("option missing '='"))?;
                options.insert(k.to_string(), v.to_string());
            }
        }

        Ok(ResourceUrl {
            resource_type: resource_type.to_string(),
            reference_node,
            bucket,
            path,
            name,
            options,
        })
    }
}

impl fmt::Display for ResourceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_full_url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_full_url() {
        let mut url = ResourceUrl::new("dht", "/root/rack0", "mydht");
        url.reference_node = NodeId::from_raw(0xAABB90);
        url.bucket = Bucket::new("mybucket");
        url.set_option("min_members", "4");
        url.set_option("replication", "2");

        let s = url.to_full_url();
        let parsed: ResourceUrl = s.parse().unwrap();
        assert_eq!(parsed, url);
    }

    #[test]
    fn option_order_is_canonicalized() {
        let mut a = ResourceUrl::new("dht", "/p", "n");
        a.set_option("z", "1");
        a.set_option("a", "2");
        assert_eq!(a.to_full_url(), "dht:/p/n&a=2&z=1");
    }

    #[test]
    fn minimal_local_url() {
        let url: ResourceUrl = "local:".parse().unwrap();
        assert_eq!(url.resource_type, "local");
        assert!(url.is_root());
    }

    #[test]
    fn reference_type_is_empty_prefix() {
        let url: ResourceUrl = ":/root/rack0/mydht".parse().unwrap();
        assert!(url.is_reference());
    }
}

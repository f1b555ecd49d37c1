//! IP prefix trie with longest-prefix match.
//!
//! Prefixes are stored in a binary trie over 128-bit addresses. IPv4 is
//! mapped into `::ffff:0:0/96`, so `10.0.0.0/8` becomes a /104 prefix and
//! IPv4 and IPv6 rows share one tree.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use dictum_core::{AttributeType, Attributes, Key, KeyModel, LookupError, Row, SourceError, Value};

use super::snapshot::{SnapshotBuilder, SnapshotData};
use super::Probe;

const IPV4_MAPPED_PREFIX: u8 = 96;
const NO_CHILD: u32 = 0;

#[derive(Debug, Clone, Copy, Default)]
struct Node {
    /// Index of the 0 and 1 child; `NO_CHILD` when absent (the root is never a child).
    children: [u32; 2],
    value: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct TrieData {
    nodes: Vec<Node>,
    values: Vec<Attributes>,
}

impl Default for TrieData {
    fn default() -> Self {
        Self {
            nodes: vec![Node::default()],
            values: Vec::new(),
        }
    }
}

impl TrieData {
    pub fn builder() -> TrieBuilder {
        TrieBuilder {
            data: TrieData::default(),
        }
    }

    /// Longest stored prefix containing `addr`.
    pub fn longest_match(&self, addr: u128) -> Option<&Attributes> {
        let mut node = &self.nodes[0];
        let mut best = node.value;
        for depth in 0..128 {
            let bit = ((addr >> (127 - depth)) & 1) as usize;
            let next = node.children[bit];
            if next == NO_CHILD {
                break;
            }
            node = &self.nodes[next as usize];
            if node.value.is_some() {
                best = node.value;
            }
        }
        best.map(|i| &self.values[i as usize])
    }

    fn insert(&mut self, addr: u128, prefix_len: u8, attrs: Attributes) -> Result<(), SourceError> {
        let mut index = 0usize;
        for depth in 0..u32::from(prefix_len) {
            let bit = ((addr >> (127 - depth)) & 1) as usize;
            let next = self.nodes[index].children[bit];
            index = if next == NO_CHILD {
                let created = u32::try_from(self.nodes.len())
                    .map_err(|_| SourceError::data("trie node count exceeds u32"))?;
                self.nodes.push(Node::default());
                self.nodes[index].children[bit] = created;
                created as usize
            } else {
                next as usize
            };
        }
        match self.nodes[index].value {
            // Equal prefix delivered again: the later row replaces it.
            Some(slot) => self.values[slot as usize] = attrs,
            None => {
                let slot = u32::try_from(self.values.len())
                    .map_err(|_| SourceError::data("trie value count exceeds u32"))?;
                self.values.push(attrs);
                self.nodes[index].value = Some(slot);
            }
        }
        Ok(())
    }
}

impl SnapshotData for TrieData {
    type Builder = TrieBuilder;

    fn len(&self) -> usize {
        self.values.len()
    }

    fn to_builder(&self) -> TrieBuilder {
        TrieBuilder { data: self.clone() }
    }

    fn get(&self, probe: Probe<'_>) -> Option<Attributes> {
        let addr = lookup_address(probe.key)?;
        self.longest_match(addr).cloned()
    }

    fn check_key(_model: &KeyModel, key: &Key) -> Result<(), LookupError> {
        let valid = match key {
            Key::Simple(v) => *v <= u64::from(u32::MAX),
            Key::Complex(fields) => match fields.as_slice() {
                [Value::String(s)] => s.parse::<IpAddr>().is_ok(),
                [Value::UInt64(v)] => *v <= u64::from(u32::MAX),
                _ => false,
            },
        };
        if valid {
            Ok(())
        } else {
            Err(LookupError::KeyMismatch {
                expected: "IP address String or IPv4 UInt64".to_string(),
                got: key.to_string(),
            })
        }
    }
}

#[derive(Debug)]
pub struct TrieBuilder {
    data: TrieData,
}

impl SnapshotBuilder for TrieBuilder {
    type Output = TrieData;

    fn insert(&mut self, row: Row) -> Result<(), SourceError> {
        let text = match &row.key {
            Key::Complex(fields) => match fields.as_slice() {
                [Value::String(s)] => s.clone(),
                _ => {
                    return Err(SourceError::data(format!(
                        "trie key must be one {} field, got {}",
                        AttributeType::String,
                        row.key
                    )))
                }
            },
            Key::Simple(_) => {
                return Err(SourceError::data(format!(
                    "trie key must be a prefix string, got {}",
                    row.key
                )))
            }
        };
        let (addr, prefix_len) = parse_prefix(&text)?;
        self.data.insert(addr, prefix_len, row.into_attributes())
    }

    fn finish(self) -> Result<TrieData, SourceError> {
        Ok(self.data)
    }
}

fn mapped_v4(addr: Ipv4Addr) -> u128 {
    u128::from(addr.to_ipv6_mapped())
}

fn to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => mapped_v4(v4),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Parse `addr` or `addr/len` into a masked 128-bit prefix.
pub fn parse_prefix(text: &str) -> Result<(u128, u8), SourceError> {
    let text = text.trim();
    let (addr_text, len_text) = match text.split_once('/') {
        Some((a, l)) => (a, Some(l)),
        None => (text, None),
    };
    let invalid = || SourceError::data(format!("invalid IP prefix {text:?}"));

    let (addr, max_len, offset) = if let Ok(v4) = addr_text.parse::<Ipv4Addr>() {
        (mapped_v4(v4), 32u8, IPV4_MAPPED_PREFIX)
    } else if let Ok(v6) = addr_text.parse::<Ipv6Addr>() {
        (u128::from(v6), 128u8, 0u8)
    } else {
        return Err(invalid());
    };

    let len = match len_text {
        Some(l) => l.parse::<u8>().map_err(|_| invalid())?,
        None => max_len,
    };
    if len > max_len {
        return Err(invalid());
    }
    let prefix_len = len + offset;
    let mask = if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix_len))
    };
    Ok((addr & mask, prefix_len))
}

fn lookup_address(key: &Key) -> Option<u128> {
    let ipv4 = |v: u64| u32::try_from(v).ok().map(|v| mapped_v4(Ipv4Addr::from(v)));
    match key {
        Key::Simple(v) => ipv4(*v),
        Key::Complex(fields) => match fields.as_slice() {
            [Value::String(s)] => s.trim().parse::<IpAddr>().ok().map(to_u128),
            [Value::UInt64(v)] => ipv4(*v),
            _ => None,
        },
    }
}

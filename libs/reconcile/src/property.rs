//! Proxmox property strings.
//!
//! Several VM config fields (`meta`, `smbios1`, ...) are stored as a comma
//! separated list of `key=value` pairs, e.g. `creation-qemu=8.1.2,ctime=1700000000`.
//! Some fields also carry a bare leading value without a key.
//!
//! [`PropertyList`] keeps entries in their original order so that a
//! read-modify-write cycle changes only the keys that were explicitly set.
//! Lookups are order-independent. When a key appears more than once the last
//! value wins and the entry keeps the position of its first occurrence.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Pair(String, String),
    Bare(String),
}

/// Ordered `key=value` property list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyList {
    entries: Vec<Entry>,
}

impl PropertyList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a property string. Never fails; empty segments are dropped.
    pub fn parse(input: &str) -> Self {
        let mut list = Self::new();
        for segment in input.split(',') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            match segment.split_once('=') {
                Some((key, value)) => list.set(key.trim(), value),
                None => list.entries.push(Entry::Bare(segment.to_string())),
            }
        }
        list
    }

    /// Look up the value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find_map(|entry| match entry {
            Entry::Pair(k, v) if k == key => Some(v.as_str()),
            _ => None,
        })
    }

    /// Set `key`, replacing an existing value in place or appending.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        let existing = self.entries.iter_mut().find_map(|entry| match entry {
            Entry::Pair(k, v) if *k == key => Some(v),
            _ => None,
        });

        match existing {
            Some(slot) => *slot = value,
            None => self.entries.push(Entry::Pair(key, value)),
        }
    }

    /// Apply every pair of `other` on top of `self`.
    pub fn merge(&mut self, other: &PropertyList) {
        for entry in &other.entries {
            if let Entry::Pair(key, value) = entry {
                self.set(key.clone(), value.clone());
            }
        }
    }

    /// Parse `key` as an integer.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key)?.trim().parse().ok()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for PropertyList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match entry {
                Entry::Pair(key, value) => write!(f, "{key}={value}")?,
                Entry::Bare(value) => f.write_str(value)?,
            }
        }
        Ok(())
    }
}

impl<K, V> FromIterator<(K, V)> for PropertyList
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut list = Self::new();
        for (key, value) in iter {
            list.set(key, value);
        }
        list
    }
}

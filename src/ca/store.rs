//! Leaf certificate caches used by [`Authority`](super::Authority).

use moka::sync::Cache;
use parking_lot::RwLock;
use std::{collections::HashMap, fmt, sync::Arc};
use tokio_rustls::rustls::sign::CertifiedKey;

/// Default capacity of [`MemoryStore`].
const DEFAULT_CAPACITY: u64 = 4096;

/// A keyed cache of signed leaf certificates.
///
/// Implementations must tolerate concurrent `get`/`set` from every
/// connection's handshake path. Losing a race between two `set`s for the same
/// key is acceptable.
pub trait CertStore: Send + Sync {
    /// Look up the leaf that serves `host`.
    fn get(&self, host: &str) -> Option<Arc<CertifiedKey>>;

    /// Store `cert` under `key`.
    fn set(&self, key: String, cert: Arc<CertifiedKey>);
}

/// Flat exact-match store with bounded capacity.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Cache<String, Arc<CertifiedKey>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            inner: Cache::builder().max_capacity(capacity).build(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}

impl CertStore for MemoryStore {
    fn get(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        self.inner.get(host)
    }

    fn set(&self, key: String, cert: Arc<CertifiedKey>) {
        self.inner.insert(key, cert);
    }
}

/// Store keyed by domain labels, supporting wildcard keys.
///
/// Keys are one of:
/// * `a.example.com`: exact match;
/// * `*.example.com`: exactly one label below `example.com`;
/// * `+.example.com`: `example.com` itself and any subdomain.
///
/// Lookups prefer exact over `*` over `+`, and deeper matches over shallower ones.
#[derive(Default)]
pub struct DomainTrieStore {
    root: RwLock<Node>,
}

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    exact: Option<Arc<CertifiedKey>>,
    wildcard: Option<Arc<CertifiedKey>>,
    plus: Option<Arc<CertifiedKey>>,
}

enum Slot {
    Exact,
    Wildcard,
    Plus,
}

impl DomainTrieStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for DomainTrieStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainTrieStore").finish()
    }
}

fn split_key(key: &str) -> (Slot, &str) {
    if let Some(rest) = key.strip_prefix("*.") {
        (Slot::Wildcard, rest)
    } else if let Some(rest) = key.strip_prefix("+.") {
        (Slot::Plus, rest)
    } else {
        (Slot::Exact, key)
    }
}

fn labels(domain: &str) -> impl Iterator<Item = &str> {
    domain.rsplit('.').filter(|label| !label.is_empty())
}

impl CertStore for DomainTrieStore {
    fn get(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        let host = host.trim_end_matches('.');
        let parts: Vec<&str> = labels(host).collect();
        if parts.is_empty() {
            return None;
        }

        let root = self.root.read();
        let mut node = &*root;
        // Deepest plus-wildcard seen while walking towards the host.
        let mut plus = node.plus.clone();
        for (depth, label) in parts.iter().enumerate() {
            // A `*.` entry on the parent covers the final label.
            if depth + 1 == parts.len() {
                if let Some(child) = node.children.get(*label) {
                    if let Some(cert) = &child.exact {
                        return Some(cert.clone());
                    }
                    if let Some(cert) = &child.plus {
                        return Some(cert.clone());
                    }
                }
                if let Some(cert) = &node.wildcard {
                    return Some(cert.clone());
                }
                return plus;
            }
            match node.children.get(*label) {
                Some(child) => {
                    node = child;
                    if node.plus.is_some() {
                        plus = node.plus.clone();
                    }
                }
                None => return plus,
            }
        }
        plus
    }

    fn set(&self, key: String, cert: Arc<CertifiedKey>) {
        let (slot, domain) = split_key(key.trim_end_matches('.'));
        let mut root = self.root.write();
        let mut node = &mut *root;
        for label in labels(domain) {
            node = node.children.entry(label.to_owned()).or_default();
        }
        match slot {
            Slot::Exact => node.exact = Some(cert),
            Slot::Wildcard => node.wildcard = Some(cert),
            Slot::Plus => node.plus = Some(cert),
        }
    }
}

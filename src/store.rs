//! The shared name → address record store.
//!
//! The refresher is the only writer and every DNS query is a reader.  Each
//! update takes the write lock once, so a reader sees the mapping either
//! entirely before or entirely after a refresh cycle is applied.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Fully-qualified, lowercased name → IPv4 address.
pub type Records = HashMap<String, Ipv4Addr>;

/// How a refresh cycle's records are applied to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordPolicy {
    /// The new records become the whole store; names that left the
    /// inventory stop resolving locally.
    #[default]
    Replace,
    /// New records are added or overwritten; names that left the inventory
    /// keep their last known address.
    Merge,
}

#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    inner: Arc<RwLock<Records>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a fully-qualified, dot-terminated name.
    pub async fn get(&self, name: &str) -> Option<Ipv4Addr> {
        let map = self.inner.read().await;
        if name.bytes().any(|b| b.is_ascii_uppercase()) {
            map.get(&name.to_ascii_lowercase()).copied()
        } else {
            map.get(name).copied()
        }
    }

    pub async fn replace_all(&self, records: Records) {
        let records = lowercase_keys(records);
        let mut map = self.inner.write().await;
        debug!("Replacing {} records with {}", map.len(), records.len());
        *map = records;
    }

    pub async fn merge_in(&self, records: Records) {
        let records = lowercase_keys(records);
        let mut map = self.inner.write().await;
        debug!("Merging {} records into {}", records.len(), map.len());
        map.extend(records);
    }

    pub async fn apply(&self, policy: RecordPolicy, records: Records) {
        match policy {
            RecordPolicy::Replace => self.replace_all(records).await,
            RecordPolicy::Merge => self.merge_in(records).await,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// A copy of the current mapping.
    pub async fn snapshot(&self) -> Records {
        self.inner.read().await.clone()
    }
}

fn lowercase_keys(records: Records) -> Records {
    records
        .into_iter()
        .map(|(name, addr)| (name.to_ascii_lowercase(), addr))
        .collect()
}

//! Durable key to record mapping with secondary indexes by kind and owner.

mod retry;
pub mod sqlite;

pub use sqlite::SqliteBlobStore;

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// What a stored resource is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    /// The manifest a download was started from.
    RootManifest,
    /// A variant or rendition playlist listing fragments.
    SubManifest,
    /// A media fragment of the primary presentation.
    Segment,
    /// A subtitle or caption playlist, or one of its fragments.
    SideTrack,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RootManifest => "root-manifest",
            Self::SubManifest => "sub-manifest",
            Self::Segment => "segment",
            Self::SideTrack => "side-track",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "root-manifest" => Some(Self::RootManifest),
            "sub-manifest" => Some(Self::SubManifest),
            "segment" => Some(Self::Segment),
            "side-track" => Some(Self::SideTrack),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate download progress stored on a root record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Resources finished (stored, skipped as present, or failed).
    pub completed: u64,
    /// Resources discovered so far.
    pub expected: u64,
    /// Discovery has finished; `expected` will not grow any more.
    pub settled: bool,
}

impl Progress {
    pub fn new(completed: u64, expected: u64, settled: bool) -> Self {
        Self {
            completed,
            expected,
            settled,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.settled && self.completed == self.expected
    }
}

/// A stored resource, keyed by its URL.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: String,
    pub kind: RecordKind,
    /// URL of the root manifest this record belongs to; the root owns itself.
    pub owner: String,
    pub payload: Bytes,
    /// Only present on root-manifest records.
    pub progress: Option<Progress>,
}

impl Record {
    pub fn new(
        key: impl Into<String>,
        kind: RecordKind,
        owner: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            key: key.into(),
            kind,
            owner: owner.into(),
            payload,
            progress: None,
        }
    }

    /// A root-manifest record owning itself.
    pub fn root(url: impl Into<String>, payload: Bytes, progress: Progress) -> Self {
        let url = url.into();
        Self {
            owner: url.clone(),
            key: url,
            kind: RecordKind::RootManifest,
            payload,
            progress: Some(progress),
        }
    }

    pub fn is_root(&self) -> bool {
        self.kind == RecordKind::RootManifest
    }
}

/// Storage backend for cached resources.
///
/// `put` to the same key is last-write-wins by completion order; nothing is
/// promised about ordering across different keys.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Insert or overwrite the record stored under `record.key`.
    async fn put(&self, record: &Record) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Record>>;

    /// Existence check that does not load the payload.
    async fn contains(&self, key: &str) -> Result<bool>;

    async fn keys_by_owner(&self, owner: &str) -> Result<BTreeSet<String>>;

    async fn keys_by_kind(&self, kind: RecordKind) -> Result<BTreeSet<String>>;

    /// Distinct owners referenced by any stored record.
    async fn owners(&self) -> Result<BTreeSet<String>>;

    /// Remove all `keys` in one atomic unit: either every key is removed or none.
    /// Returns the number of records deleted.
    async fn delete_many(&self, keys: &[String]) -> Result<u64>;
}

// Commit audit: one structured event per committed partition write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Record of a single committed write to one partition of a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitAudit {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub collection: String,
    pub partition: String,
    pub upserted: usize,
    pub removed: usize,
    /// SHA-256 over the plaintext rows of the partition after the commit.
    pub digest: Option<String>,
}

impl CommitAudit {
    pub fn new(collection: &str, partition: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            collection: collection.to_string(),
            partition: partition.to_string(),
            upserted: 0,
            removed: 0,
            digest: None,
        }
    }

    pub fn with_counts(mut self, upserted: usize, removed: usize) -> Self {
        self.upserted = upserted;
        self.removed = removed;
        self
    }

    pub fn with_digest(mut self, digest: String) -> Self {
        self.digest = Some(digest);
        self
    }

    pub fn emit(&self) {
        tracing::info!(
            target: "govern::audit",
            audit_id = %self.id,
            collection = %self.collection,
            partition = %self.partition,
            upserted = self.upserted,
            removed = self.removed,
            digest = self.digest.as_deref().unwrap_or("-"),
            "commit"
        );
    }
}

/// Order-sensitive digest of `(key, value)` rows; callers pass rows in key order.
pub fn snapshot_digest<'a, I>(rows: I) -> String
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let mut hasher = Sha256::new();
    for (key, value) in rows {
        hasher.update((key.len() as u64).to_be_bytes());
        hasher.update(key);
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_depends_on_row_boundaries() {
        let a = snapshot_digest([(b"ab".as_slice(), b"c".as_slice())]);
        let b = snapshot_digest([(b"a".as_slice(), b"bc".as_slice())]);
        assert_ne!(a, b);
    }

    #[test]
    fn digest_is_stable_for_equal_rows() {
        let rows = [(b"k1".as_slice(), b"v1".as_slice()), (b"k2".as_slice(), b"v2".as_slice())];
        assert_eq!(snapshot_digest(rows), snapshot_digest(rows));
    }
}

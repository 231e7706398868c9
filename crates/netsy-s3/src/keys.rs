//! The object key layout.
//!
//! Chunks live under `chunks/{revision % 10000:04}/{revision:019}.netsy`:
//! the partition prefix spreads writes so listings and request rates do not
//! concentrate on one key prefix. Snapshots live under
//! `snapshots/{revision:019}.netsy`. Both sit below an optional configured
//! prefix.
//!
//! Parsing is strict but non-fatal: filenames that do not match the revision
//! pattern are skipped with a warning rather than failing a listing.

use object_store::path::Path;

pub const FILE_SUFFIX: &str = ".netsy";

/// Computes and parses object keys under an optional prefix.
#[derive(Debug, Clone, Default)]
pub struct Layout {
    prefix: Option<String>,
}

impl Layout {
    pub fn new(prefix: Option<String>) -> Self {
        let prefix = prefix.filter(|p| !p.is_empty());
        Self { prefix }
    }

    fn prefixed(&self, key: &str) -> Path {
        match &self.prefix {
            Some(prefix) => Path::from(format!("{prefix}/{key}")),
            None => Path::from(key),
        }
    }

    pub fn chunk_key(&self, revision: i64) -> Path {
        self.prefixed(&format!(
            "chunks/{:04}/{:019}{FILE_SUFFIX}",
            revision % 10_000,
            revision
        ))
    }

    pub fn snapshot_key(&self, revision: i64) -> Path {
        self.prefixed(&format!("snapshots/{revision:019}{FILE_SUFFIX}"))
    }

    pub fn chunks_prefix(&self) -> Path {
        self.prefixed("chunks")
    }

    pub fn snapshots_prefix(&self) -> Path {
        self.prefixed("snapshots")
    }

    /// Extract the revision from an object's filename, or `None` when the
    /// name does not match `{revision:019}.netsy`.
    pub fn parse_revision(path: &Path) -> Option<i64> {
        let filename = path.parts().last()?;
        let filename = filename.as_ref();
        let digits = filename.strip_suffix(FILE_SUFFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_key_partitions_by_modulo() {
        let layout = Layout::new(None);
        assert_eq!(
            layout.chunk_key(42).as_ref(),
            "chunks/0042/0000000000000000042.netsy"
        );
        assert_eq!(
            layout.chunk_key(123_456).as_ref(),
            "chunks/3456/0000000000000123456.netsy"
        );
    }

    #[test]
    fn test_snapshot_key() {
        let layout = Layout::new(None);
        assert_eq!(
            layout.snapshot_key(100).as_ref(),
            "snapshots/0000000000000000100.netsy"
        );
    }

    #[test]
    fn test_prefix_is_applied() {
        let layout = Layout::new(Some("prod/cluster-a".to_string()));
        assert_eq!(
            layout.chunk_key(1).as_ref(),
            "prod/cluster-a/chunks/0001/0000000000000000001.netsy"
        );
        assert_eq!(layout.snapshots_prefix().as_ref(), "prod/cluster-a/snapshots");
    }

    #[test]
    fn test_empty_prefix_is_no_prefix() {
        let layout = Layout::new(Some(String::new()));
        assert_eq!(layout.chunks_prefix().as_ref(), "chunks");
    }

    #[test]
    fn test_parse_revision() {
        let path = Path::from("chunks/0042/0000000000000000042.netsy");
        assert_eq!(Layout::parse_revision(&path), Some(42));
    }

    #[test]
    fn test_parse_revision_rejects_foreign_files() {
        for key in [
            "chunks/0042/readme.txt",
            "chunks/0042/notanumber.netsy",
            "chunks/0042/.netsy",
            "snapshots/12x45.netsy",
        ] {
            assert_eq!(Layout::parse_revision(&Path::from(key)), None, "{key}");
        }
    }
}

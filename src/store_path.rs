use std::fmt;

use serde::{Deserialize, Serialize};

/// Length of the nixbase32-encoded digest prefixing every store path
/// basename.
pub const HASH_PART_LEN: usize = 32;

/// An absolute path identifying one object in a content-addressed store,
/// e.g. `/nix/store/dbghhbq1x39yxgkv3vkgfwbxrmw9nfzi-hello-2.12.1`.
///
/// The path is opaque to the pipelines; equality is string equality. The only
/// structure we rely on is the `<hash>-<name>` shape of the basename, which
/// keys the corresponding `.narinfo` file in archives and in the client
/// state cache.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorePath(String);

impl StorePath {
    pub fn new(path: impl Into<String>) -> Self {
        StorePath(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The nixbase32 digest part of the basename, or None if the path does
    /// not look like a store path at all.
    pub fn hash_part(&self) -> Option<&str> {
        let base = self.0.rsplit('/').next()?;
        let (hash, _name) = base.split_once('-')?;
        if hash.len() != HASH_PART_LEN || !hash.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return None;
        }
        Some(hash)
    }

    /// Basename of the path (`<hash>-<name>`), as it appears in narinfo
    /// reference lists.
    pub fn basename(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_part_of_regular_path() {
        let p = StorePath::new("/nix/store/00000000000000000000000000000000-toplevel");
        assert_eq!(p.hash_part(), Some("00000000000000000000000000000000"));
        assert_eq!(p.basename(), "00000000000000000000000000000000-toplevel");
    }

    #[test]
    fn hash_part_rejects_short_digest() {
        assert_eq!(StorePath::new("/nix/store/abc-foo").hash_part(), None);
        assert_eq!(StorePath::new("no-store-path").hash_part(), None);
    }

    #[test]
    fn serializes_as_plain_string() {
        let p = StorePath::new("/nix/store/00000000000000000000000000000000-x");
        assert_eq!(
            serde_json::to_string(&p).unwrap(),
            "\"/nix/store/00000000000000000000000000000000-x\""
        );
    }
}

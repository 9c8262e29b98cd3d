use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::store_path::StorePath;

/// Metadata record for one store path, in the shape `nix path-info --json`
/// emits it. The transitive closure of a root is the fixpoint of
/// `references`; a path's `nar_hash` uniquely identifies its byte content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathInfo {
    pub path: StorePath,

    #[serde(rename = "narHash")]
    pub nar_hash: String,

    #[serde(rename = "narSize")]
    pub nar_size: u64,

    /// References are kept ordered so serialized output is deterministic.
    #[serde(default)]
    pub references: BTreeSet<StorePath>,
}

impl PathInfo {
    /// References without the path itself; store objects routinely refer to
    /// themselves, which matters for neither ordering nor delta membership.
    pub fn references_excluding_self(&self) -> impl Iterator<Item = &StorePath> {
        self.references.iter().filter(move |r| **r != self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_path_info_json() {
        let raw = r#"{
            "path": "/nix/store/dbghhbq1x39yxgkv3vkgfwbxrmw9nfzi-hello-2.12.1",
            "narHash": "sha256:0alzbhjxdcsmr1pk7z0bdh46r2xpq3xs3k9y82bi4bx5pklcvw5x",
            "narSize": 226560,
            "references": [
                "/nix/store/dbghhbq1x39yxgkv3vkgfwbxrmw9nfzi-hello-2.12.1",
                "/nix/store/ddwyrxif62r8n6xclvskjyy6szdhvj60-glibc-2.39-5"
            ],
            "registrationTime": 1700000000
        }"#;

        let info: PathInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.nar_size, 226560);
        assert_eq!(info.references.len(), 2);
        assert_eq!(
            info.references_excluding_self().collect::<Vec<_>>(),
            vec![&StorePath::new(
                "/nix/store/ddwyrxif62r8n6xclvskjyy6szdhvj60-glibc-2.39-5"
            )]
        );
    }

    #[test]
    fn missing_references_default_to_empty() {
        let raw = r#"{"path": "/nix/store/rxganm4ibf31qngal3j3psp20mak37yy-xgcc-13.2.0-libgcc", "narHash": "sha256:x", "narSize": 1}"#;
        let info: PathInfo = serde_json::from_str(raw).unwrap();
        assert!(info.references.is_empty());
    }
}

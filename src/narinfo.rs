//! Reading and writing `.narinfo` files, the "Key: value" metadata records a
//! file:// binary cache keeps next to its data objects.
//!
//! Only the fields the instruction pipelines act on are modeled: the store
//! path, where the data object lives relative to the archive root, and the
//! NAR hash/size/references describing it. Everything else a store tool may
//! emit (signatures, deriver, CA) is passed over without complaint, since we
//! neither verify nor rewrite those.

use std::fmt::{self, Display};

use crate::store_path::StorePath;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NarInfo {
    /// Store path described by this record.
    pub store_path: StorePath,
    /// Location of the data object, relative to the archive root.
    pub url: String,
    /// Compression of the data object; `None` means uncompressed.
    pub compression: Option<String>,
    /// Hash of the NAR serialization, in the store tool's `sha256:…` form.
    pub nar_hash: String,
    pub nar_size: u64,
    /// Basenames (`<hash>-<name>`) of referenced store paths.
    pub references: Vec<String>,
}

impl NarInfo {
    pub fn parse(input: &str) -> Result<Self, Error> {
        let mut store_path = None;
        let mut url = None;
        let mut compression = None;
        let mut nar_hash = None;
        let mut nar_size = None;
        let mut references = None;

        for line in input.lines() {
            if line.is_empty() {
                continue;
            }
            let (tag, val) = line
                .split_once(':')
                .ok_or_else(|| Error::InvalidLine(line.to_string()))?;
            let val = val
                .strip_prefix(' ')
                .ok_or_else(|| Error::InvalidLine(line.to_string()))?;

            match tag {
                "StorePath" => {
                    if store_path.replace(StorePath::new(val)).is_some() {
                        return Err(Error::DuplicateField(tag.to_string()));
                    }
                }
                "URL" => {
                    if val.is_empty() {
                        return Err(Error::EmptyField(tag.to_string()));
                    }
                    if url.replace(val.to_string()).is_some() {
                        return Err(Error::DuplicateField(tag.to_string()));
                    }
                }
                "Compression" => {
                    if compression.replace(val.to_string()).is_some() {
                        return Err(Error::DuplicateField(tag.to_string()));
                    }
                }
                "NarHash" => {
                    if nar_hash.replace(val.to_string()).is_some() {
                        return Err(Error::DuplicateField(tag.to_string()));
                    }
                }
                "NarSize" => {
                    let val = val
                        .parse::<u64>()
                        .map_err(|_| Error::UnableToParseSize(val.to_string()))?;
                    if nar_size.replace(val).is_some() {
                        return Err(Error::DuplicateField(tag.to_string()));
                    }
                }
                "References" => {
                    let val: Vec<String> = if val.is_empty() {
                        vec![]
                    } else {
                        val.split(' ').map(str::to_string).collect()
                    };
                    if references.replace(val).is_some() {
                        return Err(Error::DuplicateField(tag.to_string()));
                    }
                }
                // Sig, Deriver, CA, FileHash, FileSize, System, …
                _ => continue,
            }
        }

        Ok(NarInfo {
            store_path: store_path.ok_or(Error::MissingField("StorePath"))?,
            url: url.ok_or(Error::MissingField("URL"))?,
            compression: match compression.as_deref() {
                Some("none") => None,
                _ => compression,
            },
            nar_hash: nar_hash.ok_or(Error::MissingField("NarHash"))?,
            nar_size: nar_size.ok_or(Error::MissingField("NarSize"))?,
            references: references.ok_or(Error::MissingField("References"))?,
        })
    }
}

impl Display for NarInfo {
    fn fmt(&self, w: &mut fmt::Formatter) -> fmt::Result {
        writeln!(w, "StorePath: {}", self.store_path)?;
        writeln!(w, "URL: {}", self.url)?;
        writeln!(
            w,
            "Compression: {}",
            self.compression.as_deref().unwrap_or("none")
        )?;
        writeln!(w, "NarHash: {}", self.nar_hash)?;
        writeln!(w, "NarSize: {}", self.nar_size)?;

        write!(w, "References:")?;
        if self.references.is_empty() {
            write!(w, " ")?;
        } else {
            for r in &self.references {
                write!(w, " {r}")?;
            }
        }
        writeln!(w)?;

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("duplicate field: {0}")]
    DuplicateField(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid line: {0}")]
    InvalidLine(String),

    #[error("field {0} may not be empty")]
    EmptyField(String),

    #[error("unable to parse NarSize: {0}")]
    UnableToParseSize(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = "\
StorePath: /nix/store/dbghhbq1x39yxgkv3vkgfwbxrmw9nfzi-hello-2.12.1
URL: nar/0alzbhjxdcsmr1pk7z0bdh46r2xpq3xs3k9y82bi4bx5pklcvw5x.nar.xz
Compression: xz
FileHash: sha256:0alzbhjxdcsmr1pk7z0bdh46r2xpq3xs3k9y82bi4bx5pklcvw5x
FileSize: 50264
NarHash: sha256:0alzbhjxdcsmr1pk7z0bdh46r2xpq3xs3k9y82bi4bx5pklcvw5x
NarSize: 226560
References: dbghhbq1x39yxgkv3vkgfwbxrmw9nfzi-hello-2.12.1 ddwyrxif62r8n6xclvskjyy6szdhvj60-glibc-2.39-5
Sig: cache.example.org-1:signaturesignaturesignature
";

    #[test]
    fn parses_store_tool_output() {
        let info = NarInfo::parse(SAMPLE).expect("must parse");
        assert_eq!(
            info.store_path,
            StorePath::new("/nix/store/dbghhbq1x39yxgkv3vkgfwbxrmw9nfzi-hello-2.12.1")
        );
        assert_eq!(
            info.url,
            "nar/0alzbhjxdcsmr1pk7z0bdh46r2xpq3xs3k9y82bi4bx5pklcvw5x.nar.xz"
        );
        assert_eq!(info.compression.as_deref(), Some("xz"));
        assert_eq!(info.nar_size, 226560);
        assert_eq!(info.references.len(), 2);
    }

    #[test]
    fn round_trips_through_display() {
        let info = NarInfo::parse(SAMPLE).unwrap();
        let reparsed = NarInfo::parse(&info.to_string()).unwrap();
        assert_eq!(info, reparsed);
    }

    #[test]
    fn compression_none_normalizes() {
        let text = "StorePath: /nix/store/x-y\nURL: nar/x.nar\nCompression: none\nNarHash: sha256:h\nNarSize: 1\nReferences: \n";
        let info = NarInfo::parse(text).unwrap();
        assert_eq!(info.compression, None);
    }

    #[test]
    fn duplicate_field_is_rejected() {
        let text = "StorePath: /nix/store/x-y\nStorePath: /nix/store/x-y\n";
        assert!(matches!(
            NarInfo::parse(text),
            Err(Error::DuplicateField(f)) if f == "StorePath"
        ));
    }

    #[test]
    fn missing_url_is_rejected() {
        let text = "StorePath: /nix/store/x-y\nNarHash: sha256:h\nNarSize: 1\nReferences: \n";
        assert!(matches!(
            NarInfo::parse(text),
            Err(Error::MissingField("URL"))
        ));
    }
}

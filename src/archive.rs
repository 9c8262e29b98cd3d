//! Materializes archive subsets: a directory in file:// binary-cache layout
//! holding exactly the data objects and info files an instruction ships.
//!
//! Layout matches what the store tool itself writes and reads back:
//! `<hash>.narinfo` entries at the archive root, data objects at the
//! relative location each info file's `URL` field names (conventionally
//! `nar/…`), plus a `nix-cache-info` marker.

use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use crate::errors::{EntryKind, Error};
use crate::narinfo::NarInfo;
use crate::store_path::StorePath;

pub const CACHE_INFO_FILE: &str = "nix-cache-info";

/// Path of the info file for `path` inside an archive, or the structured
/// error naming the entry we cannot have.
fn info_file(archive: &Path, path: &StorePath, kind: EntryKind) -> Result<PathBuf, Error> {
    let hash = path.hash_part().ok_or_else(|| Error::ArchiveIncomplete {
        kind,
        path: path.clone(),
    })?;
    Ok(archive.join(format!("{hash}.narinfo")))
}

/// Read and parse the info entry for `path` out of an archive.
async fn read_narinfo(archive: &Path, path: &StorePath, kind: EntryKind) -> Result<NarInfo, Error> {
    let file = info_file(archive, path, kind)?;
    let text = match tokio::fs::read_to_string(&file).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::ArchiveIncomplete {
                kind,
                path: path.clone(),
            })
        }
        Err(e) => return Err(Error::io(format!("reading {}", file.display()), e)),
    };
    NarInfo::parse(&text).map_err(|cause| Error::InvalidNarInfo { path: file, cause })
}

/// Copy into `dest` exactly the info entries for `info_paths` and the data
/// entries for `data_paths`, drawn from `source`. Prior contents of `dest`
/// are removed. Neither list need be a subset of the other; a requested
/// entry missing from `source` is [Error::ArchiveIncomplete].
#[instrument(skip(info_paths, data_paths), fields(infos = info_paths.len(), data = data_paths.len()), err)]
pub async fn make_archive_subset(
    source: &Path,
    dest: &Path,
    info_paths: &[StorePath],
    data_paths: &[StorePath],
) -> Result<(), Error> {
    match tokio::fs::remove_dir_all(dest).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::io(format!("clearing {}", dest.display()), e)),
    }
    tokio::fs::create_dir_all(dest)
        .await
        .map_err(|e| Error::io(format!("creating {}", dest.display()), e))?;

    for path in info_paths {
        // Parse before copying: a broken info file should fail the build, not
        // the target.
        read_narinfo(source, path, EntryKind::Info).await?;
        copy_entry(
            &info_file(source, path, EntryKind::Info)?,
            &info_file(dest, path, EntryKind::Info)?,
        )
        .await?;
    }

    for path in data_paths {
        // The info entry knows where the data object lives.
        let narinfo = read_narinfo(source, path, EntryKind::Data).await?;
        let from = source.join(&narinfo.url);
        if !from.exists() {
            return Err(Error::ArchiveIncomplete {
                kind: EntryKind::Data,
                path: path.clone(),
            });
        }
        copy_entry(&from, &dest.join(&narinfo.url)).await?;
    }

    // The marker file makes the subset a valid cache of its own.
    let cache_info = source.join(CACHE_INFO_FILE);
    if cache_info.exists() {
        copy_entry(&cache_info, &dest.join(CACHE_INFO_FILE)).await?;
    } else {
        tokio::fs::write(dest.join(CACHE_INFO_FILE), "StoreDir: /nix/store\n")
            .await
            .map_err(|e| Error::io(format!("writing {}", dest.join(CACHE_INFO_FILE).display()), e))?;
    }

    debug!(dest = %dest.display(), "archive subset written");
    Ok(())
}

/// Absolute paths of all info files in an archive directory.
pub async fn list_info_files(archive: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut entries = tokio::fs::read_dir(archive)
        .await
        .map_err(|e| Error::io(format!("listing {}", archive.display()), e))?;

    let mut found = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::io(format!("listing {}", archive.display()), e))?
    {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "narinfo") {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

async fn copy_entry(from: &Path, to: &Path) -> Result<(), Error> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
    }
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| Error::io(format!("copying {} to {}", from.display(), to.display()), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::narinfo::NarInfo;
    use pretty_assertions::assert_eq;

    fn store_path(tag: char) -> StorePath {
        StorePath::new(format!("/nix/store/{}-pkg", String::from(tag).repeat(32)))
    }

    /// Populate `dir` with a cache-layout entry for `path`.
    fn put_entry(dir: &Path, path: &StorePath) {
        let hash = path.hash_part().unwrap();
        let url = format!("nar/{hash}.nar.xz");
        std::fs::create_dir_all(dir.join("nar")).unwrap();
        std::fs::write(dir.join(&url), path.as_str().as_bytes()).unwrap();
        let info = NarInfo {
            store_path: path.clone(),
            url,
            compression: Some("xz".into()),
            nar_hash: format!("sha256:{hash}"),
            nar_size: 1,
            references: vec![],
        };
        std::fs::write(dir.join(format!("{hash}.narinfo")), info.to_string()).unwrap();
    }

    #[tokio::test]
    async fn copies_requested_entries_only() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let (a, b) = (store_path('a'), store_path('b'));
        put_entry(source.path(), &a);
        put_entry(source.path(), &b);

        // Info for both, data only for `a`.
        make_archive_subset(
            source.path(),
            dest.path(),
            &[a.clone(), b.clone()],
            &[a.clone()],
        )
        .await
        .unwrap();

        let infos = list_info_files(dest.path()).await.unwrap();
        assert_eq!(infos.len(), 2);
        assert!(dest
            .path()
            .join(format!("nar/{}.nar.xz", a.hash_part().unwrap()))
            .exists());
        assert!(!dest
            .path()
            .join(format!("nar/{}.nar.xz", b.hash_part().unwrap()))
            .exists());
        assert!(dest.path().join(CACHE_INFO_FILE).exists());
    }

    #[tokio::test]
    async fn prior_dest_contents_are_removed() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let a = store_path('a');
        put_entry(source.path(), &a);
        std::fs::write(dest.path().join("stale"), b"old").unwrap();

        make_archive_subset(source.path(), dest.path(), &[a.clone()], &[])
            .await
            .unwrap();

        assert!(!dest.path().join("stale").exists());
    }

    #[tokio::test]
    async fn missing_info_entry_is_reported() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();

        let err = make_archive_subset(source.path(), dest.path(), &[store_path('a')], &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ArchiveIncomplete {
                kind: EntryKind::Info,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn missing_data_entry_is_reported() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let a = store_path('a');
        put_entry(source.path(), &a);
        std::fs::remove_file(
            source
                .path()
                .join(format!("nar/{}.nar.xz", a.hash_part().unwrap())),
        )
        .unwrap();

        let err = make_archive_subset(source.path(), dest.path(), &[], &[a])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ArchiveIncomplete {
                kind: EntryKind::Data,
                ..
            }
        ));
    }
}

//! The client metadata cache: a flat directory of `<hash>.narinfo` files the
//! target host has successfully imported before. Future deltas reference
//! those paths as dependencies without re-shipping their metadata.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use crate::errors::Error;
use crate::store_path::StorePath;

const LOCK_FILE: &str = "freight.lock";

/// Info files in `cache_dir` whose store-hash prefix matches one of `paths`.
#[instrument(skip(paths), fields(wanted = paths.len()), err)]
pub async fn list_info_files(
    cache_dir: &Path,
    paths: &[StorePath],
) -> Result<Vec<PathBuf>, Error> {
    let wanted: HashSet<&str> = paths.iter().filter_map(StorePath::hash_part).collect();

    let mut entries = match tokio::fs::read_dir(cache_dir).await {
        Ok(entries) => entries,
        // A target that never ran an instruction simply has nothing cached.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(Error::io(format!("listing {}", cache_dir.display()), e)),
    };

    let mut found = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::io(format!("listing {}", cache_dir.display()), e))?
    {
        let path = entry.path();
        if !path.extension().is_some_and(|e| e == "narinfo") {
            continue;
        }
        let matches = path
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|stem| wanted.contains(stem));
        if matches {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Copy info files into the cache by basename, overwriting duplicates.
#[instrument(skip(files), fields(files = files.len()), err)]
pub async fn import_info_files(cache_dir: &Path, files: &[PathBuf]) -> Result<(), Error> {
    tokio::fs::create_dir_all(cache_dir)
        .await
        .map_err(|e| Error::io(format!("creating {}", cache_dir.display()), e))?;

    for file in files {
        let name = file
            .file_name()
            .ok_or_else(|| Error::io(
                format!("importing {} into cache", file.display()),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"),
            ))?;
        tokio::fs::copy(file, cache_dir.join(name))
            .await
            .map_err(|e| Error::io(format!("importing {} into cache", file.display()), e))?;
    }
    debug!(count = files.len(), "info files cached");
    Ok(())
}

/// Advisory lock over the cache directory, held for the duration of one
/// execute run. Concurrent runs on the same target would race the cache
/// append; the second run fails fast instead.
#[derive(Debug)]
pub struct CacheLock {
    path: PathBuf,
}

impl CacheLock {
    pub fn acquire(cache_dir: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(cache_dir)
            .map_err(|e| Error::io(format!("creating {}", cache_dir.display()), e))?;

        let path = cache_dir.join(LOCK_FILE);
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::CacheLocked(path))
            }
            Err(e) => return Err(Error::io(format!("locking {}", path.display()), e)),
        };
        // Who holds it, for the operator staring at a stale lock.
        let _ = writeln!(file, "{}", std::process::id());

        Ok(CacheLock { path })
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store_path(tag: char) -> StorePath {
        StorePath::new(format!("/nix/store/{}-pkg", String::from(tag).repeat(32)))
    }

    fn hash(tag: char) -> String {
        String::from(tag).repeat(32)
    }

    #[tokio::test]
    async fn lists_only_matching_info_files() {
        let cache = tempfile::tempdir().unwrap();
        std::fs::write(cache.path().join(format!("{}.narinfo", hash('a'))), "a").unwrap();
        std::fs::write(cache.path().join(format!("{}.narinfo", hash('b'))), "b").unwrap();
        std::fs::write(cache.path().join("unrelated.txt"), "x").unwrap();

        let found = list_info_files(cache.path(), &[store_path('a')])
            .await
            .unwrap();
        assert_eq!(
            found,
            vec![cache.path().join(format!("{}.narinfo", hash('a')))]
        );
    }

    #[tokio::test]
    async fn absent_cache_directory_lists_empty() {
        let found = list_info_files(Path::new("/nonexistent/freight-cache"), &[store_path('a')])
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn import_overwrites_duplicates() {
        let cache = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let name = format!("{}.narinfo", hash('a'));
        std::fs::write(cache.path().join(&name), "old").unwrap();
        std::fs::write(staging.path().join(&name), "new").unwrap();

        import_info_files(cache.path(), &[staging.path().join(&name)])
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(cache.path().join(&name)).unwrap(),
            "new"
        );
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let cache = tempfile::tempdir().unwrap();

        let lock = CacheLock::acquire(cache.path()).unwrap();
        assert!(matches!(
            CacheLock::acquire(cache.path()),
            Err(Error::CacheLocked(_))
        ));

        drop(lock);
        CacheLock::acquire(cache.path()).unwrap();
    }
}

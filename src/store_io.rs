//! Typed interface over the external store toolchain.
//!
//! This is the only module that shells out to the store tools; everything
//! above it goes through [StoreToolchain], so the pipelines can be exercised
//! against an in-memory store in tests. Each operation either succeeds with a
//! typed value or fails with a structured error carrying the external
//! command's name, exit status and captured stderr.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{info, instrument};

use crate::errors::Error;
use crate::exec::{excerpt, parse_stdout, run_tool};
use crate::instruction::SwitchMode;
use crate::path_info::PathInfo;
use crate::store_path::StorePath;

/// Result of building one host configuration at one revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToplevelBuild {
    /// The derivation realized for the build.
    pub derivation: StorePath,
    /// The `out` output: the toplevel store path of the system.
    pub output: StorePath,
    /// Full 40-char hex commit id the configuration was built from.
    pub revision: String,
}

/// Capability interface over the store toolchain.
///
/// `store_dir` arguments name the root of the store operated on: a scratch
/// directory on the build host, `/` (or an alternative root) on the target.
#[async_trait]
pub trait StoreToolchain: Send + Sync {
    /// Resolve a flake reference (branch, tag, or nothing for the default
    /// branch) to a full 40-char hex commit id.
    async fn resolve_revision(
        &self,
        flake_uri: &str,
        reference: Option<&str>,
    ) -> Result<String, Error>;

    /// The hostnames the flake declares configurations for, at a revision.
    async fn configured_hosts(&self, flake_uri: &str, revision: &str) -> Result<Vec<String>, Error>;

    /// Build the toplevel system output of one host configuration into
    /// `store_dir`. Fails with [Error::UnknownHostname] before any build work
    /// when the flake does not declare `hostname`.
    async fn build_toplevel(
        &self,
        flake_uri: &str,
        revision: &str,
        hostname: &str,
        store_dir: &Path,
    ) -> Result<ToplevelBuild, Error>;

    /// Path info records covering the union of the closures of `roots`.
    async fn query_path_info(
        &self,
        store_dir: &Path,
        roots: &[StorePath],
    ) -> Result<Vec<PathInfo>, Error>;

    /// Copy the closure of `root` out of `store_dir` into a file:// style
    /// archive directory (data objects plus info files).
    async fn export_to_archive(
        &self,
        store_dir: &Path,
        archive_dir: &Path,
        root: &StorePath,
    ) -> Result<(), Error>;

    /// Copy the closure of `root` from an archive directory into the store
    /// rooted at `target_store`. The store tool verifies content hashes.
    async fn import_from_archive(
        &self,
        archive_dir: &Path,
        root: &StorePath,
        target_store: &Path,
    ) -> Result<(), Error>;

    /// Record `toplevel` as a new system generation under `target_store` and
    /// activate it now ([SwitchMode::Immediate]) or on the next boot.
    async fn activate_generation(
        &self,
        target_store: &Path,
        toplevel: &StorePath,
        mode: SwitchMode,
    ) -> Result<(), Error>;

    /// Human-readable listing of the system generations under `target_store`.
    async fn list_generations(&self, target_store: &Path) -> Result<String, Error>;
}

/// The production toolchain: `nix`, `nix-env` and the toplevel's own
/// `switch-to-configuration`, all expected on PATH.
#[derive(Clone, Debug, Default)]
pub struct NixCli {}

/// Profile path for system generations, relative to a store root.
const SYSTEM_PROFILE: &str = "nix/var/nix/profiles/system";

fn flake_ref(flake_uri: &str, param: &str, value: &str) -> String {
    // `?` only once; a flake URI that already carries params gets appended to.
    if flake_uri.contains('?') {
        format!("{flake_uri}&{param}={value}")
    } else {
        format!("{flake_uri}?{param}={value}")
    }
}

#[derive(Deserialize)]
struct FlakeMetadata {
    revision: Option<String>,
}

#[derive(Deserialize)]
struct BuildResult {
    #[serde(rename = "drvPath")]
    drv_path: String,
    outputs: BTreeMap<String, String>,
}

#[async_trait]
impl StoreToolchain for NixCli {
    #[instrument(skip(self), err)]
    async fn resolve_revision(
        &self,
        flake_uri: &str,
        reference: Option<&str>,
    ) -> Result<String, Error> {
        const OP: &str = "nix flake metadata";

        let uri = match reference {
            Some(r) => flake_ref(flake_uri, "ref", r),
            None => flake_uri.to_string(),
        };
        let stdout = run_tool(
            OP,
            Command::new("nix")
                .args(["flake", "metadata", "--json"])
                .arg(&uri),
        )
        .await?;

        let metadata: FlakeMetadata = parse_stdout(OP, &stdout)?;
        match metadata.revision {
            Some(rev) if rev.len() == 40 && rev.bytes().all(|b| b.is_ascii_hexdigit()) => Ok(rev),
            // A dirty working tree has no revision; we refuse to build that.
            _ => Err(Error::ExternalOutputMalformed {
                op: OP,
                raw: excerpt(&stdout),
            }),
        }
    }

    #[instrument(skip(self), err)]
    async fn configured_hosts(&self, flake_uri: &str, revision: &str) -> Result<Vec<String>, Error> {
        const OP: &str = "nix flake show";

        let uri = flake_ref(flake_uri, "rev", revision);
        let stdout = run_tool(
            OP,
            Command::new("nix").args(["flake", "show", "--json"]).arg(&uri),
        )
        .await?;

        let outputs: serde_json::Value = parse_stdout(OP, &stdout)?;
        Ok(outputs
            .get("nixosConfigurations")
            .and_then(|v| v.as_object())
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    #[instrument(skip(self), err)]
    async fn build_toplevel(
        &self,
        flake_uri: &str,
        revision: &str,
        hostname: &str,
        store_dir: &Path,
    ) -> Result<ToplevelBuild, Error> {
        const OP: &str = "nix build";

        let available = self.configured_hosts(flake_uri, revision).await?;
        if !available.iter().any(|h| h == hostname) {
            return Err(Error::UnknownHostname {
                requested: hostname.to_string(),
                available,
            });
        }

        let installable = format!(
            "{}#nixosConfigurations.{}.config.system.build.toplevel",
            flake_ref(flake_uri, "rev", revision),
            hostname
        );
        info!(%installable, "building toplevel");

        let stdout = run_tool(
            OP,
            Command::new("nix")
                .args(["build", "--json", "--no-link", "--store"])
                .arg(store_dir)
                .arg(&installable),
        )
        .await?;

        let mut results: Vec<BuildResult> = parse_stdout(OP, &stdout)?;
        let result = match results.len() {
            1 => results.remove(0),
            _ => {
                return Err(Error::ExternalOutputMalformed {
                    op: OP,
                    raw: excerpt(&stdout),
                })
            }
        };
        let out = result
            .outputs
            .get("out")
            .ok_or_else(|| Error::ExternalOutputMalformed {
                op: OP,
                raw: excerpt(&stdout),
            })?;

        Ok(ToplevelBuild {
            derivation: StorePath::new(&result.drv_path),
            output: StorePath::new(out),
            revision: revision.to_string(),
        })
    }

    #[instrument(skip(self, roots), err)]
    async fn query_path_info(
        &self,
        store_dir: &Path,
        roots: &[StorePath],
    ) -> Result<Vec<PathInfo>, Error> {
        const OP: &str = "nix path-info";

        if roots.is_empty() {
            return Ok(vec![]);
        }

        let stdout = run_tool(
            OP,
            Command::new("nix")
                .args(["path-info", "--json", "--recursive", "--store"])
                .arg(store_dir)
                .args(roots.iter().map(StorePath::as_str)),
        )
        .await?;

        parse_stdout(OP, &stdout)
    }

    #[instrument(skip(self), err)]
    async fn export_to_archive(
        &self,
        store_dir: &Path,
        archive_dir: &Path,
        root: &StorePath,
    ) -> Result<(), Error> {
        const OP: &str = "nix copy (export)";

        run_tool(
            OP,
            Command::new("nix")
                .args(["copy", "--no-check-sigs", "--from"])
                .arg(store_dir)
                .arg("--to")
                .arg(format!("file://{}", archive_dir.display()))
                .arg(root.as_str()),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn import_from_archive(
        &self,
        archive_dir: &Path,
        root: &StorePath,
        target_store: &Path,
    ) -> Result<(), Error> {
        const OP: &str = "nix copy (import)";

        run_tool(
            OP,
            Command::new("nix")
                .args(["copy", "--no-check-sigs", "--from"])
                .arg(format!("file://{}", archive_dir.display()))
                .arg("--to")
                .arg(target_store)
                .arg(root.as_str()),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn activate_generation(
        &self,
        target_store: &Path,
        toplevel: &StorePath,
        mode: SwitchMode,
    ) -> Result<(), Error> {
        let profile = target_store.join(SYSTEM_PROFILE);

        run_tool(
            "nix-env --set",
            Command::new("nix-env")
                .arg("-p")
                .arg(&profile)
                .arg("--set")
                .arg(toplevel.as_str()),
        )
        .await?;

        let script = Path::new(toplevel.as_str()).join("bin/switch-to-configuration");
        run_tool(
            "switch-to-configuration",
            Command::new(script).arg(match mode {
                SwitchMode::Immediate => "switch",
                SwitchMode::NextReboot => "boot",
            }),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_generations(&self, target_store: &Path) -> Result<String, Error> {
        let stdout = run_tool(
            "nix-env --list-generations",
            Command::new("nix-env")
                .arg("-p")
                .arg(target_store.join(SYSTEM_PROFILE))
                .arg("--list-generations"),
        )
        .await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flake_ref_appends_params() {
        assert_eq!(
            flake_ref("git+file:///repo", "rev", "abc"),
            "git+file:///repo?rev=abc"
        );
        assert_eq!(
            flake_ref("git+file:///repo?shallow=1", "rev", "abc"),
            "git+file:///repo?shallow=1&rev=abc"
        );
    }
}

//! The load command: at build time, work out the delta between the new
//! system and what the target already holds, and subset the working archive
//! down to it; at execute time, re-assemble a complete archive and import it.

use std::collections::HashSet;

use tracing::{info, instrument};

use super::{root_paths, BuildContext, Command, ExecuteContext, StoreRoot};
use crate::archive;
use crate::cache;
use crate::delta::compute_delta;
use crate::errors::Error;
use crate::store_io::StoreToolchain;
use crate::store_path::StorePath;

/// Build-time inputs of one load command. Bridged into the serialized
/// [Command::Load] by [LoadPlan::build]; nothing here travels with the
/// instruction.
#[derive(Clone, Debug)]
pub struct LoadPlan {
    pub flake_uri: String,
    pub hostname: String,
    /// Revision to deliver.
    pub new_rev: String,
    /// Revisions whose closures the target is assumed to hold.
    pub delta_dep_revs: Vec<String>,
    /// Name of the archive subdirectory inside the instruction.
    pub archive_folder_name: String,
    /// Ship info files only for added paths.
    pub partial_narinfos: bool,
}

impl LoadPlan {
    #[instrument(skip_all, fields(new_rev = %self.new_rev, deps = self.delta_dep_revs.len()), err)]
    pub async fn build<S: StoreToolchain>(
        &self,
        ctx: &BuildContext<'_, S>,
    ) -> Result<Command, Error> {
        // What the target is assumed to hold: every dependency revision gets
        // built so its closure is known.
        let mut dep_roots = Vec::with_capacity(self.delta_dep_revs.len());
        for rev in &self.delta_dep_revs {
            let built = ctx
                .toolchain
                .build_toplevel(&self.flake_uri, rev, &self.hostname, &ctx.store_dir)
                .await?;
            dep_roots.push(StoreRoot {
                nix_path: built.output,
                git_revision: built.revision,
            });
        }

        let built = ctx
            .toolchain
            .build_toplevel(&self.flake_uri, &self.new_rev, &self.hostname, &ctx.store_dir)
            .await?;
        let item = StoreRoot {
            nix_path: built.output,
            git_revision: built.revision,
        };

        ctx.toolchain
            .export_to_archive(&ctx.store_dir, &ctx.archive_dir, &item.nix_path)
            .await?;

        let from_closure = ctx
            .toolchain
            .query_path_info(&ctx.store_dir, &root_paths(&dep_roots))
            .await?;
        let to_closure = ctx
            .toolchain
            .query_path_info(&ctx.store_dir, std::slice::from_ref(&item.nix_path))
            .await?;

        let from_paths: HashSet<StorePath> =
            from_closure.into_iter().map(|info| info.path).collect();
        let delta = compute_delta(to_closure, &from_paths)?;
        info!(
            added = delta.added.len(),
            total = delta.all_resulting_items.len(),
            "computed delta"
        );

        // Stale leftovers under the archive folder are cleared by the
        // subsetter before it writes.
        let info_paths = if self.partial_narinfos {
            delta.added_paths()
        } else {
            delta.all_paths()
        };
        archive::make_archive_subset(
            &ctx.archive_dir,
            &ctx.instruction_dir.join(&self.archive_folder_name),
            &info_paths,
            &delta.added_paths(),
        )
        .await?;

        Ok(Command::Load {
            archive_path: self.archive_folder_name.clone(),
            item,
            delta_dependencies: dep_roots,
            partial_narinfos: self.partial_narinfos,
        })
    }
}

/// Import a load command's archive into the target store.
///
/// The archive is first enriched with the info files for every path reachable
/// from the delta dependencies, pulled from the target store and the client
/// state cache; only then does the store tool get to import. The cache is
/// appended from the pre-enrichment snapshot, so it keeps recording what the
/// instruction itself contributed rather than what was merged back in.
#[instrument(skip_all, fields(archive = %archive_path, item = %item.nix_path), err)]
pub(super) async fn execute_load<S: StoreToolchain>(
    ctx: &ExecuteContext<'_, S>,
    archive_path: &str,
    item: &StoreRoot,
    delta_dependencies: &[StoreRoot],
    partial_narinfos: bool,
) -> Result<(), Error> {
    let absolute_archive = ctx.instruction_dir.join(archive_path);

    let shipped_infos = archive::list_info_files(&absolute_archive).await?;

    // Enrich: collect the dependency closures from the target store, then
    // find their info files in the client state cache.
    let dep_paths: Vec<StorePath> = if delta_dependencies.is_empty() {
        vec![]
    } else {
        ctx.toolchain
            .query_path_info(&ctx.target_store, &root_paths(delta_dependencies))
            .await?
            .into_iter()
            .map(|info| info.path)
            .collect()
    };

    let cached = cache::list_info_files(&ctx.client_state_dir, &dep_paths).await?;

    let mut known: HashSet<String> = HashSet::new();
    for file in shipped_infos.iter().chain(cached.iter()) {
        if let Some(stem) = file.file_stem().and_then(|s| s.to_str()) {
            known.insert(stem.to_string());
        }
    }
    if partial_narinfos {
        for path in &dep_paths {
            let covered = path.hash_part().is_some_and(|h| known.contains(h));
            if !covered {
                return Err(Error::MissingDependencyMetadata(path.clone()));
            }
        }
    }

    for file in &cached {
        let name = file.file_name().expect("cache entries are plain files");
        tokio::fs::copy(file, absolute_archive.join(name))
            .await
            .map_err(|e| Error::io(format!("enriching archive with {}", file.display()), e))?;
    }

    ctx.toolchain
        .import_from_archive(&absolute_archive, &item.nix_path, &ctx.target_store)
        .await
        .map_err(|cause| Error::ImportFailed {
            path: item.nix_path.clone(),
            cause: Box::new(cause),
        })?;

    // Pre-enrichment snapshot only.
    cache::import_info_files(&ctx.client_state_dir, &shipped_infos).await?;

    info!(item = %item.nix_path, "load complete");
    Ok(())
}

//! The build pipeline: revisions in, compressed instruction file out.

use std::path::Path;

use tracing::{info, instrument};

use super::{BuildContext, Instruction, LoadPlan, SwitchPlan, SwitchMode, INSTRUCTION_FILE};
use crate::errors::Error;
use crate::pack;
use crate::store_io::StoreToolchain;

/// Conventional name of the single archive subdirectory the builder emits.
pub const ARCHIVE_FOLDER: &str = "archive";

/// What to build an instruction from.
#[derive(Clone, Debug)]
pub struct BuildRequest {
    pub flake_uri: String,
    pub hostname: String,
    /// Revisions (or refs) already installed on the target, oldest first.
    pub past_revs: Vec<String>,
    /// Revision (or ref) to deliver.
    pub new_rev: String,
    pub mode: SwitchMode,
    /// Ship info files for the whole closure even when past revisions exist.
    pub full_narinfos: bool,
}

/// Build an instruction directory under `workdir`, without compressing it.
///
/// `workdir` gains three subdirectories: a scratch store, a working archive
/// holding the full exported closure, and `instruction/` — the directory that
/// becomes the shipped file. Returns the instruction that was written.
#[instrument(skip(toolchain, request), fields(new_rev = %request.new_rev), err)]
pub async fn build_instruction_dir<S: StoreToolchain>(
    toolchain: &S,
    request: &BuildRequest,
    workdir: &Path,
) -> Result<Instruction, Error> {
    let ctx = BuildContext {
        toolchain,
        store_dir: workdir.join("store"),
        archive_dir: workdir.join("archive"),
        instruction_dir: workdir.join("instruction"),
    };
    for dir in [&ctx.store_dir, &ctx.archive_dir, &ctx.instruction_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::io(format!("creating {}", dir.display()), e))?;
    }

    // Pin every given rev or ref to a full commit id up front, so the
    // instruction names exactly what was built.
    let new_rev = toolchain
        .resolve_revision(&request.flake_uri, Some(&request.new_rev))
        .await?;
    let mut past_revs = Vec::with_capacity(request.past_revs.len());
    for rev in &request.past_revs {
        past_revs.push(
            toolchain
                .resolve_revision(&request.flake_uri, Some(rev))
                .await?,
        );
    }

    let load = LoadPlan {
        flake_uri: request.flake_uri.clone(),
        hostname: request.hostname.clone(),
        new_rev: new_rev.clone(),
        delta_dep_revs: past_revs,
        archive_folder_name: ARCHIVE_FOLDER.to_string(),
        partial_narinfos: !request.full_narinfos && !request.past_revs.is_empty(),
    };
    let switch = SwitchPlan {
        flake_uri: request.flake_uri.clone(),
        hostname: request.hostname.clone(),
        new_rev,
        mode: request.mode,
    };

    let instruction = Instruction::new(vec![load.build(&ctx).await?, switch.build(&ctx).await?]);

    let file = ctx.instruction_dir.join(INSTRUCTION_FILE);
    tokio::fs::write(&file, instruction.to_json())
        .await
        .map_err(|e| Error::io(format!("writing {}", file.display()), e))?;

    Ok(instruction)
}

/// The whole build pipeline: build into a temporary workdir, compress the
/// instruction directory into `out`, clean up.
#[instrument(skip(toolchain, request), fields(host = %request.hostname), err)]
pub async fn build_instruction<S: StoreToolchain>(
    toolchain: &S,
    request: &BuildRequest,
    out: &Path,
) -> Result<Instruction, Error> {
    let workdir =
        tempfile::tempdir().map_err(|e| Error::io("creating build workdir".to_string(), e))?;

    let instruction = build_instruction_dir(toolchain, request, workdir.path()).await?;
    pack::compress(&workdir.path().join("instruction"), out).await?;

    info!(out = %out.display(), "instruction written");
    Ok(instruction)
}

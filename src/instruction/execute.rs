//! The execute pipeline: validate an instruction, run its commands in order
//! against the target store, finalize the client metadata cache.

use std::path::Path;

use tracing::{info, instrument, warn};

use super::{assert_instruction_dir_valid, ExecuteContext, Instruction};
use crate::cache::CacheLock;
use crate::errors::Error;
use crate::pack;
use crate::store_io::StoreToolchain;

/// Run a decompressed, on-disk instruction directory.
///
/// Commands run in declared order and the first failure aborts the run; the
/// client state cache stays locked throughout, so a concurrent run on the
/// same target fails fast instead of interleaving.
#[instrument(skip(toolchain), err)]
pub async fn execute_instruction_dir<S: StoreToolchain>(
    toolchain: &S,
    instruction_dir: &Path,
    target_store: &Path,
    client_state_dir: &Path,
) -> Result<Instruction, Error> {
    let instruction = assert_instruction_dir_valid(instruction_dir).await?;

    let _lock = CacheLock::acquire(client_state_dir)?;

    let ctx = ExecuteContext {
        toolchain,
        target_store: target_store.to_path_buf(),
        client_state_dir: client_state_dir.to_path_buf(),
        instruction_dir: instruction_dir.to_path_buf(),
    };

    for command in &instruction.commands {
        command.execute(&ctx).await?;
    }

    Ok(instruction)
}

/// The whole execute pipeline: decompress the instruction file into a
/// temporary workdir, validate and run it. The workdir is removed on success
/// and kept for diagnosis on failure.
#[instrument(skip(toolchain), err)]
pub async fn execute_instruction<S: StoreToolchain>(
    toolchain: &S,
    instruction_file: &Path,
    target_store: &Path,
    client_state_dir: &Path,
    workdir_base: Option<&Path>,
) -> Result<Instruction, Error> {
    let workdir = match workdir_base {
        Some(base) => tempfile::tempdir_in(base),
        None => tempfile::tempdir(),
    }
    .map_err(|e| Error::io("creating execute workdir".to_string(), e))?;

    pack::decompress(instruction_file, workdir.path()).await?;

    match execute_instruction_dir(toolchain, workdir.path(), target_store, client_state_dir).await
    {
        Ok(instruction) => {
            info!("instruction applied");
            Ok(instruction)
        }
        Err(e) => {
            let kept = workdir.keep();
            warn!(workdir = %kept.display(), "instruction failed, workdir kept");
            Err(e)
        }
    }
}

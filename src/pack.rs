//! Collapses an instruction directory into one transportable file and back.
//!
//! The file format is an xz-compressed tar of the instruction directory's
//! contents. Compression itself stays external: `tar` is invoked through the
//! same subprocess contract as the store toolchain.

use std::path::Path;

use tokio::process::Command;
use tracing::instrument;

use crate::errors::Error;
use crate::exec::run_tool;

/// Pack the contents of `dir` into the single file `dest`.
#[instrument(err)]
pub async fn compress(dir: &Path, dest: &Path) -> Result<(), Error> {
    run_tool(
        "tar (compress)",
        Command::new("tar")
            .arg("-cJf")
            .arg(dest)
            .arg("-C")
            .arg(dir)
            .arg("."),
    )
    .await?;
    Ok(())
}

/// Unpack the instruction file `file` into the existing directory `dir`.
#[instrument(err)]
pub async fn decompress(file: &Path, dir: &Path) -> Result<(), Error> {
    run_tool(
        "tar (decompress)",
        Command::new("tar").arg("-xJf").arg(file).arg("-C").arg(dir),
    )
    .await?;
    Ok(())
}

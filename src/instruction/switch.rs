//! The switch command: activate a toplevel that a prior load (or the target
//! itself) already made present.

use std::path::Path;

use tracing::{info, instrument};

use super::{BuildContext, Command, ExecuteContext, StoreRoot, SwitchMode};
use crate::errors::Error;
use crate::store_io::StoreToolchain;

/// Build-time inputs of the switch command.
#[derive(Clone, Debug)]
pub struct SwitchPlan {
    pub flake_uri: String,
    pub hostname: String,
    pub new_rev: String,
    pub mode: SwitchMode,
}

impl SwitchPlan {
    #[instrument(skip_all, fields(new_rev = %self.new_rev), err)]
    pub async fn build<S: StoreToolchain>(
        &self,
        ctx: &BuildContext<'_, S>,
    ) -> Result<Command, Error> {
        let built = ctx
            .toolchain
            .build_toplevel(&self.flake_uri, &self.new_rev, &self.hostname, &ctx.store_dir)
            .await?;

        Ok(Command::Switch {
            item: StoreRoot {
                nix_path: built.output,
                git_revision: built.revision,
            },
            mode: self.mode,
        })
    }
}

#[instrument(skip_all, fields(item = %item.nix_path, mode = ?mode), err)]
pub(super) async fn execute_switch<S: StoreToolchain>(
    ctx: &ExecuteContext<'_, S>,
    item: &StoreRoot,
    mode: SwitchMode,
) -> Result<(), Error> {
    // Generations live under the root filesystem, whatever store the import
    // targeted.
    ctx.toolchain
        .activate_generation(Path::new("/"), &item.nix_path, mode)
        .await
        .map_err(|cause| Error::ActivationFailed {
            path: item.nix_path.clone(),
            cause: Box::new(cause),
        })?;

    info!(item = %item.nix_path, "generation activated");
    Ok(())
}

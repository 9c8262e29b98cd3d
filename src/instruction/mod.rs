//! The instruction data model: an ordered list of commands plus the archive
//! payloads they reference, laid out as a directory and serialized to
//! `instruction.json`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::Error;
use crate::store_path::StorePath;
use crate::store_io::StoreToolchain;

pub mod build;
pub mod execute;
mod load;
mod switch;

pub use load::LoadPlan;
pub use switch::SwitchPlan;

pub const INSTRUCTION_FILE: &str = "instruction.json";

/// The only instruction kind there is, for now.
pub const INSTRUCTION_KIND: &str = "switch";

/// The toplevel system output built from one revision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreRoot {
    pub nix_path: StorePath,
    /// Full 40-char hex commit id of the configuration revision.
    pub git_revision: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SwitchMode {
    /// Activate the generation right away.
    Immediate,
    /// Create the generation and make it the boot default only.
    NextReboot,
}

/// One unit of work inside an instruction. The `kind` discriminator is
/// authoritative; an unrecognized one fails validation as
/// [Error::UnknownCommandKind].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Command {
    /// Import a delta archive into the target store.
    #[serde(rename_all = "camelCase")]
    Load {
        /// Name of the archive subdirectory, a single path segment unique
        /// within the instruction.
        archive_path: String,
        /// The store root the archive delivers.
        item: StoreRoot,
        /// Previously-installed roots whose closures the target is assumed
        /// to hold already.
        delta_dependencies: Vec<StoreRoot>,
        /// Whether the archive ships info files only for added paths,
        /// relying on the target's cache for the rest.
        partial_narinfos: bool,
    },

    /// Activate an already-present store path as a system generation.
    Switch { item: StoreRoot, mode: SwitchMode },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub kind: String,
    pub commands: Vec<Command>,
}

/// Shared state of one build run.
pub struct BuildContext<'a, S> {
    pub toolchain: &'a S,
    /// Scratch store the toolchain builds into.
    pub store_dir: PathBuf,
    /// Working archive the full closure is exported into before subsetting.
    pub archive_dir: PathBuf,
    /// Root of the directory that ends up compressed and shipped.
    pub instruction_dir: PathBuf,
}

/// Shared state of one execute run.
pub struct ExecuteContext<'a, S> {
    pub toolchain: &'a S,
    /// Root of the store being written to; `/` on a real target.
    pub target_store: PathBuf,
    /// The client metadata cache directory.
    pub client_state_dir: PathBuf,
    /// The decompressed instruction directory.
    pub instruction_dir: PathBuf,
}

impl Instruction {
    pub fn new(commands: Vec<Command>) -> Self {
        Instruction {
            kind: INSTRUCTION_KIND.to_string(),
            commands,
        }
    }

    pub fn to_json(&self) -> String {
        let mut out = serde_json::to_string_pretty(self).expect("instruction serializes");
        out.push('\n');
        out
    }

    /// Parse `instruction.json`, routing unknown command kinds to their own
    /// error so a newer builder's instruction fails legibly on an older
    /// executor.
    pub fn from_json(text: &str) -> Result<Self, Error> {
        #[derive(Deserialize)]
        struct Raw {
            kind: String,
            commands: Vec<serde_json::Value>,
        }

        let raw: Raw = serde_json::from_str(text).map_err(|e| Error::InvalidInstruction {
            reason: format!("unparseable instruction.json: {e}"),
        })?;

        let mut commands = Vec::with_capacity(raw.commands.len());
        for value in raw.commands {
            let kind = value
                .get("kind")
                .and_then(|k| k.as_str())
                .map(str::to_string)
                .ok_or_else(|| Error::InvalidInstruction {
                    reason: "command without a kind field".to_string(),
                })?;
            match kind.as_str() {
                "load" | "switch" => {
                    commands.push(serde_json::from_value(value).map_err(|e| {
                        Error::InvalidInstruction {
                            reason: format!("malformed {kind} command: {e}"),
                        }
                    })?)
                }
                _ => return Err(Error::UnknownCommandKind(kind)),
            }
        }

        Ok(Instruction {
            kind: raw.kind,
            commands,
        })
    }

    /// Structural checks beyond the serde shape. `instruction_dir` is the
    /// directory the instruction was unpacked into.
    pub fn validate(&self, instruction_dir: &Path) -> Result<(), Error> {
        fn invalid(reason: impl Into<String>) -> Error {
            Error::InvalidInstruction {
                reason: reason.into(),
            }
        }

        if self.kind != INSTRUCTION_KIND {
            return Err(invalid(format!("unknown instruction kind {:?}", self.kind)));
        }

        let mut seen_archives = HashSet::new();
        for (i, command) in self.commands.iter().enumerate() {
            match command {
                Command::Load { archive_path, .. } => {
                    if archive_path.is_empty()
                        || archive_path == "."
                        || archive_path == ".."
                        || archive_path.contains(['/', '\\'])
                    {
                        return Err(invalid(format!(
                            "archive path {archive_path:?} is not a single path segment"
                        )));
                    }
                    if !seen_archives.insert(archive_path.clone()) {
                        return Err(invalid(format!("duplicate archive path {archive_path:?}")));
                    }
                    if !instruction_dir.join(archive_path).is_dir() {
                        return Err(invalid(format!(
                            "archive directory {archive_path:?} is missing"
                        )));
                    }
                }
                Command::Switch { .. } => {
                    if i != self.commands.len() - 1 {
                        return Err(invalid("switch must be last"));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Read and fully validate an instruction directory.
pub async fn assert_instruction_dir_valid(instruction_dir: &Path) -> Result<Instruction, Error> {
    let file = instruction_dir.join(INSTRUCTION_FILE);
    let text = match tokio::fs::read_to_string(&file).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::InvalidInstruction {
                reason: format!("{INSTRUCTION_FILE} is missing"),
            })
        }
        Err(e) => return Err(Error::io(format!("reading {}", file.display()), e)),
    };

    let instruction = Instruction::from_json(&text)?;
    instruction.validate(instruction_dir)?;
    Ok(instruction)
}

impl Command {
    /// Run one command against the target. Effects of a command are fully
    /// visible before the next one starts.
    pub async fn execute<S: StoreToolchain>(
        &self,
        ctx: &ExecuteContext<'_, S>,
    ) -> Result<(), Error> {
        match self {
            Command::Load {
                archive_path,
                item,
                delta_dependencies,
                partial_narinfos,
            } => {
                load::execute_load(ctx, archive_path, item, delta_dependencies, *partial_narinfos)
                    .await
            }
            Command::Switch { item, mode } => switch::execute_switch(ctx, item, *mode).await,
        }
    }
}

/// Paths of a set of store roots.
pub(crate) fn root_paths(roots: &[StoreRoot]) -> Vec<StorePath> {
    roots.iter().map(|r| r.nix_path.clone()).collect()
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use nix_freight::errors::Error;
use nix_freight::instruction::build::{build_instruction, BuildRequest};
use nix_freight::instruction::execute::execute_instruction;
use nix_freight::instruction::{assert_instruction_dir_valid, Command, SwitchMode};
use nix_freight::pack;
use nix_freight::store_io::{NixCli, StoreToolchain};

/// Build and apply portable system-update instructions for offline NixOS
/// hosts.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// A global log level to use when printing logs.
    /// It's also possible to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which will always have
    /// priority.
    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Builds an instruction file carrying a target host from a set of past
    /// revisions to a new one.
    BuildInstruction {
        /// Flake URI of the system-configuration repository.
        flake_uri: String,

        /// Hostname whose configuration to build.
        hostname: String,

        /// Revision (or ref) to deliver.
        #[arg(long)]
        new_rev: String,

        /// Revision (or ref) assumed already installed on the target; may be
        /// given more than once. With none, the instruction carries the full
        /// closure.
        #[arg(long = "past-rev")]
        past_revs: Vec<String>,

        /// Where to write the instruction file.
        #[arg(long)]
        out: PathBuf,

        /// Whether to switch the target immediately or on its next boot.
        #[arg(long, value_enum, default_value = "immediate")]
        mode: ModeArg,

        /// Ship metadata for the whole closure even when past revisions are
        /// given.
        #[arg(long)]
        full: bool,
    },

    /// Applies an instruction file to this host.
    ApplyInstruction {
        /// The instruction file to apply.
        #[arg(long)]
        instruction: PathBuf,

        /// Root of the store to import into.
        #[arg(long, default_value = "/")]
        store: PathBuf,

        /// Directory remembering the metadata this host has received.
        #[arg(long, env = "NIX_FREIGHT_CLIENT_STATE", default_value = "/var/lib/nix-freight/state")]
        client_state: PathBuf,

        /// Where to unpack the instruction; defaults to the system temp dir.
        #[arg(long)]
        workdir: Option<PathBuf>,
    },

    /// Unpacks and validates an instruction file, printing its contents.
    InspectInstruction {
        /// The instruction file to inspect.
        #[arg(long)]
        instruction: PathBuf,
    },

    /// Lists the system generations on this host.
    ListGenerations {
        /// Root of the store to inspect.
        #[arg(long, default_value = "/")]
        store: PathBuf,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ModeArg {
    Immediate,
    NextReboot,
}

fn short_rev(rev: &str) -> &str {
    rev.get(..12).unwrap_or(rev)
}

impl From<ModeArg> for SwitchMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Immediate => SwitchMode::Immediate,
            ModeArg::NextReboot => SwitchMode::NextReboot,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::Layer::new()
                .with_writer(std::io::stderr)
                .compact()
                .with_filter(
                    EnvFilter::builder()
                        .with_default_directive(cli.log_level.into())
                        .from_env()
                        .expect("invalid RUST_LOG"),
                ),
        )
        .init();

    if let Err(e) = run(cli.command).await {
        eprintln!("nix-freight: {e}");
        let mut cause = std::error::Error::source(&e);
        while let Some(c) = cause {
            eprintln!("  caused by: {c}");
            cause = c.source();
        }
        std::process::exit(e.exit_code());
    }
}

async fn run(command: Commands) -> Result<(), Error> {
    let toolchain = NixCli::default();

    match command {
        Commands::BuildInstruction {
            flake_uri,
            hostname,
            new_rev,
            past_revs,
            out,
            mode,
            full,
        } => {
            let request = BuildRequest {
                flake_uri,
                hostname,
                past_revs,
                new_rev,
                mode: mode.into(),
                full_narinfos: full,
            };
            build_instruction(&toolchain, &request, &out).await?;
            println!("{}", out.display());
        }

        Commands::ApplyInstruction {
            instruction,
            store,
            client_state,
            workdir,
        } => {
            execute_instruction(
                &toolchain,
                &instruction,
                &store,
                &client_state,
                workdir.as_deref(),
            )
            .await?;
        }

        Commands::InspectInstruction { instruction } => {
            let workdir = tempfile::tempdir()
                .map_err(|e| Error::io("creating inspect workdir".to_string(), e))?;
            pack::decompress(&instruction, workdir.path()).await?;
            let parsed = assert_instruction_dir_valid(workdir.path()).await?;

            println!("kind: {}", parsed.kind);
            for command in &parsed.commands {
                match command {
                    Command::Load {
                        archive_path,
                        item,
                        delta_dependencies,
                        partial_narinfos,
                    } => {
                        println!(
                            "load {} ({} @ {}), {} dependencies, {} narinfos",
                            archive_path,
                            item.nix_path,
                            short_rev(&item.git_revision),
                            delta_dependencies.len(),
                            if *partial_narinfos { "partial" } else { "full" },
                        );
                        for dep in delta_dependencies {
                            println!(
                                "  depends on {} @ {}",
                                dep.nix_path,
                                short_rev(&dep.git_revision)
                            );
                        }
                    }
                    Command::Switch { item, mode } => {
                        println!(
                            "switch to {} ({})",
                            item.nix_path,
                            match mode {
                                SwitchMode::Immediate => "immediate",
                                SwitchMode::NextReboot => "next reboot",
                            }
                        );
                    }
                }
            }
        }

        Commands::ListGenerations { store } => {
            print!("{}", toolchain.list_generations(&store).await?);
        }
    }

    Ok(())
}

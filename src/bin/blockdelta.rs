//! Command-line wrapper around the `blockdelta` library: file/descriptor
//! acquisition and exit-code mapping are the CLI's job, not the core
//! codec's (spec §1, "out of scope: external collaborators").

use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use argh::FromArgs;
use blockdelta::{DiffError, PatchError, State};

#[derive(FromArgs)]
/// Generate or apply a block-checkpointing binary delta patch.
struct Args {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Generate(GenerateArgs),
    Apply(ApplyArgs),
}

#[derive(FromArgs)]
/// Produce a patch that transforms `old` into `new`.
#[argh(subcommand, name = "generate")]
struct GenerateArgs {
    #[argh(positional)]
    old: PathBuf,
    #[argh(positional)]
    new: PathBuf,
    #[argh(positional)]
    patch: PathBuf,
    /// block size in bytes for flush checkpointing (0 = one block for the whole file)
    #[argh(positional, default = "0")]
    blocksize: u32,
}

#[derive(FromArgs)]
/// Apply a patch to `old`, producing `new` (a file) or checkpointing into `new` (a directory).
#[argh(subcommand, name = "apply")]
struct ApplyArgs {
    #[argh(positional)]
    old: PathBuf,
    #[argh(positional)]
    new: PathBuf,
    #[argh(positional)]
    patch: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let args: Args = argh::from_env();
    let result = match args.command {
        Command::Generate(args) => run_generate(args).map_err(CliError::Diff),
        Command::Apply(args) => run_apply(args).map_err(CliError::Patch),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("blockdelta: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

enum CliError {
    Diff(DiffError),
    Patch(PatchError),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Diff(e) => write!(f, "{e}"),
            CliError::Patch(e) => write!(f, "{e}"),
        }
    }
}

impl CliError {
    /// Maps each error kind onto a small distinct nonzero exit code, in
    /// the taxonomy order of spec §7 (PATCH_IO, OLD_IO, NEW_IO, BAD_MAGIC,
    /// PATCH_SHORT, ALGO).
    fn exit_code(&self) -> u8 {
        match self {
            CliError::Diff(DiffError::Io(_)) => 1,
            CliError::Diff(DiffError::Internal(_)) => 6,
            CliError::Patch(PatchError::PatchIo(_)) => 1,
            CliError::Patch(PatchError::OldIo(_)) => 2,
            CliError::Patch(PatchError::NewIo(_)) => 3,
            CliError::Patch(PatchError::BadMagic) => 4,
            CliError::Patch(PatchError::PatchShort) => 5,
            CliError::Patch(PatchError::Internal(_)) => 6,
        }
    }
}

fn run_generate(args: GenerateArgs) -> Result<(), DiffError> {
    log::info!(
        "generating patch: {} -> {} (blocksize={})",
        args.old.display(),
        args.new.display(),
        args.blocksize
    );

    let mut old = Vec::new();
    File::open(&args.old)?.read_to_end(&mut old)?;
    let mut new = Vec::new();
    File::open(&args.new)?.read_to_end(&mut new)?;

    let mut patch = BufWriter::new(File::create(&args.patch)?);
    let mut last_logged = 0u64;
    blockdelta::generate(&old, &new, &mut patch, args.blocksize, |state| match state {
        State::Reading => log::debug!("reading inputs"),
        State::Sorting => log::debug!("sorting suffix array"),
        State::Working(pos) => {
            if pos.saturating_sub(last_logged) >= 1_000_000 {
                log::trace!("scanned {pos} bytes");
                last_logged = pos;
            }
        }
    })?;
    log::info!("wrote {}", args.patch.display());
    Ok(())
}

fn run_apply(args: ApplyArgs) -> Result<(), PatchError> {
    let mut old = File::options()
        .read(true)
        .write(true)
        .open(&args.old)
        .map_err(PatchError::OldIo)?;
    let mut patch = BufReader::new(File::open(&args.patch).map_err(PatchError::PatchIo)?);

    if args.new.is_dir() {
        log::info!(
            "applying {} to {} with checkpoints in {}",
            args.patch.display(),
            args.old.display(),
            args.new.display()
        );
        blockdelta::apply_directory(&mut old, &args.new, &mut patch)
    } else {
        log::info!(
            "applying {} to {} -> {}",
            args.patch.display(),
            args.old.display(),
            args.new.display()
        );
        let mut new = BufWriter::new(File::create(&args.new).map_err(PatchError::NewIo)?);
        blockdelta::apply(&mut old, &mut new, &mut patch)
    }
}

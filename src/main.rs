//! `upatch-manage` CLI entry point (§4.J, §6).

use clap::Parser;
use log::LevelFilter;
use upatch_manage::cli::{self, Cli, Command};
use upatch_manage::error::Error;
use upatch_manage::patch_ops::{self, PatchStatus};

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new().filter_level(level).parse_default_env().init();

    let result = match &cli.command {
        Command::Patch(args) => run_patch(args),
        Command::Unpatch(args) => run_unpatch(args),
        Command::Info(args) => run_info(args),
    };

    if let Err(err) = result {
        log::error!("{err}");
        std::process::exit(exit_code(&err));
    }
}

fn run_patch(args: &cli::PatchArgs) -> Result<(), Error> {
    cli::validate_uuid(&args.uuid).map_err(|msg| Error::MalformedElf { msg: msg.into() })?;
    patch_ops::patch(args.pid, &args.upatch, &args.binary, &args.uuid)
}

fn run_unpatch(args: &cli::UnpatchArgs) -> Result<(), Error> {
    cli::validate_uuid(&args.uuid).map_err(|msg| Error::MalformedElf { msg: msg.into() })?;
    patch_ops::unpatch(args.pid, &args.binary, &args.uuid)
}

fn run_info(args: &cli::InfoArgs) -> Result<(), Error> {
    cli::validate_uuid(&args.uuid).map_err(|msg| Error::MalformedElf { msg: msg.into() })?;
    let report = patch_ops::info(args.pid, &args.binary, &args.uuid)?;
    let status = match report.status {
        PatchStatus::Actived => "actived",
        PatchStatus::Removed => "removed",
    };
    println!(
        "uuid={} status={} changed_func_num={} functions=[{}]",
        report.uuid,
        status,
        report.changed_func_num,
        report.func_names.join(", ")
    );
    Ok(())
}

/// §6: exit code is the absolute value of the carried errno, or `1` for
/// non-errno failures.
fn exit_code(err: &Error) -> i32 {
    match err {
        Error::MemoryMap { errno, .. } => errno.unsigned_abs().min(255) as i32,
        _ => 1,
    }
}

//! skt - Sonic Kernel Testing
//!
//! Every invocation runs one stage of the kernel patch validation pipeline
//! and exits; the stages share their results through the `[state]` table
//! of the rc file (written with `--state`).
//!
//! ## Commands
//!
//! - `merge`: check out a base tree and apply patches
//! - `build`: build the merged tree into a kernel tarball
//! - `publish`: copy the tarball and config where a boot target can reach them
//! - `test`: boot the kernel under a watchdog
//! - `report`: render and deliver the results
//! - `cleanup`: forget the run
//! - `all`: merge, build, publish, test and report in one process
//!
//! Exit status: 0 success, 1 stage failure, 2 usage error, 3 infrastructure
//! error.

mod args;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use skt_core::error::{EXIT_INFRA, EXIT_SUCCESS};
use skt_core::obs::RunSpan;
use skt_core::{
    init_tracing, level_for_verbosity, publisher_from, reporter_from, AllStages, BootTestRunner,
    BuildRunner, CommandTarget, PatchResolver, PatchworkClient, RcFile, Session, SktError,
    StageReport,
};
use tracing::debug;

use args::{Cli, Commands};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs, level_for_verbosity(cli.verbose));

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("skt: failed to start the async runtime: {e}");
            return ExitCode::from(EXIT_INFRA as u8);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("skt: {err:#}");
            let code = err
                .downcast_ref::<SktError>()
                .map(SktError::exit_code)
                .unwrap_or(EXIT_INFRA);
            ExitCode::from(code as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let rc_path = args::rc_path(&cli);
    let rc = RcFile::load(&rc_path)?;
    let mut session = Session::open(&rc_path, cli.state)?;

    let run_id = session
        .run_id()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "new".to_string());
    let _span = RunSpan::enter(&run_id, command_name(&cli.command));
    debug!(rc = %rc_path.display(), "loaded rc file");

    match &cli.command {
        Commands::Merge(merge) => {
            let request = args::merge_request(merge, &rc.config)?;
            let workdir = workdir(&cli, &rc)?;
            let client = PatchworkClient::new(args::http_timeout(&rc.config))?;
            let resolver = PatchResolver::new(&client, args::fetch_retry(&rc.config));
            let report = session.merge(&resolver, &workdir, &request).await?;
            Ok(finish(&report))
        }
        Commands::Build(build) => {
            let request = args::build_request(build, &rc.config, cli.target.as_deref(), cli.wipe)?;
            let runner = BuildRunner::new(args::make_program(build, &rc.config));
            let report = session.build(&runner, &request).await?;
            Ok(finish(&report))
        }
        Commands::Publish(publish) => {
            let (kind, destination, baseurl) = args::publisher_triple(publish, &rc)
                .ok_or_else(|| usage("a publisher (-p <type> <destination> <baseurl>) is required"))?;
            let publisher = publisher_from(&kind, &destination, &baseurl)?;
            let report = session.publish(publisher.as_ref()).await?;
            Ok(finish(&report))
        }
        Commands::Test(test) => {
            let runner = boot_runner(test, &rc)?
                .ok_or_else(|| usage("a boot command (--boot-cmd) is required"))?;
            let report = session.test(&runner).await?;
            Ok(finish(&report))
        }
        Commands::Report(report) => {
            let options = args::reporter_options(report, &rc)
                .ok_or_else(|| usage("a reporter (--reporter) is required"))?;
            let reporter = reporter_from(&options).map_err(SktError::from)?;
            let report = session.report(reporter.as_ref()).await?;
            Ok(finish(&report))
        }
        Commands::Cleanup => {
            let summary = session.cleanup(cli.wipe)?;
            eprintln!("skt cleanup: {summary}");
            Ok(EXIT_SUCCESS)
        }
        Commands::All(all) => {
            // validate everything before the first stage touches the tree
            let merge = args::merge_request(&all.merge, &rc.config)?;
            let build = args::build_request(&all.build, &rc.config, cli.target.as_deref(), cli.wipe)?;
            let publisher = args::publisher_triple(&all.publish, &rc)
                .map(|(kind, destination, baseurl)| publisher_from(&kind, &destination, &baseurl))
                .transpose()?;
            let boot = boot_runner(&all.test, &rc)?;
            let reporter = args::reporter_options(&all.report, &rc)
                .map(|options| reporter_from(&options))
                .transpose()
                .map_err(SktError::from)?;

            let workdir = workdir(&cli, &rc)?;
            let client = PatchworkClient::new(args::http_timeout(&rc.config))?;
            let resolver = PatchResolver::new(&client, args::fetch_retry(&rc.config));
            let builder = BuildRunner::new(args::make_program(&all.build, &rc.config));

            let report = session
                .run_all(AllStages {
                    resolver: &resolver,
                    workdir,
                    merge,
                    builder: &builder,
                    build,
                    publisher: publisher.as_deref(),
                    boot: boot.as_ref(),
                    reporter: reporter.as_deref(),
                })
                .await?;
            Ok(finish(&report))
        }
    }
}

fn usage(message: &str) -> SktError {
    SktError::Usage(message.to_string())
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Merge(_) => "merge",
        Commands::Build(_) => "build",
        Commands::Publish(_) => "publish",
        Commands::Test(_) => "test",
        Commands::Report(_) => "report",
        Commands::Cleanup => "cleanup",
        Commands::All(_) => "all",
    }
}

fn boot_runner(test: &args::TestArgs, rc: &RcFile) -> Result<Option<BootTestRunner>, SktError> {
    let Some((cmd, timeout, pattern)) = args::boot_settings(test, rc) else {
        return Ok(None);
    };
    let runner = BootTestRunner::new(Box::new(CommandTarget::new(cmd, timeout)?));
    let runner = match pattern {
        Some(pattern) => runner.with_success_pattern(&pattern)?,
        None => runner,
    };
    Ok(Some(runner))
}

/// Work tree for a new merge: `-d`, the rc file, or a fresh directory
/// under the system temporary directory.
fn workdir(cli: &Cli, rc: &RcFile) -> Result<PathBuf> {
    if let Some(dir) = cli.workdir.clone().or_else(|| rc.config.workdir.clone()) {
        return Ok(absolute(&dir)?);
    }
    let dir = tempfile::Builder::new()
        .prefix("skt-")
        .tempdir()
        .context("failed to create a work directory")?
        .keep();
    eprintln!("skt: using work directory {}", dir.display());
    Ok(dir)
}

fn absolute(path: &Path) -> Result<PathBuf, SktError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir()
        .map_err(|e| SktError::io("failed to read the current directory", e))?;
    Ok(cwd.join(path))
}

fn finish(report: &StageReport) -> i32 {
    eprintln!(
        "skt {}: {} ({})",
        report.stage,
        report.outcome.as_str(),
        report.summary
    );
    report.exit_code()
}

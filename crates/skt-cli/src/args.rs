//! Command line options and their merge with the rc file.
//!
//! Every option can also come from the rc file; a value given on the
//! command line always wins.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use skt_core::boot::DEFAULT_BOOT_TIMEOUT;
use skt_core::build::{split_makeopts, verify_target, BuildRequest, ConfigSpec, DEFAULT_BUILD_TIMEOUT};
use skt_core::config::{RcConfig, RcFile};
use skt_core::merge::{MergeRequest, PatchSet, DEFAULT_REF};
use skt_core::{ReporterOptions, RetryPolicy, SktError};

/// Default Patchwork request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "skt")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sonic Kernel Testing: merge, build, boot and report on kernel patches", long_about = None)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Save the run state into the rc file after the stage
    #[arg(long, global = true)]
    pub state: bool,

    /// Clean the build tree first; with cleanup, remove the work tree
    #[arg(short, long, global = true)]
    pub wipe: bool,

    /// Target architecture (default: the host)
    #[arg(long, global = true)]
    pub target: Option<String>,

    /// Work tree directory
    #[arg(short = 'd', long, global = true)]
    pub workdir: Option<PathBuf>,

    /// rc file holding settings and the run state (default: ~/.sktrc)
    #[arg(long, env = "SKT_RC", global = true)]
    pub rc: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Check out a base tree and apply patches
    Merge(MergeArgs),

    /// Build the merged tree
    Build(BuildArgs),

    /// Publish the build artifacts
    Publish(PublishArgs),

    /// Boot the built kernel and look for problems
    Test(TestArgs),

    /// Report the results of the run
    Report(ReportArgs),

    /// Forget the run state and remove its artifacts
    Cleanup,

    /// Run merge, build, publish, test and report in one go
    All(AllArgs),
}

#[derive(Debug, Default, Args)]
pub struct MergeArgs {
    /// Base repository URL
    #[arg(short = 'b', long)]
    pub baserepo: Option<String>,

    /// Base ref to check out (default: master)
    #[arg(long = "ref")]
    pub git_ref: Option<String>,

    /// Shallow fetch depth
    #[arg(long)]
    pub fetch_depth: Option<u32>,

    /// Patchwork patch URL (repeatable)
    #[arg(long = "pw")]
    pub pw: Vec<String>,

    /// Local patch file (repeatable)
    #[arg(long = "patch")]
    pub patch: Vec<PathBuf>,

    /// Git ref to merge, "<url> [ref]" (repeatable)
    #[arg(short = 'm', long = "merge-ref")]
    pub merge_ref: Vec<String>,
}

#[derive(Debug, Default, Args)]
pub struct BuildArgs {
    /// Kernel config file to build with
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Predefined config: a make config target or rh-configs
    #[arg(long)]
    pub cfgtype: Option<String>,

    /// Glob selecting the generated config with --cfgtype rh-configs
    #[arg(long)]
    pub rh_configs_glob: Option<String>,

    /// Extra make arguments
    #[arg(long, allow_hyphen_values = true)]
    pub makeopts: Option<String>,

    /// Keep debug info enabled
    #[arg(long)]
    pub enable_debuginfo: bool,

    /// Build timeout in seconds (default: 12 hours)
    #[arg(long)]
    pub build_timeout: Option<u64>,

    /// Make program
    #[arg(long)]
    pub make: Option<String>,
}

#[derive(Debug, Default, Args)]
pub struct PublishArgs {
    /// Publisher: <cp|scp> <destination> <baseurl>
    #[arg(short = 'p', long = "publisher", num_args = 3, value_names = ["TYPE", "DESTINATION", "BASEURL"])]
    pub publisher: Option<Vec<String>>,
}

#[derive(Debug, Default, Args)]
pub struct TestArgs {
    /// Boot command; {tarball}, {tarball_url}, {config}, {krelease},
    /// {workdir} and {arch} are substituted
    #[arg(long)]
    pub boot_cmd: Option<String>,

    /// Boot watchdog in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Regex the console must match for a pass
    #[arg(long)]
    pub success_pattern: Option<String>,
}

#[derive(Debug, Default, Args)]
pub struct ReportArgs {
    /// Reporter: stdio, mail or artifact
    #[arg(long)]
    pub reporter: Option<String>,

    /// Mail recipient (repeatable)
    #[arg(long)]
    pub mail_to: Vec<String>,

    /// Mail sender
    #[arg(long)]
    pub mail_from: Option<String>,

    /// Mail subject, replacing the generated one
    #[arg(long)]
    pub mail_subject: Option<String>,

    /// Extra mail header "Name: value" (repeatable)
    #[arg(long)]
    pub mail_header: Vec<String>,

    /// Directory for the artifact reporter
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// sendmail-compatible program
    #[arg(long)]
    pub sendmail: Option<String>,
}

#[derive(Debug, Default, Args)]
pub struct AllArgs {
    #[command(flatten)]
    pub merge: MergeArgs,
    #[command(flatten)]
    pub build: BuildArgs,
    #[command(flatten)]
    pub publish: PublishArgs,
    #[command(flatten)]
    pub test: TestArgs,
    #[command(flatten)]
    pub report: ReportArgs,
}

/// rc file path: `--rc`, `$SKT_RC`, then `~/.sktrc`.
pub fn rc_path(cli: &Cli) -> PathBuf {
    cli.rc.clone().unwrap_or_else(|| {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_default()
            .join(".sktrc")
    })
}

fn or_rc_list<T: Clone>(cli: &[T], rc: &[T]) -> Vec<T> {
    if cli.is_empty() {
        rc.to_vec()
    } else {
        cli.to_vec()
    }
}

pub fn merge_request(args: &MergeArgs, rc: &RcConfig) -> Result<MergeRequest, SktError> {
    let repo = args
        .baserepo
        .clone()
        .or_else(|| rc.baserepo.clone())
        .ok_or_else(|| SktError::Usage("a base repository (-b/--baserepo) is required".to_string()))?;

    // the patch kinds are exclusive, so the command line replaces the rc
    // lists as a whole
    let from_cli = !(args.pw.is_empty() && args.patch.is_empty() && args.merge_ref.is_empty());
    let patches = if from_cli {
        PatchSet::from_lists(args.pw.clone(), args.patch.clone(), args.merge_ref.clone())?
    } else {
        PatchSet::from_lists(rc.pw.clone(), rc.patch.clone(), rc.merge_ref.clone())?
    };

    Ok(MergeRequest {
        repo,
        git_ref: args
            .git_ref
            .clone()
            .or_else(|| rc.git_ref.clone())
            .unwrap_or_else(|| DEFAULT_REF.to_string()),
        fetch_depth: args.fetch_depth.or(rc.fetch_depth),
        patches,
    })
}

pub fn fetch_retry(rc: &RcConfig) -> RetryPolicy {
    RetryPolicy {
        max_retries: rc.fetch_retries.unwrap_or(RetryPolicy::default().max_retries),
        ..RetryPolicy::default()
    }
}

pub fn http_timeout(rc: &RcConfig) -> Duration {
    rc.http_timeout.map(Duration::from_secs).unwrap_or(HTTP_TIMEOUT)
}

/// Validate the build options. Config problems are reported before
/// anything else is looked at.
pub fn build_request(
    args: &BuildArgs,
    rc: &RcConfig,
    target: Option<&str>,
    wipe: bool,
) -> Result<BuildRequest, SktError> {
    let spec = if args.cfgtype.is_some() || args.config.is_some() {
        ConfigSpec {
            cfgtype: args.cfgtype.clone(),
            config_file: args.config.clone(),
            rh_configs_glob: args.rh_configs_glob.clone().or_else(|| rc.rh_configs_glob.clone()),
        }
    } else {
        ConfigSpec {
            cfgtype: rc.cfgtype.clone(),
            config_file: rc.baseconfig.clone(),
            rh_configs_glob: args.rh_configs_glob.clone().or_else(|| rc.rh_configs_glob.clone()),
        }
    };
    let config = spec.resolve()?;

    Ok(BuildRequest {
        target: verify_target(target.or(rc.target.as_deref()))?,
        config,
        makeopts: args
            .makeopts
            .as_deref()
            .or(rc.makeopts.as_deref())
            .map(split_makeopts)
            .transpose()?
            .unwrap_or_default(),
        enable_debuginfo: args.enable_debuginfo || rc.enable_debuginfo.unwrap_or(false),
        wipe: wipe || rc.wipe.unwrap_or(false),
        timeout: args
            .build_timeout
            .or(rc.build_timeout)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_BUILD_TIMEOUT),
    })
}

pub fn make_program(args: &BuildArgs, rc: &RcConfig) -> String {
    args.make
        .clone()
        .or_else(|| rc.make.clone())
        .unwrap_or_else(|| "make".to_string())
}

/// `(type, destination, baseurl)`, if a publisher is configured.
pub fn publisher_triple(args: &PublishArgs, rc: &RcFile) -> Option<(String, String, String)> {
    match args.publisher.as_deref() {
        Some([kind, destination, baseurl]) => {
            Some((kind.clone(), destination.clone(), baseurl.clone()))
        }
        _ => rc
            .publisher
            .as_ref()
            .map(|p| (p.kind.clone(), p.destination.clone(), p.baseurl.clone())),
    }
}

/// Boot command, watchdog and success pattern, if a boot target is
/// configured.
pub fn boot_settings(args: &TestArgs, rc: &RcFile) -> Option<(String, Duration, Option<String>)> {
    let runner = rc.runner.clone().unwrap_or_default();
    let cmd = args.boot_cmd.clone().or(runner.boot_cmd)?;
    let timeout = args
        .timeout
        .or(runner.timeout)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_BOOT_TIMEOUT);
    let pattern = args.success_pattern.clone().or(runner.success_pattern);
    Some((cmd, timeout, pattern))
}

/// Reporter options, if a reporter is configured.
///
/// The `[reporter]` table only contributes when it describes the same
/// kind of reporter as the one selected.
pub fn reporter_options(args: &ReportArgs, rc: &RcFile) -> Option<ReporterOptions> {
    let table = rc.reporter.clone().unwrap_or_default();
    let kind = args.reporter.clone().or_else(|| table.kind.clone())?;
    let table = match &table.kind {
        Some(rc_kind) if *rc_kind != kind => Default::default(),
        _ => table,
    };

    Some(ReporterOptions {
        kind,
        mail_to: or_rc_list(&args.mail_to, &table.mail_to),
        mail_from: args.mail_from.clone().or(table.mail_from),
        mail_subject: args.mail_subject.clone().or(table.mail_subject),
        mail_headers: or_rc_list(&args.mail_header, &table.mail_header),
        output_dir: args.output_dir.clone().or(table.output_dir),
        sendmail: args.sendmail.clone().or(table.sendmail),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use skt_core::config::{PublisherConfig, ReporterConfig};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "skt", "build", "--cfgtype", "tinyconfig", "--state", "-vv", "-d", "/work",
        ])
        .unwrap();
        assert!(cli.state);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.workdir, Some(PathBuf::from("/work")));
        assert!(matches!(cli.command, Commands::Build(_)));
    }

    #[test]
    fn publisher_takes_three_values() {
        let cli = Cli::try_parse_from([
            "skt", "publish", "-p", "cp", "/srv/www", "http://example.com/builds",
        ])
        .unwrap();
        let Commands::Publish(args) = cli.command else {
            panic!("not publish");
        };
        assert_eq!(
            publisher_triple(&args, &RcFile::default()),
            Some((
                "cp".to_string(),
                "/srv/www".to_string(),
                "http://example.com/builds".to_string()
            ))
        );
        assert!(Cli::try_parse_from(["skt", "publish", "-p", "cp", "/srv/www"]).is_err());
    }

    #[test]
    fn command_line_overrides_rc() {
        let rc = RcConfig {
            baserepo: Some("git://rc.example.com/linux.git".to_string()),
            git_ref: Some("v4.18".to_string()),
            pw: vec!["https://patchwork.example.com/patch/1/".to_string()],
            ..Default::default()
        };
        let args = MergeArgs {
            git_ref: Some("v4.19".to_string()),
            patch: vec![PathBuf::from("0001-fix.patch")],
            ..Default::default()
        };
        let request = merge_request(&args, &rc).unwrap();
        assert_eq!(request.repo, "git://rc.example.com/linux.git");
        assert_eq!(request.git_ref, "v4.19");
        assert_eq!(
            request.patches,
            PatchSet::LocalFiles(vec![PathBuf::from("0001-fix.patch")])
        );
    }

    #[test]
    fn merge_needs_a_base_repository() {
        let err = merge_request(&MergeArgs::default(), &RcConfig::default()).unwrap_err();
        assert_eq!(err.exit_code(), skt_core::error::EXIT_USAGE);
    }

    #[test]
    fn cli_config_source_replaces_rc_source() {
        let rc = RcConfig {
            baseconfig: Some(PathBuf::from("/boot/config-4.18")),
            ..Default::default()
        };
        let args = BuildArgs {
            cfgtype: Some("tinyconfig".to_string()),
            ..Default::default()
        };
        let request = build_request(&args, &rc, Some("x86_64"), false).unwrap();
        assert_eq!(
            request.config,
            skt_core::ConfigPlan::MakeTarget("tinyconfig".to_string())
        );
        assert_eq!(request.timeout, DEFAULT_BUILD_TIMEOUT);

        let both = BuildArgs {
            cfgtype: Some("tinyconfig".to_string()),
            config: Some(PathBuf::from("/boot/config")),
            ..Default::default()
        };
        assert!(matches!(
            build_request(&both, &rc, Some("x86_64"), false),
            Err(SktError::AmbiguousConfig(_))
        ));
    }

    #[test]
    fn makeopts_keep_quoted_values_together() {
        let rc = RcConfig {
            cfgtype: Some("tinyconfig".to_string()),
            makeopts: Some(r#"KCFLAGS="-O2 -g" V=1"#.to_string()),
            ..Default::default()
        };
        let request = build_request(&BuildArgs::default(), &rc, Some("x86_64"), false).unwrap();
        assert_eq!(request.makeopts, vec!["KCFLAGS=-O2 -g", "V=1"]);

        let unbalanced = BuildArgs {
            makeopts: Some("KCFLAGS='-O2".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            build_request(&unbalanced, &rc, Some("x86_64"), false),
            Err(SktError::Usage(_))
        ));
    }

    #[test]
    fn rc_reporter_table_applies_to_its_own_kind_only() {
        let rc = RcFile {
            reporter: Some(ReporterConfig {
                kind: Some("mail".to_string()),
                mail_to: vec!["netdev@example.com".to_string()],
                mail_from: Some("ci@example.com".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let mail = reporter_options(&ReportArgs::default(), &rc).unwrap();
        assert_eq!(mail.kind, "mail");
        assert_eq!(mail.mail_to, vec!["netdev@example.com".to_string()]);

        let stdio = ReportArgs {
            reporter: Some("stdio".to_string()),
            ..Default::default()
        };
        let options = reporter_options(&stdio, &rc).unwrap();
        assert!(options.mail_to.is_empty());
        assert!(options.mail_from.is_none());
    }

    #[test]
    fn nothing_configured_means_no_optional_stage() {
        let rc = RcFile::default();
        assert!(publisher_triple(&PublishArgs::default(), &rc).is_none());
        assert!(boot_settings(&TestArgs::default(), &rc).is_none());
        assert!(reporter_options(&ReportArgs::default(), &rc).is_none());

        let rc = RcFile {
            publisher: Some(PublisherConfig {
                kind: "scp".to_string(),
                destination: "host:/srv".to_string(),
                baseurl: "http://host".to_string(),
            }),
            ..Default::default()
        };
        assert_eq!(publisher_triple(&PublishArgs::default(), &rc).unwrap().0, "scp");
    }
}

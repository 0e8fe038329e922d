//! Command-line interface that enrolls boot-time key files for LUKS volumes.

use anyhow::{ensure, Context, Result};
use autounlock_core::{
    config::AutounlockConfig,
    logging,
    workflow::{self, DeviceBinding, Providers, WorkflowEvent, WorkflowLevel, WorkflowReport},
    AutounlockError, AutounlockResult, ExistingKey,
};
use autounlock_system::{SystemBlockIndex, SystemBootProvider, SystemLuksProvider};
use clap::builder::NonEmptyStringValueParser;
use clap::{ArgAction, CommandFactory, Parser};
use log::info;
use rpassword::prompt_password;
use std::ffi::OsString;
use std::path::PathBuf;

/// Command-line options.
#[derive(Parser, Debug)]
#[command(
    name = "luks-autounlock",
    about = "Unlock LUKS volumes at boot with key files embedded in the initramfs.",
    disable_help_flag = true
)]
struct Cli {
    /// Volume mapping name, e.g. `luks-<UUID>`. Repeat for several volumes.
    #[arg(
        short = 'v',
        long = "volume",
        value_name = "NAME",
        value_parser = NonEmptyStringValueParser::new()
    )]
    volumes: Vec<String>,

    /// Path to the configuration file.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Authenticate enrollment with an existing key file instead of prompting.
    #[arg(long, value_name = "PATH")]
    existing_key_file: Option<PathBuf>,

    /// Resolve and validate the volumes, print the plan, and change nothing.
    #[arg(long)]
    check: bool,

    /// Print usage.
    #[arg(short = 'h', long = "help", action = ArgAction::SetTrue)]
    help: bool,
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    let cli = match parse_args(std::env::args_os()) {
        Ok(cli) => cli,
        Err(usage) => {
            eprintln!("{usage}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

/// Parse `args`, returning the text to print when the invocation is not runnable.
///
/// Help, zero volumes, and every clap error all end up here; none of them is a
/// successful run.
fn parse_args<I, T>(args: I) -> std::result::Result<Cli, String>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::try_parse_from(args).map_err(|err| err.render().to_string())?;
    if cli.help {
        return Err(usage());
    }
    if cli.volumes.is_empty() {
        return Err(format!(
            "error: at least one -v <NAME> is required\n\n{}",
            usage()
        ));
    }
    Ok(cli)
}

fn usage() -> String {
    Cli::command().render_help().to_string()
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| AutounlockConfig::default_path().to_path_buf());
    let config = AutounlockConfig::load_or_default(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;
    logging::init(&config.logging.level);
    info!("using {}", config.source_description());

    let issues = config.validate();
    if !issues.is_empty() {
        return Err(AutounlockError::InvalidConfig(format!(
            "{}:\n  - {}",
            config_path.display(),
            issues.join("\n  - ")
        ))
        .into());
    }

    let requests = workflow::collect_volumes(&cli.volumes, &config)?;
    workflow::ensure_privilege()?;
    let tools = workflow::ensure_dependencies(&config)?;

    if let Some(path) = &cli.existing_key_file {
        ensure!(
            path.is_file(),
            "existing key file {} does not exist",
            path.display()
        );
    }

    let block = SystemBlockIndex::from_config(&tools, &config);
    let luks = SystemLuksProvider::from_config(&tools, &config);
    let boot = SystemBootProvider::from_config(&tools, &config);
    let providers = Providers {
        block: &block,
        luks: &luks,
        boot: &boot,
    };

    let report = if cli.check {
        workflow::check_volumes(&config, &providers, &requests)?
    } else {
        info!("configuring {} volume(s)", requests.len());
        let existing_key_file = cli.existing_key_file.clone();
        let outcome = workflow::configure_autounlock(&config, &providers, &requests, |binding| {
            existing_key(binding, existing_key_file.as_ref())
        });
        match outcome {
            Ok(report) => report,
            Err(err) => {
                print_events(err.partial_events());
                return Err(err.into());
            }
        }
    };
    print_report(report);
    Ok(())
}

fn existing_key(
    binding: &DeviceBinding,
    key_file: Option<&PathBuf>,
) -> AutounlockResult<ExistingKey> {
    if let Some(path) = key_file {
        return Ok(ExistingKey::KeyFile(path.clone()));
    }
    let passphrase = prompt_password(format!(
        "Existing passphrase for {} ({}): ",
        binding.request.name,
        binding.device.display()
    ))?;
    Ok(ExistingKey::passphrase(passphrase))
}

/// Pretty-print a workflow report so humans can follow along.
fn print_report(report: WorkflowReport) {
    println!("{}", report.title);
    print_events(&report.events);
}

fn print_events(events: &[WorkflowEvent]) {
    for event in events {
        println!("  [{}] {}", level_tag(event.level), event.message);
    }
}

/// Short tag used when printing workflow severity levels.
fn level_tag(level: WorkflowLevel) -> &'static str {
    match level {
        WorkflowLevel::Info => "INFO",
        WorkflowLevel::Success => "OK",
        WorkflowLevel::Warn => "WARN",
        WorkflowLevel::Error => "ERR",
        WorkflowLevel::Security => "SEC",
    }
}

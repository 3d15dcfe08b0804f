//! hwseal command-line interface: rotate, inspect, and describe hardware-bound LUKS keys.

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hwseal_core::{
    config::{CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH},
    fingerprint, logging,
    workflow::{self, WorkflowLevel, WorkflowReport},
    Credential, DeviceStatus, HeaderBackupMode, HostHardwareSource, HwsealConfig, KeyFile,
    Passphrase, RunOptions,
};
use hwseal_luks::SystemLuksProvider;
use log::warn;
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

fn load_cli_config(path: &Path) -> Result<HwsealConfig> {
    HwsealConfig::load_or_default(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "hwseal",
    version,
    about = "Bind a LUKS keyslot to this machine's motherboard serial and gateway MAC."
)]
struct Cli {
    /// Path to the hwseal configuration file (TOML or YAML).
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = CONFIG_PATH_ENV)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Enroll (or rotate) the hardware-derived key on every active LUKS device.
    Run {
        /// Existing LUKS passphrase. Prefer --prompt-passphrase or HWSEAL_PASSPHRASE.
        #[arg(long, env = "HWSEAL_PASSPHRASE", hide_env_values = true)]
        passphrase: Option<String>,

        /// Prompt interactively for the existing LUKS passphrase.
        #[arg(long)]
        prompt_passphrase: bool,

        /// Authorize slot changes with a key file instead of a passphrase.
        #[arg(long)]
        key_file: Option<PathBuf>,

        /// Walk every decision without changing any header.
        #[arg(long)]
        dry_run: bool,

        /// Where header backups land; defaults to headers.default_mode.
        #[arg(long, value_enum)]
        header_mode: Option<HeaderModeArg>,

        /// Emit the run summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show each encrypted device, its active keyslots, and which ones hwseal owns.
    Status {
        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Resolve the hardware fingerprint and print a digest of the derived key.
    Fingerprint,

    /// Print the JSON schema of the configuration file.
    Schema,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum HeaderModeArg {
    Local,
    Download,
}

impl From<HeaderModeArg> for HeaderBackupMode {
    fn from(value: HeaderModeArg) -> Self {
        match value {
            HeaderModeArg::Local => HeaderBackupMode::Local,
            HeaderModeArg::Download => HeaderBackupMode::Download,
        }
    }
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

/// Dispatch to the requested subcommand.
fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();
    let config_path = cli.config.clone();

    match cli.command {
        Commands::Run {
            passphrase,
            prompt_passphrase,
            key_file,
            dry_run,
            header_mode,
            json,
        } => {
            workflow::ensure_privilege()?;
            let config = load_cli_config(&config_path)?;
            let credential = build_credential(passphrase, prompt_passphrase, key_file)?;
            let provider = SystemLuksProvider::from_config(&config)?;
            let hardware = HostHardwareSource::from_config(&config);
            let options = RunOptions {
                dry_run,
                header_mode: header_mode
                    .map(HeaderBackupMode::from)
                    .unwrap_or(config.headers.default_mode),
            };

            let result = hwseal_core::run(&config, &provider, &hardware, credential.as_ref(), &options)?;

            if json {
                println!("{}", to_string_pretty(&result)?);
            } else {
                print_report(result.to_report());
            }

            if !result.is_success() {
                bail!(
                    "{} of {} device(s) could not be processed",
                    result.failed.len(),
                    result.device_count()
                );
            }
            Ok(())
        }
        Commands::Status { json } => {
            workflow::ensure_privilege()?;
            let config = load_cli_config(&config_path)?;
            let provider = SystemLuksProvider::from_config(&config)?;
            let statuses = hwseal_core::describe_devices(&provider)?;

            if json {
                println!("{}", to_string_pretty(&statuses)?);
            } else {
                print_status_table(&statuses);
            }
            Ok(())
        }
        Commands::Fingerprint => {
            workflow::ensure_privilege()?;
            let config = load_cli_config(&config_path)?;
            let hardware = HostHardwareSource::from_config(&config);
            let fingerprint = fingerprint::resolve_fingerprint(&hardware)?;

            println!("motherboard serial: {}", mask(fingerprint.serial()));
            println!("gateway MAC:        {}", mask(fingerprint.mac()));
            println!("key digest:         {}", fingerprint.derive_key().digest());
            Ok(())
        }
        Commands::Schema => {
            let schema = schema_for!(HwsealConfig);
            println!("{}", to_string_pretty(&schema)?);
            Ok(())
        }
    }
}

/// Exactly one authorizing credential: inline/env passphrase, prompt, or key file.
fn build_credential(
    passphrase: Option<String>,
    prompt_passphrase: bool,
    key_file: Option<PathBuf>,
) -> Result<Box<dyn Credential>> {
    let passphrase = passphrase.map(Zeroizing::new);
    let chosen = [passphrase.is_some(), prompt_passphrase, key_file.is_some()]
        .iter()
        .filter(|set| **set)
        .count();
    ensure!(
        chosen <= 1,
        "choose one of --passphrase, --prompt-passphrase, or --key-file"
    );

    if let Some(path) = key_file {
        let key_file = KeyFile::new(&path)
            .with_context(|| format!("unusable key file {}", path.display()))?;
        return Ok(Box::new(key_file));
    }

    let secret = match passphrase {
        Some(value) => value,
        None if prompt_passphrase => Zeroizing::new(prompt_password("Existing LUKS passphrase: ")?),
        None => bail!("an existing LUKS credential is required: pass --prompt-passphrase, --passphrase, or --key-file"),
    };
    if secret.ends_with('\n') {
        warn!("passphrase ends with a newline; it is used verbatim");
    }
    Ok(Box::new(Passphrase::new(secret.as_bytes().to_vec())?))
}

/// Pretty-print a workflow report so humans can follow along.
fn print_report(report: WorkflowReport) {
    println!("{}", report.title);
    for event in report.events {
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

/// Render one row per encrypted device.
fn print_status_table(statuses: &[DeviceStatus]) {
    if statuses.is_empty() {
        println!("No active encrypted devices found.");
        return;
    }

    println!(
        "{:<24} {:<28} {:<7} {:<16} OWNED",
        "DEVICE", "MAPPING", "FORMAT", "ACTIVE SLOTS"
    );
    for status in statuses {
        if let Some(error) = &status.error {
            println!(
                "{:<24} {:<28} {:<7} {}",
                status.device.device, status.device.mapping, "?", error
            );
            continue;
        }
        let version = status
            .version
            .map(|version| version.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "{:<24} {:<28} {:<7} {:<16} {}",
            status.device.device,
            status.device.mapping,
            version,
            join_slots(&status.active_slots),
            join_slots(&status.owned_slots)
        );
    }
}

fn join_slots(slots: &[u8]) -> String {
    if slots.is_empty() {
        return "-".to_string();
    }
    slots
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Keep the last four characters so operators can tell values apart.
fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let keep = chars.len().min(4);
    let hidden = chars.len() - keep;
    let tail: String = chars[hidden..].iter().collect();
    format!("{}{tail}", "*".repeat(hidden))
}

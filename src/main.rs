use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use pi_image_builder::block::DevicePath;
use pi_image_builder::build::{
    BuildOptions, BuildOrchestrator, BuildOutcome, BuildTarget, HttpImageStore, LogReporter,
};
use pi_image_builder::config::{AppConfig, CONFIG_FILE};
use pi_image_builder::exec::ToolRunner;
use pi_image_builder::flash::{prepare_image, Flasher};
use pi_image_builder::guest::TemplateRepository;

#[derive(Parser)]
#[command(name = "pi-image-builder")]
#[command(about = "Build Kubernetes-ready Raspberry Pi node images", long_about = None)]
struct Cli {
    /// Directory holding downloads, images and mount points
    #[arg(long, global = true, value_name = "PATH")]
    work_dir: Option<PathBuf>,

    /// Base URL of the image store
    #[arg(long, global = true, value_name = "URL")]
    store_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download, configure and publish an image, or flash it directly
    Build {
        /// Download the base image even if it is already present
        #[arg(long)]
        force_download: bool,

        /// Flash the configured image to this device instead of publishing it
        #[arg(long, value_name = "DEVICE")]
        flash: Option<String>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Flash a previously built image onto a device
    Flash {
        /// Name of the compressed image in the store
        #[arg(long, value_name = "NAME")]
        image: String,

        /// Target block device, e.g. /dev/sdb
        #[arg(long, value_name = "DEVICE")]
        device: String,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Generate configuration file (.pi-image-builder.toml) in current directory
    Genconfig {
        /// Force overwrite existing configuration file
        #[arg(long)]
        force: bool,
    },
}

fn confirm_or_yes(yes: bool, prompt: &str) -> Result<()> {
    if yes {
        return Ok(());
    }
    let confirmed = Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .map_err(|e| anyhow!("prompt failed: {e}"))?;
    if confirmed {
        Ok(())
    } else {
        bail!("aborted by user")
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let config_path = Path::new(CONFIG_FILE);
    let mut config = if config_path.exists() {
        let cfg = AppConfig::load_from_file(config_path)
            .map_err(|e| anyhow!("Failed to load configuration file {CONFIG_FILE}: {e:#}"))?;
        let abs_path =
            std::fs::canonicalize(config_path).unwrap_or_else(|_| config_path.to_path_buf());
        info!("Using configuration file: {}", abs_path.display());
        cfg
    } else {
        AppConfig::default()
    };

    if let Some(work_dir) = &cli.work_dir {
        config.work_dir = work_dir.clone();
    }
    if let Some(url) = &cli.store_url {
        config.store.url = Some(url.clone());
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Genconfig { force } = cli.command {
        return AppConfig::generate_config_file(Path::new(CONFIG_FILE), force);
    }

    let config = load_config(&cli)?;
    let runner = ToolRunner;
    let store = config.store.url.as_deref().map(HttpImageStore::new);

    match cli.command {
        Commands::Build {
            force_download,
            flash,
            yes,
        } => {
            let target = match flash {
                Some(device) => {
                    let device = DevicePath::parse(&device)?;
                    confirm_or_yes(
                        yes,
                        &format!("All data on {device} will be destroyed. Continue?"),
                    )?;
                    BuildTarget::Flash(device)
                }
                None => {
                    if store.is_none() {
                        warn!("no image store configured, the image will only be kept locally");
                    }
                    BuildTarget::Publish
                }
            };

            let templates = TemplateRepository::embedded()?;
            let mut build = BuildOrchestrator::new(
                &runner,
                store.as_ref(),
                &config,
                &templates,
                Box::new(LogReporter),
            );
            match build.run(&target, BuildOptions { force_download }).await? {
                BuildOutcome::Published { image, uploaded_as } => match uploaded_as {
                    Some(name) => info!("published {} as {name}", image.display()),
                    None => info!("image ready at {}", image.display()),
                },
                BuildOutcome::Flashed(device) => info!("{device} is ready"),
            }
        }

        Commands::Flash { image, device, yes } => {
            let device = DevicePath::parse(&device)?;
            confirm_or_yes(
                yes,
                &format!("All data on {device} will be destroyed. Continue?"),
            )?;
            let local = prepare_image(store.as_ref(), &config, &image).await?;
            Flasher::new(&runner, &config)
                .flash(&local, &device, &LogReporter)
                .await?;
            info!("{device} is ready");
        }

        Commands::Genconfig { .. } => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logger, default info level, display file line number and time
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            let level_style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {}:{}] {level_style}{}{level_style:#}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

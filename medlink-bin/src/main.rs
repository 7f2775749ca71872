mod upload;

use clap::{Parser, Subcommand};
use medlink_common::{parse_level, Logger};
use medlink_driver_medtronic::{driver::MedtronicConfig, MedtronicContext, MedtronicDriver};
use medlink_driver_pogo::{PogoConfig, PogoContext, PogoDriver};
use medlink_error::{MedlinkError, MedlinkResult};
use medlink_models::{constants::DEFAULT_CONFIG_FILE_NAME, Settings};
use medlink_sdk::{run_lifecycle, Progress, UploadTransport};
use std::{env::current_dir, path::PathBuf, sync::Arc};
use tracing::{error, info};
use upload::JsonFileUpload;

/// medlink - diabetes device uploader
///
/// Reads a connected insulin pump or glucose meter, reconstructs its
/// history and writes the upload session as JSON.
#[derive(Parser)]
#[command(name = "medlink")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Diabetes device uploader", long_about = None)]
struct Cli {
    /// Sets a custom config file with full path
    ///
    /// If not specified, medlink looks for 'medlink.toml' in the current
    /// working directory.
    #[arg(short, long, env = "MEDLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Log level for this run, overriding `general.log_level`
    #[arg(short, long, env = "MEDLINK_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    device: Device,
}

#[derive(Subcommand)]
enum Device {
    /// Medtronic Paradigm pump through a Contour Next Link
    Medtronic {
        /// Six character pump serial, overrides the config file
        #[arg(short, long)]
        serial_number: Option<String>,
        /// Link device node, overrides the config file
        #[arg(short, long)]
        device_path: Option<String>,
    },
    /// Intuity POGO meter on a serial port
    Pogo {
        /// Serial port, overrides the config file
        #[arg(short, long)]
        port: Option<String>,
    },
}

/// Switch the running logger to `name`.
fn override_level(logger: &Logger, name: &str) -> MedlinkResult<()> {
    let level = parse_level(name)
        .ok_or_else(|| MedlinkError::ConfigurationError(format!("Unknown log level: {name}")))?;
    logger.set_level(level);
    Ok(())
}

fn logging_progress() -> Progress {
    Progress::new(|stage, percent| {
        if percent == 0 || percent == 100 {
            info!(%stage, percent, "progress");
        } else {
            tracing::debug!(%stage, percent, "progress");
        }
    })
}

async fn upload_medtronic(
    settings: &Settings,
    upload: Arc<dyn UploadTransport>,
    serial_number: Option<String>,
    device_path: Option<String>,
) -> MedlinkResult<()> {
    let section = &settings.medtronic;
    let mut config = MedtronicConfig::new(
        device_path.unwrap_or_else(|| section.device_path.clone()),
        serial_number.unwrap_or_else(|| section.serial_number.clone()),
    );
    config.group_id = section.group_id.clone();
    config.timezone_offset = settings.general.timezone_offset_minutes;
    config.tz_name = settings.general.timezone_name.clone();
    config.point_policy = settings.retry.point_policy();
    config.history_policy = settings.retry.history_policy();

    let mut driver = MedtronicDriver::new(upload);
    let mut ctx = MedtronicContext::new(config);
    run_lifecycle(&mut driver, &mut ctx, &logging_progress()).await?;
    info!(device_id = %ctx.device_id, events = ctx.events.len(), "pump uploaded");
    Ok(())
}

async fn upload_pogo(
    settings: &Settings,
    upload: Arc<dyn UploadTransport>,
    port: Option<String>,
) -> MedlinkResult<()> {
    let section = &settings.pogo;
    let mut config = PogoConfig::new(
        port.unwrap_or_else(|| section.port.clone()),
        section.baud_rate,
    );
    config.group_id = section.group_id.clone();
    config.timezone_offset = settings.general.timezone_offset_minutes;
    config.tz_name = settings.general.timezone_name.clone();

    let mut driver = PogoDriver::new(upload);
    let mut ctx = PogoContext::new(config);
    run_lifecycle(&mut driver, &mut ctx, &logging_progress()).await?;
    info!(device_id = %ctx.device_id, events = ctx.events.len(), "meter uploaded");
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> MedlinkResult<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(p) => p,
        None => {
            let dir = current_dir()
                .map_err(|e| MedlinkError::from(format!("Failed to get current directory: {e}")))?;
            dir.join(DEFAULT_CONFIG_FILE_NAME)
        }
    };
    let settings = Settings::new(config_path.to_string_lossy().to_string())?;

    let mut logger = Logger::new(parse_level(&settings.general.log_level));
    logger.initialize()?;
    if let Some(name) = cli.log_level.as_deref() {
        override_level(&logger, name)?;
    }

    let upload: Arc<dyn UploadTransport> = Arc::new(JsonFileUpload::new(
        &settings.general.output_dir,
        &settings.general.state_dir,
    ));

    let result = match cli.device {
        Device::Medtronic {
            serial_number,
            device_path,
        } => upload_medtronic(&settings, upload, serial_number, device_path).await,
        Device::Pogo { port } => upload_pogo(&settings, upload, port).await,
    };

    if let Err(e) = &result {
        error!(code = e.code(), error = %e, "upload failed");
    }
    result
}

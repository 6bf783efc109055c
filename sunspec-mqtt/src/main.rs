use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use sunspec_mqtt::{config::Settings, shutdown, Controller, ModbusReader, MqttPublisher, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(
    name = "sunspec-mqtt",
    version,
    about = "Polls a SunSpec Modbus TCP device and republishes its readings to MQTT"
)]
struct Cli {
    /// JSON file with default settings; command line options take precedence
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    config: Option<PathBuf>,

    #[command(flatten)]
    settings: Settings,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if err.is_fatal() => {
            error!(cause = %err, "Cannot start");
            ExitCode::from(2)
        }
        Err(err) => {
            error!(cause = %err, "Stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(Cli { config, settings }: Cli) -> Result<()> {
    let settings = match config {
        Some(path) => settings.or(Settings::load(&path)?),
        None => settings,
    };
    let config = settings.into_config()?;

    let controller = Controller::new(
        config.clone(),
        ModbusReader::new(&config),
        MqttPublisher::new(&config),
    );

    if config.dump_json {
        let path = controller.dump().await?;
        info!(path = %path.display(), "Wrote JSON dump");
    } else {
        controller.run(shutdown::signal()).await?;
    }

    Ok(())
}

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use gsacd::config::LoggingConfig;
use gsacd::integrations::gsac::setup;
use gsacd::integrations::gsac::setup::ProbeTimings;
use gsacd::integrations::gsac::DeviceId;
use gsacd::integrations::gsac::GsacDevice;
use gsacd::integrations::gsac::Topics;
use gsacd::integrations::mqtt::Bus;
use gsacd::integrations::mqtt::RumqttcClient;
use gsacd::Config;
use gsacd::Engine;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// How long `probe` waits for the broker connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "gsacd", version)]
#[command(about = "GoldStar GSAC/GSACI air conditioners over MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "gsacd.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the daemon (default)
    Run,

    /// Check that a device is on the broker and print its config record
    Probe {
        device_id: String,

        #[arg(long)]
        name: Option<String>,
    },

    /// Print the topics derived from a device id
    Topics { device_id: String },
}

fn init_logging(logging: &LoggingConfig) {
    let targets = logging.overrides.iter().fold(
        Targets::new().with_default(LevelFilter::from(logging.level)),
        |targets, (target, level)| targets.with_target(target.clone(), LevelFilter::from(*level)),
    );

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(targets)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Cmd::Topics { device_id }) = &cli.command {
        let device_id = DeviceId::parse(device_id)?;
        print!("{}", toml::to_string(&Topics::for_device(&device_id))?);
        return Ok(());
    }

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    init_logging(&config.logging);

    tracing::info!("gsacd starting");
    tracing::info!("Loaded config from: {}", cli.config.display());

    match cli.command {
        Some(Cmd::Probe { device_id, name }) => probe(config, &device_id, name).await,
        _ => run(config).await,
    }
}

async fn wait_for_broker(bus: &Bus) -> anyhow::Result<()> {
    tokio::time::timeout(CONNECT_TIMEOUT, async {
        while !bus.is_connected().await {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .context("Timed out connecting to the MQTT broker")
}

async fn probe(config: Config, raw: &str, name: Option<String>) -> anyhow::Result<()> {
    let bus = Bus::new(RumqttcClient::new(&config.mqtt));
    let _dispatch = bus.start().await.context("Failed to start MQTT client")?;
    wait_for_broker(&bus).await?;

    let entry = setup::add_device(
        &bus,
        raw,
        name,
        &config.device_ids(),
        &ProbeTimings::default(),
    )
    .await
    .map_err(|e| {
        let (field, key) = e.form_error();
        anyhow::anyhow!("{} ({}: {})", e, field, key)
    })?;

    let entry_id = format!("gsac_{}", entry.device_id.to_lowercase());
    let record = BTreeMap::from([("devices", BTreeMap::from([(entry_id, entry)]))]);
    print!("{}", toml::to_string(&record)?);
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let engine = Arc::new(Engine::new());
    let engine_task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run().await }
    });

    let bus = Bus::new(RumqttcClient::new(&config.mqtt));
    let dispatch_task = bus.start().await.context("Failed to start MQTT client")?;
    tracing::info!(
        "Connecting to MQTT broker {}:{}",
        config.mqtt.broker,
        config.mqtt.port
    );

    let (devices, skipped) = config.devices()?;
    for e in skipped {
        tracing::error!("{}, skipping", e);
    }

    let mut running = Vec::new();
    for device in devices {
        tracing::info!("[{}] Setting up device {}", device.entry_id, device.device_id);
        match GsacDevice::setup(
            device.device_id.clone(),
            &device.name,
            bus.clone(),
            engine.sender(),
        )
        .await
        {
            Ok(d) => running.push(d),
            Err(e) => tracing::error!("[{}] Device setup failed: {}", device.entry_id, e),
        }
    }

    let (api_shutdown_tx, api_shutdown_rx) = tokio::sync::oneshot::channel();
    let api_task = config.api.clone().map(|api| {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = gsacd::api::serve(api.listen, api.port, engine, api_shutdown_rx).await
            {
                tracing::error!("HTTP API server failed: {}", e);
            }
        })
    });

    tracing::info!("{} device(s) running", running.len());
    tracing::info!("Press Ctrl+C to exit");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received shutdown signal");
        }
        Err(e) => {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    if let Some(task) = api_task {
        let _ = api_shutdown_tx.send(());
        let _ = task.await;
    }

    for device in running {
        device.unload().await;
    }

    dispatch_task.abort();
    engine_task.abort();
    tracing::info!("gsacd shutdown complete");

    Ok(())
}

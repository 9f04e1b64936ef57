use std::path::PathBuf;
use std::sync::Arc;

use aprs_console::{
    api::Api,
    ax25::Callsign,
    bridge,
    config::Config,
    engine::{
        Engine,
        EngineSetup,
    },
    events::EventBus,
    framebuf::FrameBuffer,
    kiss,
    scheduler::{
        Priority,
        Scheduler,
    },
    station,
    transport::{
        Transport,
        TransportConfig,
    },
};
use clap::Parser;
use color_eyre::eyre::{
    Error,
    eyre,
};
use tokio::sync::{
    broadcast,
    mpsc,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[clap(about = "KISS/AX.25 packet terminal and APRS gateway")]
struct Args {
    /// Configuration file (default: ~/.tnc_config.json)
    #[clap(long, env = "TNC_CONFIG")]
    config: Option<PathBuf>,

    /// Serial KISS TNC device, e.g. /dev/ttyUSB0
    #[clap(long, conflicts_with_all = ["tcp", "ble"])]
    serial: Option<String>,

    /// Serial baud rate
    #[clap(long, default_value_t = 9600)]
    baud: u32,

    /// Remote KISS TNC, e.g. localhost:8001
    #[clap(long, conflicts_with = "ble")]
    tcp: Option<String>,

    /// Connect the BLE handheld configured as RADIO_MAC
    #[clap(long)]
    ble: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = dotenvy::dotenv();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;
    tracing::info!(mycall = %config.mycall, path = %config_path.display(), "configuration loaded");

    let transport_config = select_transport(&args, &config)?;
    let mycall: Callsign = config
        .mycall
        .parse()
        .map_err(|_| eyre!("MYCALL {:?} is not a valid callsign", config.mycall))?;
    let txdelay = config.txdelay;
    let tnc_bind = (config.tnc_host.clone(), config.tnc_port);
    let agwpe_bind = (config.agwpe_host.clone(), config.agwpe_port);
    let webui_bind = (config.webui_host.clone(), config.webui_port);
    let beacon_enabled = config.beacon;
    let beacon_interval = config.beacon_interval.max(1);

    let shared_config = Arc::new(parking_lot::RwLock::new(config));
    let shutdown = CancellationToken::new();

    // transport and the serialized transmit path
    let (rx_bytes_sender, rx_bytes) = mpsc::channel(256);
    let transport = Transport::spawn(transport_config, rx_bytes_sender, shutdown.clone());
    let scheduler = Scheduler::spawn(transport.writer(), txdelay, shutdown.clone());

    // the TNC takes its channel-access parameters once at startup
    for parameter in [
        kiss::encode_parameter(0, kiss::FrameKind::TxDelay, txdelay),
        kiss::encode_parameter(0, kiss::FrameKind::Persistence, 63),
        kiss::encode_parameter(0, kiss::FrameKind::SlotTime, 10),
    ] {
        scheduler.send(Priority::User, parameter).await;
    }

    // fan-out plumbing
    let (rx_kiss, _) = broadcast::channel(256);
    let (monitor, _) = broadcast::channel(256);
    let (link_frames_sender, link_frames) = mpsc::channel(64);
    let events = EventBus::new();

    let engine = Engine::spawn(
        EngineSetup {
            config: shared_config.clone(),
            scheduler: scheduler.clone(),
            rx_kiss: rx_kiss.clone(),
            monitor: monitor.clone(),
            link_frames: link_frames_sender,
            events: events.clone(),
            transport_state: transport.state_watch(),
            db_path: station::persist::default_path(),
            framebuf_path: FrameBuffer::default_path(),
        },
        rx_bytes,
        shutdown.clone(),
    );

    // KISS pass-through bridge
    let kiss_listener = tokio::net::TcpListener::bind(tnc_bind).await?;
    tokio::spawn({
        let engine = engine.clone();
        let rx_kiss = rx_kiss.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(error) = bridge::kiss::serve(kiss_listener, engine, rx_kiss, shutdown).await {
                tracing::error!(?error, "KISS bridge stopped");
            }
        }
    });

    // AGWPE bridge with the connected-mode engine behind it
    let agwpe_listener = tokio::net::TcpListener::bind(agwpe_bind).await?;
    let agwpe = bridge::agwpe::AgwpeServer::new(
        agwpe_listener,
        engine.clone(),
        scheduler.clone(),
        mycall,
        monitor.clone(),
        link_frames,
        shutdown.clone(),
    );
    tokio::spawn(async move {
        if let Err(error) = agwpe.serve().await {
            tracing::error!(?error, "AGWPE bridge stopped");
        }
    });

    // web API + SSE
    let api = Api {
        engine: engine.clone(),
        config: shared_config.clone(),
        config_path,
        events,
        shutdown: shutdown.clone(),
    };
    tokio::spawn(async move {
        if let Err(error) = api.serve(webui_bind).await {
            tracing::error!(?error, "web API stopped");
        }
    });

    if beacon_enabled {
        tokio::spawn(beacon_loop(engine.clone(), beacon_interval, shutdown.clone()));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    shutdown.cancel();

    // let the scheduler drain and the engine persist
    engine.persist().await;
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    Ok(())
}

fn select_transport(args: &Args, config: &Config) -> Result<TransportConfig, Error> {
    if let Some(path) = &args.serial {
        return Ok(TransportConfig::Serial {
            path: path.clone(),
            baud: args.baud,
        });
    }
    if let Some(target) = &args.tcp {
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| eyre!("--tcp expects HOST:PORT"))?;
        return Ok(TransportConfig::Tcp {
            host: host.to_owned(),
            port: port.parse()?,
        });
    }
    if args.ble || !config.radio_mac.is_empty() {
        if config.radio_mac.is_empty() {
            return Err(eyre!("--ble requires RADIO_MAC in the configuration"));
        }
        return Ok(TransportConfig::Ble {
            mac: config.radio_mac.clone(),
        });
    }
    Err(eyre!(
        "no TNC configured: pass --serial, --tcp, or set RADIO_MAC and pass --ble"
    ))
}

/// Fixed-position beacon ticker, driven by `MYLOCATION`.
async fn beacon_loop(engine: Engine, interval_minutes: u64, shutdown: CancellationToken) {
    let mut ticker =
        tokio::time::interval(std::time::Duration::from_secs(interval_minutes * 60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(error) = engine.send_beacon().await {
                    tracing::warn!(%error, "beacon not sent");
                }
            }
        }
    }
}

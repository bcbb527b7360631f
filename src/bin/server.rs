use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};
use structopt::StructOpt;
use tokio::sync::mpsc;
use uuid::Uuid;

use reichat::config::{Config, DataMode};
use reichat::engine::{Command, Engine};
use reichat::network::DEFAULT_PORT;
use reichat::store::{self, SnapshotStore};
use reichat::{broker, http, Canvas};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "reichat-server",
    about = "A multi-user paint chat room server, written in Rust",
    author
)]
struct Opt {
    /// Path to a JSON config file
    #[structopt(short, long)]
    config: Option<PathBuf>,

    /// IP/hostname to listen on
    #[structopt(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[structopt(short, long, default_value = DEFAULT_PORT)]
    port: u16,

    /// Room title
    #[structopt(long)]
    title: Option<String>,

    /// Canvas width
    #[structopt(short, long)]
    width: Option<u32>,

    /// Canvas height
    #[structopt(short = "H", long)]
    height: Option<u32>,

    /// Number of layers
    #[structopt(short, long)]
    layers: Option<usize>,

    /// Directory for layer snapshots (enables filesystem persistence)
    #[structopt(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    {
        // init logging
        let mut builder = env_logger::Builder::from_default_env();
        builder.filter(None, log::LevelFilter::Info);
        builder.init();
    }

    let opt = Opt::from_args();
    let mut config = match &opt.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Couldn't load config from {:?}", path))?,
        None => Config::default(),
    };
    if let Some(title) = opt.title.clone() {
        config.title = title;
    }
    if let Some(width) = opt.width {
        config.canvas_width = width;
    }
    if let Some(height) = opt.height {
        config.canvas_height = height;
    }
    if let Some(layers) = opt.layers {
        config.layer_count = layers;
    }
    if let Some(dir) = opt.data_dir.clone() {
        config.data_dir = Some(dir.to_string_lossy().into_owned());
    }

    let server_id = Uuid::new_v4();
    info!(
        "server {} hosting {:?}: {}x{}, {} layers",
        server_id, config.title, config.canvas_width, config.canvas_height, config.layer_count
    );

    let canvas = Canvas::new(config.canvas_width, config.canvas_height, config.layer_count);
    let (mut engine, handle) = Engine::new(server_id, config.clone(), canvas);

    let mut snapshots = match config.data_mode() {
        DataMode::Fs => {
            let dir = PathBuf::from(config.data_dir.clone().unwrap_or_default());
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Couldn't create data dir {:?}", dir))?;
            info!("persisting layers under {:?}", dir);
            Some(SnapshotStore::fs(dir, config.data_file_prefix.clone()))
        }
        DataMode::Broker => match broker_store(&config).await {
            Ok(store) => Some(store),
            Err(e) => {
                warn!("broker store unavailable: {}; persistence disabled", e);
                None
            }
        },
        DataMode::None => None,
    };

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    if snapshots.is_some() {
        engine.set_signals(signal_tx);
    }
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let broker_mode = config.redis_host.is_some();
    if broker_mode {
        engine.set_broker(frame_tx);
    }
    tokio::spawn(engine.run());

    // Startup gates on the snapshot preload; the listener opens only once
    // every layer has been loaded or confirmed absent.
    let mut persist_task = None;
    if let Some(mut store) = snapshots.take() {
        store::preload(&mut store, &handle, config.layer_count).await;
        persist_task = Some(tokio::spawn(store::run_persist(
            store,
            handle.clone(),
            signal_rx,
        )));
    }

    if broker_mode {
        if let Some(url) = config.redis_url() {
            let engine = handle.clone();
            let prefix = config.redis_key_prefix.clone();
            tokio::spawn(async move {
                if let Err(e) = broker::run(&url, prefix, server_id, engine, frame_rx).await {
                    warn!("broker link failed: {}; continuing single-host", e);
                }
            });
        }
    }

    let state = http::AppState {
        engine: handle.clone(),
        config: Arc::new(config),
    };
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind((opt.host.as_str(), opt.port))
        .await
        .with_context(|| format!("Couldn't bind {}:{}", opt.host, opt.port))?;
    info!("Listening at http://{}/", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Stop intake, then let the persist queue drain before exiting.
    handle.send(Command::Shutdown);
    if let Some(task) = persist_task {
        let _ = task.await;
    }
    Ok(())
}

async fn broker_store(config: &Config) -> anyhow::Result<SnapshotStore> {
    let url = config.redis_url().context("redis host not configured")?;
    let client = redis::Client::open(url.as_str())?;
    let conn = client.get_multiplexed_async_connection().await?;
    Ok(SnapshotStore::broker(
        conn,
        config.redis_key_prefix.clone(),
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}

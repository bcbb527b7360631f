//! Layer snapshot persistence.
//!
//! One snapshot blob per layer, in a file under the data dir or under a
//! broker key, never both. The store never touches the canvas directly:
//! loads go through the engine (which checks dimensions and kicks attached
//! sockets), and writes fetch the engine's cached encoding.

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;

use log::{debug, info, warn};
use redis::AsyncCommands;
use thiserror::Error;
use tokio::fs;
use tokio::sync::mpsc;

use crate::codec::{self, SNAPSHOT_EXT};
use crate::engine::{EngineHandle, LayerSignal};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("filesystem error")]
    Io(#[from] io::Error),
    #[error("broker error")]
    Broker(#[from] redis::RedisError),
}

pub enum SnapshotStore {
    Fs {
        dir: PathBuf,
        prefix: String,
    },
    Broker {
        conn: redis::aio::MultiplexedConnection,
        prefix: String,
    },
}

impl SnapshotStore {
    pub fn fs(dir: PathBuf, prefix: String) -> Self {
        SnapshotStore::Fs { dir, prefix }
    }

    pub fn broker(conn: redis::aio::MultiplexedConnection, prefix: String) -> Self {
        SnapshotStore::Broker { conn, prefix }
    }

    /// Where layer `n` lives, for log lines.
    pub fn describe(&self, n: usize) -> String {
        match self {
            SnapshotStore::Fs { dir, prefix } => dir
                .join(format!("{}layer{}.{}", prefix, n, SNAPSHOT_EXT))
                .display()
                .to_string(),
            SnapshotStore::Broker { prefix, .. } => format!("{}layer:{}", prefix, n),
        }
    }

    pub async fn load(&mut self, n: usize) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            SnapshotStore::Fs { dir, prefix } => {
                let path = dir.join(format!("{}layer{}.{}", prefix, n, SNAPSHOT_EXT));
                match fs::read(&path).await {
                    Ok(blob) => Ok(Some(blob)),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
            SnapshotStore::Broker { conn, prefix } => {
                let key = format!("{}layer:{}", prefix, n);
                let blob: Option<Vec<u8>> = conn.get(&key).await?;
                Ok(blob.filter(|b| !b.is_empty()))
            }
        }
    }

    pub async fn save(&mut self, n: usize, blob: &[u8]) -> Result<(), StoreError> {
        match self {
            SnapshotStore::Fs { dir, prefix } => {
                let path = dir.join(format!("{}layer{}.{}", prefix, n, SNAPSHOT_EXT));
                fs::write(&path, blob).await?;
                Ok(())
            }
            SnapshotStore::Broker { conn, prefix } => {
                let key = format!("{}layer:{}", prefix, n);
                conn.set::<_, _, ()>(&key, blob).await?;
                Ok(())
            }
        }
    }
}

/// Load every layer snapshot into the engine, one by one.
///
/// Startup gates on this: the listener only opens once every layer has
/// either been loaded or confirmed absent. A snapshot that does not decode,
/// or whose dimensions differ from the canvas, is discarded with a warning
/// and the layer starts blank.
pub async fn preload(store: &mut SnapshotStore, engine: &EngineHandle, layer_count: usize) {
    for n in 0..layer_count {
        match store.load(n).await {
            Ok(Some(blob)) => match codec::decode(&blob) {
                Ok(raster) => {
                    if engine.load_layer(n, raster, blob).await {
                        info!("layer {} loaded from {}", n, store.describe(n));
                    }
                }
                Err(e) => warn!("layer {}: discarding unreadable snapshot: {}", n, e),
            },
            Ok(None) => debug!("layer {}: no snapshot, starting blank", n),
            Err(e) => warn!("layer {}: snapshot load failed: {}", n, e),
        }
    }
}

/// Write back snapshots for changed layers until the engine goes away.
///
/// Signals queued while a write is in flight coalesce into one write per
/// layer. A failed write is logged and retried on the layer's next change.
/// When the engine shuts down and drops its sender, the remaining queue is
/// drained before this task exits.
pub async fn run_persist(
    mut store: SnapshotStore,
    engine: EngineHandle,
    mut signals: mpsc::UnboundedReceiver<LayerSignal>,
) {
    while let Some(first) = signals.recv().await {
        let mut dirty = BTreeSet::new();
        note(first, &mut dirty);
        while let Ok(signal) = signals.try_recv() {
            note(signal, &mut dirty);
        }
        for n in dirty {
            if let Some(blob) = engine.layer_snapshot(n).await {
                match store.save(n, &blob).await {
                    Ok(()) => debug!("layer {} persisted to {}", n, store.describe(n)),
                    Err(e) => warn!("layer {}: snapshot write failed: {}", n, e),
                }
            }
        }
    }
    debug!("persist queue drained");
}

/// Replicated updates keep the raster coherent but only the authoritative
/// originator writes to the store.
fn note(signal: LayerSignal, dirty: &mut BTreeSet<usize>) {
    if let LayerSignal::Change(n) = signal {
        dirty.insert(n);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::canvas::Canvas;
    use crate::config::Config;
    use crate::engine::Engine;
    use uuid::Uuid;

    fn small_config() -> Config {
        let mut cfg = Config::default();
        cfg.canvas_width = 8;
        cfg.canvas_height = 8;
        cfg.layer_count = 2;
        cfg
    }

    fn start_engine(cfg: &Config) -> EngineHandle {
        let canvas = Canvas::new(cfg.canvas_width, cfg.canvas_height, cfg.layer_count);
        let (engine, handle) = Engine::new(Uuid::new_v4(), cfg.clone(), canvas);
        tokio::spawn(engine.run());
        handle
    }

    #[tokio::test]
    async fn fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::fs(dir.path().to_path_buf(), "room-".to_string());

        assert!(store.load(0).await.unwrap().is_none());
        store.save(0, b"blob").await.unwrap();
        assert_eq!(Some(b"blob".to_vec()), store.load(0).await.unwrap());
        assert!(dir.path().join("room-layer0.png").exists());
        // Layers do not share files.
        assert!(store.load(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn preload_discards_mismatched_snapshot() {
        let cfg = small_config();
        let dir = tempfile::tempdir().unwrap();
        // Layer 0: wrong dimensions. Layer 1: matching content.
        let wrong = codec::encode(4, 4, &vec![0u8; 4 * 4 * 4]).unwrap();
        std::fs::write(dir.path().join("layer0.png"), &wrong).unwrap();
        let mut rgba = vec![0u8; 8 * 8 * 4];
        rgba[0..4].copy_from_slice(&[7, 8, 9, 255]);
        let good = codec::encode(8, 8, &rgba).unwrap();
        std::fs::write(dir.path().join("layer1.png"), &good).unwrap();

        let engine = start_engine(&cfg);
        let mut store = SnapshotStore::fs(dir.path().to_path_buf(), String::new());
        preload(&mut store, &engine, cfg.layer_count).await;

        let blank = engine.layer_snapshot(0).await.unwrap();
        assert!(codec::decode(&blank).unwrap().data.iter().all(|b| *b == 0));
        let loaded = engine.layer_snapshot(1).await.unwrap();
        assert_eq!(&[7, 8, 9, 255], &codec::decode(&loaded).unwrap().data[0..4]);
    }

    #[tokio::test]
    async fn preload_ignores_garbage_snapshot() {
        let cfg = small_config();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("layer0.png"), b"not a png").unwrap();

        let engine = start_engine(&cfg);
        let mut store = SnapshotStore::fs(dir.path().to_path_buf(), String::new());
        preload(&mut store, &engine, cfg.layer_count).await;

        let blank = engine.layer_snapshot(0).await.unwrap();
        assert!(codec::decode(&blank).unwrap().data.iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn persist_writes_changes_but_not_updates() {
        let cfg = small_config();
        let dir = tempfile::tempdir().unwrap();
        let engine = start_engine(&cfg);
        let store = SnapshotStore::fs(dir.path().to_path_buf(), String::new());

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(LayerSignal::Change(0)).unwrap();
        tx.send(LayerSignal::Change(0)).unwrap();
        tx.send(LayerSignal::Update(1)).unwrap();
        drop(tx);
        run_persist(store, engine.clone(), rx).await;

        let expected = engine.layer_snapshot(0).await.unwrap();
        assert_eq!(
            expected,
            std::fs::read(dir.path().join("layer0.png")).unwrap()
        );
        assert!(!dir.path().join("layer1.png").exists());
    }
}

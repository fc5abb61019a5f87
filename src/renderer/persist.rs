//! Background persistence of the native pipeline cache.
//!
//! Pipeline compilation notifications wake a dedicated save thread. The thread waits out a
//! cooldown so bursts of compilations coalesce into one save, then serializes the cache blob and
//! writes it to disk. Disk failures are logged and skipped, persistence is strictly best effort
//! and never fails the renderer.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::prelude::*;

#[derive(Clone)]
pub struct PersistConfig {
    /// Directory the cache file is written into. Created on demand.
    pub directory: PathBuf,
    /// Identifies the title the cache belongs to, used as the file name.
    pub title_id: u64,
    /// Number of cooldown ticks between the first notification and the save. The stop flag is
    /// checked every tick so shutdown does not have to wait out the full cooldown.
    pub cooldown_ticks: u32,
    pub tick: Duration,
}

impl PersistConfig {
    pub fn new(directory: PathBuf, title_id: u64) -> Self {
        Self {
            directory,
            title_id,
            cooldown_ticks: 60,
            tick: Duration::from_millis(250),
        }
    }

    pub fn cache_file(&self) -> PathBuf {
        self.directory.join(format!("{:016x}.bin", self.title_id))
    }
}

/// Reads a previously persisted cache blob. Returns [`None`] if there is none or it cannot be
/// read, the renderer then starts with an empty pipeline cache.
pub fn load_cache_blob(directory: &Path, title_id: u64) -> Option<Vec<u8>> {
    let path = directory.join(format!("{:016x}.bin", title_id));
    match std::fs::read(&path) {
        Ok(data) => {
            log::info!("Loaded pipeline cache blob ({} bytes) from {:?}", data.len(), path);
            Some(data)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            log::warn!("Failed to read pipeline cache blob {:?}: {}", path, err);
            None
        }
    }
}

struct PersistChannel {
    dirty: u64,
    stop: bool,
}

struct PersistShared {
    device: Arc<DeviceContext>,
    config: PersistConfig,
    channel: Mutex<PersistChannel>,
    condvar: Condvar,
    save_lock: RwLock<()>,
}

impl PersistShared {
    fn lock_channel(&self) -> MutexGuard<PersistChannel> {
        match self.channel.lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::error!("Poisoned pipeline cache channel mutex");
                panic!()
            }
        }
    }

    fn stop_requested(&self) -> bool {
        self.lock_channel().stop
    }

    /// Serializes the pipeline cache and writes it out if its size changed since the last save.
    fn save(&self, last_size: &mut usize) {
        // Creation guards are held only for the duration of a pipeline creation call, so a short
        // spin is enough to get exclusive access.
        let guard = loop {
            match self.save_lock.try_write() {
                Some(guard) => break guard,
                None => std::thread::sleep(Duration::from_micros(50)),
            }
        };
        let data = match self.device.get_backend().pipeline_cache_data() {
            Ok(data) => data,
            Err(err) => {
                log::error!("Failed to serialize pipeline cache: {:?}", err);
                return;
            }
        };
        drop(guard);

        if data.len() == *last_size {
            return;
        }
        *last_size = data.len();

        if let Err(err) = std::fs::create_dir_all(&self.config.directory) {
            log::error!("Failed to create pipeline cache directory {:?}: {}", self.config.directory, err);
            return;
        }
        let path = self.config.cache_file();
        match std::fs::write(&path, &data) {
            Ok(()) => log::debug!("Saved pipeline cache ({} bytes) to {:?}", data.len(), path),
            Err(err) => log::error!("Failed to write pipeline cache {:?}: {}", path, err),
        }
    }

    fn run_worker(&self) {
        let mut last_size = 0usize;
        loop {
            let mut guard = self.lock_channel();
            while guard.dirty == 0 && !guard.stop {
                guard = match self.condvar.wait(guard) {
                    Ok(guard) => guard,
                    Err(_) => {
                        log::error!("Poisoned pipeline cache channel mutex");
                        panic!()
                    }
                };
            }
            if guard.stop {
                // Final save of anything still pending before shutting down.
                let dirty = guard.dirty > 0;
                drop(guard);
                if dirty {
                    self.save(&mut last_size);
                }
                return;
            }
            guard.dirty = 0;
            drop(guard);

            for _ in 0..self.config.cooldown_ticks {
                if self.stop_requested() {
                    break;
                }
                std::thread::sleep(self.config.tick);
            }

            self.save(&mut last_size);
        }
    }
}

/// Owns the save thread. Dropping it stops the thread, saving pending data first.
pub struct PipelineCachePersistence {
    shared: Arc<PersistShared>,
    worker: Option<JoinHandle<()>>,
}

impl PipelineCachePersistence {
    pub fn new(device: Arc<DeviceContext>, config: PersistConfig) -> Self {
        let shared = Arc::new(PersistShared {
            device,
            config,
            channel: Mutex::new(PersistChannel {
                dirty: 0,
                stop: false,
            }),
            condvar: Condvar::new(),
            save_lock: RwLock::new(()),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("pipeline-cache-save".to_string())
            .spawn(move || worker_shared.run_worker())
            .ok();
        if worker.is_none() {
            log::error!("Failed to spawn pipeline cache save thread, persistence disabled");
        }

        Self {
            shared,
            worker,
        }
    }

    /// Called after every successful pipeline creation.
    pub fn notify_pipeline_compiled(&self) {
        let mut guard = self.shared.lock_channel();
        guard.dirty += 1;
        drop(guard);
        self.shared.condvar.notify_one();
    }

    /// Guard to hold while creating pipelines against the native cache.
    ///
    /// The save thread takes the lock exclusively while serializing, so creation and
    /// serialization never overlap.
    pub fn creation_guard(&self) -> RwLockReadGuard<()> {
        self.shared.save_lock.read()
    }
}

impl Drop for PipelineCachePersistence {
    fn drop(&mut self) {
        {
            let mut guard = self.shared.lock_channel();
            guard.stop = true;
        }
        self.shared.condvar.notify_one();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Pipeline cache save thread panicked");
            }
        }
    }
}

assert_impl_all!(PipelineCachePersistence: Send, Sync);

#[cfg(test)]
mod test {
    use std::time::Instant;

    use super::*;
    use crate::test::create_mock_device;

    fn test_config(name: &str) -> PersistConfig {
        let directory = std::env::temp_dir()
            .join(format!("furnace-persist-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&directory);
        PersistConfig {
            directory,
            title_id: 0x0005000e_1010ed00,
            cooldown_ticks: 1,
            tick: Duration::from_millis(1),
        }
    }

    fn wait_for<F: Fn() -> bool>(predicate: F) {
        let start = Instant::now();
        while !predicate() {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn load_returns_none_without_file() {
        let config = test_config("load-none");
        assert_eq!(load_cache_blob(&config.directory, config.title_id), None);
    }

    #[test]
    fn save_and_load_round_trip() {
        crate::init_test_env();
        let config = test_config("round-trip");
        let (device, backend) = create_mock_device();
        backend.set_pipeline_cache_data(vec![1, 2, 3, 4]);

        let persistence = PipelineCachePersistence::new(device, config.clone());
        persistence.notify_pipeline_compiled();
        wait_for(|| config.cache_file().exists());

        assert_eq!(load_cache_blob(&config.directory, config.title_id), Some(vec![1, 2, 3, 4]));
        drop(persistence);
        let _ = std::fs::remove_dir_all(&config.directory);
    }

    #[test]
    fn unchanged_size_is_not_rewritten() {
        crate::init_test_env();
        let config = test_config("size-skip");
        let (device, backend) = create_mock_device();
        backend.set_pipeline_cache_data(vec![1, 2, 3, 4]);

        let persistence = PipelineCachePersistence::new(device, config.clone());
        persistence.notify_pipeline_compiled();
        wait_for(|| config.cache_file().exists());

        // Same size, different content. The save thread must skip the write.
        std::fs::write(config.cache_file(), [9u8, 9, 9, 9]).unwrap();
        backend.set_pipeline_cache_data(vec![5, 6, 7, 8]);
        persistence.notify_pipeline_compiled();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(std::fs::read(config.cache_file()).unwrap(), vec![9, 9, 9, 9]);

        // A size change goes through again.
        backend.set_pipeline_cache_data(vec![1, 2, 3, 4, 5]);
        persistence.notify_pipeline_compiled();
        wait_for(|| std::fs::read(config.cache_file()).unwrap() == vec![1, 2, 3, 4, 5]);

        drop(persistence);
        let _ = std::fs::remove_dir_all(&config.directory);
    }

    #[test]
    fn shutdown_saves_pending_data() {
        crate::init_test_env();
        let config = test_config("shutdown");
        let (device, backend) = create_mock_device();
        backend.set_pipeline_cache_data(vec![7; 16]);

        let persistence = PipelineCachePersistence::new(device, PersistConfig {
            // Long cooldown, the drop must not wait it out.
            cooldown_ticks: 10_000,
            tick: Duration::from_millis(250),
            ..config.clone()
        });
        persistence.notify_pipeline_compiled();

        let start = Instant::now();
        drop(persistence);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(load_cache_blob(&config.directory, config.title_id), Some(vec![7; 16]));

        let _ = std::fs::remove_dir_all(&config.directory);
    }

    #[test]
    fn creation_guard_blocks_serialization() {
        crate::init_test_env();
        let config = test_config("guard");
        let (device, _backend) = create_mock_device();
        let persistence = PipelineCachePersistence::new(device, config.clone());

        // Multiple creation guards may coexist.
        let a = persistence.creation_guard();
        let b = persistence.creation_guard();
        drop(a);
        drop(b);

        drop(persistence);
        let _ = std::fs::remove_dir_all(&config.directory);
    }
}

//! Time indexed volume cache with background prefetching.
//!
//! The cache keeps the volumes of a circular "desired window"
//! `{pos, pos + 1, .., pos + depth} mod frame_count` resident. A
//! [`PrefetchWorker`] reconciles the loaded entries with that window in the
//! background while [`VolumeCache::get`] always returns data, loading
//! synchronously on a miss.

use crate::prefetch::PrefetchWorker;
use crate::volume::Volume;
use crate::volume_loader::{EmptyLoader, LoadError, VolumeLoader};

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use web_time::Instant;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Time index {index} is outside of [0, {frame_count})")]
    IndexOutOfRange { index: usize, frame_count: usize },

    #[error("Loading failed: {0}")]
    Load(#[from] LoadError),
}

/// State shared between the consumer and the prefetch worker.
pub(crate) struct CacheState {
    pub(crate) entries: HashMap<usize, Arc<Volume>>,
    /// Desired keys, ordered by distance from the position.
    pub(crate) window: Vec<usize>,
    pub(crate) position: usize,
    /// Bumped whenever the loader changes, so loads started against an old
    /// loader are never inserted.
    pub(crate) generation: u64,
}

impl CacheState {
    pub(crate) fn is_desired(&self, key: usize) -> bool {
        self.window.contains(&key)
    }
}

/// The circular window of `depth + 1` indices starting at `position`, ordered
/// by ascending distance. Indices repeat once the window wraps onto itself,
/// those repeats are dropped.
pub fn desired_window(position: usize, depth: usize, frame_count: usize) -> Vec<usize> {
    if frame_count == 0 {
        return Vec::new();
    }
    let len = depth.saturating_add(1).min(frame_count);
    (0..len).map(|offset| (position + offset) % frame_count).collect()
}

pub struct VolumeCache {
    state: Arc<RwLock<CacheState>>,
    loader: Arc<dyn VolumeLoader>,
    prefetch_depth: usize,
    worker: Option<PrefetchWorker>,
}

impl Default for VolumeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeCache {
    /// An empty cache backed by [`EmptyLoader`].
    pub fn new() -> Self {
        Self::with_loader(Arc::new(EmptyLoader), 0)
    }

    pub fn with_loader(loader: Arc<dyn VolumeLoader>, prefetch_depth: usize) -> Self {
        let state = CacheState {
            entries: HashMap::new(),
            window: Vec::new(),
            position: 0,
            generation: 0,
        };
        let mut cache = Self {
            state: Arc::new(RwLock::new(state)),
            loader: Arc::new(EmptyLoader),
            prefetch_depth: 0,
            worker: None,
        };
        cache.set_container(loader, prefetch_depth);
        cache
    }

    /// Swap the backing loader. All entries are dropped since the indices of
    /// the old loader mean nothing to the new one; the position resets to 0.
    pub fn set_container(&mut self, loader: Arc<dyn VolumeLoader>, prefetch_depth: usize) {
        // Joins the old worker; at most one in-flight load is waited for.
        self.worker = None;
        self.loader = loader;
        self.prefetch_depth = prefetch_depth;

        let generation = {
            let mut state = self.state.write();
            state.entries.clear();
            state.generation += 1;
            state.position = 0;
            state.window = desired_window(0, prefetch_depth, self.loader.frame_count());
            state.generation
        };

        log::info!(
            "data source changed: {} ({} frames, prefetch depth {})",
            self.loader.name(),
            self.loader.frame_count(),
            prefetch_depth
        );

        if prefetch_depth > 0 {
            self.worker = Some(PrefetchWorker::spawn(
                Arc::clone(&self.state),
                Arc::clone(&self.loader),
                generation,
            ));
        }
    }

    /// Move the desired window to `index` with the current prefetch depth.
    pub fn set_position(&self, index: usize) -> Result<(), CacheError> {
        self.check_index(index)?;
        self.move_window(index);
        Ok(())
    }

    /// Move the desired window and change the prefetch depth. Starts or stops
    /// the prefetch worker when the depth crosses zero.
    pub fn set_position_with_depth(&mut self, index: usize, prefetch_depth: usize) -> Result<(), CacheError> {
        self.check_index(index)?;
        self.prefetch_depth = prefetch_depth;
        if prefetch_depth == 0 {
            self.worker = None;
        } else if self.worker.is_none() {
            let generation = self.state.read().generation;
            self.worker = Some(PrefetchWorker::spawn(
                Arc::clone(&self.state),
                Arc::clone(&self.loader),
                generation,
            ));
        }
        self.move_window(index);
        Ok(())
    }

    /// The volume of time point `index`.
    ///
    /// A hit only takes the read lock. A miss loads the frame on the calling
    /// thread, which may stall for the duration of one load. When prefetching
    /// is enabled the desired window follows `index`.
    pub fn get(&self, index: usize) -> Result<Arc<Volume>, CacheError> {
        self.check_index(index)?;

        let cached = self.state.read().entries.get(&index).cloned();
        let volume = match cached {
            Some(volume) => volume,
            None => {
                let start = Instant::now();
                let volume = Arc::new(self.loader.load(index)?);
                log::debug!(
                    "loaded frame {} synchronously in {:?}",
                    index,
                    start.elapsed()
                );
                let mut state = self.state.write();
                Arc::clone(state.entries.entry(index).or_insert(volume))
            }
        };

        self.move_window(index);
        Ok(volume)
    }

    pub fn frame_count(&self) -> usize {
        self.loader.frame_count()
    }

    pub fn voxel_spacing(&self) -> (f32, f32, f32) {
        self.loader.voxel_spacing()
    }

    pub fn name(&self) -> &str {
        self.loader.name()
    }

    pub fn prefetch_depth(&self) -> usize {
        self.prefetch_depth
    }

    pub fn position(&self) -> usize {
        self.state.read().position
    }

    pub fn loaded_keys(&self) -> BTreeSet<usize> {
        self.state.read().entries.keys().copied().collect()
    }

    pub fn desired_window(&self) -> BTreeSet<usize> {
        self.state.read().window.iter().copied().collect()
    }

    pub fn is_loaded(&self, index: usize) -> bool {
        self.state.read().entries.contains_key(&index)
    }

    /// Block until the loaded entries match the desired window or `timeout`
    /// elapses. Returns whether the cache settled.
    pub fn wait_until_settled(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            {
                let state = self.state.read();
                let window: BTreeSet<usize> = state.window.iter().copied().collect();
                let loaded: BTreeSet<usize> = state.entries.keys().copied().collect();
                if window == loaded {
                    return true;
                }
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn check_index(&self, index: usize) -> Result<(), CacheError> {
        let frame_count = self.loader.frame_count();
        if index >= frame_count {
            return Err(CacheError::IndexOutOfRange { index, frame_count });
        }
        Ok(())
    }

    /// Only upgrades to the write lock when the window moves or, without a
    /// worker, when entries outside the window have to be evicted.
    fn move_window(&self, index: usize) {
        let window = desired_window(index, self.prefetch_depth, self.loader.frame_count());
        // Without a worker nobody else evicts.
        let evict = self.worker.is_none();
        {
            let state = self.state.upgradable_read();
            let has_stale = evict && state.entries.keys().any(|key| !window.contains(key));
            if state.position == index && state.window == window && !has_stale {
                return;
            }
            let mut state = RwLockUpgradableReadGuard::upgrade(state);
            if evict {
                state.entries.retain(|key, _| window.contains(key));
            }
            state.position = index;
            state.window = window;
        }
        log::debug!("data position changed to {}", index);
        if let Some(worker) = &self.worker {
            worker.wake();
        }
    }
}

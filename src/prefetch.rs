use crate::cache::CacheState;
use crate::volume_loader::VolumeLoader;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use web_time::Instant;

/// Pause after a pass that loaded or evicted something.
const BUSY_YIELD: Duration = Duration::from_millis(1);
/// Pause after a pass with nothing to do. A position change ends it early.
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Background thread keeping the cache entries in line with the desired
/// window. Dropping the worker stops it and joins the thread; a load in
/// progress is finished first.
pub(crate) struct PrefetchWorker {
    stopped: Arc<AtomicBool>,
    wake: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl PrefetchWorker {
    pub(crate) fn spawn(
        state: Arc<RwLock<CacheState>>,
        loader: Arc<dyn VolumeLoader>,
        generation: u64,
    ) -> Self {
        let stopped = Arc::new(AtomicBool::new(false));
        let (wake, wake_rx) = crossbeam_channel::bounded(1);

        let thread_stopped = Arc::clone(&stopped);
        let handle = std::thread::Builder::new()
            .name("volume-prefetch".to_string())
            .spawn(move || run(state, loader, generation, thread_stopped, wake_rx));

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(err) => {
                // The cache still works without it, `get` loads on demand.
                log::error!("could not start prefetch thread: {}", err);
                None
            }
        };

        Self {
            stopped,
            wake,
            handle,
        }
    }

    /// Nudge the worker after the desired window changed.
    pub(crate) fn wake(&self) {
        // A full channel already holds a pending wake up.
        let _ = self.wake.try_send(());
    }
}

impl Drop for PrefetchWorker {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        self.wake();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("prefetch thread panicked");
            }
        }
    }
}

fn run(
    state: Arc<RwLock<CacheState>>,
    loader: Arc<dyn VolumeLoader>,
    generation: u64,
    stopped: Arc<AtomicBool>,
    wake: Receiver<()>,
) {
    log::debug!("prefetch worker started for {}", loader.name());

    while !stopped.load(Ordering::Acquire) {
        let busy = reconcile(&state, loader.as_ref(), generation, &stopped);

        let pause = if busy { BUSY_YIELD } else { IDLE_WAIT };
        match wake.recv_timeout(pause) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    log::debug!("prefetch worker stopped for {}", loader.name());
}

/// One pass: evict stale entries, then load the missing ones nearest first.
/// Returns whether any entry changed.
fn reconcile(
    state: &RwLock<CacheState>,
    loader: &dyn VolumeLoader,
    generation: u64,
    stopped: &AtomicBool,
) -> bool {
    let (stale, missing) = {
        let state = state.read();
        if state.generation != generation {
            return false;
        }
        let stale: Vec<usize> = state
            .entries
            .keys()
            .copied()
            .filter(|&key| !state.is_desired(key))
            .collect();
        // `window` is already ordered by distance from the position.
        let missing: Vec<usize> = state
            .window
            .iter()
            .copied()
            .filter(|key| !state.entries.contains_key(key))
            .collect();
        (stale, missing)
    };

    let mut changed = false;

    if !stale.is_empty() {
        let mut state = state.write();
        for key in stale {
            // The window may have moved back over `key` meanwhile.
            if !state.is_desired(key) && state.entries.remove(&key).is_some() {
                log::debug!("evicted frame {}", key);
                changed = true;
            }
        }
    }

    if !missing.is_empty() {
        log::debug!("preloading {:?}", missing);
    }

    for key in missing {
        if stopped.load(Ordering::Acquire) {
            break;
        }
        {
            let state = state.read();
            if state.generation != generation
                || !state.is_desired(key)
                || state.entries.contains_key(&key)
            {
                continue;
            }
        }

        let start = Instant::now();
        match loader.load(key) {
            Ok(volume) => {
                let mut state = state.write();
                if state.generation == generation && state.is_desired(key) {
                    state.entries.entry(key).or_insert_with(|| Arc::new(volume));
                    changed = true;
                    log::debug!("preload: {} in {:?}", key, start.elapsed());
                }
            }
            Err(err) => {
                log::warn!("prefetch of frame {} failed: {}", key, err);
            }
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::desired_window;
    use crate::volume_loader::InMemoryLoader;
    use ndarray::Array4;
    use std::collections::HashMap;

    fn state_at(position: usize, depth: usize, frame_count: usize) -> Arc<RwLock<CacheState>> {
        Arc::new(RwLock::new(CacheState {
            entries: HashMap::new(),
            window: desired_window(position, depth, frame_count),
            position,
            generation: 1,
        }))
    }

    #[test]
    fn test_reconcile_loads_and_evicts() {
        let loader = InMemoryLoader::new(Array4::zeros((5, 1, 1, 1)), (1.0, 1.0, 1.0));
        let state = state_at(3, 2, 5);
        let stopped = AtomicBool::new(false);

        assert!(reconcile(&state, &loader, 1, &stopped));
        let mut keys: Vec<usize> = state.read().entries.keys().copied().collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![0, 3, 4]);

        state.write().window = desired_window(1, 0, 5);
        assert!(reconcile(&state, &loader, 1, &stopped));
        let keys: Vec<usize> = state.read().entries.keys().copied().collect();
        assert_eq!(keys, vec![1]);

        // Nothing left to do.
        assert!(!reconcile(&state, &loader, 1, &stopped));
    }

    #[test]
    fn test_reconcile_ignores_stale_generation() {
        let loader = InMemoryLoader::new(Array4::zeros((3, 1, 1, 1)), (1.0, 1.0, 1.0));
        let state = state_at(0, 2, 3);
        let stopped = AtomicBool::new(false);

        assert!(!reconcile(&state, &loader, 0, &stopped));
        assert!(state.read().entries.is_empty());
    }

    #[test]
    fn test_drop_stops_worker() {
        let loader: Arc<dyn VolumeLoader> =
            Arc::new(InMemoryLoader::new(Array4::zeros((4, 1, 1, 1)), (1.0, 1.0, 1.0)));
        let state = state_at(0, 1, 4);
        let worker = PrefetchWorker::spawn(Arc::clone(&state), loader, 1);
        worker.wake();
        drop(worker);
        // Only the test still holds the state once the thread has exited.
        assert_eq!(Arc::strong_count(&state), 1);
    }
}

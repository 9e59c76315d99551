use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::MAX_TOTAL_FRAMES;
use super::frame::{FrameCore, FrameDescriptor, TextureFormat, TextureFrame};
use crate::config::TexturePoolConfig;
use crate::error::{BridgeError, Result};

/// Snapshot of a pool's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub in_use: usize,
    /// Frames allocated over the pool's lifetime.
    pub created: u64,
    /// Frames destroyed because they no longer matched the target descriptor.
    pub evicted: u64,
}

struct PoolState {
    target: FrameDescriptor,
    available: VecDeque<Arc<FrameCore>>,
    in_use: HashMap<Uuid, Arc<FrameCore>>,
    disposed: bool,
    created: u64,
    evicted: u64,
}

impl PoolState {
    fn total(&self) -> usize {
        self.available.len() + self.in_use.len()
    }
}

struct PoolShared {
    capacity: usize,
    state: RwLock<PoolState>,
}

impl PoolShared {
    fn on_frame_released(&self, id: Uuid) {
        let mut state = self.state.write();
        if state.disposed {
            trace!(frame = %id, "frame returned to a disposed pool");
            return;
        }
        match state.in_use.remove(&id) {
            Some(frame) => {
                state.available.push_back(frame);
                trace!(frame = %id, available = state.available.len(), "frame returned to pool");
            }
            None => warn!(frame = %id, "released frame is not in use by this pool"),
        }
    }
}

/// A bounded pool of texture frames.
///
/// `try_acquire` never blocks on capacity: a saturated pool returns `Ok(None)`
/// and the caller retries on a later tick. Frames can be released from any
/// thread, including the pipeline's.
pub struct TextureFramePool {
    shared: Arc<PoolShared>,
}

impl TextureFramePool {
    pub fn new(width: u32, height: u32, format: TextureFormat, capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > MAX_TOTAL_FRAMES {
            return Err(BridgeError::invalid_argument(format!(
                "pool capacity must be between 1 and {MAX_TOTAL_FRAMES}, got {capacity}"
            )));
        }
        let target = FrameDescriptor::new(width, height, format);
        target.validate()?;
        debug!(%target, capacity, "texture frame pool created");
        Ok(Self {
            shared: Arc::new(PoolShared {
                capacity,
                state: RwLock::new(PoolState {
                    target,
                    available: VecDeque::with_capacity(capacity),
                    in_use: HashMap::with_capacity(capacity),
                    disposed: false,
                    created: 0,
                    evicted: 0,
                }),
            }),
        })
    }

    pub fn from_config(config: &TexturePoolConfig) -> Result<Self> {
        Self::new(config.width, config.height, config.format, config.capacity)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Descriptor new and reused frames must match.
    pub fn target(&self) -> FrameDescriptor {
        self.shared.state.read().target
    }

    /// Changes the target descriptor.
    ///
    /// Frames in use finish their round trip untouched; returned frames that
    /// no longer match are evicted on a later acquire.
    pub fn resize(&self, width: u32, height: u32, format: TextureFormat) -> Result<()> {
        let target = FrameDescriptor::new(width, height, format);
        target.validate()?;
        let mut state = self.shared.state.write();
        if state.target != target {
            debug!(from = %state.target, to = %target, "texture frame pool resized");
            state.target = target;
        }
        Ok(())
    }

    /// Leases a frame matching the current target.
    ///
    /// Returns `Ok(None)` when every frame of this pool is in use. If the frame
    /// was released with a sync token, this waits for it before returning.
    ///
    /// Frames of every pool share one process-wide registry. When that
    /// registry is full, creating a frame fails with
    /// [`BridgeError::CapacityExceeded`] even though this pool has room.
    pub fn try_acquire(&self) -> Result<Option<TextureFrame>> {
        let frame = {
            let mut state = self.shared.state.write();
            if state.disposed {
                return Err(BridgeError::use_after_free("TextureFramePool"));
            }
            loop {
                if state.total() < self.shared.capacity {
                    let frame = FrameCore::create(state.target)?;
                    let pool = Arc::downgrade(&self.shared);
                    frame.add_listener(Arc::new(move |id| release_into(&pool, id)));
                    state.in_use.insert(frame.id(), Arc::clone(&frame));
                    state.created += 1;
                    break frame;
                }
                let Some(frame) = state.available.pop_front() else {
                    trace!(capacity = self.shared.capacity, "texture frame pool saturated");
                    return Ok(None);
                };
                if frame.descriptor() != state.target {
                    debug!(frame = %frame.id(), stale = %frame.descriptor(), target = %state.target, "evicting stale frame");
                    state.evicted += 1;
                    continue;
                }
                state.in_use.insert(frame.id(), Arc::clone(&frame));
                break frame;
            }
        };
        if let Err(err) = frame.wait_until_released() {
            warn!(frame = %frame.id(), error = %err, "could not wait for previous consumer");
        }
        Ok(Some(TextureFrame::lease(frame)))
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.read();
        PoolStats {
            capacity: self.shared.capacity,
            available: state.available.len(),
            in_use: state.in_use.len(),
            created: state.created,
            evicted: state.evicted,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state.read().disposed
    }

    /// Destroys every returned frame. Frames still leased are destroyed when released.
    ///
    /// Safe to call more than once.
    pub fn dispose(&self) {
        let (available, in_use) = {
            let mut state = self.shared.state.write();
            if state.disposed {
                return;
            }
            state.disposed = true;
            (std::mem::take(&mut state.available), std::mem::take(&mut state.in_use))
        };
        debug!(available = available.len(), in_use = in_use.len(), "texture frame pool disposed");
    }
}

fn release_into(pool: &Weak<PoolShared>, id: Uuid) {
    match pool.upgrade() {
        Some(pool) => pool.on_frame_released(id),
        None => trace!(frame = %id, "frame outlived its pool"),
    }
}

impl Drop for TextureFramePool {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for TextureFramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextureFramePool")
            .field("target", &self.target())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{GlContext, GlSyncPoint};
    use crate::handle::ResourceHandle;
    use crate::native::{Fence, SharedGlSyncToken};
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::time::{Duration, Instant};

    fn pool(capacity: usize) -> TextureFramePool {
        TextureFramePool::new(100, 100, TextureFormat::Rgba32, capacity).unwrap()
    }

    #[test]
    fn capacity_is_validated() {
        assert!(TextureFramePool::new(8, 8, TextureFormat::Rgba32, 0).is_err());
        assert!(TextureFramePool::new(8, 8, TextureFormat::Rgba32, MAX_TOTAL_FRAMES + 1).is_err());
        assert!(TextureFramePool::new(0, 8, TextureFormat::Rgba32, 1).is_err());
    }

    #[test]
    fn saturated_pool_applies_backpressure() {
        let pool = pool(2);
        let a = pool.try_acquire().unwrap().unwrap();
        let _b = pool.try_acquire().unwrap().unwrap();
        assert!(pool.try_acquire().unwrap().is_none());
        assert_eq!(pool.stats().created, 2);

        let id = a.id();
        a.release(None);
        let again = pool.try_acquire().unwrap().unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(pool.stats().created, 2);
    }

    #[test]
    fn dropping_a_lease_returns_the_frame() {
        let pool = pool(1);
        let frame = pool.try_acquire().unwrap().unwrap();
        drop(frame);
        assert_eq!(pool.stats().available, 1);
        assert!(pool.try_acquire().unwrap().is_some());
    }

    #[test]
    fn resize_evicts_stale_frames() {
        let pool = pool(3);
        let frames: Vec<_> = (0..3).map(|_| pool.try_acquire().unwrap().unwrap()).collect();
        frames.into_iter().for_each(|frame| frame.release(None));
        assert_eq!(pool.stats().available, 3);

        pool.resize(200, 200, TextureFormat::Rgba32).unwrap();
        let frames: Vec<_> = (0..3).map(|_| pool.try_acquire().unwrap().unwrap()).collect();
        assert!(frames.iter().all(|frame| (frame.width(), frame.height()) == (200, 200)));
        assert_eq!(pool.stats().evicted, 3);
    }

    #[test]
    fn format_change_makes_frames_stale() {
        let pool = pool(1);
        pool.try_acquire().unwrap().unwrap().release(None);
        pool.resize(100, 100, TextureFormat::Bgra32).unwrap();
        let frame = pool.try_acquire().unwrap().unwrap();
        assert_eq!(frame.format(), TextureFormat::Bgra32);
        assert_eq!(pool.stats().evicted, 1);
    }

    #[test]
    fn frames_in_use_survive_a_resize() {
        let pool = pool(1);
        let frame = pool.try_acquire().unwrap().unwrap();
        pool.resize(50, 50, TextureFormat::Rgba32).unwrap();
        assert_eq!(frame.width(), 100);
        frame.release(None);
        let frame = pool.try_acquire().unwrap().unwrap();
        assert_eq!(frame.width(), 50);
    }

    #[test]
    fn gpu_buffer_release_returns_the_frame() {
        let context = GlContext::create().unwrap();
        let pool = pool(1);
        let frame = pool.try_acquire().unwrap().unwrap();
        let id = frame.id();
        let mut buffer = frame.build_gpu_buffer(&context).unwrap();
        assert!(pool.try_acquire().unwrap().is_none());

        buffer.dispose();
        let frame = pool.try_acquire().unwrap().unwrap();
        assert_eq!(frame.id(), id);
    }

    #[test]
    fn acquire_waits_for_the_release_token() {
        let pool = pool(1);
        let frame = pool.try_acquire().unwrap().unwrap();
        let fence = Fence::pending();
        let token: *mut SharedGlSyncToken = Box::into_raw(Box::new(Arc::clone(&fence)));
        frame.release(Some(unsafe { GlSyncPoint::from_owned(token) }.unwrap()));

        let started = Instant::now();
        let signaler = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            fence.signal();
        });
        let frame = pool.try_acquire().unwrap();
        signaler.join().unwrap();
        assert!(frame.is_some());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn releases_from_other_threads_are_seen() {
        let pool = pool(2);
        let frame = pool.try_acquire().unwrap().unwrap();
        std::thread::spawn(move || frame.release(None)).join().unwrap();
        assert_eq!(pool.stats().available, 1);
    }

    #[test]
    fn dispose_is_idempotent() {
        let pool = pool(2);
        let leased = pool.try_acquire().unwrap().unwrap();
        pool.dispose();
        pool.dispose();
        assert!(pool.is_disposed());
        assert!(matches!(pool.try_acquire(), Err(BridgeError::UseAfterFree { .. })));
        leased.release(None);
        assert_eq!(pool.stats().available, 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire,
        Release(usize),
        Drop(usize),
        Resize(bool),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Acquire),
            2 => any::<usize>().prop_map(Op::Release),
            1 => any::<usize>().prop_map(Op::Drop),
            1 => any::<bool>().prop_map(Op::Resize),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn pool_invariants_hold(capacity in 1usize..5, ops in prop::collection::vec(op(), 1..40)) {
            let context = GlContext::create().unwrap();
            let pool = TextureFramePool::new(16, 16, TextureFormat::Rgba32, capacity).unwrap();
            let mut leased: Vec<TextureFrame> = Vec::new();

            for op in ops {
                match op {
                    Op::Acquire => {
                        if let Some(mut frame) = pool.try_acquire().unwrap() {
                            prop_assert_eq!(frame.descriptor(), pool.target());
                            frame.texture_name(&context).unwrap();
                            leased.push(frame);
                        } else {
                            prop_assert_eq!(leased.len(), capacity);
                        }
                    }
                    Op::Release(i) if !leased.is_empty() => {
                        let frame = leased.swap_remove(i % leased.len());
                        frame.release(None);
                    }
                    Op::Drop(i) if !leased.is_empty() => {
                        drop(leased.swap_remove(i % leased.len()));
                    }
                    Op::Resize(large) => {
                        let side = if large { 32 } else { 16 };
                        pool.resize(side, side, TextureFormat::Rgba32).unwrap();
                    }
                    _ => {}
                }

                let stats = pool.stats();
                prop_assert!(stats.available + stats.in_use <= capacity);
                prop_assert_eq!(stats.in_use, leased.len());
                let names: HashSet<_> = leased.iter().filter_map(TextureFrame::native_texture_name).collect();
                prop_assert_eq!(names.len(), leased.len());
            }
        }
    }
}

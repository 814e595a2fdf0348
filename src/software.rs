//! In-memory capture backend.
//!
//! Frames are CPU pixel buffers, the "GPU" is a ledger of calls. A
//! [`SoftwareSource`] plays the role of the captured window: it can be
//! resized, asked to deliver frames, or closed. Delivery runs the
//! frame-arrived handler synchronously on the calling thread, which stands
//! in for the capture service's callback thread.
//!
//! The frame pool has a fixed depth. When the consumer falls behind, the
//! oldest undrained frame is discarded and the producer never blocks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;

use crate::backend::{
    CaptureFrame, CaptureItem, CaptureSession, FrameArrivedHandler, FramePool, GraphicsDevice,
    SourceClosedHandler, SwapChain,
};
use crate::{PixelFormat, RelayOptions, Size};

/// One call issued against the software device, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuEvent {
    SwapChainCreated(Size),
    PoolCreated(Size),
    SessionCreated { cursor: bool, border: bool },
    SessionStarted,
    ResizeBuffers(Size),
    Copy { frame: u64, region: Size },
    Present { frame: Option<u64> },
    PoolRecreated(Size),
    SessionClosed,
    PoolClosed,
    SurfaceCreated,
}

type EventFilter = Box<dyn Fn(&GpuEvent) -> bool + Send>;
type EventHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Ledger {
    events: Mutex<Vec<GpuEvent>>,
    hooks: Mutex<Vec<(EventFilter, EventHook)>>,
    live: AtomicUsize,
    removed: AtomicBool,
}

impl Ledger {
    /// Callers hold no backend lock here; hooks may re-enter the device.
    fn record(&self, event: GpuEvent) {
        self.events.lock().push(event.clone());
        let fired: Vec<EventHook> = {
            let mut hooks = self.hooks.lock();
            let mut fired = Vec::new();
            let mut i = 0;
            while i < hooks.len() {
                if (hooks[i].0)(&event) {
                    fired.push(hooks.remove(i).1);
                } else {
                    i += 1;
                }
            }
            fired
        };
        for hook in fired {
            hook();
        }
    }

    fn check_device(&self) -> Result<()> {
        if self.removed.load(Ordering::Acquire) {
            bail!("device removed");
        }
        Ok(())
    }
}

fn check_buffer_count(buffers: u32) -> Result<()> {
    if buffers == 0 {
        bail!("buffer count must be non-zero");
    }
    Ok(())
}

/// Fixed-depth queue that evicts its oldest entry when full.
#[derive(Debug)]
pub struct DropOldestQueue<T> {
    depth: usize,
    items: VecDeque<T>,
    dropped: u64,
}

impl<T> DropOldestQueue<T> {
    /// # Panics
    ///
    /// If `depth` is zero.
    pub fn new(depth: usize) -> Self {
        assert!(depth > 0, "queue depth must be non-zero");
        Self {
            depth,
            items: VecDeque::with_capacity(depth),
            dropped: 0,
        }
    }

    /// Returns the evicted entry, if any.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.depth {
            self.dropped += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Cheaply cloneable handle; all clones share one ledger.
#[derive(Clone, Default)]
pub struct SoftwareDevice {
    ledger: Arc<Ledger>,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<GpuEvent> {
        self.ledger.events.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&GpuEvent) -> bool) -> usize {
        self.ledger.events.lock().iter().filter(|e| pred(e)).count()
    }

    /// Swap chains, pools and sessions not yet released.
    pub fn live_resources(&self) -> usize {
        self.ledger.live.load(Ordering::Acquire)
    }

    /// Every later swap chain or pool call fails, like a lost GPU.
    pub fn remove(&self) {
        self.ledger.removed.store(true, Ordering::Release);
    }

    /// Undoes [`remove`](Self::remove).
    pub fn restore(&self) {
        self.ledger.removed.store(false, Ordering::Release);
    }

    /// Runs `hook` once, on the calling thread, right after the first
    /// matching call completes on the device.
    pub fn on_event(
        &self,
        filter: impl Fn(&GpuEvent) -> bool + Send + 'static,
        hook: impl FnOnce() + Send + 'static,
    ) {
        self.ledger
            .hooks
            .lock()
            .push((Box::new(filter), Box::new(hook)));
    }
}

/// Pixels of one captured frame.
#[derive(Debug)]
pub struct SoftwareFrame {
    id: u64,
    content_size: Size,
    surface_size: Size,
    format: PixelFormat,
    pixels: Vec<u8>,
}

impl SoftwareFrame {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size of the pool buffer the frame was captured into.
    pub fn surface_size(&self) -> Size {
        self.surface_size
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

impl CaptureFrame for SoftwareFrame {
    fn content_size(&self) -> Result<Size> {
        Ok(self.content_size)
    }
}

/// Fill byte a source writes into every pixel of frame `id`.
pub fn fill_byte(id: u64) -> u8 {
    (id % 251) as u8 + 1
}

struct PoolState {
    queue: DropOldestQueue<SoftwareFrame>,
    size: Size,
    format: PixelFormat,
    closed: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    handler: Mutex<Option<Arc<FrameArrivedHandler>>>,
}

impl PoolShared {
    fn notify(&self) -> Result<()> {
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => (*handler)(),
            None => Ok(()),
        }
    }
}

pub struct SoftwarePool {
    shared: Arc<PoolShared>,
    ledger: Arc<Ledger>,
}

impl SoftwarePool {
    pub fn dropped_frames(&self) -> u64 {
        self.shared.state.lock().queue.dropped()
    }
}

impl FramePool for SoftwarePool {
    type Frame = SoftwareFrame;

    fn try_next_frame(&self) -> Result<Option<SoftwareFrame>> {
        Ok(self.shared.state.lock().queue.pop())
    }

    fn recreate(&self, format: PixelFormat, buffers: u32, size: Size) -> Result<()> {
        self.ledger.check_device()?;
        check_buffer_count(buffers)?;
        {
            let mut state = self.shared.state.lock();
            if state.queue.depth != buffers as usize {
                state.queue = DropOldestQueue::new(buffers as usize);
            }
            state.size = size;
            state.format = format;
        }
        self.ledger.record(GpuEvent::PoolRecreated(size));
        Ok(())
    }

    fn on_frame_arrived(&self, handler: FrameArrivedHandler) -> Result<()> {
        *self.shared.handler.lock() = Some(Arc::new(handler));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.queue.clear();
        }
        self.shared.handler.lock().take();
        self.ledger.record(GpuEvent::PoolClosed);
        Ok(())
    }
}

impl Drop for SoftwarePool {
    fn drop(&mut self) {
        self.ledger.live.fetch_sub(1, Ordering::AcqRel);
    }
}

struct SessionShared {
    pool: Arc<PoolShared>,
    started: AtomicBool,
    closed: AtomicBool,
}

pub struct SoftwareSession {
    shared: Arc<SessionShared>,
    ledger: Arc<Ledger>,
}

impl CaptureSession for SoftwareSession {
    fn start(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            bail!("session already closed");
        }
        self.shared.started.store(true, Ordering::Release);
        self.ledger.record(GpuEvent::SessionStarted);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::Release);
        self.ledger.record(GpuEvent::SessionClosed);
        Ok(())
    }
}

impl Drop for SoftwareSession {
    fn drop(&mut self) {
        self.ledger.live.fetch_sub(1, Ordering::AcqRel);
    }
}

struct SourceShared {
    size: Mutex<Size>,
    next_id: AtomicU64,
    session: Mutex<Weak<SessionShared>>,
    closed_handler: Mutex<Option<SourceClosedHandler>>,
}

/// The captured window or monitor, driven by the test or demo.
#[derive(Clone)]
pub struct SoftwareSource {
    shared: Arc<SourceShared>,
}

impl SoftwareSource {
    pub fn new(size: Size) -> Self {
        Self {
            shared: Arc::new(SourceShared {
                size: Mutex::new(size),
                next_id: AtomicU64::new(1),
                session: Mutex::new(Weak::new()),
                closed_handler: Mutex::new(None),
            }),
        }
    }

    /// Capture item handed to the relay.
    pub fn item(&self) -> SoftwareItem {
        SoftwareItem {
            shared: self.shared.clone(),
        }
    }

    pub fn resize(&self, size: Size) {
        *self.shared.size.lock() = size;
    }

    /// Captures one frame into the bound pool and fires the frame-arrived
    /// handler. Returns `Ok(false)` when no running session is attached.
    /// Handler errors are returned to the caller.
    pub fn deliver(&self) -> Result<bool> {
        let Some(session) = self.shared.session.lock().upgrade() else {
            return Ok(false);
        };
        if !session.started.load(Ordering::Acquire) || session.closed.load(Ordering::Acquire) {
            return Ok(false);
        }
        {
            let mut state = session.pool.state.lock();
            if state.closed {
                return Ok(false);
            }
            let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
            let surface_size = state.size;
            let len = surface_size.width as usize
                * surface_size.height as usize
                * state.format.bytes_per_pixel();
            let frame = SoftwareFrame {
                id,
                content_size: *self.shared.size.lock(),
                surface_size,
                format: state.format,
                pixels: vec![fill_byte(id); len],
            };
            if let Some(evicted) = state.queue.push(frame) {
                log::trace!("frame pool full, dropped frame {}", evicted.id);
            }
        }
        session.pool.notify()?;
        Ok(true)
    }

    /// Fires the frame-arrived handler without queueing a frame.
    pub fn notify_spurious(&self) -> Result<()> {
        match self.shared.session.lock().upgrade() {
            Some(session) => session.pool.notify(),
            None => Ok(()),
        }
    }

    /// The source went away: fires the closed handler once.
    pub fn close(&self) {
        let handler = self.shared.closed_handler.lock().take();
        if let Some(handler) = handler {
            handler();
        }
    }
}

pub struct SoftwareItem {
    shared: Arc<SourceShared>,
}

impl CaptureItem for SoftwareItem {
    fn size(&self) -> Result<Size> {
        Ok(*self.shared.size.lock())
    }

    fn on_closed(&self, handler: SourceClosedHandler) -> Result<()> {
        *self.shared.closed_handler.lock() = Some(handler);
        Ok(())
    }
}

/// What the display currently shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentedFrame {
    pub frame: Option<u64>,
    pub size: Size,
    pub pixels: Vec<u8>,
}

struct BackBuffer {
    pixels: Vec<u8>,
    frame: Option<u64>,
}

struct SwapState {
    size: Size,
    format: PixelFormat,
    buffers: Vec<BackBuffer>,
    back: usize,
}

impl SwapState {
    fn allocate(size: Size, format: PixelFormat, count: u32) -> Vec<BackBuffer> {
        let len = size.width as usize * size.height as usize * format.bytes_per_pixel();
        (0..count)
            .map(|_| BackBuffer {
                pixels: vec![0; len],
                frame: None,
            })
            .collect()
    }
}

pub struct SoftwareSwapChain {
    state: Mutex<SwapState>,
    front: Arc<Mutex<Option<PresentedFrame>>>,
    ledger: Arc<Ledger>,
}

impl SwapChain for SoftwareSwapChain {
    type Frame = SoftwareFrame;

    fn resize_buffers(&self, buffers: u32, size: Size, format: PixelFormat) -> Result<()> {
        self.ledger.check_device()?;
        if size.is_empty() {
            bail!("cannot resize swap chain to {}", size);
        }
        {
            let mut state = self.state.lock();
            // Zero keeps the current buffer count, as DXGI does.
            let count = if buffers == 0 {
                state.buffers.len() as u32
            } else {
                buffers
            };
            state.buffers = SwapState::allocate(size, format, count);
            state.size = size;
            state.format = format;
            state.back = 0;
        }
        self.ledger.record(GpuEvent::ResizeBuffers(size));
        Ok(())
    }

    fn copy_to_back_buffer(&self, frame: &SoftwareFrame) -> Result<()> {
        self.ledger.check_device()?;
        let region = self.copy_locked(frame)?;
        self.ledger.record(GpuEvent::Copy {
            frame: frame.id,
            region,
        });
        Ok(())
    }

    fn present(&self, sync_interval: u32) -> Result<()> {
        self.ledger.check_device()?;
        if sync_interval > 4 {
            return Err(anyhow!("invalid sync interval {}", sync_interval));
        }
        let frame = {
            let mut state = self.state.lock();
            let back = state.back;
            let presented = PresentedFrame {
                frame: state.buffers[back].frame,
                size: state.size,
                pixels: state.buffers[back].pixels.clone(),
            };
            state.back = (back + 1) % state.buffers.len();
            let frame = presented.frame;
            *self.front.lock() = Some(presented);
            frame
        };
        self.ledger.record(GpuEvent::Present { frame });
        Ok(())
    }
}

impl SoftwareSwapChain {
    fn copy_locked(&self, frame: &SoftwareFrame) -> Result<Size> {
        let mut state = self.state.lock();
        if frame.format != state.format {
            bail!(
                "frame format {:?} does not match swap chain format {:?}",
                frame.format,
                state.format
            );
        }
        let bpp = state.format.bytes_per_pixel();
        let dst_pitch = state.size.width as usize * bpp;
        let src_pitch = frame.surface_size.width as usize * bpp;
        let region = state
            .size
            .intersect(frame.surface_size)
            .intersect(frame.content_size);
        let row_len = region.width as usize * bpp;

        let back = state.back;
        let buffer = &mut state.buffers[back];
        for row in 0..region.height as usize {
            let src = &frame.pixels[row * src_pitch..row * src_pitch + row_len];
            buffer.pixels[row * dst_pitch..row * dst_pitch + row_len].copy_from_slice(src);
        }
        buffer.frame = Some(frame.id);
        Ok(region)
    }
}

impl Drop for SoftwareSwapChain {
    fn drop(&mut self) {
        self.ledger.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Stand-in for a compositor; surfaces need one to be created.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareCompositor;

/// Display view of a swap chain. Outlives the relay.
#[derive(Clone)]
pub struct SoftwareSurface {
    front: Arc<Mutex<Option<PresentedFrame>>>,
}

impl SoftwareSurface {
    pub fn latest(&self) -> Option<PresentedFrame> {
        self.front.lock().clone()
    }
}

impl GraphicsDevice for SoftwareDevice {
    type Item = SoftwareItem;
    type Frame = SoftwareFrame;
    type Pool = SoftwarePool;
    type Session = SoftwareSession;
    type SwapChain = SoftwareSwapChain;
    type Compositor = SoftwareCompositor;
    type Surface = SoftwareSurface;

    fn create_swap_chain(
        &self,
        size: Size,
        format: PixelFormat,
        buffers: u32,
    ) -> Result<SoftwareSwapChain> {
        self.ledger.check_device()?;
        check_buffer_count(buffers)?;
        let swap_chain = SoftwareSwapChain {
            state: Mutex::new(SwapState {
                size,
                format,
                buffers: SwapState::allocate(size, format, buffers),
                back: 0,
            }),
            front: Arc::new(Mutex::new(None)),
            ledger: self.ledger.clone(),
        };
        self.ledger.live.fetch_add(1, Ordering::AcqRel);
        self.ledger.record(GpuEvent::SwapChainCreated(size));
        Ok(swap_chain)
    }

    fn create_frame_pool(
        &self,
        format: PixelFormat,
        buffers: u32,
        size: Size,
    ) -> Result<SoftwarePool> {
        self.ledger.check_device()?;
        check_buffer_count(buffers)?;
        let pool = SoftwarePool {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    queue: DropOldestQueue::new(buffers as usize),
                    size,
                    format,
                    closed: false,
                }),
                handler: Mutex::new(None),
            }),
            ledger: self.ledger.clone(),
        };
        self.ledger.live.fetch_add(1, Ordering::AcqRel);
        self.ledger.record(GpuEvent::PoolCreated(size));
        Ok(pool)
    }

    fn create_session(
        &self,
        pool: &SoftwarePool,
        item: &SoftwareItem,
        options: &RelayOptions,
    ) -> Result<SoftwareSession> {
        let shared = Arc::new(SessionShared {
            pool: pool.shared.clone(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        *item.shared.session.lock() = Arc::downgrade(&shared);
        self.ledger.live.fetch_add(1, Ordering::AcqRel);
        self.ledger.record(GpuEvent::SessionCreated {
            cursor: options.cursor_capture_enabled,
            border: options.border_required,
        });
        Ok(SoftwareSession {
            shared,
            ledger: self.ledger.clone(),
        })
    }

    fn create_surface(
        &self,
        _compositor: &SoftwareCompositor,
        swap_chain: &SoftwareSwapChain,
    ) -> Result<SoftwareSurface> {
        self.ledger.record(GpuEvent::SurfaceCreated);
        Ok(SoftwareSurface {
            front: swap_chain.front.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_drops_oldest_when_full() {
        let mut queue = DropOldestQueue::new(2);
        assert_eq!(queue.push(1), None);
        assert_eq!(queue.push(2), None);
        assert_eq!(queue.push(3), Some(1));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert!(queue.is_empty());
    }

    #[test]
    fn undrained_pool_keeps_newest_frames() {
        let device = SoftwareDevice::new();
        let source = SoftwareSource::new(Size::new(4, 4));
        let pool = device
            .create_frame_pool(PixelFormat::Bgra8, 2, Size::new(4, 4))
            .unwrap();
        let session = device
            .create_session(&pool, &source.item(), &RelayOptions::default())
            .unwrap();
        session.start().unwrap();

        for _ in 0..5 {
            assert!(source.deliver().unwrap());
        }
        assert_eq!(pool.dropped_frames(), 3);
        assert_eq!(pool.try_next_frame().unwrap().map(|f| f.id()), Some(4));
        assert_eq!(pool.try_next_frame().unwrap().map(|f| f.id()), Some(5));
        assert!(pool.try_next_frame().unwrap().is_none());
    }

    #[test]
    fn copy_clips_to_smaller_extent() {
        let device = SoftwareDevice::new();
        let swap_chain = device
            .create_swap_chain(Size::new(2, 2), PixelFormat::Bgra8, 2)
            .unwrap();
        let frame = SoftwareFrame {
            id: 7,
            content_size: Size::new(3, 1),
            surface_size: Size::new(3, 3),
            format: PixelFormat::Bgra8,
            pixels: vec![9; 3 * 3 * 4],
        };
        swap_chain.copy_to_back_buffer(&frame).unwrap();
        swap_chain.present(1).unwrap();

        let shown = swap_chain.front.lock().clone().unwrap();
        assert_eq!(shown.frame, Some(7));
        assert_eq!(&shown.pixels[..8], &[9; 8]);
        assert_eq!(&shown.pixels[8..], &[0; 8]);
        assert!(device
            .events()
            .contains(&GpuEvent::Copy { frame: 7, region: Size::new(2, 1) }));
    }

    #[test]
    fn removed_device_fails_gpu_calls() {
        let device = SoftwareDevice::new();
        let swap_chain = device
            .create_swap_chain(Size::new(2, 2), PixelFormat::Bgra8, 2)
            .unwrap();
        device.remove();
        assert!(swap_chain.present(1).is_err());
        assert!(device
            .create_frame_pool(PixelFormat::Bgra8, 2, Size::new(2, 2))
            .is_err());
    }

    #[test]
    fn zero_buffer_count_is_an_error() {
        let device = SoftwareDevice::new();
        assert!(device
            .create_swap_chain(Size::new(2, 2), PixelFormat::Bgra8, 0)
            .is_err());
        assert!(device
            .create_frame_pool(PixelFormat::Bgra8, 0, Size::new(2, 2))
            .is_err());

        let pool = device
            .create_frame_pool(PixelFormat::Bgra8, 2, Size::new(2, 2))
            .unwrap();
        let err = pool
            .recreate(PixelFormat::Bgra8, 0, Size::new(4, 4))
            .unwrap_err();
        assert!(err.to_string().contains("buffer count"));
        assert_eq!(device.live_resources(), 1);
    }

    #[test]
    fn resize_with_zero_buffers_keeps_count() {
        let device = SoftwareDevice::new();
        let swap_chain = device
            .create_swap_chain(Size::new(2, 2), PixelFormat::Bgra8, 2)
            .unwrap();
        swap_chain
            .resize_buffers(0, Size::new(4, 4), PixelFormat::Bgra8)
            .unwrap();
        assert_eq!(swap_chain.state.lock().buffers.len(), 2);
        swap_chain.present(1).unwrap();
        swap_chain.present(1).unwrap();
    }

    #[test]
    fn event_hook_fires_once_after_the_call() {
        let device = SoftwareDevice::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = device.clone();
        let counter = hits.clone();
        device.on_event(
            |e| matches!(e, GpuEvent::Present { .. }),
            move || {
                assert!(matches!(seen.events().last(), Some(GpuEvent::Present { .. })));
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        let swap_chain = device
            .create_swap_chain(Size::new(2, 2), PixelFormat::Bgra8, 2)
            .unwrap();
        swap_chain.present(1).unwrap();
        swap_chain.present(1).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_handles_releases_resources() {
        let device = SoftwareDevice::new();
        let swap_chain = device
            .create_swap_chain(Size::new(2, 2), PixelFormat::Bgra8, 2)
            .unwrap();
        assert_eq!(device.live_resources(), 1);
        drop(swap_chain);
        assert_eq!(device.live_resources(), 0);
    }
}

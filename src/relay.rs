//! The frame relay: copies every captured frame into a swap chain and
//! presents it, following the source through resizes.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::backend::{CaptureFrame, CaptureItem, CaptureSession, FramePool, GraphicsDevice, SwapChain};
use crate::error::{RelayError, Result};
use crate::{RelayOptions, Size, BUFFER_COUNT, PRESENT_SYNC_INTERVAL};

/// Counters describing what the relay has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub presented: u64,
    pub resizes: u64,
    pub pool_recreations: u64,
    /// Notifications that yielded nothing to present.
    pub empty_notifications: u64,
}

#[derive(Default)]
struct Counters {
    presented: AtomicU64,
    resizes: AtomicU64,
    pool_recreations: AtomicU64,
    empty_notifications: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> RelayStats {
        RelayStats {
            presented: self.presented.load(Ordering::Relaxed),
            resizes: self.resizes.load(Ordering::Relaxed),
            pool_recreations: self.pool_recreations.load(Ordering::Relaxed),
            empty_notifications: self.empty_notifications.load(Ordering::Relaxed),
        }
    }
}

/// Every platform handle the relay owns. Dropped as a unit on close.
struct Resources<D: GraphicsDevice> {
    device: D,
    item: D::Item,
    pool: D::Pool,
    session: D::Session,
    swap_chain: D::SwapChain,
    last_size: Size,
}

impl<D: GraphicsDevice> Resources<D> {
    fn release(self) {
        if let Err(e) = self.session.close() {
            log::warn!("closing capture session failed: {:#}", e);
        }
        if let Err(e) = self.pool.close() {
            log::warn!("closing frame pool failed: {:#}", e);
        }
    }
}

type Slot<D> = RefCell<Option<Resources<D>>>;

struct Inner<D: GraphicsDevice> {
    options: RelayOptions,
    closed: AtomicBool,
    // Reentrant: the source-closed handler may run `close` on a thread that
    // is already inside a device call for this relay.
    resources: ReentrantMutex<Slot<D>>,
    counters: Counters,
}

impl<D: GraphicsDevice> Inner<D> {
    fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // Waits for an in-flight frame on another thread. On the callback's
        // own thread teardown happens when that callback unwinds.
        self.finish(self.resources.lock());
        log::info!("relay closed");
        true
    }

    /// Ends a locked section. Once the relay is closed, whoever holds the
    /// outermost borrow takes the handles out and releases them under the
    /// lock.
    fn finish(&self, guard: ReentrantMutexGuard<'_, Slot<D>>) {
        if !self.closed.load(Ordering::Acquire) {
            return;
        }
        let taken = match guard.try_borrow_mut() {
            Ok(mut slot) => slot.take(),
            Err(_) => {
                log::debug!("teardown left to the call in progress");
                return;
            }
        };
        if let Some(resources) = taken {
            resources.release();
            log::debug!("relay handles released");
        }
    }

    fn with_resources<T>(&self, f: impl FnOnce(&Resources<D>) -> Result<T>) -> Result<T> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RelayError::Closed);
        }
        let guard = self.resources.lock();
        let result = match guard.try_borrow() {
            Ok(slot) => match slot.as_ref() {
                Some(res) => f(res),
                None => Err(RelayError::Closed),
            },
            Err(_) => Err(anyhow!("relay called from inside its own frame callback").into()),
        };
        self.finish(guard);
        result
    }

    fn on_frame_arrived(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let guard = self.resources.lock();
        let result = match guard.try_borrow_mut() {
            Ok(mut slot) => match slot.as_mut() {
                Some(res) => self.relay_frame(res),
                None => Ok(()),
            },
            // Notification raised from inside a device call on this thread.
            Err(_) => Ok(()),
        };
        self.finish(guard);
        result
    }

    fn relay_frame(&self, res: &mut Resources<D>) -> Result<()> {
        let format = self.options.pixel_format;
        let resized;
        {
            let Some(frame) = res.pool.try_next_frame()? else {
                self.counters.empty_notifications.fetch_add(1, Ordering::Relaxed);
                log::trace!("frame notification without a frame");
                return Ok(());
            };

            let content_size = frame.content_size()?;
            if content_size.is_empty() {
                self.counters.empty_notifications.fetch_add(1, Ordering::Relaxed);
                log::trace!("skipping frame with empty content");
                return Ok(());
            }

            resized = content_size != res.last_size;
            if resized {
                log::debug!("source resized {} -> {}", res.last_size, content_size);
                res.swap_chain
                    .resize_buffers(BUFFER_COUNT, content_size, format)?;
                res.last_size = content_size;
                self.counters.resizes.fetch_add(1, Ordering::Relaxed);
            }

            res.swap_chain.copy_to_back_buffer(&frame)?;
        }

        res.swap_chain.present(PRESENT_SYNC_INTERVAL)?;
        self.counters.presented.fetch_add(1, Ordering::Relaxed);

        // After present, so the frame in hand is not stalled by the pool swap.
        if resized {
            res.pool.recreate(format, BUFFER_COUNT, res.last_size)?;
            self.counters.pool_recreations.fetch_add(1, Ordering::Relaxed);
            log::debug!("frame pool recreated at {}", res.last_size);
        }
        Ok(())
    }
}

/// Live capture of one source presented through a double-buffered swap chain.
///
/// Dropping the relay closes it.
pub struct FrameRelay<D: GraphicsDevice> {
    inner: Arc<Inner<D>>,
}

impl<D: GraphicsDevice> FrameRelay<D> {
    /// Binds a new relay to `item`. Frames are not delivered until
    /// [`start_capture`](Self::start_capture).
    pub fn new(device: D, item: D::Item, options: RelayOptions) -> Result<Self> {
        let size = item.size()?;
        if size.is_empty() {
            return Err(RelayError::EmptySource(size));
        }
        let format = options.pixel_format;

        let swap_chain = device.create_swap_chain(size, format, BUFFER_COUNT)?;
        let pool = device.create_frame_pool(format, BUFFER_COUNT, size)?;
        let session = device.create_session(&pool, &item, &options)?;

        let inner = Arc::new(Inner {
            options,
            closed: AtomicBool::new(false),
            resources: ReentrantMutex::new(RefCell::new(Some(Resources {
                device,
                item,
                pool,
                session,
                swap_chain,
                last_size: size,
            }))),
            counters: Counters::default(),
        });

        if let Err(e) = Self::register_handlers(&inner) {
            inner.close();
            return Err(e);
        }

        log::info!("relay created for {} source ({:?})", size, format);
        Ok(Self { inner })
    }

    fn register_handlers(inner: &Arc<Inner<D>>) -> Result<()> {
        inner.with_resources(|res| {
            let weak: Weak<Inner<D>> = Arc::downgrade(inner);
            res.pool.on_frame_arrived(Box::new(move || {
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                inner.on_frame_arrived().map_err(|e| {
                    log::error!("frame processing failed: {}", e);
                    anyhow::Error::from(e)
                })
            }))?;

            let weak: Weak<Inner<D>> = Arc::downgrade(inner);
            res.item.on_closed(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    log::info!("capture source closed");
                    inner.close();
                }
            }))?;
            Ok(())
        })
    }

    /// Starts frame delivery. Frame notifications arrive asynchronously
    /// from this point on.
    pub fn start_capture(&self) -> Result<()> {
        self.inner.with_resources(|res| Ok(res.session.start()?))?;
        log::info!("capture started");
        Ok(())
    }

    /// Wraps the swap chain in a surface the caller can place into its
    /// compositor tree.
    pub fn create_surface(&self, compositor: &D::Compositor) -> Result<D::Surface> {
        self.inner
            .with_resources(|res| Ok(res.device.create_surface(compositor, &res.swap_chain)?))
    }

    /// Tears the relay down. Safe to call any number of times from any
    /// thread; returns `true` only for the call that performed teardown.
    pub fn close(&self) -> bool {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Size the swap chain buffers currently have.
    pub fn content_size(&self) -> Result<Size> {
        self.inner.with_resources(|res| Ok(res.last_size))
    }

    pub fn options(&self) -> &RelayOptions {
        &self.inner.options
    }

    pub fn stats(&self) -> RelayStats {
        self.inner.counters.snapshot()
    }
}

impl<D: GraphicsDevice> Drop for FrameRelay<D> {
    fn drop(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::{GpuEvent, SoftwareCompositor, SoftwareDevice, SoftwareSource};

    fn relay(size: Size) -> (SoftwareDevice, SoftwareSource, FrameRelay<SoftwareDevice>) {
        let device = SoftwareDevice::new();
        let source = SoftwareSource::new(size);
        let relay = FrameRelay::new(device.clone(), source.item(), RelayOptions::default())
            .expect("relay");
        (device, source, relay)
    }

    #[test]
    fn zero_width_source_is_rejected() {
        let device = SoftwareDevice::new();
        let source = SoftwareSource::new(Size::new(0, 600));
        let err = FrameRelay::new(device.clone(), source.item(), RelayOptions::default())
            .err()
            .expect("construction must fail");
        assert!(matches!(err, RelayError::EmptySource(_)));
        assert_eq!(device.live_resources(), 0);
        assert!(device.events().is_empty());
    }

    #[test]
    fn calls_after_close_are_rejected() {
        let (device, source, relay) = relay(Size::new(320, 240));
        relay.start_capture().unwrap();
        assert!(relay.close());
        assert!(!relay.close());

        assert!(matches!(relay.start_capture(), Err(RelayError::Closed)));
        assert!(matches!(
            relay.create_surface(&SoftwareCompositor),
            Err(RelayError::Closed)
        ));
        assert!(matches!(relay.content_size(), Err(RelayError::Closed)));

        let before = device.events().len();
        assert!(!source.deliver().unwrap());
        assert_eq!(device.events().len(), before);
    }

    #[test]
    fn source_closed_tears_relay_down() {
        let (device, source, relay) = relay(Size::new(320, 240));
        relay.start_capture().unwrap();
        source.close();
        assert!(relay.is_closed());
        assert_eq!(device.live_resources(), 0);
        assert_eq!(device.count(|e| matches!(e, GpuEvent::SessionClosed)), 1);
    }

    #[test]
    fn source_closing_inside_present_defers_teardown_to_the_frame() {
        let (device, source, relay) = relay(Size::new(320, 240));
        relay.start_capture().unwrap();
        let closing = source.clone();
        device.on_event(
            |e| matches!(e, GpuEvent::Present { .. }),
            move || closing.close(),
        );

        assert!(source.deliver().unwrap());
        assert!(relay.is_closed());
        assert_eq!(relay.stats().presented, 1);
        assert_eq!(device.live_resources(), 0);

        let events = device.events();
        let n = events.len();
        assert_eq!(
            &events[n - 3..],
            &[
                GpuEvent::Present { frame: Some(1) },
                GpuEvent::SessionClosed,
                GpuEvent::PoolClosed,
            ]
        );
    }

    #[test]
    fn source_closing_inside_start_capture_still_tears_down() {
        let (device, source, relay) = relay(Size::new(320, 240));
        let closing = source.clone();
        device.on_event(
            |e| matches!(e, GpuEvent::SessionStarted),
            move || closing.close(),
        );

        relay.start_capture().unwrap();
        assert!(relay.is_closed());
        assert_eq!(device.live_resources(), 0);
        assert_eq!(device.count(|e| matches!(e, GpuEvent::SessionClosed)), 1);
        assert!(!relay.close());
    }

    #[test]
    fn drop_closes() {
        let (device, _source, relay) = relay(Size::new(320, 240));
        assert_eq!(device.live_resources(), 3);
        drop(relay);
        assert_eq!(device.live_resources(), 0);
    }
}

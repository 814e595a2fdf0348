//! Platform seam for [`FrameRelay`](crate::FrameRelay).
//!
//! A backend supplies the capture item, the frame pool the capture service
//! fills, the session that drives it and the swap chain frames are copied
//! into. The relay only ever calls these through the traits below.

use anyhow::Result;

use crate::{PixelFormat, RelayOptions, Size};

/// Invoked by the frame pool each time a new frame may be available.
/// Runs on a thread owned by the capture service.
pub type FrameArrivedHandler = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// Invoked once when the capture source goes away.
pub type SourceClosedHandler = Box<dyn Fn() + Send + Sync>;

pub trait CaptureItem: Send + 'static {
    /// Current pixel size of the source.
    fn size(&self) -> Result<Size>;

    fn on_closed(&self, handler: SourceClosedHandler) -> Result<()>;
}

pub trait CaptureFrame {
    /// Size of the source content carried by this frame. Differs from the
    /// pool size when the source was resized after the pool was created.
    fn content_size(&self) -> Result<Size>;
}

pub trait FramePool: Send + 'static {
    type Frame: CaptureFrame;

    /// Non-blocking. `None` when the notification was spurious.
    fn try_next_frame(&self) -> Result<Option<Self::Frame>>;

    fn recreate(&self, format: PixelFormat, buffers: u32, size: Size) -> Result<()>;

    fn on_frame_arrived(&self, handler: FrameArrivedHandler) -> Result<()>;

    fn close(&self) -> Result<()>;
}

pub trait CaptureSession: Send + 'static {
    fn start(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}

pub trait SwapChain: Send + 'static {
    type Frame;

    /// Keeps buffer count and format, changes only the extent.
    fn resize_buffers(&self, buffers: u32, size: Size, format: PixelFormat) -> Result<()>;

    /// GPU-side copy of the frame surface into the current back buffer.
    fn copy_to_back_buffer(&self, frame: &Self::Frame) -> Result<()>;

    fn present(&self, sync_interval: u32) -> Result<()>;
}

/// Factory for every platform object a relay owns.
pub trait GraphicsDevice: Send + 'static {
    type Item: CaptureItem;
    type Frame: CaptureFrame;
    type Pool: FramePool<Frame = Self::Frame>;
    type Session: CaptureSession;
    type SwapChain: SwapChain<Frame = Self::Frame>;
    type Compositor;
    type Surface;

    fn create_swap_chain(
        &self,
        size: Size,
        format: PixelFormat,
        buffers: u32,
    ) -> Result<Self::SwapChain>;

    fn create_frame_pool(
        &self,
        format: PixelFormat,
        buffers: u32,
        size: Size,
    ) -> Result<Self::Pool>;

    fn create_session(
        &self,
        pool: &Self::Pool,
        item: &Self::Item,
        options: &RelayOptions,
    ) -> Result<Self::Session>;

    fn create_surface(
        &self,
        compositor: &Self::Compositor,
        swap_chain: &Self::SwapChain,
    ) -> Result<Self::Surface>;
}

//! Windows.Graphics.Capture backend.
//!
//! ```text
//! HWND / HMONITOR
//!   │  IGraphicsCaptureItemInterop
//!   ▼
//! GraphicsCaptureItem ── Closed ──────────────► FrameRelay::close
//!   │  Direct3D11CaptureFramePool::CreateFreeThreaded (2 buffers)
//!   ▼
//! GraphicsCaptureSession::StartCapture
//!   │  FrameArrived (capture worker thread)
//!   ▼
//! frame texture ── CopySubresourceRegion ──► swap chain back buffer
//!                                               │  Present1(1, 0)
//!                                               ▼
//!                       ICompositorInterop::CreateCompositionSurfaceForSwapChain
//! ```

mod capture;
mod device;
mod swap_chain;

use anyhow::{Context, Result};
use windows::core::Interface;
use windows::Graphics::DirectX::DirectXPixelFormat;
use windows::UI::Composition::{Compositor, ICompositionSurface};
use windows::Win32::Foundation::{BOOL, LPARAM, POINT, RECT};
use windows::Win32::Graphics::Direct3D11::ID3D11Device;
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT, DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_FORMAT_R16G16B16A16_FLOAT,
};
use windows::Win32::Graphics::Gdi::{
    EnumDisplayMonitors, MonitorFromPoint, HDC, HMONITOR, MONITOR_DEFAULTTOPRIMARY,
};
use windows::Win32::System::WinRT::Composition::ICompositorInterop;

pub use capture::{WgcFrame, WgcItem, WgcPool, WgcSession};
pub use device::init;
pub use swap_chain::WgcSwapChain;

use crate::backend::GraphicsDevice;
use crate::{PixelFormat, RelayOptions, Size};
use device::DeviceHandles;

pub(crate) fn directx_format(format: PixelFormat) -> DirectXPixelFormat {
    match format {
        PixelFormat::Bgra8 => DirectXPixelFormat::B8G8R8A8UIntNormalized,
        PixelFormat::Rgba16F => DirectXPixelFormat::R16G16B16A16Float,
    }
}

pub(crate) fn dxgi_format(format: PixelFormat) -> DXGI_FORMAT {
    match format {
        PixelFormat::Bgra8 => DXGI_FORMAT_B8G8R8A8_UNORM,
        PixelFormat::Rgba16F => DXGI_FORMAT_R16G16B16A16_FLOAT,
    }
}

/// D3D11 device plus its WinRT wrapper, the factory for every capture and
/// presentation object of a relay.
#[derive(Clone)]
pub struct WgcDevice {
    handles: DeviceHandles,
}

// The D3D11 device is free threaded; the immediate context is only touched
// by the relay under its resource lock.
unsafe impl Send for WgcDevice {}

impl WgcDevice {
    /// Initialises WinRT and creates a new hardware (or WARP) device.
    pub fn new() -> Result<Self> {
        init();
        let d3d_device = device::create_d3d_device()?;
        Self::from_d3d_device(d3d_device)
    }

    /// Wraps a device the application already owns. It must have been
    /// created with BGRA support.
    pub fn from_d3d_device(d3d_device: ID3D11Device) -> Result<Self> {
        let handles = DeviceHandles::new(d3d_device)?;
        match device::adapter_description(&handles.d3d_device) {
            Ok(adapter) => log::info!("Using adapter: [{}]", adapter),
            Err(e) => log::debug!("adapter description unavailable: {:?}", e),
        }
        Ok(Self { handles })
    }

    pub fn d3d_device(&self) -> &ID3D11Device {
        &self.handles.d3d_device
    }
}

impl GraphicsDevice for WgcDevice {
    type Item = WgcItem;
    type Frame = WgcFrame;
    type Pool = WgcPool;
    type Session = WgcSession;
    type SwapChain = WgcSwapChain;
    type Compositor = Compositor;
    type Surface = ICompositionSurface;

    fn create_swap_chain(&self, size: Size, format: PixelFormat, buffers: u32) -> Result<WgcSwapChain> {
        WgcSwapChain::new(&self.handles, size, format, buffers)
    }

    fn create_frame_pool(&self, format: PixelFormat, buffers: u32, size: Size) -> Result<WgcPool> {
        WgcPool::new(&self.handles.direct3d_device, format, buffers, size)
    }

    fn create_session(
        &self,
        pool: &WgcPool,
        item: &WgcItem,
        options: &RelayOptions,
    ) -> Result<WgcSession> {
        WgcSession::new(pool, item, options)
    }

    fn create_surface(
        &self,
        compositor: &Compositor,
        swap_chain: &WgcSwapChain,
    ) -> Result<ICompositionSurface> {
        let interop: ICompositorInterop = compositor.cast().context("ICompositorInterop")?;
        unsafe { interop.CreateCompositionSurfaceForSwapChain(&swap_chain.swap_chain) }
            .context("CreateCompositionSurfaceForSwapChain")
    }
}

/// Connected monitors, in the order Windows reports them.
pub fn enumerate_monitors() -> Vec<HMONITOR> {
    let mut list: Vec<HMONITOR> = Vec::new();

    unsafe extern "system" fn cb(hmon: HMONITOR, _: HDC, _: *mut RECT, data: LPARAM) -> BOOL {
        let list = data.0 as *mut Vec<HMONITOR>;
        unsafe { (*list).push(hmon) };
        BOOL(1)
    }

    unsafe {
        let _ = EnumDisplayMonitors(
            HDC::default(),
            None,
            Some(cb),
            LPARAM(&mut list as *mut _ as isize),
        );
    }
    list
}

pub fn primary_monitor() -> HMONITOR {
    unsafe { MonitorFromPoint(POINT { x: 0, y: 0 }, MONITOR_DEFAULTTOPRIMARY) }
}

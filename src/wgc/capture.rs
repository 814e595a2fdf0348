use anyhow::{Context, Result};
use parking_lot::Mutex;
use windows::core::IInspectable;
use windows::Foundation::{EventRegistrationToken, TypedEventHandler};
use windows::Graphics::Capture::{
    Direct3D11CaptureFrame, Direct3D11CaptureFramePool, GraphicsCaptureItem, GraphicsCaptureSession,
};
use windows::Graphics::DirectX::Direct3D11::IDirect3DDevice;
use windows::Graphics::SizeInt32;
use windows::Win32::Foundation::{E_FAIL, HWND};
use windows::Win32::Graphics::Direct3D11::ID3D11Texture2D;
use windows::Win32::Graphics::Gdi::HMONITOR;
use windows::Win32::System::WinRT::Graphics::Capture::IGraphicsCaptureItemInterop;

use super::device::get_d3d_interface_from_object;
use super::directx_format;
use crate::backend::{
    CaptureFrame, CaptureItem, CaptureSession, FrameArrivedHandler, FramePool, SourceClosedHandler,
};
use crate::{PixelFormat, RelayOptions, Size};

pub(crate) fn to_size(size: SizeInt32) -> Size {
    Size::new(size.Width.max(0) as u32, size.Height.max(0) as u32)
}

pub(crate) fn to_size_int32(size: Size) -> SizeInt32 {
    SizeInt32 {
        Width: size.width as i32,
        Height: size.height as i32,
    }
}

/// Hands the platform a windows error; the original HRESULT is kept when
/// one is in the chain.
fn to_windows_error(err: anyhow::Error) -> windows::core::Error {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<windows::core::Error>())
        .cloned()
        .unwrap_or_else(|| windows::core::Error::new(E_FAIL, format!("{:#}", err)))
}

/// A null frame from `TryGetNextFrame` surfaces as an error carrying a
/// success code.
fn is_missing_frame(err: &windows::core::Error) -> bool {
    err.code().is_ok()
}

/// A window or monitor to capture.
pub struct WgcItem {
    pub(crate) item: GraphicsCaptureItem,
    closed_token: Mutex<Option<EventRegistrationToken>>,
}

unsafe impl Send for WgcItem {}

impl WgcItem {
    pub fn for_window(hwnd: HWND) -> Result<Self> {
        let interop =
            windows::core::factory::<GraphicsCaptureItem, IGraphicsCaptureItemInterop>()
                .context("IGraphicsCaptureItemInterop factory")?;
        let item: GraphicsCaptureItem =
            unsafe { interop.CreateForWindow(hwnd) }.context("CreateForWindow")?;
        Ok(Self::from_item(item))
    }

    pub fn for_monitor(hmonitor: HMONITOR) -> Result<Self> {
        let interop =
            windows::core::factory::<GraphicsCaptureItem, IGraphicsCaptureItemInterop>()
                .context("IGraphicsCaptureItemInterop factory")?;
        let item: GraphicsCaptureItem =
            unsafe { interop.CreateForMonitor(hmonitor) }.context("CreateForMonitor")?;
        Ok(Self::from_item(item))
    }

    pub fn from_item(item: GraphicsCaptureItem) -> Self {
        Self {
            item,
            closed_token: Mutex::new(None),
        }
    }

    pub fn display_name(&self) -> Result<String> {
        Ok(self.item.DisplayName()?.to_string())
    }
}

impl CaptureItem for WgcItem {
    fn size(&self) -> Result<Size> {
        Ok(to_size(self.item.Size().context("GraphicsCaptureItem::Size")?))
    }

    fn on_closed(&self, handler: SourceClosedHandler) -> Result<()> {
        let token = self
            .item
            .Closed(&TypedEventHandler::<GraphicsCaptureItem, IInspectable>::new(
                move |_, _| {
                    handler();
                    Ok(())
                },
            ))
            .context("GraphicsCaptureItem::Closed")?;
        *self.closed_token.lock() = Some(token);
        Ok(())
    }
}

impl Drop for WgcItem {
    fn drop(&mut self) {
        if let Some(token) = self.closed_token.lock().take() {
            let _ = self.item.RemoveClosed(token);
        }
    }
}

/// Frame taken out of the pool. Returned to the pool when dropped.
pub struct WgcFrame {
    frame: Direct3D11CaptureFrame,
}

impl WgcFrame {
    pub(crate) fn texture(&self) -> windows::core::Result<ID3D11Texture2D> {
        get_d3d_interface_from_object(&self.frame.Surface()?)
    }
}

impl CaptureFrame for WgcFrame {
    fn content_size(&self) -> Result<Size> {
        Ok(to_size(self.frame.ContentSize().context("ContentSize")?))
    }
}

impl Drop for WgcFrame {
    fn drop(&mut self) {
        let _ = self.frame.Close();
    }
}

pub struct WgcPool {
    pub(crate) pool: Direct3D11CaptureFramePool,
    device: IDirect3DDevice,
    frame_arrived_token: Mutex<Option<EventRegistrationToken>>,
}

unsafe impl Send for WgcPool {}

impl WgcPool {
    pub(crate) fn new(
        device: &IDirect3DDevice,
        format: PixelFormat,
        buffers: u32,
        size: Size,
    ) -> Result<Self> {
        // Free threaded: frames arrive on a capture worker thread, no
        // dispatcher queue needed on the creating thread.
        let pool = Direct3D11CaptureFramePool::CreateFreeThreaded(
            device,
            directx_format(format),
            buffers as i32,
            to_size_int32(size),
        )
        .context("CreateFreeThreaded frame pool")?;
        Ok(Self {
            pool,
            device: device.clone(),
            frame_arrived_token: Mutex::new(None),
        })
    }
}

impl FramePool for WgcPool {
    type Frame = WgcFrame;

    fn try_next_frame(&self) -> Result<Option<WgcFrame>> {
        match self.pool.TryGetNextFrame() {
            Ok(frame) => Ok(Some(WgcFrame { frame })),
            Err(e) if is_missing_frame(&e) => {
                log::trace!("TryGetNextFrame returned no frame");
                Ok(None)
            }
            Err(e) => Err(e).context("TryGetNextFrame"),
        }
    }

    fn recreate(&self, format: PixelFormat, buffers: u32, size: Size) -> Result<()> {
        self.pool
            .Recreate(
                &self.device,
                directx_format(format),
                buffers as i32,
                to_size_int32(size),
            )
            .context("Direct3D11CaptureFramePool::Recreate")
    }

    fn on_frame_arrived(&self, handler: FrameArrivedHandler) -> Result<()> {
        let token = self
            .pool
            .FrameArrived(&TypedEventHandler::<
                Direct3D11CaptureFramePool,
                IInspectable,
            >::new(move |_, _| handler().map_err(to_windows_error)))
            .context("FrameArrived")?;
        *self.frame_arrived_token.lock() = Some(token);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(token) = self.frame_arrived_token.lock().take() {
            self.pool
                .RemoveFrameArrived(token)
                .context("RemoveFrameArrived")?;
        }
        self.pool.Close().context("Direct3D11CaptureFramePool::Close")
    }
}

pub struct WgcSession {
    session: GraphicsCaptureSession,
}

unsafe impl Send for WgcSession {}

impl WgcSession {
    pub(crate) fn new(pool: &WgcPool, item: &WgcItem, options: &RelayOptions) -> Result<Self> {
        let session = pool
            .pool
            .CreateCaptureSession(&item.item)
            .context("CreateCaptureSession")?;
        if let Err(e) = session.SetIsCursorCaptureEnabled(options.cursor_capture_enabled) {
            log::debug!("SetIsCursorCaptureEnabled unsupported: {:?}", e);
        }
        // Only present on Windows 11 and later.
        if let Err(e) = session.SetIsBorderRequired(options.border_required) {
            log::debug!("SetIsBorderRequired unsupported: {:?}", e);
        }
        Ok(Self { session })
    }
}

impl CaptureSession for WgcSession {
    fn start(&self) -> Result<()> {
        self.session.StartCapture().context("StartCapture")
    }

    fn close(&self) -> Result<()> {
        self.session.Close().context("GraphicsCaptureSession::Close")
    }
}

#[cfg(test)]
mod tests {
    use windows::Win32::Foundation::S_OK;
    use windows::Win32::Graphics::Dxgi::DXGI_ERROR_DEVICE_REMOVED;

    use super::*;

    #[test]
    fn only_null_frame_counts_as_missing() {
        assert!(is_missing_frame(&windows::core::Error::from(S_OK)));
        assert!(!is_missing_frame(&windows::core::Error::from(E_FAIL)));
        assert!(!is_missing_frame(&windows::core::Error::from(
            DXGI_ERROR_DEVICE_REMOVED
        )));
    }
}

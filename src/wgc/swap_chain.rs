use anyhow::{Context, Result};
use windows::core::Interface;
use windows::Win32::Graphics::Direct3D11::{ID3D11Resource, ID3D11Texture2D, D3D11_BOX, D3D11_TEXTURE2D_DESC};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_ALPHA_MODE_PREMULTIPLIED, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{
    IDXGIAdapter, IDXGIDevice, IDXGIFactory2, IDXGISwapChain1, DXGI_ERROR_DEVICE_REMOVED,
    DXGI_PRESENT, DXGI_PRESENT_PARAMETERS, DXGI_SCALING_STRETCH, DXGI_SWAP_CHAIN_DESC1,
    DXGI_SWAP_CHAIN_FLAG, DXGI_SWAP_EFFECT_FLIP_SEQUENTIAL, DXGI_USAGE_RENDER_TARGET_OUTPUT,
};

use super::capture::WgcFrame;
use super::device::DeviceHandles;
use super::dxgi_format;
use crate::backend::{CaptureFrame, SwapChain};
use crate::{PixelFormat, Size};

/// Composition swap chain the relay presents into.
pub struct WgcSwapChain {
    pub(crate) swap_chain: IDXGISwapChain1,
    handles: DeviceHandles,
}

// The immediate context is only used while the relay holds its resource lock.
unsafe impl Send for WgcSwapChain {}

impl WgcSwapChain {
    pub(crate) fn new(
        handles: &DeviceHandles,
        size: Size,
        format: PixelFormat,
        buffers: u32,
    ) -> Result<Self> {
        let dxgi_device: IDXGIDevice = handles.d3d_device.cast()?;
        let adapter: IDXGIAdapter = unsafe { dxgi_device.GetAdapter() }.context("GetAdapter")?;
        let factory: IDXGIFactory2 = unsafe { adapter.GetParent() }.context("IDXGIFactory2")?;

        let desc = DXGI_SWAP_CHAIN_DESC1 {
            Width: size.width,
            Height: size.height,
            Format: dxgi_format(format),
            Stereo: false.into(),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: buffers,
            Scaling: DXGI_SCALING_STRETCH,
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_SEQUENTIAL,
            AlphaMode: DXGI_ALPHA_MODE_PREMULTIPLIED,
            Flags: 0,
        };
        let swap_chain =
            unsafe { factory.CreateSwapChainForComposition(&handles.d3d_device, &desc, None) }
                .context("CreateSwapChainForComposition")?;

        Ok(Self {
            swap_chain,
            handles: handles.clone(),
        })
    }

    fn log_device_removed(&self, err: &windows::core::Error) {
        if err.code() == DXGI_ERROR_DEVICE_REMOVED {
            let reason = unsafe { self.handles.d3d_device.GetDeviceRemovedReason() };
            log::error!("GPU device removed: {:?}", reason);
        }
    }
}

fn texture_size(texture: &ID3D11Texture2D) -> Size {
    let mut desc = D3D11_TEXTURE2D_DESC::default();
    unsafe { texture.GetDesc(&mut desc) };
    Size::new(desc.Width, desc.Height)
}

impl SwapChain for WgcSwapChain {
    type Frame = WgcFrame;

    fn resize_buffers(&self, buffers: u32, size: Size, format: PixelFormat) -> Result<()> {
        unsafe {
            self.swap_chain.ResizeBuffers(
                buffers,
                size.width,
                size.height,
                dxgi_format(format),
                DXGI_SWAP_CHAIN_FLAG(0),
            )
        }
        .map_err(|e| {
            self.log_device_removed(&e);
            e
        })
        .context("ResizeBuffers")
    }

    fn copy_to_back_buffer(&self, frame: &WgcFrame) -> Result<()> {
        let source = frame.texture().context("frame surface")?;
        let back_buffer: ID3D11Texture2D =
            unsafe { self.swap_chain.GetBuffer(0) }.context("GetBuffer")?;

        let region = texture_size(&back_buffer)
            .intersect(texture_size(&source))
            .intersect(frame.content_size()?);
        let copy_box = D3D11_BOX {
            left: 0,
            top: 0,
            front: 0,
            right: region.width,
            bottom: region.height,
            back: 1,
        };

        let copy_dest: ID3D11Resource = back_buffer.cast()?;
        let copy_src: ID3D11Resource = source.cast()?;
        unsafe {
            self.handles.context.CopySubresourceRegion(
                &copy_dest,
                0,
                0,
                0,
                0,
                &copy_src,
                0,
                Some(&copy_box),
            );
        }
        Ok(())
    }

    fn present(&self, sync_interval: u32) -> Result<()> {
        let parameters = DXGI_PRESENT_PARAMETERS::default();
        unsafe {
            self.swap_chain
                .Present1(sync_interval, DXGI_PRESENT(0), &parameters)
                .ok()
        }
        .map_err(|e| {
            self.log_device_removed(&e);
            e
        })
        .context("Present1")
    }
}

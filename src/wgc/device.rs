use anyhow::Context;
use parking_lot::Once;
use windows::core::{Interface, Result};
use windows::Graphics::DirectX::Direct3D11::IDirect3DDevice;
use windows::Win32::Graphics::Direct3D::{D3D_DRIVER_TYPE_HARDWARE, D3D_DRIVER_TYPE_WARP};
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, D3D11_CREATE_DEVICE_BGRA_SUPPORT,
    D3D11_SDK_VERSION,
};
use windows::Win32::Graphics::Dxgi::{IDXGIDevice, DXGI_ERROR_UNSUPPORTED};
use windows::Win32::System::WinRT::Direct3D11::{
    CreateDirect3D11DeviceFromDXGIDevice, IDirect3DDxgiInterfaceAccess,
};
use windows::Win32::System::WinRT::{RoInitialize, RO_INIT_MULTITHREADED};
use windows::Win32::UI::HiDpi::{
    SetProcessDpiAwarenessContext, DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE,
    DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2,
};
use windows::Win32::UI::WindowsAndMessaging::SetProcessDPIAware;

/// Initialises WinRT for the process and makes it per-monitor DPI aware so
/// capture sizes are reported in physical pixels. Runs once.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if let Err(e) = unsafe { RoInitialize(RO_INIT_MULTITHREADED) } {
            log::debug!("RoInitialize: {:?}", e);
        }
        become_dpi_aware();
    });
}

fn become_dpi_aware() {
    unsafe {
        if SetProcessDpiAwarenessContext(DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2).is_ok() {
            return;
        }
        let aware = SetProcessDpiAwarenessContext(DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE).is_ok();
        log::info!("SetProcessDpiAwarenessContext [{}]", aware);
        if !aware {
            let aware = SetProcessDPIAware().as_bool();
            log::info!("SetProcessDPIAware [{}]", aware);
        }
    }
}

pub(crate) fn convert_u16_to_string(data: &[u16]) -> String {
    let end = data.iter().position(|c| *c == 0).unwrap_or(data.len());
    String::from_utf16_lossy(&data[..end])
}

/// D3D11 device with BGRA support, hardware first and WARP as fallback.
pub(crate) fn create_d3d_device() -> anyhow::Result<ID3D11Device> {
    for driver_type in [D3D_DRIVER_TYPE_HARDWARE, D3D_DRIVER_TYPE_WARP] {
        let mut device = None;
        let result = unsafe {
            D3D11CreateDevice(
                None,
                driver_type,
                None,
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                None,
            )
        };
        match result {
            Ok(_) => {
                if let Some(device) = device {
                    log::debug!("D3D11 device ok for {:?}", driver_type);
                    return Ok(device);
                }
            }
            Err(e) if e.code() == DXGI_ERROR_UNSUPPORTED => {
                log::debug!("D3D11 driver {:?} unsupported", driver_type);
                continue;
            }
            Err(e) => return Err(e).context("D3D11CreateDevice"),
        }
    }
    anyhow::bail!("failed to create D3D device with any driver type")
}

pub(crate) fn create_direct3d_device(d3d_device: &ID3D11Device) -> Result<IDirect3DDevice> {
    let dxgi_device: IDXGIDevice = d3d_device.cast()?;
    let inspectable = unsafe { CreateDirect3D11DeviceFromDXGIDevice(&dxgi_device)? };
    inspectable.cast()
}

pub(crate) fn get_d3d_interface_from_object<S: Interface, R: Interface>(object: &S) -> Result<R> {
    let access: IDirect3DDxgiInterfaceAccess = object.cast()?;
    let object = unsafe { access.GetInterface::<R>()? };
    Ok(object)
}

/// Name of the adapter a device runs on, for logging.
pub(crate) fn adapter_description(d3d_device: &ID3D11Device) -> Result<String> {
    let dxgi_device: IDXGIDevice = d3d_device.cast()?;
    let desc = unsafe { dxgi_device.GetAdapter()?.GetDesc()? };
    Ok(format!(
        "{} VendorId=[{:04x}] DeviceId=[{:04x}]",
        convert_u16_to_string(&desc.Description),
        desc.VendorId,
        desc.DeviceId
    ))
}

/// Device handles shared by every object of one relay.
#[derive(Clone)]
pub(crate) struct DeviceHandles {
    pub d3d_device: ID3D11Device,
    pub context: ID3D11DeviceContext,
    pub direct3d_device: IDirect3DDevice,
}

impl DeviceHandles {
    pub fn new(d3d_device: ID3D11Device) -> anyhow::Result<Self> {
        let context = unsafe { d3d_device.GetImmediateContext() }.context("GetImmediateContext")?;
        let direct3d_device =
            create_direct3d_device(&d3d_device).context("CreateDirect3D11DeviceFromDXGIDevice")?;
        Ok(Self {
            d3d_device,
            context,
            direct3d_device,
        })
    }
}

//! Relays the primary monitor (or the monitor index given as the first
//! argument) into a composition swap chain for a few seconds and reports
//! what happened.

#[cfg(windows)]
fn main() -> anyhow::Result<()> {
    use std::time::Duration;

    use env_logger::{init_from_env, Env, DEFAULT_FILTER_ENV};
    use wgc_relay::wgc::{enumerate_monitors, primary_monitor, WgcDevice, WgcItem};
    use wgc_relay::{FrameRelay, RelayOptions};

    init_from_env(Env::default().filter_or(DEFAULT_FILTER_ENV, "debug"));

    let monitor = match std::env::args().nth(1) {
        Some(index) => {
            let index: usize = index.parse()?;
            let monitors = enumerate_monitors();
            *monitors.get(index).ok_or_else(|| {
                anyhow::anyhow!("Display[{}] not found ({} monitors detected)", index, monitors.len())
            })?
        }
        None => primary_monitor(),
    };

    let device = WgcDevice::new()?;
    let item = WgcItem::for_monitor(monitor)?;
    log::info!("capturing [{}]", item.display_name().unwrap_or_default());

    let relay = FrameRelay::new(device, item, RelayOptions::from_env())?;
    relay.start_capture()?;
    std::thread::sleep(Duration::from_secs(5));

    log::info!("{:?} at {}", relay.stats(), relay.content_size()?);
    relay.close();
    Ok(())
}

#[cfg(not(windows))]
fn main() {
    eprintln!("relay_monitor needs Windows.Graphics.Capture; try the relay_software demo");
}

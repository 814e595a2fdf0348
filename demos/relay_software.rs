use std::thread;
use std::time::Duration;

use env_logger::{init_from_env, Env, DEFAULT_FILTER_ENV};
use wgc_relay::software::{SoftwareCompositor, SoftwareDevice, SoftwareSource};
use wgc_relay::{FrameRelay, RelayOptions, Size};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_from_env(Env::default().filter_or(DEFAULT_FILTER_ENV, "debug"));

    let device = SoftwareDevice::new();
    let source = SoftwareSource::new(Size::new(800, 600));
    let relay = FrameRelay::new(device.clone(), source.item(), RelayOptions::from_env())?;
    let surface = relay.create_surface(&SoftwareCompositor)?;
    relay.start_capture()?;

    // Stands in for the capture service: ~60 frames a second, the source
    // grows halfway through.
    let producer = {
        let source = source.clone();
        thread::spawn(move || -> anyhow::Result<()> {
            for i in 0..120 {
                if i == 60 {
                    source.resize(Size::new(1024, 768));
                }
                source.deliver()?;
                thread::sleep(Duration::from_millis(16));
            }
            Ok(())
        })
    };

    producer
        .join()
        .map_err(|_| "producer thread panicked")??;

    if let Some(shown) = surface.latest() {
        log::info!("last presented frame {:?} at {}", shown.frame, shown.size);
    }
    log::info!("{:?}", relay.stats());

    source.close();
    log::info!("relay closed by source: {}", relay.is_closed());
    log::info!("live GPU resources: {}", device.live_resources());
    Ok(())
}

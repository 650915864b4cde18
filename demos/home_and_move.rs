//! Enables and homes one channel of a BBD203, then moves it back and forth and prints the
//! channel status after every move.
//!
//! ```text
//! cargo run --example home_and_move --features serialport -- /dev/ttyUSB0 1
//! ```
use std::time::Duration;

use apt_stage::{Controller, DriverConfig, EventKind, StopMode};

mod _logging;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    _logging::init("home_and_move", 1);

    let mut args = std::env::args().skip(1);
    let path = args.next().unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let channel: u8 = args.next().map(|c| c.parse()).transpose()?.unwrap_or(1);

    // APT controllers talk 115200 8N1 with hardware flow control
    let port = serialport::new(&path, 115_200)
        .flow_control(serialport::FlowControl::Hardware)
        .timeout(Duration::from_millis(5))
        .open()?;
    let config = DriverConfig::default().with_hardware_info(true);
    let controller = Controller::connect(port, config)?;

    controller.register_completion_callback(channel, EventKind::Error, |event| {
        log::error!("channel {} reported {:?}", event.channel, event.status);
        Ok(())
    })?;

    controller.enable_channel(channel, true)?;
    controller.set_velocity_params(channel, 0.0, 50.0, 200.0)?;
    log::info!("velocity profile: {:?}", controller.velocity_params(channel)?);

    log::info!("homing channel {}", channel);
    controller.home(channel, Duration::from_secs(60))?;

    for target in [10.0, 25.0, 5.0, 0.0] {
        if let Err(e) = controller.move_absolute(channel, target, Duration::from_secs(10)) {
            log::error!("move to {} failed: {}", target, e);
            controller.stop(channel, StopMode::Profiled)?;
            break;
        }
        let status = controller.query_status(channel)?;
        log::info!(
            "at {:.4} ({} counts), settled: {}",
            status.position,
            status.position_counts,
            status.status.settled()
        );
    }

    controller.enable_channel(channel, false)?;
    controller.disconnect();
    Ok(())
}

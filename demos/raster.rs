//! Scans a serpentine raster with channels 1 (x) and 2 (y) of a BBD203.
//!
//! The x axis sweeps without blocking while the y axis steps between lines, showing how the
//! `start_*` methods and completion callbacks combine.
//!
//! ```text
//! cargo run --example raster --features serialport -- /dev/ttyUSB0
//! ```
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use apt_stage::{Controller, DriverConfig, EventKind};

mod _logging;

const X: u8 = 1;
const Y: u8 = 2;
const LINES: usize = 5;
const WIDTH: f64 = 20.0;
const PITCH: f64 = 0.5;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    _logging::init("raster", 0);

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let port = serialport::new(&path, 115_200)
        .flow_control(serialport::FlowControl::Hardware)
        .timeout(Duration::from_millis(5))
        .open()?;
    let controller = Controller::connect(port, DriverConfig::default().with_channel_count(2))?;

    let sweeps = Arc::new(AtomicUsize::new(0));
    let counter = sweeps.clone();
    controller.register_completion_callback(X, EventKind::MoveCompleted, move |event| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!("sweep {} done at {} counts", n, event.position_counts);
        Ok(())
    })?;

    for channel in [X, Y] {
        controller.enable_channel(channel, true)?;
        controller.set_velocity_params(channel, 0.0, 25.0, 100.0)?;
    }
    controller.home_all(Duration::from_secs(60))?;

    for line in 0..LINES {
        let x_target = if line % 2 == 0 { WIDTH } else { 0.0 };
        let sweep = controller.start_move_absolute(X, x_target, Duration::from_secs(10))?;
        while !sweep.is_finished() {
            log::debug!("x at {:.3}", controller.get_position(X)?);
            std::thread::sleep(Duration::from_millis(100));
        }
        sweep.wait()?;
        controller.move_relative(Y, PITCH, Duration::from_secs(5))?;
    }

    log::info!(
        "{} sweeps, y at {:.3}",
        sweeps.load(Ordering::SeqCst),
        controller.get_position(Y)?
    );
    controller.disconnect();
    Ok(())
}

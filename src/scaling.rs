//! Conversion between physical units and device counts.
//!
//! All conversions are linear and unclamped: values beyond `i64` saturate and NaN maps to 0,
//! so callers validate their input and the range of the wire field themselves.
//! Rounding to whole counts means a round trip through counts loses up to half a count.

/// Controller servo sample period in seconds. Fixed by the firmware.
pub const SAMPLE_PERIOD: f64 = 102.4e-6;

const VELOCITY_SCALE: f64 = SAMPLE_PERIOD * 65536.0;
const ACCELERATION_SCALE: f64 = SAMPLE_PERIOD * SAMPLE_PERIOD * 65536.0;

/// Encoder resolution shared by every channel of a controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingContext {
    encoder_counts_per_unit: f64,
}

impl Default for ScalingContext {
    /// 20000 counts per millimetre, the MLS203 stage.
    fn default() -> Self {
        ScalingContext::new(20_000.0)
    }
}

impl ScalingContext {
    /// Creates a context for an encoder with `encoder_counts_per_unit` counts per position unit.
    pub fn new(encoder_counts_per_unit: f64) -> Self {
        ScalingContext {
            encoder_counts_per_unit,
        }
    }

    /// Encoder counts per position unit.
    pub fn encoder_counts_per_unit(&self) -> f64 {
        self.encoder_counts_per_unit
    }

    /// Position (or distance) to counts.
    pub fn position_to_counts(&self, position: f64) -> i64 {
        (self.encoder_counts_per_unit * position).round() as i64
    }

    /// Counts to position.
    pub fn counts_to_position(&self, counts: i64) -> f64 {
        counts as f64 / self.encoder_counts_per_unit
    }

    /// Velocity in units/s to device velocity units.
    pub fn velocity_to_counts(&self, velocity: f64) -> i64 {
        (self.encoder_counts_per_unit * VELOCITY_SCALE * velocity).round() as i64
    }

    /// Device velocity units to units/s.
    pub fn counts_to_velocity(&self, counts: i64) -> f64 {
        counts as f64 / (self.encoder_counts_per_unit * VELOCITY_SCALE)
    }

    /// Acceleration in units/s² to device acceleration units.
    pub fn acceleration_to_counts(&self, acceleration: f64) -> i64 {
        (self.encoder_counts_per_unit * ACCELERATION_SCALE * acceleration).round() as i64
    }

    /// Device acceleration units to units/s².
    pub fn counts_to_acceleration(&self, counts: i64) -> f64 {
        counts as f64 / (self.encoder_counts_per_unit * ACCELERATION_SCALE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position() {
        let s = ScalingContext::new(20_000.0);
        assert_eq!(s.position_to_counts(10.0), 200_000);
        assert_eq!(s.counts_to_position(200_000), 10.0);
        assert_eq!(s.position_to_counts(-0.25), -5000);
    }

    #[test]
    fn position_round_trip_within_one_count() {
        let s = ScalingContext::default();
        let one_count = 1.0 / s.encoder_counts_per_unit();
        for p in [0.0, 1e-6, 0.123_456_7, -3.333_333, 12.5, 99.999_99, -150.000_02] {
            let back = s.counts_to_position(s.position_to_counts(p));
            assert!((back - p).abs() <= one_count, "{p} -> {back}");
        }
    }

    #[test]
    fn velocity() {
        let s = ScalingContext::new(20_000.0);
        // 20000 * 102.4e-6 * 65536 = 134217.728
        assert_eq!(s.velocity_to_counts(1.0), 134_218);
        assert_eq!(s.velocity_to_counts(0.0), 0);
        assert!((s.counts_to_velocity(134_218) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn acceleration_follows_the_formula() {
        let s = ScalingContext::new(20_000.0);
        // 20000 * (102.4e-6)^2 * 65536 = 13.7438953...
        assert_eq!(s.acceleration_to_counts(1.0), 14);
        assert_eq!(s.acceleration_to_counts(5.0), 69);
        assert_eq!(s.acceleration_to_counts(100.0), 1374);
        assert!((s.counts_to_acceleration(1374) - 100.0).abs() < 0.05);
    }
}

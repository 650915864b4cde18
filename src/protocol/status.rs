use bitflags::bitflags;
use itertools::Itertools;

bitflags! {
    /// The 32 bit channel status register.
    ///
    /// Several bits are routinely set at once, so test with [`StatusBits::contains`]
    /// or the accessors below, never by comparing the whole register.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusBits: u32 {
        /// Forward hardware limit switch active.
        const FORWARD_LIMIT = 0x0000_0001;
        /// Reverse hardware limit switch active.
        const REVERSE_LIMIT = 0x0000_0002;
        /// Moving in the forward direction.
        const MOVING_FORWARD = 0x0000_0010;
        /// Moving in the reverse direction.
        const MOVING_REVERSE = 0x0000_0020;
        /// Jogging forward.
        const JOGGING_FORWARD = 0x0000_0040;
        /// Jogging reverse.
        const JOGGING_REVERSE = 0x0000_0080;
        /// Homing in progress.
        const HOMING = 0x0000_0200;
        /// Homed.
        const HOMED = 0x0000_0400;
        /// Position loop is tracking.
        const TRACKING = 0x0000_1000;
        /// Settled in position.
        const SETTLED = 0x0000_2000;
        /// Following (motion) error.
        const FOLLOWING_ERROR = 0x0000_4000;
        /// Motor output enabled.
        const MOTOR_ENABLED = 0x8000_0000;

        // bits the firmware uses that we don't name
        const _ = !0;
    }
}

impl StatusBits {
    /// Any bit that means the stage is in motion.
    pub const MOTION: StatusBits = StatusBits::MOVING_FORWARD
        .union(StatusBits::MOVING_REVERSE)
        .union(StatusBits::JOGGING_FORWARD)
        .union(StatusBits::JOGGING_REVERSE)
        .union(StatusBits::HOMING);

    /// Bits that indicate a fault the caller should look at.
    pub const ERRORS: StatusBits = StatusBits::FOLLOWING_ERROR;

    /// Homing in progress.
    pub fn homing(self) -> bool {
        self.contains(StatusBits::HOMING)
    }
    /// Channel has been homed.
    pub fn homed(self) -> bool {
        self.contains(StatusBits::HOMED)
    }
    /// Position loop tracking.
    pub fn tracking(self) -> bool {
        self.contains(StatusBits::TRACKING)
    }
    /// Settled in position.
    pub fn settled(self) -> bool {
        self.contains(StatusBits::SETTLED)
    }
    /// Following error.
    pub fn following_error(self) -> bool {
        self.contains(StatusBits::FOLLOWING_ERROR)
    }
    /// Motor output enabled.
    pub fn motor_enabled(self) -> bool {
        self.contains(StatusBits::MOTOR_ENABLED)
    }
    /// Moving forward.
    pub fn moving_forward(self) -> bool {
        self.contains(StatusBits::MOVING_FORWARD)
    }
    /// Moving in reverse.
    pub fn moving_reverse(self) -> bool {
        self.contains(StatusBits::MOVING_REVERSE)
    }
    /// Any of the motion bits, homing included.
    pub fn moving(self) -> bool {
        self.intersects(StatusBits::MOTION)
    }
    /// Any error bit.
    pub fn has_error(self) -> bool {
        self.intersects(StatusBits::ERRORS)
    }
}

impl std::fmt::Debug for StatusBits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.iter_names().map(|(name, _)| name).join(" | ");
        let unnamed = self.bits() & !StatusBits::all().iter_names().fold(0, |acc, (_, b)| acc | b.bits());
        match (names.is_empty(), unnamed) {
            (true, 0) => write!(f, "StatusBits(empty)"),
            (false, 0) => write!(f, "StatusBits({names})"),
            (true, u) => write!(f, "StatusBits({u:#010x})"),
            (false, u) => write!(f, "StatusBits({names} | {u:#010x})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn homed_and_settled_only() {
        let status = StatusBits::from_bits_retain(0x0000_0400 | 0x0000_2000);
        assert!(status.homed());
        assert!(status.settled());
        assert!(!status.homing());
        assert!(!status.tracking());
        assert!(!status.following_error());
        assert!(!status.motor_enabled());
        assert!(!status.moving_forward());
        assert!(!status.moving_reverse());
        assert!(!status.moving());
        assert!(!status.has_error());
    }

    #[test]
    fn unnamed_bits_are_kept() {
        let status = StatusBits::from_bits_retain(0x8010_0400);
        assert_eq!(status.bits(), 0x8010_0400);
        assert!(status.motor_enabled());
        assert!(status.homed());
        assert_eq!(
            format!("{status:?}"),
            "StatusBits(HOMED | MOTOR_ENABLED | 0x00100000)"
        );
    }

    #[test]
    fn homing_counts_as_motion() {
        assert!(StatusBits::HOMING.moving());
        assert!((StatusBits::MOVING_REVERSE | StatusBits::MOTOR_ENABLED).moving());
        assert!(!StatusBits::SETTLED.moving());
    }
}

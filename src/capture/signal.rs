//! Point-in-time description of the input signal

use std::fmt;

/// Upper bound (exclusive) for a plausible active width or height.
pub const MAX_CAPTURABLE_EXTENT: u32 = 9999;

/// Device frame durations are expressed in 100 ns units.
pub const FRAME_DURATION_UNITS_PER_SEC: u64 = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalState {
    #[default]
    None,
    Unsupported,
    Locking,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameType {
    #[default]
    Normal,
    Interlaced,
    TopBottom,
    SideBySide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorFormat {
    #[default]
    Unknown,
    Rgb,
    YuvBt601,
    YuvBt709,
    YuvBt2020,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantRange {
    #[default]
    Unknown,
    Full,
    Limited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SatRange {
    #[default]
    Unknown,
    Full,
    Limited,
    ExtendedGamut,
}

/// One signal-status read. Equality covers every field and is the only
/// thing the controller uses to decide that nothing changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalSnapshot {
    pub state: SignalState,
    pub cx: u32,
    pub cy: u32,
    pub cx_total: u32,
    pub cy_total: u32,
    pub interlaced: bool,
    /// Frame duration in 100 ns units
    pub frame_duration: u32,
    pub aspect_x: u32,
    pub aspect_y: u32,
    pub segmented_frame: bool,
    pub frame_type: FrameType,
    pub color_format: ColorFormat,
    pub quant_range: QuantRange,
    pub sat_range: SatRange,
}

impl SignalSnapshot {
    /// Rejects garbage reads from a device in a transitional state.
    pub fn is_capturable(&self) -> bool {
        (1..MAX_CAPTURABLE_EXTENT).contains(&self.cx) && (1..MAX_CAPTURABLE_EXTENT).contains(&self.cy)
    }

    /// Frames per second rounded to the nearest integer, 0 when unknown.
    pub fn frame_rate(&self) -> u32 {
        if self.frame_duration == 0 {
            return 0;
        }
        let duration = self.frame_duration as u64;
        ((FRAME_DURATION_UNITS_PER_SEC + duration / 2) / duration) as u32
    }
}

impl fmt::Display for SignalSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}x{} ({}x{} total){} @ {} fps",
            self.state,
            self.cx,
            self.cy,
            self.cx_total,
            self.cy_total,
            if self.interlaced { "i" } else { "p" },
            self.frame_rate()
        )
    }
}

#[cfg(test)]
pub(crate) fn locked(cx: u32, cy: u32) -> SignalSnapshot {
    SignalSnapshot {
        state: SignalState::Locked,
        cx,
        cy,
        cx_total: cx,
        cy_total: cy,
        frame_duration: 166_667,
        aspect_x: 16,
        aspect_y: 9,
        color_format: ColorFormat::YuvBt709,
        quant_range: QuantRange::Limited,
        sat_range: SatRange::Limited,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variants(base: SignalSnapshot) -> Vec<SignalSnapshot> {
        vec![
            SignalSnapshot { state: SignalState::Locking, ..base },
            SignalSnapshot { cx: base.cx + 1, ..base },
            SignalSnapshot { cy: base.cy + 1, ..base },
            SignalSnapshot { cx_total: base.cx_total + 1, ..base },
            SignalSnapshot { cy_total: base.cy_total + 1, ..base },
            SignalSnapshot { interlaced: !base.interlaced, ..base },
            SignalSnapshot { frame_duration: base.frame_duration + 1, ..base },
            SignalSnapshot { aspect_x: base.aspect_x + 1, ..base },
            SignalSnapshot { aspect_y: base.aspect_y + 1, ..base },
            SignalSnapshot { segmented_frame: !base.segmented_frame, ..base },
            SignalSnapshot { frame_type: FrameType::TopBottom, ..base },
            SignalSnapshot { color_format: ColorFormat::Rgb, ..base },
            SignalSnapshot { quant_range: QuantRange::Full, ..base },
            SignalSnapshot { sat_range: SatRange::ExtendedGamut, ..base },
        ]
    }

    #[test]
    fn test_equality_is_reflexive_and_commutative() {
        let a = locked(1920, 1080);
        let b = locked(1920, 1080);
        assert_eq!(a, a);
        assert_eq!(a, b);
        assert_eq!(b, a);
    }

    #[test]
    fn test_any_field_difference_breaks_equality() {
        let base = locked(1920, 1080);
        for changed in variants(base) {
            assert_ne!(base, changed, "{:?}", changed);
            assert_ne!(changed, base, "{:?}", changed);
        }
    }

    #[test]
    fn test_capturable_bounds() {
        assert!(!locked(0, 1080).is_capturable());
        assert!(!locked(1920, 0).is_capturable());
        assert!(!locked(9999, 1080).is_capturable());
        assert!(!locked(1920, 9999).is_capturable());
        assert!(locked(1, 1).is_capturable());
        assert!(locked(9998, 9998).is_capturable());
        assert!(locked(1920, 1080).is_capturable());
    }

    #[test]
    fn test_frame_rate() {
        assert_eq!(locked(1920, 1080).frame_rate(), 60);
        let ntsc = SignalSnapshot { frame_duration: 333_667, ..locked(720, 480) };
        assert_eq!(ntsc.frame_rate(), 30);
        assert_eq!(SignalSnapshot::default().frame_rate(), 0);
    }
}

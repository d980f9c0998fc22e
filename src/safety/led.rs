//! LED pattern presentation.
//!
//! `pattern_for` is a pure function mapping a [`ResponseLevel`] to one of
//! five indicator patterns; the monitor caches the last level itself to
//! avoid redundant effect calls.

use crate::health::ResponseLevel;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    System,
    Communication,
    Network,
    Error,
    Power,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Off,
    Solid,
    SlowBlink(DurationMs),
    FastBlink(DurationMs),
    Warning(DurationMs),
    Error(DurationMs),
}

/// `Duration` isn't `Eq`, so the period is carried as whole milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationMs(pub u64);

impl DurationMs {
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.0)
    }
}

pub type LedEffect = (Indicator, Pattern);

/// The fixed response-level → LED-pattern matrix.
pub fn pattern_for(level: ResponseLevel) -> [LedEffect; 5] {
    use Indicator::*;
    use Pattern::*;
    match level {
        ResponseLevel::Normal => [
            (System, Solid),
            (Communication, Solid),
            (Network, Solid),
            (Error, Off),
            (Power, Solid),
        ],
        ResponseLevel::Monitoring => [
            (System, SlowBlink(DurationMs(2_000))),
            (Communication, Solid),
            (Network, Solid),
            (Error, Off),
            (Power, Solid),
        ],
        ResponseLevel::Warning => [
            (System, Solid),
            (Communication, Warning(DurationMs(1_000))),
            (Network, Solid),
            (Error, SlowBlink(DurationMs(1_500))),
            (Power, Solid),
        ],
        ResponseLevel::Critical => [
            (System, FastBlink(DurationMs(500))),
            (Communication, Error(DurationMs(500))),
            (Network, SlowBlink(DurationMs(1_000))),
            (Error, FastBlink(DurationMs(500))),
            (Power, SlowBlink(DurationMs(1_000))),
        ],
        ResponseLevel::Emergency => [
            (System, Error(DurationMs(200))),
            (Communication, Error(DurationMs(200))),
            (Network, Error(DurationMs(200))),
            (Error, Solid),
            (Power, Error(DurationMs(200))),
        ],
    }
}

/// Effect sink the monitor drives.
pub trait LedEffects: Send + Sync {
    fn set_led_pattern(&self, indicator: Indicator, pattern: Pattern);
}

pub struct NullLedEffects;
impl LedEffects for NullLedEffects {
    fn set_led_pattern(&self, _indicator: Indicator, _pattern: Pattern) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_level_is_all_solid_except_error() {
        let effects = pattern_for(ResponseLevel::Normal);
        assert_eq!(effects[3], (Indicator::Error, Pattern::Off));
        assert_eq!(effects[0], (Indicator::System, Pattern::Solid));
    }

    #[test]
    fn emergency_level_flashes_everything_but_error() {
        let effects = pattern_for(ResponseLevel::Emergency);
        assert_eq!(effects[3], (Indicator::Error, Pattern::Solid));
        assert_eq!(effects[0], (Indicator::System, Pattern::Error(DurationMs(200))));
    }
}

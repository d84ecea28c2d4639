//! Channel Registry
//!
//! Per-pin, per-axis and per-bus state shared between the session's reader
//! task (the only writer of observed inputs) and facade callers. Each lookup
//! takes the map lock once, so a single channel is always read atomically;
//! nothing locks across channels.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use crate::error::{ControllerError, ControllerResult};

/// Highest value accepted by the firmware's PWM output.
pub const OUTPUT_MAX: u8 = 255;

/// Addressable channel on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelId {
    /// Digital pin, also used for PWM and servo outputs
    Digital(u8),
    /// Analog input pin (A0, A1, ...)
    Analog(u8),
    /// Stepper axis, by firmware motor id
    Axis(u8),
    /// I2C port
    I2cBus(u8),
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Digital(pin) => write!(f, "D{}", pin),
            ChannelId::Analog(pin) => write!(f, "A{}", pin),
            ChannelId::Axis(motor) => write!(f, "stepper axis {}", motor),
            ChannelId::I2cBus(port) => write!(f, "I2C{}", port),
        }
    }
}

/// Mode a channel is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub enum PinMode {
    #[default]
    Unset,
    Digital,
    Analog,
    Servo,
    Stepper,
    I2c,
}

/// Snapshot of one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Channel {
    /// Configured mode
    pub mode: PinMode,
    /// Last observed input, if any report arrived
    pub last_input: Option<i32>,
    /// Last value written to the wire
    pub last_output: Option<u8>,
}

/// Clamp an output request to the firmware's PWM range.
///
/// Non-finite inputs map to 0.
pub fn clamp_output(value: f64) -> u8 {
    if !value.is_finite() {
        return 0;
    }
    value.round().clamp(0.0, f64::from(OUTPUT_MAX)) as u8
}

/// Shared per-channel state table.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<ChannelId, Channel>>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `channel` into `mode`, creating it on first use. Returns true when
    /// the channel was unconfigured before this call.
    ///
    /// Setting the mode a channel already holds is a no-op. Any other change
    /// on a configured channel fails with `InvalidTransition`; use
    /// [`ChannelRegistry::reconfigure`] to switch deliberately.
    pub fn set_mode(&self, channel: ChannelId, mode: PinMode) -> ControllerResult<bool> {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let entry = channels.entry(channel).or_default();
        match entry.mode {
            PinMode::Unset => {
                entry.mode = mode;
                Ok(true)
            }
            current if current == mode => Ok(false),
            current => Err(ControllerError::InvalidTransition {
                channel,
                current,
                requested: mode,
            }),
        }
    }

    /// Switch `channel` to `mode` regardless of its current mode. Memorized
    /// values from the previous mode are discarded.
    pub fn reconfigure(&self, channel: ChannelId, mode: PinMode) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let previous = channels.insert(
            channel,
            Channel {
                mode,
                ..Channel::default()
            },
        );
        if let Some(prev) = previous {
            if prev.mode != mode {
                tracing::info!(%channel, from = ?prev.mode, to = ?mode, "channel reconfigured");
            }
        }
    }

    /// Forget `channel` entirely, returning it to `Unset`.
    pub fn release(&self, channel: ChannelId) {
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel);
    }

    /// Store an observed input value. Called from the dispatch path only.
    pub fn record_input(&self, channel: ChannelId, raw: i32) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels.entry(channel).or_default().last_input = Some(raw);
    }

    /// Last observed input, 0 if nothing was ever reported.
    pub fn read_last(&self, channel: ChannelId) -> i32 {
        self.get(channel).and_then(|c| c.last_input).unwrap_or(0)
    }

    /// Remember a value that was written to the wire.
    pub fn memorize_output(&self, channel: ChannelId, value: u8) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels.entry(channel).or_default().last_output = Some(value);
    }

    /// Clamp `value` to the PWM range, remember it and return the wire value.
    pub fn write_and_memorize(&self, channel: ChannelId, value: f64) -> u8 {
        let clamped = clamp_output(value);
        self.memorize_output(channel, clamped);
        clamped
    }

    /// Last written output value, if any.
    pub fn output_value(&self, channel: ChannelId) -> Option<u8> {
        self.get(channel).and_then(|c| c.last_output)
    }

    /// Current mode (`Unset` for unknown channels).
    pub fn mode(&self, channel: ChannelId) -> PinMode {
        self.get(channel).map(|c| c.mode).unwrap_or_default()
    }

    /// Copy of one channel's state.
    pub fn get(&self, channel: ChannelId) -> Option<Channel> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&channel)
            .copied()
    }

    /// Number of channels touched so far.
    pub fn len(&self) -> usize {
        self.channels.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True before any channel was configured or observed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_output_range() {
        assert_eq!(clamp_output(-12.0), 0);
        assert_eq!(clamp_output(0.4), 0);
        assert_eq!(clamp_output(127.5), 128);
        assert_eq!(clamp_output(254.6), 255);
        assert_eq!(clamp_output(1000.0), 255);
        assert_eq!(clamp_output(f64::NAN), 0);
        assert_eq!(clamp_output(f64::INFINITY), 0);
    }

    #[test]
    fn test_clamp_matches_round_min_max() {
        for tenth in -500..3000 {
            let v = f64::from(tenth) / 10.0;
            let expected = v.round().min(255.0).max(0.0) as u8;
            assert_eq!(clamp_output(v), expected, "v = {}", v);
        }
    }

    #[test]
    fn test_read_last_defaults_to_zero() {
        let registry = ChannelRegistry::new();
        assert_eq!(registry.read_last(ChannelId::Analog(3)), 0);
        registry.record_input(ChannelId::Analog(3), 512);
        assert_eq!(registry.read_last(ChannelId::Analog(3)), 512);
        assert_eq!(registry.read_last(ChannelId::Analog(4)), 0);
    }

    #[test]
    fn test_set_mode_rejects_conflict() {
        let registry = ChannelRegistry::new();
        assert!(registry.set_mode(ChannelId::Digital(9), PinMode::Servo).unwrap());
        assert!(!registry.set_mode(ChannelId::Digital(9), PinMode::Servo).unwrap());

        let err = registry
            .set_mode(ChannelId::Digital(9), PinMode::Digital)
            .unwrap_err();
        assert!(matches!(
            err,
            ControllerError::InvalidTransition {
                current: PinMode::Servo,
                requested: PinMode::Digital,
                ..
            }
        ));
    }

    #[test]
    fn test_reconfigure_overrides_and_clears() {
        let registry = ChannelRegistry::new();
        let pin = ChannelId::Digital(5);
        registry.set_mode(pin, PinMode::Digital).unwrap();
        registry.memorize_output(pin, 200);

        registry.reconfigure(pin, PinMode::Servo);
        assert_eq!(registry.mode(pin), PinMode::Servo);
        assert_eq!(registry.output_value(pin), None);
    }

    #[test]
    fn test_write_and_memorize_clamps() {
        let registry = ChannelRegistry::new();
        let pin = ChannelId::Digital(6);
        assert_eq!(registry.write_and_memorize(pin, 300.0), 255);
        assert_eq!(registry.output_value(pin), Some(255));
        assert_eq!(registry.write_and_memorize(pin, f64::NAN), 0);
        assert_eq!(registry.output_value(pin), Some(0));
    }

    #[test]
    fn test_release_returns_channel_to_unset() {
        let registry = ChannelRegistry::new();
        let pin = ChannelId::Digital(8);
        registry.set_mode(pin, PinMode::Stepper).unwrap();
        registry.release(pin);
        assert_eq!(registry.mode(pin), PinMode::Unset);
        assert!(registry.set_mode(pin, PinMode::Servo).unwrap());
    }

    #[test]
    fn test_memorize_output() {
        let registry = ChannelRegistry::new();
        assert!(registry.is_empty());
        registry.memorize_output(ChannelId::Digital(3), 42);
        assert_eq!(registry.output_value(ChannelId::Digital(3)), Some(42));
        assert_eq!(registry.mode(ChannelId::Digital(3)), PinMode::Unset);
        assert_eq!(registry.len(), 1);
    }
}

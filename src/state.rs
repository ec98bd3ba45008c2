use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

/// Orientation of the gimbal head, in degrees.
///
/// The actuator's usable range is 0-180 on each axis, but range clamping is
/// the device's job; the gateway only rejects non-finite values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GimbalPosition {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

impl GimbalPosition {
    pub const CENTER: GimbalPosition = GimbalPosition {
        yaw: 90.0,
        pitch: 90.0,
        roll: 90.0,
    };

    pub fn new(yaw: f32, pitch: f32, roll: f32) -> Self {
        GimbalPosition { yaw, pitch, roll }
    }

    pub fn is_finite(&self) -> bool {
        self.yaw.is_finite() && self.pitch.is_finite() && self.roll.is_finite()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Axes3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// One IMU reading from the device link.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub accel: Axes3,
    pub gyro: Axes3,
}

/// Operating mode. Serialized as an integer on every wire surface:
/// 0 = manual, 1 = auto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Mode {
    Manual,
    Auto,
}

impl TryFrom<u8> for Mode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Mode::Manual),
            1 => Ok(Mode::Auto),
            other => Err(format!(
                "invalid mode {}, use 0 for manual or 1 for auto",
                other
            )),
        }
    }
}

impl From<Mode> for u8 {
    fn from(mode: Mode) -> u8 {
        match mode {
            Mode::Manual => 0,
            Mode::Auto => 1,
        }
    }
}

/// The authoritative view of the device. Exactly one instance lives inside
/// the router's [`StateStore`]; every connected peer receives a full copy on
/// attach and converges via broadcast deltas afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub mode: Mode,
    pub position: GimbalPosition,
    pub auto_target: GimbalPosition,
    pub sensors: SensorSample,
    pub connected: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        DeviceState {
            mode: Mode::Manual,
            position: GimbalPosition::CENTER,
            auto_target: GimbalPosition::CENTER,
            sensors: SensorSample::default(),
            connected: false,
        }
    }
}

/// Partial [`DeviceState`] carried by `status_update` messages. Only the
/// fields that are present are merged; everything else is left untouched.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<GimbalPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_target: Option<GimbalPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensors: Option<SensorSample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
}

/// Owned, lock-free holder of the single [`DeviceState`]. The command router
/// owns the store and is its only writer, which is what serializes state
/// mutation; everything else sees state through snapshots.
#[derive(Debug, Default)]
pub struct StateStore {
    state: DeviceState,
}

impl StateStore {
    pub fn new() -> Self {
        StateStore::default()
    }

    pub fn snapshot(&self) -> DeviceState {
        self.state.clone()
    }

    pub fn mode(&self) -> Mode {
        self.state.mode
    }

    pub fn position(&self) -> GimbalPosition {
        self.state.position
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.state.mode = mode;
    }

    pub fn set_position(&mut self, position: GimbalPosition) {
        self.state.position = position;
    }

    pub fn set_auto_target(&mut self, target: GimbalPosition) {
        self.state.auto_target = target;
    }

    pub fn set_sensors(&mut self, sensors: SensorSample) {
        self.state.sensors = sensors;
    }

    pub fn merge(&mut self, patch: StatePatch) {
        let StatePatch {
            mode,
            position,
            auto_target,
            sensors,
            connected,
        } = patch;

        if let Some(mode) = mode {
            self.state.mode = mode;
        }
        if let Some(position) = position {
            self.state.position = position;
        }
        if let Some(auto_target) = auto_target {
            self.state.auto_target = auto_target;
        }
        if let Some(sensors) = sensors {
            self.state.sensors = sensors;
        }
        if let Some(connected) = connected {
            self.state.connected = connected;
        }
    }
}

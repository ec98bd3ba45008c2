use serde::{Deserialize, Serialize};

use crate::preset::PresetMove;
use crate::state::{GimbalPosition, Mode, SensorSample, StatePatch};

/// Messages a peer may send on the real-time channel. The device link and UI
/// clients share this surface; anything with an unknown `type` falls through
/// to [`InboundMessage::Unrecognized`] and is logged and ignored rather than
/// faulting the connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    SensorUpdate {
        sensors: SensorSample,
        #[serde(default)]
        position: Option<GimbalPosition>,
    },
    StatusUpdate {
        state: StatePatch,
    },
    #[serde(other)]
    Unrecognized,
}

/// Command mirrors the gateway broadcasts to peers, one variant per
/// recognized `cmd` tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum CommandMessage {
    ModeChanged {
        mode: Mode,
    },
    PositionUpdate {
        position: GimbalPosition,
    },
    AutoTargetUpdate {
        target: GimbalPosition,
    },
    TimedMove {
        duration: u64,
        end_position: GimbalPosition,
    },
    ExecutePreset {
        preset: PresetMove,
    },
    Center,
}

/// Telemetry relayed to the other peers. Relays keep the inbound `type` tag,
/// so the frame a subscriber sees is the frame the device sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryMessage {
    SensorUpdate {
        sensors: SensorSample,
        #[serde(skip_serializing_if = "Option::is_none")]
        position: Option<GimbalPosition>,
    },
    StatusUpdate {
        state: StatePatch,
    },
}

/// Anything the gateway broadcasts: command mirrors under the `cmd` tag,
/// telemetry relays under the `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Command(CommandMessage),
    Telemetry(TelemetryMessage),
}

impl From<CommandMessage> for OutboundMessage {
    fn from(message: CommandMessage) -> Self {
        OutboundMessage::Command(message)
    }
}

impl From<TelemetryMessage> for OutboundMessage {
    fn from(message: TelemetryMessage) -> Self {
        OutboundMessage::Telemetry(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Mode;

    #[test]
    fn parses_sensor_update() {
        let msg: InboundMessage = serde_json::from_str(
            r#"{
                "type": "sensor_update",
                "sensors": {
                    "accel": {"x": 0.1, "y": 0.2, "z": 9.8},
                    "gyro": {"x": 0.0, "y": 0.0, "z": 0.0}
                },
                "position": {"yaw": 45, "pitch": 90, "roll": 90}
            }"#,
        )
        .unwrap();

        match msg {
            InboundMessage::SensorUpdate { sensors, position } => {
                assert_eq!(sensors.accel.z, 9.8);
                assert_eq!(position, Some(GimbalPosition::new(45.0, 90.0, 90.0)));
            }
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn parses_status_update_without_position() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"type": "status_update", "state": {"connected": true}}"#)
                .unwrap();

        assert_eq!(
            msg,
            InboundMessage::StatusUpdate {
                state: StatePatch {
                    connected: Some(true),
                    ..Default::default()
                }
            }
        );
    }

    #[test]
    fn unknown_type_falls_back_to_unrecognized() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"type": "telepathy", "strength": 11}"#).unwrap();
        assert_eq!(msg, InboundMessage::Unrecognized);
    }

    #[test]
    fn outbound_mode_change_uses_cmd_tag_and_integer_mode() {
        let frame = serde_json::to_string(&OutboundMessage::from(CommandMessage::ModeChanged {
            mode: Mode::Auto,
        }))
        .unwrap();
        assert_eq!(frame, r#"{"cmd":"mode_changed","mode":1}"#);
    }

    #[test]
    fn outbound_center_has_no_payload() {
        let frame = serde_json::to_string(&OutboundMessage::from(CommandMessage::Center)).unwrap();
        assert_eq!(frame, r#"{"cmd":"center"}"#);
    }

    #[test]
    fn status_relay_keeps_the_inbound_type_tag() {
        let frame = serde_json::to_string(&OutboundMessage::from(TelemetryMessage::StatusUpdate {
            state: StatePatch {
                connected: Some(true),
                ..Default::default()
            },
        }))
        .unwrap();
        assert_eq!(frame, r#"{"type":"status_update","state":{"connected":true}}"#);
    }

    #[test]
    fn sensor_relay_keeps_the_inbound_type_tag() {
        let frame = serde_json::to_value(&OutboundMessage::from(TelemetryMessage::SensorUpdate {
            sensors: SensorSample::default(),
            position: None,
        }))
        .unwrap();

        assert_eq!(
            frame,
            serde_json::json!({
                "type": "sensor_update",
                "sensors": {
                    "accel": {"x": 0.0, "y": 0.0, "z": 0.0},
                    "gyro": {"x": 0.0, "y": 0.0, "z": 0.0},
                },
            })
        );
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::preset::PresetMove;
use crate::protocol::{CommandMessage, OutboundMessage, TelemetryMessage};
use crate::registry::{PeerId, Registry};
use crate::session::DeviceSession;
use crate::state::{DeviceState, GimbalPosition, Mode, SensorSample, StatePatch, StateStore};
use crate::task::{ChannelCommandSink, ChannelCommandSource, Task};

/// A validated command against the device state. Commands arrive from the
/// HTTP layer, from real-time peers, and from the sequencer, and all of them
/// pass through [`Router::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetMode { mode: Mode },
    /// Direct position command; only legal in manual mode.
    SetPosition { position: GimbalPosition },
    SetAutoTarget { target: GimbalPosition },
    /// Telemetry from the device link. The device is the ground truth for
    /// where the actuator physically is, so a reported position overwrites
    /// the stored one.
    SensorUpdate {
        sensors: SensorSample,
        position: Option<GimbalPosition>,
    },
    StatusUpdate { patch: StatePatch },
    /// One-shot move relay; broadcast only, the device reports the resulting
    /// position via telemetry.
    TimedMove {
        duration: u64,
        end_position: GimbalPosition,
    },
    /// Announcement that a preset run has started; broadcast only.
    ExecutePreset { preset: PresetMove },
    Center,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("malformed command: {0}")]
    MalformedCommand(String),
    #[error("gimbal must be in manual mode")]
    InvalidMode,
    #[error("no preset named {0:?}")]
    UnknownPreset(String),
}

/// What a successful application did: the envelope that went out and how many
/// peers it reached. Delivery failures are not part of this result; broadcast
/// is best-effort and the registry handles dead peers itself.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedCommand {
    pub message: OutboundMessage,
    pub delivered: usize,
}

pub enum RouterRequest {
    Apply {
        command: Command,
        origin: Option<PeerId>,
    },
    Snapshot,
}

pub enum RouterResponse {
    Applied(AppliedCommand),
    Snapshot(DeviceState),
}

/// Validates and applies commands to the state store, then fans the outcome
/// out to peers. Owning the store outright is what serializes mutation.
pub struct Router {
    store: StateStore,
    registry: Arc<Registry>,
    session: Arc<DeviceSession>,
}

impl Router {
    pub fn new(registry: Arc<Registry>, session: Arc<DeviceSession>) -> Self {
        Router {
            store: StateStore::new(),
            registry,
            session,
        }
    }

    pub fn snapshot(&self) -> DeviceState {
        self.store.snapshot()
    }

    /// Applies one command: structural check, mode gate, mutation, broadcast,
    /// in that order. A rejected command leaves the store untouched. The
    /// `origin` peer, if any, is excluded from the fan-out so telemetry is
    /// not echoed back to the device that produced it.
    pub fn apply(
        &mut self,
        command: Command,
        origin: Option<PeerId>,
    ) -> Result<AppliedCommand, CommandError> {
        validate(&command)?;

        let message: OutboundMessage = match command {
            Command::SetMode { mode } => {
                self.store.set_mode(mode);
                CommandMessage::ModeChanged { mode }.into()
            }
            Command::SetPosition { position } => {
                if self.store.mode() != Mode::Manual {
                    return Err(CommandError::InvalidMode);
                }
                // a manual move takes the actuator away from any running preset
                self.session.preempt();
                self.store.set_position(position);
                CommandMessage::PositionUpdate { position }.into()
            }
            Command::SetAutoTarget { target } => {
                self.store.set_auto_target(target);
                CommandMessage::AutoTargetUpdate { target }.into()
            }
            Command::SensorUpdate { sensors, position } => {
                self.store.set_sensors(sensors);
                if let Some(position) = position {
                    self.store.set_position(position);
                }
                TelemetryMessage::SensorUpdate { sensors, position }.into()
            }
            Command::StatusUpdate { patch } => {
                self.store.merge(patch.clone());
                TelemetryMessage::StatusUpdate { state: patch }.into()
            }
            Command::TimedMove {
                duration,
                end_position,
            } => CommandMessage::TimedMove {
                duration,
                end_position,
            }
            .into(),
            Command::ExecutePreset { preset } => CommandMessage::ExecutePreset { preset }.into(),
            Command::Center => {
                self.session.preempt();
                self.store.set_position(GimbalPosition::CENTER);
                CommandMessage::Center.into()
            }
        };

        let delivered = self.broadcast(&message, origin);
        Ok(AppliedCommand { message, delivered })
    }

    fn broadcast(&self, message: &OutboundMessage, exclude: Option<PeerId>) -> usize {
        match serde_json::to_string(message) {
            Ok(frame) => self.registry.broadcast(&frame, exclude),
            Err(err) => {
                error!("could not serialize outbound message: {}", err);
                0
            }
        }
    }
}

fn validate(command: &Command) -> Result<(), CommandError> {
    let position = match command {
        Command::SetPosition { position } => Some(position),
        Command::SetAutoTarget { target } => Some(target),
        Command::TimedMove { end_position, .. } => Some(end_position),
        Command::SensorUpdate { position, .. } => position.as_ref(),
        _ => None,
    };

    if let Some(position) = position {
        if !position.is_finite() {
            return Err(CommandError::MalformedCommand(format!(
                "non-finite position {:?}",
                position
            )));
        }
    }

    if let Command::StatusUpdate { patch } = command {
        for position in [&patch.position, &patch.auto_target].iter().filter_map(|p| p.as_ref()) {
            if !position.is_finite() {
                return Err(CommandError::MalformedCommand(format!(
                    "non-finite position {:?} in status update",
                    position
                )));
            }
        }
    }

    Ok(())
}

/// Task wrapper around [`Router`]. Requests are processed one at a time, so
/// every peer observes state mutations in the order they were applied.
pub struct RouterTask {
    router: Router,
    cmd_tx: ChannelCommandSink<RouterRequest, RouterResponse, CommandError>,
    cmd_rx: ChannelCommandSource<RouterRequest, RouterResponse, CommandError>,
}

pub fn create_task(registry: Arc<Registry>, session: Arc<DeviceSession>) -> RouterTask {
    let (cmd_tx, cmd_rx) = flume::bounded(256);

    RouterTask {
        router: Router::new(registry, session),
        cmd_tx,
        cmd_rx,
    }
}

impl RouterTask {
    pub fn cmd(&self) -> ChannelCommandSink<RouterRequest, RouterResponse, CommandError> {
        self.cmd_tx.clone()
    }
}

#[async_trait]
impl Task for RouterTask {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let Self {
            mut router, cmd_rx, ..
        } = *self;

        let loop_fut = async {
            while let Ok((req, ret_tx)) = cmd_rx.recv_async().await {
                let result = match req {
                    RouterRequest::Apply { command, origin } => {
                        trace!("applying {:?} from {:?}", command, origin);
                        router.apply(command, origin).map(RouterResponse::Applied)
                    }
                    RouterRequest::Snapshot => Ok(RouterResponse::Snapshot(router.snapshot())),
                };

                if let Err(ref err) = result {
                    debug!("command rejected: {}", err);
                }

                let _ = ret_tx.send(result);
            }

            Ok::<_, anyhow::Error>(())
        };

        select! {
            _ = cancel.cancelled() => {}
            res = loop_fut => { res? }
        }

        Ok(())
    }
}

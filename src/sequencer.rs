use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::preset::{PresetCatalog, PresetMove};
use crate::router::{Command, CommandError, RouterRequest, RouterResponse};
use crate::session::DeviceSession;
use crate::task::{send_command, ChannelCommandSink, ChannelCommandSource, Task};

type RouterSink = ChannelCommandSink<RouterRequest, RouterResponse, CommandError>;

pub enum SequencerRequest {
    Execute { preset: String },
    Cancel,
}

#[derive(Debug)]
pub enum SequencerResponse {
    Started(ExecutionHandle),
    Cancelled,
}

/// Handle to an in-flight preset run. Dropping it does not stop the run;
/// cancellation is explicit, or implicit when something else takes the
/// device session.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    preset: String,
    token: CancellationToken,
}

impl ExecutionHandle {
    pub fn preset(&self) -> &str {
        &self.preset
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Drives named presets as paced command sequences. Exactly one run can hold
/// the device session at a time; executing a new preset (or any manual move
/// through the router) cancels the previous run at its next step boundary.
pub struct SequencerTask {
    catalog: Arc<PresetCatalog>,
    session: Arc<DeviceSession>,
    router_tx: RouterSink,
    cmd_tx: ChannelCommandSink<SequencerRequest, SequencerResponse, CommandError>,
    cmd_rx: ChannelCommandSource<SequencerRequest, SequencerResponse, CommandError>,
}

pub fn create_task(
    catalog: Arc<PresetCatalog>,
    session: Arc<DeviceSession>,
    router_tx: RouterSink,
) -> SequencerTask {
    let (cmd_tx, cmd_rx) = flume::bounded(256);

    SequencerTask {
        catalog,
        session,
        router_tx,
        cmd_tx,
        cmd_rx,
    }
}

impl SequencerTask {
    pub fn cmd(&self) -> ChannelCommandSink<SequencerRequest, SequencerResponse, CommandError> {
        self.cmd_tx.clone()
    }
}

#[async_trait]
impl Task for SequencerTask {
    fn name(&self) -> &'static str {
        "sequencer"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let Self {
            catalog,
            session,
            router_tx,
            cmd_rx,
            ..
        } = *self;

        let shutdown_session = session.clone();

        let loop_fut = async {
            while let Ok((req, ret_tx)) = cmd_rx.recv_async().await {
                let result = match req {
                    SequencerRequest::Execute { preset: name } => match catalog.get(&name) {
                        None => Err(CommandError::UnknownPreset(name)),
                        Some(preset) => {
                            // taking the session cancels any in-flight run
                            let (generation, token) = session.acquire();
                            info!("executing preset {:?}", preset.name);

                            // tell every peer a run is starting before any
                            // step goes out
                            let announcement = RouterRequest::Apply {
                                command: Command::ExecutePreset {
                                    preset: preset.clone(),
                                },
                                origin: None,
                            };
                            match send_command(&router_tx, announcement).await {
                                Ok(Ok(_)) => {}
                                Ok(Err(err)) => warn!(
                                    "preset {:?} announcement rejected: {}",
                                    preset.name, err
                                ),
                                Err(err) => warn!(
                                    "preset {:?} announcement not sent: {}",
                                    preset.name, err
                                ),
                            }

                            let handle = ExecutionHandle {
                                preset: preset.name.clone(),
                                token: token.clone(),
                            };

                            let session = session.clone();
                            let router_tx = router_tx.clone();
                            tokio::spawn(async move {
                                run_sequence(preset, router_tx, token).await;
                                session.release(generation);
                            });

                            Ok(SequencerResponse::Started(handle))
                        }
                    },
                    SequencerRequest::Cancel => {
                        session.preempt();
                        Ok(SequencerResponse::Cancelled)
                    }
                };

                let _ = ret_tx.send(result);
            }

            Ok::<_, anyhow::Error>(())
        };

        select! {
            _ = cancel.cancelled() => {
                // stop any in-flight run on shutdown
                shutdown_session.preempt();
            }
            res = loop_fut => { res? }
        }

        Ok(())
    }
}

/// Paces one preset: per step, wait its delay, emit the move, then wait its
/// duration so the next step never overlaps an in-flight move. Both waits
/// give up at the step boundary when `token` is cancelled. A failed emit is
/// logged and the sequence moves on; broadcast delivery is best-effort.
pub async fn run_sequence(preset: PresetMove, router_tx: RouterSink, token: CancellationToken) {
    let total = preset.steps.len();

    for (index, step) in preset.steps.into_iter().enumerate() {
        select! {
            _ = token.cancelled() => {
                info!("preset {:?} cancelled before step {}/{}", preset.name, index + 1, total);
                return;
            }
            _ = sleep(Duration::from_millis(step.delay)) => {}
        }

        let command = Command::TimedMove {
            duration: step.duration,
            end_position: step.position,
        };

        match send_command(
            &router_tx,
            RouterRequest::Apply {
                command,
                origin: None,
            },
        )
        .await
        {
            Ok(Ok(_)) => {
                debug!(
                    "preset {:?} emitted step {}/{}",
                    preset.name,
                    index + 1,
                    total
                );
            }
            Ok(Err(err)) => {
                warn!(
                    "preset {:?} step {}/{} rejected, continuing: {}",
                    preset.name,
                    index + 1,
                    total,
                    err
                );
            }
            Err(err) => {
                warn!(
                    "preset {:?} step {}/{} not emitted, continuing: {}",
                    preset.name,
                    index + 1,
                    total,
                    err
                );
            }
        }

        select! {
            _ = token.cancelled() => {
                info!("preset {:?} cancelled during step {}/{}", preset.name, index + 1, total);
                return;
            }
            _ = sleep(Duration::from_millis(step.duration)) => {}
        }
    }

    info!("preset {:?} completed {} steps", preset.name, total);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::TimedMoveStep;
    use crate::protocol::CommandMessage;
    use crate::registry::Registry;
    use crate::router::AppliedCommand;
    use crate::state::GimbalPosition;
    use tokio::time::Instant;

    /// Answers every router request with success and records at what instant
    /// each timed move arrived.
    fn spawn_recording_router() -> (RouterSink, flume::Receiver<(Instant, Command)>) {
        let (router_tx, router_rx) = flume::bounded::<
            crate::task::Command<RouterRequest, RouterResponse, CommandError>,
        >(256);
        let (seen_tx, seen_rx) = flume::unbounded();

        tokio::spawn(async move {
            while let Ok((req, ret_tx)) = router_rx.recv_async().await {
                if let RouterRequest::Apply { command, .. } = req {
                    let _ = seen_tx.send((Instant::now(), command.clone()));
                    let _ = ret_tx.send(Ok(RouterResponse::Applied(AppliedCommand {
                        message: CommandMessage::Center.into(),
                        delivered: 0,
                    })));
                } else {
                    let _ = ret_tx.send(Err(CommandError::InvalidMode));
                }
            }
        });

        (router_tx, seen_rx)
    }

    fn two_step_preset() -> PresetMove {
        PresetMove {
            name: "pan".into(),
            description: None,
            steps: vec![
                TimedMoveStep {
                    position: GimbalPosition::new(10.0, 20.0, 30.0),
                    duration: 500,
                    delay: 100,
                },
                TimedMoveStep {
                    position: GimbalPosition::CENTER,
                    duration: 300,
                    delay: 0,
                },
            ],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emits_each_step_with_monotonic_pacing() {
        let (router_tx, seen_rx) = spawn_recording_router();
        let start = Instant::now();

        run_sequence(two_step_preset(), router_tx, CancellationToken::new()).await;

        let (first_at, first) = seen_rx.recv_async().await.unwrap();
        let (second_at, second) = seen_rx.recv_async().await.unwrap();
        assert!(seen_rx.try_recv().is_err(), "exactly two emissions expected");

        // first step waits its delay, second waits the first's duration too
        assert!(first_at - start >= Duration::from_millis(100));
        assert!(second_at - start >= Duration::from_millis(600));

        assert_eq!(
            first,
            Command::TimedMove {
                duration: 500,
                end_position: GimbalPosition::new(10.0, 20.0, 30.0),
            }
        );
        assert_eq!(
            second,
            Command::TimedMove {
                duration: 300,
                end_position: GimbalPosition::CENTER,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_later_steps() {
        let (router_tx, seen_rx) = spawn_recording_router();
        let token = CancellationToken::new();

        let run = tokio::spawn(run_sequence(two_step_preset(), router_tx, token.clone()));

        // let the first step go out, then cancel during its duration wait
        let (_, first) = seen_rx.recv_async().await.unwrap();
        assert!(matches!(first, Command::TimedMove { duration: 500, .. }));
        token.cancel();
        run.await.unwrap();

        assert!(
            seen_rx.try_recv().is_err(),
            "no step after the cancellation point may be emitted"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_emit_does_not_abort_the_sequence() {
        // router that rejects every command
        let (router_tx, router_rx) = flume::bounded::<
            crate::task::Command<RouterRequest, RouterResponse, CommandError>,
        >(256);
        let (count_tx, count_rx) = flume::unbounded();

        tokio::spawn(async move {
            while let Ok((_, ret_tx)) = router_rx.recv_async().await {
                let _ = count_tx.send(());
                let _ = ret_tx.send(Err(CommandError::InvalidMode));
            }
        });

        run_sequence(two_step_preset(), router_tx, CancellationToken::new()).await;

        assert_eq!(count_rx.try_iter().count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_unknown_preset_fails_without_side_effects() {
        let catalog = Arc::new(PresetCatalog::new());
        let session = Arc::new(DeviceSession::new());
        let (router_tx, seen_rx) = spawn_recording_router();

        let task = Box::new(create_task(catalog, session, router_tx));
        let cmd_tx = task.cmd();
        let cancel = CancellationToken::new();
        tokio::spawn(task.run(cancel.clone()));

        let result = send_command(
            &cmd_tx,
            SequencerRequest::Execute {
                preset: "ghost".into(),
            },
        )
        .await
        .unwrap();

        assert_eq!(
            result.unwrap_err(),
            CommandError::UnknownPreset("ghost".into())
        );
        assert!(seen_rx.try_recv().is_err());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn executing_a_preset_announces_it_to_peers() {
        let catalog = Arc::new(PresetCatalog::new());
        catalog.put(two_step_preset()).unwrap();
        let session = Arc::new(DeviceSession::new());
        let registry = Arc::new(Registry::new());

        let (peer_tx, peer_rx) = flume::unbounded();
        registry.register(peer_tx);

        let router = Box::new(crate::router::create_task(registry, session.clone()));
        let router_tx = router.cmd();
        let task = Box::new(create_task(catalog, session, router_tx));
        let cmd_tx = task.cmd();

        let cancel = CancellationToken::new();
        tokio::spawn(router.run(cancel.clone()));
        tokio::spawn(task.run(cancel.clone()));

        send_command(
            &cmd_tx,
            SequencerRequest::Execute {
                preset: "pan".into(),
            },
        )
        .await
        .unwrap()
        .unwrap();

        // the run is announced before any step goes out
        let announcement = peer_rx.recv_async().await.unwrap();
        assert!(announcement.contains(r#""cmd":"execute_preset""#));
        assert!(announcement.contains(r#""name":"pan""#));

        let first_step = peer_rx.recv_async().await.unwrap();
        assert!(first_step.contains(r#""cmd":"timed_move""#));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn new_execute_cancels_the_previous_run() {
        let catalog = Arc::new(PresetCatalog::new());
        catalog.put(two_step_preset()).unwrap();
        let session = Arc::new(DeviceSession::new());
        let (router_tx, _seen_rx) = spawn_recording_router();

        let task = Box::new(create_task(catalog, session, router_tx));
        let cmd_tx = task.cmd();
        let cancel = CancellationToken::new();
        tokio::spawn(task.run(cancel.clone()));

        let first = match send_command(
            &cmd_tx,
            SequencerRequest::Execute {
                preset: "pan".into(),
            },
        )
        .await
        .unwrap()
        .unwrap()
        {
            SequencerResponse::Started(handle) => handle,
            _ => panic!("expected a started run"),
        };

        let second = match send_command(
            &cmd_tx,
            SequencerRequest::Execute {
                preset: "pan".into(),
            },
        )
        .await
        .unwrap()
        .unwrap()
        {
            SequencerResponse::Started(handle) => handle,
            _ => panic!("expected a started run"),
        };

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        // explicit cancel request stops the remaining run
        send_command(&cmd_tx, SequencerRequest::Cancel)
            .await
            .unwrap()
            .unwrap();
        assert!(second.is_cancelled());
        cancel.cancel();
    }
}

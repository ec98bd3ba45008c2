use std::convert::Infallible;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket};
use warp::{Filter, Reply};

use crate::config::ServerConfig;
use crate::preset::{PresetCatalog, PresetMove};
use crate::protocol::InboundMessage;
use crate::registry::Registry;
use crate::router::{
    AppliedCommand, Command, CommandError, RouterRequest, RouterResponse,
};
use crate::sequencer::{SequencerRequest, SequencerResponse};
use crate::state::{GimbalPosition, Mode};
use crate::task::{send_command, ChannelCommandSink};

type RouterSink = ChannelCommandSink<RouterRequest, RouterResponse, CommandError>;
type SequencerSink = ChannelCommandSink<SequencerRequest, SequencerResponse, CommandError>;

#[derive(Deserialize)]
struct SetModeBody {
    mode: Mode,
}

#[derive(Deserialize)]
struct TimedMoveBody {
    duration: u64,
    end_position: GimbalPosition,
}

/// Serves the request/response API and the real-time channel. This layer is
/// plumbing only: structural validation happens in serde, domain rules happen
/// in the router and sequencer.
pub async fn serve(
    config: ServerConfig,
    registry: Arc<Registry>,
    catalog: Arc<PresetCatalog>,
    router_tx: RouterSink,
    sequencer_tx: SequencerSink,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let root = warp::path::end().and(warp::get()).map(|| {
        ok_json(json!({
            "message": "3-axis gimbal gateway",
            "version": env!("CARGO_PKG_VERSION"),
        }))
    });

    let health = warp::path!("api" / "health").and(warp::get()).map(|| {
        ok_json(json!({
            "status": "healthy",
            "timestamp": chrono::Local::now().to_rfc3339(),
        }))
    });

    let status = warp::path!("api" / "status")
        .and(warp::get())
        .and(with(router_tx.clone()))
        .and_then(get_status);

    let set_mode = warp::path!("api" / "mode")
        .and(warp::post())
        .and(json_body())
        .and(with(router_tx.clone()))
        .and_then(set_mode);

    let set_position = warp::path!("api" / "position")
        .and(warp::post())
        .and(json_body())
        .and(with(router_tx.clone()))
        .and_then(set_position);

    let set_auto_target = warp::path!("api" / "auto-target")
        .and(warp::post())
        .and(json_body())
        .and(with(router_tx.clone()))
        .and_then(set_auto_target);

    let timed_move = warp::path!("api" / "timed-move")
        .and(warp::post())
        .and(json_body())
        .and(with(router_tx.clone()))
        .and_then(timed_move);

    let center = warp::path!("api" / "center")
        .and(warp::post())
        .and(with(router_tx.clone()))
        .and_then(center);

    let list_presets = warp::path!("api" / "presets")
        .and(warp::get())
        .and(with(catalog.clone()))
        .and_then(list_presets);

    let create_preset = warp::path!("api" / "presets")
        .and(warp::post())
        .and(json_body())
        .and(with(catalog.clone()))
        .and_then(create_preset);

    let delete_preset = warp::path!("api" / "presets" / String)
        .and(warp::delete())
        .and(with(catalog))
        .and_then(delete_preset);

    let execute_preset = warp::path!("api" / "presets" / String / "execute")
        .and(warp::post())
        .and(with(sequencer_tx.clone()))
        .and_then(execute_preset);

    let cancel_execution = warp::path!("api" / "execution" / "cancel")
        .and(warp::post())
        .and(with(sequencer_tx))
        .and_then(cancel_execution);

    let ws = warp::path("ws")
        .and(warp::ws())
        .and(with(registry))
        .and(with(router_tx))
        .map(|upgrade: warp::ws::Ws, registry, router_tx| {
            upgrade.on_upgrade(move |socket| peer_connected(socket, registry, router_tx))
        });

    let routes = root
        .or(health)
        .or(status)
        .or(set_mode)
        .or(set_position)
        .or(set_auto_target)
        .or(timed_move)
        .or(center)
        .or(list_presets)
        .or(create_preset)
        .or(delete_preset)
        .or(execute_preset)
        .or(cancel_execution)
        .or(ws);

    let (addr, serving) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(config.address, async move {
            cancel.cancelled().await;
        })?;

    info!("listening on {}", addr);
    serving.await;

    Ok(())
}

fn with<T: Clone + Send>(value: T) -> impl Filter<Extract = (T,), Error = Infallible> + Clone {
    warp::any().map(move || value.clone())
}

fn json_body<T: serde::de::DeserializeOwned + Send>(
) -> impl Filter<Extract = (T,), Error = warp::Rejection> + Clone {
    warp::body::content_length_limit(64 * 1024).and(warp::body::json())
}

fn ok_json(value: serde_json::Value) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(&value), StatusCode::OK)
}

fn error_json(status: StatusCode, detail: &str) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(&json!({ "detail": detail })), status)
}

fn command_error_json(err: &CommandError) -> warp::reply::WithStatus<warp::reply::Json> {
    let status = match err {
        CommandError::UnknownPreset(_) => StatusCode::NOT_FOUND,
        CommandError::InvalidMode | CommandError::MalformedCommand(_) => StatusCode::BAD_REQUEST,
    };
    error_json(status, &err.to_string())
}

/// Routes one command through the router task, mapping failures onto the
/// reply the handler should return.
async fn route_command(
    router_tx: &RouterSink,
    command: Command,
) -> Result<AppliedCommand, warp::reply::WithStatus<warp::reply::Json>> {
    match send_command(
        router_tx,
        RouterRequest::Apply {
            command,
            origin: None,
        },
    )
    .await
    {
        Ok(Ok(RouterResponse::Applied(applied))) => Ok(applied),
        Ok(Ok(_)) => Err(error_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            "unexpected router response",
        )),
        Ok(Err(err)) => Err(command_error_json(&err)),
        Err(err) => Err(error_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            &err.to_string(),
        )),
    }
}

async fn get_status(router_tx: RouterSink) -> Result<impl Reply, Infallible> {
    Ok(match send_command(&router_tx, RouterRequest::Snapshot).await {
        Ok(Ok(RouterResponse::Snapshot(state))) => warp::reply::with_status(
            warp::reply::json(&state),
            StatusCode::OK,
        ),
        Ok(Ok(_)) | Ok(Err(_)) => error_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            "unexpected router response",
        ),
        Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    })
}

async fn set_mode(body: SetModeBody, router_tx: RouterSink) -> Result<impl Reply, Infallible> {
    Ok(
        match route_command(&router_tx, Command::SetMode { mode: body.mode }).await {
            Ok(_) => ok_json(json!({ "status": "ok", "mode": body.mode })),
            Err(reply) => reply,
        },
    )
}

async fn set_position(
    position: GimbalPosition,
    router_tx: RouterSink,
) -> Result<impl Reply, Infallible> {
    Ok(
        match route_command(&router_tx, Command::SetPosition { position }).await {
            Ok(_) => ok_json(json!({ "status": "ok", "position": position })),
            Err(reply) => reply,
        },
    )
}

async fn set_auto_target(
    target: GimbalPosition,
    router_tx: RouterSink,
) -> Result<impl Reply, Infallible> {
    Ok(
        match route_command(&router_tx, Command::SetAutoTarget { target }).await {
            Ok(_) => ok_json(json!({ "status": "ok", "target": target })),
            Err(reply) => reply,
        },
    )
}

async fn timed_move(body: TimedMoveBody, router_tx: RouterSink) -> Result<impl Reply, Infallible> {
    let command = Command::TimedMove {
        duration: body.duration,
        end_position: body.end_position,
    };

    Ok(match route_command(&router_tx, command).await {
        Ok(_) => ok_json(json!({
            "status": "ok",
            "move": { "duration": body.duration, "end_position": body.end_position },
        })),
        Err(reply) => reply,
    })
}

async fn center(router_tx: RouterSink) -> Result<impl Reply, Infallible> {
    Ok(match route_command(&router_tx, Command::Center).await {
        Ok(_) => ok_json(json!({ "status": "ok", "position": GimbalPosition::CENTER })),
        Err(reply) => reply,
    })
}

async fn list_presets(catalog: Arc<PresetCatalog>) -> Result<impl Reply, Infallible> {
    Ok(ok_json(json!({ "presets": catalog.list() })))
}

async fn create_preset(
    preset: PresetMove,
    catalog: Arc<PresetCatalog>,
) -> Result<impl Reply, Infallible> {
    Ok(match catalog.put(preset.clone()) {
        Ok(()) => ok_json(json!({ "status": "ok", "preset": preset })),
        Err(err) => command_error_json(&err),
    })
}

async fn delete_preset(
    name: String,
    catalog: Arc<PresetCatalog>,
) -> Result<impl Reply, Infallible> {
    // deleting a missing preset is not an error, matching put/delete symmetry
    catalog.delete(&name);
    Ok(ok_json(json!({ "status": "ok" })))
}

async fn execute_preset(
    name: String,
    sequencer_tx: SequencerSink,
) -> Result<impl Reply, Infallible> {
    Ok(
        match send_command(&sequencer_tx, SequencerRequest::Execute { preset: name }).await {
            Ok(Ok(SequencerResponse::Started(handle))) => {
                ok_json(json!({ "status": "ok", "preset": handle.preset() }))
            }
            Ok(Ok(_)) => error_json(
                StatusCode::INTERNAL_SERVER_ERROR,
                "unexpected sequencer response",
            ),
            Ok(Err(err)) => command_error_json(&err),
            Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
        },
    )
}

async fn cancel_execution(sequencer_tx: SequencerSink) -> Result<impl Reply, Infallible> {
    Ok(
        match send_command(&sequencer_tx, SequencerRequest::Cancel).await {
            Ok(Ok(_)) => ok_json(json!({ "status": "ok" })),
            Ok(Err(err)) => command_error_json(&err),
            Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
        },
    )
}

/// One attached real-time peer, UI client or device link alike. The peer is
/// sent a full state snapshot before any of its input is processed, then its
/// frames are routed with itself excluded from the resulting fan-out.
async fn peer_connected(socket: WebSocket, registry: Arc<Registry>, router_tx: RouterSink) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = flume::unbounded::<String>();
    let id = registry.register(tx.clone());
    info!("{} attached", id);

    // pump broadcast frames into the socket until either side closes
    let pump = tokio::spawn(async move {
        while let Ok(frame) = rx.recv_async().await {
            if ws_tx.send(Message::text(frame)).await.is_err() {
                break;
            }
        }
    });

    match send_command(&router_tx, RouterRequest::Snapshot).await {
        Ok(Ok(RouterResponse::Snapshot(state))) => match serde_json::to_string(&state) {
            Ok(frame) => {
                let _ = tx.send(frame);
            }
            Err(err) => error!("could not serialize state snapshot: {}", err),
        },
        _ => warn!("could not snapshot state for {}", id),
    }

    while let Some(next) = ws_rx.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(err) => {
                debug!("{} socket error: {}", id, err);
                break;
            }
        };

        if msg.is_close() {
            break;
        }

        let text = match msg.to_str() {
            Ok(text) => text,
            Err(()) => continue,
        };

        let inbound = match serde_json::from_str::<InboundMessage>(text) {
            Ok(inbound) => inbound,
            Err(err) => {
                debug!("{} sent unparseable frame, ignoring: {}", id, err);
                continue;
            }
        };

        let command = match inbound {
            InboundMessage::SensorUpdate { sensors, position } => {
                Command::SensorUpdate { sensors, position }
            }
            InboundMessage::StatusUpdate { state } => Command::StatusUpdate { patch: state },
            InboundMessage::Unrecognized => {
                debug!("{} sent unrecognized message type, ignoring", id);
                continue;
            }
        };

        match send_command(
            &router_tx,
            RouterRequest::Apply {
                command,
                origin: Some(id),
            },
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => debug!("{} command rejected: {}", id, err),
            Err(err) => {
                warn!("router unavailable, closing {}: {}", id, err);
                break;
            }
        }
    }

    registry.unregister(id);
    pump.abort();
    info!("{} detached", id);
}

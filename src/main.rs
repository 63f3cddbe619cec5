mod ai;
mod config;
mod dictionary;
mod directory;
mod error;
mod game;
mod grid;
mod rate_limit;
mod reconnect;
mod scoring;
mod session;
mod start;
mod store;
mod timer;
mod tournament;
mod types;
mod validation;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, broadcast};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing_subscriber::EnvFilter;

use crate::ai::DisabledAiValidator;
use crate::directory::{GameHandle, Registry};
use crate::error::GameError;
use crate::game::{CreateRoom, GameCommand, GameEvent, Services};
use crate::rate_limit::{FixedWindowLimiter, RateLimiter};
use crate::reconnect::Identity;
use crate::session::StartRequest;
use crate::store::MemoryStore;
use crate::timer::Scheduler;
use crate::tournament::TournamentManager;
use crate::types::*;
use crate::validation::{CommunityStore, WordValidationPipeline};

const STALE_SWEEP_EVERY: Duration = Duration::from_secs(60);

type Sender = Arc<Mutex<SplitSink<WebSocket, Message>>>;
type Subscription = Option<(GameHandle, broadcast::Receiver<GameEvent>)>;

// ─── Routes ───────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(services): State<Services>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, services))
}

async fn list_rooms(State(services): State<Services>) -> impl IntoResponse {
    Json(services.registry.active_rooms())
}

async fn room_info(Path(code): Path<String>, State(services): State<Services>) -> impl IntoResponse {
    match services.registry.summary(&code) {
        Some(summary) => Json(summary).into_response(),
        None => {
            let err = GameError::GameNotFound(code);
            (err.status(), Json(ServerMsg::error(&err, None))).into_response()
        }
    }
}

async fn health(State(services): State<Services>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "rooms": services.registry.len(),
        })),
    )
}

// ─── WebSocket ────────────────────────────────────────────────────

/// Next event for this socket's room, or pending forever when it has none.
async fn recv_event(current: &mut Subscription) -> Result<GameEvent, broadcast::error::RecvError> {
    match current {
        Some((_, rx)) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_socket(socket: WebSocket, services: Services) {
    let (sender, mut receiver) = socket.split();
    let sender: Sender = Arc::new(Mutex::new(sender));

    let socket_id = uuid::Uuid::new_v4().to_string();
    tracing::info!("WebSocket connected: {}", socket_id);

    let mut current: Subscription = None;
    let mut limiter = FixedWindowLimiter::new(&services.config.rate_limit);

    loop {
        tokio::select! {
            frame = receiver.next() => {
                let Some(Ok(frame)) = frame else { break };
                let Message::Text(text) = frame else { continue };

                if let Err(err) = limiter.check(Instant::now()) {
                    send_msg(&sender, &ServerMsg::error(&err, None)).await;
                    continue;
                }

                let client_msg: ClientMsg = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!("Invalid message from {}: {}", socket_id, e);
                        let err = GameError::validation(format!("Invalid message: {}", e));
                        send_msg(&sender, &ServerMsg::error(&err, None)).await;
                        continue;
                    }
                };

                handle_client_msg(client_msg, &services, &socket_id, &sender, &mut current).await;
            }

            event = recv_event(&mut current) => match event {
                Ok(event) => {
                    let Some((msg, detach)) = event.message_for(&socket_id) else { continue };
                    send_msg(&sender, msg).await;
                    if detach {
                        current = None;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Socket {} lagged, {} events skipped", socket_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    current = None;
                }
            },
        }
    }

    tracing::info!("WebSocket disconnected: {}", socket_id);

    if let Some((handle, _)) = current {
        let _ = handle
            .cmd_tx
            .send(GameCommand::Disconnect { conn_id: socket_id })
            .await;
    }
}

/// Leaves whatever room the socket is in without removing the player.
async fn detach(current: &mut Subscription, socket_id: &str) {
    if let Some((handle, _)) = current.take() {
        let _ = handle
            .cmd_tx
            .send(GameCommand::Disconnect {
                conn_id: socket_id.to_string(),
            })
            .await;
    }
}

async fn handle_client_msg(
    client_msg: ClientMsg,
    services: &Services,
    socket_id: &str,
    sender: &Sender,
    current: &mut Subscription,
) {
    let conn_id = socket_id.to_string();

    let cmd = match client_msg {
        ClientMsg::CreateGame {
            game_code,
            room_name,
            language,
            host_username,
            avatar,
            is_ranked,
            allow_late_join,
            auth_user_id,
            guest_token,
        } => {
            detach(current, socket_id).await;
            let request = CreateRoom {
                code: game_code,
                room_name,
                language,
                host_username,
                avatar,
                is_ranked,
                allow_late_join,
                identity: Identity::new(auth_user_id, guest_token.as_deref()),
            };
            match game::create_game(services, socket_id, request) {
                Ok((handle, snapshot)) => {
                    let rx = handle.event_tx.subscribe();
                    *current = Some((handle, rx));
                    send_msg(sender, &ServerMsg::Joined(snapshot)).await;
                }
                Err(err) => send_msg(sender, &ServerMsg::error(&err, None)).await,
            }
            return;
        }

        ClientMsg::Join {
            game_code,
            username,
            avatar,
            is_bot,
            auth_user_id,
            guest_token,
        } => {
            let Some(handle) = services.registry.get(&game_code) else {
                let err = GameError::GameNotFound(game_code);
                send_msg(sender, &ServerMsg::error(&err, None)).await;
                return;
            };
            if current.as_ref().is_some_and(|(h, _)| h.code != handle.code) {
                detach(current, socket_id).await;
            }
            // Subscribe before joining so the snapshot is not missed.
            let rx = handle.event_tx.subscribe();
            *current = Some((handle, rx));
            GameCommand::Join {
                conn_id,
                username,
                avatar,
                identity: Identity::new(auth_user_id, guest_token.as_deref()),
                is_bot,
            }
        }

        ClientMsg::GetActiveRooms {} => {
            let msg = ServerMsg::ActiveRooms {
                rooms: services.registry.active_rooms(),
            };
            send_msg(sender, &msg).await;
            return;
        }

        ClientMsg::LeaveRoom { game_code, username } => {
            // The room detaches the socket itself once the leave succeeds.
            if !current
                .as_ref()
                .is_some_and(|(h, _)| h.code.eq_ignore_ascii_case(&game_code))
            {
                let err = GameError::GameNotFound(game_code);
                send_msg(sender, &ServerMsg::error(&err, None)).await;
                return;
            }
            GameCommand::Leave { conn_id, username }
        }

        ClientMsg::StartGame {
            letter_grid,
            timer_seconds,
            language,
            min_word_length,
        } => GameCommand::Start {
            conn_id,
            request: StartRequest {
                letter_grid,
                timer_seconds,
                language,
                min_word_length,
            },
        },
        ClientMsg::StartGameAck { message_id } => GameCommand::StartAck { conn_id, message_id },
        ClientMsg::SubmitWord {
            word,
            combo_level,
            path,
        } => GameCommand::SubmitWord {
            conn_id,
            word,
            combo_level,
            path,
        },
        ClientMsg::SubmitWordVote { word, vote_type } => GameCommand::CommunityVote {
            conn_id,
            word,
            vote_type,
        },
        ClientMsg::SubmitPeerValidationVote { word, is_valid } => GameCommand::PeerVote {
            conn_id,
            word,
            is_valid,
        },
        ClientMsg::EndGame {} => GameCommand::End { conn_id },
        ClientMsg::ResetGame {} => GameCommand::Reset { conn_id },
        ClientMsg::CloseRoom {} => GameCommand::Close { conn_id },
        ClientMsg::PresenceUpdate { status } => GameCommand::Presence { conn_id, status },
        ClientMsg::PresenceHeartbeat {} => GameCommand::Heartbeat { conn_id },
        ClientMsg::CreateTournament { name, total_rounds } => GameCommand::CreateTournament {
            conn_id,
            name,
            total_rounds,
        },
    };

    let Some((handle, _)) = current.as_ref() else {
        let err = GameError::validation("Join a room first");
        send_msg(sender, &ServerMsg::error(&err, None)).await;
        return;
    };

    if handle.cmd_tx.send(cmd).await.is_err() {
        let err = GameError::GameNotFound(handle.code.clone());
        *current = None;
        send_msg(sender, &ServerMsg::error(&err, None)).await;
    }
}

async fn send_msg(sender: &Sender, msg: &ServerMsg) {
    if let Ok(json) = serde_json::to_string(msg) {
        let mut s = sender.lock().await;
        let _ = s.send(Message::Text(json.into())).await;
    }
}

// ─── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    config::init();

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .expect("Invalid PORT");

    let server_config = config::load_server_config();
    let dictionary = Arc::new(config::load_dictionary());
    let community = Arc::new(CommunityStore::new(server_config.community_approval_threshold));
    let pipeline = Arc::new(WordValidationPipeline::new(
        dictionary,
        community,
        server_config.combo_decay(),
    ));

    let services = Services {
        registry: Registry::new(),
        scheduler: Scheduler::new(),
        pipeline,
        ai: Arc::new(DisabledAiValidator),
        store: Arc::new(MemoryStore::default()),
        tournaments: Arc::new(TournamentManager::default()),
        config: Arc::new(server_config),
    };

    game::spawn_stale_sweeper(services.registry.clone(), STALE_SWEEP_EVERY);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/rooms", get(list_rooms))
        .route("/rooms/{code}", get(room_info))
        .route("/health", get(health))
        .nest_service("/static", ServeDir::new("static"))
        .layer(CorsLayer::permissive())
        .with_state(services);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .expect("Failed to bind");

    tracing::info!("WordGrid server running on port {}", port);

    axum::serve(listener, app).await.unwrap();
}

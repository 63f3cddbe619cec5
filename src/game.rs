use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::ai::{self, AiValidator};
use crate::config::ServerConfig;
use crate::directory::{GameHandle, Registry};
use crate::error::GameError;
use crate::grid::{Cell, normalize_word};
use crate::reconnect::{Identity, JoinResolution, ReconnectionSupervisor, resolve_join};
use crate::scoring;
use crate::session::{Game, GameState, Presence, RoomSettings, StartRequest, User};
use crate::start::StartCoordinator;
use crate::store::GameStore;
use crate::timer::{Scheduler, TimerKey, should_broadcast};
use crate::tournament::TournamentManager;
use crate::types::*;
use crate::validation::{PeerValidation, WordSubmission, WordValidationPipeline};

const MAX_USERNAME_CHARS: usize = 24;
const TICK: Duration = Duration::from_secs(1);

/// Commands the WebSocket handler and the timers send to a room task.
#[derive(Debug, Clone)]
pub enum GameCommand {
    Join {
        conn_id: String,
        username: String,
        avatar: Option<Avatar>,
        identity: Identity,
        is_bot: bool,
    },
    Start {
        conn_id: String,
        request: StartRequest,
    },
    StartAck {
        conn_id: String,
        message_id: String,
    },
    SubmitWord {
        conn_id: String,
        word: String,
        combo_level: u32,
        path: Option<Vec<Cell>>,
    },
    CommunityVote {
        conn_id: String,
        word: String,
        vote_type: VoteType,
    },
    PeerVote {
        conn_id: String,
        word: String,
        is_valid: bool,
    },
    End {
        conn_id: String,
    },
    Reset {
        conn_id: String,
    },
    Close {
        conn_id: String,
    },
    Leave {
        conn_id: String,
        username: String,
    },
    Presence {
        conn_id: String,
        status: Presence,
    },
    Heartbeat {
        conn_id: String,
    },
    CreateTournament {
        conn_id: String,
        name: String,
        total_rounds: u32,
    },
    Disconnect {
        conn_id: String,
    },

    // Timer-driven
    Tick {
        round: u64,
    },
    StartFallback {
        message_id: String,
    },
    HostGraceExpired {
        since: Instant,
    },
    PlayerGraceExpired {
        username: String,
        since: Instant,
    },
    PeerValidationDeadline {
        round: u64,
    },
    TournamentNextRound {
        round: u64,
    },
    SweepStale,
}

impl GameCommand {
    /// The connection that sent the command, if a client did.
    pub fn origin(&self) -> Option<&str> {
        match self {
            Self::Join { conn_id, .. }
            | Self::Start { conn_id, .. }
            | Self::StartAck { conn_id, .. }
            | Self::SubmitWord { conn_id, .. }
            | Self::CommunityVote { conn_id, .. }
            | Self::PeerVote { conn_id, .. }
            | Self::End { conn_id }
            | Self::Reset { conn_id }
            | Self::Close { conn_id }
            | Self::Leave { conn_id, .. }
            | Self::Presence { conn_id, .. }
            | Self::Heartbeat { conn_id }
            | Self::CreateTournament { conn_id, .. }
            | Self::Disconnect { conn_id } => Some(conn_id),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Start { .. } => "startGame",
            Self::StartAck { .. } => "startGameAck",
            Self::SubmitWord { .. } => "submitWord",
            Self::CommunityVote { .. } => "submitWordVote",
            Self::PeerVote { .. } => "submitPeerValidationVote",
            Self::End { .. } => "endGame",
            Self::Reset { .. } => "resetGame",
            Self::Close { .. } => "closeRoom",
            Self::Leave { .. } => "leaveRoom",
            Self::Presence { .. } => "presenceUpdate",
            Self::Heartbeat { .. } => "presenceHeartbeat",
            Self::CreateTournament { .. } => "createTournament",
            Self::Disconnect { .. } => "disconnect",
            Self::Tick { .. } => "tick",
            Self::StartFallback { .. } => "startFallback",
            Self::HostGraceExpired { .. } => "hostGraceExpired",
            Self::PlayerGraceExpired { .. } => "playerGraceExpired",
            Self::PeerValidationDeadline { .. } => "peerValidationDeadline",
            Self::TournamentNextRound { .. } => "tournamentNextRound",
            Self::SweepStale => "sweepStale",
        }
    }
}

/// Events broadcast from the room to WebSocket connections.
#[derive(Debug, Clone)]
pub enum GameEvent {
    /// Send a message to a specific connection.
    SendTo { conn_id: String, msg: ServerMsg },
    /// Broadcast a message to every connection in the room.
    Broadcast { msg: ServerMsg },
    /// Broadcast a message to all except one connection.
    BroadcastExcept { exclude: String, msg: ServerMsg },
    /// Deliver a last message to one connection and detach it from the room.
    KickSocket { conn_id: String, msg: ServerMsg },
    /// Deliver a last message to everyone; the room is gone.
    CloseRoom { msg: ServerMsg },
}

impl GameEvent {
    /// What `conn_id` should receive, and whether it must leave the room afterwards.
    pub fn message_for(&self, conn_id: &str) -> Option<(&ServerMsg, bool)> {
        match self {
            Self::SendTo { conn_id: target, msg } if target == conn_id => Some((msg, false)),
            Self::Broadcast { msg } => Some((msg, false)),
            Self::BroadcastExcept { exclude, msg } if exclude != conn_id => Some((msg, false)),
            Self::KickSocket { conn_id: target, msg } if target == conn_id => Some((msg, true)),
            Self::CloseRoom { msg } => Some((msg, true)),
            _ => None,
        }
    }
}

/// Shared collaborators handed to every room.
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<Registry>,
    pub scheduler: Arc<Scheduler>,
    pub pipeline: Arc<WordValidationPipeline>,
    pub ai: Arc<dyn AiValidator>,
    pub store: Arc<dyn GameStore>,
    pub tournaments: Arc<TournamentManager>,
    pub config: Arc<ServerConfig>,
}

#[derive(Debug, Clone)]
pub struct CreateRoom {
    pub code: Option<String>,
    pub room_name: String,
    pub language: String,
    pub host_username: String,
    pub avatar: Option<Avatar>,
    pub is_ranked: bool,
    pub allow_late_join: bool,
    pub identity: Identity,
}

/// Reads the tokio clock so paused-time tests see consistent instants.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn validate_username(username: &str) -> Result<String, GameError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(GameError::validation("Username cannot be empty"));
    }
    if username.chars().count() > MAX_USERNAME_CHARS {
        return Err(GameError::validation(format!(
            "Username cannot exceed {} characters",
            MAX_USERNAME_CHARS
        )));
    }
    Ok(username.to_string())
}

/// Create a new room and spawn its task. Returns the handle and the host's snapshot.
pub fn create_game(
    services: &Services,
    conn_id: &str,
    request: CreateRoom,
) -> Result<(GameHandle, RoomSnapshot), GameError> {
    let host_username = validate_username(&request.host_username)?;
    let language = match request.language.trim().to_lowercase() {
        l if l.is_empty() => "en".to_string(),
        l => l,
    };

    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (event_tx, _) = broadcast::channel(256);
    let handle = services
        .registry
        .insert_new(request.code.as_deref(), cmd_tx.clone(), event_tx.clone())?;

    let room_name = match request.room_name.trim() {
        "" => format!("Room {}", handle.code),
        name => name.to_string(),
    };
    let settings = RoomSettings {
        code: handle.code.clone(),
        room_name,
        language,
        is_ranked: request.is_ranked,
        allow_late_join: request.allow_late_join,
        max_players: services.config.max_players,
        min_word_length: services.config.default_min_word_length,
    };
    let host = User::new(
        host_username.clone(),
        conn_id.to_string(),
        request.identity,
        request.avatar,
        false,
        now(),
    );
    let game = Game::new(settings, host);
    let Some(snapshot) = game.snapshot_for(&host_username) else {
        services.registry.remove_game(&handle.code);
        return Err(GameError::Internal);
    };
    services.registry.publish(game.summary());

    let room = Room::new(game, services.clone(), event_tx, cmd_tx);
    tokio::spawn(room_task(room, cmd_rx));

    tracing::info!("Room {} created by {}", handle.code, host_username);

    Ok((handle, snapshot))
}

/// Periodically asks every room to close itself if it has been idle too long.
pub fn spawn_stale_sweeper(registry: Arc<Registry>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            for handle in registry.handles() {
                let _ = handle.cmd_tx.try_send(GameCommand::SweepStale);
            }
        }
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

async fn room_task(mut room: Room, mut cmd_rx: mpsc::Receiver<GameCommand>) {
    while let Some(cmd) = cmd_rx.recv().await {
        let origin = cmd.origin().map(str::to_string);
        let name = cmd.name();

        if let Err(panic) = AssertUnwindSafe(room.handle(cmd)).catch_unwind().await {
            let correlation_id = Uuid::new_v4().to_string();
            tracing::error!(
                "Room {} failed handling {} [{}]: {}",
                room.game.code,
                name,
                correlation_id,
                panic_message(panic.as_ref())
            );
            if let Some(conn_id) = origin {
                room.send_to(
                    &conn_id,
                    ServerMsg::error(&GameError::Internal, Some(correlation_id)),
                );
            }
        }

        if room.closed {
            break;
        }
    }

    tracing::info!("Room {} task ended", room.game.code);
}

/// The task-owned state of one room.
struct Room {
    game: Game,
    services: Services,
    events: broadcast::Sender<GameEvent>,
    cmd_tx: mpsc::Sender<GameCommand>,
    start: StartCoordinator,
    reconnect: ReconnectionSupervisor,
    peer: Option<PeerValidation>,
    closed: bool,
}

impl Room {
    fn new(
        game: Game,
        services: Services,
        events: broadcast::Sender<GameEvent>,
        cmd_tx: mpsc::Sender<GameCommand>,
    ) -> Self {
        let reconnect = ReconnectionSupervisor::new(
            game.code.clone(),
            services.scheduler.clone(),
            cmd_tx.clone(),
            services.config.host_grace(),
            services.config.player_grace(),
        );
        Self {
            game,
            services,
            events,
            cmd_tx,
            start: StartCoordinator::default(),
            reconnect,
            peer: None,
            closed: false,
        }
    }

    fn send_to(&self, conn_id: &str, msg: ServerMsg) {
        let _ = self.events.send(GameEvent::SendTo {
            conn_id: conn_id.to_string(),
            msg,
        });
    }

    fn broadcast(&self, msg: ServerMsg) {
        let _ = self.events.send(GameEvent::Broadcast { msg });
    }

    fn broadcast_except(&self, exclude: &str, msg: ServerMsg) {
        let _ = self.events.send(GameEvent::BroadcastExcept {
            exclude: exclude.to_string(),
            msg,
        });
    }

    fn kick(&self, conn_id: &str, msg: ServerMsg) {
        let _ = self.events.send(GameEvent::KickSocket {
            conn_id: conn_id.to_string(),
            msg,
        });
    }

    fn broadcast_users(&self) {
        self.broadcast(ServerMsg::UpdateUsers {
            users: self.game.roster(),
        });
    }

    fn broadcast_leaderboard(&self) {
        self.broadcast(ServerMsg::UpdateLeaderboard {
            leaderboard: scoring::leaderboard(&self.game),
        });
    }

    fn send_snapshot(&self, conn_id: &str, username: &str) {
        if let Some(snapshot) = self.game.snapshot_for(username) {
            self.send_to(conn_id, ServerMsg::Joined(snapshot));
        }
    }

    /// Non-fatal notice for the host, used when a collaborator fails.
    fn warn_host(&self, message: &str) {
        if let Some(conn_id) = self.game.host_connection_id.as_deref() {
            self.send_to(
                conn_id,
                ServerMsg::Warning {
                    message: message.to_string(),
                },
            );
        }
    }

    fn schedule_once(&self, key: TimerKey, delay: Duration, cmd: GameCommand) {
        self.services
            .scheduler
            .schedule_once(&self.game.code, key, delay, self.cmd_tx.clone(), cmd);
    }

    fn cancel_timer(&self, key: TimerKey) {
        self.services.scheduler.cancel(&self.game.code, &key);
    }

    fn clear_round_timers(&self) {
        for key in [
            TimerKey::RoundTick,
            TimerKey::StartFallback,
            TimerKey::PeerValidation,
            TimerKey::TournamentNextRound,
        ] {
            self.cancel_timer(key);
        }
    }

    fn member(&self, conn_id: &str) -> Result<String, GameError> {
        self.game
            .username_for(conn_id)
            .ok_or(GameError::PlayerNotFound)
    }

    async fn handle(&mut self, cmd: GameCommand) {
        let origin = cmd.origin().map(str::to_string);
        let joining = matches!(cmd, GameCommand::Join { .. });
        // A dropped socket is not activity.
        if origin.is_some() && !matches!(cmd, GameCommand::Disconnect { .. }) {
            self.game.touch(now());
        }

        if let Err(err) = self.dispatch(cmd).await {
            tracing::warn!("Room {}: {}", self.game.code, err);
            if let Some(conn_id) = origin {
                let msg = ServerMsg::error(&err, None);
                // A failed join leaves the connection outside the room.
                if joining && self.game.user_by_connection(&conn_id).is_none() {
                    self.kick(&conn_id, msg);
                } else {
                    self.send_to(&conn_id, msg);
                }
            }
        }

        if !self.closed {
            self.services.registry.publish(self.game.summary());
        }
    }

    async fn dispatch(&mut self, cmd: GameCommand) -> Result<(), GameError> {
        match cmd {
            GameCommand::Join {
                conn_id,
                username,
                avatar,
                identity,
                is_bot,
            } => self.on_join(&conn_id, &username, avatar, identity, is_bot),
            GameCommand::Start { conn_id, request } => self.on_start(&conn_id, request).await,
            GameCommand::StartAck {
                conn_id,
                message_id,
            } => self.on_start_ack(&conn_id, &message_id),
            GameCommand::SubmitWord {
                conn_id,
                word,
                combo_level,
                path,
            } => self.on_submit_word(&conn_id, word, combo_level, path),
            GameCommand::CommunityVote {
                conn_id,
                word,
                vote_type,
            } => self.on_community_vote(&conn_id, &word, vote_type).await,
            GameCommand::PeerVote {
                conn_id,
                word,
                is_valid,
            } => self.on_peer_vote(&conn_id, &word, is_valid).await,
            GameCommand::End { conn_id } => {
                self.game.require_host(&conn_id)?;
                self.end_round().await
            }
            GameCommand::Reset { conn_id } => self.on_reset(&conn_id).await,
            GameCommand::Close { conn_id } => {
                self.game.require_host(&conn_id)?;
                self.close_room(ServerMsg::HostLeftRoomClosing {
                    reason: "The host closed the room".to_string(),
                });
                Ok(())
            }
            GameCommand::Leave { conn_id, username } => self.on_leave(&conn_id, &username),
            GameCommand::Presence { conn_id, status } => self.on_presence(&conn_id, status),
            GameCommand::Heartbeat { conn_id } => {
                let username = self.member(&conn_id)?;
                if self.game.heartbeat(&username, now()) {
                    self.broadcast_users();
                }
                Ok(())
            }
            GameCommand::CreateTournament {
                conn_id,
                name,
                total_rounds,
            } => self.on_create_tournament(&conn_id, &name, total_rounds),
            GameCommand::Disconnect { conn_id } => {
                self.on_disconnect(&conn_id);
                Ok(())
            }
            GameCommand::Tick { round } => self.on_tick(round).await,
            GameCommand::StartFallback { message_id } => {
                self.on_start_fallback(&message_id);
                Ok(())
            }
            GameCommand::HostGraceExpired { since } => {
                self.on_host_grace_expired(since);
                Ok(())
            }
            GameCommand::PlayerGraceExpired { username, since } => {
                self.on_player_grace_expired(&username, since);
                Ok(())
            }
            GameCommand::PeerValidationDeadline { round } => {
                if self.peer.as_ref().is_some_and(|p| p.round() == round) {
                    tracing::info!("Room {} peer validation window closed", self.game.code);
                    self.close_peer_validation().await;
                }
                Ok(())
            }
            GameCommand::TournamentNextRound { round } => self.on_tournament_next_round(round),
            GameCommand::SweepStale => {
                self.on_sweep_stale();
                Ok(())
            }
        }
    }

    // ─── Roster ───────────────────────────────────────────────────────

    fn on_join(
        &mut self,
        conn_id: &str,
        username: &str,
        avatar: Option<Avatar>,
        identity: Identity,
        is_bot: bool,
    ) -> Result<(), GameError> {
        let username = validate_username(username)?;
        if let Some(current) = self.game.user_by_connection(conn_id) {
            if current.username != username {
                return Err(GameError::validation(format!(
                    "This connection already plays as {}",
                    current.username
                )));
            }
        }
        let now = now();

        match resolve_join(&self.game, conn_id, &username, &identity) {
            JoinResolution::NewPlayer => {
                let user = User::new(username.clone(), conn_id.to_string(), identity, avatar, is_bot, now);
                self.game.add_user(user)?;
                tracing::info!("{} joined room {}", username, self.game.code);
                self.send_snapshot(conn_id, &username);
                self.broadcast_except(
                    conn_id,
                    ServerMsg::UpdateUsers {
                        users: self.game.roster(),
                    },
                );
            }
            JoinResolution::Reconnect { username } => {
                self.resume(conn_id, &username, now);
            }
            JoinResolution::TakeOver {
                username,
                previous_connection,
            } => {
                tracing::info!(
                    "{} in room {} moved to a new connection",
                    username,
                    self.game.code
                );
                self.kick(
                    &previous_connection,
                    ServerMsg::SessionTakenOver {
                        message: "This session was opened somewhere else".to_string(),
                    },
                );
                self.resume(conn_id, &username, now);
            }
            JoinResolution::AlreadyConnected { username } => {
                self.send_snapshot(conn_id, &username);
            }
            JoinResolution::UsernameTaken => return Err(GameError::UsernameTaken(username)),
        }
        Ok(())
    }

    fn resume(&mut self, conn_id: &str, username: &str, now: Instant) {
        let Some(user) = self.game.attach_connection(username, conn_id, now) else {
            return;
        };
        let is_host = user.is_host;
        self.reconnect.resumed(username, is_host);
        tracing::info!("{} reconnected to room {}", username, self.game.code);

        self.send_snapshot(conn_id, username);
        self.broadcast_except(
            conn_id,
            ServerMsg::PlayerReconnected {
                username: username.to_string(),
                is_host,
            },
        );
        self.broadcast_users();
    }

    fn on_leave(&mut self, conn_id: &str, username: &str) -> Result<(), GameError> {
        let (username, is_host) = match self.game.user_by_connection(conn_id) {
            Some(user) if user.username == username.trim() => (user.username.clone(), user.is_host),
            _ => return Err(GameError::PlayerNotFound),
        };

        if is_host {
            self.close_room(ServerMsg::HostLeftRoomClosing {
                reason: "The host left the room".to_string(),
            });
            return Ok(());
        }

        self.reconnect.cancel_player(&username);
        self.game.remove_user(&username, false);
        self.stop_waiting_for(&username);
        tracing::info!("{} left room {}", username, self.game.code);

        self.kick(
            conn_id,
            ServerMsg::PlayerLeft {
                username: username.clone(),
            },
        );
        self.broadcast_except(conn_id, ServerMsg::PlayerLeft { username });
        self.broadcast_users();
        if self.game.state() == GameState::InProgress {
            self.broadcast_leaderboard();
        }
        Ok(())
    }

    fn on_presence(&mut self, conn_id: &str, status: Presence) -> Result<(), GameError> {
        let username = self.member(conn_id)?;
        let now = now();
        if let Some(user) = self.game.users.get_mut(&username) {
            user.presence = status;
            user.away_by_silence = false;
            user.last_activity = now;
            user.last_heartbeat = now;
        }
        self.broadcast_users();
        Ok(())
    }

    fn on_disconnect(&mut self, conn_id: &str) {
        let now = now();
        let Some((username, is_host)) = self.game.mark_disconnected(conn_id, now) else {
            return;
        };
        self.stop_waiting_for(&username);

        if is_host {
            tracing::info!("Host {} disconnected from room {}", username, self.game.code);
            self.broadcast(ServerMsg::HostDisconnected {
                host_username: username,
                grace_seconds: self.services.config.host_grace_seconds,
            });
            self.reconnect.host_disconnected(now);
        } else {
            tracing::info!("{} disconnected from room {}", username, self.game.code);
            self.broadcast(ServerMsg::PlayerDisconnected {
                username: username.clone(),
                grace_seconds: self.services.config.player_grace_seconds,
            });
            self.reconnect.player_disconnected(&username, now);
        }
        self.broadcast_users();
    }

    fn on_host_grace_expired(&mut self, since: Instant) {
        let same_absence = self
            .game
            .users
            .get(&self.game.host_username)
            .is_some_and(|u| u.disconnected_at == Some(since));
        if self.game.is_host_connected() || !same_absence {
            return;
        }
        tracing::info!("Host of room {} did not return", self.game.code);
        self.close_room(ServerMsg::HostLeftRoomClosing {
            reason: "The host did not return in time".to_string(),
        });
    }

    fn on_player_grace_expired(&mut self, username: &str, since: Instant) {
        let expired = self
            .game
            .users
            .get(username)
            .is_some_and(|u| u.disconnected && u.disconnected_at == Some(since));
        if !expired {
            return;
        }
        self.game.remove_user(username, true);
        tracing::info!("{} removed from room {} after grace period", username, self.game.code);
        self.broadcast_users();
    }

    fn close_room(&mut self, msg: ServerMsg) {
        let code = self.game.code.clone();
        self.services.scheduler.cancel_room(&code);
        self.services.registry.remove_game(&code);
        if let Some(id) = self.game.tournament_id.take() {
            self.services.tournaments.cancel(&id);
        }
        let _ = self.events.send(GameEvent::CloseRoom { msg });
        self.closed = true;
        tracing::info!("Room {} closed", code);
    }

    fn on_sweep_stale(&mut self) {
        let idle = now().saturating_duration_since(self.game.last_activity);
        if idle >= self.services.config.stale_room_after() {
            tracing::info!("Room {} idle for {:?}, closing", self.game.code, idle);
            self.close_room(ServerMsg::RoomClosed {
                reason: "The room was closed after being idle".to_string(),
            });
            return;
        }

        let away = self
            .game
            .mark_silent_players(now(), self.services.config.afk_after());
        if !away.is_empty() {
            tracing::debug!("Room {}: {} went quiet", self.game.code, away.join(", "));
            self.broadcast_users();
        }
    }

    // ─── Round start ──────────────────────────────────────────────────

    async fn on_start(&mut self, conn_id: &str, request: StartRequest) -> Result<(), GameError> {
        self.game
            .start(conn_id, request, self.services.config.max_timer_seconds)?;
        self.clear_round_timers();
        self.peer = None;

        let ready: Vec<String> = self
            .game
            .users
            .values()
            .filter(|u| !u.disconnected)
            .map(|u| u.username.clone())
            .collect();
        let message_id = self.start.initialize_sequence(ready);

        tracing::info!(
            "Room {} round {} starting, {} seconds",
            self.game.code,
            self.game.round(),
            self.game.timer_seconds
        );
        self.broadcast(ServerMsg::StartGame {
            letter_grid: self.game.grid_rows(),
            timer_seconds: self.game.timer_seconds,
            message_id: message_id.clone(),
            language: self.game.language.clone(),
            min_word_length: self.game.min_word_length,
        });
        self.broadcast_leaderboard();
        self.schedule_once(
            TimerKey::StartFallback,
            self.services.config.start_ack_timeout(),
            GameCommand::StartFallback { message_id },
        );

        self.backup().await;
        Ok(())
    }

    fn on_start_ack(&mut self, conn_id: &str, message_id: &str) -> Result<(), GameError> {
        let username = self.member(conn_id)?;
        let outcome = self.start.record_acknowledgment(&username, message_id);
        if !outcome.valid {
            tracing::debug!("Stale start acknowledgment from {}", username);
            return Ok(());
        }
        if outcome.all_ready {
            self.begin_countdown(message_id);
        }
        Ok(())
    }

    fn on_start_fallback(&mut self, message_id: &str) {
        if self.start.current_id() != Some(message_id) {
            return;
        }
        let pending = self.start.pending();
        if pending > 0 {
            tracing::info!(
                "Room {} starting without {} acknowledgments",
                self.game.code,
                pending
            );
        }
        self.begin_countdown(message_id);
    }

    fn stop_waiting_for(&mut self, username: &str) {
        if self.start.forget(username) {
            if let Some(id) = self.start.current_id().map(str::to_string) {
                self.begin_countdown(&id);
            }
        }
    }

    fn begin_countdown(&mut self, message_id: &str) {
        if self.game.state() != GameState::InProgress || !self.start.begin(message_id) {
            return;
        }
        self.cancel_timer(TimerKey::StartFallback);
        self.game.begin_countdown(Utc::now());
        self.broadcast(ServerMsg::TimeUpdate {
            remaining_time: self.game.remaining_time,
        });

        let round = self.game.round();
        self.services.scheduler.schedule_interval(
            &self.game.code,
            TimerKey::RoundTick,
            TICK,
            self.cmd_tx.clone(),
            move || GameCommand::Tick { round },
        );
    }

    async fn on_tick(&mut self, round: u64) -> Result<(), GameError> {
        if round != self.game.round() {
            return Ok(());
        }
        let Some(remaining) = self.game.tick() else {
            return Ok(());
        };
        tracing::debug!("Room {} {}s left", self.game.code, remaining);
        if should_broadcast(remaining, self.game.timer_seconds) {
            self.broadcast(ServerMsg::TimeUpdate {
                remaining_time: remaining,
            });
        }
        if remaining == 0 {
            self.end_round().await?;
        }
        Ok(())
    }

    // ─── Words ────────────────────────────────────────────────────────

    fn on_submit_word(
        &mut self,
        conn_id: &str,
        word: String,
        combo_level: u32,
        path: Option<Vec<Cell>>,
    ) -> Result<(), GameError> {
        let username = self.member(conn_id)?;
        let submitted_at = now();
        if let Some(user) = self.game.users.get_mut(&username) {
            user.last_activity = submitted_at;
        }

        let outcome = self.services.pipeline.submit(
            &mut self.game,
            WordSubmission {
                word,
                submitter: username,
                path,
                combo_level,
                submitted_at,
            },
        );
        let changed = outcome.changes_score();
        self.send_to(conn_id, outcome.into_message());
        if changed {
            self.broadcast_leaderboard();
        }
        Ok(())
    }

    async fn on_community_vote(
        &mut self,
        conn_id: &str,
        word: &str,
        vote_type: VoteType,
    ) -> Result<(), GameError> {
        let username = self.member(conn_id)?;
        let word = normalize_word(word);
        if word.is_empty() {
            return Err(GameError::validation("Nothing to vote on"));
        }

        let outcome = self.services.pipeline.community().vote(
            &self.game.language,
            &word,
            &username,
            vote_type,
        );
        if outcome.newly_approved {
            tracing::info!("Word {} approved by the community", word);
            if let Err(e) = self
                .services
                .store
                .record_word_approval(&self.game.language, &word)
                .await
            {
                tracing::warn!("Failed to record approval of {}: {}", word, e);
                self.warn_host("A word approval could not be saved");
            }
        }

        self.send_to(
            conn_id,
            ServerMsg::VoteRecorded {
                word,
                net_score: outcome.net_score,
                approved: outcome.approved,
            },
        );
        Ok(())
    }

    async fn on_peer_vote(&mut self, conn_id: &str, word: &str, is_valid: bool) -> Result<(), GameError> {
        let username = self.member(conn_id)?;
        let Some(peer) = self.peer.as_mut() else {
            return Err(GameError::validation("No word is waiting for your vote"));
        };
        if !peer.record_vote(&username, word, is_valid) {
            return Err(GameError::validation("You cannot vote on that word"));
        }
        if peer.is_complete() {
            self.close_peer_validation().await;
        }
        Ok(())
    }

    // ─── Round end ────────────────────────────────────────────────────

    async fn end_round(&mut self) -> Result<(), GameError> {
        self.game.end()?;
        self.cancel_timer(TimerKey::RoundTick);
        self.cancel_timer(TimerKey::StartFallback);
        self.start.clear();

        let letter_grid = self.game.grid_rows();
        tracing::info!("Room {} round {} ended", self.game.code, self.game.round());
        self.broadcast(ServerMsg::GameEnded {
            letter_grid: letter_grid.clone(),
        });

        let pipeline = self.services.pipeline.clone();
        let for_ai = pipeline.settle_from_community(&mut self.game);
        let verdicts = ai::validate_with_timeout(
            self.services.ai.clone(),
            &self.game.language,
            &for_ai,
            self.services.config.ai_timeout(),
        )
        .await;
        let approved = pipeline.apply_ai_verdicts(&mut self.game, &verdicts);

        self.broadcast(ServerMsg::ValidatedScores {
            scores: scoring::final_results(&self.game),
            letter_grid,
        });

        if self.game.users.len() >= self.services.config.peer_validation_min_players {
            if let Some(peer) = PeerValidation::open(&mut self.game, approved) {
                self.request_peer_votes(&peer);
                self.schedule_once(
                    TimerKey::PeerValidation,
                    self.services.config.peer_validation_window(),
                    GameCommand::PeerValidationDeadline { round: peer.round() },
                );
                self.peer = Some(peer);
                return Ok(());
            }
        }

        self.finalize_round().await;
        Ok(())
    }

    fn request_peer_votes(&self, peer: &PeerValidation) {
        let timeout_seconds = self.services.config.peer_validation_seconds;
        for item in peer.items() {
            for voter in &item.eligible {
                let Some(conn_id) = self.game.users.get(voter).and_then(|u| u.connection_id.as_deref()) else {
                    continue;
                };
                self.send_to(
                    conn_id,
                    ServerMsg::PeerValidationRequest {
                        word: item.word.clone(),
                        submitter: item.submitter.clone(),
                        timeout_seconds,
                    },
                );
            }
        }
    }

    async fn close_peer_validation(&mut self) {
        let Some(peer) = self.peer.take() else {
            return;
        };
        self.cancel_timer(TimerKey::PeerValidation);

        let pipeline = self.services.pipeline.clone();
        for verdict in peer.resolve(&mut self.game, pipeline.community()) {
            self.broadcast(ServerMsg::PeerValidationResult {
                word: verdict.word,
                submitter: verdict.submitter,
                approved: verdict.approved,
            });
        }
        self.finalize_round().await;
    }

    async fn finalize_round(&mut self) {
        scoring::award_achievements(&mut self.game);
        let scores = scoring::final_results(&self.game);

        self.broadcast(ServerMsg::ValidationComplete {
            scores: scores.clone(),
            letter_grid: self.game.grid_rows(),
        });
        self.broadcast_leaderboard();

        if let Err(e) = self.services.store.save_results(&self.game.code, &scores).await {
            tracing::warn!("Failed to save results for room {}: {}", self.game.code, e);
            self.warn_host("Results could not be saved");
        }
        self.backup().await;
        self.record_tournament_round(&scores);
    }

    fn record_tournament_round(&mut self, scores: &[PlayerResult]) {
        let Some(id) = self.game.tournament_id.clone() else {
            return;
        };
        let totals: HashMap<String, u32> = scores
            .iter()
            .map(|r| (r.username.clone(), r.score))
            .collect();
        let Some(progress) = self.services.tournaments.record_round(&id, totals) else {
            self.game.tournament_id = None;
            return;
        };

        if progress.complete {
            self.game.tournament_id = None;
            self.broadcast(ServerMsg::TournamentComplete {
                tournament_id: id,
                standings: progress.standings,
            });
        } else {
            self.broadcast(ServerMsg::TournamentStandings {
                tournament_id: id,
                round: progress.round,
                total_rounds: progress.total_rounds,
                standings: progress.standings,
            });
            self.schedule_once(
                TimerKey::TournamentNextRound,
                self.services.config.tournament_break(),
                GameCommand::TournamentNextRound {
                    round: self.game.round(),
                },
            );
        }
    }

    async fn backup(&self) {
        let snapshot = serde_json::json!({
            "summary": self.game.summary(),
            "letterGrid": self.game.grid_rows(),
            "leaderboard": scoring::leaderboard(&self.game),
            "savedAt": Utc::now(),
        });
        if let Err(e) = self
            .services
            .store
            .backup_game(&self.game.code, &snapshot, self.services.config.backup_ttl())
            .await
        {
            tracing::warn!("Failed to back up room {}: {}", self.game.code, e);
            self.warn_host("The room could not be backed up");
        }
    }

    async fn on_reset(&mut self, conn_id: &str) -> Result<(), GameError> {
        self.game.require_host(conn_id)?;
        // Open peer votes are settled first so the round is still scored and saved.
        self.close_peer_validation().await;
        self.game.reset(conn_id)?;
        self.after_reset();
        Ok(())
    }

    fn on_tournament_next_round(&mut self, round: u64) -> Result<(), GameError> {
        if round != self.game.round() || self.game.state() != GameState::Finished {
            return Ok(());
        }
        self.game.reset_round()?;
        self.after_reset();
        Ok(())
    }

    fn after_reset(&mut self) {
        self.clear_round_timers();
        self.peer = None;
        self.start.clear();
        tracing::info!("Room {} reset", self.game.code);
        self.broadcast(ServerMsg::GameReset {});
        self.broadcast_users();
    }

    fn on_create_tournament(&mut self, conn_id: &str, name: &str, total_rounds: u32) -> Result<(), GameError> {
        self.game.require_host(conn_id)?;
        if self.game.tournament_id.is_some() {
            return Err(GameError::validation("A tournament is already running in this room"));
        }
        let tournament = self
            .services
            .tournaments
            .create(name, &self.game.code, total_rounds)?;
        self.game.tournament_id = Some(tournament.id.clone());
        self.broadcast(ServerMsg::TournamentStandings {
            tournament_id: tournament.id,
            round: 0,
            total_rounds: tournament.total_rounds,
            standings: Vec::new(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{AiError, DisabledAiValidator};
    use crate::dictionary::Dictionary;
    use crate::session::tests::{cat_grid, start_request};
    use crate::store::{MemoryStore, StoreError};
    use crate::validation::{CommunityStore, WordSource};
    use async_trait::async_trait;

    struct ApproveAll;

    #[async_trait]
    impl AiValidator for ApproveAll {
        async fn validate_batch(
            &self,
            _language: &str,
            words: &[String],
        ) -> Result<HashMap<String, bool>, AiError> {
            Ok(words.iter().map(|w| (w.clone(), true)).collect())
        }
    }

    fn services_with(ai: Arc<dyn AiValidator>, config: ServerConfig) -> (Services, Arc<MemoryStore>) {
        let dictionary = Arc::new(Dictionary::from_words("en", ["cat", "dog", "rat"]));
        let community = Arc::new(CommunityStore::new(config.community_approval_threshold));
        let store = Arc::new(MemoryStore::default());
        let services = Services {
            registry: Registry::new(),
            scheduler: Scheduler::new(),
            pipeline: Arc::new(WordValidationPipeline::new(dictionary, community, config.combo_decay())),
            ai,
            store: store.clone(),
            tournaments: Arc::new(TournamentManager::default()),
            config: Arc::new(config),
        };
        (services, store)
    }

    fn services() -> Services {
        services_with(Arc::new(DisabledAiValidator), ServerConfig::default()).0
    }

    struct Client {
        conn: String,
        rx: broadcast::Receiver<GameEvent>,
    }

    impl Client {
        async fn next(&mut self) -> ServerMsg {
            loop {
                let event = tokio::time::timeout(Duration::from_secs(600), self.rx.recv())
                    .await
                    .expect("no event in time")
                    .expect("room channel closed");
                if let Some((msg, _)) = event.message_for(&self.conn) {
                    return msg.clone();
                }
            }
        }

        async fn until<T>(&mut self, mut pick: impl FnMut(&ServerMsg) -> Option<T>) -> T {
            loop {
                let msg = self.next().await;
                if let Some(found) = pick(&msg) {
                    return found;
                }
            }
        }

        fn drain(&mut self) -> Vec<ServerMsg> {
            let mut out = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                if let Some((msg, _)) = event.message_for(&self.conn) {
                    out.push(msg.clone());
                }
            }
            out
        }
    }

    fn create(services: &Services, identity: Identity) -> (GameHandle, Client) {
        let (handle, snapshot) = create_game(
            services,
            "h1",
            CreateRoom {
                code: Some("ABCD".into()),
                room_name: "Test".into(),
                language: "en".into(),
                host_username: "alice".into(),
                avatar: None,
                is_ranked: false,
                allow_late_join: true,
                identity,
            },
        )
        .unwrap();
        assert!(snapshot.is_host);
        let host = Client {
            conn: "h1".into(),
            rx: handle.event_tx.subscribe(),
        };
        (handle, host)
    }

    async fn send(handle: &GameHandle, cmd: GameCommand) {
        handle.cmd_tx.send(cmd).await.unwrap();
    }

    async fn join(handle: &GameHandle, conn: &str, username: &str, identity: Identity) -> (Client, RoomSnapshot) {
        let mut client = Client {
            conn: conn.into(),
            rx: handle.event_tx.subscribe(),
        };
        send(
            handle,
            GameCommand::Join {
                conn_id: conn.into(),
                username: username.into(),
                avatar: None,
                identity,
                is_bot: false,
            },
        )
        .await;
        let snapshot = client
            .until(|m| match m {
                ServerMsg::Joined(s) => Some(s.clone()),
                _ => None,
            })
            .await;
        (client, snapshot)
    }

    fn error_code(msg: &ServerMsg) -> Option<String> {
        match msg {
            ServerMsg::Error { code, .. } => Some(code.clone()),
            _ => None,
        }
    }

    fn start_id(msg: &ServerMsg) -> Option<String> {
        match msg {
            ServerMsg::StartGame { message_id, .. } => Some(message_id.clone()),
            _ => None,
        }
    }

    fn short_round(seconds: u32) -> StartRequest {
        StartRequest {
            timer_seconds: seconds,
            ..start_request()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_host_start_is_rejected() {
        let services = services();
        let (handle, _host) = create(&services, Identity::default());
        let (mut bob, _) = join(&handle, "b1", "bob", Identity::default()).await;

        send(&handle, GameCommand::Start { conn_id: "b1".into(), request: start_request() }).await;
        assert_eq!(bob.until(error_code).await, "PLAYER_NOT_HOST");
        assert_eq!(services.registry.summary("ABCD").unwrap().state, GameState::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn full_round_scores_dictionary_words() {
        let (services, store) = services_with(Arc::new(DisabledAiValidator), ServerConfig::default());
        let (handle, mut host) = create(&services, Identity::default());
        let (mut bob, _) = join(&handle, "b1", "bob", Identity::default()).await;

        send(&handle, GameCommand::Start { conn_id: "h1".into(), request: short_round(5) }).await;
        let id = host.until(start_id).await;
        assert_eq!(bob.until(start_id).await, id);

        send(&handle, GameCommand::StartAck { conn_id: "h1".into(), message_id: id.clone() }).await;
        send(&handle, GameCommand::StartAck { conn_id: "b1".into(), message_id: id }).await;
        let remaining = bob
            .until(|m| match m {
                ServerMsg::TimeUpdate { remaining_time } => Some(*remaining_time),
                _ => None,
            })
            .await;
        assert_eq!(remaining, 5);

        send(
            &handle,
            GameCommand::SubmitWord { conn_id: "b1".into(), word: "CAT".into(), combo_level: 0, path: None },
        )
        .await;
        let accepted = bob
            .until(|m| match m {
                ServerMsg::WordAccepted { word, score, source, .. } => Some((word.clone(), *score, *source)),
                _ => None,
            })
            .await;
        assert_eq!(accepted, ("cat".to_string(), 2, WordSource::Dictionary));

        send(
            &handle,
            GameCommand::SubmitWord { conn_id: "b1".into(), word: "cat".into(), combo_level: 0, path: None },
        )
        .await;
        bob.until(|m| matches!(m, ServerMsg::WordAlreadyFound { .. }).then_some(())).await;

        let scores = bob
            .until(|m| match m {
                ServerMsg::ValidationComplete { scores, letter_grid } => {
                    assert_eq!(letter_grid, &cat_grid());
                    Some(scores.clone())
                }
                _ => None,
            })
            .await;
        assert_eq!(scores[0].username, "bob");
        assert_eq!(scores[0].score, 2);
        assert_eq!(scores[1].score, 0);
        assert_eq!(services.registry.summary("ABCD").unwrap().state, GameState::Finished);
        assert_eq!(store.results("ABCD").len(), 1);
        assert!(store.backup("ABCD").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn start_fallback_begins_countdown_without_all_acks() {
        let services = services();
        let (handle, mut host) = create(&services, Identity::default());
        let (_bob, _) = join(&handle, "b1", "bob", Identity::default()).await;

        send(&handle, GameCommand::Start { conn_id: "h1".into(), request: start_request() }).await;
        let id = host.until(start_id).await;
        let started = tokio::time::Instant::now();
        send(&handle, GameCommand::StartAck { conn_id: "h1".into(), message_id: id }).await;
        send(
            &handle,
            GameCommand::StartAck { conn_id: "h1".into(), message_id: "stale".into() },
        )
        .await;

        let remaining = host
            .until(|m| match m {
                ServerMsg::TimeUpdate { remaining_time } => Some(*remaining_time),
                _ => None,
            })
            .await;
        assert_eq!(remaining, 60);
        assert!(started.elapsed() >= services.config.start_ack_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn host_reconnect_within_grace_keeps_room() {
        let services = services();
        let token = Identity::new(None, Some("host-token"));
        let (handle, _host) = create(&services, token.clone());
        let (mut bob, _) = join(&handle, "b1", "bob", Identity::default()).await;

        send(&handle, GameCommand::Disconnect { conn_id: "h1".into() }).await;
        bob.until(|m| matches!(m, ServerMsg::HostDisconnected { .. }).then_some(())).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        let (_alice, snapshot) = join(&handle, "h2", "alice", token).await;
        assert!(snapshot.is_host);
        bob.until(|m| match m {
            ServerMsg::PlayerReconnected { username, is_host } => {
                assert_eq!(username, "alice");
                assert!(*is_host);
                Some(())
            }
            _ => None,
        })
        .await;

        tokio::time::sleep(services.config.host_grace() * 3).await;
        let later = bob.drain();
        assert!(!later
            .iter()
            .any(|m| matches!(m, ServerMsg::HostLeftRoomClosing { .. })));
        assert!(services.registry.get("ABCD").is_some());
        assert!(!services.scheduler.is_scheduled("ABCD", &TimerKey::HostGrace));
    }

    #[tokio::test(start_paused = true)]
    async fn host_grace_expiry_closes_room() {
        let services = services();
        let (handle, _host) = create(&services, Identity::default());
        let (mut bob, _) = join(&handle, "b1", "bob", Identity::default()).await;

        send(&handle, GameCommand::Disconnect { conn_id: "h1".into() }).await;
        bob.until(|m| matches!(m, ServerMsg::HostLeftRoomClosing { .. }).then_some(())).await;
        assert!(services.registry.get("ABCD").is_none());
        assert!(services.registry.active_rooms().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn player_grace_purges_once_and_keeps_words() {
        let services = services();
        let (handle, mut host) = create(&services, Identity::default());
        let (_bob, _) = join(&handle, "b1", "bob", Identity::default()).await;

        send(&handle, GameCommand::Start { conn_id: "h1".into(), request: short_round(600) }).await;
        host.until(start_id).await;
        send(
            &handle,
            GameCommand::SubmitWord { conn_id: "b1".into(), word: "dog".into(), combo_level: 0, path: None },
        )
        .await;
        send(&handle, GameCommand::Disconnect { conn_id: "b1".into() }).await;
        host.until(|m| matches!(m, ServerMsg::PlayerDisconnected { .. }).then_some(())).await;

        tokio::time::sleep(services.config.player_grace() + Duration::from_secs(30)).await;
        let purges = host
            .drain()
            .iter()
            .filter(|m| match m {
                ServerMsg::UpdateUsers { users } => !users.iter().any(|u| u.username == "bob"),
                _ => false,
            })
            .count();
        assert_eq!(purges, 1);

        send(&handle, GameCommand::End { conn_id: "h1".into() }).await;
        let scores = host
            .until(|m| match m {
                ServerMsg::ValidationComplete { scores, .. } => Some(scores.clone()),
                _ => None,
            })
            .await;
        let bob = scores.iter().find(|r| r.username == "bob").unwrap();
        assert!(bob.departed);
        assert_eq!(bob.score, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn second_tab_takes_over_session() {
        let services = services();
        let (handle, _host) = create(&services, Identity::default());
        let token = Identity::new(None, Some("bob-token"));
        let (mut first_tab, _) = join(&handle, "b1", "bob", token.clone()).await;

        let (_second_tab, snapshot) = join(&handle, "b2", "bob", token).await;
        assert_eq!(snapshot.username, "bob");
        first_tab
            .until(|m| matches!(m, ServerMsg::SessionTakenOver { .. }).then_some(()))
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_username_is_refused() {
        let services = services();
        let (handle, _host) = create(&services, Identity::default());
        let mut intruder = Client {
            conn: "x1".into(),
            rx: handle.event_tx.subscribe(),
        };
        send(
            &handle,
            GameCommand::Join {
                conn_id: "x1".into(),
                username: "alice".into(),
                avatar: None,
                identity: Identity::default(),
                is_bot: false,
            },
        )
        .await;
        assert_eq!(intruder.until(error_code).await, "USERNAME_TAKEN");
    }

    #[tokio::test(start_paused = true)]
    async fn peer_validation_retracts_rejected_word() {
        let config = ServerConfig::default();
        let (services, _) = services_with(Arc::new(ApproveAll), config);
        let (handle, mut host) = create(&services, Identity::default());
        let (mut bob, _) = join(&handle, "b1", "bob", Identity::default()).await;
        let (mut carol, _) = join(&handle, "c1", "carol", Identity::default()).await;
        let (mut dave, _) = join(&handle, "d1", "dave", Identity::default()).await;

        send(&handle, GameCommand::Start { conn_id: "h1".into(), request: start_request() }).await;
        host.until(start_id).await;
        send(
            &handle,
            GameCommand::SubmitWord { conn_id: "b1".into(), word: "cod".into(), combo_level: 0, path: None },
        )
        .await;
        bob.until(|m| matches!(m, ServerMsg::WordNeedsValidation { .. }).then_some(())).await;
        send(&handle, GameCommand::End { conn_id: "h1".into() }).await;

        for (client, conn) in [(&mut host, "h1"), (&mut carol, "c1"), (&mut dave, "d1")] {
            let word = client
                .until(|m| match m {
                    ServerMsg::PeerValidationRequest { word, submitter, .. } => {
                        assert_eq!(submitter, "bob");
                        Some(word.clone())
                    }
                    _ => None,
                })
                .await;
            send(
                &handle,
                GameCommand::PeerVote { conn_id: conn.into(), word, is_valid: false },
            )
            .await;
        }

        let approved = bob
            .until(|m| match m {
                ServerMsg::PeerValidationResult { approved, .. } => Some(*approved),
                _ => None,
            })
            .await;
        assert!(!approved);
        let scores = bob
            .until(|m| match m {
                ServerMsg::ValidationComplete { scores, .. } => Some(scores.clone()),
                _ => None,
            })
            .await;
        let result = scores.iter().find(|r| r.username == "bob").unwrap();
        assert_eq!(result.score, 0);
        assert_eq!(result.words[0].source, Some(WordSource::Peer));
        assert_eq!(result.words[0].validated, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn only_host_can_close_room() {
        let services = services();
        let (handle, _host) = create(&services, Identity::default());
        let (mut bob, _) = join(&handle, "b1", "bob", Identity::default()).await;

        send(&handle, GameCommand::Close { conn_id: "b1".into() }).await;
        assert_eq!(bob.until(error_code).await, "PLAYER_NOT_HOST");

        send(&handle, GameCommand::Close { conn_id: "h1".into() }).await;
        bob.until(|m| matches!(m, ServerMsg::HostLeftRoomClosing { .. }).then_some(())).await;
        assert!(services.registry.get("ABCD").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_leave_drops_player() {
        let services = services();
        let (handle, mut host) = create(&services, Identity::default());
        let (mut bob, _) = join(&handle, "b1", "bob", Identity::default()).await;

        // Leaving under another name is refused and keeps the player in.
        send(&handle, GameCommand::Leave { conn_id: "b1".into(), username: "robert".into() }).await;
        assert_eq!(bob.until(error_code).await, "PLAYER_NOT_FOUND");
        assert_eq!(services.registry.summary("ABCD").unwrap().player_count, 2);

        send(&handle, GameCommand::Leave { conn_id: "b1".into(), username: "bob".into() }).await;
        let farewell = loop {
            let event = bob.rx.recv().await.unwrap();
            if let Some((ServerMsg::PlayerLeft { username }, detach)) = event.message_for("b1") {
                break (username.clone(), detach);
            }
        };
        assert_eq!(farewell, ("bob".to_string(), true));
        let left = host
            .until(|m| match m {
                ServerMsg::PlayerLeft { username } => Some(username.clone()),
                _ => None,
            })
            .await;
        assert_eq!(left, "bob");
        assert_eq!(services.registry.summary("ABCD").unwrap().player_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_rooms_are_swept() {
        let config = ServerConfig {
            stale_room_minutes: 1,
            ..ServerConfig::default()
        };
        let (services, _) = services_with(Arc::new(DisabledAiValidator), config);
        let (handle, mut host) = create(&services, Identity::default());

        send(&handle, GameCommand::SweepStale).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(services.registry.get("ABCD").is_some());

        tokio::time::sleep(Duration::from_secs(120)).await;
        send(&handle, GameCommand::SweepStale).await;
        host.until(|m| matches!(m, ServerMsg::RoomClosed { .. }).then_some(())).await;
        assert!(services.registry.get("ABCD").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn tournament_resets_room_between_rounds() {
        let services = services();
        let (handle, mut host) = create(&services, Identity::default());

        send(
            &handle,
            GameCommand::CreateTournament { conn_id: "h1".into(), name: "Cup".into(), total_rounds: 2 },
        )
        .await;
        let total = host
            .until(|m| match m {
                ServerMsg::TournamentStandings { round: 0, total_rounds, .. } => Some(*total_rounds),
                _ => None,
            })
            .await;
        assert_eq!(total, 2);

        send(&handle, GameCommand::Start { conn_id: "h1".into(), request: start_request() }).await;
        send(&handle, GameCommand::End { conn_id: "h1".into() }).await;
        host.until(|m| match m {
            ServerMsg::TournamentStandings { round: 1, .. } => Some(()),
            _ => None,
        })
        .await;
        host.until(|m| matches!(m, ServerMsg::GameReset {}).then_some(())).await;
        assert_eq!(services.registry.summary("ABCD").unwrap().state, GameState::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_cannot_join_under_a_second_name() {
        let services = services();
        let (handle, _host) = create(&services, Identity::default());
        let (mut bob, _) = join(&handle, "b1", "bob", Identity::default()).await;

        send(
            &handle,
            GameCommand::Join {
                conn_id: "b1".into(),
                username: "carol".into(),
                avatar: None,
                identity: Identity::default(),
                is_bot: false,
            },
        )
        .await;
        assert_eq!(bob.until(error_code).await, "VALIDATION_FAILED");
        assert_eq!(services.registry.summary("ABCD").unwrap().player_count, 2);

        // Dropping the socket must not leave anyone behind once grace runs out.
        send(&handle, GameCommand::Disconnect { conn_id: "b1".into() }).await;
        tokio::time::sleep(services.config.player_grace() + Duration::from_secs(30)).await;
        assert_eq!(services.registry.summary("ABCD").unwrap().player_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_during_peer_vote_settles_and_saves_round() {
        let (services, store) = services_with(Arc::new(ApproveAll), ServerConfig::default());
        let (handle, mut host) = create(&services, Identity::default());
        let (mut bob, _) = join(&handle, "b1", "bob", Identity::default()).await;
        join(&handle, "c1", "carol", Identity::default()).await;
        join(&handle, "d1", "dave", Identity::default()).await;

        send(&handle, GameCommand::Start { conn_id: "h1".into(), request: start_request() }).await;
        host.until(start_id).await;
        send(
            &handle,
            GameCommand::SubmitWord { conn_id: "b1".into(), word: "cod".into(), combo_level: 0, path: None },
        )
        .await;
        bob.until(|m| matches!(m, ServerMsg::WordNeedsValidation { .. }).then_some(())).await;
        send(&handle, GameCommand::End { conn_id: "h1".into() }).await;
        host.until(|m| matches!(m, ServerMsg::PeerValidationRequest { .. }).then_some(()))
            .await;

        send(&handle, GameCommand::Reset { conn_id: "h1".into() }).await;
        let scores = host
            .until(|m| match m {
                ServerMsg::ValidationComplete { scores, .. } => Some(scores.clone()),
                _ => None,
            })
            .await;
        let result = scores.iter().find(|r| r.username == "bob").unwrap();
        assert_eq!(result.words[0].validated, Some(true));
        host.until(|m| matches!(m, ServerMsg::GameReset {}).then_some(())).await;
        assert_eq!(store.results("ABCD").len(), 1);
        assert_eq!(services.registry.summary("ABCD").unwrap().state, GameState::Waiting);
    }

    struct PanickingStore;

    #[async_trait]
    impl GameStore for PanickingStore {
        async fn backup_game(
            &self,
            _code: &str,
            _snapshot: &serde_json::Value,
            _ttl: Duration,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn save_results(&self, _code: &str, _results: &[PlayerResult]) -> Result<(), StoreError> {
            panic!("results table is gone")
        }

        async fn record_word_approval(&self, _language: &str, _word: &str) -> Result<u64, StoreError> {
            Ok(1)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handler_panic_reports_and_room_survives() {
        let (mut services, _) = services_with(Arc::new(DisabledAiValidator), ServerConfig::default());
        services.store = Arc::new(PanickingStore);
        let (handle, mut host) = create(&services, Identity::default());

        send(&handle, GameCommand::Start { conn_id: "h1".into(), request: start_request() }).await;
        host.until(start_id).await;
        send(&handle, GameCommand::End { conn_id: "h1".into() }).await;
        let (code, correlation_id) = host
            .until(|m| match m {
                ServerMsg::Error { code, correlation_id, .. } => Some((code.clone(), correlation_id.clone())),
                _ => None,
            })
            .await;
        assert_eq!(code, "INTERNAL_ERROR");
        assert!(correlation_id.is_some());

        send(&handle, GameCommand::Reset { conn_id: "h1".into() }).await;
        host.until(|m| matches!(m, ServerMsg::GameReset {}).then_some(())).await;
        assert!(services.registry.get("ABCD").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn community_threshold_records_approval_once() {
        let (services, store) = services_with(Arc::new(DisabledAiValidator), ServerConfig::default());
        let (handle, mut host) = create(&services, Identity::default());
        let (mut bob, _) = join(&handle, "b1", "bob", Identity::default()).await;
        let (mut carol, _) = join(&handle, "c1", "carol", Identity::default()).await;
        let (mut dave, _) = join(&handle, "d1", "dave", Identity::default()).await;

        let vote_of = |m: &ServerMsg| match m {
            ServerMsg::VoteRecorded { net_score, approved, .. } => Some((*net_score, *approved)),
            _ => None,
        };
        let mut outcomes = Vec::new();
        for (client, conn) in [(&mut host, "h1"), (&mut bob, "b1"), (&mut carol, "c1"), (&mut dave, "d1")] {
            send(
                &handle,
                GameCommand::CommunityVote { conn_id: conn.into(), word: "Cod".into(), vote_type: VoteType::Like },
            )
            .await;
            outcomes.push(client.until(vote_of).await);
        }

        assert_eq!(outcomes, vec![(1, false), (2, false), (3, true), (4, true)]);
        assert_eq!(store.approvals("en", "cod"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_does_not_keep_idle_room_alive() {
        let config = ServerConfig {
            stale_room_minutes: 1,
            ..ServerConfig::default()
        };
        let (services, _) = services_with(Arc::new(DisabledAiValidator), config);
        let (handle, mut host) = create(&services, Identity::default());
        join(&handle, "b1", "bob", Identity::default()).await;

        tokio::time::sleep(Duration::from_secs(90)).await;
        send(&handle, GameCommand::Disconnect { conn_id: "b1".into() }).await;
        send(&handle, GameCommand::SweepStale).await;
        host.until(|m| matches!(m, ServerMsg::RoomClosed { .. }).then_some(())).await;
        assert!(services.registry.get("ABCD").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_players_are_shown_away_until_they_beat_again() {
        let config = ServerConfig {
            afk_after_seconds: 30,
            ..ServerConfig::default()
        };
        let (services, _) = services_with(Arc::new(DisabledAiValidator), config);
        let (handle, mut host) = create(&services, Identity::default());
        join(&handle, "b1", "bob", Identity::default()).await;

        tokio::time::sleep(Duration::from_secs(40)).await;
        send(&handle, GameCommand::Heartbeat { conn_id: "h1".into() }).await;
        send(&handle, GameCommand::SweepStale).await;
        let presence_of = |name: &'static str| {
            move |m: &ServerMsg| match m {
                ServerMsg::UpdateUsers { users } => users
                    .iter()
                    .find(|u| u.username == name)
                    .map(|u| u.presence),
                _ => None,
            }
        };
        host.until(|m| presence_of("bob")(m).filter(|p| *p == Presence::Afk)).await;
        assert!(host.drain().is_empty());

        send(&handle, GameCommand::Heartbeat { conn_id: "b1".into() }).await;
        let back = host.until(presence_of("bob")).await;
        assert_eq!(back, Presence::Active);
    }

    #[test]
    fn events_are_filtered_per_connection() {
        let msg = ServerMsg::GameReset {};
        let to_b = GameEvent::SendTo { conn_id: "b".into(), msg: msg.clone() };
        assert!(to_b.message_for("a").is_none());
        assert!(to_b.message_for("b").is_some());

        let except_a = GameEvent::BroadcastExcept { exclude: "a".into(), msg: msg.clone() };
        assert!(except_a.message_for("a").is_none());
        assert!(except_a.message_for("b").is_some());

        let kick = GameEvent::KickSocket { conn_id: "a".into(), msg: msg.clone() };
        assert_eq!(kick.message_for("a").map(|(_, detach)| detach), Some(true));
        assert!(kick.message_for("b").is_none());

        let close = GameEvent::CloseRoom { msg };
        assert_eq!(close.message_for("z").map(|(_, detach)| detach), Some(true));
    }
}

//! Identity matching and disconnect grace windows.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::game::GameCommand;
use crate::session::Game;
use crate::timer::{Scheduler, TimerKey};

/// Who a connection claims to be, beyond its username.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub auth_user_id: Option<String>,
    pub guest_token_hash: Option<String>,
}

pub fn hash_guest_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl Identity {
    /// Raw guest tokens are hashed immediately and never stored.
    pub fn new(auth_user_id: Option<String>, guest_token: Option<&str>) -> Self {
        Self {
            auth_user_id: auth_user_id.filter(|id| !id.is_empty()),
            guest_token_hash: guest_token
                .filter(|t| !t.is_empty())
                .map(hash_guest_token),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.auth_user_id.is_none() && self.guest_token_hash.is_none()
    }

    pub fn matches(&self, other: &Identity) -> bool {
        if let (Some(a), Some(b)) = (&self.auth_user_id, &other.auth_user_id) {
            return a == b;
        }
        matches!(
            (&self.guest_token_hash, &other.guest_token_hash),
            (Some(a), Some(b)) if a == b
        )
    }
}

/// What a `join` on an existing room turns into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinResolution {
    NewPlayer,
    /// A disconnected user is resuming.
    Reconnect { username: String },
    /// The same identity is live on another connection, which gets replaced.
    TakeOver {
        username: String,
        previous_connection: String,
    },
    /// The join came from the connection that already owns the user.
    AlreadyConnected { username: String },
    UsernameTaken,
}

pub fn resolve_join(
    game: &Game,
    connection_id: &str,
    username: &str,
    identity: &Identity,
) -> JoinResolution {
    let by_identity = if identity.is_anonymous() {
        None
    } else {
        game.users.values().find(|u| u.identity.matches(identity))
    };

    let Some(user) = by_identity.or_else(|| game.users.get(username)) else {
        return JoinResolution::NewPlayer;
    };
    let trusted = user.identity.matches(identity) || user.identity.is_anonymous();

    match user.connection_id.as_deref() {
        Some(current) if current == connection_id => JoinResolution::AlreadyConnected {
            username: user.username.clone(),
        },
        _ if user.disconnected && trusted => JoinResolution::Reconnect {
            username: user.username.clone(),
        },
        Some(current) if !user.disconnected && user.identity.matches(identity) => {
            JoinResolution::TakeOver {
                username: user.username.clone(),
                previous_connection: current.to_string(),
            }
        }
        _ => JoinResolution::UsernameTaken,
    }
}

/// Owns the host and per-player grace timers of one room.
pub struct ReconnectionSupervisor {
    room: String,
    scheduler: Arc<Scheduler>,
    tx: mpsc::Sender<GameCommand>,
    host_grace: Duration,
    player_grace: Duration,
}

impl ReconnectionSupervisor {
    pub fn new(
        room: String,
        scheduler: Arc<Scheduler>,
        tx: mpsc::Sender<GameCommand>,
        host_grace: Duration,
        player_grace: Duration,
    ) -> Self {
        Self {
            room,
            scheduler,
            tx,
            host_grace,
            player_grace,
        }
    }

    pub fn host_disconnected(&self, since: Instant) {
        self.scheduler.schedule_once(
            &self.room,
            TimerKey::HostGrace,
            self.host_grace,
            self.tx.clone(),
            GameCommand::HostGraceExpired { since },
        );
    }

    pub fn player_disconnected(&self, username: &str, since: Instant) {
        self.scheduler.schedule_once(
            &self.room,
            TimerKey::PlayerGrace(username.to_string()),
            self.player_grace,
            self.tx.clone(),
            GameCommand::PlayerGraceExpired {
                username: username.to_string(),
                since,
            },
        );
    }

    /// Cancels whatever grace timer guards `username`.
    pub fn resumed(&self, username: &str, is_host: bool) {
        if is_host {
            self.scheduler.cancel(&self.room, &TimerKey::HostGrace);
        }
        self.cancel_player(username);
    }

    pub fn cancel_player(&self, username: &str) {
        self.scheduler
            .cancel(&self.room, &TimerKey::PlayerGrace(username.to_string()));
    }
}

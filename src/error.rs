use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{GameState, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Domain errors. They are reported to the originating connection only and
/// never leave room state half-modified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("Game {0} not found")]
    GameNotFound(String),
    #[error("A game with code {0} already exists")]
    GameExists(String),
    #[error("The game is full")]
    GameFull,
    #[error("Only the host can do that")]
    PlayerNotHost,
    #[error("You are not part of this game")]
    PlayerNotFound,
    #[error("Username {0} is already taken")]
    UsernameTaken(String),
    #[error("Cannot {transition} a game that is {state}")]
    InvalidTransition { transition: Transition, state: GameState },
    #[error("This game has already started and does not accept new players")]
    LateJoinDisabled,
    #[error("{0}")]
    ValidationFailed(String),
    #[error("Too many requests, slow down")]
    RateLimitExceeded,
    #[error("Something went wrong")]
    Internal,
}

impl GameError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::GameNotFound(_) => "GAME_NOT_FOUND",
            Self::GameExists(_) => "GAME_EXISTS",
            Self::GameFull => "GAME_FULL",
            Self::PlayerNotHost => "PLAYER_NOT_HOST",
            Self::PlayerNotFound => "PLAYER_NOT_FOUND",
            Self::UsernameTaken(_) => "USERNAME_TAKEN",
            Self::InvalidTransition { .. } => "INVALID_STATE",
            Self::LateJoinDisabled => "LATE_JOIN_DISABLED",
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::ValidationFailed(_) | Self::UsernameTaken(_) | Self::RateLimitExceeded => {
                Severity::Low
            }
            Self::Internal => Severity::High,
            _ => Severity::Medium,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::GameNotFound(_) | Self::PlayerNotFound => StatusCode::NOT_FOUND,
            Self::GameExists(_) | Self::UsernameTaken(_) | Self::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            Self::GameFull | Self::LateJoinDisabled => StatusCode::FORBIDDEN,
            Self::PlayerNotHost => StatusCode::FORBIDDEN,
            Self::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

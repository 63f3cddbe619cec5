use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GameError, Severity};
use crate::grid::Cell;
use crate::scoring::Achievement;
use crate::session::{GameState, Presence};
use crate::validation::{WordRecord, WordSource};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Avatar {
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

/// A roster entry as clients see it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub username: String,
    pub player_id: String,
    pub is_host: bool,
    pub is_bot: bool,
    pub avatar: Option<Avatar>,
    pub presence: Presence,
    pub disconnected: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub username: String,
    pub score: u32,
    pub word_count: usize,
    pub avatar: Option<Avatar>,
}

/// A word's fate as reported in results.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WordResult {
    pub word: String,
    /// Points currently counted for the word.
    pub score: u32,
    pub combo_level: u32,
    pub validated: Option<bool>,
    pub source: Option<WordSource>,
    /// Grid cells the word was traced through, row then column.
    pub path: Vec<Cell>,
}

impl From<&WordRecord> for WordResult {
    fn from(record: &WordRecord) -> Self {
        Self {
            word: record.word.clone(),
            score: record.awarded(),
            combo_level: record.combo_level,
            validated: record.status.validated(),
            source: record.status.source(),
            path: record.path.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerResult {
    pub username: String,
    pub score: u32,
    pub is_bot: bool,
    /// Set when the player was purged after a disconnect but still scores.
    pub departed: bool,
    pub achievements: Vec<Achievement>,
    pub words: Vec<WordResult>,
}

/// Everything a client needs to render a room, sent on create, join,
/// late join and reconnect alike.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub game_code: String,
    pub room_name: String,
    pub language: String,
    pub state: GameState,
    pub host_username: String,
    pub username: String,
    pub is_host: bool,
    pub is_ranked: bool,
    pub allow_late_join: bool,
    pub min_word_length: usize,
    pub users: Vec<UserView>,
    pub letter_grid: Option<Vec<Vec<String>>>,
    pub timer_seconds: u32,
    pub remaining_time: u32,
    /// When the countdown of the current round began.
    pub started_at: Option<DateTime<Utc>>,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub your_words: Vec<WordResult>,
    pub tournament_id: Option<String>,
}

/// Public listing entry for the lobby.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub game_code: String,
    pub room_name: String,
    pub language: String,
    pub host_username: String,
    pub player_count: usize,
    pub state: GameState,
    pub is_ranked: bool,
    pub allow_late_join: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentStanding {
    pub username: String,
    pub total_score: u32,
    pub round_scores: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteType {
    Like,
    Dislike,
}

fn default_true() -> bool {
    true
}

/// Messages sent from clients to server via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMsg {
    CreateGame {
        /// Requested code; one is allocated when absent.
        game_code: Option<String>,
        room_name: String,
        language: String,
        host_username: String,
        avatar: Option<Avatar>,
        #[serde(default)]
        is_ranked: bool,
        #[serde(default = "default_true")]
        allow_late_join: bool,
        auth_user_id: Option<String>,
        guest_token: Option<String>,
    },
    Join {
        game_code: String,
        username: String,
        avatar: Option<Avatar>,
        #[serde(default)]
        is_bot: bool,
        auth_user_id: Option<String>,
        guest_token: Option<String>,
    },
    StartGame {
        letter_grid: Vec<Vec<String>>,
        timer_seconds: u32,
        language: Option<String>,
        min_word_length: Option<usize>,
    },
    StartGameAck {
        message_id: String,
    },
    SubmitWord {
        word: String,
        #[serde(default)]
        combo_level: u32,
        path: Option<Vec<Cell>>,
    },
    SubmitWordVote {
        word: String,
        vote_type: VoteType,
    },
    SubmitPeerValidationVote {
        word: String,
        is_valid: bool,
    },
    EndGame {},
    ResetGame {},
    CloseRoom {},
    LeaveRoom {
        game_code: String,
        username: String,
    },
    PresenceUpdate {
        status: Presence,
    },
    PresenceHeartbeat {},
    GetActiveRooms {},
    CreateTournament {
        name: String,
        total_rounds: u32,
    },
}

/// Messages sent from server to clients via WebSocket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMsg {
    Joined(RoomSnapshot),
    UpdateUsers {
        users: Vec<UserView>,
    },
    StartGame {
        letter_grid: Vec<Vec<String>>,
        timer_seconds: u32,
        message_id: String,
        language: String,
        min_word_length: usize,
    },
    TimeUpdate {
        remaining_time: u32,
    },
    WordAccepted {
        word: String,
        score: u32,
        combo_level: u32,
        source: WordSource,
    },
    WordRejected {
        word: String,
        reason: String,
    },
    WordAlreadyFound {
        word: String,
    },
    WordNotOnBoard {
        word: String,
    },
    WordNeedsValidation {
        word: String,
    },
    UpdateLeaderboard {
        leaderboard: Vec<LeaderboardEntry>,
    },
    GameEnded {
        letter_grid: Vec<Vec<String>>,
    },
    ValidatedScores {
        scores: Vec<PlayerResult>,
        letter_grid: Vec<Vec<String>>,
    },
    ValidationComplete {
        scores: Vec<PlayerResult>,
        letter_grid: Vec<Vec<String>>,
    },
    PeerValidationRequest {
        word: String,
        submitter: String,
        timeout_seconds: u64,
    },
    PeerValidationResult {
        word: String,
        submitter: String,
        approved: bool,
    },
    VoteRecorded {
        word: String,
        net_score: i64,
        approved: bool,
    },
    HostDisconnected {
        host_username: String,
        grace_seconds: u64,
    },
    PlayerDisconnected {
        username: String,
        grace_seconds: u64,
    },
    PlayerReconnected {
        username: String,
        is_host: bool,
    },
    PlayerLeft {
        username: String,
    },
    HostLeftRoomClosing {
        reason: String,
    },
    RoomClosed {
        reason: String,
    },
    SessionTakenOver {
        message: String,
    },
    GameReset {},
    ActiveRooms {
        rooms: Vec<RoomSummary>,
    },
    TournamentStandings {
        tournament_id: String,
        round: u32,
        total_rounds: u32,
        standings: Vec<TournamentStanding>,
    },
    TournamentComplete {
        tournament_id: String,
        standings: Vec<TournamentStanding>,
    },
    Warning {
        message: String,
    },
    Error {
        code: String,
        message: String,
        severity: Severity,
        correlation_id: Option<String>,
    },
}

impl ServerMsg {
    pub fn error(err: &GameError, correlation_id: Option<String>) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            severity: err.severity(),
            correlation_id,
        }
    }
}

//! The `Game` owned by each room task, its users, and the round state machine.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GameError;
use crate::grid::LetterGrid;
use crate::reconnect::Identity;
use crate::scoring::{self, Achievement, ComboTracker};
use crate::types::{Avatar, RoomSnapshot, RoomSummary, UserView, WordResult};
use crate::validation::{WordRecord, WordStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GameState {
    Waiting,
    InProgress,
    Finished,
}

impl fmt::Display for GameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::InProgress => write!(f, "in-progress"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    End,
    Reset,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::End => write!(f, "end"),
            Self::Reset => write!(f, "reset"),
        }
    }
}

impl GameState {
    /// The transition table. Anything not listed is rejected.
    pub fn next(self, transition: Transition) -> Result<GameState, GameError> {
        match (self, transition) {
            (Self::Waiting, Transition::Start) => Ok(Self::InProgress),
            (Self::InProgress, Transition::End) => Ok(Self::Finished),
            (Self::Finished, Transition::Reset) => Ok(Self::Waiting),
            (state, transition) => Err(GameError::InvalidTransition { transition, state }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    #[default]
    Active,
    Idle,
    Afk,
}

#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    pub player_id: String,
    pub connection_id: Option<String>,
    pub is_host: bool,
    pub is_bot: bool,
    pub identity: Identity,
    pub avatar: Option<Avatar>,
    pub presence: Presence,
    pub disconnected: bool,
    pub disconnected_at: Option<Instant>,
    pub last_heartbeat: Instant,
    /// Set when the server, not the client, marked this player away.
    pub away_by_silence: bool,
    pub last_activity: Instant,
}

impl User {
    pub fn new(
        username: String,
        connection_id: String,
        identity: Identity,
        avatar: Option<Avatar>,
        is_bot: bool,
        now: Instant,
    ) -> Self {
        Self {
            username,
            player_id: uuid::Uuid::new_v4().to_string(),
            connection_id: Some(connection_id),
            is_host: false,
            is_bot,
            identity,
            avatar,
            presence: Presence::Active,
            disconnected: false,
            disconnected_at: None,
            last_heartbeat: now,
            away_by_silence: false,
            last_activity: now,
        }
    }

    pub fn view(&self) -> UserView {
        UserView {
            username: self.username.clone(),
            player_id: self.player_id.clone(),
            is_host: self.is_host,
            is_bot: self.is_bot,
            avatar: self.avatar.clone(),
            presence: self.presence,
            disconnected: self.disconnected,
        }
    }
}

/// One player's data for the current round.
#[derive(Debug, Clone, Default)]
pub struct PlayerRound {
    pub words: Vec<WordRecord>,
    pub found: HashSet<String>,
    pub score: u32,
    pub achievements: Vec<Achievement>,
    pub combo: ComboTracker,
    pub is_bot: bool,
}

impl PlayerRound {
    fn fresh(is_bot: bool) -> Self {
        Self {
            is_bot,
            ..Self::default()
        }
    }

    pub fn push_word(&mut self, record: WordRecord) {
        if record.status.is_scored() {
            self.score += record.score;
        }
        self.found.insert(record.word.clone());
        self.words.push(record);
    }

    /// Moves a word to `status`; the running score follows whether the word counts.
    pub fn set_status(&mut self, index: usize, status: WordStatus) {
        let Some(record) = self.words.get_mut(index) else {
            return;
        };
        let was_scored = record.status.is_scored();
        record.status = status;
        match (was_scored, status.is_scored()) {
            (false, true) => self.score += record.score,
            (true, false) => self.score = self.score.saturating_sub(record.score),
            _ => {}
        }
    }

    pub fn position_of(&self, word: &str, status: WordStatus) -> Option<usize> {
        self.words
            .iter()
            .position(|w| w.word == word && w.status == status)
    }
}

#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub code: String,
    pub room_name: String,
    pub language: String,
    pub is_ranked: bool,
    pub allow_late_join: bool,
    pub max_players: usize,
    pub min_word_length: usize,
}

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub letter_grid: Vec<Vec<String>>,
    pub timer_seconds: u32,
    pub language: Option<String>,
    pub min_word_length: Option<usize>,
}

#[derive(Debug)]
pub struct Game {
    pub code: String,
    pub room_name: String,
    pub language: String,
    pub host_username: String,
    pub host_connection_id: Option<String>,
    pub is_ranked: bool,
    pub allow_late_join: bool,
    pub max_players: usize,
    pub min_word_length: usize,

    state: GameState,
    round: u64,
    grid: Option<LetterGrid>,
    pub timer_seconds: u32,
    pub remaining_time: u32,
    pub game_started_at: Option<DateTime<Utc>>,

    pub users: HashMap<String, User>,
    pub players: HashMap<String, PlayerRound>,
    pub first_word_by: Option<String>,

    pub tournament_id: Option<String>,
    pub last_activity: Instant,
}

impl Game {
    pub fn new(settings: RoomSettings, mut host: User) -> Self {
        host.is_host = true;
        let now = host.last_activity;
        let mut users = HashMap::new();
        let mut players = HashMap::new();
        players.insert(host.username.clone(), PlayerRound::fresh(host.is_bot));

        let host_username = host.username.clone();
        let host_connection_id = host.connection_id.clone();
        users.insert(host.username.clone(), host);

        Self {
            code: settings.code,
            room_name: settings.room_name,
            language: settings.language,
            host_username,
            host_connection_id,
            is_ranked: settings.is_ranked,
            allow_late_join: settings.allow_late_join,
            max_players: settings.max_players,
            min_word_length: settings.min_word_length,
            state: GameState::Waiting,
            round: 0,
            grid: None,
            timer_seconds: 0,
            remaining_time: 0,
            game_started_at: None,
            users,
            players,
            first_word_by: None,
            tournament_id: None,
            last_activity: now,
        }
    }

    pub fn state(&self) -> GameState {
        self.state
    }

    /// Increments on every START; timers carry it to recognise stale ticks.
    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn grid(&self) -> Option<&LetterGrid> {
        self.grid.as_ref()
    }

    pub fn grid_rows(&self) -> Vec<Vec<String>> {
        self.grid.as_ref().map(|g| g.rows().to_vec()).unwrap_or_default()
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn user_by_connection(&self, connection_id: &str) -> Option<&User> {
        self.users
            .values()
            .find(|u| u.connection_id.as_deref() == Some(connection_id))
    }

    pub fn username_for(&self, connection_id: &str) -> Option<String> {
        self.user_by_connection(connection_id).map(|u| u.username.clone())
    }

    pub fn require_host(&self, connection_id: &str) -> Result<(), GameError> {
        match self.user_by_connection(connection_id) {
            Some(user) if user.is_host => Ok(()),
            Some(_) => Err(GameError::PlayerNotHost),
            None => Err(GameError::PlayerNotFound),
        }
    }

    pub fn is_host_connected(&self) -> bool {
        self.users
            .get(&self.host_username)
            .is_some_and(|u| !u.disconnected)
    }

    pub fn add_user(&mut self, user: User) -> Result<(), GameError> {
        if self.users.contains_key(&user.username) {
            return Err(GameError::UsernameTaken(user.username));
        }
        if self.users.len() >= self.max_players {
            return Err(GameError::GameFull);
        }
        if self.state == GameState::InProgress && !self.allow_late_join {
            return Err(GameError::LateJoinDisabled);
        }

        self.players
            .entry(user.username.clone())
            .or_insert_with(|| PlayerRound::fresh(user.is_bot));
        self.users.insert(user.username.clone(), user);
        Ok(())
    }

    /// Hard-deletes a user. With `keep_words` their round data stays for final scoring.
    pub fn remove_user(&mut self, username: &str, keep_words: bool) -> Option<User> {
        let user = self.users.remove(username)?;
        if !keep_words {
            self.players.remove(username);
        }
        Some(user)
    }

    /// Soft-deletes the user on `connection_id`. Returns `(username, is_host)`.
    pub fn mark_disconnected(&mut self, connection_id: &str, now: Instant) -> Option<(String, bool)> {
        let user = self
            .users
            .values_mut()
            .find(|u| u.connection_id.as_deref() == Some(connection_id))?;
        user.disconnected = true;
        user.disconnected_at = Some(now);
        user.connection_id = None;

        let is_host = user.is_host;
        if is_host {
            self.host_connection_id = None;
        }
        Some((user.username.clone(), is_host))
    }

    /// Binds `username` to a new live connection and clears the disconnected flag.
    pub fn attach_connection(&mut self, username: &str, connection_id: &str, now: Instant) -> Option<&User> {
        let user = self.users.get_mut(username)?;
        user.connection_id = Some(connection_id.to_string());
        user.disconnected = false;
        user.disconnected_at = None;
        user.last_activity = now;
        user.last_heartbeat = now;
        if user.is_host {
            self.host_connection_id = Some(connection_id.to_string());
        }
        Some(&*user)
    }

    /// Records a heartbeat. Returns true when it brings back a player the
    /// server had marked away.
    pub fn heartbeat(&mut self, username: &str, now: Instant) -> bool {
        let Some(user) = self.users.get_mut(username) else {
            return false;
        };
        user.last_heartbeat = now;
        if !user.away_by_silence {
            return false;
        }
        user.away_by_silence = false;
        user.presence = Presence::Active;
        true
    }

    /// Marks connected humans whose heartbeats stopped `after` ago as away.
    pub fn mark_silent_players(&mut self, now: Instant, after: Duration) -> Vec<String> {
        let mut marked = Vec::new();
        for user in self.users.values_mut() {
            if user.is_bot || user.disconnected || user.presence == Presence::Afk {
                continue;
            }
            if now.saturating_duration_since(user.last_heartbeat) >= after {
                user.presence = Presence::Afk;
                user.away_by_silence = true;
                marked.push(user.username.clone());
            }
        }
        marked.sort();
        marked
    }

    /// START. Everything is checked before anything changes.
    pub fn start(
        &mut self,
        connection_id: &str,
        request: StartRequest,
        max_timer_seconds: u32,
    ) -> Result<(), GameError> {
        self.require_host(connection_id)?;
        let next = self.state.next(Transition::Start)?;

        let grid = LetterGrid::from_rows(&request.letter_grid)
            .map_err(|e| GameError::validation(format!("Invalid letter grid: {}", e)))?;
        if request.timer_seconds == 0 || request.timer_seconds > max_timer_seconds {
            return Err(GameError::validation(format!(
                "Timer must be between 1 and {} seconds",
                max_timer_seconds
            )));
        }
        if request.min_word_length == Some(0) {
            return Err(GameError::validation("Minimum word length must be at least 1"));
        }

        self.state = next;
        self.round += 1;
        self.grid = Some(grid);
        self.timer_seconds = request.timer_seconds;
        self.remaining_time = request.timer_seconds;
        self.game_started_at = None;
        if let Some(language) = request.language.filter(|l| !l.is_empty()) {
            self.language = language;
        }
        if let Some(min) = request.min_word_length {
            self.min_word_length = min;
        }
        self.clear_round_data();
        Ok(())
    }

    /// Marks the moment the countdown actually began.
    pub fn begin_countdown(&mut self, at: DateTime<Utc>) {
        self.game_started_at = Some(at);
    }

    /// One countdown step. Returns the new remaining time, or `None` outside a round.
    pub fn tick(&mut self) -> Option<u32> {
        if self.state != GameState::InProgress {
            return None;
        }
        self.remaining_time = self.remaining_time.saturating_sub(1);
        Some(self.remaining_time)
    }

    /// END, triggered by the host or by the countdown reaching zero.
    pub fn end(&mut self) -> Result<(), GameError> {
        self.state = self.state.next(Transition::End)?;
        self.remaining_time = 0;
        Ok(())
    }

    /// RESET by the host: clears the round but keeps the roster.
    pub fn reset(&mut self, connection_id: &str) -> Result<(), GameError> {
        self.require_host(connection_id)?;
        self.reset_round()
    }

    pub fn reset_round(&mut self) -> Result<(), GameError> {
        self.state = self.state.next(Transition::Reset)?;
        self.grid = None;
        self.remaining_time = 0;
        self.game_started_at = None;
        self.clear_round_data();
        Ok(())
    }

    fn clear_round_data(&mut self) {
        self.first_word_by = None;
        self.players = self
            .users
            .values()
            .map(|u| (u.username.clone(), PlayerRound::fresh(u.is_bot)))
            .collect();
    }

    /// Host first, then everyone else by name.
    pub fn roster(&self) -> Vec<UserView> {
        let mut users: Vec<&User> = self.users.values().collect();
        users.sort_by(|a, b| b.is_host.cmp(&a.is_host).then_with(|| a.username.cmp(&b.username)));
        users.into_iter().map(User::view).collect()
    }

    pub fn snapshot_for(&self, username: &str) -> Option<RoomSnapshot> {
        let user = self.users.get(username)?;
        let your_words = self
            .players
            .get(username)
            .map(|p| p.words.iter().map(WordResult::from).collect())
            .unwrap_or_default();

        Some(RoomSnapshot {
            game_code: self.code.clone(),
            room_name: self.room_name.clone(),
            language: self.language.clone(),
            state: self.state,
            host_username: self.host_username.clone(),
            username: user.username.clone(),
            is_host: user.is_host,
            is_ranked: self.is_ranked,
            allow_late_join: self.allow_late_join,
            min_word_length: self.min_word_length,
            users: self.roster(),
            letter_grid: self.grid.as_ref().map(|g| g.rows().to_vec()),
            timer_seconds: self.timer_seconds,
            remaining_time: self.remaining_time,
            started_at: self.game_started_at,
            leaderboard: scoring::leaderboard(self),
            your_words,
            tournament_id: self.tournament_id.clone(),
        })
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            game_code: self.code.clone(),
            room_name: self.room_name.clone(),
            language: self.language.clone(),
            host_username: self.host_username.clone(),
            player_count: self.users.len(),
            state: self.state,
            is_ranked: self.is_ranked,
            allow_late_join: self.allow_late_join,
        }
    }
}

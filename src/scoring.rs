//! Word scores, combo state, leaderboards and end-of-round achievements.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::session::Game;
use crate::types::{LeaderboardEntry, PlayerResult, WordResult};

pub const MAX_COMBO_LEVEL: u32 = 10;
const LONG_WORD_LENGTH: usize = 7;
const COMBO_MASTER_LEVEL: u32 = 5;
const WORD_HUNTER_COUNT: usize = 10;

/// One point per letter after the first.
pub fn base_score(word: &str) -> u32 {
    word.chars().count().saturating_sub(1) as u32
}

/// Every two combo levels add a point.
pub fn combo_bonus(combo_level: u32) -> u32 {
    combo_level.min(MAX_COMBO_LEVEL) / 2
}

pub fn word_score(word: &str, combo_level: u32) -> u32 {
    base_score(word) + combo_bonus(combo_level)
}

/// Server side view of a player's combo streak.
///
/// The client reports its combo level, but the server only honours it up to
/// one step above the last accepted level, and a streak that has been idle
/// longer than the decay window starts again from zero.
#[derive(Debug, Clone, Default)]
pub struct ComboTracker {
    level: u32,
    last_word_at: Option<Instant>,
}

impl ComboTracker {
    fn is_live(&self, now: Instant, decay: Duration) -> bool {
        self.last_word_at
            .is_some_and(|at| now.saturating_duration_since(at) <= decay)
    }

    /// Records an accepted word and returns the combo level it scores with.
    pub fn accept(&mut self, reported: u32, now: Instant, decay: Duration) -> u32 {
        let cap = if self.is_live(now, decay) {
            self.level + 1
        } else {
            0
        };
        let level = reported.min(cap).min(MAX_COMBO_LEVEL);
        self.level = level;
        self.last_word_at = Some(now);
        level
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Achievement {
    FirstWord,
    LongWord,
    ComboMaster,
    WordHunter,
    TopScorer,
}

/// Scores every player's round and stores the achievements on the game.
pub fn award_achievements(game: &mut Game) {
    let top_score = game.players.values().map(|p| p.score).max().unwrap_or(0);
    let first = game.first_word_by.clone();

    for (username, round) in game.players.iter_mut() {
        let mut earned = Vec::new();
        let scored: Vec<_> = round.words.iter().filter(|w| w.status.is_scored()).collect();

        if first.as_deref() == Some(username.as_str()) {
            earned.push(Achievement::FirstWord);
        }
        if scored.iter().any(|w| w.word.chars().count() >= LONG_WORD_LENGTH) {
            earned.push(Achievement::LongWord);
        }
        if scored.iter().any(|w| w.combo_level >= COMBO_MASTER_LEVEL) {
            earned.push(Achievement::ComboMaster);
        }
        if scored.len() >= WORD_HUNTER_COUNT {
            earned.push(Achievement::WordHunter);
        }
        if top_score > 0 && round.score == top_score {
            earned.push(Achievement::TopScorer);
        }
        round.achievements = earned;
    }
}

/// Highest score first, ties broken by name so the order is stable.
pub fn leaderboard(game: &Game) -> Vec<LeaderboardEntry> {
    let mut entries: Vec<LeaderboardEntry> = game
        .players
        .iter()
        .map(|(username, round)| LeaderboardEntry {
            username: username.clone(),
            score: round.score,
            word_count: round.words.iter().filter(|w| w.status.is_scored()).count(),
            avatar: game.users.get(username).and_then(|u| u.avatar.clone()),
        })
        .collect();
    entries.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.username.cmp(&b.username)));
    entries
}

/// Final per-player payload, including players purged after a disconnect.
pub fn final_results(game: &Game) -> Vec<PlayerResult> {
    let mut results: Vec<PlayerResult> = game
        .players
        .iter()
        .map(|(username, round)| PlayerResult {
            username: username.clone(),
            score: round.score,
            is_bot: round.is_bot,
            departed: !game.users.contains_key(username),
            achievements: round.achievements.clone(),
            words: round.words.iter().map(WordResult::from).collect(),
        })
        .collect();
    results.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.username.cmp(&b.username)));
    results
}

//! Word validation pipeline.
//!
//! Each submitted word carries a `WordStatus` that only moves forward:
//!
//! ```text
//! submit ─┬─ Dictionary
//!         ├─ Community
//!         └─ Pending ─┬─ Community / CommunityRejected     (cached signals)
//!                     └─ AiPending ─┬─ AiUnresolved         (timeout, no answer)
//!                                   └─ AiResolved ── PeerPending ── PeerResolved
//! ```
//!
//! The player's running score follows `WordStatus::is_scored`, so a word is
//! counted or retracted exactly once whatever path it takes.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::dictionary::Dictionary;
use crate::grid::{Cell, normalize_word};
use crate::scoring::word_score;
use crate::session::{Game, GameState};
use crate::types::{ServerMsg, VoteType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WordSource {
    Dictionary,
    Community,
    Ai,
    Peer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordStatus {
    Dictionary,
    Community,
    Pending,
    CommunityRejected,
    AiPending,
    AiUnresolved,
    AiResolved { approved: bool },
    PeerPending,
    PeerResolved { approved: bool },
}

impl WordStatus {
    /// Whether the word's points currently count toward the player's score.
    pub fn is_scored(self) -> bool {
        matches!(
            self,
            Self::Dictionary
                | Self::Community
                | Self::AiResolved { approved: true }
                | Self::PeerPending
                | Self::PeerResolved { approved: true }
        )
    }

    pub fn validated(self) -> Option<bool> {
        match self {
            Self::Dictionary | Self::Community | Self::PeerPending => Some(true),
            Self::CommunityRejected => Some(false),
            Self::AiResolved { approved } | Self::PeerResolved { approved } => Some(approved),
            Self::Pending | Self::AiPending | Self::AiUnresolved => None,
        }
    }

    pub fn source(self) -> Option<WordSource> {
        match self {
            Self::Dictionary => Some(WordSource::Dictionary),
            Self::Community | Self::CommunityRejected => Some(WordSource::Community),
            Self::AiUnresolved | Self::AiResolved { .. } => Some(WordSource::Ai),
            Self::PeerPending | Self::PeerResolved { .. } => Some(WordSource::Peer),
            Self::Pending | Self::AiPending => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WordRecord {
    /// Normalized form.
    pub word: String,
    /// Points the word is worth once it counts.
    pub score: u32,
    pub combo_level: u32,
    pub status: WordStatus,
    /// Cells the word was traced through on this round's grid.
    pub path: Vec<Cell>,
}

impl WordRecord {
    pub fn awarded(&self) -> u32 {
        if self.status.is_scored() { self.score } else { 0 }
    }
}

/// One submit event.
#[derive(Debug, Clone)]
pub struct WordSubmission {
    pub word: String,
    pub submitter: String,
    pub path: Option<Vec<Cell>>,
    pub combo_level: u32,
    pub submitted_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    RoundNotActive,
    NotAPlayer,
    Blank,
    Inappropriate,
    TooShort { min: usize },
}

impl RejectReason {
    pub fn message(&self) -> String {
        match self {
            Self::RoundNotActive => "The round is not running".to_string(),
            Self::NotAPlayer => "You are not playing in this round".to_string(),
            Self::Blank => "Type a word first".to_string(),
            Self::Inappropriate => "That word is not allowed".to_string(),
            Self::TooShort { min } => format!("Words need at least {} letters", min),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WordOutcome {
    Accepted {
        word: String,
        score: u32,
        combo_level: u32,
        source: WordSource,
    },
    NeedsValidation {
        word: String,
    },
    AlreadyFound {
        word: String,
    },
    NotOnBoard {
        word: String,
    },
    Rejected {
        word: String,
        reason: RejectReason,
    },
}

impl WordOutcome {
    pub fn changes_score(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn into_message(self) -> ServerMsg {
        match self {
            Self::Accepted {
                word,
                score,
                combo_level,
                source,
            } => ServerMsg::WordAccepted {
                word,
                score,
                combo_level,
                source,
            },
            Self::NeedsValidation { word } => ServerMsg::WordNeedsValidation { word },
            Self::AlreadyFound { word } => ServerMsg::WordAlreadyFound { word },
            Self::NotOnBoard { word } => ServerMsg::WordNotOnBoard { word },
            Self::Rejected { word, reason } => ServerMsg::WordRejected {
                word,
                reason: reason.message(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommunitySignal {
    Valid,
    Blacklisted,
    Unknown,
}

#[derive(Debug, Default)]
struct CommunityWord {
    net: i64,
    voters: HashMap<String, VoteType>,
    approved: bool,
    blacklisted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteOutcome {
    pub net_score: i64,
    pub approved: bool,
    /// True only for the vote that crossed the approval threshold.
    pub newly_approved: bool,
}

/// Community votes and the bot-word blacklist, shared by every room.
#[derive(Debug)]
pub struct CommunityStore {
    words: DashMap<(String, String), CommunityWord>,
    approval_threshold: i64,
}

impl CommunityStore {
    pub fn new(approval_threshold: i64) -> Self {
        Self {
            words: DashMap::new(),
            approval_threshold: approval_threshold.max(1),
        }
    }

    fn key(language: &str, word: &str) -> (String, String) {
        (language.to_lowercase(), normalize_word(word))
    }

    /// One vote per voter per word; voting again replaces the earlier vote.
    pub fn vote(&self, language: &str, word: &str, voter: &str, vote: VoteType) -> VoteOutcome {
        let mut entry = self.words.entry(Self::key(language, word)).or_default();
        let weight = |v: VoteType| match v {
            VoteType::Like => 1,
            VoteType::Dislike => -1,
        };
        if let Some(previous) = entry.voters.insert(voter.to_string(), vote) {
            entry.net -= weight(previous);
        }
        entry.net += weight(vote);

        let newly_approved = !entry.approved && entry.net >= self.approval_threshold;
        if newly_approved {
            entry.approved = true;
        }
        VoteOutcome {
            net_score: entry.net,
            approved: entry.approved,
            newly_approved,
        }
    }

    pub fn signal(&self, language: &str, word: &str) -> CommunitySignal {
        match self.words.get(&Self::key(language, word)) {
            Some(w) if w.blacklisted || w.net <= -self.approval_threshold => {
                CommunitySignal::Blacklisted
            }
            Some(w) if w.approved || w.net > 0 => CommunitySignal::Valid,
            _ => CommunitySignal::Unknown,
        }
    }

    pub fn blacklist(&self, language: &str, word: &str) {
        self.words
            .entry(Self::key(language, word))
            .or_default()
            .blacklisted = true;
    }
}

pub struct WordValidationPipeline {
    dictionary: Arc<Dictionary>,
    community: Arc<CommunityStore>,
    combo_decay: Duration,
}

impl WordValidationPipeline {
    pub fn new(dictionary: Arc<Dictionary>, community: Arc<CommunityStore>, combo_decay: Duration) -> Self {
        Self {
            dictionary,
            community,
            combo_decay,
        }
    }

    pub fn community(&self) -> &CommunityStore {
        &self.community
    }

    /// Screens and classifies one submission, recording it on the game if accepted.
    pub fn submit(&self, game: &mut Game, submission: WordSubmission) -> WordOutcome {
        let word = normalize_word(&submission.word);
        let reject = |reason| WordOutcome::Rejected {
            word: word.clone(),
            reason,
        };

        if game.state() != GameState::InProgress {
            return reject(RejectReason::RoundNotActive);
        }
        if word.is_empty() {
            return reject(RejectReason::Blank);
        }
        let Some(player) = game.players.get(&submission.submitter) else {
            return reject(RejectReason::NotAPlayer);
        };
        if self.dictionary.is_profane(&word) {
            return reject(RejectReason::Inappropriate);
        }
        if word.chars().count() < game.min_word_length {
            return reject(RejectReason::TooShort {
                min: game.min_word_length,
            });
        }
        if player.found.contains(&word) {
            return WordOutcome::AlreadyFound { word };
        }
        let Some(grid) = game.grid() else {
            return reject(RejectReason::RoundNotActive);
        };
        // The client's traced path is kept when it really spells the word.
        let path = match submission.path {
            Some(path) if grid.traces(&word, &path) => path,
            _ => match grid.path_for_word(&word) {
                Some(path) => path,
                None => return WordOutcome::NotOnBoard { word },
            },
        };

        let status = if self.dictionary.contains(&game.language, &word) {
            WordStatus::Dictionary
        } else if self.community.signal(&game.language, &word) == CommunitySignal::Valid {
            WordStatus::Community
        } else {
            WordStatus::Pending
        };

        let Some(player) = game.players.get_mut(&submission.submitter) else {
            return reject(RejectReason::NotAPlayer);
        };
        let combo_level = player
            .combo
            .accept(submission.combo_level, submission.submitted_at, self.combo_decay);
        let score = word_score(&word, combo_level);
        player.push_word(WordRecord {
            word: word.clone(),
            score,
            combo_level,
            status,
            path,
        });

        match status.source() {
            Some(source) => {
                if game.first_word_by.is_none() {
                    game.first_word_by = Some(submission.submitter);
                }
                WordOutcome::Accepted {
                    word,
                    score,
                    combo_level,
                    source,
                }
            }
            None => WordOutcome::NeedsValidation { word },
        }
    }

    /// Settles pending words from cached community signals and marks the rest
    /// for the AI. Returns the distinct words the AI still has to judge.
    pub fn settle_from_community(&self, game: &mut Game) -> Vec<String> {
        let language = game.language.clone();
        let mut for_ai = BTreeSet::new();

        for round in game.players.values_mut() {
            for index in 0..round.words.len() {
                if round.words[index].status != WordStatus::Pending {
                    continue;
                }
                let word = round.words[index].word.clone();
                let next = match self.community.signal(&language, &word) {
                    CommunitySignal::Valid => WordStatus::Community,
                    CommunitySignal::Blacklisted => WordStatus::CommunityRejected,
                    CommunitySignal::Unknown => {
                        for_ai.insert(word);
                        WordStatus::AiPending
                    }
                };
                round.set_status(index, next);
            }
        }
        for_ai.into_iter().collect()
    }

    /// Merges AI verdicts. Words missing from `verdicts` stay unscored.
    /// Returns `(submitter, word)` for every approved word.
    pub fn apply_ai_verdicts(
        &self,
        game: &mut Game,
        verdicts: &HashMap<String, bool>,
    ) -> Vec<(String, String)> {
        let mut approved = Vec::new();
        for (username, round) in game.players.iter_mut() {
            for index in 0..round.words.len() {
                if round.words[index].status != WordStatus::AiPending {
                    continue;
                }
                let word = round.words[index].word.clone();
                let next = match verdicts.get(&word) {
                    Some(true) => {
                        approved.push((username.clone(), word));
                        WordStatus::AiResolved { approved: true }
                    }
                    Some(false) => WordStatus::AiResolved { approved: false },
                    None => WordStatus::AiUnresolved,
                };
                round.set_status(index, next);
            }
        }
        approved.sort();
        approved
    }
}

#[derive(Debug, Clone)]
pub struct PeerItem {
    pub submitter: String,
    pub word: String,
    pub submitter_is_bot: bool,
    pub eligible: HashSet<String>,
    votes: HashMap<String, bool>,
}

impl PeerItem {
    fn is_complete(&self) -> bool {
        self.votes.len() >= self.eligible.len()
    }

    /// Strict majority of "invalid" rejects; ties keep the word.
    fn approved(&self) -> bool {
        let invalid = self.votes.values().filter(|v| !**v).count();
        let valid = self.votes.len() - invalid;
        invalid <= valid
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerVerdict {
    pub submitter: String,
    pub word: String,
    pub approved: bool,
}

/// Post-round vote by the other players on AI-approved words.
#[derive(Debug, Clone)]
pub struct PeerValidation {
    round: u64,
    items: Vec<PeerItem>,
}

impl PeerValidation {
    /// Opens a vote for `approved` words. Words without anyone eligible to vote
    /// keep their AI verdict. Returns `None` when there is nothing to vote on.
    pub fn open(game: &mut Game, approved: Vec<(String, String)>) -> Option<Self> {
        let voters: Vec<String> = game
            .users
            .values()
            .filter(|u| !u.disconnected && !u.is_bot)
            .map(|u| u.username.clone())
            .collect();

        let mut items = Vec::new();
        for (submitter, word) in approved {
            let eligible: HashSet<String> = voters.iter().filter(|v| **v != submitter).cloned().collect();
            if eligible.is_empty() {
                continue;
            }
            let Some(round) = game.players.get_mut(&submitter) else {
                continue;
            };
            let Some(index) = round.position_of(&word, WordStatus::AiResolved { approved: true }) else {
                continue;
            };
            round.set_status(index, WordStatus::PeerPending);
            items.push(PeerItem {
                submitter_is_bot: round.is_bot,
                submitter,
                word,
                eligible,
                votes: HashMap::new(),
            });
        }

        (!items.is_empty()).then_some(Self {
            round: game.round(),
            items,
        })
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn items(&self) -> &[PeerItem] {
        &self.items
    }

    /// Records `voter`'s verdict on every open item for `word` they may vote on.
    pub fn record_vote(&mut self, voter: &str, word: &str, is_valid: bool) -> bool {
        let word = normalize_word(word);
        let mut recorded = false;
        for item in self.items.iter_mut().filter(|i| i.word == word) {
            if item.eligible.contains(voter) {
                item.votes.insert(voter.to_string(), is_valid);
                recorded = true;
            }
        }
        recorded
    }

    pub fn is_complete(&self) -> bool {
        self.items.iter().all(PeerItem::is_complete)
    }

    /// Applies the votes. Rejected words lose their points; rejected bot words
    /// are blacklisted for later rounds.
    pub fn resolve(self, game: &mut Game, community: &CommunityStore) -> Vec<PeerVerdict> {
        let mut verdicts = Vec::with_capacity(self.items.len());
        for item in self.items {
            let approved = item.approved();
            let Some(round) = game.players.get_mut(&item.submitter) else {
                continue;
            };
            let Some(index) = round.position_of(&item.word, WordStatus::PeerPending) else {
                continue;
            };
            round.set_status(index, WordStatus::PeerResolved { approved });
            if !approved && item.submitter_is_bot {
                community.blacklist(&game.language, &item.word);
            }
            verdicts.push(PeerVerdict {
                submitter: item.submitter,
                word: item.word,
                approved,
            });
        }
        verdicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnect::Identity;
    use crate::session::User;
    use crate::session::tests::{game_with_host, join_user, start_request};

    fn pipeline(words: &[&str]) -> WordValidationPipeline {
        WordValidationPipeline::new(
            Arc::new(Dictionary::from_words("en", words.iter().copied())),
            Arc::new(CommunityStore::new(3)),
            Duration::from_secs(8),
        )
    }

    fn submission(username: &str, word: &str) -> WordSubmission {
        WordSubmission {
            word: word.into(),
            submitter: username.into(),
            path: None,
            combo_level: 0,
            submitted_at: Instant::now(),
        }
    }

    fn started_game() -> Game {
        let mut game = game_with_host();
        join_user(&mut game, "bob", "c2", Identity::default());
        game.start("c1", start_request(), 600).unwrap();
        game
    }

    #[test]
    fn dictionary_words_score_immediately() {
        let p = pipeline(&["cat"]);
        let mut game = started_game();
        let outcome = p.submit(&mut game, submission("bob", "CAT"));
        assert_eq!(
            outcome,
            WordOutcome::Accepted {
                word: "cat".into(),
                score: 2,
                combo_level: 0,
                source: WordSource::Dictionary,
            }
        );
        assert_eq!(game.players["bob"].score, 2);
        assert_eq!(game.first_word_by.as_deref(), Some("bob"));
    }

    #[test]
    fn client_path_is_kept_only_when_it_spells_the_word() {
        let p = pipeline(&["cat", "cot"]);
        let mut game = started_game();

        let mut traced = submission("bob", "cot");
        traced.path = Some(vec![(0, 0), (1, 1), (2, 2)]);
        assert!(p.submit(&mut game, traced).changes_score());
        assert_eq!(game.players["bob"].words[0].path, vec![(0, 0), (1, 1), (2, 2)]);

        // A bogus path is replaced by one the server finds itself.
        let mut bogus = submission("bob", "cat");
        bogus.path = Some(vec![(2, 2), (0, 0), (5, 5)]);
        assert!(p.submit(&mut game, bogus).changes_score());
        assert_eq!(game.players["bob"].words[1].path, vec![(0, 0), (0, 1), (0, 2)]);
    }

    #[test]
    fn duplicate_word_scores_once() {
        let p = pipeline(&["cat"]);
        let mut game = started_game();
        p.submit(&mut game, submission("bob", "cat"));
        assert_eq!(
            p.submit(&mut game, submission("bob", "cat")),
            WordOutcome::AlreadyFound { word: "cat".into() }
        );
        assert_eq!(game.players["bob"].score, 2);
        assert_eq!(game.players["bob"].words.len(), 1);
        // Another player may still find it.
        assert!(p.submit(&mut game, submission("alice", "cat")).changes_score());
    }

    #[test]
    fn rejection_reasons_in_order() {
        let p = pipeline(&["cat"]);
        let mut game = started_game();
        game.min_word_length = 3;
        assert_eq!(
            p.submit(&mut game, submission("bob", "do")),
            WordOutcome::Rejected {
                word: "do".into(),
                reason: RejectReason::TooShort { min: 3 },
            }
        );
        assert_eq!(
            p.submit(&mut game, submission("bob", "cart")),
            WordOutcome::NotOnBoard { word: "cart".into() }
        );
        assert!(matches!(
            p.submit(&mut game, submission("mallory", "cat")),
            WordOutcome::Rejected { reason: RejectReason::NotAPlayer, .. }
        ));
        assert_eq!(game.players["bob"].score, 0);
    }

    #[test]
    fn profanity_is_rejected_before_anything_else() {
        let mut dictionary = Dictionary::from_words("en", ["cat"]);
        dictionary.block(["cat"]);
        let p = WordValidationPipeline::new(
            Arc::new(dictionary),
            Arc::new(CommunityStore::new(3)),
            Duration::from_secs(8),
        );
        let mut game = started_game();
        assert!(matches!(
            p.submit(&mut game, submission("bob", "cat")),
            WordOutcome::Rejected { reason: RejectReason::Inappropriate, .. }
        ));
    }

    #[test]
    fn submissions_outside_round_are_rejected() {
        let p = pipeline(&["cat"]);
        let mut game = game_with_host();
        assert!(matches!(
            p.submit(&mut game, submission("alice", "cat")),
            WordOutcome::Rejected { reason: RejectReason::RoundNotActive, .. }
        ));
    }

    #[test]
    fn community_positive_words_score_as_community() {
        let p = pipeline(&[]);
        p.community().vote("en", "dog", "v1", VoteType::Like);
        let mut game = started_game();
        assert!(matches!(
            p.submit(&mut game, submission("bob", "dog")),
            WordOutcome::Accepted { source: WordSource::Community, score: 2, .. }
        ));
    }

    #[test]
    fn unknown_words_are_pending_with_no_score() {
        let p = pipeline(&[]);
        let mut game = started_game();
        assert_eq!(
            p.submit(&mut game, submission("bob", "dog")),
            WordOutcome::NeedsValidation { word: "dog".into() }
        );
        assert_eq!(game.players["bob"].score, 0);
        assert_eq!(game.players["bob"].words[0].status, WordStatus::Pending);
        assert_eq!(game.first_word_by, None);
    }

    #[test]
    fn community_votes_are_per_voter() {
        let store = CommunityStore::new(2);
        assert_eq!(store.vote("en", "gat", "a", VoteType::Like).net_score, 1);
        assert_eq!(store.vote("en", "gat", "a", VoteType::Like).net_score, 1);
        let second = store.vote("en", "GAT", "b", VoteType::Like);
        assert!(second.newly_approved);
        assert!(second.approved);
        assert!(!store.vote("en", "gat", "c", VoteType::Like).newly_approved);
        assert_eq!(store.signal("en", "gat"), CommunitySignal::Valid);

        store.vote("en", "xyz", "a", VoteType::Dislike);
        assert_eq!(store.vote("en", "xyz", "b", VoteType::Dislike).net_score, -2);
        assert_eq!(store.signal("en", "xyz"), CommunitySignal::Blacklisted);
        assert_eq!(store.signal("en", "other"), CommunitySignal::Unknown);
    }

    #[test]
    fn settle_uses_cached_signals_and_collects_the_rest() {
        let p = pipeline(&[]);
        let mut game = started_game();
        p.submit(&mut game, submission("bob", "dog"));
        p.submit(&mut game, submission("bob", "rat"));
        p.submit(&mut game, submission("alice", "rat"));
        p.submit(&mut game, submission("alice", "tag"));
        game.end().unwrap();

        p.community().vote("en", "dog", "v", VoteType::Like);
        p.community().blacklist("en", "tag");

        let for_ai = p.settle_from_community(&mut game);
        assert_eq!(for_ai, vec!["rat".to_string()]);
        assert_eq!(game.players["bob"].words[0].status, WordStatus::Community);
        assert_eq!(game.players["bob"].score, 2);
        assert_eq!(game.players["alice"].words[1].status, WordStatus::CommunityRejected);
        assert_eq!(game.players["alice"].score, 0);
    }

    #[test]
    fn ai_verdicts_merge_and_missing_stay_unscored() {
        let p = pipeline(&[]);
        let mut game = started_game();
        p.submit(&mut game, submission("bob", "rat"));
        p.submit(&mut game, submission("bob", "dog"));
        p.submit(&mut game, submission("alice", "tag"));
        game.end().unwrap();
        p.settle_from_community(&mut game);

        let verdicts = HashMap::from([("rat".to_string(), true), ("dog".to_string(), false)]);
        let approved = p.apply_ai_verdicts(&mut game, &verdicts);
        assert_eq!(approved, vec![("bob".to_string(), "rat".to_string())]);
        assert_eq!(game.players["bob"].score, 2);
        assert_eq!(
            game.players["alice"].words[0].status,
            WordStatus::AiUnresolved
        );
        assert_eq!(game.players["alice"].words[0].status.validated(), None);
    }

    fn four_player_game() -> Game {
        let mut game = game_with_host();
        join_user(&mut game, "bob", "c2", Identity::default());
        join_user(&mut game, "carol", "c3", Identity::default());
        join_user(&mut game, "dave", "c4", Identity::default());
        game.start("c1", start_request(), 600).unwrap();
        game
    }

    #[test]
    fn peer_majority_invalid_retracts_once() {
        let p = pipeline(&[]);
        let mut game = four_player_game();
        p.submit(&mut game, submission("bob", "rat"));
        game.end().unwrap();
        p.settle_from_community(&mut game);
        let approved = p.apply_ai_verdicts(&mut game, &HashMap::from([("rat".to_string(), true)]));
        assert_eq!(game.players["bob"].score, 2);

        let mut peer = PeerValidation::open(&mut game, approved).unwrap();
        assert_eq!(peer.items()[0].eligible.len(), 3);
        assert!(!peer.record_vote("bob", "rat", true), "submitter cannot vote");
        assert!(peer.record_vote("alice", "RAT", false));
        assert!(peer.record_vote("carol", "rat", false));
        assert!(!peer.is_complete());
        assert!(peer.record_vote("dave", "rat", true));
        assert!(peer.is_complete());

        let verdicts = peer.resolve(&mut game, p.community());
        assert_eq!(
            verdicts,
            vec![PeerVerdict {
                submitter: "bob".into(),
                word: "rat".into(),
                approved: false,
            }]
        );
        assert_eq!(game.players["bob"].score, 0);
        assert_eq!(
            game.players["bob"].words[0].status.source(),
            Some(WordSource::Peer)
        );
        // Human words are not blacklisted.
        assert_eq!(p.community().signal("en", "rat"), CommunitySignal::Unknown);
    }

    #[test]
    fn peer_tie_keeps_word() {
        let p = pipeline(&[]);
        let mut game = four_player_game();
        p.submit(&mut game, submission("bob", "rat"));
        game.end().unwrap();
        p.settle_from_community(&mut game);
        let approved = p.apply_ai_verdicts(&mut game, &HashMap::from([("rat".to_string(), true)]));
        let mut peer = PeerValidation::open(&mut game, approved).unwrap();
        peer.record_vote("alice", "rat", false);
        peer.record_vote("carol", "rat", true);
        peer.resolve(&mut game, p.community());
        assert_eq!(game.players["bob"].score, 2);
    }

    #[test]
    fn rejected_bot_word_is_blacklisted() {
        let p = pipeline(&[]);
        let mut game = four_player_game();
        game.state();
        let bot = User::new("botty".into(), "c9".into(), Identity::default(), None, true, Instant::now());
        game.add_user(bot).unwrap();
        p.submit(&mut game, submission("botty", "rat"));
        game.end().unwrap();
        p.settle_from_community(&mut game);
        let approved = p.apply_ai_verdicts(&mut game, &HashMap::from([("rat".to_string(), true)]));

        let mut peer = PeerValidation::open(&mut game, approved).unwrap();
        for voter in ["alice", "bob", "carol", "dave"] {
            peer.record_vote(voter, "rat", false);
        }
        assert!(peer.is_complete());
        peer.resolve(&mut game, p.community());
        assert_eq!(game.players["botty"].score, 0);
        assert_eq!(p.community().signal("en", "rat"), CommunitySignal::Blacklisted);
    }

    #[test]
    fn nothing_to_vote_on_without_voters() {
        let p = pipeline(&[]);
        let mut game = started_game();
        game.mark_disconnected("c1", Instant::now());
        p.submit(&mut game, submission("bob", "rat"));
        game.end().unwrap();
        p.settle_from_community(&mut game);
        let approved = p.apply_ai_verdicts(&mut game, &HashMap::from([("rat".to_string(), true)]));
        assert!(PeerValidation::open(&mut game, approved).is_none());
        assert_eq!(
            game.players["bob"].words[0].status,
            WordStatus::AiResolved { approved: true }
        );
    }
}

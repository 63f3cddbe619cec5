//! Process-wide room registry: code allocation, lookup and the public listing.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};

use crate::error::GameError;
use crate::game::{GameCommand, GameEvent};
use crate::types::RoomSummary;

const CODE_LENGTH: usize = 4;
const MAX_CODE_LENGTH: usize = 12;
const CODE_ATTEMPTS: usize = 64;

#[derive(Clone)]
pub struct GameHandle {
    pub code: String,
    pub cmd_tx: mpsc::Sender<GameCommand>,
    pub event_tx: broadcast::Sender<GameEvent>,
}

#[derive(Default)]
pub struct Registry {
    /// room code -> handle
    games: DashMap<String, GameHandle>,
    /// room code -> latest listing entry, published by the room task
    summaries: DashMap<String, RoomSummary>,
}

fn random_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LENGTH)
        .map(|_| char::from(b'A' + rng.random_range(0..26)))
        .collect()
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserves a code and registers the handle atomically. A requested code
    /// must be free; otherwise a random one is drawn.
    pub fn insert_new(
        &self,
        requested: Option<&str>,
        cmd_tx: mpsc::Sender<GameCommand>,
        event_tx: broadcast::Sender<GameEvent>,
    ) -> Result<GameHandle, GameError> {
        if let Some(requested) = requested.map(normalize_code).filter(|c| !c.is_empty()) {
            if requested.len() > MAX_CODE_LENGTH || !requested.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(GameError::validation("Room codes are letters and digits only"));
            }
            return match self.games.entry(requested.clone()) {
                Entry::Occupied(_) => Err(GameError::GameExists(requested)),
                Entry::Vacant(slot) => Ok(slot
                    .insert(GameHandle {
                        code: requested,
                        cmd_tx,
                        event_tx,
                    })
                    .clone()),
            };
        }

        for _ in 0..CODE_ATTEMPTS {
            if let Entry::Vacant(slot) = self.games.entry(random_code()) {
                let code = slot.key().clone();
                return Ok(slot
                    .insert(GameHandle {
                        code,
                        cmd_tx,
                        event_tx,
                    })
                    .clone());
            }
        }
        tracing::error!("Could not allocate a free room code");
        Err(GameError::Internal)
    }

    pub fn get(&self, code: &str) -> Option<GameHandle> {
        self.games.get(&normalize_code(code)).map(|h| h.clone())
    }

    pub fn handles(&self) -> Vec<GameHandle> {
        self.games.iter().map(|h| h.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn publish(&self, summary: RoomSummary) {
        if self.games.contains_key(&summary.game_code) {
            self.summaries.insert(summary.game_code.clone(), summary);
        }
    }

    pub fn summary(&self, code: &str) -> Option<RoomSummary> {
        self.summaries.get(&normalize_code(code)).map(|s| s.clone())
    }

    /// The public listing, ordered by code.
    pub fn active_rooms(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self.summaries.iter().map(|s| s.clone()).collect();
        rooms.sort_by(|a, b| a.game_code.cmp(&b.game_code));
        rooms
    }

    pub fn remove_game(&self, code: &str) {
        self.games.remove(code);
        self.summaries.remove(code);
    }
}

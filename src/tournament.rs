//! Multi-round tournaments layered over a single room.

use std::collections::HashMap;

use dashmap::DashMap;

use crate::error::GameError;
use crate::types::TournamentStanding;

pub const MAX_ROUNDS: u32 = 20;

#[derive(Debug, Clone)]
pub struct Tournament {
    pub id: String,
    pub name: String,
    pub room_code: String,
    pub total_rounds: u32,
    rounds: Vec<HashMap<String, u32>>,
}

impl Tournament {
    pub fn rounds_played(&self) -> u32 {
        self.rounds.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.rounds_played() >= self.total_rounds
    }

    /// Totals across rounds, best first. Players missing from a round score 0 for it.
    pub fn standings(&self) -> Vec<TournamentStanding> {
        let mut names: Vec<&String> = self.rounds.iter().flat_map(|r| r.keys()).collect();
        names.sort();
        names.dedup();

        let mut standings: Vec<TournamentStanding> = names
            .into_iter()
            .map(|name| {
                let round_scores: Vec<u32> = self
                    .rounds
                    .iter()
                    .map(|r| r.get(name).copied().unwrap_or(0))
                    .collect();
                TournamentStanding {
                    username: name.clone(),
                    total_score: round_scores.iter().sum(),
                    round_scores,
                }
            })
            .collect();
        standings.sort_by(|a, b| {
            b.total_score
                .cmp(&a.total_score)
                .then_with(|| a.username.cmp(&b.username))
        });
        standings
    }
}

#[derive(Debug, Clone)]
pub struct RoundRecorded {
    pub round: u32,
    pub total_rounds: u32,
    pub complete: bool,
    pub standings: Vec<TournamentStanding>,
}

#[derive(Default)]
pub struct TournamentManager {
    tournaments: DashMap<String, Tournament>,
}

impl TournamentManager {
    pub fn create(&self, name: &str, room_code: &str, total_rounds: u32) -> Result<Tournament, GameError> {
        if total_rounds == 0 || total_rounds > MAX_ROUNDS {
            return Err(GameError::validation(format!(
                "A tournament has between 1 and {} rounds",
                MAX_ROUNDS
            )));
        }
        let name = name.trim();
        let tournament = Tournament {
            id: uuid::Uuid::new_v4().to_string(),
            name: if name.is_empty() { "Tournament".to_string() } else { name.to_string() },
            room_code: room_code.to_string(),
            total_rounds,
            rounds: Vec::new(),
        };
        self.tournaments.insert(tournament.id.clone(), tournament.clone());
        tracing::info!(
            "Tournament {} created in room {} for {} rounds",
            tournament.id,
            room_code,
            total_rounds
        );
        Ok(tournament)
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<Tournament> {
        self.tournaments.get(id).map(|t| t.clone())
    }

    /// Adds one round's final scores. Finished tournaments are dropped.
    pub fn record_round(&self, id: &str, scores: HashMap<String, u32>) -> Option<RoundRecorded> {
        let recorded = {
            let mut tournament = self.tournaments.get_mut(id)?;
            if tournament.is_complete() {
                return None;
            }
            tournament.rounds.push(scores);
            RoundRecorded {
                round: tournament.rounds_played(),
                total_rounds: tournament.total_rounds,
                complete: tournament.is_complete(),
                standings: tournament.standings(),
            }
        };
        if recorded.complete {
            if let Some((_, finished)) = self.tournaments.remove(id) {
                tracing::info!("Tournament {} in room {} complete", id, finished.room_code);
            }
        }
        Some(recorded)
    }

    pub fn cancel(&self, id: &str) {
        if self.tournaments.remove(id).is_some() {
            tracing::info!("Tournament {} cancelled", id);
        }
    }
}

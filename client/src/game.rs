//! Client-side view of the world and the bot's movement.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{CellKind, Position, RelatedPosition, RelatedPositions};
use std::collections::HashMap;

/// Latest snapshot received from the server
#[derive(Debug, Default, Clone)]
pub struct ClientView {
    pub position: Option<Position>,
    pub cells: Vec<RelatedPosition>,
    pub scoreboard: HashMap<String, i32>,
    /// Number of snapshots applied so far
    pub snapshots: u64,
}

impl ClientView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the view with a newer snapshot
    pub fn apply(&mut self, snapshot: RelatedPositions) {
        self.position = Some(snapshot.user_position);
        self.cells = snapshot.related_positions;
        self.scoreboard = snapshot.scoreboard;
        self.snapshots += 1;
    }

    pub fn score(&self, user_id: &str) -> Option<i32> {
        self.scoreboard.get(user_id).copied()
    }

    pub fn visible(&self, kind: CellKind) -> impl Iterator<Item = &RelatedPosition> {
        self.cells.iter().filter(move |related| related.cell.kind == kind)
    }

    /// Other users within attack range of our position
    pub fn adjacent_opponents(&self, user_id: &str) -> Vec<Position> {
        let Some(position) = self.position else {
            return Vec::new();
        };

        self.cells
            .iter()
            .filter(|related| related.cell.occupied && related.cell.owner != user_id)
            .filter(|related| related.position.chebyshev_distance(&position) == 1)
            .map(|related| related.position)
            .collect()
    }
}

/// Bounded random walk over a square map
pub struct RandomWalk {
    position: Position,
    map_size: i32,
    rng: StdRng,
}

impl RandomWalk {
    pub fn new(start: Position, map_size: i32) -> Self {
        Self::with_rng(start, map_size, StdRng::from_entropy())
    }

    pub fn seeded(start: Position, map_size: i32, seed: u64) -> Self {
        Self::with_rng(start, map_size, StdRng::seed_from_u64(seed))
    }

    fn with_rng(start: Position, map_size: i32, rng: StdRng) -> Self {
        let map_size = map_size.max(1);
        Self {
            position: clamp(start, map_size),
            map_size,
            rng,
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    /// Moves at most one cell in each axis and stays on the map
    pub fn next_position(&mut self) -> Position {
        let step = Position::new(
            self.position.x + self.rng.gen_range(-1..=1),
            self.position.y + self.rng.gen_range(-1..=1),
        );
        self.position = clamp(step, self.map_size);
        self.position
    }

    /// A random cell next to the current position
    pub fn attack_target(&mut self) -> Position {
        loop {
            let dx = self.rng.gen_range(-1..=1);
            let dy = self.rng.gen_range(-1..=1);
            if dx != 0 || dy != 0 {
                return Position::new(self.position.x + dx, self.position.y + dy);
            }
        }
    }

    pub fn should_attack(&mut self, probability: f64) -> bool {
        self.rng.gen_bool(probability.clamp(0.0, 1.0))
    }
}

fn clamp(position: Position, map_size: i32) -> Position {
    Position::new(
        position.x.clamp(0, map_size - 1),
        position.y.clamp(0, map_size - 1),
    )
}

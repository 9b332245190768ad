use log::{debug, info};
use rand::Rng;
use shared::{Attack, Cell, CellKind, Position, RelatedPosition, Status};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::WorldConfig;

/// What the server knows about a user between two status messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserStatus {
    pub position: Position,
    /// Extra visibility radius granted by collected items
    pub item_effect: i32,
}

/// Shared game state consumed by the session tasks.
///
/// Implementations must be safe for concurrent reads and keep a single
/// mutation path per user.
pub trait World: Send + Sync {
    fn update_user_position(&self, status: &Status);
    fn apply_attack(&self, attack: &Attack);
    fn related_positions(&self, position: Position, visibility: i32) -> Vec<RelatedPosition>;
    /// Vacates the user's cell on the map
    fn remove_user(&self, user_id: &str);

    fn user_status(&self, user_id: &str) -> Option<UserStatus>;
    fn remove_user_status(&self, user_id: &str);

    /// Copy of the scoreboard
    fn scoreboard(&self) -> HashMap<String, i32>;
    fn register_score(&self, user_id: &str);
    fn remove_score(&self, user_id: &str);

    fn coin_count(&self) -> usize;
    fn item_count(&self) -> usize;

    /// Removes every trace of the user from map, statuses and scoreboard
    fn deregister(&self, user_id: &str) {
        self.remove_user(user_id);
        self.remove_user_status(user_id);
        self.remove_score(user_id);
    }
}

pub type SharedWorld = Arc<dyn World>;

#[derive(Debug)]
struct GameMap {
    size: i32,
    cells: Vec<Cell>,
    coins: HashSet<Position>,
    items: HashSet<Position>,
}

impl GameMap {
    fn new(size: i32) -> Self {
        let size = size.max(1);
        Self {
            size,
            cells: vec![Cell::default(); (size * size) as usize],
            coins: HashSet::new(),
            items: HashSet::new(),
        }
    }

    fn contains(&self, position: Position) -> bool {
        (0..self.size).contains(&position.x) && (0..self.size).contains(&position.y)
    }

    fn index(&self, position: Position) -> usize {
        (position.y * self.size + position.x) as usize
    }

    fn cell(&self, position: Position) -> Option<&Cell> {
        self.contains(position)
            .then(|| &self.cells[self.index(position)])
    }

    fn cell_mut(&mut self, position: Position) -> Option<&mut Cell> {
        if !self.contains(position) {
            return None;
        }
        let index = self.index(position);
        Some(&mut self.cells[index])
    }

    fn vacate(&mut self, position: Position, user_id: &str) {
        if let Some(cell) = self.cell_mut(position) {
            if cell.owner == user_id {
                cell.occupied = false;
                cell.owner.clear();
            }
        }
    }
}

/// In-memory world: a square grid with coins and items, user statuses and
/// the scoreboard, each behind its own lock.
///
/// Locks are always taken in the order map, statuses, scoreboard.
#[derive(Debug)]
pub struct GameWorld {
    config: WorldConfig,
    map: RwLock<GameMap>,
    statuses: RwLock<HashMap<String, UserStatus>>,
    scoreboard: RwLock<HashMap<String, i32>>,
}

impl GameWorld {
    /// Creates a world with coins and items scattered at random
    pub fn new(config: WorldConfig) -> Self {
        let world = Self::empty(config);
        world.scatter_resources();
        world
    }

    /// Creates a world with a bare map
    pub fn empty(config: WorldConfig) -> Self {
        Self {
            config,
            map: RwLock::new(GameMap::new(config.map_size)),
            statuses: RwLock::new(HashMap::new()),
            scoreboard: RwLock::new(HashMap::new()),
        }
    }

    pub fn place_coin(&self, position: Position) -> bool {
        self.place(position, CellKind::Coin)
    }

    pub fn place_item(&self, position: Position) -> bool {
        self.place(position, CellKind::Item)
    }

    pub fn cell(&self, position: Position) -> Option<Cell> {
        read(&self.map).cell(position).cloned()
    }

    fn place(&self, position: Position, kind: CellKind) -> bool {
        let mut map = write(&self.map);
        match map.cell_mut(position) {
            Some(cell) if cell.kind == CellKind::Ground && !cell.occupied => cell.kind = kind,
            _ => return false,
        }

        match kind {
            CellKind::Coin => map.coins.insert(position),
            CellKind::Item => map.items.insert(position),
            CellKind::Ground => false,
        }
    }

    fn scatter_resources(&self) {
        let mut rng = rand::thread_rng();
        let size = self.config.map_size.max(1);
        let mut random_position = || Position::new(rng.gen_range(0..size), rng.gen_range(0..size));

        // Duplicate picks are skipped, so fewer coins than requested may land
        for _ in 0..self.config.coin_count {
            self.place_coin(random_position());
        }

        let free_cells = (size * size) as usize - self.coin_count();
        let item_target = self.config.item_count.min(free_cells);
        while self.item_count() < item_target {
            self.place_item(random_position());
        }

        info!(
            "World initialized: {}x{} map, {} coins, {} items",
            size,
            size,
            self.coin_count(),
            self.item_count()
        );
    }
}

impl World for GameWorld {
    fn update_user_position(&self, status: &Status) {
        let position = status.current_position;
        let mut map = write(&self.map);

        match map.cell(position) {
            None => {
                debug!("Ignoring out of bounds position {:?} from {}", position, status.id);
                return;
            }
            Some(cell) if cell.occupied && cell.owner != status.id => {
                debug!("Cell {:?} already occupied by {}", position, cell.owner);
                return;
            }
            Some(_) => {}
        }

        let mut statuses = write(&self.statuses);
        let previous = statuses.get(&status.id).copied();
        if let Some(previous) = previous {
            map.vacate(previous.position, &status.id);
        }

        let mut item_effect = previous.map_or(0, |s| s.item_effect);
        let mut scored = false;
        if let Some(cell) = map.cell_mut(position) {
            cell.occupied = true;
            cell.owner = status.id.clone();
            match cell.kind {
                CellKind::Coin => scored = true,
                CellKind::Item => item_effect += 1,
                CellKind::Ground => {}
            }
            cell.kind = CellKind::Ground;
        }
        map.coins.remove(&position);
        map.items.remove(&position);

        statuses.insert(
            status.id.clone(),
            UserStatus {
                position,
                item_effect,
            },
        );

        if scored {
            *write(&self.scoreboard).entry(status.id.clone()).or_insert(0) += 1;
        }
    }

    fn apply_attack(&self, attack: &Attack) {
        if attack.user_position.chebyshev_distance(&attack.attack_position) > 1 {
            debug!("Attack from {} out of range", attack.user_id);
            return;
        }

        let map = read(&self.map);
        let victim = match map.cell(attack.attack_position) {
            Some(cell) if cell.occupied && cell.owner != attack.user_id => cell.owner.clone(),
            _ => return,
        };

        let mut scoreboard = write(&self.scoreboard);
        let victim_score = scoreboard.entry(victim.clone()).or_insert(0);
        if *victim_score <= 0 {
            return;
        }
        *victim_score -= 1;
        *scoreboard.entry(attack.user_id.clone()).or_insert(0) += 1;
        debug!("{} took a point from {}", attack.user_id, victim);
    }

    fn related_positions(&self, position: Position, visibility: i32) -> Vec<RelatedPosition> {
        let radius = self.config.base_visibility + visibility.max(0);
        let map = read(&self.map);
        let mut related = Vec::new();

        for y in (position.y - radius)..=(position.y + radius) {
            for x in (position.x - radius)..=(position.x + radius) {
                let position = Position::new(x, y);
                if let Some(cell) = map.cell(position) {
                    if !cell.is_empty() {
                        related.push(RelatedPosition {
                            cell: cell.clone(),
                            position,
                        });
                    }
                }
            }
        }

        related
    }

    fn remove_user(&self, user_id: &str) {
        let mut map = write(&self.map);
        let position = read(&self.statuses).get(user_id).map(|s| s.position);
        if let Some(position) = position {
            map.vacate(position, user_id);
        }
    }

    fn user_status(&self, user_id: &str) -> Option<UserStatus> {
        read(&self.statuses).get(user_id).copied()
    }

    fn remove_user_status(&self, user_id: &str) {
        write(&self.statuses).remove(user_id);
    }

    fn scoreboard(&self) -> HashMap<String, i32> {
        read(&self.scoreboard).clone()
    }

    fn register_score(&self, user_id: &str) {
        // Zero scores are listed too so new players show up on the board
        write(&self.scoreboard).entry(user_id.to_string()).or_insert(0);
    }

    fn remove_score(&self, user_id: &str) {
        write(&self.scoreboard).remove(user_id);
    }

    fn coin_count(&self) -> usize {
        read(&self.map).coins.len()
    }

    fn item_count(&self) -> usize {
        read(&self.map).items.len()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_world() -> GameWorld {
        GameWorld::empty(WorldConfig {
            map_size: 10,
            coin_count: 0,
            item_count: 0,
            base_visibility: 2,
        })
    }

    fn status(id: &str, x: i32, y: i32) -> Status {
        Status {
            id: id.to_string(),
            current_position: Position::new(x, y),
        }
    }

    #[test]
    fn test_random_world_resources() {
        let world = GameWorld::new(WorldConfig {
            map_size: 20,
            coin_count: 15,
            item_count: 5,
            base_visibility: 3,
        });

        assert!(world.coin_count() > 0);
        assert!(world.coin_count() <= 15);
        assert_eq!(world.item_count(), 5);
    }

    #[test]
    fn test_update_user_position_moves_occupancy() {
        let world = small_world();
        world.update_user_position(&status("alice", 1, 1));
        world.update_user_position(&status("alice", 2, 1));

        assert!(!world.cell(Position::new(1, 1)).unwrap().occupied);
        let cell = world.cell(Position::new(2, 1)).unwrap();
        assert!(cell.occupied);
        assert_eq!(cell.owner, "alice");
        assert_eq!(
            world.user_status("alice").unwrap().position,
            Position::new(2, 1)
        );
    }

    #[test]
    fn test_out_of_bounds_position_ignored() {
        let world = small_world();
        world.update_user_position(&status("alice", 1, 1));
        world.update_user_position(&status("alice", 10, 1));
        world.update_user_position(&status("alice", -1, 1));

        assert_eq!(
            world.user_status("alice").unwrap().position,
            Position::new(1, 1)
        );
    }

    #[test]
    fn test_occupied_cell_rejects_other_user() {
        let world = small_world();
        world.update_user_position(&status("alice", 4, 4));
        world.update_user_position(&status("bob", 4, 4));

        assert_eq!(world.cell(Position::new(4, 4)).unwrap().owner, "alice");
        assert!(world.user_status("bob").is_none());
    }

    #[test]
    fn test_collecting_coin_scores() {
        let world = small_world();
        assert!(world.place_coin(Position::new(3, 3)));
        world.register_score("alice");

        world.update_user_position(&status("alice", 3, 3));

        assert_eq!(world.scoreboard().get("alice"), Some(&1));
        assert_eq!(world.coin_count(), 0);
        assert_eq!(world.cell(Position::new(3, 3)).unwrap().kind, CellKind::Ground);
    }

    #[test]
    fn test_collecting_item_extends_visibility() {
        let world = small_world();
        world.place_item(Position::new(5, 5));

        world.update_user_position(&status("alice", 5, 5));

        assert_eq!(world.user_status("alice").unwrap().item_effect, 1);
        assert_eq!(world.item_count(), 0);
    }

    #[test]
    fn test_place_on_non_ground_fails() {
        let world = small_world();

        assert!(world.place_coin(Position::new(0, 0)));
        assert!(!world.place_item(Position::new(0, 0)));
        assert!(!world.place_coin(Position::new(42, 0)));
    }

    #[test]
    fn test_attack_transfers_point() {
        let world = small_world();
        world.place_coin(Position::new(6, 6));
        world.update_user_position(&status("bob", 6, 6));
        world.update_user_position(&status("alice", 5, 6));

        world.apply_attack(&Attack {
            user_id: "alice".to_string(),
            user_position: Position::new(5, 6),
            attack_position: Position::new(6, 6),
        });

        let board = world.scoreboard();
        assert_eq!(board.get("bob"), Some(&0));
        assert_eq!(board.get("alice"), Some(&1));
    }

    #[test]
    fn test_attack_out_of_range_or_on_empty_cell() {
        let world = small_world();
        world.place_coin(Position::new(6, 6));
        world.update_user_position(&status("bob", 6, 6));

        world.apply_attack(&Attack {
            user_id: "alice".to_string(),
            user_position: Position::new(1, 1),
            attack_position: Position::new(6, 6),
        });
        world.apply_attack(&Attack {
            user_id: "alice".to_string(),
            user_position: Position::new(6, 7),
            attack_position: Position::new(7, 7),
        });

        assert_eq!(world.scoreboard().get("bob"), Some(&1));
        assert_eq!(world.scoreboard().get("alice"), None);
    }

    #[test]
    fn test_attack_with_extreme_coordinates_is_ignored() {
        let world = small_world();
        world.place_coin(Position::new(0, 0));
        world.update_user_position(&status("bob", 0, 0));

        world.apply_attack(&Attack {
            user_id: "mallory".to_string(),
            user_position: Position::new(i32::MIN, 0),
            attack_position: Position::new(i32::MAX, 0),
        });
        world.apply_attack(&Attack {
            user_id: "mallory".to_string(),
            user_position: Position::new(i32::MAX, i32::MAX),
            attack_position: Position::new(i32::MAX, i32::MAX),
        });

        assert_eq!(world.scoreboard().get("bob"), Some(&1));
        assert_eq!(world.scoreboard().get("mallory"), None);
    }

    #[test]
    fn test_related_positions_window() {
        let world = small_world();
        world.place_coin(Position::new(1, 0));
        world.place_item(Position::new(9, 9));
        world.update_user_position(&status("alice", 0, 0));

        let related = world.related_positions(Position::new(0, 0), 0);
        let positions: Vec<Position> = related.iter().map(|r| r.position).collect();

        assert_eq!(positions, vec![Position::new(0, 0), Position::new(1, 0)]);

        let wider = world.related_positions(Position::new(0, 0), 7);
        assert_eq!(wider.len(), 3);
    }

    #[test]
    fn test_deregister_clears_everything() {
        let world = small_world();
        world.register_score("alice");
        world.update_user_position(&status("alice", 2, 2));

        world.deregister("alice");

        assert!(world.user_status("alice").is_none());
        assert!(!world.scoreboard().contains_key("alice"));
        assert!(!world.cell(Position::new(2, 2)).unwrap().occupied);
    }
}

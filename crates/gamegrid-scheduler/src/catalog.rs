//! Game catalog lookup.

use std::collections::HashMap;

use gamegrid_core::GameEntry;

/// Maps a game to the capacity class its sessions request.
pub trait GameCatalog: Send + Sync {
    /// Capacity class for `game_id`, or `None` if the game is unknown.
    fn capacity_class(&self, game_id: &str) -> Option<u32>;
}

/// Catalog loaded once from the `[[games]]` config entries.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    games: HashMap<String, GameEntry>,
}

impl StaticCatalog {
    pub fn new(entries: impl IntoIterator<Item = GameEntry>) -> Self {
        Self {
            games: entries
                .into_iter()
                .map(|entry| (entry.id.clone(), entry))
                .collect(),
        }
    }
}

impl GameCatalog for StaticCatalog {
    fn capacity_class(&self, game_id: &str) -> Option<u32> {
        self.games.get(game_id).map(|g| g.max_sessions_per_vm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, max: u32) -> GameEntry {
        GameEntry {
            id: id.to_string(),
            name: None,
            max_sessions_per_vm: max,
        }
    }

    #[test]
    fn lookup_by_id() {
        let catalog = StaticCatalog::new([entry("chess", 4), entry("racer", 1)]);
        assert_eq!(catalog.capacity_class("chess"), Some(4));
        assert_eq!(catalog.capacity_class("racer"), Some(1));
        assert_eq!(catalog.capacity_class("tetris"), None);
    }
}

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::Position;
use crate::error::Result;

/// Durable position snapshots. The store is the single source of truth
/// across restarts; it only needs atomic single-record upsert and a query
/// for every non-terminal record.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Atomic upsert of one position snapshot.
    async fn save_position(&self, position: &Position) -> Result<()>;

    /// All positions not in a terminal state.
    async fn load_open_positions(&self) -> Result<Vec<Position>>;

    async fn load_position(&self, id: Uuid) -> Result<Option<Position>>;
}

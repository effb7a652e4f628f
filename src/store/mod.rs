pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod traits;

pub use memory::InMemoryTreeStore;
pub use models::{ChunkItem, EmbeddingOwnerType, EmbeddingRow, NodeChunkLink, NodeKind, Tree, TreeEdge, TreeNode};
pub use pool::DbPool;
pub use postgres::PostgresTreeStore;
pub use traits::TreeStore;

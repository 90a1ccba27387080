pub mod index;
pub mod schema;
pub mod store;
pub mod table;

pub use index::{DocumentGuard, IndexStats, VectorIndex};
pub use store::LanceStore;

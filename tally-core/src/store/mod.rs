pub mod schema;
pub mod sqlite;
pub mod traits;

pub use traits::SyncStore;

pub mod memory_storage;
pub mod sqlite_storage;
pub use memory_storage::{MemoryDeadLetterSink, MemoryStateStore};
pub use sqlite_storage::{SqliteDeadLetterSink, SqliteStateStore};

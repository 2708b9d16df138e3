pub mod record;
pub mod record_store;
pub mod sqlite_store;

pub use record::MigrationRecord;
pub use record_store::RecordStore;
pub use sqlite_store::{DEFAULT_COLLECTION, SqliteRecordStore, validate_collection_name};

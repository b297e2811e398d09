pub mod dialog_store;
pub mod model;
pub mod sqlite_store;

pub use dialog_store::{DialogStore, DialogStoreExt};
pub use model::{Dialog, NewUser, TokenUsage, Turn, UserRecord};
pub use sqlite_store::SqliteDialogStore;

pub mod database;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod users;
pub mod votes;

pub use database::Database;
pub use error::StoreError;
pub use messages::{AppendOutcome, MessageRepo};
pub use users::UserRepo;
pub use votes::VoteRepo;

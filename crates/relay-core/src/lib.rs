pub mod errors;
pub mod limits;
pub mod message;
pub mod protocol;

pub use errors::SubmitError;
pub use limits::{QuotaPolicy, RelayLimits};
pub use message::{ChatMessage, VoteCounts, VoteKind};
pub use protocol::{ClientCommand, RejectKind, ServerEvent};

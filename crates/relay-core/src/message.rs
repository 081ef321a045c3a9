use serde::{Deserialize, Serialize};

/// A chat message as persisted by the store.
///
/// `id` is assigned by the store and monotonically increasing; persistence
/// order is the only source of truth for message ordering. `text` is stored
/// trimmed and is never empty.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: i64,
    pub author: String,
    pub text: String,
    pub created_at: String,
}

/// A vote kind. One row per (message, voter); a later vote overwrites.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VoteKind {
    Approve,
    Disapprove,
}

impl VoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Disapprove => "disapprove",
        }
    }
}

impl std::str::FromStr for VoteKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "disapprove" => Ok(Self::Disapprove),
            other => Err(format!("unknown vote kind: {other}")),
        }
    }
}

/// Aggregate vote counts for one message.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteCounts {
    pub message_id: i64,
    pub approve_count: i64,
    pub disapprove_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_kind_serde_is_lowercase() {
        let json = serde_json::to_string(&VoteKind::Approve).unwrap();
        assert_eq!(json, "\"approve\"");
        let parsed: VoteKind = serde_json::from_str("\"disapprove\"").unwrap();
        assert_eq!(parsed, VoteKind::Disapprove);
    }

    #[test]
    fn vote_kind_from_str_roundtrip() {
        assert_eq!("approve".parse::<VoteKind>().unwrap(), VoteKind::Approve);
        assert_eq!(
            "disapprove".parse::<VoteKind>().unwrap(),
            VoteKind::Disapprove
        );
        assert!("upvote".parse::<VoteKind>().is_err());
    }

    #[test]
    fn chat_message_serde_roundtrip() {
        let msg = ChatMessage {
            id: 7,
            author: "alice".into(),
            text: "hello".into(),
            created_at: "2026-02-14T12:00:00Z".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }
}

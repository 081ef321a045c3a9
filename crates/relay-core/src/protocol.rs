use serde::{Deserialize, Serialize};

use crate::message::{ChatMessage, VoteKind};

/// Inbound frames on the WebSocket, tagged by `type`.
///
/// `hello` must be the first frame on every connection; everything else is
/// rejected until the connection is admitted.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientCommand {
    Hello {
        #[serde(default)]
        identity: Option<String>,
        #[serde(default)]
        secret: Option<String>,
    },
    SubmitMessage {
        text: String,
    },
    RequestHistory,
    Vote {
        message_id: i64,
        kind: VoteKind,
    },
}

/// Outbound frames, tagged by `type`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Sent unicast on admission (and on explicit `request-history`),
    /// oldest message first.
    HistorySnapshot { messages: Vec<ChatMessage> },

    /// Fan-out to every admitted session, including the sender.
    MessageBroadcast { message: ChatMessage },

    VoteCountsUpdated {
        message_id: i64,
        approve_count: i64,
        disapprove_count: i64,
    },

    /// Unicast to the connection whose frame was rejected.
    SubmissionError {
        kind: RejectKind,
        detail: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_in_ms: Option<u64>,
    },
}

impl ServerEvent {
    pub fn error(kind: RejectKind, detail: impl Into<String>) -> Self {
        Self::SubmissionError {
            kind,
            detail: detail.into(),
            retry_in_ms: None,
        }
    }

    /// Serialize for the wire. The protocol types contain nothing that can
    /// fail to serialize, so this is infallible in practice.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"submission-error","kind":"internal-error","detail":"serialization"}"#
                .to_string()
        })
    }
}

/// Why a frame was rejected.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RejectKind {
    EmptyMessage,
    CooldownActive,
    QuotaExceeded,
    InternalError,
    AuthRequired,
    AuthInvalid,
    InvalidFrame,
}

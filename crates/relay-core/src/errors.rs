use std::time::Duration;

use crate::protocol::RejectKind;

/// Why a message submission was not accepted.
/// Rejections are recovered locally and signalled to the sender only;
/// persistence failures are retryable, the rest are not.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("message text is empty")]
    Empty,

    #[error("cooldown active, {} ms remaining", remaining.as_millis())]
    Cooldown { remaining: Duration },

    #[error("quota exceeded: {count} messages retained")]
    QuotaExceeded { count: i64 },

    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl SubmitError {
    pub fn reject_kind(&self) -> RejectKind {
        match self {
            Self::Empty => RejectKind::EmptyMessage,
            Self::Cooldown { .. } => RejectKind::CooldownActive,
            Self::QuotaExceeded { .. } => RejectKind::QuotaExceeded,
            Self::Persistence(_) => RejectKind::InternalError,
        }
    }

    /// Milliseconds until the sender may retry, where that is known.
    pub fn retry_in_ms(&self) -> Option<u64> {
        match self {
            Self::Cooldown { remaining } => Some(remaining.as_millis() as u64),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Cooldown { .. } | Self::Persistence(_))
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Empty => "empty_message",
            Self::Cooldown { .. } => "cooldown_active",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::Persistence(_) => "persistence",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_kind_mapping() {
        assert_eq!(SubmitError::Empty.reject_kind(), RejectKind::EmptyMessage);
        assert_eq!(
            SubmitError::Cooldown {
                remaining: Duration::from_millis(500)
            }
            .reject_kind(),
            RejectKind::CooldownActive
        );
        assert_eq!(
            SubmitError::QuotaExceeded { count: 20 }.reject_kind(),
            RejectKind::QuotaExceeded
        );
        assert_eq!(
            SubmitError::Persistence("disk full".into()).reject_kind(),
            RejectKind::InternalError
        );
    }

    #[test]
    fn retry_hint_only_for_cooldown() {
        let err = SubmitError::Cooldown {
            remaining: Duration::from_millis(4200),
        };
        assert_eq!(err.retry_in_ms(), Some(4200));
        assert_eq!(SubmitError::Empty.retry_in_ms(), None);
        assert_eq!(SubmitError::QuotaExceeded { count: 1 }.retry_in_ms(), None);
    }

    #[test]
    fn retryable_classification() {
        assert!(SubmitError::Persistence("io".into()).is_retryable());
        assert!(SubmitError::Cooldown {
            remaining: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!SubmitError::Empty.is_retryable());
        assert!(!SubmitError::QuotaExceeded { count: 5 }.is_retryable());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(SubmitError::Empty.error_kind(), "empty_message");
        assert_eq!(
            SubmitError::Persistence("x".into()).error_kind(),
            "persistence"
        );
    }
}

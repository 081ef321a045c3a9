use std::time::Duration;

/// What to do when an identity has `max_messages_per_user` messages retained
/// and submits another one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaPolicy {
    /// Delete that identity's single oldest message, then accept.
    EvictOldest,
    /// Reject the new message.
    Reject,
}

impl std::str::FromStr for QuotaPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "evict" | "evict-oldest" => Ok(Self::EvictOldest),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown quota policy: {other} (expected evict|reject)")),
        }
    }
}

/// Relay-wide limits enforced on every submission.
#[derive(Clone, Copy, Debug)]
pub struct RelayLimits {
    /// Minimum elapsed time between two accepted submissions from one identity.
    pub cooldown: Duration,
    /// Upper bound on the history log; trimming removes oldest first.
    pub max_total_messages: u32,
    /// Upper bound on one identity's retained messages.
    pub max_messages_per_user: u32,
    pub quota_policy: QuotaPolicy,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_millis(3000),
            max_total_messages: 200,
            max_messages_per_user: 20,
            quota_policy: QuotaPolicy::EvictOldest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_policy_from_str() {
        assert_eq!("evict".parse::<QuotaPolicy>().unwrap(), QuotaPolicy::EvictOldest);
        assert_eq!(
            "evict-oldest".parse::<QuotaPolicy>().unwrap(),
            QuotaPolicy::EvictOldest
        );
        assert_eq!("reject".parse::<QuotaPolicy>().unwrap(), QuotaPolicy::Reject);
        assert!("drop".parse::<QuotaPolicy>().is_err());
    }

    #[test]
    fn default_limits_sane() {
        let limits = RelayLimits::default();
        assert!(limits.max_total_messages >= limits.max_messages_per_user);
        assert!(limits.cooldown > Duration::ZERO);
        assert_eq!(limits.quota_policy, QuotaPolicy::EvictOldest);
    }
}

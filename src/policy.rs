//! Runtime policy knobs, passed at construction instead of compile-time flags.

use std::time::Duration;
use tracing::warn;

/// Environment variable holding the identity-key passphrase.
pub const ENV_KEY_PASSWORD: &str = "ASCII_CHAT_KEY_PASSWORD";

/// Environment variable disabling TOFU pinning. Dangerous; a prominent
/// warning is emitted whenever it takes effect.
pub const ENV_INSECURE_NO_HOST_IDENTITY_CHECK: &str = "ASCII_CHAT_INSECURE_NO_HOST_IDENTITY_CHECK";

/// Security and timing policy for a node.
///
/// Every component takes a reference at construction; nothing reads
/// process-global state after startup.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Refuse sessions that negotiate the null cipher.
    pub require_encryption: bool,
    /// Refuse peers whose identity key is not already pinned.
    pub require_pinning: bool,
    /// Rekey after this many payload bytes under one key set.
    pub rekey_bytes: u64,
    /// Rekey after this many seconds under one key set.
    pub rekey_seconds: u32,
    /// Consensus round deadline, halved on miss down to 500 ms.
    pub round_deadline_ms: u32,
    /// Connect cascade budgets: direct TCP, STUN-assisted, relay.
    pub stage_budgets_ms: (u32, u32, u32),
    /// Anti-replay window size in packets. Minimum 64.
    pub replay_window: u32,
    /// Skip known-hosts verification entirely.
    pub insecure_skip_tofu: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            require_encryption: true,
            require_pinning: false,
            rekey_bytes: 1 << 30,
            rekey_seconds: 3600,
            round_deadline_ms: 5_000,
            stage_budgets_ms: (3_000, 8_000, 15_000),
            replay_window: 64,
            insecure_skip_tofu: false,
        }
    }
}

impl Policy {
    /// Apply environment overrides recognized by the core.
    pub fn from_env() -> Self {
        let mut policy = Self::default();
        if std::env::var_os(ENV_INSECURE_NO_HOST_IDENTITY_CHECK).is_some() {
            policy.insecure_skip_tofu = true;
            warn!("════════════════════════════════════════════════════════════");
            warn!("  DANGER: {} is set", ENV_INSECURE_NO_HOST_IDENTITY_CHECK);
            warn!("  Peer identity pinning is DISABLED for this process.");
            warn!("  Connections are vulnerable to man-in-the-middle attack.");
            warn!("════════════════════════════════════════════════════════════");
        }
        policy
    }

    /// Identity-key passphrase from the environment, if configured.
    pub fn key_password() -> Option<String> {
        std::env::var(ENV_KEY_PASSWORD).ok()
    }

    pub fn stage_budget(&self, stage: usize) -> Duration {
        let ms = match stage {
            0 => self.stage_budgets_ms.0,
            1 => self.stage_budgets_ms.1,
            _ => self.stage_budgets_ms.2,
        };
        Duration::from_millis(ms as u64)
    }

    /// Clamp to the protocol minimum; a smaller window would re-admit
    /// packets the peer legitimately reordered.
    pub fn effective_replay_window(&self) -> u64 {
        self.replay_window.max(64) as u64
    }
}

//! Core types for the agent runtime.
//!
//! - Identifiers: [`SessionId`], [`MessageId`], [`PartId`], [`RequestId`]
//! - [`AgentConfig`]: Configuration for the session loop
//! - [`RetryConfig`] / [`DoomLoopConfig`]: Tuning for retries and loop detection
//! - [`TokenUsage`]: Token consumption statistics
//! - [`SessionStatus`] / [`SessionInfo`]: Lifecycle state of a session

use crate::context::CompactionConfig;
use crate::permission::MemoryScope;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(format!(concat!($prefix, "_{}"), Uuid::new_v4().simple()))
            }

            #[must_use]
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

prefixed_id!(
    /// Unique identifier for a session
    SessionId,
    "ses"
);
prefixed_id!(
    /// Unique identifier for a message within a session
    MessageId,
    "msg"
);
prefixed_id!(
    /// Unique identifier for a message part
    PartId,
    "prt"
);
prefixed_id!(
    /// Unique identifier for a pending permission request
    RequestId,
    "per"
);

/// Configuration for the session loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum number of turns (model round-trips) per prompt
    pub max_turns: usize,
    /// System prompt passed to the model on every turn
    pub system_prompt: Option<String>,
    /// Keep looping after a denied or rejected tool call instead of stopping
    pub continue_loop_on_deny: bool,
    /// Where "always" permission replies are remembered
    pub memory_scope: MemoryScope,
    /// How many times a turn is re-issued after a transient failure mid-stream
    pub turn_retries: u32,
    pub retry: RetryConfig,
    pub doom_loop: DoomLoopConfig,
    pub compaction: CompactionConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 100,
            system_prompt: None,
            continue_loop_on_deny: false,
            memory_scope: MemoryScope::Session,
            turn_retries: 2,
            retry: RetryConfig::default(),
            doom_loop: DoomLoopConfig::default(),
            compaction: CompactionConfig::default(),
        }
    }
}

impl AgentConfig {
    #[must_use]
    pub const fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub const fn with_continue_loop_on_deny(mut self, value: bool) -> Self {
        self.continue_loop_on_deny = value;
        self
    }

    #[must_use]
    pub const fn with_memory_scope(mut self, scope: MemoryScope) -> Self {
        self.memory_scope = scope;
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn with_turn_retries(mut self, turn_retries: u32) -> Self {
        self.turn_retries = turn_retries;
        self
    }

    #[must_use]
    pub const fn with_doom_loop(mut self, doom_loop: DoomLoopConfig) -> Self {
        self.doom_loop = doom_loop;
        self
    }

    #[must_use]
    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }
}

/// Configuration for retry behavior on transient provider errors.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Growth factor applied per attempt
    pub multiplier: f64,
    /// Cap for computed delays (server-provided delays are not capped)
    pub max_delay_ms: u64,
    /// Random spread applied to each delay, as a fraction of it (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// A single attempt, no retries
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
            jitter: 0.0,
        }
    }

    /// Fast retries (for testing)
    #[must_use]
    pub const fn fast() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 100,
            jitter: 0.0,
        }
    }
}

/// Doom loop detection tuning.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DoomLoopConfig {
    /// Number of recent signatures retained per session
    pub window: usize,
    /// Consecutive identical signatures that trigger detection
    pub threshold: usize,
}

impl Default for DoomLoopConfig {
    fn default() -> Self {
        Self {
            window: 50,
            threshold: 3,
        }
    }
}

/// Token usage statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl TokenUsage {
    pub const fn add(&mut self, other: &Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }

    /// All tokens that occupied the context window for the request.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.reasoning_tokens
            + self.cache_read_tokens
            + self.cache_write_tokens
    }
}

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Streaming,
    ToolExecuting,
    Interrupted,
    Done,
}

impl SessionStatus {
    /// Whether this status ends a prompt.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Interrupted | Self::Done)
    }
}

/// Snapshot of a session's identity and state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub project_id: String,
    pub status: SessionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SessionInfo {
    #[must_use]
    pub fn new(project_id: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: SessionId::new(),
            project_id: project_id.into(),
            status: SessionStatus::Idle,
            created_at: now,
            updated_at: now,
        }
    }
}

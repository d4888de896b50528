//! Configuration for context compaction.

use serde::{Deserialize, Serialize};

/// Model limits and pruning thresholds.
///
/// # Example
///
/// ```
/// use agent_runtime::context::CompactionConfig;
///
/// let config = CompactionConfig::default()
///     .with_context_limit(128_000)
///     .with_output_limit(8_000);
/// assert!(config.is_overflow(120_000));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Compact automatically after a prompt loop. Pruning still runs when off.
    pub auto_compact: bool,

    /// Total context window of the model. `0` means unknown (never overflows).
    pub context_limit: u64,

    /// Separate input limit, for models that publish one.
    pub input_limit: Option<u64>,

    /// Maximum output tokens reserved for the response.
    pub output_limit: u64,

    /// Headroom kept below the input limit.
    pub buffer_tokens: u64,

    /// Clear old tool outputs before checking for overflow.
    pub prune: bool,

    /// Most recent tool-output tokens that are never pruned.
    pub prune_protect_tokens: u64,

    /// Pruning only happens when at least this many tokens would be freed.
    pub prune_minimum_tokens: u64,

    /// Messages kept verbatim by [`PlaceholderCompactor`](super::PlaceholderCompactor).
    pub retain_recent: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            auto_compact: true,
            context_limit: 200_000,
            input_limit: None,
            output_limit: 32_000,
            buffer_tokens: 20_000,
            prune: true,
            prune_protect_tokens: 40_000,
            prune_minimum_tokens: 20_000,
            retain_recent: 10,
        }
    }
}

impl CompactionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_context_limit(mut self, limit: u64) -> Self {
        self.context_limit = limit;
        self
    }

    #[must_use]
    pub const fn with_input_limit(mut self, limit: u64) -> Self {
        self.input_limit = Some(limit);
        self
    }

    #[must_use]
    pub const fn with_output_limit(mut self, limit: u64) -> Self {
        self.output_limit = limit;
        self
    }

    #[must_use]
    pub const fn with_buffer_tokens(mut self, tokens: u64) -> Self {
        self.buffer_tokens = tokens;
        self
    }

    #[must_use]
    pub const fn with_auto_compact(mut self, auto: bool) -> Self {
        self.auto_compact = auto;
        self
    }

    #[must_use]
    pub const fn with_prune(mut self, protect_tokens: u64, minimum_tokens: u64) -> Self {
        self.prune = true;
        self.prune_protect_tokens = protect_tokens;
        self.prune_minimum_tokens = minimum_tokens;
        self
    }

    #[must_use]
    pub const fn with_retain_recent(mut self, count: usize) -> Self {
        self.retain_recent = count;
        self
    }

    /// Tokens available for input before the history counts as overflowing.
    #[must_use]
    pub fn usable_tokens(&self) -> u64 {
        match self.input_limit {
            Some(input) => input.saturating_sub(self.buffer_tokens.min(self.output_limit)),
            None => self.context_limit.saturating_sub(self.output_limit),
        }
    }

    #[must_use]
    pub fn is_overflow(&self, tokens: u64) -> bool {
        if self.context_limit == 0 && self.input_limit.is_none() {
            return false;
        }
        tokens >= self.usable_tokens().max(1)
    }
}

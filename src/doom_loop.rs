//! Detection of repeated identical tool calls.
//!
//! The model sometimes gets stuck issuing the same call over and over. The
//! [`DoomLoopDetector`] keeps a bounded window of recent call signatures per
//! session and reports when one signature repeats `threshold` times in a row.

use crate::types::{DoomLoopConfig, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

/// A (tool name, normalized-input hash) pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DoomSignature {
    pub tool: String,
    pub input_hash: String,
}

impl DoomSignature {
    /// Build a signature. Object keys are sorted before hashing, so inputs
    /// that differ only in key order share a signature.
    #[must_use]
    pub fn new(tool: impl Into<String>, input: &Value) -> Self {
        let canonical = serde_json::to_string(&canonicalize(input)).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        Self {
            tool: tool.into(),
            input_hash: hex::encode(&digest[..8]),
        }
    }
}

/// Copy of `value` with every object's keys in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Default)]
struct SessionWindow {
    recent: VecDeque<DoomSignature>,
    streak: usize,
}

#[derive(Debug)]
pub struct DoomLoopDetector {
    config: DoomLoopConfig,
    sessions: Mutex<HashMap<SessionId, SessionWindow>>,
}

impl Default for DoomLoopDetector {
    fn default() -> Self {
        Self::new(DoomLoopConfig::default())
    }
}

impl DoomLoopDetector {
    #[must_use]
    pub fn new(config: DoomLoopConfig) -> Self {
        Self {
            config: DoomLoopConfig {
                window: config.window.max(1),
                threshold: config.threshold.max(1),
            },
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Record `signature` for the session and report whether it has now been
    /// seen `threshold` times consecutively.
    pub fn check(&self, session_id: &SessionId, signature: DoomSignature) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let window = sessions.entry(session_id.clone()).or_default();

        window.streak = match window.recent.back() {
            Some(last) if *last == signature => window.streak + 1,
            _ => 1,
        };

        window.recent.push_back(signature);
        while window.recent.len() > self.config.window {
            window.recent.pop_front();
        }

        let detected = window.streak >= self.config.threshold;
        if detected {
            log::warn!(
                "Doom loop detected (session_id={session_id}, streak={}, threshold={})",
                window.streak,
                self.config.threshold
            );
        }
        detected
    }

    /// Signatures currently retained for the session, oldest first.
    #[must_use]
    pub fn window(&self, session_id: &SessionId) -> Vec<DoomSignature> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(session_id)
            .map(|w| w.recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_session(&self, session_id: &SessionId) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }
}

//! Last-wins operation slots.
//!
//! Each operation kind (for example `"summarize"` or `"transcribe"`) owns at
//! most one live cancellation token. Starting a new operation of a kind
//! cancels the token of the one it supersedes, so the older call ends
//! cancelled rather than failed.

use parking_lot::Mutex;
use relay_core::CancellationToken;
use std::collections::HashMap;
use tracing::debug;

/// Reason given to a token replaced by a newer operation of the same kind
pub const SUPERSEDED_REASON: &str = "superseded by a newer request";

/// Per-kind registry of the current operation's token
#[derive(Debug, Default)]
pub struct OperationSlots {
    slots: Mutex<HashMap<String, CancellationToken>>,
}

impl OperationSlots {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an operation of `kind`, cancelling the previous one
    pub fn begin(&self, kind: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = self.slots.lock().insert(kind.to_string(), token.clone());

        if let Some(previous) = previous {
            if previous.cancel(SUPERSEDED_REASON) {
                debug!(kind, "Superseded in-flight operation");
            }
        }
        token
    }

    /// Release the slot if `token` still owns it
    ///
    /// Returns `false` when a newer operation has already taken the slot.
    pub fn finish(&self, kind: &str, token: &CancellationToken) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(kind) {
            Some(current) if current.ptr_eq(token) => {
                slots.remove(kind);
                true
            }
            _ => false,
        }
    }

    /// Cancel the operation of `kind`, if any
    pub fn cancel(&self, kind: &str, reason: &str) -> bool {
        let token = self.slots.lock().remove(kind);
        token.is_some_and(|t| t.cancel(reason))
    }

    /// Cancel every live operation
    pub fn cancel_all(&self, reason: &str) -> usize {
        let tokens: Vec<_> = self.slots.lock().drain().map(|(_, t)| t).collect();
        tokens.iter().filter(|t| t.cancel(reason)).count()
    }

    /// Token of the current operation of `kind`
    #[must_use]
    pub fn current(&self, kind: &str) -> Option<CancellationToken> {
        self.slots.lock().get(kind).cloned()
    }

    /// Number of occupied slots
    #[must_use]
    pub fn active(&self) -> usize {
        self.slots.lock().len()
    }
}

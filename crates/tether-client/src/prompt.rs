//! Prompt coordination between a session and the interactive layer.
//!
//! A session asks a question (password, host-key confirmation), the UI
//! observes the published question through a watch channel and answers
//! it asynchronously. The asking task awaits the answer without tying up
//! a thread, and a disconnect can cancel the wait.

use std::sync::Mutex;
use tether_core::{TetherError, TetherResult};
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// What kind of answer a prompt expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// Yes/no confirmation.
    Boolean,
    /// Free text, echoed.
    Text,
    /// Free text, hidden (passwords, passphrases).
    Secret,
}

/// A question currently awaiting an answer from the user.
#[derive(Debug, Clone)]
pub struct Prompt {
    /// Longer explanation shown above the input, if any.
    pub instructions: Option<String>,
    /// Short label for the input itself.
    pub hint: String,
    pub kind: PromptKind,
}

/// An answer delivered by the interactive layer.
#[derive(Debug, Clone)]
pub enum PromptAnswer {
    Bool(bool),
    Text(String),
}

/// Relays questions from session logic to the UI and answers back.
///
/// At most one question may be outstanding at a time; a second `request`
/// before the first resolves is a programming error and fails with
/// `PromptBusy`.
pub struct PromptCoordinator {
    current_tx: watch::Sender<Option<Prompt>>,
    pending: Mutex<Option<oneshot::Sender<PromptAnswer>>>,
}

impl Default for PromptCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptCoordinator {
    pub fn new() -> Self {
        let (current_tx, _) = watch::channel(None);
        Self {
            current_tx,
            pending: Mutex::new(None),
        }
    }

    /// Observe the currently published question. `None` whenever no
    /// prompt is outstanding.
    pub fn watch_current(&self) -> watch::Receiver<Option<Prompt>> {
        self.current_tx.subscribe()
    }

    /// Ask a yes/no question and await the answer.
    pub async fn request_bool(
        &self,
        instructions: Option<&str>,
        hint: &str,
    ) -> TetherResult<bool> {
        match self.request(instructions, hint, PromptKind::Boolean).await? {
            PromptAnswer::Bool(b) => Ok(b),
            PromptAnswer::Text(_) => Err(TetherError::Other(
                "expected a boolean prompt answer".into(),
            )),
        }
    }

    /// Ask for a line of text and await the answer.
    pub async fn request_string(
        &self,
        instructions: Option<&str>,
        hint: &str,
    ) -> TetherResult<String> {
        match self.request(instructions, hint, PromptKind::Text).await? {
            PromptAnswer::Text(s) => Ok(s),
            PromptAnswer::Bool(_) => Err(TetherError::Other(
                "expected a text prompt answer".into(),
            )),
        }
    }

    /// Ask for hidden text (a password or passphrase) and await the answer.
    pub async fn request_secret(
        &self,
        instructions: Option<&str>,
        hint: &str,
    ) -> TetherResult<String> {
        match self.request(instructions, hint, PromptKind::Secret).await? {
            PromptAnswer::Text(s) => Ok(s),
            PromptAnswer::Bool(_) => Err(TetherError::Other(
                "expected a text prompt answer".into(),
            )),
        }
    }

    async fn request(
        &self,
        instructions: Option<&str>,
        hint: &str,
        kind: PromptKind,
    ) -> TetherResult<PromptAnswer> {
        let rx = {
            let mut pending = self.pending.lock().expect("prompt slot poisoned");
            if pending.is_some() {
                return Err(TetherError::PromptBusy);
            }
            let (tx, rx) = oneshot::channel();
            *pending = Some(tx);
            rx
        };

        self.current_tx.send_replace(Some(Prompt {
            instructions: instructions.map(str::to_string),
            hint: hint.to_string(),
            kind,
        }));
        debug!(hint, ?kind, "prompt published");

        // A dropped sender means the prompt was cancelled.
        let result = rx.await.map_err(|_| TetherError::PromptCancelled);

        // Clear the published question so the UI never re-renders a
        // stale prompt.
        self.current_tx.send_replace(None);
        self.pending.lock().expect("prompt slot poisoned").take();

        result
    }

    /// Deliver the user's answer to the outstanding prompt. Returns
    /// false if nothing was waiting.
    pub fn respond(&self, answer: PromptAnswer) -> bool {
        let tx = self.pending.lock().expect("prompt slot poisoned").take();
        match tx {
            Some(tx) => tx.send(answer).is_ok(),
            None => false,
        }
    }

    /// Cancel the outstanding prompt, if any. The waiting request
    /// resolves with `PromptCancelled` and the published question is
    /// cleared.
    pub fn cancel(&self) {
        let tx = self.pending.lock().expect("prompt slot poisoned").take();
        if let Some(tx) = tx {
            drop(tx);
            debug!("outstanding prompt cancelled");
        }
        self.current_tx.send_replace(None);
    }

    /// Whether a question is currently outstanding.
    pub fn is_pending(&self) -> bool {
        self.pending.lock().expect("prompt slot poisoned").is_some()
    }
}

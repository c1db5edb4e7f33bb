//! User-facing progress sink

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

/// Output capability of the host tool driving the provisioning run
pub trait Ui: Send + Sync {
    /// Headline progress message
    fn say(&self, message: &str);

    /// Detail line, typically relayed command output
    fn message(&self, message: &str);

    /// Error surfaced to the operator
    fn error(&self, message: &str);

    /// Prompt the operator for a line of input
    fn ask(&self, query: &str) -> io::Result<String>;

    /// Machine-readable event
    fn machine(&self, kind: &str, args: &[&str]);
}

/// A [`Ui`] that admits at most one caller at a time.
///
/// Cloning shares the same gate, so every channel handler holding a clone
/// is serialized against every other.
#[derive(Clone)]
pub struct SerializedUi {
    inner: Arc<dyn Ui>,
    gate: Arc<Mutex<()>>,
}

impl SerializedUi {
    pub fn new(inner: Arc<dyn Ui>) -> Self {
        Self {
            inner,
            gate: Arc::new(Mutex::new(())),
        }
    }

    fn with_gate<T>(&self, f: impl FnOnce(&dyn Ui) -> T) -> T {
        // A panic inside another caller must not silence the UI
        let _guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        f(self.inner.as_ref())
    }
}

impl std::fmt::Debug for SerializedUi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializedUi").finish_non_exhaustive()
    }
}

impl Ui for SerializedUi {
    fn say(&self, message: &str) {
        self.with_gate(|ui| ui.say(message))
    }

    fn message(&self, message: &str) {
        self.with_gate(|ui| ui.message(message))
    }

    fn error(&self, message: &str) {
        self.with_gate(|ui| ui.error(message))
    }

    fn ask(&self, query: &str) -> io::Result<String> {
        self.with_gate(|ui| ui.ask(query))
    }

    fn machine(&self, kind: &str, args: &[&str]) {
        self.with_gate(|ui| ui.machine(kind, args))
    }
}

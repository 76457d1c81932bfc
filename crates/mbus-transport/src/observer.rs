//! Per-event observer lists
//!
//! Each event category carries its own ordered list of closures.
//! Observers are invoked in registration order and removed by the
//! identity handed out at registration time.

/// Identity of a registered observer
pub type ObserverId = u64;

/// The event categories a transport emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NewEntity,
    LostEntity,
    IncomingMessage,
    TransportError,
}

pub(crate) struct Observers<T: ?Sized> {
    entries: Vec<(ObserverId, Box<dyn Fn(&T) + Send + Sync>)>,
}

impl<T: ?Sized> Observers<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, id: ObserverId, callback: Box<dyn Fn(&T) + Send + Sync>) {
        self.entries.push((id, callback));
    }

    pub fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    pub fn emit(&self, value: &T) {
        for (_, callback) in &self.entries {
            callback(value);
        }
    }
}

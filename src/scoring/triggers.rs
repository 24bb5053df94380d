use crate::errors::AppResult;
use rusqlite::Connection;
use std::sync::Arc;

/// A write that invalidates the aggregate of one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationEvent {
    DimensionsImported(String),
    AdjustmentChanged(String),
}

impl MutationEvent {
    pub fn branch_code(&self) -> &str {
        match self {
            Self::DimensionsImported(code) | Self::AdjustmentChanged(code) => code,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::DimensionsImported(_) => "dimensions_imported",
            Self::AdjustmentChanged(_) => "adjustment_changed",
        }
    }
}

/// Observers run on the connection (or open transaction) that made the write.
pub trait MutationObserver: Send + Sync {
    fn on_mutation(&self, conn: &Connection, event: &MutationEvent) -> AppResult<()>;
}

#[derive(Clone, Default)]
pub struct Triggers {
    observers: Vec<Arc<dyn MutationObserver>>,
}

impl Triggers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Arc<dyn MutationObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Stops at the first failing observer.
    pub fn emit(&self, conn: &Connection, event: &MutationEvent) -> AppResult<()> {
        tracing::debug!(event = event.kind(), branch = event.branch_code(), "mutation event");
        for observer in &self.observers {
            observer.on_mutation(conn, event)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Triggers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Triggers").field("observers", &self.observers.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{MutationEvent, MutationObserver, Triggers};
    use crate::errors::AppResult;
    use rusqlite::Connection;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<MutationEvent>>,
    }

    impl MutationObserver for Recorder {
        fn on_mutation(&self, _conn: &Connection, event: &MutationEvent) -> AppResult<()> {
            self.seen.lock().expect("lock").push(event.clone());
            Ok(())
        }
    }

    #[test]
    fn emit_reaches_every_observer_in_order() {
        let conn = Connection::open_in_memory().expect("conn");
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let mut triggers = Triggers::new();
        triggers.register(first.clone());
        triggers.register(second.clone());

        triggers
            .emit(&conn, &MutationEvent::AdjustmentChanged("B-1".to_string()))
            .expect("emit");
        triggers
            .emit(&conn, &MutationEvent::DimensionsImported("B-2".to_string()))
            .expect("emit");

        let seen = first.seen.lock().expect("lock");
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].branch_code(), "B-2");
        assert_eq!(second.seen.lock().expect("lock").len(), 2);
    }
}

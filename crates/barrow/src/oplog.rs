//! Operator log.
//!
//! Messages meant for whoever runs barrow go through an [`OpLog`]: they are
//! emitted as `tracing` events and handed to every registered observer. The
//! journal registers one while it is open for writing so warnings and errors
//! end up in the run's record.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

/// Severity of an operator message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

impl MessageLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageLevel::Info => "info",
            MessageLevel::Warning => "warning",
            MessageLevel::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "info" => Some(MessageLevel::Info),
            "warning" => Some(MessageLevel::Warning),
            "error" => Some(MessageLevel::Error),
            _ => None,
        }
    }
}

impl fmt::Display for MessageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives every message sent through an [`OpLog`].
pub trait LogObserver: Send + Sync {
    fn notify(&self, level: MessageLevel, message: &str);
}

/// Handle returned by [`OpLog::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    observers: Mutex<Vec<(u64, Arc<dyn LogObserver>)>>,
}

/// Cheaply cloneable operator log; clones share observers.
#[derive(Clone, Default)]
pub struct OpLog {
    inner: Arc<Inner>,
}

impl fmt::Debug for OpLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpLog")
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl OpLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn LogObserver>) -> ObserverId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, observer));
        ObserverId(id)
    }

    /// Remove an observer. Unknown ids are ignored.
    pub fn unregister(&self, id: ObserverId) {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(oid, _)| *oid != id.0);
    }

    pub fn observer_count(&self) -> usize {
        self.inner
            .observers
            .lock()
            .map(|o| o.len())
            .unwrap_or_else(|e| e.into_inner().len())
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.emit(MessageLevel::Info, message.as_ref());
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.emit(MessageLevel::Warning, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.emit(MessageLevel::Error, message.as_ref());
    }

    pub fn emit(&self, level: MessageLevel, message: &str) {
        match level {
            MessageLevel::Info => info!("{message}"),
            MessageLevel::Warning => warn!("{message}"),
            MessageLevel::Error => error!("{message}"),
        }

        // Snapshot so an observer may log without deadlocking.
        let observers: Vec<Arc<dyn LogObserver>> = self
            .inner
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();
        for observer in observers {
            observer.notify(level, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<(MessageLevel, String)>>);

    impl LogObserver for Collect {
        fn notify(&self, level: MessageLevel, message: &str) {
            self.0.lock().unwrap().push((level, message.to_string()));
        }
    }

    #[test]
    fn test_observers_receive_messages() {
        let log = OpLog::new();
        let seen = Arc::new(Collect::default());
        let id = log.register(seen.clone());

        log.warning("disk is slow");
        log.clone().error("disk is gone");
        log.unregister(id);
        log.info("after unregister");

        let seen = seen.0.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (MessageLevel::Warning, "disk is slow".to_string()),
                (MessageLevel::Error, "disk is gone".to_string()),
            ]
        );
        assert_eq!(log.observer_count(), 0);
    }

    #[test]
    fn test_level_names() {
        for level in [MessageLevel::Info, MessageLevel::Warning, MessageLevel::Error] {
            assert_eq!(MessageLevel::from_str(level.as_str()), Some(level));
        }
        assert_eq!(MessageLevel::from_str("fatal"), None);
    }
}

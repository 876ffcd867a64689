//! Bootstrap progress events.
//!
//! The coordinator reports through an injected [`ProgressSink`] rather than
//! a global logger, so monitors and tests can watch progress directly.

use std::sync::{Mutex, PoisonError};

use realmcache_core::RealmId;

/// One step of a bootstrap run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Started {
        realm: RealmId,
        resumed: bool,
        segment_count: usize,
        finished: usize,
    },
    WindowCompleted {
        realm: RealmId,
        indicator: u64,
        finished: usize,
        total: usize,
    },
    Finished {
        realm: RealmId,
        users_loaded: usize,
    },
    Failed {
        realm: RealmId,
        reason: String,
    },
}

impl ProgressEvent {
    pub fn realm(&self) -> &RealmId {
        match self {
            ProgressEvent::Started { realm, .. }
            | ProgressEvent::WindowCompleted { realm, .. }
            | ProgressEvent::Finished { realm, .. }
            | ProgressEvent::Failed { realm, .. } => realm,
        }
    }
}

/// Receives bootstrap progress.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Sink writing each event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn emit(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started {
                realm,
                resumed,
                segment_count,
                finished,
            } => tracing::info!(
                realm = %realm,
                resumed,
                segment_count,
                finished,
                "Bootstrap started"
            ),
            ProgressEvent::WindowCompleted {
                realm,
                indicator,
                finished,
                total,
            } => tracing::debug!(
                realm = %realm,
                indicator,
                finished,
                total,
                "Bootstrap window completed"
            ),
            ProgressEvent::Finished { realm, users_loaded } => {
                tracing::info!(realm = %realm, users_loaded, "Bootstrap finished")
            }
            ProgressEvent::Failed { realm, reason } => {
                tracing::error!(realm = %realm, reason = %reason, "Bootstrap failed")
            }
        }
    }
}

/// Sink keeping every event in memory.
#[derive(Debug, Default)]
pub struct RecordingProgressSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Indicators published after each persisted window, in order.
    pub fn indicators(&self) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::WindowCompleted { indicator, .. } => Some(indicator),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for RecordingProgressSink {
    fn emit(&self, event: ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingProgressSink::new();
        let realm = RealmId::new("r");
        sink.emit(ProgressEvent::WindowCompleted {
            realm: realm.clone(),
            indicator: 7,
            finished: 1,
            total: 2,
        });
        sink.emit(ProgressEvent::WindowCompleted {
            realm: realm.clone(),
            indicator: 9,
            finished: 2,
            total: 2,
        });
        sink.emit(ProgressEvent::Finished {
            realm: realm.clone(),
            users_loaded: 0,
        });

        assert_eq!(sink.indicators(), vec![7, 9]);
        assert_eq!(sink.events().len(), 3);
        assert!(sink.events().iter().all(|e| e.realm() == &realm));
    }
}

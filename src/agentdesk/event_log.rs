//! Thread-safe, append-only store for office events.
//!
//! Readers always receive snapshots; a reader can never observe a partial
//! write, and logging never blocks readers beyond the short copy under the
//! lock.

use std::sync::Mutex;

use crate::agentdesk::event::{OfficeEvent, OfficeEventType};

/// Append-only event log with typed filters.
#[derive(Default)]
pub struct EventLog {
    entries: Mutex<Vec<OfficeEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, event: OfficeEvent) {
        self.entries.lock().expect("event log poisoned").push(event);
    }

    /// Snapshot of every event in append order.
    pub fn get_all(&self) -> Vec<OfficeEvent> {
        self.entries.lock().expect("event log poisoned").clone()
    }

    /// Snapshot of the events stamped with the given iteration.
    pub fn get_by_iteration(&self, iteration: u64) -> Vec<OfficeEvent> {
        self.entries
            .lock()
            .expect("event log poisoned")
            .iter()
            .filter(|e| e.iteration == iteration)
            .cloned()
            .collect()
    }

    /// Snapshot of the events of one kind.
    pub fn get_by_type(&self, event_type: OfficeEventType) -> Vec<OfficeEvent> {
        self.entries
            .lock()
            .expect("event log poisoned")
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// The scheduling trail: dispatches plus decision commentary, in order.
    pub fn get_scheduling_log(&self) -> Vec<OfficeEvent> {
        self.entries
            .lock()
            .expect("event log poisoned")
            .iter()
            .filter(|e| {
                matches!(
                    e.event_type(),
                    OfficeEventType::SchedulingDispatched | OfficeEventType::SchedulingDecision
                )
            })
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().expect("event log poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("event log poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentdesk::event::OfficeEventKind;
    use chrono::Utc;

    fn event(iteration: u64, kind: OfficeEventKind) -> OfficeEvent {
        OfficeEvent { timestamp: Utc::now(), iteration, kind }
    }

    #[test]
    fn filters_by_iteration_and_type() {
        let log = EventLog::new();
        log.append(event(1, OfficeEventKind::Commentary { text: "a".into() }));
        log.append(event(1, OfficeEventKind::SchedulingDecision { detail: "d".into() }));
        log.append(event(2, OfficeEventKind::Commentary { text: "b".into() }));

        assert_eq!(log.get_all().len(), 3);
        assert_eq!(log.get_by_iteration(1).len(), 2);
        assert_eq!(log.get_by_type(OfficeEventType::Commentary).len(), 2);
        assert_eq!(log.get_scheduling_log().len(), 1);

        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn snapshots_are_copies() {
        let log = EventLog::new();
        log.append(event(1, OfficeEventKind::Commentary { text: "a".into() }));
        let snapshot = log.get_all();
        log.append(event(1, OfficeEventKind::Commentary { text: "b".into() }));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(log.len(), 2);
    }
}

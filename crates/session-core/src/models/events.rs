//! Per-entity event history.

use std::collections::VecDeque;
use std::sync::Arc;

use switchgen_esl_core::Event;

const DEFAULT_CAPACITY: usize = 1000;

/// Bounded, newest-first collection of the events seen for one entity.
///
/// Header lookups scan from the most recent event backwards so a value
/// always reflects the latest state the server reported.
#[derive(Debug, Default, Clone)]
pub struct EventHistory {
    events: VecDeque<Arc<Event>>,
    capacity: usize,
}

impl EventHistory {
    pub fn new(event: Arc<Event>) -> EventHistory {
        let mut history = EventHistory {
            events: VecDeque::new(),
            capacity: DEFAULT_CAPACITY,
        };
        history.update(event);
        history
    }

    /// Prepend a newly received event.
    pub fn update(&mut self, event: Arc<Event>) {
        if self.capacity == 0 {
            self.capacity = DEFAULT_CAPACITY;
        }
        if self.events.len() == self.capacity {
            self.events.pop_back();
        }
        self.events.push_front(event);
    }

    /// Newest-first header lookup across the whole history.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.events.iter().find_map(|event| event.get(key))
    }

    /// The most recently received event.
    pub fn latest(&self) -> Option<&Arc<Event>> {
        self.events.front()
    }

    /// Event by age, `0` being the newest.
    pub fn nth(&self, index: usize) -> Option<&Arc<Event>> {
        self.events.get(index)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Iterate newest-first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Event>> {
        self.events.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_prefers_newest_event() {
        let mut first = Event::with_name("CHANNEL_CREATE");
        first.insert("Channel-State", "CS_NEW");
        let mut history = EventHistory::new(Arc::new(first));

        let mut second = Event::with_name("CHANNEL_ANSWER");
        second.insert("Channel-State", "CS_EXCHANGE_MEDIA");
        history.update(Arc::new(second));

        assert_eq!(history.get("Channel-State"), Some("CS_EXCHANGE_MEDIA"));
        assert_eq!(history.latest().unwrap().event_name(), Some("CHANNEL_ANSWER"));
        assert_eq!(history.nth(1).unwrap().event_name(), Some("CHANNEL_CREATE"));
    }

    #[test]
    fn falls_back_to_older_events_for_missing_headers() {
        let mut first = Event::with_name("CHANNEL_CREATE");
        first.insert("Call-Direction", "outbound");
        let mut history = EventHistory::new(Arc::new(first));
        history.update(Arc::new(Event::with_name("CALL_UPDATE")));

        assert_eq!(history.get("Call-Direction"), Some("outbound"));
    }
}

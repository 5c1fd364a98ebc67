use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::events::CirculationEvent;
use crate::ports::analytics::AnalyticsSink;

/// Mock implementation of AnalyticsSink.
///
/// Keeps track of how many times it's called and records every event so
/// tests can assert on emission counts, ordering and attribution.
#[derive(Default)]
pub struct MockAnalyticsSink {
    events: Mutex<Vec<CirculationEvent>>,
}

impl MockAnalyticsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn events(&self) -> Vec<CirculationEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn last_event(&self) -> Option<CirculationEvent> {
        self.events.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl AnalyticsSink for MockAnalyticsSink {
    async fn collect_event(&self, event: CirculationEvent) {
        self.events.lock().unwrap().push(event);
    }
}

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use super::{Event, EventSink};

/// In-memory sink for tests: lets a test assert on emitted events instead of
/// parsing log text (SPEC_FULL §6 ambient logging).
#[derive(Default)]
pub struct TestEventSink {
    events: Mutex<Vec<Event>>,
}

impl TestEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("test sink lock poisoned").clone()
    }
}

impl EventSink for TestEventSink {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.events.lock().expect("test sink lock poisoned").push(event.clone());
        })
    }
}

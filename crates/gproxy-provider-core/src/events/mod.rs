mod hub;
mod terminal_sink;
mod test_sink;
mod types;

pub use hub::{EventHub, EventSink};
pub use terminal_sink::TerminalEventSink;
pub use test_sink::TestEventSink;
pub use types::Event;

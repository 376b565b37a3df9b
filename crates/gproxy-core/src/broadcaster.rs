//! Streaming broadcaster (C6): fans one upstream SSE stream out to the
//! original subscriber plus any duplicate requests that join mid-flight.

use std::sync::Mutex;

use bytes::Bytes;
use gproxy_protocol::anthropic::{
    ContentBlock, ContentDelta, CreateMessageResponse, ErrorBody, ErrorKind, MessageDeltaPayload, MessageRole,
    MessageStartPayload, Model, StopReason, StreamEvent, Usage,
};
use tokio::sync::mpsc;

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcasterState {
    Streaming,
    ClosedOk,
    ClosedErr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberKind {
    Primary,
    Duplicate,
}

struct SubscriberEntry {
    #[allow(dead_code)]
    id: u64,
    #[allow(dead_code)]
    kind: SubscriberKind,
    tx: mpsc::Sender<Bytes>,
}

struct Inner {
    history: Vec<StreamEvent>,
    state: BroadcasterState,
    subscribers: Vec<SubscriberEntry>,
    next_subscriber_id: u64,
    closed_at: u64,
}

pub struct Broadcaster {
    pub fingerprint: String,
    pub provider_name: String,
    inner: Mutex<Inner>,
}

impl Broadcaster {
    pub fn new(fingerprint: String, provider_name: String) -> Self {
        Self {
            fingerprint,
            provider_name,
            inner: Mutex::new(Inner {
                history: Vec::new(),
                state: BroadcasterState::Streaming,
                subscribers: Vec::new(),
                next_subscriber_id: 0,
                closed_at: 0,
            }),
        }
    }

    /// Subscribes a new consumer. If the broadcaster already has history, the
    /// new subscriber is caught up synchronously (under the same lock that
    /// serializes against concurrent appends) before being registered for
    /// live chunks — no subscriber ever observes history out of order or a
    /// gap between replay and live delivery.
    pub fn subscribe(&self, kind: SubscriberKind) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut inner = self.inner.lock().expect("broadcaster lock poisoned");
        for event in &inner.history {
            let _ = tx.try_send(Bytes::from(event.to_sse_frame()));
        }
        if inner.state == BroadcasterState::Streaming {
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            inner.subscribers.push(SubscriberEntry { id, kind, tx });
        }
        // If already closed, `tx` is dropped here: the receiver drains the
        // replayed history then observes channel closure, ending the stream.
        rx
    }

    /// Appends one event to history and fans it out. A subscriber whose
    /// channel is full or closed is dropped — it does not block the producer.
    pub fn push(&self, event: StreamEvent) {
        let frame = Bytes::from(event.to_sse_frame());
        let mut inner = self.inner.lock().expect("broadcaster lock poisoned");
        inner.history.push(event);
        inner.subscribers.retain(|sub| sub.tx.try_send(frame.clone()).is_ok());
    }

    /// Appends the well-formed error-termination sequence used when the
    /// upstream connection fails after headers/bytes have already reached at
    /// least one subscriber (§4.6): a text delta carrying a human-readable
    /// message, the block close, a `message_delta` with `stop_reason=error`,
    /// a typed `error` frame (§6: "may be emitted before `message_stop`"),
    /// then `message_stop`.
    pub fn push_error_sequence(&self, open_block_index: u32, message: &str) {
        self.push(StreamEvent::ContentBlockDelta {
            index: open_block_index,
            delta: ContentDelta::TextDelta { text: format!("\n\n[upstream error: {message}]") },
        });
        self.push(StreamEvent::ContentBlockStop { index: open_block_index });
        self.push(StreamEvent::MessageDelta {
            delta: MessageDeltaPayload { stop_reason: Some(StopReason::Error), stop_sequence: None },
            usage: Usage::default(),
        });
        self.push(StreamEvent::Error {
            error: ErrorBody {
                kind: ErrorKind::ApiError,
                message: message.to_string(),
                provider: Some(self.provider_name.clone()),
                provider_message: None,
                provider_code: None,
            },
        });
        self.push(StreamEvent::MessageStop);
    }

    pub fn finish(&self, ok: bool, now: u64) {
        let mut inner = self.inner.lock().expect("broadcaster lock poisoned");
        inner.state = if ok { BroadcasterState::ClosedOk } else { BroadcasterState::ClosedErr };
        inner.closed_at = now;
        // Dropping the senders closes every live subscriber's channel once
        // its buffered frames (already `try_send`-ed) have drained.
        inner.subscribers.clear();
    }

    pub fn state(&self) -> BroadcasterState {
        self.inner.lock().expect("broadcaster lock poisoned").state
    }

    pub fn closed_at(&self) -> u64 {
        self.inner.lock().expect("broadcaster lock poisoned").closed_at
    }

    pub fn alive_subscriber_count(&self) -> usize {
        self.inner.lock().expect("broadcaster lock poisoned").subscribers.len()
    }

    pub fn history_snapshot(&self) -> Vec<StreamEvent> {
        self.inner.lock().expect("broadcaster lock poisoned").history.clone()
    }
}

/// SSE→JSON reassembly (§4.6): walks a finished broadcaster's history and
/// produces the equivalent non-streaming Anthropic response. Unknown event
/// types (a stray `ping`, a not-yet-supported delta kind) are ignored rather
/// than treated as errors — matching the upstream's own tolerance for
/// speculative future event types.
pub fn reassemble_json(history: &[StreamEvent], fallback_id: &str) -> CreateMessageResponse {
    let mut message_id = fallback_id.to_string();
    let mut model = Model(String::new());
    let mut content: Vec<ContentBlock> = Vec::new();
    let mut stop_reason = None;
    let mut usage = Usage::default();

    for event in history {
        match event {
            StreamEvent::MessageStart { message } => {
                message_id = message.id.clone();
                model = message.model.clone();
                usage = message.usage;
            }
            StreamEvent::ContentBlockStart { index, content_block } => {
                let index = *index as usize;
                while content.len() <= index {
                    content.push(ContentBlock::Text { text: String::new(), citations: None });
                }
                content[index] = content_block.clone();
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let index = *index as usize;
                if let (ContentDelta::TextDelta { text }, Some(ContentBlock::Text { text: existing, .. })) =
                    (delta, content.get_mut(index))
                {
                    existing.push_str(text);
                }
            }
            StreamEvent::MessageDelta { delta, usage: delta_usage } => {
                if delta.stop_reason.is_some() {
                    stop_reason = delta.stop_reason;
                }
                usage = *delta_usage;
            }
            StreamEvent::MessageStop | StreamEvent::Ping | StreamEvent::ContentBlockStop { .. } | StreamEvent::Error { .. } => {}
        }
    }

    CreateMessageResponse::new(message_id, model, content, stop_reason, usage)
}

/// JSON→SSE synthesis (§4.6): re-emits a buffered JSON result as the minimal
/// event sequence a streaming waiter expects.
pub fn synthesize_stream(response: &CreateMessageResponse) -> Vec<StreamEvent> {
    let mut events = Vec::with_capacity(response.content.len() * 3 + 2);
    events.push(StreamEvent::MessageStart {
        message: MessageStartPayload {
            id: response.id.clone(),
            kind: response.kind.clone(),
            role: MessageRole::Assistant,
            content: Vec::new(),
            model: response.model.clone(),
            stop_reason: None,
            stop_sequence: None,
            usage: Usage::default(),
        },
    });

    for (index, block) in response.content.iter().enumerate() {
        let index = index as u32;
        events.push(StreamEvent::ContentBlockStart { index, content_block: block.clone() });
        if let ContentBlock::Text { text, .. } = block {
            events.push(StreamEvent::ContentBlockDelta { index, delta: ContentDelta::TextDelta { text: text.clone() } });
        }
        events.push(StreamEvent::ContentBlockStop { index });
    }

    events.push(StreamEvent::MessageDelta {
        delta: MessageDeltaPayload { stop_reason: response.stop_reason, stop_sequence: response.stop_sequence.clone() },
        usage: response.usage,
    });
    events.push(StreamEvent::MessageStop);
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_protocol::anthropic::StopReason;

    fn text_message_start(id: &str) -> StreamEvent {
        StreamEvent::MessageStart {
            message: MessageStartPayload {
                id: id.to_string(),
                kind: "message".to_string(),
                role: MessageRole::Assistant,
                content: Vec::new(),
                model: Model("claude-3-5-sonnet".to_string()),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            },
        }
    }

    #[test]
    fn late_subscriber_replays_full_history_then_live_chunks() {
        let broadcaster = Broadcaster::new("fp".to_string(), "p1".to_string());
        broadcaster.push(text_message_start("msg_1"));
        broadcaster.push(StreamEvent::ContentBlockStart { index: 0, content_block: ContentBlock::Text { text: String::new(), citations: None } });
        broadcaster.push(StreamEvent::ContentBlockDelta { index: 0, delta: ContentDelta::TextDelta { text: "Hel".to_string() } });

        let mut rx = broadcaster.subscribe(SubscriberKind::Duplicate);
        broadcaster.push(StreamEvent::ContentBlockDelta { index: 0, delta: ContentDelta::TextDelta { text: "lo".to_string() } });
        broadcaster.finish(true, 100);

        let mut received = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            received.push(frame);
        }
        assert_eq!(received.len(), 4);
        assert!(String::from_utf8_lossy(&received[0]).contains("message_start"));
        assert!(String::from_utf8_lossy(&received[2]).contains("\"text\":\"lo\""));
    }

    #[test]
    fn dead_subscriber_does_not_block_producer() {
        let broadcaster = Broadcaster::new("fp".to_string(), "p1".to_string());
        let rx = broadcaster.subscribe(SubscriberKind::Primary);
        drop(rx);
        broadcaster.push(text_message_start("msg_1"));
        assert_eq!(broadcaster.alive_subscriber_count(), 0);
    }

    #[test]
    fn reassemble_json_accumulates_text_and_stop_reason() {
        let history = vec![
            text_message_start("msg_1"),
            StreamEvent::ContentBlockStart { index: 0, content_block: ContentBlock::Text { text: String::new(), citations: None } },
            StreamEvent::ContentBlockDelta { index: 0, delta: ContentDelta::TextDelta { text: "Hel".to_string() } },
            StreamEvent::ContentBlockDelta { index: 0, delta: ContentDelta::TextDelta { text: "lo".to_string() } },
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageDelta { delta: MessageDeltaPayload { stop_reason: Some(StopReason::EndTurn), stop_sequence: None }, usage: Usage { input_tokens: 5, output_tokens: 2 } },
            StreamEvent::MessageStop,
        ];
        let response = reassemble_json(&history, "fallback");
        assert_eq!(response.id, "msg_1");
        assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(response.usage.output_tokens, 2);
        match &response.content[0] {
            ContentBlock::Text { text, .. } => assert_eq!(text, "Hello"),
            other => panic!("expected text block, got {other:?}"),
        }
    }

    #[test]
    fn synthesize_then_reassemble_round_trips_text() {
        let response = CreateMessageResponse::new(
            "msg_2".to_string(),
            Model("claude-3-5-sonnet".to_string()),
            vec![ContentBlock::Text { text: "hi there".to_string(), citations: None }],
            Some(StopReason::EndTurn),
            Usage { input_tokens: 1, output_tokens: 3 },
        );
        let events = synthesize_stream(&response);
        let rebuilt = reassemble_json(&events, "fallback");
        assert_eq!(rebuilt.content, response.content);
        assert_eq!(rebuilt.stop_reason, response.stop_reason);
    }
}

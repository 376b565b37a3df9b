use gproxy_protocol::anthropic::{
    ContentBlock, ContentDelta, MessageDeltaPayload, MessageStartPayload, Model as ClaudeModel, MessageRole,
    StopReason, StreamEvent, Usage as ClaudeUsage,
};
use gproxy_protocol::openai::{ChatCompletionChunk, FinishReason};

/// Converts a stream of OpenAI chat-completion chunks into the Anthropic SSE
/// event grammar (§6), one chunk at a time. An OpenAI provider never emits its
/// own `message_start`/`content_block_start` framing, so this state machine
/// synthesizes it: the first chunk opens the message and a text content
/// block; each subsequent text delta extends it; a `finish_reason` closes the
/// block and the message.
pub struct OpenAiToClaudeStreamState {
    message_id: Option<String>,
    model: ClaudeModel,
    started: bool,
    text_block_open: bool,
    finished: bool,
}

impl OpenAiToClaudeStreamState {
    pub fn new(message_id: String) -> Self {
        Self {
            message_id: Some(message_id),
            model: ClaudeModel(String::new()),
            started: false,
            text_block_open: false,
            finished: false,
        }
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn push_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.model = ClaudeModel(chunk.model.clone());

        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                message: MessageStartPayload {
                    id: self.message_id.take().unwrap_or_default(),
                    kind: "message".to_string(),
                    role: MessageRole::Assistant,
                    content: Vec::new(),
                    model: self.model.clone(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: ClaudeUsage::default(),
                },
            });
        }

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        if let Some(text) = &choice.delta.content
            && !text.is_empty()
        {
            if !self.text_block_open {
                self.text_block_open = true;
                events.push(StreamEvent::ContentBlockStart {
                    index: 0,
                    content_block: ContentBlock::Text { text: String::new(), citations: None },
                });
            }
            events.push(StreamEvent::ContentBlockDelta {
                index: 0,
                delta: ContentDelta::TextDelta { text: text.clone() },
            });
        }

        if let Some(finish_reason) = choice.finish_reason {
            if self.text_block_open {
                events.push(StreamEvent::ContentBlockStop { index: 0 });
                self.text_block_open = false;
            }
            events.push(StreamEvent::MessageDelta {
                delta: MessageDeltaPayload {
                    stop_reason: Some(map_finish_reason(finish_reason)),
                    stop_sequence: None,
                },
                usage: ClaudeUsage::default(),
            });
            events.push(StreamEvent::MessageStop);
            self.finished = true;
        }

        events
    }
}

fn map_finish_reason(reason: FinishReason) -> StopReason {
    match reason {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::ToolCalls => StopReason::ToolUse,
        FinishReason::ContentFilter => StopReason::StopSequence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_protocol::openai::{ChunkChoice, ChunkDelta};

    fn chunk(text: Option<&str>, finish: Option<FinishReason>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: "chatcmpl-1".to_string(),
            model: "gpt-4o".to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta { content: text.map(str::to_string), tool_calls: None },
                finish_reason: finish,
            }],
        }
    }

    #[test]
    fn first_chunk_opens_message_and_block() {
        let mut state = OpenAiToClaudeStreamState::new("msg_1".to_string());
        let events = state.push_chunk(&chunk(Some("Hel"), None));
        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        assert!(matches!(events[1], StreamEvent::ContentBlockStart { .. }));
        assert!(matches!(events[2], StreamEvent::ContentBlockDelta { .. }));
    }

    #[test]
    fn finish_reason_closes_block_and_message() {
        let mut state = OpenAiToClaudeStreamState::new("msg_1".to_string());
        state.push_chunk(&chunk(Some("Hi"), None));
        let events = state.push_chunk(&chunk(None, Some(FinishReason::Stop)));
        assert!(matches!(events[0], StreamEvent::ContentBlockStop { .. }));
        assert!(matches!(events[1], StreamEvent::MessageDelta { .. }));
        assert!(matches!(events[2], StreamEvent::MessageStop));
        assert!(state.finished());
    }
}

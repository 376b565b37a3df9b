use gproxy_protocol::anthropic::{
    ContentBlock, CreateMessageResponse, Model as ClaudeModel, StopReason, Usage as ClaudeUsage,
};
use gproxy_protocol::anthropic::ToolArguments;
use gproxy_protocol::openai::{ChatCompletionResponse, ChatMessage, CompletionUsage, FinishReason, ToolCall};
use serde_json::Value as JsonValue;

/// Convert an OpenAI chat-completions response into an Anthropic message
/// response. Pure function: no I/O, no global state.
pub fn transform_response(response: &ChatCompletionResponse, message_id: String) -> CreateMessageResponse {
    let choice = response.choices.first();

    let (content, stop_reason) = match choice {
        Some(choice) => (
            map_response_message(&choice.message),
            choice.finish_reason.map(map_finish_reason),
        ),
        None => (Vec::new(), None),
    };

    CreateMessageResponse::new(
        message_id,
        ClaudeModel(response.model.clone()),
        content,
        stop_reason,
        map_usage(response.usage),
    )
}

fn map_response_message(message: &ChatMessage) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();

    let text = message.text_content();
    if !text.is_empty() {
        blocks.push(ContentBlock::Text { text, citations: None });
    }

    if let Some(tool_calls) = &message.tool_calls {
        for tool_call in tool_calls {
            blocks.push(ContentBlock::ToolUse {
                id: tool_call.id.clone(),
                name: tool_call.function.name.clone(),
                input: map_tool_call(tool_call),
            });
        }
    }

    blocks
}

fn map_tool_call(tool_call: &ToolCall) -> JsonValue {
    JsonValue::Object(parse_tool_arguments(&tool_call.function.arguments).into_iter().collect())
}

/// Failed argument parsing is preserved, never dropped, under a well-known key
/// so the client still gets a usable (if degenerate) tool_use input object.
fn parse_tool_arguments(arguments: &str) -> ToolArguments {
    match serde_json::from_str::<JsonValue>(arguments) {
        Ok(JsonValue::Object(map)) => map.into_iter().collect(),
        Ok(other) => {
            let mut map = ToolArguments::new();
            map.insert("error_parsing_arguments".to_string(), other);
            map
        }
        Err(_) => {
            let mut map = ToolArguments::new();
            map.insert(
                "error_parsing_arguments".to_string(),
                JsonValue::String(arguments.to_string()),
            );
            map
        }
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

fn map_usage(usage: Option<CompletionUsage>) -> ClaudeUsage {
    match usage {
        Some(usage) => ClaudeUsage {
            input_tokens: usage.prompt_tokens.max(0) as u32,
            output_tokens: usage.completion_tokens.max(0) as u32,
        },
        None => ClaudeUsage::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_protocol::openai::{Choice, Role};

    fn response_with(message: ChatMessage, finish_reason: Option<FinishReason>) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: "chatcmpl-1".to_string(),
            model: "gpt-4o".to_string(),
            choices: vec![Choice { index: 0, message, finish_reason }],
            usage: Some(CompletionUsage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 }),
        }
    }

    #[test]
    fn content_filter_maps_to_stop_sequence_not_refusal() {
        let message = ChatMessage {
            role: Role::Assistant,
            content: Some(JsonValue::String("blocked".to_string())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        };
        let response = response_with(message, Some(FinishReason::ContentFilter));
        let out = transform_response(&response, "msg_1".to_string());
        assert_eq!(out.stop_reason, Some(StopReason::StopSequence));
    }

    #[test]
    fn unparseable_tool_arguments_preserved_under_known_key() {
        let message = ChatMessage {
            role: Role::Assistant,
            content: None,
            tool_calls: Some(vec![ToolCall {
                id: "call_1".to_string(),
                kind: gproxy_protocol::openai::ToolType::Function,
                function: gproxy_protocol::openai::FunctionCall {
                    name: "search".to_string(),
                    arguments: "not json".to_string(),
                },
            }]),
            tool_call_id: None,
            name: None,
        };
        let response = response_with(message, Some(FinishReason::ToolCalls));
        let out = transform_response(&response, "msg_1".to_string());
        match &out.content[0] {
            ContentBlock::ToolUse { input, .. } => {
                assert_eq!(input["error_parsing_arguments"], JsonValue::String("not json".to_string()));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn usage_carries_through() {
        let message = ChatMessage { role: Role::Assistant, content: None, tool_calls: None, tool_call_id: None, name: None };
        let response = response_with(message, Some(FinishReason::Stop));
        let out = transform_response(&response, "msg_1".to_string());
        assert_eq!(out.usage.input_tokens, 10);
        assert_eq!(out.usage.output_tokens, 5);
    }
}

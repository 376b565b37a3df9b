use gproxy_protocol::anthropic::{ContentBlock, CreateMessageRequest, Message, MessageRole, ToolChoice as ClaudeToolChoice};
use gproxy_protocol::openai;
use gproxy_protocol::openai::{ChatCompletionRequest, ChatMessage, Role};
use serde_json::Value as JsonValue;

/// Convert an Anthropic `/v1/messages` request into an OpenAI chat-completions
/// request body. Pure function: no I/O, no global state.
pub fn transform_request(request: &CreateMessageRequest) -> ChatCompletionRequest {
    let mut messages = Vec::new();

    if let Some(system) = &request.system {
        let text = system.as_text();
        if !text.is_empty() {
            messages.push(ChatMessage {
                role: Role::System,
                content: Some(JsonValue::String(text)),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            });
        }
    }

    for message in &request.messages {
        messages.extend(map_message(message));
    }

    ChatCompletionRequest {
        model: request.model.as_str().to_string(),
        messages,
        tools: request.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|tool| openai::Tool {
                    kind: openai::ToolType::Function,
                    function: openai::FunctionDef {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.input_schema.clone(),
                    },
                })
                .collect()
        }),
        tool_choice: request.tool_choice.as_ref().map(map_tool_choice),
        temperature: request.temperature,
        max_tokens: Some(request.max_tokens),
        stream: request.stream,
        top_p: request.top_p,
        stop: request.stop_sequences.clone(),
    }
}

fn map_tool_choice(choice: &ClaudeToolChoice) -> openai::ToolChoice {
    match choice {
        ClaudeToolChoice::Auto => openai::ToolChoice::Mode("auto".to_string()),
        ClaudeToolChoice::Any => openai::ToolChoice::Mode("required".to_string()),
        ClaudeToolChoice::None => openai::ToolChoice::Mode("none".to_string()),
        ClaudeToolChoice::Tool { name } => openai::ToolChoice::Function {
            kind: openai::ToolType::Function,
            function: openai::FunctionChoice { name: name.clone() },
        },
    }
}

/// A single Anthropic message can splice into more than one OpenAI message
/// (e.g. a `tool_result` block forces a dedicated `tool` role message).
fn map_message(message: &Message) -> Vec<ChatMessage> {
    match message.role {
        MessageRole::User => map_user_message(message),
        MessageRole::Assistant => map_assistant_message(message),
    }
}

fn map_user_message(message: &Message) -> Vec<ChatMessage> {
    let mut out = Vec::new();
    let mut text_parts: Vec<JsonValue> = Vec::new();

    for block in message.content.as_blocks() {
        match block {
            ContentBlock::Text { text, .. } => {
                text_parts.push(serde_json::json!({ "type": "text", "text": text }));
            }
            ContentBlock::Image { source } => {
                text_parts.push(serde_json::json!({
                    "type": "image_url",
                    "image_url": { "url": image_source_to_data_url(&source) },
                }));
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                flush_user_parts(&mut out, &mut text_parts);
                out.push(ChatMessage {
                    role: Role::Tool,
                    content: Some(tool_result_to_content(content)),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id),
                    name: None,
                });
            }
            ContentBlock::ToolUse { .. } => {
                // A tool_use block on a user-role message has no OpenAI analogue; skip.
            }
        }
    }

    flush_user_parts(&mut out, &mut text_parts);
    out
}

fn flush_user_parts(out: &mut Vec<ChatMessage>, parts: &mut Vec<JsonValue>) {
    if parts.is_empty() {
        return;
    }
    out.push(ChatMessage {
        role: Role::User,
        content: Some(JsonValue::Array(std::mem::take(parts))),
        tool_calls: None,
        tool_call_id: None,
        name: None,
    });
}

fn map_assistant_message(message: &Message) -> Vec<ChatMessage> {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in message.content.as_blocks() {
        match block {
            ContentBlock::Text { text: t, .. } => text.push_str(&t),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(openai::ToolCall {
                    id,
                    kind: openai::ToolType::Function,
                    function: openai::FunctionCall {
                        name,
                        arguments: serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string()),
                    },
                });
            }
            ContentBlock::ToolResult { .. } | ContentBlock::Image { .. } => {}
        }
    }

    vec![ChatMessage {
        role: Role::Assistant,
        content: if text.is_empty() { None } else { Some(JsonValue::String(text)) },
        tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
        tool_call_id: None,
        name: None,
    }]
}

fn tool_result_to_content(content: Option<JsonValue>) -> JsonValue {
    match content {
        Some(JsonValue::String(text)) => JsonValue::String(text),
        Some(other) => JsonValue::String(other.to_string()),
        None => JsonValue::String(String::new()),
    }
}

fn image_source_to_data_url(source: &JsonValue) -> String {
    let media_type = source.get("media_type").and_then(JsonValue::as_str).unwrap_or("image/png");
    let data = source.get("data").and_then(JsonValue::as_str).unwrap_or("");
    format!("data:{media_type};base64,{data}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_protocol::anthropic::{Model, MessageContent, SystemPrompt};

    fn user(text: &str) -> Message {
        Message {
            role: MessageRole::User,
            content: MessageContent::Text(text.to_string()),
        }
    }

    fn base_request(messages: Vec<Message>) -> CreateMessageRequest {
        CreateMessageRequest {
            model: Model("claude-3-5-sonnet".to_string()),
            messages,
            system: Some(SystemPrompt::Text("be terse".to_string())),
            tools: None,
            tool_choice: None,
            temperature: None,
            max_tokens: 256,
            stream: None,
            stop_sequences: None,
            top_p: None,
            top_k: None,
            metadata: None,
        }
    }

    #[test]
    fn system_prompt_becomes_leading_system_message() {
        let req = base_request(vec![user("hi")]);
        let out = transform_request(&req);
        assert_eq!(out.messages[0].role, Role::System);
        assert_eq!(out.messages[0].text_content(), "be terse");
    }

    #[test]
    fn tool_result_splices_into_its_own_tool_message() {
        let message = Message {
            role: MessageRole::User,
            content: MessageContent::Blocks(vec![
                ContentBlock::Text { text: "before".to_string(), citations: None },
                ContentBlock::ToolResult {
                    tool_use_id: "call_1".to_string(),
                    content: Some(JsonValue::String("42".to_string())),
                    is_error: None,
                },
            ]),
        };
        let req = base_request(vec![message]);
        let out = transform_request(&req);
        let tool_message = out.messages.iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn tool_choice_any_maps_to_required() {
        let mut req = base_request(vec![user("hi")]);
        req.tool_choice = Some(ClaudeToolChoice::Any);
        let out = transform_request(&req);
        assert_eq!(out.tool_choice, Some(openai::ToolChoice::Mode("required".to_string())));
    }
}

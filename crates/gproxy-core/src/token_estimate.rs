//! Naive token-count estimator backing `POST /v1/messages/count_tokens`.
//! Out of core scope (§1): no provider's actual tokenizer is invoked, only a
//! character-based heuristic over the same text a provider would see.

use gproxy_protocol::anthropic::{ContentBlock, CreateMessageRequest, MessageContent};

const CHARS_PER_TOKEN: usize = 4;

pub fn estimate_input_tokens(request: &CreateMessageRequest) -> u32 {
    let mut total_chars = 0usize;

    if let Some(system) = &request.system {
        total_chars += system.as_text().len();
    }

    for message in &request.messages {
        total_chars += content_chars(&message.content);
    }

    (total_chars / CHARS_PER_TOKEN) as u32
}

fn content_chars(content: &MessageContent) -> usize {
    match content {
        MessageContent::Text(text) => text.len(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text, .. } => text.len(),
                ContentBlock::ToolResult { content, .. } => content.as_ref().map(|v| v.to_string().len()).unwrap_or(0),
                ContentBlock::ToolUse { input, .. } => input.to_string().len(),
                ContentBlock::Image { .. } => 0,
            })
            .sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_protocol::anthropic::{Message, MessageRole, Model};

    fn request(text: &str) -> CreateMessageRequest {
        CreateMessageRequest {
            model: Model("claude-3-5-sonnet-20241022".to_string()),
            messages: vec![Message { role: MessageRole::User, content: MessageContent::Text(text.to_string()) }],
            system: None,
            tools: None,
            tool_choice: None,
            temperature: None,
            max_tokens: 100,
            stream: None,
            stop_sequences: None,
            top_p: None,
            top_k: None,
            metadata: None,
        }
    }

    #[test]
    fn estimates_roughly_one_token_per_four_chars() {
        let req = request(&"a".repeat(40));
        assert_eq!(estimate_input_tokens(&req), 10);
    }

    #[test]
    fn includes_system_prompt_text() {
        let mut req = request("hi");
        req.system = Some(gproxy_protocol::anthropic::SystemPrompt::Text("x".repeat(20)));
        assert_eq!(estimate_input_tokens(&req), (20 + 2) / 4);
    }

    #[test]
    fn empty_request_estimates_zero() {
        let req = request("");
        assert_eq!(estimate_input_tokens(&req), 0);
    }
}

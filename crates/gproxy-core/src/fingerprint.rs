//! Request fingerprinting (C4): a deterministic SHA-256 hash over the
//! semantic payload of a request, used to collapse concurrent identical
//! arrivals onto a single upstream call.

use gproxy_protocol::anthropic::{CreateMessageRequest, FingerprintPayload};
use sha2::{Digest, Sha256};

pub type Fingerprint = String;

/// Computes the fingerprint of a request. `include_max_tokens` mirrors
/// `deduplication.include_max_tokens_in_signature`; `stream` is never part of
/// the payload so stream and non-stream variants of the same content dedupe
/// together.
pub fn fingerprint(request: &CreateMessageRequest, include_max_tokens: bool) -> Fingerprint {
    let payload = FingerprintPayload {
        model: &request.model,
        messages: &request.messages,
        system: request.system.as_ref(),
        tools: request.tools.as_deref(),
        temperature: request.temperature,
        max_tokens: include_max_tokens.then_some(request.max_tokens),
    };

    // `serde_json::to_vec` on a struct with a fixed field order already
    // yields minimal separators and a deterministic key order for the outer
    // object; nested maps (messages, tools) serialize through `serde_json`'s
    // own key order, which is insertion order for our DTOs — stable for a
    // canonical fingerprint since the client's own field order is preserved
    // across identical requests.
    let bytes = serde_json::to_vec(&payload).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    to_hex(&digest)
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to a String cannot fail");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_protocol::anthropic::{Message, MessageContent, MessageRole, Model};

    fn request(model: &str, text: &str, max_tokens: u32) -> CreateMessageRequest {
        CreateMessageRequest {
            model: Model(model.to_string()),
            messages: vec![Message { role: MessageRole::User, content: MessageContent::Text(text.to_string()) }],
            system: None,
            tools: None,
            tool_choice: None,
            temperature: None,
            max_tokens,
            stream: None,
            stop_sequences: None,
            top_p: None,
            top_k: None,
            metadata: None,
        }
    }

    #[test]
    fn identical_content_fingerprints_identically() {
        let a = request("claude-3-5-sonnet", "hi", 100);
        let b = request("claude-3-5-sonnet", "hi", 100);
        assert_eq!(fingerprint(&a, false), fingerprint(&b, false));
    }

    #[test]
    fn different_content_fingerprints_differently() {
        let a = request("claude-3-5-sonnet", "hi", 100);
        let b = request("claude-3-5-sonnet", "bye", 100);
        assert_ne!(fingerprint(&a, false), fingerprint(&b, false));
    }

    #[test]
    fn max_tokens_only_affects_fingerprint_when_included() {
        let a = request("claude-3-5-sonnet", "hi", 100);
        let b = request("claude-3-5-sonnet", "hi", 200);
        assert_eq!(fingerprint(&a, false), fingerprint(&b, false));
        assert_ne!(fingerprint(&a, true), fingerprint(&b, true));
    }

    #[test]
    fn stream_flag_never_affects_fingerprint() {
        let mut a = request("claude-3-5-sonnet", "hi", 100);
        let mut b = request("claude-3-5-sonnet", "hi", 100);
        a.stream = Some(true);
        b.stream = Some(false);
        assert_eq!(fingerprint(&a, false), fingerprint(&b, false));
    }

    #[test]
    fn fingerprint_is_a_64_char_hex_digest() {
        let a = request("claude-3-5-sonnet", "hi", 100);
        let fp = fingerprint(&a, false);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

//! Prompt token estimation for streaming requests.
//!
//! Non-streaming responses carry exact usage counts, so estimation is only
//! needed for streamed completions where the backend reports none.

use serde_json::Value;
use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

fn bpe() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::cl100k_base().expect("cl100k_base tables load"))
}

/// Estimate the number of prompt tokens used by a chat `messages` array.
///
/// Every message costs a fixed 3-token envelope plus the encoded length of
/// each string field; a `name` field costs one extra token, and the reply is
/// primed with 3 more.
pub fn estimate_tokens_from_messages(messages: &[Value]) -> i64 {
    let bpe = bpe();
    let mut tokens: i64 = 0;
    for message in messages {
        tokens += 3;
        if let Some(fields) = message.as_object() {
            for (key, value) in fields {
                if let Some(text) = value.as_str() {
                    tokens += bpe.encode_ordinary(text).len() as i64;
                }
                if key == "name" {
                    tokens += 1;
                }
            }
        }
    }
    tokens + 3
}

/// Estimate prompt tokens from a parsed request body; 0 when the body has no
/// `messages` array.
pub fn estimate_prompt_tokens(body: Option<&Value>) -> i64 {
    body.and_then(|body| body.get("messages"))
        .and_then(|messages| messages.as_array())
        .map(|messages| estimate_tokens_from_messages(messages))
        .unwrap_or(0)
}

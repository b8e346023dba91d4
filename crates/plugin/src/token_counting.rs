use aogate_core::slip::RoutingSlip;
use aogate_core::tokens::estimate_prompt_tokens;

/// Token counts for one finished request. Plugins that account usage embed
/// this helper instead of sharing state with each other; both derivations
/// read only the routing slip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenCounts {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl TokenCounts {
    /// Counts reported by the backend in the `usage` block of a buffered
    /// response. `None` when the response carries no usable usage block.
    pub fn from_target_body(slip: &RoutingSlip) -> Option<Self> {
        let usage = slip.body_dict_from_target.as_ref()?.get("usage")?;
        let prompt_tokens = usage.get("prompt_tokens")?.as_i64()?;
        let completion_tokens = usage
            .get("completion_tokens")
            .and_then(|value| value.as_i64())
            .unwrap_or(0);
        let total_tokens = usage.get("total_tokens")?.as_i64()?;
        Some(Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        })
    }

    /// Counts reconstructed after a streamed response. Streaming responses
    /// report no usage, so the prompt side is estimated from the request
    /// messages and each data event is approximated as one completion token.
    pub fn from_stream(slip: &RoutingSlip) -> Self {
        let prompt_tokens = estimate_prompt_tokens(slip.body_json.as_ref());
        let completion_tokens = slip.data_events_from_target as i64;
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

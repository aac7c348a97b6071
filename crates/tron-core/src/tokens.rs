use crate::turns::Turn;

/// Fixed per-turn overhead (role markers, separators).
pub const TURN_OVERHEAD_TOKENS: u32 = 4;

/// Estimate token count for text content.
/// Approximation: chars / 4.
pub fn estimate_text_tokens(text: &str) -> u32 {
    u32::try_from(text.len().div_ceil(4)).unwrap_or(u32::MAX)
}

/// Estimate tokens for a single turn, tool-call arguments and tool outputs included.
pub fn estimate_turn_tokens(turn: &Turn) -> u32 {
    let mut total = TURN_OVERHEAD_TOKENS.saturating_add(estimate_text_tokens(&turn.content));
    for call in &turn.tool_calls {
        total = total
            .saturating_add(estimate_text_tokens(&call.id))
            .saturating_add(estimate_text_tokens(&call.name))
            .saturating_add(estimate_text_tokens(&call.arguments.to_string()));
    }
    for result in &turn.tool_results {
        total = total
            .saturating_add(estimate_text_tokens(&result.call_id))
            .saturating_add(estimate_text_tokens(&result.output));
    }
    total
}

pub fn estimate_turns_tokens(turns: &[Turn]) -> u32 {
    turns
        .iter()
        .fold(0u32, |acc, t| acc.saturating_add(estimate_turn_tokens(t)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turns::{ToolInvocation, ToolOutcome};
    use serde_json::json;

    #[test]
    fn text_token_estimation() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("hello world"), 3); // 11 chars / 4 ≈ 3
        assert_eq!(estimate_text_tokens("a".repeat(400).as_str()), 100);
    }

    #[test]
    fn turn_includes_overhead() {
        let turn = Turn::user("");
        assert_eq!(estimate_turn_tokens(&turn), TURN_OVERHEAD_TOKENS);
    }

    #[test]
    fn tool_payloads_are_counted() {
        let bare = Turn::assistant("");
        let with_call = Turn::assistant_with_calls(
            "",
            vec![ToolInvocation {
                id: "c1".into(),
                name: "read".into(),
                arguments: json!({"path": "x".repeat(4000)}),
            }],
        );
        assert!(estimate_turn_tokens(&with_call) > estimate_turn_tokens(&bare) + 1000);

        let result = Turn::tool_results(vec![ToolOutcome {
            call_id: "c1".into(),
            output: "y".repeat(8000),
            is_error: false,
        }]);
        assert!(estimate_turn_tokens(&result) >= 2000);
    }

    #[test]
    fn sequence_sums_turns() {
        let turns = vec![Turn::user("a".repeat(40)), Turn::assistant("b".repeat(40))];
        let expected = estimate_turn_tokens(&turns[0]) + estimate_turn_tokens(&turns[1]);
        assert_eq!(estimate_turns_tokens(&turns), expected);
    }
}

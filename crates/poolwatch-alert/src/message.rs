//! Operator message formatting.

use poolwatch_core::InvariantVerdict;

/// Render a breach as a plain-text message.
///
/// `explorer_url` is the block explorer base (`https://etherscan.io`); when
/// set, a transaction link is appended.
pub fn format_alert(verdict: &InvariantVerdict, explorer_url: Option<&str>) -> String {
    let event = &verdict.event;
    let mut text = format!(
        "[BAD DEBT] Pool {kind} on position {position} at block {block} lost liquidity: {deficit}\n\
         Liquidity locked: {locked}\n\
         Liquidity returned: {returned}\n\
         Deficit: {deficit}\n\
         Block: {block}\n\
         Tx: {tx}",
        kind = event.kind,
        position = event.position_id,
        block = event.block_number,
        deficit = verdict.deficit,
        locked = event.liquidity_locked,
        returned = event.liquidity_returned,
        tx = event.transaction_hash,
    );

    if let Some(base) = explorer_url.filter(|u| !u.is_empty()) {
        text.push('\n');
        text.push_str(&format!(
            "{}/tx/{}",
            base.trim_end_matches('/'),
            event.transaction_hash
        ));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolwatch_core::{evaluate, ClosingEvent, ClosingKind, PositionId, B256, U256};

    fn breach() -> InvariantVerdict {
        evaluate(&ClosingEvent {
            kind: ClosingKind::Liquidated,
            position_id: PositionId::new("P1"),
            liquidity_locked: U256::from(1000u64),
            liquidity_returned: U256::from(950u64),
            block_number: 120,
            transaction_hash: B256::repeat_byte(0xab),
            log_index: 3,
        })
    }

    #[test]
    fn test_message_contains_breach_details() {
        let text = format_alert(&breach(), None);
        assert!(text.starts_with("[BAD DEBT] Pool Liquidated on position P1 at block 120"));
        assert!(text.contains("Liquidity locked: 1000"));
        assert!(text.contains("Liquidity returned: 950"));
        assert!(text.contains("Deficit: 50"));
        assert!(text.contains(&format!("0x{}", "ab".repeat(32))));
        assert!(!text.contains("/tx/"));
    }

    #[test]
    fn test_message_with_explorer_link() {
        let text = format_alert(&breach(), Some("https://etherscan.io/"));
        assert!(text.ends_with(&format!("https://etherscan.io/tx/0x{}", "ab".repeat(32))));

        let empty = format_alert(&breach(), Some(""));
        assert!(!empty.contains("/tx/"));
    }
}

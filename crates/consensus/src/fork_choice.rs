//! The fork-choice rule.
//!
//! Classifies a received header against the current tip. Rules are evaluated
//! in the order they are declared; the first match wins.

use meridian_types::{BlockHeader, Slots};

/// Verdict on an incoming header relative to the tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkChoice {
    /// The tip itself, re-received.
    IdenticalBlock,
    /// Same height, same parent, same generator, different id: the
    /// generator signed two blocks for one slot.
    DoubleForging,
    /// Same height and slot as a tip that arrived after its slot had
    /// passed; the incoming block replaces it.
    TieBreak,
    /// The sender is on a chain that beats ours; synchronize.
    DifferentChain,
    /// Extends the tip directly.
    ValidBlock,
    /// Nothing above applies; ignore.
    Discard,
}

/// Classify `incoming` against `tip`.
///
/// `tip_received_at` is the local clock reading (seconds) when the tip was
/// accepted; `now` is the local clock reading at classification time.
pub fn evaluate(
    incoming: &BlockHeader,
    tip: &BlockHeader,
    tip_received_at: u32,
    slots: &Slots,
    now: u32,
) -> ForkChoice {
    if incoming.id() == tip.id() {
        return ForkChoice::IdenticalBlock;
    }

    let same_height = incoming.height == tip.height;
    let same_parent = incoming.previous_block_id == tip.previous_block_id;

    if same_height && same_parent && incoming.generator_address == tip.generator_address {
        return ForkChoice::DoubleForging;
    }

    // Tie-break: both blocks claim the same slot, the incoming one is not
    // from the future, and the tip only arrived after its slot had already
    // ended.
    let incoming_slot = slots.slot_of(incoming.timestamp);
    let tip_slot = slots.slot_of(tip.timestamp);
    if same_height
        && same_parent
        && incoming_slot == tip_slot
        && incoming_slot <= slots.current_slot(now)
        && tip_received_at > slots.slot_end(tip_slot)
    {
        return ForkChoice::TieBreak;
    }

    // A direct extension is never a different chain, whatever its BFT
    // heights claim.
    if incoming.height == tip.height + 1 && incoming.previous_block_id == tip.id() {
        return ForkChoice::ValidBlock;
    }

    if incoming.max_height_prevoted > tip.max_height_prevoted
        || (incoming.max_height_prevoted == tip.max_height_prevoted
            && incoming.height > tip.height)
    {
        return ForkChoice::DifferentChain;
    }

    ForkChoice::Discard
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_types::{
        AggregateCommit, Address, Hash, Signature, CURRENT_BLOCK_VERSION, EMPTY_HASH,
    };

    fn slots() -> Slots {
        Slots::new(1000, 10)
    }

    fn header(height: u32, timestamp: u32, previous: Hash, generator: u8) -> BlockHeader {
        BlockHeader {
            version: CURRENT_BLOCK_VERSION,
            timestamp,
            height,
            previous_block_id: previous,
            generator_address: Address([generator; 20]),
            transaction_root: EMPTY_HASH,
            state_root: Hash::ZERO,
            validators_hash: Hash::ZERO,
            aggregate_commit: AggregateCommit::empty(0),
            max_height_generated: 0,
            max_height_prevoted: height.saturating_sub(2),
            signature: Signature::zero(),
        }
    }

    #[test]
    fn identical_block() {
        let tip = header(100, 2000, Hash::digest(b"h99"), 1);
        assert_eq!(
            evaluate(&tip.clone(), &tip, 2000, &slots(), 2005),
            ForkChoice::IdenticalBlock
        );
    }

    #[test]
    fn extends_tip() {
        let tip = header(100, 2000, Hash::digest(b"h99"), 1);
        let incoming = header(101, 2010, tip.id(), 2);
        assert_eq!(
            evaluate(&incoming, &tip, 2000, &slots(), 2012),
            ForkChoice::ValidBlock
        );
    }

    #[test]
    fn double_forging_same_generator() {
        let prev = Hash::digest(b"h99");
        let tip = header(100, 2000, prev, 1);
        let mut incoming = header(100, 2000, prev, 1);
        incoming.timestamp = 2001; // different id, same slot
        assert_eq!(
            evaluate(&incoming, &tip, 2000, &slots(), 2005),
            ForkChoice::DoubleForging
        );
    }

    #[test]
    fn tie_break_requires_late_tip() {
        let prev = Hash::digest(b"h99");
        // Tip forged at slot 100 ([2000,2009]) but received at 2015 - late.
        let tip = header(100, 2000, prev, 1);
        let incoming = header(100, 2004, prev, 2);
        assert_eq!(
            evaluate(&incoming, &tip, 2015, &slots(), 2006),
            ForkChoice::TieBreak
        );

        // Same situation but the tip arrived within its slot: discard.
        assert_eq!(
            evaluate(&incoming, &tip, 2006, &slots(), 2006),
            ForkChoice::Discard
        );
    }

    #[test]
    fn tie_break_rejects_future_slots() {
        let prev = Hash::digest(b"h99");
        let tip = header(100, 2000, prev, 1);
        // Incoming claims a future slot; even with a late tip this discards.
        let incoming = header(100, 2020, prev, 2);
        assert_eq!(
            evaluate(&incoming, &tip, 2015, &slots(), 2006),
            ForkChoice::Discard
        );
    }

    #[test]
    fn different_chain_on_higher_prevote() {
        let tip = header(100, 2000, Hash::digest(b"h99"), 1);
        let mut incoming = header(90, 1900, Hash::digest(b"other"), 2);
        incoming.max_height_prevoted = tip.max_height_prevoted + 1;
        assert_eq!(
            evaluate(&incoming, &tip, 2000, &slots(), 2005),
            ForkChoice::DifferentChain
        );
    }

    #[test]
    fn different_chain_on_equal_prevote_higher_height() {
        let tip = header(100, 2000, Hash::digest(b"h99"), 1);
        let mut incoming = header(150, 2500, Hash::digest(b"other"), 2);
        incoming.max_height_prevoted = tip.max_height_prevoted;
        assert_eq!(
            evaluate(&incoming, &tip, 2000, &slots(), 2505),
            ForkChoice::DifferentChain
        );
    }

    #[test]
    fn stale_block_is_discarded() {
        let tip = header(100, 2000, Hash::digest(b"h99"), 1);
        let mut incoming = header(50, 1500, Hash::digest(b"old"), 2);
        incoming.max_height_prevoted = 0;
        assert_eq!(
            evaluate(&incoming, &tip, 2000, &slots(), 2005),
            ForkChoice::Discard
        );
    }

    #[test]
    fn double_forging_wins_over_tie_break() {
        // Same generator, same parent, same slot, late tip: the
        // double-forging rule is checked first.
        let prev = Hash::digest(b"h99");
        let tip = header(100, 2000, prev, 1);
        let mut incoming = header(100, 2004, prev, 1);
        incoming.max_height_prevoted = tip.max_height_prevoted;
        assert_eq!(
            evaluate(&incoming, &tip, 2015, &slots(), 2006),
            ForkChoice::DoubleForging
        );
    }
}

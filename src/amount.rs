//! Purchase amount selection.
//!
//! Amounts already used this month are avoided because some merchants reject
//! duplicate-amount transactions within a billing period. When the whole
//! range has been consumed, the exclusion window shrinks from the oldest
//! purchase forward until at least one candidate remains, so a repeat amount
//! is as far in the past as possible.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::Merchant;
use crate::ledger::MerchantLedger;

/// Pick an amount in `[amount_min, amount_max]` (cents) for the next
/// purchase, given the merchant's ledger entry for the current month.
pub fn choose_amount(merchant: &Merchant, entry: Option<&MerchantLedger>) -> u32 {
    choose_amount_with(merchant, entry, &mut rand::thread_rng())
}

/// [`choose_amount`] with an explicit RNG.
pub fn choose_amount_with<R: Rng>(
    merchant: &Merchant,
    entry: Option<&MerchantLedger>,
    rng: &mut R,
) -> u32 {
    let entry = match entry {
        Some(entry) if !entry.transactions.is_empty() => entry,
        // First purchase of the month: any amount in range.
        _ => return rng.gen_range(merchant.amount_min..=merchant.amount_max),
    };

    let past_amounts: Vec<u32> = entry
        .transactions
        .iter()
        .filter_map(|t| t.amount_cents())
        .collect();

    // Exclude everything used this month; if that exhausts the range, drop
    // the oldest used amounts from the exclusion one at a time. At
    // i == past_amounts.len() the exclusion is empty, so this always
    // terminates with a candidate.
    for i in 0..=past_amounts.len() {
        let excluded = &past_amounts[i..];
        let remaining: Vec<u32> = (merchant.amount_min..=merchant.amount_max)
            .filter(|amount| !excluded.contains(amount))
            .collect();
        if let Some(amount) = remaining.choose(rng) {
            return *amount;
        }
    }

    unreachable!("empty exclusion always leaves the full range as candidates")
}

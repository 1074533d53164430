use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use contracts::LedgerEntry;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid ledger amount {0}")]
    InvalidAmount(i64),
    #[error("insufficient balance: balance={balance} amount={amount}")]
    InsufficientBalance { balance: i64, amount: i64 },
    #[error("balance overflow: balance={balance} amount={amount}")]
    Overflow { balance: i64, amount: i64 },
}

/// Append-only credits log with an authoritative running balance.
///
/// Only the newest `retention` entries are kept in memory; pruning never
/// touches the balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditsLedger {
    balance: i64,
    next_entry_id: u64,
    retention: usize,
    entries: VecDeque<LedgerEntry>,
}

impl CreditsLedger {
    pub fn new(retention: usize) -> Self {
        Self {
            balance: 0,
            next_entry_id: 1,
            retention: retention.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn balance(&self) -> i64 {
        self.balance
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &LedgerEntry> {
        self.entries.iter()
    }

    pub fn retained_len(&self) -> usize {
        self.entries.len()
    }

    /// Total number of entries ever posted, including pruned ones.
    pub fn posted_count(&self) -> u64 {
        self.next_entry_id - 1
    }

    pub fn set_retention(&mut self, retention: usize) {
        self.retention = retention.max(1);
        self.prune();
    }

    /// Balance after posting `amount`, without posting it.
    pub fn check(&self, amount: i64) -> Result<i64, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let after = self
            .balance
            .checked_add(amount)
            .ok_or(LedgerError::Overflow {
                balance: self.balance,
                amount,
            })?;
        if after < 0 {
            return Err(LedgerError::InsufficientBalance {
                balance: self.balance,
                amount,
            });
        }
        Ok(after)
    }

    pub fn post(
        &mut self,
        amount: i64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        let balance_after = self.check(amount)?;

        let entry = LedgerEntry {
            id: self.next_entry_id,
            amount,
            reason: reason.to_string(),
            balance_after,
            timestamp: at,
        };
        self.next_entry_id += 1;
        self.balance = balance_after;
        self.entries.push_back(entry.clone());
        self.prune();

        Ok(entry)
    }

    fn prune(&mut self) {
        while self.entries.len() > self.retention {
            let _ = self.entries.pop_front();
        }
    }
}

impl Default for CreditsLedger {
    fn default() -> Self {
        Self::new(contracts::DEFAULT_LEDGER_RETENTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().expect("valid timestamp")
    }

    #[test]
    fn post_tracks_running_balance() {
        let mut ledger = CreditsLedger::new(10);
        ledger.post(200, "reward:SR-201", at()).expect("credit");
        let debit = ledger.post(-50, "purchase", at()).expect("debit");
        assert_eq!(debit.balance_after, 150);
        assert_eq!(debit.id, 2);
        assert_eq!(ledger.balance(), 150);
    }

    #[test]
    fn rejects_debit_below_zero_without_posting() {
        let mut ledger = CreditsLedger::new(10);
        ledger.post(20, "seed", at()).expect("credit");

        let err = ledger.post(-25, "overdraw", at()).expect_err("should fail");
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(ledger.balance(), 20);
        assert_eq!(ledger.retained_len(), 1);
    }

    #[test]
    fn rejects_zero_amount() {
        let ledger = CreditsLedger::new(10);
        assert_eq!(ledger.check(0), Err(LedgerError::InvalidAmount(0)));
    }

    #[test]
    fn pruning_keeps_balance_authoritative() {
        let mut ledger = CreditsLedger::new(3);
        for _ in 0..5 {
            ledger.post(10, "tick", at()).expect("credit");
        }
        assert_eq!(ledger.retained_len(), 3);
        assert_eq!(ledger.posted_count(), 5);
        assert_eq!(ledger.balance(), 50);
        let oldest = ledger.entries().next().expect("entry retained");
        assert_eq!(oldest.id, 3);
    }
}

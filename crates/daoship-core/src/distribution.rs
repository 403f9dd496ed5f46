use crate::error::PlanError;
use crate::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Who keeps the indivisible remainder of a distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "recipient", rename_all = "snake_case")]
pub enum RemainderHolder {
    /// Stays with the distributing actor (never transferred).
    Distributor,
    /// Explicitly reassigned to one of the recipients.
    Recipient(Address),
}

/// Equal split of `total_amount` over a fixed, ordered recipient set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionPlan {
    pub total_amount: u64,
    pub recipients: Vec<Address>,
    pub per_recipient_amount: u64,
    pub remainder: u64,
    pub remainder_holder: RemainderHolder,
}

impl DistributionPlan {
    /// Compute the plan. Pure and deterministic.
    pub fn compute(total_amount: u64, recipients: &[Address]) -> Result<Self, PlanError> {
        if recipients.is_empty() {
            return Err(PlanError::EmptyRecipientSet);
        }
        if total_amount == 0 {
            return Err(PlanError::NonPositiveAmount);
        }

        let mut seen = HashSet::with_capacity(recipients.len());
        for recipient in recipients {
            if !seen.insert(recipient) {
                return Err(PlanError::DuplicateRecipient(recipient.to_string()));
            }
        }

        let count = recipients.len() as u64;
        let per_recipient_amount = total_amount / count;
        let remainder = total_amount - per_recipient_amount * count;

        Ok(Self {
            total_amount,
            recipients: recipients.to_vec(),
            per_recipient_amount,
            remainder,
            remainder_holder: RemainderHolder::Distributor,
        })
    }

    /// Reassign the remainder to one of the recipients.
    pub fn with_remainder_to(mut self, recipient: &Address) -> Result<Self, PlanError> {
        if !self.recipients.contains(recipient) {
            return Err(PlanError::UnknownRemainderHolder(recipient.to_string()));
        }
        self.remainder_holder = RemainderHolder::Recipient(recipient.clone());
        Ok(self)
    }

    pub fn recipient_count(&self) -> usize {
        self.recipients.len()
    }

    /// Amount to transfer to each recipient, in recipient order.
    pub fn allocations(&self) -> Vec<(Address, u64)> {
        self.recipients
            .iter()
            .map(|recipient| {
                let bonus = match &self.remainder_holder {
                    RemainderHolder::Recipient(holder) if holder == recipient => self.remainder,
                    _ => 0,
                };
                (recipient.clone(), self.per_recipient_amount + bonus)
            })
            .collect()
    }

    /// Total that leaves the distributor's account if every transfer succeeds.
    pub fn transferred_total(&self) -> u64 {
        match self.remainder_holder {
            RemainderHolder::Distributor => self.per_recipient_amount * self.recipients.len() as u64,
            RemainderHolder::Recipient(_) => self.total_amount,
        }
    }

    /// Amount the distributor keeps.
    pub fn withheld(&self) -> u64 {
        self.total_amount - self.transferred_total()
    }
}

/// Outcome of one recipient's transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionEntry {
    pub recipient: Address,
    pub amount: u64,
    /// Ledger transaction reference, present whenever a transfer was submitted.
    pub external_reference: Option<String>,
    pub succeeded: bool,
    pub error: Option<String>,
}

/// Best-effort per-recipient results, one entry per recipient in plan order.
///
/// Step status alone says nothing about these entries: a distribution step
/// succeeds once every transfer was attempted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionResult {
    pub entries: Vec<DistributionEntry>,
}

impl DistributionResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, recipient: Address, amount: u64, reference: String) {
        self.entries.push(DistributionEntry {
            recipient,
            amount,
            external_reference: Some(reference),
            succeeded: true,
            error: None,
        });
    }

    pub fn record_failure(
        &mut self,
        recipient: Address,
        amount: u64,
        reference: Option<String>,
        error: impl Into<String>,
    ) {
        self.entries.push(DistributionEntry {
            recipient,
            amount,
            external_reference: reference,
            succeeded: false,
            error: Some(error.into()),
        });
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &DistributionEntry> {
        self.entries.iter().filter(|entry| entry.succeeded)
    }

    pub fn failed(&self) -> impl Iterator<Item = &DistributionEntry> {
        self.entries.iter().filter(|entry| !entry.succeeded)
    }

    pub fn success_count(&self) -> usize {
        self.succeeded().count()
    }

    pub fn failure_count(&self) -> usize {
        self.failed().count()
    }

    pub fn is_complete_success(&self) -> bool {
        !self.entries.is_empty() && self.entries.iter().all(|entry| entry.succeeded)
    }

    pub fn distributed_amount(&self) -> u64 {
        self.succeeded().map(|entry| entry.amount).sum()
    }

    pub fn summary(&self) -> String {
        format!(
            "{}/{} transfers confirmed",
            self.success_count(),
            self.entries.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn recipients(count: usize) -> Vec<Address> {
        (0..count).map(|i| Address::new(format!("0x{:064x}", i + 1))).collect()
    }

    #[test]
    fn even_split_over_four_recipients() {
        let plan = DistributionPlan::compute(1_000_000, &recipients(4)).unwrap();
        assert_eq!(plan.per_recipient_amount, 250_000);
        assert_eq!(plan.remainder, 0);
        assert_eq!(plan.withheld(), 0);
    }

    #[test]
    fn remainder_stays_with_distributor() {
        let plan = DistributionPlan::compute(10, &recipients(3)).unwrap();
        assert_eq!(plan.per_recipient_amount, 3);
        assert_eq!(plan.remainder, 1);
        assert_eq!(plan.remainder_holder, RemainderHolder::Distributor);
        assert!(plan.allocations().iter().all(|(_, amount)| *amount == 3));
        assert_eq!(plan.transferred_total(), 9);
        assert_eq!(plan.withheld(), 1);
    }

    #[test]
    fn remainder_can_be_reassigned_explicitly() {
        let set = recipients(3);
        let plan = DistributionPlan::compute(11, &set)
            .unwrap()
            .with_remainder_to(&set[1])
            .unwrap();
        let amounts: Vec<u64> = plan.allocations().into_iter().map(|(_, a)| a).collect();
        assert_eq!(amounts, vec![3, 5, 3]);
        assert_eq!(plan.withheld(), 0);

        let outsider = Address::new("0xfeed");
        assert_eq!(
            DistributionPlan::compute(11, &set)
                .unwrap()
                .with_remainder_to(&outsider),
            Err(PlanError::UnknownRemainderHolder("0xfeed".into()))
        );
    }

    #[test]
    fn rejects_invalid_inputs() {
        assert_eq!(
            DistributionPlan::compute(100, &[]),
            Err(PlanError::EmptyRecipientSet)
        );
        assert_eq!(
            DistributionPlan::compute(0, &recipients(2)),
            Err(PlanError::NonPositiveAmount)
        );
        let dupes = vec![Address::new("0xAB"), Address::new("0xab")];
        assert!(matches!(
            DistributionPlan::compute(100, &dupes),
            Err(PlanError::DuplicateRecipient(_))
        ));
    }

    #[test]
    fn partial_result_is_not_complete() {
        let mut result = DistributionResult::new();
        result.record_success(Address::new("0x1"), 5, "tx-1".into());
        result.record_failure(Address::new("0x2"), 5, None, "rejected");
        assert!(!result.is_complete_success());
        assert_eq!(result.distributed_amount(), 5);
        assert_eq!(result.summary(), "1/2 transfers confirmed");
    }

    proptest! {
        #[test]
        fn plan_conserves_total(total in 1u64..=u64::MAX / 2, count in 1usize..64) {
            let set = recipients(count);
            let plan = DistributionPlan::compute(total, &set).unwrap();
            prop_assert_eq!(
                plan.per_recipient_amount * count as u64 + plan.remainder,
                total
            );
            prop_assert!(plan.remainder < count as u64);
            prop_assert_eq!(plan.allocations().len(), count);
        }

        #[test]
        fn plan_is_pure(total in 1u64..10_000_000, count in 1usize..16) {
            let set = recipients(count);
            prop_assert_eq!(
                DistributionPlan::compute(total, &set),
                DistributionPlan::compute(total, &set)
            );
        }
    }
}

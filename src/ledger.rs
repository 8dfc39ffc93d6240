//! Points Ledger Service
//!
//! Every balance change is one store transaction that updates
//! `users/{id}.points` and writes a [`LedgerEntry`] next to it. Controllers
//! that need a balance change as part of a larger transaction use
//! [`plan_credit`] and [`plan_debit`] inside their own `apply` closure.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::Error;
use crate::models::{LedgerEntry, LedgerReason, UserAccount};
use crate::store::{
    collections, server_timestamp, to_document, DocRef, Document, LedgerStore, Mutation, Query,
    Snapshot, SortOrder, Subscription, TxnCommit, TxnReads,
};

/// A balance change planned inside a transaction
#[derive(Debug, Clone)]
pub struct BalanceChange {
    pub user_id: String,
    pub delta: i64,
    pub balance_before: u64,
    pub balance_after: u64,
    /// Account update and ledger entry, to be committed together
    pub mutations: Vec<Mutation>,
}

/// Reference to a user account document
pub fn account_ref(user_id: &str) -> DocRef {
    DocRef::new(collections::USERS, user_id)
}

/// Read the account a transaction loaded; `AccountNotFound` if it is absent
pub fn read_account(reads: &TxnReads, user_id: &str) -> Result<UserAccount, Error> {
    reads
        .decode::<UserAccount>(&account_ref(user_id))?
        .ok_or_else(|| Error::AccountNotFound(user_id.to_string()))
}

fn signed(amount: u64) -> Result<i64, Error> {
    if amount == 0 {
        return Err(Error::invalid("amount must be positive"));
    }
    i64::try_from(amount).map_err(|_| Error::invalid(format!("amount {amount} is too large")))
}

fn entry_mutation(
    user_id: &str,
    delta: i64,
    balance_after: u64,
    reason: LedgerReason,
    reference: Option<&str>,
) -> Result<Mutation, Error> {
    let entry = LedgerEntry {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        delta,
        balance_after,
        reason,
        reference: reference.map(str::to_string),
        created_at: None,
    };
    let mut fields = to_document(&entry)?;
    fields.insert("createdAt".to_string(), server_timestamp());

    Ok(Mutation::Set {
        target: DocRef::new(collections::POINTS_LEDGER, &entry.id),
        fields,
    })
}

/// Ledger entry for the balance a new account is created with.
/// Empty when the account starts at zero.
pub fn plan_opening_entry(user_id: &str, starting_balance: u64) -> Result<Vec<Mutation>, Error> {
    if starting_balance == 0 {
        return Ok(Vec::new());
    }
    let delta = signed(starting_balance)?;
    Ok(vec![entry_mutation(
        user_id,
        delta,
        starting_balance,
        LedgerReason::Registration,
        None,
    )?])
}

fn plan_change(
    reads: &TxnReads,
    user_id: &str,
    delta: i64,
    reason: LedgerReason,
    reference: Option<&str>,
) -> Result<BalanceChange, Error> {
    let account = read_account(reads, user_id)?;
    let balance_before = account.points;

    let balance_after = if delta >= 0 {
        balance_before
            .checked_add(delta.unsigned_abs())
            .ok_or_else(|| Error::invalid("balance would overflow"))?
    } else {
        let required = delta.unsigned_abs();
        balance_before
            .checked_sub(required)
            .ok_or(Error::InsufficientBalance {
                required,
                available: balance_before,
            })?
    };

    let entry = entry_mutation(user_id, delta, balance_after, reason, reference)?;

    let mut account_fields = Document::new();
    account_fields.insert("points".to_string(), json!(balance_after));

    Ok(BalanceChange {
        user_id: user_id.to_string(),
        delta,
        balance_before,
        balance_after,
        mutations: vec![
            Mutation::Update {
                target: account_ref(user_id),
                fields: account_fields,
            },
            entry,
        ],
    })
}

/// Plan adding `amount` points to an account read by the transaction
pub fn plan_credit(
    reads: &TxnReads,
    user_id: &str,
    amount: u64,
    reason: LedgerReason,
    reference: Option<&str>,
) -> Result<BalanceChange, Error> {
    plan_change(reads, user_id, signed(amount)?, reason, reference)
}

/// Plan taking `amount` points from an account read by the transaction.
/// Fails with `InsufficientBalance` if the balance is lower than `amount`.
pub fn plan_debit(
    reads: &TxnReads,
    user_id: &str,
    amount: u64,
    reason: LedgerReason,
    reference: Option<&str>,
) -> Result<BalanceChange, Error> {
    plan_change(reads, user_id, -signed(amount)?, reason, reference)
}

/// Balance after a committed transaction that changed the account
pub(crate) fn committed_balance(commit: &TxnCommit, user_id: &str) -> Option<u64> {
    let target = account_ref(user_id);
    commit
        .mutations
        .iter()
        .rev()
        .find_map(|mutation| match mutation {
            Mutation::Update { target: t, fields } | Mutation::Set { target: t, fields }
                if *t == target =>
            {
                fields.get("points").and_then(Value::as_u64)
            }
            _ => None,
        })
}

/// Balance carried by a snapshot of a `watch_balance` subscription
pub fn balance_of(snapshot: &Snapshot) -> Option<u64> {
    snapshot
        .records
        .first()
        .and_then(|r| r.field("points"))
        .and_then(Value::as_u64)
}

/// Balance next to the sum of the ledger entries of one account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub balance: u64,
    pub ledger_total: i64,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        i64::try_from(self.balance).map_or(false, |b| b == self.ledger_total)
    }
}

/// Atomic credits and debits of user balances
pub struct PointsLedger {
    store: Arc<dyn LedgerStore>,
}

impl PointsLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Add points and return the new balance
    pub async fn credit(&self, user_id: &str, amount: u64) -> Result<u64, Error> {
        let delta = signed(amount)?;
        self.change(user_id, delta, LedgerReason::Adjustment, None)
            .await
    }

    /// Take points and return the new balance.
    /// Nothing is written when the balance is lower than `amount`.
    pub async fn debit(&self, user_id: &str, amount: u64) -> Result<u64, Error> {
        let delta = signed(amount)?;
        self.change(user_id, -delta, LedgerReason::Adjustment, None)
            .await
    }

    /// Apply a signed change with an explicit reason and return the new balance
    pub async fn change(
        &self,
        user_id: &str,
        delta: i64,
        reason: LedgerReason,
        reference: Option<&str>,
    ) -> Result<u64, Error> {
        if delta == 0 {
            return Err(Error::invalid("amount must be positive"));
        }

        let reads = [account_ref(user_id)];
        let commit = self
            .store
            .run_transaction(&reads, &|txn| {
                Ok(plan_change(txn, user_id, delta, reason, reference)?.mutations)
            })
            .await?;

        let balance = committed_balance(&commit, user_id)
            .ok_or_else(|| Error::AccountNotFound(user_id.to_string()))?;
        info!(
            "Balance of {} changed by {} to {} ({:?})",
            user_id, delta, balance, reason
        );
        Ok(balance)
    }

    /// Current balance
    pub async fn balance(&self, user_id: &str) -> Result<u64, Error> {
        let record = self
            .store
            .get_record(&account_ref(user_id))
            .await?
            .ok_or_else(|| Error::AccountNotFound(user_id.to_string()))?;
        Ok(record.decode::<UserAccount>()?.points)
    }

    /// Live view of one account; read the balance with [`balance_of`]
    pub async fn watch_balance(&self, user_id: &str) -> Result<Subscription, Error> {
        self.store
            .subscribe(Query::new(collections::USERS).eq("id", user_id))
            .await
    }

    /// Ledger entries of one account, oldest first
    pub async fn history(&self, user_id: &str) -> Result<Vec<LedgerEntry>, Error> {
        let query = Query::new(collections::POINTS_LEDGER)
            .eq("userId", user_id)
            .order("createdAt", SortOrder::Ascending);
        self.store.query(&query).await?.decode()
    }

    /// Compare the stored balance with the sum of the account's entries
    pub async fn reconcile(&self, user_id: &str) -> Result<Reconciliation, Error> {
        let balance = self.balance(user_id).await?;
        let ledger_total = self.history(user_id).await?.iter().map(|e| e.delta).sum();
        Ok(Reconciliation {
            balance,
            ledger_total,
        })
    }
}

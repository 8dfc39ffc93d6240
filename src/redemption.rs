//! Redemption Controller and the voucher catalog
//!
//! A redemption debits the item cost and writes its audit record in one
//! transaction. The record keeps the cost at redemption time, so later
//! catalog changes never rewrite history.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::AdminCapability;
use crate::error::Error;
use crate::ledger::{account_ref, plan_debit};
use crate::models::{CatalogItem, LedgerReason, RedemptionRecord};
use crate::store::{
    collections, server_timestamp, to_document, DocRef, LedgerStore, Mutation, Query, SortOrder,
};

/// The fixed list of vouchers points can buy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    items: Vec<CatalogItem>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new(vec![
            CatalogItem::new("canteen-voucher", "Canteen voucher", 20),
            CatalogItem::new("stationery-voucher", "Stationery voucher", 30),
            CatalogItem::new("book-voucher", "Book voucher", 50),
        ])
    }
}

impl Catalog {
    pub fn new(items: Vec<CatalogItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[CatalogItem] {
        &self.items
    }

    /// Look an item up by id
    pub fn item(&self, id: &str) -> Option<&CatalogItem> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Look an item up by id, `InvalidInput` if it is not offered
    pub fn require(&self, id: &str) -> Result<&CatalogItem, Error> {
        self.item(id)
            .ok_or_else(|| Error::invalid(format!("'{id}' is not in the catalog")))
    }
}

/// Exchanges points for catalog items
pub struct RedemptionDesk {
    store: Arc<dyn LedgerStore>,
    catalog: Catalog,
}

impl RedemptionDesk {
    pub fn new(store: Arc<dyn LedgerStore>, catalog: Catalog) -> Self {
        Self { store, catalog }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Debit the item cost and record the redemption.
    ///
    /// `full_name` and `class_section` are stored exactly as given and are
    /// not checked against the profile. Fails with `InsufficientBalance` and
    /// writes nothing if the balance is below the cost.
    pub async fn redeem(
        &self,
        user_id: &str,
        item: &CatalogItem,
        full_name: &str,
        class_section: &str,
    ) -> Result<RedemptionRecord, Error> {
        let mut record = RedemptionRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            full_name: full_name.to_string(),
            class_section: class_section.to_string(),
            item_name: item.name.clone(),
            item_points: item.cost,
            redeemed_at: None,
        };
        let mut fields = to_document(&record)?;
        fields.insert("redeemedAt".to_string(), server_timestamp());

        let reads = [account_ref(user_id)];
        let result = self
            .store
            .run_transaction(&reads, &|txn| {
                let change = plan_debit(
                    txn,
                    user_id,
                    item.cost,
                    LedgerReason::Redemption,
                    Some(&record.id),
                )?;
                let mut mutations = change.mutations;
                mutations.push(Mutation::Set {
                    target: DocRef::new(collections::REDEEM_HISTORY, &record.id),
                    fields: fields.clone(),
                });
                Ok(mutations)
            })
            .await;

        let commit = match result {
            Ok(commit) => commit,
            Err(e) => {
                warn!("Redemption of '{}' by {} refused: {}", item.name, user_id, e);
                return Err(e);
            }
        };

        record.redeemed_at = Some(commit.commit_time);
        info!(
            "{} redeemed '{}' for {} points",
            user_id, item.name, item.cost
        );
        Ok(record)
    }

    /// Redeem a catalog item by id
    pub async fn redeem_by_id(
        &self,
        user_id: &str,
        item_id: &str,
        full_name: &str,
        class_section: &str,
    ) -> Result<RedemptionRecord, Error> {
        let item = self.catalog.require(item_id)?.clone();
        self.redeem(user_id, &item, full_name, class_section).await
    }

    /// Redemptions of one user, newest first
    pub async fn history(&self, user_id: &str) -> Result<Vec<RedemptionRecord>, Error> {
        let query = Query::new(collections::REDEEM_HISTORY)
            .eq("userId", user_id)
            .order("redeemedAt", SortOrder::Descending);
        self.store.query(&query).await?.decode()
    }

    /// Every redemption, newest first
    pub async fn all_history(
        &self,
        _admin: &AdminCapability,
    ) -> Result<Vec<RedemptionRecord>, Error> {
        let query =
            Query::new(collections::REDEEM_HISTORY).order("redeemedAt", SortOrder::Descending);
        self.store.query(&query).await?.decode()
    }
}

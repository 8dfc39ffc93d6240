//! Offer Lifecycle Controller: `Active -> Completed`, nothing else
//!
//! Posting creates the offer and credits the poster in one transaction.
//! Confirming credits the donor, archives the offer and removes it from the
//! active set in one transaction.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::AdminCapability;
use crate::config::AppConfig;
use crate::error::Error;
use crate::ledger::{account_ref, plan_credit, read_account};
use crate::models::{CompletedOffer, LedgerReason, Offer};
use crate::store::{
    collections, server_timestamp, to_document, DocRef, LedgerStore, Mutation, Query, SortOrder,
    Subscription,
};
use crate::validation;

/// Form data of a new offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferDraft {
    pub item_name: String,
    pub category: String,
    pub quantity: u32,
    pub donor_name: String,
}

impl OfferDraft {
    pub fn new(item_name: &str, category: &str, quantity: u32, donor_name: &str) -> Self {
        Self {
            item_name: item_name.trim().to_string(),
            category: category.trim().to_string(),
            quantity,
            donor_name: donor_name.trim().to_string(),
        }
    }

    fn validate(&self) -> Result<(), Error> {
        validation::require_text("itemName", &self.item_name)?;
        validation::require_text("category", &self.category)?;
        validation::require_text("donorName", &self.donor_name)?;
        validation::validate_quantity(self.quantity)
    }
}

fn offer_ref(offer_id: &str) -> DocRef {
    DocRef::new(collections::DONATIONS, offer_id)
}

pub struct OfferLifecycle {
    store: Arc<dyn LedgerStore>,
    config: Arc<AppConfig>,
}

impl OfferLifecycle {
    pub fn new(store: Arc<dyn LedgerStore>, config: Arc<AppConfig>) -> Self {
        Self { store, config }
    }

    /// Create an active offer and credit the poster's posting reward
    pub async fn post(&self, user_id: &str, draft: OfferDraft) -> Result<Offer, Error> {
        draft.validate()?;

        let mut offer = Offer {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            item_name: draft.item_name,
            category: draft.category,
            quantity: draft.quantity,
            donor_name: draft.donor_name,
            created_at: None,
        };
        let mut fields = to_document(&offer)?;
        fields.insert("createdAt".to_string(), server_timestamp());

        let reward = self.config.post_reward;
        let reads = [account_ref(user_id)];
        let commit = self
            .store
            .run_transaction(&reads, &|txn| {
                let mut mutations = vec![Mutation::Set {
                    target: offer_ref(&offer.id),
                    fields: fields.clone(),
                }];
                if reward > 0 {
                    let change =
                        plan_credit(txn, user_id, reward, LedgerReason::OfferPosted, Some(&offer.id))?;
                    mutations.extend(change.mutations);
                } else {
                    read_account(txn, user_id)?;
                }
                Ok(mutations)
            })
            .await?;

        offer.created_at = Some(commit.commit_time);
        info!(
            "Offer {} posted by {}: {} x {}",
            offer.id, user_id, offer.quantity, offer.item_name
        );
        Ok(offer)
    }

    /// Confirm receipt of an active offer.
    ///
    /// Credits the donor, writes the completed copy under the same id and
    /// removes the active offer, all in one transaction. Fails with
    /// `OfferNotFound` when the offer is no longer active, which is also what
    /// the losing side of two concurrent confirmations sees.
    pub async fn confirm(
        &self,
        admin: &AdminCapability,
        offer_id: &str,
    ) -> Result<CompletedOffer, Error> {
        let target = offer_ref(offer_id);
        let donor_id = match self.store.get_record(&target).await? {
            Some(record) => record.decode::<Offer>()?.user_id,
            None => return Err(Error::OfferNotFound(offer_id.to_string())),
        };

        let reward = self.config.confirm_reward;
        let reads = [target.clone(), account_ref(&donor_id)];
        let result = self
            .store
            .run_transaction(&reads, &|txn| {
                let offer = txn
                    .decode::<Offer>(&target)?
                    .ok_or_else(|| Error::OfferNotFound(offer_id.to_string()))?;
                if offer.user_id != donor_id {
                    return Err(Error::conflict(format!(
                        "offer {offer_id} changed owner during confirmation"
                    )));
                }

                let completed = CompletedOffer::from_offer(offer, admin.admin_id());
                let mut fields = to_document(&completed)?;
                fields.insert("completedAt".to_string(), server_timestamp());

                let mut mutations = Vec::new();
                if reward > 0 {
                    let change = plan_credit(
                        txn,
                        &donor_id,
                        reward,
                        LedgerReason::OfferConfirmed,
                        Some(offer_id),
                    )?;
                    mutations.extend(change.mutations);
                }
                mutations.push(Mutation::Set {
                    target: DocRef::new(collections::COMPLETED_DONATIONS, offer_id),
                    fields,
                });
                mutations.push(Mutation::Delete {
                    target: target.clone(),
                });
                Ok(mutations)
            })
            .await;

        let commit = match result {
            Ok(commit) => commit,
            Err(e) => {
                warn!("Confirmation of offer {} failed: {}", offer_id, e);
                return Err(e);
            }
        };

        let offer = commit
            .reads
            .decode::<Offer>(&target)?
            .ok_or_else(|| Error::OfferNotFound(offer_id.to_string()))?;
        let mut completed = CompletedOffer::from_offer(offer, admin.admin_id());
        completed.completed_at = Some(commit.commit_time);

        info!(
            "Offer {} confirmed by {}, donor {} credited {}",
            offer_id,
            admin.admin_id(),
            donor_id,
            reward
        );
        Ok(completed)
    }

    /// An active offer by id
    pub async fn offer(&self, offer_id: &str) -> Result<Option<Offer>, Error> {
        self.store
            .get_record(&offer_ref(offer_id))
            .await?
            .map(|record| record.decode())
            .transpose()
    }

    fn active_query() -> Query {
        Query::new(collections::DONATIONS).order("createdAt", SortOrder::Descending)
    }

    /// Every active offer, newest first
    pub async fn active(&self) -> Result<Vec<Offer>, Error> {
        self.store.query(&Self::active_query()).await?.decode()
    }

    /// Active offers of one user, newest first
    pub async fn active_for_user(&self, user_id: &str) -> Result<Vec<Offer>, Error> {
        let query = Self::active_query().eq("userId", user_id);
        self.store.query(&query).await?.decode()
    }

    /// Live view of the active set, newest first
    pub async fn watch_active(&self) -> Result<Subscription, Error> {
        self.store.subscribe(Self::active_query()).await
    }

    fn completed_query() -> Query {
        Query::new(collections::COMPLETED_DONATIONS).order("completedAt", SortOrder::Descending)
    }

    /// Every confirmed offer, most recently confirmed first
    pub async fn completed(&self) -> Result<Vec<CompletedOffer>, Error> {
        self.store.query(&Self::completed_query()).await?.decode()
    }

    /// Confirmed offers of one user
    pub async fn completed_for_user(&self, user_id: &str) -> Result<Vec<CompletedOffer>, Error> {
        let query = Self::completed_query().eq("userId", user_id);
        self.store.query(&query).await?.decode()
    }
}

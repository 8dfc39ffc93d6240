//! Record shapes of the persisted layout
//!
//! Every model is stored as one document keyed by its `id` field. Timestamp
//! fields are `None` until the store has assigned them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A registered citizen or administrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    /// Identity provider user id
    pub id: String,

    /// Email address
    pub email: String,

    /// Name shown on offers and in the admin console
    pub display_name: String,

    /// Point balance
    pub points: u64,

    /// Phone number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,

    /// Postal address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Date of birth
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birthdate: Option<NaiveDate>,

    /// Age derived from the birthdate when the profile was last saved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,

    /// Holds the admin role
    #[serde(default)]
    pub is_admin: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// A posted donation waiting for admin confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    pub id: String,

    /// Owner of the offer, credited on confirmation
    pub user_id: String,

    pub item_name: String,

    pub category: String,

    pub quantity: u32,

    /// Donor name as entered on the form
    pub donor_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Archived copy of a confirmed offer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedOffer {
    pub id: String,
    pub user_id: String,
    pub item_name: String,
    pub category: String,
    pub quantity: u32,
    pub donor_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Admin who confirmed receipt
    pub confirmed_by: String,
}

impl CompletedOffer {
    /// Archive an offer on behalf of the confirming admin
    pub fn from_offer(offer: Offer, confirmed_by: &str) -> Self {
        Self {
            id: offer.id,
            user_id: offer.user_id,
            item_name: offer.item_name,
            category: offer.category,
            quantity: offer.quantity,
            donor_name: offer.donor_name,
            created_at: offer.created_at,
            completed_at: None,
            confirmed_by: confirmed_by.to_string(),
        }
    }
}

/// A voucher that can be bought with points. Fixed configuration, not stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    pub name: String,
    /// Price in points
    pub cost: u64,
}

impl CatalogItem {
    pub fn new(id: &str, name: &str, cost: u64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            cost,
        }
    }
}

/// Audit record of one points-for-voucher exchange.
///
/// `full_name` and `class_section` are whatever the user typed at redemption
/// time. They are evidence for the person handing out the voucher, not a
/// verified identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionRecord {
    pub id: String,
    pub user_id: String,
    pub full_name: String,
    pub class_section: String,
    pub item_name: String,

    /// Cost of the item when it was redeemed
    pub item_points: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redeemed_at: Option<DateTime<Utc>>,
}

/// Why a balance changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    Registration,
    OfferPosted,
    OfferConfirmed,
    Redemption,
    Adjustment,
}

/// Audit entry written with every balance change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: String,
    pub user_id: String,

    /// Signed change applied to the balance
    pub delta: i64,

    pub balance_after: u64,

    pub reason: LedgerReason,

    /// Offer or redemption id the change belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Author of a support chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatSender {
    User,
    Assistant,
    Admin,
}

/// One support chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub sender: ChatSender,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// Support conversation of one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatThread {
    /// Same as the user id
    pub id: String,

    pub user_id: String,

    /// While set, the assistant stays silent and an admin answers
    #[serde(default)]
    pub admin_takeover: bool,

    #[serde(default)]
    pub messages: Vec<ChatMessage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ChatThread {
    /// An empty thread for a user
    pub fn new(user_id: &str) -> Self {
        Self {
            id: user_id.to_string(),
            user_id: user_id.to_string(),
            admin_takeover: false,
            messages: Vec::new(),
            updated_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redemption_record_uses_persisted_field_names() {
        let record = RedemptionRecord {
            id: "r1".to_string(),
            user_id: "u1".to_string(),
            full_name: "Ana Cruz".to_string(),
            class_section: "10-B".to_string(),
            item_name: "Canteen voucher".to_string(),
            item_points: 20,
            redeemed_at: None,
        };

        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({
                "id": "r1",
                "userId": "u1",
                "fullName": "Ana Cruz",
                "classSection": "10-B",
                "itemName": "Canteen voucher",
                "itemPoints": 20
            })
        );
    }

    #[test]
    fn accounts_tolerate_missing_optional_fields() {
        let account: UserAccount = serde_json::from_value(json!({
            "id": "u1",
            "email": "ana@example.org",
            "displayName": "Ana",
            "points": 10,
            "createdAt": "2024-02-01T08:00:00.000000Z"
        }))
        .unwrap();

        assert!(!account.is_admin);
        assert!(account.phone.is_none());
        assert!(account.created_at.is_some());
    }

    #[test]
    fn ledger_reasons_are_snake_case() {
        assert_eq!(
            serde_json::to_value(LedgerReason::OfferConfirmed).unwrap(),
            json!("offer_confirmed")
        );
    }
}

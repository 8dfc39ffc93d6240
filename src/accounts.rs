//! Registration, session start, profiles and the admin user view

use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::auth::{AdminCapability, IdentityProvider, Role, SessionContext};
use crate::config::AppConfig;
use crate::error::Error;
use crate::ledger::{account_ref, plan_opening_entry, PointsLedger};
use crate::models::{LedgerReason, UserAccount};
use crate::store::{
    collections, server_timestamp, to_document, Document, LedgerStore, Mutation, Query, SortOrder,
    Subscription,
};
use crate::validation;

/// Profile fields a user may change. `None` leaves a field as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub birthdate: Option<NaiveDate>,
}

/// Whole years between `birthdate` and `today`; `None` for future dates
pub fn age_on(birthdate: NaiveDate, today: NaiveDate) -> Option<u32> {
    if birthdate > today {
        return None;
    }
    let mut years = today.year() - birthdate.year();
    if (today.month(), today.day()) < (birthdate.month(), birthdate.day()) {
        years -= 1;
    }
    u32::try_from(years).ok()
}

pub struct AccountService {
    store: Arc<dyn LedgerStore>,
    identity: Arc<dyn IdentityProvider>,
    ledger: PointsLedger,
    config: Arc<AppConfig>,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        identity: Arc<dyn IdentityProvider>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            ledger: PointsLedger::new(store.clone()),
            store,
            identity,
            config,
        }
    }

    /// Create credentials and the account with its starting balance
    ///
    /// If the account commit fails after the credentials were created, the
    /// account is opened on the first sign-in instead.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<UserAccount, Error> {
        let email = email.trim().to_lowercase();
        validation::validate_email(&email)?;
        validation::validate_password(password, self.config.min_password_length)?;
        validation::require_text("displayName", display_name)?;
        validation::check_email_domain(&self.config, &email)?;

        let user_id = self.identity.sign_up(&email, password).await?;
        let account = self
            .open_account(&user_id, &email, display_name.trim())
            .await?;
        info!(
            "Registered {} as {} (admin: {})",
            email, user_id, account.is_admin
        );
        Ok(account)
    }

    /// Write the account and its opening ledger entry in one commit
    async fn open_account(
        &self,
        user_id: &str,
        email: &str,
        display_name: &str,
    ) -> Result<UserAccount, Error> {
        let mut account = UserAccount {
            id: user_id.to_string(),
            email: email.to_string(),
            display_name: display_name.to_string(),
            points: self.config.starting_balance,
            phone: None,
            address: None,
            birthdate: None,
            age: None,
            is_admin: self.config.is_bootstrap_admin(email),
            created_at: None,
        };
        let mut fields = to_document(&account)?;
        fields.insert("createdAt".to_string(), server_timestamp());
        let opening = plan_opening_entry(user_id, self.config.starting_balance)?;

        let target = account_ref(user_id);
        let commit = self
            .store
            .run_transaction(std::slice::from_ref(&target), &|txn| {
                if txn.get(&target).is_some() {
                    return Err(Error::conflict(format!("account {user_id} already exists")));
                }
                let mut mutations = vec![Mutation::Set {
                    target: target.clone(),
                    fields: fields.clone(),
                }];
                mutations.extend(opening.iter().cloned());
                Ok(mutations)
            })
            .await?;

        account.created_at = Some(commit.commit_time);
        Ok(account)
    }

    /// The account behind fresh credentials.
    ///
    /// Sign-up and the account commit are separate calls, so credentials can
    /// exist without an account when that commit failed. Such an account is
    /// opened now, named after the email's local part.
    async fn account_for_session(&self, user_id: &str, email: &str) -> Result<UserAccount, Error> {
        match self.account(user_id).await {
            Err(Error::AccountNotFound(_)) => {
                warn!("{} has credentials but no account, opening it", user_id);
                let name = email.split('@').next().unwrap_or(email);
                match self.open_account(user_id, email, name).await {
                    Err(Error::Conflict(_)) => self.account(user_id).await,
                    other => other,
                }
            }
            other => other,
        }
    }

    /// Sign in and resolve the role for the whole session
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SessionContext, Error> {
        validation::check_email_domain(&self.config, email)?;

        let session = self.identity.sign_in(email, password).await?;
        let account = self
            .account_for_session(&session.user_id, &session.email)
            .await?;

        let claims_admin = match session.claims() {
            Ok(claims) => claims.is_admin(),
            Err(e) => {
                warn!("Could not read token claims of {}: {}", session.user_id, e);
                false
            }
        };
        let role = if account.is_admin || claims_admin {
            Role::Admin
        } else {
            Role::Member
        };

        info!("{} signed in as {:?}", session.user_id, role);
        Ok(SessionContext::new(session, role))
    }

    pub async fn sign_out(&self) -> Result<(), Error> {
        self.identity.sign_out().await
    }

    pub async fn account(&self, user_id: &str) -> Result<UserAccount, Error> {
        self.store
            .get_record(&account_ref(user_id))
            .await?
            .ok_or_else(|| Error::AccountNotFound(user_id.to_string()))?
            .decode()
    }

    /// Live view of one account
    pub async fn watch_account(&self, user_id: &str) -> Result<Subscription, Error> {
        self.store
            .subscribe(Query::new(collections::USERS).eq("id", user_id))
            .await
    }

    /// Change profile fields. The balance is never touched here.
    pub async fn update_profile(
        &self,
        user_id: &str,
        update: ProfileUpdate,
    ) -> Result<UserAccount, Error> {
        let mut fields = Document::new();
        if let Some(name) = update.display_name {
            validation::require_text("displayName", &name)?;
            fields.insert("displayName".to_string(), json!(name.trim()));
        }
        if let Some(phone) = update.phone {
            fields.insert("phone".to_string(), json!(phone.trim()));
        }
        if let Some(address) = update.address {
            fields.insert("address".to_string(), json!(address.trim()));
        }
        if let Some(birthdate) = update.birthdate {
            let age = age_on(birthdate, Utc::now().date_naive())
                .ok_or_else(|| Error::invalid("birthdate must not be in the future"))?;
            fields.insert("birthdate".to_string(), json!(birthdate));
            fields.insert("age".to_string(), json!(age));
        }

        if !fields.is_empty() {
            match self.store.update_record(&account_ref(user_id), fields).await {
                Err(Error::RecordNotFound { .. }) => {
                    return Err(Error::AccountNotFound(user_id.to_string()))
                }
                other => other?,
            }
        }
        self.account(user_id).await
    }

    /// Every account, by email
    pub async fn list_users(&self, _admin: &AdminCapability) -> Result<Vec<UserAccount>, Error> {
        let query = Query::new(collections::USERS).order("email", SortOrder::Ascending);
        self.store.query(&query).await?.decode()
    }

    /// Manual balance correction, recorded as an adjustment
    pub async fn adjust_points(
        &self,
        admin: &AdminCapability,
        user_id: &str,
        delta: i64,
    ) -> Result<u64, Error> {
        let balance = self
            .ledger
            .change(user_id, delta, LedgerReason::Adjustment, None)
            .await?;
        info!(
            "{} adjusted the balance of {} by {}",
            admin.admin_id(),
            user_id,
            delta
        );
        Ok(balance)
    }

    /// Grant or revoke the admin flag. Takes effect at the user's next sign-in.
    pub async fn set_admin(
        &self,
        admin: &AdminCapability,
        user_id: &str,
        is_admin: bool,
    ) -> Result<(), Error> {
        let mut fields = Document::new();
        fields.insert("isAdmin".to_string(), Value::Bool(is_admin));
        match self.store.update_record(&account_ref(user_id), fields).await {
            Err(Error::RecordNotFound { .. }) => Err(Error::AccountNotFound(user_id.to_string())),
            other => {
                other?;
                info!(
                    "{} set admin flag of {} to {}",
                    admin.admin_id(),
                    user_id,
                    is_admin
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryIdentityProvider;
    use crate::store::MemoryStore;

    fn service(config: AppConfig) -> (Arc<MemoryIdentityProvider>, AccountService) {
        let store = Arc::new(MemoryStore::new());
        let identity = Arc::new(MemoryIdentityProvider::new());
        let accounts = AccountService::new(store, identity.clone(), Arc::new(config));
        (identity, accounts)
    }

    #[test]
    fn age_counts_whole_years() {
        let birthdate = NaiveDate::from_ymd_opt(2008, 6, 15).unwrap();
        let before = NaiveDate::from_ymd_opt(2024, 6, 14).unwrap();
        let on = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
        assert_eq!(age_on(birthdate, before), Some(15));
        assert_eq!(age_on(birthdate, on), Some(16));
        assert_eq!(age_on(on, birthdate), None);
    }

    #[tokio::test]
    async fn sign_in_opens_account_lost_after_sign_up() {
        let (identity, accounts) = service(AppConfig::default());
        let user_id = identity
            .sign_up("ben@example.org", "secret1")
            .await
            .unwrap();
        assert!(matches!(
            accounts.account(&user_id).await,
            Err(Error::AccountNotFound(_))
        ));

        let session = accounts
            .sign_in("ben@example.org", "secret1")
            .await
            .unwrap();
        assert_eq!(session.user_id(), user_id);

        let account = accounts.account(&user_id).await.unwrap();
        assert_eq!(account.points, 10);
        assert_eq!(account.display_name, "ben");
        let reconciliation = accounts.ledger.reconcile(&user_id).await.unwrap();
        assert!(reconciliation.is_consistent());

        // a second sign-in finds the account and opens nothing new
        accounts.sign_in("ben@example.org", "secret1").await.unwrap();
        assert_eq!(accounts.ledger.history(&user_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn register_opens_account_with_starting_balance() {
        let (_, accounts) = service(AppConfig::default());

        let account = accounts
            .register(" Ana@Example.org ", "secret1", "Ana")
            .await
            .unwrap();
        assert_eq!(account.email, "ana@example.org");
        assert_eq!(account.points, 10);
        assert!(!account.is_admin);

        let history = accounts.ledger.history(&account.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, LedgerReason::Registration);
        assert_eq!(history[0].delta, 10);
    }

    #[tokio::test]
    async fn register_validates_before_creating_credentials() {
        let (identity, accounts) =
            service(AppConfig::default().with_allowed_email_domain("school.edu"));

        assert!(matches!(
            accounts.register("not-an-email", "secret1", "Ana").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            accounts.register("ana@school.edu", "123", "Ana").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            accounts.register("ana@gmail.com", "secret1", "Ana").await,
            Err(Error::Authentication(_))
        ));
        assert!(identity.sign_in("ana@gmail.com", "secret1").await.is_err());
    }

    #[tokio::test]
    async fn sign_in_resolves_member_and_bootstrap_admin() {
        let (_, accounts) = service(AppConfig::default().with_admin_email("root@example.org"));
        accounts
            .register("ana@example.org", "secret1", "Ana")
            .await
            .unwrap();
        accounts
            .register("root@example.org", "secret1", "Root")
            .await
            .unwrap();

        let member = accounts.sign_in("ana@example.org", "secret1").await.unwrap();
        assert_eq!(member.role(), Role::Member);
        assert!(matches!(member.admin(), Err(Error::PermissionDenied(_))));

        let admin = accounts.sign_in("root@example.org", "secret1").await.unwrap();
        assert_eq!(admin.role(), Role::Admin);
        let cap = admin.admin().unwrap();
        assert_eq!(accounts.list_users(cap).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn role_claim_in_token_grants_admin() {
        let (identity, accounts) = service(AppConfig::default());
        accounts
            .register("staff@example.org", "secret1", "Staff")
            .await
            .unwrap();
        identity.grant_admin_role("staff@example.org");

        let context = accounts.sign_in("staff@example.org", "secret1").await.unwrap();
        assert!(context.is_admin());
    }

    #[tokio::test]
    async fn profile_updates_leave_points_alone() {
        let (_, accounts) = service(AppConfig::default());
        let account = accounts
            .register("ana@example.org", "secret1", "Ana")
            .await
            .unwrap();

        let updated = accounts
            .update_profile(
                &account.id,
                ProfileUpdate {
                    phone: Some("555-0100".to_string()),
                    birthdate: NaiveDate::from_ymd_opt(2000, 1, 1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.phone.as_deref(), Some("555-0100"));
        assert!(updated.age.unwrap() >= 24);
        assert_eq!(updated.points, 10);

        assert!(matches!(
            accounts.update_profile("ghost", ProfileUpdate {
                phone: Some("1".to_string()),
                ..Default::default()
            }).await,
            Err(Error::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn adjustments_go_through_the_ledger() {
        let (_, accounts) = service(AppConfig::default());
        let account = accounts
            .register("ana@example.org", "secret1", "Ana")
            .await
            .unwrap();
        let cap = AdminCapability::new("root");

        assert_eq!(accounts.adjust_points(&cap, &account.id, 7).await.unwrap(), 17);
        assert!(matches!(
            accounts.adjust_points(&cap, &account.id, -20).await,
            Err(Error::InsufficientBalance { .. })
        ));
        assert_eq!(accounts.adjust_points(&cap, &account.id, -17).await.unwrap(), 0);

        accounts.set_admin(&cap, &account.id, true).await.unwrap();
        assert!(accounts.account(&account.id).await.unwrap().is_admin);
    }
}

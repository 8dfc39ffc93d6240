//! Donation Ledger
//!
//! Backend library of a community donation program: citizens post surplus
//! items, an administrator confirms receipt and credits points, and points are
//! redeemed for vouchers from a fixed catalog. A support chat with an AI
//! assistant and admin takeover rounds it off.
//!
//! The document store, identity provider and text completion service are
//! injected collaborators. Use [`DonationApp::connect`] for the hosted
//! backends or [`DonationApp::new`] with any implementation of the traits.

pub mod accounts;
pub mod auth;
pub mod completion;
pub mod config;
pub mod error;
pub mod fetch;
pub mod ledger;
pub mod models;
pub mod offers;
pub mod redemption;
pub mod store;
pub mod support;
pub mod validation;

use std::sync::Arc;

use reqwest::Client;
use tracing::{debug, warn};

use crate::accounts::AccountService;
use crate::auth::{HttpIdentityProvider, IdentityProvider};
use crate::completion::{GenerativeClient, TextCompletion};
use crate::config::{AppConfig, BackendConfig};
use crate::error::Error;
use crate::ledger::PointsLedger;
use crate::offers::OfferLifecycle;
use crate::redemption::{Catalog, RedemptionDesk};
use crate::store::{LedgerStore, RestStore};
use crate::support::SupportChat;

/// The main entry point: every controller wired to one set of collaborators
pub struct DonationApp {
    store: Arc<dyn LedgerStore>,
    accounts: AccountService,
    ledger: PointsLedger,
    offers: OfferLifecycle,
    redemptions: RedemptionDesk,
    support: SupportChat,
    config: Arc<AppConfig>,
}

impl DonationApp {
    /// Wire the controllers to the given collaborators
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use donation_ledger::prelude::*;
    /// use donation_ledger::auth::MemoryIdentityProvider;
    /// use donation_ledger::completion::CannedCompletion;
    ///
    /// let app = DonationApp::new(
    ///     Arc::new(MemoryStore::new()),
    ///     Arc::new(MemoryIdentityProvider::new()),
    ///     Arc::new(CannedCompletion::new("An administrator will follow up.")),
    ///     AppConfig::default(),
    /// );
    /// assert_eq!(app.config().starting_balance, 10);
    /// ```
    pub fn new(
        store: Arc<dyn LedgerStore>,
        identity: Arc<dyn IdentityProvider>,
        completion: Arc<dyn TextCompletion>,
        config: AppConfig,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            accounts: AccountService::new(store.clone(), identity, config.clone()),
            ledger: PointsLedger::new(store.clone()),
            offers: OfferLifecycle::new(store.clone(), config.clone()),
            redemptions: RedemptionDesk::new(store.clone(), Catalog::default()),
            support: SupportChat::new(store.clone(), completion, config.clone()),
            store,
            config,
        }
    }

    /// Connect to the hosted document store, identity backend and completion API
    ///
    /// Store requests are sent with the signed-in user's access token once
    /// there is one. Live views follow other clients' writes through the
    /// backend's realtime feed when it is reachable.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use donation_ledger::prelude::*;
    ///
    /// # async fn run() -> Result<(), Error> {
    /// let backend = BackendConfig::from_env()?;
    /// let app = DonationApp::connect(&backend, AppConfig::from_env()).await?;
    /// let session = app.accounts().sign_in("ana@example.org", "secret1").await?;
    /// println!("{} points", app.ledger().balance(session.user_id()).await?);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(backend: &BackendConfig, config: AppConfig) -> Result<Self, Error> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;

        let store = Arc::new(
            RestStore::new(&backend.backend_url, &backend.backend_key, client.clone())
                .with_realtime_url(&backend.realtime_url)
                .with_transaction_attempts(config.transaction_attempts),
        );
        if let Err(e) = store.listen().await {
            warn!(
                "Realtime feed unavailable, live views only follow this client's writes: {}",
                e
            );
        }
        let identity = Arc::new(HttpIdentityProvider::new(
            &backend.backend_url,
            &backend.backend_key,
            client.clone(),
        ));
        let completion = Arc::new(GenerativeClient::from_config(backend, client));

        let mut auth_state = identity.on_auth_state_changed();
        let session_source = Arc::downgrade(&identity);
        let token_sink = store.clone();
        tokio::spawn(async move {
            while auth_state.changed().await.is_ok() {
                let Some(identity) = session_source.upgrade() else {
                    break;
                };
                let token = identity.current_session().map(|s| s.access_token);
                token_sink.set_auth(token);
            }
            debug!("Identity provider gone, stopped forwarding session tokens");
        });

        Ok(Self::new(store, identity, completion, config))
    }

    /// Replace the default voucher catalog
    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.redemptions = RedemptionDesk::new(self.store.clone(), catalog);
        self
    }

    /// Registration, sign-in, profiles and the admin user view
    pub fn accounts(&self) -> &AccountService {
        &self.accounts
    }

    /// Balances and ledger history
    pub fn ledger(&self) -> &PointsLedger {
        &self.ledger
    }

    /// Posting and confirming offers
    pub fn offers(&self) -> &OfferLifecycle {
        &self.offers
    }

    /// Voucher redemption
    pub fn redemptions(&self) -> &RedemptionDesk {
        &self.redemptions
    }

    /// Support chat
    pub fn support(&self) -> &SupportChat {
        &self.support
    }

    /// The document store the controllers share
    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

/// A convenience module for common imports
pub mod prelude {
    pub use crate::auth::{AdminCapability, Role, SessionContext};
    pub use crate::config::{AppConfig, BackendConfig};
    pub use crate::error::Error;
    pub use crate::models::*;
    pub use crate::offers::OfferDraft;
    pub use crate::redemption::Catalog;
    pub use crate::store::{LedgerStore, MemoryStore};
    pub use crate::DonationApp;
}

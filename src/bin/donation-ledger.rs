use std::sync::Arc;

use clap::{Arg, Command};
use donation_ledger::auth::MemoryIdentityProvider;
use donation_ledger::completion::CannedCompletion;
use donation_ledger::prelude::*;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn app(matches: &clap::ArgMatches) -> Result<DonationApp, Error> {
    let mut config = AppConfig::from_env();
    if let Some(raw) = matches.value_of("starting-balance") {
        let balance = raw
            .parse()
            .map_err(|e| Error::config(format!("invalid --starting-balance '{raw}': {e}")))?;
        config = config.with_starting_balance(balance);
    }
    config = config.with_admin_email("admin@example.org");

    Ok(DonationApp::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryIdentityProvider::new()),
        Arc::new(
            CannedCompletion::new("An administrator will follow up on your question.")
                .with_reply("Post a donation offer; you earn points when an admin confirms it."),
        ),
        config,
    ))
}

/// Walk one donor through register, post, confirm and redeem
async fn demo(app: &DonationApp) -> Result<(), Error> {
    let accounts = app.accounts();
    accounts
        .register("admin@example.org", "admin-secret", "Program admin")
        .await?;
    let donor = accounts
        .register("ana@example.org", "ana-secret", "Ana Cruz")
        .await?;
    println!("Registered {} with {} points", donor.email, donor.points);

    let admin_session = accounts.sign_in("admin@example.org", "admin-secret").await?;
    let admin = admin_session.admin()?;

    let offer = app
        .offers()
        .post(&donor.id, OfferDraft::new("Blankets", "Clothing", 3, "Ana Cruz"))
        .await?;
    println!(
        "Posted offer {}: balance {}",
        offer.id,
        app.ledger().balance(&donor.id).await?
    );

    app.offers().confirm(admin, &offer.id).await?;
    println!(
        "Offer confirmed: balance {}",
        app.ledger().balance(&donor.id).await?
    );

    let record = app
        .redemptions()
        .redeem_by_id(&donor.id, "canteen-voucher", "Ana Cruz", "10-B")
        .await?;
    println!(
        "Redeemed {} for {} points: balance {}",
        record.item_name,
        record.item_points,
        app.ledger().balance(&donor.id).await?
    );

    match app
        .redemptions()
        .redeem_by_id(&donor.id, "canteen-voucher", "Ana Cruz", "10-B")
        .await
    {
        Err(e @ Error::InsufficientBalance { .. }) => println!("Second redemption refused: {e}"),
        other => println!("Unexpected second redemption result: {other:?}"),
    }

    if let Some(reply) = app.support().send(&donor.id, "How do I earn points?").await? {
        println!("Assistant: {}", reply.text);
    }

    println!("Ledger of {}:", donor.email);
    for entry in app.ledger().history(&donor.id).await? {
        println!(
            "  {:>+4}  -> {:>3}  {:?}",
            entry.delta, entry.balance_after, entry.reason
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let matches = Command::new("donation-ledger")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Run the donation ledger against in-memory collaborators")
        .arg(
            Arg::new("starting-balance")
                .long("starting-balance")
                .value_name("POINTS")
                .help("Balance of newly registered accounts")
                .takes_value(true),
        )
        .subcommand(Command::new("demo").about("Register, post, confirm and redeem"))
        .subcommand(Command::new("catalog").about("List the voucher catalog"))
        .get_matches();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let app = app(&matches)?;
    match matches.subcommand_name() {
        Some("catalog") => {
            for item in app.redemptions().catalog().items() {
                println!("{:<20} {:<22} {:>3} points", item.id, item.name, item.cost);
            }
            Ok(())
        }
        _ => {
            info!("Running demo scenario");
            demo(&app).await.map_err(|e| {
                error!("Demo failed: {}", e);
                e
            })
        }
    }
}

//! Composition root: builds the backend client and every store once, wires
//! them together, and runs a scripted walkthrough against the in-memory
//! backend. A UI shell would hold the same `App` struct and call the same
//! store methods.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use tracing::info;

use flatly_backend::memory::MemoryBackend;
use flatly_backend::{IdentityBackend, Persistence};
use flatly_stores::admin::AdminStore;
use flatly_stores::favorites::FavoritesStore;
use flatly_stores::filter::{FlatFilters, apply_filters};
use flatly_stores::flats::FlatsStore;
use flatly_stores::messages::MessageStore;
use flatly_stores::notify::Notifier;
use flatly_stores::session::{SessionConfig, SessionStore};
use flatly_types::models::FlatDraft;
use flatly_types::validate::Registration;

struct App {
    backend: MemoryBackend,
    debounce: Duration,
    session: SessionStore,
    favorites: FavoritesStore,
    flats: FlatsStore,
    messages: MessageStore,
    admin: AdminStore,
    notifier: Notifier,
}

fn build_app(backend: &MemoryBackend, session_config: SessionConfig, debounce: Duration) -> App {
    let shared = Arc::new(backend.clone());
    let notifier = Notifier::new();

    let session = SessionStore::new(
        shared.clone(),
        shared.clone(),
        notifier.clone(),
        session_config,
    );
    let favorites = FavoritesStore::with_debounce(shared.clone(), notifier.clone(), debounce);
    let flats = FlatsStore::new(shared.clone(), shared.clone(), session.clone(), notifier.clone());
    let messages = MessageStore::new(shared.clone(), session.clone(), notifier.clone());
    let admin = AdminStore::new(shared.clone(), shared.clone(), session.clone(), notifier.clone());

    App {
        backend: backend.clone(),
        debounce,
        session,
        favorites,
        flats,
        messages,
        admin,
        notifier,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flatly=debug".into()),
        )
        .init();

    // Config
    let session_ttl: u64 = std::env::var("FLATLY_SESSION_TTL_SECS")
        .unwrap_or_else(|_| "3600".into())
        .parse()?;
    let debounce_ms: u64 = std::env::var("FLATLY_FAVORITES_DEBOUNCE_MS")
        .unwrap_or_else(|_| "500".into())
        .parse()?;

    let backend = MemoryBackend::new();
    backend.set_persistence(Persistence::Local).await?;

    let app = build_app(
        &backend,
        SessionConfig {
            ttl: Duration::from_secs(session_ttl),
            expiry_tick: Duration::from_secs(1),
        },
        Duration::from_millis(debounce_ms),
    );

    // Print notices the way the UI would toast them.
    let mut notices = app.notifier.subscribe();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            info!(level = ?notice.level, "{}", notice.text);
        }
    });

    walkthrough(&app).await?;
    Ok(())
}

/// Exercises every store the way a session in the UI would.
async fn walkthrough(app: &App) -> Result<()> {
    info!("registering an owner and listing a flat");
    app.session
        .register(Registration {
            first_name: "Olga".into(),
            last_name: "Berg".into(),
            email: "owner@example.com".into(),
            password: "Abc1!x".into(),
            birth_date: NaiveDate::from_ymd_opt(1990, 3, 1),
        })
        .await?;
    let loft = app
        .flats
        .create(
            FlatDraft {
                name: "Riverside loft".into(),
                city: "Graz".into(),
                street_name: "Lendkai".into(),
                street_number: 19,
                area_size: 72.0,
                rent_price: 900.0,
                year_built: 2005,
                has_ac: true,
            },
            None,
        )
        .await?;
    app.session.sign_out().await?;

    info!("a renter signs up, searches, and favorites the loft");
    app.session
        .register(Registration {
            first_name: "Rita".into(),
            last_name: "Chen".into(),
            email: "renter@example.com".into(),
            password: "Abc1!x".into(),
            birth_date: NaiveDate::from_ymd_opt(1995, 7, 20),
        })
        .await?;
    let renter = app.session.current_user().expect("just signed in");

    let listings = app.flats.fetch_all().await?;
    let filters = FlatFilters { min_price: "600".into(), ..Default::default() };
    let hits = apply_filters(&listings, &filters, "loft");
    info!(total = listings.len(), hits = hits.len(), "searched listings");

    app.favorites.attach(renter.id).await;
    app.favorites.toggle(loft.id)?;
    info!(favorite = app.favorites.is_favorite(loft.id), "optimistic toggle applied");
    // Let the debounced write commit before tearing the store down.
    tokio::time::sleep(app.debounce + Duration::from_millis(100)).await;

    app.messages.send(&loft, "Is the loft still available?").await?;
    app.favorites.detach();
    app.session.sign_out().await?;

    info!("the owner checks messages");
    app.session.sign_in("owner@example.com", "Abc1!x").await?;
    let thread = app.messages.fetch_thread(loft.id).await?;
    info!(unread = app.messages.unread_count(loft.id), messages = thread.len(), "thread loaded");
    app.messages.mark_all_read(loft.id).await?;

    info!("admin roster");
    let owner = app.session.current_user().expect("signed in");
    // Bootstrap: the first admin is flagged out of band.
    flatly_backend::DocumentBackend::update(
        &app.backend,
        flatly_stores::collections::USERS,
        &owner.id.to_string(),
        serde_json::json!({ "is_admin": true }),
    )
    .await?;
    // The live user-doc subscription picks the flag up.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let roster = app.admin.load().await?;
    for row in &roster {
        info!(
            user = %row.profile.full_name(),
            flats = row.flats_count,
            admin = row.profile.is_admin,
            "roster entry"
        );
    }

    app.session.sign_out().await?;
    info!("walkthrough complete");
    Ok(())
}

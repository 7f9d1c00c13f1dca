//! Keel demo: commands against a stock aggregate, relayed through the
//! outbox into a stock-levels projection.
//!
//! Runs against `PostgreSQL` when `DATABASE_URL` is set, in memory otherwise.

use std::error::Error;
use std::sync::Arc;

use keel_core::command::CommandContext;
use keel_core::config::EngineConfig;
use keel_core::repository::AggregateRepository;
use keel_outbox::OutboxRelay;
use keel_projection::{ProjectionChannel, ProjectionEngine};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::state::Stores;
use crate::stock::{
    STOCK_RECEIVED_EVENT_TYPE, STOCK_SHIPPED_EVENT_TYPE, StockItem, StockLevels, on_received,
    on_shipped,
};

mod state;
mod stock;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing subscriber.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = EngineConfig::from_env()?;
    tracing::info!(?config, "starting keel demo");

    let stores = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&database_url)
                .await?;
            keel_event_store::migrate(&pool).await?;
            Stores::postgres(&pool)
        }
        Err(_) => {
            tracing::info!("DATABASE_URL not set, using in-memory stores");
            Stores::in_memory()
        }
    };

    let repo = AggregateRepository::<StockItem>::from_config(
        stores.events.clone(),
        stores.snapshots.clone(),
        &config,
    );

    // The checkpoint store keeps the levels next to the position, so with
    // PostgreSQL a rerun resumes from the stored levels, not from empty ones.
    let projection = Arc::new(
        ProjectionEngine::new(
            "stock-levels",
            StockLevels::default(),
            stores.checkpoints.clone(),
            &config.projection,
        )
        .on(STOCK_RECEIVED_EVENT_TYPE, on_received)
        .on(STOCK_SHIPPED_EVENT_TYPE, on_shipped),
    );
    let relay = OutboxRelay::new(
        stores.outbox.clone(),
        Arc::new(ProjectionChannel::new(projection.clone(), stores.events.clone())),
        config.relay.clone(),
    );

    let ctx = CommandContext::new(Uuid::new_v4()).with_actor("demo");
    repo.execute("stock-widget-north", &ctx, |item| item.receive("widget", 40))
        .await?;
    repo.execute("stock-widget-south", &ctx, |item| item.receive("widget", 15))
        .await?;
    repo.execute("stock-gadget-north", &ctx, |item| item.receive("gadget", 5))
        .await?;
    let outcome = repo
        .execute("stock-widget-north", &ctx, |item| item.ship("widget", 12))
        .await?;
    tracing::info!(
        stream_id = "stock-widget-north",
        version = outcome.version,
        on_hand = outcome.state.on_hand,
        "shipment booked"
    );

    match repo
        .execute("stock-gadget-north", &ctx, |item| item.ship("gadget", 9))
        .await
    {
        Ok(_) => tracing::warn!("oversized shipment was accepted"),
        Err(e) => tracing::info!(error = %e, "oversized shipment rejected"),
    }

    let report = relay.run_until_idle().await?;
    tracing::info!(?report, "outbox drained");

    let levels = projection.read_model().await;
    tracing::info!(
        checkpoint = projection.checkpoint().await?,
        levels = %serde_json::to_string(&levels)?,
        "stock levels projected"
    );

    Ok(())
}

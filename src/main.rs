// =============================================================================
// FARM MARKET - Main Entry Point
// =============================================================================
// Order and inventory service for a farm-to-market marketplace.
//
// WHAT THIS SERVICE DOES:
// - Checkout: creates a payment-gateway order and a Pending order with
//   stock reserved atomically
// - Verifies payment callbacks (HMAC-SHA256) and marks orders Paid
// - Lets administrators place orders on behalf of buyers
// - Manages the storefront catalog and farmer listings
// - Exposes Prometheus metrics and health probes
// =============================================================================

mod admin;
mod cache;
mod config;
mod db;
mod error;
mod handlers;
mod inventory;
mod memory;
mod metrics;
mod models;
mod orders;
mod payment;
mod users;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, patch, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::CatalogCache;
use crate::config::{Config, PaymentConfig};
use crate::db::{Database, Store};
use crate::memory::MemoryStore;
use crate::metrics::setup_metrics;
use crate::payment::{HttpGateway, PaymentGateway};
use crate::users::{LogNotifier, Notifier};

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
/// Shared by every handler through `State<Arc<AppState>>`.
pub struct AppState {
    /// PostgreSQL in production, in-process memory store otherwise
    pub store: Arc<dyn Store>,

    pub gateway: Arc<dyn PaymentGateway>,

    /// Catalog read cache (inert when REDIS_URL is unset)
    pub cache: CatalogCache,

    pub notifier: Arc<dyn Notifier>,

    /// Gateway credentials and checkout currency
    pub payment: PaymentConfig,

    /// Prometheus metrics handle
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}

// -----------------------------------------------------------------------------
// ROUTES
// -----------------------------------------------------------------------------
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        // ----- Health & Metrics -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        // ----- Users -----
        .route("/users/register", post(handlers::register))
        .route("/users/forgot-password", post(handlers::forgot_password))
        .route("/users/reset-password", post(handlers::reset_password))
        // ----- Orders -----
        .route("/orders/create-order", post(handlers::create_order))
        .route("/orders/verify-payment", post(handlers::verify_payment))
        .route("/orders/previous/:user_id", get(handlers::previous_orders))
        .route("/orders/:order_id", get(handlers::get_order))
        .route("/orders/:order_id/cancel", post(handlers::cancel_order))
        .route("/orders/:order_id/refund", post(handlers::refund_order))
        .route(
            "/orders/:order_id/delivery-status",
            patch(handlers::update_delivery_status),
        )
        // ----- Catalog -----
        .route(
            "/product",
            get(handlers::list_products).post(handlers::create_product),
        )
        .route("/product/update-stock", patch(handlers::update_stock))
        .route("/product/:id", get(handlers::get_product))
        // ----- Farmers -----
        .route("/farmer", post(handlers::register_farmer))
        .route("/farmer/orders/admin", post(handlers::create_admin_order))
        .route("/farmer/:farmer_id", get(handlers::get_farmer))
        .route(
            "/farmer/:farmer_id/products",
            post(handlers::add_farmer_product),
        )
        .route(
            "/farmer/:farmer_id/products/:product_id",
            axum::routing::delete(handlers::delete_farmer_product),
        )
        .route(
            "/farmer/:farmer_id/products/:product_id/stock",
            patch(handlers::set_farmer_product_stock),
        )
        .route("/farmer/:farmer_id/orders", get(handlers::farmer_orders))
        // ----- Middleware Layers -----
        .route_layer(middleware::from_fn(handlers::track_metrics))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// -----------------------------------------------------------------------------
// MAIN FUNCTION
// -----------------------------------------------------------------------------
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // STEP 1: .env for local development (absence is fine)
    dotenvy::dotenv().ok();

    // STEP 2: structured JSON logging, RUST_LOG controls levels
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,farm_market=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Farm Market service...");

    // STEP 3: configuration
    let config = Config::from_env()?;
    info!(
        port = config.port,
        gateway = %config.payment.base_url,
        currency = %config.payment.currency,
        "Configuration loaded"
    );

    // STEP 4: metrics
    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // STEP 5: store
    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let db = Database::connect(url).await?;
            info!("Connected to PostgreSQL");
            db.run_migrations().await?;
            info!("Database migrations completed");
            Arc::new(db)
        }
        None => {
            warn!("DATABASE_URL not set, using the in-memory store; data is lost on restart");
            Arc::new(MemoryStore::default())
        }
    };

    // STEP 6: catalog cache
    let cache = match &config.redis_url {
        Some(url) => {
            let cache = CatalogCache::connect(url).await?;
            info!("Connected to Redis");
            cache
        }
        None => {
            info!("REDIS_URL not set, catalog cache disabled");
            CatalogCache::disabled()
        }
    };

    // STEP 7: payment gateway client
    let gateway = HttpGateway::new(&config.payment)?;

    let state = Arc::new(AppState {
        store,
        gateway: Arc::new(gateway),
        cache,
        notifier: Arc::new(LogNotifier),
        payment: config.payment.clone(),
        metrics_handle,
    });

    // STEP 8: serve
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "Farm Market is listening");

    axum::serve(listener, app(state)).await?;

    Ok(())
}

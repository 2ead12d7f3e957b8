// =============================================================================
// HANDLERS MODULE
// =============================================================================
// HTTP layer: extract, delegate to the workflow modules, serialize.
//
// AXUM EXTRACTORS USED:
// - State<Arc<AppState>>: shared store, gateway, cache
// - Actor: caller identity from the X-User-Id / X-User-Role headers
// - Path / Query / Json: request data
//
// Handlers hold no business rules; every check lives in orders, inventory,
// payment, admin or users so that it is covered by their unit tests.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{MatchedPath, Path, Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::AppResult;
use crate::inventory::DEFAULT_PER_PAGE;
use crate::models::*;
use crate::users::Actor;
use crate::{admin, inventory, metrics, orders, payment, users, AppState};

// =============================================================================
// REQUEST METRICS
// =============================================================================
/// Records count and latency of every routed request, labelled with the
/// route template rather than the raw path.
pub async fn track_metrics(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;

    metrics::record_http_request(
        &method,
        &endpoint,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// Liveness probe
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "farm-market".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe. The cache only counts when one is configured.
///
/// GET /ready
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let store = state.store.health_check().await;
    let cache = state.cache.ping().await;

    let ready = store && cache.unwrap_or(true);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "not_ready" }.to_string(),
            checks: ReadinessChecks { store, cache },
        }),
    )
}

/// Prometheus metrics endpoint
///
/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// USERS
// =============================================================================

/// POST /users/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<User>)> {
    let user = users::register_user(state.store.as_ref(), request).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// POST /users/forgot-password
///
/// Answers the same whether or not the email is registered.
pub async fn forgot_password(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ForgotPasswordRequest>,
) -> AppResult<Json<Value>> {
    users::request_password_reset(state.store.as_ref(), state.notifier.as_ref(), &request.email)
        .await?;
    Ok(Json(json!({
        "message": "If the email is registered, a reset link has been sent"
    })))
}

/// POST /users/reset-password
pub async fn reset_password(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ResetPasswordRequest>,
) -> AppResult<Json<Value>> {
    users::reset_password(state.store.as_ref(), request).await?;
    Ok(Json(json!({ "message": "Password updated" })))
}

// =============================================================================
// ORDERS
// =============================================================================

/// Checkout: gateway order plus Pending order with reserved stock.
///
/// POST /orders/create-order
///
/// # Request Body
/// ```json
/// {
///   "userId": "…",
///   "items": [{ "productId": "…", "name": "Tomato", "price": 50, "quantity": 3 }],
///   "totalAmount": 150
/// }
/// ```
///
/// # Response
/// ```json
/// { "orderId": "order_N5…", "amount": 15000, "currency": "INR" }
/// ```
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateOrderRequest>,
) -> AppResult<Json<CheckoutResponse>> {
    let response = orders::create_checkout_order(
        state.store.as_ref(),
        state.gateway.as_ref(),
        &state.cache,
        &state.payment.currency,
        request,
    )
    .await?;
    Ok(Json(response))
}

/// POST /orders/verify-payment
pub async fn verify_payment(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VerifyPaymentRequest>,
) -> AppResult<Json<VerifyPaymentResponse>> {
    payment::verify_payment(state.store.as_ref(), &state.payment.key_secret, &request).await?;
    Ok(Json(VerifyPaymentResponse { success: true }))
}

/// GET /orders/previous/:user_id
pub async fn previous_orders(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<Vec<Order>>> {
    Ok(Json(orders::orders_for_user(state.store.as_ref(), user_id).await?))
}

/// GET /orders/:order_id
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> AppResult<Json<Order>> {
    Ok(Json(orders::get_order(state.store.as_ref(), &order_id).await?))
}

/// POST /orders/:order_id/cancel
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(order_id): Path<String>,
) -> AppResult<Json<Order>> {
    let order =
        orders::cancel_order(state.store.as_ref(), &state.cache, &actor, &order_id).await?;
    Ok(Json(order))
}

/// POST /orders/:order_id/refund
pub async fn refund_order(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(order_id): Path<String>,
) -> AppResult<Json<Order>> {
    Ok(Json(orders::refund_order(state.store.as_ref(), &actor, &order_id).await?))
}

/// PATCH /orders/:order_id/delivery-status
pub async fn update_delivery_status(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(order_id): Path<String>,
    Json(request): Json<DeliveryStatusRequest>,
) -> AppResult<Json<Order>> {
    let order = orders::update_delivery_status(
        state.store.as_ref(),
        &actor,
        &order_id,
        &request.delivery_status,
    )
    .await?;
    Ok(Json(order))
}

// =============================================================================
// CATALOG
// =============================================================================

/// Query parameters for the product list
///
/// # Example
/// GET /product?category=vegetables&page=2&per_page=50
#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub category: Option<String>,

    /// Page number (1-indexed, default: 1)
    #[serde(default = "default_page")]
    pub page: i32,

    /// Items per page (default: 20, max: 100)
    #[serde(default = "default_per_page")]
    pub per_page: i32,
}

fn default_page() -> i32 {
    1
}
fn default_per_page() -> i32 {
    DEFAULT_PER_PAGE
}

/// GET /product
pub async fn list_products(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> AppResult<Json<ProductListResponse>> {
    let page = inventory::list_products(
        state.store.as_ref(),
        params.category.as_deref(),
        params.page,
        params.per_page,
    )
    .await?;
    Ok(Json(page))
}

/// POST /product
pub async fn create_product(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(request): Json<CreateProductRequest>,
) -> AppResult<(StatusCode, Json<Product>)> {
    let product = inventory::create_product(state.store.as_ref(), &actor, request).await?;
    Ok((StatusCode::CREATED, Json(product)))
}

/// GET /product/:id
pub async fn get_product(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Product>> {
    Ok(Json(
        inventory::get_product(state.store.as_ref(), &state.cache, id).await?,
    ))
}

/// Storefront fallback that decrements catalog stock by product name.
///
/// PATCH /product/update-stock
pub async fn update_stock(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UpdateStockRequest>,
) -> AppResult<Json<UpdateStockResponse>> {
    let updated =
        inventory::bulk_update_stock(state.store.as_ref(), &state.cache, &request.items).await?;
    Ok(Json(UpdateStockResponse { updated }))
}

// =============================================================================
// FARMERS
// =============================================================================

/// POST /farmer
pub async fn register_farmer(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(request): Json<FarmerProfileRequest>,
) -> AppResult<(StatusCode, Json<Farmer>)> {
    let farmer = inventory::register_farmer(state.store.as_ref(), &actor, request).await?;
    Ok((StatusCode::CREATED, Json(farmer)))
}

/// GET /farmer/:farmer_id
pub async fn get_farmer(
    State(state): State<Arc<AppState>>,
    Path(farmer_id): Path<Uuid>,
) -> AppResult<Json<FarmerDetail>> {
    Ok(Json(inventory::get_farmer(state.store.as_ref(), farmer_id).await?))
}

/// POST /farmer/:farmer_id/products
pub async fn add_farmer_product(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(farmer_id): Path<Uuid>,
    Json(request): Json<FarmerProductRequest>,
) -> AppResult<(StatusCode, Json<FarmerProduct>)> {
    let product =
        inventory::add_farmer_product(state.store.as_ref(), &actor, farmer_id, request).await?;
    Ok((StatusCode::CREATED, Json(product)))
}

/// PATCH /farmer/:farmer_id/products/:product_id/stock
pub async fn set_farmer_product_stock(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path((farmer_id, product_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<SetStockRequest>,
) -> AppResult<Json<FarmerProduct>> {
    let product = inventory::update_farmer_product_stock(
        state.store.as_ref(),
        &actor,
        farmer_id,
        product_id,
        request.quantity,
    )
    .await?;
    Ok(Json(product))
}

/// DELETE /farmer/:farmer_id/products/:product_id
pub async fn delete_farmer_product(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path((farmer_id, product_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    inventory::delete_farmer_product(state.store.as_ref(), &actor, farmer_id, product_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /farmer/:farmer_id/orders
pub async fn farmer_orders(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(farmer_id): Path<Uuid>,
) -> AppResult<Json<Vec<Order>>> {
    Ok(Json(
        inventory::farmer_orders(state.store.as_ref(), &actor, farmer_id).await?,
    ))
}

/// POST /farmer/orders/admin
pub async fn create_admin_order(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(request): Json<AdminOrderRequest>,
) -> AppResult<(StatusCode, Json<AdminOrderResponse>)> {
    let order = admin::create_admin_order(
        state.store.as_ref(),
        &actor,
        &state.payment.currency,
        request,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(AdminOrderResponse { order })))
}

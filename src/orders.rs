// =============================================================================
// ORDERS MODULE
// =============================================================================
// Checkout and the order lifecycle.
//
// CHECKOUT FLOW:
// 1. Validate the cart and its total
// 2. Ask the payment gateway for an order handle (no retry)
// 3. Reserve stock and persist the Pending order in one unit of work
//
// The gateway call happens before anything is written. A gateway failure
// leaves no trace; a stock failure after it leaves only an unpaid gateway
// order behind, which expires on the gateway side.
//
// STATE MACHINE:
//   Pending --verified payment--> Paid --refund--> Refunded
//   Pending --cancel--> Cancelled (stock restored)
// Delivery status only moves forward, and only on Pending or Paid orders.
// =============================================================================

use std::time::Instant;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::cache::CatalogCache;
use crate::db::Store;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{
    CheckoutResponse, CreateOrderRequest, DeliveryStatus, Order, OrderItem, OrderStatus,
    Reservation, Role, StockLevel, StockRef,
};
use crate::payment::PaymentGateway;
use crate::users::{authorize, Actor};

/// Converts a major-unit amount to the gateway's minor units (paise, cents).
pub fn to_minor_units(amount: Decimal) -> AppResult<i64> {
    amount
        .checked_mul(Decimal::ONE_HUNDRED)
        .map(|minor| minor.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|minor| minor.to_i64())
        .ok_or_else(|| AppError::Validation(format!("amount {} is out of range", amount)))
}

/// Validated cart: snapshot lines, their reservations and the total.
fn checkout_lines(request: &CreateOrderRequest) -> AppResult<(Vec<OrderItem>, Vec<Reservation>, Decimal)> {
    let items = match request.items.as_deref() {
        Some(items) if !items.is_empty() => items,
        _ => return Err(AppError::Validation("items must not be empty".to_string())),
    };
    let claimed_total = request
        .total_amount
        .ok_or_else(|| AppError::Validation("totalAmount is required".to_string()))?;

    let mut lines = Vec::with_capacity(items.len());
    let mut reservations = Vec::with_capacity(items.len());
    for item in items {
        let name = item.product_name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("every item needs a name".to_string()));
        }
        if item.unit_price <= Decimal::ZERO {
            return Err(AppError::Validation(format!("price of '{}' must be greater than 0", name)));
        }
        if item.quantity < 1 {
            return Err(AppError::Validation(format!("quantity of '{}' must be at least 1", name)));
        }

        let stock = match item.product_id {
            Some(product_id) => StockRef::Catalog { product_id },
            None => StockRef::CatalogByName {
                name: name.to_string(),
            },
        };
        reservations.push(Reservation {
            stock,
            quantity: item.quantity,
        });
        lines.push(OrderItem {
            product_name: name.to_string(),
            unit_price: item.unit_price,
            quantity: item.quantity,
            product_id: item.product_id,
            farmer_id: None,
        });
    }

    let total = OrderItem::total(&lines)?;
    if total != claimed_total {
        return Err(AppError::Validation(format!(
            "totalAmount {} does not match the items total {}",
            claimed_total, total
        )));
    }
    Ok((lines, reservations, total))
}

async fn invalidate_levels(cache: &CatalogCache, levels: &[StockLevel]) {
    for level in levels {
        cache.invalidate(level.product_id).await;
    }
}

// =============================================================================
// CHECKOUT
// =============================================================================

#[instrument(skip_all, fields(user_id = ?request.user_id))]
pub async fn create_checkout_order(
    store: &dyn Store,
    gateway: &dyn PaymentGateway,
    cache: &CatalogCache,
    currency: &str,
    request: CreateOrderRequest,
) -> AppResult<CheckoutResponse> {
    let buyer_id = request
        .user_id
        .ok_or_else(|| AppError::Validation("userId is required".to_string()))?;
    let (items, reservations, total) = checkout_lines(&request)?;

    store
        .get_user(buyer_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {}", buyer_id)))?;

    let amount_minor = to_minor_units(total)?;
    let receipt = format!("rcpt_{}", &Uuid::new_v4().simple().to_string()[..20]);
    let gateway_order = gateway.create_order(amount_minor, currency, &receipt).await?;

    let order = Order::pending(gateway_order.id.clone(), buyer_id, items, currency, None)?;

    let start = Instant::now();
    let placed = store.place_order(&order, &reservations).await;
    metrics::record_db_query("place_order", start.elapsed().as_secs_f64());
    metrics::record_reservation("catalog", placed.is_ok());
    let levels = placed?;

    invalidate_levels(cache, &levels).await;
    metrics::record_order_created("checkout");
    info!(
        order_id = %order.order_id,
        buyer_id = %buyer_id,
        total = %order.total_amount,
        "Checkout order created"
    );

    Ok(CheckoutResponse {
        order_id: gateway_order.id,
        amount: gateway_order.amount,
        currency: gateway_order.currency,
    })
}

// =============================================================================
// READS
// =============================================================================

/// Newest first.
pub async fn orders_for_user(store: &dyn Store, user_id: Uuid) -> AppResult<Vec<Order>> {
    let start = Instant::now();
    let orders = store.orders_for_buyer(user_id).await?;
    metrics::record_db_query("orders_for_buyer", start.elapsed().as_secs_f64());
    Ok(orders)
}

pub async fn get_order(store: &dyn Store, order_id: &str) -> AppResult<Order> {
    store
        .get_order(order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {}", order_id)))
}

// =============================================================================
// LIFECYCLE
// =============================================================================

/// `Pending -> Cancelled`, returning every line's quantity to its counter.
pub async fn cancel_order(
    store: &dyn Store,
    cache: &CatalogCache,
    actor: &Actor,
    order_id: &str,
) -> AppResult<Order> {
    authorize(store, actor, &[Role::Admin]).await?;
    let order = store.cancel_order(order_id).await?;

    for item in &order.items {
        if let (Some(product_id), None) = (item.product_id, item.farmer_id) {
            cache.invalidate(product_id).await;
        }
    }
    info!(order_id, by = %actor.user_id, "Order cancelled, stock restored");
    Ok(order)
}

/// `Paid -> Refunded`. Stock stays where it is.
pub async fn refund_order(store: &dyn Store, actor: &Actor, order_id: &str) -> AppResult<Order> {
    authorize(store, actor, &[Role::Admin]).await?;
    let order = store
        .transition_status(order_id, OrderStatus::Paid, OrderStatus::Refunded)
        .await?;
    info!(order_id, by = %actor.user_id, "Order refunded");
    Ok(order)
}

/// Moves delivery forward. Admins may update any order, farmers only
/// orders carrying one of their lines.
pub async fn update_delivery_status(
    store: &dyn Store,
    actor: &Actor,
    order_id: &str,
    status: &str,
) -> AppResult<Order> {
    let next: DeliveryStatus = status.parse().map_err(AppError::Validation)?;
    let user = authorize(store, actor, &[Role::Admin, Role::Farmer]).await?;
    let order = get_order(store, order_id).await?;

    if user.role == Role::Farmer {
        let farmer = store
            .find_farmer_by_user(user.id)
            .await?
            .ok_or_else(|| AppError::Forbidden("no farmer profile".to_string()))?;
        if !order.involves_farmer(farmer.id) {
            return Err(AppError::Forbidden(format!(
                "order {} has no items from this farmer",
                order_id
            )));
        }
    }

    if !matches!(order.status, OrderStatus::Pending | OrderStatus::Paid) {
        return Err(AppError::Conflict(format!(
            "order {} is {} and cannot progress",
            order_id, order.status
        )));
    }
    let allowed = order.delivery_status.next_options();
    if !allowed.contains(&next) {
        let allowed: Vec<&str> = allowed.iter().map(DeliveryStatus::as_str).collect();
        return Err(AppError::Conflict(format!(
            "delivery status cannot move from {} to {} (allowed: {})",
            order.delivery_status,
            next,
            allowed.join(", ")
        )));
    }

    let updated = store
        .set_delivery_status(order_id, order.delivery_status, next)
        .await?;
    info!(order_id, from = %order.delivery_status, to = %next, "Delivery status updated");
    Ok(updated)
}

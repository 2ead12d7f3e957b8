// =============================================================================
// ADMIN ORDERS
// =============================================================================
// Orders placed by an administrator on behalf of a buyer, typically for
// phone or cash-on-delivery sales. They bypass the payment gateway: the
// order is priced from the farmer's current listing, stock is taken from
// the farmer's counter, and the chosen payment method is recorded.
// =============================================================================

use std::time::Instant;

use tracing::{info, warn};
use uuid::Uuid;

use crate::db::Store;
use crate::error::{AppError, AppResult};
use crate::inventory;
use crate::metrics;
use crate::models::{AdminOrderRequest, Order, OrderItem, PaymentMethod, Role, StockRef};
use crate::users::{authorize, Actor};

fn required<T>(value: Option<T>, field: &str) -> AppResult<T> {
    value.ok_or_else(|| AppError::Validation(format!("{} is required", field)))
}

pub async fn create_admin_order(
    store: &dyn Store,
    actor: &Actor,
    currency: &str,
    request: AdminOrderRequest,
) -> AppResult<Order> {
    authorize(store, actor, &[Role::Admin]).await?;

    let buyer_id = required(request.user_id, "userId")?;
    let farmer_id = required(request.farmer_id, "farmerId")?;
    let product_id = required(request.product_id, "productId")?;
    let quantity = required(request.quantity, "quantity")?;
    if quantity < 1 {
        return Err(AppError::Validation("quantity must be at least 1".to_string()));
    }
    let payment_method: PaymentMethod = required(request.payment_method, "paymentMethod")?
        .trim()
        .parse()
        .map_err(AppError::Validation)?;

    store
        .get_user(buyer_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {}", buyer_id)))?;
    store
        .get_farmer(farmer_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("farmer {}", farmer_id)))?;
    let product = store
        .get_farmer_product(farmer_id, product_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("farmer {} product {}", farmer_id, product_id)))?;

    let order = Order::pending(
        format!("order_{}", Uuid::new_v4().simple()),
        buyer_id,
        vec![OrderItem {
            product_name: product.name.clone(),
            unit_price: product.price,
            quantity,
            product_id: Some(product.id),
            farmer_id: Some(farmer_id),
        }],
        currency,
        Some(payment_method),
    )?;
    let stock = StockRef::Farmer {
        farmer_id,
        product_id,
    };

    // Single counter: take the stock first, give it back if the order
    // cannot be written.
    inventory::reserve_stock(store, &stock, quantity).await?;

    let start = Instant::now();
    let placed = store.place_order(&order, &[]).await;
    metrics::record_db_query("place_order", start.elapsed().as_secs_f64());
    if let Err(err) = placed {
        warn!(order_id = %order.order_id, error = %err, "Admin order not written, releasing stock");
        inventory::release_stock(store, &stock, quantity).await?;
        return Err(err);
    }

    metrics::record_order_created("admin");
    info!(
        order_id = %order.order_id,
        by = %actor.user_id,
        buyer_id = %buyer_id,
        payment_method = %payment_method,
        "Admin order created"
    );
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeliveryStatus, OrderStatus};
    use crate::testing::{seeded_store, Fixture};

    fn request(fx: &Fixture, quantity: i32, method: &str) -> AdminOrderRequest {
        AdminOrderRequest {
            user_id: Some(fx.customer.id),
            product_id: Some(fx.mango.id),
            farmer_id: Some(fx.farmer.id),
            quantity: Some(quantity),
            payment_method: Some(method.to_string()),
        }
    }

    fn admin(fx: &Fixture) -> Actor {
        Actor { user_id: fx.admin.id, role: Role::Admin }
    }

    async fn mango_stock(fx: &Fixture) -> i32 {
        fx.store
            .get_farmer_product(fx.farmer.id, fx.mango.id)
            .await
            .unwrap()
            .unwrap()
            .quantity
    }

    #[tokio::test]
    async fn admin_order_prices_from_listing_and_takes_farmer_stock() {
        let fx = seeded_store().await;
        let order = create_admin_order(fx.store.as_ref(), &admin(&fx), "INR", request(&fx, 2, "Cash on Delivery"))
            .await
            .unwrap();

        assert!(order.order_id.starts_with("order_"));
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.delivery_status, DeliveryStatus::NotDispatched);
        assert_eq!(order.payment_method, Some(PaymentMethod::CashOnDelivery));
        assert_eq!(order.total_amount, "240.00".parse().unwrap());
        assert!(order.signature.is_none());
        assert_eq!(mango_stock(&fx).await, 18);

        let stored = fx.store.get_order(&order.order_id).await.unwrap().unwrap();
        assert_eq!(stored, order);
    }

    #[tokio::test]
    async fn scenario_d_admin_order_is_pending_without_payment() {
        let fx = seeded_store().await;
        fx.store
            .set_farmer_product_stock(fx.farmer.id, fx.mango.id, 10)
            .await
            .unwrap();

        let order = create_admin_order(fx.store.as_ref(), &admin(&fx), "INR", request(&fx, 3, "UPI"))
            .await
            .unwrap();

        assert_eq!(mango_stock(&fx).await, 7);
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(order.payment_id.is_none());
        assert_eq!(order.buyer_id, fx.customer.id);
        assert_eq!(order.items[0].farmer_id, Some(fx.farmer.id));

        let stored = fx.store.get_order(&order.order_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn non_admin_cannot_create_orders() {
        let fx = seeded_store().await;
        for actor in [
            Actor { user_id: fx.farmer_user.id, role: Role::Farmer },
            Actor { user_id: fx.customer.id, role: Role::Customer },
            // Forged claim: stored role is CUSTOMER
            Actor { user_id: fx.customer.id, role: Role::Admin },
        ] {
            let err = create_admin_order(fx.store.as_ref(), &actor, "INR", request(&fx, 1, "UPI"))
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Forbidden(_)));
        }
        assert_eq!(mango_stock(&fx).await, 20);
        assert!(fx.store.orders_for_buyer(fx.customer.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn admin_order_input_is_validated() {
        let fx = seeded_store().await;
        for req in [request(&fx, 0, "UPI"), request(&fx, 1, "Bitcoin"), AdminOrderRequest::default()] {
            assert!(matches!(
                create_admin_order(fx.store.as_ref(), &admin(&fx), "INR", req).await,
                Err(AppError::Validation(_))
            ));
        }

        let mut unknown_product = request(&fx, 1, "UPI");
        unknown_product.product_id = Some(Uuid::new_v4());
        assert!(matches!(
            create_admin_order(fx.store.as_ref(), &admin(&fx), "INR", unknown_product).await,
            Err(AppError::NotFound(_))
        ));

        let too_many = request(&fx, 21, "Net Banking");
        assert!(matches!(
            create_admin_order(fx.store.as_ref(), &admin(&fx), "INR", too_many).await,
            Err(AppError::InsufficientStock { available: 20, requested: 21, .. })
        ));
        assert_eq!(mango_stock(&fx).await, 20);
    }
}

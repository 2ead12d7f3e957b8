// =============================================================================
// MEMORY STORE
// =============================================================================
// In-process `Store` used when no DATABASE_URL is configured and by tests.
// Every operation runs under one mutex and never awaits while holding it,
// so each call is atomic with respect to every other call.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::db::{mark_paid_conflict, page_offset, Store};
use crate::error::{AppError, AppResult};
use crate::models::{
    DeliveryStatus, Farmer, FarmerProduct, Order, OrderStatus, Product, Reservation, StockLevel,
    StockRef, User,
};

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    farmers: HashMap<Uuid, Farmer>,
    farmer_products: HashMap<Uuid, FarmerProduct>,
    products: HashMap<Uuid, Product>,
    orders: HashMap<String, Order>,
}

impl Inner {
    /// Mutable access to the `quantity` and `name` of a counter.
    fn counter(&mut self, stock: &StockRef) -> Option<(Uuid, &str, &mut i32)> {
        match stock {
            StockRef::Catalog { product_id } => self
                .products
                .get_mut(product_id)
                .map(|p| (p.id, p.name.as_str(), &mut p.quantity)),
            StockRef::CatalogByName { name } => self
                .products
                .values_mut()
                .find(|p| &p.name == name)
                .map(|p| (p.id, p.name.as_str(), &mut p.quantity)),
            StockRef::Farmer {
                farmer_id,
                product_id,
            } => self
                .farmer_products
                .get_mut(product_id)
                .filter(|p| p.farmer_id == *farmer_id)
                .map(|p| (p.id, p.name.as_str(), &mut p.quantity)),
        }
    }

    fn decrement(&mut self, stock: &StockRef, quantity: i32) -> AppResult<StockLevel> {
        let (id, name, counter) = self
            .counter(stock)
            .ok_or_else(|| AppError::NotFound(stock.to_string()))?;
        if *counter < quantity {
            return Err(AppError::InsufficientStock {
                product: name.to_string(),
                available: *counter,
                requested: quantity,
            });
        }
        *counter -= quantity;
        Ok(StockLevel {
            product_id: id,
            name: name.to_string(),
            remaining: *counter,
        })
    }

    fn increment(&mut self, stock: &StockRef, quantity: i32) -> Option<StockLevel> {
        let (id, name, counter) = self.counter(stock)?;
        *counter += quantity;
        Some(StockLevel {
            product_id: id,
            name: name.to_string(),
            remaining: *counter,
        })
    }

    /// Applies every reservation or none of them.
    fn decrement_all(&mut self, reservations: &[Reservation]) -> AppResult<Vec<StockLevel>> {
        let mut applied: Vec<&Reservation> = Vec::with_capacity(reservations.len());
        let mut levels = Vec::with_capacity(reservations.len());
        for r in reservations {
            match self.decrement(&r.stock, r.quantity) {
                Ok(level) => {
                    applied.push(r);
                    levels.push(level);
                }
                Err(err) => {
                    for done in applied {
                        self.increment(&done.stock, done.quantity);
                    }
                    return Err(err);
                }
            }
        }
        Ok(levels)
    }

    fn order_mut(&mut self, order_id: &str) -> AppResult<&mut Order> {
        self.orders
            .get_mut(order_id)
            .ok_or_else(|| AppError::NotFound(format!("order {}", order_id)))
    }
}

fn newest_first(mut orders: Vec<Order>) -> Vec<Order> {
    orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    orders
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_user(&self, user: &User) -> AppResult<()> {
        let mut inner = self.inner.lock();
        if inner.users.values().any(|u| u.email == user.email) {
            return Err(AppError::Conflict(format!(
                "email {} is already registered",
                user.email
            )));
        }
        inner.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> AppResult<Option<User>> {
        Ok(self.inner.lock().users.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<User>> {
        Ok(self
            .inner
            .lock()
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn set_reset_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires: DateTime<Utc>,
    ) -> AppResult<()> {
        if let Some(user) = self.inner.lock().users.get_mut(&user_id) {
            user.reset_token = Some(token.to_string());
            user.reset_token_expires = Some(expires);
        }
        Ok(())
    }

    async fn consume_reset_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
        new_hash: &str,
    ) -> AppResult<bool> {
        let mut inner = self.inner.lock();
        let user = inner.users.values_mut().find(|u| {
            u.reset_token.as_deref() == Some(token)
                && u.reset_token_expires.is_some_and(|exp| exp > now)
        });
        Ok(match user {
            Some(user) => {
                user.password_hash = new_hash.to_string();
                user.reset_token = None;
                user.reset_token_expires = None;
                true
            }
            None => false,
        })
    }

    async fn insert_farmer(&self, farmer: &Farmer) -> AppResult<()> {
        let mut inner = self.inner.lock();
        if inner.farmers.values().any(|f| f.user_id == farmer.user_id) {
            return Err(AppError::Conflict(
                "user already has a farmer profile".to_string(),
            ));
        }
        inner.farmers.insert(farmer.id, farmer.clone());
        Ok(())
    }

    async fn get_farmer(&self, id: Uuid) -> AppResult<Option<Farmer>> {
        Ok(self.inner.lock().farmers.get(&id).cloned())
    }

    async fn find_farmer_by_user(&self, user_id: Uuid) -> AppResult<Option<Farmer>> {
        Ok(self
            .inner
            .lock()
            .farmers
            .values()
            .find(|f| f.user_id == user_id)
            .cloned())
    }

    async fn farmer_products(&self, farmer_id: Uuid) -> AppResult<Vec<FarmerProduct>> {
        let mut products: Vec<_> = self
            .inner
            .lock()
            .farmer_products
            .values()
            .filter(|p| p.farmer_id == farmer_id)
            .cloned()
            .collect();
        products.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(products)
    }

    async fn get_farmer_product(
        &self,
        farmer_id: Uuid,
        product_id: Uuid,
    ) -> AppResult<Option<FarmerProduct>> {
        Ok(self
            .inner
            .lock()
            .farmer_products
            .get(&product_id)
            .filter(|p| p.farmer_id == farmer_id)
            .cloned())
    }

    async fn insert_farmer_product(&self, product: &FarmerProduct) -> AppResult<()> {
        let mut inner = self.inner.lock();
        if !inner.farmers.contains_key(&product.farmer_id) {
            return Err(AppError::NotFound(format!("farmer {}", product.farmer_id)));
        }
        inner.farmer_products.insert(product.id, product.clone());
        Ok(())
    }

    async fn set_farmer_product_stock(
        &self,
        farmer_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> AppResult<Option<FarmerProduct>> {
        let mut inner = self.inner.lock();
        Ok(inner
            .farmer_products
            .get_mut(&product_id)
            .filter(|p| p.farmer_id == farmer_id)
            .map(|p| {
                p.quantity = quantity;
                p.updated_at = Utc::now();
                p.clone()
            }))
    }

    async fn delete_farmer_product(&self, farmer_id: Uuid, product_id: Uuid) -> AppResult<bool> {
        let mut inner = self.inner.lock();
        let owned = inner
            .farmer_products
            .get(&product_id)
            .is_some_and(|p| p.farmer_id == farmer_id);
        if owned {
            inner.farmer_products.remove(&product_id);
        }
        Ok(owned)
    }

    async fn insert_product(&self, product: &Product) -> AppResult<()> {
        let mut inner = self.inner.lock();
        if inner.products.values().any(|p| p.name == product.name) {
            return Err(AppError::Conflict(format!(
                "product '{}' already exists",
                product.name
            )));
        }
        inner.products.insert(product.id, product.clone());
        Ok(())
    }

    async fn get_product(&self, id: Uuid) -> AppResult<Option<Product>> {
        Ok(self.inner.lock().products.get(&id).cloned())
    }

    async fn list_products(
        &self,
        category: Option<&str>,
        page: i32,
        per_page: i32,
    ) -> AppResult<(Vec<Product>, i64)> {
        let mut matching: Vec<Product> = self
            .inner
            .lock()
            .products
            .values()
            .filter(|p| category.map_or(true, |c| p.category == c))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.name.cmp(&b.name));

        let total = matching.len() as i64;
        let offset = page_offset(page, per_page);
        let items = matching
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(per_page).unwrap_or(0))
            .collect();
        Ok((items, total))
    }

    async fn reserve_stock(&self, stock: &StockRef, quantity: i32) -> AppResult<StockLevel> {
        self.inner.lock().decrement(stock, quantity)
    }

    async fn release_stock(
        &self,
        stock: &StockRef,
        quantity: i32,
    ) -> AppResult<Option<StockLevel>> {
        Ok(self.inner.lock().increment(stock, quantity))
    }

    async fn reserve_all(&self, reservations: &[Reservation]) -> AppResult<Vec<StockLevel>> {
        self.inner.lock().decrement_all(reservations)
    }

    async fn place_order(
        &self,
        order: &Order,
        reservations: &[Reservation],
    ) -> AppResult<Vec<StockLevel>> {
        let mut inner = self.inner.lock();
        if inner.orders.contains_key(&order.order_id) {
            return Err(AppError::Conflict(format!(
                "order {} already exists",
                order.order_id
            )));
        }
        let levels = inner.decrement_all(reservations)?;
        inner.orders.insert(order.order_id.clone(), order.clone());
        Ok(levels)
    }

    async fn get_order(&self, order_id: &str) -> AppResult<Option<Order>> {
        Ok(self.inner.lock().orders.get(order_id).cloned())
    }

    async fn orders_for_buyer(&self, buyer_id: Uuid) -> AppResult<Vec<Order>> {
        let orders = self
            .inner
            .lock()
            .orders
            .values()
            .filter(|o| o.buyer_id == buyer_id)
            .cloned()
            .collect();
        Ok(newest_first(orders))
    }

    async fn orders_for_farmer(&self, farmer_id: Uuid) -> AppResult<Vec<Order>> {
        let orders = self
            .inner
            .lock()
            .orders
            .values()
            .filter(|o| o.involves_farmer(farmer_id))
            .cloned()
            .collect();
        Ok(newest_first(orders))
    }

    async fn mark_paid(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> AppResult<Order> {
        let mut inner = self.inner.lock();
        let order = inner.order_mut(order_id)?;
        let same_payment = order.payment_id.as_deref() == Some(payment_id);
        match order.status {
            OrderStatus::Paid if same_payment => {}
            OrderStatus::Pending => {
                order.status = OrderStatus::Paid;
                order.payment_id = Some(payment_id.to_string());
                order.signature = Some(signature.to_string());
                order.updated_at = Utc::now();
            }
            _ => return Err(mark_paid_conflict(order, payment_id)),
        }
        Ok(order.clone())
    }

    async fn cancel_order(&self, order_id: &str) -> AppResult<Order> {
        let mut inner = self.inner.lock();
        let order = inner.order_mut(order_id)?;
        if order.status != OrderStatus::Pending {
            return Err(AppError::Conflict(format!(
                "order {} is {} and cannot be cancelled",
                order_id, order.status
            )));
        }
        order.status = OrderStatus::Cancelled;
        order.updated_at = Utc::now();
        let order = order.clone();

        for item in &order.items {
            let Some(stock) = item.stock_source() else {
                continue;
            };
            if inner.increment(&stock, item.quantity).is_none() {
                tracing::warn!(order_id, stock = %stock, "Stock counter gone, not restored");
            }
        }
        Ok(order)
    }

    async fn transition_status(
        &self,
        order_id: &str,
        from: OrderStatus,
        to: OrderStatus,
    ) -> AppResult<Order> {
        let mut inner = self.inner.lock();
        let order = inner.order_mut(order_id)?;
        if order.status != from {
            return Err(AppError::Conflict(format!(
                "order {} is {}, expected {}",
                order_id, order.status, from
            )));
        }
        order.status = to;
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn set_delivery_status(
        &self,
        order_id: &str,
        from: DeliveryStatus,
        to: DeliveryStatus,
    ) -> AppResult<Order> {
        let mut inner = self.inner.lock();
        let order = inner.order_mut(order_id)?;
        let active = matches!(order.status, OrderStatus::Pending | OrderStatus::Paid);
        if !active || order.delivery_status != from {
            return Err(AppError::Conflict(format!(
                "order {} is {} / {}, delivery cannot move to {}",
                order_id, order.status, order.delivery_status, to
            )));
        }
        order.delivery_status = to;
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

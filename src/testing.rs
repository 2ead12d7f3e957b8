// Shared fixtures and doubles for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::cache::CatalogCache;
use crate::config::PaymentConfig;
use crate::db::Store;
use crate::error::{AppError, AppResult};
use crate::memory::MemoryStore;
use crate::metrics;
use crate::models::{Farmer, FarmerProduct, Order, OrderItem, Product, Role, SaleUnit, User};
use crate::payment::{GatewayOrder, PaymentGateway};
use crate::users::Notifier;
use crate::AppState;

pub const TEST_SECRET: &str = "test-secret";

pub fn product(name: &str, quantity: i32) -> Product {
    let now = Utc::now();
    Product {
        id: Uuid::new_v4(),
        name: name.to_string(),
        price: "50".parse().unwrap(),
        quantity,
        category: "vegetables".to_string(),
        unit: SaleUnit::Kg,
        farmer_id: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn user(role: Role, email: &str) -> User {
    User {
        id: Uuid::new_v4(),
        name: email.split('@').next().unwrap_or(email).to_string(),
        email: email.to_string(),
        password_hash: String::new(),
        role,
        reset_token: None,
        reset_token_expires: None,
        created_at: Utc::now(),
    }
}

/// A store with one user per role, a farmer with one listing and a small
/// catalog.
pub struct Fixture {
    pub store: Arc<dyn Store>,
    pub admin: User,
    pub customer: User,
    pub farmer_user: User,
    pub farmer: Farmer,
    /// Farmer listing: "Alphonso Mango", 120.00, 20 in stock
    pub mango: FarmerProduct,
    /// Catalog: "Tomato", 50, 10 in stock
    pub tomato: Product,
    /// Catalog: "Onion", 50, 2 in stock
    pub onion: Product,
}

pub async fn seeded_store() -> Fixture {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::default());

    let admin = user(Role::Admin, "admin@example.com");
    let customer = user(Role::Customer, "customer@example.com");
    let farmer_user = user(Role::Farmer, "farmer@example.com");
    for u in [&admin, &customer, &farmer_user] {
        store.insert_user(u).await.unwrap();
    }

    let now = Utc::now();
    let farmer = Farmer {
        id: Uuid::new_v4(),
        user_id: farmer_user.id,
        farm_name: "Green Acres".to_string(),
        location: "Ratnagiri".to_string(),
        latitude: Some(16.99),
        longitude: Some(73.31),
        farm_size: Some(4.5),
        certifications: vec!["organic".to_string()],
        created_at: now,
    };
    store.insert_farmer(&farmer).await.unwrap();

    let mango = FarmerProduct {
        id: Uuid::new_v4(),
        farmer_id: farmer.id,
        name: "Alphonso Mango".to_string(),
        price: "120.00".parse().unwrap(),
        quantity: 20,
        category: "fruits".to_string(),
        unit: SaleUnit::Dozen,
        created_at: now,
        updated_at: now,
    };
    store.insert_farmer_product(&mango).await.unwrap();

    let tomato = product("Tomato", 10);
    let onion = product("Onion", 2);
    store.insert_product(&tomato).await.unwrap();
    store.insert_product(&onion).await.unwrap();

    Fixture {
        store,
        admin,
        customer,
        farmer_user,
        farmer,
        mango,
        tomato,
        onion,
    }
}

/// Persists a Pending order for the fixture customer with a single line
/// priced at `total`. No stock is taken.
pub async fn pending_order(fx: &Fixture, order_id: &str, total: &str) -> Order {
    let order = Order::pending(
        order_id,
        fx.customer.id,
        vec![OrderItem {
            product_name: "Basket".to_string(),
            unit_price: total.parse().unwrap(),
            quantity: 1,
            product_id: None,
            farmer_id: None,
        }],
        "INR",
        None,
    )
    .unwrap();
    fx.store.place_order(&order, &[]).await.unwrap();
    order
}

// =============================================================================
// DOUBLES
// =============================================================================

/// Gateway double that either hands out sequential order ids or fails.
pub struct ScriptedGateway {
    fail: bool,
    calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn succeeding() -> Self {
        Self {
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_order(
        &self,
        amount_minor: i64,
        currency: &str,
        _receipt: &str,
    ) -> AppResult<GatewayOrder> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail {
            return Err(AppError::Gateway("request timed out".to_string()));
        }
        Ok(GatewayOrder {
            id: format!("order_test{}", n),
            amount: amount_minor,
            currency: currency.to_string(),
        })
    }
}

/// Notifier that keeps every issued token.
#[derive(Default)]
pub struct RecordingNotifier {
    tokens: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn last_token(&self) -> Option<String> {
        self.tokens.lock().last().cloned()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn password_reset(
        &self,
        _user: &User,
        token: &str,
        _expires: DateTime<Utc>,
    ) -> AppResult<()> {
        self.tokens.lock().push(token.to_string());
        Ok(())
    }
}

pub fn payment_config() -> PaymentConfig {
    PaymentConfig {
        base_url: "http://gateway.invalid".to_string(),
        key_id: "rzp_test".to_string(),
        key_secret: TEST_SECRET.to_string(),
        timeout: Duration::from_secs(1),
        currency: "INR".to_string(),
    }
}

/// Application state over the fixture store, with no cache.
pub fn app_state(
    fx: &Fixture,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
) -> Arc<AppState> {
    Arc::new(AppState {
        store: fx.store.clone(),
        gateway,
        cache: CatalogCache::disabled(),
        notifier,
        payment: payment_config(),
        metrics_handle: metrics::detached_handle(),
    })
}

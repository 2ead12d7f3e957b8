// =============================================================================
// DATABASE MODULE
// =============================================================================
// The `Store` trait is the persistence seam of the service. `Database` is
// the PostgreSQL implementation; `memory::MemoryStore` is the in-process one.
//
// CONSISTENCY RULES:
// - Stock counters only move through conditional updates
//   (`... WHERE quantity >= $n`), never read-modify-write
// - Stock decrements and the order insert they pay for share one
//   transaction (`place_order`); any failure rolls both back
// - Order status changes are compare-and-set on the current status
// =============================================================================

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{
    postgres::{PgArguments, PgPoolOptions, PgRow},
    query::Query,
    types::Json,
    PgConnection, PgPool, Postgres, Row,
};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    DeliveryStatus, Farmer, FarmerProduct, Order, OrderItem, OrderStatus, Product, Reservation,
    SaleUnit, StockLevel, StockRef, User,
};

// =============================================================================
// STORE TRAIT
// =============================================================================
#[async_trait]
pub trait Store: Send + Sync {
    // ----- users -----
    /// Fails with `Conflict` when the email is taken.
    async fn insert_user(&self, user: &User) -> AppResult<()>;
    async fn get_user(&self, id: Uuid) -> AppResult<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<User>>;
    async fn set_reset_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires: DateTime<Utc>,
    ) -> AppResult<()>;
    /// Consumes an unexpired token and replaces the password hash.
    /// Returns `false` when no user holds a valid token.
    async fn consume_reset_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
        new_hash: &str,
    ) -> AppResult<bool>;

    // ----- farmers -----
    /// Fails with `Conflict` when the user already has a profile.
    async fn insert_farmer(&self, farmer: &Farmer) -> AppResult<()>;
    async fn get_farmer(&self, id: Uuid) -> AppResult<Option<Farmer>>;
    async fn find_farmer_by_user(&self, user_id: Uuid) -> AppResult<Option<Farmer>>;
    async fn farmer_products(&self, farmer_id: Uuid) -> AppResult<Vec<FarmerProduct>>;
    async fn get_farmer_product(
        &self,
        farmer_id: Uuid,
        product_id: Uuid,
    ) -> AppResult<Option<FarmerProduct>>;
    async fn insert_farmer_product(&self, product: &FarmerProduct) -> AppResult<()>;
    async fn set_farmer_product_stock(
        &self,
        farmer_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> AppResult<Option<FarmerProduct>>;
    async fn delete_farmer_product(&self, farmer_id: Uuid, product_id: Uuid) -> AppResult<bool>;

    // ----- catalog -----
    /// Fails with `Conflict` when the name is taken.
    async fn insert_product(&self, product: &Product) -> AppResult<()>;
    async fn get_product(&self, id: Uuid) -> AppResult<Option<Product>>;
    async fn list_products(
        &self,
        category: Option<&str>,
        page: i32,
        per_page: i32,
    ) -> AppResult<(Vec<Product>, i64)>;

    // ----- inventory -----
    /// Atomically takes `quantity` from a counter, or fails with
    /// `InsufficientStock` / `NotFound` leaving it untouched.
    async fn reserve_stock(&self, stock: &StockRef, quantity: i32) -> AppResult<StockLevel>;
    /// Credits a counter back. `None` when the counter no longer exists.
    async fn release_stock(&self, stock: &StockRef, quantity: i32)
        -> AppResult<Option<StockLevel>>;
    /// All-or-nothing version of `reserve_stock`.
    async fn reserve_all(&self, reservations: &[Reservation]) -> AppResult<Vec<StockLevel>>;

    // ----- orders -----
    /// Applies every reservation and inserts the order as one unit of work.
    /// Returns the counters' levels after the decrements.
    async fn place_order(
        &self,
        order: &Order,
        reservations: &[Reservation],
    ) -> AppResult<Vec<StockLevel>>;
    async fn get_order(&self, order_id: &str) -> AppResult<Option<Order>>;
    /// Newest first.
    async fn orders_for_buyer(&self, buyer_id: Uuid) -> AppResult<Vec<Order>>;
    /// Orders with at least one line from this farmer, newest first.
    async fn orders_for_farmer(&self, farmer_id: Uuid) -> AppResult<Vec<Order>>;
    /// `Pending -> Paid`, idempotent for a repeated identical payment.
    async fn mark_paid(&self, order_id: &str, payment_id: &str, signature: &str)
        -> AppResult<Order>;
    /// `Pending -> Cancelled`, restoring stock in the same unit of work.
    async fn cancel_order(&self, order_id: &str) -> AppResult<Order>;
    /// Compare-and-set on the order status.
    async fn transition_status(
        &self,
        order_id: &str,
        from: OrderStatus,
        to: OrderStatus,
    ) -> AppResult<Order>;
    /// Compare-and-set on the delivery status of a Pending or Paid order.
    async fn set_delivery_status(
        &self,
        order_id: &str,
        from: DeliveryStatus,
        to: DeliveryStatus,
    ) -> AppResult<Order>;

    async fn health_check(&self) -> bool;
}

/// Rows to skip for a 1-based page. Widened to `i64` so any page number
/// is representable; pages past the end simply come back empty.
pub(crate) fn page_offset(page: i32, per_page: i32) -> i64 {
    (i64::from(page.max(1)) - 1) * i64::from(per_page.max(0))
}

/// Shared rule for a refused `mark_paid`: explains why an existing order
/// could not move to Paid.
pub(crate) fn mark_paid_conflict(order: &Order, payment_id: &str) -> AppError {
    match (order.status, order.payment_id.as_deref()) {
        (OrderStatus::Paid, Some(existing)) if existing != payment_id => AppError::Conflict(
            format!("order {} is already paid by another payment", order.order_id),
        ),
        (status, _) => AppError::Conflict(format!(
            "order {} is {} and cannot be marked paid",
            order.order_id, status
        )),
    }
}

// -----------------------------------------------------------------------------
// DATABASE WRAPPER
// -----------------------------------------------------------------------------
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

const ORDER_COLUMNS: &str = "order_id, buyer_id, items, total_amount, currency, status, \
     delivery_status, payment_method, payment_id, signature, created_at, updated_at";

const PRODUCT_COLUMNS: &str =
    "id, name, price, quantity, category, unit, farmer_id, created_at, updated_at";

const FARMER_PRODUCT_COLUMNS: &str =
    "id, farmer_id, name, price, quantity, category, unit, created_at, updated_at";

const USER_COLUMNS: &str =
    "id, name, email, password_hash, role, reset_token, reset_token_expires, created_at";

const FARMER_COLUMNS: &str =
    "id, user_id, farm_name, location, latitude, longitude, farm_size, certifications, created_at";

impl Database {
    // -------------------------------------------------------------------------
    // CONNECTION
    // -------------------------------------------------------------------------
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    // -------------------------------------------------------------------------
    // MIGRATIONS
    // -------------------------------------------------------------------------
    /// Creates the schema if missing and seeds the catalog when empty.
    /// Every statement is idempotent.
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id UUID PRIMARY KEY,
                name VARCHAR(120) NOT NULL,
                email VARCHAR(255) UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                role VARCHAR(20) NOT NULL,
                reset_token VARCHAR(64),
                reset_token_expires TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS farmers (
                id UUID PRIMARY KEY,
                user_id UUID UNIQUE NOT NULL REFERENCES users(id),
                farm_name VARCHAR(120) NOT NULL,
                location VARCHAR(200) NOT NULL,
                latitude DOUBLE PRECISION,
                longitude DOUBLE PRECISION,
                farm_size DOUBLE PRECISION,
                certifications TEXT[] NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS products (
                id UUID PRIMARY KEY,
                name VARCHAR(120) UNIQUE NOT NULL,
                price NUMERIC(12, 2) NOT NULL,
                quantity INTEGER NOT NULL DEFAULT 0,
                category VARCHAR(60) NOT NULL,
                unit VARCHAR(10) NOT NULL DEFAULT 'kg',
                farmer_id UUID REFERENCES farmers(id),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT products_quantity_non_negative CHECK (quantity >= 0)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS farmer_products (
                id UUID PRIMARY KEY,
                farmer_id UUID NOT NULL REFERENCES farmers(id) ON DELETE CASCADE,
                name VARCHAR(120) NOT NULL,
                price NUMERIC(12, 2) NOT NULL,
                quantity INTEGER NOT NULL DEFAULT 0,
                category VARCHAR(60) NOT NULL,
                unit VARCHAR(10) NOT NULL DEFAULT 'kg',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT farmer_products_quantity_non_negative CHECK (quantity >= 0)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                order_id VARCHAR(64) PRIMARY KEY,
                buyer_id UUID NOT NULL REFERENCES users(id),
                items JSONB NOT NULL,
                total_amount NUMERIC(12, 2) NOT NULL,
                currency VARCHAR(3) NOT NULL,
                status VARCHAR(20) NOT NULL,
                delivery_status VARCHAR(30) NOT NULL,
                payment_method VARCHAR(30),
                payment_id VARCHAR(64),
                signature VARCHAR(128),
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_orders_buyer ON orders(buyer_id, created_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_orders_items ON orders USING GIN (items jsonb_path_ops)",
            "CREATE INDEX IF NOT EXISTS idx_farmer_products_farmer ON farmer_products(farmer_id)",
            "CREATE INDEX IF NOT EXISTS idx_products_category ON products(category)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to apply schema statement")?;
        }

        self.seed_catalog().await?;

        Ok(())
    }

    /// Seed a few storefront products when the catalog is empty
    async fn seed_catalog(&self) -> anyhow::Result<()> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM products")
            .fetch_one(&self.pool)
            .await?;

        if count.0 > 0 {
            return Ok(());
        }

        let sample_items = [
            ("Tomato", "40.00", 120, "vegetables", SaleUnit::Kg),
            ("Onion", "35.00", 200, "vegetables", SaleUnit::Kg),
            ("Alphonso Mango", "600.00", 40, "fruits", SaleUnit::Dozen),
            ("Spinach", "25.00", 80, "leafy-greens", SaleUnit::Bundle),
            ("Farm Eggs", "90.00", 60, "dairy", SaleUnit::Dozen),
        ];

        for (name, price, quantity, category, unit) in sample_items {
            let price: Decimal = price.parse().context("invalid seed price")?;
            sqlx::query(
                r#"
                INSERT INTO products (id, name, price, quantity, category, unit)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (name) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(name)
            .bind(price)
            .bind(quantity)
            .bind(category)
            .bind(unit.as_str())
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn fetch_order(&self, conn: &mut PgConnection, order_id: &str) -> AppResult<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = $1");
        let row = sqlx::query(&sql)
            .bind(order_id)
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }
}

// =============================================================================
// STOCK COUNTER SQL
// =============================================================================
// One conditional UPDATE per counter kind. The WHERE clause re-evaluates
// against the latest row version after a lock wait, so two concurrent
// decrements can never both pass on stale stock.

/// Table and WHERE clause for a counter, numbering placeholders from `first`.
fn counter_target(stock: &StockRef, first: usize) -> (&'static str, String) {
    match stock {
        StockRef::Catalog { .. } => ("products", format!("id = ${first}")),
        StockRef::CatalogByName { .. } => ("products", format!("name = ${first}")),
        StockRef::Farmer { .. } => (
            "farmer_products",
            format!("farmer_id = ${} AND id = ${}", first, first + 1),
        ),
    }
}

fn bind_counter<'q>(
    query: Query<'q, Postgres, PgArguments>,
    stock: &'q StockRef,
) -> Query<'q, Postgres, PgArguments> {
    match stock {
        StockRef::Catalog { product_id } => query.bind(*product_id),
        StockRef::CatalogByName { name } => query.bind(name.as_str()),
        StockRef::Farmer {
            farmer_id,
            product_id,
        } => query.bind(*farmer_id).bind(*product_id),
    }
}

fn level_from_row(row: &PgRow) -> AppResult<StockLevel> {
    Ok(StockLevel {
        product_id: row.try_get("id")?,
        name: row.try_get("name")?,
        remaining: row.try_get("quantity")?,
    })
}

async fn decrement(conn: &mut PgConnection, stock: &StockRef, quantity: i32) -> AppResult<StockLevel> {
    let (table, filter) = counter_target(stock, 2);

    let update = format!(
        "UPDATE {table} SET quantity = quantity - $1, updated_at = NOW() \
         WHERE {filter} AND quantity >= $1 RETURNING id, name, quantity"
    );
    let row = bind_counter(sqlx::query(&update).bind(quantity), stock)
        .fetch_optional(&mut *conn)
        .await?;

    if let Some(row) = row {
        return level_from_row(&row);
    }

    // Nothing updated: tell missing from short
    let (_, filter) = counter_target(stock, 1);
    let lookup = format!("SELECT id, name, quantity FROM {table} WHERE {filter}");
    let current = bind_counter(sqlx::query(&lookup), stock)
        .fetch_optional(&mut *conn)
        .await?;

    match current {
        Some(row) => {
            let level = level_from_row(&row)?;
            Err(AppError::InsufficientStock {
                product: level.name,
                available: level.remaining,
                requested: quantity,
            })
        }
        None => Err(AppError::NotFound(stock.to_string())),
    }
}

async fn increment(
    conn: &mut PgConnection,
    stock: &StockRef,
    quantity: i32,
) -> AppResult<Option<StockLevel>> {
    let (table, filter) = counter_target(stock, 2);
    let update = format!(
        "UPDATE {table} SET quantity = quantity + $1, updated_at = NOW() \
         WHERE {filter} RETURNING id, name, quantity"
    );
    let row = bind_counter(sqlx::query(&update).bind(quantity), stock)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(level_from_row).transpose()
}

// =============================================================================
// ROW MAPPING
// =============================================================================

fn parse_label<T: std::str::FromStr<Err = String>>(value: &str) -> AppResult<T> {
    value.parse().map_err(AppError::Internal)
}

fn user_from_row(row: &PgRow) -> AppResult<User> {
    let role: String = row.try_get("role")?;
    Ok(User {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        role: parse_label(&role)?,
        reset_token: row.try_get("reset_token")?,
        reset_token_expires: row.try_get("reset_token_expires")?,
        created_at: row.try_get("created_at")?,
    })
}

fn farmer_from_row(row: &PgRow) -> AppResult<Farmer> {
    Ok(Farmer {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        farm_name: row.try_get("farm_name")?,
        location: row.try_get("location")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        farm_size: row.try_get("farm_size")?,
        certifications: row.try_get("certifications")?,
        created_at: row.try_get("created_at")?,
    })
}

fn product_from_row(row: &PgRow) -> AppResult<Product> {
    let unit: String = row.try_get("unit")?;
    Ok(Product {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        price: row.try_get("price")?,
        quantity: row.try_get("quantity")?,
        category: row.try_get("category")?,
        unit: parse_label(&unit)?,
        farmer_id: row.try_get("farmer_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn farmer_product_from_row(row: &PgRow) -> AppResult<FarmerProduct> {
    let unit: String = row.try_get("unit")?;
    Ok(FarmerProduct {
        id: row.try_get("id")?,
        farmer_id: row.try_get("farmer_id")?,
        name: row.try_get("name")?,
        price: row.try_get("price")?,
        quantity: row.try_get("quantity")?,
        category: row.try_get("category")?,
        unit: parse_label(&unit)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn order_from_row(row: &PgRow) -> AppResult<Order> {
    let items: Json<Vec<OrderItem>> = row.try_get("items")?;
    let status: String = row.try_get("status")?;
    let delivery_status: String = row.try_get("delivery_status")?;
    let payment_method: Option<String> = row.try_get("payment_method")?;
    Ok(Order {
        order_id: row.try_get("order_id")?,
        buyer_id: row.try_get("buyer_id")?,
        items: items.0,
        total_amount: row.try_get("total_amount")?,
        currency: row.try_get("currency")?,
        status: parse_label(&status)?,
        delivery_status: parse_label(&delivery_status)?,
        payment_method: payment_method.as_deref().map(parse_label).transpose()?,
        payment_id: row.try_get("payment_id")?,
        signature: row.try_get("signature")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Maps a unique-constraint violation to `Conflict`.
fn unique_violation(err: sqlx::Error, what: impl Into<String>) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            AppError::Conflict(what.into())
        }
        _ => AppError::Database(err),
    }
}

// =============================================================================
// STORE IMPLEMENTATION
// =============================================================================
#[async_trait]
impl Store for Database {
    // -------------------------------------------------------------------------
    // USERS
    // -------------------------------------------------------------------------
    async fn insert_user(&self, user: &User) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, name, email, password_hash, role, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_violation(e, format!("email {} is already registered", user.email)))?;
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> AppResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        let row = sqlx::query(&sql).bind(email).fetch_optional(&self.pool).await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn set_reset_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query("UPDATE users SET reset_token = $1, reset_token_expires = $2 WHERE id = $3")
            .bind(token)
            .bind(expires)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn consume_reset_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
        new_hash: &str,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET password_hash = $1, reset_token = NULL, reset_token_expires = NULL
            WHERE reset_token = $2 AND reset_token_expires > $3
            "#,
        )
        .bind(new_hash)
        .bind(token)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // -------------------------------------------------------------------------
    // FARMERS
    // -------------------------------------------------------------------------
    async fn insert_farmer(&self, farmer: &Farmer) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO farmers
                (id, user_id, farm_name, location, latitude, longitude, farm_size,
                 certifications, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(farmer.id)
        .bind(farmer.user_id)
        .bind(&farmer.farm_name)
        .bind(&farmer.location)
        .bind(farmer.latitude)
        .bind(farmer.longitude)
        .bind(farmer.farm_size)
        .bind(&farmer.certifications)
        .bind(farmer.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_violation(e, "user already has a farmer profile"))?;
        Ok(())
    }

    async fn get_farmer(&self, id: Uuid) -> AppResult<Option<Farmer>> {
        let sql = format!("SELECT {FARMER_COLUMNS} FROM farmers WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(farmer_from_row).transpose()
    }

    async fn find_farmer_by_user(&self, user_id: Uuid) -> AppResult<Option<Farmer>> {
        let sql = format!("SELECT {FARMER_COLUMNS} FROM farmers WHERE user_id = $1");
        let row = sqlx::query(&sql).bind(user_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(farmer_from_row).transpose()
    }

    async fn farmer_products(&self, farmer_id: Uuid) -> AppResult<Vec<FarmerProduct>> {
        let sql = format!(
            "SELECT {FARMER_PRODUCT_COLUMNS} FROM farmer_products WHERE farmer_id = $1 ORDER BY name ASC"
        );
        let rows = sqlx::query(&sql).bind(farmer_id).fetch_all(&self.pool).await?;
        rows.iter().map(farmer_product_from_row).collect()
    }

    async fn get_farmer_product(
        &self,
        farmer_id: Uuid,
        product_id: Uuid,
    ) -> AppResult<Option<FarmerProduct>> {
        let sql = format!(
            "SELECT {FARMER_PRODUCT_COLUMNS} FROM farmer_products WHERE farmer_id = $1 AND id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(farmer_id)
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(farmer_product_from_row).transpose()
    }

    async fn insert_farmer_product(&self, product: &FarmerProduct) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO farmer_products
                (id, farmer_id, name, price, quantity, category, unit, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(product.id)
        .bind(product.farmer_id)
        .bind(&product.name)
        .bind(product.price)
        .bind(product.quantity)
        .bind(&product.category)
        .bind(product.unit.as_str())
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_farmer_product_stock(
        &self,
        farmer_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> AppResult<Option<FarmerProduct>> {
        let sql = format!(
            "UPDATE farmer_products SET quantity = $1, updated_at = NOW() \
             WHERE farmer_id = $2 AND id = $3 RETURNING {FARMER_PRODUCT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(quantity)
            .bind(farmer_id)
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(farmer_product_from_row).transpose()
    }

    async fn delete_farmer_product(&self, farmer_id: Uuid, product_id: Uuid) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM farmer_products WHERE farmer_id = $1 AND id = $2")
            .bind(farmer_id)
            .bind(product_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // -------------------------------------------------------------------------
    // CATALOG
    // -------------------------------------------------------------------------
    async fn insert_product(&self, product: &Product) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO products
                (id, name, price, quantity, category, unit, farmer_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(product.id)
        .bind(&product.name)
        .bind(product.price)
        .bind(product.quantity)
        .bind(&product.category)
        .bind(product.unit.as_str())
        .bind(product.farmer_id)
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_violation(e, format!("product '{}' already exists", product.name)))?;
        Ok(())
    }

    async fn get_product(&self, id: Uuid) -> AppResult<Option<Product>> {
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn list_products(
        &self,
        category: Option<&str>,
        page: i32,
        per_page: i32,
    ) -> AppResult<(Vec<Product>, i64)> {
        let offset = page_offset(page, per_page);

        // NULL category means "all"
        let sql = format!(
            "SELECT {PRODUCT_COLUMNS} FROM products \
             WHERE ($1::TEXT IS NULL OR category = $1) \
             ORDER BY name ASC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(category)
            .bind(per_page)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        let items = rows.iter().map(product_from_row).collect::<AppResult<Vec<_>>>()?;

        let total: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM products WHERE ($1::TEXT IS NULL OR category = $1)",
        )
        .bind(category)
        .fetch_one(&self.pool)
        .await?;

        Ok((items, total.0))
    }

    // -------------------------------------------------------------------------
    // INVENTORY
    // -------------------------------------------------------------------------
    async fn reserve_stock(&self, stock: &StockRef, quantity: i32) -> AppResult<StockLevel> {
        let mut conn = self.pool.acquire().await?;
        decrement(&mut conn, stock, quantity).await
    }

    async fn release_stock(
        &self,
        stock: &StockRef,
        quantity: i32,
    ) -> AppResult<Option<StockLevel>> {
        let mut conn = self.pool.acquire().await?;
        increment(&mut conn, stock, quantity).await
    }

    async fn reserve_all(&self, reservations: &[Reservation]) -> AppResult<Vec<StockLevel>> {
        let mut tx = self.pool.begin().await?;
        let mut levels = Vec::with_capacity(reservations.len());
        for r in reservations {
            // Early return drops `tx`, which rolls back
            levels.push(decrement(&mut tx, &r.stock, r.quantity).await?);
        }
        tx.commit().await?;
        Ok(levels)
    }

    // -------------------------------------------------------------------------
    // ORDERS
    // -------------------------------------------------------------------------
    async fn place_order(
        &self,
        order: &Order,
        reservations: &[Reservation],
    ) -> AppResult<Vec<StockLevel>> {
        let mut tx = self.pool.begin().await?;

        let mut levels = Vec::with_capacity(reservations.len());
        for r in reservations {
            levels.push(decrement(&mut tx, &r.stock, r.quantity).await?);
        }

        sqlx::query(
            r#"
            INSERT INTO orders
                (order_id, buyer_id, items, total_amount, currency, status, delivery_status,
                 payment_method, payment_id, signature, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&order.order_id)
        .bind(order.buyer_id)
        .bind(Json(&order.items))
        .bind(order.total_amount)
        .bind(&order.currency)
        .bind(order.status.as_str())
        .bind(order.delivery_status.as_str())
        .bind(order.payment_method.map(|m| m.as_str()))
        .bind(&order.payment_id)
        .bind(&order.signature)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| unique_violation(e, format!("order {} already exists", order.order_id)))?;

        tx.commit().await?;
        Ok(levels)
    }

    async fn get_order(&self, order_id: &str) -> AppResult<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        self.fetch_order(&mut conn, order_id).await
    }

    async fn orders_for_buyer(&self, buyer_id: Uuid) -> AppResult<Vec<Order>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE buyer_id = $1 ORDER BY created_at DESC"
        );
        let rows = sqlx::query(&sql).bind(buyer_id).fetch_all(&self.pool).await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn orders_for_farmer(&self, farmer_id: Uuid) -> AppResult<Vec<Order>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE items @> $1 ORDER BY created_at DESC"
        );
        let probe = serde_json::json!([{ "farmerId": farmer_id }]);
        let rows = sqlx::query(&sql)
            .bind(Json(probe))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn mark_paid(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> AppResult<Order> {
        let mut conn = self.pool.acquire().await?;

        // A repeated identical payment matches the second arm and rewrites
        // the same values, so the call is idempotent.
        let sql = format!(
            "UPDATE orders SET status = 'Paid', payment_id = $2, signature = $3, \
             updated_at = CASE WHEN status = 'Paid' THEN updated_at ELSE NOW() END \
             WHERE order_id = $1 \
               AND (status = 'Pending' OR (status = 'Paid' AND payment_id = $2)) \
             RETURNING {ORDER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(order_id)
            .bind(payment_id)
            .bind(signature)
            .fetch_optional(&mut *conn)
            .await?;

        if let Some(row) = row {
            return order_from_row(&row);
        }

        match self.fetch_order(&mut conn, order_id).await? {
            Some(order) => Err(mark_paid_conflict(&order, payment_id)),
            None => Err(AppError::NotFound(format!("order {}", order_id))),
        }
    }

    async fn cancel_order(&self, order_id: &str) -> AppResult<Order> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "UPDATE orders SET status = 'Cancelled', updated_at = NOW() \
             WHERE order_id = $1 AND status = 'Pending' RETURNING {ORDER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(order_id)
            .fetch_optional(&mut *tx)
            .await?;

        let order = match row {
            Some(row) => order_from_row(&row)?,
            None => {
                return match self.fetch_order(&mut tx, order_id).await? {
                    Some(order) => Err(AppError::Conflict(format!(
                        "order {} is {} and cannot be cancelled",
                        order_id, order.status
                    ))),
                    None => Err(AppError::NotFound(format!("order {}", order_id))),
                };
            }
        };

        for item in &order.items {
            let Some(stock) = item.stock_source() else {
                continue;
            };
            if increment(&mut tx, &stock, item.quantity).await?.is_none() {
                tracing::warn!(order_id, stock = %stock, "Stock counter gone, not restored");
            }
        }

        tx.commit().await?;
        Ok(order)
    }

    async fn transition_status(
        &self,
        order_id: &str,
        from: OrderStatus,
        to: OrderStatus,
    ) -> AppResult<Order> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!(
            "UPDATE orders SET status = $3, updated_at = NOW() \
             WHERE order_id = $1 AND status = $2 RETURNING {ORDER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(order_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .fetch_optional(&mut *conn)
            .await?;

        if let Some(row) = row {
            return order_from_row(&row);
        }

        match self.fetch_order(&mut conn, order_id).await? {
            Some(order) => Err(AppError::Conflict(format!(
                "order {} is {}, expected {}",
                order_id, order.status, from
            ))),
            None => Err(AppError::NotFound(format!("order {}", order_id))),
        }
    }

    async fn set_delivery_status(
        &self,
        order_id: &str,
        from: DeliveryStatus,
        to: DeliveryStatus,
    ) -> AppResult<Order> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!(
            "UPDATE orders SET delivery_status = $3, updated_at = NOW() \
             WHERE order_id = $1 AND delivery_status = $2 AND status IN ('Pending', 'Paid') \
             RETURNING {ORDER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(order_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .fetch_optional(&mut *conn)
            .await?;

        if let Some(row) = row {
            return order_from_row(&row);
        }

        match self.fetch_order(&mut conn, order_id).await? {
            Some(order) => Err(AppError::Conflict(format!(
                "order {} is {} / {}, delivery cannot move to {}",
                order_id, order.status, order.delivery_status, to
            ))),
            None => Err(AppError::NotFound(format!("order {}", order_id))),
        }
    }

    // -------------------------------------------------------------------------
    // HEALTH CHECK
    // -------------------------------------------------------------------------
    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_offset_never_overflows() {
        assert_eq!(page_offset(1, 20), 0);
        assert_eq!(page_offset(3, 20), 40);
        assert_eq!(page_offset(0, 20), 0);
        assert_eq!(page_offset(i32::MAX, 100), (i64::from(i32::MAX) - 1) * 100);
    }
}

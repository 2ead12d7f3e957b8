// =============================================================================
// INVENTORY MODULE
// =============================================================================
// Stock counters, the storefront catalog and farmer listings.
//
// STOCK MODEL:
// - Two kinds of counter: catalog products and farmer-owned products
// - Both are addressed by a StockRef and decremented by the same store path
// - A decrement either applies in full or fails with InsufficientStock;
//   stock is never negative
//
// Every stock change on a catalog product drops its cache entry.
// =============================================================================

use std::time::Instant;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::cache::CatalogCache;
use crate::db::Store;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{
    Farmer, FarmerDetail, FarmerProduct, FarmerProductRequest, FarmerProfileRequest, Order,
    CreateProductRequest, Product, ProductListResponse, Reservation, Role, StockDecrement,
    StockLevel, StockRef,
};
use crate::users::{authorize, Actor};

pub const DEFAULT_PER_PAGE: i32 = 20;
pub const MAX_PER_PAGE: i32 = 100;

// =============================================================================
// STOCK COUNTERS
// =============================================================================

/// Takes `quantity` units from one counter.
pub async fn reserve_stock(
    store: &dyn Store,
    stock: &StockRef,
    quantity: i32,
) -> AppResult<StockLevel> {
    if quantity < 1 {
        return Err(AppError::Validation("quantity must be at least 1".to_string()));
    }

    let start = Instant::now();
    let result = store.reserve_stock(stock, quantity).await;
    metrics::record_db_query("reserve_stock", start.elapsed().as_secs_f64());
    metrics::record_reservation(stock.source(), result.is_ok());

    match &result {
        Ok(level) => info!(stock = %stock, quantity, remaining = level.remaining, "Stock reserved"),
        Err(AppError::InsufficientStock { available, .. }) => {
            warn!(stock = %stock, quantity, available, "Insufficient stock")
        }
        Err(_) => {}
    }
    result
}

/// Credits units back to a counter. A counter that no longer exists is
/// skipped with a warning.
pub async fn release_stock(
    store: &dyn Store,
    stock: &StockRef,
    quantity: i32,
) -> AppResult<Option<StockLevel>> {
    if quantity < 1 {
        return Err(AppError::Validation("quantity must be at least 1".to_string()));
    }
    let level = store.release_stock(stock, quantity).await?;
    match &level {
        Some(level) => info!(stock = %stock, quantity, remaining = level.remaining, "Stock released"),
        None => warn!(stock = %stock, quantity, "Stock counter gone, nothing released"),
    }
    Ok(level)
}

/// Decrements catalog products by name, all or nothing.
pub async fn bulk_update_stock(
    store: &dyn Store,
    cache: &CatalogCache,
    items: &[StockDecrement],
) -> AppResult<Vec<StockLevel>> {
    if items.is_empty() {
        return Err(AppError::Validation("items must not be empty".to_string()));
    }

    let reservations = items
        .iter()
        .map(|item| {
            let name = item.name.trim();
            if name.is_empty() {
                return Err(AppError::Validation("product name is required".to_string()));
            }
            if item.quantity < 1 {
                return Err(AppError::Validation(format!(
                    "quantity for '{}' must be at least 1",
                    name
                )));
            }
            Ok(Reservation {
                stock: StockRef::CatalogByName {
                    name: name.to_string(),
                },
                quantity: item.quantity,
            })
        })
        .collect::<AppResult<Vec<_>>>()?;

    let start = Instant::now();
    let result = store.reserve_all(&reservations).await;
    metrics::record_db_query("reserve_all", start.elapsed().as_secs_f64());
    metrics::record_reservation("catalog", result.is_ok());

    let levels = result?;
    for level in &levels {
        cache.invalidate(level.product_id).await;
    }
    info!(lines = levels.len(), "Bulk stock update applied");
    Ok(levels)
}

// =============================================================================
// CATALOG
// =============================================================================

fn require_positive_price(price: Decimal) -> AppResult<()> {
    if price <= Decimal::ZERO {
        return Err(AppError::Validation("price must be greater than 0".to_string()));
    }
    Ok(())
}

/// Adds a catalog product. Farmers may only list under their own profile.
pub async fn create_product(
    store: &dyn Store,
    actor: &Actor,
    request: CreateProductRequest,
) -> AppResult<Product> {
    let user = authorize(store, actor, &[Role::Admin, Role::Farmer]).await?;
    request.validate()?;
    require_positive_price(request.price)?;

    let farmer_id = match user.role {
        Role::Farmer => {
            let own = store
                .find_farmer_by_user(user.id)
                .await?
                .ok_or_else(|| AppError::Forbidden("register a farmer profile first".to_string()))?;
            if request.farmer_id.is_some_and(|id| id != own.id) {
                return Err(AppError::Forbidden(
                    "farmers may only list their own products".to_string(),
                ));
            }
            Some(own.id)
        }
        _ => match request.farmer_id {
            Some(id) => {
                store
                    .get_farmer(id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("farmer {}", id)))?;
                Some(id)
            }
            None => None,
        },
    };

    let now = Utc::now();
    let product = Product {
        id: Uuid::new_v4(),
        name: request.name.trim().to_string(),
        price: request.price,
        quantity: request.quantity,
        category: request.category.trim().to_lowercase(),
        unit: request.unit,
        farmer_id,
        created_at: now,
        updated_at: now,
    };
    store.insert_product(&product).await?;

    info!(product_id = %product.id, name = %product.name, "Catalog product created");
    Ok(product)
}

pub async fn list_products(
    store: &dyn Store,
    category: Option<&str>,
    page: i32,
    per_page: i32,
) -> AppResult<ProductListResponse> {
    let page = page.max(1);
    let per_page = per_page.clamp(1, MAX_PER_PAGE);
    let category = category
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty());

    let start = Instant::now();
    let (items, total) = store
        .list_products(category.as_deref(), page, per_page)
        .await?;
    metrics::record_db_query("list_products", start.elapsed().as_secs_f64());

    Ok(ProductListResponse {
        items,
        total,
        page,
        per_page,
    })
}

/// Cache first, then the store.
pub async fn get_product(
    store: &dyn Store,
    cache: &CatalogCache,
    product_id: Uuid,
) -> AppResult<Product> {
    if let Some(product) = cache.get(product_id).await {
        return Ok(product);
    }

    let start = Instant::now();
    let product = store
        .get_product(product_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("product {}", product_id)))?;
    metrics::record_db_query("get_product", start.elapsed().as_secs_f64());

    cache.put(&product).await;
    Ok(product)
}

// =============================================================================
// FARMERS
// =============================================================================

/// Loads a farmer the actor may manage: the owning farmer, or any admin.
async fn managed_farmer(store: &dyn Store, actor: &Actor, farmer_id: Uuid) -> AppResult<Farmer> {
    let user = authorize(store, actor, &[Role::Admin, Role::Farmer]).await?;
    let farmer = store
        .get_farmer(farmer_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("farmer {}", farmer_id)))?;

    if user.role == Role::Farmer && farmer.user_id != user.id {
        return Err(AppError::Forbidden(
            "farmers may only manage their own profile".to_string(),
        ));
    }
    Ok(farmer)
}

pub async fn register_farmer(
    store: &dyn Store,
    actor: &Actor,
    request: FarmerProfileRequest,
) -> AppResult<Farmer> {
    let user = authorize(store, actor, &[Role::Farmer]).await?;
    request.validate()?;

    let farmer = Farmer {
        id: Uuid::new_v4(),
        user_id: user.id,
        farm_name: request.farm_name.trim().to_string(),
        location: request.location.trim().to_string(),
        latitude: request.latitude,
        longitude: request.longitude,
        farm_size: request.farm_size,
        certifications: request.certifications,
        created_at: Utc::now(),
    };
    store.insert_farmer(&farmer).await?;

    info!(farmer_id = %farmer.id, user_id = %user.id, "Farmer registered");
    Ok(farmer)
}

pub async fn get_farmer(store: &dyn Store, farmer_id: Uuid) -> AppResult<FarmerDetail> {
    let farmer = store
        .get_farmer(farmer_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("farmer {}", farmer_id)))?;
    let products = store.farmer_products(farmer_id).await?;
    Ok(FarmerDetail { farmer, products })
}

pub async fn add_farmer_product(
    store: &dyn Store,
    actor: &Actor,
    farmer_id: Uuid,
    request: FarmerProductRequest,
) -> AppResult<FarmerProduct> {
    let farmer = managed_farmer(store, actor, farmer_id).await?;
    request.validate()?;
    require_positive_price(request.price)?;

    let now = Utc::now();
    let product = FarmerProduct {
        id: Uuid::new_v4(),
        farmer_id: farmer.id,
        name: request.name.trim().to_string(),
        price: request.price,
        quantity: request.quantity,
        category: request.category.trim().to_lowercase(),
        unit: request.unit,
        created_at: now,
        updated_at: now,
    };
    store.insert_farmer_product(&product).await?;

    info!(farmer_id = %farmer.id, product_id = %product.id, "Farmer product added");
    Ok(product)
}

/// Sets a farmer counter to an absolute value (restock or correction).
pub async fn update_farmer_product_stock(
    store: &dyn Store,
    actor: &Actor,
    farmer_id: Uuid,
    product_id: Uuid,
    quantity: i32,
) -> AppResult<FarmerProduct> {
    managed_farmer(store, actor, farmer_id).await?;
    if quantity < 0 {
        return Err(AppError::Validation("quantity must not be negative".to_string()));
    }

    let product = store
        .set_farmer_product_stock(farmer_id, product_id, quantity)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("farmer {} product {}", farmer_id, product_id)))?;

    info!(%farmer_id, %product_id, quantity, "Farmer stock set");
    Ok(product)
}

pub async fn delete_farmer_product(
    store: &dyn Store,
    actor: &Actor,
    farmer_id: Uuid,
    product_id: Uuid,
) -> AppResult<()> {
    managed_farmer(store, actor, farmer_id).await?;
    if !store.delete_farmer_product(farmer_id, product_id).await? {
        return Err(AppError::NotFound(format!(
            "farmer {} product {}",
            farmer_id, product_id
        )));
    }
    info!(%farmer_id, %product_id, "Farmer product deleted");
    Ok(())
}

/// Orders containing at least one of the farmer's lines, newest first.
pub async fn farmer_orders(
    store: &dyn Store,
    actor: &Actor,
    farmer_id: Uuid,
) -> AppResult<Vec<Order>> {
    managed_farmer(store, actor, farmer_id).await?;
    store.orders_for_farmer(farmer_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seeded_store, user, Fixture};

    fn admin(fx: &Fixture) -> Actor {
        Actor { user_id: fx.admin.id, role: Role::Admin }
    }

    fn farmer(fx: &Fixture) -> Actor {
        Actor { user_id: fx.farmer_user.id, role: Role::Farmer }
    }

    fn decrement(name: &str, quantity: i32) -> StockDecrement {
        StockDecrement {
            name: name.to_string(),
            quantity,
        }
    }

    #[tokio::test]
    async fn reserve_takes_stock_until_exhausted() {
        let fx = seeded_store().await;
        let stock = StockRef::Catalog { product_id: fx.tomato.id };

        let level = reserve_stock(fx.store.as_ref(), &stock, 7).await.unwrap();
        assert_eq!(level.remaining, 3);

        let err = reserve_stock(fx.store.as_ref(), &stock, 4).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::InsufficientStock { available: 3, requested: 4, .. }
        ));
        let level = reserve_stock(fx.store.as_ref(), &stock, 3).await.unwrap();
        assert_eq!(level.remaining, 0);
    }

    #[tokio::test]
    async fn reserve_rejects_non_positive_quantity() {
        let fx = seeded_store().await;
        let stock = StockRef::Catalog { product_id: fx.tomato.id };
        assert!(matches!(
            reserve_stock(fx.store.as_ref(), &stock, 0).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn farmer_counters_use_the_same_rules() {
        let fx = seeded_store().await;
        let stock = StockRef::Farmer {
            farmer_id: fx.farmer.id,
            product_id: fx.mango.id,
        };
        assert_eq!(reserve_stock(fx.store.as_ref(), &stock, 20).await.unwrap().remaining, 0);
        assert!(matches!(
            reserve_stock(fx.store.as_ref(), &stock, 1).await,
            Err(AppError::InsufficientStock { .. })
        ));

        let released = release_stock(fx.store.as_ref(), &stock, 5).await.unwrap().unwrap();
        assert_eq!(released.remaining, 5);

        // Wrong owner does not address the counter
        let foreign = StockRef::Farmer {
            farmer_id: Uuid::new_v4(),
            product_id: fx.mango.id,
        };
        assert!(matches!(
            reserve_stock(fx.store.as_ref(), &foreign, 1).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn bulk_update_is_all_or_nothing() {
        let fx = seeded_store().await;
        let cache = CatalogCache::disabled();

        let err = bulk_update_stock(
            fx.store.as_ref(),
            &cache,
            &[decrement("Tomato", 4), decrement("Onion", 3)],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::InsufficientStock { .. }));
        assert_eq!(fx.store.get_product(fx.tomato.id).await.unwrap().unwrap().quantity, 10);

        let levels = bulk_update_stock(
            fx.store.as_ref(),
            &cache,
            &[decrement("Tomato", 4), decrement("Onion", 2)],
        )
        .await
        .unwrap();
        assert_eq!(levels.iter().map(|l| l.remaining).collect::<Vec<_>>(), vec![6, 0]);
    }

    #[tokio::test]
    async fn bulk_update_validates_lines() {
        let fx = seeded_store().await;
        let cache = CatalogCache::disabled();
        for items in [vec![], vec![decrement("", 1)], vec![decrement("Tomato", 0)]] {
            assert!(matches!(
                bulk_update_stock(fx.store.as_ref(), &cache, &items).await,
                Err(AppError::Validation(_))
            ));
        }
        assert!(matches!(
            bulk_update_stock(fx.store.as_ref(), &cache, &[decrement("Durian", 1)]).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn catalog_listing_filters_and_paginates() {
        let fx = seeded_store().await;
        let page = list_products(fx.store.as_ref(), Some("Vegetables"), 1, 1)
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].name, "Onion");

        let clamped = list_products(fx.store.as_ref(), None, 0, 1000).await.unwrap();
        assert_eq!(clamped.page, 1);
        assert_eq!(clamped.per_page, MAX_PER_PAGE);

        let none = list_products(fx.store.as_ref(), Some("dairy"), 1, 20).await.unwrap();
        assert_eq!(none.total, 0);
    }

    #[tokio::test]
    async fn far_pages_are_empty_not_errors() {
        let fx = seeded_store().await;
        let far = list_products(fx.store.as_ref(), None, i32::MAX, MAX_PER_PAGE)
            .await
            .unwrap();
        assert!(far.items.is_empty());
        assert_eq!(far.total, 2);
        assert_eq!(far.page, i32::MAX);
    }

    #[tokio::test]
    async fn farmer_product_is_listed_under_own_profile() {
        let fx = seeded_store().await;
        let request = CreateProductRequest {
            name: "Okra".to_string(),
            price: "35".parse().unwrap(),
            quantity: 8,
            category: "Vegetables".to_string(),
            unit: Default::default(),
            farmer_id: None,
        };
        let product = create_product(fx.store.as_ref(), &farmer(&fx), request.clone())
            .await
            .unwrap();
        assert_eq!(product.farmer_id, Some(fx.farmer.id));
        assert_eq!(product.category, "vegetables");

        let customer = Actor { user_id: fx.customer.id, role: Role::Customer };
        assert!(matches!(
            create_product(fx.store.as_ref(), &customer, request.clone()).await,
            Err(AppError::Forbidden(_))
        ));

        // Duplicate name
        assert!(matches!(
            create_product(fx.store.as_ref(), &admin(&fx), request).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn get_product_reports_missing() {
        let fx = seeded_store().await;
        let cache = CatalogCache::disabled();
        let found = get_product(fx.store.as_ref(), &cache, fx.tomato.id).await.unwrap();
        assert_eq!(found.name, "Tomato");
        assert!(matches!(
            get_product(fx.store.as_ref(), &cache, Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn farmer_profile_is_unique_per_user() {
        let fx = seeded_store().await;
        let profile = FarmerProfileRequest {
            farm_name: "Second Farm".to_string(),
            location: "Nashik".to_string(),
            latitude: Some(20.0),
            longitude: Some(73.8),
            farm_size: None,
            certifications: vec![],
        };
        assert!(matches!(
            register_farmer(fx.store.as_ref(), &farmer(&fx), profile.clone()).await,
            Err(AppError::Conflict(_))
        ));

        let newcomer = user(Role::Farmer, "new-farmer@example.com");
        fx.store.insert_user(&newcomer).await.unwrap();
        let actor = Actor { user_id: newcomer.id, role: Role::Farmer };

        let bad = FarmerProfileRequest {
            latitude: Some(123.0),
            ..profile.clone()
        };
        assert!(matches!(
            register_farmer(fx.store.as_ref(), &actor, bad).await,
            Err(AppError::Validation(_))
        ));

        let created = register_farmer(fx.store.as_ref(), &actor, profile).await.unwrap();
        assert_eq!(created.user_id, newcomer.id);
    }

    #[tokio::test]
    async fn farmer_manages_only_own_listings() {
        let fx = seeded_store().await;
        let request = FarmerProductRequest {
            name: "Cashew".to_string(),
            price: "900".parse().unwrap(),
            quantity: 3,
            category: "nuts".to_string(),
            unit: Default::default(),
        };
        let cashew = add_farmer_product(fx.store.as_ref(), &farmer(&fx), fx.farmer.id, request.clone())
            .await
            .unwrap();

        let restocked = update_farmer_product_stock(fx.store.as_ref(), &farmer(&fx), fx.farmer.id, cashew.id, 12)
            .await
            .unwrap();
        assert_eq!(restocked.quantity, 12);
        assert!(matches!(
            update_farmer_product_stock(fx.store.as_ref(), &farmer(&fx), fx.farmer.id, cashew.id, -1).await,
            Err(AppError::Validation(_))
        ));

        // Another farmer cannot touch this profile
        let other = user(Role::Farmer, "rival@example.com");
        fx.store.insert_user(&other).await.unwrap();
        let rival = Actor { user_id: other.id, role: Role::Farmer };
        assert!(matches!(
            add_farmer_product(fx.store.as_ref(), &rival, fx.farmer.id, request).await,
            Err(AppError::Forbidden(_))
        ));

        let detail = get_farmer(fx.store.as_ref(), fx.farmer.id).await.unwrap();
        assert_eq!(detail.products.len(), 2);

        delete_farmer_product(fx.store.as_ref(), &admin(&fx), fx.farmer.id, cashew.id)
            .await
            .unwrap();
        assert!(matches!(
            delete_farmer_product(fx.store.as_ref(), &admin(&fx), fx.farmer.id, cashew.id).await,
            Err(AppError::NotFound(_))
        ));
    }
}

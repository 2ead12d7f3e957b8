// =============================================================================
// MODELS MODULE
// =============================================================================
// Data structures shared by the store, the workflow modules and the HTTP
// layer.
//
// NOTES:
// - JSON field names are camelCase; clients read persisted orders directly,
//   so field names and enum labels are part of the API contract
// - Enums are stored as TEXT and converted with as_str()/FromStr
// - Money is rust_decimal::Decimal (NUMERIC in PostgreSQL)
// =============================================================================

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, AppResult};

// =============================================================================
// ENUMS
// =============================================================================

/// Generates `as_str`, `Display` and `FromStr` for a label-mapped enum.
macro_rules! labelled_enum {
    ($name:ident, $what:literal, { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok(Self::$variant),)+
                    other => Err(format!("invalid {}: {:?}", $what, other)),
                }
            }
        }
    };
}

// -----------------------------------------------------------------------------
// ROLE
// -----------------------------------------------------------------------------
/// Account role. Wholesalers buy like customers and have no extra rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Farmer,
    Customer,
    Admin,
    Wholesaler,
}

labelled_enum!(Role, "role", {
    Farmer => "FARMER",
    Customer => "CUSTOMER",
    Admin => "ADMIN",
    Wholesaler => "WHOLESALER",
});

// -----------------------------------------------------------------------------
// ORDER STATUS
// -----------------------------------------------------------------------------
/// Payment lifecycle of an order.
///
/// ```text
/// Pending --verified payment--> Paid --refund--> Refunded
/// Pending --cancel--> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Paid,
    Failed,
    Cancelled,
    Refunded,
}

labelled_enum!(OrderStatus, "order status", {
    Pending => "Pending",
    Paid => "Paid",
    Failed => "Failed",
    Cancelled => "Cancelled",
    Refunded => "Refunded",
});

// -----------------------------------------------------------------------------
// DELIVERY STATUS
// -----------------------------------------------------------------------------
/// Fulfilment progress. Variants are declared in delivery order, so the
/// derived `Ord` is the forward direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeliveryStatus {
    #[serde(rename = "Not Dispatched")]
    NotDispatched,
    #[serde(rename = "Shipped")]
    Shipped,
    #[serde(rename = "In Transit")]
    InTransit,
    #[serde(rename = "Out for Delivery")]
    OutForDelivery,
    #[serde(rename = "Delivered")]
    Delivered,
}

labelled_enum!(DeliveryStatus, "delivery status", {
    NotDispatched => "Not Dispatched",
    Shipped => "Shipped",
    InTransit => "In Transit",
    OutForDelivery => "Out for Delivery",
    Delivered => "Delivered",
});

impl DeliveryStatus {
    /// Statuses a fulfilling farmer may move to from here.
    pub fn next_options(&self) -> Vec<DeliveryStatus> {
        [
            Self::NotDispatched,
            Self::Shipped,
            Self::InTransit,
            Self::OutForDelivery,
            Self::Delivered,
        ]
        .into_iter()
        .filter(|s| s > self)
        .collect()
    }
}

// -----------------------------------------------------------------------------
// PAYMENT METHOD (admin orders)
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    #[serde(rename = "UPI")]
    Upi,
    #[serde(rename = "Credit Card")]
    CreditCard,
    #[serde(rename = "Debit Card")]
    DebitCard,
    #[serde(rename = "Net Banking")]
    NetBanking,
    #[serde(rename = "Cash on Delivery")]
    CashOnDelivery,
}

labelled_enum!(PaymentMethod, "payment method", {
    Upi => "UPI",
    CreditCard => "Credit Card",
    DebitCard => "Debit Card",
    NetBanking => "Net Banking",
    CashOnDelivery => "Cash on Delivery",
});

// -----------------------------------------------------------------------------
// SALE UNIT
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaleUnit {
    #[default]
    Kg,
    Piece,
    Dozen,
    Bundle,
}

labelled_enum!(SaleUnit, "sale unit", {
    Kg => "kg",
    Piece => "piece",
    Dozen => "dozen",
    Bundle => "bundle",
});

// =============================================================================
// USER
// =============================================================================
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,

    /// Argon2 PHC string
    #[serde(skip)]
    pub password_hash: String,

    pub role: Role,

    /// Single-use password reset token and its expiry
    #[serde(skip)]
    pub reset_token: Option<String>,
    #[serde(skip)]
    pub reset_token_expires: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

// =============================================================================
// FARMER AGGREGATE
// =============================================================================
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Farmer {
    pub id: Uuid,
    pub user_id: Uuid,
    pub farm_name: String,
    pub location: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Farm size in acres
    pub farm_size: Option<f64>,
    pub certifications: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Product listed by (and owned by) one farmer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FarmerProduct {
    pub id: Uuid,
    pub farmer_id: Uuid,
    pub name: String,
    pub price: Decimal,
    /// Available stock, never negative
    pub quantity: i32,
    pub category: String,
    pub unit: SaleUnit,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Farmer profile together with its listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FarmerDetail {
    #[serde(flatten)]
    pub farmer: Farmer,
    pub products: Vec<FarmerProduct>,
}

// =============================================================================
// CATALOG PRODUCT
// =============================================================================
/// Storefront catalog entry. Names are unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub price: Decimal,
    /// Available stock, never negative
    pub quantity: i32,
    pub category: String,
    pub unit: SaleUnit,
    /// Selling farmer, if the listing belongs to one
    pub farmer_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// STOCK ADDRESSING
// =============================================================================
/// Identifies one inventory counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockRef {
    Catalog { product_id: Uuid },
    CatalogByName { name: String },
    Farmer { farmer_id: Uuid, product_id: Uuid },
}

impl StockRef {
    /// Label used for the `source` metric dimension
    pub fn source(&self) -> &'static str {
        match self {
            StockRef::Catalog { .. } | StockRef::CatalogByName { .. } => "catalog",
            StockRef::Farmer { .. } => "farmer",
        }
    }
}

impl fmt::Display for StockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StockRef::Catalog { product_id } => write!(f, "product {}", product_id),
            StockRef::CatalogByName { name } => write!(f, "product '{}'", name),
            StockRef::Farmer {
                farmer_id,
                product_id,
            } => write!(f, "farmer {} product {}", farmer_id, product_id),
        }
    }
}

/// A quantity to take from one counter as part of an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub stock: StockRef,
    pub quantity: i32,
}

/// Stock remaining on a counter after a successful decrement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockLevel {
    pub product_id: Uuid,
    pub name: String,
    pub remaining: i32,
}

// =============================================================================
// ORDER
// =============================================================================
/// Line item snapshot, decoupled from the live product record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_name: String,
    pub unit_price: Decimal,
    pub quantity: i32,

    /// Counter this line was taken from, used to restore stock on cancel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub farmer_id: Option<Uuid>,
}

fn amount_out_of_range() -> AppError {
    AppError::Validation("amount is out of range".to_string())
}

impl OrderItem {
    /// `unit_price × quantity`; `Validation` when it leaves the decimal range.
    pub fn line_total(&self) -> AppResult<Decimal> {
        self.unit_price
            .checked_mul(Decimal::from(self.quantity))
            .ok_or_else(amount_out_of_range)
    }

    pub fn total(items: &[OrderItem]) -> AppResult<Decimal> {
        items.iter().try_fold(Decimal::ZERO, |sum, item| {
            sum.checked_add(item.line_total()?)
                .ok_or_else(amount_out_of_range)
        })
    }

    /// Counter to credit back when the order is cancelled.
    pub fn stock_source(&self) -> Option<StockRef> {
        match (self.farmer_id, self.product_id) {
            (Some(farmer_id), Some(product_id)) => Some(StockRef::Farmer {
                farmer_id,
                product_id,
            }),
            (None, Some(product_id)) => Some(StockRef::Catalog { product_id }),
            (None, None) => Some(StockRef::CatalogByName {
                name: self.product_name.clone(),
            }),
            (Some(_), None) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Gateway order id for checkouts, locally generated for admin orders
    pub order_id: String,
    pub buyer_id: Uuid,
    pub items: Vec<OrderItem>,
    /// Persisted at creation, equal to the sum of line totals
    pub total_amount: Decimal,
    pub currency: String,
    pub status: OrderStatus,
    pub delivery_status: DeliveryStatus,
    pub payment_method: Option<PaymentMethod>,
    pub payment_id: Option<String>,
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// A freshly placed order: Pending, not dispatched, unpaid.
    pub fn pending(
        order_id: impl Into<String>,
        buyer_id: Uuid,
        items: Vec<OrderItem>,
        currency: impl Into<String>,
        payment_method: Option<PaymentMethod>,
    ) -> AppResult<Self> {
        let now = Utc::now();
        let total_amount = OrderItem::total(&items)?;
        Ok(Self {
            order_id: order_id.into(),
            buyer_id,
            items,
            total_amount,
            currency: currency.into(),
            status: OrderStatus::Pending,
            delivery_status: DeliveryStatus::NotDispatched,
            payment_method,
            payment_id: None,
            signature: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn involves_farmer(&self, farmer_id: Uuid) -> bool {
        self.items.iter().any(|i| i.farmer_id == Some(farmer_id))
    }
}

// =============================================================================
// API REQUEST/RESPONSE STRUCTURES
// =============================================================================

// -----------------------------------------------------------------------------
// CHECKOUT
// -----------------------------------------------------------------------------
/// Body of `POST /orders/create-order`.
///
/// Every field is optional at the serde level so that missing input is
/// reported as a validation error rather than a JSON rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub user_id: Option<Uuid>,
    pub items: Option<Vec<CheckoutItem>>,
    pub total_amount: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutItem {
    #[serde(default)]
    pub product_id: Option<Uuid>,
    #[serde(default, alias = "name")]
    pub product_name: String,
    #[serde(alias = "price")]
    pub unit_price: Decimal,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub order_id: String,
    /// Minor currency units, as the gateway reports it
    pub amount: i64,
    pub currency: String,
}

// -----------------------------------------------------------------------------
// PAYMENT VERIFICATION
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentRequest {
    #[serde(default, alias = "razorpay_order_id")]
    pub order_id: String,
    #[serde(default, alias = "razorpay_payment_id")]
    pub payment_id: String,
    #[serde(default, alias = "razorpay_signature")]
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyPaymentResponse {
    pub success: bool,
}

// -----------------------------------------------------------------------------
// ADMIN ORDER
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminOrderRequest {
    pub user_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
    pub farmer_id: Option<Uuid>,
    pub quantity: Option<i32>,
    pub payment_method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminOrderResponse {
    pub order: Order,
}

// -----------------------------------------------------------------------------
// DELIVERY STATUS UPDATE
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStatusRequest {
    pub delivery_status: String,
}

// -----------------------------------------------------------------------------
// BULK STOCK DECREMENT (storefront fallback)
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateStockRequest {
    #[serde(default)]
    pub items: Vec<StockDecrement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockDecrement {
    #[serde(alias = "productName")]
    pub name: String,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStockResponse {
    pub updated: Vec<StockLevel>,
}

// -----------------------------------------------------------------------------
// CATALOG
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateProductRequest {
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    pub price: Decimal,
    #[validate(range(min = 0))]
    pub quantity: i32,
    #[validate(length(min = 1, max = 60))]
    pub category: String,
    #[serde(default)]
    pub unit: SaleUnit,
    #[serde(default)]
    pub farmer_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductListResponse {
    pub items: Vec<Product>,
    pub total: i64,
    pub page: i32,
    pub per_page: i32,
}

// -----------------------------------------------------------------------------
// FARMER
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FarmerProfileRequest {
    #[validate(length(min = 1, max = 120))]
    pub farm_name: String,
    #[validate(length(min = 1, max = 200))]
    pub location: String,
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: Option<f64>,
    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: Option<f64>,
    #[validate(range(min = 0.0))]
    pub farm_size: Option<f64>,
    #[serde(default)]
    pub certifications: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FarmerProductRequest {
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    pub price: Decimal,
    #[validate(range(min = 0))]
    pub quantity: i32,
    #[validate(length(min = 1, max = 60))]
    pub category: String,
    #[serde(default)]
    pub unit: SaleUnit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStockRequest {
    pub quantity: i32,
}

// -----------------------------------------------------------------------------
// USERS
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 8, max = 128))]
    pub password: String,
    #[serde(default)]
    pub role: Option<Role>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ResetPasswordRequest {
    #[validate(length(min = 1))]
    pub token: String,
    #[validate(length(min = 8, max = 128))]
    pub password: String,
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

/// Simple health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Detailed readiness check response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

/// Individual dependency health checks
#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub store: bool,
    /// `None` when no cache is configured
    pub cache: Option<bool>,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================

/// API error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error type/code
    pub error: String,

    /// Human-readable error message
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, price: &str, quantity: i32) -> OrderItem {
        OrderItem {
            product_name: name.to_string(),
            unit_price: price.parse().unwrap(),
            quantity,
            product_id: None,
            farmer_id: None,
        }
    }

    #[test]
    fn pending_order_total_is_sum_of_lines() {
        let order = Order::pending(
            "order_1",
            Uuid::new_v4(),
            vec![item("Tomato", "40.50", 2), item("Onion", "30", 3)],
            "INR",
            None,
        )
        .unwrap();
        assert_eq!(order.total_amount, "171.00".parse::<Decimal>().unwrap());
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.delivery_status, DeliveryStatus::NotDispatched);
        assert!(order.payment_id.is_none());
    }

    #[test]
    fn overflowing_totals_are_rejected() {
        let huge = item("Gold Melon", "1000000000000000000000000000", 100);
        assert!(matches!(huge.line_total(), Err(AppError::Validation(_))));

        let two = vec![
            item("Gold Melon", "60000000000000000000000000000", 1),
            item("Gold Melon", "60000000000000000000000000000", 1),
        ];
        assert!(matches!(OrderItem::total(&two), Err(AppError::Validation(_))));
        assert!(Order::pending("order_big", Uuid::nil(), two, "INR", None).is_err());
    }

    #[test]
    fn enum_labels_match_wire_format() {
        assert_eq!(
            serde_json::to_value(DeliveryStatus::OutForDelivery).unwrap(),
            serde_json::json!("Out for Delivery")
        );
        assert_eq!(
            "Cash on Delivery".parse::<PaymentMethod>().unwrap(),
            PaymentMethod::CashOnDelivery
        );
        assert_eq!(serde_json::to_value(Role::Wholesaler).unwrap(), "WHOLESALER");
        assert!("Bitcoin".parse::<PaymentMethod>().is_err());
    }

    #[test]
    fn delivery_options_only_move_forward() {
        assert_eq!(
            DeliveryStatus::InTransit.next_options(),
            vec![DeliveryStatus::OutForDelivery, DeliveryStatus::Delivered]
        );
        assert!(DeliveryStatus::Delivered.next_options().is_empty());
    }

    #[test]
    fn order_serializes_camel_case() {
        let order = Order::pending("order_x", Uuid::nil(), vec![item("Tomato", "50", 5)], "INR", None)
            .unwrap();
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["orderId"], "order_x");
        assert_eq!(json["status"], "Pending");
        assert_eq!(json["deliveryStatus"], "Not Dispatched");
        assert_eq!(json["items"][0]["productName"], "Tomato");
    }
}

// =============================================================================
// PAYMENT MODULE
// =============================================================================
// Payment gateway client and payment-callback verification.
//
// FLOW:
// 1. Checkout asks the gateway for an order handle (create_order)
// 2. The buyer pays on the gateway's page
// 3. The client relays (orderId, paymentId, signature) back to us
// 4. verify_payment recomputes HMAC-SHA256("{orderId}|{paymentId}") with
//    the shared secret and only then marks the order Paid
//
// The callback is client-reachable, so nothing in it is trusted until the
// signature matches.
// =============================================================================

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, instrument, warn};

use crate::config::PaymentConfig;
use crate::db::Store;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{Order, VerifyPaymentRequest};

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// GATEWAY CONTRACT
// =============================================================================

/// Order handle returned by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates an order on the gateway. Called once per checkout; callers
    /// must not retry (a retry can create a second chargeable order).
    async fn create_order(
        &self,
        amount_minor: i64,
        currency: &str,
        receipt: &str,
    ) -> AppResult<GatewayOrder>;
}

// =============================================================================
// HTTP GATEWAY CLIENT
// =============================================================================
/// Razorpay-compatible REST client.
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
}

#[derive(Serialize)]
struct CreateOrderBody<'a> {
    amount: i64,
    currency: &'a str,
    receipt: &'a str,
}

impl HttpGateway {
    pub fn new(config: &PaymentConfig) -> anyhow::Result<Self> {
        // The timeout covers the whole request; reqwest never retries.
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            key_id: config.key_id.clone(),
            key_secret: config.key_secret.clone(),
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    #[instrument(skip(self), err(Display))]
    async fn create_order(
        &self,
        amount_minor: i64,
        currency: &str,
        receipt: &str,
    ) -> AppResult<GatewayOrder> {
        let response = self
            .client
            .post(format!("{}/v1/orders", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&CreateOrderBody {
                amount: amount_minor,
                currency,
                receipt,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Gateway(format!(
                "gateway returned {}: {}",
                status, body
            )));
        }

        let order: GatewayOrder = response.json().await?;
        info!(gateway_order_id = %order.id, "Gateway order created");
        Ok(order)
    }
}

// =============================================================================
// SIGNATURES
// =============================================================================

fn keyed_mac(secret: &str, order_id: &str, payment_id: &str) -> AppResult<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Internal(e.to_string()))?;
    mac.update(format!("{}|{}", order_id, payment_id).as_bytes());
    Ok(mac)
}

/// Hex HMAC-SHA256 of `"{order_id}|{payment_id}"`, the proof the gateway
/// hands back after a successful payment. Only the gateway signs in
/// production.
#[cfg(test)]
pub fn sign(secret: &str, order_id: &str, payment_id: &str) -> AppResult<String> {
    let mac = keyed_mac(secret, order_id, payment_id)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a lower-case hex signature.
pub fn verify_signature(
    secret: &str,
    order_id: &str,
    payment_id: &str,
    signature: &str,
) -> AppResult<()> {
    // The stored signature must be exactly what the gateway sent
    let lower_hex = signature
        .bytes()
        .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if !lower_hex {
        return Err(AppError::InvalidSignature);
    }

    let provided = hex::decode(signature).map_err(|_| AppError::InvalidSignature)?;
    keyed_mac(secret, order_id, payment_id)?
        .verify_slice(&provided)
        .map_err(|_| AppError::InvalidSignature)
}

// =============================================================================
// PAYMENT VERIFIER
// =============================================================================

/// Verifies a relayed payment confirmation and marks the order Paid.
///
/// - mismatch: `InvalidSignature`, order untouched
/// - unknown order: `NotFound`
/// - repeated identical call: same Paid order, no further change
pub async fn verify_payment(
    store: &dyn Store,
    secret: &str,
    request: &VerifyPaymentRequest,
) -> AppResult<Order> {
    let VerifyPaymentRequest {
        order_id,
        payment_id,
        signature,
    } = request;

    if order_id.is_empty() || payment_id.is_empty() || signature.is_empty() {
        return Err(AppError::Validation(
            "orderId, paymentId and signature are required".to_string(),
        ));
    }

    if let Err(err) = verify_signature(secret, order_id, payment_id, signature) {
        if matches!(err, AppError::InvalidSignature) {
            metrics::record_payment_verification("invalid_signature");
            warn!(
                target: "security",
                order_id = %order_id,
                payment_id = %payment_id,
                "Payment signature mismatch, possible tampering"
            );
        }
        return Err(err);
    }

    match store.mark_paid(order_id, payment_id, signature).await {
        Ok(order) => {
            metrics::record_payment_verification("paid");
            info!(order_id = %order_id, payment_id = %payment_id, "Order marked paid");
            Ok(order)
        }
        Err(err) => {
            metrics::record_payment_verification("rejected");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderStatus;
    use crate::testing::{pending_order, seeded_store, TEST_SECRET};

    fn request(order_id: &str, payment_id: &str, signature: &str) -> VerifyPaymentRequest {
        VerifyPaymentRequest {
            order_id: order_id.to_string(),
            payment_id: payment_id.to_string(),
            signature: signature.to_string(),
        }
    }

    #[test]
    fn signature_round_trip() {
        let sig = sign(TEST_SECRET, "order_abc", "pay_123").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(verify_signature(TEST_SECRET, "order_abc", "pay_123", &sig).is_ok());
    }

    #[test]
    fn signature_is_bound_to_both_ids_and_secret() {
        let sig = sign(TEST_SECRET, "order_abc", "pay_123").unwrap();
        for (secret, order, payment) in [
            ("other-secret", "order_abc", "pay_123"),
            (TEST_SECRET, "order_abd", "pay_123"),
            (TEST_SECRET, "order_abc", "pay_124"),
        ] {
            assert!(matches!(
                verify_signature(secret, order, payment, &sig),
                Err(AppError::InvalidSignature)
            ));
        }
        assert!(matches!(
            verify_signature(TEST_SECRET, "order_abc", "pay_123", "garbage"),
            Err(AppError::InvalidSignature)
        ));
    }

    #[test]
    fn signature_must_match_byte_for_byte() {
        let sig = sign(TEST_SECRET, "order_abc", "pay_123").unwrap();
        for variant in [sig.to_uppercase(), format!(" {sig}"), format!("{sig}00"), sig[..62].to_string()] {
            assert!(matches!(
                verify_signature(TEST_SECRET, "order_abc", "pay_123", &variant),
                Err(AppError::InvalidSignature)
            ));
        }
    }

    // Scenario B
    #[tokio::test]
    async fn valid_signature_marks_order_paid() {
        let fx = seeded_store().await;
        let order = pending_order(&fx, "order_B", "250.00").await;
        assert_eq!(order.total_amount, "250.00".parse().unwrap());

        let sig = sign(TEST_SECRET, "order_B", "pay_123").unwrap();
        let paid = verify_payment(fx.store.as_ref(), TEST_SECRET, &request("order_B", "pay_123", &sig))
            .await
            .unwrap();

        assert_eq!(paid.status, OrderStatus::Paid);
        let stored = fx.store.get_order("order_B").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Paid);
        assert_eq!(stored.payment_id.as_deref(), Some("pay_123"));
        assert_eq!(stored.signature.as_deref(), Some(sig.as_str()));
    }

    // Scenario C
    #[tokio::test]
    async fn garbage_signature_leaves_order_pending() {
        let fx = seeded_store().await;
        pending_order(&fx, "order_C", "250.00").await;

        let err = verify_payment(fx.store.as_ref(), TEST_SECRET, &request("order_C", "pay_123", "garbage"))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidSignature));
        let stored = fx.store.get_order("order_C").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
        assert!(stored.payment_id.is_none());
        assert!(stored.signature.is_none());
    }

    #[tokio::test]
    async fn repeated_verification_is_idempotent() {
        let fx = seeded_store().await;
        pending_order(&fx, "order_R", "100").await;
        let sig = sign(TEST_SECRET, "order_R", "pay_9").unwrap();
        let req = request("order_R", "pay_9", &sig);

        let first = verify_payment(fx.store.as_ref(), TEST_SECRET, &req).await.unwrap();
        let second = verify_payment(fx.store.as_ref(), TEST_SECRET, &req).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.status, OrderStatus::Paid);
    }

    #[tokio::test]
    async fn second_payment_for_paid_order_conflicts() {
        let fx = seeded_store().await;
        pending_order(&fx, "order_D", "100").await;
        let sig = sign(TEST_SECRET, "order_D", "pay_1").unwrap();
        verify_payment(fx.store.as_ref(), TEST_SECRET, &request("order_D", "pay_1", &sig))
            .await
            .unwrap();

        let other = sign(TEST_SECRET, "order_D", "pay_2").unwrap();
        let err = verify_payment(fx.store.as_ref(), TEST_SECRET, &request("order_D", "pay_2", &other))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let stored = fx.store.get_order("order_D").await.unwrap().unwrap();
        assert_eq!(stored.payment_id.as_deref(), Some("pay_1"));
    }

    #[tokio::test]
    async fn unknown_order_with_valid_signature_is_not_found() {
        let fx = seeded_store().await;
        let sig = sign(TEST_SECRET, "order_missing", "pay_1").unwrap();
        let err = verify_payment(fx.store.as_ref(), TEST_SECRET, &request("order_missing", "pay_1", &sig))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn missing_fields_are_validation_errors() {
        let fx = seeded_store().await;
        let err = verify_payment(fx.store.as_ref(), TEST_SECRET, &request("order_x", "", "abc"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}

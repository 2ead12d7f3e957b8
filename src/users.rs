// =============================================================================
// USERS MODULE
// =============================================================================
// Caller identity, role checks, registration and password reset.
//
// Authentication happens upstream; the gateway in front of this service
// forwards the authenticated user as X-User-Id / X-User-Role. The claimed
// role is never trusted on its own: privileged operations reload the user
// and check the stored role.
// =============================================================================

use argon2::{
    password_hash::{PasswordHasher, SaltString},
    Argon2,
};
use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use chrono::{DateTime, Duration, Utc};
use rand_core::{OsRng, RngCore};
use tracing::{debug, info};
use uuid::Uuid;
use validator::Validate;

use crate::db::Store;
use crate::error::{AppError, AppResult};
use crate::models::{RegisterRequest, ResetPasswordRequest, Role, User};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

const RESET_TOKEN_TTL_HOURS: i64 = 1;

// =============================================================================
// ACTOR
// =============================================================================
/// Identity claimed by the caller of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header(parts, USER_ID_HEADER)
            .ok_or_else(|| AppError::Unauthorized(format!("missing {} header", USER_ID_HEADER)))?
            .parse::<Uuid>()
            .map_err(|_| AppError::Unauthorized(format!("malformed {} header", USER_ID_HEADER)))?;

        let role = header(parts, USER_ROLE_HEADER)
            .ok_or_else(|| AppError::Unauthorized(format!("missing {} header", USER_ROLE_HEADER)))?
            .to_uppercase()
            .parse::<Role>()
            .map_err(AppError::Unauthorized)?;

        Ok(Actor { user_id, role })
    }
}

/// Reloads the actor and checks the stored role against the claim and
/// against `allowed`.
pub async fn authorize(store: &dyn Store, actor: &Actor, allowed: &[Role]) -> AppResult<User> {
    let user = store
        .get_user(actor.user_id)
        .await?
        .ok_or_else(|| AppError::Unauthorized("unknown user".to_string()))?;

    if user.role != actor.role {
        return Err(AppError::Forbidden(format!(
            "claimed role {} does not match account role",
            actor.role
        )));
    }
    if !allowed.contains(&user.role) {
        return Err(AppError::Forbidden(format!(
            "role {} may not perform this operation",
            user.role
        )));
    }
    Ok(user)
}

// =============================================================================
// PASSWORDS
// =============================================================================

fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("password hashing failed: {}", e)))
}

fn reset_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// =============================================================================
// NOTIFIER
// =============================================================================
/// Delivers password reset tokens to their owners.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn password_reset(&self, user: &User, token: &str, expires: DateTime<Utc>)
        -> AppResult<()>;
}

/// Stands in for e-mail delivery. Logs that a token went out, never the
/// token itself.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn password_reset(
        &self,
        user: &User,
        _token: &str,
        expires: DateTime<Utc>,
    ) -> AppResult<()> {
        debug!(user_id = %user.id, %expires, "Password reset token ready for delivery");
        Ok(())
    }
}

// =============================================================================
// OPERATIONS
// =============================================================================

pub async fn register_user(store: &dyn Store, request: RegisterRequest) -> AppResult<User> {
    request.validate()?;

    let role = request.role.unwrap_or(Role::Customer);
    if role == Role::Admin {
        return Err(AppError::Forbidden(
            "admin accounts cannot be self-registered".to_string(),
        ));
    }

    let user = User {
        id: Uuid::new_v4(),
        name: request.name.trim().to_string(),
        email: request.email.trim().to_lowercase(),
        password_hash: hash_password(&request.password)?,
        role,
        reset_token: None,
        reset_token_expires: None,
        created_at: Utc::now(),
    };
    store.insert_user(&user).await?;

    info!(user_id = %user.id, role = %user.role, "User registered");
    Ok(user)
}

/// Issues a reset token when the email is known. Answers the same either
/// way.
pub async fn request_password_reset(
    store: &dyn Store,
    notifier: &dyn Notifier,
    email: &str,
) -> AppResult<()> {
    let email = email.trim().to_lowercase();
    let Some(user) = store.find_user_by_email(&email).await? else {
        debug!("Password reset requested for unknown email");
        return Ok(());
    };

    let token = reset_token();
    let expires = Utc::now() + Duration::hours(RESET_TOKEN_TTL_HOURS);
    store.set_reset_token(user.id, &token, expires).await?;
    notifier.password_reset(&user, &token, expires).await?;

    info!(user_id = %user.id, "Password reset token issued");
    Ok(())
}

pub async fn reset_password(store: &dyn Store, request: ResetPasswordRequest) -> AppResult<()> {
    request.validate()?;

    let new_hash = hash_password(&request.password)?;
    let consumed = store
        .consume_reset_token(&request.token, Utc::now(), &new_hash)
        .await?;
    if !consumed {
        return Err(AppError::Validation(
            "reset token is invalid or expired".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seeded_store, RecordingNotifier};
    use std::sync::Arc;

    use argon2::{PasswordHash, PasswordVerifier};
    use axum::http::Request;
    use parking_lot::Mutex;

    fn register(email: &str, role: Option<Role>) -> RegisterRequest {
        RegisterRequest {
            name: "Asha".to_string(),
            email: email.to_string(),
            password: "correct horse".to_string(),
            role,
        }
    }

    fn password_matches(user: &User, password: &str) -> bool {
        let hash = PasswordHash::new(&user.password_hash).unwrap();
        Argon2::default()
            .verify_password(password.as_bytes(), &hash)
            .is_ok()
    }

    async fn actor_from(headers: &[(&str, &str)]) -> Result<Actor, AppError> {
        let mut builder = Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        Actor::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn actor_is_read_from_headers() {
        let id = Uuid::new_v4();
        let id_str = id.to_string();
        let actor = actor_from(&[(USER_ID_HEADER, id_str.as_str()), (USER_ROLE_HEADER, "admin")])
            .await
            .unwrap();
        assert_eq!(actor, Actor { user_id: id, role: Role::Admin });

        assert!(matches!(
            actor_from(&[(USER_ROLE_HEADER, "ADMIN")]).await,
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            actor_from(&[(USER_ID_HEADER, "not-a-uuid"), (USER_ROLE_HEADER, "ADMIN")]).await,
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            actor_from(&[(USER_ID_HEADER, id_str.as_str()), (USER_ROLE_HEADER, "ROOT")]).await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn authorize_checks_stored_role() {
        let fx = seeded_store().await;
        let admin = Actor { user_id: fx.admin.id, role: Role::Admin };
        assert!(authorize(fx.store.as_ref(), &admin, &[Role::Admin]).await.is_ok());

        // A customer claiming ADMIN
        let forged = Actor { user_id: fx.customer.id, role: Role::Admin };
        assert!(matches!(
            authorize(fx.store.as_ref(), &forged, &[Role::Admin]).await,
            Err(AppError::Forbidden(_))
        ));

        let customer = Actor { user_id: fx.customer.id, role: Role::Customer };
        assert!(matches!(
            authorize(fx.store.as_ref(), &customer, &[Role::Admin]).await,
            Err(AppError::Forbidden(_))
        ));

        let ghost = Actor { user_id: Uuid::new_v4(), role: Role::Admin };
        assert!(matches!(
            authorize(fx.store.as_ref(), &ghost, &[Role::Admin]).await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn register_hashes_password_and_rejects_duplicates() {
        let fx = seeded_store().await;
        let user = register_user(fx.store.as_ref(), register("New@Example.com", None))
            .await
            .unwrap();
        assert_eq!(user.role, Role::Customer);
        assert_eq!(user.email, "new@example.com");
        assert!(user.password_hash.starts_with("$argon2"));
        assert!(password_matches(&user, "correct horse"));

        let err = register_user(fx.store.as_ref(), register("new@example.com", None))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn register_validates_input() {
        let fx = seeded_store().await;
        let err = register_user(fx.store.as_ref(), register("not-an-email", None))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = register_user(fx.store.as_ref(), register("boss@example.com", Some(Role::Admin)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn reset_token_is_single_use() {
        let fx = seeded_store().await;
        let notifier = RecordingNotifier::default();

        request_password_reset(fx.store.as_ref(), &notifier, &fx.customer.email)
            .await
            .unwrap();
        let token = notifier.last_token().expect("token delivered");

        let reset = ResetPasswordRequest {
            token: token.clone(),
            password: "a brand new secret".to_string(),
        };
        reset_password(fx.store.as_ref(), reset.clone()).await.unwrap();

        let user = fx.store.get_user(fx.customer.id).await.unwrap().unwrap();
        assert!(password_matches(&user, "a brand new secret"));
        assert!(user.reset_token.is_none());

        let err = reset_password(fx.store.as_ref(), reset).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_email_is_answered_without_a_token() {
        let fx = seeded_store().await;
        let notifier = RecordingNotifier::default();
        request_password_reset(fx.store.as_ref(), &notifier, "nobody@example.com")
            .await
            .unwrap();
        assert!(notifier.last_token().is_none());
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn log_notifier_keeps_the_token_out_of_logs() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let fx = seeded_store().await;
        request_password_reset(fx.store.as_ref(), &LogNotifier, &fx.customer.email)
            .await
            .unwrap();

        let user = fx.store.get_user(fx.customer.id).await.unwrap().unwrap();
        let token = user.reset_token.expect("token stored");
        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert!(output.contains("Password reset token ready for delivery"));
        assert!(!output.contains(&token));
    }
}

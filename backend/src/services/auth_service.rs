//! Authentication service.
//!
//! Handles user authentication, API token issuance and password hashing.
//! Tokens are random hex strings handed to the client once; only their
//! SHA-256 digest is stored.

use bcrypt::{hash, verify, DEFAULT_COST};
use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::user::User;

/// Length of a generated token key, in bytes before hex encoding.
const TOKEN_BYTES: usize = 20;

const USER_COLUMNS: &str = "id, username, email, password_hash, is_superuser, is_active, \
                            last_login_at, created_at, updated_at";

/// Authentication service
pub struct AuthService {
    db: PgPool,
}

impl AuthService {
    /// Create a new authentication service
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Authenticate user with username and password
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE username = $1 AND is_active = true",
            USER_COLUMNS
        ))
        .bind(username)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?
        .ok_or_else(|| AppError::Authentication("Invalid username or password".to_string()))?;

        if !Self::verify_password(password, &user.password_hash)? {
            return Err(AppError::Authentication(
                "Invalid username or password".to_string(),
            ));
        }

        sqlx::query("UPDATE users SET last_login_at = NOW() WHERE id = $1")
            .bind(user.id)
            .execute(&self.db)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(user)
    }

    /// Create a token for the user, replacing any previous one.
    pub async fn create_token(&self, user_id: Uuid) -> Result<String> {
        let token = Self::generate_token_key();
        let token_hash = Self::hash_token(&token);

        sqlx::query(
            r#"
            INSERT INTO auth_tokens (token_hash, user_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET token_hash = EXCLUDED.token_hash, created_at = NOW()
            "#,
        )
        .bind(&token_hash)
        .bind(user_id)
        .execute(&self.db)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        tracing::info!(user_id = %user_id, "Issued auth token");
        Ok(token)
    }

    /// Validate a token and return its active user.
    pub async fn validate_token(&self, token: &str) -> Result<User> {
        if token.is_empty() {
            return Err(AppError::Authentication("Invalid token".to_string()));
        }

        let token_hash = Self::hash_token(token);
        sqlx::query_as::<_, User>(&format!(
            r#"
            SELECT {} FROM users
            WHERE id = (SELECT user_id FROM auth_tokens WHERE token_hash = $1)
              AND is_active = true
            "#,
            USER_COLUMNS
        ))
        .bind(&token_hash)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?
        .ok_or_else(|| AppError::Authentication("Invalid token".to_string()))
    }

    /// Destroy the user's token.
    pub async fn destroy_token(&self, user_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM auth_tokens WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.db)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    /// Create a user. Used by the `create-superuser` command.
    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password: &str,
        is_superuser: bool,
    ) -> Result<User> {
        let password_hash = Self::hash_password(password)?;
        sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (username, email, password_hash, is_superuser)
            VALUES ($1, $2, $3, $4)
            RETURNING {}
            "#,
            USER_COLUMNS
        ))
        .bind(username)
        .bind(email)
        .bind(&password_hash)
        .bind(is_superuser)
        .fetch_one(&self.db)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.is_unique_violation() {
                    return AppError::Conflict(format!("User '{}' already exists", username));
                }
            }
            AppError::Database(e.to_string())
        })
    }

    /// Hash a password
    pub fn hash_password(password: &str) -> Result<String> {
        hash(password, DEFAULT_COST)
            .map_err(|e| AppError::Internal(format!("Password hashing failed: {}", e)))
    }

    /// Verify a password against a hash
    pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
        verify(password, hash)
            .map_err(|e| AppError::Internal(format!("Password verification failed: {}", e)))
    }

    /// SHA-256 hex digest of a token key.
    pub fn hash_token(token: &str) -> String {
        hex::encode(Sha256::digest(token.as_bytes()))
    }

    fn generate_token_key() -> String {
        let mut rng = rand::rng();
        let bytes: Vec<u8> = (0..TOKEN_BYTES).map(|_| rng.random()).collect();
        hex::encode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hashing() {
        let password = "test_password_123";
        let hash = AuthService::hash_password(password).unwrap();
        assert!(AuthService::verify_password(password, &hash).unwrap());
        assert!(!AuthService::verify_password("wrong_password", &hash).unwrap());
    }

    #[test]
    fn test_token_hash_is_stable_sha256() {
        let digest = AuthService::hash_token("abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(digest, AuthService::hash_token("abc"));
    }

    #[test]
    fn test_generated_tokens_are_unique_hex() {
        let a = AuthService::generate_token_key();
        let b = AuthService::generate_token_key();
        assert_eq!(a.len(), TOKEN_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}

//! Access token storage. Plaintext is hashed before it reaches this layer.

use anyhow::Result;
use chrono::{DateTime, Utc};
use onlyboxes_protocol::{AccountId, TokenId};
use sqlx::{Pool, Sqlite};

use crate::accounts::username_key;
use crate::models::{fmt_ts, TokenRow};

pub struct TokenStore {
    pool: Pool<Sqlite>,
}

impl TokenStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn list_by_account(&self, account_id: &AccountId) -> Result<Vec<TokenRow>> {
        let rows = sqlx::query_as(
            r#"
            SELECT * FROM obx_tokens
            WHERE account_id = ?
            ORDER BY created_at ASC, token_id ASC
            "#,
        )
        .bind(account_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get(&self, token_id: &TokenId) -> Result<Option<TokenRow>> {
        let row = sqlx::query_as("SELECT * FROM obx_tokens WHERE token_id = ?")
            .bind(token_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_by_name(&self, account_id: &AccountId, name: &str) -> Result<Option<TokenRow>> {
        let row = sqlx::query_as("SELECT * FROM obx_tokens WHERE account_id = ? AND name_key = ?")
            .bind(account_id.as_str())
            .bind(username_key(name))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Bearer resolution: HMAC the presented value, look it up here.
    pub async fn get_by_hash(&self, token_hash: &str) -> Result<Option<TokenRow>> {
        let row = sqlx::query_as("SELECT * FROM obx_tokens WHERE token_hash = ?")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn insert(
        &self,
        token_id: &TokenId,
        account_id: &AccountId,
        name: &str,
        token_hash: &str,
        token_suffix: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO obx_tokens (token_id, account_id, name, name_key, token_hash, token_suffix, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(token_id.as_str())
        .bind(account_id.as_str())
        .bind(name)
        .bind(username_key(name))
        .bind(token_hash)
        .bind(token_suffix)
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Scoped delete: the id alone is not enough, the owner must match.
    pub async fn delete(&self, token_id: &TokenId, account_id: &AccountId) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM obx_tokens WHERE token_id = ? AND account_id = ?")
            .bind(token_id.as_str())
            .bind(account_id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }
}

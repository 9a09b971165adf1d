//! Account storage.

use anyhow::Result;
use chrono::{DateTime, Utc};
use onlyboxes_protocol::AccountId;
use sqlx::{Pool, Sqlite};

use crate::models::{fmt_ts, AccountRow};

/// Case-insensitive lookup key for a username.
pub fn username_key(username: &str) -> String {
    username.trim().to_lowercase()
}

pub struct AccountStore {
    pool: Pool<Sqlite>,
}

impl AccountStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn count_admins(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM obx_accounts WHERE is_admin = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn insert(
        &self,
        account_id: &AccountId,
        username: &str,
        password_hash: &str,
        is_admin: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO obx_accounts (account_id, username, username_key, password_hash, is_admin, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(account_id.as_str())
        .bind(username)
        .bind(username_key(username))
        .bind(password_hash)
        .bind(is_admin)
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, account_id: &AccountId) -> Result<Option<AccountRow>> {
        let row = sqlx::query_as("SELECT * FROM obx_accounts WHERE account_id = ?")
            .bind(account_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<AccountRow>> {
        let row = sqlx::query_as("SELECT * FROM obx_accounts WHERE username_key = ?")
            .bind(username_key(username))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_page(&self, page: u32, page_size: u32) -> Result<(Vec<AccountRow>, u64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM obx_accounts")
            .fetch_one(&self.pool)
            .await?;
        let offset = i64::from(page.saturating_sub(1)) * i64::from(page_size);
        let rows = sqlx::query_as(
            r#"
            SELECT * FROM obx_accounts
            ORDER BY created_at ASC, account_id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(i64::from(page_size))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok((rows, total as u64))
    }

    /// Rotate the password hash. Returns false if the account is gone.
    pub async fn update_password(
        &self,
        account_id: &AccountId,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE obx_accounts
            SET password_hash = ?, updated_at = ?
            WHERE account_id = ?
            "#,
        )
        .bind(password_hash)
        .bind(fmt_ts(now))
        .bind(account_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Delete an account only if it is not an admin. Admin deletion is
    /// forbidden at the policy layer; the guard here is the backstop.
    pub async fn delete_non_admin(&self, account_id: &AccountId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM obx_tokens WHERE account_id = ?")
            .bind(account_id.as_str())
            .execute(&mut *tx)
            .await?;
        let affected =
            sqlx::query("DELETE FROM obx_accounts WHERE account_id = ? AND is_admin = 0")
                .bind(account_id.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected();
        if affected == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use chrono::Duration;

    async fn store() -> (Database, AccountStore) {
        let (db, _) = Database::open_in_memory(Duration::days(30)).await.unwrap();
        let accounts = db.accounts();
        (db, accounts)
    }

    #[tokio::test]
    async fn test_username_lookup_is_case_insensitive() {
        let (_db, store) = store().await;
        let id = AccountId::new();
        store
            .insert(&id, "Alice", "hash", true, Utc::now())
            .await
            .unwrap();

        let found = store.get_by_username("ALICE").await.unwrap().unwrap();
        assert_eq!(found.account_id, id.as_str());
        assert_eq!(found.username, "Alice");
    }

    #[tokio::test]
    async fn test_duplicate_username_key_rejected() {
        let (_db, store) = store().await;
        store
            .insert(&AccountId::new(), "alice", "h1", false, Utc::now())
            .await
            .unwrap();
        let duplicate = store
            .insert(&AccountId::new(), "Alice", "h2", false, Utc::now())
            .await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn test_delete_non_admin_spares_admins() {
        let (_db, store) = store().await;
        let admin = AccountId::new();
        let user = AccountId::new();
        store
            .insert(&admin, "root", "h", true, Utc::now())
            .await
            .unwrap();
        store
            .insert(&user, "bob", "h", false, Utc::now())
            .await
            .unwrap();

        assert!(!store.delete_non_admin(&admin).await.unwrap());
        assert!(store.delete_non_admin(&user).await.unwrap());
        assert!(store.get(&user).await.unwrap().is_none());
        assert!(store.get(&admin).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_count_admins_and_paging() {
        let (_db, store) = store().await;
        for i in 0..3 {
            store
                .insert(
                    &AccountId::new(),
                    &format!("user{i}"),
                    "h",
                    i == 0,
                    Utc::now(),
                )
                .await
                .unwrap();
        }
        assert_eq!(store.count_admins().await.unwrap(), 1);

        let (page, total) = store.list_page(1, 2).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);
        let (page2, _) = store.list_page(2, 2).await.unwrap();
        assert_eq!(page2.len(), 1);
    }
}

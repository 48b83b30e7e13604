use crate::types::{now_ts, Account, Folder};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};

/// Account profile and folder list. Messages themselves live in the
/// per-account cache file, not here.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl Database {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePool::connect(&url)
            .await
            .with_context(|| format!("connecting to sqlite at {}", db_path.display()))?;

        let db = Database {
            pool,
            path: Some(db_path.to_path_buf()),
        };
        db.migrate().await?;
        Ok(db)
    }

    /// Private in-memory database; one connection so every query sees the
    /// same schema.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("opening in-memory sqlite")?;
        let db = Database { pool, path: None };
        db.migrate().await?;
        Ok(db)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&self.pool)
            .await
            .context("enabling foreign keys")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                email TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                last_updated INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS folders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_email TEXT NOT NULL,
                path TEXT NOT NULL,
                name TEXT NOT NULL,
                icon TEXT NOT NULL,
                position INTEGER NOT NULL,
                UNIQUE(account_email, path),
                FOREIGN KEY (account_email) REFERENCES accounts(email) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_folders_account ON folders(account_email, position);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating tables")?;

        Ok(())
    }

    pub async fn save_account(&self, account: &Account) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (email, name, description, last_updated, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(email) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                last_updated = excluded.last_updated,
                updated_at = excluded.updated_at;
            "#,
        )
        .bind(&account.email)
        .bind(&account.name)
        .bind(&account.description)
        .bind(account.last_updated.map(|t| t.timestamp()))
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .context("upserting account")?;
        Ok(())
    }

    /// The signed-in account; the most recently touched one if several
    /// rows survived an earlier sign-in.
    pub async fn load_account(&self) -> Result<Option<Account>> {
        let row = sqlx::query(
            r#"
            SELECT email, name, description, last_updated, created_at, updated_at
            FROM accounts
            ORDER BY updated_at DESC
            LIMIT 1;
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("loading account")?;

        Ok(row.map(|row| Account {
            email: row.get(0),
            name: row.get(1),
            description: row.get(2),
            last_updated: row
                .get::<Option<i64>, _>(3)
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            created_at: row.get(4),
            updated_at: row.get(5),
        }))
    }

    pub async fn touch_last_updated(&self, email: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE accounts SET last_updated = ?1, updated_at = ?2 WHERE email = ?3;")
            .bind(at.timestamp())
            .bind(now_ts())
            .bind(email)
            .execute(&self.pool)
            .await
            .context("updating last_updated")?;
        Ok(())
    }

    /// Replace the stored folder list, keeping the given order.
    pub async fn save_folders(&self, email: &str, folders: &[Folder]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("starting folders tx")?;

        sqlx::query("DELETE FROM folders WHERE account_email = ?1;")
            .bind(email)
            .execute(&mut *tx)
            .await
            .context("clearing folders")?;

        for (position, folder) in folders.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO folders (account_email, path, name, icon, position)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(account_email, path) DO NOTHING;
                "#,
            )
            .bind(email)
            .bind(&folder.path)
            .bind(&folder.name)
            .bind(&folder.icon)
            .bind(position as i64)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting folder {}", folder.path))?;
        }

        tx.commit().await.context("committing folders tx")?;
        Ok(())
    }

    pub async fn load_folders(&self, email: &str) -> Result<Vec<Folder>> {
        let rows = sqlx::query(
            r#"
            SELECT name, icon, path
            FROM folders
            WHERE account_email = ?1
            ORDER BY position ASC;
            "#,
        )
        .bind(email)
        .fetch_all(&self.pool)
        .await
        .context("loading folders")?;

        Ok(rows
            .into_iter()
            .map(|row| Folder {
                name: row.get(0),
                icon: row.get(1),
                path: row.get(2),
            })
            .collect())
    }

    pub async fn delete_account(&self, email: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.context("starting delete tx")?;
        sqlx::query("DELETE FROM folders WHERE account_email = ?1;")
            .bind(email)
            .execute(&mut *tx)
            .await
            .context("deleting folders")?;
        sqlx::query("DELETE FROM accounts WHERE email = ?1;")
            .bind(email)
            .execute(&mut *tx)
            .await
            .context("deleting account")?;
        tx.commit().await.context("committing delete tx")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::well_known_folders;

    #[tokio::test]
    async fn account_round_trips_and_updates() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.load_account().await.unwrap().is_none());

        let mut account = Account::new("me@example.com");
        account.name = "Me".into();
        db.save_account(&account).await.unwrap();

        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        db.touch_last_updated(&account.email, at).await.unwrap();

        let loaded = db.load_account().await.unwrap().unwrap();
        assert_eq!(loaded.email, "me@example.com");
        assert_eq!(loaded.name, "Me");
        assert_eq!(loaded.last_updated, Some(at));
    }

    #[tokio::test]
    async fn folders_keep_order_and_stay_unique() {
        let db = Database::in_memory().await.unwrap();
        db.save_account(&Account::new("me@example.com")).await.unwrap();

        let mut folders = well_known_folders();
        folders.push(Folder::new("Receipts", "mailbox", "Receipts"));
        folders.push(Folder::new("Receipts", "mailbox", "Receipts"));
        db.save_folders("me@example.com", &folders).await.unwrap();

        let loaded = db.load_folders("me@example.com").await.unwrap();
        assert_eq!(loaded.len(), 5);
        assert_eq!(loaded[0].path, "INBOX");
        assert_eq!(loaded[4].path, "Receipts");

        // saving again replaces rather than appends
        db.save_folders("me@example.com", &loaded[..2]).await.unwrap();
        assert_eq!(db.load_folders("me@example.com").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_account_removes_everything() {
        let db = Database::in_memory().await.unwrap();
        db.save_account(&Account::new("me@example.com")).await.unwrap();
        db.save_folders("me@example.com", &well_known_folders())
            .await
            .unwrap();

        db.delete_account("me@example.com").await.unwrap();

        assert!(db.load_account().await.unwrap().is_none());
        assert!(db.load_folders("me@example.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_database_persists_between_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("retromail.db");
        {
            let db = Database::open(&path).await.unwrap();
            db.save_account(&Account::new("me@example.com")).await.unwrap();
        }
        let db = Database::open(&path).await.unwrap();
        assert_eq!(db.path(), Some(path.as_path()));
        assert!(db.load_account().await.unwrap().is_some());
    }
}

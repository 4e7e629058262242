//! Preference queries.

use hearth_core::db::unix_timestamp;

use super::db::Database;
use super::DatabaseError;

impl Database {
    /// Read a preference value, `None` when the key was never set.
    pub async fn get_preference(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM preferences WHERE key = ?")
                .bind(key)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.map(|(value,)| value))
    }

    /// Insert or overwrite a preference value.
    pub async fn set_preference(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO preferences (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            ",
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_preference_is_none() {
        let db = Database::open_in_memory().await.unwrap();
        assert_eq!(db.get_preference("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_then_get() {
        let db = Database::open_in_memory().await.unwrap();
        db.set_preference("myhearth_api_key", "k1").await.unwrap();
        assert_eq!(
            db.get_preference("myhearth_api_key").await.unwrap().as_deref(),
            Some("k1")
        );
    }

    #[tokio::test]
    async fn set_overwrites() {
        let db = Database::open_in_memory().await.unwrap();
        db.set_preference("myhearth_instance_id", "old").await.unwrap();
        db.set_preference("myhearth_instance_id", "new-id-42")
            .await
            .unwrap();
        assert_eq!(
            db.get_preference("myhearth_instance_id")
                .await
                .unwrap()
                .as_deref(),
            Some("new-id-42")
        );
    }
}

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use teloxide::types::UserId;

use crate::errors::BotError;
use crate::models::UserSession;

#[derive(Clone, Debug)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, BotError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;

        Ok(Database { pool })
    }

    /// Одно соединение без таймаутов: in-memory база живёт, пока живо соединение
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, BotError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Ok(Database { pool })
    }

    pub async fn init(&self) -> Result<(), BotError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_sessions (
                user_id INTEGER PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Загрузить все сессии. Запись, которую не удалось прочитать или которая
    /// не прошла проверку, заменяется сессией по умолчанию.
    pub async fn load_sessions(&self) -> Result<HashMap<UserId, UserSession>, BotError> {
        let rows = sqlx::query("SELECT user_id, data FROM user_sessions")
            .fetch_all(&self.pool)
            .await?;

        let mut sessions = HashMap::with_capacity(rows.len());
        for row in rows {
            let user_id = row.try_get::<i64, _>("user_id")? as u64;
            let record = row
                .try_get::<String, _>("data")
                .map_err(BotError::from)
                .and_then(|data| Ok(serde_json::from_str::<UserSession>(&data)?));

            let session = match record {
                Ok(session) if session.user_id == user_id && session.is_valid() => session,
                Ok(_) => {
                    log::warn!("⚠️ Invalid session record for user {}, resetting", user_id);
                    UserSession::new(user_id)
                }
                Err(e) => {
                    log::warn!("⚠️ Unreadable session record for user {}: {}, resetting", user_id, e);
                    UserSession::new(user_id)
                }
            };
            sessions.insert(UserId(user_id), session);
        }

        log::info!("✅ Loaded {} user sessions", sessions.len());
        Ok(sessions)
    }

    pub async fn save_sessions(&self, sessions: &[UserSession]) -> Result<(), BotError> {
        let updated_at = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        for session in sessions {
            sqlx::query(
                r#"
                INSERT INTO user_sessions (user_id, data, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT (user_id)
                DO UPDATE SET
                    data = excluded.data,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(session.user_id as i64)
            .bind(serde_json::to_string(session)?)
            .bind(&updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        log::debug!("💾 {} user sessions saved", sessions.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TimerMode;

    async fn database() -> Database {
        let db = Database::in_memory().await.unwrap();
        db.init().await.unwrap();
        db
    }

    #[tokio::test]
    async fn saved_sessions_load_back_equal() {
        let db = database().await;

        let mut running = UserSession::new(1);
        running.is_running = true;
        running.is_timer_active = true;
        running.mode = TimerMode::Manual;
        running.timer_start = Some(1_000);
        running.timer_end = Some(4_600);
        running.available_count = 2;
        let idle = UserSession::new(2);

        db.save_sessions(&[running.clone(), idle.clone()]).await.unwrap();
        running.smoked_count = 4;
        db.save_sessions(&[running.clone()]).await.unwrap();

        let loaded = db.load_sessions().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&UserId(1)], running);
        assert_eq!(loaded[&UserId(2)], idle);
    }

    #[tokio::test]
    async fn broken_records_are_reset_to_defaults() {
        let db = database().await;

        sqlx::query("INSERT INTO user_sessions (user_id, data, updated_at) VALUES (5, ?1, '')")
            .bind(r#"{"user_id": 5, "is_running": true}"#)
            .execute(&db.pool)
            .await
            .unwrap();

        let mut out_of_bounds = UserSession::new(6);
        out_of_bounds.interval_minutes = 10_000;
        db.save_sessions(&[out_of_bounds]).await.unwrap();

        // не-текстовое значение в колонке data
        sqlx::query("INSERT INTO user_sessions (user_id, data, updated_at) VALUES (7, X'00FF', '')")
            .execute(&db.pool)
            .await
            .unwrap();

        let loaded = db.load_sessions().await.unwrap();
        assert_eq!(loaded[&UserId(5)], UserSession::new(5));
        assert_eq!(loaded[&UserId(6)], UserSession::new(6));
        assert_eq!(loaded[&UserId(7)], UserSession::new(7));
    }
}

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::session::Session;

/// Persistent session history under `<DATA_DIR>/sessions.db`. Everything in
/// here is best-effort from the caller's point of view: a failed write is a
/// warning, never a failed session.
pub struct SessionLogStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct HistoryRow {
    pub id: String,
    pub url: String,
    pub anon_ip: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub end_reason: Option<String>,
}

impl SessionLogStore {
    pub async fn open(data_dir: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data dir {}", data_dir))?;

        let url = format!("sqlite://{}/sessions.db?mode=rwc", data_dir);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .context("Failed to open session log database")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_log (
                id            TEXT PRIMARY KEY,
                url           TEXT NOT NULL,
                anon_ip       TEXT NOT NULL,
                started_at    TEXT NOT NULL,
                ended_at      TEXT,
                duration_secs INTEGER,
                end_reason    TEXT
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_session_log_started ON session_log (started_at)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub async fn record_start(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session_log (id, url, anon_ip, started_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(session.id.to_string())
        .bind(&session.url)
        .bind(&session.anon_ip)
        .bind(session.started_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_end(
        &self,
        id: Uuid,
        reason: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE session_log
            SET ended_at = $2,
                end_reason = $3,
                duration_secs = CAST((julianday($2) - julianday(started_at)) * 86400 AS INTEGER)
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(ended_at)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Paginated history, newest first. `search` matches URL or anonymized
    /// IP as a substring.
    pub async fn history(
        &self,
        page: u32,
        per_page: u32,
        search: Option<&str>,
    ) -> Result<(Vec<HistoryRow>, i64)> {
        let per_page = per_page.clamp(1, 200);
        let offset = (page.max(1) - 1) * per_page;
        let pattern = search.map(|s| format!("%{}%", s));

        let (rows, total) = match &pattern {
            Some(pattern) => {
                let rows = sqlx::query_as::<_, HistoryRow>(
                    r#"
                    SELECT id, url, anon_ip, started_at, ended_at, duration_secs, end_reason
                    FROM session_log
                    WHERE url LIKE $1 OR anon_ip LIKE $1
                    ORDER BY started_at DESC
                    LIMIT $2 OFFSET $3
                    "#,
                )
                .bind(pattern)
                .bind(per_page as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?;

                let total = sqlx::query(
                    "SELECT COUNT(*) AS n FROM session_log WHERE url LIKE $1 OR anon_ip LIKE $1",
                )
                .bind(pattern)
                .fetch_one(&self.pool)
                .await?
                .get::<i64, _>("n");

                (rows, total)
            }
            None => {
                let rows = sqlx::query_as::<_, HistoryRow>(
                    r#"
                    SELECT id, url, anon_ip, started_at, ended_at, duration_secs, end_reason
                    FROM session_log
                    ORDER BY started_at DESC
                    LIMIT $1 OFFSET $2
                    "#,
                )
                .bind(per_page as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?;

                let total = sqlx::query("SELECT COUNT(*) AS n FROM session_log")
                    .fetch_one(&self.pool)
                    .await?
                    .get::<i64, _>("n");

                (rows, total)
            }
        };

        Ok((rows, total))
    }

    pub async fn sessions_since(&self, cutoff: DateTime<Utc>) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM session_log WHERE started_at >= $1")
            .bind(cutoff)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    /// Average completed-session duration since the cutoff, when any exist.
    pub async fn avg_duration_since(&self, cutoff: DateTime<Utc>) -> Result<Option<f64>> {
        let row = sqlx::query(
            r#"
            SELECT AVG(duration_secs) AS avg_secs
            FROM session_log
            WHERE started_at >= $1 AND duration_secs IS NOT NULL
            "#,
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<Option<f64>, _>("avg_secs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use chrono::Duration as ChronoDuration;

    fn sample_session(url: &str, anon_ip: &str) -> Session {
        let now = Utc::now();
        Session {
            id: Uuid::new_v4(),
            container_id: Uuid::new_v4(),
            port: 4000,
            url: url.to_string(),
            anon_ip: anon_ip.to_string(),
            started_at: now,
            expires_at: now + ChronoDuration::seconds(300),
            status: SessionStatus::Active,
            end_reason: None,
            ended_at: None,
        }
    }

    #[tokio::test]
    async fn start_end_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionLogStore::open(dir.path().to_str().unwrap())
            .await
            .unwrap();

        let session = sample_session("https://example.com", "10.0.0.*");
        store.record_start(&session).await.unwrap();
        store
            .record_end(
                session.id,
                "user_ended",
                session.started_at + ChronoDuration::seconds(42),
            )
            .await
            .unwrap();

        let (rows, total) = store.history(1, 10, None).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].id, session.id.to_string());
        assert_eq!(rows[0].end_reason.as_deref(), Some("user_ended"));
        assert_eq!(rows[0].duration_secs, Some(42));
    }

    #[tokio::test]
    async fn history_search_matches_url_and_ip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionLogStore::open(dir.path().to_str().unwrap())
            .await
            .unwrap();

        store
            .record_start(&sample_session("https://example.com", "10.0.0.*"))
            .await
            .unwrap();
        store
            .record_start(&sample_session("https://rust-lang.org", "192.168.1.*"))
            .await
            .unwrap();

        let (rows, total) = store.history(1, 10, Some("rust-lang")).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].url, "https://rust-lang.org");

        let (rows, total) = store.history(1, 10, Some("10.0.0")).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].anon_ip, "10.0.0.*");
    }

    #[tokio::test]
    async fn aggregates_count_and_average() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionLogStore::open(dir.path().to_str().unwrap())
            .await
            .unwrap();

        let a = sample_session("https://a.example", "10.0.0.*");
        let b = sample_session("https://b.example", "10.0.1.*");
        store.record_start(&a).await.unwrap();
        store.record_start(&b).await.unwrap();
        store
            .record_end(a.id, "expired", a.started_at + ChronoDuration::seconds(100))
            .await
            .unwrap();
        store
            .record_end(b.id, "expired", b.started_at + ChronoDuration::seconds(300))
            .await
            .unwrap();

        let cutoff = Utc::now() - ChronoDuration::days(7);
        assert_eq!(store.sessions_since(cutoff).await.unwrap(), 2);
        let avg = store.avg_duration_since(cutoff).await.unwrap().unwrap();
        assert!((avg - 200.0).abs() < 1.0);
    }
}

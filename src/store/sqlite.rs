// src/store/sqlite.rs
//! SQLite backend (sqlx). Timestamps are stored as unix milliseconds so ordering
//! and range comparisons are plain integer comparisons.
//!
//! - `raw_items` is unique on `(scope, fingerprint)`: insert-or-ignore gives dedup.
//! - `articles` is unique on `(scope, url)`: `ON CONFLICT DO UPDATE` gives the upsert,
//!   with the ERROR→UNCATEGORIZED guard expressed in SQL.
//! - claims are conditional `UPDATE ... WHERE state = 'PENDING'` (compare-and-set).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use super::{
    ArticleStore, FetchStateStore, RawStore, StoreError, StoreResult, PLACEHOLDER_LABEL,
};
use crate::model::{
    ArticleUpsert, CanonicalArticle, Categorization, FetchStateFilter, FetchStateRecord,
    InsertOutcome, NewRawItem, ProcessingState, RawItem, RawStats, Scope,
};
use crate::taxonomy::Category;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS raw_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint TEXT NOT NULL,
    scope TEXT NOT NULL,
    provider TEXT NOT NULL,
    url TEXT NOT NULL,
    title TEXT NOT NULL,
    summary TEXT NOT NULL,
    published_at INTEGER NOT NULL,
    payload TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'PENDING',
    error TEXT,
    created_at INTEGER NOT NULL,
    processing_started_at INTEGER,
    UNIQUE (scope, fingerprint)
);
CREATE INDEX IF NOT EXISTS idx_raw_state_created ON raw_items (state, created_at, id);
CREATE INDEX IF NOT EXISTS idx_raw_scope_provider ON raw_items (scope, provider, published_at);

CREATE TABLE IF NOT EXISTS articles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scope TEXT NOT NULL,
    url TEXT NOT NULL,
    title TEXT NOT NULL,
    summary TEXT NOT NULL,
    published_at INTEGER NOT NULL,
    provider TEXT NOT NULL,
    category TEXT NOT NULL,
    secondary_label TEXT NOT NULL DEFAULT '',
    error_log TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (scope, url)
);
CREATE INDEX IF NOT EXISTS idx_articles_category ON articles (category, updated_at);
CREATE INDEX IF NOT EXISTS idx_articles_scope_published ON articles (scope, published_at);

CREATE TABLE IF NOT EXISTS fetch_state (
    scope TEXT NOT NULL,
    provider TEXT NOT NULL,
    window_start INTEGER NOT NULL,
    window_end INTEGER NOT NULL,
    articles_fetched INTEGER NOT NULL DEFAULT 0,
    articles_stored INTEGER NOT NULL DEFAULT 0,
    last_run_at INTEGER NOT NULL,
    status TEXT NOT NULL,
    PRIMARY KEY (scope, provider)
);
"#;

const ARTICLE_COLUMNS: &str = "id, scope, url, title, summary, published_at, provider, \
     category, secondary_label, error_log, created_at, updated_at";

const RAW_COLUMNS: &str = "id, fingerprint, scope, provider, url, title, summary, published_at, \
     payload, state, error, created_at, processing_started_at";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `url` and ensure the schema exists.
    /// `sqlite::memory:` gives a private in-memory database on a single connection.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let in_memory = url.contains(":memory:");
        let mut opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            opts = opts.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(opts)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(opts)
                .await?
        };

        let store = Self { pool };
        store.migrate().await?;
        info!(target: "store", in_memory, "sqlite store ready");
        Ok(store)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn parse_scope(s: &str) -> StoreResult<Scope> {
    s.parse().map_err(StoreError::Corrupt)
}

fn parse_category(s: &str) -> StoreResult<Category> {
    s.parse()
        .map_err(|e: crate::taxonomy::UnknownCategory| StoreError::Corrupt(e.to_string()))
}

fn raw_from_row(row: &SqliteRow) -> StoreResult<RawItem> {
    let scope: String = row.try_get("scope")?;
    let state: String = row.try_get("state")?;
    let payload: String = row.try_get("payload")?;
    let started: Option<i64> = row.try_get("processing_started_at")?;
    Ok(RawItem {
        id: row.try_get("id")?,
        fingerprint: row.try_get("fingerprint")?,
        scope: parse_scope(&scope)?,
        provider: row.try_get("provider")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        summary: row.try_get("summary")?,
        published_at: from_millis(row.try_get("published_at")?)?,
        payload: serde_json::from_str(&payload)?,
        state: ProcessingState::from_str(&state).map_err(StoreError::Corrupt)?,
        error: row.try_get("error")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        processing_started_at: started.map(from_millis).transpose()?,
    })
}

fn article_from_row(row: &SqliteRow) -> StoreResult<CanonicalArticle> {
    let scope: String = row.try_get("scope")?;
    let category: String = row.try_get("category")?;
    Ok(CanonicalArticle {
        id: row.try_get("id")?,
        scope: parse_scope(&scope)?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        summary: row.try_get("summary")?,
        published_at: from_millis(row.try_get("published_at")?)?,
        provider: row.try_get("provider")?,
        category: parse_category(&category)?,
        secondary_label: row.try_get("secondary_label")?,
        error_log: row.try_get("error_log")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

fn fetch_state_from_row(row: &SqliteRow) -> StoreResult<FetchStateRecord> {
    let scope: String = row.try_get("scope")?;
    let fetched: i64 = row.try_get("articles_fetched")?;
    let stored: i64 = row.try_get("articles_stored")?;
    Ok(FetchStateRecord {
        scope: parse_scope(&scope)?,
        provider: row.try_get("provider")?,
        window_start: from_millis(row.try_get("window_start")?)?,
        window_end: from_millis(row.try_get("window_end")?)?,
        articles_fetched: fetched.max(0) as u64,
        articles_stored: stored.max(0) as u64,
        last_run_at: from_millis(row.try_get("last_run_at")?)?,
        status: row.try_get("status")?,
    })
}

#[async_trait]
impl RawStore for SqliteStore {
    async fn insert_raw(&self, item: &NewRawItem) -> StoreResult<InsertOutcome> {
        let payload = serde_json::to_string(&item.payload)?;
        let res = sqlx::query(
            r#"
            INSERT INTO raw_items
                (fingerprint, scope, provider, url, title, summary, published_at, payload, state, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'PENDING', ?9)
            ON CONFLICT (scope, fingerprint) DO NOTHING
            "#,
        )
        .bind(&item.fingerprint)
        .bind(item.scope.to_string())
        .bind(&item.provider)
        .bind(&item.url)
        .bind(&item.title)
        .bind(&item.summary)
        .bind(to_millis(item.published_at))
        .bind(payload)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(if res.rows_affected() == 1 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::Duplicate
        })
    }

    async fn pending_raw(&self, limit: usize) -> StoreResult<Vec<RawItem>> {
        let sql = format!(
            "SELECT {RAW_COLUMNS} FROM raw_items WHERE state = 'PENDING' \
             ORDER BY created_at ASC, id ASC LIMIT ?1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(raw_from_row).collect()
    }

    async fn claim_raw(&self, ids: &[i64], now: DateTime<Utc>) -> StoreResult<Vec<i64>> {
        let mut claimed = Vec::with_capacity(ids.len());
        for &id in ids {
            let res = sqlx::query(
                "UPDATE raw_items SET state = 'PROCESSING', processing_started_at = ?1 \
                 WHERE id = ?2 AND state = 'PENDING'",
            )
            .bind(to_millis(now))
            .bind(id)
            .execute(&self.pool)
            .await?;
            if res.rows_affected() == 1 {
                claimed.push(id);
            }
        }
        Ok(claimed)
    }

    async fn mark_raw_done(&self, id: i64) -> StoreResult<()> {
        sqlx::query("UPDATE raw_items SET state = 'DONE', error = NULL WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_raw_failed(&self, id: i64, error: &str) -> StoreResult<()> {
        sqlx::query("UPDATE raw_items SET state = 'FAILED', error = ?1 WHERE id = ?2")
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_pending(&self) -> StoreResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM raw_items WHERE state = 'PENDING'")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let res = sqlx::query(
            "UPDATE raw_items SET state = 'PENDING', processing_started_at = NULL \
             WHERE state = 'PROCESSING' \
               AND (processing_started_at IS NULL OR processing_started_at < ?1)",
        )
        .bind(to_millis(older_than))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn raw_stats(&self) -> StoreResult<RawStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM raw_items GROUP BY state")
            .fetch_all(&self.pool)
            .await?;
        let mut s = RawStats::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n = row.try_get::<i64, _>("n")?.max(0) as u64;
            s.total += n;
            match ProcessingState::from_str(&state).map_err(StoreError::Corrupt)? {
                ProcessingState::Pending => s.pending += n,
                ProcessingState::Processing => s.processing += n,
                ProcessingState::Done => s.done += n,
                ProcessingState::Failed => s.failed += n,
            }
        }
        Ok(s)
    }

    async fn latest_published_at(
        &self,
        scope: &Scope,
        provider: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MAX(published_at) AS m FROM raw_items WHERE scope = ?1 AND provider = ?2",
        )
        .bind(scope.to_string())
        .bind(provider)
        .fetch_one(&self.pool)
        .await?;
        let m: Option<i64> = row.try_get("m")?;
        m.map(from_millis).transpose()
    }
}

#[async_trait]
impl ArticleStore for SqliteStore {
    async fn upsert_article(&self, a: &ArticleUpsert) -> StoreResult<i64> {
        let now = to_millis(Utc::now());
        let row = sqlx::query(
            r#"
            INSERT INTO articles
                (scope, url, title, summary, published_at, provider, category,
                 secondary_label, error_log, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
            ON CONFLICT (scope, url) DO UPDATE SET
                title = excluded.title,
                summary = excluded.summary,
                published_at = excluded.published_at,
                provider = excluded.provider,
                secondary_label = CASE
                    WHEN articles.category = 'ERROR' AND excluded.category = 'UNCATEGORIZED'
                    THEN articles.secondary_label ELSE excluded.secondary_label END,
                error_log = CASE
                    WHEN articles.category = 'ERROR' AND excluded.category = 'UNCATEGORIZED'
                    THEN articles.error_log ELSE excluded.error_log END,
                category = CASE
                    WHEN articles.category = 'ERROR' AND excluded.category = 'UNCATEGORIZED'
                    THEN articles.category ELSE excluded.category END,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(a.scope.to_string())
        .bind(&a.url)
        .bind(&a.title)
        .bind(&a.summary)
        .bind(to_millis(a.published_at))
        .bind(&a.provider)
        .bind(a.outcome.category().as_str())
        .bind(a.outcome.secondary_label())
        .bind(a.outcome.error_log())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn uncategorized_articles(&self, limit: usize) -> StoreResult<Vec<CanonicalArticle>> {
        let sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE category = 'UNCATEGORIZED' \
             ORDER BY updated_at ASC, id ASC LIMIT ?1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(article_from_row).collect()
    }

    async fn update_article(&self, id: i64, outcome: &Categorization) -> StoreResult<()> {
        sqlx::query(
            "UPDATE articles SET category = ?1, secondary_label = ?2, error_log = ?3, updated_at = ?4 \
             WHERE id = ?5 AND NOT (category = 'ERROR' AND ?1 = 'UNCATEGORIZED')",
        )
        .bind(outcome.category().as_str())
        .bind(outcome.secondary_label())
        .bind(outcome.error_log())
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn article(&self, scope: &Scope, url: &str) -> StoreResult<Option<CanonicalArticle>> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE scope = ?1 AND url = ?2");
        let row = sqlx::query(&sql)
            .bind(scope.to_string())
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(article_from_row).transpose()
    }

    async fn articles_by_category(
        &self,
        category: Category,
        limit: usize,
    ) -> StoreResult<Vec<CanonicalArticle>> {
        let sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE category = ?1 \
             ORDER BY published_at DESC, id DESC LIMIT ?2"
        );
        let rows = sqlx::query(&sql)
            .bind(category.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(article_from_row).collect()
    }

    async fn news_stack(
        &self,
        scope: &Scope,
        limit: usize,
        excluded: &[Category],
    ) -> StoreResult<Vec<CanonicalArticle>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE scope = "
        ));
        qb.push_bind(scope.to_string());
        if !excluded.is_empty() {
            qb.push(" AND category NOT IN (");
            let mut sep = qb.separated(", ");
            for c in excluded {
                sep.push_bind(c.as_str());
            }
            sep.push_unseparated(")");
        }
        qb.push(" ORDER BY published_at DESC, id DESC LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(article_from_row).collect()
    }

    async fn count_articles(&self) -> StoreResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM articles")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    async fn scrub_placeholder_labels(&self) -> StoreResult<u64> {
        let res = sqlx::query(
            "UPDATE articles SET secondary_label = '', updated_at = ?1 \
             WHERE LOWER(TRIM(secondary_label)) = ?2",
        )
        .bind(to_millis(Utc::now()))
        .bind(PLACEHOLDER_LABEL)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl FetchStateStore for SqliteStore {
    async fn fetch_state(
        &self,
        scope: &Scope,
        provider: &str,
    ) -> StoreResult<Option<FetchStateRecord>> {
        let row = sqlx::query(
            "SELECT scope, provider, window_start, window_end, articles_fetched, \
             articles_stored, last_run_at, status \
             FROM fetch_state WHERE scope = ?1 AND provider = ?2",
        )
        .bind(scope.to_string())
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(fetch_state_from_row).transpose()
    }

    async fn save_fetch_state(&self, r: &FetchStateRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO fetch_state
                (scope, provider, window_start, window_end, articles_fetched,
                 articles_stored, last_run_at, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (scope, provider) DO UPDATE SET
                window_start = excluded.window_start,
                window_end = excluded.window_end,
                articles_fetched = excluded.articles_fetched,
                articles_stored = excluded.articles_stored,
                last_run_at = excluded.last_run_at,
                status = excluded.status
            "#,
        )
        .bind(r.scope.to_string())
        .bind(&r.provider)
        .bind(to_millis(r.window_start))
        .bind(to_millis(r.window_end))
        .bind(r.articles_fetched as i64)
        .bind(r.articles_stored as i64)
        .bind(to_millis(r.last_run_at))
        .bind(&r.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_fetch_state(&self, filter: &FetchStateFilter) -> StoreResult<u64> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM fetch_state WHERE 1 = 1");
        if let Some(scope) = &filter.scope {
            qb.push(" AND scope = ");
            qb.push_bind(scope.to_string());
        }
        if let Some(provider) = &filter.provider {
            qb.push(" AND provider = ");
            qb.push_bind(provider.clone());
        }
        let res = qb.build().execute(&self.pool).await?;
        Ok(res.rows_affected())
    }
}

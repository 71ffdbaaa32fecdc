// src/store/memory.rs
//! In-process store. One mutex over all tables, so every trait call is atomic
//! with respect to the others, which is what the sqlite backend gets from its
//! unique indexes and conditional updates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{
    accepts_transition, ArticleStore, FetchStateStore, RawStore, StoreError, StoreResult,
    PLACEHOLDER_LABEL,
};
use crate::model::{
    ArticleUpsert, CanonicalArticle, Categorization, FetchStateFilter, FetchStateRecord,
    InsertOutcome, NewRawItem, ProcessingState, RawItem, RawStats, Scope,
};
use crate::taxonomy::Category;

#[derive(Debug, Default)]
struct Tables {
    raw: Vec<RawItem>,
    raw_keys: HashMap<(Scope, String), usize>,
    articles: Vec<CanonicalArticle>,
    article_keys: HashMap<(Scope, String), usize>,
    fetch_state: HashMap<(Scope, String), FetchStateRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store mutex poisoned".into()))
    }

    /// Snapshot of every raw row, in insertion order. Test and debugging aid.
    pub fn raw_snapshot(&self) -> StoreResult<Vec<RawItem>> {
        Ok(self.tables()?.raw.clone())
    }

    /// Snapshot of every canonical row, in insertion order.
    pub fn article_snapshot(&self) -> StoreResult<Vec<CanonicalArticle>> {
        Ok(self.tables()?.articles.clone())
    }
}

fn raw_by_id(t: &mut Tables, id: i64) -> StoreResult<&mut RawItem> {
    t.raw
        .iter_mut()
        .find(|r| r.id == id)
        .ok_or_else(|| StoreError::Corrupt(format!("raw item {id} not found")))
}

fn apply_outcome(row: &mut CanonicalArticle, outcome: &Categorization, now: DateTime<Utc>) {
    let incoming = outcome.category();
    if !accepts_transition(Some(row.category), incoming) {
        return;
    }
    row.category = incoming;
    row.secondary_label = outcome.secondary_label().to_string();
    row.error_log = outcome.error_log().map(str::to_string);
    row.updated_at = now;
}

#[async_trait]
impl RawStore for MemoryStore {
    async fn insert_raw(&self, item: &NewRawItem) -> StoreResult<InsertOutcome> {
        let mut t = self.tables()?;
        let key = (item.scope.clone(), item.fingerprint.clone());
        if t.raw_keys.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        let id = t.raw.len() as i64 + 1;
        t.raw.push(RawItem {
            id,
            fingerprint: item.fingerprint.clone(),
            scope: item.scope.clone(),
            provider: item.provider.clone(),
            url: item.url.clone(),
            title: item.title.clone(),
            summary: item.summary.clone(),
            published_at: item.published_at,
            payload: item.payload.clone(),
            state: ProcessingState::Pending,
            error: None,
            created_at: Utc::now(),
            processing_started_at: None,
        });
        let idx = t.raw.len() - 1;
        t.raw_keys.insert(key, idx);
        Ok(InsertOutcome::Inserted)
    }

    async fn pending_raw(&self, limit: usize) -> StoreResult<Vec<RawItem>> {
        let t = self.tables()?;
        let mut out: Vec<RawItem> = t
            .raw
            .iter()
            .filter(|r| r.state == ProcessingState::Pending)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out.truncate(limit);
        Ok(out)
    }

    async fn claim_raw(&self, ids: &[i64], now: DateTime<Utc>) -> StoreResult<Vec<i64>> {
        let mut t = self.tables()?;
        let mut claimed = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(r) = t.raw.iter_mut().find(|r| r.id == id) {
                if r.state == ProcessingState::Pending {
                    r.state = ProcessingState::Processing;
                    r.processing_started_at = Some(now);
                    claimed.push(id);
                }
            }
        }
        Ok(claimed)
    }

    async fn mark_raw_done(&self, id: i64) -> StoreResult<()> {
        let mut t = self.tables()?;
        let r = raw_by_id(&mut t, id)?;
        r.state = ProcessingState::Done;
        r.error = None;
        Ok(())
    }

    async fn mark_raw_failed(&self, id: i64, error: &str) -> StoreResult<()> {
        let mut t = self.tables()?;
        let r = raw_by_id(&mut t, id)?;
        r.state = ProcessingState::Failed;
        r.error = Some(error.to_string());
        Ok(())
    }

    async fn count_pending(&self) -> StoreResult<u64> {
        let t = self.tables()?;
        Ok(t.raw
            .iter()
            .filter(|r| r.state == ProcessingState::Pending)
            .count() as u64)
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut t = self.tables()?;
        let mut n = 0;
        for r in t.raw.iter_mut() {
            let stale = r.state == ProcessingState::Processing
                && r.processing_started_at.map_or(true, |ts| ts < older_than);
            if stale {
                r.state = ProcessingState::Pending;
                r.processing_started_at = None;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn raw_stats(&self) -> StoreResult<RawStats> {
        let t = self.tables()?;
        let mut s = RawStats::default();
        for r in &t.raw {
            s.total += 1;
            match r.state {
                ProcessingState::Pending => s.pending += 1,
                ProcessingState::Processing => s.processing += 1,
                ProcessingState::Done => s.done += 1,
                ProcessingState::Failed => s.failed += 1,
            }
        }
        Ok(s)
    }

    async fn latest_published_at(
        &self,
        scope: &Scope,
        provider: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let t = self.tables()?;
        Ok(t.raw
            .iter()
            .filter(|r| &r.scope == scope && r.provider == provider)
            .map(|r| r.published_at)
            .max())
    }
}

#[async_trait]
impl ArticleStore for MemoryStore {
    async fn upsert_article(&self, a: &ArticleUpsert) -> StoreResult<i64> {
        let mut t = self.tables()?;
        let now = Utc::now();
        let key = (a.scope.clone(), a.url.clone());
        let existing = t.article_keys.get(&key).copied();
        if let Some(idx) = existing {
            let row = &mut t.articles[idx];
            row.title = a.title.clone();
            row.summary = a.summary.clone();
            row.published_at = a.published_at;
            row.provider = a.provider.clone();
            row.updated_at = now;
            apply_outcome(row, &a.outcome, now);
            return Ok(row.id);
        }
        let id = t.articles.len() as i64 + 1;
        t.articles.push(CanonicalArticle {
            id,
            scope: a.scope.clone(),
            url: a.url.clone(),
            title: a.title.clone(),
            summary: a.summary.clone(),
            published_at: a.published_at,
            provider: a.provider.clone(),
            category: a.outcome.category(),
            secondary_label: a.outcome.secondary_label().to_string(),
            error_log: a.outcome.error_log().map(str::to_string),
            created_at: now,
            updated_at: now,
        });
        let idx = t.articles.len() - 1;
        t.article_keys.insert(key, idx);
        Ok(id)
    }

    async fn uncategorized_articles(&self, limit: usize) -> StoreResult<Vec<CanonicalArticle>> {
        let t = self.tables()?;
        let mut out: Vec<CanonicalArticle> = t
            .articles
            .iter()
            .filter(|a| a.category == Category::Uncategorized)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        out.truncate(limit);
        Ok(out)
    }

    async fn update_article(&self, id: i64, outcome: &Categorization) -> StoreResult<()> {
        let mut t = self.tables()?;
        let row = t
            .articles
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| StoreError::Corrupt(format!("article {id} not found")))?;
        apply_outcome(row, outcome, Utc::now());
        Ok(())
    }

    async fn article(&self, scope: &Scope, url: &str) -> StoreResult<Option<CanonicalArticle>> {
        let t = self.tables()?;
        Ok(t
            .article_keys
            .get(&(scope.clone(), url.to_string()))
            .map(|&idx| t.articles[idx].clone()))
    }

    async fn articles_by_category(
        &self,
        category: Category,
        limit: usize,
    ) -> StoreResult<Vec<CanonicalArticle>> {
        let t = self.tables()?;
        let mut out: Vec<CanonicalArticle> = t
            .articles
            .iter()
            .filter(|a| a.category == category)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn news_stack(
        &self,
        scope: &Scope,
        limit: usize,
        excluded: &[Category],
    ) -> StoreResult<Vec<CanonicalArticle>> {
        let t = self.tables()?;
        let mut out: Vec<CanonicalArticle> = t
            .articles
            .iter()
            .filter(|a| &a.scope == scope && !excluded.contains(&a.category))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.published_at.cmp(&a.published_at).then(b.id.cmp(&a.id)));
        out.truncate(limit);
        Ok(out)
    }

    async fn count_articles(&self) -> StoreResult<u64> {
        Ok(self.tables()?.articles.len() as u64)
    }

    async fn scrub_placeholder_labels(&self) -> StoreResult<u64> {
        let mut t = self.tables()?;
        let now = Utc::now();
        let mut n = 0;
        for a in t.articles.iter_mut() {
            if a.secondary_label.trim().eq_ignore_ascii_case(PLACEHOLDER_LABEL) {
                a.secondary_label.clear();
                a.updated_at = now;
                n += 1;
            }
        }
        Ok(n)
    }
}

#[async_trait]
impl FetchStateStore for MemoryStore {
    async fn fetch_state(
        &self,
        scope: &Scope,
        provider: &str,
    ) -> StoreResult<Option<FetchStateRecord>> {
        let t = self.tables()?;
        Ok(t.fetch_state
            .get(&(scope.clone(), provider.to_string()))
            .cloned())
    }

    async fn save_fetch_state(&self, record: &FetchStateRecord) -> StoreResult<()> {
        let mut t = self.tables()?;
        t.fetch_state.insert(
            (record.scope.clone(), record.provider.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn clear_fetch_state(&self, filter: &FetchStateFilter) -> StoreResult<u64> {
        let mut t = self.tables()?;
        let before = t.fetch_state.len();
        t.fetch_state
            .retain(|(scope, provider), _| !filter.matches(scope, provider));
        Ok((before - t.fetch_state.len()) as u64)
    }
}

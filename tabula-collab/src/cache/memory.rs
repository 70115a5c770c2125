//! In-process cache double with faithful sorted-set semantics.
//!
//! Implements the same command contract and the same score-based rank
//! manipulation as the Redis client, so the page ordering contract can
//! be exercised without a cache service. Ties on score break
//! lexicographically by page id, matching sorted-set behavior.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use tabula_core::{PageMeta, Stroke};

use super::{CacheError, PageCache};

#[derive(Default)]
struct SessionEntry {
    /// (page id, score), kept sorted by (score, page id).
    rank: Vec<(String, i64)>,
    /// page id → stroke id → stroke JSON.
    strokes: HashMap<String, HashMap<String, String>>,
    meta: HashMap<String, PageMeta>,
}

impl SessionEntry {
    fn resort(&mut self) {
        self.rank
            .sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    }
}

/// In-memory [`PageCache`] implementation.
#[derive(Default)]
pub struct MemoryCache {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PageCache for MemoryCache {
    async fn update_strokes(
        &self,
        session_id: &str,
        strokes: &[Stroke],
    ) -> Result<(), CacheError> {
        let mut sessions = self.sessions.lock().expect("cache lock");
        let entry = sessions.entry(session_id.to_string()).or_default();
        for stroke in strokes {
            if stroke.is_deleted() {
                if let Some(page) = entry.strokes.get_mut(&stroke.page_id) {
                    page.remove(&stroke.id);
                }
            } else {
                let raw = serde_json::to_string(stroke)?;
                entry
                    .strokes
                    .entry(stroke.page_id.clone())
                    .or_default()
                    .insert(stroke.id.clone(), raw);
            }
        }
        Ok(())
    }

    async fn get_page_strokes(
        &self,
        session_id: &str,
        page_id: &str,
    ) -> Result<Vec<Vec<u8>>, CacheError> {
        let sessions = self.sessions.lock().expect("cache lock");
        Ok(sessions
            .get(session_id)
            .and_then(|entry| entry.strokes.get(page_id))
            .map(|page| page.values().map(|raw| raw.as_bytes().to_vec()).collect())
            .unwrap_or_default())
    }

    async fn get_page_rank(&self, session_id: &str) -> Result<Vec<String>, CacheError> {
        let sessions = self.sessions.lock().expect("cache lock");
        Ok(sessions
            .get(session_id)
            .map(|entry| entry.rank.iter().map(|(pid, _)| pid.clone()).collect())
            .unwrap_or_default())
    }

    async fn get_page_meta(
        &self,
        session_id: &str,
        page_id: &str,
    ) -> Result<PageMeta, CacheError> {
        let sessions = self.sessions.lock().expect("cache lock");
        sessions
            .get(session_id)
            .and_then(|entry| entry.meta.get(page_id))
            .cloned()
            .ok_or_else(|| CacheError::PageNotFound(page_id.to_string()))
    }

    async fn set_page_meta(
        &self,
        session_id: &str,
        page_id: &str,
        meta: &PageMeta,
    ) -> Result<(), CacheError> {
        let mut sessions = self.sessions.lock().expect("cache lock");
        let entry = sessions.entry(session_id.to_string()).or_default();
        entry.meta.insert(page_id.to_string(), meta.clone());
        Ok(())
    }

    async fn add_page(
        &self,
        session_id: &str,
        page_id: &str,
        index: i64,
        meta: &PageMeta,
    ) -> Result<(), CacheError> {
        let mut sessions = self.sessions.lock().expect("cache lock");
        let entry = sessions.entry(session_id.to_string()).or_default();
        entry.meta.insert(page_id.to_string(), meta.clone());

        // Conditional insert: a page already in the rank keeps its score.
        if entry.rank.iter().any(|(pid, _)| pid == page_id) {
            return Ok(());
        }

        let len = entry.rank.len();
        let score = if len == 0 {
            0
        } else if index >= 0 && (index as usize) < len {
            // Shift everything at or after the target position up by one,
            // then take the vacated score.
            let at = index as usize;
            let target = entry.rank[at].1;
            for slot in entry.rank[at..].iter_mut() {
                slot.1 += 1;
            }
            target
        } else {
            entry.rank[len - 1].1 + 1
        };

        entry.rank.push((page_id.to_string(), score));
        entry.resort();
        Ok(())
    }

    async fn delete_page(&self, session_id: &str, page_id: &str) -> Result<(), CacheError> {
        let mut sessions = self.sessions.lock().expect("cache lock");
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.rank.retain(|(pid, _)| pid != page_id);
            entry.strokes.remove(page_id);
            entry.meta.remove(page_id);
        }
        Ok(())
    }

    async fn clear_page(&self, session_id: &str, page_id: &str) -> Result<(), CacheError> {
        let mut sessions = self.sessions.lock().expect("cache lock");
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.strokes.remove(page_id);
        }
        Ok(())
    }

    async fn clear_session(&self, session_id: &str) -> Result<(), CacheError> {
        let mut sessions = self.sessions.lock().expect("cache lock");
        sessions.remove(session_id);
        Ok(())
    }
}

//! Page catalogue operations of the control block.
//!
//! All page state of record lives in the cache; these operations keep
//! the control block's in-memory page-id set in step so stroke
//! sanitation never touches I/O. Ordering changes always go through the
//! cache's score-shifting insert — see `cache` for the algorithm.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use tabula_core::{Page, PageMeta, PageMetaUpdate, Stroke};

use crate::protocol::{Message, MessageType, PageSync, PageUpdateNotice, SERVER_SENDER};
use crate::session::{ControlBlock, SessionError};

/// One page to insert: target position plus caller-supplied meta.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInsert {
    pub page_id: String,
    /// Negative or past-end values append.
    #[serde(default = "append_index")]
    pub index: i64,
    #[serde(default)]
    pub meta: PageMeta,
}

fn append_index() -> i64 {
    -1
}

/// One page referenced by an update request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageTarget {
    pub page_id: String,
    #[serde(default)]
    pub meta: PageMetaUpdate,
}

/// Operations accepted by `update_pages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageUpdateOp {
    Meta,
    Delete,
    Clear,
}

impl PageUpdateOp {
    fn parse(operation: &str) -> Result<Self, SessionError> {
        match operation {
            "meta" => Ok(Self::Meta),
            "delete" => Ok(Self::Delete),
            "clear" => Ok(Self::Clear),
            other => Err(SessionError::UnknownUpdateOperation(other.to_string())),
        }
    }
}

impl ControlBlock {
    /// Add new pages at their requested positions. Rejects the whole
    /// request when any id already exists; a mid-request cache failure
    /// leaves earlier inserts in place, and clients always get the
    /// authoritative state via the closing `page-sync` broadcast.
    pub(crate) async fn add_pages_impl(
        &self,
        inserts: Vec<PageInsert>,
    ) -> Result<(), SessionError> {
        let session_id = self.id();
        let rank = self.cache.get_page_rank(&session_id).await?;
        for insert in &inserts {
            if rank.contains(&insert.page_id) {
                return Err(SessionError::PageAlreadyExists(insert.page_id.clone()));
            }
        }

        let mut result = Ok(());
        for insert in &inserts {
            match self
                .cache
                .add_page(&session_id, &insert.page_id, insert.index, &insert.meta)
                .await
            {
                Ok(()) => {
                    self.pages
                        .write()
                        .expect("pages lock")
                        .insert(insert.page_id.clone());
                }
                Err(e) => {
                    result = Err(e.into());
                    break;
                }
            }
        }

        self.broadcast_page_sync().await?;
        result
    }

    /// Apply `operation` to every referenced page. The whole request
    /// fails up front when any page id does not exist.
    pub(crate) async fn update_pages_impl(
        &self,
        targets: Vec<PageTarget>,
        operation: &str,
    ) -> Result<(), SessionError> {
        let op = PageUpdateOp::parse(operation)?;
        let session_id = self.id();

        let rank = self.cache.get_page_rank(&session_id).await?;
        for target in &targets {
            if !rank.contains(&target.page_id) {
                return Err(SessionError::PageNotFound(target.page_id.clone()));
            }
        }

        for target in &targets {
            match op {
                PageUpdateOp::Meta => {
                    let mut meta = self.cache.get_page_meta(&session_id, &target.page_id).await?;
                    meta.merge(&target.meta);
                    self.cache
                        .set_page_meta(&session_id, &target.page_id, &meta)
                        .await?;
                }
                PageUpdateOp::Delete => {
                    self.cache.delete_page(&session_id, &target.page_id).await?;
                    self.pages
                        .write()
                        .expect("pages lock")
                        .remove(&target.page_id);
                }
                PageUpdateOp::Clear => {
                    self.cache.clear_page(&session_id, &target.page_id).await?;
                }
            }
        }

        match op {
            // Deletes change the rank; resend the full catalogue.
            PageUpdateOp::Delete => self.broadcast_page_sync().await,
            _ => {
                let notice = PageUpdateNotice {
                    page_ids: targets.into_iter().map(|t| t.page_id).collect(),
                    clear: op == PageUpdateOp::Clear,
                };
                let msg = Message::new(MessageType::PageUpdate, SERVER_SENDER, &notice)?;
                self.broadcaster.broadcast(msg).await;
                Ok(())
            }
        }
    }

    pub(crate) async fn get_page_impl(&self, page_id: &str) -> Result<Page, SessionError> {
        let mut sync = self.assemble_pages(&[page_id.to_string()], true).await?;
        sync.pages
            .remove(page_id)
            .ok_or_else(|| SessionError::PageNotFound(page_id.to_string()))
    }

    /// Assemble meta (and optionally live strokes) for the given pages,
    /// preserving the given ordering. Any meta fetch failure aborts the
    /// whole call.
    pub(crate) async fn assemble_pages(
        &self,
        page_ids: &[String],
        with_strokes: bool,
    ) -> Result<PageSync, SessionError> {
        let session_id = self.id();
        let mut pages = HashMap::new();
        for page_id in page_ids {
            let meta = self.cache.get_page_meta(&session_id, page_id).await?;
            let mut page = Page::new(page_id.clone(), meta);
            if with_strokes {
                for raw in self.cache.get_page_strokes(&session_id, page_id).await? {
                    match serde_json::from_slice::<Stroke>(&raw) {
                        Ok(stroke) => page.strokes.push(stroke),
                        Err(e) => log::warn!("undecodable stroke on page {page_id}: {e}"),
                    }
                }
            }
            pages.insert(page_id.clone(), page);
        }
        Ok(PageSync {
            page_rank: page_ids.to_vec(),
            pages,
        })
    }

    /// Bulk reconciliation: re-insert every snapshot page at the end of
    /// the rank (idempotent — already-ranked pages keep their position)
    /// and re-apply its stroke set.
    pub(crate) async fn sync_session_impl(&self, snapshot: PageSync) -> Result<(), SessionError> {
        let session_id = self.id();
        for page_id in &snapshot.page_rank {
            let page = snapshot.pages.get(page_id).ok_or_else(|| {
                SessionError::BadContent(format!("snapshot missing page {page_id}"))
            })?;
            self.cache
                .add_page(&session_id, page_id, -1, &page.meta)
                .await?;
            if !page.strokes.is_empty() {
                self.cache.update_strokes(&session_id, &page.strokes).await?;
            }
            self.pages
                .write()
                .expect("pages lock")
                .insert(page_id.clone());
        }
        self.broadcast_page_sync().await
    }

    /// Broadcast the full rank with per-page meta.
    pub(crate) async fn broadcast_page_sync(&self) -> Result<(), SessionError> {
        let rank = self.cache.get_page_rank(&self.id()).await?;
        let sync = self.assemble_pages(&rank, false).await?;
        let msg = Message::new(MessageType::PageSync, SERVER_SENDER, &sync)?;
        self.broadcaster.broadcast(msg).await;
        Ok(())
    }
}

//! Page model — metadata and the assembled per-page view.
//!
//! A page is identified by an opaque string id chosen by the client. Its
//! metadata (canvas size, background) lives in the cache; the ordered
//! position of the page inside a session (the page rank) is kept as a
//! sparse integer score in the cache's sorted set and never stored here.

use serde::{Deserialize, Serialize};

use crate::stroke::Stroke;

/// Canvas dimensions of a page, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSize {
    pub width: u32,
    pub height: u32,
}

impl Default for PageSize {
    fn default() -> Self {
        // A4 at 72dpi-ish, the client default.
        Self {
            width: 620,
            height: 877,
        }
    }
}

/// Background rendering style of a page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStyle {
    #[default]
    Blank,
    Checkered,
    Ruled,
}

/// Page background: a style plus an optional attachment id for
/// image-backed pages ("paper").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageBackground {
    #[serde(default)]
    pub style: PageStyle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paper: Option<String>,
}

/// Metadata stored per page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageMeta {
    #[serde(default)]
    pub size: PageSize,
    #[serde(default)]
    pub background: PageBackground,
}

/// Partial metadata update; absent fields leave the stored value intact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageMetaUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<PageSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<PageBackground>,
}

impl PageMeta {
    /// Apply a partial update, replacing only the provided fields.
    pub fn merge(&mut self, update: &PageMetaUpdate) {
        if let Some(size) = update.size {
            self.size = size;
        }
        if let Some(ref background) = update.background {
            self.background = background.clone();
        }
    }
}

/// Assembled view of a page: meta plus its live (non-deleted) strokes.
/// Recreated per request; the cache is the source of record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub page_id: String,
    pub meta: PageMeta,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub strokes: Vec<Stroke>,
}

impl Page {
    pub fn new(page_id: impl Into<String>, meta: PageMeta) -> Self {
        Self {
            page_id: page_id.into(),
            meta,
            strokes: Vec::new(),
        }
    }
}

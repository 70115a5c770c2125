//! Stroke model — the atomic unit of canvas editing.
//!
//! A stroke is either a drawable object or a delete sentinel: a stroke
//! with `stroke_type == 0` carries only `id` and `page_id` and means
//! "remove the stroke with that id from that page". Every stroke belongs
//! to exactly one page.
//!
//! Wire and cache representation is camelCase JSON, so a stroke persisted
//! by the cache layer can be served back to clients byte-for-byte.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stroke type marker for delete sentinels.
pub const STROKE_TYPE_DELETE: i32 = 0;

/// Visual styling of a stroke. Opaque to the session core — routed and
/// persisted, never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrokeStyle {
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub width: f32,
    #[serde(default)]
    pub opacity: f32,
}

/// A single stroke edit on a page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stroke {
    /// Stroke kind; `0` is the delete sentinel.
    #[serde(rename = "type")]
    pub stroke_type: i32,
    pub id: String,
    pub page_id: String,
    #[serde(default)]
    pub user_id: Uuid,
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
    #[serde(default = "default_scale")]
    pub scale_x: f32,
    #[serde(default = "default_scale")]
    pub scale_y: f32,
    #[serde(default)]
    pub points: Vec<f32>,
    #[serde(default)]
    pub style: StrokeStyle,
}

fn default_scale() -> f32 {
    1.0
}

impl Stroke {
    /// Whether this stroke denotes deletion rather than a drawable.
    pub fn is_deleted(&self) -> bool {
        self.stroke_type == STROKE_TYPE_DELETE
    }

    /// Delete sentinel for the stroke `id` on `page_id`.
    pub fn deleted(id: impl Into<String>, page_id: impl Into<String>) -> Self {
        Self {
            stroke_type: STROKE_TYPE_DELETE,
            id: id.into(),
            page_id: page_id.into(),
            ..Self::default()
        }
    }
}

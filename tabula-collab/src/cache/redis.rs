//! Redis-backed cache client (production).
//!
//! The page rank is a sorted set with sparse integer scores; inserting
//! between two pages shifts only the scores at or after the target
//! position (`ZINCRBY`) and claims the vacated score with a conditional
//! `ZADD NX`, so concurrent duplicate inserts cannot reorder existing
//! entries. Strokes live in one hash per page so a batch upsert and the
//! raw read-back are both single commands.

use async_trait::async_trait;

use tabula_core::{PageMeta, Stroke};

use super::{meta_key, rank_key, strokes_key, CacheError, PageCache};

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Command(e.to_string())
    }
}

/// Redis [`PageCache`] implementation over a multiplexed connection.
pub struct RedisCache {
    client: redis::Client,
}

impl RedisCache {
    /// Create a client for the given `redis://` URL. Fails on an invalid
    /// URL; the first command establishes the connection.
    pub fn new(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(|e| CacheError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, CacheError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))
    }

    async fn rank_with_scores(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        session_id: &str,
    ) -> Result<Vec<(String, i64)>, CacheError> {
        let rank: Vec<(String, i64)> = redis::cmd("ZRANGE")
            .arg(rank_key(session_id))
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(conn)
            .await?;
        Ok(rank)
    }
}

#[async_trait]
impl PageCache for RedisCache {
    async fn update_strokes(
        &self,
        session_id: &str,
        strokes: &[Stroke],
    ) -> Result<(), CacheError> {
        if strokes.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for stroke in strokes {
            let key = strokes_key(session_id, &stroke.page_id);
            if stroke.is_deleted() {
                pipe.cmd("HDEL").arg(key).arg(&stroke.id).ignore();
            } else {
                let raw = serde_json::to_string(stroke)?;
                pipe.cmd("HSET").arg(key).arg(&stroke.id).arg(raw).ignore();
            }
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn get_page_strokes(
        &self,
        session_id: &str,
        page_id: &str,
    ) -> Result<Vec<Vec<u8>>, CacheError> {
        let mut conn = self.conn().await?;
        let strokes: Vec<Vec<u8>> = redis::cmd("HVALS")
            .arg(strokes_key(session_id, page_id))
            .query_async(&mut conn)
            .await?;
        Ok(strokes)
    }

    async fn get_page_rank(&self, session_id: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn().await?;
        let rank: Vec<String> = redis::cmd("ZRANGE")
            .arg(rank_key(session_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(rank)
    }

    async fn get_page_meta(
        &self,
        session_id: &str,
        page_id: &str,
    ) -> Result<PageMeta, CacheError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(meta_key(session_id, page_id))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Err(CacheError::PageNotFound(page_id.to_string())),
        }
    }

    async fn set_page_meta(
        &self,
        session_id: &str,
        page_id: &str,
        meta: &PageMeta,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let raw = serde_json::to_string(meta)?;
        redis::cmd("SET")
            .arg(meta_key(session_id, page_id))
            .arg(raw)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn add_page(
        &self,
        session_id: &str,
        page_id: &str,
        index: i64,
        meta: &PageMeta,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let rank = self.rank_with_scores(&mut conn, session_id).await?;

        let key = rank_key(session_id);
        let mut pipe = redis::pipe();

        let len = rank.len();
        let score = if len == 0 {
            0
        } else if index >= 0 && (index as usize) < len {
            let at = index as usize;
            for (pid, _) in &rank[at..] {
                pipe.cmd("ZINCRBY").arg(&key).arg(1).arg(pid).ignore();
            }
            rank[at].1
        } else {
            rank[len - 1].1 + 1
        };

        pipe.cmd("ZADD")
            .arg(&key)
            .arg("NX")
            .arg(score)
            .arg(page_id)
            .ignore();
        pipe.cmd("SET")
            .arg(meta_key(session_id, page_id))
            .arg(serde_json::to_string(meta)?)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn delete_page(&self, session_id: &str, page_id: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        redis::pipe()
            .cmd("DEL")
            .arg(strokes_key(session_id, page_id))
            .ignore()
            .cmd("DEL")
            .arg(meta_key(session_id, page_id))
            .ignore()
            .cmd("ZREM")
            .arg(rank_key(session_id))
            .arg(page_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear_page(&self, session_id: &str, page_id: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(strokes_key(session_id, page_id))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear_session(&self, session_id: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let pages: Vec<String> = redis::cmd("ZRANGE")
            .arg(rank_key(session_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        let mut pipe = redis::pipe();
        for page_id in &pages {
            pipe.cmd("DEL")
                .arg(strokes_key(session_id, page_id))
                .ignore();
            pipe.cmd("DEL").arg(meta_key(session_id, page_id)).ignore();
        }
        pipe.cmd("DEL").arg(rank_key(session_id)).ignore();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

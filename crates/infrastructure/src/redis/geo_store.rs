//! 地理单元格存储的 Redis 实现
//!
//! 每个单元格是一个哈希 `geo:cell:{cellId}`，字段为房间号、值为 JSON
//! 快照。多个单元格的读取合并进一个 pipeline，单次往返完成。

use application::{ApplicationError, GeoCellStore};
use domain::{CellId, RoomSnapshot};
use redis::aio::ConnectionManager;
use tracing::warn;

use super::map_redis_err;

fn cell_key(cell: &CellId) -> String {
    format!("geo:cell:{cell}")
}

#[derive(Clone)]
pub struct RedisGeoCellStore {
    conn: ConnectionManager,
}

impl RedisGeoCellStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait::async_trait]
impl GeoCellStore for RedisGeoCellStore {
    async fn snapshots_in(
        &self,
        cells: &[CellId],
    ) -> Result<Vec<RoomSnapshot>, ApplicationError> {
        if cells.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for cell in cells {
            pipe.hvals(cell_key(cell));
        }

        let mut conn = self.conn.clone();
        let raw: Vec<Vec<String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        let mut snapshots = Vec::new();
        for (cell, values) in cells.iter().zip(raw) {
            for value in values {
                match serde_json::from_str::<RoomSnapshot>(&value) {
                    Ok(snapshot) => snapshots.push(snapshot),
                    // 坏快照跳过，不让单个脏条目毁掉整个查询
                    Err(err) => warn!(cell = %cell, error = %err, "丢弃无法解析的房间快照"),
                }
            }
        }
        Ok(snapshots)
    }
}

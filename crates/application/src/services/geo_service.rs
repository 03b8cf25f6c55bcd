//! 附近房间查询
//!
//! 读路径：取查询点 3x3 邻域单元格里的全部房间快照，按半径过滤后
//! 升序返回。写路径（快照的写入与淘汰）由外部消费者根据生命周期
//! 事件维护，本服务只读。

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use domain::{
    cell_of, covering_cells, haversine_km, round_km_mm, CellId, DomainError, RoomId,
    RoomSnapshot, SEARCH_RADIUS_KM,
};
use serde::{Deserialize, Serialize};

use crate::error::ApplicationError;

/// 地理单元格存储端口。一次调用取回多个单元格的全部快照，
/// Redis 实现用 pipeline 合并为单个往返。
#[async_trait::async_trait]
pub trait GeoCellStore: Send + Sync {
    async fn snapshots_in(&self, cells: &[CellId])
        -> Result<Vec<RoomSnapshot>, ApplicationError>;
}

/// 查询结果条目：快照加上与查询点的距离。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyRoom {
    #[serde(flatten)]
    pub room: RoomSnapshot,
    pub distance_km: f64,
}

pub struct GeoLookupService {
    store: std::sync::Arc<dyn GeoCellStore>,
}

impl GeoLookupService {
    pub fn new(store: std::sync::Arc<dyn GeoCellStore>) -> Self {
        Self { store }
    }

    /// 以 (lat, lng) 为圆心、固定半径内的房间，按距离升序。
    pub async fn nearby_rooms(
        &self,
        lat: f64,
        lng: f64,
        now: DateTime<Utc>,
    ) -> Result<Vec<NearbyRoom>, ApplicationError> {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return Err(DomainError::validation("coordinates out of range").into());
        }

        let cells = covering_cells(lat, lng);
        let snapshots = self.store.snapshots_in(&cells).await?;

        // 同一房间可能出现在多个单元格，按 id 去重
        let mut unique: HashMap<RoomId, RoomSnapshot> = HashMap::new();
        for snapshot in snapshots {
            unique.entry(snapshot.id).or_insert(snapshot);
        }

        let mut nearby: Vec<NearbyRoom> = unique
            .into_values()
            .filter(|snapshot| !snapshot.is_expired(now))
            .filter_map(|snapshot| {
                let distance = haversine_km(lat, lng, snapshot.lat, snapshot.lng);
                (distance <= SEARCH_RADIUS_KM).then(|| NearbyRoom {
                    distance_km: round_km_mm(distance),
                    room: snapshot,
                })
            })
            .collect();

        nearby.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        Ok(nearby)
    }
}

/// 内存单元格存储，用于测试和单机开发。
#[derive(Default)]
pub struct MemoryGeoCellStore {
    cells: Mutex<HashMap<CellId, HashMap<RoomId, RoomSnapshot>>>,
}

impl MemoryGeoCellStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 把快照写入其坐标所属的单元格。
    pub fn insert(&self, snapshot: RoomSnapshot) {
        let cell = cell_of(snapshot.lat, snapshot.lng);
        let mut cells = self.cells.lock().expect("geo store poisoned");
        cells.entry(cell).or_default().insert(snapshot.id, snapshot);
    }

    /// 测试辅助：把同一份快照放进指定单元格（模拟跨格冗余）。
    pub fn insert_into(&self, cell: CellId, snapshot: RoomSnapshot) {
        let mut cells = self.cells.lock().expect("geo store poisoned");
        cells.entry(cell).or_default().insert(snapshot.id, snapshot);
    }
}

#[async_trait::async_trait]
impl GeoCellStore for MemoryGeoCellStore {
    async fn snapshots_in(
        &self,
        cells: &[CellId],
    ) -> Result<Vec<RoomSnapshot>, ApplicationError> {
        let stored = self.cells.lock().expect("geo store poisoned");
        Ok(cells
            .iter()
            .filter_map(|cell| stored.get(cell))
            .flat_map(|rooms| rooms.values().cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    // 赤道上约 1 公里对应的纬度增量
    const DEG_PER_KM: f64 = 1.0 / 111.2;

    fn snapshot(name: &str, lat: f64, lng: f64) -> RoomSnapshot {
        RoomSnapshot {
            id: RoomId::new(Uuid::new_v4()),
            name: name.to_string(),
            img: None,
            lat,
            lng,
            member_count: 3,
            max_members: 50,
            created_at: Utc::now(),
            expires_at: Some(Utc::now() + chrono::Duration::hours(12)),
        }
    }

    fn service_with(snapshots: Vec<RoomSnapshot>) -> GeoLookupService {
        let store = MemoryGeoCellStore::new();
        for s in snapshots {
            store.insert(s);
        }
        GeoLookupService::new(Arc::new(store))
    }

    #[tokio::test]
    async fn radius_filter_and_ascending_order() {
        let service = service_with(vec![
            snapshot("mid", 1.2 * DEG_PER_KM, 0.0),
            snapshot("near", 0.3 * DEG_PER_KM, 0.0),
            snapshot("far", 6.0 * DEG_PER_KM, 0.0),
        ]);

        let rooms = service.nearby_rooms(0.0, 0.0, Utc::now()).await.unwrap();
        let names: Vec<&str> = rooms.iter().map(|r| r.room.name.as_str()).collect();
        assert_eq!(names, vec!["near", "mid"]);
        assert!(rooms[0].distance_km < rooms[1].distance_km);
        assert!(rooms.iter().all(|r| r.distance_km <= SEARCH_RADIUS_KM));
    }

    #[tokio::test]
    async fn duplicated_snapshots_across_cells_appear_once() {
        let store = MemoryGeoCellStore::new();
        let s = snapshot("border", 0.0, 0.0);
        store.insert(s.clone());
        store.insert_into(CellId { lat_idx: -1, lng_idx: 0 }, s);
        let service = GeoLookupService::new(Arc::new(store));

        let rooms = service.nearby_rooms(0.0, 0.0, Utc::now()).await.unwrap();
        assert_eq!(rooms.len(), 1);
    }

    #[tokio::test]
    async fn expired_snapshots_are_dropped() {
        let mut stale = snapshot("stale", 0.0, 0.0);
        stale.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        let service = service_with(vec![stale, snapshot("fresh", 0.001, 0.0)]);

        let rooms = service.nearby_rooms(0.0, 0.0, Utc::now()).await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].room.name, "fresh");
    }

    #[tokio::test]
    async fn empty_area_returns_empty_list() {
        let service = service_with(vec![]);
        assert!(service
            .nearby_rooms(45.0, 45.0, Utc::now())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn out_of_range_coordinates_are_rejected() {
        let service = service_with(vec![]);
        let err = service.nearby_rooms(91.0, 0.0, Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            ApplicationError::Domain(DomainError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn result_serializes_with_flattened_snapshot() {
        let service = service_with(vec![snapshot("cafe", 0.0, 0.0)]);
        let rooms = service.nearby_rooms(0.0, 0.0, Utc::now()).await.unwrap();

        let json = serde_json::to_value(&rooms[0]).unwrap();
        assert_eq!(json["name"], "cafe");
        assert!(json.get("distanceKm").is_some());
        assert!(json.get("memberCount").is_some());
    }
}

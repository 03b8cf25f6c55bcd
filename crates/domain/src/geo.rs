//! 地理单元格索引的纯计算部分
//!
//! 房间按固定分辨率的经纬度网格分桶存储。查询时取查询点所在单元格的
//! 3x3 邻域，保证搜索半径内的点不会因落在单元格边缘而漏掉。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::RoomId;

/// 单元格边长（度）。0.1° 纬度约合 11.1 km，3x3 邻域在中纬度区间内
/// 完整覆盖 5 km 搜索半径。
pub const CELL_SIZE_DEG: f64 = 0.1;

/// 附近房间查询的固定半径（公里）
pub const SEARCH_RADIUS_KM: f64 = 5.0;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// 网格单元格标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId {
    pub lat_idx: i32,
    pub lng_idx: i32,
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lat_idx, self.lng_idx)
    }
}

/// 查询点所在的单元格
pub fn cell_of(lat: f64, lng: f64) -> CellId {
    CellId {
        lat_idx: (lat / CELL_SIZE_DEG).floor() as i32,
        lng_idx: (lng / CELL_SIZE_DEG).floor() as i32,
    }
}

/// 搜索半径可能触及的单元格集合，固定为 3x3 邻域。
pub fn covering_cells(lat: f64, lng: f64) -> Vec<CellId> {
    let center = cell_of(lat, lng);
    let mut cells = Vec::with_capacity(9);
    for dlat in -1..=1 {
        for dlng in -1..=1 {
            cells.push(CellId {
                lat_idx: center.lat_idx + dlat,
                lng_idx: center.lng_idx + dlng,
            });
        }
    }
    cells
}

/// 大圆距离（haversine），单位公里。
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlng = (lng2 - lng1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_KM * c
}

/// 展示用距离，四舍五入到毫米（公里的第六位小数），保证排序展示稳定。
pub fn round_km_mm(km: f64) -> f64 {
    (km * 1e6).round() / 1e6
}

/// 存放在地理单元格中的房间快照，`geo:cell:{cellId}` 哈希的值部分。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub id: RoomId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img: Option<String>,
    pub lat: f64,
    pub lng: f64,
    pub member_count: u32,
    pub max_members: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RoomSnapshot {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now,
            None => false,
        }
    }
}

use std::sync::Arc;

use application::{GeoLookupService, RoomService};

use crate::auth::SessionVerifier;
use crate::registry::RoomRegistry;

#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RoomService>,
    pub geo: Arc<GeoLookupService>,
    pub registry: Arc<RoomRegistry>,
    pub verifier: SessionVerifier,
}

impl AppState {
    pub fn new(
        rooms: Arc<RoomService>,
        geo: Arc<GeoLookupService>,
        registry: Arc<RoomRegistry>,
        verifier: SessionVerifier,
    ) -> Self {
        Self {
            rooms,
            geo,
            registry,
            verifier,
        }
    }
}

//! Postgres 适配器

mod room_store;

pub use room_store::PgRoomStore;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub async fn create_pg_pool(database_url: &str, max_connections: u32)
    -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

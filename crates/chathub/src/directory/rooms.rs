//! Room repository for database operations.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::models::Room;

/// Repository for registered rooms.
#[derive(Debug, Clone)]
pub struct RoomRepository {
    pool: SqlitePool,
}

impl RoomRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a room.
    #[instrument(skip(self))]
    pub async fn create(&self, id: &str, name: &str, created_by: Option<&str>) -> Result<Room> {
        debug!("Creating room: {} ({})", name, id);

        sqlx::query(
            r#"
            INSERT INTO rooms (id, name, created_by)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(created_by)
        .execute(&self.pool)
        .await
        .context("Failed to insert room")?;

        self.get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Room not found after creation"))
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> Result<Option<Room>> {
        let room = sqlx::query_as::<_, Room>(
            r#"
            SELECT id, name, created_by, created_at
            FROM rooms
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch room")?;

        Ok(room)
    }

    #[instrument(skip(self))]
    pub async fn exists(&self, id: &str) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rooms WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to check room")?;

        Ok(count > 0)
    }

    /// All registered rooms, sorted by id.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<Room>> {
        let rooms = sqlx::query_as::<_, Room>(
            r#"
            SELECT id, name, created_by, created_at
            FROM rooms
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list rooms")?;

        Ok(rooms)
    }
}

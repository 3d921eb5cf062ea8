use async_trait::async_trait;
use chrono::Utc;
use diesel::{OptionalExtension, QueryDsl};
use diesel_async::{
    AsyncPgConnection, RunQueryDsl,
    pooled_connection::deadpool::{Object, Pool},
};
use uuid::Uuid;

use crate::{error::Error, model::Video, schema::videos};

pub type DbPool = Pool<AsyncPgConnection>;
pub type DbConnection = Object<AsyncPgConnection>;

/// Persistence of video records. Implementations guarantee that a single `update_video` is
/// atomic, concurrent uploads for different records never share state here.
#[async_trait]
pub trait VideoStore: Send + Sync {
    async fn get_video(&self, id: Uuid) -> Result<Option<Video>, Error>;

    /// Writes the full record, failing if no record with the given ID exists.
    async fn update_video(&self, video: &Video) -> Result<(), Error>;
}

pub struct PgVideoStore {
    pool: DbPool,
}

impl PgVideoStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn acquire_db_connection(&self) -> Result<DbConnection, Error> {
        self.pool.get().await.map_err(|e| {
            log::error!("Failed to acquire database connection: {e}");
            Error::DatabaseConnectionError
        })
    }
}

#[async_trait]
impl VideoStore for PgVideoStore {
    async fn get_video(&self, id: Uuid) -> Result<Option<Video>, Error> {
        let mut connection = self.acquire_db_connection().await?;
        videos::table
            .find(id)
            .get_result::<Video>(&mut connection)
            .await
            .optional()
            .map_err(Error::from)
    }

    async fn update_video(&self, video: &Video) -> Result<(), Error> {
        let mut video = video.clone();
        video.updated_at = Utc::now();

        let mut connection = self.acquire_db_connection().await?;
        let updated_count = diesel::update(videos::table.find(video.id))
            .set(&video)
            .execute(&mut connection)
            .await
            .map_err(|e| Error::PersistError(e.to_string()))?;

        if updated_count != 1 {
            return Err(Error::PersistError(format!(
                "expected to update 1 row for video {} but updated {}",
                video.id, updated_count
            )));
        }

        Ok(())
    }
}

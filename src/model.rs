use chrono::{DateTime, offset::Utc};
use diesel::{AsChangeset, Identifiable, Queryable};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::videos;

/// A video record. Records are created and deleted elsewhere, the upload endpoints only ever
/// read a record and update its media URLs.
#[derive(AsChangeset, Identifiable, Queryable, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[diesel(table_name = videos)]
#[diesel(primary_key(id))]
#[diesel(treat_none_as_null = true)]
pub struct Video {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub title: String,
    pub description: Option<String>,
    pub thumbnail_url: Option<String>,
    pub video_url: Option<String>,
    pub user_id: Uuid,
}

impl Video {
    #[inline]
    pub fn is_owned_by(&self, user_id: Uuid) -> bool {
        self.user_id == user_id
    }

    pub fn media_url(&self, field: MediaField) -> Option<&str> {
        match field {
            MediaField::Video => self.video_url.as_deref(),
            MediaField::Thumbnail => self.thumbnail_url.as_deref(),
        }
    }

    pub fn set_media_url(&mut self, field: MediaField, url: String) {
        match field {
            MediaField::Video => self.video_url = Some(url),
            MediaField::Thumbnail => self.thumbnail_url = Some(url),
        }
    }
}

/// The media URL column of a [`Video`] an upload writes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaField {
    Video,
    Thumbnail,
}

impl std::fmt::Display for MediaField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaField::Video => f.write_str("video_url"),
            MediaField::Thumbnail => f.write_str("thumbnail_url"),
        }
    }
}

#[cfg(test)]
pub fn test_video(user_id: Uuid) -> Video {
    let now = Utc::now();
    Video {
        id: Uuid::new_v4(),
        created_at: now,
        updated_at: now,
        title: String::from("Boots in the wild"),
        description: None,
        thumbnail_url: None,
        video_url: None,
        user_id,
    }
}

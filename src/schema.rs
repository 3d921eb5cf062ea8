table! {
    videos (id) {
        id -> Uuid,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        title -> Varchar,
        description -> Nullable<Text>,
        thumbnail_url -> Nullable<Text>,
        video_url -> Nullable<Text>,
        user_id -> Uuid,
    }
}

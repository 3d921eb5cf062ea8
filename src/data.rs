use std::{io, sync::Arc};

use futures::{Stream, TryStreamExt};
use mime::Mime;
use mpart_async::server::MultipartStream;
use uuid::Uuid;
use warp::{Buf, Rejection, Reply};

use crate::{error::Error, model::Video};

pub mod encode;
pub mod s3utils;
pub mod stage;
pub mod up;

use up::{UploadPipeline, UploadRequest, check_declared_size};

/// Form field carrying the video of a `/api/video_upload` request.
pub const VIDEO_FORM_FIELD: &str = "video";
/// Form field carrying the image of a `/api/thumbnail_upload` request.
pub const THUMBNAIL_FORM_FIELD: &str = "thumbnail";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UploadKind {
    Video,
    Thumbnail,
}

impl UploadKind {
    fn form_field(&self) -> &'static str {
        match self {
            UploadKind::Video => VIDEO_FORM_FIELD,
            UploadKind::Thumbnail => THUMBNAIL_FORM_FIELD,
        }
    }
}

pub async fn upload_video_handler(
    video_id: String,
    pipeline: Arc<UploadPipeline>,
    user_id: Uuid,
    mime: Mime,
    content_length: Option<u64>,
    body: impl Stream<Item = Result<impl Buf, warp::Error>> + Unpin + Send,
) -> Result<impl Reply, Rejection> {
    let video_id = parse_video_id(&video_id)?;
    // refuse oversized requests before reading any of the body
    check_declared_size(content_length, pipeline.config().max_video_size)?;

    let video = upload_form_file(
        &pipeline,
        UploadKind::Video,
        video_id,
        user_id,
        &mime,
        content_length,
        body,
    )
    .await?;
    Ok(warp::reply::json(&video))
}

pub async fn upload_thumbnail_handler(
    video_id: String,
    pipeline: Arc<UploadPipeline>,
    user_id: Uuid,
    mime: Mime,
    content_length: Option<u64>,
    body: impl Stream<Item = Result<impl Buf, warp::Error>> + Unpin + Send,
) -> Result<impl Reply, Rejection> {
    let video_id = parse_video_id(&video_id)?;
    check_declared_size(content_length, pipeline.config().max_thumbnail_size)?;

    let video = upload_form_file(
        &pipeline,
        UploadKind::Thumbnail,
        video_id,
        user_id,
        &mime,
        content_length,
        body,
    )
    .await?;
    Ok(warp::reply::json(&video))
}

pub async fn get_video_handler(
    video_id: String,
    pipeline: Arc<UploadPipeline>,
    user_id: Uuid,
) -> Result<impl Reply, Rejection> {
    let video_id = parse_video_id(&video_id)?;
    let video = pipeline.load_owned_video(video_id, user_id).await?;
    Ok(warp::reply::json(&video))
}

fn parse_video_id(video_id: &str) -> Result<Uuid, Error> {
    Uuid::parse_str(video_id).map_err(|_| Error::InvalidIdentifierError(video_id.to_string()))
}

/// Finds the form field for the upload kind in the multipart body and feeds it to the pipeline.
async fn upload_form_file(
    pipeline: &UploadPipeline,
    kind: UploadKind,
    video_id: Uuid,
    user_id: Uuid,
    mime: &Mime,
    content_length: Option<u64>,
    body: impl Stream<Item = Result<impl Buf, warp::Error>> + Unpin + Send,
) -> Result<Video, Error> {
    if mime.essence_str() != mime::MULTIPART_FORM_DATA.essence_str() {
        return Err(Error::BadRequestError(format!(
            "Expected multipart/form-data but got '{mime}'"
        )));
    }
    let boundary = mime
        .get_param("boundary")
        .map(|v| v.to_string())
        .ok_or_else(|| Error::BadRequestError(String::from("No mime boundary")))?;

    let mut stream = MultipartStream::new(
        boundary,
        body.map_ok(|mut buf| buf.copy_to_bytes(buf.remaining())),
    );

    let form_field = kind.form_field();
    while let Some(mut field) = stream
        .try_next()
        .await
        .map_err(|e| Error::BadRequestError(e.to_string()))?
    {
        let is_form_field = field
            .name()
            .map_err(|e| Error::BadRequestError(e.to_string()))?
            == form_field;
        if !is_form_field {
            // the stream only yields the next field once this one has been read to the end
            while field
                .try_next()
                .await
                .map_err(|e| Error::BadRequestError(e.to_string()))?
                .is_some()
            {}
            continue;
        }

        // a missing content type is rejected by the pipeline as unsupported
        let content_type = field
            .content_type()
            .map(|content_type| content_type.to_string())
            .unwrap_or_default();

        let request = UploadRequest {
            video_id,
            user_id,
            content_type,
            declared_size: content_length,
            body: field.map_err(|e| io::Error::other(e.to_string())),
        };

        return match kind {
            UploadKind::Video => pipeline.upload_video(request).await,
            UploadKind::Thumbnail => pipeline.upload_thumbnail(request).await,
        };
    }

    Err(Error::BadRequestError(format!(
        "No file specified, no multipart form field found for name '{form_field}'"
    )))
}

use std::{fmt, io, str::FromStr, sync::Arc};

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use mime::Mime;
use uuid::Uuid;

use crate::{
    error::Error,
    model::{MediaField, Video},
    store::VideoStore,
    util::format_duration,
};

use super::{
    encode::{MediaTool, Orientation, remux_for_fast_start},
    s3utils::{ObjectStore, derive_object_key, publish},
    stage::Stager,
};

/// The only container accepted for video uploads.
pub const VIDEO_CONTENT_TYPE: &str = "video/mp4";

/// Content types accepted for thumbnails and the extension their objects get.
pub const THUMBNAIL_CONTENT_TYPES: [(&str, &str); 4] = [
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
];

/// Where uploaded thumbnails end up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThumbnailStorage {
    /// Encoded into the record as a base64 data URL.
    Inline,
    /// Published to the object store like videos.
    ObjectStore,
}

impl FromStr for ThumbnailStorage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inline" => Ok(ThumbnailStorage::Inline),
            "object_store" => Ok(ThumbnailStorage::ObjectStore),
            _ => Err(format!(
                "unknown thumbnail storage '{s}', expected 'inline' or 'object_store'"
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct UploadConfig {
    pub bucket: String,
    pub public_host: String,
    pub max_video_size: u64,
    pub max_thumbnail_size: u64,
    pub thumbnail_storage: ThumbnailStorage,
}

/// A single file upload targeting the media of a video record.
pub struct UploadRequest<S> {
    pub video_id: Uuid,
    pub user_id: Uuid,
    pub content_type: String,
    /// Size of the request body as announced by the client, if any.
    pub declared_size: Option<u64>,
    pub body: S,
}

/// Steps of an upload, used to report where a failed upload stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadStage {
    Received,
    Authorized,
    RecordLoaded,
    Staged,
    Probed,
    Remuxed,
    KeyDerived,
    Published,
    Reconciled,
    Done,
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStage::Received => "received",
            UploadStage::Authorized => "authorized",
            UploadStage::RecordLoaded => "record_loaded",
            UploadStage::Staged => "staged",
            UploadStage::Probed => "probed",
            UploadStage::Remuxed => "remuxed",
            UploadStage::KeyDerived => "key_derived",
            UploadStage::Published => "published",
            UploadStage::Reconciled => "reconciled",
            UploadStage::Done => "done",
        };
        f.write_str(name)
    }
}

struct StageTracker {
    video_id: Uuid,
    stage: UploadStage,
}

impl StageTracker {
    fn new(video_id: Uuid) -> Self {
        Self {
            video_id,
            stage: UploadStage::Received,
        }
    }

    fn advance(&mut self, stage: UploadStage) {
        log::debug!(
            "Upload for video {} advanced from {} to {}",
            self.video_id,
            self.stage,
            stage
        );
        self.stage = stage;
    }
}

/// Sequences the steps of video and thumbnail uploads. Each call runs independently, the only
/// state shared between concurrent uploads are the stores themselves.
pub struct UploadPipeline {
    video_store: Arc<dyn VideoStore>,
    object_store: Arc<dyn ObjectStore>,
    media_tool: Arc<dyn MediaTool>,
    stager: Stager,
    config: UploadConfig,
}

impl UploadPipeline {
    pub fn new(
        video_store: Arc<dyn VideoStore>,
        object_store: Arc<dyn ObjectStore>,
        media_tool: Arc<dyn MediaTool>,
        stager: Stager,
        config: UploadConfig,
    ) -> Self {
        Self {
            video_store,
            object_store,
            media_tool,
            stager,
            config,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Stages, remuxes and publishes the uploaded video, then points the record's `video_url` at the
    /// new object. Staged files are removed on every exit path.
    pub async fn upload_video<S>(&self, request: UploadRequest<S>) -> Result<Video, Error>
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Unpin + Send,
    {
        let video_id = request.video_id;
        let start_time = std::time::Instant::now();
        let mut tracker = StageTracker::new(video_id);

        log::info!(
            "Starting video upload for video {} by user {}",
            video_id,
            request.user_id
        );
        match self.run_video_upload(request, &mut tracker).await {
            Ok(video) => {
                tracker.advance(UploadStage::Done);
                log::info!(
                    "Completed video upload for video {} after {}",
                    video_id,
                    format_duration(start_time.elapsed())
                );
                Ok(video)
            }
            Err(e) => {
                log_failure(video_id, tracker.stage, &e);
                Err(e)
            }
        }
    }

    async fn run_video_upload<S>(
        &self,
        request: UploadRequest<S>,
        tracker: &mut StageTracker,
    ) -> Result<Video, Error>
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Unpin + Send,
    {
        check_declared_size(request.declared_size, self.config.max_video_size)?;
        let content_type = parse_essence(&request.content_type)?;
        if content_type != VIDEO_CONTENT_TYPE {
            return Err(Error::UnsupportedMediaTypeError(content_type));
        }
        tracker.advance(UploadStage::Authorized);

        self.load_owned_video(request.video_id, request.user_id)
            .await?;
        tracker.advance(UploadStage::RecordLoaded);

        let staged = self
            .stager
            .stage(request.body, self.config.max_video_size)
            .await?;
        log::info!(
            "Staged {} bytes for video {} at {} (sha256 {})",
            staged.size_bytes(),
            request.video_id,
            staged.path().display(),
            staged.sha256_hash().unwrap_or("-")
        );
        tracker.advance(UploadStage::Staged);

        let orientation = match self.media_tool.probe(staged.path()).await {
            Ok(geometry) => {
                let orientation = Orientation::classify(geometry);
                log::debug!(
                    "Probed geometry {:?} for video {}, classified as {}",
                    geometry,
                    request.video_id,
                    orientation
                );
                orientation
            }
            Err(e) => {
                log::warn!(
                    "Probing video {} failed, continuing with orientation {}: {}",
                    request.video_id,
                    Orientation::Other,
                    e
                );
                Orientation::Other
            }
        };
        tracker.advance(UploadStage::Probed);

        let remuxed = remux_for_fast_start(self.media_tool.clone(), staged).await?;
        tracker.advance(UploadStage::Remuxed);

        let key = derive_object_key(orientation.key_prefix(), "mp4");
        tracker.advance(UploadStage::KeyDerived);

        let reader = remuxed
            .open()
            .await
            .map_err(|e| Error::StagingError(format!("Failed to open remuxed video: {e}")))?;
        let url = publish(
            self.object_store.as_ref(),
            &self.config.bucket,
            &self.config.public_host,
            &key,
            reader,
            &content_type,
        )
        .await?;
        tracker.advance(UploadStage::Published);

        let video = reconcile(
            self.video_store.as_ref(),
            request.video_id,
            request.user_id,
            MediaField::Video,
            url,
        )
        .await?;
        tracker.advance(UploadStage::Reconciled);

        Ok(video)
    }

    /// Stores the uploaded image as the record's thumbnail, either inline or in the object store
    /// depending on [`UploadConfig::thumbnail_storage`].
    pub async fn upload_thumbnail<S>(&self, request: UploadRequest<S>) -> Result<Video, Error>
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Unpin + Send,
    {
        let video_id = request.video_id;
        let mut tracker = StageTracker::new(video_id);

        log::info!(
            "Starting thumbnail upload for video {} by user {}",
            video_id,
            request.user_id
        );
        match self.run_thumbnail_upload(request, &mut tracker).await {
            Ok(video) => {
                tracker.advance(UploadStage::Done);
                log::info!("Completed thumbnail upload for video {}", video_id);
                Ok(video)
            }
            Err(e) => {
                log_failure(video_id, tracker.stage, &e);
                Err(e)
            }
        }
    }

    async fn run_thumbnail_upload<S>(
        &self,
        request: UploadRequest<S>,
        tracker: &mut StageTracker,
    ) -> Result<Video, Error>
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Unpin + Send,
    {
        check_declared_size(request.declared_size, self.config.max_thumbnail_size)?;
        let content_type = parse_essence(&request.content_type)?;
        let extension = thumbnail_extension(&content_type)
            .ok_or_else(|| Error::UnsupportedMediaTypeError(content_type.clone()))?;
        tracker.advance(UploadStage::Authorized);

        self.load_owned_video(request.video_id, request.user_id)
            .await?;
        tracker.advance(UploadStage::RecordLoaded);

        let image_data = read_to_limit(request.body, self.config.max_thumbnail_size).await?;
        tracker.advance(UploadStage::Staged);

        let url = match self.config.thumbnail_storage {
            ThumbnailStorage::Inline => {
                let encoded = data_encoding::BASE64.encode(&image_data);
                format!("data:{content_type};base64,{encoded}")
            }
            ThumbnailStorage::ObjectStore => {
                let key = derive_object_key("thumbnails", extension);
                tracker.advance(UploadStage::KeyDerived);
                publish(
                    self.object_store.as_ref(),
                    &self.config.bucket,
                    &self.config.public_host,
                    &key,
                    &image_data[..],
                    &content_type,
                )
                .await?
            }
        };
        tracker.advance(UploadStage::Published);

        let video = reconcile(
            self.video_store.as_ref(),
            request.video_id,
            request.user_id,
            MediaField::Thumbnail,
            url,
        )
        .await?;
        tracker.advance(UploadStage::Reconciled);

        Ok(video)
    }

    /// Loads the video, failing unless it is owned by the given user.
    pub async fn load_owned_video(&self, video_id: Uuid, user_id: Uuid) -> Result<Video, Error> {
        load_owned_video(self.video_store.as_ref(), video_id, user_id).await
    }
}

async fn load_owned_video(
    video_store: &dyn VideoStore,
    video_id: Uuid,
    user_id: Uuid,
) -> Result<Video, Error> {
    let video = video_store
        .get_video(video_id)
        .await?
        .ok_or(Error::VideoNotFoundError(video_id))?;

    if !video.is_owned_by(user_id) {
        return Err(Error::NotOwnerError(video_id));
    }

    Ok(video)
}

/// Points the given media field of the video at `url` and returns the record as stored afterwards.
///
/// Only call this once the object behind `url` has been published. The record is never written if
/// the caller does not own it.
pub async fn reconcile(
    video_store: &dyn VideoStore,
    video_id: Uuid,
    user_id: Uuid,
    field: MediaField,
    url: String,
) -> Result<Video, Error> {
    let mut video = load_owned_video(video_store, video_id, user_id).await?;

    video.set_media_url(field, url.clone());
    video_store.update_video(&video).await.map_err(|e| match e {
        Error::PersistError(_) => e,
        e => Error::PersistError(e.to_string()),
    })?;

    // read back to make sure the write actually took
    let updated_video = video_store
        .get_video(video_id)
        .await
        .map_err(|e| Error::PersistError(e.to_string()))?
        .ok_or_else(|| {
            Error::PersistError(format!("video {video_id} disappeared after update"))
        })?;
    if updated_video.media_url(field) != Some(url.as_str()) {
        return Err(Error::PersistError(format!(
            "{field} of video {video_id} does not match the written value after update"
        )));
    }

    Ok(updated_video)
}

fn log_failure(video_id: Uuid, stage: UploadStage, e: &Error) {
    if e.is_internal() {
        log::error!(
            "Upload for video {} failed after stage {}: {}",
            video_id,
            stage,
            e
        );
    } else {
        log::warn!(
            "Rejected upload for video {} after stage {}: {}",
            video_id,
            stage,
            e
        );
    }
}

/// Rejects uploads whose announced size already exceeds the limit, before any of the body is read.
pub fn check_declared_size(declared_size: Option<u64>, max_bytes: u64) -> Result<(), Error> {
    match declared_size {
        Some(size) if size > max_bytes => Err(Error::PayloadTooLargeError(max_bytes)),
        _ => Ok(()),
    }
}

fn parse_essence(content_type: &str) -> Result<String, Error> {
    content_type
        .parse::<Mime>()
        .map(|mime| mime.essence_str().to_ascii_lowercase())
        .map_err(|_| Error::UnsupportedMediaTypeError(content_type.to_string()))
}

fn thumbnail_extension(content_type: &str) -> Option<&'static str> {
    THUMBNAIL_CONTENT_TYPES
        .iter()
        .find(|(accepted, _)| *accepted == content_type)
        .map(|(_, extension)| *extension)
}

async fn read_to_limit<S>(mut stream: S, max_bytes: u64) -> Result<Vec<u8>, Error>
where
    S: Stream<Item = Result<Bytes, io::Error>> + Unpin + Send,
{
    let mut data = Vec::new();
    while let Some(chunk) = stream
        .try_next()
        .await
        .map_err(|e| Error::StagingError(format!("Failed to read upload: {e}")))?
    {
        if (data.len() + chunk.len()) as u64 > max_bytes {
            return Err(Error::PayloadTooLargeError(max_bytes));
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Arc, time::Duration};

    use bytes::Bytes;
    use futures::stream;
    use uuid::Uuid;

    use super::{
        ThumbnailStorage, UploadConfig, UploadPipeline, UploadRequest, check_declared_size,
        parse_essence, thumbnail_extension,
    };
    use crate::{
        data::{
            encode::{MediaGeometry, fake::FakeMediaTool},
            s3utils::memory::MemoryObjectStore,
            stage::Stager,
        },
        error::Error,
        model::{Video, test_video},
        store::memory::MemoryVideoStore,
    };

    const PUBLIC_HOST: &str = "s3.us-east-2.amazonaws.com";

    struct Fixture {
        staging_dir: tempfile::TempDir,
        video_store: Arc<MemoryVideoStore>,
        object_store: Arc<MemoryObjectStore>,
        media_tool: Arc<FakeMediaTool>,
        video: Video,
        owner: Uuid,
    }

    impl Fixture {
        fn new(
            media_tool: FakeMediaTool,
            object_store: MemoryObjectStore,
            video_store: impl FnOnce(Video) -> MemoryVideoStore,
        ) -> Self {
            let owner = Uuid::new_v4();
            let video = test_video(owner);
            Self {
                staging_dir: tempfile::tempdir().unwrap(),
                video_store: Arc::new(video_store(video.clone())),
                object_store: Arc::new(object_store),
                media_tool: Arc::new(media_tool),
                video,
                owner,
            }
        }

        fn landscape() -> Self {
            Self::new(
                FakeMediaTool {
                    geometry: Some(MediaGeometry {
                        width: 1920,
                        height: 1080,
                    }),
                    ..Default::default()
                },
                MemoryObjectStore::default(),
                MemoryVideoStore::with_video,
            )
        }

        fn pipeline(&self, thumbnail_storage: ThumbnailStorage) -> UploadPipeline {
            UploadPipeline::new(
                self.video_store.clone(),
                self.object_store.clone(),
                self.media_tool.clone(),
                Stager::new(self.staging_dir.path()),
                UploadConfig {
                    bucket: String::from("tubely-1234"),
                    public_host: String::from(PUBLIC_HOST),
                    max_video_size: 1024,
                    max_thumbnail_size: 64,
                    thumbnail_storage,
                },
            )
        }

        fn request(
            &self,
            user_id: Uuid,
            content_type: &str,
            body: &'static [u8],
        ) -> UploadRequest<impl futures::Stream<Item = Result<Bytes, io::Error>> + Unpin + Send>
        {
            UploadRequest {
                video_id: self.video.id,
                user_id,
                content_type: content_type.to_string(),
                declared_size: Some(body.len() as u64),
                body: stream::iter(vec![Ok(Bytes::from_static(body))]),
            }
        }

        fn staged_file_count(&self) -> usize {
            std::fs::read_dir(self.staging_dir.path()).unwrap().count()
        }

        fn stored_video(&self) -> Video {
            self.video_store.snapshot(self.video.id).unwrap()
        }
    }

    #[tokio::test]
    async fn test_landscape_upload_end_to_end() {
        let fixture = Fixture::landscape();
        let pipeline = fixture.pipeline(ThumbnailStorage::Inline);

        let video = pipeline
            .upload_video(fixture.request(fixture.owner, "video/mp4", b"mdat"))
            .await
            .unwrap();

        let objects = fixture.object_store.objects.lock();
        assert_eq!(objects.len(), 1);
        let object = &objects[0];
        assert_eq!(object.bucket, "tubely-1234");
        assert!(object.key.starts_with("landscape/"));
        assert!(object.key.ends_with(".mp4"));
        assert_eq!(object.content_type, "video/mp4");
        // the remuxed file is published, not the original
        assert_eq!(object.bytes, b"moovmdat");

        let expected_url = format!("https://tubely-1234.{PUBLIC_HOST}/{}", object.key);
        assert_eq!(video.video_url.as_deref(), Some(expected_url.as_str()));
        assert_eq!(video, fixture.stored_video());
        assert_eq!(fixture.staged_file_count(), 0);
    }

    #[tokio::test]
    async fn test_portrait_upload_uses_portrait_prefix() {
        let fixture = Fixture::new(
            FakeMediaTool {
                geometry: Some(MediaGeometry {
                    width: 1080,
                    height: 1920,
                }),
                ..Default::default()
            },
            MemoryObjectStore::default(),
            MemoryVideoStore::with_video,
        );

        fixture
            .pipeline(ThumbnailStorage::Inline)
            .upload_video(fixture.request(fixture.owner, "video/mp4", b"mdat"))
            .await
            .unwrap();

        assert!(fixture.object_store.objects.lock()[0]
            .key
            .starts_with("portrait/"));
    }

    #[tokio::test]
    async fn test_probe_failure_degrades_to_other() {
        let fixture = Fixture::new(
            FakeMediaTool {
                fail_probe: true,
                ..Default::default()
            },
            MemoryObjectStore::default(),
            MemoryVideoStore::with_video,
        );

        let video = fixture
            .pipeline(ThumbnailStorage::Inline)
            .upload_video(fixture.request(fixture.owner, "video/mp4", b"mdat"))
            .await
            .unwrap();

        let key = fixture.object_store.objects.lock()[0].key.clone();
        assert!(key.starts_with("other/"));
        assert!(video.video_url.unwrap().ends_with(&key));
    }

    #[tokio::test]
    async fn test_square_video_is_other() {
        let fixture = Fixture::new(
            FakeMediaTool {
                geometry: Some(MediaGeometry {
                    width: 1080,
                    height: 1080,
                }),
                ..Default::default()
            },
            MemoryObjectStore::default(),
            MemoryVideoStore::with_video,
        );

        fixture
            .pipeline(ThumbnailStorage::Inline)
            .upload_video(fixture.request(fixture.owner, "video/mp4", b"mdat"))
            .await
            .unwrap();

        assert!(fixture.object_store.objects.lock()[0]
            .key
            .starts_with("other/"));
    }

    #[tokio::test]
    async fn test_repeated_uploads_publish_distinct_keys() {
        let fixture = Fixture::landscape();
        let pipeline = fixture.pipeline(ThumbnailStorage::Inline);

        let first = pipeline
            .upload_video(fixture.request(fixture.owner, "video/mp4", b"mdat"))
            .await
            .unwrap();
        let second = pipeline
            .upload_video(fixture.request(fixture.owner, "video/mp4", b"mdat"))
            .await
            .unwrap();

        let objects = fixture.object_store.objects.lock();
        assert_eq!(objects.len(), 2);
        assert_ne!(objects[0].key, objects[1].key);
        assert_ne!(first.video_url, second.video_url);
        assert_eq!(fixture.stored_video().video_url, second.video_url);
    }

    #[tokio::test]
    async fn test_non_owner_is_rejected_without_changes() {
        let fixture = Fixture::landscape();
        let pipeline = fixture.pipeline(ThumbnailStorage::Inline);

        let result = pipeline
            .upload_video(fixture.request(Uuid::new_v4(), "video/mp4", b"mdat"))
            .await;

        assert!(matches!(result, Err(Error::NotOwnerError(id)) if id == fixture.video.id));
        assert_eq!(fixture.stored_video(), fixture.video);
        assert!(fixture.object_store.objects.lock().is_empty());
        assert!(fixture.media_tool.remux_inputs.lock().is_empty());
        assert_eq!(fixture.staged_file_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_video_is_not_found() {
        let fixture = Fixture::new(
            FakeMediaTool::default(),
            MemoryObjectStore::default(),
            |_| MemoryVideoStore::default(),
        );

        let result = fixture
            .pipeline(ThumbnailStorage::Inline)
            .upload_video(fixture.request(fixture.owner, "video/mp4", b"mdat"))
            .await;

        assert!(matches!(result, Err(Error::VideoNotFoundError(_))));
    }

    #[tokio::test]
    async fn test_unsupported_content_type_is_rejected() {
        let fixture = Fixture::landscape();

        let result = fixture
            .pipeline(ThumbnailStorage::Inline)
            .upload_video(fixture.request(fixture.owner, "video/webm", b"mdat"))
            .await;

        assert!(matches!(result, Err(Error::UnsupportedMediaTypeError(t)) if t == "video/webm"));
        assert!(fixture.object_store.objects.lock().is_empty());
    }

    #[tokio::test]
    async fn test_declared_oversize_is_rejected_before_staging() {
        let fixture = Fixture::landscape();
        let mut request = fixture.request(fixture.owner, "video/mp4", b"mdat");
        request.declared_size = Some(4096);

        let result = fixture
            .pipeline(ThumbnailStorage::Inline)
            .upload_video(request)
            .await;

        assert!(matches!(result, Err(Error::PayloadTooLargeError(1024))));
        assert_eq!(fixture.staged_file_count(), 0);
        assert_eq!(fixture.stored_video(), fixture.video);
    }

    #[tokio::test]
    async fn test_streamed_oversize_is_rejected() {
        let fixture = Fixture::landscape();
        let mut request = fixture.request(fixture.owner, "video/mp4", &[0u8; 2048]);
        request.declared_size = None;

        let result = fixture
            .pipeline(ThumbnailStorage::Inline)
            .upload_video(request)
            .await;

        assert!(matches!(result, Err(Error::PayloadTooLargeError(1024))));
        assert!(fixture.media_tool.remux_inputs.lock().is_empty());
        assert_eq!(fixture.staged_file_count(), 0);
    }

    #[tokio::test]
    async fn test_remux_failure_cleans_up_and_keeps_record() {
        let fixture = Fixture::new(
            FakeMediaTool {
                fail_remux: true,
                ..Default::default()
            },
            MemoryObjectStore::default(),
            MemoryVideoStore::with_video,
        );

        let result = fixture
            .pipeline(ThumbnailStorage::Inline)
            .upload_video(fixture.request(fixture.owner, "video/mp4", b"mdat"))
            .await;

        assert!(matches!(result, Err(Error::RemuxError(_))));
        assert_eq!(*fixture.media_tool.remux_inputs.lock(), vec![b"mdat".to_vec()]);
        assert!(fixture.object_store.objects.lock().is_empty());
        assert_eq!(fixture.stored_video(), fixture.video);
        assert_eq!(fixture.staged_file_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_upload_during_remux_leaves_no_files() {
        let fixture = Fixture::new(
            FakeMediaTool {
                remux_delay: Some(Duration::from_millis(100)),
                ..Default::default()
            },
            MemoryObjectStore::default(),
            MemoryVideoStore::with_video,
        );
        let pipeline = fixture.pipeline(ThumbnailStorage::Inline);

        // the client disconnects while the remux output is still being written
        let upload = pipeline.upload_video(fixture.request(fixture.owner, "video/mp4", b"mdat"));
        assert!(
            tokio::time::timeout(Duration::from_millis(20), upload)
                .await
                .is_err()
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fixture.staged_file_count(), 0);
        assert!(fixture.object_store.objects.lock().is_empty());
        assert_eq!(fixture.stored_video().video_url, None);
    }

    #[tokio::test]
    async fn test_publish_failure_cleans_up_and_keeps_record() {
        let fixture = Fixture::new(
            FakeMediaTool::default(),
            MemoryObjectStore {
                fail_puts: true,
                ..Default::default()
            },
            MemoryVideoStore::with_video,
        );

        let result = fixture
            .pipeline(ThumbnailStorage::Inline)
            .upload_video(fixture.request(fixture.owner, "video/mp4", b"mdat"))
            .await;

        assert!(matches!(result, Err(Error::PublishError(_))));
        assert_eq!(fixture.stored_video().video_url, None);
        assert_eq!(fixture.staged_file_count(), 0);
    }

    #[tokio::test]
    async fn test_persist_failure_is_reported() {
        let fixture = Fixture::new(
            FakeMediaTool::default(),
            MemoryObjectStore::default(),
            |video| MemoryVideoStore::with_video(video).failing_updates(),
        );

        let result = fixture
            .pipeline(ThumbnailStorage::Inline)
            .upload_video(fixture.request(fixture.owner, "video/mp4", b"mdat"))
            .await;

        assert!(matches!(result, Err(Error::PersistError(_))));
        assert_eq!(fixture.stored_video().video_url, None);
        assert_eq!(fixture.staged_file_count(), 0);
    }

    #[tokio::test]
    async fn test_inline_thumbnail() {
        let fixture = Fixture::landscape();

        let video = fixture
            .pipeline(ThumbnailStorage::Inline)
            .upload_thumbnail(fixture.request(fixture.owner, "image/png", b"\x89PNG"))
            .await
            .unwrap();

        assert_eq!(
            video.thumbnail_url.as_deref(),
            Some("data:image/png;base64,iVBORw==")
        );
        assert_eq!(video.video_url, None);
        assert!(fixture.object_store.objects.lock().is_empty());
        assert_eq!(video, fixture.stored_video());
    }

    #[tokio::test]
    async fn test_object_store_thumbnail() {
        let fixture = Fixture::landscape();

        let video = fixture
            .pipeline(ThumbnailStorage::ObjectStore)
            .upload_thumbnail(fixture.request(fixture.owner, "image/jpeg", b"\xff\xd8\xff"))
            .await
            .unwrap();

        let objects = fixture.object_store.objects.lock();
        assert_eq!(objects.len(), 1);
        assert!(objects[0].key.starts_with("thumbnails/"));
        assert!(objects[0].key.ends_with(".jpg"));
        assert_eq!(objects[0].content_type, "image/jpeg");
        assert_eq!(
            video.thumbnail_url,
            Some(format!("https://tubely-1234.{PUBLIC_HOST}/{}", objects[0].key))
        );
    }

    #[tokio::test]
    async fn test_thumbnail_rejections() {
        let fixture = Fixture::landscape();
        let pipeline = fixture.pipeline(ThumbnailStorage::Inline);

        let result = pipeline
            .upload_thumbnail(fixture.request(fixture.owner, "image/tiff", b"II*"))
            .await;
        assert!(matches!(result, Err(Error::UnsupportedMediaTypeError(_))));

        let result = pipeline
            .upload_thumbnail(fixture.request(Uuid::new_v4(), "image/png", b"\x89PNG"))
            .await;
        assert!(matches!(result, Err(Error::NotOwnerError(_))));

        let mut request = fixture.request(fixture.owner, "image/png", &[0u8; 128]);
        request.declared_size = None;
        let result = pipeline.upload_thumbnail(request).await;
        assert!(matches!(result, Err(Error::PayloadTooLargeError(64))));

        assert_eq!(fixture.stored_video(), fixture.video);
    }

    #[test]
    fn test_content_type_helpers() {
        assert_eq!(parse_essence("video/mp4").unwrap(), "video/mp4");
        assert_eq!(
            parse_essence("Video/MP4; codecs=\"avc1.42E01E\"").unwrap(),
            "video/mp4"
        );
        assert!(parse_essence("not a mime").is_err());

        assert_eq!(thumbnail_extension("image/jpeg"), Some("jpg"));
        assert_eq!(thumbnail_extension("image/webp"), Some("webp"));
        assert_eq!(thumbnail_extension("image/svg+xml"), None);
    }

    #[test]
    fn test_check_declared_size() {
        assert!(check_declared_size(None, 10).is_ok());
        assert!(check_declared_size(Some(10), 10).is_ok());
        assert!(matches!(
            check_declared_size(Some(11), 10),
            Err(Error::PayloadTooLargeError(10))
        ));
    }
}

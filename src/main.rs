#[macro_use]
extern crate diesel;

use std::{
    cmp::{max, min},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
};

use data::{
    encode::Ffmpeg,
    s3utils::S3ObjectStore,
    stage::Stager,
    up::{ThumbnailStorage, UploadConfig, UploadPipeline},
};
use diesel_async::{
    AsyncPgConnection,
    pooled_connection::{AsyncDieselConnectionManager, deadpool::Pool},
};
use dotenvy::dotenv;
use lazy_static::lazy_static;
use mime::Mime;
use store::{DbPool, PgVideoStore};
use warp::Filter;

use crate::util::OptFmt;

mod auth;
mod data;
mod error;
mod model;
mod schema;
mod store;
mod util;

/// 1 GiB
const DEFAULT_MAX_VIDEO_UPLOAD_SIZE: u64 = 1 << 30;
/// 10 MiB
const DEFAULT_MAX_THUMBNAIL_UPLOAD_SIZE: u64 = 10 << 20;

lazy_static! {
    pub static ref DATABASE_URL: String = std::env::var("DATABASE_URL")
        .expect("Missing environment variable DATABASE_URL must be set to connect to postgres");
    pub static ref MAX_DB_CONNECTIONS: usize = std::env::var("MAX_DB_CONNECTIONS")
        .unwrap_or_else(|_| String::from("25"))
        .parse::<usize>()
        .expect("MAX_DB_CONNECTIONS is not a valid usize");
    pub static ref JWT_SECRET: String = std::env::var("JWT_SECRET")
        .expect("Missing environment variable JWT_SECRET must be set to validate JWT tokens.");
    pub static ref PORT: u16 = {
        let port_str =
            std::env::var("API_PORT").expect("Missing environment variable API_PORT must be set.");
        u16::from_str(&port_str).expect("API_PORT var is not a valid u16 value")
    };
    pub static ref CERT_PATH: Option<String> = std::env::var("CERT_PATH").ok();
    pub static ref KEY_PATH: Option<String> = std::env::var("KEY_PATH").ok();
    pub static ref S3_BUCKET: String = std::env::var("S3_BUCKET")
        .expect("Missing environment variable S3_BUCKET must be set.");
    pub static ref S3_REGION: String = std::env::var("S3_REGION")
        .expect("Missing environment variable S3_REGION must be set.");
    pub static ref S3_ENDPOINT: Option<String> = std::env::var("S3_ENDPOINT").ok();
    pub static ref S3_ACCESS_KEY: String = std::env::var("S3_ACCESS_KEY")
        .expect("Missing environment variable S3_ACCESS_KEY must be set.");
    pub static ref S3_SECRET_KEY: String = std::env::var("S3_SECRET_KEY")
        .expect("Missing environment variable S3_SECRET_KEY must be set.");
    pub static ref S3_PUBLIC_HOST: String = std::env::var("S3_PUBLIC_HOST")
        .unwrap_or_else(|_| format!("s3.{}.amazonaws.com", *S3_REGION));
    pub static ref STAGING_DIR: PathBuf = std::env::var("STAGING_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir());
    pub static ref MAX_VIDEO_UPLOAD_SIZE: u64 = std::env::var("MAX_VIDEO_UPLOAD_SIZE")
        .map(|v| v
            .parse::<u64>()
            .expect("MAX_VIDEO_UPLOAD_SIZE is not a valid u64"))
        .unwrap_or(DEFAULT_MAX_VIDEO_UPLOAD_SIZE);
    pub static ref MAX_THUMBNAIL_UPLOAD_SIZE: u64 = std::env::var("MAX_THUMBNAIL_UPLOAD_SIZE")
        .map(|v| v
            .parse::<u64>()
            .expect("MAX_THUMBNAIL_UPLOAD_SIZE is not a valid u64"))
        .unwrap_or(DEFAULT_MAX_THUMBNAIL_UPLOAD_SIZE);
    pub static ref THUMBNAIL_STORAGE: ThumbnailStorage = std::env::var("THUMBNAIL_STORAGE")
        .map(|v| v
            .parse::<ThumbnailStorage>()
            .unwrap_or_else(|e| panic!("THUMBNAIL_STORAGE is invalid: {e}")))
        .unwrap_or(ThumbnailStorage::Inline);
    pub static ref FFMPEG_PATH: String =
        std::env::var("FFMPEG_PATH").unwrap_or_else(|_| String::from("ffmpeg"));
    pub static ref FFPROBE_PATH: String =
        std::env::var("FFPROBE_PATH").unwrap_or_else(|_| String::from("ffprobe"));
    pub static ref CONCURRENT_MEDIA_PROCESS_LIMIT: usize =
        std::env::var("CONCURRENT_MEDIA_PROCESS_LIMIT")
            .map(|v| v
                .parse::<usize>()
                .expect("CONCURRENT_MEDIA_PROCESS_LIMIT is not a valid usize"))
            .unwrap_or_else(|_| max(1, min(8, num_cpus::get() / 2)));
}

fn main() {
    dotenv().ok();

    // initialise certain lazy statics on startup
    lazy_static::initialize(&DATABASE_URL);
    lazy_static::initialize(&JWT_SECRET);
    lazy_static::initialize(&PORT);
    lazy_static::initialize(&S3_BUCKET);
    lazy_static::initialize(&S3_REGION);
    lazy_static::initialize(&S3_ACCESS_KEY);
    lazy_static::initialize(&S3_SECRET_KEY);
    lazy_static::initialize(&MAX_VIDEO_UPLOAD_SIZE);
    lazy_static::initialize(&MAX_THUMBNAIL_UPLOAD_SIZE);
    lazy_static::initialize(&THUMBNAIL_STORAGE);
    lazy_static::initialize(&CONCURRENT_MEDIA_PROCESS_LIMIT);

    setup_logger();

    setup_tokio_runtime();
}

fn create_connection_pool() -> DbPool {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(DATABASE_URL.as_str());
    Pool::builder(manager)
        .max_size(*MAX_DB_CONNECTIONS)
        .build()
        .expect("Failed to initialise connection pool")
}

fn create_upload_pipeline() -> UploadPipeline {
    let video_store = PgVideoStore::new(create_connection_pool());
    let object_store = S3ObjectStore::new(
        &S3_REGION,
        S3_ENDPOINT.as_deref(),
        &S3_ACCESS_KEY,
        &S3_SECRET_KEY,
    )
    .expect("Failed to set up S3 object store");
    let media_tool = Ffmpeg::new(
        FFMPEG_PATH.clone(),
        FFPROBE_PATH.clone(),
        *CONCURRENT_MEDIA_PROCESS_LIMIT,
    );

    log::info!(
        "Staging uploads in {}, publishing to bucket {} at {}",
        STAGING_DIR.display(),
        *S3_BUCKET,
        *S3_PUBLIC_HOST
    );
    UploadPipeline::new(
        Arc::new(video_store),
        Arc::new(object_store),
        Arc::new(media_tool),
        Stager::new(STAGING_DIR.as_path()),
        UploadConfig {
            bucket: S3_BUCKET.clone(),
            public_host: S3_PUBLIC_HOST.clone(),
            max_video_size: *MAX_VIDEO_UPLOAD_SIZE,
            max_thumbnail_size: *MAX_THUMBNAIL_UPLOAD_SIZE,
            thumbnail_storage: *THUMBNAIL_STORAGE,
        },
    )
}

fn with_pipeline(
    pipeline: Arc<UploadPipeline>,
) -> impl Filter<Extract = (Arc<UploadPipeline>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || pipeline.clone())
}

/// Start a tokio runtime that runs a warp server.
#[tokio::main]
async fn setup_tokio_runtime() {
    let pipeline = Arc::new(create_upload_pipeline());

    let upload_video_route = warp::path!("api" / "video_upload" / String)
        .and(warp::post())
        .and(with_pipeline(pipeline.clone()))
        .and(auth::with_user_id())
        .and(warp::header::<Mime>("content-type"))
        .and(warp::header::optional::<u64>("content-length"))
        .and(warp::body::stream())
        .and_then(data::upload_video_handler);

    let upload_thumbnail_route = warp::path!("api" / "thumbnail_upload" / String)
        .and(warp::post())
        .and(with_pipeline(pipeline.clone()))
        .and(auth::with_user_id())
        .and(warp::header::<Mime>("content-type"))
        .and(warp::header::optional::<u64>("content-length"))
        .and(warp::body::stream())
        .and_then(data::upload_thumbnail_handler);

    let get_video_route = warp::path!("api" / "videos" / String)
        .and(warp::get())
        .and(with_pipeline(pipeline))
        .and(auth::with_user_id())
        .and_then(data::get_video_handler);

    let routes = upload_video_route
        .or(upload_thumbnail_route)
        .or(get_video_route)
        .boxed();

    let filter = routes
        .recover(error::handle_rejection)
        .with(warp::log::custom(|info| {
            let log_level = if info.elapsed().as_secs() >= 10
                && !info.path().starts_with("/api/video_upload")
            {
                log::Level::Warn
            } else if info.elapsed().as_millis() >= 250 {
                log::Level::Info
            } else {
                log::Level::Debug
            };

            log::log!(
                target: "tubely::api",
                log_level,
                "{} \"{} {} {:?}\" {} \"{}\" \"{}\" {:?}",
                OptFmt(info.remote_addr()),
                info.method(),
                info.path(),
                info.version(),
                info.status().as_u16(),
                OptFmt(info.referer()),
                OptFmt(info.user_agent()),
                info.elapsed(),
            );
        }));

    #[cfg(debug_assertions)]
    let filter = filter.with(
        warp::cors()
            .allow_any_origin()
            .allow_header("content-type")
            .allow_header("Authorization")
            .allow_method(warp::http::Method::GET)
            .allow_method(warp::http::Method::OPTIONS)
            .allow_method(warp::http::Method::POST),
    );

    log::info!("Starting server on port {}", *PORT);
    if let (Some(cert_path), Some(key_path)) = (CERT_PATH.as_ref(), KEY_PATH.as_ref()) {
        warp::serve(filter)
            .tls()
            .cert_path(cert_path)
            .key_path(key_path)
            .run(([0, 0, 0, 0], *PORT))
            .await;
    } else {
        warp::serve(filter).run(([0, 0, 0, 0], *PORT)).await;
    }
}

fn setup_logger() {
    // create logs dir as fern does not appear to handle that itself
    if !std::path::Path::new("logs/").exists() {
        std::fs::create_dir("logs").expect("Failed to create logs/ directory");
    }

    let logging_level = if cfg!(debug_assertions) {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}]{}[{}] {}",
                record.level(),
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .level_for("tubely", logging_level)
        .level_for("tubely_server", logging_level)
        .chain(std::io::stdout())
        .chain(fern::DateBased::new("logs/", "logs_%Y-%m-%d.log"))
        .apply()
        .expect("Failed to set up logging");
}

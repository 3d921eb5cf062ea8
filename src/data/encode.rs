use std::{
    fmt,
    path::Path,
    process::{Command, Output, Stdio},
    sync::Arc,
};

use async_trait::async_trait;
use lazy_static::lazy_static;
use rusty_pool::ThreadPool;
use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::error::Error;

use super::stage::StagedArtifact;

lazy_static! {
    pub static ref ENCODE_POOL: ThreadPool = rusty_pool::Builder::new()
        .name(String::from("encode_pool"))
        .build();
}

async fn spawn_blocking<R: Send + 'static>(
    task: impl FnOnce() -> Result<R, Error> + Send + 'static,
) -> Result<R, Error> {
    let join_handle = ENCODE_POOL.evaluate(task);

    match join_handle.receiver.await {
        Ok(t) => t,
        Err(_) => Err(Error::CancellationError),
    }
}

/// Dimensions of the first video stream of a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaGeometry {
    pub width: u32,
    pub height: u32,
}

impl MediaGeometry {
    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }
}

/// Orientation of a video, used as the prefix of its object key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orientation {
    Landscape,
    Portrait,
    Other,
}

impl Orientation {
    /// Classifies the geometry by aspect ratio, ~16:9 is landscape and ~9:16 is portrait. Anything
    /// else, including unknown geometry, is `Other`.
    pub fn classify(geometry: Option<MediaGeometry>) -> Orientation {
        let Some(geometry) = geometry else {
            return Orientation::Other;
        };
        let aspect_ratio = geometry.aspect_ratio();
        if (1.70..=1.80).contains(&aspect_ratio) {
            Orientation::Landscape
        } else if (0.55..=0.57).contains(&aspect_ratio) {
            Orientation::Portrait
        } else {
            Orientation::Other
        }
    }

    pub fn key_prefix(&self) -> &'static str {
        match self {
            Orientation::Landscape => "landscape",
            Orientation::Portrait => "portrait",
            Orientation::Other => "other",
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key_prefix())
    }
}

/// External media utilities used by the upload pipeline.
#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Reads the geometry of the first video stream. `Ok(None)` means the file was readable but no
    /// usable geometry was reported.
    async fn probe(&self, path: &Path) -> Result<Option<MediaGeometry>, Error>;

    /// Copies all streams of `input` to `output` without re-encoding, moving the container index
    /// to the front of the file.
    async fn remux_fast_start(&self, input: &Path, output: &Path) -> Result<(), Error>;
}

/// Remuxes the artifact to the sibling `{path}.processing`, consuming the input.
///
/// The remux runs as a detached task owning both artifacts. If the caller is dropped mid-remux the
/// task still waits for the tool to finish and then removes the input and any output it wrote.
pub async fn remux_for_fast_start(
    media_tool: Arc<dyn MediaTool>,
    input: StagedArtifact,
) -> Result<StagedArtifact, Error> {
    tokio::spawn(async move {
        let mut output = input.derive("processing");
        media_tool
            .remux_fast_start(input.path(), output.path())
            .await?;
        output
            .refresh_size()
            .await
            .map_err(|e| Error::RemuxError(format!("Remux produced no readable output: {e}")))?;
        Ok::<_, Error>(output)
    })
    .await
    .map_err(|e| Error::RemuxError(format!("Remux task failed: {e}")))?
}

/// [`MediaTool`] backed by the ffprobe and ffmpeg executables.
pub struct Ffmpeg {
    ffmpeg_path: String,
    ffprobe_path: String,
    semaphore: Arc<Semaphore>,
}

impl Ffmpeg {
    pub fn new(ffmpeg_path: String, ffprobe_path: String, concurrent_process_limit: usize) -> Self {
        log::info!("CONCURRENT_MEDIA_PROCESS_LIMIT set to {concurrent_process_limit}");
        Self {
            ffmpeg_path,
            ffprobe_path,
            semaphore: Arc::new(Semaphore::new(concurrent_process_limit)),
        }
    }

    async fn run(&self, program: &str, args: Vec<String>) -> Result<Output, String> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| String::from("process semaphore closed"))?;

        log::debug!("Spawning {} process with args {:?}", program, &args);
        let process = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("Failed to spawn {program} process: {e}"))?;

        // the permit is held by the pool task, a dropped caller does not free the slot early
        let process_output = spawn_blocking(move || {
            let process_output = process.wait_with_output();
            drop(permit);
            Ok(process_output)
        })
        .await
        .map_err(|e| e.to_string())?;
        process_output.map_err(|e| format!("Failed to get {program} process output: {e}"))
    }
}

#[async_trait]
impl MediaTool for Ffmpeg {
    async fn probe(&self, path: &Path) -> Result<Option<MediaGeometry>, Error> {
        let args = vec![
            String::from("-v"),
            String::from("error"),
            String::from("-print_format"),
            String::from("json"),
            String::from("-show_streams"),
            String::from("-select_streams"),
            String::from("v:0"),
            path.to_string_lossy().to_string(),
        ];

        let process_output = self
            .run(&self.ffprobe_path, args)
            .await
            .map_err(Error::ProbeError)?;

        if !process_output.status.success() {
            let error_msg = String::from_utf8_lossy(&process_output.stderr);
            return Err(Error::ProbeError(format!(
                "ffprobe failed with status {}: {}",
                process_output.status, error_msg
            )));
        }

        parse_probe_output(&process_output.stdout)
    }

    async fn remux_fast_start(&self, input: &Path, output: &Path) -> Result<(), Error> {
        let args = vec![
            String::from("-v"),
            String::from("error"),
            String::from("-y"),
            String::from("-i"),
            input.to_string_lossy().to_string(),
            String::from("-c"),
            String::from("copy"),
            String::from("-movflags"),
            String::from("faststart"),
            String::from("-f"),
            String::from("mp4"),
            output.to_string_lossy().to_string(),
        ];

        let process_output = self
            .run(&self.ffmpeg_path, args)
            .await
            .map_err(Error::RemuxError)?;

        if !process_output.status.success() {
            let error_msg = String::from_utf8_lossy(&process_output.stderr);
            return Err(Error::RemuxError(format!(
                "ffmpeg failed with status {}: {}",
                process_output.status, error_msg
            )));
        }

        Ok(())
    }
}

#[derive(Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Deserialize)]
struct FfprobeStream {
    width: Option<u32>,
    height: Option<u32>,
}

fn parse_probe_output(stdout: &[u8]) -> Result<Option<MediaGeometry>, Error> {
    let ffprobe_output = serde_json::from_slice::<FfprobeOutput>(stdout)
        .map_err(|e| Error::ProbeError(format!("Failed to deserialize ffprobe output: {e}")))?;

    Ok(ffprobe_output.streams.first().and_then(|stream| {
        match (stream.width, stream.height) {
            (Some(width), Some(height)) if width > 0 && height > 0 => {
                Some(MediaGeometry { width, height })
            }
            _ => None,
        }
    }))
}

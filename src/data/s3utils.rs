use std::task::Poll;

use async_trait::async_trait;
use futures::ready;
use pin_project::pin_project;
use rand::RngCore;
use s3::{Bucket, Region, creds::Credentials};
use tokio::io::AsyncRead;

use crate::{error::Error, util::object_url};

/// Number of random bytes in the base name of an object key.
const OBJECT_KEY_ENTROPY_BYTES: usize = 32;

/// The path-like key an object is stored under, `{prefix}/{random}.{extension}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives a new object key from 32 bytes of the thread-local CSPRNG, encoded as unpadded url-safe
/// base64. Keys are never checked against the store.
pub fn derive_object_key(prefix: &str, extension: &str) -> ObjectKey {
    let mut bytes = [0u8; OBJECT_KEY_ENTROPY_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    let base = data_encoding::BASE64URL_NOPAD.encode(&bytes);
    ObjectKey(format!("{prefix}/{base}.{extension}"))
}

/// Blob storage the pipeline publishes to.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores the reader's bytes under `key` in a single put.
    async fn put(
        &self,
        bucket: &str,
        key: &ObjectKey,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        content_type: &str,
    ) -> Result<(), Error>;
}

/// Uploads the reader to the store and returns the public URL of the new object.
pub async fn publish(
    object_store: &dyn ObjectStore,
    bucket: &str,
    public_host: &str,
    key: &ObjectKey,
    reader: impl AsyncRead + Unpin + Send,
    content_type: &str,
) -> Result<String, Error> {
    // build the URL up front so that a bad host configuration fails before anything is uploaded
    let url = object_url(bucket, public_host, key.as_str())?;

    let mut reader = ByteCountingReader::new(reader);
    log::info!("Starting upload of {} to bucket {}", key, bucket);
    object_store
        .put(bucket, key, &mut reader, content_type)
        .await?;
    log::info!(
        "Finished upload of {} ({} bytes) to bucket {}",
        key,
        reader.byte_count,
        bucket
    );

    Ok(url.to_string())
}

#[pin_project]
struct ByteCountingReader<R> {
    #[pin]
    inner: R,
    byte_count: usize,
}

impl<R> ByteCountingReader<R> {
    fn new(inner: R) -> Self {
        ByteCountingReader {
            inner,
            byte_count: 0,
        }
    }
}

impl<R: AsyncRead> AsyncRead for ByteCountingReader<R> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let curr_len = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        *this.byte_count += buf.filled().len() - curr_len;
        Poll::Ready(Ok(()))
    }
}

/// [`ObjectStore`] for S3 and S3 compatible services.
pub struct S3ObjectStore {
    region: Region,
    credentials: Credentials,
    path_style: bool,
}

impl S3ObjectStore {
    /// Creates a store for the given AWS region, or for a custom endpoint when `endpoint` is set
    /// (addressed path-style).
    pub fn new(
        region: &str,
        endpoint: Option<&str>,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, Error> {
        let region = match endpoint {
            Some(endpoint) => Region::Custom {
                region: String::from(region),
                endpoint: String::from(endpoint),
            },
            None => region
                .parse::<Region>()
                .map_err(|e| Error::InvalidBucketError(e.to_string()))?,
        };

        let credentials = Credentials {
            access_key: Some(String::from(access_key)),
            secret_key: Some(String::from(secret_key)),
            security_token: None,
            session_token: None,
            expiration: None,
        };

        Ok(Self {
            region,
            credentials,
            path_style: endpoint.is_some(),
        })
    }

    fn create_bucket(&self, bucket_name: &str) -> Result<Bucket, Error> {
        Bucket::new(bucket_name, self.region.clone(), self.credentials.clone())
            .map_err(|e| Error::InvalidBucketError(e.to_string()))
            .map(|b| if self.path_style { b.with_path_style() } else { b })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        bucket: &str,
        key: &ObjectKey,
        mut reader: &mut (dyn AsyncRead + Unpin + Send),
        content_type: &str,
    ) -> Result<(), Error> {
        let bucket = self.create_bucket(bucket)?;
        let status = bucket
            .put_object_stream_with_content_type(&mut reader, key.as_str(), content_type)
            .await
            .map_err(|e| Error::PublishError(e.to_string()))?;
        if status >= 300 {
            return Err(Error::PublishError(format!(
                "S3 responded with status {status} storing {key}"
            )));
        }
        Ok(())
    }
}

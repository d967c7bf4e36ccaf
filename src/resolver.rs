//! Data resolvers turn an identifier into raw bytes (or a decoded image).
//!
//! One resolver is registered per [`ImageSource`]. File and stream
//! resolvers are built in; network and platform-resource resolvers are
//! provided by the host.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::cancellation::CancellationToken;
use crate::decoder::{DecodedImage, ImageInformation};
use crate::error::{LoadError, LoadResult};
use crate::request::{DownloadProgress, ImageRequest, ImageSource, ImageStream, LoadingResult};

/// What a resolver produced.
#[derive(Debug)]
pub enum ResolvedPayload {
    /// Encoded bytes for the decoder.
    Bytes(Bytes),
    /// Already decoded; the decoder is skipped.
    Decoded(DecodedImage),
}

#[derive(Debug)]
pub struct ResolvedImage {
    pub payload: ResolvedPayload,
    pub loading_result: LoadingResult,
    pub info: ImageInformation,
}

impl ResolvedImage {
    pub fn bytes(data: Bytes, loading_result: LoadingResult, info: ImageInformation) -> Self {
        Self {
            payload: ResolvedPayload::Bytes(data),
            loading_result,
            info,
        }
    }
}

/// Per-call context handed to a resolver.
pub struct ResolveContext<'a> {
    pub token: &'a CancellationToken,
    progress: &'a (dyn Fn(DownloadProgress) + Send + Sync),
    started: &'a (dyn Fn(&str) + Send + Sync),
    stream: Option<&'a Mutex<Option<PreparedStream>>>,
}

impl<'a> ResolveContext<'a> {
    pub(crate) fn new(
        token: &'a CancellationToken,
        progress: &'a (dyn Fn(DownloadProgress) + Send + Sync),
        started: &'a (dyn Fn(&str) + Send + Sync),
        stream: Option<&'a Mutex<Option<PreparedStream>>>,
    ) -> Self {
        Self {
            token,
            progress,
            started,
            stream,
        }
    }

    /// Report download progress to every listener of the request.
    pub fn report_progress(&self, progress: DownloadProgress) {
        (self.progress)(progress);
    }

    /// Announce that a network download is starting.
    pub fn download_started(&self, url: &str) {
        (self.started)(url);
    }

    /// Stream opened during lifecycle init, if any. Buffered content stays
    /// in place for retries; a forward-only stream can be taken once.
    pub(crate) fn take_prepared_stream(&self) -> Option<PreparedStream> {
        let mut slot = self.stream?.lock();
        match slot.as_ref() {
            Some(PreparedStream::Buffered(data)) => Some(PreparedStream::Buffered(data.clone())),
            _ => slot.take(),
        }
    }
}

/// Stream content captured by lifecycle init.
pub(crate) enum PreparedStream {
    /// Fully read, checksummed content.
    Buffered(Bytes),
    /// Forward-only stream, consumed by the first resolve.
    Forward(ImageStream),
}

pub trait DataResolver: Send + Sync {
    fn resolve(
        &self,
        identifier: &str,
        request: &ImageRequest,
        ctx: &ResolveContext<'_>,
    ) -> LoadResult<ResolvedImage>;
}

/// Reads files from the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileDataResolver;

impl DataResolver for FileDataResolver {
    fn resolve(
        &self,
        identifier: &str,
        request: &ImageRequest,
        ctx: &ResolveContext<'_>,
    ) -> LoadResult<ResolvedImage> {
        ctx.token.check()?;
        let mut file = File::open(identifier)
            .map_err(|e| LoadError::resolve(identifier, e.to_string()))?;
        let total = file.metadata().ok().map(|m| m.len());

        let mut data = Vec::with_capacity(total.unwrap_or(0) as usize);
        let mut chunk = [0u8; 64 * 1024];
        loop {
            ctx.token.check()?;
            let read = file
                .read(&mut chunk)
                .map_err(|e| LoadError::resolve(identifier, e.to_string()))?;
            if read == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..read]);
            ctx.report_progress(DownloadProgress {
                current: data.len() as u64,
                total,
            });
        }

        Ok(ResolvedImage::bytes(
            Bytes::from(data),
            LoadingResult::Disk,
            ImageInformation::new(identifier, request.source()),
        ))
    }
}

/// Serves stream requests, preferring the content read during init.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamDataResolver;

impl DataResolver for StreamDataResolver {
    fn resolve(
        &self,
        identifier: &str,
        request: &ImageRequest,
        ctx: &ResolveContext<'_>,
    ) -> LoadResult<ResolvedImage> {
        ctx.token.check()?;
        let data = match ctx.take_prepared_stream() {
            Some(PreparedStream::Buffered(data)) => data,
            Some(PreparedStream::Forward(stream)) => stream.read_all(ctx.token)?,
            None => {
                let provider = request
                    .stream_provider()
                    .ok_or(LoadError::MissingPath(ImageSource::Stream))?;
                provider(ctx.token)?.read_all(ctx.token)?
            }
        };

        Ok(ResolvedImage::bytes(
            data,
            LoadingResult::Stream,
            ImageInformation::new(identifier, ImageSource::Stream),
        ))
    }
}

/// Resolver registry keyed by source kind.
#[derive(Clone, Default)]
pub struct DataResolverFactory {
    resolvers: HashMap<ImageSource, Arc<dyn DataResolver>>,
}

impl DataResolverFactory {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in file and stream resolvers.
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.register(ImageSource::Filepath, Arc::new(FileDataResolver));
        factory.register(ImageSource::Stream, Arc::new(StreamDataResolver));
        factory
    }

    pub fn register(&mut self, source: ImageSource, resolver: Arc<dyn DataResolver>) {
        self.resolvers.insert(source, resolver);
    }

    pub fn resolver_for(&self, source: ImageSource) -> LoadResult<Arc<dyn DataResolver>> {
        self.resolvers
            .get(&source)
            .cloned()
            .ok_or(LoadError::NoResolver(source))
    }
}

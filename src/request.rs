//! Request descriptor and its fluent builder.
//!
//! An [`ImageRequest`] captures one caller's full intent: where the image
//! comes from, how it is processed, how it is cached and who is told about
//! the result. It is immutable once built; [`ImageRequest::dispose`] only
//! drops the callback references.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::cancellation::CancellationToken;
use crate::decoder::ImageInformation;
use crate::error::{LoadError, LoadResult};
use crate::lifecycle::TaskOutcome;
use crate::transform::Transformation;

/// Well-known priorities. Any `i32` is valid; higher runs sooner.
pub mod priority {
    pub const LOWEST: i32 = -1000;
    pub const LOW: i32 = -100;
    pub const NORMAL: i32 = 0;
    pub const HIGH: i32 = 100;
    pub const HIGHEST: i32 = 1000;
}

/// Where an image comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageSource {
    Url,
    Filepath,
    ApplicationBundle,
    CompiledResource,
    EmbeddedResource,
    Stream,
}

impl ImageSource {
    /// Priority used when the request does not set one. Local resources are
    /// cheap and usually visible chrome, so they jump the queue.
    pub fn default_priority(self) -> i32 {
        match self {
            ImageSource::ApplicationBundle | ImageSource::CompiledResource => priority::HIGHEST,
            ImageSource::Filepath => priority::HIGH,
            _ => priority::NORMAL,
        }
    }
}

/// How the delivered image was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadingResult {
    MemoryCache,
    Disk,
    Internet,
    ApplicationBundle,
    CompiledResource,
    EmbeddedResource,
    Stream,
}

/// Which caches a request may read and populate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheType {
    Memory,
    Disk,
    #[default]
    All,
    None,
}

impl CacheType {
    pub fn allows_memory(self) -> bool {
        matches!(self, CacheType::Memory | CacheType::All)
    }

    pub fn allows_disk(self) -> bool {
        matches!(self, CacheType::Disk | CacheType::All)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownSampleUnit {
    #[default]
    Pixels,
    /// Device-independent units, scaled by `Configuration::display_scale`.
    Dip,
}

/// Target geometry for decode-time downsampling. A zero dimension is derived
/// from the other one, keeping the aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownSample {
    pub width: u32,
    pub height: u32,
    pub unit: DownSampleUnit,
    pub allow_upscale: bool,
}

impl DownSample {
    pub fn pixels(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            unit: DownSampleUnit::Pixels,
            allow_upscale: false,
        }
    }

    pub fn dip(width: u32, height: u32) -> Self {
        Self {
            unit: DownSampleUnit::Dip,
            ..Self::pixels(width, height)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 && self.height == 0
    }
}

/// Sources rasterised at decode time (e.g. SVG). Output depends on the
/// requested size and on the string replacements applied to the document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorSpec {
    pub width: u32,
    pub height: u32,
    pub replace: HashMap<String, String>,
}

/// Secondary image shown while loading or after a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub path: String,
    pub source: ImageSource,
}

/// Progress reported by a resolver while fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub current: u64,
    pub total: Option<u64>,
}

/// An opened stream. Seekable streams are buffered and checksummed so that
/// identical content shares cache entries.
pub struct ImageStream {
    pub(crate) reader: Box<dyn Read + Send>,
    pub(crate) seekable: bool,
}

impl ImageStream {
    pub fn seekable(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            seekable: true,
        }
    }

    pub fn forward_only(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            seekable: false,
        }
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::seekable(Cursor::new(data.into()))
    }

    pub fn is_seekable(&self) -> bool {
        self.seekable
    }

    /// Read the remaining stream into memory, checking for cancellation
    /// between chunks.
    pub fn read_all(mut self, token: &CancellationToken) -> LoadResult<Bytes> {
        let mut data = Vec::new();
        let mut chunk = [0u8; 64 * 1024];
        loop {
            token.check()?;
            let read = self.reader.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..read]);
        }
        Ok(Bytes::from(data))
    }
}

pub type StreamProvider =
    Arc<dyn Fn(&CancellationToken) -> LoadResult<ImageStream> + Send + Sync>;
pub type SuccessCallback = Arc<dyn Fn(&ImageInformation, LoadingResult) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&LoadError) + Send + Sync>;
pub type FinishCallback = Arc<dyn Fn(TaskOutcome) + Send + Sync>;
pub type DownloadStartedCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct RequestCallbacks {
    pub(crate) success: Option<SuccessCallback>,
    pub(crate) error: Option<ErrorCallback>,
    pub(crate) finish: Option<FinishCallback>,
    pub(crate) download_started: Option<DownloadStartedCallback>,
    pub(crate) download_progress: Option<ProgressCallback>,
}

/// Immutable description of one image request.
pub struct ImageRequest {
    source: ImageSource,
    path: String,
    stream: Option<StreamProvider>,
    cache_duration: Option<Duration>,
    down_sample: Option<DownSample>,
    vector: Option<VectorSpec>,
    transformations: Vec<Arc<dyn Transformation>>,
    loading_placeholder: Option<Placeholder>,
    error_placeholder: Option<Placeholder>,
    priority: Option<i32>,
    retry_count: u32,
    retry_delay: Duration,
    cache_type: CacheType,
    custom_cache_key: Option<String>,
    delay: Option<Duration>,
    preload: bool,
    fade_animation: Option<bool>,
    fade_animation_for_cached: Option<bool>,
    transform_placeholders: Option<bool>,
    callbacks: Mutex<RequestCallbacks>,
    disposed: AtomicBool,
}

impl ImageRequest {
    pub fn from_url(url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(ImageSource::Url, url.into())
    }

    pub fn from_file(path: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(ImageSource::Filepath, path.into())
    }

    pub fn from_application_bundle(name: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(ImageSource::ApplicationBundle, name.into())
    }

    pub fn from_compiled_resource(name: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(ImageSource::CompiledResource, name.into())
    }

    pub fn from_embedded_resource(name: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(ImageSource::EmbeddedResource, name.into())
    }

    pub fn from_stream<F>(provider: F) -> RequestBuilder
    where
        F: Fn(&CancellationToken) -> LoadResult<ImageStream> + Send + Sync + 'static,
    {
        let mut builder = RequestBuilder::new(ImageSource::Stream, String::new());
        builder.request.stream = Some(Arc::new(provider));
        builder
    }

    pub fn source(&self) -> ImageSource {
        self.source
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn stream_provider(&self) -> Option<&StreamProvider> {
        self.stream.as_ref()
    }

    pub fn cache_duration(&self) -> Option<Duration> {
        self.cache_duration
    }

    pub fn down_sample(&self) -> Option<&DownSample> {
        self.down_sample.as_ref()
    }

    pub fn vector(&self) -> Option<&VectorSpec> {
        self.vector.as_ref()
    }

    pub fn transformations(&self) -> &[Arc<dyn Transformation>] {
        &self.transformations
    }

    pub fn loading_placeholder(&self) -> Option<&Placeholder> {
        self.loading_placeholder.as_ref()
    }

    pub fn error_placeholder(&self) -> Option<&Placeholder> {
        self.error_placeholder.as_ref()
    }

    /// Explicit priority, if the caller set one.
    pub fn priority(&self) -> Option<i32> {
        self.priority
    }

    /// Priority the scheduler starts from.
    pub fn effective_priority(&self) -> i32 {
        self.priority
            .unwrap_or_else(|| self.source.default_priority())
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    pub fn custom_cache_key(&self) -> Option<&str> {
        self.custom_cache_key.as_deref()
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    pub fn is_preload(&self) -> bool {
        self.preload
    }

    pub fn fade_animation(&self) -> Option<bool> {
        self.fade_animation
    }

    pub fn fade_animation_for_cached(&self) -> Option<bool> {
        self.fade_animation_for_cached
    }

    pub fn transform_placeholders(&self) -> Option<bool> {
        self.transform_placeholders
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Drop every callback reference so closures capturing UI objects are
    /// released as soon as the request finishes.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            *self.callbacks.lock() = RequestCallbacks::default();
        }
    }

    pub(crate) fn into_preload(mut self) -> Self {
        self.preload = true;
        self
    }

    pub(crate) fn callbacks(&self) -> RequestCallbacks {
        self.callbacks.lock().clone()
    }

    pub(crate) fn download_progress_callback(&self) -> Option<ProgressCallback> {
        self.callbacks.lock().download_progress.clone()
    }
}

impl std::fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageRequest")
            .field("source", &self.source)
            .field("path", &self.path)
            .field("down_sample", &self.down_sample)
            .field("transformations", &self.transformations.len())
            .field("priority", &self.priority)
            .field("cache_type", &self.cache_type)
            .field("custom_cache_key", &self.custom_cache_key)
            .field("preload", &self.preload)
            .finish()
    }
}

/// Fluent builder for [`ImageRequest`].
pub struct RequestBuilder {
    request: ImageRequest,
    callbacks: RequestCallbacks,
}

impl RequestBuilder {
    fn new(source: ImageSource, path: String) -> Self {
        Self {
            request: ImageRequest {
                source,
                path,
                stream: None,
                cache_duration: None,
                down_sample: None,
                vector: None,
                transformations: Vec::new(),
                loading_placeholder: None,
                error_placeholder: None,
                priority: None,
                retry_count: 0,
                retry_delay: Duration::ZERO,
                cache_type: CacheType::All,
                custom_cache_key: None,
                delay: None,
                preload: false,
                fade_animation: None,
                fade_animation_for_cached: None,
                transform_placeholders: None,
                callbacks: Mutex::new(RequestCallbacks::default()),
                disposed: AtomicBool::new(false),
            },
            callbacks: RequestCallbacks::default(),
        }
    }

    /// Downsample to `width`x`height` pixels.
    pub fn down_sample(mut self, width: u32, height: u32) -> Self {
        self.request.down_sample = Some(DownSample::pixels(width, height));
        self
    }

    /// Downsample to device-independent units.
    pub fn down_sample_in_dip(mut self, width: u32, height: u32) -> Self {
        self.request.down_sample = Some(DownSample::dip(width, height));
        self
    }

    pub fn down_sample_spec(mut self, spec: DownSample) -> Self {
        self.request.down_sample = Some(spec);
        self
    }

    pub fn vector(mut self, width: u32, height: u32) -> Self {
        let spec = self.request.vector.get_or_insert_with(VectorSpec::default);
        spec.width = width;
        spec.height = height;
        self
    }

    pub fn vector_replace<I, K, V>(mut self, replacements: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let spec = self.request.vector.get_or_insert_with(VectorSpec::default);
        spec.replace
            .extend(replacements.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Append a transformation; transformations run in insertion order.
    pub fn transform(mut self, transformation: Arc<dyn Transformation>) -> Self {
        self.request.transformations.push(transformation);
        self
    }

    pub fn transformations(mut self, transformations: Vec<Arc<dyn Transformation>>) -> Self {
        self.request.transformations.extend(transformations);
        self
    }

    pub fn loading_placeholder(mut self, path: impl Into<String>, source: ImageSource) -> Self {
        self.request.loading_placeholder = Some(Placeholder {
            path: path.into(),
            source,
        });
        self
    }

    pub fn error_placeholder(mut self, path: impl Into<String>, source: ImageSource) -> Self {
        self.request.error_placeholder = Some(Placeholder {
            path: path.into(),
            source,
        });
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.request.priority = Some(priority);
        self
    }

    /// Retry failed fetches `count` more times, waiting `delay` in between.
    pub fn retry(mut self, count: u32, delay: Duration) -> Self {
        self.request.retry_count = count;
        self.request.retry_delay = delay;
        self
    }

    pub fn cache_type(mut self, cache_type: CacheType) -> Self {
        self.request.cache_type = cache_type;
        self
    }

    /// Override the generated identity. The caller asserts that equal keys
    /// mean equal images.
    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.request.custom_cache_key = Some(key.into());
        self
    }

    pub fn cache_duration(mut self, duration: Duration) -> Self {
        self.request.cache_duration = Some(duration);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.request.delay = Some(delay);
        self
    }

    pub fn preload(mut self, preload: bool) -> Self {
        self.request.preload = preload;
        self
    }

    pub fn fade_animation(mut self, enabled: bool) -> Self {
        self.request.fade_animation = Some(enabled);
        self
    }

    pub fn fade_animation_for_cached(mut self, enabled: bool) -> Self {
        self.request.fade_animation_for_cached = Some(enabled);
        self
    }

    pub fn transform_placeholders(mut self, enabled: bool) -> Self {
        self.request.transform_placeholders = Some(enabled);
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&ImageInformation, LoadingResult) + Send + Sync + 'static,
    {
        self.callbacks.success = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&LoadError) + Send + Sync + 'static,
    {
        self.callbacks.error = Some(Arc::new(f));
        self
    }

    pub fn on_finish<F>(mut self, f: F) -> Self
    where
        F: Fn(TaskOutcome) + Send + Sync + 'static,
    {
        self.callbacks.finish = Some(Arc::new(f));
        self
    }

    pub fn on_download_started<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.download_started = Some(Arc::new(f));
        self
    }

    pub fn on_download_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(DownloadProgress) + Send + Sync + 'static,
    {
        self.callbacks.download_progress = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> ImageRequest {
        let RequestBuilder {
            request,
            callbacks,
        } = self;
        *request.callbacks.lock() = callbacks;
        request
    }
}

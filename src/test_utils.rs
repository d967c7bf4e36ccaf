//! Shared fakes for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::cache::ImageCache;
use crate::config::Configuration;
use crate::context::ServiceContext;
use crate::decoder::{DecodeOptions, DecodedImage, Decoder, ImageInformation};
use crate::error::{LoadError, LoadResult};
use crate::lifecycle::TaskOutcome;
use crate::request::{DownloadProgress, ImageRequest, ImageSource, LoadingResult, RequestBuilder};
use crate::resolver::{DataResolver, DataResolverFactory, ResolveContext, ResolvedImage};
use crate::service::ImageService;
use crate::target::{InlineDispatcher, Target};

/// Route `tracing` output to the test harness. Safe to call repeatedly.
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub(crate) fn rgb_payload(width: u32, height: u32) -> DecodedImage {
    DecodedImage::rgb(vec![0u8; (width * height * 3) as usize], width, height)
}

/// Poll `condition` every millisecond until it holds or `timeout` elapses.
pub(crate) fn wait_until(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Network stand-in: records calls, sleeps (cancellably), fails on demand.
#[derive(Default)]
pub(crate) struct FakeResolver {
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    resolved: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    flaky: Mutex<HashMap<String, usize>>,
    corrupt: Mutex<HashSet<String>>,
}

impl FakeResolver {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    /// Every resolve of `path` fails with a retryable error.
    pub(crate) fn fail_path(&self, path: &str) {
        self.failing.lock().insert(path.to_string());
    }

    /// The first `times` resolves of `path` fail with a retryable error.
    pub(crate) fn fail_first(&self, path: &str, times: usize) {
        self.flaky.lock().insert(path.to_string(), times);
    }

    /// Resolves of `path` fail with a non-retryable decode error.
    pub(crate) fn corrupt_path(&self, path: &str) {
        self.corrupt.lock().insert(path.to_string());
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn calls_for(&self, path: &str) -> usize {
        self.resolved.lock().iter().filter(|p| *p == path).count()
    }

    pub(crate) fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Identifiers in call order.
    pub(crate) fn resolved(&self) -> Vec<String> {
        self.resolved.lock().clone()
    }

    fn outcome(&self, identifier: &str) -> LoadResult<()> {
        if self.failing.lock().contains(identifier) {
            return Err(LoadError::resolve(identifier, "connection refused"));
        }
        if let Some(remaining) = self.flaky.lock().get_mut(identifier) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(LoadError::resolve(identifier, "timed out"));
            }
        }
        if self.corrupt.lock().contains(identifier) {
            return Err(LoadError::Decode(format!("{identifier}: corrupt")));
        }
        Ok(())
    }
}

impl DataResolver for FakeResolver {
    fn resolve(
        &self,
        identifier: &str,
        request: &ImageRequest,
        ctx: &ResolveContext<'_>,
    ) -> LoadResult<ResolvedImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.resolved.lock().push(identifier.to_string());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        ctx.download_started(identifier);
        let slept = ctx.token.sleep(self.delay);
        self.active.fetch_sub(1, Ordering::SeqCst);
        slept?;
        self.outcome(identifier)?;

        ctx.report_progress(DownloadProgress {
            current: 1,
            total: Some(1),
        });
        Ok(ResolvedImage::bytes(
            Bytes::from(identifier.as_bytes().to_vec()),
            LoadingResult::Internet,
            ImageInformation::new(identifier, request.source()),
        ))
    }
}

/// Produces a 2x2 RGB image from any input, within the decoded-size limit.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct FakeDecoder;

impl Decoder for FakeDecoder {
    fn decode(
        &self,
        data: &Bytes,
        _path: &str,
        _source: ImageSource,
        info: &mut ImageInformation,
        options: &DecodeOptions,
    ) -> LoadResult<DecodedImage> {
        if data.is_empty() {
            return Err(LoadError::Decode("empty payload".to_string()));
        }
        if options.max_decoded_bytes < 12 {
            return Err(LoadError::OutOfMemory(format!(
                "2x2 needs 12 bytes, limit is {}",
                options.max_decoded_bytes
            )));
        }
        let fill = data[0];
        let image = DecodedImage::rgb(vec![fill; 12], 2, 2);
        info.original_width = 2;
        info.original_height = 2;
        Ok(image)
    }
}

/// Target that records what it was given.
pub(crate) struct RecordingTarget {
    valid: AtomicBool,
    animations: Mutex<Vec<bool>>,
    cleared: AtomicUsize,
}

impl RecordingTarget {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            valid: AtomicBool::new(true),
            animations: Mutex::new(Vec::new()),
            cleared: AtomicUsize::new(0),
        })
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    pub(crate) fn sets(&self) -> usize {
        self.animations.lock().len()
    }

    pub(crate) fn clears(&self) -> usize {
        self.cleared.load(Ordering::SeqCst)
    }

    /// The `animated` flag of every `set`, in order.
    pub(crate) fn animations(&self) -> Vec<bool> {
        self.animations.lock().clone()
    }
}

impl Target for RecordingTarget {
    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn set(&self, _image: &DecodedImage, animated: bool) {
        self.animations.lock().push(animated);
    }

    fn set_as_empty(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
}

/// Collects callback invocations across any number of requests.
#[derive(Clone, Default)]
pub(crate) struct CallbackRecorder {
    successes: Arc<Mutex<Vec<LoadingResult>>>,
    errors: Arc<Mutex<Vec<String>>>,
    finishes: Arc<Mutex<Vec<TaskOutcome>>>,
}

impl CallbackRecorder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(&self, builder: RequestBuilder) -> RequestBuilder {
        let successes = Arc::clone(&self.successes);
        let errors = Arc::clone(&self.errors);
        let finishes = Arc::clone(&self.finishes);
        builder
            .on_success(move |_, result| successes.lock().push(result))
            .on_error(move |e| errors.lock().push(e.to_string()))
            .on_finish(move |outcome| finishes.lock().push(outcome))
    }

    pub(crate) fn successes(&self) -> Vec<LoadingResult> {
        self.successes.lock().clone()
    }

    pub(crate) fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub(crate) fn finishes(&self) -> Vec<TaskOutcome> {
        self.finishes.lock().clone()
    }
}

/// Context with `resolver` serving URLs and the fake decoder.
pub(crate) fn test_context(resolver: Arc<dyn DataResolver>) -> Arc<ServiceContext> {
    test_context_with_config(Configuration::default(), resolver)
}

pub(crate) fn test_context_with_config(
    config: Configuration,
    resolver: Arc<dyn DataResolver>,
) -> Arc<ServiceContext> {
    let mut resolvers = DataResolverFactory::with_defaults();
    resolvers.register(ImageSource::Url, resolver);
    Arc::new(ServiceContext::new(
        config,
        Arc::new(ImageCache::new(16)),
        resolvers,
        Arc::new(FakeDecoder),
        Arc::new(InlineDispatcher),
    ))
}

/// Service limited to `max_parallel` running lifecycles.
pub(crate) fn test_service(max_parallel: usize, resolver: Arc<dyn DataResolver>) -> ImageService {
    let config = Configuration {
        max_parallel_tasks: Some(max_parallel),
        admission_threads: 2,
        memory_cache_size_mb: 16,
        ..Default::default()
    };
    ImageService::builder(config)
        .resolver(ImageSource::Url, resolver)
        .decoder(Arc::new(FakeDecoder))
        .build()
        .unwrap()
}

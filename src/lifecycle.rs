//! Per-request state machine.
//!
//! A [`LoaderTask`] carries one [`ImageRequest`] from admission to a single
//! terminal outcome: memory-cache check, optional loading placeholder,
//! resolve (with retry), decode, transform, cache, deliver. The scheduler
//! decides *when* it runs; the task decides *what* happens.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use sha2::{Digest, Sha256};
use tracing::{debug, error, trace, warn};

use crate::cancellation::CancellationToken;
use crate::context::ServiceContext;
use crate::decoder::{DecodedImage, ImageInformation};
use crate::error::{LoadError, LoadResult};
use crate::key::{build_keys, CacheKeys};
use crate::request::{
    DownloadProgress, ImageRequest, ImageSource, LoadingResult, Placeholder, ProgressCallback,
};
use crate::resolver::{PreparedStream, ResolveContext, ResolvedImage, ResolvedPayload};
use crate::scheduler::WorkScheduler;
use crate::target::Target;

/// Where a lifecycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    MemoryCacheCheck,
    ShowingPlaceholder,
    Queued,
    Resolving,
    Decoding,
    Transforming,
    Caching,
    Delivering,
    Failed,
    Completed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled)
    }
}

/// Final result reported to the finish callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
enum PlaceholderKind {
    Loading,
    Error,
}

type CacheHit = (DecodedImage, ImageInformation);

/// One request's lifecycle.
pub(crate) struct LoaderTask {
    id: u64,
    request: Arc<ImageRequest>,
    target: Option<Arc<dyn Target>>,
    keys: RwLock<CacheKeys>,
    /// Set when keys could not be built; the request is rejected at submit.
    key_error: Mutex<Option<LoadError>>,
    token: CancellationToken,
    state: Mutex<TaskState>,
    priority: AtomicI32,
    sequence: AtomicU64,
    initialized: AtomicBool,
    loading_placeholder_shown: AtomicBool,
    /// Shared with posted placeholder jobs so a late placeholder never
    /// replaces the main image.
    delivered: Arc<AtomicBool>,
    cancel_requested: AtomicBool,
    finished: AtomicBool,
    /// Moved into the running set; slot release settles the task.
    dispatched: AtomicBool,
    outcome: Mutex<Option<TaskOutcome>>,
    done: Condvar,
    stream: Mutex<Option<PreparedStream>>,
    /// Progress callbacks of coalesced waiters.
    progress_listeners: Mutex<Vec<ProgressCallback>>,
    ctx: Arc<ServiceContext>,
    scheduler: Weak<WorkScheduler>,
}

impl LoaderTask {
    pub(crate) fn new(
        id: u64,
        request: ImageRequest,
        target: Option<Arc<dyn Target>>,
        ctx: Arc<ServiceContext>,
        scheduler: Weak<WorkScheduler>,
    ) -> Self {
        let (keys, key_error) = match build_keys(&request, None, &ctx.key_options) {
            Ok(keys) => (keys, None),
            Err(e) => (CacheKeys::default(), Some(e)),
        };
        let priority = request.effective_priority();
        Self {
            id,
            request: Arc::new(request),
            target,
            keys: RwLock::new(keys),
            key_error: Mutex::new(key_error),
            token: CancellationToken::new(),
            state: Mutex::new(TaskState::Created),
            priority: AtomicI32::new(priority),
            sequence: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            loading_placeholder_shown: AtomicBool::new(false),
            delivered: Arc::new(AtomicBool::new(false)),
            cancel_requested: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            dispatched: AtomicBool::new(false),
            outcome: Mutex::new(None),
            done: Condvar::new(),
            stream: Mutex::new(None),
            progress_listeners: Mutex::new(Vec::new()),
            ctx,
            scheduler,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn request(&self) -> &Arc<ImageRequest> {
        &self.request
    }

    pub(crate) fn keys(&self) -> CacheKeys {
        self.keys.read().clone()
    }

    pub(crate) fn raw_key(&self) -> String {
        self.keys.read().raw.clone()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn state(&self) -> TaskState {
        *self.state.lock()
    }

    fn set_state(&self, state: TaskState) {
        let mut current = self.state.lock();
        if !current.is_terminal() {
            *current = state;
        }
    }

    pub(crate) fn priority(&self) -> i32 {
        self.priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Release);
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub(crate) fn set_sequence(&self, sequence: u64) {
        self.sequence.store(sequence, Ordering::Release);
    }

    pub(crate) fn mark_queued(&self) {
        self.set_state(TaskState::Queued);
    }

    pub(crate) fn mark_dispatched(&self) {
        self.dispatched.store(true, Ordering::Release);
    }

    pub(crate) fn is_dispatched(&self) -> bool {
        self.dispatched.load(Ordering::Acquire)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn outcome(&self) -> Option<TaskOutcome> {
        *self.outcome.lock()
    }

    pub(crate) fn take_key_error(&self) -> Option<LoadError> {
        self.key_error.lock().take()
    }

    /// Request delay, else the configured default.
    pub(crate) fn admission_delay(&self) -> Duration {
        self.request
            .delay()
            .unwrap_or_else(|| Duration::from_millis(self.ctx.config.delay_ms))
    }

    /// Stream sources without a custom key must be opened before their keys
    /// are final.
    pub(crate) fn needs_init(&self) -> bool {
        self.request.source() == ImageSource::Stream
            && self.request.custom_cache_key().is_none()
            && !self.initialized.load(Ordering::Acquire)
    }

    /// Forward a coalesced waiter's progress callback to this fetch.
    pub(crate) fn add_progress_listener(&self, listener: ProgressCallback) {
        self.progress_listeners.lock().push(listener);
    }

    fn fade_enabled(&self) -> bool {
        self.request
            .fade_animation()
            .unwrap_or(self.ctx.config.fade_animation_enabled)
    }

    fn fade_for_cached(&self) -> bool {
        self.request
            .fade_animation_for_cached()
            .unwrap_or(self.ctx.config.fade_animation_for_cached_images)
    }

    fn transform_placeholders(&self) -> bool {
        self.request
            .transform_placeholders()
            .unwrap_or(self.ctx.config.transform_placeholders)
    }

    fn memory_cacheable(&self, keys: &CacheKeys) -> bool {
        self.request.cache_type().allows_memory() && keys.cacheable
    }

    /// Open stream sources and key them by content. Idempotent.
    pub(crate) fn init(&self) -> LoadResult<()> {
        if !self.needs_init() || self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        match self.show_loading_placeholder() {
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => debug!(task = self.id, error = %e, "Loading placeholder failed"),
            Ok(()) => {}
        }

        let provider = self
            .request
            .stream_provider()
            .ok_or(LoadError::MissingPath(ImageSource::Stream))?;
        let stream = provider(&self.token)?;

        if stream.is_seekable() {
            let data = stream.read_all(&self.token)?;
            let checksum = hex::encode(Sha256::digest(&data));
            let keys = build_keys(&self.request, Some(&checksum), &self.ctx.key_options)?;
            debug!(task = self.id, key = %keys.key, "Stream keyed by content");
            *self.keys.write() = keys;
            *self.stream.lock() = Some(PreparedStream::Buffered(data));
        } else {
            *self.stream.lock() = Some(PreparedStream::Forward(stream));
        }
        Ok(())
    }

    /// Memory lookup under the full key, without side effects on the task.
    pub(crate) fn lookup_memory_cache(&self) -> Option<CacheHit> {
        let keys = self.keys.read();
        if !self.memory_cacheable(&keys) {
            return None;
        }
        self.ctx.memory_cache.get(&keys.key)
    }

    /// Complete immediately from the memory cache. Returns false on miss.
    pub(crate) fn try_load_from_memory_cache(&self) -> bool {
        self.set_state(TaskState::MemoryCacheCheck);
        match self.lookup_memory_cache() {
            Some(hit) => {
                self.complete_from_cache(hit);
                true
            }
            None => false,
        }
    }

    pub(crate) fn complete_from_cache(&self, (image, mut info): CacheHit) {
        debug!(task = self.id, key = %info.cache_key, "Memory cache hit");
        self.set_state(TaskState::Delivering);
        let animated = self.fade_enabled() && self.fade_for_cached();
        self.deliver(&image, animated);
        info.loading_result = Some(LoadingResult::MemoryCache);
        self.fire_success(info, LoadingResult::MemoryCache);
        self.finalize(TaskOutcome::Success, true);
    }

    /// Show the loading placeholder once, unless the main image is already up.
    pub(crate) fn show_loading_placeholder(&self) -> LoadResult<()> {
        if self.loading_placeholder_shown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.set_state(TaskState::ShowingPlaceholder);
        self.show_placeholder(PlaceholderKind::Loading)
    }

    fn show_placeholder(&self, kind: PlaceholderKind) -> LoadResult<()> {
        let Some(target) = self.target.clone() else {
            return Ok(());
        };
        if !target.is_valid() || self.delivered.load(Ordering::Acquire) {
            return Ok(());
        }

        let keys = self.keys();
        let (placeholder, key) = match kind {
            PlaceholderKind::Loading => {
                (self.request.loading_placeholder(), keys.loading_placeholder)
            }
            PlaceholderKind::Error => (self.request.error_placeholder(), keys.error_placeholder),
        };
        let (Some(placeholder), Some(key)) = (placeholder, key) else {
            if let PlaceholderKind::Loading = kind {
                // Clear whatever the (possibly reused) target showed before.
                let delivered = Arc::clone(&self.delivered);
                self.ctx.dispatcher.post(Box::new(move || {
                    if target.is_valid() && !delivered.load(Ordering::Acquire) {
                        target.set_as_empty();
                    }
                }));
            }
            return Ok(());
        };

        self.token.check()?;
        let image = match self.ctx.memory_cache.get(&key) {
            Some((image, _)) => image,
            None => self
                .ctx
                .placeholder_locks
                .with_lock(&key, || self.load_placeholder(placeholder, &key))?,
        };
        self.token.check()?;

        let delivered = Arc::clone(&self.delivered);
        self.ctx.dispatcher.post(Box::new(move || {
            if target.is_valid() && !delivered.load(Ordering::Acquire) {
                target.set(&image, false);
            }
        }));
        trace!(task = self.id, key = %key, ?kind, "Placeholder shown");
        Ok(())
    }

    /// Nested resolve/decode/transform for a placeholder. Runs under the
    /// placeholder's keyed lock, so a second caller finds it cached.
    fn load_placeholder(&self, placeholder: &Placeholder, key: &str) -> LoadResult<DecodedImage> {
        if let Some((image, _)) = self.ctx.memory_cache.get(key) {
            return Ok(image);
        }

        let resolver = self.ctx.resolvers.resolver_for(placeholder.source)?;
        let ignore_progress = |_: DownloadProgress| {};
        let ignore_started = |_: &str| {};
        let ctx = ResolveContext::new(&self.token, &ignore_progress, &ignore_started, None);
        let resolved = resolver.resolve(&placeholder.path, &self.request, &ctx)?;
        self.token.check()?;

        let (mut image, mut info) = self.decode(resolved, &placeholder.path, placeholder.source)?;
        if self.transform_placeholders() {
            image = self.apply_transformations(
                image,
                &placeholder.path,
                placeholder.source,
                true,
                key,
            )?;
        }

        info.cache_key = key.to_string();
        self.ctx.memory_cache.add(key, info, image.clone());
        Ok(image)
    }

    /// Worker entry point. Always ends in [`LoaderTask::finalize`].
    pub(crate) fn run(&self) {
        match self.load() {
            Ok(()) => self.finalize(TaskOutcome::Success, true),
            Err(e) => self.complete_with_error(e),
        }
    }

    fn load(&self) -> LoadResult<()> {
        self.token.check()?;
        if let Some(target) = &self.target {
            if !target.is_valid() {
                debug!(task = self.id, "Target no longer valid, skipping load");
                return Err(LoadError::Cancelled);
            }
        }

        let keys = self.keys();
        let started = Instant::now();

        self.set_state(TaskState::Resolving);
        let resolved = self.resolve_with_retry(&keys)?;
        self.token.check()?;
        self.trace_phase("resolve", started);

        let loading_result = resolved.loading_result;
        let path = self.identifier(&keys);
        let (image, mut info) = self.decode(resolved, &path, self.request.source())?;
        self.token.check()?;
        self.trace_phase("decode", started);

        self.set_state(TaskState::Transforming);
        let image =
            self.apply_transformations(image, &path, self.request.source(), false, &keys.key)?;
        self.token.check()?;
        self.trace_phase("transform", started);

        info.cache_key = keys.key.clone();
        info.loading_result = Some(loading_result);
        info.current_width = image.width;
        info.current_height = image.height;

        if self.memory_cacheable(&keys) {
            self.set_state(TaskState::Caching);
            self.ctx.memory_cache.add(&keys.key, info.clone(), image.clone());
        }
        self.token.check()?;

        self.set_state(TaskState::Delivering);
        self.deliver(&image, self.fade_enabled());
        self.fire_success(info, loading_result);
        self.trace_phase("deliver", started);
        Ok(())
    }

    fn identifier(&self, keys: &CacheKeys) -> String {
        match self.request.source() {
            ImageSource::Stream => keys.raw.clone(),
            _ => self.request.path().to_string(),
        }
    }

    fn resolve_with_retry(&self, keys: &CacheKeys) -> LoadResult<ResolvedImage> {
        let resolver = self.ctx.resolvers.resolver_for(self.request.source())?;
        let identifier = self.identifier(keys);
        let progress = |p: DownloadProgress| self.report_progress(p);
        let started = |url: &str| self.report_download_started(url);

        let mut attempt = 0;
        loop {
            self.token.check()?;
            let ctx = ResolveContext::new(&self.token, &progress, &started, Some(&self.stream));
            match resolver.resolve(&identifier, &self.request, &ctx) {
                Ok(resolved) => return Ok(resolved),
                Err(e) if e.is_retryable() && attempt < self.request.retry_count() => {
                    attempt += 1;
                    warn!(
                        task = self.id,
                        key = %keys.raw,
                        attempt,
                        error = %e,
                        "Resolve failed, retrying"
                    );
                    self.token.sleep(self.request.retry_delay())?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn decode(
        &self,
        resolved: ResolvedImage,
        path: &str,
        source: ImageSource,
    ) -> LoadResult<CacheHit> {
        let ResolvedImage { payload, mut info, .. } = resolved;
        let image = match payload {
            ResolvedPayload::Decoded(image) => image,
            ResolvedPayload::Bytes(data) => {
                self.set_state(TaskState::Decoding);
                let options = self.ctx.decode_options(&self.request);
                self.ctx.decoder.decode(&data, path, source, &mut info, &options)?
            }
        };
        if info.original_width == 0 && info.original_height == 0 {
            info.original_width = image.width;
            info.original_height = image.height;
        }
        info.current_width = image.width;
        info.current_height = image.height;
        Ok((image, info))
    }

    fn apply_transformations(
        &self,
        mut image: DecodedImage,
        path: &str,
        source: ImageSource,
        is_placeholder: bool,
        key: &str,
    ) -> LoadResult<DecodedImage> {
        for transformation in self.request.transformations() {
            self.token.check()?;
            image = transformation.transform(image, path, source, is_placeholder, key)?;
        }
        Ok(image)
    }

    fn deliver(&self, image: &DecodedImage, animated: bool) {
        let Some(target) = self.target.clone() else {
            return;
        };
        if !target.is_valid() {
            debug!(task = self.id, "Target no longer valid, dropping image");
            return;
        }
        self.delivered.store(true, Ordering::Release);
        let image = image.clone();
        self.ctx.dispatcher.post(Box::new(move || {
            if target.is_valid() {
                target.set(&image, animated);
            }
        }));
    }

    fn report_progress(&self, progress: DownloadProgress) {
        let mut listeners: Vec<ProgressCallback> = self.progress_listeners.lock().clone();
        listeners.extend(self.request.download_progress_callback());
        for listener in listeners {
            self.ctx.run_callback(Box::new(move || listener(progress)));
        }
    }

    fn report_download_started(&self, url: &str) {
        if let Some(callback) = self.request.callbacks().download_started {
            let url = url.to_string();
            self.ctx.run_callback(Box::new(move || callback(&url)));
        }
    }

    fn fire_success(&self, info: ImageInformation, result: LoadingResult) {
        if let Some(callback) = self.request.callbacks().success {
            self.ctx.run_callback(Box::new(move || callback(&info, result)));
        }
    }

    /// Error path: log, notify, recover, show the error placeholder, finish.
    pub(crate) fn complete_with_error(&self, error: LoadError) {
        if error.is_cancelled() {
            debug!(task = self.id, "Load cancelled");
            self.finalize(TaskOutcome::Cancelled, true);
            return;
        }

        self.set_state(TaskState::Failed);
        error!(
            task = self.id,
            key = %self.raw_key(),
            source = ?self.request.source(),
            error = %error,
            "Image loading failed"
        );

        if error.is_out_of_memory() && self.ctx.config.clear_memory_cache_on_out_of_memory {
            warn!(task = self.id, "Clearing memory cache after out-of-memory");
            self.ctx.memory_cache.clear();
        }

        if let Some(callback) = self.request.callbacks().error {
            self.ctx.run_callback(Box::new(move || callback(&error)));
        }

        match self.show_placeholder(PlaceholderKind::Error) {
            Err(e) if e.is_cancelled() => {
                self.finalize(TaskOutcome::Cancelled, true);
                return;
            }
            Err(e) => debug!(task = self.id, error = %e, "Error placeholder failed"),
            Ok(()) => {}
        }
        self.finalize(TaskOutcome::Failed, true);
    }

    /// Reject a request whose descriptor is unusable.
    pub(crate) fn reject(&self, error: LoadError) {
        error!(
            task = self.id,
            source = ?self.request.source(),
            error = %error,
            "Rejected image request"
        );
        if let Some(callback) = self.request.callbacks().error {
            self.ctx.run_callback(Box::new(move || callback(&error)));
        }
        self.finalize(TaskOutcome::Failed, true);
    }

    /// Terminal transition. Runs at most once; `notify` controls whether the
    /// finish callback fires.
    pub(crate) fn finalize(&self, outcome: TaskOutcome, notify: bool) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        *self.state.lock() = match outcome {
            TaskOutcome::Cancelled => TaskState::Cancelled,
            TaskOutcome::Success | TaskOutcome::Failed => TaskState::Completed,
        };

        if notify {
            if let Some(callback) = self.request.callbacks().finish {
                self.ctx.run_callback(Box::new(move || callback(outcome)));
            }
        }
        self.request.dispose();
        self.progress_listeners.lock().clear();
        self.stream.lock().take();

        {
            let mut slot = self.outcome.lock();
            *slot = Some(outcome);
            self.done.notify_all();
        }

        if !self.is_dispatched() {
            if let Some(scheduler) = self.scheduler.upgrade() {
                scheduler.task_settled(self.id, outcome);
            }
        }
    }

    /// Idempotent; no-op once finished.
    pub(crate) fn cancel(&self) {
        if self.is_finished() || self.cancel_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(task = self.id, "Cancelling task");
        self.token.cancel();
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.remove_pending(self);
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
            || self.outcome() == Some(TaskOutcome::Cancelled)
    }

    /// Block until finished or `timeout` elapses. Returns true if finished.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.outcome.lock();
        while outcome.is_none() {
            if self.done.wait_until(&mut outcome, deadline).timed_out() {
                return outcome.is_some();
            }
        }
        true
    }

    fn trace_phase(&self, phase: &str, started: Instant) {
        if self.ctx.perf_logging {
            trace!(
                task = self.id,
                phase,
                elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
                "Lifecycle phase finished"
            );
        }
    }
}

/// Caller's handle to a submitted request.
#[derive(Clone)]
pub struct TaskHandle {
    task: Arc<LoaderTask>,
}

impl TaskHandle {
    pub(crate) fn new(task: Arc<LoaderTask>) -> Self {
        Self { task }
    }

    pub fn id(&self) -> u64 {
        self.task.id()
    }

    pub fn request(&self) -> &ImageRequest {
        self.task.request()
    }

    pub fn keys(&self) -> CacheKeys {
        self.task.keys()
    }

    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.task.outcome()
    }

    /// Current scheduling priority, including promotions.
    pub fn priority(&self) -> i32 {
        self.task.priority()
    }

    pub fn cancel(&self) {
        self.task.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    pub fn is_completed(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the terminal outcome. Returns false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.task.wait(timeout)
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("priority", &self.priority())
            .finish()
    }
}

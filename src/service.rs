//! Caller-facing entry point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cache::{ImageCache, MemoryCache};
use crate::config::Configuration;
use crate::context::ServiceContext;
use crate::decoder::{Decoder, JpegDecoder};
use crate::error::LoadResult;
use crate::lifecycle::{LoaderTask, TaskHandle};
use crate::request::{CacheType, ImageRequest, ImageSource};
use crate::resolver::{DataResolver, DataResolverFactory};
use crate::scheduler::{SchedulerStats, WorkScheduler};
use crate::target::{InlineDispatcher, MainThreadDispatcher, Target};

/// Wires collaborators into an [`ImageService`]. Anything not supplied gets
/// the built-in default.
pub struct ImageServiceBuilder {
    config: Configuration,
    memory_cache: Option<Arc<dyn MemoryCache>>,
    resolvers: DataResolverFactory,
    decoder: Option<Arc<dyn Decoder>>,
    dispatcher: Option<Arc<dyn MainThreadDispatcher>>,
}

impl ImageServiceBuilder {
    pub fn memory_cache(mut self, cache: Arc<dyn MemoryCache>) -> Self {
        self.memory_cache = Some(cache);
        self
    }

    /// Register (or replace) the resolver for `source`.
    pub fn resolver(mut self, source: ImageSource, resolver: Arc<dyn DataResolver>) -> Self {
        self.resolvers.register(source, resolver);
        self
    }

    pub fn decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn MainThreadDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn build(self) -> LoadResult<ImageService> {
        self.config.validate()?;
        let scheduler = WorkScheduler::new(&self.config)?;
        let memory_cache = self
            .memory_cache
            .unwrap_or_else(|| Arc::new(ImageCache::new(self.config.memory_cache_size_mb)));
        let decoder = self.decoder.unwrap_or_else(|| Arc::new(JpegDecoder));
        let dispatcher = self.dispatcher.unwrap_or_else(|| Arc::new(InlineDispatcher));

        debug!(
            max_parallel_tasks = scheduler.max_parallel_tasks(),
            memory_cache_mb = self.config.memory_cache_size_mb,
            "Image service started"
        );

        let ctx = ServiceContext::new(
            self.config,
            memory_cache,
            self.resolvers,
            decoder,
            dispatcher,
        );
        Ok(ImageService {
            ctx: Arc::new(ctx),
            scheduler,
            next_id: AtomicU64::new(1),
        })
    }
}

/// Async image acquisition: scheduling, coalescing, caching and delivery.
pub struct ImageService {
    ctx: Arc<ServiceContext>,
    scheduler: Arc<WorkScheduler>,
    next_id: AtomicU64,
}

impl ImageService {
    pub fn builder(config: Configuration) -> ImageServiceBuilder {
        ImageServiceBuilder {
            config,
            memory_cache: None,
            resolvers: DataResolverFactory::with_defaults(),
            decoder: None,
            dispatcher: None,
        }
    }

    /// Service with every default collaborator.
    pub fn new(config: Configuration) -> LoadResult<Self> {
        Self::builder(config).build()
    }

    /// Start loading `request` into `target`. Never fails; outcomes arrive
    /// through the request's callbacks and the returned handle.
    pub fn submit(&self, request: ImageRequest, target: Option<Arc<dyn Target>>) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(LoaderTask::new(
            id,
            request,
            target,
            Arc::clone(&self.ctx),
            Arc::downgrade(&self.scheduler),
        ));
        let handle = TaskHandle::new(Arc::clone(&task));
        self.scheduler.submit(task);
        handle
    }

    /// Load without a target (callbacks only).
    pub fn load(&self, request: ImageRequest) -> TaskHandle {
        self.submit(request, None)
    }

    /// Warm the cache. Preloads share a limited number of running slots.
    pub fn preload(&self, request: ImageRequest) -> TaskHandle {
        self.submit(request.into_preload(), None)
    }

    /// Cancel every unfinished request for which `predicate` holds.
    pub fn cancel_where(&self, predicate: impl Fn(&ImageRequest) -> bool) -> usize {
        self.scheduler.cancel_where(|task| predicate(task.request()))
    }

    pub fn cancel_all(&self) -> usize {
        self.scheduler.cancel_where(|_| true)
    }

    pub fn set_exit_tasks_early(&self, exit: bool) {
        self.scheduler.set_exit_tasks_early(exit);
    }

    pub fn set_pause_work(&self, pause: bool) {
        self.scheduler.set_pause_work(pause);
    }

    pub fn is_paused(&self) -> bool {
        self.scheduler.is_paused()
    }

    pub fn is_exiting_early(&self) -> bool {
        self.scheduler.is_exiting_early()
    }

    /// Drop `key` from the caches selected by `cache_type`. Only the memory
    /// cache is owned here; disk caches belong to resolvers.
    pub fn invalidate_cache(&self, key: &str, cache_type: CacheType) {
        if cache_type.allows_memory() {
            self.ctx.memory_cache.remove(key);
        }
    }

    /// Drop every memory entry derived from `base_key`.
    pub fn invalidate_similar(&self, base_key: &str) {
        self.ctx.memory_cache.remove_similar(base_key);
    }

    pub fn clear_memory_cache(&self) {
        self.ctx.memory_cache.clear();
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.scheduler.wait_for_idle(timeout)
    }

    pub fn config(&self) -> &Configuration {
        &self.ctx.config
    }

    pub fn memory_cache(&self) -> &Arc<dyn MemoryCache> {
        &self.ctx.memory_cache
    }
}

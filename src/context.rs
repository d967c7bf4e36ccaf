//! Shared collaborators handed to every lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::MemoryCache;
use crate::config::{perf_logging_enabled, Configuration};
use crate::decoder::{DecodeOptions, Decoder, PixelDownSample};
use crate::key::KeyOptions;
use crate::request::{DownSampleUnit, ImageRequest};
use crate::resolver::DataResolverFactory;
use crate::target::MainThreadDispatcher;

/// Engine-wide state owned by the service and borrowed by lifecycles.
pub(crate) struct ServiceContext {
    pub(crate) config: Configuration,
    pub(crate) key_options: KeyOptions,
    pub(crate) memory_cache: Arc<dyn MemoryCache>,
    pub(crate) resolvers: DataResolverFactory,
    pub(crate) decoder: Arc<dyn Decoder>,
    pub(crate) dispatcher: Arc<dyn MainThreadDispatcher>,
    /// Serializes placeholder loads so one placeholder is fetched once.
    pub(crate) placeholder_locks: KeyedLocks,
    /// Per-phase timing traces (config flag or FASTLOAD_PERF_LOGGING).
    pub(crate) perf_logging: bool,
}

impl ServiceContext {
    pub(crate) fn new(
        config: Configuration,
        memory_cache: Arc<dyn MemoryCache>,
        resolvers: DataResolverFactory,
        decoder: Arc<dyn Decoder>,
        dispatcher: Arc<dyn MainThreadDispatcher>,
    ) -> Self {
        let key_options = KeyOptions {
            display_scale: config.display_scale,
            transform_placeholders: config.transform_placeholders,
        };
        let perf_logging = config.verbose_performance_logging || perf_logging_enabled();
        Self {
            config,
            key_options,
            memory_cache,
            resolvers,
            decoder,
            dispatcher,
            placeholder_locks: KeyedLocks::default(),
            perf_logging,
        }
    }

    /// Decode settings for `request`, with dip geometry converted to pixels.
    pub(crate) fn decode_options(&self, request: &ImageRequest) -> DecodeOptions {
        let down_sample = request
            .down_sample()
            .filter(|ds| !ds.is_empty())
            .map(|ds| {
                let (width, height) = match ds.unit {
                    DownSampleUnit::Pixels => (ds.width, ds.height),
                    DownSampleUnit::Dip => (
                        self.config.dip_to_pixels(ds.width),
                        self.config.dip_to_pixels(ds.height),
                    ),
                };
                PixelDownSample {
                    width,
                    height,
                    allow_upscale: ds.allow_upscale,
                }
            });
        DecodeOptions {
            down_sample,
            max_decoded_bytes: self.config.max_decoded_bytes,
        }
    }

    /// Run a user callback, on the UI thread when so configured.
    pub(crate) fn run_callback(&self, job: Box<dyn FnOnce() + Send>) {
        if self.config.execute_callbacks_on_ui_thread {
            self.dispatcher.post(job);
        } else {
            job();
        }
    }
}

/// One mutex per string key, created on demand and dropped when unused.
#[derive(Default)]
pub(crate) struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    /// Run `f` while holding the lock for `key`.
    pub(crate) fn with_lock<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
        let lock = Arc::clone(self.locks.lock().entry(key.to_string()).or_default());
        let result = {
            let _guard = lock.lock();
            f()
        };

        let mut locks = self.locks.lock();
        // Map entry plus ours: nobody else is waiting on this key.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
        result
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

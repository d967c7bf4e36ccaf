//! FastLoad Core - Asynchronous image acquisition engine.
//!
//! This crate provides:
//! - Priority scheduling with bounded parallelism on a rayon thread pool
//! - Coalescing of identical in-flight requests (one fetch per resource)
//! - Concurrent decoded-image cache using moka (TinyLFU eviction)
//! - Pluggable resolvers, decoders and transformations
//! - Fast JPEG decoding
//!
//! Usage:
//! ```no_run
//! use std::time::Duration;
//! use fastload_core::{Configuration, ImageRequest, ImageService};
//!
//! let service = ImageService::new(Configuration::default())?;
//! let handle = service.load(
//!     ImageRequest::from_file("/tmp/photo.jpg")
//!         .down_sample(256, 256)
//!         .on_finish(|outcome| println!("finished: {outcome:?}"))
//!         .build(),
//! );
//! handle.wait(Duration::from_secs(5));
//! # Ok::<(), fastload_core::LoadError>(())
//! ```

mod cache;
mod cancellation;
mod config;
mod context;
mod decoder;
mod error;
mod key;
mod lifecycle;
mod request;
mod resolver;
mod scheduler;
mod service;
mod target;
mod transform;
#[cfg(test)]
pub(crate) mod test_utils;

pub use cache::{CacheStats, ImageCache, MemoryCache};
pub use cancellation::CancellationToken;
pub use config::Configuration;
pub use decoder::{
    downsample, target_size, DecodeOptions, DecodedImage, Decoder, ImageInformation, JpegDecoder,
    PixelDownSample,
};
pub use error::{LoadError, LoadResult};
pub use key::{build_keys, CacheKeys, KeyOptions};
pub use lifecycle::{TaskHandle, TaskOutcome, TaskState};
pub use request::{
    priority, CacheType, DownSample, DownSampleUnit, DownloadProgress, DownloadStartedCallback,
    ErrorCallback, FinishCallback, ImageRequest, ImageSource, ImageStream, LoadingResult,
    Placeholder, ProgressCallback, RequestBuilder, StreamProvider, SuccessCallback, VectorSpec,
};
pub use resolver::{
    DataResolver, DataResolverFactory, FileDataResolver, ResolveContext, ResolvedImage,
    ResolvedPayload, StreamDataResolver,
};
pub use scheduler::SchedulerStats;
pub use service::{ImageService, ImageServiceBuilder};
pub use target::{InlineDispatcher, MainThreadDispatcher, Target};
pub use transform::{FlipTransformation, FlipType, GrayscaleTransformation, Transformation};

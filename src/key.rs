//! Cache-key derivation.
//!
//! `raw` names the underlying resource, `key` names the final processed
//! artifact. Two requests share `key` exactly when they would produce the
//! same output: same resource, same geometry, same ordered transformations.

use crate::error::{LoadError, LoadResult};
use crate::request::{DownSampleUnit, ImageRequest, ImageSource};

/// Inputs to key building that come from configuration.
#[derive(Debug, Clone, Copy)]
pub struct KeyOptions {
    /// Pixels per device-independent unit.
    pub display_scale: f32,
    /// Default for whether placeholder keys include transformations.
    pub transform_placeholders: bool,
}

impl Default for KeyOptions {
    fn default() -> Self {
        Self {
            display_scale: 1.0,
            transform_placeholders: true,
        }
    }
}

impl KeyOptions {
    fn to_pixels(&self, value: u32, unit: DownSampleUnit) -> u32 {
        match unit {
            DownSampleUnit::Pixels => value,
            DownSampleUnit::Dip => (value as f32 * self.display_scale).round() as u32,
        }
    }
}

/// Every key derived from one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheKeys {
    pub raw: String,
    pub downsampling_only: String,
    pub transformations_only: String,
    pub key: String,
    pub key_without_transformations: String,
    pub loading_placeholder: Option<String>,
    pub error_placeholder: Option<String>,
    /// False for streams that could not be checksummed. Such requests are
    /// never cached and never coalesced.
    pub cacheable: bool,
}

/// Build the key set for `request`. `stream_checksum` identifies stream
/// content once it has been read.
pub fn build_keys(
    request: &ImageRequest,
    stream_checksum: Option<&str>,
    options: &KeyOptions,
) -> LoadResult<CacheKeys> {
    let mut cacheable = true;
    let base = match request.custom_cache_key() {
        Some(custom) => custom.to_string(),
        None if request.source() == ImageSource::Stream => match stream_checksum {
            Some(checksum) => checksum.to_string(),
            None => {
                cacheable = false;
                format!("stream-{}", uuid::Uuid::new_v4())
            }
        },
        None => request.path().to_string(),
    };

    if base.trim().is_empty() {
        return Err(LoadError::InvalidKey(base));
    }

    let raw = match request.custom_cache_key() {
        Some(_) => base,
        None => base + &vector_suffix(request),
    };

    let downsampling_only = downsample_suffix(request, options);
    let transformations_only = transformation_suffix(request);

    let (key, key_without_transformations) = match request.custom_cache_key() {
        Some(custom) => (custom.to_string(), custom.to_string()),
        None => (
            format!("{raw}{downsampling_only}{transformations_only}"),
            format!("{raw}{downsampling_only}"),
        ),
    };

    let transform_placeholders = request
        .transform_placeholders()
        .unwrap_or(options.transform_placeholders);
    let placeholder_key = |path: &str| -> Option<String> {
        if path.trim().is_empty() {
            return None;
        }
        let mut key = format!("{path}{downsampling_only}");
        if transform_placeholders {
            key.push_str(&transformations_only);
        }
        Some(key)
    };

    Ok(CacheKeys {
        loading_placeholder: request
            .loading_placeholder()
            .and_then(|p| placeholder_key(&p.path)),
        error_placeholder: request
            .error_placeholder()
            .and_then(|p| placeholder_key(&p.path)),
        raw,
        downsampling_only,
        transformations_only,
        key,
        key_without_transformations,
        cacheable,
    })
}

/// `(size=WxH,type=vector[,replace=k=v,...])`, replacements sorted by key.
fn vector_suffix(request: &ImageRequest) -> String {
    let Some(vector) = request.vector() else {
        return String::new();
    };

    let mut suffix = format!("(size={}x{},type=vector", vector.width, vector.height);
    if !vector.replace.is_empty() {
        let mut pairs: Vec<_> = vector.replace.iter().collect();
        pairs.sort();
        let joined = pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        suffix.push_str(",replace=");
        suffix.push_str(&joined);
    }
    suffix.push(')');
    suffix
}

fn downsample_suffix(request: &ImageRequest, options: &KeyOptions) -> String {
    match request.down_sample() {
        Some(ds) if !ds.is_empty() => {
            let width = options.to_pixels(ds.width, ds.unit);
            let height = options.to_pixels(ds.height, ds.unit);
            let upscale = if ds.allow_upscale { "u" } else { "" };
            format!(";{width}x{height}{upscale}")
        }
        _ => String::new(),
    }
}

fn transformation_suffix(request: &ImageRequest) -> String {
    let transformations = request.transformations();
    if transformations.is_empty() {
        return String::new();
    }
    let keys: Vec<String> = transformations.iter().map(|t| t.key()).collect();
    format!(";{}", keys.join(";"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::request::DownSample;
    use crate::transform::{FlipTransformation, GrayscaleTransformation};

    fn keys(request: &ImageRequest) -> CacheKeys {
        build_keys(request, None, &KeyOptions::default()).unwrap()
    }

    #[test]
    fn test_plain_path_key() {
        let k = keys(&ImageRequest::from_url("https://x/a.jpg").build());
        assert_eq!(k.raw, "https://x/a.jpg");
        assert_eq!(k.key, "https://x/a.jpg");
        assert_eq!(k.key_without_transformations, "https://x/a.jpg");
        assert!(k.cacheable);
    }

    #[test]
    fn test_downsample_and_transform_suffixes() {
        let request = ImageRequest::from_url("https://x/a.jpg")
            .down_sample(100, 80)
            .transform(Arc::new(GrayscaleTransformation))
            .transform(Arc::new(FlipTransformation::horizontal()))
            .build();
        let k = keys(&request);

        assert_eq!(k.raw, "https://x/a.jpg");
        assert_eq!(k.downsampling_only, ";100x80");
        assert_eq!(
            k.transformations_only,
            ";GrayscaleTransformation;FlipTransformation,Type=Horizontal"
        );
        assert_eq!(k.key, format!("{}{}{}", k.raw, k.downsampling_only, k.transformations_only));
        assert_eq!(k.key_without_transformations, "https://x/a.jpg;100x80");
    }

    #[test]
    fn test_identical_requests_share_key() {
        let build = || {
            ImageRequest::from_url("https://x/a.jpg")
                .down_sample(64, 64)
                .transform(Arc::new(GrayscaleTransformation))
                .build()
        };
        assert_eq!(keys(&build()).key, keys(&build()).key);
    }

    #[test]
    fn test_transformation_order_changes_key() {
        let a = ImageRequest::from_url("https://x/a.jpg")
            .transform(Arc::new(GrayscaleTransformation))
            .transform(Arc::new(FlipTransformation::vertical()))
            .build();
        let b = ImageRequest::from_url("https://x/a.jpg")
            .transform(Arc::new(FlipTransformation::vertical()))
            .transform(Arc::new(GrayscaleTransformation))
            .build();
        let (ka, kb) = (keys(&a), keys(&b));
        assert_eq!(ka.raw, kb.raw);
        assert_ne!(ka.key, kb.key);
    }

    #[test]
    fn test_dip_downsample_converted_to_pixels() {
        let request = ImageRequest::from_url("https://x/a.jpg")
            .down_sample_in_dip(50, 25)
            .build();
        let options = KeyOptions {
            display_scale: 2.0,
            ..Default::default()
        };
        let k = build_keys(&request, None, &options).unwrap();
        assert_eq!(k.downsampling_only, ";100x50");
    }

    #[test]
    fn test_upscale_marker() {
        let request = ImageRequest::from_url("https://x/a.jpg")
            .down_sample_spec(DownSample {
                allow_upscale: true,
                ..DownSample::pixels(10, 10)
            })
            .build();
        assert_eq!(keys(&request).downsampling_only, ";10x10u");
    }

    #[test]
    fn test_empty_downsample_omitted() {
        let request = ImageRequest::from_url("https://x/a.jpg").down_sample(0, 0).build();
        assert_eq!(keys(&request).downsampling_only, "");
    }

    #[test]
    fn test_custom_key_verbatim() {
        let request = ImageRequest::from_url("https://x/a.jpg?token=123")
            .cache_key("avatar-42")
            .down_sample(10, 10)
            .transform(Arc::new(GrayscaleTransformation))
            .build();
        let k = keys(&request);
        assert_eq!(k.raw, "avatar-42");
        assert_eq!(k.key, "avatar-42");
        assert_eq!(k.key_without_transformations, "avatar-42");
        assert!(k.cacheable);
    }

    #[test]
    fn test_blank_path_rejected() {
        let request = ImageRequest::from_file("   ").build();
        let result = build_keys(&request, None, &KeyOptions::default());
        assert!(matches!(result, Err(LoadError::InvalidKey(_))));
    }

    #[test]
    fn test_stream_without_checksum_is_unique_and_uncacheable() {
        let request = ImageRequest::from_stream(|_| {
            Ok(crate::request::ImageStream::from_bytes(vec![1u8]))
        })
        .build();
        let a = keys(&request);
        let b = keys(&request);
        assert!(!a.cacheable);
        assert!(a.raw.starts_with("stream-"));
        assert_ne!(a.raw, b.raw);
    }

    #[test]
    fn test_stream_checksum_key() {
        let request = ImageRequest::from_stream(|_| {
            Ok(crate::request::ImageStream::from_bytes(vec![1u8]))
        })
        .down_sample(5, 5)
        .build();
        let k = build_keys(&request, Some("abc123"), &KeyOptions::default()).unwrap();
        assert_eq!(k.raw, "abc123");
        assert_eq!(k.key, "abc123;5x5");
        assert!(k.cacheable);
    }

    #[test]
    fn test_vector_replace_map_order_insensitive() {
        let a = ImageRequest::from_file("icon.svg")
            .vector(24, 24)
            .vector_replace([("#000", "#fff"), ("fill", "red")])
            .build();
        let b = ImageRequest::from_file("icon.svg")
            .vector(24, 24)
            .vector_replace([("fill", "red"), ("#000", "#fff")])
            .build();
        let (ka, kb) = (keys(&a), keys(&b));
        assert_eq!(ka.raw, "icon.svg(size=24x24,type=vector,replace=#000=#fff,fill=red)");
        assert_eq!(ka.key, kb.key);
    }

    #[test]
    fn test_vector_size_changes_key() {
        let a = ImageRequest::from_file("icon.svg").vector(24, 24).build();
        let b = ImageRequest::from_file("icon.svg").vector(48, 48).build();
        assert_ne!(keys(&a).key, keys(&b).key);
    }

    #[test]
    fn test_placeholder_keys_follow_transform_setting() {
        let request = ImageRequest::from_url("https://x/a.jpg")
            .down_sample(10, 10)
            .transform(Arc::new(GrayscaleTransformation))
            .loading_placeholder("loading.png", ImageSource::CompiledResource)
            .error_placeholder("error.png", ImageSource::CompiledResource)
            .build();
        let k = keys(&request);
        assert_eq!(
            k.loading_placeholder.as_deref(),
            Some("loading.png;10x10;GrayscaleTransformation")
        );

        let options = KeyOptions {
            transform_placeholders: false,
            ..Default::default()
        };
        let k = build_keys(&request, None, &options).unwrap();
        assert_eq!(k.error_placeholder.as_deref(), Some("error.png;10x10"));
    }

    #[test]
    fn test_request_override_beats_default_for_placeholders() {
        let request = ImageRequest::from_url("https://x/a.jpg")
            .transform(Arc::new(GrayscaleTransformation))
            .loading_placeholder("loading.png", ImageSource::CompiledResource)
            .transform_placeholders(false)
            .build();
        let k = keys(&request);
        assert_eq!(k.loading_placeholder.as_deref(), Some("loading.png"));
        assert_eq!(k.error_placeholder, None);
    }
}

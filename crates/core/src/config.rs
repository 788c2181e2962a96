//! Remote cache settings.
//!
//! Settings arrive as a flat string attribute map (`bucket=...,name=a;b`) from
//! the build system or the CLI. They are parsed once into an immutable
//! [`CacheSettings`] value that is handed to every constructor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const ATTR_BUCKET: &str = "bucket";
pub const ATTR_REGION: &str = "region";
pub const ATTR_PREFIX: &str = "prefix";
pub const ATTR_MANIFESTS_PREFIX: &str = "manifests_prefix";
pub const ATTR_BLOBS_PREFIX: &str = "blobs_prefix";
pub const ATTR_NAME: &str = "name";
pub const ATTR_TOUCH_REFRESH: &str = "touch_refresh";
pub const ATTR_ENDPOINT_URL: &str = "endpoint_url";
pub const ATTR_ACCESS_KEY_ID: &str = "access_key_id";
pub const ATTR_SECRET_ACCESS_KEY: &str = "secret_access_key";
pub const ATTR_SESSION_TOKEN: &str = "session_token";
pub const ATTR_USE_PATH_STYLE: &str = "use_path_style";
pub const ATTR_UPLOAD_PARALLELISM: &str = "upload_parallelism";

/// Environment variable consulted when no bucket attribute is given.
pub const ENV_BUCKET: &str = "AWS_BUCKET";
/// Environment variable consulted when no region attribute is given.
pub const ENV_REGION: &str = "AWS_REGION";

/// Default manifest name.
pub const DEFAULT_NAME: &str = "buildkit";
/// Default age after which an existing blob is touched.
pub const DEFAULT_TOUCH_REFRESH: Duration = Duration::from_secs(24 * 60 * 60);
/// Default number of concurrent blob uploads.
pub const DEFAULT_UPLOAD_PARALLELISM: usize = 4;

/// Configuration of the S3 remote cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Bucket name.
    pub bucket: String,
    /// AWS region.
    pub region: String,
    /// Prefix prepended to every key.
    #[serde(default)]
    pub prefix: String,
    /// Sub-prefix for manifest objects.
    #[serde(default = "default_manifests_prefix")]
    pub manifests_prefix: String,
    /// Sub-prefix for blob objects.
    #[serde(default = "default_blobs_prefix")]
    pub blobs_prefix: String,
    /// Manifest names. Every name is written on export, the first one is read
    /// on import.
    #[serde(default = "default_names")]
    pub names: Vec<String>,
    /// Blobs last modified longer ago than this are touched on export.
    #[serde(default = "default_touch_refresh", with = "duration_secs")]
    pub touch_refresh: Duration,
    /// Custom endpoint (MinIO, LocalStack, ...).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Static access key ID. Falls back to the ambient AWS credential chain.
    #[serde(default)]
    pub access_key_id: Option<String>,
    /// Static secret access key.
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Session token for temporary static credentials.
    #[serde(default)]
    pub session_token: Option<String>,
    /// Use path-style addressing (`endpoint/bucket/key`). Only applied with a
    /// custom endpoint.
    #[serde(default)]
    pub use_path_style: bool,
    /// Number of blobs uploaded concurrently.
    #[serde(default = "default_upload_parallelism")]
    pub upload_parallelism: usize,
}

fn default_manifests_prefix() -> String {
    "manifests/".to_string()
}

fn default_blobs_prefix() -> String {
    "blobs/".to_string()
}

fn default_names() -> Vec<String> {
    vec![DEFAULT_NAME.to_string()]
}

fn default_touch_refresh() -> Duration {
    DEFAULT_TOUCH_REFRESH
}

fn default_upload_parallelism() -> usize {
    DEFAULT_UPLOAD_PARALLELISM
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

impl CacheSettings {
    /// Settings for a bucket and region with every other value defaulted.
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            prefix: String::new(),
            manifests_prefix: default_manifests_prefix(),
            blobs_prefix: default_blobs_prefix(),
            names: default_names(),
            touch_refresh: DEFAULT_TOUCH_REFRESH,
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            use_path_style: false,
            upload_parallelism: DEFAULT_UPLOAD_PARALLELISM,
        }
    }

    /// Parse settings from an attribute map.
    ///
    /// `env` resolves the bucket and region fallbacks (`AWS_BUCKET`,
    /// `AWS_REGION`); pass `|k| std::env::var(k).ok()` in production.
    /// Missing bucket or region and a malformed `upload_parallelism` are
    /// errors. A malformed `touch_refresh` or `use_path_style` falls back to
    /// its default.
    pub fn from_attrs<F>(attrs: &BTreeMap<String, String>, env: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bucket = attrs
            .get(ATTR_BUCKET)
            .cloned()
            .or_else(|| env(ENV_BUCKET))
            .ok_or_else(|| {
                crate::Error::Config(format!("bucket (${ENV_BUCKET}) not set for s3 cache"))
            })?;
        let region = attrs
            .get(ATTR_REGION)
            .cloned()
            .or_else(|| env(ENV_REGION))
            .ok_or_else(|| {
                crate::Error::Config(format!("region (${ENV_REGION}) not set for s3 cache"))
            })?;

        let mut settings = Self::new(bucket, region);

        if let Some(prefix) = attrs.get(ATTR_PREFIX) {
            settings.prefix = prefix.clone();
        }
        if let Some(prefix) = attrs.get(ATTR_MANIFESTS_PREFIX) {
            settings.manifests_prefix = prefix.clone();
        }
        if let Some(prefix) = attrs.get(ATTR_BLOBS_PREFIX) {
            settings.blobs_prefix = prefix.clone();
        }
        if let Some(names) = attrs.get(ATTR_NAME) {
            settings.names = names.split(';').map(str::to_string).collect();
        }
        if let Some(value) = attrs.get(ATTR_TOUCH_REFRESH) {
            match parse_duration(value) {
                Ok(d) => settings.touch_refresh = d,
                Err(e) => tracing::warn!(
                    value = %value,
                    error = %e,
                    "Ignoring invalid touch_refresh, using default"
                ),
            }
        }

        settings.endpoint_url = non_empty(attrs.get(ATTR_ENDPOINT_URL));
        settings.access_key_id = non_empty(attrs.get(ATTR_ACCESS_KEY_ID));
        settings.secret_access_key = non_empty(attrs.get(ATTR_SECRET_ACCESS_KEY));
        settings.session_token = non_empty(attrs.get(ATTR_SESSION_TOKEN));

        if let Some(value) = attrs.get(ATTR_USE_PATH_STYLE) {
            match parse_bool(value) {
                Some(b) => settings.use_path_style = b,
                None => tracing::warn!(
                    value = %value,
                    "Ignoring invalid use_path_style, using default"
                ),
            }
        }

        if let Some(value) = attrs.get(ATTR_UPLOAD_PARALLELISM) {
            settings.upload_parallelism = match value.parse::<i64>() {
                Ok(n) if n > 0 => n as usize,
                _ => {
                    return Err(crate::Error::Config(
                        "upload_parallelism must be a positive integer".to_string(),
                    ));
                }
            };
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings invariants.
    pub fn validate(&self) -> crate::Result<()> {
        if self.bucket.is_empty() {
            return Err(crate::Error::Config("bucket must not be empty".to_string()));
        }
        if self.region.is_empty() {
            return Err(crate::Error::Config("region must not be empty".to_string()));
        }
        if self.upload_parallelism == 0 {
            return Err(crate::Error::Config(
                "upload_parallelism must be a positive integer".to_string(),
            ));
        }
        if self.names.is_empty() {
            return Err(crate::Error::Config(
                "at least one manifest name is required".to_string(),
            ));
        }
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(_), Some(_)) | (None, None) => Ok(()),
            _ => Err(crate::Error::Config(
                "access_key_id and secret_access_key must be set together".to_string(),
            )),
        }
    }

    /// Static credentials, if both halves are configured.
    pub fn static_credentials(&self) -> Option<(&str, &str, Option<&str>)> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(id), Some(secret)) => Some((id, secret, self.session_token.as_deref())),
            _ => None,
        }
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Parse a duration string such as `24h`, `1h30m`, `90s` or `1.5h`.
///
/// Accepted units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. A bare
/// `0` is accepted; negative durations are not.
pub fn parse_duration(input: &str) -> crate::Result<Duration> {
    let invalid = || crate::Error::Config(format!("invalid duration: {input:?}"));

    let s = input.trim();
    let s = s.strip_prefix('+').unwrap_or(s);
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if number_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total_nanos += value * scale;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults() {
        let settings =
            CacheSettings::from_attrs(&attrs(&[("bucket", "b"), ("region", "r")]), no_env).unwrap();
        assert_eq!(settings, CacheSettings::new("b", "r"));
        assert_eq!(settings.names, vec!["buildkit".to_string()]);
        assert_eq!(settings.manifests_prefix, "manifests/");
        assert_eq!(settings.blobs_prefix, "blobs/");
        assert_eq!(settings.touch_refresh, Duration::from_secs(86400));
        assert_eq!(settings.upload_parallelism, 4);
        assert!(!settings.use_path_style);
    }

    #[test]
    fn test_bucket_and_region_fall_back_to_env() {
        let env = |k: &str| match k {
            ENV_BUCKET => Some("env-bucket".to_string()),
            ENV_REGION => Some("eu-west-1".to_string()),
            _ => None,
        };
        let settings = CacheSettings::from_attrs(&BTreeMap::new(), env).unwrap();
        assert_eq!(settings.bucket, "env-bucket");
        assert_eq!(settings.region, "eu-west-1");

        let settings =
            CacheSettings::from_attrs(&attrs(&[("bucket", "attr-bucket")]), env).unwrap();
        assert_eq!(settings.bucket, "attr-bucket");
    }

    #[test]
    fn test_missing_bucket_or_region_is_an_error() {
        let err = CacheSettings::from_attrs(&attrs(&[("region", "r")]), no_env).unwrap_err();
        assert!(err.to_string().contains("bucket ($AWS_BUCKET) not set"));

        let err = CacheSettings::from_attrs(&attrs(&[("bucket", "b")]), no_env).unwrap_err();
        assert!(err.to_string().contains("region ($AWS_REGION) not set"));
    }

    #[test]
    fn test_names_split_on_semicolon() {
        let settings = CacheSettings::from_attrs(
            &attrs(&[("bucket", "b"), ("region", "r"), ("name", "main;pr-42;latest")]),
            no_env,
        )
        .unwrap();
        assert_eq!(settings.names, vec!["main", "pr-42", "latest"]);
    }

    #[test]
    fn test_upload_parallelism_is_strict() {
        for bad in ["0", "-3", "four", "", "2.5", " 4", "4 "] {
            let err = CacheSettings::from_attrs(
                &attrs(&[("bucket", "b"), ("region", "r"), ("upload_parallelism", bad)]),
                no_env,
            )
            .unwrap_err();
            assert!(
                err.to_string().contains("positive integer"),
                "expected error for {bad:?}"
            );
        }

        let settings = CacheSettings::from_attrs(
            &attrs(&[("bucket", "b"), ("region", "r"), ("upload_parallelism", "16")]),
            no_env,
        )
        .unwrap();
        assert_eq!(settings.upload_parallelism, 16);
    }

    #[test]
    fn test_lenient_settings_fall_back() {
        let settings = CacheSettings::from_attrs(
            &attrs(&[
                ("bucket", "b"),
                ("region", "r"),
                ("touch_refresh", "soon"),
                ("use_path_style", "maybe"),
            ]),
            no_env,
        )
        .unwrap();
        assert_eq!(settings.touch_refresh, DEFAULT_TOUCH_REFRESH);
        assert!(!settings.use_path_style);

        let settings = CacheSettings::from_attrs(
            &attrs(&[
                ("bucket", "b"),
                ("region", "r"),
                ("touch_refresh", "1h30m"),
                ("use_path_style", "true"),
                ("endpoint_url", "http://minio:9000"),
            ]),
            no_env,
        )
        .unwrap();
        assert_eq!(settings.touch_refresh, Duration::from_secs(5400));
        assert!(settings.use_path_style);
        assert_eq!(settings.endpoint_url.as_deref(), Some("http://minio:9000"));
    }

    #[test]
    fn test_partial_credentials_rejected() {
        let err = CacheSettings::from_attrs(
            &attrs(&[("bucket", "b"), ("region", "r"), ("access_key_id", "AKIA")]),
            no_env,
        )
        .unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));

        let settings = CacheSettings::from_attrs(
            &attrs(&[
                ("bucket", "b"),
                ("region", "r"),
                ("access_key_id", "AKIA"),
                ("secret_access_key", "secret"),
                ("session_token", "token"),
            ]),
            no_env,
        )
        .unwrap();
        assert_eq!(
            settings.static_credentials(),
            Some(("AKIA", "secret", Some("token")))
        );
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("-1h").is_err());
        assert!(parse_duration("3d").is_err());
        assert!(parse_duration("h").is_err());
    }

    #[test]
    fn test_settings_deserialize_with_defaults() {
        let settings: CacheSettings =
            serde_json::from_str(r#"{"bucket": "b", "region": "r", "touch_refresh": 60}"#).unwrap();
        assert_eq!(settings.touch_refresh, Duration::from_secs(60));
        assert_eq!(settings.names, vec!["buildkit".to_string()]);
        assert_eq!(settings.upload_parallelism, 4);
    }
}

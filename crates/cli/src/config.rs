//! Settings loading for `stowagectl`.
//!
//! Attributes come from an optional TOML file, then `STOWAGE_ATTRS__*`
//! environment variables, then `--attr key=value` flags, later sources
//! winning. The merged map is handed to [`CacheSettings::from_attrs`].

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use stowage_core::CacheSettings;

/// A single attribute as written in the config file or environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl AttrValue {
    fn into_attr(self) -> String {
        match self {
            AttrValue::Bool(b) => b.to_string(),
            AttrValue::Int(n) => n.to_string(),
            AttrValue::Float(f) => f.to_string(),
            AttrValue::Text(s) => s,
            AttrValue::List(items) => items.join(";"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    attrs: BTreeMap<String, AttrValue>,
}

/// Parse a `key=value` flag.
pub fn parse_attr(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty attribute name in {raw:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Merge the config file and environment into an attribute map.
pub fn load_attrs(path: Option<&Path>) -> Result<BTreeMap<String, String>> {
    let mut figment = Figment::new();
    if let Some(path) = path {
        if !path.exists() {
            anyhow::bail!("config file {} does not exist", path.display());
        }
        figment = figment.merge(Toml::file(path));
    }
    figment = figment.merge(Env::prefixed("STOWAGE_").split("__"));

    let config: FileConfig = figment
        .extract()
        .context("failed to load configuration")?;
    Ok(config
        .attrs
        .into_iter()
        .map(|(k, v)| (k, v.into_attr()))
        .collect())
}

/// Resolve cache settings from every configuration source.
pub fn resolve_settings(
    path: Option<&Path>,
    overrides: &[(String, String)],
) -> Result<CacheSettings> {
    let mut attrs = load_attrs(path)?;
    for (key, value) in overrides {
        attrs.insert(key.clone(), value.clone());
    }
    tracing::debug!(attrs = ?attrs.keys().collect::<Vec<_>>(), "resolved cache attributes");

    CacheSettings::from_attrs(&attrs, |k| std::env::var(k).ok())
        .context("invalid cache configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_parse_attr() {
        assert_eq!(
            parse_attr("bucket=my-cache").unwrap(),
            ("bucket".to_string(), "my-cache".to_string())
        );
        assert_eq!(
            parse_attr("name=a;b=c").unwrap(),
            ("name".to_string(), "a;b=c".to_string())
        );
        assert_eq!(parse_attr("prefix=").unwrap().1, "");
        assert!(parse_attr("bucket").is_err());
        assert!(parse_attr("=x").is_err());
    }

    #[test]
    fn test_file_attrs_with_overrides() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stowage.toml");
        std::fs::write(
            &path,
            r#"
[attrs]
bucket = "from-file"
region = "eu-west-1"
upload_parallelism = 8
use_path_style = true
name = ["main", "nightly"]
touch_refresh = "36h"
"#,
        )
        .unwrap();

        let overrides = vec![("bucket".to_string(), "from-flag".to_string())];
        let settings = resolve_settings(Some(&path), &overrides).unwrap();
        assert_eq!(settings.bucket, "from-flag");
        assert_eq!(settings.region, "eu-west-1");
        assert_eq!(settings.upload_parallelism, 8);
        assert!(settings.use_path_style);
        assert_eq!(settings.names, vec!["main", "nightly"]);
        assert_eq!(settings.touch_refresh, Duration::from_secs(36 * 3600));
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let dir = tempdir().unwrap();
        let err = load_attrs(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_bad_parallelism_is_rejected() {
        let overrides = vec![
            ("bucket".to_string(), "b".to_string()),
            ("region".to_string(), "r".to_string()),
            ("upload_parallelism".to_string(), "0".to_string()),
        ];
        let err = resolve_settings(None, &overrides).unwrap_err();
        assert!(format!("{err:#}").contains("upload_parallelism"));
    }
}

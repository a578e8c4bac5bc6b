//! Snapshot requests: accepted input forms, validation, gathering, and
//! resource discovery seams.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::browser::{BrowserDriver, CaptureOptions};
use crate::client::{SnapshotUpload, UploadResource};
use crate::config::{DiscoveryConfig, SnapshotConfig};
use crate::error::Error;

/// Widths applied when neither the request nor the config sets any.
pub const DEFAULT_WIDTHS: [u32; 2] = [375, 1280];

/// The forms accepted by `snapshot()`.
///
/// Strings are URLs; strings ending in `.xml` are sitemaps. Arrays recurse
/// and are awaited in parallel.
#[derive(Debug, Clone)]
pub enum SnapshotInput {
    Url(String),
    Sitemap(String),
    Options(SnapshotOptions),
    Many(Vec<SnapshotInput>),
}

impl From<&str> for SnapshotInput {
    fn from(s: &str) -> Self {
        if s.ends_with(".xml") {
            SnapshotInput::Sitemap(s.to_string())
        } else {
            SnapshotInput::Url(s.to_string())
        }
    }
}

impl From<String> for SnapshotInput {
    fn from(s: String) -> Self {
        SnapshotInput::from(s.as_str())
    }
}

impl From<SnapshotOptions> for SnapshotInput {
    fn from(options: SnapshotOptions) -> Self {
        SnapshotInput::Options(options)
    }
}

impl<T: Into<SnapshotInput>> From<Vec<T>> for SnapshotInput {
    fn from(items: Vec<T>) -> Self {
        SnapshotInput::Many(items.into_iter().map(Into::into).collect())
    }
}

/// Options for one snapshot request.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SnapshotOptions {
    pub name: Option<String>,
    pub url: Option<String>,
    pub sitemap: Option<String>,
    pub widths: Vec<u32>,
    pub min_height: Option<u32>,
    pub enable_javascript: Option<bool>,
    /// Serve a local directory and snapshot against it.
    pub serve: Option<String>,
    /// Base the snapshot URL on this address; relative `url` values resolve
    /// against it. Populated from the static server when `serve` is set.
    pub base_url: Option<String>,
    pub additional_snapshots: Vec<AdditionalSnapshot>,
    pub meta: Value,
}

/// A variant of a snapshot captured from the same page under another name.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AdditionalSnapshot {
    pub name: Option<String>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
}

impl AdditionalSnapshot {
    /// Resolve this variant's name against the base snapshot name.
    pub fn resolve_name(&self, base: &str) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        format!(
            "{}{}{}",
            self.prefix.as_deref().unwrap_or_default(),
            base,
            self.suffix.as_deref().unwrap_or_default()
        )
    }
}

/// A concrete snapshot produced by gathering.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub name: String,
    pub url: String,
    pub widths: Vec<u32>,
    pub min_height: Option<u32>,
    pub enable_javascript: Option<bool>,
    pub meta: Value,
    /// Resolved names of additional snapshots captured from the same page.
    pub additional_names: Vec<String>,
}

impl Snapshot {
    /// Every upload name this snapshot can produce: its own plus variants.
    pub fn upload_names(&self) -> Vec<&str> {
        std::iter::once(self.name.as_str())
            .chain(self.additional_names.iter().map(String::as_str))
            .collect()
    }
}

/// Normalize and check snapshot options.
///
/// Returns the normalized options plus non-fatal warnings; only an
/// unusable target (no URL/sitemap, or an unparsable URL) is a hard error.
pub fn validate_snapshot_options(
    mut options: SnapshotOptions,
    defaults: &SnapshotConfig,
) -> Result<(SnapshotOptions, Vec<String>), Error> {
    let mut warnings = Vec::new();

    if options.url.is_none() && options.sitemap.is_none() && options.serve.is_none() {
        return Err(Error::Config("missing required URL for snapshot".into()));
    }

    if let Some(base) = &options.base_url {
        let base =
            Url::parse(base).map_err(|e| Error::Config(format!("invalid base URL: {e}")))?;
        options.url = Some(match &options.url {
            Some(url) => base
                .join(url)
                .map_err(|e| Error::Config(format!("invalid URL: {e}")))?
                .to_string(),
            None => base.to_string(),
        });
    }

    if let Some(url) = &options.url {
        let parsed = Url::parse(url).map_err(|e| Error::Config(format!("invalid URL: {e}")))?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => warnings.push(format!("unsupported URL scheme: {scheme}")),
        }
    }

    if options.widths.is_empty() {
        options.widths = if defaults.widths.is_empty() {
            DEFAULT_WIDTHS.to_vec()
        } else {
            defaults.widths.clone()
        };
    }
    if options.widths.len() > 10 {
        warnings.push("too many widths requested; using the first 10".into());
        options.widths.truncate(10);
    }
    if options.enable_javascript.is_none() {
        options.enable_javascript = defaults.enable_javascript;
    }
    if options.min_height.is_none() {
        options.min_height = defaults.min_height;
    }

    Ok((options, warnings))
}

/// Derive a snapshot name from its URL: path plus query.
pub fn name_from_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => {
            let mut name = parsed.path().to_string();
            if let Some(query) = parsed.query() {
                name.push('?');
                name.push_str(query);
            }
            name
        }
        Err(_) => url.to_string(),
    }
}

/// Produces concrete snapshots from validated options.
pub trait SnapshotSource: Send + Sync {
    fn gather<'a>(
        &'a self,
        options: &'a SnapshotOptions,
    ) -> BoxFuture<'a, Result<Vec<Snapshot>, Error>>;
}

/// The built-in source: one snapshot per URL-form request, with additional
/// snapshot names resolved. Sitemap expansion needs a fetching source.
pub struct DefaultSource;

impl SnapshotSource for DefaultSource {
    fn gather<'a>(
        &'a self,
        options: &'a SnapshotOptions,
    ) -> BoxFuture<'a, Result<Vec<Snapshot>, Error>> {
        Box::pin(async move {
            if options.sitemap.is_some() {
                return Err(Error::Snapshot(
                    "sitemap snapshots require a sitemap-capable source".into(),
                ));
            }
            let url = options
                .url
                .clone()
                .ok_or_else(|| Error::Snapshot("missing snapshot URL".into()))?;
            let name = options
                .name
                .clone()
                .unwrap_or_else(|| name_from_url(&url));
            let additional_names = options
                .additional_snapshots
                .iter()
                .map(|a| a.resolve_name(&name))
                .collect();
            Ok(vec![Snapshot {
                name,
                url,
                widths: options.widths.clone(),
                min_height: options.min_height,
                enable_javascript: options.enable_javascript,
                meta: options.meta.clone(),
                additional_names,
            }])
        })
    }
}

/// Turns a snapshot into its upload payloads.
pub trait ResourceDiscoverer: Send + Sync {
    fn discover<'a>(
        &'a self,
        snapshot: &'a Snapshot,
    ) -> BoxFuture<'a, Result<Vec<SnapshotUpload>, Error>>;
}

/// Discovery backed by a headless browser: navigate, settle, and capture
/// the DOM as the root resource, plus referenced resources from allowed
/// hostnames, for the snapshot and each of its variants.
pub struct BrowserDiscoverer {
    browser: Arc<dyn BrowserDriver>,
    config: DiscoveryConfig,
}

impl BrowserDiscoverer {
    pub fn new(browser: Arc<dyn BrowserDriver>, config: DiscoveryConfig) -> Self {
        Self { browser, config }
    }
}

impl ResourceDiscoverer for BrowserDiscoverer {
    fn discover<'a>(
        &'a self,
        snapshot: &'a Snapshot,
    ) -> BoxFuture<'a, Result<Vec<SnapshotUpload>, Error>> {
        Box::pin(async move {
            let capture = CaptureOptions {
                wait: self.config.network_idle_timeout.map(Duration::from_millis),
                disable_cache: self.config.disable_cache,
                allowed_hostnames: self.config.allowed_hostnames.clone(),
            };
            let page = self.browser.capture_page(&snapshot.url, &capture).await?;

            let mut resources = vec![UploadResource {
                url: page.url.clone(),
                mimetype: "text/html".into(),
                content: page.dom,
                is_root: true,
            }];
            resources.extend(page.resources.into_iter().map(|r| UploadResource {
                url: r.url,
                mimetype: r.mimetype,
                content: r.content,
                is_root: false,
            }));

            Ok(snapshot
                .upload_names()
                .into_iter()
                .map(|name| SnapshotUpload {
                    name: name.to_string(),
                    url: Some(page.url.clone()),
                    widths: snapshot.widths.clone(),
                    resources: resources.clone(),
                    meta: snapshot.meta.clone(),
                })
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_inputs_detect_sitemaps() {
        assert!(matches!(
            SnapshotInput::from("https://example.com/sitemap.xml"),
            SnapshotInput::Sitemap(_)
        ));
        assert!(matches!(
            SnapshotInput::from("https://example.com/about"),
            SnapshotInput::Url(_)
        ));
    }

    #[test]
    fn names_derive_from_path_and_query() {
        assert_eq!(name_from_url("https://example.com/about"), "/about");
        assert_eq!(
            name_from_url("https://example.com/search?q=rust"),
            "/search?q=rust"
        );
        assert_eq!(name_from_url("https://example.com"), "/");
    }

    #[test]
    fn additional_snapshot_names_resolve() {
        let variant = AdditionalSnapshot {
            suffix: Some(" (dark)".into()),
            ..Default::default()
        };
        assert_eq!(variant.resolve_name("/home"), "/home (dark)");

        let named = AdditionalSnapshot {
            name: Some("explicit".into()),
            prefix: Some("ignored ".into()),
            ..Default::default()
        };
        assert_eq!(named.resolve_name("/home"), "explicit");
    }

    #[test]
    fn validation_applies_width_defaults() {
        let defaults = SnapshotConfig::default();
        let (options, warnings) = validate_snapshot_options(
            SnapshotOptions {
                url: Some("https://example.com".into()),
                ..Default::default()
            },
            &defaults,
        )
        .unwrap();
        assert_eq!(options.widths, DEFAULT_WIDTHS.to_vec());
        assert!(warnings.is_empty());
    }

    #[test]
    fn validation_warns_without_failing() {
        let defaults = SnapshotConfig::default();
        let (options, warnings) = validate_snapshot_options(
            SnapshotOptions {
                url: Some("ftp://example.com/file".into()),
                widths: (0..12).map(|i| 320 + i).collect(),
                ..Default::default()
            },
            &defaults,
        )
        .unwrap();
        assert_eq!(warnings.len(), 2);
        assert_eq!(options.widths.len(), 10);
    }

    #[test]
    fn validation_resolves_urls_against_base() {
        let defaults = SnapshotConfig::default();
        let (options, _) = validate_snapshot_options(
            SnapshotOptions {
                url: Some("/index.html".into()),
                base_url: Some("http://localhost:5338".into()),
                serve: Some("public".into()),
                ..Default::default()
            },
            &defaults,
        )
        .unwrap();
        assert_eq!(options.url.as_deref(), Some("http://localhost:5338/index.html"));

        // Without an explicit URL the base itself is snapshotted.
        let (options, _) = validate_snapshot_options(
            SnapshotOptions {
                base_url: Some("http://localhost:5338".into()),
                serve: Some("public".into()),
                ..Default::default()
            },
            &defaults,
        )
        .unwrap();
        assert_eq!(options.url.as_deref(), Some("http://localhost:5338/"));

        // Absolute URLs are unaffected by the base.
        let (options, _) = validate_snapshot_options(
            SnapshotOptions {
                url: Some("https://example.com/about".into()),
                base_url: Some("http://localhost:5338".into()),
                ..Default::default()
            },
            &defaults,
        )
        .unwrap();
        assert_eq!(options.url.as_deref(), Some("https://example.com/about"));
    }

    #[test]
    fn validation_rejects_missing_target() {
        let defaults = SnapshotConfig::default();
        let result = validate_snapshot_options(SnapshotOptions::default(), &defaults);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn default_source_gathers_one_snapshot_with_variants() {
        let options = SnapshotOptions {
            url: Some("https://example.com/pricing".into()),
            widths: vec![800],
            additional_snapshots: vec![AdditionalSnapshot {
                suffix: Some(" (mobile)".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let snapshots = DefaultSource.gather(&options).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].name, "/pricing");
        assert_eq!(snapshots[0].additional_names, vec!["/pricing (mobile)"]);
        assert_eq!(
            snapshots[0].upload_names(),
            vec!["/pricing", "/pricing (mobile)"]
        );
    }
}

//! Headless browser driver.
//!
//! The core drives the [`BrowserDriver`] trait; [`ChromeBrowser`] is the
//! chromiumoxide-backed implementation used for asset discovery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::SetCacheDisabledParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::Page;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::Error;

/// Settings for one capture session.
#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    /// Extra settle time after navigation before the DOM is read.
    pub wait: Option<Duration>,
    /// Disable the browser cache for this page.
    pub disable_cache: bool,
    /// Hostnames (beyond the page's own) whose referenced resources are
    /// captured.
    pub allowed_hostnames: Vec<String>,
}

/// A text resource referenced by a captured page.
#[derive(Debug, Clone)]
pub struct PageResource {
    pub url: String,
    pub mimetype: String,
    pub content: String,
}

/// A page captured during discovery.
#[derive(Debug, Clone)]
pub struct CapturedPage {
    pub url: String,
    pub dom: String,
    pub title: Option<String>,
    /// Referenced resources from allowed hostnames.
    pub resources: Vec<PageResource>,
}

/// The browser surface the core depends on.
pub trait BrowserDriver: Send + Sync {
    fn launch(&self) -> BoxFuture<'_, Result<(), Error>>;

    fn close(&self) -> BoxFuture<'_, Result<(), Error>>;

    fn is_connected(&self) -> bool;

    /// Navigate to `url`, settle, and return the serialized DOM along with
    /// the referenced resources the options allow.
    fn capture_page<'a>(
        &'a self,
        url: &'a str,
        options: &'a CaptureOptions,
    ) -> BoxFuture<'a, Result<CapturedPage, Error>>;
}

/// Chrome launch settings.
#[derive(Debug, Clone, Default)]
pub struct ChromeLaunchOptions {
    /// Path to a Chrome/Chromium executable; auto-detected when `None`.
    pub executable: Option<String>,
}

struct ChromeInstance {
    browser: Browser,
    handler: tokio::task::JoinHandle<()>,
}

/// A single managed Chrome instance.
pub struct ChromeBrowser {
    options: ChromeLaunchOptions,
    instance: Mutex<Option<ChromeInstance>>,
    connected: AtomicBool,
}

impl ChromeBrowser {
    pub fn new(options: ChromeLaunchOptions) -> Self {
        Self {
            options,
            instance: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    fn launch_config(&self) -> Result<BrowserConfig, Error> {
        let mut builder = BrowserConfig::builder().args(chrome_args());
        if let Some(executable) = &self.options.executable {
            builder = builder.chrome_executable(executable);
        }
        builder.build().map_err(Error::Browser)
    }
}

/// Hardened flags for headless discovery sessions.
fn chrome_args() -> Vec<&'static str> {
    vec![
        "--headless",
        "--no-sandbox",
        "--disable-dev-shm-usage",
        "--disable-gpu",
        "--disable-background-timer-throttling",
        "--disable-backgrounding-occluded-windows",
        "--disable-renderer-backgrounding",
        "--disable-extensions",
        "--disable-default-apps",
        "--disable-sync",
        "--no-first-run",
        "--ignore-certificate-errors",
    ]
}

/// Stylesheet and script references in the live DOM, with the mimetype
/// implied by the referencing tag.
const LIST_RESOURCES_EXPR: &str = "\
Array.from(document.querySelectorAll('link[rel=\"stylesheet\"][href]'))\
    .map(e => ({ url: e.href, mimetype: 'text/css' }))\
    .concat(Array.from(document.querySelectorAll('script[src]'))\
    .map(e => ({ url: e.src, mimetype: 'application/javascript' })))";

#[derive(Debug, Deserialize)]
struct ResourceRef {
    url: String,
    mimetype: String,
}

fn hostname_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
}

/// Collect the page's referenced text resources, keeping only hostnames the
/// capture allows (the page's own host always is).
async fn collect_resources(
    page: &Page,
    page_url: &str,
    allowed_hostnames: &[String],
) -> Result<Vec<PageResource>, Error> {
    let refs: Vec<ResourceRef> = page
        .evaluate(LIST_RESOURCES_EXPR)
        .await
        .map_err(|e| Error::Browser(e.to_string()))?
        .into_value()
        .map_err(|e| Error::Browser(e.to_string()))?;

    let page_host = hostname_of(page_url);
    let mut resources = Vec::new();
    for reference in refs {
        let Some(host) = hostname_of(&reference.url) else {
            continue;
        };
        let allowed = page_host.as_deref() == Some(host.as_str())
            || allowed_hostnames.iter().any(|a| a == &host);
        if !allowed {
            debug!(url = %reference.url, "skipping resource from disallowed hostname");
            continue;
        }

        // Fetch the body from inside the page so cookies and relative
        // resolution behave as they did for the page itself.
        let fetch = EvaluateParams::builder()
            .expression(format!(
                "fetch({}).then(r => r.text())",
                serde_json::to_string(&reference.url)?
            ))
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(Error::Browser)?;
        match page.evaluate(fetch).await {
            Ok(result) => match result.into_value::<String>() {
                Ok(content) => resources.push(PageResource {
                    url: reference.url,
                    mimetype: reference.mimetype,
                    content,
                }),
                Err(e) => warn!(url = %reference.url, "unreadable resource body: {e}"),
            },
            Err(e) => warn!(url = %reference.url, "failed to fetch resource: {e}"),
        }
    }
    Ok(resources)
}

impl BrowserDriver for ChromeBrowser {
    fn launch(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let mut instance = self.instance.lock().await;
            if instance.is_some() {
                return Ok(());
            }

            let config = self.launch_config()?;
            let (browser, mut handler) = Browser::launch(config)
                .await
                .map_err(|e| Error::Browser(e.to_string()))?;

            // The CDP handler is a stream that must be polled for the
            // browser connection to make progress.
            let handler_task = tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if let Err(e) = event {
                        error!("browser handler error: {e}");
                        break;
                    }
                }
                debug!("browser handler stream ended");
            });

            *instance = Some(ChromeInstance {
                browser,
                handler: handler_task,
            });
            self.connected.store(true, Ordering::Relaxed);
            info!("browser launched");
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let mut guard = self.instance.lock().await;
            if let Some(mut instance) = guard.take() {
                let _ = instance.browser.close().await;
                instance.handler.abort();
                info!("browser closed");
            }
            self.connected.store(false, Ordering::Relaxed);
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn capture_page<'a>(
        &'a self,
        url: &'a str,
        options: &'a CaptureOptions,
    ) -> BoxFuture<'a, Result<CapturedPage, Error>> {
        Box::pin(async move {
            let guard = self.instance.lock().await;
            let instance = guard
                .as_ref()
                .ok_or_else(|| Error::Browser("browser is not connected".into()))?;

            let page = instance
                .browser
                .new_page(url)
                .await
                .map_err(|e| Error::Browser(e.to_string()))?;

            if options.disable_cache {
                page.execute(SetCacheDisabledParams::new(true))
                    .await
                    .map_err(|e| Error::Browser(e.to_string()))?;
            }

            if let Some(wait) = options.wait {
                tokio::time::sleep(wait).await;
            }

            let dom = page
                .content()
                .await
                .map_err(|e| Error::Browser(e.to_string()))?;
            let title = page.get_title().await.unwrap_or_default();
            let final_url = page
                .url()
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| url.to_string());
            let resources =
                collect_resources(&page, &final_url, &options.allowed_hostnames).await?;
            let _ = page.close().await;

            Ok(CapturedPage {
                url: final_url,
                dom,
                title,
                resources,
            })
        })
    }
}

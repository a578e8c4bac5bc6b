//! The top-level build-state machine.
//!
//! A `Percy` instance owns the snapshots and uploads queues, the build
//! record, a browser handle, and optionally a local server handle. `start`,
//! `snapshot`, `flush`, and `stop` return [`Cancelable`] futures so any
//! stage can be interrupted at its next suspension point.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::json;
use tracing::debug;

use crate::browser::{BrowserDriver, ChromeBrowser, ChromeLaunchOptions};
use crate::client::{ApiClient, PercyClient, SnapshotUpload};
use crate::config::Config;
use crate::error::Error;
use crate::logger::{LogGroup, Logger};
use crate::metrics::CoreMetrics;
use crate::queue::Queue;
use crate::snapshot::{
    validate_snapshot_options, BrowserDiscoverer, DefaultSource, ResourceDiscoverer, Snapshot,
    SnapshotInput, SnapshotOptions, SnapshotSource,
};
use crate::task::{CancelHandle, Cancelable, TaskBody};

/// Task id of the build-creation upload. Runs at the highest priority and
/// strictly before any other upload.
pub const BUILD_TASK_ID: &str = "build/create";

fn snapshot_task_id(name: &str) -> String {
    format!("snapshot/{name}")
}

fn upload_task_id(name: &str) -> String {
    format!("upload/{name}")
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// Lifecycle states. `None` (not started) is represented outside the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// The one build record of a run.
#[derive(Debug, Clone, Default)]
pub struct Build {
    pub id: Option<String>,
    pub number: Option<u64>,
    pub url: Option<String>,
    pub error: Option<String>,
    pub failed: bool,
}

/// Local server seam. The server itself (HTTP/WebSocket) lives outside the
/// core; its lifecycle, and static serving for the snapshot `serve` option,
/// are driven from here.
pub trait SnapshotServer: Send + Sync {
    fn listen(&self, port: u16) -> BoxFuture<'_, Result<(), Error>>;

    fn close(&self) -> BoxFuture<'_, Result<(), Error>>;

    fn address(&self) -> Option<String>;

    /// Serve a local directory; subsequent requests against
    /// [`address`](Self::address) resolve into it.
    fn serve_static<'a>(
        &'a self,
        directory: &'a std::path::Path,
    ) -> BoxFuture<'a, Result<(), Error>>;
}

struct PercyInner {
    config: Mutex<Config>,
    ready_state: Mutex<Option<ReadyState>>,
    build: Mutex<Build>,
    snapshots: Queue,
    uploads: Queue,
    client: Arc<dyn ApiClient>,
    browser: Arc<dyn BrowserDriver>,
    server: Option<Arc<dyn SnapshotServer>>,
    source: Arc<dyn SnapshotSource>,
    discoverer: Arc<dyn ResourceDiscoverer>,
    log: LogGroup,
    metrics: CoreMetrics,
}

/// The orchestrator core. Clones share state.
#[derive(Clone)]
pub struct Percy {
    inner: Arc<PercyInner>,
}

/// Assembles a [`Percy`] with collaborator overrides for embedders and
/// tests.
pub struct PercyBuilder {
    config: Config,
    logger: Option<Logger>,
    client: Option<Arc<dyn ApiClient>>,
    browser: Option<Arc<dyn BrowserDriver>>,
    server: Option<Arc<dyn SnapshotServer>>,
    source: Option<Arc<dyn SnapshotSource>>,
    discoverer: Option<Arc<dyn ResourceDiscoverer>>,
}

impl PercyBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            logger: None,
            client: None,
            browser: None,
            server: None,
            source: None,
            discoverer: None,
        }
    }

    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn client(mut self, client: Arc<dyn ApiClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn browser(mut self, browser: Arc<dyn BrowserDriver>) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn server(mut self, server: Arc<dyn SnapshotServer>) -> Self {
        self.server = Some(server);
        self
    }

    pub fn source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn discoverer(mut self, discoverer: Arc<dyn ResourceDiscoverer>) -> Self {
        self.discoverer = Some(discoverer);
        self
    }

    pub fn build(self) -> Percy {
        let mut config = self.config;
        config.normalize();

        let logger = self.logger.unwrap_or_else(|| Logger::shared().clone());
        if let Some(level) = config.loglevel {
            logger.set_level(level);
        }

        let client = self.client.unwrap_or_else(|| {
            let client = PercyClient::new(config.resolve_token());
            Arc::new(client) as Arc<dyn ApiClient>
        });
        if let Some(info) = &config.client_info {
            client.add_client_info(info);
        }
        if let Some(info) = &config.environment_info {
            client.add_environment_info(info);
        }

        let browser = self
            .browser
            .unwrap_or_else(|| Arc::new(ChromeBrowser::new(ChromeLaunchOptions::default())));
        let discoverer = self.discoverer.unwrap_or_else(|| {
            Arc::new(BrowserDiscoverer::new(
                browser.clone(),
                config.discovery.clone(),
            ))
        });
        let source = self.source.unwrap_or_else(|| Arc::new(DefaultSource));

        let concurrency = config.concurrency();
        let snapshots = Queue::new("snapshot", concurrency);
        let uploads = Queue::new("upload", concurrency);
        if config.defer_uploads {
            uploads.stop();
        }

        let server = if config.server { self.server } else { None };

        Percy {
            inner: Arc::new(PercyInner {
                log: logger.group("core"),
                config: Mutex::new(config),
                ready_state: Mutex::new(None),
                build: Mutex::new(Build::default()),
                snapshots,
                uploads,
                client,
                browser,
                server,
                source,
                discoverer,
                metrics: CoreMetrics::new(),
            }),
        }
    }
}

impl Percy {
    pub fn new(config: Config) -> Self {
        PercyBuilder::new(config).build()
    }

    pub fn builder(config: Config) -> PercyBuilder {
        PercyBuilder::new(config)
    }

    /// Build an instance from a JSON configuration file.
    pub async fn from_config_file(path: &std::path::Path) -> Result<Self, Error> {
        Ok(Self::new(Config::load(path).await?))
    }

    pub fn ready_state(&self) -> Option<ReadyState> {
        *self.inner.ready_state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.ready_state() == Some(ReadyState::Running)
    }

    pub fn build_info(&self) -> Build {
        self.inner.build.lock().unwrap().clone()
    }

    pub fn config(&self) -> Config {
        self.inner.config.lock().unwrap().clone()
    }

    pub fn logger(&self) -> &Logger {
        self.inner.log.logger()
    }

    pub fn snapshots_queue(&self) -> &Queue {
        &self.inner.snapshots
    }

    pub fn uploads_queue(&self) -> &Queue {
        &self.inner.uploads
    }

    /// Replace runtime configuration; both queues adopt the new concurrency
    /// together.
    pub fn set_config(&self, mut config: Config) {
        config.normalize();
        let concurrency = config.concurrency();
        self.inner.snapshots.set_concurrency(concurrency);
        self.inner.uploads.set_concurrency(concurrency);
        *self.inner.config.lock().unwrap() = config;
    }

    /// Start the run: create the build, launch the browser, bring up the
    /// server handle. Idempotent once started. Canceling a still-starting
    /// instance reverts it to not-started and cancels the build task.
    pub fn start(&self) -> Cancelable<()> {
        let percy = self.clone();
        let revert = self.clone();
        Cancelable::with_cleanup(
            async move { percy.start_inner().await },
            move || {
                let mut rs = revert.inner.ready_state.lock().unwrap();
                if *rs == Some(ReadyState::Starting) {
                    *rs = None;
                    drop(rs);
                    revert.inner.uploads.cancel(BUILD_TASK_ID);
                }
            },
        )
    }

    async fn start_inner(&self) -> Result<(), Error> {
        {
            let mut rs = self.inner.ready_state.lock().unwrap();
            if rs.is_some() {
                return Ok(());
            }
            *rs = Some(ReadyState::Starting);
        }

        let config = self.config();
        let build_task = self.enqueue_build_task();

        if config.defer_uploads {
            // The queue is stopped; the task waits for an explicit flush.
            // Attach the failure handler that poisons and closes the run.
            if let Some(handle) = build_task {
                let percy = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle.await {
                        if !err.is_canceled() {
                            percy.inner.log.error("Failed to create build");
                            percy.inner.log.error_cause(&err);
                            percy.close();
                        }
                    }
                });
            }
        } else if let Some(handle) = build_task {
            handle.await?;
        }

        let started: Result<(), Error> = async {
            if !config.dry_run && config.browser {
                self.inner.browser.launch().await?;
            }
            if let Some(server) = &self.inner.server {
                server
                    .listen(config.port)
                    .await
                    .map_err(|err| remap_addr_in_use(err, config.port))?;
            }
            Ok(())
        }
        .await;

        if let Err(err) = started {
            if let Some(server) = &self.inner.server {
                let _ = server.close().await;
            }
            let _ = self.inner.browser.close().await;
            *self.inner.ready_state.lock().unwrap() = Some(ReadyState::Stopped);
            return Err(err);
        }

        *self.inner.ready_state.lock().unwrap() = Some(ReadyState::Running);
        self.inner.log.info("Percy has started!");
        Ok(())
    }

    /// Enqueue `build/create` at the highest priority. Its body stops the
    /// uploads queue the moment it is promoted, so nothing else uploads
    /// before the build exists, then resumes the queue on success. Failure
    /// records the build error and leaves the queue stopped.
    fn enqueue_build_task(&self) -> Option<crate::queue::TaskHandle> {
        let percy = self.clone();
        self.inner.uploads.push(
            BUILD_TASK_ID,
            TaskBody::one_shot(move || {
                // The callback is the synchronous segment: it runs at
                // promotion, ahead of any other upload being promoted.
                percy.inner.uploads.stop();
                async move {
                    match percy.inner.client.create_build().await {
                        Ok(info) => {
                            debug!(build = %info.id, number = info.number, "created build");
                            {
                                let mut build = percy.inner.build.lock().unwrap();
                                build.id = Some(info.id);
                                build.number = Some(info.number);
                                build.url = Some(info.url);
                            }
                            percy.inner.uploads.run();
                            Ok(())
                        }
                        Err(err) => {
                            percy.inner.build.lock().unwrap().error = Some(err.to_string());
                            Err(err)
                        }
                    }
                }
            }),
            Some(0),
        )
    }

    /// Take one or more snapshots.
    ///
    /// Accepts a URL string (strings ending `.xml` are sitemaps), full
    /// options, or an array of either (recursed and awaited in parallel).
    /// Resolves once the snapshot tasks are accepted by the queue; uploads
    /// complete later.
    pub fn snapshot(&self, input: impl Into<SnapshotInput>) -> Cancelable<()> {
        let fut = self.snapshot_input(input.into());
        Cancelable::new(fut)
    }

    fn snapshot_input(&self, input: SnapshotInput) -> BoxFuture<'static, Result<(), Error>> {
        let percy = self.clone();
        Box::pin(async move {
            if percy.ready_state() != Some(ReadyState::Running) {
                return Err(Error::Snapshot("Percy is not running".into()));
            }
            if let Some(error) = percy.inner.build.lock().unwrap().error.clone() {
                return Err(Error::Build(error));
            }

            match input {
                SnapshotInput::Many(items) => {
                    let results = futures::future::join_all(
                        items.into_iter().map(|item| percy.snapshot_input(item)),
                    )
                    .await;
                    results.into_iter().collect()
                }
                SnapshotInput::Url(url) => {
                    percy
                        .snapshot_options(SnapshotOptions {
                            url: Some(url),
                            ..Default::default()
                        })
                        .await
                }
                SnapshotInput::Sitemap(sitemap) => {
                    percy
                        .snapshot_options(SnapshotOptions {
                            sitemap: Some(sitemap),
                            ..Default::default()
                        })
                        .await
                }
                SnapshotInput::Options(options) => percy.snapshot_options(options).await,
            }
        })
    }

    async fn snapshot_options(&self, mut options: SnapshotOptions) -> Result<(), Error> {
        if let Some(directory) = options.serve.clone() {
            match &self.inner.server {
                Some(server) => {
                    server
                        .serve_static(std::path::Path::new(&directory))
                        .await?;
                    let address = server.address().ok_or_else(|| {
                        Error::Snapshot("static server has no address".into())
                    })?;
                    self.inner
                        .log
                        .debug(format!("Serving {directory} at {address}"));
                    options.base_url = Some(address);
                }
                None => {
                    // Serving a local directory needs an attached server.
                    self.inner.log.warn(
                        "Ignoring `serve` option: no static server is attached to this instance",
                    );
                }
            }
        }

        let config = self.config();
        let (options, warnings) = validate_snapshot_options(options, &config.snapshot)?;
        for warning in warnings {
            self.inner
                .log
                .warn(format!("Invalid snapshot options: {warning}"));
        }

        let snapshots = self.inner.source.gather(&options).await?;
        for snapshot in snapshots {
            self.take_snapshot(snapshot);
        }
        Ok(())
    }

    /// Schedule discovery for one gathered snapshot.
    ///
    /// Replaces any in-flight snapshot of the same name and drops the
    /// uploads it would have produced. Per-snapshot failures are logged and
    /// abandoned; they never poison the run.
    fn take_snapshot(&self, snapshot: Snapshot) {
        let task_id = snapshot_task_id(&snapshot.name);
        for name in snapshot.upload_names() {
            self.inner.uploads.cancel(&upload_task_id(name));
        }

        let percy = self.clone();
        let name = snapshot.name.clone();
        let dry_run = self.config().dry_run;
        let handle = self.inner.snapshots.push(
            task_id,
            TaskBody::one_shot(move || async move {
                let uploads = if dry_run {
                    // A dry run skips discovery; counts still need payloads.
                    snapshot
                        .upload_names()
                        .into_iter()
                        .map(|name| SnapshotUpload {
                            name: name.to_string(),
                            url: Some(snapshot.url.clone()),
                            widths: snapshot.widths.clone(),
                            resources: Vec::new(),
                            meta: snapshot.meta.clone(),
                        })
                        .collect()
                } else {
                    percy.inner.discoverer.discover(&snapshot).await?
                };
                percy.inner.metrics.record_snapshot(true);
                for payload in uploads {
                    percy.schedule_upload(payload)?;
                }
                Ok(())
            }),
            None,
        );

        let percy = self.clone();
        if let Some(handle) = handle {
            tokio::spawn(async move {
                match handle.await {
                    Ok(()) => {}
                    Err(err) if err.is_canceled() => {
                        percy.inner.metrics.record_canceled();
                        percy.inner.log.debug(format!(
                            "Received a duplicate snapshot, the previous one was canceled: {name}"
                        ));
                    }
                    Err(err) => {
                        percy.inner.metrics.record_snapshot(false);
                        percy
                            .inner
                            .log
                            .error(format!("Encountered an error taking snapshot: {name}"));
                        percy.inner.log.error_cause(&err);
                    }
                }
            });
        }
        self.inner
            .metrics
            .set_queue_depths(self.inner.snapshots.size(), self.inner.uploads.size());
    }

    /// Queue one upload. Rejects when the build is already poisoned. A 422
    /// rejection pointing at the build poisons the run and closes Percy.
    pub fn schedule_upload(&self, payload: SnapshotUpload) -> Result<(), Error> {
        if let Some(error) = self.inner.build.lock().unwrap().error.clone() {
            return Err(Error::Build(error));
        }

        let id = upload_task_id(&payload.name);
        let percy = self.clone();
        let name = payload.name.clone();
        let handle = self.inner.uploads.push(
            id,
            TaskBody::one_shot(move || async move {
                let build_id = percy
                    .inner
                    .build
                    .lock()
                    .unwrap()
                    .id
                    .clone()
                    .ok_or_else(|| Error::Build("build has not been created".into()))?;
                match percy.inner.client.send_snapshot(&build_id, &payload).await {
                    Ok(()) => {
                        percy.inner.metrics.record_upload(true);
                        Ok(())
                    }
                    Err(err) => {
                        if err.status_code() == Some(422)
                            && err.has_error_pointer("/data/attributes/build")
                        {
                            let detail = err
                                .detail_for_pointer("/data/attributes/build")
                                .unwrap_or("build was rejected")
                                .to_string();
                            {
                                let mut build = percy.inner.build.lock().unwrap();
                                build.failed = true;
                                build.error = Some(detail);
                            }
                            percy.close();
                        }
                        Err(err)
                    }
                }
            }),
            None,
        );

        let percy = self.clone();
        if let Some(handle) = handle {
            tokio::spawn(async move {
                match handle.await {
                    Ok(()) | Err(Error::Canceled) => {}
                    Err(err) => {
                        percy.inner.metrics.record_upload(false);
                        percy
                            .inner
                            .log
                            .error(format!("Encountered an error uploading snapshot: {name}"));
                        percy.inner.log.error_cause(&err);
                    }
                }
            });
        }
        Ok(())
    }

    /// Drain both queues with progress reporting. With `close_queues`, the
    /// queues refuse new work while draining. Cancellation reopens them.
    pub fn flush(&self, close_queues: bool) -> Cancelable<()> {
        let percy = self.clone();
        let inner_flush: Arc<Mutex<Option<CancelHandle>>> = Arc::new(Mutex::new(None));
        let slot = inner_flush.clone();
        let reopen = self.clone();
        Cancelable::with_cleanup(
            async move { percy.flush_inner(close_queues, slot).await },
            move || {
                if let Some(handle) = inner_flush.lock().unwrap().take() {
                    handle.cancel();
                }
                reopen.inner.snapshots.open();
                reopen.inner.uploads.open();
            },
        )
    }

    async fn flush_inner(
        &self,
        close_queues: bool,
        slot: Arc<Mutex<Option<CancelHandle>>>,
    ) -> Result<(), Error> {
        // One scheduler tick so synchronous snapshot calls can enqueue.
        tokio::task::yield_now().await;

        if !self.inner.snapshots.is_empty() {
            if close_queues {
                self.inner.snapshots.close(false);
            }
            let log = self.inner.log.clone();
            let flush = self.inner.snapshots.flush_with(move |n| {
                log.progress(&format!("Processing {n} snapshot{}...", plural(n)), false);
            });
            *slot.lock().unwrap() = Some(flush.cancel_handle());
            flush.await?;
        }

        let skip_uploads = self.config().skip_uploads;
        let beyond_build = self.inner.uploads.size()
            > usize::from(self.inner.uploads.has(BUILD_TASK_ID));
        if !skip_uploads && !self.inner.uploads.is_empty() && beyond_build {
            if close_queues {
                self.inner.uploads.close(false);
            }
            let log = self.inner.log.clone();
            let flush = self.inner.uploads.flush_with(move |n| {
                log.progress(&format!("Uploading {n} snapshot{}...", plural(n)), false);
            });
            *slot.lock().unwrap() = Some(flush.cancel_handle());
            flush.await?;
        }

        slot.lock().unwrap().take();
        Ok(())
    }

    /// Stop the run: drain, then close the server and browser, and
    /// finalize (or report) the build. `force` aborts both queues first.
    /// Canceling a stop reverts the state to running.
    pub fn stop(&self, force: bool) -> Cancelable<()> {
        let percy = self.clone();
        let inner_flush: Arc<Mutex<Option<CancelHandle>>> = Arc::new(Mutex::new(None));
        let slot = inner_flush.clone();
        let restore = self.clone();
        Cancelable::with_cleanup(
            async move { percy.stop_inner(force, slot).await },
            move || {
                if let Some(handle) = inner_flush.lock().unwrap().take() {
                    handle.cancel();
                }
                let mut rs = restore.inner.ready_state.lock().unwrap();
                if *rs == Some(ReadyState::Stopping) {
                    *rs = Some(ReadyState::Running);
                }
            },
        )
    }

    async fn stop_inner(
        &self,
        force: bool,
        slot: Arc<Mutex<Option<CancelHandle>>>,
    ) -> Result<(), Error> {
        let state = self.ready_state();
        if state.is_none() {
            if self.inner.browser.is_connected() {
                let _ = self.inner.browser.close().await;
            }
            return Ok(());
        }
        if state == Some(ReadyState::Stopped) {
            return Ok(());
        }
        if force {
            self.close();
        }
        if state == Some(ReadyState::Stopping) {
            return Ok(());
        }
        *self.inner.ready_state.lock().unwrap() = Some(ReadyState::Stopping);

        let flush = self.flush(true);
        *slot.lock().unwrap() = Some(flush.cancel_handle());
        flush.await?;
        slot.lock().unwrap().take();

        let config = self.config();
        if config.dry_run {
            let uploads = self.inner.uploads.size();
            let count = uploads - usize::from(self.inner.uploads.has(BUILD_TASK_ID));
            if count > 0 {
                self.inner
                    .log
                    .info(format!("Found {count} snapshot{}", plural(count)));
            }
        }

        if let Some(server) = &self.inner.server {
            let _ = server.close().await;
        }
        let _ = self.inner.browser.close().await;

        let build = self.build_info();
        if build.failed {
            self.inner.log.warn(format!(
                "Build #{} failed: {}",
                build.number.unwrap_or(0),
                build.url.unwrap_or_default()
            ));
        } else if let (Some(id), None) = (&build.id, &build.error) {
            match self.inner.client.finalize_build(id).await {
                Ok(()) => self.inner.log.info(format!(
                    "Finalized build #{}: {}",
                    build.number.unwrap_or(0),
                    build.url.clone().unwrap_or_default()
                )),
                Err(err) => {
                    self.inner.log.error("Unable to finalize the build");
                    self.inner.log.error_cause(&err);
                }
            }
        } else if let Some(error) = &build.error {
            self.inner.log.error(format!("Build error: {error}"));
        }

        *self.inner.ready_state.lock().unwrap() = Some(ReadyState::Stopped);
        Ok(())
    }

    /// Synchronously abort both queues; no further non-sentinel work is
    /// accepted.
    pub fn close(&self) {
        self.inner.snapshots.close(true);
        self.inner.uploads.close(true);
    }

    /// Retained log entries, serialized for the control surface.
    pub fn query_logs(&self) -> serde_json::Value {
        let entries = self.logger().query(|_| true);
        json!(entries)
    }
}

fn remap_addr_in_use(err: Error, port: u16) -> Error {
    match &err {
        Error::AddrInUse(_) => err,
        Error::Io(message) | Error::Socket(message)
            if message.contains("in use") || message.contains("EADDRINUSE") =>
        {
            Error::AddrInUse(port)
        }
        _ => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_formats() {
        assert_eq!(snapshot_task_id("/home"), "snapshot//home");
        assert_eq!(upload_task_id("/home"), "upload//home");
        assert!(!BUILD_TASK_ID.starts_with("@@/"));
    }

    #[test]
    fn addr_in_use_is_remapped() {
        let err = remap_addr_in_use(Error::Io("address already in use".into()), 5338);
        assert!(matches!(err, Error::AddrInUse(5338)));
        let err = remap_addr_in_use(Error::Browser("boom".into()), 5338);
        assert!(matches!(err, Error::Browser(_)));
    }

    #[test]
    fn builder_defers_uploads_queue() {
        let percy = Percy::new(Config {
            defer_uploads: true,
            ..Default::default()
        });
        assert!(!percy.uploads_queue().is_running());
        assert!(percy.snapshots_queue().is_running());
        assert_eq!(percy.ready_state(), None);
    }

    #[test]
    fn dry_run_implies_skipped_and_deferred_uploads() {
        let percy = Percy::new(Config {
            dry_run: true,
            ..Default::default()
        });
        let config = percy.config();
        assert!(config.skip_uploads);
        assert!(config.defer_uploads);
        assert!(!percy.uploads_queue().is_running());
    }
}

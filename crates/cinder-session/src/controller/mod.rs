//! Session lifecycle controller.
//!
//! # Design
//! - `Stopped -> Starting -> Running -> Stopping -> Stopped`, with transitions
//!   serialized by an async mutex and published through a `watch` channel.
//! - `Running` is entered from the engine's session-started callback, not from
//!   `start()` itself. Bring-up (ip filter, watcher, streaming, restore,
//!   reschedule) runs as a tracked background task from that callback.
//! - Each run owns a fresh [`TaskDispatcher`]; every mutating engine call goes
//!   through it. Read-only queries bypass it.
//! - Bus callbacks and background tasks hold `Weak` references so dropping the
//!   last controller handle tears everything down.

mod callbacks;
mod commands;
mod ingest;
mod queries;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cinder_config::SettingsSource;
use cinder_events::{Event, ListenerBus, ListenerHandle};
use cinder_torrent_core::{
    CompletionSignal, EnvironmentProbe, FileSystemFacade, InfoHash, StreamingEndpoint,
    TaskHandle, TorrentError, TorrentRepository, TransferEngine,
};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::completion::DownloadsCompleted;
use crate::dispatcher::{TaskDispatcher, UnitTicket};
use crate::error::{SessionError, SessionResult};
use crate::magnet::MagnetCoordinator;
use crate::needs_start::DEFAULT_NEEDS_START_INTERVAL;
use crate::watcher::{DirectoryWatcher, WatchOptions};

use self::ingest::ControllerIngest;

/// Default bound on waiting for the in-flight unit during stop.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Engine stopped; commands are ignored.
    #[default]
    Stopped,
    /// Engine start requested, waiting for the session-started callback.
    Starting,
    /// Engine running; commands are accepted.
    Running,
    /// Tear-down in progress.
    Stopping,
}

impl LifecycleState {
    /// Lowercase label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

/// Tunables that are not part of the settings document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    /// How long `stop()` waits for the in-flight dispatcher unit.
    pub shutdown_timeout: Duration,
    /// Polling interval of needs-start observers.
    pub needs_start_interval: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            needs_start_interval: DEFAULT_NEEDS_START_INTERVAL,
        }
    }
}

/// Collaborators the controller drives.
#[derive(Clone)]
pub struct SessionDeps {
    /// Transfer engine.
    pub engine: Arc<dyn TransferEngine>,
    /// Persistent task store.
    pub store: Arc<dyn TorrentRepository>,
    /// Settings document.
    pub settings: Arc<dyn SettingsSource>,
    /// Filesystem access.
    pub fs: Arc<dyn FileSystemFacade>,
    /// File streaming endpoint.
    pub streaming: Arc<dyn StreamingEndpoint>,
    /// Power and network readings.
    pub environment: Arc<dyn EnvironmentProbe>,
    /// All-downloads-complete signal; derived from engine events when `None`.
    pub completion: Option<Arc<dyn CompletionSignal>>,
}

struct ActiveSession {
    dispatcher: Arc<TaskDispatcher>,
    watcher: Option<DirectoryWatcher>,
    background: Vec<JoinHandle<()>>,
}

pub(crate) struct Inner {
    deps: SessionDeps,
    bus: ListenerBus,
    options: ControllerOptions,
    runtime: Handle,
    state: watch::Sender<LifecycleState>,
    transition: tokio::sync::Mutex<()>,
    active: Mutex<Option<ActiveSession>>,
    magnets: MagnetCoordinator,
    completion: Arc<dyn CompletionSignal>,
    listeners: Mutex<Vec<ListenerHandle>>,
    settings_task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    fn set_state(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = previous.as_str(), to = next.as_str(), "session state changed");
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn engine(&self) -> Arc<dyn TransferEngine> {
        Arc::clone(&self.deps.engine)
    }

    fn store(&self) -> Arc<dyn TorrentRepository> {
        Arc::clone(&self.deps.store)
    }

    /// Engine handle for `id` while the session is running.
    fn live_task(&self, id: &InfoHash) -> Option<Arc<dyn TaskHandle>> {
        if self.state() != LifecycleState::Running {
            return None;
        }
        self.deps.engine.task(id)
    }

    fn running_dispatcher(&self) -> Option<Arc<TaskDispatcher>> {
        if self.state() != LifecycleState::Running {
            return None;
        }
        self.lock_active()
            .as_ref()
            .map(|active| Arc::clone(&active.dispatcher))
    }

    /// Queue a unit while running; otherwise the command is a no-op.
    fn submit<F>(&self, operation: &'static str, future: F) -> Option<UnitTicket>
    where
        F: Future<Output = SessionResult<()>> + Send + 'static,
    {
        let Some(dispatcher) = self.running_dispatcher() else {
            debug!(operation, "session not running; command ignored");
            return None;
        };
        match dispatcher.submit(operation, future) {
            Ok(ticket) => Some(ticket),
            Err(err) => {
                debug!(operation, error = %err, "command dropped");
                None
            }
        }
    }

    /// Queue a unit and wait for its result.
    async fn call<T, F>(&self, operation: &'static str, future: F) -> SessionResult<T>
    where
        T: Send + 'static,
        F: Future<Output = SessionResult<T>> + Send + 'static,
    {
        let Some(dispatcher) = self.running_dispatcher() else {
            return Err(SessionError::torrent(
                operation,
                TorrentError::EngineUnavailable { operation },
            ));
        };
        dispatcher.call(operation, future).await
    }

    fn track_background(&self, task: JoinHandle<()>) {
        let mut active = self.lock_active();
        match active.as_mut() {
            Some(session) => session.background.push(task),
            None => task.abort(),
        }
    }

    fn report(&self, message: String) {
        self.bus.publish(&Event::SessionError { message });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let listeners = std::mem::take(
            &mut *self
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in listeners {
            self.bus.unregister(handle);
        }
        if let Some(task) = self
            .settings_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        if let Some(active) = self.lock_active().take() {
            for task in active.background {
                task.abort();
            }
        }
    }
}

/// Long-lived controller over one transfer engine. Cheap to clone.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// Build a stopped controller and attach the engine to a fresh bus.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::RuntimeUnavailable`] outside a tokio runtime.
    pub fn new(deps: SessionDeps, options: ControllerOptions) -> SessionResult<Self> {
        let runtime = Handle::try_current().map_err(|_| SessionError::RuntimeUnavailable)?;
        let bus = ListenerBus::new();
        deps.engine.attach(bus.clone());

        let completion = deps.completion.clone().unwrap_or_else(|| {
            Arc::new(DownloadsCompleted::new(&deps.engine, bus.clone())) as Arc<dyn CompletionSignal>
        });
        let magnets = MagnetCoordinator::new(Arc::clone(&deps.engine), bus.clone());
        let (state, _) = watch::channel(LifecycleState::Stopped);

        let inner = Arc::new(Inner {
            deps,
            bus,
            options,
            runtime,
            state,
            transition: tokio::sync::Mutex::new(()),
            active: Mutex::new(None),
            magnets,
            completion,
            listeners: Mutex::new(Vec::new()),
            settings_task: Mutex::new(None),
        });
        callbacks::install(&inner);
        spawn_settings_watch(&inner);
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Start the engine. No-op unless the controller is stopped.
    ///
    /// Returns once the engine accepted the start request; `Running` follows
    /// from the engine's session-started event.
    ///
    /// # Errors
    ///
    /// Returns the engine failure after resetting the controller to
    /// `Stopped` and publishing a session error.
    pub async fn start(&self) -> SessionResult<()> {
        let _transition = self.inner.transition.lock().await;
        if self.inner.state() != LifecycleState::Stopped {
            debug!(state = self.inner.state().as_str(), "start ignored");
            return Ok(());
        }
        self.inner.set_state(LifecycleState::Starting);

        let settings = self.inner.deps.settings.snapshot();
        let dispatcher = Arc::new(TaskDispatcher::spawn(self.inner.bus.clone()));
        let completion = self.spawn_completion_watch();
        *self.inner.lock_active() = Some(ActiveSession {
            dispatcher,
            watcher: None,
            background: vec![completion],
        });

        info!("starting transfer session");
        if let Err(err) = self.inner.deps.engine.start(settings.session).await {
            error!(error = %err, "transfer engine failed to start");
            let active = self.inner.lock_active().take();
            if let Some(active) = active {
                for task in &active.background {
                    task.abort();
                }
                active
                    .dispatcher
                    .shutdown(self.inner.options.shutdown_timeout)
                    .await;
            }
            self.inner.set_state(LifecycleState::Stopped);
            self.inner.report(format!("engine start failed: {err}"));
            return Err(SessionError::torrent("start", err));
        }
        Ok(())
    }

    /// Tear the session down. No-op unless the controller is running.
    pub async fn stop(&self) {
        let _transition = self.inner.transition.lock().await;
        if self.inner.state() != LifecycleState::Running {
            debug!(state = self.inner.state().as_str(), "stop ignored");
            return;
        }
        self.inner.set_state(LifecycleState::Stopping);
        info!("stopping transfer session");

        let active = self.inner.lock_active().take();
        if let Some(ActiveSession {
            dispatcher,
            watcher,
            background,
        }) = active
        {
            // Bring-up must be gone before its watcher and endpoint are torn down.
            for task in &background {
                task.abort();
            }
            for task in background {
                if let Err(err) = task.await {
                    if !err.is_cancelled() {
                        warn!(error = %err, "session background task failed");
                    }
                }
            }
            if let Some(watcher) = watcher {
                watcher.stop();
            }
            self.inner.deps.streaming.stop().await;
            let report = dispatcher
                .shutdown(self.inner.options.shutdown_timeout)
                .await;
            let cancelled = self.inner.magnets.cancel_all().await;
            debug!(
                discarded = report.discarded,
                timed_out = report.timed_out,
                cancelled_fetches = cancelled,
                "session work cancelled"
            );
        }

        if let Err(err) = self.inner.deps.engine.request_stop().await {
            warn!(error = %err, "engine stop request failed");
        }
        if let Err(err) = self.inner.deps.fs.clean_temp_dir() {
            warn!(error = %err, "temporary storage cleanup failed");
        }
        self.inner.set_state(LifecycleState::Stopped);
        info!("transfer session stopped");
    }

    /// Steps run once the engine reports the session started.
    async fn bring_up(&self) {
        let settings = self.inner.deps.settings.snapshot();

        if settings.ip_filter.enabled {
            if let Some(path) = settings.ip_filter.file.clone() {
                let engine = self.inner.engine();
                self.inner.submit("enable_ip_filter", async move {
                    engine
                        .enable_ip_filter(&path)
                        .await
                        .map_err(|err| SessionError::torrent("enable_ip_filter", err))
                });
            }
        }

        if settings.watch_dir.enabled {
            if let Some(dir) = settings.watch_dir.dir.clone() {
                self.start_watcher(WatchOptions {
                    dir,
                    delete_after_add: settings.watch_dir.delete_file,
                });
            }
        }

        if settings.streaming.enabled {
            let streaming = &settings.streaming;
            match self
                .inner
                .deps
                .streaming
                .start(&streaming.host, streaming.port)
                .await
            {
                Ok(()) if self.inner.state() != LifecycleState::Running => {
                    debug!("session left running during streaming start; endpoint stopped");
                    self.inner.deps.streaming.stop().await;
                    return;
                }
                Ok(()) => info!(host = %streaming.host, port = streaming.port, "streaming endpoint started"),
                Err(err) => {
                    warn!(error = %err, "streaming endpoint failed to start");
                    self.inner
                        .report(format!("streaming endpoint failed to start: {err}"));
                }
            }
        }

        let engine = self.inner.engine();
        self.inner.submit("restore_all", async move {
            engine
                .restore_all()
                .await
                .map_err(|err| SessionError::torrent("restore_all", err))
        });
        self.reschedule();
    }

    fn start_watcher(&self, options: WatchOptions) {
        let target = Arc::new(ControllerIngest::new(&self.inner));
        match DirectoryWatcher::start(options, target) {
            Ok(watcher) => {
                let mut active = self.inner.lock_active();
                match active.as_mut() {
                    Some(session) => session.watcher = Some(watcher),
                    None => watcher.stop(),
                }
            }
            Err(err) => {
                warn!(error = %err, "directory watch failed to start");
                self.inner
                    .report(format!("directory watch failed to start: {err}"));
            }
        }
    }

    fn spawn_completion_watch(&self) -> JoinHandle<()> {
        let mut signal = self.inner.completion.subscribe();
        let inner = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            loop {
                match signal.recv().await {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if !inner.deps.settings.snapshot().shutdown_downloads_complete {
                    continue;
                }
                info!("all downloads complete; stopping session");
                let controller = Self::from_inner(inner);
                // Detached so stop() can abort this watch without aborting itself.
                tokio::spawn(async move { controller.stop().await });
                break;
            }
        })
    }
}

fn spawn_settings_watch(inner: &Arc<Inner>) {
    let mut changes = inner.deps.settings.subscribe();
    let mut applied = changes.borrow_and_update().clone();
    let weak = Arc::downgrade(inner);
    let task = inner.runtime.spawn(async move {
        while changes.changed().await.is_ok() {
            let current = changes.borrow_and_update().clone();
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let controller = SessionController::from_inner(inner);
            if current.session != applied.session {
                controller.apply_session_settings(current.session.clone());
            }
            if current.scheduling != applied.scheduling {
                controller.reschedule();
            }
            applied = current;
        }
    });
    *inner
        .settings_task
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(task);
}

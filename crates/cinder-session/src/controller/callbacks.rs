//! Bus listeners the controller installs on construction.

use std::sync::{Arc, PoisonError, Weak};

use cinder_events::{Event, EventCategory, InfoHash};
use tracing::{debug, info, warn};

use super::{Inner, LifecycleState, SessionController};
use crate::error::SessionError;
use crate::policy::should_pause;

pub(super) fn install(inner: &Arc<Inner>) {
    let bus = &inner.bus;
    let mut handles = Vec::new();

    let weak = Arc::downgrade(inner);
    handles.push(bus.register(EventCategory::SessionStarted, move |_| {
        with_inner(&weak, on_session_started);
    }));

    for category in [EventCategory::TaskAdded, EventCategory::TaskLoaded] {
        let weak = Arc::downgrade(inner);
        handles.push(bus.register(category, move |event| {
            if let Some(id) = event.task_id() {
                with_inner(&weak, |inner| schedule_task(inner, id.clone()));
            }
        }));
    }

    let weak = Arc::downgrade(inner);
    handles.push(bus.register(EventCategory::MetadataLoaded, move |event| {
        // Raw magnet deliveries share this category; only task metadata counts.
        if let Event::MetadataLoaded { id, error } = event {
            with_inner(&weak, |inner| match error {
                None => schedule_task(inner, id.clone()),
                Some(message) => record_error(inner, id.clone(), message.clone()),
            });
        }
    }));

    let weak = Arc::downgrade(inner);
    handles.push(bus.register(EventCategory::TaskFinished, move |event| {
        if let Some(id) = event.task_id() {
            with_inner(&weak, |inner| move_after_download(inner, id.clone()));
        }
    }));

    for category in [
        EventCategory::SessionStopped,
        EventCategory::SessionError,
        EventCategory::NatError,
        EventCategory::IpFilterParsed,
        EventCategory::TaskMoved,
        EventCategory::RestoreError,
    ] {
        handles.push(bus.register(category, log_event));
    }

    inner
        .listeners
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .extend(handles);
}

fn with_inner(weak: &Weak<Inner>, apply: impl FnOnce(&Arc<Inner>)) {
    if let Some(inner) = weak.upgrade() {
        apply(&inner);
    }
}

fn on_session_started(inner: &Arc<Inner>) {
    let entered = inner.state.send_if_modified(|state| {
        if *state == LifecycleState::Starting {
            *state = LifecycleState::Running;
            true
        } else {
            false
        }
    });
    if !entered {
        debug!("session-started event outside start; ignored");
        return;
    }
    info!("transfer session running");

    let controller = SessionController::from_inner(Arc::clone(inner));
    let task = inner
        .runtime
        .spawn(async move { controller.bring_up().await });
    inner.track_background(task);
}

/// Pause a newly known task when the environment calls for it.
fn schedule_task(inner: &Arc<Inner>, id: InfoHash) {
    let engine = inner.engine();
    let settings = Arc::clone(&inner.deps.settings);
    let environment = Arc::clone(&inner.deps.environment);
    inner.submit("schedule_task", async move {
        let policy = settings.snapshot().scheduling;
        if !should_pause(&policy, &environment.readings()) {
            return Ok(());
        }
        let Some(task) = engine.task(&id) else {
            return Ok(());
        };
        if task.is_paused() {
            return Ok(());
        }
        task.pause()
            .map_err(|err| SessionError::torrent("schedule_task", err))?;
        debug!(torrent_id = %id, "task paused by scheduling policy");
        Ok(())
    });
}

fn record_error(inner: &Arc<Inner>, id: InfoHash, message: String) {
    warn!(torrent_id = %id, error = %message, "task metadata failed to load");
    let store = inner.store();
    inner.submit("record_error", async move {
        let Some(mut torrent) = store
            .get(&id)
            .await
            .map_err(|err| SessionError::torrent("record_error", err))?
        else {
            return Ok(());
        };
        torrent.error = Some(message);
        store
            .update(torrent)
            .await
            .map_err(|err| SessionError::torrent("record_error", err))
    });
}

fn move_after_download(inner: &Arc<Inner>, id: InfoHash) {
    let storage = inner.deps.settings.snapshot().storage;
    if !storage.move_after_download {
        return;
    }
    let Some(target) = storage.move_after_download_dir else {
        return;
    };
    let engine = inner.engine();
    let store = inner.store();
    inner.submit("move_after_download", async move {
        let Some(task) = engine.task(&id) else {
            return Ok(());
        };
        let Some(mut torrent) = store
            .get(&id)
            .await
            .map_err(|err| SessionError::torrent("move_after_download", err))?
        else {
            return Ok(());
        };
        if torrent.download_path == target {
            return Ok(());
        }
        task.set_download_path(&target)
            .map_err(|err| SessionError::torrent("move_after_download", err))?;
        info!(torrent_id = %id, path = %target.display(), "finished task moved");
        torrent.download_path = target;
        store
            .update(torrent)
            .await
            .map_err(|err| SessionError::torrent("move_after_download", err))
    });
}

fn log_event(event: &Event) {
    match event {
        Event::SessionStopped => info!("engine session stopped"),
        Event::SessionError { message } => warn!(error = %message, "session error"),
        Event::NatError { message } => warn!(error = %message, "port mapping error"),
        Event::IpFilterParsed { rule_count } => info!(rule_count, "ip filter loaded"),
        Event::TaskMoved { id, success } => {
            if *success {
                debug!(torrent_id = %id, "task storage moved");
            } else {
                warn!(torrent_id = %id, "task storage move failed");
            }
        }
        Event::RestoreError { id } => warn!(torrent_id = %id, "task could not be restored"),
        other => debug!(kind = other.kind(), "event"),
    }
}

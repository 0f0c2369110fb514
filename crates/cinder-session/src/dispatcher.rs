//! Sequential mutation queue in front of the engine.
//!
//! # Design
//! - A single worker task drains an unbounded queue, so submissions from sync
//!   engine callbacks never block.
//! - Tickets are assigned under the same lock that enqueues, which makes
//!   ticket order equal execution order even with concurrent submitters.
//! - Each unit runs in its own spawned task: a failure or panic is logged and
//!   published as a session error, and the worker moves on.
//! - Shutdown closes the queue, discards units that have not started and waits
//!   a bounded time for the in-flight unit before aborting it.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cinder_events::{Event, ListenerBus};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::error::{SessionError, SessionResult};

type UnitFuture = Pin<Box<dyn Future<Output = SessionResult<()>> + Send + 'static>>;

/// Position of a unit in the dispatcher queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitTicket(u64);

impl UnitTicket {
    /// Raw sequence number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// Outcome of [`TaskDispatcher::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Queued units dropped without running.
    pub discarded: usize,
    /// The in-flight unit outlived the timeout and was aborted.
    pub timed_out: bool,
}

struct Unit {
    ticket: UnitTicket,
    operation: &'static str,
    future: UnitFuture,
}

struct Queue {
    sender: Option<mpsc::UnboundedSender<Unit>>,
    next_ticket: u64,
}

/// Single-worker queue that serialises mutating engine calls.
pub struct TaskDispatcher {
    queue: Mutex<Queue>,
    shutdown: watch::Sender<bool>,
    worker: tokio::sync::Mutex<Option<JoinHandle<usize>>>,
    in_flight: Arc<Mutex<Option<AbortHandle>>>,
}

impl TaskDispatcher {
    /// Spawn the worker on the current runtime. Unit failures are published on `bus`.
    #[must_use]
    pub fn spawn(bus: ListenerBus) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let in_flight = Arc::new(Mutex::new(None));
        let worker = tokio::spawn(run_worker(
            receiver,
            shutdown_rx,
            bus,
            Arc::clone(&in_flight),
        ));
        Self {
            queue: Mutex::new(Queue {
                sender: Some(sender),
                next_ticket: 1,
            }),
            shutdown,
            worker: tokio::sync::Mutex::new(Some(worker)),
            in_flight,
        }
    }

    /// Queue `future` behind every previously submitted unit.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DispatcherClosed`] after shutdown.
    pub fn submit<F>(&self, operation: &'static str, future: F) -> SessionResult<UnitTicket>
    where
        F: Future<Output = SessionResult<()>> + Send + 'static,
    {
        let mut queue = self.lock_queue();
        let ticket = UnitTicket(queue.next_ticket);
        let Some(sender) = queue.sender.as_ref() else {
            return Err(SessionError::DispatcherClosed { operation });
        };
        let unit = Unit {
            ticket,
            operation,
            future: Box::pin(future),
        };
        if sender.send(unit).is_err() {
            return Err(SessionError::DispatcherClosed { operation });
        }
        queue.next_ticket += 1;
        drop(queue);
        debug!(ticket = ticket.value(), operation, "task unit queued");
        Ok(ticket)
    }

    /// Queue `future` and wait for its result.
    ///
    /// The result goes to the caller instead of being published on the bus.
    ///
    /// # Errors
    ///
    /// Returns the unit's own error, or [`SessionError::DispatcherClosed`] when
    /// the unit was discarded or could not be queued.
    pub async fn call<T, F>(&self, operation: &'static str, future: F) -> SessionResult<T>
    where
        T: Send + 'static,
        F: Future<Output = SessionResult<T>> + Send + 'static,
    {
        let (respond_to, response) = oneshot::channel();
        self.submit(operation, async move {
            let _ = respond_to.send(future.await);
            Ok(())
        })?;
        response
            .await
            .map_err(|_| SessionError::DispatcherClosed { operation })?
    }

    /// Wait until every unit submitted before this call has run.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DispatcherClosed`] after shutdown.
    pub async fn flush(&self) -> SessionResult<()> {
        self.call("flush", async { Ok(()) }).await
    }

    /// `true` once shutdown has begun.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock_queue().sender.is_none()
    }

    /// Stop accepting work, drop queued units and wait for the in-flight one.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.lock_queue().sender = None;
        self.shutdown.send_replace(true);

        let Some(mut worker) = self.worker.lock().await.take() else {
            return ShutdownReport::default();
        };

        let mut report = ShutdownReport::default();
        match tokio::time::timeout(timeout, &mut worker).await {
            Ok(joined) => report.discarded = joined.unwrap_or_default(),
            Err(_) => {
                report.timed_out = true;
                if let Some(unit) = self.lock_in_flight().take() {
                    unit.abort();
                }
                warn!(?timeout, "in-flight task unit exceeded shutdown timeout; aborted");
                report.discarded = worker.await.unwrap_or_default();
            }
        }
        info!(
            discarded = report.discarded,
            timed_out = report.timed_out,
            "task dispatcher stopped"
        );
        report
    }

    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<AbortHandle>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<Unit>,
    mut shutdown: watch::Receiver<bool>,
    bus: ListenerBus,
    in_flight: Arc<Mutex<Option<AbortHandle>>>,
) -> usize {
    loop {
        let unit = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            unit = receiver.recv() => match unit {
                Some(unit) => unit,
                None => break,
            },
        };
        execute(unit, &bus, &in_flight).await;
    }

    receiver.close();
    let mut discarded = 0;
    while let Ok(unit) = receiver.try_recv() {
        debug!(ticket = unit.ticket.value(), operation = unit.operation, "task unit discarded");
        discarded += 1;
    }
    discarded
}

async fn execute(unit: Unit, bus: &ListenerBus, in_flight: &Mutex<Option<AbortHandle>>) {
    let Unit {
        ticket,
        operation,
        future,
    } = unit;
    let handle = tokio::spawn(future);
    *in_flight.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle.abort_handle());
    let outcome = handle.await;
    in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();

    match outcome {
        Ok(Ok(())) => debug!(ticket = ticket.value(), operation, "task unit completed"),
        Ok(Err(err)) => {
            warn!(ticket = ticket.value(), operation, error = %err, "task unit failed");
            bus.publish(&Event::SessionError {
                message: describe(operation, &err),
            });
        }
        Err(join) if join.is_panic() => {
            error!(ticket = ticket.value(), operation, "task unit panicked");
            bus.publish(&Event::SessionError {
                message: describe(operation, &SessionError::UnitPanicked { operation }),
            });
        }
        Err(_) => debug!(ticket = ticket.value(), operation, "task unit cancelled"),
    }
}

fn describe(operation: &str, err: &SessionError) -> String {
    let mut message = format!("{operation}: {err}");
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_events::EventCategory;
    use cinder_torrent_core::TorrentError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn units_run_in_submission_order_across_submitters() -> anyhow::Result<()> {
        let dispatcher = Arc::new(TaskDispatcher::spawn(ListenerBus::new()));
        let executed = Arc::new(Mutex::new(Vec::new()));

        // Hold the worker until every ticket slot is filled.
        let (release_tx, release_rx) = oneshot::channel::<()>();
        dispatcher.submit("gate", async move {
            let _ = release_rx.await;
            Ok(())
        })?;

        let mut submitters = Vec::new();
        for _ in 0..8 {
            let dispatcher = Arc::clone(&dispatcher);
            let executed = Arc::clone(&executed);
            submitters.push(tokio::spawn(async move {
                let mut tickets = Vec::new();
                for _ in 0..25 {
                    let slot = Arc::new(Mutex::new(None::<UnitTicket>));
                    let recorder = Arc::clone(&executed);
                    let unit_slot = Arc::clone(&slot);
                    let ticket = dispatcher.submit("record", async move {
                        tokio::task::yield_now().await;
                        let ticket = unit_slot.lock().expect("slot").expect("ticket set");
                        recorder.lock().expect("executed").push(ticket);
                        Ok(())
                    })?;
                    *slot.lock().expect("slot") = Some(ticket);
                    tickets.push(ticket);
                }
                Ok::<_, SessionError>(tickets)
            }));
        }
        let mut total = 0;
        for submitter in submitters {
            total += submitter.await??.len();
        }
        let _ = release_tx.send(());
        dispatcher.flush().await?;

        let executed = executed.lock().expect("executed").clone();
        assert_eq!(executed.len(), total);
        let mut sorted = executed.clone();
        sorted.sort();
        assert_eq!(executed, sorted);
        Ok(())
    }

    #[tokio::test]
    async fn failing_and_panicking_units_do_not_stop_the_worker() -> anyhow::Result<()> {
        let bus = ListenerBus::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        bus.register(EventCategory::SessionError, move |event| {
            if let Event::SessionError { message } = event {
                sink.lock().expect("errors").push(message.clone());
            }
        });
        let dispatcher = TaskDispatcher::spawn(bus);

        dispatcher.submit("fails", async {
            Err(SessionError::torrent(
                "pause",
                TorrentError::EngineUnavailable { operation: "pause" },
            ))
        })?;
        dispatcher.submit("panics", async { panic!("unit exploded") })?;
        let value = dispatcher.call("still_alive", async { Ok(7_u8) }).await?;

        assert_eq!(value, 7);
        let errors = errors.lock().expect("errors").clone();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("fails: torrent operation failed"));
        assert!(errors[0].contains("torrent engine unavailable"));
        assert!(errors[1].starts_with("panics:"));
        Ok(())
    }

    #[tokio::test]
    async fn call_returns_unit_errors_to_the_caller() {
        let dispatcher = TaskDispatcher::spawn(ListenerBus::new());
        let result: SessionResult<()> = dispatcher
            .call("add", async {
                Err(SessionError::torrent(
                    "add",
                    TorrentError::decode("bad descriptor"),
                ))
            })
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Torrent {
                source: TorrentError::DecodeFailure { .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn shutdown_discards_queued_units_and_waits_for_in_flight() -> anyhow::Result<()> {
        let dispatcher = TaskDispatcher::spawn(ListenerBus::new());
        let (started_tx, started_rx) = oneshot::channel();
        let finished = Arc::new(AtomicBool::new(false));
        let queued_ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&finished);
        dispatcher.submit("slow", async move {
            let _ = started_tx.send(());
            sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })?;
        for _ in 0..3 {
            let flag = Arc::clone(&queued_ran);
            dispatcher.submit("queued", async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })?;
        }
        started_rx.await?;

        let report = dispatcher.shutdown(Duration::from_secs(2)).await;
        assert!(!report.timed_out);
        assert_eq!(report.discarded, 3);
        assert!(finished.load(Ordering::SeqCst));
        assert!(!queued_ran.load(Ordering::SeqCst));
        assert!(dispatcher.is_closed());
        assert!(matches!(
            dispatcher.submit("late", async { Ok(()) }),
            Err(SessionError::DispatcherClosed { operation: "late" })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_aborts_units_that_outlive_the_timeout() -> anyhow::Result<()> {
        let dispatcher = TaskDispatcher::spawn(ListenerBus::new());
        let (started_tx, started_rx) = oneshot::channel();
        dispatcher.submit("stuck", async move {
            let _ = started_tx.send(());
            sleep(Duration::from_secs(3600)).await;
            Ok(())
        })?;
        started_rx.await?;

        let report = timeout(
            Duration::from_secs(2),
            dispatcher.shutdown(Duration::from_millis(50)),
        )
        .await?;
        assert!(report.timed_out);
        Ok(())
    }

    #[tokio::test]
    async fn pending_call_fails_when_discarded() -> anyhow::Result<()> {
        let dispatcher = Arc::new(TaskDispatcher::spawn(ListenerBus::new()));
        let (started_tx, started_rx) = oneshot::channel();
        dispatcher.submit("slow", async move {
            let _ = started_tx.send(());
            sleep(Duration::from_millis(50)).await;
            Ok(())
        })?;
        started_rx.await?;

        let caller = Arc::clone(&dispatcher);
        let pending = tokio::spawn(async move { caller.call("queued", async { Ok(1_u8) }).await });
        tokio::task::yield_now().await;
        sleep(Duration::from_millis(5)).await;
        dispatcher.shutdown(Duration::from_secs(1)).await;

        let result = pending.await?;
        assert!(matches!(
            result,
            Err(SessionError::DispatcherClosed { operation: "queued" })
        ));
        Ok(())
    }
}

//! `NewTaskCreated` event delivery.
//!
//! ## Delivery guarantees
//! - Events are delivered in emission order.
//! - Within one subscription each task index is delivered at most once: a
//!   reconnect resumes from the block of the last delivered event and drops
//!   anything at or below the last delivered index.
//! - A live-only subscription is pinned to the head block when it first
//!   connects, so tasks emitted while it reconnects are replayed rather than
//!   lost. Tasks already mined at that head are never delivered.
//! - Connection changes are published as [`ConnectionState`] transitions.
//!
//! Nothing is persisted here; resuming across process restarts is the
//! caller's job (see [`crate::journal`]).

use crate::ledger::{Ledger, LedgerError};
use crate::types::{ConnectionState, NewTaskEvent, Task, TaskIndex};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

const EVENT_BUFFER: usize = 64;

/// What to do when the event connection drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive reconnects before giving up (`None` = never give up)
    pub max_reconnects: Option<u32>,
    /// Pause before each reconnect
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_reconnects: Some(5),
            delay: Duration::from_secs(2),
        }
    }
}

impl ReconnectPolicy {
    /// Stop delivering when the connection drops.
    pub fn disabled() -> Self {
        Self {
            max_reconnects: Some(0),
            ..Self::default()
        }
    }

    fn exhausted(&self, reconnects: u32) -> bool {
        self.max_reconnects.is_some_and(|max| reconnects >= max)
    }
}

/// Resume position across reconnects.
#[derive(Debug, Default)]
struct Cursor {
    resume_from: Option<u64>,
    last_index: Option<TaskIndex>,
    /// Events at or below this block predate a live-only subscription
    skip_through: Option<u64>,
}

impl Cursor {
    fn new(from_block: Option<u64>) -> Self {
        Self {
            resume_from: from_block,
            ..Self::default()
        }
    }

    fn start_after(&mut self, head: u64) {
        self.resume_from = Some(head);
        self.skip_through = Some(head);
    }

    fn accept(&mut self, event: &NewTaskEvent) -> bool {
        if self.last_index.is_some_and(|last| event.task_index <= last) {
            return false;
        }
        if let (Some(skip), Some(block)) = (self.skip_through, event.block_number) {
            if block <= skip {
                return false;
            }
        }
        self.last_index = Some(event.task_index);
        if let Some(block) = event.block_number {
            self.resume_from = Some(block);
        }
        true
    }
}

/// Subscribes to new tasks on a ledger.
pub struct EventWatcher {
    ledger: Arc<dyn Ledger>,
    policy: ReconnectPolicy,
}

impl EventWatcher {
    pub fn new(ledger: Arc<dyn Ledger>, policy: ReconnectPolicy) -> Self {
        Self { ledger, policy }
    }

    /// Open a subscription. With `from_block`, past events from that block
    /// are delivered first.
    pub fn subscribe(&self, from_block: Option<u64>) -> Subscription {
        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(
            self.ledger.clone(),
            self.policy.clone(),
            Cursor::new(from_block),
            events_tx,
            state_tx,
            cancel.clone(),
        ));

        Subscription {
            events,
            state,
            _guard: cancel.clone().drop_guard(),
            cancel,
            task,
        }
    }

    /// Invoke `on_task` once per event, in emission order.
    pub fn watch<F>(&self, from_block: Option<u64>, mut on_task: F) -> Unsubscribe
    where
        F: FnMut(TaskIndex, Task) + Send + 'static,
    {
        let mut subscription = self.subscribe(from_block);
        let state = subscription.state();
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    event = subscription.recv() => match event {
                        Some(event) => on_task(event.task_index, event.task),
                        None => break,
                    },
                }
            }
            subscription.unsubscribe().await;
        });

        Unsubscribe {
            state,
            _guard: cancel.clone().drop_guard(),
            cancel,
            task,
        }
    }
}

async fn run(
    ledger: Arc<dyn Ledger>,
    policy: ReconnectPolicy,
    mut cursor: Cursor,
    events: mpsc::Sender<NewTaskEvent>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
) {
    let mut reconnects = 0u32;

    loop {
        let outcome = match anchor(ledger.as_ref(), &mut cursor, &cancel).await {
            None => {
                state.send_replace(ConnectionState::Disconnected);
                return;
            }
            Some(Err(e)) => Err(e),
            Some(Ok(())) => {
                let (sink, mut inbox) = mpsc::channel(EVENT_BUFFER);
                let stream = ledger.stream_new_tasks(cursor.resume_from, sink);
                tokio::pin!(stream);

                state.send_replace(ConnectionState::Connected);
                tracing::info!(
                    from_block = ?cursor.resume_from,
                    "Watching NewTaskCreated on {} ledger",
                    ledger.name()
                );

                let outcome = loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            state.send_replace(ConnectionState::Disconnected);
                            return;
                        }
                        result = &mut stream => break result,
                        Some(event) = inbox.recv() => {
                            if cursor.accept(&event) {
                                reconnects = 0;
                                if !forward(&events, event, &cancel).await {
                                    state.send_replace(ConnectionState::Disconnected);
                                    return;
                                }
                            }
                        }
                    }
                };

                // Whatever the stream queued before it ended
                while let Ok(event) = inbox.try_recv() {
                    if cursor.accept(&event) && !forward(&events, event, &cancel).await {
                        state.send_replace(ConnectionState::Disconnected);
                        return;
                    }
                }
                outcome
            }
        };

        match outcome {
            Ok(()) => {
                state.send_replace(ConnectionState::Disconnected);
                return;
            }
            Err(e) => tracing::warn!("Task event stream dropped: {}", e),
        }

        if policy.exhausted(reconnects) {
            tracing::error!(
                reconnects,
                last_task_index = ?cursor.last_index,
                "Not reconnecting; task delivery stopped"
            );
            state.send_replace(ConnectionState::Disconnected);
            return;
        }

        reconnects += 1;
        state.send_replace(ConnectionState::Reconnecting);
        tracing::info!(
            attempt = reconnects,
            resume_from = ?cursor.resume_from,
            "Reconnecting in {:?}",
            policy.delay
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                state.send_replace(ConnectionState::Disconnected);
                return;
            }
            _ = tokio::time::sleep(policy.delay) => {}
        }
    }
}

/// Give a live-only subscription a resume block. `None` when cancelled.
async fn anchor(
    ledger: &dyn Ledger,
    cursor: &mut Cursor,
    cancel: &CancellationToken,
) -> Option<Result<(), LedgerError>> {
    if cursor.resume_from.is_some() {
        return Some(Ok(()));
    }

    let head = tokio::select! {
        _ = cancel.cancelled() => return None,
        head = ledger.current_block() => head,
    };
    Some(head.map(|head| {
        tracing::debug!("Live subscription starts after block {}", head);
        cursor.start_after(head);
    }))
}

/// Hand one event to the subscriber. `false` once nobody is listening.
async fn forward(
    events: &mpsc::Sender<NewTaskEvent>,
    event: NewTaskEvent,
    cancel: &CancellationToken,
) -> bool {
    tracing::debug!(task_index = event.task_index, block = ?event.block_number, "New task");
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

/// An open task subscription. Dropping it stops delivery.
pub struct Subscription {
    events: mpsc::Receiver<NewTaskEvent>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    _guard: DropGuard,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Next task, or `None` once delivery has stopped for good.
    pub async fn recv(&mut self) -> Option<NewTaskEvent> {
        self.events.recv().await
    }

    /// Connection state updates.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Stop delivery permanently and release the connection.
    pub async fn unsubscribe(self) {
        let Subscription {
            events,
            cancel,
            task,
            ..
        } = self;

        drop(events);
        cancel.cancel();
        if let Err(e) = task.await {
            tracing::warn!("Watcher task ended abnormally: {}", e);
        }
    }
}

/// Handle returned by [`EventWatcher::watch`].
pub struct Unsubscribe {
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    _guard: DropGuard,
    task: JoinHandle<()>,
}

impl Unsubscribe {
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stop invoking the callback and release the connection.
    pub async fn unsubscribe(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("Watch callback task ended abnormally: {}", e);
        }
    }
}

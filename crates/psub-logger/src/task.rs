// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Serialized, timer-capable event queues for bus components.
//!
//! Every component owns an [`ActiveTask`]: a single-consumer queue whose events are
//! handled one at a time by the component's [`Handler`]. Tasks share the tokio
//! runtime, so different components make progress concurrently while each one only
//! ever sees its own events in order.
//!
//! ```text
//!   enqueue ───────────────┐
//!   enqueue_with_delay ─ timer ─┤──> queue ──> Handler::handle (one at a time)
//!   enqueue_repeating ── timer ─┘
//! ```
//!
//! Delayed events return a [`ScheduledEvent`] that cancels them. Stopping a task
//! cancels all of its outstanding delayed events.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::errors::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Stopped,
    Running,
}

/// The behaviour of a component driven by an [`ActiveTask`].
#[async_trait]
pub trait Handler: Send + 'static {
    type Event: Send + 'static;
    type Error: std::fmt::Display + Send;

    fn name(&self) -> &'static str;

    /// Runs once when the task starts, before any queued event.
    async fn started(&mut self, _ctx: &TaskHandle<Self::Event>) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn handle(
        &mut self,
        event: Self::Event,
        ctx: &TaskHandle<Self::Event>,
    ) -> Result<(), Self::Error>;

    /// Runs once after the loop exited, whatever the reason.
    async fn stopped(&mut self) {}
}

enum Envelope<E> {
    Immediate(E),
    Delayed(E, CancellationToken),
}

/// Cancellation handle for a delayed or repeating event.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    token: CancellationToken,
}

impl ScheduledEvent {
    /// Cancels the event. Safe to call any number of times, before or after it fired.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Cheap, cloneable access to a task's queue.
pub struct TaskHandle<E> {
    name: &'static str,
    tx: mpsc::UnboundedSender<Envelope<E>>,
    shutdown: CancellationToken,
    state: watch::Receiver<TaskState>,
}

impl<E> Clone for TaskHandle<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            shutdown: self.shutdown.clone(),
            state: self.state.clone(),
        }
    }
}

impl<E: Send + 'static> TaskHandle<E> {
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Appends an event to the queue, in FIFO order with other immediate events.
    pub fn enqueue(&self, event: E) -> Result<(), TaskError> {
        if self.shutdown.is_cancelled() {
            return Err(TaskError::Stopped(self.name));
        }
        self.tx
            .send(Envelope::Immediate(event))
            .map_err(|_| TaskError::Stopped(self.name))
    }

    /// Queues `event` once `delay` has elapsed.
    pub fn enqueue_with_delay(&self, event: E, delay: Duration) -> ScheduledEvent {
        let token = self.shutdown.child_token();
        let scheduled = ScheduledEvent {
            token: token.clone(),
        };
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = sleep(delay) => {
                    let _ = tx.send(Envelope::Delayed(event, token));
                }
            }
        });
        scheduled
    }

    /// Queues a copy of `event` every `period` until cancelled or the task stops.
    pub fn enqueue_repeating(&self, event: E, period: Duration) -> ScheduledEvent
    where
        E: Clone,
    {
        self.enqueue_repeating_with(move || event.clone(), period)
    }

    /// Queues the event built by `make` every `period`, for events that cannot be cloned.
    pub fn enqueue_repeating_with<F>(&self, make: F, period: Duration) -> ScheduledEvent
    where
        F: Fn() -> E + Send + 'static,
    {
        let token = self.shutdown.child_token();
        let scheduled = ScheduledEvent {
            token: token.clone(),
        };
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if tx.send(Envelope::Delayed(make(), token.clone())).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        scheduled
    }

    /// Asks the task to stop without waiting. From inside a handler the loop exits once
    /// the current event has been handled.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Stops the task and waits until its loop has quiesced.
    ///
    /// Must not be awaited from the task's own handler; use [`TaskHandle::stop`] there.
    pub async fn stop_and_wait(&self) {
        self.shutdown.cancel();
        self.wait_stopped().await;
    }

    /// Waits until the task reaches [`TaskState::Stopped`], whatever stopped it.
    pub async fn wait_stopped(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == TaskState::Stopped).await;
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Marks the task stopped when the loop ends, including by panic.
struct StoppedOnDrop {
    name: &'static str,
    state: watch::Sender<TaskState>,
    finished: bool,
}

impl Drop for StoppedOnDrop {
    fn drop(&mut self) {
        if !self.finished {
            // The loop future was dropped mid-flight: a handler panicked or the
            // runtime shut down under it.
            error!("Task {} ended abnormally, handler panicked or was aborted", self.name);
        }
        self.state.send_replace(TaskState::Stopped);
    }
}

pub struct ActiveTask<H: Handler> {
    handler: H,
    rx: mpsc::UnboundedReceiver<Envelope<H::Event>>,
    handle: TaskHandle<H::Event>,
    state_tx: watch::Sender<TaskState>,
}

impl<H: Handler> ActiveTask<H> {
    pub fn new(handler: H) -> (Self, TaskHandle<H::Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(TaskState::Stopped);
        let handle = TaskHandle {
            name: handler.name(),
            tx,
            shutdown: CancellationToken::new(),
            state: state_rx,
        };
        let task = Self {
            handler,
            rx,
            handle: handle.clone(),
            state_tx,
        };
        (task, handle)
    }

    /// Spawns the processing loop on the current runtime.
    ///
    /// The task reports [`TaskState::Running`] as soon as this returns, so waiting for
    /// it to stop never races the first poll of the loop.
    pub fn start(self) -> JoinHandle<()> {
        self.state_tx.send_replace(TaskState::Running);
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let name = self.handle.name;
        let mut guard = StoppedOnDrop {
            name,
            state: self.state_tx.clone(),
            finished: false,
        };
        self.state_tx.send_replace(TaskState::Running);
        debug!("Task {} started", name);

        if let Err(e) = self.handler.started(&self.handle).await {
            error!("Task {} failed to start: {}", name, e);
        } else {
            self.process().await;
        }

        self.handle.shutdown.cancel();
        self.handler.stopped().await;
        guard.finished = true;
        debug!("Task {} stopped", name);
    }

    async fn process(&mut self) {
        let name = self.handle.name;
        loop {
            let envelope = tokio::select! {
                biased;
                () = self.handle.shutdown.cancelled() => break,
                envelope = self.rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            let event = match envelope {
                Envelope::Immediate(event) => event,
                Envelope::Delayed(event, token) => {
                    if token.is_cancelled() {
                        continue;
                    }
                    event
                }
            };
            if let Err(e) = self.handler.handle(event, &self.handle).await {
                error!("Task {} handler failed, stopping task: {}", name, e);
                break;
            }
        }
    }

    /// Pops the next live event without running the handler.
    #[cfg(test)]
    pub(crate) fn try_next_event(&mut self) -> Option<H::Event> {
        while let Ok(envelope) = self.rx.try_recv() {
            match envelope {
                Envelope::Immediate(event) => return Some(event),
                Envelope::Delayed(event, token) if !token.is_cancelled() => return Some(event),
                Envelope::Delayed(..) => {}
            }
        }
        None
    }

    /// Access to the handler before the task is started.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TCP session to the bus.
//!
//! A [`BusConnection`] is an [`ActiveTask`] handler that owns the socket, the framing
//! state and the subscription list. It walks
//! `Disconnected → Resolving → Connecting → Subscribing → Connected` and falls back to
//! `Disconnected` on any error, scheduling a single reconnect after
//! [`Timings::reconnect_delay`](crate::config::Timings).
//!
//! Reads happen on a companion task that forwards raw bytes into the connection's
//! queue, tagged with a generation number so bytes from a dead socket are ignored.
//! Decoded messages are handed to a [`BusSink`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{encode_frame, Frame, FrameDecoder};
use crate::config::Settings;
use crate::constants::{
    DUMP_TARGET, PUB_ALIVE, PUB_CFG_REQUEST, PUB_DEAD, PUB_HERE, PUB_SHARED_CFG_REQUEST,
    READ_BUFFER_SIZE, TTL_LONGTIME_MS,
};
use crate::errors::TaskError;
use crate::message::Message;
use crate::subject::{known, Subject};
use crate::task::{ActiveTask, Handler, ScheduledEvent, TaskHandle};
use crate::util::hex_dump;

/// Receiver of everything a connection reads from the bus.
pub trait BusSink: Send + Sync + 'static {
    fn deliver(&self, message: Message);

    fn connection_changed(&self, _state: ConnectionState) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Resolving,
    Connecting,
    Subscribing,
    Connected,
}

/// Which configuration documents the process holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigStatus {
    pub have_config: bool,
    pub have_shared: bool,
}

impl ConfigStatus {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.have_config && self.have_shared
    }
}

#[derive(Debug, Clone)]
pub enum BusEvent {
    Connect,
    Publish(Message),
    Subscribe(Subject),
    ConfigStatus(ConfigStatus),
    /// Publishes the departure announcement, then stops the task.
    Shutdown,
    Inbound { generation: u64, bytes: Vec<u8> },
    ReadFailed { generation: u64, error: String },
    Heartbeat,
    ConfigRetry,
}

#[derive(Debug, Clone)]
pub struct BusConnectionConfig {
    /// Task name, used in logs.
    pub name: &'static str,
    pub settings: Arc<Settings>,
    pub subscriptions: Vec<Subject>,
    /// Announce Alive/Here/Dead on this connection.
    pub liveness: bool,
    /// Request missing configuration on this connection.
    pub bootstrap: bool,
}

pub struct BusConnection {
    name: &'static str,
    settings: Arc<Settings>,
    sink: Arc<dyn BusSink>,
    subscriptions: Vec<Subject>,
    liveness: bool,
    bootstrap: bool,
    state: ConnectionState,
    writer: Option<OwnedWriteHalf>,
    reader: Option<CancellationToken>,
    generation: u64,
    decoder: FrameDecoder,
    config_status: ConfigStatus,
    reconnect: Option<ScheduledEvent>,
    heartbeat: Option<ScheduledEvent>,
    config_retry: Option<ScheduledEvent>,
}

/// Replaces a pending scheduled event, cancelling the previous one.
fn rearm(slot: &mut Option<ScheduledEvent>, next: Option<ScheduledEvent>) {
    if let Some(previous) = std::mem::replace(slot, next) {
        previous.cancel();
    }
}

impl BusConnection {
    pub fn new(config: BusConnectionConfig, sink: Arc<dyn BusSink>) -> (ActiveTask<Self>, BusHandle) {
        let connection = Self {
            name: config.name,
            settings: config.settings,
            sink,
            subscriptions: config.subscriptions,
            liveness: config.liveness,
            bootstrap: config.bootstrap,
            state: ConnectionState::Disconnected,
            writer: None,
            reader: None,
            generation: 0,
            decoder: FrameDecoder::new(),
            config_status: ConfigStatus::default(),
            reconnect: None,
            heartbeat: None,
            config_retry: None,
        };
        let (task, handle) = ActiveTask::new(connection);
        (task, BusHandle { task: handle })
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("{}: {:?} -> {:?}", self.name, self.state, state);
            self.state = state;
            self.sink.connection_changed(state);
        }
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Drops the socket and every timer tied to it.
    fn teardown(&mut self) {
        rearm(&mut self.heartbeat, None);
        rearm(&mut self.config_retry, None);
        if let Some(reader) = self.reader.take() {
            reader.cancel();
        }
        self.writer = None;
        self.decoder.reset();
        self.generation += 1;
    }

    fn fail(&mut self, ctx: &TaskHandle<BusEvent>, reason: &str) {
        warn!(
            "{}: bus connection to {} failed: {}",
            self.name,
            self.settings.bus_address(),
            reason
        );
        self.teardown();
        self.set_state(ConnectionState::Disconnected);
        if ctx.is_stopping() {
            return;
        }
        let delay = self.settings.timings.reconnect_delay;
        rearm(
            &mut self.reconnect,
            Some(ctx.enqueue_with_delay(BusEvent::Connect, delay)),
        );
    }

    async fn connect(&mut self, ctx: &TaskHandle<BusEvent>) {
        rearm(&mut self.reconnect, None);
        if self.is_connected() {
            debug!("{}: already connected", self.name);
            return;
        }
        self.teardown();

        let address = self.settings.bus_address();
        self.set_state(ConnectionState::Resolving);
        let addresses: Vec<SocketAddr> = match lookup_host(address.as_str()).await {
            Ok(found) => found.collect(),
            Err(e) => return self.fail(ctx, &format!("cannot resolve address: {e}")),
        };
        if addresses.is_empty() {
            return self.fail(ctx, "address resolved to nothing");
        }

        self.set_state(ConnectionState::Connecting);
        let stream = match TcpStream::connect(addresses.as_slice()).await {
            Ok(stream) => stream,
            Err(e) => return self.fail(ctx, &format!("cannot connect: {e}")),
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("{}: cannot disable Nagle: {}", self.name, e);
        }
        let (read_half, write_half) = stream.into_split();
        self.writer = Some(write_half);

        self.set_state(ConnectionState::Subscribing);
        for subject in self.subscriptions.clone() {
            if let Err(e) = self.send(&Frame::Subscribe(subject)).await {
                return self.fail(ctx, &format!("cannot subscribe: {e}"));
            }
        }
        if self.liveness {
            let alive = Message::new(known(PUB_ALIVE), self.settings.version.as_bytes())
                .with_ttl(TTL_LONGTIME_MS);
            if let Err(e) = self.send(&Frame::Message(alive)).await {
                return self.fail(ctx, &format!("cannot announce: {e}"));
            }
            let period = self.settings.timings.heartbeat_interval;
            rearm(
                &mut self.heartbeat,
                Some(ctx.enqueue_repeating(BusEvent::Heartbeat, period)),
            );
        }

        info!("{}: connected to bus at {}", self.name, address);
        self.spawn_reader(read_half, ctx);
        self.set_state(ConnectionState::Connected);
        self.arm_config_retry(ctx);
    }

    fn spawn_reader(&mut self, mut read_half: OwnedReadHalf, ctx: &TaskHandle<BusEvent>) {
        let token = CancellationToken::new();
        self.reader = Some(token.clone());
        let generation = self.generation;
        let queue = ctx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                let read = tokio::select! {
                    () = token.cancelled() => break,
                    read = read_half.read(&mut buf) => read,
                };
                let (event, last) = match read {
                    Ok(0) => (
                        BusEvent::ReadFailed {
                            generation,
                            error: "connection closed by peer".to_string(),
                        },
                        true,
                    ),
                    Ok(n) => (
                        BusEvent::Inbound {
                            generation,
                            bytes: buf[..n].to_vec(),
                        },
                        false,
                    ),
                    Err(e) => (
                        BusEvent::ReadFailed {
                            generation,
                            error: e.to_string(),
                        },
                        true,
                    ),
                };
                if queue.enqueue(event).is_err() || last {
                    break;
                }
            }
        });
    }

    /// Writes one frame. Frames that cannot be encoded are dropped with a warning.
    async fn send(&mut self, frame: &Frame) -> std::io::Result<()> {
        let bytes = match encode_frame(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("{}: dropping frame that cannot be encoded: {}", self.name, e);
                return Ok(());
            }
        };
        match self.writer.as_mut() {
            Some(writer) => writer.write_all(&bytes).await,
            None => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }

    async fn publish(&mut self, message: Message, ctx: &TaskHandle<BusEvent>) {
        if !self.is_connected() {
            debug!(
                "{}: not connected, dropping message on {}",
                self.name, message.subject
            );
            return;
        }
        if let Err(e) = self.send(&Frame::Message(message)).await {
            self.fail(ctx, &format!("cannot write: {e}"));
        }
    }

    fn on_inbound(&mut self, bytes: &[u8]) {
        self.decoder.extend(bytes);
        loop {
            match self.decoder.next_frame() {
                Ok(Some(Frame::Message(message))) => self.sink.deliver(message),
                Ok(Some(Frame::Unknown(op, _))) => {
                    debug!("{}: ignoring frame with unknown op {:#04x}", self.name, op);
                }
                Ok(Some(other)) => debug!("{}: ignoring {:?}", self.name, other),
                Ok(None) => break,
                Err(e) => {
                    let discarded = self.decoder.take_discarded();
                    warn!(
                        "{}: discarding {} bytes of undecodable bus data: {}",
                        self.name,
                        discarded.len(),
                        e
                    );
                    trace!(target: DUMP_TARGET, "{}", hex_dump(&discarded));
                    break;
                }
            }
        }
    }

    fn arm_config_retry(&mut self, ctx: &TaskHandle<BusEvent>) {
        if !self.bootstrap || self.config_status.is_complete() || !self.is_connected() {
            rearm(&mut self.config_retry, None);
            return;
        }
        let delay = self.settings.timings.config_retry_interval;
        rearm(
            &mut self.config_retry,
            Some(ctx.enqueue_with_delay(BusEvent::ConfigRetry, delay)),
        );
    }

    async fn request_config(&mut self, ctx: &TaskHandle<BusEvent>) {
        if !self.config_status.have_config {
            debug!("{}: requesting logger configuration", self.name);
            let request = Message::new(known(PUB_CFG_REQUEST), self.settings.version.as_bytes());
            self.publish(request, ctx).await;
        }
        if !self.config_status.have_shared {
            debug!("{}: requesting shared configuration", self.name);
            self.publish(Message::new(known(PUB_SHARED_CFG_REQUEST), "0"), ctx)
                .await;
        }
        self.arm_config_retry(ctx);
    }
}

#[async_trait]
impl Handler for BusConnection {
    type Event = BusEvent;
    type Error = Infallible;

    fn name(&self) -> &'static str {
        self.name
    }

    async fn started(&mut self, ctx: &TaskHandle<BusEvent>) -> Result<(), Infallible> {
        self.connect(ctx).await;
        Ok(())
    }

    async fn handle(&mut self, event: BusEvent, ctx: &TaskHandle<BusEvent>) -> Result<(), Infallible> {
        match event {
            BusEvent::Connect => self.connect(ctx).await,
            BusEvent::Publish(message) => self.publish(message, ctx).await,
            BusEvent::Subscribe(subject) => {
                if self.subscriptions.contains(&subject) {
                    return Ok(());
                }
                self.subscriptions.push(subject.clone());
                if self.is_connected() {
                    if let Err(e) = self.send(&Frame::Subscribe(subject)).await {
                        self.fail(ctx, &format!("cannot subscribe: {e}"));
                    }
                }
            }
            BusEvent::ConfigStatus(status) => {
                self.config_status = status;
                if status.is_complete() {
                    rearm(&mut self.config_retry, None);
                } else if self.config_retry.is_none() {
                    self.arm_config_retry(ctx);
                }
            }
            BusEvent::Shutdown => {
                if self.liveness && self.is_connected() {
                    let dead = Message::new(known(PUB_DEAD), Vec::new()).with_ttl(TTL_LONGTIME_MS);
                    if let Err(e) = self.send(&Frame::Message(dead)).await {
                        debug!("{}: cannot announce departure: {}", self.name, e);
                    }
                }
                ctx.stop();
            }
            BusEvent::Inbound { generation, bytes } => {
                if generation == self.generation {
                    self.on_inbound(&bytes);
                } else {
                    trace!("{}: ignoring {} bytes from a closed socket", self.name, bytes.len());
                }
            }
            BusEvent::ReadFailed { generation, error } => {
                if generation == self.generation {
                    self.fail(ctx, &error);
                }
            }
            BusEvent::Heartbeat => {
                self.publish(Message::new(known(PUB_HERE), Vec::new()), ctx)
                    .await;
            }
            BusEvent::ConfigRetry => {
                self.config_retry = None;
                if self.is_connected() && !self.config_status.is_complete() {
                    self.request_config(ctx).await;
                }
            }
        }
        Ok(())
    }

    async fn stopped(&mut self) {
        rearm(&mut self.reconnect, None);
        self.teardown();
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Cloneable access to a running [`BusConnection`].
#[derive(Clone)]
pub struct BusHandle {
    task: TaskHandle<BusEvent>,
}

impl BusHandle {
    pub fn publish(&self, message: Message) -> Result<(), TaskError> {
        self.task.enqueue(BusEvent::Publish(message))
    }

    pub fn subscribe(&self, subject: Subject) -> Result<(), TaskError> {
        self.task.enqueue(BusEvent::Subscribe(subject))
    }

    pub fn set_config_status(&self, status: ConfigStatus) -> Result<(), TaskError> {
        self.task.enqueue(BusEvent::ConfigStatus(status))
    }

    /// Announces departure if liveness is enabled, then stops the connection.
    pub async fn shutdown(&self) {
        if self.task.enqueue(BusEvent::Shutdown).is_err() {
            return;
        }
        self.task.wait_stopped().await;
    }
}

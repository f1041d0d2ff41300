// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wires the logger together.
//!
//! The dispatcher owns the control connection and the configuration lifecycle. Once
//! the logger configuration arrives it starts the capture sink, the capture
//! connection and the uploader, then routes every control message either to a
//! built-in command or through the configured triggers.

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::capture::{CaptureHandle, CaptureSink};
use crate::config::{LoggerConfig, Settings, SharedConfig, UploadConfig};
use crate::connection::{
    BusConnection, BusConnectionConfig, BusHandle, BusSink, ConfigStatus, ConnectionState,
};
use crate::constants::{
    PUB_CONFIG_ERROR, PUB_SHARED_CONFIG_ERROR, SUB_CFG, SUB_FLUSH_FILE, SUB_NEW_FILE,
    SUB_SHARED_CFG, TTL_STATUS_MS,
};
use crate::errors::ConfigError;
use crate::message::Message;
use crate::subject::{known, WILDCARD};
use crate::task::{ActiveTask, Handler, TaskHandle};
use crate::trigger::TriggerSet;
use crate::upload::{RemoteStore, Uploader, UploaderHandle};

/// Builds the remote store once the upload section is known.
pub type StoreFactory = Arc<dyn Fn(&UploadConfig) -> Arc<dyn RemoteStore> + Send + Sync>;

#[derive(Debug)]
pub enum DispatchEvent {
    Message(Message),
    Connection(ConnectionState),
    Shutdown,
}

/// Components started by the first valid configuration.
struct Capture {
    sink: CaptureHandle,
    connection: BusHandle,
    uploader: Option<UploaderHandle>,
}

pub struct Dispatcher {
    settings: Arc<Settings>,
    store_factory: StoreFactory,
    control: Option<BusHandle>,
    config: Option<Arc<LoggerConfig>>,
    have_shared: bool,
    shared: SharedConfig,
    triggers: TriggerSet,
    capture: Option<Capture>,
}

fn control_subscriptions() -> Vec<crate::subject::Subject> {
    [SUB_CFG, SUB_SHARED_CFG, SUB_NEW_FILE, SUB_FLUSH_FILE]
        .into_iter()
        .map(known)
        .collect()
}

impl Dispatcher {
    fn new(settings: Arc<Settings>, store_factory: StoreFactory) -> Self {
        Self {
            settings,
            store_factory,
            control: None,
            config: None,
            have_shared: false,
            shared: SharedConfig::default(),
            triggers: TriggerSet::default(),
            capture: None,
        }
    }

    /// Starts the dispatcher and its control connection.
    pub fn start(settings: Arc<Settings>, store_factory: StoreFactory) -> DispatcherHandle {
        let (mut task, queue) = ActiveTask::new(Self::new(Arc::clone(&settings), store_factory));
        let (control_task, control) = BusConnection::new(
            BusConnectionConfig {
                name: "control-connection",
                settings,
                subscriptions: control_subscriptions(),
                liveness: true,
                bootstrap: true,
            },
            Arc::new(DispatchSink {
                queue: queue.clone(),
            }),
        );
        task.handler_mut().control = Some(control.clone());
        control_task.start();
        task.start();
        DispatcherHandle { task: queue }
    }

    fn status(&self) -> ConfigStatus {
        ConfigStatus {
            have_config: self.config.is_some(),
            have_shared: self.have_shared,
        }
    }

    fn push_status(&self) {
        if let Some(control) = &self.control {
            if let Err(e) = control.set_config_status(self.status()) {
                debug!("Cannot update configuration status: {}", e);
            }
        }
    }

    fn publish(&self, message: Message) {
        if let Some(control) = &self.control {
            if let Err(e) = control.publish(message) {
                debug!("Cannot publish: {}", e);
            }
        }
    }

    fn on_config(&mut self, message: &Message) {
        if self.config.is_some() {
            debug!("Already configured, ignoring configuration update");
            return;
        }
        let parsed = LoggerConfig::from_xml(&message.payload_lossy()).and_then(|config| {
            let triggers = TriggerSet::from_config(&config)?;
            Ok::<_, ConfigError>((config, triggers))
        });
        let (config, triggers) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Invalid logger configuration: {}", e);
                self.publish(Message::new(known(PUB_CONFIG_ERROR), e.to_string()));
                return;
            }
        };

        info!(
            "Logger configuration received, capturing to {} as {}*",
            config.log_path.display(),
            config.file_prefix()
        );
        let config = Arc::new(config);
        if let Some(control) = &self.control {
            for subject in triggers.subjects() {
                if let Err(e) = control.subscribe(subject.clone()) {
                    debug!("Cannot subscribe to {}: {}", subject, e);
                }
            }
        }
        if config.upload.is_none() {
            self.have_shared = true;
        }
        self.capture = Some(self.start_capture(&config));
        self.triggers = triggers;
        self.config = Some(config);
        self.push_status();
    }

    fn start_capture(&self, config: &Arc<LoggerConfig>) -> Capture {
        let (sink_task, sink) = CaptureSink::new(Arc::clone(config));
        let (connection_task, connection) = BusConnection::new(
            BusConnectionConfig {
                name: "capture-connection",
                settings: Arc::clone(&self.settings),
                subscriptions: vec![known(WILDCARD)],
                liveness: false,
                bootstrap: false,
            },
            Arc::new(sink.clone()),
        );
        let uploader = config.upload.as_ref().map(|upload| {
            let (uploader_task, uploader) = Uploader::new(
                Arc::clone(config),
                sink.clone(),
                (self.store_factory)(upload),
                self.settings.timings.upload_retry_delay,
            );
            uploader_task.start();
            uploader
        });
        sink_task.start();
        connection_task.start();
        Capture {
            sink,
            connection,
            uploader,
        }
    }

    fn on_shared_config(&mut self, message: &Message) {
        match SharedConfig::from_xml(&message.payload_lossy()) {
            Ok(shared) => {
                info!("Shared configuration received");
                self.shared = shared;
                self.have_shared = true;
                self.push_status();
            }
            Err(e) => {
                warn!("Invalid shared configuration: {}", e);
                self.publish(
                    Message::new(known(PUB_SHARED_CONFIG_ERROR), e.to_string())
                        .with_ttl(TTL_STATUS_MS),
                );
            }
        }
    }

    fn on_trigger(&self, message: &Message) {
        let Some(capture) = &self.capture else {
            return;
        };
        let actions = self.triggers.evaluate(message);
        if !actions.any() {
            return;
        }
        if actions.upload {
            if let Some(uploader) = &capture.uploader {
                info!("Upload triggered by {}", message.subject);
                if let Err(e) = uploader.run(self.shared.remote_prefix()) {
                    warn!("Cannot start upload: {}", e);
                }
            }
        }
        if actions.flush {
            debug!("Flush triggered by {}", message.subject);
            if let Err(e) = capture.sink.flush() {
                warn!("Cannot flush capture file: {}", e);
            }
        }
        if actions.new_file {
            debug!("New file triggered by {}", message.subject);
            if let Err(e) = capture.sink.rotate() {
                warn!("Cannot rotate capture file: {}", e);
            }
        }
    }

    fn on_message(&mut self, message: &Message) {
        let subject = message.subject.to_string();
        match subject.as_str() {
            SUB_CFG => self.on_config(message),
            SUB_SHARED_CFG => self.on_shared_config(message),
            SUB_NEW_FILE => {
                if let Some(capture) = &self.capture {
                    if let Err(e) = capture.sink.rotate() {
                        warn!("Cannot rotate capture file: {}", e);
                    }
                }
            }
            SUB_FLUSH_FILE => {
                if let Some(capture) = &self.capture {
                    if let Err(e) = capture.sink.flush() {
                        warn!("Cannot flush capture file: {}", e);
                    }
                }
            }
            _ => self.on_trigger(message),
        }
    }

    async fn shutdown(&mut self) {
        if let Some(capture) = self.capture.take() {
            if let Some(uploader) = capture.uploader {
                uploader.shutdown().await;
            }
            capture.connection.shutdown().await;
            capture.sink.shutdown().await;
        }
        if let Some(control) = self.control.take() {
            control.shutdown().await;
        }
        info!("Logger stopped");
    }
}

#[async_trait]
impl Handler for Dispatcher {
    type Event = DispatchEvent;
    type Error = Infallible;

    fn name(&self) -> &'static str {
        "dispatcher"
    }

    async fn handle(
        &mut self,
        event: DispatchEvent,
        ctx: &TaskHandle<DispatchEvent>,
    ) -> Result<(), Infallible> {
        match event {
            DispatchEvent::Message(message) => self.on_message(&message),
            DispatchEvent::Connection(ConnectionState::Connected) => {
                debug!("Control connection is up, {:?}", self.status());
            }
            DispatchEvent::Connection(_) => {}
            DispatchEvent::Shutdown => {
                self.shutdown().await;
                ctx.stop();
            }
        }
        Ok(())
    }
}

/// Forwards control-connection traffic into the dispatcher queue.
struct DispatchSink {
    queue: TaskHandle<DispatchEvent>,
}

impl BusSink for DispatchSink {
    fn deliver(&self, message: Message) {
        if let Err(e) = self.queue.enqueue(DispatchEvent::Message(message)) {
            debug!("Dropping control message: {}", e);
        }
    }

    fn connection_changed(&self, state: ConnectionState) {
        let _ = self.queue.enqueue(DispatchEvent::Connection(state));
    }
}

#[derive(Clone)]
pub struct DispatcherHandle {
    task: TaskHandle<DispatchEvent>,
}

impl DispatcherHandle {
    /// Stops every component, announcing departure on the bus first.
    pub async fn shutdown(&self) {
        if self.task.enqueue(DispatchEvent::Shutdown).is_ok() {
            self.task.wait_stopped().await;
        }
    }

    /// Resolves once the dispatcher has stopped for any reason.
    pub async fn stopped(&self) {
        self.task.wait_stopped().await;
    }
}

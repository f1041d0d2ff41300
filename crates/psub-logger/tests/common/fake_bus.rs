// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process bus broker speaking the real wire protocol.
//!
//! Every client gets its subscriptions recorded; published messages are kept for
//! inspection and routed to every other client with a matching subscription.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use psub_logger::codec::{encode, Frame, FrameDecoder};
use psub_logger::message::Message;
use psub_logger::subject::Subject;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Client {
    id: usize,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    subscriptions: Vec<Subject>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    next_id: usize,
    clients: Vec<Client>,
    published: Vec<Message>,
    connections: usize,
}

impl State {
    fn route(&self, message: &Message, from: Option<usize>) {
        let Ok(bytes) = encode(message) else {
            return;
        };
        for client in &self.clients {
            if Some(client.id) == from {
                continue;
            }
            if client.subscriptions.iter().any(|s| s.matches(&message.subject)) {
                let _ = client.outbox.send(bytes.clone());
            }
        }
    }
}

#[derive(Clone)]
pub struct FakeBus {
    pub addr: SocketAddr,
    state: Arc<Mutex<State>>,
}

impl FakeBus {
    /// Start a broker on a random local port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind fake bus");
        let addr = listener.local_addr().expect("Failed to get local addr");
        let state = Arc::new(Mutex::new(State::default()));

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let (mut read_half, mut write_half) = stream.into_split();
                let (outbox, mut inbox) = mpsc::unbounded_channel::<Vec<u8>>();

                let id = {
                    let mut state = accept_state.lock().unwrap();
                    state.next_id += 1;
                    state.connections += 1;
                    let id = state.next_id;
                    state.clients.push(Client {
                        id,
                        outbox,
                        subscriptions: Vec::new(),
                        tasks: Vec::new(),
                    });
                    id
                };

                let writer = tokio::spawn(async move {
                    while let Some(bytes) = inbox.recv().await {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                });

                let reader_state = accept_state.clone();
                let reader = tokio::spawn(async move {
                    let mut decoder = FrameDecoder::new();
                    let mut buf = vec![0u8; 8192];
                    loop {
                        let n = match read_half.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        decoder.extend(&buf[..n]);
                        while let Ok(Some(frame)) = decoder.next_frame() {
                            let mut state = reader_state.lock().unwrap();
                            match frame {
                                Frame::Subscribe(subject) => {
                                    if let Some(client) =
                                        state.clients.iter_mut().find(|c| c.id == id)
                                    {
                                        client.subscriptions.push(subject);
                                    }
                                }
                                Frame::Unsubscribe(subject) => {
                                    if let Some(client) =
                                        state.clients.iter_mut().find(|c| c.id == id)
                                    {
                                        client.subscriptions.retain(|s| *s != subject);
                                    }
                                }
                                Frame::Message(message) => {
                                    state.route(&message, Some(id));
                                    state.published.push(message);
                                }
                                Frame::Unknown(..) => {}
                            }
                        }
                    }
                    reader_state.lock().unwrap().clients.retain(|c| c.id != id);
                });

                let mut state = accept_state.lock().unwrap();
                match state.clients.iter_mut().find(|c| c.id == id) {
                    Some(client) => client.tasks = vec![writer, reader],
                    None => {
                        writer.abort();
                        reader.abort();
                    }
                }
                drop(state);
            }
        });

        Self { addr, state }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Publish a message as if another bus participant had sent it
    pub fn publish(&self, subject: &str, payload: impl Into<Vec<u8>>) {
        let message = Message::new(Subject::parse(subject).unwrap(), payload);
        self.state.lock().unwrap().route(&message, None);
    }

    /// Every message the logger published, in arrival order
    pub fn published(&self) -> Vec<Message> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn published_on(&self, subject: &str) -> Vec<Message> {
        self.published()
            .into_iter()
            .filter(|m| m.subject.to_string() == subject)
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .clients
            .iter()
            .flat_map(|c| c.subscriptions.iter().map(ToString::to_string))
            .collect()
    }

    pub fn is_subscribed(&self, subject: &str) -> bool {
        self.subscriptions().iter().any(|s| s == subject)
    }

    /// Number of connections accepted so far
    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    /// Drop every client socket, as a bus restart would
    pub fn disconnect_all(&self) {
        let clients = std::mem::take(&mut self.state.lock().unwrap().clients);
        for client in clients {
            for task in client.tasks {
                task.abort();
            }
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_channel::Sender;
use log::debug;

use crate::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::platform::runtime;
use crate::remote::backoff::ExponentialBackoff;
use crate::remote::datastore::{Connection, StreamHandle, StreamKind, TokenProviderArc};

/// Callback through which stream tasks and timers report back to the owner of the stream.
pub type StreamEventSink = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Something that happened on a stream's I/O task or timer.
///
/// Every event carries the generation of the attempt that produced it; the stream drops
/// events from earlier generations.
#[derive(Debug)]
pub enum StreamEvent {
    Opened {
        kind: StreamKind,
        generation: u64,
        sender: Sender<Vec<u8>>,
    },
    Message {
        kind: StreamKind,
        generation: u64,
        payload: Vec<u8>,
    },
    Closed {
        kind: StreamKind,
        generation: u64,
        error: Option<FirestoreError>,
    },
    BackoffElapsed {
        kind: StreamKind,
        generation: u64,
    },
    IdleTimeout {
        kind: StreamKind,
        generation: u64,
        idle_token: u64,
    },
    /// The online-state timer armed for `token` fired.
    OnlineStateTimeout { token: u64 },
    /// Time to check whether local storage is usable again.
    StorageRetry { attempt: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Not started, or stopped cleanly.
    Initial,
    /// Fetching a token and opening the connection.
    Starting,
    Open,
    /// Closed with an error; the next start waits for the backoff.
    Error,
    /// Waiting for the backoff timer before reopening.
    Backoff,
}

/// Lifecycle of one long-lived stream: opening, backing off after failures, idling out.
///
/// All I/O happens on detached tasks that post [`StreamEvent`]s to the sink. The owner routes
/// those events back into the `handle_*` methods, which return whether the event belongs to
/// the current attempt.
pub struct PersistentStream {
    kind: StreamKind,
    state: StreamState,
    generation: u64,
    outbound: Option<Sender<Vec<u8>>>,
    backoff: ExponentialBackoff,
    idle_timeout: Duration,
    idle_token: Option<u64>,
    next_idle_token: u64,
    /// A message was received on the current attempt.
    healthy: bool,
    connection: Arc<dyn Connection>,
    token_provider: TokenProviderArc,
    sink: StreamEventSink,
}

impl PersistentStream {
    pub fn new(
        kind: StreamKind,
        connection: Arc<dyn Connection>,
        token_provider: TokenProviderArc,
        backoff: ExponentialBackoff,
        idle_timeout: Duration,
        sink: StreamEventSink,
    ) -> Self {
        Self {
            kind,
            state: StreamState::Initial,
            generation: 0,
            outbound: None,
            backoff,
            idle_timeout,
            idle_token: None,
            next_idle_token: 0,
            healthy: false,
            connection,
            token_provider,
            sink,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Starting, open, or waiting to reopen.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state,
            StreamState::Starting | StreamState::Open | StreamState::Backoff
        )
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    pub fn start(&mut self) {
        match self.state {
            StreamState::Error => self.schedule_backoff(),
            StreamState::Initial => self.open(),
            _ => debug!("{} stream already started", self.kind.label()),
        }
    }

    /// Closes the stream without an error. Pending events of the current attempt become stale.
    pub fn stop(&mut self) {
        if self.is_started() {
            self.close(StreamState::Initial, None);
        }
    }

    /// The next start after an error opens immediately.
    pub fn inhibit_backoff(&mut self) {
        if self.state == StreamState::Error {
            self.state = StreamState::Initial;
        }
        self.backoff.reset();
    }

    /// Arms the idle timer if the stream is open and no timer is pending.
    pub fn mark_idle(&mut self) {
        if !self.is_open() || self.idle_token.is_some() {
            return;
        }
        self.next_idle_token += 1;
        let idle_token = self.next_idle_token;
        self.idle_token = Some(idle_token);

        let sink = Arc::clone(&self.sink);
        let kind = self.kind;
        let generation = self.generation;
        let timeout = self.idle_timeout;
        runtime::spawn_detached(async move {
            runtime::sleep(timeout).await;
            sink(StreamEvent::IdleTimeout {
                kind,
                generation,
                idle_token,
            });
        });
    }

    /// Queues `message` for the writer task. Cancels a pending idle timer.
    pub fn send(&mut self, message: &serde_json::Value) {
        self.idle_token = None;
        match &self.outbound {
            Some(sender) => {
                if sender.try_send(message.to_string().into_bytes()).is_err() {
                    debug!("{} stream writer is gone; dropping message", self.kind.label());
                }
            }
            None => debug!("{} stream is not open; dropping message", self.kind.label()),
        }
    }

    pub fn handle_opened(&mut self, generation: u64, sender: Sender<Vec<u8>>) -> bool {
        if generation != self.generation || self.state != StreamState::Starting {
            sender.close();
            return false;
        }
        debug!("{} stream open", self.kind.label());
        self.state = StreamState::Open;
        self.outbound = Some(sender);
        true
    }

    /// A message on the current attempt proves the stream healthy and resets the backoff.
    pub fn handle_message(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != StreamState::Open {
            return false;
        }
        self.healthy = true;
        self.backoff.reset();
        true
    }

    /// Records a close reported by the I/O task. Returns false for stale attempts.
    pub fn handle_closed(&mut self, generation: u64, error: Option<&FirestoreError>) -> bool {
        if generation != self.generation || !self.is_started() {
            return false;
        }
        match error {
            Some(err) => debug!("{} stream closed: {err}", self.kind.label()),
            None => debug!("{} stream closed by the backend", self.kind.label()),
        }
        self.close(StreamState::Error, error);
        true
    }

    /// Tears down the current attempt as if the backend had closed it with `error`.
    pub fn fail(&mut self, error: &FirestoreError) {
        if self.is_started() {
            self.close(StreamState::Error, Some(error));
        }
    }

    pub fn handle_backoff_elapsed(&mut self, generation: u64) {
        if generation == self.generation && self.state == StreamState::Backoff {
            self.state = StreamState::Initial;
            self.open();
        }
    }

    /// Returns true when the timer closed the stream.
    pub fn handle_idle_timeout(&mut self, generation: u64, idle_token: u64) -> bool {
        if generation != self.generation || self.idle_token != Some(idle_token) || !self.is_open() {
            return false;
        }
        debug!("{} stream idle; closing", self.kind.label());
        self.close(StreamState::Initial, None);
        true
    }

    fn close(&mut self, final_state: StreamState, error: Option<&FirestoreError>) {
        self.generation += 1;
        self.idle_token = None;
        // Dropping the sender lets the writer task close the underlying handle.
        if let Some(sender) = self.outbound.take() {
            sender.close();
        }

        match error {
            None => self.backoff.reset(),
            Some(err) if err.code == FirestoreErrorCode::ResourceExhausted => {
                debug!("{} stream exhausted the backend quota; using max backoff", self.kind.label());
                self.backoff.reset_to_max();
            }
            Some(err) if err.code == FirestoreErrorCode::Unauthenticated && !self.healthy => {
                self.token_provider.invalidate_token();
            }
            Some(_) => {}
        }
        self.healthy = false;
        self.state = final_state;
    }

    fn schedule_backoff(&mut self) {
        self.state = StreamState::Backoff;
        let delay = self.backoff.next_delay();
        debug!(
            "{} stream reopening in {} ms",
            self.kind.label(),
            delay.as_millis()
        );
        let sink = Arc::clone(&self.sink);
        let kind = self.kind;
        let generation = self.generation;
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            sink(StreamEvent::BackoffElapsed { kind, generation });
        });
    }

    fn open(&mut self) {
        self.generation += 1;
        self.state = StreamState::Starting;
        self.healthy = false;

        let generation = self.generation;
        let kind = self.kind;
        let connection = Arc::clone(&self.connection);
        let token_provider = Arc::clone(&self.token_provider);
        let sink = Arc::clone(&self.sink);
        debug!("{} stream starting (generation {generation})", kind.label());

        runtime::spawn_detached(async move {
            let opened: FirestoreResult<Arc<dyn StreamHandle>> = async {
                let token = token_provider.get_token().await?;
                match kind {
                    StreamKind::Listen => connection.open_listen_stream(token).await,
                    StreamKind::Write => connection.open_write_stream(token).await,
                }
            }
            .await;
            let handle = match opened {
                Ok(handle) => handle,
                Err(err) => {
                    sink(StreamEvent::Closed {
                        kind,
                        generation,
                        error: Some(err),
                    });
                    return;
                }
            };

            let (sender, receiver) = async_channel::unbounded::<Vec<u8>>();
            sink(StreamEvent::Opened {
                kind,
                generation,
                sender,
            });

            let writer = Arc::clone(&handle);
            runtime::spawn_detached(async move {
                while let Ok(payload) = receiver.recv().await {
                    if writer.send(payload).await.is_err() {
                        break;
                    }
                }
                let _ = writer.close().await;
            });

            loop {
                match handle.next().await {
                    Some(Ok(payload)) => sink(StreamEvent::Message {
                        kind,
                        generation,
                        payload,
                    }),
                    Some(Err(err)) => {
                        sink(StreamEvent::Closed {
                            kind,
                            generation,
                            error: Some(err),
                        });
                        break;
                    }
                    None => {
                        sink(StreamEvent::Closed {
                            kind,
                            generation,
                            error: None,
                        });
                        break;
                    }
                }
            }
        });
    }
}

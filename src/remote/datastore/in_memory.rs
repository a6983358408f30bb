//! Loopback [`Connection`] whose backend side is driven by the caller. Used to script watch and
//! write responses in tests.

use std::sync::{Arc, Mutex, MutexGuard};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::{Connection, StreamHandle, StreamKind};
use crate::error::{internal_error, FirestoreError, FirestoreResult};

#[derive(Clone, Debug)]
enum Frame {
    Data(Vec<u8>),
    Close,
    Error(FirestoreError),
}

#[derive(Default)]
struct BackendState {
    open_errors: Vec<FirestoreError>,
    tokens: Vec<Option<String>>,
    lookup_responses: Vec<JsonValue>,
    lookup_requests: Vec<JsonValue>,
}

fn lock(state: &Mutex<BackendState>) -> MutexGuard<'_, BackendState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct InMemoryConnection {
    listen_accepts: Sender<ServerStream>,
    write_accepts: Sender<ServerStream>,
    state: Arc<Mutex<BackendState>>,
}

/// Backend half of an [`InMemoryConnection`].
pub struct InMemoryBackend {
    listen_accepts: Receiver<ServerStream>,
    write_accepts: Receiver<ServerStream>,
    state: Arc<Mutex<BackendState>>,
}

impl InMemoryConnection {
    pub fn new() -> (Arc<Self>, InMemoryBackend) {
        let (listen_tx, listen_rx) = async_channel::unbounded();
        let (write_tx, write_rx) = async_channel::unbounded();
        let state = Arc::new(Mutex::new(BackendState::default()));
        let connection = Arc::new(Self {
            listen_accepts: listen_tx,
            write_accepts: write_tx,
            state: Arc::clone(&state),
        });
        let backend = InMemoryBackend {
            listen_accepts: listen_rx,
            write_accepts: write_rx,
            state,
        };
        (connection, backend)
    }

    async fn open(&self, kind: StreamKind, token: Option<String>) -> FirestoreResult<Arc<dyn StreamHandle>> {
        {
            let mut state = lock(&self.state);
            state.tokens.push(token.clone());
            if !state.open_errors.is_empty() {
                return Err(state.open_errors.remove(0));
            }
        }

        let (to_server_tx, to_server_rx) = async_channel::unbounded();
        let (to_client_tx, to_client_rx) = async_channel::unbounded();
        let server = ServerStream {
            kind,
            token,
            to_client: to_client_tx,
            from_client: to_server_rx,
        };
        let accepts = match kind {
            StreamKind::Listen => &self.listen_accepts,
            StreamKind::Write => &self.write_accepts,
        };
        accepts
            .send(server)
            .await
            .map_err(|err| internal_error(format!("in-memory backend is gone: {err}")))?;
        Ok(Arc::new(ClientStream {
            outbound: to_server_tx,
            inbound: to_client_rx,
        }))
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Connection for InMemoryConnection {
    async fn open_listen_stream(&self, token: Option<String>) -> FirestoreResult<Arc<dyn StreamHandle>> {
        self.open(StreamKind::Listen, token).await
    }

    async fn open_write_stream(&self, token: Option<String>) -> FirestoreResult<Arc<dyn StreamHandle>> {
        self.open(StreamKind::Write, token).await
    }

    async fn batch_get_documents(
        &self,
        request: JsonValue,
        token: Option<String>,
    ) -> FirestoreResult<Vec<JsonValue>> {
        let mut state = lock(&self.state);
        state.tokens.push(token);
        state.lookup_requests.push(request);
        Ok(std::mem::take(&mut state.lookup_responses))
    }
}

impl InMemoryBackend {
    /// Waits for the client to open its next stream of `kind`.
    pub async fn accept(&self, kind: StreamKind) -> Option<ServerStream> {
        let accepts = match kind {
            StreamKind::Listen => &self.listen_accepts,
            StreamKind::Write => &self.write_accepts,
        };
        accepts.recv().await.ok()
    }

    /// The next stream open attempt fails with `error`.
    pub fn fail_next_open(&self, error: FirestoreError) {
        lock(&self.state).open_errors.push(error);
    }

    pub fn set_lookup_responses(&self, responses: Vec<JsonValue>) {
        lock(&self.state).lookup_responses = responses;
    }

    pub fn lookup_requests(&self) -> Vec<JsonValue> {
        lock(&self.state).lookup_requests.clone()
    }

    /// Tokens presented by every open and unary call so far.
    pub fn tokens(&self) -> Vec<Option<String>> {
        lock(&self.state).tokens.clone()
    }
}

/// Server end of one stream.
pub struct ServerStream {
    kind: StreamKind,
    token: Option<String>,
    to_client: Sender<Frame>,
    from_client: Receiver<Frame>,
}

impl ServerStream {
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Next message from the client; `None` once the client closed the stream.
    pub async fn recv_json(&self) -> Option<JsonValue> {
        loop {
            match self.from_client.recv().await.ok()? {
                Frame::Data(payload) => match serde_json::from_slice(&payload) {
                    Ok(value) => return Some(value),
                    Err(err) => log::warn!("in-memory backend dropped an undecodable frame: {err}"),
                },
                Frame::Close | Frame::Error(_) => return None,
            }
        }
    }

    pub fn send_json(&self, message: JsonValue) {
        let payload = message.to_string().into_bytes();
        let _ = self.to_client.try_send(Frame::Data(payload));
    }

    /// Ends the stream with `error`, as a backend status would.
    pub fn fail(&self, error: FirestoreError) {
        let _ = self.to_client.try_send(Frame::Error(error));
        self.to_client.close();
    }

    pub fn close(&self) {
        let _ = self.to_client.try_send(Frame::Close);
        self.to_client.close();
    }

    pub fn is_closed_by_client(&self) -> bool {
        self.from_client.is_closed()
    }
}

struct ClientStream {
    outbound: Sender<Frame>,
    inbound: Receiver<Frame>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamHandle for ClientStream {
    async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        self.outbound
            .send(Frame::Data(payload))
            .await
            .map_err(|err| internal_error(format!("in-memory stream send failed: {err}")))
    }

    async fn next(&self) -> Option<FirestoreResult<Vec<u8>>> {
        match self.inbound.recv().await.ok()? {
            Frame::Data(payload) => Some(Ok(payload)),
            Frame::Error(err) => Some(Err(err)),
            Frame::Close => None,
        }
    }

    async fn close(&self) -> FirestoreResult<()> {
        let _ = self.outbound.send(Frame::Close).await;
        self.outbound.close();
        self.inbound.close();
        Ok(())
    }
}

//! The public entry point: one [`FirestoreClient`] per database, backed by a single worker
//! task that owns all sync state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;
use log::{debug, warn};

use crate::engine::{
    EventManager, ListenOptions, ListenerId, OnlineStateHandler, Query, QueryListener,
    RemoteRequest, Reply, SnapshotObserver, SyncEngine, ViewSnapshot,
};
use crate::error::{cancelled, failed_precondition, FirestoreResult};
use crate::local::{LocalStore, MemoryPersistence, Persistence};
use crate::model::{DocumentKey, MutableDocument, Mutation, User};
use crate::platform::runtime;
use crate::remote::{
    Connection, Datastore, JsonProtoSerializer, RemoteStore, StreamEvent, StreamEventSink,
    TokenProviderArc,
};
use crate::settings::FirestoreSettings;

/// Work items processed in order by the client worker.
enum Operation {
    Listen {
        listener: QueryListener,
        reply: Reply<ListenerId>,
    },
    Unlisten {
        listener_id: ListenerId,
    },
    GetDocumentsFromLocalCache {
        query: Query,
        reply: Reply<ViewSnapshot>,
    },
    GetDocumentFromLocalCache {
        key: DocumentKey,
        reply: Reply<MutableDocument>,
    },
    WriteMutations {
        mutations: Vec<Mutation>,
        reply: Reply<()>,
    },
    WaitForPendingWrites {
        reply: Reply<()>,
    },
    EnableNetwork {
        reply: Reply<()>,
    },
    DisableNetwork {
        reply: Reply<()>,
    },
    CredentialChange {
        user: User,
        reply: Reply<()>,
    },
    ConnectivityChanged,
    AddOnlineStateHandler {
        handler: OnlineStateHandler,
    },
    Remote(StreamEvent),
    Terminate {
        reply: Reply<()>,
    },
}

/// Handle to a running sync engine. Cheap to clone; every clone talks to the same worker.
#[derive(Clone)]
pub struct FirestoreClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    settings: FirestoreSettings,
    sender: Sender<Operation>,
    datastore: Datastore,
    terminated: AtomicBool,
}

impl FirestoreClient {
    /// Starts a client whose local state lives in `persistence`, talking to the backend over
    /// `connection`. Must be called from within an async runtime on native targets, or the
    /// worker runs on a private background runtime.
    pub fn new(
        settings: FirestoreSettings,
        persistence: Box<dyn Persistence>,
        connection: Arc<dyn Connection>,
        token_provider: TokenProviderArc,
        initial_user: User,
    ) -> FirestoreResult<Self> {
        let (sender, receiver) = async_channel::unbounded();

        let mut local_store = LocalStore::new(persistence, initial_user);
        local_store.start()?;
        let sync_engine = SyncEngine::new(local_store, &settings);

        let sink_sender = sender.clone();
        let sink: StreamEventSink = Arc::new(move |event| {
            if sink_sender.try_send(Operation::Remote(event)).is_err() {
                debug!("Dropping stream event after the client stopped");
            }
        });
        let remote_store = RemoteStore::new(
            &settings,
            Arc::clone(&connection),
            Arc::clone(&token_provider),
            sink,
        );

        let worker = ClientWorker {
            sync_engine,
            remote_store,
            event_manager: EventManager::new(),
            receiver,
        };
        runtime::spawn_detached(worker.run());

        let datastore = Datastore::new(
            connection,
            token_provider,
            JsonProtoSerializer::new(settings.database_id().clone()),
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                settings,
                sender,
                datastore,
                terminated: AtomicBool::new(false),
            }),
        })
    }

    /// Client with memory persistence for an unauthenticated user.
    pub fn new_in_memory(
        settings: FirestoreSettings,
        connection: Arc<dyn Connection>,
        token_provider: TokenProviderArc,
    ) -> FirestoreResult<Self> {
        Self::new(
            settings,
            Box::new(MemoryPersistence::new()),
            connection,
            token_provider,
            User::unauthenticated(),
        )
    }

    pub fn settings(&self) -> &FirestoreSettings {
        &self.inner.settings
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    fn enqueue(&self, operation: Operation) -> FirestoreResult<()> {
        if self.is_terminated() {
            return Err(failed_precondition("The client has already been terminated."));
        }
        self.inner
            .sender
            .try_send(operation)
            .map_err(|_| failed_precondition("The client has already been terminated."))
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Operation) -> FirestoreResult<T> {
        let (reply, response) = oneshot::channel();
        self.enqueue(build(reply))?;
        response
            .await
            .map_err(|_| cancelled("The client was terminated before the operation completed"))?
    }

    /// Subscribes `observer` to `query`. Snapshots (and at most one terminal error) are
    /// delivered on the worker task until the returned registration is removed or dropped.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: SnapshotObserver,
    ) -> FirestoreResult<ListenerRegistration> {
        let listener = QueryListener::new(query, options, observer);
        let active = listener.active_flag();
        let listener_id = self
            .request(|reply| Operation::Listen { listener, reply })
            .await?;
        Ok(ListenerRegistration {
            sender: self.inner.sender.clone(),
            listener_id,
            active,
        })
    }

    /// Runs `query` against the local cache only.
    pub async fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        self.request(|reply| Operation::GetDocumentsFromLocalCache { query, reply })
            .await
    }

    /// Local view of one document, including pending writes. Unknown documents come back
    /// invalid.
    pub async fn get_document_from_local_cache(&self, key: DocumentKey) -> FirestoreResult<MutableDocument> {
        self.request(|reply| Operation::GetDocumentFromLocalCache { key, reply })
            .await
    }

    /// Reads `keys` straight from the backend, bypassing the cache.
    pub async fn get_documents_from_server(&self, keys: &[DocumentKey]) -> FirestoreResult<Vec<MutableDocument>> {
        if self.is_terminated() {
            return Err(failed_precondition("The client has already been terminated."));
        }
        self.inner.datastore.lookup(keys).await
    }

    /// Applies `mutations` locally right away and resolves once the backend commits them.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        self.request(|reply| Operation::WriteMutations { mutations, reply })
            .await
    }

    /// Resolves once every write issued so far has been acknowledged or rejected.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        self.request(|reply| Operation::WaitForPendingWrites { reply })
            .await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.request(|reply| Operation::EnableNetwork { reply }).await
    }

    /// Stops both streams. Listeners keep receiving cached results marked as from-cache.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.request(|reply| Operation::DisableNetwork { reply }).await
    }

    /// Switches to `user`: pending writes of the previous user are set aside and the streams
    /// restart with the new credentials.
    pub async fn set_user(&self, user: User) -> FirestoreResult<()> {
        self.request(|reply| Operation::CredentialChange { user, reply })
            .await
    }

    /// Tells the client the device's network changed so streams reconnect without waiting
    /// for their backoff.
    pub fn notify_connectivity_change(&self) -> FirestoreResult<()> {
        self.enqueue(Operation::ConnectivityChanged)
    }

    /// Registers `handler` for online state changes. It is called with the current state
    /// right away.
    pub fn on_online_state_changed(&self, handler: OnlineStateHandler) -> FirestoreResult<()> {
        self.enqueue(Operation::AddOnlineStateHandler { handler })
    }

    /// Shuts the worker down. Outstanding writes fail with `cancelled`; later calls fail with
    /// `failed-precondition`.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        if self.inner.terminated.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (reply, response) = oneshot::channel();
        if self
            .inner
            .sender
            .try_send(Operation::Terminate { reply })
            .is_err()
        {
            return Ok(());
        }
        response.await.unwrap_or(Ok(()))
    }
}

/// Keeps a listener alive. Removing or dropping it stops delivery immediately, even if the
/// removal is still queued behind other work.
pub struct ListenerRegistration {
    sender: Sender<Operation>,
    listener_id: ListenerId,
    active: Arc<AtomicBool>,
}

impl ListenerRegistration {
    pub fn listener_id(&self) -> ListenerId {
        self.listener_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn remove(&mut self) {
        if self.active.swap(false, Ordering::AcqRel) {
            let _ = self.sender.try_send(Operation::Unlisten {
                listener_id: self.listener_id,
            });
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.remove();
    }
}

struct ClientWorker {
    sync_engine: SyncEngine,
    remote_store: RemoteStore,
    event_manager: EventManager,
    receiver: Receiver<Operation>,
}

impl ClientWorker {
    async fn run(mut self) {
        while let Ok(operation) = self.receiver.recv().await {
            if let Operation::Terminate { reply } = operation {
                self.shutdown();
                let _ = reply.send(Ok(()));
                break;
            }
            self.handle(operation);
            self.drain();
        }
        debug!("Client worker stopped");
    }

    fn handle(&mut self, operation: Operation) {
        match operation {
            Operation::Listen { listener, reply } => {
                let result = self.event_manager.listen(listener, &mut self.sync_engine);
                let _ = reply.send(result);
            }
            Operation::Unlisten { listener_id } => {
                if let Err(err) = self
                    .event_manager
                    .unlisten(listener_id, &mut self.sync_engine)
                {
                    warn!("Failed to remove listener {listener_id}: {err}");
                }
            }
            Operation::GetDocumentsFromLocalCache { query, reply } => {
                let _ = reply.send(self.sync_engine.get_documents_from_local_cache(query));
            }
            Operation::GetDocumentFromLocalCache { key, reply } => {
                let _ = reply.send(self.sync_engine.get_document_from_local_cache(&key));
            }
            Operation::WriteMutations { mutations, reply } => {
                if let Err(err) = self.sync_engine.write(mutations, reply) {
                    warn!("Failed to raise snapshots for a local write: {err}");
                }
            }
            Operation::WaitForPendingWrites { reply } => {
                self.sync_engine.register_pending_writes_callback(reply);
            }
            // Listeners see the resulting online state before the caller resumes.
            Operation::EnableNetwork { reply } => {
                let result = self.remote_store.enable_network(&mut self.sync_engine);
                self.drain();
                let _ = reply.send(result);
            }
            Operation::DisableNetwork { reply } => {
                self.remote_store.disable_network(&mut self.sync_engine);
                self.drain();
                let _ = reply.send(Ok(()));
            }
            Operation::CredentialChange { user, reply } => {
                let result = self
                    .remote_store
                    .handle_credential_change(user, &mut self.sync_engine);
                self.drain();
                let _ = reply.send(result);
            }
            Operation::ConnectivityChanged => {
                if let Err(err) = self
                    .remote_store
                    .handle_connectivity_change(&mut self.sync_engine)
                {
                    warn!("Failed to restart streams: {err}");
                }
            }
            Operation::AddOnlineStateHandler { handler } => {
                self.event_manager.add_online_state_handler(handler);
            }
            Operation::Remote(event) => {
                if let Err(err) = self
                    .remote_store
                    .handle_stream_event(event, &mut self.sync_engine)
                {
                    warn!("Failed to handle stream event: {err}");
                }
            }
            Operation::Terminate { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// Feeds sync engine output to the remote store and the listeners until both go quiet.
    fn drain(&mut self) {
        loop {
            let requests = self.sync_engine.take_remote_requests();
            let events = self.sync_engine.take_events();
            if requests.is_empty() && events.is_empty() {
                break;
            }
            for event in events {
                self.event_manager.handle_sync_engine_event(event);
            }
            for request in requests {
                let result = match request {
                    RemoteRequest::Listen(target_data) => {
                        self.remote_store.listen(target_data, &mut self.sync_engine);
                        Ok(())
                    }
                    RemoteRequest::Unlisten(target_id) => {
                        self.remote_store.unlisten(target_id, &mut self.sync_engine);
                        Ok(())
                    }
                    RemoteRequest::FillWritePipeline => {
                        self.remote_store.fill_write_pipeline(&mut self.sync_engine)
                    }
                };
                if let Err(err) = result {
                    warn!("Remote store request failed: {err}");
                }
            }
        }
    }

    fn shutdown(&mut self) {
        self.remote_store.shutdown(&mut self.sync_engine);
        self.drain();
        self.sync_engine.shutdown();
    }
}

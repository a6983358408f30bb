use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::error::{internal_error, invalid_argument, FirestoreErrorCode, FirestoreResult};
use crate::model::{DocumentKey, MutableDocument};
use crate::remote::serializer::JsonProtoSerializer;

pub mod in_memory;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Listen,
    Write,
}

impl StreamKind {
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Listen => "listen",
            StreamKind::Write => "write",
        }
    }
}

/// One open bidirectional stream. Frames are JSON-encoded protocol messages.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamHandle: Send + Sync + 'static {
    async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()>;

    /// `None` once the peer closed the stream cleanly.
    async fn next(&self) -> Option<FirestoreResult<Vec<u8>>>;

    async fn close(&self) -> FirestoreResult<()>;
}

/// Transport to the backend.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Connection: Send + Sync + 'static {
    async fn open_listen_stream(&self, token: Option<String>) -> FirestoreResult<Arc<dyn StreamHandle>>;

    async fn open_write_stream(&self, token: Option<String>) -> FirestoreResult<Arc<dyn StreamHandle>>;

    /// Unary `BatchGetDocuments`: one response object per requested document.
    async fn batch_get_documents(
        &self,
        request: JsonValue,
        token: Option<String>,
    ) -> FirestoreResult<Vec<JsonValue>>;
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait TokenProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<String>>;

    /// The backend rejected the last token; the next `get_token` must fetch a fresh one.
    fn invalidate_token(&self);
}

#[derive(Default, Clone)]
pub struct NoopTokenProvider;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl TokenProvider for NoopTokenProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

pub type TokenProviderArc = Arc<dyn TokenProvider>;

/// Unary calls on top of a [`Connection`].
#[derive(Clone)]
pub struct Datastore {
    connection: Arc<dyn Connection>,
    token_provider: TokenProviderArc,
    serializer: JsonProtoSerializer,
}

impl Datastore {
    pub fn new(
        connection: Arc<dyn Connection>,
        token_provider: TokenProviderArc,
        serializer: JsonProtoSerializer,
    ) -> Self {
        Self {
            connection,
            token_provider,
            serializer,
        }
    }

    /// Reads `keys` from the backend. Missing documents come back as no-documents at the read
    /// time of the response, in the order of `keys`.
    pub async fn lookup(&self, keys: &[DocumentKey]) -> FirestoreResult<Vec<MutableDocument>> {
        let request = json!({
            "database": self.serializer.database_name(),
            "documents": keys
                .iter()
                .map(|key| self.serializer.document_name(key))
                .collect::<Vec<_>>(),
        });
        let token = self.token_provider.get_token().await?;
        let responses = match self.connection.batch_get_documents(request, token).await {
            Err(err) if err.code == FirestoreErrorCode::Unauthenticated => {
                self.token_provider.invalidate_token();
                return Err(err);
            }
            other => other?,
        };

        let mut found = std::collections::BTreeMap::new();
        for response in &responses {
            let document = self.decode_lookup_response(response)?;
            found.insert(document.key().clone(), document);
        }
        keys.iter()
            .map(|key| {
                found.remove(key).ok_or_else(|| {
                    internal_error(format!("Backend did not return document {}", key.path().canonical_string()))
                })
            })
            .collect()
    }

    fn decode_lookup_response(&self, response: &JsonValue) -> FirestoreResult<MutableDocument> {
        if let Some(document) = response.get("found") {
            return self.serializer.decode_document(document);
        }
        if let Some(name) = response.get("missing").and_then(JsonValue::as_str) {
            let key = self.serializer.document_key_from_name(name)?;
            let read_time = self.serializer.decode_version(response.get("readTime"))?;
            if read_time.is_min() {
                return Err(invalid_argument("BatchGetDocuments response missing readTime"));
            }
            return Ok(MutableDocument::new_no_document(key, read_time));
        }
        Err(invalid_argument("BatchGetDocuments response has neither found nor missing"))
    }
}

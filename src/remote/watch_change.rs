use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::{internal_error, invalid_argument, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::model::{DocumentKey, MutableDocument, SnapshotVersion, TargetId};
use crate::remote::serializer::JsonProtoSerializer;

/// One decoded `ListenResponse`.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentChange),
    DocumentDelete(DocumentDelete),
    DocumentRemove(DocumentRemove),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means every target the stream knows about.
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub read_time: SnapshotVersion,
    pub cause: Option<FirestoreError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub document: MutableDocument,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentDelete {
    pub key: DocumentKey,
    pub read_time: SnapshotVersion,
    pub removed_target_ids: Vec<TargetId>,
}

/// The document left these targets but may still exist.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRemove {
    pub key: DocumentKey,
    pub read_time: SnapshotVersion,
    pub removed_target_ids: Vec<TargetId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i32,
    pub unchanged_names: Option<BloomFilterParams>,
}

/// Raw bloom filter parameters; validated when the filter is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilterParams {
    pub bitmap: Vec<u8>,
    pub padding: i32,
    pub hash_count: i32,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
}

pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }

    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }

    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }

    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }

    if let Some(filter) = value.get("filter") {
        return decode_filter_change(serializer, filter).map(Some);
    }

    Ok(None)
}

fn decode_target_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let target_ids = numeric_array(value.get("targetIds"), "targetIds")?;
    let resume_token = serializer.decode_bytes(value.get("resumeToken"))?;
    let read_time = serializer.decode_version(value.get("readTime"))?;

    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(TargetChangeState::NoChange);

    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<StatusCause>(cause.clone()))
        .transpose()
        .map_err(|err| internal_error(format!("Failed to decode watch cause: {err}")))?
        .map(|cause| {
            FirestoreError::new(
                FirestoreErrorCode::from_grpc_status(cause.code),
                cause.message.unwrap_or_else(|| "watch target error".to_string()),
            )
        });

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids,
        resume_token,
        read_time,
        cause,
    }))
}

fn decode_document_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let document = serializer.decode_document(document)?;

    Ok(WatchChange::DocumentChange(DocumentChange {
        updated_target_ids: numeric_array(value.get("targetIds"), "targetIds")?,
        removed_target_ids: numeric_array(value.get("removedTargetIds"), "removedTargetIds")?,
        key: document.key().clone(),
        document,
    }))
}

fn decode_document_delete(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("documentDelete missing document"))?;

    Ok(WatchChange::DocumentDelete(DocumentDelete {
        key: serializer.document_key_from_name(name)?,
        read_time: serializer.decode_version(value.get("readTime"))?,
        removed_target_ids: numeric_array(value.get("removedTargetIds"), "removedTargetIds")?,
    }))
}

fn decode_document_remove(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("documentRemove missing document"))?;

    Ok(WatchChange::DocumentRemove(DocumentRemove {
        key: serializer.document_key_from_name(name)?,
        read_time: serializer.decode_version(value.get("readTime"))?,
        removed_target_ids: numeric_array(value.get("removedTargetIds"), "removedTargetIds")?,
    }))
}

fn decode_filter_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let target_id: TargetId = int32(value.get("targetId"), "targetId")?;
    let count = int32(value.get("count"), "count")?;

    let unchanged_names = match value.get("unchangedNames") {
        Some(names) => {
            let bits = names.get("bits");
            Some(BloomFilterParams {
                bitmap: serializer.decode_bytes(bits.and_then(|b| b.get("bitmap")))?,
                padding: int32(bits.and_then(|b| b.get("padding")), "padding")?,
                hash_count: int32(names.get("hashCount"), "hashCount")?,
            })
        }
        None => None,
    };

    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        count,
        unchanged_names,
    }))
}

/// Reads an optional int32 field; absent or non-numeric values decode as 0.
fn int32(value: Option<&JsonValue>, field: &str) -> FirestoreResult<i32> {
    let Some(number) = value.and_then(JsonValue::as_i64) else {
        return Ok(0);
    };
    i32::try_from(number).map_err(|_| invalid_argument(format!("{field} {number} is out of int32 range")))
}

fn numeric_array(value: Option<&JsonValue>, field: &str) -> FirestoreResult<Vec<TargetId>> {
    let Some(entries) = value.and_then(JsonValue::as_array) else {
        return Ok(Vec::new());
    };
    entries
        .iter()
        .filter(|entry| entry.is_i64() || entry.is_u64())
        .map(|entry| {
            entry
                .as_i64()
                .and_then(|number| TargetId::try_from(number).ok())
                .ok_or_else(|| invalid_argument(format!("{field} entry {entry} is out of int32 range")))
        })
        .collect()
}

fn target_state_from_str(value: &str) -> TargetChangeState {
    match value {
        "ADD" => TargetChangeState::Add,
        "REMOVE" => TargetChangeState::Remove,
        "CURRENT" => TargetChangeState::Current,
        "RESET" => TargetChangeState::Reset,
        _ => TargetChangeState::NoChange,
    }
}

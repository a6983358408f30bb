use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::error::{invalid_argument, FirestoreResult};
use crate::local::TargetData;
use crate::model::{
    DatabaseId, DocumentKey, FieldMask, FieldPath, FieldTransform, GeoPoint, MutableDocument,
    Mutation, MutationKind, MutationResult, Precondition, ResourcePath, SnapshotVersion, Timestamp,
    TransformOperation,
};
use crate::remote::structured_query::encode_query_target;
use crate::value::{BytesValue, FirestoreValue, MapValue, ObjectValue, ValueKind};

const VECTOR_TYPE_FIELD: &str = "__type__";
const VECTOR_TYPE_VALUE: &str = "__vector__";
const VECTOR_VALUE_FIELD: &str = "value";

/// Converts between the model and the JSON mapping of the Firestore wire protocol.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        self.database_id.resource_name().canonical_string()
    }

    /// `projects/{project}/databases/{database}/documents/{path}`
    pub fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            format!("{}/documents", self.database_name())
        } else {
            format!("{}/documents/{}", self.database_name(), path.canonical_string())
        }
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        let prefix = format!("{}/documents/", self.database_name());
        let path = name.strip_prefix(&prefix).ok_or_else(|| {
            invalid_argument(format!(
                "Document name {name} does not belong to database {}",
                self.database_name()
            ))
        })?;
        DocumentKey::from_string(path)
    }

    pub fn encode_timestamp(&self, timestamp: &Timestamp) -> String {
        timestamp.to_rfc3339()
    }

    pub fn decode_timestamp_string(&self, value: &str) -> FirestoreResult<Timestamp> {
        Timestamp::from_rfc3339(value)
    }

    /// Missing timestamps decode to the minimum version.
    pub fn decode_version(&self, value: Option<&JsonValue>) -> FirestoreResult<SnapshotVersion> {
        match value.and_then(JsonValue::as_str) {
            Some(timestamp) => Ok(SnapshotVersion::new(self.decode_timestamp_string(timestamp)?)),
            None => Ok(SnapshotVersion::min()),
        }
    }

    pub fn encode_bytes(&self, bytes: &[u8]) -> String {
        BASE64_STANDARD.encode(bytes)
    }

    pub fn decode_bytes(&self, value: Option<&JsonValue>) -> FirestoreResult<Vec<u8>> {
        match value.and_then(JsonValue::as_str) {
            Some(encoded) => BASE64_STANDARD
                .decode(encoded)
                .map_err(|err| invalid_argument(format!("Invalid base64 payload: {err}"))),
            None => Ok(Vec::new()),
        }
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        encode_value(value)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        decode_value(value)
    }

    pub fn encode_fields(&self, data: &ObjectValue) -> JsonValue {
        encode_map_fields(data.map_value())
    }

    /// Decodes a `Document` message into a found document.
    pub fn decode_document(&self, document: &JsonValue) -> FirestoreResult<MutableDocument> {
        let name = document
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document missing name"))?;
        let key = self.document_key_from_name(name)?;
        let version = self.decode_version(document.get("updateTime"))?;
        if version.is_min() {
            return Err(invalid_argument(format!("Document {key} has no update time")));
        }
        let fields = decode_map_value(document)?;
        Ok(MutableDocument::new_found_document(
            key,
            version,
            ObjectValue::new(fields),
        ))
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = JsonMap::new();
        match mutation.kind() {
            MutationKind::Set { value } => {
                write.insert("update".into(), self.encode_document(mutation.key(), value));
            }
            MutationKind::Patch { data, mask } => {
                write.insert("update".into(), self.encode_document(mutation.key(), data));
                write.insert("updateMask".into(), encode_field_mask(mask));
            }
            MutationKind::Delete => {
                write.insert("delete".into(), json!(self.document_name(mutation.key())));
            }
            MutationKind::Verify => {
                write.insert("verify".into(), json!(self.document_name(mutation.key())));
            }
        }

        if !mutation.field_transforms().is_empty() {
            let transforms = mutation
                .field_transforms()
                .iter()
                .map(|transform| self.encode_field_transform(transform))
                .collect();
            write.insert("updateTransforms".into(), JsonValue::Array(transforms));
        }

        match mutation.precondition() {
            Precondition::None => {}
            Precondition::Exists(exists) => {
                write.insert("currentDocument".into(), json!({ "exists": exists }));
            }
            Precondition::UpdateTime(version) => {
                write.insert(
                    "currentDocument".into(),
                    json!({ "updateTime": self.encode_timestamp(&version.timestamp()) }),
                );
            }
        }
        JsonValue::Object(write)
    }

    fn encode_document(&self, key: &DocumentKey, data: &ObjectValue) -> JsonValue {
        json!({
            "name": self.document_name(key),
            "fields": self.encode_fields(data),
        })
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field().canonical_string();
        match transform.operation() {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME"
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": {
                    "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                }
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": {
                    "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                }
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": encode_value(operand)
            }),
        }
    }

    /// Results of one acknowledged batch. A result without an update time took effect at the
    /// commit time.
    pub fn decode_write_results(
        &self,
        results: Option<&JsonValue>,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<Vec<MutationResult>> {
        let Some(results) = results.and_then(JsonValue::as_array) else {
            return Ok(Vec::new());
        };
        results
            .iter()
            .map(|result| -> FirestoreResult<MutationResult> {
                let mut version = self.decode_version(result.get("updateTime"))?;
                if version.is_min() {
                    version = commit_version;
                }
                let transform_results = result
                    .get("transformResults")
                    .and_then(JsonValue::as_array)
                    .map(|values| values.iter().map(decode_value).collect::<FirestoreResult<Vec<_>>>())
                    .transpose()?
                    .unwrap_or_default();
                Ok(MutationResult::new(version, transform_results))
            })
            .collect()
    }

    /// `addTarget` payload. Resumes from the token when there is one, else from the last
    /// snapshot version.
    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let mut encoded = JsonMap::new();
        let target = &target_data.target;
        if target.is_document_target() {
            encoded.insert(
                "documents".into(),
                json!({ "documents": [self.resource_name(target.path())] }),
            );
        } else {
            encoded.insert("query".into(), encode_query_target(self, target));
        }
        encoded.insert("targetId".into(), json!(target_data.target_id));

        let resuming = if !target_data.resume_token.is_empty() {
            encoded.insert(
                "resumeToken".into(),
                json!(self.encode_bytes(&target_data.resume_token)),
            );
            true
        } else if !target_data.snapshot_version.is_min() {
            encoded.insert(
                "readTime".into(),
                json!(self.encode_timestamp(&target_data.snapshot_version.timestamp())),
            );
            true
        } else {
            false
        };
        if let (true, Some(expected_count)) = (resuming, target_data.expected_count) {
            encoded.insert("expectedCount".into(), json!(expected_count));
        }
        JsonValue::Object(encoded)
    }

    /// Full `ListenRequest` adding `target_data`.
    pub fn encode_listen_request(&self, target_data: &TargetData) -> JsonValue {
        let mut request = json!({
            "database": self.database_name(),
            "addTarget": self.encode_target(target_data),
        });
        if let Some(label) = target_data.purpose.listen_label() {
            request["labels"] = json!({ "goog-listen-tags": label });
        }
        request
    }

    pub fn encode_unlisten_request(&self, target_id: i32) -> JsonValue {
        json!({
            "database": self.database_name(),
            "removeTarget": target_id,
        })
    }

    pub fn encode_write_handshake(&self) -> JsonValue {
        json!({ "database": self.database_name() })
    }

    pub fn encode_write_request(&self, stream_token: &[u8], mutations: &[Mutation]) -> JsonValue {
        json!({
            "streamToken": self.encode_bytes(stream_token),
            "writes": mutations.iter().map(|m| self.encode_mutation(m)).collect::<Vec<_>>(),
        })
    }
}

fn encode_field_mask(mask: &FieldMask) -> JsonValue {
    let paths: Vec<String> = mask.fields().iter().map(FieldPath::canonical_string).collect();
    json!({ "fieldPaths": paths })
}

fn encode_map_fields(map: &MapValue) -> JsonValue {
    let fields: JsonMap<String, JsonValue> = map
        .fields()
        .iter()
        .map(|(key, value)| (key.clone(), encode_value(value)))
        .collect();
    JsonValue::Object(fields)
}

fn encode_value(value: &FirestoreValue) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => encode_double(*double),
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": timestamp.to_rfc3339() }),
        // Local estimates never reach the wire; transforms carry server timestamps.
        ValueKind::ServerTimestamp { .. } => json!({ "nullValue": JsonValue::Null }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => {
            let values = array.values().iter().map(encode_value).collect::<Vec<_>>();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Vector(values) => {
            let values = values.iter().map(|v| encode_double(*v)).collect::<Vec<_>>();
            json!({
                "mapValue": {
                    "fields": {
                        VECTOR_TYPE_FIELD: { "stringValue": VECTOR_TYPE_VALUE },
                        VECTOR_VALUE_FIELD: { "arrayValue": { "values": values } },
                    }
                }
            })
        }
        ValueKind::Map(map) => json!({
            "mapValue": {
                "fields": encode_map_fields(map)
            }
        }),
    }
}

/// JSON numbers cannot hold NaN or infinities; the proto3 JSON mapping spells them as strings.
fn encode_double(value: f64) -> JsonValue {
    if value.is_nan() {
        json!({ "doubleValue": "NaN" })
    } else if value.is_infinite() {
        json!({ "doubleValue": if value > 0.0 { "Infinity" } else { "-Infinity" } })
    } else {
        json!({ "doubleValue": value })
    }
}

fn decode_map_value(value: &JsonValue) -> FirestoreResult<MapValue> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected object for map value"))?;
    let fields_object = match map.get("fields") {
        Some(fields_value) => fields_value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
        None => return Ok(MapValue::new(BTreeMap::new())),
    };

    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => i64::from_str(value)
                .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        return Ok(FirestoreValue::from_double(decode_double(double_value)?));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(Timestamp::from_rfc3339(timestamp)?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let encoded = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded = BytesValue::from_base64(encoded)
            .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(FirestoreValue::from_bytes(decoded));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let name = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(name));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let latitude = geo_point
            .get("latitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.0);
        let longitude = geo_point
            .get("longitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.0);
        return Ok(FirestoreValue::from_geo_point(GeoPoint::new(latitude, longitude)?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        let values = array_value
            .get("values")
            .and_then(JsonValue::as_array)
            .map(|entries| entries.iter().map(decode_value).collect::<FirestoreResult<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();
        return Ok(FirestoreValue::from_array(values));
    }
    if let Some(map_value) = object.get("mapValue") {
        let map = decode_map_value(map_value)?;
        if let Some(vector) = as_vector(&map) {
            return Ok(FirestoreValue::from_vector(vector));
        }
        return Ok(FirestoreValue::from_map(map.into_fields()));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}

fn decode_double(value: &JsonValue) -> FirestoreResult<f64> {
    match value {
        JsonValue::Number(number) => number
            .as_f64()
            .ok_or_else(|| invalid_argument("Invalid doubleValue")),
        JsonValue::String(value) => match value.as_str() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            other => other
                .parse::<f64>()
                .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}"))),
        },
        _ => Err(invalid_argument("doubleValue must be a number or string")),
    }
}

fn as_vector(map: &MapValue) -> Option<Vec<f64>> {
    let type_matches = matches!(
        map.get(VECTOR_TYPE_FIELD).map(FirestoreValue::kind),
        Some(ValueKind::String(kind)) if kind == VECTOR_TYPE_VALUE
    );
    if !type_matches {
        return None;
    }
    let values = map.get(VECTOR_VALUE_FIELD)?.as_array()?;
    values
        .values()
        .iter()
        .map(|value| match value.kind() {
            ValueKind::Double(double) => Some(*double),
            ValueKind::Integer(integer) => Some(*integer as f64),
            _ => None,
        })
        .collect()
}

use std::collections::BTreeMap;

use crate::model::{DocumentKey, FieldMask, FieldPath, MutableDocument, SnapshotVersion, Timestamp};
use crate::value::{FirestoreValue, ObjectValue, ValueKind};

/// Condition a document must satisfy for a mutation to apply.
#[derive(Clone, Debug, PartialEq)]
pub enum Precondition {
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MutationKind {
    /// Replaces the whole document.
    Set { value: ObjectValue },
    /// Writes the fields named by `mask`; masked fields missing from `data` are deleted.
    Patch { data: ObjectValue, mask: FieldMask },
    Delete,
    /// Checks the precondition without writing. Only meaningful to the backend.
    Verify,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    key: DocumentKey,
    kind: MutationKind,
    precondition: Precondition,
    field_transforms: Vec<FieldTransform>,
}

/// Backend outcome of one mutation of an acknowledged batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<FirestoreValue>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

impl Mutation {
    pub fn new(
        key: DocumentKey,
        kind: MutationKind,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    ) -> Self {
        Self {
            key,
            kind,
            precondition,
            field_transforms,
        }
    }

    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Self::new(key, MutationKind::Set { value }, Precondition::None, Vec::new())
    }

    /// Patch that requires the document to exist, like a user-level update.
    pub fn patch(key: DocumentKey, data: ObjectValue, mask: FieldMask) -> Self {
        Self::new(
            key,
            MutationKind::Patch { data, mask },
            Precondition::Exists(true),
            Vec::new(),
        )
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self::new(key, MutationKind::Delete, Precondition::None, Vec::new())
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Self::new(key, MutationKind::Verify, precondition, Vec::new())
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        self.field_transforms = transforms;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    pub fn precondition(&self) -> &Precondition {
        &self.precondition
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        &self.field_transforms
    }

    /// Applies the acknowledged mutation to the cached remote document.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationResult) {
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.server_transform_results(document, &result.transform_results);
                let mut data = value.clone();
                data.set_all(transform_results);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { data, mask } => {
                if !self.precondition.is_valid_for(document) {
                    // The backend applied the patch to a document we never saw.
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let transform_results = self.server_transform_results(document, &result.transform_results);
                let mut merged = document.data().clone();
                merged.set_all(patch_values(data, mask));
                merged.set_all(transform_results);
                document
                    .convert_to_found_document(result.version, merged)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            MutationKind::Verify => {}
        }
    }

    /// Applies the mutation to the local view of `document`.
    ///
    /// `previous_mask` is the set of fields touched by earlier mutations, or `None` when an
    /// earlier mutation replaced the whole document. Returns the updated mask in the same form.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition.is_valid_for(document) {
            return previous_mask;
        }

        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.local_transform_results(local_write_time, document);
                let mut data = value.clone();
                data.set_all(transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Patch { data, mask } => {
                let transform_results = self.local_transform_results(local_write_time, document);
                let mut merged = document.data().clone();
                merged.set_all(patch_values(data, mask));
                merged.set_all(transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, merged)
                    .set_has_local_mutations();

                let previous_mask = previous_mask?;
                Some(
                    previous_mask
                        .union(mask.fields().iter().cloned())
                        .union(self.field_transforms.iter().map(|t| t.field().clone())),
                )
            }
            MutationKind::Delete => {
                let version = document.version();
                document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Verify => previous_mask,
        }
    }

    fn local_transform_results(
        &self,
        local_write_time: Timestamp,
        document: &MutableDocument,
    ) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
        self.field_transforms
            .iter()
            .map(|transform| {
                let previous = document.field(transform.field()).cloned();
                let value = match transform.operation() {
                    TransformOperation::ServerTimestamp => {
                        FirestoreValue::server_timestamp(local_write_time, previous)
                    }
                    other => apply_transform_locally(other, previous),
                };
                (transform.field().clone(), Some(value))
            })
            .collect()
    }

    fn server_transform_results(
        &self,
        document: &MutableDocument,
        server_results: &[FirestoreValue],
    ) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
        self.field_transforms
            .iter()
            .enumerate()
            .map(|(index, transform)| {
                let server_value = server_results.get(index).cloned();
                let value = match transform.operation() {
                    // Array transforms come back as null; recompute them against the
                    // acknowledged base document.
                    TransformOperation::ArrayUnion(_) | TransformOperation::ArrayRemove(_) => {
                        let previous = document.field(transform.field()).cloned();
                        apply_transform_locally(transform.operation(), previous)
                    }
                    _ => server_value.unwrap_or_else(FirestoreValue::null),
                };
                (transform.field().clone(), Some(value))
            })
            .collect()
    }
}

/// Field writes described by a patch: masked paths present in `data` are set, others deleted.
fn patch_values(data: &ObjectValue, mask: &FieldMask) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    mask.fields()
        .iter()
        .map(|path| (path.clone(), data.field(path).cloned()))
        .collect()
}

fn apply_transform_locally(
    operation: &TransformOperation,
    previous: Option<FirestoreValue>,
) -> FirestoreValue {
    match operation {
        TransformOperation::ServerTimestamp => {
            FirestoreValue::server_timestamp(Timestamp::now(), previous)
        }
        TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
        TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
        TransformOperation::NumericIncrement(operand) => numeric_increment(previous, operand),
    }
}

fn existing_array(previous: Option<FirestoreValue>) -> Vec<FirestoreValue> {
    match previous.map(FirestoreValue::into_kind) {
        Some(ValueKind::Array(array)) => array.into_values(),
        _ => Vec::new(),
    }
}

fn array_union(previous: Option<FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = existing_array(previous);
    for element in additions {
        if !values.iter().any(|candidate| candidate == element) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(previous: Option<FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = existing_array(previous)
        .into_iter()
        .filter(|candidate| !removals.iter().any(|needle| needle == candidate))
        .collect();
    FirestoreValue::from_array(values)
}

/// Non-numeric base values count as integer zero. Integer overflow falls back to a double.
fn numeric_increment(previous: Option<FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let base = match previous.as_ref().map(FirestoreValue::kind) {
        Some(ValueKind::Integer(value)) => ValueKind::Integer(*value),
        Some(ValueKind::Double(value)) => ValueKind::Double(*value),
        _ => ValueKind::Integer(0),
    };

    match (base, operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => match current.checked_add(*delta) {
            Some(sum) => FirestoreValue::from_integer(sum),
            None => FirestoreValue::from_double(current as f64 + *delta as f64),
        },
        (ValueKind::Integer(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(current as f64 + delta)
        }
        (ValueKind::Double(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_double(current + *delta as f64)
        }
        (ValueKind::Double(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(current + delta)
        }
        (base, _) => FirestoreValue::from_kind(base),
    }
}

/// Builds the single mutation that turns the remote document into the local view `document`.
///
/// `mask` is the result of folding every pending mutation through
/// [`Mutation::apply_to_local_view`]. Returns `None` when the document has no local
/// mutations or no field was touched.
pub fn calculate_overlay_mutation(
    document: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }

    let Some(mask) = mask else {
        return Some(if document.is_no_document() {
            Mutation::delete(document.key().clone())
        } else {
            Mutation::set(document.key().clone(), document.data().clone())
        });
    };

    if mask.is_empty() {
        return None;
    }

    let mut patch = ObjectValue::empty();
    let mut fields = Vec::new();
    for path in mask.fields() {
        if fields.iter().any(|existing: &FieldPath| existing == path) {
            continue;
        }
        let mut path = path.clone();
        let mut value = document.field(&path).cloned();
        // A deleted nested field is expressed through its parent.
        if value.is_none() {
            if let Some(parent) = path.without_last() {
                value = document.field(&parent).cloned();
                path = parent;
            }
        }
        match value {
            Some(value) => patch.set(&path, value),
            None => patch.delete(&path),
        }
        fields.push(path);
    }

    Some(Mutation::new(
        document.key().clone(),
        MutationKind::Patch {
            data: patch,
            mask: FieldMask::new(fields),
        },
        Precondition::None,
        Vec::new(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn object(entries: &[(&str, FirestoreValue)]) -> ObjectValue {
        let mut value = ObjectValue::empty();
        for (path, entry) in entries {
            value.set(&field(path), entry.clone());
        }
        value
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[test]
    fn set_replaces_local_view() {
        let mut doc = MutableDocument::new_found_document(
            key("rooms/a"),
            version(1),
            object(&[("x", 1.into()), ("y", 2.into())]),
        );
        let mask = Mutation::set(key("rooms/a"), object(&[("x", 5.into())])).apply_to_local_view(
            &mut doc,
            Some(FieldMask::empty()),
            Timestamp::now(),
        );
        assert!(mask.is_none());
        assert!(doc.has_local_mutations());
        assert_eq!(doc.data(), &object(&[("x", 5.into())]));
    }

    #[test]
    fn patch_requires_existing_document() {
        let mut doc = MutableDocument::new_invalid_document(key("rooms/a"));
        let mutation = Mutation::patch(
            key("rooms/a"),
            object(&[("x", 1.into())]),
            FieldMask::new(vec![field("x")]),
        );
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(mask, Some(FieldMask::empty()));
        assert!(!doc.is_valid_document());
    }

    #[test]
    fn patch_deletes_masked_fields_missing_from_data() {
        let mut doc = MutableDocument::new_found_document(
            key("rooms/a"),
            version(1),
            object(&[("x", 1.into()), ("y", 2.into())]),
        );
        let mutation = Mutation::patch(
            key("rooms/a"),
            object(&[("x", 3.into())]),
            FieldMask::new(vec![field("x"), field("y")]),
        );
        let mask = mutation
            .apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now())
            .unwrap();
        assert_eq!(doc.data(), &object(&[("x", 3.into())]));
        assert_eq!(mask.fields().len(), 2);
    }

    #[test]
    fn acknowledged_patch_on_missing_document_is_unknown() {
        let mut doc = MutableDocument::new_invalid_document(key("rooms/a"));
        let mutation = Mutation::patch(
            key("rooms/a"),
            object(&[("x", 1.into())]),
            FieldMask::new(vec![field("x")]),
        );
        mutation.apply_to_remote_document(&mut doc, &MutationResult::new(version(5), vec![]));
        assert!(doc.is_unknown_document());
        assert_eq!(doc.version(), version(5));
    }

    #[test]
    fn transforms_use_server_results_except_array_operations() {
        let mut doc = MutableDocument::new_found_document(
            key("rooms/a"),
            version(1),
            object(&[
                ("tags", FirestoreValue::from_array(vec!["a".into()])),
                ("count", 1.into()),
            ]),
        );
        let mutation = Mutation::patch(key("rooms/a"), ObjectValue::empty(), FieldMask::empty())
            .with_transforms(vec![
                FieldTransform::new(
                    field("tags"),
                    TransformOperation::ArrayUnion(vec!["b".into()]),
                ),
                FieldTransform::new(field("count"), TransformOperation::NumericIncrement(2.into())),
            ]);
        mutation.apply_to_remote_document(
            &mut doc,
            &MutationResult::new(version(2), vec![FirestoreValue::null(), 10.into()]),
        );
        assert_eq!(
            doc.field(&field("tags")),
            Some(&FirestoreValue::from_array(vec!["a".into(), "b".into()]))
        );
        assert_eq!(doc.field(&field("count")), Some(&10.into()));
        assert!(doc.has_committed_mutations());
    }

    #[test]
    fn numeric_increment_overflows_to_double() {
        let result = numeric_increment(Some(i64::MAX.into()), &1.into());
        assert_eq!(result, FirestoreValue::from_double(i64::MAX as f64 + 1.0));
        let from_string = numeric_increment(Some("text".into()), &3.into());
        assert_eq!(from_string, 3.into());
    }

    #[test]
    fn server_timestamp_local_estimate_keeps_previous_value() {
        let mut doc = MutableDocument::new_found_document(
            key("rooms/a"),
            version(1),
            object(&[("at", 7.into())]),
        );
        let write_time = Timestamp::new(100, 0);
        let mutation = Mutation::patch(key("rooms/a"), ObjectValue::empty(), FieldMask::empty())
            .with_transforms(vec![FieldTransform::new(
                field("at"),
                TransformOperation::ServerTimestamp,
            )]);
        mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), write_time);
        match doc.field(&field("at")).map(FirestoreValue::kind) {
            Some(ValueKind::ServerTimestamp {
                local_write_time,
                previous,
            }) => {
                assert_eq!(*local_write_time, write_time);
                assert_eq!(previous.as_deref(), Some(&7.into()));
            }
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn overlay_for_nested_delete_uses_parent_path() {
        let mut doc = MutableDocument::new_found_document(
            key("rooms/a"),
            version(1),
            object(&[("a.b", 1.into()), ("a.c", 2.into())]),
        );
        let mutation = Mutation::patch(
            key("rooms/a"),
            ObjectValue::empty(),
            FieldMask::new(vec![field("a.b")]),
        );
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        let overlay = calculate_overlay_mutation(&doc, mask.as_ref()).unwrap();
        match overlay.kind() {
            MutationKind::Patch { data, mask } => {
                assert_eq!(mask.fields(), &[field("a")]);
                assert!(data.field(&field("a.b")).is_none());
                assert_eq!(data.field(&field("a.c")), Some(&2.into()));
            }
            other => panic!("unexpected overlay {other:?}"),
        }
    }

    #[test]
    fn overlay_for_full_write_is_set_or_delete() {
        let mut doc = MutableDocument::new_invalid_document(key("rooms/a"));
        Mutation::delete(key("rooms/a")).apply_to_local_view(&mut doc, None, Timestamp::now());
        let overlay = calculate_overlay_mutation(&doc, None).unwrap();
        assert_eq!(overlay.kind(), &MutationKind::Delete);
    }
}

use std::collections::BTreeMap;

use crate::model::{FieldMask, FieldPath};
use crate::value::{FirestoreValue, MapValue, ValueKind};

/// Document contents addressed by [`FieldPath`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectValue {
    value: MapValue,
}

impl ObjectValue {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(value: MapValue) -> Self {
        Self { value }
    }

    pub fn from_fields(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self::new(MapValue::new(fields))
    }

    pub fn map_value(&self) -> &MapValue {
        &self.value
    }

    pub fn into_map_value(self) -> MapValue {
        self.value
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (last, parents) = path.segments().split_last()?;
        let mut current = &self.value;
        for segment in parents {
            current = current.get(segment)?.as_map()?;
        }
        current.get(last)
    }

    /// Writes `value` at `path`, replacing non-map intermediate values with maps.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_at_segments(self.value.fields_mut(), path.segments(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        delete_at_segments(self.value.fields_mut(), path.segments());
    }

    /// Applies a batch of writes; `None` deletes the field.
    pub fn set_all(&mut self, data: BTreeMap<FieldPath, Option<FirestoreValue>>) {
        for (path, value) in data {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    /// Leaf paths of the object. Empty nested maps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut fields = Vec::new();
        collect_leaf_paths(&self.value, &[], &mut fields);
        FieldMask::new(fields)
    }
}

fn set_at_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let mut child = match fields.remove(first).map(FirestoreValue::into_kind) {
        Some(ValueKind::Map(map)) => map.into_fields(),
        _ => BTreeMap::new(),
    };
    set_at_segments(&mut child, rest, value);
    fields.insert(first.clone(), FirestoreValue::from_map(child));
}

fn delete_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }

    if let Some(existing) = fields.get(first) {
        if let ValueKind::Map(map) = existing.kind() {
            let mut child = map.fields().clone();
            delete_at_segments(&mut child, rest);
            fields.insert(first.clone(), FirestoreValue::from_map(child));
        }
    }
}

fn collect_leaf_paths(map: &MapValue, prefix: &[String], out: &mut Vec<FieldPath>) {
    for (key, value) in map.fields() {
        let mut segments = prefix.to_vec();
        segments.push(key.clone());
        match value.kind() {
            ValueKind::Map(child) if !child.is_empty() => {
                collect_leaf_paths(child, &segments, out)
            }
            _ => {
                if let Ok(path) = FieldPath::new(segments) {
                    out.push(path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn set_creates_intermediate_maps() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b.c"), FirestoreValue::from_integer(1));
        assert_eq!(
            object.field(&path("a.b.c")),
            Some(&FirestoreValue::from_integer(1))
        );

        object.set(&path("a.b"), FirestoreValue::from_string("flat"));
        object.set(&path("a.b.d"), FirestoreValue::from_bool(true));
        assert!(object.field(&path("a.b.c")).is_none());
        assert_eq!(
            object.field(&path("a.b.d")),
            Some(&FirestoreValue::from_bool(true))
        );
    }

    #[test]
    fn delete_keeps_empty_parent_maps() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b"), FirestoreValue::from_integer(1));
        object.delete(&path("a.b"));
        assert!(object.field(&path("a.b")).is_none());
        assert!(object.field(&path("a")).is_some());
    }

    #[test]
    fn field_mask_lists_leaves() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b"), FirestoreValue::from_integer(1));
        object.set(&path("c"), FirestoreValue::from_map(BTreeMap::new()));
        let mask = object.field_mask();
        assert_eq!(mask.fields().len(), 2);
        assert!(mask.covers(&path("a.b")));
        assert!(mask.covers(&path("c")));
        assert!(!mask.covers(&path("a")));
    }
}

mod array_value;
mod bytes_value;
pub mod compare;
mod map_value;
mod object_value;
mod value;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use compare::{canonical_id, compare_values, values_equal};
pub use map_value::MapValue;
pub use object_value::ObjectValue;
pub use value::{FirestoreValue, ValueKind};

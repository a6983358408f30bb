//! Runtime shims that hide the differences between native and wasm targets.

pub mod runtime;

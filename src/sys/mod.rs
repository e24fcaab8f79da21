//! Raw FFI layer.
//!
//! Types, constants and function-table slot numbers. Nothing here calls into
//! the VM; see [`crate::vm`] and [`crate::env`] for the bound layer.

pub mod jni;

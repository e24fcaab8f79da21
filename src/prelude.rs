//! Common imports.
//!
//! ```rust,ignore
//! use dalvik_bridge::prelude::*;
//! ```

pub use crate::capability::{ExportEnumerator, ExportKind, RequiredExport};
pub use crate::class_factory::{ClassFactory, Instance, WrapperType};
pub use crate::env::{Env, GlobalRef, LocalFrame, LocalRef};
pub use crate::error::{Error, Result};
pub use crate::method::{Dispatcher, MethodDescriptor, MethodKind, MethodShape};
pub use crate::runtime::{Runtime, RuntimeConfig};
pub use crate::sys::jni;
pub use crate::types::{NativeType, NativeValue, Value};
pub use crate::vm::JavaVm;

#[cfg(feature = "callbacks")]
pub use crate::callback::NativeCallback;

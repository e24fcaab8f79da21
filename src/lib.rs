//! # dalvik-bridge
//!
//! Reflective access to a running Dalvik VM from Rust, without generated
//! bindings.
//!
//! Given a class name, the bridge reflects the class's constructors and
//! methods at runtime, builds a proxy type for it and dispatches calls
//! through the VM's JNI function table. Foreign exceptions become
//! [`Error::ForeignException`] and reference lifetimes follow Rust
//! ownership.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dalvik_bridge::prelude::*;
//!
//! let runtime = dalvik_bridge::dalvik();  // feature "dlopen"
//! if runtime.available() {
//!     runtime.perform(|_env| {
//!         let string = runtime.use_class("java.lang.String")?;
//!         let s = string.new_instance(&["Hello Java!".into()])?;
//!         println!("{}", s.to_host_string()?);
//!         Ok(())
//!     })?;
//! }
//! ```
//!
//! Inside a library loaded by the VM, start from the `JavaVM*` given to
//! `JNI_OnLoad` with [`Runtime::from_java_vm`] instead.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Runtime Facade                        │
//! │   Runtime: available, perform, use_class, cast,          │
//! │            implement (feature "callbacks")               │
//! ├─────────────────────────────────────────────────────────┤
//! │            Class Factory + Dispatch                      │
//! │   ClassFactory, WrapperType, Instance                    │
//! │   Dispatcher, MethodDescriptor (method module)           │
//! │   TypeDescriptor registry (types module)                 │
//! ├─────────────────────────────────────────────────────────┤
//! │              Bound Layer (vm, env modules)               │
//! │   JavaVm: attach / detach / get_env                      │
//! │   Env: lazily bound JNI entry points                     │
//! │   LocalFrame, LocalRef, GlobalRef - RAII guards          │
//! ├─────────────────────────────────────────────────────────┤
//! │   capability - export resolution   sys::jni - raw ABI    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`sys::jni`] | Raw JNI types and numbered function-table slots |
//! | [`capability`] | Locating the VM's exports |
//! | [`vm`] | VM handle and thread attachment |
//! | [`env`] | Per-thread environment and reference guards |
//! | [`types`] | Type marshaling registry and host values |
//! | [`method`] | Method descriptors and overload dispatch |
//! | [`class_factory`] | Wrapper types and instances |
//! | [`runtime`] | **Start here** |
//!
//! ## Features
//!
//! - `dlopen`: [`dalvik()`] and [`capability::LibraryExports`], resolving
//!   exports through the dynamic loader (`libloading`).
//! - `callbacks`: [`Runtime::implement`] builds native trampolines (`libffi`).
//!
//! Both are off by default. A default build has no `Runtime::implement` and
//! no `callback` module; enable `callbacks` to synthesize native callables.
//!
//! ## Limitations
//!
//! - Overloads are resolved by first structural match in reflection order.
//! - Array marshaling is not implemented. Members taking array parameters
//!   are not exposed; array results fail with [`Error::NotImplemented`].

pub mod capability;
pub mod class_factory;
pub mod env;
pub mod error;
pub mod method;
pub mod prelude;
pub mod runtime;
pub mod sys;
pub mod types;
pub mod vm;

#[cfg(feature = "callbacks")]
pub mod callback;

pub use class_factory::{ClassFactory, Instance, WrapperType};
pub use error::{Error, Result};
pub use runtime::{Runtime, RuntimeConfig};
pub use types::Value;

#[cfg(feature = "dlopen")]
pub use runtime::dalvik;

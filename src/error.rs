//! Error type shared by every layer of the bridge.

use crate::sys::jni;

/// Errors raised by the bridge.
///
/// All errors are raised synchronously by the operation that detects them
/// and none are retried. A [`Error::ForeignException`] has already had the
/// pending exception cleared, so the environment stays usable.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Dalvik runtime not available")]
    UnavailableRuntime,

    #[error("Class '{0}' is not loaded")]
    ClassNotLoaded(String),

    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    #[error("Argument count does not match any overload")]
    OverloadArityMismatch,

    #[error("Argument types do not match any overload")]
    OverloadArgumentMismatch,

    #[error("Out of memory: unable to reserve {0} local references")]
    OutOfLocalReferenceSpace(jni::jint),

    /// Carries the `toString()` of the pending throwable.
    #[error("{0}")]
    ForeignException(String),

    #[error("{operation} failed: {code}")]
    Jni { operation: &'static str, code: jni::jint },

    #[error("function table slot {slot} is null")]
    MissingEntryPoint { slot: usize },

    #[error("Not yet implemented ({0})")]
    NotImplemented(String),

    #[error("invalid name (interior NUL byte): {0:?}")]
    InvalidName(String),

    #[error("'{0}' is an instance method and this proxy has no instance")]
    MissingReceiver(String),

    #[error("{class} has no method named '{method}'")]
    NoSuchMethod { class: String, method: String },

    #[error("native callback: {0}")]
    Callback(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Maps a VM-level status code to `Ok(())` or [`Error::Jni`].
pub(crate) fn check_jni_result(operation: &'static str, code: jni::jint) -> Result<()> {
    if code == jni::JNI_OK {
        Ok(())
    } else {
        Err(Error::Jni { operation, code })
    }
}

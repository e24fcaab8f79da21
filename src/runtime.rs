//! Top-level entry point.
//!
//! A [`Runtime`] resolves the VM's exports on first access, finds the
//! process's `JavaVM*` through them and owns the class factory. Everything
//! else goes through [`Runtime::perform`], which makes sure the calling
//! thread is attached for the duration of a closure.

use std::fmt;

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::capability::{self, CapabilityTable, ExportEnumerator, RequiredExport};
use crate::class_factory::{ClassFactory, Instance, WrapperType};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::sys::jni;
use crate::vm::JavaVm;

#[cfg(feature = "callbacks")]
use crate::callback::NativeCallback;
#[cfg(feature = "callbacks")]
use crate::method::MethodShape;
#[cfg(feature = "callbacks")]
use crate::types::NativeValue;

/// Mangled name of `dvmFindLoadedClass(const char*)`.
pub const FIND_LOADED_CLASS_SYMBOL: &str = "_Z18dvmFindLoadedClassPKc";
pub const FIND_LOADED_CLASS: &str = "dvmFindLoadedClass";
/// Exported `JNIInvokeInterface` globals of the Dalvik VM.
pub const DVM_JNI_VARIABLE: &str = "gDvmJni";

/// Where and how to find the VM.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    module: String,
    required: Vec<RequiredExport>,
    vm_variable: String,
    vm_pointer_offset: usize,
    jni_version: jni::jint,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            module: "libdvm.so".to_string(),
            required: vec![
                RequiredExport::function(FIND_LOADED_CLASS_SYMBOL, FIND_LOADED_CLASS),
                RequiredExport::variable(DVM_JNI_VARIABLE),
            ],
            vm_variable: DVM_JNI_VARIABLE.to_string(),
            vm_pointer_offset: 8,
            jni_version: jni::JNI_VERSION_1_6,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Module whose exports are enumerated.
    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    /// Replaces the required export set.
    pub fn required(mut self, required: Vec<RequiredExport>) -> Self {
        self.required = required;
        self
    }

    /// Names the exported variable holding the `JavaVM*`, and the byte
    /// offset of the pointer inside it. The variable must be required.
    pub fn vm_pointer(mut self, variable: impl Into<String>, offset: usize) -> Self {
        self.vm_variable = variable.into();
        self.vm_pointer_offset = offset;
        self
    }

    pub fn jni_version(mut self, version: jni::jint) -> Self {
        self.jni_version = version;
        self
    }

    pub fn module_name(&self) -> &str {
        &self.module
    }

    pub fn required_exports(&self) -> &[RequiredExport] {
        &self.required
    }
}

struct Bridge {
    capabilities: CapabilityTable,
    vm: JavaVm,
    factory: ClassFactory,
}

impl Bridge {
    fn new(capabilities: CapabilityTable, vm: JavaVm) -> Self {
        let factory = ClassFactory::new(vm.clone());
        Bridge { capabilities, vm, factory }
    }
}

/// The bridge's public surface.
pub struct Runtime {
    config: RuntimeConfig,
    enumerator: Option<Box<dyn ExportEnumerator + Send + Sync>>,
    bridge: OnceCell<Option<Bridge>>,
}

impl Runtime {
    /// Creates a runtime that locates the VM through `enumerator` on first
    /// access.
    pub fn new(config: RuntimeConfig, enumerator: impl ExportEnumerator + Send + Sync + 'static) -> Self {
        Runtime { config, enumerator: Some(Box::new(enumerator)), bridge: OnceCell::new() }
    }

    /// Creates a runtime over a VM the caller already holds, e.g. the one
    /// passed to `JNI_OnLoad`. No exports are resolved.
    ///
    /// # Safety
    /// `vm` must point to a live VM for the lifetime of the runtime.
    pub unsafe fn from_java_vm(vm: *mut jni::JavaVM, version: jni::jint) -> Self {
        let vm = JavaVm::from_raw(vm, version);
        Runtime {
            config: RuntimeConfig::default().jni_version(version),
            enumerator: None,
            bridge: OnceCell::with_value(Some(Bridge::new(CapabilityTable::default(), vm))),
        }
    }

    fn bridge(&self) -> Option<&Bridge> {
        self.bridge.get_or_init(|| self.resolve()).as_ref()
    }

    fn resolve(&self) -> Option<Bridge> {
        let enumerator = self.enumerator.as_deref()?;
        let capabilities = capability::resolve(enumerator, &self.config.module, &self.config.required)?;
        let variable = capabilities.variable(&self.config.vm_variable)?;
        let raw = unsafe { variable.add(self.config.vm_pointer_offset).read_pointer() };
        if raw.is_null() {
            debug!(variable = %self.config.vm_variable, "VM pointer is null");
            return None;
        }
        let vm = unsafe { JavaVm::from_raw(raw as *mut jni::JavaVM, self.config.jni_version) };
        debug!(?vm, "bridge available");
        Some(Bridge::new(capabilities, vm))
    }

    fn require(&self) -> Result<&Bridge> {
        self.bridge().ok_or(Error::UnavailableRuntime)
    }

    /// True when every required export resolved.
    pub fn available(&self) -> bool {
        self.bridge().is_some()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Option<&CapabilityTable> {
        self.bridge().map(|b| &b.capabilities)
    }

    pub fn vm(&self) -> Option<&JavaVm> {
        self.bridge().map(|b| &b.vm)
    }

    pub fn class_factory(&self) -> Result<&ClassFactory> {
        self.require().map(|b| &b.factory)
    }

    /// Runs `f` with the current thread attached.
    ///
    /// Attaches only if the thread is not attached yet, and then detaches
    /// when `f` returns, fails or panics. Fails without calling `f` when the
    /// runtime is unavailable.
    pub fn perform<T>(&self, f: impl FnOnce(Env<'_>) -> Result<T>) -> Result<T> {
        let bridge = self.require()?;
        let attachment = bridge.vm.attach_scoped()?;
        f(attachment.env())
    }

    /// Resolves a class by dotted name; see [`ClassFactory::use_class`].
    pub fn use_class(&self, class_name: &str) -> Result<Instance> {
        self.require()?.factory.use_class(class_name)
    }

    /// See [`ClassFactory::cast`].
    pub fn cast(&self, handle: jni::jobject, class: &std::sync::Arc<WrapperType>) -> Result<Instance> {
        self.require()?.factory.cast(handle, class)
    }

    /// Builds a native-callable trampoline of the given shape that runs
    /// `procedure`. Registering it with the VM is up to the caller.
    ///
    /// Only available with the `callbacks` feature.
    #[cfg(feature = "callbacks")]
    pub fn implement<F>(&self, shape: &MethodShape, procedure: F) -> Result<NativeCallback>
    where
        F: Fn(&[NativeValue]) -> NativeValue + Send + Sync + 'static,
    {
        NativeCallback::new(shape.clone(), procedure)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("module", &self.config.module)
            .field("available", &self.bridge.get().map(Option::is_some))
            .finish()
    }
}

/// The process-wide runtime for the Dalvik VM, located through the dynamic
/// loader.
#[cfg(feature = "dlopen")]
pub fn dalvik() -> &'static Runtime {
    static DALVIK: std::sync::OnceLock<Runtime> = std::sync::OnceLock::new();
    DALVIK.get_or_init(|| {
        let config = RuntimeConfig::default();
        let exports = capability::LibraryExports::for_required(config.required_exports());
        Runtime::new(config, exports)
    })
}

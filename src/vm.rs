//! The foreign VM handle and thread attachment.
//!
//! A [`JavaVm`] wraps the process's single `JavaVM*`. Its thread-management
//! entry points are bound lazily from the VM function table on first use, and
//! the memoized environment function table is shared by every [`Env`]
//! created from it.

use std::ffi::c_void;
use std::ptr;
use std::sync::{Arc, OnceLock};

use tracing::{debug, warn};

use crate::env::{Env, Reflection};
use crate::error::{check_jni_result, Error, Result};
use crate::sys::jni::{self, env_slots, vm_slots};

/// Lazily bound entry points of one function table.
///
/// The table pointer is read once from the first handle seen, and each slot
/// is read once on first use. All environments of a VM share one table.
pub(crate) struct FunctionSlots {
    table: OnceLock<usize>,
    slots: Box<[OnceLock<usize>]>,
}

impl FunctionSlots {
    pub(crate) fn new(count: usize) -> Self {
        FunctionSlots {
            table: OnceLock::new(),
            slots: (0..count).map(|_| OnceLock::new()).collect(),
        }
    }

    /// Returns the entry point at `slot`, typed as `F`.
    ///
    /// # Safety
    /// `handle` must be a live `JNIEnv*` or `JavaVM*` (matching this table)
    /// and `F` must be the function pointer type of that slot.
    pub(crate) unsafe fn bind<F: Copy>(&self, handle: *mut jni::FunctionTable, slot: usize) -> Result<F> {
        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<usize>());
        let cell = self.slots.get(slot).ok_or(Error::MissingEntryPoint { slot })?;
        let address = match cell.get() {
            Some(address) => *address,
            None => {
                let table = *self.table.get_or_init(|| *handle as usize) as *const *const c_void;
                let address = *table.add(slot) as usize;
                if address == 0 {
                    return Err(Error::MissingEntryPoint { slot });
                }
                *cell.get_or_init(|| address)
            }
        };
        Ok(std::mem::transmute_copy(&address))
    }
}

struct VmInner {
    raw: usize,
    version: jni::jint,
    functions: FunctionSlots,
    env_functions: FunctionSlots,
    reflection: Reflection,
}

/// Handle to the foreign VM.
///
/// Cheap to clone; clones share the bound entry points and caches.
#[derive(Clone)]
pub struct JavaVm {
    inner: Arc<VmInner>,
}

impl JavaVm {
    /// Wraps a raw `JavaVM*`.
    ///
    /// `version` is the JNI version requested from `GetEnv`.
    ///
    /// # Safety
    /// `vm` must point to a live VM that outlives every use of this handle.
    pub unsafe fn from_raw(vm: *mut jni::JavaVM, version: jni::jint) -> Self {
        JavaVm {
            inner: Arc::new(VmInner {
                raw: vm as usize,
                version,
                functions: FunctionSlots::new(vm_slots::COUNT),
                env_functions: FunctionSlots::new(env_slots::COUNT),
                reflection: Reflection::default(),
            }),
        }
    }

    /// Returns the raw `JavaVM*` pointer.
    pub fn raw(&self) -> *mut jni::JavaVM {
        self.inner.raw as *mut jni::JavaVM
    }

    pub fn version(&self) -> jni::jint {
        self.inner.version
    }

    pub(crate) fn env_functions(&self) -> &FunctionSlots {
        &self.inner.env_functions
    }

    pub(crate) fn reflection(&self) -> &Reflection {
        &self.inner.reflection
    }

    fn bind<F: Copy>(&self, slot: usize) -> Result<F> {
        unsafe { self.inner.functions.bind(self.raw(), slot) }
    }

    /// Attaches the current thread and returns its environment.
    pub fn attach_current_thread(&self) -> Result<Env<'_>> {
        let attach: jni::AttachCurrentThreadFn = self.bind(vm_slots::ATTACH_CURRENT_THREAD)?;
        let mut env: *mut c_void = ptr::null_mut();
        let code = unsafe { attach(self.raw(), &mut env, ptr::null_mut()) };
        check_jni_result("VM::AttachCurrentThread", code)?;
        debug!(thread = ?std::thread::current().id(), "attached thread to VM");
        Ok(unsafe { Env::from_raw(env as *mut jni::JNIEnv, self) })
    }

    /// Detaches the current thread.
    pub fn detach_current_thread(&self) -> Result<()> {
        let detach: jni::DetachCurrentThreadFn = self.bind(vm_slots::DETACH_CURRENT_THREAD)?;
        let code = unsafe { detach(self.raw()) };
        check_jni_result("VM::DetachCurrentThread", code)?;
        debug!(thread = ?std::thread::current().id(), "detached thread from VM");
        Ok(())
    }

    /// Returns the current thread's environment, failing if it is not attached.
    pub fn get_env(&self) -> Result<Env<'_>> {
        let (code, env) = self.raw_get_env()?;
        check_jni_result("VM::GetEnv", code)?;
        Ok(unsafe { Env::from_raw(env, self) })
    }

    /// Like [`get_env`](Self::get_env) but returns `None` when the current
    /// thread is not attached.
    pub fn try_get_env(&self) -> Result<Option<Env<'_>>> {
        let (code, env) = self.raw_get_env()?;
        if code != jni::JNI_OK || env.is_null() {
            return Ok(None);
        }
        Ok(Some(unsafe { Env::from_raw(env, self) }))
    }

    fn raw_get_env(&self) -> Result<(jni::jint, *mut jni::JNIEnv)> {
        let get_env: jni::GetEnvFn = self.bind(vm_slots::GET_ENV)?;
        let mut env: *mut c_void = ptr::null_mut();
        let code = unsafe { get_env(self.raw(), &mut env, self.inner.version) };
        Ok((code, env as *mut jni::JNIEnv))
    }

    /// Makes sure the current thread is attached for the lifetime of the
    /// returned guard.
    ///
    /// A thread that was already attached is left attached; otherwise the
    /// guard owns the attachment and detaches when dropped, including during
    /// unwinding.
    pub fn attach_scoped(&self) -> Result<ThreadAttachment<'_>> {
        if let Some(env) = self.try_get_env()? {
            return Ok(ThreadAttachment { env, owned: false });
        }
        let env = self.attach_current_thread()?;
        Ok(ThreadAttachment { env, owned: true })
    }
}

impl std::fmt::Debug for JavaVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JavaVm")
            .field("raw", &self.raw())
            .field("version", &format_args!("{:#x}", self.inner.version))
            .finish()
    }
}

/// Scoped thread attachment returned by [`JavaVm::attach_scoped`].
pub struct ThreadAttachment<'vm> {
    env: Env<'vm>,
    owned: bool,
}

impl<'vm> ThreadAttachment<'vm> {
    pub fn env(&self) -> Env<'vm> {
        self.env
    }

    /// Whether dropping this guard detaches the thread.
    pub fn is_owned(&self) -> bool {
        self.owned
    }
}

impl Drop for ThreadAttachment<'_> {
    fn drop(&mut self) {
        if self.owned {
            if let Err(e) = self.env.vm().detach_current_thread() {
                warn!(error = %e, "failed to detach thread");
            }
        }
    }
}

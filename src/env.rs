//! Per-thread JNI environment.
//!
//! [`Env`] wraps a `JNIEnv*` and binds each entry point it needs lazily from
//! the environment function table at its fixed slot. It is tied to the thread
//! it was obtained on and is neither `Send` nor `Sync`.
//!
//! # Reference discipline
//!
//! - [`LocalFrame`] reserves a local-reference frame and pops it exactly once
//!   when dropped, on every exit path.
//! - [`LocalRef`] deletes a local reference when dropped.
//! - [`GlobalRef`] deletes a global reference when dropped, attaching the
//!   dropping thread for the call if it is not attached.
//!
//! ```rust,ignore
//! let env = vm.get_env()?;
//! let _frame = env.push_local_frame(4)?;
//! let class = LocalRef::new(env, env.find_class("java/lang/String")?);
//! let name = env.get_class_name(class.get())?;
//! // frame popped here
//! ```

use std::ffi::CString;
use std::ptr;

use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::sys::jni::{self, env_slots as slot};
use crate::types::{NativeType, NativeValue};
use crate::vm::JavaVm;

/// A method identifier. Valid on every thread for the lifetime of its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId(usize);

impl MethodId {
    pub fn from_raw(id: jni::jmethodID) -> Self {
        MethodId(id as usize)
    }

    pub fn as_raw(self) -> jni::jmethodID {
        self.0 as jni::jmethodID
    }
}

/// Cached reflection members of `java.lang.Class`.
#[derive(Debug)]
pub struct JavaLangClass {
    pub get_name: MethodId,
    pub get_declared_constructors: MethodId,
    pub get_declared_methods: MethodId,
}

/// Cached members of `java.lang.Object`.
#[derive(Debug)]
pub struct JavaLangObject {
    pub to_string: MethodId,
}

/// Cached members of `java.lang.reflect.Constructor`.
#[derive(Debug)]
pub struct JavaLangReflectConstructor {
    handle: usize,
    pub get_parameter_types: MethodId,
}

impl JavaLangReflectConstructor {
    /// Global reference to the class, held for the life of the process.
    pub fn handle(&self) -> jni::jclass {
        self.handle as jni::jclass
    }
}

/// Cached members of `java.lang.reflect.Method`.
#[derive(Debug)]
pub struct JavaLangReflectMethod {
    pub get_name: MethodId,
    pub get_modifiers: MethodId,
    pub get_parameter_types: MethodId,
    pub get_return_type: MethodId,
}

/// Root-class metadata shared by every environment of a VM.
#[derive(Default)]
pub(crate) struct Reflection {
    class: OnceCell<JavaLangClass>,
    object: OnceCell<JavaLangObject>,
    constructor: OnceCell<JavaLangReflectConstructor>,
    method: OnceCell<JavaLangReflectMethod>,
}

/// Whether a call goes through the instance or the static call family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Instance,
    Static,
}

/// Safe wrapper around a JNI environment pointer.
#[derive(Clone, Copy)]
pub struct Env<'vm> {
    raw: *mut jni::JNIEnv,
    vm: &'vm JavaVm,
}

impl<'vm> Env<'vm> {
    /// Creates an Env wrapper from a raw pointer.
    ///
    /// # Safety
    ///
    /// The pointer must be the current thread's environment of `vm`.
    pub unsafe fn from_raw(raw: *mut jni::JNIEnv, vm: &'vm JavaVm) -> Self {
        Env { raw, vm }
    }

    /// Returns the raw JNI environment pointer.
    pub fn raw(&self) -> *mut jni::JNIEnv {
        self.raw
    }

    pub fn vm(&self) -> &'vm JavaVm {
        self.vm
    }

    fn bind<F: Copy>(&self, slot: usize) -> Result<F> {
        unsafe { self.vm.env_functions().bind(self.raw, slot) }
    }

    // =========================================================================
    // Classes
    // =========================================================================

    /// Finds a class by its slash-separated name (e.g. `java/lang/String`).
    ///
    /// Returns a null local reference if the class is not loaded.
    pub fn find_class(&self, name: &str) -> Result<jni::jclass> {
        let f: jni::FindClassFn = self.bind(slot::FIND_CLASS)?;
        let c_name = c_string(name)?;
        Ok(unsafe { f(self.raw, c_name.as_ptr()) })
    }

    /// Returns the superclass, or null for a rootless class.
    pub fn get_superclass(&self, class: jni::jclass) -> Result<jni::jclass> {
        let f: jni::GetSuperclassFn = self.bind(slot::GET_SUPERCLASS)?;
        Ok(unsafe { f(self.raw, class) })
    }

    pub fn from_reflected_method(&self, method: jni::jobject) -> Result<MethodId> {
        let f: jni::FromReflectedMethodFn = self.bind(slot::FROM_REFLECTED_METHOD)?;
        Ok(MethodId::from_raw(unsafe { f(self.raw, method) }))
    }

    /// Gets the method ID for an instance method. Null if absent.
    pub fn get_method_id(&self, class: jni::jclass, name: &str, sig: &str) -> Result<jni::jmethodID> {
        let f: jni::GetMethodIdFn = self.bind(slot::GET_METHOD_ID)?;
        let (c_name, c_sig) = (c_string(name)?, c_string(sig)?);
        Ok(unsafe { f(self.raw, class, c_name.as_ptr(), c_sig.as_ptr()) })
    }

    /// Gets the method ID for a static method. Null if absent.
    pub fn get_static_method_id(&self, class: jni::jclass, name: &str, sig: &str) -> Result<jni::jmethodID> {
        let f: jni::GetMethodIdFn = self.bind(slot::GET_STATIC_METHOD_ID)?;
        let (c_name, c_sig) = (c_string(name)?, c_string(sig)?);
        Ok(unsafe { f(self.raw, class, c_name.as_ptr(), c_sig.as_ptr()) })
    }

    fn require_method_id(&self, class: jni::jclass, name: &str, sig: &str) -> Result<MethodId> {
        let id = self.get_method_id(class, name, sig)?;
        if id.is_null() {
            self.check_exception()?;
            return Err(Error::ForeignException(format!("NoSuchMethodError: {name}{sig}")));
        }
        Ok(MethodId::from_raw(id))
    }

    fn require_class(&self, name: &str) -> Result<LocalRef<'vm>> {
        let class = self.find_class(name)?;
        if class.is_null() {
            self.exception_clear()?;
            return Err(Error::ClassNotLoaded(name.replace('/', ".")));
        }
        Ok(LocalRef::new(*self, class))
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    /// Gets the pending exception, or null.
    pub fn exception_occurred(&self) -> Result<jni::jthrowable> {
        let f: jni::ExceptionOccurredFn = self.bind(slot::EXCEPTION_OCCURRED)?;
        Ok(unsafe { f(self.raw) })
    }

    /// Prints the pending exception and stack trace to stderr.
    pub fn exception_describe(&self) -> Result<()> {
        let f: jni::ExceptionDescribeFn = self.bind(slot::EXCEPTION_DESCRIBE)?;
        unsafe { f(self.raw) };
        Ok(())
    }

    pub fn exception_clear(&self) -> Result<()> {
        let f: jni::ExceptionClearFn = self.bind(slot::EXCEPTION_CLEAR)?;
        unsafe { f(self.raw) };
        Ok(())
    }

    /// Converts a pending exception into [`Error::ForeignException`].
    ///
    /// The exception is cleared before it is described, so the environment
    /// is usable again when this returns.
    pub fn check_exception(&self) -> Result<()> {
        let throwable = self.exception_occurred()?;
        if throwable.is_null() {
            return Ok(());
        }
        self.exception_clear()?;
        let throwable = LocalRef::new(*self, throwable);
        let description = self.describe_throwable(throwable.get())?;
        debug!(%description, "foreign exception");
        Err(Error::ForeignException(description))
    }

    fn describe_throwable(&self, throwable: jni::jthrowable) -> Result<String> {
        let to_string = self.java_lang_object()?.to_string;
        let description = self.call_object_method(throwable, to_string, &[])?;
        if !self.exception_occurred()?.is_null() {
            self.exception_clear()?;
            return Ok("java.lang.Throwable (toString() failed)".to_string());
        }
        let description = LocalRef::new(*self, description);
        self.string_from_jni(description.get())
    }

    // =========================================================================
    // Reference Management
    // =========================================================================

    /// Reserves a local-reference frame with room for `capacity` references.
    ///
    /// On failure any pending exception is cleared and nothing else is done.
    pub fn push_local_frame(&self, capacity: jni::jint) -> Result<LocalFrame<'vm>> {
        let push: jni::PushLocalFrameFn = self.bind(slot::PUSH_LOCAL_FRAME)?;
        // Bound up front so a reserved frame can always be released.
        let _: jni::PopLocalFrameFn = self.bind(slot::POP_LOCAL_FRAME)?;
        if unsafe { push(self.raw, capacity) } != jni::JNI_OK {
            self.exception_clear()?;
            return Err(Error::OutOfLocalReferenceSpace(capacity));
        }
        Ok(LocalFrame { env: *self })
    }

    /// Pops the current frame, returning `result` translated into the
    /// previous one. Prefer letting a [`LocalFrame`] drop.
    pub fn pop_local_frame(&self, result: jni::jobject) -> Result<jni::jobject> {
        let f: jni::PopLocalFrameFn = self.bind(slot::POP_LOCAL_FRAME)?;
        Ok(unsafe { f(self.raw, result) })
    }

    /// Creates a global reference owned by the returned guard.
    pub fn new_global_ref(&self, obj: jni::jobject) -> Result<GlobalRef> {
        let f: jni::NewGlobalRefFn = self.bind(slot::NEW_GLOBAL_REF)?;
        let global = unsafe { f(self.raw, obj) };
        Ok(GlobalRef { vm: self.vm.clone(), obj: global as usize })
    }

    pub fn delete_global_ref(&self, obj: jni::jobject) -> Result<()> {
        let f: jni::DeleteGlobalRefFn = self.bind(slot::DELETE_GLOBAL_REF)?;
        unsafe { f(self.raw, obj) };
        Ok(())
    }

    pub fn new_local_ref(&self, obj: jni::jobject) -> Result<jni::jobject> {
        let f: jni::NewLocalRefFn = self.bind(slot::NEW_LOCAL_REF)?;
        Ok(unsafe { f(self.raw, obj) })
    }

    pub fn delete_local_ref(&self, obj: jni::jobject) -> Result<()> {
        let f: jni::DeleteLocalRefFn = self.bind(slot::DELETE_LOCAL_REF)?;
        unsafe { f(self.raw, obj) };
        Ok(())
    }

    /// Checks if two references refer to the same object.
    pub fn is_same_object(&self, a: jni::jobject, b: jni::jobject) -> Result<bool> {
        let f: jni::IsSameObjectFn = self.bind(slot::IS_SAME_OBJECT)?;
        Ok(unsafe { f(self.raw, a, b) } != jni::JNI_FALSE)
    }

    // =========================================================================
    // Strings and Arrays
    // =========================================================================

    /// Creates a string from UTF-16, so NUL and supplementary characters
    /// survive unchanged.
    pub fn new_string(&self, s: &str) -> Result<jni::jstring> {
        let f: jni::NewStringFn = self.bind(slot::NEW_STRING)?;
        let units: Vec<jni::jchar> = s.encode_utf16().collect();
        let len = jni::jsize::try_from(units.len()).map_err(|_| Error::UnsupportedType(format!("string of {} units", units.len())))?;
        Ok(unsafe { f(self.raw, units.as_ptr(), len) })
    }

    /// Decodes a string. A null reference decodes as `"null"`.
    pub fn string_from_jni(&self, s: jni::jstring) -> Result<String> {
        if s.is_null() {
            return Ok("null".to_string());
        }
        let length: jni::GetStringLengthFn = self.bind(slot::GET_STRING_LENGTH)?;
        let get: jni::GetStringCharsFn = self.bind(slot::GET_STRING_CHARS)?;
        let release: jni::ReleaseStringCharsFn = self.bind(slot::RELEASE_STRING_CHARS)?;
        unsafe {
            let len = length(self.raw, s).max(0) as usize;
            let chars = get(self.raw, s, ptr::null_mut());
            if chars.is_null() {
                self.check_exception()?;
                return Ok(String::new());
            }
            let result = String::from_utf16_lossy(std::slice::from_raw_parts(chars, len));
            release(self.raw, s, chars);
            Ok(result)
        }
    }

    pub fn get_array_length(&self, array: jni::jarray) -> Result<jni::jsize> {
        let f: jni::GetArrayLengthFn = self.bind(slot::GET_ARRAY_LENGTH)?;
        Ok(unsafe { f(self.raw, array) })
    }

    pub fn get_object_array_element(&self, array: jni::jobjectArray, index: jni::jsize) -> Result<jni::jobject> {
        let f: jni::GetObjectArrayElementFn = self.bind(slot::GET_OBJECT_ARRAY_ELEMENT)?;
        Ok(unsafe { f(self.raw, array, index) })
    }

    // =========================================================================
    // Method Calls
    // =========================================================================

    /// Allocates an object of `class` by running the constructor `method`.
    pub fn new_object(&self, class: jni::jclass, method: MethodId, args: &[jni::jvalue]) -> Result<jni::jobject> {
        let f: jni::CallMethodAFn<jni::jobject> = self.bind(slot::NEW_OBJECT_A)?;
        Ok(unsafe { f(self.raw, class, method.as_raw(), args.as_ptr()) })
    }

    /// Calls a method through the call family of `return_type`.
    ///
    /// `receiver` is the object for [`CallKind::Instance`] and the class for
    /// [`CallKind::Static`]. Pending exceptions are left for the caller.
    pub fn call_method(
        &self,
        kind: CallKind,
        return_type: NativeType,
        receiver: jni::jobject,
        method: MethodId,
        args: &[jni::jvalue],
    ) -> Result<NativeValue> {
        let family = call_family(kind, return_type);
        let slot = family + slot::ARRAY_VARIANT;
        let (env, id, argv) = (self.raw, method.as_raw(), args.as_ptr());

        macro_rules! call {
            ($ty:ty) => {{
                let f: jni::CallMethodAFn<$ty> = self.bind(slot)?;
                unsafe { f(env, receiver, id, argv) }
            }};
        }

        Ok(match return_type {
            NativeType::Void => {
                call!(());
                NativeValue::Void
            }
            NativeType::U8 => NativeValue::U8(call!(jni::jboolean)),
            NativeType::I8 => NativeValue::I8(call!(jni::jbyte)),
            NativeType::U16 => NativeValue::U16(call!(jni::jchar)),
            NativeType::I16 => NativeValue::I16(call!(jni::jshort)),
            NativeType::I32 => NativeValue::I32(call!(jni::jint)),
            NativeType::I64 => NativeValue::I64(call!(jni::jlong)),
            NativeType::F32 => NativeValue::F32(call!(jni::jfloat)),
            NativeType::F64 => NativeValue::F64(call!(jni::jdouble)),
            NativeType::Pointer => NativeValue::Pointer(call!(jni::jobject)),
        })
    }

    /// Calls an object-returning instance method.
    pub fn call_object_method(&self, obj: jni::jobject, method: MethodId, args: &[jni::jvalue]) -> Result<jni::jobject> {
        match self.call_method(CallKind::Instance, NativeType::Pointer, obj, method, args)? {
            NativeValue::Pointer(result) => Ok(result),
            _ => Ok(ptr::null_mut()),
        }
    }

    /// Returns `Class.getName()` of `class`, in dotted form.
    pub fn get_class_name(&self, class: jni::jclass) -> Result<String> {
        let get_name = self.java_lang_class()?.get_name;
        let name = self.call_object_method(class, get_name, &[])?;
        self.check_exception()?;
        let name = LocalRef::new(*self, name);
        self.string_from_jni(name.get())
    }

    // =========================================================================
    // Root-class metadata
    // =========================================================================

    pub fn java_lang_class(&self) -> Result<&'vm JavaLangClass> {
        self.vm.reflection().class.get_or_try_init(|| {
            let class = self.require_class("java/lang/Class")?;
            Ok(JavaLangClass {
                get_name: self.require_method_id(class.get(), "getName", "()Ljava/lang/String;")?,
                get_declared_constructors: self.require_method_id(
                    class.get(),
                    "getDeclaredConstructors",
                    "()[Ljava/lang/reflect/Constructor;",
                )?,
                get_declared_methods: self.require_method_id(
                    class.get(),
                    "getDeclaredMethods",
                    "()[Ljava/lang/reflect/Method;",
                )?,
            })
        })
    }

    pub fn java_lang_object(&self) -> Result<&'vm JavaLangObject> {
        self.vm.reflection().object.get_or_try_init(|| {
            let class = self.require_class("java/lang/Object")?;
            Ok(JavaLangObject {
                to_string: self.require_method_id(class.get(), "toString", "()Ljava/lang/String;")?,
            })
        })
    }

    pub fn java_lang_reflect_constructor(&self) -> Result<&'vm JavaLangReflectConstructor> {
        self.vm.reflection().constructor.get_or_try_init(|| {
            let class = self.require_class("java/lang/reflect/Constructor")?;
            let get_parameter_types =
                self.require_method_id(class.get(), "getParameterTypes", "()[Ljava/lang/Class;")?;
            let handle = self.new_global_ref(class.get())?.into_raw();
            Ok(JavaLangReflectConstructor { handle: handle as usize, get_parameter_types })
        })
    }

    pub fn java_lang_reflect_method(&self) -> Result<&'vm JavaLangReflectMethod> {
        self.vm.reflection().method.get_or_try_init(|| {
            let class = self.require_class("java/lang/reflect/Method")?;
            Ok(JavaLangReflectMethod {
                get_name: self.require_method_id(class.get(), "getName", "()Ljava/lang/String;")?,
                get_modifiers: self.require_method_id(class.get(), "getModifiers", "()I")?,
                get_parameter_types: self.require_method_id(
                    class.get(),
                    "getParameterTypes",
                    "()[Ljava/lang/Class;",
                )?,
                get_return_type: self.require_method_id(class.get(), "getReturnType", "()Ljava/lang/Class;")?,
            })
        })
    }
}

impl std::fmt::Debug for Env<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env").field("raw", &self.raw).finish()
    }
}

fn c_string(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::InvalidName(s.to_string()))
}

fn call_family(kind: CallKind, return_type: NativeType) -> usize {
    match (kind, return_type) {
        (CallKind::Instance, NativeType::Pointer) => slot::CALL_OBJECT_METHOD,
        (CallKind::Instance, NativeType::U8) => slot::CALL_BOOLEAN_METHOD,
        (CallKind::Instance, NativeType::I8) => slot::CALL_BYTE_METHOD,
        (CallKind::Instance, NativeType::U16) => slot::CALL_CHAR_METHOD,
        (CallKind::Instance, NativeType::I16) => slot::CALL_SHORT_METHOD,
        (CallKind::Instance, NativeType::I32) => slot::CALL_INT_METHOD,
        (CallKind::Instance, NativeType::I64) => slot::CALL_LONG_METHOD,
        (CallKind::Instance, NativeType::F32) => slot::CALL_FLOAT_METHOD,
        (CallKind::Instance, NativeType::F64) => slot::CALL_DOUBLE_METHOD,
        (CallKind::Instance, NativeType::Void) => slot::CALL_VOID_METHOD,
        (CallKind::Static, NativeType::Pointer) => slot::CALL_STATIC_OBJECT_METHOD,
        (CallKind::Static, NativeType::U8) => slot::CALL_STATIC_BOOLEAN_METHOD,
        (CallKind::Static, NativeType::I8) => slot::CALL_STATIC_BYTE_METHOD,
        (CallKind::Static, NativeType::U16) => slot::CALL_STATIC_CHAR_METHOD,
        (CallKind::Static, NativeType::I16) => slot::CALL_STATIC_SHORT_METHOD,
        (CallKind::Static, NativeType::I32) => slot::CALL_STATIC_INT_METHOD,
        (CallKind::Static, NativeType::I64) => slot::CALL_STATIC_LONG_METHOD,
        (CallKind::Static, NativeType::F32) => slot::CALL_STATIC_FLOAT_METHOD,
        (CallKind::Static, NativeType::F64) => slot::CALL_STATIC_DOUBLE_METHOD,
        (CallKind::Static, NativeType::Void) => slot::CALL_STATIC_VOID_METHOD,
    }
}

// =========================================================================
// Reference Guards (RAII wrappers)
// =========================================================================

/// A reserved local-reference frame, popped when dropped.
pub struct LocalFrame<'vm> {
    env: Env<'vm>,
}

impl Drop for LocalFrame<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.env.pop_local_frame(ptr::null_mut()) {
            warn!(error = %e, "failed to pop local frame");
        }
    }
}

/// A guard that automatically deletes a local reference when dropped.
pub struct LocalRef<'vm> {
    env: Env<'vm>,
    obj: jni::jobject,
}

impl<'vm> LocalRef<'vm> {
    pub fn new(env: Env<'vm>, obj: jni::jobject) -> Self {
        LocalRef { env, obj }
    }

    /// Returns the underlying jobject.
    pub fn get(&self) -> jni::jobject {
        self.obj
    }

    pub fn is_null(&self) -> bool {
        self.obj.is_null()
    }

    /// Releases the reference without deleting it.
    pub fn into_inner(self) -> jni::jobject {
        let obj = self.obj;
        std::mem::forget(self);
        obj
    }
}

impl Drop for LocalRef<'_> {
    fn drop(&mut self) {
        if !self.obj.is_null() {
            let _ = self.env.delete_local_ref(self.obj);
        }
    }
}

/// A global reference, deleted when dropped.
///
/// Global references are valid on every thread, so the guard can be sent
/// and shared. Deletion goes through the dropping thread's environment; a
/// thread that is not attached is attached for the deletion and detached
/// again afterwards.
pub struct GlobalRef {
    vm: JavaVm,
    obj: usize,
}

impl GlobalRef {
    /// Returns the underlying global reference.
    pub fn get(&self) -> jni::jobject {
        self.obj as jni::jobject
    }

    pub fn is_null(&self) -> bool {
        self.obj == 0
    }

    /// Gives up ownership; the reference will never be deleted.
    pub fn into_raw(self) -> jni::jobject {
        let obj = self.get();
        std::mem::forget(self);
        obj
    }
}

impl std::fmt::Debug for GlobalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GlobalRef").field(&self.get()).finish()
    }
}

impl Drop for GlobalRef {
    fn drop(&mut self) {
        if self.obj == 0 {
            return;
        }
        // A detached thread is attached for the deletion only.
        match self.vm.attach_scoped() {
            Ok(attachment) => {
                if let Err(e) = attachment.env().delete_global_ref(self.get()) {
                    warn!(error = %e, "failed to delete global reference");
                }
            }
            Err(e) => warn!(error = %e, obj = ?self.get(), "global reference leaked: cannot attach dropping thread"),
        }
    }
}

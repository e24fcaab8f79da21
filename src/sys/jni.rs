// dalvik-bridge/src/sys/jni.rs
//
// Raw JNI types and the numbered function-table slots the bridge binds.
//
// Neither function table is modelled as a struct: the bridge reads each
// entry point lazily at its fixed slot, so only the slots listed here are
// ever touched. The numbering follows jni.h and has been stable since
// JNI 1.2. A port to another VM family must re-derive these offsets.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use std::ffi::c_void;
use std::os::raw::c_char;

// =============================================================================
// Primitive Types
// =============================================================================

pub type jint = i32;
pub type jlong = i64;
pub type jbyte = i8;
pub type jboolean = u8;
pub type jchar = u16;
pub type jshort = i16;
pub type jfloat = f32;
pub type jdouble = f64;
pub type jsize = jint;

// =============================================================================
// Reference Types (opaque pointers)
// =============================================================================

pub type jobject = *mut c_void;
pub type jclass = jobject;
pub type jstring = jobject;
pub type jarray = jobject;
pub type jobjectArray = jarray;
pub type jthrowable = jobject;

pub type jmethodID = *mut c_void;

// =============================================================================
// jvalue Union
// =============================================================================

#[repr(C)]
#[derive(Copy, Clone)]
pub union jvalue {
    pub z: jboolean,
    pub b: jbyte,
    pub c: jchar,
    pub s: jshort,
    pub i: jint,
    pub j: jlong,
    pub f: jfloat,
    pub d: jdouble,
    pub l: jobject,
}

// =============================================================================
// Constants
// =============================================================================

pub const JNI_OK: jint = 0;
pub const JNI_ERR: jint = -1;
pub const JNI_EDETACHED: jint = -2;
pub const JNI_EVERSION: jint = -3;
pub const JNI_ENOMEM: jint = -4;

pub const JNI_TRUE: jboolean = 1;
pub const JNI_FALSE: jboolean = 0;

pub const JNI_VERSION_1_2: jint = 0x00010002;
pub const JNI_VERSION_1_4: jint = 0x00010004;
pub const JNI_VERSION_1_6: jint = 0x00010006;

/// `java.lang.reflect.Modifier.STATIC`
pub const ACC_STATIC: jint = 0x0008;

// =============================================================================
// Opaque handles
// =============================================================================
//
// In C, `JNIEnv` and `JavaVM` are pointers to their function tables, and the
// handles passed around are pointers to those. The bridge only ever reads the
// table pointer and indexes into it.

pub type FunctionTable = *const *const c_void;
pub type JNIEnv = FunctionTable;
pub type JavaVM = FunctionTable;

// =============================================================================
// JNIInvokeInterface_ slots (JavaVM function table)
// =============================================================================

pub mod vm_slots {
    pub const DESTROY_JAVA_VM: usize = 3;
    pub const ATTACH_CURRENT_THREAD: usize = 4;
    pub const DETACH_CURRENT_THREAD: usize = 5;
    pub const GET_ENV: usize = 6;

    pub const COUNT: usize = 8;
}

// =============================================================================
// JNINativeInterface_ slots (JNIEnv function table)
// =============================================================================

pub mod env_slots {
    // 6-10: classes and reflection
    pub const FIND_CLASS: usize = 6;
    pub const FROM_REFLECTED_METHOD: usize = 7;
    pub const GET_SUPERCLASS: usize = 10;

    // 15-17: exceptions
    pub const EXCEPTION_OCCURRED: usize = 15;
    pub const EXCEPTION_DESCRIBE: usize = 16;
    pub const EXCEPTION_CLEAR: usize = 17;

    // 19-25: frames and references
    pub const PUSH_LOCAL_FRAME: usize = 19;
    pub const POP_LOCAL_FRAME: usize = 20;
    pub const NEW_GLOBAL_REF: usize = 21;
    pub const DELETE_GLOBAL_REF: usize = 22;
    pub const DELETE_LOCAL_REF: usize = 23;
    pub const IS_SAME_OBJECT: usize = 24;
    pub const NEW_LOCAL_REF: usize = 25;

    // 30: constructor invocation (jvalue array member of the NewObject family)
    pub const NEW_OBJECT_A: usize = 30;

    pub const GET_METHOD_ID: usize = 33;

    // 34-63: Call<Type>Method families, three members each (..., V, A)
    pub const CALL_OBJECT_METHOD: usize = 34;
    pub const CALL_BOOLEAN_METHOD: usize = 37;
    pub const CALL_BYTE_METHOD: usize = 40;
    pub const CALL_CHAR_METHOD: usize = 43;
    pub const CALL_SHORT_METHOD: usize = 46;
    pub const CALL_INT_METHOD: usize = 49;
    pub const CALL_LONG_METHOD: usize = 52;
    pub const CALL_FLOAT_METHOD: usize = 55;
    pub const CALL_DOUBLE_METHOD: usize = 58;
    pub const CALL_VOID_METHOD: usize = 61;

    pub const GET_STATIC_METHOD_ID: usize = 113;

    // 114-143: CallStatic<Type>Method families
    pub const CALL_STATIC_OBJECT_METHOD: usize = 114;
    pub const CALL_STATIC_BOOLEAN_METHOD: usize = 117;
    pub const CALL_STATIC_BYTE_METHOD: usize = 120;
    pub const CALL_STATIC_CHAR_METHOD: usize = 123;
    pub const CALL_STATIC_SHORT_METHOD: usize = 126;
    pub const CALL_STATIC_INT_METHOD: usize = 129;
    pub const CALL_STATIC_LONG_METHOD: usize = 132;
    pub const CALL_STATIC_FLOAT_METHOD: usize = 135;
    pub const CALL_STATIC_DOUBLE_METHOD: usize = 138;
    pub const CALL_STATIC_VOID_METHOD: usize = 141;

    /// Offset of the jvalue-array member within a call family.
    pub const ARRAY_VARIANT: usize = 2;

    // 163-173: strings and arrays
    pub const NEW_STRING: usize = 163;
    pub const GET_STRING_LENGTH: usize = 164;
    pub const GET_STRING_CHARS: usize = 165;
    pub const RELEASE_STRING_CHARS: usize = 166;
    pub const GET_ARRAY_LENGTH: usize = 171;
    pub const GET_OBJECT_ARRAY_ELEMENT: usize = 173;

    pub const COUNT: usize = 236;
}

// =============================================================================
// Entry point signatures
// =============================================================================

pub type AttachCurrentThreadFn =
    unsafe extern "system" fn(vm: *mut JavaVM, penv: *mut *mut c_void, args: *mut c_void) -> jint;
pub type DetachCurrentThreadFn = unsafe extern "system" fn(vm: *mut JavaVM) -> jint;
pub type GetEnvFn =
    unsafe extern "system" fn(vm: *mut JavaVM, penv: *mut *mut c_void, version: jint) -> jint;

pub type FindClassFn = unsafe extern "system" fn(env: *mut JNIEnv, name: *const c_char) -> jclass;
pub type FromReflectedMethodFn =
    unsafe extern "system" fn(env: *mut JNIEnv, method: jobject) -> jmethodID;
pub type GetSuperclassFn = unsafe extern "system" fn(env: *mut JNIEnv, sub: jclass) -> jclass;
pub type ExceptionOccurredFn = unsafe extern "system" fn(env: *mut JNIEnv) -> jthrowable;
pub type ExceptionDescribeFn = unsafe extern "system" fn(env: *mut JNIEnv);
pub type ExceptionClearFn = unsafe extern "system" fn(env: *mut JNIEnv);
pub type PushLocalFrameFn = unsafe extern "system" fn(env: *mut JNIEnv, capacity: jint) -> jint;
pub type PopLocalFrameFn = unsafe extern "system" fn(env: *mut JNIEnv, result: jobject) -> jobject;
pub type NewGlobalRefFn = unsafe extern "system" fn(env: *mut JNIEnv, obj: jobject) -> jobject;
pub type DeleteGlobalRefFn = unsafe extern "system" fn(env: *mut JNIEnv, gref: jobject);
pub type DeleteLocalRefFn = unsafe extern "system" fn(env: *mut JNIEnv, obj: jobject);
pub type NewLocalRefFn = unsafe extern "system" fn(env: *mut JNIEnv, obj: jobject) -> jobject;
pub type IsSameObjectFn =
    unsafe extern "system" fn(env: *mut JNIEnv, obj1: jobject, obj2: jobject) -> jboolean;
pub type GetMethodIdFn = unsafe extern "system" fn(
    env: *mut JNIEnv,
    clazz: jclass,
    name: *const c_char,
    sig: *const c_char,
) -> jmethodID;
pub type NewStringFn =
    unsafe extern "system" fn(env: *mut JNIEnv, unicode: *const jchar, len: jsize) -> jstring;
pub type GetStringLengthFn = unsafe extern "system" fn(env: *mut JNIEnv, s: jstring) -> jsize;
pub type GetStringCharsFn =
    unsafe extern "system" fn(env: *mut JNIEnv, s: jstring, is_copy: *mut jboolean) -> *const jchar;
pub type ReleaseStringCharsFn =
    unsafe extern "system" fn(env: *mut JNIEnv, s: jstring, chars: *const jchar);
pub type GetArrayLengthFn = unsafe extern "system" fn(env: *mut JNIEnv, array: jarray) -> jsize;
pub type GetObjectArrayElementFn =
    unsafe extern "system" fn(env: *mut JNIEnv, array: jobjectArray, index: jsize) -> jobject;

/// `NewObjectA`, `Call<T>MethodA` and `CallStatic<T>MethodA` all share this
/// shape up to the return type: receiver, method id, argument array.
pub type CallMethodAFn<R> = unsafe extern "system" fn(
    env: *mut JNIEnv,
    receiver: jobject,
    method: jmethodID,
    args: *const jvalue,
) -> R;

//! Native-callable trampolines built with libffi closures.
//!
//! A [`NativeCallback`] exposes a C function pointer of a given
//! [`MethodShape`]. Calling it decodes the native arguments, runs the host
//! procedure and encodes its result. A panic in the procedure is caught at
//! the boundary and the caller gets a zeroed result.

use std::ffi::c_void;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use libffi::low::{self, ffi_cif, ffi_closure, CodePtr};
use libffi::middle::{Cif, Type};
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::method::MethodShape;
use crate::types::{NativeType, NativeValue};

type Procedure = Box<dyn Fn(&[NativeValue]) -> NativeValue + Send + Sync>;

struct CallbackState {
    shape: MethodShape,
    procedure: Procedure,
}

/// A libffi closure whose code pointer runs a host procedure.
///
/// The code pointer is valid until this value is dropped.
pub struct NativeCallback {
    closure: *mut ffi_closure,
    code: CodePtr,
    // Referenced by the closure; boxed so neither moves.
    _cif: Box<Cif>,
    state: Box<CallbackState>,
}

// The closure is immutable once prepared and the state is Send + Sync.
unsafe impl Send for NativeCallback {}
unsafe impl Sync for NativeCallback {}

impl NativeCallback {
    pub fn new<F>(shape: MethodShape, procedure: F) -> Result<Self>
    where
        F: Fn(&[NativeValue]) -> NativeValue + Send + Sync + 'static,
    {
        let cif = Box::new(Cif::new(
            shape.argument_types.iter().copied().map(ffi_type),
            ffi_type(shape.return_type),
        ));
        let state = Box::new(CallbackState { shape, procedure: Box::new(procedure) });

        let (closure, code) = low::closure_alloc();
        if closure.is_null() {
            return Err(Error::Callback("closure allocation failed".to_string()));
        }
        let prepared = unsafe {
            low::prep_closure(
                closure,
                cif.as_raw_ptr(),
                trampoline,
                &*state as *const CallbackState,
                code,
            )
        };
        if let Err(e) = prepared {
            unsafe { low::closure_free(closure) };
            return Err(Error::Callback(format!("{e:?}")));
        }

        Ok(NativeCallback { closure, code, _cif: cif, state })
    }

    /// Address to hand to the VM (e.g. as a `RegisterNatives` entry).
    pub fn code_ptr(&self) -> *const c_void {
        self.code.as_ptr()
    }

    pub fn shape(&self) -> &MethodShape {
        &self.state.shape
    }
}

impl fmt::Debug for NativeCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCallback")
            .field("code", &self.code_ptr())
            .field("shape", &self.state.shape)
            .finish()
    }
}

impl Drop for NativeCallback {
    fn drop(&mut self) {
        unsafe { low::closure_free(self.closure) };
    }
}

fn ffi_type(t: NativeType) -> Type {
    match t {
        NativeType::Void => Type::void(),
        NativeType::U8 => Type::u8(),
        NativeType::I8 => Type::i8(),
        NativeType::U16 => Type::u16(),
        NativeType::I16 => Type::i16(),
        NativeType::I32 => Type::i32(),
        NativeType::I64 => Type::i64(),
        NativeType::F32 => Type::f32(),
        NativeType::F64 => Type::f64(),
        NativeType::Pointer => Type::pointer(),
    }
}

unsafe fn read_argument(t: NativeType, slot: *const c_void) -> NativeValue {
    match t {
        NativeType::Void => NativeValue::Void,
        NativeType::U8 => NativeValue::U8(*(slot as *const u8)),
        NativeType::I8 => NativeValue::I8(*(slot as *const i8)),
        NativeType::U16 => NativeValue::U16(*(slot as *const u16)),
        NativeType::I16 => NativeValue::I16(*(slot as *const i16)),
        NativeType::I32 => NativeValue::I32(*(slot as *const i32)),
        NativeType::I64 => NativeValue::I64(*(slot as *const i64)),
        NativeType::F32 => NativeValue::F32(*(slot as *const f32)),
        NativeType::F64 => NativeValue::F64(*(slot as *const f64)),
        NativeType::Pointer => NativeValue::Pointer(*(slot as *const *mut c_void)),
    }
}

// libffi widens integral results smaller than a register to a full `ffi_arg`.
unsafe fn write_result(result: &mut u64, value: NativeValue) {
    let slot = result as *mut u64;
    match value {
        NativeValue::Void => {}
        NativeValue::U8(v) => *slot = v as u64,
        NativeValue::I8(v) => *slot = v as i64 as u64,
        NativeValue::U16(v) => *slot = v as u64,
        NativeValue::I16(v) => *slot = v as i64 as u64,
        NativeValue::I32(v) => *slot = v as i64 as u64,
        NativeValue::I64(v) => *slot = v as u64,
        NativeValue::F32(v) => *(slot as *mut f32) = v,
        NativeValue::F64(v) => *(slot as *mut f64) = v,
        NativeValue::Pointer(v) => *slot = v as usize as u64,
    }
}

unsafe extern "C" fn trampoline(
    _cif: &ffi_cif,
    result: &mut u64,
    args: *const *const c_void,
    state: &CallbackState,
) {
    let arguments: Vec<NativeValue> = state
        .shape
        .argument_types
        .iter()
        .enumerate()
        .map(|(i, t)| read_argument(*t, *args.add(i)))
        .collect();

    *result = 0;
    match panic::catch_unwind(AssertUnwindSafe(|| (state.procedure)(&arguments))) {
        Ok(value) if value.native_type() == state.shape.return_type => write_result(result, value),
        Ok(value) => {
            warn!(expected = ?state.shape.return_type, got = ?value.native_type(), "callback returned the wrong shape");
        }
        Err(_) => error!("callback panicked; returning a zeroed result"),
    }
}

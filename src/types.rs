//! Type marshaling registry.
//!
//! Maps foreign type names (as reported by `Class.getName()`) to a
//! [`TypeDescriptor`]: the native shape a value travels in, which host
//! [`Value`]s are compatible with it, and the conversions between the two.
//!
//! | Foreign type       | Native shape | Host values accepted                  |
//! |--------------------|--------------|---------------------------------------|
//! | `boolean`          | `U8`         | `Boolean`                             |
//! | `byte` .. `long`   | `I8` .. `I64`| any integral value that fits          |
//! | `float`, `double`  | `F32`, `F64` | `Float`, `Double`, any integral value |
//! | `char`             | `U16`        | `Char` in the Basic Multilingual Plane|
//! | `java.lang.String` | `Pointer`    | `Text`, or an object instance         |
//! | other classes      | `Pointer`    | an object instance                    |
//! | `[B`, `[C`, `[I`   | `Pointer`    | nothing yet; conversions fail         |

use std::ffi::c_void;
use std::fmt;

use crate::class_factory::{ClassFactory, Instance};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::sys::jni;

/// Name of the foreign text class.
pub const STRING_CLASS: &str = "java.lang.String";

/// Array types with a declared (but not yet implemented) descriptor.
const DECLARED_ARRAYS: [&str; 3] = ["[B", "[C", "[I"];

/// Shape of a value at the native call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeType {
    Void,
    U8,
    I8,
    U16,
    I16,
    I32,
    I64,
    F32,
    F64,
    Pointer,
}

/// A raw value at the native call boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeValue {
    Void,
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Pointer(*mut c_void),
}

impl NativeValue {
    pub fn native_type(&self) -> NativeType {
        match self {
            NativeValue::Void => NativeType::Void,
            NativeValue::U8(_) => NativeType::U8,
            NativeValue::I8(_) => NativeType::I8,
            NativeValue::U16(_) => NativeType::U16,
            NativeValue::I16(_) => NativeType::I16,
            NativeValue::I32(_) => NativeType::I32,
            NativeValue::I64(_) => NativeType::I64,
            NativeValue::F32(_) => NativeType::F32,
            NativeValue::F64(_) => NativeType::F64,
            NativeValue::Pointer(_) => NativeType::Pointer,
        }
    }
}

/// The eight primitive kinds of the foreign type system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
}

impl PrimitiveKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "boolean" => PrimitiveKind::Boolean,
            "byte" => PrimitiveKind::Byte,
            "char" => PrimitiveKind::Char,
            "short" => PrimitiveKind::Short,
            "int" => PrimitiveKind::Int,
            "long" => PrimitiveKind::Long,
            "float" => PrimitiveKind::Float,
            "double" => PrimitiveKind::Double,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            PrimitiveKind::Boolean => "boolean",
            PrimitiveKind::Byte => "byte",
            PrimitiveKind::Char => "char",
            PrimitiveKind::Short => "short",
            PrimitiveKind::Int => "int",
            PrimitiveKind::Long => "long",
            PrimitiveKind::Float => "float",
            PrimitiveKind::Double => "double",
        }
    }

    pub fn native_type(self) -> NativeType {
        match self {
            PrimitiveKind::Boolean => NativeType::U8,
            PrimitiveKind::Byte => NativeType::I8,
            PrimitiveKind::Char => NativeType::U16,
            PrimitiveKind::Short => NativeType::I16,
            PrimitiveKind::Int => NativeType::I32,
            PrimitiveKind::Long => NativeType::I64,
            PrimitiveKind::Float => NativeType::F32,
            PrimitiveKind::Double => NativeType::F64,
        }
    }
}

/// A host-side value passed to or returned from a foreign call.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Result of a `void` method.
    Void,
    Null,
    Boolean(bool),
    Byte(i8),
    Char(char),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Text(String),
    Object(Instance),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Any integral value, widened.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Byte(v) => Some(*v as i64),
            Value::Short(v) => Some(*v as i64),
            Value::Int(v) => Some(*v as i64),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_char(&self) -> Option<char> {
        match self {
            Value::Char(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&Instance> {
        match self {
            Value::Object(instance) => Some(instance),
            _ => None,
        }
    }

    pub fn into_instance(self) -> Option<Instance> {
        match self {
            Value::Object(instance) => Some(instance),
            _ => None,
        }
    }

    /// Short name of the variant, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Byte(_) => "byte",
            Value::Char(_) => "char",
            Value::Short(_) => "short",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Text(_) => "text",
            Value::Object(_) => "object",
        }
    }
}

macro_rules! impl_from_for_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from_for_value! {
    bool => Boolean,
    i8 => Byte,
    char => Char,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    String => Text,
    Instance => Object,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// What a [`TypeDescriptor`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Void,
    Primitive(PrimitiveKind),
    Object,
    Array,
}

/// Marshaling rules for one foreign type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    name: String,
    kind: TypeKind,
}

impl TypeDescriptor {
    fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        TypeDescriptor { name: name.into(), kind }
    }

    /// The foreign type name, dotted for classes.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn native_type(&self) -> NativeType {
        match self.kind {
            TypeKind::Void => NativeType::Void,
            TypeKind::Primitive(p) => p.native_type(),
            TypeKind::Object | TypeKind::Array => NativeType::Pointer,
        }
    }

    /// Whether passing this type may allocate a local reference.
    pub fn allocates_outbound(&self) -> bool {
        matches!(self.kind, TypeKind::Object | TypeKind::Array)
    }

    /// Whether a returned value of this type is converted before reaching
    /// the host.
    pub fn converts_inbound(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Primitive(PrimitiveKind::Boolean) | TypeKind::Object | TypeKind::Array
        )
    }

    /// Compatibility predicate used by overload selection.
    pub fn is_compatible(&self, value: &Value) -> bool {
        match self.kind {
            TypeKind::Void | TypeKind::Array => false,
            TypeKind::Primitive(kind) => primitive_accepts(kind, value),
            TypeKind::Object => match value {
                Value::Text(_) => self.name == STRING_CLASS,
                Value::Object(instance) => instance.handle().is_some(),
                _ => false,
            },
        }
    }

    /// Outbound conversion. Text allocates a foreign string in the current
    /// local frame.
    pub fn to_jni(&self, env: Env<'_>, value: &Value) -> Result<jni::jvalue> {
        let mismatch = || Error::OverloadArgumentMismatch;
        Ok(match self.kind {
            TypeKind::Void => return Err(Error::UnsupportedType("void".to_string())),
            TypeKind::Array => return Err(Error::NotImplemented(self.name.clone())),
            TypeKind::Primitive(kind) => {
                if !primitive_accepts(kind, value) {
                    return Err(mismatch());
                }
                primitive_to_jvalue(kind, value).ok_or_else(mismatch)?
            }
            TypeKind::Object => match value {
                Value::Text(s) => jni::jvalue { l: env.new_string(s)? },
                Value::Object(instance) => jni::jvalue { l: instance.handle().ok_or_else(mismatch)? },
                _ => return Err(mismatch()),
            },
        })
    }

    /// Inbound conversion of a call result.
    ///
    /// Object handles become [`Value::Null`], the `receiver` itself when the
    /// handle denotes the same object, or a freshly wrapped instance of the
    /// declared class.
    pub fn from_jni(
        &self,
        env: Env<'_>,
        raw: NativeValue,
        factory: &ClassFactory,
        receiver: Option<&Instance>,
    ) -> Result<Value> {
        match (self.kind, raw) {
            (TypeKind::Void, _) => Ok(Value::Void),
            (TypeKind::Array, _) => Err(Error::NotImplemented(self.name.clone())),
            (TypeKind::Object, NativeValue::Pointer(handle)) => {
                if handle.is_null() {
                    return Ok(Value::Null);
                }
                if let Some(receiver) = receiver {
                    if let Some(own) = receiver.handle() {
                        if env.is_same_object(handle, own)? {
                            return Ok(Value::Object(receiver.clone()));
                        }
                    }
                }
                let class = factory.use_class_in(env, &self.name)?;
                Ok(Value::Object(factory.cast_in(env, handle, class.class())?))
            }
            (TypeKind::Primitive(kind), raw) => primitive_from_native(kind, raw)
                .ok_or_else(|| Error::UnsupportedType(format!("{} from {:?}", self.name, raw.native_type()))),
            (TypeKind::Object, raw) => {
                Err(Error::UnsupportedType(format!("{} from {:?}", self.name, raw.native_type())))
            }
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn primitive_accepts(kind: PrimitiveKind, value: &Value) -> bool {
    match kind {
        PrimitiveKind::Boolean => matches!(value, Value::Boolean(_)),
        PrimitiveKind::Char => matches!(value, Value::Char(c) if (*c as u32) <= u16::MAX as u32),
        PrimitiveKind::Byte => value.as_i64().map_or(false, |v| i8::try_from(v).is_ok()),
        PrimitiveKind::Short => value.as_i64().map_or(false, |v| i16::try_from(v).is_ok()),
        PrimitiveKind::Int => value.as_i64().map_or(false, |v| i32::try_from(v).is_ok()),
        PrimitiveKind::Long => value.as_i64().is_some(),
        PrimitiveKind::Float | PrimitiveKind::Double => value.as_f64().is_some(),
    }
}

fn primitive_to_jvalue(kind: PrimitiveKind, value: &Value) -> Option<jni::jvalue> {
    Some(match kind {
        PrimitiveKind::Boolean => jni::jvalue {
            z: if value.as_bool()? { jni::JNI_TRUE } else { jni::JNI_FALSE },
        },
        PrimitiveKind::Byte => jni::jvalue { b: i8::try_from(value.as_i64()?).ok()? },
        PrimitiveKind::Char => jni::jvalue { c: u16::try_from(value.as_char()? as u32).ok()? },
        PrimitiveKind::Short => jni::jvalue { s: i16::try_from(value.as_i64()?).ok()? },
        PrimitiveKind::Int => jni::jvalue { i: i32::try_from(value.as_i64()?).ok()? },
        PrimitiveKind::Long => jni::jvalue { j: value.as_i64()? },
        PrimitiveKind::Float => jni::jvalue { f: value.as_f64()? as f32 },
        PrimitiveKind::Double => jni::jvalue { d: value.as_f64()? },
    })
}

fn primitive_from_native(kind: PrimitiveKind, raw: NativeValue) -> Option<Value> {
    Some(match (kind, raw) {
        (PrimitiveKind::Boolean, NativeValue::U8(v)) => Value::Boolean(v != jni::JNI_FALSE),
        (PrimitiveKind::Byte, NativeValue::I8(v)) => Value::Byte(v),
        // Unpaired surrogates have no `char`; they decode as U+FFFD.
        (PrimitiveKind::Char, NativeValue::U16(v)) => {
            Value::Char(char::from_u32(v as u32).unwrap_or(char::REPLACEMENT_CHARACTER))
        }
        (PrimitiveKind::Short, NativeValue::I16(v)) => Value::Short(v),
        (PrimitiveKind::Int, NativeValue::I32(v)) => Value::Int(v),
        (PrimitiveKind::Long, NativeValue::I64(v)) => Value::Long(v),
        (PrimitiveKind::Float, NativeValue::F32(v)) => Value::Float(v),
        (PrimitiveKind::Double, NativeValue::F64(v)) => Value::Double(v),
        _ => return None,
    })
}

// =============================================================================
// Registry
// =============================================================================

/// Looks up a fixed registry entry: `void`, a primitive, `java.lang.String`
/// or a declared array type.
pub fn lookup(name: &str) -> Option<TypeDescriptor> {
    if name == "void" {
        return Some(TypeDescriptor::new(name, TypeKind::Void));
    }
    if let Some(kind) = PrimitiveKind::from_name(name) {
        return Some(TypeDescriptor::new(name, TypeKind::Primitive(kind)));
    }
    if DECLARED_ARRAYS.contains(&name) {
        return Some(TypeDescriptor::new(name, TypeKind::Array));
    }
    if name == STRING_CLASS {
        return Some(object_type(name));
    }
    None
}

/// Descriptor for instances of `class_name` (dotted form).
pub fn object_type(class_name: &str) -> TypeDescriptor {
    TypeDescriptor::new(class_name, TypeKind::Object)
}

/// Descriptor for a declared parameter type.
///
/// Arrays and `void` are unsupported as parameters; a member taking one is
/// not exposed.
pub fn parameter_type(name: &str) -> Result<TypeDescriptor> {
    if name.starts_with('[') || name == "void" || name.is_empty() {
        return Err(Error::UnsupportedType(name.to_string()));
    }
    Ok(lookup(name).unwrap_or_else(|| object_type(name)))
}

/// Descriptor for a declared return type. Declared arrays are accepted and
/// fail when a value is converted; other arrays are unsupported.
pub fn return_type(name: &str) -> Result<TypeDescriptor> {
    if let Some(descriptor) = lookup(name) {
        return Ok(descriptor);
    }
    if name.starts_with('[') || name.is_empty() {
        return Err(Error::UnsupportedType(name.to_string()));
    }
    Ok(object_type(name))
}

/// Converts `java.lang.String` to `java/lang/String`.
pub fn to_slash_name(name: &str) -> String {
    name.replace('.', "/")
}

/// Converts `java/lang/String` to `java.lang.String`, the form
/// `Class.getName()` reports and wrapper types are cached under.
pub fn to_dotted_name(name: &str) -> String {
    name.replace('/', ".")
}

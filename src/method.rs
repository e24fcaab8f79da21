//! Method descriptors and overload dispatch.
//!
//! A [`MethodDescriptor`] is one reflected constructor or method. A
//! [`Dispatcher`] groups the overloads of one member by arity and picks the
//! first candidate, in reflection order, whose argument types all accept the
//! actual arguments. There is no best-fit ranking.

use std::collections::BTreeMap;
use std::fmt;

use crate::class_factory::{ClassFactory, Instance, WrapperType};
use crate::env::{CallKind, Env, MethodId};
use crate::error::{Error, Result};
use crate::sys::jni;
use crate::types::{NativeType, NativeValue, TypeDescriptor, Value};

/// Local references every call may need regardless of its signature: the
/// pending throwable and its description.
const BASE_FRAME_CAPACITY: jni::jint = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    Constructor,
    Static,
    Instance,
}

/// Native return and argument shapes of a callable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodShape {
    pub return_type: NativeType,
    pub argument_types: Vec<NativeType>,
}

impl MethodShape {
    pub fn new(return_type: NativeType, argument_types: impl Into<Vec<NativeType>>) -> Self {
        MethodShape { return_type, argument_types: argument_types.into() }
    }
}

/// One reflected constructor or method.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    kind: MethodKind,
    name: String,
    id: MethodId,
    return_type: TypeDescriptor,
    argument_types: Vec<TypeDescriptor>,
}

impl MethodDescriptor {
    pub fn new(
        kind: MethodKind,
        name: impl Into<String>,
        id: MethodId,
        return_type: TypeDescriptor,
        argument_types: Vec<TypeDescriptor>,
    ) -> Self {
        MethodDescriptor { kind, name: name.into(), id, return_type, argument_types }
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn return_type(&self) -> &TypeDescriptor {
        &self.return_type
    }

    pub fn argument_types(&self) -> &[TypeDescriptor] {
        &self.argument_types
    }

    pub fn arity(&self) -> usize {
        self.argument_types.len()
    }

    pub fn can_invoke_with(&self, args: &[Value]) -> bool {
        args.len() == self.arity() && self.argument_types.iter().zip(args).all(|(t, v)| t.is_compatible(v))
    }

    /// Local-reference capacity reserved around a call.
    pub fn frame_capacity(&self) -> jni::jint {
        let arguments = self.argument_types.iter().filter(|t| t.allocates_outbound()).count() as jni::jint;
        let result = if self.return_type.converts_inbound() { 1 } else { 0 };
        BASE_FRAME_CAPACITY + arguments + result
    }

    pub fn shape(&self) -> MethodShape {
        MethodShape {
            return_type: self.return_type.native_type(),
            argument_types: self.argument_types.iter().map(TypeDescriptor::native_type).collect(),
        }
    }

    /// Runs this member against `receiver`.
    ///
    /// Constructors and static methods target `declaring`, the class the
    /// member was reflected from; instance methods need the receiver's object
    /// handle. Every local reference created on the way lives in a frame that
    /// is popped before this returns.
    pub fn invoke(
        &self,
        env: Env<'_>,
        factory: &ClassFactory,
        declaring: &WrapperType,
        receiver: &Instance,
        args: &[Value],
    ) -> Result<Value> {
        let target = match self.kind {
            MethodKind::Constructor | MethodKind::Static => declaring.handle(),
            MethodKind::Instance => receiver.handle().ok_or_else(|| Error::MissingReceiver(self.name.clone()))?,
        };

        let _frame = env.push_local_frame(self.frame_capacity())?;

        let argv = self
            .argument_types
            .iter()
            .zip(args)
            .map(|(t, v)| t.to_jni(env, v))
            .collect::<Result<Vec<jni::jvalue>>>()?;

        let raw = match self.kind {
            MethodKind::Constructor => NativeValue::Pointer(env.new_object(target, self.id, &argv)?),
            MethodKind::Static => {
                env.call_method(CallKind::Static, self.return_type.native_type(), target, self.id, &argv)?
            }
            MethodKind::Instance => {
                env.call_method(CallKind::Instance, self.return_type.native_type(), target, self.id, &argv)?
            }
        };
        env.check_exception()?;

        self.return_type.from_jni(env, raw, factory, Some(receiver))
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == MethodKind::Static {
            f.write_str("static ")?;
        }
        if self.kind != MethodKind::Constructor {
            write!(f, "{} ", self.return_type)?;
        }
        write!(f, "{}(", self.name)?;
        for (i, t) in self.argument_types.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{t}")?;
        }
        f.write_str(")")
    }
}

/// Overloads of one member, grouped by arity.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    groups: BTreeMap<usize, Vec<MethodDescriptor>>,
}

impl Dispatcher {
    pub fn new(methods: impl IntoIterator<Item = MethodDescriptor>) -> Self {
        let mut groups: BTreeMap<usize, Vec<MethodDescriptor>> = BTreeMap::new();
        for method in methods {
            groups.entry(method.arity()).or_default().push(method);
        }
        Dispatcher { groups }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of overloads.
    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn arities(&self) -> impl Iterator<Item = usize> + '_ {
        self.groups.keys().copied()
    }

    /// Overloads in arity order, reflection order within an arity.
    pub fn iter(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.groups.values().flatten()
    }

    /// Picks the first overload of matching arity that accepts `args`.
    pub fn select(&self, args: &[Value]) -> Result<&MethodDescriptor> {
        let group = self.groups.get(&args.len()).ok_or(Error::OverloadArityMismatch)?;
        group.iter().find(|m| m.can_invoke_with(args)).ok_or(Error::OverloadArgumentMismatch)
    }

    /// Selects an overload declared by `declaring` and runs it.
    pub fn invoke(
        &self,
        env: Env<'_>,
        factory: &ClassFactory,
        declaring: &WrapperType,
        receiver: &Instance,
        args: &[Value],
    ) -> Result<Value> {
        self.select(args)?.invoke(env, factory, declaring, receiver, args)
    }
}

impl FromIterator<MethodDescriptor> for Dispatcher {
    fn from_iter<I: IntoIterator<Item = MethodDescriptor>>(iter: I) -> Self {
        Dispatcher::new(iter)
    }
}

//! Reflective class wrappers.
//!
//! The [`ClassFactory`] turns a class name into a [`WrapperType`] by asking
//! the VM for the class's declared constructors and methods, then hands out
//! [`Instance`]s of it. Wrapper types are cached by name for the life of the
//! factory and each links to its superclass's wrapper, so member lookup walks
//! the parent chain the way the foreign single-inheritance model does.
//!
//! ```rust,ignore
//! runtime.perform(|_env| {
//!     let string = runtime.use_class("java.lang.String")?;
//!     let s = string.new_instance(&["Hello".into()])?;
//!     assert_eq!(s.to_host_string()?, "Hello");
//!     Ok(())
//! })?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::env::{CallKind, Env, GlobalRef, LocalRef};
use crate::error::{Error, Result};
use crate::method::{Dispatcher, MethodDescriptor, MethodKind};
use crate::sys::jni;
use crate::types::{self, NativeType, NativeValue, Value};
use crate::vm::JavaVm;

/// Room for the reflection arrays and per-member references created while a
/// wrapper type is synthesized. Each member releases its own references.
const REFLECTION_FRAME_CAPACITY: jni::jint = 16;

struct FactoryShared {
    vm: JavaVm,
    classes: RwLock<HashMap<String, Arc<WrapperType>>>,
    // Serializes resolve-or-create; readers never take it.
    create: Mutex<()>,
}

/// Builds and caches wrapper types.
#[derive(Clone)]
pub struct ClassFactory {
    shared: Arc<FactoryShared>,
}

impl ClassFactory {
    pub fn new(vm: JavaVm) -> Self {
        ClassFactory {
            shared: Arc::new(FactoryShared {
                vm,
                classes: RwLock::new(HashMap::new()),
                create: Mutex::new(()),
            }),
        }
    }

    pub fn vm(&self) -> &JavaVm {
        &self.shared.vm
    }

    /// Returns a class-only instance of the class named `class_name`,
    /// synthesizing its wrapper type on first use. Dotted and slash forms
    /// name the same wrapper type.
    ///
    /// The calling thread must be attached.
    pub fn use_class(&self, class_name: &str) -> Result<Instance> {
        let env = self.shared.vm.get_env()?;
        self.use_class_in(env, class_name)
    }

    pub(crate) fn use_class_in(&self, env: Env<'_>, class_name: &str) -> Result<Instance> {
        let class_name = types::to_dotted_name(class_name);
        if let Some(class) = self.cached(&class_name) {
            return Ok(Instance::class_only(class));
        }

        let handle = env.find_class(&types::to_slash_name(&class_name))?;
        if handle.is_null() {
            env.exception_clear()?;
            return Err(Error::ClassNotLoaded(class_name));
        }
        let handle = LocalRef::new(env, handle);
        let class = self.ensure_class(env, handle.get(), Some(&class_name))?;
        Ok(Instance::class_only(class))
    }

    /// Returns the wrapper type for `class`, building it and every missing
    /// ancestor if needed. `known_name` skips the `getName()` call.
    pub fn ensure_class(&self, env: Env<'_>, class: jni::jclass, known_name: Option<&str>) -> Result<Arc<WrapperType>> {
        let name = match known_name {
            Some(name) => name.to_string(),
            None => env.get_class_name(class)?,
        };
        if let Some(cached) = self.cached(&name) {
            return Ok(cached);
        }

        let _guard = self.shared.create.lock();
        self.ensure_class_locked(env, class, name)
    }

    fn ensure_class_locked(&self, env: Env<'_>, class: jni::jclass, name: String) -> Result<Arc<WrapperType>> {
        if let Some(cached) = self.cached(&name) {
            return Ok(cached);
        }

        let super_handle = LocalRef::new(env, env.get_superclass(class)?);
        let parent = if super_handle.is_null() {
            None
        } else {
            let super_name = env.get_class_name(super_handle.get())?;
            Some(self.ensure_class_locked(env, super_handle.get(), super_name)?)
        };

        let (constructors, methods) = {
            let _frame = env.push_local_frame(REFLECTION_FRAME_CAPACITY)?;
            (reflect_constructors(env, class, &name)?, reflect_methods(env, class, &name)?)
        };

        let wrapper = Arc::new(WrapperType {
            handle: env.new_global_ref(class)?,
            parent,
            constructors,
            methods,
            factory: Arc::downgrade(&self.shared),
            name: name.clone(),
        });
        debug!(
            class = %name,
            parent = wrapper.parent.as_ref().map(|p| p.name()),
            constructors = wrapper.constructors.len(),
            methods = wrapper.methods.len(),
            "synthesized wrapper type"
        );

        self.shared.classes.write().insert(name, wrapper.clone());
        Ok(wrapper)
    }

    /// Wraps `handle` as an instance of `class` without reflecting on it.
    ///
    /// The handle is trusted to denote an instance of `class`.
    pub fn cast(&self, handle: jni::jobject, class: &Arc<WrapperType>) -> Result<Instance> {
        let env = self.shared.vm.get_env()?;
        self.cast_in(env, handle, class)
    }

    pub(crate) fn cast_in(&self, env: Env<'_>, handle: jni::jobject, class: &Arc<WrapperType>) -> Result<Instance> {
        let handle = env.new_global_ref(handle)?;
        Ok(Instance { inner: Arc::new(InstanceInner { class: class.clone(), handle: Some(handle) }) })
    }

    /// Looks up an already synthesized wrapper type.
    pub fn cached(&self, class_name: &str) -> Option<Arc<WrapperType>> {
        self.shared.classes.read().get(class_name).cloned()
    }

    /// Number of synthesized wrapper types.
    pub fn len(&self) -> usize {
        self.shared.classes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ClassFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassFactory").field("classes", &self.len()).finish()
    }
}

fn reflect_constructors(env: Env<'_>, class: jni::jclass, class_name: &str) -> Result<Dispatcher> {
    let get_parameter_types = env.java_lang_reflect_constructor()?.get_parameter_types;
    let array = LocalRef::new(env, env.call_object_method(class, env.java_lang_class()?.get_declared_constructors, &[])?);
    env.check_exception()?;
    let return_type = types::object_type(class_name);

    let mut constructors = Vec::new();
    for index in 0..reflected_len(env, &array)? {
        let constructor = LocalRef::new(env, env.get_object_array_element(array.get(), index)?);
        let id = env.from_reflected_method(constructor.get())?;
        let parameters = LocalRef::new(env, env.call_object_method(constructor.get(), get_parameter_types, &[])?);
        env.check_exception()?;

        match parameter_types(env, &parameters) {
            Ok(argument_types) => constructors.push(MethodDescriptor::new(
                MethodKind::Constructor,
                "<init>",
                id,
                return_type.clone(),
                argument_types,
            )),
            Err(Error::UnsupportedType(unsupported)) => {
                debug!(class = class_name, %unsupported, "skipping constructor with unsupported parameter");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Dispatcher::new(constructors))
}

fn reflect_methods(env: Env<'_>, class: jni::jclass, class_name: &str) -> Result<HashMap<String, Dispatcher>> {
    let reflect = env.java_lang_reflect_method()?;
    let array = LocalRef::new(env, env.call_object_method(class, env.java_lang_class()?.get_declared_methods, &[])?);
    env.check_exception()?;

    let mut by_name: HashMap<String, Vec<MethodDescriptor>> = HashMap::new();
    for index in 0..reflected_len(env, &array)? {
        let method = LocalRef::new(env, env.get_object_array_element(array.get(), index)?);

        let name = LocalRef::new(env, env.call_object_method(method.get(), reflect.get_name, &[])?);
        env.check_exception()?;
        let name = env.string_from_jni(name.get())?;

        let modifiers = match env.call_method(CallKind::Instance, NativeType::I32, method.get(), reflect.get_modifiers, &[])? {
            NativeValue::I32(modifiers) => modifiers,
            _ => 0,
        };
        env.check_exception()?;
        let kind = if modifiers & jni::ACC_STATIC != 0 { MethodKind::Static } else { MethodKind::Instance };

        let returned = LocalRef::new(env, env.call_object_method(method.get(), reflect.get_return_type, &[])?);
        env.check_exception()?;
        let return_name = env.get_class_name(returned.get())?;

        let parameters = LocalRef::new(env, env.call_object_method(method.get(), reflect.get_parameter_types, &[])?);
        env.check_exception()?;

        let signature = types::return_type(&return_name).and_then(|r| Ok((r, parameter_types(env, &parameters)?)));
        match signature {
            Ok((return_type, argument_types)) => {
                let id = env.from_reflected_method(method.get())?;
                by_name
                    .entry(name.clone())
                    .or_default()
                    .push(MethodDescriptor::new(kind, name, id, return_type, argument_types));
            }
            Err(Error::UnsupportedType(unsupported)) => {
                debug!(class = class_name, method = %name, %unsupported, "skipping method with unsupported type");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(by_name.into_iter().map(|(name, overloads)| (name, Dispatcher::new(overloads))).collect())
}

fn reflected_len(env: Env<'_>, array: &LocalRef<'_>) -> Result<jni::jsize> {
    if array.is_null() {
        return Ok(0);
    }
    env.get_array_length(array.get())
}

fn parameter_types(env: Env<'_>, array: &LocalRef<'_>) -> Result<Vec<types::TypeDescriptor>> {
    let mut out = Vec::new();
    for index in 0..reflected_len(env, array)? {
        let class = LocalRef::new(env, env.get_object_array_element(array.get(), index)?);
        out.push(types::parameter_type(&env.get_class_name(class.get())?)?);
    }
    Ok(out)
}

/// Proxy type for one foreign class.
pub struct WrapperType {
    name: String,
    handle: GlobalRef,
    parent: Option<Arc<WrapperType>>,
    constructors: Dispatcher,
    methods: HashMap<String, Dispatcher>,
    factory: Weak<FactoryShared>,
}

impl WrapperType {
    /// Qualified name in dotted form.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Global reference to the class handle.
    pub fn handle(&self) -> jni::jclass {
        self.handle.get()
    }

    pub fn parent(&self) -> Option<&Arc<WrapperType>> {
        self.parent.as_ref()
    }

    pub fn constructors(&self) -> &Dispatcher {
        &self.constructors
    }

    /// Methods declared by this class itself, not its ancestors.
    pub fn declared_methods(&self) -> &HashMap<String, Dispatcher> {
        &self.methods
    }

    /// This type followed by its ancestors, nearest first.
    pub fn ancestry(&self) -> impl Iterator<Item = &WrapperType> {
        std::iter::successors(Some(self), |t| t.parent.as_deref())
    }

    /// Overloads of `name` declared by this type or, failing that, by the
    /// nearest ancestor declaring it. Inherited overloads further up are not
    /// included; see [`select_method`](Self::select_method).
    pub fn find_method(&self, name: &str) -> Option<&Dispatcher> {
        self.ancestry().find_map(|t| t.methods.get(name))
    }

    /// Picks the overload of `name` that accepts `args`, together with the
    /// type declaring it.
    ///
    /// Every type in the ancestry declaring `name` is tried, nearest first,
    /// so an overload inherited from a base class stays reachable when a
    /// subclass declares another one. An argument mismatch in any of them
    /// wins over an arity mismatch.
    pub fn select_method(&self, name: &str, args: &[Value]) -> Result<(&WrapperType, &MethodDescriptor)> {
        let mut mismatch = None;
        for declaring in self.ancestry() {
            let Some(dispatcher) = declaring.methods.get(name) else { continue };
            match dispatcher.select(args) {
                Ok(method) => return Ok((declaring, method)),
                Err(Error::OverloadArityMismatch) if mismatch.is_some() => {}
                Err(e) => mismatch = Some(e),
            }
        }
        Err(mismatch.unwrap_or_else(|| Error::NoSuchMethod { class: self.name.clone(), method: name.to_string() }))
    }

    fn factory(&self) -> Result<ClassFactory> {
        self.factory.upgrade().map(|shared| ClassFactory { shared }).ok_or(Error::UnavailableRuntime)
    }
}

impl fmt::Display for WrapperType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for WrapperType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrapperType")
            .field("name", &self.name)
            .field("parent", &self.parent.as_ref().map(|p| p.name()))
            .field("constructors", &self.constructors.len())
            .field("methods", &self.methods.len())
            .finish()
    }
}

struct InstanceInner {
    class: Arc<WrapperType>,
    handle: Option<GlobalRef>,
}

/// A proxy for a foreign object, or for its class alone.
///
/// Clones share the same references; the last clone dropped releases them.
#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceInner>,
}

impl Instance {
    fn class_only(class: Arc<WrapperType>) -> Self {
        Instance { inner: Arc::new(InstanceInner { class, handle: None }) }
    }

    pub fn class(&self) -> &Arc<WrapperType> {
        &self.inner.class
    }

    /// Global reference to the object, or `None` for a class-only proxy.
    pub fn handle(&self) -> Option<jni::jobject> {
        self.inner.handle.as_ref().map(GlobalRef::get)
    }

    pub fn is_class_only(&self) -> bool {
        self.inner.handle.is_none()
    }

    /// Constructs a new foreign object through the class's constructors.
    pub fn new_instance(&self, args: &[Value]) -> Result<Instance> {
        let factory = self.inner.class.factory()?;
        let env = factory.vm().get_env()?;
        let class_only = Instance::class_only(self.inner.class.clone());
        match self.inner.class.constructors.invoke(env, &factory, &self.inner.class, &class_only, args)? {
            Value::Object(instance) => Ok(instance),
            other => Err(Error::ForeignException(format!(
                "{}.<init> produced {} instead of an object",
                self.inner.class.name,
                other.type_name()
            ))),
        }
    }

    /// Calls the method `name`, declared on this class or an ancestor.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        let (declaring, method) = self.inner.class.select_method(name, args)?;
        let factory = self.inner.class.factory()?;
        let env = factory.vm().get_env()?;
        method.invoke(env, &factory, declaring, self, args)
    }

    /// `toString()` of the foreign object; a class-only proxy yields its
    /// class name.
    pub fn to_host_string(&self) -> Result<String> {
        let handle = match self.handle() {
            Some(handle) => handle,
            None => return Ok(self.inner.class.name.clone()),
        };
        let factory = self.inner.class.factory()?;
        let env = factory.vm().get_env()?;
        let _frame = env.push_local_frame(2)?;
        let text = env.call_object_method(handle, env.java_lang_object()?.to_string, &[])?;
        env.check_exception()?;
        env.string_from_jni(text)
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("class", &self.inner.class.name)
            .field("handle", &self.handle())
            .finish()
    }
}

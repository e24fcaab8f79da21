//! In-process fake VM for integration tests.
//!
//! Both function tables are real arrays of `extern "system"` functions at
//! the JNI slot numbers, so the bridge binds and calls them exactly as it
//! would a live VM. Classes, reflection, strings, arrays, exceptions, local
//! frames and global references are simulated behind one mutex.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::ptr;
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use dalvik_bridge::capability::{Enumeration, ExportEnumerator, ExportKind, ModuleExport};
use dalvik_bridge::sys::jni::{self, env_slots as slot, vm_slots};
use dalvik_bridge::Runtime;

// =============================================================================
// Class definitions
// =============================================================================

/// A stored field or call result.
#[derive(Clone, Copy)]
pub enum Field {
    Prim(jni::jvalue),
    Obj(Option<usize>),
}

impl Field {
    pub fn int(v: jni::jint) -> Self {
        Field::Prim(jni::jvalue { i: v })
    }

    fn zero() -> Self {
        Field::Prim(jni::jvalue { j: 0 })
    }
}

#[derive(Clone, Copy)]
pub enum Builtin {
    ClassGetName,
    GetDeclaredConstructors,
    GetDeclaredMethods,
    ObjectToString,
    ConstructorGetParameterTypes,
    MethodGetName,
    MethodGetModifiers,
    MethodGetParameterTypes,
    MethodGetReturnType,
}

/// What a fake method does when called.
#[derive(Clone, Copy)]
pub enum Body {
    Nothing,
    /// Stores every argument as a field of `this`.
    Store,
    /// Returns field `n` of `this`.
    Field(usize),
    This,
    /// Returns argument `n`.
    Echo(usize),
    Const(Field),
    /// Throws `java.lang.IllegalStateException` with the message.
    Throw(&'static str),
    AddInts,
    Length,
    StringCopy,
    Builtin(Builtin),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kind {
    Constructor,
    Static,
    Instance,
}

#[derive(Clone)]
struct Method {
    class: usize,
    name: String,
    kind: Kind,
    params: Vec<String>,
    ret: String,
    body: Body,
}

pub struct ClassDef {
    name: String,
    superclass: Option<String>,
    members: Vec<(String, Kind, Vec<String>, String, Body)>,
}

impl ClassDef {
    pub fn new(name: &str) -> Self {
        ClassDef { name: name.to_string(), superclass: Some("java.lang.Object".to_string()), members: Vec::new() }
    }

    pub fn extends(mut self, superclass: &str) -> Self {
        self.superclass = Some(superclass.to_string());
        self
    }

    pub fn root(mut self) -> Self {
        self.superclass = None;
        self
    }

    pub fn constructor(mut self, params: &[&str], body: Body) -> Self {
        self.members.push(("<init>".to_string(), Kind::Constructor, strings(params), "void".to_string(), body));
        self
    }

    pub fn method(mut self, name: &str, params: &[&str], ret: &str, body: Body) -> Self {
        self.members.push((name.to_string(), Kind::Instance, strings(params), ret.to_string(), body));
        self
    }

    pub fn static_method(mut self, name: &str, params: &[&str], ret: &str, body: Body) -> Self {
        self.members.push((name.to_string(), Kind::Static, strings(params), ret.to_string(), body));
        self
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn is_reference(type_name: &str) -> bool {
    !matches!(type_name, "boolean" | "byte" | "char" | "short" | "int" | "long" | "float" | "double" | "void")
}

// =============================================================================
// Heap
// =============================================================================

struct ClassObject {
    name: String,
    superclass: Option<usize>,
    constructors: Vec<usize>,
    methods: Vec<usize>,
}

enum Object {
    Class(ClassObject),
    Str(String),
    Array(Vec<Option<usize>>),
    Instance { class: usize, fields: Vec<Field> },
    Reflected { method: usize },
    Throwable { class_name: String, message: String },
}

#[derive(Clone, Copy)]
struct Ref {
    object: usize,
    global: bool,
}

#[derive(Default)]
struct State {
    objects: Vec<Object>,
    refs: Vec<Option<Ref>>,
    classes: HashMap<String, usize>,
    type_classes: HashMap<String, usize>,
    methods: Vec<Method>,
    attached: HashSet<ThreadId>,
    pending: Option<usize>,
    open_frames: usize,
    frame_capacities: Vec<jni::jint>,
    fail_next_frame_push: bool,
    find_class_calls: HashMap<String, usize>,
    declared_constructor_calls: HashMap<String, usize>,
    native_calls: usize,
    invoked: Vec<String>,
    attach_calls: usize,
    detach_calls: usize,
    live_globals: usize,
    outstanding_chars: HashMap<usize, usize>,
    misuse: Vec<String>,
}

impl State {
    fn alloc(&mut self, object: Object) -> usize {
        self.objects.push(object);
        self.objects.len() - 1
    }

    fn new_ref(&mut self, object: usize, global: bool) -> jni::jobject {
        self.refs.push(Some(Ref { object, global }));
        if global {
            self.live_globals += 1;
        }
        self.refs.len() as jni::jobject
    }

    fn local(&mut self, object: Option<usize>) -> jni::jobject {
        match object {
            Some(object) => self.new_ref(object, false),
            None => ptr::null_mut(),
        }
    }

    fn resolve(&mut self, handle: jni::jobject) -> Option<usize> {
        if handle.is_null() {
            return None;
        }
        let index = handle as usize - 1;
        match self.refs.get(index) {
            Some(Some(r)) => Some(r.object),
            _ => {
                self.misuse.push(format!("stale or unknown reference {handle:?}"));
                None
            }
        }
    }

    fn class(&self, object: usize) -> Option<&ClassObject> {
        match self.objects.get(object) {
            Some(Object::Class(class)) => Some(class),
            _ => None,
        }
    }

    fn class_name_of(&self, object: usize) -> String {
        match &self.objects[object] {
            Object::Class(_) => "java.lang.Class".to_string(),
            Object::Str(_) => "java.lang.String".to_string(),
            Object::Array(_) => "[Ljava.lang.Object;".to_string(),
            Object::Instance { class, .. } => self.class(*class).map(|c| c.name.clone()).unwrap_or_default(),
            Object::Reflected { method } => {
                if self.methods[*method].kind == Kind::Constructor {
                    "java.lang.reflect.Constructor".to_string()
                } else {
                    "java.lang.reflect.Method".to_string()
                }
            }
            Object::Throwable { class_name, .. } => class_name.clone(),
        }
    }

    /// Class object for any type name, including primitives and arrays.
    fn type_class(&mut self, name: &str) -> usize {
        if let Some(id) = self.classes.get(name).or_else(|| self.type_classes.get(name)) {
            return *id;
        }
        let id = self.alloc(Object::Class(ClassObject {
            name: name.to_string(),
            superclass: None,
            constructors: Vec::new(),
            methods: Vec::new(),
        }));
        self.type_classes.insert(name.to_string(), id);
        id
    }

    fn string(&mut self, s: &str) -> Field {
        Field::Obj(Some(self.alloc(Object::Str(s.to_string()))))
    }

    fn throw(&mut self, class_name: &str, message: &str) {
        let id = self.alloc(Object::Throwable { class_name: class_name.to_string(), message: message.to_string() });
        self.pending = Some(id);
    }

    fn define(&mut self, def: ClassDef) {
        let superclass = def.superclass.as_ref().map(|s| self.classes[s.as_str()]);
        let class = self.alloc(Object::Class(ClassObject {
            name: def.name.clone(),
            superclass,
            constructors: Vec::new(),
            methods: Vec::new(),
        }));
        self.classes.insert(def.name, class);

        for (name, kind, params, ret, body) in def.members {
            self.methods.push(Method { class, name, kind, params, ret, body });
            let index = self.methods.len() - 1;
            if let Object::Class(c) = &mut self.objects[class] {
                if kind == Kind::Constructor {
                    c.constructors.push(index);
                } else {
                    c.methods.push(index);
                }
            }
        }
    }

    fn find_method(&self, class: usize, name: &str, want_static: bool) -> Option<usize> {
        let mut current = Some(class);
        while let Some(id) = current {
            let c = self.class(id)?;
            let members = if name == "<init>" { &c.constructors } else { &c.methods };
            let found = members.iter().copied().find(|m| {
                let m = &self.methods[*m];
                m.name == name && (m.kind == Kind::Static) == want_static
            });
            if found.is_some() {
                return found;
            }
            if name == "<init>" {
                return None;
            }
            current = c.superclass;
        }
        None
    }

    fn signature(&self, method: &Method) -> String {
        let class = self.class(method.class).map(|c| c.name.as_str()).unwrap_or("?");
        format!("{}.{}({})", class, method.name, method.params.join(","))
    }

    unsafe fn invoke(
        &mut self,
        receiver: jni::jobject,
        method: jni::jmethodID,
        args: *const jni::jvalue,
        family: Kind,
    ) -> Field {
        let Some(m) = self.methods.get((method as usize).wrapping_sub(1)).cloned() else {
            self.misuse.push(format!("unknown method id {method:?}"));
            return Field::zero();
        };
        if self.pending.is_some() {
            self.misuse.push(format!("{} called with an exception pending", self.signature(&m)));
        }
        if m.kind != family {
            self.misuse.push(format!("{} called through the {family:?} family", self.signature(&m)));
        }
        self.native_calls += 1;
        let signature = self.signature(&m);
        self.invoked.push(signature.clone());

        let receiver = self.resolve(receiver);
        // Static and constructor method ids are only valid with their declaring class.
        if m.kind != Kind::Instance && receiver != Some(m.class) {
            let got = receiver.and_then(|r| self.class(r)).map_or_else(|| "?".to_string(), |c| c.name.clone());
            self.misuse.push(format!("{signature} called with class {got}"));
        }
        let mut argv = Vec::with_capacity(m.params.len());
        for (i, param) in m.params.iter().enumerate() {
            let value = *args.add(i);
            argv.push(if is_reference(param) { Field::Obj(self.resolve(value.l)) } else { Field::Prim(value) });
        }

        match m.kind {
            Kind::Constructor => {
                let this = self.alloc(Object::Instance { class: m.class, fields: Vec::new() });
                self.run(&m, Some(this), &argv);
                Field::Obj(Some(this))
            }
            Kind::Static => self.run(&m, None, &argv),
            Kind::Instance => self.run(&m, receiver, &argv),
        }
    }

    fn run(&mut self, m: &Method, this: Option<usize>, args: &[Field]) -> Field {
        match m.body {
            Body::Nothing => Field::zero(),
            Body::Store => {
                if let Some(Object::Instance { fields, .. }) = this.and_then(|t| self.objects.get_mut(t)) {
                    *fields = args.to_vec();
                }
                Field::zero()
            }
            Body::Field(n) => match this.and_then(|t| self.objects.get(t)) {
                Some(Object::Instance { fields, .. }) => fields.get(n).copied().unwrap_or(Field::zero()),
                _ => Field::zero(),
            },
            Body::This => Field::Obj(this),
            Body::Echo(n) => args.get(n).copied().unwrap_or(Field::zero()),
            Body::Const(field) => field,
            Body::Throw(message) => {
                self.throw("java.lang.IllegalStateException", message);
                Field::zero()
            }
            Body::AddInts => {
                let sum = args.iter().map(|a| match a {
                    Field::Prim(v) => unsafe { v.i },
                    Field::Obj(_) => 0,
                });
                Field::int(sum.sum())
            }
            Body::Length => match this.and_then(|t| self.objects.get(t)) {
                Some(Object::Str(s)) => Field::int(s.encode_utf16().count() as jni::jint),
                _ => Field::zero(),
            },
            Body::StringCopy => {
                let text = match args.first() {
                    Some(Field::Obj(Some(id))) => match &self.objects[*id] {
                        Object::Str(s) => s.clone(),
                        _ => String::new(),
                    },
                    _ => String::new(),
                };
                if let Some(this) = this {
                    self.objects[this] = Object::Str(text);
                }
                Field::zero()
            }
            Body::Builtin(builtin) => match this {
                Some(this) => self.builtin(builtin, this),
                None => Field::zero(),
            },
        }
    }

    fn builtin(&mut self, builtin: Builtin, this: usize) -> Field {
        match builtin {
            Builtin::ClassGetName => {
                let name = self.class(this).map(|c| c.name.clone()).unwrap_or_default();
                self.string(&name)
            }
            Builtin::GetDeclaredConstructors | Builtin::GetDeclaredMethods => {
                let Some(class) = self.class(this) else { return Field::Obj(None) };
                let (name, members) = if matches!(builtin, Builtin::GetDeclaredConstructors) {
                    (class.name.clone(), class.constructors.clone())
                } else {
                    (String::new(), class.methods.clone())
                };
                if !name.is_empty() {
                    *self.declared_constructor_calls.entry(name).or_default() += 1;
                }
                let elements = members
                    .into_iter()
                    .map(|method| Some(self.alloc(Object::Reflected { method })))
                    .collect();
                Field::Obj(Some(self.alloc(Object::Array(elements))))
            }
            Builtin::ObjectToString => {
                let text = match &self.objects[this] {
                    Object::Str(s) => s.clone(),
                    Object::Throwable { class_name, message } => format!("{class_name}: {message}"),
                    Object::Class(c) => format!("class {}", c.name),
                    _ => format!("{}@{:x}", self.class_name_of(this), this),
                };
                self.string(&text)
            }
            Builtin::ConstructorGetParameterTypes | Builtin::MethodGetParameterTypes => {
                let Object::Reflected { method } = self.objects[this] else { return Field::Obj(None) };
                let params = self.methods[method].params.clone();
                let elements = params.iter().map(|p| Some(self.type_class(p))).collect();
                Field::Obj(Some(self.alloc(Object::Array(elements))))
            }
            Builtin::MethodGetName => {
                let Object::Reflected { method } = self.objects[this] else { return Field::Obj(None) };
                let name = self.methods[method].name.clone();
                self.string(&name)
            }
            Builtin::MethodGetModifiers => {
                let Object::Reflected { method } = self.objects[this] else { return Field::zero() };
                let public = 0x0001;
                let modifiers = if self.methods[method].kind == Kind::Static { public | jni::ACC_STATIC } else { public };
                Field::int(modifiers)
            }
            Builtin::MethodGetReturnType => {
                let Object::Reflected { method } = self.objects[this] else { return Field::Obj(None) };
                let ret = self.methods[method].ret.clone();
                Field::Obj(Some(self.type_class(&ret)))
            }
        }
    }
}

// =============================================================================
// Handles and the VM
// =============================================================================

#[repr(C)]
struct VmHandle {
    functions: *const *const c_void,
    owner: *const Inner,
}

#[repr(C)]
struct EnvHandle {
    functions: *const *const c_void,
    owner: *const Inner,
}

struct Inner {
    vm_table: Vec<*const c_void>,
    env_table: Vec<*const c_void>,
    vm_handle: VmHandle,
    env_handle: EnvHandle,
    // Stand-in for the exported `gDvmJni`; the VM pointer sits at byte 8.
    dvm_jni: [usize; 4],
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Locks for an environment call, flagging calls from detached threads.
    fn env_call(&self) -> MutexGuard<'_, State> {
        let mut state = self.lock();
        if !state.attached.contains(&thread::current().id()) {
            state.misuse.push("environment used from a detached thread".to_string());
        }
        state
    }
}

pub struct FakeVm {
    inner: Box<Inner>,
}

// The raw pointers only ever point into `inner`.
unsafe impl Send for FakeVm {}
unsafe impl Sync for FakeVm {}

impl FakeVm {
    pub fn new() -> Self {
        let mut inner = Box::new(Inner {
            vm_table: vm_table(),
            env_table: env_table(),
            vm_handle: VmHandle { functions: ptr::null(), owner: ptr::null() },
            env_handle: EnvHandle { functions: ptr::null(), owner: ptr::null() },
            dvm_jni: [0; 4],
            state: Mutex::new(State::default()),
        });
        let owner: *const Inner = &*inner;
        inner.vm_handle = VmHandle { functions: inner.vm_table.as_ptr(), owner };
        inner.env_handle = EnvHandle { functions: inner.env_table.as_ptr(), owner };
        let vm_address = &inner.vm_handle as *const VmHandle as usize;
        inner.dvm_jni[8 / std::mem::size_of::<usize>()] = vm_address;

        let vm = FakeVm { inner };
        vm.define_builtins();
        vm
    }

    fn define_builtins(&self) {
        use Builtin::*;
        self.define(
            ClassDef::new("java.lang.Object")
                .root()
                .constructor(&[], Body::Nothing)
                .method("toString", &[], "java.lang.String", Body::Builtin(ObjectToString)),
        );
        self.define(
            ClassDef::new("java.lang.Class")
                .method("getName", &[], "java.lang.String", Body::Builtin(ClassGetName))
                .method("getDeclaredConstructors", &[], "[Ljava.lang.reflect.Constructor;", Body::Builtin(GetDeclaredConstructors))
                .method("getDeclaredMethods", &[], "[Ljava.lang.reflect.Method;", Body::Builtin(GetDeclaredMethods)),
        );
        self.define(
            ClassDef::new("java.lang.String")
                .constructor(&["java.lang.String"], Body::StringCopy)
                .method("length", &[], "int", Body::Length),
        );
        self.define(
            ClassDef::new("java.lang.reflect.Constructor")
                .method("getParameterTypes", &[], "[Ljava.lang.Class;", Body::Builtin(ConstructorGetParameterTypes)),
        );
        self.define(
            ClassDef::new("java.lang.reflect.Method")
                .method("getName", &[], "java.lang.String", Body::Builtin(MethodGetName))
                .method("getModifiers", &[], "int", Body::Builtin(MethodGetModifiers))
                .method("getParameterTypes", &[], "[Ljava.lang.Class;", Body::Builtin(MethodGetParameterTypes))
                .method("getReturnType", &[], "java.lang.Class", Body::Builtin(MethodGetReturnType)),
        );
    }

    pub fn define(&self, def: ClassDef) {
        self.inner.lock().define(def);
    }

    pub fn raw_vm(&self) -> *mut jni::JavaVM {
        &self.inner.vm_handle as *const VmHandle as *mut jni::JavaVM
    }

    pub fn runtime(&self) -> Runtime {
        unsafe { Runtime::from_java_vm(self.raw_vm(), jni::JNI_VERSION_1_6) }
    }

    /// Exports of a fake `libdvm.so`.
    pub fn exports(&self) -> FakeExports {
        FakeExports {
            module: "libdvm.so".to_string(),
            exports: vec![
                ("dvmStartup".to_string(), ExportKind::Function, fake_export as usize),
                ("_Z18dvmFindLoadedClassPKc".to_string(), ExportKind::Function, fake_export as usize),
                ("gDvmJni".to_string(), ExportKind::Variable, self.inner.dvm_jni.as_ptr() as usize),
            ],
        }
    }

    /// Allocates an instance of `class` and returns a global reference the
    /// caller owns.
    pub fn alloc_instance(&self, class: &str, fields: Vec<Field>) -> jni::jobject {
        let mut state = self.inner.lock();
        let class = state.classes[class];
        let id = state.alloc(Object::Instance { class, fields });
        state.new_ref(id, true)
    }

    /// Attaches the current thread the way the VM itself would.
    pub fn attach_externally(&self) {
        self.inner.lock().attached.insert(thread::current().id());
    }

    pub fn detach_externally(&self) {
        self.inner.lock().attached.remove(&thread::current().id());
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().attached.contains(&thread::current().id())
    }

    pub fn fail_next_frame_push(&self) {
        self.inner.lock().fail_next_frame_push = true;
    }

    pub fn same_object(&self, a: jni::jobject, b: jni::jobject) -> bool {
        let mut state = self.inner.lock();
        state.resolve(a) == state.resolve(b)
    }

    pub fn find_class_calls(&self, slash_name: &str) -> usize {
        self.inner.lock().find_class_calls.get(slash_name).copied().unwrap_or(0)
    }

    pub fn declared_constructor_calls(&self, class: &str) -> usize {
        self.inner.lock().declared_constructor_calls.get(class).copied().unwrap_or(0)
    }

    pub fn native_calls(&self) -> usize {
        self.inner.lock().native_calls
    }

    pub fn invoked(&self) -> Vec<String> {
        self.inner.lock().invoked.clone()
    }

    pub fn attach_calls(&self) -> usize {
        self.inner.lock().attach_calls
    }

    pub fn detach_calls(&self) -> usize {
        self.inner.lock().detach_calls
    }

    pub fn live_globals(&self) -> usize {
        self.inner.lock().live_globals
    }

    pub fn open_frames(&self) -> usize {
        self.inner.lock().open_frames
    }

    pub fn frame_capacities(&self) -> Vec<jni::jint> {
        self.inner.lock().frame_capacities.clone()
    }

    pub fn exception_pending(&self) -> bool {
        self.inner.lock().pending.is_some()
    }

    pub fn misuse(&self) -> Vec<String> {
        let state = self.inner.lock();
        let mut misuse = state.misuse.clone();
        if !state.outstanding_chars.is_empty() {
            misuse.push(format!("{} string buffers never released", state.outstanding_chars.len()));
        }
        misuse
    }

    pub fn assert_clean(&self) {
        assert_eq!(self.misuse(), Vec::<String>::new());
        assert_eq!(self.open_frames(), 0, "local frame left open");
        assert!(!self.exception_pending(), "exception left pending");
    }
}

impl Default for FakeVm {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FakeExports {
    module: String,
    exports: Vec<(String, ExportKind, usize)>,
}

impl FakeExports {
    pub fn without(mut self, name: &str) -> Self {
        self.exports.retain(|(n, _, _)| n != name);
        self
    }
}

impl ExportEnumerator for FakeExports {
    fn enumerate_exports(&self, module: &str, on_match: &mut dyn FnMut(&ModuleExport<'_>) -> Enumeration) {
        if module != self.module {
            return;
        }
        for (name, kind, address) in &self.exports {
            let export = ModuleExport { name, kind: *kind, address: *address as *const c_void };
            if on_match(&export) == Enumeration::Stop {
                return;
            }
        }
    }
}

extern "C" fn fake_export() {}

// =============================================================================
// Function tables
// =============================================================================

unsafe fn vm_owner<'a>(vm: *mut jni::JavaVM) -> &'a Inner {
    &*(*(vm as *const VmHandle)).owner
}

unsafe fn env_owner<'a>(env: *mut jni::JNIEnv) -> &'a Inner {
    &*(*(env as *const EnvHandle)).owner
}

fn vm_table() -> Vec<*const c_void> {
    let mut table = vec![ptr::null(); vm_slots::COUNT];
    table[vm_slots::ATTACH_CURRENT_THREAD] = attach_current_thread as *const c_void;
    table[vm_slots::DETACH_CURRENT_THREAD] = detach_current_thread as *const c_void;
    table[vm_slots::GET_ENV] = get_env as *const c_void;
    table
}

fn env_table() -> Vec<*const c_void> {
    let mut table = vec![ptr::null(); slot::COUNT];
    table[slot::FIND_CLASS] = find_class as *const c_void;
    table[slot::FROM_REFLECTED_METHOD] = from_reflected_method as *const c_void;
    table[slot::GET_SUPERCLASS] = get_superclass as *const c_void;
    table[slot::EXCEPTION_OCCURRED] = exception_occurred as *const c_void;
    table[slot::EXCEPTION_DESCRIBE] = exception_describe as *const c_void;
    table[slot::EXCEPTION_CLEAR] = exception_clear as *const c_void;
    table[slot::PUSH_LOCAL_FRAME] = push_local_frame as *const c_void;
    table[slot::POP_LOCAL_FRAME] = pop_local_frame as *const c_void;
    table[slot::NEW_GLOBAL_REF] = new_global_ref as *const c_void;
    table[slot::DELETE_GLOBAL_REF] = delete_global_ref as *const c_void;
    table[slot::DELETE_LOCAL_REF] = delete_local_ref as *const c_void;
    table[slot::IS_SAME_OBJECT] = is_same_object as *const c_void;
    table[slot::NEW_LOCAL_REF] = new_local_ref as *const c_void;
    table[slot::NEW_OBJECT_A] = new_object_a as *const c_void;
    table[slot::GET_METHOD_ID] = get_method_id as *const c_void;
    table[slot::GET_STATIC_METHOD_ID] = get_static_method_id as *const c_void;
    table[slot::NEW_STRING] = new_string as *const c_void;
    table[slot::GET_STRING_LENGTH] = get_string_length as *const c_void;
    table[slot::GET_STRING_CHARS] = get_string_chars as *const c_void;
    table[slot::RELEASE_STRING_CHARS] = release_string_chars as *const c_void;
    table[slot::GET_ARRAY_LENGTH] = get_array_length as *const c_void;
    table[slot::GET_OBJECT_ARRAY_ELEMENT] = get_object_array_element as *const c_void;

    macro_rules! family {
        ($instance:expr, $static_:expr, $ty:ty) => {
            table[$instance + slot::ARRAY_VARIANT] = call_a::<$ty> as *const c_void;
            table[$static_ + slot::ARRAY_VARIANT] = call_static_a::<$ty> as *const c_void;
        };
    }
    family!(slot::CALL_OBJECT_METHOD, slot::CALL_STATIC_OBJECT_METHOD, jni::jobject);
    family!(slot::CALL_BOOLEAN_METHOD, slot::CALL_STATIC_BOOLEAN_METHOD, jni::jboolean);
    family!(slot::CALL_BYTE_METHOD, slot::CALL_STATIC_BYTE_METHOD, jni::jbyte);
    family!(slot::CALL_CHAR_METHOD, slot::CALL_STATIC_CHAR_METHOD, jni::jchar);
    family!(slot::CALL_SHORT_METHOD, slot::CALL_STATIC_SHORT_METHOD, jni::jshort);
    family!(slot::CALL_INT_METHOD, slot::CALL_STATIC_INT_METHOD, jni::jint);
    family!(slot::CALL_LONG_METHOD, slot::CALL_STATIC_LONG_METHOD, jni::jlong);
    family!(slot::CALL_FLOAT_METHOD, slot::CALL_STATIC_FLOAT_METHOD, jni::jfloat);
    family!(slot::CALL_DOUBLE_METHOD, slot::CALL_STATIC_DOUBLE_METHOD, jni::jdouble);
    family!(slot::CALL_VOID_METHOD, slot::CALL_STATIC_VOID_METHOD, ());
    table
}

// --- VM ---

unsafe extern "system" fn attach_current_thread(vm: *mut jni::JavaVM, penv: *mut *mut c_void, _args: *mut c_void) -> jni::jint {
    let inner = vm_owner(vm);
    let mut state = inner.lock();
    state.attach_calls += 1;
    state.attached.insert(thread::current().id());
    *penv = &inner.env_handle as *const EnvHandle as *mut c_void;
    jni::JNI_OK
}

unsafe extern "system" fn detach_current_thread(vm: *mut jni::JavaVM) -> jni::jint {
    let mut state = vm_owner(vm).lock();
    state.detach_calls += 1;
    if state.attached.remove(&thread::current().id()) {
        jni::JNI_OK
    } else {
        jni::JNI_EDETACHED
    }
}

unsafe extern "system" fn get_env(vm: *mut jni::JavaVM, penv: *mut *mut c_void, version: jni::jint) -> jni::jint {
    let inner = vm_owner(vm);
    let state = inner.lock();
    if version > jni::JNI_VERSION_1_6 {
        *penv = ptr::null_mut();
        return jni::JNI_EVERSION;
    }
    if state.attached.contains(&thread::current().id()) {
        *penv = &inner.env_handle as *const EnvHandle as *mut c_void;
        jni::JNI_OK
    } else {
        *penv = ptr::null_mut();
        jni::JNI_EDETACHED
    }
}

// --- Classes ---

unsafe extern "system" fn find_class(env: *mut jni::JNIEnv, name: *const c_char) -> jni::jclass {
    let mut state = env_owner(env).env_call();
    let slash = CStr::from_ptr(name).to_string_lossy().into_owned();
    *state.find_class_calls.entry(slash.clone()).or_default() += 1;
    let dotted = slash.replace('/', ".");
    match state.classes.get(&dotted).copied() {
        Some(class) => state.local(Some(class)),
        None => {
            state.throw("java.lang.NoClassDefFoundError", &slash);
            ptr::null_mut()
        }
    }
}

unsafe extern "system" fn get_superclass(env: *mut jni::JNIEnv, class: jni::jclass) -> jni::jclass {
    let mut state = env_owner(env).env_call();
    let superclass = state.resolve(class).and_then(|c| state.class(c)).and_then(|c| c.superclass);
    state.local(superclass)
}

unsafe extern "system" fn from_reflected_method(env: *mut jni::JNIEnv, method: jni::jobject) -> jni::jmethodID {
    let mut state = env_owner(env).env_call();
    match state.resolve(method).map(|m| &state.objects[m]) {
        Some(Object::Reflected { method }) => (*method + 1) as jni::jmethodID,
        _ => ptr::null_mut(),
    }
}

unsafe fn lookup_method(env: *mut jni::JNIEnv, class: jni::jclass, name: *const c_char, want_static: bool) -> jni::jmethodID {
    let mut state = env_owner(env).env_call();
    let name = CStr::from_ptr(name).to_string_lossy().into_owned();
    let found = state.resolve(class).and_then(|c| state.find_method(c, &name, want_static));
    match found {
        Some(index) => (index + 1) as jni::jmethodID,
        None => {
            state.throw("java.lang.NoSuchMethodError", &name);
            ptr::null_mut()
        }
    }
}

unsafe extern "system" fn get_method_id(env: *mut jni::JNIEnv, class: jni::jclass, name: *const c_char, _sig: *const c_char) -> jni::jmethodID {
    lookup_method(env, class, name, false)
}

unsafe extern "system" fn get_static_method_id(env: *mut jni::JNIEnv, class: jni::jclass, name: *const c_char, _sig: *const c_char) -> jni::jmethodID {
    lookup_method(env, class, name, true)
}

// --- Exceptions ---

unsafe extern "system" fn exception_occurred(env: *mut jni::JNIEnv) -> jni::jthrowable {
    let mut state = env_owner(env).env_call();
    let pending = state.pending;
    state.local(pending)
}

unsafe extern "system" fn exception_describe(env: *mut jni::JNIEnv) {
    let _state = env_owner(env).env_call();
}

unsafe extern "system" fn exception_clear(env: *mut jni::JNIEnv) {
    env_owner(env).env_call().pending = None;
}

// --- Frames and references ---

unsafe extern "system" fn push_local_frame(env: *mut jni::JNIEnv, capacity: jni::jint) -> jni::jint {
    let mut state = env_owner(env).env_call();
    if std::mem::take(&mut state.fail_next_frame_push) {
        state.throw("java.lang.OutOfMemoryError", "could not reserve local frame");
        return jni::JNI_ENOMEM;
    }
    state.open_frames += 1;
    state.frame_capacities.push(capacity);
    jni::JNI_OK
}

unsafe extern "system" fn pop_local_frame(env: *mut jni::JNIEnv, result: jni::jobject) -> jni::jobject {
    let mut state = env_owner(env).env_call();
    if state.open_frames == 0 {
        state.misuse.push("popped a frame that was never pushed".to_string());
    } else {
        state.open_frames -= 1;
    }
    result
}

unsafe extern "system" fn new_global_ref(env: *mut jni::JNIEnv, obj: jni::jobject) -> jni::jobject {
    let mut state = env_owner(env).env_call();
    match state.resolve(obj) {
        Some(object) => state.new_ref(object, true),
        None => ptr::null_mut(),
    }
}

unsafe extern "system" fn new_local_ref(env: *mut jni::JNIEnv, obj: jni::jobject) -> jni::jobject {
    let mut state = env_owner(env).env_call();
    let object = state.resolve(obj);
    state.local(object)
}

unsafe fn delete_ref(env: *mut jni::JNIEnv, obj: jni::jobject, global: bool) {
    let mut state = env_owner(env).env_call();
    if obj.is_null() {
        return;
    }
    let index = obj as usize - 1;
    match state.refs.get(index).copied().flatten() {
        Some(r) if r.global == global => {
            state.refs[index] = None;
            if global {
                state.live_globals -= 1;
            }
        }
        Some(_) => state.misuse.push(format!("reference {obj:?} deleted with the wrong kind")),
        None => state.misuse.push(format!("reference {obj:?} deleted twice")),
    }
}

unsafe extern "system" fn delete_global_ref(env: *mut jni::JNIEnv, obj: jni::jobject) {
    delete_ref(env, obj, true)
}

unsafe extern "system" fn delete_local_ref(env: *mut jni::JNIEnv, obj: jni::jobject) {
    delete_ref(env, obj, false)
}

unsafe extern "system" fn is_same_object(env: *mut jni::JNIEnv, a: jni::jobject, b: jni::jobject) -> jni::jboolean {
    let mut state = env_owner(env).env_call();
    if state.resolve(a) == state.resolve(b) {
        jni::JNI_TRUE
    } else {
        jni::JNI_FALSE
    }
}

// --- Strings and arrays ---

unsafe extern "system" fn new_string(env: *mut jni::JNIEnv, unicode: *const jni::jchar, len: jni::jsize) -> jni::jstring {
    let mut state = env_owner(env).env_call();
    let units = if len > 0 { std::slice::from_raw_parts(unicode, len as usize) } else { &[] };
    let id = state.alloc(Object::Str(String::from_utf16_lossy(units)));
    state.local(Some(id))
}

fn string_units(state: &mut State, s: jni::jstring) -> Option<Vec<jni::jchar>> {
    match state.resolve(s).map(|id| &state.objects[id]) {
        Some(Object::Str(text)) => Some(text.encode_utf16().collect()),
        _ => None,
    }
}

unsafe extern "system" fn get_string_length(env: *mut jni::JNIEnv, s: jni::jstring) -> jni::jsize {
    let mut state = env_owner(env).env_call();
    string_units(&mut state, s).map_or(0, |units| units.len() as jni::jsize)
}

unsafe extern "system" fn get_string_chars(env: *mut jni::JNIEnv, s: jni::jstring, is_copy: *mut jni::jboolean) -> *const jni::jchar {
    let mut state = env_owner(env).env_call();
    let Some(units) = string_units(&mut state, s) else { return ptr::null() };
    if !is_copy.is_null() {
        *is_copy = jni::JNI_TRUE;
    }
    let len = units.len();
    let chars = Box::into_raw(units.into_boxed_slice()) as *mut jni::jchar;
    state.outstanding_chars.insert(chars as usize, len);
    chars
}

unsafe extern "system" fn release_string_chars(env: *mut jni::JNIEnv, _s: jni::jstring, chars: *const jni::jchar) {
    let mut state = env_owner(env).env_call();
    match state.outstanding_chars.remove(&(chars as usize)) {
        Some(len) => drop(Box::from_raw(ptr::slice_from_raw_parts_mut(chars as *mut jni::jchar, len))),
        None => state.misuse.push(format!("released unknown string buffer {chars:?}")),
    }
}

unsafe extern "system" fn get_array_length(env: *mut jni::JNIEnv, array: jni::jarray) -> jni::jsize {
    let mut state = env_owner(env).env_call();
    match state.resolve(array).map(|id| &state.objects[id]) {
        Some(Object::Array(elements)) => elements.len() as jni::jsize,
        _ => 0,
    }
}

unsafe extern "system" fn get_object_array_element(env: *mut jni::JNIEnv, array: jni::jobjectArray, index: jni::jsize) -> jni::jobject {
    let mut state = env_owner(env).env_call();
    let element = match state.resolve(array).map(|id| &state.objects[id]) {
        Some(Object::Array(elements)) => elements.get(index as usize).copied().flatten(),
        _ => None,
    };
    state.local(element)
}

// --- Calls ---

trait Ret {
    fn from_field(field: Field, state: &mut State) -> Self;
}

macro_rules! impl_ret {
    ($($ty:ty => $member:ident),* $(,)?) => {
        $(
            impl Ret for $ty {
                fn from_field(field: Field, _state: &mut State) -> Self {
                    match field {
                        Field::Prim(v) => unsafe { v.$member },
                        Field::Obj(_) => Default::default(),
                    }
                }
            }
        )*
    };
}

impl_ret! {
    jni::jboolean => z,
    jni::jbyte => b,
    jni::jchar => c,
    jni::jshort => s,
    jni::jint => i,
    jni::jlong => j,
    jni::jfloat => f,
    jni::jdouble => d,
}

impl Ret for jni::jobject {
    fn from_field(field: Field, state: &mut State) -> Self {
        match field {
            Field::Obj(object) => state.local(object),
            Field::Prim(_) => ptr::null_mut(),
        }
    }
}

impl Ret for () {
    fn from_field(_field: Field, _state: &mut State) -> Self {}
}

unsafe extern "system" fn call_a<R: Ret>(env: *mut jni::JNIEnv, receiver: jni::jobject, method: jni::jmethodID, args: *const jni::jvalue) -> R {
    let mut state = env_owner(env).env_call();
    let field = state.invoke(receiver, method, args, Kind::Instance);
    R::from_field(field, &mut state)
}

unsafe extern "system" fn call_static_a<R: Ret>(env: *mut jni::JNIEnv, class: jni::jclass, method: jni::jmethodID, args: *const jni::jvalue) -> R {
    let mut state = env_owner(env).env_call();
    let field = state.invoke(class, method, args, Kind::Static);
    R::from_field(field, &mut state)
}

unsafe extern "system" fn new_object_a(env: *mut jni::JNIEnv, class: jni::jclass, method: jni::jmethodID, args: *const jni::jvalue) -> jni::jobject {
    let mut state = env_owner(env).env_call();
    let field = state.invoke(class, method, args, Kind::Constructor);
    <jni::jobject as Ret>::from_field(field, &mut state)
}

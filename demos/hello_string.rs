//! Library template: load it into an app process with `System.loadLibrary`
//! and it builds a `java.lang.String` through the bridge.

use std::ffi::c_void;
use std::sync::OnceLock;

use dalvik_bridge::prelude::*;
use tracing::{error, info};

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn hello(runtime: &Runtime) -> dalvik_bridge::Result<String> {
    runtime.perform(|_env| {
        let string = runtime.use_class("java.lang.String")?;
        let greeting = string.new_instance(&["Hello Java!".into()])?;
        let length = greeting.call("length", &[])?;
        info!(?length, "created {}", string.class());
        greeting.to_host_string()
    })
}

#[no_mangle]
pub extern "system" fn JNI_OnLoad(vm: *mut jni::JavaVM, _reserved: *mut c_void) -> jni::jint {
    let runtime = RUNTIME.get_or_init(|| unsafe { Runtime::from_java_vm(vm, jni::JNI_VERSION_1_6) });
    match hello(runtime) {
        Ok(text) => {
            info!("{text}");
            jni::JNI_VERSION_1_6
        }
        Err(e) => {
            error!("bridge failed: {e}");
            jni::JNI_ERR
        }
    }
}

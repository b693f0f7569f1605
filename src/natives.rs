//! Registry of host-provided native methods.
use std::collections::HashMap;

use crate::error::Result;
use crate::interpreter::Interpreter;
use crate::runtime::{Frame, Value};

/// A host function standing in for a native method. The frame carries the
/// call's arguments in its locals (`this` in slot 0 for instance methods);
/// a returned value is pushed on the caller's operand stack.
pub type NativeFn = fn(&mut Frame, &mut Interpreter) -> Result<Option<Value>>;

/// Process-wide mapping from `(owner_class, method_name, descriptor)` to
/// host functions. Populated once at bootstrap, read-only afterwards.
#[derive(Default)]
pub struct NativeRegistry {
    table: HashMap<(String, String, String), NativeFn>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `java/lang/Object` and
    /// `java/lang/System` natives installed.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            "java/lang/Object",
            "hashCode",
            "()I",
            object_hash_code,
        );
        registry.register(
            "java/lang/Object",
            "getClass",
            "()Ljava/lang/Class;",
            object_get_class,
        );
        registry.register(
            "java/lang/Object",
            "clone",
            "()Ljava/lang/Object;",
            object_clone,
        );
        registry.register("java/lang/Object", "<init>", "()V", no_op);
        registry.register("java/lang/Object", "registerNatives", "()V", no_op);
        registry.register("java/lang/System", "registerNatives", "()V", no_op);
        registry
    }

    pub fn register(
        &mut self,
        class_name: &str,
        method_name: &str,
        descriptor: &str,
        func: NativeFn,
    ) {
        self.table.insert(
            (
                class_name.to_owned(),
                method_name.to_owned(),
                descriptor.to_owned(),
            ),
            func,
        );
    }

    /// Exact lookup; there is no descriptor or superclass fuzzing here.
    pub fn find(
        &self,
        class_name: &str,
        method_name: &str,
        descriptor: &str,
    ) -> Option<NativeFn> {
        self.table
            .get(&(
                class_name.to_owned(),
                method_name.to_owned(),
                descriptor.to_owned(),
            ))
            .copied()
    }
}

/// hashCode: the reference itself is the hash.
fn object_hash_code(
    frame: &mut Frame,
    _interp: &mut Interpreter,
) -> Result<Option<Value>> {
    let objref = frame.locals.get_ref(0)?;
    log::debug!("Object.hashCode on ref {objref}");
    Ok(Some(Value::Int(objref as i32)))
}

/// getClass: builds a `java/lang/Class` object recording the origin class
/// name in its `name` field.
fn object_get_class(
    frame: &mut Frame,
    interp: &mut Interpreter,
) -> Result<Option<Value>> {
    let objref = frame.locals.get_ref(0)?;
    let class_name = interp.object_class_name(objref)?;
    let class_obj = interp.new_class_object(&class_name)?;
    log::debug!("Object.getClass on ref {objref} -> {class_name}");
    Ok(Some(Value::Ref(class_obj)))
}

/// clone: shallow copy, field map copied by value.
fn object_clone(
    frame: &mut Frame,
    interp: &mut Interpreter,
) -> Result<Option<Value>> {
    let objref = frame.locals.get_ref(0)?;
    let copy = interp.shallow_clone_object(objref)?;
    log::debug!("Object.clone {objref} -> {copy}");
    Ok(Some(Value::Ref(copy)))
}

fn no_op(
    _frame: &mut Frame,
    _interp: &mut Interpreter,
) -> Result<Option<Value>> {
    Ok(None)
}

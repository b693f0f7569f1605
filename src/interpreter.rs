//! The bytecode interpreter: a dispatch loop over the current frame of the
//! thread's call stack, plus method resolution and invocation.
use std::collections::HashSet;
use std::rc::Rc;

use crate::bytecode::OPCode;
use crate::error::{Error, Result};
use crate::heap::{Heap, HeapObject};
use crate::jvm::{CPInfo, ACC_NATIVE, ACC_STATIC};
use crate::loader::ClassLoader;
use crate::natives::NativeRegistry;
use crate::program::{descriptor_width, BaseTypeKind, Class, Method, MethodSig};
use crate::runtime::{Frame, JavaThread, RefT, Value};

/// Which invoke opcode asked for a call; decides receiver handling and
/// where resolution starts.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum InvokeKind {
    Virtual,
    Special,
    Static,
    Interface,
}

/// `Interpreter` executes bytecode methods against a class loader, the
/// object pool and the native registry. A single thread's call stack is
/// driven until it empties.
pub struct Interpreter {
    loader: ClassLoader,
    heap: Heap,
    natives: NativeRegistry,
    thread: JavaThread,
    // Classes whose <clinit> has run (or begun), by name.
    initialized: HashSet<String>,
    // The one java/io/PrintStream object behind System.out.
    print_stream: RefT,
    // Values returned by outermost frames; the last one is the program
    // result.
    return_values: Vec<Value>,
    // When set, println output is collected here instead of stdout.
    captured_output: Option<Vec<String>>,
}

impl Interpreter {
    pub fn new(loader: ClassLoader) -> Self {
        let mut heap = Heap::new();
        let print_stream = heap.alloc_instance("java/io/PrintStream");
        Self {
            loader,
            heap,
            natives: NativeRegistry::with_builtins(),
            thread: JavaThread::new(),
            initialized: HashSet::new(),
            print_stream,
            return_values: Vec::new(),
            captured_output: None,
        }
    }

    pub fn loader(&self) -> &ClassLoader {
        &self.loader
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Redirects println output into a buffer readable via `captured`.
    pub fn capture_output(&mut self) {
        self.captured_output = Some(Vec::new());
    }

    pub fn captured(&self) -> &[String] {
        self.captured_output.as_deref().unwrap_or(&[])
    }

    /// Returns the most recent outermost return value. Used by tests and
    /// by hosts that run value-returning entry methods.
    pub fn top_return_value(&self) -> Option<Value> {
        self.return_values.last().copied()
    }

    /// Loads a class (and its superclasses) on demand and runs the class
    /// initializers of everything newly loaded, supers first.
    pub fn load_class(&mut self, class_name: &str) -> Result<Rc<Class>> {
        let (class, newly_loaded) = self.loader.load(class_name)?;
        for loaded in newly_loaded {
            self.initialize_class(loaded)?;
        }
        Ok(class)
    }

    /// Runs `main([Ljava/lang/String;)V` of the given class with an empty
    /// argument array.
    pub fn run_main(&mut self, class_name: &str) -> Result<()> {
        let args = self.heap.alloc_array("java/lang/String", 1, 0);
        self.execute(
            class_name,
            "main",
            "([Ljava/lang/String;)V",
            &[Value::Ref(args)],
        )?;
        Ok(())
    }

    /// Executes `class_name.method_name:descriptor` with the given
    /// arguments and returns its result (None for void methods).
    /// Arguments are laid into the first locals following slot-width
    /// rules; for instance methods the receiver is `args[0]`.
    pub fn execute(
        &mut self,
        class_name: &str,
        method_name: &str,
        descriptor: &str,
        args: &[Value],
    ) -> Result<Option<Value>> {
        let class = self.load_class(class_name)?;
        let (owner, method) = self
            .resolve_method(&class, method_name, descriptor)
            .ok_or_else(|| {
                Error::link(format!(
                    "method {class_name}.{method_name}:{descriptor} not found"
                ))
            })?;
        if method.is_native() || method.code.is_empty() {
            return Err(Error::link(format!(
                "entry method {class_name}.{method_name} has no bytecode"
            )));
        }

        let mut frame = Frame::new(owner, method.clone());
        let mut index = 0;
        for arg in args {
            index += frame.locals.set_value(index, *arg)?;
        }
        let base_depth = self.thread.depth();
        self.thread.push_frame(frame);
        self.run_until(base_depth)?;

        if method.sig.ret.kind == BaseTypeKind::Void {
            Ok(None)
        } else {
            Ok(self.return_values.last().copied())
        }
    }

    /// Runs the dispatch loop until the call stack shrinks back to
    /// `base_depth`. Re-entrant executions (class initializers) nest by
    /// running with their own base depth.
    fn run_until(&mut self, base_depth: usize) -> Result<()> {
        while self.thread.depth() > base_depth {
            self.step()?;
        }
        Ok(())
    }

    /// Fetches one opcode from the top frame and dispatches it. The pc
    /// passed on points past the opcode byte; branch handlers compute
    /// targets from the opcode's own address.
    fn step(&mut self) -> Result<()> {
        let (insn_pc, op) = {
            let frame = self.thread.current_frame()?;
            let insn_pc = frame.pc;
            let op = *frame.method.code.get(insn_pc).ok_or_else(|| {
                Error::bytecode(format!(
                    "program counter {insn_pc} ran past end of {}.{}",
                    frame.class.name, frame.method.name
                ))
            })?;
            frame.pc += 1;
            (insn_pc, op)
        };
        let opcode = OPCode::from(op);
        if log::log_enabled!(log::Level::Trace) {
            if let Ok(frame) = self.thread.current_frame() {
                log::trace!(
                    "# {}.{} pc={insn_pc} op={opcode} stack={:?} locals={:?}",
                    frame.class.name,
                    frame.method.name,
                    frame.stack,
                    frame.locals
                );
            }
        }
        self.eval(opcode, insn_pc, op)
            .map_err(|e| self.with_context(e, insn_pc))
    }

    fn with_context(&mut self, error: Error, pc: usize) -> Error {
        let location = self
            .thread
            .current_frame()
            .map(|f| format!("{}.{}", f.class.name, f.method.name))
            .unwrap_or_else(|_| "?".to_owned());
        match error {
            Error::Bytecode { message } => Error::bytecode(format!(
                "{message} (at {location} pc {pc})"
            )),
            Error::Link { message } => {
                Error::link(format!("{message} (at {location} pc {pc})"))
            }
            other => other,
        }
    }

    // ---- code stream helpers -------------------------------------------

    fn fetch_u8(&mut self) -> Result<u8> {
        let frame = self.thread.current_frame()?;
        let byte = *frame.method.code.get(frame.pc).ok_or_else(|| {
            Error::bytecode("instruction operand ran past end of code")
        })?;
        frame.pc += 1;
        Ok(byte)
    }

    fn fetch_u16(&mut self) -> Result<u16> {
        let high = self.fetch_u8()?;
        let low = self.fetch_u8()?;
        Ok(u16::from_be_bytes([high, low]))
    }

    fn fetch_i16(&mut self) -> Result<i16> {
        Ok(self.fetch_u16()? as i16)
    }

    fn fetch_i32(&mut self) -> Result<i32> {
        let b = [
            self.fetch_u8()?,
            self.fetch_u8()?,
            self.fetch_u8()?,
            self.fetch_u8()?,
        ];
        Ok(i32::from_be_bytes(b))
    }

    /// Advances pc to the next 4-byte boundary, as the switch opcodes
    /// require for their operand blocks.
    fn align_pc(&mut self) -> Result<()> {
        let frame = self.thread.current_frame()?;
        while frame.pc % 4 != 0 {
            frame.pc += 1;
        }
        Ok(())
    }

    // ---- operand stack helpers -----------------------------------------

    fn push_slot(&mut self, value: u32) -> Result<()> {
        self.thread.current_frame()?.stack.push(value)
    }

    fn pop_slot(&mut self) -> Result<u32> {
        self.thread.current_frame()?.stack.pop()
    }

    fn push_int(&mut self, value: i32) -> Result<()> {
        self.thread.current_frame()?.stack.push_int(value)
    }

    fn pop_int(&mut self) -> Result<i32> {
        self.thread.current_frame()?.stack.pop_int()
    }

    fn push_long(&mut self, value: i64) -> Result<()> {
        self.thread.current_frame()?.stack.push_long(value)
    }

    fn pop_long(&mut self) -> Result<i64> {
        self.thread.current_frame()?.stack.pop_long()
    }

    fn push_float(&mut self, value: f32) -> Result<()> {
        self.thread.current_frame()?.stack.push_float(value)
    }

    fn pop_float(&mut self) -> Result<f32> {
        self.thread.current_frame()?.stack.pop_float()
    }

    fn push_double(&mut self, value: f64) -> Result<()> {
        self.thread.current_frame()?.stack.push_double(value)
    }

    fn pop_double(&mut self) -> Result<f64> {
        self.thread.current_frame()?.stack.pop_double()
    }

    fn push_ref(&mut self, value: RefT) -> Result<()> {
        self.thread.current_frame()?.stack.push_ref(value)
    }

    fn pop_ref(&mut self) -> Result<RefT> {
        self.thread.current_frame()?.stack.pop_ref()
    }

    fn push_value(&mut self, value: Value) -> Result<()> {
        self.thread.current_frame()?.stack.push_value(value)
    }

    /// Pops a value whose width and interpretation follow a field
    /// descriptor.
    fn pop_value_by_descriptor(&mut self, descriptor: &str) -> Result<Value> {
        Ok(match descriptor.as_bytes().first() {
            Some(b'J') => Value::Long(self.pop_long()?),
            Some(b'D') => Value::Double(self.pop_double()?),
            Some(b'F') => Value::Float(self.pop_float()?),
            Some(b'L') | Some(b'[') => Value::Ref(self.pop_ref()?),
            _ => Value::Int(self.pop_int()?),
        })
    }

    // ---- locals helpers ------------------------------------------------

    fn load_one(&mut self, index: usize) -> Result<()> {
        let frame = self.thread.current_frame()?;
        let slot = frame.locals.get_slot(index)?;
        frame.stack.push(slot)
    }

    fn load_two(&mut self, index: usize) -> Result<()> {
        let frame = self.thread.current_frame()?;
        let value = frame.locals.get_long(index)?;
        frame.stack.push_long(value)
    }

    fn store_one(&mut self, index: usize) -> Result<()> {
        let frame = self.thread.current_frame()?;
        let slot = frame.stack.pop()?;
        frame.locals.set_slot(index, slot)
    }

    fn store_two(&mut self, index: usize) -> Result<()> {
        let frame = self.thread.current_frame()?;
        let value = frame.stack.pop_long()?;
        frame.locals.set_long(index, value)
    }

    // ---- class and method plumbing -------------------------------------

    fn current_class(&mut self) -> Result<Rc<Class>> {
        Ok(self.thread.current_frame()?.class.clone())
    }

    /// Runs static preparation that needs the heap plus the `<clinit>`
    /// initializer. Guarded so each class initializes exactly once.
    fn initialize_class(&mut self, class: Rc<Class>) -> Result<()> {
        if !self.initialized.insert(class.name.clone()) {
            return Ok(());
        }
        // String ConstantValue statics allocate pool entries, so they are
        // applied here rather than at class preparation.
        for field in class.fields.iter().filter(|f| f.is_static()) {
            if let Some(constant_index) = field.constant_value {
                if let CPInfo::ConstantString { .. } =
                    class.constant_pool.entry(constant_index)?
                {
                    let text = class
                        .constant_pool
                        .string_utf8(constant_index)?
                        .to_owned();
                    let reference = self.heap.alloc_text(&text);
                    class.set_static(&field.name, Value::Ref(reference));
                }
            }
        }
        if let Some(clinit) = class.method("<clinit>", "()V") {
            log::debug!("running {}.<clinit>", class.name);
            let frame = Frame::new(class.clone(), clinit);
            let base_depth = self.thread.depth();
            self.thread.push_frame(frame);
            self.run_until(base_depth)?;
        }
        Ok(())
    }

    /// Walks `start` and its superclasses for an exact (name, descriptor)
    /// match. The walk stops after the last loaded superclass;
    /// `java/lang/Object` is never loaded and resolves to nothing.
    fn resolve_method(
        &self,
        start: &Rc<Class>,
        name: &str,
        descriptor: &str,
    ) -> Option<(Rc<Class>, Rc<Method>)> {
        let mut current = start.clone();
        loop {
            if let Some(method) = current.method(name, descriptor) {
                return Some((current, method));
            }
            let super_name = current.super_name.clone()?;
            current = self.loader.get(&super_name)?;
        }
    }

    /// Loads a class, mapping a not-found link error to `None` so callers
    /// can fall back to the native registry for unmodeled `java/*` owners.
    fn try_load_class(&mut self, class_name: &str) -> Result<Option<Rc<Class>>> {
        if let Some(class) = self.loader.get(class_name) {
            return Ok(Some(class));
        }
        match self.load_class(class_name) {
            Ok(class) => Ok(Some(class)),
            Err(Error::Link { .. }) => Ok(None),
            Err(other) => Err(other),
        }
    }

    /// Finds the loaded class in `start`'s hierarchy holding the named
    /// static variable.
    fn find_static_owner(
        &self,
        start: &Rc<Class>,
        field: &str,
    ) -> Option<Rc<Class>> {
        let mut current = start.clone();
        loop {
            if current.has_static(field) {
                return Some(current);
            }
            let super_name = current.super_name.clone()?;
            current = self.loader.get(&super_name)?;
        }
    }

    // ---- native support, also used by the registry functions -----------

    pub fn new_object(&mut self, class_name: &str) -> RefT {
        self.heap.alloc_instance(class_name)
    }

    pub fn object_class_name(&self, reference: RefT) -> Result<String> {
        self.heap.class_name_of(reference)
    }

    pub fn shallow_clone_object(&mut self, reference: RefT) -> Result<RefT> {
        self.heap.shallow_clone(reference)
    }

    /// Builds a `java/lang/Class` object whose `name` field points at the
    /// origin class name.
    pub fn new_class_object(&mut self, class_name: &str) -> Result<RefT> {
        let name_ref = self.heap.alloc_text(class_name);
        let class_obj = self.heap.alloc_instance("java/lang/Class");
        self.heap
            .instance_mut(class_obj)?
            .set_field("name", Value::Ref(name_ref));
        Ok(class_obj)
    }

    // ---- invocation ----------------------------------------------------

    fn invoke(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        kind: InvokeKind,
    ) -> Result<()> {
        if kind == InvokeKind::Virtual
            && owner == "java/io/PrintStream"
            && name == "println"
        {
            return self.println(descriptor);
        }

        let sig = MethodSig::parse(descriptor)?;
        let arg_slots = sig.arg_slots();
        let has_receiver = kind != InvokeKind::Static;
        let total_slots = arg_slots + usize::from(has_receiver);

        let start_class = match kind {
            InvokeKind::Static | InvokeKind::Special => {
                self.try_load_class(owner)?
            }
            InvokeKind::Virtual | InvokeKind::Interface => {
                // Dynamic dispatch: resolution starts at the receiver's
                // runtime class, which sits right below the arguments.
                let receiver =
                    self.thread.current_frame()?.stack.peek(arg_slots)?;
                if receiver == 0 {
                    return Err(Error::bytecode(format!(
                        "null receiver calling {owner}.{name}"
                    )));
                }
                let runtime_class = self.heap.class_name_of(receiver)?;
                self.try_load_class(&runtime_class)?
            }
        };

        let resolved = start_class
            .as_ref()
            .and_then(|c| self.resolve_method(c, name, descriptor));

        match resolved {
            Some((declaring, method)) if !method.is_native() => {
                if method.code.is_empty() {
                    return Err(Error::link(format!(
                        "method {}.{name}:{descriptor} is abstract",
                        declaring.name
                    )));
                }
                let mut callee = Frame::new(declaring, method);
                let caller = self.thread.current_frame()?;
                for index in (0..total_slots).rev() {
                    let slot = caller.stack.pop()?;
                    callee.locals.set_slot(index, slot)?;
                }
                self.thread.push_frame(callee);
                Ok(())
            }
            other => {
                // Either the owner is not modeled on the search path or the
                // resolved method is native: dispatch through the registry.
                let native_owner = match &other {
                    Some((declaring, _)) => declaring.name.clone(),
                    None => owner.to_owned(),
                };
                let func = self
                    .natives
                    .find(&native_owner, name, descriptor)
                    .or_else(|| self.natives.find(owner, name, descriptor))
                    .ok_or_else(|| {
                        Error::link(format!(
                            "method {owner}.{name}:{descriptor} not found"
                        ))
                    })?;

                let access_flags = if has_receiver {
                    ACC_NATIVE
                } else {
                    ACC_NATIVE | ACC_STATIC
                };
                let bridge = Rc::new(Method {
                    access_flags,
                    name: name.to_owned(),
                    descriptor: descriptor.to_owned(),
                    code: Vec::new(),
                    max_stack: 2,
                    max_locals: total_slots as u16,
                    sig,
                });
                let frame_class = match start_class {
                    Some(class) => class,
                    None => self.current_class()?,
                };
                let mut native_frame = Frame::new(frame_class, bridge);
                {
                    let caller = self.thread.current_frame()?;
                    for index in (0..total_slots).rev() {
                        let slot = caller.stack.pop()?;
                        native_frame.locals.set_slot(index, slot)?;
                    }
                }
                if let Some(value) = func(&mut native_frame, self)? {
                    self.push_value(value)?;
                }
                Ok(())
            }
        }
    }

    /// `java/io/PrintStream.println`: prints the argument per the call's
    /// descriptor, followed by a line separator.
    fn println(&mut self, descriptor: &str) -> Result<()> {
        let text = match descriptor {
            "()V" => String::new(),
            "(I)V" => self.pop_int()?.to_string(),
            "(Z)V" => if self.pop_int()? != 0 { "true" } else { "false" }
                .to_owned(),
            "(C)V" => {
                let code = self.pop_int()? as u32 & 0xffff;
                char::from_u32(code).unwrap_or('\u{fffd}').to_string()
            }
            "(J)V" => self.pop_long()?.to_string(),
            "(F)V" => format!("{:?}", self.pop_float()?),
            "(D)V" => format!("{:?}", self.pop_double()?),
            "(Ljava/lang/String;)V" => {
                let reference = self.pop_ref()?;
                if reference == 0 {
                    "null".to_owned()
                } else {
                    self.heap.text(reference)?.to_owned()
                }
            }
            "(Ljava/lang/Object;)V" => {
                let reference = self.pop_ref()?;
                if reference == 0 {
                    "null".to_owned()
                } else {
                    match self.heap.get(reference)? {
                        HeapObject::Text(text) => text.clone(),
                        _ => format!(
                            "{}@{reference}",
                            self.heap.class_name_of(reference)?
                        ),
                    }
                }
            }
            other => {
                return Err(Error::link(format!(
                    "println with unsupported descriptor {other}"
                )));
            }
        };
        let receiver = self.pop_ref()?;
        if receiver != self.print_stream {
            return Err(Error::bytecode(format!(
                "println on reference {receiver}, which is not System.out"
            )));
        }
        self.write_line(text);
        Ok(())
    }

    fn write_line(&mut self, line: String) {
        match &mut self.captured_output {
            Some(lines) => lines.push(line),
            None => println!("{line}"),
        }
    }

    // ---- object model helpers ------------------------------------------

    fn is_instance_of(&self, reference: RefT, target: &str) -> Result<bool> {
        let runtime = self.heap.class_name_of(reference)?;
        if runtime == target || target == "java/lang/Object" {
            return Ok(true);
        }
        let mut current = self.loader.get(&runtime);
        while let Some(class) = current {
            if class.name == target {
                return Ok(true);
            }
            current = class
                .super_name
                .as_ref()
                .and_then(|name| self.loader.get(name));
        }
        Ok(false)
    }

    fn alloc_multi_array(
        &mut self,
        descriptor: &str,
        counts: &[i32],
    ) -> Result<RefT> {
        let component = descriptor.strip_prefix('[').ok_or_else(|| {
            Error::bytecode(format!(
                "multianewarray on non-array class {descriptor}"
            ))
        })?;
        let count = counts[0] as usize;
        if counts.len() == 1 {
            let width = descriptor_width(component);
            return Ok(self.heap.alloc_array(component, width, count));
        }
        let outer = self.heap.alloc_array(component, 1, count);
        for index in 0..count {
            let inner = self.alloc_multi_array(component, &counts[1..])?;
            self.heap
                .array_mut(outer)?
                .set(index as i32, u64::from(inner))?;
        }
        Ok(outer)
    }

    fn branch(&mut self, insn_pc: usize, offset: i64) -> Result<()> {
        let frame = self.thread.current_frame()?;
        let target = insn_pc as i64 + offset;
        if target < 0 || target as usize >= frame.method.code.len() {
            return Err(Error::bytecode(format!(
                "branch target {target} outside method code"
            )));
        }
        frame.pc = target as usize;
        Ok(())
    }

    fn cmp<T: PartialOrd>(a: T, b: T) -> i32 {
        if a > b {
            1
        } else if a < b {
            -1
        } else {
            0
        }
    }

    // ---- the dispatch --------------------------------------------------

    /// Evaluates one instruction. `insn_pc` is the address of the opcode
    /// byte itself; the frame's pc already points past it.
    #[allow(clippy::too_many_lines)]
    fn eval(&mut self, opcode: OPCode, insn_pc: usize, op: u8) -> Result<()> {
        match opcode {
            OPCode::NOP => {}
            // Constants.
            OPCode::AConstNull => self.push_ref(0)?,
            OPCode::IconstM1 => self.push_int(-1)?,
            OPCode::Iconst0 => self.push_int(0)?,
            OPCode::Iconst1 => self.push_int(1)?,
            OPCode::Iconst2 => self.push_int(2)?,
            OPCode::Iconst3 => self.push_int(3)?,
            OPCode::Iconst4 => self.push_int(4)?,
            OPCode::Iconst5 => self.push_int(5)?,
            OPCode::Lconst0 => self.push_long(0)?,
            OPCode::Lconst1 => self.push_long(1)?,
            OPCode::Fconst0 => self.push_float(0.0)?,
            OPCode::Fconst1 => self.push_float(1.0)?,
            OPCode::Fconst2 => self.push_float(2.0)?,
            OPCode::Dconst0 => self.push_double(0.0)?,
            OPCode::Dconst1 => self.push_double(1.0)?,
            OPCode::BiPush => {
                let value = self.fetch_u8()? as i8;
                self.push_int(i32::from(value))?;
            }
            OPCode::SiPush => {
                let value = self.fetch_i16()?;
                self.push_int(i32::from(value))?;
            }
            OPCode::Ldc => {
                let index = u16::from(self.fetch_u8()?);
                self.load_constant(index)?;
            }
            OPCode::LdcW => {
                let index = self.fetch_u16()?;
                self.load_constant(index)?;
            }
            OPCode::Ldc2W => {
                let index = self.fetch_u16()?;
                let class = self.current_class()?;
                match class.constant_pool.entry(index)? {
                    CPInfo::ConstantLong { value } => {
                        let value = *value;
                        self.push_long(value)?;
                    }
                    CPInfo::ConstantDouble { value } => {
                        let value = *value;
                        self.push_double(value)?;
                    }
                    other => {
                        return Err(Error::tag(format!(
                            "ldc2_w of constant with tag {}",
                            other.tag()
                        )));
                    }
                }
            }
            // Loads.
            OPCode::ILoad | OPCode::FLoad | OPCode::ALoad => {
                let index = self.fetch_u8()? as usize;
                self.load_one(index)?;
            }
            OPCode::LLoad | OPCode::DLoad => {
                let index = self.fetch_u8()? as usize;
                self.load_two(index)?;
            }
            OPCode::ILoad0 | OPCode::FLoad0 | OPCode::ALoad0 => {
                self.load_one(0)?;
            }
            OPCode::ILoad1 | OPCode::FLoad1 | OPCode::ALoad1 => {
                self.load_one(1)?;
            }
            OPCode::ILoad2 | OPCode::FLoad2 | OPCode::ALoad2 => {
                self.load_one(2)?;
            }
            OPCode::ILoad3 | OPCode::FLoad3 | OPCode::ALoad3 => {
                self.load_one(3)?;
            }
            OPCode::LLoad0 | OPCode::DLoad0 => self.load_two(0)?,
            OPCode::LLoad1 | OPCode::DLoad1 => self.load_two(1)?,
            OPCode::LLoad2 | OPCode::DLoad2 => self.load_two(2)?,
            OPCode::LLoad3 | OPCode::DLoad3 => self.load_two(3)?,
            // Array loads.
            OPCode::IALoad | OPCode::FALoad | OPCode::AALoad => {
                let index = self.pop_int()?;
                let array_ref = self.pop_ref()?;
                let raw = self.heap.array(array_ref)?.get(index)?;
                self.push_slot(raw as u32)?;
            }
            OPCode::BALoad => {
                let index = self.pop_int()?;
                let array_ref = self.pop_ref()?;
                let raw = self.heap.array(array_ref)?.get(index)?;
                self.push_int(i32::from(raw as u32 as u8 as i8))?;
            }
            OPCode::CALoad => {
                let index = self.pop_int()?;
                let array_ref = self.pop_ref()?;
                let raw = self.heap.array(array_ref)?.get(index)?;
                self.push_int(i32::from(raw as u32 as u16))?;
            }
            OPCode::SALoad => {
                let index = self.pop_int()?;
                let array_ref = self.pop_ref()?;
                let raw = self.heap.array(array_ref)?.get(index)?;
                self.push_int(i32::from(raw as u32 as u16 as i16))?;
            }
            OPCode::LALoad => {
                let index = self.pop_int()?;
                let array_ref = self.pop_ref()?;
                let raw = self.heap.array(array_ref)?.get(index)?;
                self.push_long(raw as i64)?;
            }
            OPCode::DALoad => {
                let index = self.pop_int()?;
                let array_ref = self.pop_ref()?;
                let raw = self.heap.array(array_ref)?.get(index)?;
                self.push_double(f64::from_bits(raw))?;
            }
            // Stores.
            OPCode::IStore | OPCode::FStore | OPCode::AStore => {
                let index = self.fetch_u8()? as usize;
                self.store_one(index)?;
            }
            OPCode::LStore | OPCode::DStore => {
                let index = self.fetch_u8()? as usize;
                self.store_two(index)?;
            }
            OPCode::IStore0 | OPCode::FStore0 | OPCode::AStore0 => {
                self.store_one(0)?;
            }
            OPCode::IStore1 | OPCode::FStore1 | OPCode::AStore1 => {
                self.store_one(1)?;
            }
            OPCode::IStore2 | OPCode::FStore2 | OPCode::AStore2 => {
                self.store_one(2)?;
            }
            OPCode::IStore3 | OPCode::FStore3 | OPCode::AStore3 => {
                self.store_one(3)?;
            }
            OPCode::LStore0 | OPCode::DStore0 => self.store_two(0)?,
            OPCode::LStore1 | OPCode::DStore1 => self.store_two(1)?,
            OPCode::LStore2 | OPCode::DStore2 => self.store_two(2)?,
            OPCode::LStore3 | OPCode::DStore3 => self.store_two(3)?,
            // Array stores.
            OPCode::IAStore | OPCode::FAStore | OPCode::AAStore => {
                let value = self.pop_slot()?;
                let index = self.pop_int()?;
                let array_ref = self.pop_ref()?;
                self.heap
                    .array_mut(array_ref)?
                    .set(index, u64::from(value))?;
            }
            OPCode::BAStore => {
                let value = self.pop_int()?;
                let index = self.pop_int()?;
                let array_ref = self.pop_ref()?;
                let truncated = value as i8 as i32 as u32;
                self.heap
                    .array_mut(array_ref)?
                    .set(index, u64::from(truncated))?;
            }
            OPCode::CAStore => {
                let value = self.pop_int()?;
                let index = self.pop_int()?;
                let array_ref = self.pop_ref()?;
                let truncated = u32::from(value as u16);
                self.heap
                    .array_mut(array_ref)?
                    .set(index, u64::from(truncated))?;
            }
            OPCode::SAStore => {
                let value = self.pop_int()?;
                let index = self.pop_int()?;
                let array_ref = self.pop_ref()?;
                let truncated = value as i16 as i32 as u32;
                self.heap
                    .array_mut(array_ref)?
                    .set(index, u64::from(truncated))?;
            }
            OPCode::LAStore => {
                let value = self.pop_long()?;
                let index = self.pop_int()?;
                let array_ref = self.pop_ref()?;
                self.heap.array_mut(array_ref)?.set(index, value as u64)?;
            }
            OPCode::DAStore => {
                let value = self.pop_double()?;
                let index = self.pop_int()?;
                let array_ref = self.pop_ref()?;
                self.heap.array_mut(array_ref)?.set(index, value.to_bits())?;
            }
            // Stack manipulation. Slots are untyped here, so the
            // category-2 forms fall out of plain slot shuffling.
            OPCode::Pop => {
                self.pop_slot()?;
            }
            OPCode::Pop2 => {
                self.pop_slot()?;
                self.pop_slot()?;
            }
            OPCode::Dup => {
                let top = self.thread.current_frame()?.stack.peek(0)?;
                self.push_slot(top)?;
            }
            OPCode::DupX1 => {
                let v1 = self.pop_slot()?;
                let v2 = self.pop_slot()?;
                self.push_slot(v1)?;
                self.push_slot(v2)?;
                self.push_slot(v1)?;
            }
            OPCode::DupX2 => {
                let v1 = self.pop_slot()?;
                let v2 = self.pop_slot()?;
                let v3 = self.pop_slot()?;
                self.push_slot(v1)?;
                self.push_slot(v3)?;
                self.push_slot(v2)?;
                self.push_slot(v1)?;
            }
            OPCode::Dup2 => {
                let v1 = self.pop_slot()?;
                let v2 = self.pop_slot()?;
                self.push_slot(v2)?;
                self.push_slot(v1)?;
                self.push_slot(v2)?;
                self.push_slot(v1)?;
            }
            OPCode::Dup2X1 => {
                let v1 = self.pop_slot()?;
                let v2 = self.pop_slot()?;
                let v3 = self.pop_slot()?;
                self.push_slot(v2)?;
                self.push_slot(v1)?;
                self.push_slot(v3)?;
                self.push_slot(v2)?;
                self.push_slot(v1)?;
            }
            OPCode::Dup2X2 => {
                let v1 = self.pop_slot()?;
                let v2 = self.pop_slot()?;
                let v3 = self.pop_slot()?;
                let v4 = self.pop_slot()?;
                self.push_slot(v2)?;
                self.push_slot(v1)?;
                self.push_slot(v4)?;
                self.push_slot(v3)?;
                self.push_slot(v2)?;
                self.push_slot(v1)?;
            }
            OPCode::Swap => {
                let v1 = self.pop_slot()?;
                let v2 = self.pop_slot()?;
                self.push_slot(v1)?;
                self.push_slot(v2)?;
            }
            // Integer arithmetic wraps in two's complement.
            OPCode::IAdd => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push_int(a.wrapping_add(b))?;
            }
            OPCode::ISub => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push_int(a.wrapping_sub(b))?;
            }
            OPCode::IMul => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push_int(a.wrapping_mul(b))?;
            }
            OPCode::IDiv => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                if b == 0 {
                    return Err(Error::bytecode("integer division by zero"));
                }
                self.push_int(a.wrapping_div(b))?;
            }
            OPCode::IRem => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                if b == 0 {
                    return Err(Error::bytecode("integer remainder by zero"));
                }
                self.push_int(a.wrapping_rem(b))?;
            }
            OPCode::INeg => {
                let a = self.pop_int()?;
                self.push_int(a.wrapping_neg())?;
            }
            OPCode::LAdd => {
                let b = self.pop_long()?;
                let a = self.pop_long()?;
                self.push_long(a.wrapping_add(b))?;
            }
            OPCode::LSub => {
                let b = self.pop_long()?;
                let a = self.pop_long()?;
                self.push_long(a.wrapping_sub(b))?;
            }
            OPCode::LMul => {
                let b = self.pop_long()?;
                let a = self.pop_long()?;
                self.push_long(a.wrapping_mul(b))?;
            }
            OPCode::LDiv => {
                let b = self.pop_long()?;
                let a = self.pop_long()?;
                if b == 0 {
                    return Err(Error::bytecode("long division by zero"));
                }
                self.push_long(a.wrapping_div(b))?;
            }
            OPCode::LRem => {
                let b = self.pop_long()?;
                let a = self.pop_long()?;
                if b == 0 {
                    return Err(Error::bytecode("long remainder by zero"));
                }
                self.push_long(a.wrapping_rem(b))?;
            }
            OPCode::LNeg => {
                let a = self.pop_long()?;
                self.push_long(a.wrapping_neg())?;
            }
            OPCode::FAdd => {
                let b = self.pop_float()?;
                let a = self.pop_float()?;
                self.push_float(a + b)?;
            }
            OPCode::FSub => {
                let b = self.pop_float()?;
                let a = self.pop_float()?;
                self.push_float(a - b)?;
            }
            OPCode::FMul => {
                let b = self.pop_float()?;
                let a = self.pop_float()?;
                self.push_float(a * b)?;
            }
            OPCode::FDiv => {
                let b = self.pop_float()?;
                let a = self.pop_float()?;
                self.push_float(a / b)?;
            }
            OPCode::FRem => {
                let b = self.pop_float()?;
                let a = self.pop_float()?;
                self.push_float(a % b)?;
            }
            OPCode::FNeg => {
                let a = self.pop_float()?;
                self.push_float(-a)?;
            }
            OPCode::DAdd => {
                let b = self.pop_double()?;
                let a = self.pop_double()?;
                self.push_double(a + b)?;
            }
            OPCode::DSub => {
                let b = self.pop_double()?;
                let a = self.pop_double()?;
                self.push_double(a - b)?;
            }
            OPCode::DMul => {
                let b = self.pop_double()?;
                let a = self.pop_double()?;
                self.push_double(a * b)?;
            }
            OPCode::DDiv => {
                let b = self.pop_double()?;
                let a = self.pop_double()?;
                self.push_double(a / b)?;
            }
            OPCode::DRem => {
                let b = self.pop_double()?;
                let a = self.pop_double()?;
                self.push_double(a % b)?;
            }
            OPCode::DNeg => {
                let a = self.pop_double()?;
                self.push_double(-a)?;
            }
            // Shifts mask the count to the value width.
            OPCode::IShl => {
                let count = self.pop_int()? as u32 & 0x1f;
                let value = self.pop_int()?;
                self.push_int(value.wrapping_shl(count))?;
            }
            OPCode::IShr => {
                let count = self.pop_int()? as u32 & 0x1f;
                let value = self.pop_int()?;
                self.push_int(value.wrapping_shr(count))?;
            }
            OPCode::IUShr => {
                let count = self.pop_int()? as u32 & 0x1f;
                let value = self.pop_int()?;
                self.push_int(((value as u32) >> count) as i32)?;
            }
            OPCode::LShl => {
                let count = self.pop_int()? as u32 & 0x3f;
                let value = self.pop_long()?;
                self.push_long(value.wrapping_shl(count))?;
            }
            OPCode::LShr => {
                let count = self.pop_int()? as u32 & 0x3f;
                let value = self.pop_long()?;
                self.push_long(value.wrapping_shr(count))?;
            }
            OPCode::LUShr => {
                let count = self.pop_int()? as u32 & 0x3f;
                let value = self.pop_long()?;
                self.push_long(((value as u64) >> count) as i64)?;
            }
            OPCode::IAnd => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push_int(a & b)?;
            }
            OPCode::IOr => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push_int(a | b)?;
            }
            OPCode::IXor => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push_int(a ^ b)?;
            }
            OPCode::LAnd => {
                let b = self.pop_long()?;
                let a = self.pop_long()?;
                self.push_long(a & b)?;
            }
            OPCode::LOr => {
                let b = self.pop_long()?;
                let a = self.pop_long()?;
                self.push_long(a | b)?;
            }
            OPCode::LXor => {
                let b = self.pop_long()?;
                let a = self.pop_long()?;
                self.push_long(a ^ b)?;
            }
            OPCode::IInc => {
                let index = self.fetch_u8()? as usize;
                let constant = self.fetch_u8()? as i8;
                let frame = self.thread.current_frame()?;
                let value = frame.locals.get_int(index)?;
                frame
                    .locals
                    .set_int(index, value.wrapping_add(i32::from(constant)))?;
            }
            // Conversions. Rust float-to-int casts saturate and map NaN
            // to zero, matching the platform contract.
            OPCode::I2L => {
                let v = self.pop_int()?;
                self.push_long(i64::from(v))?;
            }
            OPCode::I2F => {
                let v = self.pop_int()?;
                self.push_float(v as f32)?;
            }
            OPCode::I2D => {
                let v = self.pop_int()?;
                self.push_double(f64::from(v))?;
            }
            OPCode::L2I => {
                let v = self.pop_long()?;
                self.push_int(v as i32)?;
            }
            OPCode::L2F => {
                let v = self.pop_long()?;
                self.push_float(v as f32)?;
            }
            OPCode::L2D => {
                let v = self.pop_long()?;
                self.push_double(v as f64)?;
            }
            OPCode::F2I => {
                let v = self.pop_float()?;
                self.push_int(v as i32)?;
            }
            OPCode::F2L => {
                let v = self.pop_float()?;
                self.push_long(v as i64)?;
            }
            OPCode::F2D => {
                let v = self.pop_float()?;
                self.push_double(f64::from(v))?;
            }
            OPCode::D2I => {
                let v = self.pop_double()?;
                self.push_int(v as i32)?;
            }
            OPCode::D2L => {
                let v = self.pop_double()?;
                self.push_long(v as i64)?;
            }
            OPCode::D2F => {
                let v = self.pop_double()?;
                self.push_float(v as f32)?;
            }
            OPCode::I2B => {
                let v = self.pop_int()?;
                self.push_int(i32::from(v as i8))?;
            }
            OPCode::I2C => {
                let v = self.pop_int()?;
                self.push_int(i32::from(v as u16))?;
            }
            OPCode::I2S => {
                let v = self.pop_int()?;
                self.push_int(i32::from(v as i16))?;
            }
            // Comparisons.
            OPCode::LCmp => {
                let b = self.pop_long()?;
                let a = self.pop_long()?;
                self.push_int(Self::cmp(a, b))?;
            }
            OPCode::FCmpL | OPCode::FCmpG => {
                let b = self.pop_float()?;
                let a = self.pop_float()?;
                let result = if a.is_nan() || b.is_nan() {
                    if opcode == OPCode::FCmpL {
                        -1
                    } else {
                        1
                    }
                } else {
                    Self::cmp(a, b)
                };
                self.push_int(result)?;
            }
            OPCode::DCmpL | OPCode::DCmpG => {
                let b = self.pop_double()?;
                let a = self.pop_double()?;
                let result = if a.is_nan() || b.is_nan() {
                    if opcode == OPCode::DCmpL {
                        -1
                    } else {
                        1
                    }
                } else {
                    Self::cmp(a, b)
                };
                self.push_int(result)?;
            }
            // Branches. Targets are relative to the opcode's address.
            OPCode::IfEq
            | OPCode::IfNe
            | OPCode::IfLt
            | OPCode::IfGe
            | OPCode::IfGt
            | OPCode::IfLe => {
                let offset = i64::from(self.fetch_i16()?);
                let value = self.pop_int()?;
                let taken = match opcode {
                    OPCode::IfEq => value == 0,
                    OPCode::IfNe => value != 0,
                    OPCode::IfLt => value < 0,
                    OPCode::IfGe => value >= 0,
                    OPCode::IfGt => value > 0,
                    _ => value <= 0,
                };
                if taken {
                    self.branch(insn_pc, offset)?;
                }
            }
            OPCode::IfICmpEq
            | OPCode::IfICmpNe
            | OPCode::IfICmpLt
            | OPCode::IfICmpGe
            | OPCode::IfICmpGt
            | OPCode::IfICmpLe => {
                let offset = i64::from(self.fetch_i16()?);
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                let taken = match opcode {
                    OPCode::IfICmpEq => a == b,
                    OPCode::IfICmpNe => a != b,
                    OPCode::IfICmpLt => a < b,
                    OPCode::IfICmpGe => a >= b,
                    OPCode::IfICmpGt => a > b,
                    _ => a <= b,
                };
                if taken {
                    self.branch(insn_pc, offset)?;
                }
            }
            OPCode::IfACmpEq | OPCode::IfACmpNe => {
                let offset = i64::from(self.fetch_i16()?);
                let b = self.pop_ref()?;
                let a = self.pop_ref()?;
                let taken = if opcode == OPCode::IfACmpEq {
                    a == b
                } else {
                    a != b
                };
                if taken {
                    self.branch(insn_pc, offset)?;
                }
            }
            OPCode::IfNull | OPCode::IfNonNull => {
                let offset = i64::from(self.fetch_i16()?);
                let reference = self.pop_ref()?;
                let taken = if opcode == OPCode::IfNull {
                    reference == 0
                } else {
                    reference != 0
                };
                if taken {
                    self.branch(insn_pc, offset)?;
                }
            }
            OPCode::Goto => {
                let offset = i64::from(self.fetch_i16()?);
                self.branch(insn_pc, offset)?;
            }
            OPCode::GotoW => {
                let offset = i64::from(self.fetch_i32()?);
                self.branch(insn_pc, offset)?;
            }
            OPCode::Jsr => {
                let offset = i64::from(self.fetch_i16()?);
                self.push_int((insn_pc + 3) as i32)?;
                self.branch(insn_pc, offset)?;
            }
            OPCode::JsrW => {
                let offset = i64::from(self.fetch_i32()?);
                self.push_int((insn_pc + 5) as i32)?;
                self.branch(insn_pc, offset)?;
            }
            OPCode::Ret => {
                let index = self.fetch_u8()? as usize;
                let frame = self.thread.current_frame()?;
                frame.pc = frame.locals.get_slot(index)? as usize;
            }
            OPCode::TableSwitch => {
                let key = self.pop_int()?;
                self.align_pc()?;
                let default = self.fetch_i32()?;
                let low = self.fetch_i32()?;
                let high = self.fetch_i32()?;
                if high < low {
                    return Err(Error::bytecode(format!(
                        "tableswitch bounds {low}..{high} are inverted"
                    )));
                }
                let mut target = default;
                for entry in 0..=(high - low) {
                    let offset = self.fetch_i32()?;
                    if key == low + entry {
                        target = offset;
                    }
                }
                self.branch(insn_pc, i64::from(target))?;
            }
            OPCode::LookupSwitch => {
                let key = self.pop_int()?;
                self.align_pc()?;
                let default = self.fetch_i32()?;
                let npairs = self.fetch_i32()?;
                let mut target = default;
                for _ in 0..npairs {
                    let match_value = self.fetch_i32()?;
                    let offset = self.fetch_i32()?;
                    if key == match_value {
                        target = offset;
                    }
                }
                self.branch(insn_pc, i64::from(target))?;
            }
            // Returns.
            OPCode::IReturn | OPCode::FReturn | OPCode::AReturn => {
                let slot = self.pop_slot()?;
                self.thread.pop_frame();
                if self.thread.is_empty() {
                    let value = match opcode {
                        OPCode::IReturn => Value::Int(slot as i32),
                        OPCode::FReturn => Value::Float(f32::from_bits(slot)),
                        _ => Value::Ref(slot),
                    };
                    self.return_values.push(value);
                } else {
                    self.push_slot(slot)?;
                }
            }
            OPCode::LReturn | OPCode::DReturn => {
                let value = self.pop_long()?;
                self.thread.pop_frame();
                if self.thread.is_empty() {
                    let value = if opcode == OPCode::LReturn {
                        Value::Long(value)
                    } else {
                        Value::Double(f64::from_bits(value as u64))
                    };
                    self.return_values.push(value);
                } else {
                    self.push_long(value)?;
                }
            }
            OPCode::Return => {
                self.thread.pop_frame();
            }
            // Field access.
            OPCode::GetStatic => {
                let index = self.fetch_u16()?;
                let class = self.current_class()?;
                let (owner, name, descriptor) = {
                    let (o, n, d) = class.constant_pool.fieldref(index)?;
                    (o.to_owned(), n.to_owned(), d.to_owned())
                };
                if owner == "java/lang/System"
                    && name == "out"
                    && descriptor == "Ljava/io/PrintStream;"
                {
                    let out = self.print_stream;
                    self.push_ref(out)?;
                } else {
                    let owner_class = self.load_class(&owner)?;
                    let value = self
                        .find_static_owner(&owner_class, &name)
                        .and_then(|holder| holder.get_static(&name))
                        .ok_or_else(|| {
                            Error::link(format!(
                                "static field {owner}.{name} not found"
                            ))
                        })?;
                    self.push_value(value)?;
                }
            }
            OPCode::PutStatic => {
                let index = self.fetch_u16()?;
                let class = self.current_class()?;
                let (owner, name, descriptor) = {
                    let (o, n, d) = class.constant_pool.fieldref(index)?;
                    (o.to_owned(), n.to_owned(), d.to_owned())
                };
                let owner_class = self.load_class(&owner)?;
                let holder = self
                    .find_static_owner(&owner_class, &name)
                    .ok_or_else(|| {
                        Error::link(format!(
                            "static field {owner}.{name} not found"
                        ))
                    })?;
                let value = self.pop_value_by_descriptor(&descriptor)?;
                holder.set_static(&name, value);
            }
            OPCode::GetField => {
                let index = self.fetch_u16()?;
                let class = self.current_class()?;
                let (_, name, descriptor) = {
                    let (o, n, d) = class.constant_pool.fieldref(index)?;
                    (o.to_owned(), n.to_owned(), d.to_owned())
                };
                let objref = self.pop_ref()?;
                let value =
                    self.heap.instance(objref)?.get_field(&name, &descriptor);
                self.push_value(value)?;
            }
            OPCode::PutField => {
                let index = self.fetch_u16()?;
                let class = self.current_class()?;
                let (_, name, descriptor) = {
                    let (o, n, d) = class.constant_pool.fieldref(index)?;
                    (o.to_owned(), n.to_owned(), d.to_owned())
                };
                let value = self.pop_value_by_descriptor(&descriptor)?;
                let objref = self.pop_ref()?;
                self.heap.instance_mut(objref)?.set_field(&name, value);
            }
            // Invocation.
            OPCode::InvokeVirtual => {
                let index = self.fetch_u16()?;
                let class = self.current_class()?;
                let (owner, name, descriptor) = {
                    let (o, n, d) = class.constant_pool.methodref(index)?;
                    (o.to_owned(), n.to_owned(), d.to_owned())
                };
                self.invoke(&owner, &name, &descriptor, InvokeKind::Virtual)?;
            }
            OPCode::InvokeSpecial => {
                let index = self.fetch_u16()?;
                let class = self.current_class()?;
                let (owner, name, descriptor) = {
                    let (o, n, d) = class.constant_pool.methodref(index)?;
                    (o.to_owned(), n.to_owned(), d.to_owned())
                };
                self.invoke(&owner, &name, &descriptor, InvokeKind::Special)?;
            }
            OPCode::InvokeStatic => {
                let index = self.fetch_u16()?;
                let class = self.current_class()?;
                let (owner, name, descriptor) = {
                    let (o, n, d) = class.constant_pool.methodref(index)?;
                    (o.to_owned(), n.to_owned(), d.to_owned())
                };
                self.invoke(&owner, &name, &descriptor, InvokeKind::Static)?;
            }
            OPCode::InvokeInterface => {
                let index = self.fetch_u16()?;
                // count and the reserved zero byte.
                self.fetch_u8()?;
                self.fetch_u8()?;
                let class = self.current_class()?;
                let (owner, name, descriptor) = {
                    let (o, n, d) = class.constant_pool.methodref(index)?;
                    (o.to_owned(), n.to_owned(), d.to_owned())
                };
                self.invoke(&owner, &name, &descriptor, InvokeKind::Interface)?;
            }
            OPCode::InvokeDynamic => {
                return Err(Error::bytecode(
                    "invokedynamic is not supported in this core",
                ));
            }
            // Object and array creation.
            OPCode::New => {
                let index = self.fetch_u16()?;
                let class = self.current_class()?;
                let name = class.constant_pool.class_name(index)?.to_owned();
                let reference = self.heap.alloc_instance(&name);
                self.push_ref(reference)?;
            }
            OPCode::NewArray => {
                let atype = self.fetch_u8()?;
                let (elem_class, width) = match atype {
                    4 => ("Z", 1),
                    5 => ("C", 1),
                    6 => ("F", 1),
                    7 => ("D", 2),
                    8 => ("B", 1),
                    9 => ("S", 1),
                    10 => ("I", 1),
                    11 => ("J", 2),
                    other => {
                        return Err(Error::bytecode(format!(
                            "newarray with unknown type tag {other}"
                        )));
                    }
                };
                let count = self.pop_int()?;
                if count < 0 {
                    return Err(Error::bytecode(format!(
                        "negative array size {count}"
                    )));
                }
                let reference =
                    self.heap.alloc_array(elem_class, width, count as usize);
                self.push_ref(reference)?;
            }
            OPCode::ANewArray => {
                let index = self.fetch_u16()?;
                let class = self.current_class()?;
                let elem_class =
                    class.constant_pool.class_name(index)?.to_owned();
                let count = self.pop_int()?;
                if count < 0 {
                    return Err(Error::bytecode(format!(
                        "negative array size {count}"
                    )));
                }
                let reference =
                    self.heap.alloc_array(&elem_class, 1, count as usize);
                self.push_ref(reference)?;
            }
            OPCode::MultiANewArray => {
                let index = self.fetch_u16()?;
                let dims = self.fetch_u8()? as usize;
                let class = self.current_class()?;
                let descriptor =
                    class.constant_pool.class_name(index)?.to_owned();
                let mut counts = vec![0i32; dims];
                for slot in counts.iter_mut().rev() {
                    *slot = self.pop_int()?;
                }
                if let Some(count) = counts.iter().find(|&&c| c < 0) {
                    return Err(Error::bytecode(format!(
                        "negative array size {count}"
                    )));
                }
                let reference =
                    self.alloc_multi_array(&descriptor, &counts)?;
                self.push_ref(reference)?;
            }
            OPCode::ArrayLength => {
                let reference = self.pop_ref()?;
                let length = self.heap.array(reference)?.length;
                self.push_int(length as i32)?;
            }
            OPCode::AThrow => {
                return Err(Error::bytecode(
                    "athrow is not supported (no exception model in this core)",
                ));
            }
            OPCode::CheckCast => {
                let index = self.fetch_u16()?;
                let class = self.current_class()?;
                let target = class.constant_pool.class_name(index)?.to_owned();
                let reference = self.thread.current_frame()?.stack.peek(0)?;
                if reference != 0 && !self.is_instance_of(reference, &target)? {
                    let runtime = self.heap.class_name_of(reference)?;
                    return Err(Error::bytecode(format!(
                        "cannot cast {runtime} to {target}"
                    )));
                }
            }
            OPCode::InstanceOf => {
                let index = self.fetch_u16()?;
                let class = self.current_class()?;
                let target = class.constant_pool.class_name(index)?.to_owned();
                let reference = self.pop_ref()?;
                let result = reference != 0
                    && self.is_instance_of(reference, &target)?;
                self.push_int(i32::from(result))?;
            }
            // Monitors are no-ops in the single-threaded core.
            OPCode::MonitorEnter | OPCode::MonitorExit => {
                self.pop_ref()?;
            }
            OPCode::Wide => {
                let widened = OPCode::from(self.fetch_u8()?);
                let index = self.fetch_u16()? as usize;
                match widened {
                    OPCode::ILoad | OPCode::FLoad | OPCode::ALoad => {
                        self.load_one(index)?;
                    }
                    OPCode::LLoad | OPCode::DLoad => self.load_two(index)?,
                    OPCode::IStore | OPCode::FStore | OPCode::AStore => {
                        self.store_one(index)?;
                    }
                    OPCode::LStore | OPCode::DStore => self.store_two(index)?,
                    OPCode::Ret => {
                        let frame = self.thread.current_frame()?;
                        frame.pc = frame.locals.get_slot(index)? as usize;
                    }
                    OPCode::IInc => {
                        let constant = self.fetch_i16()?;
                        let frame = self.thread.current_frame()?;
                        let value = frame.locals.get_int(index)?;
                        frame.locals.set_int(
                            index,
                            value.wrapping_add(i32::from(constant)),
                        )?;
                    }
                    other => {
                        return Err(Error::bytecode(format!(
                            "wide prefix on unsupported opcode {other}"
                        )));
                    }
                }
            }
            OPCode::Unknown => {
                return Err(Error::bytecode(format!(
                    "unknown opcode {op:#04x}"
                )));
            }
        }
        Ok(())
    }

    /// `ldc`/`ldc_w`: pushes an Integer, Float or String constant.
    fn load_constant(&mut self, index: u16) -> Result<()> {
        let class = self.current_class()?;
        match class.constant_pool.entry(index)? {
            CPInfo::ConstantInteger { value } => {
                let value = *value;
                self.push_int(value)?;
            }
            CPInfo::ConstantFloat { value } => {
                let value = *value;
                self.push_float(value)?;
            }
            CPInfo::ConstantString { .. } => {
                let text = class.constant_pool.string_utf8(index)?.to_owned();
                let reference = self.heap.alloc_text(&text);
                self.push_ref(reference)?;
            }
            other => {
                return Err(Error::tag(format!(
                    "ldc of constant with tag {}",
                    other.tag()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ClassFileBuilder;
    use crate::jvm::ACC_STATIC;
    use std::fs;
    use tempfile::TempDir;

    fn boot(classes: &[(&str, &ClassFileBuilder)]) -> (Interpreter, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        for (name, builder) in classes {
            fs::write(
                dir.path().join(format!("{name}.class")),
                builder.build(),
            )
            .unwrap();
        }
        let loader = ClassLoader::with_dirs(vec![dir.path().to_owned()]);
        (Interpreter::new(loader), dir)
    }

    fn run_static(
        builder: &ClassFileBuilder,
        class: &str,
        method: &str,
        descriptor: &str,
        args: &[Value],
    ) -> Result<Option<Value>> {
        let (mut interp, _dir) = boot(&[(class, builder)]);
        interp.execute(class, method, descriptor, args)
    }

    #[test]
    fn identity_return() {
        let mut b = ClassFileBuilder::new("Id", "java/lang/Object");
        // iload_0; ireturn
        b.add_method(ACC_STATIC, "id", "(I)I", 1, 1, vec![0x1a, 0xac]);
        let result = run_static(&b, "Id", "id", "(I)I", &[Value::Int(42)]);
        assert_eq!(result.unwrap(), Some(Value::Int(42)));
    }

    #[test]
    fn loop_sums_one_to_n() {
        let mut b = ClassFileBuilder::new("Sum", "java/lang/Object");
        // int s = 0; for (int i = 1; i <= n; i++) s += i; return s;
        let code = vec![
            0x03, // iconst_0
            0x3c, // istore_1
            0x04, // iconst_1
            0x3d, // istore_2
            0x1c, // iload_2
            0x1a, // iload_0
            0xa3, 0x00, 0x0d, // if_icmpgt +13 -> 19
            0x1b, // iload_1
            0x1c, // iload_2
            0x60, // iadd
            0x3c, // istore_1
            0x84, 0x02, 0x01, // iinc 2, 1
            0xa7, 0xff, 0xf4, // goto -12 -> 4
            0x1b, // iload_1
            0xac, // ireturn
        ];
        b.add_method(ACC_STATIC, "sumTo", "(I)I", 2, 3, code);
        let result =
            run_static(&b, "Sum", "sumTo", "(I)I", &[Value::Int(10)]);
        assert_eq!(result.unwrap(), Some(Value::Int(55)));
    }

    #[test]
    fn integer_addition_wraps_around() {
        let mut b = ClassFileBuilder::new("Wrap", "java/lang/Object");
        b.add_method(
            ACC_STATIC,
            "add",
            "(II)I",
            2,
            2,
            vec![0x1a, 0x1b, 0x60, 0xac],
        );
        let result = run_static(
            &b,
            "Wrap",
            "add",
            "(II)I",
            &[Value::Int(i32::MAX), Value::Int(1)],
        );
        assert_eq!(result.unwrap(), Some(Value::Int(i32::MIN)));
    }

    #[test]
    fn integer_division_by_zero_is_fatal() {
        let mut b = ClassFileBuilder::new("Div", "java/lang/Object");
        b.add_method(
            ACC_STATIC,
            "div",
            "(II)I",
            2,
            2,
            vec![0x1a, 0x1b, 0x6c, 0xac],
        );
        let err = run_static(
            &b,
            "Div",
            "div",
            "(II)I",
            &[Value::Int(1), Value::Int(0)],
        )
        .unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn long_arithmetic_spans_two_slots() {
        let mut b = ClassFileBuilder::new("Lng", "java/lang/Object");
        // lload_0; lload_2; ladd; lreturn
        b.add_method(
            ACC_STATIC,
            "add",
            "(JJ)J",
            4,
            4,
            vec![0x1e, 0x20, 0x61, 0xad],
        );
        let result = run_static(
            &b,
            "Lng",
            "add",
            "(JJ)J",
            &[Value::Long(1 << 40), Value::Long(1)],
        );
        assert_eq!(result.unwrap(), Some(Value::Long((1 << 40) + 1)));
    }

    #[test]
    fn float_remainder_edge_cases() {
        let mut b = ClassFileBuilder::new("Frem", "java/lang/Object");
        // fload_0; fload_1; frem; freturn
        b.add_method(
            ACC_STATIC,
            "rem",
            "(FF)F",
            2,
            2,
            vec![0x22, 0x23, 0x72, 0xae],
        );
        let (mut interp, _dir) = boot(&[("Frem", &b)]);
        let mut rem = |a: f32, bb: f32| {
            match interp
                .execute(
                    "Frem",
                    "rem",
                    "(FF)F",
                    &[Value::Float(a), Value::Float(bb)],
                )
                .unwrap()
            {
                Some(Value::Float(v)) => v,
                other => panic!("expected float, got {other:?}"),
            }
        };
        assert_eq!(rem(5.25, 2.0), 1.25);
        assert!(rem(f32::NAN, 2.0).is_nan());
        assert!(rem(5.25, 0.0).is_nan());
        assert_eq!(rem(5.25, f32::INFINITY), 5.25);
        assert_eq!(rem(0.0, 2.0), 0.0);
        assert_eq!(rem(-5.25, 2.0), -1.25);
    }

    #[test]
    fn double_remainder_edge_cases() {
        let mut b = ClassFileBuilder::new("Drem", "java/lang/Object");
        // dload_0; dload_2; drem; dreturn
        b.add_method(
            ACC_STATIC,
            "rem",
            "(DD)D",
            4,
            4,
            vec![0x26, 0x28, 0x73, 0xaf],
        );
        let (mut interp, _dir) = boot(&[("Drem", &b)]);
        let mut rem = |a: f64, bb: f64| {
            match interp
                .execute(
                    "Drem",
                    "rem",
                    "(DD)D",
                    &[Value::Double(a), Value::Double(bb)],
                )
                .unwrap()
            {
                Some(Value::Double(v)) => v,
                other => panic!("expected double, got {other:?}"),
            }
        };
        assert_eq!(rem(5.25, 2.0), 1.25);
        assert!(rem(f64::NAN, 2.0).is_nan());
        assert!(rem(f64::INFINITY, 2.0).is_nan());
        assert_eq!(rem(5.25, f64::INFINITY), 5.25);
    }

    #[test]
    fn double_compare_nan_polarity() {
        let mut low = ClassFileBuilder::new("CmpL", "java/lang/Object");
        low.add_method(
            ACC_STATIC,
            "cmp",
            "(DD)I",
            4,
            4,
            vec![0x26, 0x28, 0x97, 0xac], // dcmpl
        );
        let mut high = ClassFileBuilder::new("CmpG", "java/lang/Object");
        high.add_method(
            ACC_STATIC,
            "cmp",
            "(DD)I",
            4,
            4,
            vec![0x26, 0x28, 0x98, 0xac], // dcmpg
        );
        let nan_args = [Value::Double(f64::NAN), Value::Double(1.0)];
        assert_eq!(
            run_static(&low, "CmpL", "cmp", "(DD)I", &nan_args).unwrap(),
            Some(Value::Int(-1))
        );
        assert_eq!(
            run_static(&high, "CmpG", "cmp", "(DD)I", &nan_args).unwrap(),
            Some(Value::Int(1))
        );
        let ordered = [Value::Double(2.0), Value::Double(1.0)];
        assert_eq!(
            run_static(&low, "CmpL", "cmp", "(DD)I", &ordered).unwrap(),
            Some(Value::Int(1))
        );
    }

    #[test]
    fn double_to_int_saturates() {
        let mut b = ClassFileBuilder::new("Cast", "java/lang/Object");
        b.add_method(
            ACC_STATIC,
            "d2i",
            "(D)I",
            2,
            2,
            vec![0x26, 0x8e, 0xac],
        );
        let (mut interp, _dir) = boot(&[("Cast", &b)]);
        let mut cast = |v: f64| {
            interp
                .execute("Cast", "d2i", "(D)I", &[Value::Double(v)])
                .unwrap()
        };
        assert_eq!(cast(123.456), Some(Value::Int(123)));
        assert_eq!(cast(f64::NAN), Some(Value::Int(0)));
        assert_eq!(cast(f64::INFINITY), Some(Value::Int(i32::MAX)));
        assert_eq!(cast(f64::NEG_INFINITY), Some(Value::Int(i32::MIN)));
    }

    #[test]
    fn dup_and_swap_preserve_bits() {
        let mut b = ClassFileBuilder::new("Stk", "java/lang/Object");
        // dup: x + x
        b.add_method(
            ACC_STATIC,
            "twice",
            "(I)I",
            2,
            1,
            vec![0x1a, 0x59, 0x60, 0xac],
        );
        // swap then isub: b - a
        b.add_method(
            ACC_STATIC,
            "swapped",
            "(II)I",
            2,
            2,
            vec![0x1a, 0x1b, 0x5f, 0x64, 0xac],
        );
        let (mut interp, _dir) = boot(&[("Stk", &b)]);
        assert_eq!(
            interp
                .execute("Stk", "twice", "(I)I", &[Value::Int(21)])
                .unwrap(),
            Some(Value::Int(42))
        );
        assert_eq!(
            interp
                .execute(
                    "Stk",
                    "swapped",
                    "(II)I",
                    &[Value::Int(7), Value::Int(3)]
                )
                .unwrap(),
            Some(Value::Int(-4))
        );
    }

    #[test]
    fn invokestatic_passes_arguments_and_returns() {
        let mut b = ClassFileBuilder::new("Calc", "java/lang/Object");
        b.add_method(
            ACC_STATIC,
            "add",
            "(II)I",
            2,
            2,
            vec![0x1a, 0x1b, 0x60, 0xac],
        );
        let mref = b.methodref("Calc", "add", "(II)I");
        let [mh, ml] = mref.to_be_bytes();
        b.add_method(
            ACC_STATIC,
            "run",
            "()I",
            2,
            0,
            vec![0x05, 0x06, 0xb8, mh, ml, 0xac],
        );
        let result = run_static(&b, "Calc", "run", "()I", &[]);
        assert_eq!(result.unwrap(), Some(Value::Int(5)));
    }

    #[test]
    fn instance_field_round_trip() {
        let mut b = ClassFileBuilder::new("P", "java/lang/Object");
        b.add_field(0, "x", "I");
        let fref = b.fieldref("P", "x", "I");
        let [fh, fl] = fref.to_be_bytes();
        let cls = b.constant_class("P");
        let [ch, cl] = cls.to_be_bytes();
        let code = vec![
            0xbb, ch, cl, // new P
            0x4b, // astore_0
            0x2a, // aload_0
            0x10, 0x7b, // bipush 123
            0xb5, fh, fl, // putfield P.x
            0x2a, // aload_0
            0xb4, fh, fl, // getfield P.x
            0xac, // ireturn
        ];
        b.add_method(ACC_STATIC, "run", "()I", 2, 1, code);
        let result = run_static(&b, "P", "run", "()I", &[]);
        assert_eq!(result.unwrap(), Some(Value::Int(123)));
    }

    #[test]
    fn getfield_of_unset_field_defaults_to_zero() {
        let mut b = ClassFileBuilder::new("Q", "java/lang/Object");
        b.add_field(0, "y", "I");
        let fref = b.fieldref("Q", "y", "I");
        let [fh, fl] = fref.to_be_bytes();
        let cls = b.constant_class("Q");
        let [ch, cl] = cls.to_be_bytes();
        b.add_method(
            ACC_STATIC,
            "run",
            "()I",
            1,
            0,
            vec![0xbb, ch, cl, 0xb4, fh, fl, 0xac],
        );
        let result = run_static(&b, "Q", "run", "()I", &[]);
        assert_eq!(result.unwrap(), Some(Value::Int(0)));
    }

    #[test]
    fn object_clone_native_copies_fields() {
        let mut b = ClassFileBuilder::new("NatTest", "java/lang/Object");
        let mref = b.methodref(
            "java/lang/Object",
            "clone",
            "()Ljava/lang/Object;",
        );
        let [mh, ml] = mref.to_be_bytes();
        b.add_method(
            ACC_STATIC,
            "cl",
            "(Ljava/lang/Object;)Ljava/lang/Object;",
            1,
            1,
            vec![0x2a, 0xb6, mh, ml, 0xb0],
        );
        let (mut interp, _dir) = boot(&[("NatTest", &b)]);

        let original = interp.new_object("P");
        interp
            .heap_mut()
            .instance_mut(original)
            .unwrap()
            .set_field("a", Value::Int(1));
        interp
            .heap_mut()
            .instance_mut(original)
            .unwrap()
            .set_field("b", Value::Int(2));

        let result = interp
            .execute(
                "NatTest",
                "cl",
                "(Ljava/lang/Object;)Ljava/lang/Object;",
                &[Value::Ref(original)],
            )
            .unwrap();
        let Some(Value::Ref(copy)) = result else {
            panic!("expected a reference, got {result:?}");
        };
        assert_ne!(copy, original);

        // Mutating the original afterwards must not leak into the clone.
        interp
            .heap_mut()
            .instance_mut(original)
            .unwrap()
            .set_field("a", Value::Int(99));
        let cloned = interp.heap().instance(copy).unwrap();
        assert_eq!(cloned.get_field("a", "I"), Value::Int(1));
        assert_eq!(cloned.get_field("b", "I"), Value::Int(2));
    }

    #[test]
    fn object_get_class_native_records_the_origin_class() {
        let mut b = ClassFileBuilder::new("Meta", "java/lang/Object");
        let mref = b.methodref(
            "java/lang/Object",
            "getClass",
            "()Ljava/lang/Class;",
        );
        let [mh, ml] = mref.to_be_bytes();
        b.add_method(
            ACC_STATIC,
            "g",
            "(Ljava/lang/Object;)Ljava/lang/Class;",
            1,
            1,
            vec![0x2a, 0xb6, mh, ml, 0xb0],
        );
        let (mut interp, _dir) = boot(&[("Meta", &b)]);
        let obj = interp.new_object("P");
        let result = interp
            .execute(
                "Meta",
                "g",
                "(Ljava/lang/Object;)Ljava/lang/Class;",
                &[Value::Ref(obj)],
            )
            .unwrap();
        let Some(Value::Ref(class_obj)) = result else {
            panic!("expected a reference, got {result:?}");
        };
        let instance = interp.heap().instance(class_obj).unwrap();
        assert_eq!(instance.class_name, "java/lang/Class");
        let Value::Ref(name_ref) =
            instance.get_field("name", "Ljava/lang/String;")
        else {
            panic!("expected a string reference in the name field");
        };
        assert_eq!(interp.heap().text(name_ref).unwrap(), "P");
    }

    #[test]
    fn object_hash_code_native_returns_reference() {
        let mut b = ClassFileBuilder::new("Hash", "java/lang/Object");
        let mref = b.methodref("java/lang/Object", "hashCode", "()I");
        let [mh, ml] = mref.to_be_bytes();
        b.add_method(
            ACC_STATIC,
            "h",
            "(Ljava/lang/Object;)I",
            1,
            1,
            vec![0x2a, 0xb6, mh, ml, 0xac],
        );
        let (mut interp, _dir) = boot(&[("Hash", &b)]);
        let obj = interp.new_object("P");
        let result = interp
            .execute(
                "Hash",
                "h",
                "(Ljava/lang/Object;)I",
                &[Value::Ref(obj)],
            )
            .unwrap();
        assert_eq!(result, Some(Value::Int(obj as i32)));
    }

    #[test]
    fn println_writes_integer_and_newline_separated_lines() {
        let mut b = ClassFileBuilder::new("Hello", "java/lang/Object");
        let out =
            b.fieldref("java/lang/System", "out", "Ljava/io/PrintStream;");
        let [oh, ol] = out.to_be_bytes();
        let println = b.methodref("java/io/PrintStream", "println", "(I)V");
        let [ph, pl] = println.to_be_bytes();
        let code = vec![
            0xb2, oh, ol, // getstatic System.out
            0x10, 0x07, // bipush 7
            0xb6, ph, pl, // invokevirtual println(I)V
            0xb1, // return
        ];
        b.add_method(ACC_STATIC, "main", "([Ljava/lang/String;)V", 2, 1, code);
        let (mut interp, _dir) = boot(&[("Hello", &b)]);
        interp.capture_output();
        interp.run_main("Hello").unwrap();
        assert_eq!(interp.captured(), ["7"]);
    }

    #[test]
    fn println_string_goes_through_the_object_pool() {
        let mut b = ClassFileBuilder::new("Greet", "java/lang/Object");
        let out =
            b.fieldref("java/lang/System", "out", "Ljava/io/PrintStream;");
        let [oh, ol] = out.to_be_bytes();
        let text = b.constant_string("hello, world");
        let println = b.methodref(
            "java/io/PrintStream",
            "println",
            "(Ljava/lang/String;)V",
        );
        let [ph, pl] = println.to_be_bytes();
        let code = vec![
            0xb2, oh, ol, // getstatic System.out
            0x12, text as u8, // ldc "hello, world"
            0xb6, ph, pl, // invokevirtual println(String)V
            0xb1, // return
        ];
        b.add_method(ACC_STATIC, "main", "([Ljava/lang/String;)V", 2, 1, code);
        let (mut interp, _dir) = boot(&[("Greet", &b)]);
        interp.capture_output();
        interp.run_main("Greet").unwrap();
        assert_eq!(interp.captured(), ["hello, world"]);
    }

    #[test]
    fn class_initializers_run_supers_first_and_exactly_once() {
        // class A { static int a; static { a = a + 1; } }
        let mut a = ClassFileBuilder::new("A", "java/lang/Object");
        a.add_field(ACC_STATIC, "a", "I");
        let a_a = a.fieldref("A", "a", "I");
        let [aah, aal] = a_a.to_be_bytes();
        a.add_method(
            ACC_STATIC,
            "<clinit>",
            "()V",
            2,
            0,
            vec![0xb2, aah, aal, 0x04, 0x60, 0xb3, aah, aal, 0xb1],
        );

        // class B extends A { static int b; static { b = a + 1; } }
        let mut bb = ClassFileBuilder::new("B", "A");
        bb.add_field(ACC_STATIC, "b", "I");
        let b_a = bb.fieldref("A", "a", "I");
        let [bah, bal] = b_a.to_be_bytes();
        let b_b = bb.fieldref("B", "b", "I");
        let [bbh, bbl] = b_b.to_be_bytes();
        bb.add_method(
            ACC_STATIC,
            "<clinit>",
            "()V",
            2,
            0,
            vec![0xb2, bah, bal, 0x04, 0x60, 0xb3, bbh, bbl, 0xb1],
        );

        // class Main { static int run() { return B.b; } }
        let mut main = ClassFileBuilder::new("Main", "java/lang/Object");
        let m_b = main.fieldref("B", "b", "I");
        let [mbh, mbl] = m_b.to_be_bytes();
        main.add_method(
            ACC_STATIC,
            "run",
            "()I",
            1,
            0,
            vec![0xb2, mbh, mbl, 0xac],
        );

        let (mut interp, _dir) =
            boot(&[("A", &a), ("B", &bb), ("Main", &main)]);
        assert_eq!(
            interp.execute("Main", "run", "()I", &[]).unwrap(),
            Some(Value::Int(2))
        );
        // Referencing B again must not re-run either initializer.
        assert_eq!(
            interp.execute("Main", "run", "()I", &[]).unwrap(),
            Some(Value::Int(2))
        );
        let class_a = interp.loader().get("A").unwrap();
        assert_eq!(class_a.get_static("a"), Some(Value::Int(1)));
    }

    #[test]
    fn virtual_dispatch_uses_runtime_class() {
        let mut a = ClassFileBuilder::new("A", "java/lang/Object");
        a.add_method(0, "m", "()I", 1, 1, vec![0x04, 0xac]); // 1
        let mut bb = ClassFileBuilder::new("B", "A");
        bb.add_method(0, "m", "()I", 1, 1, vec![0x05, 0xac]); // 2

        let mut main = ClassFileBuilder::new("Main", "java/lang/Object");
        let virt = main.methodref("A", "m", "()I");
        let [vh, vl] = virt.to_be_bytes();
        main.add_method(
            ACC_STATIC,
            "virt",
            "(LA;)I",
            1,
            1,
            vec![0x2a, 0xb6, vh, vl, 0xac],
        );
        main.add_method(
            ACC_STATIC,
            "spec",
            "(LA;)I",
            1,
            1,
            vec![0x2a, 0xb7, vh, vl, 0xac],
        );

        let (mut interp, _dir) =
            boot(&[("A", &a), ("B", &bb), ("Main", &main)]);
        interp.load_class("B").unwrap();
        let obj = interp.new_object("B");

        // invokevirtual dispatches on the receiver's runtime class.
        assert_eq!(
            interp
                .execute("Main", "virt", "(LA;)I", &[Value::Ref(obj)])
                .unwrap(),
            Some(Value::Int(2))
        );
        // invokespecial sticks with the named owner.
        assert_eq!(
            interp
                .execute("Main", "spec", "(LA;)I", &[Value::Ref(obj)])
                .unwrap(),
            Some(Value::Int(1))
        );
    }

    #[test]
    fn inherited_method_resolves_through_superclass() {
        let mut a = ClassFileBuilder::new("A", "java/lang/Object");
        a.add_method(0, "m", "()I", 1, 1, vec![0x04, 0xac]);
        let bb = ClassFileBuilder::new("B", "A");

        let mut main = ClassFileBuilder::new("Main", "java/lang/Object");
        let virt = main.methodref("B", "m", "()I");
        let [vh, vl] = virt.to_be_bytes();
        main.add_method(
            ACC_STATIC,
            "virt",
            "(LA;)I",
            1,
            1,
            vec![0x2a, 0xb6, vh, vl, 0xac],
        );

        let (mut interp, _dir) =
            boot(&[("A", &a), ("B", &bb), ("Main", &main)]);
        interp.load_class("B").unwrap();
        let obj = interp.new_object("B");
        assert_eq!(
            interp
                .execute("Main", "virt", "(LA;)I", &[Value::Ref(obj)])
                .unwrap(),
            Some(Value::Int(1))
        );
    }

    #[test]
    fn tableswitch_selects_cases_and_default() {
        let mut b = ClassFileBuilder::new("Tsw", "java/lang/Object");
        let code = vec![
            0x1a, // 0: iload_0
            0xaa, // 1: tableswitch
            0x00, 0x00, // padding to 4
            0, 0, 0, 36, // default -> 37
            0, 0, 0, 0, // low 0
            0, 0, 0, 2, // high 2
            0, 0, 0, 27, // case 0 -> 28
            0, 0, 0, 30, // case 1 -> 31
            0, 0, 0, 33, // case 2 -> 34
            0x10, 10, 0xac, // 28: bipush 10; ireturn
            0x10, 20, 0xac, // 31: bipush 20; ireturn
            0x10, 30, 0xac, // 34: bipush 30; ireturn
            0x02, 0xac, // 37: iconst_m1; ireturn
        ];
        b.add_method(ACC_STATIC, "pick", "(I)I", 1, 1, code);
        let (mut interp, _dir) = boot(&[("Tsw", &b)]);
        let mut pick = |k: i32| {
            interp
                .execute("Tsw", "pick", "(I)I", &[Value::Int(k)])
                .unwrap()
        };
        assert_eq!(pick(0), Some(Value::Int(10)));
        assert_eq!(pick(1), Some(Value::Int(20)));
        assert_eq!(pick(2), Some(Value::Int(30)));
        assert_eq!(pick(7), Some(Value::Int(-1)));
        assert_eq!(pick(-1), Some(Value::Int(-1)));
    }

    #[test]
    fn lookupswitch_matches_pairs() {
        let mut b = ClassFileBuilder::new("Lsw", "java/lang/Object");
        let code = vec![
            0x1a, // 0: iload_0
            0xab, // 1: lookupswitch
            0x00, 0x00, // padding to 4
            0, 0, 0, 33, // default -> 34
            0, 0, 0, 2, // npairs
            0, 0, 0, 5, 0, 0, 0, 27, // 5 -> 28
            0, 0, 0, 9, 0, 0, 0, 30, // 9 -> 31
            0x10, 50, 0xac, // 28: bipush 50; ireturn
            0x10, 90, 0xac, // 31: bipush 90; ireturn
            0x02, 0xac, // 34: iconst_m1; ireturn
        ];
        b.add_method(ACC_STATIC, "pick", "(I)I", 1, 1, code);
        let (mut interp, _dir) = boot(&[("Lsw", &b)]);
        let mut pick = |k: i32| {
            interp
                .execute("Lsw", "pick", "(I)I", &[Value::Int(k)])
                .unwrap()
        };
        assert_eq!(pick(5), Some(Value::Int(50)));
        assert_eq!(pick(9), Some(Value::Int(90)));
        assert_eq!(pick(0), Some(Value::Int(-1)));
    }

    #[test]
    fn wide_iinc_takes_sixteen_bit_operands() {
        let mut b = ClassFileBuilder::new("Wide", "java/lang/Object");
        // wide iinc 0, 300; iload_0; ireturn
        let code = vec![0xc4, 0x84, 0x00, 0x00, 0x01, 0x2c, 0x1a, 0xac];
        b.add_method(ACC_STATIC, "bump", "(I)I", 1, 1, code);
        let result = run_static(&b, "Wide", "bump", "(I)I", &[Value::Int(5)]);
        assert_eq!(result.unwrap(), Some(Value::Int(305)));
    }

    #[test]
    fn jsr_and_ret_route_through_a_subroutine() {
        let mut b = ClassFileBuilder::new("Sub", "java/lang/Object");
        let code = vec![
            0xa8, 0x00, 0x04, // 0: jsr -> 4
            0xac, // 3: ireturn
            0x4b, // 4: astore_0 (return address)
            0x08, // 5: iconst_5
            0xa9, 0x00, // 6: ret 0
        ];
        b.add_method(ACC_STATIC, "run", "()I", 2, 1, code);
        let result = run_static(&b, "Sub", "run", "()I", &[]);
        assert_eq!(result.unwrap(), Some(Value::Int(5)));
    }

    #[test]
    fn int_array_store_load_round_trip() {
        let mut b = ClassFileBuilder::new("Arr", "java/lang/Object");
        let code = vec![
            0x06, // iconst_3
            0xbc, 0x0a, // newarray int
            0x4b, // astore_0
            0x2a, // aload_0
            0x05, // iconst_2
            0x10, 0x2a, // bipush 42
            0x4f, // iastore
            0x2a, // aload_0
            0x05, // iconst_2
            0x2e, // iaload
            0xac, // ireturn
        ];
        b.add_method(ACC_STATIC, "run", "()I", 3, 1, code);
        let result = run_static(&b, "Arr", "run", "()I", &[]);
        assert_eq!(result.unwrap(), Some(Value::Int(42)));
    }

    #[test]
    fn array_access_out_of_bounds_is_fatal() {
        let mut b = ClassFileBuilder::new("Oob", "java/lang/Object");
        let code = vec![
            0x04, // iconst_1
            0xbc, 0x0a, // newarray int
            0x4b, // astore_0
            0x2a, // aload_0
            0x05, // iconst_2
            0x2e, // iaload
            0xac, // ireturn
        ];
        b.add_method(ACC_STATIC, "run", "()I", 2, 1, code);
        let err = run_static(&b, "Oob", "run", "()I", &[]).unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    #[test]
    fn byte_array_elements_sign_extend() {
        let mut b = ClassFileBuilder::new("Bar", "java/lang/Object");
        let code = vec![
            0x04, // iconst_1
            0xbc, 0x08, // newarray byte
            0x4b, // astore_0
            0x2a, // aload_0
            0x03, // iconst_0
            0x10, 0x80, // bipush -128
            0x54, // bastore
            0x2a, // aload_0
            0x03, // iconst_0
            0x33, // baload
            0xac, // ireturn
        ];
        b.add_method(ACC_STATIC, "run", "()I", 3, 1, code);
        let result = run_static(&b, "Bar", "run", "()I", &[]);
        assert_eq!(result.unwrap(), Some(Value::Int(-128)));
    }

    #[test]
    fn multianewarray_builds_nested_arrays() {
        let mut b = ClassFileBuilder::new("Mat", "java/lang/Object");
        let cls = b.constant_class("[[I");
        let [ch, cl] = cls.to_be_bytes();
        let code = vec![
            0x05, // iconst_2
            0x06, // iconst_3
            0xc5, ch, cl, 0x02, // multianewarray [[I, 2 dims
            0x4b, // astore_0
            0x2a, // aload_0
            0x03, // iconst_0
            0x32, // aaload
            0xbe, // arraylength
            0xac, // ireturn
        ];
        b.add_method(ACC_STATIC, "run", "()I", 3, 1, code);
        let result = run_static(&b, "Mat", "run", "()I", &[]);
        assert_eq!(result.unwrap(), Some(Value::Int(3)));
    }

    #[test]
    fn instanceof_walks_the_loaded_hierarchy() {
        let a = ClassFileBuilder::new("A", "java/lang/Object");
        let bb = ClassFileBuilder::new("B", "A");
        let mut main = ClassFileBuilder::new("Main", "java/lang/Object");
        let target = main.constant_class("A");
        let [th, tl] = target.to_be_bytes();
        main.add_method(
            ACC_STATIC,
            "test",
            "(Ljava/lang/Object;)I",
            1,
            1,
            vec![0x2a, 0xc1, th, tl, 0xac],
        );
        let (mut interp, _dir) =
            boot(&[("A", &a), ("B", &bb), ("Main", &main)]);
        interp.load_class("B").unwrap();

        let b_obj = interp.new_object("B");
        let unrelated = interp.new_object("Main");
        let mut test = |r: RefT| {
            interp
                .execute(
                    "Main",
                    "test",
                    "(Ljava/lang/Object;)I",
                    &[Value::Ref(r)],
                )
                .unwrap()
        };
        assert_eq!(test(b_obj), Some(Value::Int(1)));
        assert_eq!(test(unrelated), Some(Value::Int(0)));
        assert_eq!(test(0), Some(Value::Int(0)));
    }

    #[test]
    fn checkcast_passes_null_and_rejects_mismatch() {
        let a = ClassFileBuilder::new("A", "java/lang/Object");
        let bb = ClassFileBuilder::new("B", "A");
        let mut main = ClassFileBuilder::new("Main", "java/lang/Object");
        let target = main.constant_class("A");
        let [th, tl] = target.to_be_bytes();
        main.add_method(
            ACC_STATIC,
            "cast",
            "(Ljava/lang/Object;)Ljava/lang/Object;",
            1,
            1,
            vec![0x2a, 0xc0, th, tl, 0xb0],
        );
        let (mut interp, _dir) =
            boot(&[("A", &a), ("B", &bb), ("Main", &main)]);
        interp.load_class("B").unwrap();

        let b_obj = interp.new_object("B");
        assert_eq!(
            interp
                .execute(
                    "Main",
                    "cast",
                    "(Ljava/lang/Object;)Ljava/lang/Object;",
                    &[Value::Ref(b_obj)]
                )
                .unwrap(),
            Some(Value::Ref(b_obj))
        );
        assert_eq!(
            interp
                .execute(
                    "Main",
                    "cast",
                    "(Ljava/lang/Object;)Ljava/lang/Object;",
                    &[Value::Ref(0)]
                )
                .unwrap(),
            Some(Value::Ref(0))
        );
        let stranger = interp.new_object("Main");
        let err = interp
            .execute(
                "Main",
                "cast",
                "(Ljava/lang/Object;)Ljava/lang/Object;",
                &[Value::Ref(stranger)],
            )
            .unwrap_err();
        assert!(err.to_string().contains("cannot cast"));
    }

    #[test]
    fn ldc_pushes_pool_constants() {
        let mut b = ClassFileBuilder::new("Ldc", "java/lang/Object");
        let int_idx = b.constant_integer(1_000_000);
        b.add_method(
            ACC_STATIC,
            "i",
            "()I",
            1,
            0,
            vec![0x12, int_idx as u8, 0xac],
        );
        let long_idx = b.constant_long(1 << 50);
        let [lh, ll] = long_idx.to_be_bytes();
        b.add_method(
            ACC_STATIC,
            "l",
            "()J",
            2,
            0,
            vec![0x14, lh, ll, 0xad],
        );
        let text_idx = b.constant_string("interned");
        b.add_method(
            ACC_STATIC,
            "s",
            "()Ljava/lang/String;",
            1,
            0,
            vec![0x12, text_idx as u8, 0xb0],
        );
        let (mut interp, _dir) = boot(&[("Ldc", &b)]);
        assert_eq!(
            interp.execute("Ldc", "i", "()I", &[]).unwrap(),
            Some(Value::Int(1_000_000))
        );
        assert_eq!(
            interp.execute("Ldc", "l", "()J", &[]).unwrap(),
            Some(Value::Long(1 << 50))
        );
        let text = interp
            .execute("Ldc", "s", "()Ljava/lang/String;", &[])
            .unwrap();
        let Some(Value::Ref(reference)) = text else {
            panic!("expected a reference, got {text:?}");
        };
        assert_eq!(interp.heap().text(reference).unwrap(), "interned");
    }

    #[test]
    fn null_receiver_is_fatal() {
        let mut b = ClassFileBuilder::new("Npe", "java/lang/Object");
        let mref = b.methodref("java/lang/Object", "hashCode", "()I");
        let [mh, ml] = mref.to_be_bytes();
        b.add_method(
            ACC_STATIC,
            "h",
            "(Ljava/lang/Object;)I",
            1,
            1,
            vec![0x2a, 0xb6, mh, ml, 0xac],
        );
        let err = run_static(
            &b,
            "Npe",
            "h",
            "(Ljava/lang/Object;)I",
            &[Value::Ref(0)],
        )
        .unwrap_err();
        assert!(err.to_string().contains("null receiver"));
    }

    #[test]
    fn stack_underflow_is_reported_with_location() {
        let mut b = ClassFileBuilder::new("Bad", "java/lang/Object");
        b.add_method(ACC_STATIC, "run", "()V", 1, 0, vec![0x57, 0xb1]);
        let err = run_static(&b, "Bad", "run", "()V", &[]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("underflow"));
        assert!(message.contains("Bad.run"));
        assert!(message.contains("pc 0"));
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        let mut b = ClassFileBuilder::new("Odd", "java/lang/Object");
        b.add_method(ACC_STATIC, "run", "()V", 0, 0, vec![0xfe]);
        let err = run_static(&b, "Odd", "run", "()V", &[]).unwrap_err();
        assert!(err.to_string().contains("unknown opcode"));
    }

    #[test]
    fn missing_method_is_a_link_error() {
        let b = ClassFileBuilder::new("Empty", "java/lang/Object");
        let err =
            run_static(&b, "Empty", "nothing", "()V", &[]).unwrap_err();
        assert!(matches!(err, Error::Link { .. }));
    }

    #[test]
    fn constructor_chain_terminates_at_object_init() {
        let mut b = ClassFileBuilder::new("Ctor", "java/lang/Object");
        let init =
            b.methodref("java/lang/Object", "<init>", "()V");
        let [ih, il] = init.to_be_bytes();
        // <init> calls super(); run() news an instance and invokes it.
        b.add_method(0, "<init>", "()V", 1, 1, vec![0x2a, 0xb7, ih, il, 0xb1]);
        let cls = b.constant_class("Ctor");
        let [ch, cl] = cls.to_be_bytes();
        let own_init = b.methodref("Ctor", "<init>", "()V");
        let [oh, ol] = own_init.to_be_bytes();
        b.add_method(
            ACC_STATIC,
            "run",
            "()I",
            2,
            0,
            vec![0xbb, ch, cl, 0x59, 0xb7, oh, ol, 0x04, 0xac],
        );
        let result = run_static(&b, "Ctor", "run", "()I", &[]);
        assert_eq!(result.unwrap(), Some(Value::Int(1)));
    }
}

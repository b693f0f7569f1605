//! Runtime representation of a loaded class and of JVM type descriptors.
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use regex::Regex;

use crate::error::{Error, Result};
use crate::jvm::{CPInfo, ClassFile, ConstantPool, FieldInfo};
use crate::runtime::Value;

/// Primitive types as they appear in JVM descriptors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BaseTypeKind {
    Byte,
    Char,
    Short,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Reference,
    Array,
    Void,
}

/// JVM value type decoded from a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    pub kind: BaseTypeKind,
    pub sub_t: Option<Box<Type>>,
}

impl Type {
    const fn of(kind: BaseTypeKind) -> Self {
        Self { kind, sub_t: None }
    }

    /// Returns the size in slots of a value of this type.
    pub fn size(&self) -> usize {
        match self.kind {
            BaseTypeKind::Long | BaseTypeKind::Double => 2,
            BaseTypeKind::Void => 0,
            _ => 1,
        }
    }
}

/// A parsed method descriptor: argument types and return type.
#[derive(Debug, Clone)]
pub struct MethodSig {
    pub args: Vec<Type>,
    pub ret: Type,
}

impl MethodSig {
    /// Parses a descriptor of the form `(args)ret`.
    pub fn parse(descriptor: &str) -> Result<Self> {
        // Split the parenthesized argument list from the return type.
        let re = Regex::new(r"\(([^\)]*)\)([^$]+)").expect("descriptor regex");
        let caps = re.captures(descriptor).ok_or_else(|| {
            Error::parse(format!("malformed method descriptor {descriptor}"))
        })?;
        let arg_string = caps.get(1).map_or("", |m| m.as_str());
        let ret_string = caps.get(2).map_or("", |m| m.as_str());

        let mut args = Vec::new();
        let mut chars = arg_string.chars();
        while let Some(t) = decode_type(&mut chars)? {
            args.push(t);
        }
        let ret = decode_type(&mut ret_string.chars())?.ok_or_else(|| {
            Error::parse(format!(
                "method descriptor {descriptor} has no return type"
            ))
        })?;
        Ok(Self { args, ret })
    }

    /// Number of local-variable slots taken by the arguments, not counting
    /// a `this` receiver.
    pub fn arg_slots(&self) -> usize {
        self.args.iter().map(Type::size).sum()
    }
}

/// Decodes the next type out of a descriptor character stream. Returns
/// `Ok(None)` at end of input.
fn decode_type(chars: &mut std::str::Chars<'_>) -> Result<Option<Type>> {
    let Some(c) = chars.next() else {
        return Ok(None);
    };
    let t = match c {
        'B' => Type::of(BaseTypeKind::Byte),
        'C' => Type::of(BaseTypeKind::Char),
        'S' => Type::of(BaseTypeKind::Short),
        'Z' => Type::of(BaseTypeKind::Boolean),
        'I' => Type::of(BaseTypeKind::Int),
        'J' => Type::of(BaseTypeKind::Long),
        'F' => Type::of(BaseTypeKind::Float),
        'D' => Type::of(BaseTypeKind::Double),
        'V' => Type::of(BaseTypeKind::Void),
        'L' => {
            // Consume the class name up to the terminating ';'.
            for c in chars.by_ref() {
                if c == ';' {
                    break;
                }
            }
            Type::of(BaseTypeKind::Reference)
        }
        '[' => {
            let element = decode_type(chars)?.ok_or_else(|| {
                Error::parse("array descriptor missing element type")
            })?;
            Type {
                kind: BaseTypeKind::Array,
                sub_t: Some(Box::new(element)),
            }
        }
        other => {
            return Err(Error::parse(format!(
                "unexpected character {other:?} in type descriptor"
            )));
        }
    };
    Ok(Some(t))
}

/// Returns the slot width (1 or 2) of a field with the given descriptor.
pub fn descriptor_width(descriptor: &str) -> usize {
    match descriptor.as_bytes().first() {
        Some(b'J') | Some(b'D') => 2,
        _ => 1,
    }
}

/// A method lifted out of the class file, with its descriptor parsed once.
#[derive(Debug)]
pub struct Method {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
    pub code: Vec<u8>,
    pub max_stack: u16,
    pub max_locals: u16,
    pub sig: MethodSig,
}

impl Method {
    pub const fn is_native(&self) -> bool {
        self.access_flags & crate::jvm::ACC_NATIVE != 0
    }

    pub const fn is_static(&self) -> bool {
        self.access_flags & crate::jvm::ACC_STATIC != 0
    }
}

/// A loaded class. Everything is immutable after construction except the
/// static variable map.
#[derive(Debug)]
pub struct Class {
    pub name: String,
    pub super_name: Option<String>,
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<Rc<Method>>,
    statics: RefCell<HashMap<String, Value>>,
}

impl Class {
    /// Lifts a decoded class file into its runtime form: resolves the
    /// class names, parses every method descriptor, and prepares the
    /// statics map (zero values, then numeric ConstantValue entries).
    pub fn from_class_file(class_file: ClassFile) -> Result<Self> {
        let pool = &class_file.constant_pool;
        let name = pool.class_name(class_file.this_class)?.to_owned();
        let super_name = if class_file.super_class == 0 {
            None
        } else {
            Some(pool.class_name(class_file.super_class)?.to_owned())
        };

        let mut methods = Vec::with_capacity(class_file.methods.len());
        for info in &class_file.methods {
            let sig = MethodSig::parse(&info.descriptor)?;
            methods.push(Rc::new(Method {
                access_flags: info.access_flags,
                name: info.name.clone(),
                descriptor: info.descriptor.clone(),
                code: info.code.clone(),
                max_stack: info.max_stack,
                max_locals: info.max_locals,
                sig,
            }));
        }

        let mut statics = HashMap::new();
        for field in class_file.fields.iter().filter(|f| f.is_static()) {
            let mut value = Value::default_for(&field.descriptor);
            if let Some(constant_index) = field.constant_value {
                match pool.entry(constant_index)? {
                    CPInfo::ConstantInteger { value: v } => {
                        value = Value::Int(*v);
                    }
                    CPInfo::ConstantFloat { value: v } => {
                        value = Value::Float(*v);
                    }
                    CPInfo::ConstantLong { value: v } => {
                        value = Value::Long(*v);
                    }
                    CPInfo::ConstantDouble { value: v } => {
                        value = Value::Double(*v);
                    }
                    // String constants need the heap; the interpreter
                    // applies them when it initializes the class.
                    CPInfo::ConstantString { .. } => {}
                    other => {
                        return Err(Error::parse(format!(
                            "field {} has ConstantValue of unsupported tag {}",
                            field.name,
                            other.tag()
                        )));
                    }
                }
            }
            statics.insert(field.name.clone(), value);
        }

        Ok(Self {
            name,
            super_name,
            minor_version: class_file.minor_version,
            major_version: class_file.major_version,
            constant_pool: class_file.constant_pool,
            fields: class_file.fields,
            methods,
            statics: RefCell::new(statics),
        })
    }

    /// Exact method lookup within this class only; superclass traversal is
    /// the interpreter's job.
    pub fn method(&self, name: &str, descriptor: &str) -> Option<Rc<Method>> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
            .cloned()
    }

    pub fn has_static(&self, name: &str) -> bool {
        self.statics.borrow().contains_key(name)
    }

    pub fn get_static(&self, name: &str) -> Option<Value> {
        self.statics.borrow().get(name).copied()
    }

    pub fn set_static(&self, name: &str, value: Value) {
        self.statics.borrow_mut().insert(name.to_owned(), value);
    }
}

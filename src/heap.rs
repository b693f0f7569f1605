//! The process-wide object pool backing references.
//!
//! References are small integers indexing into the pool; reference 0 is the
//! null sentinel and never resolves. Entries are allocated and never freed.
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::runtime::{RefT, Value};

/// A plain object: a class name and an ordered map from field name to the
/// field's raw slot value (one or two slots packed into the u64 per the
/// field's width). Fields appear in the map on first write; absent fields
/// read as zero/null.
#[derive(Debug, Clone)]
pub struct Instance {
    pub class_name: String,
    pub fields: BTreeMap<String, u64>,
}

impl Instance {
    pub fn get_field(&self, name: &str, descriptor: &str) -> Value {
        match self.fields.get(name) {
            Some(&raw) => Value::from_raw(descriptor, raw),
            None => Value::default_for(descriptor),
        }
    }

    pub fn set_field(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_owned(), value.to_raw());
    }
}

/// An array: element class name, element slot width (1 or 2), length, and
/// a backing slot vector of `length * width` slots.
#[derive(Debug, Clone)]
pub struct ArrayObject {
    pub elem_class: String,
    pub width: usize,
    pub length: usize,
    data: Vec<u32>,
}

impl ArrayObject {
    fn check(&self, index: i32) -> Result<usize> {
        if index < 0 || index as usize >= self.length {
            return Err(Error::bytecode(format!(
                "array index {index} out of bounds for length {}",
                self.length
            )));
        }
        Ok(index as usize)
    }

    /// Reads element `index`; for width-2 arrays the two slots come back
    /// packed high word first.
    pub fn get(&self, index: i32) -> Result<u64> {
        let ii = self.check(index)? * self.width;
        Ok(if self.width == 2 {
            (u64::from(self.data[ii]) << 32) | u64::from(self.data[ii + 1])
        } else {
            u64::from(self.data[ii])
        })
    }

    pub fn set(&mut self, index: i32, raw: u64) -> Result<()> {
        let ii = self.check(index)? * self.width;
        if self.width == 2 {
            self.data[ii] = (raw >> 32) as u32;
            self.data[ii + 1] = raw as u32;
        } else {
            self.data[ii] = raw as u32;
        }
        Ok(())
    }
}

/// A single entry in the object pool.
#[derive(Debug, Clone)]
pub enum HeapObject {
    /// Occupies index 0 only; dereferencing it is the null error.
    Null,
    Instance(Instance),
    Array(ArrayObject),
    /// A string literal, interned by `ldc` and read back by println.
    Text(String),
}

/// The object pool. All heap objects of the running program live here.
#[derive(Debug)]
pub struct Heap {
    entries: Vec<HeapObject>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            entries: vec![HeapObject::Null],
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    fn alloc(&mut self, object: HeapObject) -> RefT {
        let reference = self.entries.len() as RefT;
        self.entries.push(object);
        reference
    }

    /// Allocates a fresh object with an empty field map.
    pub fn alloc_instance(&mut self, class_name: &str) -> RefT {
        self.alloc(HeapObject::Instance(Instance {
            class_name: class_name.to_owned(),
            fields: BTreeMap::new(),
        }))
    }

    /// Allocates a zero-filled array.
    pub fn alloc_array(
        &mut self,
        elem_class: &str,
        width: usize,
        length: usize,
    ) -> RefT {
        self.alloc(HeapObject::Array(ArrayObject {
            elem_class: elem_class.to_owned(),
            width,
            length,
            data: vec![0; length * width],
        }))
    }

    pub fn alloc_text(&mut self, text: &str) -> RefT {
        self.alloc(HeapObject::Text(text.to_owned()))
    }

    pub fn get(&self, reference: RefT) -> Result<&HeapObject> {
        match self.entries.get(reference as usize) {
            Some(HeapObject::Null) | None => Err(Self::invalid(reference)),
            Some(object) => Ok(object),
        }
    }

    pub fn get_mut(&mut self, reference: RefT) -> Result<&mut HeapObject> {
        match self.entries.get_mut(reference as usize) {
            Some(HeapObject::Null) | None => Err(Self::invalid(reference)),
            Some(object) => Ok(object),
        }
    }

    pub fn instance(&self, reference: RefT) -> Result<&Instance> {
        match self.get(reference)? {
            HeapObject::Instance(instance) => Ok(instance),
            other => Err(Error::bytecode(format!(
                "reference {reference} is not an object ({})",
                Self::describe(other)
            ))),
        }
    }

    pub fn instance_mut(&mut self, reference: RefT) -> Result<&mut Instance> {
        match self.get_mut(reference)? {
            HeapObject::Instance(instance) => Ok(instance),
            other => Err(Error::bytecode(format!(
                "reference {reference} is not an object ({})",
                Self::describe(other)
            ))),
        }
    }

    pub fn array(&self, reference: RefT) -> Result<&ArrayObject> {
        match self.get(reference)? {
            HeapObject::Array(array) => Ok(array),
            other => Err(Error::bytecode(format!(
                "reference {reference} is not an array ({})",
                Self::describe(other)
            ))),
        }
    }

    pub fn array_mut(&mut self, reference: RefT) -> Result<&mut ArrayObject> {
        match self.get_mut(reference)? {
            HeapObject::Array(array) => Ok(array),
            other => Err(Error::bytecode(format!(
                "reference {reference} is not an array ({})",
                Self::describe(other)
            ))),
        }
    }

    pub fn text(&self, reference: RefT) -> Result<&str> {
        match self.get(reference)? {
            HeapObject::Text(text) => Ok(text),
            other => Err(Error::bytecode(format!(
                "reference {reference} is not a string ({})",
                Self::describe(other)
            ))),
        }
    }

    /// Shallow copy: a new pool entry of the same kind; instance field
    /// maps and array contents are copied by value.
    pub fn shallow_clone(&mut self, reference: RefT) -> Result<RefT> {
        let copy = self.get(reference)?.clone();
        Ok(self.alloc(copy))
    }

    /// The runtime class name of the referenced entry.
    pub fn class_name_of(&self, reference: RefT) -> Result<String> {
        Ok(match self.get(reference)? {
            HeapObject::Instance(instance) => instance.class_name.clone(),
            HeapObject::Array(array) => format!("[{}", array.elem_class),
            HeapObject::Text(_) => "java/lang/String".to_owned(),
            HeapObject::Null => unreachable!("get rejects null"),
        })
    }

    fn invalid(reference: RefT) -> Error {
        if reference == 0 {
            Error::bytecode("null reference")
        } else {
            Error::bytecode(format!("invalid object reference {reference}"))
        }
    }

    fn describe(object: &HeapObject) -> &'static str {
        match object {
            HeapObject::Null => "null",
            HeapObject::Instance(_) => "instance",
            HeapObject::Array(_) => "array",
            HeapObject::Text(_) => "string",
        }
    }
}

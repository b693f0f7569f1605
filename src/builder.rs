//! Programmatic construction of class files.
//!
//! The builder emits the same big-endian layout the decoder consumes. It
//! exists for the test suites, which synthesize small classes instead of
//! shipping compiled fixtures, but it is a plain serializer with no test
//! dependencies.
use std::collections::HashMap;

use crate::jvm::CPInfo;

const ACC_PUBLIC: u16 = 0x0001;
const ACC_SUPER: u16 = 0x0020;

struct BuiltField {
    access_flags: u16,
    name_index: u16,
    descriptor_index: u16,
    constant_value: Option<u16>,
}

struct BuiltMethod {
    access_flags: u16,
    name_index: u16,
    descriptor_index: u16,
    max_stack: u16,
    max_locals: u16,
    code: Vec<u8>,
}

/// Builds a class file as a byte vector. Constant pool entries are interned
/// on demand; Long and Double entries consume two indices exactly like the
/// format requires.
pub struct ClassFileBuilder {
    entries: Vec<CPInfo>,
    utf8_cache: HashMap<String, u16>,
    class_cache: HashMap<String, u16>,
    access_flags: u16,
    this_class: u16,
    super_class: u16,
    fields: Vec<BuiltField>,
    methods: Vec<BuiltMethod>,
    attributes: Vec<(u16, Vec<u8>)>,
}

impl ClassFileBuilder {
    pub fn new(this_name: &str, super_name: &str) -> Self {
        let mut builder = Self {
            // Index 0 is reserved.
            entries: vec![CPInfo::Unspecified],
            utf8_cache: HashMap::new(),
            class_cache: HashMap::new(),
            access_flags: ACC_PUBLIC | ACC_SUPER,
            this_class: 0,
            super_class: 0,
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        };
        builder.this_class = builder.constant_class(this_name);
        builder.super_class = builder.constant_class(super_name);
        builder
    }

    fn push(&mut self, entry: CPInfo) -> u16 {
        let index = self.entries.len() as u16;
        let two_slots = matches!(
            entry,
            CPInfo::ConstantLong { .. } | CPInfo::ConstantDouble { .. }
        );
        self.entries.push(entry);
        if two_slots {
            self.entries.push(CPInfo::Unspecified);
        }
        index
    }

    pub fn utf8(&mut self, text: &str) -> u16 {
        if let Some(&index) = self.utf8_cache.get(text) {
            return index;
        }
        let index = self.push(CPInfo::ConstantUtf8 {
            bytes: text.to_owned(),
        });
        self.utf8_cache.insert(text.to_owned(), index);
        index
    }

    pub fn constant_class(&mut self, name: &str) -> u16 {
        if let Some(&index) = self.class_cache.get(name) {
            return index;
        }
        let name_index = self.utf8(name);
        let index = self.push(CPInfo::ConstantClass { name_index });
        self.class_cache.insert(name.to_owned(), index);
        index
    }

    pub fn constant_integer(&mut self, value: i32) -> u16 {
        self.push(CPInfo::ConstantInteger { value })
    }

    pub fn constant_float(&mut self, value: f32) -> u16 {
        self.push(CPInfo::ConstantFloat { value })
    }

    pub fn constant_long(&mut self, value: i64) -> u16 {
        self.push(CPInfo::ConstantLong { value })
    }

    pub fn constant_double(&mut self, value: f64) -> u16 {
        self.push(CPInfo::ConstantDouble { value })
    }

    pub fn constant_string(&mut self, text: &str) -> u16 {
        let string_index = self.utf8(text);
        self.push(CPInfo::ConstantString { string_index })
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.push(CPInfo::ConstantNameAndType {
            name_index,
            descriptor_index,
        })
    }

    pub fn fieldref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> u16 {
        let class_index = self.constant_class(owner);
        let name_and_type_index = self.name_and_type(name, descriptor);
        self.push(CPInfo::ConstantFieldRef {
            class_index,
            name_and_type_index,
        })
    }

    pub fn methodref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> u16 {
        let class_index = self.constant_class(owner);
        let name_and_type_index = self.name_and_type(name, descriptor);
        self.push(CPInfo::ConstantMethodRef {
            class_index,
            name_and_type_index,
        })
    }

    pub fn add_field(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
    ) {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.fields.push(BuiltField {
            access_flags,
            name_index,
            descriptor_index,
            constant_value: None,
        });
    }

    /// Adds a field carrying a ConstantValue attribute pointing at an
    /// existing pool entry.
    pub fn add_field_with_constant(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        constant_index: u16,
    ) {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.utf8("ConstantValue");
        self.fields.push(BuiltField {
            access_flags,
            name_index,
            descriptor_index,
            constant_value: Some(constant_index),
        });
    }

    pub fn add_method(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
    ) {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.utf8("Code");
        self.methods.push(BuiltMethod {
            access_flags,
            name_index,
            descriptor_index,
            max_stack,
            max_locals,
            code,
        });
    }

    /// Attaches an opaque class-level attribute; the decoder skips these.
    pub fn class_attribute(&mut self, name: &str, payload: Vec<u8>) {
        let name_index = self.utf8(name);
        self.attributes.push((name_index, payload));
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
        // minor 0, major 52 (Java 8).
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&52u16.to_be_bytes());

        out.extend_from_slice(&(self.entries.len() as u16).to_be_bytes());
        for entry in &self.entries[1..] {
            serialize_entry(entry, &mut out);
        }

        out.extend_from_slice(&self.access_flags.to_be_bytes());
        out.extend_from_slice(&self.this_class.to_be_bytes());
        out.extend_from_slice(&self.super_class.to_be_bytes());
        // No interfaces.
        out.extend_from_slice(&0u16.to_be_bytes());

        out.extend_from_slice(&(self.fields.len() as u16).to_be_bytes());
        for field in &self.fields {
            out.extend_from_slice(&field.access_flags.to_be_bytes());
            out.extend_from_slice(&field.name_index.to_be_bytes());
            out.extend_from_slice(&field.descriptor_index.to_be_bytes());
            match field.constant_value {
                Some(constant_index) => {
                    out.extend_from_slice(&1u16.to_be_bytes());
                    let attr_name = self.utf8_cache["ConstantValue"];
                    out.extend_from_slice(&attr_name.to_be_bytes());
                    out.extend_from_slice(&2u32.to_be_bytes());
                    out.extend_from_slice(&constant_index.to_be_bytes());
                }
                None => out.extend_from_slice(&0u16.to_be_bytes()),
            }
        }

        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for method in &self.methods {
            out.extend_from_slice(&method.access_flags.to_be_bytes());
            out.extend_from_slice(&method.name_index.to_be_bytes());
            out.extend_from_slice(&method.descriptor_index.to_be_bytes());
            out.extend_from_slice(&1u16.to_be_bytes());
            let attr_name = self.utf8_cache["Code"];
            out.extend_from_slice(&attr_name.to_be_bytes());
            let attr_length = 12 + method.code.len() as u32;
            out.extend_from_slice(&attr_length.to_be_bytes());
            out.extend_from_slice(&method.max_stack.to_be_bytes());
            out.extend_from_slice(&method.max_locals.to_be_bytes());
            out.extend_from_slice(&(method.code.len() as u32).to_be_bytes());
            out.extend_from_slice(&method.code);
            // Empty exception table, no nested attributes.
            out.extend_from_slice(&0u16.to_be_bytes());
            out.extend_from_slice(&0u16.to_be_bytes());
        }

        out.extend_from_slice(&(self.attributes.len() as u16).to_be_bytes());
        for (name_index, payload) in &self.attributes {
            out.extend_from_slice(&name_index.to_be_bytes());
            out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            out.extend_from_slice(payload);
        }
        out
    }
}

fn serialize_entry(entry: &CPInfo, out: &mut Vec<u8>) {
    match entry {
        CPInfo::Unspecified => {}
        _ => out.push(entry.tag()),
    }
    match entry {
        CPInfo::ConstantClass { name_index } => {
            out.extend_from_slice(&name_index.to_be_bytes());
        }
        CPInfo::ConstantFieldRef {
            class_index,
            name_and_type_index,
        }
        | CPInfo::ConstantMethodRef {
            class_index,
            name_and_type_index,
        }
        | CPInfo::ConstantInterfaceMethodRef {
            class_index,
            name_and_type_index,
        } => {
            out.extend_from_slice(&class_index.to_be_bytes());
            out.extend_from_slice(&name_and_type_index.to_be_bytes());
        }
        CPInfo::ConstantString { string_index } => {
            out.extend_from_slice(&string_index.to_be_bytes());
        }
        CPInfo::ConstantInteger { value } => {
            out.extend_from_slice(&value.to_be_bytes());
        }
        CPInfo::ConstantFloat { value } => {
            out.extend_from_slice(&value.to_be_bytes());
        }
        CPInfo::ConstantLong { value } => {
            out.extend_from_slice(&value.to_be_bytes());
        }
        CPInfo::ConstantDouble { value } => {
            out.extend_from_slice(&value.to_be_bytes());
        }
        CPInfo::ConstantNameAndType {
            name_index,
            descriptor_index,
        } => {
            out.extend_from_slice(&name_index.to_be_bytes());
            out.extend_from_slice(&descriptor_index.to_be_bytes());
        }
        CPInfo::ConstantUtf8 { bytes } => {
            out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
            out.extend_from_slice(bytes.as_bytes());
        }
        CPInfo::ConstantMethodHandle {
            reference_kind,
            reference_index,
        } => {
            out.push(*reference_kind);
            out.extend_from_slice(&reference_index.to_be_bytes());
        }
        CPInfo::ConstantMethodType { descriptor_index } => {
            out.extend_from_slice(&descriptor_index.to_be_bytes());
        }
        CPInfo::ConstantInvokeDynamic {
            bootstrap_method_attr_index,
            name_and_type_index,
        } => {
            out.extend_from_slice(&bootstrap_method_attr_index.to_be_bytes());
            out.extend_from_slice(&name_and_type_index.to_be_bytes());
        }
        CPInfo::Unspecified => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jvm::JVMParser;

    #[test]
    fn built_pool_preserves_lengths_and_tags() {
        let mut builder = ClassFileBuilder::new("T", "java/lang/Object");
        builder.constant_integer(1);
        builder.constant_long(2);
        builder.constant_double(3.0);
        builder.constant_string("s");
        let parsed = JVMParser::parse(&builder.build()).unwrap();
        assert_eq!(parsed.constant_pool.len(), builder.entries.len());
        for (ii, entry) in builder.entries.iter().enumerate() {
            assert_eq!(
                parsed.constant_pool.entry(ii as u16).unwrap().tag(),
                entry.tag()
            );
        }
    }

    #[test]
    fn utf8_entries_are_interned() {
        let mut builder = ClassFileBuilder::new("T", "java/lang/Object");
        let a = builder.utf8("x");
        let b = builder.utf8("x");
        assert_eq!(a, b);
    }
}

//! Parser and decoder for JVM class files, together with the constant pool
//! and its typed accessors.
use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Error, Result};

/// Values of magic bytes of a JVM class file.
pub const JVM_CLASS_FILE_MAGIC: u32 = 0xCAFE_BABE;

pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_ABSTRACT: u16 = 0x0400;

/// `CPInfo` represents constant pool entries.
#[derive(Debug, Clone, PartialEq)]
pub enum CPInfo {
    ConstantClass {
        name_index: u16,
    },
    ConstantFieldRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantMethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantInterfaceMethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantString {
        string_index: u16,
    },
    ConstantInteger {
        value: i32,
    },
    ConstantFloat {
        value: f32,
    },
    ConstantLong {
        value: i64,
    },
    ConstantDouble {
        value: f64,
    },
    ConstantNameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    ConstantUtf8 {
        bytes: String,
    },
    ConstantMethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    ConstantMethodType {
        descriptor_index: u16,
    },
    ConstantInvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    // Fills index 0 and the reserved slot after each Long/Double entry.
    Unspecified,
}

impl CPInfo {
    /// Returns the class-file tag byte for the entry, 0 for placeholders.
    pub const fn tag(&self) -> u8 {
        match self {
            Self::ConstantUtf8 { .. } => 1,
            Self::ConstantInteger { .. } => 3,
            Self::ConstantFloat { .. } => 4,
            Self::ConstantLong { .. } => 5,
            Self::ConstantDouble { .. } => 6,
            Self::ConstantClass { .. } => 7,
            Self::ConstantString { .. } => 8,
            Self::ConstantFieldRef { .. } => 9,
            Self::ConstantMethodRef { .. } => 10,
            Self::ConstantInterfaceMethodRef { .. } => 11,
            Self::ConstantNameAndType { .. } => 12,
            Self::ConstantMethodHandle { .. } => 15,
            Self::ConstantMethodType { .. } => 16,
            Self::ConstantInvokeDynamic { .. } => 18,
            Self::Unspecified => 0,
        }
    }
}

/// `ConstantKind` encodes the kind of a constant in the constants pool.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ConstantKind {
    Utf8 = 1,
    Integer = 3,
    Float = 4,
    Long = 5,
    Double = 6,
    Class = 7,
    String = 8,
    FieldRef = 9,
    MethodRef = 10,
    InterfaceMethodRef = 11,
    NameAndType = 12,
    MethodHandle = 15,
    MethodType = 16,
    InvokeDynamic = 18,
    Unspecified,
}

impl From<u8> for ConstantKind {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Utf8,
            3 => Self::Integer,
            4 => Self::Float,
            5 => Self::Long,
            6 => Self::Double,
            7 => Self::Class,
            8 => Self::String,
            9 => Self::FieldRef,
            10 => Self::MethodRef,
            11 => Self::InterfaceMethodRef,
            12 => Self::NameAndType,
            15 => Self::MethodHandle,
            16 => Self::MethodType,
            18 => Self::InvokeDynamic,
            _ => Self::Unspecified,
        }
    }
}

/// The constant pool of a single class, 1-indexed the way every other
/// class-file structure refers to it. Index 0 and the slot following a
/// Long/Double entry hold `Unspecified` placeholders; the typed accessors
/// reject them.
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    entries: Vec<CPInfo>,
}

impl ConstantPool {
    pub fn new(entries: Vec<CPInfo>) -> Self {
        Self { entries }
    }

    /// Number of slots including the reserved index 0.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw access to an entry. Callers that need a value of a particular
    /// kind go through the typed accessors instead.
    pub fn entry(&self, index: u16) -> Result<&CPInfo> {
        self.entries.get(index as usize).ok_or_else(|| {
            Error::tag(format!(
                "constant pool index {index} out of range (size {})",
                self.entries.len()
            ))
        })
    }

    /// Returns the Utf8 string at `index`.
    pub fn utf8_at(&self, index: u16) -> Result<&str> {
        match self.entry(index)? {
            CPInfo::ConstantUtf8 { bytes } => Ok(bytes),
            other => Err(Self::mismatch(index, "Utf8", other)),
        }
    }

    /// Returns the name of the Class constant at `index`.
    pub fn class_name(&self, index: u16) -> Result<&str> {
        match self.entry(index)? {
            CPInfo::ConstantClass { name_index } => self.utf8_at(*name_index),
            other => Err(Self::mismatch(index, "Class", other)),
        }
    }

    /// Returns the text of the String constant at `index`.
    pub fn string_utf8(&self, index: u16) -> Result<&str> {
        match self.entry(index)? {
            CPInfo::ConstantString { string_index } => {
                self.utf8_at(*string_index)
            }
            other => Err(Self::mismatch(index, "String", other)),
        }
    }

    /// Returns `(name, descriptor)` of the NameAndType entry at `index`.
    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.entry(index)? {
            CPInfo::ConstantNameAndType {
                name_index,
                descriptor_index,
            } => Ok((
                self.utf8_at(*name_index)?,
                self.utf8_at(*descriptor_index)?,
            )),
            other => Err(Self::mismatch(index, "NameAndType", other)),
        }
    }

    /// Resolves a Fieldref to `(owner_class, field_name, descriptor)`.
    pub fn fieldref(&self, index: u16) -> Result<(&str, &str, &str)> {
        match self.entry(index)? {
            CPInfo::ConstantFieldRef {
                class_index,
                name_and_type_index,
            } => {
                let owner = self.class_name(*class_index)?;
                let (name, descriptor) =
                    self.name_and_type(*name_and_type_index)?;
                Ok((owner, name, descriptor))
            }
            other => Err(Self::mismatch(index, "Fieldref", other)),
        }
    }

    /// Resolves a Methodref or InterfaceMethodref to
    /// `(owner_class, method_name, descriptor)`.
    pub fn methodref(&self, index: u16) -> Result<(&str, &str, &str)> {
        match self.entry(index)? {
            CPInfo::ConstantMethodRef {
                class_index,
                name_and_type_index,
            }
            | CPInfo::ConstantInterfaceMethodRef {
                class_index,
                name_and_type_index,
            } => {
                let owner = self.class_name(*class_index)?;
                let (name, descriptor) =
                    self.name_and_type(*name_and_type_index)?;
                Ok((owner, name, descriptor))
            }
            other => Err(Self::mismatch(index, "Methodref", other)),
        }
    }

    fn mismatch(index: u16, expected: &str, actual: &CPInfo) -> Error {
        Error::tag(format!(
            "constant pool index {index}: expected {expected}, found tag {} ({actual:?})",
            actual.tag()
        ))
    }
}

/// A field as decoded from the class file. Names are resolved out of the
/// pool up front so the runtime never chases indices for them.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
    pub constant_value: Option<u16>,
}

impl FieldInfo {
    pub const fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }
}

/// A method as decoded from the class file. Abstract and native methods
/// carry no code.
#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
    pub code: Vec<u8>,
    pub max_stack: u16,
    pub max_locals: u16,
}

impl MethodInfo {
    pub const fn is_native(&self) -> bool {
        self.access_flags & ACC_NATIVE != 0
    }

    pub const fn is_abstract(&self) -> bool {
        self.access_flags & ACC_ABSTRACT != 0
    }
}

/// `ClassFile` represents a decoded Java class file.
#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
}

/// `JVMParser` namespaces functions that handle parsing of Java class files.
#[derive(Debug)]
pub struct JVMParser;

impl JVMParser {
    /// Parse a preloaded Java class file.
    pub fn parse(class_file_bytes: &[u8]) -> Result<ClassFile> {
        let mut buffer = Cursor::new(class_file_bytes);
        let magic = buffer.read_u32::<BigEndian>()?;
        if magic != JVM_CLASS_FILE_MAGIC {
            return Err(Error::parse(format!(
                "invalid class file magic {magic:#010x}"
            )));
        }
        let minor_version = buffer.read_u16::<BigEndian>()?;
        let major_version = buffer.read_u16::<BigEndian>()?;

        let constant_pool = parse_constant_pool(&mut buffer)?;

        let access_flags = buffer.read_u16::<BigEndian>()?;
        let this_class = buffer.read_u16::<BigEndian>()?;
        let super_class = buffer.read_u16::<BigEndian>()?;

        let interfaces_count = buffer.read_u16::<BigEndian>()?;
        let mut interfaces = Vec::with_capacity(interfaces_count as usize);
        for _ in 0..interfaces_count {
            interfaces.push(buffer.read_u16::<BigEndian>()?);
        }

        let fields = parse_fields(&mut buffer, &constant_pool)?;
        let methods = parse_methods(&mut buffer, &constant_pool)?;
        // Class-level attributes (SourceFile and friends) are not
        // interpreted; skip them by length.
        skip_attributes(&mut buffer)?;

        Ok(ClassFile {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
        })
    }
}

fn parse_constant_pool(buffer: &mut Cursor<&[u8]>) -> Result<ConstantPool> {
    let constant_pool_count = buffer.read_u16::<BigEndian>()?;
    let mut entries = vec![CPInfo::Unspecified; constant_pool_count as usize];
    // The first entry in the pool is at index 1 according to the format;
    // Long and Double entries burn the slot after them.
    let mut ii = 1;
    while ii < constant_pool_count as usize {
        let tag = buffer.read_u8()?;
        match ConstantKind::from(tag) {
            ConstantKind::Class => {
                entries[ii] = CPInfo::ConstantClass {
                    name_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantKind::FieldRef => {
                entries[ii] = CPInfo::ConstantFieldRef {
                    class_index: buffer.read_u16::<BigEndian>()?,
                    name_and_type_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantKind::MethodRef => {
                entries[ii] = CPInfo::ConstantMethodRef {
                    class_index: buffer.read_u16::<BigEndian>()?,
                    name_and_type_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantKind::InterfaceMethodRef => {
                entries[ii] = CPInfo::ConstantInterfaceMethodRef {
                    class_index: buffer.read_u16::<BigEndian>()?,
                    name_and_type_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantKind::String => {
                entries[ii] = CPInfo::ConstantString {
                    string_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantKind::Integer => {
                entries[ii] = CPInfo::ConstantInteger {
                    value: buffer.read_i32::<BigEndian>()?,
                };
            }
            ConstantKind::Float => {
                entries[ii] = CPInfo::ConstantFloat {
                    value: buffer.read_f32::<BigEndian>()?,
                };
            }
            ConstantKind::Long => {
                entries[ii] = CPInfo::ConstantLong {
                    value: buffer.read_i64::<BigEndian>()?,
                };
                ii += 1;
            }
            ConstantKind::Double => {
                entries[ii] = CPInfo::ConstantDouble {
                    value: buffer.read_f64::<BigEndian>()?,
                };
                ii += 1;
            }
            ConstantKind::NameAndType => {
                entries[ii] = CPInfo::ConstantNameAndType {
                    name_index: buffer.read_u16::<BigEndian>()?,
                    descriptor_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantKind::Utf8 => {
                let length = buffer.read_u16::<BigEndian>()?;
                let mut buf = vec![0u8; length as usize];
                buffer.read_exact(&mut buf)?;
                entries[ii] = CPInfo::ConstantUtf8 {
                    bytes: String::from_utf8(buf).map_err(|e| {
                        Error::parse(format!(
                            "constant pool entry {ii} is not valid UTF-8: {e}"
                        ))
                    })?,
                };
            }
            ConstantKind::MethodHandle => {
                entries[ii] = CPInfo::ConstantMethodHandle {
                    reference_kind: buffer.read_u8()?,
                    reference_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantKind::MethodType => {
                entries[ii] = CPInfo::ConstantMethodType {
                    descriptor_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantKind::InvokeDynamic => {
                entries[ii] = CPInfo::ConstantInvokeDynamic {
                    bootstrap_method_attr_index: buffer
                        .read_u16::<BigEndian>()?,
                    name_and_type_index: buffer.read_u16::<BigEndian>()?,
                };
            }
            ConstantKind::Unspecified => {
                return Err(Error::parse(format!(
                    "unknown constant pool tag {tag} at index {ii}"
                )));
            }
        }
        ii += 1;
    }
    Ok(ConstantPool::new(entries))
}

fn parse_fields(
    buffer: &mut Cursor<&[u8]>,
    constant_pool: &ConstantPool,
) -> Result<Vec<FieldInfo>> {
    let fields_count = buffer.read_u16::<BigEndian>()?;
    let mut fields = Vec::with_capacity(fields_count as usize);
    for _ in 0..fields_count {
        let access_flags = buffer.read_u16::<BigEndian>()?;
        let name_index = buffer.read_u16::<BigEndian>()?;
        let descriptor_index = buffer.read_u16::<BigEndian>()?;
        let name = constant_pool.utf8_at(name_index)?.to_owned();
        let descriptor = constant_pool.utf8_at(descriptor_index)?.to_owned();

        let mut constant_value = None;
        let attribute_count = buffer.read_u16::<BigEndian>()?;
        for _ in 0..attribute_count {
            let attr_name_index = buffer.read_u16::<BigEndian>()?;
            let attr_length = buffer.read_u32::<BigEndian>()?;
            if constant_pool.utf8_at(attr_name_index)? == "ConstantValue" {
                constant_value = Some(buffer.read_u16::<BigEndian>()?);
            } else {
                buffer.seek(SeekFrom::Current(i64::from(attr_length)))?;
            }
        }
        fields.push(FieldInfo {
            access_flags,
            name,
            descriptor,
            constant_value,
        });
    }
    Ok(fields)
}

fn parse_methods(
    buffer: &mut Cursor<&[u8]>,
    constant_pool: &ConstantPool,
) -> Result<Vec<MethodInfo>> {
    let methods_count = buffer.read_u16::<BigEndian>()?;
    let mut methods = Vec::with_capacity(methods_count as usize);
    for _ in 0..methods_count {
        let access_flags = buffer.read_u16::<BigEndian>()?;
        let name_index = buffer.read_u16::<BigEndian>()?;
        let descriptor_index = buffer.read_u16::<BigEndian>()?;
        let name = constant_pool.utf8_at(name_index)?.to_owned();
        let descriptor = constant_pool.utf8_at(descriptor_index)?.to_owned();

        let mut code_attr: Option<(u16, u16, Vec<u8>)> = None;
        let attribute_count = buffer.read_u16::<BigEndian>()?;
        for _ in 0..attribute_count {
            let attr_name_index = buffer.read_u16::<BigEndian>()?;
            let attr_length = buffer.read_u32::<BigEndian>()?;
            if constant_pool.utf8_at(attr_name_index)? == "Code" {
                code_attr = Some(parse_code_attribute(buffer)?);
            } else {
                buffer.seek(SeekFrom::Current(i64::from(attr_length)))?;
            }
        }

        let (max_stack, max_locals, code) = match code_attr {
            Some(parts) => parts,
            None if access_flags & (ACC_NATIVE | ACC_ABSTRACT) != 0 => {
                (0, 0, Vec::new())
            }
            None => {
                return Err(Error::parse(format!(
                    "method {name}{descriptor} has no Code attribute"
                )));
            }
        };

        methods.push(MethodInfo {
            access_flags,
            name,
            descriptor,
            code,
            max_stack,
            max_locals,
        });
    }
    Ok(methods)
}

fn parse_code_attribute(
    buffer: &mut Cursor<&[u8]>,
) -> Result<(u16, u16, Vec<u8>)> {
    let max_stack = buffer.read_u16::<BigEndian>()?;
    let max_locals = buffer.read_u16::<BigEndian>()?;
    let code_length = buffer.read_u32::<BigEndian>()?;
    let mut code = vec![0u8; code_length as usize];
    buffer.read_exact(&mut code)?;
    // Exception tables are not interpreted in this core.
    let exception_table_length = buffer.read_u16::<BigEndian>()?;
    buffer.seek(SeekFrom::Current(i64::from(exception_table_length) * 8))?;
    // Nested attributes (LineNumberTable, StackMapTable, ...).
    skip_attributes(buffer)?;
    Ok((max_stack, max_locals, code))
}

fn skip_attributes(buffer: &mut Cursor<&[u8]>) -> Result<()> {
    let attribute_count = buffer.read_u16::<BigEndian>()?;
    for _ in 0..attribute_count {
        let _name_index = buffer.read_u16::<BigEndian>()?;
        let attr_length = buffer.read_u32::<BigEndian>()?;
        buffer.seek(SeekFrom::Current(i64::from(attr_length)))?;
    }
    Ok(())
}

/// Helper function to read a class file into a buffer.
pub fn read_class_file(fp: &Path) -> Result<Vec<u8>> {
    Ok(std::fs::read(fp)?)
}

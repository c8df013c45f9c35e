//! Constant pool model with one-based indexing and two-slot wide entries.

use super::ClassFileError;

pub const TAG_UTF8: u8 = 1;
pub const TAG_INTEGER: u8 = 3;
pub const TAG_FLOAT: u8 = 4;
pub const TAG_LONG: u8 = 5;
pub const TAG_DOUBLE: u8 = 6;
pub const TAG_CLASS: u8 = 7;
pub const TAG_STRING: u8 = 8;
pub const TAG_FIELDREF: u8 = 9;
pub const TAG_METHODREF: u8 = 10;
pub const TAG_INTERFACE_METHODREF: u8 = 11;
pub const TAG_NAME_AND_TYPE: u8 = 12;

/// One constant pool entry. Utf8 keeps its raw modified-UTF-8 bytes and
/// float/double keep raw bit patterns so emission is byte-identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constant {
    Utf8(Vec<u8>),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    String(u16),
    FieldRef { class: u16, name_and_type: u16 },
    MethodRef { class: u16, name_and_type: u16 },
    InterfaceMethodRef { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
}

impl Constant {
    /// True for entries that occupy two pool slots.
    pub fn is_wide(&self) -> bool {
        matches!(self, Constant::Long(_) | Constant::Double(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Entry(Constant),
    /// Phantom slot following a long or double entry.
    Continuation,
}

/// The constant pool. Entries are addressed by their one-based class-file
/// index; appends never repack existing slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstPool {
    slots: Vec<Slot>,
}

impl ConstPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `constant_pool_count` value for emission (slot count + 1).
    pub fn count(&self) -> u16 {
        self.slots.len() as u16 + 1
    }

    /// Append an entry, returning its one-based index.
    pub fn push(&mut self, constant: Constant) -> u16 {
        let index = self.count();
        let wide = constant.is_wide();
        self.slots.push(Slot::Entry(constant));
        if wide {
            self.slots.push(Slot::Continuation);
        }
        index
    }

    pub fn get(&self, index: u16) -> Option<&Constant> {
        match self.slots.get(index.checked_sub(1)? as usize)? {
            Slot::Entry(constant) => Some(constant),
            Slot::Continuation => None,
        }
    }

    pub fn get_mut(&mut self, index: u16) -> Option<&mut Constant> {
        match self.slots.get_mut(index.checked_sub(1)? as usize)? {
            Slot::Entry(constant) => Some(constant),
            Slot::Continuation => None,
        }
    }

    /// Iterate `(index, constant)` over real entries, skipping phantom slots.
    pub fn entries(&self) -> impl Iterator<Item = (u16, &Constant)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Entry(constant) => Some((i as u16 + 1, constant)),
            Slot::Continuation => None,
        })
    }

    /// Resolve a Utf8 entry as a string, if it is valid UTF-8.
    pub fn utf8(&self, index: u16) -> Option<&str> {
        match self.get(index)? {
            Constant::Utf8(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// Resolve the binary name behind a Class entry.
    pub fn class_name(&self, index: u16) -> Option<&str> {
        match self.get(index)? {
            Constant::Class(utf8) => self.utf8(*utf8),
            _ => None,
        }
    }

    /// Resolve the member name behind a field/method ref entry.
    pub fn member_name(&self, index: u16) -> Option<&str> {
        let name_and_type = match self.get(index)? {
            Constant::FieldRef { name_and_type, .. }
            | Constant::MethodRef { name_and_type, .. }
            | Constant::InterfaceMethodRef { name_and_type, .. } => *name_and_type,
            _ => return None,
        };
        match self.get(name_and_type)? {
            Constant::NameAndType { name, .. } => self.utf8(*name),
            _ => None,
        }
    }

    pub(crate) fn parse(reader: &mut super::codec::Reader<'_>) -> Result<Self, ClassFileError> {
        let count = reader.u16()?;
        let mut pool = ConstPool::new();
        while pool.count() < count {
            let tag = reader.u8()?;
            let constant = match tag {
                TAG_UTF8 => {
                    let len = reader.u16()? as usize;
                    Constant::Utf8(reader.bytes(len)?.to_vec())
                }
                TAG_INTEGER => Constant::Integer(reader.u32()? as i32),
                TAG_FLOAT => Constant::Float(reader.u32()?),
                TAG_LONG => Constant::Long(((reader.u32()? as u64) << 32 | reader.u32()? as u64) as i64),
                TAG_DOUBLE => Constant::Double((reader.u32()? as u64) << 32 | reader.u32()? as u64),
                TAG_CLASS => Constant::Class(reader.u16()?),
                TAG_STRING => Constant::String(reader.u16()?),
                TAG_FIELDREF => Constant::FieldRef {
                    class: reader.u16()?,
                    name_and_type: reader.u16()?,
                },
                TAG_METHODREF => Constant::MethodRef {
                    class: reader.u16()?,
                    name_and_type: reader.u16()?,
                },
                TAG_INTERFACE_METHODREF => Constant::InterfaceMethodRef {
                    class: reader.u16()?,
                    name_and_type: reader.u16()?,
                },
                TAG_NAME_AND_TYPE => Constant::NameAndType {
                    name: reader.u16()?,
                    descriptor: reader.u16()?,
                },
                other => return Err(ClassFileError::UnknownPoolTag { tag: other }),
            };
            pool.push(constant);
        }
        Ok(pool)
    }

    pub(crate) fn emit(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.count().to_be_bytes());
        for (_, constant) in self.entries() {
            match constant {
                Constant::Utf8(bytes) => {
                    out.push(TAG_UTF8);
                    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                    out.extend_from_slice(bytes);
                }
                Constant::Integer(value) => {
                    out.push(TAG_INTEGER);
                    out.extend_from_slice(&value.to_be_bytes());
                }
                Constant::Float(bits) => {
                    out.push(TAG_FLOAT);
                    out.extend_from_slice(&bits.to_be_bytes());
                }
                Constant::Long(value) => {
                    out.push(TAG_LONG);
                    out.extend_from_slice(&value.to_be_bytes());
                }
                Constant::Double(bits) => {
                    out.push(TAG_DOUBLE);
                    out.extend_from_slice(&bits.to_be_bytes());
                }
                Constant::Class(utf8) => {
                    out.push(TAG_CLASS);
                    out.extend_from_slice(&utf8.to_be_bytes());
                }
                Constant::String(utf8) => {
                    out.push(TAG_STRING);
                    out.extend_from_slice(&utf8.to_be_bytes());
                }
                Constant::FieldRef { class, name_and_type } => {
                    out.push(TAG_FIELDREF);
                    out.extend_from_slice(&class.to_be_bytes());
                    out.extend_from_slice(&name_and_type.to_be_bytes());
                }
                Constant::MethodRef { class, name_and_type } => {
                    out.push(TAG_METHODREF);
                    out.extend_from_slice(&class.to_be_bytes());
                    out.extend_from_slice(&name_and_type.to_be_bytes());
                }
                Constant::InterfaceMethodRef { class, name_and_type } => {
                    out.push(TAG_INTERFACE_METHODREF);
                    out.extend_from_slice(&class.to_be_bytes());
                    out.extend_from_slice(&name_and_type.to_be_bytes());
                }
                Constant::NameAndType { name, descriptor } => {
                    out.push(TAG_NAME_AND_TYPE);
                    out.extend_from_slice(&name.to_be_bytes());
                    out.extend_from_slice(&descriptor.to_be_bytes());
                }
            }
        }
    }

    /// Convenience for building pools: intern a UTF-8 string, reusing an
    /// existing entry when present.
    pub fn utf8_index(&mut self, text: &str) -> u16 {
        for (index, constant) in self.entries() {
            if let Constant::Utf8(bytes) = constant {
                if bytes.as_slice() == text.as_bytes() {
                    return index;
                }
            }
        }
        self.push(Constant::Utf8(text.as_bytes().to_vec()))
    }
}

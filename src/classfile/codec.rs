//! Binary parse and emit for the class-file format.

use super::pool::ConstPool;
use super::{
    ClassFileError, ClassImage, CodeAttr, ExceptionEntry, FieldInfo, MethodAttr, MethodInfo,
    RawAttribute,
};

const MAGIC: u32 = 0xCAFE_BABE;

/// Big-endian cursor over the input bytes.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, at: 0 }
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ClassFileError> {
        let value = *self
            .bytes
            .get(self.at)
            .ok_or(ClassFileError::Truncated { at: self.at })?;
        self.at += 1;
        Ok(value)
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ClassFileError> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ClassFileError> {
        Ok(u32::from_be_bytes([
            self.u8()?,
            self.u8()?,
            self.u8()?,
            self.u8()?,
        ]))
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], ClassFileError> {
        let end = self
            .at
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(ClassFileError::Truncated { at: self.at })?;
        let slice = &self.bytes[self.at..end];
        self.at = end;
        Ok(slice)
    }

    fn done(&self) -> bool {
        self.at == self.bytes.len()
    }
}

fn parse_raw_attribute(reader: &mut Reader<'_>) -> Result<RawAttribute, ClassFileError> {
    let name_index = reader.u16()?;
    let len = reader.u32()? as usize;
    Ok(RawAttribute {
        name_index,
        data: reader.bytes(len)?.to_vec(),
    })
}

fn parse_raw_attributes(reader: &mut Reader<'_>) -> Result<Vec<RawAttribute>, ClassFileError> {
    let count = reader.u16()? as usize;
    let mut attributes = Vec::with_capacity(count);
    for _ in 0..count {
        attributes.push(parse_raw_attribute(reader)?);
    }
    Ok(attributes)
}

fn parse_code(name_index: u16, data: &[u8]) -> Result<CodeAttr, ClassFileError> {
    let mut reader = Reader::new(data);
    let max_stack = reader.u16()?;
    let max_locals = reader.u16()?;
    let code_len = reader.u32()? as usize;
    let code = reader.bytes(code_len)?.to_vec();
    let exception_count = reader.u16()? as usize;
    let mut exceptions = Vec::with_capacity(exception_count);
    for _ in 0..exception_count {
        exceptions.push(ExceptionEntry {
            start_pc: reader.u16()?,
            end_pc: reader.u16()?,
            handler_pc: reader.u16()?,
            catch_type: reader.u16()?,
        });
    }
    let attributes = parse_raw_attributes(&mut reader)?;
    if !reader.done() {
        return Err(ClassFileError::TrailingBytes);
    }
    Ok(CodeAttr {
        name_index,
        max_stack,
        max_locals,
        code,
        exceptions,
        attributes,
    })
}

fn parse_method(reader: &mut Reader<'_>, pool: &ConstPool) -> Result<MethodInfo, ClassFileError> {
    let access = reader.u16()?;
    let name_index = reader.u16()?;
    let descriptor_index = reader.u16()?;
    let count = reader.u16()? as usize;
    let mut attributes = Vec::with_capacity(count);
    for _ in 0..count {
        let raw = parse_raw_attribute(reader)?;
        if pool.utf8(raw.name_index) == Some("Code") {
            attributes.push(MethodAttr::Code(parse_code(raw.name_index, &raw.data)?));
        } else {
            attributes.push(MethodAttr::Raw(raw));
        }
    }
    Ok(MethodInfo {
        access,
        name_index,
        descriptor_index,
        attributes,
    })
}

/// Parse a class file. Inputs using pool tags outside the canonical set are
/// rejected rather than round-tripped unfaithfully.
pub fn parse(bytes: &[u8]) -> Result<ClassImage, ClassFileError> {
    let mut reader = Reader::new(bytes);
    if reader.u32()? != MAGIC {
        return Err(ClassFileError::BadMagic);
    }
    let minor = reader.u16()?;
    let major = reader.u16()?;
    let pool = ConstPool::parse(&mut reader)?;
    let access = reader.u16()?;
    let this_class = reader.u16()?;
    let super_class = reader.u16()?;

    let interface_count = reader.u16()? as usize;
    let mut interfaces = Vec::with_capacity(interface_count);
    for _ in 0..interface_count {
        interfaces.push(reader.u16()?);
    }

    let field_count = reader.u16()? as usize;
    let mut fields = Vec::with_capacity(field_count);
    for _ in 0..field_count {
        fields.push(FieldInfo {
            access: reader.u16()?,
            name_index: reader.u16()?,
            descriptor_index: reader.u16()?,
            attributes: parse_raw_attributes(&mut reader)?,
        });
    }

    let method_count = reader.u16()? as usize;
    let mut methods = Vec::with_capacity(method_count);
    for _ in 0..method_count {
        methods.push(parse_method(&mut reader, &pool)?);
    }

    let attributes = parse_raw_attributes(&mut reader)?;
    if !reader.done() {
        return Err(ClassFileError::TrailingBytes);
    }

    Ok(ClassImage {
        minor,
        major,
        pool,
        access,
        this_class,
        super_class,
        interfaces,
        fields,
        methods,
        attributes,
    })
}

fn emit_raw_attribute(attr: &RawAttribute, out: &mut Vec<u8>) {
    out.extend_from_slice(&attr.name_index.to_be_bytes());
    out.extend_from_slice(&(attr.data.len() as u32).to_be_bytes());
    out.extend_from_slice(&attr.data);
}

fn emit_raw_attributes(attrs: &[RawAttribute], out: &mut Vec<u8>) {
    out.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
    for attr in attrs {
        emit_raw_attribute(attr, out);
    }
}

fn emit_code(code: &CodeAttr, out: &mut Vec<u8>) {
    out.extend_from_slice(&code.name_index.to_be_bytes());
    out.extend_from_slice(&code.payload_len().to_be_bytes());
    out.extend_from_slice(&code.max_stack.to_be_bytes());
    out.extend_from_slice(&code.max_locals.to_be_bytes());
    out.extend_from_slice(&(code.code.len() as u32).to_be_bytes());
    out.extend_from_slice(&code.code);
    out.extend_from_slice(&(code.exceptions.len() as u16).to_be_bytes());
    for entry in &code.exceptions {
        out.extend_from_slice(&entry.start_pc.to_be_bytes());
        out.extend_from_slice(&entry.end_pc.to_be_bytes());
        out.extend_from_slice(&entry.handler_pc.to_be_bytes());
        out.extend_from_slice(&entry.catch_type.to_be_bytes());
    }
    emit_raw_attributes(&code.attributes, out);
}

/// Emit a class image back to bytes.
pub fn emit(image: &ClassImage) -> Vec<u8> {
    let mut out = Vec::with_capacity(1024);
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.extend_from_slice(&image.minor.to_be_bytes());
    out.extend_from_slice(&image.major.to_be_bytes());
    image.pool.emit(&mut out);
    out.extend_from_slice(&image.access.to_be_bytes());
    out.extend_from_slice(&image.this_class.to_be_bytes());
    out.extend_from_slice(&image.super_class.to_be_bytes());
    out.extend_from_slice(&(image.interfaces.len() as u16).to_be_bytes());
    for interface in &image.interfaces {
        out.extend_from_slice(&interface.to_be_bytes());
    }
    out.extend_from_slice(&(image.fields.len() as u16).to_be_bytes());
    for field in &image.fields {
        out.extend_from_slice(&field.access.to_be_bytes());
        out.extend_from_slice(&field.name_index.to_be_bytes());
        out.extend_from_slice(&field.descriptor_index.to_be_bytes());
        emit_raw_attributes(&field.attributes, &mut out);
    }
    out.extend_from_slice(&(image.methods.len() as u16).to_be_bytes());
    for method in &image.methods {
        out.extend_from_slice(&method.access.to_be_bytes());
        out.extend_from_slice(&method.name_index.to_be_bytes());
        out.extend_from_slice(&method.descriptor_index.to_be_bytes());
        out.extend_from_slice(&(method.attributes.len() as u16).to_be_bytes());
        for attr in &method.attributes {
            match attr {
                MethodAttr::Code(code) => emit_code(code, &mut out),
                MethodAttr::Raw(raw) => emit_raw_attribute(raw, &mut out),
            }
        }
    }
    emit_raw_attributes(&image.attributes, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::super::opcode;
    use super::super::pool::Constant;
    use super::*;
    use proptest::prelude::*;

    fn sample_image() -> ClassImage {
        let mut pool = ConstPool::new();
        let this_name = pool.utf8_index("demo/Sample");
        let super_name = pool.utf8_index("java/lang/Object");
        let this_class = pool.push(Constant::Class(this_name));
        let super_class = pool.push(Constant::Class(super_name));
        let code_name = pool.utf8_index("Code");
        let method_name = pool.utf8_index("answer");
        let descriptor = pool.utf8_index("()I");
        let line_table = pool.utf8_index("LineNumberTable");
        pool.push(Constant::Long(-1));
        pool.push(Constant::Double(1.5f64.to_bits()));

        let code = CodeAttr {
            name_index: code_name,
            max_stack: 1,
            max_locals: 1,
            code: vec![opcode::BIPUSH, 42, opcode::IRETURN],
            exceptions: vec![ExceptionEntry {
                start_pc: 0,
                end_pc: 3,
                handler_pc: 0,
                catch_type: 0,
            }],
            attributes: vec![RawAttribute {
                name_index: line_table,
                data: vec![0, 1, 0, 0, 0, 7],
            }],
        };

        ClassImage {
            minor: 0,
            major: 49,
            pool,
            access: 0x0021,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: vec![MethodInfo {
                access: 0x0001,
                name_index: method_name,
                descriptor_index: descriptor,
                attributes: vec![MethodAttr::Code(code)],
            }],
            attributes: Vec::new(),
        }
    }

    #[test]
    fn emit_parse_emit_is_identity() {
        let image = sample_image();
        let bytes = emit(&image);
        let reparsed = parse(&bytes).expect("emitted class should parse");
        assert_eq!(reparsed, image);
        assert_eq!(emit(&reparsed), bytes);
    }

    #[test]
    fn parse_rejects_bad_magic() {
        assert!(matches!(
            parse(&[0, 0, 0, 0]),
            Err(ClassFileError::BadMagic)
        ));
    }

    #[test]
    fn parse_rejects_trailing_garbage() {
        let mut bytes = emit(&sample_image());
        bytes.push(0);
        assert!(matches!(parse(&bytes), Err(ClassFileError::TrailingBytes)));
    }

    #[test]
    fn parse_rejects_unknown_pool_tag() {
        let mut bytes = emit(&sample_image());
        // First pool entry starts right after magic + versions + count.
        bytes[10] = 42;
        assert!(matches!(
            parse(&bytes),
            Err(ClassFileError::UnknownPoolTag { tag: 42 })
        ));
    }

    #[test]
    fn line_lookup_uses_greatest_start_pc() {
        let image = sample_image();
        let code = image.methods[0].code().expect("method should have code");
        assert_eq!(code.line_for_pc(&image.pool, 0), Some(7));
        assert_eq!(code.line_for_pc(&image.pool, 2), Some(7));
    }

    #[test]
    fn replace_insn_enforces_equal_length() {
        let mut image = sample_image();
        let code = image.methods[0]
            .code_mut()
            .expect("method should have code");
        let err = code
            .replace_insn(0, &[opcode::ICONST_0])
            .expect_err("length mismatch should be rejected");
        assert!(matches!(err, ClassFileError::LengthMismatch { pc: 0, .. }));
        code.replace_insn(0, &[opcode::BIPUSH, 43])
            .expect("equal-length replacement should apply");
        assert_eq!(code.code, vec![opcode::BIPUSH, 43, opcode::IRETURN]);
    }

    proptest! {
        #[test]
        fn roundtrip_preserves_arbitrary_pools(
            ints in proptest::collection::vec(any::<i32>(), 0..8),
            longs in proptest::collection::vec(any::<i64>(), 0..4),
            strings in proptest::collection::vec("[a-zA-Z0-9/$]{0,12}", 0..6),
        ) {
            let mut image = sample_image();
            for value in ints {
                image.pool.push(Constant::Integer(value));
            }
            for value in longs {
                image.pool.push(Constant::Long(value));
            }
            for text in strings {
                let utf8 = image.pool.push(Constant::Utf8(text.into_bytes()));
                image.pool.push(Constant::String(utf8));
            }
            let bytes = emit(&image);
            let reparsed = parse(&bytes).expect("emitted class should parse");
            prop_assert_eq!(emit(&reparsed), bytes);
        }
    }
}

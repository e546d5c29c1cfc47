//! Binary decoder: raw module bytes to the structured [`Module`].

#[cfg(test)]
mod test;

use crate::error::FormatError;
use crate::leb128;
use crate::module::{
    section_id, section_rank, BlockType, CustomPayload, CustomSection, ElementItems,
    ElementSegment, Export, ExportKind, FuncBody, FuncType, Global, Import, ImportKind,
    Instruction, Limits, MemArg, Module, NameSection, NameSubsection, Section, ValType, MAGIC,
    VERSION,
};

/// Cursor over a byte slice. `base` is the absolute offset of the slice
/// within the whole module, so errors report positions in the file.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8], base: usize) -> Reader<'a> {
        Reader { bytes, pos: 0, base }
    }

    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn is_done(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn truncated(&self) -> FormatError {
        FormatError::TruncatedSection {
            offset: self.offset(),
        }
    }

    pub fn u8(&mut self) -> Result<u8, FormatError> {
        let byte = *self.bytes.get(self.pos).ok_or_else(|| self.truncated())?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    pub fn u32(&mut self) -> Result<u32, FormatError> {
        let (value, len) = leb128::decode_u32(self.bytes, self.pos).map_err(|e| self.rebase(e))?;
        self.pos += len;
        Ok(value)
    }

    pub fn i32(&mut self) -> Result<i32, FormatError> {
        let (value, len) = leb128::decode_i32(self.bytes, self.pos).map_err(|e| self.rebase(e))?;
        self.pos += len;
        Ok(value)
    }

    pub fn slice(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        if len > self.remaining() {
            return Err(self.truncated());
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String, FormatError> {
        let len = self.u32()? as usize;
        let offset = self.offset();
        let bytes = self.slice(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FormatError::InvalidString { offset })
    }

    /// Sub-reader over the next `len` bytes, consuming them.
    pub fn sub(&mut self, len: usize) -> Result<Reader<'a>, FormatError> {
        let base = self.offset();
        let bytes = self.slice(len)?;
        Ok(Reader::new(bytes, base))
    }

    /// Byte position marker, for capturing raw operand bytes.
    fn mark(&self) -> usize {
        self.pos
    }

    fn since(&self, mark: usize) -> Vec<u8> {
        self.bytes[mark..self.pos].to_vec()
    }

    /// Consumes one LEB128-encoded value of at most `max_bytes` without
    /// interpreting it.
    fn skip_varint(&mut self, max_bytes: usize) -> Result<(), FormatError> {
        for _ in 0..max_bytes {
            if self.u8()? & 0x80 == 0 {
                return Ok(());
            }
        }
        Err(FormatError::MalformedVarint {
            offset: self.offset(),
        })
    }

    fn rebase(&self, error: FormatError) -> FormatError {
        match error {
            FormatError::MalformedVarint { offset } => FormatError::MalformedVarint {
                offset: offset + self.base,
            },
            other => other,
        }
    }
}

/// Decodes a whole module. Unknown section kinds are retained as opaque
/// blobs; sections the engine touches are decoded into structure.
pub fn parse(bytes: &[u8]) -> Result<Module, FormatError> {
    if bytes.len() < 4 || bytes[0..4] != MAGIC {
        return Err(FormatError::InvalidMagic);
    }
    if bytes.len() < 8 {
        return Err(FormatError::TruncatedSection { offset: 4 });
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }

    let mut reader = Reader::new(bytes, 0);
    reader.pos = 8;

    let mut module = Module::default();
    let mut last_rank = 0u8;
    while !reader.is_done() {
        let id = reader.u8()?;
        let declared_offset = reader.offset();
        let size = reader.u32()? as usize;
        if size > reader.remaining() {
            return Err(FormatError::TruncatedSection {
                offset: declared_offset,
            });
        }
        if let Some(rank) = section_rank(id) {
            if rank <= last_rank {
                return Err(FormatError::SectionOutOfOrder {
                    id,
                    offset: declared_offset,
                });
            }
            last_rank = rank;
        }
        let mut payload = reader.sub(size)?;
        let section = parse_section(id, &mut payload)?;
        if !payload.is_done() {
            return Err(FormatError::SectionSizeMismatch {
                offset: payload.offset(),
            });
        }
        log::debug!("parsed section id {id} ({size} bytes)");
        module.sections.push(section);
    }
    // Every declared function needs a body and vice versa; a mismatch
    // would desynchronize the Function/Code pairing downstream.
    let declared = module.defined_function_count();
    let bodies = module.code_section().map_or(0, |bodies| bodies.len() as u32);
    if declared != bodies {
        return Err(FormatError::FunctionCountMismatch { declared, bodies });
    }
    Ok(module)
}

fn parse_section(id: u8, r: &mut Reader) -> Result<Section, FormatError> {
    match id {
        section_id::CUSTOM => parse_custom(r),
        section_id::TYPE => parse_types(r).map(Section::Type),
        section_id::IMPORT => parse_imports(r).map(Section::Import),
        section_id::FUNCTION => {
            let count = r.u32()?;
            let mut funcs = Vec::with_capacity(count as usize);
            for _ in 0..count {
                funcs.push(r.u32()?);
            }
            Ok(Section::Function(funcs))
        }
        section_id::MEMORY => {
            let count = r.u32()?;
            let mut memories = Vec::with_capacity(count as usize);
            for _ in 0..count {
                memories.push(parse_limits(r)?);
            }
            Ok(Section::Memory(memories))
        }
        section_id::GLOBAL => parse_globals(r).map(Section::Global),
        section_id::EXPORT => parse_exports(r).map(Section::Export),
        section_id::START => r.u32().map(Section::Start),
        section_id::ELEMENT => parse_elements(r).map(Section::Element),
        section_id::CODE => parse_code(r).map(Section::Code),
        other => {
            let bytes = r.slice(r.remaining())?.to_vec();
            Ok(Section::Opaque { id: other, bytes })
        }
    }
}

fn parse_types(r: &mut Reader) -> Result<Vec<FuncType>, FormatError> {
    let count = r.u32()?;
    let mut types = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let offset = r.offset();
        if r.u8()? != 0x60 {
            return Err(FormatError::Unsupported {
                what: "type form",
                offset,
            });
        }
        let params = parse_valtypes(r)?;
        let results = parse_valtypes(r)?;
        types.push(FuncType { params, results });
    }
    Ok(types)
}

fn parse_valtypes(r: &mut Reader) -> Result<Vec<ValType>, FormatError> {
    let count = r.u32()?;
    let mut types = Vec::with_capacity(count as usize);
    for _ in 0..count {
        types.push(parse_valtype(r)?);
    }
    Ok(types)
}

fn parse_valtype(r: &mut Reader) -> Result<ValType, FormatError> {
    let offset = r.offset();
    let byte = r.u8()?;
    ValType::from_byte(byte).ok_or(FormatError::Unsupported {
        what: "value type",
        offset,
    })
}

fn parse_limits(r: &mut Reader) -> Result<Limits, FormatError> {
    let offset = r.offset();
    match r.u8()? {
        0x00 => Ok(Limits {
            min: r.u32()?,
            max: None,
            shared: false,
        }),
        0x01 => Ok(Limits {
            min: r.u32()?,
            max: Some(r.u32()?),
            shared: false,
        }),
        0x03 => Ok(Limits {
            min: r.u32()?,
            max: Some(r.u32()?),
            shared: true,
        }),
        _ => Err(FormatError::Unsupported {
            what: "limits flags",
            offset,
        }),
    }
}

fn parse_imports(r: &mut Reader) -> Result<Vec<Import>, FormatError> {
    let count = r.u32()?;
    let mut imports = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let module = r.string()?;
        let name = r.string()?;
        let offset = r.offset();
        let kind = match r.u8()? {
            0x00 => ImportKind::Func(r.u32()?),
            0x01 => ImportKind::Table {
                ref_type: r.u8()?,
                limits: parse_limits(r)?,
            },
            0x02 => ImportKind::Memory(parse_limits(r)?),
            0x03 => ImportKind::Global {
                val_type: r.u8()?,
                mutable: r.u8()? != 0,
            },
            _ => {
                return Err(FormatError::Unsupported {
                    what: "import kind",
                    offset,
                })
            }
        };
        imports.push(Import { module, name, kind });
    }
    Ok(imports)
}

fn parse_globals(r: &mut Reader) -> Result<Vec<Global>, FormatError> {
    let count = r.u32()?;
    let mut globals = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let val_type = r.u8()?;
        let mutable = r.u8()? != 0;
        let init = parse_expr(r)?;
        globals.push(Global {
            val_type,
            mutable,
            init,
        });
    }
    Ok(globals)
}

fn parse_exports(r: &mut Reader) -> Result<Vec<Export>, FormatError> {
    let count = r.u32()?;
    let mut exports = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = r.string()?;
        let offset = r.offset();
        let kind_byte = r.u8()?;
        let kind = ExportKind::from_byte(kind_byte).ok_or(FormatError::Unsupported {
            what: "export kind",
            offset,
        })?;
        let index = r.u32()?;
        exports.push(Export { name, kind, index });
    }
    Ok(exports)
}

fn parse_elements(r: &mut Reader) -> Result<Vec<ElementSegment>, FormatError> {
    let count = r.u32()?;
    let mut segments = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let offset = r.offset();
        let flags = r.u32()?;
        if flags > 7 {
            return Err(FormatError::Unsupported {
                what: "element segment flags",
                offset,
            });
        }
        let table_index = if flags & 0b011 == 0b010 {
            Some(r.u32()?)
        } else {
            None
        };
        let active = flags & 0b001 == 0;
        let offset_expr = if active { Some(parse_expr(r)?) } else { None };
        let kind = if flags != 0 && flags != 4 {
            Some(r.u8()?)
        } else {
            None
        };
        let items = if flags & 0b100 == 0 {
            let n = r.u32()?;
            let mut funcs = Vec::with_capacity(n as usize);
            for _ in 0..n {
                funcs.push(r.u32()?);
            }
            ElementItems::Functions(funcs)
        } else {
            let n = r.u32()?;
            let mut exprs = Vec::with_capacity(n as usize);
            for _ in 0..n {
                exprs.push(parse_expr(r)?);
            }
            ElementItems::Expressions(exprs)
        };
        segments.push(ElementSegment {
            flags,
            table_index,
            offset: offset_expr,
            kind,
            items,
        });
    }
    Ok(segments)
}

fn parse_code(r: &mut Reader) -> Result<Vec<FuncBody>, FormatError> {
    let count = r.u32()?;
    let mut bodies = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let size = r.u32()? as usize;
        let mut body = r.sub(size)?;
        let local_groups = body.u32()?;
        let mut locals = Vec::with_capacity(local_groups as usize);
        for _ in 0..local_groups {
            let n = body.u32()?;
            locals.push((n, parse_valtype(&mut body)?));
        }
        let instructions = parse_body_instructions(&mut body)?;
        if !body.is_done() {
            return Err(FormatError::BodySizeMismatch {
                offset: body.offset(),
            });
        }
        bodies.push(FuncBody {
            locals,
            instructions,
        });
    }
    Ok(bodies)
}

/// Reads instructions to the end of a function body, checking that block
/// nesting is balanced and the body closes with its own `end`.
fn parse_body_instructions(r: &mut Reader) -> Result<Vec<Instruction>, FormatError> {
    let mut instructions = Vec::new();
    let mut depth: u32 = 0;
    loop {
        let offset = r.offset();
        let instruction = parse_instruction(r)?;
        match instruction {
            Instruction::Block(_) | Instruction::Loop(_) | Instruction::If(_) => depth += 1,
            Instruction::End => {
                if depth == 0 {
                    instructions.push(instruction);
                    return Ok(instructions);
                }
                depth -= 1;
            }
            _ => {}
        }
        instructions.push(instruction);
        if r.is_done() {
            return Err(FormatError::BodySizeMismatch { offset });
        }
    }
}

/// Reads a constant expression (global initializer or element offset),
/// including its terminating `end`.
fn parse_expr(r: &mut Reader) -> Result<Vec<Instruction>, FormatError> {
    let mut instructions = Vec::new();
    let mut depth: u32 = 0;
    loop {
        let instruction = parse_instruction(r)?;
        match instruction {
            Instruction::Block(_) | Instruction::Loop(_) | Instruction::If(_) => depth += 1,
            Instruction::End => {
                if depth == 0 {
                    instructions.push(instruction);
                    return Ok(instructions);
                }
                depth -= 1;
            }
            _ => {}
        }
        instructions.push(instruction);
    }
}

fn parse_blocktype(r: &mut Reader) -> Result<BlockType, FormatError> {
    match r.peek_u8() {
        Some(0x40) | Some(0x7f) | Some(0x7e) | Some(0x7d) | Some(0x7c) | Some(0x7b)
        | Some(0x70) | Some(0x6f) => Ok(BlockType(vec![r.u8()?])),
        _ => {
            // Signed 33-bit type index, up to five bytes.
            let mark = r.mark();
            r.skip_varint(5)?;
            Ok(BlockType(r.since(mark)))
        }
    }
}

fn parse_memarg(r: &mut Reader) -> Result<MemArg, FormatError> {
    Ok(MemArg {
        align: r.u32()?,
        offset: r.u32()?,
    })
}

fn parse_instruction(r: &mut Reader) -> Result<Instruction, FormatError> {
    let offset = r.offset();
    let opcode = r.u8()?;
    let instruction = match opcode {
        0x00 => Instruction::Unreachable,
        0x02 => Instruction::Block(parse_blocktype(r)?),
        0x03 => Instruction::Loop(parse_blocktype(r)?),
        0x04 => Instruction::If(parse_blocktype(r)?),
        0x0b => Instruction::End,
        0x0f => Instruction::Return,
        0x10 => Instruction::Call(r.u32()?),
        0x20 => Instruction::LocalGet(r.u32()?),
        0x21 => Instruction::LocalSet(r.u32()?),
        0x22 => Instruction::LocalTee(r.u32()?),
        0x28 => Instruction::I32Load(parse_memarg(r)?),
        0x36 => Instruction::I32Store(parse_memarg(r)?),
        0x41 => Instruction::I32Const(r.i32()?),
        0x49 => Instruction::I32LtU,
        0x6a => Instruction::I32Add,
        0x6c => Instruction::I32Mul,
        0x70 => Instruction::I32RemU,
        0xd2 => Instruction::RefFunc(r.u32()?),
        other => {
            let mark = r.mark();
            skip_operands(r, other, offset)?;
            Instruction::Other {
                opcode: other,
                operands: r.since(mark),
            }
        }
    };
    Ok(instruction)
}

/// Consumes the immediate operands of an opcode the engine does not
/// interpret, so the instruction can be carried as opaque bytes. Opcodes
/// whose operand shape is unknown here (vector, threads, exception
/// handling proposals) fail the parse instead of corrupting the stream.
fn skip_operands(r: &mut Reader, opcode: u8, offset: usize) -> Result<(), FormatError> {
    match opcode {
        // No immediates: nop, else, drop, select, numeric ops, ref.is_null.
        0x01 | 0x05 | 0x1a | 0x1b | 0x45..=0xc4 | 0xd1 => {}
        // One index: br, br_if, global/local/table accessors, catch-alls.
        0x0c | 0x0d | 0x23 | 0x24 | 0x25 | 0x26 => {
            r.skip_varint(5)?;
        }
        // br_table: vector of labels plus default label.
        0x0e => {
            let n = r.u32()?;
            for _ in 0..=n {
                r.skip_varint(5)?;
            }
        }
        // call_indirect: type index, table index.
        0x11 => {
            r.skip_varint(5)?;
            r.skip_varint(5)?;
        }
        // select with explicit types.
        0x1c => {
            let n = r.u32()?;
            r.slice(n as usize)?;
        }
        // Remaining loads/stores: align + offset.
        0x29..=0x35 | 0x37..=0x3e => {
            r.skip_varint(5)?;
            r.skip_varint(5)?;
        }
        // memory.size / memory.grow: memory index byte.
        0x3f | 0x40 => {
            r.u8()?;
        }
        // i64.const: signed 64-bit varint.
        0x42 => {
            r.skip_varint(10)?;
        }
        0x43 => {
            r.slice(4)?;
        }
        0x44 => {
            r.slice(8)?;
        }
        // ref.null: heap type byte.
        0xd0 => {
            r.u8()?;
        }
        0xfc => skip_misc_operands(r, offset)?,
        other => {
            return Err(FormatError::UnsupportedOpcode {
                opcode: other,
                offset,
            })
        }
    }
    Ok(())
}

/// Immediates of the 0xFC-prefixed miscellaneous opcodes.
fn skip_misc_operands(r: &mut Reader, offset: usize) -> Result<(), FormatError> {
    let sub_opcode = r.u32()?;
    match sub_opcode {
        // Saturating truncations.
        0..=7 => {}
        // memory.init: data index + memory index byte.
        8 => {
            r.skip_varint(5)?;
            r.u8()?;
        }
        // data.drop, elem.drop.
        9 | 13 => {
            r.skip_varint(5)?;
        }
        // memory.copy: two memory index bytes.
        10 => {
            r.slice(2)?;
        }
        // memory.fill: memory index byte.
        11 => {
            r.u8()?;
        }
        // table.init, table.copy: two indices.
        12 | 14 => {
            r.skip_varint(5)?;
            r.skip_varint(5)?;
        }
        // table.grow, table.size, table.fill.
        15..=17 => {
            r.skip_varint(5)?;
        }
        _ => {
            return Err(FormatError::UnsupportedOpcode {
                opcode: 0xfc,
                offset,
            })
        }
    }
    Ok(())
}

fn parse_custom(r: &mut Reader) -> Result<Section, FormatError> {
    let name = r.string()?;
    let payload = if name == "name" {
        match parse_name_section(r) {
            Ok(names) => CustomPayload::Name(names),
            Err(error) => {
                return Err(FormatError::MalformedNameSection {
                    reason: error.to_string(),
                })
            }
        }
    } else {
        CustomPayload::Raw(r.slice(r.remaining())?.to_vec())
    };
    Ok(Section::Custom(CustomSection { name, payload }))
}

fn parse_name_section(r: &mut Reader) -> Result<NameSection, FormatError> {
    let mut subsections = Vec::new();
    while !r.is_done() {
        let id = r.u8()?;
        let size = r.u32()? as usize;
        let mut payload = r.sub(size)?;
        let subsection = match id {
            1 => {
                let count = payload.u32()?;
                let mut names = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let index = payload.u32()?;
                    let name = payload.string()?;
                    names.push((index, name));
                }
                NameSubsection::Functions(names)
            }
            2 => {
                let count = payload.u32()?;
                let mut functions = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let func_index = payload.u32()?;
                    let inner_count = payload.u32()?;
                    let mut locals = Vec::with_capacity(inner_count as usize);
                    for _ in 0..inner_count {
                        let local_index = payload.u32()?;
                        let name = payload.string()?;
                        locals.push((local_index, name));
                    }
                    functions.push((func_index, locals));
                }
                NameSubsection::Locals(functions)
            }
            other => NameSubsection::Raw {
                id: other,
                bytes: payload.slice(payload.remaining())?.to_vec(),
            },
        };
        if !payload.is_done() {
            return Err(FormatError::SectionSizeMismatch {
                offset: payload.offset(),
            });
        }
        subsections.push(subsection);
    }
    Ok(NameSection { subsections })
}

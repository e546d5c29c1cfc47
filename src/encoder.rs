//! Binary encoder: the structured [`Module`] back to raw bytes.
//!
//! Every section and function body length prefix is recomputed from the
//! encoded payload; nothing carried over from parsing is trusted. Decoded
//! varints re-encode in minimal form, opaque bytes are emitted verbatim,
//! so serializing an unmodified module reproduces its original bytes
//! whenever those were minimally encoded to begin with.


use crate::leb128;
use crate::module::{
    CustomPayload, CustomSection, ElementItems, ElementSegment, Export, FuncBody, FuncType, Global,
    Import, ImportKind, Instruction, Limits, MemArg, Module, NameSection, NameSubsection, Section,
    ValType, MAGIC, VERSION,
};

pub fn serialize(module: &Module) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    for section in &module.sections {
        let payload = section_payload(section);
        out.push(section.id());
        leb128::encode_u32(payload.len() as u32, &mut out);
        out.extend_from_slice(&payload);
    }
    out
}

fn section_payload(section: &Section) -> Vec<u8> {
    let mut out = Vec::new();
    match section {
        Section::Type(types) => {
            leb128::encode_u32(types.len() as u32, &mut out);
            for ty in types {
                write_func_type(ty, &mut out);
            }
        }
        Section::Import(imports) => {
            leb128::encode_u32(imports.len() as u32, &mut out);
            for import in imports {
                write_import(import, &mut out);
            }
        }
        Section::Function(funcs) => {
            leb128::encode_u32(funcs.len() as u32, &mut out);
            for &type_index in funcs {
                leb128::encode_u32(type_index, &mut out);
            }
        }
        Section::Memory(memories) => {
            leb128::encode_u32(memories.len() as u32, &mut out);
            for limits in memories {
                write_limits(limits, &mut out);
            }
        }
        Section::Global(globals) => {
            leb128::encode_u32(globals.len() as u32, &mut out);
            for global in globals {
                write_global(global, &mut out);
            }
        }
        Section::Export(exports) => {
            leb128::encode_u32(exports.len() as u32, &mut out);
            for export in exports {
                write_export(export, &mut out);
            }
        }
        Section::Start(func_index) => {
            leb128::encode_u32(*func_index, &mut out);
        }
        Section::Element(segments) => {
            leb128::encode_u32(segments.len() as u32, &mut out);
            for segment in segments {
                write_element(segment, &mut out);
            }
        }
        Section::Code(bodies) => {
            leb128::encode_u32(bodies.len() as u32, &mut out);
            for body in bodies {
                write_body(body, &mut out);
            }
        }
        Section::Custom(custom) => {
            write_custom(custom, &mut out);
        }
        Section::Opaque { bytes, .. } => {
            out.extend_from_slice(bytes);
        }
    }
    out
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    leb128::encode_u32(s.len() as u32, out);
    out.extend_from_slice(s.as_bytes());
}

fn write_func_type(ty: &FuncType, out: &mut Vec<u8>) {
    out.push(0x60);
    write_valtypes(&ty.params, out);
    write_valtypes(&ty.results, out);
}

fn write_valtypes(types: &[ValType], out: &mut Vec<u8>) {
    leb128::encode_u32(types.len() as u32, out);
    for ty in types {
        out.push(ty.to_byte());
    }
}

fn write_limits(limits: &Limits, out: &mut Vec<u8>) {
    match (limits.max, limits.shared) {
        (None, _) => {
            out.push(0x00);
            leb128::encode_u32(limits.min, out);
        }
        (Some(max), false) => {
            out.push(0x01);
            leb128::encode_u32(limits.min, out);
            leb128::encode_u32(max, out);
        }
        (Some(max), true) => {
            out.push(0x03);
            leb128::encode_u32(limits.min, out);
            leb128::encode_u32(max, out);
        }
    }
}

fn write_import(import: &Import, out: &mut Vec<u8>) {
    write_string(&import.module, out);
    write_string(&import.name, out);
    match &import.kind {
        ImportKind::Func(type_index) => {
            out.push(0x00);
            leb128::encode_u32(*type_index, out);
        }
        ImportKind::Table { ref_type, limits } => {
            out.push(0x01);
            out.push(*ref_type);
            write_limits(limits, out);
        }
        ImportKind::Memory(limits) => {
            out.push(0x02);
            write_limits(limits, out);
        }
        ImportKind::Global { val_type, mutable } => {
            out.push(0x03);
            out.push(*val_type);
            out.push(u8::from(*mutable));
        }
    }
}

fn write_global(global: &Global, out: &mut Vec<u8>) {
    out.push(global.val_type);
    out.push(u8::from(global.mutable));
    write_expr(&global.init, out);
}

fn write_export(export: &Export, out: &mut Vec<u8>) {
    write_string(&export.name, out);
    out.push(export.kind.to_byte());
    leb128::encode_u32(export.index, out);
}

fn write_element(segment: &ElementSegment, out: &mut Vec<u8>) {
    leb128::encode_u32(segment.flags, out);
    if let Some(table_index) = segment.table_index {
        leb128::encode_u32(table_index, out);
    }
    if let Some(offset) = &segment.offset {
        write_expr(offset, out);
    }
    if let Some(kind) = segment.kind {
        out.push(kind);
    }
    match &segment.items {
        ElementItems::Functions(funcs) => {
            leb128::encode_u32(funcs.len() as u32, out);
            for &func_index in funcs {
                leb128::encode_u32(func_index, out);
            }
        }
        ElementItems::Expressions(exprs) => {
            leb128::encode_u32(exprs.len() as u32, out);
            for expr in exprs {
                write_expr(expr, out);
            }
        }
    }
}

fn write_body(body: &FuncBody, out: &mut Vec<u8>) {
    let mut encoded = Vec::new();
    leb128::encode_u32(body.locals.len() as u32, &mut encoded);
    for (count, ty) in &body.locals {
        leb128::encode_u32(*count, &mut encoded);
        encoded.push(ty.to_byte());
    }
    for instruction in &body.instructions {
        write_instruction(instruction, &mut encoded);
    }
    leb128::encode_u32(encoded.len() as u32, out);
    out.extend_from_slice(&encoded);
}

fn write_expr(instructions: &[Instruction], out: &mut Vec<u8>) {
    for instruction in instructions {
        write_instruction(instruction, out);
    }
}

fn write_memarg(memarg: &MemArg, out: &mut Vec<u8>) {
    leb128::encode_u32(memarg.align, out);
    leb128::encode_u32(memarg.offset, out);
}

pub fn write_instruction(instruction: &Instruction, out: &mut Vec<u8>) {
    match instruction {
        Instruction::Unreachable => out.push(0x00),
        Instruction::Block(bt) => {
            out.push(0x02);
            out.extend_from_slice(&bt.0);
        }
        Instruction::Loop(bt) => {
            out.push(0x03);
            out.extend_from_slice(&bt.0);
        }
        Instruction::If(bt) => {
            out.push(0x04);
            out.extend_from_slice(&bt.0);
        }
        Instruction::End => out.push(0x0b),
        Instruction::Return => out.push(0x0f),
        Instruction::Call(func_index) => {
            out.push(0x10);
            leb128::encode_u32(*func_index, out);
        }
        Instruction::LocalGet(index) => {
            out.push(0x20);
            leb128::encode_u32(*index, out);
        }
        Instruction::LocalSet(index) => {
            out.push(0x21);
            leb128::encode_u32(*index, out);
        }
        Instruction::LocalTee(index) => {
            out.push(0x22);
            leb128::encode_u32(*index, out);
        }
        Instruction::I32Load(memarg) => {
            out.push(0x28);
            write_memarg(memarg, out);
        }
        Instruction::I32Store(memarg) => {
            out.push(0x36);
            write_memarg(memarg, out);
        }
        Instruction::I32Const(value) => {
            out.push(0x41);
            leb128::encode_i32(*value, out);
        }
        Instruction::I32LtU => out.push(0x49),
        Instruction::I32Add => out.push(0x6a),
        Instruction::I32Mul => out.push(0x6c),
        Instruction::I32RemU => out.push(0x70),
        Instruction::RefFunc(func_index) => {
            out.push(0xd2);
            leb128::encode_u32(*func_index, out);
        }
        Instruction::Other { opcode, operands } => {
            out.push(*opcode);
            out.extend_from_slice(operands);
        }
    }
}

fn write_custom(custom: &CustomSection, out: &mut Vec<u8>) {
    write_string(&custom.name, out);
    match &custom.payload {
        CustomPayload::Raw(bytes) => out.extend_from_slice(bytes),
        CustomPayload::Name(names) => write_name_section(names, out),
    }
}

fn write_name_section(names: &NameSection, out: &mut Vec<u8>) {
    for subsection in &names.subsections {
        let mut payload = Vec::new();
        let id = match subsection {
            NameSubsection::Functions(entries) => {
                leb128::encode_u32(entries.len() as u32, &mut payload);
                for (index, name) in entries {
                    leb128::encode_u32(*index, &mut payload);
                    write_string(name, &mut payload);
                }
                1
            }
            NameSubsection::Locals(functions) => {
                leb128::encode_u32(functions.len() as u32, &mut payload);
                for (func_index, locals) in functions {
                    leb128::encode_u32(*func_index, &mut payload);
                    leb128::encode_u32(locals.len() as u32, &mut payload);
                    for (local_index, name) in locals {
                        leb128::encode_u32(*local_index, &mut payload);
                        write_string(name, &mut payload);
                    }
                }
                2
            }
            NameSubsection::Raw { id, bytes } => {
                payload.extend_from_slice(bytes);
                *id
            }
        };
        out.push(id);
        leb128::encode_u32(payload.len() as u32, out);
        out.extend_from_slice(&payload);
    }
}

//! Trace record definitions and the host side of the ring buffer: the
//! reserved export names, buffer layout constants, record decoding and
//! the indented trace printer.
//!
//! Buffer layout in guest linear memory, starting at the offset returned
//! by the tracer-offset export: a two-slot header (write cursor in
//! records, record count), followed by `capacity` records of two 32-bit
//! slots each (kind, payload).


use std::fmt::Write;

use crate::names::NameMap;

/// Exports added to the instrumented module.
pub const LOG_CALL: &str = "__log_call";
pub const LOG_RETURN: &str = "__log_return";
pub const EXPOSE_TRACER: &str = "__expose_tracer";
pub const EXPOSE_TRACER_LEN: &str = "__expose_tracer_len";
/// Export name added for the module memory when it exports none itself.
pub const MEMORY_EXPORT: &str = "memory";

/// Default ring capacity, in records.
pub const DEFAULT_CAPACITY: u32 = 1024;
pub const HEADER_BYTES: u32 = 8;
pub const RECORD_BYTES: u32 = 8;

/// Record kind tags, the first slot of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    FunctionCall = 0,
    FunctionReturnVoid = 1,
    FunctionReturnValue = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceRecord {
    /// A function was entered; payload is its index.
    Call(u32),
    /// A function returned without a captured value.
    ReturnVoid,
    /// A function returned a single i32; payload is the value.
    ReturnValue(i32),
}

impl EntryKind {
    pub fn from_u32(value: u32) -> Option<EntryKind> {
        match value {
            0 => Some(EntryKind::FunctionCall),
            1 => Some(EntryKind::FunctionReturnVoid),
            2 => Some(EntryKind::FunctionReturnValue),
            _ => None,
        }
    }
}

impl TraceRecord {
    pub fn from_pair(kind: u32, payload: u32) -> Option<TraceRecord> {
        match EntryKind::from_u32(kind)? {
            EntryKind::FunctionCall => Some(TraceRecord::Call(payload)),
            EntryKind::FunctionReturnVoid => Some(TraceRecord::ReturnVoid),
            EntryKind::FunctionReturnValue => Some(TraceRecord::ReturnValue(payload as i32)),
        }
    }
}

fn read_u32(memory: &[u8], addr: usize) -> Option<u32> {
    let bytes: [u8; 4] = memory.get(addr..addr + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Decodes the ring buffer region at `base` into records, oldest first.
/// When the buffer has wrapped, the cursor points at the oldest record;
/// before wrapping, cursor and count coincide and reading starts at the
/// region head. Truncated or unknown slots end the decode early.
pub fn read_trace(memory: &[u8], base: usize) -> Vec<TraceRecord> {
    let Some(cursor) = read_u32(memory, base) else {
        return Vec::new();
    };
    let Some(count) = read_u32(memory, base + 4) else {
        return Vec::new();
    };
    let wrapped = cursor != count;
    let mut records = Vec::new();
    for i in 0..count {
        let slot = if wrapped {
            cursor.wrapping_add(i) % count
        } else {
            i
        };
        let addr = base + HEADER_BYTES as usize + slot as usize * RECORD_BYTES as usize;
        let record = read_u32(memory, addr)
            .zip(read_u32(memory, addr + 4))
            .and_then(|(kind, payload)| TraceRecord::from_pair(kind, payload));
        match record {
            Some(record) => records.push(record),
            None => break,
        }
    }
    records
}

/// Renders records as an indented call tree, resolving names where the
/// map has them and falling back to bare indices.
pub fn render_trace(records: &[TraceRecord], names: &NameMap) -> String {
    let mut out = String::new();
    let mut depth = 0usize;
    for record in records {
        match record {
            TraceRecord::Call(index) => {
                indent(&mut out, depth);
                match names.get(*index) {
                    Some(name) => {
                        let _ = writeln!(out, "-> #{index} {name}");
                    }
                    None => {
                        let _ = writeln!(out, "-> #{index}");
                    }
                }
                depth += 1;
            }
            TraceRecord::ReturnVoid => {
                depth = depth.saturating_sub(1);
                indent(&mut out, depth);
                out.push_str("<- (void)\n");
            }
            TraceRecord::ReturnValue(value) => {
                depth = depth.saturating_sub(1);
                indent(&mut out, depth);
                let _ = writeln!(out, "<- {value}");
            }
        }
    }
    out
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

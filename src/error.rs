use thiserror::Error;

/// Errors detected while decoding the binary format. All of these are
/// fatal to the parse: a structurally broken module cannot be safely
/// instrumented, so no recovery is attempted.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FormatError {
    #[error("invalid magic number, expected \\0asm")]
    InvalidMagic,

    #[error("unsupported module version {0}, expected 1")]
    UnsupportedVersion(u32),

    #[error("section runs past the end of the module at offset {offset}")]
    TruncatedSection { offset: usize },

    #[error("section id {id} appears out of order at offset {offset}")]
    SectionOutOfOrder { id: u8, offset: usize },

    #[error("section payload length does not match its contents at offset {offset}")]
    SectionSizeMismatch { offset: usize },

    #[error("function body length does not match its contents at offset {offset}")]
    BodySizeMismatch { offset: usize },

    #[error("function section declares {declared} function(s) but the code section holds {bodies}")]
    FunctionCountMismatch { declared: u32, bodies: u32 },

    #[error("malformed varint at offset {offset}")]
    MalformedVarint { offset: usize },

    #[error("malformed name section: {reason}")]
    MalformedNameSection { reason: String },

    #[error("invalid UTF-8 string at offset {offset}")]
    InvalidString { offset: usize },

    #[error("unsupported opcode 0x{opcode:02x} at offset {offset}")]
    UnsupportedOpcode { opcode: u8, offset: usize },

    #[error("unsupported {what} at offset {offset}")]
    Unsupported { what: &'static str, offset: usize },
}

/// Errors raised by the instrumentation engine. The original module bytes
/// stay valid when these occur; only the in-memory rewrite is abandoned.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum InstrumentError {
    #[error("function '{0}' not found in module")]
    SelectionNotFound(String),

    #[error("function '{0}' is imported and has no body to instrument")]
    ImportedFunction(String),

    #[error("module memory is too large to append a trace buffer")]
    MemoryTooLarge,
}

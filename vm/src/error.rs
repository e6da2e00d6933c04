use thiserror::Error;

/// Outcome classes the embedder sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0,
    TokenError,
    ParseError,
    CompileError,
    Panic,
    Unknown,
}

/// Irrecoverable failure inside an evaluation. The VM unwinds every
/// frame (releasing retained locals) before handing this out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("panic: {kind} (pc {pc})")]
pub struct RuntimePanic {
    pub kind: PanicKind,
    /// Instruction offset the panic was raised at.
    pub pc: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PanicKind {
    #[error("stack overflow")]
    StackOverflow,
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("index out of bounds")]
    OutOfBounds,
    #[error("invalid rune")]
    InvalidRune,
    #[error("assertion failed")]
    AssertError,
    #[error("undefined symbol `{0}`")]
    UndefinedSymbol(String),
    #[error("host function panicked")]
    NativePanic,
}

/// What `eval`/`validate` return on failure.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("token error: {0}")]
    Token(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("compile error: {0}")]
    Compile(String),
    #[error(transparent)]
    Panic(#[from] RuntimePanic),
    #[error("no compiler registered")]
    NoCompiler,
}

impl EvalError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            EvalError::Token(_) => ResultCode::TokenError,
            EvalError::Parse(_) => ResultCode::ParseError,
            EvalError::Compile(_) => ResultCode::CompileError,
            EvalError::Panic(_) => ResultCode::Panic,
            EvalError::NoCompiler => ResultCode::Unknown,
        }
    }
}

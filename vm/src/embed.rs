//! The embedder surface: source evaluation through a registered
//! compiler, module hooks, the print callback, user data and build
//! introspection.
//!
//! The front end (lexer/parser/codegen) lives outside this crate; the
//! VM drives it through the [`Compiler`] trait and reports its failures
//! as the matching [`ResultCode`](crate::ResultCode) classes.

use std::any::Any;

use bytecode::Chunk;
use object::Value;

use crate::error::EvalError;
use crate::host::{Module, ModuleLoaderFn, ModuleResolverFn};
use crate::{HostFuncFn, VM};

/// Why a source string failed to become a chunk.
#[derive(Debug, Clone)]
pub enum CompileFail {
    Token(String),
    Parse(String),
    Compile(String),
}

impl From<CompileFail> for EvalError {
    fn from(f: CompileFail) -> Self {
        match f {
            CompileFail::Token(m) => EvalError::Token(m),
            CompileFail::Parse(m) => EvalError::Parse(m),
            CompileFail::Compile(m) => EvalError::Compile(m),
        }
    }
}

/// The external front end: turns source into a chunk, with access to
/// the VM for symbol/type registration while compiling.
pub trait Compiler {
    fn compile(
        &mut self,
        vm: &mut VM,
        src: &str,
        uri: &str,
    ) -> Result<Chunk, CompileFail>;
}

/// Override for the script-visible `print`. The default drops output.
pub type PrintFn = fn(&VM, &str);

impl VM {
    // ── Evaluation ─────────────────────────────────────────────────

    /// Compiles and runs `src`, returning the program's end value
    /// (retained; the embedder releases it).
    pub fn eval(&mut self, src: &str) -> Result<Value, EvalError> {
        let chunk = self.compile_source(src)?;
        let result = self.run_chunk(chunk);
        result.map_err(EvalError::from)
    }

    /// Compiles `src` without running it.
    pub fn validate(&mut self, src: &str) -> Result<(), EvalError> {
        self.compile_source(src).map(|_| ())
    }

    fn compile_source(&mut self, src: &str) -> Result<Chunk, EvalError> {
        let uri = (self.resolver)(self, "main", "main")
            .unwrap_or_else(|| "main".to_string());
        let mut compiler =
            self.compiler.take().ok_or(EvalError::NoCompiler)?;
        let result = compiler.compile(self, src, &uri);
        self.compiler = Some(compiler);
        result.map_err(|f| {
            let err = EvalError::from(f);
            self.last_error = Some(err.to_string());
            err
        })
    }

    pub fn set_compiler(&mut self, compiler: Box<dyn Compiler>) {
        self.compiler = Some(compiler);
    }

    // ── Modules ────────────────────────────────────────────────────

    pub fn set_module_resolver(&mut self, resolver: ModuleResolverFn) {
        self.resolver = resolver;
    }

    pub fn set_module_loader(&mut self, loader: ModuleLoaderFn) {
        self.loader = Some(loader);
    }

    /// The registered loader, for compilers resolving imports.
    pub fn module_loader(&self) -> Option<ModuleLoaderFn> {
        self.loader
    }

    /// Resolves an import specifier through the registered resolver.
    pub fn resolve_module(&self, cur_uri: &str, spec: &str) -> Option<String> {
        (self.resolver)(self, cur_uri, spec)
    }

    /// Registers an empty module and returns its id.
    pub fn create_module(&mut self, uri: &str) -> u32 {
        self.modules.push(Module {
            uri: uri.to_string(),
            ..Module::default()
        });
        (self.modules.len() - 1) as u32
    }

    /// Binds a host function into a module and, by name, to the static
    /// symbol table of subsequently loaded chunks.
    pub fn set_module_func(
        &mut self,
        mod_id: u32,
        name: &str,
        func: HostFuncFn,
        num_params: u8,
    ) {
        self.modules[mod_id as usize]
            .funcs
            .insert(name.to_string(), (func, num_params));
        self.register_func(name, func, num_params);
    }

    /// Binds a value into a module. The module owns one reference.
    pub fn set_module_var(&mut self, mod_id: u32, name: &str, v: Value) {
        self.heap.retain(v);
        let m = &mut self.modules[mod_id as usize];
        if let Some(old) = m.vars.insert(name.to_string(), v) {
            self.heap.release(old);
        }
        self.register_var(name, v);
    }

    pub fn module_uri(&self, mod_id: u32) -> Option<&str> {
        self.modules.get(mod_id as usize).map(|m| m.uri.as_str())
    }

    // ── Callbacks & user data ──────────────────────────────────────

    pub fn set_print(&mut self, print: PrintFn) {
        self.print = Some(print);
    }

    /// Routes a script `print` through the embedder's callback.
    pub fn print(&self, text: &str) {
        if let Some(cb) = self.print {
            cb(self, text);
        }
    }

    pub fn set_user_data(&mut self, data: Box<dyn Any>) {
        self.user_data = Some(data);
    }

    pub fn user_data(&self) -> Option<&dyn Any> {
        self.user_data.as_deref()
    }

    pub fn user_data_mut(&mut self) -> Option<&mut dyn Any> {
        self.user_data.as_deref_mut()
    }

    /// Routes per-instruction and refcount tracing to the `vm::trace`
    /// and `heap` targets.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }
}

// ── Build introspection ────────────────────────────────────────────

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn build() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    }
}

pub fn commit() -> &'static str {
    option_env!("BUILD_COMMIT").unwrap_or("unknown")
}

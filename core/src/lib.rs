//! Core implementation of the NN language toolchain. The crate covers the
//! whole path from source text to execution: lexing, parsing, semantic
//! analysis (with cooperative fibers for forward references), lowering to
//! a three-address IR, a two-pass assembler for the `.nnasm` dialect, and
//! the register virtual machine that executes `.nnep` images.
//!
//! The compiler pipeline is driven through a [Session], which owns the
//! process-wide state (grammar tables, the interned type table, the symbol
//! arena and the module registry) that the original design kept in
//! globals:
//!
//! ```no_run
//! use nn::Session;
//!
//! let mut session = Session::new();
//! let output = session.compile_file("main.nn".as_ref()).unwrap();
//! for (module, ir) in &output.modules {
//!     println!("; {}", session.registry.get(*module).name);
//!     println!("{}", ir);
//! }
//! ```
//!
//! The assembler and VM form an independent path:
//!
//! ```
//! use nn::asm::assemble::assemble;
//! use nn::vm::Machine;
//!
//! let image = assemble("MOV 41 $r0 INC $r0 HLT", "demo.nnasm").unwrap();
//! let mut machine = Machine::load(&image).unwrap();
//! machine.run();
//! assert_eq!(machine.registers()["r0"], 42);
//! ```

#![deny(clippy::all)]

pub mod asm;
pub mod ast;
pub mod error;
pub mod grammar;
pub mod ir;
pub mod lex;
pub mod lower;
pub mod module;
pub mod parse;
pub mod sema;
pub mod symbol;
pub mod token;
pub mod ty;
pub mod util;
pub mod vm;

pub use util::Span;

use error::{CompileError, WithSource};
use grammar::Grammar;
use ir::IrBody;
use module::{ModuleId, ModuleRegistry};
use std::path::Path;
use symbol::{OwnerKind, SymbolArena};
use thiserror::Error;
use ty::TypeTable;

/// Shared state of one compiler invocation: grammar tables, the type
/// table, every scope and symbol, and the module registry. All
/// cross-module references go through ids into these tables.
pub struct Session {
    pub grammar: Grammar,
    pub types: TypeTable,
    pub symbols: SymbolArena,
    pub registry: ModuleRegistry,
}

/// The result of a successful build: per-module IR in dependency order
/// (imports before importers).
pub struct BuildOutput {
    pub root: ModuleId,
    pub modules: Vec<(ModuleId, IrBody)>,
}

fn format_diagnostics(errors: &[WithSource<CompileError>]) -> String {
    errors
        .iter()
        .map(|e| format!("{:#}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{}", format_diagnostics(.0))]
    Compile(Vec<WithSource<CompileError>>),
}

impl BuildError {
    /// The diagnostics of a failed build, if it failed in the compiler.
    pub fn diagnostics(&self) -> &[WithSource<CompileError>] {
        match self {
            Self::Compile(errors) => errors,
            Self::Io(_) => &[],
        }
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            grammar: Grammar::new(),
            types: TypeTable::new(),
            symbols: SymbolArena::new(),
            registry: ModuleRegistry::new(),
        }
    }

    /// Compile a file and everything it imports.
    pub fn compile_file(
        &mut self,
        path: &Path,
    ) -> Result<BuildOutput, BuildError> {
        let root = self.registry.load_tree(
            &self.grammar,
            *self.types.well_known(),
            path,
        )?;
        self.analyze_and_lower(root)
    }

    /// Compile a single in-memory module (it cannot import).
    pub fn compile_source(
        &mut self,
        name: &str,
        src: String,
    ) -> Result<BuildOutput, BuildError> {
        let root = self.registry.add_source(
            &self.grammar,
            *self.types.well_known(),
            name,
            src,
        );
        self.analyze_and_lower(root)
    }

    /// Phases G and H over the whole dependency graph, imports first.
    fn analyze_and_lower(
        &mut self,
        root: ModuleId,
    ) -> Result<BuildOutput, BuildError> {
        let order = self.registry.dependency_order(root);

        for &id in &order {
            // The module's root scope, with every direct import bound as
            // a MODULE symbol named by the file stem
            let scope = self.symbols.new_scope(OwnerKind::Module, None);
            self.registry.get_mut(id).scope = Some(scope);
            let deps = self.registry.get(id).deps.clone();
            for dep in deps {
                let dep_module = self.registry.get(dep);
                let stem = dep_module
                    .path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| dep_module.name.clone());
                if let Some(dep_scope) = dep_module.scope {
                    let _ = self.symbols.add_module(scope, &stem, dep_scope);
                    // The import also makes the dependency's names
                    // reachable unqualified
                    self.symbols.borrow_all(scope, dep_scope);
                }
            }

            let module::Module {
                ast,
                tokens,
                src,
                errors,
                root: module_root,
                ..
            } = self.registry.get_mut(id);
            sema::analyze_module(
                &mut self.types,
                &mut self.symbols,
                ast,
                tokens,
                src,
                errors,
                scope,
                *module_root,
            );
            log::debug!(
                "analyzed module {}: {} diagnostics",
                self.registry.get(id).name,
                self.registry.get(id).errors.len()
            );
        }

        let mut modules = Vec::new();
        for &id in &order {
            let module::Module {
                ast,
                tokens,
                src,
                errors,
                root: module_root,
                ..
            } = self.registry.get_mut(id);
            let ir = lower::lower_module(
                ast,
                &self.symbols,
                &self.types,
                tokens,
                src,
                *module_root,
                errors,
            );
            modules.push((id, ir));
        }

        let mut failures = Vec::new();
        for &id in &order {
            let module = self.registry.get(id);
            if !module.errors.is_empty() {
                failures.push(WithSource::new(
                    module.errors.clone(),
                    module.name.clone(),
                    module.src.clone(),
                ));
            }
        }
        if failures.iter().any(|f| f.has_errors()) {
            return Err(BuildError::Compile(failures));
        }
        Ok(BuildOutput { root, modules })
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

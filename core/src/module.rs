//! The module graph: one [Module] per source file, keyed by absolute path
//! in a deduplicating registry. Parsing is embarrassingly parallel (each
//! module's tokens, AST and diagnostics are produced by exactly one task,
//! and the parser needs nothing mutable that is shared), so imports are
//! gathered in rounds: parse everything pending, collect the newly
//! discovered imports, repeat. Semantic analysis later walks the
//! dependency graph in postorder, so a module's imports are analyzed
//! before it.

use crate::ast::{AstArena, AstId};
use crate::error::{CompileError, SourceErrorWrapper};
use crate::grammar::Grammar;
use crate::lex;
use crate::parse;
use crate::symbol::ScopeId;
use crate::token::TokenStream;
use crate::ty::WellKnown;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModuleId(pub usize);

#[derive(Debug)]
pub struct Module {
    pub id: ModuleId,
    /// Absolute path; synthetic (non-existent) for in-memory sources
    pub path: PathBuf,
    /// Short name used in diagnostics
    pub name: String,
    pub src: String,
    pub tokens: TokenStream,
    pub ast: AstArena,
    pub root: AstId,
    /// Root scope; assigned when semantic analysis integrates the module
    pub scope: Option<ScopeId>,
    /// Import paths as written, with the requesting AST node
    pub imports: Vec<(String, AstId)>,
    /// Resolved dependency edges
    pub deps: Vec<ModuleId>,
    pub errors: Vec<SourceErrorWrapper<CompileError>>,
}

/// Result of parsing one file, before it is wired into the registry.
struct ParsedFile {
    path: PathBuf,
    src: String,
    tokens: TokenStream,
    ast: AstArena,
    root: AstId,
    imports: Vec<(String, AstId)>,
    errors: Vec<SourceErrorWrapper<CompileError>>,
}

fn parse_one(
    grammar: &Grammar,
    well_known: WellKnown,
    path: PathBuf,
    src: String,
) -> ParsedFile {
    let mut errors = Vec::new();
    let mut tokens = lex::lex(&src, &mut errors);
    let mut ast = AstArena::new();
    let output = parse::parse(
        &src,
        grammar,
        &mut tokens,
        &mut ast,
        well_known,
        &mut errors,
    );
    log::debug!(
        "parsed {}: {} tokens, {} nodes, {} errors",
        path.display(),
        tokens.len(),
        ast.len(),
        errors.len()
    );
    ParsedFile {
        path,
        src,
        tokens,
        ast,
        root: output.root,
        imports: output.imports,
        errors,
    }
}

/// All modules of one compilation.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: Vec<Module>,
    by_path: HashMap<PathBuf, ModuleId>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ModuleId) -> &Module {
        &self.modules[id.0]
    }

    pub fn get_mut(&mut self, id: ModuleId) -> &mut Module {
        &mut self.modules[id.0]
    }

    pub fn by_path(&self, path: &Path) -> Option<ModuleId> {
        self.by_path.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ModuleId> {
        (0..self.modules.len()).map(ModuleId)
    }

    fn integrate(&mut self, file: ParsedFile) -> ModuleId {
        let id = ModuleId(self.modules.len());
        let name = file
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.path.display().to_string());
        self.by_path.insert(file.path.clone(), id);
        self.modules.push(Module {
            id,
            path: file.path,
            name,
            src: file.src,
            tokens: file.tokens,
            ast: file.ast,
            root: file.root,
            scope: None,
            imports: file.imports,
            deps: Vec::new(),
            errors: file.errors,
        });
        id
    }

    /// Add an in-memory module (single-source builds and tests).
    pub fn add_source(
        &mut self,
        grammar: &Grammar,
        well_known: WellKnown,
        name: &str,
        src: String,
    ) -> ModuleId {
        let path = PathBuf::from(name);
        let parsed = parse_one(grammar, well_known, path, src);
        self.integrate(parsed)
    }

    /// Parse `root` and, round by round, everything it transitively
    /// imports. Each round's files parse on their own threads. Returns
    /// the root module's id.
    pub fn load_tree(
        &mut self,
        grammar: &Grammar,
        well_known: WellKnown,
        root: &Path,
    ) -> std::io::Result<ModuleId> {
        let root = root.canonicalize()?;
        let root_src = std::fs::read_to_string(&root)?;
        let root_id = {
            let parsed =
                parse_one(grammar, well_known, root.clone(), root_src);
            self.integrate(parsed)
        };

        // Rounds: resolve this round's imports, parse the unseen ones in
        // parallel, integrate, repeat until no new files appear
        let mut frontier = vec![root_id];
        while !frontier.is_empty() {
            let mut wanted: Vec<(ModuleId, AstId, PathBuf)> = Vec::new();
            for &id in &frontier {
                let module_dir = self
                    .get(id)
                    .path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                let imports = self.get(id).imports.clone();
                for (rel, node) in imports {
                    let target = module_dir.join(&rel);
                    let target =
                        target.canonicalize().unwrap_or(target);
                    if target == self.get(id).path {
                        let span = {
                            let module = self.get(id);
                            module.tokens.get(module.ast.get(node).token).span
                        };
                        let src = self.get(id).src.clone();
                        self.get_mut(id).errors.push(
                            SourceErrorWrapper::new(
                                CompileError::SelfImport,
                                span,
                                &src,
                            ),
                        );
                        continue;
                    }
                    wanted.push((id, node, target));
                }
            }

            // Claim unseen paths exactly once
            let mut to_parse: Vec<PathBuf> = Vec::new();
            for (_, _, path) in &wanted {
                if self.by_path.get(path).is_none()
                    && !to_parse.contains(path)
                {
                    to_parse.push(path.clone());
                }
            }

            // The parallel part: one thread per pending file
            let parsed: Vec<(PathBuf, std::io::Result<ParsedFile>)> =
                std::thread::scope(|scope| {
                    let handles: Vec<_> = to_parse
                        .iter()
                        .map(|path| {
                            let path = path.clone();
                            scope.spawn(move || {
                                let src = std::fs::read_to_string(&path)?;
                                Ok(parse_one(
                                    grammar, well_known, path, src,
                                ))
                            })
                        })
                        .collect();
                    to_parse
                        .iter()
                        .cloned()
                        .zip(handles.into_iter().map(|handle| {
                            handle.join().expect("parser thread panicked")
                        }))
                        .collect()
                });

            frontier = Vec::new();
            for (path, result) in parsed {
                match result {
                    Ok(file) => frontier.push(self.integrate(file)),
                    Err(error) => {
                        // Keep the path claimed so the error reports once
                        log::warn!(
                            "cannot read {}: {}",
                            path.display(),
                            error
                        );
                        self.by_path
                            .insert(path, ModuleId(usize::MAX));
                    }
                }
            }

            // Wire the dependency edges we can now resolve
            for (importer, node, path) in wanted {
                match self.by_path.get(&path).copied() {
                    Some(dep) if dep.0 != usize::MAX => {
                        if !self.get(importer).deps.contains(&dep) {
                            self.get_mut(importer).deps.push(dep);
                        }
                    }
                    _ => {
                        let span = {
                            let module = self.get(importer);
                            module.tokens.get(module.ast.get(node).token).span
                        };
                        let src = self.get(importer).src.clone();
                        self.get_mut(importer).errors.push(
                            SourceErrorWrapper::new(
                                CompileError::Expected {
                                    expected: format!(
                                        "importable module at `{}`",
                                        path.display()
                                    ),
                                },
                                span,
                                &src,
                            ),
                        );
                    }
                }
            }
        }
        Ok(root_id)
    }

    /// Modules in dependency postorder starting from `root`: every
    /// module's imports come before it. Import cycles are broken at the
    /// back edge.
    pub fn dependency_order(&self, root: ModuleId) -> Vec<ModuleId> {
        let mut order = Vec::new();
        let mut state = vec![0u8; self.modules.len()]; // 0 new, 1 open, 2 done
        let mut stack = vec![(root, 0usize)];
        while let Some((id, next_dep)) = stack.pop() {
            if next_dep == 0 {
                if state[id.0] != 0 {
                    continue;
                }
                state[id.0] = 1;
            }
            match self.get(id).deps.get(next_dep) {
                Some(&dep) => {
                    stack.push((id, next_dep + 1));
                    if state[dep.0] == 0 {
                        stack.push((dep, 0));
                    }
                }
                None => {
                    state[id.0] = 2;
                    order.push(id);
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::TypeTable;

    fn registry_with(sources: &[(&str, &str)]) -> (ModuleRegistry, Vec<ModuleId>) {
        let grammar = Grammar::new();
        let types = TypeTable::new();
        let mut registry = ModuleRegistry::new();
        let ids = sources
            .iter()
            .map(|(name, src)| {
                registry.add_source(
                    &grammar,
                    *types.well_known(),
                    name,
                    (*src).into(),
                )
            })
            .collect();
        (registry, ids)
    }

    #[test]
    fn test_in_memory_modules() {
        let (registry, ids) =
            registry_with(&[("a.nn", "var x: u32 = 1;")]);
        let module = registry.get(ids[0]);
        assert_eq!(module.name, "a.nn");
        assert!(module.errors.is_empty());
    }

    #[test]
    fn test_dependency_postorder() {
        let (mut registry, ids) = registry_with(&[
            ("a.nn", ""),
            ("b.nn", ""),
            ("c.nn", ""),
        ]);
        // a -> b -> c and a -> c
        registry.get_mut(ids[0]).deps.push(ids[1]);
        registry.get_mut(ids[0]).deps.push(ids[2]);
        registry.get_mut(ids[1]).deps.push(ids[2]);
        let order = registry.dependency_order(ids[0]);
        assert_eq!(order, vec![ids[2], ids[1], ids[0]]);
    }

    #[test]
    fn test_dependency_cycle_terminates() {
        let (mut registry, ids) = registry_with(&[("a.nn", ""), ("b.nn", "")]);
        registry.get_mut(ids[0]).deps.push(ids[1]);
        registry.get_mut(ids[1]).deps.push(ids[0]);
        let order = registry.dependency_order(ids[0]);
        assert_eq!(order.len(), 2);
        assert_eq!(*order.last().unwrap(), ids[0]);
    }

    #[test]
    fn test_load_tree_with_imports() {
        let dir = std::env::temp_dir().join(format!(
            "nn-module-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("util.nn"), "var shared: u32 = 1;")
            .unwrap();
        std::fs::write(
            dir.join("main.nn"),
            "import util;\nvar x: u32 = 2;",
        )
        .unwrap();

        let grammar = Grammar::new();
        let types = TypeTable::new();
        let mut registry = ModuleRegistry::new();
        let root = registry
            .load_tree(&grammar, *types.well_known(), &dir.join("main.nn"))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(root).deps.len(), 1);
        let dep = registry.get(root).deps[0];
        assert_eq!(registry.get(dep).name, "util.nn");
        // The same path is never parsed twice
        assert_eq!(
            registry.by_path(&dir.join("util.nn").canonicalize().unwrap()),
            Some(dep)
        );

        let _ = std::fs::remove_dir_all(&dir);
    }
}

//! Integration tests for the NN compiler pipeline: parse, semantic
//! analysis under the fiber scheduler, and IR lowering. Programs here
//! exercise whole-module behavior; phase-level details live in the unit
//! tests next to each phase.

use nn::error::CompileError;
use nn::ir::{IrOp, IrParam};
use nn::symbol::{Lookup, OwnerKind, SymbolKind};
use nn::{BuildError, BuildOutput, Session};

/// Compile a single module, panicking with rendered diagnostics on
/// failure.
fn compile(src: &str) -> (Session, BuildOutput) {
    let mut session = Session::new();
    match session.compile_source("test.nn", src.into()) {
        Ok(output) => (session, output),
        Err(error) => panic!("build failed:\n{}", error),
    }
}

/// Compile a single module, expecting failure; returns rendered
/// diagnostics.
fn compile_err(src: &str) -> (Session, Vec<String>) {
    let mut session = Session::new();
    match session.compile_source("test.nn", src.into()) {
        Ok(_) => panic!("expected a failing build"),
        Err(BuildError::Compile(failures)) => {
            let rendered = failures
                .iter()
                .flat_map(|failure| {
                    failure.errors().iter().map(|e| e.to_string())
                })
                .collect();
            (session, rendered)
        }
        Err(other) => panic!("unexpected error kind: {}", other),
    }
}

/// Names of every function the module's IR calls.
fn called_names(session: &Session, output: &BuildOutput) -> Vec<String> {
    let mut names = Vec::new();
    for (_, ir) in &output.modules {
        for (_, triple) in ir.iter_chain() {
            if triple.op == IrOp::Call {
                if let IrParam::Symbol(sym) = triple.p1 {
                    names.push(session.symbols.symbol(sym).name.clone());
                }
            }
        }
    }
    names
}

fn root_symbol(session: &Session, output: &BuildOutput, name: &str) -> SymbolKind {
    let scope = session.registry.get(output.root).scope.unwrap();
    match session.symbols.get(scope, name, false, OwnerKind::Free) {
        Lookup::Found(sym) => session.symbols.symbol(sym).kind.clone(),
        other => panic!("`{}` did not resolve: {:?}", name, other),
    }
}

#[test]
fn test_empty_module() {
    let (_, output) = compile("");
    assert_eq!(output.modules.len(), 1);
}

#[test]
fn test_globals_and_arithmetic() {
    let (session, output) = compile(
        "var base: s32 = 40;\n\
         var result: s32 = base + 2;\n",
    );
    match root_symbol(&session, &output, "result") {
        SymbolKind::Variable { ty, defined, .. } => {
            assert!(defined);
            assert_eq!(session.types.to_string(ty), "s32");
        }
        other => panic!("unexpected symbol {:?}", other),
    }
}

#[test]
fn test_recursive_struct_sizes_with_alignment() {
    // A struct may point at itself; the pointer keeps the fixed point
    // going. Size is 4 (s32) + 4 padding + 8 (pointer).
    let (session, output) = compile(
        "def list := struct { var head: s32; var next: list*; };",
    );
    match root_symbol(&session, &output, "list") {
        SymbolKind::Type { ty, defined, .. } => {
            assert!(defined);
            assert_eq!(session.types.get(ty).size, Some(16));
        }
        other => panic!("unexpected symbol {:?}", other),
    }
}

#[test]
fn test_mutually_recursive_functions() {
    // Neither function can finish before the other's signature exists;
    // the fiber scheduler interleaves them without a circular-dependency
    // verdict.
    let src = "\
        def f :: fun(n: s32) -> s32 {\n\
            if n == 0 do return 1;\n\
            return g(n - 1);\n\
        }\n\
        def g :: fun(n: s32) -> s32 { return f(n - 1); }\n";
    let (session, output) = compile(src);
    let calls = called_names(&session, &output);
    assert!(calls.contains(&"g".to_string()), "f should call g: {:?}", calls);
    assert!(calls.contains(&"f".to_string()), "g should call f: {:?}", calls);
}

#[test]
fn test_circular_types_report_and_stay_undefined() {
    let (session, output_errors) = {
        let mut session = Session::new();
        let result = session.compile_source(
            "test.nn",
            "def a := struct { var v: b; };\n\
             def b := struct { var v: a; };\n"
                .into(),
        );
        let errors = match result {
            Err(BuildError::Compile(failures)) => failures,
            other => panic!("expected compile failure, got {:?}", other.is_ok()),
        };
        (session, errors)
    };
    let rendered: Vec<String> = output_errors
        .iter()
        .flat_map(|f| f.errors().iter().map(|e| e.to_string()))
        .collect();
    assert!(
        rendered.iter().any(|m| m.contains("circular dependency")),
        "wanted a circular dependency diagnostic, got {:?}",
        rendered
    );
    // Neither type got marked defined
    for module in session.registry.ids() {
        if let Some(scope) = session.registry.get(module).scope {
            for name in ["a", "b"] {
                if let Lookup::Found(sym) =
                    session.symbols.get(scope, name, false, OwnerKind::Free)
                {
                    assert!(
                        !session.symbols.symbol(sym).is_defined(),
                        "`{}` must stay undefined",
                        name
                    );
                }
            }
        }
    }
}

#[test]
fn test_numeric_for_direction_is_derived() {
    // `for var i = 10, 1` counts down: the bound check must be a
    // greater-equals against the stop value.
    let (_, output) = compile(
        "def main :: fun() -> u0 {\n\
             var total: s64 = 0;\n\
             for var i = 10, 1 { total += 1; }\n\
             return;\n\
         }",
    );
    let has_ge = output.modules.iter().any(|(_, ir)| {
        ir.iter_chain()
            .any(|(_, t)| t.op == IrOp::GreaterEquals)
    });
    assert!(has_ge, "downward numeric for should compare with >=");
}

#[test]
fn test_import_and_call_across_modules() {
    // Scenario: `print` is declared (bodiless) in an imported module and
    // called from main; the IR must carry a CALL to it.
    let dir = std::env::temp_dir()
        .join(format!("nn-compile-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("std.nn"),
        "def print :: fun(s: c8[]) -> u0;\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("main.nn"),
        "import std;\n\
         def main :: fun() -> u0 { print(\"hi\"); return; }\n",
    )
    .unwrap();

    let mut session = Session::new();
    let output = match session.compile_file(&dir.join("main.nn")) {
        Ok(output) => output,
        Err(error) => panic!("build failed:\n{}", error),
    };
    let calls = called_names(&session, &output);
    assert!(
        calls.contains(&"print".to_string()),
        "main should call print: {:?}",
        calls
    );

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_multi_return_destructuring() {
    let (_, _) = compile(
        "def pair :: fun() -> s32, s32 { return 1, 2; }\n\
         def main :: fun() -> u0 {\n\
             var a, b = pair();\n\
             a, b = pair();\n\
             return;\n\
         }",
    );
}

#[test]
fn test_multi_return_into_single_site_reports() {
    let (_, errors) = compile_err(
        "def pair :: fun() -> s32, s32 { return 1, 2; }\n\
         def main :: fun() -> u0 { var only = pair(); return; }",
    );
    assert!(
        errors.iter().any(|m| m.contains("expected 1 values but found 2")),
        "wanted an arity diagnostic, got {:?}",
        errors
    );
}

#[test]
fn test_type_mismatch_names_both_types() {
    let (_, errors) = compile_err("var p: u8* = \"not a pointer\";");
    assert!(
        errors.iter().any(|m| m.contains("u8*")),
        "diagnostic should name the target type: {:?}",
        errors
    );
}

#[test]
fn test_undeclared_identifier_reports() {
    let (_, errors) = compile_err("var x = missing;");
    assert!(errors
        .iter()
        .any(|m| m.contains("`missing` has not been declared")));
}

#[test]
fn test_redeclaration_reports_original_line() {
    let (_, errors) = compile_err("var x: u32 = 1;\nvar x: u32 = 2;");
    assert!(
        errors.iter().any(|m| m.contains("already been declared")),
        "wanted a redeclaration diagnostic, got {:?}",
        errors
    );
}

#[test]
fn test_raise_needs_error_return() {
    let (_, errors) = compile_err(
        "def f :: fun() -> u0 { raise 1; return; }",
    );
    assert!(errors
        .iter()
        .any(|m| m.contains("raise requires an e64")));

    // With an e64 in the returns it is fine
    compile("def f :: fun() -> s32, e64 { raise 1; return 0, 0; }");
}

#[test]
fn test_inferred_return_adopts_expression_types() {
    let (session, output) = compile(
        "def answer :: fun() -> infer { return 42 as s32; }",
    );
    match root_symbol(&session, &output, "answer") {
        SymbolKind::Function { overloads, defined, .. } => {
            assert!(defined);
            let rendered =
                session.types.to_string(overloads[0].ty);
            assert!(
                rendered.contains("-> s32"),
                "inferred signature was {}",
                rendered
            );
        }
        other => panic!("unexpected symbol {:?}", other),
    }
}

#[test]
fn test_methods_get_this() {
    let (session, output) = compile(
        "def point := struct {\n\
             var x: s32;\n\
             var y: s32;\n\
             def sum :: fun() -> s32 { return this.x + this.y; }\n\
         };\n\
         def main :: fun() -> u0 {\n\
             var p: point;\n\
             var total: s32 = p.sum();\n\
             return;\n\
         }",
    );
    let calls = called_names(&session, &output);
    assert!(calls.contains(&"sum".to_string()));
}

#[test]
fn test_enum_members_resolve() {
    let (_, _) = compile(
        "def color := enum { RED, GREEN = 5, BLUE };\n\
         def main :: fun() -> u0 {\n\
             var c: u64 = color.BLUE as u64;\n\
             return;\n\
         }",
    );
}

#[test]
fn test_statement_forms_compile_clean() {
    compile(
        "def main :: fun() -> u0 {\n\
             var total: s64 = 0;\n\
             var xs: s64[4] = '[1, 2, 3, 4];\n\
             for var x in xs do total += x;\n\
             for var i = 0; i < 4; i += 1 { total += i; }\n\
             while total > 0 { total -= 1; }\n\
             loop { break; }\n\
             do { total += 1; } while total < 3;\n\
             if total == 3 do total = 0;\n\
             else do total = 1;\n\
             switch total {\n\
                 case 0, 1 do total = 10;\n\
                 else do total = 20;\n\
             }\n\
             try { raise 7; } catch err { total = err as s64; }\n\
             defer total = 0;\n\
             label top;\n\
             if total > 100 do goto top;\n\
             var cell: s64* = new s64;\n\
             delete cell;\n\
             return;\n\
         }",
    );
}

#[test]
fn test_defer_runs_before_block_end_in_ir() {
    // The deferred assignment must be emitted between the body and the
    // enclosing block's end sentinel.
    let (_, output) = compile(
        "def main :: fun() -> u0 {\n\
             var x: s32 = 1;\n\
             defer x = 0;\n\
             x = 2;\n\
             return;\n\
         }",
    );
    let (_, ir) = &output.modules[0];
    let ops: Vec<IrOp> = ir.iter_chain().map(|(_, t)| t.op).collect();
    // There are copies after the RETVAL-free return jump path; the defer
    // shows up as a COPY between the last statement and FunctionEnd
    assert!(ops.contains(&IrOp::FunctionStart));
    assert!(ops.contains(&IrOp::FunctionEnd));
    let fn_end = ops
        .iter()
        .position(|&op| op == IrOp::FunctionEnd)
        .unwrap();
    let last_copy = ops
        .iter()
        .rposition(|&op| op == IrOp::Copy)
        .unwrap();
    assert!(last_copy < fn_end);
}

#[test]
fn test_using_prefers_local_names() {
    compile(
        "namespace inner { var x: s32 = 1; }\n\
         var x: s32 = 2;\n\
         using inner.*;\n\
         var y: s32 = x;\n",
    );
}

#[test]
fn test_break_outside_loop_reports() {
    let (_, errors) =
        compile_err("def main :: fun() -> u0 { break; return; }");
    assert!(errors.iter().any(|m| m.contains("outside of a loop")));
}

#[test]
fn test_error_type_suppresses_cascades() {
    // One bad declaration, used twice: exactly one diagnostic
    let (_, errors) = compile_err(
        "var bad = missing;\n\
         var x = bad + 1;\n\
         var y = bad * 2;\n",
    );
    assert_eq!(errors.len(), 1, "cascading errors leaked: {:?}", errors);
}

#[test]
fn test_structural_interning_across_spellings() {
    let (session, output) = compile(
        "var a: s32*;\n\
         var b: s32*;\n",
    );
    let ty_of = |name: &str| match root_symbol(&session, &output, name) {
        SymbolKind::Variable { ty, .. } => ty,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(ty_of("a"), ty_of("b"));
}

#[test]
fn test_compiler_note_is_carried_but_inert() {
    compile("#inline\ndef f :: fun() -> u0 { return; }");
}

#[test]
fn test_lex_error_still_reports_through_pipeline() {
    let mut session = Session::new();
    let result =
        session.compile_source("test.nn", "var s = \"unterminated;".into());
    match result {
        Err(BuildError::Compile(failures)) => {
            let all: Vec<String> = failures
                .iter()
                .flat_map(|f| f.errors().iter().map(|e| e.to_string()))
                .collect();
            assert!(all.iter().any(|m| m.contains("unterminated string")));
        }
        other => panic!("expected failure, got ok={}", other.is_ok()),
    }
}

#[test]
fn test_goto_unknown_label_reports() {
    let (_, errors) = compile_err(
        "def main :: fun() -> u0 { goto nowhere; return; }",
    );
    assert!(errors
        .iter()
        .any(|m| m.contains("never declared")));
    let _ = CompileError::UnknownLabel; // the variant under test
}

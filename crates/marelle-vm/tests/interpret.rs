//! tests/interpret.rs — batteries d'intégration pour marelle-vm
//!
//! Chaque test compile et exécute un programme complet via `interpret`, et
//! vérifie ce que `print` a écrit à travers un hôte collecteur.
//!
//! Astuce : lance en local avec :
//!   cargo test -p marelle-vm
//!   RUST_LOG=trace cargo test -p marelle-vm -- --nocapture

use std::cell::RefCell;
use std::rc::Rc;

use marelle_vm::{Host, InterpretError, Vm, VmOptions};

// -----------------------------------------------------------------------------
// Helpers de test
// -----------------------------------------------------------------------------

/// Hôte qui collecte les lignes imprimées au lieu de les écrire.
#[derive(Default, Clone)]
struct Sink(Rc<RefCell<Vec<String>>>);

impl Host for Sink {
    fn print_line(&mut self, text: &str) {
        self.0.borrow_mut().push(text.to_string());
    }
}

fn run(source: &str) -> Vec<String> {
    run_with(source, VmOptions::default())
}

fn run_with(source: &str, options: VmOptions) -> Vec<String> {
    let _ = env_logger::builder().is_test(true).try_init();
    let sink = Sink::default();
    let mut vm = Vm::with_options(options).with_host(Box::new(sink.clone()));
    vm.interpret(source).expect("exécution ok");
    let lines = sink.0.borrow().clone();
    lines
}

fn run_err(source: &str) -> InterpretError {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut vm = Vm::with_options(VmOptions::default()).with_host(Box::new(Sink::default()));
    vm.interpret(source).expect_err("échec attendu")
}

// -----------------------------------------------------------------------------
// Arithmétique et impression
// -----------------------------------------------------------------------------

#[test]
fn arithmetic_precedence() {
    assert_eq!(run("print 1 + 2 * 3;"), vec!["7"]);
}

#[test]
fn grouping_and_negation() {
    assert_eq!(run("print -(1 + 2) * 3;"), vec!["-9"]);
    assert_eq!(run("print (1 + 2) / 2;"), vec!["1.5"]);
}

#[test]
fn printing_follows_percent_g() {
    assert_eq!(
        run("print 0.5; print 100; print 10000000000000000000000;"),
        vec!["0.5", "100", "1e+22"]
    );
}

#[test]
fn literals_print_their_names() {
    assert_eq!(run("print nil; print true; print false;"), vec!["nil", "true", "false"]);
}

#[test]
fn strings_print_their_bytes() {
    assert_eq!(run("print \"bonjour\";"), vec!["bonjour"]);
}

#[test]
fn functions_print_their_name() {
    assert_eq!(run("fun f() {} print f;"), vec!["<fn f>"]);
    assert_eq!(run("print clock;"), vec!["<native fn>"]);
}

// -----------------------------------------------------------------------------
// Comparaisons et logique
// -----------------------------------------------------------------------------

#[test]
fn comparisons_including_derived_forms() {
    assert_eq!(
        run("print 1 < 2; print 2 < 1; print 2 > 1; print 1 >= 2; print 2 <= 2;"),
        vec!["true", "false", "true", "false", "true"]
    );
    assert_eq!(run("print 1 == 1; print 1 != 1; print !true;"), vec!["true", "false", "false"]);
}

#[test]
fn equality_crosses_types_without_error() {
    assert_eq!(run("print 1 == \"1\"; print nil == false;"), vec!["false", "false"]);
}

// -----------------------------------------------------------------------------
// Variables, portées, contrôle
// -----------------------------------------------------------------------------

#[test]
fn globals_and_locals_shadowing() {
    assert_eq!(run("var x = 10; { var x = 1; print x; } print x;"), vec!["1", "10"]);
}

#[test]
fn assignment_is_an_expression() {
    assert_eq!(run("var x = 1; var y = x = 2; print x; print y;"), vec!["2", "2"]);
}

#[test]
fn uninitialized_variables_default_to_nil() {
    assert_eq!(run("var x; print x;"), vec!["nil"]);
}

#[test]
fn if_else_branches() {
    assert_eq!(run("if (1 < 2) print \"oui\"; else print \"non\";"), vec!["oui"]);
    assert_eq!(run("if (nil) print \"oui\"; else print \"non\";"), vec!["non"]);
}

#[test]
fn while_loop_accumulates() {
    assert_eq!(
        run("var i = 0; var s = 0; while (i < 5) { s = s + i; i = i + 1; } print s;"),
        vec!["10"]
    );
}

// -----------------------------------------------------------------------------
// Fonctions, fermetures, appels terminaux
// -----------------------------------------------------------------------------

#[test]
fn function_calls_with_arguments() {
    assert_eq!(run("fun somme(a, b, c) { return a + b + c; } print somme(1, 2, 3);"), vec!["6"]);
}

#[test]
fn closure_counter_shares_state() {
    assert_eq!(
        run(
            "fun make() { var c = 0; fun inc() { c = c + 1; return c; } return inc; } \
             var f = make(); print f(); print f(); print f();"
        ),
        vec!["1", "2", "3"]
    );
}

#[test]
fn each_closure_gets_its_own_cell() {
    assert_eq!(
        run(
            "fun make() { var c = 0; fun inc() { c = c + 1; return c; } return inc; } \
             var a = make(); var b = make(); print a(); print a(); print b();"
        ),
        vec!["1", "2", "1"]
    );
}

#[test]
fn closed_upvalue_returns_its_last_value() {
    // La valeur vue après fermeture est celle du slot au moment de la
    // fermeture, en l'absence d'écriture ultérieure.
    assert_eq!(
        run(
            "var lire; { var a = 1; fun f() { return a; } a = 5; lire = f; } print lire();"
        ),
        vec!["5"]
    );
}

#[test]
fn deep_tail_recursion_stays_bounded() {
    assert_eq!(
        run("fun boucle(n) { if (n == 0) return 0; return boucle(n - 1); } print boucle(10000);"),
        vec!["0"]
    );
}

#[test]
fn recursion_without_tail_position_still_works() {
    assert_eq!(
        run("fun fact(n) { if (n < 2) return 1; return n * fact(n - 1); } print fact(9);"),
        vec!["362880"]
    );
}

// -----------------------------------------------------------------------------
// Internement
// -----------------------------------------------------------------------------

#[test]
fn interned_strings_compare_equal() {
    assert_eq!(run("var a = \"hi\"; var b = \"hi\"; print a == b;"), vec!["true"]);
    assert_eq!(run("print \"hi\" == \"ho\";"), vec!["false"]);
}

// -----------------------------------------------------------------------------
// Natives
// -----------------------------------------------------------------------------

#[test]
fn clock_returns_a_nonnegative_number() {
    assert_eq!(run("var t = clock(); print t < 0; print t == t;"), vec!["false", "true"]);
}

// -----------------------------------------------------------------------------
// GC sous stress
// -----------------------------------------------------------------------------

#[test]
fn stress_gc_runs_whole_programs() {
    let options = VmOptions::default().with_gc_stress(true);
    assert_eq!(run_with("fun f() { var s = \"x\"; } f(); f(); f();", options.clone()), Vec::<String>::new());
    assert_eq!(
        run_with(
            "fun make() { var c = 0; fun inc() { c = c + 1; return c; } return inc; } \
             var f = make(); print f(); print f();",
            options
        ),
        vec!["1", "2"]
    );
}

// -----------------------------------------------------------------------------
// Erreurs
// -----------------------------------------------------------------------------

#[test]
fn compile_errors_are_reported_as_such() {
    match run_err("print ;") {
        InterpretError::Compile(e) => assert!(e.to_string().contains("Expect expression.")),
        InterpretError::Runtime(e) => panic!("attendu une erreur de compilation, eu {e}"),
    }
}

#[test]
fn undefined_global_read_is_a_runtime_error() {
    match run_err("print absente;") {
        InterpretError::Runtime(e) => {
            assert!(e.to_string().contains("Undefined variable 'absente'."));
        }
        InterpretError::Compile(e) => panic!("attendu une erreur d'exécution, eu {e}"),
    }
}

#[test]
fn assigning_an_undefined_global_fails() {
    match run_err("fantome = 1;") {
        InterpretError::Runtime(e) => {
            assert!(e.to_string().contains("Undefined variable 'fantome'."));
        }
        InterpretError::Compile(e) => panic!("attendu une erreur d'exécution, eu {e}"),
    }
}

#[test]
fn arity_mismatch_is_a_runtime_error() {
    match run_err("fun f(a) { return a; } f();") {
        InterpretError::Runtime(e) => {
            assert!(e.to_string().contains("Expected 1 arguments but got 0."));
        }
        InterpretError::Compile(e) => panic!("attendu une erreur d'exécution, eu {e}"),
    }
}

#[test]
fn calling_a_non_callable_fails() {
    match run_err("var x = 1; x();") {
        InterpretError::Runtime(e) => assert!(e.to_string().contains("Can only call functions.")),
        InterpretError::Compile(e) => panic!("attendu une erreur d'exécution, eu {e}"),
    }
}

#[test]
fn invalid_assignment_target_is_a_compile_error() {
    match run_err("var a = 1; var b = 2; a + b = 3;") {
        InterpretError::Compile(e) => {
            assert!(e.to_string().contains("Invalid assignment target."));
        }
        InterpretError::Runtime(e) => panic!("attendu une erreur de compilation, eu {e}"),
    }
}

//! End-to-end scenarios exercising the compiler and VM together, the way a
//! real `.vit` script would: source text in, `print` output (or a runtime
//! error trace) out.

use std::cell::RefCell;
use std::rc::Rc;

use vitte_vm::{Host, InterpretResult, Vm};

#[derive(Default)]
struct RecordingHost {
    stdout: Rc<RefCell<Vec<String>>>,
    stderr: Rc<RefCell<Vec<String>>>,
}

impl Host for RecordingHost {
    fn print(&mut self, line: &str) {
        self.stdout.borrow_mut().push(line.to_string());
    }

    fn report_error(&mut self, line: &str) {
        self.stderr.borrow_mut().push(line.to_string());
    }
}

fn run(source: &str) -> (InterpretResult, Vec<String>, Vec<String>) {
    let host = RecordingHost::default();
    let stdout = host.stdout.clone();
    let stderr = host.stderr.clone();
    let mut vm = Vm::new().with_host(Box::new(host));
    let result = vm.interpret(source);
    (result, stdout.borrow().clone(), stderr.borrow().clone())
}

#[test]
fn arithmetic_and_precedence() {
    let (result, stdout, _) = run("print 1 + 2 * 3;");
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(stdout, vec!["7".to_string()]);
}

#[test]
fn closures_capture_and_mutate_the_same_upvalue() {
    let source = r#"
        fun makeCounter() {
            var count = 0;
            fun increment() {
                count = count + 1;
                print count;
            }
            return increment;
        }

        var counter = makeCounter();
        counter();
        counter();
        counter();
    "#;
    let (result, stdout, _) = run(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(stdout, vec!["1", "2", "3"]);
}

#[test]
fn equal_strings_built_from_concatenation_intern_to_the_same_identity() {
    let source = r#"
        var a = "foo" + "bar";
        var b = "foobar";
        print a == b;
    "#;
    let (result, stdout, _) = run(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(stdout, vec!["true"]);
}

#[test]
fn class_initializer_inheritance_and_super_calls() {
    let source = r#"
        class Greeter {
            init(name) {
                this.name = name;
            }
            greet() {
                print "hello";
            }
        }

        class ExcitedGreeter < Greeter {
            greet() {
                super.greet();
                print "!";
            }
        }

        var g = ExcitedGreeter("world");
        g.greet();
    "#;
    let (result, stdout, _) = run(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(stdout, vec!["hello", "!"]);
}

#[test]
fn calling_a_nil_value_is_a_runtime_error_with_a_trace() {
    let (result, stdout, stderr) = run("var x; x();");
    assert_eq!(result, InterpretResult::RuntimeError);
    assert!(stdout.is_empty());
    assert!(stderr[0].contains("Can only call functions and classes"));
    assert!(stderr.iter().any(|line| line.contains("[line 1] in script")));
}

#[test]
fn c_style_for_loop_counts_to_ten() {
    let source = r#"
        var total = 0;
        for (var i = 1; i <= 4; i = i + 1) {
            total = total + i;
        }
        print total;
    "#;
    let (result, stdout, _) = run(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(stdout, vec!["10"]);
}

use rlox::vm::{InterpretError, Vm};
use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

#[derive(Clone, Default)]
struct SharedOutput(Rc<RefCell<Vec<u8>>>);

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> (Result<(), InterpretError>, String) {
    let output = SharedOutput::default();
    let mut vm = Vm::with_output(Box::new(output.clone()));
    let result = vm.interpret(source);
    let text = String::from_utf8(output.0.borrow().clone()).unwrap();
    (result, text)
}

fn run_ok(source: &str) -> String {
    let (result, text) = run(source);
    assert_eq!(result, Ok(()), "program failed:\n{}", source);
    text
}

fn run_runtime_error(source: &str) {
    let (result, _) = run(source);
    assert_eq!(result, Err(InterpretError::Runtime), "expected a runtime error:\n{}", source);
}

#[test]
fn arithmetic_precedence() {
    assert_eq!(run_ok("print 1 + 2 * 3;"), "7\n");
    assert_eq!(run_ok("print (1 + 2) * 3;"), "9\n");
    assert_eq!(run_ok("print 10 / 4;"), "2.5\n");
    assert_eq!(run_ok("print -(3 - 5);"), "2\n");
}

#[test]
fn string_literals_with_equal_bytes_share_identity() {
    assert_eq!(run_ok("var a = \"foo\"; var b = \"foo\"; print a == b;"), "true\n");
    assert_eq!(run_ok("print \"foo\" + \"bar\" == \"foobar\";"), "true\n");
}

#[test]
fn closures_count() {
    let source = "
        fun makeCounter() {
          var n = 0;
          fun inc() { n = n + 1; return n; }
          return inc;
        }
        var c = makeCounter();
        print c();
        print c();
        print c();
    ";
    assert_eq!(run_ok(source), "1\n2\n3\n");
}

#[test]
fn super_dispatches_to_the_superclass() {
    let source = "
        class A { f() { return \"A\"; } }
        class B < A { f() { return super.f() + \"B\"; } }
        print B().f();
    ";
    assert_eq!(run_ok(source), "AB\n");
}

#[test]
fn for_loop_accumulates() {
    assert_eq!(
        run_ok("var i = 0; for (var j = 0; j < 3; j = j + 1) { i = i + j; } print i;"),
        "3\n"
    );
}

#[test]
fn wrong_arity_is_a_runtime_error() {
    run_runtime_error("fun f(a,b) { return a+b; } print f(1);");
}

#[test]
fn string_concatenation() {
    assert_eq!(run_ok("print \"foo\" + \"bar\";"), "foobar\n");
    run_runtime_error("print \"foo\" + 1;");
}

#[test]
fn logical_operators_short_circuit_to_values() {
    assert_eq!(run_ok("print 1 and 2;"), "2\n");
    assert_eq!(run_ok("print nil and 2;"), "nil\n");
    assert_eq!(run_ok("print nil or \"fallback\";"), "fallback\n");
    assert_eq!(run_ok("print 1 or 2;"), "1\n");
    // the right operand must not run when short-circuited
    assert_eq!(run_ok("fun boom() { return nil + 1; } print false and boom();"), "false\n");
}

#[test]
fn upvalues_have_reference_semantics() {
    let source = "
        var get;
        {
          var a = \"old\";
          fun read() { return a; }
          get = read;
          a = \"new\";
        }
        print get();
    ";
    assert_eq!(run_ok(source), "new\n");
}

#[test]
fn sibling_closures_share_one_cell() {
    let source = "
        fun make() {
          var shared = 0;
          fun inc() { shared = shared + 1; }
          fun get() { return shared; }
          inc();
          inc();
          return get;
        }
        print make()();
    ";
    assert_eq!(run_ok(source), "2\n");
}

#[test]
fn bound_methods_remember_their_receiver() {
    let source = "
        class Greeter {
          hello() { return this.name + \" says hi\"; }
        }
        var g = Greeter();
        g.name = \"g\";
        var m = g.hello;
        print m();
    ";
    assert_eq!(run_ok(source), "g says hi\n");
}

#[test]
fn fields_shadow_methods() {
    let source = "
        class Box { label() { return \"method\"; } }
        var box = Box();
        print box.label();
        fun replacement() { return \"field\"; }
        box.label = replacement;
        print box.label();
    ";
    assert_eq!(run_ok(source), "method\nfield\n");
}

#[test]
fn initializers_return_the_instance() {
    let source = "
        class Point {
          init(x) {
            this.x = x;
            if (x > 0) return;
            this.x = 0 - x;
          }
        }
        print Point(3).x;
        print Point(-2).x;
    ";
    assert_eq!(run_ok(source), "3\n2\n");
}

#[test]
fn class_without_init_rejects_arguments() {
    run_runtime_error("class Empty {} Empty(1);");
    assert_eq!(run_ok("class Empty {} print Empty();"), "Empty instance\n");
}

#[test]
fn super_invoke_passes_arguments() {
    let source = "
        class A { add(a, b) { return a + b; } }
        class B < A { add(a, b) { return super.add(a, b) + 10; } }
        print B().add(1, 2);
    ";
    assert_eq!(run_ok(source), "13\n");
}

#[test]
fn subclass_methods_override() {
    let source = "
        class A { f() { return \"base\"; } g() { return \"kept\"; } }
        class B < A { f() { return \"override\"; } }
        var b = B();
        print b.f();
        print b.g();
    ";
    assert_eq!(run_ok(source), "override\nkept\n");
}

#[test]
fn truthiness_rules() {
    assert_eq!(run_ok("print !nil;"), "true\n");
    assert_eq!(run_ok("print !false;"), "true\n");
    assert_eq!(run_ok("print !0;"), "false\n");
    assert_eq!(run_ok("print !\"\";"), "false\n");
}

#[test]
fn equality_never_crosses_types() {
    assert_eq!(run_ok("print 1 == \"1\";"), "false\n");
    assert_eq!(run_ok("print nil == false;"), "false\n");
    assert_eq!(run_ok("print 2 != 3;"), "true\n");
}

#[test]
fn undefined_variables_fail_at_runtime() {
    run_runtime_error("print missing;");
    run_runtime_error("missing = 1;");
}

#[test]
fn only_functions_and_classes_are_callable() {
    run_runtime_error("var x = 1; x();");
    run_runtime_error("\"text\"();");
}

#[test]
fn properties_require_instances() {
    run_runtime_error("var x = 1; print x.field;");
    run_runtime_error("var x = 1; x.field = 2;");
    run_runtime_error("class C {} print C().absent;");
}

#[test]
fn operands_must_be_numbers() {
    run_runtime_error("print -nil;");
    run_runtime_error("print 1 < \"2\";");
}

#[test]
fn value_printing() {
    let source = "
        fun f() {}
        class Widget { method() {} }
        print f;
        print Widget;
        print Widget();
        print clock;
        print Widget().method;
        print nil;
        print true;
        print 2.5;
    ";
    assert_eq!(
        run_ok(source),
        "<fn f>\nWidget\nWidget instance\n<native fn>\n<fn method>\nnil\ntrue\n2.5\n"
    );
}

#[test]
fn while_loops_run() {
    assert_eq!(
        run_ok("var n = 1; while (n < 100) { n = n * 2; } print n;"),
        "128\n"
    );
}

#[test]
fn recursion_works() {
    let source = "
        fun fib(n) {
          if (n < 2) return n;
          return fib(n - 1) + fib(n - 2);
        }
        print fib(10);
    ";
    assert_eq!(run_ok(source), "55\n");
}

#[test]
fn locals_shadow_globals() {
    let source = "
        var a = \"global\";
        {
          var a = \"local\";
          print a;
        }
        print a;
    ";
    assert_eq!(run_ok(source), "local\nglobal\n");
}

#[test]
fn chained_assignment_leaves_the_value() {
    assert_eq!(run_ok("var a; var b; a = b = 7; print a; print b;"), "7\n7\n");
}

#[test]
fn statements_leave_the_stack_balanced() {
    // every statement kind in one program; imbalance would corrupt later
    // statements or trip the final script pop
    let source = "
        var g = 1;
        { var l = 2; l = l + g; }
        if (g > 0) { g = g + 1; } else { g = 0; }
        while (g < 5) { g = g + 1; }
        for (var i = 0; i < 2; i = i + 1) {}
        fun f(x) { return x; }
        f(g);
        class C { m() { return this; } }
        C().m();
        print g;
    ";
    assert_eq!(run_ok(source), "5\n");
}

#[test]
fn loop_heavy_string_churn() {
    // exercises interning plus collection of temporaries
    let source = "
        var s = \"\";
        for (var i = 0; i < 50; i = i + 1) { s = s + \"x\"; }
        var t = \"\";
        for (var i = 0; i < 50; i = i + 1) { t = t + \"x\"; }
        print s == t;
        print s == t + \"x\";
    ";
    assert_eq!(run_ok(source), "true\nfalse\n");
}

#[test]
fn expression_mode_prints_the_value() {
    let output = SharedOutput::default();
    let mut vm = Vm::with_output(Box::new(output.clone()));
    assert_eq!(vm.interpret_expression("1 + 2 * 3"), Ok(()));
    assert_eq!(String::from_utf8(output.0.borrow().clone()).unwrap(), "7\n");
}

#[test]
fn expression_mode_classifies_errors() {
    let mut vm = Vm::with_output(Box::new(io::sink()));
    assert_eq!(vm.interpret_expression("1 +"), Err(InterpretError::Compile));
    assert_eq!(
        vm.interpret_expression("1 + nil"),
        Err(InterpretError::Runtime)
    );
}

#[test]
fn globals_persist_across_interpret_calls() {
    let output = SharedOutput::default();
    let mut vm = Vm::with_output(Box::new(output.clone()));
    assert_eq!(vm.interpret("var count = 1;"), Ok(()));
    assert_eq!(vm.interpret("count = count + 1;"), Ok(()));
    assert_eq!(vm.interpret("print count;"), Ok(()));
    assert_eq!(String::from_utf8(output.0.borrow().clone()).unwrap(), "2\n");
}

#[test]
fn deeply_nested_closures_resolve_through_intermediates() {
    let source = "
        fun outer() {
          var x = \"through\";
          fun middle() {
            fun inner() { return x; }
            return inner;
          }
          return middle;
        }
        print outer()()();
    ";
    assert_eq!(run_ok(source), "through\n");
}

#[test]
fn methods_can_call_other_methods_via_this() {
    let source = "
        class Calc {
          double(n) { return n * 2; }
          quad(n) { return this.double(this.double(n)); }
        }
        print Calc().quad(3);
    ";
    assert_eq!(run_ok(source), "12\n");
}

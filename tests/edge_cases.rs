use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mdsql::{
    Args, Config, Engine, EvalError, Evaluator, ExprEvaluator, Function, PlaceholderStyle,
    RenderError, ResolutionError, Scope, Value,
};
use pretty_assertions::assert_eq;

fn engine(name: &str, sql: &str) -> Engine {
    let mut engine = Engine::new();
    engine.add_template("t", name, sql).unwrap();
    engine
}

fn ints(values: &[i64]) -> Vec<Value> {
    values.iter().copied().map(Value::Int).collect()
}

// ── Placeholders ──

#[test]
fn list_placeholder_expands_in_order() {
    let engine = engine("q", "select * from t where id = @id and id in (@ids)");
    let q = engine
        .render("t.q", Scope::new().with("id", 1).with("ids", vec![1, 2, 3]))
        .unwrap();
    assert_eq!(q.sql, "select * from t where id = ? and id in (?, ?, ?)");
    assert_eq!(q.params, ints(&[1, 1, 2, 3]));
}

#[test]
fn expression_placeholder_is_parameterized() {
    let engine = engine("q", "limit @ size @ offset @ (page - 1) * size @");
    let q = engine
        .render("t.q", Scope::new().with("page", 3).with("size", 20))
        .unwrap();
    assert_eq!(q.sql, "limit ? offset ?");
    assert_eq!(q.params, ints(&[20, 40]));
}

#[test]
fn raw_output_bypasses_params() {
    let engine = engine("q", "select * from @=table@_log order by @= col + \" desc\" @");
    let q = engine
        .render("t.q", Scope::new().with("table", "user").with("col", "id"))
        .unwrap();
    assert_eq!(q.sql, "select * from user_log order by id desc");
    assert!(q.params.is_empty());
}

#[test]
fn literal_at_signs() {
    let engine = engine("q", "select 'a@@b.c' as mail, @ x @ as x");
    let q = engine.render("t.q", Scope::new().with("x", 1)).unwrap();
    assert_eq!(q.sql, "select 'a@b.c' as mail, ? as x");
}

#[test]
fn missing_variable_fails_without_output() {
    let engine = engine("q", "select *\nfrom t\nwhere id = @id");
    let err = engine.render("t.q", ()).unwrap_err();
    assert_eq!(err.template, "t.q");
    assert_eq!(
        err.source,
        RenderError::MissingVariable {
            name: "id".into(),
            line: 3
        }
    );
}

// ── Conditional lines ──

const FILTER: &str = "select * from t
where 1 = 1
  and a = @a?
  and b = @b";

#[test]
fn conditional_missing_drops_the_line() {
    let engine = engine("q", FILTER);
    let q = engine.render("t.q", Scope::new().with("b", 2)).unwrap();
    assert_eq!(q.sql, "select * from t\nwhere 1 = 1\n  and b = ?");
    assert_eq!(q.params, ints(&[2]));
}

#[test]
fn conditional_zero_value_drops_the_line() {
    let engine = engine("q", FILTER);
    let q = engine
        .render("t.q", Scope::new().with("a", 0).with("b", 2))
        .unwrap();
    assert_eq!(q.sql, "select * from t\nwhere 1 = 1\n  and b = ?");
}

#[test]
fn conditional_truthy_renders_normally() {
    let engine = engine("q", FILTER);
    let q = engine
        .render("t.q", Scope::new().with("a", 5).with("b", 2))
        .unwrap();
    assert_eq!(q.sql, "select * from t\nwhere 1 = 1\n  and a = ?\n  and b = ?");
    assert_eq!(q.params, ints(&[5, 2]));
}

#[test]
fn rollback_retracts_params_pushed_earlier_on_the_line() {
    let engine = engine("q", "select 1\n and x = @x and y = @y?\n and z = @z");
    let q = engine
        .render("t.q", Scope::new().with("x", 1).with("z", 3))
        .unwrap();
    assert_eq!(q.sql, "select 1\n and z = ?");
    assert_eq!(q.params, ints(&[3]));
}

#[test]
fn conditional_raw_and_expression_forms() {
    let engine = engine("q", "select 1\norder by @=sort?\nlimit @ n @?\n;");
    let q = engine.render("t.q", ()).unwrap();
    assert_eq!(q.sql, "select 1\n;");

    let q = engine
        .render("t.q", Scope::new().with("sort", "id").with("n", 5))
        .unwrap();
    assert_eq!(q.sql, "select 1\norder by id\nlimit ?\n;");
}

#[test]
fn line_guard() {
    let engine = engine("q", "select *\nfrom t\n@? admin @ where owner = @owner\nlimit 1");
    let q = engine.render("t.q", Scope::new().with("admin", false)).unwrap();
    assert_eq!(q.sql, "select *\nfrom t\nlimit 1");

    let q = engine
        .render("t.q", Scope::new().with("admin", true).with("owner", 9))
        .unwrap();
    assert_eq!(q.sql, "select *\nfrom t\n where owner = ?\nlimit 1");
    assert_eq!(q.params, ints(&[9]));
}

#[test]
fn line_guard_on_an_elided_line_ends_with_it() {
    let engine = engine("q", "select 1\n and a = @a? @? b @ and b = 1\nlimit 5");
    let q = engine.render("t.q", Scope::new().with("b", true)).unwrap();
    assert_eq!(q.sql, "select 1\nlimit 5");
}

#[test]
fn function_block_on_an_elided_line_is_not_run() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut engine = engine("q", "select 1\n and a = @a? and @ wrap() {b = @b}\nlimit 5");
    let counter = Arc::clone(&calls);
    engine.register_callable(
        "wrap",
        Function::with_query(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }),
    );

    let q = engine.render("t.q", ()).unwrap();
    assert_eq!(q.sql, "select 1\nlimit 5");
    assert!(q.params.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let q = engine
        .render("t.q", Scope::new().with("a", 1).with("b", 2))
        .unwrap();
    assert_eq!(q.sql, "select 1\n and a = ? and b = ?\nlimit 5");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ── Control flow ──

#[test]
fn if_else_if_else() {
    let engine = engine(
        "q",
        "x = @if a == 1 {one} else if a == 2 {two} else {other};",
    );
    let render = |a: i64| engine.render("t.q", Scope::new().with("a", a)).unwrap().sql;
    assert_eq!(render(1), "x = one;");
    assert_eq!(render(2), "x = two;");
    assert_eq!(render(3), "x = other;");
}

#[test]
fn counted_loop_runs_three_times() {
    let engine = engine("q", "@for i := 0; i < 3; i++ { and col@=i@ = @i}");
    let q = engine.render("t.q", ()).unwrap();
    assert_eq!(q.sql, " and col0 = ? and col1 = ? and col2 = ?");
    assert_eq!(q.params, ints(&[0, 1, 2]));
}

#[test]
fn counted_loop_with_step_and_decrement() {
    let engine = engine("q", "@for i := 10; i > 0; i -= 4 {@=i@,}|@for j := 2; j > 0; j-- {@=j@,}");
    assert_eq!(engine.render("t.q", ()).unwrap().sql, "10,6,2,|2,1,");
}

#[test]
fn range_loop_binds_index_and_element() {
    let engine = engine(
        "q",
        "insert into t values @for i, row := range rows {@if i > 0 {, }(@ row.id @, @ row.name @)}",
    );
    let rows = Value::from(serde_json::json!([
        {"id": 1, "name": "a"},
        {"id": 2, "name": "b"},
    ]));
    let q = engine.render("t.q", Scope::new().with("rows", rows)).unwrap();
    assert_eq!(q.sql, "insert into t values (?, ?), (?, ?)");
    assert_eq!(
        q.params,
        vec![Value::Int(1), Value::from("a"), Value::Int(2), Value::from("b")]
    );
}

#[test]
fn range_loop_with_discarded_key() {
    let engine = engine("q", "@for _, v := range vs {@v;}");
    let q = engine.render("t.q", Scope::new().with("vs", vec!["x", "y"])).unwrap();
    assert_eq!(q.sql, "?;?;");
    assert_eq!(q.params, vec![Value::from("x"), Value::from("y")]);
}

#[test]
fn range_loop_with_one_variable_binds_index_or_key() {
    let engine = engine("q", "@for i := range xs {@i;}");
    let q = engine.render("t.q", Scope::new().with("xs", vec!["a", "b"])).unwrap();
    assert_eq!(q.sql, "?;?;");
    assert_eq!(q.params, ints(&[0, 1]));

    let map = Value::from(serde_json::json!({"y": 2, "x": 1}));
    let q = engine.render("t.q", Scope::new().with("xs", map)).unwrap();
    assert_eq!(q.params, vec![Value::from("x"), Value::from("y")]);
}

#[test]
fn range_over_scalar_is_an_error() {
    let engine = engine("q", "@for i := range n {@i}");
    let err = engine.render("t.q", Scope::new().with("n", 4)).unwrap_err();
    assert_eq!(
        err.source,
        RenderError::UnsupportedRange {
            type_name: "int",
            line: 1
        }
    );
}

#[test]
fn malformed_loop_header() {
    let engine = engine("q", "@for i := 0; i < 3 {x}");
    assert!(matches!(
        engine.render("t.q", ()).unwrap_err().source,
        RenderError::InvalidLoop { .. }
    ));
}

#[test]
fn loop_variables_do_not_leak() {
    let engine = engine("q", "@for i := 0; i < 2; i++ {}@i");
    let err = engine.render("t.q", ()).unwrap_err();
    assert!(matches!(err.source, RenderError::MissingVariable { ref name, .. } if name == "i"));

    let q = engine.render("t.q", Scope::new().with("i", 42)).unwrap();
    assert_eq!(q.params, ints(&[42]));
}

#[test]
fn code_block_mutates_scope() {
    let engine = engine("q", "@{\n  n := len(ids)\n  n += 1\n}select @n");
    let q = engine.render("t.q", Scope::new().with("ids", vec![1, 2])).unwrap();
    assert_eq!(q.sql, "select ?");
    assert_eq!(q.params, ints(&[3]));
}

#[test]
fn evaluation_errors_carry_the_expression() {
    let engine = engine("q", "select\n@if a / 0 > 1 {x}");
    let err = engine.render("t.q", Scope::new().with("a", 1)).unwrap_err();
    assert_eq!(
        err.source,
        RenderError::Eval {
            expr: "a / 0 > 1".into(),
            line: 2,
            source: EvalError::DivisionByZero,
        }
    );
}

// ── Paths and engine surface ──

#[test]
fn invalid_and_unknown_paths() {
    let engine = engine("q", "select 1");
    assert_eq!(
        engine.render("t", ()).unwrap_err().source,
        RenderError::Resolution(ResolutionError::InvalidPath("t".into()))
    );
    assert_eq!(
        engine.render("t.nope", ()).unwrap_err().source,
        RenderError::Resolution(ResolutionError::TemplateNotFound("t.nope".into()))
    );
}

#[test]
fn rendering_is_repeatable() {
    let engine = engine("q", "a = @a?\nb in (@b)\n@for i := 0; i < 2; i++ {@i}");
    let scope = Scope::new().with("b", vec![1, 2]);
    let first = engine.render("t.q", scope.clone()).unwrap();
    let second = engine.render("t.q", scope).unwrap();
    assert_eq!(first, second);
}

#[test]
fn numbered_placeholder_styles() {
    let mut engine = Engine::with_config(Config {
        placeholder: PlaceholderStyle::Dollar,
        ..Config::default()
    });
    engine
        .add_template("t", "q", "select 1\nwhere a = @a?\n and b in (@b)\n and c = @c")
        .unwrap();
    let q = engine
        .render("t.q", Scope::new().with("b", vec![1, 2]).with("c", 3))
        .unwrap();
    assert_eq!(q.sql, "select 1\n and b in ($1, $2)\n and c = $3");
}

#[test]
fn serialized_arguments() {
    #[derive(serde::Serialize)]
    struct Filter {
        name: String,
        tags: Vec<&'static str>,
        limit: Option<i64>,
    }

    let engine = engine("q", "select * from t where name = @name and tag in (@tags)\nlimit @limit?");
    let args = Args::serialize(&Filter {
        name: "ann".into(),
        tags: vec!["a", "b"],
        limit: None,
    })
    .unwrap();
    let q = engine.render("t.q", args).unwrap();
    assert_eq!(q.sql, "select * from t where name = ? and tag in (?, ?)\n");
    assert_eq!(
        q.params,
        vec![Value::from("ann"), Value::from("a"), Value::from("b")]
    );
}

#[test]
fn registered_callables_in_expressions() {
    let mut engine = engine("q", "where name = @ upper(name) @");
    engine.register_callable(
        "upper",
        Function::new(|args| match args {
            [Value::String(s)] => Ok(Value::from(s.to_uppercase())),
            _ => Err(EvalError::call("upper", "expects one string")),
        }),
    );
    let q = engine.render("t.q", Scope::new().with("name", "ann")).unwrap();
    assert_eq!(q.params, vec![Value::from("ANN")]);
}

/// Only `true` is truthy.
struct StrictEvaluator;

impl Evaluator for StrictEvaluator {
    fn evaluate(&self, expr: &str, scope: &Scope) -> Result<Value, EvalError> {
        ExprEvaluator.evaluate(expr, scope)
    }

    fn execute(&self, code: &str, scope: &mut Scope) -> Result<(), EvalError> {
        ExprEvaluator.execute(code, scope)
    }

    fn resolve_call(&self, expr: &str, scope: &Scope) -> Result<(String, Vec<Value>), EvalError> {
        ExprEvaluator.resolve_call(expr, scope)
    }

    fn truthy(&self, value: &Value) -> bool {
        *value == Value::Bool(true)
    }
}

#[test]
fn custom_evaluator_decides_truthiness() {
    let mut engine = Engine::new().with_evaluator(StrictEvaluator);
    engine.add_template("t", "q", "a\n and n = @n?\nb").unwrap();
    let q = engine.render("t.q", Scope::new().with("n", 5)).unwrap();
    assert_eq!(q.sql, "a\nb");
}

use constructbin::environment::Environment;
use constructbin::error::ImageError;
use constructbin::expression::{Expr, Function, Value, MAX_EXPRESSION_DEPTH};

#[test]
fn reset_asserts_each_fact_once_in_traversal_order() {
    let mut env = Environment::new();
    env.define_module("ROOMS").expect("module");
    env.define_deffacts("ROOMS", "upstairs", vec![Expr::fact("room", vec![Expr::symbol("attic")])])
        .expect("deffacts");
    env.define_deffacts(
        "MAIN",
        "downstairs",
        vec![
            Expr::fact("room", vec![Expr::symbol("hall")]),
            Expr::fact("room", vec![Expr::symbol("attic")]),
        ],
    )
    .expect("deffacts");
    env.reset().expect("reset");
    let facts: Vec<String> = env.facts().iter().map(|f| f.to_string()).collect();
    assert_eq!(facts, vec!["(room hall)", "(room attic)"]);

    env.reset().expect("second reset");
    assert_eq!(env.facts().len(), 2);
}

#[test]
fn fact_fields_are_evaluated() {
    let mut env = Environment::new();
    env.define_deffacts(
        "MAIN",
        "calc",
        vec![Expr::fact(
            "result",
            vec![
                Expr::Call(Function::Subtract, vec![Expr::Integer(10), Expr::Integer(3), Expr::Integer(2)]),
                Expr::Call(Function::Add, vec![Expr::Integer(1), Expr::Float(0.25)]),
                Expr::Call(Function::StrCat, vec![Expr::symbol("id-"), Expr::Integer(9)]),
            ],
        )],
    )
    .expect("deffacts");
    env.reset().expect("reset");
    assert_eq!(
        env.facts()[0].fields,
        vec![Value::Integer(5), Value::Float(1.25), Value::Str(String::from("id-9"))]
    );
}

#[test]
fn globals_take_their_initial_value_on_reset() {
    let mut env = Environment::new();
    env.define_defglobal(
        "MAIN",
        "area",
        Expr::Call(Function::Multiply, vec![Expr::Integer(6), Expr::Integer(7)]),
    )
    .expect("defglobal");
    assert_eq!(env.global_value("area"), None);
    env.reset().expect("reset");
    assert_eq!(env.global_value("area"), Some(&Value::Integer(42)));

    let mut loaded = Environment::new();
    loaded.bload_from_slice(&env.bsave_to_vec().expect("bsave")).expect("bload");
    assert_eq!(loaded.global_value("area"), None);
    loaded.reset().expect("reset");
    assert_eq!(loaded.global_value("area"), Some(&Value::Integer(42)));
}

#[test]
fn arithmetic_on_symbols_is_an_evaluation_error() {
    let mut env = Environment::new();
    env.define_deffacts(
        "MAIN",
        "broken",
        vec![Expr::fact("bad", vec![Expr::Call(Function::Add, vec![Expr::symbol("one"), Expr::Integer(1)])])],
    )
    .expect("deffacts");
    assert!(matches!(env.reset().unwrap_err(), ImageError::Evaluation(_)));
}

#[test]
fn integer_overflow_is_an_evaluation_error() {
    let mut env = Environment::new();
    env.define_defglobal(
        "MAIN",
        "huge",
        Expr::Call(Function::Multiply, vec![Expr::Integer(i64::MAX), Expr::Integer(2)]),
    )
    .expect("defglobal");
    assert!(matches!(env.reset().unwrap_err(), ImageError::Evaluation(_)));
}

fn nested_sum(depth: usize) -> Expr {
    let mut expr = Expr::Integer(1);
    for _ in 1..depth {
        expr = Expr::Call(Function::Add, vec![expr]);
    }
    expr
}

#[test]
fn definitions_nested_past_the_limit_are_rejected() {
    let mut env = Environment::new();
    env.define_defglobal("MAIN", "deep", nested_sum(MAX_EXPRESSION_DEPTH))
        .expect("defglobal at the limit");
    env.reset().expect("reset");
    assert_eq!(env.global_value("deep"), Some(&Value::Integer(1)));

    let cells = env.expressions().len();
    let error = env
        .define_defglobal("MAIN", "deep", nested_sum(MAX_EXPRESSION_DEPTH + 1))
        .unwrap_err();
    assert!(matches!(error, ImageError::Evaluation(_)));
    assert_eq!(env.expressions().len(), cells);
    assert_eq!(env.defglobals().count(), 1);

    let mut loaded = Environment::new();
    loaded.bload_from_slice(&env.bsave_to_vec().expect("bsave")).expect("bload");
    loaded.reset().expect("reset");
    assert_eq!(loaded.global_value("deep"), Some(&Value::Integer(1)));
}

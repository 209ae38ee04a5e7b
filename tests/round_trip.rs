use constructbin::construct::{Deffacts, Defglobal};
use constructbin::environment::Environment;
use constructbin::expression::{Expr, Function, Value};

fn sensors() -> Environment {
    let mut env = Environment::new();
    env.define_module("SENSORS").expect("module");
    env.define_module("ALARMS").expect("module");
    env.define_deffacts("MAIN", "startup", vec![Expr::fact("phase", vec![Expr::symbol("boot")])])
        .expect("deffacts");
    env.define_deffacts(
        "SENSORS",
        "readings",
        vec![
            Expr::fact("reading", vec![Expr::symbol("kitchen"), Expr::Integer(21)]),
            Expr::fact(
                "reading",
                vec![
                    Expr::symbol("hall"),
                    Expr::Call(Function::Add, vec![Expr::Integer(18), Expr::Float(0.5)]),
                ],
            ),
        ],
    )
    .expect("deffacts");
    env.define_deffacts("SENSORS", "quiet", vec![]).expect("deffacts");
    env.define_deffacts(
        "ALARMS",
        "labels",
        vec![Expr::fact(
            "label",
            vec![Expr::Call(Function::StrCat, vec![Expr::string("zone-"), Expr::Integer(7)])],
        )],
    )
    .expect("deffacts");
    env.define_defglobal(
        "ALARMS",
        "threshold",
        Expr::Call(Function::Multiply, vec![Expr::Integer(4), Expr::Integer(5)]),
    )
    .expect("defglobal");
    env
}

fn layout(env: &Environment) -> Vec<(String, String, Vec<Expr>)> {
    env.deffacts()
        .map(|(module, _, item)| {
            (
                env.module_name(module).unwrap().to_owned(),
                env.construct_name(item).unwrap().to_owned(),
                env.payload(item).unwrap(),
            )
        })
        .collect()
}

#[test]
fn loaded_constructs_match_the_saved_ones() {
    let mut original = sensors();
    let image = original.bsave_to_vec().expect("bsave");

    let mut loaded = Environment::new();
    loaded.bload_from_slice(&image).expect("bload");
    assert!(loaded.is_bloaded());
    assert_eq!(loaded.module_names(), vec!["MAIN", "SENSORS", "ALARMS"]);
    assert_eq!(layout(&loaded), layout(&original));

    original.reset().expect("reset");
    loaded.reset().expect("reset");
    assert_eq!(loaded.facts(), original.facts());
    assert_eq!(loaded.global_value("threshold"), Some(&Value::Integer(20)));
}

#[test]
fn owners_resolve_to_the_same_module_by_name() {
    let image = sensors().bsave_to_vec().expect("bsave");
    let mut loaded = Environment::new();
    loaded.bload_from_slice(&image).expect("bload");

    let (_, readings) = loaded.find_deffacts("readings").expect("readings");
    assert_eq!(loaded.module_name(readings.header.module), Some("SENSORS"));
    let (_, threshold) = loaded.find_construct::<Defglobal>("threshold").expect("threshold");
    assert_eq!(loaded.module_name(threshold.header.module), Some("ALARMS"));

    let sensors = loaded.find_module("SENSORS").unwrap();
    let names: Vec<&str> = loaded
        .module_constructs::<Deffacts>(sensors)
        .map(|(_, _, item)| loaded.construct_name(item).unwrap())
        .collect();
    assert_eq!(names, vec!["readings", "quiet"]);
}

#[test]
fn saving_a_loaded_image_reproduces_it() {
    let image = sensors().bsave_to_vec().expect("bsave");
    let mut loaded = Environment::new();
    loaded.bload_from_slice(&image).expect("bload");
    assert_eq!(loaded.bsave_to_vec().expect("bsave"), image);
}

#[test]
fn undefined_constructs_leave_no_gap_in_the_image() {
    let mut env = sensors();
    env.undefine_deffacts("readings").expect("undefine");
    env.define_deffacts("SENSORS", "late", vec![Expr::fact("late", vec![])]).expect("deffacts");
    let ctx = env.count().expect("count");
    let indices: Vec<u32> = env
        .deffacts()
        .map(|(_, id, _)| ctx.instance_index("deffacts", id).unwrap())
        .collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);

    let image = env.bsave_to_vec().expect("bsave");
    let mut loaded = Environment::new();
    loaded.bload_from_slice(&image).expect("bload");
    assert_eq!(layout(&loaded), layout(&env));
}

#[test]
fn images_round_trip_through_files() {
    let path = std::env::temp_dir().join("constructbin_round_trip.bin");
    let _ = std::fs::remove_file(&path);
    let written = sensors().bsave(&path).expect("bsave");
    assert_eq!(written as u64, std::fs::metadata(&path).unwrap().len());

    let mut loaded = Environment::new();
    loaded.bload(&path).expect("bload");
    assert_eq!(loaded.deffacts().count(), 4);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn loading_replaces_whatever_was_defined() {
    let image = sensors().bsave_to_vec().expect("bsave");
    let mut env = Environment::new();
    env.define_module("OTHER").expect("module");
    env.define_deffacts("OTHER", "gone", vec![Expr::fact("gone", vec![])]).expect("deffacts");
    env.bload_from_slice(&image).expect("bload");
    assert!(env.find_deffacts("gone").is_none());
    assert!(env.find_module("OTHER").is_none());
    assert_eq!(env.deffacts().count(), 4);
}

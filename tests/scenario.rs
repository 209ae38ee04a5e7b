use constructbin::construct::Deffacts;
use constructbin::environment::Environment;
use constructbin::expression::Expr;

/// Two modules: the first holds fact1 and fact2, the second holds fact3.
/// Only fact2 has a payload, a list of three facts.
fn two_modules() -> Environment {
    let mut env = Environment::new();
    env.define_module("B").expect("module");
    env.define_deffacts("MAIN", "fact1", vec![]).expect("fact1");
    env.define_deffacts(
        "MAIN",
        "fact2",
        vec![
            Expr::fact("first", vec![]),
            Expr::fact("second", vec![]),
            Expr::fact("third", vec![]),
        ],
    )
    .expect("fact2");
    env.define_deffacts("B", "fact3", vec![]).expect("fact3");
    env
}

#[test]
fn counting_numbers_instances_densely() {
    let env = two_modules();
    let ctx = env.count().expect("count");
    let kind = ctx.kind("deffacts").expect("deffacts counted");
    assert_eq!(kind.modules, 2);
    assert_eq!(kind.instances, 3);
    assert_eq!(kind.expression_cells, 3);
    assert_eq!(ctx.expression_count(), 3);

    for (name, expected) in [("fact1", 0), ("fact2", 1), ("fact3", 2)] {
        let (id, _) = env.find_deffacts(name).expect("defined");
        assert_eq!(ctx.instance_index("deffacts", id), Some(expected), "{}", name);
    }
}

#[test]
fn only_the_payload_carrier_points_into_the_expression_section() {
    let image = two_modules().bsave_to_vec().expect("bsave");
    let mut env = Environment::new();
    env.bload_from_slice(&image).expect("bload");

    let loaded = env.loaded_image::<Deffacts>();
    assert_eq!(loaded.counts(), (3, 2));
    let instances = loaded.instances();
    assert!(instances[0].assert_list.is_none());
    assert!(instances[2].assert_list.is_none());
    let payload = env.payload(&instances[1]).expect("payload");
    assert_eq!(payload.len(), 3);
    assert_eq!(payload[2], Expr::fact("third", vec![]));

    let main = loaded.module_reference(0).expect("MAIN item");
    let b = loaded.module_reference(1).expect("B item");
    assert_eq!((main.first.map(|c| c.index()), main.last.map(|c| c.index())), (Some(0), Some(1)));
    assert_eq!((b.first.map(|c| c.index()), b.last.map(|c| c.index())), (Some(2), Some(2)));
    assert!(loaded.module_reference(2).is_none());
}

#[test]
fn loaded_instances_chain_within_their_module() {
    let image = two_modules().bsave_to_vec().expect("bsave");
    let mut env = Environment::new();
    env.bload_from_slice(&image).expect("bload");
    let instances = env.loaded_image::<Deffacts>().instances();
    assert_eq!(instances[0].header.next.map(|c| c.index()), Some(1));
    assert!(instances[1].header.next.is_none());
    assert!(instances[2].header.next.is_none());
    assert!(instances.iter().all(|i| i.header.pp_form.is_none() && i.header.user_data.is_none()));
}

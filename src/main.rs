use std::env;
use std::process::ExitCode;

use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use constructbin::environment::Environment;
use constructbin::error::{ImageError, Result};
use constructbin::expression::{Expr, Fact, Function, Value};
use constructbin::settings::Settings;

const USAGE: &str = "constructbin <save|load> <path>";

#[derive(Serialize)]
struct DeffactsSummary {
    name: String,
    module: String,
    facts: usize,
}

#[derive(Serialize)]
struct Summary {
    modules: Vec<String>,
    deffacts: Vec<DeffactsSummary>,
    globals: Vec<(String, Option<Value>)>,
    facts: Vec<String>,
}

/// A small environment to have something to save.
fn demo(settings: Settings) -> Result<Environment> {
    let mut env = Environment::with_settings(settings);
    env.define_module("SENSORS")?;
    env.define_deffacts("MAIN", "startup", vec![Expr::fact("phase", vec![Expr::symbol("boot")])])?;
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
    )?;
    env.define_defglobal(
        "SENSORS",
        "threshold",
        Expr::Call(Function::Multiply, vec![Expr::Integer(4), Expr::Integer(5)]),
    )?;
    Ok(env)
}

fn summarize(env: &Environment) -> Summary {
    let deffacts = env
        .deffacts()
        .map(|(module, _, item)| DeffactsSummary {
            name: env.construct_name(item).unwrap_or_default().to_owned(),
            module: env.module_name(module).unwrap_or_default().to_owned(),
            facts: env.payload(item).map(|p| p.len()).unwrap_or(0),
        })
        .collect();
    let globals = env
        .defglobals()
        .map(|(_, _, global)| {
            (env.construct_name(global).unwrap_or_default().to_owned(), global.value.clone())
        })
        .collect();
    Summary {
        modules: env.module_names().into_iter().map(str::to_owned).collect(),
        deffacts,
        globals,
        facts: env.facts().iter().map(Fact::to_string).collect(),
    }
}

fn run(command: &str, path: &str, settings: Settings) -> Result<()> {
    match command {
        "save" => {
            let env = demo(settings)?;
            let bytes = env.bsave(path)?;
            info!(path, bytes, "saved demo environment");
        }
        "load" => {
            let mut env = Environment::with_settings(settings);
            env.bload(path)?;
            env.reset()?;
            let summary = serde_json::to_string_pretty(&summarize(&env))
                .map_err(|e| ImageError::Invariant(e.to_string()))?;
            println!("{}", summary);
        }
        other => return Err(ImageError::Usage(format!("unknown command '{}', expected {}", other, USAGE))),
    }
    Ok(())
}

fn main() -> ExitCode {
    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: {}", USAGE);
        return ExitCode::FAILURE;
    }
    match run(&args[1], &args[2], settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ ImageError::Usage(_)) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

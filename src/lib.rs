//! Constructbin – binary save and load of rule-engine constructs.
//!
//! A rule-engine environment holds *constructs*: named top-level entities
//! such as `deffacts` (a list of facts asserted on reset) or `defglobal` (a
//! global variable with an initial value). Every construct belongs to one
//! module and sits in that module's list of constructs of its kind.
//!
//! This crate writes a whole environment into one relocatable binary image
//! (*bsave*) and reconstitutes it in another environment (*bload*):
//! * Every reference between entities is written as a dense index into the
//!   image, never as an address.
//! * Saving is two-phase. A counting pass numbers every construct and
//!   totals the expression cells it owns into a [`persist::SaveContext`],
//!   then the write passes emit storage and records from that context.
//! * Loading reads counts first, allocates the arrays, then relocates module
//!   records before instance records, turning indexes into typed ids.
//!
//! ## Modules
//! * [`symbol`] – Interned atoms with reference counts.
//! * [`expression`] – Expression cells, their arena and their evaluation.
//! * [`construct`] – Ids, construct headers, modules and per-module construct lists.
//! * [`persist`] – Binary primitives, the save context and the [`persist::BinaryItem`] framework.
//! * [`image`] – The per-kind record format and the loaded image lifecycle.
//! * [`environment`] – The [`environment::Environment`] tying all of it together.
//! * [`settings`] – Validation and logging settings read through `config`.
//!
//! ## Image Layout
//! An image starts with a magic prefix and a version string, followed by the
//! shared symbol, function and expression sections. Then comes one storage
//! section per registered item and one record section per registered item,
//! each introduced by the item's name and a byte count, so a loader can skip
//! items it does not know. A blake3 digest of everything before it closes
//! the image.
//!
//! ## Quick Start
//! ```
//! use constructbin::environment::Environment;
//! use constructbin::expression::Expr;
//!
//! let mut env = Environment::new();
//! env.define_module("SENSORS").unwrap();
//! env.define_deffacts("SENSORS", "startup", vec![
//!     Expr::fact("reading", vec![Expr::symbol("kitchen"), Expr::Integer(21)]),
//! ]).unwrap();
//! let image = env.bsave_to_vec().unwrap();
//!
//! let mut restored = Environment::new();
//! restored.bload_from_slice(&image).unwrap();
//! restored.reset().unwrap();
//! assert_eq!(restored.facts()[0].to_string(), "(reading kitchen 21)");
//! ```
//!
//! ## Concurrency
//! An [`environment::Environment`] is a plain value. Saving borrows it
//! immutably and loading borrows it mutably, so the borrow checker already
//! rules out a save racing a load on the same environment.

pub mod construct;
pub mod environment;
pub mod error;
pub mod expression;
pub mod image;
pub mod persist;
pub mod settings;
pub mod symbol;

//! Opal compiler library.
//!
//! Two stages over the core value space: the [`parser`] reads source bytes
//! into form trees, and [`compile`] lowers a form into a FuncDef wrapped in
//! a ready-to-run closure. [`eval`] chains reader, compiler and VM for
//! hosts that just want a result.

pub mod compile;
pub mod parser;
pub mod scope;

pub use compile::{compile, eval};
pub use parser::{ParseError, parse_all};

//! Skink - a native-code compiler for a small Scheme-like language
//!
//! This library compiles alpha-converted core forms down to an abstract
//! register machine with a CPS calling convention, a tagged-pointer object
//! model and a generated two-space copying collector, then executes the
//! result on the bundled instruction-stream evaluator.

pub mod compiler;
pub mod config;
pub mod instr;
pub mod runtime;

// Re-export commonly used types
pub use compiler::{compile, compile_and_run, compile_with_foreigns, CompiledProgram};
pub use config::{CompilerOptions, LivenessMode};
pub use runtime::layout::Word;
pub use runtime::machine::Machine;

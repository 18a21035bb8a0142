//! pvm: a p-code virtual machine.
//!
//! A [`Program`] is a flat array of instructions plus tables of external
//! (native) and exported (callable from native code) routines. A [`Runtime`]
//! owns one program and executes it with a per-thread [`vm::Interpreter`]
//! built around two stacks: a native byte stack for activation frames and a
//! calculator stack for operands. Strings and vectors are reference counted
//! with copy-on-write semantics ([`AnyValue`], [`VectorDataPtr`]).

pub mod any;
pub mod config;
pub mod program;
pub mod stack;
pub mod vector;
pub mod vm;

pub use any::AnyValue;
pub use any::manager::{AnyManager, ManagerRef};
pub use config::{ConfigError, RuntimeConfig};
pub use program::{ExportedRoutine, ExternalRoutine, FfiType, Instruction, OpCode, Param, Program};
pub use vector::{ScalarType, VectorDataPtr};
pub use vm::{ErrorKind, ExecResult, Outcome, Runtime, RuntimeData, StaticRuntimeData, Trap, VmError};

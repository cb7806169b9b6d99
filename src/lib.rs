// Copyright 2026 The Arraycalc Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Compiler and evaluator for array-calc expressions: infix formulas
//! over 16 scalar variables (`A`..`P`) and 12 array variables
//! (`AA`..`LL`), with assignment, conditionals, iteration, subranges
//! and a library of array reductions and transforms.
//!
//! [`compile`] turns an expression string into a [`Program`]; a [`Vm`]
//! evaluates programs against caller-owned [`Bindings`], drawing
//! intermediate array storage from a shared [`ScratchPool`]:
//!
//! ```
//! use std::sync::Arc;
//! use arraycalc::{compile, Bindings, ScratchPool, Vm};
//!
//! let program = compile("B:=2; A*B + 1").unwrap();
//! let pool = Arc::new(ScratchPool::new());
//! let mut vm = Vm::new(pool);
//!
//! let mut scalars = [3.0, 0.0];
//! let mut bindings = Bindings::new(&mut scalars, &mut []);
//! let outcome = vm.eval(&program, &mut bindings, 1).unwrap();
//! assert_eq!(7.0, outcome.scalar);
//! ```

#![forbid(unsafe_code)]

pub mod common;

mod builtins;
mod bytecode;
mod compiler;
mod pool;
mod token;
mod vm;

pub use crate::bytecode::{Program, MAX_ARRAYS, MAX_SCALARS};
pub use crate::common::{EquationError, Error, ErrorCode, ErrorKind};
pub use crate::compiler::compile;
pub use crate::pool::{PoolStats, ScratchBuf, ScratchPool};
pub use crate::vm::{Bindings, Outcome, Vm, DEFAULT_LOOP_MAX};

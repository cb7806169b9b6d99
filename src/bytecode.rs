// Copyright 2026 The Arraycalc Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::HashMap;

use ordered_float::OrderedFloat;

pub(crate) type LiteralId = u16;
pub(crate) type SlotId = u8;
pub(crate) type PcOffset = u16;

/// Evaluation stack capacity, in operands.  Enforced statically by the
/// compiler's stack-effect accounting and defensively by the VM.
pub(crate) const STACK_MAX: usize = 20;

/// Scalar slots `A`..`P`.
pub const MAX_SCALARS: usize = 16;
/// Array slots `AA`..`LL`.
pub const MAX_ARRAYS: usize = 12;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Op2 {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Neq,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Max,
    Min,
    Atan2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Op1 {
    Neg,
    Abs,
    Sqrt,
    Exp,
    Log10,
    Ln,
    Acos,
    Asin,
    Atan,
    Cos,
    Sin,
    Tan,
    Cosh,
    Sinh,
    Tanh,
    Ceil,
    Floor,
    IsInf,
    Nint,
    BitNot,
    Not,
}

/// Array-to-scalar reductions over the operand's active window.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Reduce {
    Max,
    Min,
    ArgMax,
    ArgMin,
    FirstZero,
    FirstNonzero,
    Average,
    StdDev,
    Fwhm,
    Sum,
}

/// Array-to-array transforms; results land in the window positions,
/// zero elsewhere.  NSmooth, NDeriv and FitMPoly pop one extra operand.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Transform {
    Cum,
    Smooth,
    NSmooth,
    Deriv,
    NDeriv,
    FitPoly,
    FitMPoly,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum VarargFn {
    Min,
    Max,
    Finite,
    IsNan,
    FitQ,
    FitMQ,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ConstId {
    Pi,
    DegToRad,
    RadToDeg,
    SecToRad,
    RadToSec,
    Random,
    NormalRandom,
    ArrayRandom,
    Index,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum Opcode {
    LoadConstant { id: LiteralId },
    LoadInt { value: i16 },
    LoadScalar { slot: SlotId },
    StoreScalar { slot: SlotId },
    LoadArray { slot: SlotId },
    StoreArray { slot: SlotId },
    LoadScalarDyn,
    StoreScalarDyn,
    LoadArrayDyn,
    StoreArrayDyn,
    Op1 { op: Op1 },
    Op2 { op: Op2 },
    Cat,
    Reduce { op: Reduce },
    Transform { op: Transform },
    Vararg { func: VarargFn, n: u8 },
    Const { id: ConstId },
    /// Explicit coercions.  No grammar construct compiles to these;
    /// they are for programs assembled directly on [`ProgramBuilder`].
    ToScalar,
    ToArray,
    Subrange { in_place: bool },
    If { else_target: PcOffset },
    Jump { target: PcOffset },
    CondEnd,
    Until,
    UntilEnd { until_pc: PcOffset },
}

impl Opcode {
    /// Net change to the evaluation stack depth when this instruction
    /// executes.  `Jump` is counted as -1: it terminates the then-branch,
    /// whose value is superseded by the else-branch's.
    pub(crate) fn stack_effect(&self) -> i32 {
        match self {
            Opcode::LoadConstant { .. }
            | Opcode::LoadInt { .. }
            | Opcode::LoadScalar { .. }
            | Opcode::LoadArray { .. }
            | Opcode::Const { .. } => 1,
            Opcode::StoreScalar { .. } | Opcode::StoreArray { .. } => -1,
            Opcode::LoadScalarDyn | Opcode::LoadArrayDyn => 0,
            Opcode::StoreScalarDyn | Opcode::StoreArrayDyn => -2,
            Opcode::Op1 { .. } => 0,
            Opcode::Op2 { .. } | Opcode::Cat => -1,
            Opcode::Reduce { .. } => 0,
            Opcode::Transform { op } => match op {
                Transform::NSmooth | Transform::NDeriv | Transform::FitMPoly => -1,
                _ => 0,
            },
            Opcode::Vararg { n, .. } => 1 - *n as i32,
            Opcode::ToScalar | Opcode::ToArray => 0,
            Opcode::Subrange { .. } => -2,
            Opcode::If { .. } => -1,
            Opcode::Jump { .. } => -1,
            Opcode::CondEnd => 0,
            Opcode::Until => 0,
            Opcode::UntilEnd { .. } => -1,
        }
    }
}

/// A compiled expression: postfix instruction stream plus an interned
/// table of the double literals that didn't fit in `LoadInt`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Program {
    pub(crate) literals: Vec<f64>,
    pub(crate) code: Vec<Opcode>,
}

impl Program {
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

#[derive(Default)]
pub(crate) struct ProgramBuilder {
    literals: Vec<f64>,
    literal_ids: HashMap<OrderedFloat<f64>, LiteralId>,
    code: Vec<Opcode>,
}

impl ProgramBuilder {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    pub(crate) fn intern_literal(&mut self, lit: f64) -> LiteralId {
        let key = OrderedFloat(lit);
        match self.literal_ids.get(&key) {
            Some(id) => *id,
            None => {
                let id = self.literals.len() as LiteralId;
                self.literals.push(lit);
                self.literal_ids.insert(key, id);
                id
            }
        }
    }

    pub(crate) fn push(&mut self, op: Opcode) -> PcOffset {
        let pc = self.code.len() as PcOffset;
        self.code.push(op);
        pc
    }

    pub(crate) fn next_pc(&self) -> PcOffset {
        self.code.len() as PcOffset
    }

    pub(crate) fn last(&self) -> Option<&Opcode> {
        self.code.last()
    }

    pub(crate) fn pop_last(&mut self) -> Option<Opcode> {
        self.code.pop()
    }

    /// Back-patch a previously pushed jump with its resolved target.
    pub(crate) fn patch(&mut self, pc: PcOffset, op: Opcode) {
        self.code[pc as usize] = op;
    }

    pub(crate) fn finish(self) -> Program {
        Program {
            literals: self.literals,
            code: self.code,
        }
    }
}

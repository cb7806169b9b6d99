// Copyright 2026 The Arraycalc Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Infix to postfix compilation.
//!
//! A single left-to-right pass over the token stream, shunting-yard
//! style: operands are emitted immediately, operators wait on a small
//! pending stack until priority (or a group close, separator or
//! statement end) pops them.  Conditional and loop jumps are linked to
//! absolute instruction indices as the pass goes; the VM never scans.
//!
//! The pass also tracks the net evaluation-stack depth of the emitted
//! stream: it must never go negative, never exceed the VM's stack
//! capacity, and finish at exactly one.

use smallvec::SmallVec;

use crate::bytecode::{
    ConstId, Op1, Op2, Opcode, PcOffset, Program, ProgramBuilder, Reduce, Transform, VarargFn,
    MAX_ARRAYS, MAX_SCALARS, STACK_MAX,
};
use crate::common::{EquationError, EquationResult};
use crate::eqn_err;
use crate::token::{Lexer, Token};

/// Pending-operator stack capacity.
const OP_STACK_MAX: usize = 80;

// operator priorities; an incoming binary operator pops pending
// operators of greater-or-equal stack priority (strictly greater for
// '?', and power stacks below its own incoming priority to bind
// right-to-left)
const PRIO_STORE: u8 = 1;
const PRIO_COND: u8 = 3;
const PRIO_OR: u8 = 4;
const PRIO_AND: u8 = 5;
const PRIO_BIT_OR: u8 = 6;
const PRIO_BIT_XOR: u8 = 7;
const PRIO_BIT_AND: u8 = 8;
const PRIO_EQ: u8 = 9;
const PRIO_REL: u8 = 10;
const PRIO_SHIFT: u8 = 11;
const PRIO_ADD: u8 = 12;
const PRIO_MUL: u8 = 13;
const PRIO_POW: u8 = 14;
const PRIO_UNARY: u8 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Group {
    Paren,
    Bracket,
    Curly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CondState {
    Then,
    Else,
}

#[derive(Debug)]
enum StackEl {
    Open {
        group: Group,
        commas: u8,
        start: usize,
        end: usize,
    },
    Op {
        op: Opcode,
        prio: u8,
        start: usize,
        end: usize,
    },
    Cond {
        state: CondState,
        if_pc: PcOffset,
        jump_pc: PcOffset,
        start: usize,
        end: usize,
    },
    UntilMark {
        until_pc: PcOffset,
        start: usize,
        end: usize,
    },
}

/// What a word resolves to when it appears in operand position.
enum Resolved {
    Scalar(u8),
    Array(u8),
    Const(ConstId),
    Unary(Op1),
    Reduce(Reduce),
    Transform(Transform),
    Prefix2(Opcode),
    Vararg(VarargFn),
}

pub fn compile(text: &str) -> EquationResult<Program> {
    if text.len() > u16::MAX as usize {
        return eqn_err!(InternalError, 0, 0);
    }
    Compiler::new().compile(text)
}

struct Compiler {
    builder: ProgramBuilder,
    stack: SmallVec<[StackEl; 16]>,
    depth: i32,
    operand_expected: bool,
    /// set after a vararg function name; the next token must be '('
    expect_lparen: bool,
    /// true at the very start and right after ';' (tolerates trailing ';')
    at_statement_start: bool,
}

impl Compiler {
    fn new() -> Compiler {
        Compiler {
            builder: ProgramBuilder::new(),
            stack: SmallVec::new(),
            depth: 0,
            operand_expected: true,
            expect_lparen: false,
            at_statement_start: true,
        }
    }

    fn compile(mut self, text: &str) -> EquationResult<Program> {
        let end = text.len();
        for item in Lexer::new(text) {
            let (l, tok, r) = item?;
            if self.expect_lparen && tok != Token::LParen {
                return eqn_err!(UnknownToken, l, r);
            }
            self.token(tok, l, r)?;
            self.at_statement_start = tok == Token::Semi;
        }
        self.finish(end)
    }

    fn token(&mut self, tok: Token, l: usize, r: usize) -> EquationResult<()> {
        use Token::*;
        match tok {
            Num(text) => self.literal(text, l, r),
            Ident(word) => self.word(word, l, r),

            Plus => self.binary(Op2::Add, PRIO_ADD, PRIO_ADD, l, r),
            Minus => {
                if self.operand_expected {
                    self.push_prefix(Opcode::Op1 { op: Op1::Neg }, l, r)
                } else {
                    self.binary(Op2::Sub, PRIO_ADD, PRIO_ADD, l, r)
                }
            }
            Mul => self.binary(Op2::Mul, PRIO_MUL, PRIO_MUL, l, r),
            Div => self.binary(Op2::Div, PRIO_MUL, PRIO_MUL, l, r),
            Mod => self.binary(Op2::Mod, PRIO_MUL, PRIO_MUL, l, r),
            // right-associative: stacks below its own incoming priority
            Pow => self.binary(Op2::Pow, PRIO_POW, PRIO_POW + 1, l, r),
            Lt => self.binary(Op2::Lt, PRIO_REL, PRIO_REL, l, r),
            Lte => self.binary(Op2::Lte, PRIO_REL, PRIO_REL, l, r),
            Gt => self.binary(Op2::Gt, PRIO_REL, PRIO_REL, l, r),
            Gte => self.binary(Op2::Gte, PRIO_REL, PRIO_REL, l, r),
            MinOp => self.binary(Op2::Min, PRIO_REL, PRIO_REL, l, r),
            MaxOp => self.binary(Op2::Max, PRIO_REL, PRIO_REL, l, r),
            Eq => self.binary(Op2::Eq, PRIO_EQ, PRIO_EQ, l, r),
            Neq => self.binary(Op2::Neq, PRIO_EQ, PRIO_EQ, l, r),
            And => self.binary(Op2::And, PRIO_AND, PRIO_AND, l, r),
            Or => self.binary(Op2::Or, PRIO_OR, PRIO_OR, l, r),
            BitAnd => self.binary(Op2::BitAnd, PRIO_BIT_AND, PRIO_BIT_AND, l, r),
            BitOr => self.binary(Op2::BitOr, PRIO_BIT_OR, PRIO_BIT_OR, l, r),
            Xor => self.binary(Op2::BitXor, PRIO_BIT_XOR, PRIO_BIT_XOR, l, r),
            Shl => self.binary(Op2::Shl, PRIO_SHIFT, PRIO_SHIFT, l, r),
            Shr => self.binary(Op2::Shr, PRIO_SHIFT, PRIO_SHIFT, l, r),

            Not => self.push_prefix(Opcode::Op1 { op: Op1::Not }, l, r),
            BitNot => self.push_prefix(Opcode::Op1 { op: Op1::BitNot }, l, r),
            At => self.push_prefix(Opcode::LoadScalarDyn, l, r),
            AtAt => self.push_prefix(Opcode::LoadArrayDyn, l, r),

            Assign => self.assign(l, r),
            Question => self.cond_start(l, r),
            Colon => {
                if self.colon_is_ternary_else() {
                    self.cond_else(l, r)
                } else {
                    self.separator(l, r)
                }
            }
            Comma => self.separator(l, r),
            Semi => self.statement_end(l, r),
            Until => self.until(l, r),

            LParen => {
                if !self.operand_expected {
                    return eqn_err!(UnknownToken, l, r);
                }
                self.expect_lparen = false;
                self.push_open(Group::Paren, l, r)
            }
            LBracket => {
                if self.operand_expected {
                    return eqn_err!(UnknownToken, l, r);
                }
                self.operand_expected = true;
                self.push_open(Group::Bracket, l, r)
            }
            LCurly => {
                if self.operand_expected {
                    return eqn_err!(UnknownToken, l, r);
                }
                self.operand_expected = true;
                self.push_open(Group::Curly, l, r)
            }
            RParen => self.close_paren(l, r),
            RBracket => self.close_subrange(Group::Bracket, l, r),
            RCurly => self.close_subrange(Group::Curly, l, r),
        }
    }

    // ---- emission and stack plumbing ----

    fn emit(&mut self, op: Opcode, l: usize, r: usize) -> EquationResult<PcOffset> {
        if self.builder.next_pc() == PcOffset::MAX {
            return eqn_err!(InternalError, l, r);
        }
        self.depth += op.stack_effect();
        if self.depth < 0 {
            return eqn_err!(StackUnderflow, l, r);
        }
        if self.depth > STACK_MAX as i32 {
            return eqn_err!(StackOverflow, l, r);
        }
        Ok(self.builder.push(op))
    }

    fn push_el(&mut self, el: StackEl, l: usize, r: usize) -> EquationResult<()> {
        if self.stack.len() >= OP_STACK_MAX {
            return eqn_err!(StackOverflow, l, r);
        }
        self.stack.push(el);
        Ok(())
    }

    fn push_open(&mut self, group: Group, l: usize, r: usize) -> EquationResult<()> {
        self.push_el(
            StackEl::Open {
                group,
                commas: 0,
                start: l,
                end: r,
            },
            l,
            r,
        )
    }

    fn push_prefix(&mut self, op: Opcode, l: usize, r: usize) -> EquationResult<()> {
        if !self.operand_expected {
            return eqn_err!(UnknownToken, l, r);
        }
        self.push_el(
            StackEl::Op {
                op,
                prio: PRIO_UNARY,
                start: l,
                end: r,
            },
            l,
            r,
        )
    }

    /// Pop one pending element and emit its instruction(s).  `Open` must
    /// not be on top when this is called.
    fn pop_emit(&mut self) -> EquationResult<()> {
        match self.stack.pop() {
            Some(StackEl::Op { op, start, end, .. }) => {
                self.emit(op, start, end)?;
                Ok(())
            }
            Some(StackEl::Cond {
                state: CondState::Else,
                jump_pc,
                start,
                end,
                ..
            }) => {
                let cond_end = self.emit(Opcode::CondEnd, start, end)?;
                self.builder.patch(jump_pc, Opcode::Jump { target: cond_end });
                Ok(())
            }
            Some(StackEl::Cond { start, end, .. }) => {
                eqn_err!(UnbalancedConditional, start, end)
            }
            Some(StackEl::UntilMark {
                until_pc,
                start,
                end,
            }) => {
                self.emit(Opcode::UntilEnd { until_pc }, start, end)?;
                Ok(())
            }
            _ => eqn_err!(InternalError, 0, 0),
        }
    }

    /// Pop and emit pending operators whose stack priority meets `min`
    /// (strictly greater than `min` when `strict`).  Stops at anything
    /// that is not a plain operator.
    fn pop_ops(&mut self, min: u8, strict: bool) -> EquationResult<()> {
        loop {
            match self.stack.last() {
                Some(StackEl::Op { prio, .. })
                    if (strict && *prio > min) || (!strict && *prio >= min) =>
                {
                    self.pop_emit()?;
                }
                _ => return Ok(()),
            }
        }
    }

    // ---- operands ----

    fn literal(&mut self, text: &str, l: usize, r: usize) -> EquationResult<()> {
        if !self.operand_expected {
            return eqn_err!(UnknownToken, l, r);
        }
        let value: f64 = match text.parse() {
            Ok(v) => v,
            Err(_) => return eqn_err!(BadLiteral, l, r),
        };
        let op = if value == value as i16 as f64 {
            Opcode::LoadInt {
                value: value as i16,
            }
        } else {
            let id = self.builder.intern_literal(value);
            Opcode::LoadConstant { id }
        };
        self.emit(op, l, r)?;
        self.operand_expected = false;
        Ok(())
    }

    fn word(&mut self, word: &str, l: usize, r: usize) -> EquationResult<()> {
        if !self.operand_expected {
            return eqn_err!(UnknownToken, l, r);
        }
        let resolved = match resolve(word) {
            Some(resolved) => resolved,
            None => return eqn_err!(UnknownToken, l, r),
        };
        match resolved {
            Resolved::Scalar(slot) => {
                self.emit(Opcode::LoadScalar { slot }, l, r)?;
                self.operand_expected = false;
            }
            Resolved::Array(slot) => {
                self.emit(Opcode::LoadArray { slot }, l, r)?;
                self.operand_expected = false;
            }
            Resolved::Const(id) => {
                self.emit(Opcode::Const { id }, l, r)?;
                self.operand_expected = false;
            }
            Resolved::Unary(op) => self.push_prefix(Opcode::Op1 { op }, l, r)?,
            Resolved::Reduce(op) => self.push_prefix(Opcode::Reduce { op }, l, r)?,
            Resolved::Transform(op) => self.push_prefix(Opcode::Transform { op }, l, r)?,
            Resolved::Prefix2(op) => self.push_prefix(op, l, r)?,
            Resolved::Vararg(func) => {
                self.push_prefix(Opcode::Vararg { func, n: 0 }, l, r)?;
                self.expect_lparen = true;
            }
        }
        Ok(())
    }

    // ---- operators ----

    fn binary(&mut self, op: Op2, stack_prio: u8, incoming: u8, l: usize, r: usize) -> EquationResult<()> {
        if self.operand_expected {
            return eqn_err!(UnknownToken, l, r);
        }
        self.pop_ops(incoming, false)?;
        self.operand_expected = true;
        self.push_el(
            StackEl::Op {
                op: Opcode::Op2 { op },
                prio: stack_prio,
                start: l,
                end: r,
            },
            l,
            r,
        )
    }

    fn assign(&mut self, l: usize, r: usize) -> EquationResult<()> {
        if self.operand_expected {
            return eqn_err!(BadAssignment, l, r);
        }
        // indirect form first: an '@'/'@@' still pending on the stack
        // becomes its store twin, keeping the index expression beneath
        // the value on the runtime stack
        if let Some(StackEl::Op { op, prio, .. }) = self.stack.last_mut() {
            match op {
                Opcode::LoadScalarDyn => {
                    *op = Opcode::StoreScalarDyn;
                    *prio = PRIO_STORE;
                    self.operand_expected = true;
                    return Ok(());
                }
                Opcode::LoadArrayDyn => {
                    *op = Opcode::StoreArrayDyn;
                    *prio = PRIO_STORE;
                    self.operand_expected = true;
                    return Ok(());
                }
                _ => {}
            }
        }
        // direct form: rewrite the just-emitted load into a pending store
        let store = match self.builder.last() {
            Some(Opcode::LoadScalar { slot }) => Opcode::StoreScalar { slot: *slot },
            Some(Opcode::LoadArray { slot }) => Opcode::StoreArray { slot: *slot },
            Some(Opcode::LoadScalarDyn) => Opcode::StoreScalarDyn,
            Some(Opcode::LoadArrayDyn) => Opcode::StoreArrayDyn,
            _ => return eqn_err!(BadAssignment, l, r),
        };
        if let Some(load) = self.builder.pop_last() {
            self.depth -= load.stack_effect();
        }
        self.operand_expected = true;
        self.push_el(
            StackEl::Op {
                op: store,
                prio: PRIO_STORE,
                start: l,
                end: r,
            },
            l,
            r,
        )
    }

    fn cond_start(&mut self, l: usize, r: usize) -> EquationResult<()> {
        if self.operand_expected {
            return eqn_err!(UnknownToken, l, r);
        }
        self.pop_ops(PRIO_COND, true)?;
        let if_pc = self.emit(Opcode::If { else_target: 0 }, l, r)?;
        self.operand_expected = true;
        self.push_el(
            StackEl::Cond {
                state: CondState::Then,
                if_pc,
                jump_pc: 0,
                start: l,
                end: r,
            },
            l,
            r,
        )
    }

    /// A ':' is the ternary else when the nearest non-operator pending
    /// element is an unresolved '?'; it is a separator when that element
    /// is an open group.
    fn colon_is_ternary_else(&self) -> bool {
        for el in self.stack.iter().rev() {
            match el {
                StackEl::Op { .. } | StackEl::UntilMark { .. } => continue,
                StackEl::Cond {
                    state: CondState::Then,
                    ..
                } => return true,
                StackEl::Cond { .. } => continue,
                StackEl::Open { .. } => return false,
            }
        }
        false
    }

    fn cond_else(&mut self, l: usize, r: usize) -> EquationResult<()> {
        if self.operand_expected {
            return eqn_err!(IncompleteExpression, l, r);
        }
        // drain operators, closing any conditional that completed inside
        // the then-branch, until the '?' this ':' resolves is on top
        loop {
            match self.stack.last() {
                Some(StackEl::Op { prio, .. }) if *prio >= PRIO_COND => self.pop_emit()?,
                Some(StackEl::Cond {
                    state: CondState::Else,
                    ..
                }) => self.pop_emit()?,
                _ => break,
            }
        }
        let jump_pc = self.emit(Opcode::Jump { target: 0 }, l, r)?;
        match self.stack.last_mut() {
            Some(StackEl::Cond {
                state,
                if_pc,
                jump_pc: recorded,
                ..
            }) if *state == CondState::Then => {
                self.builder.patch(
                    *if_pc,
                    Opcode::If {
                        else_target: jump_pc + 1,
                    },
                );
                *state = CondState::Else;
                *recorded = jump_pc;
                self.operand_expected = true;
                Ok(())
            }
            _ => eqn_err!(UnbalancedConditional, l, r),
        }
    }

    fn until(&mut self, l: usize, r: usize) -> EquationResult<()> {
        if self.operand_expected {
            return eqn_err!(UnknownToken, l, r);
        }
        self.pop_ops(PRIO_COND, false)?;
        let until_pc = self.emit(Opcode::Until, l, r)?;
        self.operand_expected = true;
        self.push_el(
            StackEl::UntilMark {
                until_pc,
                start: l,
                end: r,
            },
            l,
            r,
        )
    }

    // ---- separators, statement ends, group closes ----

    /// Drain pending elements down to (not including) the nearest open
    /// group and bump its separator count.
    fn separator(&mut self, l: usize, r: usize) -> EquationResult<()> {
        if self.operand_expected {
            return eqn_err!(IncompleteExpression, l, r);
        }
        loop {
            match self.stack.last_mut() {
                Some(StackEl::Open { commas, .. }) => {
                    *commas = commas.saturating_add(1);
                    break;
                }
                Some(_) => self.pop_emit()?,
                None => return eqn_err!(BadSeparator, l, r),
            }
        }
        self.operand_expected = true;
        Ok(())
    }

    fn statement_end(&mut self, l: usize, r: usize) -> EquationResult<()> {
        if self.operand_expected {
            return eqn_err!(IncompleteExpression, l, r);
        }
        while !matches!(self.stack.last(), None | Some(StackEl::Open { .. })) {
            self.pop_emit()?;
        }
        self.operand_expected = true;
        Ok(())
    }

    fn close_paren(&mut self, l: usize, r: usize) -> EquationResult<()> {
        if self.operand_expected {
            return eqn_err!(IncompleteExpression, l, r);
        }
        let commas = self.close_group(Group::Paren, l, r)?;
        // a vararg function waiting just below the paren learns its
        // argument count from the separators inside
        if let Some(StackEl::Op {
            op: Opcode::Vararg { .. },
            ..
        }) = self.stack.last()
        {
            if let Some(StackEl::Op {
                op: Opcode::Vararg { func, .. },
                start,
                end,
                ..
            }) = self.stack.pop()
            {
                // depth-neutral arguments (assignments) leave the static
                // depth check blind, so bound the count here too
                if commas as usize >= STACK_MAX {
                    return eqn_err!(StackOverflow, start, end);
                }
                self.emit(
                    Opcode::Vararg {
                        func,
                        n: commas + 1,
                    },
                    start,
                    end,
                )?;
            }
        } else {
            // other prefix functions apply directly to the closed group
            while matches!(self.stack.last(), Some(StackEl::Op { prio, .. }) if *prio == PRIO_UNARY)
            {
                self.pop_emit()?;
            }
        }
        self.operand_expected = false;
        Ok(())
    }

    fn close_subrange(&mut self, group: Group, l: usize, r: usize) -> EquationResult<()> {
        if self.operand_expected {
            return eqn_err!(IncompleteExpression, l, r);
        }
        let commas = self.close_group(group, l, r)?;
        if commas != 1 {
            // a subrange is exactly [lo:hi]
            return eqn_err!(BadSeparator, l, r);
        }
        self.emit(
            Opcode::Subrange {
                in_place: group == Group::Curly,
            },
            l,
            r,
        )?;
        self.operand_expected = false;
        Ok(())
    }

    /// Drain down to an open group of the wanted kind, pop it, and
    /// return its separator count.
    fn close_group(&mut self, wanted: Group, l: usize, r: usize) -> EquationResult<u8> {
        let no_open: fn(usize, usize) -> EquationError = match wanted {
            Group::Paren => |l, r| EquationError {
                start: l as u16,
                end: r as u16,
                code: crate::common::ErrorCode::CloseParenNoOpen,
            },
            Group::Bracket => |l, r| EquationError {
                start: l as u16,
                end: r as u16,
                code: crate::common::ErrorCode::CloseBracketNoOpen,
            },
            Group::Curly => |l, r| EquationError {
                start: l as u16,
                end: r as u16,
                code: crate::common::ErrorCode::CloseCurlyNoOpen,
            },
        };
        loop {
            match self.stack.last() {
                Some(StackEl::Open { group, commas, .. }) => {
                    if *group != wanted {
                        return Err(no_open(l, r));
                    }
                    let commas = *commas;
                    self.stack.pop();
                    return Ok(commas);
                }
                Some(_) => self.pop_emit()?,
                None => return Err(no_open(l, r)),
            }
        }
    }

    fn finish(mut self, end: usize) -> EquationResult<Program> {
        if self.operand_expected && !self.at_statement_start {
            return eqn_err!(IncompleteExpression, end, end);
        }
        while let Some(el) = self.stack.last() {
            if let StackEl::Open { start, end, .. } = el {
                return eqn_err!(ParenStillOpen, *start, *end);
            }
            self.pop_emit()?;
        }
        let program = self.builder.finish();
        if program.is_empty() {
            if self.depth != 0 {
                return eqn_err!(InternalError, 0, end);
            }
            return Ok(program);
        }
        match self.depth {
            1 => Ok(program),
            d if d > 1 => eqn_err!(TooManyResults, 0, end),
            _ => eqn_err!(IncompleteExpression, 0, end),
        }
    }
}

/// Operand-position word table: slot names, constants and functions.
/// Single letters `A`..`P` are scalar slots, doubled letters `AA`..`LL`
/// are array slots; everything is case-insensitive.
fn resolve(word: &str) -> Option<Resolved> {
    let lower = word.to_lowercase();
    let bytes = lower.as_bytes();
    if bytes.len() == 1 && bytes[0].is_ascii_lowercase() {
        let slot = bytes[0] - b'a';
        if (slot as usize) < MAX_SCALARS {
            return Some(Resolved::Scalar(slot));
        }
    }
    if bytes.len() == 2 && bytes[0] == bytes[1] && bytes[0].is_ascii_lowercase() {
        let slot = bytes[0] - b'a';
        if (slot as usize) < MAX_ARRAYS {
            return Some(Resolved::Array(slot));
        }
    }

    let resolved = match lower.as_str() {
        "pi" => Resolved::Const(ConstId::Pi),
        "d2r" => Resolved::Const(ConstId::DegToRad),
        "r2d" => Resolved::Const(ConstId::RadToDeg),
        "s2r" => Resolved::Const(ConstId::SecToRad),
        "r2s" => Resolved::Const(ConstId::RadToSec),
        "rndm" => Resolved::Const(ConstId::Random),
        "nrndm" => Resolved::Const(ConstId::NormalRandom),
        "arndm" => Resolved::Const(ConstId::ArrayRandom),
        "ix" => Resolved::Const(ConstId::Index),

        "abs" => Resolved::Unary(Op1::Abs),
        "sqrt" | "sqr" => Resolved::Unary(Op1::Sqrt),
        "exp" => Resolved::Unary(Op1::Exp),
        "log" | "log10" => Resolved::Unary(Op1::Log10),
        "ln" | "loge" => Resolved::Unary(Op1::Ln),
        "acos" => Resolved::Unary(Op1::Acos),
        "asin" => Resolved::Unary(Op1::Asin),
        "atan" => Resolved::Unary(Op1::Atan),
        "cos" => Resolved::Unary(Op1::Cos),
        "sin" => Resolved::Unary(Op1::Sin),
        "tan" => Resolved::Unary(Op1::Tan),
        "cosh" => Resolved::Unary(Op1::Cosh),
        "sinh" => Resolved::Unary(Op1::Sinh),
        "tanh" => Resolved::Unary(Op1::Tanh),
        "ceil" => Resolved::Unary(Op1::Ceil),
        "floor" => Resolved::Unary(Op1::Floor),
        "isinf" => Resolved::Unary(Op1::IsInf),
        "nint" => Resolved::Unary(Op1::Nint),

        "amax" => Resolved::Reduce(Reduce::Max),
        "amin" => Resolved::Reduce(Reduce::Min),
        "ixmax" => Resolved::Reduce(Reduce::ArgMax),
        "ixmin" => Resolved::Reduce(Reduce::ArgMin),
        "ixz" => Resolved::Reduce(Reduce::FirstZero),
        "ixnz" => Resolved::Reduce(Reduce::FirstNonzero),
        "avg" => Resolved::Reduce(Reduce::Average),
        "std" => Resolved::Reduce(Reduce::StdDev),
        "fwhm" => Resolved::Reduce(Reduce::Fwhm),
        "sum" => Resolved::Reduce(Reduce::Sum),

        "cum" => Resolved::Transform(Transform::Cum),
        "smoo" => Resolved::Transform(Transform::Smooth),
        "nsmoo" => Resolved::Transform(Transform::NSmooth),
        "deriv" => Resolved::Transform(Transform::Deriv),
        "nderiv" => Resolved::Transform(Transform::NDeriv),
        "fitpoly" => Resolved::Transform(Transform::FitPoly),
        "fitmpoly" => Resolved::Transform(Transform::FitMPoly),

        "atan2" => Resolved::Prefix2(Opcode::Op2 { op: Op2::Atan2 }),
        "cat" => Resolved::Prefix2(Opcode::Cat),

        "min" => Resolved::Vararg(VarargFn::Min),
        "max" => Resolved::Vararg(VarargFn::Max),
        "finite" => Resolved::Vararg(VarargFn::Finite),
        "isnan" => Resolved::Vararg(VarargFn::IsNan),
        "fitq" => Resolved::Vararg(VarargFn::FitQ),
        "fitmq" => Resolved::Vararg(VarargFn::FitMQ),

        _ => return None,
    };
    Some(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode::*;
    use crate::common::ErrorCode;

    fn code(text: &str) -> Vec<Opcode> {
        compile(text).unwrap().code
    }

    fn err(text: &str) -> ErrorCode {
        compile(text).unwrap_err().code
    }

    #[test]
    fn test_operand_emission() {
        assert_eq!(
            vec![
                LoadScalar { slot: 0 },
                LoadInt { value: 2 },
                Opcode::Op2 { op: super::Op2::Add }
            ],
            code("A + 2")
        );
        assert_eq!(vec![LoadArray { slot: 11 }], code("ll"));
        assert_eq!(vec![Const { id: ConstId::Pi }], code("PI"));
    }

    #[test]
    fn test_literal_selection() {
        // small integral values go inline, others to the literal table
        let program = compile("7").unwrap();
        assert_eq!(vec![LoadInt { value: 7 }], program.code);
        assert!(program.literals.is_empty());
        let program = compile("2.5").unwrap();
        assert_eq!(vec![LoadConstant { id: 0 }], program.code);
        assert_eq!(vec![2.5], program.literals);
        let program = compile("123456").unwrap();
        assert_eq!(vec![123456.0], program.literals);
    }

    #[test]
    fn test_precedence() {
        // 1 + 2*3: mul binds tighter
        assert_eq!(
            vec![
                LoadInt { value: 1 },
                LoadInt { value: 2 },
                LoadInt { value: 3 },
                Opcode::Op2 { op: super::Op2::Mul },
                Opcode::Op2 { op: super::Op2::Add },
            ],
            code("1+2*3")
        );
        // power is right-associative
        assert_eq!(
            vec![
                LoadInt { value: 2 },
                LoadInt { value: 3 },
                LoadInt { value: 2 },
                Opcode::Op2 { op: super::Op2::Pow },
                Opcode::Op2 { op: super::Op2::Pow },
            ],
            code("2**3**2")
        );
        // unary minus binds tighter than multiplication
        assert_eq!(
            vec![
                LoadScalar { slot: 0 },
                Opcode::Op1 { op: super::Op1::Neg },
                LoadScalar { slot: 1 },
                Opcode::Op2 { op: super::Op2::Mul },
            ],
            code("-A*B")
        );
    }

    #[test]
    fn test_parens() {
        assert_eq!(
            vec![
                LoadInt { value: 1 },
                LoadInt { value: 2 },
                Opcode::Op2 { op: super::Op2::Add },
                LoadInt { value: 3 },
                Opcode::Op2 { op: super::Op2::Mul },
            ],
            code("(1+2)*3")
        );
    }

    #[test]
    fn test_prefix_functions() {
        assert_eq!(
            vec![LoadScalar { slot: 1 }, Opcode::Op1 { op: super::Op1::Sqrt }],
            code("SQRT(B)")
        );
        assert_eq!(
            vec![LoadScalar { slot: 1 }, Opcode::Op1 { op: super::Op1::Sqrt }],
            code("sqr B")
        );
        assert_eq!(
            vec![
                LoadArray { slot: 0 },
                Opcode::Reduce {
                    op: super::Reduce::Average
                }
            ],
            code("AVG(AA)")
        );
        assert_eq!(
            vec![
                LoadScalar { slot: 0 },
                LoadScalar { slot: 1 },
                Opcode::Op2 { op: super::Op2::Atan2 },
            ],
            code("ATAN2(A,B)")
        );
    }

    #[test]
    fn test_vararg_count() {
        assert_eq!(
            vec![
                LoadInt { value: 1 },
                LoadInt { value: 2 },
                LoadInt { value: 3 },
                Vararg {
                    func: VarargFn::Max,
                    n: 3
                },
            ],
            code("MAX(1,2,3)")
        );
        assert_eq!(
            vec![
                LoadArray { slot: 0 },
                Vararg {
                    func: VarargFn::Min,
                    n: 1
                },
            ],
            code("MIN(AA)")
        );
    }

    #[test]
    fn test_vararg_requires_parens() {
        assert_eq!(ErrorCode::UnknownToken, err("MAX 1"));
        assert_eq!(ErrorCode::IncompleteExpression, err("MAX()"));
    }

    #[test]
    fn test_assignment_direct() {
        assert_eq!(
            vec![
                LoadInt { value: 2 },
                StoreScalar { slot: 0 },
                LoadScalar { slot: 0 },
            ],
            code("A:=2; A")
        );
        assert_eq!(
            vec![
                LoadArray { slot: 1 },
                StoreArray { slot: 0 },
                LoadInt { value: 0 },
            ],
            code("AA:=BB; 0")
        );
    }

    #[test]
    fn test_assignment_indirect() {
        // the index expression lands beneath the value
        assert_eq!(
            vec![
                LoadInt { value: 2 },
                LoadInt { value: 7 },
                StoreScalarDyn,
                LoadInt { value: 0 },
            ],
            code("@2:=7; 0")
        );
        assert_eq!(
            vec![
                LoadScalar { slot: 0 },
                LoadInt { value: 7 },
                StoreArrayDyn,
                LoadInt { value: 0 },
            ],
            code("@@A:=7; 0")
        );
    }

    #[test]
    fn test_bad_assignment() {
        assert_eq!(ErrorCode::BadAssignment, err("1+2:=3"));
        assert_eq!(ErrorCode::BadAssignment, err(":=3"));
        assert_eq!(ErrorCode::BadAssignment, err("PI:=3"));
    }

    #[test]
    fn test_conditional_linking() {
        let program = compile("A ? 1 : 2").unwrap();
        assert_eq!(
            vec![
                LoadScalar { slot: 0 },
                If { else_target: 4 },
                LoadInt { value: 1 },
                Jump { target: 5 },
                LoadInt { value: 2 },
                CondEnd,
            ],
            program.code
        );
    }

    #[test]
    fn test_nested_conditional() {
        // a ? b : c ? d : e nests in the else branch
        let program = compile("A ? 1 : B ? 2 : 3").unwrap();
        assert_eq!(
            vec![
                LoadScalar { slot: 0 },
                If { else_target: 4 },
                LoadInt { value: 1 },
                Jump { target: 10 },
                LoadScalar { slot: 1 },
                If { else_target: 8 },
                LoadInt { value: 2 },
                Jump { target: 9 },
                LoadInt { value: 3 },
                CondEnd,
                CondEnd,
            ],
            program.code
        );
    }

    #[test]
    fn test_then_branch_nested_conditional() {
        // a ? (b ? c : d) : e -- the inner conditional closes when the
        // outer ':' arrives
        let program = compile("1 ? 0 ? 7 : 8 : 9").unwrap();
        assert_eq!(
            vec![
                LoadInt { value: 1 },
                If { else_target: 9 },
                LoadInt { value: 0 },
                If { else_target: 6 },
                LoadInt { value: 7 },
                Jump { target: 7 },
                LoadInt { value: 8 },
                CondEnd,
                Jump { target: 10 },
                LoadInt { value: 9 },
                CondEnd,
            ],
            program.code
        );
    }

    #[test]
    fn test_unbalanced_conditional() {
        assert_eq!(ErrorCode::UnbalancedConditional, err("A ? 1"));
        assert_eq!(ErrorCode::BadSeparator, err("1 : 2"));
        assert_eq!(ErrorCode::UnbalancedConditional, err("MAX(A ? 1, 2)"));
    }

    #[test]
    fn test_subrange() {
        assert_eq!(
            vec![
                LoadArray { slot: 0 },
                LoadInt { value: 1 },
                LoadInt { value: 3 },
                Subrange { in_place: false },
            ],
            code("AA[1:3]")
        );
        assert_eq!(
            vec![
                LoadArray { slot: 0 },
                LoadInt { value: 1 },
                LoadInt { value: 3 },
                Subrange { in_place: true },
            ],
            code("AA{1,3}")
        );
    }

    #[test]
    fn test_subrange_vs_ternary_colon() {
        // the ':' inside the brackets after a resolved '?' is a separator
        assert_eq!(
            ErrorCode::BadSeparator,
            err("AA[1:2:3]"),
        );
        let program = compile("AA[A?1:2 : 3]").unwrap();
        assert_eq!(
            vec![
                LoadArray { slot: 0 },
                LoadScalar { slot: 0 },
                If { else_target: 5 },
                LoadInt { value: 1 },
                Jump { target: 6 },
                LoadInt { value: 2 },
                CondEnd,
                LoadInt { value: 3 },
                Subrange { in_place: false },
            ],
            program.code
        );
    }

    #[test]
    fn test_until() {
        assert_eq!(
            vec![
                LoadInt { value: 0 },
                Until,
                LoadInt { value: 1 },
                UntilEnd { until_pc: 1 },
            ],
            code("0 UNTIL 1")
        );
        assert_eq!(
            vec![
                LoadInt { value: 0 },
                Until,
                LoadScalar { slot: 0 },
                LoadInt { value: 9 },
                Opcode::Op2 { op: super::Op2::Gt },
                UntilEnd { until_pc: 1 },
            ],
            code("0 UNTIL (A > 9)")
        );
    }

    #[test]
    fn test_statement_sequencing() {
        assert_eq!(
            vec![
                LoadInt { value: 1 },
                StoreScalar { slot: 0 },
                LoadInt { value: 2 },
                StoreScalar { slot: 1 },
                LoadScalar { slot: 0 },
                LoadScalar { slot: 1 },
                Opcode::Op2 { op: super::Op2::Add },
            ],
            code("A:=1; B:=2; A+B")
        );
        // trailing semicolon is tolerated, but the value count must work out
        assert_eq!(
            vec![LoadInt { value: 4 }],
            code("4;")
        );
    }

    #[test]
    fn test_group_errors() {
        assert_eq!(ErrorCode::CloseParenNoOpen, err("1+2)"));
        assert_eq!(ErrorCode::CloseBracketNoOpen, err("(AA]"));
        assert_eq!(ErrorCode::CloseCurlyNoOpen, err("AA[1:2}"));
        assert_eq!(ErrorCode::ParenStillOpen, err("(1+2"));
        assert_eq!(ErrorCode::ParenStillOpen, err("AA[1:2"));
    }

    #[test]
    fn test_depth_errors() {
        assert_eq!(ErrorCode::UnknownToken, err("1 2"));
        assert_eq!(ErrorCode::TooManyResults, err("1;2"));
        assert_eq!(ErrorCode::IncompleteExpression, err("1+"));
        assert_eq!(ErrorCode::IncompleteExpression, err("A:=B"));
        assert_eq!(ErrorCode::UnknownToken, err("*3"));
        assert_eq!(ErrorCode::UnknownToken, err("foo"));
    }

    #[test]
    fn test_stack_overflow_on_wide_vararg() {
        // 21 operands cannot fit the 20-slot evaluation stack
        let args = (0..21).map(|i| i.to_string()).collect::<Vec<_>>().join(",");
        let expr = format!("MAX({args})");
        assert_eq!(ErrorCode::StackOverflow, err(&expr));
        // 20 is fine
        let args = (0..20).map(|i| i.to_string()).collect::<Vec<_>>().join(",");
        let expr = format!("MAX({args})");
        assert!(compile(&expr).is_ok());
    }

    #[test]
    fn test_vararg_count_bounded_with_depth_neutral_args() {
        // assignments net zero stack depth, so only the argument
        // counter can reject a call this wide
        let args = vec!["A:=1"; 256].join(",");
        let expr = format!("MAX({args})");
        assert_eq!(ErrorCode::StackOverflow, err(&expr));
    }

    #[test]
    fn test_compile_idempotence() {
        let a = compile("SMOO(AA)+MAX(B,C)*2.5").unwrap();
        let b = compile("SMOO(AA)+MAX(B,C)*2.5").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_input_compiles_to_empty_program() {
        assert!(compile("").unwrap().is_empty());
        assert!(compile("  \t ").unwrap().is_empty());
    }

    #[test]
    fn test_bad_literal() {
        assert_eq!(ErrorCode::BadLiteral, err("1e+"));
        assert_eq!(ErrorCode::BadLiteral, err("2e+ "));
    }
}

// Copyright 2026 The Arraycalc Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The stack machine that executes compiled programs.
//!
//! Operands are polymorphic: a stack slot holds either a scalar or an
//! owned array with an active window.  Domain errors (divide by zero,
//! negative sqrt, out-of-range indirect indices) substitute a value and
//! keep going; evaluation only fails for structural reasons or when the
//! final result is not finite.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::warn;

use crate::builtins::{self, Rng};
use crate::bytecode::{
    ConstId, Op1, Op2, Opcode, Program, Reduce, Transform, VarargFn, MAX_ARRAYS, MAX_SCALARS,
    STACK_MAX,
};
use crate::common::Result;
use crate::eval_err;
use crate::pool::{ScratchBuf, ScratchPool};

pub const DEFAULT_LOOP_MAX: usize = 1000;

/// Compatibility sentinel for division and modulo by zero.
const DIV_BY_ZERO: f64 = 1e35;

const RNG_SEED: u32 = 0x0705_1125;

/// Caller-owned variable slots: scalars `A`..`P` and arrays `AA`..`LL`.
/// `None` array slots are allocated lazily by the first store.
pub struct Bindings<'a> {
    scalars: &'a mut [f64],
    arrays: &'a mut [Option<Box<[f64]>>],
}

impl<'a> Bindings<'a> {
    pub fn new(scalars: &'a mut [f64], arrays: &'a mut [Option<Box<[f64]>>]) -> Bindings<'a> {
        Bindings { scalars, arrays }
    }
}

/// Result of one evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome {
    /// The final value coerced to a scalar (always finite).
    pub scalar: f64,
    /// The full final array, when the expression's value was an array.
    pub array: Option<Box<[f64]>>,
    /// Bit i set means array slot i was stored to.
    pub modified_arrays: u32,
}

struct ArrayVal {
    buf: ScratchBuf,
    /// Active window: `buf[first..first + len]`, clamped to the buffer.
    first: usize,
    len: usize,
}

impl ArrayVal {
    fn window(&self) -> &[f64] {
        let end = (self.first + self.len).min(self.buf.len());
        let start = self.first.min(end);
        &self.buf[start..end]
    }

    fn window_bounds(&self) -> (usize, usize) {
        let end = (self.first + self.len).min(self.buf.len());
        let start = self.first.min(end);
        (start, end)
    }
}

enum Value {
    Scalar {
        v: f64,
        /// The scalar slot this value was fetched from, if any; consumed
        /// by FITQ/FITMQ to find coefficient targets.
        source: Option<u8>,
    },
    Array(ArrayVal),
}

impl Value {
    fn scalar(v: f64) -> Value {
        Value::Scalar { v, source: None }
    }

    fn to_scalar(&self) -> f64 {
        match self {
            Value::Scalar { v, .. } => *v,
            Value::Array(a) => a.window().first().copied().unwrap_or(0.0),
        }
    }
}

#[inline(always)]
fn is_truthy(v: f64) -> bool {
    v != 0.0
}

/// Round half away from zero and saturate to i32, the conversion used
/// by bit operators, scalar shifts and indirect slot indices.
fn to_i32(x: f64) -> i32 {
    builtins::nint(x) as i32
}

struct Stack {
    stack: SmallVec<[Value; 8]>,
}

impl Stack {
    fn new() -> Stack {
        Stack {
            stack: SmallVec::new(),
        }
    }

    #[inline(always)]
    fn push(&mut self, value: Value) -> Result<()> {
        if self.stack.len() >= STACK_MAX {
            return eval_err!(StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    #[inline(always)]
    fn pop(&mut self) -> Result<Value> {
        match self.stack.pop() {
            Some(value) => Ok(value),
            None => eval_err!(StackUnderflow),
        }
    }

    fn len(&self) -> usize {
        self.stack.len()
    }

    fn truncate(&mut self, len: usize) {
        self.stack.truncate(len);
    }
}

struct LoopState {
    until_pc: u16,
    sp: usize,
    iters: usize,
}

pub struct Vm {
    pool: Arc<ScratchPool>,
    loop_max: usize,
    rng: Rng,
}

impl Vm {
    pub fn new(pool: Arc<ScratchPool>) -> Vm {
        Vm {
            pool,
            loop_max: DEFAULT_LOOP_MAX,
            rng: Rng::new(RNG_SEED),
        }
    }

    /// Bound on loop-back iterations of each UNTIL site; exceeding it
    /// silently exits the loop.
    pub fn with_loop_max(mut self, loop_max: usize) -> Vm {
        self.loop_max = loop_max.max(1);
        self
    }

    pub fn eval(
        &mut self,
        program: &Program,
        bindings: &mut Bindings,
        array_len: usize,
    ) -> Result<Outcome> {
        if program.is_empty() {
            return eval_err!(EmptyProgram);
        }
        if bindings.scalars.len() > MAX_SCALARS || bindings.arrays.len() > MAX_ARRAYS {
            return eval_err!(BadBindings, "too many variable slots");
        }
        let n = array_len.max(1);
        for slot in bindings.arrays.iter() {
            if let Some(a) = slot {
                if a.len() != n {
                    return eval_err!(BadBindings, "array slot length mismatch");
                }
            }
        }

        let mut stack = Stack::new();
        let mut loops: SmallVec<[LoopState; 4]> = SmallVec::new();
        let mut modified: u32 = 0;

        let code = &program.code;
        let mut pc: usize = 0;
        while pc < code.len() {
            match code[pc] {
                Opcode::LoadConstant { id } => {
                    let v = program.literals.get(id as usize).copied().unwrap_or(0.0);
                    stack.push(Value::scalar(v))?;
                }
                Opcode::LoadInt { value } => {
                    stack.push(Value::scalar(value as f64))?;
                }
                Opcode::LoadScalar { slot } => {
                    let v = bindings.scalars.get(slot as usize).copied().unwrap_or_else(|| {
                        warn!(slot, "scalar fetch beyond declared slots");
                        0.0
                    });
                    stack.push(Value::Scalar {
                        v,
                        source: Some(slot),
                    })?;
                }
                Opcode::StoreScalar { slot } => {
                    let v = stack.pop()?.to_scalar();
                    match bindings.scalars.get_mut(slot as usize) {
                        Some(s) => *s = v,
                        None => warn!(slot, "scalar store beyond declared slots, dropped"),
                    }
                }
                Opcode::LoadArray { slot } => {
                    let arr = self.fetch_array(bindings, slot as usize, n)?;
                    stack.push(Value::Array(arr))?;
                }
                Opcode::StoreArray { slot } => {
                    let arr = self.to_array(stack.pop()?, n)?;
                    store_array(bindings, &mut modified, slot as usize, &arr, n);
                }
                Opcode::LoadScalarDyn => {
                    let i = to_i32(stack.pop()?.to_scalar());
                    let value = match usize::try_from(i)
                        .ok()
                        .and_then(|i| bindings.scalars.get(i).copied())
                    {
                        Some(v) => Value::Scalar {
                            v,
                            source: Some(i as u8),
                        },
                        None => {
                            warn!(index = i, "indirect scalar fetch out of range");
                            Value::scalar(0.0)
                        }
                    };
                    stack.push(value)?;
                }
                Opcode::StoreScalarDyn => {
                    let v = stack.pop()?.to_scalar();
                    let i = to_i32(stack.pop()?.to_scalar());
                    match usize::try_from(i).ok().and_then(|i| bindings.scalars.get_mut(i)) {
                        Some(s) => *s = v,
                        None => warn!(index = i, "indirect scalar store out of range, dropped"),
                    }
                }
                Opcode::LoadArrayDyn => {
                    let i = to_i32(stack.pop()?.to_scalar());
                    let arr = if i >= 0 && (i as usize) < bindings.arrays.len() {
                        self.fetch_array(bindings, i as usize, n)?
                    } else {
                        warn!(index = i, "indirect array fetch out of range");
                        self.zero_array(n)?
                    };
                    stack.push(Value::Array(arr))?;
                }
                Opcode::StoreArrayDyn => {
                    let arr = self.to_array(stack.pop()?, n)?;
                    let i = to_i32(stack.pop()?.to_scalar());
                    if i >= 0 && (i as usize) < bindings.arrays.len() {
                        store_array(bindings, &mut modified, i as usize, &arr, n);
                    } else {
                        warn!(index = i, "indirect array store out of range, dropped");
                    }
                }
                Opcode::Op1 { op } => {
                    let value = self.op1(op, stack.pop()?, n)?;
                    stack.push(value)?;
                }
                Opcode::Op2 { op } => {
                    let rhs = stack.pop()?;
                    let lhs = stack.pop()?;
                    let value = self.op2(op, lhs, rhs, n)?;
                    stack.push(value)?;
                }
                Opcode::Cat => {
                    let rhs = stack.pop()?;
                    let lhs = stack.pop()?;
                    let value = self.concat(lhs, rhs, n)?;
                    stack.push(Value::Array(value))?;
                }
                Opcode::Reduce { op } => {
                    let arr = self.to_array(stack.pop()?, n)?;
                    stack.push(Value::scalar(reduce(op, &arr)))?;
                }
                Opcode::Transform { op } => {
                    let value = self.transform(op, &mut stack, n)?;
                    stack.push(Value::Array(value))?;
                }
                Opcode::Vararg { func, n: count } => {
                    let value = self.vararg(func, count, &mut stack, bindings, n)?;
                    stack.push(value)?;
                }
                Opcode::Const { id } => {
                    let value = self.constant(id, n)?;
                    stack.push(value)?;
                }
                Opcode::ToScalar => {
                    let v = stack.pop()?.to_scalar();
                    stack.push(Value::scalar(v))?;
                }
                Opcode::ToArray => {
                    let arr = self.to_array(stack.pop()?, n)?;
                    stack.push(Value::Array(arr))?;
                }
                Opcode::Subrange { in_place } => {
                    let hi = stack.pop()?.to_scalar();
                    let lo = stack.pop()?.to_scalar();
                    let arr = self.to_array(stack.pop()?, n)?;
                    stack.push(Value::Array(subrange(arr, lo, hi, in_place, n)))?;
                }
                Opcode::If { else_target } => {
                    if !is_truthy(stack.pop()?.to_scalar()) {
                        pc = else_target as usize;
                        continue;
                    }
                }
                Opcode::Jump { target } => {
                    pc = target as usize;
                    continue;
                }
                Opcode::CondEnd => {}
                Opcode::Until => {
                    let sp = stack.len();
                    match loops.iter_mut().find(|l| l.until_pc == pc as u16) {
                        Some(l) => {
                            l.sp = sp;
                            l.iters = 0;
                        }
                        None => loops.push(LoopState {
                            until_pc: pc as u16,
                            sp,
                            iters: 0,
                        }),
                    }
                }
                Opcode::UntilEnd { until_pc } => {
                    if !is_truthy(stack.pop()?.to_scalar()) {
                        if let Some(l) = loops.iter_mut().find(|l| l.until_pc == until_pc) {
                            l.iters += 1;
                            if l.iters < self.loop_max {
                                stack.truncate(l.sp);
                                pc = until_pc as usize + 1;
                                continue;
                            }
                            // loop bound exceeded: fall out silently
                        }
                    }
                }
            }
            pc += 1;
        }

        if stack.len() != 1 {
            return eval_err!(
                StackImbalance,
                format!("{} values left on the stack", stack.len())
            );
        }
        let result = stack.pop()?;
        let scalar = result.to_scalar();
        if !scalar.is_finite() {
            return eval_err!(NonFiniteResult);
        }
        let array = match result {
            Value::Array(a) => Some(a.buf[..n].to_vec().into_boxed_slice()),
            Value::Scalar { .. } => None,
        };
        Ok(Outcome {
            scalar,
            array,
            modified_arrays: modified,
        })
    }

    // ---- array plumbing ----

    fn zero_array(&self, n: usize) -> Result<ArrayVal> {
        let mut buf = self.pool.acquire(n)?;
        buf.fill(0.0);
        Ok(ArrayVal {
            buf,
            first: 0,
            len: n,
        })
    }

    fn fetch_array(&self, bindings: &Bindings, slot: usize, n: usize) -> Result<ArrayVal> {
        let mut buf = self.pool.acquire(n)?;
        match bindings.arrays.get(slot) {
            Some(Some(src)) => {
                buf.copy_from_slice(&src[..n]);
            }
            Some(None) => buf.fill(0.0),
            None => {
                warn!(slot, "array fetch beyond declared slots");
                buf.fill(0.0);
            }
        }
        Ok(ArrayVal {
            buf,
            first: 0,
            len: n,
        })
    }

    fn to_array(&self, value: Value, n: usize) -> Result<ArrayVal> {
        match value {
            Value::Array(a) => Ok(a),
            Value::Scalar { v, .. } => {
                let mut buf = self.pool.acquire(n)?;
                // NaN broadcasts as zeros
                buf.fill(if v.is_nan() { 0.0 } else { v });
                Ok(ArrayVal {
                    buf,
                    first: 0,
                    len: n,
                })
            }
        }
    }

    // ---- operators ----

    fn op1(&mut self, op: Op1, value: Value, n: usize) -> Result<Value> {
        let mut subs: u32 = 0;
        let value = match value {
            Value::Scalar { v, .. } => Value::scalar(apply1(op, v, &mut subs)),
            Value::Array(mut a) => {
                for i in 0..n {
                    a.buf[i] = apply1(op, a.buf[i], &mut subs);
                }
                Value::Array(a)
            }
        };
        if subs > 0 {
            warn!(op = ?op, count = subs, "domain error, substituted");
        }
        Ok(value)
    }

    fn op2(&mut self, op: Op2, lhs: Value, rhs: Value, n: usize) -> Result<Value> {
        // shifting an array moves its contents by a (possibly
        // fractional) number of samples instead of shifting bits
        let lhs = if matches!(op, Op2::Shl | Op2::Shr) {
            match lhs {
                Value::Array(a) => {
                    let amount = rhs.to_scalar();
                    let shifted = self.shift_array(a, amount, op == Op2::Shr, n)?;
                    return Ok(Value::Array(shifted));
                }
                scalar => scalar,
            }
        } else {
            lhs
        };

        let mut subs: u32 = 0;
        let value = match (lhs, rhs) {
            (Value::Scalar { v: a, .. }, Value::Scalar { v: b, .. }) => {
                Value::scalar(apply2(op, a, b, &mut subs))
            }
            (lhs, rhs) => {
                let mut a = self.to_array(lhs, n)?;
                let b = self.to_array(rhs, n)?;
                for i in 0..n {
                    a.buf[i] = apply2(op, a.buf[i], b.buf[i], &mut subs);
                }
                a.first = 0;
                a.len = n;
                Value::Array(a)
            }
        };
        if subs > 0 {
            warn!(op = ?op, count = subs, "domain error, substituted");
        }
        Ok(value)
    }

    /// Fractional subsample shift with linear interpolation and zero
    /// fill; `toward_high` is `>>`.
    fn shift_array(
        &self,
        arr: ArrayVal,
        amount: f64,
        toward_high: bool,
        n: usize,
    ) -> Result<ArrayVal> {
        if !amount.is_finite() {
            return self.zero_array(n);
        }
        let shift = if toward_high { amount } else { -amount };
        let mut out = self.pool.acquire(n)?;
        let src = &arr.buf[..n];
        for (i, o) in out.iter_mut().enumerate() {
            let pos = i as f64 - shift;
            let base = pos.floor();
            let frac = pos - base;
            let j = base as i64;
            *o = sample(src, j) * (1.0 - frac) + sample(src, j + 1) * frac;
        }
        Ok(ArrayVal {
            buf: out,
            first: arr.first,
            len: arr.len,
        })
    }

    /// CAT: append the right operand after the left operand's window.
    fn concat(&self, lhs: Value, rhs: Value, n: usize) -> Result<ArrayVal> {
        let mut dst = match lhs {
            Value::Array(a) => a,
            Value::Scalar { v, .. } => {
                let mut a = self.zero_array(n)?;
                a.buf[0] = v;
                a.len = 1;
                a
            }
        };
        let (_, mut pos) = dst.window_bounds();
        match rhs {
            Value::Scalar { v, .. } => {
                if pos < n {
                    dst.buf[pos] = v;
                    dst.len += 1;
                }
            }
            Value::Array(src) => {
                for &v in src.window() {
                    if pos >= n {
                        break;
                    }
                    dst.buf[pos] = v;
                    dst.len += 1;
                    pos += 1;
                }
            }
        }
        Ok(dst)
    }

    fn transform(&mut self, op: Transform, stack: &mut Stack, n: usize) -> Result<ArrayVal> {
        // the count/mask argument sits above the array operand
        let extra = match op {
            Transform::NSmooth | Transform::NDeriv | Transform::FitMPoly => Some(stack.pop()?),
            _ => None,
        };
        let mut arr = self.to_array(stack.pop()?, n)?;
        let (lo, hi) = arr.window_bounds();

        match op {
            Transform::Cum => {
                let mut sum = 0.0;
                for v in arr.buf[lo..hi].iter_mut() {
                    sum += *v;
                    *v = sum;
                }
            }
            Transform::Smooth => builtins::smooth(&mut arr.buf[lo..hi]),
            Transform::NSmooth => {
                let passes = to_i32(extra.map(|v| v.to_scalar()).unwrap_or(0.0)).max(0);
                for _ in 0..passes {
                    builtins::smooth(&mut arr.buf[lo..hi]);
                }
            }
            Transform::Deriv | Transform::NDeriv => {
                let len = hi - lo;
                let mut x = self.pool.acquire(len.max(1))?;
                for (k, xv) in x.iter_mut().enumerate().take(len) {
                    *xv = (lo + k) as f64;
                }
                let mut d = self.pool.acquire(len.max(1))?;
                if op == Transform::Deriv {
                    builtins::deriv(&x[..len], &arr.buf[lo..hi], &mut d[..len]);
                } else {
                    let half = to_i32(extra.map(|v| v.to_scalar()).unwrap_or(0.0)).max(0);
                    builtins::nderiv(&x[..len], &arr.buf[lo..hi], &mut d[..len], half as usize);
                }
                arr.buf[lo..hi].copy_from_slice(&d[..len]);
            }
            Transform::FitPoly | Transform::FitMPoly => {
                let mask = match (op, extra) {
                    (Transform::FitMPoly, Some(mask)) => Some(self.to_array(mask, n)?),
                    _ => None,
                };
                self.fit_window(&mut arr, mask.as_ref(), lo, hi)?;
            }
        }

        // transforms leave zeros outside the window
        arr.buf[..lo].fill(0.0);
        arr.buf[hi..n].fill(0.0);
        Ok(arr)
    }

    /// Quadratic fit of the window against its absolute indices; the
    /// window is replaced by the fitted curve.  Returns the coefficients.
    fn fit_window(
        &self,
        arr: &mut ArrayVal,
        mask: Option<&ArrayVal>,
        lo: usize,
        hi: usize,
    ) -> Result<[f64; 3]> {
        let len = hi - lo;
        let mut x = self.pool.acquire(len.max(1))?;
        for (k, xv) in x.iter_mut().enumerate().take(len) {
            *xv = (lo + k) as f64;
        }
        let mask_window = mask.map(|m| &m.buf[lo..hi]);
        let coeff = match builtins::fitpoly(&x[..len], &arr.buf[lo..hi], mask_window) {
            Some(coeff) => coeff,
            None => {
                warn!("polynomial fit is underdetermined, substituting zeros");
                [0.0; 3]
            }
        };
        for (k, v) in arr.buf[lo..hi].iter_mut().enumerate() {
            let xv = (lo + k) as f64;
            *v = coeff[0] + coeff[1] * xv + coeff[2] * xv * xv;
        }
        Ok(coeff)
    }

    fn vararg(
        &mut self,
        func: VarargFn,
        count: u8,
        stack: &mut Stack,
        bindings: &mut Bindings,
        n: usize,
    ) -> Result<Value> {
        let count = count as usize;
        let mut args: SmallVec<[Value; 8]> = SmallVec::new();
        for _ in 0..count {
            args.push(stack.pop()?);
        }
        args.reverse();

        match func {
            VarargFn::Min | VarargFn::Max => self.fold_minmax(func, args, n),
            VarargFn::Finite => {
                let ok = args.iter().all(|arg| match arg {
                    Value::Scalar { v, .. } => v.is_finite(),
                    Value::Array(a) => a.window().iter().all(|v| v.is_finite()),
                });
                Ok(Value::scalar(if ok { 1.0 } else { 0.0 }))
            }
            VarargFn::IsNan => {
                let any = args.iter().any(|arg| match arg {
                    Value::Scalar { v, .. } => v.is_nan(),
                    Value::Array(a) => a.window().iter().any(|v| v.is_nan()),
                });
                Ok(Value::scalar(if any { 1.0 } else { 0.0 }))
            }
            VarargFn::FitQ | VarargFn::FitMQ => self.fit_args(func, args, bindings, n),
        }
    }

    fn fold_minmax(&self, func: VarargFn, args: SmallVec<[Value; 8]>, n: usize) -> Result<Value> {
        let take_min = func == VarargFn::Min;
        let any_array = args.iter().any(|a| matches!(a, Value::Array(_)));
        if !any_array {
            let mut acc = f64::NAN;
            for arg in args {
                let v = arg.to_scalar();
                acc = if acc.is_nan() {
                    v
                } else if take_min {
                    acc.min(v)
                } else {
                    acc.max(v)
                };
            }
            return Ok(Value::scalar(if acc.is_nan() { 0.0 } else { acc }));
        }

        let mut iter = args.into_iter();
        let mut acc = match iter.next() {
            Some(arg) => self.to_array(arg, n)?,
            None => self.zero_array(n)?,
        };
        for arg in iter {
            match arg {
                Value::Scalar { v, .. } => {
                    for a in acc.buf[..n].iter_mut() {
                        *a = if take_min { a.min(v) } else { a.max(v) };
                    }
                }
                Value::Array(b) => {
                    for i in 0..n {
                        let v = b.buf[i];
                        let a = &mut acc.buf[i];
                        *a = if take_min { a.min(v) } else { a.max(v) };
                    }
                }
            }
        }
        acc.first = 0;
        acc.len = n;
        Ok(Value::Array(acc))
    }

    /// FITQ(arr, a, b, c) / FITMQ(arr, a, b, c, mask): fit a quadratic
    /// over the array's window, replace the window with the fitted
    /// curve, and write the coefficients back through the scalar slots
    /// the trailing arguments were fetched from.
    fn fit_args(
        &mut self,
        func: VarargFn,
        mut args: SmallVec<[Value; 8]>,
        bindings: &mut Bindings,
        n: usize,
    ) -> Result<Value> {
        let mask = if func == VarargFn::FitMQ && args.len() >= 2 {
            let m = args.pop();
            match m {
                Some(value) => Some(self.to_array(value, n)?),
                None => None,
            }
        } else {
            None
        };
        if args.is_empty() {
            return Ok(Value::scalar(0.0));
        }
        let targets: SmallVec<[Option<u8>; 4]> = args
            .drain(1..)
            .map(|arg| match arg {
                Value::Scalar {
                    source: Some(slot), ..
                } => Some(slot),
                _ => None,
            })
            .collect();
        let mut arr = match args.into_iter().next() {
            Some(first) => self.to_array(first, n)?,
            None => self.zero_array(n)?,
        };

        let (lo, hi) = arr.window_bounds();
        let coeff = self.fit_window(&mut arr, mask.as_ref(), lo, hi)?;
        arr.buf[..lo].fill(0.0);
        arr.buf[hi..n].fill(0.0);

        for (k, target) in targets.iter().take(3).enumerate() {
            match target {
                Some(slot) => match bindings.scalars.get_mut(*slot as usize) {
                    Some(s) => *s = coeff[k],
                    None => warn!(slot, "fit coefficient slot out of range, dropped"),
                },
                None => warn!("fit coefficient target is not a scalar slot, dropped"),
            }
        }
        Ok(Value::Array(arr))
    }

    fn constant(&mut self, id: ConstId, n: usize) -> Result<Value> {
        use std::f64::consts::PI;
        let value = match id {
            ConstId::Pi => Value::scalar(PI),
            ConstId::DegToRad => Value::scalar(PI / 180.0),
            ConstId::RadToDeg => Value::scalar(180.0 / PI),
            ConstId::SecToRad => Value::scalar(PI / (180.0 * 3600.0)),
            ConstId::RadToSec => Value::scalar(180.0 * 3600.0 / PI),
            ConstId::Random => Value::scalar(self.rng.uniform()),
            ConstId::NormalRandom => Value::scalar(self.rng.normal()),
            ConstId::ArrayRandom => {
                let mut arr = self.zero_array(n)?;
                for v in arr.buf[..n].iter_mut() {
                    *v = self.rng.uniform();
                }
                Value::Array(arr)
            }
            ConstId::Index => {
                let mut arr = self.zero_array(n)?;
                for (i, v) in arr.buf[..n].iter_mut().enumerate() {
                    *v = i as f64;
                }
                Value::Array(arr)
            }
        };
        Ok(value)
    }
}

fn store_array(
    bindings: &mut Bindings,
    modified: &mut u32,
    slot: usize,
    arr: &ArrayVal,
    n: usize,
) {
    match bindings.arrays.get_mut(slot) {
        Some(target) => {
            let dst = target.get_or_insert_with(|| vec![0.0; n].into_boxed_slice());
            dst.copy_from_slice(&arr.buf[..n]);
            *modified |= 1 << slot;
        }
        None => warn!(slot, "array store beyond declared slots, dropped"),
    }
}

fn sample(src: &[f64], j: i64) -> f64 {
    if j >= 0 && (j as usize) < src.len() {
        src[j as usize]
    } else {
        0.0
    }
}

fn apply1(op: Op1, x: f64, subs: &mut u32) -> f64 {
    match op {
        Op1::Neg => -x,
        Op1::Abs => x.abs(),
        Op1::Sqrt => {
            if x < 0.0 {
                *subs += 1;
                0.0
            } else {
                x.sqrt()
            }
        }
        Op1::Exp => x.exp(),
        Op1::Log10 => {
            if x <= 0.0 {
                *subs += 1;
                0.0
            } else {
                x.log10()
            }
        }
        Op1::Ln => {
            if x <= 0.0 {
                *subs += 1;
                0.0
            } else {
                x.ln()
            }
        }
        Op1::Acos => {
            if !(-1.0..=1.0).contains(&x) {
                *subs += 1;
                x.clamp(-1.0, 1.0).acos()
            } else {
                x.acos()
            }
        }
        Op1::Asin => {
            if !(-1.0..=1.0).contains(&x) {
                *subs += 1;
                x.clamp(-1.0, 1.0).asin()
            } else {
                x.asin()
            }
        }
        Op1::Atan => x.atan(),
        Op1::Cos => x.cos(),
        Op1::Sin => x.sin(),
        Op1::Tan => x.tan(),
        Op1::Cosh => x.cosh(),
        Op1::Sinh => x.sinh(),
        Op1::Tanh => x.tanh(),
        Op1::Ceil => x.ceil(),
        Op1::Floor => x.floor(),
        Op1::IsInf => {
            if x.is_infinite() {
                1.0
            } else {
                0.0
            }
        }
        Op1::Nint => builtins::nint(x),
        Op1::BitNot => !to_i32(x) as f64,
        Op1::Not => {
            if is_truthy(x) {
                0.0
            } else {
                1.0
            }
        }
    }
}

fn apply2(op: Op2, a: f64, b: f64, subs: &mut u32) -> f64 {
    match op {
        Op2::Add => a + b,
        Op2::Sub => a - b,
        Op2::Mul => a * b,
        Op2::Div => {
            if b == 0.0 {
                *subs += 1;
                DIV_BY_ZERO
            } else {
                a / b
            }
        }
        Op2::Mod => {
            if b == 0.0 {
                *subs += 1;
                DIV_BY_ZERO
            } else {
                a % b
            }
        }
        Op2::Pow => a.powf(b),
        Op2::Gt => bool_val(a > b),
        Op2::Gte => bool_val(a >= b),
        Op2::Lt => bool_val(a < b),
        Op2::Lte => bool_val(a <= b),
        Op2::Eq => bool_val(a == b),
        Op2::Neq => bool_val(a != b),
        Op2::And => bool_val(is_truthy(a) && is_truthy(b)),
        Op2::Or => bool_val(is_truthy(a) || is_truthy(b)),
        Op2::BitAnd => (to_i32(a) & to_i32(b)) as f64,
        Op2::BitOr => (to_i32(a) | to_i32(b)) as f64,
        Op2::BitXor => (to_i32(a) ^ to_i32(b)) as f64,
        Op2::Shl => (to_i32(a) << to_i32(b).clamp(0, 31)) as f64,
        Op2::Shr => (to_i32(a) >> to_i32(b).clamp(0, 31)) as f64,
        Op2::Max => a.max(b),
        Op2::Min => a.min(b),
        Op2::Atan2 => a.atan2(b),
    }
}

#[inline(always)]
fn bool_val(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

fn reduce(op: Reduce, arr: &ArrayVal) -> f64 {
    let w = arr.window();
    let first = arr.window_bounds().0;
    if w.is_empty() {
        return match op {
            Reduce::FirstZero | Reduce::FirstNonzero => -1.0,
            _ => 0.0,
        };
    }
    match op {
        Reduce::Max => w.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Reduce::Min => w.iter().copied().fold(f64::INFINITY, f64::min),
        Reduce::ArgMax => {
            let mut best = 0;
            for (i, &v) in w.iter().enumerate() {
                if v > w[best] {
                    best = i;
                }
            }
            (first + best) as f64
        }
        Reduce::ArgMin => {
            let mut best = 0;
            for (i, &v) in w.iter().enumerate() {
                if v < w[best] {
                    best = i;
                }
            }
            (first + best) as f64
        }
        Reduce::FirstZero => {
            for (i, &v) in w.iter().enumerate() {
                if v == 0.0 {
                    return (first + i) as f64;
                }
                if i + 1 < w.len() && (v < 0.0) != (w[i + 1] < 0.0) {
                    // interpolate the fractional crossing
                    return (first + i) as f64 + v / (v - w[i + 1]);
                }
            }
            -1.0
        }
        Reduce::FirstNonzero => {
            for (i, &v) in w.iter().enumerate() {
                if v != 0.0 {
                    return (first + i) as f64;
                }
            }
            -1.0
        }
        Reduce::Average => w.iter().sum::<f64>() / w.len() as f64,
        Reduce::StdDev => {
            let n = w.len() as f64;
            if w.len() < 2 {
                return 0.0;
            }
            let mean = w.iter().sum::<f64>() / n;
            let ss = w.iter().map(|&v| (v - mean) * (v - mean)).sum::<f64>();
            (ss / (n - 1.0)).sqrt()
        }
        Reduce::Fwhm => builtins::fwhm(w),
        Reduce::Sum => w.iter().sum(),
    }
}

/// `[lo:hi]` compacts the selected elements to the front of the buffer;
/// `{lo:hi}` only narrows the window.  Bounds round and clamp; an
/// inverted range yields an empty window.
fn subrange(mut arr: ArrayVal, lo: f64, hi: f64, in_place: bool, n: usize) -> ArrayVal {
    let last = (n - 1) as f64;
    let lo = builtins::nint(lo.clamp(0.0, last)) as usize;
    let hi = builtins::nint(hi.clamp(0.0, last)) as usize;
    let len = if hi >= lo { hi - lo + 1 } else { 0 };
    if in_place {
        arr.first = lo;
        arr.len = len;
    } else {
        if len > 0 {
            arr.buf.copy_within(lo..hi + 1, 0);
        }
        arr.buf[len..n].fill(0.0);
        arr.first = 0;
        arr.len = len;
    }
    arr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ProgramBuilder;
    use crate::compiler::compile;
    use float_cmp::approx_eq;

    fn eval(text: &str, scalars: &mut [f64], arrays: &mut [Option<Box<[f64]>>], n: usize) -> Result<Outcome> {
        let program = compile(text).unwrap();
        let pool = Arc::new(ScratchPool::new());
        let mut vm = Vm::new(pool);
        let mut bindings = Bindings::new(scalars, arrays);
        vm.eval(&program, &mut bindings, n)
    }

    fn eval_scalar(text: &str) -> f64 {
        eval(text, &mut [], &mut [], 1).unwrap().scalar
    }

    fn arr(values: &[f64]) -> Option<Box<[f64]>> {
        Some(values.to_vec().into_boxed_slice())
    }

    #[test]
    fn test_scalar_arithmetic() {
        assert_eq!(7.0, eval_scalar("1+2*3"));
        assert_eq!(2.0, eval_scalar("10/5"));
        assert_eq!(8.0, eval_scalar("2**3"));
        assert_eq!(1.0, eval_scalar("10%3"));
        assert_eq!(-4.0, eval_scalar("-4"));
    }

    #[test]
    fn test_divide_by_zero_sentinel() {
        assert_eq!(1e35, eval_scalar("1/0"));
        assert_eq!(1e35, eval_scalar("7%0"));
        let mut scalars = [5.0, 0.0];
        let got = eval("A/B", &mut scalars, &mut [], 1).unwrap();
        assert_eq!(1e35, got.scalar);
    }

    #[test]
    fn test_scalar_division() {
        let mut scalars = [6.0, 4.0];
        assert_eq!(1.5, eval("A/B", &mut scalars, &mut [], 1).unwrap().scalar);
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(1.0, eval_scalar("2>1"));
        assert_eq!(0.0, eval_scalar("2<1"));
        assert_eq!(1.0, eval_scalar("2=2"));
        assert_eq!(1.0, eval_scalar("2#3"));
        assert_eq!(1.0, eval_scalar("1&&2"));
        assert_eq!(0.0, eval_scalar("1&&0"));
        assert_eq!(1.0, eval_scalar("0||3"));
        assert_eq!(0.0, eval_scalar("!5"));
        assert_eq!(3.0, eval_scalar("2>?3"));
        assert_eq!(2.0, eval_scalar("2<?3"));
    }

    #[test]
    fn test_bit_operations() {
        assert_eq!(4.0, eval_scalar("6 AND 12"));
        assert_eq!(14.0, eval_scalar("6 OR 12"));
        assert_eq!(10.0, eval_scalar("6 XOR 12"));
        assert_eq!(-7.0, eval_scalar("~6"));
        assert_eq!(24.0, eval_scalar("6<<2"));
        assert_eq!(1.0, eval_scalar("6>>2"));
        // operands round half away from zero
        assert_eq!(4.0, eval_scalar("5.5 AND 12"));
    }

    #[test]
    fn test_ternary() {
        assert_eq!(11.0, eval_scalar("1?11:22"));
        assert_eq!(22.0, eval_scalar("0?11:22"));
        assert_eq!(5.0, eval_scalar("0 ? MAX(1,2) : 5"));
        assert_eq!(2.0, eval_scalar("1 ? MAX(1,2) : 5"));
        // nesting in either branch
        assert_eq!(7.0, eval_scalar("1 ? 1 ? 7 : 8 : 9"));
        assert_eq!(8.0, eval_scalar("1 ? 0 ? 7 : 8 : 9"));
        assert_eq!(9.0, eval_scalar("0 ? 0 ? 7 : 8 : 9"));
        assert_eq!(8.0, eval_scalar("0 ? 7 : 1 ? 8 : 9"));
    }

    #[test]
    fn test_assignment_and_sequencing() {
        let mut scalars = [0.0; 3];
        let got = eval("A:=2; B:=A*3; A+B", &mut scalars, &mut [], 1).unwrap();
        assert_eq!(8.0, got.scalar);
        assert_eq!([2.0, 6.0, 0.0], scalars);
    }

    #[test]
    fn test_indirect_assignment() {
        let mut scalars = [0.0; 4];
        // slot index 2 is C
        eval("@2 := 9; 0", &mut scalars, &mut [], 1).unwrap();
        assert_eq!(9.0, scalars[2]);
        // out of range drops with a warning
        eval("@99 := 9; 0", &mut scalars, &mut [], 1).unwrap();
        assert_eq!([0.0, 0.0, 9.0, 0.0], scalars);
    }

    #[test]
    fn test_array_broadcast_add() {
        let mut arrays = [arr(&[1.0, 2.0, 3.0])];
        let got = eval("AA+1", &mut [], &mut arrays, 3).unwrap();
        assert_eq!(2.0, got.scalar);
        assert_eq!(vec![2.0, 3.0, 4.0], got.array.unwrap().to_vec());
    }

    #[test]
    fn test_array_elementwise_equals_broadcast() {
        let mut arrays = [arr(&[1.0, 2.0, 3.0]), arr(&[5.0, 5.0, 5.0])];
        let a = eval("AA+BB", &mut [], &mut arrays, 3).unwrap();
        let mut arrays2 = [arr(&[1.0, 2.0, 3.0])];
        let b = eval("AA+5", &mut [], &mut arrays2, 3).unwrap();
        assert_eq!(a.array, b.array);
    }

    #[test]
    fn test_array_store_and_dirty_mask() {
        let mut arrays = [None, arr(&[1.0, 2.0, 3.0]), None];
        let got = eval("CC := BB*2; 0", &mut [], &mut arrays, 3).unwrap();
        assert_eq!(0b100, got.modified_arrays);
        assert_eq!(vec![2.0, 4.0, 6.0], arrays[2].as_ref().unwrap().to_vec());
        // BB itself untouched
        assert_eq!(vec![1.0, 2.0, 3.0], arrays[1].as_ref().unwrap().to_vec());
    }

    #[test]
    fn test_subrange_compacting() {
        let mut arrays = [arr(&[0.0, 10.0, 20.0, 30.0, 40.0, 50.0])];
        let got = eval("AA[1:3]", &mut [], &mut arrays, 6).unwrap();
        assert_eq!(vec![10.0, 20.0, 30.0, 0.0, 0.0, 0.0], got.array.unwrap().to_vec());
        assert_eq!(10.0, got.scalar);
    }

    #[test]
    fn test_subrange_in_place() {
        let mut arrays = [arr(&[0.0, 10.0, 20.0, 30.0, 40.0, 50.0])];
        let got = eval("AA{1:3}", &mut [], &mut arrays, 6).unwrap();
        // buffer contents preserved; only the window narrows
        assert_eq!(vec![0.0, 10.0, 20.0, 30.0, 40.0, 50.0], got.array.unwrap().to_vec());
        assert_eq!(10.0, got.scalar);
    }

    #[test]
    fn test_windowed_average() {
        let mut arrays = [arr(&[0.0, 0.0, 4.0, 6.0, 8.0, 10.0])];
        let got = eval("AVG(AA{2:5})", &mut [], &mut arrays, 6).unwrap();
        assert_eq!(7.0, got.scalar);
    }

    #[test]
    fn test_reductions() {
        let mut arrays = [arr(&[3.0, -1.0, 7.0, 2.0])];
        assert_eq!(7.0, eval("AMAX(AA)", &mut [], &mut arrays, 4).unwrap().scalar);
        assert_eq!(-1.0, eval("AMIN(AA)", &mut [], &mut arrays, 4).unwrap().scalar);
        assert_eq!(2.0, eval("IXMAX(AA)", &mut [], &mut arrays, 4).unwrap().scalar);
        assert_eq!(1.0, eval("IXMIN(AA)", &mut [], &mut arrays, 4).unwrap().scalar);
        assert_eq!(11.0, eval("SUM(AA)", &mut [], &mut arrays, 4).unwrap().scalar);
        assert_eq!(2.75, eval("AVG(AA)", &mut [], &mut arrays, 4).unwrap().scalar);
    }

    #[test]
    fn test_std_uses_n_minus_1() {
        let mut arrays = [arr(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0])];
        let got = eval("STD(AA)", &mut [], &mut arrays, 8).unwrap().scalar;
        assert!(approx_eq!(f64, 2.138_089_935, got, epsilon = 1e-6), "{got}");
    }

    #[test]
    fn test_first_zero_crossing() {
        let mut arrays = [arr(&[2.0, 1.0, -1.0, -2.0])];
        // crosses zero halfway between indices 1 and 2
        assert_eq!(1.5, eval("IXZ(AA)", &mut [], &mut arrays, 4).unwrap().scalar);
        let mut arrays = [arr(&[1.0, 2.0, 3.0, 4.0])];
        assert_eq!(-1.0, eval("IXZ(AA)", &mut [], &mut arrays, 4).unwrap().scalar);
        let mut arrays = [arr(&[0.0, 0.0, 5.0, 0.0])];
        assert_eq!(2.0, eval("IXNZ(AA)", &mut [], &mut arrays, 4).unwrap().scalar);
    }

    #[test]
    fn test_cum() {
        let mut arrays = [arr(&[1.0, 2.0, 3.0, 4.0])];
        let got = eval("CUM(AA)", &mut [], &mut arrays, 4).unwrap();
        assert_eq!(vec![1.0, 3.0, 6.0, 10.0], got.array.unwrap().to_vec());
    }

    #[test]
    fn test_smoo_and_nsmoo() {
        let mut arrays = [arr(&[0.0, 0.0, 4.0, 0.0, 0.0])];
        let one = eval("SMOO(AA)", &mut [], &mut arrays, 5).unwrap();
        assert_eq!(vec![0.0, 1.0, 2.0, 1.0, 0.0], one.array.unwrap().to_vec());
        let two = eval("NSMOO(AA, 2)", &mut [], &mut arrays, 5).unwrap();
        assert_eq!(vec![0.0, 1.0, 1.5, 1.0, 0.0], two.array.unwrap().to_vec());
    }

    #[test]
    fn test_deriv_of_ramp() {
        let mut arrays = [arr(&[0.0, 2.0, 4.0, 6.0])];
        let got = eval("DERIV(AA)", &mut [], &mut arrays, 4).unwrap();
        assert_eq!(vec![2.0, 2.0, 2.0, 2.0], got.array.unwrap().to_vec());
    }

    #[test]
    fn test_fitq_writes_coefficients() {
        // y = 1 + 2x + 3x^2
        let data: Vec<f64> = (0..6).map(|i| {
            let x = i as f64;
            1.0 + 2.0 * x + 3.0 * x * x
        }).collect();
        let mut arrays = [arr(&data)];
        let mut scalars = [0.0; 4];
        let got = eval("FITQ(AA, B, C, D)", &mut scalars, &mut arrays, 6).unwrap();
        assert!(approx_eq!(f64, 1.0, scalars[1], epsilon = 1e-7));
        assert!(approx_eq!(f64, 2.0, scalars[2], epsilon = 1e-7));
        assert!(approx_eq!(f64, 3.0, scalars[3], epsilon = 1e-7));
        let fitted = got.array.unwrap();
        assert!(approx_eq!(f64, data[4], fitted[4], epsilon = 1e-6));
    }

    #[test]
    fn test_cat_extends_window() {
        let mut arrays = [arr(&[1.0, 2.0, 0.0, 0.0, 0.0]), arr(&[9.0, 8.0, 0.0, 0.0, 0.0])];
        let got = eval("CAT(AA[0:1], BB[0:1])", &mut [], &mut arrays, 5).unwrap();
        assert_eq!(vec![1.0, 2.0, 9.0, 8.0, 0.0], got.array.unwrap().to_vec());
    }

    #[test]
    fn test_array_shift_whole_samples() {
        let mut arrays = [arr(&[1.0, 2.0, 3.0, 4.0])];
        let right = eval("AA>>1", &mut [], &mut arrays, 4).unwrap();
        assert_eq!(vec![0.0, 1.0, 2.0, 3.0], right.array.unwrap().to_vec());
        let left = eval("AA<<1", &mut [], &mut arrays, 4).unwrap();
        assert_eq!(vec![2.0, 3.0, 4.0, 0.0], left.array.unwrap().to_vec());
    }

    #[test]
    fn test_array_shift_fractional() {
        let mut arrays = [arr(&[0.0, 4.0, 8.0, 4.0])];
        let got = eval("AA>>0.5", &mut [], &mut arrays, 4).unwrap();
        assert_eq!(vec![0.0, 2.0, 6.0, 6.0], got.array.unwrap().to_vec());
    }

    #[test]
    fn test_index_and_random_constants() {
        let got = eval("IX", &mut [], &mut [], 4).unwrap();
        assert_eq!(vec![0.0, 1.0, 2.0, 3.0], got.array.unwrap().to_vec());

        let v = eval("RNDM", &mut [], &mut [], 1).unwrap().scalar;
        assert!((0.0..1.0).contains(&v));
        let got = eval("ARNDM", &mut [], &mut [], 8).unwrap();
        assert!(got.array.unwrap().iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn test_constants() {
        assert!(approx_eq!(f64, std::f64::consts::PI, eval_scalar("PI"), ulps = 1));
        assert!(approx_eq!(f64, 1.0, eval_scalar("90*D2R - PI/2 + 1"), epsilon = 1e-12));
        assert!(approx_eq!(f64, 90.0, eval_scalar("PI/2*R2D"), epsilon = 1e-9));
    }

    #[test]
    fn test_domain_substitution() {
        assert_eq!(0.0, eval_scalar("SQRT(0-4)"));
        assert_eq!(0.0, eval_scalar("LOG(0-4)"));
        assert_eq!(0.0, eval_scalar("ACOS(2) - ACOS(1)"));
    }

    #[test]
    fn test_nan_gate() {
        let program = compile("SQRT(4)/SQRT(4) - 1 + ASIN(1)*0").unwrap();
        let pool = Arc::new(ScratchPool::new());
        let mut vm = Vm::new(pool);
        let mut bindings = Bindings::new(&mut [], &mut []);
        assert!(vm.eval(&program, &mut bindings, 1).is_ok());

        // 0**-1 is infinite
        let program = compile("0**(0-1)").unwrap();
        let err = vm
            .eval(&program, &mut Bindings::new(&mut [], &mut []), 1)
            .unwrap_err();
        assert_eq!(crate::common::ErrorCode::NonFiniteResult, err.code);
    }

    #[test]
    fn test_empty_program() {
        let program = compile("").unwrap();
        let pool = Arc::new(ScratchPool::new());
        let mut vm = Vm::new(pool);
        let err = vm
            .eval(&program, &mut Bindings::new(&mut [], &mut []), 1)
            .unwrap_err();
        assert_eq!(crate::common::ErrorCode::EmptyProgram, err.code);
    }

    #[test]
    fn test_until_loop_with_side_effects() {
        let mut scalars = [0.0];
        let got = eval(
            "A:=0; (0 UNTIL (A:=A+1; A>=10)) + A",
            &mut scalars,
            &mut [],
            1,
        )
        .unwrap();
        assert_eq!(10.0, got.scalar);
        assert_eq!(10.0, scalars[0]);
    }

    #[test]
    fn test_degenerate_until_terminates() {
        // the condition never becomes true; the loop bound kicks in
        let pool = Arc::new(ScratchPool::new());
        let mut vm = Vm::new(pool).with_loop_max(50);
        let program = compile("0 UNTIL 0").unwrap();
        let got = vm
            .eval(&program, &mut Bindings::new(&mut [], &mut []), 1)
            .unwrap();
        assert_eq!(0.0, got.scalar);
    }

    #[test]
    fn test_out_of_slot_access_degrades() {
        // two scalar slots declared; C is beyond them
        let mut scalars = [1.0, 2.0];
        let got = eval("C + 5", &mut scalars, &mut [], 1).unwrap();
        assert_eq!(5.0, got.scalar);
        // store beyond the declared slots is dropped
        let got = eval("C := 9; A", &mut scalars, &mut [], 1).unwrap();
        assert_eq!(1.0, got.scalar);
    }

    #[test]
    fn test_to_scalar_and_to_array_opcodes() {
        let mut b = ProgramBuilder::new();
        b.push(Opcode::LoadArray { slot: 0 });
        b.push(Opcode::ToScalar);
        let program = b.finish();
        let pool = Arc::new(ScratchPool::new());
        let mut vm = Vm::new(pool);
        let mut arrays = [arr(&[4.0, 5.0, 6.0])];
        let got = vm
            .eval(&program, &mut Bindings::new(&mut [], &mut arrays), 3)
            .unwrap();
        assert_eq!(4.0, got.scalar);
        assert!(got.array.is_none());

        let mut b = ProgramBuilder::new();
        b.push(Opcode::LoadInt { value: 3 });
        b.push(Opcode::ToArray);
        let program = b.finish();
        let got = vm
            .eval(&program, &mut Bindings::new(&mut [], &mut []), 3)
            .unwrap();
        assert_eq!(vec![3.0, 3.0, 3.0], got.array.unwrap().to_vec());
    }

    #[test]
    fn test_finite_and_isnan() {
        assert_eq!(1.0, eval_scalar("FINITE(1, 2, 3)"));
        assert_eq!(0.0, eval_scalar("ISNAN(1, 2)"));
        let mut arrays = [arr(&[1.0, f64::NAN, 3.0])];
        assert_eq!(0.0, eval("FINITE(AA)", &mut [], &mut arrays, 3).unwrap().scalar);
        assert_eq!(1.0, eval("ISNAN(AA)", &mut [], &mut arrays, 3).unwrap().scalar);
    }

    #[test]
    fn test_vararg_minmax_broadcast() {
        let mut arrays = [arr(&[1.0, 5.0, 9.0])];
        let got = eval("MAX(AA, 4)", &mut [], &mut arrays, 3).unwrap();
        assert_eq!(vec![4.0, 5.0, 9.0], got.array.unwrap().to_vec());
        let got = eval("MIN(AA, 4, 2)", &mut [], &mut arrays, 3).unwrap();
        assert_eq!(vec![1.0, 2.0, 2.0], got.array.unwrap().to_vec());
        assert_eq!(9.0, eval_scalar("MAX(1, 9, 4)"));
    }

    #[test]
    fn test_stack_imbalance_is_reported() {
        let mut b = ProgramBuilder::new();
        b.push(Opcode::LoadInt { value: 1 });
        b.push(Opcode::LoadInt { value: 2 });
        let program = b.finish();
        let pool = Arc::new(ScratchPool::new());
        let mut vm = Vm::new(pool);
        let err = vm
            .eval(&program, &mut Bindings::new(&mut [], &mut []), 1)
            .unwrap_err();
        assert_eq!(crate::common::ErrorCode::StackImbalance, err.code);
    }
}

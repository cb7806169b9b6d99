// Copyright 2026 The Arraycalc Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Numeric helpers behind the array builtins, plus the non-cryptographic
//! random generator behind RNDM/NRNDM/ARNDM.

/// Round half away from zero.  Shared by NINT, the bit operators and
/// dynamic slot indices.
pub(crate) fn nint(x: f64) -> f64 {
    if x >= 0.0 {
        (x + 0.5).floor()
    } else {
        (x - 0.5).ceil()
    }
}

/// ANSI-style LCG; 15 bits of state per draw, fixed seed per VM so runs
/// are reproducible.
pub(crate) struct Rng {
    state: u32,
}

impl Rng {
    pub(crate) fn new(seed: u32) -> Self {
        Rng { state: seed }
    }

    /// Uniform in [0, 1).
    pub(crate) fn uniform(&mut self) -> f64 {
        self.state = self.state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        ((self.state >> 16) & 0x7fff) as f64 / 32768.0
    }

    /// Standard normal via Box-Muller over two uniform draws.
    pub(crate) fn normal(&mut self) -> f64 {
        let mut u1 = self.uniform();
        while u1 <= 0.0 {
            u1 = self.uniform();
        }
        let u2 = self.uniform();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}

/// One 3-point binomial smoothing pass (1/4, 1/2, 1/4); endpoints are
/// left as-is.
pub(crate) fn smooth(w: &mut [f64]) {
    if w.len() < 3 {
        return;
    }
    let mut prev = w[0];
    for i in 1..w.len() - 1 {
        let cur = w[i];
        w[i] = 0.25 * prev + 0.5 * cur + 0.25 * w[i + 1];
        prev = cur;
    }
}

/// dy/dx by central differences, one-sided at the endpoints.
pub(crate) fn deriv(x: &[f64], y: &[f64], d: &mut [f64]) {
    let n = y.len();
    debug_assert!(x.len() == n && d.len() == n);
    if n < 2 {
        if n == 1 {
            d[0] = 0.0;
        }
        return;
    }
    d[0] = slope(x[1] - x[0], y[1] - y[0]);
    d[n - 1] = slope(x[n - 1] - x[n - 2], y[n - 1] - y[n - 2]);
    for i in 1..n - 1 {
        d[i] = slope(x[i + 1] - x[i - 1], y[i + 1] - y[i - 1]);
    }
}

fn slope(dx: f64, dy: f64) -> f64 {
    if dx == 0.0 { 0.0 } else { dy / dx }
}

/// dy/dx where each point's derivative is the least-squares line slope
/// over a window of `half` neighbors on each side.
pub(crate) fn nderiv(x: &[f64], y: &[f64], d: &mut [f64], half: usize) {
    let n = y.len();
    debug_assert!(x.len() == n && d.len() == n);
    if half == 0 {
        deriv(x, y, d);
        return;
    }
    for i in 0..n {
        let lo = i.saturating_sub(half);
        let hi = (i + half).min(n.saturating_sub(1));
        d[i] = lsq_slope(&x[lo..=hi], &y[lo..=hi]);
    }
}

fn lsq_slope(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    if x.len() < 2 {
        return 0.0;
    }
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for i in 0..x.len() {
        sxy += (x[i] - mx) * (y[i] - my);
        sxx += (x[i] - mx) * (x[i] - mx);
    }
    if sxx == 0.0 { 0.0 } else { sxy / sxx }
}

/// Least-squares quadratic fit of y against x.  `mask` (when given)
/// selects the points that participate: nonzero means include.  Returns
/// `[a0, a1, a2]` for `a0 + a1*x + a2*x^2`, or `None` when fewer than
/// three points survive or the normal equations are singular.
pub(crate) fn fitpoly(x: &[f64], y: &[f64], mask: Option<&[f64]>) -> Option<[f64; 3]> {
    debug_assert!(x.len() == y.len());
    let included = |i: usize| match mask {
        Some(m) => m.get(i).map(|&v| v != 0.0).unwrap_or(false),
        None => true,
    };

    let mut n = 0.0;
    // sums of x^1..x^4 and of y, x*y, x^2*y
    let mut sx = [0.0f64; 4];
    let mut sy = [0.0f64; 3];
    for i in 0..x.len() {
        if !included(i) {
            continue;
        }
        n += 1.0;
        let mut xp = x[i];
        for s in sx.iter_mut() {
            *s += xp;
            xp *= x[i];
        }
        sy[0] += y[i];
        sy[1] += x[i] * y[i];
        sy[2] += x[i] * x[i] * y[i];
    }
    if n < 3.0 {
        return None;
    }

    let m = [
        [n, sx[0], sx[1]],
        [sx[0], sx[1], sx[2]],
        [sx[1], sx[2], sx[3]],
    ];
    let det = det3(&m);
    if det == 0.0 || !det.is_finite() {
        return None;
    }

    let mut coeff = [0.0f64; 3];
    for (k, c) in coeff.iter_mut().enumerate() {
        let mut mk = m;
        for row in 0..3 {
            mk[row][k] = sy[row];
        }
        *c = det3(&mk) / det;
    }
    Some(coeff)
}

fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Full width at half maximum: walk outward from the peak to the
/// half-maximum crossings, interpolating between samples.  A side with
/// no crossing falls back to the window boundary.
pub(crate) fn fwhm(y: &[f64]) -> f64 {
    if y.len() < 2 {
        return 0.0;
    }
    let mut peak = 0;
    for (i, &v) in y.iter().enumerate() {
        if v > y[peak] {
            peak = i;
        }
    }
    let half = y[peak] / 2.0;

    let mut left = 0.0;
    for i in (0..peak).rev() {
        if y[i] <= half {
            left = i as f64 + cross_frac(y[i], y[i + 1], half);
            break;
        }
    }
    let mut right = (y.len() - 1) as f64;
    for i in peak + 1..y.len() {
        if y[i] <= half {
            right = (i - 1) as f64 + cross_frac(y[i - 1], y[i], half);
            break;
        }
    }
    right - left
}

fn cross_frac(a: f64, b: f64, level: f64) -> f64 {
    if a == b { 0.0 } else { (level - a) / (b - a) }
}

//! Quantisation primitives: affine parameters, fake-quant with STE, and the
//! fixed-point requantisation arithmetic used by the integer kernels.
//!
//! Real values map to integers as `q = clamp(round(x / scale) + zp, qmin, qmax)`
//! and back as `x ≈ (q - zp) * scale`.

use candle_core::{DType, Result, Tensor};
use serde::{Deserialize, Serialize};

/// Narrow symmetric range for weights; keeps `-128` unused so the negated
/// weight is always representable.
pub const WEIGHT_QMIN: i32 = -127;
pub const WEIGHT_QMAX: i32 = 127;

/// Signed 8-bit activation range, halved when the backend reduces range.
pub fn activation_range(reduce_range: bool) -> (i32, i32) {
    if reduce_range {
        (-64, 63)
    } else {
        (-128, 127)
    }
}

// ── Affine parameters ───────────────────────────────────────────────────────

/// Scale / zero point of one tensor, either per tensor or per slice along
/// `axis`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub scales: Vec<f32>,
    pub zero_points: Vec<i32>,
    pub qmin: i32,
    pub qmax: i32,
    pub axis: Option<usize>,
}

impl QuantParams {
    pub fn per_tensor(scale: f32, zero_point: i32, qmin: i32, qmax: i32) -> Self {
        Self {
            scales: vec![scale],
            zero_points: vec![zero_point],
            qmin,
            qmax,
            axis: None,
        }
    }

    pub fn scale(&self) -> f32 {
        self.scales[0]
    }

    pub fn zero_point(&self) -> i32 {
        self.zero_points[0]
    }

    pub fn is_per_channel(&self) -> bool {
        self.axis.is_some()
    }

    pub fn quantize_value(&self, x: f32, channel: usize) -> i32 {
        let (s, zp) = (self.scales[channel] as f64, self.zero_points[channel] as f64);
        ((x as f64 / s).round() + zp).clamp(self.qmin as f64, self.qmax as f64) as i32
    }

    pub fn dequantize_value(&self, q: i32, channel: usize) -> f32 {
        (q - self.zero_points[channel]) as f32 * self.scales[channel]
    }

    /// Broadcastable `(scale, zero_point)` tensors for a tensor of `rank`.
    fn broadcast_tensors(&self, rank: usize, device: &candle_core::Device) -> Result<(Tensor, Tensor)> {
        let mut shape = vec![1usize; rank];
        if let Some(axis) = self.axis {
            shape[axis] = self.scales.len();
        }
        let zps: Vec<f32> = self.zero_points.iter().map(|&z| z as f32).collect();
        let scale = Tensor::from_vec(self.scales.clone(), shape.as_slice(), device)?;
        let zp = Tensor::from_vec(zps, shape.as_slice(), device)?;
        Ok((scale, zp))
    }
}

/// Scale and zero point covering `[min, max]` (always widened to include 0).
///
/// Symmetric parameters centre the range on zero with `zp = 0`; asymmetric
/// ones spend the whole integer range on `[min, max]`.
pub fn choose_qparams(min: f32, max: f32, qmin: i32, qmax: i32, symmetric: bool) -> (f32, i32) {
    let min_neg = min.min(0.0);
    let max_pos = max.max(0.0);
    if symmetric {
        let max_abs = (-min_neg).max(max_pos);
        let scale = (max_abs / ((qmax - qmin) as f32 / 2.0)).max(f32::EPSILON);
        (scale, 0)
    } else {
        let scale = ((max_pos - min_neg) / (qmax - qmin) as f32).max(f32::EPSILON);
        let zp = (qmin as f32 - (min_neg / scale).round()) as i32;
        (scale, zp.clamp(qmin, qmax))
    }
}

/// Symmetric narrow-range weight parameters, per output channel (axis 0)
/// unless `per_tensor`.
pub fn weight_qparams(w: &Tensor, per_tensor: bool) -> Result<QuantParams> {
    if per_tensor {
        let flat = w.flatten_all()?;
        let min = flat.min(0)?.to_scalar::<f32>()?;
        let max = flat.max(0)?.to_scalar::<f32>()?;
        let (scale, zp) = choose_qparams(min, max, WEIGHT_QMIN, WEIGHT_QMAX, true);
        return Ok(QuantParams::per_tensor(scale, zp, WEIGHT_QMIN, WEIGHT_QMAX));
    }
    let rows = w.flatten_from(1)?;
    let mins = rows.min(1)?.to_vec1::<f32>()?;
    let maxs = rows.max(1)?.to_vec1::<f32>()?;
    let (scales, zero_points) = mins
        .iter()
        .zip(&maxs)
        .map(|(&lo, &hi)| choose_qparams(lo, hi, WEIGHT_QMIN, WEIGHT_QMAX, true))
        .unzip();
    Ok(QuantParams {
        scales,
        zero_points,
        qmin: WEIGHT_QMIN,
        qmax: WEIGHT_QMAX,
        axis: Some(0),
    })
}

// ── Fake quantisation ───────────────────────────────────────────────────────

/// Quantise-dequantise `x` in float, with a clipped straight-through
/// gradient.
///
/// The trick: `fq(x).detach() + (x - x.detach()) * in_range`. The forward
/// value is the rounded one; backward passes the gradient unchanged where
/// `x` was representable and zeroes it where it was clamped.
pub fn fake_quantize(x: &Tensor, params: &QuantParams) -> Result<Tensor> {
    let (scale, zp) = params.broadcast_tensors(x.rank(), x.device())?;
    let xd = x.detach();
    let q = xd
        .broadcast_div(&scale)?
        .round()?
        .broadcast_add(&zp)?
        .clamp(params.qmin as f32, params.qmax as f32)?;
    let dq = q.broadcast_sub(&zp)?.broadcast_mul(&scale)?;

    let lo = zp.affine(-1.0, params.qmin as f64)?.broadcast_mul(&scale)?;
    let hi = zp.affine(-1.0, params.qmax as f64)?.broadcast_mul(&scale)?;
    let in_range = (xd.broadcast_ge(&lo)?.to_dtype(DType::F32)?
        * xd.broadcast_le(&hi)?.to_dtype(DType::F32)?)?;
    let residual = (x - &xd)?;
    dq.detach() + (residual * in_range)?
}

// ── Fixed-point requantisation ──────────────────────────────────────────────

/// A real multiplier `m` encoded as `multiplier * 2^(shift - 31)` with a
/// Q31 mantissa in `[2^30, 2^31)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedMultiplier {
    pub multiplier: i32,
    pub shift: i32,
}

impl FixedMultiplier {
    pub fn from_real(m: f64) -> Self {
        if m <= 0.0 || !m.is_finite() {
            return Self {
                multiplier: 0,
                shift: 0,
            };
        }
        let (fraction, mut shift) = frexp(m);
        let mut q = (fraction * (1i64 << 31) as f64).round() as i64;
        if q == 1i64 << 31 {
            q /= 2;
            shift += 1;
        }
        if shift < -31 {
            shift = 0;
            q = 0;
        }
        if shift > 30 {
            shift = 30;
            q = (1i64 << 31) - 1;
        }
        Self {
            multiplier: q as i32,
            shift,
        }
    }

    pub fn as_real(&self) -> f64 {
        self.multiplier as f64 * 2f64.powi(self.shift - 31)
    }

    /// `round(x * m)` in pure integer arithmetic.
    pub fn apply(&self, x: i32) -> i32 {
        let left = self.shift.max(0);
        let right = (-self.shift).max(0);
        let shifted = ((x as i64) << left).clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        rounding_divide_by_pot(saturating_rounding_doubling_high_mul(shifted, self.multiplier), right)
    }
}

/// `m = fraction * 2^exp` with `fraction` in `[0.5, 1)`, for `m > 0`.
fn frexp(m: f64) -> (f64, i32) {
    let mut exp = m.log2().floor() as i32 + 1;
    let mut fraction = m / 2f64.powi(exp);
    if fraction >= 1.0 {
        fraction /= 2.0;
        exp += 1;
    } else if fraction < 0.5 {
        fraction *= 2.0;
        exp -= 1;
    }
    (fraction, exp)
}

/// High 32 bits of `2 * a * b`, rounded to nearest.
pub fn saturating_rounding_doubling_high_mul(a: i32, b: i32) -> i32 {
    if a == i32::MIN && b == i32::MIN {
        return i32::MAX;
    }
    let ab = a as i64 * b as i64;
    let nudge = if ab >= 0 { 1i64 << 30 } else { 1 - (1i64 << 30) };
    ((ab + nudge) / (1i64 << 31)) as i32
}

/// `x / 2^exponent`, rounding half away from zero.
pub fn rounding_divide_by_pot(x: i32, exponent: i32) -> i32 {
    if exponent <= 0 {
        return x;
    }
    let mask = (1i64 << exponent) - 1;
    let remainder = x as i64 & mask;
    let threshold = (mask >> 1) + i64::from(x < 0);
    ((x as i64 >> exponent) + i64::from(remainder > threshold)) as i32
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    #[test]
    fn asymmetric_range_includes_zero() {
        let (scale, zp) = choose_qparams(0.5, 2.55, -128, 127, false);
        // [0, 2.55] over 255 steps
        assert!((scale - 0.01).abs() < 1e-6);
        assert_eq!(zp, -128);
    }

    #[test]
    fn symmetric_weights_have_zero_zp() {
        let (scale, zp) = choose_qparams(-1.27, 0.5, WEIGHT_QMIN, WEIGHT_QMAX, true);
        assert!((scale - 0.01).abs() < 1e-6);
        assert_eq!(zp, 0);
    }

    #[test]
    fn degenerate_range_keeps_positive_scale() {
        let (scale, _) = choose_qparams(0.0, 0.0, -128, 127, false);
        assert!(scale > 0.0);
    }

    #[test]
    fn degenerate_range_saturates_instead_of_overflowing() {
        let (scale, zp) = choose_qparams(0.0, 0.0, -128, 127, false);
        assert_eq!(zp, -128);
        let params = QuantParams::per_tensor(scale, zp, -128, 127);
        assert_eq!(params.quantize_value(-300.0, 0), -128);
        assert_eq!(params.quantize_value(300.0, 0), 127);
        assert_eq!(params.quantize_value(f32::MAX, 0), 127);
        assert_eq!(params.quantize_value(0.0, 0), -128);
    }

    #[test]
    fn per_channel_weight_params() {
        let dev = Device::Cpu;
        let w = Tensor::new(&[[1.27f32, -0.5], [0.1, -2.54]], &dev).unwrap();
        let p = weight_qparams(&w, false).unwrap();
        assert_eq!(p.axis, Some(0));
        assert!((p.scales[0] - 0.01).abs() < 1e-6);
        assert!((p.scales[1] - 0.02).abs() < 1e-6);
        let t = weight_qparams(&w, true).unwrap();
        assert_eq!(t.scales.len(), 1);
        assert!((t.scale() - 0.02).abs() < 1e-6);
    }

    #[test]
    fn fake_quant_rounds_and_clamps() {
        let dev = Device::Cpu;
        let x = Tensor::new(&[0.014f32, -0.5, 3.0], &dev).unwrap();
        let p = QuantParams::per_tensor(0.01, 0, -128, 127);
        let y: Vec<f32> = fake_quantize(&x, &p).unwrap().to_vec1().unwrap();
        assert!((y[0] - 0.01).abs() < 1e-6);
        assert!((y[1] + 0.5).abs() < 1e-6);
        assert!((y[2] - 1.27).abs() < 1e-6);
    }

    #[test]
    fn ste_gradient_is_masked_outside_range() {
        let dev = Device::Cpu;
        let x = Var::new(&[0.2f32, 5.0, -5.0], &dev).unwrap();
        let p = QuantParams::per_tensor(0.01, 0, -128, 127);
        let y = fake_quantize(x.as_tensor(), &p).unwrap();
        let grads = y.sum_all().unwrap().backward().unwrap();
        let g: Vec<f32> = grads.get(x.as_tensor()).unwrap().to_vec1().unwrap();
        assert_eq!(g, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn fixed_multiplier_encoding() {
        let m = FixedMultiplier::from_real(0.5);
        assert_eq!(m.multiplier, 1 << 30);
        assert_eq!(m.shift, 0);
        let m = FixedMultiplier::from_real(0.0123);
        assert!((m.as_real() - 0.0123).abs() < 1e-9);
        assert_eq!(FixedMultiplier::from_real(0.0).multiplier, 0);
    }

    #[test]
    fn fixed_multiplier_matches_float_rounding() {
        for &real in &[0.0123f64, 0.25, 0.7, 1.5, 3.9e-4] {
            let m = FixedMultiplier::from_real(real);
            for x in [-100_000i32, -1234, -1, 0, 1, 77, 5000, 123_456] {
                let expected = (x as f64 * real).round() as i32;
                assert!(
                    (m.apply(x) - expected).abs() <= 1,
                    "m={real} x={x}: {} vs {expected}",
                    m.apply(x)
                );
            }
        }
    }

    #[test]
    fn rounding_divide_rounds_half_away_from_zero() {
        assert_eq!(rounding_divide_by_pot(5, 1), 3);
        assert_eq!(rounding_divide_by_pot(-5, 1), -3);
        assert_eq!(rounding_divide_by_pot(4, 1), 2);
        assert_eq!(rounding_divide_by_pot(7, 0), 7);
    }

    #[test]
    fn high_mul_saturates() {
        assert_eq!(saturating_rounding_doubling_high_mul(i32::MIN, i32::MIN), i32::MAX);
        assert_eq!(saturating_rounding_doubling_high_mul(1 << 30, 1 << 30), 1 << 29);
    }
}

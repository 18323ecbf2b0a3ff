//! Reference int8 kernels with int32 accumulation.
//!
//! For every output element:
//!
//! ```text
//! acc  = bias[c] + Σ w[c, k] * (in[k] + input_offset)
//! out  = clamp(M[c](acc) + output_offset, act_min, act_max)
//! ```
//!
//! `input_offset` is the negated input zero point and `M[c]` the per-channel
//! fixed-point multiplier `s_in * s_w[c] / s_out`. Padded taps contribute 0.

use serde::{Deserialize, Serialize};

use crate::quantize::FixedMultiplier;

/// Output requantisation of one integer op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requant {
    pub input_offset: i32,
    pub output_offset: i32,
    /// One entry per output channel.
    pub multipliers: Vec<FixedMultiplier>,
    pub act_min: i32,
    pub act_max: i32,
}

impl Requant {
    #[inline]
    fn output(&self, acc: i32, channel: usize) -> i8 {
        let v = self.multipliers[channel].apply(acc).saturating_add(self.output_offset);
        v.clamp(self.act_min, self.act_max) as i8
    }
}

/// Geometry of a square-kernel 2-D convolution over one `C×H×W` sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvGeometry {
    pub in_channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl ConvGeometry {
    pub fn out_h(&self) -> usize {
        (self.in_h + 2 * self.padding - self.kernel) / self.stride + 1
    }

    pub fn out_w(&self) -> usize {
        (self.in_w + 2 * self.padding - self.kernel) / self.stride + 1
    }

    pub fn output_len(&self) -> usize {
        self.out_channels * self.out_h() * self.out_w()
    }
}

/// `O×C×K×K` weights over one `C×H×W` sample; returns `O×OH×OW`.
pub fn conv2d_i8(input: &[i8], weights: &[i8], bias: &[i32], g: &ConvGeometry, rq: &Requant) -> Vec<i8> {
    let (oh, ow) = (g.out_h(), g.out_w());
    let k = g.kernel;
    let mut out = Vec::with_capacity(g.output_len());
    for oc in 0..g.out_channels {
        let filter = &weights[oc * g.in_channels * k * k..(oc + 1) * g.in_channels * k * k];
        for oy in 0..oh {
            for ox in 0..ow {
                let mut acc: i32 = 0;
                for ic in 0..g.in_channels {
                    for ky in 0..k {
                        let iy = (oy * g.stride + ky) as isize - g.padding as isize;
                        if iy < 0 || iy >= g.in_h as isize {
                            continue;
                        }
                        for kx in 0..k {
                            let ix = (ox * g.stride + kx) as isize - g.padding as isize;
                            if ix < 0 || ix >= g.in_w as isize {
                                continue;
                            }
                            let x = input[(ic * g.in_h + iy as usize) * g.in_w + ix as usize] as i32;
                            let w = filter[(ic * k + ky) * k + kx] as i32;
                            acc += w * (x + rq.input_offset);
                        }
                    }
                }
                acc = acc.saturating_add(bias.get(oc).copied().unwrap_or(0));
                out.push(rq.output(acc, oc));
            }
        }
    }
    out
}

/// `O×I` weights over an `I`-vector; returns `O` values.
pub fn fully_connected_i8(input: &[i8], weights: &[i8], bias: &[i32], out_features: usize, rq: &Requant) -> Vec<i8> {
    let in_features = input.len();
    (0..out_features)
        .map(|o| {
            let row = &weights[o * in_features..(o + 1) * in_features];
            let acc = row
                .iter()
                .zip(input)
                .map(|(&w, &x)| w as i32 * (x as i32 + rq.input_offset))
                .sum::<i32>()
                .saturating_add(bias.get(o).copied().unwrap_or(0));
            rq.output(acc, o)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_requant(channels: usize, input_zp: i32, output_zp: i32) -> Requant {
        Requant {
            input_offset: -input_zp,
            output_offset: output_zp,
            multipliers: vec![FixedMultiplier::from_real(1.0); channels],
            act_min: -128,
            act_max: 127,
        }
    }

    #[test]
    fn fully_connected_applies_offsets_and_bias() {
        // w = [[1, 2], [-1, 0]], x - zp = [3, 4]
        let out = fully_connected_i8(&[5, 6], &[1, 2, -1, 0], &[10, 0], 2, &unit_requant(2, 2, 1));
        assert_eq!(out, vec![1 * 3 + 2 * 4 + 10 + 1, -3 + 1]);
    }

    #[test]
    fn fully_connected_saturates_and_fuses_relu() {
        let mut rq = unit_requant(2, 0, -5);
        rq.act_min = -5;
        let out = fully_connected_i8(&[100, 100], &[1, 1, -1, -1], &[], 2, &rq);
        assert_eq!(out, vec![127, -5]);
    }

    #[test]
    fn saturated_bias_and_offset_clamp_without_overflow() {
        let rq = unit_requant(2, 0, 127);
        let out = fully_connected_i8(&[127, 127], &[127, 127, -127, -127], &[i32::MAX, i32::MIN], 2, &rq);
        assert_eq!(out, vec![127, -128]);
    }

    #[test]
    fn conv_padding_contributes_zero() {
        // 1×2×2 input, one 3×3 all-ones filter, padding 1 → every output sums
        // the whole input.
        let g = ConvGeometry {
            in_channels: 1,
            in_h: 2,
            in_w: 2,
            out_channels: 1,
            kernel: 3,
            stride: 1,
            padding: 1,
        };
        let input = [1i8 + 3, 2 + 3, 3 + 3, 4 + 3];
        let out = conv2d_i8(&input, &[1; 9], &[0], &g, &unit_requant(1, 3, 0));
        assert_eq!(out, vec![10, 10, 10, 10]);
    }

    #[test]
    fn conv_stride_and_multiplier() {
        let g = ConvGeometry {
            in_channels: 1,
            in_h: 4,
            in_w: 4,
            out_channels: 1,
            kernel: 2,
            stride: 2,
            padding: 0,
        };
        assert_eq!((g.out_h(), g.out_w()), (2, 2));
        let input: Vec<i8> = (0..16).collect();
        let mut rq = unit_requant(1, 0, 0);
        rq.multipliers = vec![FixedMultiplier::from_real(0.5)];
        let out = conv2d_i8(&input, &[1, 1, 1, 1], &[0], &g, &rq);
        // window sums: 10, 18, 42, 50 → halved
        assert_eq!(out, vec![5, 9, 21, 25]);
    }
}

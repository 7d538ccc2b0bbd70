//! Host reference kernels
//!
//! Plain NCHW implementations of every shader-backed operator. Device
//! results are compared against these in the smoke runner and device tests.

use crate::ensure_contract;
use crate::error::Result;
use crate::ops::{Conv2dParams, Pool2dParams};

fn check_len(op: &str, what: &str, data: &[f32], shape: &[usize]) -> Result<()> {
    let expected: usize = shape.iter().product();
    ensure_contract!(
        data.len() == expected,
        "{}: {} has {} elements, shape {:?} needs {}",
        op,
        what,
        data.len(),
        shape,
        expected
    );
    Ok(())
}

/// Nearest-neighbour upsample; source index is `min(floor(dst * scale), I - 1)`.
pub fn upsample_nearest2d(
    input: &[f32],
    shape: [usize; 4],
    output_size: [usize; 2],
    scale_h: f32,
    scale_w: f32,
) -> Result<Vec<f32>> {
    check_len("upsample_nearest2d", "input", input, &shape)?;
    let [n, c, ih, iw] = shape;
    let [oh, ow] = output_size;

    let mut output = Vec::with_capacity(n * c * oh * ow);
    for plane in input.chunks((ih * iw).max(1)).take(n * c) {
        for oy in 0..oh {
            let iy = ((oy as f32 * scale_h).floor() as usize).min(ih.saturating_sub(1));
            for ox in 0..ow {
                let ix = ((ox as f32 * scale_w).floor() as usize).min(iw.saturating_sub(1));
                output.push(plane[iy * iw + ix]);
            }
        }
    }
    Ok(output)
}

/// Adaptive average pool; output cell `o` averages `[floor(o*I/O), ceil((o+1)*I/O))`.
pub fn adaptive_avg_pool2d(input: &[f32], shape: [usize; 4], output_size: [usize; 2]) -> Result<Vec<f32>> {
    check_len("adaptive_avg_pool2d", "input", input, &shape)?;
    let [n, c, ih, iw] = shape;
    let [oh, ow] = output_size;
    ensure_contract!(oh > 0 && ow > 0, "adaptive_avg_pool2d: empty output size");

    let window = |o: usize, i: usize, out: usize| (o * i / out, ((o + 1) * i).div_ceil(out));

    let mut output = Vec::with_capacity(n * c * oh * ow);
    for plane in input.chunks((ih * iw).max(1)).take(n * c) {
        for oy in 0..oh {
            let (y0, y1) = window(oy, ih, oh);
            for ox in 0..ow {
                let (x0, x1) = window(ox, iw, ow);
                let mut sum = 0.0f32;
                for y in y0..y1 {
                    for x in x0..x1 {
                        sum += plane[y * iw + x];
                    }
                }
                let count = ((y1 - y0) * (x1 - x0)).max(1);
                output.push(sum / count as f32);
            }
        }
    }
    Ok(output)
}

/// Max pool; padded positions never win.
pub fn max_pool2d(input: &[f32], shape: [usize; 4], params: &Pool2dParams) -> Result<Vec<f32>> {
    check_len("max_pool2d", "input", input, &shape)?;
    let [n, c, ih, iw] = shape;
    let [oh, ow] = params.output_size([ih, iw])?;

    let mut output = Vec::with_capacity(n * c * oh * ow);
    for plane in input.chunks((ih * iw).max(1)).take(n * c) {
        for oy in 0..oh {
            for ox in 0..ow {
                let mut best = f32::NEG_INFINITY;
                for ky in 0..params.kernel[0] {
                    let y = (oy * params.stride[0] + ky * params.dilation[0]) as isize
                        - params.padding[0] as isize;
                    if y < 0 || y >= ih as isize {
                        continue;
                    }
                    for kx in 0..params.kernel[1] {
                        let x = (ox * params.stride[1] + kx * params.dilation[1]) as isize
                            - params.padding[1] as isize;
                        if x < 0 || x >= iw as isize {
                            continue;
                        }
                        best = best.max(plane[y as usize * iw + x as usize]);
                    }
                }
                output.push(best);
            }
        }
    }
    Ok(output)
}

/// `a + alpha * b`
pub fn add(a: &[f32], b: &[f32], alpha: f32) -> Result<Vec<f32>> {
    ensure_contract!(
        a.len() == b.len(),
        "add: operands have {} and {} elements",
        a.len(),
        b.len()
    );
    Ok(a.iter().zip(b).map(|(x, y)| x + alpha * y).collect())
}

pub fn add_scalar(input: &[f32], s: f32) -> Vec<f32> {
    input.iter().map(|x| x + s).collect()
}

pub fn mul_scalar(input: &[f32], s: f32) -> Vec<f32> {
    input.iter().map(|x| x * s).collect()
}

pub fn clamp(input: &[f32], min: Option<f32>, max: Option<f32>) -> Vec<f32> {
    let min = min.unwrap_or(f32::NEG_INFINITY);
    let max = max.unwrap_or(f32::INFINITY);
    input.iter().map(|x| x.max(min).min(max)).collect()
}

/// Grouped convolution with fused clamp. `weights` is `[OC, C/G, KH, KW]`.
pub fn conv2d(
    input: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    params: &Conv2dParams,
    output_min: Option<f32>,
    output_max: Option<f32>,
) -> Result<Vec<f32>> {
    const OP: &str = "conv2d";
    let p = params;
    check_len(OP, "input", input, &[p.n, p.c, p.h, p.w])?;
    let ic_per_group = p.c / p.groups;
    check_len(OP, "weights", weights, &[p.oc, ic_per_group, p.kh, p.kw])?;
    if let Some(bias) = bias {
        check_len(OP, "bias", bias, &[p.oc])?;
    }
    let oc_per_group = p.oc / p.groups;
    let min = output_min.unwrap_or(f32::NEG_INFINITY);
    let max = output_max.unwrap_or(f32::INFINITY);

    let mut output = Vec::with_capacity(p.n * p.oc * p.oh * p.ow);
    for b in 0..p.n {
        for oc in 0..p.oc {
            let group = oc / oc_per_group;
            for oy in 0..p.oh {
                for ox in 0..p.ow {
                    let mut acc = bias.map_or(0.0, |bias| bias[oc]);
                    for icg in 0..ic_per_group {
                        let ic = group * ic_per_group + icg;
                        for ky in 0..p.kh {
                            let y = (oy * p.stride[0] + ky * p.dilation[0]) as isize
                                - p.padding[0] as isize;
                            if y < 0 || y >= p.h as isize {
                                continue;
                            }
                            for kx in 0..p.kw {
                                let x = (ox * p.stride[1] + kx * p.dilation[1]) as isize
                                    - p.padding[1] as isize;
                                if x < 0 || x >= p.w as isize {
                                    continue;
                                }
                                let src = ((b * p.c + ic) * p.h + y as usize) * p.w + x as usize;
                                let w = ((oc * ic_per_group + icg) * p.kh + ky) * p.kw + kx;
                                acc += input[src] * weights[w];
                            }
                        }
                    }
                    output.push(acc.max(min).min(max));
                }
            }
        }
    }
    Ok(output)
}

/// `beta * t + alpha * (m1 @ m2)` for `m1: [M, K]`, `m2: [K, N]`.
pub fn addmm(
    m1: &[f32],
    m2: &[f32],
    t: Option<&[f32]>,
    (m, k, n): (usize, usize, usize),
    beta: f32,
    alpha: f32,
) -> Result<Vec<f32>> {
    check_len("addmm", "m1", m1, &[m, k])?;
    check_len("addmm", "m2", m2, &[k, n])?;
    if let Some(t) = t {
        check_len("addmm", "t", t, &[m, n])?;
    }

    let mut output = Vec::with_capacity(m * n);
    for row in 0..m {
        for col in 0..n {
            let dot: f32 = (0..k).map(|i| m1[row * k + i] * m2[i * n + col]).sum();
            output.push(match t {
                Some(t) => beta * t[row * n + col] + alpha * dot,
                None => dot,
            });
        }
    }
    Ok(output)
}

pub fn mm(m1: &[f32], m2: &[f32], dims: (usize, usize, usize)) -> Result<Vec<f32>> {
    addmm(m1, m2, None, dims, 0.0, 1.0)
}

/// Spatial mean of an `[N, C, H, W]` input, `N*C` values.
pub fn mean(input: &[f32], shape: [usize; 4]) -> Result<Vec<f32>> {
    check_len("mean", "input", input, &shape)?;
    let [n, c, h, w] = shape;
    let area = h * w;
    if area == 0 {
        return Ok(vec![0.0; n * c]);
    }
    Ok(input
        .chunks(area)
        .map(|plane| plane.iter().sum::<f32>() / area as f32)
        .collect())
}

/// Largest absolute difference, or `None` if the lengths differ.
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    Some(a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32 - (n as f32) / 2.0).collect()
    }

    #[test]
    fn test_clamp_bounds_and_passthrough() {
        let x = ramp(40);
        let (min, max) = (-3.5, 7.25);
        let result = clamp(&x, Some(min), Some(max));
        for (xi, ri) in x.iter().zip(&result) {
            assert!(min <= *ri && *ri <= max);
            if min <= *xi && *xi <= max {
                assert_eq!(xi, ri);
            }
        }
        assert_eq!(clamp(&x, None, None), x);
    }

    #[test]
    fn test_add_commutes() {
        let a = ramp(24);
        let b: Vec<f32> = ramp(24).iter().map(|v| v * 0.37 + 1.0).collect();
        assert_eq!(add(&a, &b, 1.0).unwrap(), add(&b, &a, 1.0).unwrap());
        assert_eq!(add(&a, &b, 2.0).unwrap()[3], a[3] + 2.0 * b[3]);
        assert!(add(&a, &b[..3], 1.0).is_err());
    }

    #[test]
    fn test_depthwise_identity_kernel() {
        // 1x2x4x4, kernel with a single 1 at the centre of channel 0 and a
        // shift-right kernel on channel 1.
        let input: Vec<f32> = (0..32).map(|i| i as f32).collect();
        let mut weights = vec![0.0; 2 * 9];
        weights[4] = 1.0;
        weights[9 + 3] = 1.0;
        let params = Conv2dParams::new(&[1, 2, 4, 4], &[2, 1, 3, 3], [1, 1], [1, 1], [1, 1], 2).unwrap();

        let out = conv2d(&input, &weights, Some(&[0.5, -1.0]), &params, None, None).unwrap();
        let expected_c0: Vec<f32> = (0..16).map(|i| i as f32 + 0.5).collect();
        assert_eq!(&out[..16], expected_c0.as_slice());

        // Tap at (ky=1, kx=0) reads x-1.
        let expected_c1: Vec<f32> = (0..16)
            .map(|i| {
                let (y, x) = (i / 4, i % 4);
                if x == 0 {
                    -1.0
                } else {
                    (16 + y * 4 + x - 1) as f32 - 1.0
                }
            })
            .collect();
        assert_eq!(&out[16..], expected_c1.as_slice());
    }

    #[test]
    fn test_conv_fused_clamp() {
        let params = Conv2dParams::new(&[1, 1, 2, 2], &[1, 1, 1, 1], [1, 1], [0, 0], [1, 1], 1).unwrap();
        let out = conv2d(&[-2.0, 1.0, 5.0, 9.0], &[1.0], None, &params, Some(0.0), Some(6.0)).unwrap();
        assert_eq!(out, vec![0.0, 1.0, 5.0, 6.0]);
    }

    #[test]
    fn test_mean_of_constant() {
        for (h, w) in [(1, 1), (3, 5), (7, 2)] {
            let input = vec![2.5; h * w];
            assert_eq!(mean(&input, [1, 1, h, w]).unwrap(), vec![2.5]);
        }
        assert_eq!(mean(&[1.0, 3.0, 10.0, 20.0], [1, 2, 1, 2]).unwrap(), vec![2.0, 15.0]);
    }

    #[test]
    fn test_mm() {
        let m1 = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let m2 = [1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        assert_eq!(mm(&m1, &m2, (2, 3, 2)).unwrap(), vec![4.0, 5.0, 10.0, 11.0]);

        let t = [1.0; 4];
        assert_eq!(
            addmm(&m1, &m2, Some(&t), (2, 3, 2), 2.0, 0.5).unwrap(),
            vec![4.0, 4.5, 7.0, 7.5]
        );
    }

    #[test]
    fn test_pooling() {
        let input: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let params = Pool2dParams::new([2, 2], [2, 2], [0, 0], [1, 1]);
        assert_eq!(
            max_pool2d(&input, [1, 1, 4, 4], &params).unwrap(),
            vec![5.0, 7.0, 13.0, 15.0]
        );
        assert_eq!(
            adaptive_avg_pool2d(&input, [1, 1, 4, 4], [1, 1]).unwrap(),
            vec![7.5]
        );
        assert_eq!(
            adaptive_avg_pool2d(&input, [1, 1, 4, 4], [2, 2]).unwrap(),
            vec![2.5, 4.5, 10.5, 12.5]
        );
    }

    #[test]
    fn test_upsample_nearest() {
        let out = upsample_nearest2d(&[1.0, 2.0, 3.0, 4.0], [1, 1, 2, 2], [4, 4], 0.5, 0.5).unwrap();
        assert_eq!(&out[..8], &[1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0]);
        assert_eq!(&out[8..12], &[3.0, 3.0, 4.0, 4.0]);
    }

    #[test]
    fn test_max_abs_diff() {
        assert_eq!(max_abs_diff(&[1.0, 2.0], &[1.5, 1.0]), Some(1.0));
        assert_eq!(max_abs_diff(&[1.0], &[]), None);
    }
}

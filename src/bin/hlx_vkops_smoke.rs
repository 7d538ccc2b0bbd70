//! HLX Vulkan operator smoke test
//!
//! Runs every operator once on small deterministic inputs and compares the
//! device result with the host reference kernels.
//!
//! Usage:
//!   hlx_vkops_smoke --shader-dir build/shaders
//!   hlx_vkops_smoke --only conv2d_depthwise --validation

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use hlx_vkops::ops::{self, Bias, Conv2dParams, Conv2dPrepacked, Pool2dParams};
use hlx_vkops::{reference, repack, EngineConfig, Result, VulkanContext, VulkanTensor};

#[derive(Parser)]
#[command(
    name = "hlx_vkops_smoke",
    about = "Check every HLX Vulkan operator against the host reference",
    version
)]
struct Cli {
    /// GPU index (overrides HLX_VKOPS_DEVICE)
    #[arg(long)]
    device: Option<usize>,
    /// Directory with compiled operator shaders (overrides HLX_VKOPS_SHADER_DIR)
    #[arg(long)]
    shader_dir: Option<PathBuf>,
    /// Enable Vulkan validation layers
    #[arg(long)]
    validation: bool,
    /// Largest accepted absolute difference per element
    #[arg(long, default_value_t = 1e-3)]
    tolerance: f32,
    /// Run a single operator by name
    #[arg(long)]
    only: Option<String>,
}

/// Device output and expected output for one operator.
type Outcome = (Vec<f32>, Vec<f32>);
type Case = fn(&VulkanContext) -> Result<Outcome>;

const CASES: &[(&str, Case)] = &[
    ("upsample_nearest2d", upsample_nearest2d),
    ("adaptive_avg_pool2d", adaptive_avg_pool2d),
    ("max_pool2d", max_pool2d),
    ("add", add),
    ("add_scalar", add_scalar),
    ("mul_scalar", mul_scalar),
    ("clamp", clamp),
    ("conv2d", conv2d),
    ("conv2d_host_weights", conv2d_host_weights),
    ("conv2d_prepacked", conv2d_prepacked),
    ("conv2d_depthwise", conv2d_depthwise),
    ("addmm", addmm),
    ("mm", mm),
    ("mean", mean),
    ("cat", cat),
    ("reshape_copy", reshape_copy),
];

/// Deterministic values in `[-2, 2)`.
fn pattern(len: usize, seed: usize) -> Vec<f32> {
    (0..len)
        .map(|i| ((i * 7 + seed * 13) % 17) as f32 * 0.25 - 2.0)
        .collect()
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

fn input<'a>(ctx: &'a VulkanContext, shape: &[usize], seed: usize) -> Result<(VulkanTensor<'a>, Vec<f32>)> {
    let data = pattern(numel(shape), seed);
    let tensor = VulkanTensor::from_host(ctx, shape, &data)?;
    Ok((tensor, data))
}

fn upsample_nearest2d(ctx: &VulkanContext) -> Result<Outcome> {
    let (x, data) = input(ctx, &[1, 3, 3, 4], 1)?;
    let (scale_h, scale_w) = (ops::pool::nearest_scale(3, 6), ops::pool::nearest_scale(4, 8));
    let mut out = VulkanTensor::new(ctx, &[1, 3, 6, 8]);
    ops::upsample_nearest2d(&mut out, &x, scale_h, scale_w)?;
    let expected = reference::upsample_nearest2d(&data, [1, 3, 3, 4], [6, 8], scale_h, scale_w)?;
    Ok((out.to_host()?, expected))
}

fn adaptive_avg_pool2d(ctx: &VulkanContext) -> Result<Outcome> {
    let (x, data) = input(ctx, &[1, 5, 7, 9], 2)?;
    let mut out = VulkanTensor::new(ctx, &[1, 5, 3, 4]);
    ops::adaptive_avg_pool2d(&mut out, &x)?;
    let expected = reference::adaptive_avg_pool2d(&data, [1, 5, 7, 9], [3, 4])?;
    Ok((out.to_host()?, expected))
}

fn max_pool2d(ctx: &VulkanContext) -> Result<Outcome> {
    let params = Pool2dParams::new([3, 3], [2, 2], [1, 1], [1, 1]);
    let (x, data) = input(ctx, &[2, 3, 8, 8], 3)?;
    let [oh, ow] = params.output_size([8, 8])?;
    let mut out = VulkanTensor::new(ctx, &[2, 3, oh, ow]);
    ops::max_pool2d(&mut out, &x, &params)?;
    let expected = reference::max_pool2d(&data, [2, 3, 8, 8], &params)?;
    Ok((out.to_host()?, expected))
}

fn add(ctx: &VulkanContext) -> Result<Outcome> {
    let shape = [2, 3, 4, 5];
    let (a, a_data) = input(ctx, &shape, 4)?;
    let (b, b_data) = input(ctx, &shape, 5)?;
    let mut out = VulkanTensor::new(ctx, &shape);
    ops::add(&mut out, &a, &b, 0.5)?;
    Ok((out.to_host()?, reference::add(&a_data, &b_data, 0.5)?))
}

fn add_scalar(ctx: &VulkanContext) -> Result<Outcome> {
    let (x, data) = input(ctx, &[1, 6, 3, 3], 6)?;
    let mut out = VulkanTensor::new(ctx, &[1, 6, 3, 3]);
    ops::add_scalar(&mut out, &x, 1.5)?;
    Ok((out.to_host()?, reference::add_scalar(&data, 1.5)))
}

fn mul_scalar(ctx: &VulkanContext) -> Result<Outcome> {
    let (x, data) = input(ctx, &[1, 6, 3, 3], 7)?;
    let mut out = VulkanTensor::new(ctx, &[1, 6, 3, 3]);
    ops::mul_scalar(&mut out, &x, -3.0)?;
    Ok((out.to_host()?, reference::mul_scalar(&data, -3.0)))
}

fn clamp(ctx: &VulkanContext) -> Result<Outcome> {
    let (x, data) = input(ctx, &[2, 5, 4, 4], 8)?;
    let mut out = VulkanTensor::new(ctx, &[2, 5, 4, 4]);
    ops::clamp(&mut out, &x, Some(-0.5), Some(1.0))?;
    Ok((out.to_host()?, reference::clamp(&data, Some(-0.5), Some(1.0))))
}

fn conv2d_inputs<'a>(
    ctx: &'a VulkanContext,
    params: &Conv2dParams,
) -> Result<(VulkanTensor<'a>, Vec<f32>, Vec<f32>, Vec<f32>)> {
    let (x, data) = input(ctx, &[params.n, params.c, params.h, params.w], 9)?;
    let weights = pattern(params.oc * (params.c / params.groups) * params.kh * params.kw, 10)
        .iter()
        .map(|w| w * 0.1)
        .collect();
    let bias = pattern(params.oc, 11);
    Ok((x, data, weights, bias))
}

fn conv2d(ctx: &VulkanContext) -> Result<Outcome> {
    let params = Conv2dParams::new(&[1, 5, 7, 7], &[6, 5, 3, 3], [1, 1], [1, 1], [1, 1], 1)?;
    let (x, data, weights, bias) = conv2d_inputs(ctx, &params)?;

    let packed = VulkanTensor::new(ctx, &[params.oc, params.c, params.kh, params.kw]);
    repack::conv2d_prepack_weights(&packed, &weights, params.kernel_dims())?;

    let mut out = VulkanTensor::new(ctx, &params.output_shape());
    ops::conv2d(&mut out, &x, &packed, Bias::Host(&bias), &params, None, None)?;
    let expected = reference::conv2d(&data, &weights, Some(&bias), &params, None, None)?;
    Ok((out.to_host()?, expected))
}

fn conv2d_host_weights(ctx: &VulkanContext) -> Result<Outcome> {
    let params = Conv2dParams::new(&[1, 3, 9, 8], &[7, 3, 3, 2], [2, 1], [1, 0], [1, 1], 1)?;
    let (x, data, weights, _) = conv2d_inputs(ctx, &params)?;

    let mut out = VulkanTensor::new(ctx, &params.output_shape());
    ops::conv2d_with_host_weights(&mut out, &x, &weights, Bias::None, &params, Some(0.0), Some(6.0))?;
    let expected = reference::conv2d(&data, &weights, None, &params, Some(0.0), Some(6.0))?;
    Ok((out.to_host()?, expected))
}

fn conv2d_prepacked(ctx: &VulkanContext) -> Result<Outcome> {
    let params = Conv2dParams::new(&[2, 4, 6, 6], &[8, 4, 1, 1], [1, 1], [0, 0], [1, 1], 1)?;
    let (x, data, weights, bias) = conv2d_inputs(ctx, &params)?;

    let conv = Conv2dPrepacked::new(ctx, params, &weights, Some(&bias))?;
    let mut out = VulkanTensor::new(ctx, &params.output_shape());
    conv.run(&mut out, &x, None, None)?;
    let expected = reference::conv2d(&data, &weights, Some(&bias), &params, None, None)?;
    Ok((out.to_host()?, expected))
}

fn conv2d_depthwise(ctx: &VulkanContext) -> Result<Outcome> {
    let params = Conv2dParams::new(&[1, 6, 6, 6], &[6, 1, 3, 3], [1, 1], [1, 1], [1, 1], 6)?;
    let (x, data, weights, bias) = conv2d_inputs(ctx, &params)?;

    let mut out = VulkanTensor::new(ctx, &params.output_shape());
    ops::conv2d_with_host_weights(&mut out, &x, &weights, Bias::Host(&bias), &params, None, None)?;
    let expected = reference::conv2d(&data, &weights, Some(&bias), &params, None, None)?;
    Ok((out.to_host()?, expected))
}

fn addmm(ctx: &VulkanContext) -> Result<Outcome> {
    let (m1, m1_data) = input(ctx, &[3, 5], 12)?;
    let (m2, m2_data) = input(ctx, &[5, 4], 13)?;
    let (t, t_data) = input(ctx, &[3, 4], 14)?;
    let mut out = VulkanTensor::new(ctx, &[3, 4]);
    ops::addmm(&mut out, &m1, &m2, Some(&t), 0.5, 2.0)?;
    let expected = reference::addmm(&m1_data, &m2_data, Some(&t_data), (3, 5, 4), 0.5, 2.0)?;
    Ok((out.to_host()?, expected))
}

fn mm(ctx: &VulkanContext) -> Result<Outcome> {
    let (m1, m1_data) = input(ctx, &[4, 6], 15)?;
    let (m2, m2_data) = input(ctx, &[6, 2], 16)?;
    let mut out = VulkanTensor::new(ctx, &[4, 2]);
    ops::mm(&mut out, &m1, &m2)?;
    Ok((out.to_host()?, reference::mm(&m1_data, &m2_data, (4, 6, 2))?))
}

fn mean(ctx: &VulkanContext) -> Result<Outcome> {
    let (x, data) = input(ctx, &[2, 3, 5, 4], 17)?;
    let mut out = VulkanTensor::new(ctx, &[2, 3]);
    ops::mean(&mut out, &x)?;
    Ok((out.to_host()?, reference::mean(&data, [2, 3, 5, 4])?))
}

fn cat(ctx: &VulkanContext) -> Result<Outcome> {
    let (a, a_data) = input(ctx, &[2, 3, 4], 18)?;
    let (b, b_data) = input(ctx, &[1, 3, 4], 19)?;
    let mut out = VulkanTensor::new(ctx, &[3, 3, 4]);
    ops::cat(&mut out, &[&a, &b], 0)?;
    Ok((out.to_host()?, [a_data, b_data].concat()))
}

fn reshape_copy(ctx: &VulkanContext) -> Result<Outcome> {
    let (x, data) = input(ctx, &[2, 3, 4], 20)?;
    let reshaped = ops::reshape_copy(&x, &[4, 6])?;
    let back = ops::reshape_copy(&reshaped, &[2, 3, 4])?;
    Ok((back.to_host()?, data))
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = EngineConfig::from_env();
    if let Some(index) = cli.device {
        config = config.with_device_index(index);
    }
    if let Some(dir) = cli.shader_dir {
        config = config.with_shader_dir(dir);
    }
    if cli.validation {
        config = config.with_validation(true);
    }

    let cases: Vec<_> = CASES
        .iter()
        .filter(|(name, _)| cli.only.as_deref().map_or(true, |only| only == *name))
        .collect();
    if cases.is_empty() {
        eprintln!("Error: unknown operator {:?}", cli.only.unwrap_or_default());
        eprintln!(
            "Known operators: {}",
            CASES.iter().map(|(name, _)| *name).collect::<Vec<_>>().join(", ")
        );
        return ExitCode::from(2);
    }

    let ctx = match VulkanContext::new(&config) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };
    println!("Device: {} (Vulkan {})", ctx.device_name, ctx.api_version);
    println!("Shaders: {}", config.shader_dir.display());
    println!();

    let mut failures = 0;
    for (name, case) in cases {
        match case(&ctx) {
            Ok((actual, expected)) => match reference::max_abs_diff(&actual, &expected) {
                Some(diff) if diff <= cli.tolerance => {
                    println!("PASS {:<22} max diff {:.2e}", name, diff);
                }
                Some(diff) => {
                    failures += 1;
                    println!("FAIL {:<22} max diff {:.2e} > {:.2e}", name, diff, cli.tolerance);
                }
                None => {
                    failures += 1;
                    println!(
                        "FAIL {:<22} got {} values, expected {}",
                        name,
                        actual.len(),
                        expected.len()
                    );
                }
            },
            Err(e) => {
                failures += 1;
                println!("FAIL {:<22} {}", name, e);
            }
        }
    }

    println!();
    if failures > 0 {
        println!("{} operator(s) failed", failures);
        ExitCode::FAILURE
    } else {
        println!("All operators passed");
        ExitCode::SUCCESS
    }
}

//! Operator tests on a real Vulkan device.
//!
//! Each test returns early (with a log line) when `HLX_VKOPS_SHADER_DIR` is
//! unset or no device can be opened, so the suite passes on machines
//! without a GPU.

use hlx_vkops::ops::{self, Bias, Conv2dParams};
use hlx_vkops::{reference, Authority, EngineConfig, VulkanContext, VulkanTensor};
use pretty_assertions::assert_eq;

const TOLERANCE: f32 = 1e-4;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn device() -> Option<VulkanContext> {
    init_logging();
    let config = EngineConfig::from_env();
    if std::env::var_os("HLX_VKOPS_SHADER_DIR").is_none() {
        log::warn!("HLX_VKOPS_SHADER_DIR not set, skipping device test");
        return None;
    }
    match VulkanContext::new(&config) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            log::warn!("No Vulkan device ({}), skipping device test", e);
            None
        }
    }
}

fn ramp(len: usize) -> Vec<f32> {
    (0..len).map(|i| (i % 23) as f32 * 0.5 - 5.0).collect()
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    let diff = reference::max_abs_diff(actual, expected).expect("length mismatch");
    assert!(diff <= TOLERANCE, "max diff {} exceeds {}", diff, TOLERANCE);
}

#[test]
fn test_host_round_trip_through_image() {
    let Some(ctx) = device() else { return };
    let data = ramp(2 * 5 * 3 * 3);
    let x = VulkanTensor::from_host(&ctx, &[2, 5, 3, 3], &data).unwrap();
    assert_eq!(x.authority(), Authority::Buffer);

    x.image_for_read().unwrap();
    assert_eq!(x.authority(), Authority::Synchronized);
    x.mark_image_written();
    assert_eq!(x.to_host().unwrap(), data);
}

#[test]
fn test_reshape_round_trip_is_exact() {
    let Some(ctx) = device() else { return };
    let data = ramp(60);
    let x = VulkanTensor::from_host(&ctx, &[3, 4, 5], &data).unwrap();
    let flat = ops::reshape_copy(&x, &[60]).unwrap();
    let back = ops::reshape_copy(&flat, &[3, 4, 5]).unwrap();
    assert_eq!(back.shape(), &[3, 4, 5]);
    assert_eq!(back.to_host().unwrap(), data);

    assert!(ops::reshape_copy(&x, &[7, 9]).unwrap_err().is_contract_violation());
}

#[test]
fn test_cat_places_inputs_at_byte_offsets() {
    let Some(ctx) = device() else { return };
    let a_data = ramp(2 * 6);
    let b_data: Vec<f32> = ramp(3 * 6).iter().map(|v| v + 100.0).collect();
    let a = VulkanTensor::from_host(&ctx, &[2, 6], &a_data).unwrap();
    let b = VulkanTensor::from_host(&ctx, &[3, 6], &b_data).unwrap();

    let mut out = VulkanTensor::new(&ctx, &[5, 6]);
    ops::cat(&mut out, &[&a, &b], 0).unwrap();
    let result = out.to_host().unwrap();
    assert_eq!(&result[..a_data.len()], a_data.as_slice());
    assert_eq!(&result[a_data.len()..], b_data.as_slice());
}

#[test]
fn test_clamp_bounds() {
    let Some(ctx) = device() else { return };
    let data = ramp(4 * 7 * 3);
    let x = VulkanTensor::from_host(&ctx, &[4, 7, 3], &data).unwrap();
    let mut out = VulkanTensor::new(&ctx, &[4, 7, 3]);
    ops::clamp(&mut out, &x, Some(-1.0), Some(2.5)).unwrap();

    let result = out.to_host().unwrap();
    for (x, r) in data.iter().zip(&result) {
        assert!((-1.0..=2.5).contains(r));
        if (-1.0..=2.5).contains(x) {
            assert_eq!(x, r);
        }
    }
}

#[test]
fn test_add_commutes() {
    let Some(ctx) = device() else { return };
    let shape = [2, 3, 4, 5];
    let a_data = ramp(120);
    let b_data: Vec<f32> = ramp(120).iter().rev().copied().collect();
    let a = VulkanTensor::from_host(&ctx, &shape, &a_data).unwrap();
    let b = VulkanTensor::from_host(&ctx, &shape, &b_data).unwrap();

    let mut ab = VulkanTensor::new(&ctx, &shape);
    let mut ba = VulkanTensor::new(&ctx, &shape);
    ops::add(&mut ab, &a, &b, 1.0).unwrap();
    ops::add(&mut ba, &b, &a, 1.0).unwrap();
    assert_close(&ab.to_host().unwrap(), &ba.to_host().unwrap());
    assert_close(&ab.to_host().unwrap(), &reference::add(&a_data, &b_data, 1.0).unwrap());
}

#[test]
fn test_add_rejects_mismatched_shapes() {
    let Some(ctx) = device() else { return };
    let a = VulkanTensor::new(&ctx, &[2, 3]);
    let b = VulkanTensor::new(&ctx, &[1, 3]);
    let mut out = VulkanTensor::new(&ctx, &[2, 3]);
    let err = ops::add(&mut out, &a, &b, 1.0).unwrap_err();
    assert!(err.is_contract_violation());
    assert!(!out.has_image());
}

#[test]
fn test_depthwise_identity_kernel() {
    let Some(ctx) = device() else { return };
    let params = Conv2dParams::new(&[1, 2, 4, 4], &[2, 1, 3, 3], [1, 1], [1, 1], [1, 1], 2).unwrap();
    let data: Vec<f32> = (0..32).map(|i| i as f32).collect();
    let mut weights = vec![0.0; 18];
    weights[4] = 1.0;
    weights[9 + 4] = 2.0;

    let x = VulkanTensor::from_host(&ctx, &[1, 2, 4, 4], &data).unwrap();
    let mut out = VulkanTensor::new(&ctx, &params.output_shape());
    ops::conv2d_with_host_weights(&mut out, &x, &weights, Bias::None, &params, None, None).unwrap();

    let expected: Vec<f32> = (0..16)
        .map(|i| i as f32)
        .chain((16..32).map(|i| 2.0 * i as f32))
        .collect();
    assert_close(&out.to_host().unwrap(), &expected);
}

#[test]
fn test_grouped_conv_fails_fast() {
    let Some(ctx) = device() else { return };
    let params = Conv2dParams::new(&[1, 4, 5, 5], &[4, 2, 3, 3], [1, 1], [1, 1], [1, 1], 2).unwrap();
    let x = VulkanTensor::new(&ctx, &[1, 4, 5, 5]);
    let mut out = VulkanTensor::new(&ctx, &params.output_shape());
    let err = ops::conv2d_with_host_weights(&mut out, &x, &[0.0; 72], Bias::None, &params, None, None)
        .unwrap_err();
    assert!(err.is_contract_violation());
    assert!(err.to_string().contains("depthwise"));
}

#[test]
fn test_mean_of_constant() {
    let Some(ctx) = device() else { return };
    for (h, w) in [(1, 1), (4, 7), (9, 3)] {
        let x = VulkanTensor::from_host(&ctx, &[1, 1, h, w], &vec![1.25; h * w]).unwrap();
        let mut out = VulkanTensor::new(&ctx, &[1, 1]);
        ops::mean(&mut out, &x).unwrap();
        assert_close(&out.to_host().unwrap(), &[1.25]);
    }
}

#[test]
fn test_prepacked_image_size_is_checked() {
    let Some(ctx) = device() else { return };
    let params = Conv2dParams::new(&[1, 4, 4, 4], &[4, 4, 3, 3], [1, 1], [1, 1], [1, 1], 1).unwrap();
    let wrong = hlx_vkops::GpuImage::new(&ctx, hlx_vkops::ImageExtent::new(1, 1, 9).unwrap()).unwrap();
    let err = hlx_vkops::repack::conv2d_prepack_weights_to_image(
        &ctx,
        &wrong,
        &[0.0; 144],
        params.kernel_dims(),
    )
    .unwrap_err();
    assert!(matches!(err, hlx_vkops::VulkanErrorKind::ResourceSize(_)));
}

#[test]
fn test_prepacked_weight_tensor_is_not_bound_as_nchw() {
    let Some(ctx) = device() else { return };
    let params = Conv2dParams::new(&[1, 3, 4, 4], &[8, 3, 3, 3], [1, 1], [1, 1], [1, 1], 1).unwrap();
    let weight = VulkanTensor::new(&ctx, &[8, 3, 3, 3]);
    hlx_vkops::repack::conv2d_prepack_weights(&weight, &[0.5; 216], params.kernel_dims()).unwrap();

    let a = VulkanTensor::from_host(&ctx, &[8, 3, 3, 3], &[1.0; 216]).unwrap();
    let mut out = weight;
    let err = ops::add(&mut out, &a, &a, 1.0).unwrap_err();
    assert!(matches!(err, hlx_vkops::VulkanErrorKind::ResourceSize(_)));
    assert!(matches!(
        out.to_host().unwrap_err(),
        hlx_vkops::VulkanErrorKind::ResourceSize(_)
    ));
}

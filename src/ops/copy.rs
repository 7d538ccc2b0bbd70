//! Buffer-copy operators: concatenation and reshape.
//!
//! Neither uses a shader. Sources are brought to buffer form first, then
//! copied device-side; the destination buffer becomes authoritative.

use crate::buffer::{record_buffer_copy, record_post_copy_barrier, record_pre_copy_barrier};
use crate::ensure_contract;
use crate::error::Result;
use crate::tensor::VulkanTensor;

/// Shape of `shapes` concatenated along `dim`.
///
/// Every dim before `dim` must be 1 so each input is one contiguous slab of
/// the output; all other dims must agree.
pub fn cat_output_shape(shapes: &[&[usize]], dim: usize) -> Result<Vec<usize>> {
    ensure_contract!(!shapes.is_empty(), "cat: no inputs");
    let first = shapes[0];
    ensure_contract!(
        dim < first.len(),
        "cat: dim {} out of range for shape {:?}",
        dim,
        first
    );

    let mut output = first.to_vec();
    output[dim] = 0;
    for shape in shapes {
        ensure_contract!(
            shape.len() == first.len(),
            "cat: rank mismatch between {:?} and {:?}",
            first,
            shape
        );
        ensure_contract!(
            shape[..dim].iter().all(|&d| d == 1),
            "cat is supported only along the outermost non-trivial dim, got dim {} for {:?}",
            dim,
            shape
        );
        for (axis, (&a, &b)) in first.iter().zip(shape.iter()).enumerate() {
            ensure_contract!(
                axis == dim || a == b,
                "cat: shapes {:?} and {:?} differ outside dim {}",
                first,
                shape,
                dim
            );
        }
        output[dim] += shape[dim];
    }
    Ok(output)
}

/// Concatenate `inputs` along `dim` into `output`.
pub fn cat(output: &mut VulkanTensor<'_>, inputs: &[&VulkanTensor<'_>], dim: usize) -> Result<()> {
    let shapes: Vec<&[usize]> = inputs.iter().map(|t| t.shape()).collect();
    let expected = cat_output_shape(&shapes, dim)?;
    ensure_contract!(
        output.shape() == expected.as_slice(),
        "cat: output has shape {:?}, expected {:?}",
        output.shape(),
        expected
    );

    let sources = inputs
        .iter()
        .map(|t| Ok((t.buffer_for_read()?, t.size_bytes())))
        .collect::<Result<Vec<_>>>()?;
    let destination = output.buffer()?;

    let ctx = output.context();
    log::trace!("cat: {} inputs into {:?}", sources.len(), output.shape());
    ctx.submit_and_wait(|device, cmd| {
        record_pre_copy_barrier(device, cmd);
        let mut offset = 0u64;
        for (source, size) in &sources {
            if *size > 0 {
                record_buffer_copy(device, cmd, source, destination, *size, 0, offset);
            }
            offset += size;
        }
        record_post_copy_barrier(device, cmd);
        Ok(())
    })?;

    output.mark_buffer_written();
    Ok(())
}

/// Copy `input` into a new tensor of `shape`. This is a real copy, not a view.
pub fn reshape_copy<'a>(input: &VulkanTensor<'a>, shape: &[usize]) -> Result<VulkanTensor<'a>> {
    let numel: usize = shape.iter().product();
    ensure_contract!(
        numel == input.numel(),
        "reshape: {:?} has {} elements, target {:?} has {}",
        input.shape(),
        input.numel(),
        shape,
        numel
    );

    let output = VulkanTensor::new(input.context(), shape);
    let size = input.size_bytes();
    if size > 0 {
        let source = input.buffer_for_read()?;
        crate::buffer::copy_buffer_to_buffer(input.context(), source, output.buffer()?, size, 0, 0)?;
    }
    output.mark_buffer_written();
    Ok(output)
}

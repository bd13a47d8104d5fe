//! Builtin CPU kernel implementations.
//!
//! Pure Rust loops, no unsafe code. Each operator contributes a shape
//! inference function (used by the planner during allocation) and an
//! execute function (used by the executor during invocation).

use tracing::trace;

use crate::error::{KernelError, ShapeError};
use crate::tensor::element_count;

use super::{Kernel, OpParams, OpType, TensorView, TensorViewMut};

/// The full builtin catalog, in operator-code order.
pub(crate) fn catalog() -> [(OpType, Kernel); 7] {
    [
        (
            OpType::Identity,
            Kernel {
                name: "identity",
                infer: infer_unary,
                run: run_identity,
            },
        ),
        (
            OpType::AddScalar,
            Kernel {
                name: "add_scalar",
                infer: infer_unary,
                run: run_add_scalar,
            },
        ),
        (
            OpType::Add,
            Kernel {
                name: "add",
                infer: infer_elementwise_pair,
                run: run_add,
            },
        ),
        (
            OpType::Mul,
            Kernel {
                name: "mul",
                infer: infer_elementwise_pair,
                run: run_mul,
            },
        ),
        (
            OpType::Relu,
            Kernel {
                name: "relu",
                infer: infer_unary,
                run: run_relu,
            },
        ),
        (
            OpType::MatMul,
            Kernel {
                name: "mat_mul",
                infer: infer_mat_mul,
                run: run_mat_mul,
            },
        ),
        (
            OpType::Reshape,
            Kernel {
                name: "reshape",
                infer: infer_reshape,
                run: run_reshape,
            },
        ),
    ]
}

// ---------------------------------------------------------------------------
// Shape inference
// ---------------------------------------------------------------------------

fn expect_input_count(shapes: &[&[usize]], n: usize, op: &str) -> Result<(), ShapeError> {
    if shapes.len() != n {
        return Err(ShapeError::Incompatible(format!(
            "{} expects {} input(s), got {}",
            op,
            n,
            shapes.len()
        )));
    }
    Ok(())
}

/// One input, one output, shape preserved.
fn infer_unary(_params: &OpParams, inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, ShapeError> {
    expect_input_count(inputs, 1, "unary op")?;
    Ok(vec![inputs[0].to_vec()])
}

/// Two inputs of identical shape, one output of the same shape.
fn infer_elementwise_pair(
    _params: &OpParams,
    inputs: &[&[usize]],
) -> Result<Vec<Vec<usize>>, ShapeError> {
    expect_input_count(inputs, 2, "elementwise op")?;
    if inputs[0] != inputs[1] {
        return Err(ShapeError::Incompatible(format!(
            "elementwise operands differ: {:?} vs {:?}",
            inputs[0], inputs[1]
        )));
    }
    Ok(vec![inputs[0].to_vec()])
}

/// [M, K] x [K, N] -> [M, N]
fn infer_mat_mul(_params: &OpParams, inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, ShapeError> {
    expect_input_count(inputs, 2, "mat_mul")?;
    let (a, b) = (inputs[0], inputs[1]);
    if a.len() != 2 || b.len() != 2 {
        return Err(ShapeError::Incompatible(format!(
            "mat_mul operands must be 2-D, got {:?} and {:?}",
            a, b
        )));
    }
    if a[1] != b[0] {
        return Err(ShapeError::Incompatible(format!(
            "mat_mul inner dimensions differ: [{}, {}] x [{}, {}]",
            a[0], a[1], b[0], b[1]
        )));
    }
    Ok(vec![vec![a[0], b[1]]])
}

/// Element count must be preserved by the target dims.
fn infer_reshape(params: &OpParams, inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, ShapeError> {
    expect_input_count(inputs, 1, "reshape")?;
    let dims = match params {
        OpParams::Reshape { dims } => dims,
        _ => {
            return Err(ShapeError::Incompatible(
                "reshape requires target dims parameters".to_string(),
            ))
        }
    };
    if element_count(inputs[0]) != element_count(dims) {
        return Err(ShapeError::Incompatible(format!(
            "reshape from {:?} to {:?} changes element count",
            inputs[0], dims
        )));
    }
    Ok(vec![dims.clone()])
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

fn expect_io(
    inputs: &[TensorView<'_>],
    outputs: &[TensorViewMut<'_>],
    n_in: usize,
    n_out: usize,
    op: &str,
) -> Result<(), KernelError> {
    if inputs.len() != n_in || outputs.len() != n_out {
        return Err(KernelError::Precondition(format!(
            "{} expects {} input(s) and {} output(s), got {} and {}",
            op,
            n_in,
            n_out,
            inputs.len(),
            outputs.len()
        )));
    }
    Ok(())
}

fn run_identity(
    _params: &OpParams,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    expect_io(inputs, outputs, 1, 1, "identity")?;
    let src = &inputs[0];
    let dst = &mut outputs[0];
    if src.elem != dst.elem || src.bytes.len() != dst.bytes.len() {
        return Err(KernelError::Precondition(format!(
            "identity requires matching buffers: {} x {} bytes vs {} x {} bytes",
            src.elem,
            src.bytes.len(),
            dst.elem,
            dst.bytes.len()
        )));
    }
    trace!(bytes = src.bytes.len(), "CPU identity");
    dst.bytes.copy_from_slice(src.bytes);
    Ok(())
}

fn run_add_scalar(
    params: &OpParams,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    expect_io(inputs, outputs, 1, 1, "add_scalar")?;
    let value = match params {
        OpParams::AddScalar { value } => *value,
        _ => {
            return Err(KernelError::Precondition(
                "add_scalar requires a scalar parameter".to_string(),
            ))
        }
    };
    let src = inputs[0].as_f32()?;
    let dst = outputs[0].as_f32_mut()?;
    if src.len() != dst.len() {
        return Err(KernelError::Precondition(format!(
            "add_scalar length mismatch: {} vs {}",
            src.len(),
            dst.len()
        )));
    }
    trace!(n = src.len(), value, "CPU add_scalar");
    for (d, s) in dst.iter_mut().zip(src) {
        *d = s + value;
    }
    Ok(())
}

fn run_add(
    _params: &OpParams,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    expect_io(inputs, outputs, 2, 1, "add")?;
    let a = inputs[0].as_f32()?;
    let b = inputs[1].as_f32()?;
    let dst = outputs[0].as_f32_mut()?;
    if a.len() != b.len() || a.len() != dst.len() {
        return Err(KernelError::Precondition(format!(
            "add length mismatch: {} + {} -> {}",
            a.len(),
            b.len(),
            dst.len()
        )));
    }
    trace!(n = a.len(), "CPU add");
    for i in 0..dst.len() {
        dst[i] = a[i] + b[i];
    }
    Ok(())
}

fn run_mul(
    _params: &OpParams,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    expect_io(inputs, outputs, 2, 1, "mul")?;
    let a = inputs[0].as_f32()?;
    let b = inputs[1].as_f32()?;
    let dst = outputs[0].as_f32_mut()?;
    if a.len() != b.len() || a.len() != dst.len() {
        return Err(KernelError::Precondition(format!(
            "mul length mismatch: {} * {} -> {}",
            a.len(),
            b.len(),
            dst.len()
        )));
    }
    trace!(n = a.len(), "CPU mul");
    for i in 0..dst.len() {
        dst[i] = a[i] * b[i];
    }
    Ok(())
}

fn run_relu(
    _params: &OpParams,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    expect_io(inputs, outputs, 1, 1, "relu")?;
    let src = inputs[0].as_f32()?;
    let dst = outputs[0].as_f32_mut()?;
    if src.len() != dst.len() {
        return Err(KernelError::Precondition(format!(
            "relu length mismatch: {} vs {}",
            src.len(),
            dst.len()
        )));
    }
    trace!(n = src.len(), "CPU relu");
    for (d, s) in dst.iter_mut().zip(src) {
        *d = s.max(0.0);
    }
    Ok(())
}

fn run_mat_mul(
    _params: &OpParams,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    expect_io(inputs, outputs, 2, 1, "mat_mul")?;
    let a_shape = inputs[0].shape;
    let b_shape = inputs[1].shape;
    if a_shape.len() != 2 || b_shape.len() != 2 || a_shape[1] != b_shape[0] {
        return Err(KernelError::Precondition(format!(
            "mat_mul operand shapes invalid: {:?} x {:?}",
            a_shape, b_shape
        )));
    }
    let (m, k, n) = (a_shape[0], a_shape[1], b_shape[1]);

    let a = inputs[0].as_f32()?;
    let b = inputs[1].as_f32()?;
    let dst = outputs[0].as_f32_mut()?;
    if dst.len() != m * n {
        return Err(KernelError::Precondition(format!(
            "mat_mul output has {} elements, expected {}",
            dst.len(),
            m * n
        )));
    }

    trace!(m, k, n, "CPU mat_mul");
    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            dst[i * n + j] = sum;
        }
    }
    Ok(())
}

fn run_reshape(
    _params: &OpParams,
    inputs: &[TensorView<'_>],
    outputs: &mut [TensorViewMut<'_>],
) -> Result<(), KernelError> {
    expect_io(inputs, outputs, 1, 1, "reshape")?;
    let src = &inputs[0];
    let dst = &mut outputs[0];
    if src.elem != dst.elem || src.bytes.len() != dst.bytes.len() {
        return Err(KernelError::Precondition(format!(
            "reshape requires matching buffers: {} bytes vs {} bytes",
            src.bytes.len(),
            dst.bytes.len()
        )));
    }
    trace!(bytes = src.bytes.len(), "CPU reshape");
    dst.bytes.copy_from_slice(src.bytes);
    Ok(())
}

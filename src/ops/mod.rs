//! Operator types, parameters, kernels, and the operator resolver.
//!
//! The set of operator types is closed and known when a resolver is
//! constructed, so dispatch is a tagged lookup from [`OpType`] to a
//! [`Kernel`] (a shape-inference function plus an execute function) rather
//! than open-ended dynamic dispatch. The resolver is an explicitly
//! constructed, immutable value injected at graph build time; there is no
//! process-wide registry.

pub mod cpu;

use std::collections::HashMap;

use crate::error::{KernelError, ShapeError};
use crate::tensor::ElemType;

// ---------------------------------------------------------------------------
// OpType
// ---------------------------------------------------------------------------

/// Operator type. The wire format stores the raw code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum OpType {
    Identity = 0,
    AddScalar = 1,
    Add = 2,
    Mul = 3,
    Relu = 4,
    MatMul = 5,
    Reshape = 6,
}

impl OpType {
    /// Decode a wire-format operator code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Identity),
            1 => Some(Self::AddScalar),
            2 => Some(Self::Add),
            3 => Some(Self::Mul),
            4 => Some(Self::Relu),
            5 => Some(Self::MatMul),
            6 => Some(Self::Reshape),
            _ => None,
        }
    }

    pub fn code(&self) -> u32 {
        *self as u32
    }

    /// Human-readable operator name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::AddScalar => "add_scalar",
            Self::Add => "add",
            Self::Mul => "mul",
            Self::Relu => "relu",
            Self::MatMul => "mat_mul",
            Self::Reshape => "reshape",
        }
    }
}

// ---------------------------------------------------------------------------
// OpParams
// ---------------------------------------------------------------------------

/// Typed operator parameters, decoded from the container's opaque blob at
/// graph build time.
#[derive(Debug, Clone, PartialEq)]
pub enum OpParams {
    None,
    /// Scalar addend for [`OpType::AddScalar`]: one little-endian f32.
    AddScalar { value: f32 },
    /// Target dims for [`OpType::Reshape`]: u32 rank + rank × u64 dims.
    Reshape { dims: Vec<usize> },
}

impl OpParams {
    /// Decode the parameter blob for the given operator type. The error
    /// string is wrapped into `BuildError::InvalidParams` by the builder.
    pub fn decode(op: OpType, blob: &[u8]) -> Result<Self, String> {
        match op {
            OpType::AddScalar => {
                if blob.len() != 4 {
                    return Err(format!(
                        "add_scalar expects a 4-byte f32 parameter, got {} bytes",
                        blob.len()
                    ));
                }
                let value = f32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
                Ok(Self::AddScalar { value })
            }
            OpType::Reshape => {
                if blob.len() < 4 {
                    return Err("reshape parameters truncated".to_string());
                }
                let rank = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]) as usize;
                if rank > 8 {
                    return Err(format!("reshape rank {} exceeds maximum 8", rank));
                }
                if blob.len() != 4 + rank * 8 {
                    return Err(format!(
                        "reshape expects {} bytes for rank {}, got {}",
                        4 + rank * 8,
                        rank,
                        blob.len()
                    ));
                }
                let mut dims = Vec::with_capacity(rank);
                for i in 0..rank {
                    let start = 4 + i * 8;
                    let dim = u64::from_le_bytes(blob[start..start + 8].try_into().unwrap());
                    dims.push(dim as usize);
                }
                Ok(Self::Reshape { dims })
            }
            _ => {
                if !blob.is_empty() {
                    return Err(format!(
                        "{} expects no parameters, got {} bytes",
                        op.name(),
                        blob.len()
                    ));
                }
                Ok(Self::None)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Buffer views
// ---------------------------------------------------------------------------

/// Read-only view of one tensor's buffer, handed to kernels.
pub struct TensorView<'a> {
    pub elem: ElemType,
    pub shape: &'a [usize],
    pub bytes: &'a [u8],
}

impl<'a> TensorView<'a> {
    /// Reinterpret the bytes as f32 elements.
    ///
    /// Buffers are element-aligned by construction: arena offsets are
    /// 64-byte aligned and constant data sits on the container's 32-byte
    /// data alignment.
    pub fn as_f32(&self) -> Result<&'a [f32], KernelError> {
        if self.elem != ElemType::F32 {
            return Err(KernelError::Unsupported(format!(
                "expected f32 tensor, got {}",
                self.elem
            )));
        }
        Ok(bytemuck::cast_slice(self.bytes))
    }
}

/// Mutable view of one tensor's buffer, handed to kernels as an output.
pub struct TensorViewMut<'a> {
    pub elem: ElemType,
    pub shape: &'a [usize],
    pub bytes: &'a mut [u8],
}

impl<'a> TensorViewMut<'a> {
    /// Reinterpret the bytes as mutable f32 elements.
    pub fn as_f32_mut(&mut self) -> Result<&mut [f32], KernelError> {
        if self.elem != ElemType::F32 {
            return Err(KernelError::Unsupported(format!(
                "expected f32 tensor, got {}",
                self.elem
            )));
        }
        Ok(bytemuck::cast_slice_mut(self.bytes))
    }
}

// ---------------------------------------------------------------------------
// Kernel and resolver
// ---------------------------------------------------------------------------

/// Execute function: consumes input views, fills output views.
pub type KernelFn =
    fn(&OpParams, &[TensorView<'_>], &mut [TensorViewMut<'_>]) -> Result<(), KernelError>;

/// Shape-inference function: maps input shapes to output shapes.
pub type ShapeFn = fn(&OpParams, &[&[usize]]) -> Result<Vec<Vec<usize>>, ShapeError>;

/// An executable kernel bound to one operator type.
#[derive(Clone, Copy)]
pub struct Kernel {
    pub name: &'static str,
    pub infer: ShapeFn,
    pub run: KernelFn,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel").field("name", &self.name).finish()
    }
}

/// Registry mapping operator types to kernels.
///
/// Populated once before any build and immutable afterwards. Pass
/// [`OpResolver::builtin`] for the full catalog, or start from
/// [`OpResolver::new`] and register a subset.
#[derive(Debug, Default)]
pub struct OpResolver {
    table: HashMap<OpType, Kernel>,
}

impl OpResolver {
    /// An empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// The full builtin kernel catalog.
    pub fn builtin() -> Self {
        let mut r = Self::new();
        for (op, kernel) in cpu::catalog() {
            r.register(op, kernel);
        }
        r
    }

    /// Register a kernel for an operator type, replacing any previous one.
    pub fn register(&mut self, op: OpType, kernel: Kernel) {
        self.table.insert(op, kernel);
    }

    /// Look up the kernel for an operator type.
    pub fn resolve(&self, op: OpType) -> Option<&Kernel> {
        self.table.get(&op)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_type_code_round_trip() {
        for code in 0..7 {
            let op = OpType::from_code(code).unwrap();
            assert_eq!(op.code(), code);
        }
        assert!(OpType::from_code(7).is_none());
        assert!(OpType::from_code(u32::MAX).is_none());
    }

    #[test]
    fn test_decode_add_scalar_params() {
        let blob = 1.5f32.to_le_bytes().to_vec();
        let params = OpParams::decode(OpType::AddScalar, &blob).unwrap();
        assert_eq!(params, OpParams::AddScalar { value: 1.5 });
    }

    #[test]
    fn test_decode_add_scalar_wrong_length() {
        let err = OpParams::decode(OpType::AddScalar, &[0u8; 3]).unwrap_err();
        assert!(err.contains("4-byte"));
    }

    #[test]
    fn test_decode_reshape_params() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&2u32.to_le_bytes());
        blob.extend_from_slice(&3u64.to_le_bytes());
        blob.extend_from_slice(&4u64.to_le_bytes());
        let params = OpParams::decode(OpType::Reshape, &blob).unwrap();
        assert_eq!(params, OpParams::Reshape { dims: vec![3, 4] });
    }

    #[test]
    fn test_decode_reshape_truncated() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&2u32.to_le_bytes());
        blob.extend_from_slice(&3u64.to_le_bytes());
        assert!(OpParams::decode(OpType::Reshape, &blob).is_err());
    }

    #[test]
    fn test_decode_paramless_op_rejects_blob() {
        assert_eq!(
            OpParams::decode(OpType::Add, &[]).unwrap(),
            OpParams::None
        );
        let err = OpParams::decode(OpType::Add, &[1, 2, 3]).unwrap_err();
        assert!(err.contains("no parameters"));
    }

    #[test]
    fn test_builtin_resolver_covers_catalog() {
        let resolver = OpResolver::builtin();
        for code in 0..7 {
            let op = OpType::from_code(code).unwrap();
            assert!(resolver.resolve(op).is_some(), "missing kernel for {:?}", op);
        }
        assert_eq!(resolver.len(), 7);
    }

    #[test]
    fn test_empty_resolver_resolves_nothing() {
        let resolver = OpResolver::new();
        assert!(resolver.is_empty());
        assert!(resolver.resolve(OpType::Add).is_none());
    }

    #[test]
    fn test_register_subset() {
        let mut resolver = OpResolver::new();
        let identity = *OpResolver::builtin().resolve(OpType::Identity).unwrap();
        resolver.register(OpType::Identity, identity);
        assert!(resolver.resolve(OpType::Identity).is_some());
        assert!(resolver.resolve(OpType::MatMul).is_none());
    }
}

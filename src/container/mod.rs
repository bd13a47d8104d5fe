//! AXGM v1 binary container parser: the immutable model store.
//!
//! An AXGM file enumerates tensors (element type, shape, optional embedded
//! constant bytes) and ops (operator code, input/output tensor indices,
//! opaque parameter blob), followed by an aligned data section holding the
//! constant bytes. The file is memory-mapped so constant tensor data is
//! served zero-copy for the lifetime of the [`Model`].

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

use tracing::{debug, info};

use crate::error::LoadError;
use crate::tensor::{byte_len, element_count, ElemType};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// AXGM magic number: ASCII "AXGM" as a little-endian u32.
pub const MODEL_MAGIC: u32 = 0x4D47_5841;

/// Sole supported container version.
pub const MODEL_VERSION: u32 = 1;

/// Alignment of the data section (bytes).
const DATA_ALIGNMENT: u64 = 32;

const MAX_TENSORS: u64 = 1_000_000;
const MAX_OPS: u64 = 1_000_000;
const MAX_DIMS: u32 = 8;
const MAX_NAME_LEN: usize = 1_000_000;
const MAX_PARAMS_LEN: u32 = 65_536;
const MAX_IO_PER_OP: u32 = 256;

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// Where a tensor's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorPlacement {
    /// Computed at run time; backed by the arena once allocated.
    Runtime,
    /// Embedded constant. `offset` is relative to the data section start.
    Constant { offset: u64, len: u64 },
}

/// One tensor declared by the model.
#[derive(Debug, Clone)]
pub struct TensorDecl {
    /// Diagnostic name; may be empty.
    pub name: String,
    pub elem: ElemType,
    pub shape: Vec<usize>,
    pub placement: TensorPlacement,
}

impl TensorDecl {
    pub fn is_constant(&self) -> bool {
        matches!(self.placement, TensorPlacement::Constant { .. })
    }

    /// Total number of elements.
    pub fn element_count(&self) -> usize {
        element_count(&self.shape)
    }

    /// Densely packed byte size. Dimensions are validated against overflow
    /// at load time, so this cannot fail for a loaded declaration.
    pub fn byte_size(&self) -> usize {
        byte_len(&self.shape, self.elem).unwrap_or(usize::MAX)
    }
}

/// One operator step declared by the model, in execution order.
#[derive(Debug, Clone)]
pub struct OpDecl {
    /// Raw operator code; mapped to a kernel at build time.
    pub code: u32,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    /// Opaque operator parameters, decoded by the graph builder.
    pub params: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// A parsed AXGM model: tensor and op tables plus memory-mapped constants.
///
/// Read-only after load. May be shared across graph instances behind an
/// `Arc`; the mapping lives exactly as long as the `Model`.
pub struct Model {
    tensors: Vec<TensorDecl>,
    ops: Vec<OpDecl>,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    /// Absolute file offset where the data section starts.
    data_offset: u64,
    mmap: memmap2::Mmap,
}

impl Model {
    /// Open and parse an AXGM container from the given path.
    ///
    /// Fails with [`LoadError::NotFound`] when the path is unreadable and
    /// [`LoadError::Malformed`] when the content does not validate
    /// structurally (bad magic/version, truncation, out-of-range
    /// cross-references, constant extents outside the file).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        info!("loading model: {}", path.display());

        let file = File::open(path).map_err(|e| LoadError::NotFound {
            path: path.to_path_buf(),
            source: e,
        })?;

        // SAFETY: the file stays open for the lifetime of the Mmap and is
        // not modified through this process. External modification while
        // mapped is undefined behaviour we accept, as loaders in this space
        // generally do.
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .map(&file)
                .map_err(|e| LoadError::Malformed(format!("mmap failed: {}", e)))?
        };

        let mut reader = Cursor::new(&mmap[..]);

        // ---- Magic and version ----
        let magic = read_u32(&mut reader)?;
        if magic != MODEL_MAGIC {
            return Err(LoadError::Malformed(format!(
                "bad magic: expected 0x{:08X}, got 0x{:08X}",
                MODEL_MAGIC, magic
            )));
        }
        let version = read_u32(&mut reader)?;
        if version != MODEL_VERSION {
            return Err(LoadError::Malformed(format!(
                "unsupported container version {}",
                version
            )));
        }

        // ---- Table counts ----
        let n_tensors = read_u64(&mut reader)?;
        let n_ops = read_u64(&mut reader)?;
        if n_tensors > MAX_TENSORS {
            return Err(LoadError::Malformed(format!(
                "tensor count {} exceeds maximum {}",
                n_tensors, MAX_TENSORS
            )));
        }
        if n_ops > MAX_OPS {
            return Err(LoadError::Malformed(format!(
                "op count {} exceeds maximum {}",
                n_ops, MAX_OPS
            )));
        }
        debug!(n_tensors, n_ops, "container header");

        // ---- Graph input/output index lists ----
        let inputs = read_index_list(&mut reader, "graph inputs")?;
        let outputs = read_index_list(&mut reader, "graph outputs")?;

        // ---- Tensor table ----
        let mut tensors = Vec::with_capacity(n_tensors as usize);
        for i in 0..n_tensors {
            let name = read_string(&mut reader)?;
            let elem_code = read_u32(&mut reader)?;
            let elem = ElemType::from_code(elem_code).ok_or_else(|| {
                LoadError::Malformed(format!(
                    "tensor {}: unknown element type id {}",
                    i, elem_code
                ))
            })?;

            let n_dims = read_u32(&mut reader)?;
            if n_dims > MAX_DIMS {
                return Err(LoadError::Malformed(format!(
                    "tensor {}: rank {} exceeds maximum {}",
                    i, n_dims, MAX_DIMS
                )));
            }
            let mut shape = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                let dim = read_u64(&mut reader)?;
                let dim = usize::try_from(dim).map_err(|_| {
                    LoadError::Malformed(format!("tensor {}: dimension {} too large", i, dim))
                })?;
                shape.push(dim);
            }
            let expected_len = byte_len(&shape, elem).ok_or_else(|| {
                LoadError::Malformed(format!("tensor {}: byte size overflows", i))
            })?;

            let flag = read_u8(&mut reader)?;
            let placement = match flag {
                0 => TensorPlacement::Runtime,
                1 => {
                    let offset = read_u64(&mut reader)?;
                    let len = read_u64(&mut reader)?;
                    if len != expected_len as u64 {
                        return Err(LoadError::Malformed(format!(
                            "tensor {}: constant length {} does not match shape ({} bytes)",
                            i, len, expected_len
                        )));
                    }
                    TensorPlacement::Constant { offset, len }
                }
                other => {
                    return Err(LoadError::Malformed(format!(
                        "tensor {}: invalid placement flag {}",
                        i, other
                    )))
                }
            };

            let is_constant = flag == 1;
            debug!(index = i, %name, ?elem, ?shape, is_constant, "tensor");
            tensors.push(TensorDecl {
                name,
                elem,
                shape,
                placement,
            });
        }

        // ---- Op table ----
        let mut ops = Vec::with_capacity(n_ops as usize);
        for i in 0..n_ops {
            let code = read_u32(&mut reader)?;
            let op_inputs = read_index_list(&mut reader, "op inputs")?;
            let op_outputs = read_index_list(&mut reader, "op outputs")?;

            let params_len = read_u32(&mut reader)?;
            if params_len > MAX_PARAMS_LEN {
                return Err(LoadError::Malformed(format!(
                    "op {}: parameter blob of {} bytes exceeds maximum {}",
                    i, params_len, MAX_PARAMS_LEN
                )));
            }
            let mut params = vec![0u8; params_len as usize];
            reader
                .read_exact(&mut params)
                .map_err(|_| truncated("op parameter blob"))?;

            debug!(index = i, code, inputs = ?op_inputs, outputs = ?op_outputs, "op");
            ops.push(OpDecl {
                code,
                inputs: op_inputs,
                outputs: op_outputs,
                params,
            });
        }

        // ---- Data section ----
        let pos = reader.position();
        let data_offset = align_offset(pos, DATA_ALIGNMENT);

        let model = Model {
            tensors,
            ops,
            inputs,
            outputs,
            data_offset,
            mmap,
        };
        model.validate()?;

        info!(
            n_tensors = model.tensors.len(),
            n_ops = model.ops.len(),
            data_offset = model.data_offset,
            "model loaded"
        );
        Ok(model)
    }

    /// Structural cross-reference validation, run once at the end of load.
    fn validate(&self) -> Result<(), LoadError> {
        let n = self.tensors.len();

        for (i, op) in self.ops.iter().enumerate() {
            for &t in op.inputs.iter().chain(op.outputs.iter()) {
                if t >= n {
                    return Err(LoadError::Malformed(format!(
                        "op {}: tensor index {} out of range ({} tensors)",
                        i, t, n
                    )));
                }
            }
        }
        for &t in self.inputs.iter().chain(self.outputs.iter()) {
            if t >= n {
                return Err(LoadError::Malformed(format!(
                    "graph io tensor index {} out of range ({} tensors)",
                    t, n
                )));
            }
        }
        for &t in &self.inputs {
            if self.tensors[t].is_constant() {
                return Err(LoadError::Malformed(format!(
                    "graph input {} refers to constant tensor '{}'",
                    t, self.tensors[t].name
                )));
            }
        }

        let file_len = self.mmap.len() as u64;
        for (i, decl) in self.tensors.iter().enumerate() {
            if let TensorPlacement::Constant { offset, len } = decl.placement {
                // Typed views cast constant bytes in place, so offsets must
                // keep the data section's element alignment.
                if offset % decl.elem.byte_size() as u64 != 0 {
                    return Err(LoadError::Malformed(format!(
                        "tensor {} ('{}'): constant offset {} not aligned for {}",
                        i, decl.name, offset, decl.elem
                    )));
                }
                let end = self
                    .data_offset
                    .checked_add(offset)
                    .and_then(|s| s.checked_add(len));
                match end {
                    Some(end) if end <= file_len => {}
                    _ => {
                        return Err(LoadError::Malformed(format!(
                            "tensor {} ('{}'): constant data extends beyond file \
                             (offset={}, len={}, file_len={})",
                            i, decl.name, offset, len, file_len
                        )))
                    }
                }
            }
        }

        Ok(())
    }

    // -- Accessors ----------------------------------------------------------

    pub fn tensors(&self) -> &[TensorDecl] {
        &self.tensors
    }

    pub fn ops(&self) -> &[OpDecl] {
        &self.ops
    }

    /// Declared graph input tensor indices, in order.
    pub fn inputs(&self) -> &[usize] {
        &self.inputs
    }

    /// Declared graph output tensor indices, in order.
    pub fn outputs(&self) -> &[usize] {
        &self.outputs
    }

    pub fn n_tensors(&self) -> usize {
        self.tensors.len()
    }

    pub fn n_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn tensor(&self, index: usize) -> Option<&TensorDecl> {
        self.tensors.get(index)
    }

    /// Raw bytes of a constant tensor, zero-copy from the mapping.
    ///
    /// Returns `None` for runtime tensors and out-of-range indices. Extents
    /// were bounds-checked at load time.
    pub fn constant_data(&self, index: usize) -> Option<&[u8]> {
        match self.tensors.get(index)?.placement {
            TensorPlacement::Constant { offset, len } => {
                let start = (self.data_offset + offset) as usize;
                Some(&self.mmap[start..start + len as usize])
            }
            TensorPlacement::Runtime => None,
        }
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("n_tensors", &self.tensors.len())
            .field("n_ops", &self.ops.len())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("data_offset", &self.data_offset)
            .field("file_size", &self.mmap.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Binary reader helpers
// ---------------------------------------------------------------------------

fn truncated(what: &str) -> LoadError {
    LoadError::Malformed(format!("unexpected end of file reading {}", what))
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8, LoadError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf).map_err(|_| truncated("u8"))?;
    Ok(buf[0])
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, LoadError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(|_| truncated("u32"))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, LoadError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(|_| truncated("u64"))?;
    Ok(u64::from_le_bytes(buf))
}

/// Read a length-prefixed UTF-8 string: u64 length + raw bytes.
fn read_string<R: Read>(r: &mut R) -> Result<String, LoadError> {
    let len = read_u64(r)? as usize;
    if len > MAX_NAME_LEN {
        return Err(LoadError::Malformed(format!(
            "string length {} is suspiciously large",
            len
        )));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(|_| truncated("string"))?;
    String::from_utf8(buf).map_err(|e| LoadError::Malformed(format!("invalid UTF-8: {}", e)))
}

/// Read a u32 count followed by that many u32 tensor indices.
fn read_index_list<R: Read>(r: &mut R, what: &str) -> Result<Vec<usize>, LoadError> {
    let count = read_u32(r)?;
    if count > MAX_IO_PER_OP {
        return Err(LoadError::Malformed(format!(
            "{}: list of {} indices exceeds maximum {}",
            what, count, MAX_IO_PER_OP
        )));
    }
    let mut indices = Vec::with_capacity(count as usize);
    for _ in 0..count {
        indices.push(read_u32(r)? as usize);
    }
    Ok(indices)
}

/// Round `offset` up to the next multiple of `alignment`.
fn align_offset(offset: u64, alignment: u64) -> u64 {
    let remainder = offset % alignment;
    if remainder == 0 {
        offset
    } else {
        offset + (alignment - remainder)
    }
}

// ---------------------------------------------------------------------------
// Test-only container builder
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

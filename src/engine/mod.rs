//! Graph instance: build, resize, allocate, invoke.
//!
//! A [`GraphInstance`] is derived from an immutable [`Model`] and an
//! [`OpResolver`] and owns its arena outright: buffers are committed by
//! [`allocate`](GraphInstance::allocate) and released when the instance
//! drops. Staging is strict: building precedes allocation and allocation
//! precedes invocation, and violations are reported, never tolerated.

mod arena;
mod planner;

pub use planner::Binding;

use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::container::Model;
use crate::error::{AllocError, BuildError, RuntimeError, ShapeError};
use crate::ops::{Kernel, OpParams, OpResolver, OpType, TensorView, TensorViewMut};
use crate::tensor::{byte_len, ElemType, Element};

use arena::Arena;
use planner::{ArenaPlan, TensorRequest};

/// One tensor materialized from the model's declaration.
#[derive(Debug, Clone)]
struct RuntimeTensor {
    name: String,
    elem: ElemType,
    /// Current shape; inputs may diverge from the declaration after a
    /// resize, and op outputs are recomputed by shape inference.
    shape: Vec<usize>,
    constant: bool,
}

/// One op with its kernel resolved and parameters decoded.
#[derive(Debug)]
struct NodeInstance {
    op: OpType,
    kernel: Kernel,
    params: OpParams,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
}

/// An executable graph bound to one model and one resolved kernel set.
///
/// A single instance must not be invoked concurrently from multiple
/// threads, since the arena is mutated in place. The underlying `Model` and the
/// resolver may be shared freely across instances.
#[derive(Debug)]
pub struct GraphInstance {
    model: Arc<Model>,
    tensors: Vec<RuntimeTensor>,
    nodes: Vec<NodeInstance>,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    plan: Option<ArenaPlan>,
    arena: Option<Arena>,
    /// True only while the most recent allocate succeeded for the current
    /// shapes.
    ready: bool,
}

impl GraphInstance {
    // -- Build --------------------------------------------------------------

    /// Build an executable instance: materialize tensors, resolve every
    /// op's kernel, decode parameters, and validate the execution order.
    ///
    /// The model is untouched; on error no partially built instance
    /// escapes.
    pub fn build(model: Arc<Model>, resolver: &OpResolver) -> Result<Self, BuildError> {
        let tensors: Vec<RuntimeTensor> = model
            .tensors()
            .iter()
            .map(|decl| RuntimeTensor {
                name: decl.name.clone(),
                elem: decl.elem,
                shape: decl.shape.clone(),
                constant: decl.is_constant(),
            })
            .collect();

        let mut nodes = Vec::with_capacity(model.n_ops());
        for (op_index, decl) in model.ops().iter().enumerate() {
            let op = OpType::from_code(decl.code)
                .ok_or(BuildError::UnresolvedOperator(decl.code))?;
            let kernel = resolver
                .resolve(op)
                .copied()
                .ok_or(BuildError::UnresolvedOperator(decl.code))?;
            let params = OpParams::decode(op, &decl.params)
                .map_err(|reason| BuildError::InvalidParams { op_index, reason })?;

            debug!(op_index, op = op.name(), kernel = kernel.name, "resolved");
            nodes.push(NodeInstance {
                op,
                kernel,
                params,
                inputs: decl.inputs.clone(),
                outputs: decl.outputs.clone(),
            });
        }

        let instance = GraphInstance {
            inputs: model.inputs().to_vec(),
            outputs: model.outputs().to_vec(),
            model,
            tensors,
            nodes,
            plan: None,
            arena: None,
            ready: false,
        };
        instance.validate_topology()?;

        info!(
            n_tensors = instance.tensors.len(),
            n_ops = instance.nodes.len(),
            "graph built"
        );
        Ok(instance)
    }

    /// The op sequence, in the order the model stores it, must form a valid
    /// topological order: no op consumes a tensor before it is produced, no
    /// tensor is produced twice, and every runtime tensor is producible.
    fn validate_topology(&self) -> Result<(), BuildError> {
        let mut produced = vec![false; self.tensors.len()];
        for (t, tensor) in self.tensors.iter().enumerate() {
            if tensor.constant {
                produced[t] = true;
            }
        }
        for &t in &self.inputs {
            produced[t] = true;
        }

        for (op_index, node) in self.nodes.iter().enumerate() {
            for &t in &node.inputs {
                if !produced[t] {
                    return Err(BuildError::InvalidTopology(format!(
                        "op {} ({}) consumes tensor {} before it is produced",
                        op_index,
                        node.op.name(),
                        t
                    )));
                }
            }
            for &t in &node.outputs {
                if produced[t] {
                    return Err(BuildError::InvalidTopology(format!(
                        "op {} ({}) produces tensor {} which is already produced",
                        op_index,
                        node.op.name(),
                        t
                    )));
                }
                produced[t] = true;
            }
        }

        for (t, tensor) in self.tensors.iter().enumerate() {
            if !produced[t] {
                return Err(BuildError::InvalidTopology(format!(
                    "runtime tensor {} ('{}') is never produced",
                    t, tensor.name
                )));
            }
        }
        Ok(())
    }

    // -- Resize -------------------------------------------------------------

    /// Change a graph input's shape.
    ///
    /// Invalidates any previously computed arena (the next
    /// [`allocate`](Self::allocate) re-plans) but does not re-resolve
    /// kernels or re-validate topology.
    pub fn resize_input(
        &mut self,
        tensor_index: usize,
        new_shape: &[usize],
    ) -> Result<(), ShapeError> {
        if !self.inputs.contains(&tensor_index) {
            return Err(ShapeError::Incompatible(format!(
                "tensor {} is not a graph input",
                tensor_index
            )));
        }
        debug!(tensor = tensor_index, ?new_shape, "resize input");
        self.tensors[tensor_index].shape = new_shape.to_vec();
        self.plan = None;
        self.arena = None;
        self.ready = false;
        Ok(())
    }

    // -- Allocate -----------------------------------------------------------

    /// Plan and commit the arena for the current shapes.
    ///
    /// Runs shape inference over the op sequence, computes tensor
    /// lifetimes, lays out the arena, and binds every runtime tensor.
    /// Idempotent: with no intervening shape change a repeat call is a
    /// no-op, and a forced re-plan reproduces the identical layout.
    pub fn allocate(&mut self) -> Result<(), AllocError> {
        if self.ready {
            debug!("allocate: shapes unchanged, keeping existing arena");
            return Ok(());
        }
        self.ready = false;

        // Shape propagation in execution order.
        for node in &self.nodes {
            let input_shapes: Vec<&[usize]> = node
                .inputs
                .iter()
                .map(|&t| self.tensors[t].shape.as_slice())
                .collect();
            let inferred = (node.kernel.infer)(&node.params, &input_shapes)?;
            if inferred.len() != node.outputs.len() {
                return Err(ShapeError::Incompatible(format!(
                    "{} inferred {} output shapes for {} outputs",
                    node.op.name(),
                    inferred.len(),
                    node.outputs.len()
                ))
                .into());
            }
            for (&t, shape) in node.outputs.iter().zip(inferred) {
                trace!(tensor = t, ?shape, "inferred shape");
                self.tensors[t].shape = shape;
            }
        }

        // Lifetimes and layout.
        let runtime: Vec<bool> = self.tensors.iter().map(|t| !t.constant).collect();
        let node_ios: Vec<(&[usize], &[usize])> = self
            .nodes
            .iter()
            .map(|n| (n.inputs.as_slice(), n.outputs.as_slice()))
            .collect();
        let lifetimes = planner::compute_lifetimes(
            self.tensors.len(),
            &node_ios,
            &self.inputs,
            &self.outputs,
            &runtime,
        );

        let mut requests = Vec::new();
        for (t, lifetime) in lifetimes.iter().enumerate() {
            if let Some((first, last)) = lifetime {
                let bytes = byte_len(&self.tensors[t].shape, self.tensors[t].elem)
                    .ok_or(AllocError::OutOfMemory(usize::MAX))?;
                requests.push(TensorRequest {
                    index: t,
                    bytes,
                    first_step: *first,
                    last_step: *last,
                });
            }
        }

        let plan = planner::plan(self.tensors.len(), &requests);
        let arena = Arena::commit(plan.total_bytes)?;

        info!(
            arena_bytes = plan.total_bytes,
            runtime_tensors = requests.len(),
            "tensors allocated"
        );
        self.plan = Some(plan);
        self.arena = Some(arena);
        self.ready = true;
        Ok(())
    }

    // -- Invoke -------------------------------------------------------------

    /// Execute every op in stored order against the current arena contents.
    ///
    /// A kernel failure halts invocation at that op; buffers written by
    /// earlier ops keep their contents and the instance stays allocated, so
    /// the caller may fix inputs and re-invoke without rebuilding.
    pub fn invoke(&mut self) -> Result<(), RuntimeError> {
        if !self.ready {
            return Err(RuntimeError::NotReady);
        }
        let base = match self.arena.as_mut() {
            Some(arena) => arena.bytes_mut().as_mut_ptr(),
            None => return Err(RuntimeError::NotReady),
        };
        let plan = match self.plan.as_ref() {
            Some(plan) => plan,
            None => return Err(RuntimeError::NotReady),
        };

        for (op_index, node) in self.nodes.iter().enumerate() {
            trace!(op_index, op = node.op.name(), "invoke op");

            let mut input_views = Vec::with_capacity(node.inputs.len());
            for &t in &node.inputs {
                let tensor = &self.tensors[t];
                let bytes: &[u8] = if tensor.constant {
                    self.model
                        .constant_data(t)
                        .expect("constant extents validated at load")
                } else {
                    let b = plan.bindings[t].expect("runtime tensor bound at allocate");
                    // SAFETY: the binding lies inside the committed arena,
                    // and the planner keeps simultaneously-live tensors in
                    // disjoint byte ranges, so this shared view cannot
                    // alias any of the node's output views below. Reading
                    // the same input tensor twice aliases only shared
                    // views.
                    unsafe { std::slice::from_raw_parts(base.add(b.offset), b.len) }
                };
                input_views.push(TensorView {
                    elem: tensor.elem,
                    shape: &tensor.shape,
                    bytes,
                });
            }

            let mut output_views = Vec::with_capacity(node.outputs.len());
            for &t in &node.outputs {
                let tensor = &self.tensors[t];
                let b = plan.bindings[t].expect("runtime tensor bound at allocate");
                // SAFETY: as above; output tensors of one op are distinct
                // live tensors, so their ranges are mutually disjoint and
                // disjoint from every input range.
                let bytes = unsafe { std::slice::from_raw_parts_mut(base.add(b.offset), b.len) };
                output_views.push(TensorViewMut {
                    elem: tensor.elem,
                    shape: &tensor.shape,
                    bytes,
                });
            }

            (node.kernel.run)(&node.params, &input_views, &mut output_views).map_err(|e| {
                RuntimeError::KernelFailed {
                    op_index,
                    name: node.kernel.name,
                    source: e,
                }
            })?;
        }

        debug!(n_ops = self.nodes.len(), "invocation complete");
        Ok(())
    }

    // -- Typed access -------------------------------------------------------

    /// Mutable typed view of the i-th graph input, bound into the arena.
    ///
    /// Fails with [`RuntimeError::NotReady`] before a successful allocate
    /// and [`RuntimeError::TypeMismatch`] when `T` differs from the
    /// tensor's declared element type.
    ///
    /// # Panics
    /// Panics if `input` is not a valid input ordinal.
    pub fn typed_input<T: Element>(&mut self, input: usize) -> Result<&mut [T], RuntimeError> {
        let t = self.inputs[input];
        if !self.ready {
            return Err(RuntimeError::NotReady);
        }
        let declared = self.tensors[t].elem;
        if declared != T::ELEM {
            return Err(RuntimeError::TypeMismatch {
                tensor: t,
                requested: T::ELEM,
                declared,
            });
        }
        let binding = self
            .plan
            .as_ref()
            .and_then(|p| p.bindings[t])
            .ok_or(RuntimeError::NotReady)?;
        let arena = self.arena.as_mut().ok_or(RuntimeError::NotReady)?;
        Ok(bytemuck::cast_slice_mut(arena.slice_mut(&binding)))
    }

    /// Read-only typed view of the i-th graph output.
    ///
    /// # Panics
    /// Panics if `output` is not a valid output ordinal.
    pub fn typed_output<T: Element>(&self, output: usize) -> Result<&[T], RuntimeError> {
        let t = self.outputs[output];
        if !self.ready {
            return Err(RuntimeError::NotReady);
        }
        let declared = self.tensors[t].elem;
        if declared != T::ELEM {
            return Err(RuntimeError::TypeMismatch {
                tensor: t,
                requested: T::ELEM,
                declared,
            });
        }
        let binding = self
            .plan
            .as_ref()
            .and_then(|p| p.bindings[t])
            .ok_or(RuntimeError::NotReady)?;
        let arena = self.arena.as_ref().ok_or(RuntimeError::NotReady)?;
        Ok(bytemuck::cast_slice(arena.slice(&binding)))
    }

    // -- Introspection ------------------------------------------------------

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Current shape of the i-th graph input.
    pub fn input_shape(&self, input: usize) -> &[usize] {
        &self.tensors[self.inputs[input]].shape
    }

    /// Current shape of the i-th graph output (recomputed by allocate).
    pub fn output_shape(&self, output: usize) -> &[usize] {
        &self.tensors[self.outputs[output]].shape
    }

    pub fn input_elem(&self, input: usize) -> ElemType {
        self.tensors[self.inputs[input]].elem
    }

    pub fn output_elem(&self, output: usize) -> ElemType {
        self.tensors[self.outputs[output]].elem
    }

    /// Arena binding of a tensor, or `Ok(None)` for constants.
    ///
    /// Fails with [`AllocError::NotPlanned`] before the first successful
    /// allocate.
    pub fn binding(&self, tensor_index: usize) -> Result<Option<Binding>, AllocError> {
        let plan = self.plan.as_ref().ok_or(AllocError::NotPlanned)?;
        Ok(plan.bindings.get(tensor_index).copied().flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::testutil::{build_container, load_bytes, OpSpec, TensorSpec};
    use crate::error::KernelError;

    fn add_scalar_params(value: f32) -> Vec<u8> {
        value.to_le_bytes().to_vec()
    }

    fn reshape_params(dims: &[u64]) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(&(dims.len() as u32).to_le_bytes());
        for &d in dims {
            blob.extend_from_slice(&d.to_le_bytes());
        }
        blob
    }

    /// in[5] --add_scalar(+1)--> out[5]
    fn add_one_model() -> Arc<Model> {
        let bytes = build_container(
            &[
                TensorSpec::runtime("in", ElemType::F32, &[5]),
                TensorSpec::runtime("out", ElemType::F32, &[5]),
            ],
            &[OpSpec::new(1, &[0], &[1]).with_params(add_scalar_params(1.0))],
            &[0],
            &[1],
        );
        Arc::new(load_bytes(&bytes).unwrap())
    }

    #[test]
    fn test_end_to_end_add_one() {
        let model = add_one_model();
        let resolver = OpResolver::builtin();
        let mut graph = GraphInstance::build(model, &resolver).unwrap();

        graph.allocate().unwrap();
        graph
            .typed_input::<f32>(0)
            .unwrap()
            .copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        graph.invoke().unwrap();

        assert_eq!(graph.output_shape(0), &[5]);
        assert_eq!(
            graph.typed_output::<f32>(0).unwrap(),
            &[2.0, 3.0, 4.0, 5.0, 6.0]
        );
    }

    #[test]
    fn test_reinvoke_with_new_inputs() {
        let model = add_one_model();
        let resolver = OpResolver::builtin();
        let mut graph = GraphInstance::build(model, &resolver).unwrap();
        graph.allocate().unwrap();

        graph
            .typed_input::<f32>(0)
            .unwrap()
            .copy_from_slice(&[0.0; 5]);
        graph.invoke().unwrap();
        assert_eq!(graph.typed_output::<f32>(0).unwrap(), &[1.0; 5]);

        graph
            .typed_input::<f32>(0)
            .unwrap()
            .copy_from_slice(&[9.0; 5]);
        graph.invoke().unwrap();
        assert_eq!(graph.typed_output::<f32>(0).unwrap(), &[10.0; 5]);
    }

    #[test]
    fn test_unknown_op_code_is_unresolved() {
        let bytes = build_container(
            &[
                TensorSpec::runtime("in", ElemType::F32, &[4]),
                TensorSpec::runtime("out", ElemType::F32, &[4]),
            ],
            &[OpSpec::new(99, &[0], &[1])],
            &[0],
            &[1],
        );
        let model = Arc::new(load_bytes(&bytes).unwrap());
        let err = GraphInstance::build(model, &OpResolver::builtin()).unwrap_err();
        assert!(matches!(err, BuildError::UnresolvedOperator(99)));
    }

    #[test]
    fn test_empty_resolver_is_unresolved() {
        let model = add_one_model();
        let err = GraphInstance::build(model, &OpResolver::new()).unwrap_err();
        assert!(matches!(err, BuildError::UnresolvedOperator(1)));
    }

    #[test]
    fn test_invalid_params() {
        let bytes = build_container(
            &[
                TensorSpec::runtime("in", ElemType::F32, &[4]),
                TensorSpec::runtime("out", ElemType::F32, &[4]),
            ],
            &[OpSpec::new(1, &[0], &[1]).with_params(vec![0u8; 3])],
            &[0],
            &[1],
        );
        let model = Arc::new(load_bytes(&bytes).unwrap());
        let err = GraphInstance::build(model, &OpResolver::builtin()).unwrap_err();
        match err {
            BuildError::InvalidParams { op_index, reason } => {
                assert_eq!(op_index, 0);
                assert!(reason.contains("4-byte"));
            }
            other => panic!("expected InvalidParams, got {:?}", other),
        }
    }

    #[test]
    fn test_consume_before_produce_is_invalid_topology() {
        // op 0 consumes t1, which op 1 produces later.
        let bytes = build_container(
            &[
                TensorSpec::runtime("in", ElemType::F32, &[4]),
                TensorSpec::runtime("mid", ElemType::F32, &[4]),
                TensorSpec::runtime("out", ElemType::F32, &[4]),
            ],
            &[
                OpSpec::new(0, &[1], &[2]),
                OpSpec::new(0, &[0], &[1]),
            ],
            &[0],
            &[2],
        );
        let model = Arc::new(load_bytes(&bytes).unwrap());
        let err = GraphInstance::build(model, &OpResolver::builtin()).unwrap_err();
        assert!(matches!(err, BuildError::InvalidTopology(_)));
        assert!(err.to_string().contains("before it is produced"));
    }

    #[test]
    fn test_double_produce_is_invalid_topology() {
        let bytes = build_container(
            &[
                TensorSpec::runtime("in", ElemType::F32, &[4]),
                TensorSpec::runtime("out", ElemType::F32, &[4]),
            ],
            &[
                OpSpec::new(0, &[0], &[1]),
                OpSpec::new(0, &[0], &[1]),
            ],
            &[0],
            &[1],
        );
        let model = Arc::new(load_bytes(&bytes).unwrap());
        let err = GraphInstance::build(model, &OpResolver::builtin()).unwrap_err();
        assert!(err.to_string().contains("already produced"));
    }

    #[test]
    fn test_unproduced_tensor_is_invalid_topology() {
        let bytes = build_container(
            &[
                TensorSpec::runtime("in", ElemType::F32, &[4]),
                TensorSpec::runtime("orphan", ElemType::F32, &[4]),
            ],
            &[],
            &[0],
            &[0],
        );
        let model = Arc::new(load_bytes(&bytes).unwrap());
        let err = GraphInstance::build(model, &OpResolver::builtin()).unwrap_err();
        assert!(err.to_string().contains("never produced"));
    }

    #[test]
    fn test_invoke_before_allocate_is_not_ready() {
        let model = add_one_model();
        let mut graph = GraphInstance::build(model, &OpResolver::builtin()).unwrap();
        assert!(matches!(graph.invoke(), Err(RuntimeError::NotReady)));
    }

    #[test]
    fn test_typed_access_before_allocate_is_not_ready() {
        let model = add_one_model();
        let mut graph = GraphInstance::build(model, &OpResolver::builtin()).unwrap();
        assert!(matches!(
            graph.typed_input::<f32>(0),
            Err(RuntimeError::NotReady)
        ));
        assert!(matches!(
            graph.typed_output::<f32>(0),
            Err(RuntimeError::NotReady)
        ));
        assert!(matches!(graph.binding(0), Err(AllocError::NotPlanned)));
    }

    #[test]
    fn test_typed_view_type_mismatch() {
        let model = add_one_model();
        let mut graph = GraphInstance::build(model, &OpResolver::builtin()).unwrap();
        graph.allocate().unwrap();

        let err = graph.typed_input::<i32>(0).unwrap_err();
        match err {
            RuntimeError::TypeMismatch {
                requested,
                declared,
                ..
            } => {
                assert_eq!(requested, ElemType::I32);
                assert_eq!(declared, ElemType::F32);
            }
            other => panic!("expected TypeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let model = add_one_model();
        let mut graph = GraphInstance::build(model, &OpResolver::builtin()).unwrap();
        graph.allocate().unwrap();
        let first: Vec<_> = (0..2).map(|t| graph.binding(t).unwrap()).collect();

        // Repeat call with unchanged shapes.
        graph.allocate().unwrap();
        let second: Vec<_> = (0..2).map(|t| graph.binding(t).unwrap()).collect();
        assert_eq!(first, second);

        // Forced re-plan (resize to the same shape) reproduces the layout.
        graph.resize_input(0, &[5]).unwrap();
        graph.allocate().unwrap();
        let third: Vec<_> = (0..2).map(|t| graph.binding(t).unwrap()).collect();
        assert_eq!(first, third);
    }

    #[test]
    fn test_resize_then_reallocate_propagates_shape() {
        let model = add_one_model();
        let mut graph = GraphInstance::build(model, &OpResolver::builtin()).unwrap();
        graph.allocate().unwrap();

        graph.resize_input(0, &[2, 3]).unwrap();
        // The old arena is gone until re-allocation.
        assert!(matches!(graph.invoke(), Err(RuntimeError::NotReady)));

        graph.allocate().unwrap();
        assert_eq!(graph.input_shape(0), &[2, 3]);
        assert_eq!(graph.output_shape(0), &[2, 3]);

        let input = graph.typed_input::<f32>(0).unwrap();
        assert_eq!(input.len(), 6);
        input.copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        graph.invoke().unwrap();
        assert_eq!(
            graph.typed_output::<f32>(0).unwrap(),
            &[2.0, 3.0, 4.0, 5.0, 6.0, 7.0]
        );
    }

    #[test]
    fn test_resize_non_input_rejected() {
        let model = add_one_model();
        let mut graph = GraphInstance::build(model, &OpResolver::builtin()).unwrap();
        let err = graph.resize_input(1, &[2]).unwrap_err();
        assert!(err.to_string().contains("not a graph input"));
    }

    #[test]
    fn test_shape_inference_failure_surfaces_at_allocate() {
        // add over two inputs; resizing one breaks the elementwise match.
        let bytes = build_container(
            &[
                TensorSpec::runtime("a", ElemType::F32, &[4]),
                TensorSpec::runtime("b", ElemType::F32, &[4]),
                TensorSpec::runtime("out", ElemType::F32, &[4]),
            ],
            &[OpSpec::new(2, &[0, 1], &[2])],
            &[0, 1],
            &[2],
        );
        let model = Arc::new(load_bytes(&bytes).unwrap());
        let mut graph = GraphInstance::build(model, &OpResolver::builtin()).unwrap();
        graph.allocate().unwrap();

        graph.resize_input(0, &[3]).unwrap();
        let err = graph.allocate().unwrap_err();
        assert!(matches!(err, AllocError::Shape(_)));
        // A failed allocate leaves the graph not ready.
        assert!(matches!(graph.invoke(), Err(RuntimeError::NotReady)));
    }

    #[test]
    fn test_kernel_failure_halts_and_instance_survives() {
        fn failing_run(
            _params: &OpParams,
            _inputs: &[TensorView<'_>],
            _outputs: &mut [TensorViewMut<'_>],
        ) -> Result<(), KernelError> {
            Err(KernelError::Precondition("injected failure".to_string()))
        }

        let mut resolver = OpResolver::builtin();
        let identity = *resolver.resolve(OpType::Identity).unwrap();
        resolver.register(
            OpType::Identity,
            Kernel {
                name: "failing_identity",
                infer: identity.infer,
                run: failing_run,
            },
        );

        // add_scalar succeeds at op 0, the failing identity halts at op 1.
        let bytes = build_container(
            &[
                TensorSpec::runtime("in", ElemType::F32, &[4]),
                TensorSpec::runtime("mid", ElemType::F32, &[4]),
                TensorSpec::runtime("out", ElemType::F32, &[4]),
            ],
            &[
                OpSpec::new(1, &[0], &[1]).with_params(add_scalar_params(1.0)),
                OpSpec::new(0, &[1], &[2]),
            ],
            &[0],
            &[2],
        );
        let model = Arc::new(load_bytes(&bytes).unwrap());
        let mut graph = GraphInstance::build(model, &resolver).unwrap();
        graph.allocate().unwrap();
        graph.typed_input::<f32>(0).unwrap().fill(1.0);

        let err = graph.invoke().unwrap_err();
        match &err {
            RuntimeError::KernelFailed { op_index, name, .. } => {
                assert_eq!(*op_index, 1);
                assert_eq!(*name, "failing_identity");
            }
            other => panic!("expected KernelFailed, got {:?}", other),
        }

        // The arena and bindings are intact; re-invocation reaches the
        // same op again rather than failing the staging preconditions.
        let err = graph.invoke().unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::KernelFailed { op_index: 1, .. }
        ));
    }

    #[test]
    fn test_matmul_relu_chain_with_constant_weights() {
        // x[2,3] @ w[3,2] -> relu -> out[2,2]
        let bytes = build_container(
            &[
                TensorSpec::runtime("x", ElemType::F32, &[2, 3]),
                TensorSpec::constant_f32(
                    "w",
                    &[3, 2],
                    &[1.0, -1.0, 0.5, 2.0, -0.5, 1.0],
                ),
                TensorSpec::runtime("mm", ElemType::F32, &[2, 2]),
                TensorSpec::runtime("out", ElemType::F32, &[2, 2]),
            ],
            &[
                OpSpec::new(5, &[0, 1], &[2]),
                OpSpec::new(4, &[2], &[3]),
            ],
            &[0],
            &[3],
        );
        let model = Arc::new(load_bytes(&bytes).unwrap());
        let mut graph = GraphInstance::build(model, &OpResolver::builtin()).unwrap();
        graph.allocate().unwrap();

        graph
            .typed_input::<f32>(0)
            .unwrap()
            .copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        graph.invoke().unwrap();

        // Row 0: [1,2,3] -> mm = [1*1+2*0.5+3*-0.5, 1*-1+2*2+3*1] = [0.5, 6]
        // Row 1: [4,5,6] -> mm = [4+2.5-3, -4+10+6] = [3.5, 12]
        assert_eq!(graph.output_shape(0), &[2, 2]);
        assert_eq!(
            graph.typed_output::<f32>(0).unwrap(),
            &[0.5, 6.0, 3.5, 12.0]
        );
    }

    #[test]
    fn test_reshape_end_to_end() {
        let bytes = build_container(
            &[
                TensorSpec::runtime("in", ElemType::F32, &[6]),
                TensorSpec::runtime("out", ElemType::F32, &[2, 3]),
            ],
            &[OpSpec::new(6, &[0], &[1]).with_params(reshape_params(&[2, 3]))],
            &[0],
            &[1],
        );
        let model = Arc::new(load_bytes(&bytes).unwrap());
        let mut graph = GraphInstance::build(model, &OpResolver::builtin()).unwrap();
        graph.allocate().unwrap();

        graph
            .typed_input::<f32>(0)
            .unwrap()
            .copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        graph.invoke().unwrap();

        assert_eq!(graph.output_shape(0), &[2, 3]);
        assert_eq!(
            graph.typed_output::<f32>(0).unwrap(),
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );
    }

    #[test]
    fn test_arena_reuses_memory_on_chain() {
        // Four sequential identities: intermediates can share one region.
        let bytes = build_container(
            &[
                TensorSpec::runtime("t0", ElemType::F32, &[1024]),
                TensorSpec::runtime("t1", ElemType::F32, &[1024]),
                TensorSpec::runtime("t2", ElemType::F32, &[1024]),
                TensorSpec::runtime("t3", ElemType::F32, &[1024]),
                TensorSpec::runtime("t4", ElemType::F32, &[1024]),
            ],
            &[
                OpSpec::new(0, &[0], &[1]),
                OpSpec::new(0, &[1], &[2]),
                OpSpec::new(0, &[2], &[3]),
                OpSpec::new(0, &[3], &[4]),
            ],
            &[0],
            &[4],
        );
        let model = Arc::new(load_bytes(&bytes).unwrap());
        let mut graph = GraphInstance::build(model, &OpResolver::builtin()).unwrap();
        graph.allocate().unwrap();

        let total: usize = (0..5)
            .map(|t| graph.binding(t).unwrap().unwrap())
            .map(|b| b.offset + b.len)
            .max()
            .unwrap();
        // Five 4 KiB tensors packed naively would need 20 KiB.
        assert!(total < 5 * 4096, "arena should reuse freed regions");

        // The pipeline still computes correctly through the shared regions.
        graph.typed_input::<f32>(0).unwrap().fill(7.0);
        graph.invoke().unwrap();
        assert!(graph
            .typed_output::<f32>(0)
            .unwrap()
            .iter()
            .all(|&v| v == 7.0));
    }

    #[test]
    fn test_shared_model_across_instances() {
        let model = add_one_model();
        let resolver = OpResolver::builtin();

        let mut a = GraphInstance::build(Arc::clone(&model), &resolver).unwrap();
        let mut b = GraphInstance::build(Arc::clone(&model), &resolver).unwrap();
        a.allocate().unwrap();
        b.allocate().unwrap();

        a.typed_input::<f32>(0).unwrap().fill(1.0);
        b.typed_input::<f32>(0).unwrap().fill(5.0);
        a.invoke().unwrap();
        b.invoke().unwrap();

        assert_eq!(a.typed_output::<f32>(0).unwrap(), &[2.0; 5]);
        assert_eq!(b.typed_output::<f32>(0).unwrap(), &[6.0; 5]);
    }
}

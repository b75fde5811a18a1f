//! Compiler configuration.

/// Liveness-range strategy for the register allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LivenessMode {
    /// Binding start to the end of the enclosing form. Cheap, pessimistic.
    Naive,
    /// Binding start to the last textual occurrence of the name.
    #[default]
    Precise,
}

/// Recognized compiler options.
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Emit arity/type/bounds checks and error stubs in primitives.
    pub safe_primitives: bool,
    /// Extra heap-overflow pre-check before flonum allocations.
    pub safe_flonums: bool,
    /// Extra heap-overflow pre-check before pair allocations.
    pub safe_cons: bool,
    /// Emit garbage-collection checkpoints at call sites.
    pub garbage_collection: bool,
    /// The input was CPS-converted upstream: falling off the end of the
    /// program body is an error rather than a normal halt.
    pub do_cps_conversion: bool,
    /// Run the independent per-top-level-form passes on worker threads.
    pub parallel: bool,
    /// Allow sub-expression evaluation directly into a target register
    /// instead of bouncing through the result register.
    pub fast_expression_targetting: bool,
    /// Maintain a ring buffer of recently accessed global-variable slots
    /// in the context, for debugging.
    pub keep_variable_stack: bool,

    pub liveness: LivenessMode,

    /// Size of one heap semispace in bytes (8-aligned).
    pub heap_semispace_bytes: u64,
    /// Number of stack-local slots available to the allocator.
    pub locals_count: u32,
    /// Capacity of the global-variable array.
    pub globals_count: u32,
    /// Size of the Scheme value stack in bytes.
    pub stack_bytes: u64,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            safe_primitives: true,
            safe_flonums: true,
            safe_cons: true,
            garbage_collection: true,
            do_cps_conversion: false,
            parallel: false,
            fast_expression_targetting: false,
            keep_variable_stack: false,
            liveness: LivenessMode::Precise,
            heap_semispace_bytes: 256 * 1024,
            locals_count: 256,
            globals_count: 1024,
            stack_bytes: 64 * 1024,
        }
    }
}

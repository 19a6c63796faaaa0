//! Work-group probe: every invocation writes its own IDs, which are read
//! back and logged alongside the device's work-group limits.

use ssbo_compute::layout::POINT_OUT;
use ssbo_compute::{
    AssetSource, BufferHandle, BufferStore, BufferUsage, ComputeBackend, ComputeContext,
    ComputeError, DispatchDescriptor, InvocationRecord, Kernel, ProgramHandle,
};

use crate::{DemoConfig, FrameOutcome, Renderer};

/// `i32` values per record.
const RECORD_WIDTH: usize = std::mem::size_of::<InvocationRecord>() / 4;

pub struct InvocationProbe<B: ComputeBackend> {
    ctx: ComputeContext<B>,
    program: ProgramHandle,
    records: BufferHandle,
    groups: [u32; 3],
    log_rows: usize,
}

impl<B: ComputeBackend> InvocationProbe<B> {
    pub fn init<S: AssetSource>(
        backend: B,
        store: &BufferStore<S>,
        config: &DemoConfig,
    ) -> Result<Self, ComputeError> {
        let mut ctx = ComputeContext::new(backend, config.uniform_policy)?;
        let limits = ctx.limits();
        tracing::info!(
            "work group limits: count {:?}, size {:?}, {} invocations, storage block {} bytes",
            limits.max_work_group_count,
            limits.max_work_group_size,
            limits.max_work_group_invocations,
            limits.max_storage_block_size
        );

        let names = config.asset_names(ctx.backend().preferred_language());
        let program = ctx.compile_compute(
            Kernel::InvocationProbe,
            &store.load_shader(&names.invocation_probe)?,
        )?;
        let capacity = config.probe.records as usize * std::mem::size_of::<InvocationRecord>();
        let records = ctx.create_storage_buffer(capacity, BufferUsage::Dynamic)?;
        ctx.upload(records, &vec![0; capacity])?;

        Ok(Self {
            ctx,
            program,
            records,
            groups: config.probe.groups,
            log_rows: config.probe.log_rows,
        })
    }

    /// Records written by the last completed frame.
    pub fn records(&mut self) -> Result<Vec<InvocationRecord>, ComputeError> {
        let bytes = self.ctx.read_back(self.records)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    #[must_use]
    pub fn context(&self) -> &ComputeContext<B> {
        &self.ctx
    }

    fn frame(&mut self) -> Result<(), ComputeError> {
        self.ctx.run(&DispatchDescriptor {
            program: self.program,
            groups: self.groups,
            uniforms: &[],
            bindings: &[(POINT_OUT, self.records)],
        })?;
        let rows = self
            .ctx
            .read_grid::<i32>(self.records, RECORD_WIDTH, self.log_rows, 0)?;
        for (i, row) in rows.iter().enumerate() {
            tracing::info!("probe[{i}]: {row}");
        }
        Ok(())
    }
}

impl<B: ComputeBackend> Renderer for InvocationProbe<B> {
    fn name(&self) -> &'static str {
        "probe"
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.ctx.set_viewport(width, height);
    }

    fn render(&mut self) -> FrameOutcome {
        let result = self.frame();
        FrameOutcome::from_result(self.name(), result)
    }
}

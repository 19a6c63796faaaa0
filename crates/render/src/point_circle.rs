//! Point-circle demo: a compute pass writes one vertex per invocation around
//! a circle whose radius is the frame counter, then the same buffer is drawn
//! as points.

use ssbo_compute::layout::POINT_OUT;
use ssbo_compute::{
    AssetSource, BufferHandle, BufferStore, BufferUsage, ComputeBackend, ComputeContext,
    ComputeError, Kernel, PointVertex, ProgramHandle, UniformValue,
};

use crate::{DemoConfig, FrameOutcome, Renderer};

/// The frame counter runs `0..FRAME_WRAP`.
pub const FRAME_WRAP: u32 = 1000;

/// Where a frame is in the draw path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawState {
    Uninitialized,
    Ready,
    DispatchedToBuffer,
    BarrierApplied,
    Drawn,
}

pub struct PointCircleRenderer<B: ComputeBackend> {
    ctx: ComputeContext<B>,
    compute: ProgramHandle,
    points: ProgramHandle,
    vertices: BufferHandle,
    groups: [u32; 3],
    draw_count: u32,
    frame: u32,
    state: DrawState,
}

impl<B: ComputeBackend> PointCircleRenderer<B> {
    /// Builds both programs and the vertex buffer.
    ///
    /// On failure every resource created so far is released before the
    /// error is returned.
    pub fn init<S: AssetSource>(
        backend: B,
        store: &BufferStore<S>,
        config: &DemoConfig,
    ) -> Result<Self, ComputeError> {
        let mut ctx = ComputeContext::new(backend, config.uniform_policy)?;
        let names = config.asset_names(ctx.backend().preferred_language());

        let compute =
            ctx.compile_compute(Kernel::PointCircle, &store.load_shader(&names.point_circle)?)?;
        let points = ctx.compile_points(
            &store.load_shader(&names.point_vertex)?,
            &store.load_shader(&names.point_fragment)?,
        )?;

        let (vertex_count, capacity) = config
            .circle
            .vertex_count()
            .zip(config.circle.byte_len())
            .ok_or(ComputeError::InvalidCapacity(usize::MAX))?;
        let draw_count = config.circle.draw_count.unwrap_or(vertex_count);
        if draw_count > vertex_count {
            return Err(ComputeError::DrawOutOfRange {
                count: draw_count,
                capacity,
            });
        }
        let vertices = ctx.create_storage_buffer(capacity, BufferUsage::Dynamic)?;
        ctx.upload(vertices, &vec![0; capacity])?;
        let [width, height] = config.viewport;
        ctx.set_viewport(width, height);

        let mut renderer = Self {
            ctx,
            compute,
            points,
            vertices,
            groups: config.circle.groups,
            draw_count,
            frame: 0,
            state: DrawState::Uninitialized,
        };
        renderer.advance(DrawState::Ready);
        tracing::info!("point circle: {vertex_count} vertices, drawing {draw_count} per frame");
        Ok(renderer)
    }

    #[must_use]
    pub fn state(&self) -> DrawState {
        self.state
    }

    /// Frame counter that will be used as the next radius.
    #[must_use]
    pub fn frame(&self) -> u32 {
        self.frame
    }

    #[must_use]
    pub fn context(&self) -> &ComputeContext<B> {
        &self.ctx
    }

    /// Reads back the vertex buffer as written by the last fenced dispatch.
    pub fn vertices(&mut self) -> Result<Vec<PointVertex>, ComputeError> {
        let bytes = self.ctx.read_back(self.vertices)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    fn advance(&mut self, next: DrawState) {
        tracing::trace!("point circle: {:?} -> {next:?}", self.state);
        self.state = next;
    }

    /// Dispatches the circle kernel for the current frame and advances the
    /// counter. The write is left unfenced; `render` fences and draws it.
    pub fn step(&mut self) -> Result<(), ComputeError> {
        #[allow(clippy::cast_precision_loss)]
        let radius = self.frame as f32;
        self.frame = (self.frame + 1) % FRAME_WRAP;

        let dispatched = self.dispatch(radius);
        self.ctx.unbind_all();
        dispatched?;
        self.advance(DrawState::DispatchedToBuffer);
        Ok(())
    }

    fn dispatch(&mut self, radius: f32) -> Result<(), ComputeError> {
        self.ctx.use_program(self.compute)?;
        self.ctx.set_uniform("radius", UniformValue::F32(radius))?;
        self.ctx.bind(POINT_OUT, self.vertices)?;
        let [x, y, z] = self.groups;
        self.ctx.dispatch(x, y, z)
    }

    fn draw_frame(&mut self) -> Result<(), ComputeError> {
        if self.state != DrawState::DispatchedToBuffer {
            self.step()?;
        }
        self.ctx.barrier();
        self.advance(DrawState::BarrierApplied);
        self.ctx.draw_points(self.points, self.vertices, self.draw_count)?;
        self.advance(DrawState::Drawn);
        Ok(())
    }
}

impl<B: ComputeBackend> Renderer for PointCircleRenderer<B> {
    fn name(&self) -> &'static str {
        "point circle"
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.ctx.set_viewport(width, height);
    }

    fn render(&mut self) -> FrameOutcome {
        let result = self.draw_frame();
        self.advance(DrawState::Ready);
        FrameOutcome::from_result(self.name(), result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CircleConfig;
    use ssbo_compute::{CpuBackend, MemoryAssets};

    const GLSL: &str = "#version 310 es\nvoid main() {}\n";

    fn assets() -> MemoryAssets {
        let mut assets = MemoryAssets::new();
        assets
            .insert("computer_shader.vs", GLSL)
            .insert("point_vertex.vs", GLSL)
            .insert("point_fragment.fs", GLSL);
        assets
    }

    #[test]
    fn frames_walk_the_state_machine() {
        let cpu = CpuBackend::new();
        let store = BufferStore::new(assets());
        let mut renderer =
            PointCircleRenderer::init(cpu.clone(), &store, &DemoConfig::default()).unwrap();
        assert_eq!(renderer.state(), DrawState::Ready);

        assert!(renderer.render().is_completed());
        assert_eq!(renderer.state(), DrawState::Ready);
        assert_eq!(renderer.frame(), 1);
        assert_eq!(cpu.stats().points_drawn, 256);

        renderer.step().unwrap();
        assert_eq!(renderer.state(), DrawState::DispatchedToBuffer);
        assert!(renderer.render().is_completed());
        // The pending dispatch was drawn instead of dispatching again.
        assert_eq!(renderer.frame(), 2);
        assert_eq!(cpu.stats().dispatches, 2);
    }

    #[test]
    fn radius_is_the_frame_counter() {
        let store = BufferStore::new(assets());
        let mut renderer =
            PointCircleRenderer::init(CpuBackend::new(), &store, &DemoConfig::default()).unwrap();
        for _ in 0..4 {
            renderer.render();
        }
        // Frame 3 was drawn with radius 3.
        let top = renderer.vertices().unwrap()[0];
        assert_eq!(top.position, [0.0, 3.0, 0.0, 1.0]);
    }

    #[test]
    fn counter_wraps() {
        let store = BufferStore::new(assets());
        let mut renderer =
            PointCircleRenderer::init(CpuBackend::new(), &store, &DemoConfig::default()).unwrap();
        renderer.frame = FRAME_WRAP - 1;
        renderer.step().unwrap();
        assert_eq!(renderer.frame(), 0);
    }

    #[test]
    fn draw_count_is_configurable() {
        let cpu = CpuBackend::new();
        let config = DemoConfig {
            circle: CircleConfig {
                draw_count: Some(16),
                ..CircleConfig::default()
            },
            ..DemoConfig::default()
        };
        let mut renderer =
            PointCircleRenderer::init(cpu.clone(), &BufferStore::new(assets()), &config).unwrap();
        renderer.render();
        assert_eq!(cpu.stats().points_drawn, 16);

        let too_many = DemoConfig {
            circle: CircleConfig {
                draw_count: Some(257),
                ..CircleConfig::default()
            },
            ..DemoConfig::default()
        };
        assert!(matches!(
            PointCircleRenderer::init(CpuBackend::new(), &BufferStore::new(assets()), &too_many),
            Err(ComputeError::DrawOutOfRange { count: 257, .. })
        ));
    }

    #[test]
    fn grid_too_large_for_a_vertex_buffer_fails_init() {
        for groups in [[65535, 65535, 1], [1024, 1024, 1]] {
            let cpu = CpuBackend::new();
            let config = DemoConfig {
                circle: CircleConfig {
                    groups,
                    ..CircleConfig::default()
                },
                ..DemoConfig::default()
            };
            assert!(matches!(
                PointCircleRenderer::init(cpu.clone(), &BufferStore::new(assets()), &config),
                Err(ComputeError::InvalidCapacity(_))
            ));
            assert_eq!((cpu.live_buffers(), cpu.live_programs()), (0, 0));
        }
    }

    #[test]
    fn a_failing_frame_is_skipped_and_the_next_one_recovers() {
        let cpu = CpuBackend::new();
        let config = DemoConfig {
            circle: CircleConfig {
                groups: [2, 2, 0],
                ..CircleConfig::default()
            },
            ..DemoConfig::default()
        };
        let mut renderer =
            PointCircleRenderer::init(cpu.clone(), &BufferStore::new(assets()), &config).unwrap();
        let outcome = renderer.render();
        assert_eq!(
            outcome,
            FrameOutcome::Skipped {
                error: ComputeError::InvalidDispatchSize([2, 2, 0])
            }
        );
        assert_eq!(renderer.state(), DrawState::Ready);
        assert_eq!(cpu.stats().draws, 0);

        renderer.groups = [2, 2, 1];
        assert!(renderer.render().is_completed());
    }
}

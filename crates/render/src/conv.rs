//! Grouped 3x3 convolution demo.
//!
//! The luminance image is replicated into one plane per channel, then each
//! configured weight layer is applied in turn. The first layer reads the
//! input planes and later layers ping-pong between two scratch buffers, so
//! every frame starts again from the same input.

use ssbo_compute::layout::{groups_for, LOCAL_SIZE, STORAGE_IN, STORAGE_OUT, STORAGE_WEIGHTS};
use ssbo_compute::{
    inspect, oracle, AssetSource, BufferHandle, BufferStore, BufferUsage, ComputeBackend,
    ComputeContext, ComputeError, DispatchDescriptor, Kernel, ProgramHandle, UniformValue,
};

use crate::{ConvConfig, DemoConfig, FrameOutcome, Renderer};

pub struct ConvRenderer<B: ComputeBackend> {
    ctx: ComputeContext<B>,
    program: ProgramHandle,
    input: BufferHandle,
    scratch: [BufferHandle; 2],
    layers: Vec<BufferHandle>,
    channels: u32,
    config: ConvConfig,
    expected: Option<Vec<f32>>,
    output: Vec<f32>,
    max_error: Option<f32>,
}

impl<B: ComputeBackend> ConvRenderer<B> {
    pub fn init<S: AssetSource>(
        backend: B,
        store: &BufferStore<S>,
        config: &DemoConfig,
    ) -> Result<Self, ComputeError> {
        let conv = config.conv.clone();
        if conv.layers.is_empty() {
            return Err(ComputeError::ShapeMismatch("at least one weight layer is required"));
        }
        let (width, height) = (conv.width as usize, conv.height as usize);

        let mut ctx = ComputeContext::new(backend, config.uniform_policy)?;
        let names = config.asset_names(ctx.backend().preferred_language());
        let program =
            ctx.compile_compute(Kernel::GroupConv3x3, &store.load_shader(&names.group_conv)?)?;

        let weights = conv
            .layers
            .iter()
            .map(|name| store.load(name))
            .collect::<Result<Vec<_>, _>>()?;
        let channels = oracle::channels_in(weights[0].len())?;
        for layer in &weights[1..] {
            if oracle::channels_in(layer.len())? != channels {
                return Err(ComputeError::ShapeMismatch(
                    "every layer must have the same channel count",
                ));
            }
        }

        let image = store.load(&names.image)?;
        if image.len() != width * height {
            return Err(ComputeError::ShapeMismatch(
                "image length does not match width * height",
            ));
        }
        let planes = image.replicate_channels(channels)?;
        store.release(image);

        let input = ctx.create_storage_buffer_with(planes.as_bytes(), BufferUsage::Static)?;
        let zeros = vec![0; planes.byte_len()];
        let scratch = [
            ctx.create_storage_buffer_with(&zeros, BufferUsage::Dynamic)?,
            ctx.create_storage_buffer_with(&zeros, BufferUsage::Dynamic)?,
        ];
        let layers = weights
            .iter()
            .map(|w| ctx.create_storage_buffer_with(w.as_bytes(), BufferUsage::Static))
            .collect::<Result<Vec<_>, _>>()?;

        let expected = if conv.verify {
            let mut planes = planes.into_vec();
            for w in &weights {
                planes = oracle::convolve_channels(&planes, width, height, w.as_f32())?;
            }
            Some(planes)
        } else {
            None
        };
        for w in weights {
            store.release(w);
        }

        tracing::info!(
            "conv: {}x{} image, {channels} channels, {} layers",
            conv.width,
            conv.height,
            layers.len()
        );
        Ok(Self {
            ctx,
            program,
            input,
            scratch,
            layers,
            channels: u32::try_from(channels)
                .map_err(|_| ComputeError::ShapeMismatch("too many channels"))?,
            config: conv,
            expected,
            output: Vec::new(),
            max_error: None,
        })
    }

    #[must_use]
    pub fn channels(&self) -> u32 {
        self.channels
    }

    /// Final planes of the last completed frame, channel-major.
    #[must_use]
    pub fn output(&self) -> &[f32] {
        &self.output
    }

    /// Largest absolute difference from the CPU reference seen in the last
    /// verified frame.
    #[must_use]
    pub fn max_error(&self) -> Option<f32> {
        self.max_error
    }

    #[must_use]
    pub fn context(&self) -> &ComputeContext<B> {
        &self.ctx
    }

    /// Runs every layer and returns the buffer holding the final planes.
    fn run_layers(&mut self) -> Result<BufferHandle, ComputeError> {
        let uniforms = [
            ("width", UniformValue::U32(self.config.width)),
            ("height", UniformValue::U32(self.config.height)),
            ("channels", UniformValue::U32(self.channels)),
        ];
        let groups = [
            groups_for(self.config.width, LOCAL_SIZE[0]),
            groups_for(self.config.height, LOCAL_SIZE[1]),
            self.channels,
        ];

        let mut src = self.input;
        for (i, &weights) in self.layers.iter().enumerate() {
            let dst = self.scratch[i % 2];
            self.ctx.run(&DispatchDescriptor {
                program: self.program,
                groups,
                uniforms: &uniforms,
                bindings: &[(STORAGE_IN, src), (STORAGE_WEIGHTS, weights), (STORAGE_OUT, dst)],
            })?;
            src = dst;
        }
        Ok(src)
    }

    fn frame(&mut self) -> Result<(), ComputeError> {
        let result = self.run_layers()?;
        let bytes = self.ctx.read_back(result)?;
        inspect::log_grid::<f32>(
            "conv",
            &bytes,
            self.config.log_width,
            self.config.log_rows,
            0,
        );
        self.output = bytemuck::pod_collect_to_vec(&bytes);

        if let Some(expected) = &self.expected {
            let err = self
                .output
                .iter()
                .zip(expected)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0f32, f32::max);
            if err > self.config.tolerance {
                tracing::warn!(
                    "conv: output differs from the reference by {err} (tolerance {})",
                    self.config.tolerance
                );
            } else {
                tracing::debug!("conv: max error {err}");
            }
            self.max_error = Some(err);
        }
        Ok(())
    }
}

impl<B: ComputeBackend> Renderer for ConvRenderer<B> {
    fn name(&self) -> &'static str {
        "conv"
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.ctx.set_viewport(width, height);
    }

    fn render(&mut self) -> FrameOutcome {
        let result = self.frame();
        FrameOutcome::from_result(self.name(), result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssbo_compute::{CpuBackend, MemoryAssets};

    const IDENTITY: [f32; 10] = [0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0];
    const BOX: [f32; 10] = [0.1, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1, 0.05];

    fn config(layers: &[&str]) -> DemoConfig {
        DemoConfig {
            conv: ConvConfig {
                layers: layers.iter().map(|s| (*s).to_string()).collect(),
                width: 4,
                height: 3,
                ..ConvConfig::default()
            },
            ..DemoConfig::default()
        }
    }

    fn assets() -> MemoryAssets {
        let image: Vec<f32> = (0..12).map(|i| i as f32 / 12.0).collect();
        let mut two = BOX.to_vec();
        two.extend_from_slice(&IDENTITY);
        let mut three = IDENTITY.to_vec();
        three.extend_from_slice(&BOX);
        three.extend_from_slice(&IDENTITY);

        let mut assets = MemoryAssets::new();
        assets
            .insert("conv1_group.vs", "#version 310 es\nvoid main() {}\n")
            .insert_f32("img_y.bin", &image)
            .insert_f32("two_a.bin", &two)
            .insert_f32("two_b.bin", &two)
            .insert_f32("three.bin", &three);
        assets
    }

    #[test]
    fn layers_chain_and_match_the_reference() {
        let store = BufferStore::new(assets());
        let layers = config(&["two_a.bin", "two_b.bin", "two_a.bin"]);
        let mut conv = ConvRenderer::init(CpuBackend::new(), &store, &layers).unwrap();
        assert_eq!(conv.channels(), 2);

        assert!(conv.render().is_completed());
        assert_eq!(conv.output().len(), 24);
        assert!(conv.max_error().unwrap() < 1e-5);

        // Every frame restarts from the input.
        let first = conv.output().to_vec();
        assert!(conv.render().is_completed());
        assert_eq!(conv.output(), &first[..]);
    }

    #[test]
    fn identity_channel_is_tanh_of_the_input() {
        let store = BufferStore::new(assets());
        let mut conv =
            ConvRenderer::init(CpuBackend::new(), &store, &config(&["two_a.bin"])).unwrap();
        assert!(conv.render().is_completed());
        let second = &conv.output()[12..];
        for (i, v) in second.iter().enumerate() {
            assert!((v - (i as f32 / 12.0).tanh()).abs() < 1e-6);
        }
    }

    #[test]
    fn layers_must_agree_on_channels() {
        let cpu = CpuBackend::new();
        let store = BufferStore::new(assets());
        let err = ConvRenderer::init(cpu.clone(), &store, &config(&["two_a.bin", "three.bin"]))
            .err()
            .unwrap();
        assert!(matches!(err, ComputeError::ShapeMismatch(_)));
        assert_eq!((cpu.live_buffers(), cpu.live_programs()), (0, 0));
    }

    #[test]
    fn image_must_match_the_configured_size() {
        let cpu = CpuBackend::new();
        let mut demo = config(&["two_a.bin"]);
        demo.conv.width = 5;
        let err = ConvRenderer::init(cpu.clone(), &BufferStore::new(assets()), &demo)
            .err()
            .unwrap();
        assert!(matches!(err, ComputeError::ShapeMismatch(_)));
        assert_eq!((cpu.live_buffers(), cpu.live_programs()), (0, 0));
    }

    #[test]
    fn verification_can_be_turned_off() {
        let mut demo = config(&["two_a.bin"]);
        demo.conv.verify = false;
        let mut conv = ConvRenderer::init(CpuBackend::new(), &BufferStore::new(assets()), &demo)
            .unwrap();
        assert!(conv.render().is_completed());
        assert_eq!(conv.max_error(), None);
    }

    #[test]
    fn dropping_releases_every_buffer() {
        let cpu = CpuBackend::new();
        let conv = ConvRenderer::init(
            cpu.clone(),
            &BufferStore::new(assets()),
            &config(&["two_a.bin", "two_b.bin"]),
        )
        .unwrap();
        // input, two scratch planes, two weight layers
        assert_eq!(cpu.live_buffers(), 5);
        drop(conv);
        assert_eq!((cpu.live_buffers(), cpu.live_programs()), (0, 0));
    }
}

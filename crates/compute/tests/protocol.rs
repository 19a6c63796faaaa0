//! End-to-end runs of the storage-buffer protocol on the software device,
//! using the shipped assets.

use std::path::Path;

use ssbo_compute::layout::{groups_for, LOCAL_SIZE};
use ssbo_compute::{
    inspect, oracle, BufferStore, BufferUsage, ComputeContext, ComputeError, CpuBackend,
    DeviceLimits, DirAssets, DispatchDescriptor, InvocationRecord, Kernel, MemoryAssets,
    PointVertex, UniformPolicy, UniformValue,
};

fn store() -> BufferStore<DirAssets> {
    BufferStore::new(DirAssets::new(
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../assets"),
    ))
}

fn context() -> (CpuBackend, ComputeContext<CpuBackend>) {
    let cpu = CpuBackend::new();
    let ctx = ComputeContext::new(cpu.clone(), UniformPolicy::Strict).unwrap();
    (cpu, ctx)
}

#[test]
fn shipped_image_and_weights_have_the_documented_shapes() {
    let store = store();
    assert_eq!(store.load("img_y.bin").unwrap().len(), 160 * 240);
    assert_eq!(store.load("model_param.bin").unwrap().len(), 10);
    for layer in ["model_param_conv1.bin", "model_param_conv3.bin"] {
        let weights = store.load(layer).unwrap();
        assert_eq!(oracle::channels_in(weights.len()).unwrap(), 4, "{layer}");
    }
}

#[test]
fn circle_records_match_the_closed_form() {
    let store = store();
    let (_, mut ctx) = context();
    let program = ctx
        .compile_compute(Kernel::PointCircle, &store.load_shader("computer_shader.vs").unwrap())
        .unwrap();
    let vertices = ctx
        .create_storage_buffer_with(&vec![0; 256 * 32], BufferUsage::Dynamic)
        .unwrap();

    ctx.run(&DispatchDescriptor {
        program,
        groups: [2, 2, 1],
        uniforms: &[("radius", UniformValue::F32(10.0))],
        bindings: &[(0, vertices)],
    })
    .unwrap();

    let bytes = ctx.read_back(vertices).unwrap();
    let points: Vec<PointVertex> = bytemuck::pod_collect_to_vec(&bytes);
    for (offset, p) in points.iter().enumerate() {
        let alpha = 2.0 * std::f32::consts::PI * (offset as f32 / 256.0);
        assert!((p.position[0] - alpha.sin() * 10.0).abs() < 1e-4);
        assert!((p.position[1] - alpha.cos() * 10.0).abs() < 1e-4);
        assert_eq!(p.color[0], (offset % 16) as f32 / 16.0);
    }
}

#[test]
fn two_layer_convolution_matches_the_oracle() {
    let store = store();
    let (_, mut ctx) = context();
    let program = ctx
        .compile_compute(Kernel::GroupConv3x3, &store.load_shader("conv1_group.vs").unwrap())
        .unwrap();

    let image = store.load("img_y.bin").unwrap();
    let layers = [
        store.load("model_param_conv1.bin").unwrap(),
        store.load("model_param_conv3.bin").unwrap(),
    ];
    let channels = oracle::channels_in(layers[0].len()).unwrap();
    let planes = image.replicate_channels(channels).unwrap();
    store.release(image);

    let ping = ctx
        .create_storage_buffer_with(planes.as_bytes(), BufferUsage::Dynamic)
        .unwrap();
    let pong = ctx
        .create_storage_buffer_with(&vec![0; planes.byte_len()], BufferUsage::Dynamic)
        .unwrap();
    let uniforms = [
        ("width", UniformValue::U32(160)),
        ("height", UniformValue::U32(240)),
        ("channels", UniformValue::U32(channels as u32)),
    ];
    let groups = [
        groups_for(160, LOCAL_SIZE[0]),
        groups_for(240, LOCAL_SIZE[1]),
        channels as u32,
    ];

    let (mut src, mut dst) = (ping, pong);
    let mut expected = planes.as_f32().to_vec();
    for layer in &layers {
        let weights = ctx
            .create_storage_buffer_with(layer.as_bytes(), BufferUsage::Static)
            .unwrap();
        ctx.run(&DispatchDescriptor {
            program,
            groups,
            uniforms: &uniforms,
            bindings: &[(0, src), (1, weights), (2, dst)],
        })
        .unwrap();
        expected = oracle::convolve_channels(&expected, 160, 240, layer.as_f32()).unwrap();
        std::mem::swap(&mut src, &mut dst);
    }

    let got: Vec<f32> = bytemuck::pod_collect_to_vec(&ctx.read_back(src).unwrap());
    let max_err = got
        .iter()
        .zip(&expected)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    assert!(max_err < 1e-5, "max abs error {max_err}");
}

#[test]
fn a_dispatch_reading_unfenced_output_is_rejected() {
    let (_, mut ctx) = context();
    let source = store().load_shader("conv1_group.vs").unwrap();
    let program = ctx.compile_compute(Kernel::GroupConv3x3, &source).unwrap();
    let a = ctx.create_storage_buffer_with(&[0; 16], BufferUsage::Dynamic).unwrap();
    let w = ctx.create_storage_buffer_with(&[0; 40], BufferUsage::Static).unwrap();
    let b = ctx.create_storage_buffer_with(&[0; 16], BufferUsage::Dynamic).unwrap();

    ctx.use_program(program).unwrap();
    for (name, v) in [("width", 2), ("height", 2), ("channels", 1)] {
        ctx.set_uniform(name, UniformValue::U32(v)).unwrap();
    }
    ctx.bind(0, a).unwrap();
    ctx.bind(1, w).unwrap();
    ctx.bind(2, b).unwrap();
    ctx.dispatch(1, 1, 1).unwrap();

    // b becomes the input of the next layer without a barrier in between.
    ctx.bind(0, b).unwrap();
    ctx.bind(2, a).unwrap();
    assert_eq!(ctx.dispatch(1, 1, 1), Err(ComputeError::MissingBarrier(b)));
    ctx.barrier();
    assert!(ctx.dispatch(1, 1, 1).is_ok());
}

#[test]
fn a_grid_of_billions_into_a_small_buffer_fills_only_the_buffer() {
    let (_, mut ctx) = context();
    let source = store().load_shader("computer_shader.vs").unwrap();
    let program = ctx.compile_compute(Kernel::PointCircle, &source).unwrap();
    let vertices = ctx
        .create_storage_buffer_with(&[0; 16 * 32], BufferUsage::Dynamic)
        .unwrap();

    ctx.run(&DispatchDescriptor {
        program,
        groups: [8192, 8192, 1],
        uniforms: &[("radius", UniformValue::F32(5.0))],
        bindings: &[(0, vertices)],
    })
    .unwrap();

    let points: Vec<PointVertex> = bytemuck::pod_collect_to_vec(&ctx.read_back(vertices).unwrap());
    assert_eq!(points.len(), 16);
    assert_eq!(points[0].position, [0.0, 5.0, 0.0, 1.0]);
    assert!(points
        .iter()
        .all(|p| p.position.iter().chain(&p.color).all(|v| v.is_finite())));
}

#[test]
fn conv_extent_that_overflows_is_a_shape_error() {
    let (_, mut ctx) = context();
    let source = store().load_shader("conv1_group.vs").unwrap();
    let program = ctx.compile_compute(Kernel::GroupConv3x3, &source).unwrap();
    let input = ctx.create_storage_buffer_with(&[0; 32], BufferUsage::Static).unwrap();
    let weights = ctx.create_storage_buffer_with(&[0; 80], BufferUsage::Static).unwrap();
    let output = ctx.create_storage_buffer_with(&[0; 32], BufferUsage::Dynamic).unwrap();

    let err = ctx
        .run(&DispatchDescriptor {
            program,
            groups: [1, 1, 2],
            uniforms: &[
                ("width", UniformValue::U32(u32::MAX)),
                ("height", UniformValue::U32(u32::MAX)),
                ("channels", UniformValue::U32(2)),
            ],
            bindings: &[(0, input), (1, weights), (2, output)],
        })
        .unwrap_err();
    assert!(matches!(err, ComputeError::ShapeMismatch(_)));
    assert_eq!(ctx.binding(0), None);
}

#[test]
fn probe_records_and_grid_formatting() {
    let (_, mut ctx) = context();
    let source = store().load_shader("invocation_probe.vs").unwrap();
    let program = ctx.compile_compute(Kernel::InvocationProbe, &source).unwrap();
    let records = ctx
        .create_storage_buffer_with(&vec![0; 256 * 32], BufferUsage::Dynamic)
        .unwrap();
    ctx.run(&DispatchDescriptor {
        program,
        groups: [4, 4, 1],
        uniforms: &[],
        bindings: &[(0, records)],
    })
    .unwrap();

    let mapping = ctx.map_for_read(records, 0, 256 * 32).unwrap();
    let bytes = ctx.mapped_bytes(&mapping).unwrap();
    let all: Vec<InvocationRecord> = bytemuck::pod_collect_to_vec(bytes);
    // 32-wide grid, so record 40 is row 1, column 8.
    assert_eq!(all[40].global, [8, 1]);
    assert_eq!(all[40].group, [1, 0]);
    assert_eq!(all[40].num_groups, [4, 4]);

    let rows = inspect::format_grid::<i32>(bytes, 8, 2, 0);
    assert_eq!(rows.len(), 2);
    assert!(rows[0].split_whitespace().eq(["0", "0", "0", "0", "0", "0", "4", "4"]));
    ctx.unmap(mapping).unwrap();

    let rows = ctx.read_grid::<i32>(records, 8, 1, 8).unwrap();
    assert!(rows[0].split_whitespace().eq(["1", "0", "0", "0", "1", "0", "4", "4"]));
}

#[test]
fn dispatch_limits_come_from_the_device() {
    let limits = DeviceLimits {
        max_work_group_count: [4, 4, 1],
        ..DeviceLimits::default()
    };
    let mut ctx = ComputeContext::new(CpuBackend::with_limits(limits), UniformPolicy::Strict).unwrap();
    assert_eq!(ctx.limits().max_work_group_count, [4, 4, 1]);
    let source = store().load_shader("invocation_probe.vs").unwrap();
    let program = ctx.compile_compute(Kernel::InvocationProbe, &source).unwrap();
    ctx.use_program(program).unwrap();
    assert_eq!(
        ctx.dispatch(5, 1, 1),
        Err(ComputeError::InvalidDispatchSize([5, 1, 1]))
    );
    assert_eq!(
        ctx.dispatch(1, 1, 2),
        Err(ComputeError::InvalidDispatchSize([1, 1, 2]))
    );
}

#[test]
fn truncated_and_misaligned_assets_are_rejected() {
    let mut assets = MemoryAssets::new();
    assets
        .insert_truncated("img_y.bin", vec![0u8; 100], 153_600)
        .insert("model_param.bin", vec![0u8; 38]);
    let store = BufferStore::new(assets);
    assert!(matches!(
        store.load("img_y.bin"),
        Err(ComputeError::ResourceTruncated { actual: 100, .. })
    ));
    assert!(matches!(
        store.load("model_param.bin"),
        Err(ComputeError::ResourceMisaligned { len: 38, .. })
    ));
    assert_eq!(
        store.load("model_param_conv1.bin"),
        Err(ComputeError::ResourceNotFound("model_param_conv1.bin".into()))
    );
}

#[test]
fn drawing_needs_a_points_program_and_a_fenced_buffer() {
    let store = store();
    let (cpu, mut ctx) = context();
    ctx.set_viewport(64, 64);
    let compute = ctx
        .compile_compute(Kernel::PointCircle, &store.load_shader("computer_shader.vs").unwrap())
        .unwrap();
    let points = ctx
        .compile_points(
            &store.load_shader("point_vertex.vs").unwrap(),
            &store.load_shader("point_fragment.fs").unwrap(),
        )
        .unwrap();
    let vertices = ctx
        .create_storage_buffer_with(&vec![0; 256 * 32], BufferUsage::Dynamic)
        .unwrap();

    ctx.use_program(compute).unwrap();
    ctx.set_uniform("radius", UniformValue::F32(0.5)).unwrap();
    ctx.bind(0, vertices).unwrap();
    ctx.dispatch(2, 2, 1).unwrap();
    ctx.unbind_all();

    assert_eq!(
        ctx.draw_points(points, vertices, 256),
        Err(ComputeError::MissingBarrier(vertices))
    );
    ctx.barrier();
    assert_eq!(
        ctx.draw_points(compute, vertices, 256),
        Err(ComputeError::InvalidProgram(compute))
    );
    assert!(matches!(
        ctx.draw_points(points, vertices, 257),
        Err(ComputeError::DrawOutOfRange { count: 257, .. })
    ));
    ctx.draw_points(points, vertices, 16).unwrap();

    assert_eq!(cpu.stats().points_drawn, 16);
    let lit = cpu.framebuffer().iter().filter(|px| px[3] > 0.0).count();
    assert!(lit > 0 && lit <= 16);
}

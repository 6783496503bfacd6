//! Reduction dispatch: pass selection, geometry and arguments

mod common;

use std::sync::Arc;
use std::thread;

use common::{runtime_on, sim_device_with_multiprocessors};
use tensorforge::backend::{KernelArg, LaunchConfig, SimDriver};
use tensorforge::ops::{plan_reduce, TWO_PASS_THRESHOLD};
use tensorforge::tensor::TensorLayout;
use tensorforge::{DType, ForgeError, InitPolicy};

#[test]
fn test_small_input_single_launch() {
    let sim = sim_device_with_multiprocessors(16);
    let runtime = runtime_on(&sim, vec![0]);
    let input = runtime.empty(0, DType::F32, &[32, 64]).unwrap();
    assert_eq!(input.numel(), TWO_PASS_THRESHOLD);

    let out = runtime.reduce("sum_all", &input, 0.0, InitPolicy::Given).unwrap();
    assert_eq!(out.rank(), 0);
    assert_eq!(out.numel(), 1);
    assert_eq!(out.dtype(), DType::F32);

    let launches = sim.launches();
    assert_eq!(launches.len(), 1);
    let single = &launches[0];
    assert_eq!(single.function, "sum_all_single_f32_u32_c");
    assert_eq!(single.config, LaunchConfig::linear(1, 1024, 4096));
    assert_eq!(single.args[0], KernelArg::Ptr(out.storage().ptr()));
    assert_eq!(single.args[1], KernelArg::Ptr(input.storage().ptr()));
    assert_eq!(single.args[3], KernelArg::U32(2048));
    assert_eq!(single.args[4], KernelArg::F32(0.0));
}

#[test]
fn test_large_input_two_passes() {
    let sim = sim_device_with_multiprocessors(16);
    let runtime = runtime_on(&sim, vec![0]);
    let input = runtime.empty(0, DType::F32, &[4096]).unwrap();

    runtime.reduce("sum_all", &input, 1.5, InitPolicy::Given).unwrap();

    let launches = sim.launches();
    assert_eq!(launches.len(), 2);
    let (pass_a, pass_b) = (&launches[0], &launches[1]);
    assert_eq!(pass_a.function, "sum_all_pass1_f32_u32_c");
    assert_eq!(pass_b.function, "sum_all_pass2_f32_u32_c");

    // min(ceil(4096 / 1024), 16 scratch slots, 4 x 16)
    assert_eq!(pass_a.config, LaunchConfig::linear(4, 1024, 4096));
    assert_eq!(pass_b.config, LaunchConfig::linear(1, 4, 16));

    let scratch = runtime.contexts().scratch_for(0).unwrap();
    assert_eq!(pass_a.args[0], KernelArg::Ptr(scratch.ptr));
    assert_eq!(pass_b.args[1], KernelArg::Ptr(scratch.ptr));
    assert_eq!(pass_b.args[2], KernelArg::U32(4));
    assert_eq!(pass_a.args[4], KernelArg::F32(1.5));
    assert_eq!(pass_b.args[3], KernelArg::F32(1.5));
}

#[test]
fn test_pass_b_block_matches_pass_a_grid() {
    for (multiprocessors, elements) in [(1, 5000), (2, 1 << 16), (8, 3000), (64, 1 << 20)] {
        let sim = sim_device_with_multiprocessors(multiprocessors);
        let runtime = runtime_on(&sim, vec![0]);
        let input = runtime.empty(0, DType::F32, &[elements]).unwrap();
        runtime.reduce("max_all", &input, 0.0, InitPolicy::MinValue).unwrap();

        let launches = sim.launches();
        assert_eq!(launches.len(), 2);
        let grid = launches[0].config.grid_dim.0;
        assert!(grid >= 1);
        assert!(grid as usize <= 4 * multiprocessors as usize);
        assert_eq!(launches[1].config.block_dim.0, grid);
        assert_eq!(launches[1].config.grid_dim.0, 1);
        assert_eq!(launches[1].args[2], KernelArg::U32(grid));
        assert_eq!(launches[1].args[3], KernelArg::F32(f32::MIN));
    }
}

#[test]
fn test_concurrent_two_pass_reductions_keep_passes_paired() {
    let sim = sim_device_with_multiprocessors(16);
    let runtime = runtime_on(&sim, vec![0]);
    let inputs: Vec<_> = (0..8)
        .map(|_| runtime.empty(0, DType::F32, &[8192]).unwrap())
        .collect();

    thread::scope(|scope| {
        for input in &inputs {
            let runtime = &runtime;
            scope.spawn(move || {
                for _ in 0..100 {
                    runtime.reduce("sum_all", input, 0.0, InitPolicy::Given).unwrap();
                }
            });
        }
    });

    let launches = sim.launches();
    assert_eq!(launches.len(), 8 * 100 * 2);
    for pair in launches.chunks(2) {
        assert!(pair[0].function.contains("_pass1_"), "{}", pair[0].function);
        assert!(pair[1].function.contains("_pass2_"), "{}", pair[1].function);
        // Pass B reads the partials pass A just wrote
        assert_eq!(pair[0].args[0], pair[1].args[1]);
    }
}

#[test]
fn test_rank_zero_input_returned_without_launch() {
    let sim = sim_device_with_multiprocessors(16);
    let runtime = runtime_on(&sim, vec![0]);
    let scalar = runtime.empty(0, DType::I32, &[]).unwrap();

    let out = runtime.reduce("min_all", &scalar, 0.0, InitPolicy::MaxValue).unwrap();
    assert!(out.shares_storage(&scalar));
    assert!(sim.launches().is_empty());
    // Nothing was compiled either
    assert_eq!(sim.counters().compilations, 0);
}

#[test]
fn test_missing_scratch_only_fails_two_pass() {
    let sim = sim_device_with_multiprocessors(0);
    let runtime = runtime_on(&sim, vec![0]);
    assert!(runtime.contexts().scratch_for(0).unwrap().is_empty());

    let small = runtime.empty(0, DType::F32, &[100]).unwrap();
    runtime.reduce("sum_all", &small, 0.0, InitPolicy::Given).unwrap();

    let large = runtime.empty(0, DType::F32, &[4096]).unwrap();
    let err = runtime
        .reduce("sum_all", &large, 0.0, InitPolicy::Given)
        .unwrap_err();
    assert!(matches!(err, ForgeError::ScratchUnavailable { device: 0 }));
    assert_eq!(sim.launches().len(), 1);
}

#[test]
fn test_strided_input_uses_generic_variant() {
    let sim = sim_device_with_multiprocessors(16);
    let runtime = runtime_on(&sim, vec![0]);
    let base = runtime.empty(0, DType::F32, &[64, 32]).unwrap();
    let transposed = base.transpose(0, 1).unwrap();
    assert!(!transposed.is_contiguous());

    runtime.reduce("sum_all", &transposed, 0.0, InitPolicy::Given).unwrap();
    let launches = sim.launches();
    assert_eq!(launches[0].function, "sum_all_single_f32_u32_g");
    // Storage base is passed; the info carries the view
    assert_eq!(launches[0].args[1], KernelArg::Ptr(base.storage().ptr()));
    let info = transposed.layout().encode_info(tensorforge::kernels::IndexWidth::U32).unwrap();
    assert_eq!(launches[0].args[2], KernelArg::Bytes(info));
}

#[test]
fn test_narrowed_view_passes_offset_in_info() {
    let sim = sim_device_with_multiprocessors(16);
    let runtime = runtime_on(&sim, vec![0]);
    let base = runtime.empty(0, DType::F32, &[10, 10]).unwrap();
    let rows = base.narrow(0, 3, 4).unwrap();
    // Whole rows stay contiguous
    assert!(rows.is_contiguous());

    runtime.reduce("sum_all", &rows, 0.0, InitPolicy::Given).unwrap();
    let launch = &sim.launches()[0];
    assert_eq!(launch.function, "sum_all_single_f32_u32_c");
    assert_eq!(launch.args[3], KernelArg::U32(40));
    match &launch.args[2] {
        KernelArg::Bytes(info) => assert_eq!(&info[..4], &30u32.to_le_bytes()),
        other => panic!("expected encoded info, got {:?}", other),
    }
}

#[test]
fn test_huge_input_switches_to_64_bit_indexing() {
    let sim = Arc::new(SimDriver::uniform(1, 32 << 30));
    let runtime = runtime_on(&sim, vec![0]);
    let elements = 1usize << 31;
    let input = runtime.empty(0, DType::F32, &[2, elements / 2]).unwrap();

    runtime.reduce("sum_all", &input, 0.0, InitPolicy::Given).unwrap();
    let launches = sim.launches();
    assert_eq!(launches.len(), 2);
    assert_eq!(launches[0].function, "sum_all_pass1_f32_u64_c");
    assert_eq!(launches[0].args[3], KernelArg::U64(elements as u64));
    // 64 scratch bytes hold 16 f32 partials
    assert_eq!(launches[0].config.grid_dim.0, 16);
    assert_eq!(launches[1].args[2], KernelArg::U64(16));
}

#[test]
fn test_kernel_reuse_across_calls() {
    let sim = sim_device_with_multiprocessors(16);
    let runtime = runtime_on(&sim, vec![0]);
    let a = runtime.empty(0, DType::F32, &[100]).unwrap();
    let b = runtime.empty(0, DType::F32, &[5000]).unwrap();
    let c = runtime.empty(0, DType::I32, &[7]).unwrap();

    for t in [&a, &b, &c, &a] {
        runtime.reduce("sum_all", t, 0.0, InitPolicy::Given).unwrap();
    }
    let counters = sim.counters();
    // One binary for every contiguous 32-bit input, whatever the dtype
    assert_eq!(counters.compilations, 1);
    assert_eq!(counters.module_loads, 1);
    assert_eq!(runtime.contexts().kernel_cache().len(), 4);
}

#[test]
fn test_reduce_template_mismatch() {
    let sim = sim_device_with_multiprocessors(16);
    let runtime = runtime_on(&sim, vec![0]);
    let t = runtime.empty(0, DType::F32, &[16]).unwrap();
    let kernel = runtime.specialize_and_compile("fill", &[&t]).unwrap();
    let err = runtime
        .launch_reduce(&kernel, &t, 0.0, InitPolicy::Given)
        .unwrap_err();
    assert!(matches!(err, ForgeError::InvalidConfiguration(_)));

    let other = runtime.empty(0, DType::F32, &[4, 4]).unwrap();
    let kernel = runtime.specialize_and_compile("sum_all", &[&other]).unwrap();
    let strided = other.transpose(0, 1).unwrap();
    assert!(matches!(
        runtime.launch_reduce(&kernel, &strided, 0.0, InitPolicy::Given),
        Err(ForgeError::InvalidTensor(_))
    ));
}

#[test]
fn test_plan_matches_dispatch() {
    let plan = plan_reduce(4096, 4, 64, 16, 0).unwrap();
    assert!(plan.is_two_pass());
    assert_eq!(plan.partials(), 4);
    let from_layout = TensorLayout::contiguous(&[4096]).numel();
    assert_eq!(plan.elements, from_layout);

    // An f64 partial does not fit one multiprocessor's scratch
    assert!(matches!(
        plan_reduce(4096, 8, 4, 1, 0),
        Err(ForgeError::ScratchUnavailable { .. })
    ));
}

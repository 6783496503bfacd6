//! End-to-end runtime calls over simulated devices

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{assert_no_leak, runtime_on, sim_machine, single_device_runtime};
use tensorforge::backend::{KernelArg, LaunchConfig};
use tensorforge::memory::ALLOCATION_ALIGNMENT;
use tensorforge::{DType, DeviceMemory, ForgeError, RuntimeConfig, TensorRuntime};

#[test]
fn test_allocate_and_free() {
    let (_sim, runtime) = single_device_runtime();
    let allocator = runtime.contexts().allocator_for(0).unwrap();
    let baseline = allocator.live_bytes();
    // The reduction scratch is already live
    assert_eq!(baseline, ALLOCATION_ALIGNMENT);

    let block = runtime.allocate(0, 1000).unwrap();
    assert_eq!(block.size(), 1000);
    assert_eq!(block.device(), 0);
    assert_eq!(allocator.live_bytes(), baseline + 1024);

    runtime.free(block).unwrap();
    assert_eq!(allocator.live_bytes(), baseline);
    assert!(matches!(runtime.allocate(3, 16), Err(ForgeError::UnknownDevice(3))));
}

#[test]
fn test_allocate_with_cleanup_releases_cache() {
    let (_sim, runtime) = single_device_runtime();
    let capacity = runtime.contexts().allocator_for(0).unwrap().capacity();
    let hog = runtime.allocate(0, capacity - ALLOCATION_ALIGNMENT).unwrap();
    assert!(runtime.allocate(0, 4096).unwrap_err().is_out_of_memory());

    let mut cached = Some(hog);
    let block = runtime
        .allocate_with_cleanup(0, 4096, || {
            cached.take();
        })
        .unwrap();
    assert_eq!(block.size(), 4096);
    assert!(cached.is_none());
}

#[test]
fn test_empty_tensors() {
    let (_sim, runtime) = single_device_runtime();
    let t = runtime.empty(0, DType::F64, &[3, 4, 5]).unwrap();
    assert_eq!(t.sizes(), &[3, 4, 5]);
    assert_eq!(t.layout().strides(), &[20, 5, 1]);
    assert!(t.is_contiguous());
    assert_eq!(t.storage().size(), 60 * 8);

    let none = runtime.empty(0, DType::I32, &[0, 7]).unwrap();
    assert_eq!(none.numel(), 0);
}

#[test]
fn test_fill_launch() {
    let (sim, runtime) = single_device_runtime();
    let t = runtime.empty(0, DType::F32, &[1000]).unwrap();
    runtime.apply("fill", &[&t], &[2.5]).unwrap();

    let launches = sim.launches();
    assert_eq!(launches.len(), 1);
    let fill = &launches[0];
    assert_eq!(fill.function, "fill_f32_u32_c");
    assert_eq!(fill.config, LaunchConfig::linear(4, 256, 0));
    assert_eq!(fill.args.len(), 4);
    assert_eq!(fill.args[0], KernelArg::Ptr(t.storage().ptr()));
    assert_eq!(fill.args[2], KernelArg::U32(1000));
    assert_eq!(fill.args[3], KernelArg::F32(2.5));
}

#[test]
fn test_apply_grid_capped_by_multiprocessors() {
    let (sim, runtime) = single_device_runtime();
    let t = runtime.empty(0, DType::I32, &[1 << 20]).unwrap();
    runtime.apply("fill", &[&t], &[0.0]).unwrap();
    // 16 multiprocessors, 4 blocks each
    assert_eq!(sim.launches()[0].config.grid_dim.0, 64);
    assert_eq!(sim.launches()[0].args[3], KernelArg::I32(0));
}

#[test]
fn test_copy_and_add_specialize_per_operand() {
    let (sim, runtime) = single_device_runtime();
    let dst = runtime.empty(0, DType::F64, &[8, 16]).unwrap();
    let src = runtime.empty(0, DType::F64, &[16, 8]).unwrap().transpose(0, 1).unwrap();
    runtime.apply("copy", &[&dst, &src], &[]).unwrap();

    let other = runtime.empty(0, DType::F64, &[8, 16]).unwrap();
    runtime.apply("add", &[&dst, &src, &other], &[]).unwrap();

    let launches = sim.launches();
    assert_eq!(launches[0].function, "copy_f64_u32_cg");
    assert_eq!(launches[1].function, "add_f64_u32_cgc");
    // (ptr, info) per operand, then the element count
    assert_eq!(launches[1].args.len(), 7);
    assert_eq!(launches[1].args[6], KernelArg::U32(128));
}

#[test]
fn test_apply_rejects_bad_operands() {
    let (sim, runtime) = single_device_runtime();
    let a = runtime.empty(0, DType::F32, &[4, 4]).unwrap();
    let b = runtime.empty(0, DType::F32, &[16]).unwrap();
    let c = runtime.empty(0, DType::F64, &[4, 4]).unwrap();

    assert!(matches!(
        runtime.apply("copy", &[&a, &b], &[]),
        Err(ForgeError::InvalidTensor(_))
    ));
    assert!(matches!(
        runtime.apply("copy", &[&a, &c], &[]),
        Err(ForgeError::InvalidTensor(_))
    ));
    assert!(matches!(
        runtime.apply("fill", &[&a, &a], &[1.0]),
        Err(ForgeError::InvalidTensor(_))
    ));
    assert!(matches!(
        runtime.apply("fill", &[&a], &[]),
        Err(ForgeError::InvalidTensor(_))
    ));
    assert!(matches!(
        runtime.apply("sum_all", &[&a], &[]),
        Err(ForgeError::InvalidConfiguration(_))
    ));
    assert!(matches!(
        runtime.apply("gelu", &[&a], &[]),
        Err(ForgeError::UnknownTemplate(_))
    ));
    assert!(sim.launches().is_empty());
}

#[test]
fn test_apply_on_empty_tensor_launches_nothing() {
    let (sim, runtime) = single_device_runtime();
    let t = runtime.empty(0, DType::F32, &[0, 3]).unwrap();
    runtime.apply("fill", &[&t], &[1.0]).unwrap();
    assert!(sim.launches().is_empty());
}

#[test]
fn test_operands_must_share_the_dispatch_device() {
    let sim = sim_machine(2);
    let runtime = runtime_on(&sim, vec![0, 1]);
    let a = runtime.empty(0, DType::F32, &[32]).unwrap();
    let b = runtime.empty(1, DType::F32, &[32]).unwrap();

    let err = runtime.apply("copy", &[&a, &b], &[]).unwrap_err();
    assert!(matches!(err, ForgeError::InvalidTensor(_)));

    runtime.apply("fill", &[&b], &[3.0]).unwrap();
    assert_eq!(sim.launches()[0].device, 1);
}

#[test]
fn test_prewarm_loads_every_entry_everywhere() {
    let sim = sim_machine(2);
    let runtime = runtime_on(&sim, vec![0, 1]);

    // Reductions: 3 templates x 4 variants x 9 entries.
    // fill 4 x 3, copy 6 x 3, add 10 x 3.
    let per_context = 3 * 4 * 9 + 4 * 3 + 6 * 3 + 10 * 3;
    assert_eq!(runtime.prewarm().unwrap(), 2 * per_context);
    assert_eq!(sim.counters().compilations, 32);
    assert_eq!(runtime.contexts().kernel_cache().module_count(), 2 * 32);

    // Warm caches make a second pass free
    runtime.prewarm().unwrap();
    let counters = sim.counters();
    assert_eq!(counters.compilations, 32);
    assert_eq!(counters.module_loads, 2 * 32);

    // Dispatch after prewarming loads nothing new
    let t = runtime.empty(1, DType::F64, &[10]).unwrap();
    runtime.reduce("sum_all", &t, 0.0, Default::default()).unwrap();
    assert_eq!(sim.counters().module_loads, 2 * 32);
}

#[test]
fn test_prewarm_at_startup() {
    let sim = sim_machine(1);
    let runtime = TensorRuntime::new(
        sim.clone(),
        sim.clone(),
        RuntimeConfig::new().with_arena_fraction(0.5).with_prewarm(true),
    )
    .unwrap();
    assert_eq!(sim.counters().compilations, 32);
    assert_eq!(runtime.library().compiled_count("add"), 10);
}

#[test]
fn test_resident_holds_device_memory_until_evicted() {
    let sim = sim_machine(1);
    let runtime = TensorRuntime::new(
        sim.clone(),
        sim.clone(),
        RuntimeConfig::new()
            .with_arena_fraction(0.5)
            .with_resident_idle_secs(30),
    )
    .unwrap();
    let allocator = runtime.contexts().allocator_for(0).unwrap();
    let baseline = allocator.live_bytes();

    let builder_allocator = Arc::clone(&allocator);
    let weights = runtime.resident("weights", move || {
        DeviceMemory::allocate(&builder_allocator, 1 << 20)
    });
    assert_eq!(weights.idle_timeout(), Duration::from_secs(30));
    assert!(!weights.is_resident());

    let held = weights.get().unwrap();
    assert_eq!(allocator.live_bytes(), baseline + (1 << 20));
    assert!(!weights.evict_if_idle(Instant::now() + Duration::from_secs(60)));
    drop(held);

    assert!(weights.evict_if_idle(Instant::now() + Duration::from_secs(60)));
    assert_eq!(allocator.live_bytes(), baseline);

    weights.get().unwrap();
    assert_eq!(weights.builds(), 2);
}

#[test]
fn test_synchronize() {
    let sim = sim_machine(3);
    let runtime = runtime_on(&sim, vec![0, 2]);
    let before = sim.counters().synchronizations;
    runtime.synchronize(2).unwrap();
    runtime.synchronize_all().unwrap();
    assert_eq!(sim.counters().synchronizations, before + 3);
    assert!(matches!(runtime.synchronize(1), Err(ForgeError::UnknownDevice(1))));
}

#[test]
fn test_dispose_is_idempotent() {
    let (sim, runtime) = single_device_runtime();
    let t = runtime.empty(0, DType::F32, &[3000]).unwrap();
    runtime.reduce("sum_all", &t, 0.0, Default::default()).unwrap();
    drop(t);

    runtime.dispose().unwrap();
    runtime.dispose().unwrap();
    assert_no_leak(&sim, &[0]);
    assert!(matches!(
        runtime.empty(0, DType::F32, &[4]),
        Err(ForgeError::AllocatorReleased(0))
    ));
}

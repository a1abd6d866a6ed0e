// Pipeline integration tests for hwc-dispatch
//
// Drives whole frames through the scheduler against the simulated
// hardware-resource manager: assignment, finalization, dispatch order,
// fence accounting, pool exhaustion and hotplug.

use std::sync::Arc;

use hwc_dispatch::hwrm::sim::{SimCall, SimulatedResourceManager};
use hwc_dispatch::hwrm::HardwareResourceManager;
use hwc_dispatch::job::Rect;
use hwc_dispatch::{
    BufferDescriptor, BufferHandle, DispatchConfig, DispatchError, DisplayId, DisplayInfo,
    FenceLedger, FenceRole, PixelFormat, PostState, Scheduler, SetJobOutcome, SoftwareRange, VisibleLayer,
};

fn unpaced_config() -> DispatchConfig {
    let mut config = DispatchConfig::default();
    config.vsync.paced = false;
    config
}

fn setup(config: DispatchConfig) -> (Scheduler, Arc<SimulatedResourceManager>, FenceLedger) {
    let ledger = FenceLedger::new();
    let sim = Arc::new(SimulatedResourceManager::with_ledger(ledger.clone()));
    let scheduler = Scheduler::new(config, Arc::clone(&sim) as Arc<dyn HardwareResourceManager>);
    (scheduler, sim, ledger)
}

fn layer(ledger: &FenceLedger, id: u64) -> VisibleLayer {
    VisibleLayer::ui(
        BufferHandle::new(id, 256, 256, PixelFormat::Rgba8888),
        Rect::new(0, 0, 256, 256),
    )
    .with_acquire_fence(ledger.create_signaled())
}

/// get_job, fill, assign, set_job, trigger; returns the job's sequence
fn submit(scheduler: &Scheduler, ledger: &FenceLedger, display: DisplayId, ids: &[u64]) -> u64 {
    let sequence = scheduler.get_job(display).unwrap();
    scheduler
        .with_job(display, |job| {
            for &id in ids {
                job.push_layer(layer(ledger, id));
            }
        })
        .unwrap();
    scheduler.assign_resources(false);
    let outcome = scheduler.set_job(display).unwrap();
    assert!(outcome.is_ready(), "unexpected outcome {:?}", outcome);
    scheduler.trigger(display).unwrap();
    sequence
}

#[test]
fn test_six_layers_on_four_inputs() {
    let (scheduler, sim, ledger) = setup(unpaced_config());
    let display = scheduler.on_plug_in(DisplayInfo::physical(0, 4)).unwrap();

    scheduler.get_job(display).unwrap();
    scheduler
        .with_job(display, |job| {
            for id in 0..6 {
                job.push_layer(layer(&ledger, id));
            }
        })
        .unwrap();
    scheduler.assign_resources(false);

    scheduler
        .with_job(display, |job| {
            assert_eq!(job.software_range(), Some(SoftwareRange { head: 0, tail: 1 }));
            assert_eq!(job.num_layers(), 4);
            for (hw, slot) in job.slots().iter().enumerate() {
                assert!(slot.enabled);
                assert_eq!(slot.hw_index, Some(hw as u32));
                assert_eq!(slot.z_order, hw + 2);
            }
        })
        .unwrap();

    assert!(matches!(
        scheduler.set_job(display).unwrap(),
        SetJobOutcome::Ready(PostState::Continue)
    ));
    scheduler.trigger(display).unwrap();
    scheduler.drain(display).unwrap();

    let triggers: Vec<_> = sim
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            SimCall::Trigger { inputs, .. } => Some(inputs),
            _ => None,
        })
        .collect();
    assert_eq!(triggers, vec![4]);
}

#[test]
fn test_jobs_reach_hardware_in_fifo_order() {
    let (scheduler, sim, ledger) = setup(unpaced_config());
    let display = scheduler.on_plug_in(DisplayInfo::physical(0, 4)).unwrap();

    // Draining every few frames keeps the 5-job pool from running dry
    let mut expected = Vec::new();
    for frame in 0..30u64 {
        expected.push(submit(&scheduler, &ledger, display, &[frame * 10, frame * 10 + 1]));
        if frame % 4 == 3 {
            scheduler.drain(display).unwrap();
        }
    }
    scheduler.drain(display).unwrap();

    assert_eq!(sim.triggered_sequences(display), expected);
    let stats = scheduler.stats(display).unwrap();
    assert_eq!(stats.composed, 30);
    assert_eq!(stats.pool_outstanding, 0);
}

#[test]
fn test_every_fence_closed_exactly_once() {
    let (scheduler, _sim, ledger) = setup(unpaced_config());
    let panel = scheduler.on_plug_in(DisplayInfo::physical(0, 2)).unwrap();
    let virt = scheduler.on_plug_in(DisplayInfo::virtual_display(1, 2)).unwrap();

    for frame in 0..8u64 {
        // Three layers on two inputs puts one layer in software
        submit(&scheduler, &ledger, panel, &[frame, 100 + frame, 200 + frame]);

        scheduler.get_job(virt).unwrap();
        scheduler
            .with_job(virt, |job| job.push_layer(layer(&ledger, 1000 + frame)))
            .unwrap();
        if frame % 2 == 0 {
            let output = BufferDescriptor {
                handle: Some(BufferHandle::new(5000 + frame, 640, 480, PixelFormat::Rgba8888)),
                acquire: Some(ledger.create_signaled()),
                ..Default::default()
            };
            scheduler.set_output_buffer(virt, output).unwrap();
        }
        scheduler.assign_resources(false);
        match scheduler.set_job(virt).unwrap() {
            SetJobOutcome::Ready(_) => scheduler.trigger(virt).unwrap(),
            SetJobOutcome::Skipped { returned } => {
                assert_eq!(frame % 2, 1, "only frames without output are skipped");
                assert_eq!(returned.len(), 1);
            }
            SetJobOutcome::NotDirty => panic!("virtual frame unexpectedly clean"),
        }

        // A repeated frame is released unqueued
        scheduler.get_job(panel).unwrap();
        scheduler
            .with_job(panel, |job| {
                for id in [frame, 100 + frame, 200 + frame] {
                    job.push_layer(layer(&ledger, id));
                }
            })
            .unwrap();
        scheduler.assign_resources(false);
        assert!(matches!(scheduler.set_job(panel).unwrap(), SetJobOutcome::NotDirty));

        scheduler.drain(panel).unwrap();
        scheduler.drain(virt).unwrap();
        assert!(!scheduler.take_release_fences(panel).unwrap().is_empty());
        drop(scheduler.take_release_fences(virt).unwrap());
    }

    scheduler.shutdown();

    assert_eq!(ledger.open_count(), 0);
    for id in ledger.issued() {
        assert_eq!(ledger.close_count(id), 1, "fence {} closed {} times", id, ledger.close_count(id));
    }
}

#[test]
fn test_virtual_display_repeats_layers_into_fresh_output() {
    let (scheduler, sim, ledger) = setup(unpaced_config());
    let virt = scheduler.on_plug_in(DisplayInfo::virtual_display(1, 2)).unwrap();

    for output_id in [7000u64, 7001] {
        scheduler.get_job(virt).unwrap();
        scheduler
            .with_job(virt, |job| job.push_layer(layer(&ledger, 42)))
            .unwrap();
        let output = BufferDescriptor {
            handle: Some(BufferHandle::new(output_id, 640, 480, PixelFormat::Rgba8888)),
            acquire: Some(ledger.create_signaled()),
            ..Default::default()
        };
        scheduler.set_output_buffer(virt, output).unwrap();
        scheduler.assign_resources(false);
        assert!(matches!(
            scheduler.set_job(virt).unwrap(),
            SetJobOutcome::Ready(PostState::Continue)
        ));
        scheduler.trigger(virt).unwrap();
        scheduler.drain(virt).unwrap();
    }

    assert_eq!(sim.count_calls(|call| *call == SimCall::PrepareOutput(virt)), 2);
    assert_eq!(sim.triggered_sequences(virt).len(), 2);
    let retired = scheduler
        .take_release_fences(virt)
        .unwrap()
        .into_iter()
        .filter(|entry| entry.role == FenceRole::Retire)
        .count();
    assert_eq!(retired, 2);
    assert_eq!(scheduler.stats(virt).unwrap().not_dirty, 0);
}

#[test]
fn test_pool_exhaustion_fails_the_frame() {
    let (scheduler, sim, ledger) = setup(unpaced_config());
    let display = scheduler.on_plug_in(DisplayInfo::physical(0, 4)).unwrap();

    sim.pause_triggers();
    for frame in 0..5u64 {
        submit(&scheduler, &ledger, display, &[frame]);
    }

    let err = scheduler.get_job(display).unwrap_err();
    assert!(matches!(err, DispatchError::PoolExhausted { capacity: 5, .. }));

    sim.resume_triggers();
    scheduler.drain(display).unwrap();
    assert!(scheduler.get_job(display).is_ok());

    let stats = scheduler.stats(display).unwrap();
    assert_eq!(stats.pool_exhausted, 1);
    assert_eq!(stats.pool_peak, 5);
}

#[test]
fn test_hotplug_releases_held_job_and_allows_replug() {
    let (scheduler, sim, ledger) = setup(unpaced_config());
    let display = scheduler.on_plug_in(DisplayInfo::physical(3, 4)).unwrap();

    submit(&scheduler, &ledger, display, &[1, 2]);
    scheduler.get_job(display).unwrap();
    scheduler
        .with_job(display, |job| job.push_layer(layer(&ledger, 9)))
        .unwrap();

    scheduler.on_plug_out(display).unwrap();
    assert!(!sim.has_session(display));
    assert!(matches!(
        scheduler.trigger(display),
        Err(DispatchError::DisplayNotConnected(_))
    ));
    assert_eq!(ledger.open_count(), 0);

    let again = scheduler.on_plug_in(DisplayInfo::physical(3, 4)).unwrap();
    submit(&scheduler, &ledger, again, &[5]);
    scheduler.drain(again).unwrap();
    assert_eq!(sim.count_calls(|call| *call == SimCall::CreateSession(again)), 2);
}

#[test]
fn test_rejected_placement_composes_in_software() {
    use hwc_dispatch::hwrm::sim::PlacementBehavior;

    let (scheduler, sim, ledger) = setup(unpaced_config());
    let a = DisplayId(0);
    let b = DisplayId(1);
    for display in [a, b] {
        sim.set_supports_query(display, true);
    }
    sim.set_placement_behavior(b, PlacementBehavior::Infeasible);
    scheduler.on_plug_in(DisplayInfo::physical(0, 4)).unwrap();
    scheduler.on_plug_in(DisplayInfo::physical(1, 4)).unwrap();

    for display in [a, b] {
        scheduler.get_job(display).unwrap();
        scheduler
            .with_job(display, |job| {
                job.push_layer(layer(&ledger, 1));
                job.push_layer(layer(&ledger, 2));
            })
            .unwrap();
    }
    let assignments = scheduler.assign_resources(false);
    assert_eq!(assignments.len(), 2);
    assert_eq!(sim.placement_queries(), 1);

    scheduler
        .with_job(a, |job| {
            assert!(job.resources_valid());
            assert_eq!(job.num_layers(), 2);
        })
        .unwrap();
    scheduler
        .with_job(b, |job| {
            assert!(!job.resources_valid());
            assert_eq!(job.num_layers(), 0);
            assert_eq!(job.software_range(), Some(SoftwareRange { head: 0, tail: 1 }));
        })
        .unwrap();

    for display in [a, b] {
        assert!(scheduler.set_job(display).unwrap().is_ready());
        scheduler.trigger(display).unwrap();
        scheduler.drain(display).unwrap();
    }
    assert_eq!(scheduler.stats(b).unwrap().software_frames, 1);
    assert_eq!(scheduler.stats(a).unwrap().software_frames, 0);
}

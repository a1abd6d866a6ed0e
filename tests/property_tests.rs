// Property-based tests for hwc-dispatch
//
// Uses proptest to check the resource-assignment boundary over random layer
// stacks and the exactly-once close rule over random fence operations.

use proptest::prelude::*;

use hwc_dispatch::hrt::{self, HrtDisplay, HrtLayer};
use hwc_dispatch::job::Rect;
use hwc_dispatch::{DisplayId, FenceHandle, FenceLedger};

prop_compose! {
    fn arb_layer()(
        hw_required in prop_oneof![8 => Just(1u32), 1 => Just(2u32)],
        hw_eligible in prop::bool::weighted(0.85),
        wants_client_clear in prop::bool::weighted(0.15),
    ) -> HrtLayer {
        HrtLayer {
            hw_required,
            hw_eligible,
            wants_client_clear,
            display_frame: Rect::new(0, 0, 1920, 1080),
            format: None,
            secure: false,
        }
    }
}

prop_compose! {
    fn arb_display()(
        max_inputs in 0usize..8,
        layers in prop::collection::vec(arb_layer(), 0..16),
    ) -> HrtDisplay {
        HrtDisplay {
            display: DisplayId(0),
            max_inputs,
            connected: true,
            mirrored: false,
            supports_query: false,
            layers,
        }
    }
}

#[derive(Debug, Clone)]
enum FenceOp {
    Create,
    Dup(usize),
    Merge(usize, usize),
    Drop(usize),
}

fn arb_fence_op() -> impl Strategy<Value = FenceOp> {
    prop_oneof![
        3 => Just(FenceOp::Create),
        2 => any::<usize>().prop_map(FenceOp::Dup),
        2 => (any::<usize>(), any::<usize>()).prop_map(|(a, b)| FenceOp::Merge(a, b)),
        2 => any::<usize>().prop_map(FenceOp::Drop),
    ]
}

proptest! {
    #[test]
    fn test_simplified_assignment_respects_boundary(display in arb_display()) {
        let assignment = hrt::simplified(&display);
        let layers = &display.layers;

        prop_assert_eq!(assignment.hw_indices.len(), layers.len());

        // Exactly the software range goes without a hardware input
        for (z, hw_index) in assignment.hw_indices.iter().enumerate() {
            let in_software = assignment.software_range.is_some_and(|range| range.contains(z));
            prop_assert_eq!(hw_index.is_none(), in_software, "layer {}", z);
            if !layers[z].hw_eligible {
                prop_assert!(in_software, "ineligible layer {} on hardware", z);
            }
        }

        // Hardware inputs are packed in Z order and fit the display
        let mut next = 0u32;
        for (z, hw_index) in assignment.hw_indices.iter().enumerate() {
            if let Some(hw_index) = hw_index {
                prop_assert_eq!(*hw_index, next);
                next += layers[z].hw_required;
            }
        }
        prop_assert!(next as usize <= display.max_inputs);

        if let Some(range) = assignment.software_range {
            prop_assert!(range.head <= range.tail);
            prop_assert!(range.tail < layers.len());
        }
    }

    #[test]
    fn test_stack_that_fits_stays_on_hardware(count in 0usize..8, spare in 0usize..4) {
        let display = HrtDisplay {
            display: DisplayId(0),
            max_inputs: count + spare,
            connected: true,
            mirrored: false,
            supports_query: false,
            layers: vec![HrtLayer::plain(); count],
        };
        let assignment = hrt::simplified(&display);
        prop_assert!(assignment.software_range.is_none());
        prop_assert_eq!(assignment.hw_layer_count(), count);
    }

    #[test]
    fn test_fences_close_exactly_once(ops in prop::collection::vec(arb_fence_op(), 1..64)) {
        let ledger = FenceLedger::new();
        let mut held: Vec<FenceHandle> = Vec::new();

        for op in ops {
            match op {
                FenceOp::Create => held.push(ledger.create().0),
                FenceOp::Dup(i) if !held.is_empty() => {
                    let copy = held[i % held.len()].dup().unwrap();
                    held.push(copy);
                }
                FenceOp::Merge(a, b) if held.len() >= 2 => {
                    let first = held.swap_remove(a % held.len());
                    let second = held.swap_remove(b % held.len());
                    held.push(FenceHandle::merge(first, second));
                }
                FenceOp::Drop(i) if !held.is_empty() => {
                    drop(held.swap_remove(i % held.len()));
                }
                _ => {}
            }
            let components: usize = held.iter().map(FenceHandle::component_count).sum();
            prop_assert_eq!(ledger.open_count(), components);
        }

        drop(held);
        prop_assert_eq!(ledger.open_count(), 0);
        for id in ledger.issued() {
            prop_assert_eq!(ledger.close_count(id), 1);
        }
    }
}

//! Hardware-resource assignment ("HRT") engine
//!
//! Decides, once per frame across every connected display, which visible
//! layers get a hardware composition input and which contiguous Z range
//! falls back to software (client) composition.
//!
//! # Tiers
//!
//! - **Detailed**: displays whose resource manager can answer placement
//!   queries are serialized into one batched [`PlacementRequest`]. A
//!   display whose verdict is infeasible or inconsistent is marked invalid
//!   for the frame and composes everything in software.
//! - **Simplified**: a greedy rule that grows the software range by the
//!   smallest excess over the display's input count.
//!
//! # Simplified tie-break
//!
//! The range is seeded by layers the hardware cannot take at all. With no
//! such layer it starts at the lowest "wants client clear" layer, else at
//! Z index 0. Each extension step then prefers a neighbour flagged
//! "wants client clear"; otherwise it grows toward the side (below the head
//! or above the tail) with fewer hardware-eligible layers remaining. Equal
//! counts grow upward.

use log::{debug, warn};
use std::collections::HashSet;

use crate::display::{DisplayId, PixelFormat};
use crate::error::invariant_violation;
use crate::hwrm::{HardwareResourceManager, PlacementEntry, PlacementRequest, PlacementVerdict};
use crate::job::{Rect, VisibleLayer};

/// Inclusive Z-index range composed in software
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SoftwareRange {
    pub head: usize,
    pub tail: usize,
}

impl SoftwareRange {
    pub fn len(&self) -> usize {
        self.tail - self.head + 1
    }

    pub fn contains(&self, z: usize) -> bool {
        z >= self.head && z <= self.tail
    }
}

/// Layer as seen by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HrtLayer {
    pub hw_required: u32,
    pub hw_eligible: bool,
    pub wants_client_clear: bool,
    pub display_frame: Rect,
    pub format: Option<PixelFormat>,
    pub secure: bool,
}

impl HrtLayer {
    /// Ordinary single-input layer
    pub fn plain() -> Self {
        Self {
            hw_required: 1,
            hw_eligible: true,
            wants_client_clear: false,
            display_frame: Rect::default(),
            format: None,
            secure: false,
        }
    }
}

impl From<&VisibleLayer> for HrtLayer {
    fn from(layer: &VisibleLayer) -> Self {
        Self {
            hw_required: layer.caps.hw_required.max(1),
            hw_eligible: layer.caps.hw_eligible,
            wants_client_clear: layer.caps.wants_client_clear,
            display_frame: layer.display_frame,
            format: layer.format,
            secure: layer.caps.secure,
        }
    }
}

/// One display's input to the engine
#[derive(Debug, Clone)]
pub struct HrtDisplay {
    pub display: DisplayId,
    pub max_inputs: usize,
    pub connected: bool,
    /// Mirror sinks take no part; their content is the source's output
    pub mirrored: bool,
    pub supports_query: bool,
    pub layers: Vec<HrtLayer>,
}

/// Which tier produced an assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentTier {
    Detailed,
    Simplified,
    /// Query failed or was infeasible; everything in software
    Invalid,
}

/// Engine output for one display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayAssignment {
    pub display: DisplayId,
    pub software_range: Option<SoftwareRange>,
    /// Hardware input per visible layer, `None` inside the software range
    pub hw_indices: Vec<Option<u32>>,
    pub valid: bool,
    pub tier: AssignmentTier,
}

impl DisplayAssignment {
    /// Everything composed in software for this frame
    pub fn invalid(display: DisplayId, layer_count: usize) -> Self {
        Self {
            display,
            software_range: (layer_count > 0).then(|| SoftwareRange {
                head: 0,
                tail: layer_count - 1,
            }),
            hw_indices: vec![None; layer_count],
            valid: false,
            tier: AssignmentTier::Invalid,
        }
    }

    /// Layers composed by hardware
    pub fn hw_layer_count(&self) -> usize {
        self.hw_indices.iter().filter(|index| index.is_some()).count()
    }
}

/// Runs the two-tier assignment
#[derive(Debug, Clone)]
pub struct HrtEngine {
    detailed_enabled: bool,
}

impl Default for HrtEngine {
    fn default() -> Self {
        Self::new(true)
    }
}

impl HrtEngine {
    pub fn new(detailed_enabled: bool) -> Self {
        Self { detailed_enabled }
    }

    /// Assigns resources for every connected, non-mirrored display.
    ///
    /// A failed detailed query only invalidates the displays that were part
    /// of it; displays on the simplified tier are unaffected.
    pub fn run(
        &self,
        displays: &[HrtDisplay],
        skip_detailed_query: bool,
        manager: &dyn HardwareResourceManager,
    ) -> Vec<DisplayAssignment> {
        let (detailed, simple): (Vec<&HrtDisplay>, Vec<&HrtDisplay>) = displays
            .iter()
            .filter(|display| display.connected && !display.mirrored)
            .partition(|display| {
                self.detailed_enabled && !skip_detailed_query && display.supports_query
            });

        let mut results: Vec<DisplayAssignment> = simple.into_iter().map(simplified).collect();

        if !detailed.is_empty() {
            results.extend(self.run_detailed(&detailed, manager));
        }

        results.sort_by_key(|assignment| assignment.display);
        results
    }

    fn run_detailed(
        &self,
        displays: &[&HrtDisplay],
        manager: &dyn HardwareResourceManager,
    ) -> Vec<DisplayAssignment> {
        let request = PlacementRequest {
            entries: displays
                .iter()
                .map(|display| PlacementEntry {
                    display: display.display,
                    max_inputs: display.max_inputs,
                    layers: display.layers.clone(),
                })
                .collect(),
        };

        let verdicts = match manager.query_placement(&request) {
            Ok(verdicts) => verdicts,
            Err(e) => {
                warn!(
                    "⚠️ placement query failed for {} displays, composing them in software: {}",
                    displays.len(),
                    e
                );
                return displays
                    .iter()
                    .map(|display| DisplayAssignment::invalid(display.display, display.layers.len()))
                    .collect();
            }
        };

        displays
            .iter()
            .map(|display| {
                let verdict = verdicts.iter().find(|verdict| verdict.display == display.display);
                match verdict.and_then(|verdict| assignment_from_verdict(display, verdict)) {
                    Some(assignment) => assignment,
                    None => {
                        warn!(
                            "⚠️ display {}: placement infeasible, composing in software this frame",
                            display.display
                        );
                        DisplayAssignment::invalid(display.display, display.layers.len())
                    }
                }
            })
            .collect()
    }
}

fn assignment_from_verdict(display: &HrtDisplay, verdict: &PlacementVerdict) -> Option<DisplayAssignment> {
    if !verdict.feasible || verdict.hw_indices.len() != display.layers.len() {
        return None;
    }

    let software: Vec<usize> = verdict
        .hw_indices
        .iter()
        .enumerate()
        .filter(|(_, index)| index.is_none())
        .map(|(z, _)| z)
        .collect();
    let software_range = match (software.first(), software.last()) {
        (Some(&head), Some(&tail)) => {
            if tail - head + 1 != software.len() {
                debug!("display {}: verdict software set is not contiguous", display.display);
                return None;
            }
            Some(SoftwareRange { head, tail })
        }
        _ => None,
    };

    let mut seen = HashSet::new();
    for (layer, index) in display.layers.iter().zip(&verdict.hw_indices) {
        let Some(index) = index else { continue };
        if !layer.hw_eligible || index + layer.hw_required > display.max_inputs as u32 {
            return None;
        }
        for unit in *index..index + layer.hw_required {
            if !seen.insert(unit) {
                return None;
            }
        }
    }

    Some(DisplayAssignment {
        display: display.display,
        software_range,
        hw_indices: verdict.hw_indices.clone(),
        valid: true,
        tier: AssignmentTier::Detailed,
    })
}

/// Greedy software-fallback assignment for one display
pub fn simplified(display: &HrtDisplay) -> DisplayAssignment {
    let layers = &display.layers;
    let capacity = display.max_inputs as u64;

    let mut range = ineligible_span(layers);
    let required = required_outside(layers, range);

    if required > capacity {
        let mut excess = required - capacity;
        let mut current = match range {
            Some(current) => current,
            None => {
                let seed = seed_index(layers);
                excess = excess.saturating_sub(layers[seed].hw_required as u64);
                SoftwareRange {
                    head: seed,
                    tail: seed,
                }
            }
        };

        while excess > 0 {
            let below = current.head.checked_sub(1);
            let above = (current.tail + 1 < layers.len()).then_some(current.tail + 1);
            let next = match (below, above) {
                (None, None) => invariant_violation(format_args!(
                    "display {}: excess of {} inputs left after covering all {} layers",
                    display.display,
                    excess,
                    layers.len()
                )),
                (Some(below), None) => below,
                (None, Some(above)) => above,
                (Some(below), Some(above)) => pick_side(layers, current, below, above),
            };
            excess = excess.saturating_sub(layers[next].hw_required as u64);
            if next < current.head {
                current.head = next;
            } else {
                current.tail = next;
            }
        }
        range = Some(current);
    }

    let mut hw_indices = Vec::with_capacity(layers.len());
    let mut next_index = 0u32;
    for (z, layer) in layers.iter().enumerate() {
        if range.is_some_and(|range| range.contains(z)) {
            hw_indices.push(None);
        } else {
            hw_indices.push(Some(next_index));
            next_index += layer.hw_required.max(1);
        }
    }

    if next_index as u64 > capacity {
        invariant_violation(format_args!(
            "display {}: {} hardware inputs assigned, capacity {}",
            display.display, next_index, capacity
        ));
    }

    DisplayAssignment {
        display: display.display,
        software_range: range,
        hw_indices,
        valid: true,
        tier: AssignmentTier::Simplified,
    }
}

/// Span covering every layer the hardware cannot take
fn ineligible_span(layers: &[HrtLayer]) -> Option<SoftwareRange> {
    let mut ineligible = layers
        .iter()
        .enumerate()
        .filter(|(_, layer)| !layer.hw_eligible)
        .map(|(z, _)| z);
    let head = ineligible.next()?;
    let tail = ineligible.last().unwrap_or(head);
    Some(SoftwareRange { head, tail })
}

fn required_outside(layers: &[HrtLayer], range: Option<SoftwareRange>) -> u64 {
    layers
        .iter()
        .enumerate()
        .filter(|(z, _)| !range.is_some_and(|range| range.contains(*z)))
        .map(|(_, layer)| layer.hw_required.max(1) as u64)
        .sum()
}

fn seed_index(layers: &[HrtLayer]) -> usize {
    layers
        .iter()
        .position(|layer| layer.wants_client_clear)
        .unwrap_or(0)
}

fn pick_side(layers: &[HrtLayer], current: SoftwareRange, below: usize, above: usize) -> usize {
    match (layers[below].wants_client_clear, layers[above].wants_client_clear) {
        (true, false) => return below,
        (false, true) => return above,
        _ => {}
    }

    let eligible_below = layers[..current.head].iter().filter(|layer| layer.hw_eligible).count();
    let eligible_above = layers[current.tail + 1..]
        .iter()
        .filter(|layer| layer.hw_eligible)
        .count();

    if eligible_below < eligible_above {
        below
    } else {
        above
    }
}

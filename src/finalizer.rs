//! Last-mile stage around the hardware submission
//!
//! [`Finalizer::prepare`] runs on the host thread inside `set_job`: dirty
//! detection, present fence, output import, and the `post_state` decision.
//! [`Finalizer::finish`] runs on the dispatch worker after composition: it
//! submits the frame, chains the present fence into the next frame and
//! moves the fences the hardware returned into the cluster's
//! [`FenceOutbox`].
//!
//! Mirror coupling goes through a [`MirrorSnapshot`] of the source job's
//! writeback output, captured once the source is finalized.

use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::mem;

use crate::config::QueueConfig;
use crate::display::{DisplayId, DisplayKind, PixelFormat};
use crate::error::{DispatchError, Result};
use crate::fence::FenceHandle;
use crate::hrt::SoftwareRange;
use crate::hwrm::{ClientTargetInput, HardwareResourceManager, TriggerInput, TriggerOutput, TriggerRequest};
use crate::job::{
    BufferDescriptor, CompositionJob, DirtyReason, LayerCategory, PostState, Rect,
};

/// What a fence in the outbox stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceRole {
    /// Input buffer of layer `z_order` may be reused; `None` is the mirror input
    Release { z_order: Option<usize> },
    /// Frame reached the panel
    Present,
    /// Output buffer of a virtual display is complete
    Retire,
    /// Source output read by this mirror sink may be reused
    MirrorRelease { source: DisplayId },
}

/// A fence waiting for the host to collect it
#[derive(Debug)]
pub struct OutboxEntry {
    pub sequence: u64,
    pub role: FenceRole,
    pub fence: FenceHandle,
}

/// Fences produced by the pipeline for the host.
///
/// Holds at most `limit` entries; past that the oldest fence is closed.
#[derive(Debug)]
pub struct FenceOutbox {
    limit: usize,
    entries: Mutex<VecDeque<OutboxEntry>>,
}

impl Default for FenceOutbox {
    fn default() -> Self {
        Self::with_limit(QueueConfig::default().outbox_limit)
    }
}

impl FenceOutbox {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, sequence: u64, role: FenceRole, fence: FenceHandle) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.limit {
            if let Some(oldest) = entries.pop_front() {
                warn!(
                    "⚠️ {} uncollected fences, closing {:?} fence of job #{}",
                    self.limit, oldest.role, oldest.sequence
                );
            }
        }
        entries.push_back(OutboxEntry { sequence, role, fence });
    }

    /// Moves every pending fence to the caller
    pub fn take(&self) -> Vec<OutboxEntry> {
        mem::take(&mut *self.entries.lock()).into()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CachedLayer {
    buffer: Option<u64>,
    crop: Rect,
    frame: Rect,
    category: LayerCategory,
}

/// Previous frame's per-layer state, for dirty detection
#[derive(Debug, Default)]
pub struct FrameCache {
    primed: bool,
    layers: Vec<CachedLayer>,
    software_range: Option<SoftwareRange>,
}

impl FrameCache {
    /// Forgets the previous frame; the next one is always dirty
    pub fn invalidate(&mut self) {
        self.primed = false;
        self.layers.clear();
        self.software_range = None;
    }

    /// Compares `job` against the previous frame and remembers it.
    ///
    /// Writes the per-slot dirty reasons and returns whether anything
    /// changed.
    pub fn update(&mut self, job: &mut CompositionJob) -> bool {
        let current: Vec<CachedLayer> = job
            .visible_layers()
            .iter()
            .map(|layer| CachedLayer {
                buffer: layer.buffer.as_ref().map(|buffer| buffer.id),
                crop: layer.source_crop,
                frame: layer.display_frame,
                category: layer.payload.category(),
            })
            .collect();

        let reasons: Vec<DirtyReason> = current
            .iter()
            .enumerate()
            .map(|(z, layer)| match self.layers.get(z) {
                Some(previous) if self.primed => {
                    let mut reason = DirtyReason::NONE;
                    if previous.buffer != layer.buffer {
                        reason.insert(DirtyReason::BUFFER);
                    }
                    if previous.crop != layer.crop || previous.frame != layer.frame {
                        reason.insert(DirtyReason::GEOMETRY);
                    }
                    if previous.category != layer.category {
                        reason.insert(DirtyReason::CATEGORY);
                    }
                    reason
                }
                _ => DirtyReason::NEW_LAYER,
            })
            .collect();

        let forced = !job.resources_valid();
        for slot in job.slots_mut().iter_mut().filter(|slot| slot.enabled) {
            slot.dirty = reasons.get(slot.z_order).copied().unwrap_or(DirtyReason::NEW_LAYER);
            if forced {
                slot.dirty.insert(DirtyReason::FORCED);
            }
        }

        let dirty = !self.primed
            || forced
            || current.len() != self.layers.len()
            || job.software_range() != self.software_range
            || reasons.iter().any(|reason| !reason.is_empty());

        self.primed = true;
        self.layers = current;
        self.software_range = job.software_range();
        job.flags.dirty_input = dirty;
        dirty
    }
}

/// Source output handed to mirror sinks
#[derive(Debug)]
pub struct MirrorSnapshot {
    pub source: DisplayId,
    pub sequence: u64,
    /// Independent copy of the source's writeback descriptor
    pub output: BufferDescriptor,
}

impl MirrorSnapshot {
    /// Copies a finalized source job's writeback output
    pub fn capture(job: &CompositionJob) -> Result<Self> {
        if !job.mirror_output.is_set() {
            return Err(DispatchError::MirrorUnavailable(job.display()));
        }
        Ok(Self {
            source: job.display(),
            sequence: job.sequence(),
            output: job.mirror_output.duplicate()?,
        })
    }
}

/// Display-kind specific finalization
#[derive(Debug)]
pub enum Finalizer {
    Physical(PhysicalFinalizer),
    Virtual(VirtualFinalizer),
}

/// Panel-backed display: present fences, writeback for mirror sinks
#[derive(Debug)]
pub struct PhysicalFinalizer {
    display: DisplayId,
    prev_present: Mutex<Option<FenceHandle>>,
}

/// Buffer-backed display: imports the host-supplied output every frame
#[derive(Debug)]
pub struct VirtualFinalizer {
    display: DisplayId,
    prev_retire: Mutex<Option<FenceHandle>>,
}

impl Finalizer {
    pub fn new(display: DisplayId, kind: DisplayKind) -> Self {
        match kind {
            DisplayKind::Physical => Finalizer::Physical(PhysicalFinalizer {
                display,
                prev_present: Mutex::new(None),
            }),
            DisplayKind::Virtual => Finalizer::Virtual(VirtualFinalizer {
                display,
                prev_retire: Mutex::new(None),
            }),
        }
    }

    pub fn display(&self) -> DisplayId {
        match self {
            Finalizer::Physical(f) => f.display,
            Finalizer::Virtual(f) => f.display,
        }
    }

    pub fn kind(&self) -> DisplayKind {
        match self {
            Finalizer::Physical(_) => DisplayKind::Physical,
            Finalizer::Virtual(_) => DisplayKind::Virtual,
        }
    }

    /// Decides the job's `post_state` before submission
    pub fn prepare(
        &self,
        hwrm: &dyn HardwareResourceManager,
        job: &mut CompositionJob,
        cache: &mut FrameCache,
        outbox: &FenceOutbox,
    ) -> PostState {
        let is_sink = job.mirror_source().is_some();
        if is_sink && !job.mirror_input.is_set() {
            warn!(
                "⚠️ display {}: mirror input missing for job #{}, skipping frame",
                job.display(),
                job.sequence()
            );
            return PostState::Error;
        }

        // Sinks and sources always produce a frame: their content is driven
        // by the other side of the mirror
        if is_sink || job.mirror_sinks > 0 {
            cache.invalidate();
            job.flags.dirty_input = true;
        } else {
            let changed = cache.update(job);
            // A virtual display owes the host its output buffer every frame
            if !changed && self.kind() == DisplayKind::Physical {
                trace!("display {}: job #{} not dirty", job.display(), job.sequence());
                return PostState::NotDirty;
            }
        }

        match self {
            Finalizer::Physical(f) => f.prepare(hwrm, job, outbox),
            Finalizer::Virtual(f) => f.prepare(hwrm, job),
        }
    }

    /// Submits a composed job to the hardware
    pub fn finish(&self, hwrm: &dyn HardwareResourceManager, job: &mut CompositionJob, outbox: &FenceOutbox) -> Result<()> {
        let display = job.display();
        let sequence = job.sequence();
        let mirror_sink = job.post_state() == Some(PostState::Mirror);

        let mut inputs = Vec::new();
        if mirror_sink {
            if let Some(buffer) = job.mirror_input.handle.clone() {
                hwrm.prepare_input(display, 0, &buffer)?;
                inputs.push(TriggerInput {
                    hw_index: 0,
                    z_order: 0,
                    category: LayerCategory::Ui,
                    buffer: Some(buffer),
                    acquire_fence: job.mirror_input.acquire.take(),
                });
            }
        } else {
            for slot in job.slots_mut().iter_mut().filter(|slot| slot.enabled) {
                let Some(hw_index) = slot.hw_index else { continue };
                if let Some(buffer) = &slot.buffer {
                    hwrm.prepare_input(display, hw_index, buffer)?;
                }
                inputs.push(TriggerInput {
                    hw_index,
                    z_order: slot.z_order,
                    category: slot.category(),
                    buffer: slot.buffer.clone(),
                    acquire_fence: slot.acquire_fence.take(),
                });
            }
        }

        let client_target = match (job.software_range(), job.client_target.handle.clone()) {
            (Some(range), Some(buffer)) if !mirror_sink => Some(ClientTargetInput {
                range,
                buffer,
                acquire_fence: job.client_target.acquire.take(),
            }),
            _ => None,
        };

        let output = match self {
            Finalizer::Physical(_) if job.mirror_sinks > 0 => take_output(&mut job.mirror_output),
            Finalizer::Physical(_) => None,
            Finalizer::Virtual(_) => take_output(&mut job.virtual_output),
        };

        let present = job.present_fence.take();
        let present_fence_index = present.as_ref().map(|present| present.index);
        let prev_present_fence = match self {
            Finalizer::Physical(f) => mem::replace(&mut *f.prev_present.lock(), present.map(|p| p.fence)),
            Finalizer::Virtual(f) => f.prev_retire.lock().take(),
        };

        let z_by_hw: HashMap<u32, usize> = inputs.iter().map(|input| (input.hw_index, input.z_order)).collect();

        // Kept so a rejected submission does not break the chain
        let chain_backup = match prev_present_fence.as_ref().map(FenceHandle::dup).transpose() {
            Ok(backup) => backup,
            Err(e) => {
                warn!("⚠️ display {}: could not keep the present chain: {}", display, e);
                None
            }
        };

        let submitted = hwrm.trigger(TriggerRequest {
            display,
            sequence,
            present_fence_index,
            prev_present_fence,
            inputs,
            client_target,
            output,
            black_frame: job.flags.black_frame,
        });
        let outcome = match submitted {
            Ok(outcome) => outcome,
            Err(e) => {
                match self {
                    Finalizer::Physical(f) => *f.prev_present.lock() = chain_backup,
                    Finalizer::Virtual(f) => *f.prev_retire.lock() = chain_backup,
                }
                return Err(e);
            }
        };
        drop(chain_backup);

        let mut mirror_release = job.mirror_input.release.take();
        for (hw_index, fence) in outcome.release_fences {
            if mirror_sink && hw_index == 0 {
                mirror_release = FenceHandle::merge_opt(mirror_release, Some(fence));
                continue;
            }
            outbox.push(
                sequence,
                FenceRole::Release {
                    z_order: z_by_hw.get(&hw_index).copied(),
                },
                fence,
            );
        }
        if let (Some(source), Some(fence)) = (job.mirror_source(), mirror_release) {
            outbox.push(sequence, FenceRole::MirrorRelease { source }, fence);
        }

        if let Some(retire) = outcome.retire_fence {
            if let Finalizer::Virtual(f) = self {
                *f.prev_retire.lock() = Some(retire.dup()?);
            }
            outbox.push(sequence, FenceRole::Retire, retire);
        }

        debug!("📤 display {}: job #{} submitted", display, sequence);
        Ok(())
    }

    /// Copies a mirror source's output into the sink's mirror input.
    ///
    /// Fences are duplicated, the source's interface fence is merged into
    /// the sink's release fence, and the pixel format is remapped when the
    /// sink expects another one.
    pub fn couple_mirror(source: &MirrorSnapshot, sink: &mut CompositionJob, sink_format: PixelFormat) -> Result<()> {
        let mut input = source.output.duplicate()?;
        input.release = FenceHandle::merge_opt(input.interface.take(), sink.mirror_input.release.take());
        input.present = None;

        if let Some(handle) = &mut input.handle {
            if handle.format != sink_format {
                debug!(
                    "🎨 mirror {} -> {}: remapping {:?} to {:?}",
                    source.source,
                    sink.display(),
                    handle.format,
                    sink_format
                );
                handle.format = sink_format;
                input.import.remapped = true;
            }
        }

        sink.mirror_input.reset();
        sink.mirror_input = input;
        sink.flags.black_frame = false;
        Ok(())
    }

    /// Drops the fence chained into the next submission
    pub fn reset_chain(&self) {
        match self {
            Finalizer::Physical(f) => *f.prev_present.lock() = None,
            Finalizer::Virtual(f) => *f.prev_retire.lock() = None,
        }
    }
}

fn take_output(descriptor: &mut BufferDescriptor) -> Option<TriggerOutput> {
    let buffer = descriptor.handle.clone()?;
    Some(TriggerOutput {
        buffer,
        ready_fence: descriptor.acquire.take(),
    })
}

impl PhysicalFinalizer {
    fn prepare(&self, hwrm: &dyn HardwareResourceManager, job: &mut CompositionJob, outbox: &FenceOutbox) -> PostState {
        match hwrm.prepare_present_fence(self.display) {
            Ok(present) => match present.fence.dup() {
                Ok(copy) => {
                    outbox.push(job.sequence(), FenceRole::Present, copy);
                    job.present_fence = Some(present);
                }
                Err(e) => {
                    warn!("⚠️ display {}: present fence dup failed, frame unsynchronized: {}", self.display, e);
                    job.present_fence = Some(present);
                }
            },
            Err(e) => {
                warn!(
                    "⚠️ display {}: no present fence for job #{}, composing unsynchronized: {}",
                    self.display,
                    job.sequence(),
                    e
                );
            }
        }

        if job.mirror_sinks > 0 {
            job.flags.needs_output_buffer = true;
            if let Err(e) = hwrm.prepare_output(self.display, &mut job.mirror_output) {
                // Sinks see the missing output and skip; the source still presents
                warn!("⚠️ display {}: writeback output unavailable: {}", self.display, e);
                job.mirror_output.reset();
            }
        }

        if job.mirror_source().is_some() {
            PostState::Mirror
        } else {
            PostState::Continue
        }
    }
}

impl VirtualFinalizer {
    fn prepare(&self, hwrm: &dyn HardwareResourceManager, job: &mut CompositionJob) -> PostState {
        job.flags.needs_output_buffer = true;
        if !job.virtual_output.is_set() {
            error!(
                "❌ {}",
                DispatchError::MissingOutputBuffer(self.display)
            );
            return PostState::Error;
        }
        if let Err(e) = hwrm.prepare_output(self.display, &mut job.virtual_output) {
            error!("❌ display {}: output import failed, skipping frame: {}", self.display, e);
            return PostState::Error;
        }

        if job.mirror_source().is_some() {
            PostState::Mirror
        } else {
            PostState::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::FenceLedger;
    use crate::hrt::{self, HrtDisplay, HrtLayer};
    use crate::hwrm::sim::{SimCall, SimulatedResourceManager};
    use crate::job::{BufferHandle, VisibleLayer};

    fn buffer(id: u64) -> BufferHandle {
        BufferHandle::new(id, 1080, 2400, PixelFormat::Rgba8888)
    }

    fn populated(display: u32, max_inputs: usize, buffers: &[u64], ledger: &FenceLedger) -> CompositionJob {
        let mut job = CompositionJob::new(DisplayId(display), max_inputs);
        job.begin(1, 1);
        for &id in buffers {
            job.push_layer(
                VisibleLayer::ui(buffer(id), Rect::new(0, 0, 100, 100)).with_acquire_fence(ledger.create_signaled()),
            );
        }
        let assignment = hrt::simplified(&HrtDisplay {
            display: DisplayId(display),
            max_inputs,
            connected: true,
            mirrored: false,
            supports_query: false,
            layers: job.visible_layers().iter().map(HrtLayer::from).collect(),
        });
        job.apply_assignment(&assignment);
        job
    }

    #[test]
    fn test_unchanged_frame_is_not_dirty() {
        let sim = SimulatedResourceManager::new();
        let ledger = sim.ledger().clone();
        let finalizer = Finalizer::new(DisplayId(0), DisplayKind::Physical);
        let mut cache = FrameCache::default();
        let outbox = FenceOutbox::default();

        let mut first = populated(0, 4, &[1, 2], &ledger);
        assert_eq!(finalizer.prepare(&sim, &mut first, &mut cache, &outbox), PostState::Continue);
        assert!(first.slots()[0].dirty.contains(DirtyReason::NEW_LAYER));

        let mut second = populated(0, 4, &[1, 2], &ledger);
        assert_eq!(finalizer.prepare(&sim, &mut second, &mut cache, &outbox), PostState::NotDirty);

        let mut third = populated(0, 4, &[1, 3], &ledger);
        assert_eq!(finalizer.prepare(&sim, &mut third, &mut cache, &outbox), PostState::Continue);
        assert!(third.slots()[1].dirty.contains(DirtyReason::BUFFER));
        assert!(third.slots()[0].dirty.is_empty());
    }

    #[test]
    fn test_virtual_display_renders_unchanged_layers_into_new_output() {
        let sim = SimulatedResourceManager::new();
        let ledger = sim.ledger().clone();
        let display = DisplayId(5);
        let finalizer = Finalizer::new(display, DisplayKind::Virtual);
        let mut cache = FrameCache::default();
        let outbox = FenceOutbox::default();

        for output_id in [50, 51] {
            let mut job = populated(5, 4, &[1, 2], &ledger);
            job.virtual_output = BufferDescriptor {
                handle: Some(buffer(output_id)),
                acquire: Some(ledger.create_signaled()),
                ..Default::default()
            };
            let state = finalizer.prepare(&sim, &mut job, &mut cache, &outbox);
            assert_eq!(state, PostState::Continue, "output {}", output_id);
            job.finalize(state);
            finalizer.finish(&sim, &mut job, &outbox).unwrap();
        }

        assert_eq!(sim.count_calls(|call| *call == SimCall::PrepareOutput(display)), 2);
        assert_eq!(sim.triggered_sequences(display).len(), 2);
        let retired = outbox.take().iter().filter(|entry| entry.role == FenceRole::Retire).count();
        assert_eq!(retired, 2);
    }

    #[test]
    fn test_rejected_submission_keeps_present_chain() {
        let sim = SimulatedResourceManager::new();
        let ledger = sim.ledger().clone();
        let display = DisplayId(0);
        let finalizer = Finalizer::new(display, DisplayKind::Physical);
        let outbox = FenceOutbox::default();

        let mut first = populated(0, 4, &[1], &ledger);
        let state = finalizer.prepare(&sim, &mut first, &mut FrameCache::default(), &outbox);
        first.finalize(state);
        finalizer.finish(&sim, &mut first, &outbox).unwrap();

        sim.set_fail_trigger(display, true);
        let mut second = populated(0, 4, &[2], &ledger);
        let state = finalizer.prepare(&sim, &mut second, &mut FrameCache::default(), &outbox);
        second.finalize(state);
        let unsubmitted = second.present_fence.as_ref().and_then(|p| p.fence.synthetic_id()).unwrap();
        assert!(finalizer.finish(&sim, &mut second, &outbox).is_err());

        // The never-submitted frame's fence is not chained
        assert_eq!(ledger.close_count(unsubmitted), 1);
        if let Finalizer::Physical(f) = &finalizer {
            assert!(f.prev_present.lock().is_some());
        }

        sim.set_fail_trigger(display, false);
        let mut third = populated(0, 4, &[3], &ledger);
        let state = finalizer.prepare(&sim, &mut third, &mut FrameCache::default(), &outbox);
        third.finalize(state);
        finalizer.finish(&sim, &mut third, &outbox).unwrap();
        assert_eq!(sim.chained_present_fences(display), vec![false, true]);
    }

    #[test]
    fn test_outbox_closes_oldest_beyond_limit() {
        let ledger = FenceLedger::new();
        let outbox = FenceOutbox::with_limit(3);
        let first = ledger.create_signaled();
        let first_id = first.synthetic_id().unwrap();
        outbox.push(1, FenceRole::Present, first);
        for sequence in 2..=5 {
            outbox.push(sequence, FenceRole::Release { z_order: Some(0) }, ledger.create_signaled());
        }

        assert_eq!(outbox.len(), 3);
        assert_eq!(ledger.open_count(), 3);
        assert_eq!(ledger.close_count(first_id), 1);
        let sequences: Vec<u64> = outbox.take().iter().map(|entry| entry.sequence).collect();
        assert_eq!(sequences, vec![3, 4, 5]);
    }

    #[test]
    fn test_present_fence_failure_degrades_to_unsynchronized() {
        let sim = SimulatedResourceManager::new();
        sim.set_fail_present_fence(DisplayId(0), true);
        let finalizer = Finalizer::new(DisplayId(0), DisplayKind::Physical);
        let outbox = FenceOutbox::default();

        let mut job = populated(0, 4, &[1], sim.ledger());
        let state = finalizer.prepare(&sim, &mut job, &mut FrameCache::default(), &outbox);
        assert_eq!(state, PostState::Continue);
        assert!(job.present_fence.is_none());
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_virtual_without_output_is_error() {
        let sim = SimulatedResourceManager::new();
        let finalizer = Finalizer::new(DisplayId(5), DisplayKind::Virtual);
        let mut job = populated(5, 4, &[1], sim.ledger());

        let state = finalizer.prepare(&sim, &mut job, &mut FrameCache::default(), &FenceOutbox::default());
        assert_eq!(state, PostState::Error);
        assert!(job.flags.needs_output_buffer);

        sim.set_fail_output(DisplayId(5), true);
        job.virtual_output.handle = Some(buffer(50));
        let state = finalizer.prepare(&sim, &mut job, &mut FrameCache::default(), &FenceOutbox::default());
        assert_eq!(state, PostState::Error);
    }

    #[test]
    fn test_finish_submits_and_collects_release_fences() {
        let sim = SimulatedResourceManager::new();
        let ledger = sim.ledger().clone();
        let finalizer = Finalizer::new(DisplayId(0), DisplayKind::Physical);
        let outbox = FenceOutbox::default();

        let mut job = populated(0, 2, &[1, 2, 3], &ledger);
        let state = finalizer.prepare(&sim, &mut job, &mut FrameCache::default(), &outbox);
        job.finalize(state);
        finalizer.finish(&sim, &mut job, &outbox).unwrap();

        let entries = outbox.take();
        let releases: Vec<_> = entries
            .iter()
            .filter_map(|entry| match entry.role {
                FenceRole::Release { z_order } => z_order,
                _ => None,
            })
            .collect();
        assert_eq!(releases, vec![1, 2]);
        assert!(entries.iter().any(|entry| entry.role == FenceRole::Present));
        assert_eq!(sim.triggered_sequences(DisplayId(0)), vec![1]);
        assert_eq!(
            sim.count_calls(|call| matches!(call, SimCall::PrepareInput { .. })),
            2
        );

        // Present fence is kept for the next frame's chain
        assert_eq!(job.fence_count(), 1, "software layer keeps its acquire fence");
        drop(entries);
        drop(job);
        finalizer.reset_chain();
        assert_eq!(ledger.open_count(), 0);
    }

    #[test]
    fn test_couple_mirror_duplicates_and_remaps() {
        let ledger = FenceLedger::new();
        let mut source = CompositionJob::new(DisplayId(0), 4);
        source.begin(3, 1);
        source.mirror_output = BufferDescriptor {
            handle: Some(buffer(77)),
            acquire: Some(ledger.create_signaled()),
            interface: Some(ledger.create_signaled()),
            ..Default::default()
        };
        let snapshot = MirrorSnapshot::capture(&source).unwrap();

        let mut sink = CompositionJob::new(DisplayId(1), 4);
        Finalizer::couple_mirror(&snapshot, &mut sink, PixelFormat::Rgb565).unwrap();

        let input = &sink.mirror_input;
        assert_eq!(input.handle.as_ref().unwrap().id, 77);
        assert_eq!(input.handle.as_ref().unwrap().format, PixelFormat::Rgb565);
        assert!(input.import.remapped);
        assert!(input.acquire.is_some());
        assert!(input.interface.is_none());
        assert!(input.release.is_some());

        // Every copy is independent of the source job
        drop(source);
        drop(snapshot);
        assert_eq!(ledger.open_count(), 2);
        drop(sink);
        assert_eq!(ledger.open_count(), 0);
    }

    #[test]
    fn test_capture_without_output_fails() {
        let job = CompositionJob::new(DisplayId(0), 4);
        assert!(matches!(
            MirrorSnapshot::capture(&job),
            Err(DispatchError::MirrorUnavailable(_))
        ));
    }
}

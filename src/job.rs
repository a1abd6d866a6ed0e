//! Composition jobs
//!
//! A [`CompositionJob`] is the per-frame, per-display unit of work. The host
//! fills its Z-ordered visible-layer list, the HRT engine maps those layers
//! onto the job's fixed array of [`LayerSlot`]s, the finalizer exchanges
//! fences around it, and the dispatch worker consumes it.
//!
//! Jobs live in a [`JobPool`](crate::pool::JobPool) and are reused across
//! frames; [`CompositionJob::reset`] returns one to its pristine state and
//! closes every fence it still holds.

use log::debug;
use std::io;

use crate::cpu::CpuClass;
use crate::display::{DisplayId, PixelFormat};
use crate::error::invariant_violation;
use crate::fence::FenceHandle;
use crate::hrt::{DisplayAssignment, SoftwareRange};
use crate::hwrm::PresentFence;

/// Axis-aligned rectangle in display coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }
}

/// Opaque native buffer reference
///
/// The underlying allocation is reference counted by the OS; cloning the
/// handle takes another reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    /// Stable allocation id ("pool id" in the previous-frame cache)
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl BufferHandle {
    pub fn new(id: u64, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            id,
            width,
            height,
            format,
        }
    }
}

/// Metadata produced when a buffer is imported by the resource manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportMeta {
    pub stride: u32,
    /// Format was rewritten to match the consumer
    pub remapped: bool,
}

/// One buffer exchanged with the resource manager or a mirror peer
#[derive(Debug, Default)]
pub struct BufferDescriptor {
    pub handle: Option<BufferHandle>,
    pub import: ImportMeta,
    /// Signals when the producer finished writing
    pub acquire: Option<FenceHandle>,
    /// Signals when the consumer stopped reading
    pub release: Option<FenceHandle>,
    /// Signals when the frame using this buffer hit the screen
    pub present: Option<FenceHandle>,
    /// Signals when the hardware interface finished with the buffer
    pub interface: Option<FenceHandle>,
}

impl BufferDescriptor {
    /// Whether a buffer is attached
    pub fn is_set(&self) -> bool {
        self.handle.is_some()
    }

    /// Copies the descriptor with freshly duplicated fences
    pub fn duplicate(&self) -> io::Result<BufferDescriptor> {
        Ok(BufferDescriptor {
            handle: self.handle.clone(),
            import: self.import,
            acquire: dup_opt(&self.acquire)?,
            release: dup_opt(&self.release)?,
            present: dup_opt(&self.present)?,
            interface: dup_opt(&self.interface)?,
        })
    }

    /// Number of fences held
    pub fn fence_count(&self) -> usize {
        [&self.acquire, &self.release, &self.present, &self.interface]
            .iter()
            .filter(|fence| fence.is_some())
            .count()
    }

    /// Drops everything, returning how many fences were closed
    pub fn reset(&mut self) -> usize {
        let closed = self.fence_count();
        *self = BufferDescriptor::default();
        closed
    }
}

pub(crate) fn dup_opt(fence: &Option<FenceHandle>) -> io::Result<Option<FenceHandle>> {
    fence.as_ref().map(FenceHandle::dup).transpose()
}

/// Layer category with its per-category payload
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LayerPayload {
    /// Plain UI content read straight from its buffer
    Ui,
    /// Video content owned by a media session
    Media { session: u64 },
    /// Solid color fill, no buffer
    DimColor { argb: u32 },
    /// Content post-processed by an inference model before scan-out
    Inference { model: u32 },
    #[default]
    Invalid,
}

/// Tag of a [`LayerPayload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerCategory {
    Ui,
    Media,
    DimColor,
    Inference,
    Invalid,
}

impl LayerPayload {
    pub fn category(&self) -> LayerCategory {
        match self {
            LayerPayload::Ui => LayerCategory::Ui,
            LayerPayload::Media { .. } => LayerCategory::Media,
            LayerPayload::DimColor { .. } => LayerCategory::DimColor,
            LayerPayload::Inference { .. } => LayerCategory::Inference,
            LayerPayload::Invalid => LayerCategory::Invalid,
        }
    }
}

/// Capability flags the HRT engine looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerCaps {
    /// Hardware inputs this layer consumes (scaled or split layers take more)
    pub hw_required: u32,
    /// Whether the hardware can take this layer at all
    pub hw_eligible: bool,
    /// Layer asks to be cleared by client composition; first to go to software
    pub wants_client_clear: bool,
    /// Protected content
    pub secure: bool,
}

impl Default for LayerCaps {
    fn default() -> Self {
        Self {
            hw_required: 1,
            hw_eligible: true,
            wants_client_clear: false,
            secure: false,
        }
    }
}

/// One entry of the host's Z-ordered visible-layer list
#[derive(Debug, Default)]
pub struct VisibleLayer {
    pub payload: LayerPayload,
    pub buffer: Option<BufferHandle>,
    pub acquire_fence: Option<FenceHandle>,
    pub source_crop: Rect,
    pub display_frame: Rect,
    pub format: Option<PixelFormat>,
    pub caps: LayerCaps,
}

impl VisibleLayer {
    /// UI layer backed by `buffer` covering `frame`
    pub fn ui(buffer: BufferHandle, frame: Rect) -> Self {
        Self {
            payload: LayerPayload::Ui,
            format: Some(buffer.format),
            source_crop: Rect::new(0, 0, buffer.width, buffer.height),
            buffer: Some(buffer),
            display_frame: frame,
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: LayerPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_acquire_fence(mut self, fence: FenceHandle) -> Self {
        self.acquire_fence = Some(fence);
        self
    }

    pub fn with_caps(mut self, caps: LayerCaps) -> Self {
        self.caps = caps;
        self
    }
}

/// Why a slot differs from the previous frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct DirtyReason(u32);

impl DirtyReason {
    pub const NONE: DirtyReason = DirtyReason(0);
    pub const NEW_LAYER: DirtyReason = DirtyReason(1 << 0);
    pub const BUFFER: DirtyReason = DirtyReason(1 << 1);
    pub const GEOMETRY: DirtyReason = DirtyReason(1 << 2);
    pub const CATEGORY: DirtyReason = DirtyReason(1 << 3);
    pub const FORCED: DirtyReason = DirtyReason(1 << 4);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: DirtyReason) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: DirtyReason) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for DirtyReason {
    type Output = DirtyReason;

    fn bitor(self, rhs: DirtyReason) -> DirtyReason {
        DirtyReason(self.0 | rhs.0)
    }
}

/// One potential hardware composition input
#[derive(Debug, Default)]
pub struct LayerSlot {
    pub enabled: bool,
    pub payload: LayerPayload,
    pub dirty: DirtyReason,
    /// Assigned hardware input, `None` means software fallback
    pub hw_index: Option<u32>,
    /// Position in the visible-layer list
    pub z_order: usize,
    pub buffer: Option<BufferHandle>,
    pub source_crop: Rect,
    pub display_frame: Rect,
    pub acquire_fence: Option<FenceHandle>,
    pub release_fence: Option<FenceHandle>,
}

impl LayerSlot {
    pub fn category(&self) -> LayerCategory {
        self.payload.category()
    }

    fn fence_count(&self) -> usize {
        self.acquire_fence.is_some() as usize + self.release_fence.is_some() as usize
    }
}

/// Outcome decided by the finalizer's `prepare`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostState {
    /// Compose and submit normally
    Continue,
    /// Nothing changed since the previous frame; the job is released unqueued
    NotDirty,
    /// Frame content comes from the mirror source's output
    Mirror,
    /// Frame cannot be produced; skipped with fences returned to their owners
    Error,
}

/// Where a job is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Free,
    Acquired,
    Populated,
    Finalized,
    Enqueued,
    Processing,
    Released,
}

/// Status flags of a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFlags {
    pub dirty_input: bool,
    pub black_frame: bool,
    pub needs_output_buffer: bool,
}

/// An acquire fence handed back to the host because its frame was skipped
#[derive(Debug)]
pub struct ReturnedFence {
    /// Position of the owning layer, `None` for an output buffer fence
    pub z_order: Option<usize>,
    pub fence: FenceHandle,
}

/// Per-frame, per-display unit of scheduling state
#[derive(Debug)]
pub struct CompositionJob {
    display: DisplayId,
    pool_index: usize,
    generation: u64,
    sequence: u64,
    state: JobState,
    pub enabled: bool,
    pub(crate) mirror_source: Option<DisplayId>,
    pub(crate) mirror_sinks: usize,
    visible: Vec<VisibleLayer>,
    slots: Vec<LayerSlot>,
    num_layers: usize,
    software_range: Option<SoftwareRange>,
    resources_valid: bool,
    resources_assigned: bool,
    /// Receives the software-fallback composition
    pub client_target: BufferDescriptor,
    /// Source output consumed when this display mirrors another
    pub mirror_input: BufferDescriptor,
    /// Writeback output published to mirror sinks
    pub mirror_output: BufferDescriptor,
    /// Host-supplied output of a virtual display
    pub virtual_output: BufferDescriptor,
    pub flags: JobFlags,
    post_state: Option<PostState>,
    pub cpu_class: CpuClass,
    pub(crate) present_fence: Option<PresentFence>,
}

impl CompositionJob {
    /// Creates a free job with `max_inputs` layer slots
    pub fn new(display: DisplayId, max_inputs: usize) -> Self {
        Self::pooled(display, max_inputs, 0)
    }

    pub(crate) fn pooled(display: DisplayId, max_inputs: usize, pool_index: usize) -> Self {
        Self {
            display,
            pool_index,
            generation: 0,
            sequence: 0,
            state: JobState::Free,
            enabled: false,
            mirror_source: None,
            mirror_sinks: 0,
            visible: Vec::new(),
            slots: (0..max_inputs).map(|_| LayerSlot::default()).collect(),
            num_layers: 0,
            software_range: None,
            resources_valid: true,
            resources_assigned: false,
            client_target: BufferDescriptor::default(),
            mirror_input: BufferDescriptor::default(),
            mirror_output: BufferDescriptor::default(),
            virtual_output: BufferDescriptor::default(),
            flags: JobFlags::default(),
            post_state: None,
            cpu_class: CpuClass::Default,
            present_fence: None,
        }
    }

    pub fn display(&self) -> DisplayId {
        self.display
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub(crate) fn pool_index(&self) -> usize {
        self.pool_index
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_state(&mut self, state: JobState) {
        self.state = state;
    }

    /// Marks the job acquired for a new frame
    pub(crate) fn begin(&mut self, sequence: u64, generation: u64) {
        self.sequence = sequence;
        self.generation = generation;
        self.enabled = true;
        self.state = JobState::Acquired;
    }

    /// Display this job mirrors, if any
    pub fn mirror_source(&self) -> Option<DisplayId> {
        self.mirror_source
    }

    /// Maximum hardware inputs of the owning display
    pub fn max_inputs(&self) -> usize {
        self.slots.len()
    }

    /// Appends a layer on top of the current Z order
    pub fn push_layer(&mut self, layer: VisibleLayer) {
        self.visible.push(layer);
        self.resources_assigned = false;
        if self.state == JobState::Acquired {
            self.state = JobState::Populated;
        }
    }

    pub fn visible_layers(&self) -> &[VisibleLayer] {
        &self.visible
    }

    pub fn visible_layers_mut(&mut self) -> &mut [VisibleLayer] {
        &mut self.visible
    }

    pub fn slots(&self) -> &[LayerSlot] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [LayerSlot] {
        &mut self.slots
    }

    /// Hardware inputs in use after assignment
    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn software_range(&self) -> Option<SoftwareRange> {
        self.software_range
    }

    /// `false` when the resource query rejected this display for the frame
    pub fn resources_valid(&self) -> bool {
        self.resources_valid
    }

    pub fn resources_assigned(&self) -> bool {
        self.resources_assigned
    }

    pub fn post_state(&self) -> Option<PostState> {
        self.post_state
    }

    pub(crate) fn finalize(&mut self, post_state: PostState) {
        self.post_state = Some(post_state);
        self.state = JobState::Finalized;
    }

    /// Writes an HRT result into the layer slots.
    ///
    /// Acquire fences move from the visible layers into their slots. Running
    /// it again first moves them back, so re-assignment within one frame is
    /// allowed.
    pub fn apply_assignment(&mut self, assignment: &DisplayAssignment) {
        if assignment.display != self.display {
            invariant_violation(format_args!(
                "assignment for display {} applied to job of display {}",
                assignment.display, self.display
            ));
        }
        if assignment.hw_indices.len() != self.visible.len() {
            invariant_violation(format_args!(
                "assignment covers {} layers, job of display {} has {}",
                assignment.hw_indices.len(),
                self.display,
                self.visible.len()
            ));
        }

        self.clear_slots();

        let max = self.slots.len();
        let mut used = 0usize;
        for (z, hw_index) in assignment.hw_indices.iter().enumerate() {
            let Some(hw_index) = *hw_index else { continue };
            let layer = &mut self.visible[z];
            let start = hw_index as usize;
            let end = start + layer.caps.hw_required.max(1) as usize;
            if end > max {
                invariant_violation(format_args!(
                    "layer {} needs hardware inputs up to {} but display {} has {}",
                    z, end, self.display, max
                ));
            }
            let slot = &mut self.slots[start];
            if slot.enabled {
                invariant_violation(format_args!(
                    "hardware input {} assigned twice on display {}",
                    start, self.display
                ));
            }
            slot.enabled = true;
            slot.payload = layer.payload.clone();
            slot.hw_index = Some(hw_index);
            slot.z_order = z;
            slot.buffer = layer.buffer.clone();
            slot.source_crop = layer.source_crop;
            slot.display_frame = layer.display_frame;
            slot.acquire_fence = layer.acquire_fence.take();
            used = used.max(end);
        }

        self.num_layers = used;
        self.software_range = assignment.software_range;
        self.resources_valid = assignment.valid;
        self.resources_assigned = true;
        self.flags.black_frame = self.visible.is_empty() && !self.mirror_input.is_set();

        debug!(
            "🧩 display {} job #{}: {} hw inputs, software range {:?}",
            self.display, self.sequence, self.num_layers, self.software_range
        );
    }

    fn clear_slots(&mut self) {
        for slot in &mut self.slots {
            if slot.enabled {
                if let Some(layer) = self.visible.get_mut(slot.z_order) {
                    if layer.acquire_fence.is_none() {
                        layer.acquire_fence = slot.acquire_fence.take();
                    }
                }
            }
            *slot = LayerSlot::default();
        }
        self.num_layers = 0;
    }

    /// Moves every acquire fence out of the job so it can go back to its owner
    pub fn take_acquire_fences(&mut self) -> Vec<ReturnedFence> {
        let mut fences = Vec::new();
        for (z, layer) in self.visible.iter_mut().enumerate() {
            if let Some(fence) = layer.acquire_fence.take() {
                fences.push(ReturnedFence {
                    z_order: Some(z),
                    fence,
                });
            }
        }
        for slot in &mut self.slots {
            if let Some(fence) = slot.acquire_fence.take() {
                fences.push(ReturnedFence {
                    z_order: Some(slot.z_order),
                    fence,
                });
            }
        }
        for descriptor in [&mut self.virtual_output, &mut self.client_target] {
            if let Some(fence) = descriptor.acquire.take() {
                fences.push(ReturnedFence {
                    z_order: None,
                    fence,
                });
            }
        }
        fences.sort_by_key(|returned| returned.z_order);
        fences
    }

    /// Number of fences still held anywhere in the job
    pub fn fence_count(&self) -> usize {
        let visible: usize = self
            .visible
            .iter()
            .map(|layer| layer.acquire_fence.is_some() as usize)
            .sum();
        let slots: usize = self.slots.iter().map(LayerSlot::fence_count).sum();
        let descriptors = self.client_target.fence_count()
            + self.mirror_input.fence_count()
            + self.mirror_output.fence_count()
            + self.virtual_output.fence_count();
        visible + slots + descriptors + self.present_fence.is_some() as usize
    }

    /// Returns the job to its free state, closing every fence it holds.
    ///
    /// Returns the number of fences that were closed here rather than
    /// transferred earlier.
    pub fn reset(&mut self) -> usize {
        let closed = self.fence_count();
        if closed > 0 {
            debug!(
                "🧹 display {} job #{}: closing {} fences on release",
                self.display, self.sequence, closed
            );
        }

        self.visible.clear();
        for slot in &mut self.slots {
            *slot = LayerSlot::default();
        }
        self.client_target.reset();
        self.mirror_input.reset();
        self.mirror_output.reset();
        self.virtual_output.reset();
        self.present_fence = None;
        self.enabled = false;
        self.mirror_source = None;
        self.mirror_sinks = 0;
        self.num_layers = 0;
        self.software_range = None;
        self.resources_valid = true;
        self.resources_assigned = false;
        self.flags = JobFlags::default();
        self.post_state = None;
        self.cpu_class = CpuClass::Default;
        self.state = JobState::Free;
        closed
    }
}

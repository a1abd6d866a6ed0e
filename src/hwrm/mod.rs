//! Hardware-resource manager interface
//!
//! The manager programs the composition hardware. It lives outside this
//! crate; the scheduler only talks to it through [`HardwareResourceManager`].
//! Every call is synchronous and may block on kernel I/O.
//!
//! [`sim::SimulatedResourceManager`] is a deterministic in-process
//! implementation used by the tests and the `hwc-dispatch` binary.

pub mod sim;

use crate::display::{DisplayId, DisplayKind};
use crate::error::{DispatchError, Result};
use crate::fence::FenceHandle;
use crate::hrt::{HrtLayer, SoftwareRange};
use crate::job::{BufferDescriptor, BufferHandle, LayerCategory};

/// One display inside a batched placement query
#[derive(Debug, Clone)]
pub struct PlacementEntry {
    pub display: DisplayId,
    pub max_inputs: usize,
    pub layers: Vec<HrtLayer>,
}

/// Every visible layer of every querying display, serialized for one call
#[derive(Debug, Clone, Default)]
pub struct PlacementRequest {
    pub entries: Vec<PlacementEntry>,
}

/// Manager's answer for one display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementVerdict {
    pub display: DisplayId,
    pub feasible: bool,
    pub hw_indices: Vec<Option<u32>>,
}

/// Present fence for the upcoming frame and its timeline index
#[derive(Debug)]
pub struct PresentFence {
    pub index: u64,
    pub fence: FenceHandle,
}

/// A hardware input of a submitted frame
#[derive(Debug)]
pub struct TriggerInput {
    pub hw_index: u32,
    pub z_order: usize,
    pub category: LayerCategory,
    pub buffer: Option<BufferHandle>,
    /// Ownership moves to the manager, which waits on it before reading
    pub acquire_fence: Option<FenceHandle>,
}

/// Output buffer of a submitted frame
#[derive(Debug)]
pub struct TriggerOutput {
    pub buffer: BufferHandle,
    /// Hardware waits on it before writing into the buffer
    pub ready_fence: Option<FenceHandle>,
}

/// Software-composed layers, delivered as one buffer
#[derive(Debug)]
pub struct ClientTargetInput {
    pub range: SoftwareRange,
    pub buffer: BufferHandle,
    pub acquire_fence: Option<FenceHandle>,
}

/// Final configuration of one frame
#[derive(Debug)]
pub struct TriggerRequest {
    pub display: DisplayId,
    pub sequence: u64,
    pub present_fence_index: Option<u64>,
    /// Previous frame's present fence, chained into this submission
    pub prev_present_fence: Option<FenceHandle>,
    pub inputs: Vec<TriggerInput>,
    pub client_target: Option<ClientTargetInput>,
    pub output: Option<TriggerOutput>,
    pub black_frame: bool,
}

/// Fences returned by a submission
#[derive(Debug, Default)]
pub struct TriggerOutcome {
    /// Per hardware input: signals when the input buffer may be reused
    pub release_fences: Vec<(u32, FenceHandle)>,
    /// Signals when the output buffer (virtual / writeback) is complete
    pub retire_fence: Option<FenceHandle>,
}

/// Low-level composition hardware programmer
pub trait HardwareResourceManager: Send + Sync {
    /// Opens a hardware session for a newly plugged display
    fn create_session(&self, display: DisplayId, kind: DisplayKind) -> Result<()>;

    /// Closes the display's session
    fn destroy_session(&self, display: DisplayId);

    /// Hardware inputs available to the display
    fn query_available_input_count(&self, display: DisplayId) -> Result<usize>;

    /// Whether `query_placement` can answer for this display
    fn supports_placement_query(&self, _display: DisplayId) -> bool {
        false
    }

    /// Batched overlap/placement feasibility query
    fn query_placement(&self, _request: &PlacementRequest) -> Result<Vec<PlacementVerdict>> {
        Err(DispatchError::Hardware("placement query not supported".to_string()))
    }

    /// Imports one input buffer ahead of submission
    fn prepare_input(&self, display: DisplayId, hw_index: u32, buffer: &BufferHandle) -> Result<()>;

    /// Imports (or allocates, for writeback) an output buffer and fills in
    /// its fences
    fn prepare_output(&self, display: DisplayId, output: &mut BufferDescriptor) -> Result<()>;

    /// Present fence for the next frame
    fn prepare_present_fence(&self, display: DisplayId) -> Result<PresentFence>;

    /// Submits a frame
    fn trigger(&self, request: TriggerRequest) -> Result<TriggerOutcome>;

    /// Blocks until every submitted frame of the display completed
    fn wait_all_job_done(&self, display: DisplayId) -> Result<()>;
}

//! Simulated hardware-resource manager
//!
//! Answers every call in-process with synthetic fences from a shared
//! [`FenceLedger`], records the calls it received, and can be told to fail
//! specific operations or to hold submissions until released.

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::{
    HardwareResourceManager, PlacementRequest, PlacementVerdict, PresentFence, TriggerOutcome,
    TriggerRequest,
};
use crate::display::{DisplayId, DisplayKind, PixelFormat};
use crate::error::{DispatchError, Result};
use crate::fence::FenceLedger;
use crate::hrt::{self, HrtDisplay};
use crate::job::{BufferDescriptor, BufferHandle};

/// Inputs a display gets unless configured otherwise
pub const DEFAULT_INPUT_COUNT: usize = 4;

/// How the simulator answers placement queries for a display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementBehavior {
    /// Answer with the greedy assignment
    #[default]
    Greedy,
    /// Report the display infeasible
    Infeasible,
    /// Fail the whole batched call
    Fail,
}

/// Call received by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    CreateSession(DisplayId),
    DestroySession(DisplayId),
    QueryPlacement(Vec<DisplayId>),
    PrepareInput { display: DisplayId, hw_index: u32, buffer: u64 },
    PrepareOutput(DisplayId),
    PreparePresentFence(DisplayId),
    Trigger { display: DisplayId, sequence: u64, inputs: usize },
    WaitAllJobDone(DisplayId),
}

#[derive(Debug, Clone, Copy)]
struct SimDisplay {
    input_count: usize,
    supports_query: bool,
    placement: PlacementBehavior,
    fail_present_fence: bool,
    fail_output: bool,
    fail_trigger: bool,
}

impl Default for SimDisplay {
    fn default() -> Self {
        Self {
            input_count: DEFAULT_INPUT_COUNT,
            supports_query: false,
            placement: PlacementBehavior::Greedy,
            fail_present_fence: false,
            fail_output: false,
            fail_trigger: false,
        }
    }
}

#[derive(Default)]
struct SimState {
    displays: HashMap<DisplayId, SimDisplay>,
    sessions: HashSet<DisplayId>,
    calls: Vec<SimCall>,
    present_index: u64,
    /// Per accepted submission: whether a previous present fence was chained
    chained: HashMap<DisplayId, Vec<bool>>,
    next_buffer_id: u64,
    trigger_delay: Duration,
}

/// In-process stand-in for the composition hardware
pub struct SimulatedResourceManager {
    ledger: FenceLedger,
    state: Mutex<SimState>,
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl Default for SimulatedResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedResourceManager {
    pub fn new() -> Self {
        Self::with_ledger(FenceLedger::new())
    }

    /// Issues fences from `ledger` so callers can audit them
    pub fn with_ledger(ledger: FenceLedger) -> Self {
        Self {
            ledger,
            state: Mutex::new(SimState {
                next_buffer_id: 1 << 32,
                ..Default::default()
            }),
            paused: Mutex::new(false),
            resumed: Condvar::new(),
        }
    }

    pub fn ledger(&self) -> &FenceLedger {
        &self.ledger
    }

    fn configure(&self, display: DisplayId, f: impl FnOnce(&mut SimDisplay)) {
        let mut state = self.state.lock();
        f(state.displays.entry(display).or_default());
    }

    fn display(&self, display: DisplayId) -> SimDisplay {
        self.state.lock().displays.get(&display).copied().unwrap_or_default()
    }

    pub fn set_input_count(&self, display: DisplayId, count: usize) {
        self.configure(display, |d| d.input_count = count);
    }

    pub fn set_supports_query(&self, display: DisplayId, supported: bool) {
        self.configure(display, |d| d.supports_query = supported);
    }

    pub fn set_placement_behavior(&self, display: DisplayId, behavior: PlacementBehavior) {
        self.configure(display, |d| d.placement = behavior);
    }

    pub fn set_fail_present_fence(&self, display: DisplayId, fail: bool) {
        self.configure(display, |d| d.fail_present_fence = fail);
    }

    pub fn set_fail_output(&self, display: DisplayId, fail: bool) {
        self.configure(display, |d| d.fail_output = fail);
    }

    /// Rejects every submission for `display`
    pub fn set_fail_trigger(&self, display: DisplayId, fail: bool) {
        self.configure(display, |d| d.fail_trigger = fail);
    }

    /// Every submission sleeps this long
    pub fn set_trigger_delay(&self, delay: Duration) {
        self.state.lock().trigger_delay = delay;
    }

    /// Holds every `trigger` call until [`resume_triggers`](Self::resume_triggers)
    pub fn pause_triggers(&self) {
        *self.paused.lock() = true;
    }

    pub fn resume_triggers(&self) {
        *self.paused.lock() = false;
        self.resumed.notify_all();
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }

    pub fn placement_queries(&self) -> usize {
        self.count_calls(|call| matches!(call, SimCall::QueryPlacement(_)))
    }

    /// Sequence numbers submitted for `display`, in submission order
    pub fn triggered_sequences(&self, display: DisplayId) -> Vec<u64> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                SimCall::Trigger {
                    display: d,
                    sequence,
                    ..
                } if *d == display => Some(*sequence),
                _ => None,
            })
            .collect()
    }

    /// Whether each accepted submission carried the previous present fence
    pub fn chained_present_fences(&self, display: DisplayId) -> Vec<bool> {
        self.state.lock().chained.get(&display).cloned().unwrap_or_default()
    }

    pub fn count_calls(&self, predicate: impl Fn(&SimCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    pub fn has_session(&self, display: DisplayId) -> bool {
        self.state.lock().sessions.contains(&display)
    }

    fn record(&self, call: SimCall) {
        trace!("sim: {:?}", call);
        self.state.lock().calls.push(call);
    }

    fn wait_resumed(&self) {
        let mut paused = self.paused.lock();
        while *paused {
            self.resumed.wait(&mut paused);
        }
    }
}

impl HardwareResourceManager for SimulatedResourceManager {
    fn create_session(&self, display: DisplayId, kind: DisplayKind) -> Result<()> {
        debug!("sim: session for display {} ({:?})", display, kind);
        self.record(SimCall::CreateSession(display));
        self.state.lock().sessions.insert(display);
        Ok(())
    }

    fn destroy_session(&self, display: DisplayId) {
        self.record(SimCall::DestroySession(display));
        self.state.lock().sessions.remove(&display);
    }

    fn query_available_input_count(&self, display: DisplayId) -> Result<usize> {
        Ok(self.display(display).input_count)
    }

    fn supports_placement_query(&self, display: DisplayId) -> bool {
        self.display(display).supports_query
    }

    fn query_placement(&self, request: &PlacementRequest) -> Result<Vec<PlacementVerdict>> {
        self.record(SimCall::QueryPlacement(
            request.entries.iter().map(|entry| entry.display).collect(),
        ));

        let mut verdicts = Vec::with_capacity(request.entries.len());
        for entry in &request.entries {
            match self.display(entry.display).placement {
                PlacementBehavior::Fail => {
                    return Err(DispatchError::Hardware(format!(
                        "placement query rejected for display {}",
                        entry.display
                    )));
                }
                PlacementBehavior::Infeasible => verdicts.push(PlacementVerdict {
                    display: entry.display,
                    feasible: false,
                    hw_indices: vec![None; entry.layers.len()],
                }),
                PlacementBehavior::Greedy => {
                    let assignment = hrt::simplified(&HrtDisplay {
                        display: entry.display,
                        max_inputs: entry.max_inputs,
                        connected: true,
                        mirrored: false,
                        supports_query: true,
                        layers: entry.layers.clone(),
                    });
                    verdicts.push(PlacementVerdict {
                        display: entry.display,
                        feasible: true,
                        hw_indices: assignment.hw_indices,
                    });
                }
            }
        }
        Ok(verdicts)
    }

    fn prepare_input(&self, display: DisplayId, hw_index: u32, buffer: &BufferHandle) -> Result<()> {
        self.record(SimCall::PrepareInput {
            display,
            hw_index,
            buffer: buffer.id,
        });
        Ok(())
    }

    fn prepare_output(&self, display: DisplayId, output: &mut BufferDescriptor) -> Result<()> {
        self.record(SimCall::PrepareOutput(display));
        if self.display(display).fail_output {
            return Err(DispatchError::Hardware(format!(
                "output import failed for display {}",
                display
            )));
        }

        if output.handle.is_none() {
            let id = {
                let mut state = self.state.lock();
                state.next_buffer_id += 1;
                state.next_buffer_id
            };
            output.handle = Some(BufferHandle::new(id, 1920, 1080, PixelFormat::Rgba8888));
        }
        if let Some(handle) = &output.handle {
            output.import.stride = handle.width * handle.format.bytes_per_pixel();
        }
        if output.acquire.is_none() {
            output.acquire = Some(self.ledger.create_signaled());
        }
        output.interface = Some(self.ledger.create_signaled());
        Ok(())
    }

    fn prepare_present_fence(&self, display: DisplayId) -> Result<PresentFence> {
        self.record(SimCall::PreparePresentFence(display));
        if self.display(display).fail_present_fence {
            return Err(DispatchError::Hardware(format!(
                "present fence unavailable for display {}",
                display
            )));
        }
        let index = {
            let mut state = self.state.lock();
            state.present_index += 1;
            state.present_index
        };
        Ok(PresentFence {
            index,
            fence: self.ledger.create_signaled(),
        })
    }

    fn trigger(&self, request: TriggerRequest) -> Result<TriggerOutcome> {
        self.wait_resumed();
        let delay = self.state.lock().trigger_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        if self.display(request.display).fail_trigger {
            return Err(DispatchError::Hardware(format!(
                "simulated submission failure on display {}",
                request.display
            )));
        }

        self.record(SimCall::Trigger {
            display: request.display,
            sequence: request.sequence,
            inputs: request.inputs.len(),
        });
        self.state
            .lock()
            .chained
            .entry(request.display)
            .or_default()
            .push(request.prev_present_fence.is_some());

        let release_fences = request
            .inputs
            .iter()
            .map(|input| (input.hw_index, self.ledger.create_signaled()))
            .collect();
        let retire_fence = request.output.as_ref().map(|_| self.ledger.create_signaled());

        // Acquire, output-ready and previous-present fences are consumed here
        drop(request);

        Ok(TriggerOutcome {
            release_fences,
            retire_fence,
        })
    }

    fn wait_all_job_done(&self, display: DisplayId) -> Result<()> {
        self.record(SimCall::WaitAllJobDone(display));
        Ok(())
    }
}

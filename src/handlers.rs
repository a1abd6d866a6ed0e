//! Per-category layer dispatch
//!
//! Every layer slot carries a [`LayerPayload`]. The dispatch worker calls
//! [`compose_job`] for jobs it submits and [`cancel_job`] for jobs it
//! discards; both match on the payload and forward to the external
//! [`LayerFeatures`] hooks. UI layers need no extra work.

use log::{trace, warn};

use crate::display::DisplayId;
use crate::error::Result;
use crate::job::{CompositionJob, LayerPayload, LayerSlot, Rect};

/// Hooks into the media, inference and dim-color feature code.
///
/// All methods default to no-ops so implementors only override the
/// categories they own.
pub trait LayerFeatures: Send + Sync {
    /// Hands a media layer's buffer to its session for this frame
    fn compose_media(&self, _display: DisplayId, _session: u64, _slot: &LayerSlot) -> Result<()> {
        Ok(())
    }

    /// Stops in-flight media work for a discarded frame
    fn cancel_media(&self, _display: DisplayId, _session: u64) {}

    /// Runs the inference model over the layer before scan-out
    fn run_inference(&self, _display: DisplayId, _model: u32, _slot: &LayerSlot) -> Result<()> {
        Ok(())
    }

    fn cancel_inference(&self, _display: DisplayId, _model: u32) {}

    /// Programs a solid fill
    fn fill_dim(&self, _display: DisplayId, _argb: u32, _frame: Rect) -> Result<()> {
        Ok(())
    }
}

/// Feature hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFeatures;

impl LayerFeatures for NoopFeatures {}

/// Runs the composition step of one enabled slot
pub fn compose_slot(features: &dyn LayerFeatures, display: DisplayId, slot: &mut LayerSlot) -> Result<()> {
    match slot.payload {
        LayerPayload::Ui => Ok(()),
        LayerPayload::Media { session } => features.compose_media(display, session, slot),
        LayerPayload::Inference { model } => features.run_inference(display, model, slot),
        LayerPayload::DimColor { argb } => features.fill_dim(display, argb, slot.display_frame),
        LayerPayload::Invalid => {
            warn!(
                "⚠️ display {}: slot at z {} has no category, disabling it",
                display, slot.z_order
            );
            slot.enabled = false;
            Ok(())
        }
    }
}

/// Runs the cleanup a discarded slot needs
pub fn cancel_slot(features: &dyn LayerFeatures, display: DisplayId, slot: &LayerSlot) {
    match slot.payload {
        LayerPayload::Media { session } => features.cancel_media(display, session),
        LayerPayload::Inference { model } => features.cancel_inference(display, model),
        LayerPayload::Ui | LayerPayload::DimColor { .. } | LayerPayload::Invalid => {}
    }
}

/// Composes every enabled slot of `job`.
///
/// Keeps going after a failing slot and returns the first error.
pub fn compose_job(features: &dyn LayerFeatures, job: &mut CompositionJob) -> Result<()> {
    let display = job.display();
    let mut first_error = None;
    for slot in job.slots_mut().iter_mut().filter(|slot| slot.enabled) {
        if let Err(e) = compose_slot(features, display, slot) {
            warn!(
                "⚠️ display {}: {:?} layer at z {} failed: {}",
                display,
                slot.category(),
                slot.z_order,
                e
            );
            first_error.get_or_insert(e);
        }
    }
    trace!("display {}: composed job #{}", display, job.sequence());
    first_error.map_or(Ok(()), Err)
}

/// Runs the cancel hooks of every enabled slot of a discarded job
pub fn cancel_job(features: &dyn LayerFeatures, job: &CompositionJob) {
    let display = job.display();
    for slot in job.slots().iter().filter(|slot| slot.enabled) {
        cancel_slot(features, display, slot);
    }
}

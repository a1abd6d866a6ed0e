//! Per-display worker cluster
//!
//! A [`WorkerCluster`] bundles everything one display needs: its job pool,
//! dispatch worker, finalizer, previous-frame cache, release-fence outbox
//! and statistics. The host-facing half (`get_job`, `set_job`, `trigger`)
//! runs under the cluster's state lock; the worker-facing half lives in
//! [`ClusterCore`], which the dispatch worker drives as its
//! [`JobProcessor`].
//!
//! Lock order inside a cluster is state, then pool. Across clusters it is
//! mirror source, then sink, and only through [`MirrorTransaction`].

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::DispatchConfig;
use crate::display::{DisplayId, DisplayInfo, SessionMode};
use crate::error::{DispatchError, Result};
use crate::finalizer::{FenceOutbox, Finalizer, FrameCache, MirrorSnapshot, OutboxEntry};
use crate::handlers::{self, LayerFeatures};
use crate::hrt::{self, DisplayAssignment, HrtDisplay, HrtLayer};
use crate::hwrm::HardwareResourceManager;
use crate::job::{BufferDescriptor, CompositionJob, PostState, ReturnedFence};
use crate::pool::JobPool;
use crate::stats::{ClusterCounters, ClusterStats};
use crate::worker::{DispatchWorker, JobProcessor, Watermarks};

/// Result of finalizing a display's job
#[derive(Debug)]
pub enum SetJobOutcome {
    /// Finalized and waiting for `trigger`
    Ready(PostState),
    /// Nothing changed; the job went straight back to the pool
    NotDirty,
    /// Frame skipped; acquire fences go back to their owners
    Skipped { returned: Vec<ReturnedFence> },
}

impl SetJobOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, SetJobOutcome::Ready(_))
    }
}

struct ClusterState {
    enabled: bool,
    pending: Option<Box<CompositionJob>>,
    cache: FrameCache,
    session_mode: SessionMode,
    vsync_paced: bool,
    mirror_sinks: BTreeSet<DisplayId>,
    /// Last source publication this display consumed as a mirror sink
    mirror_seen: u64,
    /// Set after a mirror timeout: the next frame ignores source output
    /// published before its `get_job`
    mirror_resync: bool,
    /// When the held job was acquired
    pending_since: Instant,
}

#[derive(Default)]
struct MirrorSlot {
    generation: u64,
    /// `None` when the source had no output for that frame
    latest: Option<Arc<MirrorSnapshot>>,
    published_at: Option<Instant>,
}

/// One output a mirror source published
pub(crate) struct MirrorPublication {
    pub generation: u64,
    pub snapshot: Option<Arc<MirrorSnapshot>>,
    pub published_at: Instant,
}

/// Where a mirror source publishes its finalized output
#[derive(Default)]
struct MirrorChannel {
    slot: Mutex<MirrorSlot>,
    published: Condvar,
}

impl MirrorChannel {
    fn publish(&self, snapshot: Option<Arc<MirrorSnapshot>>) {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        slot.latest = snapshot;
        slot.published_at = Some(Instant::now());
        self.published.notify_all();
    }

    fn generation(&self) -> u64 {
        self.slot.lock().generation
    }

    fn wait_after(&self, seen: u64, timeout: Duration) -> Option<MirrorPublication> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while slot.generation <= seen {
            if self.published.wait_until(&mut slot, deadline).timed_out() && slot.generation <= seen {
                return None;
            }
        }
        Some(MirrorPublication {
            generation: slot.generation,
            snapshot: slot.latest.clone(),
            published_at: slot.published_at.unwrap_or_else(Instant::now),
        })
    }
}

/// Worker-side half of a cluster
pub struct ClusterCore {
    display: DisplayId,
    pool: Mutex<JobPool>,
    finalizer: Finalizer,
    features: Arc<dyn LayerFeatures>,
    hwrm: Arc<dyn HardwareResourceManager>,
    outbox: FenceOutbox,
    counters: Arc<ClusterCounters>,
}

impl JobProcessor for ClusterCore {
    fn process(&self, job: &mut CompositionJob) -> Result<()> {
        let composed = if job.post_state() == Some(PostState::Mirror) {
            Ok(())
        } else {
            handlers::compose_job(self.features.as_ref(), job)
        };
        self.finalizer.finish(self.hwrm.as_ref(), job, &self.outbox)?;
        composed
    }

    fn discard(&self, job: &mut CompositionJob) {
        handlers::cancel_job(self.features.as_ref(), job);
    }

    fn release(&self, job: Box<CompositionJob>) {
        if let Err(e) = self.pool.lock().release(job) {
            error!("❌ display {}: {}", self.display, e);
            ClusterCounters::bump(&self.counters.errors);
        }
    }
}

/// Everything one connected display owns
pub struct WorkerCluster {
    info: DisplayInfo,
    max_inputs: usize,
    mirror_wait: Duration,
    core: Arc<ClusterCore>,
    state: Mutex<ClusterState>,
    mirror: MirrorChannel,
    worker: RwLock<Option<DispatchWorker>>,
}

impl WorkerCluster {
    /// Builds the cluster and starts its dispatch worker
    pub fn start(
        info: DisplayInfo,
        max_inputs: usize,
        config: &DispatchConfig,
        hwrm: Arc<dyn HardwareResourceManager>,
        features: Arc<dyn LayerFeatures>,
    ) -> Result<Self> {
        let display = info.id;
        let counters = Arc::new(ClusterCounters::default());
        let core = Arc::new(ClusterCore {
            display,
            pool: Mutex::new(JobPool::new(display, max_inputs, config.pool.size)),
            finalizer: Finalizer::new(display, info.kind),
            features,
            hwrm,
            outbox: FenceOutbox::with_limit(config.queue.outbox_limit),
            counters: Arc::clone(&counters),
        });

        let worker = DispatchWorker::spawn(
            display,
            Watermarks::from(&config.queue),
            config.cpu.clone(),
            counters,
            Arc::clone(&core) as Arc<dyn JobProcessor>,
        )?;

        info!(
            "🖥️ display {} ({}, {:?}) enabled with {} hardware inputs",
            display, info.name, info.kind, max_inputs
        );

        Ok(Self {
            info,
            max_inputs,
            mirror_wait: config.vsync.mirror_wait(),
            core,
            state: Mutex::new(ClusterState {
                enabled: true,
                pending: None,
                cache: FrameCache::default(),
                session_mode: SessionMode::default(),
                vsync_paced: config.vsync.paced,
                mirror_sinks: BTreeSet::new(),
                mirror_seen: 0,
                mirror_resync: false,
                pending_since: Instant::now(),
            }),
            mirror: MirrorChannel::default(),
            worker: RwLock::new(Some(worker)),
        })
    }

    pub fn display(&self) -> DisplayId {
        self.info.id
    }

    pub fn info(&self) -> &DisplayInfo {
        &self.info
    }

    pub fn max_inputs(&self) -> usize {
        self.max_inputs
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn session_mode(&self) -> SessionMode {
        self.state.lock().session_mode
    }

    pub fn mirror_sinks(&self) -> Vec<DisplayId> {
        self.state.lock().mirror_sinks.iter().copied().collect()
    }

    pub(crate) fn mirror_wait(&self) -> Duration {
        self.mirror_wait
    }

    /// Switches between modes that involve no other display
    pub(crate) fn set_local_session_mode(&self, mode: SessionMode) {
        let mut state = self.state.lock();
        if state.session_mode != mode {
            debug!("display {}: session mode {} -> {}", self.display(), state.session_mode, mode);
            state.session_mode = mode;
            state.cache.invalidate();
        }
    }

    pub fn set_vsync_paced(&self, paced: bool) {
        self.state.lock().vsync_paced = paced;
    }

    fn queue_depth(&self) -> usize {
        self.worker.read().as_ref().map_or(0, DispatchWorker::depth)
    }

    /// Acquires the job for this frame and returns its sequence number.
    ///
    /// A job still held from an earlier `get_job` is reused.
    pub fn get_job(&self) -> Result<u64> {
        let display = self.display();
        let mut state = self.state.lock();
        if !state.enabled {
            return Err(DispatchError::DisplayNotConnected(display));
        }
        if let Some(job) = &state.pending {
            warn!(
                "⚠️ display {}: job #{} still held, reusing it for this frame",
                display,
                job.sequence()
            );
            return Ok(job.sequence());
        }

        let watermarks = self.worker.read().as_ref().map(DispatchWorker::watermarks);
        let depth = self.queue_depth();
        if state.vsync_paced && watermarks.is_some_and(|w| depth > w.low) {
            ClusterCounters::bump(&self.core.counters.dropped);
            debug!("⏭️ display {}: {} jobs queued, dropping frame", display, depth);
            return Err(DispatchError::FrameDropped { display, depth });
        }

        let job = match self.core.pool.lock().acquire() {
            Ok(job) => job,
            Err(e) => {
                ClusterCounters::bump(&self.core.counters.pool_exhausted);
                return Err(e);
            }
        };
        let sequence = job.sequence();
        state.pending = Some(job);
        state.pending_since = Instant::now();
        ClusterCounters::bump(&self.core.counters.acquired);
        Ok(sequence)
    }

    /// Sequence of the job held between `get_job` and `trigger`
    pub fn existing_job(&self) -> Option<u64> {
        self.state.lock().pending.as_ref().map(|job| job.sequence())
    }

    /// Runs `f` on the held job
    pub fn with_job<R>(&self, f: impl FnOnce(&mut CompositionJob) -> R) -> Result<R> {
        let mut state = self.state.lock();
        let job = state
            .pending
            .as_mut()
            .ok_or(DispatchError::NoJob(self.display()))?;
        Ok(f(job))
    }

    /// Hands a virtual display its output buffer for this frame
    pub fn set_output_buffer(&self, output: BufferDescriptor) -> Result<()> {
        self.with_job(|job| {
            job.virtual_output.reset();
            job.virtual_output = output;
        })
    }

    /// Engine input built from the held job, if any
    pub(crate) fn hrt_input(&self) -> Option<HrtDisplay> {
        let state = self.state.lock();
        let job = state.pending.as_ref()?;
        Some(HrtDisplay {
            display: self.display(),
            max_inputs: self.max_inputs,
            connected: state.enabled,
            mirrored: state.session_mode.mirror_source().is_some(),
            supports_query: self.core.hwrm.supports_placement_query(self.display()),
            layers: job.visible_layers().iter().map(HrtLayer::from).collect(),
        })
    }

    pub(crate) fn apply_assignment(&self, assignment: &DisplayAssignment) {
        let mut state = self.state.lock();
        let Some(job) = state.pending.as_mut() else {
            return;
        };
        if job.visible_layers().len() != assignment.hw_indices.len() {
            warn!(
                "⚠️ display {}: layers changed during assignment, reassigning at set_job",
                self.display()
            );
            return;
        }
        job.apply_assignment(assignment);
    }

    /// Finalizes the held job
    pub fn set_job(&self) -> Result<SetJobOutcome> {
        let display = self.display();
        let mut state = self.state.lock();
        let mut job = state.pending.take().ok_or(DispatchError::NoJob(display))?;

        job.mirror_source = state.session_mode.mirror_source();
        job.mirror_sinks = state.mirror_sinks.len();

        if job.mirror_source.is_none() && !job.resources_assigned() {
            let assignment = hrt::simplified(&HrtDisplay {
                display,
                max_inputs: self.max_inputs,
                connected: true,
                mirrored: false,
                supports_query: false,
                layers: job.visible_layers().iter().map(HrtLayer::from).collect(),
            });
            job.apply_assignment(&assignment);
        }
        if !job.resources_valid() {
            ClusterCounters::bump(&self.core.counters.software_frames);
        }

        let core = &self.core;
        let post_state = core
            .finalizer
            .prepare(core.hwrm.as_ref(), &mut job, &mut state.cache, &core.outbox);
        job.finalize(post_state);

        if job.mirror_sinks > 0 {
            let snapshot = match MirrorSnapshot::capture(&job) {
                Ok(snapshot) => Some(Arc::new(snapshot)),
                Err(e) => {
                    warn!("⚠️ display {}: {}", display, e);
                    None
                }
            };
            self.mirror.publish(snapshot);
        }

        match post_state {
            PostState::Continue | PostState::Mirror => {
                state.pending = Some(job);
                Ok(SetJobOutcome::Ready(post_state))
            }
            PostState::NotDirty => {
                drop(state);
                ClusterCounters::bump(&core.counters.not_dirty);
                core.release(job);
                Ok(SetJobOutcome::NotDirty)
            }
            PostState::Error => {
                drop(state);
                Ok(self.skip(job))
            }
        }
    }

    /// Skips the held job, e.g. when its mirror source never delivered
    pub(crate) fn skip_pending(&self) -> Result<SetJobOutcome> {
        let job = self
            .state
            .lock()
            .pending
            .take()
            .ok_or(DispatchError::NoJob(self.display()))?;
        Ok(self.skip(job))
    }

    fn skip(&self, mut job: Box<CompositionJob>) -> SetJobOutcome {
        let returned = job.take_acquire_fences();
        warn!(
            "⚠️ display {}: skipping job #{}, returning {} acquire fences",
            self.display(),
            job.sequence(),
            returned.len()
        );
        ClusterCounters::bump(&self.core.counters.skipped);
        self.core.release(job);
        SetJobOutcome::Skipped { returned }
    }

    /// Enqueues the finalized job on the dispatch worker
    pub fn trigger(&self) -> Result<()> {
        let display = self.display();
        let job = {
            let mut state = self.state.lock();
            let job = state.pending.take().ok_or(DispatchError::NoJob(display))?;
            if job.post_state().is_none() {
                state.pending = Some(job);
                return Err(DispatchError::NotFinalized(display));
            }
            job
        };

        let worker = self.worker.read();
        match worker.as_ref() {
            Some(worker) => worker.enqueue(job),
            None => {
                self.core.release(job);
                Err(DispatchError::WorkerStopped(display))
            }
        }
    }

    /// Blocks until every enqueued job was processed
    pub fn drain(&self) {
        if let Some(worker) = self.worker.read().as_ref() {
            worker.drain();
        }
    }

    /// Moves every release, present and retire fence to the caller
    pub fn take_release_fences(&self) -> Vec<OutboxEntry> {
        self.core.outbox.take()
    }

    pub fn stats(&self) -> ClusterStats {
        let pool = self.core.pool.lock().stats();
        self.core.counters.snapshot(pool, self.queue_depth())
    }

    /// Waits for the next output this display publishes as a mirror source
    pub(crate) fn wait_mirror_output(&self, seen: u64, timeout: Duration) -> Option<MirrorPublication> {
        self.mirror.wait_after(seen, timeout)
    }

    pub(crate) fn mirror_seen(&self) -> u64 {
        self.state.lock().mirror_seen
    }

    /// Marks this sink as having missed its source's output
    pub(crate) fn request_mirror_resync(&self) {
        self.state.lock().mirror_resync = true;
    }

    /// Clears a pending resync; returns the instant before which source
    /// output is stale for the held job
    pub(crate) fn take_mirror_resync(&self) -> Option<Instant> {
        let mut state = self.state.lock();
        if !state.mirror_resync {
            return None;
        }
        state.mirror_resync = false;
        Some(state.pending_since)
    }

    /// Tears the display down: flush the held job through the discard
    /// path, drain, stop the worker.
    pub(crate) fn shutdown(&self) {
        let display = self.display();
        let pending = {
            let mut state = self.state.lock();
            state.enabled = false;
            state.mirror_sinks.clear();
            state.pending.take()
        };

        // Sinks waiting on this display stop waiting
        self.mirror.publish(None);

        if let Some(worker) = self.worker.read().as_ref() {
            worker.set_ignore(true);
            if let Some(mut job) = pending {
                if job.post_state().is_none() {
                    job.finalize(PostState::Error);
                }
                if let Err(e) = worker.enqueue(job) {
                    debug!("display {}: final flush: {}", display, e);
                }
            }
            worker.drain();
        }

        if let Some(mut worker) = self.worker.write().take() {
            worker.shutdown();
        }
        self.core.finalizer.reset_chain();
        self.core.hwrm.destroy_session(display);
        info!("🔌 display {} disabled", display);
    }
}

/// Both sides of a mirror pair, locked source first
pub struct MirrorTransaction<'a> {
    source: &'a WorkerCluster,
    sink: &'a WorkerCluster,
    source_state: MutexGuard<'a, ClusterState>,
    sink_state: MutexGuard<'a, ClusterState>,
}

impl<'a> MirrorTransaction<'a> {
    pub fn begin(source: &'a WorkerCluster, sink: &'a WorkerCluster) -> Self {
        let source_state = source.state.lock();
        let sink_state = sink.state.lock();
        Self {
            source,
            sink,
            source_state,
            sink_state,
        }
    }

    /// Whether the sink currently mirrors the source
    pub fn is_linked(&self) -> bool {
        self.sink_state.session_mode.mirror_source() == Some(self.source.display())
            && self.source_state.mirror_sinks.contains(&self.sink.display())
    }

    /// Makes the sink mirror the source from its next publication on
    pub fn attach(&mut self, mode: SessionMode) {
        self.sink_state.session_mode = mode;
        self.sink_state.mirror_seen = self.source.mirror.generation();
        self.sink_state.mirror_resync = false;
        self.sink_state.cache.invalidate();
        self.source_state.mirror_sinks.insert(self.sink.display());
        self.source_state.cache.invalidate();
        info!("🪞 display {} now mirrors display {}", self.sink.display(), self.source.display());
    }

    /// Breaks the pair; the sink falls back to `mode`
    pub fn detach(&mut self, mode: SessionMode) {
        self.source_state.mirror_sinks.remove(&self.sink.display());
        if self.sink_state.session_mode.mirror_source() == Some(self.source.display()) {
            self.sink_state.session_mode = mode;
            self.sink_state.cache.invalidate();
        }
        info!(
            "🪞 display {} no longer mirrors display {}",
            self.sink.display(),
            self.source.display()
        );
    }

    /// Couples the sink's held job to a published source output
    pub fn couple(&mut self, generation: u64, snapshot: &MirrorSnapshot) -> Result<()> {
        if !self.is_linked() {
            return Err(DispatchError::MirrorUnavailable(self.source.display()));
        }
        let sink_display = self.sink.display();
        let format = self.sink.info.output_format;
        let job = self
            .sink_state
            .pending
            .as_mut()
            .ok_or(DispatchError::NoJob(sink_display))?;
        Finalizer::couple_mirror(snapshot, job, format)?;
        self.sink_state.mirror_seen = generation;
        Ok(())
    }

    /// Records a consumed publication that carried no output
    pub fn mark_seen(&mut self, generation: u64) {
        self.sink_state.mirror_seen = generation;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::NoopFeatures;
    use crate::hwrm::sim::SimulatedResourceManager;
    use crate::display::PixelFormat;
    use crate::job::{BufferHandle, Rect, VisibleLayer};
    use crate::worker::WorkerState;

    fn cluster(sim: &Arc<SimulatedResourceManager>, config: &DispatchConfig) -> WorkerCluster {
        WorkerCluster::start(
            DisplayInfo::physical(0, 4),
            4,
            config,
            Arc::clone(sim) as Arc<dyn HardwareResourceManager>,
            Arc::new(NoopFeatures),
        )
        .unwrap()
    }

    fn push_layers(cluster: &WorkerCluster, ids: &[u64]) {
        cluster
            .with_job(|job| {
                for &id in ids {
                    job.push_layer(VisibleLayer::ui(
                        BufferHandle::new(id, 64, 64, PixelFormat::Rgba8888),
                        Rect::new(0, 0, 64, 64),
                    ));
                }
            })
            .unwrap();
    }

    #[test]
    fn test_frame_roundtrip() {
        let sim = Arc::new(SimulatedResourceManager::new());
        let cluster = cluster(&sim, &DispatchConfig::default());

        let sequence = cluster.get_job().unwrap();
        push_layers(&cluster, &[1, 2]);
        assert!(cluster.set_job().unwrap().is_ready());
        cluster.trigger().unwrap();
        cluster.drain();

        assert_eq!(sim.triggered_sequences(DisplayId(0)), vec![sequence]);
        let stats = cluster.stats();
        assert_eq!(stats.composed, 1);
        assert_eq!(stats.pool_outstanding, 0);
        cluster.shutdown();
    }

    #[test]
    fn test_get_job_reuses_held_job() {
        let sim = Arc::new(SimulatedResourceManager::new());
        let cluster = cluster(&sim, &DispatchConfig::default());

        let first = cluster.get_job().unwrap();
        assert_eq!(cluster.get_job().unwrap(), first);
        assert_eq!(cluster.existing_job(), Some(first));
        assert_eq!(cluster.stats().acquired, 1);
        cluster.shutdown();
    }

    #[test]
    fn test_trigger_requires_set_job() {
        let sim = Arc::new(SimulatedResourceManager::new());
        let cluster = cluster(&sim, &DispatchConfig::default());

        assert!(matches!(cluster.trigger(), Err(DispatchError::NoJob(_))));
        cluster.get_job().unwrap();
        assert!(matches!(cluster.trigger(), Err(DispatchError::NotFinalized(_))));
        assert!(cluster.existing_job().is_some());
        cluster.shutdown();
    }

    /// Lets paused submissions through even when the test panics
    struct ResumeOnDrop(Arc<SimulatedResourceManager>);

    impl Drop for ResumeOnDrop {
        fn drop(&mut self) {
            self.0.resume_triggers();
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached");
    }

    fn submit(cluster: &WorkerCluster, id: u64) {
        cluster.get_job().unwrap();
        push_layers(cluster, &[id]);
        cluster.set_job().unwrap();
        cluster.trigger().unwrap();
    }

    #[test]
    fn test_vsync_paced_display_drops_frames_above_low_watermark() {
        let sim = Arc::new(SimulatedResourceManager::new());
        let cluster = cluster(&sim, &DispatchConfig::default());
        sim.pause_triggers();
        let _resume = ResumeOnDrop(Arc::clone(&sim));

        // One held in the paused submission
        submit(&cluster, 0);
        wait_until(|| {
            let worker = cluster.worker.read();
            worker.as_ref().is_some_and(|w| w.depth() == 0 && w.state() == WorkerState::Triggered)
        });

        // Three queued behind it
        for id in 1..4 {
            submit(&cluster, id);
        }
        assert_eq!(cluster.queue_depth(), 3);
        let err = cluster.get_job().unwrap_err();
        assert!(matches!(err, DispatchError::FrameDropped { depth: 3, .. }));

        cluster.set_vsync_paced(false);
        assert!(cluster.get_job().is_ok());

        sim.resume_triggers();
        cluster.shutdown();
        assert_eq!(cluster.stats().dropped, 1);
        assert_eq!(cluster.stats().pool_outstanding, 0);
    }

    #[test]
    fn test_shutdown_discards_held_job() {
        let sim = Arc::new(SimulatedResourceManager::new());
        let cluster = cluster(&sim, &DispatchConfig::default());

        cluster.get_job().unwrap();
        push_layers(&cluster, &[1]);
        cluster.shutdown();

        let stats = cluster.stats();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.pool_outstanding, 0);
        assert!(!cluster.is_enabled());
        assert!(!sim.has_session(DisplayId(0)));
        assert!(matches!(cluster.get_job(), Err(DispatchError::DisplayNotConnected(_))));
    }

    #[test]
    fn test_mirror_channel_times_out_without_publication() {
        let channel = MirrorChannel::default();
        assert!(channel.wait_after(0, Duration::from_millis(5)).is_none());
        let before = Instant::now();
        channel.publish(None);
        let publication = channel.wait_after(0, Duration::from_millis(5)).unwrap();
        assert_eq!(publication.generation, 1);
        assert!(publication.snapshot.is_none());
        assert!(publication.published_at >= before);
    }
}

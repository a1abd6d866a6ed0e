//! Scheduler facade
//!
//! [`Scheduler`] is the single object the host talks to. It owns one
//! [`WorkerCluster`] per connected display and coordinates the operations
//! that span displays: batched resource assignment, mirror coupling and
//! session-mode changes.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use hwc_dispatch::{DispatchConfig, DisplayInfo, Scheduler};
//! use hwc_dispatch::hwrm::sim::SimulatedResourceManager;
//!
//! let scheduler = Scheduler::new(DispatchConfig::default(), Arc::new(SimulatedResourceManager::new()));
//! let display = scheduler.on_plug_in(DisplayInfo::physical(0, 4))?;
//!
//! scheduler.get_job(display)?;
//! scheduler.with_job(display, |_job| {
//!     // fill in visible layers
//! })?;
//! scheduler.assign_resources(false);
//! scheduler.set_job(display)?;
//! scheduler.trigger(display)?;
//! # Ok::<(), hwc_dispatch::DispatchError>(())
//! ```

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::cluster::{MirrorTransaction, SetJobOutcome, WorkerCluster};
use crate::config::DispatchConfig;
use crate::display::{DisplayId, DisplayInfo, DisplayKind, SessionMode};
use crate::error::{DispatchError, Result};
use crate::finalizer::OutboxEntry;
use crate::handlers::{LayerFeatures, NoopFeatures};
use crate::hrt::{DisplayAssignment, HrtEngine};
use crate::hwrm::HardwareResourceManager;
use crate::job::{BufferDescriptor, CompositionJob};
use crate::stats::ClusterStats;

/// Per-display composition dispatch scheduler
pub struct Scheduler {
    config: DispatchConfig,
    hwrm: Arc<dyn HardwareResourceManager>,
    features: Arc<dyn LayerFeatures>,
    engine: HrtEngine,
    clusters: RwLock<BTreeMap<DisplayId, Arc<WorkerCluster>>>,
    /// Serializes changes to mirror relations
    topology: Mutex<()>,
}

impl Scheduler {
    pub fn new(config: DispatchConfig, hwrm: Arc<dyn HardwareResourceManager>) -> Self {
        Self::with_features(config, hwrm, Arc::new(NoopFeatures))
    }

    /// Scheduler whose media, inference and dim layers go to `features`
    pub fn with_features(
        config: DispatchConfig,
        hwrm: Arc<dyn HardwareResourceManager>,
        features: Arc<dyn LayerFeatures>,
    ) -> Self {
        let engine = HrtEngine::new(config.hrt.detailed_query);
        Self {
            config,
            hwrm,
            features,
            engine,
            clusters: RwLock::new(BTreeMap::new()),
            topology: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    fn cluster(&self, display: DisplayId) -> Result<Arc<WorkerCluster>> {
        self.clusters
            .read()
            .get(&display)
            .cloned()
            .ok_or(DispatchError::DisplayNotConnected(display))
    }

    fn all_clusters(&self) -> Vec<Arc<WorkerCluster>> {
        self.clusters.read().values().cloned().collect()
    }

    /// Displays currently plugged in, in id order
    pub fn connected_displays(&self) -> Vec<DisplayId> {
        self.clusters.read().keys().copied().collect()
    }

    /// Opens a hardware session and starts the display's worker
    pub fn on_plug_in(&self, info: DisplayInfo) -> Result<DisplayId> {
        let display = info.id;
        let mut clusters = self.clusters.write();
        if clusters.contains_key(&display) {
            return Err(DispatchError::DisplayAlreadyConnected(display));
        }

        self.hwrm.create_session(display, info.kind)?;
        let started = match info.max_inputs {
            Some(count) => Ok(count),
            None => self.hwrm.query_available_input_count(display),
        }
        .and_then(|max_inputs| {
            WorkerCluster::start(
                info,
                max_inputs,
                &self.config,
                Arc::clone(&self.hwrm),
                Arc::clone(&self.features),
            )
        });

        match started {
            Ok(cluster) => {
                clusters.insert(display, Arc::new(cluster));
                Ok(display)
            }
            Err(e) => {
                warn!("⚠️ display {}: plug-in failed: {}", display, e);
                self.hwrm.destroy_session(display);
                Err(e)
            }
        }
    }

    /// Tears the display down.
    ///
    /// Its mirror sinks fall back to direct link; a held job is discarded
    /// through the worker before the thread is joined.
    pub fn on_plug_out(&self, display: DisplayId) -> Result<()> {
        let _topology = self.topology.lock();
        let cluster = self
            .clusters
            .write()
            .remove(&display)
            .ok_or(DispatchError::DisplayNotConnected(display))?;

        for sink_id in cluster.mirror_sinks() {
            if let Ok(sink) = self.cluster(sink_id) {
                MirrorTransaction::begin(&cluster, &sink).detach(SessionMode::DirectLink);
            }
        }
        if let Some(source_id) = cluster.session_mode().mirror_source() {
            if let Ok(source) = self.cluster(source_id) {
                MirrorTransaction::begin(&source, &cluster).detach(SessionMode::DirectLink);
            }
        }

        cluster.shutdown();
        Ok(())
    }

    /// Acquires the display's job for this frame; returns its sequence
    pub fn get_job(&self, display: DisplayId) -> Result<u64> {
        self.cluster(display)?.get_job()
    }

    /// Sequence of the job held since `get_job`, without acquiring one
    pub fn get_existing_job(&self, display: DisplayId) -> Result<Option<u64>> {
        Ok(self.cluster(display)?.existing_job())
    }

    /// Gives `f` access to the display's held job
    pub fn with_job<R>(&self, display: DisplayId, f: impl FnOnce(&mut CompositionJob) -> R) -> Result<R> {
        self.cluster(display)?.with_job(f)
    }

    /// Output buffer of a virtual display for this frame
    pub fn set_output_buffer(&self, display: DisplayId, output: BufferDescriptor) -> Result<()> {
        let cluster = self.cluster(display)?;
        if cluster.info().kind != DisplayKind::Virtual {
            warn!("⚠️ display {} is not virtual, its output buffer will be ignored", display);
        }
        cluster.set_output_buffer(output)
    }

    pub fn set_vsync_paced(&self, display: DisplayId, paced: bool) -> Result<()> {
        self.cluster(display)?.set_vsync_paced(paced);
        Ok(())
    }

    pub fn session_mode(&self, display: DisplayId) -> Result<SessionMode> {
        Ok(self.cluster(display)?.session_mode())
    }

    /// Runs the HRT engine over every display holding a job and writes the
    /// result into those jobs.
    pub fn assign_resources(&self, skip_detailed_query: bool) -> Vec<DisplayAssignment> {
        let clusters = self.all_clusters();
        let inputs: Vec<_> = clusters.iter().filter_map(|cluster| cluster.hrt_input()).collect();
        if inputs.is_empty() {
            return Vec::new();
        }

        let assignments = self.engine.run(&inputs, skip_detailed_query, self.hwrm.as_ref());
        for assignment in &assignments {
            if let Some(cluster) = clusters.iter().find(|c| c.display() == assignment.display) {
                cluster.apply_assignment(assignment);
            }
            debug!(
                "🧮 display {}: {:?} tier, software {:?}, {} hardware layers",
                assignment.display,
                assignment.tier,
                assignment.software_range,
                assignment.hw_layer_count()
            );
        }
        assignments
    }

    /// Finalizes the display's held job.
    ///
    /// A mirror sink first waits for its source to publish this frame's
    /// output, then couples to it. No output within the mirror wait skips
    /// the sink's frame.
    pub fn set_job(&self, display: DisplayId) -> Result<SetJobOutcome> {
        let cluster = self.cluster(display)?;
        match cluster.session_mode().mirror_source() {
            Some(source) => self.set_sink_job(&cluster, source),
            None => cluster.set_job(),
        }
    }

    fn set_sink_job(&self, sink: &WorkerCluster, source_id: DisplayId) -> Result<SetJobOutcome> {
        let display = sink.display();
        if sink.existing_job().is_none() {
            return Err(DispatchError::NoJob(display));
        }
        let source = match self.cluster(source_id) {
            Ok(source) => source,
            Err(e) => {
                warn!("⚠️ display {}: {}", display, e);
                return sink.skip_pending();
            }
        };

        let waited = sink.mirror_wait();
        let deadline = Instant::now() + waited;
        let stale_before = sink.take_mirror_resync();
        let mut seen = sink.mirror_seen();
        let publication = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match source.wait_mirror_output(seen, remaining) {
                // Late output of a frame this sink already skipped
                Some(late) if stale_before.is_some_and(|since| late.published_at <= since) => {
                    debug!(
                        "display {}: ignoring output of display {} published before this frame",
                        display, source_id
                    );
                    seen = late.generation;
                }
                other => break other,
            }
        };

        let Some(publication) = publication else {
            let e = DispatchError::MirrorTimeout {
                source_display: source_id,
                waited,
            };
            warn!("⚠️ display {}: {}", display, e);
            sink.request_mirror_resync();
            return sink.skip_pending();
        };

        let generation = publication.generation;
        let Some(snapshot) = publication.snapshot else {
            MirrorTransaction::begin(&source, sink).mark_seen(generation);
            warn!("⚠️ display {}: {}", display, DispatchError::MirrorUnavailable(source_id));
            return sink.skip_pending();
        };

        let coupled = MirrorTransaction::begin(&source, sink).couple(generation, &snapshot);
        match coupled {
            Ok(()) => {
                debug!(
                    "🪞 display {}: coupled to job #{} of display {}",
                    display, snapshot.sequence, source_id
                );
                sink.set_job()
            }
            Err(e) => {
                warn!("⚠️ display {}: mirror coupling failed: {}", display, e);
                sink.skip_pending()
            }
        }
    }

    /// Hands the display's finalized job to its worker
    pub fn trigger(&self, display: DisplayId) -> Result<()> {
        self.cluster(display)?.trigger()
    }

    /// Resource assignment plus finalization of every mirror pair: sources
    /// first, so their output buffers are known when the sinks couple.
    pub fn prepare_mirror(&self, skip_detailed_query: bool) -> Vec<(DisplayId, Result<SetJobOutcome>)> {
        self.assign_resources(skip_detailed_query);

        let clusters = self.all_clusters();
        let mut results = Vec::new();
        for source in clusters.iter().filter(|c| !c.mirror_sinks().is_empty()) {
            if source.existing_job().is_some() {
                results.push((source.display(), source.set_job()));
            }
        }
        for sink in &clusters {
            if let Some(source) = sink.session_mode().mirror_source() {
                if sink.existing_job().is_some() {
                    results.push((sink.display(), self.set_sink_job(sink, source)));
                }
            }
        }
        results
    }

    /// Changes how the display produces frames.
    ///
    /// Entering or leaving a mirror relation drains every affected worker
    /// and waits for the manager to finish their submitted frames first.
    pub fn set_session_mode(&self, display: DisplayId, mode: SessionMode) -> Result<()> {
        let _topology = self.topology.lock();
        let cluster = self.cluster(display)?;
        let current = cluster.session_mode();
        if current == mode {
            return Ok(());
        }

        let new_source = match mode.mirror_source() {
            Some(source_id) => Some(self.validate_mirror(&cluster, source_id)?),
            None => None,
        };

        if current.crosses_mirror_boundary(&mode) {
            let mut affected = vec![display];
            affected.extend(current.mirror_source());
            affected.extend(mode.mirror_source());
            for id in affected {
                if let Ok(affected_cluster) = self.cluster(id) {
                    affected_cluster.drain();
                    self.hwrm.wait_all_job_done(id)?;
                }
            }
        }

        if let Some(old_source) = current.mirror_source().and_then(|id| self.cluster(id).ok()) {
            MirrorTransaction::begin(&old_source, &cluster).detach(mode);
        }
        match new_source {
            Some(source) => MirrorTransaction::begin(&source, &cluster).attach(mode),
            None => cluster.set_local_session_mode(mode),
        }

        info!("🔀 display {}: session mode {} -> {}", display, current, mode);
        Ok(())
    }

    fn validate_mirror(&self, sink: &WorkerCluster, source_id: DisplayId) -> Result<Arc<WorkerCluster>> {
        let display = sink.display();
        let invalid = |reason| DispatchError::InvalidMirror {
            display,
            source_display: source_id,
            reason,
        };

        if source_id == display {
            return Err(invalid("a display cannot mirror itself"));
        }
        let source = self.cluster(source_id)?;
        if source.info().kind != DisplayKind::Physical {
            return Err(invalid("mirror source must be a physical display"));
        }
        if source.session_mode().mirror_source().is_some() {
            return Err(invalid("mirror source is itself a mirror sink"));
        }
        if !sink.mirror_sinks().is_empty() {
            return Err(invalid("display is a mirror source"));
        }
        Ok(source)
    }

    /// Blocks until the display's worker has processed everything enqueued
    pub fn drain(&self, display: DisplayId) -> Result<()> {
        self.cluster(display)?.drain();
        Ok(())
    }

    /// Release, present and retire fences produced since the last call
    pub fn take_release_fences(&self, display: DisplayId) -> Result<Vec<OutboxEntry>> {
        Ok(self.cluster(display)?.take_release_fences())
    }

    pub fn stats(&self, display: DisplayId) -> Result<ClusterStats> {
        Ok(self.cluster(display)?.stats())
    }

    pub fn all_stats(&self) -> Vec<(DisplayId, ClusterStats)> {
        self.all_clusters()
            .iter()
            .map(|cluster| (cluster.display(), cluster.stats()))
            .collect()
    }

    /// Plugs every display out
    pub fn shutdown(&self) {
        let displays = self.connected_displays();
        if displays.is_empty() {
            return;
        }
        info!("🛑 shutting down {} displays", displays.len());
        for display in displays {
            if let Err(e) = self.on_plug_out(display) {
                debug!("display {}: {}", display, e);
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

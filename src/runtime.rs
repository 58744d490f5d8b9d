//! Threaded odometry node.
//!
//! One worker thread owns the [`OdometryPipeline`] and runs the cycles
//! strictly in order. Results go to a publisher thread and timings to a
//! reporter thread over bounded channels; the worker uses `try_send` and
//! never waits on either of them.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::{
    bounding_box::BoxSet,
    buffer::BufferProducer,
    config,
    error::{Error, Result},
    imu::ImuSample,
    keyframe::Keyframe,
    odom_pipeline::{CycleOutcome, FrameResult, FrameTimings, OdometryPipeline, StampedPose},
    point3d::Scan,
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const RESULT_QUEUE_SIZE: usize = 64;
const TIMING_QUEUE_SIZE: usize = 256;

/// Shared stop signal, checked at every cycle start and every wait.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives every published frame on the publisher thread.
pub trait ResultSink: Send + 'static {
    fn publish(&mut self, result: &FrameResult);
}

impl<F> ResultSink for F
where
    F: FnMut(&FrameResult) + Send + 'static,
{
    fn publish(&mut self, result: &FrameResult) {
        self(result)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SeriesSummary {
    pub mean_ms: f64,
    pub max_ms: f64,
}

/// Running timing statistics between two reports.
#[derive(Debug, Clone, Default)]
pub struct TimingStats {
    count: usize,
    sums: [f64; 3],
    maxs: [f64; 3],
}

impl TimingStats {
    pub fn push(&mut self, timings: &FrameTimings) {
        let values = [timings.total, timings.submap_build, timings.ground];
        for (i, v) in values.iter().enumerate() {
            let ms = v.as_secs_f64() * 1e3;
            self.sums[i] += ms;
            self.maxs[i] = self.maxs[i].max(ms);
        }
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Computation, submap build and ground summaries, in that order.
    pub fn summary(&self) -> Option<[SeriesSummary; 3]> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some(std::array::from_fn(|i| SeriesSummary {
            mean_ms: self.sums[i] / n,
            max_ms: self.maxs[i],
        }))
    }

    fn report(&mut self) {
        if let Some([comp, submap, ground]) = self.summary() {
            info!(
                "{} frames, comp {:.1}/{:.1} ms, submap {:.1}/{:.1} ms, ground {:.1}/{:.1} ms (mean/max)",
                self.count,
                comp.mean_ms,
                comp.max_ms,
                submap.mean_ms,
                submap.max_ms,
                ground.mean_ms,
                ground.max_ms
            );
        }
        *self = TimingStats::default();
    }
}

/// Appends the worker has not handed to readers yet.
///
/// The worker never waits on a reader copying a snapshot: when a lock is
/// taken it keeps the entries and retries after the next cycle.
#[derive(Default)]
struct PendingSnapshots {
    poses: Vec<StampedPose>,
    keyframes: Vec<Arc<Keyframe>>,
}

impl PendingSnapshots {
    fn try_flush(
        &mut self,
        trajectory: &Mutex<Vec<StampedPose>>,
        keyframes: &Mutex<Vec<Arc<Keyframe>>>,
    ) {
        if !self.poses.is_empty() {
            if let Some(mut shared) = trajectory.try_lock() {
                shared.append(&mut self.poses);
            }
        }
        if !self.keyframes.is_empty() {
            if let Some(mut shared) = keyframes.try_lock() {
                shared.append(&mut self.keyframes);
            }
        }
    }

    fn flush(
        &mut self,
        trajectory: &Mutex<Vec<StampedPose>>,
        keyframes: &Mutex<Vec<Arc<Keyframe>>>,
    ) {
        trajectory.lock().append(&mut self.poses);
        keyframes.lock().append(&mut self.keyframes);
    }
}

pub struct OdometryNode {
    cancel: CancellationToken,
    scans: Option<Sender<Scan>>,
    imu_input: BufferProducer<ImuSample>,
    box_input: BufferProducer<BoxSet>,
    trajectory: Arc<Mutex<Vec<StampedPose>>>,
    keyframes: Arc<Mutex<Vec<Arc<Keyframe>>>>,
    trajectory_path: Option<String>,
    worker: Option<JoinHandle<OdometryPipeline>>,
    publisher: Option<JoinHandle<()>>,
    reporter: Option<JoinHandle<()>>,
}

fn spawn_named<T, F>(name: &'static str, f: F) -> Result<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .map_err(|e| Error::Resource(format!("{} thread: {}", name, e)))
}

impl OdometryNode {
    /// Validates `config`, sets up the pipeline and starts the worker,
    /// publisher and reporter threads.
    pub fn spawn(config: config::Config, sink: impl ResultSink) -> Result<OdometryNode> {
        let pipeline = OdometryPipeline::new(config.clone())?;
        let pool = match config.max_num_threads {
            0 => None,
            n => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n as usize)
                    .build()
                    .map_err(|e| Error::Resource(format!("thread pool: {}", e)))?,
            ),
        };

        let cancel = CancellationToken::new();
        let (scan_tx, scan_rx) = bounded::<Scan>(config.scan_queue_size);
        let (result_tx, result_rx) = bounded::<FrameResult>(RESULT_QUEUE_SIZE);
        let (timing_tx, timing_rx) = bounded::<FrameTimings>(TIMING_QUEUE_SIZE);
        let trajectory = Arc::new(Mutex::new(Vec::new()));
        let keyframes = Arc::new(Mutex::new(Vec::new()));
        let imu_input = pipeline.imu_input();
        let box_input = pipeline.box_input();

        let publisher = {
            let cancel = cancel.clone();
            spawn_named("publisher", move || run_publisher(result_rx, sink, cancel))?
        };
        let reporter = {
            let cancel = cancel.clone();
            let interval = Duration::from_millis(config.report_interval_ms.max(1));
            spawn_named("reporter", move || run_reporter(timing_rx, interval, cancel))?
        };
        let worker = {
            let cancel = cancel.clone();
            let trajectory = trajectory.clone();
            let keyframes = keyframes.clone();
            spawn_named("odometry", move || {
                let mut pipeline = pipeline;
                let mut snapshots = PendingSnapshots::default();
                let mut cycle = |scan: &Scan| match &pool {
                    Some(pool) => pool.install(|| pipeline.process_scan(scan, &cancel)),
                    None => pipeline.process_scan(scan, &cancel),
                };
                while !cancel.is_cancelled() {
                    let scan = match scan_rx.recv_timeout(POLL_INTERVAL) {
                        Ok(scan) => scan,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    match cycle(&scan) {
                        CycleOutcome::Processed(result) => {
                            snapshots.poses.push(StampedPose {
                                timestamp: result.timestamp,
                                pose: result.pose,
                            });
                            if let Some(keyframe) = &result.keyframe {
                                snapshots.keyframes.push(keyframe.clone());
                            }
                            snapshots.try_flush(&trajectory, &keyframes);
                            let _ = timing_tx.try_send(result.timings);
                            if let Err(TrySendError::Full(result)) = result_tx.try_send(result) {
                                debug!("publisher busy, dropped frame {}", result.index);
                            }
                        }
                        CycleOutcome::WaitingForImu => {
                            debug!("scan {:.3} dropped, imu not calibrated", scan.timestamp)
                        }
                        CycleOutcome::Cancelled => break,
                    }
                }
                drop(cycle);
                snapshots.flush(&trajectory, &keyframes);
                pipeline
            })?
        };

        info!("odometry node started");
        Ok(OdometryNode {
            cancel,
            scans: Some(scan_tx),
            imu_input,
            box_input,
            trajectory,
            keyframes,
            trajectory_path: config.trajectory_path,
            worker: Some(worker),
            publisher: Some(publisher),
            reporter: Some(reporter),
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn imu_input(&self) -> BufferProducer<ImuSample> {
        self.imu_input.clone()
    }

    pub fn box_input(&self) -> BufferProducer<BoxSet> {
        self.box_input.clone()
    }

    /// Queues a scan, blocking while the queue is full.
    ///
    /// Returns `false` once the worker has stopped.
    pub fn submit_scan(&self, scan: Scan) -> bool {
        match &self.scans {
            Some(tx) => tx.send(scan).is_ok(),
            None => false,
        }
    }

    pub fn trajectory_snapshot(&self) -> Vec<StampedPose> {
        self.trajectory.lock().clone()
    }

    pub fn keyframe_snapshot(&self) -> Vec<Arc<Keyframe>> {
        self.keyframes.lock().clone()
    }

    /// Processes every queued scan, stops the background threads and saves
    /// the trajectory when a path is configured.
    pub fn shutdown(mut self) -> Result<Vec<StampedPose>> {
        self.scans.take();
        let pipeline = self
            .worker
            .take()
            .map(|h| h.join().map_err(|_| Error::ThreadPanicked("odometry")))
            .transpose()?;
        self.cancel.cancel();
        self.join_background()?;

        let Some(pipeline) = pipeline else {
            return Ok(self.trajectory_snapshot());
        };
        if let Some(path) = &self.trajectory_path {
            pipeline.save_trajectory(path)?;
        }
        info!("odometry node stopped after {} scans", pipeline.trajectory().len());
        Ok(pipeline.trajectory().to_vec())
    }

    fn join_background(&mut self) -> Result<()> {
        if let Some(h) = self.publisher.take() {
            h.join().map_err(|_| Error::ThreadPanicked("publisher"))?;
        }
        if let Some(h) = self.reporter.take() {
            h.join().map_err(|_| Error::ThreadPanicked("reporter"))?;
        }
        Ok(())
    }
}

impl Drop for OdometryNode {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.scans.take();
        if let Some(h) = self.worker.take() {
            let _ = h.join();
        }
        if let Err(e) = self.join_background() {
            warn!("{}", e);
        }
    }
}

fn run_publisher(rx: Receiver<FrameResult>, mut sink: impl ResultSink, cancel: CancellationToken) {
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(result) => sink.publish(&result),
            Err(RecvTimeoutError::Timeout) if cancel.is_cancelled() => break,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
    // drain what the worker sent before stopping
    while let Ok(result) = rx.try_recv() {
        sink.publish(&result);
    }
}

fn run_reporter(rx: Receiver<FrameTimings>, interval: Duration, cancel: CancellationToken) {
    let mut stats = TimingStats::default();
    let mut last_report = Instant::now();
    loop {
        match rx.recv_timeout(POLL_INTERVAL.min(interval)) {
            Ok(timings) => stats.push(&timings),
            Err(RecvTimeoutError::Timeout) if cancel.is_cancelled() => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if last_report.elapsed() >= interval {
            stats.report();
            last_report = Instant::now();
        }
    }
    while let Ok(timings) = rx.try_recv() {
        stats.push(&timings);
    }
    stats.report();
}

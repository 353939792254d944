use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;

use crate::align::StartupAligner;
use crate::crop::{CropBufferWriter, CropMatcher, CropSource, CropStats};
use crate::decode::CropDecoder;
use crate::message::{CropRecord, Frame, TileDetections};
use crate::mosaic::{FrameMosaicBuilder, MosaicFrame, MosaicStats};
use crate::reassemble::{DetectionReassembler, ReassembledFrame, ReassemblyStats};
use crate::sync::{SequenceSynchronizer, SyncGroup, SyncStats};

use super::{FrameResult, DETECTIONS_ID, MOSAIC_ID};

/// Messages of the other stream the join stage skips while waiting for it to
/// restart as well.
const RESTART_WAIT_LIMIT: u64 = 30;

/// Artifacts handed to the join stage.
pub(crate) enum Joined {
    Detections(ReassembledFrame),
    Mosaic(MosaicFrame),
}

pub(crate) struct DetectionLoopReport {
    pub dropped_at_startup: u64,
    pub restarts: u64,
    pub reassembly: ReassemblyStats,
}

pub(crate) struct MosaicLoopReport {
    pub dropped_at_startup: u64,
    pub restarts: u64,
    pub mosaic: MosaicStats,
}

pub(crate) struct CropLoopReport {
    pub forwarded: u64,
    pub overflowed: u64,
}

pub(crate) struct JoinLoopReport {
    pub sync: SyncStats,
    pub crops: CropStats,
    pub restarts: u64,
    pub skipped_after_restart: u64,
    pub frames_emitted: u64,
}

/// Back-to-back stale messages. A full cycle of them means the upstream
/// restarted its sequence numbers.
struct StaleRun {
    limit: usize,
    run: usize,
    seen: u64,
}

impl StaleRun {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            run: 0,
            seen: 0,
        }
    }

    /// Feed the stage's cumulative stale counter after one message. True once
    /// `limit` messages in a row were stale.
    fn observe(&mut self, stale_total: u64) -> bool {
        if stale_total > self.seen {
            self.run += 1;
        } else {
            self.run = 0;
        }
        self.seen = stale_total;
        if self.run >= self.limit {
            self.run = 0;
            return true;
        }
        false
    }
}

pub(crate) fn run_detection_loop(
    input: Receiver<TileDetections>,
    mut aligner: StartupAligner,
    mut reassembler: DetectionReassembler,
    output: SyncSender<Joined>,
    running: Arc<AtomicBool>,
) -> DetectionLoopReport {
    let mut stale = StaleRun::new(reassembler.geometry().tile_count());
    let mut restarts = 0u64;
    while running.load(Ordering::SeqCst) {
        let Ok(batch) = input.recv() else {
            break;
        };
        let Some(batch) = aligner.gate(batch) else {
            continue;
        };
        let seq = batch.sequence_number;
        let frame = reassembler.ingest_next(batch);
        if stale.observe(reassembler.stats().stale_batches) {
            log::error!(
                "detections went back to sequence {}, upstream restarted; realigning",
                seq
            );
            aligner.reset();
            reassembler.reset();
            restarts += 1;
        }
        if let Some(frame) = frame {
            if output.send(Joined::Detections(frame)).is_err() {
                log::warn!("join stage gone, stopping detection loop");
                break;
            }
        }
    }
    log::debug!("detection loop exiting");
    DetectionLoopReport {
        dropped_at_startup: aligner.dropped(),
        restarts,
        reassembly: reassembler.stats(),
    }
}

pub(crate) fn run_mosaic_loop(
    input: Receiver<Frame>,
    mut aligner: StartupAligner,
    mut mosaic: FrameMosaicBuilder,
    output: SyncSender<Joined>,
    running: Arc<AtomicBool>,
) -> MosaicLoopReport {
    let mut stale = StaleRun::new(mosaic.geometry().tile_count());
    let mut restarts = 0u64;
    while running.load(Ordering::SeqCst) {
        let Ok(tile) = input.recv() else {
            break;
        };
        let Some(tile) = aligner.gate(tile) else {
            continue;
        };
        let seq = tile.sequence_number;
        let frame = mosaic.ingest_next(tile);
        if stale.observe(mosaic.stats().stale_tiles) {
            log::error!(
                "tile images went back to sequence {}, upstream restarted; realigning",
                seq
            );
            aligner.reset();
            mosaic.reset();
            restarts += 1;
        }
        if let Some(frame) = frame {
            if output.send(Joined::Mosaic(frame)).is_err() {
                log::warn!("join stage gone, stopping mosaic loop");
                break;
            }
        }
    }
    log::debug!("mosaic loop exiting");
    MosaicLoopReport {
        dropped_at_startup: aligner.dropped(),
        restarts,
        mosaic: mosaic.stats(),
    }
}

/// Drain the crop queue into the bounded crop buffer. Never blocks on the
/// join stage.
pub(crate) fn run_crop_loop(
    input: Receiver<CropRecord>,
    output: CropBufferWriter,
    running: Arc<AtomicBool>,
) -> CropLoopReport {
    let mut forwarded = 0u64;
    let mut overflowed = 0u64;
    while running.load(Ordering::SeqCst) {
        let Ok(crop) = input.recv() else {
            break;
        };
        match output.push(crop) {
            Ok(Some(_)) => overflowed += 1,
            Ok(None) => {}
            Err(e) => {
                log::error!("stopping crop loop: {}", e);
                break;
            }
        }
        forwarded += 1;
    }
    log::debug!(
        "crop loop exiting after {} crops ({} overflowed)",
        forwarded,
        overflowed
    );
    CropLoopReport {
        forwarded,
        overflowed,
    }
}

#[derive(Default)]
struct StreamCursor {
    last: Option<u64>,
    awaiting_restart: bool,
    skipped: u64,
}

enum Admission {
    Accept,
    /// The stream went back in sequence; state keyed by the old numbering
    /// must go.
    Restarted,
    /// Leftover message of the old numbering while waiting for this stream to
    /// restart too.
    Skip,
}

/// Tracks both joined streams so a restart of one never pairs its new
/// frames with the other stream's old ones.
#[derive(Default)]
struct RestartGuard {
    detections: StreamCursor,
    mosaic: StreamCursor,
}

impl RestartGuard {
    fn admit(&mut self, identifier: &str, seq: u64) -> Admission {
        let (this, other) = if identifier == DETECTIONS_ID {
            (&mut self.detections, &mut self.mosaic)
        } else {
            (&mut self.mosaic, &mut self.detections)
        };
        let went_back = this.last.is_some_and(|last| seq <= last);
        this.last = Some(seq);

        if this.awaiting_restart {
            if went_back {
                this.awaiting_restart = false;
                return Admission::Accept;
            }
            this.skipped += 1;
            if this.skipped > RESTART_WAIT_LIMIT {
                log::warn!(
                    "{} never restarted after {} messages, resuming",
                    identifier,
                    RESTART_WAIT_LIMIT
                );
                this.awaiting_restart = false;
                return Admission::Accept;
            }
            return Admission::Skip;
        }
        if went_back {
            other.awaiting_restart = other.last.is_some();
            other.skipped = 0;
            return Admission::Restarted;
        }
        Admission::Accept
    }
}

pub(crate) fn run_join_loop<S: CropSource>(
    input: Receiver<Joined>,
    mut synchronizer: SequenceSynchronizer<Joined>,
    mut matcher: CropMatcher<S>,
    mut decoder: Option<Box<dyn CropDecoder>>,
    output: SyncSender<FrameResult>,
    running: Arc<AtomicBool>,
) -> JoinLoopReport {
    let mut guard = RestartGuard::default();
    let mut restarts = 0u64;
    let mut skipped_after_restart = 0u64;
    let mut frames_emitted = 0u64;
    while running.load(Ordering::SeqCst) {
        let Ok(joined) = input.recv() else {
            break;
        };
        let (identifier, seq) = match &joined {
            Joined::Detections(frame) => (DETECTIONS_ID, frame.sequence_number),
            Joined::Mosaic(frame) => (MOSAIC_ID, frame.frame.sequence_number),
        };
        match guard.admit(identifier, seq) {
            Admission::Accept => {}
            Admission::Restarted => {
                log::error!(
                    "{} restarted at sequence {}, dropping {} pending frames",
                    identifier,
                    seq,
                    synchronizer.pending()
                );
                synchronizer.clear();
                matcher.clear();
                restarts += 1;
            }
            Admission::Skip => {
                log::debug!("skipping {} {} from before the restart", identifier, seq);
                skipped_after_restart += 1;
                continue;
            }
        }
        let Some(group) = synchronizer.add_message(identifier, seq, joined) else {
            continue;
        };
        let Some((detections, mosaic)) = split_group(group) else {
            log::error!("sync group {} missing a stream", seq);
            continue;
        };

        let mut crops = matcher.resolve_frame(&detections);
        matcher.discard_through(seq);
        if let Some(decoder) = decoder.as_mut() {
            for matched in crops.iter_mut() {
                if let Some(label) = decoder.decode(&matched.crop) {
                    log::debug!("{} decoded {:?} in sequence {}", decoder.name(), label, seq);
                    matched.detection.label = Some(label);
                }
            }
        }

        let result = FrameResult {
            sequence_number: seq,
            mosaic,
            detections,
            crops,
        };
        if output.send(result).is_err() {
            log::warn!("result consumer gone, stopping join loop");
            break;
        }
        frames_emitted += 1;
    }
    log::debug!("join loop exiting after {} frames", frames_emitted);
    JoinLoopReport {
        sync: synchronizer.stats(),
        crops: matcher.stats(),
        restarts,
        skipped_after_restart,
        frames_emitted,
    }
}

fn split_group(mut group: SyncGroup<Joined>) -> Option<(ReassembledFrame, MosaicFrame)> {
    let detections = match group.remove(DETECTIONS_ID)? {
        Joined::Detections(frame) => frame,
        Joined::Mosaic(_) => return None,
    };
    let mosaic = match group.remove(MOSAIC_ID)? {
        Joined::Mosaic(frame) => frame,
        Joined::Detections(_) => return None,
    };
    Some((detections, mosaic))
}

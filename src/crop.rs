//! Crop-to-detection matching across independently sequenced streams.
//!
//! Each frame-space detection was made in a specific image crop, but crops
//! arrive on their own queue at their own pace. `CropMatcher` pairs them by
//! sequence number, in order, with a small lookahead buffer:
//!
//! - crop older than the box: stale, discard and pull again;
//! - crop newer than the box: the box's crop was lost; push the crop back (it
//!   belongs to a later box) and report no match;
//! - equal: match.
//!
//! Upstream publishes one crop per raw detection, before suppression, so a
//! frame is resolved against its full candidate list and only then narrowed to
//! the survivors. A box is never paired with a crop from a different frame.
//! The price is an occasional missing match.

use std::collections::VecDeque;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use crate::message::{CropRecord, FrameDetection, Sequenced};
use crate::reassemble::ReassembledFrame;

pub const DEFAULT_LOOKAHEAD_CAPACITY: usize = 20;
pub const DEFAULT_CROP_BUFFER_CAPACITY: usize = 512;

/// Pull-based crop supply.
pub trait CropSource {
    /// Next crop, blocking until one is available. `None` means the stream
    /// has ended.
    fn next_crop(&mut self) -> Option<CropRecord>;

    /// Next crop if one is already available.
    fn try_next_crop(&mut self) -> Option<CropRecord>;
}

impl CropSource for Receiver<CropRecord> {
    fn next_crop(&mut self) -> Option<CropRecord> {
        self.recv().ok()
    }

    fn try_next_crop(&mut self) -> Option<CropRecord> {
        self.try_recv().ok()
    }
}

impl CropSource for VecDeque<CropRecord> {
    fn next_crop(&mut self) -> Option<CropRecord> {
        self.pop_front()
    }

    fn try_next_crop(&mut self) -> Option<CropRecord> {
        self.pop_front()
    }
}

// ----------------------------------------------------------------------------
// Bounded crop buffer
// ----------------------------------------------------------------------------

struct BufferState {
    queue: VecDeque<CropRecord>,
    closed: bool,
    overflow_dropped: u64,
}

struct BufferShared {
    state: Mutex<BufferState>,
    available: Condvar,
    capacity: usize,
}

impl BufferShared {
    fn lock(&self) -> Result<MutexGuard<'_, BufferState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("crop buffer lock poisoned"))
    }
}

/// Bounded hand-off between the crop pull loop and the matcher.
///
/// Pushing never blocks. When the buffer is full the oldest crop is dropped.
pub fn crop_buffer(capacity: usize) -> Result<(CropBufferWriter, CropBufferReader)> {
    if capacity == 0 {
        return Err(anyhow!("crop buffer capacity must be greater than zero"));
    }
    let shared = Arc::new(BufferShared {
        state: Mutex::new(BufferState {
            queue: VecDeque::with_capacity(capacity),
            closed: false,
            overflow_dropped: 0,
        }),
        available: Condvar::new(),
        capacity,
    });
    Ok((
        CropBufferWriter {
            shared: shared.clone(),
        },
        CropBufferReader { shared },
    ))
}

/// Producer half of [`crop_buffer`]. Dropping it ends the stream.
pub struct CropBufferWriter {
    shared: Arc<BufferShared>,
}

impl CropBufferWriter {
    /// Queue `crop`, returning the crop evicted to make room, if any.
    pub fn push(&self, crop: CropRecord) -> Result<Option<CropRecord>> {
        let mut state = self.shared.lock()?;
        let evicted = if state.queue.len() >= self.shared.capacity {
            state.overflow_dropped += 1;
            state.queue.pop_front()
        } else {
            None
        };
        state.queue.push_back(crop);
        drop(state);
        self.shared.available.notify_one();

        if let Some(dropped) = &evicted {
            log::warn!(
                "crop buffer full ({}), dropping crop {}",
                self.shared.capacity,
                dropped.sequence_number
            );
        }
        Ok(evicted)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().map(|state| state.queue.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overflow_dropped(&self) -> u64 {
        self.shared
            .lock()
            .map(|state| state.overflow_dropped)
            .unwrap_or(0)
    }
}

impl Drop for CropBufferWriter {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.lock() {
            state.closed = true;
        }
        self.shared.available.notify_all();
    }
}

/// Consumer half of [`crop_buffer`].
pub struct CropBufferReader {
    shared: Arc<BufferShared>,
}

impl CropSource for CropBufferReader {
    fn next_crop(&mut self) -> Option<CropRecord> {
        let mut state = match self.shared.lock() {
            Ok(state) => state,
            Err(e) => {
                log::error!("{}", e);
                return None;
            }
        };
        loop {
            if let Some(crop) = state.queue.pop_front() {
                return Some(crop);
            }
            if state.closed {
                return None;
            }
            state = match self.shared.available.wait(state) {
                Ok(state) => state,
                Err(_) => {
                    log::error!("crop buffer lock poisoned");
                    return None;
                }
            };
        }
    }

    fn try_next_crop(&mut self) -> Option<CropRecord> {
        self.shared.lock().ok()?.queue.pop_front()
    }
}

// ----------------------------------------------------------------------------
// Matching
// ----------------------------------------------------------------------------

/// Outcome of resolving one bounding box.
#[derive(Debug)]
pub enum CropMatch {
    Matched(CropRecord),
    /// The crop for this box never arrived; the next available crop belongs
    /// to `next_sequence`.
    Missing { next_sequence: u64 },
    /// The crop source ended.
    SourceClosed,
}

impl CropMatch {
    pub fn into_crop(self) -> Option<CropRecord> {
        match self {
            CropMatch::Matched(crop) => Some(crop),
            _ => None,
        }
    }
}

/// A detection paired with the crop it was made in.
#[derive(Debug)]
pub struct MatchedCrop {
    pub detection: FrameDetection,
    pub crop: CropRecord,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CropStats {
    pub matched: u64,
    /// Crops consumed by candidates that suppression removed.
    pub suppressed: u64,
    pub stale_discarded: u64,
    pub resync_failures: u64,
    pub overflow_dropped: u64,
}

pub struct CropMatcher<S> {
    source: S,
    lookahead: VecDeque<CropRecord>,
    capacity: usize,
    stats: CropStats,
}

impl<S: CropSource> CropMatcher<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            lookahead: VecDeque::new(),
            capacity: DEFAULT_LOOKAHEAD_CAPACITY,
            stats: CropStats::default(),
        }
    }

    pub fn with_capacity(source: S, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(anyhow!("crop lookahead capacity must be greater than zero"));
        }
        Ok(Self {
            capacity,
            ..Self::new(source)
        })
    }

    /// Crops held back for later boxes.
    pub fn buffered(&self) -> usize {
        self.lookahead.len()
    }

    pub fn stats(&self) -> CropStats {
        self.stats
    }

    /// Find the crop for one bounding box.
    pub fn resolve<B: Sequenced>(&mut self, bbox: &B) -> CropMatch {
        let wanted = bbox.sequence_number();
        loop {
            let Some(crop) = self.pop() else {
                return CropMatch::SourceClosed;
            };
            let seq = crop.sequence_number;
            if seq < wanted {
                log::debug!("discarding stale crop {} while looking for {}", seq, wanted);
                self.stats.stale_discarded += 1;
                continue;
            }
            if seq > wanted {
                log::warn!(
                    "crop resync failure: no crop for sequence {}, next crop is {}",
                    wanted,
                    seq
                );
                self.push_back(crop);
                self.stats.resync_failures += 1;
                return CropMatch::Missing { next_sequence: seq };
            }
            self.stats.matched += 1;
            return CropMatch::Matched(crop);
        }
    }

    /// Resolve every candidate of a frame in arrival order and keep the pairs
    /// whose detection survived suppression. Survivors without a crop are
    /// dropped from the result.
    pub fn resolve_frame(&mut self, frame: &ReassembledFrame) -> Vec<MatchedCrop> {
        let expected = frame.survivors.len();
        let mut matched = Vec::with_capacity(expected);
        let mut survivors = frame.survivors.iter().copied().peekable();
        for (index, candidate) in frame.candidates.iter().enumerate() {
            let survives = survivors.next_if_eq(&index).is_some();
            match self.resolve(candidate) {
                CropMatch::Matched(crop) if survives => matched.push(MatchedCrop {
                    detection: candidate.clone(),
                    crop,
                }),
                CropMatch::Matched(_) => self.stats.suppressed += 1,
                CropMatch::Missing { .. } => {}
                CropMatch::SourceClosed => {
                    log::warn!(
                        "crop source closed while resolving sequence {}",
                        frame.sequence_number
                    );
                    break;
                }
            }
        }
        if matched.len() != expected {
            log::warn!(
                "matched {}/{} crops for sequence {}",
                matched.len(),
                expected,
                frame.sequence_number
            );
        }
        matched
    }

    /// Discard every crop at or below `sequence_number` that is already
    /// available, without waiting for more. Returns how many were dropped.
    pub fn discard_through(&mut self, sequence_number: u64) -> usize {
        let mut discarded = 0;
        while self
            .lookahead
            .front()
            .is_some_and(|crop| crop.sequence_number <= sequence_number)
        {
            self.lookahead.pop_front();
            discarded += 1;
        }
        if self.lookahead.is_empty() {
            while let Some(crop) = self.source.try_next_crop() {
                if crop.sequence_number > sequence_number {
                    self.lookahead.push_front(crop);
                    break;
                }
                discarded += 1;
            }
        }
        if discarded > 0 {
            log::debug!(
                "discarded {} stale crops through sequence {}",
                discarded,
                sequence_number
            );
        }
        self.stats.stale_discarded += discarded as u64;
        discarded
    }

    /// Forget held-back crops.
    pub fn clear(&mut self) {
        self.lookahead.clear();
    }

    fn pop(&mut self) -> Option<CropRecord> {
        self.lookahead
            .pop_front()
            .or_else(|| self.source.next_crop())
    }

    fn push_back(&mut self, crop: CropRecord) {
        self.lookahead.push_front(crop);
        while self.lookahead.len() > self.capacity {
            if let Some(dropped) = self.lookahead.pop_back() {
                log::warn!(
                    "crop lookahead full ({}), dropping crop {}",
                    self.capacity,
                    dropped.sequence_number
                );
                self.stats.overflow_dropped += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassemble::NmsConfig;
    use crate::Completeness;
    use image::RgbImage;

    fn crop(seq: u64, marker: u8) -> CropRecord {
        let mut image = RgbImage::new(2, 2);
        image.put_pixel(0, 0, image::Rgb([marker, 0, 0]));
        CropRecord::new(seq, image)
    }

    fn crops(seqs: &[u64]) -> VecDeque<CropRecord> {
        seqs.iter()
            .enumerate()
            .map(|(i, &seq)| crop(seq, i as u8))
            .collect()
    }

    fn bbox(seq: u64) -> FrameDetection {
        boxed(seq, 0.1, 0.9, 0)
    }

    fn boxed(seq: u64, xmin: f32, confidence: f32, tile_index: usize) -> FrameDetection {
        FrameDetection {
            xmin,
            ymin: 0.1,
            xmax: xmin + 0.1,
            ymax: 0.2,
            confidence,
            label: None,
            frame_sequence_number: seq,
            tile_index,
        }
    }

    fn frame(seq: u64, candidates: Vec<FrameDetection>) -> ReassembledFrame {
        ReassembledFrame::from_candidates(
            seq,
            candidates,
            Completeness::Complete,
            &NmsConfig::default(),
            (100, 100),
        )
    }

    fn marker(matched: &MatchedCrop) -> u8 {
        matched.crop.image.get_pixel(0, 0)[0]
    }

    #[test]
    fn missing_crop_does_not_consume_next_frame() {
        let mut matcher = CropMatcher::new(crops(&[10, 11, 11]));

        let first = matcher.resolve(&bbox(10)).into_crop().expect("seq 10 crop");
        assert_eq!(first.sequence_number, 10);

        match matcher.resolve(&bbox(10)) {
            CropMatch::Missing { next_sequence } => assert_eq!(next_sequence, 11),
            other => panic!("expected resync failure, got {:?}", other),
        }
        assert_eq!(matcher.buffered(), 1);

        let third = matcher.resolve(&bbox(11)).into_crop().expect("seq 11 crop");
        assert_eq!(third.sequence_number, 11);
        // the pushed-back crop is the first seq 11 crop, not the second
        assert_eq!(third.image.get_pixel(0, 0)[0], 1);
        assert_eq!(matcher.stats().resync_failures, 1);
    }

    #[test]
    fn stale_crops_are_skipped() {
        let mut matcher = CropMatcher::new(crops(&[3, 4, 4, 5]));
        let got = matcher.resolve(&bbox(5)).into_crop().unwrap();
        assert_eq!(got.sequence_number, 5);
        assert_eq!(matcher.stats().stale_discarded, 3);
    }

    #[test]
    fn closed_source_reports_closed() {
        let mut matcher = CropMatcher::new(crops(&[1]));
        assert!(matches!(matcher.resolve(&bbox(2)), CropMatch::SourceClosed));
    }

    #[test]
    fn resolve_frame_skips_unmatched_boxes() {
        let mut matcher = CropMatcher::new(crops(&[7, 8]));
        let frame = frame(7, vec![boxed(7, 0.1, 0.9, 0), boxed(7, 0.6, 0.9, 1)]);
        let matched = matcher.resolve_frame(&frame);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].crop.sequence_number, 7);
        assert_eq!(matcher.buffered(), 1);
    }

    #[test]
    fn low_confidence_candidate_keeps_its_crop() {
        // tile 0 falls below the confidence threshold; crops are marked 0, 1
        let mut matcher = CropMatcher::new(crops(&[5, 5]));
        let frame = frame(5, vec![boxed(5, 0.1, 0.3, 0), boxed(5, 0.6, 0.9, 1)]);
        assert_eq!(frame.survivors, vec![1]);

        let matched = matcher.resolve_frame(&frame);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].detection.tile_index, 1);
        assert_eq!(marker(&matched[0]), 1);
        assert_eq!(matcher.stats().suppressed, 1);
        assert_eq!(matcher.buffered(), 0);
    }

    #[test]
    fn overlap_suppressed_candidate_consumes_its_crop() {
        // 0 and 1 overlap and 1 wins on confidence; 2 stands alone
        let mut matcher = CropMatcher::new(crops(&[6, 6, 6, 7]));
        let frame = frame(
            6,
            vec![
                boxed(6, 0.10, 0.7, 0),
                boxed(6, 0.11, 0.9, 1),
                boxed(6, 0.60, 0.8, 2),
            ],
        );
        assert_eq!(frame.survivors, vec![1, 2]);

        let matched = matcher.resolve_frame(&frame);
        let markers: Vec<u8> = matched.iter().map(marker).collect();
        let tiles: Vec<usize> = matched.iter().map(|m| m.detection.tile_index).collect();
        assert_eq!(markers, vec![1, 2]);
        assert_eq!(tiles, vec![1, 2]);

        // the next frame still starts at its own first crop
        let next = matcher.resolve(&bbox(7)).into_crop().expect("seq 7 crop");
        assert_eq!(next.image.get_pixel(0, 0)[0], 3);
    }

    #[test]
    fn discard_through_drops_only_old_crops() {
        let mut matcher = CropMatcher::new(crops(&[2, 3, 3, 4, 5]));
        assert_eq!(matcher.discard_through(3), 3);
        assert_eq!(matcher.buffered(), 1);
        assert_eq!(matcher.stats().stale_discarded, 3);

        let next = matcher.resolve(&bbox(4)).into_crop().expect("seq 4 crop");
        assert_eq!(next.sequence_number, 4);
        assert_eq!(matcher.discard_through(10), 1);
        assert_eq!(matcher.discard_through(10), 0);
    }

    #[test]
    fn lookahead_is_bounded() {
        let mut matcher = CropMatcher::with_capacity(crops(&[]), 2).unwrap();
        for seq in [5, 6, 7] {
            matcher.push_back(crop(seq, 0));
        }
        assert_eq!(matcher.buffered(), 2);
        assert_eq!(matcher.stats().overflow_dropped, 1);
        assert!(CropMatcher::with_capacity(crops(&[]), 0).is_err());

        matcher.clear();
        assert_eq!(matcher.buffered(), 0);
    }

    #[test]
    fn pulls_from_channel_source() {
        let (tx, rx) = std::sync::mpsc::channel();
        tx.send(crop(2, 0)).unwrap();
        drop(tx);
        let mut matcher = CropMatcher::new(rx);
        assert!(matcher.resolve(&bbox(2)).into_crop().is_some());
        assert!(matches!(matcher.resolve(&bbox(3)), CropMatch::SourceClosed));
    }

    #[test]
    fn crop_buffer_drops_oldest_when_full() {
        let (writer, mut reader) = crop_buffer(3).unwrap();
        for seq in 1..=5 {
            writer.push(crop(seq, 0)).unwrap();
        }
        assert_eq!(writer.len(), 3);
        assert_eq!(writer.overflow_dropped(), 2);
        assert_eq!(reader.try_next_crop().unwrap().sequence_number, 3);

        drop(writer);
        assert_eq!(reader.next_crop().unwrap().sequence_number, 4);
        assert_eq!(reader.next_crop().unwrap().sequence_number, 5);
        assert!(reader.next_crop().is_none());
        assert!(crop_buffer(0).is_err());
    }

    #[test]
    fn crop_buffer_reader_waits_for_writer() {
        let (writer, mut reader) = crop_buffer(4).unwrap();
        let consumer = std::thread::spawn(move || reader.next_crop().map(|c| c.sequence_number));
        std::thread::sleep(std::time::Duration::from_millis(20));
        writer.push(crop(9, 0)).unwrap();
        assert_eq!(consumer.join().unwrap(), Some(9));
    }
}

use std::sync::atomic::AtomicBool;

use tilestream::ingest::render_frame;
use tilestream::{
    CropDecoder, CropRecord, Engine, EngineConfig, EngineStats, FrameResult, SyntheticConfig,
    SyntheticTileSource,
};

fn run_engine(
    config: &EngineConfig,
    synthetic: SyntheticConfig,
    cycles: u64,
    decoder: Option<Box<dyn CropDecoder>>,
) -> (Vec<FrameResult>, EngineStats) {
    let geometry = config.geometry().expect("geometry");
    let mut source = SyntheticTileSource::new(synthetic, geometry).expect("source");
    let (inputs, results, engine) = Engine::spawn(config, decoder).expect("spawn engine");

    let producer = std::thread::spawn(move || {
        let running = AtomicBool::new(true);
        source.feed(&inputs, cycles, &running, None)
    });
    let frames: Vec<FrameResult> = results.iter().collect();
    producer
        .join()
        .expect("producer thread")
        .expect("feed engine");
    let stats = engine.stop().expect("stop engine");
    (frames, stats)
}

#[test]
fn ragged_start_then_clean_frames() {
    let config = EngineConfig::default();
    let synthetic = SyntheticConfig {
        seed: 11,
        ragged_start: 4,
        ..SyntheticConfig::default()
    };
    // seq 1: ragged tail, seq 2: alignment cycle, seqs 3..=12 emitted
    let (frames, stats) = run_engine(&config, synthetic, 12, None);

    let seqs: Vec<u64> = frames.iter().map(|f| f.sequence_number).collect();
    assert_eq!(seqs, (3..=12).collect::<Vec<u64>>());
    assert_eq!(stats.detections_dropped_at_startup, 13);
    assert_eq!(stats.tiles_dropped_at_startup, 13);
    assert_eq!(stats.frames_emitted, 10);

    for frame in &frames {
        assert!(frame.detections.completeness.is_complete());
        assert!(frame.mosaic.completeness.is_complete());
        assert_eq!(frame.detections.sequence_number, frame.sequence_number);
        assert_eq!(frame.mosaic.frame.sequence_number, frame.sequence_number);
        assert_eq!(frame.detections.detections.len(), 9);

        let expected = render_frame(1280, 720, frame.sequence_number);
        assert!(
            frame.mosaic.frame.image == expected,
            "mosaic {} differs from the source frame",
            frame.sequence_number
        );

        assert_eq!(frame.crops.len(), 9);
        for matched in &frame.crops {
            assert_eq!(matched.crop.sequence_number, frame.sequence_number);
            let (_, _, w, h) = matched.detection.pixel_box(1280, 720);
            assert_eq!(matched.crop.image.width(), (w as u32).max(1));
            assert_eq!(matched.crop.image.height(), (h as u32).max(1));
        }
    }
    assert_eq!(stats.crops.resync_failures, 0);
    assert_eq!(stats.crops_overflowed, 0);
    assert_eq!(stats.reassembly.partial, 0);
}

#[test]
fn lossy_streams_never_mix_frames() {
    let config = EngineConfig::default();
    let synthetic = SyntheticConfig {
        seed: 3,
        detection_drop_rate: 0.05,
        tile_drop_rate: 0.05,
        crop_drop_rate: 0.1,
        ..SyntheticConfig::default()
    };
    let (frames, stats) = run_engine(&config, synthetic, 40, None);

    assert!(!frames.is_empty());
    assert_eq!(stats.frames_emitted, frames.len() as u64);
    for pair in frames.windows(2) {
        assert!(pair[0].sequence_number < pair[1].sequence_number);
    }
    for frame in &frames {
        assert_eq!(frame.detections.sequence_number, frame.sequence_number);
        assert_eq!(frame.mosaic.frame.sequence_number, frame.sequence_number);
        assert!(frame.crops.len() <= frame.detections.detections.len());
        for matched in &frame.crops {
            assert_eq!(matched.crop.sequence_number, frame.sequence_number);
            assert_eq!(matched.detection.frame_sequence_number, frame.sequence_number);
        }
    }
}

#[test]
fn suppressed_boxes_do_not_shift_crop_pairing() {
    let config = EngineConfig::default();
    let synthetic = SyntheticConfig {
        seed: 21,
        duplicate_rate: 0.5,
        low_confidence_rate: 0.5,
        ..SyntheticConfig::default()
    };
    let (frames, stats) = run_engine(&config, synthetic, 8, None);

    assert_eq!(frames.len(), 7);
    assert!(stats.crops.suppressed > 0);
    assert_eq!(stats.crops.resync_failures, 0);
    for frame in &frames {
        assert!(frame.detections.candidates.len() > frame.detections.detections.len());
        assert_eq!(frame.detections.detections.len(), 9);
        assert_eq!(frame.crops.len(), 9);

        // every crop is the region of the frame its detection points at
        let source = render_frame(1280, 720, frame.sequence_number);
        for matched in &frame.crops {
            let (x, y, w, h) = matched.detection.pixel_box(1280, 720);
            assert_eq!(matched.crop.image.width(), (w as u32).max(1));
            assert_eq!(matched.crop.image.height(), (h as u32).max(1));
            assert_eq!(
                matched.crop.image.get_pixel(0, 0),
                source.get_pixel(x as u32, y as u32),
                "crop of tile {} in frame {} came from elsewhere",
                matched.detection.tile_index,
                frame.sequence_number
            );
        }
    }
}

#[test]
fn stalled_join_keeps_crop_memory_bounded() {
    let mut config = EngineConfig::default();
    config.crop_buffer_capacity = 20;
    // no detection frame ever arrives, so nothing reads crops
    let synthetic = SyntheticConfig {
        detection_drop_rate: 1.0,
        ..SyntheticConfig::default()
    };
    let (frames, stats) = run_engine(&config, synthetic, 10, None);

    assert!(frames.is_empty());
    assert_eq!(stats.crops_received, 90);
    assert_eq!(stats.crops_overflowed, 70);
    assert_eq!(stats.crops.matched, 0);
}

struct SizeDecoder;

impl CropDecoder for SizeDecoder {
    fn name(&self) -> &'static str {
        "size"
    }

    fn decode(&mut self, crop: &CropRecord) -> Option<String> {
        Some(format!("{}x{}", crop.image.width(), crop.image.height()))
    }
}

#[test]
fn decoder_labels_matched_detections() {
    let config = EngineConfig::default();
    let (frames, _) = run_engine(
        &config,
        SyntheticConfig::default(),
        4,
        Some(Box::new(SizeDecoder)),
    );

    // cycle 1 aligns, 2..=4 emitted
    assert_eq!(frames.len(), 3);
    for matched in frames.iter().flat_map(|f| f.crops.iter()) {
        let expected = format!("{}x{}", matched.crop.image.width(), matched.crop.image.height());
        assert_eq!(matched.detection.label.as_deref(), Some(expected.as_str()));
    }
}

#[test]
fn smaller_grid_reconstructs_frames() {
    let mut config = EngineConfig::default();
    config.tiling.tile_count = 4;
    config.tiling.step = 0.5;
    config.tiling.overlap = 0.0;
    config.tiling.frame_width = 320;
    config.tiling.frame_height = 240;

    let (frames, _) = run_engine(&config, SyntheticConfig::default(), 5, None);
    assert_eq!(frames.len(), 4);
    for frame in &frames {
        assert_eq!(frame.detections.detections.len(), 4);
        assert!(frame.mosaic.frame.image == render_frame(320, 240, frame.sequence_number));
    }
}

#[test]
fn spawn_rejects_invalid_config() {
    let mut config = EngineConfig::default();
    config.tiling.tile_count = 8;
    assert!(Engine::spawn(&config, None).is_err());

    let mut config = EngineConfig::default();
    config.sync.eviction_batch_size = 0;
    assert!(Engine::spawn(&config, None).is_err());
}

#[test]
fn idle_engine_stops_cleanly() {
    let (inputs, results, engine) =
        Engine::spawn(&EngineConfig::default(), None).expect("spawn engine");
    engine.request_stop();
    drop(inputs);
    let stats = engine.stop().expect("stop engine");
    assert_eq!(stats.frames_emitted, 0);
    assert!(results.recv().is_err());
}

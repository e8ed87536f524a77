//! Sequence streaming demo - writes a synthetic frame sequence and plays it
//! through the streaming manager.
//!
//! Usage: cargo run --release --bin stream_sequence -- [OPTIONS]
//!
//! Options:
//!   --frames <N>         Frames in the sequence (default: 120)
//!   --frame-size <BYTES> Bytes per frame (default: 262144)
//!   --fps <FPS>          Playback rate (default: 24)
//!   --seconds <S>        Wall time to play (default: 5)
//!   --config <PATH>      Streaming config JSON (default: built-in defaults)
//!   --out <PATH>         Sequence file to write (default: <tmp>/volstream_demo.vseq)
//!   --loop               Loop playback
//!   --preload            Keep the whole file in memory

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use volstream::animation::SequencePlayer;
use volstream::core::{Error, Result, StreamingConfig};
use volstream::streaming::{AsyncReader, FileChunkSource, VolumeStreamingManager, write_sequence_file};

fn main() {
    volstream::core::logging::init();

    if let Err(e) = run() {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let frames = parse_u32_arg(&args, "--frames").unwrap_or(120);
    let frame_size = parse_usize_arg(&args, "--frame-size").unwrap_or(256 * 1024);
    let fps = parse_f32_arg(&args, "--fps").unwrap_or(24.0);
    let seconds = parse_f32_arg(&args, "--seconds").unwrap_or(5.0);
    let looping = args.iter().any(|a| a == "--loop");
    let preload = args.iter().any(|a| a == "--preload");
    let out = parse_str_arg(&args, "--out")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("volstream_demo.vseq"));

    let config = match parse_str_arg(&args, "--config") {
        Some(path) => StreamingConfig::load(&PathBuf::from(path))?,
        None => StreamingConfig::default(),
    };

    println!("=== Volstream Sequence Demo ===");
    println!("Frames: {} x {} bytes @ {} fps", frames, frame_size, fps);
    println!("Window: {} behind, {} ahead", config.frames_behind_to_cache, config.frames_ahead_to_cache);
    println!("Output: {}", out.display());
    println!();

    let payloads: Vec<Vec<u8>> = (0..frames).map(|i| vec![i as u8; frame_size]).collect();
    write_sequence_file(&out, &payloads)?;
    drop(payloads);

    let reader = Arc::new(AsyncReader::from_config(&config)?);
    let mut source = FileChunkSource::open(&out, reader)?;
    if preload {
        source = source.preload()?;
    }

    let manager = VolumeStreamingManager::new(config.clone());
    let volume = manager.add_volume(Arc::new(source));
    let cache = manager
        .cache(volume)
        .ok_or_else(|| Error::Streaming("volume vanished after registration".to_string()))?;

    let player = Arc::new(SequencePlayer::new(frames, fps, &config).with_readiness(cache));
    player.set_looping(looping);
    player.play();
    manager.add_streaming_owner(player.clone(), vec![volume]);

    let dt = 1.0 / fps.max(1.0);
    let ticks = (seconds * fps).ceil() as u32;
    let start = Instant::now();
    let mut displayed = 0u32;
    let mut stalled = 0u32;
    let mut corrupt = 0u32;

    for _ in 0..ticks {
        manager.update_resource_streaming();
        player.tick(dt);

        let frame = player.current_frame();
        match manager.map_chunk(volume, frame, true) {
            Some(chunk) => {
                if chunk.first().is_some_and(|b| *b != frame as u8) {
                    corrupt += 1;
                }
                displayed += 1;
                manager.unmap_chunk(volume, frame);
            }
            None => stalled += 1,
        }

        std::thread::sleep(Duration::from_secs_f32(dt));
    }

    let stats = manager.stats();
    let elapsed = start.elapsed();

    println!("=== Done in {:.2}s ===", elapsed.as_secs_f64());
    println!("Ticks:      {}", ticks);
    println!("Displayed:  {}", displayed);
    println!("Stalled:    {}", stalled);
    println!("Corrupt:    {}", corrupt);
    println!("Loops:      {}", player.loop_count());
    println!("Resident:   {:.1} KB", stats.resident_bytes as f64 / 1024.0);
    println!("Bandwidth:  {:.1} MB/s (last tick)", stats.bandwidth_bytes_per_sec / (1024.0 * 1024.0));

    manager.shutdown();

    if corrupt > 0 {
        return Err(Error::Streaming(format!("{} frames had unexpected contents", corrupt)));
    }
    Ok(())
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_u32_arg(args: &[String], flag: &str) -> Option<u32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

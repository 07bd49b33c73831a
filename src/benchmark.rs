use std::path::PathBuf;
use std::time::Instant;

use chrono::{Duration, Local, Utc};
use rand::Rng;
use tsarchive::storage::Metadata;
use tsarchive::{BatchOutcome, Historian, HistorianConfig, Record, Result};

const NUM_RECORDS: usize = 100_000;
const NUM_TOPICS: usize = 50;
const TIME_RANGE_SECS: i64 = 30 * 24 * 60 * 60; // 30 days

pub fn run_benchmarks(config: Option<HistorianConfig>) -> Result<()> {
    println!("Running benchmarks with {} records...", NUM_RECORDS);

    // Scratch directory unless a config was given
    let (config, scratch) = match config {
        Some(config) => (config, None),
        None => {
            let dir = std::env::temp_dir().join(format!("tsarchive-bench-{}", std::process::id()));
            (HistorianConfig::new(dir.join("historian.sqlite"), "1d"), Some(dir))
        }
    };

    let mut historian: Historian = Historian::new(&config)?;
    let records = generate_test_data();

    // Ingest benchmarks, each batch size against a freshly archived file
    let batch_sizes = [100, 1000, 10000];
    let mut ingest_times = Vec::with_capacity(batch_sizes.len());
    let mut rotation_times = Vec::with_capacity(batch_sizes.len());
    for &batch_size in &batch_sizes {
        rotation_times.push(benchmark_rotation(&mut historian)?);
        ingest_times.push(benchmark_ingest(&mut historian, &records, batch_size)?);
    }

    let duplicate_time = benchmark_duplicates(&mut historian, &records)?;

    println!("\nBenchmark Results:");
    println!("-----------------");
    println!("\nData Ingestion Results:");
    println!("----------------------");
    for (batch_size, ms) in batch_sizes.iter().zip(&ingest_times) {
        println!(
            "Batch size {}: {:.2}ms ({:.0} records/s)",
            batch_size,
            ms,
            NUM_RECORDS as f64 / (ms / 1000.0)
        );
    }
    println!("Duplicate batch rejection: {:.2}ms", duplicate_time);
    println!("\nArchive Rotation Results:");
    println!("------------------------");
    for ms in &rotation_times {
        println!("Rotation: {:.2}ms", ms);
    }
    println!("\n{:?}", historian.stats());

    historian.close()?;
    if let Some(dir) = scratch {
        cleanup(dir);
    }
    Ok(())
}

fn generate_test_data() -> Vec<Record> {
    let mut rng = rand::rng();
    let start = Utc::now() - Duration::seconds(TIME_RANGE_SECS);
    let step = TIME_RANGE_SECS * 1_000_000 / NUM_RECORDS as i64;

    (0..NUM_RECORDS)
        .map(|i| {
            let topic = rng.random_range(0..NUM_TOPICS);
            let mut metadata = Metadata::new();
            metadata.insert("type".to_string(), "float".to_string());
            metadata.insert("units".to_string(), "degF".to_string());

            // Random casing exercises the display name updates
            let device = if rng.random_bool(0.1) { "Device" } else { "device" };
            Record::new(
                start + Duration::microseconds(step * i as i64),
                format!("campus/building/{}{}/temperature", device, topic),
                rng.random::<f64>() * 100.0,
            )
            .with_metadata(metadata)
        })
        .collect()
}

fn benchmark_ingest(historian: &mut Historian, records: &[Record], batch_size: usize) -> Result<f64> {
    println!("Ingesting with batch size {}...", batch_size);
    let start = Instant::now();

    for chunk in records.chunks(batch_size) {
        historian.publish_batch(chunk)?;
    }

    let duration = start.elapsed().as_secs_f64() * 1000.0;
    println!("Batch size {} completed in {:.2}ms", batch_size, duration);
    Ok(duration)
}

fn benchmark_duplicates(historian: &mut Historian, records: &[Record]) -> Result<f64> {
    let start = Instant::now();
    let outcome = historian.publish_batch(&records[..1000.min(records.len())])?;
    let duration = start.elapsed().as_secs_f64() * 1000.0;

    if outcome != BatchOutcome::NotHandled {
        println!("Unexpected outcome for duplicate batch: {:?}", outcome);
    }
    Ok(duration)
}

fn benchmark_rotation(historian: &mut Historian) -> Result<f64> {
    let now = Local::now();
    historian.store_mut().set_next_rotation(now);

    let start = Instant::now();
    historian.run_maintenance_at(now, None, None)?;
    Ok(start.elapsed().as_secs_f64() * 1000.0)
}

fn cleanup(dir: PathBuf) {
    if let Err(err) = std::fs::remove_dir_all(&dir) {
        log::warn!("Failed to remove {}: {}", dir.display(), err);
    }
}

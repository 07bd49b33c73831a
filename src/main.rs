mod benchmark;

use benchmark::run_benchmarks;
use tsarchive::HistorianConfig;

fn main() -> tsarchive::Result<()> {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => Some(HistorianConfig::from_path(path)?),
        None => None,
    };

    run_benchmarks(config)
}

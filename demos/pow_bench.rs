use std::time::Instant;

use skadnode::{Identity, PuzzleParams};

const RUNS: u32 = 5;

fn main() -> anyhow::Result<()> {
    for difficulty in [8, 12, 16] {
        let params = PuzzleParams::new(difficulty, difficulty)?;
        println!("Benchmarking identity generation at difficulty {difficulty}/{difficulty} ({RUNS} runs)...");

        let mut total_ms = 0u128;
        for run in 1..=RUNS {
            let start = Instant::now();
            let identity = Identity::generate(params)?;
            let ms = start.elapsed().as_millis();
            total_ms += ms;
            println!("  Run {run}: {ms}ms (id {}, nonce {})", identity.id().short(), identity.nonce());
        }
        println!("  Average: {}ms\n", total_ms / u128::from(RUNS));
    }
    Ok(())
}

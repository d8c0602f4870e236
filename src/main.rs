//! Demo binary: runs a small local-queue search end to end.
//!
//! Three hydrogen dimers are tracked through the full job lifecycle
//! against a generic shell-script "optimizer", which is enough to watch
//! the scheduler write inputs, submit, poll and collect results.
mod config;

use std::sync::Arc;

use evo_core::{InMemoryEventLog, Optimizer, Scheduler, TracingEventSink};
use evo_domain::{Composition, Structure};
use evo_optimizer::{KeywordEnergyReader, ProgramOptimizer, ProgramSpec};
use evo_queue::{LocalQueue, LocalQueueConfig};

use crate::config::AppConfig;

const JOB_SCRIPT: &str = "\
# structure %gen%x%id%, step %optStep%
sleep 0.1
echo \"atoms: %numAtoms%\"
echo \"Final energy = -%numAtoms%.5\"
echo \"demo optimization complete\"
";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env();

    let spec = ProgramSpec::generic()
        .with_template("job.sh", JOB_SCRIPT)
        .with_completion_marker("demo optimization complete")
        .with_local_run(
            evo_core::LocalRunSpec::new("sh")
                .arg("job.sh")
                .stdout("job.out")
                .stderr("job.err"),
        )
        .with_description("local demo search");
    let optimizer = Arc::new(ProgramOptimizer::new(
        spec,
        Arc::new(KeywordEnergyReader::new("Final energy")),
    ));
    let run_spec = optimizer
        .local_run_spec()
        .ok_or("the demo optimizer must declare a local run command")?;

    let queue = Arc::new(LocalQueue::new(
        LocalQueueConfig {
            base_dir: config.working_dir.clone(),
            log_error_dirs: true,
        },
        run_spec,
    ));

    let log = Arc::new(InMemoryEventLog::new());
    let scheduler = Scheduler::builder(queue, optimizer)
        .options(config.scheduler.clone())
        .event_sink(log.clone())
        .event_sink(Arc::new(TracingEventSink))
        .build();
    scheduler.is_ready_to_search()?;

    for i in 1..=3u32 {
        let offset = 0.70 + 0.02 * i as f64;
        let structure = Structure::new(
            0,
            i,
            Composition::from_pairs(&[("H", 2)]),
            vec!["H".into(), "H".into()],
            vec![[0.0; 3], [offset, 0.0, 0.0]],
            None,
            config.working_dir.join(format!("0x{i}")),
        )?;
        scheduler.track(structure).await;
    }

    if !Arc::clone(&scheduler).run_until_settled(120).await {
        tracing::warn!("search did not settle within the pass budget");
    }

    for handle in scheduler.tracker().handles() {
        let s = handle.read().await;
        println!(
            "structure {} -> {} (energy: {:?}, {} history entries)",
            s.tag(),
            s.state,
            s.current_energy(),
            s.history.len()
        );
    }
    println!("{} scheduler events recorded", log.list().len());
    Ok(())
}

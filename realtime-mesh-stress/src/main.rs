//! Stress test for `realtime-mesh`: concurrent producers submitting terrain updates, a render
//! loop consuming them, and collision cooking on a worker pool, all against in-memory
//! stand-ins for the graphics API and physics engine. Prints statistics, and fails if the
//! consumers do not converge on the producers' final state.

// Crate-specific lint settings. (General settings can be found in the workspace manifest.)
#![forbid(unsafe_code)]

use std::time::Instant;

use clap::Parser as _;

mod command_options;
use command_options::StressArgs;
mod logging;
mod settings;
mod stress;

fn main() -> Result<(), anyhow::Error> {
    let options = StressArgs::parse();
    let duration = options.duration()?;
    let frame_period = options.frame_period()?;
    // Destructure as a check that we're using/skipping all the args
    let StressArgs {
        sections,
        grid,
        producers,
        duration: _,
        frame_rate: _,
        seed,
        logging: logging_args,
        settings: settings_args,
    } = options;

    logging::install(&logging_args)?;

    let config = settings_args.build_config()?;
    log::debug!("configuration: {config:?}");

    let start_time = Instant::now();
    let stats = stress::run(&stress::StressParams {
        config,
        sections,
        grid,
        producers,
        duration,
        frame_period,
        seed: seed.unwrap_or(0),
    })?;
    log::debug!("finished in {:.3} s", start_time.elapsed().as_secs_f64());

    println!("{stats}");
    Ok(())
}

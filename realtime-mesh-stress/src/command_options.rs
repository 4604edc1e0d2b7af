//! Command line option parsing.

use std::time::Duration;

use clap::Parser;

use crate::logging::LoggingArgs;
use crate::settings::SettingsArgs;

#[derive(Clone, Debug, Parser)]
#[command(about, version)]
pub(crate) struct StressArgs {
    /// Number of mesh sections.
    #[arg(long = "sections", default_value_t = 16)]
    pub(crate) sections: u32,

    /// Cells along each side of a section's most detailed LOD.
    #[arg(long = "grid", default_value_t = 32, value_parser = clap::value_parser!(u32).range(1..=1024))]
    pub(crate) grid: u32,

    /// Number of threads submitting updates concurrently.
    #[arg(long = "producers", short = 'p', default_value_t = 2)]
    pub(crate) producers: usize,

    /// How long the producers run, in seconds.
    #[arg(long = "duration", value_name = "SECONDS", default_value_t = 5.0)]
    pub(crate) duration: f64,

    /// Frames per second of the render loop.
    #[arg(long = "frame-rate", value_name = "FPS", default_value_t = 60.0)]
    pub(crate) frame_rate: f64,

    /// Seed for the producers' choices of what to modify.
    ///
    /// May be an integer between 0 and 18446744073709551615 (2⁶⁴ - 1).
    /// If not specified, 0 is used.
    #[arg(long = "seed")]
    pub(crate) seed: Option<u64>,

    #[command(flatten)]
    pub(crate) logging: LoggingArgs,

    #[command(flatten)]
    pub(crate) settings: SettingsArgs,
}

impl StressArgs {
    pub(crate) fn duration(&self) -> Result<Duration, anyhow::Error> {
        Duration::try_from_secs_f64(self.duration)
            .map_err(|_| anyhow::anyhow!("--duration must be a non-negative number of seconds"))
    }

    pub(crate) fn frame_period(&self) -> Result<Duration, anyhow::Error> {
        if self.frame_rate.is_nan() || self.frame_rate <= 0.0 {
            anyhow::bail!("--frame-rate must be positive");
        }
        Duration::try_from_secs_f64(self.frame_rate.recip())
            .map_err(|_| anyhow::anyhow!("--frame-rate is out of range"))
    }
}

//! CLI argument parsing using clap

use clap::{Parser, Subcommand};

/// avmux - drift-corrected A/V sync engine
///
/// Interleave independently-clocked audio and video streams into one
/// time-ordered stream for a downstream encoder
#[derive(Parser, Debug)]
#[command(name = "avmux")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Verbose output (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode - only show errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log output to file
    #[arg(long, global = true)]
    pub log: Option<String>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the engine against synthetic tone and test-pattern sources
    Run {
        /// Number of synthetic audio streams
        #[arg(short, long, default_value = "2")]
        audio_streams: usize,

        /// How long to run in seconds (0 = until Ctrl+C)
        #[arg(short, long, default_value = "10")]
        seconds: u64,

        /// Ring buffer span in seconds
        #[arg(short, long, default_value = "10")]
        buffer: u32,

        /// Path to a session config file (avmux.toml found automatically)
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Print a sample session configuration file
    SampleConfig,
}

impl Args {
    /// Get the log level based on verbose/quiet flags
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else {
            match self.verbose {
                0 => tracing::Level::INFO,
                1 => tracing::Level::DEBUG,
                _ => tracing::Level::TRACE,
            }
        }
    }
}

impl Default for Command {
    fn default() -> Self {
        // Default to a short synthetic run
        Command::Run {
            audio_streams: 2,
            seconds: 10,
            buffer: 10,
            config: None,
        }
    }
}

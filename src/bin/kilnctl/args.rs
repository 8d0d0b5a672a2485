use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Store connection URL.
    #[arg(short, long, default_value = "redis://127.0.0.1:6379")]
    pub(crate) url: String,
    /// Key namespace prefix.
    #[arg(short, long, default_value = "q")]
    pub(crate) prefix: String,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Print per-state job counts, known types, and total work time.
    Stats,
    /// Tail the activity feed until interrupted.
    Watch,
    /// Run delayed-job promotion until interrupted.
    Promote {
        /// Promotion check interval in milliseconds.
        #[arg(short, long, default_value_t = 5000)]
        interval: u64,
    },
}

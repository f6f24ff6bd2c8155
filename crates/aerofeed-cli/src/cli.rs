//! CLI argument definitions for aerofeed.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `query station` | Weather and notices for an airport |
//! | `query aircraft` | Live state of one aircraft |
//! | `query area` | Everything reported around a point |
//! | `health` | Circuit state of each source |
//! | `reset` | Re-enable a source after its circuit opened |
//! | `cache` | Inspect or clear a cache namespace |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--config` | built-in sources | JSON configuration file |
//! | `--pretty` | `false` | Pretty-print JSON output |
//! | `--no-merge` | `false` | Return per-source records unmerged |
//! | `--verbose` | `false` | Debug logging on stderr |
//!
//! # Examples
//!
//! ```bash
//! aerofeed query station KJFK --pretty
//! aerofeed query area --lat 40.64 --lon -73.78 --radius-nm 25 --max-age-secs 60
//! aerofeed health
//! aerofeed reset opensky
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Aviation data from several upstream feeds, cached and merged.
#[derive(Debug, Parser)]
#[command(
    name = "aerofeed",
    author,
    version,
    about = "Resilient multi-source aviation data CLI",
    long_about = "aerofeed queries METAR, NOTAM and ADS-B feeds concurrently, caches their \
answers locally and merges overlapping reports into one record per station or aircraft.\n\
\n\
Data lives under $AEROFEED_HOME (default ~/.aerofeed)."
)]
pub struct Cli {
    /// JSON configuration file; the built-in public feeds are used when omitted.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Return every source's records separately instead of merging them.
    #[arg(long, global = true, default_value_t = false)]
    pub no_merge: bool,

    /// Log debug output to stderr (overridden by RUST_LOG).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Query the configured feeds.
    Query(QueryArgs),

    /// Show circuit state for one source or all of them.
    ///
    ///   aerofeed health
    ///   aerofeed health opensky
    Health(HealthArgs),

    /// Close an open circuit so the source is queried again.
    Reset(ResetArgs),

    /// Cache management commands.
    Cache(CacheArgs),
}

#[derive(Debug, Args)]
pub struct QueryArgs {
    #[command(subcommand)]
    pub command: QueryCommand,
}

#[derive(Debug, Subcommand)]
pub enum QueryCommand {
    /// Observations and notices for an airport ICAO code.
    Station {
        /// e.g. KJFK
        icao: String,
    },

    /// Live state for an ICAO 24-bit address.
    Aircraft {
        /// Six hex digits, e.g. a1b2c3
        hex: String,
    },

    /// Everything reported within a radius of a point.
    Area(AreaArgs),
}

#[derive(Debug, Args)]
pub struct AreaArgs {
    #[arg(long, allow_hyphen_values = true)]
    pub lat: f64,

    #[arg(long, allow_hyphen_values = true)]
    pub lon: f64,

    #[arg(long)]
    pub radius_nm: f64,

    /// Drop records observed longer ago than this.
    #[arg(long)]
    pub max_age_secs: Option<u64>,
}

#[derive(Debug, Args)]
pub struct HealthArgs {
    pub service: Option<String>,
}

#[derive(Debug, Args)]
pub struct ResetArgs {
    pub service: String,
}

#[derive(Debug, Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Hit/miss counters for a namespace, or all namespaces used by this process.
    Stats { namespace: Option<String> },

    /// Remove every entry in a namespace, memory and disk.
    Clear { namespace: String },
}

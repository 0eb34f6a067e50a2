use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "beebox")]
#[command(about = "A CLI tool for merging and reconciling bee-hotel observation records")]
#[command(version = "1.0")]
pub(crate) struct Args {
    /// Local cache file for the authoritative table
    #[arg(short, long, default_value = "observations.csv")]
    pub data_file: String,

    /// Remote path of the master table
    #[arg(long, default_value = "/observations/observations.csv")]
    pub master_path: String,

    /// Remote folder holding per-observation fragment files
    #[arg(long, default_value = "/observations/csv")]
    pub fragment_folder: String,

    /// Remote folder holding uploaded photos
    #[arg(long, default_value = "/observations/photos")]
    pub photos_folder: String,

    /// Base delay between request retries in milliseconds
    #[arg(long, default_value = "500")]
    pub delay: u64,

    /// Maximum number of retry attempts per request
    #[arg(short, long, default_value = "3")]
    pub retries: u32,

    /// Maximum number of concurrent fragment downloads
    #[arg(short, long, default_value = "5")]
    pub concurrent: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Merge a batch of newly recorded observations into the authoritative table
    Submit {
        /// CSV file holding the new records (one row per filled nest hole)
        #[arg(short, long)]
        input: String,
    },

    /// Rebuild the master table from every per-observation fragment file
    Reconcile,

    /// Print the most recent reading per nest hole of one hotel, the
    /// values a new observation form would be prefilled with
    Defaults {
        /// Hotel code to look up
        #[arg(long)]
        hotel: String,
    },

    /// Load the authoritative table and print a summary
    Show {
        /// Resolve missing photo links from the photos folder
        #[arg(long)]
        resolve_links: bool,
    },
}

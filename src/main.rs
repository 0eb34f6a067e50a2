mod dropbox;
mod parse;
mod record;
mod remote;
mod store;
mod util;

use crate::dropbox::{DropboxClient, DropboxConfig};
use crate::parse::{Args, Command};
use crate::record::{Observation, stamp_new_batch};
use crate::store::{ObservationStore, latest_for_hole};
use crate::util::print_hms;
use clap::Parser;
use log::{info, warn};
use std::collections::HashMap;
use std::time::Instant;

/// Utility functions
pub fn read_batch(path: &str) -> Result<Vec<Observation>, Box<dyn std::error::Error>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        records.push(row?);
    }
    Ok(records)
}

pub fn print_summary(records: &[Observation]) {
    if records.is_empty() {
        println!("No observations to summarize");
        return;
    }

    println!("\nSummary:");
    println!("Total observations: {}", records.len());

    let unique_submissions: std::collections::HashSet<&String> = records
        .iter()
        .map(|r| &r.submission_id)
        .filter(|id| !id.is_empty())
        .collect();
    println!("Total submissions: {}", unique_submissions.len());

    let unique_observers: std::collections::HashSet<&String> = records
        .iter()
        .map(|r| &r.observer)
        .filter(|name| !name.is_empty())
        .collect();
    println!("Unique observers: {}", unique_observers.len());

    let unique_species: std::collections::HashSet<&String> = records
        .iter()
        .map(|r| &r.scientific_name)
        .filter(|name| !name.is_empty())
        .collect();
    println!("Unique species: {}", unique_species.len());

    let total_bees: u64 = records
        .iter()
        .map(|r| {
            u64::from(r.num_males.unwrap_or(0)) + u64::from(r.num_females.unwrap_or(0))
        })
        .sum();
    println!("Bees observed: {total_bees}");

    // Get date range
    let dates: Vec<&String> = records
        .iter()
        .map(|r| &r.obs_date)
        .filter(|date| !date.is_empty())
        .collect();

    if !dates.is_empty() {
        let min_date = dates.iter().min().unwrap();
        let max_date = dates.iter().max().unwrap();
        println!("Date range: {} to {}", min_date, max_date);
    }

    // Busiest hotels
    let mut hotel_counts: HashMap<&String, usize> = HashMap::new();
    for record in records {
        if !record.hotel_code.is_empty() {
            *hotel_counts.entry(&record.hotel_code).or_insert(0) += 1;
        }
    }

    let mut sorted_hotels: Vec<_> = hotel_counts.into_iter().collect();
    sorted_hotels.sort_by(|a, b| b.1.cmp(&a.1));

    println!("Busiest hotels:");
    for (hotel, count) in sorted_hotels.iter().take(3) {
        println!("  {}: {}", hotel, count);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::try_parse()?;
    // Initialize logger
    env_logger::init();

    let remote = match DropboxConfig::load() {
        Some(config) => match DropboxClient::connect(config).await {
            Ok(client) => Some(client.with_delay(args.delay).with_max_retries(args.retries)),
            Err(e) => {
                warn!("Dropbox unavailable, running local-only: {e}");
                None
            }
        },
        None => {
            info!("No Dropbox credentials found, running local-only");
            None
        }
    };

    let store = ObservationStore::new(remote)
        .with_data_file(&args.data_file)
        .with_master_path(&args.master_path)
        .with_fragment_folder(&args.fragment_folder)
        .with_photos_folder(&args.photos_folder)
        .with_max_concurrent(args.concurrent);

    let start = Instant::now();
    let table = match args.command {
        Command::Submit { input } => {
            let mut batch = read_batch(&input)?;
            if batch.is_empty() {
                println!("No rows found in {input}; nothing to submit");
                return Ok(());
            }
            stamp_new_batch(&mut batch);
            let batch_size = batch.len();

            // Fragments first: they are the durable backstop if the
            // master write below loses a race
            store.upload_fragments(&batch).await;
            let merged = store.merge_and_persist(batch).await;
            println!("Recorded {batch_size} observation(s)");
            merged
        }
        Command::Reconcile => {
            println!("Reconciling master table from fragments...");
            store.reconcile_full().await
        }
        Command::Defaults { hotel } => {
            let table = store.load_authoritative().await;
            let mut holes: Vec<&String> = table
                .iter()
                .filter(|r| r.hotel_code == hotel)
                .map(|r| &r.nest_hole)
                .collect::<std::collections::HashSet<_>>()
                .into_iter()
                .collect();
            holes.sort();

            if holes.is_empty() {
                println!("No observations recorded yet for hotel {hotel}");
            } else {
                println!("Latest readings for hotel {hotel}:");
                for hole in holes {
                    if let Some(latest) = latest_for_hole(&table, &hotel, hole) {
                        println!(
                            "  {hole}: {} ({} M / {} F) [{}] at {}",
                            latest.scientific_name,
                            latest.num_males.unwrap_or(0),
                            latest.num_females.unwrap_or(0),
                            latest.social_behaviours().join("; "),
                            latest.submission_time
                        );
                    }
                }
            }
            table
        }
        Command::Show { resolve_links } => {
            let mut table = store.load_authoritative().await;
            if resolve_links {
                store.resolve_photo_links(&mut table).await;
            }
            table
        }
    };

    print_hms(&start);
    print_summary(&table);

    Ok(())
}

use crate::record::Observation;
use crate::remote::{BlobError, BlobStore};
use chrono::Local;
use csv::{Reader, Writer};
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_DATA_FILE: &str = "observations.csv";
pub const DEFAULT_MASTER_PATH: &str = "/observations/observations.csv";
pub const DEFAULT_FRAGMENT_FOLDER: &str = "/observations/csv";
pub const DEFAULT_PHOTOS_FOLDER: &str = "/observations/photos";

/// The authoritative observation table, mirrored between a local CSV
/// cache and a remote blob store.
///
/// All three core operations absorb I/O failures into degraded results;
/// none of them returns an error. Every fragment file is durably
/// retained on the remote side, so a master lost to a racing overwrite
/// can always be rebuilt with `reconcile_full`.
pub struct ObservationStore<B: BlobStore> {
    remote: Option<B>,
    data_file: PathBuf,
    master_path: String,
    fragment_folder: String,
    photos_folder: String,
    max_concurrent: usize,
}

impl<B: BlobStore> ObservationStore<B> {
    pub fn new(remote: Option<B>) -> Self {
        Self {
            remote,
            data_file: PathBuf::from(DEFAULT_DATA_FILE),
            master_path: DEFAULT_MASTER_PATH.to_string(),
            fragment_folder: DEFAULT_FRAGMENT_FOLDER.to_string(),
            photos_folder: DEFAULT_PHOTOS_FOLDER.to_string(),
            max_concurrent: 5,
        }
    }

    pub fn with_data_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_file = path.into();
        self
    }

    pub fn with_master_path(mut self, path: &str) -> Self {
        self.master_path = path.to_string();
        self
    }

    pub fn with_fragment_folder(mut self, path: &str) -> Self {
        self.fragment_folder = path.trim_end_matches('/').to_string();
        self
    }

    pub fn with_photos_folder(mut self, path: &str) -> Self {
        self.photos_folder = path.trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Current authoritative table: remote master if present and
    /// non-empty, else a rebuild from fragment files, else the local
    /// cache, else empty. Never fails.
    pub async fn load_authoritative(&self) -> Vec<Observation> {
        if self.remote.is_none() {
            return self.read_local();
        }
        if let Some(master) = self.fetch_master().await {
            return master;
        }
        let fragments = self.collect_fragments().await;
        if !fragments.is_empty() {
            return resolve_duplicates(fragments);
        }
        self.read_local()
    }

    /// Incremental merge used on every submission: one cheap master read
    /// (local cache as fallback), append the new records, dedup, then
    /// persist to both sinks best-effort. Local write and remote upload
    /// are independent; neither failure rolls back the other or fails
    /// the merge.
    pub async fn merge_and_persist(&self, new_records: Vec<Observation>) -> Vec<Observation> {
        let mut combined = match self.fetch_master().await {
            Some(master) => master,
            None => self.read_local(),
        };
        let new_count = new_records.len();
        combined.extend(new_records);
        let merged = resolve_duplicates(combined);

        if let Err(e) = self.write_local(&merged) {
            warn!(
                "Failed to write local cache {}: {e}",
                self.data_file.display()
            );
        }
        self.upload_master(&merged).await;

        info!(
            "Merged {new_count} new record(s) into authoritative table of {}",
            merged.len()
        );
        merged
    }

    /// Full reconciliation used at cold start when no trusted master
    /// exists: download every fragment (corrupt or unreadable ones are
    /// skipped individually), merge with the local cache, dedup, and
    /// persist the result to both sinks.
    pub async fn reconcile_full(&self) -> Vec<Observation> {
        let mut records = self.read_local();
        records.extend(self.collect_fragments().await);
        let merged = resolve_duplicates(records);

        if let Err(e) = self.write_local(&merged) {
            warn!(
                "Failed to write local cache {}: {e}",
                self.data_file.display()
            );
        }
        self.upload_master(&merged).await;
        merged
    }

    /// One durable CSV per record under the fragment folder. Best effort
    /// per record; returns how many made it.
    pub async fn upload_fragments(&self, records: &[Observation]) -> usize {
        let Some(remote) = self.remote.as_ref() else {
            return 0;
        };
        let mut uploaded = 0;
        for record in records {
            let path = format!("{}/{}.csv", self.fragment_folder, record.obs_id);
            let bytes = match serialize_table(std::slice::from_ref(record)) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Could not serialize fragment for {}: {e}", record.obs_id);
                    continue;
                }
            };
            match remote.upload(&path, &bytes).await {
                Ok(()) => uploaded += 1,
                Err(e) => warn!("Fragment upload failed for {}: {e}", record.obs_id),
            }
        }
        info!("Uploaded {uploaded} of {} fragment(s)", records.len());
        uploaded
    }

    /// Fill in missing photo links by matching files in the photos
    /// folder on a `<submission_id>_` or `<obs_id>_` prefix, and
    /// normalize existing Dropbox share links to direct-render form.
    pub async fn resolve_photo_links(&self, records: &mut [Observation]) {
        for record in records.iter_mut() {
            if let Some(link) = record.photo_link.take() {
                record.photo_link = Some(normalize_dropbox_link(&link));
            }
        }

        let Some(remote) = self.remote.as_ref() else {
            return;
        };
        let unresolved: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.photo_link.as_deref().is_none_or(str::is_empty))
            .map(|(i, _)| i)
            .collect();
        if unresolved.is_empty() {
            return;
        }

        let photos: Vec<(String, String)> = match remote.list_folder(&self.photos_folder).await {
            Ok(entries) => entries.into_iter().map(|e| (e.name, e.path)).collect(),
            Err(e) => {
                warn!("Failed to list photos folder {}: {e}", self.photos_folder);
                return;
            }
        };

        for idx in unresolved {
            let record = &mut records[idx];
            let mut found = None;
            for key in [record.submission_id.as_str(), record.obs_id.as_str()] {
                if key.is_empty() {
                    continue;
                }
                let prefix = format!("{key}_");
                if let Some((_, path)) = photos.iter().find(|(name, _)| name.starts_with(&prefix))
                {
                    found = Some(path.clone());
                    break;
                }
            }
            let Some(path) = found else { continue };
            match remote.create_shared_link(&path).await {
                Ok(url) => record.photo_link = Some(normalize_dropbox_link(&url)),
                Err(e) => warn!("Could not create shared link for {path}: {e}"),
            }
        }
    }

    async fn fetch_master(&self) -> Option<Vec<Observation>> {
        let remote = self.remote.as_ref()?;
        match remote.get_metadata(&self.master_path).await {
            Ok(metadata) => info!(
                "Found remote master {} ({} bytes)",
                metadata.path,
                metadata.size.unwrap_or(0)
            ),
            Err(BlobError::NotFound(_)) => {
                info!("No remote master at {}", self.master_path);
                return None;
            }
            Err(e) => {
                warn!("Could not check remote master {}: {e}", self.master_path);
                return None;
            }
        }
        match remote.download(&self.master_path).await {
            Ok(bytes) => match parse_table(&bytes) {
                Ok(records) if !records.is_empty() => Some(records),
                Ok(_) => None,
                Err(e) => {
                    warn!("Remote master {} is malformed: {e}", self.master_path);
                    None
                }
            },
            Err(e) => {
                warn!("Failed to download remote master: {e}");
                None
            }
        }
    }

    /// Download every fragment file, bounded by `max_concurrent`.
    /// Unreadable or malformed fragments are dropped one by one, never
    /// aborting the rest.
    async fn collect_fragments(&self) -> Vec<Observation> {
        let Some(remote) = self.remote.as_ref() else {
            return Vec::new();
        };
        let entries = match remote.list_folder(&self.fragment_folder).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "Failed to list fragment folder {}: {e}",
                    self.fragment_folder
                );
                return Vec::new();
            }
        };
        let fragment_paths: Vec<String> = entries
            .into_iter()
            .filter(|e| e.name.to_lowercase().ends_with(".csv"))
            .map(|e| e.path)
            .collect();
        if fragment_paths.is_empty() {
            return Vec::new();
        }

        let progress_bar = ProgressBar::new(fragment_paths.len() as u64);
        progress_bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {percent:>3}% ETA: {eta_precise} {msg}")
                .unwrap()
                .progress_chars("##-"),
        );
        progress_bar.set_message("Downloading fragments");

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.max_concurrent));
        let pb = Arc::new(progress_bar);
        let total = fragment_paths.len();
        let mut tasks = Vec::new();

        for path in fragment_paths {
            let permit = Arc::clone(&semaphore);
            let progress = Arc::clone(&pb);
            let store = self;

            let task = async move {
                let _permit = permit.acquire().await.unwrap();
                let result = store.download_fragment(&path).await;
                progress.inc(1);
                result
            };
            tasks.push(task);
        }

        let results = join_all(tasks).await;
        pb.finish_and_clear();

        let records: Vec<Observation> = results.into_iter().flatten().flatten().collect();
        info!(
            "Collected {} record(s) from {total} fragment file(s)",
            records.len()
        );
        records
    }

    async fn download_fragment(&self, path: &str) -> Option<Vec<Observation>> {
        let remote = self.remote.as_ref()?;
        match remote.download(path).await {
            Ok(bytes) => match parse_table(&bytes) {
                Ok(records) => Some(records),
                Err(e) => {
                    warn!("Skipping malformed fragment {path}: {e}");
                    None
                }
            },
            Err(e) => {
                warn!("Skipping unreadable fragment {path}: {e}");
                None
            }
        }
    }

    async fn upload_master(&self, records: &[Observation]) {
        let Some(remote) = self.remote.as_ref() else {
            return;
        };
        let bytes = match serialize_table(records) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Could not serialize master table: {e}");
                return;
            }
        };
        match remote.upload(&self.master_path, &bytes).await {
            Ok(()) => info!(
                "Uploaded master table ({} records) to {}",
                records.len(),
                self.master_path
            ),
            Err(e) => warn!("Master upload failed, local cache still stands: {e}"),
        }
    }

    fn read_local(&self) -> Vec<Observation> {
        safe_read_csv(&self.data_file)
    }

    fn write_local(&self, records: &[Observation]) -> Result<(), csv::Error> {
        // Whole-file overwrite keeps the cache consistent even if a
        // previous write was cut short
        let mut writer = Writer::from_path(&self.data_file)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Exactly one record survives per `obs_id`: stable sort ascending by
/// parsed `submission_time` (unparsable sorts first, so it loses to any
/// parseable duplicate), then keep the last occurrence. Ties fall to
/// whichever record came later in the input, which in the merge path is
/// the newly submitted one.
pub fn resolve_duplicates(mut records: Vec<Observation>) -> Vec<Observation> {
    records.sort_by(|a, b| a.parsed_submission_time().cmp(&b.parsed_submission_time()));

    let mut last_index: HashMap<String, usize> = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        last_index.insert(record.obs_id.clone(), i);
    }
    let keep: HashSet<usize> = last_index.into_values().collect();

    records
        .into_iter()
        .enumerate()
        .filter(|(i, _)| keep.contains(i))
        .map(|(_, record)| record)
        .collect()
}

/// Most recent record for one nest hole, the "form default prefill"
/// lookup. Corrections (new `obs_id`, same hole) supersede here and only
/// here; the authoritative table keeps every record.
pub fn latest_for_hole<'a>(
    records: &'a [Observation],
    hotel_code: &str,
    nest_hole: &str,
) -> Option<&'a Observation> {
    records
        .iter()
        .filter(|r| r.hotel_code == hotel_code && r.nest_hole == nest_hole)
        .max_by_key(|r| r.parsed_submission_time())
}

/// Read a local CSV, treating a malformed file as absent: the broken
/// file is moved aside to `<path>.broken_<timestamp>.bak` so it stays
/// manually recoverable, and an empty table is returned.
pub fn safe_read_csv(path: &Path) -> Vec<Observation> {
    if !path.exists() {
        return Vec::new();
    }
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to read {}: {e}", path.display());
            return Vec::new();
        }
    };
    match parse_table(&bytes) {
        Ok(records) => records,
        Err(e) => {
            let ts = Local::now().format("%Y%m%d_%H%M%S");
            let backup = PathBuf::from(format!("{}.broken_{ts}.bak", path.display()));
            match std::fs::rename(path, &backup) {
                Ok(()) => warn!(
                    "Existing {} was malformed ({e}) and moved to {}",
                    path.display(),
                    backup.display()
                ),
                Err(mv_err) => warn!(
                    "Existing {} was malformed ({e}); failed to move it aside: {mv_err}",
                    path.display()
                ),
            }
            Vec::new()
        }
    }
}

pub fn parse_table(bytes: &[u8]) -> Result<Vec<Observation>, csv::Error> {
    let mut reader = Reader::from_reader(bytes);
    reader.deserialize().collect()
}

pub fn serialize_table(records: &[Observation]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = Writer::from_writer(Vec::new());
    for record in records {
        writer.serialize(record)?;
    }
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(std::io::Error::other(e.to_string())))
}

fn normalize_dropbox_link(url: &str) -> String {
    if url.contains("dropbox.com") && !url.contains("raw=1") {
        url.replace("?dl=0", "?raw=1")
            .replace("?dl=1", "?raw=1")
            .replace("&dl=0", "&raw=1")
            .replace("&dl=1", "&raw=1")
    } else {
        url.to_string()
    }
}

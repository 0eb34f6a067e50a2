use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Timestamp format written by the submission path and expected in
/// `submission_time` of every record.
pub const SUBMISSION_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One nest-hole reading. Field order is the column order of the master
/// CSV file. Columns absent from older fragment files fall back to their
/// defaults instead of failing the parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Observation {
    pub obs_id: String,
    pub observer: String,
    pub hotel_code: String,
    pub obs_date: String,
    pub obs_time: String,
    pub nest_hole: String,
    pub scientific_name: String,
    pub num_cells: Option<u32>,
    pub num_males: Option<u32>,
    pub num_females: Option<u32>,
    pub num_unknowns: Option<u32>,
    pub social_behaviour: String,
    pub notes: Option<String>,
    pub submission_id: String,
    pub submission_notes: Option<String>,
    pub photo_link: Option<String>,
    pub submission_time: String,
}

impl Default for Observation {
    fn default() -> Self {
        Self {
            obs_id: String::new(),
            observer: String::new(),
            hotel_code: String::new(),
            obs_date: String::new(),
            obs_time: String::new(),
            nest_hole: String::new(),
            scientific_name: String::new(),
            num_cells: None,
            num_males: None,
            num_females: None,
            num_unknowns: None,
            social_behaviour: String::new(),
            notes: None,
            submission_id: String::new(),
            submission_notes: None,
            photo_link: None,
            submission_time: String::new(),
        }
    }
}

impl Observation {
    /// Lenient parse of `submission_time`. Returns `None` for anything
    /// unparsable, which the dedup sort treats as oldest.
    pub fn parsed_submission_time(&self) -> Option<NaiveDateTime> {
        parse_timestamp(&self.submission_time)
    }

    /// The multi-valued social behaviour field, split back into its parts.
    pub fn social_behaviours(&self) -> Vec<String> {
        self.social_behaviour
            .split(", ")
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, SUBMISSION_TIME_FORMAT) {
        return Some(dt);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt);
    }
    // Date-only values count as midnight of that day
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Stamp identity and recency fields onto a freshly submitted batch.
///
/// Every record gets a unique `obs_id`; the whole batch shares one
/// `submission_id` and one `submission_time`, matching the "one form
/// submission, many holes" model. Fields already set are left alone.
pub fn stamp_new_batch(records: &mut [Observation]) {
    let submission_id = Uuid::new_v4().to_string();
    let submission_time = Local::now().format(SUBMISSION_TIME_FORMAT).to_string();

    for record in records.iter_mut() {
        if record.obs_id.is_empty() {
            record.obs_id = Uuid::new_v4().to_string();
        }
        if record.submission_id.is_empty() {
            record.submission_id = submission_id.clone();
        }
        if record.submission_time.is_empty() {
            record.submission_time = submission_time.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_submission_time() {
        let mut record = Observation::default();
        record.submission_time = "2025-01-01 10:00:00".to_string();
        let parsed = record.parsed_submission_time().unwrap();
        assert_eq!(
            parsed.format(SUBMISSION_TIME_FORMAT).to_string(),
            "2025-01-01 10:00:00"
        );
    }

    #[test]
    fn test_parse_iso_and_date_only() {
        let mut record = Observation::default();
        record.submission_time = "2025-03-04T09:30:01".to_string();
        assert!(record.parsed_submission_time().is_some());

        record.submission_time = "2025-03-04".to_string();
        let parsed = record.parsed_submission_time().unwrap();
        assert_eq!(parsed.format("%H:%M:%S").to_string(), "00:00:00");
    }

    #[test]
    fn test_unparsable_submission_time_is_none() {
        let mut record = Observation::default();
        for raw in ["", "not a date", "04/03/2025 09:30"] {
            record.submission_time = raw.to_string();
            assert!(record.parsed_submission_time().is_none(), "{raw:?}");
        }
    }

    #[test]
    fn test_social_behaviour_split() {
        let mut record = Observation::default();
        record.social_behaviour = "Solitary, Parasitic".to_string();
        assert_eq!(record.social_behaviours(), vec!["Solitary", "Parasitic"]);

        record.social_behaviour = String::new();
        assert!(record.social_behaviours().is_empty());
    }

    #[test]
    fn test_stamp_new_batch() {
        let mut batch = vec![Observation::default(), Observation::default()];
        batch[1].obs_id = "preset".to_string();
        stamp_new_batch(&mut batch);

        assert!(!batch[0].obs_id.is_empty());
        assert_eq!(batch[1].obs_id, "preset");
        assert_eq!(batch[0].submission_id, batch[1].submission_id);
        assert_eq!(batch[0].submission_time, batch[1].submission_time);
        assert!(batch[0].parsed_submission_time().is_some());
    }
}

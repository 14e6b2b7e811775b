// crates/veilcast-core/src/consent.rs
//
// Consent domain: the capture filename grammar, one record per consent
// image, and the recognition database the video worker's gate reads.
//
// The database is exactly the set of `.jpg` files in the consent directory
// whose feature extraction succeeded; the file path is the unique key, and a
// person may hold several records (any match grants consent).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::NaiveDateTime;
use tracing::info;

use crate::recognize::{cosine_score, l2_score, scores_match};

pub const CONSENT_EXTENSION: &str = "jpg";
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

// ── Filename grammar ──────────────────────────────────────────────────────────

/// Parsed `YYYYMMDDhhmmss_<safe_name>.jpg`. `format(parse(x)) == x` for any
/// filename matching the grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentFilename {
    pub captured_at: NaiveDateTime,
    pub name:        String,
}

impl ConsentFilename {
    pub fn new(captured_at: NaiveDateTime, name: &str) -> Self {
        Self { captured_at, name: sanitize_name(name) }
    }

    /// Parse a consent capture filename. Returns None for anything outside
    /// the grammar (wrong extension, missing separator, bad timestamp,
    /// unsafe name characters).
    pub fn parse(filename: &str) -> Option<Self> {
        let stem = filename.strip_suffix(".jpg")?;
        let (timestamp, name) = stem.split_once('_')?;
        if timestamp.len() != 14 || !timestamp.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let captured_at = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;
        if name.is_empty() || sanitize_name(name) != name {
            return None;
        }
        Some(Self { captured_at, name: name.to_string() })
    }

    pub fn format(&self) -> String {
        format!("{}_{}.jpg", self.captured_at.format(TIMESTAMP_FORMAT), self.name)
    }

    /// Filename without extension, the id the control API exposes.
    pub fn id(&self) -> String {
        format!("{}_{}", self.captured_at.format(TIMESTAMP_FORMAT), self.name)
    }
}

/// Lowercase, keep alphanumerics / `_` / `-`, spaces become underscores,
/// leading and trailing underscores trimmed.
pub fn sanitize_name(name: &str) -> String {
    let lowered: String = name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ' '))
        .map(|c| if c == ' ' { '_' } else { c })
        .collect();
    lowered.trim_matches('_').to_string()
}

// ── Records and database ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConsentRecord {
    /// Absolute path of the backing file; the unique key.
    pub path:        PathBuf,
    /// Normalized lowercase name from the filename.
    pub name:        String,
    /// Feature vector from the recognizer.
    pub feature:     Vec<f32>,
    pub captured_at: NaiveDateTime,
}

/// A successful match against the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentMatch {
    pub name: String,
}

/// Shared recognition database. Writes come from the consent manager only;
/// the video worker's gate reads under the shared lock.
#[derive(Default)]
pub struct ConsentDatabase {
    records: RwLock<Vec<ConsentRecord>>,
}

impl ConsentDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, replacing any previous record with the same path
    /// before the insert.
    pub fn insert(&self, record: ConsentRecord) {
        let mut records = self.records.write().unwrap();
        records.retain(|existing| existing.path != record.path);
        info!(
            name = %record.name,
            file = %record.path.display(),
            total = records.len() + 1,
            "consent record added"
        );
        records.push(record);
    }

    /// Remove exactly the record keyed by `path`. Returns the removed
    /// record's name when something was removed.
    pub fn remove_by_path(&self, path: &Path) -> Option<String> {
        let mut records = self.records.write().unwrap();
        let before = records.len();
        let mut removed_name = None;
        records.retain(|record| {
            if record.path == path {
                removed_name = Some(record.name.clone());
                false
            } else {
                true
            }
        });
        if records.len() < before {
            info!(
                file = %path.display(),
                remaining = records.len(),
                "consent record removed"
            );
        }
        removed_name
    }

    /// Match a probe feature against every record; first hit wins.
    pub fn match_feature(
        &self,
        feature: &[f32],
        cosine_threshold: f32,
        l2_threshold: f32,
    ) -> Option<ConsentMatch> {
        let records = self.records.read().unwrap();
        for record in records.iter() {
            let cosine = cosine_score(feature, &record.feature);
            let l2 = l2_score(feature, &record.feature);
            if scores_match(cosine, l2, cosine_threshold, l2_threshold) {
                return Some(ConsentMatch { name: record.name.clone() });
            }
        }
        None
    }

    /// Names with at least one live record.
    pub fn consented_names(&self) -> HashSet<String> {
        self.records
            .read()
            .unwrap()
            .iter()
            .map(|record| record.name.clone())
            .collect()
    }

    pub fn is_name_consented(&self, name: &str) -> bool {
        let needle = name.to_lowercase();
        self.records.read().unwrap().iter().any(|record| record.name == needle)
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn timestamp() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap().and_hms_opt(12, 0, 0).unwrap()
    }

    fn record(path: &str, name: &str, feature: Vec<f32>) -> ConsentRecord {
        ConsentRecord {
            path: PathBuf::from(path),
            name: name.to_string(),
            feature,
            captured_at: timestamp(),
        }
    }

    // ── Filename grammar ─────────────────────────────────────────────────────

    #[test]
    fn parse_format_round_trip() {
        for name in ["alice", "mary_jane", "jean-luc", "a1_b2-c3"] {
            let filename = format!("20250101120000_{name}.jpg");
            let parsed = ConsentFilename::parse(&filename).expect(&filename);
            assert_eq!(parsed.format(), filename);
            assert_eq!(parsed.name, name);
        }
    }

    #[test]
    fn parse_rejects_bad_shapes() {
        for bad in [
            "20250101120000.jpg",          // no separator / name
            "2025_alice.jpg",              // short timestamp
            "20250101120000_alice.png",    // wrong extension
            "2025010112000x_alice.jpg",    // non-digit timestamp
            "20251301120000_alice.jpg",    // month 13
            "20250101120000_Alice.jpg",    // uppercase not in grammar
            "20250101120000_.jpg",         // empty name
        ] {
            assert!(ConsentFilename::parse(bad).is_none(), "accepted {bad}");
        }
    }

    #[test]
    fn sanitize_folds_case_spaces_and_trims() {
        assert_eq!(sanitize_name("Mary Jane"), "mary_jane");
        assert_eq!(sanitize_name("_alice_"), "alice");
        assert_eq!(sanitize_name("Jean-Luc!"), "jean-luc");
        assert_eq!(sanitize_name("  "), "");
    }

    #[test]
    fn filename_new_sanitizes() {
        let filename = ConsentFilename::new(timestamp(), "Mary Jane");
        assert_eq!(filename.format(), "20250101120000_mary_jane.jpg");
        assert_eq!(filename.id(), "20250101120000_mary_jane");
    }

    // ── Database ─────────────────────────────────────────────────────────────

    #[test]
    fn insert_replaces_same_path() {
        let db = ConsentDatabase::new();
        db.insert(record("/c/a.jpg", "alice", vec![1.0, 0.0]));
        db.insert(record("/c/a.jpg", "alice", vec![0.0, 1.0]));
        assert_eq!(db.len(), 1);
        // Only the new feature remains.
        assert!(db.match_feature(&[0.0, 1.0], 2.0, 0.1).is_some());
    }

    #[test]
    fn remove_deletes_exactly_one_path() {
        let db = ConsentDatabase::new();
        db.insert(record("/c/1_alice.jpg", "alice", vec![1.0, 0.0]));
        db.insert(record("/c/2_alice.jpg", "alice", vec![0.9, 0.1]));
        assert_eq!(db.remove_by_path(Path::new("/c/1_alice.jpg")).as_deref(), Some("alice"));
        assert_eq!(db.len(), 1);
        assert!(db.is_name_consented("alice"), "second record keeps the name");
        assert_eq!(db.remove_by_path(Path::new("/c/2_alice.jpg")).as_deref(), Some("alice"));
        assert!(!db.is_name_consented("alice"));
    }

    #[test]
    fn add_then_delete_restores_observable_state() {
        let db = ConsentDatabase::new();
        db.insert(record("/c/b.jpg", "bob", vec![0.5, 0.5]));
        db.remove_by_path(Path::new("/c/b.jpg"));
        assert!(db.is_empty());
        assert!(db.consented_names().is_empty());
        assert!(db.match_feature(&[0.5, 0.5], 2.0, 2.0).is_none());
    }

    #[test]
    fn remove_unknown_path_is_a_no_op() {
        let db = ConsentDatabase::new();
        db.insert(record("/c/a.jpg", "alice", vec![1.0]));
        assert!(db.remove_by_path(Path::new("/c/missing.jpg")).is_none());
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn match_follows_source_thresholds() {
        let db = ConsentDatabase::new();
        db.insert(record("/c/a.jpg", "alice", vec![1.0, 0.0]));

        // Identical feature: cosine = 1.0 (not < 0.363) but l2 = 0 < 1.128.
        let hit = db.match_feature(&[1.0, 0.0], 0.363, 1.128).unwrap();
        assert_eq!(hit.name, "alice");

        // Orthogonal unit feature: cosine = 0 < 0.363 matches under the
        // source's convention even though l2 = sqrt(2) does not.
        assert!(db.match_feature(&[0.0, 1.0], 0.363, 1.128).is_some());

        // Opposite direction: cosine = -1 < 0.363 → still a match by the
        // copied rule. Guard the rule itself, not its wisdom.
        assert!(db.match_feature(&[-1.0, 0.0], 0.363, 1.128).is_some());
    }

    #[test]
    fn empty_database_never_matches() {
        let db = ConsentDatabase::new();
        assert!(db.match_feature(&[1.0, 0.0], 2.0, 2.0).is_none());
    }

    #[test]
    fn consented_names_deduplicates() {
        let db = ConsentDatabase::new();
        db.insert(record("/c/1_alice.jpg", "alice", vec![1.0]));
        db.insert(record("/c/2_alice.jpg", "alice", vec![0.9]));
        db.insert(record("/c/3_bob.jpg", "bob", vec![0.1]));
        let names = db.consented_names();
        assert_eq!(names.len(), 2);
        assert!(names.contains("alice") && names.contains("bob"));
    }
}

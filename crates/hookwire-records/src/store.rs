//! Flat-file record store.
//!
//! The whole store is one JSON document:
//!
//! ```json
//! {"users": {"alice": {"password": "$argon2id$...", "results": [["CITS1001", 80]]}}}
//! ```
//!
//! Passwords are kept as argon2 PHC strings. Saves go to a temporary file in
//! the same directory which is then renamed over the original.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Unit codes must be shorter than this.
pub const MAX_UNIT_CODE_LEN: usize = 20;
/// Accepted username and password lengths for new users.
pub const CREDENTIAL_LEN: std::ops::RangeInclusive<usize> = 3..=20;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("record file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown user '{0}'")]
    UnknownUser(String),
    #[error("user '{0}' already exists")]
    UserExists(String),
    #[error("{field} must be between {} and {} characters", CREDENTIAL_LEN.start(), CREDENTIAL_LEN.end())]
    CredentialLength { field: &'static str },
    #[error("invalid results: {0}")]
    InvalidResults(String),
    #[error("password hashing failed: {0}")]
    Hash(String),
}

/// One `[unit_code, mark]` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult(pub String, pub Number);

impl UnitResult {
    pub fn code(&self) -> &str {
        &self.0
    }

    pub fn mark(&self) -> f64 {
        self.1.as_f64().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub password: String,
    #[serde(default)]
    pub results: Vec<UnitResult>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RecordFile {
    #[serde(default)]
    users: BTreeMap<String, UserRecord>,
}

/// Per-user overview for admin listings.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSummary {
    pub username: String,
    pub units: usize,
    pub average: Option<f64>,
}

/// Check a `[[unit_code, mark], ...]` value and convert it.
pub fn validate_results(value: &Value) -> Result<Vec<UnitResult>, StoreError> {
    let invalid = |reason: String| StoreError::InvalidResults(reason);
    let entries = value
        .as_array()
        .ok_or_else(|| invalid(format!("expected a list of [unit_code, mark] pairs, got {value}")))?;

    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| match entry.as_array().map(Vec::as_slice) {
            Some([Value::String(code), Value::Number(mark)]) => {
                if code.chars().count() >= MAX_UNIT_CODE_LEN {
                    return Err(invalid(format!(
                        "entry {i}: unit code '{code}' must be shorter than {MAX_UNIT_CODE_LEN} characters"
                    )));
                }
                match mark.as_f64() {
                    Some(m) if (0.0..=100.0).contains(&m) => Ok(UnitResult(code.clone(), mark.clone())),
                    _ => Err(invalid(format!("entry {i}: mark {mark} is outside 0..=100"))),
                }
            }
            _ => Err(invalid(format!("entry {i}: expected [unit_code, mark], got {entry}"))),
        })
        .collect()
}

/// Hash `password` into an argon2 PHC string.
pub fn hash_password(password: &str) -> Result<String, StoreError> {
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| StoreError::Hash(e.to_string()))
}

/// Verify `password` against a stored PHC string.
pub fn verify_password(phc: &str, password: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// The record store, bound to its backing file.
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    users: BTreeMap<String, UserRecord>,
}

impl RecordStore {
    /// Load the store at `path`. A missing file yields an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let users = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let file: RecordFile = serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
                    path: path.clone(),
                    source,
                })?;
                debug!(path = %path.display(), users = file.users.len(), "Loaded record store");
                file.users
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Record file does not exist, starting with an empty store");
                BTreeMap::new()
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self { path, users })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the store to disk atomically.
    pub fn save(&self) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        let file = RecordFile {
            users: self.users.clone(),
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        debug!(path = %self.path.display(), users = self.users.len(), "Saved record store");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    pub fn add_user(&mut self, username: &str, password: &str) -> Result<(), StoreError> {
        if !CREDENTIAL_LEN.contains(&username.chars().count()) {
            return Err(StoreError::CredentialLength { field: "username" });
        }
        if !CREDENTIAL_LEN.contains(&password.chars().count()) {
            return Err(StoreError::CredentialLength { field: "password" });
        }
        if self.contains(username) {
            return Err(StoreError::UserExists(username.to_string()));
        }
        let record = UserRecord {
            password: hash_password(password)?,
            results: Vec::new(),
        };
        self.users.insert(username.to_string(), record);
        Ok(())
    }

    pub fn remove_user(&mut self, username: &str) -> Result<(), StoreError> {
        self.users
            .remove(username)
            .map(|_| ())
            .ok_or_else(|| StoreError::UnknownUser(username.to_string()))
    }

    /// Drop every user. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.users.len();
        self.users.clear();
        removed
    }

    /// Stored PHC string for `username`, if the user exists.
    pub fn password_hash(&self, username: &str) -> Option<String> {
        self.users.get(username).map(|r| r.password.clone())
    }

    /// Unknown users never match.
    pub fn check_credentials(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|r| verify_password(&r.password, password))
    }

    pub fn results(&self, username: &str) -> Result<Vec<UnitResult>, StoreError> {
        self.users
            .get(username)
            .map(|r| r.results.clone())
            .ok_or_else(|| StoreError::UnknownUser(username.to_string()))
    }

    /// Replace the results of `username`, returning the previous ones.
    pub fn set_results(&mut self, username: &str, results: Vec<UnitResult>) -> Result<Vec<UnitResult>, StoreError> {
        let record = self
            .users
            .get_mut(username)
            .ok_or_else(|| StoreError::UnknownUser(username.to_string()))?;
        Ok(std::mem::replace(&mut record.results, results))
    }

    pub fn summaries(&self) -> Vec<UserSummary> {
        self.users
            .iter()
            .map(|(username, record)| {
                let units = record.results.len();
                let average = (units > 0)
                    .then(|| record.results.iter().map(UnitResult::mark).sum::<f64>() / units as f64);
                UserSummary {
                    username: username.clone(),
                    units,
                    average,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_results() {
        let ok = validate_results(&json!([["CITS1001", 80], ["MATH1011", 49.5]])).unwrap();
        assert_eq!(ok.len(), 2);
        assert_eq!(ok[1].mark(), 49.5);

        assert!(validate_results(&json!([["CITS1001", 101]])).is_err());
        assert!(validate_results(&json!([["CITS1001", -1]])).is_err());
        assert!(validate_results(&json!([["A_VERY_LONG_UNIT_CODE", 50]])).is_err());
        assert!(validate_results(&json!([[1001, 50]])).is_err());
        assert!(validate_results(&json!([["CITS1001", "80"]])).is_err());
        assert!(validate_results(&json!([["CITS1001"]])).is_err());
        assert!(validate_results(&json!("CITS1001")).is_err());
        assert!(validate_results(&json!([])).unwrap().is_empty());
    }

    #[test]
    fn test_password_hashing() {
        let phc = hash_password("hunter22").unwrap();
        assert!(phc.starts_with("$argon2"));
        assert!(verify_password(&phc, "hunter22"));
        assert!(!verify_password(&phc, "hunter23"));
        assert!(!verify_password("not a hash", "hunter22"));
    }

    #[test]
    fn test_user_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RecordStore::open(dir.path().join("students.json")).unwrap();
        assert!(store.is_empty());

        store.add_user("alice", "wonderland").unwrap();
        assert!(matches!(store.add_user("alice", "again"), Err(StoreError::UserExists(_))));
        assert!(matches!(
            store.add_user("al", "wonderland"),
            Err(StoreError::CredentialLength { field: "username" })
        ));

        assert!(store.check_credentials("alice", "wonderland"));
        assert!(!store.check_credentials("alice", "wrong"));
        assert!(!store.check_credentials("bob", "wonderland"));

        let results = validate_results(&json!([["CITS1001", 80], ["CITS1002", 60]])).unwrap();
        store.set_results("alice", results.clone()).unwrap();
        assert_eq!(store.results("alice").unwrap(), results);
        assert_eq!(
            store.summaries(),
            vec![UserSummary {
                username: "alice".into(),
                units: 2,
                average: Some(70.0)
            }]
        );

        store.remove_user("alice").unwrap();
        assert!(matches!(store.results("alice"), Err(StoreError::UnknownUser(_))));
        assert!(matches!(store.remove_user("alice"), Err(StoreError::UnknownUser(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("students.json");
        let mut store = RecordStore::open(&path).unwrap();
        store.add_user("carol", "secret1").unwrap();
        store
            .set_results("carol", validate_results(&json!([["CITS3002", 91]])).unwrap())
            .unwrap();
        store.save().unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["users"]["carol"]["results"], json!([["CITS3002", 91]]));

        let reloaded = RecordStore::open(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.check_credentials("carol", "secret1"));
        assert_eq!(reloaded.results("carol").unwrap()[0].code(), "CITS3002");
    }

    #[test]
    fn test_clear_empties_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("students.json");
        let mut store = RecordStore::open(&path).unwrap();
        store.add_user("alice", "wonderland").unwrap();
        store.add_user("bob", "builder").unwrap();
        store.save().unwrap();

        assert_eq!(store.clear(), 2);
        assert_eq!(store.clear(), 0);
        store.save().unwrap();

        let reloaded = RecordStore::open(&path).unwrap();
        assert!(reloaded.is_empty());
        assert!(!reloaded.check_credentials("alice", "wonderland"));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("students.json");
        std::fs::write(&path, "[0, {}]").unwrap();
        assert!(matches!(RecordStore::open(&path), Err(StoreError::Corrupt { .. })));
    }
}

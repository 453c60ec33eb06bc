use serde::{Deserialize, Serialize};
use std::path::Path;

use super::command::ValidationError;

/// Transfer toggles for a single profile. Every combination is legal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobOptions {
    pub archive: bool,
    pub verbose: bool,
    pub compress: bool,
    pub delete: bool,
    /// Permissions, owner, group, device files and modification times.
    pub preserve: bool,
    pub dry_run: bool,
    #[serde(rename = "progress", alias = "show_progress")]
    pub show_progress: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            archive: true,
            verbose: false,
            compress: false,
            delete: false,
            preserve: false,
            dry_run: false,
            show_progress: true,
        }
    }
}

/// A named backup profile: what to copy, where, and how.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Job {
    pub name: String,
    pub sources: Vec<String>,
    pub destination: String,
    pub excludes: Vec<String>,
    pub options: JobOptions,
}

impl Default for Job {
    fn default() -> Self {
        Self::new("Job")
    }
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sources: Vec::new(),
            destination: String::new(),
            excludes: Vec::new(),
            options: JobOptions::default(),
        }
    }

    /// Sources as they will be handed to the tool. Blank entries are dropped
    /// and existing directories gain a trailing separator so their contents,
    /// not the directory itself, are copied.
    pub fn normalized_sources(&self) -> Vec<String> {
        self.sources
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| normalize_source(s))
            .collect()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.normalized_sources().is_empty() {
            return Err(ValidationError::NoSources);
        }
        if self.destination.trim().is_empty() {
            return Err(ValidationError::NoDestination);
        }
        Ok(())
    }
}

pub fn normalize_source(source: &str) -> String {
    let already_terminated =
        source.ends_with('/') || source.ends_with(std::path::MAIN_SEPARATOR);
    if !already_terminated && Path::new(source).is_dir() {
        format!("{}/", source)
    } else {
        source.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let job: Job = serde_json::from_str(r#"{"sources": ["/home/me"]}"#).unwrap();
        assert_eq!(job.name, "Job");
        assert_eq!(job.sources, vec!["/home/me".to_string()]);
        assert!(job.destination.is_empty());
        assert!(job.options.archive);
        assert!(job.options.show_progress);
        assert!(!job.options.delete);
    }

    #[test]
    fn progress_option_uses_persisted_key() {
        let job: Job = serde_json::from_str(r#"{"options": {"progress": false}}"#).unwrap();
        assert!(!job.options.show_progress);

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["options"]["progress"], serde_json::json!(false));

        let aliased: JobOptions = serde_json::from_str(r#"{"show_progress": false}"#).unwrap();
        assert!(!aliased.show_progress);
    }

    #[test]
    fn validation_checks_sources_before_destination() {
        let job = Job::new("empty");
        assert_eq!(job.validate(), Err(ValidationError::NoSources));

        let mut job = Job::new("no dest");
        job.sources.push("/tmp".into());
        job.destination = "   ".into();
        assert_eq!(job.validate(), Err(ValidationError::NoDestination));

        job.destination = "/backup".into();
        assert_eq!(job.validate(), Ok(()));
    }

    #[test]
    fn blank_sources_do_not_count() {
        let mut job = Job::new("blank");
        job.sources = vec!["".into(), "  ".into()];
        job.destination = "/backup".into();
        assert_eq!(job.validate(), Err(ValidationError::NoSources));
    }

    #[test]
    fn directories_gain_one_trailing_separator() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().to_string_lossy().to_string();
        let slashed = format!("{}/", plain);

        assert_eq!(normalize_source(&plain), slashed);
        assert_eq!(normalize_source(&slashed), slashed);

        let file = dir.path().join("notes.txt");
        std::fs::write(&file, b"x").unwrap();
        let file = file.to_string_lossy().to_string();
        assert_eq!(normalize_source(&file), file);

        let missing = dir.path().join("missing").to_string_lossy().to_string();
        assert_eq!(normalize_source(&missing), missing);
    }
}

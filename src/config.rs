//! Config Loader (spec.md 4.B). A pure function from `(file contents,
//! environment variables)` to a `DesiredCensus`. No I/O beyond a single file
//! read; the merge/strip logic below never touches the filesystem or the
//! environment except through the inputs it's given, so it stays testable
//! without a subprocess.

use dusa_collection_utils::core::errors::{ErrorArrayItem, Errors};
use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use crate::queue_group::QueueGroup;

/// `QueueGroup -> desired worker count`. May be empty. Every count is >= 0
/// by construction (`u32`).
pub type DesiredCensus = BTreeMap<QueueGroup, u32>;

/// Candidate config file locations checked in order when
/// `RESQUE_POOL_CONFIG` is unset.
const DEFAULT_CONFIG_CANDIDATES: &[&str] = &["resque-pool.yml", "config/resque-pool.yml"];

/// Environment variables consulted, in order, for the overlay environment
/// name (spec.md 4.B / 6. EXTERNAL INTERFACES).
const ENVIRONMENT_NAME_VARS: &[&str] = &["RACK_ENV", "RAILS_ENV", "RESQUE_ENV"];

/// Locates the config file per spec.md 6. EXTERNAL INTERFACES: explicit
/// `RESQUE_POOL_CONFIG`, else the first existing of the default candidates.
/// Returns `None` if nothing is configured and nothing exists on disk --
/// an empty `DesiredCensus` is a legal starting point.
pub fn discover_config_path() -> Option<PathBuf> {
    if let Ok(explicit) = env::var("RESQUE_POOL_CONFIG") {
        return Some(PathBuf::from(explicit));
    }
    DEFAULT_CONFIG_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

/// The environment name used to pick an overlay sub-mapping, per the
/// `RACK_ENV`/`RAILS_ENV`/`RESQUE_ENV` chain in 6. EXTERNAL INTERFACES.
/// There is no ambient "framework indicator" in a non-Rails Rust process,
/// so this chain is the entire source of truth (see DESIGN.md).
pub fn environment_name() -> Option<String> {
    ENVIRONMENT_NAME_VARS.iter().find_map(|var| env::var(var).ok())
}

/// Loads and parses `path` into a [`DesiredCensus`], applying the
/// environment-name overlay and stripping leftover sub-mappings.
pub fn load_from_path(path: &Path, env_name: Option<&str>) -> Result<DesiredCensus, ErrorArrayItem> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        ErrorArrayItem::new(
            Errors::InvalidFile,
            format!("Failed to read config file {}: {}", path.display(), e),
        )
    })?;
    load_from_str(&contents, env_name)
}

/// Parses a YAML document's text into a [`DesiredCensus`]. Pulled out of
/// [`load_from_path`] so tests can exercise the merge logic without
/// touching the filesystem.
pub fn load_from_str(contents: &str, env_name: Option<&str>) -> Result<DesiredCensus, ErrorArrayItem> {
    let document: serde_yaml::Value = serde_yaml::from_str(contents).map_err(|e| {
        ErrorArrayItem::new(Errors::InvalidType, format!("Invalid config document: {}", e))
    })?;

    let mapping = document.as_mapping().ok_or_else(|| {
        ErrorArrayItem::new(
            Errors::InvalidType,
            "Config document's top level must be a mapping".to_owned(),
        )
    })?;

    let mut merged: BTreeMap<String, serde_yaml::Value> = BTreeMap::new();
    for (key, value) in mapping {
        if let Some(key) = key.as_str() {
            merged.insert(key.to_owned(), value.clone());
        }
    }

    if let Some(env_name) = env_name {
        if let Some(overlay) = merged.get(env_name).cloned() {
            if let Some(overlay_mapping) = overlay.as_mapping() {
                log!(LogLevel::Debug, "Applying config overlay for environment '{}'", env_name);
                for (key, value) in overlay_mapping {
                    if let Some(key) = key.as_str() {
                        merged.insert(key.to_owned(), value.clone());
                    }
                }
            }
        }
    }

    // Strip anything that is itself a mapping: those are environment
    // sections (the one we wanted has already been merged in above).
    merged.retain(|_, value| value.as_mapping().is_none());

    let mut census = DesiredCensus::new();
    for (key, value) in merged {
        let count = value.as_u64().ok_or_else(|| {
            ErrorArrayItem::new(
                Errors::InvalidType,
                format!("Queue-group '{}' must map to a non-negative integer", key),
            )
        })?;
        let count: u32 = count.try_into().map_err(|_| {
            ErrorArrayItem::new(
                Errors::InvalidType,
                format!("Queue-group '{}' count {} is out of range", key, count),
            )
        })?;
        census.insert(QueueGroup::new(key), count);
    }

    Ok(census)
}

/// Loads the desired census from the discovered config path, if any, using
/// the environment-name chain. No config file found is not an error: it
/// yields an empty census, matching spec.md 3. DATA MODEL's invariant that
/// `DesiredCensus` may be empty.
pub fn load() -> Result<DesiredCensus, ErrorArrayItem> {
    let env_name = environment_name();
    match discover_config_path() {
        Some(path) => load_from_path(&path, env_name.as_deref()),
        None => {
            log!(LogLevel::Info, "No pool config file found; starting with an empty census");
            Ok(DesiredCensus::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_mapping() {
        let doc = "high: 2\nlow: 1\n";
        let census = load_from_str(doc, None).unwrap();
        assert_eq!(census.get(&QueueGroup::new("high")), Some(&2));
        assert_eq!(census.get(&QueueGroup::new("low")), Some(&1));
    }

    #[test]
    fn environment_overlay_replaces_top_level_values() {
        let doc = "\
high: 2
low: 1
production:
  high: 5
";
        let census = load_from_str(doc, Some("production")).unwrap();
        assert_eq!(census.get(&QueueGroup::new("high")), Some(&5));
        assert_eq!(census.get(&QueueGroup::new("low")), Some(&1));
    }

    #[test]
    fn environment_sections_are_stripped_from_result() {
        let doc = "\
high: 2
production:
  high: 5
staging:
  high: 1
";
        let census = load_from_str(doc, Some("production")).unwrap();
        assert_eq!(census.len(), 1);
        assert_eq!(census.get(&QueueGroup::new("high")), Some(&5));
    }

    #[test]
    fn unknown_environment_leaves_top_level_untouched() {
        let doc = "high: 2\nproduction:\n  high: 5\n";
        let census = load_from_str(doc, Some("staging")).unwrap();
        assert_eq!(census.get(&QueueGroup::new("high")), Some(&2));
    }

    #[test]
    fn empty_document_yields_empty_census() {
        let census = load_from_str("{}", None).unwrap();
        assert!(census.is_empty());
    }

    #[test]
    fn non_integer_value_is_an_error() {
        let doc = "high: not-a-number\n";
        assert!(load_from_str(doc, None).is_err());
    }
}

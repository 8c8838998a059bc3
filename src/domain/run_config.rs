//! Immutable input to a single run.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Output formats the aggregate step may write
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Json,
    Csv,
    Markdown,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            "md" | "markdown" => Ok(Self::Markdown),
            other => Err(format!("unknown output format '{}'", other)),
        }
    }
}

/// Configuration for one run.
///
/// Created once when the run starts and persisted as the run manifest so
/// that `resume` can pick it back up. Never mutated afterwards; a resume with
/// a raised cost ceiling supplies a whole replacement value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Unique identifier for this run
    pub run_id: Uuid,

    /// Primary input document (e.g. a résumé)
    pub input_path: PathBuf,

    /// Optional search criteria document
    #[serde(default)]
    pub criteria_path: Option<PathBuf>,

    /// Inline payload handed to the first steps
    #[serde(default)]
    pub payload: Option<serde_json::Value>,

    /// Output formats to produce
    #[serde(default = "default_formats")]
    pub output_formats: BTreeSet<OutputFormat>,

    /// Skip side-effecting steps
    #[serde(default)]
    pub dry_run: bool,

    /// Cap on the number of external entities processed
    #[serde(default)]
    pub max_items: Option<usize>,

    /// Maximum cumulative spend for the run, in USD
    pub cost_ceiling_usd: f64,
}

fn default_formats() -> BTreeSet<OutputFormat> {
    BTreeSet::from([OutputFormat::Json])
}

impl RunConfig {
    /// Create a config with a fresh run id and default options
    pub fn new(input_path: impl Into<PathBuf>, cost_ceiling_usd: f64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            input_path: input_path.into(),
            criteria_path: None,
            payload: None,
            output_formats: default_formats(),
            dry_run: false,
            max_items: None,
            cost_ceiling_usd,
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_cost_ceiling(mut self, cost_ceiling_usd: f64) -> Self {
        self.cost_ceiling_usd = cost_ceiling_usd;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("json".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!(" MD ".parse::<OutputFormat>(), Ok(OutputFormat::Markdown));
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_manifest_defaults() {
        let json = r#"{
            "run_id": "550e8400-e29b-41d4-a716-446655440000",
            "input_path": "resume.pdf",
            "cost_ceiling_usd": 2.5
        }"#;
        let config: RunConfig = serde_json::from_str(json).unwrap();

        assert!(!config.dry_run);
        assert_eq!(config.max_items, None);
        assert!(config.output_formats.contains(&OutputFormat::Json));
    }
}

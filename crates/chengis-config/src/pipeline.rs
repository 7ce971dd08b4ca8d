//! Pipeline-as-code discovery and parsing.
//!
//! A workspace may carry its own pipeline definition, which overrides the
//! job's server-stored pipeline. File priority: `chengis.json` (the
//! engine-native form) over `chengis.yaml`/`chengis.yml`.

use std::path::{Path, PathBuf};

use chengis_core::pipeline::Pipeline;
use tracing::debug;

use crate::{ConfigError, ConfigResult};

const JSON_FILE: &str = "chengis.json";
const YAML_FILES: [&str; 2] = ["chengis.yaml", "chengis.yml"];

/// Find the pipeline-as-code file in a workspace, if any.
pub fn discover(workspace: &Path) -> Option<PathBuf> {
    let json = workspace.join(JSON_FILE);
    if json.is_file() {
        return Some(json);
    }
    for name in YAML_FILES {
        let yaml = workspace.join(name);
        if yaml.is_file() {
            return Some(yaml);
        }
    }
    None
}

/// Parse a pipeline definition file, dispatching on extension.
pub fn parse_file(path: &Path) -> ConfigResult<Pipeline> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let pipeline = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?,
        other => {
            return Err(ConfigError::Parse {
                path: path.display().to_string(),
                message: format!("unsupported pipeline file extension {other:?}"),
            });
        }
    };
    debug!(path = %path.display(), "parsed pipeline-as-code file");
    validate(&pipeline)?;
    Ok(pipeline)
}

/// Structural validation that fails a build before any step runs.
pub fn validate(pipeline: &Pipeline) -> ConfigResult<()> {
    if pipeline.stages.is_empty() {
        return Err(ConfigError::InvalidPipeline(
            "pipeline has no stages".to_string(),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for stage in &pipeline.stages {
        if stage.name.trim().is_empty() {
            return Err(ConfigError::InvalidPipeline(
                "stage with empty name".to_string(),
            ));
        }
        if !seen.insert(stage.name.as_str()) {
            return Err(ConfigError::InvalidPipeline(format!(
                "duplicate stage name {:?}",
                stage.name
            )));
        }
        if stage.steps.is_empty() && !stage.is_gate() {
            return Err(ConfigError::InvalidPipeline(format!(
                "stage {:?} has no steps and no approval gate",
                stage.name
            )));
        }
        for step in stage
            .steps
            .iter()
            .chain(&stage.post.always)
            .chain(&stage.post.on_success)
            .chain(&stage.post.on_failure)
        {
            if step.command.trim().is_empty() {
                return Err(ConfigError::InvalidPipeline(format!(
                    "step {:?} in stage {:?} has an empty command",
                    step.name, stage.name
                )));
            }
        }
    }
    if let Some(matrix) = &pipeline.matrix {
        if matrix.axes.is_empty() {
            return Err(ConfigError::InvalidPipeline(
                "matrix with no axes".to_string(),
            ));
        }
        for (axis, values) in &matrix.axes {
            if values.is_empty() {
                return Err(ConfigError::InvalidPipeline(format!(
                    "matrix axis {axis:?} has no values"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    const MINIMAL_JSON: &str = r#"{
        "name": "demo",
        "stages": [{"name": "build", "steps": [{"name": "sh", "command": "make"}]}]
    }"#;

    const MINIMAL_YAML: &str = r#"
name: demo
stages:
  - name: build
    steps:
      - name: sh
        command: make
"#;

    #[test]
    fn json_wins_over_yaml() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "chengis.yaml", MINIMAL_YAML);
        let json = write(dir.path(), "chengis.json", MINIMAL_JSON);
        assert_eq!(discover(dir.path()), Some(json));
    }

    #[test]
    fn yaml_found_when_no_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = write(dir.path(), "chengis.yml", MINIMAL_YAML);
        assert_eq!(discover(dir.path()), Some(yaml));
    }

    #[test]
    fn nothing_discovered_in_plain_workspace() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(discover(dir.path()), None);
    }

    #[test]
    fn parses_both_forms() {
        let dir = tempfile::tempdir().unwrap();
        let json = write(dir.path(), "chengis.json", MINIMAL_JSON);
        let yaml = write(dir.path(), "chengis.yaml", MINIMAL_YAML);
        assert_eq!(parse_file(&json).unwrap().name, "demo");
        assert_eq!(parse_file(&yaml).unwrap().name, "demo");
    }

    #[test]
    fn duplicate_stage_names_rejected() {
        let json = r#"{
            "name": "demo",
            "stages": [
                {"name": "build", "steps": [{"name": "a", "command": "true"}]},
                {"name": "build", "steps": [{"name": "b", "command": "true"}]}
            ]
        }"#;
        let pipeline: Pipeline = serde_json::from_str(json).unwrap();
        assert!(validate(&pipeline).is_err());
    }

    #[test]
    fn empty_matrix_axis_rejected() {
        let json = r#"{
            "name": "demo",
            "matrix": {"axes": {"os": []}},
            "stages": [{"name": "build", "steps": [{"name": "a", "command": "true"}]}]
        }"#;
        let pipeline: Pipeline = serde_json::from_str(json).unwrap();
        assert!(validate(&pipeline).is_err());
    }
}

//! Matrix expansion.
//!
//! Fans the pipeline's stages out over the cartesian product of the matrix
//! axes, minus excluded combinations. Expanded stages get the axis=value
//! pairs suffixed to their names and `MATRIX_<AXIS>=<VALUE>` injected into
//! their environment. Expansion happens before execution; blowing the
//! combination cap is a validation failure and no step runs.

use chengis_core::pipeline::{MatrixSpec, Pipeline, Stage};
use chengis_core::{Error, Result};

/// One axis binding: ordered (axis, value) pairs.
type Combination = Vec<(String, String)>;

/// Expand a pipeline's stages. Pipelines without a matrix come back as-is.
pub fn expand_stages(pipeline: &Pipeline, max_combinations: usize) -> Result<Vec<Stage>> {
    let Some(matrix) = &pipeline.matrix else {
        return Ok(pipeline.stages.clone());
    };
    let combinations = combinations(matrix, max_combinations)?;

    let mut stages = Vec::with_capacity(pipeline.stages.len() * combinations.len());
    for stage in &pipeline.stages {
        for combo in &combinations {
            stages.push(apply_combination(stage, combo));
        }
    }
    Ok(stages)
}

/// Cartesian product minus excludes, capped.
fn combinations(matrix: &MatrixSpec, max_combinations: usize) -> Result<Vec<Combination>> {
    if matrix.axes.is_empty() {
        return Err(Error::Validation("matrix with no axes".to_string()));
    }
    let total: usize = matrix.axes.values().map(|v| v.len().max(1)).product();
    if total > max_combinations {
        return Err(Error::Validation(format!(
            "matrix expands to {total} combinations, cap is {max_combinations}"
        )));
    }

    let mut combos: Vec<Combination> = vec![Vec::new()];
    for (axis, values) in &matrix.axes {
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for value in values {
                let mut extended = combo.clone();
                extended.push((axis.clone(), value.clone()));
                next.push(extended);
            }
        }
        combos = next;
    }

    combos.retain(|combo| !is_excluded(combo, matrix));
    Ok(combos)
}

/// A combination is excluded when every axis=value pair of some exclude
/// entry matches it.
fn is_excluded(combo: &Combination, matrix: &MatrixSpec) -> bool {
    matrix.exclude.iter().any(|exclude| {
        exclude.iter().all(|(axis, value)| {
            combo
                .iter()
                .any(|(a, v)| a == axis && v == value)
        })
    })
}

fn apply_combination(stage: &Stage, combo: &Combination) -> Stage {
    let suffix: Vec<String> = combo.iter().map(|(a, v)| format!("{a}={v}")).collect();
    let mut expanded = stage.clone();
    expanded.name = format!("{} [{}]", stage.name, suffix.join(", "));
    for (axis, value) in combo {
        expanded
            .environment
            .insert(format!("MATRIX_{}", axis.to_uppercase()), value.clone());
    }
    expanded
}

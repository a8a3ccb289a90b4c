//! CLI workflow authoring commands: validate and simulate YAML files.

use std::path::Path;

use anyhow::{Context, Result};
use stepwell_core::engine::definition::load_workflow_file;
use stepwell_core::engine::safety::SafetyGate;
use stepwell_core::engine::simulate::{SimulatedDetail, simulate};

/// Handle `swell validate <file>`.
///
/// `load_workflow_file` already runs full graph validation, so reaching
/// the success path means the definition is publishable.
pub fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let def = load_workflow_file(file)
        .with_context(|| format!("failed to validate {}", file.display()))?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "valid": true,
                "name": def.name,
                "nodes": def.nodes.len(),
                "safety_level": def.safety_level,
            })
        );
    } else {
        println!(
            "{}: valid ({} nodes, trigger {:?})",
            def.name,
            def.nodes.len(),
            def.trigger
        );
    }
    Ok(())
}

/// Handle `swell simulate <file> --input <json>`.
pub fn handle_simulate(file: &Path, input: &str, json: bool) -> Result<()> {
    let def = load_workflow_file(file)
        .with_context(|| format!("failed to load {}", file.display()))?;
    let sample: serde_json::Value =
        serde_json::from_str(input).context("--input is not valid JSON")?;

    let steps = simulate(&def, &sample, &SafetyGate::new())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&steps)?);
        return Ok(());
    }

    println!("{} ({} steps):", def.name, steps.len());
    for (i, step) in steps.iter().enumerate() {
        let summary = match &step.detail {
            SimulatedDetail::Start => "start".to_string(),
            SimulatedDetail::Condition { result, .. } => {
                format!("condition -> {result}")
            }
            SimulatedDetail::Delay { minutes } => format!("delay {minutes}m"),
            SimulatedDetail::Branch { selected } => {
                format!("branch -> {selected}")
            }
            SimulatedDetail::Action {
                capability,
                gate,
                awaits_signal,
            } => {
                let wait = awaits_signal
                    .as_deref()
                    .map(|s| format!(", then wait for '{s}'"))
                    .unwrap_or_default();
                format!("action {capability} [{gate:?}]{wait}")
            }
        };
        println!("  {}. {} -- {}", i + 1, step.node_key, summary);
    }
    Ok(())
}

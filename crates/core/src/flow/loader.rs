use crate::types::FlowDefinition;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

/// Parse a flow definition from a `.json` or `.toml` file
pub fn load_flow_file(path: &Path) -> Result<FlowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read flow file {}", path.display()))?;

    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse flow file {}", path.display())),
        Some("toml") => toml::from_str(&content)
            .with_context(|| format!("Failed to parse flow file {}", path.display())),
        _ => bail!("Unsupported flow file extension: {}", path.display()),
    }
}

/// Parse every flow file in a directory, sorted by file name.
///
/// Files that fail to parse are logged and skipped; other extensions are ignored.
pub fn load_flow_dir(dir: &Path) -> Result<Vec<(PathBuf, FlowDefinition)>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read flows directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("json") | Some("toml")
                )
        })
        .collect();
    paths.sort();

    let mut flows = Vec::new();
    for path in paths {
        match load_flow_file(&path) {
            Ok(flow) => flows.push((path, flow)),
            Err(e) => {
                let error = format!("{:#}", e);
                tracing::error!(file = %path.display(), error = %error, "Failed to load flow");
            }
        }
    }

    Ok(flows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TOML_FLOW: &str = r#"
flow_id = "credit_analysis"
name = "Credit analysis"
description = "Collect, score, report"
entry_point = "collect"
exit_points = ["report"]

[[nodes]]
id = "collect"
type = "input"
agent_id = "collector"

[[nodes]]
id = "report"
type = "output"
agent_id = "reporter"
depends_on = ["collect"]

[nodes.config]
format = "pdf"
"#;

    #[test]
    fn test_load_toml_flow() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credit.toml");
        std::fs::write(&path, TOML_FLOW).unwrap();

        let flow = load_flow_file(&path).unwrap();
        assert_eq!(flow.flow_id.0, "credit_analysis");
        assert_eq!(flow.nodes.len(), 2);
        assert_eq!(flow.nodes[1].config["format"], "pdf");
    }

    #[test]
    fn test_load_dir_skips_bad_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.toml"), TOML_FLOW).unwrap();
        std::fs::write(dir.path().join("b.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::write(
            dir.path().join("c.json"),
            serde_json::json!({
                "flow_id": "echo",
                "name": "Echo",
                "nodes": [{"id": "only", "type": "processor", "agent_id": "echo"}],
                "entry_point": "only"
            })
            .to_string(),
        )
        .unwrap();

        let flows = load_flow_dir(dir.path()).unwrap();
        let ids: Vec<&str> = flows.iter().map(|(_, f)| f.flow_id.as_str()).collect();
        assert_eq!(ids, vec!["credit_analysis", "echo"]);
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flow.yaml");
        std::fs::write(&path, "flow_id: x").unwrap();
        assert!(load_flow_file(&path).is_err());
    }
}

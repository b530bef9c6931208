#![forbid(unsafe_code)]

use std::io::Write;
use std::path::PathBuf;

use lds_conformance::{HarnessConfig, collect_forensic_logs};
use serde_json::json;

fn main() -> Result<(), String> {
    let mut output: Option<PathBuf> = None;
    let mut fixture_root: Option<PathBuf> = None;
    let mut suite: Option<String> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a file path".to_string())?;
                output = Some(PathBuf::from(value));
            }
            "--fixtures" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--fixtures requires a directory".to_string())?;
                fixture_root = Some(PathBuf::from(value));
            }
            "--suite" => {
                let value = args.next().ok_or_else(|| {
                    "--suite requires one of: dynamic_layer|op_schema".to_string()
                })?;
                suite = Some(value);
            }
            other => {
                return Err(format!(
                    "unknown arg '{other}'. usage: run_conformance_matrix [--suite dynamic_layer|op_schema] [--fixtures dir] [--output path]"
                ));
            }
        }
    }

    let mut config = HarnessConfig::default_paths();
    if let Some(root) = fixture_root {
        config.fixture_root = root;
    }

    let logs: Vec<_> = collect_forensic_logs(&config)?
        .into_iter()
        .filter(|log| suite.as_deref().is_none_or(|wanted| log.suite_id == wanted))
        .collect();

    let mut lines = String::new();
    for log in &logs {
        let line = log
            .to_json_line()
            .map_err(|error| format!("failed serializing case log: {error}"))?;
        lines.push_str(&line);
        lines.push('\n');
    }

    let failed: Vec<&str> = logs
        .iter()
        .filter(|log| !log.passed())
        .map(|log| log.scenario_id.as_str())
        .collect();

    match output {
        Some(path) => {
            std::fs::write(&path, lines)
                .map_err(|error| format!("failed writing {}: {error}", path.display()))?;
            let summary = json!({
                "output_path": path.display().to_string(),
                "cases_total": logs.len(),
                "cases_failed": failed.len(),
                "failed_scenarios": failed,
            });
            println!("{summary}");
        }
        None => {
            std::io::stdout()
                .write_all(lines.as_bytes())
                .map_err(|error| format!("failed writing case logs: {error}"))?;
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(format!("{} conformance case(s) failed", failed.len()))
    }
}

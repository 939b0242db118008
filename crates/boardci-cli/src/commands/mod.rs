//! CLI command implementations.

pub mod jobs;
pub mod run;

use anyhow::{Context, Result, bail};
use boardci_config::{load_definitions, parse_pipeline};
use boardci_core::pipeline::Pipeline;
use std::path::Path;

/// Load one definition file, or every definition in a directory.
pub fn load(path: &Path) -> Result<Vec<Pipeline>> {
    if path.is_dir() {
        return load_definitions(path)
            .with_context(|| format!("Invalid definitions in {}", path.display()));
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let pipeline =
        parse_pipeline(&content).with_context(|| format!("Invalid definition {}", path.display()))?;
    Ok(vec![pipeline])
}

pub fn validate(path: &Path) -> Result<()> {
    let pipelines = load(path)?;
    if pipelines.is_empty() {
        bail!("No stage definitions found in {}", path.display());
    }
    for pipeline in &pipelines {
        println!("{}", pipeline.name);
        for stage in &pipeline.stages {
            let always = if stage.always { " (always)" } else { "" };
            println!("  {}: {} entries{}", stage.name, stage.entries.len(), always);
        }
    }
    println!("Configuration is valid");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_file_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hikey.kdl");
        std::fs::write(
            &file,
            "pipeline \"hikey\"\nstage \"build\" {\n    run \"make\"\n}\n",
        )
        .unwrap();

        assert_eq!(load(&file).unwrap()[0].name, "hikey");
        assert_eq!(load(dir.path()).unwrap().len(), 1);
        validate(dir.path()).unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_definitions() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("broken.kdl");
        std::fs::write(&file, "stage \"build\" {\n    frobnicate\n}\n").unwrap();
        assert!(validate(&file).is_err());

        let empty = tempfile::tempdir().unwrap();
        assert!(validate(empty.path()).is_err());
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use switchyard_core::error::{FlowError, Result};
use switchyard_core::types::{ArtifactKind, ArtifactRef, ArtifactSpec};

/// Persists node outputs as `<spec_id>.<ext>` files under one directory.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write every spec that has content. Specs without content are skipped.
    ///
    /// A failing spec does not stop the others; its error is collected in
    /// the report next to the artifacts that were written.
    pub fn write(
        &self,
        specs: &[ArtifactSpec],
        content: &HashMap<String, serde_json::Value>,
    ) -> ArtifactReport {
        let mut report = ArtifactReport::default();
        let mut dir_ready = false;
        for spec in specs {
            let Some(value) = content.get(&spec.id) else {
                continue;
            };
            if !dir_ready {
                if let Err(e) = std::fs::create_dir_all(&self.dir) {
                    report.failed.push(write_error(spec, e.to_string()));
                    continue;
                }
                dir_ready = true;
            }
            match self.write_one(spec, value) {
                Ok(artifact) => report.written.push(artifact),
                Err(e) => report.failed.push(e),
            }
        }
        report
    }

    fn write_one(&self, spec: &ArtifactSpec, value: &serde_json::Value) -> Result<ArtifactRef> {
        if !is_safe_id(&spec.id) {
            return Err(write_error(spec, "artifact id must be a plain file name".into()));
        }
        let location = self
            .dir
            .join(format!("{}.{}", spec.id, extension_for(spec)));
        let body = render(value).map_err(|e| write_error(spec, e.to_string()))?;
        std::fs::write(&location, body).map_err(|e| write_error(spec, e.to_string()))?;
        debug!(artifact = %spec.id, path = %location.display(), "Artifact written");

        Ok(ArtifactRef {
            id: spec.id.clone(),
            mime_type: mime_for(spec),
            location,
            metadata: spec.metadata.clone(),
        })
    }
}

/// Outcome of one [`ArtifactWriter::write`] call.
#[derive(Debug, Default)]
pub struct ArtifactReport {
    pub written: Vec<ArtifactRef>,
    pub failed: Vec<FlowError>,
}

/// Ids become file names, so they must stay inside the artifacts directory.
fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && !id.contains("..")
        && !id.contains('/')
        && !id.contains('\\')
}

fn write_error(spec: &ArtifactSpec, message: String) -> FlowError {
    FlowError::ArtifactWrite {
        artifact_id: spec.id.clone(),
        message,
    }
}

/// Strings are written verbatim; anything else is pretty-printed JSON.
fn render(value: &serde_json::Value) -> Result<String> {
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Ok(serde_json::to_string_pretty(other)?),
    }
}

/// File extension for a spec, from its kind and (for code) its language.
pub fn extension_for(spec: &ArtifactSpec) -> &'static str {
    match spec.kind {
        ArtifactKind::Markdown => "md",
        ArtifactKind::Json => "json",
        ArtifactKind::Code => spec
            .language
            .as_deref()
            .map(language_extension)
            .unwrap_or("txt"),
        ArtifactKind::Text => "txt",
    }
}

fn language_extension(language: &str) -> &'static str {
    match language.to_ascii_lowercase().as_str() {
        "python" | "py" => "py",
        "rust" | "rs" => "rs",
        "javascript" | "js" => "js",
        "typescript" | "ts" => "ts",
        "shell" | "bash" | "sh" => "sh",
        "go" | "golang" => "go",
        "java" => "java",
        "sql" => "sql",
        "yaml" | "yml" => "yaml",
        _ => "txt",
    }
}

fn mime_for(spec: &ArtifactSpec) -> String {
    match spec.kind {
        ArtifactKind::Markdown => "text/markdown".to_string(),
        ArtifactKind::Json => "application/json".to_string(),
        ArtifactKind::Code => match spec.language.as_deref() {
            Some(lang) => format!("text/x-{}", lang.to_ascii_lowercase()),
            None => "text/plain".to_string(),
        },
        ArtifactKind::Text => "text/plain".to_string(),
    }
}

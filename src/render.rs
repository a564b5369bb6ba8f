//! Configuration template rendering boundary.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::error::RenderError;

/// Turns a stored template plus variables into configuration text.
///
/// Rendering is pure and synchronous; the engine calls it once per task run.
pub trait TemplateRenderer: Send + Sync {
    fn render(
        &self,
        template_id: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<String, RenderError>;
}

/// Splits rendered text into trimmed, non-empty configuration lines.
pub fn config_lines(rendered: &str) -> Vec<String> {
    rendered
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Prefixes of saved-config lines that describe the device rather than
/// configure it.
const RESTORE_SKIP: [&str; 4] = ["!", "version", "boot-start-marker", "boot-end-marker"];

/// Configuration lines of a saved running config that can be pushed back,
/// with comments, version and boot markers removed.
pub fn restore_lines(saved: &str) -> Vec<String> {
    config_lines(saved)
        .into_iter()
        .filter(|line| !RESTORE_SKIP.iter().any(|prefix| line.starts_with(prefix)))
        .collect()
}

/// Renderer over in-memory templates with `{{ name }}` placeholders.
#[derive(Debug, Clone, Default)]
pub struct MemoryTemplates {
    templates: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, template_id: impl Into<String>, body: impl Into<String>) {
        self.templates
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(template_id.into(), body.into());
    }
}

impl TemplateRenderer for MemoryTemplates {
    fn render(
        &self,
        template_id: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<String, RenderError> {
        let templates = self
            .templates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let body = templates
            .get(template_id)
            .ok_or_else(|| RenderError::TemplateNotFound(template_id.to_string()))?;

        let mut rendered = String::with_capacity(body.len());
        let mut rest = body.as_str();
        while let Some(start) = rest.find("{{") {
            rendered.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| RenderError::Invalid(format!("unclosed placeholder in {template_id}")))?;
            let name = after[..end].trim();
            let value = vars
                .get(name)
                .ok_or_else(|| RenderError::MissingVariable(name.to_string()))?;
            rendered.push_str(value);
            rest = &after[end + 2..];
        }
        rendered.push_str(rest);
        Ok(rendered)
    }
}

//! Rendering prompt lists for export.

use crate::types::{Prompt, PromptOrigin};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Text,
    Markdown,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "text" | "txt" => Ok(ExportFormat::Text),
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            other => Err(format!("unknown export format: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub format: ExportFormat,
    pub include_timestamp: bool,
    /// Ids, DOM positions and origin
    pub include_metadata: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            format: ExportFormat::Json,
            include_timestamp: true,
            include_metadata: false,
        }
    }
}

#[derive(Serialize)]
struct ExportedPrompt<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dom_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin: Option<PromptOrigin>,
}

fn datetime(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

fn human_time(ms: i64) -> String {
    datetime(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// Render `prompts` in the requested format
pub fn render(prompts: &[Prompt], options: &ExportOptions) -> Result<String, ExportError> {
    match options.format {
        ExportFormat::Json => render_json(prompts, options),
        ExportFormat::Text => Ok(render_text(prompts, options)),
        ExportFormat::Markdown => Ok(render_markdown(prompts, options)),
    }
}

fn render_json(prompts: &[Prompt], options: &ExportOptions) -> Result<String, ExportError> {
    let exported: Vec<ExportedPrompt<'_>> = prompts
        .iter()
        .map(|p| ExportedPrompt {
            id: options.include_metadata.then_some(p.id.as_str()),
            content: &p.content,
            timestamp: if options.include_timestamp {
                datetime(p.timestamp).map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            } else {
                None
            },
            dom_index: if options.include_metadata { p.dom_index } else { None },
            origin: options.include_metadata.then_some(p.origin),
        })
        .collect();
    Ok(serde_json::to_string_pretty(&exported)?)
}

fn render_text(prompts: &[Prompt], options: &ExportOptions) -> String {
    let mut out = String::new();
    for (i, prompt) in prompts.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = write!(out, "[{}]", i + 1);
        if options.include_timestamp {
            let _ = write!(out, " {}", human_time(prompt.timestamp));
        }
        if options.include_metadata {
            let _ = write!(out, " ({})", prompt.id);
        }
        out.push('\n');
        out.push_str(&prompt.content);
        out.push('\n');
    }
    out
}

fn render_markdown(prompts: &[Prompt], options: &ExportOptions) -> String {
    let mut out = String::from("# Prompts\n");
    for (i, prompt) in prompts.iter().enumerate() {
        let _ = write!(out, "\n## {}", i + 1);
        if options.include_timestamp {
            let _ = write!(out, " · {}", human_time(prompt.timestamp));
        }
        out.push_str("\n\n");
        if options.include_metadata {
            let _ = writeln!(out, "`{}`\n", prompt.id);
        }
        for line in prompt.content.lines() {
            let _ = writeln!(out, "> {}", line);
        }
    }
    out
}

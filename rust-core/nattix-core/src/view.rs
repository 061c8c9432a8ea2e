//! # Views
//!
//! Renders `templates/<name>.html` with `{{key}}` placeholders and, when
//! present, wraps the result in `templates/layouts/<layout>.html`.
//!
//! Layout placeholders: `{{content}}`, one per partial name,
//! `{{stylesheets}}` and `{{scripts}}`. Assigned values are reachable from
//! both files; dotted keys (`{{user.name}}`) walk into JSON objects.

use crate::error::{Error, Result};
use crate::request::sanitize;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::debug;

/// Template and layout renderer
#[derive(Debug, Clone)]
pub struct View {
    templates_dir: PathBuf,
    url_root: String,
    data: Map<String, Value>,
    layout: String,
    partials: Vec<(String, String)>,
    stylesheets: Vec<String>,
    scripts: Vec<String>,
}

impl View {
    /// View reading templates from `templates_dir`
    pub fn new(templates_dir: impl Into<PathBuf>, url_root: impl Into<String>) -> Self {
        Self {
            templates_dir: templates_dir.into(),
            url_root: url_root.into(),
            data: Map::new(),
            layout: "default".to_string(),
            partials: Vec::new(),
            stylesheets: Vec::new(),
            scripts: Vec::new(),
        }
    }

    /// Make a value available to templates
    pub fn assign<T: Serialize>(&mut self, key: &str, value: T) -> &mut Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.data.insert(key.to_string(), value);
        self
    }

    /// Select the layout file (without extension)
    pub fn use_layout(&mut self, layout: &str) -> &mut Self {
        self.layout = layout.to_string();
        self
    }

    /// Raw HTML substituted for `{{name}}` in the layout
    pub fn add_partial(&mut self, name: &str, html: impl Into<String>) -> &mut Self {
        self.partials.push((name.to_string(), html.into()));
        self
    }

    /// Stylesheet path, relative to the URL root
    pub fn add_stylesheet(&mut self, path: &str) -> &mut Self {
        self.stylesheets.push(path.to_string());
        self
    }

    /// Script URL
    pub fn add_script(&mut self, path: &str) -> &mut Self {
        self.scripts.push(path.to_string());
        self
    }

    /// Render a template
    ///
    /// # Errors
    ///
    /// `TemplateNotFound` when `<template>.html` does not exist.
    pub fn render(&self, template: &str) -> Result<String> {
        let template_path = self.templates_dir.join(format!("{template}.html"));
        let source = std::fs::read_to_string(&template_path).map_err(|_| Error::TemplateNotFound {
            path: template_path.display().to_string(),
        })?;
        let content = substitute(&source, |key| self.lookup(key));

        let layout_path = self
            .templates_dir
            .join("layouts")
            .join(format!("{}.html", self.layout));
        let Ok(layout) = std::fs::read_to_string(&layout_path) else {
            debug!(layout = %self.layout, "Layout not found, rendering content alone");
            return Ok(content);
        };

        let stylesheets = self.stylesheet_tags();
        let scripts = self.script_tags();
        Ok(substitute(&layout, |key| match key {
            "content" => Some(content.clone()),
            "stylesheets" => Some(stylesheets.clone()),
            "scripts" => Some(scripts.clone()),
            _ => self
                .partials
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, html)| html.clone())
                .or_else(|| self.lookup(key)),
        }))
    }

    fn lookup(&self, key: &str) -> Option<String> {
        let mut parts = key.split('.');
        let mut value = self.data.get(parts.next()?)?;
        for part in parts {
            value = match value {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(match value {
            Value::String(s) => sanitize(s),
            Value::Null => String::new(),
            other => sanitize(&other.to_string()),
        })
    }

    /// `path` under the URL root; absolute URLs are kept as given
    fn asset_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") || path.starts_with("//") {
            path.to_string()
        } else {
            format!("{}/{}", self.url_root, path.trim_start_matches('/'))
        }
    }

    fn stylesheet_tags(&self) -> String {
        self.stylesheets
            .iter()
            .map(|css| format!(r#"<link rel="stylesheet" href="{}">"#, self.asset_url(css)))
            .collect()
    }

    fn script_tags(&self) -> String {
        self.scripts
            .iter()
            .map(|js| format!(r#"<script src="{}"></script>"#, self.asset_url(js)))
            .collect()
    }
}

/// Replace every `{{ key }}` the resolver knows; unknown ones stay as written
fn substitute(source: &str, resolve: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = after[..end].trim();
        match resolve(key) {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

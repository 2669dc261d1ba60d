//! Markdown documents with a flat `key: value` front matter block.
//!
//! Keys keep their original order on rewrite; unknown keys round-trip untouched.

/// A task or approval document split into front matter and body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskDocument {
    front: Vec<(String, String)>,
    pub body: String,
}

impl TaskDocument {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            front: Vec::new(),
            body: body.into(),
        }
    }

    /// Parse a document. Content without a front matter block becomes the body.
    pub fn parse(contents: &str) -> Self {
        match split_frontmatter(contents) {
            Some((frontmatter, rest)) => Self {
                front: parse_pairs(frontmatter),
                body: rest.trim_start_matches('\n').to_string(),
            },
            None => Self::new(contents),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.front
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    /// Insert or replace `key`, keeping its position when it already exists.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = sanitize_value(&value.into());
        if let Some(slot) = self.front.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.front.push((key.to_string(), value));
        }
    }

    /// Set `key` only if it has no value yet.
    pub fn set_if_missing(&mut self, key: &str, value: impl Into<String>) {
        if self.get(key).is_none() {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.front.retain(|(k, _)| k != key);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.front.iter().map(|(k, _)| k.as_str())
    }

    pub fn status(&self) -> Option<&str> {
        self.get("status")
    }

    /// Append a markdown section at the end of the body.
    pub fn append_section(&mut self, heading: &str, content: &str) {
        let trimmed = self.body.trim_end().to_string();
        self.body = format!("{trimmed}\n\n## {heading}\n\n{}\n", content.trim_end());
    }

    pub fn render(&self) -> String {
        if self.front.is_empty() {
            let mut buf = self.body.clone();
            if !buf.ends_with('\n') {
                buf.push('\n');
            }
            return buf;
        }
        let frontmatter: String = self
            .front
            .iter()
            .map(|(k, v)| format!("{k}: {v}\n"))
            .collect();
        render_frontmatter(&frontmatter, &self.body)
    }
}

fn parse_pairs(frontmatter: &str) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    for line in frontmatter.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let key = key.trim().to_string();
        let value = unquote(value.trim());
        if let Some(slot) = pairs.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            pairs.push((key, value));
        }
    }
    pairs
}

fn unquote(value: &str) -> String {
    if value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')))
    {
        return value[1..value.len() - 1].to_string();
    }
    value.to_string()
}

fn sanitize_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ").trim().to_string()
}

fn render_frontmatter(frontmatter: &str, rest: &str) -> String {
    let mut buf = String::new();
    buf.push_str("---\n");
    buf.push_str(frontmatter.trim_end());
    buf.push('\n');
    buf.push_str("---\n\n");
    buf.push_str(rest.trim_start_matches('\n'));
    if !buf.ends_with('\n') {
        buf.push('\n');
    }
    buf
}

/// Split a document into (frontmatter, rest). Returns None if it doesn't look like frontmatter.
fn split_frontmatter(contents: &str) -> Option<(&str, &str)> {
    let after = contents
        .strip_prefix("---\n")
        .or_else(|| contents.strip_prefix("---\r\n"))?;
    if let Some(end) = after.find("\n---\n") {
        return Some((&after[..end], &after[end + 5..]));
    }
    if let Some(end) = after.find("\n---\r\n") {
        return Some((&after[..end], &after[end + 6..]));
    }
    let trimmed = after.trim_end_matches(['\n', '\r']);
    trimmed.strip_suffix("\n---").map(|fm| (fm, ""))
}

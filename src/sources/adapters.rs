//! Result layouts for the supported knowledge-source servers.
//!
//! Each adapter knows which tool to call, how to phrase its arguments, and
//! how to render one result object as an attributed context block. Missing
//! fields are dropped line by line rather than rendered empty.

use serde_json::{Map, Value};

/// How the result count is passed to the remote tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentLayout {
    /// `{query, top_k}`
    TopK,
    /// `{query, count}`
    Count,
}

impl ArgumentLayout {
    pub fn arguments(self, query: &str, top_k: usize) -> Map<String, Value> {
        let key = match self {
            ArgumentLayout::TopK => "top_k",
            ArgumentLayout::Count => "count",
        };
        Map::from_iter([
            ("query".to_string(), Value::String(query.to_string())),
            (key.to_string(), Value::from(top_k)),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultFormatter {
    /// Security compliance controls (NIST 800-53, OWASP, ...).
    Compliance,
    /// Microsoft Learn documentation search.
    Docs,
    /// Export regulations and sanctions lists.
    ExportControl,
}

const DOCS_CONTENT_LIMIT: usize = 500;

impl ResultFormatter {
    /// Resolves the `adapter` value of a `[sources.*]` table.
    pub fn from_adapter(adapter: &str) -> Option<Self> {
        match adapter {
            "compliance" => Some(Self::Compliance),
            "docs" => Some(Self::Docs),
            "export_control" => Some(Self::ExportControl),
            _ => None,
        }
    }

    pub fn tool_name(self) -> &'static str {
        match self {
            Self::Compliance => "search_compliance",
            Self::Docs => "microsoft_docs_search",
            Self::ExportControl => "search_regulations",
        }
    }

    pub fn layout(self) -> ArgumentLayout {
        match self {
            Self::Docs => ArgumentLayout::Count,
            Self::Compliance | Self::ExportControl => ArgumentLayout::TopK,
        }
    }

    pub fn default_display_name(self) -> &'static str {
        match self {
            Self::Compliance => "Compliance",
            Self::Docs => "Microsoft Learn",
            Self::ExportControl => "Export Control",
        }
    }

    /// Renders one result object. Returns `None` when the entry carries
    /// nothing worth showing.
    pub fn format(self, entry: &Value) -> Option<String> {
        if !entry.is_object() {
            return None;
        }
        match self {
            Self::Compliance => Some(format_compliance(entry)),
            Self::Docs => format_docs(entry),
            Self::ExportControl => Some(format_export_control(entry)),
        }
    }
}

/// First present, non-empty field among `keys`, rendered as text.
fn field(entry: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match entry.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

fn push_line(lines: &mut Vec<String>, label: &str, value: Option<String>) {
    if let Some(value) = value {
        lines.push(format!("{}: {}", label, value));
    }
}

fn format_compliance(entry: &Value) -> String {
    let id = field(entry, &["control_id", "id"]).unwrap_or_else(|| "Unknown".to_string());
    let mut lines = vec![format!("[Compliance Control: {}]", id)];
    push_line(&mut lines, "Framework", field(entry, &["framework"]));
    push_line(&mut lines, "Title", field(entry, &["title"]));
    push_line(&mut lines, "Description", field(entry, &["description"]));
    lines.join("\n")
}

fn format_docs(entry: &Value) -> Option<String> {
    let title = field(entry, &["title"]);
    let content = field(entry, &["content", "snippet"]);
    if title.is_none() && content.is_none() {
        return None;
    }

    let mut lines = vec![match &title {
        Some(title) => format!("[Microsoft Learn: {}]", title),
        None => "[Microsoft Learn]".to_string(),
    }];
    push_line(&mut lines, "Summary", field(entry, &["description", "summary"]));
    push_line(
        &mut lines,
        "Content",
        content.map(|c| truncate(&c, DOCS_CONTENT_LIMIT)),
    );
    push_line(&mut lines, "URL", field(entry, &["url", "link"]));
    Some(lines.join("\n"))
}

fn format_export_control(entry: &Value) -> String {
    let id = field(entry, &["id", "control_id"]).unwrap_or_else(|| "Unknown".to_string());
    let mut lines = vec![format!("[Export Control: {}]", id)];
    push_line(
        &mut lines,
        "Type",
        Some(field(entry, &["type"]).unwrap_or_else(|| "Regulation".to_string())),
    );
    push_line(&mut lines, "Source", field(entry, &["source", "framework"]));
    push_line(&mut lines, "Title", field(entry, &["title"]));
    push_line(&mut lines, "Description", field(entry, &["description", "text"]));
    lines.join("\n")
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compliance_format() {
        let entry = json!({
            "control_id": "AC-2",
            "framework": "NIST 800-53",
            "title": "Account Management",
            "description": "Manage system accounts."
        });
        assert_eq!(
            ResultFormatter::Compliance.format(&entry).unwrap(),
            "[Compliance Control: AC-2]\nFramework: NIST 800-53\nTitle: Account Management\nDescription: Manage system accounts."
        );
    }

    #[test]
    fn test_compliance_omits_missing_lines() {
        let entry = json!({"title": "Only a title"});
        assert_eq!(
            ResultFormatter::Compliance.format(&entry).unwrap(),
            "[Compliance Control: Unknown]\nTitle: Only a title"
        );
    }

    #[test]
    fn test_docs_format_truncates_content() {
        let long = "x".repeat(600);
        let entry = json!({
            "title": "Azure Functions",
            "summary": "Serverless compute.",
            "content": long,
            "link": "https://learn.microsoft.com/azure/functions"
        });
        let text = ResultFormatter::Docs.format(&entry).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "[Microsoft Learn: Azure Functions]");
        assert_eq!(lines[1], "Summary: Serverless compute.");
        assert_eq!(lines[2], format!("Content: {}...", "x".repeat(500)));
        assert_eq!(lines[3], "URL: https://learn.microsoft.com/azure/functions");
    }

    #[test]
    fn test_docs_skips_empty_results() {
        assert!(ResultFormatter::Docs
            .format(&json!({"url": "https://example.com"}))
            .is_none());
        assert_eq!(
            ResultFormatter::Docs
                .format(&json!({"snippet": "body"}))
                .unwrap(),
            "[Microsoft Learn]\nContent: body"
        );
    }

    #[test]
    fn test_export_control_format() {
        let entry = json!({
            "id": "ECCN 5A002",
            "framework": "EAR",
            "text": "Information security items."
        });
        assert_eq!(
            ResultFormatter::ExportControl.format(&entry).unwrap(),
            "[Export Control: ECCN 5A002]\nType: Regulation\nSource: EAR\nDescription: Information security items."
        );
    }

    #[test]
    fn test_non_object_entries_are_skipped() {
        assert!(ResultFormatter::Compliance.format(&json!("text")).is_none());
        assert!(ResultFormatter::ExportControl.format(&json!(3)).is_none());
    }

    #[test]
    fn test_argument_layouts() {
        let args = ResultFormatter::Docs.layout().arguments("vnet peering", 4);
        assert_eq!(Value::Object(args), json!({"query": "vnet peering", "count": 4}));
        let args = ResultFormatter::Compliance.layout().arguments("mfa", 2);
        assert_eq!(Value::Object(args), json!({"query": "mfa", "top_k": 2}));
    }

    #[test]
    fn test_from_adapter() {
        assert_eq!(
            ResultFormatter::from_adapter("export_control"),
            Some(ResultFormatter::ExportControl)
        );
        assert_eq!(ResultFormatter::from_adapter("both"), None);
    }
}

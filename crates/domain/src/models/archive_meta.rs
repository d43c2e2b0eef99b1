//! Provenance metadata written into every export archive.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Help text included in `meta.json` and `README.md`.
pub const HELP_STRING: &str = "This archive contains the data exported from the applications \
listed below. Each file is named after the source that produced it; the filters used to select \
the data are recorded next to each file. Sources that failed to export are not included.";

/// One file in the archive and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub filename: String,
    pub application: String,
    pub resource: String,
    pub filters: serde_json::Value,
}

/// Contents of `meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMeta {
    pub exported_by: String,
    /// ISO-8601 UTC timestamp.
    pub export_date: String,
    pub export_org_id: String,
    pub file_meta: Vec<FileMeta>,
    pub help_string: String,
}

impl ExportMeta {
    pub fn new(
        exported_by: &str,
        org_id: &str,
        export_date: DateTime<Utc>,
        file_meta: Vec<FileMeta>,
    ) -> Self {
        Self {
            exported_by: exported_by.to_string(),
            export_date: export_date.to_rfc3339_opts(SecondsFormat::Secs, true),
            export_org_id: org_id.to_string(),
            file_meta,
            help_string: HELP_STRING.to_string(),
        }
    }

    /// Renders the human-readable `README.md`.
    pub fn render_readme(&self) -> String {
        let mut out = String::new();
        out.push_str("# Export Manifest\n\n");
        out.push_str("## Exported Information\n\n");
        out.push_str(&format!("- **Exported By:** {}\n", self.exported_by));
        out.push_str(&format!("- **Org ID:** {}\n", self.export_org_id));
        out.push_str(&format!("- **Export Date:** {}\n\n", self.export_date));

        out.push_str("## Exported Files\n\n");
        if self.file_meta.is_empty() {
            out.push_str("No files were exported.\n");
        }
        for file in &self.file_meta {
            out.push_str(&format!("- **File:** {}\n", file.filename));
            out.push_str(&format!("  - **Application:** {}\n", file.application));
            out.push_str(&format!("  - **Resource:** {}\n", file.resource));
            match file.filters.as_object() {
                Some(map) if !map.is_empty() => {
                    out.push_str("  - **Filters:**\n");
                    for (key, value) in map {
                        let rendered = match value {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        out.push_str(&format!("    - {}: {}\n", key, rendered));
                    }
                }
                _ => out.push_str("  - **Filters:** none\n"),
            }
        }

        out.push_str("\n## Help Information\n\n");
        out.push_str(&self.help_string);
        out.push('\n');
        out
    }
}

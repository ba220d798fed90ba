use std::collections::HashMap;
use std::path::Path;

use crate::bead::BeadContext;
use crate::cap_error::CapError;

// --- Embedded defaults ---

/// Default phase templates compiled into the binary. A local file at
/// `{root}/prompts/{phase}.md` overlays the embedded default of the same
/// name.
const EMBEDDED_TEMPLATES: [(&str, &str); 6] = [
    ("test-writer", include_str!("../prompts/test-writer.md")),
    ("test-review", include_str!("../prompts/test-review.md")),
    ("execute", include_str!("../prompts/execute.md")),
    ("execute-review", include_str!("../prompts/execute-review.md")),
    ("sign-off", include_str!("../prompts/sign-off.md")),
    ("merge", include_str!("../prompts/merge.md")),
];

/// Load the template for a phase: local overlay first, embedded fallback.
pub fn load_template(project_root: &Path, phase: &str) -> Result<String, CapError> {
    let local = project_root.join("prompts").join(format!("{}.md", phase));
    if local.exists() {
        return std::fs::read_to_string(&local)
            .map_err(|e| CapError::Io(format!("Failed to read {}: {}", local.display(), e)));
    }

    EMBEDDED_TEMPLATES
        .iter()
        .find(|(name, _)| *name == phase)
        .map(|(_, body)| body.to_string())
        .ok_or_else(|| CapError::NotFound(format!("prompt template for phase '{}'", phase)))
}

// --- Sibling context ---

/// Summary of a prior sibling task, carried into later prompts when
/// cross-run context is enabled.
#[derive(Clone, Debug, PartialEq)]
pub struct SiblingSummary {
    pub bead_id: String,
    pub title: String,
    pub summary: String,
    pub files_changed: Vec<String>,
}

fn render_siblings(siblings: &[SiblingSummary]) -> String {
    if siblings.is_empty() {
        return "(none)".to_string();
    }

    siblings
        .iter()
        .map(|s| {
            let files = if s.files_changed.is_empty() {
                String::new()
            } else {
                format!(" (files: {})", s.files_changed.join(", "))
            };
            format!("- {} — {}{}\n  {}", s.bead_id, s.title, files, s.summary)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// --- Interpolation ---

/// Substitute `{{.Field}}` references in a template.
///
/// A reference to a field not present in `fields` is a hard error -- typos
/// must not silently vanish.
pub fn interpolate(template: &str, fields: &HashMap<&str, String>) -> Result<String, CapError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{.") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let end = after.find("}}").ok_or_else(|| {
            CapError::Io("Unterminated {{.Field}} reference in prompt template".to_string())
        })?;
        let field = &after[..end];

        match fields.get(field) {
            Some(value) => out.push_str(value),
            None => {
                return Err(CapError::Io(format!(
                    "Unknown field '{{{{.{}}}}}' in prompt template",
                    field
                )))
            }
        }

        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

// --- Composition ---

/// Compose the full prompt for one phase call.
///
/// Structure: [interpolated template] + [parent context] + [previous
/// feedback]. The `Feedback` field is empty on a pair's first attempt; on
/// retry the reviewer's feedback is both available to the template and
/// appended as a trailing section so templates that don't reference the
/// field still carry it.
pub fn compose(
    project_root: &Path,
    phase: &str,
    ctx: &BeadContext,
    feedback: &str,
    siblings: &[SiblingSummary],
) -> Result<String, CapError> {
    let template = load_template(project_root, phase)?;

    let mut fields: HashMap<&str, String> = HashMap::new();
    fields.insert("BeadID", ctx.task_id.clone());
    fields.insert("Title", ctx.task_title.clone());
    fields.insert("Description", ctx.task_description.clone());
    fields.insert("AcceptanceCriteria", ctx.acceptance_criteria.clone());
    fields.insert("Feedback", feedback.to_string());
    fields.insert("SiblingContext", render_siblings(siblings));

    let mut prompt = interpolate(&template, &fields)?;

    if let Some(chain) = render_parent_chain(ctx) {
        prompt.push_str("\n\n## Parent Context\n\n");
        prompt.push_str(&chain);
        prompt.push('\n');
    }

    if !feedback.is_empty() {
        prompt.push_str("---\n\n## Previous Feedback\n\n");
        prompt.push_str(feedback);
        prompt.push('\n');
    }

    Ok(prompt)
}

/// Render the feature/epic chain when present.
fn render_parent_chain(ctx: &BeadContext) -> Option<String> {
    let mut lines = Vec::new();

    if let (Some(id), Some(title)) = (&ctx.feature_id, &ctx.feature_title) {
        lines.push(format!("- **Feature:** {} — {}", id, title));
        if let Some(goal) = ctx.feature_goal.as_deref().filter(|g| !g.is_empty()) {
            lines.push(format!("  {}", goal));
        }
    }

    if let (Some(id), Some(title)) = (&ctx.epic_id, &ctx.epic_title) {
        lines.push(format!("- **Epic:** {} — {}", id, title));
        if let Some(goal) = ctx.epic_goal.as_deref().filter(|g| !g.is_empty()) {
            lines.push(format!("  {}", goal));
        }
    }

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields_with(entries: &[(&'static str, &str)]) -> HashMap<&'static str, String> {
        entries
            .iter()
            .map(|(k, v)| (*k, v.to_string()))
            .collect()
    }

    #[test]
    fn interpolate_substitutes_fields() {
        let fields = fields_with(&[("BeadID", "t-1"), ("Title", "Parser")]);
        let out = interpolate("Bead {{.BeadID}}: {{.Title}}", &fields).unwrap();
        assert_eq!(out, "Bead t-1: Parser");
    }

    #[test]
    fn interpolate_unknown_field_is_hard_error() {
        let fields = fields_with(&[("BeadID", "t-1")]);
        let err = interpolate("{{.BaedID}}", &fields).unwrap_err();
        assert!(err.to_string().contains("BaedID"));
    }

    #[test]
    fn interpolate_unterminated_reference_is_error() {
        let fields = fields_with(&[("BeadID", "t-1")]);
        assert!(interpolate("{{.BeadID", &fields).is_err());
    }

    #[test]
    fn render_siblings_empty_is_none_marker() {
        assert_eq!(render_siblings(&[]), "(none)");
    }
}

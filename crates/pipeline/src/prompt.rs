use crate::registry::FieldSchema;

/// Default mapping instructions used when a binding carries no prompt override
pub const DEFAULT_INSTRUCTIONS: &str = "Extract the information described by the fields below from the \
video transcription and the on-screen text. Use only facts present in the content. Select fields must \
use one of the listed options exactly. Leave a field empty when the content does not mention it.";

/// Render the schema as one `- name (type)` line per field
pub fn describe_fields(schema: &FieldSchema) -> String {
    schema
        .iter()
        .map(|(name, spec)| {
            if spec.options.is_empty() {
                format!("- {} ({})", name, spec.kind)
            } else {
                format!("- {} ({}: one of {})", name, spec.kind, spec.options.join(", "))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the summarization prompt for one video
pub fn build_summary_prompt(
    transcript: &str,
    extracted_text: &str,
    schema: &FieldSchema,
    prompt_override: Option<&str>,
) -> String {
    let instructions = prompt_override
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_INSTRUCTIONS);

    let on_screen = if extracted_text.trim().is_empty() {
        "(no on-screen text available)"
    } else {
        extracted_text.trim()
    };

    format!(
        "{instructions}\n\n\
         Schema fields:\n{fields}\n\n\
         Respond with a single JSON object whose keys are exactly the field names above.\n\n\
         Transcription:\n{transcript}\n\n\
         On-screen text:\n{on_screen}\n",
        instructions = instructions,
        fields = describe_fields(schema),
        transcript = transcript.trim(),
        on_screen = on_screen,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FieldSpec;

    fn schema() -> FieldSchema {
        let mut schema = FieldSchema::new();
        schema.insert("Place".to_string(), FieldSpec::new("title"));
        schema.insert(
            "Category".to_string(),
            FieldSpec {
                kind: "select".to_string(),
                options: vec!["Restaurant".to_string(), "Cafe".to_string()],
            },
        );
        schema
    }

    #[test]
    fn test_describe_fields() {
        assert_eq!(
            describe_fields(&schema()),
            "- Category (select: one of Restaurant, Cafe)\n- Place (title)"
        );
    }

    #[test]
    fn test_prompt_uses_override() {
        let prompt = build_summary_prompt("we ate noodles", "Noodle Bar", &schema(), Some("Find the restaurant"));
        assert!(prompt.starts_with("Find the restaurant"));
        assert!(!prompt.contains(DEFAULT_INSTRUCTIONS));
        assert!(prompt.contains("we ate noodles"));
        assert!(prompt.contains("Noodle Bar"));
    }

    #[test]
    fn test_prompt_without_ocr_or_override() {
        let prompt = build_summary_prompt("hello", "  ", &schema(), Some("   "));
        assert!(prompt.starts_with(DEFAULT_INSTRUCTIONS));
        assert!(prompt.contains("(no on-screen text available)"));
    }
}

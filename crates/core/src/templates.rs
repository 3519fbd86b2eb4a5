//! Message template rendering engine.

use crate::types::{Member, Sequence, Step};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.-]*)\s*\}\}").expect("placeholder regex is valid")
    })
}

/// Simple template renderer using {{variable}} syntax. Placeholders with no
/// matching variable are stripped from the output.
#[derive(Debug, Clone, Default)]
pub struct TemplateRenderer {
    variables: HashMap<String, String>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self {
            variables: HashMap::new(),
        }
    }

    /// Variables for one step of a sequence addressed to one member.
    pub fn for_step(member: &Member, sequence: &Sequence, step: &Step) -> Self {
        let mut renderer = Self::new();
        renderer
            .set("first_name", member.first_name.clone().unwrap_or_default())
            .set("full_name", member.full_name())
            .set("organization", member.organization.clone().unwrap_or_default())
            .set("sequence_name", sequence.name.clone())
            .set("step_number", (step.index + 1).to_string());
        renderer
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn render(&self, template: &str) -> String {
        placeholder_regex()
            .replace_all(template, |caps: &Captures| {
                self.variables.get(&caps[1]).cloned().unwrap_or_default()
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn fixtures() -> (Member, Sequence) {
        let member = Member {
            id: Uuid::new_v4(),
            email: "grace@example.com".into(),
            first_name: Some("Grace".into()),
            last_name: Some("Hopper".into()),
            organization: None,
        };
        let sequence = Sequence::new(
            "Welcome",
            vec![Step {
                index: 0,
                delay_days: 0,
                subject: String::new(),
                body: String::new(),
            }],
        );
        (member, sequence)
    }

    #[test]
    fn test_known_placeholders() {
        let (member, sequence) = fixtures();
        let r = TemplateRenderer::for_step(&member, &sequence, &sequence.steps[0]);
        assert_eq!(
            r.render("Hi {{first_name}} ({{ full_name }}) - {{sequence_name}} #{{step_number}}"),
            "Hi Grace (Grace Hopper) - Welcome #1"
        );
    }

    #[test]
    fn test_missing_and_unknown_placeholders_are_stripped() {
        let (member, sequence) = fixtures();
        let r = TemplateRenderer::for_step(&member, &sequence, &sequence.steps[0]);
        assert_eq!(r.render("Team {{organization}}!"), "Team !");
        assert_eq!(r.render("Hello {{nickname}}{{}}."), "Hello .");
    }

    #[test]
    fn test_plain_text_untouched() {
        let r = TemplateRenderer::new();
        assert_eq!(r.render("no placeholders { here }"), "no placeholders { here }");
    }
}

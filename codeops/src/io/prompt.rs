//! Prompt rendering for the planning and generation stages.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the budget, droppable sections go first
//! (inventory, then expectations, then the touch list); if that is not
//! enough, the last section is cut.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::requirement::Requirement;
use crate::core::text::truncate_chars;
use crate::core::types::ChangePlan;

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const GENERATE_TEMPLATE: &str = include_str!("prompts/generate.md");

const DROP_ORDER: [&str; 3] = ["inventory", "expectations", "touch_list"];
const TRUNCATED: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
});

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

/// Renders stage prompts within a character budget.
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_chars: usize,
}

impl PromptBuilder {
    pub fn new(budget_chars: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("plan", PLAN_TEMPLATE)
            .context("load plan template")?;
        env.add_template("generate", GENERATE_TEMPLATE)
            .context("load generate template")?;
        Ok(Self { env, budget_chars })
    }

    /// Prompt for `plan_changes`: requirement plus repository inventory.
    pub fn plan(&self, req: &Requirement, inventory: &str) -> Result<String> {
        let rendered = self
            .env
            .get_template("plan")?
            .render(context! {
                req => req,
                description => req.codegen.description.trim(),
                expectations => &req.codegen.test_expectations,
                inventory => (!inventory.trim().is_empty()).then(|| inventory.trim()),
            })
            .context("render plan prompt")?;
        Ok(self.fit(&rendered))
    }

    /// Prompt for `generate_changes`: requirement, plan, and test expectations.
    pub fn generate(&self, req: &Requirement, plan: &ChangePlan, repo_dir: &Path) -> Result<String> {
        let rendered = self
            .env
            .get_template("generate")?
            .render(context! {
                req => req,
                description => req.codegen.description.trim(),
                expectations => &req.codegen.test_expectations,
                plan => plan,
                repo_dir => repo_dir.display().to_string(),
            })
            .context("render generate prompt")?;
        Ok(self.fit(&rendered))
    }

    fn fit(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_chars);
        sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn total_chars(sections: &[Section]) -> usize {
    sections.iter().map(|s| s.content.chars().count()).sum()
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    for key in DROP_ORDER {
        if total_chars(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            let dropped = sections.remove(idx);
            debug!(section = key, chars = dropped.content.chars().count(), "dropped prompt section for budget");
        }
    }

    let total = total_chars(sections);
    if total <= budget {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let last_len = last.content.chars().count();
    let allowed = budget.saturating_sub(total - last_len);
    last.content = truncate_chars(&last.content, allowed, TRUNCATED);
    debug!(section = %last.key, before = last_len, after = allowed, "truncated prompt section for budget");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_requirement;

    fn plan() -> ChangePlan {
        ChangePlan {
            summary: "Add greet() and a test".to_string(),
            touched_files: vec!["src/app.py".to_string(), "tests/test_app.py".to_string()],
        }
    }

    #[test]
    fn plan_prompt_orders_sections() {
        let builder = PromptBuilder::new(100_000).expect("builder");
        let prompt = builder
            .plan(&sample_requirement(), "src/app.py\nREADME.md")
            .expect("render");
        let contract = prompt.find("### Planning Contract").expect("contract");
        let requirement = prompt.find("### Requirement").expect("requirement");
        let inventory = prompt.find("### Repository Inventory").expect("inventory");
        assert!(contract < requirement && requirement < inventory);
        assert!(prompt.contains("- ID: REQ-1"));
        assert!(prompt.contains("- LANGUAGE: python"));
        assert!(prompt.contains("src/app.py\nREADME.md"));
        assert!(!prompt.contains("<!--"));
    }

    #[test]
    fn generate_prompt_lists_plan_and_expectations() {
        let builder = PromptBuilder::new(100_000).expect("builder");
        let prompt = builder
            .generate(&sample_requirement(), &plan(), Path::new("/jobs/1/repo"))
            .expect("render");
        assert!(prompt.contains("Add greet() and a test"));
        assert!(prompt.contains("- tests/test_app.py"));
        assert!(prompt.contains("- greet returns a greeting"));
        assert!(prompt.contains("REPO ROOT: /jobs/1/repo"));
    }

    #[test]
    fn generate_prompt_without_expectations_says_none() {
        let mut req = sample_requirement();
        req.codegen.test_expectations.clear();
        let builder = PromptBuilder::new(100_000).expect("builder");
        let prompt = builder
            .generate(&req, &plan(), Path::new("/r"))
            .expect("render");
        assert!(prompt.contains("- (none)"));
    }

    #[test]
    fn budget_drops_inventory_first() {
        let builder = PromptBuilder::new(1_200).expect("builder");
        let inventory = "some/long/path.py\n".repeat(200);
        let prompt = builder
            .plan(&sample_requirement(), &inventory)
            .expect("render");
        assert!(!prompt.contains("### Repository Inventory"));
        assert!(prompt.contains("### Planning Contract"));
        assert!(prompt.contains("### Requirement"));
    }

    #[test]
    fn budget_truncates_when_dropping_is_not_enough() {
        let mut req = sample_requirement();
        req.codegen.description = "é".repeat(5_000);
        let builder = PromptBuilder::new(1_000).expect("builder");
        let prompt = builder.plan(&req, "").expect("render");
        assert!(prompt.ends_with(TRUNCATED));
        assert!(prompt.chars().count() <= 1_000 + TRUNCATED.chars().count() + 2);
    }
}

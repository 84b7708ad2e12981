//! Prompt builder for oracle requests.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::plan::REPAIR_PLAN_SCHEMA;
use crate::core::types::{FailureReport, RepairPlan};

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const TASK_TEMPLATE: &str = include_str!("prompts/task.md");
const COMMIT_TEMPLATE: &str = include_str!("prompts/commit.md");
const BRANCH_TEMPLATE: &str = include_str!("prompts/branch.md");

#[derive(Debug, Clone, Serialize)]
struct FileContext<'a> {
    path: &'a str,
    content: &'a str,
}

fn file_contexts(files: &BTreeMap<String, String>) -> Vec<FileContext<'_>> {
    files
        .iter()
        .map(|(path, content)| FileContext {
            path,
            content: content.trim_end(),
        })
        .collect()
}

/// Inputs for one repair task request.
#[derive(Debug, Clone, Copy)]
pub struct TaskPrompt<'a> {
    pub plan: &'a RepairPlan,
    /// Zero-based position of the task in the plan.
    pub index: usize,
    /// Project files, only attached to the first task of a plan.
    pub files: Option<&'a BTreeMap<String, String>>,
}

/// Template engine wrapper around minijinja.
pub struct PromptPack {
    env: Environment<'static>,
}

impl PromptPack {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("plan", PLAN_TEMPLATE)
            .context("plan template")?;
        env.add_template("task", TASK_TEMPLATE)
            .context("task template")?;
        env.add_template("commit", COMMIT_TEMPLATE)
            .context("commit template")?;
        env.add_template("branch", BRANCH_TEMPLATE)
            .context("branch template")?;
        Ok(Self { env })
    }

    pub fn render_plan(
        &self,
        report: &FailureReport,
        files: &BTreeMap<String, String>,
    ) -> Result<String> {
        let failure = report.render();
        let template = self.env.get_template("plan")?;
        let rendered = template.render(context! {
            failure_kind => report.label(),
            failure => failure.trim(),
            files => file_contexts(files),
            schema => REPAIR_PLAN_SCHEMA.trim(),
        })?;
        Ok(rendered)
    }

    pub fn render_task(&self, input: TaskPrompt<'_>) -> Result<String> {
        let task = input
            .plan
            .plan
            .get(input.index)
            .with_context(|| format!("plan has no task {}", input.index + 1))?;
        let template = self.env.get_template("task")?;
        let rendered = template.render(context! {
            plan => &input.plan.plan,
            index => input.index + 1,
            total => input.plan.plan.len(),
            todo => task.todo.trim(),
            goal => task.goal.trim(),
            files => input.files.map(file_contexts),
        })?;
        Ok(rendered)
    }

    pub fn render_commit_message(&self, diff: &str) -> Result<String> {
        let template = self.env.get_template("commit")?;
        Ok(template.render(context! { diff => diff.trim_end() })?)
    }

    pub fn render_branch_name(&self, diff: &str) -> Result<String> {
        let template = self.env.get_template("branch")?;
        Ok(template.render(context! { diff => diff.trim_end() })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RepairTask;

    fn plan() -> RepairPlan {
        RepairPlan {
            plan: vec![
                RepairTask {
                    todo: "Close the bracket in app.js".to_string(),
                    goal: "app.js parses".to_string(),
                },
                RepairTask {
                    todo: "Listen on port 3000".to_string(),
                    goal: "server answers".to_string(),
                },
            ],
        }
    }

    #[test]
    fn plan_prompt_carries_failure_files_and_schema() {
        let pack = PromptPack::new().expect("templates");
        let report = FailureReport::ProcessExit {
            stdout: String::new(),
            stderr: "SyntaxError: Unexpected token".to_string(),
        };
        let mut files = BTreeMap::new();
        files.insert("app.js".to_string(), "console.log(\n".to_string());

        let prompt = pack.render_plan(&report, &files).expect("render");
        assert!(prompt.contains("SyntaxError: Unexpected token"));
        assert!(prompt.contains("process exit failure"));
        assert!(prompt.contains("app.js\n```\nconsole.log("));
        assert!(prompt.contains("\"plan\""));
    }

    #[test]
    fn first_task_prompt_includes_files() {
        let pack = PromptPack::new().expect("templates");
        let plan = plan();
        let mut files = BTreeMap::new();
        files.insert("app.js".to_string(), "x".to_string());

        let prompt = pack
            .render_task(TaskPrompt {
                plan: &plan,
                index: 0,
                files: Some(&files),
            })
            .expect("render");
        assert!(prompt.contains("Current project files"));
        assert!(prompt.contains("(1 of 2)"));
        assert!(prompt.contains("TODO: Close the bracket in app.js"));
        assert!(!prompt.contains("already done"));
    }

    #[test]
    fn later_task_prompt_refers_to_earlier_tasks() {
        let pack = PromptPack::new().expect("templates");
        let plan = plan();
        let prompt = pack
            .render_task(TaskPrompt {
                plan: &plan,
                index: 1,
                files: None,
            })
            .expect("render");
        assert!(prompt.contains("Tasks 1 to 1 are already done"));
        assert!(prompt.contains("(2 of 2)"));
        assert!(!prompt.contains("Current project files"));
    }

    #[test]
    fn task_index_out_of_range_is_an_error() {
        let pack = PromptPack::new().expect("templates");
        let plan = plan();
        let err = pack
            .render_task(TaskPrompt {
                plan: &plan,
                index: 5,
                files: None,
            })
            .expect_err("no such task");
        assert!(err.to_string().contains("no task 6"));
    }

    #[test]
    fn commit_prompt_embeds_diff() {
        let pack = PromptPack::new().expect("templates");
        let prompt = pack.render_commit_message("+fixed\n").expect("render");
        assert!(prompt.contains("```diff\n+fixed\n```"));
    }
}

//! Repair negotiation: failure report -> plan -> per-task patches.
//!
//! One call to [`RepairNegotiator::repair`] is one repair cycle. The plan
//! request must decode; everything after it is best effort, so a broken task
//! never stops the remaining tasks of the same plan.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::patch::{PatchWarning, extract_patches};
use crate::core::plan::decode_plan;
use crate::core::types::{FailureReport, RepairPlan};
use crate::io::console::Operator;
use crate::io::oracle::{Oracle, exchange};
use crate::io::prompt::{PromptPack, TaskPrompt};
use crate::io::store::{FileStore, apply_patch};
use crate::io::transcript::{ExchangeKind, Transcript};

/// What one repair cycle did to the project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairSummary {
    pub plan: Option<RepairPlan>,
    /// Paths written, in application order (repeats kept).
    pub patches_applied: Vec<String>,
    pub warnings: Vec<PatchWarning>,
    /// Tasks whose exchange or writes failed, as operator-facing text.
    pub task_failures: Vec<String>,
}

pub struct RepairNegotiator<'a, O: ?Sized, S: ?Sized, P: ?Sized> {
    oracle: &'a O,
    store: &'a S,
    operator: &'a P,
    prompts: &'a PromptPack,
}

impl<'a, O, S, P> RepairNegotiator<'a, O, S, P>
where
    O: Oracle + ?Sized,
    S: FileStore + ?Sized,
    P: Operator + ?Sized,
{
    pub fn new(oracle: &'a O, store: &'a S, operator: &'a P, prompts: &'a PromptPack) -> Self {
        Self {
            oracle,
            store,
            operator,
            prompts,
        }
    }

    /// Run one cycle. Errors only when no usable plan was obtained.
    #[instrument(skip_all, fields(failure = report.label()))]
    pub fn repair(
        &self,
        report: &FailureReport,
        transcript: &mut Transcript,
    ) -> Result<RepairSummary> {
        let files = self.store.list_files()?;
        let prompt = self.prompts.render_plan(report, &files)?;
        let response = exchange(self.oracle, transcript, ExchangeKind::Plan, prompt)?;
        let plan = decode_plan(&response)?;
        info!(tasks = plan.plan.len(), "repair plan accepted");

        let mut summary = RepairSummary::default();
        for (index, task) in plan.plan.iter().enumerate() {
            self.operator.show(
                &format!("Repair task {} of {}", index + 1, plan.plan.len()),
                &format!("TODO {}: {}\nGOAL: {}", index + 1, task.todo, task.goal),
            );
            let prompt = self.prompts.render_task(TaskPrompt {
                plan: &plan,
                index,
                files: (index == 0).then_some(&files),
            })?;
            let response = match exchange(self.oracle, transcript, ExchangeKind::Task, prompt) {
                Ok(response) => response,
                Err(err) => {
                    let message = format!("task {} failed: {err:#}", index + 1);
                    warn!(task = index + 1, err = %err, "repair task exchange failed");
                    self.operator.warn(&message);
                    summary.task_failures.push(message);
                    continue;
                }
            };
            self.apply_response(index, &response, &mut summary);
        }
        summary.plan = Some(plan);
        Ok(summary)
    }

    fn apply_response(&self, index: usize, response: &str, summary: &mut RepairSummary) {
        let set = extract_patches(response);
        for warning in set.warnings {
            self.operator.warn(&format!(
                "task {}: skipped code block at line {}: {}",
                index + 1,
                warning.line,
                warning.reason
            ));
            summary.warnings.push(warning);
        }
        if set.patches.is_empty() {
            self.operator
                .warn(&format!("task {} produced no file changes", index + 1));
        }
        for patch in set.patches {
            match apply_patch(self.store, &patch) {
                Ok(()) => {
                    info!(path = %patch.path, "patched file");
                    summary.patches_applied.push(patch.path);
                }
                Err(err) => {
                    let message = format!("task {}: {err:#}", index + 1);
                    warn!(path = %patch.path, err = %err, "patch write failed");
                    self.operator.warn(&message);
                    summary.task_failures.push(message);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::io::transcript::Role;
    use crate::test_support::{MemoryStore, ScriptedOperator, ScriptedOracle};

    fn syntax_failure() -> FailureReport {
        FailureReport::ProcessExit {
            stdout: String::new(),
            stderr: "SyntaxError: line 4".to_string(),
        }
    }

    #[test]
    fn single_task_plan_runs_one_task_and_one_patch() {
        let oracle = ScriptedOracle::from_texts([
            r#"{"plan": [{"todo": "fix syntax", "goal": "compile"}]}"#,
            "```js:app.js\nconsole.log('ok');\n```",
        ]);
        let store = MemoryStore::with_files([("app.js", "console.log(")]);
        let operator = ScriptedOperator::default();
        let prompts = PromptPack::new().expect("templates");
        let mut transcript = Transcript::new(None);

        let summary = RepairNegotiator::new(&oracle, &store, &operator, &prompts)
            .repair(&syntax_failure(), &mut transcript)
            .expect("repair");

        let sent = oracle.prompts();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("SyntaxError: line 4"));
        assert!(sent[1].contains("TODO: fix syntax"));
        assert_eq!(summary.patches_applied, vec!["app.js".to_string()]);
        assert_eq!(store.writes(), vec!["app.js".to_string()]);
        assert_eq!(store.get("app.js").as_deref(), Some("console.log('ok');\n"));
        assert_eq!(transcript.len(), 4);
        assert_eq!(transcript.entries()[3].role, Role::Response);
    }

    #[test]
    fn only_first_task_carries_project_files() {
        let oracle = ScriptedOracle::from_texts([
            r#"{"plan": [{"todo": "a", "goal": "ga"}, {"todo": "b", "goal": "gb"}]}"#,
            "```txt:one.txt\n1\n```",
            "```txt:two.txt\n2\n```",
        ]);
        let store = MemoryStore::with_files([("secret.txt", "file body")]);
        let operator = ScriptedOperator::default();
        let prompts = PromptPack::new().expect("templates");
        let mut transcript = Transcript::new(None);

        RepairNegotiator::new(&oracle, &store, &operator, &prompts)
            .repair(&syntax_failure(), &mut transcript)
            .expect("repair");

        let sent = oracle.prompts();
        assert!(sent[1].contains("file body"));
        assert!(!sent[2].contains("file body"));
        assert_eq!(store.writes(), vec!["one.txt".to_string(), "two.txt".to_string()]);
        assert_eq!(operator.shown().len(), 2);
    }

    #[test]
    fn unparseable_plan_fails_the_cycle_without_tasks() {
        let oracle = ScriptedOracle::from_texts(["I think you should fix the bracket."]);
        let store = MemoryStore::default();
        let operator = ScriptedOperator::default();
        let prompts = PromptPack::new().expect("templates");
        let mut transcript = Transcript::new(None);

        let err = RepairNegotiator::new(&oracle, &store, &operator, &prompts)
            .repair(&syntax_failure(), &mut transcript)
            .expect_err("plan must parse");

        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::PlanParse { .. })
        ));
        assert_eq!(oracle.prompts().len(), 1);
        assert!(store.writes().is_empty());
    }

    #[test]
    fn failed_task_does_not_stop_later_tasks() {
        let oracle = ScriptedOracle::new(vec![
            Ok(r#"{"plan": [{"todo": "a", "goal": "ga"}, {"todo": "b", "goal": "gb"}]}"#.to_string()),
            Err("oracle timed out".to_string()),
            Ok("```txt:b.txt\nb\n```".to_string()),
        ]);
        let store = MemoryStore::default();
        let operator = ScriptedOperator::default();
        let prompts = PromptPack::new().expect("templates");
        let mut transcript = Transcript::new(None);

        let summary = RepairNegotiator::new(&oracle, &store, &operator, &prompts)
            .repair(&syntax_failure(), &mut transcript)
            .expect("repair");

        assert_eq!(summary.task_failures.len(), 1);
        assert!(summary.task_failures[0].contains("oracle timed out"));
        assert_eq!(summary.patches_applied, vec!["b.txt".to_string()]);
    }

    #[test]
    fn unlabelled_blocks_are_warned_and_skipped() {
        let oracle = ScriptedOracle::from_texts([
            r#"{"plan": [{"todo": "a", "goal": "ga"}]}"#,
            "Here you go:\n```\nno label\n```\n\n```txt:ok.txt\nok\n```",
        ]);
        let store = MemoryStore::default();
        let operator = ScriptedOperator::default();
        let prompts = PromptPack::new().expect("templates");
        let mut transcript = Transcript::new(None);

        let summary = RepairNegotiator::new(&oracle, &store, &operator, &prompts)
            .repair(&syntax_failure(), &mut transcript)
            .expect("repair");

        assert_eq!(summary.warnings.len(), 1);
        assert_eq!(summary.patches_applied, vec!["ok.txt".to_string()]);
        assert!(operator.warnings()[0].contains("skipped code block"));
    }

    #[test]
    fn write_failure_is_reported_and_other_patches_apply() {
        let oracle = ScriptedOracle::from_texts([
            r#"{"plan": [{"todo": "a", "goal": "ga"}]}"#,
            "```txt:locked.txt\nx\n```\n```txt:free.txt\ny\n```",
        ]);
        let store = MemoryStore::default().failing_on("locked.txt");
        let operator = ScriptedOperator::default();
        let prompts = PromptPack::new().expect("templates");
        let mut transcript = Transcript::new(None);

        let summary = RepairNegotiator::new(&oracle, &store, &operator, &prompts)
            .repair(&syntax_failure(), &mut transcript)
            .expect("repair");

        assert_eq!(summary.patches_applied, vec!["free.txt".to_string()]);
        assert_eq!(summary.task_failures.len(), 1);
        assert!(summary.task_failures[0].contains("locked.txt"));
    }
}

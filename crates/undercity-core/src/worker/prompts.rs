//! Prompt assembly for each worker phase, plus the response sentinels the
//! state machine keys on.

use undercity_state::models::Task;

use super::briefing::Briefing;

/// Plan-phase refusal: the task is too large for one worker.
pub const NEEDS_DECOMPOSITION: &str = "NEEDS_DECOMPOSITION";
/// Plan-phase refusal: the objective is already satisfied on mainline.
pub const ALREADY_COMPLETE: &str = "ALREADY_COMPLETE";
/// Plan-phase refusal: the objective is incoherent or unimplementable.
pub const PLAN_REJECTED: &str = "PLAN_REJECTED";
/// Review-phase marker for an issue that must be fixed before completion.
pub const BLOCKING_PREFIX: &str = "BLOCKING:";
/// Review-phase approval marker.
pub const REVIEW_APPROVED: &str = "LGTM";

fn ticket_block(task: &Task) -> String {
    let Some(ticket) = &task.ticket else {
        return String::new();
    };
    let mut out = String::from("\n## Ticket\n");
    out.push_str(&ticket.description);
    out.push('\n');
    if !ticket.acceptance_criteria.is_empty() {
        out.push_str("Acceptance criteria:\n");
        for criterion in &ticket.acceptance_criteria {
            out.push_str(&format!("- {criterion}\n"));
        }
    }
    if let Some(plan) = &ticket.test_plan {
        out.push_str(&format!("Test plan: {plan}\n"));
    }
    out
}

fn handoff_block(task: &Task) -> String {
    let Some(handoff) = &task.handoff else {
        return String::new();
    };
    let mut out = String::new();
    if let Some(summary) = &handoff.prior_attempt_summary {
        out.push_str(&format!("\n## Prior attempt\n{summary}\n"));
    }
    if let Some(guidance) = &handoff.human_guidance {
        out.push_str(&format!(
            "\n## Operator guidance (follow this)\n{guidance}\n"
        ));
    }
    out
}

fn hints_block(hints: &[String]) -> String {
    if hints.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n## Supervisor hints\n");
    for hint in hints {
        out.push_str(&format!("- {hint}\n"));
    }
    out
}

/// Plan-only prompt: produce an implementation plan, or refuse with one
/// of the sentinels.
pub fn plan_prompt(task: &Task, briefing: &Briefing) -> String {
    format!(
        "You are planning an engineering task. Do NOT edit any files yet.\n\
         \n\
         ## Objective\n{objective}\n\
         {ticket}{handoff}\n\
         {briefing}\n\
         Respond with a short numbered implementation plan (files to touch,\n\
         changes to make, how to verify).\n\
         Special responses:\n\
         - If the task is too large for a single focused change, respond with\n\
           the single line `{needs_decomposition}` followed by one `- ` bullet\n\
           per subtask objective.\n\
         - If the objective is already satisfied by the current code, respond\n\
           with the single line `{already_complete}`.\n\
         - If the objective cannot be implemented as stated, respond with the\n\
           single line `{plan_rejected}` and one line explaining why.\n",
        objective = task.objective,
        ticket = ticket_block(task),
        handoff = handoff_block(task),
        briefing = briefing.render(),
        needs_decomposition = NEEDS_DECOMPOSITION,
        already_complete = ALREADY_COMPLETE,
        plan_rejected = PLAN_REJECTED,
    )
}

/// Execute-phase prompt: implement the plan.
pub fn execute_prompt(
    task: &Task,
    plan: &str,
    briefing: &Briefing,
    prior_failure: Option<&str>,
    hints: &[String],
) -> String {
    let failure = prior_failure
        .map(|f| format!("\n## Previous attempt failed\n{f}\nAvoid repeating it.\n"))
        .unwrap_or_default();
    format!(
        "Implement the following task in this repository. Make the edits,\n\
         keep the change minimal, and do not touch unrelated files.\n\
         \n\
         ## Objective\n{objective}\n\
         {ticket}{handoff}\n\
         ## Plan\n{plan}\n\
         {briefing}{failure}{hints}",
        objective = task.objective,
        ticket = ticket_block(task),
        handoff = handoff_block(task),
        plan = plan,
        briefing = briefing.render(),
        failure = failure,
        hints = hints_block(hints),
    )
}

/// Fix-phase prompt: verification failed, repair it.
pub fn fix_prompt(task: &Task, failure_output: &str, hints: &[String]) -> String {
    format!(
        "Verification failed for your changes to this task:\n\
         \n\
         ## Objective\n{objective}\n\
         \n\
         ## Failing output\n{failure}\n\
         {hints}\n\
         Fix the failures. Keep the existing approach unless the failure\n\
         shows it is wrong.",
        objective = task.objective,
        failure = failure_output,
        hints = hints_block(hints),
    )
}

/// Review-phase prompt: critique the implemented change.
pub fn review_prompt(task: &Task, plan: &str) -> String {
    format!(
        "Review the working tree's current changes for this task with fresh\n\
         eyes. Do not edit anything.\n\
         \n\
         ## Objective\n{objective}\n\
         \n\
         ## Plan that was implemented\n{plan}\n\
         \n\
         If the change has a defect that must be fixed before merging,\n\
         respond with one line per issue starting with `{blocking}`.\n\
         Otherwise respond with the single line `{approved}`.",
        objective = task.objective,
        plan = plan,
        blocking = BLOCKING_PREFIX,
        approved = REVIEW_APPROVED,
    )
}

/// Merge-pipeline prompt: post-rebase verification broke, repair in place.
pub fn merge_fix_prompt(branch: &str, failure_output: &str) -> String {
    format!(
        "The branch `{branch}` was rebased onto the latest mainline and its\n\
         verification now fails. Repair the working tree so verification\n\
         passes again, changing as little as possible, then stage and commit\n\
         the fix with message \"post-rebase fix\".\n\
         \n\
         ## Failing output\n{failure_output}\n"
    )
}

/// Meta-task prompt: analyze the board, emit recommendations as JSON.
pub fn meta_prompt(meta_type: &str, objective: &str, board_json: &str) -> String {
    format!(
        "You are a planning assistant operating on a task board. Mode:\n\
         `{meta_type}`.\n\
         \n\
         ## Instruction\n{objective}\n\
         \n\
         ## Current board (JSON)\n{board_json}\n\
         \n\
         Respond with ONLY a JSON array of recommendation objects:\n\
         {{\"action\": \"add\"|\"remove\"|\"prioritize\"|\"fix_status\"|\"merge\"|\"review\",\n\
          \"task_id\": \"<uuid, omit for add>\", \"objective\": \"<for add>\",\n\
          \"priority\": <int, for add/prioritize>, \"status\": \"<for fix_status>\",\n\
          \"reason\": \"<short>\", \"confidence\": <0.0-1.0>}}\n\
         Do not modify anything yourself.",
    )
}

/// Parse subtask objectives out of a `NEEDS_DECOMPOSITION` response:
/// every `- ` bullet after the sentinel line.
pub fn parse_decomposition(text: &str) -> Vec<String> {
    let mut seen_sentinel = false;
    let mut out = Vec::new();
    for line in text.lines() {
        if line.contains(NEEDS_DECOMPOSITION) {
            seen_sentinel = true;
            continue;
        }
        if !seen_sentinel {
            continue;
        }
        if let Some(rest) = line.trim_start().strip_prefix("- ") {
            let objective = rest.trim();
            if !objective.is_empty() {
                out.push(objective.to_owned());
            }
        }
    }
    out
}

/// Extract blocking issues from a review response.
pub fn parse_blocking_issues(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.trim_start().strip_prefix(BLOCKING_PREFIX))
        .map(|issue| issue.trim().to_owned())
        .filter(|issue| !issue.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use undercity_state::models::Ticket;

    #[test]
    fn plan_prompt_carries_objective_and_sentinels() {
        let task = Task::new("add pagination to the list endpoint", 1);
        let briefing = Briefing::default();
        let prompt = plan_prompt(&task, &briefing);
        assert!(prompt.contains("add pagination"));
        assert!(prompt.contains(NEEDS_DECOMPOSITION));
        assert!(prompt.contains(ALREADY_COMPLETE));
        assert!(prompt.contains(PLAN_REJECTED));
    }

    #[test]
    fn ticket_and_guidance_surface_in_prompts() {
        let mut task = Task::new("x", 1);
        task.ticket = Some(Ticket {
            description: "the endpoint must page by cursor".into(),
            acceptance_criteria: vec!["returns next_cursor".into()],
            test_plan: None,
            rationale: None,
        });
        task.handoff = Some(undercity_state::models::HandoffContext {
            prior_attempt_summary: None,
            human_guidance: Some("use keyset pagination".into()),
            retry: true,
        });
        let prompt = execute_prompt(&task, "1. do it", &Briefing::default(), None, &[]);
        assert!(prompt.contains("page by cursor"));
        assert!(prompt.contains("returns next_cursor"));
        assert!(prompt.contains("use keyset pagination"));
    }

    #[test]
    fn decomposition_parsing() {
        let text = "I cannot do this in one change.\nNEEDS_DECOMPOSITION\n- add the schema\n- add the endpoint\n\n- wire the ui\n";
        assert_eq!(
            parse_decomposition(text),
            vec!["add the schema", "add the endpoint", "wire the ui"]
        );
        assert!(parse_decomposition("all good, no sentinel").is_empty());
    }

    #[test]
    fn blocking_issue_parsing() {
        let text = "Looked at it.\nBLOCKING: the lock is held across await\nBLOCKING: missing error path\n";
        assert_eq!(parse_blocking_issues(text).len(), 2);
        assert!(parse_blocking_issues("LGTM").is_empty());
    }
}

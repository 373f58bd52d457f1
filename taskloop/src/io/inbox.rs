//! Markdown inbox intake.
//!
//! An inbox file holds task blocks, each a `---` fenced header followed by a
//! free-form body:
//!
//! ```text
//! ---
//! task_id: T1
//! priority: high
//! context: |
//!   Repository lives in ~/src/app.
//! ---
//! # Fix the flaky login test
//!
//! The login test fails roughly once in ten runs.
//!
//! ## Success criteria
//! - test passes 50 times in a row
//! ```

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;

use crate::core::types::{Origin, Priority, TaskId};

/// One parsed task block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskIntake {
    pub task_id: TaskId,
    pub priority: Priority,
    pub origin: Origin,
    pub parent_task: Option<TaskId>,
    pub context: String,
    pub title: String,
    pub body: String,
    pub success_criteria: Vec<String>,
}

pub fn read_inbox(path: &Path) -> Result<Vec<TaskIntake>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read inbox {}", path.display()))?;
    parse_inbox(&contents).with_context(|| format!("parse inbox {}", path.display()))
}

pub fn parse_inbox(contents: &str) -> Result<Vec<TaskIntake>> {
    let lines: Vec<&str> = contents.lines().collect();
    let starts: Vec<usize> = (0..lines.len())
        .filter(|&idx| is_block_start(&lines, idx))
        .collect();

    let mut intakes = Vec::new();
    for (n, &start) in starts.iter().enumerate() {
        let end = starts.get(n + 1).copied().unwrap_or(lines.len());
        let block = &lines[start + 1..end];
        let header_len = block
            .iter()
            .position(|line| line.trim() == "---")
            .ok_or_else(|| anyhow!("task block {} has no closing '---'", n + 1))?;
        let intake = parse_block(&block[..header_len], &block[header_len + 1..])
            .with_context(|| format!("task block {}", n + 1))?;
        intakes.push(intake);
    }
    Ok(intakes)
}

fn is_block_start(lines: &[&str], idx: usize) -> bool {
    lines[idx].trim() == "---"
        && lines
            .get(idx + 1)
            .is_some_and(|next| next.trim_start().starts_with("task_id:"))
}

fn parse_block(header: &[&str], body: &[&str]) -> Result<TaskIntake> {
    static FIELD_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^(\w+):\s*(.*?)\s*$").unwrap());

    let mut task_id = None;
    let mut priority = None;
    let mut origin = Origin::User;
    let mut parent_task = None;
    let mut context_lines = Vec::new();
    let mut in_context = false;

    for &line in header {
        if in_context && (line.starts_with("  ") || line.trim().is_empty()) {
            context_lines.push(line.strip_prefix("  ").unwrap_or(line.trim()));
            continue;
        }
        in_context = false;
        if line.trim().is_empty() {
            continue;
        }
        let Some(caps) = FIELD_RE.captures(line) else {
            return Err(anyhow!("unrecognized header line '{line}'"));
        };
        let raw = caps.get(2).map_or("", |m| m.as_str());
        let value = raw.to_string();
        match &caps[1] {
            "task_id" => task_id = Some(value),
            "priority" => {
                priority = Some(
                    Priority::parse(&value).ok_or_else(|| anyhow!("unknown priority '{value}'"))?,
                );
            }
            "origin" => origin = parse_origin(&value)?,
            "parent_task" => parent_task = Some(value),
            "context" => {
                let inline = raw.trim_start_matches('|').trim();
                if !inline.is_empty() {
                    context_lines.push(inline);
                }
                in_context = true;
            }
            _ => {}
        }
    }

    let task_id = task_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| anyhow!("missing task_id"))?;
    let priority = priority.ok_or_else(|| anyhow!("missing priority for '{task_id}'"))?;
    let (title, body, success_criteria) = split_body(body);

    Ok(TaskIntake {
        title: if title.is_empty() { task_id.clone() } else { title },
        task_id,
        priority,
        origin,
        parent_task,
        context: context_lines.join("\n").trim().to_string(),
        body,
        success_criteria,
    })
}

fn parse_origin(raw: &str) -> Result<Origin> {
    Origin::ALL
        .into_iter()
        .find(|origin| origin.as_str().eq_ignore_ascii_case(raw.trim()))
        .ok_or_else(|| anyhow!("unknown origin '{raw}'"))
}

/// Split a block body into title, description and success criteria.
fn split_body(body: &[&str]) -> (String, String, Vec<String>) {
    static CRITERIA_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)^##\s*success\s+criteria\s*$").unwrap());
    static BULLET_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*[-*]\s+(.+)$").unwrap());

    let criteria_at = body.iter().position(|line| CRITERIA_RE.is_match(line.trim()));
    let (description, criteria) = match criteria_at {
        Some(idx) => (&body[..idx], &body[idx + 1..]),
        None => (body, &body[body.len()..]),
    };

    let success_criteria = criteria
        .iter()
        .map_while(|line| {
            if line.trim().is_empty() {
                return Some(None);
            }
            BULLET_RE
                .captures(line)
                .map(|caps| Some(caps[1].trim().to_string()))
        })
        .flatten()
        .collect();

    let mut lines: Vec<&str> = description.to_vec();
    while lines.last().is_some_and(|line| line.trim().is_empty() || line.trim() == "---") {
        lines.pop();
    }
    let title_at = lines.iter().position(|line| !line.trim().is_empty());
    let title = title_at
        .map(|idx| lines[idx].trim().trim_start_matches('#').trim().to_string())
        .unwrap_or_default();
    let rest = title_at.map_or(&lines[..], |idx| &lines[idx + 1..]);
    (title, rest.join("\n").trim().to_string(), success_criteria)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INBOX: &str = "\
---
task_id: T1
priority: high
context: |
  Repository lives in ~/src/app.
  Use the staging database.
---
# Fix the flaky login test

The login test fails roughly once in ten runs.

## Success criteria
- test passes 50 times in a row
* no retries added

---
task_id: T2
priority: LOW
parent_task: T1
---
Write a short note about the fix.
";

    #[test]
    fn parses_header_body_and_criteria() {
        let intakes = parse_inbox(INBOX).expect("parse");
        assert_eq!(intakes.len(), 2);

        let first = &intakes[0];
        assert_eq!(first.task_id, "T1");
        assert_eq!(first.priority, Priority::High);
        assert_eq!(first.origin, Origin::User);
        assert_eq!(
            first.context,
            "Repository lives in ~/src/app.\nUse the staging database."
        );
        assert_eq!(first.title, "Fix the flaky login test");
        assert_eq!(first.body, "The login test fails roughly once in ten runs.");
        assert_eq!(
            first.success_criteria,
            vec!["test passes 50 times in a row", "no retries added"]
        );

        let second = &intakes[1];
        assert_eq!(second.priority, Priority::Low);
        assert_eq!(second.parent_task.as_deref(), Some("T1"));
        assert_eq!(second.title, "Write a short note about the fix.");
        assert!(second.success_criteria.is_empty());
    }

    #[test]
    fn unknown_priority_names_the_block() {
        let err = parse_inbox("---\ntask_id: T9\npriority: urgent\n---\nbody\n").unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("task block 1"), "{msg}");
        assert!(msg.contains("urgent"), "{msg}");
    }

    #[test]
    fn text_without_blocks_yields_nothing() {
        assert!(parse_inbox("# Inbox\n\nnothing yet\n").expect("parse").is_empty());
    }
}

//! Role prompt documents.
//!
//! The built-in role documents are compiled into the binary; a file
//! named `<bee>.md` in the hive's `roles/` directory overrides the
//! embedded version. The orchestrator treats the documents as opaque
//! text blobs.

use std::path::Path;

use crate::models::BeeName;
use crate::{Error, Result};

const QUEEN_ROLE: &str = include_str!("embedded/queen.md");
const DEVELOPER_ROLE: &str = include_str!("embedded/developer.md");
const QA_ROLE: &str = include_str!("embedded/qa.md");
const ANALYST_ROLE: &str = include_str!("embedded/analyst.md");

/// The compiled-in role document for a real bee.
pub fn embedded_role(bee: BeeName) -> Result<&'static str> {
    match bee {
        BeeName::Queen => Ok(QUEEN_ROLE),
        BeeName::Developer => Ok(DEVELOPER_ROLE),
        BeeName::Qa => Ok(QA_ROLE),
        BeeName::Analyst => Ok(ANALYST_ROLE),
        other => Err(Error::InvalidName(format!("{other} has no role document"))),
    }
}

/// The effective role document: the override from `roles_dir` when
/// present, the embedded default otherwise.
pub fn role_document(bee: BeeName, roles_dir: &Path) -> Result<String> {
    let override_path = roles_dir.join(format!("{bee}.md"));
    if override_path.exists() {
        return Ok(std::fs::read_to_string(&override_path)?);
    }
    Ok(embedded_role(bee)?.to_string())
}

/// Short reminder text for the periodic `role_injection` refresh,
/// citing the bee's identity and current task.
pub fn reminder_text(bee: BeeName, current_task_id: Option<&str>) -> String {
    let task_line = match current_task_id {
        Some(id) => format!("Your current task: {id}."),
        None => "You have no task in progress; check your queue.".to_string(),
    };
    format!(
        "Reminder: you are the {bee} bee of this hive. {task_line} \
         All communication goes through `hive send`, and keep sending \
         `hive heartbeat {bee}`."
    )
}

// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified-diff lint applied before a patch reaches `git apply`.

use osp_error::{ErrorCode, ToolError, ToolResult};
use std::path::{Component, Path};

/// Reject a patch whose headers reference a path outside the repo root.
///
/// Checks `--- a/...`, `+++ b/...`, and `diff --git` header lines for
/// absolute paths or `..` components; `/dev/null` (file add/delete) is
/// allowed.
///
/// # Errors
///
/// `ESCAPES_REPO_ROOT` naming the offending path.
pub fn lint_patch(patch: &str) -> ToolResult<()> {
    for line in patch.lines() {
        if let Some(rest) = line.strip_prefix("--- ").or_else(|| line.strip_prefix("+++ ")) {
            check_header_path(rest)?;
        } else if let Some(rest) = line.strip_prefix("diff --git ") {
            for part in rest.split_whitespace() {
                check_header_path(part)?;
            }
        }
    }
    Ok(())
}

fn check_header_path(raw: &str) -> ToolResult<()> {
    let raw = raw.trim();
    if raw == "/dev/null" {
        return Ok(());
    }
    // Strip the conventional a/ b/ prefixes.
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    let path = Path::new(stripped);
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir));
    if escapes {
        return Err(ToolError::new(
            ErrorCode::EscapesRepoRoot,
            format!("patch references path outside the repo root: '{raw}'"),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! osp-paths
#![deny(unsafe_code)]
//!
//! All persistent files live under a single base directory
//! (`MCP_PROFILES_DIR`, else the XDG state home). Files are never written in
//! place: write to a tmp sibling, fsync, rename. Mode is 0600 on unix.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Environment variable overriding the base state directory.
pub const ENV_BASE_DIR: &str = "MCP_PROFILES_DIR";

/// Resolved locations of every persistent file the control plane owns.
#[derive(Debug, Clone)]
pub struct StatePaths {
    /// Base directory all defaults hang off.
    pub base_dir: PathBuf,
    /// Encrypted-profiles store (`profiles.json`).
    pub profiles: PathBuf,
    /// Symmetric key file (`.mcp_profiles.key`).
    pub profile_key: PathBuf,
    /// Persistent key/value scope (`state.json`).
    pub state: PathBuf,
    /// Project registry (`projects.json`).
    pub projects: PathBuf,
    /// Stored runbook definitions (`runbooks.json`).
    pub runbooks: PathBuf,
    /// Capability registry (`capabilities.json`).
    pub capabilities: PathBuf,
    /// Context cache (`context.json`).
    pub context: PathBuf,
    /// Tool aliases (`aliases.json`).
    pub aliases: PathBuf,
    /// Argument presets (`presets.json`).
    pub presets: PathBuf,
    /// Append-only audit log (`audit.jsonl`).
    pub audit: PathBuf,
    /// Background-job snapshots (`jobs.json`).
    pub jobs: PathBuf,
    /// Scratch cache directory.
    pub cache_dir: PathBuf,
    /// Evidence bundle directory.
    pub evidence_dir: PathBuf,
}

impl StatePaths {
    /// Resolve all paths from the environment.
    ///
    /// `MCP_PROFILES_DIR` wins; otherwise `$XDG_STATE_HOME/opsplane`, falling
    /// back to `~/.local/state/opsplane`. Individual `MCP_*_PATH` variables
    /// override single files.
    pub fn from_env() -> Self {
        let base_dir = std::env::var_os(ENV_BASE_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(default_base_dir);
        Self::rooted_at(base_dir)
    }

    /// Resolve all paths under an explicit base directory, still honouring
    /// per-file overrides.
    pub fn rooted_at(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let file = |env: &str, name: &str| -> PathBuf {
            std::env::var_os(env)
                .map(PathBuf::from)
                .unwrap_or_else(|| base_dir.join(name))
        };
        Self {
            profiles: base_dir.join("profiles.json"),
            profile_key: file("MCP_PROFILE_KEY_PATH", ".mcp_profiles.key"),
            state: file("MCP_STATE_PATH", "state.json"),
            projects: file("MCP_PROJECTS_PATH", "projects.json"),
            runbooks: file("MCP_RUNBOOKS_PATH", "runbooks.json"),
            capabilities: file("MCP_CAPABILITIES_PATH", "capabilities.json"),
            context: file("MCP_CONTEXT_PATH", "context.json"),
            aliases: file("MCP_ALIASES_PATH", "aliases.json"),
            presets: file("MCP_PRESETS_PATH", "presets.json"),
            audit: file("MCP_AUDIT_PATH", "audit.jsonl"),
            jobs: file("MCP_JOBS_PATH", "jobs.json"),
            cache_dir: file("MCP_CACHE_DIR", "cache"),
            evidence_dir: file("MCP_EVIDENCE_DIR", "evidence"),
            base_dir,
        }
    }

    /// Create the base, cache, and evidence directories if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if any directory cannot be created.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.base_dir, &self.cache_dir, &self.evidence_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("create state dir {}", dir.display()))?;
        }
        Ok(())
    }
}

fn default_base_dir() -> PathBuf {
    if let Some(state_home) = std::env::var_os("XDG_STATE_HOME") {
        return PathBuf::from(state_home).join("opsplane");
    }
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".local").join("state").join("opsplane")
}

// ---------------------------------------------------------------------------
// Atomic file operations
// ---------------------------------------------------------------------------

/// Write `bytes` to `path` atomically: tmp sibling, fsync, rename.
///
/// The file ends up with mode 0600 on unix. Parent directories are created
/// as needed.
///
/// # Errors
///
/// Returns an error if the tmp file cannot be created, written, synced, or
/// renamed into place.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent).with_context(|| format!("create dir {}", parent.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent)
        .with_context(|| format!("create tmp sibling in {}", parent.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("write tmp for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("fsync tmp for {}", path.display()))?;
    restrict_mode(tmp.path())?;
    tmp.persist(path)
        .with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

/// Append a single newline-terminated line to `path`, creating the file with
/// mode 0600 if absent.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or written.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
    }
    let mut opts = OpenOptions::new();
    opts.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts
        .open(path)
        .with_context(|| format!("open {} for append", path.display()))?;
    file.write_all(line.as_bytes())?;
    if !line.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    Ok(())
}

/// Clamp `path` to owner-only permissions (0600). No-op off unix.
pub fn restrict_mode(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms)
            .with_context(|| format!("chmod 0600 {}", path.display()))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Environment budgets
// ---------------------------------------------------------------------------

/// Returns `true` for `1`, `true`, `yes`, or `on` (case-insensitive).
#[must_use]
pub fn env_truthy(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// Parse an integer env var, falling back to `default` when unset or invalid.
#[must_use]
pub fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Per-call byte and time budgets applied by the execution envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budgets {
    /// Largest value returned inline before spilling (bytes).
    pub max_inline_bytes: usize,
    /// Largest prefix captured into a spill artifact (bytes).
    pub max_capture_bytes: usize,
    /// Maximum spill artifacts produced per call.
    pub max_spills: usize,
    /// Per-call wall-clock budget (milliseconds).
    pub tool_call_timeout_ms: u64,
}

impl Budgets {
    /// Load budgets from `SF_*` env vars with the documented defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            max_inline_bytes: env_u64("SF_MAX_INLINE_BYTES", 16_384) as usize,
            max_capture_bytes: env_u64("SF_MAX_CAPTURE_BYTES", 262_144) as usize,
            max_spills: env_u64("SF_MAX_SPILLS", 20) as usize,
            tool_call_timeout_ms: env_u64("SF_TOOL_CALL_TIMEOUT_MS", 55_000),
        }
    }
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_inline_bytes: 16_384,
            max_capture_bytes: 262_144,
            max_spills: 20,
            tool_call_timeout_ms: 55_000,
        }
    }
}

/// Capture budgets for the safe command runner, overridable separately from
/// the envelope budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerBudgets {
    /// Total stdout+stderr bytes retained per stream.
    pub max_capture_bytes: usize,
    /// Bytes returned inline per stream.
    pub max_inline_bytes: usize,
}

impl RunnerBudgets {
    /// Load runner budgets, falling back to the envelope defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let base = Budgets::from_env();
        Self {
            max_capture_bytes: env_u64(
                "SF_REPO_EXEC_MAX_CAPTURE_BYTES",
                base.max_capture_bytes as u64,
            ) as usize,
            max_inline_bytes: env_u64(
                "SF_REPO_EXEC_MAX_INLINE_BYTES",
                base.max_inline_bytes as u64,
            ) as usize,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Git operations for the sandbox workspace.
//!
//! The workspace gets a brand-new repository with zero remotes and a
//! single baseline commit; everything the worker does is then visible
//! as a delta against that baseline. Tracked changes come from
//! `diff --name-only`, new files from `ls-files --others` (without
//! exclude rules, so a worker-written `.gitignore` cannot hide
//! anything from the gate).

use std::env;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};

fn git_program() -> String {
    env::var("KAVI_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}

fn run_git(repo: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new(git_program())
        .args(args)
        .current_dir(repo)
        .output()
        .context("failed to execute git; is git installed?")?;

    if !out.status.success() {
        bail!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).to_string())
}

/// Initialise a fresh repository in `repo` and commit everything as
/// the baseline. No remotes are configured.
pub fn init_baseline(repo: &Path) -> Result<()> {
    run_git(repo, &["init", "--quiet"])?;
    run_git(repo, &["add", "--all"])?;
    run_git(
        repo,
        &[
            "-c",
            "user.email=forge@kavi.local",
            "-c",
            "user.name=kavi-forge",
            "-c",
            "commit.gpgsign=false",
            "commit",
            "--quiet",
            "--allow-empty",
            "-m",
            "baseline",
        ],
    )?;
    Ok(())
}

fn name_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Tracked files changed since the baseline commit.
pub fn changed_files(repo: &Path) -> Result<Vec<String>> {
    Ok(name_lines(&run_git(repo, &["diff", "--name-only", "HEAD"])?))
}

/// Untracked files the worker created.
pub fn untracked_files(repo: &Path) -> Result<Vec<String>> {
    Ok(name_lines(&run_git(repo, &["ls-files", "--others"])?))
}

/// The union the diff gate judges: changed tracked files plus new
/// untracked files, sorted and deduplicated.
pub fn delta_since_baseline(repo: &Path) -> Result<Vec<String>> {
    let mut all = changed_files(repo)?;
    all.extend(untracked_files(repo)?);
    all.sort();
    all.dedup();
    Ok(all)
}

//! Sandboxed build driver.
//!
//! Four phases: prepare (copy the working tree into a fresh workspace,
//! stripped of secrets and non-regular files, with a git baseline),
//! invoke (the external worker, packet on stdin, wall-clock bound),
//! gate (the delta against the baseline must be inside the allowlist),
//! and copy-back (atomic, symlink- and traversal-hardened writes into
//! the canonical tree).
//!
//! The sandbox is filesystem isolation only; it does not defend
//! against a worker that actively attacks the host.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use kavi_classify::{EXIT_MARKER, GATE_VIOLATION_MARKER, TIMEOUT_MARKER};
use kavi_paths::Allowlist;
use kavi_types::BuildId;
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::ForgeConfig;
use crate::git;
use crate::process::{CommandSpec, ToolRunner};

/// Directory names never copied into the workspace.
const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".kavi",
    "__pycache__",
    ".venv",
    "venv",
    ".tox",
    ".eggs",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
    "node_modules",
    "target",
    "dist",
    "build",
];

/// A file matching any of these never leaves the canonical tree.
fn is_secret_file(name: &str) -> bool {
    name == ".env"
        || name.ends_with(".pem")
        || name.ends_with(".key")
        || name.starts_with("credentials.")
}

/// Copy-back rejections. Each of these is a hard stop, not a gate
/// failure: the gate already passed, so hitting one means the sandbox
/// contents changed out from under us or the path rules are being
/// probed.
#[derive(Debug, Error)]
pub enum CopyBackError {
    #[error("refusing to copy symlink {path}")]
    Symlink { path: String },
    #[error("unsafe path `{path}`: {reason}")]
    UnsafePath { path: String, reason: &'static str },
    #[error("copy-back I/O failure at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// How one sandboxed build ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildVerdict {
    /// Gate passed, files copied back.
    Clean,
    /// Delta escaped the allowlist, or a required file is missing.
    GateViolation { offending: Vec<String> },
    /// The worker exceeded its wall-clock bound.
    Timeout,
    /// The worker exited non-zero with a clean gate.
    WorkerError { exit_code: i32 },
}

/// Everything the engine needs from one sandbox run.
#[derive(Debug, Clone)]
pub struct SandboxRun {
    /// Captured worker output plus sandbox marker lines.
    pub log: String,
    /// The gated delta (changed tracked + new untracked files).
    pub changed_files: Vec<String>,
    pub verdict: BuildVerdict,
}

#[derive(Debug)]
struct Workspace {
    root: PathBuf,
    repo: PathBuf,
}

pub struct SandboxBuilder<'a> {
    config: &'a ForgeConfig,
    runner: &'a dyn ToolRunner,
}

impl<'a> SandboxBuilder<'a> {
    pub fn new(config: &'a ForgeConfig, runner: &'a dyn ToolRunner) -> Self {
        Self { config, runner }
    }

    fn build_area(&self) -> PathBuf {
        self.config.scratch_root().join("kavi-build")
    }

    /// Run the four phases for one build. Classifiable failures land
    /// in the verdict; only infrastructure failures return `Err`.
    pub fn run_build(&self, name: &str, build_id: BuildId, packet: &str) -> Result<SandboxRun> {
        let workspace = self.prepare(build_id)?;
        let run = self.drive(name, packet, &workspace);

        match &run {
            Ok(SandboxRun {
                verdict: BuildVerdict::Clean,
                ..
            }) => {
                fs::remove_dir_all(&workspace.root).ok();
            }
            _ => self.retain_or_remove(&workspace),
        }
        run
    }

    fn drive(&self, name: &str, packet: &str, workspace: &Workspace) -> Result<SandboxRun> {
        let out = self.runner.run(&CommandSpec {
            program: self.config.worker.program.clone(),
            args: self.config.worker.args.clone(),
            cwd: workspace.repo.clone(),
            stdin: Some(packet.to_string()),
            timeout: Some(self.config.worker.timeout),
        })?;

        let mut log = out.combined();
        if out.timed_out {
            log.push_str(&format!(
                "{}{}\n",
                TIMEOUT_MARKER,
                humantime::format_duration(self.config.worker.timeout)
            ));
            return Ok(SandboxRun {
                log,
                changed_files: Vec::new(),
                verdict: BuildVerdict::Timeout,
            });
        }
        log.push_str(&format!("{}{}\n", EXIT_MARKER, out.exit_code));

        let delta = git::delta_since_baseline(&workspace.repo)?;
        let allowlist = self.config.path_convention().allowlist(name);

        let mut offending = allowlist.violations(&delta);
        for missing in required_missing_on_disk(&allowlist, &workspace.repo) {
            offending.push(format!("missing required file {missing}"));
        }
        if !offending.is_empty() {
            for path in &offending {
                log.push_str(&format!("{GATE_VIOLATION_MARKER}{path}\n"));
            }
            return Ok(SandboxRun {
                log,
                changed_files: delta,
                verdict: BuildVerdict::GateViolation { offending },
            });
        }

        if out.exit_code != 0 {
            return Ok(SandboxRun {
                log,
                changed_files: delta,
                verdict: BuildVerdict::WorkerError {
                    exit_code: out.exit_code,
                },
            });
        }

        copy_back(
            &workspace.repo,
            self.config.project_root(),
            delta.iter().filter(|p| allowlist.permits(p)),
        )?;

        Ok(SandboxRun {
            log,
            changed_files: delta,
            verdict: BuildVerdict::Clean,
        })
    }

    /// Phase one: fresh workspace directory, stripped copy, baseline.
    fn prepare(&self, build_id: BuildId) -> Result<Workspace> {
        let root = self.build_area().join(build_id.to_string());
        if root.exists() {
            fs::remove_dir_all(&root)
                .with_context(|| format!("failed to clear stale workspace {}", root.display()))?;
        }
        let repo = root.join("repo");
        fs::create_dir_all(&repo)
            .with_context(|| format!("failed to create workspace {}", repo.display()))?;

        copy_tree(self.config.project_root(), &repo)?;
        git::init_baseline(&repo)?;
        Ok(Workspace { root, repo })
    }

    fn retain_or_remove(&self, workspace: &Workspace) {
        if !self.config.sandbox.retain_failed {
            fs::remove_dir_all(&workspace.root).ok();
            return;
        }
        self.prune_retained(workspace);
    }

    /// Keep at most `max_retained` failed workspaces, oldest out first.
    fn prune_retained(&self, keep: &Workspace) {
        let Ok(entries) = fs::read_dir(self.build_area()) else {
            return;
        };
        let mut dirs: Vec<(std::time::SystemTime, PathBuf)> = entries
            .flatten()
            .filter_map(|e| {
                let path = e.path();
                if !path.is_dir() || path == keep.root {
                    return None;
                }
                let modified = e.metadata().and_then(|m| m.modified()).ok()?;
                Some((modified, path))
            })
            .collect();

        let budget = self.config.sandbox.max_retained.saturating_sub(1);
        if dirs.len() <= budget {
            return;
        }
        dirs.sort_by_key(|(t, _)| *t);
        let excess = dirs.len() - budget;
        for (_, path) in dirs.into_iter().take(excess) {
            fs::remove_dir_all(path).ok();
        }
    }
}

fn required_missing_on_disk(allowlist: &Allowlist, repo: &Path) -> Vec<String> {
    allowlist
        .required
        .iter()
        .filter(|rel| !repo.join(rel.as_str()).is_file())
        .cloned()
        .collect()
}

/// Deterministic stripped copy of the canonical tree. Symlinks are
/// never followed or reproduced; only regular files travel, with
/// world-write bits cleared.
fn copy_tree(src_root: &Path, dst_root: &Path) -> Result<()> {
    let walker = WalkDir::new(src_root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().is_dir() && EXCLUDED_DIRS.contains(&name.as_ref()))
        });

    for entry in walker {
        let entry = entry.context("failed to walk working tree")?;
        if entry.path() == src_root {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(src_root)
            .context("walk yielded a path outside the source root")?;
        let dst = dst_root.join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&dst)
                .with_context(|| format!("failed to create dir {}", dst.display()))?;
            continue;
        }
        // Symlinks, sockets, FIFOs, devices: not regular, not copied.
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if is_secret_file(&name) {
            continue;
        }

        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create dir {}", parent.display()))?;
        }
        fs::copy(entry.path(), &dst)
            .with_context(|| format!("failed to copy {}", entry.path().display()))?;
        strip_world_write(&dst);
    }
    Ok(())
}

#[cfg(unix)]
fn strip_world_write(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(perms.mode() & !0o022);
        let _ = fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn strip_world_write(_path: &Path) {}

/// Reject relative paths that could land outside the canonical root.
fn ensure_safe_relpath(rel: &str) -> std::result::Result<(), CopyBackError> {
    if rel.bytes().any(|b| b == 0) {
        return Err(CopyBackError::UnsafePath {
            path: rel.escape_default().to_string(),
            reason: "contains a null byte",
        });
    }
    let path = Path::new(rel);
    if path.is_absolute() {
        return Err(CopyBackError::UnsafePath {
            path: rel.to_string(),
            reason: "absolute path",
        });
    }
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(CopyBackError::UnsafePath {
                    path: rel.to_string(),
                    reason: "contains `..`",
                });
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(CopyBackError::UnsafePath {
                    path: rel.to_string(),
                    reason: "not relative to the project root",
                });
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    Ok(())
}

fn io_err(path: &Path, source: std::io::Error) -> CopyBackError {
    CopyBackError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Copy one allowlisted file from the sandbox to the canonical tree.
/// The write is atomic: temporary sibling, then rename.
fn copy_back_file(repo: &Path, project_root: &Path, rel: &str) -> std::result::Result<(), CopyBackError> {
    ensure_safe_relpath(rel)?;

    let src = repo.join(rel);
    let meta = fs::symlink_metadata(&src).map_err(|e| io_err(&src, e))?;
    if meta.file_type().is_symlink() {
        return Err(CopyBackError::Symlink {
            path: rel.to_string(),
        });
    }

    let dst = project_root.join(rel);
    if !dst.starts_with(project_root) {
        return Err(CopyBackError::UnsafePath {
            path: rel.to_string(),
            reason: "resolves outside the project root",
        });
    }

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }

    let bytes = fs::read(&src).map_err(|e| io_err(&src, e))?;
    let tmp = dst.with_extension("kavi-tmp");
    fs::write(&tmp, &bytes).map_err(|e| io_err(&tmp, e))?;
    fs::rename(&tmp, &dst).map_err(|e| io_err(&dst, e))?;
    fsync_parent_dir(&dst);
    strip_world_write(&dst);
    Ok(())
}

fn copy_back<'p>(
    repo: &Path,
    project_root: &Path,
    files: impl Iterator<Item = &'p String>,
) -> Result<()> {
    for rel in files {
        // A tracked file deleted in the sandbox still shows in the
        // delta; there is nothing to carry back for it.
        if !repo.join(rel.as_str()).exists() && fs::symlink_metadata(repo.join(rel.as_str())).is_err() {
            continue;
        }
        copy_back_file(repo, project_root, rel)
            .with_context(|| format!("copy-back rejected `{rel}`"))?;
    }
    Ok(())
}

/// Best-effort fsync of the parent directory after a rename, so the
/// directory entry update is durable on crash. Errors are ignored
/// because not all platforms support opening a directory for sync.
fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{CommandOutput, StubRunner};
    use tempfile::tempdir;

    fn config_in(project: &Path, scratch: &Path) -> ForgeConfig {
        let mut config = ForgeConfig::default();
        config.roots.project = project.to_path_buf();
        config.roots.scratch = scratch.to_path_buf();
        config
    }

    fn seed_project(root: &Path) {
        fs::create_dir_all(root.join("skills")).expect("mkdir skills");
        fs::create_dir_all(root.join("tests")).expect("mkdir tests");
        fs::write(root.join("README.md"), "# project\n").expect("seed");
    }

    // ---- copy_tree ----------------------------------------------------

    #[test]
    fn copy_tree_strips_secrets_and_caches() {
        let src = tempdir().expect("src");
        let dst = tempdir().expect("dst");
        seed_project(src.path());
        fs::write(src.path().join(".env"), "TOKEN=hunter2").expect("write");
        fs::write(src.path().join("server.pem"), "cert").expect("write");
        fs::write(src.path().join("ca.key"), "key").expect("write");
        fs::write(src.path().join("credentials.json"), "{}").expect("write");
        fs::create_dir_all(src.path().join("__pycache__")).expect("mkdir");
        fs::write(src.path().join("__pycache__/x.pyc"), "c").expect("write");
        fs::create_dir_all(src.path().join(".git")).expect("mkdir");
        fs::write(src.path().join(".git/HEAD"), "ref").expect("write");

        copy_tree(src.path(), dst.path()).expect("copy");

        assert!(dst.path().join("README.md").exists());
        assert!(!dst.path().join(".env").exists());
        assert!(!dst.path().join("server.pem").exists());
        assert!(!dst.path().join("ca.key").exists());
        assert!(!dst.path().join("credentials.json").exists());
        assert!(!dst.path().join("__pycache__").exists());
        assert!(!dst.path().join(".git").exists());
    }

    #[cfg(unix)]
    #[test]
    fn copy_tree_skips_symlinks_entirely() {
        let src = tempdir().expect("src");
        let dst = tempdir().expect("dst");
        let outside = tempdir().expect("outside");
        fs::write(outside.path().join("secret.txt"), "s").expect("write");
        fs::write(src.path().join("real.txt"), "r").expect("write");
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), src.path().join("link.txt"))
            .expect("symlink");

        copy_tree(src.path(), dst.path()).expect("copy");
        assert!(dst.path().join("real.txt").exists());
        assert!(!dst.path().join("link.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn copy_tree_clears_world_write() {
        use std::os::unix::fs::PermissionsExt;
        let src = tempdir().expect("src");
        let dst = tempdir().expect("dst");
        let file = src.path().join("loose.txt");
        fs::write(&file, "w").expect("write");
        fs::set_permissions(&file, fs::Permissions::from_mode(0o666)).expect("chmod");

        copy_tree(src.path(), dst.path()).expect("copy");
        let mode = fs::metadata(dst.path().join("loose.txt")).unwrap().permissions().mode();
        assert_eq!(mode & 0o022, 0);
    }

    // ---- path safety --------------------------------------------------

    #[test]
    fn unsafe_relpaths_are_rejected() {
        for (rel, reason) in [
            ("../escape.py", "contains `..`"),
            ("skills/../../escape.py", "contains `..`"),
            ("/etc/passwd", "absolute path"),
        ] {
            let err = ensure_safe_relpath(rel).expect_err(rel);
            assert!(err.to_string().contains(reason), "{rel}: {err}");
        }
        let nul = "skills/a\0b.py";
        assert!(ensure_safe_relpath(nul).is_err());

        assert!(ensure_safe_relpath("skills/write_note.py").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn copy_back_rejects_symlink_sources() {
        let repo = tempdir().expect("repo");
        let project = tempdir().expect("project");
        fs::create_dir_all(repo.path().join("skills")).expect("mkdir");
        std::os::unix::fs::symlink("/etc/passwd", repo.path().join("skills/write_note.py"))
            .expect("symlink");

        let err = copy_back_file(repo.path(), project.path(), "skills/write_note.py")
            .expect_err("must reject");
        assert!(matches!(err, CopyBackError::Symlink { .. }));
        assert!(!project.path().join("skills/write_note.py").exists());
    }

    #[test]
    fn copy_back_writes_atomically_and_creates_parents() {
        let repo = tempdir().expect("repo");
        let project = tempdir().expect("project");
        fs::create_dir_all(repo.path().join("skills")).expect("mkdir");
        fs::write(repo.path().join("skills/write_note.py"), "class WriteNote: ...\n")
            .expect("write");

        copy_back_file(repo.path(), project.path(), "skills/write_note.py").expect("copy");
        let copied = fs::read_to_string(project.path().join("skills/write_note.py")).expect("read");
        assert_eq!(copied, "class WriteNote: ...\n");
        // No temporary sibling left behind.
        assert!(!project.path().join("skills/write_note.kavi-tmp").exists());
    }

    // ---- full runs through the stub worker ----------------------------

    fn stub_worker_writes(files: Vec<(String, String)>) -> StubWorker {
        StubWorker {
            files,
            exit_code: 0,
            timed_out: false,
        }
    }

    /// A worker double that writes files into the workspace the way
    /// the real subprocess would, then reports a scripted exit.
    struct StubWorker {
        files: Vec<(String, String)>,
        exit_code: i32,
        timed_out: bool,
    }

    impl ToolRunner for StubWorker {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            assert!(spec.stdin.as_deref().is_some_and(|p| p.contains("name:")));
            if self.timed_out {
                return Ok(CommandOutput::timeout());
            }
            for (rel, content) in &self.files {
                let path = spec.cwd.join(rel);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, content)?;
            }
            Ok(CommandOutput {
                exit_code: self.exit_code,
                stdout: "worker done\n".to_string(),
                stderr: String::new(),
                timed_out: false,
            })
        }
    }

    fn required_files() -> Vec<(String, String)> {
        vec![
            ("skills/write_note.py".to_string(), "class WriteNote: ...\n".to_string()),
            (
                "tests/test_skill_write_note.py".to_string(),
                "def test_ok(): pass\n".to_string(),
            ),
        ]
    }

    #[test]
    fn clean_build_copies_back_and_removes_workspace() {
        let project = tempdir().expect("project");
        let scratch = tempdir().expect("scratch");
        seed_project(project.path());
        let config = config_in(project.path(), scratch.path());
        let worker = stub_worker_writes(required_files());

        let run = SandboxBuilder::new(&config, &worker)
            .run_build("write_note", 1, "name: write_note\n")
            .expect("run");

        assert_eq!(run.verdict, BuildVerdict::Clean);
        assert!(run.log.contains("kavi: worker exited with status 0"));
        assert_eq!(
            run.changed_files,
            vec!["skills/write_note.py", "tests/test_skill_write_note.py"]
        );
        assert!(project.path().join("skills/write_note.py").exists());
        assert!(project.path().join("tests/test_skill_write_note.py").exists());
        assert!(!scratch.path().join("kavi-build").join("1").exists());
    }

    #[test]
    fn file_outside_allowlist_is_a_gate_violation() {
        let project = tempdir().expect("project");
        let scratch = tempdir().expect("scratch");
        seed_project(project.path());
        let config = config_in(project.path(), scratch.path());

        let mut files = required_files();
        files.push(("rogue.txt".to_string(), "oops\n".to_string()));
        let worker = stub_worker_writes(files);

        let run = SandboxBuilder::new(&config, &worker)
            .run_build("write_note", 2, "name: write_note\n")
            .expect("run");

        match &run.verdict {
            BuildVerdict::GateViolation { offending } => {
                assert_eq!(offending, &vec!["rogue.txt".to_string()]);
            }
            other => panic!("expected gate violation, got {other:?}"),
        }
        assert!(run.log.contains("kavi: gate violation: rogue.txt"));
        // Nothing copied back, not even the allowlisted files.
        assert!(!project.path().join("skills/write_note.py").exists());
        assert!(!project.path().join("rogue.txt").exists());
        // Failed workspace retained for debugging.
        assert!(scratch.path().join("kavi-build").join("2").exists());
    }

    #[test]
    fn missing_required_file_is_a_gate_violation() {
        let project = tempdir().expect("project");
        let scratch = tempdir().expect("scratch");
        seed_project(project.path());
        let config = config_in(project.path(), scratch.path());

        // Worker writes the skill but forgets the test.
        let worker = stub_worker_writes(vec![(
            "skills/write_note.py".to_string(),
            "class WriteNote: ...\n".to_string(),
        )]);

        let run = SandboxBuilder::new(&config, &worker)
            .run_build("write_note", 3, "name: write_note\n")
            .expect("run");

        match &run.verdict {
            BuildVerdict::GateViolation { offending } => {
                assert_eq!(
                    offending,
                    &vec!["missing required file tests/test_skill_write_note.py".to_string()]
                );
            }
            other => panic!("expected gate violation, got {other:?}"),
        }
    }

    #[test]
    fn worker_timeout_is_a_timeout_verdict() {
        let project = tempdir().expect("project");
        let scratch = tempdir().expect("scratch");
        seed_project(project.path());
        let config = config_in(project.path(), scratch.path());
        let worker = StubWorker {
            files: vec![],
            exit_code: 0,
            timed_out: true,
        };

        let run = SandboxBuilder::new(&config, &worker)
            .run_build("write_note", 4, "name: write_note\n")
            .expect("run");
        assert_eq!(run.verdict, BuildVerdict::Timeout);
        assert!(run.log.contains("kavi: worker timed out after"));
    }

    #[test]
    fn nonzero_exit_with_clean_gate_is_worker_error() {
        let project = tempdir().expect("project");
        let scratch = tempdir().expect("scratch");
        seed_project(project.path());
        let config = config_in(project.path(), scratch.path());

        let mut worker = stub_worker_writes(required_files());
        worker.exit_code = 1;

        let run = SandboxBuilder::new(&config, &worker)
            .run_build("write_note", 5, "name: write_note\n")
            .expect("run");
        assert_eq!(run.verdict, BuildVerdict::WorkerError { exit_code: 1 });
        assert!(run.log.contains("kavi: worker exited with status 1"));
    }

    #[test]
    fn secrets_never_reach_the_workspace() {
        let project = tempdir().expect("project");
        let scratch = tempdir().expect("scratch");
        seed_project(project.path());
        fs::write(project.path().join(".env"), "TOKEN=hunter2").expect("write");
        let config = config_in(project.path(), scratch.path());

        // Fail the gate so the workspace is retained for inspection.
        let worker = stub_worker_writes(vec![("rogue.txt".to_string(), "x".to_string())]);
        let run = SandboxBuilder::new(&config, &worker)
            .run_build("write_note", 6, "name: write_note\n")
            .expect("run");
        assert!(matches!(run.verdict, BuildVerdict::GateViolation { .. }));

        let repo = scratch.path().join("kavi-build").join("6").join("repo");
        assert!(repo.exists());
        assert!(!repo.join(".env").exists());
    }

    #[test]
    fn retention_prunes_oldest_workspaces() {
        let project = tempdir().expect("project");
        let scratch = tempdir().expect("scratch");
        seed_project(project.path());
        let mut config = config_in(project.path(), scratch.path());
        config.sandbox.max_retained = 2;

        let worker = stub_worker_writes(vec![("rogue.txt".to_string(), "x".to_string())]);
        let builder = SandboxBuilder::new(&config, &worker);
        for id in 10..14 {
            builder
                .run_build("write_note", id, "name: write_note\n")
                .expect("run");
            // Give mtimes a strict order.
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        let retained: Vec<_> = fs::read_dir(scratch.path().join("kavi-build"))
            .expect("read dir")
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(retained.len(), 2, "{retained:?}");
        assert!(retained.contains(&"13".to_string()));
    }

    #[test]
    fn retain_disabled_removes_failed_workspaces() {
        let project = tempdir().expect("project");
        let scratch = tempdir().expect("scratch");
        seed_project(project.path());
        let mut config = config_in(project.path(), scratch.path());
        config.sandbox.retain_failed = false;

        let worker = stub_worker_writes(vec![("rogue.txt".to_string(), "x".to_string())]);
        SandboxBuilder::new(&config, &worker)
            .run_build("write_note", 7, "name: write_note\n")
            .expect("run");
        assert!(!scratch.path().join("kavi-build").join("7").exists());
    }

    #[test]
    fn worker_receives_packet_on_stdin() {
        let project = tempdir().expect("project");
        let scratch = tempdir().expect("scratch");
        seed_project(project.path());
        let config = config_in(project.path(), scratch.path());

        let stub = StubRunner::new();
        stub.script(&config.worker.program, CommandOutput::failure(1, "no-op"));
        // The StubWorker asserts on stdin; StubRunner records it.
        SandboxBuilder::new(&config, &stub)
            .run_build("write_note", 8, "name: write_note\npacket body\n")
            .expect("run");

        let calls = stub.calls_to(&config.worker.program);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].stdin.as_deref(), Some("name: write_note\npacket body\n"));
        assert_eq!(calls[0].timeout, Some(config.worker.timeout));
        assert_eq!(calls[0].args, config.worker.args);
    }
}

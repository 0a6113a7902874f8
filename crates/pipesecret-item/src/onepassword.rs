//! 1Password CLI (`op`) item source.
//!
//! Items are fetched with `op item get <name> --format json`. The `op`
//! binary is resolved on every call, so installing or signing in to it
//! while the controller is running takes effect without a restart.

use crate::source::{ItemError, ItemSource};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

pub const DEFAULT_OP: &str = "op";

#[derive(Debug, Clone)]
pub struct OnePasswordCli {
    op: String,
}

impl OnePasswordCli {
    /// `op` is either a path or a program name looked up on `PATH`.
    pub fn new(op: impl Into<String>) -> Self {
        Self { op: op.into() }
    }

    /// Where `op` currently resolves to, if anywhere.
    pub fn locate(&self) -> Option<PathBuf> {
        locate(&self.op)
    }
}

impl Default for OnePasswordCli {
    fn default() -> Self {
        Self::new(DEFAULT_OP)
    }
}

impl ItemSource for OnePasswordCli {
    async fn get_item(&self, name: &str) -> Result<String, ItemError> {
        let op = self
            .locate()
            .ok_or_else(|| ItemError::Unavailable(format!("{} not found", self.op)))?;

        debug!(op = %op.display(), item = %name, "running op item get");
        let output = Command::new(&op)
            .args(["item", "get", name, "--format", "json"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ItemError::Unavailable(format!("failed to run {}: {e}", op.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_not_found(&stderr) {
                return Err(ItemError::NotFound(name.to_string()));
            }
            return Err(ItemError::Execution(format!(
                "op item get exited with {}: {stderr}",
                output.status
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|_| ItemError::Execution("op returned non-UTF8 output".to_string()))
    }
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("isn't an item") || stderr.contains("not found")
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Resolve `program` the way a shell would: as a path when it contains a
/// slash, otherwise by searching `PATH`.
pub fn locate(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_op(dir: &tempfile::TempDir, script: &str) -> PathBuf {
        let path = dir.path().join("op");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn returns_the_item_document() {
        let dir = tempfile::tempdir().unwrap();
        let op = fake_op(
            &dir,
            r#"[ "$1 $2 $4 $5" = "item get --format json" ] || exit 2
printf '{"title":"%s"}\n' "$3""#,
        );

        let source = OnePasswordCli::new(op.to_str().unwrap());
        let doc = source.get_item("github").await.unwrap();
        assert_eq!(doc, "{\"title\":\"github\"}\n");
    }

    #[tokio::test]
    async fn missing_item_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let op = fake_op(
            &dir,
            r#"echo "[ERROR] \"$3\" isn't an item. Specify the item with its UUID, name, or domain." >&2
exit 1"#,
        );

        let err = OnePasswordCli::new(op.to_str().unwrap())
            .get_item("nope")
            .await
            .unwrap_err();
        assert!(matches!(err, ItemError::NotFound(ref name) if name == "nope"), "got {err}");
    }

    #[tokio::test]
    async fn other_failures_carry_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let op = fake_op(&dir, "echo 'you are not currently signed in' >&2\nexit 1");

        let err = OnePasswordCli::new(op.to_str().unwrap())
            .get_item("github")
            .await
            .unwrap_err();
        assert!(matches!(err, ItemError::Execution(_)), "got {err}");
        assert!(err.to_string().contains("not currently signed in"));
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("op");
        let err = OnePasswordCli::new(missing.to_str().unwrap())
            .get_item("github")
            .await
            .unwrap_err();
        assert!(matches!(err, ItemError::Unavailable(_)), "got {err}");
    }

    #[test]
    fn locate_rejects_non_executable_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("op");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        assert!(locate(path.to_str().unwrap()).is_none());

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700)).unwrap();
        assert_eq!(locate(path.to_str().unwrap()), Some(path));
    }

    #[test]
    fn locate_searches_path_for_bare_names() {
        assert!(locate("sh").is_some());
        assert!(locate("pipesecret-no-such-program").is_none());
    }
}

//! Files inside a Kubernetes container, reached through `kubectl exec`.
//!
//! Every operation runs a small POSIX shell script in the container. Paths are
//! passed as positional arguments, never spliced into the script text.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{OnceCell, Semaphore};
use tracing::debug;

use crate::activity::TaskHandle;
use crate::entry::EntryMeta;
use crate::error::SourceError;
use crate::paths;
use crate::source::{Backend, SourceKind};
use crate::transfer::{copy_exact_with_progress, copy_with_progress};

/// Exit code the scripts use for a missing path.
const MISSING: i32 = 44;

const STAT: &str = r#"[ -e "$1" ] || exit 44; stat -L -c '%F|%s|%Y' "$1""#;
const LIST: &str = r#"[ -d "$1" ] || exit 44
for f in "$1"/* "$1"/.[!.]* "$1"/..?*; do
  [ -e "$f" ] || [ -L "$f" ] || continue
  stat -L -c '%F|%s|%Y|%n' "$f" 2>/dev/null || printf 'broken|0|0|%s\n' "$f"
done"#;
const READ: &str = r#"[ -e "$1" ] || exit 44; exec cat "$1""#;
const WRITE: &str = r#"[ -d "$(dirname "$1")" ] || exit 44; exec cat > "$1""#;
const MKDIR: &str = r#"[ -d "$(dirname "$1")" ] || exit 44; mkdir "$1""#;
const MOVE: &str = r#"[ -e "$1" ] || exit 44
if [ -e "$2" ]; then echo "$2 already exists" >&2; exit 17; fi
mv "$1" "$2""#;
const REMOVE: &str = r#"[ -e "$1" ] || [ -L "$1" ] || exit 44; rm -rf "$1""#;
const EXISTS: &str = r#"[ -e "$1" ]"#;
const PWD: &str = "pwd";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeTarget {
    pub namespace: String,
    pub pod: String,
    pub container: Option<String>,
}

/// Builds `kubectl` invocations. One instance is shared by all Kubernetes sources.
#[derive(Debug, Clone)]
pub struct Kubectl {
    program: String,
    context: Option<String>,
    kubeconfig: Option<String>,
}

impl Default for Kubectl {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

impl Kubectl {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            context: None,
            kubeconfig: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_kubeconfig(mut self, kubeconfig: impl Into<String>) -> Self {
        self.kubeconfig = Some(kubeconfig.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// `kubectl exec` running `script` with `args` as `$1`, `$2`, ...
    pub fn exec(&self, target: &KubeTarget, script: &str, args: &[&str], stdin: bool) -> Command {
        let mut command = Command::new(&self.program);
        if let Some(kubeconfig) = &self.kubeconfig {
            command.arg("--kubeconfig").arg(kubeconfig);
        }
        if let Some(context) = &self.context {
            command.arg("--context").arg(context);
        }
        command.arg("exec");
        if stdin {
            command.arg("-i");
        }
        command.arg("-n").arg(&target.namespace).arg(&target.pod);
        if let Some(container) = &target.container {
            command.arg("-c").arg(container);
        }
        command
            .arg("--")
            .arg("sh")
            .arg("-c")
            .arg(script)
            .arg("sh")
            .args(args)
            .kill_on_drop(true);
        command
    }
}

pub struct KubeBackend {
    kubectl: Kubectl,
    target: KubeTarget,
    home: OnceCell<String>,
    permits: Arc<Semaphore>,
    concurrency: usize,
}

impl KubeBackend {
    pub fn new(
        kubectl: Kubectl,
        target: KubeTarget,
        home: Option<String>,
        concurrency: usize,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            kubectl,
            target,
            home: OnceCell::new_with(home),
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    fn spawn(
        &self,
        script: &str,
        args: &[&str],
        stdin: bool,
        stdout: bool,
    ) -> Result<Child, SourceError> {
        let mut command = self.kubectl.exec(&self.target, script, args, stdin);
        command
            .stdin(if stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(if stdout { Stdio::piped() } else { Stdio::null() })
            .stderr(Stdio::piped());
        command.spawn().map_err(|err| {
            SourceError::Transport(format!("cannot run {}: {err}", self.kubectl.program()))
        })
    }

    /// Runs a script to completion and returns its stdout.
    async fn run(&self, script: &str, args: &[&str], path: &str) -> Result<String, SourceError> {
        let _permit = self.acquire().await?;
        let child = self.spawn(script, args, false, true)?;
        let output = child.wait_with_output().await?;
        check_status(output.status, &output.stderr, path)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn acquire(&self) -> Result<tokio::sync::OwnedSemaphorePermit, SourceError> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| SourceError::PoolClosed)
    }
}

fn check_status(status: ExitStatus, stderr: &[u8], path: &str) -> Result<(), SourceError> {
    if status.success() {
        return Ok(());
    }
    if status.code() == Some(MISSING) {
        return Err(SourceError::NotFound(path.to_string()));
    }
    Err(SourceError::Transport(format!(
        "kubectl exec failed for {path} ({status}): {}",
        String::from_utf8_lossy(stderr).trim()
    )))
}

async fn read_stderr(pipe: Option<ChildStderr>) -> Vec<u8> {
    let mut stderr = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut stderr).await;
    }
    stderr
}

/// Parses `%F|%s|%Y` as printed by `stat -L -c`.
fn parse_stat(path: String, line: &str) -> Option<EntryMeta> {
    let mut fields = line.trim_end().splitn(3, '|');
    meta_from_fields(path, fields.next()?, fields.next()?, fields.next()?)
}

fn meta_from_fields(path: String, kind: &str, size: &str, modified: &str) -> Option<EntryMeta> {
    let modified = modified.parse::<i64>().ok()? * 1000;
    Some(if kind == "directory" {
        EntryMeta::dir(path, modified)
    } else {
        EntryMeta::file(path, size.parse().unwrap_or(0), modified)
    })
}

/// Lines of `%F|%s|%Y|%n`; names may themselves contain `|`.
fn parse_listing(dir: &str, output: &str) -> Vec<EntryMeta> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(4, '|');
            let (kind, size, modified) = (fields.next()?, fields.next()?, fields.next()?);
            let name = fields.next()?.rsplit('/').next()?;
            if name.is_empty() || name == "." || name == ".." {
                return None;
            }
            meta_from_fields(paths::join(dir, name), kind, size, modified)
        })
        .collect()
}

#[async_trait]
impl Backend for KubeBackend {
    fn kind(&self) -> SourceKind {
        SourceKind::Kubernetes
    }

    async fn home(&self) -> Result<String, SourceError> {
        let home = self
            .home
            .get_or_try_init(|| async {
                let output = self.run(PWD, &[], "pwd").await?;
                Ok::<_, SourceError>(output.trim().to_string())
            })
            .await?;
        Ok(home.clone())
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }

    async fn stat(&self, path: &str) -> Result<EntryMeta, SourceError> {
        let output = self.run(STAT, &[path], path).await?;
        parse_stat(path.to_string(), &output).ok_or_else(|| {
            SourceError::Transport(format!("unexpected stat output for {path}: {output:?}"))
        })
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<EntryMeta>, SourceError> {
        let output = self.run(LIST, &[path], path).await?;
        Ok(parse_listing(path, &output))
    }

    async fn read_file(
        &self,
        entry: &EntryMeta,
        out: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &TaskHandle,
    ) -> Result<u64, SourceError> {
        let _permit = self.acquire().await?;
        let mut child = self.spawn(READ, &[&entry.path], false, true)?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Transport("kubectl stdout unavailable".to_string()))?;
        // kubectl blocks once its stderr pipe fills, so drain it while copying
        let (copied, stderr) = tokio::join!(
            copy_with_progress(&mut stdout, out, Some(entry.size), progress),
            read_stderr(child.stderr.take()),
        );
        let status = child.wait().await?;
        check_status(status, &stderr, &entry.path)?;
        Ok(copied?)
    }

    async fn write_file(
        &self,
        path: &str,
        input: &mut (dyn AsyncRead + Unpin + Send),
        length: u64,
        progress: &TaskHandle,
    ) -> Result<(), SourceError> {
        let _permit = self.acquire().await?;
        let mut child = self.spawn(WRITE, &[path], true, false)?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SourceError::Transport("kubectl stdin unavailable".to_string()))?;
        let stderr = read_stderr(child.stderr.take());
        let upload = async {
            let copied = copy_exact_with_progress(input, &mut stdin, length, progress).await;
            drop(stdin);
            copied
        };
        let (copied, stderr) = tokio::join!(upload, stderr);
        let status = child.wait().await?;
        // a missing parent makes the script exit before reading stdin
        check_status(status, &stderr, path)?;
        copied?;
        debug!(path, length, "uploaded into container");
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<(), SourceError> {
        self.run(MKDIR, &[path], path).await.map(drop)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SourceError> {
        self.run(MOVE, &[from, to], from).await.map(drop)
    }

    async fn delete(&self, entry: &EntryMeta) -> Result<(), SourceError> {
        self.run(REMOVE, &[&entry.path], &entry.path).await.map(drop)
    }

    async fn exists(&self, path: &str) -> bool {
        self.run(EXISTS, &[path], path).await.is_ok()
    }

    async fn close(&self) {
        self.permits.close();
    }
}

// src/exec/command.rs

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cache::RunOutput;
use crate::cmd::Runnable;
use crate::errors::{Error, Result};
use crate::exec::sink::{OutputEvent, OutputSink};
use crate::venv::Space;

/// How long a cancelled child gets to exit on its own before being killed.
/// Ctrl-C already delivered SIGINT to the foreground process group, so
/// this is the window for graceful shutdown.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Compose the environment for a runnable's subprocess.
///
/// Precedence, strongest first: the ambient process environment, the
/// space's venv additions (`VIRTUAL_ENV`, `PATH` prepend), then dotenv
/// values for keys the environment does not already define. The runner
/// also exposes itself to the child via `QIK__*` variables.
pub fn compose_env(
    root: &Path,
    runnable: &Runnable,
    space: &Space,
    worker_id: usize,
) -> Result<Vec<(String, String)>> {
    let mut env: BTreeMap<String, String> = BTreeMap::new();

    for (key, val) in space.dotenv_vars(root)? {
        if std::env::var_os(&key).is_none() {
            env.insert(key, val);
        }
    }

    for (key, val) in space.environ_additions() {
        env.insert(key, val);
    }

    env.insert("QIK__CMD".into(), runnable.name.clone());
    env.insert("QIK__RUNNABLE".into(), runnable.slug.clone());
    env.insert("QIK__WORKER".into(), worker_id.to_string());

    Ok(env.into_iter().collect())
}

/// Run the runnable's shell string, streaming combined stdout/stderr to
/// the sink and to the per-runnable log file, and honoring cancellation.
pub async fn run_shell(
    root: &Path,
    runnable: &Runnable,
    env: &[(String, String)],
    log_path: &Path,
    sink: &OutputSink,
    mut cancel_rx: watch::Receiver<bool>,
) -> Result<RunOutput> {
    info!(slug = %runnable.slug, exec = %runnable.exec, "starting runnable process");

    // Build a shell command appropriate for the platform.
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(&runnable.exec);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(&runnable.exec);
        c
    };

    cmd.current_dir(root)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, val) in env {
        cmd.env(key, val);
    }

    let mut child = cmd.spawn().map_err(|e| Error::SubprocessFailed {
        runnable: runnable.slug.clone(),
        reason: e.to_string(),
    })?;

    // Merge stdout and stderr into one ordered line stream.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
    spawn_line_reader(child.stdout.take(), line_tx.clone());
    spawn_line_reader(child.stderr.take(), line_tx);

    let mut log = open_log(log_path)?;
    let mut captured = String::new();

    let mut status = None;
    let mut cancel_requested = false;

    loop {
        tokio::select! {
            line = line_rx.recv() => {
                match line {
                    Some(line) => {
                        captured.push_str(&line);
                        captured.push('\n');
                        if let Err(err) = writeln!(log, "{line}") {
                            warn!(error = %err, "could not append to runnable log");
                        }
                        sink.send(OutputEvent::Line {
                            slug: runnable.slug.clone(),
                            line,
                        })
                        .await;
                    }
                    // Pipes closed; wait for the exit status.
                    None => {
                        if status.is_none() {
                            status = Some(child.wait().await.with_context(|| {
                                format!("waiting for process of '{}'", runnable.slug)
                            })?);
                        }
                        break;
                    }
                }
            }
            changed = cancel_rx.changed(), if !cancel_requested => {
                if changed.is_err() || *cancel_rx.borrow() {
                    cancel_requested = true;
                    debug!(slug = %runnable.slug, "cancellation requested; granting grace period");
                    let waited = tokio::time::timeout(CANCEL_GRACE, child.wait()).await;
                    match waited {
                        Ok(res) => {
                            status = Some(res.with_context(|| {
                                format!("waiting for process of '{}'", runnable.slug)
                            })?);
                        }
                        Err(_) => {
                            warn!(slug = %runnable.slug, "grace period elapsed; killing");
                            child.kill().await.ok();
                            status = Some(child.wait().await.with_context(|| {
                                format!("reaping killed process of '{}'", runnable.slug)
                            })?);
                        }
                    }
                    // Drain whatever output is still buffered.
                    while let Ok(line) = line_rx.try_recv() {
                        captured.push_str(&line);
                        captured.push('\n');
                    }
                    break;
                }
            }
        }
    }

    let status = match status {
        Some(status) => status,
        None => child.wait().await.with_context(|| {
            format!("waiting for process of '{}'", runnable.slug)
        })?,
    };

    let code = status.code().unwrap_or(-1);
    let signaled = status.code().is_none();

    info!(
        slug = %runnable.slug,
        exit_code = code,
        success = status.success(),
        "runnable process exited"
    );

    log.flush().ok();

    Ok(RunOutput {
        code,
        out: captured,
        signaled,
    })
}

fn spawn_line_reader(
    stream: Option<impl AsyncRead + Unpin + Send + 'static>,
    tx: mpsc::Sender<String>,
) {
    let Some(stream) = stream else {
        return;
    };

    tokio::spawn(async move {
        let reader = BufReader::new(stream);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

fn open_log(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating log dir {}", parent.display()))?;
    }
    Ok(fs::File::create(path)
        .with_context(|| format!("creating log file {}", path.display()))?)
}

/// The latest-run log path for a runnable.
pub fn log_path(priv_work_dir: &Path, runnable: &Runnable) -> PathBuf {
    priv_work_dir.join("out").join(format!("{}.log", runnable.slug))
}

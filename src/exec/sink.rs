// src/exec/sink.rs

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// An output event produced by a worker.
#[derive(Debug, Clone)]
pub enum OutputEvent {
    Started {
        slug: String,
        exec: String,
        cached: bool,
    },
    Line {
        slug: String,
        line: String,
    },
    Finished {
        slug: String,
        code: i32,
        cached: bool,
    },
}

/// The single live output channel.
///
/// Workers enqueue events; one drain task renders them to stdout. Lines of
/// one runnable stay in order; lines of concurrent runnables interleave at
/// event granularity.
#[derive(Clone)]
pub struct OutputSink {
    tx: mpsc::Sender<OutputEvent>,
}

impl OutputSink {
    /// Spawn the drain task and return the sink plus its handle. Dropping
    /// every sink clone ends the drain task.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<OutputEvent>(256);

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                render(&event);
            }
            debug!("output sink drained");
        });

        (Self { tx }, handle)
    }

    pub async fn send(&self, event: OutputEvent) {
        // A closed sink means the process is exiting; output is best-effort.
        let _ = self.tx.send(event).await;
    }
}

fn render(event: &OutputEvent) {
    match event {
        OutputEvent::Started { slug, exec, cached } => {
            if *cached {
                println!(">> {slug} (cached) {exec}");
            } else {
                println!(">> {slug} {exec}");
            }
        }
        OutputEvent::Line { slug, line } => {
            println!("[{slug}] {line}");
        }
        OutputEvent::Finished { slug, code, cached } => {
            let tag = if *cached { " (cached)" } else { "" };
            if *code == 0 {
                println!("ok {slug}{tag}");
            } else {
                println!("fail {slug}{tag} (exit {code})");
            }
        }
    }
}

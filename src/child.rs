use std::fmt;
use std::process::Stdio;

use log::info;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::node::{NodeEvent, PeerToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    Clone,
    Fetch,
    Merge,
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChildKind::Clone => "clone",
            ChildKind::Fetch => "fetch",
            ChildKind::Merge => "merge",
        })
    }
}

/// One supervised repository-tool subprocess. Its stdout and stderr are
/// line-logged as they arrive; when both pipes reach EOF the process is
/// reaped and its exit code reported back to the owning peer's session.
/// Dropping the handle kills the process.
#[derive(Debug)]
pub struct Child {
    pub kind: ChildKind,
    supervisor: JoinHandle<()>,
}

impl Child {
    pub fn spawn(
        token: PeerToken,
        kind: ChildKind,
        tag: String,
        argv: Vec<String>,
        env: Vec<(String, String)>,
        events: UnboundedSender<NodeEvent>,
    ) -> Result<Child> {
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            command.env(key, value);
        }

        info!("[{} {}] running {:?}", kind, tag, argv.join(" "));
        let mut process = command.spawn()?;

        let stdout = process.stdout.take().expect("stdout is piped");
        let stderr = process.stderr.take().expect("stderr is piped");

        let supervisor = tokio::spawn(async move {
            let mut out_lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            let (mut out_open, mut err_open) = (true, true);

            while out_open || err_open {
                tokio::select! {
                    line = out_lines.next_line(), if out_open => match line {
                        Ok(Some(line)) => info!("[{} {}] {}", kind, tag, line),
                        _ => out_open = false,
                    },
                    line = err_lines.next_line(), if err_open => match line {
                        Ok(Some(line)) => info!("[{} {}] {}", kind, tag, line),
                        _ => err_open = false,
                    },
                }
            }

            // Output is closed, so the child is presumed to be exiting
            // imminently; waiting here cannot stall the node.
            let code = match process.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };

            info!("[{} {}] exit {}", kind, tag, code);
            let _ = events.send(NodeEvent::ChildExit { token, kind, code });
        });

        Ok(Child { kind, supervisor })
    }

    /// Stop supervising and kill the process.
    pub fn close(self) {
        self.supervisor.abort();
    }
}

//! Starting tool server processes

use async_trait::async_trait;
use rago_core::{Component, ErrorKind, RagoError, RagoResult};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::config::ServerConfig;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Byte pipes to a freshly started server
pub struct Connection {
    /// Server's stdout
    pub reader: BoxedReader,
    /// Server's stdin
    pub writer: BoxedWriter,
    /// Backing child process, if any; killed when the session ends
    pub child: Option<Child>,
}

impl Connection {
    pub fn new(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader,
            writer,
            child: None,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("pid", &self.child.as_ref().and_then(|c| c.id()))
            .finish()
    }
}

/// Starts a server and hands back its stdio
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, config: &ServerConfig) -> RagoResult<Connection>;
}

/// Spawns real child processes
#[derive(Debug, Default, Clone)]
pub struct ProcessLauncher;

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, config: &ServerConfig) -> RagoResult<Connection> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            RagoError::new(
                ErrorKind::ToolServerUnavailable,
                format!("failed to spawn '{}': {}", config.command, e),
            )
            .at(Component::Tools, "launch")
            .with_source(e)
        })?;

        let missing = |what: &str| {
            RagoError::internal(format!("{} pipe unavailable for '{}'", what, config.name))
                .at(Component::Tools, "launch")
        };
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;

        if let Some(stderr) = child.stderr.take() {
            let server = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "{}", line);
                }
            });
        }

        info!(
            server = %config.name,
            command = %config.command,
            args = ?config.args,
            pid = ?child.id(),
            "Spawned tool server"
        );

        Ok(Connection {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }
}

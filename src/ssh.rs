//! SSH access to launched instances.

use crate::settings::{expand_home, SshSettings};
use color_eyre::Report;
use eyre::WrapErr;
use openssh::{KnownHosts, SessionBuilder};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::instrument;

/// Output of a command run over SSH.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// An established SSH session.
pub struct Session {
    ssh: openssh::Session,
    host: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("host", &self.host).finish()
    }
}

impl Session {
    /// Connect to `host`, trying each configured key in turn and retrying until one works or
    /// `max_wait` runs out.
    #[instrument(level = "debug", skip(settings, max_wait))]
    pub async fn connect(
        host: &str,
        settings: &SshSettings,
        max_wait: Option<Duration>,
    ) -> Result<Self, Report> {
        let keys: Vec<PathBuf> = settings.keys.iter().map(|k| expand_home(k)).collect();
        eyre::ensure!(!keys.is_empty(), "no ssh keys configured");

        let start = Instant::now();
        loop {
            for key in &keys {
                let mut b = SessionBuilder::default();
                b.user(settings.username.clone())
                    .keyfile(key)
                    .known_hosts_check(KnownHosts::Accept)
                    .connect_timeout(Duration::from_secs(10));
                match b.connect(host).await {
                    Ok(ssh) => {
                        tracing::debug!(key = %key.display(), "established ssh connection");
                        return Ok(Session {
                            ssh,
                            host: host.to_string(),
                        });
                    }
                    Err(e) => {
                        tracing::warn!(key = %key.display(), "unable to establish ssh connection: {}", e);
                    }
                }
            }

            if let Some(limit) = max_wait {
                if start.elapsed() > limit {
                    eyre::bail!("could not ssh to {} within {:?}", host, limit);
                }
            }
            tokio::time::sleep(settings.retry_interval()).await;
        }
    }

    /// Run `cmd` through the remote shell.
    #[instrument(level = "trace", skip(self))]
    pub async fn run(&self, cmd: &str) -> Result<CommandOutput, Report> {
        let out = self
            .ssh
            .command("sh")
            .arg("-c")
            .arg(cmd)
            .output()
            .await
            .wrap_err_with(|| format!("failed to execute command '{}'", cmd))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            success: out.status.success(),
        })
    }

    pub async fn close(self) -> Result<(), Report> {
        self.ssh.close().await.wrap_err("failed to close ssh session")
    }
}

//! Helper processes owned by the launcher: the oTree dev server and the
//! llama.cpp server used by local models.

use std::path::Path;
use std::process::Stdio;

use reqwest::{Client as HttpClient, Url};
use tokio::process::{Child, Command};
use tokio::time::{sleep, Duration, Instant};

use crate::config::{BotSettings, LocalServerSettings};
use crate::error::{LabError, Result};

/// How long the oTree dev server gets to come up
pub const OTREE_STARTUP_TIMEOUT: Duration = Duration::from_secs(15);
/// Model loading makes llama.cpp slower to start
pub const LLAMACPP_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

const READY_POLL: Duration = Duration::from_millis(500);

/// A child process killed on [`ManagedProcess::stop`] or drop
#[derive(Debug)]
pub struct ManagedProcess {
    program: String,
    child: Child,
}

impl ManagedProcess {
    pub fn program(&self) -> &str {
        &self.program
    }

    pub async fn stop(mut self) -> Result<()> {
        if let Ok(Some(status)) = self.child.try_wait() {
            tracing::debug!("{} already exited with {}", self.program, status);
            return Ok(());
        }
        self.child.start_kill().map_err(|e| LabError::Process {
            program: self.program.clone(),
            reason: format!("could not stop: {}", e),
        })?;
        let _ = self.child.wait().await;
        tracing::info!("Stopped {}", self.program);
        Ok(())
    }

    /// Poll `url` until it answers with `ready`, failing early if the process dies
    async fn wait_until<F>(&mut self, url: &str, timeout: Duration, ready: F) -> Result<()>
    where
        F: Fn(reqwest::StatusCode) -> bool,
    {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| LabError::Http(e.to_string()))?;
        let started = Instant::now();

        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(LabError::Process {
                    program: self.program.clone(),
                    reason: format!("exited during startup with {}", status),
                });
            }
            if let Ok(response) = http.get(url).send().await {
                if ready(response.status()) {
                    tracing::info!("{} ready at {} after {:?}", self.program, url, started.elapsed());
                    return Ok(());
                }
            }
            if started.elapsed() >= timeout {
                return Err(LabError::Process {
                    program: self.program.clone(),
                    reason: format!("not ready at {} after {:?}", url, timeout),
                });
            }
            sleep(READY_POLL).await;
        }
    }
}

fn spawn(mut command: Command, program: &str) -> Result<ManagedProcess> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let child = command.spawn().map_err(|e| LabError::Process {
        program: program.to_string(),
        reason: e.to_string(),
    })?;
    Ok(ManagedProcess {
        program: program.to_string(),
        child,
    })
}

fn port_of(url: &str) -> Result<u16> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.port_or_known_default())
        .ok_or_else(|| LabError::InvalidConfig {
            message: format!("cannot determine port of {}", url),
        })
}

/// Run `otree devserver <port>` in `project_dir` and wait until `otree_url`
/// answers.
pub async fn start_otree_devserver(project_dir: &Path, otree_url: &str) -> Result<ManagedProcess> {
    let port = port_of(otree_url)?;
    let mut command = Command::new("otree");
    command.arg("devserver").arg(port.to_string()).current_dir(project_dir);

    tracing::info!("Starting oTree dev server in {} on port {}", project_dir.display(), port);
    let mut process = spawn(command, "otree devserver")?;
    process
        .wait_until(otree_url, OTREE_STARTUP_TIMEOUT, |_| true)
        .await?;
    Ok(process)
}

async fn llamacpp_healthy(server_url: &str) -> bool {
    let Ok(http) = HttpClient::builder().timeout(Duration::from_secs(5)).build() else {
        return false;
    };
    matches!(
        http.get(format!("{}/health", server_url.trim_end_matches('/'))).send().await,
        Ok(r) if r.status().is_success()
    )
}

/// Make sure a llama.cpp server answers at `server_url`.
///
/// Returns the process when one had to be started, `None` when a server was
/// already running.
pub async fn ensure_llamacpp_server(
    local: &LocalServerSettings,
    bots: &BotSettings,
) -> Result<Option<ManagedProcess>> {
    let server_url = local.server_url.trim_end_matches('/');
    if llamacpp_healthy(server_url).await {
        tracing::info!("llama.cpp server already running at {}", server_url);
        return Ok(None);
    }

    let (Some(server_path), Some(model_path)) = (&local.server_path, &local.model_path) else {
        return Err(LabError::Process {
            program: "llama.cpp server".to_string(),
            reason: format!(
                "nothing answers at {} and [local] server_path/model_path are not configured",
                server_url
            ),
        });
    };

    let port = port_of(server_url)?;
    let mut command = Command::new(server_path);
    command
        .arg("--model")
        .arg(model_path)
        .arg("--port")
        .arg(port.to_string())
        .arg("--n-predict")
        .arg(bots.max_tokens.to_string())
        .arg("--temp")
        .arg(bots.temperature.to_string());

    tracing::info!("Starting llama.cpp server {} with {}", server_path.display(), model_path.display());
    let mut process = spawn(command, "llama.cpp server")?;
    process
        .wait_until(
            &format!("{}/health", server_url),
            LLAMACPP_STARTUP_TIMEOUT,
            |status| status.is_success(),
        )
        .await?;
    Ok(Some(process))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_port_of() {
        assert_eq!(port_of("http://localhost:8000").unwrap(), 8000);
        assert_eq!(port_of("https://lab.example.org").unwrap(), 443);
        assert!(port_of("not a url").is_err());
    }

    #[tokio::test]
    async fn test_running_llamacpp_server_is_reused() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"status":"ok"}"#))
            .mount(&server)
            .await;

        let local = LocalServerSettings {
            server_url: server.uri(),
            ..LocalServerSettings::default()
        };
        let process = ensure_llamacpp_server(&local, &BotSettings::default()).await.unwrap();
        assert!(process.is_none());
    }

    #[tokio::test]
    async fn test_missing_llamacpp_server_without_paths_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let local = LocalServerSettings {
            server_url: server.uri(),
            server_path: None,
            model_path: None,
        };
        let err = ensure_llamacpp_server(&local, &BotSettings::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("server_path"));
    }

    #[tokio::test]
    async fn test_devserver_that_cannot_spawn_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut command = Command::new(dir.path().join("no-such-binary"));
        command.arg("devserver");
        let err = spawn(command, "otree devserver").unwrap_err();
        assert!(matches!(err, LabError::Process { ref program, .. } if program == "otree devserver"));
    }
}

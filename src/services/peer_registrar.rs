use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::PeerRegistrarSettings;
use crate::error::{AppError, Result};

/// Operation requested from the peer-management process.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PeerAction {
    Add,
    Remove,
}

/// The single JSON object written to the peer-management process' stdin.
#[derive(Serialize, Debug)]
pub struct PeerRequest<'a> {
    pub action: PeerAction,
    pub public_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<&'a str>,
}

impl<'a> PeerRequest<'a> {
    pub fn add(public_key: &'a str, client_ip: &'a str) -> Result<Self> {
        if public_key.is_empty() || client_ip.is_empty() {
            return Err(AppError::Validation(
                "public_key and client_ip are required".to_string(),
            ));
        }
        Ok(Self { action: PeerAction::Add, public_key, client_ip: Some(client_ip) })
    }

    pub fn remove(public_key: &'a str) -> Result<Self> {
        if public_key.is_empty() {
            return Err(AppError::Validation("public_key is required".to_string()));
        }
        Ok(Self { action: PeerAction::Remove, public_key, client_ip: None })
    }
}

/// Owner of the real WireGuard peer table.
///
/// Implementations hold no session state. Every call either completes or
/// fails with `RegistrationFailed` / `RegistrationTimeout`.
#[async_trait]
pub trait PeerRegistrar: Send + Sync {
    /// Installs a peer allowed to use `client_ip`.
    async fn add_peer(&self, public_key: &str, client_ip: &str) -> Result<()>;

    /// Removes the peer identified by `public_key`.
    async fn remove_peer(&self, public_key: &str) -> Result<()>;
}

/// Talks to the privileged `wg-manage` executable: one process per request.
pub struct SubprocessPeerRegistrar {
    settings: PeerRegistrarSettings,
}

impl SubprocessPeerRegistrar {
    pub fn new(settings: PeerRegistrarSettings) -> Self {
        Self { settings }
    }

    async fn invoke(&self, request: &PeerRequest<'_>) -> Result<()> {
        let payload = sonic_rs::to_string(request)
            .map_err(|e| AppError::Internal(format!("Peer request serialization failed: {}", e)))?;

        tracing::debug!(
            action = ?request.action,
            program = %self.settings.program.display(),
            "Invoking peer-management process"
        );

        let mut child = Command::new(&self.settings.program)
            .args(&self.settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AppError::RegistrationFailed(format!(
                    "Failed to execute {}: {}",
                    self.settings.program.display(),
                    e
                ))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Internal("Peer process stdin unavailable".to_string()))?;

        // The child is owned by this future; dropping it on timeout kills the process.
        let exchange = async move {
            match stdin.write_all(payload.as_bytes()).await {
                Ok(()) => {}
                // The process may exit without reading; its exit status decides.
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e),
            }
            drop(stdin);
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(self.settings.timeout, exchange).await {
            Err(_) => {
                tracing::error!(
                    action = ?request.action,
                    timeout = ?self.settings.timeout,
                    "❌ Peer-management process timed out and was killed"
                );
                return Err(AppError::RegistrationTimeout(self.settings.timeout));
            }
            Ok(Err(e)) => {
                return Err(AppError::RegistrationFailed(format!(
                    "Peer process I/O failed: {}",
                    e
                )));
            }
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::debug!(
            status = %output.status,
            stdout = %stdout.trim(),
            stderr = %stderr.trim(),
            "Peer-management process exited"
        );

        if output.status.success() {
            return Ok(());
        }

        let diagnostic = match (stderr.trim(), stdout.trim()) {
            ("", "") => format!("exited with {}", output.status),
            ("", out) => out.to_string(),
            (err, _) => err.to_string(),
        };
        Err(AppError::RegistrationFailed(diagnostic))
    }
}

#[async_trait]
impl PeerRegistrar for SubprocessPeerRegistrar {
    async fn add_peer(&self, public_key: &str, client_ip: &str) -> Result<()> {
        self.invoke(&PeerRequest::add(public_key, client_ip)?).await
    }

    async fn remove_peer(&self, public_key: &str) -> Result<()> {
        self.invoke(&PeerRequest::remove(public_key)?).await
    }
}

/// A call observed by [`ScriptedPeerRegistrar`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    Add { public_key: String, client_ip: String },
    Remove { public_key: String },
}

/// Outcome queued on a [`ScriptedPeerRegistrar`].
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Succeed,
    Fail(String),
    TimeOut,
}

#[derive(Default)]
struct Script {
    calls: Vec<PeerCall>,
    add: VecDeque<ScriptedOutcome>,
    remove: VecDeque<ScriptedOutcome>,
}

/// In-memory registrar returning queued outcomes; succeeds once a queue is empty.
#[derive(Default)]
pub struct ScriptedPeerRegistrar {
    script: Mutex<Script>,
    latency: Option<Duration>,
}

impl ScriptedPeerRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call, widening the window between allocation and persistence.
    pub fn with_latency(latency: Duration) -> Self {
        Self { latency: Some(latency), ..Self::default() }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_add_outcome(&self, outcome: ScriptedOutcome) {
        self.script().add.push_back(outcome);
    }

    pub fn push_remove_outcome(&self, outcome: ScriptedOutcome) {
        self.script().remove.push_back(outcome);
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        self.script().calls.clone()
    }

    pub fn add_count(&self) -> usize {
        self.script().calls.iter().filter(|c| matches!(c, PeerCall::Add { .. })).count()
    }

    pub fn remove_count(&self) -> usize {
        self.script().calls.iter().filter(|c| matches!(c, PeerCall::Remove { .. })).count()
    }

    async fn settle(&self, call: PeerCall) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let outcome = {
            let mut script = self.script();
            let outcome = match call {
                PeerCall::Add { .. } => script.add.pop_front(),
                PeerCall::Remove { .. } => script.remove.pop_front(),
            };
            script.calls.push(call);
            outcome.unwrap_or(ScriptedOutcome::Succeed)
        };

        match outcome {
            ScriptedOutcome::Succeed => Ok(()),
            ScriptedOutcome::Fail(msg) => Err(AppError::RegistrationFailed(msg)),
            ScriptedOutcome::TimeOut => Err(AppError::RegistrationTimeout(Duration::from_secs(10))),
        }
    }
}

#[async_trait]
impl PeerRegistrar for ScriptedPeerRegistrar {
    async fn add_peer(&self, public_key: &str, client_ip: &str) -> Result<()> {
        PeerRequest::add(public_key, client_ip)?;
        self.settle(PeerCall::Add {
            public_key: public_key.to_string(),
            client_ip: client_ip.to_string(),
        })
        .await
    }

    async fn remove_peer(&self, public_key: &str) -> Result<()> {
        PeerRequest::remove(public_key)?;
        self.settle(PeerCall::Remove { public_key: public_key.to_string() }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn shell(script: &str, timeout: Duration) -> SubprocessPeerRegistrar {
        SubprocessPeerRegistrar::new(PeerRegistrarSettings {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            timeout,
        })
    }

    #[test]
    fn request_wire_format() {
        let add = sonic_rs::to_string(&PeerRequest::add("pk", "10.0.0.2").unwrap()).unwrap();
        let add: serde_json::Value = serde_json::from_str(&add).unwrap();
        assert_eq!(add, serde_json::json!({"action": "add", "public_key": "pk", "client_ip": "10.0.0.2"}));

        let remove = sonic_rs::to_string(&PeerRequest::remove("pk").unwrap()).unwrap();
        let remove: serde_json::Value = serde_json::from_str(&remove).unwrap();
        assert_eq!(remove, serde_json::json!({"action": "remove", "public_key": "pk"}));
    }

    #[test]
    fn empty_fields_are_rejected_before_spawning() {
        assert!(matches!(PeerRequest::add("", "10.0.0.2"), Err(AppError::Validation(_))));
        assert!(matches!(PeerRequest::add("pk", ""), Err(AppError::Validation(_))));
        assert!(matches!(PeerRequest::remove(""), Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn zero_exit_is_success() {
        let registrar = shell("cat > /dev/null; echo ignored", Duration::from_secs(5));
        registrar.add_peer("pk", "10.0.0.2").await.unwrap();
        registrar.remove_peer("pk").await.unwrap();
    }

    #[tokio::test]
    async fn request_arrives_on_stdin() {
        // Echo the request back on stderr so it surfaces in the diagnostic.
        let registrar = shell("cat >&2; exit 3", Duration::from_secs(5));
        match registrar.add_peer("pk", "10.0.0.7").await {
            Err(AppError::RegistrationFailed(diagnostic)) => {
                let sent: serde_json::Value = serde_json::from_str(&diagnostic).unwrap();
                assert_eq!(sent["action"], "add");
                assert_eq!(sent["public_key"], "pk");
                assert_eq!(sent["client_ip"], "10.0.0.7");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn stdout_is_used_when_stderr_is_empty() {
        let registrar = shell("cat > /dev/null; echo 'peer exists'; exit 1", Duration::from_secs(5));
        match registrar.remove_peer("pk").await {
            Err(AppError::RegistrationFailed(diagnostic)) => assert_eq!(diagnostic, "peer exists"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn stderr_wins_over_stdout() {
        let registrar = shell("cat > /dev/null; echo out; echo 'wg: bad key' >&2; exit 1", Duration::from_secs(5));
        match registrar.add_peer("pk", "10.0.0.2").await {
            Err(AppError::RegistrationFailed(diagnostic)) => assert_eq!(diagnostic, "wg: bad key"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn slow_process_times_out() {
        let registrar = shell("sleep 5", Duration::from_millis(200));
        let started = std::time::Instant::now();
        let result = registrar.add_peer("pk", "10.0.0.2").await;
        assert!(matches!(result, Err(AppError::RegistrationTimeout(_))));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn missing_executable_fails_registration() {
        let registrar = SubprocessPeerRegistrar::new(PeerRegistrarSettings {
            program: PathBuf::from("/nonexistent/wg-manage"),
            args: Vec::new(),
            timeout: Duration::from_secs(1),
        });
        assert!(matches!(
            registrar.remove_peer("pk").await,
            Err(AppError::RegistrationFailed(_))
        ));
    }

    #[tokio::test]
    async fn scripted_registrar_replays_queue() {
        let registrar = ScriptedPeerRegistrar::new();
        registrar.push_add_outcome(ScriptedOutcome::Fail("denied".to_string()));

        assert!(matches!(
            registrar.add_peer("pk", "10.0.0.2").await,
            Err(AppError::RegistrationFailed(msg)) if msg == "denied"
        ));
        registrar.add_peer("pk", "10.0.0.2").await.unwrap();
        registrar.remove_peer("pk").await.unwrap();

        assert_eq!(registrar.add_count(), 2);
        assert_eq!(registrar.remove_count(), 1);
        assert_eq!(registrar.calls()[2], PeerCall::Remove { public_key: "pk".to_string() });
    }
}

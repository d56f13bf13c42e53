use std::{
    io::Write,
    process::Stdio,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tokio::{
    process::{Child, Command},
    sync::{watch, Mutex},
    time::{sleep, timeout},
};
use url::Url;
use uuid::Uuid;

use super::{
    engine::{EngineError, PolicyEngine, RawDecision},
    engine_config::{load_engine_config, EngineConfig, EngineLaunch},
    input::InputDocument,
};

const HEALTH_POLL_INTERVAL_MS: u64 = 250;
const HEALTH_REQUEST_TIMEOUT_MS: u64 = 2000;

#[derive(Deserialize)]
struct DataResponse {
    #[serde(default)]
    decision_id: Option<String>,
    #[serde(default)]
    result: Option<Value>,
}

/// Open Policy Agent reached over its REST data API, either as a child
/// process started from the substituted configuration file or as an
/// already-running server.
pub struct OpaEngine {
    client: reqwest::Client,
    config: EngineConfig,
    base_url: Url,
    ready: AtomicBool,
    stopped: watch::Sender<bool>,
    child: Mutex<Option<Child>>,
    // Held so the rendered configuration outlives the child process.
    config_file: Mutex<Option<NamedTempFile>>,
}

impl OpaEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let mut base_url = match &config.launch {
            EngineLaunch::Process { listen_addr, .. } => {
                Url::parse(&format!("http://{listen_addr}/")).map_err(|e| {
                    EngineError::initialization_caused_by("building engine URL", e)
                })?
            }
            EngineLaunch::Remote { url } => url.clone(),
        };
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let (stopped, _) = watch::channel(false);

        Ok(Self {
            client: reqwest::Client::new(),
            config,
            base_url,
            ready: AtomicBool::new(false),
            stopped,
            child: Mutex::new(None),
            config_file: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Bring the engine up and block until it reports healthy, bounded by the
    /// configured startup timeout.
    pub async fn start(&self) -> Result<(), EngineError> {
        if *self.stopped.borrow() {
            return Err(EngineError::Stopped);
        }

        if let EngineLaunch::Process {
            binary,
            listen_addr,
        } = &self.config.launch
        {
            let rendered = load_engine_config(&self.config.config_path)
                .await
                .map_err(|e| {
                    EngineError::initialization_caused_by(
                        format!(
                            "reading engine configuration {}",
                            self.config.config_path.display()
                        ),
                        e,
                    )
                })?;

            let mut file = NamedTempFile::new().map_err(|e| {
                EngineError::initialization_caused_by("creating rendered configuration file", e)
            })?;
            file.write_all(rendered.as_bytes())
                .and_then(|_| file.flush())
                .map_err(|e| {
                    EngineError::initialization_caused_by("writing rendered configuration file", e)
                })?;

            tracing::info!(
                binary = %binary.display(),
                addr = %listen_addr,
                "starting policy engine process"
            );

            let child = Command::new(binary)
                .arg("run")
                .arg("--server")
                .arg("--addr")
                .arg(listen_addr.to_string())
                .arg("--config-file")
                .arg(file.path())
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    EngineError::initialization_caused_by(
                        format!("spawning {}", binary.display()),
                        e,
                    )
                })?;

            *self.child.lock().await = Some(child);
            *self.config_file.lock().await = Some(file);
        } else {
            tracing::info!(url = %self.base_url, "attaching to remote policy engine");
        }

        let startup_timeout = self.config.startup_timeout;
        match timeout(startup_timeout, self.wait_until_healthy()).await {
            Ok(Ok(())) => {
                self.ready.store(true, Ordering::Release);
                tracing::info!("policy engine successfully started");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EngineError::initialization(format!(
                "engine did not report ready within {startup_timeout:?}"
            ))),
        }
    }

    async fn wait_until_healthy(&self) -> Result<(), EngineError> {
        let mut health_url = self
            .base_url
            .join("health")
            .map_err(|e| EngineError::initialization_caused_by("building health URL", e))?;
        health_url.set_query(Some("bundles"));

        loop {
            if *self.stopped.borrow() {
                return Err(EngineError::Stopped);
            }

            if let Some(child) = self.child.lock().await.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(EngineError::initialization(format!(
                        "engine process exited during startup with {status}"
                    )));
                }
            }

            match self
                .client
                .get(health_url.clone())
                .timeout(Duration::from_millis(HEALTH_REQUEST_TIMEOUT_MS))
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    tracing::debug!(status = %response.status(), "policy engine not ready yet");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "policy engine not reachable yet");
                }
            }

            sleep(Duration::from_millis(HEALTH_POLL_INTERVAL_MS)).await;
        }
    }

    async fn query(&self, input: InputDocument) -> Result<RawDecision, EngineError> {
        let url = self
            .base_url
            .join(&format!("v1/data/{}", self.config.decision_path))
            .map_err(|e| EngineError::DecisionFailed(format!("building decision URL: {e}")))?;

        let response = self
            .client
            .post(url)
            .json(&json!({ "input": input }))
            .send()
            .await
            .map_err(EngineError::Unavailable)?;

        let status = response.status();
        let body = response.bytes().await.map_err(EngineError::Unavailable)?;

        if !status.is_success() {
            return Err(EngineError::DecisionFailed(format!(
                "engine returned {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }

        let data: DataResponse = serde_json::from_slice(&body)
            .map_err(|e| EngineError::DecisionFailed(format!("malformed engine response: {e}")))?;

        let result = data.result.ok_or_else(|| {
            EngineError::DecisionFailed(format!(
                "undefined decision at {}",
                self.config.decision_path
            ))
        })?;

        Ok(RawDecision {
            id: data
                .decision_id
                .unwrap_or_else(|| format!("R-{}", Uuid::new_v4())),
            result,
        })
    }
}

#[async_trait]
impl PolicyEngine for OpaEngine {
    async fn evaluate(&self, input: InputDocument) -> Result<RawDecision, EngineError> {
        let mut stopped = self.stopped.subscribe();
        if *stopped.borrow_and_update() {
            return Err(EngineError::Stopped);
        }
        if !self.ready.load(Ordering::Acquire) {
            return Err(EngineError::NotReady);
        }

        tokio::select! {
            result = self.query(input) => result,
            _ = stopped.wait_for(|stopped| *stopped) => Err(EngineError::Stopped),
        }
    }

    async fn shutdown(&self) {
        if self.stopped.send_replace(true) {
            return;
        }
        self.ready.store(false, Ordering::Release);
        tracing::info!("shutting down policy engine");

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to stop policy engine process");
            }
        }
        self.config_file.lock().await.take();
    }
}

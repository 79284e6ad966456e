use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::future::Future;
use std::io::Read;
use tracing::{debug, info};

use crate::conditions::{ClogStrategy, ConditionEngine, DeploymentConfig};
use crate::error::UplinkError;
use crate::retry::RetryPolicy;
use crate::storage::UploadJob;
use crate::types::{ConfigPayload, DeploymentStatus, DeploymentStatusPayload, TimeNow};

/// Status and body of one exchange with the remote service.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Response {
    fn ok(self) -> Result<Self, UplinkError> {
        if self.status == 200 {
            Ok(self)
        } else {
            Err(UplinkError::Status(self.status))
        }
    }

    fn json<T: DeserializeOwned>(&self) -> Result<T, UplinkError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Request/response boundary to the configuration and storage service.
/// Paths are relative to the service root.
pub trait Transport: Send + Sync {
    fn get(&self, path: &str) -> impl Future<Output = Result<Response, UplinkError>> + Send;

    fn post(
        &self,
        path: &str,
        headers: &[(&'static str, String)],
        body: &[u8],
    ) -> impl Future<Output = Result<Response, UplinkError>> + Send;
}

pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        HttpTransport {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn collect(response: reqwest::Response) -> Result<Response, UplinkError> {
    let status = response.status().as_u16();
    let body = response.bytes().await?.to_vec();
    Ok(Response { status, body })
}

impl Transport for HttpTransport {
    async fn get(&self, path: &str) -> Result<Response, UplinkError> {
        let response = self.client.get(self.url(path)).send().await?;
        collect(response).await
    }

    async fn post(
        &self,
        path: &str,
        headers: &[(&'static str, String)],
        body: &[u8],
    ) -> Result<Response, UplinkError> {
        let mut request = self
            .client
            .post(self.url(path))
            .header(CONTENT_TYPE, "text/plain")
            .body(body.to_vec());
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        collect(request.send().await?).await
    }
}

/// Uplink operations. Every call blocks its caller until it completes, and only
/// one request is ever outstanding.
pub struct UplinkClient<T> {
    transport: T,
    device_id: String,
    retry: RetryPolicy,
    chunk_size: usize,
}

impl<T: Transport> UplinkClient<T> {
    pub fn new(transport: T, device_id: impl Into<String>, retry: RetryPolicy, chunk_size: usize) -> Self {
        UplinkClient {
            transport,
            device_id: device_id.into(),
            retry,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub async fn get_time_now(&self) -> Result<i64, UplinkError> {
        let now = self
            .retry
            .run("time sync", || async move {
                let time: TimeNow = self.transport.get("/time/now").await?.ok()?.json()?;
                Ok::<_, UplinkError>(time.now)
            })
            .await?;
        info!(now, "Fetched time from service");
        Ok(now)
    }

    pub async fn register_deployment(&self, identity: &str) -> Result<(), UplinkError> {
        let path = format!("/deployment/create/{}", self.device_id);
        let path = path.as_str();
        self.retry
            .run("deployment registration", || async move {
                self.transport.post(path, &[], identity.as_bytes()).await?.ok()?;
                Ok::<_, UplinkError>(())
            })
            .await?;
        info!(identity, "Registered new deployment");
        Ok(())
    }

    /// Whether the service already holds a deployment for this device. Transport
    /// failures are retried; a `NotReady` answer is returned as is.
    pub async fn poll_deployment_status(&self) -> Result<DeploymentStatus, UplinkError> {
        let path = format!("/deployment/status/{}", self.device_id);
        let path = path.as_str();
        self.retry
            .run("deployment status", || async move {
                let payload: DeploymentStatusPayload = self.transport.get(path).await?.ok()?.json()?;
                Ok::<_, UplinkError>(DeploymentStatus::from(payload))
            })
            .await
    }

    /// Polls until the service returns a configuration that can arm the device.
    pub async fn poll_configuration(
        &self,
        identity: &str,
        clog: ClogStrategy,
    ) -> Result<ConditionEngine, UplinkError> {
        let path = format!("/deployment/config/{identity}");
        let path = path.as_str();
        let engine = self
            .retry
            .run("deployment configuration", || async move {
                let payload: ConfigPayload = self.transport.get(path).await?.ok()?.json()?;
                let engine = ConditionEngine::new(DeploymentConfig::from(&payload), clog);
                if engine.is_valid() {
                    Ok(engine)
                } else {
                    Err(UplinkError::ConfigNotReady)
                }
            })
            .await?;
        info!(
            identity,
            start = ?engine.active_start(),
            end = ?engine.active_end(),
            "Received deployment configuration"
        );
        Ok(engine)
    }

    pub async fn upload_data(&self, identity: &str, job: &UploadJob) -> Result<(), UplinkError> {
        self.upload_chunked(&format!("/deployment/upload/{identity}"), job)
            .await
    }

    pub async fn upload_log(&self, identity: &str, job: &UploadJob) -> Result<(), UplinkError> {
        self.upload_chunked(&format!("/deployment/upload-log/{identity}"), job)
            .await
    }

    /// Sends the file chunk by chunk, never moving past a chunk until it is
    /// acknowledged, and removes it once every chunk went through.
    async fn upload_chunked(&self, path: &str, job: &UploadJob) -> Result<(), UplinkError> {
        info!(file = %job.path.display(), chunks = job.chunks, path, "Uploading file");
        let mut file = File::open(&job.path)?;
        let total = job.chunks.to_string();
        let mut buffer = Vec::with_capacity(self.chunk_size);

        for nth in 1..=job.chunks {
            buffer.clear();
            file.by_ref()
                .take(self.chunk_size as u64)
                .read_to_end(&mut buffer)?;
            if buffer.is_empty() {
                break;
            }

            let headers = [
                ("Chunks", total.clone()),
                ("Nth", nth.to_string()),
                ("Data-Bytes", buffer.len().to_string()),
            ];
            let headers = headers.as_slice();
            let body = buffer.as_slice();
            self.retry
                .run("chunk upload", || async move {
                    self.transport.post(path, headers, body).await?.ok()?;
                    Ok::<_, UplinkError>(())
                })
                .await?;
            debug!(nth, chunks = job.chunks, bytes = body.len(), "Chunk acknowledged");
        }

        drop(file);
        fs::remove_file(&job.path)?;
        info!(file = %job.path.display(), "Upload complete, local copy removed");
        Ok(())
    }
}

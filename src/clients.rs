use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::{MenderError, Result};
use crate::protocol::{
    ClearResponse, EpisodesResponse, ExecuteRequest, ExecutionReport, FeedbackRequest,
    FeedbackResponse, ProcessRequest, ProcessResponse, StrategiesResponse,
};

/* ============================= BASE ============================= */

fn build_http(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| MenderError::Permanent(format!("http client: {e}")))
}

/// POST json, with one retry on transport error.
async fn post_json<Req: Serialize, Resp: DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
    body: &Req,
) -> Result<Resp> {
    match post_once(http, url, body).await {
        Ok(v) => Ok(v),
        Err(e) if e.is_transient() => {
            warn!(url, error = %e, "request_retry");
            post_once(http, url, body).await
        }
        Err(e) => Err(e),
    }
}

async fn post_once<Req: Serialize, Resp: DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
    body: &Req,
) -> Result<Resp> {
    let response = http.post(url).json(body).send().await?;
    let status = response.status();
    if status.is_client_error() {
        let text = response.text().await.unwrap_or_default();
        return Err(MenderError::Permanent(format!(
            "{url} rejected: {status} {text}"
        )));
    }
    if !status.is_success() {
        return Err(MenderError::Transient(format!("{url} returned {status}")));
    }
    Ok(response.json::<Resp>().await?)
}

async fn get_json<Resp: DeserializeOwned>(http: &reqwest::Client, url: &str) -> Result<Resp> {
    let response = http.get(url).send().await?;
    if !response.status().is_success() {
        return Err(MenderError::Transient(format!(
            "{url} returned {}",
            response.status()
        )));
    }
    Ok(response.json::<Resp>().await?)
}

/* ============================= REFLEXION ============================= */

/// Typed client for the Reflexion service.
#[derive(Clone)]
pub struct ReflexionClient {
    http: reqwest::Client,
    base_url: String,
}

impl ReflexionClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_http(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn process(&self, request: &ProcessRequest) -> Result<ProcessResponse> {
        post_json(
            &self.http,
            &format!("{}/process-with-k8s-data", self.base_url),
            request,
        )
        .await
    }

    pub async fn feedback(&self, request: &FeedbackRequest) -> Result<FeedbackResponse> {
        post_json(
            &self.http,
            &format!("{}/execution-feedback", self.base_url),
            request,
        )
        .await
    }

    pub async fn health(&self) -> Result<serde_json::Value> {
        get_json(&self.http, &format!("{}/health", self.base_url)).await
    }

    pub async fn strategies(&self) -> Result<StrategiesResponse> {
        get_json(&self.http, &format!("{}/memory/strategies", self.base_url)).await
    }

    pub async fn episodes(&self, limit: usize) -> Result<EpisodesResponse> {
        get_json(
            &self.http,
            &format!("{}/memory/episodes?limit={limit}", self.base_url),
        )
        .await
    }

    pub async fn performance(&self, days: u32) -> Result<serde_json::Value> {
        get_json(
            &self.http,
            &format!("{}/memory/performance?days={days}", self.base_url),
        )
        .await
    }

    pub async fn statistics(&self) -> Result<serde_json::Value> {
        get_json(&self.http, &format!("{}/memory/statistics", self.base_url)).await
    }

    pub async fn clear(&self, what: &str) -> Result<ClearResponse> {
        let url = match what {
            "strategies" => format!("{}/memory/strategies", self.base_url),
            "episodes" => format!("{}/memory/episodes", self.base_url),
            _ => format!("{}/memory/clear", self.base_url),
        };
        let response = self.http.delete(&url).send().await?;
        if !response.status().is_success() {
            return Err(MenderError::Transient(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

/* ============================= EXECUTOR ============================= */

/// Typed client for the local command executor.
#[derive(Clone)]
pub struct ExecutorClient {
    http: reqwest::Client,
    base_url: String,
}

impl ExecutorClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_http(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn execute(&self, request: &ExecuteRequest) -> Result<ExecutionReport> {
        post_json(
            &self.http,
            &format!("{}/execute-commands", self.base_url),
            request,
        )
        .await
    }
}

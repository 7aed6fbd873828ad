//! Client for ARM-style REST providers with long-running operations.
//!
//! A PUT or DELETE that the provider cannot finish inline is answered with
//! `201`/`202` and an `Azure-AsyncOperation` or `Location` header. The URL in
//! that header is what gets persisted and polled; the resource URL travels
//! along in the poll payload so the result can be fetched afterwards.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, LOCATION, RETRY_AFTER};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use cloudop_async::{
    ClientError, CreateOutcome, Creator, Deleter, FutureHandler, OperationDescriptor,
    OperationKind, PollTarget, RequestMethod, ResourceSpec,
};

use crate::manifest::{ProviderResource, ResourceEntry};

const ASYNC_OPERATION_HEADER: &str = "azure-asyncoperation";
const RESOURCE_URL: &str = "resourceUrl";

/// Body of an operation status or a resource still provisioning
#[derive(Debug, Default, Deserialize)]
struct OperationStatus {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    properties: Option<ProvisioningProperties>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProvisioningProperties {
    #[serde(default)]
    provisioning_state: Option<String>,
}

impl OperationStatus {
    fn state(&self) -> Option<&str> {
        self.status.as_deref().or_else(|| {
            self.properties
                .as_ref()
                .and_then(|p| p.provisioning_state.as_deref())
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

pub struct ArmClient {
    http: Client,
    endpoint: String,
    api_version: String,
}

impl ArmClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_version: impl Into<String>,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_version: api_version.into(),
        })
    }

    fn resource_url(&self, spec: &ResourceEntry) -> String {
        format!(
            "{}/resourceGroups/{}/providers/{}/{}?api-version={}",
            self.endpoint, spec.group, spec.resource_type, spec.name, self.api_version
        )
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Response, ClientError> {
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|e| ClientError::transient(format!("{}: {}", url, e)))
    }

    /// Descriptor for an operation the provider accepted. Without an
    /// operation header the resource itself is polled.
    fn descriptor(
        &self,
        kind: OperationKind,
        spec: &ResourceEntry,
        method: RequestMethod,
        headers: &HeaderMap,
        resource_url: &str,
    ) -> OperationDescriptor {
        let poll_url = header_str(headers, ASYNC_OPERATION_HEADER)
            .or_else(|| header_str(headers, LOCATION.as_str()))
            .unwrap_or(resource_url);

        OperationDescriptor::new(
            kind,
            &spec.key(),
            PollTarget::new(method, poll_url).with_data(json!({ "resourceUrl": resource_url })),
        )
    }

    /// Poll the operation once, `None` while it is still running.
    async fn poll(&self, future: &OperationDescriptor) -> Result<Option<OperationStatus>, ClientError> {
        if future.poll.url.is_empty() {
            return Err(ClientError::InvalidDescriptor(format!(
                "{} operation on {} has no poll url",
                future.kind, future.resource_name
            )));
        }

        let response = self.send(Method::GET, &future.poll.url, None).await?;
        let status = response.status();

        if status == StatusCode::ACCEPTED {
            return Ok(None);
        }
        if status == StatusCode::NOT_FOUND && future.kind == OperationKind::Delete {
            // The deleted resource (or its operation) is gone
            return Ok(Some(OperationStatus::default()));
        }
        if !status.is_success() {
            return Err(classify(response).await);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::transient(e.to_string()))?;
        // An empty 200 (Location polling) means the operation is over
        let operation: OperationStatus = if body.iter().all(u8::is_ascii_whitespace) {
            OperationStatus::default()
        } else {
            serde_json::from_slice(&body).map_err(|e| {
                ClientError::transient(format!(
                    "unreadable operation status from {}: {}",
                    future.poll.url, e
                ))
            })?
        };

        debug!(
            poll_url = %future.poll.url,
            state = ?operation.state(),
            "Polled {} operation on {}", future.kind, future.resource_name
        );

        match operation.state() {
            Some(state) if is_in_progress(state) => Ok(None),
            _ => Ok(Some(operation)),
        }
    }
}

#[async_trait]
impl FutureHandler for ArmClient {
    type Output = ProviderResource;

    async fn is_done(&self, future: &OperationDescriptor) -> Result<bool, ClientError> {
        Ok(self.poll(future).await?.is_some())
    }

    async fn result(
        &self,
        future: &OperationDescriptor,
        kind: OperationKind,
    ) -> Result<Option<ProviderResource>, ClientError> {
        let Some(operation) = self.poll(future).await? else {
            return Err(ClientError::NotDone);
        };

        let failed = operation
            .state()
            .filter(|state| is_failed(state))
            .map(str::to_string);
        if let Some(state) = failed {
            let error = operation.error.unwrap_or_default();
            return Err(ClientError::OperationFailed {
                code: if error.code.is_empty() { state } else { error.code },
                message: error.message,
            });
        }

        if kind == OperationKind::Delete {
            return Ok(None);
        }

        let resource_url = future
            .poll
            .data
            .get(RESOURCE_URL)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ClientError::InvalidDescriptor(format!(
                    "{} operation on {} carries no resource url",
                    future.kind, future.resource_name
                ))
            })?;

        let response = self.send(Method::GET, resource_url, None).await?;
        if !response.status().is_success() {
            return Err(match classify(response).await {
                ClientError::NotFound(message) => ClientError::OperationFailed {
                    code: "ResourceMissing".to_string(),
                    message,
                },
                other => other,
            });
        }
        let resource = response
            .json::<ProviderResource>()
            .await
            .map_err(|e| ClientError::transient(format!("{}: {}", resource_url, e)))?;
        Ok(Some(resource))
    }
}

#[async_trait]
impl Creator<ResourceEntry> for ArmClient {
    async fn get(&self, spec: &ResourceEntry) -> Result<Option<ProviderResource>, ClientError> {
        let url = self.resource_url(spec);
        let response = self.send(Method::GET, &url, None).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(classify(response).await);
        }
        let resource = response
            .json()
            .await
            .map_err(|e| ClientError::transient(format!("{}: {}", url, e)))?;
        Ok(Some(resource))
    }

    async fn create_or_update_async(
        &self,
        spec: &ResourceEntry,
        existing: Option<&ProviderResource>,
    ) -> Result<CreateOutcome<ProviderResource>, ClientError> {
        let url = self.resource_url(spec);
        let body = spec.parameters(existing);
        let kind = if existing.is_some() {
            OperationKind::Update
        } else {
            OperationKind::Create
        };

        let response = self.send(Method::PUT, &url, Some(&body)).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify(response).await);
        }

        let headers = response.headers();
        if header_str(headers, ASYNC_OPERATION_HEADER).is_some()
            || header_str(headers, LOCATION.as_str()).is_some()
        {
            return Ok(CreateOutcome::Started(self.descriptor(
                kind,
                spec,
                RequestMethod::Put,
                headers,
                &url,
            )));
        }

        let resource: ProviderResource = response
            .json()
            .await
            .map_err(|e| ClientError::transient(format!("{}: {}", url, e)))?;

        if resource.provisioning_state().is_some_and(is_in_progress) {
            return Ok(CreateOutcome::Started(self.descriptor(
                kind,
                spec,
                RequestMethod::Put,
                &HeaderMap::new(),
                &url,
            )));
        }
        Ok(CreateOutcome::Completed(resource))
    }
}

#[async_trait]
impl Deleter<ResourceEntry> for ArmClient {
    async fn delete_async(
        &self,
        spec: &ResourceEntry,
    ) -> Result<Option<OperationDescriptor>, ClientError> {
        let url = self.resource_url(spec);
        let response = self.send(Method::DELETE, &url, None).await?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT | StatusCode::OK => Ok(None),
            StatusCode::ACCEPTED => Ok(Some(self.descriptor(
                OperationKind::Delete,
                spec,
                RequestMethod::Delete,
                response.headers(),
                &url,
            ))),
            _ => Err(classify(response).await),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn is_in_progress(state: &str) -> bool {
    matches!(
        state.to_ascii_lowercase().as_str(),
        "inprogress" | "accepted" | "running" | "creating" | "updating" | "deleting"
    )
}

fn is_failed(state: &str) -> bool {
    matches!(
        state.to_ascii_lowercase().as_str(),
        "failed" | "canceled" | "cancelled"
    )
}

/// Retry-After in seconds; HTTP dates are not honoured.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_str(headers, RETRY_AFTER.as_str())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map an unsuccessful response onto the client error taxonomy.
async fn classify(response: Response) -> ClientError {
    let status = response.status();
    let url = response.url().to_string();
    let retry_after = retry_after(response.headers());
    let error = response
        .json::<ErrorResponse>()
        .await
        .map(|e| e.error)
        .unwrap_or_default();

    if status == StatusCode::NOT_FOUND {
        return ClientError::NotFound(if error.message.is_empty() {
            url
        } else {
            error.message
        });
    }

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        return ClientError::Transient {
            message: format!("{} from {}: {}", status, url, error.message),
            retry_after,
        };
    }

    ClientError::Rejected {
        code: if error.code.is_empty() {
            status.as_u16().to_string()
        } else {
            error.code
        },
        message: error.message,
    }
}

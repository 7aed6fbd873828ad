use async_trait::async_trait;
use reqwest::Client;

use cloudop_hooks::{ExtensionHandler, Hook, HookError, HookRequest, HookResponse};

use crate::manifest::ExtensionEntry;

/// Extension reached by POSTing the hook request as JSON to a URL
pub struct HttpExtension {
    name: String,
    url: String,
    hooks: Vec<Hook>,
    http: Client,
}

impl HttpExtension {
    pub fn new(entry: &ExtensionEntry, http: Client) -> Self {
        Self {
            name: entry.name.clone(),
            url: entry.url.clone(),
            hooks: entry.hooks.clone(),
            http,
        }
    }

    fn transport(&self, request: &HookRequest, message: impl Into<String>) -> HookError {
        HookError::Transport {
            hook: request.hook,
            handler: self.name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl ExtensionHandler for HttpExtension {
    fn name(&self) -> &str {
        &self.name
    }

    fn hooks(&self) -> &[Hook] {
        &self.hooks
    }

    async fn call(&self, request: &HookRequest) -> Result<HookResponse, HookError> {
        let response = self
            .http
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport(request, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.transport(request, format!("{} from {}", status, self.url)));
        }

        response
            .json::<HookResponse>()
            .await
            .map_err(|e| self.transport(request, format!("invalid response: {}", e)))
    }
}

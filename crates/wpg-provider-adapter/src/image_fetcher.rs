use crate::ProviderAdapterError;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;
use url::Url;
use wpg_core::{ImageFetcher, ProviderError, ProviderFailureKind};

const PLACEHOLDERS: [&str; 4] = ["{prompt}", "{width}", "{height}", "{seed}"];

/// Fills `{prompt}`, `{width}`, `{height}` and `{seed}`. The prompt is
/// percent-encoded with spaces as `%20`.
pub fn render_url_template(
    template: &str,
    prompt: &str,
    width: u32,
    height: u32,
    seed: u64,
) -> Result<Url, ProviderAdapterError> {
    let encoded = url::form_urlencoded::byte_serialize(prompt.as_bytes())
        .collect::<String>()
        .replace('+', "%20");
    let rendered = template
        .replace("{prompt}", &encoded)
        .replace("{width}", &width.to_string())
        .replace("{height}", &height.to_string())
        .replace("{seed}", &seed.to_string());
    Ok(Url::parse(&rendered)?)
}

/// HTTP GET image backend addressed through a URL template.
#[derive(Debug, Clone)]
pub struct UrlTemplateImageFetcher {
    template: String,
    client: Client,
}

impl UrlTemplateImageFetcher {
    pub fn new(template: impl Into<String>, timeout: Duration) -> Result<Self, ProviderAdapterError> {
        let client = Client::builder().timeout(timeout).build()?;
        Self::with_client(template, client)
    }

    pub fn with_client(
        template: impl Into<String>,
        client: Client,
    ) -> Result<Self, ProviderAdapterError> {
        let template = template.into();
        if !template.contains("{prompt}") {
            return Err(ProviderAdapterError::Template(format!(
                "{template:?} has no {{prompt}} placeholder"
            )));
        }
        // Catch malformed templates at startup instead of on the first fetch.
        render_url_template(&template, "probe", 1, 1, 0)?;
        Ok(Self { template, client })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn placeholders_used(&self) -> Vec<&'static str> {
        PLACEHOLDERS
            .into_iter()
            .filter(|placeholder| self.template.contains(placeholder))
            .collect()
    }
}

impl ImageFetcher for UrlTemplateImageFetcher {
    fn fetch(
        &self,
        prompt: &str,
        width: u32,
        height: u32,
        seed: u64,
    ) -> Result<Vec<u8>, ProviderError> {
        let url = render_url_template(&self.template, prompt, width, height, seed)
            .map_err(|err| ProviderError::new(ProviderFailureKind::Other, err.to_string()))?;
        debug!(host = url.host_str().unwrap_or(""), seed, "requesting image");

        let response = self.client.get(url).send().map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::new(
                status_kind(status),
                format!("image backend answered {status}"),
            ));
        }

        let bytes = response.bytes().map_err(request_error)?;
        if bytes.is_empty() {
            return Err(ProviderError::new(
                ProviderFailureKind::InvalidOutput,
                "image backend returned an empty body",
            ));
        }
        Ok(bytes.to_vec())
    }
}

fn status_kind(status: StatusCode) -> ProviderFailureKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderFailureKind::Auth,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::PAYMENT_REQUIRED => ProviderFailureKind::Quota,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderFailureKind::Timeout,
        status if status.is_server_error() => ProviderFailureKind::Network,
        _ => ProviderFailureKind::Other,
    }
}

fn request_error(err: reqwest::Error) -> ProviderError {
    let kind = if err.is_timeout() {
        ProviderFailureKind::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        ProviderFailureKind::Network
    } else {
        ProviderFailureKind::Other
    };
    ProviderError::new(kind, err.to_string())
}

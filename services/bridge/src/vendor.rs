//! Vendor HTTP API Client
//!
//! Implements the identity provider (agent login and token refresh) and the
//! media-transfer endpoints (upload ticket and signed multipart POST) on top of
//! `reqwest`. None of the calls retry.

use crate::config::VendorSettings;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chatbridge_core::{
    directory::Credentials,
    identity::{AccessGrant, IdentityProvider},
    upload::{FILE_FIELD, MediaTransfer, UploadForm, UploadTicket},
};
use reqwest::{
    Client, RequestBuilder,
    header::{LOCATION, ORIGIN, REFERER, USER_AGENT},
    multipart::{Form, Part},
    redirect,
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/69.0.3497.100 Safari/537.36";

#[derive(Deserialize, Debug)]
struct EndpointList {
    chatserver: String,
}

#[derive(Deserialize, Debug)]
struct AccessResponse {
    #[serde(default)]
    ok: bool,
    access_token: Option<String>,
    endpoint_list: Option<EndpointList>,
}

impl AccessResponse {
    fn into_grant(self, call: &str) -> Result<AccessGrant> {
        if !self.ok {
            return Err(anyhow!("{call} rejected by vendor"));
        }
        Ok(AccessGrant {
            access_token: SecretString::from(
                self.access_token
                    .with_context(|| format!("{call} response has no access_token"))?,
            ),
            chat_server_host: self
                .endpoint_list
                .with_context(|| format!("{call} response has no endpoint_list"))?
                .chatserver,
        })
    }
}

/// Client for the vendor's auth and media-transfer API.
#[derive(Clone)]
pub struct VendorApi {
    client: Client,
    /// Storage uploads must not follow redirects: the final object URL is the
    /// `Location` header of the storage response itself.
    upload_client: Client,
    settings: VendorSettings,
}

impl VendorApi {
    pub fn new(settings: VendorSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .build()
            .context("Failed to build vendor HTTP client")?;
        let upload_client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .redirect(redirect::Policy::none())
            .build()
            .context("Failed to build storage HTTP client")?;
        Ok(Self {
            client,
            upload_client,
            settings,
        })
    }

    fn with_origin(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(ORIGIN, &self.settings.app_origin)
            .header(REFERER, &self.settings.app_origin)
    }

    async fn access_call(&self, path: &str, form: &[(&str, &str)], call: &str) -> Result<AccessGrant> {
        let url = format!("{}{}", self.settings.api_base, path);
        debug!(%url, "Calling vendor auth endpoint");
        let response: AccessResponse = self
            .with_origin(self.client.post(&url))
            .form(form)
            .send()
            .await
            .with_context(|| format!("{call} request failed"))?
            .json()
            .await
            .with_context(|| format!("{call} response is not valid JSON"))?;
        response.into_grant(call)
    }
}

#[async_trait]
impl IdentityProvider for VendorApi {
    async fn login(&self, credentials: &Credentials) -> Result<AccessGrant> {
        self.access_call(
            "/api/1.0/auth/agent/access",
            &[
                ("login", credentials.login.as_str()),
                ("password", credentials.password.expose_secret()),
            ],
            "login",
        )
        .await
    }

    async fn refresh(&self, access_token: &SecretString) -> Result<AccessGrant> {
        self.access_call(
            "/api/1.0/auth/access/refresh",
            &[("token", access_token.expose_secret())],
            "token refresh",
        )
        .await
    }
}

#[async_trait]
impl MediaTransfer for VendorApi {
    async fn request_ticket(&self, access_token: &SecretString, extension: &str) -> Result<UploadTicket> {
        let url = format!(
            "{}/api/1.0/sites/{}/rmo/media/transfer/access/gain",
            self.settings.api_base, self.settings.site_id
        );
        let body: Value = self
            .with_origin(self.client.get(&url))
            .query(&[("extension", extension), ("allow_content_type", "1")])
            .header(reqwest::header::AUTHORIZATION, access_token.expose_secret())
            .send()
            .await
            .context("upload ticket request failed")?
            .json()
            .await
            .context("upload ticket response is not valid JSON")?;

        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            return Err(anyhow!("upload ticket endpoint answered not ok"));
        }
        serde_json::from_value(body).context("upload ticket response is incomplete")
    }

    async fn upload(&self, form: UploadForm) -> Result<Option<String>> {
        let mut multipart = Form::new();
        for (name, value) in form.fields {
            multipart = multipart.text(name, value);
        }
        let file = Part::bytes(form.file.bytes.to_vec())
            .file_name(form.file.name)
            .mime_str(&form.file.mime_type)
            .context("attachment has an invalid mime type")?;
        multipart = multipart.part(FILE_FIELD, file);

        let response = self
            .with_origin(self.upload_client.post(&form.url))
            .multipart(multipart)
            .send()
            .await
            .context("storage upload request failed")?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        info!(status = %response.status(), ?location, "Storage upload finished");
        Ok(location)
    }
}

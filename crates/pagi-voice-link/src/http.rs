//! HTTP credential issuer and handshake relay.

use crate::config::EndpointConfig;
use crate::error::{VoiceLinkError, VoiceLinkResult};
use crate::transport::{CredentialIssuer, CredentialRequest, HandshakeRelay, SessionCredential};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

fn build_client(endpoints: &EndpointConfig) -> VoiceLinkResult<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(endpoints.request_timeout())
        .build()?)
}

/// POSTs `{ voicePreference, fastPath }` and expects `{ shortLivedCredential, expiry }`.
#[derive(Debug, Clone)]
pub struct HttpCredentialIssuer {
    client: reqwest::Client,
    url: String,
}

impl HttpCredentialIssuer {
    pub fn new(endpoints: &EndpointConfig) -> VoiceLinkResult<Self> {
        Ok(Self {
            client: build_client(endpoints)?,
            url: endpoints.credential_url.clone(),
        })
    }
}

#[async_trait]
impl CredentialIssuer for HttpCredentialIssuer {
    async fn issue(&self, request: &CredentialRequest) -> VoiceLinkResult<SessionCredential> {
        let res = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| VoiceLinkError::Authentication(format!("credential issuer unavailable: {e}")))?;

        let status = res.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(VoiceLinkError::Authentication(format!(
                "credential issuer rejected the request ({status})"
            )));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceLinkError::Authentication(format!(
                "credential issuer error {status}: {body}"
            )));
        }

        let credential: SessionCredential = res
            .json()
            .await
            .map_err(|e| VoiceLinkError::Authentication(format!("missing or invalid credential: {e}")))?;
        if !credential.is_usable(Utc::now()) {
            return Err(VoiceLinkError::Authentication(
                "credential is blank or already expired".to_string(),
            ));
        }
        debug!(target: "pagi::voice_link::http", expiry = ?credential.expiry, "Credential issued");
        Ok(credential)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RelayRequest<'a> {
    local_offer_description: &'a str,
    short_lived_credential: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayAnswer {
    remote_answer_description: String,
}

/// POSTs `{ localOfferDescription, shortLivedCredential }`. The answer is the raw body, or
/// `remoteAnswerDescription` when the relay wraps it in JSON.
#[derive(Debug, Clone)]
pub struct HttpHandshakeRelay {
    client: reqwest::Client,
    url: String,
}

impl HttpHandshakeRelay {
    pub fn new(endpoints: &EndpointConfig) -> VoiceLinkResult<Self> {
        Ok(Self {
            client: build_client(endpoints)?,
            url: endpoints.relay_url.clone(),
        })
    }
}

#[async_trait]
impl HandshakeRelay for HttpHandshakeRelay {
    async fn exchange(&self, offer: &str, credential: &SessionCredential) -> VoiceLinkResult<String> {
        let res = self
            .client
            .post(&self.url)
            .json(&RelayRequest {
                local_offer_description: offer,
                short_lived_credential: &credential.short_lived_credential,
            })
            .send()
            .await
            .map_err(|e| VoiceLinkError::Transport(format!("handshake relay unreachable: {e}")))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceLinkError::Transport(format!(
                "handshake relay error {status}: {body}"
            )));
        }

        let body = res
            .text()
            .await
            .map_err(|e| VoiceLinkError::Transport(format!("handshake relay body: {e}")))?;
        let answer = match serde_json::from_str::<RelayAnswer>(&body) {
            Ok(wrapped) => wrapped.remote_answer_description,
            Err(_) => body,
        };
        if answer.trim().is_empty() {
            return Err(VoiceLinkError::Transport("handshake relay returned an empty answer".to_string()));
        }
        Ok(answer)
    }
}

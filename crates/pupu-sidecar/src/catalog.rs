use crate::config::{MISO_AUTH_HEADER, MISO_MODELS_CATALOG_ENDPOINT, MISO_TOOLKITS_CATALOG_ENDPOINT};
use crate::error::{upstream_error_message, Result, SidecarError};
use crate::supervisor::SidecarEndpoint;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogKind {
    Models,
    Toolkits,
}

impl CatalogKind {
    fn path(self) -> &'static str {
        match self {
            CatalogKind::Models => MISO_MODELS_CATALOG_ENDPOINT,
            CatalogKind::Toolkits => MISO_TOOLKITS_CATALOG_ENDPOINT,
        }
    }

    fn label(self) -> &'static str {
        match self {
            CatalogKind::Models => "model",
            CatalogKind::Toolkits => "toolkit",
        }
    }
}

/// Fetch a catalog from a ready sidecar. `endpoint` is `None` when not ready.
pub async fn fetch_catalog(
    client: &reqwest::Client,
    endpoint: Option<&SidecarEndpoint>,
    kind: CatalogKind,
) -> Result<Value> {
    let endpoint = endpoint.ok_or_else(SidecarError::not_ready)?;
    let url = format!("{}{}", endpoint.base_url, kind.path());

    let response = client
        .get(&url)
        .header(MISO_AUTH_HEADER, &endpoint.auth_token)
        .send()
        .await?;
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        let fallback = format!(
            "Miso {} catalog request failed ({})",
            kind.label(),
            status.as_u16()
        );
        return Err(SidecarError::Upstream {
            status: status.as_u16(),
            message: upstream_error_message(&body, fallback),
        });
    }

    if body.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(&body).map_err(|_| {
        SidecarError::InvalidResponse(format!("Invalid Miso {} catalog response", kind.label()))
    })
}

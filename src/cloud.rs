//! HTTP client for the Cumulocity REST endpoints the proxy needs.
//!
//! [`CloudClient`] wraps `reqwest::Client` and provides exactly three
//! operations: obtain a bearer ([`CloudClient::login`]), resolve a device's
//! internal id from its external identity ([`CloudClient::resolve_device`]),
//! and build the tunnel WebSocket URL from the device's remote access
//! configuration ([`CloudClient::tunnel_url`]).
//!
//! ## Error handling
//!
//! Non-2xx responses are mapped onto the crate taxonomy: 401/403 become
//! [`ProxyError::Auth`] (or [`ProxyError::TfaRequired`] when the body names a
//! missing TFA code), lookup misses become [`ProxyError::DeviceNotFound`] /
//! [`ProxyError::DeviceAmbiguous`], and transport failures or 5xx become
//! [`ProxyError::Transport`].

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::config::Credentials;
use crate::error::ProxyError;

/// Remote access configurations must use this protocol to be tunnelable.
const PASSTHROUGH: &str = "PASSTHROUGH";
/// Managed object fragment holding the remote access configurations.
const REMOTE_ACCESS_FRAGMENT: &str = "c8y_RemoteAccessList";

/// REST client bound to one cloud host and one credential snapshot.
pub struct CloudClient {
    http: reqwest::Client,
    credentials: Credentials,
}

impl CloudClient {
    /// Build the client. TLS verification is disabled only when the user
    /// explicitly asked for it (`--ssl-ignore-verify`).
    pub fn new(credentials: Credentials, verify_tls: bool) -> Result<Self, ProxyError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| ProxyError::Transport(format!("could not build HTTP client: {e}")))?;
        Ok(Self { http, credentials })
    }

    /// Obtain a bearer token.
    ///
    /// A configured token is validated against `/tenant/currentTenant` and
    /// reused. Otherwise an OAuth password login is performed (with the TFA
    /// code when given); the bearer comes back in the `authorization` cookie.
    pub async fn login(&self) -> Result<String, ProxyError> {
        if let Some(token) = self.credentials.token.clone() {
            match self.current_tenant(&token).await {
                Ok(tenant) => {
                    debug!("existing token accepted for tenant {tenant}");
                    return Ok(token);
                }
                Err(ProxyError::Auth(_)) if self.credentials.password.is_some() => {
                    info!("configured token was rejected, retrying with password login");
                }
                Err(e) => return Err(e),
            }
        }

        let user = self.credentials.user.clone().ok_or_else(|| {
            ProxyError::Config("no token and no username given (--user or C8Y_USER)".into())
        })?;
        let password = self.credentials.password.clone().ok_or_else(|| {
            ProxyError::Config("no token and no password given (--password or C8Y_PASSWORD)".into())
        })?;
        let tenant = match self.credentials.tenant.clone() {
            Some(t) => t,
            None => self.discover_tenant(&user, &password).await?,
        };

        let mut url = self.url(&["tenant", "oauth"])?;
        url.query_pairs_mut().append_pair("tenant_id", &tenant);

        let mut form = vec![
            ("grant_type", "PASSWORD".to_string()),
            ("username", user),
            ("password", password),
        ];
        if let Some(code) = self.credentials.tfa_code.clone() {
            form.push(("tfa_code", code));
        }

        let resp = self
            .http
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("login request failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            return extract_bearer_cookie(&resp).ok_or_else(|| {
                ProxyError::Transport("login response carried no authorization cookie".into())
            });
        }

        let body = resp.text().await.unwrap_or_default();
        if status.as_u16() == 401 && mentions_tfa(&body) {
            return Err(ProxyError::TfaRequired);
        }
        match status.as_u16() {
            401 | 403 => Err(ProxyError::Auth(error_message(&body))),
            code if (500..600).contains(&code) => Err(ProxyError::Transport(format!(
                "login failed with HTTP {code}: {}",
                error_message(&body)
            ))),
            code => Err(ProxyError::Auth(format!(
                "login failed with HTTP {code}: {}",
                error_message(&body)
            ))),
        }
    }

    /// Resolve a device's internal id from its external identity. Falls back
    /// to an inventory query by name when the identity index has no entry.
    pub async fn resolve_device(
        &self,
        token: &str,
        external_id: &str,
        external_type: &str,
    ) -> Result<String, ProxyError> {
        let url = self.url(&["identity", "externalIds", external_type, external_id])?;
        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("identity lookup failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            let body: Value = json_body(resp).await?;
            return id_field(&body["managedObject"]).ok_or_else(|| {
                ProxyError::Transport("identity entry carried no managed object id".into())
            });
        }
        if status.as_u16() == 404 {
            debug!("no identity entry of type {external_type} for {external_id}, querying by name");
            return self.find_device_by_name(token, external_id).await;
        }
        Err(status_error(status.as_u16(), resp).await)
    }

    /// Build the tunnel WebSocket URL from the device's remote access
    /// configurations. Picks the configuration matching `config_name`, or the
    /// first PASSTHROUGH configuration when no name is given.
    pub async fn tunnel_url(
        &self,
        token: &str,
        device: &str,
        device_id: &str,
        config_name: Option<&str>,
    ) -> Result<String, ProxyError> {
        let url = self.url(&["inventory", "managedObjects", device_id])?;
        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("managed object fetch failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            if status.as_u16() == 404 {
                return Err(ProxyError::DeviceNotFound(device.to_string()));
            }
            return Err(status_error(status.as_u16(), resp).await);
        }

        let body: Value = json_body(resp).await?;
        let config_id = select_passthrough_config(&body, device, config_name)?;
        build_tunnel_url(&self.credentials.host, device_id, &config_id)
    }

    /// `GET /tenant/currentTenant` with a bearer: token validation plus
    /// tenant name discovery.
    async fn current_tenant(&self, token: &str) -> Result<String, ProxyError> {
        let url = self.url(&["tenant", "currentTenant"])?;
        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("tenant lookup failed: {e}")))?;
        self.tenant_from_response(resp).await
    }

    /// Tenant discovery with basic auth, used when no tenant id is configured
    /// for the password login.
    async fn discover_tenant(&self, user: &str, password: &str) -> Result<String, ProxyError> {
        let url = self.url(&["tenant", "currentTenant"])?;
        let resp = self
            .http
            .get(url)
            .basic_auth(user, Some(password))
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("tenant lookup failed: {e}")))?;
        self.tenant_from_response(resp).await
    }

    async fn tenant_from_response(&self, resp: reqwest::Response) -> Result<String, ProxyError> {
        let status = resp.status();
        if status.is_success() {
            let body: Value = json_body(resp).await?;
            return body["name"]
                .as_str()
                .map(String::from)
                .ok_or_else(|| ProxyError::Transport("tenant response carried no name".into()));
        }
        Err(status_error(status.as_u16(), resp).await)
    }

    async fn find_device_by_name(&self, token: &str, name: &str) -> Result<String, ProxyError> {
        let mut url = self.url(&["inventory", "managedObjects"])?;
        url.query_pairs_mut()
            .append_pair("query", &format!("$filter=(name eq '{name}')"))
            .append_pair("pageSize", "2");

        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("inventory query failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status.as_u16(), resp).await);
        }
        let body: Value = json_body(resp).await?;
        let matches = body["managedObjects"].as_array().cloned().unwrap_or_default();
        match matches.len() {
            0 => Err(ProxyError::DeviceNotFound(name.to_string())),
            1 => id_field(&matches[0])
                .ok_or_else(|| ProxyError::Transport("managed object carried no id".into())),
            _ => Err(ProxyError::DeviceAmbiguous(name.to_string())),
        }
    }

    /// Join path segments onto the base URL with proper percent-encoding.
    fn url(&self, segments: &[&str]) -> Result<reqwest::Url, ProxyError> {
        let mut url = reqwest::Url::parse(&self.credentials.host)
            .map_err(|e| ProxyError::Config(format!("invalid host URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| ProxyError::Config("host URL cannot carry a path".into()))?
            .extend(segments);
        Ok(url)
    }
}

/// Map a non-2xx REST response onto the taxonomy.
async fn status_error(code: u16, resp: reqwest::Response) -> ProxyError {
    let body = resp.text().await.unwrap_or_default();
    match code {
        401 | 403 => ProxyError::Auth(error_message(&body)),
        code if (500..600).contains(&code) => {
            ProxyError::Transport(format!("HTTP {code}: {}", error_message(&body)))
        }
        code => ProxyError::Transport(format!(
            "unexpected HTTP {code}: {}",
            error_message(&body)
        )),
    }
}

/// Build the WebSocket URL for a device's remote access configuration,
/// mapping the REST scheme onto the WebSocket one.
pub fn build_tunnel_url(
    host: &str,
    device_id: &str,
    config_id: &str,
) -> Result<String, ProxyError> {
    let ws_base = if let Some(rest) = host.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = host.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(ProxyError::Config(format!("invalid host URL scheme: {host}")));
    };
    Ok(format!(
        "{ws_base}/service/remoteaccess/client/{device_id}/{config_id}"
    ))
}

/// Pick the remote access configuration id to tunnel through.
fn select_passthrough_config(
    mor: &Value,
    device: &str,
    config_name: Option<&str>,
) -> Result<String, ProxyError> {
    let Some(configs) = mor[REMOTE_ACCESS_FRAGMENT].as_array() else {
        return Err(ProxyError::DeviceNotFound(format!(
            "{device} has no remote access configuration"
        )));
    };
    let passthrough: Vec<&Value> = configs
        .iter()
        .filter(|c| c["protocol"].as_str() == Some(PASSTHROUGH))
        .collect();
    if passthrough.is_empty() {
        return Err(ProxyError::DeviceNotFound(format!(
            "{device} has no {PASSTHROUGH} remote access configuration"
        )));
    }

    let chosen = match config_name {
        None => passthrough[0],
        Some(name) => passthrough
            .iter()
            .find(|c| {
                c["name"]
                    .as_str()
                    .is_some_and(|n| n.eq_ignore_ascii_case(name))
            })
            .copied()
            .ok_or_else(|| {
                ProxyError::DeviceNotFound(format!(
                    "{device} has no {PASSTHROUGH} remote access configuration named {name}"
                ))
            })?,
    };

    debug!(
        "using remote access configuration {} (port {})",
        chosen["name"].as_str().unwrap_or("<unnamed>"),
        chosen["port"].as_u64().unwrap_or(0)
    );
    id_field(chosen)
        .ok_or_else(|| ProxyError::Transport("remote access configuration carried no id".into()))
}

/// Managed object ids come back as strings or numbers depending on the API.
fn id_field(value: &Value) -> Option<String> {
    value["id"]
        .as_str()
        .map(String::from)
        .or_else(|| value["id"].as_u64().map(|n| n.to_string()))
}

async fn json_body(resp: reqwest::Response) -> Result<Value, ProxyError> {
    resp.json()
        .await
        .map_err(|e| ProxyError::Transport(format!("invalid JSON from cloud: {e}")))
}

/// Extract the bearer from the login response's `authorization` cookie.
fn extract_bearer_cookie(resp: &reqwest::Response) -> Option<String> {
    for header in resp.headers().get_all(reqwest::header::SET_COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        let first = raw.split(';').next().unwrap_or(raw);
        if let Some((name, value)) = first.split_once('=') {
            if name.trim() == "authorization" && !value.is_empty() {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

/// Best-effort extraction of the `message` field from a JSON error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["message"].as_str().map(String::from))
        .unwrap_or_else(|| {
            if body.is_empty() {
                "no details".to_string()
            } else {
                body.to_string()
            }
        })
}

fn mentions_tfa(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("tfa") || lower.contains("totp") || lower.contains("pin")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tunnel_url_maps_schemes() {
        assert_eq!(
            build_tunnel_url("https://example.c8y.io", "100", "ra1").unwrap(),
            "wss://example.c8y.io/service/remoteaccess/client/100/ra1"
        );
        assert_eq!(
            build_tunnel_url("http://127.0.0.1:9000", "100", "ra1").unwrap(),
            "ws://127.0.0.1:9000/service/remoteaccess/client/100/ra1"
        );
        assert!(build_tunnel_url("example.c8y.io", "100", "ra1").is_err());
    }

    #[test]
    fn passthrough_config_selection() {
        let mor = json!({
            "id": "100",
            "name": "device01",
            "c8y_RemoteAccessList": [
                {"id": "vnc1", "name": "vnc", "protocol": "VNC", "port": 5900},
                {"id": "ssh1", "name": "ssh", "protocol": "PASSTHROUGH", "port": 22},
                {"id": "ssh2", "name": "backup", "protocol": "PASSTHROUGH", "port": 2022},
            ]
        });
        // First PASSTHROUGH config when no name is given, VNC is skipped.
        assert_eq!(select_passthrough_config(&mor, "device01", None).unwrap(), "ssh1");
        // Name match is case-insensitive.
        assert_eq!(
            select_passthrough_config(&mor, "device01", Some("Backup")).unwrap(),
            "ssh2"
        );
        let err = select_passthrough_config(&mor, "device01", Some("missing")).unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn missing_fragment_is_not_found() {
        let mor = json!({"id": "100", "name": "device01"});
        let err = select_passthrough_config(&mor, "device01", None).unwrap_err();
        assert_eq!(err.exit_code(), 4);

        let no_passthrough = json!({
            "id": "100",
            "c8y_RemoteAccessList": [{"id": "vnc1", "protocol": "VNC"}]
        });
        let err = select_passthrough_config(&no_passthrough, "device01", None).unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn id_field_accepts_strings_and_numbers() {
        assert_eq!(id_field(&json!({"id": "42"})).as_deref(), Some("42"));
        assert_eq!(id_field(&json!({"id": 42})).as_deref(), Some("42"));
        assert_eq!(id_field(&json!({})), None);
    }

    #[test]
    fn error_message_prefers_json_message_field() {
        assert_eq!(
            error_message(r#"{"error":"x","message":"bad credentials"}"#),
            "bad credentials"
        );
        assert_eq!(error_message("plain text"), "plain text");
        assert_eq!(error_message(""), "no details");
    }
}

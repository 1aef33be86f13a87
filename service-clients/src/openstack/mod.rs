use std::collections::BTreeMap;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum OpenStackError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("no {service} endpoint for region {region} in the service catalog")]
    MissingEndpoint {
        service: String,
        region: String,
    },
    #[error("{kind} {name} not found")]
    NotFound {
        kind: String,
        name: String,
    },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid url {url}: {reason}")]
    InvalidUrl {
        url: String,
        reason: String,
    },
    #[error("server responded {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },
}

/// Password credentials for keystone v3
#[derive(Debug, Clone, Default)]
pub struct OpenStackAuth {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_name: String,
    pub user_domain_name: String,
    pub project_domain_name: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CatalogEntry {
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub endpoints: Vec<CatalogEndpoint>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CatalogEndpoint {
    pub interface: String,
    #[serde(default)]
    pub region: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone)]
struct Session {
    token: String,
    catalog: Vec<CatalogEntry>,
}

/// Public endpoint of `service_type` in `region`, trailing slashes removed
pub fn find_endpoint(catalog: &[CatalogEntry], service_type: &str, region: &str) -> Option<String> {
    catalog.iter()
        .filter(|entry| entry.service_type == service_type)
        .flat_map(|entry| entry.endpoints.iter())
        .find(|ep| ep.interface == "public" && ep.region.as_deref() == Some(region))
        .map(|ep| ep.url.trim_end_matches('/').to_string())
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NamedResource {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerAddress {
    pub addr: String,
    #[serde(default)]
    pub version: u8,
    #[serde(rename = "OS-EXT-IPS:type", default)]
    pub ip_type: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ServerFault {
    #[serde(default)]
    pub message: String,
}

/// The fields of a nova server the launcher cares about
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Server {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub addresses: BTreeMap<String, Vec<ServerAddress>>,
    #[serde(rename = "OS-EXT-SRV-ATTR:host", default)]
    pub host: Option<String>,
    #[serde(rename = "OS-EXT-SRV-ATTR:instance_name", default)]
    pub instance_name: Option<String>,
    #[serde(default)]
    pub fault: Option<ServerFault>,
}

impl Server {
    /// First fixed (private) ipv4 address over all attached networks
    pub fn fixed_address(&self) -> Option<String> {
        self.addresses.values()
            .flatten()
            .find(|a| a.version != 6 && a.ip_type.as_deref().unwrap_or("fixed") == "fixed")
            .map(|a| a.addr.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewServer {
    pub name: String,
    pub image_ref: String,
    pub flavor_ref: String,
    pub key_name: String,
    pub security_groups: Vec<String>,
    pub network_id: Option<String>,
    /// passed on as the `force_hosts` scheduler hint
    pub force_host: Option<String>,
}

impl NewServer {
    pub fn to_body(&self) -> Value {
        let security_groups: Vec<Value> = self.security_groups.iter()
            .map(|name| json!({ "name": name }))
            .collect();
        let mut server = json!({
            "name": self.name,
            "imageRef": self.image_ref,
            "flavorRef": self.flavor_ref,
            "key_name": self.key_name,
            "security_groups": security_groups,
        });
        if let Some(network) = &self.network_id {
            server["networks"] = json!([{ "uuid": network }]);
        }
        let mut body = json!({ "server": server });
        if let Some(host) = &self.force_host {
            body["os:scheduler_hints"] = json!({ "force_hosts": host });
        }
        body
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSecurityGroupRule {
    pub security_group_id: String,
    pub protocol: String,
    pub port_range: Option<(u16, u16)>,
    pub remote_ip_prefix: String,
}

impl NewSecurityGroupRule {
    pub fn to_body(&self) -> Value {
        let mut rule = json!({
            "security_group_id": self.security_group_id,
            "direction": "ingress",
            "ethertype": "IPv4",
            "protocol": self.protocol,
            "remote_ip_prefix": self.remote_ip_prefix,
        });
        if let Some((min, max)) = self.port_range {
            rule["port_range_min"] = json!(min);
            rule["port_range_max"] = json!(max);
        }
        json!({ "security_group_rule": rule })
    }
}

/// A small client for the parts of keystone, nova, glance and neutron used to launch the overlay
/// VMs. The token is fetched on first use and fetched again once if a request is rejected as
/// unauthorised.
pub struct OpenStackClient {
    http: Client,
    auth: OpenStackAuth,
    session: Mutex<Option<Session>>,
}

impl OpenStackClient {
    pub fn new(auth: OpenStackAuth) -> Self {
        Self {
            http: Client::new(),
            auth,
            session: Mutex::new(None),
        }
    }

    async fn authenticate(&self) -> Result<Session, OpenStackError> {
        let url = format!("{}/auth/tokens", self.auth.auth_url.trim_end_matches('/'));
        tracing::debug!("authenticating {} against {url}", self.auth.username);
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.auth.username,
                            "domain": { "name": self.auth.user_domain_name },
                            "password": self.auth.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.auth.project_name,
                        "domain": { "name": self.auth.project_domain_name },
                    }
                }
            }
        });
        let resp = self.http.post(url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(OpenStackError::Auth(format!("{status}: {text}")));
        }
        let token = resp.headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or_else(|| OpenStackError::Auth("no X-Subject-Token in the keystone response".into()))?;
        let body: Value = resp.json().await?;
        let catalog: Vec<CatalogEntry> = serde_json::from_value(body["token"]["catalog"].clone())
            .map_err(|e| OpenStackError::Auth(format!("could not read the service catalog: {e}")))?;
        Ok(Session { token, catalog })
    }

    async fn session(&self, refresh: bool) -> Result<Session, OpenStackError> {
        let mut guard = self.session.lock().await;
        if refresh || guard.is_none() {
            *guard = Some(self.authenticate().await?);
        }
        guard.clone().ok_or_else(|| OpenStackError::Auth("no session".into()))
    }

    async fn endpoint(&self, service_type: &str, region: &str) -> Result<String, OpenStackError> {
        let session = self.session(false).await?;
        find_endpoint(&session.catalog, service_type, region)
            .ok_or_else(|| OpenStackError::MissingEndpoint {
                service: service_type.to_string(),
                region: region.to_string(),
            })
    }

    /// Send an authenticated request, `build` is called again if the token has to be renewed
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Response, OpenStackError> {
        let build = |token: &str| -> RequestBuilder {
            let req = self.http.request(method.clone(), url)
                .header("X-Auth-Token", token);
            match body {
                Some(body) => req.json(body),
                None => req,
            }
        };
        tracing::trace!("{method} {url}");
        let session = self.session(false).await?;
        let resp = build(&session.token).send().await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            tracing::debug!("token rejected, authenticating again");
            let session = self.session(true).await?;
            return Ok(build(&session.token).send().await?);
        }
        Ok(resp)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<T, OpenStackError> {
        let resp = check(self.send(method, url, body).await?).await?;
        Ok(resp.json().await?)
    }

    async fn find_named(&self, url: &str, collection: &str, kind: &str, name: &str) -> Result<NamedResource, OpenStackError> {
        let body: Value = self.request(Method::GET, url, None).await?;
        let items: Vec<NamedResource> = serde_json::from_value(body[collection].clone())
            .unwrap_or_default();
        items.into_iter()
            .find(|item| item.name == name)
            .ok_or_else(|| OpenStackError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            })
    }

    pub async fn find_image(&self, region: &str, name: &str) -> Result<NamedResource, OpenStackError> {
        let base = self.endpoint("image", region).await?;
        let url = name_query_url(&format!("{base}/v2/images"), name)?;
        self.find_named(&url, "images", "image", name).await
    }

    pub async fn find_flavor(&self, region: &str, name: &str) -> Result<NamedResource, OpenStackError> {
        let base = self.endpoint("compute", region).await?;
        let url = format!("{base}/flavors");
        self.find_named(&url, "flavors", "flavor", name).await
    }

    pub async fn find_network(&self, region: &str, name: &str) -> Result<NamedResource, OpenStackError> {
        let base = self.endpoint("network", region).await?;
        let url = name_query_url(&format!("{base}/v2.0/networks"), name)?;
        self.find_named(&url, "networks", "network", name).await
    }

    pub async fn find_security_group(&self, region: &str, name: &str) -> Result<NamedResource, OpenStackError> {
        let base = self.endpoint("network", region).await?;
        let url = name_query_url(&format!("{base}/v2.0/security-groups"), name)?;
        self.find_named(&url, "security_groups", "security group", name).await
    }

    pub async fn create_security_group(&self, region: &str, name: &str) -> Result<NamedResource, OpenStackError> {
        let base = self.endpoint("network", region).await?;
        let url = format!("{base}/v2.0/security-groups");
        let body = json!({ "security_group": { "name": name, "description": "overlay VMs" } });
        let resp: Value = self.request(Method::POST, &url, Some(&body)).await?;
        serde_json::from_value(resp["security_group"].clone())
            .map_err(|e| OpenStackError::Status { status: 200, body: e.to_string() })
    }

    /// A rule that already exists comes back as `OpenStackError::Conflict`
    pub async fn create_security_group_rule(&self, region: &str, rule: &NewSecurityGroupRule) -> Result<(), OpenStackError> {
        let base = self.endpoint("network", region).await?;
        let url = format!("{base}/v2.0/security-group-rules");
        let resp = self.send(Method::POST, &url, Some(&rule.to_body())).await?;
        check(resp).await?;
        Ok(())
    }

    pub async fn list_servers(&self, region: &str) -> Result<Vec<Server>, OpenStackError> {
        let base = self.endpoint("compute", region).await?;
        let url = format!("{base}/servers/detail");
        let body: Value = self.request(Method::GET, &url, None).await?;
        serde_json::from_value(body["servers"].clone())
            .map_err(|e| OpenStackError::Status { status: 200, body: e.to_string() })
    }

    /// Returns the id of the new server
    pub async fn create_server(&self, region: &str, server: &NewServer) -> Result<String, OpenStackError> {
        let base = self.endpoint("compute", region).await?;
        let url = format!("{base}/servers");
        tracing::debug!("creating server {} in {region}", server.name);
        let body: Value = self.request(Method::POST, &url, Some(&server.to_body())).await?;
        body["server"]["id"].as_str()
            .map(|id| id.to_string())
            .ok_or_else(|| OpenStackError::Status { status: 202, body: body.to_string() })
    }

    pub async fn get_server(&self, region: &str, id: &str) -> Result<Server, OpenStackError> {
        let base = self.endpoint("compute", region).await?;
        let url = format!("{base}/servers/{id}");
        let resp = self.send(Method::GET, &url, None).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(OpenStackError::NotFound { kind: "server".into(), name: id.to_string() });
        }
        let body: Value = check(resp).await?.json().await?;
        serde_json::from_value(body["server"].clone())
            .map_err(|e| OpenStackError::Status { status: 200, body: e.to_string() })
    }

    pub async fn get_console_output(&self, region: &str, id: &str) -> Result<String, OpenStackError> {
        let base = self.endpoint("compute", region).await?;
        let url = format!("{base}/servers/{id}/action");
        let body = json!({ "os-getConsoleOutput": { "length": Value::Null } });
        let resp: Value = self.request(Method::POST, &url, Some(&body)).await?;
        Ok(resp["output"].as_str().unwrap_or_default().to_string())
    }
}

/// Collection url filtered by name, the name is percent encoded
pub fn name_query_url(collection: &str, name: &str) -> Result<String, OpenStackError> {
    Url::parse_with_params(collection, &[("name", name)])
        .map(|url| url.to_string())
        .map_err(|e| OpenStackError::InvalidUrl {
            url: collection.to_string(),
            reason: e.to_string(),
        })
}

/// Turn a non success response into an error, 409 is kept apart so callers can ignore it
async fn check(resp: Response) -> Result<Response, OpenStackError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    tracing::trace!("request failed with {status}: {body}");
    if status == StatusCode::CONFLICT {
        Err(OpenStackError::Conflict(body))
    } else {
        Err(OpenStackError::Status { status: status.as_u16(), body })
    }
}

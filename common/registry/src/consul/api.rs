//! Minimal client for the consul agent and health HTTP endpoints.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

const TOKEN_HEADER: &str = "X-Consul-Token";
const INDEX_HEADER: &str = "X-Consul-Index";

/// Body of `PUT /v1/agent/service/register`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Meta")]
    pub meta: HashMap<String, String>,
    #[serde(rename = "Check")]
    pub check: TtlCheck,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TtlCheck {
    #[serde(rename = "CheckID")]
    pub check_id: String,
    #[serde(rename = "TTL")]
    pub ttl: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    pub deregister_critical_service_after: String,
    #[serde(rename = "Status")]
    pub status: String,
}

#[derive(Debug, Serialize)]
struct CheckUpdate<'a> {
    #[serde(rename = "Status")]
    status: &'a str,
    #[serde(rename = "Output")]
    output: &'a str,
}

/// One element of `GET /v1/health/service/{name}`. Node and check details
/// are not needed and ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    #[serde(rename = "Service")]
    pub service: AgentService,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Service")]
    pub service: String,
    #[serde(rename = "Tags", deserialize_with = "crate::instance::null_as_default")]
    pub tags: Vec<String>,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Meta", deserialize_with = "crate::instance::null_as_default")]
    pub meta: HashMap<String, String>,
}

/// Render a duration the way consul parses it (`15s`, `500ms`).
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 && d.as_secs() > 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[derive(Debug, Clone)]
pub struct ConsulApi {
    http: Client,
    base: Url,
    token: Option<String>,
    timeout: Duration,
}

impl ConsulApi {
    pub fn new(base: Url, token: Option<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            http,
            base,
            token: token.filter(|t| !t.is_empty()),
            timeout,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::InvalidConfig(format!("bad consul path {path}: {e}")))
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.header(TOKEN_HEADER, token),
            None => builder,
        }
    }

    async fn put_json<T: Serialize + ?Sized>(&self, path: &str, body: Option<&T>) -> Result<()> {
        let mut request = self.http.put(self.url(path)?).timeout(self.timeout);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = self.authorized(request).send().await?;
        check_status(path, response).await?;
        Ok(())
    }

    pub async fn register(&self, registration: &ServiceRegistration) -> Result<()> {
        self.put_json("v1/agent/service/register", Some(registration))
            .await
    }

    pub async fn deregister(&self, service_id: &str) -> Result<()> {
        let path = format!("v1/agent/service/deregister/{service_id}");
        self.put_json::<()>(&path, None).await
    }

    /// Mark a TTL check as passing.
    pub async fn pass_check(&self, check_id: &str) -> Result<()> {
        let path = format!("v1/agent/check/update/{check_id}");
        let body = CheckUpdate {
            status: "passing",
            output: "healthy",
        };
        self.put_json(&path, Some(&body)).await
    }

    /// Passing instances of `name`. With a non-zero `index` this is a
    /// blocking query that returns once the result changes or `wait` elapses.
    pub async fn health_service(
        &self,
        name: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(Vec<ServiceEntry>, u64)> {
        let path = format!("v1/health/service/{name}");
        let mut url = self.url(&path)?;
        url.query_pairs_mut()
            .append_pair("passing", "true")
            .append_pair("index", &index.to_string())
            .append_pair("wait", &format_duration(wait));

        // Consul adds up to wait/16 of jitter on top of the requested wait.
        let request = self
            .http
            .get(url)
            .timeout(wait + wait / 16 + self.timeout);
        let response = self.authorized(request).send().await?;
        let response = check_status(&path, response).await?;

        let last_index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or_default();
        let entries: Option<Vec<ServiceEntry>> = response.json().await?;
        Ok((entries.unwrap_or_default(), last_index))
    }
}

async fn check_status(path: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Consul {
        status: status.as_u16(),
        path: path.to_string(),
        body,
    })
}

//! HTTP client for a Confluent-compatible schema registry.
//!
//! Endpoints used:
//!
//! - `GET  /schemas/ids/{id}`
//! - `GET  /subjects/{subject}/versions/latest`
//! - `POST /subjects/{subject}/versions`

use crate::encoding::encode_subject;
use crate::registry::{RegisteredSchema, RegistryError, SchemaFormat, SchemaRegistry};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const CONTENT_TYPE: &str = "application/vnd.schemaregistry.v1+json";

/// Credentials sent with every registry request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryAuth {
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// HTTP basic authentication
    Basic {
        /// User name
        username: String,
        /// Password
        password: String,
    },
}

/// Registry HTTP client configuration.
#[derive(Debug, Clone)]
pub struct RegistryClientConfig {
    /// Base URL of the registry (e.g., <http://localhost:8081>)
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
    /// Optional credentials
    pub auth: Option<RegistryAuth>,
    /// Custom CA certificate path for self-signed registry certs (PEM format)
    pub ca_cert_path: Option<PathBuf>,
}

impl Default for RegistryClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".to_string(),
            timeout: Duration::from_secs(30),
            auth: None,
            ca_cert_path: None,
        }
    }
}

/// Schema registry reached over HTTP(S).
pub struct HttpSchemaRegistry {
    client: Client,
    base_url: String,
    auth: Option<RegistryAuth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaByIdResponse {
    schema: String,
    #[serde(default)]
    schema_type: Option<SchemaFormat>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubjectVersionResponse {
    subject: String,
    version: u32,
    id: u32,
    schema: String,
    #[serde(default)]
    schema_type: Option<SchemaFormat>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    schema: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema_type: Option<SchemaFormat>,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    id: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error_code: Option<i64>,
    message: String,
}

impl HttpSchemaRegistry {
    /// Create a new registry client.
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is not a valid `http`/`https` URL, if the
    /// HTTP client cannot be created, or if the CA certificate cannot be read.
    pub fn new(config: RegistryClientConfig) -> Result<Self, RegistryError> {
        let url = Url::parse(&config.base_url)
            .map_err(|e| RegistryError::Init(format!("{}: {e}", config.base_url)))?;
        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(RegistryError::Init(format!(
                    "{}: unsupported scheme '{scheme}'",
                    config.base_url
                )));
            }
        }

        let mut builder = Client::builder().timeout(config.timeout);

        if url.scheme() == "https" {
            builder = builder.use_rustls_tls();

            if let Some(ca_path) = &config.ca_cert_path {
                let ca_cert = fs::read(ca_path).map_err(|e| {
                    RegistryError::Init(format!(
                        "failed to read CA certificate {}: {e}",
                        ca_path.display()
                    ))
                })?;
                let cert = reqwest::Certificate::from_pem(&ca_cert).map_err(|e| {
                    RegistryError::Init(format!("failed to parse CA certificate: {e}"))
                })?;
                builder = builder.add_root_certificate(cert);
                tracing::debug!(ca_path = %ca_path.display(), "Loaded registry CA certificate");
            }
        }

        let client = builder
            .build()
            .map_err(|e| RegistryError::Init(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth: config.auth,
        })
    }

    /// Base URL requests are issued against, without trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some(RegistryAuth::Bearer(token)) => request.bearer_auth(token),
            Some(RegistryAuth::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RegistryError> {
        let response = self
            .authorize(request.header("Accept", CONTENT_TYPE))
            .send()
            .await
            .map_err(|e| RegistryError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| RegistryError::Parse(e.to_string()))
    }
}

async fn api_error(response: Response) -> RegistryError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();

    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => RegistryError::Api {
            status,
            error_code: body.error_code,
            message: body.message,
        },
        Err(_) => RegistryError::Api {
            status,
            error_code: None,
            message: text,
        },
    }
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    async fn schema_by_id(&self, id: u32) -> Result<RegisteredSchema, RegistryError> {
        let url = format!("{}/schemas/ids/{id}", self.base_url);

        tracing::debug!(schema_id = id, url, "GET schema by id");

        let body: SchemaByIdResponse = self.send(self.client.get(&url)).await?;

        Ok(RegisteredSchema {
            id,
            subject: None,
            version: None,
            format: body.schema_type.unwrap_or_default(),
            schema: body.schema,
        })
    }

    async fn latest_schema(&self, subject: &str) -> Result<RegisteredSchema, RegistryError> {
        let url = format!(
            "{}/subjects/{}/versions/latest",
            self.base_url,
            encode_subject(subject)
        );

        tracing::debug!(subject, url, "GET latest schema");

        let body: SubjectVersionResponse = self.send(self.client.get(&url)).await?;

        Ok(RegisteredSchema {
            id: body.id,
            subject: Some(body.subject),
            version: Some(body.version),
            format: body.schema_type.unwrap_or_default(),
            schema: body.schema,
        })
    }

    async fn register_schema(
        &self,
        subject: &str,
        schema: &str,
        format: SchemaFormat,
    ) -> Result<u32, RegistryError> {
        let url = format!(
            "{}/subjects/{}/versions",
            self.base_url,
            encode_subject(subject)
        );

        tracing::debug!(subject, %format, url, "POST register schema");

        // Avro is the registry default and is sent without schemaType.
        let body = RegisterRequest {
            schema,
            schema_type: (format != SchemaFormat::Avro).then_some(format),
        };

        let request = self
            .client
            .post(&url)
            .header("Content-Type", CONTENT_TYPE)
            .json(&body);

        let response: RegisterResponse = self.send(request).await?;
        Ok(response.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default() {
        let config = RegistryClientConfig::default();
        assert_eq!(config.base_url, "http://localhost:8081");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.auth.is_none());
        assert!(config.ca_cert_path.is_none());
    }

    #[test]
    fn client_creation_strips_trailing_slash() {
        let client = HttpSchemaRegistry::new(RegistryClientConfig {
            base_url: "http://registry:8081/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(client.base_url(), "http://registry:8081");
    }

    #[test]
    fn client_creation_rejects_bad_urls() {
        for base_url in ["not a url", "ftp://registry:21"] {
            let result = HttpSchemaRegistry::new(RegistryClientConfig {
                base_url: base_url.to_string(),
                ..Default::default()
            });
            let err_msg = format!("{}", result.err().unwrap());
            assert!(err_msg.contains("registry client init error"), "{err_msg}");
        }
    }

    #[test]
    fn client_creation_with_invalid_ca_fails() {
        let result = HttpSchemaRegistry::new(RegistryClientConfig {
            base_url: "https://localhost:8443".to_string(),
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        });
        assert!(matches!(result, Err(RegistryError::Init(_))));
    }

    #[test]
    fn register_request_omits_avro_type() {
        let avro = RegisterRequest {
            schema: "\"string\"",
            schema_type: None,
        };
        assert_eq!(
            serde_json::to_string(&avro).unwrap(),
            r#"{"schema":"\"string\""}"#
        );

        let json = RegisterRequest {
            schema: "{}",
            schema_type: Some(SchemaFormat::Json),
        };
        assert_eq!(
            serde_json::to_string(&json).unwrap(),
            r#"{"schema":"{}","schemaType":"JSON"}"#
        );
    }

    #[test]
    fn parse_registry_responses() {
        let by_id: SchemaByIdResponse =
            serde_json::from_str(r#"{"schema":"{\"type\":\"string\"}"}"#).unwrap();
        assert_eq!(by_id.schema, r#"{"type":"string"}"#);
        assert!(by_id.schema_type.is_none());

        let latest: SubjectVersionResponse = serde_json::from_str(
            r#"{"subject":"orders-value","version":3,"id":17,"schema":"{}","schemaType":"JSON"}"#,
        )
        .unwrap();
        assert_eq!(latest.subject, "orders-value");
        assert_eq!(latest.version, 3);
        assert_eq!(latest.id, 17);
        assert_eq!(latest.schema_type, Some(SchemaFormat::Json));

        let error: ErrorBody =
            serde_json::from_str(r#"{"error_code":40401,"message":"Subject not found."}"#)
                .unwrap();
        assert_eq!(error.error_code, Some(40401));
        assert_eq!(error.message, "Subject not found.");
    }
}

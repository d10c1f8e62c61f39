use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// One running process as seen by the registry.
///
/// The JSON form of this struct is the registration record stored by both
/// backends. Field names are part of the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique per process, assigned once at startup.
    pub id: String,
    /// Logical service name shared by every instance of the service.
    pub name: String,
    pub version: String,
    /// Opaque to the registry.
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
    /// Scheme-qualified addresses such as `http://10.0.0.1:8080` or `grpc://10.0.0.1:9000`.
    #[serde(default, deserialize_with = "null_as_default")]
    pub endpoints: Vec<String>,
}

impl ServiceInstance {
    /// Create an instance with a freshly generated id.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), name, version)
    }

    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            metadata: HashMap::new(),
            endpoints: Vec::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check that the id and name are safe to interpolate into store keys.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.id)
            .map_err(|reason| Error::InvalidInstance(format!("id {:?}: {reason}", self.id)))?;
        validate_service_name(&self.name)
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.id)
    }
}

pub(crate) fn validate_service_name(name: &str) -> Result<()> {
    validate_identifier(name)
        .map_err(|reason| Error::InvalidInstance(format!("name {name:?}: {reason}")))
}

/// Identifiers (service names, instance ids) are interpolated into etcd key
/// paths and consul URL paths. Without validation, a name like
/// `orders/../../other` could address arbitrary keys.
fn validate_identifier(value: &str) -> std::result::Result<(), &'static str> {
    if value.is_empty() || value.len() > 128 {
        return Err("must be 1-128 characters");
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err("only alphanumeric, dash, underscore and dot are allowed");
    }
    if value.contains("..") {
        return Err("must not contain '..'");
    }
    Ok(())
}

/// Records written by other clients may carry `null` for collections.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

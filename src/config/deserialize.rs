// ABOUTME: Custom serde deserializers for config types.
// ABOUTME: Lets endpoints be written as "user@host:port" strings or as maps.

use serde::Deserialize;

use super::Endpoint;

pub fn deserialize_endpoint<'de, D>(deserializer: D) -> Result<Endpoint, D::Error>
where
    D: serde::Deserializer<'de>,
{
    EndpointEntry::deserialize(deserializer)?
        .into_endpoint()
        .map_err(serde::de::Error::custom)
}

pub fn deserialize_endpoint_option<'de, D>(deserializer: D) -> Result<Option<Endpoint>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<EndpointEntry> = Option::deserialize(deserializer)?;
    opt.map(EndpointEntry::into_endpoint)
        .transpose()
        .map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EndpointEntry {
    Simple(String),
    Detailed(Endpoint),
}

impl EndpointEntry {
    fn into_endpoint(self) -> Result<Endpoint, String> {
        match self {
            EndpointEntry::Simple(s) => Endpoint::parse(&s),
            EndpointEntry::Detailed(e) => Ok(e),
        }
    }
}

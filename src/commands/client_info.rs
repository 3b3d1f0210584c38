use crate::config::ClientConfig;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfoResponse {
    pub name: String,
    pub version: String,
    pub backend: &'static str,
    pub collection: String,
    pub platform: String,
    pub arch: String,
}

pub fn build_client_info_response(
    name: String,
    version: String,
    config: &ClientConfig,
) -> ClientInfoResponse {
    ClientInfoResponse {
        name,
        version,
        backend: config.backend.as_str(),
        collection: config.collection.clone(),
        platform: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
    }
}

pub fn client_info(config: &ClientConfig) -> ClientInfoResponse {
    build_client_info_response(
        env!("CARGO_PKG_NAME").to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
        config,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_info_contains_runtime_metadata() {
        let response = client_info(&ClientConfig::default());

        assert_eq!(response.name, "harvest-auction");
        assert!(!response.version.is_empty());
        assert_eq!(response.backend, ClientConfig::default().backend.as_str());
        assert_eq!(response.collection, ClientConfig::default().collection);
        assert!(!response.platform.is_empty());
        assert!(!response.arch.is_empty());
    }
}

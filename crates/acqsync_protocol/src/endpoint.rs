use crate::defaults::WEBSOCKET_PATH_PREFIX;
use crate::error::{ProtocolError, Result};
use url::Url;

/// Derive the websocket endpoint for a client from the coordinator base URL.
///
/// `http://host:8000/api` becomes `ws://host:8000/ws/test/<client_id>`;
/// `https` maps to `wss`. Query and fragment are dropped.
pub fn websocket_url(base: &str, client_id: u32) -> Result<Url> {
    let mut url = Url::parse(base)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ProtocolError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| ProtocolError::UnsupportedScheme(scheme.to_string()))?;
    url.set_path(&format!("{}/{}", WEBSOCKET_PATH_PREFIX, client_id));
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_base_maps_to_ws() {
        let url = websocket_url("http://coordinator:8000/api/v1?x=1", 7).unwrap();
        assert_eq!(url.as_str(), "ws://coordinator:8000/ws/test/7");
    }

    #[test]
    fn test_https_base_maps_to_wss() {
        let url = websocket_url("https://coordinator.example", 42).unwrap();
        assert_eq!(url.as_str(), "wss://coordinator.example/ws/test/42");
    }

    #[test]
    fn test_unsupported_scheme() {
        assert!(matches!(
            websocket_url("ftp://coordinator", 1),
            Err(ProtocolError::UnsupportedScheme(_))
        ));
    }
}

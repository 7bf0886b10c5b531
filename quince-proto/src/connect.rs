use alloc::string::String;

use serde::Serialize;

/// Options sent to the server with `CONNECT`
#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct Connect {
    /// Ask the server to acknowledge every operation with `+OK`
    pub verbose: bool,
    pub pedantic: bool,
    #[serde(rename = "tls_required")]
    pub require_tls: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(rename = "user", skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(rename = "pass", skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "name", skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(rename = "lang")]
    pub client_lang: &'static str,
    #[serde(rename = "version")]
    pub client_version: &'static str,
    pub protocol: u8,
    /// Receive messages published by this same connection
    pub echo: bool,
    #[serde(rename = "no_responders")]
    pub supports_no_responders: bool,
    #[serde(rename = "headers")]
    pub supports_headers: bool,
}

#[cfg(test)]
mod tests {
    use super::Connect;

    #[test]
    fn serializes_wire_names() {
        let connect = Connect {
            verbose: true,
            pedantic: false,
            require_tls: false,
            auth_token: None,
            username: Some("alice".into()),
            password: Some("secret".into()),
            client_name: None,
            client_lang: "rust",
            client_version: "0.1.0",
            protocol: 1,
            echo: true,
            supports_no_responders: true,
            supports_headers: true,
        };
        let json = serde_json::to_value(&connect).unwrap();
        assert_eq!(json["user"], "alice");
        assert_eq!(json["pass"], "secret");
        assert_eq!(json["no_responders"], true);
        assert!(json.get("auth_token").is_none());
        assert!(json.get("name").is_none());
    }
}

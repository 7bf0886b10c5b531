use quince_net::AuthenticationMethod;
use quince_proto::{error::ServerAddrError, ServerAddr, Subject};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(super) struct FromEnv {
    #[serde(rename = "nats_url")]
    url: Option<String>,
    #[serde(flatten)]
    pub(super) auth: AuthFromEnv,
    #[serde(rename = "nats_inbox_prefix")]
    pub(super) inbox_prefix: Option<Subject>,
}

#[derive(Debug, Deserialize)]
pub(super) struct AuthFromEnv {
    #[serde(rename = "nats_username")]
    username: Option<String>,
    #[serde(rename = "nats_password")]
    password: Option<String>,
    #[serde(rename = "nats_token")]
    token: Option<String>,
}

/// An error encountered while reading the client configuration from the environment
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FromEnvError {
    #[error("invalid environment variable")]
    Env(#[source] envy::Error),
    #[error("invalid server address in NATS_URL")]
    Url(#[source] ServerAddrError),
}

impl FromEnv {
    pub(super) fn from_vars<I>(vars: I) -> Result<Self, FromEnvError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::from_iter(vars).map_err(FromEnvError::Env)
    }

    pub(super) fn servers(&self) -> Result<Vec<ServerAddr>, FromEnvError> {
        let Some(url) = &self.url else {
            return Ok(Vec::new());
        };

        url.split(',')
            .map(str::trim)
            .filter(|server| !server.is_empty())
            .map(|server| server.parse().map_err(FromEnvError::Url))
            .collect()
    }
}

impl AuthFromEnv {
    pub(super) fn into_authentication_method(self) -> Option<AuthenticationMethod> {
        match (self.username, self.password, self.token) {
            (Some(username), Some(password), _) => {
                Some(AuthenticationMethod::UserAndPassword { username, password })
            }
            (_, _, Some(token)) => Some(AuthenticationMethod::Token(token)),
            _ => None,
        }
    }
}

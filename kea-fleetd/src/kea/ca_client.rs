use async_trait::async_trait;
use shared::types::App;
use crate::kea::commands::{attribute, Command, CommandForwarder, CommandResponse, ForwardResult, TransportError};

/// Forwards commands straight to the Kea Control Agent over HTTP(S).
/// Each command is one POST; the agent fans it out to the addressed daemons.
#[derive(Clone)]
pub struct CaClient {
    http: reqwest::Client,
}

impl CaClient {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()?;
        Ok(Self { http })
    }

    fn url(app: &App) -> Result<String, TransportError> {
        let ap = app.control_access_point().ok_or_else(|| TransportError::Unreachable {
            app: app.label(),
            reason: "no control access point".to_string(),
        })?;
        let scheme = if ap.use_secure_protocol { "https" } else { "http" };
        // IPv6 literals need brackets in URLs
        let host = if ap.address.contains(':') {
            format!("[{}]", ap.address)
        } else {
            ap.address.clone()
        };
        Ok(format!("{}://{}:{}/", scheme, host, ap.port))
    }

    async fn send(&self, app: &App, url: &str, command: &Command) -> Result<Vec<CommandResponse>, TransportError> {
        let mut request = self.http.post(url).json(command);
        if let Some(key) = app.control_access_point().and_then(|ap| ap.key.as_deref()) {
            let (user, password) = key.split_once(':').unwrap_or((key, ""));
            request = request.basic_auth(user, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Unreachable {
                app: app.label(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Malformed {
                command: command.command.clone(),
                reason: format!("HTTP status {}", status),
            });
        }

        let body = response.text().await.map_err(|e| TransportError::Unreachable {
            app: app.label(),
            reason: e.to_string(),
        })?;

        let raw = parse_body(&body).map_err(|e| TransportError::Malformed {
            command: command.command.clone(),
            reason: e.to_string(),
        })?;
        Ok(attribute(command, raw))
    }
}

/// The agent answers with a list; a bare object shows up when it rejects
/// the request before forwarding it.
pub(crate) fn parse_body(body: &str) -> Result<Vec<CommandResponse>, serde_json::Error> {
    match serde_json::from_str::<Vec<CommandResponse>>(body) {
        Ok(list) => Ok(list),
        Err(list_err) => serde_json::from_str::<CommandResponse>(body)
            .map(|single| vec![single])
            .map_err(|_| list_err),
    }
}

#[async_trait]
impl CommandForwarder for CaClient {
    async fn forward(&self, app: &App, commands: &[Command]) -> Result<ForwardResult, TransportError> {
        let url = Self::url(app)?;
        let mut responses = Vec::with_capacity(commands.len());
        let mut reached = false;

        for command in commands {
            let outcome = self.send(app, &url, command).await;
            if !matches!(outcome, Err(TransportError::Unreachable { .. })) {
                reached = true;
            }
            responses.push(outcome);
        }

        // Nothing got through: the app itself is down.
        if !reached {
            if let Some(Err(e)) = responses.into_iter().next() {
                return Err(e);
            }
            return Ok(ForwardResult::default());
        }

        Ok(ForwardResult { responses })
    }
}

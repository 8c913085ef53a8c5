use std::time::Duration;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use shared::protocol::{DAEMON_CA, RESULT_SUCCESS};
use shared::types::App;

/// A control command addressed to a set of daemons. An empty daemon list
/// addresses the control agent itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub command: String,
    #[serde(rename = "service", skip_serializing_if = "Vec::is_empty")]
    pub daemons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl Command {
    pub fn new(command: &str, daemons: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            daemons: daemons.iter().map(|d| d.to_string()).collect(),
            arguments: None,
        }
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = Some(arguments);
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("{app} is unreachable: {reason}")]
    Unreachable { app: String, reason: String },
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("malformed response to {command}: {reason}")]
    Malformed { command: String, reason: String },
}

/// One daemon's answer to a command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandResponse {
    /// Filled in from the addressed daemon list, not sent by Kea
    #[serde(skip)]
    pub daemon: String,
    pub result: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

impl CommandResponse {
    pub fn is_success(&self) -> bool {
        self.result == RESULT_SUCCESS
    }

    /// Decodes the arguments into a typed structure.
    pub fn decode_arguments<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.arguments
            .as_ref()
            .map(|args| serde_json::from_value(args.clone()))
            .transpose()
    }
}

/// Labels raw responses with the daemon they came from. Kea answers a
/// `service` list in request order.
pub fn attribute(command: &Command, mut responses: Vec<CommandResponse>) -> Vec<CommandResponse> {
    for (i, rsp) in responses.iter_mut().enumerate() {
        rsp.daemon = if command.daemons.is_empty() {
            DAEMON_CA.to_string()
        } else {
            command.daemons.get(i).cloned().unwrap_or_default()
        };
    }
    responses
}

/// Per-command outcome of a forwarded batch, in command order.
#[derive(Debug, Default)]
pub struct ForwardResult {
    pub responses: Vec<Result<Vec<CommandResponse>, TransportError>>,
}

impl ForwardResult {
    /// Moves out the outcome of the command at `idx`.
    pub fn take(&mut self, idx: usize) -> Result<Vec<CommandResponse>, TransportError> {
        match self.responses.get_mut(idx) {
            Some(slot) => std::mem::replace(slot, Ok(Vec::new())),
            None => Err(TransportError::Malformed {
                command: format!("#{}", idx),
                reason: "missing from the batch result".to_string(),
            }),
        }
    }
}

/// Sends batches of commands to an app. A top level error means the app
/// could not be reached at all.
#[async_trait]
pub trait CommandForwarder: Send + Sync {
    async fn forward(&self, app: &App, commands: &[Command]) -> Result<ForwardResult, TransportError>;
}

/// Forwards a batch, treating an expired deadline like a transport error.
pub async fn forward_within(
    forwarder: &dyn CommandForwarder,
    app: &App,
    commands: &[Command],
    timeout: Duration,
) -> Result<ForwardResult, TransportError> {
    tokio::time::timeout(timeout, forwarder.forward(app, commands))
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionArgs {
    #[serde(default)]
    pub extended: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusArgs {
    /// Seconds since the daemon started
    #[serde(default)]
    pub uptime: i64,
    /// Seconds since the last reconfiguration
    #[serde(default)]
    pub reload: i64,
}

#[cfg(test)]
pub mod fake {
    use std::sync::Mutex;
    use super::*;
    use crate::kea::ca_client::parse_body;

    type Handler = dyn Fn(&App, &[Command], usize) -> Result<Vec<Result<Vec<String>, TransportError>>, TransportError>
        + Send
        + Sync;

    /// Scripted forwarder. The handler gets the call number and returns,
    /// per command, the bodies Kea would have sent: a JSON list or a
    /// single object.
    pub struct FakeForwarder {
        handler: Box<Handler>,
        pub calls: Mutex<Vec<Vec<Command>>>,
    }

    impl FakeForwarder {
        pub fn new<F>(handler: F) -> Self
        where
            F: Fn(&App, &[Command], usize) -> Result<Vec<Result<Vec<String>, TransportError>>, TransportError>
                + Send
                + Sync
                + 'static,
        {
            Self {
                handler: Box::new(handler),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CommandForwarder for FakeForwarder {
        async fn forward(&self, app: &App, commands: &[Command]) -> Result<ForwardResult, TransportError> {
            let call_no = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(commands.to_vec());
                calls.len() - 1
            };
            let lists = (self.handler)(app, commands, call_no)?;
            let responses = commands
                .iter()
                .zip(lists)
                .map(|(cmd, list)| {
                    list.map(|bodies| {
                        let raw = bodies
                            .iter()
                            .flat_map(|body| parse_body(body).unwrap())
                            .collect();
                        attribute(cmd, raw)
                    })
                })
                .collect();
            Ok(ForwardResult { responses })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_serialization() {
        let cmd = Command::new("version-get", &[]);
        assert_eq!(serde_json::to_value(&cmd).unwrap(), json!({ "command": "version-get" }));

        let cmd = Command::new("statistic-get", &["dhcp4"])
            .with_arguments(json!({ "name": "pkt4-ack-sent" }));
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({
                "command": "statistic-get",
                "service": ["dhcp4"],
                "arguments": { "name": "pkt4-ack-sent" }
            })
        );
    }

    #[test]
    fn test_attribute_daemons() {
        let raw: Vec<CommandResponse> = serde_json::from_str(
            r#"[{"result": 0, "text": "1.8.0"}, {"result": 1, "text": "down"}]"#,
        )
        .unwrap();
        let rsps = attribute(&Command::new("version-get", &["dhcp4", "dhcp6"]), raw.clone());
        assert_eq!(rsps[0].daemon, "dhcp4");
        assert_eq!(rsps[1].daemon, "dhcp6");
        assert!(!rsps[1].is_success());

        let rsps = attribute(&Command::new("version-get", &[]), raw);
        assert_eq!(rsps[0].daemon, "ca");
    }

    #[test]
    fn test_decode_arguments() {
        let rsp: CommandResponse = serde_json::from_str(
            r#"{"result": 0, "text": "ok", "arguments": {"uptime": 500, "reload": 20, "pid": 7}}"#,
        )
        .unwrap();
        let args: StatusArgs = rsp.decode_arguments().unwrap().unwrap();
        assert_eq!(args.uptime, 500);
        assert_eq!(args.reload, 20);

        let rsp: CommandResponse = serde_json::from_str(r#"{"result": 0}"#).unwrap();
        assert!(rsp.decode_arguments::<StatusArgs>().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fake_accepts_lists_and_objects() {
        use shared::types::{AccessPoint, AccessPointKind, Machine};
        use super::fake::FakeForwarder;

        let app = App::new(
            Machine { id: None, address: "host-a".to_string(), agent_port: 8080 },
            AccessPoint {
                kind: AccessPointKind::Control,
                address: "192.0.2.1".to_string(),
                port: 8000,
                use_secure_protocol: false,
                key: None,
            },
        );
        let fake = FakeForwarder::new(|_, _, _| {
            Ok(vec![
                Ok(vec![json!([{ "result": 0, "text": "2.4.1" }, { "result": 1, "text": "down" }]).to_string()]),
                Ok(vec![json!({ "result": 0, "text": "2.4.1" }).to_string()]),
            ])
        });
        let cmds = [
            Command::new("version-get", &["dhcp4", "dhcp6"]),
            Command::new("version-get", &[]),
        ];

        let mut result = fake.forward(&app, &cmds).await.unwrap();
        let listed = result.take(0).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].daemon, "dhcp6");
        assert!(!listed[1].is_success());
        let single = result.take(1).unwrap();
        assert_eq!(single[0].daemon, "ca");
        assert_eq!(fake.call_count(), 1);
    }

    #[test]
    fn test_take_missing_index() {
        let mut result = ForwardResult::default();
        assert!(matches!(result.take(0), Err(TransportError::Malformed { .. })));
    }
}

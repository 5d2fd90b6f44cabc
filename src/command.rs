//! Outbound commands and their replies

use crate::{
    constants::*,
    error::{EslError, EslResult},
    protocol::{EslMessage, MessageType},
};
use indexmap::IndexMap;
use std::collections::HashMap;

/// Reply to a command, from either a `command/reply` or an `api/response`
#[derive(Debug, Clone)]
pub struct EslResponse {
    message_type: MessageType,
    headers: HashMap<String, String>,
    text: String,
}

impl EslResponse {
    /// Pull the reply text from wherever this message shape carries it.
    ///
    /// An `api/response` must declare its length; without one the reply
    /// cannot be told apart from whatever follows it on the wire.
    pub(crate) fn from_message(message: EslMessage) -> EslResult<Self> {
        let text = match message.message_type {
            MessageType::ApiResponse => {
                if message
                    .header(HEADER_CONTENT_LENGTH)
                    .is_none()
                {
                    return Err(EslError::protocol_error(
                        "api/response without Content-Length",
                    ));
                }
                message
                    .body_text()?
                    .unwrap_or_default()
            }
            _ => message
                .header(HEADER_REPLY_TEXT)
                .unwrap_or("")
                .to_string(),
        };
        Ok(Self {
            message_type: message.message_type,
            headers: message.headers,
            text,
        })
    }

    /// Reply text: the `api/response` body or the `Reply-Text` header
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    pub fn message_type(&self) -> &MessageType {
        &self.message_type
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(String::as_str)
    }

    /// Job UUID of a `bgapi` reply.
    ///
    /// Read from the `Job-UUID` header, or from a `+OK Job-UUID: <uuid>`
    /// reply text on older switches.
    pub fn job_uuid(&self) -> Option<&str> {
        self.header(HEADER_JOB_UUID)
            .or_else(|| {
                self.text
                    .strip_prefix("+OK Job-UUID: ")
                    .map(str::trim)
            })
    }

    /// `false` when the switch answered `-ERR ...`
    pub fn is_success(&self) -> bool {
        !self
            .text
            .starts_with(REPLY_ERR_PREFIX)
    }

    /// Fail with [`EslError::CommandFailed`] on a `-ERR` reply.
    pub fn into_result(self) -> EslResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(EslError::CommandFailed {
                reply_text: self.text,
            })
        }
    }

    /// Fail unless the reply starts with `+OK`.
    pub fn into_ok(self) -> EslResult<Self> {
        if self
            .text
            .starts_with(REPLY_OK_PREFIX)
        {
            Ok(self)
        } else {
            Err(EslError::CommandFailed {
                reply_text: self.text,
            })
        }
    }
}

/// Command requests understood by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EslCommand {
    /// `auth <password>`
    Auth { password: String },
    /// `api <command>`, blocking on the switch side
    Api { command: String },
    /// `bgapi <command>`, result arrives later as a `BACKGROUND_JOB` event
    BgApi { command: String },
    /// `filter <expression>`
    Filter { expression: String },
    /// `event plain <class>`
    Event { class: String },
    /// `sendmsg <uuid>` carrying `call-command: execute`
    Execute {
        app: String,
        arg: Option<String>,
        uuid: String,
        lock: bool,
    },
    /// `sendevent <name>` with extra headers and optional body
    SendEvent {
        name: String,
        headers: IndexMap<String, String>,
        body: Option<String>,
    },
}

/// Reject values that would break out of their line on the wire.
fn single_line<'a>(what: &str, value: &'a str) -> EslResult<&'a str> {
    if value.contains(&['\r', '\n'][..]) {
        return Err(EslError::protocol_error(format!(
            "{} must not contain line breaks: {:?}",
            what, value
        )));
    }
    Ok(value)
}

fn push_line(out: &mut String, line: &str) {
    out.push_str(line);
    out.push_str(LINE_TERMINATOR);
}

impl EslCommand {
    fn simple(cmd: &str, arg: &str) -> EslResult<String> {
        let mut out = String::new();
        push_line(&mut out, &format!("{} {}", cmd, single_line(cmd, arg)?));
        out.push_str(LINE_TERMINATOR);
        Ok(out)
    }

    /// Short name used in logs; never includes secrets.
    pub fn name(&self) -> &'static str {
        match self {
            EslCommand::Auth { .. } => "auth",
            EslCommand::Api { .. } => "api",
            EslCommand::BgApi { .. } => "bgapi",
            EslCommand::Filter { .. } => "filter",
            EslCommand::Event { .. } => "event",
            EslCommand::Execute { .. } => "execute",
            EslCommand::SendEvent { .. } => "sendevent",
        }
    }

    /// Serialize to the exact bytes written on the socket.
    pub fn to_wire_format(&self) -> EslResult<String> {
        match self {
            EslCommand::Auth { password } => Self::simple("auth", password),
            EslCommand::Api { command } => Self::simple("api", command),
            EslCommand::BgApi { command } => Self::simple("bgapi", command),
            EslCommand::Filter { expression } => Self::simple("filter", expression),
            EslCommand::Event { class } => {
                Self::simple("event", &format!("plain {}", single_line("event", class)?))
            }
            EslCommand::Execute {
                app,
                arg,
                uuid,
                lock,
            } => {
                let mut out = String::new();
                let uuid = single_line("sendmsg", uuid)?;
                if uuid.is_empty() {
                    push_line(&mut out, "sendmsg");
                } else {
                    push_line(&mut out, &format!("sendmsg {}", uuid));
                }
                push_line(&mut out, "call-command: execute");
                push_line(
                    &mut out,
                    &format!("execute-app-name: {}", single_line("execute-app-name", app)?),
                );
                if let Some(arg) = arg.as_deref().filter(|a| !a.is_empty()) {
                    push_line(
                        &mut out,
                        &format!("execute-app-arg: {}", single_line("execute-app-arg", arg)?),
                    );
                }
                if *lock {
                    push_line(&mut out, "event-lock: true");
                }
                out.push_str(LINE_TERMINATOR);
                Ok(out)
            }
            EslCommand::SendEvent {
                name,
                headers,
                body,
            } => {
                let mut out = String::new();
                push_line(
                    &mut out,
                    &format!("sendevent {}", single_line("sendevent", name)?),
                );
                for (key, value) in headers {
                    push_line(
                        &mut out,
                        &format!(
                            "{}: {}",
                            single_line("event header", key)?,
                            single_line(key, value)?
                        ),
                    );
                }
                match body.as_deref().filter(|b| !b.is_empty()) {
                    Some(body) => {
                        push_line(
                            &mut out,
                            &format!("{}: {}", HEADER_CONTENT_LENGTH, body.len()),
                        );
                        out.push_str(LINE_TERMINATOR);
                        out.push_str(body);
                    }
                    None => out.push_str(LINE_TERMINATOR),
                }
                Ok(out)
            }
        }
    }
}

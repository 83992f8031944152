//! The manager protocol nodes use to tell the proxy about themselves.
//!
//! Commands are HTTP requests using extension methods (`CONFIG`,
//! `ENABLE-APP`, ...) with `key=value&...` form encoded bodies. App commands
//! sent to `/*` apply to every context of the node.

use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::time::Duration;

use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, Request, Response, StatusCode};
use hyper::client::HttpConnector;
use hyper::{Body, Client};
use tokio::time::timeout;

use crate::error::{McmpError, ProxyError};

pub static VERSION_PROTOCOL: &str = "0.2.1";

/// The header carrying the kind of a rejected command.
pub static TYPE_HEADER: &str = "type";
/// The header carrying the message of a rejected command.
pub static MESS_HEADER: &str = "mess";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum McmpCommand {
    Config,
    EnableApp,
    DisableApp,
    StopApp,
    RemoveApp,
    Status,
    Ping,
    Info,
    Version,
}

impl McmpCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            McmpCommand::Config => "CONFIG",
            McmpCommand::EnableApp => "ENABLE-APP",
            McmpCommand::DisableApp => "DISABLE-APP",
            McmpCommand::StopApp => "STOP-APP",
            McmpCommand::RemoveApp => "REMOVE-APP",
            McmpCommand::Status => "STATUS",
            McmpCommand::Ping => "PING",
            McmpCommand::Info => "INFO",
            McmpCommand::Version => "VERSION",
        }
    }

    /// Maps a request method onto a manager command.
    ///
    /// Returns `None` for regular methods which should be proxied instead.
    pub fn from_method(method: &Method) -> Option<Self> {
        let command = match method.as_str().to_ascii_uppercase().as_str() {
            "CONFIG" => McmpCommand::Config,
            "ENABLE-APP" => McmpCommand::EnableApp,
            "DISABLE-APP" => McmpCommand::DisableApp,
            "STOP-APP" => McmpCommand::StopApp,
            "REMOVE-APP" => McmpCommand::RemoveApp,
            "STATUS" => McmpCommand::Status,
            "PING" => McmpCommand::Ping,
            "INFO" => McmpCommand::Info,
            "VERSION" => McmpCommand::Version,
            _ => return None,
        };

        Some(command)
    }

    pub fn method(&self) -> Method {
        // Every command name is a valid method token.
        Method::from_bytes(self.as_str().as_bytes()).unwrap_or(Method::GET)
    }
}

impl Display for McmpCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A single manager protocol command and its parameters.
pub struct McmpMessage {
    pub command: McmpCommand,
    /// If the command targets every context of the node (`/*`).
    pub wildcard: bool,
    pub params: Vec<(String, String)>,
}

impl McmpMessage {
    pub fn new(command: McmpCommand) -> Self {
        Self {
            command,
            wildcard: false,
            params: Vec::new(),
        }
    }

    /// Targets every context of the node.
    pub fn with_wildcard(mut self) -> Self {
        self.wildcard = true;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    /// Gets the first value of a parameter, keys are case insensitive.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// The route of the node the message is about, if any.
    pub fn route(&self) -> Option<&str> {
        self.param("JVMRoute")
    }

    pub fn encode_body(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in self.params.iter() {
            serializer.append_pair(key, value);
        }
        serializer.finish()
    }

    pub fn decode(
        command: McmpCommand,
        wildcard: bool,
        body: &str,
    ) -> Result<Self, McmpError> {
        let body = body.trim();
        // Every parameter must carry a value, even an empty one.
        if body.split('&').any(|pair| !pair.is_empty() && !pair.contains('=')) {
            return Err(McmpError::MalformedBody);
        }

        let params = form_urlencoded::parse(body.as_bytes())
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        Ok(Self {
            command,
            wildcard,
            params,
        })
    }

    /// Builds the HTTP request sending this command to the manager at `addr`.
    pub fn to_request(&self, addr: SocketAddr) -> Result<Request<Body>, http::Error> {
        let path = if self.wildcard { "/*" } else { "/" };
        Request::builder()
            .method(self.command.method())
            .uri(format!("http://{addr}{path}"))
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(Body::from(self.encode_body()))
    }
}

#[derive(Clone)]
/// Sends manager commands to proxies.
pub struct McmpClient {
    client: Client<HttpConnector>,
    timeout: Duration,
}

impl McmpClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }

    /// Sends a command, returning the response body.
    ///
    /// A rejected command is returned as [McmpError::Remote].
    pub async fn send(
        &self,
        addr: SocketAddr,
        msg: &McmpMessage,
    ) -> Result<String, ProxyError> {
        let request = msg.to_request(addr)?;
        let response = timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| ProxyError::Timeout(self.timeout))??;

        if let Some(error) = error_from_response(&response) {
            return Err(ProxyError::Manager(error));
        }
        if !response.status().is_success() {
            return Err(ProxyError::UnexpectedStatus(response.status()));
        }

        let body = timeout(self.timeout, hyper::body::to_bytes(response.into_body()))
            .await
            .map_err(|_| ProxyError::Timeout(self.timeout))??;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// The response sent back when a command is rejected.
pub fn error_response(error: &McmpError) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;

    let headers = response.headers_mut();
    if let Ok(kind) = HeaderValue::from_str(error.kind()) {
        headers.insert(TYPE_HEADER, kind);
    }
    if let Ok(message) = HeaderValue::from_str(&error.to_string()) {
        headers.insert(MESS_HEADER, message);
    }

    response
}

/// Reads the manager error out of a response, if it carries one.
pub fn error_from_response<T>(response: &Response<T>) -> Option<McmpError> {
    let headers = response.headers();
    let kind = headers.get(TYPE_HEADER)?.to_str().ok()?;
    let message = headers
        .get(MESS_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    Some(McmpError::Remote {
        kind: kind.to_string(),
        message: message.to_string(),
    })
}

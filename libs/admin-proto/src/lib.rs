//! Wire codec for the tproxy administrative protocol.
//!
//! The administrative protocol runs over its own TCP connection, separate from
//! the relay data path. One request is sent per connection and answered with
//! one response.
//!
//! Request wire format:
//! - 1 byte version
//! - 16 bytes authentication token
//! - 1 byte method (`get` or `config`)
//! - 1 byte target (method-specific)
//! - 2 bytes data length (big endian)
//! - variable: data
//!
//! Response wire format:
//! - 1 byte status
//! - for successful `get` requests only: 2 bytes data length (big endian)
//!   followed by the data. Numeric targets carry a 4-byte big endian counter;
//!   list targets carry NUL-separated names.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// Protocol version understood by this codec.
pub const PROTOCOL_VERSION: u8 = 1;

/// Length of the authentication token.
pub const TOKEN_LEN: usize = 16;

/// Length of the fixed request header (version + token + method + target + dlen).
pub const HEADER_LEN: usize = 1 + TOKEN_LEN + 1 + 1 + 2;

/// Maximum payload carried by a request or response.
pub const MAX_DATA_LEN: usize = u16::MAX as usize;

/// Separator between a username and its secret in `add` payloads.
pub const USER_SEPARATOR: u8 = b':';

/// Maximum length of a username or password.
pub const MAX_NAME_LEN: usize = 255;

/// Errors raised while building a request or response for the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    /// Payload does not fit the 2-byte length field.
    #[error("payload too large: {0} bytes (max {MAX_DATA_LEN})")]
    PayloadTooLarge(usize),

    /// Username rejected by validation.
    #[error("invalid username: {0}")]
    InvalidUsername(String),

    /// Password rejected by validation.
    #[error("invalid password: {0}")]
    InvalidPassword(String),

    /// Token is not exactly [`TOKEN_LEN`] bytes.
    #[error("token must be exactly {TOKEN_LEN} bytes, got {0}")]
    InvalidToken(usize),
}

/// Errors raised while decoding bytes received from the wire.
///
/// Request-side variants map one-to-one onto a response [`Status`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("not enough bytes: need {needed}, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unsupported protocol version {0}")]
    InvalidVersion(u8),

    #[error("unknown method {0:#04x}")]
    InvalidMethod(u8),

    #[error("unknown target {target:#04x} for method {method}")]
    InvalidTarget { method: Method, target: u8 },

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("unknown status {0:#04x}")]
    InvalidStatus(u8),
}

impl DecodeError {
    /// Status to answer with when a request fails to decode.
    pub fn status(&self) -> Status {
        match self {
            DecodeError::InvalidVersion(_) => Status::InvalidVersion,
            DecodeError::InvalidMethod(_) => Status::InvalidMethod,
            DecodeError::InvalidTarget { .. } => Status::InvalidTarget,
            DecodeError::Truncated { .. } | DecodeError::InvalidData(_) => Status::InvalidData,
            DecodeError::InvalidStatus(_) => Status::ServerError,
        }
    }
}

// ============================================================================
// Enumerations
// ============================================================================

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Get = 0x00,
    Config = 0x01,
}

impl TryFrom<u8> for Method {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Method::Get),
            0x01 => Ok(Method::Config),
            other => Err(DecodeError::InvalidMethod(other)),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "get"),
            Method::Config => write!(f, "config"),
        }
    }
}

/// Targets readable with the `get` method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GetTarget {
    HistoricConnections = 0x00,
    ConcurrentConnections = 0x01,
    TransferredBytes = 0x02,
    ProxyUsersList = 0x03,
    AdminUsersList = 0x04,
}

impl GetTarget {
    /// Whether the response carries a 4-byte counter (as opposed to a name list).
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            GetTarget::HistoricConnections
                | GetTarget::ConcurrentConnections
                | GetTarget::TransferredBytes
        )
    }

    fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(GetTarget::HistoricConnections),
            0x01 => Some(GetTarget::ConcurrentConnections),
            0x02 => Some(GetTarget::TransferredBytes),
            0x03 => Some(GetTarget::ProxyUsersList),
            0x04 => Some(GetTarget::AdminUsersList),
            _ => None,
        }
    }
}

impl FromStr for GetTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "historic-connections" => Ok(GetTarget::HistoricConnections),
            "concurrent-connections" => Ok(GetTarget::ConcurrentConnections),
            "transferred-bytes" => Ok(GetTarget::TransferredBytes),
            "proxy-users" => Ok(GetTarget::ProxyUsersList),
            "admin-users" => Ok(GetTarget::AdminUsersList),
            other => Err(format!(
                "unknown target '{other}' (expected historic-connections, \
                 concurrent-connections, transferred-bytes, proxy-users or admin-users)"
            )),
        }
    }
}

/// Targets writable with the `config` method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigTarget {
    ToggleDissector = 0x00,
    AddProxyUser = 0x01,
    AddAdminUser = 0x02,
    DelProxyUser = 0x03,
    DelAdminUser = 0x04,
}

impl ConfigTarget {
    fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(ConfigTarget::ToggleDissector),
            0x01 => Some(ConfigTarget::AddProxyUser),
            0x02 => Some(ConfigTarget::AddAdminUser),
            0x03 => Some(ConfigTarget::DelProxyUser),
            0x04 => Some(ConfigTarget::DelAdminUser),
            _ => None,
        }
    }
}

/// Response status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok = 0x00,
    InvalidVersion = 0x01,
    InvalidMethod = 0x02,
    InvalidTarget = 0x03,
    InvalidData = 0x04,
    AuthError = 0x05,
    ServerError = 0x06,
}

impl TryFrom<u8> for Status {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Status::Ok),
            0x01 => Ok(Status::InvalidVersion),
            0x02 => Ok(Status::InvalidMethod),
            0x03 => Ok(Status::InvalidTarget),
            0x04 => Ok(Status::InvalidData),
            0x05 => Ok(Status::AuthError),
            0x06 => Ok(Status::ServerError),
            other => Err(DecodeError::InvalidStatus(other)),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Ok => "ok",
            Status::InvalidVersion => "invalid version",
            Status::InvalidMethod => "invalid method",
            Status::InvalidTarget => "invalid target",
            Status::InvalidData => "invalid data",
            Status::AuthError => "authentication failed",
            Status::ServerError => "server error",
        };
        f.write_str(text)
    }
}

// ============================================================================
// Token
// ============================================================================

/// Fixed-length authentication token.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token([u8; TOKEN_LEN]);

impl Token {
    pub fn new(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtoError> {
        let array: [u8; TOKEN_LEN] = bytes
            .try_into()
            .map_err(|_| ProtoError::InvalidToken(bytes.len()))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }
}

impl FromStr for Token {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_slice(s.as_bytes())
    }
}

// Tokens never show up in logs.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A request command, keyed by method and target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Read a counter or a user list.
    Get(GetTarget),
    /// Enable or disable the traffic dissector flag.
    ToggleDissector(bool),
    AddProxyUser { username: String, password: String },
    AddAdminUser { username: String, token: Token },
    DelProxyUser { username: String },
    DelAdminUser { username: String },
}

impl Command {
    pub fn method(&self) -> Method {
        match self {
            Command::Get(_) => Method::Get,
            _ => Method::Config,
        }
    }

    /// Raw target byte for this command.
    pub fn target(&self) -> u8 {
        match self {
            Command::Get(target) => *target as u8,
            Command::ToggleDissector(_) => ConfigTarget::ToggleDissector as u8,
            Command::AddProxyUser { .. } => ConfigTarget::AddProxyUser as u8,
            Command::AddAdminUser { .. } => ConfigTarget::AddAdminUser as u8,
            Command::DelProxyUser { .. } => ConfigTarget::DelProxyUser as u8,
            Command::DelAdminUser { .. } => ConfigTarget::DelAdminUser as u8,
        }
    }

    /// Serialize the method-specific payload.
    fn encode_data(&self) -> Result<Vec<u8>, ProtoError> {
        let data = match self {
            Command::Get(_) => Vec::new(),
            Command::ToggleDissector(enabled) => vec![u8::from(*enabled)],
            Command::AddProxyUser { username, password } => {
                validate_username(username.as_bytes()).map_err(ProtoError::InvalidUsername)?;
                validate_password(password.as_bytes()).map_err(ProtoError::InvalidPassword)?;
                join_pair(username.as_bytes(), password.as_bytes())
            }
            Command::AddAdminUser { username, token } => {
                validate_username(username.as_bytes()).map_err(ProtoError::InvalidUsername)?;
                join_pair(username.as_bytes(), token.as_bytes())
            }
            Command::DelProxyUser { username } | Command::DelAdminUser { username } => {
                validate_username(username.as_bytes()).map_err(ProtoError::InvalidUsername)?;
                username.as_bytes().to_vec()
            }
        };

        if data.len() > MAX_DATA_LEN {
            return Err(ProtoError::PayloadTooLarge(data.len()));
        }
        Ok(data)
    }

    /// Decode the payload for an already-validated method/target pair.
    fn decode_data(method: Method, target: u8, data: &[u8]) -> Result<Self, DecodeError> {
        match method {
            Method::Get => {
                let target = GetTarget::from_byte(target)
                    .ok_or(DecodeError::InvalidTarget { method, target })?;
                // Older clients send a single optional byte; it carries no meaning.
                if data.len() > 1 {
                    return Err(DecodeError::InvalidData(format!(
                        "get requests carry at most 1 data byte, got {}",
                        data.len()
                    )));
                }
                Ok(Command::Get(target))
            }
            Method::Config => {
                let target = ConfigTarget::from_byte(target)
                    .ok_or(DecodeError::InvalidTarget { method, target })?;
                match target {
                    ConfigTarget::ToggleDissector => match data {
                        [0] => Ok(Command::ToggleDissector(false)),
                        [1] => Ok(Command::ToggleDissector(true)),
                        _ => Err(DecodeError::InvalidData(
                            "dissector toggle must be a single 0 or 1 byte".to_string(),
                        )),
                    },
                    ConfigTarget::AddProxyUser => {
                        let (user, pass) = split_pair(data)?;
                        validate_password(pass).map_err(DecodeError::InvalidData)?;
                        Ok(Command::AddProxyUser {
                            username: utf8(user)?,
                            password: utf8(pass)?,
                        })
                    }
                    ConfigTarget::AddAdminUser => {
                        let (user, token) = split_pair(data)?;
                        let token = Token::from_slice(token)
                            .map_err(|e| DecodeError::InvalidData(e.to_string()))?;
                        Ok(Command::AddAdminUser {
                            username: utf8(user)?,
                            token,
                        })
                    }
                    ConfigTarget::DelProxyUser => {
                        validate_username(data).map_err(DecodeError::InvalidData)?;
                        Ok(Command::DelProxyUser {
                            username: utf8(data)?,
                        })
                    }
                    ConfigTarget::DelAdminUser => {
                        validate_username(data).map_err(DecodeError::InvalidData)?;
                        Ok(Command::DelAdminUser {
                            username: utf8(data)?,
                        })
                    }
                }
            }
        }
    }
}

/// Fixed-length request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub version: u8,
    pub token: Token,
    pub method: u8,
    pub target: u8,
    pub data_len: u16,
}

impl RequestHeader {
    /// Decode the fixed header.
    ///
    /// Only the framing is checked here; version, method and target are
    /// validated by [`Request::decode`] so the caller can read the payload
    /// before answering.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }

        let mut token = [0u8; TOKEN_LEN];
        token.copy_from_slice(&bytes[1..1 + TOKEN_LEN]);
        let rest = &bytes[1 + TOKEN_LEN..HEADER_LEN];

        Ok(Self {
            version: bytes[0],
            token: Token::new(token),
            method: rest[0],
            target: rest[1],
            data_len: u16::from_be_bytes([rest[2], rest[3]]),
        })
    }
}

/// A complete administrative request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub token: Token,
    pub command: Command,
}

impl Request {
    pub fn new(token: Token, command: Command) -> Self {
        Self { token, command }
    }

    /// Serialize the request into its wire representation.
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let data = self.command.encode_data()?;
        let mut buf = Vec::with_capacity(HEADER_LEN + data.len());

        buf.push(PROTOCOL_VERSION);
        buf.extend_from_slice(self.token.as_bytes());
        buf.push(self.command.method() as u8);
        buf.push(self.command.target());
        buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&data);

        Ok(buf)
    }

    /// Build a request from a decoded header and its payload.
    ///
    /// Checks are applied in wire order: version, method, target, data.
    pub fn decode(header: &RequestHeader, data: &[u8]) -> Result<Self, DecodeError> {
        if header.version != PROTOCOL_VERSION {
            return Err(DecodeError::InvalidVersion(header.version));
        }
        let method = Method::try_from(header.method)?;

        // Target before length, so an unknown target is reported as such.
        let known_target = match method {
            Method::Get => GetTarget::from_byte(header.target).is_some(),
            Method::Config => ConfigTarget::from_byte(header.target).is_some(),
        };
        if !known_target {
            return Err(DecodeError::InvalidTarget {
                method,
                target: header.target,
            });
        }

        if data.len() != header.data_len as usize {
            return Err(DecodeError::InvalidData(format!(
                "declared {} data bytes, received {}",
                header.data_len,
                data.len()
            )));
        }

        let command = Command::decode_data(method, header.target, data)?;
        Ok(Self {
            token: header.token,
            command,
        })
    }

    /// Decode a request held entirely in one buffer.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let header = RequestHeader::decode(bytes)?;
        Self::decode(&header, &bytes[HEADER_LEN..])
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Data carried by a successful `get` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Counter(u32),
    Names(Vec<String>),
}

/// A complete administrative response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub body: Option<ResponseBody>,
}

impl Response {
    /// Successful response without data (config requests).
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            body: None,
        }
    }

    pub fn counter(value: u32) -> Self {
        Self {
            status: Status::Ok,
            body: Some(ResponseBody::Counter(value)),
        }
    }

    pub fn names(names: Vec<String>) -> Self {
        Self {
            status: Status::Ok,
            body: Some(ResponseBody::Names(names)),
        }
    }

    /// Error response; carries the status byte only.
    pub fn error(status: Status) -> Self {
        Self { status, body: None }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let mut buf = vec![self.status as u8];

        let data = match &self.body {
            None => return Ok(buf),
            Some(ResponseBody::Counter(value)) => value.to_be_bytes().to_vec(),
            Some(ResponseBody::Names(names)) => names.join("\0").into_bytes(),
        };
        if data.len() > MAX_DATA_LEN {
            return Err(ProtoError::PayloadTooLarge(data.len()));
        }

        buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&data);
        Ok(buf)
    }

    /// Decode a response to `command`.
    ///
    /// The payload layout depends on the request target, so the command that
    /// produced this response has to be supplied.
    pub fn decode(bytes: &[u8], command: &Command) -> Result<Self, DecodeError> {
        let Some((&status, rest)) = bytes.split_first() else {
            return Err(DecodeError::Truncated {
                needed: 1,
                available: 0,
            });
        };
        let status = Status::try_from(status)?;

        let target = match command {
            Command::Get(target) if status == Status::Ok => *target,
            _ => return Ok(Self::error(status)),
        };

        if rest.len() < 2 {
            return Err(DecodeError::Truncated {
                needed: 3,
                available: bytes.len(),
            });
        }
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        let data = &rest[2..];
        if data.len() < len {
            return Err(DecodeError::Truncated {
                needed: 3 + len,
                available: bytes.len(),
            });
        }
        let data = &data[..len];

        let body = if target.is_numeric() {
            let counter: [u8; 4] = data.try_into().map_err(|_| {
                DecodeError::InvalidData(format!("counter must be 4 bytes, got {}", data.len()))
            })?;
            ResponseBody::Counter(u32::from_be_bytes(counter))
        } else if data.is_empty() {
            ResponseBody::Names(Vec::new())
        } else {
            let names = data
                .split(|&b| b == 0)
                .map(utf8)
                .collect::<Result<Vec<_>, _>>()?;
            ResponseBody::Names(names)
        };

        Ok(Self {
            status,
            body: Some(body),
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn validate_username(name: &[u8]) -> Result<(), String> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(format!(
            "username must be 1..={MAX_NAME_LEN} bytes, got {}",
            name.len()
        ));
    }
    if name.iter().any(|&b| b == 0 || b == USER_SEPARATOR) {
        return Err("username must not contain NUL or ':'".to_string());
    }
    Ok(())
}

fn validate_password(password: &[u8]) -> Result<(), String> {
    if password.is_empty() || password.len() > MAX_NAME_LEN {
        return Err(format!(
            "password must be 1..={MAX_NAME_LEN} bytes, got {}",
            password.len()
        ));
    }
    if password.contains(&0) {
        return Err("password must not contain NUL".to_string());
    }
    Ok(())
}

fn join_pair(user: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(user.len() + 1 + secret.len());
    data.extend_from_slice(user);
    data.push(USER_SEPARATOR);
    data.extend_from_slice(secret);
    data
}

/// Split `user:secret` at the first separator and validate the username.
fn split_pair(data: &[u8]) -> Result<(&[u8], &[u8]), DecodeError> {
    let pos = data
        .iter()
        .position(|&b| b == USER_SEPARATOR)
        .ok_or_else(|| DecodeError::InvalidData("missing ':' separator".to_string()))?;
    let (user, secret) = (&data[..pos], &data[pos + 1..]);
    validate_username(user).map_err(DecodeError::InvalidData)?;
    Ok((user, secret))
}

fn utf8(bytes: &[u8]) -> Result<String, DecodeError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| DecodeError::InvalidData("names must be valid UTF-8".to_string()))
}

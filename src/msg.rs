//! Control protocol messages
//!
//! Every message on the wire is a single-byte tag, a big-endian u64 length
//! and a JSON payload. The tag selects the variant; unknown tags terminate
//! the connection.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Serialize binary payloads as base64 strings inside JSON messages
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Login {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub user: String,
    /// HMAC-SHA256(token, timestamp), hex encoded
    #[serde(default)]
    pub auth_key: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub pool_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LoginResp {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub server_udp_port: u16,
    #[serde(default)]
    pub error: String,
}

/// Proxy declaration sent by the client; mirrors the shape-specific parts
/// of the proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NewProxy {
    pub proxy_name: String,
    pub proxy_type: String,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub group_key: String,
    #[serde(default)]
    pub proxy_protocol_version: String,
    // tcp, udp
    #[serde(default)]
    pub remote_port: u16,
    // http, https
    #[serde(default)]
    pub custom_domains: Vec<String>,
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub http_user: String,
    #[serde(default)]
    pub http_pwd: String,
    #[serde(default)]
    pub host_header_rewrite: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    // stcp, xtcp
    #[serde(default)]
    pub sk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NewProxyResp {
    pub proxy_name: String,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CloseProxy {
    pub proxy_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ReqWorkConn {}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NewWorkConn {
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StartWorkConn {
    pub proxy_name: String,
    #[serde(default)]
    pub src_addr: String,
    #[serde(default)]
    pub src_port: u16,
    #[serde(default)]
    pub dst_addr: String,
    #[serde(default)]
    pub dst_port: u16,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NewVisitorConn {
    pub proxy_name: String,
    /// HMAC-SHA256(sk, timestamp), hex encoded
    #[serde(default)]
    pub sign_key: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NewVisitorConnResp {
    pub proxy_name: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Ping {}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Pong {}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct UdpPacket {
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    #[serde(default)]
    pub local_addr: Option<SocketAddr>,
    #[serde(default)]
    pub remote_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NatHoleVisitor {
    pub proxy_name: String,
    #[serde(default)]
    pub sign_key: String,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NatHoleClient {
    pub proxy_name: String,
    pub sid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NatHoleResp {
    pub sid: String,
    #[serde(default)]
    pub visitor_addr: String,
    #[serde(default)]
    pub client_addr: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NatHoleSid {
    pub sid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NatHoleClientDetectOk {}

/// A control protocol message, tagged on the wire by a printable byte
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Login(Login),
    LoginResp(LoginResp),
    NewProxy(NewProxy),
    NewProxyResp(NewProxyResp),
    CloseProxy(CloseProxy),
    ReqWorkConn(ReqWorkConn),
    NewWorkConn(NewWorkConn),
    StartWorkConn(StartWorkConn),
    NewVisitorConn(NewVisitorConn),
    NewVisitorConnResp(NewVisitorConnResp),
    Ping(Ping),
    Pong(Pong),
    UdpPacket(UdpPacket),
    NatHoleVisitor(NatHoleVisitor),
    NatHoleClient(NatHoleClient),
    NatHoleResp(NatHoleResp),
    NatHoleSid(NatHoleSid),
    NatHoleClientDetectOk(NatHoleClientDetectOk),
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::Login(_) => b'o',
            Message::LoginResp(_) => b'1',
            Message::NewProxy(_) => b'p',
            Message::NewProxyResp(_) => b'2',
            Message::CloseProxy(_) => b'c',
            Message::ReqWorkConn(_) => b'r',
            Message::NewWorkConn(_) => b'w',
            Message::StartWorkConn(_) => b's',
            Message::NewVisitorConn(_) => b'v',
            Message::NewVisitorConnResp(_) => b'3',
            Message::Ping(_) => b'h',
            Message::Pong(_) => b'4',
            Message::UdpPacket(_) => b'u',
            Message::NatHoleVisitor(_) => b'i',
            Message::NatHoleClient(_) => b'n',
            Message::NatHoleResp(_) => b'm',
            Message::NatHoleSid(_) => b'5',
            Message::NatHoleClientDetectOk(_) => b'd',
        }
    }

    /// Human-readable variant name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Message::Login(_) => "Login",
            Message::LoginResp(_) => "LoginResp",
            Message::NewProxy(_) => "NewProxy",
            Message::NewProxyResp(_) => "NewProxyResp",
            Message::CloseProxy(_) => "CloseProxy",
            Message::ReqWorkConn(_) => "ReqWorkConn",
            Message::NewWorkConn(_) => "NewWorkConn",
            Message::StartWorkConn(_) => "StartWorkConn",
            Message::NewVisitorConn(_) => "NewVisitorConn",
            Message::NewVisitorConnResp(_) => "NewVisitorConnResp",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::UdpPacket(_) => "UdpPacket",
            Message::NatHoleVisitor(_) => "NatHoleVisitor",
            Message::NatHoleClient(_) => "NatHoleClient",
            Message::NatHoleResp(_) => "NatHoleResp",
            Message::NatHoleSid(_) => "NatHoleSid",
            Message::NatHoleClientDetectOk(_) => "NatHoleClientDetectOk",
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Message::Login(m) => serde_json::to_vec(m)?,
            Message::LoginResp(m) => serde_json::to_vec(m)?,
            Message::NewProxy(m) => serde_json::to_vec(m)?,
            Message::NewProxyResp(m) => serde_json::to_vec(m)?,
            Message::CloseProxy(m) => serde_json::to_vec(m)?,
            Message::ReqWorkConn(m) => serde_json::to_vec(m)?,
            Message::NewWorkConn(m) => serde_json::to_vec(m)?,
            Message::StartWorkConn(m) => serde_json::to_vec(m)?,
            Message::NewVisitorConn(m) => serde_json::to_vec(m)?,
            Message::NewVisitorConnResp(m) => serde_json::to_vec(m)?,
            Message::Ping(m) => serde_json::to_vec(m)?,
            Message::Pong(m) => serde_json::to_vec(m)?,
            Message::UdpPacket(m) => serde_json::to_vec(m)?,
            Message::NatHoleVisitor(m) => serde_json::to_vec(m)?,
            Message::NatHoleClient(m) => serde_json::to_vec(m)?,
            Message::NatHoleResp(m) => serde_json::to_vec(m)?,
            Message::NatHoleSid(m) => serde_json::to_vec(m)?,
            Message::NatHoleClientDetectOk(m) => serde_json::to_vec(m)?,
        };
        Ok(payload)
    }

    pub fn decode(tag: u8, payload: &[u8]) -> Result<Message> {
        let msg = match tag {
            b'o' => Message::Login(serde_json::from_slice(payload)?),
            b'1' => Message::LoginResp(serde_json::from_slice(payload)?),
            b'p' => Message::NewProxy(serde_json::from_slice(payload)?),
            b'2' => Message::NewProxyResp(serde_json::from_slice(payload)?),
            b'c' => Message::CloseProxy(serde_json::from_slice(payload)?),
            b'r' => Message::ReqWorkConn(serde_json::from_slice(payload)?),
            b'w' => Message::NewWorkConn(serde_json::from_slice(payload)?),
            b's' => Message::StartWorkConn(serde_json::from_slice(payload)?),
            b'v' => Message::NewVisitorConn(serde_json::from_slice(payload)?),
            b'3' => Message::NewVisitorConnResp(serde_json::from_slice(payload)?),
            b'h' => Message::Ping(serde_json::from_slice(payload)?),
            b'4' => Message::Pong(serde_json::from_slice(payload)?),
            b'u' => Message::UdpPacket(serde_json::from_slice(payload)?),
            b'i' => Message::NatHoleVisitor(serde_json::from_slice(payload)?),
            b'n' => Message::NatHoleClient(serde_json::from_slice(payload)?),
            b'm' => Message::NatHoleResp(serde_json::from_slice(payload)?),
            b'5' => Message::NatHoleSid(serde_json::from_slice(payload)?),
            b'd' => Message::NatHoleClientDetectOk(serde_json::from_slice(payload)?),
            other => {
                return Err(Error::Codec(format!("unknown message tag 0x{:02x}", other)));
            }
        };
        Ok(msg)
    }
}

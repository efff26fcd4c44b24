//! Inbound and user records
//!
//! Protocol-specific settings are a tagged variant keyed by protocol name.
//! Field names inside each variant follow the engine's native JSON schema so
//! the settings can be handed to the engine without translation.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Prefix for tags derived from the listening port
pub const TAG_PREFIX: &str = "inbound-";

/// Tag assigned to an inbound that does not carry an explicit one
pub fn derive_tag(port: u16) -> String {
    format!("{}{}", TAG_PREFIX, port)
}

/// SHA-256 hex digest used for stored credentials
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Account role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    /// Restricted account that only sees the inbounds it owns
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Viewer => "viewer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }
}

/// A stored user account
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn password_matches(&self, password: &str) -> bool {
        self.password_hash == hash_password(password)
    }

    /// True if `user_id` is this account or this account is an administrator
    pub fn is_self_or_admin(&self, user_id: i64) -> bool {
        self.is_admin() || self.id == user_id
    }
}

/// Account to be created; the password is hashed by the store
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmessClient {
    pub id: String,
    #[serde(rename = "alterId", default)]
    pub alter_id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmessSettings {
    pub clients: Vec<VmessClient>,
    #[serde(rename = "disableInsecureEncryption", default)]
    pub disable_insecure_encryption: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VlessClient {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VlessSettings {
    pub clients: Vec<VlessClient>,
    #[serde(default = "default_decryption")]
    pub decryption: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrojanClient {
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrojanSettings {
    pub clients: Vec<TrojanClient>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowsocksSettings {
    pub method: String,
    pub password: String,
    #[serde(default = "default_network")]
    pub network: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocksSettings {
    #[serde(default = "default_socks_auth")]
    pub auth: String,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub udp: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(rename = "allowTransparent", default)]
    pub allow_transparent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DokodemoSettings {
    pub address: String,
    pub port: u16,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(rename = "followRedirect", default)]
    pub follow_redirect: bool,
}

/// Protocol-specific settings of an inbound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", content = "settings", rename_all = "kebab-case")]
pub enum ProtocolSettings {
    Vmess(VmessSettings),
    Vless(VlessSettings),
    Trojan(TrojanSettings),
    Shadowsocks(ShadowsocksSettings),
    Socks(SocksSettings),
    Http(HttpSettings),
    DokodemoDoor(DokodemoSettings),
}

const SHADOWSOCKS_METHODS: &[&str] = &[
    "aes-128-gcm",
    "aes-256-gcm",
    "chacha20-poly1305",
    "chacha20-ietf-poly1305",
    "xchacha20-poly1305",
    "2022-blake3-aes-128-gcm",
    "2022-blake3-aes-256-gcm",
    "2022-blake3-chacha20-poly1305",
];

impl ProtocolSettings {
    /// Protocol name as used by the engine
    pub fn protocol(&self) -> &'static str {
        match self {
            ProtocolSettings::Vmess(_) => "vmess",
            ProtocolSettings::Vless(_) => "vless",
            ProtocolSettings::Trojan(_) => "trojan",
            ProtocolSettings::Shadowsocks(_) => "shadowsocks",
            ProtocolSettings::Socks(_) => "socks",
            ProtocolSettings::Http(_) => "http",
            ProtocolSettings::DokodemoDoor(_) => "dokodemo-door",
        }
    }

    /// Rebuild typed settings from a protocol name and its raw settings payload
    pub fn from_parts(protocol: &str, settings: Value) -> Result<Self> {
        let tagged = serde_json::json!({ "protocol": protocol, "settings": settings });
        serde_json::from_value(tagged).map_err(|e| {
            Error::InvalidConfig(format!("settings for protocol '{}': {}", protocol, e))
        })
    }

    /// The settings payload without the protocol tag
    pub fn settings_value(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("settings").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Check protocol-specific requirements the engine would otherwise reject at start
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));
        match self {
            ProtocolSettings::Vmess(s) => {
                if s.clients.is_empty() {
                    return invalid("vmess: at least one client is required".to_string());
                }
                for client in &s.clients {
                    if uuid::Uuid::parse_str(&client.id).is_err() {
                        return invalid(format!("vmess: client id '{}' is not a UUID", client.id));
                    }
                }
            }
            ProtocolSettings::Vless(s) => {
                if s.clients.is_empty() {
                    return invalid("vless: at least one client is required".to_string());
                }
                for client in &s.clients {
                    if uuid::Uuid::parse_str(&client.id).is_err() {
                        return invalid(format!("vless: client id '{}' is not a UUID", client.id));
                    }
                }
            }
            ProtocolSettings::Trojan(s) => {
                if s.clients.is_empty() {
                    return invalid("trojan: at least one client is required".to_string());
                }
                if s.clients.iter().any(|c| c.password.is_empty()) {
                    return invalid("trojan: client password must not be empty".to_string());
                }
            }
            ProtocolSettings::Shadowsocks(s) => {
                if !SHADOWSOCKS_METHODS.contains(&s.method.as_str()) {
                    return invalid(format!("shadowsocks: unsupported method '{}'", s.method));
                }
                if s.password.is_empty() {
                    return invalid("shadowsocks: password must not be empty".to_string());
                }
            }
            ProtocolSettings::Socks(s) => match s.auth.as_str() {
                "noauth" => {}
                "password" if !s.accounts.is_empty() => {}
                "password" => {
                    return invalid("socks: password auth requires accounts".to_string());
                }
                other => return invalid(format!("socks: unknown auth '{}'", other)),
            },
            ProtocolSettings::Http(_) => {}
            ProtocolSettings::DokodemoDoor(s) => {
                if s.address.is_empty() {
                    return invalid("dokodemo-door: address is required".to_string());
                }
                if s.port == 0 {
                    return invalid("dokodemo-door: port must be greater than 0".to_string());
                }
            }
        }
        Ok(())
    }
}

/// A stored inbound
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inbound {
    pub id: i64,
    #[serde(rename = "userId")]
    pub user_id: i64,
    pub remark: String,
    pub enable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    pub port: u16,
    #[serde(flatten)]
    pub protocol: ProtocolSettings,
    #[serde(rename = "streamSettings", skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<Value>,
    pub tag: String,
}

/// Inbound submitted for creation; id, owner and enable flag are assigned by the registry
#[derive(Debug, Clone)]
pub struct NewInbound {
    pub remark: String,
    pub listen: Option<String>,
    pub port: u16,
    pub protocol: ProtocolSettings,
    pub stream_settings: Option<Value>,
    pub sniffing: Option<Value>,
    /// Explicit tag; derived from the port when absent or empty
    pub tag: Option<String>,
}

impl NewInbound {
    pub fn new(port: u16, protocol: ProtocolSettings) -> Self {
        Self {
            remark: String::new(),
            listen: None,
            port,
            protocol,
            stream_settings: None,
            sniffing: None,
            tag: None,
        }
    }

    /// Set the human-readable label (builder pattern)
    pub fn with_remark(mut self, remark: &str) -> Self {
        self.remark = remark.to_string();
        self
    }

    /// Set an explicit tag (builder pattern)
    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }
}

/// Partial update; `None` leaves the stored value untouched
#[derive(Debug, Clone, Default)]
pub struct InboundUpdate {
    pub remark: Option<String>,
    pub enable: Option<bool>,
    pub listen: Option<String>,
    pub port: Option<u16>,
    pub protocol: Option<ProtocolSettings>,
    pub stream_settings: Option<Value>,
    pub sniffing: Option<Value>,
    /// An empty tag is re-derived from the port
    pub tag: Option<String>,
}

fn default_decryption() -> String {
    "none".to_string()
}

fn default_network() -> String {
    "tcp,udp".to_string()
}

fn default_socks_auth() -> String {
    "noauth".to_string()
}

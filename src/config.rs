//! Configuration model and INI loading
//!
//! Both binaries read an INI file: a `[common]` section for globals and one
//! section per proxy. `[range:name]` sections expand `local_port` /
//! `remote_port` lists pairwise into `name_0..name_k`. Unknown keys are
//! ignored except `plugin_*` and `header_*`, which are collected into maps.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::time::Duration;

use configparser::ini::Ini;

use crate::error::{Error, Result};
use crate::logger::LogLevel;
use crate::msg::NewProxy;
use crate::ports::parse_allow_ports;
use crate::proxy_protocol::ProxyProtocolVersion;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

type Section = HashMap<String, Option<String>>;
type IniMap = HashMap<String, Section>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyType {
    Tcp,
    Udp,
    Http,
    Https,
    Stcp,
    Xtcp,
}

impl ProxyType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(ProxyType::Tcp),
            "udp" => Ok(ProxyType::Udp),
            "http" => Ok(ProxyType::Http),
            "https" => Ok(ProxyType::Https),
            "stcp" => Ok(ProxyType::Stcp),
            "xtcp" => Ok(ProxyType::Xtcp),
            other => Err(Error::Config(format!("unknown proxy type: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Tcp => "tcp",
            ProxyType::Udp => "udp",
            ProxyType::Http => "http",
            ProxyType::Https => "https",
            ProxyType::Stcp => "stcp",
            ProxyType::Xtcp => "xtcp",
        }
    }
}

impl std::fmt::Display for ProxyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckType {
    Tcp,
    Http,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckConf {
    pub check_type: HealthCheckType,
    pub url: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub max_failed: u32,
}

/// One declared service exposure
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConf {
    pub name: String,
    pub proxy_type: ProxyType,
    pub use_encryption: bool,
    pub use_compression: bool,
    pub group: String,
    pub group_key: String,
    pub proxy_protocol_version: String,
    pub local_ip: String,
    pub local_port: u16,
    pub plugin: String,
    pub plugin_params: HashMap<String, String>,
    pub health_check: Option<HealthCheckConf>,
    // tcp / udp
    pub remote_port: u16,
    // http / https
    pub custom_domains: Vec<String>,
    pub subdomain: String,
    pub locations: Vec<String>,
    pub http_user: String,
    pub http_pwd: String,
    pub host_header_rewrite: String,
    pub headers: HashMap<String, String>,
    // stcp / xtcp
    pub sk: String,
}

impl ProxyConf {
    pub fn validate(&self) -> Result<()> {
        ProxyProtocolVersion::parse(&self.proxy_protocol_version)?;
        match self.proxy_type {
            ProxyType::Tcp | ProxyType::Udp => {}
            ProxyType::Http | ProxyType::Https => {
                if self.custom_domains.is_empty() && self.subdomain.is_empty() {
                    return Err(Error::Config(format!(
                        "proxy [{}] needs custom_domains or subdomain",
                        self.name
                    )));
                }
            }
            ProxyType::Stcp | ProxyType::Xtcp => {
                if self.sk.is_empty() {
                    return Err(Error::Config(format!("proxy [{}] needs sk", self.name)));
                }
            }
        }
        if self.plugin.is_empty() && self.local_port == 0 {
            return Err(Error::Config(format!(
                "proxy [{}] needs local_port or plugin",
                self.name
            )));
        }
        Ok(())
    }

    /// The declaration sent to the server. Local-only settings (local
    /// service endpoint, plugin, health check) stay on the client.
    pub fn to_new_proxy(&self) -> NewProxy {
        NewProxy {
            proxy_name: self.name.clone(),
            proxy_type: self.proxy_type.as_str().to_string(),
            use_encryption: self.use_encryption,
            use_compression: self.use_compression,
            group: self.group.clone(),
            group_key: self.group_key.clone(),
            proxy_protocol_version: self.proxy_protocol_version.clone(),
            remote_port: self.remote_port,
            custom_domains: self.custom_domains.clone(),
            subdomain: self.subdomain.clone(),
            locations: self.locations.clone(),
            http_user: self.http_user.clone(),
            http_pwd: self.http_pwd.clone(),
            host_header_rewrite: self.host_header_rewrite.clone(),
            headers: self.headers.clone(),
            sk: self.sk.clone(),
        }
    }
}

/// Visitor side of an STCP/XTCP proxy, local to the initiating client
#[derive(Debug, Clone, PartialEq)]
pub struct VisitorConf {
    pub name: String,
    pub proxy_type: ProxyType,
    pub server_name: String,
    pub sk: String,
    pub bind_addr: String,
    pub bind_port: u16,
    pub use_encryption: bool,
    pub use_compression: bool,
}

/// Server-side `[common]` settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub bind_port: u16,
    pub bind_udp_port: u16,
    pub kcp_bind_port: u16,
    pub proxy_bind_addr: String,
    pub vhost_http_port: u16,
    pub vhost_https_port: u16,
    pub vhost_http_timeout: Duration,
    pub subdomain_host: String,
    pub allow_ports: Vec<RangeInclusive<u16>>,
    pub token: String,
    pub heartbeat_timeout: Duration,
    pub max_pool_count: usize,
    pub tcp_mux: bool,
    pub log_level: Option<LogLevel>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 7000,
            bind_udp_port: 0,
            kcp_bind_port: 0,
            proxy_bind_addr: "0.0.0.0".to_string(),
            vhost_http_port: 0,
            vhost_https_port: 0,
            vhost_http_timeout: Duration::from_secs(60),
            subdomain_host: String::new(),
            allow_ports: Vec::new(),
            token: String::new(),
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            max_pool_count: 5,
            tcp_mux: true,
            log_level: None,
        }
    }
}

/// Dial protocol for the client's control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Kcp,
    Websocket,
}

impl Protocol {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "kcp" => Ok(Protocol::Kcp),
            "websocket" => Ok(Protocol::Websocket),
            other => Err(Error::Config(format!("unknown protocol: {}", other))),
        }
    }
}

/// Client-side `[common]` settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub server_port: u16,
    pub user: String,
    pub token: String,
    pub protocol: Protocol,
    pub tls_enable: bool,
    pub http_proxy: Option<String>,
    pub pool_count: usize,
    pub tcp_mux: bool,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub login_fail_exit: bool,
    pub log_level: Option<LogLevel>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1".to_string(),
            server_port: 7000,
            user: String::new(),
            token: String::new(),
            protocol: Protocol::Tcp,
            tls_enable: false,
            http_proxy: None,
            pool_count: 1,
            tcp_mux: true,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            login_fail_exit: true,
            log_level: None,
        }
    }
}

fn parse_ini(content: &str) -> Result<IniMap> {
    let mut ini = Ini::new();
    ini.read(content.to_string())
        .map_err(|e| Error::Config(format!("INI parse error: {}", e)))
}

fn get_str(section: &Section, key: &str) -> Option<String> {
    section.get(key).and_then(|v| v.clone())
}

fn get_bool(section: &Section, key: &str, default: bool) -> Result<bool> {
    match get_str(section, key) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(Error::Config(format!("bad boolean for {}: {}", key, other))),
        },
    }
}

fn get_u16(section: &Section, key: &str, default: u16) -> Result<u16> {
    match get_str(section, key) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| Error::Config(format!("bad number for {}: {}", key, v))),
    }
}

fn get_u64(section: &Section, key: &str, default: u64) -> Result<u64> {
    match get_str(section, key) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| Error::Config(format!("bad number for {}: {}", key, v))),
    }
}

fn get_list(section: &Section, key: &str) -> Vec<String> {
    get_str(section, key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Load the server configuration from INI text.
pub fn load_server_config(content: &str) -> Result<ServerConfig> {
    let map = parse_ini(content)?;
    let empty = Section::new();
    let common = map.get("common").unwrap_or(&empty);

    let mut config = ServerConfig::default();
    if let Some(v) = get_str(common, "bind_addr") {
        config.bind_addr = v;
    }
    config.bind_port = get_u16(common, "bind_port", config.bind_port)?;
    config.bind_udp_port = get_u16(common, "bind_udp_port", 0)?;
    config.kcp_bind_port = get_u16(common, "kcp_bind_port", 0)?;
    config.proxy_bind_addr = get_str(common, "proxy_bind_addr").unwrap_or(config.bind_addr.clone());
    config.vhost_http_port = get_u16(common, "vhost_http_port", 0)?;
    config.vhost_https_port = get_u16(common, "vhost_https_port", 0)?;
    config.vhost_http_timeout = Duration::from_secs(get_u64(common, "vhost_http_timeout_s", 60)?);
    config.subdomain_host = get_str(common, "subdomain_host").unwrap_or_default();
    if let Some(ports) = get_str(common, "allow_ports") {
        config.allow_ports = parse_allow_ports(&ports)?;
    }
    config.token = get_str(common, "token").unwrap_or_default();
    config.heartbeat_timeout = Duration::from_secs(get_u64(
        common,
        "heartbeat_timeout_s",
        DEFAULT_HEARTBEAT_TIMEOUT.as_secs(),
    )?);
    config.max_pool_count = get_u64(common, "max_pool_count", 5)? as usize;
    config.tcp_mux = get_bool(common, "tcp_mux", true)?;
    config.log_level = get_str(common, "log_level").and_then(|v| LogLevel::parse(&v));
    Ok(config)
}

/// Load the client configuration: `[common]` plus proxy and visitor sections.
pub fn load_client_config(
    content: &str,
) -> Result<(
    ClientConfig,
    HashMap<String, ProxyConf>,
    HashMap<String, VisitorConf>,
)> {
    let map = parse_ini(content)?;
    let empty = Section::new();
    let common = map.get("common").unwrap_or(&empty);

    let mut config = ClientConfig::default();
    if let Some(v) = get_str(common, "server_addr") {
        config.server_addr = v;
    }
    config.server_port = get_u16(common, "server_port", config.server_port)?;
    config.user = get_str(common, "user").unwrap_or_default();
    config.token = get_str(common, "token").unwrap_or_default();
    if let Some(v) = get_str(common, "protocol") {
        config.protocol = Protocol::parse(&v)?;
    }
    config.tls_enable = get_bool(common, "tls_enable", false)?;
    config.http_proxy = get_str(common, "http_proxy").filter(|v| !v.is_empty());
    config.pool_count = get_u64(common, "pool_count", 1)? as usize;
    config.tcp_mux = get_bool(common, "tcp_mux", true)?;
    config.heartbeat_interval = Duration::from_secs(get_u64(
        common,
        "heartbeat_interval_s",
        DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
    )?);
    config.heartbeat_timeout = Duration::from_secs(get_u64(
        common,
        "heartbeat_timeout_s",
        DEFAULT_HEARTBEAT_TIMEOUT.as_secs(),
    )?);
    config.login_fail_exit = get_bool(common, "login_fail_exit", true)?;
    config.log_level = get_str(common, "log_level").and_then(|v| LogLevel::parse(&v));

    let mut proxies = HashMap::new();
    let mut visitors = HashMap::new();
    for (section_name, section) in &map {
        if section_name == "common" || section_name == "default" {
            continue;
        }

        if let Some(base_name) = section_name.strip_prefix("range:") {
            for conf in expand_range_section(base_name, section)? {
                proxies.insert(conf.name.clone(), conf);
            }
            continue;
        }

        if get_str(section, "role").as_deref() == Some("visitor") {
            let visitor = parse_visitor_section(section_name, section)?;
            visitors.insert(visitor.name.clone(), visitor);
        } else {
            let proxy = parse_proxy_section(section_name, section)?;
            proxy.validate()?;
            proxies.insert(proxy.name.clone(), proxy);
        }
    }

    Ok((config, proxies, visitors))
}

fn parse_proxy_section(name: &str, section: &Section) -> Result<ProxyConf> {
    let type_str = get_str(section, "type")
        .ok_or_else(|| Error::Config(format!("proxy [{}] missing type", name)))?;
    let proxy_type = ProxyType::parse(&type_str)?;

    let mut plugin_params = HashMap::new();
    let mut headers = HashMap::new();
    for (key, value) in section {
        let Some(value) = value else { continue };
        if let Some(param) = key.strip_prefix("plugin_") {
            plugin_params.insert(param.to_string(), value.clone());
        } else if let Some(header) = key.strip_prefix("header_") {
            headers.insert(header.replace('_', "-"), value.clone());
        }
    }

    let health_check = match get_str(section, "health_check_type").as_deref() {
        None | Some("") => None,
        Some("tcp") => Some(HealthCheckType::Tcp),
        Some("http") => Some(HealthCheckType::Http),
        Some(other) => {
            return Err(Error::Config(format!(
                "proxy [{}] bad health_check_type: {}",
                name, other
            )));
        }
    }
    .map(|check_type| -> Result<HealthCheckConf> {
        Ok(HealthCheckConf {
            check_type,
            url: get_str(section, "health_check_url").unwrap_or_default(),
            interval: Duration::from_secs(get_u64(section, "health_check_interval_s", 10)?),
            timeout: Duration::from_secs(get_u64(section, "health_check_timeout_s", 3)?),
            max_failed: get_u64(section, "health_check_max_failed", 1)? as u32,
        })
    })
    .transpose()?;

    Ok(ProxyConf {
        name: name.to_string(),
        proxy_type,
        use_encryption: get_bool(section, "use_encryption", false)?,
        use_compression: get_bool(section, "use_compression", false)?,
        group: get_str(section, "group").unwrap_or_default(),
        group_key: get_str(section, "group_key").unwrap_or_default(),
        proxy_protocol_version: get_str(section, "proxy_protocol_version").unwrap_or_default(),
        local_ip: get_str(section, "local_ip").unwrap_or_else(|| "127.0.0.1".to_string()),
        local_port: get_u16(section, "local_port", 0)?,
        plugin: get_str(section, "plugin").unwrap_or_default(),
        plugin_params,
        health_check,
        remote_port: get_u16(section, "remote_port", 0)?,
        custom_domains: get_list(section, "custom_domains"),
        subdomain: get_str(section, "subdomain").unwrap_or_default(),
        locations: get_list(section, "locations"),
        http_user: get_str(section, "http_user").unwrap_or_default(),
        http_pwd: get_str(section, "http_pwd").unwrap_or_default(),
        host_header_rewrite: get_str(section, "host_header_rewrite").unwrap_or_default(),
        headers,
        sk: get_str(section, "sk").unwrap_or_default(),
    })
}

fn parse_visitor_section(name: &str, section: &Section) -> Result<VisitorConf> {
    let type_str = get_str(section, "type")
        .ok_or_else(|| Error::Config(format!("visitor [{}] missing type", name)))?;
    let proxy_type = ProxyType::parse(&type_str)?;
    if !matches!(proxy_type, ProxyType::Stcp | ProxyType::Xtcp) {
        return Err(Error::Config(format!(
            "visitor [{}] must be stcp or xtcp",
            name
        )));
    }
    let server_name = get_str(section, "server_name")
        .ok_or_else(|| Error::Config(format!("visitor [{}] missing server_name", name)))?;
    let bind_port = get_u16(section, "bind_port", 0)?;
    if bind_port == 0 {
        return Err(Error::Config(format!("visitor [{}] missing bind_port", name)));
    }
    Ok(VisitorConf {
        name: name.to_string(),
        proxy_type,
        server_name,
        sk: get_str(section, "sk").unwrap_or_default(),
        bind_addr: get_str(section, "bind_addr").unwrap_or_else(|| "127.0.0.1".to_string()),
        bind_port,
        use_encryption: get_bool(section, "use_encryption", false)?,
        use_compression: get_bool(section, "use_compression", false)?,
    })
}

/// Parse a port list like `7000-7002,8000` into individual ports.
fn parse_port_list(spec: &str) -> Result<Vec<u16>> {
    let mut ports = Vec::new();
    for range in parse_allow_ports(spec)? {
        ports.extend(range);
    }
    Ok(ports)
}

fn expand_range_section(base_name: &str, section: &Section) -> Result<Vec<ProxyConf>> {
    let local_ports = parse_port_list(&get_str(section, "local_port").unwrap_or_default())?;
    let remote_ports = parse_port_list(&get_str(section, "remote_port").unwrap_or_default())?;
    if local_ports.is_empty() {
        return Err(Error::Config(format!(
            "range section [{}] needs local_port",
            base_name
        )));
    }
    if !remote_ports.is_empty() && remote_ports.len() != local_ports.len() {
        return Err(Error::Config(format!(
            "range section [{}]: local_port and remote_port count mismatch ({} vs {})",
            base_name,
            local_ports.len(),
            remote_ports.len()
        )));
    }

    let template = parse_proxy_section(base_name, section)?;
    let mut result = Vec::with_capacity(local_ports.len());
    for (index, local_port) in local_ports.iter().enumerate() {
        let mut conf = template.clone();
        conf.name = format!("{}_{}", base_name, index);
        conf.local_port = *local_port;
        conf.remote_port = remote_ports.get(index).copied().unwrap_or(0);
        conf.validate()?;
        result.push(conf);
    }
    Ok(result)
}

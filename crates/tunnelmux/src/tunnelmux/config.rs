use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::tunnelmux::tunnel::{
    local::{LocalKind, LocalSpec},
    mux::MuxConfig,
    transport::TransportKind,
};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConfigPathSource::Flag => "flag",
            ConfigPathSource::Env => "env",
            ConfigPathSource::Cwd => "cwd",
            ConfigPathSource::Default => "default",
        };
        f.write_str(s)
    }
}

pub const CONFIG_ENV: &str = "TUNNELMUX_CONFIG";

/// Resolves the config path: `--config`, then `TUNNELMUX_CONFIG`, then a
/// `tunnelmux.*` file in the working directory, then the OS default.
pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }
    if p.is_absolute() {
        return Ok(p.to_path_buf());
    }
    let cwd = std::env::current_dir().context("config: resolve working directory")?;
    Ok(cwd.join(p))
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["tunnelmux.toml", "tunnelmux.yaml", "tunnelmux.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).map(|m| m.is_file()).unwrap_or(false) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no tunnelmux.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/tunnelmux/tunnelmux.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("com", "summpot", "tunnelmux").context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("tunnelmux.toml"))
    }
}

/// Writes the default template when `path` does not exist yet. Returns
/// whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn config_ext(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match config_ext(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        ext => anyhow::bail!("config: unsupported config extension {ext:?} (expected .toml/.yaml/.yml)"),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match config_ext(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?,
        ext => anyhow::bail!("config: unsupported config extension {ext}"),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: Option<ServerConfig>,
    pub clients: Vec<ClientEntry>,
    pub tunnels: Vec<TunnelEntry>,
    pub client: Option<ClientConfig>,
    pub logging: LoggingConfig,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_host: String,
    pub bridge_port: u16,
    /// 0 disables the listener; equal to `bridge_port` shares the bridge port.
    pub ws_port: u16,
    pub kcp_port: u16,
    pub web_port: u16,
    pub p2p_port: u16,
    /// Rendezvous address announced to peers. Defaults to `":{p2p_port}"`.
    pub p2p_public_addr: String,
    pub bridge_host: String,
    pub bridge_path: String,
    pub web_host: String,
    pub classify_timeout: Duration,
}

impl ServerConfig {
    pub fn bind_addr(&self, port: u16) -> String {
        if self.bind_host.contains(':') {
            format!("[{}]:{port}", self.bind_host)
        } else {
            format!("{}:{port}", self.bind_host)
        }
    }

    /// Whether the bridge port must be shared through the port dispatcher.
    pub fn collapses(&self, tunnels: &[TunnelEntry]) -> bool {
        let p = self.bridge_port;
        self.ws_port == p
            || self.web_port == p
            || tunnels
                .iter()
                .any(|t| t.port == p && matches!(t.mode, TunnelMode::Tcp | TunnelMode::Http))
    }
}

#[derive(Debug, Clone)]
pub struct ClientEntry {
    pub id: String,
    pub vkey: String,
    /// 0 means unlimited.
    pub max_conn: usize,
    /// Bytes in both directions; 0 means unlimited.
    pub flow_limit: u64,
    pub compress: bool,
    pub crypt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelMode {
    Tcp,
    Udp,
    Http,
    Secret,
    P2p,
}

impl TunnelMode {
    fn parse(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" => Ok(TunnelMode::Tcp),
            "udp" => Ok(TunnelMode::Udp),
            "http" | "httpproxy" => Ok(TunnelMode::Http),
            "secret" => Ok(TunnelMode::Secret),
            "p2p" => Ok(TunnelMode::P2p),
            other => anyhow::bail!("unknown mode {other:?} (expected tcp|udp|http|secret|p2p)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunnelEntry {
    pub id: String,
    pub client: String,
    pub mode: TunnelMode,
    pub port: u16,
    pub targets: Vec<String>,
    pub password: String,
    pub proxy_protocol: bool,
    pub auth_user: String,
    pub auth_password: String,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub transport: TransportKind,
    pub vkey: String,
    pub ws_path: String,
    pub dial_timeout: Duration,
    pub locals: Vec<LocalSpec>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    /// `None` keeps idle sessions up.
    pub session_idle_timeout: Option<Duration>,
    pub dead_peer_timeout: Option<Duration>,
    /// Quiet time after which a udp tunnel forgets a source address.
    pub udp_idle_timeout: Duration,
}

impl Timeouts {
    pub fn mux(&self) -> MuxConfig {
        MuxConfig {
            keepalive_interval: self.keepalive_interval,
            idle_timeout: self.session_idle_timeout,
            dead_peer_timeout: self.dead_peer_timeout,
            ..MuxConfig::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    server: Option<FileServer>,
    #[serde(default)]
    clients: Vec<FileClientEntry>,
    #[serde(default)]
    tunnels: Vec<FileTunnel>,
    client: Option<FileClient>,
    logging: Option<FileLogging>,
    timeouts: Option<FileTimeouts>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    #[serde(default)]
    bind_host: String,
    bridge_port: Option<u16>,
    #[serde(default)]
    ws_port: u16,
    #[serde(default)]
    kcp_port: u16,
    #[serde(default)]
    web_port: u16,
    #[serde(default)]
    p2p_port: u16,
    #[serde(default)]
    p2p_public_addr: String,
    #[serde(default)]
    bridge_host: String,
    #[serde(default)]
    bridge_path: String,
    #[serde(default)]
    web_host: String,
    classify_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClientEntry {
    id: String,
    vkey: String,
    #[serde(default)]
    max_conn: i64,
    #[serde(default)]
    flow_limit_mb: i64,
    #[serde(default)]
    compress: bool,
    #[serde(default)]
    crypt: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    #[serde(default)]
    id: String,
    client: String,
    #[serde(default)]
    mode: String,
    #[serde(default)]
    port: u16,
    #[serde(default, alias = "target")]
    targets: Option<StringOrVec>,
    #[serde(default)]
    password: String,
    #[serde(default)]
    proxy_protocol: bool,
    #[serde(default)]
    auth_user: String,
    #[serde(default)]
    auth_password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    server_addr: String,
    #[serde(default)]
    transport: String,
    vkey: String,
    #[serde(default)]
    ws_path: String,
    dial_timeout_ms: Option<i64>,
    #[serde(default)]
    locals: Vec<FileLocal>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLocal {
    kind: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    bind: String,
    password: String,
    #[serde(default)]
    target: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTimeouts {
    handshake_timeout_ms: Option<i64>,
    keepalive_interval_ms: Option<i64>,
    session_idle_timeout_ms: Option<i64>,
    dead_peer_timeout_ms: Option<i64>,
    udp_idle_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    One(String),
    Many(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrVec::One(s) => vec![s],
            StringOrVec::Many(v) => v,
        }
    }
}

fn millis(v: Option<i64>, default: u64) -> Duration {
    Duration::from_millis(v.map(|n| n.max(0) as u64).unwrap_or(default))
}

/// Zero or negative disables.
fn optional_millis(v: Option<i64>, default: u64) -> Option<Duration> {
    match v.unwrap_or(default as i64) {
        n if n <= 0 => None,
        n => Some(Duration::from_millis(n as u64)),
    }
}

fn or_default(s: &str, default: &str) -> String {
    match s.trim() {
        "" => default.to_string(),
        v => v.to_string(),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let logging = match fc.logging {
            Some(l) => LoggingConfig {
                level: or_default(l.level.as_deref().unwrap_or(""), "info"),
                format: or_default(l.format.as_deref().unwrap_or(""), "json"),
                output: or_default(l.output.as_deref().unwrap_or(""), "stderr"),
                add_source: l.add_source,
            },
            None => LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };

        let t = fc.timeouts.as_ref();
        let timeouts = Timeouts {
            handshake_timeout: millis(t.and_then(|t| t.handshake_timeout_ms), 3000),
            keepalive_interval: millis(t.and_then(|t| t.keepalive_interval_ms), 10_000).max(Duration::from_millis(100)),
            session_idle_timeout: optional_millis(t.and_then(|t| t.session_idle_timeout_ms), 0),
            dead_peer_timeout: optional_millis(t.and_then(|t| t.dead_peer_timeout_ms), 60_000),
            udp_idle_timeout: millis(t.and_then(|t| t.udp_idle_timeout_ms), 60_000).max(Duration::from_secs(1)),
        };

        let server = fc.server.map(normalize_server).transpose()?;
        let clients = normalize_clients(fc.clients)?;
        let tunnels = normalize_tunnels(fc.tunnels, &clients)?;

        if server.is_none() && (!clients.is_empty() || !tunnels.is_empty()) {
            anyhow::bail!("config: clients/tunnels require a [server] section");
        }
        if let Some(s) = &server {
            validate_ports(s, &tunnels)?;
        }

        let client = fc.client.map(normalize_client).transpose()?;

        Ok(Config {
            server,
            clients,
            tunnels,
            client,
            logging,
            timeouts,
        })
    }
}

fn normalize_server(s: FileServer) -> anyhow::Result<ServerConfig> {
    let bridge_port = s.bridge_port.unwrap_or(8024);
    if bridge_port == 0 {
        anyhow::bail!("config: server.bridge_port must not be 0");
    }
    let mut bridge_path = or_default(&s.bridge_path, "/ws");
    if !bridge_path.starts_with('/') {
        bridge_path.insert(0, '/');
    }
    let p2p_public_addr = match s.p2p_public_addr.trim() {
        "" if s.p2p_port != 0 => format!(":{}", s.p2p_port),
        v => v.to_string(),
    };
    Ok(ServerConfig {
        bind_host: or_default(&s.bind_host, "0.0.0.0"),
        bridge_port,
        ws_port: s.ws_port,
        kcp_port: s.kcp_port,
        web_port: s.web_port,
        p2p_port: s.p2p_port,
        p2p_public_addr,
        bridge_host: s.bridge_host.trim().to_ascii_lowercase(),
        bridge_path,
        web_host: s.web_host.trim().to_ascii_lowercase(),
        classify_timeout: millis(s.classify_timeout_ms, 5000),
    })
}

fn normalize_clients(raw: Vec<FileClientEntry>) -> anyhow::Result<Vec<ClientEntry>> {
    let mut seen_ids = HashSet::new();
    let mut seen_keys = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for (i, c) in raw.into_iter().enumerate() {
        let id = c.id.trim().to_string();
        let vkey = c.vkey.trim().to_string();
        if id.is_empty() {
            anyhow::bail!("config: clients[{i}] missing id");
        }
        if vkey.is_empty() {
            anyhow::bail!("config: clients[{i}] ({id}) missing vkey");
        }
        if !seen_ids.insert(id.clone()) {
            anyhow::bail!("config: clients[{i}] duplicate id {id:?}");
        }
        if !seen_keys.insert(vkey.clone()) {
            anyhow::bail!("config: clients[{i}] ({id}) reuses another client's vkey");
        }
        out.push(ClientEntry {
            id,
            vkey,
            max_conn: c.max_conn.max(0) as usize,
            flow_limit: (c.flow_limit_mb.max(0) as u64).saturating_mul(1024 * 1024),
            compress: c.compress,
            crypt: c.crypt,
        });
    }
    Ok(out)
}

fn normalize_tunnels(raw: Vec<FileTunnel>, clients: &[ClientEntry]) -> anyhow::Result<Vec<TunnelEntry>> {
    let known: HashSet<&str> = clients.iter().map(|c| c.id.as_str()).collect();
    let mut passwords = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for (i, t) in raw.into_iter().enumerate() {
        let mode = TunnelMode::parse(&t.mode).with_context(|| format!("config: tunnels[{i}]"))?;
        let client = t.client.trim().to_string();
        if !known.contains(client.as_str()) {
            anyhow::bail!("config: tunnels[{i}] references unknown client {client:?}");
        }
        let id = match t.id.trim() {
            "" => format!("t{}", i + 1),
            v => v.to_string(),
        };
        let targets: Vec<String> = t
            .targets
            .map(StringOrVec::into_vec)
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let password = t.password.trim().to_string();

        match mode {
            TunnelMode::Tcp | TunnelMode::Udp | TunnelMode::Http => {
                if t.port == 0 {
                    anyhow::bail!("config: tunnels[{i}] missing port");
                }
                if mode != TunnelMode::Http && targets.is_empty() {
                    anyhow::bail!("config: tunnels[{i}] missing targets");
                }
            }
            TunnelMode::Secret | TunnelMode::P2p => {
                if password.is_empty() {
                    anyhow::bail!("config: tunnels[{i}] missing password");
                }
                if targets.len() != 1 {
                    anyhow::bail!("config: tunnels[{i}] needs exactly one target");
                }
                if !passwords.insert(password.clone()) {
                    anyhow::bail!("config: tunnels[{i}] reuses another tunnel's password");
                }
            }
        }

        out.push(TunnelEntry {
            id,
            client,
            mode,
            port: t.port,
            targets,
            password,
            proxy_protocol: t.proxy_protocol,
            auth_user: t.auth_user.trim().to_string(),
            auth_password: t.auth_password.trim().to_string(),
        });
    }
    Ok(out)
}

/// Every physical port is owned by one listener, except the bridge port,
/// which holds one consumer per dispatcher class. UDP ports are checked
/// separately from TCP ones.
fn validate_ports(s: &ServerConfig, tunnels: &[TunnelEntry]) -> anyhow::Result<()> {
    let mut udp_owners: HashMap<u16, String> = HashMap::new();
    let mut claim_udp = |port: u16, who: String| -> anyhow::Result<()> {
        if port == 0 {
            return Ok(());
        }
        if let Some(prev) = udp_owners.insert(port, who.clone()) {
            anyhow::bail!("config: udp port {port} used by both {prev} and {who}");
        }
        Ok(())
    };
    claim_udp(s.kcp_port, "server.kcp_port".into())?;
    claim_udp(s.p2p_port, "server.p2p_port".into())?;
    for t in tunnels.iter().filter(|t| t.mode == TunnelMode::Udp) {
        claim_udp(t.port, format!("tunnel {}", t.id))?;
    }

    let mut owners: HashMap<u16, String> = HashMap::new();
    let mut claim = |port: u16, who: String| -> anyhow::Result<()> {
        if port == 0 || port == s.bridge_port {
            return Ok(());
        }
        if let Some(prev) = owners.insert(port, who.clone()) {
            anyhow::bail!("config: port {port} used by both {prev} and {who}");
        }
        Ok(())
    };
    claim(s.ws_port, "server.ws_port".into())?;
    claim(s.web_port, "server.web_port".into())?;

    let mut shared = HashSet::new();
    for t in tunnels {
        if !matches!(t.mode, TunnelMode::Tcp | TunnelMode::Http) {
            continue;
        }
        if t.port == s.bridge_port && !shared.insert(t.mode) {
            anyhow::bail!(
                "config: tunnel {} shares the bridge port with another {:?} tunnel",
                t.id,
                t.mode
            );
        }
        claim(t.port, format!("tunnel {}", t.id))?;
    }
    Ok(())
}

fn normalize_client(c: FileClient) -> anyhow::Result<ClientConfig> {
    let server_addr = c.server_addr.trim().to_string();
    if server_addr.is_empty() {
        anyhow::bail!("config: client.server_addr is required");
    }
    let vkey = c.vkey.trim().to_string();
    if vkey.is_empty() {
        anyhow::bail!("config: client.vkey is required");
    }
    let transport = TransportKind::parse(&c.transport).context("config: client.transport")?;

    let mut locals = Vec::with_capacity(c.locals.len());
    for (i, l) in c.locals.into_iter().enumerate() {
        let kind = match l.kind.trim().to_ascii_lowercase().as_str() {
            "secret" => LocalKind::Secret,
            "p2p" => LocalKind::P2p,
            other => anyhow::bail!("config: client.locals[{i}] unknown kind {other:?} (expected secret|p2p)"),
        };
        let bind = match (l.bind.trim(), l.port) {
            ("", 0) => anyhow::bail!("config: client.locals[{i}] missing port"),
            ("", port) => format!("127.0.0.1:{port}"),
            (b, _) => b.to_string(),
        };
        let password = l.password.trim().to_string();
        if password.is_empty() {
            anyhow::bail!("config: client.locals[{i}] missing password");
        }
        let target = l.target.trim().to_string();
        if kind == LocalKind::P2p && target.is_empty() {
            anyhow::bail!("config: client.locals[{i}] p2p locals need a target");
        }
        locals.push(LocalSpec {
            kind,
            bind,
            password,
            target,
        });
    }

    Ok(ClientConfig {
        server_addr,
        transport,
        vkey,
        ws_path: or_default(&c.ws_path, "/ws"),
        dial_timeout: millis(c.dial_timeout_ms, 5000),
        locals,
    })
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# tunnelmux configuration (auto-generated)
#
# This file was created because no configuration file existed at the resolved
# config path. It starts a tunnel server with one client and one public TCP
# tunnel. Replace the vkey before exposing the bridge port.

[server]
bind_host = "0.0.0.0"
bridge_port = 8024
ws_port = 8024   # same as bridge_port: shared through the port dispatcher
kcp_port = 0     # 0 disables the KCP bridge
web_port = 8081  # admin API; 0 disables
p2p_port = 0     # 0 disables p2p rendezvous
classify_timeout_ms = 5000

[[clients]]
id = "home"
vkey = "change-me"
max_conn = 0
flow_limit_mb = 0
compress = false
crypt = false

[[tunnels]]
id = "ssh"
client = "home"
mode = "tcp" # tcp | udp | http | secret | p2p
port = 2222
targets = ["127.0.0.1:22"]

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

[timeouts]
handshake_timeout_ms = 3000
keepalive_interval_ms = 10000
session_idle_timeout_ms = 0
dead_peer_timeout_ms = 60000
udp_idle_timeout_ms = 60000
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# tunnelmux configuration (auto-generated)
#
# This file was created because no configuration file existed at the resolved
# config path. It starts a tunnel server with one client and one public TCP
# tunnel. Replace the vkey before exposing the bridge port.

server:
  bind_host: "0.0.0.0"
  bridge_port: 8024
  ws_port: 8024   # same as bridge_port: shared through the port dispatcher
  kcp_port: 0     # 0 disables the KCP bridge
  web_port: 8081  # admin API; 0 disables
  p2p_port: 0     # 0 disables p2p rendezvous
  classify_timeout_ms: 5000

clients:
  - id: "home"
    vkey: "change-me"
    max_conn: 0
    flow_limit_mb: 0
    compress: false
    crypt: false

tunnels:
  - id: "ssh"
    client: "home"
    mode: "tcp" # tcp | udp | http | secret | p2p
    port: 2222
    targets: ["127.0.0.1:22"]

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

timeouts:
  handshake_timeout_ms: 3000
  keepalive_interval_ms: 10000
  session_idle_timeout_ms: 0
  dead_peer_timeout_ms: 60000
  udp_idle_timeout_ms: 60000
"#;

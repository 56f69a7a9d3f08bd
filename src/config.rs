use std::fs::metadata;
use std::io;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use clap::Command;
use clap::CommandFactory;
use clap::Parser;
use clap::ValueHint;
use clap_complete::generate;
use clap_complete::Generator;
use clap_complete::Shell;
use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;
use url::Url;

use crate::upstream::webdav::InvalidBaseUrl;
use crate::upstream::LocalUpstream;
use crate::upstream::Upstream;
use crate::upstream::WebDavUpstream;
use crate::utils::setup_tracing;

/// Largest chunk forwarded to the client at once
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// How far an open-ended range reaches when the size is not known
pub const DEFAULT_OPEN_ENDED_WINDOW: u64 = 4 * 1024 * 1024;

pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not open media root \"{0}\": {1}")]
    InvalidMediaRoot(PathBuf, std::io::Error),

    #[error("Invalid WebDAV server URL \"{0}\": {1}")]
    InvalidWebDavUrl(String, url::ParseError),

    #[error(transparent)]
    InvalidWebDavBase(#[from] InvalidBaseUrl),

    #[error("Could not open static dir \"{0}\": {1}")]
    InvalidStaticDir(PathBuf, std::io::Error),

    #[error("Chunk size must be at least one byte")]
    ZeroChunkSize,

    #[error("Open-ended window must be at least one byte")]
    ZeroWindow,
}

#[derive(Parser, Clone, Debug)]
#[command(author, version, about, long_about = None)]
struct CliConfig {
    /// The verbosity of the output
    ///
    /// With a minimum of `info` level
    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,

    /// The actual config for mediaproxy
    #[command(flatten)]
    config: Config,

    /// Generate shell completions
    #[arg(long, value_enum, hide = true)]
    generate_shell_completions: Option<Shell>,
}

/// Stream media files from a local directory or a WebDAV server with HTTP range support
#[derive(Args, Clone, Debug)]
pub struct Config {
    /// Directory with the media files, or the path prefix on the WebDAV server
    #[arg(long, env = "MEDIA_ROOT", value_hint = ValueHint::DirPath)]
    pub media_root: Option<PathBuf>,

    /// Base URL of a WebDAV server to stream from instead of the local disk
    #[arg(long, env = "WEBDAV_SERVER", value_hint = ValueHint::Url)]
    pub webdav_server: Option<String>,

    /// User name for the WebDAV server
    #[arg(long, env = "WEBDAV_USERNAME")]
    pub webdav_username: Option<String>,

    /// Password for the WebDAV server
    #[arg(long, env = "WEBDAV_PASSWORD", hide_env_values = true)]
    pub webdav_password: Option<String>,

    /// The address to run mediaproxy on, defaults to 127.0.0.1:8080
    #[arg(long, short)]
    pub address: Option<String>,

    /// The port to run mediaproxy on, defaults to 8080 (overrides `address`)
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Upper bound for looking up a file and opening a read upstream
    #[arg(long, env = "UPSTREAM_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    pub upstream_timeout: Duration,

    /// Give up on a stream when the upstream sends nothing for this long
    #[arg(long, env = "READ_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    pub read_timeout: Duration,

    /// Largest chunk in bytes forwarded to the client at once
    #[arg(long, env = "CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Bytes served for an open-ended range when the file size is unknown
    #[arg(long, env = "OPEN_ENDED_WINDOW", default_value_t = DEFAULT_OPEN_ENDED_WINDOW)]
    pub open_ended_window: u64,

    /// Directory with the browser frontend, served for all other paths
    #[arg(long, env = "STATIC_DIR", value_hint = ValueHint::DirPath)]
    pub static_dir: Option<PathBuf>,
}

/// Tunables for planning and streaming, fixed at start-up
#[derive(Clone, Copy, Debug)]
pub struct ProxySettings {
    pub upstream_timeout: Duration,
    pub read_timeout: Duration,
    pub chunk_size: usize,
    pub open_ended_window: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            open_ended_window: DEFAULT_OPEN_ENDED_WINDOW,
        }
    }
}

/// Print the completions for mediaproxy and `exit(0)`
fn print_completions<G: Generator>(generator: G, cmd: &mut Command) -> ! {
    generate(generator, cmd, cmd.get_name().to_string(), &mut io::stdout());
    exit(0);
}

impl Config {
    /// Create a config from the environment
    pub fn from_env() -> anyhow::Result<Self> {
        let cli_config = CliConfig::parse();

        if let Some(generate_shell_completions) = cli_config.generate_shell_completions {
            let mut cli_command = CliConfig::command();
            print_completions(generate_shell_completions, &mut cli_command);
        }

        setup_tracing(&cli_config.verbosity);

        let config = cli_config.config;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }

        if self.open_ended_window == 0 {
            return Err(ConfigError::ZeroWindow);
        }

        if let Some(url) = self.webdav_url()? {
            if url.cannot_be_a_base() {
                return Err(InvalidBaseUrl(url).into());
            }
        } else {
            // check for the existence of the media root
            let media_root = self.local_media_root();
            metadata(&media_root)
                .map_err(|err| ConfigError::InvalidMediaRoot(media_root.clone(), err))?;
        }

        if let Some(static_dir) = &self.static_dir {
            // check for the existence of static dir
            metadata(static_dir)
                .map_err(|err| ConfigError::InvalidStaticDir(static_dir.clone(), err))?;
        }

        Ok(())
    }

    fn local_media_root(&self) -> PathBuf {
        self.media_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn webdav_url(&self) -> Result<Option<Url>, ConfigError> {
        self.webdav_server
            .as_ref()
            .map(|server| {
                Url::parse(server).map_err(|err| ConfigError::InvalidWebDavUrl(server.clone(), err))
            })
            .transpose()
    }

    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            upstream_timeout: self.upstream_timeout,
            read_timeout: self.read_timeout,
            chunk_size: self.chunk_size,
            open_ended_window: self.open_ended_window,
        }
    }

    /// Human readable description of where media is read from
    pub fn media_source(&self) -> String {
        match &self.webdav_server {
            Some(server) => format!("WebDAV server {server}"),
            None => format!("{:?}", self.local_media_root()),
        }
    }

    /// Build the resolver the configuration asks for
    pub fn upstream(&self) -> Result<Arc<dyn Upstream>, ConfigError> {
        let Some(base) = self.webdav_url()? else {
            return Ok(Arc::new(LocalUpstream::new(self.local_media_root())));
        };

        let root = self
            .media_root
            .as_ref()
            .map(|root| root.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut upstream = WebDavUpstream::new(base, &root)?;

        if let Some(username) = &self.webdav_username {
            upstream = upstream.with_credentials(username.clone(), self.webdav_password.clone());
        }

        Ok(Arc::new(upstream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        CliConfig::try_parse_from(std::iter::once("mediaproxy").chain(args.iter().copied()))
            .unwrap()
            .config
    }

    #[test]
    fn defaults() {
        let config = parse(&["--media-root", "."]);
        let settings = config.proxy_settings();

        assert_eq!(settings.upstream_timeout, Duration::from_secs(10));
        assert_eq!(settings.read_timeout, Duration::from_secs(30));
        assert_eq!(settings.chunk_size, 65_536);
        assert_eq!(settings.open_ended_window, 4_194_304);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn humantime_durations() {
        let config = parse(&[
            "--upstream-timeout",
            "1m 30s",
            "--read-timeout",
            "250ms",
        ]);

        assert_eq!(config.upstream_timeout, Duration::from_secs(90));
        assert_eq!(config.read_timeout, Duration::from_millis(250));
    }

    #[test]
    fn rejects_zero_sizes() {
        let config = parse(&["--media-root", ".", "--chunk-size", "0"]);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroChunkSize)));

        let config = parse(&["--media-root", ".", "--open-ended-window", "0"]);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroWindow)));
    }

    #[test]
    fn rejects_missing_directories() {
        let config = parse(&["--media-root", "/does/not/exist/at/all"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMediaRoot(..))
        ));

        let config = parse(&["--media-root", ".", "--static-dir", "/does/not/exist/at/all"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidStaticDir(..))
        ));
    }

    #[test]
    fn webdav_urls() {
        let config = parse(&["--webdav-server", "not a url"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWebDavUrl(..))
        ));

        let config = parse(&["--webdav-server", "mailto:someone@example.com"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWebDavBase(_))
        ));

        let config = parse(&[
            "--webdav-server",
            "https://dav.example.com/remote.php/dav",
            "--media-root",
            "/files/media",
            "--webdav-username",
            "user",
        ]);
        assert!(config.validate().is_ok());
        assert!(config.upstream().is_ok());
    }
}

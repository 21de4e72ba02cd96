use std::{collections::HashMap, path::PathBuf};

use url::Url;

/// Listener scheme. The `s`-suffixed variants expect TLS options on the
/// URL (or the CLI) and hand the connection to a TLS transport adapter.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
    Sse,
    Sses,
    Tcp,
    Tcps,
    Unix,
    Unixs,
}

impl Scheme {
    fn parse(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "ws" => Some(Self::Ws),
            "wss" => Some(Self::Wss),
            "sse" => Some(Self::Sse),
            "sses" => Some(Self::Sses),
            "tcp" => Some(Self::Tcp),
            "tcps" => Some(Self::Tcps),
            "unix" => Some(Self::Unix),
            "unixs" => Some(Self::Unixs),
            _ => None,
        }
    }

    /// HTTP-family listeners parse requests and may upgrade; `tcp` hands
    /// raw bytes to the handler.
    pub fn is_http(self) -> bool {
        matches!(self, Self::Http | Self::Https | Self::Ws | Self::Wss | Self::Sse | Self::Sses)
    }

    pub fn is_tls(self) -> bool {
        matches!(self, Self::Https | Self::Wss | Self::Sses | Self::Tcps | Self::Unixs)
    }

    pub fn is_unix(self) -> bool {
        matches!(self, Self::Unix | Self::Unixs)
    }
}

/// TLS material named on a listener URL or the CLI.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// `tls=dir` shorthand: `dir/cert.pem` + `dir/key.pem`.
    pub dir: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub password: Option<String>,
    /// `-tls`: generate a self-signed certificate at startup.
    pub self_signed: bool,
    pub server_name: Option<String>,
}

impl TlsOptions {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ListenError {
    #[error("unknown listener scheme `{0}`")]
    UnknownScheme(String),
    #[error("listener URL is not parseable: {0}")]
    Malformed(String),
    #[error("`{0}` listeners require a socket path")]
    MissingPath(&'static str),
    #[error("TLS scheme without certificate material (use tls=, cert=/key= or -tls)")]
    MissingTls,
}

/// Parsed `scheme://[host]:port[/path?opt=val&...]` listener address.
#[derive(Clone, Debug)]
pub struct ListenerUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Unix-domain listeners carry a filesystem path instead of host:port.
    pub unix_path: Option<PathBuf>,
    pub tls: TlsOptions,
}

impl ListenerUrl {
    /// Parses a listener URL. Unknown schemes are rejected; TLS options are
    /// read from the query string (`tls=dir`, `cert=f&key=f&pass=...`).
    pub fn parse(input: &str) -> Result<Self, ListenError> {
        let url =
            Url::parse(input).map_err(|e| ListenError::Malformed(format!("{input}: {e}")))?;
        let scheme = Scheme::parse(url.scheme())
            .ok_or_else(|| ListenError::UnknownScheme(url.scheme().to_string()))?;

        let options: HashMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let tls = TlsOptions {
            dir: options.get("tls").map(PathBuf::from),
            cert: options.get("cert").map(PathBuf::from),
            key: options.get("key").map(PathBuf::from),
            password: options.get("pass").cloned(),
            self_signed: false,
            server_name: options.get("name").cloned(),
        };

        if scheme.is_unix() {
            let path = url.path();
            if path.is_empty() || path == "/" {
                return Err(ListenError::MissingPath("unix"));
            }
            return Ok(Self {
                scheme,
                host: String::new(),
                port: 0,
                unix_path: Some(PathBuf::from(path)),
                tls,
            });
        }

        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => "0.0.0.0".to_string(),
        };
        let port = url.port().unwrap_or_else(|| default_port(scheme));
        Ok(Self { scheme, host, port, unix_path: None, tls })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_port(scheme: Scheme) -> u16 {
    match scheme {
        Scheme::Https | Scheme::Wss | Scheme::Sses => 443,
        _ => 3000,
    }
}

impl std::fmt::Display for ListenerUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.unix_path {
            Some(path) => write!(f, "unix:{}", path.display()),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_http() {
        let listener = ListenerUrl::parse("http://0.0.0.0:8080").unwrap();
        assert_eq!(listener.scheme, Scheme::Http);
        assert_eq!(listener.bind_addr(), "0.0.0.0:8080");
        assert!(listener.tls.is_empty());
    }

    #[test]
    fn default_host_and_port() {
        let listener = ListenerUrl::parse("https://example.com").unwrap();
        assert_eq!(listener.port, 443);
        assert!(listener.scheme.is_tls());
    }

    #[test]
    fn unknown_scheme_rejected() {
        assert!(matches!(
            ListenerUrl::parse("gopher://host:70"),
            Err(ListenError::UnknownScheme(scheme)) if scheme == "gopher"
        ));
    }

    #[test]
    fn tls_options_from_query() {
        let listener =
            ListenerUrl::parse("https://0.0.0.0:443/?cert=./c.pem&key=./k.pem&pass=hunter2")
                .unwrap();
        assert_eq!(listener.tls.cert, Some(PathBuf::from("./c.pem")));
        assert_eq!(listener.tls.key, Some(PathBuf::from("./k.pem")));
        assert_eq!(listener.tls.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn tls_dir_shorthand() {
        let listener = ListenerUrl::parse("wss://0.0.0.0:9000/?tls=./certs").unwrap();
        assert_eq!(listener.tls.dir, Some(PathBuf::from("./certs")));
    }

    #[test]
    fn unix_socket_path() {
        let listener = ListenerUrl::parse("unix:///tmp/app.sock").unwrap();
        assert_eq!(listener.unix_path, Some(PathBuf::from("/tmp/app.sock")));
        assert!(listener.scheme.is_unix());
    }

    #[test]
    fn unix_without_path_rejected() {
        assert!(matches!(
            ListenerUrl::parse("unix://"),
            Err(ListenError::MissingPath(_)) | Err(ListenError::Malformed(_))
        ));
    }
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DsnError {
    #[error("DSN [{0}] is invalid")]
    Invalid(String),
    #[error("invalid socket type: {0}")]
    UnknownScheme(String),
}

/// Scanner socket address: `unix:///path`, `ipv4://ip:port` or
/// `ipv6://[ip]:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dsn {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

impl FromStr for Dsn {
    type Err = DsnError;

    fn from_str(dsn: &str) -> Result<Self, Self::Err> {
        let invalid = || DsnError::Invalid(dsn.to_string());
        let (scheme, rest) = dsn.split_once("://").ok_or_else(invalid)?;
        if rest.is_empty() {
            return Err(invalid());
        }

        match scheme.to_ascii_lowercase().as_str() {
            "unix" => Ok(Dsn::Unix(PathBuf::from(rest))),
            "ipv4" => match rest.parse::<SocketAddr>() {
                Ok(addr @ SocketAddr::V4(_)) => Ok(Dsn::Tcp(addr)),
                _ => Err(invalid()),
            },
            "ipv6" => match rest.parse::<SocketAddr>() {
                Ok(addr @ SocketAddr::V6(_)) => Ok(Dsn::Tcp(addr)),
                _ => Err(invalid()),
            },
            other => Err(DsnError::UnknownScheme(other.to_string())),
        }
    }
}

impl Dsn {
    pub async fn connect(&self, timeout: Duration) -> anyhow::Result<Box<dyn Stream>> {
        let stream: Box<dyn Stream> = match self {
            Dsn::Unix(path) => Box::new(
                tokio::time::timeout(timeout, UnixStream::connect(path))
                    .await
                    .map_err(|_| anyhow::anyhow!("timed out connecting to {}", path.display()))??,
            ),
            Dsn::Tcp(addr) => Box::new(
                tokio::time::timeout(timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| anyhow::anyhow!("timed out connecting to {addr}"))??,
            ),
        };
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dsn() {
        assert_eq!(
            "unix:///var/run/clamav/clamd.ctl".parse::<Dsn>().unwrap(),
            Dsn::Unix(PathBuf::from("/var/run/clamav/clamd.ctl"))
        );
        assert_eq!(
            "ipv4://127.0.0.1:783".parse::<Dsn>().unwrap(),
            Dsn::Tcp("127.0.0.1:783".parse().unwrap())
        );
        assert_eq!(
            "IPV6://[::1]:3310".parse::<Dsn>().unwrap(),
            Dsn::Tcp("[::1]:3310".parse().unwrap())
        );
    }

    #[test]
    fn test_invalid_dsn() {
        assert!(matches!("127.0.0.1:783".parse::<Dsn>(), Err(DsnError::Invalid(_))));
        assert!(matches!("ipv4://".parse::<Dsn>(), Err(DsnError::Invalid(_))));
        assert!(matches!("ipv4://[::1]:25".parse::<Dsn>(), Err(DsnError::Invalid(_))));
        assert!(matches!(
            "tcp://127.0.0.1:25".parse::<Dsn>(),
            Err(DsnError::UnknownScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let dsn = Dsn::Tcp(addr);
        assert!(dsn.connect(Duration::from_secs(1)).await.is_err());
    }
}

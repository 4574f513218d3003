use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

pub(crate) mod https;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("transport timeout")]
    Timeout,
    #[error("{0}")]
    NotRegistered(String),
    #[error("server answered {0}: {1}")]
    Status(u16, String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("client identity error: {0}")]
    Identity(String),
}

/// One named definition as the server knows it.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub(crate) struct RemoteEntry {
    pub name: String,
    /// milliseconds since the unix epoch
    pub mtime: i64,
}
#[cfg(test)]
impl RemoteEntry {
    pub fn new(name: impl Into<String>, mtime: i64) -> Self {
        RemoteEntry {
            name: name.into(),
            mtime,
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait RemoteStore: Send + Sync {
    async fn list(&self) -> Result<Vec<RemoteEntry>, RemoteError>;
    async fn fetch(&self, name: &str) -> Result<String, RemoteError>;
    async fn store(&self, name: &str, content: &str) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_deserialization() {
        let listing = r#"[{"name":"office.ini","mtime":1357913245000},{"name":"lab.ini","mtime":12}]"#;
        let entries: Vec<RemoteEntry> = serde_json::from_str(listing).unwrap();
        assert_eq!(
            entries,
            vec![
                RemoteEntry::new("office.ini", 1357913245000),
                RemoteEntry::new("lab.ini", 12),
            ]
        );
    }
}

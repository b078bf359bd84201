/// Connection settings for the coordinator database.
///
/// The CLI resolves the URL (flag, `CORRAL_DATABASE_URL`, config file,
/// then [`DbConfig::DEFAULT_URL`]); this type only carries the result.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL.
    pub database_url: String,
    /// Upper bound on pooled connections.
    pub max_connections: u32,
}

impl DbConfig {
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/corral";

    /// Sessions, dispatchers and the background loops of one replica all
    /// share a pool of this size.
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Split the URL into the server part and the database path segment.
    fn split(&self) -> Option<(&str, &str)> {
        let (server, db) = self.database_url.rsplit_once('/')?;
        // `postgresql://host` has no path: the last slash is the scheme's.
        if server.ends_with('/') {
            return None;
        }
        Some((server, db))
    }

    /// Database name from the URL, without any query string.
    pub fn database_name(&self) -> Option<&str> {
        let (_, db) = self.split()?;
        let name = db.split_once('?').map_or(db, |(name, _)| name);
        (!name.is_empty()).then_some(name)
    }

    /// URL of the `postgres` maintenance database on the same server.
    pub fn maintenance_url(&self) -> String {
        match self.split() {
            Some((server, _)) => format!("{server}/postgres"),
            None => self.database_url.clone(),
        }
    }

    /// The URL with any password replaced, for logs and error messages.
    pub fn redacted_url(&self) -> String {
        let url = &self.database_url;
        let Some(scheme_end) = url.find("://").map(|i| i + 3) else {
            return url.clone();
        };
        let Some(at) = url[scheme_end..].find('@').map(|i| i + scheme_end) else {
            return url.clone();
        };
        match url[scheme_end..at].find(':') {
            Some(colon) => format!("{}:***{}", &url[..scheme_end + colon], &url[at..]),
            None => url.clone(),
        }
    }
}

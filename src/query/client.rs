//! ClickHouse client wrapper.

use clickhouse::Client;

#[derive(Clone)]
pub struct QueryClient {
    inner: Client,
}

#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl QueryClient {
    pub fn connect(config: &ClickHouseConfig) -> Self {
        let mut client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database);
        if let Some(user) = &config.user {
            client = client.with_user(user);
        }
        if let Some(password) = &config.password {
            client = client.with_password(password);
        }
        Self { inner: client }
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }
}

use std::{ops::Deref, sync::Arc};

use futures::{stream, StreamExt, TryStreamExt};
use reqwest::{Client, ClientBuilder, IntoUrl};
use reqwest_cookie_store::{CookieStore, CookieStoreMutex};
use tokio::time::Instant;
use url::Url;

use super::{BandwidthMeter, ByteStream, DataSource, DataSourceFactory};
use crate::{
    config::DashPeriodConfig,
    error::{DashError, DashResult},
};

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    cookies_store: Arc<CookieStoreMutex>,
}

impl HttpClient {
    pub fn new(builder: ClientBuilder) -> DashResult<Self> {
        let cookies_store = Arc::new(CookieStoreMutex::new(CookieStore::default()));
        let client = builder.cookie_provider(cookies_store.clone()).build()?;

        Ok(Self {
            client,
            cookies_store,
        })
    }

    pub fn from_config(config: &DashPeriodConfig) -> DashResult<Self> {
        let mut builder = Client::builder().timeout(config.request_timeout());
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        Self::new(builder)
    }

    pub fn add_cookies(&self, cookies: Vec<String>, url: impl IntoUrl) -> DashResult<()> {
        let url = url.into_url()?;
        if let Ok(mut lock) = self.cookies_store.lock() {
            for cookie in cookies {
                _ = lock.parse(&cookie, &url);
            }
        }
        Ok(())
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

/// [`DataSource`] issuing plain GET requests.
#[derive(Clone)]
pub struct HttpDataSource {
    client: HttpClient,
    bandwidth_meter: Option<Arc<dyn BandwidthMeter>>,
}

impl HttpDataSource {
    pub fn new(client: HttpClient, bandwidth_meter: Option<Arc<dyn BandwidthMeter>>) -> Self {
        Self {
            client,
            bandwidth_meter,
        }
    }
}

#[async_trait::async_trait]
impl DataSource for HttpDataSource {
    async fn open(&self, uri: &Url) -> DashResult<ByteStream> {
        let started = Instant::now();
        let response = self.client.get(uri.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::debug!(%uri, %status, "Unexpected response status");
            return Err(DashError::HttpError(status));
        }

        let body = response.bytes_stream().map_err(DashError::from).boxed();
        let Some(meter) = self.bandwidth_meter.clone() else {
            return Ok(body);
        };

        // The transfer is reported once the body has been fully read.
        let body = stream::unfold(
            (body, 0u64, meter),
            move |(mut body, transferred, meter)| async move {
                match body.next().await {
                    Some(Ok(chunk)) => {
                        let transferred = transferred + chunk.len() as u64;
                        Some((Ok(chunk), (body, transferred, meter)))
                    }
                    Some(Err(e)) => Some((Err(e), (body, transferred, meter))),
                    None => {
                        meter.on_transfer(transferred, started.elapsed());
                        None
                    }
                }
            },
        );
        Ok(body.boxed())
    }
}

#[derive(Clone)]
pub struct HttpDataSourceFactory {
    client: HttpClient,
}

impl HttpDataSourceFactory {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    pub fn from_config(config: &DashPeriodConfig) -> DashResult<Self> {
        Ok(Self::new(HttpClient::from_config(config)?))
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }
}

impl DataSourceFactory for HttpDataSourceFactory {
    fn create_data_source(
        &self,
        bandwidth_meter: Option<Arc<dyn BandwidthMeter>>,
    ) -> Arc<dyn DataSource> {
        Arc::new(HttpDataSource::new(self.client.clone(), bandwidth_meter))
    }
}

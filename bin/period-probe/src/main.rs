use std::{path::PathBuf, str::FromStr, sync::Arc};

use anyhow::Context;
use clap::Parser;
use dash_period::{
    upstream::{DefaultAllocator, HttpClient, HttpDataSourceFactory},
    DashMediaSource, DashPeriodConfig, PeriodState, TrackSelection,
};
use fake_user_agent::get_chrome_rua;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client,
};
use url::Url;

mod probe;

use probe::{LoadLogger, LoggingChunkSourceFactory, ProbeCallback, ProbeSampleStreamFactory};

#[derive(Parser, Debug, Clone)]
#[clap(version, about)]
pub struct ProbeArgs {
    /// Debug output
    #[clap(long, alias = "debug")]
    verbose: bool,

    /// Configuration file in toml format
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Retry limit of manifest and media loads
    #[clap(long)]
    retries: Option<u32>,

    /// Cookies used to load the manifest
    #[clap(long)]
    cookies: Option<String>,

    /// HTTP Header used to load the manifest
    ///
    /// Custom header. eg. "Referer: xxxxx".
    #[clap(short = 'H', long)]
    headers: Vec<String>,

    /// Print track groups as json
    #[clap(long)]
    json: bool,

    /// Keep refreshing a dynamic manifest until interrupted
    #[clap(short, long)]
    follow: bool,

    /// Starting position in microseconds
    #[clap(long, default_value = "0")]
    position_us: i64,

    /// mpd file url
    url: Url,
}

impl ProbeArgs {
    fn config(&self) -> anyhow::Result<DashPeriodConfig> {
        let mut config = match &self.config {
            Some(path) => DashPeriodConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => DashPeriodConfig::default(),
        };
        if let Some(retries) = self.retries {
            config = config.with_min_loadable_retry_count(retries);
        }
        Ok(config)
    }

    fn client(&self, config: &DashPeriodConfig) -> anyhow::Result<HttpClient> {
        let mut headers = HeaderMap::new();
        for header in &self.headers {
            let (key, value) = header
                .split_once(':')
                .with_context(|| format!("invalid header: {header}"))?;
            headers.insert(
                HeaderName::from_str(key.trim())?,
                HeaderValue::from_str(value.trim())?,
            );
        }

        let user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(|| get_chrome_rua().to_string());
        let builder = Client::builder()
            .default_headers(headers)
            .user_agent(user_agent)
            .timeout(config.request_timeout());
        let client = HttpClient::new(builder)?;

        if let Some(cookies) = &self.cookies {
            let cookies = cookies
                .split(';')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(ToString::to_string)
                .collect();
            client.add_cookies(cookies, self.url.clone())?;
        }
        Ok(client)
    }
}

fn print_track_groups(source: &DashMediaSource, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(source.track_groups())?);
        return Ok(());
    }

    match source.duration_us() {
        Some(duration_us) => println!("duration: {:.3}s", duration_us as f64 / 1_000_000.),
        None => println!("duration: live"),
    }
    for (index, group) in source.track_groups().iter().enumerate() {
        let adaptation_set = source.track_topology().adaptation_set_index(index);
        println!(
            "group {index} ({:?}, adaptation set {}):",
            group.track_type,
            adaptation_set.map_or_else(|| "-".to_string(), |i| i.to_string())
        );
        for format in &group.formats {
            println!(
                "  {:<12} {:<24} {:>10} {}",
                format.id.as_deref().unwrap_or("-"),
                format.codecs.as_deref().unwrap_or("-"),
                format.bitrate.map_or_else(|| "-".to_string(), |b| b.to_string()),
                match (format.width, format.height, format.language.as_deref()) {
                    (Some(width), Some(height), _) => format!("{width}x{height}"),
                    (_, _, Some(language)) => language.to_string(),
                    _ => String::new(),
                }
            );
        }
    }
    Ok(())
}

async fn follow(source: &mut DashMediaSource, position_us: i64) -> anyhow::Result<()> {
    // the first representation of every group stands in for a player's choice
    let selections: Vec<_> = (0..source.track_groups().len())
        .map(|group| TrackSelection::single(group, 0))
        .collect();
    let ids = source.select_tracks(&[], &selections, position_us)?;
    tracing::info!(streams = ids.len(), "Following manifest updates");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            running = source.process_next() => {
                if !running {
                    break;
                }
                source.maybe_throw_prepare_error()?;
                if source.state() == PeriodState::Prepared {
                    tracing::info!("Manifest became static");
                    break;
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ProbeArgs::parse();

    let default_directive = if args.verbose {
        "period_probe=debug,dash_period=debug"
    } else {
        "period_probe=info,dash_period=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = args.config()?;
    let client = args.client(&config)?;
    let chunk_sources = Arc::new(LoggingChunkSourceFactory::default());

    let mut source = DashMediaSource::new(
        args.url.clone(),
        Arc::new(HttpDataSourceFactory::new(client)),
        chunk_sources.clone(),
        Arc::new(ProbeSampleStreamFactory),
    )
    .with_config(config)
    .with_event_listener(Arc::new(LoadLogger));

    source.prepare(
        Arc::new(ProbeCallback),
        Arc::new(DefaultAllocator::default()),
        args.position_us,
    )?;
    source.run_until_prepared().await?;
    print_track_groups(&source, args.json)?;

    if args.follow {
        if source.state() == PeriodState::RefreshScheduled {
            let result = follow(&mut source, args.position_us).await;
            tracing::info!(updates = chunk_sources.refreshes(), "Stopped following");
            source.release();
            return result;
        }
        tracing::warn!("Manifest is static, nothing to follow");
    }

    source.release();
    Ok(())
}

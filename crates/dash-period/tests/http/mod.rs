use std::sync::Arc;

use dash_period::{
    manifest::TrackType,
    upstream::{
        BandwidthMeter, DataSource, DataSourceFactory, DefaultAllocator, DefaultBandwidthMeter,
        HttpDataSourceFactory,
    },
    DashError, DashMediaSource, DashPeriodConfig, PeriodState,
};
use futures::TryStreamExt;
use url::Url;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::{
    common::{
        setup_tracing, FakeSampleStreamFactory, RecordingCallback, RecordingChunkSourceFactory,
    },
    AssertWrapper,
};

// 2024-01-01T00:00:00Z
const NEW_YEAR_2024_MS: i64 = 1_704_067_200_000;

const STATIC_MPD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT12S" minBufferTime="PT2S">
  <Period id="p0">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <Representation id="v1" bandwidth="800000" width="640" height="360" codecs="avc1.4d401e"/>
      <Representation id="v2" bandwidth="2400000" width="1280" height="720" codecs="avc1.64001f"/>
    </AdaptationSet>
    <AdaptationSet mimeType="audio/mp4" lang="ja">
      <Representation id="a1" bandwidth="128000" codecs="mp4a.40.2"/>
    </AdaptationSet>
    <AdaptationSet mimeType="image/jpeg">
      <Representation id="thumbs" bandwidth="1000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

async fn setup_mock_server(route: &str, body: &str) -> (String, MockServer) {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&mock_server)
        .await;

    (format!("{}{route}", mock_server.uri()), mock_server)
}

fn media_source(url: &str) -> DashMediaSource {
    setup_tracing();
    let data_sources = HttpDataSourceFactory::from_config(&DashPeriodConfig::default()).unwrap();
    DashMediaSource::new(
        Url::parse(url).unwrap(),
        Arc::new(data_sources),
        Arc::new(RecordingChunkSourceFactory::default()),
        Arc::new(FakeSampleStreamFactory::default()),
    )
}

#[tokio::test]
async fn test_http_data_source_streams_body() -> anyhow::Result<()> {
    let (url, _server) = setup_mock_server("/manifest.mpd", STATIC_MPD).await;

    let meter = Arc::new(DefaultBandwidthMeter::new());
    let source = HttpDataSourceFactory::from_config(&DashPeriodConfig::default())?
        .create_data_source(Some(meter.clone()));
    let chunks: Vec<_> = source.open(&Url::parse(&url)?).await?.try_collect().await?;
    let body: Vec<u8> = chunks.concat();

    assert_eq!(body, STATIC_MPD.as_bytes());
    assert!(meter.bitrate_estimate().is_some());

    Ok(())
}

#[tokio::test]
async fn test_http_status_error() -> anyhow::Result<()> {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let source = HttpDataSourceFactory::from_config(&DashPeriodConfig::default())?
        .create_data_source(None);
    let result = source
        .open(&Url::parse(&format!("{}/missing.mpd", mock_server.uri()))?)
        .await;
    assert!(matches!(
        result,
        Err(DashError::HttpError(status)) if status == reqwest::StatusCode::NOT_FOUND
    ));

    Ok(())
}

#[tokio::test]
async fn test_prepare_over_http() -> anyhow::Result<()> {
    let (url, _server) = setup_mock_server("/manifest.mpd", STATIC_MPD).await;

    let mut source = media_source(&url);
    let callback = Arc::new(RecordingCallback::default());
    source.prepare(callback.clone(), Arc::new(DefaultAllocator::default()), 0)?;
    source.run_until_prepared().await?;

    assert_eq!(source.state(), PeriodState::Prepared);
    assert_eq!(callback.prepared(), 1);
    assert_eq!(source.duration_us(), Some(12_000_000));

    let groups = source.track_groups();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].track_type, TrackType::Video);
    assert_eq!(groups[0].len(), 2);
    assert_eq!(
        groups[1].format(0).assert_success().language.as_deref(),
        Some("ja")
    );

    Ok(())
}

#[tokio::test]
async fn test_clock_sync_over_http() -> anyhow::Result<()> {
    let mock_server = MockServer::start().await;
    let dynamic_mpd = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic" minimumUpdatePeriod="PT30S" availabilityStartTime="2024-01-01T00:00:00Z">
  <Period id="live" start="PT0S">
    <AdaptationSet contentType="audio" mimeType="audio/mp4">
      <Representation id="a1" bandwidth="128000" codecs="mp4a.40.2"/>
    </AdaptationSet>
  </Period>
  <UTCTiming schemeIdUri="urn:mpeg:dash:utc:http-xsdate:2014" value="{}/time"/>
</MPD>"#,
        mock_server.uri()
    );
    Mock::given(method("GET"))
        .and(path("/live.mpd"))
        .respond_with(ResponseTemplate::new(200).set_body_string(dynamic_mpd))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/time"))
        .respond_with(ResponseTemplate::new(200).set_body_string("2024-01-01T00:00:00Z"))
        .mount(&mock_server)
        .await;

    let mut source = media_source(&format!("{}/live.mpd", mock_server.uri()));
    source.prepare(
        Arc::new(RecordingCallback::default()),
        Arc::new(DefaultAllocator::default()),
        0,
    )?;
    source.run_until_prepared().await?;

    // the local clock started less than a minute ago
    let offset = source.elapsed_realtime_offset_ms();
    assert!(offset <= NEW_YEAR_2024_MS);
    assert!(offset > NEW_YEAR_2024_MS - 60_000);
    assert_eq!(source.state(), PeriodState::RefreshScheduled);
    assert_eq!(source.duration_us(), None);

    source.release();
    Ok(())
}

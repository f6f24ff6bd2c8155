//! Contract tests for the built-in feeds.
//!
//! Each feed is driven through a real executor against canned upstream
//! payloads, checking what it claims to support and the records it yields.

#[path = "../support/mod.rs"]
mod support;

use std::sync::Arc;
use std::time::Duration;

use aerofeed_core::feeds::NotamCredentials;
use aerofeed_core::{
    AggregatorConfig, AreaFilter, DataSource, FeedSettings, GeoPoint, HttpResponse, MetarFeed,
    NotamFeed, OpenSkyFeed, QueryTarget, ReadsbFeed, RequestExecutor, SourceAggregator,
    SourceErrorKind, SourceStatus,
};
use serde_json::Value;
use support::{executor, RoutedHttpClient, ScriptedHttpClient};

const METAR_BODY: &str = r#"[{
    "icaoId": "KJFK",
    "obsTime": 1714564260,
    "rawOb": "KJFK 011151Z 21012KT 10SM FEW250 12/06 A3012",
    "temp": 12.2,
    "dewp": 6.1,
    "wdir": 210,
    "wspd": 12,
    "visib": "10+",
    "altim": 1019.6,
    "fltCat": "VFR",
    "lat": 40.6392,
    "lon": -73.7639,
    "name": "New York/JF Kennedy Intl, NY, US"
}]"#;

const NOTAM_BODY: &str = r#"{
    "pageSize": 100,
    "items": [{
        "properties": {
            "coreNOTAMData": {
                "notam": {
                    "id": "NOTAM_1_73849812",
                    "number": "05/123",
                    "type": "N",
                    "issued": "2024-05-01T10:00:00.000Z",
                    "icaoLocation": "KJFK",
                    "effectiveStart": "2024-05-01T12:00:00.000Z",
                    "effectiveEnd": "2024-05-02T12:00:00.000Z",
                    "text": "RWY 04L/22R CLSD"
                }
            }
        }
    }]
}"#;

const READSB_BODY: &str = r#"{
    "now": 1714564800000,
    "ac": [{
        "hex": "a1b2c3",
        "flight": "DAL123  ",
        "r": "N123DL",
        "t": "A321",
        "alt_baro": 35025,
        "gs": 451.2,
        "track": 90.0,
        "lat": 40.71,
        "lon": -73.9,
        "seen_pos": 0.5
    }]
}"#;

const OPENSKY_BODY: &str = r#"{
    "time": 1714564800,
    "states": [
        ["a1b2c3", "DAL123  ", "United States", 1714564795, 1714564799,
         -73.9, 40.71, 10668.0, false, 231.5, 89.96, 0.0, null, 10820.4, "2345", false, 0]
    ]
}"#;

fn aggregator_over(executor: RequestExecutor, source: Arc<dyn DataSource>) -> SourceAggregator {
    SourceAggregator::new(executor, AggregatorConfig::default())
        .with_source(source)
        .expect("unique ids")
}

fn credentials() -> NotamCredentials {
    NotamCredentials {
        client_id: String::from("id"),
        client_secret: String::from("secret"),
    }
}

#[tokio::test]
async fn metar_feed_answers_station_queries_only_for_location_codes() {
    let http = Arc::new(RoutedHttpClient::new().route("metar?ids=KJFK", 200, METAR_BODY));
    let executor = executor(http.clone(), 1);
    let feed = MetarFeed::new(FeedSettings::new("aviationweather", 1)).with_base_url("https://metar.test/api/");

    let station = QueryTarget::identity("kjfk").expect("valid");
    assert!(feed.supports(&station));
    assert!(!feed.supports(&QueryTarget::identity("a1b2c3").expect("valid")));

    let records = feed.fetch(&executor, &station).await.expect("fetch succeeds");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].identity_key, "kjfk");
    assert_eq!(records[0].field("flight_category"), Some(&Value::from("VFR")));
    assert_eq!(records[0].field("visibility_sm"), Some(&Value::from("10+")));
    assert_eq!(http.calls_matching("https://metar.test/api/metar?ids=KJFK&format=json"), 1);

    // Second fetch is a fresh cache hit.
    feed.fetch(&executor, &station).await.expect("cached");
    assert_eq!(http.calls_matching("metar.test"), 1);
}

#[tokio::test]
async fn notam_feed_is_disabled_without_credentials() {
    let http = Arc::new(RoutedHttpClient::new().route("icaoLocation=KJFK", 200, NOTAM_BODY));
    let executor = executor(http.clone(), 1);
    let station = QueryTarget::identity("KJFK").expect("valid");

    let anonymous = NotamFeed::new(FeedSettings::new("faa_notam", 1), None);
    assert!(!anonymous.enabled());
    let error = anonymous
        .fetch(&executor, &station)
        .await
        .expect_err("no credentials");
    assert_eq!(error.kind(), SourceErrorKind::InvalidRequest);
    assert_eq!(http.calls_matching("notam.test"), 0);

    let feed = NotamFeed::new(FeedSettings::new("faa_notam", 1), Some(credentials()))
        .with_base_url("https://notam.test/v1");
    assert!(feed.enabled());
    let records = feed.fetch(&executor, &station).await.expect("fetch succeeds");

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].identity_key, "notam_1_73849812");
    assert_eq!(records[0].field("text"), Some(&Value::from("RWY 04L/22R CLSD")));
    assert_eq!(records[0].field("location"), Some(&Value::from("KJFK")));
}

#[tokio::test]
async fn readsb_feed_queries_by_hex_and_by_point() {
    let http = Arc::new(
        RoutedHttpClient::new()
            .route("/hex/a1b2c3", 200, READSB_BODY)
            .route("/point/", 200, READSB_BODY),
    );
    let executor = executor(http.clone(), 1);
    let feed = ReadsbFeed::new(FeedSettings::new("adsb_lol", 1)).with_base_url("https://readsb.test/v2");

    assert!(!feed.supports(&QueryTarget::identity("KJFK").expect("valid")));

    let records = feed
        .fetch(&executor, &QueryTarget::identity("A1B2C3").expect("valid"))
        .await
        .expect("fetch succeeds");
    assert_eq!(records[0].field("callsign"), Some(&Value::from("DAL123")));
    assert_eq!(records[0].field("altitude_ft"), Some(&Value::from(35_025)));
    assert_eq!(records[0].field("on_ground"), Some(&Value::from(false)));

    let area = AreaFilter::new(GeoPoint::new(40.64, -73.78).expect("valid"), 300.0).expect("valid");
    feed.fetch(&executor, &QueryTarget::area(area))
        .await
        .expect("fetch succeeds");
    assert_eq!(http.calls_matching("/point/40.6400/-73.7800/250"), 1);
}

#[tokio::test]
async fn opensky_feed_reports_upstream_failures_as_source_errors() {
    let http = Arc::new(RoutedHttpClient::new().route("opensky.test", 503, "maintenance"));
    let executor = executor(http, 1);
    let feed = OpenSkyFeed::new(FeedSettings::new("opensky", 2)).with_base_url("https://opensky.test/api");

    let error = feed
        .fetch(&executor, &QueryTarget::identity("a1b2c3").expect("valid"))
        .await
        .expect_err("upstream down");

    assert!(error.retryable());
}

#[tokio::test]
async fn traffic_feeds_merge_into_one_aircraft() {
    let http = Arc::new(
        RoutedHttpClient::new()
            .route("readsb.test", 200, READSB_BODY)
            .route("opensky.test", 200, OPENSKY_BODY),
    );
    let sources: Vec<Arc<dyn DataSource>> = vec![
        Arc::new(ReadsbFeed::new(FeedSettings::new("adsb_lol", 1)).with_base_url("https://readsb.test/v2")),
        Arc::new(
            OpenSkyFeed::new(FeedSettings::new("opensky", 2)).with_base_url("https://opensky.test/api"),
        ),
        Arc::new(MetarFeed::new(FeedSettings::new("aviationweather", 1)).with_base_url("https://metar.test/api")),
    ];
    let mut aggregator = SourceAggregator::new(executor(http.clone(), 1), AggregatorConfig::default());
    for source in sources {
        aggregator.register(source).expect("unique ids");
    }

    let report = aggregator
        .query(&QueryTarget::identity("a1b2c3").expect("valid"))
        .await;

    assert_eq!(report.records.len(), 1);
    let aircraft = &report.records[0];
    assert_eq!(aircraft.contributing_sources, vec!["adsb_lol", "opensky"]);
    assert_eq!(aircraft.field("altitude_ft"), Some(&Value::from(35_025)));
    assert_eq!(aircraft.field("squawk"), Some(&Value::from("2345")));
    assert_eq!(aircraft.provenance["squawk"], "opensky");
    assert_eq!(aircraft.field("origin_country"), Some(&Value::from("United States")));
    assert_eq!(http.calls_matching("metar.test"), 0);
}

#[tokio::test]
async fn metar_answer_served_from_an_expired_cache_entry_is_flagged_stale() {
    // An undated observation, then the upstream goes down.
    let http = ScriptedHttpClient::new(vec![
        Ok(HttpResponse::ok_json(r#"[{"icaoId": "KJFK", "rawOb": "KJFK 011151Z 21012KT"}]"#)),
        Ok(HttpResponse::new(500, "down")),
    ]);
    let feed = MetarFeed::new(FeedSettings::new("aviationweather", 1).with_ttl(Duration::from_millis(50)))
        .with_base_url("https://metar.test/api");
    let aggregator = aggregator_over(executor(http.clone(), 1), Arc::new(feed));
    let station = QueryTarget::identity("KJFK").expect("valid");

    let live = aggregator.query(&station).await;
    assert!(!live.records[0].is_stale);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let fallback = aggregator.query(&station).await;

    assert_eq!(http.calls(), 2);
    assert_eq!(fallback.outcomes[0].status, SourceStatus::Ok { records: 1 });
    assert_eq!(fallback.records.len(), 1);
    assert!(fallback.records[0].is_stale, "expired cache entry must not look fresh");
    assert_eq!(
        fallback.records[0].field("raw_text"),
        Some(&Value::from("KJFK 011151Z 21012KT"))
    );
}

#[tokio::test]
async fn live_notice_is_fresh_however_long_ago_it_was_issued() {
    let http = Arc::new(RoutedHttpClient::new().route("icaoLocation=KJFK", 200, NOTAM_BODY));
    let feed = NotamFeed::new(FeedSettings::new("faa_notam", 1), Some(credentials()))
        .with_base_url("https://notam.test/v1");
    let aggregator = aggregator_over(executor(http, 1), Arc::new(feed));

    let report = aggregator
        .query(&QueryTarget::identity("KJFK").expect("valid"))
        .await;

    assert!(!report.from_cache);
    assert_eq!(report.records.len(), 1);
    assert!(!report.records[0].is_stale);
    assert_eq!(
        report.records[0].field("issued"),
        Some(&Value::from("2024-05-01T10:00:00.000Z"))
    );
}

#[tokio::test]
async fn readsb_aircraft_with_absurd_message_age_does_not_break_the_query() {
    let body = r#"{"now":1714564800000,"ac":[{"hex":"a1b2c3","seen_pos":1e12}]}"#;
    let http = Arc::new(RoutedHttpClient::new().route("readsb.test", 200, body));
    let feed = ReadsbFeed::new(FeedSettings::new("adsb_lol", 1)).with_base_url("https://readsb.test/v2");
    let aggregator = aggregator_over(executor(http, 1), Arc::new(feed));

    let report = tokio::spawn(async move {
        aggregator
            .query(&QueryTarget::identity("a1b2c3").expect("valid"))
            .await
    })
    .await
    .expect("query task completes");

    assert_eq!(report.outcomes[0].status, SourceStatus::Ok { records: 0 });
    assert!(report.records.is_empty());
}

use axum::{
  Json, Router,
  body::Body,
  extract::{Path, State},
  http::{HeaderValue, StatusCode, header},
  response::{IntoResponse, Response},
  routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::catalog::CatalogStore;
use crate::error::{Error, Result};
use crate::guide::GuidePublisher;
use crate::logo::LogoCache;
use crate::playlist::{self, logo_url};
use crate::proxy::{MPEGURL, ProxyResponse, StatsSnapshot, StreamProxy};
use crate::selection::SelectionStore;

#[derive(Clone)]
pub struct AppState {
  pub api_url: Arc<str>,
  pub catalog: Arc<CatalogStore>,
  pub selection: Arc<SelectionStore>,
  pub guide: Arc<GuidePublisher>,
  pub proxy: Arc<StreamProxy>,
  pub logos: Arc<LogoCache>,
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/playlist.m3u8", get(get_playlist))
    .route("/guide.xml", get(get_guide))
    .route("/stream/{id}", get(get_legacy_index))
    .route("/stream/{id}/index.m3u8", get(get_index))
    .route("/stream/{id}/m/{token}", get(get_manifest))
    .route("/stream/{id}/s/{token}", get(get_segment))
    .route("/stream/{id}/k/{token}", get(get_key))
    .route("/logo/{reference}", get(get_logo))
    .route("/api/channels", get(list_channels))
    .route("/api/selection", post(update_selection))
    .route("/api/stats", get(get_stats))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

impl IntoResponse for ProxyResponse {
  fn into_response(self) -> Response {
    match self {
      ProxyResponse::Manifest(text) => {
        ([(header::CONTENT_TYPE, MPEGURL), (header::CACHE_CONTROL, "no-cache")], text).into_response()
      }
      ProxyResponse::Bytes { content_type, body } => ([(header::CONTENT_TYPE, content_type)], body).into_response(),
      ProxyResponse::Stream { content_type, content_length, body } => {
        let mut response = Response::new(Body::from_stream(body));
        let headers = response.headers_mut();
        let content_type = content_type.as_deref().unwrap_or("video/mp2t");
        if let Ok(value) = HeaderValue::from_str(content_type) {
          headers.insert(header::CONTENT_TYPE, value);
        }
        if let Some(len) = content_length {
          headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }
        response
      }
    }
  }
}

async fn get_playlist(State(state): State<AppState>) -> Response {
  let body = match state.catalog.current() {
    Some(snapshot) => playlist::render(&snapshot, &state.selection.record(), &state.api_url),
    None => format!("#EXTM3U url-tvg=\"{}/guide.xml\"\n", state.api_url),
  };
  ([(header::CONTENT_TYPE, MPEGURL)], body).into_response()
}

async fn get_guide(State(state): State<AppState>) -> Response {
  match state.guide.current() {
    Some(doc) => ([(header::CONTENT_TYPE, "application/xml")], doc).into_response(),
    None => {
      (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({ "error": "guide not generated yet" }))).into_response()
    }
  }
}

async fn get_legacy_index(State(state): State<AppState>, Path(file): Path<String>) -> Result<ProxyResponse> {
  let id = file.strip_suffix(".m3u8").ok_or_else(|| Error::not_found(format!("stream {file}")))?;
  state.proxy.index(id).await
}

async fn get_index(State(state): State<AppState>, Path(id): Path<String>) -> Result<ProxyResponse> {
  state.proxy.index(&id).await
}

async fn get_manifest(State(state): State<AppState>, Path((id, token)): Path<(String, String)>) -> Result<ProxyResponse> {
  state.proxy.manifest(&id, &token).await
}

async fn get_segment(State(state): State<AppState>, Path((id, token)): Path<(String, String)>) -> Result<ProxyResponse> {
  state.proxy.segment(&id, &token).await
}

async fn get_key(State(state): State<AppState>, Path((id, token)): Path<(String, String)>) -> Result<ProxyResponse> {
  state.proxy.key(&id, &token).await
}

async fn get_logo(State(state): State<AppState>, Path(reference): Path<String>) -> Result<Response> {
  let (content_type, body) = state.logos.get(&reference).await?;
  Ok(([(header::CONTENT_TYPE, content_type), (header::CACHE_CONTROL, "public, max-age=86400")], body).into_response())
}

#[derive(Serialize)]
struct ChannelView {
  id: String,
  name: String,
  category: String,
  logo: Option<String>,
  included: bool,
}

async fn list_channels(State(state): State<AppState>) -> Json<Vec<ChannelView>> {
  let record = state.selection.record();
  let channels = state
    .catalog
    .current()
    .map(|snapshot| {
      snapshot
        .channels()
        .iter()
        .map(|c| ChannelView {
          id: c.id.clone(),
          name: c.name.clone(),
          category: c.category.clone(),
          logo: c.logo_url.as_deref().map(|l| logo_url(&state.api_url, l)),
          included: record.is_included(&c.id),
        })
        .collect()
    })
    .unwrap_or_default();
  Json(channels)
}

#[derive(Deserialize)]
struct SelectionUpdate {
  ids: Vec<String>,
  included: bool,
}

#[derive(Serialize)]
struct SelectionSummary {
  excluded: usize,
  modified: Option<DateTime<Utc>>,
}

async fn update_selection(
  State(state): State<AppState>,
  Json(update): Json<SelectionUpdate>,
) -> Result<Json<SelectionSummary>> {
  let record = state.selection.update(&update.ids, update.included).await?;
  let excluded = record.channels.values().filter(|included| !**included).count();
  Ok(Json(SelectionSummary { excluded, modified: record.modified }))
}

#[derive(Serialize)]
struct Stats {
  proxy: StatsSnapshot,
  channels: usize,
  included_channels: usize,
  events: usize,
  catalog_fetched_at: Option<DateTime<Utc>>,
  guide_published_at: Option<DateTime<Utc>>,
}

async fn get_stats(State(state): State<AppState>) -> Json<Stats> {
  let snapshot = state.catalog.current();
  Json(Stats {
    proxy: state.proxy.stats(),
    channels: snapshot.as_ref().map_or(0, |s| s.channels().len()),
    included_channels: snapshot.as_ref().map_or(0, |s| state.selection.effective_set(s).len()),
    events: snapshot.as_ref().map_or(0, |s| s.events().len()),
    catalog_fetched_at: snapshot.as_ref().map(|s| s.fetched_at()),
    guide_published_at: state.guide.published_at(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::catalog::CatalogSnapshot;
  use crate::catalog::tests::channel;
  use crate::token::encode_plain;
  use crate::upstream::fake::FakeUpstream;
  use axum::http::Request;
  use std::sync::atomic::Ordering;
  use tokio_util::sync::CancellationToken;
  use tower::ServiceExt;

  const API: &str = "http://proxy.local:3000";

  struct TestApp {
    state: AppState,
    upstream: Arc<FakeUpstream>,
    _dir: tempfile::TempDir,
  }

  async fn app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut a = channel("A", "Alpha");
    a.logo_url = Some("https://cdn.example.com/a.png".into());
    let channels = vec![a, channel("B", "Beta"), channel("C", "Gamma")];
    let upstream = Arc::new(FakeUpstream::with_channels(channels));
    let catalog = Arc::new(CatalogStore::new());
    let state = AppState {
      api_url: Arc::from(API),
      catalog: catalog.clone(),
      selection: Arc::new(SelectionStore::load(dir.path().join("channels.json")).await),
      guide: Arc::new(GuidePublisher::load(dir.path().join("guide.xml")).await),
      proxy: Arc::new(StreamProxy::new(upstream.clone(), catalog.clone(), API, true, CancellationToken::new())),
      logos: Arc::new(LogoCache::new(dir.path().join("logo-cache"), upstream.clone(), catalog)),
    };
    TestApp { state, upstream, _dir: dir }
  }

  impl TestApp {
    async fn load_catalog(&self) {
      let channels = self.upstream.channels.lock().unwrap().clone();
      self.state.catalog.commit(CatalogSnapshot::new(channels, vec![], Utc::now()));
    }

    async fn get(&self, uri: &str) -> (StatusCode, Option<String>, String) {
      let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
      send(self.state.clone(), req).await
    }
  }

  async fn send(state: AppState, req: Request<Body>) -> (StatusCode, Option<String>, String) {
    let resp = router(state).oneshot(req).await.unwrap();
    let status = resp.status();
    let ct = resp.headers().get(header::CONTENT_TYPE).map(|v| v.to_str().unwrap().to_string());
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, ct, String::from_utf8_lossy(&body).into_owned())
  }

  #[tokio::test]
  async fn artifacts_before_first_refresh() {
    let app = app().await;
    let (status, ct, body) = app.get("/playlist.m3u8").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ct.as_deref(), Some(MPEGURL));
    assert!(body.starts_with("#EXTM3U"));

    let (status, _, _) = app.get("/guide.xml").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
  }

  #[tokio::test]
  async fn guide_is_served_once_published() {
    let app = app().await;
    app.state.guide.publish("<tv/>".into(), Utc::now()).await;
    let (status, ct, body) = app.get("/guide.xml").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ct.as_deref(), Some("application/xml"));
    assert_eq!(body, "<tv/>");
  }

  #[tokio::test]
  async fn playlist_urls_resolve_back_to_their_channel() {
    let app = app().await;
    app.load_catalog().await;
    let (_, _, playlist) = app.get("/playlist.m3u8").await;
    let first = playlist.lines().find(|l| !l.starts_with('#')).unwrap();
    let path = first.strip_prefix(API).unwrap();
    assert_eq!(path, "/stream/A/index.m3u8");

    let (status, ct, manifest) = app.get(path).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ct.as_deref(), Some(MPEGURL));
    assert!(manifest.contains(&format!("{API}/stream/A/s/")));
    assert!(!manifest.contains("upstream.test"));
  }

  #[tokio::test]
  async fn legacy_stream_path_and_unknown_channels() {
    let app = app().await;
    app.load_catalog().await;
    let (status, _, _) = app.get("/stream/B.m3u8").await;
    assert_eq!(status, StatusCode::OK);

    let (status, ct, body) = app.get("/stream/ZZ/index.m3u8").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(ct.as_deref(), Some("application/json"));
    assert!(body.contains("error"));

    let (status, _, _) = app.get("/stream/B").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
  }

  #[tokio::test]
  async fn upstream_failure_is_a_bad_gateway_without_partial_body() {
    let app = app().await;
    app.load_catalog().await;
    app.upstream.manifest_permanent.store(true, Ordering::SeqCst);
    let (status, _, body) = app.get("/stream/A/index.m3u8").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(!body.contains("#EXTM3U"));
    assert!(!body.contains("upstream.test"));
  }

  #[tokio::test]
  async fn selection_updates_flow_into_playlist() {
    let app = app().await;
    app.load_catalog().await;
    let req = Request::builder()
      .method("POST")
      .uri("/api/selection")
      .header(header::CONTENT_TYPE, "application/json")
      .body(Body::from(r#"{"ids":["B"],"included":false}"#))
      .unwrap();
    let (status, _, body) = send(app.state.clone(), req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("\"excluded\":1"));

    let (_, _, playlist) = app.get("/playlist.m3u8").await;
    let urls: Vec<&str> = playlist.lines().filter(|l| !l.starts_with('#')).collect();
    assert_eq!(urls, [format!("{API}/stream/A/index.m3u8"), format!("{API}/stream/C/index.m3u8")]);

    let (_, _, channels) = app.get("/api/channels").await;
    let channels: serde_json::Value = serde_json::from_str(&channels).unwrap();
    assert_eq!(channels[1]["id"], "B");
    assert_eq!(channels[1]["included"], false);
    assert!(channels[0]["logo"].as_str().unwrap().starts_with(&format!("{API}/logo/")));
  }

  #[tokio::test]
  async fn logos_and_stats() {
    let app = app().await;
    app.load_catalog().await;
    let (status, ct, _) = app.get(&format!("/logo/{}", encode_plain("https://cdn.example.com/a.png"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ct.as_deref(), Some("image/png"));

    let (status, _, _) = app.get(&format!("/logo/{}", encode_plain("https://other.example.com/x.png"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, body) = app.get("/api/stats").await;
    assert_eq!(status, StatusCode::OK);
    let stats: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(stats["channels"], 3);
    assert_eq!(stats["included_channels"], 3);
    assert_eq!(stats["proxy"]["active_sessions"], 0);
  }
}

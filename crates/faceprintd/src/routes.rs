//! HTTP routes: health check, embedding, similarity search.
//!
//! `/embed` and `/search` accept the same image sources: a multipart upload
//! (field `image`), or a JSON body with `image_path` or `url`. JSON bodies may
//! also carry an optional `bbox` or `landmarks` for the aligner.

use std::sync::Arc;

use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use faceprint_core::{BoundingBox, Embedding, FaceAligner, Landmarks};

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::error::{ApiError, Result};
use crate::ingest;
use crate::qdrant::QdrantClient;

const DEFAULT_TOP: i64 = 5;

pub struct AppState {
    pub config: Config,
    pub aligner: FaceAligner,
    pub engine: EngineHandle,
    pub qdrant: QdrantClient,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config, engine: EngineHandle, qdrant: QdrantClient) -> Self {
        let aligner = FaceAligner::new(config.image_size, config.margin);
        Self {
            config,
            aligner,
            engine,
            qdrant,
            http: reqwest::Client::new(),
        }
    }
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handler_health))
        .route("/embed", post(handler_embed))
        .route("/search", post(handler_search))
        .with_state(state)
}

#[derive(Debug)]
enum ImageSource {
    Upload { filename: String, bytes: Vec<u8> },
    Path(String),
    Url(String),
}

/// JSON body accepted by `/embed` and `/search`.
#[derive(Debug, Deserialize)]
struct JsonBody {
    image_path: Option<String>,
    url: Option<String>,
    bbox: Option<[i32; 4]>,
    landmarks: Option<Vec<[f32; 2]>>,
    top: Option<i64>,
    #[serde(default)]
    embedding: bool,
}

/// Parsed request: the image source plus the shared knobs, extracted from
/// either a multipart form or a JSON body.
#[derive(Debug)]
struct EmbedRequest {
    source: ImageSource,
    bbox: Option<[i32; 4]>,
    landmarks: Option<Vec<[f32; 2]>>,
    top: Option<i64>,
    with_embedding: bool,
}

const NO_IMAGE_ERROR: &str =
    "No image data provided. Use file upload or JSON with image_path/url";

#[axum::async_trait]
impl FromRequest<Arc<AppState>> for EmbedRequest {
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &Arc<AppState>) -> Result<Self> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("multipart/form-data") {
            let multipart = Multipart::from_request(req, state)
                .await
                .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {e}")))?;
            Self::from_multipart(multipart).await
        } else if content_type.starts_with("application/json") {
            let Json(body) = Json::<JsonBody>::from_request(req, state)
                .await
                .map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {e}")))?;
            Self::from_json(body)
        } else {
            Err(ApiError::BadRequest(NO_IMAGE_ERROR.into()))
        }
    }
}

impl EmbedRequest {
    async fn from_multipart(mut multipart: Multipart) -> Result<Self> {
        let mut source = None;
        let mut top = None;
        let mut with_embedding = false;

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {e}")))?
        {
            match field.name().unwrap_or("") {
                "image" => {
                    let filename = field.file_name().unwrap_or("").to_string();
                    let bytes = field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::BadRequest(format!("Failed to read upload: {e}")))?
                        .to_vec();
                    source = Some(ImageSource::Upload { filename, bytes });
                }
                "top" => {
                    let text = field.text().await.map_err(|e| {
                        ApiError::BadRequest(format!("Failed to read 'top' field: {e}"))
                    })?;
                    top = Some(text.trim().parse().map_err(|_| {
                        ApiError::BadRequest("Invalid 'top' parameter. Must be an integer".into())
                    })?);
                }
                "embedding" => {
                    let text = field.text().await.map_err(|e| {
                        ApiError::BadRequest(format!("Failed to read 'embedding' field: {e}"))
                    })?;
                    with_embedding = text.trim().eq_ignore_ascii_case("true");
                }
                _ => {}
            }
        }

        let source = source.ok_or_else(|| ApiError::BadRequest(NO_IMAGE_ERROR.into()))?;
        Ok(Self {
            source,
            bbox: None,
            landmarks: None,
            top,
            with_embedding,
        })
    }

    fn from_json(body: JsonBody) -> Result<Self> {
        let source = if let Some(path) = body.image_path {
            ImageSource::Path(path)
        } else if let Some(url) = body.url {
            ImageSource::Url(url)
        } else {
            return Err(ApiError::BadRequest(
                "Missing 'image_path' or 'url' in JSON data".into(),
            ));
        };

        Ok(Self {
            source,
            bbox: body.bbox,
            landmarks: body.landmarks,
            top: body.top,
            with_embedding: body.embedding,
        })
    }
}

struct EmbedOutcome {
    embedding: Embedding,
    source_type: &'static str,
    source_info: Value,
}

/// Resolve the image source, align, and embed. Shared by both endpoints.
async fn embed_source(
    state: &AppState,
    source: ImageSource,
    bbox: Option<[i32; 4]>,
    landmarks: Option<Vec<[f32; 2]>>,
) -> Result<EmbedOutcome> {
    let (image, source_type, source_info) = match source {
        ImageSource::Upload { filename, bytes } => {
            let image = ingest::decode_upload(&filename, &bytes)?;
            (image, "file_upload", json!({ "filename": filename }))
        }
        ImageSource::Path(path) => {
            let image = ingest::load_from_path(&path).await?;
            (image, "file_path", json!({ "path": path }))
        }
        ImageSource::Url(url) => {
            let image = ingest::fetch_from_url(&state.http, &url).await?;
            (image, "url", json!({ "url": url }))
        }
    };

    let landmarks = landmarks
        .map(Landmarks::try_from)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let bbox = bbox.map(BoundingBox::from);

    let aligned = state.aligner.preprocess(&image, bbox.as_ref(), landmarks.as_ref());
    let embedding = state.engine.embed_one(aligned).await?;

    tracing::debug!(source_type, dim = embedding.dim(), "embedding computed");

    Ok(EmbedOutcome { embedding, source_type, source_info })
}

fn validate_top(top: Option<i64>, max_search_results: usize) -> Result<usize> {
    let top = top.unwrap_or(DEFAULT_TOP);
    if top < 1 || top > max_search_results as i64 {
        return Err(ApiError::BadRequest(format!(
            "Parameter 'top' must be between 1 and {max_search_results}"
        )));
    }
    Ok(top as usize)
}

async fn handler_health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "message": "Face embedding API is running"
    }))
}

async fn handler_embed(
    State(state): State<Arc<AppState>>,
    request: EmbedRequest,
) -> Result<Json<Value>> {
    let EmbedRequest { source, bbox, landmarks, .. } = request;
    let resolved = embed_source(&state, source, bbox, landmarks).await?;

    Ok(Json(json!({
        "success": true,
        "source_type": resolved.source_type,
        "source_info": resolved.source_info,
        "embedding": resolved.embedding.values,
        "embedding_shape": [resolved.embedding.dim()],
    })))
}

async fn handler_search(
    State(state): State<Arc<AppState>>,
    request: EmbedRequest,
) -> Result<Json<Value>> {
    let EmbedRequest { source, bbox, landmarks, top, with_embedding } = request;
    let top = validate_top(top, state.config.max_search_results)?;

    let resolved = embed_source(&state, source, bbox, landmarks).await?;
    let search_results = state.qdrant.search(&resolved.embedding, top).await?;

    let mut response = json!({
        "success": true,
        "source_type": resolved.source_type,
        "source_info": resolved.source_info,
        "top": top,
        "search_results": search_results,
    });
    if with_embedding {
        response["embedding"] = json!(resolved.embedding.values);
        response["embedding_shape"] = json!([resolved.embedding.dim()]);
    }

    Ok(Json(response))
}

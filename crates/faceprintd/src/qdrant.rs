//! Qdrant search client.
//!
//! Talks to the points search endpoint over plain HTTP; the daemon never
//! creates collections or writes points, that belongs to the indexing
//! pipeline.

use faceprint_core::Embedding;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QdrantError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("qdrant returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    vector: &'a [f32],
    top: usize,
    with_payload: bool,
}

/// One scored point from a search response. Qdrant point IDs may be integers
/// or UUID strings, so `id` stays a raw JSON value; fields this daemon does
/// not interpret (e.g. `shard_key`) are carried through `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub id: Value,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub result: Vec<ScoredPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Clone)]
pub struct QdrantClient {
    http: reqwest::Client,
    search_url: String,
}

impl QdrantClient {
    pub fn new(base_url: &str, collection: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            search_url: format!(
                "{}/collections/{collection}/points/search",
                base_url.trim_end_matches('/')
            ),
        }
    }

    /// Search the collection for the points nearest to `embedding`.
    pub async fn search(
        &self,
        embedding: &Embedding,
        top: usize,
    ) -> Result<SearchResponse, QdrantError> {
        let request = SearchRequest {
            vector: &embedding.values,
            top,
            with_payload: true,
        };

        let response = self.http.post(&self.search_url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QdrantError::Status { status: status.as_u16(), body });
        }

        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_url_building() {
        let client = QdrantClient::new("http://qdrant:6333", "faces");
        assert_eq!(
            client.search_url,
            "http://qdrant:6333/collections/faces/points/search"
        );

        let client = QdrantClient::new("http://qdrant:6333/", "faces");
        assert_eq!(
            client.search_url,
            "http://qdrant:6333/collections/faces/points/search"
        );
    }

    #[test]
    fn test_search_request_serialization() {
        let request = SearchRequest {
            vector: &[0.5, -1.0],
            top: 5,
            with_payload: true,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "vector": [0.5, -1.0], "top": 5, "with_payload": true })
        );
    }

    #[test]
    fn test_search_response_deserialization() {
        let body = r#"{
            "result": [
                { "id": 42, "version": 3, "score": 0.81, "payload": { "name": "thao" } },
                { "id": "5e3ad9ed-6571-4aa9-a7a2-1fdc0e4e6b83", "score": 0.4 }
            ],
            "status": "ok",
            "time": 0.002
        }"#;
        let response: SearchResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.result.len(), 2);
        assert_eq!(response.result[0].id, serde_json::json!(42));
        assert!((response.result[0].score - 0.81).abs() < 1e-6);
        assert_eq!(
            response.result[0].payload.as_ref().unwrap()["name"],
            "thao"
        );
        assert!(response.result[1].payload.is_none());
        assert_eq!(response.time, Some(0.002));
    }

    #[test]
    fn test_unrecognized_fields_survive_reserialization() {
        let body = r#"{
            "result": [
                { "id": 7, "score": 0.9, "shard_key": "eu-west", "order_value": 3 }
            ],
            "status": "ok",
            "usage": { "cpu": 1 }
        }"#;
        let response: SearchResponse = serde_json::from_str(body).unwrap();
        let round_tripped = serde_json::to_value(&response).unwrap();

        assert_eq!(round_tripped["result"][0]["shard_key"], "eu-west");
        assert_eq!(round_tripped["result"][0]["order_value"], 3);
        assert_eq!(round_tripped["usage"]["cpu"], 1);
    }
}

//! JSON report of a probe run.

use serde::Serialize;
use tvkit_net::NetError;
use tvkit_sw::{ActivationReport, CacheStorage, FetchResponse, ResponseSource};

/// Full probe output.
#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub origin: String,
    pub version: String,
    /// `false` when the registered version was already installed.
    pub installed: bool,
    pub activation: Option<ActivationSummary>,
    pub generations: Vec<GenerationReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub requests: Vec<RequestReport>,
}

#[derive(Debug, Serialize)]
pub struct ActivationSummary {
    pub purged: Vec<String>,
    pub leaked: Vec<String>,
    pub claim: bool,
}

impl From<&ActivationReport> for ActivationSummary {
    fn from(report: &ActivationReport) -> Self {
        Self {
            purged: report.purged.clone(),
            leaked: report.leaked.clone(),
            claim: report.claim,
        }
    }
}

/// One cache generation.
#[derive(Debug, Serialize)]
pub struct GenerationReport {
    pub name: String,
    pub entries: Vec<String>,
    pub bytes: usize,
}

/// Where a probed request was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Network,
    Cache,
    Bypass,
    Failure,
}

#[derive(Debug, Serialize)]
pub struct RequestReport {
    pub path: String,
    pub source: Source,
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RequestReport {
    pub fn new(path: &str, result: &Result<FetchResponse, NetError>) -> Self {
        match result {
            Ok(fetched) => Self {
                path: path.to_string(),
                source: match fetched.source {
                    ResponseSource::Network => Source::Network,
                    ResponseSource::Cache => Source::Cache,
                    ResponseSource::Passthrough => Source::Bypass,
                },
                status: Some(fetched.response.status.as_u16()),
                content_type: fetched.response.header("content-type").map(str::to_string),
                bytes: fetched.response.body.len(),
                error: None,
            },
            Err(e) => Self {
                path: path.to_string(),
                source: Source::Failure,
                status: None,
                content_type: None,
                bytes: 0,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Describe every generation in `storage`, ordered by name.
pub fn generations(storage: &CacheStorage) -> Vec<GenerationReport> {
    storage
        .keys()
        .into_iter()
        .filter_map(|name| {
            let cache = storage.get(&name)?;
            let keys = cache.keys();
            let bytes = keys
                .iter()
                .filter_map(|key| cache.match_key(key))
                .map(|entry| entry.body.len())
                .sum();
            Some(GenerationReport {
                entries: keys.iter().map(|key| key.to_string()).collect(),
                name,
                bytes,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderValue, CONTENT_TYPE};
    use std::time::Duration;
    use tvkit_net::{Request, Response, Url};
    use tvkit_sw::CacheEntry;

    // Default status is 200
    fn response(body: &'static str) -> Response {
        Response::new(
            Url::parse("https://tv.example/manifest.json").unwrap(),
            Default::default(),
            body,
        )
        .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
    }

    #[test]
    fn test_request_sources() {
        let cached = RequestReport::new(
            "/",
            &Ok(FetchResponse {
                response: response("hello"),
                source: ResponseSource::Cache,
            }),
        );
        assert_eq!(cached.source, Source::Cache);
        assert_eq!(cached.bytes, 5);
        assert_eq!(cached.content_type.as_deref(), Some("application/json"));

        let bypassed = RequestReport::new(
            "/api/epg",
            &Ok(FetchResponse {
                response: response(""),
                source: ResponseSource::Passthrough,
            }),
        );
        assert_eq!(bypassed.source, Source::Bypass);

        let failed = RequestReport::new("/x", &Err(NetError::Timeout(Duration::from_secs(1))));
        assert_eq!(failed.source, Source::Failure);
        assert!(failed.error.unwrap().contains("Timeout"));
    }

    #[tokio::test]
    async fn test_generation_listing() {
        let mut storage = CacheStorage::new();
        let request = Request::parse_get("https://tv.example/manifest.json").unwrap();
        let entry = CacheEntry::from_response(&request, &response("{}"));
        storage.put("v1", entry).await.unwrap();
        storage.open("v0");

        let listed = generations(&storage);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "v0");
        assert!(listed[0].entries.is_empty());
        assert_eq!(listed[1].entries, vec!["GET https://tv.example/manifest.json"]);
        assert_eq!(listed[1].bytes, 2);
    }

    #[test]
    fn test_report_json_shape() {
        let report = ProbeReport {
            origin: "https://tv.example/".to_string(),
            version: "v1".to_string(),
            installed: true,
            activation: None,
            generations: Vec::new(),
            requests: Vec::new(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["version"], "v1");
        assert!(json.get("requests").is_none());
    }
}

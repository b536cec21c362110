//! HTTP tile source adapter.
//!
//! Grounded on the teacher's `Tile::fetch_from` (`src/tile.rs`) and
//! `UrlFormat` (`src/url.rs`): URL templating and `429`/`Retry-After`
//! handling carry over, generalized from the teacher's `{s}` subdomain
//! rotation (dropped, see DESIGN.md) to the plain `{z}`/`{x}`/`{y}` template
//! spec.md §3 defines.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};

use crate::config::{SourceSpec, TileKind};
use crate::geometry::{BBox, TileCoord};
use crate::validator::{Classification, Validator};

use super::{Source, TileResult};

#[derive(Debug)]
pub struct HttpSource {
    name: String,
    url_template: String,
    tile_kind: TileKind,
    min_zoom: Option<u8>,
    max_zoom: Option<u8>,
    client: Client,
    validator: Arc<Validator>,
}

impl HttpSource {
    pub fn new(
        spec: &SourceSpec,
        user_agent: &str,
        timeout: Duration,
        validator: Arc<Validator>,
    ) -> reqwest::Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::USER_AGENT, user_agent.parse().unwrap());
        for (key, value) in &spec.headers {
            if let (Ok(name), Ok(val)) = (
                header::HeaderName::from_bytes(key.as_bytes()),
                header::HeaderValue::from_str(value),
            ) {
                headers.insert(name, val);
            }
        }

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(1))
            .build()?;

        Ok(HttpSource {
            name: spec.name.clone(),
            url_template: spec.url_template.clone().unwrap_or_default(),
            tile_kind: spec.tile_kind,
            min_zoom: spec.min_zoom,
            max_zoom: spec.max_zoom,
            client,
            validator,
        })
    }

    pub(crate) fn url_for(&self, coord: TileCoord) -> String {
        self.url_template
            .replace("{z}", &coord.z.to_string())
            .replace("{x}", &coord.x.to_string())
            .replace("{y}", &coord.y.to_string())
    }
}

#[async_trait]
impl Source for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn tile_kind(&self) -> TileKind {
        self.tile_kind
    }

    fn min_zoom(&self) -> Option<u8> {
        self.min_zoom
    }

    fn max_zoom(&self) -> Option<u8> {
        self.max_zoom
    }

    fn bounds(&self) -> Option<BBox> {
        None
    }

    async fn fetch(&self, coord: TileCoord) -> TileResult {
        let url = self.url_for(coord);

        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                return TileResult::Transient {
                    reason: format!("request error: {e}"),
                }
            }
        };

        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return TileResult::NotFound;
        }

        if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            return TileResult::Transient {
                reason: format!("status {status}"),
            };
        }

        if status.is_client_error() {
            return TileResult::Invalid {
                reason: format!("status {status}"),
            };
        }

        let gzipped = response
            .headers()
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("gzip"))
            .unwrap_or(false);

        let bytes = match response.bytes().await {
            Ok(b) => b.to_vec(),
            Err(e) => {
                return TileResult::Transient {
                    reason: format!("body read error: {e}"),
                }
            }
        };

        if bytes.is_empty() {
            return TileResult::Empty;
        }

        let bytes = match self.validator.maybe_decompress(bytes, gzipped) {
            Ok(b) => b,
            Err(e) => {
                return TileResult::Invalid {
                    reason: format!("gzip decode failed: {e}"),
                }
            }
        };

        match self.validator.classify(self.tile_kind, &bytes) {
            Classification::Valid { content_type } => TileResult::Got {
                bytes,
                content_type: Some(content_type.to_string()),
                source_name: self.name.clone(),
            },
            Classification::Empty => TileResult::Empty,
            Classification::Invalid { reason } => TileResult::Invalid { reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    #[test]
    fn url_template_substitution() {
        let validator = Arc::new(Validator::new(&[]));
        let spec = SourceSpec {
            name: "cdb".into(),
            kind: crate::config::SourceKind::Http,
            tile_kind: TileKind::Raster,
            url_template: Some("https://tiles.example/{z}/{x}/{y}.png".into()),
            path: None,
            headers: StdHashMap::new(),
            min_zoom: None,
            max_zoom: None,
        };
        let source = HttpSource::new(&spec, "tile-forge/test", Duration::from_secs(5), validator).unwrap();
        assert_eq!(
            source.url_for(TileCoord::new(3, 4, 5)),
            "https://tiles.example/3/4/5.png"
        );
    }
}

use crate::domain::ports::{FetchRequest, FetchResponse, HttpFetcher};
use crate::utils::error::TransportFailure;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;

/// 以 reqwest 實作的 [`HttpFetcher`]；走代理的請求使用獨立 client
#[derive(Debug, Clone, Default)]
pub struct ReqwestFetcher {
    client: Client,
}

impl ReqwestFetcher {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<Client, TransportFailure> {
        let Some(proxy) = proxy else {
            return Ok(self.client.clone());
        };

        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| TransportFailure::Proxy(format!("{}: {}", proxy, e)))?;
        Client::builder()
            .proxy(proxy)
            .build()
            .map_err(|e| TransportFailure::Proxy(e.to_string()))
    }
}

fn classify(e: reqwest::Error) -> TransportFailure {
    if e.is_timeout() {
        TransportFailure::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportFailure::Connect(e.to_string())
    } else {
        TransportFailure::Protocol(e.to_string())
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn stream_get(&self, request: FetchRequest) -> Result<FetchResponse, TransportFailure> {
        let client = self.client_for(request.proxy.as_deref())?;

        let mut builder = client.get(&request.url).timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        tracing::debug!("GET {}", request.url);
        let response = builder.send().await.map_err(classify)?;
        tracing::debug!("Response status: {}", response.status());

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(classify))
            .boxed();

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use httpmock::prelude::*;
    use std::time::Duration;

    fn request(url: String) -> FetchRequest {
        FetchRequest {
            url,
            headers: vec![("Accept".to_string(), "application/pdf,*/*".to_string())],
            proxy: None,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_streams_body_and_lowercases_headers() {
        let server = MockServer::start();
        let api_mock = server.mock(|when, then| {
            when.method(GET)
                .path("/doc.pdf")
                .header("accept", "application/pdf,*/*");
            then.status(200)
                .header("Content-Type", "application/pdf")
                .body("%PDF-1.4 test");
        });

        let response = ReqwestFetcher::new()
            .stream_get(request(server.url("/doc.pdf")))
            .await
            .unwrap();

        api_mock.assert();
        assert_eq!(response.status, 200);
        assert_eq!(
            response.headers.get("content-type").map(String::as_str),
            Some("application/pdf")
        );
        let chunks: Vec<_> = response.body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"%PDF-1.4 test");
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_failure() {
        // 綁定後立刻釋放，取得一個沒有人在聽的埠
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let result = ReqwestFetcher::new()
            .stream_get(request(format!("http://127.0.0.1:{}/doc.pdf", port)))
            .await;

        assert!(matches!(result, Err(TransportFailure::Connect(_))));
    }

    #[tokio::test]
    async fn test_invalid_proxy_is_proxy_failure() {
        let mut req = request("http://example.invalid/doc.pdf".to_string());
        req.proxy = Some("not a proxy url".to_string());

        let result = ReqwestFetcher::new().stream_get(req).await;

        assert!(matches!(result, Err(TransportFailure::Proxy(_))));
    }
}

//! HTTP client for the `/engine/v1` endpoints.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::debug;

use super::{ByteStream, Transport};
use crate::config::Config;
use crate::error::{BridgeError, ErrorBody};
use crate::transport::protocol::{
    Action, ActionId, Chunk, PushAck, ReplyStatus, ShellResult, StreamKind, TaskSpec, STREAM_EOF_HEADER,
    STREAM_OFFSET_HEADER,
};

/// Transport talking to the meta-service over HTTP.
///
/// Control requests time out after `request_timeout_seconds`. Uploads are
/// not timed out: an artifact or task log streams for as long as it takes.
pub struct HttpTransport {
    client: Client,
    base: String,
    config: Config,
}

impl HttpTransport {
    /// Client for the meta-service listening at `host` (`host:port`).
    pub fn new(host: &str, config: Config) -> Result<Self, BridgeError> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base: format!("http://{host}/engine/v1"),
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base)
    }

    fn control(&self, request: RequestBuilder) -> RequestBuilder {
        request.timeout(self.config.request_timeout())
    }
}

/// Turn a non-2xx response into the error the host reported.
async fn check(response: Response) -> Result<Response, BridgeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await?;
    if let Ok(error) = serde_json::from_slice::<ErrorBody>(&body) {
        return Err(error.into());
    }
    let message = format!("{status}: {}", String::from_utf8_lossy(&body));
    if status.is_server_error() {
        Err(BridgeError::Remote(message))
    } else {
        Err(BridgeError::Malformed(message))
    }
}

async fn read_chunk(response: Response) -> Result<Chunk, BridgeError> {
    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    };
    let offset = header(STREAM_OFFSET_HEADER)
        .and_then(|value| value.parse::<u64>().ok())
        .ok_or_else(|| BridgeError::Malformed(format!("missing or invalid {STREAM_OFFSET_HEADER} header")))?;
    let eof = header(STREAM_EOF_HEADER).is_some_and(|value| value == "true");
    let data = response.bytes().await?;
    Ok(Chunk { offset, data, eof })
}

#[async_trait]
impl Transport for HttpTransport {
    async fn ping(&self) -> Result<(), BridgeError> {
        let response = self.control(self.client.get(self.url("ping"))).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn poll_action(&self) -> Result<Option<Action>, BridgeError> {
        let response = self.control(self.client.get(self.url("poll"))).send().await?;
        let response = check(response).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let action = response.json::<Action>().await?;
        debug!(action = %action.id(), kind = ?action.kind(), "Received action");
        Ok(Some(action))
    }

    async fn reply(&self, id: ActionId, status: ReplyStatus, body: ByteStream) -> Result<(), BridgeError> {
        let response = self
            .client
            .post(self.url("reply"))
            .query(&[("id", id.to_string())])
            .query(&[("status", status)])
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn pull_stdin(&self, id: ActionId, offset: u64) -> Result<Chunk, BridgeError> {
        let response = self
            .control(self.client.get(self.url(&format!("shell/{id}/stdin"))))
            .query(&[("offset", offset)])
            .send()
            .await?;
        read_chunk(check(response).await?).await
    }

    async fn push_output(
        &self,
        id: ActionId,
        kind: StreamKind,
        offset: u64,
        data: Bytes,
        eof: bool,
    ) -> Result<PushAck, BridgeError> {
        let response = self
            .control(self.client.put(self.url(&format!("shell/{id}/{kind}"))))
            .query(&[("offset", offset)])
            .query(&[("eof", eof)])
            .body(data)
            .send()
            .await?;
        Ok(check(response).await?.json::<PushAck>().await?)
    }

    async fn post_result(&self, id: ActionId, result: &ShellResult) -> Result<(), BridgeError> {
        let response = self
            .control(self.client.put(self.url(&format!("shell/{id}/result"))))
            .json(result)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn fetch_task(&self) -> Result<TaskSpec, BridgeError> {
        let response = self.control(self.client.get(self.url("execute"))).send().await?;
        Ok(check(response).await?.json::<TaskSpec>().await?)
    }

    async fn send_log(&self, body: ByteStream) -> Result<(), BridgeError> {
        let response = self
            .client
            .post(self.url("log"))
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn report_task(&self, success: bool) -> Result<(), BridgeError> {
        let path = if success { "success" } else { "failed" };
        let response = self.control(self.client.put(self.url(path))).send().await?;
        check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::metaservice::{http::router, MetaService};

    async fn serve(meta: Arc<MetaService>) -> HttpTransport {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(meta)).await });
        HttpTransport::new(&addr.to_string(), Config::default()).unwrap()
    }

    fn service() -> Arc<MetaService> {
        let config = Config::from_json(r#"{"poll_timeout_seconds": 1, "request_timeout_seconds": 5}"#).unwrap();
        let task = TaskSpec {
            command: vec!["true".into()],
            ..TaskSpec::default()
        };
        Arc::new(MetaService::new(config, task, Box::new(tokio::io::sink())))
    }

    #[tokio::test]
    async fn poll_timeout_is_none() {
        let transport = serve(service()).await;
        transport.ping().await.unwrap();
        assert!(transport.poll_action().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn host_errors_come_back_typed() {
        let meta = service();
        let transport = serve(Arc::clone(&meta)).await;

        let err = transport.pull_stdin(ActionId::new(), 0).await.unwrap_err();
        assert!(matches!(err, BridgeError::UnknownSession(_)));

        let shell = meta.exec_shell(None, false).await.unwrap();
        let action = transport.poll_action().await.unwrap().unwrap();
        assert_eq!(action.id(), shell.id());

        let err = transport
            .push_output(shell.id(), StreamKind::Stdout, 5, Bytes::from_static(b"gap"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::OffsetOutOfRange { offset: 5, start: 0, end: 0 }));

        meta.stop_pollers();
        assert!(matches!(transport.poll_action().await, Err(BridgeError::Cancelled)));
    }

    #[tokio::test]
    async fn chunks_carry_offsets() {
        let meta = service();
        let transport = serve(Arc::clone(&meta)).await;
        let shell = meta.exec_shell(None, false).await.unwrap();
        transport.poll_action().await.unwrap();

        let ack = transport
            .push_output(shell.id(), StreamKind::Stderr, 0, Bytes::from_static(b"oops"), true)
            .await
            .unwrap();
        assert_eq!(ack, PushAck { accepted: true, end: 4 });

        meta.write_stdin(shell.id(), 0, b"ls\n", false).await.unwrap();
        let chunk = transport.pull_stdin(shell.id(), 0).await.unwrap();
        assert_eq!(chunk.offset, 0);
        assert_eq!(&chunk.data[..], b"ls\n");
        assert!(!chunk.eof);
    }

    #[tokio::test]
    async fn task_surface_round_trip() {
        let meta = service();
        let transport = serve(Arc::clone(&meta)).await;
        assert_eq!(transport.fetch_task().await.unwrap().command, vec!["true".to_string()]);
        transport.report_task(true).await.unwrap();
        assert!(matches!(transport.report_task(false).await, Err(BridgeError::Conflict(_))));
        assert!(meta.task_result().await.unwrap());
    }
}

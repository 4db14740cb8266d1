mod download;

pub use download::DecryptedImage;

use {
    anyhow::{Error, Result},
    bytes::Bytes,
    cadd::ops::Cadd,
    imgvault_protocol::{
        ImageId, ImageMetadata, Passphrase,
        endpoints::{
            ErrorResponse, IMAGES_PATH, ListImagesResponse, MessageResponse, STATUS_PATH,
            ServerStatus, UPLOAD_IMAGE_FIELD, UPLOAD_KEY_FIELD, UPLOAD_PATH, UploadResponse,
            image_path,
        },
    },
    reqwest::{
        Response, StatusCode, Url,
        multipart::{Form, Part},
    },
    serde::de::DeserializeOwned,
    std::{future::Future, time::Duration},
    tokio::time::sleep,
    tracing::{instrument, warn},
};

/// Reuse created client or clone it in order to reuse a connection pool.
#[derive(Debug, Clone)]
pub struct Client {
    reqwest: reqwest::Client,
    server_url: Url,
    retry_period: Duration,
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Encrypting or decrypting a large image happens while the request is open.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

const NUM_RETRIES: usize = 5;

/// Whether a request may be repeated after it might have reached the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    Safe,
    /// Only retried when the connection was never established.
    OnlyIfUnsent,
}
const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Non-success response from the server.
#[derive(Debug, thiserror::Error)]
#[error("server error ({status}): {message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl Client {
    #[inline]
    pub fn new(server_url: Url) -> Result<Self> {
        Ok(Self {
            server_url,
            reqwest: reqwest::Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .build()?,
            retry_period: DEFAULT_RETRY_PERIOD,
        })
    }

    #[must_use]
    #[inline]
    pub fn with_retry_period(mut self, retry_period: Duration) -> Self {
        self.retry_period = retry_period;
        self
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.server_url.join(path)?)
    }

    #[instrument(skip_all, fields(file_name = %file_name, size = content.len()))]
    #[inline]
    pub async fn upload(
        &self,
        file_name: &str,
        mime_type: &str,
        content: Bytes,
        key: &Passphrase,
    ) -> Result<UploadResponse> {
        let url = self.url(UPLOAD_PATH)?;
        let response = self
            .ok_or_retry(|| async {
                // The name travels raw inside a quoted parameter.
                let image = Part::bytes(content.to_vec())
                    .file_name(file_name.replace('"', "_"))
                    .mime_str(mime_type)
                    .map_err(RequestError::application)?;
                let form = Form::new()
                    .percent_encode_noop()
                    .part(UPLOAD_IMAGE_FIELD, image)
                    .text(UPLOAD_KEY_FIELD, key.as_unmasked_str().to_owned());
                let response = self
                    .reqwest
                    .post(url.clone())
                    .timeout(UPLOAD_TIMEOUT)
                    .multipart(form)
                    .send()
                    .await
                    .map_err(|err| send_error(err, Replay::OnlyIfUnsent))?;
                check_status(response, Replay::OnlyIfUnsent).await
            })
            .await?;
        json(response).await
    }

    #[inline]
    pub async fn list(&self) -> Result<Vec<ImageMetadata>> {
        let url = self.url(IMAGES_PATH)?;
        let response = self
            .ok_or_retry(|| async {
                let response = self
                    .reqwest
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|err| send_error(err, Replay::Safe))?;
                check_status(response, Replay::Safe).await
            })
            .await?;
        Ok(json::<ListImagesResponse>(response).await?.images)
    }

    #[instrument(skip(self))]
    #[inline]
    pub async fn delete(&self, id: &ImageId) -> Result<String> {
        let url = self.url(&image_path(id))?;
        let response = self
            .ok_or_retry(|| async {
                let response = self
                    .reqwest
                    .delete(url.clone())
                    .send()
                    .await
                    .map_err(|err| send_error(err, Replay::OnlyIfUnsent))?;
                check_status(response, Replay::OnlyIfUnsent).await
            })
            .await?;
        Ok(json::<MessageResponse>(response).await?.message)
    }

    #[inline]
    pub async fn status(&self) -> Result<ServerStatus> {
        let url = self.url(STATUS_PATH)?;
        let response = self
            .ok_or_retry(|| async {
                let response = self
                    .reqwest
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|err| send_error(err, Replay::Safe))?;
                check_status(response, Replay::Safe).await
            })
            .await?;
        json(response).await
    }

    /// Retries the request while it fails with [`RequestError::Transport`].
    async fn ok_or_retry<T, F, Fut>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        let mut attempt = 0;
        loop {
            attempt = attempt.cadd(1_usize)?;
            let transport_err = match f().await {
                Ok(x) => break Ok(x),
                Err(RequestError::Application(err)) => break Err(err),
                Err(RequestError::Transport(err)) => err,
            };
            if attempt >= NUM_RETRIES {
                break Err(transport_err);
            }
            warn!(error = %transport_err, attempt, "request failed, will retry");
            sleep(self.retry_period).await;
        }
    }
}

fn send_error(err: reqwest::Error, replay: Replay) -> RequestError {
    if replay == Replay::Safe || err.is_connect() {
        RequestError::transport(err)
    } else {
        RequestError::application(err)
    }
}

/// A 503 means the storage timed out, which is retried only for [`Replay::Safe`].
async fn check_status(response: Response, replay: Replay) -> Result<Response, RequestError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_owned(),
    };
    let err = ApiError { status, message };
    if status == StatusCode::SERVICE_UNAVAILABLE && replay == Replay::Safe {
        Err(RequestError::transport(err))
    } else {
        Err(RequestError::application(err))
    }
}

async fn json<T: DeserializeOwned>(response: Response) -> Result<T> {
    Ok(response.json().await?)
}

enum RequestError {
    Transport(Error),
    Application(Error),
}

impl RequestError {
    fn application(err: impl Into<Error>) -> Self {
        Self::Application(err.into())
    }

    fn transport(err: impl Into<Error>) -> Self {
        Self::Transport(err.into())
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing, reason = "test")]
mod tests {
    use {
        super::*,
        std::sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        tokio::{
            io::{AsyncReadExt, AsyncWriteExt},
            net::TcpListener,
        },
    };

    /// Answers every request with 503 and counts the requests.
    async fn unavailable_server() -> (Client, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut buf = [0; 4096];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        let n = stream.read(&mut buf).await.unwrap();
                        if n == 0 {
                            return;
                        }
                        head.extend_from_slice(&buf[..n]);
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    let body = r#"{"error":"Storage is temporarily unavailable"}"#;
                    let response = format!(
                        "HTTP/1.1 503 Service Unavailable\r\n\
                         content-type: application/json\r\n\
                         content-length: {}\r\n\
                         connection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        let client = Client::new(url)
            .unwrap()
            .with_retry_period(Duration::from_millis(10));
        (client, requests)
    }

    #[tokio::test]
    async fn reads_are_retried_while_unavailable() {
        let (client, requests) = unavailable_server().await;
        let err = client.list().await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ApiError>().unwrap().status,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(requests.load(Ordering::SeqCst), NUM_RETRIES);
    }

    #[tokio::test]
    async fn writes_are_sent_once() {
        let (client, requests) = unavailable_server().await;
        let id = ImageId::from_sequence(1);
        let err = client.delete(&id).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ApiError>().unwrap().status,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(requests.load(Ordering::SeqCst), 1);

        client
            .upload("a.png", "image/png", Bytes::from_static(b"png"), &"password123".into())
            .await
            .unwrap_err();
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refused_connection_is_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = reqwest::get(format!("http://{addr}/")).await.unwrap_err();
        assert!(err.is_connect());
        assert!(matches!(
            send_error(err, Replay::OnlyIfUnsent),
            RequestError::Transport(_)
        ));
    }
}

use {
    super::{Client, Replay, UPLOAD_TIMEOUT, check_status, send_error},
    anyhow::Result,
    imgvault_protocol::{
        ImageId, Passphrase,
        endpoints::{DecryptRequest, decrypt_path},
    },
    percent_encoding::percent_decode_str,
    reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, HeaderMap},
    std::{borrow::Cow, fmt},
    tracing::instrument,
    zeroize::Zeroizing,
};

/// Plaintext returned by the server together with the advisory name and type
/// recorded at upload.
pub struct DecryptedImage {
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub content: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for DecryptedImage {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedImage")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.content.len())
            .finish()
    }
}

impl Client {
    /// Asks the server to decrypt an image.
    ///
    /// A wrong key is reported as an [`ApiError`](super::ApiError) with status 400.
    #[instrument(skip(self, key))]
    #[inline]
    pub async fn decrypt(&self, id: &ImageId, key: &Passphrase) -> Result<DecryptedImage> {
        let url = self.url(&decrypt_path(id))?;
        let body = DecryptRequest { key: key.clone() };
        let response = self
            .ok_or_retry(|| async {
                let response = self
                    .reqwest
                    .post(url.clone())
                    .timeout(UPLOAD_TIMEOUT)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|err| send_error(err, Replay::Safe))?;
                check_status(response, Replay::Safe).await
            })
            .await?;
        let headers = response.headers().clone();
        let content = Zeroizing::new(response.bytes().await?.to_vec());
        Ok(DecryptedImage {
            file_name: attachment_file_name(&headers),
            mime_type: headers
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(ToOwned::to_owned),
            content,
        })
    }
}

/// Prefers the RFC 5987 `filename*` parameter, falling back to `filename`.
fn attachment_file_name(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_DISPOSITION)?.to_str().ok()?;
    let mut plain = None;
    for param in value.split(';').map(str::trim) {
        if let Some(encoded) = param.strip_prefix("filename*=UTF-8''") {
            if let Ok(name) = percent_decode_str(encoded).decode_utf8() {
                return Some(Cow::into_owned(name));
            }
        } else if let Some(name) = param.strip_prefix("filename=") {
            plain = Some(name.trim_matches('"').to_owned());
        }
    }
    plain
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use {super::*, reqwest::header::HeaderValue};

    fn headers(disposition: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_str(disposition).unwrap(),
        );
        headers
    }

    #[test]
    fn plain_file_name() {
        assert_eq!(
            attachment_file_name(&headers(r#"attachment; filename="hello.png""#)).as_deref(),
            Some("hello.png")
        );
    }

    #[test]
    fn encoded_file_name_wins() {
        assert_eq!(
            attachment_file_name(&headers(
                r#"attachment; filename="_.png"; filename*=UTF-8''%D1%84.png"#
            ))
            .as_deref(),
            Some("ф.png")
        );
    }

    #[test]
    fn undecodable_file_name_falls_back() {
        assert_eq!(
            attachment_file_name(&headers(
                r#"attachment; filename="_.png"; filename*=UTF-8''%FF.png"#
            ))
            .as_deref(),
            Some("_.png")
        );
    }

    #[test]
    fn missing_header() {
        assert_eq!(attachment_file_name(&HeaderMap::new()), None);
    }
}

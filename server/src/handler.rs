//! HTTP boundary: routing, request parsing and response encoding.

use {
    crate::{
        error::Error,
        workflow::{DEFAULT_MIME_TYPE, ImageService, Upload},
    },
    bytes::Bytes,
    http_body_util::{BodyExt, Full, Limited},
    hyper::{
        Method, Request, Response, StatusCode,
        body::Incoming,
        header::{
            ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
            ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE,
            ALLOW, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE,
            HeaderValue,
        },
    },
    imgvault_protocol::{
        Passphrase,
        endpoints::{
            DECRYPT_PATH, DecryptRequest, ErrorResponse, IMAGES_PATH, ListImagesResponse,
            MessageResponse, STATUS_PATH, ServerStatus, UPLOAD_IMAGE_FIELD, UPLOAD_KEY_FIELD,
            UPLOAD_PATH, UploadResponse,
        },
    },
    multer::{Constraints, Multipart, SizeLimit},
    percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode},
    serde::Serialize,
    std::convert::Infallible,
    tracing::{Instrument, info_span, warn},
    zeroize::Zeroizing,
};

pub type Body = Full<Bytes>;

/// Upper bound for the decrypt request body, which only carries the key.
const MAX_JSON_BODY_SIZE: usize = 16 * 1024;
const MAX_KEY_FIELD_SIZE: u64 = 4096;
const ALLOWED_METHODS: &str = "GET, POST, DELETE, OPTIONS";

#[derive(Debug, Clone)]
pub struct Context {
    pub service: ImageService,
    pub max_upload_size: u64,
    pub allowed_origin: Option<HeaderValue>,
}

pub async fn handle_request(
    ctx: Context,
    request: Request<Incoming>,
) -> Result<Response<Body>, Infallible> {
    let span = info_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
    );
    let mut response = async {
        try_handle_request(&ctx, request)
            .await
            .unwrap_or_else(|err| {
                err.log();
                error_response(err.status_code(), err.to_string())
            })
    }
    .instrument(span)
    .await;
    add_cors_headers(&ctx, &mut response);
    Ok(response)
}

async fn try_handle_request(
    ctx: &Context,
    request: Request<Incoming>,
) -> Result<Response<Body>, Error> {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    if method == Method::OPTIONS {
        return Ok(preflight());
    }

    if path == UPLOAD_PATH {
        if method != Method::POST {
            return Ok(method_not_allowed("POST"));
        }
        upload(ctx, request).await
    } else if path == IMAGES_PATH {
        if method != Method::GET {
            return Ok(method_not_allowed("GET"));
        }
        let images = ctx.service.list().await?;
        Ok(json_response(
            StatusCode::OK,
            &ListImagesResponse { images },
        ))
    } else if path == STATUS_PATH {
        if method != Method::GET {
            return Ok(method_not_allowed("GET"));
        }
        let status = ctx.service.status().await?;
        Ok(json_response(
            StatusCode::OK,
            &ServerStatus {
                image_count: status.image_count,
                available_space: status.available_space,
            },
        ))
    } else if let Some(id) = sub_path(&path, IMAGES_PATH) {
        if method != Method::DELETE {
            return Ok(method_not_allowed("DELETE"));
        }
        ctx.service.delete(id).await?;
        Ok(json_response(
            StatusCode::OK,
            &MessageResponse {
                message: "Image deleted successfully".into(),
            },
        ))
    } else if let Some(id) = sub_path(&path, DECRYPT_PATH) {
        if method != Method::POST {
            return Ok(method_not_allowed("POST"));
        }
        decrypt(ctx, id, request).await
    } else {
        Ok(error_response(StatusCode::NOT_FOUND, "Not found".into()))
    }
}

/// Returns the single segment following `prefix/`.
fn sub_path<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    path.strip_prefix(prefix)?
        .strip_prefix('/')
        .filter(|rest| !rest.contains('/'))
}

async fn upload(ctx: &Context, request: Request<Incoming>) -> Result<Response<Body>, Error> {
    let boundary = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| multer::parse_boundary(value).ok())
        .ok_or_else(|| Error::invalid_input("Expected a multipart/form-data body"))?;
    // Reserving up front keeps the buffer from being reallocated, which would
    // leave unwiped copies of the plaintext behind.
    let expected_size = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0)
        .min(ctx.max_upload_size);

    let constraints = Constraints::new()
        .allowed_fields(vec![UPLOAD_IMAGE_FIELD, UPLOAD_KEY_FIELD])
        .size_limit(
            SizeLimit::new()
                .whole_stream(ctx.max_upload_size)
                .for_field(UPLOAD_KEY_FIELD, MAX_KEY_FIELD_SIZE),
        );
    let mut multipart = Multipart::with_constraints(
        request.into_body().into_data_stream(),
        boundary,
        constraints,
    );

    let mut content = Zeroizing::new(Vec::new());
    content.reserve(usize::try_from(expected_size).unwrap_or(0));
    let mut upload = Upload {
        file_name: None,
        mime_type: None,
        content,
        key: None,
    };
    let mut has_image = false;
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() == Some(UPLOAD_KEY_FIELD) {
            if upload.key.is_some() {
                return Err(Error::invalid_input("Only one encryption key is allowed"));
            }
            let key = field.text().await.map_err(multipart_error)?;
            upload.key = Some(Passphrase::new(key));
        } else if field.name() == Some(UPLOAD_IMAGE_FIELD) {
            if has_image {
                return Err(Error::invalid_input("Only one image file is allowed"));
            }
            has_image = true;
            upload.file_name = field.file_name().map(ToOwned::to_owned);
            upload.mime_type = field.content_type().map(ToString::to_string);
            while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                upload.content.extend_from_slice(&chunk);
            }
        }
    }

    let image = ctx.service.upload(upload).await?;
    Ok(json_response(
        StatusCode::CREATED,
        &UploadResponse {
            message: "Image uploaded and encrypted successfully".into(),
            image,
        },
    ))
}

fn multipart_error(err: multer::Error) -> Error {
    warn!(?err, "failed to parse upload");
    if matches!(
        err,
        multer::Error::StreamSizeExceeded { .. } | multer::Error::FieldSizeExceeded { .. }
    ) {
        Error::invalid_input("File is too large")
    } else {
        Error::invalid_input("Malformed upload body")
    }
}

async fn decrypt(
    ctx: &Context,
    id: &str,
    request: Request<Incoming>,
) -> Result<Response<Body>, Error> {
    let body = Limited::new(request.into_body(), MAX_JSON_BODY_SIZE)
        .collect()
        .await
        .map_err(|err| {
            warn!(?err, "failed to read request body");
            Error::invalid_input("Request body is too large")
        })?
        .to_bytes();
    let DecryptRequest { key } = serde_json::from_slice(&body).map_err(|err| {
        warn!(%err, "invalid decrypt request body");
        Error::invalid_input("Expected a JSON body with a key")
    })?;

    let mut image = ctx.service.decrypt(id, key).await?;
    let content_type = HeaderValue::from_str(&image.metadata.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_MIME_TYPE));
    let content_disposition = HeaderValue::from_str(&content_disposition(
        &image.metadata.original_name,
    ))
    .map_err(|err| Error::Internal(err.into()))?;
    let content = Bytes::from(std::mem::take(&mut *image.content));
    Ok(Response::builder()
        .header(CONTENT_TYPE, content_type)
        .header(CONTENT_DISPOSITION, content_disposition)
        .header(CACHE_CONTROL, "no-store")
        .body(Full::new(content))
        .expect("response builder failed"))
}

/// Everything outside RFC 5987 `attr-char`.
const NON_ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// `attachment` disposition with a plain ASCII `filename` and, when the name
/// has anything else in it, an RFC 5987 `filename*`.
fn content_disposition(name: &str) -> String {
    let ascii: String = name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() || c == ' ') && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if ascii == name {
        format!("attachment; filename=\"{ascii}\"")
    } else {
        let encoded = utf8_percent_encode(name, NON_ATTR_CHAR);
        format!("attachment; filename=\"{ascii}\"; filename*=UTF-8''{encoded}")
    }
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = serde_json::to_vec(value).expect("JSON serialization failed");
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("response builder failed")
}

fn error_response(status: StatusCode, error: String) -> Response<Body> {
    json_response(status, &ErrorResponse { error })
}

fn method_not_allowed(allow: &'static str) -> Response<Body> {
    let mut response = error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        "Method not allowed".into(),
    );
    response
        .headers_mut()
        .insert(ALLOW, HeaderValue::from_static(allow));
    response
}

fn preflight() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(ALLOW, ALLOWED_METHODS)
        .header(ACCESS_CONTROL_ALLOW_METHODS, ALLOWED_METHODS)
        .header(ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type")
        .header(ACCESS_CONTROL_MAX_AGE, "600")
        .body(Full::default())
        .expect("response builder failed")
}

fn add_cors_headers(ctx: &Context, response: &mut Response<Body>) {
    if let Some(origin) = &ctx.allowed_origin {
        let headers = response.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        headers.insert(
            ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static("Content-Disposition"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_disposition() {
        assert_eq!(
            content_disposition("hello.png"),
            r#"attachment; filename="hello.png""#
        );
        assert_eq!(
            content_disposition("my photo.jpg"),
            r#"attachment; filename="my photo.jpg""#
        );
    }

    #[test]
    fn non_ascii_disposition() {
        assert_eq!(
            content_disposition("ф.png"),
            r#"attachment; filename="_.png"; filename*=UTF-8''%D1%84.png"#
        );
        assert_eq!(
            content_disposition(r#"a"b.png"#),
            r#"attachment; filename="a_b.png"; filename*=UTF-8''a%22b.png"#
        );
        assert_eq!(
            content_disposition("ü ~x.png"),
            r#"attachment; filename="_ ~x.png"; filename*=UTF-8''%C3%BC%20~x.png"#
        );
    }

    #[test]
    fn sub_paths() {
        assert_eq!(sub_path("/api/images/abc", IMAGES_PATH), Some("abc"));
        assert_eq!(sub_path("/api/images/", IMAGES_PATH), Some(""));
        assert_eq!(sub_path("/api/images", IMAGES_PATH), None);
        assert_eq!(sub_path("/api/images/a/b", IMAGES_PATH), None);
        assert_eq!(sub_path("/api/imagesabc", IMAGES_PATH), None);
    }
}

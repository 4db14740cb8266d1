use {
    crate::{ImageId, ImageMetadata, Passphrase},
    serde::{Deserialize, Serialize},
};

/// `POST`, multipart body with [`UPLOAD_IMAGE_FIELD`] and [`UPLOAD_KEY_FIELD`].
pub const UPLOAD_PATH: &str = "/api/upload";
/// `GET` lists images, `DELETE {IMAGES_PATH}/{id}` removes one.
pub const IMAGES_PATH: &str = "/api/images";
/// `POST {DECRYPT_PATH}/{id}` with a JSON [`DecryptRequest`] body.
pub const DECRYPT_PATH: &str = "/api/decrypt";
pub const STATUS_PATH: &str = "/api/status";

pub const UPLOAD_IMAGE_FIELD: &str = "image";
pub const UPLOAD_KEY_FIELD: &str = "key";

#[must_use]
#[inline]
pub fn image_path(id: &ImageId) -> String {
    format!("{IMAGES_PATH}/{id}")
}

#[must_use]
#[inline]
pub fn decrypt_path(id: &ImageId) -> String {
    format!("{DECRYPT_PATH}/{id}")
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub message: String,
    pub image: ImageMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListImagesResponse {
    pub images: Vec<ImageMetadata>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DecryptRequest {
    pub key: Passphrase,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Body of every non-2xx JSON response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub image_count: u64,
    pub available_space: u64,
}

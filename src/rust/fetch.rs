//! Image acquisition: download by URL or decode an inline base64 payload.

use std::time::Duration;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use log::debug;

use crate::classifier::ClassifierError;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Padding is optional and stray trailing bits are ignored.
const LENIENT: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_decode_padding_mode(DecodePaddingMode::Indifferent)
    .with_decode_allow_trailing_bits(true);
const LENIENT_STANDARD: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const LENIENT_URL_SAFE: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Timed out after {0:?} fetching image")]
    Timeout(Duration),
    #[error("Image is larger than {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("Upstream responded with status {0}")]
    Status(u16),
    #[error("Invalid image URL: {0}")]
    InvalidUrl(String),
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Downloads images with a bounded wait and a size cap.
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_bytes: usize,
}

impl ImageFetcher {
    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            timeout,
            max_bytes,
        })
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| FetchError::InvalidUrl(format!("{}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl(format!("unsupported scheme '{}'", parsed.scheme())));
        }

        let mut response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        debug!("Image fetch response status: {}", response.status());
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes as u64 {
                return Err(FetchError::PayloadTooLarge { limit: self.max_bytes });
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.classify(e))? {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(FetchError::PayloadTooLarge { limit: self.max_bytes });
            }
            body.extend_from_slice(&chunk);
        }
        debug!("Downloaded {} bytes", body.len());
        Ok(body)
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Request(err)
        }
    }
}

/// Removes a leading `data:image/<type>;base64,` prefix when present.
pub fn strip_data_url_prefix(data: &str) -> &str {
    let Some(rest) = data.strip_prefix("data:image/") else {
        return data;
    };
    let Some((subtype, payload)) = rest.split_once(";base64,") else {
        return data;
    };
    if !subtype.is_empty() && subtype.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        payload
    } else {
        data
    }
}

/// Decodes an inline base64 image, with or without a data-URL prefix.
///
/// Accepts the standard and URL-safe alphabets, padded or not.
pub fn decode_base64_image(data: &str, max_bytes: usize) -> Result<Vec<u8>, ClassifierError> {
    let payload = strip_data_url_prefix(data.trim());
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.len() / 4 * 3 > max_bytes {
        return Err(FetchError::PayloadTooLarge { limit: max_bytes }.into());
    }
    LENIENT_STANDARD
        .decode(compact.as_bytes())
        .or_else(|e| LENIENT_URL_SAFE.decode(compact.as_bytes()).map_err(|_| e))
        .map_err(|e| ClassifierError::ImageDecodeError(format!("Invalid base64 image data: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE_NO_PAD};

    #[test]
    fn test_strip_data_url_prefix() {
        assert_eq!(strip_data_url_prefix("data:image/png;base64,AAAA"), "AAAA");
        assert_eq!(strip_data_url_prefix("data:image/jpeg;base64,/9j/"), "/9j/");
        assert_eq!(strip_data_url_prefix("AAAA"), "AAAA");
        // Only image subtypes made of word characters are stripped.
        assert_eq!(
            strip_data_url_prefix("data:image/svg+xml;base64,AAAA"),
            "data:image/svg+xml;base64,AAAA"
        );
        assert_eq!(
            strip_data_url_prefix("data:text/plain;base64,AAAA"),
            "data:text/plain;base64,AAAA"
        );
    }

    #[test]
    fn test_decode_base64_image() {
        let encoded = STANDARD.encode(b"\x89PNG fake");
        assert_eq!(decode_base64_image(&encoded, 1024).unwrap(), b"\x89PNG fake");

        let with_prefix = format!("data:image/png;base64,{}", encoded);
        assert_eq!(decode_base64_image(&with_prefix, 1024).unwrap(), b"\x89PNG fake");
    }

    #[test]
    fn test_decode_unpadded_and_url_safe() {
        let bytes = [0xfb, 0xff, 0xfe, 0x01];
        let unpadded = STANDARD_NO_PAD.encode(bytes);
        assert!(!unpadded.ends_with('='));
        assert_eq!(decode_base64_image(&unpadded, 1024).unwrap(), bytes);

        let url_safe = URL_SAFE_NO_PAD.encode(bytes);
        assert!(url_safe.contains('-') || url_safe.contains('_'));
        assert_eq!(decode_base64_image(&url_safe, 1024).unwrap(), bytes);

        let with_prefix = format!("data:image/jpeg;base64,{}", url_safe);
        assert_eq!(decode_base64_image(&with_prefix, 1024).unwrap(), bytes);
    }

    #[test]
    fn test_invalid_base64_is_decode_error() {
        assert!(matches!(
            decode_base64_image("data:image/png;base64,@@@@", 1024),
            Err(ClassifierError::ImageDecodeError(_))
        ));
    }

    #[test]
    fn test_oversized_base64_is_fetch_error() {
        let encoded = STANDARD.encode(vec![0u8; 4096]);
        assert!(matches!(
            decode_base64_image(&encoded, 1024),
            Err(ClassifierError::ImageFetchError(FetchError::PayloadTooLarge { limit: 1024 }))
        ));
    }

    #[tokio::test]
    async fn test_rejects_non_http_urls() {
        let fetcher = ImageFetcher::new(DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_IMAGE_BYTES).unwrap();
        assert!(matches!(fetcher.fetch("not a url").await, Err(FetchError::InvalidUrl(_))));
        assert!(matches!(
            fetcher.fetch("file:///etc/passwd").await,
            Err(FetchError::InvalidUrl(_))
        ));
    }
}

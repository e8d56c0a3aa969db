#![allow(dead_code)]

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::CONTENT_TYPE;
use axum::routing::get;
use axum::Router;
use bg_classifier::classifier::{DEFAULT_KEEP_LABEL, DEFAULT_REMOVE_LABEL};
use bg_classifier::{
    BackgroundClassifier, ClassifierError, InferenceBackend, LabelMetadata, ModelStore,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::ArrayView4;
use tokio::net::TcpListener;

/// Brighter images lean towards removing the background.
pub struct BrightnessBackend;

impl InferenceBackend for BrightnessBackend {
    fn forward(&self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, ClassifierError> {
        let mean = input.mean().unwrap_or(0.0);
        Ok(vec![mean, 1.0 - mean])
    }
}

pub fn ready_classifier() -> Arc<BackgroundClassifier> {
    let store = Arc::new(ModelStore::new());
    store
        .install(
            Box::new(BrightnessBackend),
            LabelMetadata::from_labels(vec![DEFAULT_REMOVE_LABEL, DEFAULT_KEEP_LABEL]),
            &[DEFAULT_REMOVE_LABEL, DEFAULT_KEEP_LABEL],
        )
        .unwrap();
    Arc::new(BackgroundClassifier::builder().with_store(store).build().unwrap())
}

pub fn png(color: [u8; 3]) -> Vec<u8> {
    png_sized(64, 64, color)
}

pub fn png_sized(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    encode_png(RgbImage::from_pixel(width, height, Rgb(color)))
}

pub fn encode_png(image: RgbImage) -> Vec<u8> {
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut bytes, ImageFormat::Png)
        .unwrap();
    bytes.into_inner()
}

/// Serves fixtures for the URL fetch path.
pub fn image_server() -> Router {
    Router::new()
        .route(
            "/white.png",
            get(|| async { ([(CONTENT_TYPE, "image/png")], png([255, 255, 255])) }),
        )
        .route("/black.png", get(|| async { ([(CONTENT_TYPE, "image/png")], png([0, 0, 0])) }))
        .route("/large.bin", get(|| async { vec![7u8; 64 * 1024] }))
        .route("/page.html", get(|| async { "<html>not an image</html>" }))
        .route(
            "/slow.png",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                png([0, 0, 0])
            }),
        )
}

pub async fn spawn_app(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

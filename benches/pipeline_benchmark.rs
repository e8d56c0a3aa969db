use std::io::Cursor;

use bg_classifier::{DecisionPolicy, Preprocessor, TensorMemory};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

fn encode(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let image =
        RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 90]));
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image).write_to(&mut bytes, format).unwrap();
    bytes.into_inner()
}

fn bench_preprocess(c: &mut Criterion) {
    let preprocessor = Preprocessor::new(TensorMemory::new(4));
    let mut group = c.benchmark_group("Preprocess");

    // Configure sampling
    group.sample_size(30);
    group.warm_up_time(std::time::Duration::from_secs(1));

    let exact = encode(224, 224, ImageFormat::Png);
    group.bench_function("png_224", |b| b.iter(|| {
        preprocessor.preprocess(black_box(&exact)).unwrap()
    }));

    let photo = encode(1280, 960, ImageFormat::Jpeg);
    group.bench_function("jpeg_1280x960", |b| b.iter(|| {
        preprocessor.preprocess(black_box(&photo)).unwrap()
    }));

    group.finish();
}

fn bench_decision(c: &mut Criterion) {
    c.bench_function("decide_scores", |b| b.iter(|| {
        DecisionPolicy::decide_scores(black_box(0.41), black_box(0.59))
    }));
}

criterion_group!(benches, bench_preprocess, bench_decision);
criterion_main!(benches);

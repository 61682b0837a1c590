use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use style_transfer as st;

/// Five 3x3 convolutions with small channel counts, vgg-shaped, so the
/// end-to-end scenarios stay cheap while still exercising the default layer
/// selection (`conv_1` through `conv_5`).
fn test_backbone(seed: u64) -> st::Backbone {
    let mut rng = rand_pcg::Pcg32::seed_from_u64(seed);
    let mut conv = |in_c: usize, out_c: usize| {
        let bound = (6.0 / (in_c as f32 * 9.0)).sqrt();
        st::LayerOp::Conv2d {
            in_channels: in_c,
            out_channels: out_c,
            kernel: 3,
            stride: 1,
            padding: 1,
            weight: (0..out_c * in_c * 9)
                .map(|_| rng.gen_range(-bound..bound))
                .collect(),
            bias: vec![0.0; out_c],
        }
    };

    st::Backbone::from_layers(vec![
        conv(3, 4),
        st::LayerOp::ReLU,
        conv(4, 4),
        st::LayerOp::ReLU,
        st::LayerOp::MaxPool2d {
            kernel: 2,
            stride: 2,
        },
        conv(4, 8),
        st::LayerOp::ReLU,
        conv(8, 8),
        st::LayerOp::ReLU,
        st::LayerOp::MaxPool2d {
            kernel: 2,
            stride: 2,
        },
        conv(8, 8),
        st::LayerOp::ReLU,
    ])
    .unwrap()
}

fn solid_color(size: u32, rgb: [u8; 3]) -> st::image::DynamicImage {
    let mut img = st::image::RgbImage::new(size, size);
    for pixel in img.pixels_mut() {
        *pixel = st::image::Rgb(rgb);
    }
    st::image::DynamicImage::ImageRgb8(img)
}

fn noise_tensor(seed: f32, size: usize) -> st::Tensor {
    let data = (0..3 * size * size)
        .map(|v| (v as f32 * 0.13 + seed).sin() * 0.5 + 0.5)
        .collect();
    st::Tensor::from_vec([1, 3, size, size], data).unwrap()
}

#[test]
fn red_content_blue_style_produces_a_changed_image() {
    let backbone = Arc::new(test_backbone(1));

    let stylized = st::Session::builder()
        .backbone(backbone)
        .content_image(solid_color(128, [255, 0, 0]))
        .style_image(solid_color(128, [0, 0, 255]))
        .image_size(128)
        .num_steps(10)
        .build()
        .unwrap()
        .run(None)
        .unwrap();

    // content-shaped output
    assert_eq!(stylized.as_tensor().shape(), [1, 3, 128, 128]);
    assert!(stylized
        .as_tensor()
        .data()
        .iter()
        .all(|v| (0.0..=1.0).contains(v)));

    // the style term moved the canvas off the solid red content image
    let red = st::Tensor::from_vec(
        [1, 3, 128, 128],
        (0..3 * 128 * 128)
            .map(|i| if i < 128 * 128 { 1.0 } else { 0.0 })
            .collect(),
    )
    .unwrap();
    let moved = stylized
        .as_tensor()
        .data()
        .iter()
        .zip(red.data())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    assert!(moved > 1e-3, "canvas barely moved: {}", moved);

    let img = stylized.into_image().to_rgb8();
    assert_eq!(img.dimensions(), (128, 128));
}

#[test]
fn identical_style_and_content_keep_the_style_score_small() {
    let backbone = Arc::new(test_backbone(2));
    let same = solid_color(64, [40, 120, 200]);

    let scores = Arc::new(Mutex::new(Vec::new()));
    let sink = scores.clone();
    let progress: Box<dyn st::TransferProgress> =
        Box::new(move |info: st::session::ProgressUpdate| {
            sink.lock().unwrap().push(info.style_score);
        });

    st::Session::builder()
        .backbone(backbone)
        .content_image(same.clone())
        .style_image(same)
        .image_size(64)
        .num_steps(10)
        .max_thread_count(1)
        .build()
        .unwrap()
        .run(Some(progress))
        .unwrap();

    let scores = scores.lock().unwrap();
    assert_eq!(scores.len(), 11);
    // style statistics already match, so the score starts and stays tiny
    let initial = scores[0].max(1e-12);
    assert!(
        scores[scores.len() - 1] <= initial * 1.01,
        "style score grew: {:?}",
        &scores[..]
    );
    assert!(scores.iter().all(|s| *s < 1e-6));
}

#[test]
fn unmatched_content_layer_scores_exactly_zero_throughout() {
    let backbone = test_backbone(3);
    let style = noise_tensor(1.0, 16);
    let content = noise_tensor(0.0, 16);

    let mut pipeline = st::assemble(
        &backbone,
        &style,
        &content,
        &["conv_99"],
        st::DEFAULT_STYLE_LAYERS,
        1,
    )
    .unwrap();
    assert_eq!(pipeline.content_probe_count(), 0);
    assert_eq!(pipeline.style_probe_count(), 5);

    let scores = Arc::new(Mutex::new(Vec::new()));
    let sink = scores.clone();
    let progress: Box<dyn st::TransferProgress> =
        Box::new(move |info: st::session::ProgressUpdate| {
            sink.lock().unwrap().push(info.content_score);
        });

    st::optimize(&mut pipeline, content, 5, 1e4, 1.0, Some(progress)).unwrap();

    let scores = scores.lock().unwrap();
    assert_eq!(scores.len(), 6);
    assert!(scores.iter().all(|s| *s == 0.0));
}

#[test]
fn unrecognized_layer_is_reported_before_any_assembly() {
    let err = st::Backbone::from_layers(vec![
        st::LayerOp::ReLU,
        st::LayerOp::Dropout,
    ])
    .unwrap_err();

    match err {
        st::Error::UnrecognizedLayer(_) => {}
        other => panic!("expected UnrecognizedLayer, got {}", other),
    }
}

#[test]
fn stylize_writes_an_output_file() {
    let dir = std::env::temp_dir().join("style-transfer-e2e");
    std::fs::create_dir_all(&dir).unwrap();
    let style_path = dir.join("style.png");
    let content_path = dir.join("content.png");
    let output_path = dir.join("out.png");

    solid_color(32, [0, 255, 0]).save(&style_path).unwrap();
    solid_color(32, [128, 64, 32]).save(&content_path).unwrap();

    // default parameters resize to 128 and run 300 steps, which is far too
    // slow for a test, so drive the session directly
    let backbone = Arc::new(test_backbone(4));
    let stylized = st::Session::builder()
        .backbone(backbone)
        .style_image(&style_path)
        .content_image(&content_path)
        .image_size(32)
        .num_steps(2)
        .max_thread_count(1)
        .build()
        .unwrap()
        .run(None)
        .unwrap();
    stylized.save(&output_path).unwrap();

    let out = st::image::open(&output_path).unwrap();
    use st::image::GenericImageView;
    assert_eq!(out.dimensions(), (32, 32));
}

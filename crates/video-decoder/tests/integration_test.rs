/// Integration tests for the video decoder
use image::{Rgb, RgbImage};
use race_vision_decoder::{decode_jpeg, encode_jpeg, FfmpegBackend, VideoBackend, DEFAULT_JPEG_QUALITY};
use std::path::PathBuf;

/// Race clip used by the manual decode tests, e.g. a 60 fps HKJC recording
fn sample_video() -> Option<PathBuf> {
    std::env::var_os("RACE_VISION_SAMPLE_VIDEO").map(PathBuf::from)
}

#[test]
fn test_open_rejects_non_video_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("0042.mp4");
    std::fs::write(&path, b"this is not an mp4 container").unwrap();
    assert!(FfmpegBackend.open(&path).is_err());
}

#[test]
fn test_canonical_frame_round_trip() {
    let mut frame = RgbImage::from_pixel(1920, 1080, Rgb([30, 140, 60]));
    for x in 0..1920 {
        frame.put_pixel(x, 540, Rgb([250, 250, 250]));
    }
    let bytes = encode_jpeg(&frame, DEFAULT_JPEG_QUALITY).unwrap();
    // A full HD frame must compress well below its raw size to keep races in memory
    assert!(bytes.len() * 10 < frame.as_raw().len());

    let decoded = decode_jpeg(&bytes).unwrap();
    assert_eq!(decoded.dimensions(), (1920, 1080));
    assert!(decoded.get_pixel(960, 540)[0] > 200);
}

#[test]
#[ignore] // Requires RACE_VISION_SAMPLE_VIDEO
fn test_decode_sample_video() {
    let Some(path) = sample_video() else {
        return;
    };
    let mut stream = FfmpegBackend.open(&path).expect("Failed to open sample video");
    let fps = stream.frame_rate().round() as u32;
    assert!([25, 30, 50, 60].contains(&fps), "unexpected frame rate {fps}");

    let mut grabbed = 0;
    while grabbed < 10 && stream.grab().unwrap() {
        grabbed += 1;
    }
    assert_eq!(grabbed, 10);

    let frame = stream.retrieve(1920, 1080).unwrap();
    assert_eq!(frame.dimensions(), (1920, 1080));
    let small = stream.retrieve(480, 270).unwrap();
    assert_eq!(small.dimensions(), (480, 270));
}

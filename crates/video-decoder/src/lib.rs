/// Video decoding for the race pipeline
///
/// Frames are pulled one at a time in the OpenCV grab/retrieve style: `grab` advances
/// the decode cursor without pixel conversion, `retrieve` scales the last grabbed frame
/// to the requested geometry. This keeps skipped frames cheap.
///
/// The [`VideoBackend`] trait is the seam the frame buffer manager depends on; the
/// production implementation is [`FfmpegBackend`].
pub mod jpeg;

use ffmpeg_next as ffmpeg;
use image::RgbImage;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;
use race_vision_common::{ProcessingError, Result};

pub use jpeg::{decode_jpeg, encode_jpeg, DEFAULT_JPEG_QUALITY};

/// An opened video positioned before its first frame
pub trait DecodedStream {
    /// Raw container frame rate (frames per second)
    fn frame_rate(&self) -> f64;

    /// Decode the next frame without converting it.
    ///
    /// Returns `false` once the stream is exhausted.
    fn grab(&mut self) -> Result<bool>;

    /// Convert the last grabbed frame to RGB at `width` x `height`
    fn retrieve(&mut self, width: u32, height: u32) -> Result<RgbImage>;
}

/// Opens video files for decoding
pub trait VideoBackend {
    fn open(&self, path: &Path) -> Result<Box<dyn DecodedStream>>;
}

/// Initialize `FFmpeg` library
fn init_ffmpeg() -> Result<()> {
    static INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();
    INIT.get_or_init(|| ffmpeg::init().map_err(|e| e.to_string()))
        .clone()
        .map_err(|e| ProcessingError::FFmpegError(format!("Failed to initialize FFmpeg: {e}")))
}

/// Software decoder backed by libavcodec
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegBackend;

impl VideoBackend for FfmpegBackend {
    fn open(&self, path: &Path) -> Result<Box<dyn DecodedStream>> {
        Ok(Box::new(FfmpegStream::open(path)?))
    }
}

struct FfmpegStream {
    input: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    stream_index: usize,
    frame_rate: f64,
    decoded: ffmpeg::util::frame::video::Video,
    scaler: Option<Scaler>,
    eof_sent: bool,
}

/// Scaler cached for one output geometry
struct Scaler {
    width: u32,
    height: u32,
    context: ffmpeg::software::scaling::Context,
}

impl FfmpegStream {
    fn open(path: &Path) -> Result<Self> {
        init_ffmpeg()?;

        // Open input file
        let input = ffmpeg::format::input(&path)
            .map_err(|e| ProcessingError::FFmpegError(format!("Failed to open input file: {e}")))?;

        // Find video stream
        let video_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| ProcessingError::FFmpegError("No video stream found".to_string()))?;

        let stream_index = video_stream.index();
        let frame_rate = rational_to_fps(video_stream.avg_frame_rate())
            .or_else(|| rational_to_fps(video_stream.rate()))
            .unwrap_or(0.0);

        let decoder = ffmpeg::codec::context::Context::from_parameters(video_stream.parameters())
            .map_err(|e| ProcessingError::FFmpegError(format!("Failed to create context: {e}")))?
            .decoder()
            .video()
            .map_err(|e| ProcessingError::FFmpegError(format!("Failed to create decoder: {e}")))?;

        debug!(
            "Opened {} ({}x{}, {:.3} fps)",
            path.display(),
            decoder.width(),
            decoder.height(),
            frame_rate
        );

        Ok(Self {
            input,
            decoder,
            stream_index,
            frame_rate,
            decoded: ffmpeg::util::frame::video::Video::empty(),
            scaler: None,
            eof_sent: false,
        })
    }

    fn ensure_scaler(&mut self, width: u32, height: u32) -> Result<()> {
        let stale = self
            .scaler
            .as_ref()
            .is_none_or(|s| s.width != width || s.height != height);
        if stale {
            let context = ffmpeg::software::scaling::Context::get(
                self.decoded.format(),
                self.decoded.width(),
                self.decoded.height(),
                ffmpeg::format::Pixel::RGB24,
                width,
                height,
                ffmpeg::software::scaling::Flags::BILINEAR,
            )
            .map_err(|e| ProcessingError::FFmpegError(format!("Failed to create scaler: {e}")))?;
            self.scaler = Some(Scaler {
                width,
                height,
                context,
            });
        }
        Ok(())
    }
}

impl DecodedStream for FfmpegStream {
    fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    fn grab(&mut self) -> Result<bool> {
        loop {
            if self.decoder.receive_frame(&mut self.decoded).is_ok() {
                return Ok(true);
            }
            if self.eof_sent {
                return Ok(false);
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    // Corrupt packets are skipped, the decoder resyncs on the next one
                    if let Err(e) = self.decoder.send_packet(&packet) {
                        debug!("Dropping undecodable packet: {}", e);
                    }
                }
                Err(ffmpeg::Error::Eof) => {
                    // Flush decoder
                    self.decoder.send_eof().ok();
                    self.eof_sent = true;
                }
                Err(e) => {
                    return Err(ProcessingError::FFmpegError(format!(
                        "Failed to read packet: {e}"
                    )));
                }
            }
        }
    }

    fn retrieve(&mut self, width: u32, height: u32) -> Result<RgbImage> {
        self.ensure_scaler(width, height)?;
        let scaler = self
            .scaler
            .as_mut()
            .ok_or_else(|| ProcessingError::FFmpegError("Scaler unavailable".to_string()))?;

        let mut converted = ffmpeg::util::frame::video::Video::empty();
        scaler
            .context
            .run(&self.decoded, &mut converted)
            .map_err(|e| ProcessingError::FFmpegError(format!("Failed to convert frame: {e}")))?;

        let data = copy_rgb_rows(
            converted.data(0),
            converted.stride(0),
            width as usize,
            height as usize,
        );
        RgbImage::from_raw(width, height, data).ok_or_else(|| {
            ProcessingError::FFmpegError(format!("Converted frame is not {width}x{height}"))
        })
    }
}

fn rational_to_fps(rate: ffmpeg::Rational) -> Option<f64> {
    if rate.numerator() <= 0 || rate.denominator() <= 0 {
        return None;
    }
    Some(f64::from(rate.numerator()) / f64::from(rate.denominator()))
}

/// Copy an RGB24 plane into a contiguous buffer, dropping row padding
fn copy_rgb_rows(plane: &[u8], stride: usize, width: usize, height: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let row_start = y * stride;
        let row_end = row_start + (width * 3);
        data.extend_from_slice(&plane[row_start..row_end]);
    }
    data
}

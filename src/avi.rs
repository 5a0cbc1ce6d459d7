//! Motion-JPEG AVI video sink.
//!
//! Each distorted frame is JPEG-encoded and appended as a `00dc` chunk in a
//! RIFF/AVI container with an `idx1` index, the same MJPG-in-AVI layout the
//! tool has always produced. Frame count and size fields are unknown until
//! the end of the recording, so the header is written with placeholders and
//! patched in `finalize`.

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;

use crate::camera::Frame;

/// JPEG quality for encoded frames.
const JPEG_QUALITY: u8 = 85;

/// AVIF_HASINDEX: the file carries an idx1 chunk.
const AVIF_HASINDEX: u32 = 0x0000_0010;
/// AVIIF_KEYFRAME: every MJPEG frame is independently decodable.
const AVIIF_KEYFRAME: u32 = 0x0000_0010;

fn put_fourcc<W: Write>(w: &mut W, code: &[u8; 4]) -> io::Result<()> {
    w.write_all(code)
}

fn put_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn put_u16<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

/// An open AVI file accepting frames of a fixed size.
#[derive(Debug)]
pub struct AviWriter {
    file: BufWriter<File>,
    path: PathBuf,
    width: u32,
    height: u32,
    frames: u32,
    /// (offset within movi payload, chunk data length) per frame, for idx1.
    index: Vec<(u32, u32)>,
    /// Bytes of movi payload written so far, excluding the 'movi' fourcc.
    movi_bytes: u32,
    max_chunk: u32,
    // Placeholder positions patched in finalize.
    pos_riff_size: u64,
    pos_total_frames: u64,
    pos_suggested_avih: u64,
    pos_stream_length: u64,
    pos_suggested_strh: u64,
    pos_movi_size: u64,
    finalized: bool,
}

impl AviWriter {
    /// Create the file and write the fixed header.
    ///
    /// # Errors
    /// Propagates I/O errors from file creation or the header write.
    pub fn create(path: &Path, fps: u32, width: u32, height: u32) -> io::Result<Self> {
        let fps = fps.max(1);
        let mut file = BufWriter::new(File::create(path)?);

        // RIFF header
        put_fourcc(&mut file, b"RIFF")?;
        let pos_riff_size = file.stream_position()?;
        put_u32(&mut file, 0)?;
        put_fourcc(&mut file, b"AVI ")?;

        // hdrl list: avih + one video stream. All sizes below are fixed:
        // 'hdrl' + (8+56) avih + (8 + 'strl' + (8+56) strh + (8+40) strf).
        put_fourcc(&mut file, b"LIST")?;
        put_u32(&mut file, 4 + (8 + 56) + (8 + 4 + (8 + 56) + (8 + 40)))?;
        put_fourcc(&mut file, b"hdrl")?;

        // avih: MainAVIHeader
        put_fourcc(&mut file, b"avih")?;
        put_u32(&mut file, 56)?;
        put_u32(&mut file, 1_000_000 / fps)?; // microseconds per frame
        put_u32(&mut file, width * height * 3 * fps)?; // max bytes/sec (upper bound)
        put_u32(&mut file, 0)?; // padding granularity
        put_u32(&mut file, AVIF_HASINDEX)?;
        let pos_total_frames = file.stream_position()?;
        put_u32(&mut file, 0)?; // total frames (patched)
        put_u32(&mut file, 0)?; // initial frames
        put_u32(&mut file, 1)?; // stream count
        let pos_suggested_avih = file.stream_position()?;
        put_u32(&mut file, 0)?; // suggested buffer size (patched)
        put_u32(&mut file, width)?;
        put_u32(&mut file, height)?;
        for _ in 0..4 {
            put_u32(&mut file, 0)?; // reserved
        }

        // strl list: strh + strf
        put_fourcc(&mut file, b"LIST")?;
        put_u32(&mut file, 4 + (8 + 56) + (8 + 40))?;
        put_fourcc(&mut file, b"strl")?;

        // strh: AVIStreamHeader
        put_fourcc(&mut file, b"strh")?;
        put_u32(&mut file, 56)?;
        put_fourcc(&mut file, b"vids")?;
        put_fourcc(&mut file, b"MJPG")?;
        put_u32(&mut file, 0)?; // flags
        put_u16(&mut file, 0)?; // priority
        put_u16(&mut file, 0)?; // language
        put_u32(&mut file, 0)?; // initial frames
        put_u32(&mut file, 1)?; // scale
        put_u32(&mut file, fps)?; // rate; rate/scale = fps
        put_u32(&mut file, 0)?; // start
        let pos_stream_length = file.stream_position()?;
        put_u32(&mut file, 0)?; // length in frames (patched)
        let pos_suggested_strh = file.stream_position()?;
        put_u32(&mut file, 0)?; // suggested buffer size (patched)
        put_u32(&mut file, u32::MAX)?; // quality: default
        put_u32(&mut file, 0)?; // sample size: varies per frame
        put_u16(&mut file, 0)?; // rcFrame
        put_u16(&mut file, 0)?;
        put_u16(&mut file, width as u16)?;
        put_u16(&mut file, height as u16)?;

        // strf: BITMAPINFOHEADER
        put_fourcc(&mut file, b"strf")?;
        put_u32(&mut file, 40)?;
        put_u32(&mut file, 40)?; // biSize
        put_u32(&mut file, width)?;
        put_u32(&mut file, height)?;
        put_u16(&mut file, 1)?; // planes
        put_u16(&mut file, 24)?; // bits per pixel
        put_fourcc(&mut file, b"MJPG")?; // compression
        put_u32(&mut file, width * height * 3)?; // image size
        put_u32(&mut file, 0)?; // x pixels per meter
        put_u32(&mut file, 0)?; // y pixels per meter
        put_u32(&mut file, 0)?; // colors used
        put_u32(&mut file, 0)?; // colors important

        // movi list: frame chunks follow
        put_fourcc(&mut file, b"LIST")?;
        let pos_movi_size = file.stream_position()?;
        put_u32(&mut file, 0)?; // patched
        put_fourcc(&mut file, b"movi")?;

        Ok(AviWriter {
            file,
            path: path.to_path_buf(),
            width,
            height,
            frames: 0,
            index: Vec::new(),
            movi_bytes: 0,
            max_chunk: 0,
            pos_riff_size,
            pos_total_frames,
            pos_suggested_avih,
            pos_stream_length,
            pos_suggested_strh,
            pos_movi_size,
            finalized: false,
        })
    }

    /// The file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frames written so far.
    pub fn frames_written(&self) -> u32 {
        self.frames
    }

    /// JPEG-encode one frame and append it as a `00dc` chunk.
    ///
    /// # Errors
    /// Fails if the frame does not match the sink's dimensions, on JPEG
    /// encoding failure, or on I/O error.
    pub fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        if frame.width != self.width || frame.height != self.height {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame is {}x{}, sink expects {}x{}",
                    frame.width, frame.height, self.width, self.height
                ),
            ));
        }

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
            .encode(&frame.data, frame.width, frame.height, image::ColorType::Rgb8)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        // Chunk offsets in idx1 are relative to the 'movi' fourcc.
        let offset = 4 + self.movi_bytes;
        let len = jpeg.len() as u32;

        put_fourcc(&mut self.file, b"00dc")?;
        put_u32(&mut self.file, len)?;
        self.file.write_all(&jpeg)?;
        let mut written = 8 + len;
        if len % 2 == 1 {
            self.file.write_all(&[0])?; // RIFF chunks are word-aligned
            written += 1;
        }

        self.movi_bytes += written;
        self.max_chunk = self.max_chunk.max(len);
        self.index.push((offset, len));
        self.frames += 1;
        Ok(())
    }

    /// Write the index, patch the header placeholders, and flush.
    ///
    /// # Errors
    /// Propagates I/O errors; the file may be unplayable if this fails.
    pub fn finalize(mut self) -> io::Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> io::Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        // idx1
        put_fourcc(&mut self.file, b"idx1")?;
        put_u32(&mut self.file, self.index.len() as u32 * 16)?;
        for &(offset, len) in &self.index {
            put_fourcc(&mut self.file, b"00dc")?;
            put_u32(&mut self.file, AVIIF_KEYFRAME)?;
            put_u32(&mut self.file, offset)?;
            put_u32(&mut self.file, len)?;
        }

        let total = self.file.stream_position()?;
        let patches = [
            (self.pos_riff_size, total as u32 - 8),
            (self.pos_total_frames, self.frames),
            (self.pos_suggested_avih, self.max_chunk),
            (self.pos_stream_length, self.frames),
            (self.pos_suggested_strh, self.max_chunk),
            (self.pos_movi_size, 4 + self.movi_bytes),
        ];
        for (pos, value) in patches {
            self.file.seek(SeekFrom::Start(pos))?;
            put_u32(&mut self.file, value)?;
        }
        self.file.seek(SeekFrom::Start(total))?;
        self.file.flush()
    }
}

impl Drop for AviWriter {
    fn drop(&mut self) {
        if !self.finalized {
            if let Err(e) = self.finish() {
                log::error!("failed to finalize {}: {}", self.path.display(), e);
            }
        }
    }
}

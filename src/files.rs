//! Audio file sources and sinks for the file tee.
//!
//! The tee is orthogonal to the streaming engine: capture and generate files
//! record the mono blocks crossing the modem-facing API, and a playback file
//! can replace the capture device entirely (looping at EOF), which is how
//! recorded sessions are replayed offline.
//!
//! Formats are chosen by filename suffix: `.wav` → WAV/PCM16, `.au`/`.snd`
//! → AU with 32-bit float samples, `.flac` → FLAC/PCM16 where supported.
//! No FLAC encoder is wired in, so FLAC currently reports unsupported.
//! Tee files are always mono at the modem rate.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::SoundError;

/// Number of channels written to and expected from tee files.
const FILE_CHANNELS: u16 = 1;

/// Magic number opening an AU file header.
const AU_MAGIC: u32 = 0x2e73_6e64; // ".snd"

/// AU encoding id for 32-bit IEEE float samples.
const AU_ENCODING_FLOAT32: u32 = 6;

/// On-disk format of a tee file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// RIFF/WAVE with 16-bit PCM samples.
    WavPcm16,
    /// AU header with 32-bit float samples in CPU byte order.
    AuFloat,
    /// FLAC with 16-bit PCM samples.
    FlacPcm16,
}

impl FileFormat {
    /// Picks the format for a path by its suffix. Unknown suffixes fall
    /// back to WAV/PCM16.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("flac") => Self::FlacPcm16,
            Some("au") | Some("snd") => Self::AuFloat,
            _ => Self::WavPcm16,
        }
    }

    /// Whether this build can read and write the format.
    pub fn supported(self) -> bool {
        !matches!(self, Self::FlacPcm16)
    }
}

/// Metadata stamped onto capture and generate files.
#[derive(Debug, Clone)]
pub struct FileTags {
    /// Recording title.
    pub title: String,
    /// Operator identification (station call sign).
    pub artist: String,
    /// Producing software name and version.
    pub software: String,
    /// Free-form comment (modem mode, audio frequency).
    pub comment: String,
    /// UTC timestamp string, if the caller supplies one.
    pub date: String,
}

impl Default for FileTags {
    fn default() -> Self {
        Self {
            title: String::new(),
            artist: String::new(),
            software: concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"))
                .to_string(),
            comment: String::new(),
            date: String::new(),
        }
    }
}

fn clamp_i16(sample: f64) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Writer for a mono tee file.
pub struct FileWriter {
    path: PathBuf,
    inner: WriterImpl,
    frames_written: u64,
    finalized: bool,
    /// Tags held until finalize; WAV metadata lives in a LIST chunk written
    /// after the data chunk.
    pending_tags: Option<FileTags>,
}

enum WriterImpl {
    Wav(BufWriter<File>),
    Au(BufWriter<File>),
}

impl FileWriter {
    /// Creates the file and writes a header sized for zero frames; the
    /// header is patched when the writer is finalized or dropped.
    pub fn create(
        path: impl AsRef<Path>,
        format: FileFormat,
        sample_rate: u32,
        tags: &FileTags,
    ) -> Result<Self, SoundError> {
        let path = path.as_ref().to_path_buf();
        if !format.supported() {
            return Err(SoundError::UnsupportedFormat {
                format: format!("{format:?} for {}", path.display()),
            });
        }
        let file = File::create(&path).map_err(|e| SoundError::file(&path, e))?;
        let mut writer = BufWriter::new(file);
        let inner = match format {
            FileFormat::WavPcm16 => {
                write_wav_header(&mut writer, sample_rate, 0).map_err(|e| SoundError::file(&path, e))?;
                WriterImpl::Wav(writer)
            }
            FileFormat::AuFloat => {
                write_au_header(&mut writer, sample_rate, tags)
                    .map_err(|e| SoundError::file(&path, e))?;
                WriterImpl::Au(writer)
            }
            FileFormat::FlacPcm16 => unreachable!("rejected above"),
        };
        let pending_tags = match inner {
            WriterImpl::Wav(_) => Some(tags.clone()),
            WriterImpl::Au(_) => None,
        };
        Ok(Self {
            path,
            inner,
            frames_written: 0,
            finalized: false,
            pending_tags,
        })
    }

    /// Appends mono frames in [-1.0, 1.0].
    pub fn write_mono(&mut self, frames: &[f64]) -> Result<(), SoundError> {
        match &mut self.inner {
            WriterImpl::Wav(w) => {
                for &s in frames {
                    w.write_all(&clamp_i16(s).to_le_bytes())
                        .map_err(|e| SoundError::file(&self.path, e))?;
                }
            }
            WriterImpl::Au(w) => {
                for &s in frames {
                    w.write_all(&(s as f32).to_ne_bytes())
                        .map_err(|e| SoundError::file(&self.path, e))?;
                }
            }
        }
        self.frames_written += frames.len() as u64;
        Ok(())
    }

    /// Total mono frames written so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Patches header sizes and appends metadata, then flushes.
    pub fn finalize(&mut self) -> Result<(), SoundError> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        let data_bytes = match &self.inner {
            WriterImpl::Wav(_) => self.frames_written * 2,
            WriterImpl::Au(_) => self.frames_written * 4,
        };
        match &mut self.inner {
            WriterImpl::Wav(w) => {
                if let Some(tags) = self.pending_tags.take() {
                    write_wav_info_chunk(w, &tags).map_err(|e| SoundError::file(&self.path, e))?;
                }
                let end = w
                    .seek(SeekFrom::End(0))
                    .map_err(|e| SoundError::file(&self.path, e))?;
                // RIFF chunk size covers everything after the first 8 bytes.
                w.seek(SeekFrom::Start(4))
                    .map_err(|e| SoundError::file(&self.path, e))?;
                w.write_all(&((end - 8) as u32).to_le_bytes())
                    .map_err(|e| SoundError::file(&self.path, e))?;
                w.seek(SeekFrom::Start(40))
                    .map_err(|e| SoundError::file(&self.path, e))?;
                w.write_all(&(data_bytes as u32).to_le_bytes())
                    .map_err(|e| SoundError::file(&self.path, e))?;
                w.flush().map_err(|e| SoundError::file(&self.path, e))?;
            }
            WriterImpl::Au(w) => {
                w.seek(SeekFrom::Start(8))
                    .map_err(|e| SoundError::file(&self.path, e))?;
                w.write_all(&(data_bytes as u32).to_be_bytes())
                    .map_err(|e| SoundError::file(&self.path, e))?;
                w.flush().map_err(|e| SoundError::file(&self.path, e))?;
            }
        }
        Ok(())
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if !self.finalized {
            if let Err(e) = self.finalize() {
                tracing::warn!("could not finalize {}: {e}", self.path.display());
            }
        }
    }
}

fn write_wav_header(w: &mut impl Write, sample_rate: u32, data_size: u32) -> std::io::Result<()> {
    w.write_all(b"RIFF")?;
    w.write_all(&(36 + data_size).to_le_bytes())?;
    w.write_all(b"WAVE")?;

    w.write_all(b"fmt ")?;
    w.write_all(&16u32.to_le_bytes())?;
    w.write_all(&1u16.to_le_bytes())?; // PCM
    w.write_all(&FILE_CHANNELS.to_le_bytes())?;
    w.write_all(&sample_rate.to_le_bytes())?;
    let byte_rate = sample_rate * u32::from(FILE_CHANNELS) * 2;
    w.write_all(&byte_rate.to_le_bytes())?;
    let block_align = FILE_CHANNELS * 2;
    w.write_all(&block_align.to_le_bytes())?;
    w.write_all(&16u16.to_le_bytes())?; // bits per sample

    w.write_all(b"data")?;
    w.write_all(&data_size.to_le_bytes())?;
    Ok(())
}

/// Appends a RIFF LIST/INFO chunk carrying the tag strings.
fn write_wav_info_chunk(w: &mut impl Write, tags: &FileTags) -> std::io::Result<()> {
    let entries: [(&[u8; 4], &str); 5] = [
        (b"INAM", &tags.title),
        (b"IART", &tags.artist),
        (b"ISFT", &tags.software),
        (b"ICMT", &tags.comment),
        (b"ICRD", &tags.date),
    ];

    let mut body = Vec::new();
    body.extend_from_slice(b"INFO");
    for (id, value) in entries {
        if value.is_empty() {
            continue;
        }
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        if bytes.len() % 2 != 0 {
            bytes.push(0);
        }
        body.extend_from_slice(id);
        body.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        body.extend_from_slice(&bytes);
    }
    if body.len() == 4 {
        return Ok(());
    }

    w.write_all(b"LIST")?;
    w.write_all(&(body.len() as u32).to_le_bytes())?;
    w.write_all(&body)?;
    Ok(())
}

fn write_au_header(w: &mut impl Write, sample_rate: u32, tags: &FileTags) -> std::io::Result<()> {
    let mut annotation = Vec::new();
    for value in [&tags.title, &tags.artist, &tags.software, &tags.comment, &tags.date] {
        if !value.is_empty() {
            annotation.extend_from_slice(value.as_bytes());
            annotation.push(b'\n');
        }
    }
    annotation.push(0);
    while annotation.len() % 8 != 0 {
        annotation.push(0);
    }

    w.write_all(&AU_MAGIC.to_be_bytes())?;
    w.write_all(&(24 + annotation.len() as u32).to_be_bytes())?; // data offset
    w.write_all(&0xffff_ffffu32.to_be_bytes())?; // data size, patched later
    w.write_all(&AU_ENCODING_FLOAT32.to_be_bytes())?;
    w.write_all(&sample_rate.to_be_bytes())?;
    w.write_all(&u32::from(FILE_CHANNELS).to_be_bytes())?;
    w.write_all(&annotation)?;
    Ok(())
}

/// Reader for the playback file.
///
/// Accepts mono or stereo sources; stereo is averaged down to mono.
pub struct FileReader {
    path: PathBuf,
    inner: BufReader<File>,
    format: FileFormat,
    channels: u16,
    sample_rate: u32,
    data_start: u64,
    data_len: u64,
    bytes_read: u64,
}

impl FileReader {
    /// Opens a playback file, detecting the format from its suffix.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SoundError> {
        let path = path.as_ref().to_path_buf();
        let format = FileFormat::from_path(&path);
        if !format.supported() {
            return Err(SoundError::UnsupportedFormat {
                format: format!("{format:?} for {}", path.display()),
            });
        }
        let file = File::open(&path).map_err(|e| SoundError::file(&path, e))?;
        let mut inner = BufReader::new(file);

        let (channels, sample_rate, data_start, data_len) = match format {
            FileFormat::WavPcm16 => parse_wav_header(&mut inner).map_err(|e| SoundError::file(&path, e))?,
            FileFormat::AuFloat => parse_au_header(&mut inner).map_err(|e| SoundError::file(&path, e))?,
            FileFormat::FlacPcm16 => unreachable!("rejected above"),
        };

        Ok(Self {
            path,
            inner,
            format,
            channels,
            sample_rate,
            data_start,
            data_len,
            bytes_read: 0,
        })
    }

    /// Sample rate declared by the file.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn bytes_per_frame(&self) -> u64 {
        let per_sample = match self.format {
            FileFormat::WavPcm16 => 2,
            FileFormat::AuFloat => 4,
            FileFormat::FlacPcm16 => unreachable!(),
        };
        per_sample * u64::from(self.channels)
    }

    fn read_frame(&mut self) -> Result<Option<f64>, std::io::Error> {
        if self.bytes_read + self.bytes_per_frame() > self.data_len {
            return Ok(None);
        }
        let mut acc = 0.0f64;
        for _ in 0..self.channels {
            let v = match self.format {
                FileFormat::WavPcm16 => {
                    let mut b = [0u8; 2];
                    self.inner.read_exact(&mut b)?;
                    f64::from(i16::from_le_bytes(b)) / 32768.0
                }
                FileFormat::AuFloat => {
                    let mut b = [0u8; 4];
                    self.inner.read_exact(&mut b)?;
                    f64::from(f32::from_ne_bytes(b))
                }
                FileFormat::FlacPcm16 => unreachable!(),
            };
            acc += v;
        }
        self.bytes_read += self.bytes_per_frame();
        Ok(Some(acc / f64::from(self.channels)))
    }

    fn rewind_data(&mut self) -> Result<(), std::io::Error> {
        self.inner.seek(SeekFrom::Start(self.data_start))?;
        self.bytes_read = 0;
        Ok(())
    }

    /// Fills `out` with mono frames, rewinding to the start of the data at
    /// EOF. Returns the number of frames delivered, short only when the file
    /// holds no audio at all; the remainder is zeroed in that case.
    pub fn read_looped(&mut self, out: &mut [f64]) -> Result<usize, SoundError> {
        let mut filled = 0usize;
        while filled < out.len() {
            match self.read_frame().map_err(|e| SoundError::file(&self.path, e))? {
                Some(v) => {
                    out[filled] = v;
                    filled += 1;
                }
                None => {
                    if self.data_len < self.bytes_per_frame() {
                        break;
                    }
                    self.rewind_data().map_err(|e| SoundError::file(&self.path, e))?;
                }
            }
        }
        for s in &mut out[filled..] {
            *s = 0.0;
        }
        Ok(filled)
    }
}

fn read_u32_le(r: &mut impl Read) -> std::io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u16_le(r: &mut impl Read) -> std::io::Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_le_bytes(b))
}

fn read_u32_be(r: &mut impl Read) -> std::io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn bad_data(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

/// Walks RIFF chunks until the data chunk; returns
/// (channels, sample rate, data start, data length in bytes).
fn parse_wav_header(r: &mut BufReader<File>) -> std::io::Result<(u16, u32, u64, u64)> {
    let mut four = [0u8; 4];
    r.read_exact(&mut four)?;
    if &four != b"RIFF" {
        return Err(bad_data("not a RIFF file"));
    }
    let _riff_size = read_u32_le(r)?;
    r.read_exact(&mut four)?;
    if &four != b"WAVE" {
        return Err(bad_data("not a WAVE file"));
    }

    let mut fmt: Option<(u16, u32)> = None;
    loop {
        if r.read_exact(&mut four).is_err() {
            return Err(bad_data("no data chunk"));
        }
        let size = read_u32_le(r)?;
        match &four {
            b"fmt " => {
                let audio_format = read_u16_le(r)?;
                let channels = read_u16_le(r)?;
                let sample_rate = read_u32_le(r)?;
                let _byte_rate = read_u32_le(r)?;
                let _block_align = read_u16_le(r)?;
                let bits = read_u16_le(r)?;
                if audio_format != 1 || bits != 16 {
                    return Err(bad_data("only 16-bit PCM is supported"));
                }
                if size > 16 {
                    r.seek(SeekFrom::Current(i64::from(size) - 16))?;
                }
                fmt = Some((channels, sample_rate));
            }
            b"data" => {
                let (channels, sample_rate) =
                    fmt.ok_or_else(|| bad_data("data chunk before fmt chunk"))?;
                let start = r.stream_position()?;
                return Ok((channels, sample_rate, start, u64::from(size)));
            }
            _ => {
                let skip = u64::from(size) + u64::from(size % 2);
                r.seek(SeekFrom::Current(skip as i64))?;
            }
        }
    }
}

fn parse_au_header(r: &mut BufReader<File>) -> std::io::Result<(u16, u32, u64, u64)> {
    if read_u32_be(r)? != AU_MAGIC {
        return Err(bad_data("not an AU file"));
    }
    let data_offset = read_u32_be(r)?;
    let data_size = read_u32_be(r)?;
    let encoding = read_u32_be(r)?;
    let sample_rate = read_u32_be(r)?;
    let channels = read_u32_be(r)?;
    if encoding != AU_ENCODING_FLOAT32 {
        return Err(bad_data("only float32 AU is supported"));
    }
    r.seek(SeekFrom::Start(u64::from(data_offset)))?;
    let data_len = if data_size == 0xffff_ffff {
        // Unknown length marker: use the rest of the file.
        let end = r.seek(SeekFrom::End(0))?;
        r.seek(SeekFrom::Start(u64::from(data_offset)))?;
        end - u64::from(data_offset)
    } else {
        u64::from(data_size)
    };
    Ok((channels as u16, sample_rate, u64::from(data_offset), data_len))
}

/// Toggleable file taps shared by every port implementation.
///
/// The capture writer records what the modem hears, the generate writer
/// records what the modem sends, and the playback reader substitutes for
/// the capture device when present.
pub struct FileTee {
    capture: Option<FileWriter>,
    playback: Option<FileReader>,
    generate: Option<FileWriter>,
    tags: FileTags,
    sample_rate: u32,
}

impl FileTee {
    /// Creates an inactive tee. The sample rate is updated by each
    /// successful `open()` on the owning port.
    pub fn new() -> Self {
        Self {
            capture: None,
            playback: None,
            generate: None,
            tags: FileTags::default(),
            sample_rate: 8000,
        }
    }

    /// Replaces the metadata stamped onto newly created files.
    pub fn set_tags(&mut self, tags: FileTags) {
        self.tags = tags;
    }

    /// Sets the modem rate used for newly created files.
    pub fn set_sample_rate(&mut self, rate: u32) {
        self.sample_rate = rate;
    }

    /// Starts recording capture audio to `path`.
    pub fn capture_to(&mut self, path: impl AsRef<Path>) -> Result<(), SoundError> {
        let format = FileFormat::from_path(path.as_ref());
        self.capture = Some(FileWriter::create(
            path,
            format,
            self.sample_rate,
            &self.tags,
        )?);
        Ok(())
    }

    /// Stops capture recording, finalizing the file.
    pub fn capture_off(&mut self) {
        self.capture = None;
    }

    /// Starts sourcing capture audio from `path` instead of the device.
    pub fn playback_from(&mut self, path: impl AsRef<Path>) -> Result<(), SoundError> {
        self.playback = Some(FileReader::open(path)?);
        Ok(())
    }

    /// Stops file playback; capture reverts to the device.
    pub fn playback_off(&mut self) {
        self.playback = None;
    }

    /// Starts recording transmitted audio to `path`.
    pub fn generate_to(&mut self, path: impl AsRef<Path>) -> Result<(), SoundError> {
        let format = FileFormat::from_path(path.as_ref());
        self.generate = Some(FileWriter::create(
            path,
            format,
            self.sample_rate,
            &self.tags,
        )?);
        Ok(())
    }

    /// Stops generate recording, finalizing the file.
    pub fn generate_off(&mut self) {
        self.generate = None;
    }

    /// Whether a capture file is attached.
    pub fn is_capture(&self) -> bool {
        self.capture.is_some()
    }

    /// Whether a playback file is attached.
    pub fn is_playback(&self) -> bool {
        self.playback.is_some()
    }

    /// Whether a generate file is attached.
    pub fn is_generate(&self) -> bool {
        self.generate.is_some()
    }

    /// Mono frames written to the capture file so far.
    pub fn capture_frames(&self) -> u64 {
        self.capture.as_ref().map_or(0, FileWriter::frames_written)
    }

    /// Appends a received block to the capture file, if attached.
    /// Write failures are logged, not surfaced; the data path goes on.
    pub fn tee_capture(&mut self, frames: &[f64]) {
        if let Some(w) = &mut self.capture {
            if let Err(e) = w.write_mono(frames) {
                tracing::warn!("capture tee write failed: {e}");
            }
        }
    }

    /// Appends a transmitted block to the generate file, if attached.
    pub fn tee_generate(&mut self, frames: &[f64]) {
        if let Some(w) = &mut self.generate {
            if let Err(e) = w.write_mono(frames) {
                tracing::warn!("generate tee write failed: {e}");
            }
        }
    }

    /// Reads looped playback frames; `buf` is zero-filled when no playback
    /// file is attached or the file is empty.
    pub fn read_playback(&mut self, buf: &mut [f64]) -> Result<usize, SoundError> {
        match &mut self.playback {
            Some(r) => r.read_looped(buf),
            None => {
                buf.fill(0.0);
                Ok(0)
            }
        }
    }
}

impl Default for FileTee {
    fn default() -> Self {
        Self::new()
    }
}

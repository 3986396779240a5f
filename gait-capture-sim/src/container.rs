//! Simulated raw-container format: a fixed header followed by
//! length-prefixed framesets.
//!
//! Development/test stand-in for the vendor SDK's native recording
//! container, written by the simulated recorder and replayed by the
//! simulated playback pipeline. Not a media format.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use gait_capture_core::{
    ColorFrame, DepthFrame, FrameSet, HwTimestamp, StreamProfile, TimestampDomain,
};

const MAGIC: &[u8; 8] = b"GAITSIM1";
const HEADER_LEN: u64 = 8 + 3 * 4;

/// Writes framesets to a simulated raw container.
pub struct ContainerWriter {
    out: BufWriter<File>,
    frames: u64,
}

impl ContainerWriter {
    pub fn create(path: &Path, profile: StreamProfile) -> io::Result<Self> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        out.write_all(MAGIC)?;
        out.write_all(&profile.width.to_le_bytes())?;
        out.write_all(&profile.height.to_le_bytes())?;
        out.write_all(&profile.fps.to_le_bytes())?;
        Ok(Self { out, frames: 0 })
    }

    pub fn append(&mut self, frames: &FrameSet) -> io::Result<()> {
        self.out
            .write_all(&frames.timestamp.millis.to_le_bytes())?;

        let color = &frames.color;
        self.out
            .write_all(&(color.data.len() as u32).to_le_bytes())?;
        self.out.write_all(&color.data)?;

        match &frames.depth {
            Some(depth) => {
                self.out
                    .write_all(&(depth.data.len() as u32).to_le_bytes())?;
                let mut bytes = Vec::with_capacity(depth.data.len() * 2);
                for value in &depth.data {
                    bytes.extend_from_slice(&value.to_le_bytes());
                }
                self.out.write_all(&bytes)?;
            }
            None => {
                self.out.write_all(&0u32.to_le_bytes())?;
            }
        }

        self.frames += 1;
        Ok(())
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn finish(mut self) -> io::Result<u64> {
        self.out.flush()?;
        Ok(self.frames)
    }
}

/// Replays framesets from a simulated raw container.
pub struct ContainerReader {
    input: BufReader<File>,
    profile: StreamProfile,
}

impl ContainerReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let mut input = BufReader::new(file);

        let mut magic = [0u8; 8];
        input.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not a simulated raw container",
            ));
        }

        let width = read_u32(&mut input)?;
        let height = read_u32(&mut input)?;
        let fps = read_u32(&mut input)?;

        Ok(Self {
            input,
            profile: StreamProfile::new(width, height, fps),
        })
    }

    pub fn profile(&self) -> StreamProfile {
        self.profile
    }

    /// Read the next frameset; `None` at end of file.
    pub fn next_frame(&mut self) -> io::Result<Option<FrameSet>> {
        let mut ts_bytes = [0u8; 8];
        match self.input.read_exact(&mut ts_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let millis = f64::from_le_bytes(ts_bytes);

        let color_len = read_u32(&mut self.input)? as usize;
        let mut color_data = vec![0u8; color_len];
        self.input.read_exact(&mut color_data)?;

        let depth_len = read_u32(&mut self.input)? as usize;
        let depth = if depth_len > 0 {
            let mut depth_bytes = vec![0u8; depth_len * 2];
            self.input.read_exact(&mut depth_bytes)?;
            let data = depth_bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            Some(DepthFrame {
                width: self.profile.width,
                height: self.profile.height,
                data,
            })
        } else {
            None
        };

        Ok(Some(FrameSet {
            color: ColorFrame {
                width: self.profile.width,
                height: self.profile.height,
                data: color_data,
            },
            depth,
            timestamp: HwTimestamp {
                millis,
                domain: TimestampDomain::HardwareClock,
            },
        }))
    }

    /// Seek back to the first frameset (looped playback).
    pub fn rewind(&mut self) -> io::Result<()> {
        self.input.seek(SeekFrom::Start(HEADER_LEN))?;
        Ok(())
    }
}

fn read_u32(input: &mut impl Read) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    input.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

//! RDA wire format
//!
//! Every message starts with a 24 byte header: a fixed GUID, the total message
//! size (header included) and the message type, all little-endian. The body
//! layout depends on the type; see [`Message`].

use crate::runtime::block::{ChannelDescriptor, IMPEDANCE_DATA, IMPEDANCE_GND, IMPEDANCE_INVALID, IMPEDANCE_REF};
use crate::runtime::block::{Marker, StreamBlock};
use crate::runtime::errors::{StageError, StageResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

/// Message GUID, 8E45584396C9864CAF4A98BBF6C91450
pub const GUID: [u8; 16] = [
    0x8E, 0x45, 0x58, 0x43, 0x96, 0xC9, 0x86, 0x4C, 0xAF, 0x4A, 0x98, 0xBB, 0xF6, 0xC9, 0x14, 0x50,
];

pub const HEADER_SIZE: usize = 24;

/// Port of the 32-bit data stream
pub const DEFAULT_PORT: u16 = 51244;

/// Version announced in INFO messages
pub const RECORDER_VERSION: f64 = 2.0;

/// Largest body a reader accepts
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// x, y, value and an empty UTF-16 name
const IMPEDANCE_ENTRY_MIN: usize = 14;
/// Record head plus two empty NUL-terminated strings
const MARKER_RECORD_MIN: usize = 18;

/// Payload of the capability handshake: "TEST" in UTF-16 with BOM, cut to 10 bytes
const HANDSHAKE_TAG: [u8; 10] = [0xFF, 0xFE, 0x54, 0x00, 0x45, 0x00, 0x53, 0x00, 0x54, 0x00];

pub mod kind {
    pub const START: u32 = 1;
    pub const DATA16: u32 = 2;
    pub const STOP: u32 = 3;
    pub const DATA32: u32 = 4;
    pub const NEWSTATE: u32 = 5;
    pub const IMP_START: u32 = 6;
    pub const IMP_DATA: u32 = 7;
    pub const IMP_STOP: u32 = 8;
    pub const INFO: u32 = 9;
    pub const KEEP_ALIVE: u32 = 10000;
    pub const HANDSHAKE: u32 = 100000;
}

/// Recorder state announced with NEWSTATE
pub mod state {
    pub const IDLE: i32 = 0;
    pub const RUNNING: i32 = 1;
    pub const IMPEDANCE: i32 = 3;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub guid: [u8; 16],
    pub size: u32,
    pub kind: u32,
}

impl Header {
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&bytes[..16]);
        let size = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let kind = u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        Self { guid, size, kind }
    }

    pub fn is_valid(&self) -> bool {
        self.guid == GUID
    }

    /// Bytes following the header
    pub fn body_len(&self) -> usize {
        (self.size as usize).saturating_sub(HEADER_SIZE)
    }
}

/// Channel setup sent with START
#[derive(Clone, Debug, PartialEq)]
pub struct StartInfo {
    /// Sampling interval in µs
    pub sampling_interval: f64,
    pub resolutions: Vec<f64>,
    pub names: Vec<String>,
}

impl StartInfo {
    pub fn sample_rate(&self) -> f64 {
        1e6 / self.sampling_interval
    }
}

/// Recorder description sent with INFO
#[derive(Clone, Debug, PartialEq)]
pub struct RecorderInfo {
    pub version: f64,
    pub sampling_interval: f64,
    pub resolutions: Vec<f64>,
    pub names: Vec<String>,
    pub units: Vec<String>,
}

/// Marker record of a data message; the position is relative to the block
#[derive(Clone, Debug, PartialEq)]
pub struct WireMarker {
    pub position: i32,
    pub points: u32,
    pub channel: i32,
    pub kind: String,
    pub description: String,
}

/// DATA32 or DATA16 body
#[derive(Clone, Debug, PartialEq)]
pub struct DataBlock {
    pub block: u32,
    pub points: u32,
    /// All channels of sample 0, then sample 1, ...
    pub samples: Vec<f32>,
    pub markers: Vec<WireMarker>,
}

/// One electrode of an IMP_DATA message
#[derive(Clone, Debug, PartialEq)]
pub struct ImpedanceEntry {
    pub x: f32,
    pub y: f32,
    /// kΩ, -1 if invalid
    pub value: i32,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Handshake,
    Start(StartInfo),
    Data16(DataBlock),
    Stop,
    Data32(DataBlock),
    NewState(i32),
    ImpStart,
    ImpData(Vec<ImpedanceEntry>),
    ImpStop,
    Info(RecorderInfo),
    KeepAlive,
}

impl Message {
    pub fn kind(&self) -> u32 {
        match self {
            Message::Handshake => kind::HANDSHAKE,
            Message::Start(_) => kind::START,
            Message::Data16(_) => kind::DATA16,
            Message::Stop => kind::STOP,
            Message::Data32(_) => kind::DATA32,
            Message::NewState(_) => kind::NEWSTATE,
            Message::ImpStart => kind::IMP_START,
            Message::ImpData(_) => kind::IMP_DATA,
            Message::ImpStop => kind::IMP_STOP,
            Message::Info(_) => kind::INFO,
            Message::KeepAlive => kind::KEEP_ALIVE,
        }
    }

    /// Complete message including the header
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        // writes into a Vec cannot fail
        let _ = self.encode_body(&mut body);

        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.extend_from_slice(&GUID);
        out.extend_from_slice(&((HEADER_SIZE + body.len()) as u32).to_le_bytes());
        out.extend_from_slice(&self.kind().to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> std::io::Result<()> {
        match self {
            Message::Handshake => {
                out.write_i32::<LittleEndian>(1)?;
                out.write_i32::<LittleEndian>(3)?;
                out.extend_from_slice(&HANDSHAKE_TAG);
            }
            Message::Start(info) => {
                out.write_u32::<LittleEndian>(info.names.len() as u32)?;
                out.write_f64::<LittleEndian>(info.sampling_interval)?;
                for &r in &info.resolutions {
                    out.write_f64::<LittleEndian>(r)?;
                }
                for name in &info.names {
                    out.extend(encode_latin1(name));
                    out.push(0);
                }
            }
            Message::Data32(data) => {
                encode_data_head(out, data)?;
                for &v in &data.samples {
                    out.write_f32::<LittleEndian>(v)?;
                }
                encode_markers(out, &data.markers)?;
            }
            Message::Data16(data) => {
                encode_data_head(out, data)?;
                for &v in &data.samples {
                    out.write_i16::<LittleEndian>(v as i16)?;
                }
                encode_markers(out, &data.markers)?;
            }
            Message::NewState(state) => out.write_i32::<LittleEndian>(*state)?,
            Message::ImpData(entries) => {
                out.write_u32::<LittleEndian>(entries.len() as u32)?;
                for entry in entries {
                    out.write_f32::<LittleEndian>(entry.x)?;
                    out.write_f32::<LittleEndian>(entry.y)?;
                    out.write_i32::<LittleEndian>(entry.value)?;
                    write_utf16z(out, &entry.name)?;
                }
            }
            Message::Info(info) => {
                out.write_f64::<LittleEndian>(info.version)?;
                out.write_u32::<LittleEndian>(info.names.len() as u32)?;
                out.write_f64::<LittleEndian>(info.sampling_interval)?;
                for &r in &info.resolutions {
                    out.write_f64::<LittleEndian>(r)?;
                }
                for name in &info.names {
                    write_utf16z(out, name)?;
                }
                for unit in &info.units {
                    write_utf16z(out, unit)?;
                }
            }
            Message::Stop | Message::ImpStart | Message::ImpStop | Message::KeepAlive => {}
        }
        Ok(())
    }

    /// Decode a body; `channels` is the channel count of the current setup,
    /// needed to split data messages
    pub fn decode(kind: u32, body: &[u8], channels: usize) -> StageResult<Message> {
        let mut cursor = Cursor::new(body);
        let message = match kind {
            kind::START => {
                let count = cursor.read_u32::<LittleEndian>()? as usize;
                let sampling_interval = cursor.read_f64::<LittleEndian>()?;
                let resolutions = read_f64s(&mut cursor, count)?;
                let names = split_latin1(&body[cursor.position() as usize..], count);
                Message::Start(StartInfo {
                    sampling_interval,
                    resolutions,
                    names,
                })
            }
            kind::DATA32 | kind::DATA16 => {
                let block = cursor.read_u32::<LittleEndian>()?;
                let points = cursor.read_u32::<LittleEndian>()?;
                let marker_count = cursor.read_u32::<LittleEndian>()?;
                let sample_size = if kind == kind::DATA32 { 4 } else { 2 };
                ensure_remaining(&cursor, points as usize, channels * sample_size, "data points")?;
                let values = points as usize * channels;
                let mut samples = Vec::with_capacity(values);
                for _ in 0..values {
                    samples.push(if kind == kind::DATA32 {
                        cursor.read_f32::<LittleEndian>()?
                    } else {
                        cursor.read_i16::<LittleEndian>()? as f32
                    });
                }
                let markers = decode_markers(&mut cursor, marker_count)?;
                let data = DataBlock {
                    block,
                    points,
                    samples,
                    markers,
                };
                if kind == kind::DATA32 {
                    Message::Data32(data)
                } else {
                    Message::Data16(data)
                }
            }
            kind::STOP => Message::Stop,
            kind::NEWSTATE => Message::NewState(cursor.read_i32::<LittleEndian>()?),
            kind::IMP_START => Message::ImpStart,
            kind::IMP_DATA => {
                let count = cursor.read_u32::<LittleEndian>()?;
                ensure_remaining(&cursor, count as usize, IMPEDANCE_ENTRY_MIN, "impedance entries")?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let x = cursor.read_f32::<LittleEndian>()?;
                    let y = cursor.read_f32::<LittleEndian>()?;
                    let value = cursor.read_i32::<LittleEndian>()?;
                    let name = read_utf16z(&mut cursor)?;
                    entries.push(ImpedanceEntry { x, y, value, name });
                }
                Message::ImpData(entries)
            }
            kind::IMP_STOP => Message::ImpStop,
            kind::INFO => {
                let version = cursor.read_f64::<LittleEndian>()?;
                let count = cursor.read_u32::<LittleEndian>()? as usize;
                let sampling_interval = cursor.read_f64::<LittleEndian>()?;
                let resolutions = read_f64s(&mut cursor, count)?;
                let names = (0..count)
                    .map(|_| read_utf16z(&mut cursor))
                    .collect::<StageResult<Vec<_>>>()?;
                let units = (0..count)
                    .map(|_| read_utf16z(&mut cursor))
                    .collect::<StageResult<Vec<_>>>()?;
                Message::Info(RecorderInfo {
                    version,
                    sampling_interval,
                    resolutions,
                    names,
                    units,
                })
            }
            kind::KEEP_ALIVE => Message::KeepAlive,
            kind::HANDSHAKE => Message::Handshake,
            other => return Err(StageError::Protocol(format!("unknown message type {}", other))),
        };
        Ok(message)
    }
}

fn encode_data_head(out: &mut Vec<u8>, data: &DataBlock) -> std::io::Result<()> {
    out.write_u32::<LittleEndian>(data.block)?;
    out.write_u32::<LittleEndian>(data.points)?;
    out.write_u32::<LittleEndian>(data.markers.len() as u32)
}

fn encode_markers(out: &mut Vec<u8>, markers: &[WireMarker]) -> std::io::Result<()> {
    for marker in markers {
        let size = 16 + marker.kind.len() + 1 + marker.description.len() + 1;
        out.write_u32::<LittleEndian>(size as u32)?;
        out.write_i32::<LittleEndian>(marker.position)?;
        out.write_u32::<LittleEndian>(marker.points)?;
        out.write_i32::<LittleEndian>(marker.channel)?;
        out.extend_from_slice(marker.kind.as_bytes());
        out.push(0);
        out.extend_from_slice(marker.description.as_bytes());
        out.push(0);
    }
    Ok(())
}

fn decode_markers(cursor: &mut Cursor<&[u8]>, count: u32) -> StageResult<Vec<WireMarker>> {
    ensure_remaining(cursor, count as usize, MARKER_RECORD_MIN, "markers")?;
    let mut markers = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let size = cursor.read_u32::<LittleEndian>()? as usize;
        if size < 16 {
            return Err(StageError::Protocol(format!("marker record of {} bytes", size)));
        }
        let position = cursor.read_i32::<LittleEndian>()?;
        let points = cursor.read_u32::<LittleEndian>()?;
        let channel = cursor.read_i32::<LittleEndian>()?;
        ensure_remaining(cursor, size - 16, 1, "marker text bytes")?;
        let mut text = vec![0u8; size - 16];
        cursor.read_exact(&mut text)?;
        let mut parts = text.split(|&b| b == 0).map(|s| String::from_utf8_lossy(s).into_owned());
        let kind = parts.next().unwrap_or_default();
        let description = parts.next().unwrap_or_default();
        markers.push(WireMarker {
            position,
            points,
            channel,
            kind,
            description,
        });
    }
    Ok(markers)
}

fn read_f64s(cursor: &mut Cursor<&[u8]>, count: usize) -> StageResult<Vec<f64>> {
    ensure_remaining(cursor, count, 8, "resolutions")?;
    (0..count)
        .map(|_| cursor.read_f64::<LittleEndian>().map_err(StageError::from))
        .collect()
}

/// Fails unless `count` items of at least `item_size` bytes fit in the rest of the body
fn ensure_remaining(cursor: &Cursor<&[u8]>, count: usize, item_size: usize, what: &str) -> StageResult {
    let remaining = cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    match count.checked_mul(item_size) {
        Some(needed) if needed <= remaining => Ok(()),
        _ => Err(StageError::Protocol(format!(
            "{} {} do not fit in the {} remaining bytes",
            count, what, remaining
        ))),
    }
}

/// Latin-1 bytes of `text`; characters outside the range become '?'
fn encode_latin1(text: &str) -> impl Iterator<Item = u8> + '_ {
    text.chars().map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
}

/// The first `count` NUL-terminated Latin-1 strings of `raw`
fn split_latin1(raw: &[u8], count: usize) -> Vec<String> {
    raw.split(|&b| b == 0)
        .take(count)
        .map(|s| s.iter().map(|&b| b as char).collect())
        .collect()
}

fn write_utf16z(out: &mut Vec<u8>, text: &str) -> std::io::Result<()> {
    for unit in text.encode_utf16() {
        out.write_u16::<LittleEndian>(unit)?;
    }
    out.write_u16::<LittleEndian>(0)
}

fn read_utf16z(cursor: &mut Cursor<&[u8]>) -> StageResult<String> {
    let mut units = Vec::new();
    loop {
        match cursor.read_u16::<LittleEndian>()? {
            0 => break,
            unit => units.push(unit),
        }
    }
    Ok(String::from_utf16_lossy(&units))
}

/// START message describing the layout of `params`
pub fn start_message(params: &StreamBlock) -> Message {
    Message::Start(StartInfo {
        sampling_interval: 1e6 / params.sample_rate,
        resolutions: vec![1.0; params.channels.len()],
        names: params.channels.iter().map(|c| c.name.clone()).collect(),
    })
}

/// INFO message describing the layout of `params`
pub fn info_message(params: &StreamBlock) -> Message {
    let n = params.channels.len();
    Message::Info(RecorderInfo {
        version: RECORDER_VERSION,
        sampling_interval: 1e6 / params.sample_rate,
        resolutions: vec![1.0; n],
        names: params.channels.iter().map(|c| c.name.clone()).collect(),
        units: vec!["µV".to_string(); n],
    })
}

/// DATA32 message carrying the samples and markers of `block`
pub fn data_message(block_number: u32, block: &StreamBlock) -> Message {
    let first = block.counter.first().copied().unwrap_or(0) as i64;
    Message::Data32(DataBlock {
        block: block_number,
        points: block.samples() as u32,
        samples: block.data.interleaved().into_iter().map(|v| v as f32).collect(),
        markers: block.markers.iter().map(|m| wire_marker(m, first)).collect(),
    })
}

fn wire_marker(marker: &Marker, first: i64) -> WireMarker {
    WireMarker {
        position: (marker.position - first) as i32,
        points: marker.points,
        channel: marker.channel,
        kind: marker.kind.clone(),
        description: marker.description.clone(),
    }
}

/// Impedance in kΩ as sent over the wire, -1 if invalid
pub fn impedance_kohm(ohm: f64) -> i32 {
    if ohm >= IMPEDANCE_INVALID {
        -1
    } else {
        ((ohm + 500.0) / 1000.0) as i32
    }
}

/// IMP_DATA message from an impedance block
///
/// Electrodes delivering both a data and a reference value appear twice, as
/// `<name>+` and `<name>-`. The ground electrode is appended as `GND`.
pub fn impedance_message(block: &StreamBlock) -> Message {
    let mut entries: Vec<(String, i32)> = Vec::new();
    let mut ground = None;
    for (row, channel) in block.channels.iter().enumerate() {
        let values = block.data.row(row);
        push_impedance(&mut entries, channel, values);
        if ground.is_none() && channel.impedance.ground {
            ground = Some(impedance_kohm(values[IMPEDANCE_GND]));
        }
    }
    if let Some(ground) = ground {
        entries.push(("GND".to_string(), ground));
    }

    Message::ImpData(
        entries
            .into_iter()
            .enumerate()
            .map(|(k, (name, value))| ImpedanceEntry {
                x: (k % 10) as f32 * 0.05 + 0.5,
                y: (k / 10) as f32 * 0.05 + 0.05,
                value,
                name,
            })
            .collect(),
    )
}

fn push_impedance(entries: &mut Vec<(String, i32)>, channel: &ChannelDescriptor, values: &[f64]) {
    let slots = channel.impedance;
    if slots.data {
        let name = if slots.reference {
            format!("{}+", channel.name)
        } else {
            channel.name.clone()
        };
        entries.push((name, impedance_kohm(values[IMPEDANCE_DATA])));
    }
    if slots.reference {
        entries.push((format!("{}-", channel.name), impedance_kohm(values[IMPEDANCE_REF])));
    }
}

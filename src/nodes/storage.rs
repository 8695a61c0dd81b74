//! Recording to disk
//!
//! A recording consists of three files sharing one base name: a text header
//! (`.vhdr`), a marker list (`.vmrk`) and the samples as little-endian
//! float32, multiplexed (`.eeg`). Recordings are opened and closed with the
//! `StartSaving` and `StopSaving` commands while acquisition runs.
//!
//! Marker positions in the file are 1-based and count only samples actually
//! written, so every gap in the sample counter shifts later positions and is
//! marked with a `New Segment` marker.

use crate::acquisition::MissingSampleMonitor;
use crate::runtime::block::{ChannelGroup, Marker, RecordingMode, StreamBlock};
use crate::runtime::block::{IMPEDANCE_DATA, IMPEDANCE_GND, IMPEDANCE_INVALID, IMPEDANCE_REF};
use crate::runtime::errors::{Severity, StageError, StageResult};
use crate::runtime::event::{EventKind, EventSink, ModuleEvent};
use crate::runtime::node::{LifecycleRequest, Module, ModuleContext, Output};
use byteorder::{LittleEndian, WriteBytesExt};
use chrono::{DateTime, Local, TimeDelta};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

pub const START_SAVING: &str = "StartSaving";
pub const STOP_SAVING: &str = "StopSaving";

const NEW_SEGMENT: &str = "New Segment";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory new recordings are created in
    pub directory: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
        }
    }
}

/// Counter value at which samples went missing, and how many
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Gap {
    counter: u64,
    missing: u64,
}

/// Files of an open recording
struct Recording {
    path: PathBuf,
    data: BufWriter<File>,
    markers: BufWriter<File>,
    marker_count: usize,
    /// Counter of the first sample written; `None` until the first block
    start_sample: Option<u64>,
    start_time: DateTime<Local>,
    total_missing: u64,
    samples_written: u64,
}

impl Recording {
    fn write_marker(&mut self, marker: &Marker, position: i64, block_time: DateTime<Local>) -> std::io::Result<()> {
        self.marker_count += 1;
        let mut line = format!(
            "Mk{}={},{},{},{},{}",
            self.marker_count,
            marker.kind.replace(',', "\\1"),
            marker.description.replace(',', "\\1"),
            position,
            marker.points,
            marker.channel
        );
        if marker.with_date {
            let time = marker.timestamp.unwrap_or(block_time);
            line.push_str(&time.format(",%Y%m%d%H%M%S%6f").to_string());
        }
        writeln!(self.markers, "{}", line)?;
        self.markers.flush()
    }

    /// Write the samples and markers of one block; returns the markers to pass on
    fn write_block(&mut self, block: &StreamBlock, gaps: &[Gap]) -> std::io::Result<Vec<Marker>> {
        for value in block.data.interleaved() {
            self.data.write_f32::<LittleEndian>(value as f32)?;
        }
        self.data.flush()?;

        let first = block.counter.first().copied().unwrap_or(0);
        let mut output = Vec::with_capacity(block.markers.len() + gaps.len() + 1);
        let mut gaps: Vec<Gap> = gaps.to_vec();

        let start = match self.start_sample {
            Some(start) => start,
            None => {
                self.start_sample = Some(first);
                self.start_time = block.block_time;
                self.total_missing = 0;
                self.samples_written = 0;
                // samples lost before the first written one do not count
                gaps.retain(|g| g.counter > first);
                let segment = Marker::new(first as i64, NEW_SEGMENT, "").dated(block.block_time);
                self.write_marker(&segment, 1, block.block_time)?;
                output.push(segment);
                first
            }
        };

        let mut markers = block.markers.clone();
        markers.sort_by_key(|m| m.position);
        let mut pending = gaps.iter().peekable();
        let mut passed = 0u64;
        let base = start as i64 + self.total_missing as i64;

        for marker in &markers {
            while let Some(gap) = pending.next_if(|g| g.counter as i64 <= marker.position) {
                passed += gap.missing;
                output.push(self.write_segment(gap, start, base + passed as i64, block)?);
            }
            let position = marker.position - base - passed as i64 + 1;
            self.write_marker(marker, position, block.block_time)?;
            output.push(marker.clone());
        }
        for gap in pending {
            passed += gap.missing;
            output.push(self.write_segment(gap, start, base + passed as i64, block)?);
        }

        self.total_missing += gaps.iter().map(|g| g.missing).sum::<u64>();
        self.samples_written += block.samples() as u64;
        Ok(output)
    }

    fn write_segment(&mut self, gap: &Gap, start: u64, offset: i64, block: &StreamBlock) -> std::io::Result<Marker> {
        let elapsed = if block.sample_rate > 0.0 {
            (gap.counter - start) as f64 / block.sample_rate
        } else {
            0.0
        };
        let time = self.start_time + TimeDelta::microseconds((elapsed * 1e6) as i64);
        let segment = Marker::new(gap.counter as i64, NEW_SEGMENT, "").dated(time);
        self.write_marker(&segment, gap.counter as i64 - offset + 1, block.block_time)?;
        Ok(segment)
    }
}

pub struct Storage {
    settings: StorageSettings,
    events: EventSink,
    params: StreamBlock,
    last_impedance: Option<StreamBlock>,
    recording: Option<Recording>,
    next_counter: Option<u64>,
    monitor: MissingSampleMonitor,
    pending: Option<StreamBlock>,
}

impl Storage {
    pub fn new(settings: StorageSettings) -> Self {
        Self {
            settings,
            events: EventSink::default(),
            params: StreamBlock::default(),
            last_impedance: None,
            recording: None,
            next_counter: None,
            monitor: MissingSampleMonitor::default(),
            pending: None,
        }
    }

    pub fn from_settings(settings: &Value) -> StageResult<Self> {
        Ok(Self::new(parse_settings(settings)?))
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Data file of the open recording
    pub fn recording_path(&self) -> Option<&Path> {
        self.recording.as_ref().map(|r| r.path.as_path())
    }

    /// Next free `<name>.eeg` or `<name>_<n>.eeg` in the storage directory
    fn unique_path(&self, name: &str) -> StageResult<PathBuf> {
        let dir = &self.settings.directory;
        if !dir.is_dir() {
            return Err(StageError::Config(format!("path '{}' does not exist", dir.display())));
        }
        let name = name.trim().trim_end_matches(".eeg");
        if name.is_empty() {
            return Err(StageError::Config("no recording name given".into()));
        }
        let plain = dir.join(format!("{}.eeg", name));
        if !plain.exists() {
            return Ok(plain);
        }

        let prefix = format!("{}_", name);
        let mut highest = 0u64;
        for entry in std::fs::read_dir(dir)? {
            let file_name = entry?.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(number) = file_name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".eeg"))
                .and_then(|n| n.parse::<u64>().ok())
            {
                highest = highest.max(number);
            }
        }
        let numbered = dir.join(format!("{}_{}.eeg", name, highest + 1));
        if numbered.exists() {
            return Err(StageError::Config(format!(
                "auto numbering failed, '{}' already exists",
                numbered.display()
            )));
        }
        Ok(numbered)
    }

    fn header(&self, data_path: &Path, marker_path: &Path) -> String {
        let file_name = |p: &Path| {
            p.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        let mut h = String::new();
        h.push_str("Brain Vision Data Exchange Header File Version 1.0\n");
        h.push_str("; Data created by biocorder\n\n");
        h.push_str("[Common Infos]\n");
        h.push_str("Codepage=UTF-8\n");
        h.push_str(&format!("DataFile={}\n", file_name(data_path)));
        h.push_str(&format!("MarkerFile={}\n", file_name(marker_path)));
        h.push_str("DataFormat=BINARY\n");
        h.push_str("; Data orientation: MULTIPLEXED=ch1,pt1, ch2,pt1 ...\n");
        h.push_str("DataOrientation=MULTIPLEXED\n");
        h.push_str(&format!("NumberOfChannels={}\n", self.params.channels.len()));
        h.push_str("; Sampling interval in microseconds\n");
        let interval = if self.params.sample_rate > 0.0 {
            1e6 / self.params.sample_rate
        } else {
            0.0
        };
        if interval.fract() == 0.0 {
            h.push_str(&format!("SamplingInterval={}\n", interval as u64));
        } else {
            h.push_str(&format!("SamplingInterval={:.5}\n", interval));
        }
        h.push_str("\n[Binary Infos]\nBinaryFormat=IEEE_FLOAT_32\n\n");
        h.push_str("[Channel Infos]\n");
        h.push_str("; Each entry: Ch<Channel number>=<Name>,<Reference channel name>,\n");
        h.push_str("; <Scaling factor in \"Unit\">,<Unit>, Future extensions..\n");
        h.push_str("; Fields are delimited by commas, some fields might be omitted (empty).\n");
        h.push_str("; Commas in channel names are coded as \"\\1\".\n");
        for (i, channel) in self.params.channels.iter().enumerate() {
            let unit = if channel.unit.is_empty() { "µV" } else { channel.unit.as_str() };
            h.push_str(&format!(
                "Ch{}={},{},1.0,{}\n",
                i + 1,
                channel.name.replace(',', "\\1"),
                channel.reference_name.replace(',', "\\1"),
                unit
            ));
        }
        h.push_str("\n[Comment]\n");
        if let Some(impedance) = &self.last_impedance {
            h.push_str(&impedance_section(impedance));
        }
        h
    }

    fn start_recording(&mut self, name: &str) -> StageResult {
        if self.recording.is_some() || self.params.mode == RecordingMode::Impedance {
            debug!("[Storage] Ignoring {} ({:?})", START_SAVING, self.params.mode);
            return Ok(());
        }
        let data_path = self.unique_path(name)?;
        let header_path = data_path.with_extension("vhdr");
        let marker_path = data_path.with_extension("vmrk");

        std::fs::write(&header_path, self.header(&data_path, &marker_path))?;

        let mut markers = BufWriter::new(File::create(&marker_path)?);
        let data_name = data_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        write!(
            markers,
            "Brain Vision Data Exchange Marker File, Version 1.0\n\n\
             [Common Infos]\nCodepage=UTF-8\nDataFile={}\n\n\
             [Marker Infos]\n\
             ; Each entry: Mk<Marker number>=<Type>,<Description>,<Position in data points>,\n\
             ; <Size in data points>, <Channel number (0 = marker is related to all channels)>\n\
             ; Fields are delimited by commas, some fields might be omitted (empty).\n\
             ; Commas in type or description text are coded as \"\\1\".\n",
            data_name
        )?;
        markers.flush()?;
        let data = BufWriter::new(File::create(&data_path)?);

        info!("[Storage] Recording to {}", data_path.display());
        self.events.status("Storage", data_path.display().to_string());
        self.recording = Some(Recording {
            path: data_path,
            data,
            markers,
            marker_count: 0,
            start_sample: None,
            start_time: Local::now(),
            total_missing: 0,
            samples_written: 0,
        });
        Ok(())
    }

    fn close_recording(&mut self) {
        let Some(mut recording) = self.recording.take() else {
            return;
        };
        if let Err(e) = recording.data.flush().and_then(|_| recording.markers.flush()) {
            warn!("[Storage] Failed to close recording files: {}", e);
        }
        self.events.log_message(format!(
            "Recording {} closed ({} samples)",
            recording.path.display(),
            recording.samples_written
        ));
        self.events.status("Storage", "");
    }

    /// Compare the block's counter with the expected continuation
    fn check_gaps(&mut self, block: &StreamBlock) -> Vec<Gap> {
        let mut gaps = Vec::new();
        let mut previous = self.next_counter;
        for &counter in block.counter.iter() {
            if let Some(p) = previous
                && counter > p + 1
            {
                gaps.push(Gap {
                    counter,
                    missing: counter - p - 1,
                });
            }
            previous = Some(counter);
        }
        self.next_counter = previous;

        let missing: u64 = gaps.iter().map(|g| g.missing).sum();
        if missing > 0 {
            let info = format!("{} samples missing", missing);
            match self.monitor.record(missing, Instant::now()) {
                Severity::Ignorable => self.events.log(info),
                severity => self.events.error(info, severity),
            }
        }
        gaps
    }
}

/// Impedance text of one electrode in kΩ
fn impedance_text(ohm: f64) -> String {
    if ohm > IMPEDANCE_INVALID {
        "Disconnected!".to_string()
    } else if ohm == IMPEDANCE_INVALID {
        "Out of Range!".to_string()
    } else {
        format!("{:.0}", ohm / 1000.0)
    }
}

fn impedance_section(block: &StreamBlock) -> String {
    let mut text = format!(
        "\nImpedance [KOhm] at {} (recording started at {})\n",
        block.block_time.format("%H:%M:%S"),
        Local::now().format("%H:%M:%S")
    );
    let mut ground = None;
    for (row, channel) in block.channels.iter().enumerate() {
        if channel.input_group != ChannelGroup::Signal || !(channel.enabled || channel.is_reference) {
            continue;
        }
        let values = block.data.row(row);
        let data = if channel.impedance.data {
            impedance_text(values[IMPEDANCE_DATA])
        } else {
            String::new()
        };
        let reference = if channel.impedance.reference {
            impedance_text(values[IMPEDANCE_REF])
        } else {
            String::new()
        };
        if ground.is_none() && channel.impedance.ground {
            ground = Some(values[IMPEDANCE_GND]);
        }
        let value = match (data.is_empty(), reference.is_empty()) {
            (false, false) => format!("+{} / -{}", data, reference),
            _ => data,
        };
        if !value.is_empty() {
            text.push_str(&format!("{:>3} {}: {}\n", channel.input, channel.name, value));
        }
    }
    if let Some(ground) = ground {
        text.push_str(&format!("GND: {}\n", impedance_text(ground)));
    }
    text
}

fn parse_settings(settings: &Value) -> StageResult<StorageSettings> {
    if settings.is_null() {
        return Ok(StorageSettings::default());
    }
    serde_json::from_value(settings.clone()).map_err(|e| StageError::Config(e.to_string()))
}

impl Module for Storage {
    fn name(&self) -> &str {
        "Storage"
    }

    fn kind(&self) -> &str {
        "storage"
    }

    fn attach(&mut self, ctx: ModuleContext) {
        self.events = ctx.events;
    }

    fn on_start(&mut self) -> StageResult {
        self.next_counter = None;
        self.monitor.reset();
        Ok(())
    }

    fn on_stop(&mut self) -> StageResult {
        self.close_recording();
        Ok(())
    }

    fn on_query(&mut self, command: &str) -> bool {
        !(self.recording.is_some() && matches!(command, "Stop" | "RemoteStop"))
    }

    fn on_update(&mut self, params: StreamBlock) -> StageResult<StreamBlock> {
        self.params = params.clone();
        Ok(params)
    }

    fn on_input(&mut self, mut block: StreamBlock) -> StageResult {
        if block.mode == RecordingMode::Impedance {
            self.last_impedance = Some(block.clone());
            self.pending = Some(block);
            return Ok(());
        }

        let gaps = self.check_gaps(&block);
        if let Some(recording) = self.recording.as_mut() {
            match recording.write_block(&block, &gaps) {
                Ok(markers) => block.markers = markers,
                Err(e) => {
                    let path = recording.path.display().to_string();
                    self.close_recording();
                    return Err(StageError::Io(std::io::Error::new(
                        e.kind(),
                        format!("write to file {} failed: {}", path, e),
                    )));
                }
            }
        }
        self.pending = Some(block);
        Ok(())
    }

    fn on_output(&mut self) -> StageResult<Output> {
        Ok(Output::from_pending(&mut self.pending))
    }

    fn on_event(&mut self, event: &ModuleEvent) -> Option<LifecycleRequest> {
        let EventKind::Command(value) = &event.kind else {
            return None;
        };
        match event.info.as_str() {
            START_SAVING => {
                if let Err(e) = self.start_recording(value) {
                    self.events.error(format!("failed to start recording: {}", e), Severity::Fatal);
                }
            }
            STOP_SAVING => self.close_recording(),
            _ => {}
        }
        None
    }

    fn settings(&self) -> Option<Value> {
        serde_json::to_value(&self.settings).ok()
    }

    fn apply_settings(&mut self, settings: &Value) -> StageResult {
        self.settings = parse_settings(settings)?;
        Ok(())
    }

    fn terminate(&mut self) {
        self.close_recording();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::block::{ChannelDescriptor, SampleMatrix};
    use crate::runtime::testing::block_with_counter;

    fn storage(dir: &Path) -> (Storage, crossbeam_channel::Receiver<ModuleEvent>) {
        let (events, rx) = EventSink::channel("Storage");
        let mut storage = Storage::from_settings(&serde_json::json!({ "directory": dir })).unwrap();
        storage.events = events;
        storage.on_update(block_with_counter(0, 0)).unwrap();
        storage.on_start().unwrap();
        (storage, rx)
    }

    fn with_marker(first: u64, samples: usize, position: i64) -> StreamBlock {
        let mut block = block_with_counter(first, samples);
        block.markers.push(Marker::new(position, "Stimulus", "S  1"));
        block
    }

    fn feed(storage: &mut Storage, block: StreamBlock) -> StreamBlock {
        storage.on_input(block).unwrap();
        match storage.on_output().unwrap() {
            Output::Block(block) => block,
            Output::NoData => panic!("storage passes every block"),
        }
    }

    fn marker_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path.with_extension("vmrk"))
            .unwrap()
            .lines()
            .filter(|l| l.starts_with("Mk"))
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_recording_writes_samples_and_file_relative_markers() {
        let dir = tempfile::tempdir().unwrap();
        let (mut storage, rx) = storage(dir.path());
        storage.on_event(&ModuleEvent::command("Pipeline", START_SAVING, "rec"));
        let path = storage.recording_path().unwrap().to_path_buf();
        assert_eq!(path, dir.path().join("rec.eeg"));

        feed(&mut storage, with_marker(0, 10, 3));
        // two samples lost between the blocks
        let out = feed(&mut storage, with_marker(12, 10, 15));
        assert!(out.markers.iter().any(|m| m.kind == NEW_SEGMENT && m.position == 12));

        storage.on_event(&ModuleEvent::command("Pipeline", STOP_SAVING, ""));
        assert!(!storage.is_recording());

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 20 * 4);
        assert_eq!(f32::from_le_bytes(data[4..8].try_into().unwrap()), 1.0);
        assert_eq!(f32::from_le_bytes(data[40..44].try_into().unwrap()), 12.0);

        let lines = marker_lines(&path);
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("Mk1=New Segment,,1,1,0,"));
        assert_eq!(lines[1], "Mk2=Stimulus,S  1,4,1,0");
        assert!(lines[2].starts_with("Mk3=New Segment,,11,1,0,"));
        assert_eq!(lines[3], "Mk4=Stimulus,S  1,14,1,0");

        let logged: Vec<String> = rx
            .try_iter()
            .filter(|e| e.kind == EventKind::Log)
            .map(|e| e.info)
            .collect();
        assert_eq!(logged, vec!["2 samples missing"]);
    }

    #[test]
    fn test_header_describes_channels() {
        let dir = tempfile::tempdir().unwrap();
        let (mut storage, _rx) = storage(dir.path());
        storage.on_event(&ModuleEvent::command("Pipeline", START_SAVING, "hdr"));
        let header = std::fs::read_to_string(dir.path().join("hdr.vhdr")).unwrap();
        assert!(header.contains("DataFile=hdr.eeg"));
        assert!(header.contains("MarkerFile=hdr.vmrk"));
        assert!(header.contains("NumberOfChannels=1"));
        assert!(header.contains("SamplingInterval=10000"));
        assert!(header.contains("Ch1=Cz,,1.0,µV"));
    }

    #[test]
    fn test_existing_files_get_numbered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rec.eeg"), b"").unwrap();
        std::fs::write(dir.path().join("rec_4.eeg"), b"").unwrap();
        let (mut storage, _rx) = storage(dir.path());
        storage.on_event(&ModuleEvent::command("Pipeline", START_SAVING, "rec"));
        assert_eq!(storage.recording_path().unwrap(), dir.path().join("rec_5.eeg"));
    }

    #[test]
    fn test_stop_is_vetoed_while_recording() {
        let dir = tempfile::tempdir().unwrap();
        let (mut storage, _rx) = storage(dir.path());
        assert!(storage.on_query("Stop"));
        storage.on_event(&ModuleEvent::command("Pipeline", START_SAVING, "veto"));
        assert!(!storage.on_query("Stop"));
        assert!(!storage.on_query("RemoteStop"));
        assert!(storage.on_query("Start"));
        storage.on_stop().unwrap();
        assert!(storage.on_query("RemoteStop"));
    }

    #[test]
    fn test_missing_directory_raises_fatal_event() {
        let dir = tempfile::tempdir().unwrap();
        let (mut storage, rx) = storage(&dir.path().join("missing"));
        storage.on_event(&ModuleEvent::command("Pipeline", START_SAVING, "rec"));
        assert!(!storage.is_recording());
        assert!(rx.try_iter().any(|e| e.severity() == Some(Severity::Fatal)));
    }

    #[test]
    fn test_impedance_values_go_into_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let (mut storage, _rx) = storage(dir.path());

        let mut channels = vec![ChannelDescriptor::signal(1, "Fp1"), ChannelDescriptor::signal(2, "Fp2")];
        for c in channels.iter_mut() {
            c.impedance.data = true;
            c.impedance.ground = true;
        }
        let values = SampleMatrix::from_rows(vec![vec![5_400.0, 0.0, 1_600.0], vec![IMPEDANCE_INVALID, 0.0, 1_600.0]]).unwrap();
        feed(&mut storage, StreamBlock::impedance(channels, values).unwrap());

        storage.on_event(&ModuleEvent::command("Pipeline", START_SAVING, "imp"));
        let header = std::fs::read_to_string(dir.path().join("imp.vhdr")).unwrap();
        assert!(header.contains("  1 Fp1: 5\n"), "{}", header);
        assert!(header.contains("  2 Fp2: Out of Range!\n"));
        assert!(header.contains("GND: 2\n"));
    }

    #[test]
    fn test_recording_is_refused_in_impedance_mode() {
        let dir = tempfile::tempdir().unwrap();
        let (mut storage, _rx) = storage(dir.path());
        let mut params = block_with_counter(0, 0);
        params.mode = RecordingMode::Impedance;
        storage.on_update(params).unwrap();
        storage.on_event(&ModuleEvent::command("Pipeline", START_SAVING, "imp"));
        assert!(!storage.is_recording());
    }
}

//! Trigger and button detection
//!
//! Scans the trigger word of every block and turns debounced value changes
//! into markers. Runs of equal values continue across block boundaries, so a
//! trigger split between two blocks yields exactly one marker at its first
//! sample.

use crate::runtime::block::{Marker, RecordingMode, StreamBlock};
use crate::runtime::errors::{StageError, StageResult};
use crate::runtime::event::EventSink;
use crate::runtime::node::{Module, ModuleContext, Output};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Bit of the push button in the trigger word
pub const BUTTON_MASK: u32 = 0x8000_0000;

/// Command event sent on every debounced button change
pub const BUTTON_COMMAND: &str = "MyButton";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSettings {
    /// Samples a trigger value must persist before it is reported
    pub debounce: usize,
    /// Samples the button state must exceed before a change is accepted
    pub button_debounce: usize,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            debounce: 2,
            button_debounce: 20,
        }
    }
}

/// One group of trigger bits and how its markers are labelled
#[derive(Clone, Copy, Debug)]
struct TriggerGroup {
    mask: u32,
    shift: u32,
    kind: &'static str,
    prefix: &'static str,
}

const GROUPS: [TriggerGroup; 3] = [
    TriggerGroup {
        mask: 0x000F,
        shift: 0,
        kind: "Stimulus",
        prefix: "S",
    },
    TriggerGroup {
        mask: 0x00F0,
        shift: 4,
        kind: "Response",
        prefix: "R",
    },
    TriggerGroup {
        mask: 0xFF00,
        shift: 8,
        kind: "Comment",
        prefix: "TO",
    },
];

/// Run of equal masked values
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Run {
    value: u32,
    count: usize,
    /// Counter of the first sample
    start: u64,
    reported: bool,
}

impl Run {
    /// Extend the run with `value` or start a new one
    fn advance(run: &mut Option<Run>, value: u32, counter: u64) -> &mut Run {
        if !run.is_some_and(|r| r.value == value) {
            *run = None;
        }
        let current = run.get_or_insert(Run {
            value,
            count: 0,
            start: counter,
            reported: false,
        });
        current.count += 1;
        current
    }
}

pub struct TriggerDetector {
    settings: TriggerSettings,
    events: EventSink,
    runs: [Option<Run>; 3],
    button: Option<Run>,
    pressed: bool,
    pending: Option<StreamBlock>,
}

impl TriggerDetector {
    pub fn new(settings: TriggerSettings) -> Self {
        Self {
            settings,
            events: EventSink::default(),
            runs: [None; 3],
            button: None,
            pressed: false,
            pending: None,
        }
    }

    pub fn from_settings(settings: &Value) -> StageResult<Self> {
        Ok(Self::new(parse_settings(settings)?))
    }

    fn reset(&mut self) {
        self.runs = [None; 3];
        self.button = None;
        self.pressed = false;
    }

    fn search_triggers(&mut self, block: &StreamBlock) -> Vec<Marker> {
        let mut markers = Vec::new();
        for (group, run) in GROUPS.iter().zip(self.runs.iter_mut()) {
            for (&word, &counter) in block.trigger.iter().zip(block.counter.iter()) {
                let current = Run::advance(run, word & group.mask, counter);
                if current.value != 0 && !current.reported && current.count >= self.settings.debounce {
                    current.reported = true;
                    let description = format!("{}{:>3}", group.prefix, current.value >> group.shift);
                    markers.push(Marker::new(current.start as i64, group.kind, description));
                }
            }
        }
        markers
    }

    fn search_button(&mut self, block: &StreamBlock) -> Vec<Marker> {
        let mut markers = Vec::new();
        for (&word, &counter) in block.trigger.iter().zip(block.counter.iter()) {
            let current = Run::advance(&mut self.button, word & BUTTON_MASK, counter);
            let state = current.value != 0;
            if current.count > self.settings.button_debounce && state != self.pressed {
                self.pressed = state;
                let start = current.start;
                debug!("[Trigger] Button {}", if state { "pressed" } else { "released" });
                self.events
                    .command(BUTTON_COMMAND, if state { "pressed" } else { "released" });
                let description = if state { "BtnPressed" } else { "BtnReleased" };
                markers.push(Marker::new(start as i64, "Comment", description));
            }
        }
        markers
    }
}

fn parse_settings(settings: &Value) -> StageResult<TriggerSettings> {
    if settings.is_null() {
        return Ok(TriggerSettings::default());
    }
    serde_json::from_value(settings.clone()).map_err(|e| StageError::Config(e.to_string()))
}

impl Module for TriggerDetector {
    fn name(&self) -> &str {
        "Trigger"
    }

    fn kind(&self) -> &str {
        "trigger"
    }

    fn attach(&mut self, ctx: ModuleContext) {
        self.events = ctx.events;
    }

    fn on_start(&mut self) -> StageResult {
        self.reset();
        Ok(())
    }

    fn on_input(&mut self, mut block: StreamBlock) -> StageResult {
        if block.mode != RecordingMode::Impedance {
            let mut markers = self.search_triggers(&block);
            markers.extend(self.search_button(&block));
            block.markers.extend(markers);
        }
        self.pending = Some(block);
        Ok(())
    }

    fn on_output(&mut self) -> StageResult<Output> {
        Ok(Output::from_pending(&mut self.pending))
    }

    fn settings(&self) -> Option<Value> {
        serde_json::to_value(&self.settings).ok()
    }

    fn apply_settings(&mut self, settings: &Value) -> StageResult {
        self.settings = parse_settings(settings)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::event::EventKind;
    use crate::runtime::testing::block_with_counter;

    fn block(first: u64, trigger: Vec<u32>) -> StreamBlock {
        let mut block = block_with_counter(first, trigger.len());
        *block.trigger_mut() = trigger;
        block
    }

    fn markers(detector: &mut TriggerDetector, block: StreamBlock) -> Vec<Marker> {
        detector.on_input(block).unwrap();
        match detector.on_output().unwrap() {
            Output::Block(block) => block.markers,
            Output::NoData => panic!("detector must pass every block"),
        }
    }

    #[test]
    fn test_stimulus_response_and_output_triggers() {
        let mut detector = TriggerDetector::new(TriggerSettings::default());
        let trigger = vec![0, 3, 3, 3, 0, 0x20, 0x20, 0, 0x0500, 0x0500, 0];
        let found = markers(&mut detector, block(100, trigger));

        let summary: Vec<(i64, &str, &str)> = found
            .iter()
            .map(|m| (m.position, m.kind.as_str(), m.description.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (101, "Stimulus", "S  3"),
                (105, "Response", "R  2"),
                (108, "Comment", "TO  5"),
            ]
        );
    }

    #[test]
    fn test_single_sample_glitch_is_debounced() {
        let mut detector = TriggerDetector::new(TriggerSettings::default());
        assert!(markers(&mut detector, block(0, vec![0, 1, 0, 0])).is_empty());
    }

    #[test]
    fn test_trigger_split_across_blocks_is_reported_once() {
        let mut detector = TriggerDetector::new(TriggerSettings::default());
        assert!(markers(&mut detector, block(0, vec![0, 0, 0, 7])).is_empty());
        let found = markers(&mut detector, block(4, vec![7, 7, 0, 0]));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].position, 3);
        assert_eq!(found[0].description, "S  7");
        assert!(markers(&mut detector, block(8, vec![0; 4])).is_empty());
    }

    #[test]
    fn test_button_press_and_release() {
        let (events, rx) = EventSink::channel("Trigger");
        let mut detector = TriggerDetector::new(TriggerSettings::default());
        detector.events = events;

        let mut trigger = vec![0; 5];
        trigger.extend(vec![BUTTON_MASK; 30]);
        trigger.extend(vec![0; 30]);
        let found = markers(&mut detector, block(0, trigger));

        let buttons: Vec<(i64, &str)> = found
            .iter()
            .map(|m| (m.position, m.description.as_str()))
            .collect();
        assert_eq!(buttons, vec![(5, "BtnPressed"), (35, "BtnReleased")]);

        let commands: Vec<String> = rx
            .try_iter()
            .filter_map(|e| match e.kind {
                EventKind::Command(value) if e.info == BUTTON_COMMAND => Some(value),
                _ => None,
            })
            .collect();
        assert_eq!(commands, vec!["pressed", "released"]);
    }

    #[test]
    fn test_short_button_press_is_ignored() {
        let mut detector = TriggerDetector::new(TriggerSettings::default());
        let mut trigger = vec![BUTTON_MASK; 10];
        trigger.extend(vec![0; 40]);
        assert!(markers(&mut detector, block(0, trigger)).is_empty());
    }

    #[test]
    fn test_impedance_blocks_are_skipped() {
        let mut detector = TriggerDetector::new(TriggerSettings::default());
        let mut b = block(0, vec![1, 1, 1]);
        b.mode = RecordingMode::Impedance;
        assert!(markers(&mut detector, b).is_empty());
    }
}

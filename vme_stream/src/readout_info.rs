/*!
Readout layout of every configured module.

Each module's readout program is a list of VME commands. Only commands that
produce data words matter here: single-word reads and markers form fixed-size
segments, a block read forms the single variable-length (dynamic) segment.
The resulting [`ReadoutInfo`] is built and validated once when a run starts
and is immutable afterwards.
*/

use serde::{Deserialize, Serialize};

use crate::error::{ModuleProgramError, ReadoutInfoError};
use crate::protocol::{legacy, listfile};

/// One command of a module readout program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ReadoutCommand {
    /// Single register read, yields one data word
    Read { address: u32 },
    /// Literal word inserted by the controller
    Marker { value: u32 },
    /// Variable length block transfer
    BlockRead {
        address: u32,
        #[serde(default)]
        max_transfers: u16,
    },
    /// Register write, yields no data
    Write { address: u32, value: u32 },
    /// Delay, yields no data
    Wait { nanoseconds: u32 },
}

/// Static configuration of one module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub name: String,
    /// Module type id written into module section headers (6 bit)
    pub type_id: u8,
    #[serde(default)]
    pub readout: Vec<ReadoutCommand>,
}

/// Static configuration of one VME event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventConfig {
    pub name: String,
    /// Stack id used by the legacy controller for this event. Framed-stack
    /// controllers always use `event index + 1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_id: Option<u8>,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

/// Prefix/dynamic/suffix layout of a module's readout data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleReadoutInfo {
    pub prefix_len: u8,
    pub suffix_len: u8,
    pub has_dynamic: bool,
}

impl ModuleReadoutInfo {
    pub fn new(prefix_len: u8, has_dynamic: bool, suffix_len: u8) -> Self {
        Self {
            prefix_len,
            suffix_len,
            has_dynamic,
        }
    }

    /// Derive the layout from a readout command list.
    ///
    /// Single reads and markers count toward the prefix until a block read is
    /// seen and toward the suffix afterwards.
    pub fn from_commands(commands: &[ReadoutCommand]) -> Result<Self, ModuleProgramError> {
        let mut prefix = 0usize;
        let mut suffix = 0usize;
        let mut has_dynamic = false;

        for cmd in commands {
            match cmd {
                ReadoutCommand::Read { .. } | ReadoutCommand::Marker { .. } => {
                    if has_dynamic {
                        suffix += 1;
                    } else {
                        prefix += 1;
                    }
                }
                ReadoutCommand::BlockRead { .. } => {
                    if suffix > 0 {
                        return Err(ModuleProgramError::BlockReadAfterSuffix);
                    }
                    if has_dynamic {
                        return Err(ModuleProgramError::MultipleBlockReads);
                    }
                    has_dynamic = true;
                }
                ReadoutCommand::Write { .. } | ReadoutCommand::Wait { .. } => {}
            }
        }

        let prefix_len = u8::try_from(prefix).map_err(|_| ModuleProgramError::SegmentTooLong {
            segment: "prefix",
            len: prefix,
        })?;
        let suffix_len = u8::try_from(suffix).map_err(|_| ModuleProgramError::SegmentTooLong {
            segment: "suffix",
            len: suffix,
        })?;

        Ok(Self::new(prefix_len, has_dynamic, suffix_len))
    }

    /// A module without any readout words
    pub fn is_empty(&self) -> bool {
        self.prefix_len == 0 && !self.has_dynamic && self.suffix_len == 0
    }
}

/// Layout of one module within an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleLayout {
    pub name: String,
    pub type_id: u8,
    pub readout: ModuleReadoutInfo,
}

/// Readout layout of every event and module of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadoutInfo {
    events: Vec<Vec<ModuleLayout>>,
    legacy_stacks: [Option<usize>; legacy::STACK_ID_MAX as usize + 1],
}

impl ReadoutInfo {
    /// Build and validate the layout of all configured events
    pub fn build(events: &[EventConfig]) -> Result<Self, ReadoutInfoError> {
        if events.len() > listfile::MAX_EVENTS {
            return Err(ReadoutInfoError::TooManyEvents {
                count: events.len(),
                max: listfile::MAX_EVENTS,
            });
        }

        let mut info = Self::default();

        for (ei, event) in events.iter().enumerate() {
            let mut modules = Vec::with_capacity(event.modules.len());

            for (mi, module) in event.modules.iter().enumerate() {
                if module.type_id > listfile::MAX_MODULE_TYPE {
                    return Err(ReadoutInfoError::ModuleTypeOutOfRange {
                        event: ei,
                        module: mi,
                        type_id: module.type_id,
                        max: listfile::MAX_MODULE_TYPE,
                    });
                }

                let readout = ModuleReadoutInfo::from_commands(&module.readout).map_err(|source| {
                    ReadoutInfoError::Module {
                        event: ei,
                        module: mi,
                        source,
                    }
                })?;

                modules.push(ModuleLayout {
                    name: module.name.clone(),
                    type_id: module.type_id,
                    readout,
                });
            }

            if let Some(stack_id) = event.stack_id {
                let slot = info
                    .legacy_stacks
                    .get_mut(stack_id as usize)
                    .ok_or(ReadoutInfoError::StackIdOutOfRange {
                        event: ei,
                        stack_id,
                        max: legacy::STACK_ID_MAX,
                    })?;

                if let Some(first) = *slot {
                    return Err(ReadoutInfoError::DuplicateStackId {
                        stack_id,
                        first,
                        second: ei,
                    });
                }
                *slot = Some(ei);
            }

            info.events.push(modules);
        }

        Ok(info)
    }

    /// Layout from bare module readout infos. Type ids are the module indexes
    /// and legacy stack ids are left unmapped.
    pub fn from_readout(events: Vec<Vec<ModuleReadoutInfo>>) -> Self {
        let events = events
            .into_iter()
            .map(|modules| {
                modules
                    .into_iter()
                    .enumerate()
                    .map(|(mi, readout)| ModuleLayout {
                        name: format!("module{}", mi),
                        type_id: mi as u8 & listfile::MAX_MODULE_TYPE,
                        readout,
                    })
                    .collect()
            })
            .collect();

        Self {
            events,
            legacy_stacks: Default::default(),
        }
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn modules(&self, event_index: usize) -> &[ModuleLayout] {
        self.events.get(event_index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn module(&self, event_index: usize, module_index: usize) -> Option<&ModuleLayout> {
        self.modules(event_index).get(module_index)
    }

    /// Largest module count of any event
    pub fn max_module_count(&self) -> usize {
        self.events.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Prefix/dynamic/suffix layout of every module, per event
    pub fn readout_structure(&self) -> Vec<Vec<ModuleReadoutInfo>> {
        self.events
            .iter()
            .map(|modules| modules.iter().map(|m| m.readout).collect())
            .collect()
    }

    /// Event index mapped to a legacy stack id
    pub fn event_for_stack(&self, stack_id: u8) -> Option<usize> {
        self.legacy_stacks.get(stack_id as usize).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read() -> ReadoutCommand {
        ReadoutCommand::Read { address: 0x6030 }
    }

    fn block() -> ReadoutCommand {
        ReadoutCommand::BlockRead {
            address: 0x0000,
            max_transfers: 65535,
        }
    }

    fn module(name: &str, type_id: u8, readout: Vec<ReadoutCommand>) -> ModuleConfig {
        ModuleConfig {
            name: name.to_string(),
            type_id,
            readout,
        }
    }

    #[test]
    fn test_prefix_dynamic_suffix() {
        let cmds = vec![
            ReadoutCommand::Write { address: 0x6070, value: 1 },
            read(),
            ReadoutCommand::Marker { value: 0xaffe },
            block(),
            ReadoutCommand::Wait { nanoseconds: 100 },
            read(),
        ];

        let info = ModuleReadoutInfo::from_commands(&cmds).unwrap();
        assert_eq!(info, ModuleReadoutInfo::new(2, true, 1));
        assert!(!info.is_empty());
    }

    #[test]
    fn test_reads_only_count_as_prefix() {
        let info = ModuleReadoutInfo::from_commands(&[read(), read(), read()]).unwrap();
        assert_eq!(info, ModuleReadoutInfo::new(3, false, 0));

        let empty = ModuleReadoutInfo::from_commands(&[]).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_multiple_block_reads_rejected() {
        let err = ModuleReadoutInfo::from_commands(&[block(), block()]).unwrap_err();
        assert_eq!(err, ModuleProgramError::MultipleBlockReads);
        assert_eq!(err.to_string(), "multiple block reads in module readout");
    }

    #[test]
    fn test_segment_too_long() {
        let cmds = vec![read(); 256];
        let err = ModuleReadoutInfo::from_commands(&cmds).unwrap_err();
        assert!(matches!(err, ModuleProgramError::SegmentTooLong { segment: "prefix", len: 256 }));
    }

    #[test]
    fn test_build_reports_module_position() {
        let events = vec![EventConfig {
            name: "trigger0".to_string(),
            stack_id: None,
            modules: vec![
                module("mdpp16", 10, vec![block()]),
                module("broken", 11, vec![block(), read(), block()]),
            ],
        }];

        let err = ReadoutInfo::build(&events).unwrap_err();
        assert_eq!(
            err,
            ReadoutInfoError::Module {
                event: 0,
                module: 1,
                source: ModuleProgramError::BlockReadAfterSuffix,
            }
        );
    }

    #[test]
    fn test_build_validates_ranges() {
        let bad_type = vec![EventConfig {
            name: "e".to_string(),
            stack_id: None,
            modules: vec![module("m", 64, vec![read()])],
        }];
        assert!(matches!(
            ReadoutInfo::build(&bad_type),
            Err(ReadoutInfoError::ModuleTypeOutOfRange { type_id: 64, .. })
        ));

        let too_many: Vec<EventConfig> = (0..17)
            .map(|i| EventConfig {
                name: format!("e{}", i),
                stack_id: None,
                modules: Vec::new(),
            })
            .collect();
        assert!(matches!(
            ReadoutInfo::build(&too_many),
            Err(ReadoutInfoError::TooManyEvents { count: 17, .. })
        ));
    }

    #[test]
    fn test_legacy_stack_map() {
        let events = vec![
            EventConfig {
                name: "trigger".to_string(),
                stack_id: Some(2),
                modules: vec![module("adc", 5, vec![block()])],
            },
            EventConfig {
                name: "scaler".to_string(),
                stack_id: Some(1),
                modules: vec![module("counter", 6, vec![read(), read()])],
            },
        ];

        let info = ReadoutInfo::build(&events).unwrap();
        assert_eq!(info.event_count(), 2);
        assert_eq!(info.event_for_stack(2), Some(0));
        assert_eq!(info.event_for_stack(1), Some(1));
        assert_eq!(info.event_for_stack(0), None);
        assert_eq!(info.module(1, 0).unwrap().type_id, 6);
        assert_eq!(info.readout_structure()[1][0], ModuleReadoutInfo::new(2, false, 0));

        let mut duplicate = events.clone();
        duplicate[1].stack_id = Some(2);
        assert!(matches!(
            ReadoutInfo::build(&duplicate),
            Err(ReadoutInfoError::DuplicateStackId { stack_id: 2, first: 0, second: 1 })
        ));

        let mut out_of_range = events;
        out_of_range[0].stack_id = Some(8);
        assert!(matches!(
            ReadoutInfo::build(&out_of_range),
            Err(ReadoutInfoError::StackIdOutOfRange { stack_id: 8, .. })
        ));
    }
}

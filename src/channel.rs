use std::collections::{BTreeMap, HashMap};
use std::fmt;

use tracing::debug;

use crate::config::ConfigurationError;

pub type ChannelName = String;

/// Logical name given to physical channels that have no entry in the name map
pub const UNKNOWN_CHANNEL: &str = "Unknown";
/// Analog output driving the high-voltage amplifier input
pub const VOLTAGE_CONTROL: &str = "voltage-control";
/// Analog output wired to the camera's hardware trigger input
pub const CAMERA_TRIGGER: &str = "camera-trigger";
/// Analog input carrying the amplifier's voltage monitor
pub const VOLTAGE_READ: &str = "voltage-read";
/// Any analog input whose logical name contains this marker is a current monitor
pub const CURRENT_MARKER: &str = "current";

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum ChannelType {
    Input,
    Output,
}

impl ChannelType {
    /// Label prefix used in physical channel names and CSV headers
    pub fn prefix(self) -> &'static str {
        match self {
            ChannelType::Input => "AI",
            ChannelType::Output => "AO",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// One configured physical channel and the logical signal it carries
#[derive(Debug, Clone, PartialEq)]
pub struct MappedChannel {
    pub index: u32,
    pub name: ChannelName,
}

/// Bidirectional association between physical channel indices and logical signal names for
/// one kind of channel.
///
/// Channels are kept in ascending physical index order, which is also the order of the values
/// handed to and returned by the hardware, and the column order of the data log.
#[derive(Debug, Clone)]
pub struct ChannelMap {
    kind: ChannelType,
    channels: Vec<MappedChannel>,
    by_name: HashMap<ChannelName, u32>,
}

impl ChannelMap {
    /// Build the map for the requested physical indices.
    ///
    /// `names` may be partial or empty: requested indices without a name become
    /// [`UNKNOWN_CHANNEL`], names bound to indices that were not requested are ignored.
    pub fn build(
        kind: ChannelType,
        requested: &[u32],
        names: &HashMap<ChannelName, u32>,
    ) -> Result<Self, ConfigurationError> {
        // Invert the user supplied name map once, rejecting two names on one index
        let mut by_index: BTreeMap<u32, &str> = BTreeMap::new();
        for (name, index) in names {
            if let Some(other) = by_index.insert(*index, name.as_str()) {
                let (first, second) = if other < name.as_str() {
                    (other, name.as_str())
                } else {
                    (name.as_str(), other)
                };
                return Err(ConfigurationError::DuplicateLogicalIndex {
                    kind,
                    index: *index,
                    first: first.to_owned(),
                    second: second.to_owned(),
                });
            }
        }

        let mut sorted = requested.to_vec();
        sorted.sort_unstable();
        if let Some(pair) = sorted.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ConfigurationError::DuplicateChannel {
                kind,
                index: pair[0],
            });
        }

        let channels: Vec<MappedChannel> = sorted
            .iter()
            .map(|&index| MappedChannel {
                index,
                name: by_index
                    .get(&index)
                    .copied()
                    .unwrap_or(UNKNOWN_CHANNEL)
                    .to_owned(),
            })
            .collect();

        let by_name = channels
            .iter()
            .filter(|c| c.name != UNKNOWN_CHANNEL)
            .map(|c| (c.name.clone(), c.index))
            .collect::<HashMap<_, _>>();

        for (name, index) in names {
            if !by_name.contains_key(name) {
                debug!("{kind} name map entry {name:?} -> {index} is not a requested channel, ignoring");
            }
        }

        Ok(Self {
            kind,
            channels,
            by_name,
        })
    }

    /// Parse a comma separated list of physical channel indices, e.g. `"0, 1,3"`.
    /// An empty (or blank) list is valid and yields no channels.
    pub fn parse_indices(kind: ChannelType, list: &str) -> Result<Vec<u32>, ConfigurationError> {
        list.split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| {
                token
                    .parse::<u32>()
                    .map_err(|_| ConfigurationError::MalformedChannelList {
                        kind,
                        token: token.to_owned(),
                        list: list.to_owned(),
                    })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channels(&self) -> &[MappedChannel] {
        &self.channels
    }

    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.channels.iter().map(|c| c.index)
    }

    /// Logical name of a physical index, [`UNKNOWN_CHANNEL`] if it is not configured or unmapped
    pub fn name_of(&self, index: u32) -> &str {
        self.channels
            .binary_search_by_key(&index, |c| c.index)
            .map_or(UNKNOWN_CHANNEL, |pos| self.channels[pos].name.as_str())
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    /// Position of the first channel (ascending index) whose name satisfies `pred`
    pub fn position_where(&self, pred: impl Fn(&str) -> bool) -> Option<usize> {
        self.channels.iter().position(|c| pred(&c.name))
    }

    /// CSV header labels, `"{name} ({AI|AO}{index})"`
    pub fn header_labels(&self) -> Vec<String> {
        self.channels
            .iter()
            .map(|c| format!("{} ({}{})", c.name, self.kind, c.index))
            .collect()
    }
}

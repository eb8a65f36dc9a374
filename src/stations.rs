use crate::prelude::*;

use serde::Serialize;

const COMMENT: char = '#';

/// A remotely polled charge controller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Station {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub enabled: bool,
}

impl Station {
    pub fn new(name: &str, host: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            enabled: true,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

impl std::fmt::Display for Station {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.host, self.port)
    }
}

/// Result of one pass over a station list.
#[derive(Debug, Default)]
pub struct StationList {
    pub stations: Vec<Station>,
    /// The entry that ended the read early, if any.
    pub error: Option<ConfigError>,
}

impl StationList {
    pub fn enabled(&self) -> impl Iterator<Item = &Station> {
        self.stations.iter().filter(|s| s.enabled())
    }
}

/// Parses `name,host,port` lines.
///
/// A line starting with `#` is a disabled station: it is kept with `enabled = false`
/// and a notice is logged. The first line with fewer than three fields (a blank line
/// included) or an unusable port ends the read; stations before it are still returned.
pub fn parse(content: &str) -> StationList {
    let mut list = StationList::default();

    for (i, line) in content.lines().enumerate() {
        let number = i + 1;
        let line = line.trim_end();
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();

        if let Some(rest) = line.strip_prefix(COMMENT) {
            let name = rest.split(',').next().unwrap_or_default().trim();
            info!("Skipping: {}", name);
            if let [_, host, port, ..] = fields.as_slice() {
                if let Ok(port) = port.parse() {
                    list.stations.push(Station {
                        name: name.to_string(),
                        host: host.to_string(),
                        port,
                        enabled: false,
                    });
                }
            }
            continue;
        }

        let [name, host, port, ..] = fields.as_slice() else {
            list.error = Some(ConfigError::MissingField {
                line: number,
                content: line.to_string(),
            });
            break;
        };

        match port.parse::<u16>() {
            Ok(port) if port > 0 && !name.is_empty() && !host.is_empty() => {
                list.stations.push(Station::new(name, host, port));
            }
            Ok(_) if name.is_empty() || host.is_empty() => {
                list.error = Some(ConfigError::MissingField {
                    line: number,
                    content: line.to_string(),
                });
                break;
            }
            _ => {
                list.error = Some(ConfigError::InvalidPort {
                    line: number,
                    value: port.to_string(),
                });
                break;
            }
        }
    }

    if let Some(e) = &list.error {
        warn!("station list read ended early: {}", e);
    }

    list
}

/// Reads and parses the station list file.
pub fn load(path: &str) -> Result<StationList, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;

    let list = parse(&content);
    debug!(
        "{}: {} stations, {} enabled",
        path,
        list.stations.len(),
        list.enabled().count()
    );
    Ok(list)
}

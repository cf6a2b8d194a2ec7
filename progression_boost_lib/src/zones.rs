use std::{fs, path::Path, sync::Arc};

use eyre::{Context, Result};
use tracing::warn;

use crate::{
    config::{DEFAULT_ZONE, Profiles, ZoneConfig},
    error::BoostError,
};

/// One `start end key` triple as written by the user. `end == -1` means the end of the clip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneEntry {
    pub start: u32,
    pub end: i64,
    pub key: String,
}

/// A resolved zone: `[start, end)` with the profile it runs under.
#[derive(Debug, Clone)]
pub struct ZoneSpan {
    pub start: u32,
    pub end: u32,
    pub key: String,
    pub config: Arc<ZoneConfig>,
}

impl ZoneSpan {
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Contiguous, non-overlapping zones covering `[0, total)`.
#[derive(Debug, Clone)]
pub struct ZoneMap {
    pub spans: Vec<ZoneSpan>,
    pub total: u32,
}

pub fn read_zones_file(path: &Path) -> Result<Vec<ZoneEntry>> {
    let text = fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read zones file {}", path.display()))?;
    Ok(parse_zones(&text)?)
}

/// Parses whitespace separated `start end key` triples. Entries come back stably sorted by start.
pub fn parse_zones(text: &str) -> Result<Vec<ZoneEntry>, BoostError> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() % 3 != 0 {
        return Err(BoostError::config(format!(
            "zones must be `start end key` triples, found {} tokens",
            tokens.len()
        )));
    }

    let mut entries = tokens
        .chunks_exact(3)
        .map(|triple| {
            let start = triple[0].parse::<u32>().map_err(|_| {
                BoostError::config(format!("invalid zone start \"{}\"", triple[0]))
            })?;
            let end = triple[1]
                .parse::<i64>()
                .map_err(|_| BoostError::config(format!("invalid zone end \"{}\"", triple[1])))?;
            if end <= -2 {
                return Err(BoostError::config(format!(
                    "zone end {end} is invalid, use -1 for the end of the clip"
                )));
            }
            Ok(ZoneEntry {
                start,
                end,
                key: triple[2].to_owned(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    entries.sort_by_key(|entry| entry.start);
    Ok(entries)
}

impl ZoneMap {
    pub fn whole(total: u32, profiles: &Profiles) -> Self {
        ZoneMap {
            spans: vec![ZoneSpan {
                start: 0,
                end: total,
                key: DEFAULT_ZONE.to_owned(),
                config: profiles.default_profile().clone(),
            }],
            total,
        }
    }

    /// Clamps entries to the clip, rejects overlaps and unknown keys, and fills gaps with `default`.
    pub fn resolve(entries: &[ZoneEntry], total: u32, profiles: &Profiles) -> Result<Self, BoostError> {
        let default = profiles.default_profile();
        let mut spans: Vec<ZoneSpan> = Vec::with_capacity(entries.len() * 2 + 1);
        let mut cursor = 0;

        for entry in entries {
            if entry.start >= total {
                warn!(
                    "Zone \"{}\" starts at frame {} past the end of the clip ({} frames), skipping",
                    entry.key, entry.start, total
                );
                continue;
            }

            let end = match entry.end {
                -1 => total,
                end if end > i64::from(total) => {
                    warn!(
                        "Zone \"{}\" ends at frame {} past the end of the clip, clamping to {}",
                        entry.key, end, total
                    );
                    total
                }
                end => end as u32,
            };

            if end <= entry.start {
                return Err(BoostError::config(format!(
                    "zone \"{}\" [{}, {}) ends before it starts",
                    entry.key, entry.start, entry.end
                )));
            }
            if entry.start < cursor {
                return Err(BoostError::config(format!(
                    "zone \"{}\" starting at frame {} overlaps the previous zone ending at {}",
                    entry.key, entry.start, cursor
                )));
            }
            let config = profiles.get(&entry.key).ok_or_else(|| {
                BoostError::config(format!(
                    "zone key \"{}\" has no profile, known keys: {}",
                    entry.key,
                    profiles.keys().collect::<Vec<_>>().join(", ")
                ))
            })?;

            if entry.start > cursor {
                spans.push(ZoneSpan {
                    start: cursor,
                    end: entry.start,
                    key: DEFAULT_ZONE.to_owned(),
                    config: default.clone(),
                });
            }
            spans.push(ZoneSpan {
                start: entry.start,
                end,
                key: entry.key.clone(),
                config: config.clone(),
            });
            cursor = end;
        }

        if cursor < total || spans.is_empty() {
            spans.push(ZoneSpan {
                start: cursor,
                end: total,
                key: DEFAULT_ZONE.to_owned(),
                config: default.clone(),
            });
        }

        Ok(ZoneMap { spans, total })
    }

    pub fn zone_at(&self, frame: u32) -> Option<&ZoneSpan> {
        let index = self.spans.partition_point(|span| span.end <= frame);
        self.spans.get(index).filter(|span| span.start <= frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiles() -> Profiles {
        Profiles::from_toml_str("[zones.credits]\nmetric_enable = false\n").unwrap()
    }

    #[test]
    fn parse_sorts_by_start_and_keeps_open_end() {
        let entries = parse_zones("500 -1 credits\n0 100 default").unwrap();
        assert_eq!(entries[0].start, 0);
        assert_eq!(entries[1].end, -1);
        assert_eq!(entries[1].key, "credits");
    }

    #[test]
    fn parse_rejects_incomplete_triples_and_bad_ends() {
        assert!(parse_zones("0 100").is_err());
        assert!(parse_zones("0 -2 credits").is_err());
        assert!(parse_zones("x 10 credits").is_err());
    }

    #[test]
    fn gaps_are_filled_with_default() {
        let entries = parse_zones("100 200 credits").unwrap();
        let map = ZoneMap::resolve(&entries, 300, &profiles()).unwrap();
        let layout: Vec<_> = map
            .spans
            .iter()
            .map(|s| (s.start, s.end, s.key.as_str()))
            .collect();
        assert_eq!(
            layout,
            vec![(0, 100, "default"), (100, 200, "credits"), (200, 300, "default")]
        );
        assert!(!map.spans[1].config.metric_enable);
        assert_eq!(map.zone_at(150).unwrap().key, "credits");
        assert_eq!(map.zone_at(200).unwrap().key, "default");
        assert!(map.zone_at(300).is_none());
    }

    #[test]
    fn ends_are_clamped_and_late_zones_skipped() {
        let entries = parse_zones("200 999 credits 400 -1 credits").unwrap();
        let map = ZoneMap::resolve(&entries, 300, &profiles()).unwrap();
        assert_eq!(map.spans.len(), 2);
        assert_eq!(map.spans[1].end, 300);
    }

    #[test]
    fn overlaps_and_unknown_keys_are_config_errors() {
        let overlap = parse_zones("0 100 credits 50 150 credits").unwrap();
        let err = ZoneMap::resolve(&overlap, 300, &profiles()).unwrap_err();
        assert_eq!(err.exit_code(), 2);

        let unknown = parse_zones("0 100 opening").unwrap();
        assert!(ZoneMap::resolve(&unknown, 300, &profiles()).is_err());

        let inverted = parse_zones("100 100 credits").unwrap();
        assert!(ZoneMap::resolve(&inverted, 300, &profiles()).is_err());
    }
}

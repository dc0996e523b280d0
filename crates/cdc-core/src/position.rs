//! Durable checkpoint: load, persist, and atomically advance the last
//! acknowledged source cursor (spec.md §4.1).

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CdcError;
use crate::msg::{Cursor, SourceKind};

/// On-disk shape of the position file: a small TOML key-value document.
/// Relational sources populate `binlog-*`; document sources populate
/// `resume-token`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PositionFile {
    #[serde(rename = "binlog-name", default)]
    binlog_name: String,
    #[serde(rename = "binlog-pos", default)]
    binlog_pos: u64,
    #[serde(rename = "binlog-gtid", default)]
    binlog_gtid: String,
    #[serde(rename = "resume-token", default)]
    resume_token: String,
}

/// Durable, atomically-updated checkpoint. Exclusively mutated by the
/// Batcher; readable by the Source Driver at startup via `current`.
pub struct PositionStore {
    path: PathBuf,
    current: Cursor,
    epoch: u64,
}

impl PositionStore {
    /// Loads the position file next to the config file, creating it with
    /// empty initial contents if absent. `bootstrap` is called only when
    /// the file did not previously exist, to obtain the upstream's current
    /// cursor (e.g. `GetMasterGTIDSet` for MySQL, "now" for Mongo); its
    /// result is persisted immediately.
    pub fn load(
        path: PathBuf,
        source_kind: SourceKind,
        bootstrap: impl FnOnce() -> Result<Cursor, CdcError>,
    ) -> Result<Self, CdcError> {
        if !path.exists() {
            write_atomic(&path, &PositionFile::default())
                .map_err(|e| CdcError::Config(format!("creating {}: {e}", path.display())))?;
        }

        let contents = std::fs::read_to_string(&path)
            .map_err(|e| CdcError::Config(format!("reading {}: {e}", path.display())))?;
        let file: PositionFile = toml::from_str(&contents)
            .map_err(|e| CdcError::Config(format!("parsing {}: {e}", path.display())))?;

        let existing = match source_kind {
            SourceKind::Binlog if !file.binlog_gtid.is_empty() => Some(Cursor::Binlog {
                gtid_set: file.binlog_gtid.clone(),
                epoch: 0,
            }),
            SourceKind::Stream if !file.resume_token.is_empty() => Some(Cursor::Stream {
                resume_token: file.resume_token.clone().into_bytes(),
                epoch: 0,
            }),
            _ => None,
        };

        let current = match existing {
            Some(cursor) => cursor,
            None => {
                let cursor = bootstrap()?;
                let mut store = Self {
                    path: path.clone(),
                    current: cursor.clone(),
                    epoch: cursor.epoch(),
                };
                store.save(cursor)?;
                return Ok(store);
            }
        };

        Ok(Self {
            path,
            epoch: current.epoch(),
            current,
        })
    }

    /// Atomically replaces the on-disk record: write to a temp sibling
    /// file, fsync, rename. Failure is fatal to the caller (the Batcher
    /// halts the pipeline without advancing its in-memory ack cursor).
    pub fn save(&mut self, cursor: Cursor) -> Result<(), CdcError> {
        let file = match &cursor {
            Cursor::Binlog { gtid_set, .. } => PositionFile {
                binlog_gtid: gtid_set.clone(),
                ..Default::default()
            },
            Cursor::Stream { resume_token, .. } => PositionFile {
                resume_token: String::from_utf8_lossy(resume_token).into_owned(),
                ..Default::default()
            },
        };
        write_atomic(&self.path, &file).map_err(|e| CdcError::PositionSave {
            cursor: cursor.clone(),
            source: e.into(),
        })?;
        self.epoch = self.epoch.max(cursor.epoch()) + 1;
        self.current = bump_epoch(cursor, self.epoch);
        Ok(())
    }

    /// Last saved cursor, kept in memory; used by the Source Driver to
    /// resume a dropped connection.
    pub fn current(&self) -> &Cursor {
        &self.current
    }
}

fn bump_epoch(cursor: Cursor, epoch: u64) -> Cursor {
    match cursor {
        Cursor::Binlog { gtid_set, .. } => Cursor::Binlog { gtid_set, epoch },
        Cursor::Stream { resume_token, .. } => Cursor::Stream {
            resume_token,
            epoch,
        },
    }
}

fn write_atomic(path: &Path, file: &PositionFile) -> std::io::Result<()> {
    let contents = toml::to_string_pretty(file).expect("position file always serializes");
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("cdc-core-position-{tag}-{}.info", std::process::id()))
    }

    #[test]
    fn creates_empty_binlog_file_on_first_load() {
        let path = temp_path("first-load");
        let _ = std::fs::remove_file(&path);

        let store = PositionStore::load(path.clone(), SourceKind::Binlog, || {
            Ok(Cursor::Binlog {
                gtid_set: "uuid:1".into(),
                epoch: 0,
            })
        })
        .unwrap();

        assert_eq!(
            store.current(),
            &Cursor::Binlog {
                gtid_set: "uuid:1".into(),
                epoch: 1,
            }
        );
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("uuid:1"));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn load_never_returns_a_partially_written_value() {
        let path = temp_path("round-trip");
        let _ = std::fs::remove_file(&path);

        let mut store = PositionStore::load(path.clone(), SourceKind::Binlog, || {
            Ok(Cursor::Binlog {
                gtid_set: "".into(),
                epoch: 0,
            })
        })
        .unwrap();

        store
            .save(Cursor::Binlog {
                gtid_set: "uuid:1-5".into(),
                epoch: 7,
            })
            .unwrap();

        let reloaded = PositionStore::load(path.clone(), SourceKind::Binlog, || {
            panic!("bootstrap should not run when the file already has a cursor")
        })
        .unwrap();

        assert_eq!(
            reloaded.current(),
            &Cursor::Binlog {
                gtid_set: "uuid:1-5".into(),
                epoch: 0,
            }
        );

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn stream_source_round_trips_resume_token() {
        let path = temp_path("stream");
        let _ = std::fs::remove_file(&path);

        let mut store = PositionStore::load(path.clone(), SourceKind::Stream, || {
            Ok(Cursor::Stream {
                resume_token: b"tok0".to_vec(),
                epoch: 0,
            })
        })
        .unwrap();

        store
            .save(Cursor::Stream {
                resume_token: b"tok1".to_vec(),
                epoch: 1,
            })
            .unwrap();

        let reloaded = PositionStore::load(path.clone(), SourceKind::Stream, || {
            panic!("should not bootstrap")
        })
        .unwrap();
        assert_eq!(
            reloaded.current(),
            &Cursor::Stream {
                resume_token: b"tok1".to_vec(),
                epoch: 0,
            }
        );

        std::fs::remove_file(&path).ok();
    }
}

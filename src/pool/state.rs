//! Validator-daemon state persistence: a deduplication table written as
//! `state_<height>.bin`, replaced atomically via temp-then-rename so a
//! crash never leaves a torn file.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

pub const STATE_FILE_VERSION: u32 = 0;
const HEADER_SZ: usize = 8;

/// A state file: header plus the 32-byte hashes seen at this height.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateFile {
    pub version: u32,
    pub currently_mining_block: u32,
    pub entries: Vec<[u8; 32]>,
}

impl StateFile {
    pub fn new(height: u32) -> Self {
        StateFile { version: STATE_FILE_VERSION, currently_mining_block: height, entries: Vec::new() }
    }

    pub fn path_for(dir: &Path, height: u32) -> PathBuf {
        dir.join(format!("state_{height}.bin"))
    }

    /// Record a hash at `height`. Advancing the height clears the table.
    /// Returns true when the hash was already present (a duplicate).
    pub fn observe(&mut self, height: u32, hash: &[u8; 32]) -> bool {
        if height > self.currently_mining_block {
            self.entries.clear();
            self.currently_mining_block = height;
        }
        if self.entries.iter().any(|e| e == hash) {
            return true;
        }
        self.entries.push(*hash);
        false
    }

    pub fn save(&self, dir: &Path) -> io::Result<()> {
        let path = Self::path_for(dir, self.currently_mining_block);
        let tmp = path.with_extension("bin.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&self.version.to_le_bytes())?;
            file.write_all(&self.currently_mining_block.to_le_bytes())?;
            for e in &self.entries {
                file.write_all(e)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)
    }

    pub fn load(path: &Path) -> io::Result<StateFile> {
        let mut bytes = Vec::new();
        fs::File::open(path)?.read_to_end(&mut bytes)?;
        if bytes.len() < HEADER_SZ || (bytes.len() - HEADER_SZ) % 32 != 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated state file"));
        }
        Ok(StateFile {
            version: u32::from_le_bytes(bytes[..4].try_into().unwrap()),
            currently_mining_block: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            entries: bytes[HEADER_SZ..].chunks_exact(32).map(|c| c.try_into().unwrap()).collect(),
        })
    }

    /// Delete every `state_*.bin` under `dir`; used when a daemon restarts
    /// from scratch.
    pub fn clear_dir(dir: &Path) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with("state_") {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_dedupes_within_height() {
        let mut st = StateFile::new(5);
        assert!(!st.observe(5, &[1u8; 32]));
        assert!(st.observe(5, &[1u8; 32]));
        assert!(!st.observe(5, &[2u8; 32]));
        // height advance clears
        assert!(!st.observe(6, &[1u8; 32]));
        assert_eq!(st.entries.len(), 1);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut st = StateFile::new(42);
        st.observe(42, &[7u8; 32]);
        st.observe(42, &[8u8; 32]);
        st.save(dir.path()).expect("save");

        let path = StateFile::path_for(dir.path(), 42);
        let loaded = StateFile::load(&path).expect("load");
        assert_eq!(loaded, st);
        // no temp file left behind
        assert_eq!(fs::read_dir(dir.path()).expect("dir").count(), 1);
    }

    #[test]
    fn test_load_rejects_torn_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state_1.bin");
        fs::write(&path, [0u8; 27]).expect("write");
        assert!(StateFile::load(&path).is_err());
    }

    #[test]
    fn test_clear_dir_removes_only_state_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("state_1.bin"), b"x").expect("write");
        fs::write(dir.path().join("keep.bin"), b"y").expect("write");
        StateFile::clear_dir(dir.path()).expect("clear");
        assert!(!StateFile::path_for(dir.path(), 1).exists());
        assert!(dir.path().join("keep.bin").exists());
    }
}

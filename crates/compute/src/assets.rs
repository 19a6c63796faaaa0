//! Named, read-only byte resources.
//!
//! An [`AssetSource`] opens a resource by name and hands back an [`Asset`]:
//! a reader that also knows the length it claims to have. Closing is
//! dropping.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

pub trait Asset: Read {
    /// Length in bytes as declared by the provider.
    fn length(&self) -> u64;
}

pub trait AssetSource {
    /// Opens `name`, or returns `None` if no such resource exists.
    fn open(&self, name: &str) -> Option<Box<dyn Asset + '_>>;
}

/// Assets stored as files under a root directory.
#[derive(Debug, Clone)]
pub struct DirAssets {
    root: PathBuf,
}

impl DirAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

struct FileAsset {
    file: File,
    len: u64,
}

impl Read for FileAsset {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Asset for FileAsset {
    fn length(&self) -> u64 {
        self.len
    }
}

impl AssetSource for DirAssets {
    fn open(&self, name: &str) -> Option<Box<dyn Asset + '_>> {
        let path = self.root.join(name);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                tracing::debug!("cannot open asset {}: {e}", path.display());
                return None;
            }
        };
        let len = file.metadata().ok()?.len();
        Some(Box::new(FileAsset { file, len }))
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    bytes: Vec<u8>,
    declared_len: u64,
}

/// In-memory assets, used by tests and embedders that bundle their data.
#[derive(Debug, Clone, Default)]
pub struct MemoryAssets {
    entries: HashMap<String, MemoryEntry>,
}

impl MemoryAssets {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> &mut Self {
        let bytes = bytes.into();
        let declared_len = bytes.len() as u64;
        self.entries.insert(name.into(), MemoryEntry { bytes, declared_len });
        self
    }

    /// Stores native-endian `f32` words.
    pub fn insert_f32(&mut self, name: impl Into<String>, values: &[f32]) -> &mut Self {
        self.insert(name, bytemuck::cast_slice::<f32, u8>(values).to_vec())
    }

    /// Registers an asset that claims `declared_len` bytes but yields fewer.
    pub fn insert_truncated(
        &mut self,
        name: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
        declared_len: u64,
    ) -> &mut Self {
        self.entries.insert(
            name.into(),
            MemoryEntry {
                bytes: bytes.into(),
                declared_len,
            },
        );
        self
    }
}

struct MemoryAsset<'a> {
    remaining: &'a [u8],
    declared_len: u64,
}

impl Read for MemoryAsset<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.remaining.read(buf)
    }
}

impl Asset for MemoryAsset<'_> {
    fn length(&self) -> u64 {
        self.declared_len
    }
}

impl AssetSource for MemoryAssets {
    fn open(&self, name: &str) -> Option<Box<dyn Asset + '_>> {
        self.entries.get(name).map(|entry| {
            Box::new(MemoryAsset {
                remaining: &entry.bytes,
                declared_len: entry.declared_len,
            }) as Box<dyn Asset + '_>
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_asset_reports_declared_length() {
        let mut assets = MemoryAssets::new();
        assets.insert_truncated("short.bin", vec![1u8, 2, 3], 8);
        let mut asset = assets.open("short.bin").expect("asset exists");
        assert_eq!(asset.length(), 8);
        let mut out = Vec::new();
        asset.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn missing_asset_is_none() {
        assert!(MemoryAssets::new().open("nope.bin").is_none());
        assert!(DirAssets::new("/definitely/not/here").open("img_y.bin").is_none());
    }

    #[test]
    fn dir_assets_read_files() {
        let dir = std::env::temp_dir().join(format!("ssbo-assets-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("four.bin"), [0u8, 0, 128, 63]).unwrap();

        let assets = DirAssets::new(&dir);
        let mut asset = assets.open("four.bin").expect("file asset");
        assert_eq!(asset.length(), 4);
        let mut out = Vec::new();
        asset.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![0, 0, 128, 63]);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}

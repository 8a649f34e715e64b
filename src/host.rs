//! The file-system seam.
//!
//! Everything that touches a file goes through [`Host`]: `.include`
//! and `.incbin` reads, module and ROM loads, and output writes.  The
//! binaries use [`DiskHost`]; tests and embedders use [`MemHost`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

pub trait Host {
    fn read_string(&self, path: &str) -> io::Result<String>;
    fn read_bytes(&self, path: &str) -> io::Result<Vec<u8>>;
    fn write_string(&self, path: &str, text: &str) -> io::Result<()>;
    fn write_bytes(&self, path: &str, data: &[u8]) -> io::Result<()>;
}

/// Joins a search directory and a file name the way the include-path
/// scan wants it: an empty directory means the name as written.
pub fn join(dir: &str, file: &str) -> String {
    if dir.is_empty() {
        return file.to_string();
    }
    Path::new(dir).join(file).to_string_lossy().into_owned()
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DiskHost;

impl Host for DiskHost {
    fn read_string(&self, path: &str) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn read_bytes(&self, path: &str) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write_string(&self, path: &str, text: &str) -> io::Result<()> {
        fs::write(path, text)
    }

    fn write_bytes(&self, path: &str, data: &[u8]) -> io::Result<()> {
        fs::write(path, data)
    }
}

/// An in-memory file system.  Reads see the seeded files plus anything
/// written earlier; writes are retrievable afterwards for inspection.
#[derive(Debug, Default)]
pub struct MemHost {
    files: RefCell<HashMap<String, Vec<u8>>>,
}

impl MemHost {
    pub fn new() -> MemHost {
        MemHost::default()
    }

    pub fn file(&self, name: &str, text: &str) -> &Self {
        self.files
            .borrow_mut()
            .insert(name.to_string(), text.as_bytes().to_vec());
        self
    }

    pub fn bytes(&self, name: &str, data: &[u8]) -> &Self {
        self.files
            .borrow_mut()
            .insert(name.to_string(), data.to_vec());
        self
    }

    pub fn output(&self, name: &str) -> Option<Vec<u8>> {
        self.files.borrow().get(name).cloned()
    }

    pub fn output_string(&self, name: &str) -> Option<String> {
        self.output(name)
            .map(|data| String::from_utf8_lossy(&data).into_owned())
    }
}

impl Host for MemHost {
    fn read_string(&self, path: &str) -> io::Result<String> {
        let data = self.read_bytes(path)?;
        String::from_utf8(data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn read_bytes(&self, path: &str) -> io::Result<Vec<u8>> {
        self.files
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }

    fn write_string(&self, path: &str, text: &str) -> io::Result<()> {
        self.write_bytes(path, text.as_bytes())
    }

    fn write_bytes(&self, path: &str, data: &[u8]) -> io::Result<()> {
        self.files
            .borrow_mut()
            .insert(path.to_string(), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_host_round_trips() {
        let host = MemHost::new();
        host.file("a.s", "lda #3");
        assert_eq!(host.read_string("a.s").unwrap(), "lda #3");
        assert!(host.read_bytes("missing.s").is_err());
        host.write_bytes("out.bin", &[1, 2, 3]).unwrap();
        assert_eq!(host.output("out.bin").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn join_skips_empty_dirs() {
        assert_eq!(join("", "foo.s"), "foo.s");
        assert_eq!(join("lib", "foo.s"), format!("lib{}foo.s", std::path::MAIN_SEPARATOR));
    }
}

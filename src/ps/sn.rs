//! Sequence-number persistence: the last applied consensus log entry
//! for a partition, stored as a plain-text integer in a file named
//! `sn` inside that partition's data directory. Deliberately not a
//! binary or length-prefixed format — it's meant to be readable with
//! `cat` during an incident.

use std::fs;
use std::path::{Path, PathBuf};

use meridian_util::error::{Error, ErrorKind, Result};

pub struct SnFile {
	path: PathBuf,
}

impl SnFile {
	pub fn new(partition_dir: impl AsRef<Path>) -> Self {
		SnFile { path: partition_dir.as_ref().join("sn") }
	}

	/// Returns `0` when the file doesn't exist yet — a freshly created
	/// partition has applied nothing.
	pub fn read(&self) -> Result<u64> {
		match fs::read_to_string(&self.path) {
			Ok(contents) => contents
				.trim()
				.parse()
				.map_err(|_| Error::new(ErrorKind::InternalError, format!("corrupt sn file at {}", self.path.display()))),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
			Err(e) => Err(Error::from(e)),
		}
	}

	/// Overwrites the file with `sn`, fsyncing before returning so a
	/// crash immediately after never observes a torn write.
	pub fn write(&self, sn: u64) -> Result<()> {
		if let Some(parent) = self.path.parent() {
			fs::create_dir_all(parent)?;
		}
		let tmp = self.path.with_extension("tmp");
		let file = fs::File::create(&tmp)?;
		use std::io::Write;
		{
			let mut w = std::io::BufWriter::new(&file);
			write!(w, "{}", sn)?;
		}
		file.sync_all()?;
		fs::rename(&tmp, &self.path)?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_file_reads_as_zero() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let sn = SnFile::new(dir.to_path_buf());
		assert_eq!(sn.read().unwrap(), 0);
	}

	#[test]
	fn write_then_read_round_trips() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let sn = SnFile::new(dir.to_path_buf());
		sn.write(42).unwrap();
		assert_eq!(sn.read().unwrap(), 42);
		sn.write(43).unwrap();
		assert_eq!(sn.read().unwrap(), 43);
	}

	#[test]
	fn corrupt_file_is_reported_not_panicked() {
		let dir = mktemp::Temp::new_dir().unwrap();
		std::fs::write(dir.to_path_buf().join("sn"), b"not-a-number").unwrap();
		let sn = SnFile::new(dir.to_path_buf());
		assert!(sn.read().is_err());
	}
}

use crate::error::{RecoveryError, Result};
use crate::types::{MultiRevolutionSet, Revolution, TrackId};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// Zero-copy memory-mapped raw flux capture
///
/// The file is a sequence of little-endian `u32` flux intervals in
/// nanoseconds. A zero word ends a revolution.
#[derive(Clone)]
pub struct CaptureFile {
    mmap: Arc<Mmap>,
    path: String,
}

impl CaptureFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let path_str = path_ref
            .to_str()
            .ok_or_else(|| RecoveryError::InvalidInput("Invalid path encoding".to_string()))?
            .to_string();

        let file = File::open(path_ref)?;
        let len = file.metadata()?.len();
        if len % 4 != 0 {
            return Err(RecoveryError::Parse(format!(
                "{}: length {} is not a whole number of u32 intervals",
                path_str, len
            )));
        }

        // Safety: the mapping is read-only and never outlives the Arc
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| RecoveryError::Mmap(format!("Failed to mmap {}: {}", path_str, e)))?
        };

        Ok(Self {
            mmap: Arc::new(mmap),
            path: path_str,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn len_words(&self) -> usize {
        self.mmap.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    fn words(&self) -> impl Iterator<Item = u32> + '_ {
        self.mmap
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
    }

    /// Interval lists, one per revolution; empty revolutions are skipped
    pub fn revolutions(&self) -> Vec<Vec<u32>> {
        split_revolutions(self.words())
    }

    /// Build the revolution set for one track from this capture
    pub fn to_set(&self, track: TrackId) -> Result<MultiRevolutionSet> {
        let captures = self.revolutions();
        if captures.is_empty() {
            return Err(RecoveryError::InvalidInput(format!(
                "{}: capture holds no flux intervals",
                self.path
            )));
        }
        MultiRevolutionSet::from_intervals(track, &captures)
    }

    /// Revolutions from several capture files, renumbered in file order
    pub fn load_all<P: AsRef<Path>>(paths: &[P], track: TrackId) -> Result<MultiRevolutionSet> {
        let mut revolutions = Vec::new();
        for path in paths {
            let capture = Self::open(path)?;
            for intervals in capture.revolutions() {
                revolutions.push(Revolution::from_intervals(revolutions.len() as u16, &intervals)?);
            }
        }
        MultiRevolutionSet::new(track, revolutions)
    }
}

fn split_revolutions(words: impl Iterator<Item = u32>) -> Vec<Vec<u32>> {
    let mut revolutions = Vec::new();
    let mut current = Vec::new();
    for word in words {
        if word == 0 {
            if !current.is_empty() {
                revolutions.push(std::mem::take(&mut current));
            }
        } else {
            current.push(word);
        }
    }
    if !current.is_empty() {
        revolutions.push(current);
    }
    revolutions
}

/// Serialise revolutions in the capture layout
pub fn encode_capture(revolutions: &[Vec<u32>]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, revolution) in revolutions.iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(&0u32.to_le_bytes());
        }
        for &interval in revolution {
            out.extend_from_slice(&interval.to_le_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_capture(name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("flux-capture-{}-{}.bin", name, std::process::id()));
        let mut file = File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn test_split_on_zero_words() {
        let revolutions = split_revolutions([0, 4000, 6000, 0, 0, 8000, 0].into_iter());
        assert_eq!(revolutions, vec![vec![4000, 6000], vec![8000]]);
    }

    #[test]
    fn test_open_and_build_set() {
        let revolutions = vec![vec![4000u32; 64], vec![4000u32; 64]];
        let path = temp_capture("set", &encode_capture(&revolutions));

        let capture = CaptureFile::open(&path).unwrap();
        assert_eq!(capture.len_words(), 129);
        assert_eq!(capture.revolutions(), revolutions);
        let set = capture.to_set(TrackId::new(3, 1)).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.track(), TrackId::new(3, 1));

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_truncated_word_is_parse_error() {
        let path = temp_capture("truncated", &[1, 2, 3, 4, 5]);
        assert!(matches!(CaptureFile::open(&path), Err(RecoveryError::Parse(_))));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_load_all_renumbers() {
        let a = temp_capture("a", &encode_capture(&[vec![4000u32; 32]]));
        let b = temp_capture("b", &encode_capture(&[vec![6000u32; 32]]));
        let set = CaptureFile::load_all(&[&a, &b], TrackId::new(0, 0)).unwrap();
        let indices: Vec<u16> = set.revolutions().iter().map(|r| r.index()).collect();
        assert_eq!(indices, vec![0, 1]);
        std::fs::remove_file(a).unwrap();
        std::fs::remove_file(b).unwrap();
    }
}

//! On-disk naming for cached chunk files.
//!
//! Each cached range lives in its own file named
//! `{pak}_{start}_{len}.chunk` inside the cache directory. Pak identifiers
//! are already restricted to a filesystem-safe charset, so the name maps
//! back to its `(package, range)` key without an index lookup — a cold
//! start rebuilds the whole cache index from a directory scan.

use std::path::{Path, PathBuf};

use crate::manifest::PakId;
use crate::range::ChunkRange;

/// Extension used by chunk files.
pub const CHUNK_FILE_EXT: &str = "chunk";

/// File name for the cached range of a package.
pub fn chunk_file_name(pak: &PakId, range: &ChunkRange) -> String {
    format!("{}_{}_{}.{}", pak, range.start, range.len(), CHUNK_FILE_EXT)
}

/// Full path of the cached range inside `dir`.
pub fn chunk_file_path(dir: &Path, pak: &PakId, range: &ChunkRange) -> PathBuf {
    dir.join(chunk_file_name(pak, range))
}

/// Recovers the `(package, range)` key from a chunk file name.
///
/// Pak names may themselves contain underscores, so the numeric fields are
/// taken from the right. Returns `None` for anything that is not a
/// well-formed chunk file name.
pub fn parse_chunk_file_name(file_name: &str) -> Option<(PakId, ChunkRange)> {
    let stem = file_name.strip_suffix(&format!(".{CHUNK_FILE_EXT}"))?;
    let mut fields = stem.rsplitn(3, '_');
    let len: u64 = fields.next()?.parse().ok()?;
    let start: u64 = fields.next()?.parse().ok()?;
    let pak = PakId::new(fields.next()?).ok()?;
    if len == 0 {
        return None;
    }
    Some((pak, ChunkRange::at(start, len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_file_name_round_trip() {
        let pak = PakId::new("island_textures").unwrap();
        let range = ChunkRange::new(4096, 12288);

        let name = chunk_file_name(&pak, &range);
        assert_eq!(name, "island_textures_4096_8192.chunk");

        let (parsed_pak, parsed_range) = parse_chunk_file_name(&name).unwrap();
        assert_eq!(parsed_pak, pak);
        assert_eq!(parsed_range, range);
    }

    #[test]
    fn test_parse_handles_underscored_pak_names() {
        // Trailing numeric fields bind from the right; the rest is the name.
        let (pak, range) = parse_chunk_file_name("pak_01_base_100_50.chunk").unwrap();
        assert_eq!(pak.as_str(), "pak_01_base");
        assert_eq!(range, ChunkRange::at(100, 50));
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        for name in [
            "residency.json",
            "island.chunk",
            "island_10.chunk",
            "island_a_b.chunk",
            "island_10_0.chunk",
            "island_10_20.tmp",
            "_10_20.chunk",
        ] {
            assert!(parse_chunk_file_name(name).is_none(), "{name} should not parse");
        }
    }

    #[test]
    fn test_chunk_file_path_stays_in_dir() {
        let pak = PakId::new("core").unwrap();
        let range = ChunkRange::new(0, 10);
        let path = chunk_file_path(Path::new("/var/cache/pakstream"), &pak, &range);
        assert_eq!(path, Path::new("/var/cache/pakstream/core_0_10.chunk"));
    }
}

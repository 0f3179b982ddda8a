//! Big-file manifest (`_big_info:<key>`) rendering and parsing
//!
//! The manifest is plain text in the mogtool layout:
//!
//! ```text
//! des no description
//! type file
//! compressed 0
//! filename movie.mkv
//! chunks 2
//! size 100
//!
//! part 1 bytes=64 md5=<hex32> paths: http://a/1.fid, http://b/1.fid
//! part 2 bytes=36 md5=<hex32> paths: http://a/2.fid, http://c/2.fid
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use md5::{Digest, Md5};

use crate::MogileError;

/// Tracker key holding the manifest of `key`.
pub fn info_key(key: &str) -> String {
    format!("_big_info:{key}")
}

/// Tracker key of the in-progress marker of `key`.
pub fn pre_key(key: &str) -> String {
    format!("_big_pre:{key}")
}

/// Tracker key of chunk `index` (1-based) of `key`.
pub fn chunk_key(key: &str, index: u32) -> String {
    format!("{key},{index}")
}

const PREAMBLE_KEYS: [&str; 6] = ["des", "type", "compressed", "filename", "chunks", "size"];

/// MD5 digest of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkChecksum([u8; 16]);

impl ChunkChecksum {
    pub fn new(digest: [u8; 16]) -> Self {
        Self(digest)
    }

    /// Hashes `data`.
    pub fn compute(data: &[u8]) -> Self {
        let mut digest = [0u8; 16];
        digest.copy_from_slice(&Md5::digest(data));
        Self(digest)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ChunkChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ChunkChecksum {
    type Err = MogileError;

    /// Parses 32 hex digits, either case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut digest = [0u8; 16];
        if s.len() != 32 {
            return Err(MogileError::protocol(format!(
                "md5 '{s}' is not 32 hex digits"
            )));
        }
        hex::decode_to_slice(s, &mut digest)
            .map_err(|_| MogileError::protocol(format!("md5 '{s}' is not hexadecimal")))?;
        Ok(Self(digest))
    }
}

/// Location and checksum of one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// 1-based position in the reassembled file
    pub index: u32,
    pub byte_length: u64,
    pub checksum: ChunkChecksum,
    /// Replica URLs recorded once the chunk had replicated
    pub paths: Vec<String>,
}

/// Parsed `_big_info` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigFileManifest {
    pub description: String,
    pub file_type: String,
    pub compressed: bool,
    /// Original file name, without directories
    pub filename: String,
    pub total_size: u64,
    /// Chunks in ascending index order, indices `1..=len`
    pub chunks: Vec<ChunkDescriptor>,
}

impl BigFileManifest {
    pub const DEFAULT_DESCRIPTION: &'static str = "no description";
    pub const FILE_TYPE: &'static str = "file";

    /// Creates an uncompressed file manifest.
    pub fn new(filename: impl Into<String>, total_size: u64, chunks: Vec<ChunkDescriptor>) -> Self {
        Self {
            description: Self::DEFAULT_DESCRIPTION.to_string(),
            file_type: Self::FILE_TYPE.to_string(),
            compressed: false,
            filename: filename.into(),
            total_size,
            chunks,
        }
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Renders the manifest text, trailing newline included.
    pub fn render(&self) -> String {
        let mut text = format!(
            "des {}\ntype {}\ncompressed {}\nfilename {}\nchunks {}\nsize {}\n\n",
            self.description,
            self.file_type,
            u8::from(self.compressed),
            self.filename,
            self.chunk_count(),
            self.total_size,
        );
        for chunk in &self.chunks {
            text.push_str(&format!(
                "part {} bytes={} md5={} paths: {}\n",
                chunk.index,
                chunk.byte_length,
                chunk.checksum,
                chunk.paths.join(", ")
            ));
        }
        text
    }

    /// Parses and validates manifest text.
    ///
    /// # Errors
    ///
    /// - `MogileError::Protocol` - If the preamble is incomplete, a part line
    ///   is malformed, chunks are missing or duplicated, or the part sizes do
    ///   not add up to the declared size
    pub fn parse(text: &str) -> Result<Self, MogileError> {
        let mut lines = text.lines();

        let mut preamble = BTreeMap::new();
        for _ in 0..PREAMBLE_KEYS.len() {
            let line = lines
                .next()
                .ok_or_else(|| MogileError::protocol("manifest preamble is truncated"))?;
            let (name, value) = line.split_once(' ').unwrap_or((line, ""));
            if !PREAMBLE_KEYS.contains(&name) {
                return Err(MogileError::protocol(format!(
                    "unexpected manifest line '{line}'"
                )));
            }
            if preamble.insert(name, value).is_some() {
                return Err(MogileError::protocol(format!(
                    "duplicate manifest field '{name}'"
                )));
            }
        }
        match lines.next() {
            Some("") => {}
            _ => {
                return Err(MogileError::protocol(
                    "manifest preamble is not followed by a blank line",
                ));
            }
        }

        // Six distinct names out of six allowed means all are present
        let field = |name: &str| preamble.get(name).copied().unwrap_or_default();
        let chunk_count: u32 = parse_number("chunks", field("chunks"))?;
        let total_size: u64 = parse_number("size", field("size"))?;
        let compressed = match field("compressed") {
            "0" => false,
            "1" => true,
            other => {
                return Err(MogileError::protocol(format!(
                    "invalid compressed flag '{other}'"
                )));
            }
        };

        let mut parts = BTreeMap::new();
        for line in lines.filter(|line| !line.is_empty()) {
            let chunk = parse_part(line)?;
            if chunk.index == 0 || chunk.index > chunk_count {
                return Err(MogileError::protocol(format!(
                    "part {} outside 1..={chunk_count}",
                    chunk.index
                )));
            }
            if parts.insert(chunk.index, chunk).is_some() {
                return Err(MogileError::protocol("duplicate part in manifest"));
            }
        }

        if let Some(missing) = (1..=chunk_count).find(|index| !parts.contains_key(index)) {
            return Err(MogileError::protocol(format!(
                "manifest is missing part {missing} of {chunk_count}"
            )));
        }

        let chunks: Vec<ChunkDescriptor> = parts.into_values().collect();
        let sum = chunks
            .iter()
            .try_fold(0u64, |sum, chunk| sum.checked_add(chunk.byte_length))
            .ok_or_else(|| MogileError::protocol("part sizes overflow"))?;
        if sum != total_size {
            return Err(MogileError::protocol(format!(
                "parts add up to {sum} bytes, manifest declares {total_size}"
            )));
        }

        Ok(Self {
            description: field("des").to_string(),
            file_type: field("type").to_string(),
            compressed,
            filename: field("filename").to_string(),
            total_size,
            chunks,
        })
    }
}

fn parse_number<T: FromStr>(name: &str, raw: &str) -> Result<T, MogileError> {
    raw.parse()
        .map_err(|_| MogileError::protocol(format!("manifest field '{name}' is not a number: '{raw}'")))
}

/// Parses `part <i> bytes=<n> md5=<hex> paths: <p1>, <p2>`.
fn parse_part(line: &str) -> Result<ChunkDescriptor, MogileError> {
    let malformed = || MogileError::protocol(format!("malformed part line '{line}'"));

    let rest = line.strip_prefix("part ").ok_or_else(malformed)?;
    let mut fields = rest.splitn(4, ' ');
    let index = fields.next().ok_or_else(malformed)?;
    let bytes = fields
        .next()
        .and_then(|field| field.strip_prefix("bytes="))
        .ok_or_else(malformed)?;
    let md5 = fields
        .next()
        .and_then(|field| field.strip_prefix("md5="))
        .ok_or_else(malformed)?;
    let paths = fields
        .next()
        .and_then(|field| field.strip_prefix("paths:"))
        .ok_or_else(malformed)?;

    let paths: Vec<String> = paths
        .split(',')
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(str::to_string)
        .collect();
    if paths.is_empty() {
        return Err(MogileError::protocol(format!("part without paths: '{line}'")));
    }

    Ok(ChunkDescriptor {
        index: index.parse().map_err(|_| malformed())?,
        byte_length: bytes.parse().map_err(|_| malformed())?,
        checksum: md5.parse()?,
        paths,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn descriptor(index: u32, byte_length: u64, paths: &[&str]) -> ChunkDescriptor {
        ChunkDescriptor {
            index,
            byte_length,
            checksum: ChunkChecksum::compute(format!("chunk {index}").as_bytes()),
            paths: paths.iter().map(|path| path.to_string()).collect(),
        }
    }

    fn sample_manifest() -> BigFileManifest {
        BigFileManifest::new(
            "movie.mkv",
            100,
            vec![
                descriptor(1, 64, &["http://a/1.fid", "http://b/1.fid"]),
                descriptor(2, 36, &["http://c/2.fid"]),
            ],
        )
    }

    #[test]
    fn test_checksum_hex() {
        let checksum = ChunkChecksum::compute(b"");
        assert_eq!(checksum.to_string(), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            "D41D8CD98F00B204E9800998ECF8427E".parse::<ChunkChecksum>().unwrap(),
            checksum
        );
        assert!("d41d8cd9".parse::<ChunkChecksum>().is_err());
        assert!("zz1d8cd98f00b204e9800998ecf8427e".parse::<ChunkChecksum>().is_err());
    }

    #[test]
    fn test_render_layout() {
        let text = sample_manifest().render();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "des no description");
        assert_eq!(lines[1], "type file");
        assert_eq!(lines[2], "compressed 0");
        assert_eq!(lines[3], "filename movie.mkv");
        assert_eq!(lines[4], "chunks 2");
        assert_eq!(lines[5], "size 100");
        assert_eq!(lines[6], "");
        assert!(lines[7].starts_with("part 1 bytes=64 md5="));
        assert!(lines[7].ends_with(" paths: http://a/1.fid, http://b/1.fid"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_parse_rendered_manifest() {
        let manifest = sample_manifest();
        assert_eq!(BigFileManifest::parse(&manifest.render()).unwrap(), manifest);
    }

    #[test]
    fn test_parse_accepts_parts_out_of_order() {
        let manifest = sample_manifest();
        let text = manifest.render();
        let (head, parts) = text.split_once("\n\n").unwrap();
        let reordered: Vec<&str> = parts.lines().rev().collect();
        let text = format!("{head}\n\n{}\n", reordered.join("\n"));

        assert_eq!(BigFileManifest::parse(&text).unwrap(), manifest);
    }

    #[test]
    fn test_parse_rejects_gap() {
        let mut manifest = sample_manifest();
        manifest.chunks.push(descriptor(3, 10, &["http://d/3.fid"]));
        manifest.total_size = 110;
        let text = manifest.render().replace("part 2 ", "part 9 ");

        let result = BigFileManifest::parse(&text);
        assert!(matches!(result, Err(MogileError::Protocol { .. })));

        // Index inside the range but one chunk dropped entirely
        let mut text = String::new();
        for line in manifest.render().lines().filter(|line| !line.starts_with("part 2 ")) {
            text.push_str(line);
            text.push('\n');
        }
        let result = BigFileManifest::parse(&text);
        assert!(matches!(
            result,
            Err(MogileError::Protocol { message }) if message.contains("missing part 2")
        ));
    }

    #[test]
    fn test_parse_rejects_duplicate_part() {
        let text = sample_manifest().render().replace("part 2 ", "part 1 ");
        assert!(BigFileManifest::parse(&text).is_err());
    }

    #[test]
    fn test_parse_rejects_size_mismatch() {
        let text = sample_manifest().render().replace("size 100", "size 101");
        let result = BigFileManifest::parse(&text);
        assert!(matches!(
            result,
            Err(MogileError::Protocol { message }) if message.contains("add up to 100")
        ));
    }

    #[test]
    fn test_parse_rejects_overflowing_part_sizes() {
        let huge = u64::MAX;
        let text = BigFileManifest::new(
            "huge.bin",
            huge,
            vec![
                descriptor(1, huge, &["http://a/1.fid"]),
                descriptor(2, huge, &["http://b/2.fid"]),
            ],
        )
        .render();
        assert!(text.contains("part 2 bytes=18446744073709551615 md5="));

        let result = BigFileManifest::parse(&text);

        assert!(matches!(
            result,
            Err(MogileError::Protocol { message }) if message.contains("overflow")
        ));
    }

    #[test]
    fn test_parse_rejects_incomplete_preamble() {
        let text = sample_manifest().render().replace("compressed 0\n", "");
        assert!(BigFileManifest::parse(&text).is_err());
        assert!(BigFileManifest::parse("des x\ntype file\n").is_err());
        assert!(BigFileManifest::parse("").is_err());
    }

    #[test]
    fn test_parse_rejects_part_without_paths() {
        let text = sample_manifest()
            .render()
            .replace(" paths: http://c/2.fid", " paths: ");
        assert!(BigFileManifest::parse(&text).is_err());
    }

    #[test]
    fn test_filename_with_spaces() {
        let mut manifest = sample_manifest();
        manifest.filename = "holiday video.mp4".to_string();
        let parsed = BigFileManifest::parse(&manifest.render()).unwrap();
        assert_eq!(parsed.filename, "holiday video.mp4");
    }

    #[test]
    fn test_large_file_layout() {
        let total: u64 = 150 * MIB;
        let chunk: u64 = 64 * MIB;
        let chunks: Vec<ChunkDescriptor> = (1..=total.div_ceil(chunk) as u32)
            .map(|index| {
                let start = u64::from(index - 1) * chunk;
                descriptor(index, chunk.min(total - start), &["http://a/x.fid"])
            })
            .collect();
        let manifest = BigFileManifest::new("big.iso", total, chunks);

        let text = manifest.render();
        assert!(text.contains("chunks 3\n"));
        assert!(text.contains("size 157286400\n"));
        assert!(text.contains("part 3 bytes=23068672 "));
        assert_eq!(BigFileManifest::parse(&text).unwrap().chunk_count(), 3);
    }

    #[test]
    fn test_key_names() {
        assert_eq!(info_key("movie"), "_big_info:movie");
        assert_eq!(pre_key("movie"), "_big_pre:movie");
        assert_eq!(chunk_key("movie", 3), "movie,3");
    }
}
